//! In-tab job execution.
//!
//! Every job runs as JavaScript evaluated inside the worker's tab, so fetches
//! carry the tab's cookies and challenge clearance. The scripts always return
//! a JSON string envelope (`{ok, value}` or `{ok, error}`) that is decoded here;
//! the remote object returned by CDP never carries structured values.

use anyhow::Result;
use headless_chrome::browser::tab::Tab;
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tab_relay_common::{
    ErrorKind, FetchTask, JobFailure, JobId, JobPayload, ScriptTask, WorkerCommand, WorkerEvent,
    WorkerEventSender, WorkerId, STREAM_DONE_MARKER,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::sensor;

/// Script sub-type that returns the page HTML instead of evaluating a script
pub const LOAD_HTML: &str = "LOAD_HTML";

/// HTTP statuses treated as the challenge firewall blocking the tab
const FIREWALL_STATUSES: [u16; 3] = [403, 429, 503];

const STREAM_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Calculate SHA256 hash of content for compact logging
fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub fn is_firewall_status(status: u16) -> bool {
    FIREWALL_STATUSES.contains(&status)
}

/// Timing knobs of one job run
#[derive(Debug, Clone, Copy)]
pub struct JobTiming {
    /// How often readiness is re-checked
    pub poll_interval: Duration,
    /// How long the tab may stay loading or challenged before the job fails
    pub preparation_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

/// Decode the `{ok, value | error}` string every job script returns
pub fn parse_envelope(raw: Option<&Value>) -> Result<Value, JobFailure> {
    let Some(text) = raw.and_then(|v| v.as_str()) else {
        return Err(JobFailure::new(
            ErrorKind::ExecutionError,
            "Script returned no value",
        ));
    };
    let envelope: Envelope = serde_json::from_str(text).map_err(|e| {
        JobFailure::new(
            ErrorKind::ExecutionError,
            format!("Malformed script result: {}", e),
        )
    })?;
    if envelope.ok {
        Ok(envelope.value)
    } else {
        Err(JobFailure::new(
            ErrorKind::ExecutionError,
            envelope
                .error
                .unwrap_or_else(|| "Unknown script error".to_string()),
        ))
    }
}

/// Shared `fetch` options: the tab's credentials plus an optional body for
/// the methods that carry one
fn request_options_js(task: &FetchTask) -> String {
    let method = serde_json::to_string(&task.method.to_uppercase()).unwrap_or_default();
    let body = match &task.body {
        Some(body) => serde_json::to_string(body).unwrap_or_else(|_| "null".to_string()),
        None => "null".to_string(),
    };
    format!(
        r#"const options = {{ method: {method}, credentials: 'include', headers: {{ 'Content-Type': 'application/json' }} }};
        const body = {body};
        if (body !== null && ['POST', 'PUT', 'PATCH'].includes(options.method)) {{
            options.body = typeof body === 'string' ? body : JSON.stringify(body);
        }}"#
    )
}

/// One-shot fetch returning status, headers and body (plus `json` when the
/// body parses)
pub fn fetch_expression(task: &FetchTask) -> String {
    let url = serde_json::to_string(&task.fetch_url).unwrap_or_default();
    format!(
        r#"(async () => {{
    try {{
        {options}
        const response = await fetch({url}, options);
        const data = {{
            status: response.status,
            statusText: response.statusText,
            headers: Object.fromEntries(response.headers.entries())
        }};
        try {{
            data.body = await response.text();
            try {{ data.json = JSON.parse(data.body); }} catch (e) {{}}
        }} catch (e) {{
            data.error = e.message;
        }}
        return JSON.stringify({{ ok: true, value: data }});
    }} catch (e) {{
        return JSON.stringify({{ ok: false, error: String((e && e.message) || e) }});
    }}
}})()"#,
        options = request_options_js(task),
    )
}

fn stream_key(task_id: &str) -> String {
    serde_json::to_string(&format!("__tabRelayStream_{}", task_id)).unwrap_or_default()
}

/// Start a streamed fetch. Resolves with the response status once headers
/// arrive; body lines accumulate in a window buffer drained by
/// [`stream_drain_expression`].
pub fn stream_start_expression(task_id: &str, task: &FetchTask) -> String {
    let url = serde_json::to_string(&task.fetch_url).unwrap_or_default();
    format!(
        r#"(async () => {{
    try {{
        {options}
        const response = await fetch({url}, options);
        const buffer = {{ lines: [], done: false, error: null, reader: null }};
        window[{key}] = buffer;
        if (!response.body) {{
            buffer.done = true;
            return JSON.stringify({{ ok: true, value: {{ status: response.status }} }});
        }}
        const reader = response.body.getReader();
        buffer.reader = reader;
        const decoder = new TextDecoder();
        (async () => {{
            try {{
                while (true) {{
                    const {{ done, value }} = await reader.read();
                    if (done) break;
                    for (const line of decoder.decode(value, {{ stream: true }}).split('\n')) {{
                        if (line.trim()) buffer.lines.push(line);
                    }}
                }}
            }} catch (e) {{
                buffer.error = String((e && e.message) || e);
            }}
            buffer.done = true;
        }})();
        return JSON.stringify({{ ok: true, value: {{ status: response.status }} }});
    }} catch (e) {{
        return JSON.stringify({{ ok: false, error: String((e && e.message) || e) }});
    }}
}})()"#,
        options = request_options_js(task),
        key = stream_key(task_id),
    )
}

/// Take the buffered lines; the buffer is dropped once the body ended
pub fn stream_drain_expression(task_id: &str) -> String {
    format!(
        r#"(() => {{
    const buffer = window[{key}];
    if (!buffer) {{
        return JSON.stringify({{ ok: false, error: 'Stream buffer missing' }});
    }}
    const lines = buffer.lines.splice(0);
    const done = buffer.done;
    if (done) delete window[{key}];
    return JSON.stringify({{ ok: true, value: {{ lines, done, error: buffer.error }} }});
}})()"#,
        key = stream_key(task_id),
    )
}

fn stream_cancel_expression(task_id: &str) -> String {
    format!(
        r#"(() => {{
    const buffer = window[{key}];
    if (buffer) {{
        if (buffer.reader) buffer.reader.cancel();
        delete window[{key}];
    }}
    return true;
}})()"#,
        key = stream_key(task_id),
    )
}

/// Evaluate a script job; a thrown error becomes an execution error
pub fn script_expression(task: &ScriptTask) -> String {
    if task.script_type == LOAD_HTML {
        return "JSON.stringify({ ok: true, value: { html: document.documentElement.outerHTML } })"
            .to_string();
    }
    let script = serde_json::to_string(&task.script).unwrap_or_default();
    format!(
        r#"(() => {{
    try {{
        const result = eval({script});
        return JSON.stringify({{ ok: true, value: result === undefined ? null : result }});
    }} catch (e) {{
        return JSON.stringify({{ ok: false, error: `Script execution error: ${{(e && e.message) || e}}` }});
    }}
}})()"#
    )
}

#[derive(Debug, Deserialize)]
struct StreamStart {
    status: u16,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDrain {
    #[serde(default)]
    lines: Vec<String>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Turn the value of a one-shot fetch into the `task-response` payload
pub fn classify_fetch(value: Value) -> Result<Value, JobFailure> {
    let status = value
        .get("status")
        .and_then(Value::as_u64)
        .and_then(|s| u16::try_from(s).ok())
        .unwrap_or(0);
    if is_firewall_status(status) {
        return Err(firewall_failure(status));
    }
    Ok(json!({ "type": "object", "data": value }))
}

fn firewall_failure(status: u16) -> JobFailure {
    debug!("Fetch answered with firewall status {}", status);
    JobFailure::new(ErrorKind::CloudflareFirewall, "Cloudflare firewall triggered")
}

/// Runs one delivered command inside a tab and reports the outcome as
/// `TaskResponse` / `TaskError` worker events
pub struct JobRunner {
    worker_id: WorkerId,
    tab: Arc<Tab>,
    timing: JobTiming,
    events: WorkerEventSender,
    cancel: CancellationToken,
}

impl JobRunner {
    pub fn new(
        worker_id: WorkerId,
        tab: Arc<Tab>,
        timing: JobTiming,
        events: WorkerEventSender,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            tab,
            timing,
            events,
            cancel,
        }
    }

    pub fn spawn(self, command: WorkerCommand) {
        tokio::spawn(async move { self.run(command).await });
    }

    async fn run(self, command: WorkerCommand) {
        let task_id = command.task_id.clone();
        let started = Instant::now();
        info!(
            worker_id = %self.worker_id,
            task_id = %task_id,
            "Executing {:?} for {}",
            command.command,
            command.task.page_url()
        );

        let result = tokio::select! {
            _ = self.cancel.cancelled() => {
                debug!(task_id = %task_id, "Job abandoned on shutdown");
                return;
            }
            result = self.execute(&task_id, command.task) => result,
        };

        match result {
            Ok(()) => info!(
                task_id = %task_id,
                "Job finished in {}ms",
                started.elapsed().as_millis()
            ),
            Err(failure) => {
                warn!(task_id = %task_id, "Job failed: {}", failure);
                self.send(WorkerEvent::TaskError {
                    task_id,
                    worker_id: Some(self.worker_id.clone()),
                    error_type: failure.kind.as_str().to_string(),
                    error: failure.message,
                });
            }
        }
    }

    async fn execute(&self, task_id: &JobId, task: JobPayload) -> Result<(), JobFailure> {
        self.wait_until_ready().await?;
        match task {
            JobPayload::Fetch(fetch) if fetch.stream => self.stream_fetch(task_id, &fetch).await,
            JobPayload::Fetch(fetch) => {
                let value = self.evaluate(fetch_expression(&fetch), true).await?;
                let response = classify_fetch(value)?;
                self.respond(task_id, response);
                Ok(())
            }
            JobPayload::Script(script) => {
                let value = self.evaluate(script_expression(&script), false).await?;
                self.respond(task_id, json!({ "type": "object", "data": value }));
                Ok(())
            }
        }
    }

    /// Wait for the tab to be loaded and challenge-free
    async fn wait_until_ready(&self) -> Result<(), JobFailure> {
        let deadline = Instant::now() + self.timing.preparation_timeout;
        loop {
            let tab = self.tab.clone();
            match tokio::task::spawn_blocking(move || sensor::read(&tab)).await {
                Ok(Ok(reading)) if !reading.signal().is_active() => return Ok(()),
                Ok(Ok(reading)) => debug!(
                    worker_id = %self.worker_id,
                    "Waiting for page: {}",
                    reading.signal().active_indicators().join(", ")
                ),
                Ok(Err(e)) => debug!(worker_id = %self.worker_id, "Readiness probe failed: {}", e),
                Err(e) => debug!(worker_id = %self.worker_id, "Readiness probe task failed: {}", e),
            }

            if Instant::now() + self.timing.poll_interval > deadline {
                return Err(JobFailure::new(
                    ErrorKind::PreparationTimeout,
                    format!(
                        "Task preparation timeout ({} seconds)",
                        self.timing.preparation_timeout.as_secs()
                    ),
                ));
            }
            tokio::time::sleep(self.timing.poll_interval).await;
        }
    }

    async fn stream_fetch(&self, task_id: &JobId, task: &FetchTask) -> Result<(), JobFailure> {
        let start = self
            .evaluate(stream_start_expression(task_id, task), true)
            .await?;
        let start: StreamStart = serde_json::from_value(start).map_err(|e| {
            JobFailure::new(ErrorKind::ExecutionError, format!("Malformed stream start: {}", e))
        })?;
        if is_firewall_status(start.status) {
            if let Err(e) = self.evaluate_raw(stream_cancel_expression(task_id), false).await {
                debug!(task_id = %task_id, "Failed to cancel blocked stream: {}", e);
            }
            return Err(firewall_failure(start.status));
        }

        let mut chunks = 0usize;
        loop {
            let drained = self.evaluate(stream_drain_expression(task_id), false).await?;
            let drained: StreamDrain = serde_json::from_value(drained).unwrap_or_default();
            for line in drained.lines {
                chunks += 1;
                self.respond(task_id, json!({ "type": "stream", "data": line }));
            }
            if let Some(error) = drained.error {
                return Err(JobFailure::new(ErrorKind::ExecutionError, error));
            }
            if drained.done {
                break;
            }
            tokio::time::sleep(STREAM_POLL_INTERVAL).await;
        }

        debug!(task_id = %task_id, "Stream finished after {} chunks", chunks);
        self.respond(task_id, json!({ "type": "stream", "data": STREAM_DONE_MARKER }));
        Ok(())
    }

    async fn evaluate_raw(&self, expression: String, await_promise: bool) -> Result<Option<Value>> {
        let tab = self.tab.clone();
        let remote = tokio::task::spawn_blocking(move || tab.evaluate(&expression, await_promise))
            .await??;
        Ok(remote.value)
    }

    async fn evaluate(&self, expression: String, await_promise: bool) -> Result<Value, JobFailure> {
        let raw = self
            .evaluate_raw(expression, await_promise)
            .await
            .map_err(|e| JobFailure::new(ErrorKind::ExecutionError, e.to_string()))?;
        parse_envelope(raw.as_ref())
    }

    fn respond(&self, task_id: &JobId, data: Value) {
        let serialized = data.to_string();
        debug!(
            task_id = %task_id,
            "Task response: content_sha256: {}, content_length: {}",
            content_hash(&serialized),
            serialized.len()
        );
        self.send(WorkerEvent::TaskResponse {
            task_id: task_id.clone(),
            worker_id: Some(self.worker_id.clone()),
            data,
        });
    }

    fn send(&self, event: WorkerEvent) {
        if self.events.send(event).is_err() {
            debug!(worker_id = %self.worker_id, "Agent stopped listening, dropping job report");
        }
    }
}
