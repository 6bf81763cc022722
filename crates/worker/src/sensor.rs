//! Challenge sensor: a DOM probe evaluated in the tab at a fixed interval.

use anyhow::Result;
use headless_chrome::browser::tab::Tab;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tab_relay_common::{ChallengeSignal, WorkerEvent, WorkerEventSender, WorkerId};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Evaluated in the page; returns the probe as a JSON string
pub const PROBE_SCRIPT: &str = r#"
(() => {
    const url = window.location.href;
    const title = (document.title || '').toLowerCase();
    const body = ((document.body && document.body.textContent) || '').toLowerCase();

    const hasUrlTokens = ['__cf_chl_tk=', 'cf_chl_jschl_tk=', '__cf_chl_captcha_tk=']
        .some(token => url.includes(token));

    const hasChallengeTitle = ['please wait...', 'just a moment...', '请稍后...', '稍等片刻...']
        .some(indicator => title.includes(indicator));

    const hasChallengeText =
        body.includes('checking if you are a real person. this may take a few seconds') ||
        body.includes('please complete the following to verify that you are human') ||
        (body.includes('before you continue') && body.includes('needs to check the security of your connection')) ||
        body.includes('正在验证您是否是真人。这可能需要几秒钟时间') ||
        body.includes('请完成以下操作，验证您是真人') ||
        (body.includes('继续之前') && body.includes('需要先检查您的连接的安全性'));

    const hasChallengeElements = !!document.querySelector(
        '.cf-browser-verification, .cf-checking-browser, .cf-challenge-running, #challenge-running'
    );

    return JSON.stringify({
        url,
        hasUrlTokens,
        hasChallengeTitle,
        hasChallengeText,
        hasChallengeElements,
        readyState: document.readyState
    });
})()
"#;

/// How long every reading is posted after a refresh request
pub const REFRESH_WINDOW: Duration = Duration::from_secs(2);

/// Raw output of [`PROBE_SCRIPT`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReading {
    pub url: String,
    pub has_url_tokens: bool,
    pub has_challenge_title: bool,
    pub has_challenge_text: bool,
    pub has_challenge_elements: bool,
    pub ready_state: String,
}

impl ProbeReading {
    pub fn signal(&self) -> ChallengeSignal {
        ChallengeSignal {
            url_token_present: self.has_url_tokens,
            title_match: self.has_challenge_title,
            body_match: self.has_challenge_text,
            dom_elements_present: self.has_challenge_elements,
            still_loading: self.ready_state != "complete",
        }
    }
}

pub fn parse_probe(raw: Option<&serde_json::Value>) -> Result<ProbeReading> {
    let Some(text) = raw.and_then(|v| v.as_str()) else {
        anyhow::bail!("Challenge probe returned no value");
    };
    Ok(serde_json::from_str(text)?)
}

/// Decides which readings get posted: only changes, except inside a refresh
/// window where every reading goes out.
///
/// A reload that lands on the same clean page produces no change, yet the
/// agent marked the worker as loading when it issued the reload and needs a
/// fresh observation to see it idle again.
#[derive(Debug, Default)]
pub struct ReadingFilter {
    last: Option<ProbeReading>,
    force_until: Option<Instant>,
}

impl ReadingFilter {
    pub fn refresh(&mut self, now: Instant) {
        self.force_until = Some(now + REFRESH_WINDOW);
    }

    pub fn admit(&mut self, reading: &ProbeReading, now: Instant) -> bool {
        let forced = self.force_until.is_some_and(|until| now < until);
        if !forced {
            self.force_until = None;
            if self.last.as_ref() == Some(reading) {
                return false;
            }
        }
        self.last = Some(reading.clone());
        true
    }
}

/// Evaluate the probe once
pub fn read(tab: &Tab) -> Result<ProbeReading> {
    let result = tab.evaluate(PROBE_SCRIPT, false)?;
    parse_probe(result.value.as_ref())
}

/// Sample the tab every `interval` and report each changed reading.
/// Notifying `refresh` re-posts readings for [`REFRESH_WINDOW`] even when
/// they did not change.
///
/// Stops when the tab can no longer be evaluated (reported as `Gone`), when
/// the agent stops listening, or on cancellation.
pub fn spawn_sensor(
    worker_id: WorkerId,
    tab: Arc<Tab>,
    interval: Duration,
    refresh: Arc<Notify>,
    events: WorkerEventSender,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let mut filter = ReadingFilter::default();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = refresh.notified() => {
                    debug!(worker_id = %worker_id, "Sensor refresh requested");
                    filter.refresh(Instant::now());
                    continue;
                }
                _ = ticker.tick() => {}
            }

            let probe_tab = tab.clone();
            let reading = match tokio::task::spawn_blocking(move || read(&probe_tab)).await {
                Ok(Ok(reading)) => reading,
                Ok(Err(e)) if is_dead_tab_error(&e.to_string()) => {
                    info!(worker_id = %worker_id, "Tab closed, stopping sensor: {}", e);
                    let _ = events.send(WorkerEvent::Gone { worker_id });
                    break;
                }
                Ok(Err(e)) => {
                    // Mid-navigation evaluations fail routinely
                    debug!(worker_id = %worker_id, "Challenge probe failed: {}", e);
                    continue;
                }
                Err(e) => {
                    debug!(worker_id = %worker_id, "Challenge probe task failed: {}", e);
                    continue;
                }
            };

            if !filter.admit(&reading, Instant::now()) {
                continue;
            }
            let signal = reading.signal();
            let event = WorkerEvent::PageStatusChanged {
                worker_id: worker_id.clone(),
                address: reading.url.clone(),
                status: signal.lifecycle(),
                challenge_info: signal,
            };
            if events.send(event).is_err() {
                break;
            }
        }
    });
}

/// Errors after which the tab will never answer again
pub fn is_dead_tab_error(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("no target with given id")
        || message.contains("target closed")
        || message.contains("connection is closed")
}
