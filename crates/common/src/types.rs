use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::mpsc;

/// Identifier of a worker (one browser tab), assigned by the worker host
pub type WorkerId = String;

/// Identifier of a job, assigned upstream (`taskId` on the wire)
pub type JobId = String;

/// Chunk data that closes a streamed fetch result
pub const STREAM_DONE_MARKER: &str = "[!!DONE!!]";

/// Default sub-type of a script job
pub const DEFAULT_SCRIPT_TYPE: &str = "EXECUTE_SCRIPT_TASK";

/// Binary lifecycle of a worker as folded from challenge sensor output
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
    #[default]
    Idle,
    Busy,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Idle => "idle",
            Lifecycle::Busy => "busy",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured output of a challenge sensor for one observation of a worker.
///
/// The core never looks at page content; it only folds these five booleans.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChallengeSignal {
    pub url_token_present: bool,
    pub title_match: bool,
    pub body_match: bool,
    pub dom_elements_present: bool,
    pub still_loading: bool,
}

impl ChallengeSignal {
    /// A signal with every indicator false
    pub fn clear() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.url_token_present
            || self.title_match
            || self.body_match
            || self.dom_elements_present
            || self.still_loading
    }

    pub fn lifecycle(&self) -> Lifecycle {
        if self.is_active() {
            Lifecycle::Busy
        } else {
            Lifecycle::Idle
        }
    }

    /// Human readable names of the indicators currently set
    pub fn active_indicators(&self) -> Vec<&'static str> {
        let mut reasons = Vec::new();
        if self.url_token_present {
            reasons.push("URL has challenge tokens");
        }
        if self.title_match {
            reasons.push("title indicates challenge");
        }
        if self.body_match {
            reasons.push("body text indicates challenge");
        }
        if self.dom_elements_present {
            reasons.push("challenge DOM elements present");
        }
        if self.still_loading {
            reasons.push("page still loading");
        }
        reasons
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobKind {
    Fetch,
    ScriptEval,
}

/// `data` of a `fetch-command` frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTask {
    pub page_url: String,
    pub fetch_url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(default)]
    pub stream: bool,
}

fn default_method() -> String {
    "GET".to_string()
}

/// `data` of an `execute-script` frame. The script body is opaque to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptTask {
    pub page_url: String,
    #[serde(default)]
    pub script: String,
    #[serde(rename = "type", default = "default_script_type")]
    pub script_type: String,
}

fn default_script_type() -> String {
    DEFAULT_SCRIPT_TYPE.to_string()
}

/// What a job asks a worker to do
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JobPayload {
    Fetch(FetchTask),
    Script(ScriptTask),
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::Fetch(_) => JobKind::Fetch,
            JobPayload::Script(_) => JobKind::ScriptEval,
        }
    }

    /// Address of the page the job must run in (the worker selector)
    pub fn page_url(&self) -> &str {
        match self {
            JobPayload::Fetch(task) => &task.page_url,
            JobPayload::Script(task) => &task.page_url,
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, JobPayload::Fetch(task) if task.stream)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    ExecuteFetchTask,
    ExecuteScriptTask,
}

/// Message handed to a worker over its per-worker job channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerCommand {
    #[serde(rename = "type")]
    pub command: CommandType,
    pub task_id: JobId,
    pub task: JobPayload,
}

impl WorkerCommand {
    pub fn new(task_id: JobId, task: JobPayload) -> Self {
        let command = match task.kind() {
            JobKind::Fetch => CommandType::ExecuteFetchTask,
            JobKind::ScriptEval => CommandType::ExecuteScriptTask,
        };
        Self {
            command,
            task_id,
            task,
        }
    }
}

/// Synchronous answer of a worker to a delivered command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAck {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl DeliveryAck {
    pub fn accepted() -> Self {
        Self {
            success: true,
            error: None,
            error_type: None,
        }
    }

    pub fn rejected(error_type: Option<&str>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            error_type: error_type.map(str::to_string),
        }
    }
}

/// Out-of-band reports from workers to the agent
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Worker finished loading its page and can accept jobs
    Ready { worker_id: WorkerId, address: String },
    /// `PAGE_STATUS_CHANGED`: a fresh challenge sensor observation
    PageStatusChanged {
        worker_id: WorkerId,
        address: String,
        status: Lifecycle,
        challenge_info: ChallengeSignal,
    },
    /// `TASK_RESPONSE`: job result (or one chunk of a streamed result)
    TaskResponse {
        task_id: JobId,
        worker_id: Option<WorkerId>,
        data: Value,
    },
    /// `TASK_ERROR`: job failed on the worker
    TaskError {
        task_id: JobId,
        worker_id: Option<WorkerId>,
        error_type: String,
        error: String,
    },
    /// Worker is confirmed gone (tab closed)
    Gone { worker_id: WorkerId },
}

pub type WorkerEventSender = mpsc::UnboundedSender<WorkerEvent>;
pub type WorkerEventReceiver = mpsc::UnboundedReceiver<WorkerEvent>;
