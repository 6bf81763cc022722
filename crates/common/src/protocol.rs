//! Control-plane wire protocol: JSON text frames tagged by `type`.

use crate::error::{ErrorKind, JobFailure};
use crate::types::{FetchTask, JobId, JobPayload, Lifecycle, ScriptTask};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const FRAME_REGISTER: &str = "register";
pub const FRAME_REGISTER_ACK: &str = "register_ack";
pub const FRAME_PING: &str = "ping";
pub const FRAME_FETCH_COMMAND: &str = "fetch-command";
pub const FRAME_EXECUTE_SCRIPT: &str = "execute-script";
pub const FRAME_TASK_RESPONSE: &str = "task-response";
pub const FRAME_PAGE_STATUS: &str = "page-status";

/// Frames the coordinator sends to the agent
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    FetchCommand { task_id: JobId, data: FetchTask },
    ExecuteScript { task_id: JobId, data: ScriptTask },
    RegisterAck,
    /// Any type this agent does not know; logged and ignored
    Unknown { kind: String },
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not a JSON object: {0}")]
    Json(#[source] serde_json::Error),
    #[error("frame has no type tag")]
    MissingType,
    #[error("malformed {kind} frame: {source}")]
    Invalid {
        kind: String,
        task_id: Option<JobId>,
        #[source]
        source: serde_json::Error,
    },
}

impl FrameError {
    /// Task id of the offending frame, when it could be recovered
    pub fn task_id(&self) -> Option<&str> {
        match self {
            FrameError::Invalid { task_id, .. } => task_id.as_deref(),
            _ => None,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
    task_id: Option<JobId>,
    #[serde(default)]
    data: Value,
}

impl InboundFrame {
    /// Decode one text frame.
    ///
    /// The envelope is read first so a malformed command still yields its
    /// `taskId` and can be answered with an error response.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(FrameError::Json)?;
        let kind = envelope.kind.ok_or(FrameError::MissingType)?;

        match kind.as_str() {
            FRAME_FETCH_COMMAND | FRAME_EXECUTE_SCRIPT => {
                let task_id = envelope.task_id.clone();
                let invalid = |source: serde_json::Error| FrameError::Invalid {
                    kind: kind.clone(),
                    task_id: task_id.clone(),
                    source,
                };
                let Some(id) = envelope.task_id else {
                    return Err(invalid(serde::de::Error::missing_field("taskId")));
                };
                if kind == FRAME_FETCH_COMMAND {
                    let data = serde_json::from_value(envelope.data).map_err(invalid)?;
                    Ok(InboundFrame::FetchCommand { task_id: id, data })
                } else {
                    let data = serde_json::from_value(envelope.data).map_err(invalid)?;
                    Ok(InboundFrame::ExecuteScript { task_id: id, data })
                }
            }
            FRAME_REGISTER_ACK => Ok(InboundFrame::RegisterAck),
            _ => Ok(InboundFrame::Unknown { kind }),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            InboundFrame::FetchCommand { .. } => FRAME_FETCH_COMMAND,
            InboundFrame::ExecuteScript { .. } => FRAME_EXECUTE_SCRIPT,
            InboundFrame::RegisterAck => FRAME_REGISTER_ACK,
            InboundFrame::Unknown { kind } => kind,
        }
    }

    /// Job carried by a command frame
    pub fn into_job(self) -> Option<(JobId, JobPayload)> {
        match self {
            InboundFrame::FetchCommand { task_id, data } => Some((task_id, JobPayload::Fetch(data))),
            InboundFrame::ExecuteScript { task_id, data } => {
                Some((task_id, JobPayload::Script(data)))
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageStatusData {
    pub page_url: String,
    pub status: Lifecycle,
}

/// Frames the agent sends to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundFrame {
    #[serde(rename = "register", rename_all = "camelCase")]
    Register { client_id: String, timestamp: u64 },
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "task-response", rename_all = "camelCase")]
    TaskResponse { task_id: JobId, data: Value },
    #[serde(rename = "page-status")]
    PageStatus { data: PageStatusData },
}

impl OutboundFrame {
    pub fn page_status(page_url: impl Into<String>, status: Lifecycle) -> Self {
        OutboundFrame::PageStatus {
            data: PageStatusData {
                page_url: page_url.into(),
                status,
            },
        }
    }

    /// `task-response` whose data is `{error:{type, message}}`
    pub fn error_response(task_id: impl Into<JobId>, failure: &JobFailure) -> Self {
        Self::error_frame(task_id, failure.kind, &failure.message)
    }

    pub fn error_frame(task_id: impl Into<JobId>, kind: ErrorKind, message: &str) -> Self {
        OutboundFrame::TaskResponse {
            task_id: task_id.into(),
            data: json!({
                "error": {
                    "type": kind.as_str(),
                    "message": message,
                }
            }),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundFrame::Register { .. } => FRAME_REGISTER,
            OutboundFrame::Ping => FRAME_PING,
            OutboundFrame::TaskResponse { .. } => FRAME_TASK_RESPONSE,
            OutboundFrame::PageStatus { .. } => FRAME_PAGE_STATUS,
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
