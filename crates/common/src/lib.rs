pub mod config;
pub mod error;
pub mod host;
pub mod protocol;
pub mod store;
pub mod types;
pub mod utils;

pub use config::*;
pub use error::{ErrorKind, JobFailure};
pub use host::WorkerHost;
pub use protocol::{FrameError, InboundFrame, OutboundFrame, PageStatusData};
pub use store::{
    JsonFileStore, LogEntry, LogLevel, MemoryStore, StateStore, StatusSnapshot, WorkerSnapshot,
    MAX_LOG_ENTRIES,
};
pub use types::*;
