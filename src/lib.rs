//! # Tab Relay
//!
//! Tab Relay connects to a control plane over a reconnecting WebSocket and
//! runs the fetch and script jobs it receives inside browser tabs, so that
//! requests carry the tab's cookies and anti-bot clearance. Jobs that hit a
//! Cloudflare challenge are recovered by hard-resetting the tab and waiting
//! for the challenge to clear before redelivering.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tab_relay::prelude::*;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AgentConfig {
//!         control_url: "ws://coordinator.internal:8080/ws".to_string(),
//!         ..Default::default()
//!     };
//!
//!     let cancel = CancellationToken::new();
//!     let (events, worker_events) = tokio::sync::mpsc::unbounded_channel();
//!     let host = ChromeWorkerHost::launch(TabPoolConfig::default(), events, cancel.clone()).await?;
//!
//!     run_agent(
//!         config,
//!         Arc::new(host),
//!         worker_events,
//!         Arc::new(WebSocketDialer::default()),
//!         cancel,
//!     )
//!     .await
//! }
//! ```
//!
//! ## Architecture
//!
//! Tab Relay consists of:
//! - **Agent**: Connection manager, task dispatcher, challenge detector,
//!   retry coordinator and worker status registry
//! - **Worker**: Chrome tab pool, challenge sensor and in-tab job execution
//! - **Common**: Shared types, wire protocol, configuration and persistence
//!
//! ## Features
//!
//! - `agent` (default): Include the agent
//! - `worker` (default): Include the Chrome worker host
//!
//! Use `default-features = false` to include only what you need.

/// Re-export of common types and traits
pub use tab_relay_common as common;

/// Re-export of agent functionality
#[cfg(feature = "agent")]
pub use tab_relay_agent as agent;

/// Re-export of the Chrome worker host
#[cfg(feature = "worker")]
pub use tab_relay_worker as worker;

/// Convenient re-exports of commonly used types
pub mod prelude {
    // Worker host seam and its events
    pub use crate::common::{
        DeliveryAck, WorkerCommand, WorkerEvent, WorkerEventReceiver, WorkerEventSender,
        WorkerHost, WorkerId,
    };

    // Configuration types
    pub use crate::common::{AgentConfig, RetryConfig, StealthLevel, TabPoolConfig};

    // Persistence
    pub use crate::common::{JsonFileStore, MemoryStore, StateStore};

    // Agent functionality
    #[cfg(feature = "agent")]
    pub use crate::agent::{run_agent, Agent, AgentHandle, AgentStatus, WebSocketDialer};

    // Chrome worker host
    #[cfg(feature = "worker")]
    pub use crate::worker::{ChromeWorkerHost, TabPool};
}
