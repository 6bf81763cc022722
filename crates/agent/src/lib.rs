mod agent;
mod backoff;
mod context;
mod status_server;

pub mod connection;
pub mod detector;
pub mod dispatcher;
pub mod metrics;
pub mod registry;
pub mod retry;

#[cfg(test)]
mod testing;

pub use agent::{Agent, AgentCommand, AgentHandle, AgentStatus};
pub use backoff::Backoff;
pub use connection::{ConnectionManager, ConnectionState, Dialer, Link, Upstream, WebSocketDialer};
pub use context::{AgentContext, AgentEvent, Journal};
pub use metrics::Metrics;
pub use registry::{WorkerRegistry, WorkerState, WorkerStatusView};
pub use status_server::StatusServer;

use anyhow::Result;
use std::sync::Arc;
use tab_relay_common::{
    AgentConfig, JsonFileStore, MemoryStore, StateStore, WorkerEventReceiver, WorkerHost,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Run the agent until SIGINT/SIGTERM or until `cancel` fires.
///
/// This is the main entry point for running a tab-relay agent. The caller
/// provides the worker host (and the receiving end of the channel the host
/// reports on) plus the transport used to reach the coordinator.
///
/// # Example
///
/// ```rust,ignore
/// use tab_relay_agent::{run_agent, WebSocketDialer};
/// use tab_relay_common::AgentConfig;
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let cancel = CancellationToken::new();
///     let (events, worker_events) = tokio::sync::mpsc::unbounded_channel();
///     let host = MyWorkerHost::new(events);
///
///     run_agent(
///         AgentConfig::default(),
///         Arc::new(host),
///         worker_events,
///         Arc::new(WebSocketDialer::default()),
///         cancel,
///     )
///     .await
/// }
/// ```
pub async fn run_agent(
    config: AgentConfig,
    host: Arc<dyn WorkerHost>,
    worker_events: WorkerEventReceiver,
    dialer: Arc<dyn Dialer>,
    cancel: CancellationToken,
) -> Result<()> {
    info!(
        "Starting agent for {} (host: {}, status port: {})",
        config.control_url,
        host.name(),
        config.status_port
    );

    let store: Arc<dyn StateStore> = match &config.state_dir {
        Some(dir) => {
            info!("Persisting worker status and activity log in {}", dir.display());
            Arc::new(JsonFileStore::open(dir.clone()).await?)
        }
        None => {
            warn!("No state directory configured, status map will not survive restarts");
            Arc::new(MemoryStore::new())
        }
    };

    let status_port = config.status_port;
    let (agent, handle) = Agent::init(
        config,
        host,
        store.clone(),
        dialer,
        worker_events,
        cancel.clone(),
    )
    .await?;

    // Start status HTTP server in background
    let server = (status_port != 0).then(|| {
        let server = StatusServer::new(handle, store);
        tokio::spawn(async move {
            if let Err(e) = server.start(status_port).await {
                tracing::error!("Status server error: {}", e);
            }
        })
    });

    tokio::spawn(shutdown_signal(cancel));
    let result = agent.run().await;

    if let Some(server) = server {
        server.abort();
    }
    info!("Agent shutdown complete");
    result
}

async fn shutdown_signal(cancellation_token: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C signal");
        },
        _ = terminate => {
            warn!("Received SIGTERM signal");
        },
        _ = cancellation_token.cancelled() => return,
    }

    info!("Cancelling agent loop and pending timers...");
    cancellation_token.cancel();
}
