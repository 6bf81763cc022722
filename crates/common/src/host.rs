use crate::types::{DeliveryAck, WorkerCommand, WorkerId};
use anyhow::Result;
use async_trait::async_trait;
use std::fmt::Debug;

/// External capability that owns the actual workers (browser tabs).
///
/// The agent never touches a page itself. Everything it needs from the
/// execution environment goes through this trait, and everything the
/// environment needs to tell the agent arrives asynchronously as
/// [`WorkerEvent`](crate::types::WorkerEvent)s on the channel the host was
/// constructed with:
///
/// - `Ready` once a provisioned worker finished loading its page
/// - `PageStatusChanged` for every challenge sensor observation
/// - `TaskResponse` / `TaskError` when a delivered job completes
/// - `Gone` when a worker was closed
///
/// # Example
///
/// ```rust,ignore
/// #[derive(Debug)]
/// struct SingleTabHost { events: WorkerEventSender }
///
/// #[async_trait]
/// impl WorkerHost for SingleTabHost {
///     async fn provision(&self, address: &str) -> Result<WorkerId> {
///         let id = open_tab(address).await?;
///         // ... later, when the page finished loading:
///         // self.events.send(WorkerEvent::Ready { worker_id, address })
///         Ok(id)
///     }
///
///     async fn deliver(&self, worker: &WorkerId, command: WorkerCommand) -> Result<DeliveryAck> {
///         post_to_tab(worker, command).await
///     }
///
///     async fn hard_reset(&self, worker: &WorkerId) -> Result<()> {
///         reload_ignoring_cache(worker).await
///     }
///
///     async fn live_workers(&self) -> Result<Vec<WorkerId>> {
///         list_tabs().await
///     }
///
///     fn name(&self) -> &str {
///         "single_tab"
///     }
/// }
/// ```
#[async_trait]
pub trait WorkerHost: Debug + Send + Sync {
    /// Create a new worker navigated to `address`.
    ///
    /// Returning `Ok` only means the worker exists; the agent still waits for
    /// the `Ready` event before binding a job to it.
    async fn provision(&self, address: &str) -> Result<WorkerId>;

    /// Hand a command to the worker's job channel.
    ///
    /// `Err` is a channel failure. A worker that received the command but
    /// refused it answers with `DeliveryAck { success: false, .. }`.
    async fn deliver(&self, worker: &WorkerId, command: WorkerCommand) -> Result<DeliveryAck>;

    /// Force-reload the worker bypassing caches
    async fn hard_reset(&self, worker: &WorkerId) -> Result<()>;

    /// Ids of workers that currently exist
    async fn live_workers(&self) -> Result<Vec<WorkerId>>;

    /// Get unique identifier for this host (used in logging)
    fn name(&self) -> &str;
}
