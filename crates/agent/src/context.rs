//! Process-scoped agent context and the events processed by the agent loop.

use crate::connection::Link;
use crate::metrics::Metrics;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tab_relay_common::{
    AgentConfig, DeliveryAck, JobId, LogEntry, LogLevel, StateStore, StatusSnapshot, WorkerHost,
    WorkerId,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Everything that can wake the agent loop besides worker reports and
/// local queries. Produced by helper tasks (socket pumps, timers, host calls).
#[derive(Debug)]
pub enum AgentEvent {
    LinkReady {
        generation: u64,
        result: Result<Link, String>,
    },
    Frame {
        generation: u64,
        text: String,
    },
    LinkClosed {
        generation: u64,
        reason: String,
    },
    ReconnectDue {
        epoch: u64,
    },
    Provisioned {
        job_id: JobId,
        address: String,
        result: Result<WorkerId, String>,
    },
    ProvisionDeadline {
        job_id: JobId,
    },
    Delivered {
        job_id: JobId,
        worker_id: WorkerId,
        result: Result<DeliveryAck, String>,
    },
    ResetFinished {
        job_id: JobId,
        worker_id: WorkerId,
        result: Result<(), String>,
    },
    RecoveryPoll {
        job_id: JobId,
        attempt: u32,
    },
}

pub type AgentEventSender = mpsc::UnboundedSender<AgentEvent>;
pub type AgentEventReceiver = mpsc::UnboundedReceiver<AgentEvent>;

enum JournalOp {
    Log(LogEntry),
    Snapshot(StatusSnapshot),
    Flush(oneshot::Sender<()>),
}

/// Ordered writer in front of the [`StateStore`].
///
/// Entries are also emitted as tracing events so the activity log and the
/// process log tell the same story.
#[derive(Clone)]
pub struct Journal {
    tx: mpsc::UnboundedSender<JournalOp>,
}

impl Journal {
    pub fn spawn(store: Arc<dyn StateStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                match op {
                    JournalOp::Log(entry) => {
                        if let Err(e) = store.append_log(entry).await {
                            warn!("Failed to append activity log: {:#}", e);
                        }
                    }
                    JournalOp::Snapshot(snapshot) => {
                        if let Err(e) = store.save_snapshot(&snapshot).await {
                            warn!("Failed to save worker status snapshot: {:#}", e);
                        }
                    }
                    JournalOp::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        (Self { tx }, handle)
    }

    pub fn info(&self, message: impl Into<String>) {
        self.record(LogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.record(LogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.record(LogLevel::Error, message.into());
    }

    fn record(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => info!("{}", message),
            LogLevel::Warn => warn!("{}", message),
            LogLevel::Error => error!("{}", message),
        }
        let _ = self.tx.send(JournalOp::Log(LogEntry::new(level, message)));
    }

    pub fn save(&self, snapshot: StatusSnapshot) {
        let _ = self.tx.send(JournalOp::Snapshot(snapshot));
    }

    /// Resolves once every previously queued write has been handed to the store
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(JournalOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Process-scoped context shared by every agent component.
///
/// Created once by [`AgentContext::init`] and torn down by
/// [`AgentContext::shutdown`]; components get it by reference.
#[derive(Clone)]
pub struct AgentContext {
    pub config: Arc<AgentConfig>,
    /// Stable for the lifetime of the process, sent in every `register`
    pub client_id: String,
    pub host: Arc<dyn WorkerHost>,
    pub metrics: Metrics,
    pub journal: Journal,
    events: AgentEventSender,
    cancel: CancellationToken,
}

impl AgentContext {
    pub fn init(
        config: AgentConfig,
        host: Arc<dyn WorkerHost>,
        store: Arc<dyn StateStore>,
        cancel: CancellationToken,
    ) -> anyhow::Result<(Self, AgentEventReceiver)> {
        let metrics = Metrics::new()?;
        let (journal, _) = Journal::spawn(store);
        let (events, events_rx) = mpsc::unbounded_channel();
        let client_id = format!("{}_{}", config.client_id_prefix, Uuid::new_v4().simple());

        info!(client_id = %client_id, host = host.name(), "Agent context initialized");

        Ok((
            Self {
                config: Arc::new(config),
                client_id,
                host,
                metrics,
                journal,
                events,
                cancel,
            },
            events_rx,
        ))
    }

    pub fn post(&self, event: AgentEvent) {
        // The receiver only goes away when the loop has stopped
        let _ = self.events.send(event);
    }

    /// Post `event` after `delay` unless the agent shuts down first
    pub fn schedule(&self, delay: Duration, event: AgentEvent) {
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let _ = events.send(event);
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    /// Run an external capability call off the loop and post its outcome
    pub fn spawn_call<F>(&self, call: F)
    where
        F: Future<Output = AgentEvent> + Send + 'static,
    {
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                event = call => {
                    let _ = events.send(event);
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    pub fn event_sender(&self) -> AgentEventSender {
        self.events.clone()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("Cancelling all agent timers and pending calls...");
            self.cancel.cancel();
        }
    }
}
