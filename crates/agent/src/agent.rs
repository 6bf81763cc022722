//! The agent event loop.
//!
//! One task owns the connection manager, the worker status registry and the
//! dispatcher, and processes one message at a time from three queues: agent
//! events (socket pumps, timers, host calls), worker reports and local
//! queries. Handlers never await, so each runs to completion.

use crate::connection::{ConnectionManager, ConnectionState, Dialer};
use crate::context::{AgentContext, AgentEvent, AgentEventReceiver};
use crate::detector;
use crate::dispatcher::{Dispatcher, Services};
use crate::metrics::Metrics;
use crate::registry::{WorkerRegistry, WorkerStatusView};
use crate::retry::RetryCoordinator;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tab_relay_common::{
    AgentConfig, ChallengeSignal, InboundFrame, JobPayload, StateStore, WorkerEvent,
    WorkerEventReceiver, WorkerHost, WorkerId,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Answer to the `GET_STATUS` query
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub connected: bool,
    pub connection_state: ConnectionState,
    pub client_id: String,
    pub session_id: Option<String>,
    pub reconnect_attempts: u32,
    pub active_jobs: usize,
    pub queued_frames: usize,
    pub worker_statuses: HashMap<WorkerId, WorkerStatusView>,
}

pub enum AgentCommand {
    Status(oneshot::Sender<AgentStatus>),
    Reconnect(oneshot::Sender<()>),
}

/// Cloneable handle for local introspection of a running agent
#[derive(Clone)]
pub struct AgentHandle {
    commands: mpsc::Sender<AgentCommand>,
    metrics: Metrics,
}

impl AgentHandle {
    pub async fn status(&self) -> Result<AgentStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(AgentCommand::Status(tx))
            .await
            .map_err(|_| anyhow!("agent is not running"))?;
        rx.await.map_err(|_| anyhow!("agent stopped before answering"))
    }

    /// Reset the backoff and reconnect right away (`RECONNECT`)
    pub async fn reconnect(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(AgentCommand::Reconnect(tx))
            .await
            .map_err(|_| anyhow!("agent is not running"))?;
        rx.await.map_err(|_| anyhow!("agent stopped before answering"))
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }
}

pub struct Agent {
    ctx: AgentContext,
    connection: ConnectionManager,
    registry: WorkerRegistry,
    dispatcher: Dispatcher,
    events: AgentEventReceiver,
    worker_events: WorkerEventReceiver,
    commands: mpsc::Receiver<AgentCommand>,
}

impl Agent {
    /// Build the agent and restore the worker status map.
    ///
    /// The persisted snapshot is loaded first, then pruned to the workers the
    /// host still has.
    pub async fn init(
        config: AgentConfig,
        host: Arc<dyn WorkerHost>,
        store: Arc<dyn StateStore>,
        dialer: Arc<dyn Dialer>,
        worker_events: WorkerEventReceiver,
        cancel: CancellationToken,
    ) -> Result<(Self, AgentHandle)> {
        let snapshot = match store.load_snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Ignoring unreadable worker status snapshot: {:#}", e);
                Default::default()
            }
        };

        let retry = RetryCoordinator::new(config.retry.clone());
        let outbox_capacity = config.outbox_capacity;
        let (ctx, events) = AgentContext::init(config, host, store, cancel)?;

        let mut registry = WorkerRegistry::new();
        if !snapshot.is_empty() {
            let restored = snapshot.len();
            registry.restore(snapshot);
            match ctx.host.live_workers().await {
                Ok(live) => {
                    let pruned = registry.retain_live(&live);
                    ctx.journal.info(format!(
                        "Restored {} worker status entries, pruned {} closed worker(s)",
                        restored,
                        pruned.len()
                    ));
                }
                Err(e) => warn!("Could not list live workers, keeping restored entries: {:#}", e),
            }
            ctx.journal.save(registry.snapshot());
        }
        ctx.metrics.known_workers.set(registry.len() as i64);

        let (commands_tx, commands) = mpsc::channel(16);
        let handle = AgentHandle {
            commands: commands_tx,
            metrics: ctx.metrics.clone(),
        };

        let agent = Self {
            connection: ConnectionManager::new(&ctx, dialer),
            dispatcher: Dispatcher::new(retry, outbox_capacity),
            registry,
            events,
            worker_events,
            commands,
            ctx,
        };
        Ok((agent, handle))
    }

    pub fn context(&self) -> &AgentContext {
        &self.ctx
    }

    /// Run until the cancellation token fires
    pub async fn run(mut self) -> Result<()> {
        info!(client_id = %self.ctx.client_id, "Agent started");
        self.connection.connect();

        let cancel = self.ctx.cancel_token().clone();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(event) = self.worker_events.recv() => self.handle_worker_event(event),
                Some(command) = self.commands.recv() => self.handle_command(command),
                else => break,
            }
        }

        self.shutdown();
        self.ctx.journal.flush().await;
        Ok(())
    }

    fn split(&mut self) -> (&mut Dispatcher, Services<'_>) {
        (
            &mut self.dispatcher,
            Services {
                ctx: &self.ctx,
                upstream: &mut self.connection,
                registry: &mut self.registry,
            },
        )
    }

    fn handle_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::LinkReady { generation, result } => {
                if self.connection.on_link_ready(generation, result) {
                    let (dispatcher, s) = self.split();
                    let flushed = dispatcher.flush_outbox(s.upstream);
                    if flushed > 0 {
                        info!(flushed, "Flushed queued task responses after reconnect");
                    }
                }
            }
            AgentEvent::Frame { generation, text } => {
                match self.connection.on_frame(generation, &text) {
                    None => {}
                    Some(Ok(frame)) => self.route(frame),
                    Some(Err(e)) => match e.task_id() {
                        Some(task_id) => {
                            let task_id = task_id.to_string();
                            let (dispatcher, mut s) = self.split();
                            dispatcher.reject_command(&task_id, &e, &mut s);
                        }
                        None => warn!("Ignoring undecodable frame: {}", e),
                    },
                }
            }
            AgentEvent::LinkClosed { generation, reason } => {
                self.connection.on_link_closed(generation, &reason);
            }
            AgentEvent::ReconnectDue { epoch } => self.connection.on_reconnect_due(epoch),
            AgentEvent::Provisioned {
                job_id,
                address,
                result,
            } => {
                let (dispatcher, mut s) = self.split();
                dispatcher.on_provisioned(job_id, address, result, &mut s);
            }
            AgentEvent::ProvisionDeadline { job_id } => {
                let (dispatcher, mut s) = self.split();
                dispatcher.on_provision_deadline(job_id, &mut s);
            }
            AgentEvent::Delivered {
                job_id,
                worker_id,
                result,
            } => {
                let (dispatcher, mut s) = self.split();
                dispatcher.on_delivered(job_id, worker_id, result, &mut s);
            }
            AgentEvent::ResetFinished {
                job_id,
                worker_id,
                result,
            } => {
                let (dispatcher, mut s) = self.split();
                dispatcher.on_reset_finished(job_id, worker_id, result, &mut s);
            }
            AgentEvent::RecoveryPoll { job_id, attempt } => {
                let (dispatcher, mut s) = self.split();
                dispatcher.on_recovery_poll(job_id, attempt, &mut s);
            }
        }
    }

    fn route(&mut self, frame: InboundFrame) {
        match frame {
            InboundFrame::FetchCommand { task_id, data } => {
                let (dispatcher, mut s) = self.split();
                dispatcher.submit(task_id, JobPayload::Fetch(data), &mut s);
            }
            InboundFrame::ExecuteScript { task_id, data } => {
                let (dispatcher, mut s) = self.split();
                dispatcher.submit(task_id, JobPayload::Script(data), &mut s);
            }
            InboundFrame::RegisterAck => info!("Registration acknowledged by control plane"),
            InboundFrame::Unknown { kind } => warn!(kind = %kind, "Unknown message type, ignoring"),
        }
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        let (dispatcher, mut s) = self.split();
        match event {
            WorkerEvent::Ready { worker_id, address } => {
                detector::observe(&mut s, &worker_id, &address, ChallengeSignal::clear());
                dispatcher.on_worker_ready(&worker_id, &mut s);
            }
            WorkerEvent::PageStatusChanged {
                worker_id,
                address,
                status,
                challenge_info,
            } => {
                if status != challenge_info.lifecycle() {
                    debug!(
                        worker_id = %worker_id,
                        reported = %status,
                        "Reported status disagrees with challenge signal, using the signal"
                    );
                }
                detector::observe(&mut s, &worker_id, &address, challenge_info);
            }
            WorkerEvent::TaskResponse {
                task_id,
                worker_id,
                data,
            } => {
                dispatcher.on_task_response(task_id, worker_id, data, &mut s);
            }
            WorkerEvent::TaskError {
                task_id,
                worker_id,
                error_type,
                error,
            } => {
                dispatcher.on_task_error(task_id, worker_id, &error_type, &error, &mut s);
            }
            WorkerEvent::Gone { worker_id } => {
                if s.registry.remove(&worker_id).is_some() {
                    s.ctx
                        .journal
                        .info(format!("Worker {} closed, removed from registry", worker_id));
                    s.ctx.metrics.known_workers.set(s.registry.len() as i64);
                    s.ctx.journal.save(s.registry.snapshot());
                }
                dispatcher.on_worker_gone(&worker_id, &mut s);
            }
        }
    }

    fn handle_command(&mut self, command: AgentCommand) {
        match command {
            AgentCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
            AgentCommand::Reconnect(reply) => {
                self.connection.reconnect();
                let _ = reply.send(());
            }
        }
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            connected: self.connection.state() == ConnectionState::Open,
            connection_state: self.connection.state(),
            client_id: self.ctx.client_id.clone(),
            session_id: self.connection.session_id().map(str::to_string),
            reconnect_attempts: self.connection.attempts(),
            active_jobs: self.dispatcher.len(),
            queued_frames: self.dispatcher.outbox_len(),
            worker_statuses: self.registry.status_view(),
        }
    }

    fn shutdown(&mut self) {
        self.connection.shutdown();
        self.ctx.shutdown();
        if !self.dispatcher.is_empty() {
            warn!(
                "Terminating with {} task(s) still pending",
                self.dispatcher.len()
            );
        }
        self.ctx.journal.info("Agent stopped");
    }
}
