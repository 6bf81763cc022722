//! Task dispatcher: owns the job table from submission to terminal outcome.
//!
//! Every handler runs on the agent loop. Each one first checks that the job
//! is still present and in the phase the event was meant for, so timers and
//! capability results that lost a race are no-ops. Removal from the table is
//! the single place a terminal frame is produced, which makes it exactly-once.

use crate::connection::Upstream;
use crate::context::{AgentContext, AgentEvent};
use crate::detector;
use crate::registry::WorkerRegistry;
use crate::retry::{BlockedDecision, RecoveryCheck, RecoverySession, RetryCoordinator};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tab_relay_common::utils::normalize_address;
use tab_relay_common::{
    ChallengeSignal, ErrorKind, FrameError, JobFailure, JobId, JobKind, JobPayload, OutboundFrame,
    WorkerCommand, WorkerId, STREAM_DONE_MARKER,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Mutable view of the agent's other components, lent to a dispatcher call
pub struct Services<'a> {
    pub ctx: &'a AgentContext,
    pub upstream: &'a mut dyn Upstream,
    pub registry: &'a mut WorkerRegistry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobPhase {
    /// Waiting for the host to create a worker
    Provisioning,
    /// Worker created, waiting for its ready report
    AwaitingReady(WorkerId),
    /// Command handed to the worker, acknowledgement pending
    Delivering(WorkerId),
    Active(WorkerId),
    /// Hard reset of the worker in progress
    Blocked(WorkerId),
    Recovering(RecoverySession),
}

impl JobPhase {
    pub fn name(&self) -> &'static str {
        match self {
            JobPhase::Provisioning => "provisioning",
            JobPhase::AwaitingReady(_) => "awaiting_ready",
            JobPhase::Delivering(_) => "delivering",
            JobPhase::Active(_) => "active",
            JobPhase::Blocked(_) => "blocked",
            JobPhase::Recovering(_) => "recovering",
        }
    }

    pub fn worker(&self) -> Option<&WorkerId> {
        match self {
            JobPhase::Provisioning => None,
            JobPhase::AwaitingReady(w)
            | JobPhase::Delivering(w)
            | JobPhase::Active(w)
            | JobPhase::Blocked(w) => Some(w),
            JobPhase::Recovering(session) => Some(&session.worker_id),
        }
    }

    /// Phases in which the bound worker is executing the job
    fn is_running_on(&self, worker_id: Option<&str>) -> bool {
        let bound = match self {
            JobPhase::Delivering(w) | JobPhase::Active(w) => w,
            _ => return false,
        };
        worker_id.map_or(true, |reporter| reporter == bound)
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    /// Normalized page address selecting the worker
    pub address: String,
    pub payload: JobPayload,
    pub created_at: Instant,
    /// Blocked reports counted so far
    pub attempt: u32,
    pub attempt_budget: u32,
    pub phase: JobPhase,
}

impl Job {
    pub fn new(id: JobId, payload: JobPayload, attempt_budget: u32) -> Self {
        Self {
            address: normalize_address(payload.page_url()),
            id,
            payload,
            created_at: Instant::now(),
            attempt: 0,
            attempt_budget,
            phase: JobPhase::Provisioning,
        }
    }

    pub fn kind(&self) -> JobKind {
        self.payload.kind()
    }
}

fn kind_label(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Fetch => "fetch",
        JobKind::ScriptEval => "script",
    }
}

/// True for a streamed chunk that is not the completion marker
fn is_partial_chunk(data: &Value) -> bool {
    data.get("type").and_then(Value::as_str) == Some("stream")
        && data.get("data").and_then(Value::as_str) != Some(STREAM_DONE_MARKER)
}

pub struct Dispatcher {
    jobs: HashMap<JobId, Job>,
    /// `task-response` frames that could not be sent yet, oldest first
    outbox: VecDeque<OutboundFrame>,
    outbox_capacity: usize,
    retry: RetryCoordinator,
}

impl Dispatcher {
    pub fn new(retry: RetryCoordinator, outbox_capacity: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            outbox: VecDeque::new(),
            outbox_capacity: outbox_capacity.max(1),
            retry,
        }
    }

    pub fn job(&self, job_id: &str) -> Option<&Job> {
        self.jobs.get(job_id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    // ==================== Submission ====================

    /// Register a job and bind it to a worker for its address, provisioning
    /// one when none is known.
    pub fn submit(&mut self, job_id: JobId, payload: JobPayload, s: &mut Services<'_>) {
        if self.jobs.contains_key(&job_id) {
            warn!(task_id = %job_id, "Duplicate task id, ignoring command");
            return;
        }

        let job = Job::new(job_id.clone(), payload, self.retry.attempt_budget());
        let address = job.address.clone();
        s.ctx.metrics.jobs_submitted.inc();
        s.ctx.journal.info(format!(
            "Received {} task {} for {}",
            kind_label(job.kind()),
            job_id,
            address
        ));
        self.jobs.insert(job_id.clone(), job);
        self.update_gauge(s);

        if let Some(worker_id) = s.registry.find_by_address(&address).cloned() {
            self.execute_on_worker(&job_id, &worker_id, s);
            return;
        }

        // Share a worker that is already being created or loading this address
        let pending = self
            .jobs
            .values()
            .filter(|other| other.id != job_id && other.address == address)
            .find_map(|other| match &other.phase {
                JobPhase::Provisioning => Some(JobPhase::Provisioning),
                JobPhase::AwaitingReady(w) => Some(JobPhase::AwaitingReady(w.clone())),
                _ => None,
            });
        if let Some(phase) = pending {
            debug!(task_id = %job_id, phase = phase.name(), "Sharing pending worker for {}", address);
            if let Some(job) = self.jobs.get_mut(&job_id) {
                job.phase = phase;
            }
            self.arm_provision_deadline(&job_id, s);
            return;
        }

        self.provision(&job_id, address, s);
    }

    fn provision(&mut self, job_id: &JobId, address: String, s: &mut Services<'_>) {
        if let Some(job) = self.jobs.get_mut(job_id) {
            job.phase = JobPhase::Provisioning;
        }
        s.ctx.journal.info(format!(
            "No matching worker for {}, provisioning one for task {}",
            address, job_id
        ));

        let host = s.ctx.host.clone();
        let id = job_id.clone();
        s.ctx.spawn_call(async move {
            let result = host
                .provision(&address)
                .await
                .map_err(|e| format!("{:#}", e));
            AgentEvent::Provisioned {
                job_id: id,
                address,
                result,
            }
        });
        self.arm_provision_deadline(job_id, s);
    }

    fn arm_provision_deadline(&self, job_id: &JobId, s: &Services<'_>) {
        s.ctx.schedule(
            s.ctx.config.provision_timeout,
            AgentEvent::ProvisionDeadline {
                job_id: job_id.clone(),
            },
        );
    }

    /// Result of a provisioning call made for `job_id`. Binds every job still
    /// waiting for a worker at `address`, including jobs that shared the call.
    pub fn on_provisioned(
        &mut self,
        job_id: JobId,
        address: String,
        result: Result<WorkerId, String>,
        s: &mut Services<'_>,
    ) {
        let mut waiting: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.phase == JobPhase::Provisioning && job.address == address)
            .map(|job| job.id.clone())
            .collect();
        if waiting.is_empty() {
            debug!(task_id = %job_id, "Provisioning result for finished tasks");
            return;
        }
        waiting.sort();

        match result {
            Ok(worker_id) => {
                info!(task_id = %job_id, worker_id = %worker_id, "Worker provisioned");
                let ready = s.registry.contains(&worker_id);
                for id in waiting {
                    if ready {
                        self.execute_on_worker(&id, &worker_id, s);
                    } else if let Some(job) = self.jobs.get_mut(&id) {
                        job.phase = JobPhase::AwaitingReady(worker_id.clone());
                    }
                }
            }
            Err(e) => {
                for id in waiting {
                    self.fail(
                        &id,
                        JobFailure::new(
                            ErrorKind::ProvisionError,
                            format!("Failed to create worker: {}", e),
                        ),
                        s,
                    );
                }
            }
        }
    }

    pub fn on_provision_deadline(&mut self, job_id: JobId, s: &mut Services<'_>) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        if !matches!(
            job.phase,
            JobPhase::Provisioning | JobPhase::AwaitingReady(_)
        ) {
            return;
        }
        let message = format!(
            "Worker for {} did not become ready within {:?}",
            job.address, s.ctx.config.provision_timeout
        );
        self.fail(
            &job_id,
            JobFailure::new(ErrorKind::ProvisionTimeout, message),
            s,
        );
    }

    /// Bind every job waiting on `worker_id` now that it reported ready
    pub fn on_worker_ready(&mut self, worker_id: &WorkerId, s: &mut Services<'_>) {
        let mut waiting: Vec<JobId> = self
            .jobs
            .values()
            .filter(|job| job.phase == JobPhase::AwaitingReady(worker_id.clone()))
            .map(|job| job.id.clone())
            .collect();
        waiting.sort();

        for job_id in waiting {
            info!(task_id = %job_id, worker_id = %worker_id, "Worker ready, executing task");
            self.execute_on_worker(&job_id, worker_id, s);
        }
    }

    // ==================== Execution ====================

    /// Hand the job to `worker_id`. Also the re-entry point after recovery, so
    /// a later blocked report is counted against the same budget.
    pub fn execute_on_worker(&mut self, job_id: &JobId, worker_id: &WorkerId, s: &mut Services<'_>) {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        job.phase = JobPhase::Delivering(worker_id.clone());

        let command = WorkerCommand::new(job.id.clone(), job.payload.clone());
        info!(
            task_id = %job_id,
            worker_id = %worker_id,
            attempt = job.attempt,
            "Dispatching task to worker"
        );

        let host = s.ctx.host.clone();
        let id = job_id.clone();
        let worker = worker_id.clone();
        s.ctx.spawn_call(async move {
            let result = host
                .deliver(&worker, command)
                .await
                .map_err(|e| format!("{:#}", e));
            AgentEvent::Delivered {
                job_id: id,
                worker_id: worker,
                result,
            }
        });
    }

    pub fn on_delivered(
        &mut self,
        job_id: JobId,
        worker_id: WorkerId,
        result: Result<tab_relay_common::DeliveryAck, String>,
        s: &mut Services<'_>,
    ) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if job.phase != JobPhase::Delivering(worker_id.clone()) {
            debug!(task_id = %job_id, phase = job.phase.name(), "Late delivery acknowledgement");
            return;
        }

        match result {
            Ok(ack) if ack.success => {
                debug!(task_id = %job_id, worker_id = %worker_id, "Task accepted by worker");
                job.phase = JobPhase::Active(worker_id);
            }
            Ok(ack) => {
                let kind = ack.error_type.as_deref().map(ErrorKind::from_worker);
                let detail = ack
                    .error
                    .unwrap_or_else(|| "Worker refused the task".to_string());
                match kind {
                    Some(kind) if kind.is_transient() => self.on_job_failed(&job_id, kind, &detail, s),
                    _ => self.fail(
                        &job_id,
                        JobFailure::new(ErrorKind::WorkerCommunicationError, detail),
                        s,
                    ),
                }
            }
            Err(e) => self.fail(
                &job_id,
                JobFailure::new(
                    ErrorKind::WorkerCommunicationError,
                    format!("Failed to send task to worker {}: {}", worker_id, e),
                ),
                s,
            ),
        }
    }

    // ==================== Outcomes ====================

    /// `TASK_RESPONSE` from a worker. Stream chunks are forwarded and keep the
    /// job alive until the completion marker. Like errors, results only count
    /// while the reporting worker is executing the job.
    pub fn on_task_response(
        &mut self,
        job_id: JobId,
        worker_id: Option<WorkerId>,
        data: Value,
        s: &mut Services<'_>,
    ) {
        let Some(job) = self.jobs.get(&job_id) else {
            debug!(task_id = %job_id, "Response for unknown or finished task");
            return;
        };
        if !job.phase.is_running_on(worker_id.as_deref()) {
            warn!(
                task_id = %job_id,
                phase = job.phase.name(),
                "Response outside of execution, ignoring"
            );
            return;
        }

        if job.payload.is_stream() && is_partial_chunk(&data) {
            self.send_or_queue(
                OutboundFrame::TaskResponse {
                    task_id: job_id,
                    data,
                },
                s,
            );
            return;
        }

        self.on_job_succeeded(&job_id, data, s);
    }

    /// Forward the result upstream and remove the job
    pub fn on_job_succeeded(&mut self, job_id: &JobId, data: Value, s: &mut Services<'_>) {
        let Some(job) = self.jobs.remove(job_id) else {
            return;
        };
        self.update_gauge(s);
        s.ctx.metrics.jobs_succeeded.inc();
        s.ctx.journal.info(format!(
            "Task {} completed successfully (attempt {})",
            job_id, job.attempt
        ));
        self.send_or_queue(
            OutboundFrame::TaskResponse {
                task_id: job_id.clone(),
                data,
            },
            s,
        );
    }

    /// `TASK_ERROR` from a worker. Only honoured while the reporting worker is
    /// executing the job; reports from an earlier attempt are stale.
    pub fn on_task_error(
        &mut self,
        job_id: JobId,
        worker_id: Option<WorkerId>,
        error_type: &str,
        error: &str,
        s: &mut Services<'_>,
    ) {
        let Some(job) = self.jobs.get(&job_id) else {
            debug!(task_id = %job_id, "Error for unknown or finished task");
            return;
        };
        if !job.phase.is_running_on(worker_id.as_deref()) {
            debug!(
                task_id = %job_id,
                phase = job.phase.name(),
                error_type,
                "Ignoring error report outside of execution"
            );
            return;
        }

        self.on_job_failed(&job_id, ErrorKind::from_worker(error_type), error, s);
    }

    /// Route a failure: the blocked classification goes to the retry
    /// coordinator, anything else is terminal.
    pub fn on_job_failed(
        &mut self,
        job_id: &JobId,
        kind: ErrorKind,
        detail: &str,
        s: &mut Services<'_>,
    ) {
        if kind.is_transient() {
            self.on_blocked(job_id, detail, s);
        } else {
            self.fail(job_id, JobFailure::new(kind, detail), s);
        }
    }

    fn fail(&mut self, job_id: &JobId, failure: JobFailure, s: &mut Services<'_>) {
        if self.jobs.remove(job_id).is_none() {
            return;
        }
        self.update_gauge(s);
        s.ctx.metrics.job_failed(failure.kind);
        s.ctx
            .journal
            .error(format!("Task {} failed: {}", job_id, failure));
        self.send_or_queue(OutboundFrame::error_response(job_id.clone(), &failure), s);
    }

    /// Answer a command frame that could not be decoded
    pub fn reject_command(&mut self, task_id: &str, error: &FrameError, s: &mut Services<'_>) {
        if self.jobs.contains_key(task_id) {
            warn!(task_id, "Malformed command reuses a live task id, ignoring: {}", error);
            return;
        }
        s.ctx.metrics.job_failed(ErrorKind::InvalidCommand);
        s.ctx
            .journal
            .warn(format!("Rejected command {}: {}", task_id, error));
        self.send_or_queue(
            OutboundFrame::error_frame(task_id, ErrorKind::InvalidCommand, &error.to_string()),
            s,
        );
    }

    // ==================== Recovery ====================

    fn on_blocked(&mut self, job_id: &JobId, detail: &str, s: &mut Services<'_>) {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return;
        };
        let Some(worker_id) = job.phase.worker().cloned() else {
            return;
        };

        match self.retry.on_blocked(job) {
            BlockedDecision::Exhausted { attempt } => {
                let message = format!(
                    "Challenge firewall persisted after {} attempts: {}",
                    attempt, detail
                );
                self.fail(
                    job_id,
                    JobFailure::new(ErrorKind::MaxRetriesExceeded, message),
                    s,
                );
            }
            BlockedDecision::Reset { attempt } => {
                job.phase = JobPhase::Blocked(worker_id.clone());
                s.ctx.journal.warn(format!(
                    "Cloudflare firewall detected for task {}, retry {}/{}",
                    job_id, attempt, job.attempt_budget
                ));

                let host = s.ctx.host.clone();
                let id = job_id.clone();
                s.ctx.spawn_call(async move {
                    let result = host
                        .hard_reset(&worker_id)
                        .await
                        .map_err(|e| format!("{:#}", e));
                    AgentEvent::ResetFinished {
                        job_id: id,
                        worker_id,
                        result,
                    }
                });
            }
        }
    }

    pub fn on_reset_finished(
        &mut self,
        job_id: JobId,
        worker_id: WorkerId,
        result: Result<(), String>,
        s: &mut Services<'_>,
    ) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if job.phase != JobPhase::Blocked(worker_id.clone()) {
            return;
        }

        if let Err(e) = result {
            self.fail(
                &job_id,
                JobFailure::new(
                    ErrorKind::WorkerResetError,
                    format!("Failed to reset worker {}: {}", worker_id, e),
                ),
                s,
            );
            return;
        }

        let attempt = job.attempt;
        self.retry
            .begin_recovery(job, worker_id.clone(), Instant::now());
        s.ctx.metrics.recoveries_started.inc();
        s.ctx.journal.info(format!(
            "Worker {} reset, waiting for it to become idle before retrying task {}",
            worker_id, job_id
        ));

        // The reload itself is an observation: the page is loading again
        if let Some(address) = s.registry.get(&worker_id).map(|w| w.address.clone()) {
            let loading = ChallengeSignal {
                still_loading: true,
                ..Default::default()
            };
            detector::observe(s, &worker_id, &address, loading);
        }

        self.on_recovery_poll(job_id, attempt, s);
    }

    pub fn on_recovery_poll(&mut self, job_id: JobId, attempt: u32, s: &mut Services<'_>) {
        let Some(job) = self.jobs.get(&job_id) else {
            return;
        };
        let JobPhase::Recovering(session) = &job.phase else {
            return;
        };
        if job.attempt != attempt {
            return;
        }

        let worker_id = session.worker_id.clone();
        match self.retry.check(session, &*s.registry, Instant::now()) {
            RecoveryCheck::Resume => {
                s.ctx.metrics.recoveries_resumed.inc();
                s.ctx.journal.info(format!(
                    "Challenge cleared on worker {}, retrying task {} (attempt {})",
                    worker_id, job_id, attempt
                ));
                self.execute_on_worker(&job_id, &worker_id, s);
            }
            RecoveryCheck::Wait { reasons } => {
                debug!(
                    task_id = %job_id,
                    worker_id = %worker_id,
                    "Waiting for challenge completion: {}",
                    reasons.join(", ")
                );
                s.ctx.schedule(
                    self.retry.poll_interval(),
                    AgentEvent::RecoveryPoll { job_id, attempt },
                );
            }
            RecoveryCheck::TimedOut { elapsed } => {
                let message = format!(
                    "Challenge on worker {} did not clear within {:?}",
                    worker_id, elapsed
                );
                self.fail(
                    &job_id,
                    JobFailure::new(ErrorKind::RecoveryTimeout, message),
                    s,
                );
            }
        }
    }

    // ==================== Worker Membership ====================

    /// Fail jobs that can no longer complete because their worker closed.
    /// Recovering jobs keep polling and end by timeout.
    pub fn on_worker_gone(&mut self, worker_id: &WorkerId, s: &mut Services<'_>) {
        let mut affected: Vec<(JobId, ErrorKind)> = self
            .jobs
            .values()
            .filter_map(|job| match &job.phase {
                JobPhase::AwaitingReady(w) if w == worker_id => {
                    Some((job.id.clone(), ErrorKind::ProvisionError))
                }
                JobPhase::Delivering(w) | JobPhase::Active(w) if w == worker_id => {
                    Some((job.id.clone(), ErrorKind::WorkerCommunicationError))
                }
                _ => None,
            })
            .collect();
        affected.sort_by(|a, b| a.0.cmp(&b.0));

        for (job_id, kind) in affected {
            self.fail(
                &job_id,
                JobFailure::new(kind, format!("Worker {} was closed", worker_id)),
                s,
            );
        }
    }

    // ==================== Upstream ====================

    fn send_or_queue(&mut self, frame: OutboundFrame, s: &mut Services<'_>) {
        self.flush_outbox(s.upstream);
        if self.outbox.is_empty() && s.upstream.send(&frame) {
            return;
        }

        if self.outbox.len() >= self.outbox_capacity {
            if let Some(dropped) = self.outbox.pop_front() {
                warn!(kind = dropped.kind(), "Outbox full, dropping oldest frame");
            }
        }
        debug!(kind = frame.kind(), queued = self.outbox.len() + 1, "Control channel down, frame queued");
        self.outbox.push_back(frame);
    }

    /// Send queued frames in order; stops at the first refusal
    pub fn flush_outbox(&mut self, upstream: &mut dyn Upstream) -> usize {
        let mut sent = 0;
        while let Some(frame) = self.outbox.front() {
            if !upstream.send(frame) {
                break;
            }
            self.outbox.pop_front();
            sent += 1;
        }
        sent
    }

    fn update_gauge(&self, s: &Services<'_>) {
        s.ctx.metrics.active_jobs.set(self.jobs.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fetch_payload, test_config, FakeHost, RecordingUpstream};
    use serde_json::json;
    use std::sync::Arc;
    use tab_relay_common::{InboundFrame, MemoryStore, RetryConfig};
    use tokio_util::sync::CancellationToken;

    fn decode_error(task_id: &str) -> FrameError {
        let text = json!({"type": "fetch-command", "taskId": task_id, "data": {}}).to_string();
        match InboundFrame::parse(&text) {
            Err(e) => e,
            Ok(frame) => panic!("expected a decode error, got {:?}", frame),
        }
    }

    fn setup() -> (AgentContext, Dispatcher, WorkerRegistry, RecordingUpstream) {
        let (host, _calls) = FakeHost::new();
        let (ctx, _events) = AgentContext::init(
            test_config(),
            host,
            Arc::new(MemoryStore::new()),
            CancellationToken::new(),
        )
        .unwrap();
        let dispatcher = Dispatcher::new(RetryCoordinator::new(RetryConfig::default()), 3);
        (ctx, dispatcher, WorkerRegistry::new(), RecordingUpstream::open())
    }

    fn active_job(dispatcher: &mut Dispatcher, id: &str, stream: bool) {
        let mut job = Job::new(id.to_string(), fetch_payload("https://x/", stream), 5);
        job.phase = JobPhase::Active("tab-1".to_string());
        dispatcher.jobs.insert(id.to_string(), job);
    }

    // ==================== Outcome Tests ====================

    #[tokio::test]
    async fn test_stream_job_removed_only_on_done_marker() {
        let (ctx, mut dispatcher, mut registry, mut upstream) = setup();
        active_job(&mut dispatcher, "t1", true);
        let mut s = Services {
            ctx: &ctx,
            upstream: &mut upstream,
            registry: &mut registry,
        };

        dispatcher.on_task_response("t1".into(), None, json!({"type": "stream", "data": "line 1"}), &mut s);
        dispatcher.on_task_response("t1".into(), None, json!({"type": "stream", "data": "line 2"}), &mut s);
        assert_eq!(dispatcher.len(), 1);

        dispatcher.on_task_response("t1".into(), None,
            json!({"type": "stream", "data": STREAM_DONE_MARKER}),
            &mut s,
        );
        assert!(dispatcher.is_empty());

        let data: Vec<Value> = upstream.task_responses("t1");
        assert_eq!(data.len(), 3);
        assert_eq!(data[2]["data"], STREAM_DONE_MARKER);
    }

    #[tokio::test]
    async fn test_terminal_outcome_sent_exactly_once() {
        let (ctx, mut dispatcher, mut registry, mut upstream) = setup();
        active_job(&mut dispatcher, "t1", false);
        let mut s = Services {
            ctx: &ctx,
            upstream: &mut upstream,
            registry: &mut registry,
        };

        dispatcher.on_task_response("t1".into(), None, json!({"type": "object", "data": {"status": 200}}), &mut s);
        dispatcher.on_task_error("t1".into(), None, "EXECUTION_ERROR", "late", &mut s);
        dispatcher.on_provision_deadline("t1".into(), &mut s);
        dispatcher.on_job_failed(&"t1".to_string(), ErrorKind::RecoveryTimeout, "late", &mut s);

        assert_eq!(upstream.task_responses("t1").len(), 1);
    }

    #[tokio::test]
    async fn test_error_from_other_worker_is_ignored() {
        let (ctx, mut dispatcher, mut registry, mut upstream) = setup();
        active_job(&mut dispatcher, "t1", false);
        let mut s = Services {
            ctx: &ctx,
            upstream: &mut upstream,
            registry: &mut registry,
        };

        dispatcher.on_task_error(
            "t1".into(),
            Some("tab-9".to_string()),
            "EXECUTION_ERROR",
            "wrong tab",
            &mut s,
        );
        assert_eq!(dispatcher.len(), 1);

        dispatcher.on_task_error(
            "t1".into(),
            Some("tab-1".to_string()),
            "TIMEOUT",
            "Page preparation timeout",
            &mut s,
        );
        assert!(dispatcher.is_empty());
        let data = upstream.task_responses("t1");
        assert_eq!(data[0]["error"]["type"], "PREPARATION_TIMEOUT");
    }

    #[tokio::test]
    async fn test_response_from_other_worker_or_outside_execution_is_ignored() {
        let (ctx, mut dispatcher, mut registry, mut upstream) = setup();
        active_job(&mut dispatcher, "t1", false);
        let mut s = Services {
            ctx: &ctx,
            upstream: &mut upstream,
            registry: &mut registry,
        };

        dispatcher.on_task_response("t1".into(), Some("tab-9".to_string()), json!({"ok": 1}), &mut s);
        assert_eq!(dispatcher.len(), 1);

        if let Some(job) = dispatcher.jobs.get_mut("t1") {
            job.phase = JobPhase::Blocked("tab-1".to_string());
        }
        dispatcher.on_task_response("t1".into(), Some("tab-1".to_string()), json!({"ok": 2}), &mut s);
        assert_eq!(dispatcher.len(), 1);
        assert!(upstream.task_responses("t1").is_empty());
    }

    // ==================== Provisioning Tests ====================

    #[tokio::test]
    async fn test_job_submitted_while_provisioning_shares_the_call() {
        let (ctx, mut dispatcher, mut registry, mut upstream) = setup();
        let mut s = Services {
            ctx: &ctx,
            upstream: &mut upstream,
            registry: &mut registry,
        };

        dispatcher.submit("t1".into(), fetch_payload("https://x/", false), &mut s);
        dispatcher.submit("t2".into(), fetch_payload("https://x/", false), &mut s);
        assert_eq!(dispatcher.job("t2").unwrap().phase, JobPhase::Provisioning);

        let address = dispatcher.job("t1").unwrap().address.clone();
        dispatcher.on_provisioned("t1".into(), address, Ok("tab-1".to_string()), &mut s);
        for id in ["t1", "t2"] {
            assert_eq!(
                dispatcher.job(id).unwrap().phase,
                JobPhase::AwaitingReady("tab-1".to_string())
            );
        }
    }

    #[tokio::test]
    async fn test_failed_shared_provisioning_fails_every_waiter() {
        let (ctx, mut dispatcher, mut registry, mut upstream) = setup();
        {
            let mut s = Services {
                ctx: &ctx,
                upstream: &mut upstream,
                registry: &mut registry,
            };
            dispatcher.submit("t1".into(), fetch_payload("https://x/", false), &mut s);
            dispatcher.submit("t2".into(), fetch_payload("https://x/", false), &mut s);
            let address = dispatcher.job("t1").unwrap().address.clone();
            dispatcher.on_provisioned("t1".into(), address, Err("no browser".to_string()), &mut s);
        }
        assert!(dispatcher.is_empty());
        for id in ["t1", "t2"] {
            assert_eq!(upstream.task_responses(id)[0]["error"]["type"], "PROVISION_ERROR");
        }
    }

    // ==================== Worker Membership Tests ====================

    #[tokio::test]
    async fn test_worker_gone_fails_bound_jobs_in_id_order() {
        let (ctx, mut dispatcher, mut registry, mut upstream) = setup();
        active_job(&mut dispatcher, "b", false);
        active_job(&mut dispatcher, "c", false);
        let mut waiting = Job::new("a".to_string(), fetch_payload("https://x/", false), 5);
        waiting.phase = JobPhase::AwaitingReady("tab-1".to_string());
        dispatcher.jobs.insert("a".to_string(), waiting);
        if let Some(job) = dispatcher.jobs.get_mut("c") {
            job.phase = JobPhase::Active("tab-2".to_string());
        }

        {
            let mut s = Services {
                ctx: &ctx,
                upstream: &mut upstream,
                registry: &mut registry,
            };
            dispatcher.on_worker_gone(&"tab-1".to_string(), &mut s);
        }
        assert_eq!(dispatcher.len(), 1);
        assert!(dispatcher.job("c").is_some());

        let failures: Vec<(String, Value)> = upstream
            .sent
            .iter()
            .filter_map(|frame| match frame {
                OutboundFrame::TaskResponse { task_id, data } => {
                    Some((task_id.clone(), data["error"]["type"].clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            failures,
            vec![
                ("a".to_string(), json!("PROVISION_ERROR")),
                ("b".to_string(), json!("WORKER_COMMUNICATION_ERROR")),
            ]
        );
    }

    #[tokio::test]
    async fn test_reject_command_answers_invalid_command() {
        let (ctx, mut dispatcher, mut registry, mut upstream) = setup();
        let mut s = Services {
            ctx: &ctx,
            upstream: &mut upstream,
            registry: &mut registry,
        };
        let error = decode_error("bad-1");

        dispatcher.reject_command("bad-1", &error, &mut s);
        let data = upstream.task_responses("bad-1");
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["error"]["type"], "INVALID_COMMAND");
    }

    // ==================== Outbox Tests ====================

    #[tokio::test]
    async fn test_outbox_bounded_and_flushed_in_order() {
        let (ctx, mut dispatcher, mut registry, mut upstream) = setup();
        upstream.set_open(false);
        for id in ["a", "b", "c", "d"] {
            active_job(&mut dispatcher, id, false);
        }
        {
            let mut s = Services {
                ctx: &ctx,
                upstream: &mut upstream,
                registry: &mut registry,
            };
            for id in ["a", "b", "c", "d"] {
                dispatcher.on_task_response(id.into(), None, json!({"ok": id}), &mut s);
            }
        }
        assert!(dispatcher.is_empty());
        assert_eq!(dispatcher.outbox_len(), 3);
        assert!(upstream.sent.is_empty());

        upstream.set_open(true);
        assert_eq!(dispatcher.flush_outbox(&mut upstream), 3);
        let order: Vec<String> = upstream
            .sent
            .iter()
            .filter_map(|frame| match frame {
                OutboundFrame::TaskResponse { task_id, .. } => Some(task_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["b", "c", "d"]);
    }

    #[tokio::test]
    async fn test_page_status_is_not_queued() {
        let (ctx, mut dispatcher, mut registry, mut upstream) = setup();
        upstream.set_open(false);
        {
            let mut s = Services {
                ctx: &ctx,
                upstream: &mut upstream,
                registry: &mut registry,
            };
            detector::observe(&mut s, &"tab-1".to_string(), "https://x/", ChallengeSignal::clear());
        }
        upstream.set_open(true);
        assert_eq!(dispatcher.flush_outbox(&mut upstream), 0);
        assert!(upstream.sent.is_empty());
    }

    // ==================== Duplicate Tests ====================

    #[tokio::test]
    async fn test_duplicate_task_id_is_ignored() {
        let (ctx, mut dispatcher, mut registry, mut upstream) = setup();
        active_job(&mut dispatcher, "t1", false);
        let mut s = Services {
            ctx: &ctx,
            upstream: &mut upstream,
            registry: &mut registry,
        };

        dispatcher.submit("t1".into(), fetch_payload("https://other/", false), &mut s);
        let job = dispatcher.job("t1").unwrap();
        assert_eq!(job.address, "https://x/");
        assert_eq!(job.phase, JobPhase::Active("tab-1".to_string()));
        assert!(upstream.sent.is_empty());
    }
}
