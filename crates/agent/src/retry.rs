//! Retry coordinator: the recovery sequence of a job blocked by a challenge.
//!
//! `Active -> Blocked -> Recovering -> (Active | Failed)`. The coordinator
//! makes the decisions; the dispatcher performs the resulting actions (hard
//! reset, scheduling the next poll, re-dispatch) and owns the job.

use crate::dispatcher::{Job, JobPhase};
use crate::registry::WorkerRegistry;
use std::time::Duration;
use tab_relay_common::{Lifecycle, RetryConfig, WorkerId};
use tokio::time::Instant;

/// A job waiting for its worker's challenge to clear
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoverySession {
    pub job_id: String,
    pub worker_id: WorkerId,
    pub started_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockedDecision {
    /// Budget left: hard reset the worker
    Reset { attempt: u32 },
    /// The report that reached the budget; fail with `MAX_RETRIES_EXCEEDED`
    Exhausted { attempt: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryCheck {
    Resume,
    Wait { reasons: Vec<String> },
    TimedOut { elapsed: Duration },
}

#[derive(Debug, Clone)]
pub struct RetryCoordinator {
    config: RetryConfig,
}

impl RetryCoordinator {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn attempt_budget(&self) -> u32 {
        self.config.attempt_budget
    }

    pub fn poll_interval(&self) -> Duration {
        self.config.poll_interval
    }

    /// Count one blocked report against the job's budget
    pub fn on_blocked(&self, job: &mut Job) -> BlockedDecision {
        job.attempt = job.attempt.saturating_add(1);
        if job.attempt >= job.attempt_budget {
            BlockedDecision::Exhausted {
                attempt: job.attempt,
            }
        } else {
            BlockedDecision::Reset {
                attempt: job.attempt,
            }
        }
    }

    /// Put the job into `Recovering` on `worker_id`
    pub fn begin_recovery(&self, job: &mut Job, worker_id: WorkerId, now: Instant) {
        job.phase = JobPhase::Recovering(RecoverySession {
            job_id: job.id.clone(),
            worker_id,
            started_at: now,
        });
    }

    /// Decide whether a recovering job may resume.
    ///
    /// The registry is read fresh on every call: the worker must be idle, must
    /// have been idle for the stability window, and its latest raw signal must
    /// have every indicator clear.
    pub fn check(
        &self,
        session: &RecoverySession,
        registry: &WorkerRegistry,
        now: Instant,
    ) -> RecoveryCheck {
        let elapsed = now.saturating_duration_since(session.started_at);
        if elapsed > self.config.recovery_timeout {
            return RecoveryCheck::TimedOut { elapsed };
        }

        let Some(state) = registry.get(&session.worker_id) else {
            return RecoveryCheck::Wait {
                reasons: vec!["worker not in registry".to_string()],
            };
        };

        if state.lifecycle == Lifecycle::Busy {
            return RecoveryCheck::Wait {
                reasons: vec!["page still busy".to_string()],
            };
        }

        let idle_for = now.saturating_duration_since(state.last_transition);
        let signal_clear = !state.challenge_signal.is_active();
        if idle_for >= self.config.stability_window && signal_clear {
            return RecoveryCheck::Resume;
        }

        let mut reasons = Vec::new();
        if idle_for < self.config.stability_window {
            reasons.push(format!("only idle for {}ms", idle_for.as_millis()));
        }
        reasons.extend(
            state
                .challenge_signal
                .active_indicators()
                .into_iter()
                .map(str::to_string),
        );
        RecoveryCheck::Wait { reasons }
    }
}
