//! Worker status registry: last known state of every worker.
//!
//! Written only through the challenge detector (one observation at a time on
//! the agent loop); read by the dispatcher for worker lookup and by the retry
//! coordinator for its stability check.

use serde::Serialize;
use std::collections::HashMap;
use tab_relay_common::utils::normalize_address;
use tab_relay_common::{ChallengeSignal, Lifecycle, StatusSnapshot, WorkerId, WorkerSnapshot};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerState {
    pub worker_id: WorkerId,
    /// Normalized address the worker currently shows
    pub address: String,
    pub lifecycle: Lifecycle,
    /// When `lifecycle` last changed (not when it was last observed)
    pub last_transition: Instant,
    /// Wall clock twin of `last_transition`, for status and persistence
    pub last_transition_ms: u64,
    /// Raw signal of the most recent observation
    pub challenge_signal: ChallengeSignal,
}

impl WorkerState {
    fn to_snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            address: self.address.clone(),
            lifecycle: self.lifecycle,
            last_transition_ms: self.last_transition_ms,
            challenge_signal: self.challenge_signal,
        }
    }
}

/// Introspection view of one worker (`GET_STATUS`)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatusView {
    pub page_url: String,
    pub status: Lifecycle,
    pub last_transition: u64,
    pub challenge_info: ChallengeSignal,
}

#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, WorkerState>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a persisted snapshot.
    ///
    /// Restored entries count as having transitioned just now, so a restart
    /// never shortens a stability window.
    pub fn restore(&mut self, snapshot: StatusSnapshot) {
        let now = Instant::now();
        for (worker_id, saved) in snapshot {
            self.workers.insert(
                worker_id.clone(),
                WorkerState {
                    worker_id,
                    address: normalize_address(&saved.address),
                    lifecycle: saved.lifecycle,
                    last_transition: now,
                    last_transition_ms: saved.last_transition_ms,
                    challenge_signal: saved.challenge_signal,
                },
            );
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.workers
            .iter()
            .map(|(id, state)| (id.clone(), state.to_snapshot()))
            .collect()
    }

    pub fn get(&self, worker_id: &str) -> Option<&WorkerState> {
        self.workers.get(worker_id)
    }

    pub fn contains(&self, worker_id: &str) -> bool {
        self.workers.contains_key(worker_id)
    }

    /// A worker showing `address`, preferring idle workers then the lowest id
    pub fn find_by_address(&self, address: &str) -> Option<&WorkerId> {
        let address = normalize_address(address);
        self.workers
            .values()
            .filter(|state| state.address == address)
            .min_by(|a, b| {
                let busy = |s: &WorkerState| s.lifecycle == Lifecycle::Busy;
                busy(a)
                    .cmp(&busy(b))
                    .then_with(|| a.worker_id.cmp(&b.worker_id))
            })
            .map(|state| &state.worker_id)
    }

    pub fn remove(&mut self, worker_id: &str) -> Option<WorkerState> {
        self.workers.remove(worker_id)
    }

    /// Drop every entry not in `live`; returns the removed ids
    pub fn retain_live(&mut self, live: &[WorkerId]) -> Vec<WorkerId> {
        let stale: Vec<WorkerId> = self
            .workers
            .keys()
            .filter(|id| !live.contains(id))
            .cloned()
            .collect();
        for id in &stale {
            self.workers.remove(id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn status_view(&self) -> HashMap<WorkerId, WorkerStatusView> {
        self.workers
            .iter()
            .map(|(id, state)| {
                (
                    id.clone(),
                    WorkerStatusView {
                        page_url: state.address.clone(),
                        status: state.lifecycle,
                        last_transition: state.last_transition_ms,
                        challenge_info: state.challenge_signal,
                    },
                )
            })
            .collect()
    }

    pub(crate) fn get_mut(&mut self, worker_id: &str) -> Option<&mut WorkerState> {
        self.workers.get_mut(worker_id)
    }

    pub(crate) fn insert(&mut self, state: WorkerState) {
        self.workers.insert(state.worker_id.clone(), state);
    }
}
