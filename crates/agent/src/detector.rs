//! Per-worker challenge detector.
//!
//! Folds raw challenge sensor observations into the binary `idle|busy`
//! lifecycle kept in the [`WorkerRegistry`]. Only lifecycle edges move
//! `last_transition` and produce a `page-status` frame; the raw signal is
//! refreshed on every observation.

use crate::dispatcher::Services;
use crate::registry::{WorkerRegistry, WorkerState};
use tab_relay_common::utils::{normalize_address, now_millis};
use tab_relay_common::{ChallengeSignal, Lifecycle, OutboundFrame, WorkerId};
use tokio::time::Instant;
use tracing::debug;

/// What one observation changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// New lifecycle when it differs from the stored one
    pub edge: Option<Lifecycle>,
    /// The worker had no registry entry before
    pub created: bool,
}

/// Apply one sensor observation to the registry.
///
/// A worker seen for the first time always yields an edge.
pub fn fold(
    registry: &mut WorkerRegistry,
    worker_id: &WorkerId,
    address: &str,
    signal: ChallengeSignal,
    now: Instant,
) -> Observation {
    let lifecycle = signal.lifecycle();
    let address = normalize_address(address);

    match registry.get_mut(worker_id) {
        Some(state) => {
            state.challenge_signal = signal;
            state.address = address;
            if state.lifecycle == lifecycle {
                return Observation {
                    edge: None,
                    created: false,
                };
            }
            state.lifecycle = lifecycle;
            state.last_transition = now;
            state.last_transition_ms = now_millis();
            Observation {
                edge: Some(lifecycle),
                created: false,
            }
        }
        None => {
            registry.insert(WorkerState {
                worker_id: worker_id.clone(),
                address,
                lifecycle,
                last_transition: now,
                last_transition_ms: now_millis(),
                challenge_signal: signal,
            });
            Observation {
                edge: Some(lifecycle),
                created: true,
            }
        }
    }
}

/// Fold an observation and publish its edge: `page-status` upstream (dropped
/// while disconnected), activity log and snapshot.
pub fn observe(
    services: &mut Services<'_>,
    worker_id: &WorkerId,
    address: &str,
    signal: ChallengeSignal,
) -> Observation {
    let observation = fold(&mut *services.registry, worker_id, address, signal, Instant::now());

    let Some(lifecycle) = observation.edge else {
        debug!(worker_id = %worker_id, "Sensor observation without lifecycle change");
        return observation;
    };

    let page_url = services
        .registry
        .get(worker_id)
        .map(|state| state.address.clone())
        .unwrap_or_else(|| normalize_address(address));

    let indicators = signal.active_indicators();
    if indicators.is_empty() {
        services.ctx.journal.info(format!(
            "Page status changed: {} -> {} ({})",
            page_url, lifecycle, worker_id
        ));
    } else {
        services.ctx.journal.info(format!(
            "Page status changed: {} -> {} ({}: {})",
            page_url,
            lifecycle,
            worker_id,
            indicators.join(", ")
        ));
    }

    if !services
        .upstream
        .send(&OutboundFrame::page_status(page_url, lifecycle))
    {
        debug!(worker_id = %worker_id, "Control channel down, page-status dropped");
    }

    services
        .ctx
        .metrics
        .known_workers
        .set(services.registry.len() as i64);
    services.ctx.journal.save(services.registry.snapshot());
    observation
}
