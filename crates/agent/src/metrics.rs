use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tab_relay_common::ErrorKind;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,
    pub jobs_submitted: IntCounter,
    pub jobs_succeeded: IntCounter,
    pub jobs_failed: IntCounterVec,
    pub active_jobs: IntGauge,
    pub recoveries_started: IntCounter,
    pub recoveries_resumed: IntCounter,
    pub reconnect_attempts: IntCounter,
    pub connection_open: IntGauge,
    pub known_workers: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let jobs_submitted = IntCounter::with_opts(Opts::new(
            "tab_relay_agent_jobs_submitted_total",
            "Jobs accepted from the control plane",
        ))?;
        registry.register(Box::new(jobs_submitted.clone()))?;

        let jobs_succeeded = IntCounter::with_opts(Opts::new(
            "tab_relay_agent_jobs_succeeded_total",
            "Jobs that completed with a result",
        ))?;
        registry.register(Box::new(jobs_succeeded.clone()))?;

        // Terminal failures by error kind
        let jobs_failed = IntCounterVec::new(
            Opts::new(
                "tab_relay_agent_jobs_failed_total",
                "Jobs that ended with an error response",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(jobs_failed.clone()))?;

        let active_jobs = IntGauge::with_opts(Opts::new(
            "tab_relay_agent_active_jobs",
            "Jobs currently held in the job table",
        ))?;
        registry.register(Box::new(active_jobs.clone()))?;

        let recoveries_started = IntCounter::with_opts(Opts::new(
            "tab_relay_agent_recoveries_started_total",
            "Recovery sessions opened after a blocked report",
        ))?;
        registry.register(Box::new(recoveries_started.clone()))?;

        let recoveries_resumed = IntCounter::with_opts(Opts::new(
            "tab_relay_agent_recoveries_resumed_total",
            "Recovery sessions that re-dispatched their job",
        ))?;
        registry.register(Box::new(recoveries_resumed.clone()))?;

        let reconnect_attempts = IntCounter::with_opts(Opts::new(
            "tab_relay_agent_reconnect_attempts_total",
            "Scheduled reconnects to the control plane",
        ))?;
        registry.register(Box::new(reconnect_attempts.clone()))?;

        let connection_open = IntGauge::with_opts(Opts::new(
            "tab_relay_agent_connection_open",
            "1 while the control connection is open",
        ))?;
        registry.register(Box::new(connection_open.clone()))?;

        let known_workers = IntGauge::with_opts(Opts::new(
            "tab_relay_agent_known_workers",
            "Entries in the worker status registry",
        ))?;
        registry.register(Box::new(known_workers.clone()))?;

        Ok(Self {
            registry,
            jobs_submitted,
            jobs_succeeded,
            jobs_failed,
            active_jobs,
            recoveries_started,
            recoveries_resumed,
            reconnect_attempts,
            connection_open,
            known_workers,
        })
    }

    pub fn job_failed(&self, kind: ErrorKind) {
        self.jobs_failed.with_label_values(&[kind.as_str()]).inc();
    }

    /// Text exposition of every registered metric
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}
