use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tab_relay_common::utils::extract_domain;
use tab_relay_common::{
    DeliveryAck, TabPoolConfig, WorkerCommand, WorkerEvent, WorkerEventSender, WorkerHost,
    WorkerId,
};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::executor::{JobRunner, JobTiming};
use crate::sensor::spawn_sensor;
use crate::tab_pool::TabPool;

/// [`WorkerHost`] backed by tabs of a local Chrome process.
///
/// Each provisioned tab gets a challenge sensor posting `PageStatusChanged`,
/// and each delivered command runs in the tab as a detached job reporting
/// `TaskResponse` / `TaskError` on the same channel.
pub struct ChromeWorkerHost {
    pool: Arc<TabPool>,
    /// Refresh triggers of the running sensors
    sensors: RwLock<HashMap<WorkerId, Arc<Notify>>>,
    events: WorkerEventSender,
    cancel: CancellationToken,
}

impl fmt::Debug for ChromeWorkerHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChromeWorkerHost")
            .field("config", self.pool.config())
            .finish_non_exhaustive()
    }
}

impl ChromeWorkerHost {
    pub async fn launch(
        config: TabPoolConfig,
        events: WorkerEventSender,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let pool = TabPool::launch(config).await?;
        Ok(Self {
            pool: Arc::new(pool),
            sensors: RwLock::new(HashMap::new()),
            events,
            cancel,
        })
    }

    fn timing(&self) -> JobTiming {
        let config = self.pool.config();
        JobTiming {
            poll_interval: config.sensor_interval,
            preparation_timeout: config.preparation_timeout,
        }
    }
}

#[async_trait]
impl WorkerHost for ChromeWorkerHost {
    async fn provision(&self, address: &str) -> Result<WorkerId> {
        let domain = extract_domain(address).unwrap_or_else(|_| address.to_string());
        let (worker_id, tab) = self.pool.open_tab(address).await?;
        info!(worker_id = %worker_id, "Provisioned tab for {}", domain);

        self.events.send(WorkerEvent::Ready {
            worker_id: worker_id.clone(),
            address: address.to_string(),
        })?;

        let refresh = Arc::new(Notify::new());
        self.sensors
            .write()
            .await
            .insert(worker_id.clone(), refresh.clone());
        spawn_sensor(
            worker_id.clone(),
            tab,
            self.pool.config().sensor_interval,
            refresh,
            self.events.clone(),
            self.cancel.child_token(),
        );
        Ok(worker_id)
    }

    async fn deliver(&self, worker: &WorkerId, command: WorkerCommand) -> Result<DeliveryAck> {
        let Some(tab) = self.pool.get(worker).await else {
            anyhow::bail!("No tab for worker {}", worker);
        };
        JobRunner::new(
            worker.clone(),
            tab,
            self.timing(),
            self.events.clone(),
            self.cancel.child_token(),
        )
        .spawn(command);
        Ok(DeliveryAck::accepted())
    }

    async fn hard_reset(&self, worker: &WorkerId) -> Result<()> {
        info!(worker_id = %worker, "Hard reset (reload bypassing cache)");
        self.pool.reload(worker).await.map_err(|e| {
            warn!(worker_id = %worker, "Hard reset failed: {}", e);
            e
        })?;

        // The reloaded page may read exactly as before; report it regardless
        if let Some(refresh) = self.sensors.read().await.get(worker) {
            refresh.notify_one();
        }
        Ok(())
    }

    async fn live_workers(&self) -> Result<Vec<WorkerId>> {
        Ok(self.pool.ids().await)
    }

    fn name(&self) -> &str {
        "chrome"
    }
}
