//! Test doubles: an in-memory worker host, an in-memory control plane and a
//! harness running a whole agent against both.

use crate::agent::{Agent, AgentHandle};
use crate::connection::{Dialer, Link, Upstream};
use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tab_relay_common::{
    AgentConfig, ChallengeSignal, DeliveryAck, FetchTask, JobPayload, MemoryStore, OutboundFrame,
    StateStore, WorkerCommand, WorkerEvent, WorkerEventSender, WorkerHost, WorkerId,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(120);

pub fn test_config() -> AgentConfig {
    AgentConfig {
        status_port: 0,
        ..AgentConfig::default()
    }
}

pub fn fetch_payload(page_url: &str, stream: bool) -> JobPayload {
    JobPayload::Fetch(FetchTask {
        page_url: page_url.to_string(),
        fetch_url: format!("{}api", page_url),
        method: "GET".to_string(),
        body: None,
        stream,
    })
}

pub fn fetch_command(task_id: &str, page_url: &str, fetch_url: &str) -> Value {
    json!({
        "type": "fetch-command",
        "taskId": task_id,
        "data": {"pageUrl": page_url, "fetchUrl": fetch_url}
    })
}

pub fn challenge_signal() -> ChallengeSignal {
    ChallengeSignal {
        title_match: true,
        ..Default::default()
    }
}

pub fn ready(worker_id: &str, address: &str) -> WorkerEvent {
    WorkerEvent::Ready {
        worker_id: worker_id.to_string(),
        address: address.to_string(),
    }
}

pub fn page_status(worker_id: &str, address: &str, signal: ChallengeSignal) -> WorkerEvent {
    WorkerEvent::PageStatusChanged {
        worker_id: worker_id.to_string(),
        address: address.to_string(),
        status: signal.lifecycle(),
        challenge_info: signal,
    }
}

pub fn firewall_error(task_id: &str, worker_id: &str) -> WorkerEvent {
    WorkerEvent::TaskError {
        task_id: task_id.to_string(),
        worker_id: Some(worker_id.to_string()),
        error_type: "CLOUDFLARE_FIREWALL".to_string(),
        error: "Cloudflare firewall triggered".to_string(),
    }
}

pub fn task_response(task_id: &str, worker_id: &str, data: Value) -> WorkerEvent {
    WorkerEvent::TaskResponse {
        task_id: task_id.to_string(),
        worker_id: Some(worker_id.to_string()),
        data,
    }
}

// ==================== Worker Host ====================

#[derive(Debug)]
pub enum HostCall {
    Provision { address: String },
    Deliver { worker_id: WorkerId, command: WorkerCommand },
    Reset { worker_id: WorkerId },
}

/// Host that records every call and succeeds unless told otherwise.
/// Provisioned workers are named `tab-1`, `tab-2`, ...
#[derive(Debug)]
pub struct FakeHost {
    calls: mpsc::UnboundedSender<HostCall>,
    next_id: AtomicUsize,
    provision_fails: AtomicBool,
    delivery_fails: AtomicBool,
    reset_fails: AtomicBool,
    ack: Mutex<DeliveryAck>,
    live: Mutex<Vec<WorkerId>>,
    resets: AtomicUsize,
    deliveries: AtomicUsize,
}

impl FakeHost {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<HostCall>) {
        let (calls, rx) = mpsc::unbounded_channel();
        let host = Self {
            calls,
            next_id: AtomicUsize::new(1),
            provision_fails: AtomicBool::new(false),
            delivery_fails: AtomicBool::new(false),
            reset_fails: AtomicBool::new(false),
            ack: Mutex::new(DeliveryAck::accepted()),
            live: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
            deliveries: AtomicUsize::new(0),
        };
        (Arc::new(host), rx)
    }

    pub fn fail_provision(&self, fail: bool) {
        self.provision_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delivery(&self, fail: bool) {
        self.delivery_fails.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reset(&self, fail: bool) {
        self.reset_fails.store(fail, Ordering::SeqCst);
    }

    pub fn set_ack(&self, ack: DeliveryAck) {
        *self.ack.lock().unwrap() = ack;
    }

    pub fn set_live(&self, live: Vec<WorkerId>) {
        *self.live.lock().unwrap() = live;
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn deliveries(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkerHost for FakeHost {
    async fn provision(&self, address: &str) -> Result<WorkerId> {
        let _ = self.calls.send(HostCall::Provision {
            address: address.to_string(),
        });
        if self.provision_fails.load(Ordering::SeqCst) {
            bail!("browser refused to open a tab");
        }
        let id = format!("tab-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.live.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn deliver(&self, worker_id: &WorkerId, command: WorkerCommand) -> Result<DeliveryAck> {
        self.deliveries.fetch_add(1, Ordering::SeqCst);
        let _ = self.calls.send(HostCall::Deliver {
            worker_id: worker_id.clone(),
            command,
        });
        if self.delivery_fails.load(Ordering::SeqCst) {
            bail!("worker channel closed");
        }
        Ok(self.ack.lock().unwrap().clone())
    }

    async fn hard_reset(&self, worker_id: &WorkerId) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        let _ = self.calls.send(HostCall::Reset {
            worker_id: worker_id.clone(),
        });
        if self.reset_fails.load(Ordering::SeqCst) {
            bail!("tab crashed during reload");
        }
        Ok(())
    }

    async fn live_workers(&self) -> Result<Vec<WorkerId>> {
        Ok(self.live.lock().unwrap().clone())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

// ==================== Control Plane ====================

/// Coordinator side of an in-memory link
#[derive(Debug)]
pub struct Remote {
    pub to_agent: mpsc::UnboundedSender<String>,
    pub from_agent: mpsc::UnboundedReceiver<String>,
}

impl Remote {
    pub fn send(&self, frame: Value) {
        self.send_text(&frame.to_string());
    }

    pub fn send_text(&self, text: &str) {
        self.to_agent
            .send(text.to_string())
            .expect("agent side of the link is gone");
    }

    /// Next frame of any type, including pings
    pub async fn next_raw(&mut self) -> Value {
        self.try_next_raw(WAIT)
            .await
            .expect("no frame from agent")
    }

    /// `None` when nothing arrives within `within` or the link closed
    pub async fn try_next_raw(&mut self, within: Duration) -> Option<Value> {
        match tokio::time::timeout(within, self.from_agent.recv()).await {
            Ok(Some(text)) => Some(serde_json::from_str(&text).expect("agent sent invalid JSON")),
            _ => None,
        }
    }

    /// Next non-ping frame
    pub async fn next_frame(&mut self) -> Value {
        self.try_next_frame(WAIT)
            .await
            .expect("no frame from agent")
    }

    pub async fn try_next_frame(&mut self, within: Duration) -> Option<Value> {
        self.try_next_of(within, |frame| frame["type"] != "ping").await
    }

    /// Next `task-response`, skipping pings and `page-status`
    pub async fn next_task_response(&mut self) -> Value {
        self.try_next_task_response(WAIT)
            .await
            .expect("no task-response from agent")
    }

    pub async fn try_next_task_response(&mut self, within: Duration) -> Option<Value> {
        self.try_next_of(within, |frame| frame["type"] == "task-response")
            .await
    }

    async fn try_next_of(&mut self, within: Duration, wanted: impl Fn(&Value) -> bool) -> Option<Value> {
        let deadline = Instant::now() + within;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            let frame = self.try_next_raw(left).await?;
            if wanted(&frame) {
                return Some(frame);
            }
        }
    }
}

/// Dialer handing out in-memory links. Keeps no clone of the agent's ends,
/// so dropping a [`Remote`] closes the link for the agent.
#[derive(Debug)]
pub struct MemoryDialer {
    accepted: mpsc::UnboundedSender<Remote>,
    refuse: AtomicUsize,
    dials: Mutex<Vec<Instant>>,
}

impl MemoryDialer {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Remote>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let dialer = Self {
            accepted,
            refuse: AtomicUsize::new(0),
            dials: Mutex::new(Vec::new()),
        };
        (Arc::new(dialer), rx)
    }

    /// Refuse the next `n` dials
    pub fn refuse_next(&self, n: usize) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    pub fn dial_times(&self) -> Vec<Instant> {
        self.dials.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dialer for MemoryDialer {
    async fn dial(&self, _url: &str) -> Result<Link> {
        self.dials.lock().unwrap().push(Instant::now());
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            bail!("connection refused");
        }

        let (outgoing, from_agent) = mpsc::unbounded_channel();
        let (to_agent, incoming) = mpsc::unbounded_channel();
        let _ = self.accepted.send(Remote {
            to_agent,
            from_agent,
        });
        Ok(Link { outgoing, incoming })
    }
}

/// Upstream that records what it accepts
#[derive(Debug, Default)]
pub struct RecordingUpstream {
    open: bool,
    pub sent: Vec<OutboundFrame>,
}

impl RecordingUpstream {
    pub fn open() -> Self {
        Self {
            open: true,
            sent: Vec::new(),
        }
    }

    pub fn set_open(&mut self, open: bool) {
        self.open = open;
    }

    /// `data` of every task-response sent for `task_id`
    pub fn task_responses(&self, task_id: &str) -> Vec<Value> {
        self.sent
            .iter()
            .filter_map(|frame| match frame {
                OutboundFrame::TaskResponse { task_id: id, data } if id == task_id => {
                    Some(data.clone())
                }
                _ => None,
            })
            .collect()
    }
}

impl Upstream for RecordingUpstream {
    fn send(&mut self, frame: &OutboundFrame) -> bool {
        if !self.open {
            return false;
        }
        self.sent.push(frame.clone());
        true
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

// ==================== Harness ====================

/// A running agent wired to a [`FakeHost`] and a [`MemoryDialer`]
pub struct Harness {
    pub host: Arc<FakeHost>,
    pub dialer: Arc<MemoryDialer>,
    pub handle: AgentHandle,
    calls: mpsc::UnboundedReceiver<HostCall>,
    accepted: mpsc::UnboundedReceiver<Remote>,
    worker_events: WorkerEventSender,
    cancel: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl Harness {
    pub async fn start_with(
        config: AgentConfig,
        store: Arc<dyn StateStore>,
        live: Vec<WorkerId>,
    ) -> Self {
        let (host, calls) = FakeHost::new();
        host.set_live(live);
        let (dialer, accepted) = MemoryDialer::new();
        let (worker_events, worker_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let (agent, handle) = Agent::init(
            config,
            host.clone(),
            store,
            dialer.clone(),
            worker_rx,
            cancel.clone(),
        )
        .await
        .expect("agent init failed");
        let task = tokio::spawn(agent.run());

        Self {
            host,
            dialer,
            handle,
            calls,
            accepted,
            worker_events,
            cancel,
            task,
        }
    }

    /// Start an agent and wait for its `register` handshake
    pub async fn connected(config: AgentConfig) -> (Self, Remote) {
        Self::connected_with(config, Arc::new(MemoryStore::new()), Vec::new()).await
    }

    pub async fn connected_with(
        config: AgentConfig,
        store: Arc<dyn StateStore>,
        live: Vec<WorkerId>,
    ) -> (Self, Remote) {
        let mut harness = Self::start_with(config, store, live).await;
        let mut remote = harness.accept().await;
        let register = remote.next_raw().await;
        assert_eq!(register["type"], "register");
        (harness, remote)
    }

    pub async fn accept(&mut self) -> Remote {
        tokio::time::timeout(WAIT, self.accepted.recv())
            .await
            .expect("agent never dialed")
            .expect("dialer dropped")
    }

    pub fn report(&self, event: WorkerEvent) {
        self.worker_events
            .send(event)
            .expect("agent stopped listening to workers");
    }

    /// Report a ready worker and wait until the agent has published it
    pub async fn seed_worker(&mut self, remote: &mut Remote, worker_id: &str, address: &str) {
        self.report(ready(worker_id, address));
        let status = remote.next_frame().await;
        assert_eq!(status["type"], "page-status");
        assert_eq!(status["data"]["status"], "idle");
    }

    pub async fn next_call(&mut self) -> HostCall {
        tokio::time::timeout(WAIT, self.calls.recv())
            .await
            .expect("no host call")
            .expect("host dropped")
    }

    pub async fn expect_provision(&mut self) -> String {
        match self.next_call().await {
            HostCall::Provision { address } => address,
            other => panic!("expected provision, got {:?}", other),
        }
    }

    pub async fn expect_delivery(&mut self) -> (WorkerId, WorkerCommand) {
        match self.next_call().await {
            HostCall::Deliver { worker_id, command } => (worker_id, command),
            other => panic!("expected delivery, got {:?}", other),
        }
    }

    pub async fn expect_reset(&mut self) -> WorkerId {
        match self.next_call().await {
            HostCall::Reset { worker_id } => worker_id,
            other => panic!("expected reset, got {:?}", other),
        }
    }

    pub async fn expect_no_call(&mut self, within: Duration) {
        if let Ok(Some(call)) = tokio::time::timeout(within, self.calls.recv()).await {
            panic!("unexpected host call {:?}", call);
        }
    }

    /// Cancel the agent and wait for it to finish its shutdown
    pub async fn stop(self) {
        self.cancel.cancel();
        self.task
            .await
            .expect("agent task panicked")
            .expect("agent returned an error");
    }
}
