//! Control-plane connection manager.
//!
//! Owns the single upstream channel. Dialing, socket pumps and the heartbeat
//! run in helper tasks; every state change happens on the agent loop through
//! the `on_*` handlers, which discard events from superseded links by
//! comparing generations.

use crate::backoff::Backoff;
use crate::context::{AgentContext, AgentEvent};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tab_relay_common::utils::now_millis;
use tab_relay_common::{FrameError, InboundFrame, OutboundFrame};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One established bidirectional text channel to the coordinator.
///
/// Dropping `outgoing` closes the link from our side; `incoming` yields
/// `None` once the peer is gone.
#[derive(Debug)]
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

/// Opens links to the coordinator
#[async_trait]
pub trait Dialer: Debug + Send + Sync {
    async fn dial(&self, url: &str) -> Result<Link>;
}

/// Anything the dispatcher can push frames into.
///
/// `send` never fails loudly: `false` means the frame was not accepted and the
/// caller decides whether to queue or drop it.
pub trait Upstream {
    fn send(&mut self, frame: &OutboundFrame) -> bool;
    fn is_open(&self) -> bool;
}

/// WebSocket transport over `tokio-tungstenite`
#[derive(Debug, Clone)]
pub struct WebSocketDialer {
    connect_timeout: Duration,
}

impl WebSocketDialer {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketDialer {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, url: &str) -> Result<Link> {
        let (socket, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url))
            .await
            .context("timed out connecting to control plane")?
            .context("control plane handshake failed")?;

        let (mut sink, mut stream) = socket.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let (incoming_tx, incoming) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    debug!("Control connection write failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        let text: &str = &text;
                        if incoming_tx.send(text.to_owned()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "Control plane closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Control connection read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Link { outgoing, incoming })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
}

pub struct ConnectionManager {
    ctx: AgentContext,
    dialer: Arc<dyn Dialer>,
    backoff: Backoff,
    state: ConnectionState,
    attempts: u32,
    session_id: Option<String>,
    // Bumped for every dial and every local close
    generation: u64,
    // Bumped to invalidate a scheduled reconnect
    reconnect_epoch: u64,
    reconnect_pending: bool,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    heartbeat: Option<CancellationToken>,
}

impl ConnectionManager {
    pub fn new(ctx: &AgentContext, dialer: Arc<dyn Dialer>) -> Self {
        Self {
            ctx: ctx.clone(),
            dialer,
            backoff: Backoff::from_millis(&ctx.config.backoff_ms),
            state: ConnectionState::Closed,
            attempts: 0,
            session_id: None,
            generation: 0,
            reconnect_epoch: 0,
            reconnect_pending: false,
            outgoing: None,
            heartbeat: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive reconnect attempts since the last successful open
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Start dialing. No-op while `Open` or `Connecting`.
    pub fn connect(&mut self) {
        if self.state != ConnectionState::Closed {
            debug!(state = ?self.state, "Connect requested while not closed, ignoring");
            return;
        }

        self.state = ConnectionState::Connecting;
        self.generation += 1;

        let generation = self.generation;
        let dialer = self.dialer.clone();
        let url = self.ctx.config.control_url.clone();
        info!(url = %url, attempt = self.attempts, "Connecting to control plane");

        self.ctx.spawn_call(async move {
            let result = dialer.dial(&url).await.map_err(|e| format!("{:#}", e));
            AgentEvent::LinkReady { generation, result }
        });
    }

    /// Outcome of a dial. Returns true when the connection is now open.
    pub fn on_link_ready(&mut self, generation: u64, result: Result<Link, String>) -> bool {
        if generation != self.generation || self.state != ConnectionState::Connecting {
            debug!(generation, "Discarding outcome of a superseded dial");
            return false;
        }

        match result {
            Ok(link) => {
                self.open(link);
                true
            }
            Err(reason) => {
                self.ctx
                    .journal
                    .warn(format!("Control connection failed: {}", reason));
                self.state = ConnectionState::Closed;
                self.schedule_reconnect();
                false
            }
        }
    }

    fn open(&mut self, link: Link) {
        let Link {
            outgoing,
            mut incoming,
        } = link;
        let generation = self.generation;

        self.state = ConnectionState::Open;
        self.attempts = 0;
        self.session_id = Some(Uuid::new_v4().to_string());
        self.ctx.metrics.connection_open.set(1);

        let events = self.ctx.event_sender();
        tokio::spawn(async move {
            while let Some(text) = incoming.recv().await {
                if events.send(AgentEvent::Frame { generation, text }).is_err() {
                    return;
                }
            }
            let _ = events.send(AgentEvent::LinkClosed {
                generation,
                reason: "connection closed by peer".to_string(),
            });
        });

        self.start_heartbeat(outgoing.clone());
        self.outgoing = Some(outgoing);

        self.ctx.journal.info(format!(
            "Connected to control plane as {}",
            self.ctx.client_id
        ));

        let register = OutboundFrame::Register {
            client_id: self.ctx.client_id.clone(),
            timestamp: now_millis(),
        };
        if !self.send(&register) {
            warn!("Failed to send register handshake");
        }
    }

    fn start_heartbeat(&mut self, outgoing: mpsc::UnboundedSender<String>) {
        let ping = match OutboundFrame::Ping.to_text() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode heartbeat frame: {}", e);
                return;
            }
        };

        let token = self.ctx.cancel_token().child_token();
        let period = self.ctx.config.heartbeat_interval;
        let stop = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => {
                        if outgoing.send(ping.clone()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        self.heartbeat = Some(token);
    }

    /// Inbound text frame from the link. `None` for frames of a dead link.
    pub fn on_frame(&self, generation: u64, text: &str) -> Option<Result<InboundFrame, FrameError>> {
        if generation != self.generation || self.state != ConnectionState::Open {
            debug!(generation, "Dropping frame from a superseded link");
            return None;
        }
        Some(InboundFrame::parse(text))
    }

    pub fn on_link_closed(&mut self, generation: u64, reason: &str) {
        if generation != self.generation || self.state != ConnectionState::Open {
            return;
        }
        self.close_current();
        self.ctx
            .journal
            .warn(format!("Control connection closed: {}", reason));
        self.schedule_reconnect();
    }

    fn close_current(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.cancel();
        }
        self.outgoing = None;
        self.session_id = None;
        self.state = ConnectionState::Closed;
        self.generation += 1;
        self.ctx.metrics.connection_open.set(0);
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_pending || self.ctx.is_shutting_down() {
            return;
        }

        let delay = self.backoff.delay(self.attempts);
        self.reconnect_pending = true;
        self.ctx.metrics.reconnect_attempts.inc();
        info!(
            attempt = self.attempts + 1,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.ctx.schedule(
            delay,
            AgentEvent::ReconnectDue {
                epoch: self.reconnect_epoch,
            },
        );
    }

    pub fn on_reconnect_due(&mut self, epoch: u64) {
        if epoch != self.reconnect_epoch {
            return;
        }
        self.reconnect_pending = false;
        if self.state != ConnectionState::Closed {
            return;
        }
        self.attempts = self.attempts.saturating_add(1);
        self.connect();
    }

    /// Drop whatever link exists, reset the backoff and dial immediately
    pub fn reconnect(&mut self) {
        self.ctx.journal.info("Manual reconnect requested");
        self.attempts = 0;
        self.reconnect_epoch += 1;
        self.reconnect_pending = false;
        if self.state != ConnectionState::Closed {
            self.close_current();
        }
        self.connect();
    }

    pub fn shutdown(&mut self) {
        self.reconnect_epoch += 1;
        self.reconnect_pending = false;
        if self.state != ConnectionState::Closed {
            self.close_current();
        }
    }
}

impl Upstream for ConnectionManager {
    fn send(&mut self, frame: &OutboundFrame) -> bool {
        if self.state != ConnectionState::Open {
            return false;
        }
        let Some(outgoing) = &self.outgoing else {
            return false;
        };
        match frame.to_text() {
            Ok(text) => outgoing.send(text).is_ok(),
            Err(e) => {
                error!(kind = frame.kind(), "Failed to encode frame: {}", e);
                false
            }
        }
    }

    fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AgentEventReceiver;
    use crate::testing::{test_config, FakeHost, MemoryDialer};
    use serde_json::Value;
    use tab_relay_common::MemoryStore;
    use tokio::time::Instant;

    fn manager() -> (
        ConnectionManager,
        AgentEventReceiver,
        Arc<MemoryDialer>,
        mpsc::UnboundedReceiver<crate::testing::Remote>,
    ) {
        let (host, _calls) = FakeHost::new();
        let (ctx, events) = AgentContext::init(
            test_config(),
            host,
            Arc::new(MemoryStore::new()),
            CancellationToken::new(),
        )
        .unwrap();
        let (dialer, accepted) = MemoryDialer::new();
        (ConnectionManager::new(&ctx, dialer.clone()), events, dialer, accepted)
    }

    /// Feed connection events back into the manager until `until` holds
    async fn pump(
        manager: &mut ConnectionManager,
        events: &mut AgentEventReceiver,
        until: impl Fn(&ConnectionManager) -> bool,
    ) {
        while !until(manager) {
            let event = tokio::time::timeout(Duration::from_secs(120), events.recv())
                .await
                .expect("no connection event")
                .expect("event channel closed");
            match event {
                AgentEvent::LinkReady { generation, result } => {
                    manager.on_link_ready(generation, result);
                }
                AgentEvent::LinkClosed { generation, reason } => {
                    manager.on_link_closed(generation, &reason);
                }
                AgentEvent::ReconnectDue { epoch } => manager.on_reconnect_due(epoch),
                AgentEvent::Frame { .. } => {}
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    // ==================== Connect Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent_and_registers() {
        let (mut manager, mut events, dialer, mut accepted) = manager();

        manager.connect();
        manager.connect();
        assert_eq!(manager.state(), ConnectionState::Connecting);

        pump(&mut manager, &mut events, |m| m.state() == ConnectionState::Open).await;
        manager.connect();

        assert_eq!(dialer.dial_times().len(), 1);
        assert!(manager.session_id().is_some());

        let mut remote = accepted.recv().await.unwrap();
        let register = remote.next_frame().await;
        assert_eq!(register["type"], "register");
        assert!(register["clientId"]
            .as_str()
            .unwrap()
            .starts_with("relay_"));
        assert!(register["timestamp"].as_u64().unwrap() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_fails_silently_when_closed() {
        let (mut manager, _events, _dialer, _accepted) = manager();
        assert!(!manager.is_open());
        assert!(!manager.send(&OutboundFrame::Ping));
    }

    // ==================== Heartbeat Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_every_period_and_stops_on_close() {
        let (mut manager, mut events, _dialer, mut accepted) = manager();
        manager.connect();
        pump(&mut manager, &mut events, |m| m.state() == ConnectionState::Open).await;

        let mut remote = accepted.recv().await.unwrap();
        let opened_at = Instant::now();
        assert_eq!(remote.next_raw().await["type"], "register");

        assert_eq!(remote.next_raw().await["type"], "ping");
        assert_eq!(opened_at.elapsed(), Duration::from_secs(10));
        assert_eq!(remote.next_raw().await["type"], "ping");
        assert_eq!(opened_at.elapsed(), Duration::from_secs(20));

        manager.reconnect();
        // The old link's writer side is dropped: no more frames on it
        let rest: Option<Value> = remote.try_next_raw(Duration::from_secs(30)).await;
        assert!(rest.is_none());
    }

    // ==================== Backoff Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_backoff_monotonic_and_reset_after_open() {
        let (mut manager, mut events, dialer, mut accepted) = manager();
        dialer.refuse_next(6);

        manager.connect();
        pump(&mut manager, &mut events, |m| m.state() == ConnectionState::Open).await;
        assert_eq!(manager.attempts(), 0);

        let times = dialer.dial_times();
        assert_eq!(times.len(), 7);
        let gaps: Vec<Duration> = times.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::ZERO,
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(3),
            ]
        );
        assert!(gaps.windows(2).all(|w| w[0] <= w[1]));

        // Remote drops the link: the next delay starts from the table head again
        let remote = accepted.recv().await.unwrap();
        let dropped_at = Instant::now();
        drop(remote);
        pump(&mut manager, &mut events, |m| {
            m.state() == ConnectionState::Open && m.generation > 7
        })
        .await;
        let times = dialer.dial_times();
        assert_eq!(times.len(), 8);
        assert_eq!(times[7] - dropped_at, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_resets_attempts() {
        let (mut manager, mut events, dialer, _accepted) = manager();
        dialer.refuse_next(5);
        manager.connect();
        pump(&mut manager, &mut events, |m| {
            m.attempts() >= 3 && m.state() == ConnectionState::Closed
        })
        .await;
        assert!(manager.reconnect_pending);

        manager.reconnect();
        assert_eq!(manager.attempts(), 0);
        pump(&mut manager, &mut events, |m| m.state() == ConnectionState::Open).await;

        // The reconnect that was scheduled before the manual one never fires
        let dials = dialer.dial_times().len();
        tokio::time::sleep(Duration::from_secs(30)).await;
        while let Ok(event) = events.try_recv() {
            if let AgentEvent::ReconnectDue { epoch } = event {
                manager.on_reconnect_due(epoch);
            }
        }
        assert_eq!(dialer.dial_times().len(), dials);
        assert_eq!(manager.state(), ConnectionState::Open);
    }
}
