use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempo_core::{Identity, Message, SyncConfig};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::connector::{Connector, Link};
use crate::dispatcher::EventDispatcher;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    Connecting,
    Open,
    Reconnecting,
    /// Retries exhausted. Only a manual `connect` leaves this state.
    Fatal,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Reconnecting => "reconnecting",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the logical connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub url: Option<String>,
    pub state: ConnectionState,
    /// Retries scheduled since the last successful open.
    pub reconnect_attempts: u32,
    /// Delay of the most recently scheduled retry.
    pub backoff: Duration,
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        Self {
            url: None,
            state: ConnectionState::Closed,
            reconnect_attempts: 0,
            backoff: Duration::ZERO,
        }
    }
}

/// `{base}/ws/{user_id}`.
pub fn endpoint_url(ws_base_url: &str, user_id: &str) -> String {
    format!("{}/ws/{}", ws_base_url.trim_end_matches('/'), user_id)
}

struct Inner {
    info: ConnectionInfo,
    /// Bumped on every connect/disconnect; supervisors holding an older value
    /// no longer own the connection.
    generation: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Shared {
    /// Apply `f` if `generation` is still current. Returns false for a stale
    /// supervisor.
    fn update(&self, generation: u64, f: impl FnOnce(&mut ConnectionInfo)) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return false;
        }
        let before = inner.info.state;
        f(&mut inner.info);
        if inner.info.state != before {
            self.state_tx.send_replace(inner.info.state);
        }
        true
    }
}

struct ActiveConnection {
    cancel: CancellationToken,
    outbound: mpsc::Sender<String>,
}

/// Owns one logical realtime connection and keeps it alive.
///
/// A single supervisor task per `connect` performs connection attempts
/// serially, pumps frames while open, and schedules retries with
/// [`BackoffPolicy`]. Inbound frames are handed to the [`EventDispatcher`].
pub struct TransportManager {
    connector: Arc<dyn Connector>,
    policy: BackoffPolicy,
    ws_base_url: String,
    heartbeat: Option<Duration>,
    queue_capacity: usize,
    dispatcher: Arc<EventDispatcher>,
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveConnection>>,
}

impl TransportManager {
    pub fn new(connector: Arc<dyn Connector>, config: &SyncConfig) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Closed);
        Self {
            connector,
            policy: BackoffPolicy::from_config(config),
            ws_base_url: config.ws_base_url.clone(),
            heartbeat: config.heartbeat_interval(),
            queue_capacity: config.send_queue_capacity,
            dispatcher: Arc::new(EventDispatcher::new()),
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    info: ConnectionInfo::default(),
                    generation: 0,
                }),
                state_tx,
            }),
            active: Mutex::new(None),
        }
    }

    pub fn dispatcher(&self) -> &Arc<EventDispatcher> {
        &self.dispatcher
    }

    /// Open the connection for `identity`. No-op while a connection is
    /// already open or being (re)established. Must be called inside a tokio
    /// runtime.
    pub fn connect(&self, identity: &Identity) {
        let mut active = self.active.lock();
        let url = endpoint_url(&self.ws_base_url, &identity.user_id);

        let generation = {
            let mut inner = self.shared.inner.lock();
            match inner.info.state {
                ConnectionState::Connecting
                | ConnectionState::Open
                | ConnectionState::Reconnecting => {
                    debug!(state = %inner.info.state, "connect ignored, connection already active");
                    return;
                }
                ConnectionState::Closed | ConnectionState::Fatal => {}
            }
            inner.generation += 1;
            inner.info = ConnectionInfo {
                url: Some(url.clone()),
                state: ConnectionState::Connecting,
                reconnect_attempts: 0,
                backoff: Duration::ZERO,
            };
            self.shared.state_tx.send_replace(ConnectionState::Connecting);
            inner.generation
        };

        if let Some(old) = active.take() {
            old.cancel.cancel();
        }

        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::channel(self.queue_capacity);
        let supervisor = Supervisor {
            connector: Arc::clone(&self.connector),
            policy: self.policy.clone(),
            url,
            heartbeat: self.heartbeat,
            dispatcher: Arc::clone(&self.dispatcher),
            shared: Arc::clone(&self.shared),
            generation,
            cancel: cancel.clone(),
        };
        tokio::spawn(supervisor.run(outbound_rx));

        *active = Some(ActiveConnection {
            cancel,
            outbound: outbound_tx,
        });
    }

    /// Tear down the connection, cancel any pending retry and drop all
    /// subscriptions. Safe from any state.
    pub fn disconnect(&self) {
        let mut active = self.active.lock();
        if let Some(conn) = active.take() {
            conn.cancel.cancel();
        }
        {
            let mut inner = self.shared.inner.lock();
            inner.generation += 1;
            let was = inner.info.state;
            inner.info.state = ConnectionState::Closed;
            inner.info.reconnect_attempts = 0;
            inner.info.backoff = Duration::ZERO;
            if was != ConnectionState::Closed {
                self.shared.state_tx.send_replace(ConnectionState::Closed);
                info!(from = %was, "disconnected");
            }
        }
        self.dispatcher.clear();
    }

    /// Queue `message` for sending. Returns false when the frame was dropped
    /// (not open, queue full, or unencodable).
    pub fn send(&self, message: &Message) -> bool {
        let state = self.state();
        if state != ConnectionState::Open {
            debug!(topic = %message.topic, state = %state, "dropping outbound frame, not open");
            return false;
        }
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(topic = %message.topic, error = %err, "failed to encode outbound frame");
                return false;
            }
        };
        let active = self.active.lock();
        let Some(conn) = active.as_ref() else {
            return false;
        };
        match conn.outbound.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!(
                    topic = %message.topic,
                    frame_len = frame.len(),
                    "send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.inner.lock().info.state
    }

    pub fn info(&self) -> ConnectionInfo {
        self.shared.inner.lock().info.clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }
}

impl Drop for TransportManager {
    fn drop(&mut self) {
        if let Some(conn) = self.active.get_mut().take() {
            conn.cancel.cancel();
        }
    }
}

struct Supervisor {
    connector: Arc<dyn Connector>,
    policy: BackoffPolicy,
    url: String,
    heartbeat: Option<Duration>,
    dispatcher: Arc<EventDispatcher>,
    shared: Arc<Shared>,
    generation: u64,
    cancel: CancellationToken,
}

enum PumpEnd {
    Cancelled,
    Lost(String),
}

enum Step {
    Inbound(String),
    Outbound(String),
    Heartbeat,
    Lost(String),
    Cancelled,
}

impl Supervisor {
    async fn run(self, mut outbound: mpsc::Receiver<String>) {
        // Retries scheduled since the last open; drives the backoff exponent.
        let mut attempts: u32 = 0;
        // Consecutive failed connect calls, the first one included.
        let mut failures: u32 = 0;
        loop {
            if !self.shared.update(self.generation, |i| i.state = ConnectionState::Connecting) {
                return;
            }

            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                r = self.connector.connect(&self.url) => r,
            };

            match result {
                Ok(mut link) => {
                    let opened = !self.cancel.is_cancelled()
                        && self.shared.update(self.generation, |i| {
                            i.state = ConnectionState::Open;
                            i.reconnect_attempts = 0;
                            i.backoff = Duration::ZERO;
                        });
                    if !opened {
                        link.close().await;
                        return;
                    }
                    attempts = 0;
                    failures = 0;
                    info!(url = %self.url, "realtime connection open");

                    match self.pump(link.as_mut(), &mut outbound).await {
                        PumpEnd::Cancelled => {
                            link.close().await;
                            return;
                        }
                        PumpEnd::Lost(reason) => {
                            warn!(url = %self.url, reason = %reason, "realtime connection lost");
                        }
                    }
                    // Frames queued for the dead link are not replayed.
                    let mut dropped = 0usize;
                    while outbound.try_recv().is_ok() {
                        dropped += 1;
                    }
                    if dropped > 0 {
                        debug!(dropped, "discarded queued frames after connection loss");
                    }
                }
                Err(err) => {
                    failures += 1;
                    warn!(url = %self.url, failures, error = %err, "connect attempt failed");
                }
            }

            if self.policy.exhausted(failures) {
                self.shared.update(self.generation, |i| i.state = ConnectionState::Fatal);
                error!(
                    url = %self.url,
                    max_attempts = self.policy.max_attempts,
                    "reconnect attempts exhausted"
                );
                return;
            }

            let delay = self.policy.delay_for(attempts);
            let scheduled = self.shared.update(self.generation, |i| {
                i.state = ConnectionState::Reconnecting;
                i.reconnect_attempts = attempts;
                i.backoff = delay;
            });
            if !scheduled {
                return;
            }
            debug!(
                attempt = attempts + 1,
                delay_ms = delay.as_millis() as u64,
                "scheduling reconnect"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            attempts += 1;
            self.shared.update(self.generation, |i| i.reconnect_attempts = attempts);
        }
    }

    async fn pump(&self, link: &mut dyn Link, outbound: &mut mpsc::Receiver<String>) -> PumpEnd {
        let mut heartbeat = self.heartbeat.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Step::Cancelled,
                frame = link.recv() => match frame {
                    Some(Ok(text)) => Step::Inbound(text),
                    Some(Err(err)) => Step::Lost(err.to_string()),
                    None => Step::Lost("closed by peer".into()),
                },
                out = outbound.recv() => match out {
                    Some(text) => Step::Outbound(text),
                    None => Step::Cancelled,
                },
                _ = next_heartbeat(&mut heartbeat) => Step::Heartbeat,
            };

            match step {
                Step::Inbound(text) => {
                    // Malformed frames are logged by the dispatcher and dropped.
                    let _ = self.dispatcher.dispatch_frame(&text);
                }
                Step::Outbound(text) => {
                    if let Err(err) = link.send_text(text).await {
                        return PumpEnd::Lost(err.to_string());
                    }
                }
                Step::Heartbeat => {
                    if let Err(err) = link.ping().await {
                        return PumpEnd::Lost(err.to_string());
                    }
                    tracing::trace!(url = %self.url, "sent ping");
                }
                Step::Lost(reason) => return PumpEnd::Lost(reason),
                Step::Cancelled => return PumpEnd::Cancelled,
            }
        }
    }
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::{Callback, CallbackResult};
    use crate::mock::{ConnectStep, ScriptedConnector};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config(max_attempts: u32) -> SyncConfig {
        SyncConfig {
            ws_base_url: "ws://example.test/".into(),
            max_attempts,
            jitter_ms: 0,
            heartbeat_interval_ms: 0,
            ..SyncConfig::default()
        }
    }

    fn manager(
        steps: Vec<ConnectStep>,
        config: &SyncConfig,
    ) -> (TransportManager, Arc<ScriptedConnector>) {
        let connector = Arc::new(ScriptedConnector::new(steps));
        let manager = TransportManager::new(connector.clone(), config);
        (manager, connector)
    }

    async fn wait_for(manager: &TransportManager, state: ConnectionState) {
        let mut rx = manager.watch_state();
        rx.wait_for(|s| *s == state).await.unwrap();
    }

    #[test]
    fn endpoint_url_joins_user_path() {
        assert_eq!(endpoint_url("ws://localhost:8000", "7"), "ws://localhost:8000/ws/7");
        assert_eq!(endpoint_url("ws://localhost:8000/", "7"), "ws://localhost:8000/ws/7");
    }

    #[tokio::test(start_paused = true)]
    async fn connect_opens_and_dispatches_inbound_frames() {
        let (step, inbound) = ConnectStep::open();
        let (manager, connector) = manager(vec![step], &config(5));

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let cb: Callback = Arc::new(move |_: &Message| -> CallbackResult {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        manager.dispatcher().subscribe("timer_update", cb);

        manager.connect(&Identity::new("42"));
        wait_for(&manager, ConnectionState::Open).await;
        assert_eq!(connector.urls(), vec!["ws://example.test/ws/42".to_string()]);

        inbound
            .send(r#"{"type":"timer_update","payload":{},"serverTimestamp":"2026-01-01T00:00:00Z"}"#.into())
            .unwrap();
        inbound.send("not json".into()).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_is_idempotent_while_active() {
        let (step, _inbound) = ConnectStep::open();
        let (manager, connector) = manager(vec![step], &config(5));
        let identity = Identity::new("1");

        manager.connect(&identity);
        manager.connect(&identity);
        wait_for(&manager, ConnectionState::Open).await;
        manager.connect(&identity);
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(connector.call_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausting_retries_goes_fatal_without_further_attempts() {
        let steps = vec![
            ConnectStep::open_then_drop(vec![]),
            ConnectStep::fail("refused"),
            ConnectStep::fail("refused"),
            ConnectStep::fail("refused"),
            ConnectStep::fail("refused"),
            ConnectStep::fail("refused"),
        ];
        let (manager, connector) = manager(steps, &config(5));

        manager.connect(&Identity::new("1"));
        wait_for(&manager, ConnectionState::Fatal).await;
        assert_eq!(connector.call_count(), 6);
        assert_eq!(manager.info().reconnect_attempts, 5);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.call_count(), 6, "no attempt after Fatal");
        assert_eq!(manager.state(), ConnectionState::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn five_failed_connects_from_a_fresh_start_go_fatal() {
        let steps = (0..5).map(|_| ConnectStep::fail("refused")).collect();
        let (manager, connector) = manager(steps, &config(5));

        manager.connect(&Identity::new("1"));
        wait_for(&manager, ConnectionState::Fatal).await;
        assert_eq!(connector.call_count(), 5);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(connector.call_count(), 5, "sixth attempt never scheduled");
        assert_eq!(manager.state(), ConnectionState::Fatal);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_connect_from_fatal_resets_attempts() {
        let (manager, connector) = manager(vec![ConnectStep::fail("down")], &config(1));
        let identity = Identity::new("1");

        manager.connect(&identity);
        wait_for(&manager, ConnectionState::Fatal).await;
        assert_eq!(connector.call_count(), 1);

        let (step, _inbound) = ConnectStep::open();
        connector.push(step);
        manager.connect(&identity);
        assert_eq!(manager.info().reconnect_attempts, 0);
        wait_for(&manager, ConnectionState::Open).await;
        assert_eq!(connector.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_after_drop_resets_attempts_on_open() {
        let (step, _inbound) = ConnectStep::open();
        let steps = vec![
            ConnectStep::open_then_drop(vec![]),
            ConnectStep::fail("refused"),
            step,
        ];
        let (manager, connector) = manager(steps, &config(5));

        manager.connect(&Identity::new("1"));
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(connector.call_count(), 3);
        let info = manager.info();
        assert_eq!(info.state, ConnectionState::Open);
        assert_eq!(info.reconnect_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_delays_grow_between_attempts() {
        let steps = vec![ConnectStep::fail("a"), ConnectStep::fail("b")];
        let (manager, _connector) = manager(steps, &config(5));
        manager.connect(&Identity::new("1"));

        let mut rx = manager.watch_state();
        rx.wait_for(|s| *s == ConnectionState::Reconnecting).await.unwrap();
        assert_eq!(manager.info().backoff, Duration::from_millis(1000));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        let info = manager.info();
        assert_eq!(info.state, ConnectionState::Reconnecting);
        assert_eq!(info.backoff, Duration::from_millis(2000));
        assert_eq!(info.reconnect_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_retry_and_clears_subscriptions() {
        let (manager, connector) = manager(vec![ConnectStep::fail("refused")], &config(5));
        let cb: Callback = Arc::new(|_: &Message| -> CallbackResult { Ok(()) });
        manager.dispatcher().subscribe("timer_update", cb);

        manager.connect(&Identity::new("1"));
        let mut rx = manager.watch_state();
        rx.wait_for(|s| *s == ConnectionState::Reconnecting).await.unwrap();

        manager.disconnect();
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(manager.dispatcher().subscriber_count("timer_update"), 0);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.call_count(), 1);
        assert_eq!(manager.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn send_only_while_open() {
        let (step, _inbound) = ConnectStep::open();
        let (manager, connector) = manager(vec![step], &config(5));
        let message = Message::new("timer_update", json!({"status": "running"}));

        assert!(!manager.send(&message));

        manager.connect(&Identity::new("1"));
        wait_for(&manager, ConnectionState::Open).await;
        assert!(manager.send(&message));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sent = connector.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(Message::decode(&sent[0]).unwrap().topic, "timer_update");
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_pings_while_open() {
        let (step, _inbound) = ConnectStep::open();
        let config = SyncConfig {
            heartbeat_interval_ms: 30_000,
            ..config(5)
        };
        let (manager, connector) = manager(vec![step], &config);

        manager.connect(&Identity::new("1"));
        wait_for(&manager, ConnectionState::Open).await;
        tokio::time::sleep(Duration::from_secs(95)).await;
        assert_eq!(connector.ping_count(), 3);
    }
}
