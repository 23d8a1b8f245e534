//! Connection lifecycle: state machine, heartbeat, reconnect loop.
//!
//! One [`ConnectionManager`] owns one logical duplex connection to the
//! messaging server. Transport errors and abnormal closes both route to a
//! single retry loop guarded by a mutual-exclusion flag on the instance, so
//! overlapping failure events never spawn a second timer. Liveness is
//! inferred only from the absence of transport errors: keep-alives are sent
//! on a fixed interval but there is no pong tracking, so a silently stalled
//! link is not proactively detected.

pub mod transport;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use self::transport::{Conn, Connector};

/// Transport lifecycle state, owned exclusively by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

/// Events emitted to collaborators (timeline merger, presence display).
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Open,
    /// Raw server-pushed frame, fed to the timeline merger.
    Message(String),
    Closed,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub heartbeat_interval: Duration,
    /// Fixed retry cadence; no backoff, no attempt cap.
    pub retry_interval: Duration,
    pub keepalive_frame: String,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            retry_interval: Duration::from_secs(5),
            keepalive_frame: r#"{"event":"ping"}"#.to_string(),
        }
    }
}

struct Shared {
    state: ConnectionState,
    /// Sole arbiter of the retry loop: set while a loop is active, cleared
    /// only on reaching `Open` or explicit cancellation.
    retry_active: bool,
    retry_loops_started: u32,
    auth_token: Option<String>,
    session: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

struct Inner<C: Connector> {
    connector: C,
    config: ConnectionConfig,
    shared: Mutex<Shared>,
    events: broadcast::Sender<ConnectionEvent>,
}

/// Owns the transport lifecycle for one logical connection.
pub struct ConnectionManager<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for ConnectionManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(connector: C, config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                shared: Mutex::new(Shared {
                    state: ConnectionState::Idle,
                    retry_active: false,
                    retry_loops_started: 0,
                    auth_token: None,
                    session: None,
                    retry: None,
                }),
                events,
            }),
        }
    }

    /// Begin one connection attempt. No-op while already `Connecting` or
    /// `Open`; during `Reconnecting` it cancels the retry loop and connects
    /// immediately with the fresh token.
    pub fn open(&self, auth_token: &str) {
        let retry = {
            let mut shared = self.lock();
            match shared.state {
                ConnectionState::Connecting | ConnectionState::Open => return,
                _ => {}
            }
            let retry = shared.retry.take();
            shared.retry_active = false;
            shared.state = ConnectionState::Connecting;
            shared.auth_token = Some(auth_token.to_string());

            let this = self.clone();
            let token = auth_token.to_string();
            shared.session = Some(tokio::spawn(async move { this.run_session(token).await }));
            retry
        };
        if let Some(handle) = retry {
            handle.abort();
        }
    }

    /// Transition to `Closed`, cancelling the heartbeat and any pending retry
    /// timer. Idempotent; a fresh [`open`](Self::open) is required afterward.
    pub fn close(&self) {
        let (session, retry) = {
            let mut shared = self.lock();
            if shared.state == ConnectionState::Closed {
                return;
            }
            shared.state = ConnectionState::Closed;
            shared.retry_active = false;
            (shared.session.take(), shared.retry.take())
        };
        if let Some(handle) = session {
            handle.abort();
        }
        if let Some(handle) = retry {
            handle.abort();
        }
        let _ = self.inner.events.send(ConnectionEvent::Closed);
        tracing::info!("connection closed");
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    /// Number of retry loops ever started on this instance. Stays at one
    /// across any number of overlapping failure events during one outage.
    pub fn retry_loops_started(&self) -> u32 {
        self.lock().retry_loops_started
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    async fn run_session(self, token: String) {
        match self.inner.connector.connect(&token).await {
            Ok(conn) => {
                if !self.mark_open() {
                    return;
                }
                self.read_loop(conn).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "connection attempt failed");
                let _ = self
                    .inner
                    .events
                    .send(ConnectionEvent::Error(e.to_string()));
                self.schedule_reconnect();
            }
        }
    }

    /// Record a successful handshake. Returns false when the manager was
    /// closed while the attempt was in flight.
    fn mark_open(&self) -> bool {
        {
            let mut shared = self.lock();
            if shared.state == ConnectionState::Closed {
                return false;
            }
            shared.state = ConnectionState::Open;
            shared.retry_active = false;
        }
        let _ = self.inner.events.send(ConnectionEvent::Open);
        tracing::info!("connection open");
        true
    }

    /// Pump frames and heartbeats until the connection drops, then hand off
    /// to the reconnect path.
    async fn read_loop(&self, mut conn: C::Conn) {
        let mut heartbeat = tokio::time::interval(self.inner.config.heartbeat_interval);
        heartbeat.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                frame = conn.recv_text() => {
                    match frame {
                        Ok(Some(text)) => {
                            let _ = self.inner.events.send(ConnectionEvent::Message(text));
                        }
                        Ok(None) => {
                            tracing::warn!("connection closed by server");
                            let _ = self.inner.events.send(ConnectionEvent::Closed);
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "transport receive error");
                            let _ = self.inner.events.send(ConnectionEvent::Error(e.to_string()));
                            break;
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = conn.send_text(&self.inner.config.keepalive_frame).await {
                        tracing::warn!(error = %e, "heartbeat send failed");
                        let _ = self.inner.events.send(ConnectionEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
        }

        conn.close().await;
        self.schedule_reconnect();
    }

    /// Route a failure to the single retry loop. A newly observed failure
    /// while already `Reconnecting` must not spawn a second loop; the flag is
    /// the sole arbiter.
    fn schedule_reconnect(&self) {
        let token = {
            let mut shared = self.lock();
            if shared.state == ConnectionState::Closed || shared.retry_active {
                return;
            }
            let token = match shared.auth_token.clone() {
                Some(token) => token,
                None => return,
            };
            shared.retry_active = true;
            shared.state = ConnectionState::Reconnecting;
            shared.retry_loops_started += 1;
            token
        };

        tracing::info!("scheduling reconnect");
        let this = self.clone();
        let handle = tokio::spawn(async move { this.retry_loop(token).await });
        self.lock().retry = Some(handle);
    }

    async fn retry_loop(self, token: String) {
        loop {
            tokio::time::sleep(self.inner.config.retry_interval).await;
            if self.state() == ConnectionState::Closed {
                return;
            }
            match self.inner.connector.connect(&token).await {
                Ok(conn) => {
                    if !self.mark_open() {
                        return;
                    }
                    self.read_loop(conn).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "reconnect attempt failed, retrying");
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use super::transport::{Conn, Connector};
    use crate::error::TransportError;

    pub(crate) struct FakeConn {
        queued: VecDeque<String>,
        sent: Arc<Mutex<Vec<String>>>,
    }

    impl Conn for FakeConn {
        async fn send_text(&mut self, text: &str) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn recv_text(&mut self) -> Result<Option<String>, TransportError> {
            if let Some(frame) = self.queued.pop_front() {
                return Ok(Some(frame));
            }
            // Stay open without producing frames.
            futures::future::pending().await
        }

        async fn close(&mut self) {}
    }

    /// Fails a scripted number of attempts, then hands out connections that
    /// replay `frames` and stay open.
    pub(crate) struct ScriptedConnector {
        failures_left: Mutex<u32>,
        attempts: Mutex<u32>,
        frames: Vec<String>,
        pub(crate) sent: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedConnector {
        pub(crate) fn new(failures: u32, frames: Vec<String>) -> Self {
            Self {
                failures_left: Mutex::new(failures),
                attempts: Mutex::new(0),
                frames,
                sent: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub(crate) fn attempts(&self) -> u32 {
            *self.attempts.lock().unwrap()
        }
    }

    impl Connector for ScriptedConnector {
        type Conn = FakeConn;

        async fn connect(&self, _auth_token: &str) -> Result<FakeConn, TransportError> {
            *self.attempts.lock().unwrap() += 1;
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(TransportError::Connect("scripted failure".to_string()));
            }
            Ok(FakeConn {
                queued: self.frames.clone().into(),
                sent: Arc::clone(&self.sent),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedConnector;
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig::default()
    }

    /// Build a manager with log capture wired up for failing runs
    /// (RUST_LOG-driven, same filter syntax as the application).
    fn manager(connector: ScriptedConnector) -> ConnectionManager<ScriptedConnector> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        ConnectionManager::new(connector, config())
    }

    /// Let spawned tasks run under paused time without reaching the first
    /// retry or heartbeat timer.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn open_reaches_open_and_is_noop_when_already_open() {
        let cm = manager(ScriptedConnector::new(0, vec![]));

        cm.open("tok");
        settle().await;
        assert_eq!(cm.state(), ConnectionState::Open);

        cm.open("tok");
        settle().await;
        assert_eq!(cm.inner.connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn overlapping_failures_start_exactly_one_retry_loop() {
        let cm = manager(ScriptedConnector::new(u32::MAX, vec![]));

        cm.open("tok");
        settle().await;
        assert_eq!(cm.state(), ConnectionState::Reconnecting);
        assert_eq!(cm.retry_loops_started(), 1);

        // Two more failure observations while already reconnecting.
        cm.schedule_reconnect();
        cm.schedule_reconnect();

        assert_eq!(cm.retry_loops_started(), 1);
        assert_eq!(cm.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_loop_reconnects_until_open() {
        let cm = manager(ScriptedConnector::new(2, vec![]));

        cm.open("tok");
        tokio::time::sleep(Duration::from_secs(20)).await;

        assert_eq!(cm.state(), ConnectionState::Open);
        assert_eq!(cm.retry_loops_started(), 1);
        assert_eq!(cm.inner.connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn close_cancels_retry_and_is_idempotent() {
        let cm = manager(ScriptedConnector::new(u32::MAX, vec![]));

        cm.open("tok");
        settle().await;
        assert_eq!(cm.state(), ConnectionState::Reconnecting);

        cm.close();
        cm.close();
        assert_eq!(cm.state(), ConnectionState::Closed);

        // No further attempts after the retry timer would have fired.
        let attempts = cm.inner.connector.attempts();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(cm.inner.connector.attempts(), attempts);
        assert_eq!(cm.retry_loops_started(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_open_after_close_connects_again() {
        let cm = manager(ScriptedConnector::new(0, vec![]));

        cm.open("tok");
        settle().await;
        cm.close();

        cm.open("tok2");
        settle().await;
        assert_eq!(cm.state(), ConnectionState::Open);
        assert_eq!(cm.inner.connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_is_sent_on_a_fixed_interval() {
        let cm = manager(ScriptedConnector::new(0, vec![]));

        cm.open("tok");
        tokio::time::sleep(Duration::from_secs(95)).await;

        let sent = cm.inner.connector.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 3); // ticks at 30s, 60s, 90s
        assert_eq!(sent[0], config().keepalive_frame);
    }

    #[tokio::test(start_paused = true)]
    async fn frames_are_emitted_as_message_events() {
        let cm = manager(ScriptedConnector::new(0, vec!["frame-1".to_string()]));
        let mut events = cm.subscribe();

        cm.open("tok");
        settle().await;

        assert!(matches!(events.recv().await, Ok(ConnectionEvent::Open)));
        match events.recv().await {
            Ok(ConnectionEvent::Message(text)) => assert_eq!(text, "frame-1"),
            other => panic!("expected message event, got {:?}", other),
        }
    }
}
