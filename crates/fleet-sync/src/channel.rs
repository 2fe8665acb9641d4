//! # Sync Channel
//!
//! One logical pub/sub session over an unreliable [`Transport`], with
//! automatic resubscription and reconnection.
//!
//! ```text
//!  DISCONNECTED ──connect()──▶ CONNECTING ──ok──▶ CONNECTED
//!        ▲                        │  ▲               │
//!        │ reset()           fail │  │ retry         │ error / close
//!        │                        ▼  │               ▼
//!     FAILED ◀──attempts > max── RECONNECTING ◀──────┘
//! ```
//!
//! Inbound messages are decoded on the driver task and queued on an
//! [`Inbox`]; the session loop drains the inbox on the same task that runs
//! ticks, so handlers never race with tick processing.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Result, TransportError};
use crate::message::{Destination, Envelope, SyncMessage, Topic};
use crate::transport::{Connection, Frame, Transport};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Exponential backoff: `min(base * 2^attempt, max)`, at most `max_attempts`
/// consecutive retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 10,
        }
    }
}

/// Channel tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// When false, `connect()` does nothing.
    pub enabled: bool,
    /// Outgoing heartbeat interval; the connection is declared dead after
    /// two intervals without any incoming frame.
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
    /// Wait after (re)connecting before asking for current state.
    pub settle_delay: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            heartbeat: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_millis(500),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// =============================================================================
// STATE
// =============================================================================

/// Connectivity as seen by the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Retry `attempt` scheduled after `delay`.
    Reconnecting { attempt: u32, delay: Duration },
    /// Gave up; only `reset()` leaves this state.
    Failed,
}

impl ConnectionState {
    /// True while a driver task owns the connection.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Reconnecting { .. }
        )
    }
}

/// A decoded message together with the topic it arrived on.
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub topic: Topic,
    pub envelope: Envelope,
}

/// Arrival-ordered queue of inbound messages for one session.
#[derive(Debug)]
pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl Inbox {
    /// Wait for the next message. `None` once the channel is dropped.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }

    /// Next message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Inbound> {
        self.rx.try_recv().ok()
    }
}

/// Receives inbound messages on the session loop.
pub trait MessageHandler {
    fn handle(&mut self, topic: Topic, envelope: Envelope);
}

#[derive(Debug, Default)]
struct Shared {
    topics: Vec<Topic>,
    outbound: Option<mpsc::Sender<Frame>>,
    attempts: u32,
}

struct ChannelCore {
    transport: Arc<dyn Transport>,
    config: ChannelConfig,
    shared: Mutex<Shared>,
    state: watch::Sender<ConnectionState>,
    inbox: mpsc::UnboundedSender<Inbound>,
}

// =============================================================================
// CHANNEL
// =============================================================================

/// Pub/sub session with automatic reconnect.
pub struct SyncChannel {
    core: Arc<ChannelCore>,
    driver: Option<JoinHandle<()>>,
}

impl SyncChannel {
    /// Create a disconnected channel and the inbox its messages land in.
    pub fn new(transport: Arc<dyn Transport>, config: ChannelConfig) -> (Self, Inbox) {
        let (inbox_tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        let core = Arc::new(ChannelCore {
            transport,
            config,
            shared: Mutex::new(Shared::default()),
            state,
            inbox: inbox_tx,
        });

        (Self { core, driver: None }, Inbox { rx })
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.core.config.enabled
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.core.state.borrow()
    }

    /// Watch connectivity changes (for a connectivity indicator).
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.core.state.subscribe()
    }

    /// Consecutive failed attempts since the last successful connect.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.core.lock().attempts
    }

    /// Start connecting. No-op when disabled, already active, or failed.
    pub fn connect(&mut self) {
        if !self.core.config.enabled {
            debug!("sync channel disabled, not connecting");
            return;
        }

        match self.state() {
            state if state.is_active() => {
                trace!(?state, "connect ignored, channel already active");
            }
            ConnectionState::Failed => {
                warn!("connect ignored, channel failed; reset required");
            }
            _ => {
                self.core.set_state(ConnectionState::Connecting);
                let core = self.core.clone();
                self.driver = Some(tokio::spawn(core.drive()));
            }
        }
    }

    /// Tear the connection down. Idempotent.
    pub fn disconnect(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
            info!("sync channel disconnected");
        }
        self.core.lock().outbound = None;
        self.core.set_state(ConnectionState::Disconnected);
    }

    /// Clear the attempt counter and return to `Disconnected`.
    pub fn reset(&mut self) {
        self.disconnect();
        self.core.lock().attempts = 0;
    }

    /// Register a topic. Survives reconnects.
    pub fn subscribe(&mut self, topic: Topic) {
        let outbound = {
            let mut shared = self.core.lock();
            if shared.topics.contains(&topic) {
                return;
            }
            shared.topics.push(topic);
            shared.outbound.clone()
        };

        if let Some(outbound) = outbound {
            if outbound.try_send(Frame::Subscribe(topic)).is_err() {
                // resubscribed on the next connect
                warn!(topic = topic.path(), "subscribe frame not sent");
            }
        }
    }

    /// Fire-and-forget publish.
    ///
    /// # Errors
    ///
    /// Fails locally when not connected or the outbound buffer is full. The
    /// message is never queued for a later retry.
    pub fn publish(&self, destination: Destination, message: SyncMessage) -> Result<()> {
        self.core.publish(destination, Envelope::stamped(message))
    }
}

impl Drop for SyncChannel {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

impl ChannelCore {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn publish(&self, destination: Destination, envelope: Envelope) -> Result<()> {
        let connected = *self.state.borrow() == ConnectionState::Connected;
        let outbound = match self.lock().outbound.clone() {
            Some(outbound) if connected => outbound,
            _ => {
                warn!(
                    destination = destination.path(),
                    kind = envelope.message.kind(),
                    "publish dropped, not connected"
                );
                return Err(TransportError::NotConnected);
            }
        };

        let body = envelope
            .encode()
            .map_err(|e| TransportError::Encode(e.to_string()))?;

        outbound
            .try_send(Frame::Send { destination, body })
            .map_err(|e| {
                let err = match e {
                    mpsc::error::TrySendError::Full(_) => TransportError::Backpressure,
                    mpsc::error::TrySendError::Closed(_) => TransportError::Closed,
                };
                warn!(destination = destination.path(), error = %err, "publish failed");
                err
            })
    }

    /// Connect, serve, and retry with backoff until success or exhaustion.
    async fn drive(self: Arc<Self>) {
        loop {
            self.set_state(ConnectionState::Connecting);

            match timeout(self.config.connect_timeout, self.transport.connect()).await {
                Ok(Ok(conn)) => {
                    self.lock().attempts = 0;
                    self.set_state(ConnectionState::Connected);
                    info!("sync channel connected");

                    let reason = self.serve(conn).await;
                    warn!(error = %reason, "sync connection lost");
                }
                Ok(Err(e)) => warn!(error = %e, "sync connect failed"),
                Err(_) => {
                    let err = TransportError::Timeout {
                        timeout_ms: u64::try_from(self.config.connect_timeout.as_millis())
                            .unwrap_or(u64::MAX),
                    };
                    warn!(error = %err, "sync connect failed");
                }
            }

            self.lock().outbound = None;

            let policy = self.config.reconnect;
            let attempt = {
                let mut shared = self.lock();
                if shared.attempts >= policy.max_attempts {
                    None
                } else {
                    shared.attempts += 1;
                    Some(shared.attempts)
                }
            };

            let Some(attempt) = attempt else {
                error!(
                    attempts = policy.max_attempts,
                    "sync channel giving up after repeated failures"
                );
                self.set_state(ConnectionState::Failed);
                return;
            };

            let delay = policy.delay_for(attempt - 1);
            info!(attempt, delay_ms = delay.as_millis(), "scheduling reconnect");
            self.set_state(ConnectionState::Reconnecting { attempt, delay });
            sleep(delay).await;
        }
    }

    /// Pump one live connection until it closes. Returns why it ended.
    async fn serve(&self, conn: Connection) -> TransportError {
        let Connection {
            outbound,
            mut inbound,
        } = conn;

        let topics = {
            let mut shared = self.lock();
            shared.outbound = Some(outbound.clone());
            shared.topics.clone()
        };
        for topic in topics {
            if outbound.send(Frame::Subscribe(topic)).await.is_err() {
                return TransportError::Closed;
            }
            debug!(topic = topic.path(), "resubscribed");
        }

        let heartbeat_every = self.config.heartbeat.max(Duration::from_millis(1));
        let silence_limit = heartbeat_every * 2;
        let mut heartbeat = interval_at(Instant::now() + heartbeat_every, heartbeat_every);
        let mut last_seen = Instant::now();

        let settle = sleep(self.config.settle_delay);
        tokio::pin!(settle);
        let mut settled = false;

        loop {
            tokio::select! {
                () = &mut settle, if !settled => {
                    settled = true;
                    debug!("requesting current state");
                    let _ = self.publish(
                        Destination::RequestCurrentState,
                        Envelope::stamped(SyncMessage::StateRequest),
                    );
                }
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > silence_limit {
                        return TransportError::Timeout {
                            timeout_ms: u64::try_from(silence_limit.as_millis()).unwrap_or(u64::MAX),
                        };
                    }
                    if outbound.send(Frame::Heartbeat).await.is_err() {
                        return TransportError::Closed;
                    }
                }
                frame = inbound.recv() => {
                    let Some(frame) = frame else {
                        return TransportError::Closed;
                    };
                    last_seen = Instant::now();
                    self.accept(frame);
                }
            }
        }
    }

    fn accept(&self, frame: Frame) {
        match frame {
            Frame::Message { topic, body } => match Envelope::decode(&body) {
                Ok(envelope) => {
                    // receiver gone means the session is shutting down
                    let _ = self.inbox.send(Inbound { topic, envelope });
                }
                Err(e) => {
                    warn!(topic = topic.path(), error = %e, "dropping malformed payload");
                }
            },
            Frame::Heartbeat => trace!("broker heartbeat"),
            other => debug!(frame = ?other, "unexpected frame from broker"),
        }
    }
}
