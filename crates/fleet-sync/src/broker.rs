//! # In-Process Broker
//!
//! [`Transport`] implementation that fans destinations out to topics over
//! `tokio::sync::broadcast` channels. Delivery is at-most-once: a subscriber
//! that falls behind the channel capacity loses the oldest messages, and
//! messages published before a subscription exists are never seen.
//!
//! The broker can be taken offline and can drop every live session, which
//! is how reconnect behaviour is exercised.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::{debug, trace, warn};

use crate::error::{Result, TransportError};
use crate::message::Topic;
use crate::transport::{Connection, Frame, Transport};

/// Per-topic broadcast capacity
const TOPIC_CAPACITY: usize = 1024;

/// Per-session frame buffer in each direction
const SESSION_BUFFER: usize = 1024;

/// Broker tuning.
#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    pub topic_capacity: usize,
    pub heartbeat: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            topic_capacity: TOPIC_CAPACITY,
            heartbeat: Duration::from_secs(10),
        }
    }
}

struct BrokerInner {
    topics: HashMap<Topic, broadcast::Sender<String>>,
    online: AtomicBool,
    generation: watch::Sender<u64>,
    heartbeat: Duration,
    connects: AtomicUsize,
}

/// Shared in-process message broker. Cheap to clone.
#[derive(Clone)]
pub struct LocalBroker {
    inner: Arc<BrokerInner>,
}

impl LocalBroker {
    pub fn new(config: BrokerConfig) -> Self {
        let topics = Topic::ALL
            .into_iter()
            .map(|topic| (topic, broadcast::channel(config.topic_capacity.max(1)).0))
            .collect();
        let (generation, _) = watch::channel(0);

        Self {
            inner: Arc::new(BrokerInner {
                topics,
                online: AtomicBool::new(true),
                generation,
                heartbeat: config.heartbeat.max(Duration::from_millis(1)),
                connects: AtomicUsize::new(0),
            }),
        }
    }

    /// Accept or refuse new connections. Existing sessions are untouched.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    /// Close every live session, as a broker restart would.
    pub fn drop_sessions(&self) {
        self.inner.generation.send_modify(|g| *g += 1);
    }

    /// Publish a raw body on a topic, bypassing encoding.
    pub fn inject_raw(&self, topic: Topic, body: impl Into<String>) {
        let _ = self.inner.topic(topic).send(body.into());
    }

    /// Number of connection attempts seen, successful or not.
    pub fn connection_attempts(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

impl BrokerInner {
    fn topic(&self, topic: Topic) -> &broadcast::Sender<String> {
        // every topic is created in `LocalBroker::new`
        &self.topics[&topic]
    }
}

#[async_trait]
impl Transport for LocalBroker {
    async fn connect(&self) -> Result<Connection> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);

        if !self.inner.online.load(Ordering::SeqCst) {
            return Err(TransportError::Refused("broker offline".to_string()));
        }

        let (outbound, from_client) = mpsc::channel(SESSION_BUFFER);
        let (to_client, inbound) = mpsc::channel(SESSION_BUFFER);
        let generation = self.inner.generation.subscribe();

        tokio::spawn(run_session(
            self.inner.clone(),
            from_client,
            to_client,
            generation,
        ));

        Ok(Connection { outbound, inbound })
    }
}

async fn run_session(
    inner: Arc<BrokerInner>,
    mut from_client: mpsc::Receiver<Frame>,
    to_client: mpsc::Sender<Frame>,
    mut generation: watch::Receiver<u64>,
) {
    let mut forwarders: HashMap<Topic, JoinHandle<()>> = HashMap::new();
    let mut heartbeat = interval_at(Instant::now() + inner.heartbeat, inner.heartbeat);

    loop {
        tokio::select! {
            frame = from_client.recv() => match frame {
                None => break,
                Some(Frame::Subscribe(topic)) => {
                    forwarders.entry(topic).or_insert_with(|| {
                        debug!(topic = topic.path(), "session subscribed");
                        spawn_forwarder(topic, inner.topic(topic).subscribe(), to_client.clone())
                    });
                }
                Some(Frame::Send { destination, body }) => {
                    // no receivers is not an error for a broadcast broker
                    let _ = inner.topic(destination.topic()).send(body);
                }
                Some(Frame::Heartbeat) => trace!("client heartbeat"),
                Some(Frame::Message { topic, .. }) => {
                    debug!(topic = topic.path(), "ignoring message frame from client");
                }
            },
            _ = heartbeat.tick() => {
                if to_client.send(Frame::Heartbeat).await.is_err() {
                    break;
                }
            }
            _ = generation.changed() => {
                debug!("session dropped by broker");
                break;
            }
        }
    }

    for (_, forwarder) in forwarders {
        forwarder.abort();
    }
}

fn spawn_forwarder(
    topic: Topic,
    mut rx: broadcast::Receiver<String>,
    to_client: mpsc::Sender<Frame>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(body) => {
                    if to_client.send(Frame::Message { topic, body }).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = topic.path(), skipped, "subscriber lagging, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
