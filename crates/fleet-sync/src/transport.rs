//! # Transport Seam
//!
//! Abstract pub/sub connection used by [`SyncChannel`](crate::SyncChannel).
//! Implementations can be swapped (in-process broker, network bridge, test
//! doubles) without touching the reconnect logic.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::message::{Destination, Topic};

/// Unit of exchange between a session and the broker.
///
/// Bodies are raw JSON text so that malformed payloads surface at the
/// channel, where they are logged and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Client asks to receive a topic.
    Subscribe(Topic),
    /// Client publishes a body to a destination.
    Send { destination: Destination, body: String },
    /// Broker delivers a body published on a topic.
    Message { topic: Topic, body: String },
    /// Keep-alive in either direction.
    Heartbeat,
}

/// One live connection. Dropping `outbound` closes it from the client side;
/// `inbound` yielding `None` means the broker side went away.
#[derive(Debug)]
pub struct Connection {
    pub outbound: mpsc::Sender<Frame>,
    pub inbound: mpsc::Receiver<Frame>,
}

/// Factory for connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> Result<Connection>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn connect(&self) -> Result<Connection> {
        (**self).connect().await
    }
}
