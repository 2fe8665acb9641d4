//! # Fleet Route Simulator - Synchronization
//!
//! Keeps many viewers consistent with one simulation producer over a topic
//! based publish/subscribe transport.
//!
//! ## Pieces
//!
//! - [`message`]: topics, destinations and the tagged [`SyncMessage`] union
//! - [`transport`]: the [`Transport`] seam and its [`Frame`] vocabulary
//! - [`broker`]: an in-process [`LocalBroker`] built on tokio broadcast channels
//! - [`channel`]: [`SyncChannel`], with heartbeats, bounded exponential
//!   reconnect and automatic resubscription
//! - [`reconciler`]: viewer-side merge of snapshots and deltas

pub mod broker;
pub mod channel;
pub mod error;
pub mod message;
pub mod reconciler;
pub mod transport;

pub use broker::{BrokerConfig, LocalBroker};
pub use channel::{
    ChannelConfig, ConnectionState, Inbound, Inbox, MessageHandler, ReconnectPolicy, SyncChannel,
};
pub use error::{MalformedMessage, TransportError};
pub use message::{Destination, Envelope, SyncMessage, Topic};
pub use reconciler::{ReconcileOutcome, Reconciler};
pub use transport::{Connection, Frame, Transport};
