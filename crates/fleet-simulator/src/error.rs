//! # Simulator Errors
//!
//! Nothing here is fatal to the process: route problems fall back or reject a
//! placement, role violations reject a command, transport problems are
//! retried by the sync channel.

use fleet_domain::DomainError;
use fleet_sync::TransportError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for simulator operations
pub type Result<T> = std::result::Result<T, SimError>;

/// Route composition errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouteError {
    #[error("Source and destination are the same place: {name}")]
    Degenerate { name: String },

    #[error("No usable waypoints")]
    NoWaypoints,

    #[error("Unknown waypoint: {0}")]
    UnknownWaypoint(Uuid),
}

/// Simulator errors
#[derive(Debug, Error)]
pub enum SimError {
    #[error("{action} is only allowed for the producer session")]
    RoleViolation { action: &'static str },

    #[error("Speed multiplier must be positive and finite, got {0}")]
    InvalidSpeed(f64),

    #[error("Nothing to simulate: the roster is empty")]
    EmptyRoster,

    #[error("Session {0} has shut down")]
    SessionClosed(Uuid),

    #[error("Failed to load waypoints from {path}: {reason}")]
    Catalog { path: String, reason: String },

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Record store error: {0}")]
    Records(String),
}

impl From<reqwest::Error> for SimError {
    fn from(err: reqwest::Error) -> Self {
        Self::Records(err.to_string())
    }
}
