//! # Wire Messages
//!
//! Topics, destinations and the tagged message union exchanged between the
//! producer and viewers. Every message travels inside an [`Envelope`]:
//!
//! ```json
//! { "type": "POSITION_DELTA", "data": { ... }, "timestamp": 1718000000000 }
//! ```

use chrono::Utc;
use fleet_domain::{EpochMillis, GeoPoint, Kinematics, RosterStats, Vehicle, VehicleStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MalformedMessage;

// =============================================================================
// ADDRESSING
// =============================================================================

/// Logical topics a session can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    Notifications,
    Simulation,
    LivePositions,
}

impl Topic {
    pub const ALL: [Self; 3] = [Self::Notifications, Self::Simulation, Self::LivePositions];

    pub const fn path(&self) -> &'static str {
        match self {
            Self::Notifications => "/topic/notifications",
            Self::Simulation => "/topic/simulation",
            Self::LivePositions => "/topic/live-positions",
        }
    }
}

/// Outbound destinations. Each is routed to exactly one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    Notify,
    SimulationUpdate,
    LivePositionUpdate,
    RequestCurrentState,
}

impl Destination {
    pub const fn path(&self) -> &'static str {
        match self {
            Self::Notify => "/app/notify",
            Self::SimulationUpdate => "/app/simulation-update",
            Self::LivePositionUpdate => "/app/live-position-update",
            Self::RequestCurrentState => "/app/request-current-state",
        }
    }

    /// Topic the broker fans this destination out to.
    pub const fn topic(&self) -> Topic {
        match self {
            Self::Notify => Topic::Notifications,
            Self::SimulationUpdate | Self::RequestCurrentState => Topic::Simulation,
            Self::LivePositionUpdate => Topic::LivePositions,
        }
    }
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Every message kind of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMessage {
    /// A run began; the roster is authoritative.
    SimulationStarted(RunStarted),
    /// The run ended; every vehicle returns to idle.
    SimulationStopped,
    SimulationPaused,
    SimulationResumed,
    SpeedChanged(SpeedChange),
    /// Full resync answer to [`SyncMessage::StateRequest`].
    CurrentState(StateSnapshot),
    /// Periodic full roster.
    VehiclesUpdate(VehiclesSnapshot),
    /// Sparse per-vehicle motion update.
    PositionDelta(PositionDelta),
    /// Older delta format, still accepted from legacy producers.
    LegacyPositionUpdate(LegacyPositionUpdate),
    Notification(Notification),
    /// Sent by a freshly connected session to ask the producer for state.
    StateRequest,
}

impl SyncMessage {
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::SimulationStarted(_) => "SIMULATION_STARTED",
            Self::SimulationStopped => "SIMULATION_STOPPED",
            Self::SimulationPaused => "SIMULATION_PAUSED",
            Self::SimulationResumed => "SIMULATION_RESUMED",
            Self::SpeedChanged(_) => "SPEED_CHANGED",
            Self::CurrentState(_) => "CURRENT_STATE",
            Self::VehiclesUpdate(_) => "VEHICLES_UPDATE",
            Self::PositionDelta(_) => "POSITION_DELTA",
            Self::LegacyPositionUpdate(_) => "LEGACY_POSITION_UPDATE",
            Self::Notification(_) => "NOTIFICATION",
            Self::StateRequest => "STATE_REQUEST",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStarted {
    pub vehicles: Vec<Vehicle>,
    pub speed_multiplier: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedChange {
    pub speed_multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub vehicles: Vec<Vehicle>,
    pub is_running: bool,
    pub is_paused: bool,
    pub speed_multiplier: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehiclesSnapshot {
    pub vehicles: Vec<Vehicle>,
    pub stats: RosterStats,
}

/// Motion fields of one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleDelta {
    pub id: Uuid,
    pub license_plate: String,
    pub current_lat: f64,
    pub current_lng: f64,
    pub heading: f64,
    pub progress: f64,
    pub status: VehicleStatus,
    pub distance_travelled: f64,
    pub timestamp: EpochMillis,
}

impl VehicleDelta {
    /// Delta for a vehicle with live kinematics; `None` before a run starts.
    #[must_use]
    pub fn from_vehicle(vehicle: &Vehicle) -> Option<Self> {
        let k: &Kinematics = vehicle.kinematics.as_ref()?;
        Some(Self {
            id: vehicle.id,
            license_plate: vehicle.license_plate().to_string(),
            current_lat: k.current_lat,
            current_lng: k.current_lng,
            heading: k.heading,
            progress: k.progress,
            status: vehicle.status,
            distance_travelled: k.distance_travelled,
            timestamp: k.updated_at,
        })
    }

    #[must_use]
    pub const fn position(&self) -> GeoPoint {
        GeoPoint::new(self.current_lat, self.current_lng)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionDelta {
    pub vehicles: Vec<VehicleDelta>,
    pub stats: RosterStats,
    pub timestamp: EpochMillis,
}

/// Legacy per-vehicle position. Carries no status, plate or distance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyPosition {
    pub vehicle_id: Uuid,
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub progress: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyPositionUpdate {
    pub positions: Vec<LegacyPosition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Success,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<Uuid>,
}

// =============================================================================
// ENVELOPE
// =============================================================================

/// `{type, data, timestamp}` frame body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(flatten)]
    pub message: SyncMessage,
    #[serde(default)]
    pub timestamp: EpochMillis,
}

impl Envelope {
    pub const fn new(message: SyncMessage, timestamp: EpochMillis) -> Self {
        Self { message, timestamp }
    }

    /// Wrap a message stamped with the current wall-clock time.
    pub fn stamped(message: SyncMessage) -> Self {
        Self::new(message, Utc::now().timestamp_millis())
    }

    /// Serialize to the JSON text carried by the transport.
    ///
    /// # Errors
    ///
    /// Fails only if a payload contains a value JSON cannot represent.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse a JSON frame body.
    ///
    /// # Errors
    ///
    /// Returns [`MalformedMessage`] for invalid JSON or an unknown `type`.
    pub fn decode(body: &str) -> Result<Self, MalformedMessage> {
        Ok(serde_json::from_str(body)?)
    }
}
