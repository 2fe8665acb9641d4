//! # Fleet Route Simulator - Domain Model
//!
//! Core entities and value objects for the fleet simulator: waypoints,
//! synthesized route points, vehicles and their run-time kinematics. These
//! types are shared by the producer-side motion engine and the viewer-side
//! reconciler, and are what travels over the wire in roster snapshots.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod geo;
pub mod roster;

pub use roster::{Roster, RosterStats};

/// Milliseconds since the Unix epoch.
pub type EpochMillis = i64;

// =============================================================================
// VALUE OBJECTS
// =============================================================================

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    #[must_use]
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Great-circle distance to another point in kilometers.
    #[must_use]
    pub fn distance_to_km(self, other: Self) -> f64 {
        geo::distance_km(self, other)
    }

    /// Initial bearing towards another point in degrees `[0, 360)`.
    #[must_use]
    pub fn bearing_to_deg(self, other: Self) -> f64 {
        geo::bearing_deg(self, other)
    }

    /// Finite and within the valid latitude/longitude ranges.
    #[must_use]
    pub fn is_usable(self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

// =============================================================================
// REFERENCE DATA
// =============================================================================

/// Named fixed location. Loaded once, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waypoint {
    pub id: Uuid,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
}

impl Waypoint {
    pub fn new(name: impl Into<String>, lat: f64, lng: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            lat,
            lng,
        }
    }

    #[must_use]
    pub const fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

/// One point of a synthesized route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathPoint {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub is_waypoint: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waypoint_id: Option<Uuid>,
}

impl PathPoint {
    /// An interpolated point between two anchors.
    #[must_use]
    pub const fn interpolated(point: GeoPoint) -> Self {
        Self {
            lat: point.lat,
            lng: point.lng,
            is_waypoint: false,
            waypoint_id: None,
        }
    }

    /// A point that coincides with a real waypoint.
    #[must_use]
    pub const fn anchor(waypoint: &Waypoint) -> Self {
        Self {
            lat: waypoint.lat,
            lng: waypoint.lng,
            is_waypoint: true,
            waypoint_id: Some(waypoint.id),
        }
    }

    #[must_use]
    pub const fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lng)
    }
}

// =============================================================================
// ENUMS
// =============================================================================

/// Coarse vehicle status as shown to users and carried in deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleStatus {
    #[default]
    Idle,
    Moving,
    Stopped,
}

impl VehicleStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Moving => "moving",
            Self::Stopped => "stopped",
        }
    }
}

/// Fine-grained run state derived from status and kinematics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MotionState {
    Idle,
    Delayed,
    Moving,
    Stopped,
}

/// Phase a running vehicle is in. Carries the timestamp the phase began at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum MotionPhase {
    /// Waiting out the initial delay since `since`.
    Delayed { since: EpochMillis },
    /// Travelling; progress is measured from `since`.
    Moving { since: EpochMillis },
    /// Reached the end of the planned path.
    Arrived,
}

// =============================================================================
// ENTITY TYPES
// =============================================================================

/// Descriptive attributes of a vehicle, as entered when it is placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleProfile {
    pub license_plate: String,
    pub model: String,
    pub brand: String,
    #[serde(rename = "type")]
    pub vehicle_type: String,
}

impl VehicleProfile {
    pub const UNKNOWN: &'static str = "Unknown";

    /// Profile for a vehicle only known by id and plate.
    pub fn unknown(license_plate: impl Into<String>) -> Self {
        Self {
            license_plate: license_plate.into(),
            model: Self::UNKNOWN.to_string(),
            brand: Self::UNKNOWN.to_string(),
            vehicle_type: Self::UNKNOWN.to_string(),
        }
    }
}

/// Run-time motion state of a vehicle.
///
/// Always built whole on every transition; never patched field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Kinematics {
    pub progress: f64,
    pub path_index: usize,
    pub heading: f64,
    pub distance_travelled: f64,
    pub current_lat: f64,
    pub current_lng: f64,
    pub phase: MotionPhase,
    pub status_label: String,
    pub updated_at: EpochMillis,
}

impl Kinematics {
    pub const MOVING_LABEL: &'static str = "Moving";
    pub const ARRIVED_LABEL: &'static str = "Arrived";

    /// Label shown while waiting out the initial delay.
    #[must_use]
    pub fn delayed_label(remaining_secs: u64) -> String {
        format!("{remaining_secs}s remaining")
    }

    #[must_use]
    pub const fn is_delayed(&self) -> bool {
        matches!(self.phase, MotionPhase::Delayed { .. })
    }

    /// When travel began, if it has.
    #[must_use]
    pub const fn start_time(&self) -> Option<EpochMillis> {
        match self.phase {
            MotionPhase::Moving { since } => Some(since),
            _ => None,
        }
    }

    /// When the initial delay began, while still delayed.
    #[must_use]
    pub const fn delay_start_time(&self) -> Option<EpochMillis> {
        match self.phase {
            MotionPhase::Delayed { since } => Some(since),
            _ => None,
        }
    }

    #[must_use]
    pub const fn position(&self) -> GeoPoint {
        GeoPoint::new(self.current_lat, self.current_lng)
    }
}

/// A simulated vehicle and its planned route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: Uuid,
    #[serde(flatten)]
    pub profile: VehicleProfile,
    /// Where the planned path starts; `current_waypoint` returns here on reset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Waypoint>,
    pub current_waypoint: Option<Waypoint>,
    pub target_waypoint: Option<Waypoint>,
    /// km/h, strictly positive
    pub speed: f64,
    /// Seconds to wait after run start before moving.
    pub initial_delay: u32,
    pub status: VehicleStatus,
    pub planned_path: Vec<PathPoint>,
    #[serde(default)]
    pub kinematics: Option<Kinematics>,
}

impl Vehicle {
    /// Create an idle vehicle on a planned route.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::InvalidVehicle`] when the speed is not a
    /// positive finite number or the path is empty.
    pub fn new(
        profile: VehicleProfile,
        source: Waypoint,
        target: Waypoint,
        speed: f64,
        initial_delay: u32,
        planned_path: Vec<PathPoint>,
    ) -> Result<Self, DomainError> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(DomainError::InvalidVehicle(format!(
                "speed must be positive, got {speed}"
            )));
        }
        if planned_path.is_empty() {
            return Err(DomainError::InvalidVehicle(
                "planned path is empty".to_string(),
            ));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            profile,
            origin: Some(source.clone()),
            current_waypoint: Some(source),
            target_waypoint: Some(target),
            speed,
            initial_delay,
            status: VehicleStatus::Idle,
            planned_path,
            kinematics: None,
        })
    }

    /// Speed given to placeholders, whose real speed is never on the wire.
    pub const UNKNOWN_SPEED: f64 = f64::MIN_POSITIVE;

    /// Minimal stand-in for a vehicle only seen through a position delta.
    #[must_use]
    pub fn placeholder(id: Uuid, profile: VehicleProfile) -> Self {
        Self {
            id,
            profile,
            origin: None,
            current_waypoint: None,
            target_waypoint: None,
            speed: Self::UNKNOWN_SPEED,
            initial_delay: 0,
            status: VehicleStatus::Idle,
            planned_path: Vec::new(),
            kinematics: None,
        }
    }

    pub fn license_plate(&self) -> &str {
        &self.profile.license_plate
    }

    #[must_use]
    pub fn motion_state(&self) -> MotionState {
        match (&self.kinematics, self.status) {
            (_, VehicleStatus::Stopped) => MotionState::Stopped,
            (Some(k), _) if k.is_delayed() => MotionState::Delayed,
            (Some(_), VehicleStatus::Moving) => MotionState::Moving,
            _ => MotionState::Idle,
        }
    }

    /// Current position: live kinematics if running, else the path start.
    #[must_use]
    pub fn position(&self) -> Option<GeoPoint> {
        self.kinematics
            .as_ref()
            .map(Kinematics::position)
            .or_else(|| self.planned_path.first().map(PathPoint::point))
    }

    /// Drop run-time state and return to idle at the start of the route.
    pub fn reset(&mut self) {
        self.status = VehicleStatus::Idle;
        self.kinematics = None;
        if self.origin.is_some() {
            self.current_waypoint.clone_from(&self.origin);
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Domain-level errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DomainError {
    #[error("Roster is full ({capacity} vehicles)")]
    Capacity { capacity: usize },

    #[error("Vehicle {0} is already in the roster")]
    DuplicateVehicle(Uuid),

    #[error("Vehicle not found: {0}")]
    VehicleNotFound(Uuid),

    #[error("Invalid vehicle: {0}")]
    InvalidVehicle(String),

    #[error("Invalid coordinates: lat={lat}, lng={lng}")]
    InvalidCoordinates { lat: f64, lng: f64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path() -> Vec<PathPoint> {
        let a = Waypoint::new("A", 33.7, 73.0);
        vec![PathPoint::anchor(&a)]
    }

    fn profile() -> VehicleProfile {
        VehicleProfile {
            license_plate: "ICT-101".to_string(),
            model: "Corolla".to_string(),
            brand: "Toyota".to_string(),
            vehicle_type: "car".to_string(),
        }
    }

    #[test]
    fn test_vehicle_rejects_non_positive_speed() {
        let a = Waypoint::new("A", 33.7, 73.0);
        let err = Vehicle::new(profile(), a.clone(), a, 0.0, 0, path()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidVehicle(_)));
    }

    #[test]
    fn test_new_vehicle_is_idle() {
        let a = Waypoint::new("A", 33.7, 73.0);
        let v = Vehicle::new(profile(), a.clone(), a, 40.0, 0, path()).unwrap();
        assert_eq!(v.status, VehicleStatus::Idle);
        assert_eq!(v.motion_state(), MotionState::Idle);
        assert!(v.kinematics.is_none());
        assert_eq!(v.position(), Some(GeoPoint::new(33.7, 73.0)));
    }

    #[test]
    fn test_motion_state_from_phase() {
        let a = Waypoint::new("A", 33.7, 73.0);
        let mut v = Vehicle::new(profile(), a.clone(), a, 40.0, 5, path()).unwrap();
        v.status = VehicleStatus::Moving;
        v.kinematics = Some(Kinematics {
            progress: 0.0,
            path_index: 0,
            heading: 0.0,
            distance_travelled: 0.0,
            current_lat: 33.7,
            current_lng: 73.0,
            phase: MotionPhase::Delayed { since: 1_000 },
            status_label: "5s remaining".to_string(),
            updated_at: 1_000,
        });
        assert_eq!(v.motion_state(), MotionState::Delayed);

        v.reset();
        assert_eq!(v.motion_state(), MotionState::Idle);
    }

    #[test]
    fn test_reset_returns_to_route_start() {
        let a = Waypoint::new("Faisal Mosque", 33.7294, 73.0367);
        let b = Waypoint::new("G-9 Markaz", 33.6938, 73.0651);
        let path = vec![PathPoint::anchor(&a), PathPoint::anchor(&b)];
        let mut v = Vehicle::new(profile(), a.clone(), b.clone(), 40.0, 0, path).unwrap();

        v.current_waypoint = Some(b);
        v.status = VehicleStatus::Stopped;
        v.reset();

        assert_eq!(v.motion_state(), MotionState::Idle);
        assert_eq!(v.current_waypoint.as_ref(), Some(&a));
        assert_eq!(
            v.current_waypoint.as_ref().map(Waypoint::point),
            Some(v.planned_path[0].point())
        );
    }

    #[test]
    fn test_placeholder_keeps_positive_speed() {
        let v = Vehicle::placeholder(Uuid::new_v4(), VehicleProfile::unknown("ICT-9"));
        assert!(v.speed > 0.0);
        assert!(v.origin.is_none());
        assert!(v.planned_path.is_empty());
    }

    #[test]
    fn test_usable_points() {
        assert!(GeoPoint::new(33.7, 73.0).is_usable());
        assert!(!GeoPoint::new(f64::NAN, 73.0).is_usable());
        assert!(!GeoPoint::new(91.0, 0.0).is_usable());
        assert!(!GeoPoint::new(0.0, -181.0).is_usable());
    }

    #[test]
    fn test_vehicle_wire_shape() {
        let a = Waypoint::new("A", 33.7, 73.0);
        let v = Vehicle::new(profile(), a.clone(), a, 40.0, 0, path()).unwrap();
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["licensePlate"], "ICT-101");
        assert_eq!(json["type"], "car");
        assert_eq!(json["status"], "idle");
        assert!(json["plannedPath"][0]["isWaypoint"].as_bool().unwrap());

        let back: Vehicle = serde_json::from_value(json).unwrap();
        assert_eq!(back, v);
    }
}
