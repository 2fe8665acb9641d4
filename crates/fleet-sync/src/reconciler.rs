//! # Reconciler
//!
//! Viewer-side merge of producer messages into a local roster.
//!
//! Messages are applied strictly in arrival order. There is no sequence
//! number: a delta that arrives late overwrites a newer one, and the next
//! delta or snapshot corrects it.

use std::collections::VecDeque;

use fleet_domain::{
    EpochMillis, GeoPoint, Kinematics, MotionPhase, Roster, Vehicle, VehicleProfile,
    VehicleStatus,
};
use uuid::Uuid;
use tracing::{debug, info};

use crate::channel::MessageHandler;
use crate::message::{
    Envelope, LegacyPosition, Notification, StateSnapshot, SyncMessage, Topic, VehicleDelta,
};

/// Notification feed length
const MAX_NOTIFICATIONS: usize = 50;

/// What one message did to the local view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Roster replaced wholesale.
    Replaced { vehicles: usize },
    /// Every vehicle reset to idle.
    Reset,
    /// Only run flags or multiplier changed.
    FlagsChanged,
    /// Sparse deltas merged.
    Merged {
        updated: usize,
        synthesized: usize,
        dropped: usize,
    },
    Notified,
    /// Not meant for viewers.
    Ignored,
}

/// Result of merging a single delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Merge {
    Updated,
    Synthesized,
    Dropped,
}

/// Local mirror of the producer's simulation.
#[derive(Debug, Clone)]
pub struct Reconciler {
    roster: Roster,
    is_running: bool,
    is_paused: bool,
    speed_multiplier: f64,
    notifications: VecDeque<Notification>,
    last_update: Option<EpochMillis>,
}

impl Reconciler {
    /// `capacity` is informational; mirrored rosters are never truncated.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            roster: Roster::new(capacity),
            is_running: false,
            is_paused: false,
            speed_multiplier: 1.0,
            notifications: VecDeque::new(),
            last_update: None,
        }
    }

    #[must_use]
    pub const fn roster(&self) -> &Roster {
        &self.roster
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.is_running
    }

    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.is_paused
    }

    #[must_use]
    pub const fn speed_multiplier(&self) -> f64 {
        self.speed_multiplier
    }

    /// Most recent first.
    pub fn notifications(&self) -> impl Iterator<Item = &Notification> {
        self.notifications.iter()
    }

    #[must_use]
    pub const fn last_update(&self) -> Option<EpochMillis> {
        self.last_update
    }

    /// Apply one message.
    pub fn apply(&mut self, message: SyncMessage, timestamp: EpochMillis) -> ReconcileOutcome {
        let outcome = match message {
            SyncMessage::SimulationStarted(run) => {
                self.is_running = true;
                self.is_paused = false;
                self.speed_multiplier = run.speed_multiplier;
                self.replace(run.vehicles)
            }
            SyncMessage::SimulationStopped => {
                self.is_running = false;
                self.is_paused = false;
                self.roster.reset_all();
                ReconcileOutcome::Reset
            }
            SyncMessage::SimulationPaused => {
                self.is_paused = true;
                ReconcileOutcome::FlagsChanged
            }
            SyncMessage::SimulationResumed => {
                self.is_paused = false;
                ReconcileOutcome::FlagsChanged
            }
            SyncMessage::SpeedChanged(change) => {
                self.speed_multiplier = change.speed_multiplier;
                ReconcileOutcome::FlagsChanged
            }
            SyncMessage::CurrentState(snapshot) => self.resync(snapshot),
            SyncMessage::VehiclesUpdate(snapshot) => self.replace(snapshot.vehicles),
            SyncMessage::PositionDelta(delta) => {
                let merges: Vec<Merge> =
                    delta.vehicles.iter().map(|d| self.merge_delta(d)).collect();
                tally(&merges)
            }
            SyncMessage::LegacyPositionUpdate(update) => {
                let merges: Vec<Merge> = update
                    .positions
                    .iter()
                    .map(|p| self.merge_legacy(p, timestamp))
                    .collect();
                tally(&merges)
            }
            SyncMessage::Notification(notification) => {
                self.notifications.push_front(notification);
                self.notifications.truncate(MAX_NOTIFICATIONS);
                ReconcileOutcome::Notified
            }
            SyncMessage::StateRequest => ReconcileOutcome::Ignored,
        };

        if outcome != ReconcileOutcome::Ignored {
            self.last_update = Some(timestamp);
        }
        outcome
    }

    fn resync(&mut self, snapshot: StateSnapshot) -> ReconcileOutcome {
        info!(
            vehicles = snapshot.vehicles.len(),
            running = snapshot.is_running,
            "resynchronized from state snapshot"
        );
        self.is_running = snapshot.is_running;
        self.is_paused = snapshot.is_paused;
        self.speed_multiplier = snapshot.speed_multiplier;
        self.replace(snapshot.vehicles)
    }

    fn replace(&mut self, vehicles: Vec<Vehicle>) -> ReconcileOutcome {
        self.roster.replace_all(vehicles);
        ReconcileOutcome::Replaced {
            vehicles: self.roster.len(),
        }
    }

    fn merge_delta(&mut self, delta: &VehicleDelta) -> Merge {
        let motion = Motion {
            lat: delta.current_lat,
            lng: delta.current_lng,
            heading: Some(delta.heading),
            progress: Some(delta.progress),
            distance_travelled: Some(delta.distance_travelled),
            status: Some(delta.status),
            timestamp: delta.timestamp,
        };
        self.merge(delta.id, &delta.license_plate, motion)
    }

    fn merge_legacy(&mut self, position: &LegacyPosition, timestamp: EpochMillis) -> Merge {
        let motion = Motion {
            lat: position.lat,
            lng: position.lng,
            heading: position.heading,
            progress: position.progress,
            distance_travelled: None,
            status: None,
            timestamp,
        };
        self.merge(position.vehicle_id, "", motion)
    }

    fn merge(&mut self, id: Uuid, plate: &str, motion: Motion) -> Merge {
        let usable = GeoPoint::new(motion.lat, motion.lng).is_usable();

        if let Some(vehicle) = self.roster.get_mut(id) {
            if !usable {
                debug!(%id, "delta without usable position ignored");
                return Merge::Dropped;
            }
            let kinematics = motion.kinematics(vehicle);
            vehicle.status = motion.status.unwrap_or(match vehicle.status {
                VehicleStatus::Idle => VehicleStatus::Moving,
                other => other,
            });
            vehicle.kinematics = Some(kinematics);
            return Merge::Updated;
        }

        if !usable {
            debug!(%id, "delta for unknown vehicle without position dropped");
            return Merge::Dropped;
        }

        let mut placeholder = Vehicle::placeholder(id, VehicleProfile::unknown(plate));
        placeholder.kinematics = Some(motion.kinematics(&placeholder));
        placeholder.status = motion.status.unwrap_or(VehicleStatus::Moving);
        debug!(%id, plate, "synthesized placeholder vehicle");
        self.roster.insert_unbounded(placeholder);
        Merge::Synthesized
    }
}

fn tally(merges: &[Merge]) -> ReconcileOutcome {
    let count = |m: Merge| merges.iter().filter(|&&x| x == m).count();
    ReconcileOutcome::Merged {
        updated: count(Merge::Updated),
        synthesized: count(Merge::Synthesized),
        dropped: count(Merge::Dropped),
    }
}

/// Motion fields common to both delta formats.
struct Motion {
    lat: f64,
    lng: f64,
    heading: Option<f64>,
    progress: Option<f64>,
    distance_travelled: Option<f64>,
    status: Option<VehicleStatus>,
    timestamp: EpochMillis,
}

impl Motion {
    /// Fresh kinematics from this update, keeping what the delta lacks.
    fn kinematics(&self, vehicle: &Vehicle) -> Kinematics {
        let previous = vehicle.kinematics.as_ref();
        let status = self.status.unwrap_or(VehicleStatus::Moving);

        let phase = match status {
            VehicleStatus::Stopped => MotionPhase::Arrived,
            _ => MotionPhase::Moving {
                since: previous
                    .and_then(Kinematics::start_time)
                    .unwrap_or(self.timestamp),
            },
        };
        let status_label = match phase {
            MotionPhase::Arrived => Kinematics::ARRIVED_LABEL,
            _ => Kinematics::MOVING_LABEL,
        };

        Kinematics {
            progress: self
                .progress
                .or_else(|| previous.map(|k| k.progress))
                .unwrap_or(0.0)
                .clamp(0.0, 1.0),
            path_index: previous.map_or(0, |k| k.path_index),
            heading: self
                .heading
                .or_else(|| previous.map(|k| k.heading))
                .unwrap_or(0.0),
            distance_travelled: self
                .distance_travelled
                .or_else(|| previous.map(|k| k.distance_travelled))
                .unwrap_or(0.0),
            current_lat: self.lat,
            current_lng: self.lng,
            phase,
            status_label: status_label.to_string(),
            updated_at: self.timestamp,
        }
    }
}

impl MessageHandler for Reconciler {
    fn handle(&mut self, topic: Topic, envelope: Envelope) {
        let kind = envelope.message.kind();
        let outcome = self.apply(envelope.message, envelope.timestamp);
        debug!(topic = topic.path(), kind, ?outcome, "reconciled");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{
        LegacyPositionUpdate, NotificationLevel, PositionDelta, RunStarted, SpeedChange,
        VehiclesSnapshot,
    };
    use fleet_domain::{MotionState, PathPoint, RosterStats, Waypoint};

    fn vehicle(plate: &str) -> Vehicle {
        let from = Waypoint::new("Faisal Mosque", 33.7294, 73.0367);
        let to = Waypoint::new("Centaurus", 33.7077, 73.0498);
        Vehicle::new(
            VehicleProfile {
                license_plate: plate.to_string(),
                model: "Hilux".to_string(),
                brand: "Toyota".to_string(),
                vehicle_type: "truck".to_string(),
            },
            from.clone(),
            to.clone(),
            60.0,
            3,
            vec![PathPoint::anchor(&from), PathPoint::anchor(&to)],
        )
        .unwrap()
    }

    fn delta(id: Uuid, lat: f64, lng: f64, progress: f64, timestamp: EpochMillis) -> VehicleDelta {
        VehicleDelta {
            id,
            license_plate: "ICT-900".to_string(),
            current_lat: lat,
            current_lng: lng,
            heading: 150.0,
            progress,
            status: VehicleStatus::Moving,
            distance_travelled: progress * 2.6,
            timestamp,
        }
    }

    fn position_delta(vehicles: Vec<VehicleDelta>) -> SyncMessage {
        SyncMessage::PositionDelta(PositionDelta {
            vehicles,
            stats: RosterStats::default(),
            timestamp: 0,
        })
    }

    fn started(vehicles: Vec<Vehicle>) -> SyncMessage {
        SyncMessage::SimulationStarted(RunStarted {
            vehicles,
            speed_multiplier: 2.0,
        })
    }

    #[test]
    fn test_run_started_replaces_roster_and_adopts_multiplier() {
        let mut r = Reconciler::new(10);
        r.apply(started(vec![vehicle("A-1")]), 1);
        let outcome = r.apply(started(vec![vehicle("B-1"), vehicle("B-2")]), 2);

        assert_eq!(outcome, ReconcileOutcome::Replaced { vehicles: 2 });
        assert!(r.is_running());
        assert!((r.speed_multiplier() - 2.0).abs() < f64::EPSILON);
        assert_eq!(r.roster().vehicles()[0].license_plate(), "B-1");
    }

    #[test]
    fn test_delta_for_known_vehicle_preserves_structure() {
        let v = vehicle("ICT-101");
        let mut r = Reconciler::new(10);
        r.apply(started(vec![v.clone()]), 1);

        let outcome = r.apply(position_delta(vec![delta(v.id, 33.72, 73.04, 0.4, 50)]), 50);
        assert_eq!(
            outcome,
            ReconcileOutcome::Merged {
                updated: 1,
                synthesized: 0,
                dropped: 0
            }
        );

        let merged = r.roster().get(v.id).unwrap();
        assert_eq!(merged.planned_path, v.planned_path);
        assert_eq!(merged.profile, v.profile);
        assert!((merged.speed - 60.0).abs() < f64::EPSILON);
        assert_eq!(merged.initial_delay, 3);
        assert_eq!(merged.target_waypoint, v.target_waypoint);

        let k = merged.kinematics.as_ref().unwrap();
        assert!((k.current_lat - 33.72).abs() < f64::EPSILON);
        assert!((k.progress - 0.4).abs() < f64::EPSILON);
        assert!((k.heading - 150.0).abs() < f64::EPSILON);
        assert_eq!(merged.motion_state(), MotionState::Moving);
    }

    #[test]
    fn test_delta_for_unknown_vehicle_synthesizes_placeholder() {
        let mut r = Reconciler::new(10);
        let id = Uuid::new_v4();

        let outcome = r.apply(position_delta(vec![delta(id, 33.7, 73.0, 0.1, 5)]), 5);
        assert_eq!(
            outcome,
            ReconcileOutcome::Merged {
                updated: 0,
                synthesized: 1,
                dropped: 0
            }
        );

        let v = r.roster().get(id).unwrap();
        assert_eq!(v.profile.model, VehicleProfile::UNKNOWN);
        assert_eq!(v.profile.brand, VehicleProfile::UNKNOWN);
        assert_eq!(v.license_plate(), "ICT-900");
        assert!(v.planned_path.is_empty());
        assert!(v.position().is_some());
        assert!(v.speed > 0.0);
    }

    #[test]
    fn test_delta_for_unknown_vehicle_without_position_is_dropped() {
        let mut r = Reconciler::new(10);
        let outcome = r.apply(
            position_delta(vec![delta(Uuid::new_v4(), f64::NAN, 73.0, 0.1, 5)]),
            5,
        );
        assert_eq!(
            outcome,
            ReconcileOutcome::Merged {
                updated: 0,
                synthesized: 0,
                dropped: 1
            }
        );
        assert!(r.roster().is_empty());
    }

    #[test]
    fn test_stopped_resets_everything_to_idle() {
        let v = vehicle("ICT-101");
        let mut r = Reconciler::new(10);
        r.apply(started(vec![v.clone()]), 1);
        r.apply(position_delta(vec![delta(v.id, 33.72, 73.04, 0.4, 50)]), 50);

        assert_eq!(r.apply(SyncMessage::SimulationStopped, 60), ReconcileOutcome::Reset);
        let reset = r.roster().get(v.id).unwrap();
        assert_eq!(reset.status, VehicleStatus::Idle);
        assert!(reset.kinematics.is_none());
        assert!(!r.is_running());
    }

    #[test]
    fn test_pause_resume_and_speed_only_touch_flags() {
        let v = vehicle("ICT-101");
        let mut r = Reconciler::new(10);
        r.apply(started(vec![v]), 1);
        let before = r.roster().vehicles().to_vec();

        r.apply(SyncMessage::SimulationPaused, 2);
        assert!(r.is_paused());
        r.apply(
            SyncMessage::SpeedChanged(SpeedChange {
                speed_multiplier: 5.0,
            }),
            3,
        );
        r.apply(SyncMessage::SimulationResumed, 4);

        assert!(!r.is_paused());
        assert!((r.speed_multiplier() - 5.0).abs() < f64::EPSILON);
        assert_eq!(r.roster().vehicles(), before.as_slice());
    }

    #[test]
    fn test_state_snapshot_resyncs_late_joiner() {
        let mut r = Reconciler::new(10);
        let snapshot = StateSnapshot {
            vehicles: vec![vehicle("A"), vehicle("B"), vehicle("C")],
            is_running: true,
            is_paused: true,
            speed_multiplier: 3.0,
        };

        let outcome = r.apply(SyncMessage::CurrentState(snapshot), 9);
        assert_eq!(outcome, ReconcileOutcome::Replaced { vehicles: 3 });
        assert!(r.is_running());
        assert!(r.is_paused());
        assert_eq!(r.last_update(), Some(9));
    }

    #[test]
    fn test_vehicles_update_replaces_roster() {
        let mut r = Reconciler::new(10);
        r.apply(started(vec![vehicle("OLD")]), 1);
        r.apply(
            SyncMessage::VehiclesUpdate(VehiclesSnapshot {
                vehicles: vec![vehicle("NEW")],
                stats: RosterStats::default(),
            }),
            2,
        );
        assert_eq!(r.roster().len(), 1);
        assert_eq!(r.roster().vehicles()[0].license_plate(), "NEW");
    }

    #[test]
    fn test_legacy_update_keeps_missing_fields() {
        let v = vehicle("ICT-101");
        let mut r = Reconciler::new(10);
        r.apply(started(vec![v.clone()]), 1);
        r.apply(position_delta(vec![delta(v.id, 33.72, 73.04, 0.4, 50)]), 50);

        r.apply(
            SyncMessage::LegacyPositionUpdate(LegacyPositionUpdate {
                positions: vec![LegacyPosition {
                    vehicle_id: v.id,
                    lat: 33.71,
                    lng: 73.045,
                    heading: None,
                    progress: Some(0.5),
                }],
            }),
            60,
        );

        let k = r.roster().get(v.id).unwrap().kinematics.clone().unwrap();
        assert!((k.current_lat - 33.71).abs() < f64::EPSILON);
        assert!((k.progress - 0.5).abs() < f64::EPSILON);
        assert!((k.heading - 150.0).abs() < f64::EPSILON);
        assert!((k.distance_travelled - 0.4 * 2.6).abs() < 1e-12);
        assert_eq!(k.updated_at, 60);
    }

    #[test]
    fn test_late_delta_is_applied_in_arrival_order() {
        let v = vehicle("ICT-101");
        let mut r = Reconciler::new(10);
        r.apply(started(vec![v.clone()]), 1);

        r.apply(position_delta(vec![delta(v.id, 33.72, 73.04, 0.6, 200)]), 200);
        // older update delivered late wins until the next one arrives
        r.apply(position_delta(vec![delta(v.id, 33.725, 73.038, 0.3, 100)]), 100);
        let k = r.roster().get(v.id).unwrap().kinematics.clone().unwrap();
        assert!((k.progress - 0.3).abs() < f64::EPSILON);

        r.apply(position_delta(vec![delta(v.id, 33.715, 73.043, 0.7, 300)]), 300);
        let k = r.roster().get(v.id).unwrap().kinematics.clone().unwrap();
        assert!((k.progress - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn test_notification_feed_is_bounded() {
        let mut r = Reconciler::new(10);
        for i in 0..60 {
            r.apply(
                SyncMessage::Notification(Notification {
                    level: NotificationLevel::Info,
                    message: format!("n{i}"),
                    vehicle_id: None,
                }),
                i,
            );
        }
        assert_eq!(r.notifications().count(), MAX_NOTIFICATIONS);
        assert_eq!(r.notifications().next().unwrap().message, "n59");
    }

    #[test]
    fn test_state_request_is_ignored() {
        let mut r = Reconciler::new(10);
        assert_eq!(
            r.apply(SyncMessage::StateRequest, 5),
            ReconcileOutcome::Ignored
        );
        assert_eq!(r.last_update(), None);
    }
}
