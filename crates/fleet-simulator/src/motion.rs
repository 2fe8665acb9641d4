//! # Motion Engine
//!
//! Producer-side, time-based movement of every vehicle in the roster.
//!
//! ```text
//! IDLE ──start──▶ DELAYED ──delay elapsed──▶ MOVING ──progress = 1──▶ STOPPED
//!          └───────── no delay ─────────────────▲
//! ```
//!
//! Progress is a pure function of `now - startTime`, the path length, the
//! vehicle speed and the playback multiplier, so a tick can be late or
//! skipped without drift. Every call takes an explicit `now`.

use std::collections::HashMap;
use std::time::Duration;

use fleet_domain::{
    EpochMillis, Kinematics, MotionPhase, Roster, RosterStats, Vehicle, VehicleStatus,
};
use fleet_sync::message::{
    Notification, NotificationLevel, StateSnapshot, VehicleDelta, VehiclesSnapshot,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Result, SimError};
use crate::route::PlannedPath;

/// Tick period at 1x playback.
pub const BASE_TICK: Duration = Duration::from_millis(200);

/// Fastest tick period regardless of playback speed.
pub const MIN_TICK: Duration = Duration::from_millis(50);

pub const DEFAULT_SNAPSHOT_EVERY_TICKS: u64 = 10;

/// `max(50ms, 200ms / multiplier)`.
#[must_use]
pub fn tick_period(multiplier: f64) -> Duration {
    if !(multiplier.is_finite() && multiplier > 0.0) {
        return BASE_TICK;
    }
    Duration::try_from_secs_f64(BASE_TICK.as_secs_f64() / multiplier)
        .unwrap_or(Duration::MAX)
        .max(MIN_TICK)
}

/// Wall time to cover `distance_km` at `speed_kmh`, sped up by `multiplier`.
#[must_use]
pub fn journey_duration_ms(distance_km: f64, speed_kmh: f64, multiplier: f64) -> f64 {
    (distance_km / (speed_kmh / 3600.0)) * 1000.0 / multiplier
}

/// Fraction of the journey done after `elapsed_ms`, in `[0, 1]`.
#[must_use]
pub fn progress_at(elapsed_ms: f64, journey_ms: f64) -> f64 {
    if !(journey_ms.is_finite() && journey_ms > 0.0) {
        return 1.0;
    }
    (elapsed_ms / journey_ms).clamp(0.0, 1.0)
}

#[allow(clippy::cast_precision_loss)]
fn millis_f64(ms: EpochMillis) -> f64 {
    ms as f64
}

// =============================================================================
// EVENTS & REPORTS
// =============================================================================

/// Something users are told about.
#[derive(Debug, Clone, PartialEq)]
pub enum MotionEvent {
    DelayEnded {
        vehicle_id: Uuid,
        license_plate: String,
    },
    JourneyCompleted {
        vehicle_id: Uuid,
        license_plate: String,
        destination: Option<String>,
        distance_km: f64,
    },
}

impl MotionEvent {
    #[must_use]
    pub fn notification(&self) -> Notification {
        match self {
            Self::DelayEnded {
                vehicle_id,
                license_plate,
            } => Notification {
                level: NotificationLevel::Info,
                message: format!("{license_plate} started moving"),
                vehicle_id: Some(*vehicle_id),
            },
            Self::JourneyCompleted {
                vehicle_id,
                license_plate,
                destination,
                distance_km,
            } => Notification {
                level: NotificationLevel::Success,
                message: format!(
                    "{license_plate} reached {} after {distance_km:.2} km",
                    destination.as_deref().unwrap_or("its destination")
                ),
                vehicle_id: Some(*vehicle_id),
            },
        }
    }
}

/// Output of one tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    /// One per vehicle that moved, started moving or arrived this tick.
    pub deltas: Vec<VehicleDelta>,
    pub events: Vec<MotionEvent>,
    pub stats: RosterStats,
    /// A full roster snapshot should go out with this tick.
    pub snapshot_due: bool,
    /// Every vehicle has stopped; the run is over.
    pub run_complete: bool,
}

/// What a tick did to one vehicle.
enum Step {
    Unchanged,
    Waiting,
    Started,
    Moved,
    Arrived,
}

// =============================================================================
// ENGINE
// =============================================================================

/// Owns the producer roster and moves it forward tick by tick.
#[derive(Debug, Clone)]
pub struct MotionEngine {
    roster: Roster,
    speed_multiplier: f64,
    running: bool,
    paused_at: Option<EpochMillis>,
    ticks: u64,
    snapshot_every: u64,
    /// Routes of the current run, measured once at start.
    paths: HashMap<Uuid, PlannedPath>,
    /// Arrived at launch; reported on the first tick.
    arrived_at_launch: Vec<Uuid>,
}

impl MotionEngine {
    #[must_use]
    pub fn new(capacity: usize, snapshot_every_ticks: u64) -> Self {
        Self {
            roster: Roster::new(capacity),
            speed_multiplier: 1.0,
            running: false,
            paused_at: None,
            ticks: 0,
            snapshot_every: snapshot_every_ticks.max(1),
            paths: HashMap::new(),
            arrived_at_launch: Vec::new(),
        }
    }

    #[must_use]
    pub const fn roster(&self) -> &Roster {
        &self.roster
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.running
    }

    #[must_use]
    pub const fn is_paused(&self) -> bool {
        self.paused_at.is_some()
    }

    #[must_use]
    pub const fn speed_multiplier(&self) -> f64 {
        self.speed_multiplier
    }

    /// Running, or still holding kinematics from a finished run.
    #[must_use]
    pub fn has_run_state(&self) -> bool {
        self.running || self.roster.iter().any(|v| v.kinematics.is_some())
    }

    #[must_use]
    pub fn tick_period(&self) -> Duration {
        tick_period(self.speed_multiplier)
    }

    /// Add an idle vehicle.
    ///
    /// # Errors
    ///
    /// Capacity and duplicate-id errors from the roster.
    pub fn place(&mut self, vehicle: Vehicle) -> Result<()> {
        self.roster.admit(vehicle)?;
        Ok(())
    }

    /// Drop every vehicle and end any run.
    pub fn clear(&mut self) {
        self.roster.clear();
        self.halt();
    }

    /// Begin a run at `now`. Restarts an ongoing run.
    pub fn start(&mut self, now: EpochMillis) {
        self.running = true;
        self.paused_at = None;
        self.ticks = 0;
        self.arrived_at_launch.clear();
        self.paths = self
            .roster
            .iter()
            .map(|v| (v.id, PlannedPath::new(v.planned_path.clone())))
            .collect();

        for vehicle in self.roster.iter_mut() {
            let Some(path) = self.paths.get(&vehicle.id) else {
                continue;
            };
            if launch(vehicle, path, now) {
                self.arrived_at_launch.push(vehicle.id);
            }
        }

        info!(
            vehicles = self.roster.len(),
            speed_multiplier = self.speed_multiplier,
            "run started"
        );
    }

    /// End the run; every vehicle returns to idle.
    pub fn stop(&mut self) {
        self.roster.reset_all();
        self.halt();
        info!("run stopped");
    }

    fn halt(&mut self) {
        self.running = false;
        self.paused_at = None;
        self.ticks = 0;
        self.paths.clear();
        self.arrived_at_launch.clear();
    }

    /// Freeze progress at `now`. Returns `false` if not running or already paused.
    pub fn pause(&mut self, now: EpochMillis) -> bool {
        if !self.running || self.paused_at.is_some() {
            return false;
        }
        self.paused_at = Some(now);
        true
    }

    /// Continue from where `pause` froze. Returns `false` if not paused.
    pub fn resume(&mut self, now: EpochMillis) -> bool {
        let Some(paused_at) = self.paused_at.take() else {
            return false;
        };
        let shift = (now - paused_at).max(0);

        for vehicle in self.roster.iter_mut() {
            let Some(k) = vehicle.kinematics.as_ref() else {
                continue;
            };
            let phase = match k.phase {
                MotionPhase::Delayed { since } => MotionPhase::Delayed {
                    since: since + shift,
                },
                MotionPhase::Moving { since } => MotionPhase::Moving {
                    since: since + shift,
                },
                MotionPhase::Arrived => continue,
            };
            vehicle.kinematics = Some(Kinematics {
                phase,
                ..k.clone()
            });
        }

        debug!(paused_ms = shift, "run resumed");
        true
    }

    /// Change playback speed, keeping every vehicle's progress where it is.
    ///
    /// # Errors
    ///
    /// [`SimError::InvalidSpeed`] for non-positive or non-finite values.
    pub fn set_speed_multiplier(&mut self, multiplier: f64, now: EpochMillis) -> Result<()> {
        if !(multiplier.is_finite() && multiplier > 0.0) {
            return Err(SimError::InvalidSpeed(multiplier));
        }

        let previous = self.speed_multiplier;
        if self.running {
            let reference = self.paused_at.unwrap_or(now);
            for vehicle in self.roster.iter_mut() {
                let Some(k) = vehicle.kinematics.as_ref() else {
                    continue;
                };
                let MotionPhase::Moving { since } = k.phase else {
                    continue;
                };
                let elapsed = millis_f64(reference - since) * previous / multiplier;
                #[allow(clippy::cast_possible_truncation)]
                let since = reference - elapsed.round() as EpochMillis;
                vehicle.kinematics = Some(Kinematics {
                    phase: MotionPhase::Moving { since },
                    ..k.clone()
                });
            }
        }

        self.speed_multiplier = multiplier;
        debug!(from = previous, to = multiplier, "speed multiplier changed");
        Ok(())
    }

    /// Advance every vehicle to `now`. Does nothing unless running and not paused.
    pub fn tick(&mut self, now: EpochMillis) -> TickReport {
        if !self.running || self.paused_at.is_some() {
            return TickReport {
                tick: self.ticks,
                stats: self.roster.stats(),
                ..TickReport::default()
            };
        }

        self.ticks += 1;
        let multiplier = self.speed_multiplier;
        let mut deltas = Vec::new();
        let mut events = Vec::new();
        let launched = std::mem::take(&mut self.arrived_at_launch);

        for vehicle in self.roster.iter_mut() {
            let Some(path) = self.paths.get(&vehicle.id) else {
                continue;
            };
            let step = if launched.contains(&vehicle.id) {
                Step::Arrived
            } else {
                advance(vehicle, path, now, multiplier)
            };
            match step {
                Step::Unchanged | Step::Waiting => continue,
                Step::Started => events.push(MotionEvent::DelayEnded {
                    vehicle_id: vehicle.id,
                    license_plate: vehicle.license_plate().to_string(),
                }),
                Step::Moved => {}
                Step::Arrived => {
                    let distance_km = vehicle
                        .kinematics
                        .as_ref()
                        .map_or(0.0, |k| k.distance_travelled);
                    events.push(MotionEvent::JourneyCompleted {
                        vehicle_id: vehicle.id,
                        license_plate: vehicle.license_plate().to_string(),
                        destination: vehicle.target_waypoint.as_ref().map(|w| w.name.clone()),
                        distance_km,
                    });
                }
            }
            deltas.extend(VehicleDelta::from_vehicle(vehicle));
        }

        for event in &events {
            debug!(?event, "motion event");
        }

        let run_complete = self.roster.all_stopped();
        if run_complete {
            info!(ticks = self.ticks, "every vehicle arrived, run complete");
            self.running = false;
        }

        TickReport {
            tick: self.ticks,
            deltas,
            events,
            stats: self.roster.stats(),
            snapshot_due: self.ticks % self.snapshot_every == 0,
            run_complete,
        }
    }

    /// Everything a late joiner needs.
    #[must_use]
    pub fn state_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            vehicles: self.roster.vehicles().to_vec(),
            is_running: self.running,
            is_paused: self.is_paused(),
            speed_multiplier: self.speed_multiplier,
        }
    }

    #[must_use]
    pub fn vehicles_snapshot(&self) -> VehiclesSnapshot {
        VehiclesSnapshot {
            vehicles: self.roster.vehicles().to_vec(),
            stats: self.roster.stats(),
        }
    }
}

/// Fresh kinematics for the start of a run. `true` if already at the end.
fn launch(vehicle: &mut Vehicle, path: &PlannedPath, now: EpochMillis) -> bool {
    if path.len() < 2 {
        arrive(vehicle, path, now);
        return true;
    }

    let (phase, status_label) = if vehicle.initial_delay > 0 {
        (
            MotionPhase::Delayed { since: now },
            Kinematics::delayed_label(u64::from(vehicle.initial_delay)),
        )
    } else {
        (
            MotionPhase::Moving { since: now },
            Kinematics::MOVING_LABEL.to_string(),
        )
    };

    vehicle.status = VehicleStatus::Moving;
    vehicle.kinematics = Some(at_start(path, phase, status_label, now));
    false
}

fn at_start(
    path: &PlannedPath,
    phase: MotionPhase,
    status_label: String,
    now: EpochMillis,
) -> Kinematics {
    let start = path.position_at(0.0);
    Kinematics {
        progress: 0.0,
        path_index: 0,
        heading: start.map_or(0.0, |p| p.heading),
        distance_travelled: 0.0,
        current_lat: start.map_or(f64::NAN, |p| p.point.lat),
        current_lng: start.map_or(f64::NAN, |p| p.point.lng),
        phase,
        status_label,
        updated_at: now,
    }
}

fn advance(vehicle: &mut Vehicle, path: &PlannedPath, now: EpochMillis, multiplier: f64) -> Step {
    let Some(k) = vehicle.kinematics.as_ref() else {
        return Step::Unchanged;
    };

    match k.phase {
        MotionPhase::Arrived => Step::Unchanged,
        MotionPhase::Delayed { since } => {
            let delay_ms = i64::from(vehicle.initial_delay) * 1000;
            let waited = now - since;

            if waited < delay_ms {
                let remaining_secs = (delay_ms - waited + 999) / 1000;
                let label = Kinematics::delayed_label(u64::try_from(remaining_secs).unwrap_or(0));
                vehicle.kinematics = Some(Kinematics {
                    status_label: label,
                    updated_at: now,
                    ..k.clone()
                });
                Step::Waiting
            } else {
                vehicle.kinematics = Some(at_start(
                    path,
                    MotionPhase::Moving { since: now },
                    Kinematics::MOVING_LABEL.to_string(),
                    now,
                ));
                Step::Started
            }
        }
        MotionPhase::Moving { since } => {
            let total_km = path.total_distance_km();
            let journey_ms = journey_duration_ms(total_km, vehicle.speed, multiplier);
            let progress = progress_at(millis_f64(now - since), journey_ms);

            if progress >= 1.0 {
                arrive(vehicle, path, now);
                return Step::Arrived;
            }

            let Some(position) = path.position_at(progress) else {
                return Step::Unchanged;
            };
            vehicle.kinematics = Some(Kinematics {
                progress,
                path_index: position.segment,
                heading: position.heading,
                distance_travelled: total_km * progress,
                current_lat: position.point.lat,
                current_lng: position.point.lng,
                phase: MotionPhase::Moving { since },
                status_label: Kinematics::MOVING_LABEL.to_string(),
                updated_at: now,
            });
            Step::Moved
        }
    }
}

/// Snap to the end of the path and stop for good.
fn arrive(vehicle: &mut Vehicle, path: &PlannedPath, now: EpochMillis) {
    let end = path.position_at(1.0);
    let heading = end
        .filter(|_| path.len() > 1)
        .map(|p| p.heading)
        .or_else(|| vehicle.kinematics.as_ref().map(|k| k.heading))
        .unwrap_or(0.0);
    let point = end.map(|p| p.point).or_else(|| vehicle.position());

    vehicle.current_waypoint = vehicle.target_waypoint.clone();
    vehicle.status = VehicleStatus::Stopped;
    vehicle.kinematics = Some(Kinematics {
        progress: 1.0,
        path_index: path.len().saturating_sub(1),
        heading,
        distance_travelled: path.total_distance_km(),
        current_lat: point.map_or(f64::NAN, |p| p.lat),
        current_lng: point.map_or(f64::NAN, |p| p.lng),
        phase: MotionPhase::Arrived,
        status_label: Kinematics::ARRIVED_LABEL.to_string(),
        updated_at: now,
    });
}
