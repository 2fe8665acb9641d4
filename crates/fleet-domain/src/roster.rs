//! Ordered, capacity-bounded vehicle collection.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{DomainError, Vehicle, VehicleStatus};

/// Aggregate counters carried with every position delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterStats {
    pub total_vehicles: usize,
    pub active_vehicles: usize,
    pub completed_journeys: usize,
}

/// The vehicles of one simulation, in placement order.
///
/// Ids are unique. Admission is bounded by `capacity`; wholesale replacement
/// (used when mirroring a producer) is not.
#[derive(Debug, Clone, Default)]
pub struct Roster {
    vehicles: Vec<Vehicle>,
    capacity: usize,
}

impl Roster {
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            vehicles: Vec::new(),
            capacity,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Add a vehicle.
    ///
    /// # Errors
    ///
    /// [`DomainError::Capacity`] when full, [`DomainError::DuplicateVehicle`]
    /// when the id is already present. The roster is unchanged on error.
    pub fn admit(&mut self, vehicle: Vehicle) -> Result<(), DomainError> {
        if self.vehicles.len() >= self.capacity {
            return Err(DomainError::Capacity {
                capacity: self.capacity,
            });
        }
        if self.contains(vehicle.id) {
            return Err(DomainError::DuplicateVehicle(vehicle.id));
        }
        self.vehicles.push(vehicle);
        Ok(())
    }

    /// Replace every vehicle, keeping the first occurrence of duplicate ids.
    pub fn replace_all(&mut self, vehicles: Vec<Vehicle>) {
        self.vehicles.clear();
        for vehicle in vehicles {
            if !self.contains(vehicle.id) {
                self.vehicles.push(vehicle);
            }
        }
    }

    /// Append without the capacity check. Duplicate ids are ignored.
    pub fn insert_unbounded(&mut self, vehicle: Vehicle) -> bool {
        if self.contains(vehicle.id) {
            return false;
        }
        self.vehicles.push(vehicle);
        true
    }

    pub fn clear(&mut self) {
        self.vehicles.clear();
    }

    #[must_use]
    pub fn contains(&self, id: Uuid) -> bool {
        self.vehicles.iter().any(|v| v.id == id)
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<&Vehicle> {
        self.vehicles.iter().find(|v| v.id == id)
    }

    pub fn get_mut(&mut self, id: Uuid) -> Option<&mut Vehicle> {
        self.vehicles.iter_mut().find(|v| v.id == id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Vehicle> {
        self.vehicles.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Vehicle> {
        self.vehicles.iter_mut()
    }

    #[must_use]
    pub fn vehicles(&self) -> &[Vehicle] {
        &self.vehicles
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }

    /// Reset every vehicle to idle and drop its kinematics.
    pub fn reset_all(&mut self) {
        self.vehicles.iter_mut().for_each(Vehicle::reset);
    }

    /// True when there is at least one vehicle and every one has stopped.
    #[must_use]
    pub fn all_stopped(&self) -> bool {
        !self.vehicles.is_empty()
            && self
                .vehicles
                .iter()
                .all(|v| v.status == VehicleStatus::Stopped)
    }

    #[must_use]
    pub fn stats(&self) -> RosterStats {
        let count = |status| self.vehicles.iter().filter(|v| v.status == status).count();
        RosterStats {
            total_vehicles: self.vehicles.len(),
            active_vehicles: count(VehicleStatus::Moving),
            completed_journeys: count(VehicleStatus::Stopped),
        }
    }
}

impl<'a> IntoIterator for &'a Roster {
    type Item = &'a Vehicle;
    type IntoIter = std::slice::Iter<'a, Vehicle>;

    fn into_iter(self) -> Self::IntoIter {
        self.vehicles.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{PathPoint, VehicleProfile, Waypoint};
    use fake::Fake;

    fn vehicle() -> Vehicle {
        let a = Waypoint::new("Faisal Mosque", 33.7294, 73.0367);
        let plate_no: u16 = (100..999).fake();
        Vehicle::new(
            VehicleProfile::unknown(format!("ICT-{plate_no}")),
            a.clone(),
            a.clone(),
            50.0,
            0,
            vec![PathPoint::anchor(&a)],
        )
        .unwrap()
    }

    #[test]
    fn test_admit_until_capacity() {
        let mut roster = Roster::new(2);
        roster.admit(vehicle()).unwrap();
        roster.admit(vehicle()).unwrap();

        let err = roster.admit(vehicle()).unwrap_err();
        assert_eq!(err, DomainError::Capacity { capacity: 2 });
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn test_admit_rejects_duplicate_id() {
        let mut roster = Roster::new(5);
        let v = vehicle();
        roster.admit(v.clone()).unwrap();
        assert_eq!(
            roster.admit(v.clone()).unwrap_err(),
            DomainError::DuplicateVehicle(v.id)
        );
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_replace_all_ignores_capacity_and_dedupes() {
        let mut roster = Roster::new(1);
        let v = vehicle();
        roster.replace_all(vec![v.clone(), vehicle(), v]);
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn test_stats() {
        let mut roster = Roster::new(5);
        for _ in 0..3 {
            roster.admit(vehicle()).unwrap();
        }
        roster.iter_mut().next().unwrap().status = VehicleStatus::Moving;
        roster.iter_mut().last().unwrap().status = VehicleStatus::Stopped;

        let stats = roster.stats();
        assert_eq!(stats.total_vehicles, 3);
        assert_eq!(stats.active_vehicles, 1);
        assert_eq!(stats.completed_journeys, 1);
        assert!(!roster.all_stopped());
    }

    #[test]
    fn test_empty_roster_is_not_all_stopped() {
        assert!(!Roster::new(3).all_stopped());
    }
}
