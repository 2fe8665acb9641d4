//! Waypoint catalog: the fixed places vehicles travel between.

use std::path::Path;

use fleet_domain::{DomainError, Waypoint};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{Result, RouteError, SimError};

/// Built-in Islamabad landmarks.
const ISLAMABAD: &[(&str, f64, f64)] = &[
    ("Faisal Mosque", 33.7294, 73.0367),
    ("G-9 Markaz", 33.6938, 73.0651),
    ("Centaurus Mall", 33.7077, 73.0498),
    ("F-6 Supermarket", 33.7279, 73.0757),
    ("Pakistan Monument", 33.6931, 73.0689),
    ("Daman-e-Koh", 33.7381, 73.0563),
    ("Zero Point", 33.6934, 73.0482),
    ("I-8 Markaz", 33.6678, 73.0756),
    ("Rawal Lake", 33.7020, 73.1290),
    ("E-7 Sector", 33.7250, 73.0440),
    ("Bahria Enclave", 33.7466, 73.1927),
    ("New Islamabad Airport", 33.5491, 72.8252),
];

/// Waypoint as written in a catalog file; ids are optional.
#[derive(Debug, Deserialize)]
struct WaypointEntry {
    #[serde(default)]
    id: Option<Uuid>,
    name: String,
    lat: f64,
    lng: f64,
}

/// Immutable set of waypoints, loaded once.
#[derive(Debug, Clone)]
pub struct WaypointCatalog {
    waypoints: Vec<Waypoint>,
}

impl WaypointCatalog {
    /// Build a catalog, rejecting unusable coordinates.
    ///
    /// # Errors
    ///
    /// [`RouteError::NoWaypoints`] for an empty list,
    /// [`DomainError::InvalidCoordinates`] for out-of-range points.
    pub fn new(waypoints: Vec<Waypoint>) -> Result<Self> {
        if waypoints.is_empty() {
            return Err(RouteError::NoWaypoints.into());
        }
        if let Some(bad) = waypoints.iter().find(|w| !w.point().is_usable()) {
            return Err(DomainError::InvalidCoordinates {
                lat: bad.lat,
                lng: bad.lng,
            }
            .into());
        }
        Ok(Self { waypoints })
    }

    #[must_use]
    pub fn islamabad() -> Self {
        Self {
            waypoints: ISLAMABAD
                .iter()
                .map(|&(name, lat, lng)| Waypoint::new(name, lat, lng))
                .collect(),
        }
    }

    /// Load a JSON array of `{ "name", "lat", "lng", "id"? }`.
    ///
    /// # Errors
    ///
    /// [`SimError::Catalog`] when the file cannot be read or parsed, plus the
    /// errors of [`WaypointCatalog::new`].
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let catalog_error = |reason: String| SimError::Catalog {
            path: path.display().to_string(),
            reason,
        };

        let text = std::fs::read_to_string(path).map_err(|e| catalog_error(e.to_string()))?;
        Self::from_json(&text).map_err(|e| match e {
            SimError::Catalog { reason, .. } => catalog_error(reason),
            other => other,
        })
    }

    /// Parse the JSON catalog format.
    ///
    /// # Errors
    ///
    /// See [`WaypointCatalog::from_json_file`].
    pub fn from_json(text: &str) -> Result<Self> {
        let entries: Vec<WaypointEntry> =
            serde_json::from_str(text).map_err(|e| SimError::Catalog {
                path: "<inline>".to_string(),
                reason: e.to_string(),
            })?;

        let waypoints = entries
            .into_iter()
            .map(|e| Waypoint {
                id: e.id.unwrap_or_else(Uuid::new_v4),
                name: e.name,
                lat: e.lat,
                lng: e.lng,
            })
            .collect();
        Self::new(waypoints)
    }

    #[must_use]
    pub fn waypoints(&self) -> &[Waypoint] {
        &self.waypoints
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.waypoints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waypoints.is_empty()
    }

    /// # Errors
    ///
    /// [`RouteError::UnknownWaypoint`] when no waypoint has this id.
    pub fn get(&self, id: Uuid) -> std::result::Result<&Waypoint, RouteError> {
        self.waypoints
            .iter()
            .find(|w| w.id == id)
            .ok_or(RouteError::UnknownWaypoint(id))
    }

    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<&Waypoint> {
        self.waypoints
            .iter()
            .find(|w| w.name.eq_ignore_ascii_case(name))
    }

    /// Two distinct random waypoints; `None` with fewer than two.
    pub fn random_pair<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<(&Waypoint, &Waypoint)> {
        let mut picked = self.waypoints.choose_multiple(rng, 2);
        Some((picked.next()?, picked.next()?))
    }
}
