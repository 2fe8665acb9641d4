//! Route composition and position lookup along a planned path.

use fleet_domain::geo::{bearing_deg, distance_km, lerp};
use fleet_domain::{GeoPoint, PathPoint, Waypoint};
use tracing::{debug, warn};

use crate::error::RouteError;

/// Below this direct distance no intermediate stops are considered.
pub const DIRECT_ROUTE_KM: f64 = 5.0;

/// A stop is on the way if the detour through it stays under this factor.
pub const DETOUR_FACTOR: f64 = 1.3;

pub const MAX_INTERMEDIATES: usize = 2;

/// Equal sub-segments between two consecutive anchors.
pub const SUBDIVISIONS: usize = 5;

/// Build the planned path from `source` to `destination`.
///
/// Long trips pass through up to two on-the-way stops from `candidates`,
/// nearest to the source first. Every leg is subdivided into
/// [`SUBDIVISIONS`] equal pieces. A trip that starts where it ends yields a
/// single-point path.
#[must_use]
pub fn compose(source: &Waypoint, destination: &Waypoint, candidates: &[Waypoint]) -> PlannedPath {
    if source.id == destination.id || source.point() == destination.point() {
        let err = RouteError::Degenerate {
            name: source.name.clone(),
        };
        warn!(error = %err, "single-point route");
        return PlannedPath::new(vec![PathPoint::anchor(source)]);
    }

    let direct = distance_km(source.point(), destination.point());
    let stops = if direct < DIRECT_ROUTE_KM {
        Vec::new()
    } else {
        intermediates(source, destination, direct, candidates)
    };

    debug!(
        from = %source.name,
        to = %destination.name,
        direct_km = direct,
        stops = stops.len(),
        "route composed"
    );

    let anchors: Vec<&Waypoint> = std::iter::once(source)
        .chain(stops)
        .chain(std::iter::once(destination))
        .collect();

    let mut points = Vec::with_capacity((anchors.len() - 1) * SUBDIVISIONS + 1);
    for pair in anchors.windows(2) {
        let (from, to) = (pair[0], pair[1]);
        points.push(PathPoint::anchor(from));
        for step in 1..SUBDIVISIONS {
            #[allow(clippy::cast_precision_loss)]
            let t = step as f64 / SUBDIVISIONS as f64;
            points.push(PathPoint::interpolated(lerp(from.point(), to.point(), t)));
        }
    }
    points.push(PathPoint::anchor(destination));

    PlannedPath::new(points)
}

fn intermediates<'a>(
    source: &Waypoint,
    destination: &Waypoint,
    direct: f64,
    candidates: &'a [Waypoint],
) -> Vec<&'a Waypoint> {
    let mut on_the_way: Vec<(f64, &Waypoint)> = candidates
        .iter()
        .filter(|w| w.id != source.id && w.id != destination.id)
        .filter_map(|w| {
            let from_source = distance_km(source.point(), w.point());
            let detour = from_source + distance_km(w.point(), destination.point());
            (detour < DETOUR_FACTOR * direct).then_some((from_source, w))
        })
        .collect();

    on_the_way.sort_by(|a, b| a.0.total_cmp(&b.0));
    on_the_way
        .into_iter()
        .take(MAX_INTERMEDIATES)
        .map(|(_, w)| w)
        .collect()
}

/// Where a vehicle is at some fraction of its path.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathPosition {
    pub point: GeoPoint,
    /// Bearing of the containing segment.
    pub heading: f64,
    /// Index of the segment's first point.
    pub segment: usize,
}

/// A planned path with its cumulative segment distances.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedPath {
    points: Vec<PathPoint>,
    /// `cumulative[i]` is the distance from the start to `points[i]`.
    cumulative: Vec<f64>,
}

impl PlannedPath {
    #[must_use]
    pub fn new(points: Vec<PathPoint>) -> Self {
        let mut cumulative = Vec::with_capacity(points.len());
        let mut total = 0.0;
        for (i, point) in points.iter().enumerate() {
            if i > 0 {
                total += distance_km(points[i - 1].point(), point.point());
            }
            cumulative.push(total);
        }
        Self { points, cumulative }
    }

    #[must_use]
    pub fn points(&self) -> &[PathPoint] {
        &self.points
    }

    #[must_use]
    pub fn into_points(self) -> Vec<PathPoint> {
        self.points
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    #[must_use]
    pub fn total_distance_km(&self) -> f64 {
        self.cumulative.last().copied().unwrap_or(0.0)
    }

    /// Anchors, in travel order.
    pub fn waypoint_points(&self) -> impl Iterator<Item = &PathPoint> {
        self.points.iter().filter(|p| p.is_waypoint)
    }

    /// Position at `progress` (clamped to `[0, 1]`) of the total distance.
    ///
    /// `None` only for an empty path.
    #[must_use]
    pub fn position_at(&self, progress: f64) -> Option<PathPosition> {
        let first = self.points.first()?;
        let last_index = self.points.len() - 1;

        if last_index == 0 {
            return Some(PathPosition {
                point: first.point(),
                heading: 0.0,
                segment: 0,
            });
        }

        let progress = if progress.is_nan() {
            0.0
        } else {
            progress.clamp(0.0, 1.0)
        };
        let segment_heading =
            |i: usize| bearing_deg(self.points[i].point(), self.points[i + 1].point());

        if progress >= 1.0 {
            return Some(PathPosition {
                point: self.points[last_index].point(),
                heading: segment_heading(last_index - 1),
                segment: last_index - 1,
            });
        }

        let target = self.total_distance_km() * progress;
        let segment = self
            .cumulative
            .partition_point(|&d| d <= target)
            .saturating_sub(1)
            .min(last_index - 1);

        let (from, to) = (self.points[segment].point(), self.points[segment + 1].point());
        let length = self.cumulative[segment + 1] - self.cumulative[segment];
        let t = if length > 0.0 {
            (target - self.cumulative[segment]) / length
        } else {
            0.0
        };

        Some(PathPosition {
            point: lerp(from, to, t),
            heading: segment_heading(segment),
            segment,
        })
    }
}

impl From<Vec<PathPoint>> for PlannedPath {
    fn from(points: Vec<PathPoint>) -> Self {
        Self::new(points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::WaypointCatalog;

    fn faisal_mosque() -> Waypoint {
        Waypoint::new("Faisal Mosque", 33.7294, 73.0367)
    }

    fn g9_markaz() -> Waypoint {
        Waypoint::new("G-9 Markaz", 33.6938, 73.0651)
    }

    #[test]
    fn test_short_trip_is_direct() {
        let (a, b) = (faisal_mosque(), g9_markaz());
        let catalog = WaypointCatalog::islamabad();
        let path = compose(&a, &b, catalog.waypoints());

        assert_eq!(path.len(), SUBDIVISIONS + 1);
        assert_eq!(path.waypoint_points().count(), 2);
        assert_eq!(path.points()[0].point(), a.point());
        assert_eq!(path.points()[SUBDIVISIONS].point(), b.point());
        assert_eq!(path.points()[0].waypoint_id, Some(a.id));
        assert_eq!(path.points()[SUBDIVISIONS].waypoint_id, Some(b.id));
        assert!(path.points()[1..SUBDIVISIONS].iter().all(|p| !p.is_waypoint));
    }

    #[test]
    fn test_interpolation_is_evenly_spaced() {
        let path = compose(&faisal_mosque(), &g9_markaz(), &[]);
        let lats: Vec<f64> = path.points().iter().map(|p| p.lat).collect();
        let step = (g9_markaz().lat - faisal_mosque().lat) / 5.0;
        for pair in lats.windows(2) {
            assert!((pair[1] - pair[0] - step).abs() < 1e-9);
        }
    }

    #[test]
    fn test_long_trip_takes_nearest_on_the_way_stops() {
        let source = Waypoint::new("West", 33.70, 72.90);
        let destination = Waypoint::new("East", 33.70, 73.10);
        let near = Waypoint::new("Near", 33.701, 72.95);
        let mid = Waypoint::new("Mid", 33.702, 73.00);
        let far = Waypoint::new("Far", 33.701, 73.05);
        let off_route = Waypoint::new("Off", 33.90, 73.00);
        let candidates = vec![
            far.clone(),
            off_route,
            mid.clone(),
            near.clone(),
            source.clone(),
        ];

        let path = compose(&source, &destination, &candidates);
        let anchors: Vec<_> = path.waypoint_points().filter_map(|p| p.waypoint_id).collect();

        assert_eq!(anchors, vec![source.id, near.id, mid.id, destination.id]);
        assert_eq!(path.len(), 3 * SUBDIVISIONS + 1);
    }

    #[test]
    fn test_cumulative_distance_never_shorter_than_direct() {
        let catalog = WaypointCatalog::islamabad();
        for source in catalog.waypoints() {
            for destination in catalog.waypoints() {
                if source.id == destination.id {
                    continue;
                }
                let path = compose(source, destination, catalog.waypoints());
                let direct = distance_km(source.point(), destination.point());
                assert!(path.total_distance_km() >= direct - 1e-9);
            }
        }
    }

    #[test]
    fn test_same_source_and_destination_yields_single_point() {
        let a = faisal_mosque();
        let path = compose(&a, &a, &[]);
        assert_eq!(path.len(), 1);
        assert!(path.total_distance_km().abs() < f64::EPSILON);

        let twin = Waypoint::new("Twin", a.lat, a.lng);
        assert_eq!(compose(&a, &twin, &[]).len(), 1);
    }

    #[test]
    fn test_position_at_endpoints() {
        let path = compose(&faisal_mosque(), &g9_markaz(), &[]);
        let start = path.position_at(0.0).unwrap();
        let end = path.position_at(1.0).unwrap();

        assert_eq!(start.point, faisal_mosque().point());
        assert_eq!(start.segment, 0);
        assert_eq!(end.point, g9_markaz().point());
        assert_eq!(end.segment, path.len() - 2);
    }

    #[test]
    fn test_position_at_is_monotone_and_heading_follows_segment() {
        let path = compose(&faisal_mosque(), &g9_markaz(), &[]);
        let mut last_segment = 0;
        for step in 0..=100 {
            let pos = path.position_at(f64::from(step) / 100.0).unwrap();
            assert!(pos.segment >= last_segment);
            last_segment = pos.segment;
            assert!((pos.heading - 146.42).abs() < 0.1);
        }
    }

    #[test]
    fn test_position_at_half_distance() {
        let path = compose(&faisal_mosque(), &g9_markaz(), &[]);
        let mid = path.position_at(0.5).unwrap();
        let travelled = distance_km(faisal_mosque().point(), mid.point);
        assert!((travelled - path.total_distance_km() / 2.0).abs() < 0.01);
    }

    #[test]
    fn test_position_at_clamps_and_handles_degenerate_paths() {
        let path = compose(&faisal_mosque(), &g9_markaz(), &[]);
        assert_eq!(path.position_at(-1.0), path.position_at(0.0));
        assert_eq!(path.position_at(7.0), path.position_at(1.0));

        let single = PlannedPath::new(vec![PathPoint::anchor(&faisal_mosque())]);
        assert_eq!(
            single.position_at(0.5).unwrap().point,
            faisal_mosque().point()
        );
        assert!(PlannedPath::new(Vec::new()).position_at(0.5).is_none());
    }
}
