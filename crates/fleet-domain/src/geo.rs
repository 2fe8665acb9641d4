//! Great-circle math on WGS84 latitude/longitude pairs.
//!
//! All functions are pure. Distances are in kilometers, bearings in degrees
//! clockwise from true north.

use crate::GeoPoint;

/// Mean Earth radius used by the Haversine formula.
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points (Haversine formula).
#[must_use]
pub fn distance_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lat = (b.lat - a.lat).to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let h = (delta_lat / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * (delta_lng / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().asin();

    EARTH_RADIUS_KM * c
}

/// Initial bearing from `a` towards `b`, normalized to `[0, 360)`.
#[must_use]
pub fn bearing_deg(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let delta_lng = (b.lng - a.lng).to_radians();

    let y = delta_lng.sin() * lat2.cos();
    let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * delta_lng.cos();

    // `rem_euclid` can round up to exactly 360.0 for tiny negatives
    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// Sum of consecutive great-circle distances along a polyline.
pub fn path_length_km<I>(points: I) -> f64
where
    I: IntoIterator<Item = GeoPoint>,
{
    let mut iter = points.into_iter();
    let Some(mut prev) = iter.next() else {
        return 0.0;
    };

    let mut total = 0.0;
    for point in iter {
        total += distance_km(prev, point);
        prev = point;
    }
    total
}

/// Linear interpolation in lat/lng space.
///
/// Good enough for the short hops routes are built from; not a geodesic.
#[must_use]
pub fn lerp(a: GeoPoint, b: GeoPoint, t: f64) -> GeoPoint {
    GeoPoint {
        lat: a.lat + (b.lat - a.lat) * t,
        lng: a.lng + (b.lng - a.lng) * t,
    }
}
