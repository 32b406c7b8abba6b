//! Geographic primitives.
//!
//! Positions, great-circle distances and bearings used by the spatial
//! edge computation. All angles are in degrees; bearings are measured
//! clockwise from true north.

/// Mean earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A geographic position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoPoint {
    /// Latitude in degrees, positive north.
    pub lat: f64,
    /// Longitude in degrees, positive east.
    pub lon: f64,
    /// Altitude in meters above the ellipsoid, when known.
    pub alt: Option<f64>,
}

impl GeoPoint {
    /// Create a position without altitude.
    pub fn new(lat: f64, lon: f64) -> Self {
        Self {
            lat,
            lon,
            alt: None,
        }
    }

    /// Create a position with altitude.
    pub fn with_alt(lat: f64, lon: f64, alt: f64) -> Self {
        Self {
            lat,
            lon,
            alt: Some(alt),
        }
    }
}

/// Great-circle distance between two positions in meters.
///
/// Haversine formula; altitude is ignored. Accurate to well under a
/// meter at the distances spatial edges operate on (tens of meters).
pub fn distance_meters(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Initial bearing from `a` to `b` in degrees, `[0, 360)`.
pub fn bearing_degrees(a: &GeoPoint, b: &GeoPoint) -> f64 {
    let lat_a = a.lat.to_radians();
    let lat_b = b.lat.to_radians();
    let d_lon = (b.lon - a.lon).to_radians();

    let y = d_lon.sin() * lat_b.cos();
    let x = lat_a.cos() * lat_b.sin() - lat_a.sin() * lat_b.cos() * d_lon.cos();

    (y.atan2(x).to_degrees() + 360.0) % 360.0
}

/// Normalize an angle in degrees to `[-180, 180)`.
pub fn normalize_angle(degrees: f64) -> f64 {
    let wrapped = (degrees % 360.0 + 360.0) % 360.0;
    if wrapped >= 180.0 {
        wrapped - 360.0
    } else {
        wrapped
    }
}
