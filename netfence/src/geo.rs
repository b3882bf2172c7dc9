//! Geographic coordinate utilities for fence containment checks.
//!
//! Distances use the haversine great-circle formula on a spherical
//! earth model, which is accurate to well under a metre at the fence
//! scale (tens of metres) this engine operates on.
//!
//! # Coordinate System
//!
//! - Latitude: degrees north (-90 to 90)
//! - Longitude: degrees east (-180 to 180)
//! - Distance: metres

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Earth's mean radius in metres.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Degrees to radians conversion factor.
const DEG_TO_RAD: f64 = PI / 180.0;

/// A WGS-84 position as reported by the platform's location service.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Latitude in degrees north.
    pub latitude: f64,
    /// Longitude in degrees east.
    pub longitude: f64,
}

impl Coordinate {
    /// Create a coordinate from degrees.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

/// Calculate the great-circle distance between two positions.
///
/// Uses the haversine formula for accuracy over short distances.
///
/// # Example
///
/// ```
/// use netfence::geo::{distance_m, Coordinate};
///
/// // One degree of latitude is roughly 111 km
/// let dist = distance_m(Coordinate::new(0.0, 0.0), Coordinate::new(1.0, 0.0));
/// assert!((dist - 111_195.0).abs() < 100.0);
/// ```
pub fn distance_m(from: Coordinate, to: Coordinate) -> f64 {
    let lat1_rad = from.latitude * DEG_TO_RAD;
    let lat2_rad = to.latitude * DEG_TO_RAD;
    let delta_lat = (to.latitude - from.latitude) * DEG_TO_RAD;
    let delta_lon = (to.longitude - from.longitude) * DEG_TO_RAD;

    // Haversine formula
    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_M * c
}
