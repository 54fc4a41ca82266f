//! Great-circle distance and proximity checks.
//!
//! Distances are haversine distances on a sphere of radius 6371 km, computed
//! in meters as `f64`. Nothing is rounded before a comparison; rounding is only
//! for display.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Mean Earth radius in meters.
pub const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum GeoError {
    #[error("latitude must be finite and within [-90, 90], got {0}")]
    InvalidLatitude(f64),

    #[error("longitude must be finite and within [-180, 180], got {0}")]
    InvalidLongitude(f64),

    #[error("distance must be finite and non-negative, got {0}")]
    InvalidDistance(f64),
}

/// A validated WGS84 point in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate", into = "RawCoordinate")]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
}

#[derive(Serialize, Deserialize)]
struct RawCoordinate {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<RawCoordinate> for Coordinate {
    type Error = GeoError;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        Coordinate::new(raw.latitude, raw.longitude)
    }
}

impl From<Coordinate> for RawCoordinate {
    fn from(c: Coordinate) -> Self {
        Self {
            latitude: c.latitude,
            longitude: c.longitude,
        }
    }
}

impl Coordinate {
    /// Build a coordinate, rejecting NaN, infinities and out-of-range values.
    ///
    /// # Errors
    ///
    /// Returns `GeoError::InvalidLatitude` or `GeoError::InvalidLongitude`.
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, GeoError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(GeoError::InvalidLatitude(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(GeoError::InvalidLongitude(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    #[must_use]
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    #[must_use]
    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// The point `meters` due north along the meridian.
    ///
    /// # Errors
    ///
    /// Returns `GeoError::InvalidDistance` for a negative or non-finite
    /// distance, and `GeoError::InvalidLatitude` if the result would cross a pole.
    pub fn offset_north(&self, meters: f64) -> Result<Self, GeoError> {
        if !meters.is_finite() || meters < 0.0 {
            return Err(GeoError::InvalidDistance(meters));
        }
        let delta = (meters / EARTH_RADIUS_METERS).to_degrees();
        Self::new(self.latitude + delta, self.longitude)
    }
}

/// Haversine distance between two points, in meters.
#[must_use]
pub fn distance_meters(a: Coordinate, b: Coordinate) -> f64 {
    let phi1 = a.latitude.to_radians();
    let phi2 = b.latitude.to_radians();
    let d_phi = (b.latitude - a.latitude).to_radians();
    let d_lambda = (b.longitude - a.longitude).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    // Clamp guards sqrt(1 - h) against h drifting past 1 for antipodal points.
    let h = h.clamp(0.0, 1.0);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_METERS * c
}

/// True when `b` lies within `radius_meters` of `a`. The boundary is inclusive.
#[must_use]
pub fn is_within_radius(a: Coordinate, b: Coordinate, radius_meters: f64) -> bool {
    distance_meters(a, b) <= radius_meters
}

/// Whole meters, for user-facing messages only.
#[must_use]
pub fn round_for_display(meters: f64) -> u64 {
    if !meters.is_finite() || meters <= 0.0 {
        return 0;
    }
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rounded = meters.round() as u64;
    rounded
}
