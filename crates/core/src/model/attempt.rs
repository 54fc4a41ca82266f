use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geo::Coordinate;
use crate::model::ids::StepId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum AttemptError {
    #[error("unknown validation method: {0}")]
    UnknownMethod(String),
}

/// How a user claims to have reached a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMethod {
    /// Device location must fall inside the step radius.
    Geolocation,
    /// Administrative override; no distance check.
    Manual,
    /// On-site code scan; a reported location is still checked when present.
    QrCode,
}

impl ValidationMethod {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationMethod::Geolocation => "geolocation",
            ValidationMethod::Manual => "manual",
            ValidationMethod::QrCode => "qr_code",
        }
    }

    /// # Errors
    ///
    /// Returns `AttemptError::UnknownMethod` for anything other than the three stored names.
    pub fn parse(s: &str) -> Result<Self, AttemptError> {
        match s {
            "geolocation" => Ok(Self::Geolocation),
            "manual" => Ok(Self::Manual),
            "qr_code" => Ok(Self::QrCode),
            other => Err(AttemptError::UnknownMethod(other.to_owned())),
        }
    }
}

/// A device-reported position with optional GPS accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReportedLocation {
    pub coordinate: Coordinate,
    pub accuracy_meters: Option<f64>,
}

impl ReportedLocation {
    #[must_use]
    pub fn new(coordinate: Coordinate, accuracy_meters: Option<f64>) -> Self {
        Self {
            coordinate,
            accuracy_meters,
        }
    }
}

/// One request to mark a step complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationAttempt {
    pub step_id: StepId,
    pub location: Option<ReportedLocation>,
    pub method: ValidationMethod,
    pub requested_at: DateTime<Utc>,
    /// Skip the short duplicate window (never the in-flight check).
    pub force: bool,
}

impl ValidationAttempt {
    #[must_use]
    pub fn geolocation(step_id: StepId, location: ReportedLocation, at: DateTime<Utc>) -> Self {
        Self {
            step_id,
            location: Some(location),
            method: ValidationMethod::Geolocation,
            requested_at: at,
            force: false,
        }
    }

    #[must_use]
    pub fn manual(step_id: StepId, at: DateTime<Utc>) -> Self {
        Self {
            step_id,
            location: None,
            method: ValidationMethod::Manual,
            requested_at: at,
            force: false,
        }
    }

    #[must_use]
    pub fn qr_code(step_id: StepId, location: Option<ReportedLocation>, at: DateTime<Utc>) -> Self {
        Self {
            step_id,
            location,
            method: ValidationMethod::QrCode,
            requested_at: at,
            force: false,
        }
    }

    #[must_use]
    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}

/// Entry in a session's validation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub step_id: StepId,
    pub at: DateTime<Utc>,
    pub method: ValidationMethod,
    pub success: bool,
}
