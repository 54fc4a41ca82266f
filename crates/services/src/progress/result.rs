use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use journey_core::model::{JourneyId, JourneySession, UserId};
use storage::repository::LogOutcome;

/// Why a validation attempt ended the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationReason {
    Completed,
    AlreadyCompleted,
    SessionInactive,
    DuplicateRequest,
    LocationRequired,
    TooFar,
    StorageConflict,
}

impl ValidationReason {
    /// Completed and already-completed both count as success.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(
            self,
            ValidationReason::Completed | ValidationReason::AlreadyCompleted
        )
    }

    /// Log outcome for this reason; duplicates are never logged.
    pub(crate) fn log_outcome(self) -> Option<LogOutcome> {
        match self {
            ValidationReason::Completed => Some(LogOutcome::Completed),
            ValidationReason::AlreadyCompleted => Some(LogOutcome::AlreadyCompleted),
            ValidationReason::SessionInactive => Some(LogOutcome::SessionInactive),
            ValidationReason::LocationRequired => Some(LogOutcome::LocationRequired),
            ValidationReason::TooFar => Some(LogOutcome::TooFar),
            ValidationReason::StorageConflict => Some(LogOutcome::StorageConflict),
            ValidationReason::DuplicateRequest => None,
        }
    }
}

/// Read model of a session for callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JourneyProgress {
    pub user_id: UserId,
    pub journey_id: JourneyId,
    pub step_count: u32,
    pub current_step_index: u32,
    pub completed_steps: BTreeSet<u32>,
    pub total_points_earned: u64,
    pub is_active: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub abandoned_at: Option<DateTime<Utc>>,
}

impl From<&JourneySession> for JourneyProgress {
    fn from(session: &JourneySession) -> Self {
        let key = session.key();
        Self {
            user_id: key.user_id,
            journey_id: key.journey_id,
            step_count: session.step_count(),
            current_step_index: session.current_step_index(),
            completed_steps: session.completed_steps().clone(),
            total_points_earned: session.total_points_earned(),
            is_active: session.is_active(),
            completed_at: session.completed_at(),
            abandoned_at: session.abandoned_at(),
        }
    }
}

/// Answer to a single `validate_step` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationResult {
    pub success: bool,
    pub reason: ValidationReason,
    /// Points awarded by this attempt; only set when it completed the step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub points_earned: Option<u32>,
    /// Unrounded distance to the step, when a location was checked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distance_meters: Option<f64>,
    /// Radius the distance was checked against.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub radius_meters: Option<f64>,
    pub progress: JourneyProgress,
}

impl ValidationResult {
    pub(crate) fn new(reason: ValidationReason, session: &JourneySession) -> Self {
        Self {
            success: reason.is_success(),
            reason,
            points_earned: None,
            distance_meters: None,
            radius_meters: None,
            progress: JourneyProgress::from(session),
        }
    }

    pub(crate) fn with_points(mut self, points: u32) -> Self {
        self.points_earned = Some(points);
        self
    }

    pub(crate) fn with_distance(mut self, distance: Option<f64>, radius: f64) -> Self {
        if distance.is_some() {
            self.distance_meters = distance;
            self.radius_meters = Some(radius);
        }
        self
    }
}
