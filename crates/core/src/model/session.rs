use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::attempt::{ValidationMethod, ValidationRecord};
use crate::model::ids::{SessionKey, StepId};
use crate::model::step::{Journey, Step};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SessionStateError {
    #[error("session is no longer active")]
    Inactive,

    #[error("step {order} is already completed")]
    AlreadyCompleted { order: u32 },

    #[error("step order {order} is outside a journey of {step_count} steps")]
    StepOutOfRange { order: u32, step_count: u32 },

    #[error("step {step_id} does not belong to this session's journey")]
    ForeignStep { step_id: StepId },

    #[error("a journey session needs at least one step")]
    EmptyJourney,

    #[error("invalid persisted session: {0}")]
    InvalidPersistedState(String),
}

/// Plain persisted shape of a session, used by storage adapters.
///
/// Turning it back into a `JourneySession` re-checks every invariant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub step_count: u32,
    pub current_step_index: u32,
    pub completed_steps: BTreeSet<u32>,
    pub total_points_earned: u64,
    pub is_active: bool,
    pub validation_history: Vec<ValidationRecord>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub abandoned_at: Option<DateTime<Utc>>,
    pub version: u64,
}

/// What a successful completion changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionEffect {
    pub points_added: u32,
    pub journey_completed: bool,
}

/// Durable progress of one user through one journey.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JourneySession {
    key: SessionKey,
    step_count: u32,
    current_step_index: u32,
    completed_steps: BTreeSet<u32>,
    total_points_earned: u64,
    is_active: bool,
    validation_history: Vec<ValidationRecord>,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    abandoned_at: Option<DateTime<Utc>>,
    version: u64,
}

impl JourneySession {
    /// Fresh, active session positioned at the first step.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::EmptyJourney` if `step_count` is zero.
    pub fn new(
        key: SessionKey,
        step_count: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionStateError> {
        if step_count == 0 {
            return Err(SessionStateError::EmptyJourney);
        }
        Ok(Self {
            key,
            step_count,
            current_step_index: 0,
            completed_steps: BTreeSet::new(),
            total_points_earned: 0,
            is_active: true,
            validation_history: Vec::new(),
            created_at: now,
            last_activity_at: now,
            completed_at: None,
            abandoned_at: None,
            version: 0,
        })
    }

    /// Rehydrate a session from storage.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError::InvalidPersistedState` when the snapshot
    /// breaks a session invariant.
    pub fn from_snapshot(s: SessionSnapshot) -> Result<Self, SessionStateError> {
        let invalid = |msg: String| Err(SessionStateError::InvalidPersistedState(msg));

        if s.step_count == 0 {
            return invalid("step_count is zero".into());
        }
        if let Some(max) = s.completed_steps.last() {
            if *max >= s.step_count {
                return invalid(format!(
                    "completed step {max} outside journey of {} steps",
                    s.step_count
                ));
            }
            if s.current_step_index <= *max {
                return invalid(format!(
                    "current_step_index {} behind completed step {max}",
                    s.current_step_index
                ));
            }
        }
        if s.current_step_index > s.step_count {
            return invalid(format!(
                "current_step_index {} past journey end",
                s.current_step_index
            ));
        }
        if s.completed_at.is_some() && s.abandoned_at.is_some() {
            return invalid("session both completed and abandoned".into());
        }
        let terminal = s.completed_at.is_some() || s.abandoned_at.is_some();
        if s.is_active == terminal {
            return invalid("is_active disagrees with terminal timestamps".into());
        }
        let fully_completed = s.completed_steps.len() == s.step_count as usize;
        if fully_completed != s.completed_at.is_some() {
            return invalid("completed_at disagrees with completed steps".into());
        }
        if s.last_activity_at < s.created_at {
            return invalid("last_activity_at before created_at".into());
        }

        let mut succeeded = HashSet::new();
        for record in s.validation_history.iter().filter(|r| r.success) {
            if !succeeded.insert(record.step_id) {
                return invalid(format!("step {} succeeded twice", record.step_id));
            }
        }

        Ok(Self {
            key: s.key,
            step_count: s.step_count,
            current_step_index: s.current_step_index,
            completed_steps: s.completed_steps,
            total_points_earned: s.total_points_earned,
            is_active: s.is_active,
            validation_history: s.validation_history,
            created_at: s.created_at,
            last_activity_at: s.last_activity_at,
            completed_at: s.completed_at,
            abandoned_at: s.abandoned_at,
            version: s.version,
        })
    }

    #[must_use]
    pub fn to_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            key: self.key,
            step_count: self.step_count,
            current_step_index: self.current_step_index,
            completed_steps: self.completed_steps.clone(),
            total_points_earned: self.total_points_earned,
            is_active: self.is_active,
            validation_history: self.validation_history.clone(),
            created_at: self.created_at,
            last_activity_at: self.last_activity_at,
            completed_at: self.completed_at,
            abandoned_at: self.abandoned_at,
            version: self.version,
        }
    }

    #[must_use]
    pub fn key(&self) -> SessionKey {
        self.key
    }

    #[must_use]
    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    #[must_use]
    pub fn current_step_index(&self) -> u32 {
        self.current_step_index
    }

    #[must_use]
    pub fn completed_steps(&self) -> &BTreeSet<u32> {
        &self.completed_steps
    }

    #[must_use]
    pub fn total_points_earned(&self) -> u64 {
        self.total_points_earned
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.is_active
    }

    #[must_use]
    pub fn validation_history(&self) -> &[ValidationRecord] {
        &self.validation_history
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    #[must_use]
    pub fn abandoned_at(&self) -> Option<DateTime<Utc>> {
        self.abandoned_at
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn is_step_completed(&self, order: u32) -> bool {
        self.completed_steps.contains(&order)
    }

    /// True if the point total agrees with the catalog for the completed steps.
    #[must_use]
    pub fn points_match(&self, journey: &Journey) -> bool {
        journey.total_points_for(&self.completed_steps) == self.total_points_earned
    }

    /// Mark `step` completed, award its catalog points and advance the cursor.
    ///
    /// Finishing the last outstanding step makes the session terminal.
    ///
    /// # Errors
    ///
    /// Returns `SessionStateError` if the session is inactive, the step is from
    /// another journey or out of range, or it was already completed. The
    /// session is left untouched on error.
    pub fn apply_completion(
        &mut self,
        step: &Step,
        method: ValidationMethod,
        at: DateTime<Utc>,
    ) -> Result<CompletionEffect, SessionStateError> {
        if !self.is_active {
            return Err(SessionStateError::Inactive);
        }
        if step.journey_id() != self.key.journey_id {
            return Err(SessionStateError::ForeignStep { step_id: step.id() });
        }
        let order = step.order();
        if order >= self.step_count {
            return Err(SessionStateError::StepOutOfRange {
                order,
                step_count: self.step_count,
            });
        }
        let already_logged = self
            .validation_history
            .iter()
            .any(|r| r.success && r.step_id == step.id());
        if self.completed_steps.contains(&order) || already_logged {
            return Err(SessionStateError::AlreadyCompleted { order });
        }

        self.completed_steps.insert(order);
        self.total_points_earned = self
            .total_points_earned
            .saturating_add(u64::from(step.points_awarded()));
        self.current_step_index = self.current_step_index.max(order.saturating_add(1));
        self.validation_history.push(ValidationRecord {
            step_id: step.id(),
            at,
            method,
            success: true,
        });
        self.touch(at);
        self.version += 1;

        let journey_completed = self.completed_steps.len() == self.step_count as usize;
        if journey_completed {
            self.is_active = false;
            self.completed_at = Some(at);
        }

        Ok(CompletionEffect {
            points_added: step.points_awarded(),
            journey_completed,
        })
    }

    /// End an active session without completing it. Returns false if the
    /// session was already terminal.
    pub fn abandon(&mut self, at: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        self.is_active = false;
        self.abandoned_at = Some(at);
        self.touch(at);
        self.version += 1;
        true
    }

    /// Record activity. Never moves the timestamp backwards and does not
    /// count as a versioned change.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity_at {
            self.last_activity_at = at;
        }
    }
}
