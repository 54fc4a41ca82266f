use std::sync::Arc;

use tokio::sync::broadcast;

use journey_core::geo::{distance_meters, is_within_radius, round_for_display};
use journey_core::model::{
    Journey, JourneyId, JourneySession, SessionKey, Step, StepId, UserId, ValidationAttempt,
    ValidationMethod,
};
use journey_core::time::Clock;
use storage::repository::{
    CommitOutcome, SessionRepository, StepCatalog, StepCompletion, Storage, StorageError,
    ValidationLogRecord, ValidationLogRepository,
};

use super::duplicate::{Admission, DuplicateGuard};
use super::locks::SessionLocks;
use super::result::{JourneyProgress, ValidationReason, ValidationResult};
use crate::config::EngineConfig;
use crate::error::ValidationError;
use crate::events::{CompletionEvents, JourneyCompleted};
use crate::scheduler::{HeartbeatDisposition, PersistenceScheduler};

//
// ─── PROXIMITY ─────────────────────────────────────────────────────────────────
//

#[derive(Debug, Clone, Copy, PartialEq)]
enum Proximity {
    /// Accepted; carries the measured distance when a location was checked.
    Accepted(Option<f64>),
    LocationRequired,
    TooFar(f64),
}

fn check_proximity(step: &Step, attempt: &ValidationAttempt) -> Proximity {
    match (attempt.method, attempt.location) {
        (ValidationMethod::Manual, _) => Proximity::Accepted(None),
        (ValidationMethod::Geolocation, None) => Proximity::LocationRequired,
        (ValidationMethod::QrCode, None) => Proximity::Accepted(None),
        (ValidationMethod::Geolocation | ValidationMethod::QrCode, Some(loc)) => {
            let target = step.location();
            let d = distance_meters(loc.coordinate, target);
            if is_within_radius(loc.coordinate, target, step.validation_radius_meters()) {
                Proximity::Accepted(Some(d))
            } else {
                Proximity::TooFar(d)
            }
        }
    }
}

//
// ─── ENGINE ────────────────────────────────────────────────────────────────────
//

/// Validates step attempts and advances journey sessions.
///
/// One engine serves every session in the process. Work for a single session
/// is serialized; different sessions proceed independently.
pub struct ProgressEngine {
    clock: Clock,
    config: EngineConfig,
    steps: Arc<dyn StepCatalog>,
    sessions: Arc<dyn SessionRepository>,
    validation_log: Arc<dyn ValidationLogRepository>,
    guard: DuplicateGuard,
    locks: SessionLocks,
    scheduler: PersistenceScheduler,
    events: CompletionEvents,
}

impl ProgressEngine {
    #[must_use]
    pub fn new(
        clock: Clock,
        config: EngineConfig,
        steps: Arc<dyn StepCatalog>,
        sessions: Arc<dyn SessionRepository>,
        validation_log: Arc<dyn ValidationLogRepository>,
    ) -> Self {
        Self {
            guard: DuplicateGuard::new(config.duplicate_window),
            locks: SessionLocks::default(),
            scheduler: PersistenceScheduler::new(
                Arc::clone(&sessions),
                config.heartbeat_window,
            ),
            events: CompletionEvents::new(config.event_capacity),
            clock,
            config,
            steps,
            sessions,
            validation_log,
        }
    }

    #[must_use]
    pub fn from_storage(clock: Clock, config: EngineConfig, storage: &Storage) -> Self {
        Self::new(
            clock,
            config,
            Arc::clone(&storage.steps),
            Arc::clone(&storage.sessions),
            Arc::clone(&storage.validation_log),
        )
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate one attempt against the user's session for `journey_id`.
    ///
    /// Creates the session on first contact. Rejections are returned as an
    /// unsuccessful `ValidationResult`; only infrastructure faults are errors.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::StepNotFound` if the step is unknown or
    /// belongs to another journey, `ValidationError::Timeout` if the whole
    /// validation exceeds the configured bound, `ValidationError::CorruptSession`
    /// if the stored session disagrees with the catalog, and
    /// `ValidationError::Storage` for backend failures.
    pub async fn validate_step(
        &self,
        user_id: UserId,
        journey_id: JourneyId,
        attempt: ValidationAttempt,
    ) -> Result<ValidationResult, ValidationError> {
        let key = SessionKey::new(user_id, journey_id);
        let limit = self.config.store_timeout;
        match tokio::time::timeout(limit, self.validate_inner(key, &attempt)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(?key, step_id = %attempt.step_id, ?limit, "validation timed out");
                Err(ValidationError::Timeout(limit))
            }
        }
    }

    async fn validate_inner(
        &self,
        key: SessionKey,
        attempt: &ValidationAttempt,
    ) -> Result<ValidationResult, ValidationError> {
        let (step, journey) = self.load_step(key.journey_id, attempt.step_id).await?;

        let now = self.clock.now();
        let session = self
            .sessions
            .get_or_create(key, journey.step_count(), now)
            .await?;
        check_shape(&session, &journey)?;

        if !session.is_active() {
            let result = ValidationResult::new(ValidationReason::SessionInactive, &session);
            self.record(key, attempt, &result).await;
            return Ok(result);
        }

        let Admission::Admitted(_in_flight) =
            self.guard.admit(key, step.id(), now, attempt.force)
        else {
            tracing::debug!(?key, step_id = %step.id(), "duplicate attempt dropped");
            return Ok(ValidationResult::new(
                ValidationReason::DuplicateRequest,
                &session,
            ));
        };

        let _section = self.locks.acquire(key).await;
        let result = self.evaluate_and_commit(key, &step, attempt).await?;
        self.record(key, attempt, &result).await;
        Ok(result)
    }

    async fn load_step(
        &self,
        journey_id: JourneyId,
        step_id: StepId,
    ) -> Result<(Step, Journey), ValidationError> {
        let not_found = || ValidationError::StepNotFound {
            step_id,
            journey_id,
        };

        let step = match self.steps.get_step(step_id).await {
            Ok(step) => step,
            Err(StorageError::NotFound) => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        if step.journey_id() != journey_id {
            return Err(not_found());
        }

        let journey = match self.steps.get_journey(journey_id).await {
            Ok(journey) => journey,
            Err(StorageError::NotFound) => return Err(not_found()),
            Err(e) => return Err(e.into()),
        };
        Ok((step, journey))
    }

    /// Runs under the session's exclusive section.
    async fn evaluate_and_commit(
        &self,
        key: SessionKey,
        step: &Step,
        attempt: &ValidationAttempt,
    ) -> Result<ValidationResult, ValidationError> {
        let mut conflicts = 0;
        loop {
            let current = self
                .sessions
                .get_session(key)
                .await?
                .ok_or_else(|| ValidationError::CorruptSession(format!("{key:?} vanished")))?;

            if !current.is_active() {
                return Ok(ValidationResult::new(
                    ValidationReason::SessionInactive,
                    &current,
                ));
            }
            if current.is_step_completed(step.order()) {
                return Ok(ValidationResult::new(
                    ValidationReason::AlreadyCompleted,
                    &current,
                ));
            }

            let radius = step.validation_radius_meters();
            let distance = match check_proximity(step, attempt) {
                Proximity::Accepted(distance) => distance,
                Proximity::LocationRequired => {
                    return Ok(ValidationResult::new(
                        ValidationReason::LocationRequired,
                        &current,
                    ));
                }
                Proximity::TooFar(d) => {
                    tracing::debug!(
                        ?key,
                        step_id = %step.id(),
                        distance = round_for_display(d),
                        radius,
                        "attempt outside radius"
                    );
                    return Ok(ValidationResult::new(ValidationReason::TooFar, &current)
                        .with_distance(Some(d), radius));
                }
            };

            let completion = StepCompletion {
                key,
                step: step.clone(),
                method: attempt.method,
                completed_at: self.clock.now(),
            };
            let outcome = self
                .sessions
                .commit_step_completion(&completion, current.version())
                .await?;

            match outcome {
                CommitOutcome::Committed(stored) => {
                    self.scheduler.record_commit(key);
                    tracing::info!(
                        ?key,
                        step_id = %step.id(),
                        points = step.points_awarded(),
                        total = stored.total_points_earned(),
                        "step completed"
                    );
                    self.publish_if_finished(&stored);
                    return Ok(ValidationResult::new(ValidationReason::Completed, &stored)
                        .with_points(step.points_awarded())
                        .with_distance(distance, radius));
                }
                CommitOutcome::AlreadyCompleted(stored) => {
                    return Ok(ValidationResult::new(
                        ValidationReason::AlreadyCompleted,
                        &stored,
                    ));
                }
                CommitOutcome::Inactive(stored) => {
                    return Ok(ValidationResult::new(
                        ValidationReason::SessionInactive,
                        &stored,
                    ));
                }
                CommitOutcome::VersionConflict if conflicts == 0 => {
                    conflicts += 1;
                    tracing::debug!(?key, step_id = %step.id(), "version conflict, re-evaluating");
                }
                CommitOutcome::VersionConflict => {
                    tracing::warn!(?key, step_id = %step.id(), "repeated version conflict");
                    return Ok(ValidationResult::new(
                        ValidationReason::StorageConflict,
                        &current,
                    ));
                }
            }
        }
    }

    fn publish_if_finished(&self, stored: &JourneySession) {
        if stored.is_active() {
            return;
        }
        let Some(completed_at) = stored.completed_at() else {
            return;
        };
        let key = stored.key();
        tracing::info!(?key, total = stored.total_points_earned(), "journey completed");
        self.events.publish(JourneyCompleted {
            user_id: key.user_id,
            journey_id: key.journey_id,
            total_points_earned: stored.total_points_earned(),
            completed_at,
        });
    }

    /// Append to the validation log. Failures never change the result.
    async fn record(&self, key: SessionKey, attempt: &ValidationAttempt, result: &ValidationResult) {
        let Some(outcome) = result.reason.log_outcome() else {
            return;
        };
        let entry = ValidationLogRecord {
            id: None,
            key,
            step_id: attempt.step_id,
            method: attempt.method,
            outcome,
            distance_meters: result.distance_meters,
            location: attempt.location,
            attempted_at: attempt.requested_at,
        };
        if let Err(e) = self.validation_log.append(entry).await {
            tracing::warn!(?key, step_id = %attempt.step_id, error = %e, "validation log append failed");
        }
    }

    /// Current progress for a session, if one exists. Never creates one.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::Storage` for backend failures.
    pub async fn get_progress(
        &self,
        user_id: UserId,
        journey_id: JourneyId,
    ) -> Result<Option<JourneyProgress>, ValidationError> {
        let key = SessionKey::new(user_id, journey_id);
        let session = self.sessions.get_session(key).await?;
        Ok(session.as_ref().map(JourneyProgress::from))
    }

    /// Record user activity through the persistence scheduler.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::Storage` if an immediate write fails.
    pub async fn heartbeat(
        &self,
        user_id: UserId,
        journey_id: JourneyId,
    ) -> Result<HeartbeatDisposition, ValidationError> {
        let key = SessionKey::new(user_id, journey_id);
        Ok(self.scheduler.heartbeat(key, self.clock.now()).await?)
    }

    /// End an active session without completing it.
    ///
    /// Terminal sessions are returned unchanged; `None` if no session exists.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::Storage` for backend failures.
    pub async fn abandon_journey(
        &self,
        user_id: UserId,
        journey_id: JourneyId,
    ) -> Result<Option<JourneyProgress>, ValidationError> {
        let key = SessionKey::new(user_id, journey_id);
        let _section = self.locks.acquire(key).await;
        self.scheduler.cancel(key);

        let stored = self.sessions.abandon(key, self.clock.now()).await?;
        if let Some(session) = stored.as_ref().filter(|s| s.abandoned_at().is_some()) {
            tracing::info!(?key, total = session.total_points_earned(), "journey abandoned");
        }
        Ok(stored.as_ref().map(JourneyProgress::from))
    }

    #[must_use]
    pub fn subscribe_completions(&self) -> broadcast::Receiver<JourneyCompleted> {
        self.events.subscribe()
    }

    /// Write any deferred heartbeats now, typically before shutdown.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::Storage` if a pending write fails.
    pub async fn flush(&self) -> Result<usize, ValidationError> {
        Ok(self.scheduler.flush().await?)
    }
}

fn check_shape(session: &JourneySession, journey: &Journey) -> Result<(), ValidationError> {
    if session.step_count() != journey.step_count() {
        return Err(ValidationError::CorruptSession(format!(
            "session has {} steps, journey {} has {}",
            session.step_count(),
            journey.id(),
            journey.step_count()
        )));
    }
    Ok(())
}
