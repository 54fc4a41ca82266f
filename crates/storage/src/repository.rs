use async_trait::async_trait;
use chrono::{DateTime, Utc};
use journey_core::model::{
    Journey, JourneyId, JourneySession, ReportedLocation, SessionKey, SessionStateError, Step,
    StepId, ValidationMethod,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Errors surfaced by storage adapters.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    #[error("not found")]
    NotFound,

    #[error("conflict")]
    Conflict,

    #[error("connection error: {0}")]
    Connection(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

//
// ─── COMMITS ───────────────────────────────────────────────────────────────────
//

/// A step completion to be applied to the stored session.
///
/// Carries the catalog `Step` so points and order come from the catalog,
/// never from the client.
#[derive(Debug, Clone)]
pub struct StepCompletion {
    pub key: SessionKey,
    pub step: Step,
    pub method: ValidationMethod,
    pub completed_at: DateTime<Utc>,
}

/// Result of a conditional completion commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The completion was written; carries the new stored session.
    Committed(JourneySession),
    /// The stored session already had this step; nothing was written.
    AlreadyCompleted(JourneySession),
    /// The stored session is terminal; nothing was written.
    Inactive(JourneySession),
    /// The stored session moved past the expected version.
    VersionConflict,
}

pub(crate) enum CommitPlan {
    Done(CommitOutcome),
    Apply(JourneySession),
}

/// Decide a commit against the currently stored session, shared by every backend.
pub(crate) fn plan_commit(
    stored: &JourneySession,
    completion: &StepCompletion,
    expected_version: u64,
) -> Result<CommitPlan, StorageError> {
    if !stored.is_active() {
        return Ok(CommitPlan::Done(CommitOutcome::Inactive(stored.clone())));
    }
    if stored.is_step_completed(completion.step.order()) {
        return Ok(CommitPlan::Done(CommitOutcome::AlreadyCompleted(
            stored.clone(),
        )));
    }
    if stored.version() != expected_version {
        return Ok(CommitPlan::Done(CommitOutcome::VersionConflict));
    }

    let mut next = stored.clone();
    match next.apply_completion(&completion.step, completion.method, completion.completed_at) {
        Ok(_) => Ok(CommitPlan::Apply(next)),
        Err(SessionStateError::AlreadyCompleted { .. }) => Ok(CommitPlan::Done(
            CommitOutcome::AlreadyCompleted(stored.clone()),
        )),
        Err(SessionStateError::Inactive) => {
            Ok(CommitPlan::Done(CommitOutcome::Inactive(stored.clone())))
        }
        Err(_) => Err(StorageError::Conflict),
    }
}

//
// ─── VALIDATION LOG ────────────────────────────────────────────────────────────
//

/// Stored outcome of a validation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    Completed,
    AlreadyCompleted,
    SessionInactive,
    LocationRequired,
    TooFar,
    StorageConflict,
}

impl LogOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LogOutcome::Completed => "completed",
            LogOutcome::AlreadyCompleted => "already_completed",
            LogOutcome::SessionInactive => "session_inactive",
            LogOutcome::LocationRequired => "location_required",
            LogOutcome::TooFar => "too_far",
            LogOutcome::StorageConflict => "storage_conflict",
        }
    }

    /// # Errors
    ///
    /// Returns `StorageError::Serialization` for unknown names.
    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "completed" => Ok(Self::Completed),
            "already_completed" => Ok(Self::AlreadyCompleted),
            "session_inactive" => Ok(Self::SessionInactive),
            "location_required" => Ok(Self::LocationRequired),
            "too_far" => Ok(Self::TooFar),
            "storage_conflict" => Ok(Self::StorageConflict),
            other => Err(StorageError::Serialization(format!(
                "invalid log outcome: {other}"
            ))),
        }
    }

    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, LogOutcome::Completed | LogOutcome::AlreadyCompleted)
    }
}

/// Audit row for one validation attempt, successful or not.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationLogRecord {
    pub id: Option<i64>,
    pub key: SessionKey,
    pub step_id: StepId,
    pub method: ValidationMethod,
    pub outcome: LogOutcome,
    pub distance_meters: Option<f64>,
    pub location: Option<ReportedLocation>,
    pub attempted_at: DateTime<Utc>,
}

impl ValidationLogRecord {
    #[must_use]
    pub fn success(&self) -> bool {
        self.outcome.is_success()
    }
}

//
// ─── CONTRACTS ─────────────────────────────────────────────────────────────────
//

/// Read access to the externally owned step catalog.
#[async_trait]
pub trait StepCatalog: Send + Sync {
    /// Fetch a single step by ID.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn get_step(&self, id: StepId) -> Result<Step, StorageError>;

    /// Fetch a journey with all of its steps.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if missing, or other storage errors.
    async fn get_journey(&self, id: JourneyId) -> Result<Journey, StorageError>;

    /// Persist or replace a journey and its steps. Used by seeding and admin tooling.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the journey cannot be stored.
    async fn upsert_journey(&self, journey: &Journey) -> Result<(), StorageError>;
}

/// Durable per-(user, journey) progress records.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Return the stored session, inserting a fresh one if absent.
    ///
    /// Concurrent callers converge on a single stored session; a caller that
    /// loses the insert race receives the winner's record.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn get_or_create(
        &self,
        key: SessionKey,
        step_count: u32,
        now: DateTime<Utc>,
    ) -> Result<JourneySession, StorageError>;

    /// Fetch a session without creating it.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn get_session(&self, key: SessionKey) -> Result<Option<JourneySession>, StorageError>;

    /// Atomically apply a completion if the stored session is still at
    /// `expected_version` and the step is not yet completed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the session does not exist,
    /// `StorageError::Conflict` if the step does not fit the session, or
    /// other storage errors.
    async fn commit_step_completion(
        &self,
        completion: &StepCompletion,
        expected_version: u64,
    ) -> Result<CommitOutcome, StorageError>;

    /// Record activity on a session. Best-effort; never moves time backwards.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure. Missing sessions are ignored.
    async fn touch(&self, key: SessionKey, at: DateTime<Utc>) -> Result<(), StorageError>;

    /// Explicitly end an active session. Returns the stored session, if any.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn abandon(
        &self,
        key: SessionKey,
        at: DateTime<Utc>,
    ) -> Result<Option<JourneySession>, StorageError>;
}

/// Append-only audit sink for validation attempts.
#[async_trait]
pub trait ValidationLogRepository: Send + Sync {
    /// Append an entry and return its ID.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` if the entry cannot be stored.
    async fn append(&self, entry: ValidationLogRecord) -> Result<i64, StorageError>;

    /// Entries for one session, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` on backend failure.
    async fn entries_for_session(
        &self,
        key: SessionKey,
    ) -> Result<Vec<ValidationLogRecord>, StorageError>;
}

//
// ─── IN-MEMORY BACKEND ─────────────────────────────────────────────────────────
//

#[derive(Default)]
struct Catalog {
    journeys: HashMap<JourneyId, Journey>,
    step_index: HashMap<StepId, JourneyId>,
}

/// Simple in-memory repository implementation for testing and prototyping.
#[derive(Clone, Default)]
pub struct InMemoryRepository {
    catalog: Arc<Mutex<Catalog>>,
    sessions: Arc<Mutex<HashMap<SessionKey, JourneySession>>>,
    logs: Arc<Mutex<Vec<ValidationLogRecord>>>,
}

impl InMemoryRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StorageError {
    StorageError::Connection(e.to_string())
}

#[async_trait]
impl StepCatalog for InMemoryRepository {
    async fn get_step(&self, id: StepId) -> Result<Step, StorageError> {
        let guard = self.catalog.lock().map_err(poisoned)?;
        let journey_id = guard.step_index.get(&id).ok_or(StorageError::NotFound)?;
        guard
            .journeys
            .get(journey_id)
            .and_then(|j| j.step(id))
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn get_journey(&self, id: JourneyId) -> Result<Journey, StorageError> {
        let guard = self.catalog.lock().map_err(poisoned)?;
        guard.journeys.get(&id).cloned().ok_or(StorageError::NotFound)
    }

    async fn upsert_journey(&self, journey: &Journey) -> Result<(), StorageError> {
        let mut guard = self.catalog.lock().map_err(poisoned)?;
        let foreign = journey.steps().iter().any(|step| {
            guard
                .step_index
                .get(&step.id())
                .is_some_and(|owner| *owner != journey.id())
        });
        if foreign {
            return Err(StorageError::Conflict);
        }
        if let Some(previous) = guard.journeys.remove(&journey.id()) {
            for step in previous.steps() {
                guard.step_index.remove(&step.id());
            }
        }
        for step in journey.steps() {
            guard.step_index.insert(step.id(), journey.id());
        }
        guard.journeys.insert(journey.id(), journey.clone());
        Ok(())
    }
}

#[async_trait]
impl SessionRepository for InMemoryRepository {
    async fn get_or_create(
        &self,
        key: SessionKey,
        step_count: u32,
        now: DateTime<Utc>,
    ) -> Result<JourneySession, StorageError> {
        let mut guard = self.sessions.lock().map_err(poisoned)?;
        if let Some(existing) = guard.get(&key) {
            return Ok(existing.clone());
        }
        let fresh = JourneySession::new(key, step_count, now)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;
        guard.insert(key, fresh.clone());
        Ok(fresh)
    }

    async fn get_session(&self, key: SessionKey) -> Result<Option<JourneySession>, StorageError> {
        let guard = self.sessions.lock().map_err(poisoned)?;
        Ok(guard.get(&key).cloned())
    }

    async fn commit_step_completion(
        &self,
        completion: &StepCompletion,
        expected_version: u64,
    ) -> Result<CommitOutcome, StorageError> {
        let mut guard = self.sessions.lock().map_err(poisoned)?;
        let stored = guard.get(&completion.key).ok_or(StorageError::NotFound)?;
        match plan_commit(stored, completion, expected_version)? {
            CommitPlan::Done(outcome) => Ok(outcome),
            CommitPlan::Apply(next) => {
                guard.insert(completion.key, next.clone());
                Ok(CommitOutcome::Committed(next))
            }
        }
    }

    async fn touch(&self, key: SessionKey, at: DateTime<Utc>) -> Result<(), StorageError> {
        let mut guard = self.sessions.lock().map_err(poisoned)?;
        if let Some(session) = guard.get_mut(&key) {
            session.touch(at);
        }
        Ok(())
    }

    async fn abandon(
        &self,
        key: SessionKey,
        at: DateTime<Utc>,
    ) -> Result<Option<JourneySession>, StorageError> {
        let mut guard = self.sessions.lock().map_err(poisoned)?;
        Ok(guard.get_mut(&key).map(|session| {
            session.abandon(at);
            session.clone()
        }))
    }
}

#[async_trait]
impl ValidationLogRepository for InMemoryRepository {
    async fn append(&self, mut entry: ValidationLogRecord) -> Result<i64, StorageError> {
        let mut guard = self.logs.lock().map_err(poisoned)?;
        let id = i64::try_from(guard.len() + 1)
            .map_err(|_| StorageError::Serialization("log id overflow".into()))?;
        entry.id = Some(id);
        guard.push(entry);
        Ok(id)
    }

    async fn entries_for_session(
        &self,
        key: SessionKey,
    ) -> Result<Vec<ValidationLogRecord>, StorageError> {
        let guard = self.logs.lock().map_err(poisoned)?;
        Ok(guard.iter().filter(|e| e.key == key).cloned().collect())
    }
}

/// Aggregates the catalog, session store and validation log behind trait
/// objects for easy backend swapping.
#[derive(Clone)]
pub struct Storage {
    pub steps: Arc<dyn StepCatalog>,
    pub sessions: Arc<dyn SessionRepository>,
    pub validation_log: Arc<dyn ValidationLogRepository>,
}

impl Storage {
    #[must_use]
    pub fn in_memory() -> Self {
        let repo = InMemoryRepository::new();
        let steps: Arc<dyn StepCatalog> = Arc::new(repo.clone());
        let sessions: Arc<dyn SessionRepository> = Arc::new(repo.clone());
        let validation_log: Arc<dyn ValidationLogRepository> = Arc::new(repo);
        Self {
            steps,
            sessions,
            validation_log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use journey_core::geo::Coordinate;
    use journey_core::model::UserId;
    use journey_core::time::fixed_now;

    fn journey() -> Journey {
        let here = Coordinate::new(48.85, 2.35).unwrap();
        let steps = (0..3)
            .map(|i| {
                Step::new(
                    StepId::new(100 + u64::from(i)),
                    JourneyId::new(1),
                    i,
                    here,
                    50.0,
                    10 + 5 * i,
                )
                .unwrap()
            })
            .collect();
        Journey::new(JourneyId::new(1), "Old Town", steps).unwrap()
    }

    fn key() -> SessionKey {
        SessionKey::new(UserId::random(), JourneyId::new(1))
    }

    fn completion(key: SessionKey, step: &Step) -> StepCompletion {
        StepCompletion {
            key,
            step: step.clone(),
            method: ValidationMethod::Manual,
            completed_at: fixed_now(),
        }
    }

    #[tokio::test]
    async fn catalog_resolves_steps_through_journeys() {
        let repo = InMemoryRepository::new();
        repo.upsert_journey(&journey()).await.unwrap();

        let step = repo.get_step(StepId::new(101)).await.unwrap();
        assert_eq!(step.order(), 1);
        assert!(matches!(
            repo.get_step(StepId::new(7)).await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn catalog_refuses_step_ids_owned_by_another_journey() {
        let repo = InMemoryRepository::new();
        repo.upsert_journey(&journey()).await.unwrap();

        let here = Coordinate::new(1.0, 1.0).unwrap();
        let stolen = Step::new(StepId::new(100), JourneyId::new(2), 0, here, 5.0, 1).unwrap();
        let other = Journey::new(JourneyId::new(2), "Other", vec![stolen]).unwrap();
        assert!(matches!(
            repo.upsert_journey(&other).await,
            Err(StorageError::Conflict)
        ));
    }

    #[tokio::test]
    async fn get_or_create_returns_existing_record() {
        let repo = InMemoryRepository::new();
        let key = key();

        let first = repo.get_or_create(key, 3, fixed_now()).await.unwrap();
        let later = fixed_now() + chrono::Duration::hours(1);
        let second = repo.get_or_create(key, 3, later).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(second.created_at(), fixed_now());
    }

    #[tokio::test]
    async fn commit_is_conditional_on_version_and_step() {
        let repo = InMemoryRepository::new();
        let journey = journey();
        let key = key();
        repo.get_or_create(key, 3, fixed_now()).await.unwrap();

        let first = repo
            .commit_step_completion(&completion(key, &journey.steps()[0]), 0)
            .await
            .unwrap();
        let CommitOutcome::Committed(session) = first else {
            panic!("expected commit, got {first:?}");
        };
        assert_eq!(session.total_points_earned(), 10);

        let again = repo
            .commit_step_completion(&completion(key, &journey.steps()[0]), 1)
            .await
            .unwrap();
        assert!(matches!(again, CommitOutcome::AlreadyCompleted(_)));

        let stale = repo
            .commit_step_completion(&completion(key, &journey.steps()[1]), 0)
            .await
            .unwrap();
        assert_eq!(stale, CommitOutcome::VersionConflict);

        let stored = repo.get_session(key).await.unwrap().unwrap();
        assert_eq!(stored.total_points_earned(), 10);
        assert_eq!(stored.version(), 1);
    }

    #[tokio::test]
    async fn commit_on_abandoned_session_reports_inactive() {
        let repo = InMemoryRepository::new();
        let journey = journey();
        let key = key();
        repo.get_or_create(key, 3, fixed_now()).await.unwrap();
        let abandoned = repo.abandon(key, fixed_now()).await.unwrap().unwrap();
        assert!(!abandoned.is_active());

        let outcome = repo
            .commit_step_completion(&completion(key, &journey.steps()[0]), abandoned.version())
            .await
            .unwrap();
        assert!(matches!(outcome, CommitOutcome::Inactive(_)));
    }

    #[tokio::test]
    async fn log_appends_in_order_per_session() {
        let repo = InMemoryRepository::new();
        let key = key();
        for outcome in [LogOutcome::TooFar, LogOutcome::Completed] {
            repo.append(ValidationLogRecord {
                id: None,
                key,
                step_id: StepId::new(100),
                method: ValidationMethod::Geolocation,
                outcome,
                distance_meters: Some(12.0),
                location: None,
                attempted_at: fixed_now(),
            })
            .await
            .unwrap();
        }

        let entries = repo.entries_for_session(key).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(!entries[0].success());
        assert!(entries[1].success());
        assert_eq!(entries[1].id, Some(2));
    }
}
