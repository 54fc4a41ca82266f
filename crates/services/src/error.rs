//! Shared error types for the services crate.

use std::time::Duration;

use thiserror::Error;

use journey_core::model::{JourneyId, StepId};
use storage::repository::StorageError;
use storage::sqlite::SqliteInitError;

/// Infrastructure faults from the progress engine.
///
/// Rejected attempts (too far, duplicate, inactive session) are not errors;
/// they come back as a `ValidationResult` with a typed reason.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ValidationError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("validation timed out after {0:?}")]
    Timeout(Duration),
    #[error("step {step_id} not found in journey {journey_id}")]
    StepNotFound {
        step_id: StepId,
        journey_id: JourneyId,
    },
    #[error("stored session is inconsistent: {0}")]
    CorruptSession(String),
}

/// Errors emitted while bootstrapping app services.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AppServicesError {
    #[error(transparent)]
    Sqlite(#[from] SqliteInitError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
