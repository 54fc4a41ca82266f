use thiserror::Error;

use crate::geo::GeoError;
use crate::model::{AttemptError, JourneyError, SessionStateError, StepError};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Geo(#[from] GeoError),
    #[error(transparent)]
    Step(#[from] StepError),
    #[error(transparent)]
    Journey(#[from] JourneyError),
    #[error(transparent)]
    Attempt(#[from] AttemptError),
    #[error(transparent)]
    Session(#[from] SessionStateError),
}
