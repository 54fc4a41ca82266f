mod attempt;
mod ids;
mod session;
mod step;

pub use ids::{JourneyId, ParseIdError, SessionKey, StepId, UserId};

pub use attempt::{
    AttemptError, ReportedLocation, ValidationAttempt, ValidationMethod, ValidationRecord,
};
pub use session::{CompletionEffect, JourneySession, SessionSnapshot, SessionStateError};
pub use step::{Journey, JourneyError, Step, StepError};
