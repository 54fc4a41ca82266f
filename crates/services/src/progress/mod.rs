mod duplicate;
mod engine;
mod locks;
mod result;

// Public API of the progress subsystem.
pub use crate::error::ValidationError;
pub use engine::ProgressEngine;
pub use result::{JourneyProgress, ValidationReason, ValidationResult};
