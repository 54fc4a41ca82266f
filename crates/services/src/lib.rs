#![forbid(unsafe_code)]

pub mod app_services;
pub mod config;
pub mod error;
pub mod events;
pub mod progress;
pub mod scheduler;

pub use journey_core::Clock;

pub use app_services::JourneyServices;
pub use config::EngineConfig;
pub use error::{AppServicesError, ValidationError};
pub use events::{CompletionEvents, JourneyCompleted};
pub use progress::{JourneyProgress, ProgressEngine, ValidationReason, ValidationResult};
pub use scheduler::{HeartbeatDisposition, PersistenceScheduler};
