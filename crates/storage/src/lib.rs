#![forbid(unsafe_code)]

pub mod repository;
pub mod sqlite;

pub use repository::{
    CommitOutcome, InMemoryRepository, LogOutcome, SessionRepository, StepCatalog,
    StepCompletion, Storage, StorageError, ValidationLogRecord, ValidationLogRepository,
};
