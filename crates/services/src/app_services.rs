use std::sync::Arc;

use storage::repository::Storage;

use crate::Clock;
use crate::config::EngineConfig;
use crate::error::AppServicesError;
use crate::progress::ProgressEngine;

/// Assembles the storage backend and the progress engine on top of it.
#[derive(Clone)]
pub struct JourneyServices {
    storage: Storage,
    engine: Arc<ProgressEngine>,
}

impl JourneyServices {
    /// Build services backed by `SQLite` storage. Runs migrations.
    ///
    /// # Errors
    ///
    /// Returns `AppServicesError` if the database cannot be opened or migrated.
    pub async fn new_sqlite(
        db_url: &str,
        clock: Clock,
        config: EngineConfig,
    ) -> Result<Self, AppServicesError> {
        let storage = Storage::sqlite(db_url).await?;
        Ok(Self::from_storage(storage, clock, config))
    }

    /// Build services over in-memory storage.
    #[must_use]
    pub fn in_memory(clock: Clock, config: EngineConfig) -> Self {
        Self::from_storage(Storage::in_memory(), clock, config)
    }

    #[must_use]
    pub fn from_storage(storage: Storage, clock: Clock, config: EngineConfig) -> Self {
        let engine = Arc::new(ProgressEngine::from_storage(clock, config, &storage));
        Self { storage, engine }
    }

    #[must_use]
    pub fn engine(&self) -> Arc<ProgressEngine> {
        Arc::clone(&self.engine)
    }

    #[must_use]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}
