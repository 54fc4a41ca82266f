use std::time::Duration;

/// Tunables for the progress engine and its persistence scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// Repeat attempts for the same step inside this window are dropped.
    pub duplicate_window: Duration,
    /// Minimum spacing between heartbeat writes for one session.
    pub heartbeat_window: Duration,
    /// Upper bound on a whole validation, storage included.
    pub store_timeout: Duration,
    /// Buffered `JourneyCompleted` events per subscriber.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            duplicate_window: Duration::from_secs(3),
            heartbeat_window: Duration::from_secs(2),
            store_timeout: Duration::from_secs(10),
            event_capacity: 64,
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn with_duplicate_window(mut self, window: Duration) -> Self {
        self.duplicate_window = window;
        self
    }

    #[must_use]
    pub fn with_heartbeat_window(mut self, window: Duration) -> Self {
        self.heartbeat_window = window;
        self
    }

    #[must_use]
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Zero is bumped to one; a broadcast channel needs room for one event.
    #[must_use]
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_windows() {
        let config = EngineConfig::default();
        assert_eq!(config.duplicate_window, Duration::from_secs(3));
        assert_eq!(config.heartbeat_window, Duration::from_secs(2));
        assert_eq!(config.store_timeout, Duration::from_secs(10));
        assert_eq!(config.event_capacity, 64);
    }

    #[test]
    fn setters_override_single_fields() {
        let config = EngineConfig::default()
            .with_duplicate_window(Duration::from_millis(500))
            .with_event_capacity(0);
        assert_eq!(config.duplicate_window, Duration::from_millis(500));
        assert_eq!(config.event_capacity, 1);
        assert_eq!(config.heartbeat_window, Duration::from_secs(2));
    }
}
