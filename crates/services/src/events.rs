use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use journey_core::model::{JourneyId, UserId};

/// Published once when a session completes its last step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JourneyCompleted {
    pub user_id: UserId,
    pub journey_id: JourneyId,
    pub total_points_earned: u64,
    pub completed_at: DateTime<Utc>,
}

/// Fan-out of completion events to any number of subscribers.
///
/// Slow subscribers lag and lose the oldest events; publishing never blocks.
#[derive(Debug, Clone)]
pub struct CompletionEvents {
    tx: broadcast::Sender<JourneyCompleted>,
}

impl CompletionEvents {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JourneyCompleted> {
        self.tx.subscribe()
    }

    /// Returns how many subscribers received the event.
    pub fn publish(&self, event: JourneyCompleted) -> usize {
        match self.tx.send(event) {
            Ok(n) => n,
            Err(_) => {
                tracing::debug!("journey completed with no subscribers");
                0
            }
        }
    }
}
