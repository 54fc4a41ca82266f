//! Per-session heartbeat coalescing.
//!
//! At most one heartbeat write per session lands inside each window. Pings
//! that arrive too early are folded into a single deferred write that fires
//! at the window boundary with the latest timestamp seen. Timer state lives
//! only in this process and is lost on restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use journey_core::model::SessionKey;
use storage::repository::{SessionRepository, StorageError};

/// What happened to a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatDisposition {
    /// Written to the store now.
    Written,
    /// A deferred write was scheduled for the end of the window.
    Deferred,
    /// Folded into an already scheduled write.
    Coalesced,
}

#[derive(Debug)]
struct Pending {
    latest: DateTime<Utc>,
    handle: JoinHandle<()>,
}

#[derive(Debug, Default)]
struct Slot {
    last_write: Option<Instant>,
    pending: Option<Pending>,
}

type Slots = Arc<Mutex<HashMap<SessionKey, Slot>>>;

fn lock(slots: &Slots) -> std::sync::MutexGuard<'_, HashMap<SessionKey, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drop slots with nothing pending whose last write is outside the window.
fn prune(slots: &mut HashMap<SessionKey, Slot>, now: Instant, window: Duration) {
    slots.retain(|_, s| s.pending.is_some() || s.last_write.is_some_and(|t| now - t < window));
}

pub struct PersistenceScheduler {
    sessions: Arc<dyn SessionRepository>,
    window: Duration,
    slots: Slots,
}

impl PersistenceScheduler {
    #[must_use]
    pub fn new(sessions: Arc<dyn SessionRepository>, window: Duration) -> Self {
        Self {
            sessions,
            window,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record activity for `key`, writing now or deferring to the window edge.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `StorageError` only for immediate writes; deferred writes log
    /// their failures.
    pub async fn heartbeat(
        &self,
        key: SessionKey,
        at: DateTime<Utc>,
    ) -> Result<HeartbeatDisposition, StorageError> {
        let now = Instant::now();
        {
            let mut slots = lock(&self.slots);
            let window = self.window;
            prune(&mut slots, now, window);

            let slot = slots.entry(key).or_default();
            if let Some(pending) = slot.pending.as_mut() {
                pending.latest = pending.latest.max(at);
                return Ok(HeartbeatDisposition::Coalesced);
            }

            if let Some(last) = slot.last_write.filter(|t| now - *t < window) {
                let deadline = last + window;
                let handle = tokio::spawn(fire_at(
                    deadline,
                    key,
                    Arc::clone(&self.slots),
                    Arc::clone(&self.sessions),
                ));
                slot.pending = Some(Pending { latest: at, handle });
                tracing::debug!(?key, "heartbeat deferred");
                return Ok(HeartbeatDisposition::Deferred);
            }

            slot.last_write = Some(now);
        }

        self.sessions.touch(key, at).await?;
        Ok(HeartbeatDisposition::Written)
    }

    /// A completion was just written for `key`: drop any deferred heartbeat
    /// and count the commit as the latest write.
    pub fn record_commit(&self, key: SessionKey) {
        let now = Instant::now();
        let mut slots = lock(&self.slots);
        prune(&mut slots, now, self.window);
        let slot = slots.entry(key).or_default();
        if let Some(pending) = slot.pending.take() {
            pending.handle.abort();
            tracing::debug!(?key, "pending heartbeat cancelled by commit");
        }
        slot.last_write = Some(now);
    }

    /// Drop any deferred heartbeat for `key` without writing it.
    pub fn cancel(&self, key: SessionKey) {
        let mut slots = lock(&self.slots);
        if let Some(pending) = slots.get_mut(&key).and_then(|s| s.pending.take()) {
            pending.handle.abort();
        }
        prune(&mut slots, Instant::now(), self.window);
    }

    /// Number of sessions the scheduler is still tracking.
    #[must_use]
    pub fn tracked_sessions(&self) -> usize {
        let mut slots = lock(&self.slots);
        prune(&mut slots, Instant::now(), self.window);
        slots.len()
    }

    /// Number of sessions with a deferred write waiting.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|s| s.pending.is_some())
            .count()
    }

    /// Write every deferred heartbeat now. Returns how many were written.
    ///
    /// # Errors
    ///
    /// Every pending write is attempted; the first failure is returned.
    pub async fn flush(&self) -> Result<usize, StorageError> {
        let due: Vec<(SessionKey, DateTime<Utc>)> = {
            let mut slots = lock(&self.slots);
            let now = Instant::now();
            prune(&mut slots, now, self.window);
            slots
                .iter_mut()
                .filter_map(|(key, slot)| {
                    let pending = slot.pending.take()?;
                    pending.handle.abort();
                    slot.last_write = Some(now);
                    Some((*key, pending.latest))
                })
                .collect()
        };

        let mut first_err = None;
        let mut written = 0;
        for (key, at) in due {
            match self.sessions.touch(key, at).await {
                Ok(()) => written += 1,
                Err(e) => {
                    tracing::warn!(?key, error = %e, "heartbeat flush failed");
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }
}

impl Drop for PersistenceScheduler {
    fn drop(&mut self) {
        for slot in lock(&self.slots).values_mut() {
            if let Some(pending) = slot.pending.take() {
                pending.handle.abort();
            }
        }
    }
}

async fn fire_at(
    deadline: Instant,
    key: SessionKey,
    slots: Slots,
    sessions: Arc<dyn SessionRepository>,
) {
    tokio::time::sleep_until(deadline).await;

    let latest = {
        let mut slots = lock(&slots);
        let Some(slot) = slots.get_mut(&key) else {
            return;
        };
        let Some(pending) = slot.pending.take() else {
            return;
        };
        slot.last_write = Some(Instant::now());
        pending.latest
    };

    if let Err(e) = sessions.touch(key, latest).await {
        tracing::warn!(?key, error = %e, "deferred heartbeat write failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use journey_core::model::{JourneyId, UserId};
    use journey_core::time::fixed_now;
    use storage::repository::InMemoryRepository;

    async fn setup() -> (PersistenceScheduler, Arc<InMemoryRepository>, SessionKey) {
        let repo = Arc::new(InMemoryRepository::new());
        let key = SessionKey::new(UserId::random(), JourneyId::new(1));
        repo.get_or_create(key, 3, fixed_now()).await.unwrap();
        let sessions: Arc<dyn SessionRepository> = repo.clone();
        (
            PersistenceScheduler::new(sessions, Duration::from_secs(2)),
            repo,
            key,
        )
    }

    fn secs(n: i64) -> DateTime<Utc> {
        fixed_now() + chrono::Duration::seconds(n)
    }

    async fn stored_activity(repo: &InMemoryRepository, key: SessionKey) -> DateTime<Utc> {
        repo.get_session(key)
            .await
            .unwrap()
            .unwrap()
            .last_activity_at()
    }

    #[tokio::test(start_paused = true)]
    async fn burst_collapses_into_one_deferred_write_with_latest_time() {
        let (scheduler, repo, key) = setup().await;

        assert_eq!(
            scheduler.heartbeat(key, secs(1)).await.unwrap(),
            HeartbeatDisposition::Written
        );
        assert_eq!(
            scheduler.heartbeat(key, secs(2)).await.unwrap(),
            HeartbeatDisposition::Deferred
        );
        assert_eq!(
            scheduler.heartbeat(key, secs(3)).await.unwrap(),
            HeartbeatDisposition::Coalesced
        );
        assert_eq!(stored_activity(&repo, key).await, secs(1));
        assert_eq!(scheduler.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(2_100)).await;

        assert_eq!(stored_activity(&repo, key).await, secs(3));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_resume_after_window() {
        let (scheduler, repo, key) = setup().await;

        scheduler.heartbeat(key, secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(
            scheduler.heartbeat(key, secs(5)).await.unwrap(),
            HeartbeatDisposition::Written
        );
        assert_eq!(stored_activity(&repo, key).await, secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn commit_cancels_deferred_write() {
        let (scheduler, repo, key) = setup().await;

        scheduler.heartbeat(key, secs(1)).await.unwrap();
        scheduler.heartbeat(key, secs(2)).await.unwrap();
        scheduler.record_commit(key);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(stored_activity(&repo, key).await, secs(1));
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_pending_immediately() {
        let (scheduler, repo, key) = setup().await;

        scheduler.heartbeat(key, secs(1)).await.unwrap();
        scheduler.heartbeat(key, secs(4)).await.unwrap();

        assert_eq!(scheduler.flush().await.unwrap(), 1);
        assert_eq!(stored_activity(&repo, key).await, secs(4));
        assert_eq!(scheduler.flush().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn commit_only_sessions_are_forgotten_after_the_window() {
        let (scheduler, _repo, key) = setup().await;
        for _ in 0..10_000 {
            scheduler.record_commit(SessionKey::new(UserId::random(), JourneyId::new(1)));
        }
        assert_eq!(scheduler.tracked_sessions(), 10_000);

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(scheduler.tracked_sessions(), 0);
        assert_eq!(lock(&scheduler.slots).len(), 0);

        scheduler.record_commit(key);
        tokio::time::sleep(Duration::from_secs(3)).await;
        scheduler.record_commit(SessionKey::new(UserId::random(), JourneyId::new(1)));
        assert_eq!(lock(&scheduler.slots).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn fired_and_cancelled_slots_drain() {
        let (scheduler, _repo, key) = setup().await;

        scheduler.heartbeat(key, secs(1)).await.unwrap();
        scheduler.heartbeat(key, secs(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert_eq!(scheduler.pending_count(), 0);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(scheduler.tracked_sessions(), 0);

        scheduler.heartbeat(key, secs(10)).await.unwrap();
        scheduler.heartbeat(key, secs(11)).await.unwrap();
        scheduler.cancel(key);
        assert_eq!(scheduler.pending_count(), 0);
        tokio::time::sleep(Duration::from_secs(3)).await;
        scheduler.cancel(key);
        assert_eq!(lock(&scheduler.slots).len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_do_not_share_windows() {
        let (scheduler, repo, key) = setup().await;
        let other = SessionKey::new(UserId::random(), JourneyId::new(1));
        repo.get_or_create(other, 3, fixed_now()).await.unwrap();

        scheduler.heartbeat(key, secs(1)).await.unwrap();
        assert_eq!(
            scheduler.heartbeat(other, secs(1)).await.unwrap(),
            HeartbeatDisposition::Written
        );
    }
}
