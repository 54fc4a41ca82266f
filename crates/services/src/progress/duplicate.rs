use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};

use journey_core::model::{SessionKey, StepId};

type Slot = (SessionKey, StepId);

#[derive(Debug, Clone, Copy)]
struct Entry {
    admitted_at: DateTime<Utc>,
    in_flight: bool,
}

/// Outcome of asking the guard to admit an attempt.
pub(crate) enum Admission {
    Admitted(InFlight),
    Duplicate,
}

/// Short-lived memory of recent attempts per (session, step).
///
/// Purely in-process and never touches storage. The conditional commit in
/// the session store stays the real correctness backstop.
#[derive(Debug, Clone)]
pub(crate) struct DuplicateGuard {
    window: Duration,
    entries: Arc<Mutex<HashMap<Slot, Entry>>>,
}

impl DuplicateGuard {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn elapsed(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        // A clock that moved backwards counts as no time passing.
        (now - since).to_std().unwrap_or(Duration::ZERO)
    }

    /// Admit an attempt unless one for the same step is in flight or was
    /// admitted inside the window. `force` skips only the window.
    pub(crate) fn admit(
        &self,
        key: SessionKey,
        step_id: StepId,
        now: DateTime<Utc>,
        force: bool,
    ) -> Admission {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.retain(|_, e| e.in_flight || self.elapsed(e.admitted_at, now) < self.window);

        let slot = (key, step_id);
        if let Some(entry) = entries.get(&slot) {
            if entry.in_flight {
                return Admission::Duplicate;
            }
            if !force && self.elapsed(entry.admitted_at, now) < self.window {
                return Admission::Duplicate;
            }
        }

        entries.insert(
            slot,
            Entry {
                admitted_at: now,
                in_flight: true,
            },
        );
        Admission::Admitted(InFlight {
            entries: Arc::clone(&self.entries),
            slot,
        })
    }
}

/// Marks an attempt as in flight until dropped.
///
/// Dropping on any path (success, error, timeout cancellation) clears the
/// marker; the admission time stays for the window check.
#[derive(Debug)]
pub(crate) struct InFlight {
    entries: Arc<Mutex<HashMap<Slot, Entry>>>,
    slot: Slot,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(&self.slot) {
            entry.in_flight = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use journey_core::model::{JourneyId, UserId};
    use journey_core::time::fixed_now;

    fn key() -> SessionKey {
        SessionKey::new(UserId::random(), JourneyId::new(1))
    }

    fn admitted(a: Admission) -> InFlight {
        match a {
            Admission::Admitted(token) => token,
            Admission::Duplicate => panic!("expected admission"),
        }
    }

    #[test]
    fn in_flight_attempt_blocks_even_when_forced() {
        let guard = DuplicateGuard::new(Duration::from_secs(3));
        let key = key();
        let _token = admitted(guard.admit(key, StepId::new(1), fixed_now(), false));

        let later = fixed_now() + chrono::Duration::seconds(10);
        assert!(matches!(
            guard.admit(key, StepId::new(1), later, true),
            Admission::Duplicate
        ));
    }

    #[test]
    fn window_applies_after_completion_until_it_expires() {
        let guard = DuplicateGuard::new(Duration::from_secs(3));
        let key = key();
        drop(admitted(guard.admit(key, StepId::new(1), fixed_now(), false)));

        let inside = fixed_now() + chrono::Duration::milliseconds(2_999);
        assert!(matches!(
            guard.admit(key, StepId::new(1), inside, false),
            Admission::Duplicate
        ));

        let outside = fixed_now() + chrono::Duration::seconds(3);
        let _token = admitted(guard.admit(key, StepId::new(1), outside, false));
    }

    #[test]
    fn force_skips_the_window() {
        let guard = DuplicateGuard::new(Duration::from_secs(3));
        let key = key();
        drop(admitted(guard.admit(key, StepId::new(1), fixed_now(), false)));

        let _token = admitted(guard.admit(key, StepId::new(1), fixed_now(), true));
    }

    #[test]
    fn steps_and_sessions_are_independent() {
        let guard = DuplicateGuard::new(Duration::from_secs(3));
        let key = key();
        let _a = admitted(guard.admit(key, StepId::new(1), fixed_now(), false));
        let _b = admitted(guard.admit(key, StepId::new(2), fixed_now(), false));
        let _c = admitted(guard.admit(self::key(), StepId::new(1), fixed_now(), false));
    }
}
