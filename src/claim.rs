//! Hands out codes to participants who know the pass of a running event.

use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;

use crate::scheduler::ClaimWindows;
use crate::settings::Claims;
use crate::store::{EventRecord, EventStore};

/// Why a claim did not produce a code.
#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("Unknown codeword")]
    NoSuchEvent,
    #[error("This event is restricted to a list of participants and you are not on it")]
    NotWhitelisted,
    #[error("You already claimed a code for that event!")]
    AlreadyClaimed,
    #[error("No claim codes left!")]
    NoCodesLeft,
    /// Too many concurrent claims kept the event locked for the whole retry budget.
    #[error("Too many people are claiming right now, please try again in a moment")]
    Contended,
    #[error("failed accessing the code pool")]
    Store(#[source] anyhow::Error),
}

impl ClaimError {
    /// Whether the error is an answer for the participant rather than an internal failure.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, Self::Store(_))
    }
}

/// A successful claim.
#[derive(Debug)]
pub struct ClaimedCode {
    pub event: EventRecord,
    pub code: String,
}

impl ClaimedCode {
    /// The private response for the participant.
    pub fn response(&self) -> String {
        self.event.response_for(&self.code)
    }
}

pub struct ClaimArbitrator {
    store: Arc<dyn EventStore>,
    windows: ClaimWindows,
    policy: Claims,
}

impl ClaimArbitrator {
    pub fn new(store: Arc<dyn EventStore>, windows: ClaimWindows, policy: Claims) -> Self {
        Self {
            store,
            windows,
            policy,
        }
    }

    /// Resolve the event for the given pass and hand one of its codes to `claimant`.
    pub async fn claim(&self, pass: &str, claimant: &str) -> Result<ClaimedCode, ClaimError> {
        let event = self
            .store
            .find_event_by_pass(pass, true)
            .await
            .map_err(ClaimError::Store)?
            .filter(|e| self.windows.is_open(e.id))
            .ok_or(ClaimError::NoSuchEvent)?;

        let mut backoff = self.policy.initial_backoff;
        let mut attempt = 1;

        loop {
            match self
                .store
                .claim_random_unclaimed_code(event.id, claimant)
                .await
            {
                Ok(code) => {
                    info!("Claimant {} received a code for event {}", claimant, event.id);
                    debug!("Claimed code {} for event {}", code, event.id);
                    return Ok(ClaimedCode { event, code });
                }
                Err(ClaimError::Contended) if attempt < self.policy.max_attempts => {
                    debug!(
                        "Event {} is busy, retrying claim in {:?} (attempt {})",
                        event.id, backoff, attempt
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(e) => {
                    if let ClaimError::Contended = e {
                        warn!("Giving up claim for event {} after {} attempts", event.id, attempt);
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    use super::*;
    use crate::store::{fixtures, MemoryEventStore};

    fn policy() -> Claims {
        Claims {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            lock_timeout: Duration::from_secs(1),
        }
    }

    async fn open_event(codes: usize) -> (Arc<MemoryEventStore>, ClaimWindows, EventRecord) {
        let store = Arc::new(MemoryEventStore::new());
        let event = fixtures::event("guild", "Secret Word");
        store.insert_event(&event).await.unwrap();
        for i in 0..codes {
            store.insert_code(event.id, &format!("code-{}", i)).await.unwrap();
        }

        let windows = ClaimWindows::default();
        windows.open(event.id);
        (store, windows, event)
    }

    #[tokio::test]
    async fn pass_is_matched_loosely_and_template_filled() {
        let (store, windows, _) = open_event(1).await;
        let arbitrator = ClaimArbitrator::new(store, windows, policy());

        let claimed = arbitrator.claim("!secret word", "alice").await.unwrap();

        assert_eq!("code-0", claimed.code);
        assert_eq!("Here you go: code-0", claimed.response());
    }

    #[tokio::test]
    async fn closed_window_means_no_such_event() {
        let (store, windows, event) = open_event(1).await;
        windows.close(event.id);
        let arbitrator = ClaimArbitrator::new(store, windows, policy());

        let res = arbitrator.claim("secretword", "alice").await;

        assert!(matches!(res, Err(ClaimError::NoSuchEvent)));
    }

    #[tokio::test]
    async fn unknown_pass_means_no_such_event() {
        let (store, windows, _) = open_event(1).await;
        let arbitrator = ClaimArbitrator::new(store, windows, policy());

        let res = arbitrator.claim("other", "alice").await;

        assert!(matches!(res, Err(ClaimError::NoSuchEvent)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claimants_each_get_a_distinct_code() {
        let (store, windows, event) = open_event(5).await;
        let arbitrator = Arc::new(ClaimArbitrator::new(store.clone(), windows, policy()));

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let arbitrator = Arc::clone(&arbitrator);
                tokio::spawn(async move {
                    arbitrator.claim("secretword", &format!("user-{}", i)).await
                })
            })
            .collect();

        let mut codes = HashSet::new();
        let mut empty = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(claimed) => assert!(codes.insert(claimed.code)),
                Err(ClaimError::NoCodesLeft) => empty += 1,
                Err(e) => panic!("unexpected claim error: {}", e),
            }
        }

        assert_eq!(5, codes.len());
        assert_eq!(15, empty);
        assert_eq!(5, store.count_codes(event.id, true).await.unwrap());
    }

    /// Reports lock contention a fixed number of times before delegating.
    struct Busy {
        inner: MemoryEventStore,
        remaining: AtomicU32,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl EventStore for Busy {
        async fn insert_event(&self, event: &EventRecord) -> Result<()> {
            self.inner.insert_event(event).await
        }
        async fn update_event(&self, event: &EventRecord) -> Result<()> {
            self.inner.update_event(event).await
        }
        async fn find_event_by_pass(&self, pass: &str, active: bool) -> Result<Option<EventRecord>> {
            self.inner.find_event_by_pass(pass, active).await
        }
        async fn find_events_by_guild(&self, guild: &str, active: bool) -> Result<Vec<EventRecord>> {
            self.inner.find_events_by_guild(guild, active).await
        }
        async fn find_active_events_ending_after(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<EventRecord>> {
            self.inner.find_active_events_ending_after(now).await
        }
        async fn insert_code(&self, event_id: Uuid, code: &str) -> Result<bool> {
            self.inner.insert_code(event_id, code).await
        }
        async fn count_codes(&self, event_id: Uuid, claimed_only: bool) -> Result<i64> {
            self.inner.count_codes(event_id, claimed_only).await
        }
        async fn claim_random_unclaimed_code(
            &self,
            event_id: Uuid,
            claimant: &str,
        ) -> Result<String, ClaimError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let busy = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if busy {
                return Err(ClaimError::Contended);
            }
            self.inner.claim_random_unclaimed_code(event_id, claimant).await
        }
        async fn is_user_banned(&self, user: &str) -> Result<bool> {
            self.inner.is_user_banned(user).await
        }
        async fn add_to_whitelist(&self, event_id: Uuid, user: &str) -> Result<()> {
            self.inner.add_to_whitelist(event_id, user).await
        }
    }

    async fn busy_store(contended: u32) -> (Arc<Busy>, ClaimWindows) {
        let store = Arc::new(Busy {
            inner: MemoryEventStore::new(),
            remaining: AtomicU32::new(contended),
            attempts: AtomicU32::new(0),
        });
        let event = fixtures::event("guild", "secret");
        store.insert_event(&event).await.unwrap();
        store.insert_code(event.id, "a").await.unwrap();

        let windows = ClaimWindows::default();
        windows.open(event.id);
        (store, windows)
    }

    #[tokio::test(start_paused = true)]
    async fn contention_is_retried_with_backoff() {
        let (store, windows) = busy_store(2).await;
        let arbitrator = ClaimArbitrator::new(store.clone(), windows, policy());

        let claimed = arbitrator.claim("secret", "alice").await.unwrap();

        assert_eq!("a", claimed.code);
        assert_eq!(3, store.attempts.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let (store, windows) = busy_store(10).await;
        let arbitrator = ClaimArbitrator::new(store.clone(), windows, policy());

        let res = arbitrator.claim("secret", "alice").await;

        assert!(matches!(res, Err(ClaimError::Contended)));
        assert_eq!(3, store.attempts.load(Ordering::SeqCst));
    }
}
