//! Keyed one-shot timers with replace semantics.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::time::Instant;

struct Pending {
    generation: u64,
    // Dropping the sender wakes the sleeping task, which then exits without firing.
    _cancel: oneshot::Sender<()>,
}

/// A set of pending one-shot timers, at most one per key.
///
/// A task has a synchronous part, the closure, and an asynchronous rest, the future the closure
/// returns. A timer fires by taking the fire lock, removing its own entry and running the closure,
/// all before the lock is released. Anything done under [`Timers::exclusive`] therefore happens
/// either entirely before or entirely after that synchronous part. A cancel or replace that
/// comes first suppresses the fire completely.
pub struct Timers<K> {
    pending: Arc<Mutex<HashMap<K, Pending>>>,
    fire: Arc<Mutex<()>>,
    generation: Arc<AtomicU64>,
}

impl<K> Clone for Timers<K> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
            fire: Arc::clone(&self.fire),
            generation: Arc::clone(&self.generation),
        }
    }
}

impl<K> Default for Timers<K> {
    fn default() -> Self {
        Self {
            pending: Arc::default(),
            fire: Arc::default(),
            generation: Arc::default(),
        }
    }
}

impl<K> Timers<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Run `task` at `at`, replacing any timer that is pending for the same key. Returns whether
    /// a previous timer was replaced.
    pub fn schedule<F, Fut>(&self, key: K, at: Instant, task: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancelled) = oneshot::channel();

        let replaced = self
            .pending
            .lock()
            .insert(
                key.clone(),
                Pending {
                    generation,
                    _cancel: cancel,
                },
            )
            .is_some();

        let pending = Arc::clone(&self.pending);
        let fire = Arc::clone(&self.fire);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(at) => {}
                _ = cancelled => return,
            }

            let rest = {
                let _fire = fire.lock();
                {
                    let mut pending = pending.lock();
                    match pending.get(&key) {
                        Some(p) if p.generation == generation => {
                            pending.remove(&key);
                        }
                        _ => return,
                    }
                }
                task()
            };

            rest.await;
        });

        replaced
    }

    /// Keep every timer of this set from firing while the guard lives. Timers may still be
    /// scheduled and cancelled under it, but the guard must not be held across an `.await`.
    pub fn exclusive(&self) -> MutexGuard<'_, ()> {
        self.fire.lock()
    }

    /// Drop the pending timer for `key`. Returns whether there was one.
    pub fn cancel(&self, key: &K) -> bool {
        self.pending.lock().remove(key).is_some()
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
