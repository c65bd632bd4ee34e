use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::idempotency::capture::IdempotencyOutcome;
use crate::idempotency::key_generator::StorageKey;

/// Handle on an execution already underway on this instance.
pub type InFlightFuture = Shared<BoxFuture<'static, IdempotencyOutcome>>;

/// Result of [`InFlightRegistry::register`].
pub enum Registration {
    /// The caller's future was installed; the caller drives it.
    Installed(InFlightFuture),
    /// Another execution was already in flight; await it instead.
    Joined(InFlightFuture),
}

/// Process-local map of in-flight executions keyed by storage key.
#[derive(Default)]
pub struct InFlightRegistry {
    pending: Mutex<HashMap<StorageKey, InFlightFuture>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `work` for `key` unless something is already pending. `work`
    /// must be lazy: when it loses, it is dropped without being polled.
    pub fn register(&self, key: &StorageKey, work: InFlightFuture) -> Registration {
        let mut pending = self.pending();
        if let Some(existing) = pending.get(key) {
            return Registration::Joined(existing.clone());
        }

        pending.insert(key.clone(), work.clone());
        Registration::Installed(work)
    }

    /// Removes the entry for `key` once its execution has settled.
    pub fn complete(&self, key: &StorageKey) -> bool {
        self.pending().remove(key).is_some()
    }

    pub fn contains(&self, key: &StorageKey) -> bool {
        self.pending().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<StorageKey, InFlightFuture>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
