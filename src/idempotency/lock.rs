use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::Result;
use crate::idempotency::shared_cache::SharedCacheConnection;

const MIN_LOCK_TTL: Duration = Duration::from_secs(5);
const MAX_LOCK_TTL: Duration = Duration::from_secs(60);

/// Lock lifetime for a given entry TTL: a tenth of it, kept within [5s, 60s].
pub fn derive_lock_ttl(entry_ttl: Duration) -> Duration {
    (entry_ttl / 10).clamp(MIN_LOCK_TTL, MAX_LOCK_TTL)
}

/// Proof of lock ownership. Only the holder of the token can release the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    token: String,
}

impl LockLease {
    pub fn token(&self) -> &str {
        &self.token
    }
}

/// Cross-instance mutual exclusion for one key, built on set-if-absent and
/// compare-and-delete.
pub struct DistributedLock {
    conn: Arc<dyn SharedCacheConnection>,
    key: String,
    ttl: Duration,
}

impl DistributedLock {
    pub fn new(conn: Arc<dyn SharedCacheConnection>, key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            conn,
            key: key.into(),
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Tries to take the lock with a fresh random token.
    pub async fn try_acquire(&self) -> Result<Option<LockLease>> {
        self.try_acquire_with_token(Uuid::new_v4().to_string()).await
    }

    /// Tries to take the lock with `token`. `None` means someone else holds it.
    pub async fn try_acquire_with_token(&self, token: impl Into<String>) -> Result<Option<LockLease>> {
        let token = token.into();
        if self.conn.set_nx_ex(&self.key, &token, self.ttl).await? {
            Ok(Some(LockLease { token }))
        } else {
            Ok(None)
        }
    }

    /// Releases the lock if it is still held under `lease`. Returns false when
    /// the lock had already expired or passed to another holder.
    pub async fn release(&self, lease: &LockLease) -> Result<bool> {
        self.conn.compare_and_delete(&self.key, &lease.token).await
    }
}
