use sha2::{Digest, Sha256};
use std::fmt;

use crate::observability::mask_sensitive;

/// Hex-encoded SHA-256 digest of a client idempotency key.
///
/// The raw key never leaves [`IdempotencyKeyGenerator::normalize`]; only this
/// digest is written to disk, sent to the shared cache, or logged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Shared cache key holding the persisted entry.
    pub fn entry_key(&self, prefix: &str) -> String {
        format!("{}:entry:{}", prefix, self.0)
    }

    /// Shared cache key holding the execution lock.
    pub fn lock_key(&self, prefix: &str) -> String {
        format!("{}:lock:{}", prefix, self.0)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&mask_sensitive(&self.0, 6))
    }
}

/// Turns client-supplied idempotency keys into fixed-length storage keys.
#[derive(Debug, Clone, Default)]
pub struct IdempotencyKeyGenerator;

impl IdempotencyKeyGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Hashes a client key. Blank keys yield `None`, which means the request
    /// is not coordinated at all.
    pub fn normalize(&self, client_key: &str) -> Option<StorageKey> {
        if client_key.trim().is_empty() {
            return None;
        }

        let mut hasher = Sha256::new();
        hasher.update(client_key.as_bytes());
        Some(StorageKey(hex::encode(hasher.finalize())))
    }
}
