pub mod capture;
pub mod handler;
pub mod key_generator;
pub mod lock;
pub mod registry;
pub mod shared_cache;
pub mod storage;

pub use capture::{CapturedResponse, IdempotencyOutcome, ResponseBody};
pub use handler::{
    IdempotencyCleanupJob, IdempotencyConfig, IdempotencyCoordinator, IdempotencyMetrics,
    MetricsSnapshot,
};
pub use key_generator::{IdempotencyKeyGenerator, StorageKey};
pub use lock::{derive_lock_ttl, DistributedLock, LockLease};
pub use registry::{InFlightFuture, InFlightRegistry, Registration};
pub use shared_cache::{
    MemorySharedCache, RedisSharedCache, SharedCacheClient, SharedCacheConnection,
};
pub use storage::{FileIdempotencyStore, IdempotencyEntry, SharedIdempotencyStore};
