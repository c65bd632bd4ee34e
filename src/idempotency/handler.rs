use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::Settings;
use crate::error::{AppError, Result};
use crate::idempotency::capture::{CapturedResponse, IdempotencyOutcome};
use crate::idempotency::key_generator::{IdempotencyKeyGenerator, StorageKey};
use crate::idempotency::lock::{derive_lock_ttl, DistributedLock, LockLease};
use crate::idempotency::registry::{InFlightRegistry, Registration};
use crate::idempotency::shared_cache::SharedCacheClient;
use crate::idempotency::storage::{FileIdempotencyStore, IdempotencyEntry, SharedIdempotencyStore};
use crate::observability::{get_metrics, LatencyTimer};

/// Per-coordinator counters.
#[derive(Debug, Default)]
pub struct IdempotencyMetrics {
    pub total_requests: AtomicU64,
    pub bypassed_requests: AtomicU64,
    pub fresh_requests: AtomicU64,
    pub replayed_requests: AtomicU64,
    pub joined_requests: AtomicU64,
    pub conflicts: AtomicU64,
    pub backend_fallbacks: AtomicU64,
    pub write_failures: AtomicU64,
}

impl IdempotencyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bypass(&self) {
        self.bypassed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fresh(&self) {
        self.fresh_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay(&self) {
        self.replayed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_joined(&self) {
        self.joined_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fallback(&self) {
        self.backend_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            bypassed_requests: self.bypassed_requests.load(Ordering::Relaxed),
            fresh_requests: self.fresh_requests.load(Ordering::Relaxed),
            replayed_requests: self.replayed_requests.load(Ordering::Relaxed),
            joined_requests: self.joined_requests.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            backend_fallbacks: self.backend_fallbacks.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub bypassed_requests: u64,
    pub fresh_requests: u64,
    pub replayed_requests: u64,
    pub joined_requests: u64,
    pub conflicts: u64,
    pub backend_fallbacks: u64,
    pub write_failures: u64,
}

impl MetricsSnapshot {
    pub fn replay_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.replayed_requests as f64 / self.total_requests as f64
        }
    }
}

/// Runtime configuration of the coordinator.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub entry_ttl: Duration,
    pub poll_interval: Duration,
    pub poll_deadline: Duration,
    pub data_dir: PathBuf,
    pub key_prefix: String,
    pub body_limit_bytes: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(6 * 60 * 60),
            poll_interval: Duration::from_millis(250),
            poll_deadline: Duration::from_secs(30),
            data_dir: PathBuf::from("data/idempotency"),
            key_prefix: "library:idem".to_string(),
            body_limit_bytes: 1024 * 1024,
        }
    }
}

impl IdempotencyConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let config = Self {
            entry_ttl: Duration::from_secs(settings.idempotency.ttl_seconds),
            poll_interval: Duration::from_millis(settings.idempotency.poll_interval_ms),
            poll_deadline: Duration::from_millis(settings.idempotency.poll_deadline_ms),
            data_dir: PathBuf::from(&settings.idempotency.data_dir),
            key_prefix: settings.redis.key_prefix.clone(),
            body_limit_bytes: settings.idempotency.body_limit_bytes,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.entry_ttl.is_zero() {
            return Err(AppError::Validation("entry ttl must be positive".to_string()));
        }
        if self.poll_interval.is_zero() {
            return Err(AppError::Validation("poll interval must be positive".to_string()));
        }
        if self.poll_deadline < self.poll_interval {
            return Err(AppError::Validation(
                "poll deadline must not be shorter than the poll interval".to_string(),
            ));
        }
        if self.key_prefix.is_empty() {
            return Err(AppError::Validation("key prefix must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn lock_ttl(&self) -> Duration {
        derive_lock_ttl(self.entry_ttl)
    }

    /// Hint sent with a conflict response, in whole seconds.
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.poll_interval.as_secs().max(1))
    }
}

/// Coordinates idempotent execution of mutating requests.
///
/// Duplicates on this instance join the in-flight execution; duplicates on other
/// instances are serialized by a distributed lock on the shared cache, or by the
/// local file store when no shared cache is configured or reachable.
#[derive(Clone)]
pub struct IdempotencyCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    config: IdempotencyConfig,
    key_generator: IdempotencyKeyGenerator,
    file_store: FileIdempotencyStore,
    shared_cache: Option<Arc<dyn SharedCacheClient>>,
    registry: InFlightRegistry,
    metrics: Arc<IdempotencyMetrics>,
}

enum SharedPlan {
    Replay(CapturedResponse),
    Execute(LockLease),
    Wait,
}

/// Removes the registry entry when the execution task ends, however it ends.
struct InFlightGuard {
    inner: Arc<CoordinatorInner>,
    key: StorageKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.registry.complete(&self.key);
    }
}

impl IdempotencyCoordinator {
    pub fn new(
        config: IdempotencyConfig,
        shared_cache: Option<Arc<dyn SharedCacheClient>>,
    ) -> Result<Self> {
        config.validate()?;
        let file_store = FileIdempotencyStore::new(config.data_dir.clone(), config.entry_ttl);

        Ok(Self {
            inner: Arc::new(CoordinatorInner {
                config,
                key_generator: IdempotencyKeyGenerator::new(),
                file_store,
                shared_cache,
                registry: InFlightRegistry::new(),
                metrics: Arc::new(IdempotencyMetrics::new()),
            }),
        })
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> Arc<IdempotencyMetrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn shared_cache(&self) -> Option<Arc<dyn SharedCacheClient>> {
        self.inner.shared_cache.clone()
    }

    pub fn file_store(&self) -> &FileIdempotencyStore {
        &self.inner.file_store
    }

    /// Number of executions currently in flight on this instance.
    pub fn in_flight(&self) -> usize {
        self.inner.registry.len()
    }

    /// Records a request that was passed through without a key.
    pub fn record_bypass(&self) {
        self.inner.metrics.record_request();
        self.inner.metrics.record_bypass();
        get_metrics().record_idempotency_request("bypass");
    }

    /// Runs `handler` at most once per key and TTL window.
    ///
    /// Without a usable key the handler runs unconditionally and nothing is
    /// recorded. Otherwise the outcome is either the fresh result of this call,
    /// a replay of an earlier result, or a conflict when another instance holds
    /// the key past the poll deadline.
    pub async fn execute<F, Fut>(
        &self,
        idempotency_key: Option<&str>,
        request_id: Option<&str>,
        handler: F,
    ) -> IdempotencyOutcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CapturedResponse> + Send + 'static,
    {
        let key = match idempotency_key.and_then(|k| self.inner.key_generator.normalize(k)) {
            Some(key) => key,
            None => {
                self.record_bypass();
                return IdempotencyOutcome::Bypassed(run_handler(handler).await);
            }
        };

        self.inner.metrics.record_request();

        let inner = Arc::clone(&self.inner);
        let task_key = key.clone();
        let task_request_id = request_id.map(str::to_owned);
        let work = async move {
            let task = tokio::spawn(async move {
                let _guard = InFlightGuard {
                    inner: Arc::clone(&inner),
                    key: task_key.clone(),
                };
                inner
                    .coordinate(&task_key, task_request_id.as_deref(), handler)
                    .await
            });

            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!("Idempotent execution task failed: {}", e);
                    IdempotencyOutcome::Fresh(CapturedResponse::internal_error())
                }
            }
        }
        .boxed()
        .shared();

        let outcome = match self.inner.registry.register(&key, work) {
            Registration::Installed(work) => work.await,
            Registration::Joined(work) => {
                tracing::debug!(key = %key, request_id = ?request_id, "Joining in-flight execution");
                self.inner.metrics.record_joined();
                get_metrics().record_inflight_join();
                work.await.into_joined()
            }
        };

        self.record_outcome(&outcome);
        outcome
    }

    /// Removes expired entries from the local file store.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        self.inner.file_store.cleanup_expired().await
    }

    fn record_outcome(&self, outcome: &IdempotencyOutcome) {
        match outcome {
            IdempotencyOutcome::Bypassed(_) => self.inner.metrics.record_bypass(),
            IdempotencyOutcome::Fresh(_) => self.inner.metrics.record_fresh(),
            IdempotencyOutcome::Replayed(_) => self.inner.metrics.record_replay(),
            IdempotencyOutcome::Conflict { .. } => self.inner.metrics.record_conflict(),
        }
        get_metrics().record_idempotency_request(outcome.label());
    }
}

impl CoordinatorInner {
    async fn coordinate<F, Fut>(
        &self,
        key: &StorageKey,
        request_id: Option<&str>,
        handler: F,
    ) -> IdempotencyOutcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CapturedResponse> + Send + 'static,
    {
        if let Some(client) = &self.shared_cache {
            match client.connect().await {
                Ok(conn) => {
                    let store = SharedIdempotencyStore::new(
                        Arc::clone(&conn),
                        self.config.key_prefix.as_str(),
                        self.config.entry_ttl,
                    );
                    let lock = DistributedLock::new(
                        conn,
                        key.lock_key(&self.config.key_prefix),
                        self.config.lock_ttl(),
                    );

                    match self.plan_shared(&store, &lock, key).await {
                        Ok(SharedPlan::Replay(response)) => {
                            tracing::debug!(key = %key, request_id = ?request_id, "Replaying shared idempotency entry");
                            return IdempotencyOutcome::Replayed(response);
                        }
                        Ok(SharedPlan::Execute(lease)) => {
                            return self
                                .execute_locked(&store, &lock, lease, key, request_id, handler)
                                .await;
                        }
                        Ok(SharedPlan::Wait) => {
                            return self.wait_for_entry(&store, key, request_id).await;
                        }
                        Err(e) => {
                            // No lock is held here, so the key must not run locally.
                            tracing::warn!(
                                key = %key,
                                request_id = ?request_id,
                                "Shared cache {} failed before lock acquisition, asking client to retry: {}",
                                client.name(),
                                e
                            );
                            return IdempotencyOutcome::Conflict {
                                retry_after: self.config.retry_after(),
                            };
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        key = %key,
                        request_id = ?request_id,
                        "Shared cache {} unavailable, using file store: {}",
                        client.name(),
                        e
                    );
                }
            }

            self.metrics.record_fallback();
            get_metrics().record_backend_fallback();
        }

        self.execute_local(key, request_id, handler).await
    }

    async fn plan_shared(
        &self,
        store: &SharedIdempotencyStore,
        lock: &DistributedLock,
        key: &StorageKey,
    ) -> Result<SharedPlan> {
        if let Some(entry) = store.read(key).await? {
            return Ok(SharedPlan::Replay(entry.to_response()));
        }

        match lock.try_acquire().await? {
            Some(lease) => {
                get_metrics().record_lock_acquired();
                Ok(SharedPlan::Execute(lease))
            }
            None => {
                get_metrics().record_lock_contended();
                Ok(SharedPlan::Wait)
            }
        }
    }

    /// Protected section on the shared cache. The lock is released exactly once
    /// after the whole section, including when anything inside it panics.
    async fn execute_locked<F, Fut>(
        &self,
        store: &SharedIdempotencyStore,
        lock: &DistributedLock,
        lease: LockLease,
        key: &StorageKey,
        request_id: Option<&str>,
        handler: F,
    ) -> IdempotencyOutcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CapturedResponse> + Send + 'static,
    {
        let section = async {
            // The previous holder may have finished between our read and our acquire.
            match store.read(key).await {
                Ok(Some(entry)) => return IdempotencyOutcome::Replayed(entry.to_response()),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key = %key, request_id = ?request_id, "Shared entry re-check failed: {}", e);
                }
            }

            let response = run_handler(handler).await;
            let entry = IdempotencyEntry::from_response(&response);
            match store.write(key, &entry).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(key = %key, request_id = ?request_id, "Shared entry already present, kept existing");
                }
                Err(e) => {
                    tracing::error!(key = %key, request_id = ?request_id, "Failed to persist shared idempotency entry: {}", e);
                    self.metrics.record_write_failure();
                    get_metrics().record_entry_write_failure();
                }
            }

            IdempotencyOutcome::Fresh(response)
        };

        let outcome = AssertUnwindSafe(section).catch_unwind().await;

        match lock.release(&lease).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(key = %key, request_id = ?request_id, "Lock expired before release (ttl {:?})", lock.ttl());
            }
            Err(e) => {
                tracing::error!(key = %key, request_id = ?request_id, "Failed to release idempotency lock: {}", e);
            }
        }

        outcome.unwrap_or_else(|_| {
            tracing::error!(key = %key, request_id = ?request_id, "Protected section panicked");
            IdempotencyOutcome::Fresh(CapturedResponse::internal_error())
        })
    }

    /// Polls for the lock holder's entry until the deadline.
    async fn wait_for_entry(
        &self,
        store: &SharedIdempotencyStore,
        key: &StorageKey,
        request_id: Option<&str>,
    ) -> IdempotencyOutcome {
        tracing::debug!(key = %key, request_id = ?request_id, "Key locked by another instance, polling");
        let deadline = Instant::now() + self.config.poll_deadline;

        loop {
            tokio::time::sleep(self.config.poll_interval).await;

            match store.read(key).await {
                Ok(Some(entry)) => return IdempotencyOutcome::Replayed(entry.to_response()),
                Ok(None) => {}
                Err(e) => {
                    tracing::debug!(key = %key, request_id = ?request_id, "Poll read failed: {}", e);
                }
            }

            if Instant::now() >= deadline {
                break;
            }
        }

        tracing::warn!(
            key = %key,
            request_id = ?request_id,
            "No entry after {:?}, asking client to retry",
            self.config.poll_deadline
        );
        get_metrics().record_poll_timeout();
        IdempotencyOutcome::Conflict {
            retry_after: self.config.retry_after(),
        }
    }

    async fn execute_local<F, Fut>(
        &self,
        key: &StorageKey,
        request_id: Option<&str>,
        handler: F,
    ) -> IdempotencyOutcome
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CapturedResponse> + Send + 'static,
    {
        match self.file_store.read(key).await {
            Ok(Some(entry)) => {
                tracing::debug!(key = %key, request_id = ?request_id, "Replaying file idempotency entry");
                return IdempotencyOutcome::Replayed(entry.to_response());
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(key = %key, request_id = ?request_id, "File entry read failed, treating as absent: {}", e);
            }
        }

        let response = run_handler(handler).await;
        let entry = IdempotencyEntry::from_response(&response);
        if let Err(e) = self.file_store.write(key, &entry).await {
            tracing::error!(key = %key, request_id = ?request_id, "Failed to persist idempotency entry: {}", e);
            self.metrics.record_write_failure();
            get_metrics().record_entry_write_failure();
        }

        IdempotencyOutcome::Fresh(response)
    }
}

/// Runs a handler, turning a panic into a recorded 500 outcome.
async fn run_handler<F, Fut>(handler: F) -> CapturedResponse
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = CapturedResponse>,
{
    let timer = LatencyTimer::new();
    let response = AssertUnwindSafe(async move { handler().await })
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            tracing::error!("Idempotent handler panicked");
            CapturedResponse::internal_error()
        });
    get_metrics().record_handler_latency(timer.elapsed_ms(), response.status);
    response
}

/// Background sweep of expired file entries.
pub struct IdempotencyCleanupJob {
    coordinator: IdempotencyCoordinator,
    interval: Duration,
}

impl IdempotencyCleanupJob {
    pub fn new(coordinator: IdempotencyCoordinator, interval: Duration) -> Self {
        Self {
            coordinator,
            interval,
        }
    }

    pub async fn run_once(&self) -> Result<u64> {
        self.coordinator.cleanup_expired().await
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);

            loop {
                interval.tick().await;

                match self.run_once().await {
                    Ok(count) => {
                        if count > 0 {
                            tracing::info!("Cleaned up {} expired idempotency entries", count);
                        }
                    }
                    Err(e) => {
                        tracing::error!("Failed to clean up expired idempotency entries: {}", e);
                    }
                }
            }
        })
    }
}
