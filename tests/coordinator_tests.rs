use futures::future::join_all;
use idempotency_coordinator::idempotency::{
    CapturedResponse, DistributedLock, IdempotencyCleanupJob, IdempotencyConfig,
    IdempotencyCoordinator, IdempotencyKeyGenerator, IdempotencyOutcome, MemorySharedCache,
    SharedCacheClient,
};
use serde_json::json;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn test_config(dir: &Path) -> IdempotencyConfig {
    IdempotencyConfig {
        data_dir: dir.to_path_buf(),
        poll_interval: Duration::from_millis(20),
        poll_deadline: Duration::from_secs(5),
        ..IdempotencyConfig::default()
    }
}

fn file_coordinator(dir: &TempDir) -> IdempotencyCoordinator {
    IdempotencyCoordinator::new(test_config(dir.path()), None).unwrap()
}

fn shared_coordinator(dir: &TempDir, cache: &MemorySharedCache) -> IdempotencyCoordinator {
    let client: Arc<dyn SharedCacheClient> = Arc::new(cache.clone());
    IdempotencyCoordinator::new(test_config(dir.path()), Some(client)).unwrap()
}

/// A handler that counts its invocations and takes a while to finish.
fn counting_handler(
    counter: &Arc<AtomicUsize>,
    status: u16,
) -> impl FnOnce() -> futures::future::BoxFuture<'static, CapturedResponse> + Send + 'static {
    let counter = Arc::clone(counter);
    move || {
        Box::pin(async move {
            let run = counter.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            CapturedResponse::json(status, json!({ "hold": "h-1", "run": run }))
        })
    }
}

fn entry_files(dir: &Path) -> usize {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "json").unwrap_or(false))
            .count(),
        Err(_) => 0,
    }
}

#[tokio::test]
async fn test_concurrent_duplicates_run_handler_once() {
    let dir = TempDir::new().unwrap();
    let coordinator = file_coordinator(&dir);
    let counter = Arc::new(AtomicUsize::new(0));

    let calls = (0..20).map(|_| {
        coordinator.execute(Some("place-hold-42"), None, counting_handler(&counter, 201))
    });
    let outcomes = join_all(calls).await;

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_fresh()).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_replay()).count(), 19);

    let first = outcomes[0].response().cloned().unwrap();
    assert_eq!(first.status, 201);
    for outcome in &outcomes {
        assert_eq!(outcome.response(), Some(&first));
    }

    let snapshot = coordinator.metrics().snapshot();
    assert_eq!(snapshot.joined_requests, 19);
    assert_eq!(coordinator.in_flight(), 0);
}

#[tokio::test]
async fn test_concurrent_duplicates_across_instances_run_handler_once() {
    let cache = MemorySharedCache::new();
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let instance_a = shared_coordinator(&dir_a, &cache);
    let instance_b = shared_coordinator(&dir_b, &cache);
    let counter = Arc::new(AtomicUsize::new(0));

    let mut calls = Vec::new();
    for i in 0..10 {
        let instance = if i % 2 == 0 { &instance_a } else { &instance_b };
        calls.push(instance.execute(Some("renew-7"), None, counting_handler(&counter, 200)));
    }
    let outcomes = join_all(calls).await;

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_fresh()).count(), 1);
    assert!(outcomes.iter().all(|o| !o.is_conflict()));

    let expected = outcomes.iter().find(|o| o.is_fresh()).and_then(|o| o.response()).cloned();
    for outcome in &outcomes {
        assert_eq!(outcome.response().cloned(), expected);
    }

    // Nothing written locally while the shared cache was healthy.
    assert_eq!(entry_files(dir_a.path()), 0);
    assert_eq!(entry_files(dir_b.path()), 0);
}

#[tokio::test]
async fn test_sequential_retry_replays_recorded_response() {
    let dir = TempDir::new().unwrap();
    let coordinator = file_coordinator(&dir);
    let counter = Arc::new(AtomicUsize::new(0));

    let first = coordinator
        .execute(Some("checkout-9"), Some("req-1"), counting_handler(&counter, 201))
        .await;
    let second = coordinator
        .execute(Some("checkout-9"), Some("req-2"), counting_handler(&counter, 201))
        .await;

    assert!(first.is_fresh());
    assert!(second.is_replay());
    assert_eq!(first.response(), second.response());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(entry_files(dir.path()), 1);
}

#[tokio::test]
async fn test_missing_or_blank_key_bypasses_coordination() {
    let dir = TempDir::new().unwrap();
    let coordinator = file_coordinator(&dir);
    let counter = Arc::new(AtomicUsize::new(0));

    let a = coordinator.execute(None, None, counting_handler(&counter, 201)).await;
    let b = coordinator.execute(None, None, counting_handler(&counter, 201)).await;
    let c = coordinator.execute(Some("   "), None, counting_handler(&counter, 201)).await;

    assert!(matches!(a, IdempotencyOutcome::Bypassed(_)));
    assert!(matches!(b, IdempotencyOutcome::Bypassed(_)));
    assert!(matches!(c, IdempotencyOutcome::Bypassed(_)));
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    assert_eq!(entry_files(dir.path()), 0);
    assert_eq!(coordinator.metrics().snapshot().bypassed_requests, 3);
}

#[tokio::test]
async fn test_distinct_keys_execute_independently() {
    let dir = TempDir::new().unwrap();
    let coordinator = file_coordinator(&dir);
    let counter = Arc::new(AtomicUsize::new(0));

    let outcomes = join_all(vec![
        coordinator.execute(Some("hold-a"), None, counting_handler(&counter, 201)),
        coordinator.execute(Some("hold-b"), None, counting_handler(&counter, 201)),
    ])
    .await;

    assert!(outcomes.iter().all(|o| o.is_fresh()));
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_eq!(entry_files(dir.path()), 2);
}

#[tokio::test]
async fn test_expired_entry_executes_again() {
    let dir = TempDir::new().unwrap();
    let config = IdempotencyConfig {
        entry_ttl: Duration::from_millis(200),
        poll_interval: Duration::from_millis(10),
        poll_deadline: Duration::from_millis(100),
        data_dir: dir.path().to_path_buf(),
        ..IdempotencyConfig::default()
    };
    let coordinator = IdempotencyCoordinator::new(config, None).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let first = coordinator
        .execute(Some("cancel-hold-3"), None, counting_handler(&counter, 200))
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    let second = coordinator
        .execute(Some("cancel-hold-3"), None, counting_handler(&counter, 200))
        .await;

    assert!(first.is_fresh());
    assert!(second.is_fresh());
    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert_ne!(first.response(), second.response());
}

#[tokio::test]
async fn test_error_responses_are_recorded_and_replayed() {
    let dir = TempDir::new().unwrap();
    let coordinator = file_coordinator(&dir);
    let counter = Arc::new(AtomicUsize::new(0));

    let first = coordinator
        .execute(Some("bad-request-1"), None, counting_handler(&counter, 400))
        .await;
    let second = coordinator
        .execute(Some("bad-request-1"), None, counting_handler(&counter, 400))
        .await;

    assert_eq!(first.response().map(|r| r.status), Some(400));
    assert!(second.is_replay());
    assert_eq!(second.response().map(|r| r.status), Some(400));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_panicking_handler_is_recorded_as_internal_error() {
    let cache = MemorySharedCache::new();
    let dir = TempDir::new().unwrap();
    let coordinator = shared_coordinator(&dir, &cache);

    let first = coordinator
        .execute(Some("explode-1"), None, || async {
            if true {
                panic!("handler exploded");
            }
            CapturedResponse::text(200, "unreachable")
        })
        .await;
    assert_eq!(first, IdempotencyOutcome::Fresh(CapturedResponse::internal_error()));

    let key = IdempotencyKeyGenerator::new().normalize("explode-1").unwrap();
    let prefix = &coordinator.config().key_prefix;
    assert!(!cache.contains_key(&key.lock_key(prefix)));
    assert!(cache.contains_key(&key.entry_key(prefix)));

    let counter = Arc::new(AtomicUsize::new(0));
    let second = coordinator
        .execute(Some("explode-1"), None, counting_handler(&counter, 200))
        .await;
    assert!(second.is_replay());
    assert_eq!(second.response().map(|r| r.status), Some(500));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_lock_released_after_execution() {
    let cache = MemorySharedCache::new();
    let dir = TempDir::new().unwrap();
    let coordinator = shared_coordinator(&dir, &cache);
    let counter = Arc::new(AtomicUsize::new(0));

    let outcome = coordinator
        .execute(Some("renew-1"), None, counting_handler(&counter, 200))
        .await;
    assert!(outcome.is_fresh());

    let key = IdempotencyKeyGenerator::new().normalize("renew-1").unwrap();
    let prefix = &coordinator.config().key_prefix;
    assert!(!cache.contains_key(&key.lock_key(prefix)));
    assert!(cache.contains_key(&key.entry_key(prefix)));
}

#[tokio::test]
async fn test_lock_held_elsewhere_times_out_with_conflict() {
    let cache = MemorySharedCache::new();
    let dir = TempDir::new().unwrap();
    let config = IdempotencyConfig {
        data_dir: dir.path().to_path_buf(),
        poll_interval: Duration::from_millis(20),
        poll_deadline: Duration::from_millis(200),
        ..IdempotencyConfig::default()
    };
    let client: Arc<dyn SharedCacheClient> = Arc::new(cache.clone());
    let coordinator = IdempotencyCoordinator::new(config, Some(client)).unwrap();

    // Another instance holds the lock and never finishes.
    let key = IdempotencyKeyGenerator::new().normalize("stuck-1").unwrap();
    let conn = cache.connect().await.unwrap();
    let lock = DistributedLock::new(
        conn,
        key.lock_key(&coordinator.config().key_prefix),
        Duration::from_secs(30),
    );
    let lease = lock.try_acquire().await.unwrap().unwrap();

    let counter = Arc::new(AtomicUsize::new(0));
    let outcome = coordinator
        .execute(Some("stuck-1"), None, counting_handler(&counter, 201))
        .await;

    assert_eq!(
        outcome,
        IdempotencyOutcome::Conflict {
            retry_after: Duration::from_secs(1)
        }
    );
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.metrics().snapshot().conflicts, 1);

    // The holder's lease is untouched by the waiter.
    assert!(lock.release(&lease).await.unwrap());
}

#[tokio::test]
async fn test_waiter_replays_entry_written_by_lock_holder() {
    let cache = MemorySharedCache::new();
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let instance_a = shared_coordinator(&dir_a, &cache);
    let instance_b = shared_coordinator(&dir_b, &cache);
    let counter = Arc::new(AtomicUsize::new(0));

    let slow = {
        let counter = Arc::clone(&counter);
        move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            CapturedResponse::json(201, json!({ "loan": "L-5" }))
        }
    };

    let holder = {
        let instance_a = instance_a.clone();
        tokio::spawn(async move { instance_a.execute(Some("loan-5"), None, slow).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let waiter = instance_b
        .execute(Some("loan-5"), None, counting_handler(&counter, 500))
        .await;
    let holder = holder.await.unwrap();

    assert!(holder.is_fresh());
    assert!(waiter.is_replay());
    assert_eq!(waiter.response(), holder.response());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unavailable_shared_cache_falls_back_to_file_store() {
    let cache = MemorySharedCache::new();
    cache.set_available(false);
    let dir = TempDir::new().unwrap();
    let coordinator = shared_coordinator(&dir, &cache);
    let counter = Arc::new(AtomicUsize::new(0));

    let first = coordinator
        .execute(Some("offline-1"), None, counting_handler(&counter, 201))
        .await;
    let second = coordinator
        .execute(Some("offline-1"), None, counting_handler(&counter, 201))
        .await;

    assert!(first.is_fresh());
    assert!(second.is_replay());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(entry_files(dir.path()), 1);

    let key = IdempotencyKeyGenerator::new().normalize("offline-1").unwrap();
    assert!(coordinator.file_store().entry_path(&key).exists());
    assert_eq!(coordinator.metrics().snapshot().backend_fallbacks, 2);
}

#[tokio::test]
async fn test_concurrent_duplicates_on_fallback_run_handler_once() {
    let cache = MemorySharedCache::new();
    cache.set_available(false);
    let dir = TempDir::new().unwrap();
    let coordinator = shared_coordinator(&dir, &cache);
    let counter = Arc::new(AtomicUsize::new(0));

    let calls = (0..20).map(|_| {
        coordinator.execute(Some("offline-burst"), None, counting_handler(&counter, 201))
    });
    let outcomes = join_all(calls).await;

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_fresh()).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| o.is_replay()).count(), 19);
    let expected = outcomes[0].response().cloned();
    assert!(outcomes.iter().all(|o| o.response().cloned() == expected));
    assert_eq!(entry_files(dir.path()), 1);

    let retry = coordinator
        .execute(Some("offline-burst"), None, counting_handler(&counter, 201))
        .await;
    assert!(retry.is_replay());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_shared_cache_failure_after_connect_does_not_run_locally() {
    let cache = MemorySharedCache::new();
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let instance_a = shared_coordinator(&dir_a, &cache);
    let instance_b = shared_coordinator(&dir_b, &cache);

    // Instance A is executing the key when the cache starts failing commands.
    let key = IdempotencyKeyGenerator::new().normalize("hold-x").unwrap();
    let lock = DistributedLock::new(
        cache.connect().await.unwrap(),
        key.lock_key(&instance_a.config().key_prefix),
        Duration::from_secs(30),
    );
    let lease = lock.try_acquire().await.unwrap().unwrap();
    cache.set_failing(true);

    let counter = Arc::new(AtomicUsize::new(0));
    let outcome = instance_b
        .execute(Some("hold-x"), None, counting_handler(&counter, 201))
        .await;

    assert_eq!(
        outcome,
        IdempotencyOutcome::Conflict {
            retry_after: Duration::from_secs(1)
        }
    );
    assert_eq!(counter.load(Ordering::SeqCst), 0);
    assert_eq!(entry_files(dir_b.path()), 0);
    let snapshot = instance_b.metrics().snapshot();
    assert_eq!(snapshot.backend_fallbacks, 0);
    assert_eq!(snapshot.conflicts, 1);

    // The conflict is not recorded: once the cache recovers and A is done, B executes.
    cache.set_failing(false);
    assert!(lock.release(&lease).await.unwrap());
    let retry = instance_b
        .execute(Some("hold-x"), None, counting_handler(&counter, 201))
        .await;
    assert!(retry.is_fresh());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_abandoned_request_still_completes_execution() {
    let dir = TempDir::new().unwrap();
    let coordinator = file_coordinator(&dir);
    let counter = Arc::new(AtomicUsize::new(0));

    let request = {
        let coordinator = coordinator.clone();
        let handler = counting_handler(&counter, 201);
        tokio::spawn(async move { coordinator.execute(Some("abandon-1"), None, handler).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    request.abort();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(coordinator.in_flight(), 0);

    let retry = coordinator
        .execute(Some("abandon-1"), None, counting_handler(&counter, 201))
        .await;
    assert!(retry.is_replay());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cleanup_job_removes_expired_entries() {
    let dir = TempDir::new().unwrap();
    let config = IdempotencyConfig {
        entry_ttl: Duration::from_millis(100),
        poll_interval: Duration::from_millis(10),
        poll_deadline: Duration::from_millis(100),
        data_dir: dir.path().to_path_buf(),
        ..IdempotencyConfig::default()
    };
    let coordinator = IdempotencyCoordinator::new(config, None).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    coordinator
        .execute(Some("sweep-1"), None, counting_handler(&counter, 201))
        .await;
    coordinator
        .execute(Some("sweep-2"), None, counting_handler(&counter, 201))
        .await;
    assert_eq!(entry_files(dir.path()), 2);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let job = IdempotencyCleanupJob::new(coordinator.clone(), Duration::from_secs(60));
    assert_eq!(job.run_once().await.unwrap(), 2);
    assert_eq!(entry_files(dir.path()), 0);
}
