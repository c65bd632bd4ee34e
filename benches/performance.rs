use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use futures::FutureExt;
use std::time::Duration;
use tempfile::TempDir;
use tokio::runtime::Runtime;

use idempotency_coordinator::idempotency::{
    CapturedResponse, FileIdempotencyStore, IdempotencyConfig, IdempotencyCoordinator,
    IdempotencyEntry, IdempotencyKeyGenerator, IdempotencyOutcome, InFlightRegistry,
    MemorySharedCache, SharedCacheClient,
};
use idempotency_coordinator::observability::LatencyTimer;

fn benchmark_key_normalization(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_normalization");
    let generator = IdempotencyKeyGenerator::new();

    for len in [16usize, 64, 512].iter() {
        let raw: String = "k".repeat(*len);
        group.bench_with_input(BenchmarkId::new("sha256", len), &raw, |b, raw| {
            b.iter(|| black_box(generator.normalize(black_box(raw))))
        });
    }

    group.finish();
}

fn benchmark_registry(c: &mut Criterion) {
    let mut group = c.benchmark_group("in_flight_registry");
    let generator = IdempotencyKeyGenerator::new();
    let keys: Vec<_> = (0..1000)
        .filter_map(|i| generator.normalize(&format!("hold-{}", i)))
        .collect();

    group.bench_function("register_complete_1000", |b| {
        let registry = InFlightRegistry::new();
        b.iter(|| {
            for key in &keys {
                let work = async { IdempotencyOutcome::Fresh(CapturedResponse::text(200, "ok")) }
                    .boxed()
                    .shared();
                black_box(registry.register(key, work));
            }
            for key in &keys {
                registry.complete(key);
            }
        });
    });

    group.finish();
}

fn benchmark_file_store(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    let store = FileIdempotencyStore::new(dir.path(), Duration::from_secs(3600));
    let key = IdempotencyKeyGenerator::new().normalize("bench-entry").unwrap();
    let entry = IdempotencyEntry::from_response(&CapturedResponse::json(
        201,
        serde_json::json!({ "holdId": "H-1", "items": (0..32).collect::<Vec<_>>() }),
    ));

    let mut group = c.benchmark_group("file_store");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("atomic_write", |b| {
        b.to_async(&rt).iter(|| async {
            store.write(&key, &entry).await.unwrap();
        })
    });

    rt.block_on(store.write(&key, &entry)).unwrap();
    group.bench_function("read_hit", |b| {
        b.to_async(&rt).iter(|| async { black_box(store.read(&key).await.unwrap()) })
    });

    group.finish();
}

fn benchmark_replay_path(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    let client: std::sync::Arc<dyn SharedCacheClient> = std::sync::Arc::new(MemorySharedCache::new());
    let config = IdempotencyConfig {
        data_dir: dir.path().to_path_buf(),
        ..IdempotencyConfig::default()
    };
    let coordinator = IdempotencyCoordinator::new(config, Some(client)).unwrap();

    rt.block_on(coordinator.execute(Some("replayed"), None, || async {
        CapturedResponse::text(201, "created")
    }));

    c.bench_function("coordinator_replay_shared_cache", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                coordinator
                    .execute(Some("replayed"), None, || async {
                        CapturedResponse::text(201, "created")
                    })
                    .await,
            )
        })
    });
}

fn benchmark_latency_timer(c: &mut Criterion) {
    c.bench_function("latency_timer_create_and_measure", |b| {
        b.iter(|| {
            let timer = LatencyTimer::new();
            black_box(timer.elapsed_ms())
        })
    });
}

criterion_group!(
    benches,
    benchmark_key_normalization,
    benchmark_registry,
    benchmark_file_store,
    benchmark_replay_path,
    benchmark_latency_timer,
);

criterion_main!(benches);
