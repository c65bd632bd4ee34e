use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::{AppError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Deletes KEYS[1] only while it still holds ARGV[1].
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// A cache shared by every instance of the application.
///
/// `connect` is the single point where an unreachable cache is detected; callers
/// fall back to local storage when it fails.
#[async_trait]
pub trait SharedCacheClient: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn SharedCacheConnection>>;

    fn name(&self) -> &'static str;
}

/// Atomic primitives the entry store and the distributed lock are built on.
#[async_trait]
pub trait SharedCacheConnection: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Sets `key` only if it does not exist, with an expiry. Returns true if
    /// this call wrote the value.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Deletes `key` only if it currently holds `expected`. Returns true if
    /// this call deleted it.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool>;

    async fn ping(&self) -> Result<()>;
}

/// Redis-backed shared cache.
#[derive(Clone)]
pub struct RedisSharedCache {
    client: redis::Client,
}

impl RedisSharedCache {
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    pub fn open(url: &str) -> Result<Self> {
        Ok(Self::new(redis::Client::open(url)?))
    }
}

#[async_trait]
impl SharedCacheClient for RedisSharedCache {
    async fn connect(&self) -> Result<Arc<dyn SharedCacheConnection>> {
        let conn = tokio::time::timeout(
            CONNECT_TIMEOUT,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| AppError::Unavailable("connection timeout".to_string()))?
        .map_err(|e| AppError::Unavailable(e.to_string()))?;

        Ok(Arc::new(RedisConnection {
            conn,
            release_script: redis::Script::new(COMPARE_AND_DELETE),
        }))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

struct RedisConnection {
    conn: MultiplexedConnection,
    release_script: redis::Script,
}

#[async_trait]
impl SharedCacheConnection for RedisConnection {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let result: Option<String> = conn
            .set_options(
                key,
                value,
                redis::SetOptions::default()
                    .conditional_set(redis::ExistenceCheck::NX)
                    .with_expiration(redis::SetExpiry::PX(ttl.as_millis().max(1) as usize)),
            )
            .await?;

        Ok(result.is_some())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;

        Ok(deleted > 0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

struct MemoryValue {
    value: String,
    expires_at: Instant,
}

type MemoryEntries = Arc<Mutex<HashMap<String, MemoryValue>>>;

/// Process-local shared cache. Clones share state, so several coordinators
/// holding clones behave like instances behind one Redis.
#[derive(Clone)]
pub struct MemorySharedCache {
    entries: MemoryEntries,
    available: Arc<AtomicBool>,
    failing: Arc<AtomicBool>,
}

impl MemorySharedCache {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While unavailable, `connect` fails the way an unreachable server would.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// While failing, `connect` still succeeds but every command on an open
    /// connection errors, like a server that drops mid-request.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let mut entries = lock_entries(&self.entries);
        live_value(&mut entries, key).is_some()
    }
}

impl Default for MemorySharedCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedCacheClient for MemorySharedCache {
    async fn connect(&self) -> Result<Arc<dyn SharedCacheConnection>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(AppError::Unavailable("memory cache marked unavailable".to_string()));
        }

        Ok(Arc::new(MemoryConnection {
            entries: Arc::clone(&self.entries),
            failing: Arc::clone(&self.failing),
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

struct MemoryConnection {
    entries: MemoryEntries,
    failing: Arc<AtomicBool>,
}

impl MemoryConnection {
    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::Unavailable("memory cache command failed".to_string()));
        }
        Ok(())
    }
}

fn lock_entries(entries: &MemoryEntries) -> MutexGuard<'_, HashMap<String, MemoryValue>> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

fn live_value<'a>(entries: &'a mut HashMap<String, MemoryValue>, key: &str) -> Option<&'a str> {
    let expired = entries
        .get(key)
        .map(|v| v.expires_at <= Instant::now())
        .unwrap_or(false);
    if expired {
        entries.remove(key);
    }
    entries.get(key).map(|v| v.value.as_str())
}

#[async_trait]
impl SharedCacheConnection for MemoryConnection {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        let mut entries = lock_entries(&self.entries);
        Ok(live_value(&mut entries, key).map(str::to_owned))
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        self.check()?;
        let mut entries = lock_entries(&self.entries);
        if live_value(&mut entries, key).is_some() {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            MemoryValue {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool> {
        self.check()?;
        let mut entries = lock_entries(&self.entries);
        if live_value(&mut entries, key) == Some(expected) {
            entries.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }
}
