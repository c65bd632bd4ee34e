use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::Result;
use crate::idempotency::capture::{CapturedResponse, ResponseBody};
use crate::idempotency::key_generator::StorageKey;
use crate::idempotency::shared_cache::SharedCacheConnection;

const ENTRY_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// Recorded outcome of a completed handler execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdempotencyEntry {
    pub created_at: DateTime<Utc>,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl IdempotencyEntry {
    pub fn from_response(response: &CapturedResponse) -> Self {
        Self {
            created_at: Utc::now(),
            status: response.status,
            headers: response.headers.clone(),
            body: response.body.clone(),
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        Utc::now()
            .signed_duration_since(self.created_at)
            .to_std()
            .map(|age| age >= ttl)
            .unwrap_or(false)
    }

    pub fn to_response(&self) -> CapturedResponse {
        CapturedResponse {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }
}

/// Entry store for a single instance: one JSON file per key in `dir`.
#[derive(Debug, Clone)]
pub struct FileIdempotencyStore {
    dir: PathBuf,
    ttl: Duration,
}

impl FileIdempotencyStore {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, key: &StorageKey) -> PathBuf {
        self.dir
            .join(format!("{}.{}", key.as_str(), ENTRY_EXTENSION))
    }

    /// Reads the live entry for `key`. Missing, malformed and expired files all
    /// read as absent; the latter two are removed on the way.
    pub async fn read(&self, key: &StorageKey) -> Result<Option<IdempotencyEntry>> {
        let path = self.entry_path(key);

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<IdempotencyEntry>(&bytes) {
            Ok(entry) if !entry.is_expired(self.ttl) => Ok(Some(entry)),
            Ok(_) => {
                tracing::debug!(key = %key, "Discarding expired idempotency entry");
                remove_quietly(&path).await;
                Ok(None)
            }
            Err(e) => {
                tracing::warn!(key = %key, "Discarding malformed idempotency entry: {}", e);
                remove_quietly(&path).await;
                Ok(None)
            }
        }
    }

    /// Writes `entry` through a temp file in the same directory and renames it
    /// into place, so readers see either nothing or the whole entry.
    pub async fn write(&self, key: &StorageKey, entry: &IdempotencyEntry) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let target = self.entry_path(key);
        let temp = self.dir.join(format!(
            "{}.{}.{}",
            key.as_str(),
            Uuid::new_v4().simple(),
            TEMP_EXTENSION
        ));

        let bytes = serde_json::to_vec(entry)?;
        if let Err(e) = write_synced(&temp, &bytes).await {
            remove_quietly(&temp).await;
            return Err(e.into());
        }

        if let Err(e) = tokio::fs::rename(&temp, &target).await {
            remove_quietly(&temp).await;
            return Err(e.into());
        }

        Ok(())
    }

    /// Deletes expired entries, malformed entries and leftover temp files.
    /// Returns the number of files removed.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let mut removed = 0;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let extension = path.extension().and_then(|e| e.to_str());

            let stale = match extension {
                Some(ENTRY_EXTENSION) => match tokio::fs::read(&path).await {
                    Ok(bytes) => serde_json::from_slice::<IdempotencyEntry>(&bytes)
                        .map(|entry| entry.is_expired(self.ttl))
                        .unwrap_or(true),
                    Err(_) => false,
                },
                Some(TEMP_EXTENSION) => is_older_than(&path, self.ttl).await,
                _ => false,
            };

            if stale && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }

        Ok(removed)
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != ErrorKind::NotFound {
            tracing::debug!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

async fn is_older_than(path: &Path, age: Duration) -> bool {
    tokio::fs::metadata(path)
        .await
        .ok()
        .and_then(|meta| meta.modified().ok())
        .and_then(|modified| modified.elapsed().ok())
        .map(|elapsed| elapsed >= age)
        .unwrap_or(false)
}

/// Entry store on the shared cache. Entries carry the cache's own expiry.
pub struct SharedIdempotencyStore {
    conn: Arc<dyn SharedCacheConnection>,
    key_prefix: String,
    ttl: Duration,
}

impl SharedIdempotencyStore {
    pub fn new(conn: Arc<dyn SharedCacheConnection>, key_prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
            ttl,
        }
    }

    pub async fn read(&self, key: &StorageKey) -> Result<Option<IdempotencyEntry>> {
        let raw = match self.conn.get(&key.entry_key(&self.key_prefix)).await? {
            Some(raw) => raw,
            None => return Ok(None),
        };

        match serde_json::from_str::<IdempotencyEntry>(&raw) {
            Ok(entry) if !entry.is_expired(self.ttl) => Ok(Some(entry)),
            Ok(_) => Ok(None),
            Err(e) => {
                tracing::warn!(key = %key, "Ignoring malformed shared idempotency entry: {}", e);
                Ok(None)
            }
        }
    }

    /// Stores `entry` unless one already exists. Returns true if it was stored.
    pub async fn write(&self, key: &StorageKey, entry: &IdempotencyEntry) -> Result<bool> {
        let raw = serde_json::to_string(entry)?;
        self.conn
            .set_nx_ex(&key.entry_key(&self.key_prefix), &raw, self.ttl)
            .await
    }
}
