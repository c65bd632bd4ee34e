use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::idempotency::SharedCacheClient;

/// Health status of a service or dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthStatus::Degraded)
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, HealthStatus::Unhealthy)
    }
}

/// Health status of a single dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

impl DependencyHealth {
    pub fn healthy(name: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            latency_ms: Some(latency_ms),
            message: None,
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            latency_ms: None,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(message.into()),
        }
    }
}

/// Aggregated health check result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedHealth {
    pub status: HealthStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub dependencies: Vec<DependencyHealth>,
}

impl AggregatedHealth {
    pub fn new(version: String, uptime_seconds: u64, dependencies: Vec<DependencyHealth>) -> Self {
        let status = Self::aggregate_status(&dependencies);
        Self {
            status,
            version,
            uptime_seconds,
            dependencies,
        }
    }

    fn aggregate_status(dependencies: &[DependencyHealth]) -> HealthStatus {
        let has_unhealthy = dependencies.iter().any(|d| d.status.is_unhealthy());
        let has_degraded = dependencies.iter().any(|d| d.status.is_degraded());

        if has_unhealthy {
            HealthStatus::Unhealthy
        } else if has_degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Health checker for the coordinator's storage dependencies.
pub struct HealthChecker {
    data_dir: PathBuf,
    shared_cache: Option<Arc<dyn SharedCacheClient>>,
    start_time: std::time::Instant,
}

impl HealthChecker {
    pub fn new(data_dir: impl Into<PathBuf>, shared_cache: Option<Arc<dyn SharedCacheClient>>) -> Self {
        Self {
            data_dir: data_dir.into(),
            shared_cache,
            start_time: std::time::Instant::now(),
        }
    }

    /// Performs a full health check of all dependencies.
    pub async fn check_all(&self) -> AggregatedHealth {
        let mut dependencies = vec![self.check_file_store().await];
        if let Some(shared) = self.check_shared_cache().await {
            dependencies.push(shared);
        }

        AggregatedHealth::new(
            env!("CARGO_PKG_VERSION").to_string(),
            self.start_time.elapsed().as_secs(),
            dependencies,
        )
    }

    /// Checks that the entry directory exists (creating it if needed) and that
    /// a file can be created and removed in it.
    pub async fn check_file_store(&self) -> DependencyHealth {
        let start = std::time::Instant::now();
        if let Err(e) = tokio::fs::create_dir_all(&self.data_dir).await {
            return DependencyHealth::unhealthy("file_store", format!("Cannot create {}: {}", self.data_dir.display(), e));
        }

        let probe = self
            .data_dir
            .join(format!(".health-{}.check", Uuid::new_v4().simple()));
        if let Err(e) = tokio::fs::write(&probe, b"ok").await {
            return DependencyHealth::unhealthy(
                "file_store",
                format!("{} is not writable: {}", self.data_dir.display(), e),
            );
        }
        if let Err(e) = tokio::fs::remove_file(&probe).await {
            return DependencyHealth::unhealthy("file_store", format!("Cannot remove {}: {}", probe.display(), e));
        }

        DependencyHealth::healthy("file_store", start.elapsed().as_secs_f64() * 1000.0)
    }

    /// Checks shared cache connectivity. `None` when no shared cache is configured.
    ///
    /// An unreachable cache is reported as degraded: requests still succeed on
    /// the file store.
    pub async fn check_shared_cache(&self) -> Option<DependencyHealth> {
        let client = self.shared_cache.as_ref()?;
        let name = format!("shared_cache:{}", client.name());
        let start = std::time::Instant::now();

        let conn = match client.connect().await {
            Ok(conn) => conn,
            Err(e) => return Some(DependencyHealth::degraded(name, format!("Connection failed: {}", e))),
        };

        let health = match tokio::time::timeout(Duration::from_secs(5), conn.ping()).await {
            Ok(Ok(())) => {
                let latency = start.elapsed().as_secs_f64() * 1000.0;
                if latency > 50.0 {
                    DependencyHealth {
                        name,
                        status: HealthStatus::Degraded,
                        latency_ms: Some(latency),
                        message: Some("High latency detected".to_string()),
                    }
                } else {
                    DependencyHealth::healthy(name, latency)
                }
            }
            Ok(Err(e)) => DependencyHealth::degraded(name, format!("PING failed: {}", e)),
            Err(_) => DependencyHealth::degraded(name, "PING timeout"),
        };
        Some(health)
    }

    /// Liveness check - returns true if the service is alive.
    pub fn is_alive(&self) -> bool {
        true
    }

    /// Ready when the file store is usable; the shared cache is optional.
    pub async fn is_ready(&self) -> bool {
        self.check_file_store().await.status.is_healthy()
    }

    /// Returns uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
