use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub application: ApplicationSettings,
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default)]
    pub idempotency: IdempotencySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationSettings {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

/// Shared cache connection. Without a url every instance runs on its own file store.
#[derive(Debug, Clone, Deserialize)]
pub struct RedisSettings {
    pub url: Option<String>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencySettings {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_deadline_ms")]
    pub poll_deadline_ms: u64,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_body_limit_bytes")]
    pub body_limit_bytes: usize,
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_deadline_ms: default_poll_deadline_ms(),
            data_dir: default_data_dir(),
            body_limit_bytes: default_body_limit_bytes(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
        }
    }
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_key_prefix() -> String {
    "library:idem".to_string()
}

fn default_ttl_seconds() -> u64 {
    6 * 60 * 60
}

fn default_poll_interval_ms() -> u64 {
    250
}

fn default_poll_deadline_ms() -> u64 {
    30_000
}

fn default_data_dir() -> String {
    "data/idempotency".to_string()
}

fn default_body_limit_bytes() -> usize {
    1024 * 1024
}

fn default_cleanup_interval_seconds() -> u64 {
    15 * 60
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }
}
