use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::auth::StaticTokenVerifier;
use crate::notify::QueueSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse '{value}'")]
    Invalid { var: &'static str, value: String },
    #[error("DISPATCH_API_TOKENS: {0}")]
    Tokens(String),
}

/// Process configuration. Every field has a default; `DISPATCH_*`
/// environment variables override them, and a `.env` file is read first
/// if present.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// Appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub notify: QueueSettings,
    /// `token:subject:role` entries, comma separated.
    pub api_tokens: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(30),
            notify: QueueSettings::default(),
            api_tokens: String::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is normal.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let d = Self::default();
        let get = |var: &'static str| lookup(var).filter(|v| !v.trim().is_empty());

        Ok(Self {
            bind: get("DISPATCH_BIND").unwrap_or(d.bind),
            port: parse(&get, "DISPATCH_PORT")?.unwrap_or(d.port),
            data_dir: get("DISPATCH_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            metrics_port: parse(&get, "DISPATCH_METRICS_PORT")?.or(d.metrics_port),
            compact_threshold: parse(&get, "DISPATCH_COMPACT_THRESHOLD")?.unwrap_or(d.compact_threshold),
            compact_interval: parse(&get, "DISPATCH_COMPACT_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(d.compact_interval),
            notify: QueueSettings {
                workers: parse(&get, "DISPATCH_NOTIFY_WORKERS")?.unwrap_or(d.notify.workers),
                capacity: parse(&get, "DISPATCH_NOTIFY_QUEUE_CAPACITY")?.unwrap_or(d.notify.capacity),
                max_attempts: parse(&get, "DISPATCH_NOTIFY_MAX_ATTEMPTS")?.unwrap_or(d.notify.max_attempts),
                base_backoff: parse(&get, "DISPATCH_NOTIFY_BACKOFF_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(d.notify.base_backoff),
                attempt_timeout: parse(&get, "DISPATCH_NOTIFY_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(d.notify.attempt_timeout),
                sender: get("DISPATCH_MAIL_SENDER").unwrap_or(d.notify.sender),
            },
            api_tokens: get("DISPATCH_API_TOKENS").unwrap_or(d.api_tokens),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("dispatch.wal")
    }

    pub fn outbox_path(&self) -> PathBuf {
        self.data_dir.join("notifications.wal")
    }

    pub fn token_verifier(&self) -> Result<StaticTokenVerifier, ConfigError> {
        StaticTokenVerifier::parse(&self.api_tokens).map_err(ConfigError::Tokens)
    }
}

fn parse<T: FromStr>(
    get: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(var)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { var, value })
        })
        .transpose()
}
