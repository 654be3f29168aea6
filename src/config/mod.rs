//! Typed configuration from environment variables or a TOML file.
//!
//! Loads once at startup, fails fast if required values are missing or
//! malformed. The Redis URL is wrapped in `secrecy::SecretString` so it
//! never ends up in logs.

pub mod secrets;

use crate::error::{Error, Result};
use crate::fetch::FetchOptions;
use crate::keys::{DEFAULT_CHANNEL, DEFAULT_PREFIX};
use crate::transaction::DEFAULT_COMMIT_ATTEMPTS;
use crate::watcher::WatcherOptions;
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Settings for one storage instance.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Prefix for every key.
    pub prefix: String,
    /// Pub/sub channel for work-available signals.
    pub channel: String,
    /// Attempts per transaction commit before giving up.
    pub commit_attempts: u32,
    pub fetch: FetchOptions,
    pub watcher: WatcherOptions,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            channel: DEFAULT_CHANNEL.to_string(),
            commit_attempts: DEFAULT_COMMIT_ATTEMPTS,
            fetch: FetchOptions::default(),
            watcher: WatcherOptions::default(),
        }
    }
}

#[derive(Debug)]
pub struct Config {
    pub redis_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub storage: StorageOptions,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = StorageOptions::default();
        let secs = |name: &str, default: Duration| -> Result<Duration> {
            match lookup(name) {
                Some(raw) => parse_secs(name, &raw).map(Duration::from_secs),
                None => Ok(default),
            }
        };

        let poll_interval = match lookup("LEASEQ_POLL_INTERVAL_SECS") {
            Some(raw) => match parse_secs("LEASEQ_POLL_INTERVAL_SECS", &raw)? {
                0 => None,
                n => Some(Duration::from_secs(n)),
            },
            None => defaults.fetch.poll_interval,
        };
        let commit_attempts = match lookup("LEASEQ_COMMIT_ATTEMPTS") {
            Some(raw) => raw.trim().parse::<u32>().map_err(|_| {
                Error::Config(format!("LEASEQ_COMMIT_ATTEMPTS must be a whole number, got {raw:?}"))
            })?,
            None => defaults.commit_attempts,
        };

        let watcher = WatcherOptions {
            invisibility_timeout: secs(
                "LEASEQ_INVISIBILITY_TIMEOUT_SECS",
                defaults.watcher.invisibility_timeout,
            )?,
            checked_timeout: secs("LEASEQ_CHECKED_TIMEOUT_SECS", defaults.watcher.checked_timeout)?,
            lock_timeout: secs("LEASEQ_WATCH_LOCK_TIMEOUT_SECS", defaults.watcher.lock_timeout)?,
            sleep_interval: secs("LEASEQ_WATCH_INTERVAL_SECS", defaults.watcher.sleep_interval)?,
        };

        Ok(Self {
            redis_url: SecretString::from(required(&lookup, "REDIS_URL")?),
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            storage: StorageOptions {
                prefix: lookup("LEASEQ_PREFIX").unwrap_or(defaults.prefix),
                channel: lookup("LEASEQ_CHANNEL").unwrap_or(defaults.channel),
                commit_attempts,
                fetch: FetchOptions { poll_interval },
                watcher,
            },
        })
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| Error::Config(format!("bad config file {}: {e}", path.display())))
    }

    /// Parse configuration from TOML text.
    ///
    /// ```toml
    /// log_level = "debug"
    ///
    /// [storage]
    /// redis_url = "redis://127.0.0.1:6379"
    /// prefix = "hangfire:"
    ///
    /// [watcher]
    /// invisibility_timeout_secs = 1800
    /// ```
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile =
            toml::from_str(content).map_err(|e| Error::Config(format!("invalid TOML: {e}")))?;
        let defaults = StorageOptions::default();
        let storage = file.storage;
        let watcher = file.watcher.unwrap_or_default();

        let secs_or = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };
        let poll_interval = match storage.poll_interval_secs {
            Some(0) => None,
            Some(n) => Some(Duration::from_secs(n)),
            None => defaults.fetch.poll_interval,
        };

        Ok(Self {
            redis_url: SecretString::from(storage.redis_url),
            otel_endpoint: file.otel_endpoint,
            log_level: file.log_level.unwrap_or_else(|| "info".to_string()),
            storage: StorageOptions {
                prefix: storage.prefix.unwrap_or(defaults.prefix),
                channel: storage.channel.unwrap_or(defaults.channel),
                commit_attempts: storage.commit_attempts.unwrap_or(defaults.commit_attempts),
                fetch: FetchOptions { poll_interval },
                watcher: WatcherOptions {
                    invisibility_timeout: secs_or(
                        watcher.invisibility_timeout_secs,
                        defaults.watcher.invisibility_timeout,
                    ),
                    checked_timeout: secs_or(
                        watcher.checked_timeout_secs,
                        defaults.watcher.checked_timeout,
                    ),
                    lock_timeout: secs_or(watcher.lock_timeout_secs, defaults.watcher.lock_timeout),
                    sleep_interval: secs_or(watcher.interval_secs, defaults.watcher.sleep_interval),
                },
            },
        })
    }
}

/// Top-level TOML layout.
#[derive(Debug, Deserialize)]
struct ConfigFile {
    log_level: Option<String>,
    otel_endpoint: Option<String>,
    storage: StorageSection,
    watcher: Option<WatcherSection>,
}

#[derive(Debug, Deserialize)]
struct StorageSection {
    redis_url: String,
    prefix: Option<String>,
    channel: Option<String>,
    commit_attempts: Option<u32>,
    poll_interval_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct WatcherSection {
    invisibility_timeout_secs: Option<u64>,
    checked_timeout_secs: Option<u64>,
    lock_timeout_secs: Option<u64>,
    interval_secs: Option<u64>,
}

fn required<F>(lookup: &F, name: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .ok_or_else(|| Error::Config(format!("required environment variable {name} is not set")))
}

fn parse_secs(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("{name} must be a whole number of seconds, got {raw:?}")))
}
