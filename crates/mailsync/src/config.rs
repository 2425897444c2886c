//! Configuration loading for the sync core
//!
//! Settings are resolved in order of priority:
//! 1. An explicit JSON file passed by the caller
//! 2. `~/.config/mailsync/mailsync.json`
//! 3. Built-in defaults
//!
//! Environment variables are applied on top of whichever source was used.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config filename in the mailsync config directory
const CONFIG_FILE: &str = "mailsync.json";

/// Top-level settings for extraction and sync runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root for the database and attachment store
    pub data_dir: PathBuf,
    /// Size of the fetch/normalize worker pool
    pub workers: usize,
    pub page: PageConfig,
    /// Maximum messages per transport batch request
    pub batch_fetch_size: usize,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    /// Per-call network timeout
    pub request_timeout_secs: u64,
    /// Capacity of the progress event channel
    pub progress_capacity: usize,
    /// How long a progress or enrichment send may block before being dropped
    pub notify_timeout_ms: u64,
    pub gmail: GmailConfig,
    pub imap: ImapConfig,
    /// Minimum time between two scheduled syncs of the same scope
    pub min_sync_interval_secs: u64,
}

/// Adaptive page sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PageConfig {
    pub initial: usize,
    pub min: usize,
    pub max: usize,
    /// Clean pages required before the page size grows again
    pub grow_after: u32,
}

/// Backoff and attempt limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the current delay, in [0, 1]
    pub jitter: f64,
    pub max_auth_refreshes: u32,
}

/// Circuit breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive transient failures that open the circuit
    pub threshold: u32,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GmailConfig {
    pub base_url: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub folder: String,
    pub user: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: config::data_dir().unwrap_or_else(|| PathBuf::from(".mailsync")),
            workers: 4,
            page: PageConfig::default(),
            batch_fetch_size: 50,
            retry: RetryConfig::default(),
            breaker: BreakerConfig::default(),
            request_timeout_secs: 30,
            progress_capacity: 256,
            notify_timeout_ms: 250,
            gmail: GmailConfig::default(),
            imap: ImapConfig::default(),
            min_sync_interval_secs: 60,
        }
    }
}

impl Default for PageConfig {
    fn default() -> Self {
        Self {
            initial: 100,
            min: 1,
            max: 500,
            grow_after: 3,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 30_000,
            jitter: 0.5,
            max_auth_refreshes: 2,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 8,
            window_secs: 60,
        }
    }
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            base_url: "https://gmail.googleapis.com".to_string(),
            user_id: "me".to_string(),
        }
    }
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: "imap.gmail.com".to_string(),
            port: 993,
            folder: "INBOX".to_string(),
            user: String::new(),
        }
    }
}

impl SyncConfig {
    /// Load settings from the default config file, falling back to defaults
    pub fn load() -> Result<Self> {
        let config = if config::config_exists(CONFIG_FILE) {
            config::load_json(CONFIG_FILE)?
        } else {
            Self::default()
        };
        config.with_env_overrides().validated()
    }

    /// Load settings from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = config::load_json_file(path)?;
        config.with_env_overrides().validated()
    }

    /// Parse settings from a JSON string; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse config JSON")?;
        config.validated()
    }

    /// Write settings to the default config file
    pub fn save(&self) -> Result<()> {
        config::save_json(CONFIG_FILE, self)
    }

    /// Write settings to a specific JSON file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        config::save_json_file(path, self)
    }

    /// Apply environment variable overrides
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dir) = std::env::var("MAILSYNC_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(workers) = std::env::var("MAILSYNC_WORKERS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.workers = workers;
        }
        if let Ok(host) = std::env::var("MAILSYNC_IMAP_HOST") {
            self.imap.host = host;
        }
        if let Ok(user) = std::env::var("MAILSYNC_IMAP_USER") {
            self.imap.user = user;
        }
        self
    }

    /// Clamp values into their usable ranges
    fn validated(mut self) -> Result<Self> {
        anyhow::ensure!(self.workers > 0, "workers must be at least 1");
        anyhow::ensure!(
            self.retry.max_attempts > 0,
            "retry.max_attempts must be at least 1"
        );
        self.page.min = self.page.min.max(1);
        self.page.max = self.page.max.max(self.page.min);
        self.page.initial = self.page.initial.clamp(self.page.min, self.page.max);
        self.batch_fetch_size = self.batch_fetch_size.max(1);
        self.retry.jitter = self.retry.jitter.clamp(0.0, 1.0);
        self.progress_capacity = self.progress_capacity.max(1);
        Ok(self)
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("mailsync.sqlite")
    }

    pub fn attachments_path(&self) -> PathBuf {
        self.data_dir.join("attachments")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }

    pub fn min_sync_interval(&self) -> Duration {
        Duration::from_secs(self.min_sync_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{
            "workers": 8,
            "page": { "initial": 25 },
            "imap": { "host": "mail.example.com", "user": "me@example.com" }
        }"#;

        let config = SyncConfig::from_json(json).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.page.initial, 25);
        assert_eq!(config.page.max, 500);
        assert_eq!(config.imap.host, "mail.example.com");
        assert_eq!(config.imap.port, 993);
        assert_eq!(config.retry.max_attempts, 5);
    }

    #[test]
    fn test_values_are_clamped() {
        let json = r#"{
            "page": { "initial": 1000, "min": 0, "max": 200 },
            "retry": { "jitter": 4.0 },
            "batch_fetch_size": 0
        }"#;

        let config = SyncConfig::from_json(json).unwrap();
        assert_eq!(config.page.min, 1);
        assert_eq!(config.page.initial, 200);
        assert_eq!(config.retry.jitter, 1.0);
        assert_eq!(config.batch_fetch_size, 1);
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(SyncConfig::from_json(r#"{ "workers": 0 }"#).is_err());
    }

    #[test]
    fn test_invalid_json() {
        assert!(SyncConfig::from_json("{ not json").is_err());
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mailsync.json");
        let config = SyncConfig {
            workers: 3,
            min_sync_interval_secs: 900,
            ..SyncConfig::default()
        };

        config.save_to(&path).unwrap();
        let loaded = SyncConfig::from_json(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.workers, 3);
        assert_eq!(loaded.min_sync_interval(), Duration::from_secs(900));
    }

    #[test]
    fn test_derived_paths() {
        let config = SyncConfig {
            data_dir: PathBuf::from("/tmp/mailsync-test"),
            ..SyncConfig::default()
        };
        assert_eq!(
            config.database_path(),
            PathBuf::from("/tmp/mailsync-test/mailsync.sqlite")
        );
        assert_eq!(
            config.attachments_path(),
            PathBuf::from("/tmp/mailsync-test/attachments")
        );
    }
}
