//! Engine settings and configuration types.
//!
//! Settings are persisted to `settings.json` in the platform config directory
//! (`~/.config/mailsync/` or equivalent) and loaded once at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ResolutionPolicy;

/// Errors loading or saving settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not determine the configuration directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid settings file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Top-level engine settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Orchestration and reconciliation.
    pub sync: SyncSettings,
    /// Gmail-like provider.
    pub gmail: GmailSettings,
    /// Unified multi-provider service.
    pub unified: UnifiedSettings,
    /// Push notification delivery.
    pub push: PushSettings,
    /// Local storage.
    pub storage: StorageSettings,
}

impl Settings {
    /// Default location of the settings file.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let dirs = directories::ProjectDirs::from("dev", "mailsync", "mailsync")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("settings.json"))
    }

    /// Loads settings from `path`; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "settings file missing, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Loads settings from [`default_path`](Self::default_path).
    pub fn load_default() -> Result<Self, ConfigError> {
        Self::load(Self::default_path()?)
    }

    /// Writes settings as pretty JSON, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Upper bound on messages fetched in one run, whatever the account asks for.
    pub max_emails_per_sync: u32,
    /// Retries after a rate-limited fetch.
    pub max_retries: u32,
    /// Base backoff delay in seconds when the provider gives no Retry-After.
    pub retry_delay_secs: u64,
    /// Ceiling on any single backoff, including provider Retry-After hints.
    pub max_retry_delay_secs: u64,
    /// Messages reconciled concurrently.
    pub reconcile_concurrency: usize,
    /// Route every account through the unified service.
    pub prefer_unified: bool,
    /// Run the three-way conflict check during reconciliation.
    pub detect_conflicts: bool,
    /// Policy applied to conflicts as soon as they are detected.
    pub default_conflict_policy: Option<ResolutionPolicy>,
    /// Fail runs routed to native adapters that are not implemented.
    pub strict_native_adapters: bool,
}

impl SyncSettings {
    /// Base backoff delay.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Longest single backoff.
    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }

    /// Delay before retry number `attempt` (zero-based).
    ///
    /// A provider hint wins over the exponential schedule; both are capped
    /// at [`max_retry_delay`](Self::max_retry_delay).
    pub fn backoff(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        retry_after_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| {
                self.retry_delay()
                    .saturating_mul(2u32.saturating_pow(attempt))
            })
            .min(self.max_retry_delay())
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_emails_per_sync: 500,
            max_retries: 3,
            retry_delay_secs: 30,
            max_retry_delay_secs: 300,
            reconcile_concurrency: 8,
            prefer_unified: false,
            detect_conflicts: true,
            default_conflict_policy: None,
            strict_native_adapters: false,
        }
    }
}

/// Gmail-like REST API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GmailSettings {
    /// API root, e.g. `https://gmail.googleapis.com/gmail/v1`.
    pub api_base: String,
    /// OAuth 2.0 token endpoint.
    pub token_url: String,
    /// OAuth client id.
    pub client_id: String,
    /// OAuth client secret.
    pub client_secret: String,
    /// Messages requested per list call (the API caps this at 500).
    pub page_size: u32,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Pub/Sub topic that receives mailbox change notifications.
    pub pubsub_topic: Option<String>,
}

impl GmailSettings {
    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for GmailSettings {
    fn default() -> Self {
        Self {
            api_base: "https://gmail.googleapis.com/gmail/v1".to_string(),
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            page_size: 500,
            request_timeout_secs: 30,
            pubsub_topic: None,
        }
    }
}

/// Unified multi-provider API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UnifiedSettings {
    /// API root, e.g. `https://api.us.nylas.com/v3`.
    pub api_base: String,
    /// Application API key.
    pub api_key: String,
    /// Messages requested per list call (the API caps this at 200).
    pub page_size: u32,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl UnifiedSettings {
    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for UnifiedSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.us.nylas.com/v3".to_string(),
            api_key: String::new(),
            page_size: 200,
            request_timeout_secs: 30,
        }
    }
}

/// Push delivery settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PushSettings {
    /// Public URL that receives webhook deliveries.
    pub callback_url: Option<String>,
}

/// Local storage settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite database file. Defaults to `mailsync.db` in the data directory.
    pub database_path: Option<PathBuf>,
    /// Hex-encoded 32-byte key for credential encryption.
    pub credential_key: Option<String>,
}

impl StorageSettings {
    /// Resolves the database path, falling back to the platform data dir.
    pub fn resolved_database_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.database_path {
            return Ok(path.clone());
        }
        let dirs = directories::ProjectDirs::from("dev", "mailsync", "mailsync")
            .ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.data_dir().join("mailsync.db"))
    }
}
