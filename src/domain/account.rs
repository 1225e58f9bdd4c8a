//! Account domain types.
//!
//! An [`EmailAccount`] is the identity of one mailbox connection. Accounts are
//! provisioned elsewhere; the sync engine only reads them and updates their
//! sync bookkeeping (status, last sync, credentials, cursors).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AccountId;

/// A mailbox connection as seen by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAccount {
    /// Unique identifier for this account.
    pub id: AccountId,
    /// Mailbox address. Native providers identify push notifications by it.
    pub email: String,
    /// Native provider behind this mailbox.
    pub provider: ProviderKind,
    /// Administrative status.
    pub status: AccountStatus,
    /// Status of the most recent sync run.
    pub sync_status: SyncStatus,
    /// Encrypted credential material.
    pub credentials: Credentials,
    /// Grant id on the unified multi-provider service, if connected through it.
    pub foreign_id: Option<String>,
    /// Per-account sync configuration.
    pub sync_config: SyncConfig,
    /// When the last successful sync finished.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Error message of the last failed sync.
    pub last_error: Option<String>,
    /// Native history pointer used for push-driven incremental changes.
    pub sync_cursor: Option<String>,
    /// Active push subscription, if real-time sync is enabled.
    pub push_subscription: Option<PushSubscription>,
}

impl EmailAccount {
    /// Creates an active, idle account with empty credentials.
    pub fn new(id: impl Into<AccountId>, email: impl Into<String>, provider: ProviderKind) -> Self {
        Self {
            id: id.into(),
            email: email.into(),
            provider,
            status: AccountStatus::Active,
            sync_status: SyncStatus::Idle,
            credentials: Credentials::default(),
            foreign_id: None,
            sync_config: SyncConfig::default(),
            last_sync_at: None,
            last_error: None,
            sync_cursor: None,
            push_subscription: None,
        }
    }

    /// Sets the unified-provider grant id.
    pub fn with_foreign_id(mut self, foreign_id: impl Into<String>) -> Self {
        self.foreign_id = Some(foreign_id.into());
        self
    }

    /// Sets the credential material.
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Returns whether the account may be synced.
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }
}

/// Kind of mail provider, also used to key the adapter registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Gmail-style REST API with OAuth 2.0.
    GmailLike,
    /// Unified multi-provider REST API.
    Unified,
    /// Microsoft Exchange.
    Exchange,
    /// Standard IMAP.
    Imap,
}

impl ProviderKind {
    /// Stable lowercase name used in storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GmailLike => "gmail_like",
            ProviderKind::Unified => "unified",
            ProviderKind::Exchange => "exchange",
            ProviderKind::Imap => "imap",
        }
    }

    /// Parses the name produced by [`as_str`](Self::as_str).
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "gmail_like" => Some(ProviderKind::GmailLike),
            "unified" => Some(ProviderKind::Unified),
            "exchange" => Some(ProviderKind::Exchange),
            "imap" => Some(ProviderKind::Imap),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Administrative status of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Inactive,
    Error,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::Inactive => "inactive",
            AccountStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(AccountStatus::Active),
            "inactive" => Some(AccountStatus::Inactive),
            "error" => Some(AccountStatus::Error),
            _ => None,
        }
    }
}

/// Status of the sync machinery for an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// No run in progress.
    Idle,
    /// A run is in progress.
    Syncing,
    /// The last run failed.
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(SyncStatus::Idle),
            "syncing" => Some(SyncStatus::Syncing),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

/// Encrypted OAuth material.
///
/// Token fields hold ciphertext produced by a
/// [`CredentialCodec`](crate::storage::CredentialCodec); the engine never
/// persists plaintext tokens.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    /// Encrypted access token.
    pub access_token: Option<String>,
    /// Encrypted refresh token.
    pub refresh_token: Option<String>,
    /// Access token expiry.
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// Returns true when the access token is missing or expires within `skew`.
    pub fn needs_refresh(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        match (&self.access_token, self.expires_at) {
            (None, _) => true,
            (Some(_), Some(expires_at)) => expires_at <= now + skew,
            (Some(_), None) => false,
        }
    }
}

/// Per-account sync configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Upper bound on messages fetched per run.
    pub max_emails: u32,
    /// Folder/label to restrict fetching to.
    pub folder_scope: Option<String>,
    /// Whether runs default to full rather than incremental.
    pub full_sync: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_emails: 100,
            folder_scope: None,
            full_sync: false,
        }
    }
}

/// A provisioned push subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushSubscription {
    /// Provider-assigned subscription id.
    pub subscription_id: String,
    /// Subscription state as reported by the provider.
    pub status: PushStatus,
    /// When the provider will expire the subscription, if it does.
    pub expires_at: Option<DateTime<Utc>>,
    /// History pointer returned at registration time (native providers).
    pub cursor: Option<String>,
}

/// Push subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PushStatus {
    Active,
    Pending,
    Failing,
}
