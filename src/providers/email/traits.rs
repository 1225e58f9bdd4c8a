//! Provider adapter trait definition.
//!
//! This module defines the [`ProviderAdapter`] trait which abstracts over the
//! remote mail services the engine syncs with (a Gmail-like REST API, a
//! unified multi-provider API, and native Exchange/IMAP backends). Adapters
//! translate provider-native messages into the canonical
//! [`EmailMessage`](crate::domain::EmailMessage).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    Address, EmailAccount, EmailMessage, MessageId, ProviderKind, PushSubscription, ThreadId,
    TrackedFields,
};

/// Result type alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Errors that can occur during provider operations.
///
/// Cloneable so one failed run can be reported to every waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Credentials are missing, invalid or could not be refreshed.
    #[error("authentication failed: {0}")]
    AuthFailed(String),

    /// Rate limit exceeded.
    #[error("rate limit exceeded, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        /// Seconds to wait before retrying, if known.
        retry_after_secs: Option<u64>,
    },

    /// Daily or project quota exhausted.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Network or connection error.
    #[error("connection error: {0}")]
    Connection(String),

    /// The request did not complete within the configured timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid request or parameters.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The adapter does not implement the operation.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// Provider-specific error.
    #[error("provider error: {0}")]
    Provider(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ProviderError {
    /// Maps a transport error, keeping timeouts distinguishable.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else {
            ProviderError::Connection(err.to_string())
        }
    }

    /// Errors that invalidate the whole run rather than a single message.
    pub fn is_fatal_for_batch(&self) -> bool {
        matches!(
            self,
            ProviderError::AuthFailed(_)
                | ProviderError::RateLimited { .. }
                | ProviderError::QuotaExceeded(_)
        )
    }
}

/// Parameters of a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Upper bound on messages returned.
    pub max_emails: u32,
    /// Folder/label to restrict to.
    pub folder_scope: Option<String>,
    /// Ignore `since` and fetch from the top of the mailbox.
    pub full_sync: bool,
    /// Only messages received after this instant (incremental runs).
    pub since: Option<DateTime<Utc>>,
}

impl FetchOptions {
    /// Options for a full fetch of up to `max_emails` messages.
    pub fn full(max_emails: u32) -> Self {
        Self {
            max_emails,
            folder_scope: None,
            full_sync: true,
            since: None,
        }
    }
}

/// A message that was listed but could not be retrieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchFailure {
    pub message_id: MessageId,
    pub error: ProviderError,
}

/// Result of a fetch: translated messages plus isolated per-message failures.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchBatch {
    pub messages: Vec<EmailMessage>,
    pub failures: Vec<FetchFailure>,
}

impl FetchBatch {
    /// Number of listed messages, successful or not.
    pub fn len(&self) -> usize {
        self.messages.len() + self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An email to be sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutgoingEmail {
    /// Recipient addresses.
    pub to: Vec<Address>,
    /// CC addresses.
    pub cc: Vec<Address>,
    /// BCC addresses.
    pub bcc: Vec<Address>,
    /// Email subject.
    pub subject: String,
    /// Plain text body.
    pub body_text: String,
    /// HTML body (optional).
    pub body_html: Option<String>,
    /// Thread ID if this is a reply.
    pub in_reply_to_thread: Option<ThreadId>,
    /// Provider id of the message being replied to.
    pub in_reply_to_message: Option<MessageId>,
}

/// Identifiers the provider assigned to a sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SentMessage {
    pub message_id: MessageId,
    pub thread_id: Option<ThreadId>,
}

/// Kind of remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaChange {
    Created,
    Updated,
    Deleted,
}

/// A single remote change, decoded from a webhook or a history feed.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteDelta {
    pub change: DeltaChange,
    /// Provider-native id of the affected message.
    pub message_id: MessageId,
    /// Canonical message, when the notification carried it.
    pub message: Option<EmailMessage>,
}

impl RemoteDelta {
    pub fn deleted(message_id: impl Into<MessageId>) -> Self {
        Self {
            change: DeltaChange::Deleted,
            message_id: message_id.into(),
            message: None,
        }
    }
}

/// Changes returned by a native history feed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryBatch {
    pub deltas: Vec<RemoteDelta>,
    /// Pointer to resume from next time.
    pub cursor: Option<String>,
}

/// Trait for remote mail service adapters.
///
/// Adapters are stateless with respect to accounts: every call receives the
/// account it acts for. Token refresh side effects go through the account
/// store the adapter was built with.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Returns the kind of provider this adapter talks to.
    fn kind(&self) -> ProviderKind;

    /// Whether the adapter performs real work. Placeholder adapters return
    /// empty results and report `false`.
    fn is_implemented(&self) -> bool {
        true
    }

    /// Fetches up to `options.max_emails` messages, paging internally.
    ///
    /// Messages that were listed but failed to download are reported in
    /// [`FetchBatch::failures`] instead of failing the call.
    async fn fetch(&self, account: &EmailAccount, options: &FetchOptions) -> Result<FetchBatch>;

    /// Fetches a single message.
    async fn fetch_message(
        &self,
        account: &EmailAccount,
        message_id: &MessageId,
    ) -> Result<EmailMessage>;

    /// Sends an email.
    async fn send(&self, account: &EmailAccount, email: &OutgoingEmail) -> Result<SentMessage>;

    /// Registers a push subscription that delivers to `callback_url`.
    async fn setup_push(
        &self,
        account: &EmailAccount,
        callback_url: &str,
    ) -> Result<PushSubscription>;

    /// Removes the account's push subscription.
    async fn teardown_push(&self, account: &EmailAccount) -> Result<()>;

    /// Downloads attachment bytes.
    async fn download_attachment(
        &self,
        account: &EmailAccount,
        message_id: &MessageId,
        attachment_id: &str,
    ) -> Result<Vec<u8>>;

    /// Writes the tracked fields of a message back to the provider.
    ///
    /// `current` is the provider's last known state, used to compute the
    /// minimal change.
    async fn push_state(
        &self,
        account: &EmailAccount,
        message_id: &MessageId,
        desired: &TrackedFields,
        current: &TrackedFields,
    ) -> Result<()>;

    /// Lists changes since a native history pointer.
    async fn history_since(&self, _account: &EmailAccount, _cursor: &str) -> Result<HistoryBatch> {
        Err(ProviderError::Unsupported(format!(
            "{} has no history feed",
            self.kind()
        )))
    }
}
