//! Storage collaborators.
//!
//! The sync engine never talks to a database directly. It depends on the
//! store traits defined here:
//!
//! - [`AccountStore`] - account lookup and sync bookkeeping
//! - [`MessageStore`] - the local message replica
//! - [`SyncLogStore`] - the per-run audit trail
//! - [`ConflictStore`] - recorded sync conflicts
//! - [`CredentialCodec`] - encryption of tokens at rest
//!
//! Two implementations ship with the crate: [`MemoryStore`] for tests and
//! embedding, and the SQLite-backed [`Database`].

mod credentials;
mod database;
mod memory;
pub mod queries;
mod schema;

pub use credentials::{AesGcmCodec, CodecError, CredentialCodec};
pub use database::{Database, DatabaseError};
pub use memory::MemoryStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::{
    AccountId, ConflictId, ConflictStatus, Credentials, EmailAccount, EmailMessage,
    LocalMessageId, MessageId, ProviderKind, PushSubscription, StoredMessage, SyncConflict,
    SyncCounters, SyncLog, SyncLogId, SyncLogStatus, SyncStatus, SyncType, TrackedFields,
};

/// Errors reported by store implementations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The addressed record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A record with the same key already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The backend failed.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Changes written to an existing message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageUpdate {
    /// New tracked field values.
    pub fields: TrackedFields,
    /// New last-synced snapshot; `None` leaves the stored snapshot unchanged.
    pub synced_fields: Option<TrackedFields>,
}

impl MessageUpdate {
    /// An update that came from the provider: fields and snapshot agree.
    pub fn synced(fields: TrackedFields) -> Self {
        Self {
            synced_fields: Some(fields.clone()),
            fields,
        }
    }

    /// A local edit that has not reached the provider yet.
    pub fn local(fields: TrackedFields) -> Self {
        Self {
            fields,
            synced_fields: None,
        }
    }
}

/// Account lookup and sync bookkeeping.
#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Gets an account by ID.
    async fn get_account(&self, id: &AccountId) -> StoreResult<Option<EmailAccount>>;

    /// Finds the account a provider refers to in push notifications.
    ///
    /// For [`ProviderKind::Unified`] `identity` is the grant id
    /// ([`EmailAccount::foreign_id`]); for native providers it is the mailbox
    /// address.
    async fn find_by_provider_identity(
        &self,
        kind: ProviderKind,
        identity: &str,
    ) -> StoreResult<Option<EmailAccount>>;

    /// Sets the sync status and last error.
    async fn update_account_status(
        &self,
        id: &AccountId,
        status: SyncStatus,
        last_error: Option<String>,
    ) -> StoreResult<()>;

    /// Stamps the last successful sync time.
    async fn update_last_sync(&self, id: &AccountId, at: DateTime<Utc>) -> StoreResult<()>;

    /// Replaces the encrypted credential material.
    async fn update_credentials(&self, id: &AccountId, credentials: Credentials)
        -> StoreResult<()>;

    /// Replaces the native history cursor.
    async fn update_sync_cursor(&self, id: &AccountId, cursor: Option<String>) -> StoreResult<()>;

    /// Replaces the push subscription.
    async fn update_push_subscription(
        &self,
        id: &AccountId,
        subscription: Option<PushSubscription>,
    ) -> StoreResult<()>;
}

/// The local message replica.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Finds a message by its provider-native id.
    async fn find_by_external_id(
        &self,
        account_id: &AccountId,
        external_id: &MessageId,
    ) -> StoreResult<Option<StoredMessage>>;

    /// Inserts a message; its tracked fields become the synced snapshot.
    async fn create_message(
        &self,
        account_id: &AccountId,
        message: &EmailMessage,
    ) -> StoreResult<LocalMessageId>;

    /// Writes tracked fields (and optionally the snapshot) of a message.
    async fn update_message(&self, id: &LocalMessageId, update: &MessageUpdate)
        -> StoreResult<()>;

    /// Deletes messages with the given external id. Returns how many were removed.
    async fn delete_messages(
        &self,
        account_id: &AccountId,
        external_id: &MessageId,
    ) -> StoreResult<u32>;
}

/// Per-run audit trail.
#[async_trait]
pub trait SyncLogStore: Send + Sync {
    /// Creates a log in the `Started` state.
    async fn create_log(&self, account_id: &AccountId, sync_type: SyncType)
        -> StoreResult<SyncLogId>;

    /// Finalizes a log with its outcome.
    async fn finalize_log(
        &self,
        id: &SyncLogId,
        status: SyncLogStatus,
        counters: &SyncCounters,
        error: Option<String>,
    ) -> StoreResult<()>;

    /// Gets a log by ID.
    async fn get_log(&self, id: &SyncLogId) -> StoreResult<Option<SyncLog>>;
}

/// Recorded sync conflicts.
#[async_trait]
pub trait ConflictStore: Send + Sync {
    /// Persists a newly detected conflict.
    async fn save_conflict(&self, conflict: &SyncConflict) -> StoreResult<()>;

    /// Gets a conflict by ID.
    async fn get_conflict(&self, id: &ConflictId) -> StoreResult<Option<SyncConflict>>;

    /// Lists conflicts of an account, optionally filtered by status.
    async fn list_conflicts(
        &self,
        account_id: &AccountId,
        status: Option<ConflictStatus>,
    ) -> StoreResult<Vec<SyncConflict>>;

    /// Replaces a stored conflict (status and resolution changes).
    async fn update_conflict(&self, conflict: &SyncConflict) -> StoreResult<()>;

    /// Finds the pending conflict recorded for a message, if any.
    async fn find_pending(
        &self,
        account_id: &AccountId,
        external_id: &MessageId,
    ) -> StoreResult<Option<SyncConflict>>;
}

/// The store handles the engine is built from.
#[derive(Clone)]
pub struct Stores {
    pub accounts: Arc<dyn AccountStore>,
    pub messages: Arc<dyn MessageStore>,
    pub logs: Arc<dyn SyncLogStore>,
    pub conflicts: Arc<dyn ConflictStore>,
}

impl Stores {
    /// Uses one backend for every store.
    pub fn single<S>(store: Arc<S>) -> Self
    where
        S: AccountStore + MessageStore + SyncLogStore + ConflictStore + 'static,
    {
        Self {
            accounts: store.clone(),
            messages: store.clone(),
            logs: store.clone(),
            conflicts: store,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::label_set;

    #[test]
    fn synced_update_sets_snapshot() {
        let fields = TrackedFields {
            subject: "s".into(),
            is_read: true,
            is_starred: false,
            labels: label_set(["INBOX"]),
        };
        let update = MessageUpdate::synced(fields.clone());
        assert_eq!(update.synced_fields, Some(fields.clone()));

        let local = MessageUpdate::local(fields);
        assert!(local.synced_fields.is_none());
    }

    #[test]
    fn store_error_display() {
        let err = StoreError::NotFound("message m1".into());
        assert_eq!(err.to_string(), "not found: message m1");
    }
}
