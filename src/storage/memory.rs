//! In-memory store.
//!
//! Implements every store trait over `tokio::sync::RwLock`-protected maps.
//! Used by tests and by hosts that keep their replica elsewhere.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    AccountStore, ConflictStore, MessageStore, MessageUpdate, StoreError, StoreResult,
    SyncLogStore,
};
use crate::domain::{
    AccountId, ConflictId, ConflictStatus, Credentials, EmailAccount, EmailMessage,
    LocalMessageId, MessageId, ProviderKind, PushSubscription, StoredMessage, SyncConflict,
    SyncCounters, SyncLog, SyncLogId, SyncLogStatus, SyncStatus, SyncType,
};

/// Store that keeps everything in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    accounts: RwLock<HashMap<AccountId, EmailAccount>>,
    messages: RwLock<HashMap<LocalMessageId, StoredMessage>>,
    logs: RwLock<HashMap<SyncLogId, SyncLog>>,
    conflicts: RwLock<HashMap<ConflictId, SyncConflict>>,
    credential_writes: RwLock<HashMap<AccountId, u32>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces an account.
    pub async fn insert_account(&self, account: EmailAccount) {
        self.accounts
            .write()
            .await
            .insert(account.id.clone(), account);
    }

    /// Returns all messages of an account.
    pub async fn messages_for(&self, account_id: &AccountId) -> Vec<StoredMessage> {
        self.messages
            .read()
            .await
            .values()
            .filter(|m| &m.account_id == account_id)
            .cloned()
            .collect()
    }

    /// Returns all sync logs of an account, oldest first.
    pub async fn logs_for(&self, account_id: &AccountId) -> Vec<SyncLog> {
        let mut logs: Vec<SyncLog> = self
            .logs
            .read()
            .await
            .values()
            .filter(|l| &l.account_id == account_id)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.started_at);
        logs
    }

    /// Number of times credentials were written for an account.
    pub async fn credential_writes(&self, account_id: &AccountId) -> u32 {
        self.credential_writes
            .read()
            .await
            .get(account_id)
            .copied()
            .unwrap_or(0)
    }

    async fn with_account<F>(&self, id: &AccountId, f: F) -> StoreResult<()>
    where
        F: FnOnce(&mut EmailAccount),
    {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("account {id}")))?;
        f(account);
        Ok(())
    }
}

#[async_trait]
impl AccountStore for MemoryStore {
    async fn get_account(&self, id: &AccountId) -> StoreResult<Option<EmailAccount>> {
        Ok(self.accounts.read().await.get(id).cloned())
    }

    async fn find_by_provider_identity(
        &self,
        kind: ProviderKind,
        identity: &str,
    ) -> StoreResult<Option<EmailAccount>> {
        let accounts = self.accounts.read().await;
        let found = accounts.values().find(|a| match kind {
            ProviderKind::Unified => a.foreign_id.as_deref() == Some(identity),
            _ => a.provider == kind && a.email.eq_ignore_ascii_case(identity),
        });
        Ok(found.cloned())
    }

    async fn update_account_status(
        &self,
        id: &AccountId,
        status: SyncStatus,
        last_error: Option<String>,
    ) -> StoreResult<()> {
        self.with_account(id, |a| {
            a.sync_status = status;
            a.last_error = last_error;
        })
        .await
    }

    async fn update_last_sync(&self, id: &AccountId, at: DateTime<Utc>) -> StoreResult<()> {
        self.with_account(id, |a| a.last_sync_at = Some(at)).await
    }

    async fn update_credentials(
        &self,
        id: &AccountId,
        credentials: Credentials,
    ) -> StoreResult<()> {
        self.with_account(id, |a| a.credentials = credentials)
            .await?;
        *self
            .credential_writes
            .write()
            .await
            .entry(id.clone())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn update_sync_cursor(&self, id: &AccountId, cursor: Option<String>) -> StoreResult<()> {
        self.with_account(id, |a| a.sync_cursor = cursor).await
    }

    async fn update_push_subscription(
        &self,
        id: &AccountId,
        subscription: Option<PushSubscription>,
    ) -> StoreResult<()> {
        self.with_account(id, |a| a.push_subscription = subscription)
            .await
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn find_by_external_id(
        &self,
        account_id: &AccountId,
        external_id: &MessageId,
    ) -> StoreResult<Option<StoredMessage>> {
        let messages = self.messages.read().await;
        Ok(messages
            .values()
            .find(|m| &m.account_id == account_id && m.external_id() == external_id)
            .cloned())
    }

    async fn create_message(
        &self,
        account_id: &AccountId,
        message: &EmailMessage,
    ) -> StoreResult<LocalMessageId> {
        let mut messages = self.messages.write().await;
        if messages
            .values()
            .any(|m| &m.account_id == account_id && m.external_id() == &message.id)
        {
            return Err(StoreError::AlreadyExists(format!("message {}", message.id)));
        }

        let id = LocalMessageId::generate();
        messages.insert(
            id.clone(),
            StoredMessage {
                id: id.clone(),
                account_id: account_id.clone(),
                synced_fields: Some(message.tracked_fields()),
                message: message.clone(),
                updated_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn update_message(&self, id: &LocalMessageId, update: &MessageUpdate) -> StoreResult<()> {
        let mut messages = self.messages.write().await;
        let stored = messages
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("message {id}")))?;

        stored.message.apply_tracked_fields(&update.fields);
        if let Some(snapshot) = &update.synced_fields {
            stored.synced_fields = Some(snapshot.clone());
        }
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn delete_messages(
        &self,
        account_id: &AccountId,
        external_id: &MessageId,
    ) -> StoreResult<u32> {
        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|_, m| !(&m.account_id == account_id && m.external_id() == external_id));
        Ok((before - messages.len()) as u32)
    }
}

#[async_trait]
impl SyncLogStore for MemoryStore {
    async fn create_log(
        &self,
        account_id: &AccountId,
        sync_type: SyncType,
    ) -> StoreResult<SyncLogId> {
        let log = SyncLog::started(account_id.clone(), sync_type);
        let id = log.id.clone();
        self.logs.write().await.insert(id.clone(), log);
        Ok(id)
    }

    async fn finalize_log(
        &self,
        id: &SyncLogId,
        status: SyncLogStatus,
        counters: &SyncCounters,
        error: Option<String>,
    ) -> StoreResult<()> {
        let mut logs = self.logs.write().await;
        let log = logs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(format!("sync log {id}")))?;
        log.status = status;
        log.counters = *counters;
        log.error = error;
        log.finished_at = Some(Utc::now());
        Ok(())
    }

    async fn get_log(&self, id: &SyncLogId) -> StoreResult<Option<SyncLog>> {
        Ok(self.logs.read().await.get(id).cloned())
    }
}

#[async_trait]
impl ConflictStore for MemoryStore {
    async fn save_conflict(&self, conflict: &SyncConflict) -> StoreResult<()> {
        let mut conflicts = self.conflicts.write().await;
        if conflicts.contains_key(&conflict.id) {
            return Err(StoreError::AlreadyExists(format!("conflict {}", conflict.id)));
        }
        conflicts.insert(conflict.id.clone(), conflict.clone());
        Ok(())
    }

    async fn get_conflict(&self, id: &ConflictId) -> StoreResult<Option<SyncConflict>> {
        Ok(self.conflicts.read().await.get(id).cloned())
    }

    async fn list_conflicts(
        &self,
        account_id: &AccountId,
        status: Option<ConflictStatus>,
    ) -> StoreResult<Vec<SyncConflict>> {
        let mut conflicts: Vec<SyncConflict> = self
            .conflicts
            .read()
            .await
            .values()
            .filter(|c| &c.account_id == account_id)
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        conflicts.sort_by_key(|c| c.detected_at);
        Ok(conflicts)
    }

    async fn update_conflict(&self, conflict: &SyncConflict) -> StoreResult<()> {
        let mut conflicts = self.conflicts.write().await;
        match conflicts.get_mut(&conflict.id) {
            Some(existing) => {
                *existing = conflict.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("conflict {}", conflict.id))),
        }
    }

    async fn find_pending(
        &self,
        account_id: &AccountId,
        external_id: &MessageId,
    ) -> StoreResult<Option<SyncConflict>> {
        Ok(self
            .conflicts
            .read()
            .await
            .values()
            .find(|c| {
                &c.account_id == account_id
                    && c.local_email.external_id() == external_id
                    && c.is_pending()
            })
            .cloned())
    }
}
