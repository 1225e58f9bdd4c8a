//! Webhook ingestion.
//!
//! [`WebhookService::process_notification`] is the only entry point. It
//! never fails: malformed payloads and per-message failures are logged and
//! reflected in the returned [`WebhookOutcome`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::conflict_service::{ConflictError, ConflictService};
use crate::domain::{AccountId, ConflictType, EmailAccount, ProviderKind, ResolutionPolicy};
use crate::providers::email::{
    AdapterRegistry, DeltaChange, MalformedPayload, NativeNotice, ProviderAdapter, ProviderError,
    PushNotification, RemoteDelta, UnifiedDelta,
};
use crate::storage::{AccountStore, MessageStore, MessageUpdate, StoreError};

/// Errors raised while applying a notification.
#[derive(Debug, Clone, Error)]
pub enum WebhookError {
    /// The payload could not be decoded.
    #[error(transparent)]
    MalformedPayload(#[from] MalformedPayload),

    /// No adapter can serve the addressed account.
    #[error("no adapter for account {0}")]
    NoAdapter(AccountId),

    /// The provider failed while expanding or hydrating the notification.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Recording or resolving a delete conflict failed.
    #[error(transparent)]
    Conflict(#[from] ConflictError),
}

/// Result of processing one notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookOutcome {
    /// Account the notification addressed, when it could be resolved.
    pub account_id: Option<AccountId>,
    /// False when the payload could not be decoded.
    pub processed: bool,
    /// Deltas applied to the local replica.
    pub messages_processed: u32,
}

impl WebhookOutcome {
    fn rejected() -> Self {
        Self::default()
    }
}

/// Applies push notifications to the local replica.
pub struct WebhookService {
    accounts: Arc<dyn AccountStore>,
    messages: Arc<dyn MessageStore>,
    registry: Arc<AdapterRegistry>,
    conflicts: Arc<ConflictService>,
    detect_conflicts: bool,
    default_policy: Option<ResolutionPolicy>,
}

impl WebhookService {
    /// Creates a new WebhookService.
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        messages: Arc<dyn MessageStore>,
        registry: Arc<AdapterRegistry>,
        conflicts: Arc<ConflictService>,
        detect_conflicts: bool,
    ) -> Self {
        Self {
            accounts,
            messages,
            registry,
            conflicts,
            detect_conflicts,
            default_policy: None,
        }
    }

    /// Policy applied right after a delete conflict is recorded.
    pub fn default_policy(mut self, policy: Option<ResolutionPolicy>) -> Self {
        self.default_policy = policy;
        self
    }

    /// Decodes and applies a raw notification posted by `kind`.
    pub async fn process_notification(&self, kind: ProviderKind, payload: &[u8]) -> WebhookOutcome {
        let notification = match PushNotification::decode(kind, payload) {
            Ok(notification) => notification,
            Err(e) => {
                tracing::warn!(provider = %kind, error = %e, "rejected webhook payload");
                return WebhookOutcome::rejected();
            }
        };

        match notification {
            PushNotification::Unified(deltas) => self.apply_unified(deltas).await,
            PushNotification::Native(notice) => self.apply_native(kind, notice).await,
        }
    }

    async fn apply_unified(&self, deltas: Vec<UnifiedDelta>) -> WebhookOutcome {
        let mut outcome = WebhookOutcome {
            processed: true,
            ..Default::default()
        };

        for UnifiedDelta { grant_id, delta } in deltas {
            let Some(account) = self.resolve(ProviderKind::Unified, &grant_id).await else {
                continue;
            };
            outcome.account_id.get_or_insert_with(|| account.id.clone());

            let adapter = match self.registry.select(&account, None) {
                Ok(adapter) => adapter,
                Err(e) => {
                    tracing::warn!(account_id = %account.id, error = %e, "no adapter for webhook");
                    continue;
                }
            };
            if self.apply_delta(&account, adapter.as_ref(), delta).await {
                outcome.messages_processed += 1;
            }
        }
        outcome
    }

    async fn apply_native(&self, kind: ProviderKind, notice: NativeNotice) -> WebhookOutcome {
        let Some(account) = self.resolve(kind, &notice.email_address).await else {
            return WebhookOutcome {
                processed: true,
                ..Default::default()
            };
        };

        let mut outcome = WebhookOutcome {
            account_id: Some(account.id.clone()),
            processed: true,
            messages_processed: 0,
        };

        match self.expand_history(kind, &account, &notice).await {
            Ok((adapter, deltas)) => {
                for delta in deltas {
                    if self.apply_delta(&account, adapter.as_ref(), delta).await {
                        outcome.messages_processed += 1;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(account_id = %account.id, error = %e, "failed to expand native notification");
            }
        }
        outcome
    }

    /// Turns a history pointer into deltas and advances the stored cursor.
    async fn expand_history(
        &self,
        kind: ProviderKind,
        account: &EmailAccount,
        notice: &NativeNotice,
    ) -> Result<(Arc<dyn ProviderAdapter>, Vec<RemoteDelta>), WebhookError> {
        // The notification names the native provider, so bypass unified routing.
        let adapter = self
            .registry
            .select(account, Some(kind))
            .map_err(|_| WebhookError::NoAdapter(account.id.clone()))?;

        let Some(cursor) = account.sync_cursor.as_deref() else {
            tracing::info!(account_id = %account.id, history_id = %notice.history_id, "recording first history pointer");
            self.accounts
                .update_sync_cursor(&account.id, Some(notice.history_id.clone()))
                .await?;
            return Ok((adapter, Vec::new()));
        };

        let batch = match adapter.history_since(account, cursor).await {
            Ok(batch) => batch,
            Err(ProviderError::NotFound(_)) => {
                // Pointer too old for the provider; start over from this one.
                tracing::warn!(account_id = %account.id, cursor, "history pointer expired, resetting");
                self.accounts
                    .update_sync_cursor(&account.id, Some(notice.history_id.clone()))
                    .await?;
                return Ok((adapter, Vec::new()));
            }
            Err(e) => return Err(e.into()),
        };

        let next = batch.cursor.unwrap_or_else(|| notice.history_id.clone());
        self.accounts
            .update_sync_cursor(&account.id, Some(next))
            .await?;
        Ok((adapter, batch.deltas))
    }

    async fn resolve(&self, kind: ProviderKind, identity: &str) -> Option<EmailAccount> {
        match self.accounts.find_by_provider_identity(kind, identity).await {
            Ok(Some(account)) => Some(account),
            Ok(None) => {
                tracing::warn!(provider = %kind, identity, "webhook for unknown account");
                None
            }
            Err(e) => {
                tracing::warn!(provider = %kind, identity, error = %e, "account lookup failed");
                None
            }
        }
    }

    /// Applies one delta. Returns whether it reached the replica.
    async fn apply_delta(
        &self,
        account: &EmailAccount,
        adapter: &dyn ProviderAdapter,
        delta: RemoteDelta,
    ) -> bool {
        let message_id = delta.message_id.clone();
        match self.try_apply_delta(account, adapter, delta).await {
            Ok(()) => {
                tracing::debug!(account_id = %account.id, message_id = %message_id, "webhook delta applied");
                true
            }
            Err(e) => {
                tracing::warn!(account_id = %account.id, message_id = %message_id, error = %e, "failed to apply webhook delta");
                false
            }
        }
    }

    async fn try_apply_delta(
        &self,
        account: &EmailAccount,
        adapter: &dyn ProviderAdapter,
        delta: RemoteDelta,
    ) -> Result<(), WebhookError> {
        let existing = self
            .messages
            .find_by_external_id(&account.id, &delta.message_id)
            .await?;

        if delta.change == DeltaChange::Deleted {
            return match existing {
                Some(stored) if self.detect_conflicts && stored.locally_modified() => {
                    let recorded = self
                        .conflicts
                        .record_once(ConflictType::Delete, stored, None, Vec::new())
                        .await?;
                    if let (Some(conflict), Some(policy)) = (recorded, self.default_policy) {
                        self.conflicts.resolve(&conflict.id, policy).await?;
                    }
                    Ok(())
                }
                _ => {
                    self.messages
                        .delete_messages(&account.id, &delta.message_id)
                        .await?;
                    Ok(())
                }
            };
        }

        let message = match delta.message {
            Some(message) => message,
            None => adapter.fetch_message(account, &delta.message_id).await?,
        };

        match existing {
            Some(stored) => {
                let update = MessageUpdate::synced(message.tracked_fields());
                self.messages.update_message(&stored.id, &update).await?;
            }
            None => {
                self.messages.create_message(&account.id, &message).await?;
            }
        }
        Ok(())
    }
}
