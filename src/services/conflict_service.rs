//! Conflict detection and resolution.
//!
//! Detection compares three versions of a message's tracked fields: the
//! local copy, the remote copy, and the snapshot taken at the last sync.
//! A field conflicts only when both sides moved away from the snapshot to
//! different values. Everything else can be applied without asking.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{
    merge_fields, AccountId, ConflictId, ConflictStatus, ConflictType, EmailMessage,
    ResolutionPolicy, StoredMessage, SyncConflict, TrackedField, TrackedFields,
};
use crate::providers::email::AdapterRegistry;
use crate::storage::{AccountStore, ConflictStore, MessageStore, MessageUpdate, StoreError};

/// Errors from conflict operations.
#[derive(Debug, Clone, Error)]
pub enum ConflictError {
    /// No conflict with that id.
    #[error("conflict not found: {0}")]
    NotFound(ConflictId),

    /// The conflict was already resolved or dismissed.
    #[error("conflict {id} is already {}", .status.as_str())]
    AlreadyClosed {
        id: ConflictId,
        status: ConflictStatus,
    },

    /// An update conflict without a remote copy cannot be applied.
    #[error("conflict {0} has no remote copy")]
    MissingRemote(ConflictId),

    /// Storage error.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for conflict operations.
pub type Result<T> = std::result::Result<T, ConflictError>;

/// Outcome of comparing a stored message with its remote copy.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Nothing to write.
    Unchanged,
    /// Write these fields; the remote fields become the new snapshot.
    Apply(TrackedFields),
    /// Both sides changed the listed fields to different values.
    Conflict {
        conflict_type: ConflictType,
        fields: Vec<TrackedField>,
    },
}

/// Classifies a stored message against its remote copy.
///
/// Without a snapshot there is no common ancestor, so the remote copy wins.
pub fn detect(stored: &StoredMessage, remote: &EmailMessage) -> Detection {
    let local = stored.fields();
    let remote = remote.tracked_fields();
    if local == remote {
        return Detection::Unchanged;
    }

    let Some(base) = &stored.synced_fields else {
        return Detection::Apply(remote);
    };
    if remote == *base {
        // Only the local side moved.
        return Detection::Unchanged;
    }

    let local_changed = local.diff(base);
    let remote_changed = remote.diff(base);
    let diverged = local.diff(&remote);
    let fields: Vec<TrackedField> = TrackedField::AMBIGUOUS
        .into_iter()
        .filter(|f| {
            local_changed.contains(f) && remote_changed.contains(f) && diverged.contains(f)
        })
        .collect();

    if fields.is_empty() {
        return Detection::Apply(local.rebase(base, &remote));
    }

    let conflict_type = if fields == [TrackedField::Labels] {
        ConflictType::Move
    } else {
        ConflictType::Update
    };
    Detection::Conflict {
        conflict_type,
        fields,
    }
}

/// Outcome of a bulk resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResolution {
    pub resolved: usize,
    pub failed: usize,
    pub total: usize,
}

/// Records, lists and resolves sync conflicts.
pub struct ConflictService {
    accounts: Arc<dyn AccountStore>,
    messages: Arc<dyn MessageStore>,
    conflicts: Arc<dyn ConflictStore>,
    registry: Arc<AdapterRegistry>,
}

impl ConflictService {
    /// Creates a new ConflictService.
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        messages: Arc<dyn MessageStore>,
        conflicts: Arc<dyn ConflictStore>,
        registry: Arc<AdapterRegistry>,
    ) -> Self {
        Self {
            accounts,
            messages,
            conflicts,
            registry,
        }
    }

    /// Persists a new pending conflict.
    pub async fn record(
        &self,
        conflict_type: ConflictType,
        local: StoredMessage,
        remote: Option<EmailMessage>,
        fields: Vec<TrackedField>,
    ) -> Result<SyncConflict> {
        let conflict = SyncConflict::new(conflict_type, local, remote, fields);
        self.conflicts.save_conflict(&conflict).await?;
        tracing::info!(
            account_id = %conflict.account_id,
            conflict_id = %conflict.id,
            message_id = %conflict.local_email.external_id(),
            conflict_type = conflict_type.as_str(),
            "sync conflict detected"
        );
        Ok(conflict)
    }

    /// Records a conflict unless one is already pending for the message.
    ///
    /// An existing pending conflict is refreshed with the latest local and
    /// remote copies and `None` is returned, so a divergence seen on every
    /// sync stays a single conflict.
    pub async fn record_once(
        &self,
        conflict_type: ConflictType,
        local: StoredMessage,
        remote: Option<EmailMessage>,
        fields: Vec<TrackedField>,
    ) -> Result<Option<SyncConflict>> {
        let existing = self
            .conflicts
            .find_pending(&local.account_id, local.external_id())
            .await?;

        let Some(mut existing) = existing else {
            return self
                .record(conflict_type, local, remote, fields)
                .await
                .map(Some);
        };

        let changed = existing.conflict_type != conflict_type
            || existing.local_email != local
            || existing.remote_email != remote
            || existing.conflict_fields != fields;
        if changed {
            existing.conflict_type = conflict_type;
            existing.local_email = local;
            existing.remote_email = remote;
            existing.conflict_fields = fields;
            self.conflicts.update_conflict(&existing).await?;
        }
        tracing::debug!(
            account_id = %existing.account_id,
            conflict_id = %existing.id,
            refreshed = changed,
            "conflict already pending"
        );
        Ok(None)
    }

    /// Gets a conflict by ID.
    pub async fn get(&self, id: &ConflictId) -> Result<SyncConflict> {
        self.conflicts
            .get_conflict(id)
            .await?
            .ok_or_else(|| ConflictError::NotFound(id.clone()))
    }

    /// Lists conflicts of an account, optionally by status.
    pub async fn list(
        &self,
        account_id: &AccountId,
        status: Option<ConflictStatus>,
    ) -> Result<Vec<SyncConflict>> {
        Ok(self.conflicts.list_conflicts(account_id, status).await?)
    }

    /// Resolves a pending conflict with the given policy.
    pub async fn resolve(&self, id: &ConflictId, policy: ResolutionPolicy) -> Result<SyncConflict> {
        let conflict = self.pending(id).await?;
        self.apply(&conflict, policy).await?;

        let resolved = conflict.resolve(policy);
        self.conflicts.update_conflict(&resolved).await?;
        tracing::info!(conflict_id = %id, ?policy, "conflict resolved");
        Ok(resolved)
    }

    /// Resolves many conflicts independently.
    pub async fn resolve_bulk(
        &self,
        ids: &[ConflictId],
        policy: ResolutionPolicy,
    ) -> BulkResolution {
        let outcomes = join_all(ids.iter().map(|id| self.resolve(id, policy))).await;

        let mut summary = BulkResolution {
            total: ids.len(),
            ..Default::default()
        };
        for (id, outcome) in ids.iter().zip(outcomes) {
            match outcome {
                Ok(_) => summary.resolved += 1,
                Err(e) => {
                    tracing::warn!(conflict_id = %id, error = %e, "bulk resolution failed");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    /// Marks a pending conflict dismissed without applying anything.
    pub async fn dismiss(&self, id: &ConflictId) -> Result<SyncConflict> {
        let dismissed = self.pending(id).await?.dismiss();
        self.conflicts.update_conflict(&dismissed).await?;
        tracing::info!(conflict_id = %id, "conflict dismissed");
        Ok(dismissed)
    }

    async fn pending(&self, id: &ConflictId) -> Result<SyncConflict> {
        let conflict = self.get(id).await?;
        if !conflict.is_pending() {
            return Err(ConflictError::AlreadyClosed {
                id: conflict.id,
                status: conflict.status,
            });
        }
        Ok(conflict)
    }

    async fn apply(&self, conflict: &SyncConflict, policy: ResolutionPolicy) -> Result<()> {
        let local = &conflict.local_email;

        if conflict.conflict_type == ConflictType::Delete {
            if policy != ResolutionPolicy::Local {
                self.messages
                    .delete_messages(&conflict.account_id, local.external_id())
                    .await?;
            }
            return Ok(());
        }

        let remote = conflict
            .remote_email
            .as_ref()
            .ok_or_else(|| ConflictError::MissingRemote(conflict.id.clone()))?
            .tracked_fields();

        // Resolve against the latest local state, not the copy taken at detection.
        let current = self
            .messages
            .find_by_external_id(&conflict.account_id, local.external_id())
            .await?
            .unwrap_or_else(|| local.clone());

        let update = match policy {
            ResolutionPolicy::Remote => MessageUpdate::synced(remote),
            ResolutionPolicy::Local => self.push_back(&current, current.fields(), remote).await,
            ResolutionPolicy::Merge => {
                let merged = merge_fields(&current.fields(), &remote);
                self.push_back(&current, merged, remote).await
            }
        };
        self.messages.update_message(&current.id, &update).await?;
        Ok(())
    }

    /// Writes `desired` back to the provider.
    ///
    /// On failure the snapshot stays at the remote state, so the local edit
    /// remains pending and the next sync treats it as a local-only change.
    async fn push_back(
        &self,
        stored: &StoredMessage,
        desired: TrackedFields,
        remote: TrackedFields,
    ) -> MessageUpdate {
        let pushed = match self.accounts.get_account(&stored.account_id).await {
            Ok(Some(account)) => match self.registry.select(&account, None) {
                Ok(adapter) => adapter
                    .push_state(&account, stored.external_id(), &desired, &remote)
                    .await
                    .map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            },
            Ok(None) => Err(format!("account {} not found", stored.account_id)),
            Err(e) => Err(e.to_string()),
        };

        match pushed {
            Ok(()) => MessageUpdate::synced(desired),
            Err(error) => {
                tracing::warn!(
                    account_id = %stored.account_id,
                    message_id = %stored.external_id(),
                    %error,
                    "failed to push resolution to provider"
                );
                MessageUpdate {
                    fields: desired,
                    synced_fields: Some(remote),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{label_set, EmailAccount, LocalMessageId, MessageId, ProviderKind};
    use crate::storage::MemoryStore;
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    fn fields(read: bool, starred: bool, labels: &[&str]) -> TrackedFields {
        TrackedFields {
            subject: "Hello".into(),
            is_read: read,
            is_starred: starred,
            labels: label_set(labels.iter().copied()),
        }
    }

    fn message(f: &TrackedFields) -> EmailMessage {
        let mut message = EmailMessage::new("m1", "t1");
        message.apply_tracked_fields(f);
        message
    }

    fn stored(local: &TrackedFields, base: Option<&TrackedFields>) -> StoredMessage {
        StoredMessage {
            id: LocalMessageId::from("l1"),
            account_id: AccountId::from("a1"),
            message: message(local),
            synced_fields: base.cloned(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn identical_copies_are_unchanged() {
        let f = fields(true, false, &["INBOX"]);
        assert_eq!(detect(&stored(&f, Some(&f)), &message(&f)), Detection::Unchanged);
    }

    #[test]
    fn remote_only_change_is_applied() {
        let base = fields(false, false, &["INBOX"]);
        let remote = fields(true, false, &["INBOX"]);
        assert_eq!(
            detect(&stored(&base, Some(&base)), &message(&remote)),
            Detection::Apply(remote)
        );
    }

    #[test]
    fn local_only_change_is_kept() {
        let base = fields(false, false, &["INBOX"]);
        let local = fields(false, true, &["INBOX"]);
        assert_eq!(
            detect(&stored(&local, Some(&base)), &message(&base)),
            Detection::Unchanged
        );
    }

    #[test]
    fn non_overlapping_changes_are_rebased() {
        let base = fields(false, false, &["INBOX"]);
        let local = fields(false, true, &["INBOX"]);
        let remote = fields(true, false, &["INBOX"]);
        assert_eq!(
            detect(&stored(&local, Some(&base)), &message(&remote)),
            Detection::Apply(fields(true, true, &["INBOX"]))
        );
    }

    #[test]
    fn diverging_labels_are_a_move_conflict() {
        let base = fields(false, false, &["INBOX"]);
        let local = fields(false, false, &["Archive"]);
        let remote = fields(false, false, &["Work"]);
        assert_eq!(
            detect(&stored(&local, Some(&base)), &message(&remote)),
            Detection::Conflict {
                conflict_type: ConflictType::Move,
                fields: vec![TrackedField::Labels],
            }
        );
    }

    #[test]
    fn flags_changed_on_one_side_do_not_conflict() {
        let base = fields(false, false, &["INBOX"]);
        let local = fields(true, true, &["Archive"]);
        let remote = fields(false, false, &["Work"]);
        assert_eq!(
            detect(&stored(&local, Some(&base)), &message(&remote)),
            Detection::Conflict {
                conflict_type: ConflictType::Move,
                fields: vec![TrackedField::Labels],
            }
        );
    }

    #[test]
    fn without_snapshot_remote_wins() {
        let local = fields(true, true, &["A"]);
        let remote = fields(false, false, &["B"]);
        assert_eq!(detect(&stored(&local, None), &message(&remote)), Detection::Apply(remote));
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        service: ConflictService,
        account: AccountId,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        // IMAP is not registered, so local-wins pushes fail softly.
        let account = EmailAccount::new("a1", "me@example.com", ProviderKind::Imap);
        store.insert_account(account.clone()).await;
        let service = ConflictService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(AdapterRegistry::new()),
        );
        Fixture {
            store,
            service,
            account: account.id,
        }
    }

    async fn seed_conflict(f: &Fixture, local: &TrackedFields, remote: &TrackedFields) -> ConflictId {
        let base = fields(false, false, &["INBOX"]);
        let id = f
            .store
            .create_message(&f.account, &message(&base))
            .await
            .unwrap();
        f.store
            .update_message(&id, &MessageUpdate::local(local.clone()))
            .await
            .unwrap();
        let stored = f
            .store
            .find_by_external_id(&f.account, &MessageId::from("m1"))
            .await
            .unwrap()
            .unwrap();
        f.service
            .record(
                ConflictType::Update,
                stored,
                Some(message(remote)),
                vec![TrackedField::Labels],
            )
            .await
            .unwrap()
            .id
    }

    async fn stored_fields(f: &Fixture) -> StoredMessage {
        f.store
            .find_by_external_id(&f.account, &MessageId::from("m1"))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn record_once_refreshes_the_pending_conflict() {
        let f = fixture().await;
        let id = seed_conflict(
            &f,
            &fields(false, false, &["Archive"]),
            &fields(false, false, &["Work"]),
        )
        .await;

        let newer = fields(false, false, &["Travel"]);
        let recorded = f
            .service
            .record_once(
                ConflictType::Move,
                stored_fields(&f).await,
                Some(message(&newer)),
                vec![TrackedField::Labels],
            )
            .await
            .unwrap();
        assert!(recorded.is_none());

        let pending = f
            .service
            .list(&f.account, Some(ConflictStatus::Pending))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);
        assert_eq!(pending[0].conflict_type, ConflictType::Move);
        assert_eq!(
            pending[0].remote_email.as_ref().map(EmailMessage::tracked_fields),
            Some(newer)
        );

        f.service.dismiss(&id).await.unwrap();
        let recorded = f
            .service
            .record_once(
                ConflictType::Move,
                stored_fields(&f).await,
                Some(message(&fields(false, false, &["Work"]))),
                vec![TrackedField::Labels],
            )
            .await
            .unwrap();
        assert!(recorded.is_some());
    }

    #[tokio::test]
    async fn remote_policy_overwrites_local() {
        let f = fixture().await;
        let remote = fields(true, false, &["Work"]);
        let id = seed_conflict(&f, &fields(false, true, &["Archive"]), &remote).await;

        let resolved = f.service.resolve(&id, ResolutionPolicy::Remote).await.unwrap();
        assert_eq!(resolved.status, ConflictStatus::Resolved);

        let stored = stored_fields(&f).await;
        assert_eq!(stored.fields(), remote);
        assert!(!stored.locally_modified());
    }

    #[tokio::test]
    async fn merge_policy_unions_labels() {
        let f = fixture().await;
        let id = seed_conflict(
            &f,
            &fields(false, true, &["Archive"]),
            &fields(true, false, &["Work"]),
        )
        .await;

        f.service.resolve(&id, ResolutionPolicy::Merge).await.unwrap();
        let stored = stored_fields(&f).await;
        assert_eq!(stored.fields(), fields(true, false, &["Archive", "Work"]));
    }

    #[tokio::test]
    async fn local_policy_keeps_local_when_push_fails() {
        let f = fixture().await;
        let local = fields(false, true, &["Archive"]);
        let remote = fields(true, false, &["Work"]);
        let id = seed_conflict(&f, &local, &remote).await;

        f.service.resolve(&id, ResolutionPolicy::Local).await.unwrap();
        let stored = stored_fields(&f).await;
        assert_eq!(stored.fields(), local);
        assert_eq!(stored.synced_fields, Some(remote));
    }

    #[tokio::test]
    async fn closed_conflicts_cannot_be_resolved_again() {
        let f = fixture().await;
        let id = seed_conflict(
            &f,
            &fields(false, true, &["Archive"]),
            &fields(true, false, &["Work"]),
        )
        .await;

        f.service.dismiss(&id).await.unwrap();
        let err = f
            .service
            .resolve(&id, ResolutionPolicy::Remote)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConflictError::AlreadyClosed {
                status: ConflictStatus::Dismissed,
                ..
            }
        ));

        let dismissed = f.service.get(&id).await.unwrap();
        assert_eq!(dismissed.status, ConflictStatus::Dismissed);
        assert_eq!(
            f.service
                .list(&f.account, Some(ConflictStatus::Dismissed))
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn bulk_resolution_counts_failures() {
        let f = fixture().await;
        let id = seed_conflict(
            &f,
            &fields(false, true, &["Archive"]),
            &fields(true, false, &["Work"]),
        )
        .await;

        let summary = f
            .service
            .resolve_bulk(&[id, ConflictId::from("missing")], ResolutionPolicy::Remote)
            .await;
        assert_eq!(
            summary,
            BulkResolution {
                resolved: 1,
                failed: 1,
                total: 2
            }
        );
    }

    #[tokio::test]
    async fn delete_conflict_with_remote_policy_removes_message() {
        let f = fixture().await;
        let base = fields(false, false, &["INBOX"]);
        f.store
            .create_message(&f.account, &message(&base))
            .await
            .unwrap();
        let stored = stored_fields(&f).await;
        let conflict = f
            .service
            .record(ConflictType::Delete, stored, None, vec![])
            .await
            .unwrap();

        f.service
            .resolve(&conflict.id, ResolutionPolicy::Remote)
            .await
            .unwrap();
        assert!(f.store.messages_for(&f.account).await.is_empty());
    }
}
