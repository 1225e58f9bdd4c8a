//! Reconciliation of fetched messages against the local replica.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};

use super::conflict_service::{detect, ConflictService, Detection};
use crate::domain::{
    AccountId, ConflictType, EmailMessage, ResolutionPolicy, StoredMessage, TrackedField,
};
use crate::storage::{MessageStore, MessageUpdate, StoreError, StoreResult};

/// Per-message classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Added,
    Updated,
    Unchanged,
    Conflict,
}

/// Counters for one reconciliation pass.
///
/// Every input message lands in exactly one bucket:
/// `added + updated + unchanged + conflicts + errors == processed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub processed: u32,
    pub added: u32,
    pub updated: u32,
    pub unchanged: u32,
    pub conflicts: u32,
    pub errors: u32,
}

impl ReconcileReport {
    fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Added => self.added += 1,
            Outcome::Updated => self.updated += 1,
            Outcome::Unchanged => self.unchanged += 1,
            Outcome::Conflict => self.conflicts += 1,
        }
    }
}

/// Applies remote messages to the local replica.
pub struct Reconciler {
    messages: Arc<dyn MessageStore>,
    conflicts: Arc<ConflictService>,
    concurrency: usize,
    detect_conflicts: bool,
    default_policy: Option<ResolutionPolicy>,
}

impl Reconciler {
    /// Creates a reconciler that processes up to `concurrency` messages at once.
    pub fn new(
        messages: Arc<dyn MessageStore>,
        conflicts: Arc<ConflictService>,
        concurrency: usize,
    ) -> Self {
        Self {
            messages,
            conflicts,
            concurrency: concurrency.max(1),
            detect_conflicts: true,
            default_policy: None,
        }
    }

    /// Enables or disables three-way conflict detection.
    pub fn detect_conflicts(mut self, enabled: bool) -> Self {
        self.detect_conflicts = enabled;
        self
    }

    /// Resolves detected conflicts immediately with `policy`.
    pub fn default_policy(mut self, policy: Option<ResolutionPolicy>) -> Self {
        self.default_policy = policy;
        self
    }

    /// Reconciles a batch of remote messages.
    ///
    /// Messages are processed independently; a failure is logged with the
    /// message id and counted, never propagated.
    pub async fn reconcile(
        &self,
        account_id: &AccountId,
        messages: Vec<EmailMessage>,
    ) -> ReconcileReport {
        let outcomes: Vec<_> = stream::iter(messages)
            .map(|message| async move {
                let result = self.reconcile_one(account_id, &message).await;
                (message.id, result)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = ReconcileReport::default();
        for (message_id, result) in outcomes {
            report.processed += 1;
            match result {
                Ok(outcome) => {
                    tracing::debug!(account_id = %account_id, message_id = %message_id, ?outcome, "message reconciled");
                    report.record(outcome);
                }
                Err(e) => {
                    tracing::warn!(account_id = %account_id, message_id = %message_id, error = %e, "failed to reconcile message");
                    report.errors += 1;
                }
            }
        }
        report
    }

    async fn reconcile_one(
        &self,
        account_id: &AccountId,
        remote: &EmailMessage,
    ) -> StoreResult<Outcome> {
        let stored = match self.messages.find_by_external_id(account_id, &remote.id).await? {
            Some(stored) => stored,
            None => match self.messages.create_message(account_id, remote).await {
                Ok(_) => return Ok(Outcome::Added),
                // Inserted concurrently, e.g. by a webhook; fall through to an update.
                Err(StoreError::AlreadyExists(_)) => self
                    .messages
                    .find_by_external_id(account_id, &remote.id)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(format!("message {}", remote.id)))?,
                Err(e) => return Err(e),
            },
        };

        let detection = if self.detect_conflicts {
            detect(&stored, remote)
        } else if stored.fields() == remote.tracked_fields() {
            Detection::Unchanged
        } else {
            Detection::Apply(remote.tracked_fields())
        };

        match detection {
            Detection::Unchanged => Ok(Outcome::Unchanged),
            Detection::Apply(fields) => {
                let update = MessageUpdate {
                    fields,
                    synced_fields: Some(remote.tracked_fields()),
                };
                self.messages.update_message(&stored.id, &update).await?;
                Ok(Outcome::Updated)
            }
            Detection::Conflict {
                conflict_type,
                fields,
            } => {
                let recorded = self
                    .handle_conflict(stored, remote, conflict_type, fields)
                    .await?;
                Ok(if recorded {
                    Outcome::Conflict
                } else {
                    Outcome::Unchanged
                })
            }
        }
    }

    async fn handle_conflict(
        &self,
        stored: StoredMessage,
        remote: &EmailMessage,
        conflict_type: ConflictType,
        fields: Vec<TrackedField>,
    ) -> StoreResult<bool> {
        let recorded = self
            .conflicts
            .record_once(conflict_type, stored, Some(remote.clone()), fields)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let Some(conflict) = recorded else {
            return Ok(false);
        };

        if let Some(policy) = self.default_policy {
            if let Err(e) = self.conflicts.resolve(&conflict.id, policy).await {
                tracing::warn!(conflict_id = %conflict.id, error = %e, "default conflict policy failed");
            }
        }
        Ok(true)
    }
}
