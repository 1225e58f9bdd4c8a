//! Sync conflict domain types.
//!
//! A [`SyncConflict`] records a message whose local and remote copies diverged
//! independently since the last sync. Conflicts are resolved with a
//! [`ResolutionPolicy`] or dismissed; either way they stay queryable.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, ConflictId, EmailMessage, StoredMessage, TrackedField, TrackedFields};

/// A recorded divergence between the local and remote copy of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: ConflictId,
    pub account_id: AccountId,
    pub conflict_type: ConflictType,
    /// Local record at detection time.
    pub local_email: StoredMessage,
    /// Remote copy at detection time. `None` when the remote deleted it.
    pub remote_email: Option<EmailMessage>,
    /// Fields both sides changed to different values.
    pub conflict_fields: Vec<TrackedField>,
    pub detected_at: DateTime<Utc>,
    pub status: ConflictStatus,
    pub resolution: Option<ConflictResolution>,
}

impl SyncConflict {
    /// Creates a pending conflict.
    pub fn new(
        conflict_type: ConflictType,
        local_email: StoredMessage,
        remote_email: Option<EmailMessage>,
        conflict_fields: Vec<TrackedField>,
    ) -> Self {
        Self {
            id: ConflictId::generate(),
            account_id: local_email.account_id.clone(),
            conflict_type,
            local_email,
            remote_email,
            conflict_fields,
            detected_at: Utc::now(),
            status: ConflictStatus::Pending,
            resolution: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == ConflictStatus::Pending
    }

    /// Marks the conflict resolved with the given policy.
    pub fn resolve(mut self, policy: ResolutionPolicy) -> Self {
        self.status = ConflictStatus::Resolved;
        self.resolution = Some(ConflictResolution {
            policy,
            resolved_at: Utc::now(),
        });
        self
    }

    /// Marks the conflict inert without applying anything.
    pub fn dismiss(mut self) -> Self {
        self.status = ConflictStatus::Dismissed;
        self
    }
}

/// Kind of divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// Flags (and possibly labels) diverged.
    Update,
    /// Remote deleted a message that was edited locally.
    Delete,
    /// Only the label/folder set diverged.
    Move,
}

impl ConflictType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictType::Update => "update",
            ConflictType::Delete => "delete",
            ConflictType::Move => "move",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "update" => Some(ConflictType::Update),
            "delete" => Some(ConflictType::Delete),
            "move" => Some(ConflictType::Move),
            _ => None,
        }
    }
}

/// Review state of a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    Pending,
    Resolved,
    Dismissed,
}

impl ConflictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStatus::Pending => "pending",
            ConflictStatus::Resolved => "resolved",
            ConflictStatus::Dismissed => "dismissed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ConflictStatus::Pending),
            "resolved" => Some(ConflictStatus::Resolved),
            "dismissed" => Some(ConflictStatus::Dismissed),
            _ => None,
        }
    }
}

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionPolicy {
    /// Keep the local copy and push it back to the provider.
    Local,
    /// Overwrite the local copy from the remote one.
    Remote,
    /// Field union: remote scalars when present, label sets unioned.
    Merge,
}

/// Applied resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub policy: ResolutionPolicy,
    pub resolved_at: DateTime<Utc>,
}

/// Deterministic field-union merge.
///
/// Strings and booleans prefer the remote value when present, falling back
/// to the local one; label sets are unioned. The union is associative,
/// commutative and idempotent on labels.
pub fn merge_fields(local: &TrackedFields, remote: &TrackedFields) -> TrackedFields {
    let subject = if remote.subject.is_empty() {
        local.subject.clone()
    } else {
        remote.subject.clone()
    };
    let labels: BTreeSet<String> = local.labels.union(&remote.labels).cloned().collect();

    TrackedFields {
        subject,
        is_read: remote.is_read,
        is_starred: remote.is_starred,
        labels,
    }
}
