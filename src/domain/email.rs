//! Email domain types.
//!
//! [`EmailMessage`] is the canonical, provider-agnostic message every adapter
//! produces. [`TrackedFields`] is the projection of a message that the
//! reconciler compares and the conflict resolver merges.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, LocalMessageId, MessageId, ThreadId};

/// A canonical email message.
///
/// Produced fresh on every fetch or webhook decode. Adapters degrade missing
/// parts to empty strings so that one malformed message cannot abort a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    /// Provider-native message id.
    pub id: MessageId,
    /// Provider-native thread id.
    pub thread_id: ThreadId,
    /// Sender address.
    pub from: Address,
    /// Primary recipient addresses.
    pub to: Vec<Address>,
    /// Carbon copy recipient addresses.
    pub cc: Vec<Address>,
    /// Blind carbon copy recipient addresses.
    pub bcc: Vec<Address>,
    /// Subject line.
    pub subject: String,
    /// Plain text body.
    pub body_text: String,
    /// HTML body.
    pub body_html: String,
    /// Short preview of the content.
    pub snippet: String,
    /// Date the message was sent.
    pub date: DateTime<Utc>,
    /// Labels/folders applied to the message.
    pub labels: BTreeSet<String>,
    /// Whether the message has been read.
    pub is_read: bool,
    /// Whether the message is starred/flagged.
    pub is_starred: bool,
    /// Attachment metadata. Bytes are downloaded lazily.
    pub attachments: Vec<AttachmentDescriptor>,
    /// Provider-side receive timestamp.
    pub internal_date: DateTime<Utc>,
}

impl EmailMessage {
    /// Creates a message with the given ids and empty content.
    pub fn new(id: impl Into<MessageId>, thread_id: impl Into<ThreadId>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            thread_id: thread_id.into(),
            from: Address::default(),
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: String::new(),
            body_text: String::new(),
            body_html: String::new(),
            snippet: String::new(),
            date: now,
            labels: BTreeSet::new(),
            is_read: false,
            is_starred: false,
            attachments: Vec::new(),
            internal_date: now,
        }
    }

    /// Returns the fields tracked by reconciliation.
    pub fn tracked_fields(&self) -> TrackedFields {
        TrackedFields {
            subject: self.subject.clone(),
            is_read: self.is_read,
            is_starred: self.is_starred,
            labels: self.labels.clone(),
        }
    }

    /// Overwrites the tracked fields, leaving everything else as is.
    pub fn apply_tracked_fields(&mut self, fields: &TrackedFields) {
        self.subject = fields.subject.clone();
        self.is_read = fields.is_read;
        self.is_starred = fields.is_starred;
        self.labels = fields.labels.clone();
    }
}

/// An email address with optional display name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Email address. Empty when the header was missing.
    pub email: String,
    /// Display name (e.g., "John Doe").
    pub name: Option<String>,
}

impl Address {
    /// Creates a new address with just an email.
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    /// Creates a new address with email and display name.
    pub fn with_name(email: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }

    /// Parses a header value like `"Name" <email@example.com>`.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if let (Some(start), Some(end)) = (value.find('<'), value.rfind('>')) {
            if start < end {
                let email = value[start + 1..end].trim().to_string();
                let name = value[..start].trim().trim_matches('"').trim().to_string();
                return Self {
                    email,
                    name: if name.is_empty() { None } else { Some(name) },
                };
            }
        }
        Self::new(value)
    }

    /// Parses a comma-separated header value, skipping empty entries.
    pub fn parse_list(value: &str) -> Vec<Self> {
        value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(Self::parse)
            .collect()
    }

    /// Returns "Name <email>" when a name is present, otherwise the email.
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// Metadata for an attachment; the bytes are fetched on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    /// Opaque provider attachment id.
    pub attachment_id: String,
    /// Original filename.
    pub filename: String,
    /// MIME content type.
    pub mime_type: String,
    /// Size in bytes.
    pub size: u64,
}

/// A field compared during reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedField {
    Subject,
    IsRead,
    IsStarred,
    Labels,
}

impl TrackedField {
    /// Fields where a local edit and a remote edit can legitimately collide.
    pub const AMBIGUOUS: [TrackedField; 3] =
        [TrackedField::IsRead, TrackedField::IsStarred, TrackedField::Labels];
}

/// The reconciliation-relevant projection of a message.
///
/// Bodies are absent: re-fetched HTML differs byte-wise without any
/// user-visible change.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedFields {
    pub subject: String,
    pub is_read: bool,
    pub is_starred: bool,
    pub labels: BTreeSet<String>,
}

impl TrackedFields {
    /// Returns the fields whose values differ from `other`.
    pub fn diff(&self, other: &TrackedFields) -> Vec<TrackedField> {
        let mut fields = Vec::new();
        if self.subject != other.subject {
            fields.push(TrackedField::Subject);
        }
        if self.is_read != other.is_read {
            fields.push(TrackedField::IsRead);
        }
        if self.is_starred != other.is_starred {
            fields.push(TrackedField::IsStarred);
        }
        if self.labels != other.labels {
            fields.push(TrackedField::Labels);
        }
        fields
    }

    /// Applies the fields `remote` changed relative to `base` on top of `self`.
    ///
    /// Fields the remote side left untouched keep their local value.
    pub fn rebase(&self, base: &TrackedFields, remote: &TrackedFields) -> TrackedFields {
        let mut result = self.clone();
        for field in remote.diff(base) {
            match field {
                TrackedField::Subject => result.subject = remote.subject.clone(),
                TrackedField::IsRead => result.is_read = remote.is_read,
                TrackedField::IsStarred => result.is_starred = remote.is_starred,
                TrackedField::Labels => result.labels = remote.labels.clone(),
            }
        }
        result
    }
}

/// A message as persisted in the local replica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Local identifier.
    pub id: LocalMessageId,
    /// Owning account.
    pub account_id: AccountId,
    /// Current local state of the message.
    pub message: EmailMessage,
    /// Tracked fields as of the last successful sync, if known.
    pub synced_fields: Option<TrackedFields>,
    /// Last local modification.
    pub updated_at: DateTime<Utc>,
}

impl StoredMessage {
    /// Provider-native id of the stored message.
    pub fn external_id(&self) -> &MessageId {
        &self.message.id
    }

    /// Current local tracked fields.
    pub fn fields(&self) -> TrackedFields {
        self.message.tracked_fields()
    }

    /// Whether the local copy was edited since the last sync.
    pub fn locally_modified(&self) -> bool {
        match &self.synced_fields {
            Some(snapshot) => *snapshot != self.fields(),
            None => false,
        }
    }
}

/// Builds a label set from anything yielding strings.
pub fn label_set<I, S>(labels: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    labels.into_iter().map(Into::into).collect()
}
