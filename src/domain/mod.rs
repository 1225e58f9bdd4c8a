//! Domain layer types for the sync engine.
//!
//! This module contains the core domain types used throughout the crate:
//! accounts, canonical messages, sync logs and conflicts.

mod account;
mod conflict;
mod email;
mod sync_log;
mod types;

pub use account::{
    AccountStatus, Credentials, EmailAccount, ProviderKind, PushStatus, PushSubscription,
    SyncConfig, SyncStatus,
};
pub use conflict::{
    merge_fields, ConflictResolution, ConflictStatus, ConflictType, ResolutionPolicy,
    SyncConflict,
};
pub use email::{
    label_set, Address, AttachmentDescriptor, EmailMessage, StoredMessage, TrackedField,
    TrackedFields,
};
pub use sync_log::{SyncCounters, SyncLog, SyncLogStatus, SyncType};
pub use types::{AccountId, ConflictId, LocalMessageId, MessageId, SyncLogId, ThreadId};
