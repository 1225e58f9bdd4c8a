//! Sync log domain types.
//!
//! One [`SyncLog`] row is written per sync run. It is created in the
//! `Started` state and always finalized as `Completed` or `Failed`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AccountId, SyncLogId};

/// Audit record for a single sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLog {
    pub id: SyncLogId,
    pub account_id: AccountId,
    pub sync_type: SyncType,
    pub status: SyncLogStatus,
    pub counters: SyncCounters,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncLog {
    /// Creates a log in the `Started` state.
    pub fn started(account_id: AccountId, sync_type: SyncType) -> Self {
        Self {
            id: SyncLogId::generate(),
            account_id,
            sync_type,
            status: SyncLogStatus::Started,
            counters: SyncCounters::default(),
            error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    /// Whether the run recorded by this log has ended.
    pub fn is_finalized(&self) -> bool {
        self.status != SyncLogStatus::Started
    }
}

/// Full or incremental run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    Full,
    Incremental,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Full => "full",
            SyncType::Incremental => "incremental",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "full" => Some(SyncType::Full),
            "incremental" => Some(SyncType::Incremental),
            _ => None,
        }
    }
}

/// Lifecycle state of a sync log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncLogStatus {
    Started,
    Completed,
    Failed,
}

impl SyncLogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncLogStatus::Started => "started",
            SyncLogStatus::Completed => "completed",
            SyncLogStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "started" => Some(SyncLogStatus::Started),
            "completed" => Some(SyncLogStatus::Completed),
            "failed" => Some(SyncLogStatus::Failed),
            _ => None,
        }
    }
}

/// Per-run message counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounters {
    pub processed: u32,
    pub added: u32,
    pub updated: u32,
    pub deleted: u32,
    pub errors: u32,
}
