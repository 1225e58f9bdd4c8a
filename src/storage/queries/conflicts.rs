//! Sync conflict operations.

use async_trait::async_trait;
use rusqlite::{params, OptionalExtension, Row};

use super::{enum_column, json_column, optional_json_column, time_column};
use crate::domain::{
    AccountId, ConflictId, ConflictStatus, ConflictType, MessageId, SyncConflict,
};
use crate::storage::database::{Database, Result};
use crate::storage::{ConflictStore, StoreError, StoreResult};

const SELECT_COLUMNS: &str = r#"
    SELECT
        id, account_id, conflict_type, status, local_json, remote_json, fields_json,
        resolution_json, detected_at
    FROM sync_conflicts
"#;

/// Inserts or replaces a conflict row.
pub async fn upsert(db: &Database, conflict: &SyncConflict) -> Result<()> {
    let conflict = conflict.clone();

    db.with_conn(move |conn| {
        let local_json = serde_json::to_string(&conflict.local_email)?;
        let remote_json = conflict
            .remote_email
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let fields_json = serde_json::to_string(&conflict.conflict_fields)?;
        let resolution_json = conflict
            .resolution
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            r#"
            INSERT OR REPLACE INTO sync_conflicts (
                id, account_id, conflict_type, status, local_json, remote_json, fields_json,
                resolution_json, detected_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                conflict.id.0,
                conflict.account_id.0,
                conflict.conflict_type.as_str(),
                conflict.status.as_str(),
                local_json,
                remote_json,
                fields_json,
                resolution_json,
                conflict.detected_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Retrieves a conflict by ID.
pub async fn get_by_id(db: &Database, id: &ConflictId) -> Result<Option<SyncConflict>> {
    let id = id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
        let result = stmt.query_row([&id.0], row_to_conflict).optional()?;
        Ok(result)
    })
    .await
}

/// Lists conflicts of an account, most recent first.
pub async fn list_by_account(
    db: &Database,
    account_id: &AccountId,
    status: Option<ConflictStatus>,
) -> Result<Vec<SyncConflict>> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let conflicts = match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE account_id = ?1 AND status = ?2 ORDER BY detected_at DESC"
                ))?;
                let rows = stmt.query_map(params![account_id.0, status.as_str()], row_to_conflict)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE account_id = ?1 ORDER BY detected_at DESC"
                ))?;
                let rows = stmt.query_map([&account_id.0], row_to_conflict)?;
                rows.collect::<std::result::Result<Vec<_>, _>>()?
            }
        };
        Ok(conflicts)
    })
    .await
}

/// Finds the pending conflict of one message.
///
/// The external id lives inside `local_json`, so pending rows of the account
/// are decoded and matched here.
pub async fn find_pending(
    db: &Database,
    account_id: &AccountId,
    external_id: &MessageId,
) -> Result<Option<SyncConflict>> {
    let pending = list_by_account(db, account_id, Some(ConflictStatus::Pending)).await?;
    Ok(pending
        .into_iter()
        .find(|c| c.local_email.external_id() == external_id))
}

fn row_to_conflict(row: &Row<'_>) -> rusqlite::Result<SyncConflict> {
    Ok(SyncConflict {
        id: ConflictId(row.get(0)?),
        account_id: AccountId(row.get(1)?),
        conflict_type: enum_column(row, 2, ConflictType::parse)?,
        status: enum_column(row, 3, ConflictStatus::parse)?,
        local_email: json_column(row, 4)?,
        remote_email: optional_json_column(row, 5)?,
        conflict_fields: json_column(row, 6)?,
        resolution: optional_json_column(row, 7)?,
        detected_at: time_column(row, 8)?,
    })
}

#[async_trait]
impl ConflictStore for Database {
    async fn save_conflict(&self, conflict: &SyncConflict) -> StoreResult<()> {
        Ok(upsert(self, conflict).await?)
    }

    async fn get_conflict(&self, id: &ConflictId) -> StoreResult<Option<SyncConflict>> {
        Ok(get_by_id(self, id).await?)
    }

    async fn list_conflicts(
        &self,
        account_id: &AccountId,
        status: Option<ConflictStatus>,
    ) -> StoreResult<Vec<SyncConflict>> {
        Ok(list_by_account(self, account_id, status).await?)
    }

    async fn update_conflict(&self, conflict: &SyncConflict) -> StoreResult<()> {
        if get_by_id(self, &conflict.id).await?.is_none() {
            return Err(StoreError::NotFound(format!("conflict {}", conflict.id)));
        }
        Ok(upsert(self, conflict).await?)
    }

    async fn find_pending(
        &self,
        account_id: &AccountId,
        external_id: &MessageId,
    ) -> StoreResult<Option<SyncConflict>> {
        Ok(find_pending(self, account_id, external_id).await?)
    }
}
