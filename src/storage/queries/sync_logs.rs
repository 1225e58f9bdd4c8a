//! Sync log operations.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::{enum_column, optional_time_column, time_column};
use crate::domain::{AccountId, SyncCounters, SyncLog, SyncLogId, SyncLogStatus, SyncType};
use crate::storage::database::{Database, Result};
use crate::storage::{StoreError, StoreResult, SyncLogStore};

const SELECT_COLUMNS: &str = r#"
    SELECT
        id, account_id, sync_type, status, processed, added, updated, deleted, errors,
        error, started_at, finished_at
    FROM sync_logs
"#;

/// Inserts a log row.
pub async fn insert(db: &Database, log: &SyncLog) -> Result<()> {
    let log = log.clone();

    db.with_conn(move |conn| {
        conn.execute(
            r#"
            INSERT INTO sync_logs (
                id, account_id, sync_type, status, processed, added, updated, deleted, errors,
                error, started_at, finished_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                log.id.0,
                log.account_id.0,
                log.sync_type.as_str(),
                log.status.as_str(),
                log.counters.processed,
                log.counters.added,
                log.counters.updated,
                log.counters.deleted,
                log.counters.errors,
                log.error,
                log.started_at.to_rfc3339(),
                log.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    })
    .await
}

/// Retrieves a log by ID.
pub async fn get_by_id(db: &Database, id: &SyncLogId) -> Result<Option<SyncLog>> {
    let id = id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
        let result = stmt.query_row([&id.0], row_to_log).optional()?;
        Ok(result)
    })
    .await
}

/// Lists the logs of an account, oldest first.
pub async fn list_by_account(db: &Database, account_id: &AccountId) -> Result<Vec<SyncLog>> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let mut stmt =
            conn.prepare(&format!("{SELECT_COLUMNS} WHERE account_id = ?1 ORDER BY started_at"))?;
        let logs = stmt
            .query_map([&account_id.0], row_to_log)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(logs)
    })
    .await
}

fn row_to_log(row: &Row<'_>) -> rusqlite::Result<SyncLog> {
    Ok(SyncLog {
        id: SyncLogId(row.get(0)?),
        account_id: AccountId(row.get(1)?),
        sync_type: enum_column(row, 2, SyncType::parse)?,
        status: enum_column(row, 3, SyncLogStatus::parse)?,
        counters: SyncCounters {
            processed: row.get(4)?,
            added: row.get(5)?,
            updated: row.get(6)?,
            deleted: row.get(7)?,
            errors: row.get(8)?,
        },
        error: row.get(9)?,
        started_at: time_column(row, 10)?,
        finished_at: optional_time_column(row, 11)?,
    })
}

#[async_trait]
impl SyncLogStore for Database {
    async fn create_log(
        &self,
        account_id: &AccountId,
        sync_type: SyncType,
    ) -> StoreResult<SyncLogId> {
        let log = SyncLog::started(account_id.clone(), sync_type);
        insert(self, &log).await?;
        Ok(log.id)
    }

    async fn finalize_log(
        &self,
        id: &SyncLogId,
        status: SyncLogStatus,
        counters: &SyncCounters,
        error: Option<String>,
    ) -> StoreResult<()> {
        let log_id = id.clone();
        let counters = *counters;

        let changed = self
            .with_conn(move |conn| {
                let changed = conn.execute(
                    r#"
                    UPDATE sync_logs SET
                        status = ?1, processed = ?2, added = ?3, updated = ?4, deleted = ?5,
                        errors = ?6, error = ?7, finished_at = ?8
                    WHERE id = ?9
                    "#,
                    params![
                        status.as_str(),
                        counters.processed,
                        counters.added,
                        counters.updated,
                        counters.deleted,
                        counters.errors,
                        error,
                        Utc::now().to_rfc3339(),
                        log_id.0,
                    ],
                )?;
                Ok(changed)
            })
            .await?;

        if changed == 0 {
            return Err(StoreError::NotFound(format!("sync log {id}")));
        }
        Ok(())
    }

    async fn get_log(&self, id: &SyncLogId) -> StoreResult<Option<SyncLog>> {
        Ok(get_by_id(self, id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EmailAccount, ProviderKind};
    use crate::storage::queries::accounts;

    #[tokio::test]
    async fn create_then_finalize() {
        let db = Database::open_in_memory().await.unwrap();
        let account = EmailAccount::new("acc-1", "user@example.com", ProviderKind::Unified);
        accounts::insert(&db, &account).await.unwrap();

        let id = db.create_log(&account.id, SyncType::Full).await.unwrap();
        let log = db.get_log(&id).await.unwrap().unwrap();
        assert_eq!(log.status, SyncLogStatus::Started);
        assert!(log.finished_at.is_none());

        let counters = SyncCounters {
            processed: 3,
            added: 2,
            updated: 0,
            deleted: 0,
            errors: 1,
        };
        db.finalize_log(&id, SyncLogStatus::Completed, &counters, None)
            .await
            .unwrap();

        let log = db.get_log(&id).await.unwrap().unwrap();
        assert_eq!(log.status, SyncLogStatus::Completed);
        assert_eq!(log.counters, counters);
        assert!(log.finished_at.is_some());
        assert_eq!(list_by_account(&db, &account.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn finalize_unknown_log_is_not_found() {
        let db = Database::open_in_memory().await.unwrap();
        let result = db
            .finalize_log(
                &SyncLogId::from("missing"),
                SyncLogStatus::Failed,
                &SyncCounters::default(),
                Some("boom".into()),
            )
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
