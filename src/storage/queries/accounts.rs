//! Account operations.
//!
//! Provides database operations for account entities.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{enum_column, json_column, optional_json_column, optional_time_column};
use crate::domain::{
    AccountId, AccountStatus, Credentials, EmailAccount, ProviderKind, PushSubscription,
    SyncStatus,
};
use crate::storage::database::{Database, Result};
use crate::storage::{AccountStore, StoreError, StoreResult};

const SELECT_COLUMNS: &str = r#"
    SELECT
        id, email, provider, status, sync_status, credentials_json, foreign_id,
        sync_config_json, last_sync_at, last_error, sync_cursor, push_subscription_json
    FROM accounts
"#;

/// Inserts a new account into the database.
pub async fn insert(db: &Database, account: &EmailAccount) -> Result<()> {
    let account = account.clone();

    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        let credentials = serde_json::to_string(&account.credentials)?;
        let sync_config = serde_json::to_string(&account.sync_config)?;
        let push_subscription = account
            .push_subscription
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        conn.execute(
            r#"
            INSERT INTO accounts (
                id, email, provider, status, sync_status, credentials_json, foreign_id,
                sync_config_json, last_sync_at, last_error, sync_cursor, push_subscription_json,
                created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14
            )
            "#,
            params![
                account.id.0,
                account.email,
                account.provider.as_str(),
                account.status.as_str(),
                account.sync_status.as_str(),
                credentials,
                account.foreign_id,
                sync_config,
                account.last_sync_at.map(|t| t.to_rfc3339()),
                account.last_error,
                account.sync_cursor,
                push_subscription,
                now,
                now,
            ],
        )?;

        Ok(())
    })
    .await
}

/// Retrieves an account by its ID.
pub async fn get_by_id(db: &Database, account_id: &AccountId) -> Result<Option<EmailAccount>> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE id = ?1"))?;
        let result = stmt.query_row([&account_id.0], row_to_account).optional()?;
        Ok(result)
    })
    .await
}

/// Retrieves the account a provider identifies by `identity`.
pub async fn get_by_provider_identity(
    db: &Database,
    kind: ProviderKind,
    identity: &str,
) -> Result<Option<EmailAccount>> {
    let identity = identity.to_string();

    db.with_conn(move |conn| {
        let result = match kind {
            ProviderKind::Unified => {
                let mut stmt = conn.prepare(&format!("{SELECT_COLUMNS} WHERE foreign_id = ?1"))?;
                stmt.query_row([&identity], row_to_account).optional()?
            }
            _ => {
                let mut stmt = conn.prepare(&format!(
                    "{SELECT_COLUMNS} WHERE provider = ?1 AND email = ?2 COLLATE NOCASE"
                ))?;
                stmt.query_row(params![kind.as_str(), identity], row_to_account)
                    .optional()?
            }
        };
        Ok(result)
    })
    .await
}

/// Runs an UPDATE against one account row and reports whether it existed.
async fn update_row(
    db: &Database,
    account_id: &AccountId,
    sql: &'static str,
    value: Option<String>,
) -> Result<bool> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let now = Utc::now().to_rfc3339();
        let changed = conn.execute(sql, params![value, now, account_id.0])?;
        Ok(changed > 0)
    })
    .await
}

fn row_to_account(row: &Row<'_>) -> rusqlite::Result<EmailAccount> {
    let credentials: Credentials = json_column(row, 5)?;
    let push_subscription: Option<PushSubscription> = optional_json_column(row, 11)?;

    Ok(EmailAccount {
        id: AccountId(row.get(0)?),
        email: row.get(1)?,
        provider: enum_column(row, 2, ProviderKind::parse)?,
        status: enum_column(row, 3, AccountStatus::parse)?,
        sync_status: enum_column(row, 4, SyncStatus::parse)?,
        credentials,
        foreign_id: row.get(6)?,
        sync_config: json_column(row, 7)?,
        last_sync_at: optional_time_column(row, 8)?,
        last_error: row.get(9)?,
        sync_cursor: row.get(10)?,
        push_subscription,
    })
}

fn require(found: bool, account_id: &AccountId) -> StoreResult<()> {
    if found {
        Ok(())
    } else {
        Err(StoreError::NotFound(format!("account {account_id}")))
    }
}

#[async_trait]
impl AccountStore for Database {
    async fn get_account(&self, id: &AccountId) -> StoreResult<Option<EmailAccount>> {
        Ok(get_by_id(self, id).await?)
    }

    async fn find_by_provider_identity(
        &self,
        kind: ProviderKind,
        identity: &str,
    ) -> StoreResult<Option<EmailAccount>> {
        Ok(get_by_provider_identity(self, kind, identity).await?)
    }

    async fn update_account_status(
        &self,
        id: &AccountId,
        status: SyncStatus,
        last_error: Option<String>,
    ) -> StoreResult<()> {
        let account_id = id.clone();
        let found = self
            .with_conn(move |conn| {
                let now = Utc::now().to_rfc3339();
                let changed = conn.execute(
                    "UPDATE accounts SET sync_status = ?1, last_error = ?2, updated_at = ?3 WHERE id = ?4",
                    params![status.as_str(), last_error, now, account_id.0],
                )?;
                Ok(changed > 0)
            })
            .await?;
        require(found, id)
    }

    async fn update_last_sync(&self, id: &AccountId, at: DateTime<Utc>) -> StoreResult<()> {
        let found = update_row(
            self,
            id,
            "UPDATE accounts SET last_sync_at = ?1, updated_at = ?2 WHERE id = ?3",
            Some(at.to_rfc3339()),
        )
        .await?;
        require(found, id)
    }

    async fn update_credentials(
        &self,
        id: &AccountId,
        credentials: Credentials,
    ) -> StoreResult<()> {
        let json = serde_json::to_string(&credentials)
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let found = update_row(
            self,
            id,
            "UPDATE accounts SET credentials_json = ?1, updated_at = ?2 WHERE id = ?3",
            Some(json),
        )
        .await?;
        require(found, id)
    }

    async fn update_sync_cursor(&self, id: &AccountId, cursor: Option<String>) -> StoreResult<()> {
        let found = update_row(
            self,
            id,
            "UPDATE accounts SET sync_cursor = ?1, updated_at = ?2 WHERE id = ?3",
            cursor,
        )
        .await?;
        require(found, id)
    }

    async fn update_push_subscription(
        &self,
        id: &AccountId,
        subscription: Option<PushSubscription>,
    ) -> StoreResult<()> {
        let json = subscription
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        let found = update_row(
            self,
            id,
            "UPDATE accounts SET push_subscription_json = ?1, updated_at = ?2 WHERE id = ?3",
            json,
        )
        .await?;
        require(found, id)
    }
}
