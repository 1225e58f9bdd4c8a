//! Message replica operations.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::{json_column, optional_json_column, time_column};
use crate::domain::{AccountId, EmailMessage, LocalMessageId, MessageId, StoredMessage};
use crate::storage::database::{Database, Result};
use crate::storage::{MessageStore, MessageUpdate, StoreError, StoreResult};

/// Retrieves a message by account and provider-native id.
pub async fn get_by_external_id(
    db: &Database,
    account_id: &AccountId,
    external_id: &MessageId,
) -> Result<Option<StoredMessage>> {
    let account_id = account_id.clone();
    let external_id = external_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, account_id, message_json, synced_fields_json, updated_at
            FROM messages
            WHERE account_id = ?1 AND external_id = ?2
            "#,
        )?;

        let result = stmt
            .query_row(params![account_id.0, external_id.0], row_to_message)
            .optional()?;

        Ok(result)
    })
    .await
}

/// Lists all messages of an account, newest first.
pub async fn list_by_account(db: &Database, account_id: &AccountId) -> Result<Vec<StoredMessage>> {
    let account_id = account_id.clone();

    db.with_conn(move |conn| {
        let mut stmt = conn.prepare(
            r#"
            SELECT id, account_id, message_json, synced_fields_json, updated_at
            FROM messages
            WHERE account_id = ?1
            ORDER BY date DESC
            "#,
        )?;

        let messages = stmt
            .query_map([&account_id.0], row_to_message)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(messages)
    })
    .await
}

/// Inserts a message unless one with the same external id exists.
///
/// Returns `None` when the message is already present.
pub async fn insert(
    db: &Database,
    account_id: &AccountId,
    message: &EmailMessage,
) -> Result<Option<LocalMessageId>> {
    let account_id = account_id.clone();
    let message = message.clone();

    db.with_conn(move |conn| {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM messages WHERE account_id = ?1 AND external_id = ?2)",
            params![account_id.0, message.id.0],
            |row| row.get(0),
        )?;
        if exists {
            return Ok(None);
        }

        let id = LocalMessageId::generate();
        let now = Utc::now().to_rfc3339();
        let message_json = serde_json::to_string(&message)?;
        let synced_json = serde_json::to_string(&message.tracked_fields())?;

        conn.execute(
            r#"
            INSERT INTO messages (
                id, account_id, external_id, thread_id, message_json, synced_fields_json,
                date, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                id.0,
                account_id.0,
                message.id.0,
                message.thread_id.0,
                message_json,
                synced_json,
                message.date.to_rfc3339(),
                now,
                now,
            ],
        )?;

        Ok(Some(id))
    })
    .await
}

/// Applies an update to a stored message. Returns false if it does not exist.
pub async fn update(db: &Database, id: &LocalMessageId, update: &MessageUpdate) -> Result<bool> {
    let id = id.clone();
    let update = update.clone();

    db.with_conn(move |conn| {
        let raw: Option<String> = conn
            .query_row(
                "SELECT message_json FROM messages WHERE id = ?1",
                [&id.0],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = raw else {
            return Ok(false);
        };

        let mut message: EmailMessage = serde_json::from_str(&raw)?;
        message.apply_tracked_fields(&update.fields);
        let message_json = serde_json::to_string(&message)?;
        let now = Utc::now().to_rfc3339();

        match &update.synced_fields {
            Some(snapshot) => {
                let synced_json = serde_json::to_string(snapshot)?;
                conn.execute(
                    "UPDATE messages SET message_json = ?1, synced_fields_json = ?2, updated_at = ?3 WHERE id = ?4",
                    params![message_json, synced_json, now, id.0],
                )?;
            }
            None => {
                conn.execute(
                    "UPDATE messages SET message_json = ?1, updated_at = ?2 WHERE id = ?3",
                    params![message_json, now, id.0],
                )?;
            }
        }

        Ok(true)
    })
    .await
}

/// Deletes messages by external id.
pub async fn delete_by_external_id(
    db: &Database,
    account_id: &AccountId,
    external_id: &MessageId,
) -> Result<u32> {
    let account_id = account_id.clone();
    let external_id = external_id.clone();

    db.with_conn(move |conn| {
        let removed = conn.execute(
            "DELETE FROM messages WHERE account_id = ?1 AND external_id = ?2",
            params![account_id.0, external_id.0],
        )?;
        Ok(removed as u32)
    })
    .await
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
    Ok(StoredMessage {
        id: LocalMessageId(row.get(0)?),
        account_id: AccountId(row.get(1)?),
        message: json_column(row, 2)?,
        synced_fields: optional_json_column(row, 3)?,
        updated_at: time_column(row, 4)?,
    })
}

#[async_trait]
impl MessageStore for Database {
    async fn find_by_external_id(
        &self,
        account_id: &AccountId,
        external_id: &MessageId,
    ) -> StoreResult<Option<StoredMessage>> {
        Ok(get_by_external_id(self, account_id, external_id).await?)
    }

    async fn create_message(
        &self,
        account_id: &AccountId,
        message: &EmailMessage,
    ) -> StoreResult<LocalMessageId> {
        insert(self, account_id, message).await?.ok_or_else(|| {
            StoreError::AlreadyExists(format!("message {} in account {account_id}", message.id))
        })
    }

    async fn update_message(&self, id: &LocalMessageId, change: &MessageUpdate) -> StoreResult<()> {
        if update(self, id, change).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(format!("message {id}")))
        }
    }

    async fn delete_messages(
        &self,
        account_id: &AccountId,
        external_id: &MessageId,
    ) -> StoreResult<u32> {
        Ok(delete_by_external_id(self, account_id, external_id).await?)
    }
}
