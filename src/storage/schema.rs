//! SQL schema definitions as const strings.

/// SQL to create the accounts table.
pub const CREATE_ACCOUNTS: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    email TEXT NOT NULL,
    provider TEXT NOT NULL,
    status TEXT NOT NULL,
    sync_status TEXT NOT NULL,
    credentials_json TEXT NOT NULL,
    foreign_id TEXT,
    sync_config_json TEXT NOT NULL,
    last_sync_at TEXT,
    last_error TEXT,
    sync_cursor TEXT,
    push_subscription_json TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

/// SQL to create account indexes.
pub const CREATE_ACCOUNT_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_accounts_foreign_id ON accounts(foreign_id);
CREATE INDEX IF NOT EXISTS idx_accounts_email ON accounts(email COLLATE NOCASE)
"#;

/// SQL to create the messages table.
///
/// The canonical message is stored as JSON; the external id is a column so
/// reconciliation lookups hit the unique index.
pub const CREATE_MESSAGES: &str = r#"
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id),
    external_id TEXT NOT NULL,
    thread_id TEXT NOT NULL,
    message_json TEXT NOT NULL,
    synced_fields_json TEXT,
    date TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(account_id, external_id)
)
"#;

/// SQL to create message indexes.
pub const CREATE_MESSAGE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_messages_thread ON messages(thread_id);
CREATE INDEX IF NOT EXISTS idx_messages_date ON messages(date DESC)
"#;

/// SQL to create the sync log table.
pub const CREATE_SYNC_LOGS: &str = r#"
CREATE TABLE IF NOT EXISTS sync_logs (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id),
    sync_type TEXT NOT NULL,
    status TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    added INTEGER NOT NULL DEFAULT 0,
    updated INTEGER NOT NULL DEFAULT 0,
    deleted INTEGER NOT NULL DEFAULT 0,
    errors INTEGER NOT NULL DEFAULT 0,
    error TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT
)
"#;

/// SQL to create the sync conflict table.
pub const CREATE_SYNC_CONFLICTS: &str = r#"
CREATE TABLE IF NOT EXISTS sync_conflicts (
    id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id),
    conflict_type TEXT NOT NULL,
    status TEXT NOT NULL,
    local_json TEXT NOT NULL,
    remote_json TEXT,
    fields_json TEXT NOT NULL,
    resolution_json TEXT,
    detected_at TEXT NOT NULL
)
"#;

/// SQL to create log and conflict indexes.
pub const CREATE_AUDIT_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_sync_logs_account ON sync_logs(account_id, started_at);
CREATE INDEX IF NOT EXISTS idx_sync_conflicts_account ON sync_conflicts(account_id, status)
"#;

/// Returns all migrations in order.
pub fn all_migrations() -> Vec<&'static str> {
    vec![
        CREATE_ACCOUNTS,
        CREATE_ACCOUNT_INDEXES,
        CREATE_MESSAGES,
        CREATE_MESSAGE_INDEXES,
        CREATE_SYNC_LOGS,
        CREATE_SYNC_CONFLICTS,
        CREATE_AUDIT_INDEXES,
    ]
}
