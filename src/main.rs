//! mailsync - Runs a polling sync for the given accounts
//!
//! Usage: `mailsync <account-id>...`
//!
//! Settings are read from `$MAILSYNC_CONFIG` when set, otherwise from the
//! platform config directory.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use mailsync::config::Settings;
use mailsync::domain::AccountId;
use mailsync::providers::email::AdapterRegistry;
use mailsync::services::SyncOptions;
use mailsync::storage::{AesGcmCodec, Database, Stores};
use mailsync::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let account_ids: Vec<AccountId> = std::env::args().skip(1).map(AccountId::from).collect();
    if account_ids.is_empty() {
        bail!("usage: mailsync <account-id>...");
    }

    let settings = match std::env::var_os("MAILSYNC_CONFIG") {
        Some(path) => Settings::load(&path)
            .with_context(|| format!("loading settings from {}", path.to_string_lossy()))?,
        None => Settings::load_default().context("loading settings")?,
    };

    let db_path = settings.storage.resolved_database_path()?;
    let db = Arc::new(
        Database::open(&db_path)
            .await
            .with_context(|| format!("opening {}", db_path.display()))?,
    );

    let key = settings
        .storage
        .credential_key
        .as_deref()
        .context("storage.credential_key is not set")?;
    let codec = Arc::new(AesGcmCodec::from_hex(key).context("invalid credential key")?);

    let stores = Stores::single(db);
    let registry = AdapterRegistry::from_settings(&settings, stores.accounts.clone(), codec)
        .context("building provider adapters")?;
    let engine = Engine::new(stores, registry, &settings);

    tracing::info!(accounts = account_ids.len(), "starting sync");

    let mut failed = 0;
    for (account_id, outcome) in engine
        .sync()
        .sync_many(&account_ids, SyncOptions::default())
        .await
    {
        match outcome {
            Ok(result) => println!("{}", serde_json::to_string_pretty(&*result)?),
            Err(e) => {
                failed += 1;
                tracing::error!(account_id = %account_id, error = %e, "sync failed");
            }
        }
    }

    if failed > 0 {
        bail!("{failed} of {} accounts failed to sync", account_ids.len());
    }
    Ok(())
}
