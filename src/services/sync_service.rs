//! Sync service for email synchronization.
//!
//! The [`SyncService`] runs one sync per account at a time: it selects a
//! provider adapter, fetches remote messages (backing off on rate limits),
//! reconciles them into the local replica and records the run in a sync log.
//! It also provisions and tears down push subscriptions for real-time sync.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use super::reconciler::Reconciler;
use crate::config::SyncSettings;
use crate::domain::{
    AccountId, EmailAccount, MessageId, ProviderKind, PushSubscription, SyncCounters, SyncLogId,
    SyncLogStatus, SyncStatus, SyncType,
};
use crate::providers::email::{
    AdapterRegistry, FetchBatch, FetchOptions, OutgoingEmail, ProviderAdapter, ProviderError,
    SentMessage, UnsupportedProvider,
};
use crate::storage::{AccountStore, StoreError, SyncLogStore};

/// Errors that end a sync run or a sync-related request.
///
/// Cloneable so every caller sharing an in-flight run receives the same error.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// No account with that id.
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    /// The account is not active.
    #[error("account is not active: {0}")]
    AccountInactive(AccountId),

    /// No adapter can serve the account.
    #[error(transparent)]
    UnsupportedProvider(#[from] UnsupportedProvider),

    /// The provider failed the run.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// A store failed outside a single message.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Required configuration is missing.
    #[error("not configured: {0}")]
    NotConfigured(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

/// Per-call overrides. Unset values fall back to the account's sync config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub full_sync: Option<bool>,
    pub max_emails: Option<u32>,
    pub folder_scope: Option<String>,
    /// Adapter to use instead of the registry's default choice.
    pub preferred_adapter: Option<ProviderKind>,
}

impl SyncOptions {
    /// Options for a full sync.
    pub fn full() -> Self {
        Self {
            full_sync: Some(true),
            ..Default::default()
        }
    }
}

/// Result of a sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub account_id: AccountId,
    /// True when no message failed.
    pub success: bool,
    pub emails_processed: u32,
    pub emails_added: u32,
    pub emails_updated: u32,
    pub emails_deleted: u32,
    pub errors_count: u32,
    pub conflicts_detected: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl SyncResult {
    /// Counters as recorded in the sync log.
    pub fn counters(&self) -> SyncCounters {
        SyncCounters {
            processed: self.emails_processed,
            added: self.emails_added,
            updated: self.emails_updated,
            deleted: self.emails_deleted,
            errors: self.errors_count,
        }
    }
}

/// Event emitted by the sync service.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Sync started for an account.
    Started(AccountId),
    /// Sync completed.
    Completed(Arc<SyncResult>),
    /// Sync failed.
    Failed(AccountId, String),
}

type SharedRun = Shared<BoxFuture<'static, Result<Arc<SyncResult>>>>;

/// Sync service for managing email synchronization.
///
/// # Concurrency
///
/// At most one run per account is in flight. A call that arrives while a
/// run is in progress awaits that run and receives the same
/// `Arc<SyncResult>` (or the same error). Runs execute on their own task, so
/// a run always finishes and finalizes its log even if every caller stops
/// waiting.
///
/// # Example
///
/// ```ignore
/// let service = SyncService::new(accounts, logs, registry, reconciler, settings, None);
///
/// let result = service.sync_account(&account_id, SyncOptions::default()).await?;
/// println!("added {} messages", result.emails_added);
/// ```
#[derive(Clone)]
pub struct SyncService {
    inner: Arc<Inner>,
}

struct Inner {
    accounts: Arc<dyn AccountStore>,
    logs: Arc<dyn SyncLogStore>,
    registry: Arc<AdapterRegistry>,
    reconciler: Reconciler,
    settings: SyncSettings,
    callback_url: Option<String>,
    in_flight: DashMap<AccountId, SharedRun>,
    event_sender: broadcast::Sender<SyncEvent>,
}

/// Removes the in-flight entry when the run ends, however it ends.
struct InFlightGuard {
    inner: Arc<Inner>,
    account_id: AccountId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.remove(&self.account_id);
    }
}

impl SyncService {
    /// Creates a new SyncService.
    ///
    /// `callback_url` is where providers deliver push notifications; real-time
    /// sync is unavailable without it.
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        logs: Arc<dyn SyncLogStore>,
        registry: Arc<AdapterRegistry>,
        reconciler: Reconciler,
        settings: SyncSettings,
        callback_url: Option<String>,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            inner: Arc::new(Inner {
                accounts,
                logs,
                registry,
                reconciler,
                settings,
                callback_url,
                in_flight: DashMap::new(),
                event_sender,
            }),
        }
    }

    /// Subscribes to sync events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.event_sender.subscribe()
    }

    /// Whether a run is currently in flight for the account.
    pub fn is_syncing(&self, account_id: &AccountId) -> bool {
        self.inner.in_flight.contains_key(account_id)
    }

    /// Synchronizes a single account.
    ///
    /// Joins the in-flight run for the account if there is one.
    pub async fn sync_account(
        &self,
        account_id: &AccountId,
        options: SyncOptions,
    ) -> Result<Arc<SyncResult>> {
        let run = match self.inner.in_flight.entry(account_id.clone()) {
            Entry::Occupied(entry) => {
                tracing::debug!(account_id = %account_id, "joining in-flight sync");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let inner = Arc::clone(&self.inner);
                let id = account_id.clone();
                let handle = tokio::spawn(async move {
                    let _guard = InFlightGuard {
                        inner: Arc::clone(&inner),
                        account_id: id.clone(),
                    };
                    inner.run(&id, options).await.map(Arc::new)
                });

                let run = async move {
                    handle
                        .await
                        .unwrap_or_else(|e| Err(SyncError::Internal(format!("sync task failed: {e}"))))
                }
                .boxed()
                .shared();
                entry.insert(run.clone());
                run
            }
        };

        run.await
    }

    /// Syncs several accounts concurrently.
    pub async fn sync_many(
        &self,
        account_ids: &[AccountId],
        options: SyncOptions,
    ) -> Vec<(AccountId, Result<Arc<SyncResult>>)> {
        let runs = account_ids
            .iter()
            .map(|id| self.sync_account(id, options.clone()));
        account_ids.iter().cloned().zip(join_all(runs).await).collect()
    }

    /// Registers a push subscription so remote changes arrive as webhooks.
    pub async fn start_real_time_sync(&self, account_id: &AccountId) -> Result<PushSubscription> {
        let callback_url = self.inner.callback_url()?;
        let (account, adapter) = self.inner.adapter_for(account_id).await?;

        let subscription = adapter.setup_push(&account, callback_url.as_str()).await?;
        let accounts = &self.inner.accounts;
        accounts
            .update_push_subscription(account_id, Some(subscription.clone()))
            .await?;
        if account.sync_cursor.is_none() && subscription.cursor.is_some() {
            accounts
                .update_sync_cursor(account_id, subscription.cursor.clone())
                .await?;
        }

        tracing::info!(
            account_id = %account_id,
            subscription_id = %subscription.subscription_id,
            "real-time sync started"
        );
        Ok(subscription)
    }

    /// Removes the account's push subscription.
    pub async fn stop_real_time_sync(&self, account_id: &AccountId) -> Result<()> {
        let (account, adapter) = self.inner.adapter_for(account_id).await?;
        adapter.teardown_push(&account).await?;
        self.inner
            .accounts
            .update_push_subscription(account_id, None)
            .await?;
        tracing::info!(account_id = %account_id, "real-time sync stopped");
        Ok(())
    }

    /// Sends an email through the account's adapter.
    pub async fn send_email(
        &self,
        account_id: &AccountId,
        email: &OutgoingEmail,
    ) -> Result<SentMessage> {
        let (account, adapter) = self.inner.adapter_for(account_id).await?;
        Ok(adapter.send(&account, email).await?)
    }

    /// Downloads attachment bytes through the account's adapter.
    pub async fn download_attachment(
        &self,
        account_id: &AccountId,
        message_id: &MessageId,
        attachment_id: &str,
    ) -> Result<Vec<u8>> {
        let (account, adapter) = self.inner.adapter_for(account_id).await?;
        Ok(adapter
            .download_attachment(&account, message_id, attachment_id)
            .await?)
    }
}

impl std::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncService")
            .field("in_flight", &self.inner.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl Inner {
    /// The configured push callback, which must be an absolute http(s) URL.
    fn callback_url(&self) -> Result<url::Url> {
        let raw = self
            .callback_url
            .as_deref()
            .ok_or_else(|| SyncError::NotConfigured("push callback url".to_string()))?;
        let parsed = url::Url::parse(raw)
            .map_err(|e| SyncError::NotConfigured(format!("push callback url {raw:?}: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => Ok(parsed),
            other => Err(SyncError::NotConfigured(format!(
                "push callback url must be http(s), got {other}"
            ))),
        }
    }

    async fn active_account(&self, account_id: &AccountId) -> Result<EmailAccount> {
        let account = self
            .accounts
            .get_account(account_id)
            .await?
            .ok_or_else(|| SyncError::AccountNotFound(account_id.clone()))?;
        if !account.is_active() {
            return Err(SyncError::AccountInactive(account_id.clone()));
        }
        Ok(account)
    }

    async fn adapter_for(
        &self,
        account_id: &AccountId,
    ) -> Result<(EmailAccount, Arc<dyn ProviderAdapter>)> {
        let account = self.active_account(account_id).await?;
        let adapter = self.registry.select(&account, None)?;
        Ok((account, adapter))
    }

    /// One complete run: log, status bookkeeping, fetch and reconcile.
    async fn run(&self, account_id: &AccountId, options: SyncOptions) -> Result<SyncResult> {
        let account = self.active_account(account_id).await?;

        let full_sync =
            options.full_sync.unwrap_or(account.sync_config.full_sync) || account.last_sync_at.is_none();
        let sync_type = if full_sync {
            SyncType::Full
        } else {
            SyncType::Incremental
        };

        let log_id = self.logs.create_log(account_id, sync_type).await?;
        let _ = self.event_sender.send(SyncEvent::Started(account_id.clone()));
        tracing::info!(account_id = %account_id, log_id = %log_id, sync_type = sync_type.as_str(), "sync started");

        let started_at = Utc::now();
        let outcome = self
            .execute(&account, &options, full_sync, started_at)
            .await;

        match &outcome {
            Ok(result) => self.finish(&log_id, result).await,
            Err(e) => self.fail(account_id, &log_id, e).await,
        }
        outcome
    }

    async fn execute(
        &self,
        account: &EmailAccount,
        options: &SyncOptions,
        full_sync: bool,
        started_at: DateTime<Utc>,
    ) -> Result<SyncResult> {
        self.accounts
            .update_account_status(&account.id, SyncStatus::Syncing, None)
            .await?;

        let adapter = self.registry.select(account, options.preferred_adapter)?;
        let fetch_options = FetchOptions {
            max_emails: options
                .max_emails
                .unwrap_or(account.sync_config.max_emails)
                .min(self.settings.max_emails_per_sync),
            folder_scope: options
                .folder_scope
                .clone()
                .or_else(|| account.sync_config.folder_scope.clone()),
            full_sync,
            since: if full_sync { None } else { account.last_sync_at },
        };

        let batch = self
            .fetch_with_backoff(adapter.as_ref(), account, &fetch_options)
            .await?;
        let fetch_errors = batch.failures.len() as u32;
        let report = self.reconciler.reconcile(&account.id, batch.messages).await;

        let errors_count = report.errors + fetch_errors;
        Ok(SyncResult {
            account_id: account.id.clone(),
            success: errors_count == 0,
            emails_processed: report.processed + fetch_errors,
            emails_added: report.added,
            emails_updated: report.updated,
            emails_deleted: 0,
            errors_count,
            conflicts_detected: report.conflicts,
            started_at,
            completed_at: Utc::now(),
        })
    }

    /// Fetches, retrying rate-limited attempts with exponential backoff.
    async fn fetch_with_backoff(
        &self,
        adapter: &dyn ProviderAdapter,
        account: &EmailAccount,
        options: &FetchOptions,
    ) -> Result<FetchBatch> {
        let mut attempt = 0u32;
        loop {
            match adapter.fetch(account, options).await {
                Err(ProviderError::RateLimited { retry_after_secs })
                    if attempt < self.settings.max_retries =>
                {
                    let delay = self.settings.backoff(attempt, retry_after_secs);
                    attempt += 1;
                    tracing::warn!(
                        account_id = %account.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return Ok(other?),
            }
        }
    }

    async fn finish(&self, log_id: &SyncLogId, result: &SyncResult) {
        let account_id = &result.account_id;
        if let Err(e) = self
            .accounts
            .update_account_status(account_id, SyncStatus::Idle, None)
            .await
        {
            tracing::warn!(account_id = %account_id, error = %e, "failed to reset sync status");
        }
        if let Err(e) = self.accounts.update_last_sync(account_id, result.completed_at).await {
            tracing::warn!(account_id = %account_id, error = %e, "failed to stamp last sync");
        }
        if let Err(e) = self
            .logs
            .finalize_log(log_id, SyncLogStatus::Completed, &result.counters(), None)
            .await
        {
            tracing::warn!(account_id = %account_id, log_id = %log_id, error = %e, "failed to finalize sync log");
        }

        tracing::info!(
            account_id = %account_id,
            log_id = %log_id,
            processed = result.emails_processed,
            added = result.emails_added,
            updated = result.emails_updated,
            conflicts = result.conflicts_detected,
            errors = result.errors_count,
            "sync completed"
        );
        let _ = self
            .event_sender
            .send(SyncEvent::Completed(Arc::new(result.clone())));
    }

    async fn fail(&self, account_id: &AccountId, log_id: &SyncLogId, error: &SyncError) {
        tracing::error!(account_id = %account_id, log_id = %log_id, error = %error, "sync failed");

        if let Err(e) = self
            .accounts
            .update_account_status(account_id, SyncStatus::Error, Some(error.to_string()))
            .await
        {
            tracing::warn!(account_id = %account_id, error = %e, "failed to record sync error");
        }
        if let Err(e) = self
            .logs
            .finalize_log(
                log_id,
                SyncLogStatus::Failed,
                &SyncCounters::default(),
                Some(error.to_string()),
            )
            .await
        {
            tracing::warn!(account_id = %account_id, log_id = %log_id, error = %e, "failed to finalize sync log");
        }
        let _ = self
            .event_sender
            .send(SyncEvent::Failed(account_id.clone(), error.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EmailMessage, PushStatus, TrackedFields};
    use crate::providers::email::{FetchFailure, UnimplementedAdapter};
    use crate::services::ConflictService;
    use crate::storage::{MemoryStore, Stores};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Scripted adapter: returns a fixed batch, optionally after rate limits
    /// or a gate.
    struct ScriptedAdapter {
        messages: Vec<EmailMessage>,
        failures: Vec<FetchFailure>,
        rate_limits: AtomicU32,
        retry_after_secs: u64,
        fetches: AtomicU32,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedAdapter {
        fn new(messages: Vec<EmailMessage>) -> Self {
            Self {
                messages,
                failures: Vec::new(),
                rate_limits: AtomicU32::new(0),
                retry_after_secs: 0,
                fetches: AtomicU32::new(0),
                gate: None,
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn kind(&self) -> ProviderKind {
            ProviderKind::GmailLike
        }

        async fn fetch(
            &self,
            _account: &EmailAccount,
            _options: &FetchOptions,
        ) -> crate::providers::email::Result<FetchBatch> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.rate_limits.load(Ordering::SeqCst) > 0 {
                self.rate_limits.fetch_sub(1, Ordering::SeqCst);
                return Err(ProviderError::RateLimited {
                    retry_after_secs: Some(self.retry_after_secs),
                });
            }
            Ok(FetchBatch {
                messages: self.messages.clone(),
                failures: self.failures.clone(),
            })
        }

        async fn fetch_message(
            &self,
            _account: &EmailAccount,
            id: &MessageId,
        ) -> crate::providers::email::Result<EmailMessage> {
            Err(ProviderError::NotFound(id.to_string()))
        }

        async fn send(
            &self,
            _account: &EmailAccount,
            _email: &OutgoingEmail,
        ) -> crate::providers::email::Result<SentMessage> {
            Ok(SentMessage {
                message_id: MessageId::from("sent-1"),
                thread_id: None,
            })
        }

        async fn setup_push(
            &self,
            _account: &EmailAccount,
            callback_url: &str,
        ) -> crate::providers::email::Result<PushSubscription> {
            Ok(PushSubscription {
                subscription_id: callback_url.to_string(),
                status: PushStatus::Active,
                expires_at: None,
                cursor: Some("100".into()),
            })
        }

        async fn teardown_push(&self, _account: &EmailAccount) -> crate::providers::email::Result<()> {
            Ok(())
        }

        async fn download_attachment(
            &self,
            _account: &EmailAccount,
            _message_id: &MessageId,
            _attachment_id: &str,
        ) -> crate::providers::email::Result<Vec<u8>> {
            Ok(vec![7])
        }

        async fn push_state(
            &self,
            _account: &EmailAccount,
            _message_id: &MessageId,
            _desired: &TrackedFields,
            _current: &TrackedFields,
        ) -> crate::providers::email::Result<()> {
            Ok(())
        }
    }

    fn message(id: &str) -> EmailMessage {
        let mut message = EmailMessage::new(id, "t1");
        message.subject = format!("Subject {id}");
        message
    }

    async fn service(adapter: Arc<dyn ProviderAdapter>) -> (SyncService, Arc<MemoryStore>, AccountId) {
        service_with_callback(adapter, Some("https://hooks.example.com/push")).await
    }

    async fn service_with_callback(
        adapter: Arc<dyn ProviderAdapter>,
        callback_url: Option<&str>,
    ) -> (SyncService, Arc<MemoryStore>, AccountId) {
        let store = Arc::new(MemoryStore::new());
        let account = EmailAccount::new("a1", "me@example.com", ProviderKind::GmailLike);
        store.insert_account(account.clone()).await;

        let stores = Stores::single(store.clone());
        let registry = Arc::new(
            AdapterRegistry::new()
                .with(adapter)
                .with(Arc::new(UnimplementedAdapter::new(ProviderKind::Imap))),
        );
        let conflicts = Arc::new(ConflictService::new(
            stores.accounts.clone(),
            stores.messages.clone(),
            stores.conflicts.clone(),
            registry.clone(),
        ));
        let reconciler = Reconciler::new(stores.messages.clone(), conflicts, 4);
        let settings = SyncSettings {
            retry_delay_secs: 0,
            max_retry_delay_secs: 0,
            ..Default::default()
        };
        let service = SyncService::new(
            stores.accounts,
            stores.logs,
            registry,
            reconciler,
            settings,
            callback_url.map(str::to_string),
        );
        (service, store, account.id)
    }

    #[tokio::test]
    async fn sync_adds_messages_and_finalizes_log() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![message("m1"), message("m2")]));
        let (service, store, account_id) = service(adapter).await;
        let mut events = service.subscribe();

        let result = service
            .sync_account(&account_id, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(result.emails_added, 2);
        assert_eq!(result.emails_processed, 2);
        assert!(result.success);

        let logs = store.logs_for(&account_id).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, SyncLogStatus::Completed);
        assert_eq!(logs[0].counters.added, 2);

        let account = store.get_account(&account_id).await.unwrap().unwrap();
        assert_eq!(account.sync_status, SyncStatus::Idle);
        assert!(account.last_sync_at.is_some());

        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Started(_)));
        assert!(matches!(events.recv().await.unwrap(), SyncEvent::Completed(_)));
    }

    #[tokio::test]
    async fn concurrent_calls_share_one_run() {
        let gate = Arc::new(Notify::new());
        let adapter = Arc::new(ScriptedAdapter {
            gate: Some(gate.clone()),
            ..ScriptedAdapter::new(vec![message("m1")])
        });
        let (service, _store, account_id) = service(adapter.clone()).await;

        let first = tokio::spawn({
            let service = service.clone();
            let id = account_id.clone();
            async move { service.sync_account(&id, SyncOptions::default()).await }
        });
        while adapter.fetches.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        assert!(service.is_syncing(&account_id));

        let second = tokio::spawn({
            let service = service.clone();
            let id = account_id.clone();
            async move { service.sync_account(&id, SyncOptions::default()).await }
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        gate.notify_one();

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(adapter.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_and_inactive_accounts_fail_without_log() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![]));
        let (service, store, account_id) = service(adapter).await;

        let err = service
            .sync_account(&AccountId::from("missing"), SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AccountNotFound(_)));

        let mut account = store.get_account(&account_id).await.unwrap().unwrap();
        account.status = crate::domain::AccountStatus::Inactive;
        store.insert_account(account).await;
        let err = tokio_test::assert_err!(
            service
                .sync_account(&account_id, SyncOptions::default())
                .await
        );
        assert!(matches!(err, SyncError::AccountInactive(_)));
        assert!(store.logs_for(&account_id).await.is_empty());
    }

    #[tokio::test]
    async fn rate_limits_are_retried() {
        let adapter = Arc::new(ScriptedAdapter {
            rate_limits: AtomicU32::new(2),
            ..ScriptedAdapter::new(vec![message("m1")])
        });
        let (service, _store, account_id) = service(adapter.clone()).await;

        let result = tokio_test::assert_ok!(
            service
                .sync_account(&account_id, SyncOptions::default())
                .await
        );
        assert_eq!(result.emails_added, 1);
        assert_eq!(adapter.fetches.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn long_retry_after_is_capped() {
        let adapter = Arc::new(ScriptedAdapter {
            rate_limits: AtomicU32::new(1),
            retry_after_secs: 86_400,
            ..ScriptedAdapter::new(vec![message("m1")])
        });
        let (service, _store, account_id) = service(adapter.clone()).await;

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            service.sync_account(&account_id, SyncOptions::default()),
        )
        .await
        .expect("backoff should be capped");
        assert_eq!(result.unwrap().emails_added, 1);
        assert_eq!(adapter.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_run() {
        let adapter = Arc::new(ScriptedAdapter {
            rate_limits: AtomicU32::new(10),
            ..ScriptedAdapter::new(vec![message("m1")])
        });
        let (service, store, account_id) = service(adapter).await;

        let err = service
            .sync_account(&account_id, SyncOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Provider(ProviderError::RateLimited { .. })
        ));

        let logs = store.logs_for(&account_id).await;
        assert_eq!(logs[0].status, SyncLogStatus::Failed);
        assert!(logs[0].error.is_some());
        let account = store.get_account(&account_id).await.unwrap().unwrap();
        assert_eq!(account.sync_status, SyncStatus::Error);
        assert!(account.last_error.is_some());
        assert!(!service.is_syncing(&account_id));
    }

    #[tokio::test]
    async fn fetch_failures_are_counted_as_processed_errors() {
        let adapter = Arc::new(ScriptedAdapter {
            failures: vec![FetchFailure {
                message_id: MessageId::from("m9"),
                error: ProviderError::Timeout("slow".into()),
            }],
            ..ScriptedAdapter::new(vec![message("m1")])
        });
        let (service, _store, account_id) = service(adapter).await;

        let result = service
            .sync_account(&account_id, SyncOptions::default())
            .await
            .unwrap();
        assert_eq!(result.emails_processed, 2);
        assert_eq!(result.errors_count, 1);
        assert!(!result.success);
    }

    #[tokio::test]
    async fn unsupported_preferred_adapter_fails_the_run() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![]));
        let (service, store, account_id) = service(adapter).await;

        let options = SyncOptions {
            preferred_adapter: Some(ProviderKind::Unified),
            ..Default::default()
        };
        let err = service.sync_account(&account_id, options).await.unwrap_err();
        assert!(matches!(err, SyncError::UnsupportedProvider(_)));
        assert_eq!(store.logs_for(&account_id).await[0].status, SyncLogStatus::Failed);
    }

    #[tokio::test]
    async fn real_time_sync_records_subscription_and_cursor() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![]));
        let (service, store, account_id) = service(adapter).await;

        let subscription = service.start_real_time_sync(&account_id).await.unwrap();
        assert_eq!(subscription.subscription_id, "https://hooks.example.com/push");

        let account = store.get_account(&account_id).await.unwrap().unwrap();
        assert_eq!(account.push_subscription, Some(subscription));
        assert_eq!(account.sync_cursor.as_deref(), Some("100"));

        service.stop_real_time_sync(&account_id).await.unwrap();
        let account = store.get_account(&account_id).await.unwrap().unwrap();
        assert!(account.push_subscription.is_none());
    }

    #[tokio::test]
    async fn real_time_sync_needs_a_usable_callback() {
        for callback in [None, Some("not a url"), Some("ftp://hooks.example.com")] {
            let adapter = Arc::new(ScriptedAdapter::new(vec![]));
            let (service, store, account_id) = service_with_callback(adapter, callback).await;

            let err = service.start_real_time_sync(&account_id).await.unwrap_err();
            assert!(matches!(err, SyncError::NotConfigured(_)), "{callback:?}: {err}");
            let account = store.get_account(&account_id).await.unwrap().unwrap();
            assert!(account.push_subscription.is_none());
        }
    }

    #[tokio::test]
    async fn send_and_download_go_through_the_adapter() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![]));
        let (service, _store, account_id) = service(adapter).await;

        let sent = service
            .send_email(&account_id, &OutgoingEmail::default())
            .await
            .unwrap();
        assert_eq!(sent.message_id, MessageId::from("sent-1"));

        let bytes = service
            .download_attachment(&account_id, &MessageId::from("m1"), "a1")
            .await
            .unwrap();
        assert_eq!(bytes, vec![7]);
    }
}
