//! Wiring of the services into one engine.

use std::sync::Arc;

use super::conflict_service::ConflictService;
use super::reconciler::Reconciler;
use super::sync_service::SyncService;
use super::webhook_service::WebhookService;
use crate::config::Settings;
use crate::providers::email::AdapterRegistry;
use crate::storage::Stores;

/// The sync engine: polling, push ingestion and conflict handling over one
/// set of stores and adapters.
///
/// All three services share the same registry and stores, so a conflict
/// recorded by a webhook is visible to [`Engine::conflicts`] and a cursor
/// stored by real-time setup is used by the webhook path.
#[derive(Clone)]
pub struct Engine {
    sync: SyncService,
    webhooks: Arc<WebhookService>,
    conflicts: Arc<ConflictService>,
}

impl Engine {
    /// Builds the engine.
    pub fn new(stores: Stores, registry: AdapterRegistry, settings: &Settings) -> Self {
        let registry = Arc::new(registry);
        let sync_settings = settings.sync.clone();

        let conflicts = Arc::new(ConflictService::new(
            stores.accounts.clone(),
            stores.messages.clone(),
            stores.conflicts.clone(),
            registry.clone(),
        ));

        let reconciler = Reconciler::new(
            stores.messages.clone(),
            conflicts.clone(),
            sync_settings.reconcile_concurrency,
        )
        .detect_conflicts(sync_settings.detect_conflicts)
        .default_policy(sync_settings.default_conflict_policy);

        let webhooks = WebhookService::new(
            stores.accounts.clone(),
            stores.messages,
            registry.clone(),
            conflicts.clone(),
            sync_settings.detect_conflicts,
        )
        .default_policy(sync_settings.default_conflict_policy);

        let sync = SyncService::new(
            stores.accounts,
            stores.logs,
            registry,
            reconciler,
            sync_settings,
            settings.push.callback_url.clone(),
        );

        Self {
            sync,
            webhooks: Arc::new(webhooks),
            conflicts,
        }
    }

    /// Polling sync, real-time setup and outbound operations.
    pub fn sync(&self) -> &SyncService {
        &self.sync
    }

    /// Push notification ingestion.
    pub fn webhooks(&self) -> &WebhookService {
        &self.webhooks
    }

    /// Conflict inspection and resolution.
    pub fn conflicts(&self) -> &ConflictService {
        &self.conflicts
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}
