//! Adapter registry and per-run adapter selection.

use std::collections::HashMap;
use std::sync::Arc;

use super::{GmailAdapter, ProviderAdapter, UnifiedAdapter, UnimplementedAdapter};
use crate::config::Settings;
use crate::domain::{EmailAccount, ProviderKind};
use crate::storage::{AccountStore, CredentialCodec};

/// No registered adapter can serve the account.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported provider {kind}: {reason}")]
pub struct UnsupportedProvider {
    pub kind: ProviderKind,
    pub reason: String,
}

impl UnsupportedProvider {
    fn new(kind: ProviderKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

/// Typed map from provider kind to adapter.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
    prefer_unified: bool,
    strict_native: bool,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the standard registry: Gmail-like, unified, and placeholder
    /// Exchange/IMAP adapters.
    pub fn from_settings(
        settings: &Settings,
        accounts: Arc<dyn AccountStore>,
        codec: Arc<dyn CredentialCodec>,
    ) -> super::Result<Self> {
        let registry = Self::new()
            .prefer_unified(settings.sync.prefer_unified)
            .strict_native(settings.sync.strict_native_adapters)
            .with(Arc::new(GmailAdapter::new(&settings.gmail, accounts, codec)?))
            .with(Arc::new(UnifiedAdapter::new(&settings.unified)?))
            .with(Arc::new(UnimplementedAdapter::new(ProviderKind::Exchange)))
            .with(Arc::new(UnimplementedAdapter::new(ProviderKind::Imap)));
        Ok(registry)
    }

    /// Routes every account through the unified adapter when set.
    pub fn prefer_unified(mut self, enabled: bool) -> Self {
        self.prefer_unified = enabled;
        self
    }

    /// Fails selection for placeholder adapters instead of running them.
    pub fn strict_native(mut self, enabled: bool) -> Self {
        self.strict_native = enabled;
        self
    }

    /// Registers an adapter under its own kind, replacing any previous one.
    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn get(&self, kind: ProviderKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(&kind).cloned()
    }

    /// Picks the adapter for one run.
    ///
    /// Precedence: an explicit `preferred` kind, then the unified adapter for
    /// accounts with a grant id, then the global unified preference, then the
    /// account's native provider.
    pub fn select(
        &self,
        account: &EmailAccount,
        preferred: Option<ProviderKind>,
    ) -> Result<Arc<dyn ProviderAdapter>, UnsupportedProvider> {
        if let Some(kind) = preferred {
            let serves = match kind {
                ProviderKind::Unified => account.foreign_id.is_some(),
                native => account.provider == native,
            };
            if !serves {
                return Err(UnsupportedProvider::new(
                    kind,
                    format!("cannot serve account {}", account.id),
                ));
            }
            return self.native_or_checked(kind, account);
        }

        if account.foreign_id.is_some() || self.prefer_unified {
            return self
                .get(ProviderKind::Unified)
                .ok_or_else(|| UnsupportedProvider::new(ProviderKind::Unified, "not registered"));
        }

        self.native_or_checked(account.provider, account)
    }

    fn native_or_checked(
        &self,
        kind: ProviderKind,
        account: &EmailAccount,
    ) -> Result<Arc<dyn ProviderAdapter>, UnsupportedProvider> {
        let adapter = self
            .get(kind)
            .ok_or_else(|| UnsupportedProvider::new(kind, "not registered"))?;

        if !adapter.is_implemented() {
            if self.strict_native {
                return Err(UnsupportedProvider::new(kind, "adapter not implemented"));
            }
            tracing::warn!(
                account_id = %account.id,
                provider = %kind,
                "native adapter not implemented, run will have no effect"
            );
        }
        Ok(adapter)
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("kinds", &self.adapters.keys().collect::<Vec<_>>())
            .field("prefer_unified", &self.prefer_unified)
            .field("strict_native", &self.strict_native)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UnifiedSettings;

    fn registry() -> AdapterRegistry {
        AdapterRegistry::new()
            .with(Arc::new(
                UnifiedAdapter::new(&UnifiedSettings::default()).unwrap(),
            ))
            .with(Arc::new(UnimplementedAdapter::new(ProviderKind::Exchange)))
            .with(Arc::new(UnimplementedAdapter::new(ProviderKind::Imap)))
    }

    fn account(provider: ProviderKind) -> EmailAccount {
        EmailAccount::new("a1", "x@example.com", provider)
    }

    fn rejected(
        result: Result<Arc<dyn ProviderAdapter>, UnsupportedProvider>,
    ) -> UnsupportedProvider {
        match result {
            Ok(adapter) => panic!("unexpectedly selected {}", adapter.kind()),
            Err(e) => e,
        }
    }

    #[test]
    fn grant_id_routes_to_unified() {
        let account = account(ProviderKind::Exchange).with_foreign_id("grant-1");
        let adapter = registry().select(&account, None).unwrap();
        assert_eq!(adapter.kind(), ProviderKind::Unified);
    }

    #[test]
    fn native_dispatch_without_grant() {
        let adapter = registry()
            .select(&account(ProviderKind::Imap), None)
            .unwrap();
        assert_eq!(adapter.kind(), ProviderKind::Imap);
        assert!(!adapter.is_implemented());
    }

    #[test]
    fn global_preference_routes_to_unified() {
        let adapter = registry()
            .prefer_unified(true)
            .select(&account(ProviderKind::Imap), None)
            .unwrap();
        assert_eq!(adapter.kind(), ProviderKind::Unified);
    }

    #[test]
    fn preferred_adapter_wins_when_it_can_serve() {
        let account = account(ProviderKind::Exchange).with_foreign_id("grant-1");
        let adapter = registry()
            .select(&account, Some(ProviderKind::Exchange))
            .unwrap();
        assert_eq!(adapter.kind(), ProviderKind::Exchange);
    }

    #[test]
    fn preferred_adapter_that_cannot_serve_is_rejected() {
        let err = rejected(
            registry().select(&account(ProviderKind::Imap), Some(ProviderKind::Unified)),
        );
        assert_eq!(err.kind, ProviderKind::Unified);

        let err = rejected(
            registry().select(&account(ProviderKind::Imap), Some(ProviderKind::Exchange)),
        );
        assert_eq!(err.kind, ProviderKind::Exchange);
    }

    #[test]
    fn unregistered_native_provider_is_unsupported() {
        let err = rejected(registry().select(&account(ProviderKind::GmailLike), None));
        assert_eq!(err.kind, ProviderKind::GmailLike);
    }

    #[test]
    fn strict_mode_rejects_placeholders() {
        let err = rejected(
            registry()
                .strict_native(true)
                .select(&account(ProviderKind::Exchange), None),
        );
        assert_eq!(err.reason, "adapter not implemented");
    }
}
