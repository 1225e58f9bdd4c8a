//! Placeholder adapters for native providers without an implementation.
//!
//! Exchange and IMAP mailboxes are reachable today only through the unified
//! API. Their native adapters are registered so that dispatch stays total,
//! but every read returns nothing and every write is a no-op.

use async_trait::async_trait;

use super::{
    FetchBatch, FetchOptions, OutgoingEmail, ProviderAdapter, ProviderError, Result, SentMessage,
};
use crate::domain::{
    EmailAccount, EmailMessage, MessageId, ProviderKind, PushStatus, PushSubscription,
    TrackedFields,
};

/// Zero-effect adapter for a native provider.
#[derive(Debug, Clone, Copy)]
pub struct UnimplementedAdapter {
    kind: ProviderKind,
}

impl UnimplementedAdapter {
    pub fn new(kind: ProviderKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl ProviderAdapter for UnimplementedAdapter {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn is_implemented(&self) -> bool {
        false
    }

    async fn fetch(&self, account: &EmailAccount, _options: &FetchOptions) -> Result<FetchBatch> {
        tracing::debug!(account_id = %account.id, provider = %self.kind, "adapter not implemented, nothing fetched");
        Ok(FetchBatch::default())
    }

    async fn fetch_message(
        &self,
        _account: &EmailAccount,
        message_id: &MessageId,
    ) -> Result<EmailMessage> {
        Err(ProviderError::NotFound(message_id.to_string()))
    }

    async fn send(&self, _account: &EmailAccount, _email: &OutgoingEmail) -> Result<SentMessage> {
        Err(ProviderError::Unsupported(format!(
            "sending through {} is not implemented",
            self.kind
        )))
    }

    async fn setup_push(
        &self,
        account: &EmailAccount,
        _callback_url: &str,
    ) -> Result<PushSubscription> {
        Ok(PushSubscription {
            subscription_id: format!("{}-{}", self.kind, account.id),
            status: PushStatus::Pending,
            expires_at: None,
            cursor: None,
        })
    }

    async fn teardown_push(&self, _account: &EmailAccount) -> Result<()> {
        Ok(())
    }

    async fn download_attachment(
        &self,
        _account: &EmailAccount,
        _message_id: &MessageId,
        _attachment_id: &str,
    ) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn push_state(
        &self,
        _account: &EmailAccount,
        _message_id: &MessageId,
        _desired: &TrackedFields,
        _current: &TrackedFields,
    ) -> Result<()> {
        Ok(())
    }
}
