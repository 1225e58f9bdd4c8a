//! OAuth 2.0 access token lifecycle.
//!
//! Access and refresh tokens are stored encrypted on the account. The
//! [`TokenManager`] decrypts them on demand, refreshes expired access tokens
//! against the token endpoint and persists the re-encrypted result.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;

use super::{http, ProviderError, Result};
use crate::config::GmailSettings;
use crate::domain::{Credentials, EmailAccount};
use crate::storage::{AccountStore, CredentialCodec};

/// Access tokens expiring within this window are refreshed up front.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// OAuth token response.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    /// Present when the server rotates refresh tokens.
    refresh_token: Option<String>,
}

/// An access token handed out by [`TokenManager::access_token`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub secret: String,
    /// Minted by the token endpoint during this call (or while it waited on
    /// another caller's refresh), so a rejection is final.
    pub fresh: bool,
}

/// Hands out usable access tokens for OAuth-backed accounts.
///
/// Credentials are always read from the account store rather than from the
/// caller's copy of the account, and refreshes are serialized, so a token
/// refreshed by one caller is reused by every later one.
pub struct TokenManager {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
    accounts: Arc<dyn AccountStore>,
    codec: Arc<dyn CredentialCodec>,
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    /// Creates a token manager for the configured OAuth client.
    pub fn new(
        settings: &GmailSettings,
        accounts: Arc<dyn AccountStore>,
        codec: Arc<dyn CredentialCodec>,
    ) -> Result<Self> {
        Ok(Self {
            client: http::client(settings.request_timeout())?,
            token_url: settings.token_url.clone(),
            client_id: settings.client_id.clone(),
            client_secret: settings.client_secret.clone(),
            accounts,
            codec,
            refresh_lock: Mutex::new(()),
        })
    }

    fn expired(credentials: &Credentials) -> bool {
        credentials.needs_refresh(Utc::now(), Duration::seconds(EXPIRY_SKEW_SECS))
    }

    /// Latest stored credentials, falling back to the caller's copy when the
    /// account is not in the store.
    async fn current_credentials(&self, account: &EmailAccount) -> Credentials {
        match self.accounts.get_account(&account.id).await {
            Ok(Some(stored)) => stored.credentials,
            Ok(None) => account.credentials.clone(),
            Err(e) => {
                tracing::warn!(account_id = %account.id, error = %e, "failed to reload credentials");
                account.credentials.clone()
            }
        }
    }

    /// Returns a plaintext access token, refreshing it first if it is
    /// missing or about to expire.
    pub async fn access_token(&self, account: &EmailAccount) -> Result<AccessToken> {
        let credentials = self.current_credentials(account).await;
        if !Self::expired(&credentials) {
            return Ok(AccessToken {
                secret: self.decrypt_access(&credentials)?,
                fresh: false,
            });
        }

        let _refreshing = self.refresh_lock.lock().await;
        // Someone else may have refreshed while we waited for the lock.
        let credentials = self.current_credentials(account).await;
        let secret = if Self::expired(&credentials) {
            tracing::debug!(account_id = %account.id, "access token expired, refreshing");
            self.exchange(account, &credentials).await?
        } else {
            self.decrypt_access(&credentials)?
        };
        Ok(AccessToken {
            secret,
            fresh: true,
        })
    }

    /// Forces a refresh after the provider rejected `rejected`.
    ///
    /// When the stored token already differs from the rejected one, another
    /// caller refreshed in the meantime and that token is returned instead.
    pub async fn refresh(&self, account: &EmailAccount, rejected: &str) -> Result<String> {
        let _refreshing = self.refresh_lock.lock().await;
        let credentials = self.current_credentials(account).await;
        if !Self::expired(&credentials) {
            if let Ok(current) = self.decrypt_access(&credentials) {
                if current != rejected {
                    return Ok(current);
                }
            }
        }
        self.exchange(account, &credentials).await
    }

    fn decrypt_access(&self, credentials: &Credentials) -> Result<String> {
        let ciphertext = credentials
            .access_token
            .as_deref()
            .ok_or_else(|| ProviderError::AuthFailed("no access token".to_string()))?;
        self.codec
            .decrypt(ciphertext)
            .map_err(|e| ProviderError::AuthFailed(format!("decrypt access token: {e}")))
    }

    /// Exchanges the refresh token for a new access token and persists it.
    ///
    /// A failure to persist is logged; the fresh token is still returned so
    /// the current run can proceed.
    async fn exchange(&self, account: &EmailAccount, current: &Credentials) -> Result<String> {
        let refresh_ciphertext = current
            .refresh_token
            .as_deref()
            .ok_or_else(|| ProviderError::AuthFailed("no refresh token".to_string()))?;
        let refresh_token = self
            .codec
            .decrypt(refresh_ciphertext)
            .map_err(|e| ProviderError::AuthFailed(format!("decrypt refresh token: {e}")))?;

        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .client
            .post(&self.token_url)
            .form(&params)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::AuthFailed(format!(
                "token refresh failed ({status}): {body}"
            )));
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::AuthFailed(format!("parse token response: {e}")))?;

        let encrypt = |plaintext: &str| {
            self.codec
                .encrypt(plaintext)
                .map_err(|e| ProviderError::Internal(format!("encrypt token: {e}")))
        };

        let credentials = Credentials {
            access_token: Some(encrypt(&token.access_token)?),
            refresh_token: match &token.refresh_token {
                Some(rotated) => Some(encrypt(rotated)?),
                None => Some(refresh_ciphertext.to_string()),
            },
            expires_at: Some(
                Utc::now()
                    + Duration::seconds(token.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS)),
            ),
        };

        if let Err(e) = self.accounts.update_credentials(&account.id, credentials).await {
            tracing::warn!(account_id = %account.id, error = %e, "failed to persist refreshed credentials");
        }

        tracing::info!(account_id = %account.id, "access token refreshed");
        Ok(token.access_token)
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("token_url", &self.token_url)
            .finish_non_exhaustive()
    }
}
