//! Shared HTTP plumbing for REST adapters.
//!
//! Maps provider responses onto [`ProviderError`] the same way for every
//! adapter: 401 is an auth failure, 429 a rate limit, and 403 is split by the
//! reason in the body.

use std::time::Duration;

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use super::{ProviderError, Result};

/// Builds an HTTP client with a per-request timeout.
pub(crate) fn client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::Internal(format!("build http client: {e}")))
}

/// Returns the response if successful, otherwise the classified error.
pub(crate) async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
    if response.status().is_success() {
        Ok(response)
    } else {
        Err(classify(response).await)
    }
}

/// Checks the status and decodes a JSON body.
pub(crate) async fn json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    check(response)
        .await?
        .json()
        .await
        .map_err(|e| ProviderError::Internal(format!("parse response: {e}")))
}

/// Maps an error response to a [`ProviderError`].
pub(crate) async fn classify(response: reqwest::Response) -> ProviderError {
    let status = response.status();
    let retry_after = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    classify_parts(status, retry_after, &body)
}

fn classify_parts(status: StatusCode, retry_after: Option<u64>, body: &str) -> ProviderError {
    match status.as_u16() {
        401 => ProviderError::AuthFailed(format!("unauthorized: {body}")),
        403 => {
            let reason = body.to_ascii_lowercase();
            if reason.contains("ratelimit") || reason.contains("rate limit") {
                ProviderError::RateLimited {
                    retry_after_secs: retry_after,
                }
            } else if reason.contains("quota") || reason.contains("dailylimit") {
                ProviderError::QuotaExceeded(body.to_string())
            } else {
                ProviderError::Provider(format!("forbidden: {body}"))
            }
        }
        404 => ProviderError::NotFound(body.to_string()),
        408 => ProviderError::Timeout(body.to_string()),
        429 => ProviderError::RateLimited {
            retry_after_secs: retry_after,
        },
        400 | 422 => ProviderError::InvalidRequest(body.to_string()),
        _ => ProviderError::Provider(format!("API error ({status}): {body}")),
    }
}

fn retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn unauthorized_is_auth_failure() {
        let err = classify_parts(StatusCode::UNAUTHORIZED, None, "expired");
        assert!(matches!(err, ProviderError::AuthFailed(_)));
    }

    #[test]
    fn too_many_requests_carries_retry_after() {
        let err = classify_parts(StatusCode::TOO_MANY_REQUESTS, Some(12), "");
        assert_eq!(
            err,
            ProviderError::RateLimited {
                retry_after_secs: Some(12)
            }
        );
    }

    #[test]
    fn forbidden_is_split_by_reason() {
        let rate = classify_parts(
            StatusCode::FORBIDDEN,
            None,
            r#"{"error":{"errors":[{"reason":"userRateLimitExceeded"}]}}"#,
        );
        assert!(matches!(rate, ProviderError::RateLimited { .. }));

        let quota = classify_parts(
            StatusCode::FORBIDDEN,
            None,
            r#"{"error":{"errors":[{"reason":"quotaExceeded"}]}}"#,
        );
        assert!(matches!(quota, ProviderError::QuotaExceeded(_)));

        let other = classify_parts(StatusCode::FORBIDDEN, None, "insufficient scope");
        assert!(matches!(other, ProviderError::Provider(_)));
    }

    #[test]
    fn server_errors_are_provider_errors() {
        let err = classify_parts(StatusCode::BAD_GATEWAY, None, "upstream");
        assert!(matches!(err, ProviderError::Provider(_)));
        assert!(!err.is_fatal_for_batch());
    }

    #[test]
    fn retry_after_parses_seconds_only() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));
        assert_eq!(retry_after(&headers), Some(30));

        headers.insert(
            RETRY_AFTER,
            HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"),
        );
        assert_eq!(retry_after(&headers), None);
    }
}
