//! Unified multi-provider API adapter.
//!
//! The unified service fronts many mailbox providers behind one REST API.
//! Accounts connected through it carry a grant id in
//! [`EmailAccount::foreign_id`]; every request is scoped to that grant and
//! authenticated with the application API key.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    http, FetchBatch, FetchFailure, FetchOptions, OutgoingEmail, ProviderAdapter, ProviderError,
    Result, SentMessage,
};
use crate::config::UnifiedSettings;
use crate::domain::{
    Address, AttachmentDescriptor, EmailAccount, EmailMessage, MessageId, ProviderKind,
    PushStatus, PushSubscription, ThreadId, TrackedFields,
};

/// Largest page the list endpoint accepts.
pub const MAX_PAGE_SIZE: u32 = 200;

/// Webhook triggers registered for real-time sync.
const TRIGGERS: [&str; 3] = ["message.created", "message.updated", "message.deleted"];

/// Envelope around every response payload.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
    next_cursor: Option<String>,
}

/// A participant as the unified API represents it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct UnifiedParticipant {
    #[serde(default)]
    pub email: String,
    pub name: Option<String>,
}

/// Attachment metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct UnifiedAttachment {
    #[serde(default)]
    pub id: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub size: Option<u64>,
}

/// A message object. Every field is optional so translation never fails on
/// a sparse payload.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct UnifiedMessage {
    pub id: String,
    pub thread_id: Option<String>,
    pub subject: Option<String>,
    pub from: Vec<UnifiedParticipant>,
    pub to: Vec<UnifiedParticipant>,
    pub cc: Vec<UnifiedParticipant>,
    pub bcc: Vec<UnifiedParticipant>,
    /// Unix seconds.
    pub date: Option<i64>,
    pub unread: Option<bool>,
    pub starred: Option<bool>,
    pub folders: Vec<String>,
    pub snippet: Option<String>,
    pub body: Option<String>,
    pub attachments: Vec<UnifiedAttachment>,
}

impl UnifiedMessage {
    /// Converts into the canonical message.
    pub(crate) fn into_canonical(self) -> EmailMessage {
        let date = self
            .date
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);

        EmailMessage {
            thread_id: ThreadId::from(self.thread_id.unwrap_or_else(|| self.id.clone())),
            id: MessageId::from(self.id),
            from: self
                .from
                .into_iter()
                .next()
                .map(UnifiedParticipant::into_address)
                .unwrap_or_default(),
            to: addresses(self.to),
            cc: addresses(self.cc),
            bcc: addresses(self.bcc),
            subject: self.subject.unwrap_or_default(),
            body_text: String::new(),
            body_html: self.body.unwrap_or_default(),
            snippet: self.snippet.unwrap_or_default(),
            date,
            labels: self.folders.into_iter().collect::<BTreeSet<_>>(),
            is_read: !self.unread.unwrap_or(false),
            is_starred: self.starred.unwrap_or(false),
            attachments: self
                .attachments
                .into_iter()
                .map(|a| AttachmentDescriptor {
                    attachment_id: a.id,
                    filename: a.filename.unwrap_or_default(),
                    mime_type: a
                        .content_type
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                    size: a.size.unwrap_or(0),
                })
                .collect(),
            internal_date: date,
        }
    }
}

impl UnifiedParticipant {
    fn into_address(self) -> Address {
        Address {
            email: self.email,
            name: self.name.filter(|n| !n.is_empty()),
        }
    }

    fn from_address(address: &Address) -> Self {
        Self {
            email: address.email.clone(),
            name: address.name.clone(),
        }
    }
}

fn addresses(participants: Vec<UnifiedParticipant>) -> Vec<Address> {
    participants
        .into_iter()
        .map(UnifiedParticipant::into_address)
        .collect()
}

/// Parses one message object, tolerating anything that is at least an object.
pub(crate) fn parse_message(value: serde_json::Value) -> Result<EmailMessage> {
    serde_json::from_value::<UnifiedMessage>(value)
        .map(UnifiedMessage::into_canonical)
        .map_err(|e| ProviderError::Provider(format!("malformed message: {e}")))
}

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    subject: &'a str,
    body: &'a str,
    to: Vec<UnifiedParticipant>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cc: Vec<UnifiedParticipant>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bcc: Vec<UnifiedParticipant>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct SentData {
    id: String,
    thread_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct WebhookRequest<'a> {
    trigger_types: [&'a str; 3],
    callback_url: &'a str,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    id: String,
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct UpdateRequest<'a> {
    unread: bool,
    starred: bool,
    folders: &'a BTreeSet<String>,
}

/// Adapter for the unified multi-provider API.
pub struct UnifiedAdapter {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    page_size: u32,
}

impl UnifiedAdapter {
    /// Creates an adapter from settings.
    pub fn new(settings: &UnifiedSettings) -> Result<Self> {
        Ok(Self {
            client: http::client(settings.request_timeout())?,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            api_key: settings.api_key.clone(),
            page_size: settings.page_size.clamp(1, MAX_PAGE_SIZE),
        })
    }

    /// Base URL of the account's grant.
    fn grant_url(&self, account: &EmailAccount, endpoint: &str) -> Result<String> {
        let grant = account.foreign_id.as_deref().ok_or_else(|| {
            ProviderError::InvalidRequest(format!(
                "account {} is not connected through the unified API",
                account.id
            ))
        })?;
        Ok(format!("{}/grants/{}{}", self.api_base, grant, endpoint))
    }

    async fn send_request(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(ProviderError::from_transport)?;
        http::check(response).await
    }
}

#[async_trait]
impl ProviderAdapter for UnifiedAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Unified
    }

    async fn fetch(&self, account: &EmailAccount, options: &FetchOptions) -> Result<FetchBatch> {
        let url = self.grant_url(account, "/messages")?;
        let mut batch = FetchBatch::default();
        let mut cursor: Option<String> = None;

        while (batch.len() as u32) < options.max_emails {
            let remaining = options.max_emails - batch.len() as u32;
            let mut query = vec![("limit", remaining.min(self.page_size).to_string())];
            if let Some(token) = &cursor {
                query.push(("page_token", token.clone()));
            }
            if let Some(folder) = &options.folder_scope {
                query.push(("in", folder.clone()));
            }
            if let (false, Some(since)) = (options.full_sync, options.since) {
                query.push(("received_after", since.timestamp().to_string()));
            }

            let response = self.send_request(self.client.get(&url).query(&query)).await?;
            let page: Envelope<Vec<serde_json::Value>> = http::json(response).await?;
            if page.data.is_empty() {
                break;
            }

            for value in page.data {
                let id = value
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                match parse_message(value) {
                    Ok(message) => batch.messages.push(message),
                    Err(e) => {
                        tracing::warn!(account_id = %account.id, message_id = %id, error = %e, "skipping malformed message");
                        batch.failures.push(FetchFailure {
                            message_id: MessageId::from(id),
                            error: e,
                        });
                    }
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        batch.messages.truncate(options.max_emails as usize);
        Ok(batch)
    }

    async fn fetch_message(
        &self,
        account: &EmailAccount,
        message_id: &MessageId,
    ) -> Result<EmailMessage> {
        let url = self.grant_url(account, &format!("/messages/{message_id}"))?;
        let response = self.send_request(self.client.get(&url)).await?;
        let envelope: Envelope<serde_json::Value> = http::json(response).await?;
        parse_message(envelope.data)
    }

    async fn send(&self, account: &EmailAccount, email: &OutgoingEmail) -> Result<SentMessage> {
        let url = self.grant_url(account, "/messages/send")?;
        let participants = |list: &[Address]| {
            list.iter()
                .map(UnifiedParticipant::from_address)
                .collect::<Vec<_>>()
        };
        let request = SendRequest {
            subject: &email.subject,
            body: email.body_html.as_deref().unwrap_or(&email.body_text),
            to: participants(&email.to),
            cc: participants(&email.cc),
            bcc: participants(&email.bcc),
            reply_to_message_id: email.in_reply_to_message.as_ref().map(MessageId::as_str),
        };

        let response = self
            .send_request(self.client.post(&url).json(&request))
            .await?;
        let sent: Envelope<SentData> = http::json(response).await?;

        tracing::info!(account_id = %account.id, message_id = %sent.data.id, "email sent");
        Ok(SentMessage {
            message_id: MessageId::from(sent.data.id),
            thread_id: sent.data.thread_id.map(ThreadId::from),
        })
    }

    async fn setup_push(
        &self,
        account: &EmailAccount,
        callback_url: &str,
    ) -> Result<PushSubscription> {
        // Webhooks are application-wide; the grant only has to exist.
        self.grant_url(account, "")?;
        let url = format!("{}/webhooks", self.api_base);
        let request = WebhookRequest {
            trigger_types: TRIGGERS,
            callback_url,
        };

        let response = self
            .send_request(self.client.post(&url).json(&request))
            .await?;
        let webhook: Envelope<WebhookData> = http::json(response).await?;

        let status = match webhook.data.status.as_deref() {
            Some("failing") | Some("failed") => PushStatus::Failing,
            Some("pending") => PushStatus::Pending,
            _ => PushStatus::Active,
        };
        Ok(PushSubscription {
            subscription_id: webhook.data.id,
            status,
            expires_at: None,
            cursor: None,
        })
    }

    async fn teardown_push(&self, account: &EmailAccount) -> Result<()> {
        let Some(subscription) = &account.push_subscription else {
            return Ok(());
        };
        let url = format!("{}/webhooks/{}", self.api_base, subscription.subscription_id);
        match self.send_request(self.client.delete(&url)).await {
            Ok(_) | Err(ProviderError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn download_attachment(
        &self,
        account: &EmailAccount,
        message_id: &MessageId,
        attachment_id: &str,
    ) -> Result<Vec<u8>> {
        let url = self.grant_url(account, &format!("/attachments/{attachment_id}/download"))?;
        let response = self
            .send_request(
                self.client
                    .get(&url)
                    .query(&[("message_id", message_id.as_str())]),
            )
            .await?;
        let bytes = response
            .bytes()
            .await
            .map_err(ProviderError::from_transport)?;
        Ok(bytes.to_vec())
    }

    async fn push_state(
        &self,
        account: &EmailAccount,
        message_id: &MessageId,
        desired: &TrackedFields,
        current: &TrackedFields,
    ) -> Result<()> {
        if desired.diff(current).is_empty() {
            return Ok(());
        }
        let url = self.grant_url(account, &format!("/messages/{message_id}"))?;
        let request = UpdateRequest {
            unread: !desired.is_read,
            starred: desired.is_starred,
            folders: &desired.labels,
        };
        self.send_request(self.client.put(&url).json(&request))
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for UnifiedAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnifiedAdapter")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::label_set;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn adapter(server: &MockServer, page_size: u32) -> UnifiedAdapter {
        UnifiedAdapter::new(&UnifiedSettings {
            api_base: server.uri(),
            api_key: "key-1".into(),
            page_size,
            ..Default::default()
        })
        .unwrap()
    }

    fn account() -> EmailAccount {
        EmailAccount::new("acc-1", "me@example.com", ProviderKind::Imap).with_foreign_id("grant-1")
    }

    fn message(id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "thread_id": "t1",
            "subject": "Quarterly report",
            "from": [{"name": "Ada", "email": "ada@example.com"}],
            "to": [{"email": "me@example.com"}],
            "date": 1700000000,
            "unread": true,
            "starred": false,
            "folders": ["INBOX"],
            "body": "<p>hi</p>",
            "attachments": [{"id": "a1", "filename": "q.pdf", "content_type": "application/pdf", "size": 10}]
        })
    }

    #[test]
    fn sparse_message_translates() {
        let email = parse_message(serde_json::json!({"id": "m1"})).unwrap();
        assert_eq!(email.subject, "");
        assert_eq!(email.from, Address::default());
        assert_eq!(email.thread_id, ThreadId::from("m1"));
        assert!(email.is_read);
    }

    #[test]
    fn full_message_translates() {
        let email = parse_message(message("m1")).unwrap();
        assert_eq!(email.from, Address::with_name("ada@example.com", "Ada"));
        assert_eq!(email.labels, label_set(["INBOX"]));
        assert!(!email.is_read);
        assert_eq!(email.body_html, "<p>hi</p>");
        assert_eq!(email.attachments[0].mime_type, "application/pdf");
        assert_eq!(email.date.timestamp(), 1_700_000_000);
    }

    #[test]
    fn non_object_is_rejected() {
        assert!(parse_message(serde_json::json!("nope")).is_err());
    }

    #[tokio::test]
    async fn fetch_follows_cursor_and_isolates_malformed_entries() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/grants/grant-1/messages"))
            .and(query_param("page_token", "c2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [message("m3")]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/grants/grant-1/messages"))
            .and(header("authorization", "Bearer key-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [message("m1"), {"id": "m2", "unread": "yes"}],
                "next_cursor": "c2"
            })))
            .mount(&server)
            .await;

        let adapter = adapter(&server, 2).await;
        let batch = adapter
            .fetch(&account(), &FetchOptions::full(10))
            .await
            .unwrap();

        let ids: Vec<_> = batch.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m3"]);
        assert_eq!(batch.failures.len(), 1);
        assert_eq!(batch.failures[0].message_id, MessageId::from("m2"));
    }

    #[tokio::test]
    async fn fetch_without_grant_is_invalid_request() {
        let server = MockServer::start().await;
        let adapter = adapter(&server, 50).await;
        let plain = EmailAccount::new("acc-2", "x@example.com", ProviderKind::Imap);

        let err = adapter
            .fetch(&plain, &FetchOptions::full(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn push_state_writes_flags_and_folders() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/grants/grant-1/messages/m1"))
            .and(body_json(serde_json::json!({
                "unread": false,
                "starred": true,
                "folders": ["INBOX", "Work"]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": {}})))
            .expect(1)
            .mount(&server)
            .await;

        let current = TrackedFields {
            subject: "s".into(),
            is_read: false,
            is_starred: false,
            labels: label_set(["INBOX"]),
        };
        let desired = TrackedFields {
            subject: "s".into(),
            is_read: true,
            is_starred: true,
            labels: label_set(["INBOX", "Work"]),
        };

        let adapter = adapter(&server, 50).await;
        adapter
            .push_state(&account(), &MessageId::from("m1"), &desired, &current)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn setup_push_registers_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhooks"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"id": "wh-1", "status": "active"}
            })))
            .mount(&server)
            .await;

        let adapter = adapter(&server, 50).await;
        let subscription = adapter
            .setup_push(&account(), "https://hooks.example.com/unified")
            .await
            .unwrap();
        assert_eq!(subscription.subscription_id, "wh-1");
        assert_eq!(subscription.status, PushStatus::Active);
    }

    #[tokio::test]
    async fn send_returns_provider_ids() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/grants/grant-1/messages/send"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"id": "sent-1", "thread_id": "t9"}
            })))
            .mount(&server)
            .await;

        let adapter = adapter(&server, 50).await;
        let sent = adapter
            .send(
                &account(),
                &OutgoingEmail {
                    to: vec![Address::new("bob@example.com")],
                    subject: "Hi".into(),
                    body_text: "Hello".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(sent.message_id, MessageId::from("sent-1"));
        assert_eq!(sent.thread_id, Some(ThreadId::from("t9")));
    }

    #[tokio::test]
    async fn attachment_download_returns_raw_bytes() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/grants/grant-1/attachments/a1/download"))
            .and(query_param("message_id", "m1"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .mount(&server)
            .await;

        let adapter = adapter(&server, 50).await;
        let bytes = adapter
            .download_attachment(&account(), &MessageId::from("m1"), "a1")
            .await
            .unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
    }
}
