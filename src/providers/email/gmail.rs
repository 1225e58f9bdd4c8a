//! Gmail-like REST API adapter.
//!
//! This module provides a [`ProviderAdapter`] implementation for the Gmail
//! REST API (and services that mirror it). It handles OAuth 2.0 token refresh,
//! paged message listing, translation into canonical messages, sending, push
//! subscriptions through Pub/Sub `watch`, and the history feed used for
//! push-driven incremental changes.
//!
//! # API Usage
//!
//! - `users.messages.list` / `users.messages.get` for fetching
//! - `users.messages.send` for sending
//! - `users.messages.modify` for writing read/star/label state back
//! - `users.messages.attachments.get` for attachment bytes
//! - `users.watch` / `users.stop` for push subscriptions
//! - `users.history.list` for incremental changes

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::token::TokenManager;
use super::{
    http, DeltaChange, FetchBatch, FetchFailure, FetchOptions, HistoryBatch, OutgoingEmail,
    ProviderAdapter, ProviderError, RemoteDelta, Result, SentMessage,
};
use crate::config::GmailSettings;
use crate::domain::{
    Address, AttachmentDescriptor, EmailAccount, EmailMessage, MessageId, ProviderKind,
    PushStatus, PushSubscription, ThreadId, TrackedFields,
};
use crate::storage::{AccountStore, CredentialCodec};

/// Hard cap the API puts on `maxResults`.
pub const MAX_PAGE_SIZE: u32 = 500;

/// Messages downloaded concurrently during a fetch.
const FETCH_CONCURRENCY: usize = 8;

const LABEL_UNREAD: &str = "UNREAD";
const LABEL_STARRED: &str = "STARRED";

/// Message list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    messages: Option<Vec<MessageRef>>,
    next_page_token: Option<String>,
}

/// Message reference in list and history responses.
#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

/// Gmail API message.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: Option<String>,
    label_ids: Option<Vec<String>>,
    snippet: Option<String>,
    payload: Option<GmailPart>,
    internal_date: Option<String>,
}

/// Message payload or one of its MIME parts.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPart {
    mime_type: Option<String>,
    filename: Option<String>,
    headers: Option<Vec<GmailHeader>>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPart>>,
}

/// Gmail message header.
#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

/// Gmail message body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailBody {
    data: Option<String>,
    size: Option<u64>,
    attachment_id: Option<String>,
}

/// History list response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryListResponse {
    history: Option<Vec<GmailHistory>>,
    next_page_token: Option<String>,
    history_id: Option<String>,
}

/// Gmail history record.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailHistory {
    messages_added: Option<Vec<HistoryMessage>>,
    messages_deleted: Option<Vec<HistoryMessage>>,
    labels_added: Option<Vec<HistoryMessage>>,
    labels_removed: Option<Vec<HistoryMessage>>,
}

/// History entry wrapper.
#[derive(Debug, Deserialize)]
struct HistoryMessage {
    message: MessageRef,
}

/// Modify request body.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ModifyRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    add_label_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    remove_label_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WatchRequest<'a> {
    topic_name: &'a str,
    label_ids: Vec<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    history_id: String,
    /// Epoch milliseconds, as a string.
    expiration: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    raw: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    id: String,
    thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AttachmentResponse {
    data: Option<String>,
}

/// Gmail-like API adapter.
///
/// Implements [`ProviderAdapter`] using the Gmail REST API with OAuth 2.0.
/// Endpoints are rooted at the configured `api_base`, so tests can point the
/// adapter at a mock server.
pub struct GmailAdapter {
    client: reqwest::Client,
    api_base: String,
    page_size: u32,
    pubsub_topic: Option<String>,
    tokens: TokenManager,
}

impl GmailAdapter {
    /// Creates an adapter for the configured API and OAuth client.
    pub fn new(
        settings: &GmailSettings,
        accounts: Arc<dyn AccountStore>,
        codec: Arc<dyn CredentialCodec>,
    ) -> Result<Self> {
        Ok(Self {
            client: http::client(settings.request_timeout())?,
            api_base: settings.api_base.trim_end_matches('/').to_string(),
            page_size: settings.page_size.clamp(1, MAX_PAGE_SIZE),
            pubsub_topic: settings.pubsub_topic.clone(),
            tokens: TokenManager::new(settings, accounts, codec)?,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/users/me{}", self.api_base, endpoint)
    }

    /// Lists message ids, paging until `max_emails` or the end of the mailbox.
    async fn list_message_ids(
        &self,
        session: &AuthSession<'_>,
        options: &FetchOptions,
    ) -> Result<Vec<String>> {
        let url = self.url("/messages");
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;

        while (ids.len() as u32) < options.max_emails {
            let remaining = options.max_emails - ids.len() as u32;
            let mut query = vec![(
                "maxResults",
                remaining.min(self.page_size).to_string(),
            )];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            if let Some(folder) = &options.folder_scope {
                query.push(("labelIds", folder.clone()));
            }
            if let (false, Some(since)) = (options.full_sync, options.since) {
                query.push(("q", format!("after:{}", since.timestamp())));
            }

            let response = session
                .send(|token| self.client.get(&url).bearer_auth(token).query(&query))
                .await?;
            let page: MessageListResponse = http::json(response).await?;

            let refs = page.messages.unwrap_or_default();
            if refs.is_empty() {
                break;
            }
            ids.extend(refs.into_iter().map(|r| r.id));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        ids.truncate(options.max_emails as usize);
        Ok(ids)
    }

    async fn get_message(&self, session: &AuthSession<'_>, id: &str) -> Result<GmailMessage> {
        let url = self.url(&format!("/messages/{id}"));
        let response = session
            .send(|token| {
                self.client
                    .get(&url)
                    .bearer_auth(token)
                    .query(&[("format", "full")])
            })
            .await?;
        http::json(response).await
    }

    /// Builds an RFC 5322 message for the send endpoint.
    fn build_raw_message(email: &OutgoingEmail, from_address: &str) -> String {
        let join = |addrs: &[Address]| {
            addrs
                .iter()
                .map(Address::display)
                .collect::<Vec<_>>()
                .join(", ")
        };

        let mut message = String::new();
        message.push_str(&format!("From: {from_address}\r\n"));
        message.push_str(&format!("To: {}\r\n", join(&email.to)));
        if !email.cc.is_empty() {
            message.push_str(&format!("Cc: {}\r\n", join(&email.cc)));
        }
        if !email.bcc.is_empty() {
            message.push_str(&format!("Bcc: {}\r\n", join(&email.bcc)));
        }
        message.push_str(&format!("Subject: {}\r\n", email.subject));
        if let Some(in_reply_to) = &email.in_reply_to_message {
            message.push_str(&format!("In-Reply-To: {in_reply_to}\r\n"));
        }
        message.push_str("MIME-Version: 1.0\r\n");

        match &email.body_html {
            Some(html) => {
                let boundary = format!("mailsync-{}", uuid::Uuid::new_v4().simple());
                message.push_str(&format!(
                    "Content-Type: multipart/alternative; boundary=\"{boundary}\"\r\n\r\n"
                ));
                message.push_str(&format!(
                    "--{boundary}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
                    email.body_text
                ));
                message.push_str(&format!(
                    "--{boundary}\r\nContent-Type: text/html; charset=utf-8\r\n\r\n{html}\r\n"
                ));
                message.push_str(&format!("--{boundary}--\r\n"));
            }
            None => {
                message.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
                message.push_str(&email.body_text);
            }
        }

        message
    }
}

#[async_trait]
impl ProviderAdapter for GmailAdapter {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GmailLike
    }

    async fn fetch(&self, account: &EmailAccount, options: &FetchOptions) -> Result<FetchBatch> {
        let session = AuthSession::open(&self.tokens, account).await?;
        let ids = self.list_message_ids(&session, options).await?;
        tracing::debug!(account_id = %account.id, listed = ids.len(), "listed messages");

        let results: Vec<(String, Result<GmailMessage>)> = stream::iter(ids)
            .map(|id| {
                let session = &session;
                async move {
                    let result = self.get_message(session, &id).await;
                    (id, result)
                }
            })
            .buffered(FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut batch = FetchBatch::default();
        for (id, result) in results {
            match result {
                Ok(message) => batch.messages.push(message_from_gmail(&message)),
                Err(e) if e.is_fatal_for_batch() => return Err(e),
                Err(e) => {
                    tracing::warn!(account_id = %account.id, message_id = %id, error = %e, "failed to fetch message");
                    batch.failures.push(FetchFailure {
                        message_id: MessageId::from(id),
                        error: e,
                    });
                }
            }
        }

        Ok(batch)
    }

    async fn fetch_message(
        &self,
        account: &EmailAccount,
        message_id: &MessageId,
    ) -> Result<EmailMessage> {
        let session = AuthSession::open(&self.tokens, account).await?;
        let message = self.get_message(&session, message_id.as_str()).await?;
        Ok(message_from_gmail(&message))
    }

    async fn send(&self, account: &EmailAccount, email: &OutgoingEmail) -> Result<SentMessage> {
        let session = AuthSession::open(&self.tokens, account).await?;
        let raw = Self::build_raw_message(email, &account.email);
        let request = SendRequest {
            raw: BASE64_URL_SAFE_NO_PAD.encode(raw.as_bytes()),
            thread_id: email.in_reply_to_thread.as_ref().map(|t| t.0.clone()),
        };

        let url = self.url("/messages/send");
        let response = session
            .send(|token| self.client.post(&url).bearer_auth(token).json(&request))
            .await?;
        let sent: SendResponse = http::json(response).await?;

        tracing::info!(account_id = %account.id, message_id = %sent.id, "email sent");
        Ok(SentMessage {
            message_id: MessageId::from(sent.id),
            thread_id: sent.thread_id.map(ThreadId::from),
        })
    }

    async fn setup_push(
        &self,
        account: &EmailAccount,
        callback_url: &str,
    ) -> Result<PushSubscription> {
        let topic = self.pubsub_topic.as_deref().ok_or_else(|| {
            ProviderError::InvalidRequest("no Pub/Sub topic configured".to_string())
        })?;
        tracing::debug!(account_id = %account.id, topic, callback_url, "registering mailbox watch");

        let session = AuthSession::open(&self.tokens, account).await?;
        let request = WatchRequest {
            topic_name: topic,
            label_ids: vec!["INBOX"],
        };
        let url = self.url("/watch");
        let response = session
            .send(|token| self.client.post(&url).bearer_auth(token).json(&request))
            .await?;
        let watch: WatchResponse = http::json(response).await?;

        Ok(PushSubscription {
            subscription_id: topic.to_string(),
            status: PushStatus::Active,
            expires_at: watch
                .expiration
                .and_then(|ms| ms.parse::<i64>().ok())
                .and_then(DateTime::from_timestamp_millis),
            cursor: Some(watch.history_id),
        })
    }

    async fn teardown_push(&self, account: &EmailAccount) -> Result<()> {
        let session = AuthSession::open(&self.tokens, account).await?;
        let url = self.url("/stop");
        session
            .send(|token| self.client.post(&url).bearer_auth(token))
            .await?;
        Ok(())
    }

    async fn download_attachment(
        &self,
        account: &EmailAccount,
        message_id: &MessageId,
        attachment_id: &str,
    ) -> Result<Vec<u8>> {
        let session = AuthSession::open(&self.tokens, account).await?;
        let url = self.url(&format!("/messages/{message_id}/attachments/{attachment_id}"));
        let response = session
            .send(|token| self.client.get(&url).bearer_auth(token))
            .await?;
        let attachment: AttachmentResponse = http::json(response).await?;

        let data = attachment.data.unwrap_or_default();
        decode_base64url(&data)
            .ok_or_else(|| ProviderError::Provider("attachment data is not base64".to_string()))
    }

    async fn push_state(
        &self,
        account: &EmailAccount,
        message_id: &MessageId,
        desired: &TrackedFields,
        current: &TrackedFields,
    ) -> Result<()> {
        let request = modify_request(desired, current);
        if request.add_label_ids.is_empty() && request.remove_label_ids.is_empty() {
            return Ok(());
        }

        let session = AuthSession::open(&self.tokens, account).await?;
        let url = self.url(&format!("/messages/{message_id}/modify"));
        session
            .send(|token| self.client.post(&url).bearer_auth(token).json(&request))
            .await?;
        Ok(())
    }

    async fn history_since(&self, account: &EmailAccount, cursor: &str) -> Result<HistoryBatch> {
        let session = AuthSession::open(&self.tokens, account).await?;
        let url = self.url("/history");
        let mut changes = HistoryCollector::default();
        let mut latest = None;
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("startHistoryId", cursor.to_string())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let response = session
                .send(|token| self.client.get(&url).bearer_auth(token).query(&query))
                .await?;
            let page: HistoryListResponse = http::json(response).await?;

            for record in page.history.unwrap_or_default() {
                changes.record(record);
            }
            if page.history_id.is_some() {
                latest = page.history_id;
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(HistoryBatch {
            deltas: changes.into_deltas(),
            cursor: latest,
        })
    }
}

impl std::fmt::Debug for GmailAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GmailAdapter")
            .field("api_base", &self.api_base)
            .finish_non_exhaustive()
    }
}

/// Access token scoped to one adapter call.
///
/// A 401 triggers at most one forced refresh for the whole call; concurrent
/// requests that were rejected with the same stale token reuse it.
struct AuthSession<'a> {
    tokens: &'a TokenManager,
    account: &'a EmailAccount,
    state: Mutex<SessionState>,
}

struct SessionState {
    token: String,
    refreshed: bool,
}

impl<'a> AuthSession<'a> {
    async fn open(tokens: &'a TokenManager, account: &'a EmailAccount) -> Result<Self> {
        let token = tokens.access_token(account).await?;
        Ok(Self {
            tokens,
            account,
            state: Mutex::new(SessionState {
                token: token.secret,
                refreshed: token.fresh,
            }),
        })
    }

    /// Sends a request built for the current token, recovering once from 401.
    async fn send<F>(&self, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&str) -> reqwest::RequestBuilder,
    {
        loop {
            let token = self.state.lock().await.token.clone();
            let response = build(&token)
                .send()
                .await
                .map_err(ProviderError::from_transport)?;

            if response.status() != StatusCode::UNAUTHORIZED {
                return http::check(response).await;
            }
            self.recover(&token, response).await?;
        }
    }

    async fn recover(&self, stale: &str, response: reqwest::Response) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.token != stale {
            return Ok(());
        }
        if state.refreshed {
            return Err(http::classify(response).await);
        }

        tracing::info!(account_id = %self.account.id, "access token rejected, forcing refresh");
        state.token = self.tokens.refresh(self.account, stale).await?;
        state.refreshed = true;
        Ok(())
    }
}

/// Folds history records into one delta per message.
#[derive(Default)]
struct HistoryCollector {
    order: Vec<String>,
    changes: HashMap<String, DeltaChange>,
}

impl HistoryCollector {
    fn record(&mut self, record: GmailHistory) {
        let groups = [
            (record.messages_added, DeltaChange::Created),
            (record.labels_added, DeltaChange::Updated),
            (record.labels_removed, DeltaChange::Updated),
            (record.messages_deleted, DeltaChange::Deleted),
        ];
        for (entries, change) in groups {
            for entry in entries.unwrap_or_default() {
                self.push(entry.message.id, change);
            }
        }
    }

    fn push(&mut self, id: String, change: DeltaChange) {
        match self.changes.get_mut(&id) {
            Some(existing) => {
                // Deletion is final; creation is not downgraded by a later label change.
                if change == DeltaChange::Deleted || *existing == DeltaChange::Updated {
                    *existing = change;
                }
            }
            None => {
                self.order.push(id.clone());
                self.changes.insert(id, change);
            }
        }
    }

    fn into_deltas(mut self) -> Vec<RemoteDelta> {
        self.order
            .into_iter()
            .filter_map(|id| {
                let change = self.changes.remove(&id)?;
                Some(RemoteDelta {
                    change,
                    message_id: MessageId::from(id),
                    message: None,
                })
            })
            .collect()
    }
}

/// Computes the label changes that turn `current` into `desired`.
fn modify_request(desired: &TrackedFields, current: &TrackedFields) -> ModifyRequest {
    let mut add: Vec<String> = desired.labels.difference(&current.labels).cloned().collect();
    let mut remove: Vec<String> = current.labels.difference(&desired.labels).cloned().collect();

    match (desired.is_read, current.is_read) {
        (false, true) => add.push(LABEL_UNREAD.to_string()),
        (true, false) => remove.push(LABEL_UNREAD.to_string()),
        _ => {}
    }
    match (desired.is_starred, current.is_starred) {
        (true, false) => add.push(LABEL_STARRED.to_string()),
        (false, true) => remove.push(LABEL_STARRED.to_string()),
        _ => {}
    }

    ModifyRequest {
        add_label_ids: add,
        remove_label_ids: remove,
    }
}

/// Converts a Gmail message into the canonical form.
///
/// Total: anything missing degrades to an empty value.
fn message_from_gmail(msg: &GmailMessage) -> EmailMessage {
    let empty = GmailPart::default();
    let payload = msg.payload.as_ref().unwrap_or(&empty);
    let header = |name: &str| -> String {
        payload
            .headers
            .iter()
            .flatten()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
            .unwrap_or_default()
    };

    let internal_date = msg
        .internal_date
        .as_deref()
        .and_then(|d| d.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    let date = DateTime::parse_from_rfc2822(header("Date").trim())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or(internal_date);

    let label_ids = msg.label_ids.clone().unwrap_or_default();
    let is_read = !label_ids.iter().any(|l| l == LABEL_UNREAD);
    let is_starred = label_ids.iter().any(|l| l == LABEL_STARRED);
    let labels: BTreeSet<String> = label_ids
        .into_iter()
        .filter(|l| l != LABEL_UNREAD && l != LABEL_STARRED)
        .collect();

    let mut body = BodyParts::default();
    body.collect(payload);

    EmailMessage {
        id: MessageId::from(msg.id.clone()),
        thread_id: ThreadId::from(msg.thread_id.clone().unwrap_or_else(|| msg.id.clone())),
        from: Address::parse(&header("From")),
        to: Address::parse_list(&header("To")),
        cc: Address::parse_list(&header("Cc")),
        bcc: Address::parse_list(&header("Bcc")),
        subject: header("Subject"),
        body_text: body.text.unwrap_or_default(),
        body_html: body.html.unwrap_or_default(),
        snippet: msg.snippet.clone().unwrap_or_default(),
        date,
        labels,
        is_read,
        is_starred,
        attachments: body.attachments,
        internal_date,
    }
}

/// Bodies and attachment metadata gathered from a MIME tree.
#[derive(Default)]
struct BodyParts {
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<AttachmentDescriptor>,
}

impl BodyParts {
    fn collect(&mut self, part: &GmailPart) {
        let mime = part.mime_type.as_deref().unwrap_or("text/plain");
        let filename = part.filename.as_deref().unwrap_or("");
        let body = part.body.as_ref();

        if let Some(attachment_id) = body.and_then(|b| b.attachment_id.as_ref()) {
            if !filename.is_empty() {
                self.attachments.push(AttachmentDescriptor {
                    attachment_id: attachment_id.clone(),
                    filename: filename.to_string(),
                    mime_type: mime.to_string(),
                    size: body.and_then(|b| b.size).unwrap_or(0),
                });
            }
        } else if let Some(data) = body.and_then(|b| b.data.as_deref()) {
            let slot = match mime {
                "text/plain" => Some(&mut self.text),
                "text/html" => Some(&mut self.html),
                _ => None,
            };
            if let Some(slot) = slot.filter(|s| s.is_none()) {
                *slot = decode_base64url(data).and_then(|bytes| String::from_utf8(bytes).ok());
            }
        }

        for child in part.parts.iter().flatten() {
            self.collect(child);
        }
    }
}

fn decode_base64url(data: &str) -> Option<Vec<u8>> {
    BASE64_URL_SAFE_NO_PAD
        .decode(data.trim_end_matches('='))
        .ok()
}
