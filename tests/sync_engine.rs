//! End-to-end tests of the engine over real stores and mocked providers.
//!
//! Each service module carries its own unit tests; these exercise the
//! public surface the way an embedding application would.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use mailsync::config::Settings;
use mailsync::domain::{
    label_set, merge_fields, AccountId, Credentials, EmailAccount, EmailMessage, LocalMessageId,
    MessageId, ProviderKind, StoredMessage, SyncLogStatus, TrackedFields,
};
use mailsync::providers::email::AdapterRegistry;
use mailsync::services::{detect, Detection, SyncOptions, WebhookOutcome};
use mailsync::storage::{
    queries, AesGcmCodec, CredentialCodec, Database, MemoryStore, MessageStore, MessageUpdate,
    StoreError, StoreResult, Stores,
};
use mailsync::Engine;
use pretty_assertions::assert_eq;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY: [u8; 32] = [7u8; 32];

fn codec() -> Arc<AesGcmCodec> {
    Arc::new(AesGcmCodec::new(KEY).unwrap())
}

fn gmail_account(codec: &AesGcmCodec, expires_in: chrono::Duration) -> EmailAccount {
    EmailAccount::new("acc-1", "me@example.com", ProviderKind::GmailLike).with_credentials(
        Credentials {
            access_token: Some(codec.encrypt("stale-token").unwrap()),
            refresh_token: Some(codec.encrypt("refresh-1").unwrap()),
            expires_at: Some(Utc::now() + expires_in),
        },
    )
}

fn settings_for(server: &MockServer) -> Settings {
    let mut settings = Settings::default();
    settings.gmail.api_base = server.uri();
    settings.gmail.token_url = format!("{}/token", server.uri());
    settings.gmail.client_id = "client".into();
    settings.gmail.client_secret = "secret".into();
    settings.sync.retry_delay_secs = 0;
    settings
}

async fn mount_mailbox(server: &MockServer, ids: &[&str]) {
    let refs: Vec<_> = ids.iter().map(|id| serde_json::json!({"id": id})).collect();
    Mock::given(method("GET"))
        .and(path("/users/me/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "messages": refs
        })))
        .mount(server)
        .await;

    for id in ids {
        Mock::given(method("GET"))
            .and(path(format!("/users/me/messages/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": id,
                "threadId": "thread-1",
                "labelIds": ["INBOX"],
                "payload": {"headers": [{"name": "Subject", "value": format!("Subject {id}")}]}
            })))
            .mount(server)
            .await;
    }
}

fn engine_over(stores: Stores, settings: &Settings) -> Engine {
    let registry =
        AdapterRegistry::from_settings(settings, stores.accounts.clone(), codec()).unwrap();
    Engine::new(stores, registry, settings)
}

#[tokio::test]
async fn first_sync_into_sqlite_adds_everything_and_second_is_idempotent() {
    let server = MockServer::start().await;
    mount_mailbox(&server, &["m1", "m2"]).await;

    let dir = tempfile::tempdir().unwrap();
    let db = Arc::new(Database::open(dir.path().join("mailsync.db")).await.unwrap());
    let account = gmail_account(&codec(), chrono::Duration::hours(1));
    queries::accounts::insert(&db, &account).await.unwrap();

    let engine = engine_over(Stores::single(db.clone()), &settings_for(&server));

    let first = engine
        .sync()
        .sync_account(&account.id, SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(
        (first.emails_added, first.emails_updated, first.errors_count, first.success),
        (2, 0, 0, true)
    );

    let second = engine
        .sync()
        .sync_account(&account.id, SyncOptions::default())
        .await
        .unwrap();
    assert_eq!((second.emails_added, second.emails_updated), (0, 0));
    assert_eq!(second.emails_processed, 2);

    let stored = queries::messages::list_by_account(&db, &account.id)
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);

    let logs = queries::sync_logs::list_by_account(&db, &account.id)
        .await
        .unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().all(|log| log.status == SyncLogStatus::Completed));
}

#[tokio::test]
async fn expired_token_is_refreshed_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "access_token": "fresh-token",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/me/messages"))
        .and(header("authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "messages": [{"id": "m1"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/users/me/messages/m1"))
        .and(header("authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "m1"})))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let account = gmail_account(&codec(), chrono::Duration::seconds(-60));
    store.insert_account(account.clone()).await;

    let engine = engine_over(Stores::single(store.clone()), &settings_for(&server));
    let result = engine
        .sync()
        .sync_account(&account.id, SyncOptions::default())
        .await
        .unwrap();

    assert!(result.success);
    assert_eq!(result.emails_added, 1);
    assert_eq!(store.credential_writes(&account.id).await, 1);
}

#[tokio::test]
async fn concurrent_syncs_share_one_run() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/me/messages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"messages": []}))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let account = gmail_account(&codec(), chrono::Duration::hours(1));
    store.insert_account(account.clone()).await;
    let engine = engine_over(Stores::single(store), &settings_for(&server));

    let (a, b) = tokio::join!(
        engine.sync().sync_account(&account.id, SyncOptions::default()),
        engine.sync().sync_account(&account.id, SyncOptions::default()),
    );
    assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    assert!(!engine.sync().is_syncing(&account.id));
}

/// Message store that rejects inserts of one external id.
struct RejectingStore {
    inner: Arc<MemoryStore>,
    reject: MessageId,
}

#[async_trait]
impl MessageStore for RejectingStore {
    async fn find_by_external_id(
        &self,
        account_id: &AccountId,
        external_id: &MessageId,
    ) -> StoreResult<Option<StoredMessage>> {
        self.inner.find_by_external_id(account_id, external_id).await
    }

    async fn create_message(
        &self,
        account_id: &AccountId,
        message: &EmailMessage,
    ) -> StoreResult<LocalMessageId> {
        if message.id == self.reject {
            return Err(StoreError::Backend("disk full".into()));
        }
        self.inner.create_message(account_id, message).await
    }

    async fn update_message(&self, id: &LocalMessageId, update: &MessageUpdate) -> StoreResult<()> {
        self.inner.update_message(id, update).await
    }

    async fn delete_messages(
        &self,
        account_id: &AccountId,
        external_id: &MessageId,
    ) -> StoreResult<u32> {
        self.inner.delete_messages(account_id, external_id).await
    }
}

#[tokio::test]
async fn one_persistence_failure_is_isolated() {
    let server = MockServer::start().await;
    mount_mailbox(&server, &["m1", "m2"]).await;

    let store = Arc::new(MemoryStore::new());
    let account = gmail_account(&codec(), chrono::Duration::hours(1));
    store.insert_account(account.clone()).await;

    let mut stores = Stores::single(store.clone());
    stores.messages = Arc::new(RejectingStore {
        inner: store.clone(),
        reject: MessageId::from("m2"),
    });
    let engine = engine_over(stores, &settings_for(&server));

    let result = engine
        .sync()
        .sync_account(&account.id, SyncOptions::default())
        .await
        .unwrap();
    assert_eq!(
        (result.emails_processed, result.emails_added, result.errors_count, result.success),
        (2, 1, 1, false)
    );

    let stored = store.messages_for(&account.id).await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].external_id(), &MessageId::from("m1"));
}

#[tokio::test]
async fn malformed_webhook_is_reported_not_raised() {
    let store = Arc::new(MemoryStore::new());
    let engine = Engine::new(
        Stores::single(store),
        AdapterRegistry::new(),
        &Settings::default(),
    );

    for (kind, payload) in [
        (ProviderKind::Unified, &b"{not json"[..]),
        (ProviderKind::GmailLike, &b"{\"message\": {\"data\": \"!!\"}}"[..]),
        (ProviderKind::Exchange, &b"{}"[..]),
    ] {
        let outcome = engine.webhooks().process_notification(kind, payload).await;
        assert_eq!(outcome, WebhookOutcome::default());
        assert!(!outcome.processed);
        assert_eq!(outcome.messages_processed, 0);
    }
}

#[test]
fn identical_copies_classify_as_unchanged() {
    let mut message = EmailMessage::new("m1", "t1");
    message.subject = "Hello".into();
    message.labels = label_set(["INBOX"]);

    let stored = StoredMessage {
        id: LocalMessageId::from("local-1"),
        account_id: AccountId::from("acc-1"),
        synced_fields: Some(message.tracked_fields()),
        message: message.clone(),
        updated_at: Utc::now(),
    };
    assert_eq!(detect(&stored, &message), Detection::Unchanged);
}

#[test]
fn label_merge_is_a_union() {
    let fields = |labels: &[&str]| TrackedFields {
        subject: "s".into(),
        labels: label_set(labels.iter().copied()),
        ..Default::default()
    };
    let a = fields(&["INBOX", "Work"]);
    let b = fields(&["Work", "Travel"]);
    let c = fields(&["Receipts"]);

    assert_eq!(
        merge_fields(&a, &b).labels,
        label_set(["INBOX", "Travel", "Work"])
    );
    assert_eq!(merge_fields(&a, &b).labels, merge_fields(&b, &a).labels);
    assert_eq!(merge_fields(&a, &a).labels, a.labels);
    assert_eq!(
        merge_fields(&merge_fields(&a, &b), &c).labels,
        merge_fields(&a, &merge_fields(&b, &c)).labels
    );
}
