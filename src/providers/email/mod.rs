//! Email provider adapters.
//!
//! This module contains the [`ProviderAdapter`] trait and implementations for
//! the remote services the engine syncs with:
//!
//! - [`GmailAdapter`] - Gmail-like REST API with OAuth 2.0
//! - [`UnifiedAdapter`] - unified multi-provider REST API
//! - [`UnimplementedAdapter`] - zero-effect placeholder for Exchange and IMAP
//!
//! # Architecture
//!
//! Adapters translate provider-native messages into the canonical
//! [`EmailMessage`](crate::domain::EmailMessage) and map provider failures
//! onto [`ProviderError`]. The [`AdapterRegistry`] picks one adapter per run.
//! Push payloads from either service are decoded by [`PushNotification`].
//!
//! # Example
//!
//! ```ignore
//! use mailsync::providers::email::{AdapterRegistry, FetchOptions};
//!
//! async fn first_page(registry: &AdapterRegistry, account: &EmailAccount) {
//!     let adapter = registry.select(account, None).expect("no adapter");
//!     let batch = adapter
//!         .fetch(account, &FetchOptions::full(50))
//!         .await
//!         .expect("fetch failed");
//!
//!     for message in batch.messages {
//!         println!("{}: {}", message.from.display(), message.subject);
//!     }
//! }
//! ```

mod gmail;
mod http;
mod push;
mod registry;
mod stub;
mod token;
mod traits;
mod unified;

pub use gmail::GmailAdapter;
pub use push::{MalformedPayload, NativeNotice, PushNotification, UnifiedDelta};
pub use registry::{AdapterRegistry, UnsupportedProvider};
pub use stub::UnimplementedAdapter;
pub use token::TokenManager;
pub use traits::{
    DeltaChange, FetchBatch, FetchFailure, FetchOptions, HistoryBatch, OutgoingEmail,
    ProviderAdapter, ProviderError, RemoteDelta, Result, SentMessage,
};
pub use unified::UnifiedAdapter;
