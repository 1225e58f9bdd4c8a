//! mailsync - An email synchronization engine
//!
//! This crate keeps a local replica of remote mailboxes in sync: provider
//! adapters fetch and translate messages, the reconciler applies them to the
//! local store with three-way conflict detection, and the webhook service
//! applies push notifications between polling runs.

pub mod config;
pub mod domain;
pub mod providers;
pub mod services;
pub mod storage;

pub use services::Engine;
