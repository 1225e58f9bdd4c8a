//! Business services layer.
//!
//! Services orchestrate providers and storage:
//!
//! ```text
//!        Engine
//!          |
//!          v
//!    Services Layer  <-- You are here
//!          |
//!          v
//! Infrastructure (Providers, Storage)
//! ```
//!
//! # Services Overview
//!
//! - [`SyncService`]: polling runs, per-account exclusivity, backoff and real-time setup
//! - [`Reconciler`]: applies a fetched batch to the local replica
//! - [`ConflictService`]: three-way detection, recording and resolution of conflicts
//! - [`WebhookService`]: applies push notifications to the local replica
//! - [`Engine`]: wires the above over one set of stores and adapters

mod conflict_service;
mod engine;
mod reconciler;
mod sync_service;
mod webhook_service;

pub use conflict_service::{
    detect, BulkResolution, ConflictError, ConflictService, Detection,
};
pub use engine::Engine;
pub use reconciler::{ReconcileReport, Reconciler};
pub use sync_service::{SyncError, SyncEvent, SyncOptions, SyncResult, SyncService};
pub use webhook_service::{WebhookError, WebhookOutcome, WebhookService};
