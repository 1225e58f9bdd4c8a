//! External service providers.
//!
//! - [`email`] - Email provider adapters (Gmail-like API, unified API)

pub mod email;
