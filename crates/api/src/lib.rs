// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Sessionward API Library
//!
//! Session and credential lifecycle engine: token issuing, refresh rotation
//! with reuse detection, per-user session caps and login throttling, plus
//! the HTTP surface that exposes them.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
