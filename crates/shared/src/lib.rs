#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Sessionward shared infrastructure
//!
//! Database bootstrap and the in-memory request rate limiter used by the API
//! server and the background worker.

pub mod db;
pub mod rate_limit;

pub use db::{create_pool, run_migrations, DbError};
pub use rate_limit::{RateLimitConfig, RateLimitResult, RateLimiter};
