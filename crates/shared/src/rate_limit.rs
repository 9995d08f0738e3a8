//! In-memory fixed-window rate limiter
//!
//! Each key gets `points` requests per `duration` window. When the window is
//! exhausted and `block_duration` is non-zero the key stays blocked for that
//! long, even across window boundaries. State lives in process memory only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub points: u32,
    pub duration: Duration,
    pub block_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            points: 100,
            duration: Duration::from_secs(60),
            block_duration: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed { remaining: u32 },
    Limited { retry_after: Duration },
}

#[derive(Debug)]
struct Window {
    started_at: Instant,
    consumed: u32,
    blocked_until: Option<Instant>,
}

#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Arc<Mutex<HashMap<String, Window>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Consume one point for `key`
    pub async fn check(&self, key: &str) -> RateLimitResult {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        let window = windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            consumed: 0,
            blocked_until: None,
        });

        if let Some(until) = window.blocked_until {
            if until > now {
                return RateLimitResult::Limited {
                    retry_after: until - now,
                };
            }
            window.blocked_until = None;
            window.started_at = now;
            window.consumed = 0;
        }

        if now.duration_since(window.started_at) >= self.config.duration {
            window.started_at = now;
            window.consumed = 0;
        }

        if window.consumed >= self.config.points {
            if !self.config.block_duration.is_zero() {
                window.blocked_until = Some(now + self.config.block_duration);
                tracing::debug!(key = %key, block_secs = self.config.block_duration.as_secs(), "Rate limit exceeded, blocking key");
                return RateLimitResult::Limited {
                    retry_after: self.config.block_duration,
                };
            }
            let window_end = window.started_at + self.config.duration;
            return RateLimitResult::Limited {
                retry_after: window_end.saturating_duration_since(now),
            };
        }

        window.consumed += 1;
        RateLimitResult::Allowed {
            remaining: self.config.points - window.consumed,
        }
    }

    /// Drop windows that have fully elapsed and are not blocked.
    /// Returns the number of evicted keys.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, w| {
            let blocked = w.blocked_until.is_some_and(|until| until > now);
            blocked || now.duration_since(w.started_at) < self.config.duration
        });
        before - windows.len()
    }

    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.len()
    }
}
