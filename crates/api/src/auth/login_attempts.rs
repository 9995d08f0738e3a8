//! Login attempt throttling
//!
//! Failed logins are counted per (identifier, source address). Past a first
//! threshold each attempt is slowed down in proportion to the number of
//! failures; past a second one the key is locked for a fixed period.
//! State lives only in process memory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::clock::Clock;
use super::events::{AuthEvent, AuthEventSink};
use super::sessions::SessionContext;
use crate::error::{ApiError, ApiResult, ErrorKind};

const UNKNOWN: &str = "unknown";
const MAX_IDENTIFIER_LENGTH: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginThrottleConfig {
    /// Failures before attempts start being delayed. 0 disables the delay.
    pub delay_after_failures: u32,
    pub base_delay: Duration,
    /// Failures that lock the key. 0 disables lockout.
    pub lock_after_failures: u32,
    pub lock_for: Duration,
    /// Idle time after which an unlocked entry is forgotten
    pub attempt_ttl: Duration,
}

impl Default for LoginThrottleConfig {
    fn default() -> Self {
        Self {
            delay_after_failures: 3,
            base_delay: Duration::from_millis(250),
            lock_after_failures: 7,
            lock_for: Duration::from_secs(300),
            attempt_ttl: Duration::from_secs(1800),
        }
    }
}

/// Normalized tracker key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttemptKey(String);

impl AttemptKey {
    pub fn new(identifier: Option<&str>, source: Option<&str>) -> Self {
        let identifier = identifier
            .map(|id| id.trim().to_lowercase())
            .filter(|id| !id.is_empty() && id.len() <= MAX_IDENTIFIER_LENGTH && id.contains('@'))
            .unwrap_or_else(|| UNKNOWN.to_string());
        let source = source
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN);
        Self(format!("{identifier}|{source}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// What happened to a login attempt that was let through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    Failed(ErrorKind),
}

impl AttemptOutcome {
    pub fn of<T>(result: &ApiResult<T>) -> Self {
        match result {
            Ok(_) => AttemptOutcome::Success,
            Err(e) => AttemptOutcome::Failed(e.kind()),
        }
    }

    fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            AttemptOutcome::Failed(
                ErrorKind::Unauthenticated | ErrorKind::Forbidden | ErrorKind::RateLimited
            )
        )
    }
}

#[derive(Debug, Clone)]
struct AttemptState {
    failures: u32,
    updated_at: OffsetDateTime,
    lock_until: Option<OffsetDateTime>,
}

impl AttemptState {
    fn is_locked_at(&self, now: OffsetDateTime) -> bool {
        self.lock_until.is_some_and(|until| until > now)
    }

    /// Forgotten entries behave as if absent
    fn is_stale_at(&self, now: OffsetDateTime, ttl: Duration) -> bool {
        match self.lock_until {
            Some(until) => until <= now,
            None => now - self.updated_at > ttl,
        }
    }
}

fn remaining(until: OffsetDateTime, now: OffsetDateTime) -> Duration {
    Duration::try_from(until - now).unwrap_or(Duration::ZERO)
}

pub struct LoginAttemptTracker {
    config: LoginThrottleConfig,
    entries: Mutex<HashMap<AttemptKey, AttemptState>>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn AuthEventSink>,
}

impl LoginAttemptTracker {
    pub fn new(
        config: LoginThrottleConfig,
        clock: Arc<dyn Clock>,
        events: Arc<dyn AuthEventSink>,
    ) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            clock,
            events,
        }
    }

    pub fn config(&self) -> &LoginThrottleConfig {
        &self.config
    }

    /// Decide whether an attempt may proceed and how long it must wait first.
    /// A locked key fails with `Locked` carrying the time left on the lock.
    pub async fn check(&self, key: &AttemptKey) -> ApiResult<Duration> {
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        let Some(state) = entries.get(key) else {
            return Ok(Duration::ZERO);
        };

        if let Some(until) = state.lock_until.filter(|until| *until > now) {
            return Err(ApiError::Locked {
                retry_after: remaining(until, now),
            });
        }
        if state.is_stale_at(now, self.config.attempt_ttl) {
            entries.remove(key);
            return Ok(Duration::ZERO);
        }

        Ok(self.delay_for(state.failures))
    }

    /// `check`, then wait out any delay
    pub async fn guard(&self, key: &AttemptKey) -> ApiResult<()> {
        let delay = self.check(key).await?;
        if !delay.is_zero() {
            tracing::debug!(key = %key.as_str(), delay_ms = delay.as_millis() as u64, "Delaying login attempt");
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    pub async fn record_outcome(
        &self,
        key: &AttemptKey,
        outcome: AttemptOutcome,
        ctx: &SessionContext,
    ) {
        if outcome == AttemptOutcome::Success {
            self.entries.lock().await.remove(key);
            return;
        }
        if !outcome.counts_as_failure() {
            return;
        }

        let now = self.clock.now();
        let locked_with = {
            let mut entries = self.entries.lock().await;
            let state = entries.entry(key.clone()).or_insert(AttemptState {
                failures: 0,
                updated_at: now,
                lock_until: None,
            });

            if state.is_stale_at(now, self.config.attempt_ttl) {
                state.failures = 0;
                state.lock_until = None;
            }

            state.failures = state.failures.saturating_add(1);
            state.updated_at = now;

            let threshold = self.config.lock_after_failures;
            if threshold > 0 && state.failures >= threshold && !state.is_locked_at(now) {
                state.lock_until = Some(now + self.config.lock_for);
                Some(state.failures)
            } else {
                None
            }
        };

        if let Some(failures) = locked_with {
            self.events.emit(
                &AuthEvent::LockedOut {
                    key: key.as_str().to_string(),
                    failures,
                    lock_for: self.config.lock_for,
                },
                ctx,
            );
        }
    }

    /// Evict entries whose lock has ended or that sat idle past the TTL.
    /// Returns the number evicted.
    pub async fn sweep(&self) -> usize {
        let now = self.clock.now();
        let ttl = self.config.attempt_ttl;
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, state| !state.is_stale_at(now, ttl));
        before - entries.len()
    }

    pub async fn tracked_keys(&self) -> usize {
        self.entries.lock().await.len()
    }

    fn delay_for(&self, failures: u32) -> Duration {
        let threshold = self.config.delay_after_failures;
        if threshold == 0 || failures < threshold {
            return Duration::ZERO;
        }
        self.config
            .base_delay
            .saturating_mul(failures - threshold + 1)
    }
}

/// Periodically sweep the tracker until the task is aborted
pub fn spawn_sweeper(tracker: Arc<LoginAttemptTracker>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(every);

        loop {
            interval_timer.tick().await;
            let evicted = tracker.sweep().await;
            if evicted > 0 {
                tracing::debug!(evicted, "Swept login attempt entries");
            }
        }
    })
}
