//! Refresh session lifecycle
//!
//! Every issued refresh token has one `RefreshSession` keyed by its jti.
//! A session starts active and is revoked exactly once, with a reason:
//! rotated, logout, reuse-detected, expired or session-cap-exceeded.
//! `SessionManager` is the only writer of these records.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use super::clock::Clock;
use super::events::{AuthEvent, AuthEventSink, ReuseTrigger};
use super::store::{SessionStore, StoreError};
use crate::error::{ApiError, ApiResult};

/// Request provenance, recorded best-effort on sessions and events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Rotated,
    Logout,
    ReuseDetected,
    Expired,
    SessionCapExceeded,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Rotated => "rotated",
            RevocationReason::Logout => "logout",
            RevocationReason::ReuseDetected => "reuse_detected",
            RevocationReason::Expired => "expired",
            RevocationReason::SessionCapExceeded => "session_cap_exceeded",
        }
    }
}

impl fmt::Display for RevocationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RevocationReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rotated" => Ok(RevocationReason::Rotated),
            "logout" => Ok(RevocationReason::Logout),
            "reuse_detected" => Ok(RevocationReason::ReuseDetected),
            "expired" => Ok(RevocationReason::Expired),
            "session_cap_exceeded" => Ok(RevocationReason::SessionCapExceeded),
            other => Err(format!("unknown revocation reason: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revocation {
    pub reason: RevocationReason,
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub jti: String,
    /// SHA-256 of the raw refresh token, hex encoded. The raw token is never stored.
    pub token_fingerprint: String,
    pub expires_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
    pub revocation: Option<Revocation>,
    /// jti of the successor; only set when revoked as rotated
    pub replaced_by: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl RefreshSession {
    pub fn is_revoked(&self) -> bool {
        self.revocation.is_some()
    }

    pub fn revocation_reason(&self) -> Option<RevocationReason> {
        self.revocation.map(|r| r.reason)
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }

    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        !self.is_revoked() && !self.is_expired_at(now)
    }

    pub fn matches_token(&self, raw_token: &str) -> bool {
        let presented = fingerprint_token(raw_token);
        bool::from(
            presented
                .as_bytes()
                .ct_eq(self.token_fingerprint.as_bytes()),
        )
    }
}

/// Client-visible listing entry. Carries no fingerprint or jti.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl From<&RefreshSession> for SessionSummary {
    fn from(session: &RefreshSession) -> Self {
        Self {
            id: session.id,
            created_at: session.created_at,
            expires_at: session.expires_at,
            ip_address: session.ip_address.clone(),
            user_agent: session.user_agent.clone(),
        }
    }
}

/// Inputs for a session about to be persisted
#[derive(Debug, Clone, Copy)]
pub struct NewSession<'a> {
    pub user_id: Uuid,
    pub raw_token: &'a str,
    pub jti: &'a str,
    pub expires_at: OffsetDateTime,
    pub context: &'a SessionContext,
}

impl NewSession<'_> {
    fn into_record(self, now: OffsetDateTime) -> RefreshSession {
        RefreshSession {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            jti: self.jti.to_string(),
            token_fingerprint: fingerprint_token(self.raw_token),
            expires_at: self.expires_at,
            created_at: now,
            revocation: None,
            replaced_by: None,
            ip_address: self.context.ip.clone(),
            user_agent: self.context.user_agent.clone(),
        }
    }
}

pub fn fingerprint_token(raw_token: &str) -> String {
    hex::encode(Sha256::digest(raw_token.as_bytes()))
}

fn jti_collision(err: StoreError) -> ApiError {
    match err {
        StoreError::Duplicate => {
            ApiError::Internal("refresh token identifier already used".to_string())
        }
        other => other.into(),
    }
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn AuthEventSink>,
    max_active_sessions: usize,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        events: Arc<dyn AuthEventSink>,
        max_active_sessions: usize,
    ) -> Self {
        Self {
            store,
            clock,
            events,
            max_active_sessions,
        }
    }

    /// Persist a session for a freshly issued refresh token. The user's
    /// oldest active sessions beyond the cap are revoked in the same store
    /// operation, so no interleaving leaves the user above the cap.
    pub async fn create_session(&self, new: NewSession<'_>) -> ApiResult<RefreshSession> {
        let now = self.clock.now();
        let session = new.into_record(now);

        if self.max_active_sessions == 0 {
            self.store.insert(&session).await.map_err(jti_collision)?;
        } else {
            let trimmed = self
                .store
                .insert_capped(
                    &session,
                    self.max_active_sessions,
                    RevocationReason::SessionCapExceeded,
                    now,
                )
                .await
                .map_err(jti_collision)?;

            if trimmed > 0 {
                tracing::info!(
                    user_id = %session.user_id,
                    trimmed,
                    max_sessions = self.max_active_sessions,
                    "Revoked oldest sessions due to max sessions limit"
                );
            }
        }

        tracing::debug!(user_id = %session.user_id, jti = %session.jti, "Created refresh session");
        Ok(session)
    }

    /// Look up a session by jti for the claimed owner. Validity beyond
    /// existence is judged by the caller.
    pub async fn validate_session(
        &self,
        user_id: Uuid,
        jti: &str,
    ) -> ApiResult<Option<RefreshSession>> {
        Ok(self.store.find_for_user(user_id, jti).await?)
    }

    /// Decide whether presenting `raw_token` for `session` is reuse of a
    /// spent token or a tampered one. On reuse every remaining session of the
    /// user is revoked.
    pub async fn detect_reuse(
        &self,
        session: &RefreshSession,
        raw_token: &str,
        ctx: &SessionContext,
    ) -> ApiResult<bool> {
        let trigger = if session.is_revoked() {
            ReuseTrigger::RevokedSession
        } else if !session.matches_token(raw_token) {
            ReuseTrigger::FingerprintMismatch
        } else {
            return Ok(false);
        };

        let sessions_revoked = self
            .revoke_all_for_user(session.user_id, RevocationReason::ReuseDetected)
            .await?;

        self.events.emit(
            &AuthEvent::RefreshReuseDetected {
                user_id: session.user_id,
                jti: session.jti.clone(),
                trigger,
                sessions_revoked,
            },
            ctx,
        );

        Ok(true)
    }

    /// Revoke `session_id` as rotated and persist its successor in one step.
    ///
    /// Only one caller can win the rotation of a given session. A caller that
    /// loses the race gets `Unauthenticated` and nothing is written.
    pub async fn rotate_session(
        &self,
        session_id: Uuid,
        successor: NewSession<'_>,
    ) -> ApiResult<RefreshSession> {
        let now = self.clock.now();
        let successor = successor.into_record(now);

        let rotated = self
            .store
            .rotate(session_id, &successor, now)
            .await
            .map_err(jti_collision)?;

        if !rotated {
            tracing::warn!(
                session_id = %session_id,
                user_id = %successor.user_id,
                "Refresh session already revoked, lost concurrent rotation"
            );
            return Err(ApiError::invalid_refresh_token());
        }

        tracing::debug!(
            session_id = %session_id,
            successor_jti = %successor.jti,
            "Rotated refresh session"
        );
        Ok(successor)
    }

    /// Revoke one session. Revoking an already-revoked session is a no-op and
    /// keeps the first reason.
    pub async fn revoke_session(&self, jti: &str, reason: RevocationReason) -> ApiResult<bool> {
        let revoked = self
            .store
            .revoke_if_active(jti, reason, self.clock.now())
            .await?;
        if revoked {
            tracing::debug!(jti = %jti, reason = %reason, "Revoked refresh session");
        }
        Ok(revoked)
    }

    pub async fn revoke_all_for_user(
        &self,
        user_id: Uuid,
        reason: RevocationReason,
    ) -> ApiResult<u64> {
        let revoked = self
            .store
            .revoke_all_for_user(user_id, reason, self.clock.now())
            .await?;
        tracing::info!(user_id = %user_id, reason = %reason, revoked, "Revoked all refresh sessions for user");
        Ok(revoked)
    }

    pub async fn list_active(&self, user_id: Uuid) -> ApiResult<Vec<RefreshSession>> {
        Ok(self
            .store
            .list_active_for_user(user_id, self.clock.now())
            .await?)
    }
}
