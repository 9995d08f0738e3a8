//! Security event emission
//!
//! Events are fire-and-forget: `emit` is synchronous and must never block
//! or fail the auth path.

use std::time::Duration;

use uuid::Uuid;

use super::sessions::SessionContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailureReason {
    UserNotFound,
    InvalidPassword,
    InactiveAccount,
}

impl LoginFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginFailureReason::UserNotFound => "user_not_found",
            LoginFailureReason::InvalidPassword => "invalid_password",
            LoginFailureReason::InactiveAccount => "inactive_account",
        }
    }
}

/// What made a refresh attempt count as reuse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReuseTrigger {
    RevokedSession,
    FingerprintMismatch,
}

impl ReuseTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReuseTrigger::RevokedSession => "revoked_session",
            ReuseTrigger::FingerprintMismatch => "fingerprint_mismatch",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    Registered {
        user_id: Uuid,
    },
    LoginSucceeded {
        user_id: Uuid,
    },
    LoginFailed {
        reason: LoginFailureReason,
        user_id: Option<Uuid>,
        email: Option<String>,
    },
    RefreshSucceeded {
        user_id: Uuid,
    },
    RefreshReuseDetected {
        user_id: Uuid,
        jti: String,
        trigger: ReuseTrigger,
        sessions_revoked: u64,
    },
    LoggedOut {
        user_id: Uuid,
    },
    LoggedOutEverywhere {
        user_id: Uuid,
        sessions_revoked: u64,
    },
    LockedOut {
        key: String,
        failures: u32,
        lock_for: Duration,
    },
}

impl AuthEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AuthEvent::Registered { .. } => "auth_register",
            AuthEvent::LoginSucceeded { .. } => "auth_login_success",
            AuthEvent::LoginFailed { .. } => "auth_login_failure",
            AuthEvent::RefreshSucceeded { .. } => "auth_refresh_success",
            AuthEvent::RefreshReuseDetected { .. } => "auth_refresh_reuse_detected",
            AuthEvent::LoggedOut { .. } => "auth_logout",
            AuthEvent::LoggedOutEverywhere { .. } => "auth_logout_all",
            AuthEvent::LockedOut { .. } => "auth_login_locked",
        }
    }
}

pub trait AuthEventSink: Send + Sync {
    fn emit(&self, event: &AuthEvent, ctx: &SessionContext);
}

/// Renders events as structured `tracing` records
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl AuthEventSink for TracingEventSink {
    fn emit(&self, event: &AuthEvent, ctx: &SessionContext) {
        let name = event.name();
        let request_id = ctx.request_id.as_deref();
        let ip = ctx.ip.as_deref();

        match event {
            AuthEvent::Registered { user_id } => {
                tracing::info!(event = name, user_id = %user_id, ip = ?ip, request_id = ?request_id, "User registered");
            }
            AuthEvent::LoginSucceeded { user_id } => {
                tracing::info!(event = name, user_id = %user_id, ip = ?ip, request_id = ?request_id, "Login succeeded");
            }
            AuthEvent::LoginFailed {
                reason,
                user_id,
                email,
            } => {
                tracing::warn!(
                    event = name,
                    reason = reason.as_str(),
                    user_id = ?user_id,
                    email = ?email,
                    ip = ?ip,
                    request_id = ?request_id,
                    "Login failed"
                );
            }
            AuthEvent::RefreshSucceeded { user_id } => {
                tracing::info!(event = name, user_id = %user_id, ip = ?ip, request_id = ?request_id, "Refresh token rotated");
            }
            AuthEvent::RefreshReuseDetected {
                user_id,
                jti,
                trigger,
                sessions_revoked,
            } => {
                tracing::warn!(
                    event = name,
                    user_id = %user_id,
                    jti = %jti,
                    trigger = trigger.as_str(),
                    sessions_revoked = sessions_revoked,
                    ip = ?ip,
                    user_agent = ?ctx.user_agent,
                    request_id = ?request_id,
                    "Refresh token reuse detected, revoked all sessions for user"
                );
            }
            AuthEvent::LoggedOut { user_id } => {
                tracing::info!(event = name, user_id = %user_id, ip = ?ip, request_id = ?request_id, "Logged out");
            }
            AuthEvent::LoggedOutEverywhere {
                user_id,
                sessions_revoked,
            } => {
                tracing::info!(
                    event = name,
                    user_id = %user_id,
                    sessions_revoked = sessions_revoked,
                    ip = ?ip,
                    request_id = ?request_id,
                    "Logged out of all sessions"
                );
            }
            AuthEvent::LockedOut {
                key,
                failures,
                lock_for,
            } => {
                tracing::warn!(
                    event = name,
                    key = %key,
                    failures = failures,
                    lock_secs = lock_for.as_secs(),
                    request_id = ?request_id,
                    "Login attempts locked"
                );
            }
        }
    }
}
