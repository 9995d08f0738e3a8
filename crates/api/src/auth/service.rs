//! Registration, login, token refresh and logout
//!
//! `AuthService` ties the credential hasher, token codec, identity store and
//! session manager together. It never swallows a failure except in `logout`.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use super::clock::Clock;
use super::events::{AuthEvent, AuthEventSink, LoginFailureReason};
use super::jwt::JwtManager;
use super::password::Argon2Hasher;
use super::sessions::{NewSession, RevocationReason, SessionContext, SessionManager, SessionSummary};
use super::store::{StoreError, UserStore};
use super::users::{normalize_email, SafeUser, User, UserProfile};
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Clone)]
pub struct RegisterInput {
    pub email: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone)]
pub struct LoginInput {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    /// Access token lifetime in seconds
    pub expires_in: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub access_expires_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub refresh_expires_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub user: SafeUser,
    pub tokens: TokenPair,
}

fn invalid_credentials() -> ApiError {
    ApiError::Unauthenticated("Invalid credentials".to_string())
}

fn account_inactive() -> ApiError {
    ApiError::Forbidden("Account is inactive".to_string())
}

#[derive(Clone)]
pub struct AuthService {
    jwt: JwtManager,
    hasher: Argon2Hasher,
    users: Arc<dyn UserStore>,
    sessions: SessionManager,
    events: Arc<dyn AuthEventSink>,
    clock: Arc<dyn Clock>,
    /// Verified against when the email is unknown so both paths cost the same
    dummy_hash: Arc<str>,
}

impl AuthService {
    pub fn new(
        jwt: JwtManager,
        hasher: Argon2Hasher,
        users: Arc<dyn UserStore>,
        sessions: SessionManager,
        events: Arc<dyn AuthEventSink>,
        clock: Arc<dyn Clock>,
    ) -> ApiResult<Self> {
        let dummy_hash = hasher.generate_impossible_hash()?.into();
        Ok(Self {
            jwt,
            hasher,
            users,
            sessions,
            events,
            clock,
            dummy_hash,
        })
    }

    pub fn jwt(&self) -> &JwtManager {
        &self.jwt
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub async fn register(
        &self,
        input: RegisterInput,
        ctx: &SessionContext,
    ) -> ApiResult<AuthResponse> {
        let email = normalize_email(&input.email);
        if self.users.exists_by_email(&email).await? {
            return Err(ApiError::Conflict("Email is already registered".to_string()));
        }

        let password_hash = self.hasher.hash(&input.password).await?;
        let user = User::new(&email, password_hash, self.clock.now());
        let profile = UserProfile::new(user.id, &input.first_name, &input.last_name);

        // A concurrent registration may win between the check and the insert
        self.users
            .create(&user, &profile)
            .await
            .map_err(|e| match e {
                StoreError::Duplicate => {
                    ApiError::Conflict("Email is already registered".to_string())
                }
                other => other.into(),
            })?;

        let tokens = self.start_session(&user, ctx).await?;
        self.events
            .emit(&AuthEvent::Registered { user_id: user.id }, ctx);

        Ok(AuthResponse {
            user: SafeUser::from(&user),
            tokens,
        })
    }

    pub async fn login(&self, input: LoginInput, ctx: &SessionContext) -> ApiResult<AuthResponse> {
        let email = normalize_email(&input.email);

        let Some(mut user) = self.users.find_by_email(&email).await? else {
            self.hasher.verify(&input.password, &self.dummy_hash).await?;
            self.login_failed(LoginFailureReason::UserNotFound, None, Some(email), ctx);
            return Err(invalid_credentials());
        };

        if !self.hasher.verify(&input.password, &user.password_hash).await? {
            self.login_failed(LoginFailureReason::InvalidPassword, Some(user.id), None, ctx);
            return Err(invalid_credentials());
        }

        if !user.is_active {
            self.login_failed(LoginFailureReason::InactiveAccount, Some(user.id), None, ctx);
            return Err(account_inactive());
        }

        let now = self.clock.now();
        user.last_login_at = Some(now);
        user.updated_at = now;
        self.users.save(&user).await?;

        let tokens = self.start_session(&user, ctx).await?;
        self.events
            .emit(&AuthEvent::LoginSucceeded { user_id: user.id }, ctx);

        Ok(AuthResponse {
            user: SafeUser::from(&user),
            tokens,
        })
    }

    /// Exchange a refresh token for a new pair. The presented token is spent:
    /// its session is rotated and every later use of it counts as reuse.
    pub async fn refresh(&self, raw_token: &str, ctx: &SessionContext) -> ApiResult<AuthResponse> {
        let claims = self.jwt.verify_refresh(raw_token)?;
        let jti = claims
            .jti
            .as_deref()
            .ok_or_else(ApiError::invalid_refresh_token)?;

        let session = self
            .sessions
            .validate_session(claims.sub, jti)
            .await?
            .ok_or_else(ApiError::invalid_refresh_token)?;

        if session.is_expired_at(self.clock.now()) {
            self.sessions
                .revoke_session(jti, RevocationReason::Expired)
                .await?;
            return Err(ApiError::Unauthenticated(
                "Refresh token expired".to_string(),
            ));
        }

        if self.sessions.detect_reuse(&session, raw_token, ctx).await? {
            return Err(ApiError::invalid_refresh_token());
        }

        let user = match self.users.find_by_id(claims.sub).await? {
            Some(user) if user.is_active => user,
            _ => return Err(ApiError::Unauthenticated("User not available".to_string())),
        };

        let successor_jti = Uuid::new_v4().to_string();
        let access = self.jwt.issue_access(user.id, user.role)?;
        let refresh = self.jwt.issue_refresh(user.id, user.role, &successor_jti)?;

        self.sessions
            .rotate_session(
                session.id,
                NewSession {
                    user_id: user.id,
                    raw_token: &refresh.token,
                    jti: &successor_jti,
                    expires_at: refresh.expires_at,
                    context: ctx,
                },
            )
            .await?;

        self.events
            .emit(&AuthEvent::RefreshSucceeded { user_id: user.id }, ctx);

        Ok(AuthResponse {
            user: SafeUser::from(&user),
            tokens: self.token_pair(access.token, access.expires_at, refresh.token, refresh.expires_at),
        })
    }

    /// Best-effort logout. Never fails; returns whether a session was revoked.
    pub async fn logout(&self, raw_token: Option<&str>, ctx: &SessionContext) -> bool {
        let Some(raw_token) = raw_token.filter(|t| !t.is_empty()) else {
            return false;
        };

        let claims = match self.jwt.verify_refresh(raw_token) {
            Ok(claims) => claims,
            Err(_) => return false,
        };
        let Some(jti) = claims.jti.as_deref() else {
            return false;
        };

        match self
            .sessions
            .revoke_session(jti, RevocationReason::Logout)
            .await
        {
            Ok(revoked) => {
                if revoked {
                    self.events
                        .emit(&AuthEvent::LoggedOut { user_id: claims.sub }, ctx);
                }
                revoked
            }
            Err(e) => {
                tracing::warn!(error = %e, user_id = %claims.sub, "Failed to revoke session during logout");
                false
            }
        }
    }

    pub async fn logout_all(&self, user_id: Uuid, ctx: &SessionContext) -> ApiResult<u64> {
        let sessions_revoked = self
            .sessions
            .revoke_all_for_user(user_id, RevocationReason::Logout)
            .await?;
        self.events.emit(
            &AuthEvent::LoggedOutEverywhere {
                user_id,
                sessions_revoked,
            },
            ctx,
        );
        Ok(sessions_revoked)
    }

    pub async fn me(&self, user_id: Uuid) -> ApiResult<SafeUser> {
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| ApiError::NotFound("User not found".to_string()))?;

        if !user.is_active {
            return Err(account_inactive());
        }
        Ok(SafeUser::from(&user))
    }

    pub async fn list_sessions(&self, user_id: Uuid) -> ApiResult<Vec<SessionSummary>> {
        let sessions = self.sessions.list_active(user_id).await?;
        Ok(sessions.iter().map(SessionSummary::from).collect())
    }

    async fn start_session(&self, user: &User, ctx: &SessionContext) -> ApiResult<TokenPair> {
        let jti = Uuid::new_v4().to_string();
        let access = self.jwt.issue_access(user.id, user.role)?;
        let refresh = self.jwt.issue_refresh(user.id, user.role, &jti)?;

        self.sessions
            .create_session(NewSession {
                user_id: user.id,
                raw_token: &refresh.token,
                jti: &jti,
                expires_at: refresh.expires_at,
                context: ctx,
            })
            .await?;

        Ok(self.token_pair(access.token, access.expires_at, refresh.token, refresh.expires_at))
    }

    fn token_pair(
        &self,
        access_token: String,
        access_expires_at: OffsetDateTime,
        refresh_token: String,
        refresh_expires_at: OffsetDateTime,
    ) -> TokenPair {
        TokenPair {
            access_token,
            refresh_token,
            token_type: "Bearer",
            expires_in: self.jwt.access_ttl().as_secs(),
            access_expires_at,
            refresh_expires_at,
        }
    }

    fn login_failed(
        &self,
        reason: LoginFailureReason,
        user_id: Option<Uuid>,
        email: Option<String>,
        ctx: &SessionContext,
    ) {
        self.events.emit(
            &AuthEvent::LoginFailed {
                reason,
                user_id,
                email,
            },
            ctx,
        );
    }
}
