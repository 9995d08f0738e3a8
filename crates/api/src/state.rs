//! Application state

use std::sync::Arc;

use sessionward_shared::RateLimiter;
use sqlx::PgPool;

use crate::{
    auth::{
        clock::{Clock, SystemClock},
        events::{AuthEventSink, TracingEventSink},
        login_attempts::LoginAttemptTracker,
        password::Argon2Hasher,
        service::AuthService,
        sessions::SessionManager,
        store::{PgSessionStore, PgUserStore, SessionStore, UserStore},
        AuthState, JwtManager,
    },
    config::Config,
    error::ApiResult,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// None when running on in-memory stores
    pub pool: Option<PgPool>,
    pub config: Arc<Config>,
    pub auth_service: AuthService,
    pub auth: AuthState,
    pub login_attempts: Arc<LoginAttemptTracker>,
    /// General per-IP limiter for auth routes
    pub rate_limiter: RateLimiter,
    /// Stricter per-IP limiter for login
    pub login_rate_limiter: RateLimiter,
}

/// Collaborators that differ between production and tests
pub struct Backends {
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<dyn AuthEventSink>,
    pub hasher: Argon2Hasher,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> ApiResult<Self> {
        let backends = Backends {
            users: Arc::new(PgUserStore::new(pool.clone())),
            sessions: Arc::new(PgSessionStore::new(pool.clone())),
            clock: Arc::new(SystemClock),
            events: Arc::new(TracingEventSink),
            hasher: Argon2Hasher::new(),
        };
        let mut state = Self::with_backends(config, backends)?;
        state.pool = Some(pool);
        Ok(state)
    }

    pub fn with_backends(config: Config, backends: Backends) -> ApiResult<Self> {
        let auth_config = &config.auth;

        let jwt = JwtManager::new(
            &auth_config.access_secret,
            &auth_config.refresh_secret,
            auth_config.access_token_ttl,
            auth_config.refresh_token_ttl,
            backends.clock.clone(),
        );

        let sessions = SessionManager::new(
            backends.sessions,
            backends.clock.clone(),
            backends.events.clone(),
            auth_config.max_active_sessions,
        );

        let auth_service = AuthService::new(
            jwt.clone(),
            backends.hasher,
            backends.users,
            sessions,
            backends.events.clone(),
            backends.clock.clone(),
        )?;

        let login_attempts = Arc::new(LoginAttemptTracker::new(
            auth_config.login_throttle,
            backends.clock,
            backends.events,
        ));

        tracing::info!(
            max_active_sessions = auth_config.max_active_sessions,
            access_ttl_secs = auth_config.access_token_ttl.as_secs(),
            refresh_ttl_secs = auth_config.refresh_token_ttl.as_secs(),
            "Auth engine configured"
        );

        Ok(Self {
            pool: None,
            rate_limiter: RateLimiter::new(auth_config.rate_limit),
            login_rate_limiter: RateLimiter::new(auth_config.login_rate_limit),
            auth: AuthState { jwt },
            auth_service,
            login_attempts,
            config: Arc::new(config),
        })
    }
}
