//! HTTP surface

pub mod admin;
pub mod auth;

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequest, FromRequestParts, Request, State},
    http::{request::Parts, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use sessionward_shared::RateLimitResult;
use uuid::Uuid;

use crate::{
    auth::{
        middleware::{extract_user_agent, resolve_client_ip},
        require_admin, require_auth, SessionContext,
    },
    error::ApiError,
    state::AppState,
};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// JSON body whose rejection renders through `ApiError`
#[derive(Debug, FromRequest)]
#[from_request(via(Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

/// Provenance of the current request: client IP, user agent, request id
#[derive(Debug, Clone)]
pub struct ClientContext(pub SessionContext);

impl FromRequestParts<AppState> for ClientContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());
        let ip = resolve_client_ip(&parts.headers, peer, &state.config.trusted_proxies);
        let request_id = parts
            .headers
            .get(REQUEST_ID_HEADER)
            .and_then(|h| h.to_str().ok())
            .filter(|id| !id.is_empty() && id.len() <= 128)
            .map(String::from)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(ClientContext(SessionContext {
            ip,
            user_agent: extract_user_agent(&parts.headers),
            request_id: Some(request_id),
        }))
    }
}

/// Success envelope shared by every handler
pub fn success<T: Serialize>(status: StatusCode, message: &str, data: T) -> Response {
    (
        status,
        Json(json!({
            "success": true,
            "message": message,
            "data": data,
        })),
    )
        .into_response()
}

/// Per-IP request limit on the auth routes
async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let (mut parts, body) = request.into_parts();
    let ClientContext(ctx) = match ClientContext::from_request_parts(&mut parts, &state).await {
        Ok(ctx) => ctx,
        Err(err) => return err.into_response(),
    };
    let key = ctx.ip.as_deref().unwrap_or("unknown");

    if let RateLimitResult::Limited { retry_after } = state.rate_limiter.check(key).await {
        tracing::warn!(ip = %key, path = %parts.uri.path(), "Auth rate limit exceeded");
        return ApiError::RateLimited { retry_after }.into_response();
    }

    next.run(Request::from_parts(parts, body)).await
}

async fn health(State(state): State<AppState>) -> Response {
    if let Some(pool) = &state.pool {
        if let Err(e) = sqlx::query("SELECT 1").execute(pool).await {
            tracing::error!(error = %e, "Health check database ping failed");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "degraded", "database": "unreachable" })),
            )
                .into_response();
        }
    }
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") })).into_response()
}

pub fn create_router(state: AppState) -> Router {
    let public = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout))
        .route("/csrf-token", get(auth::csrf_token));

    let protected = Router::new()
        .route("/me", get(auth::me))
        .route("/sessions", get(auth::list_sessions))
        .route("/logout-all", post(auth::logout_all))
        .route_layer(middleware::from_fn_with_state(state.auth.clone(), require_auth));

    let auth_routes = public
        .merge(protected)
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    // Layers run bottom-up: authenticate first, then check the role
    let admin_routes = Router::new()
        .route(
            "/users/{user_id}/sessions/revoke",
            post(admin::revoke_user_sessions),
        )
        .route_layer(middleware::from_fn(require_admin))
        .route_layer(middleware::from_fn_with_state(state.auth.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1/auth", auth_routes)
        .nest("/api/v1/admin", admin_routes)
        .with_state(state)
}
