//! Authentication middleware for Axum

use std::net::IpAddr;

use argon2::password_hash::rand_core::{OsRng, RngCore};
use axum::{
    extract::{FromRequestParts, Request, State},
    http::{
        header::{AUTHORIZATION, COOKIE, USER_AGENT},
        request::Parts,
        HeaderMap,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use super::jwt::JwtManager;
use super::users::Role;
use crate::error::{ApiError, ApiResult};

pub const ACCESS_TOKEN_COOKIE: &str = "access_token";
pub const REFRESH_TOKEN_COOKIE: &str = "refresh_token";
pub const CSRF_TOKEN_COOKIE: &str = "csrf_token";
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Identity proven by a verified access token
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub role: Role,
}

impl AuthUser {
    pub fn require_role(&self, role: Role) -> ApiResult<()> {
        if self.role != role {
            return Err(ApiError::Forbidden("Insufficient permissions".to_string()));
        }
        Ok(())
    }
}

impl<S: Send + Sync> FromRequestParts<S> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthUser>()
            .copied()
            .ok_or_else(|| ApiError::Unauthenticated("Authentication required".to_string()))
    }
}

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub jwt: JwtManager,
}

/// Value of cookie `name`, if present
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|cookies| cookies.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

/// Where a presented token was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// Explicitly sent by the client (Authorization header or JSON body)
    Explicit,
    /// Attached by the browser
    Cookie,
}

/// Extract the access token from the Authorization header or the access
/// token cookie. The header wins when both are present.
pub fn extract_access_token(headers: &HeaderMap) -> Option<(String, TokenSource)> {
    let from_header = headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(|token| (token.to_string(), TokenSource::Explicit));

    from_header.or_else(|| {
        cookie_value(headers, ACCESS_TOKEN_COOKIE).map(|token| (token, TokenSource::Cookie))
    })
}

/// Random value for the double-submit CSRF cookie
pub fn generate_csrf_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// A request that authenticates with a cookie must echo the CSRF cookie in
/// the `x-csrf-token` header
pub fn verify_csrf(headers: &HeaderMap) -> ApiResult<()> {
    let cookie = cookie_value(headers, CSRF_TOKEN_COOKIE);
    let header = headers
        .get(CSRF_HEADER)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match (cookie, header) {
        (Some(cookie), Some(header)) if bool::from(cookie.as_bytes().ct_eq(header.as_bytes())) => {
            Ok(())
        }
        _ => Err(ApiError::Forbidden("Invalid CSRF token".to_string())),
    }
}

/// Resolve the client address of a request that arrived from `peer`.
///
/// Forwarding headers are only believed when the peer is one of `trusted`.
/// X-Forwarded-For is then read right to left, skipping trusted hops, so the
/// first untrusted entry is the one our own proxy appended.
pub fn resolve_client_ip(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trusted: &[IpAddr],
) -> Option<String> {
    let peer = peer?;
    if !trusted.contains(&peer) {
        return Some(peer.to_string());
    }

    let forwarded = headers
        .get_all("X-Forwarded-For")
        .iter()
        .filter_map(|h| h.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .collect::<Vec<_>>();
    if let Some(hop) = forwarded
        .iter()
        .rev()
        .find(|hop| !hop.parse::<IpAddr>().is_ok_and(|ip| trusted.contains(&ip)))
    {
        return Some(hop.parse::<IpAddr>().unwrap_or(peer).to_string());
    }

    let real_ip = headers
        .get("X-Real-IP")
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());
    Some(real_ip.unwrap_or(peer).to_string())
}

pub fn extract_user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
}

/// Middleware that requires a valid access token. Unsafe methods
/// authenticated by the access cookie also need a matching CSRF header.
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some((token, source)) = extract_access_token(request.headers()) else {
        tracing::debug!(path = %request.uri().path(), "require_auth: no token in header or cookie");
        return ApiError::Unauthenticated("Authentication required".to_string()).into_response();
    };

    if source == TokenSource::Cookie && !request.method().is_safe() {
        if let Err(err) = verify_csrf(request.headers()) {
            tracing::warn!(path = %request.uri().path(), "require_auth: CSRF check failed");
            return err.into_response();
        }
    }

    match auth_state.jwt.verify_access(&token) {
        Ok(claims) => {
            let auth_user = AuthUser {
                user_id: claims.sub,
                role: claims.role,
            };
            request.extensions_mut().insert(auth_user);
            next.run(request).await
        }
        Err(err) => {
            tracing::debug!(path = %request.uri().path(), "require_auth: token rejected");
            err.into_response()
        }
    }
}

/// Middleware that requires an admin. Must run after `require_auth`.
pub async fn require_admin(request: Request, next: Next) -> Response {
    let Some(auth_user) = request.extensions().get::<AuthUser>().copied() else {
        return ApiError::Unauthenticated("Authentication required".to_string()).into_response();
    };

    if let Err(err) = auth_user.require_role(Role::Admin) {
        tracing::warn!(user_id = %auth_user.user_id, role = %auth_user.role, "require_admin: insufficient role");
        return err.into_response();
    }
    next.run(request).await
}
