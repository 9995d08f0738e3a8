//! Auth endpoints
//!
//! Access tokens arrive as `Authorization: Bearer`. Refresh tokens arrive in
//! the JSON body or the `refresh_token` cookie, and are set back as an
//! HttpOnly cookie on every issue. A refresh token taken from the cookie is
//! only honoured when the request echoes the `csrf_token` cookie in the
//! `x-csrf-token` header.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use serde::Deserialize;
use serde_json::json;
use sessionward_shared::RateLimitResult;

use super::{success, ApiJson, ClientContext};
use crate::{
    auth::{
        middleware::{
            cookie_value, generate_csrf_token, verify_csrf, TokenSource, CSRF_TOKEN_COOKIE,
            REFRESH_TOKEN_COOKIE,
        },
        users::normalize_email,
        validate_password_strength, AttemptKey, AttemptOutcome, AuthResponse, AuthUser,
        LoginInput, RegisterInput,
    },
    error::{ApiError, ApiResult, ErrorKind},
    state::AppState,
};

const MAX_EMAIL_LENGTH: usize = 255;
const MAX_NAME_LENGTH: usize = 100;
const REFRESH_COOKIE_PATH: &str = "/api/v1/auth";
const CSRF_COOKIE_PATH: &str = "/";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    #[serde(alias = "first_name")]
    pub first_name: String,
    #[serde(alias = "last_name")]
    pub last_name: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshRequest {
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
}

fn validate_email(raw: &str) -> ApiResult<String> {
    let email = normalize_email(raw);
    let valid = email.len() <= MAX_EMAIL_LENGTH
        && !email.chars().any(char::is_whitespace)
        && matches!(
            email.split_once('@'),
            Some((local, domain)) if !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !domain.contains('@')
        );
    if !valid {
        return Err(ApiError::BadRequest("Invalid email address".to_string()));
    }
    Ok(email)
}

fn validate_name(field: &str, raw: &str) -> ApiResult<()> {
    let length = raw.trim().chars().count();
    if length == 0 || length > MAX_NAME_LENGTH {
        return Err(ApiError::BadRequest(format!(
            "{field} must be between 1 and {MAX_NAME_LENGTH} characters"
        )));
    }
    Ok(())
}

struct CookieSpec<'a> {
    name: &'a str,
    path: &'a str,
    http_only: bool,
}

const REFRESH: CookieSpec<'static> = CookieSpec {
    name: REFRESH_TOKEN_COOKIE,
    path: REFRESH_COOKIE_PATH,
    http_only: true,
};

// Readable by page scripts, which echo it back in the header
const CSRF: CookieSpec<'static> = CookieSpec {
    name: CSRF_TOKEN_COOKIE,
    path: CSRF_COOKIE_PATH,
    http_only: false,
};

fn cookie(
    state: &AppState,
    spec: &CookieSpec<'_>,
    value: &str,
    max_age_secs: u64,
) -> Option<HeaderValue> {
    let mut cookie = format!(
        "{}={value}; SameSite=Strict; Path={}; Max-Age={max_age_secs}",
        spec.name, spec.path
    );
    if spec.http_only {
        cookie.push_str("; HttpOnly");
    }
    if state.config.cookie_secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie).ok()
}

fn with_cookies<const N: usize>(
    mut response: Response,
    cookies: [Option<HeaderValue>; N],
) -> Response {
    for cookie in cookies.into_iter().flatten() {
        response.headers_mut().append(header::SET_COOKIE, cookie);
    }
    response
}

/// Expire both the refresh and the CSRF cookie
fn clearing_cookies(state: &AppState, response: Response) -> Response {
    with_cookies(
        response,
        [cookie(state, &REFRESH, "", 0), cookie(state, &CSRF, "", 0)],
    )
}

fn issued(state: &AppState, status: StatusCode, message: &str, auth: AuthResponse) -> Response {
    let max_age = state.config.auth.refresh_token_ttl.as_secs();
    let refresh = cookie(state, &REFRESH, &auth.tokens.refresh_token, max_age);
    let csrf = cookie(state, &CSRF, &generate_csrf_token(), max_age);
    with_cookies(success(status, message, auth), [refresh, csrf])
}

/// Refresh token from the JSON body, falling back to the cookie
fn presented_refresh_token(
    headers: &HeaderMap,
    body: &Bytes,
) -> ApiResult<Option<(String, TokenSource)>> {
    let from_body = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        serde_json::from_slice::<RefreshRequest>(body)
            .map_err(|_| ApiError::BadRequest("Malformed JSON body".to_string()))?
            .refresh_token
            .filter(|t| !t.is_empty())
    };
    Ok(from_body
        .map(|token| (token, TokenSource::Explicit))
        .or_else(|| {
            cookie_value(headers, REFRESH_TOKEN_COOKIE).map(|token| (token, TokenSource::Cookie))
        }))
}

/// Issue a CSRF token and set it as the `csrf_token` cookie
pub async fn csrf_token(State(state): State<AppState>) -> Response {
    let token = generate_csrf_token();
    let csrf = cookie(
        &state,
        &CSRF,
        &token,
        state.config.auth.refresh_token_ttl.as_secs(),
    );
    with_cookies(
        success(
            StatusCode::OK,
            "CSRF token issued",
            json!({ "csrf_token": token }),
        ),
        [csrf],
    )
}

pub async fn register(
    State(state): State<AppState>,
    ClientContext(ctx): ClientContext,
    ApiJson(body): ApiJson<RegisterRequest>,
) -> ApiResult<Response> {
    let email = validate_email(&body.email)?;
    validate_password_strength(&body.password).map_err(ApiError::BadRequest)?;
    validate_name("First name", &body.first_name)?;
    validate_name("Last name", &body.last_name)?;

    let auth = state
        .auth_service
        .register(
            RegisterInput {
                email,
                password: body.password,
                first_name: body.first_name,
                last_name: body.last_name,
            },
            &ctx,
        )
        .await?;

    Ok(issued(&state, StatusCode::CREATED, "Registration successful", auth))
}

pub async fn login(
    State(state): State<AppState>,
    ClientContext(ctx): ClientContext,
    ApiJson(body): ApiJson<LoginRequest>,
) -> ApiResult<Response> {
    let email = validate_email(&body.email)?;
    if body.password.is_empty() {
        return Err(ApiError::BadRequest("Password is required".to_string()));
    }

    let key = AttemptKey::new(Some(&email), ctx.ip.as_deref());
    state.login_attempts.guard(&key).await?;

    let ip = ctx.ip.as_deref().unwrap_or("unknown");
    if let RateLimitResult::Limited { retry_after } = state.login_rate_limiter.check(ip).await {
        tracing::warn!(ip = %ip, "Login rate limit exceeded");
        state
            .login_attempts
            .record_outcome(&key, AttemptOutcome::Failed(ErrorKind::RateLimited), &ctx)
            .await;
        return Err(ApiError::RateLimited { retry_after });
    }

    let result = state
        .auth_service
        .login(
            LoginInput {
                email,
                password: body.password,
            },
            &ctx,
        )
        .await;
    state
        .login_attempts
        .record_outcome(&key, AttemptOutcome::of(&result), &ctx)
        .await;

    Ok(issued(&state, StatusCode::OK, "Login successful", result?))
}

pub async fn refresh(
    State(state): State<AppState>,
    ClientContext(ctx): ClientContext,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let (token, source) = presented_refresh_token(&headers, &body)?
        .ok_or_else(|| ApiError::Unauthenticated("Refresh token is required".to_string()))?;
    if source == TokenSource::Cookie {
        verify_csrf(&headers)?;
    }

    let auth = state.auth_service.refresh(&token, &ctx).await?;
    Ok(issued(&state, StatusCode::OK, "Token refreshed", auth))
}

/// Succeeds and clears the auth cookies whatever the token's state. A token
/// taken from the cookie still needs the CSRF header.
pub async fn logout(
    State(state): State<AppState>,
    ClientContext(ctx): ClientContext,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    let presented = presented_refresh_token(&headers, &body).unwrap_or_else(|_| {
        cookie_value(&headers, REFRESH_TOKEN_COOKIE).map(|token| (token, TokenSource::Cookie))
    });
    if let Some((_, TokenSource::Cookie)) = presented {
        verify_csrf(&headers)?;
    }

    let token = presented.map(|(token, _)| token);
    state.auth_service.logout(token.as_deref(), &ctx).await;

    Ok(clearing_cookies(
        &state,
        success(StatusCode::OK, "Logged out", json!(null)),
    ))
}

pub async fn logout_all(
    State(state): State<AppState>,
    ClientContext(ctx): ClientContext,
    auth_user: AuthUser,
) -> ApiResult<Response> {
    let sessions_revoked = state
        .auth_service
        .logout_all(auth_user.user_id, &ctx)
        .await?;

    Ok(clearing_cookies(
        &state,
        success(
            StatusCode::OK,
            "Logged out of all sessions",
            json!({ "sessions_revoked": sessions_revoked }),
        ),
    ))
}

pub async fn me(State(state): State<AppState>, auth_user: AuthUser) -> ApiResult<Response> {
    let user = state.auth_service.me(auth_user.user_id).await?;
    Ok(success(StatusCode::OK, "Current user", user))
}

pub async fn list_sessions(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> ApiResult<Response> {
    let sessions = state.auth_service.list_sessions(auth_user.user_id).await?;
    Ok(success(StatusCode::OK, "Active sessions", sessions))
}
