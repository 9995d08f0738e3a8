//! Router-level tests for authentication middleware
//!
//! Tests cover:
//! - Bearer and cookie authentication on protected routes
//! - Access/refresh token confusion
//! - Role-based access control on admin routes
//! - Error envelopes (401, 403, 400, 429 with Retry-After)
//! - Refresh cookie handling on refresh and logout
//! - CSRF double-submit on cookie-authenticated writes
//! - Client address resolution behind (un)trusted proxies

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        extract::ConnectInfo,
        http::{header, HeaderMap, Method, Request, StatusCode},
        Router,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;
    use uuid::Uuid;

    use crate::auth::clock::SystemClock;
    use crate::auth::events::testing::RecordingSink;
    use crate::auth::password::Argon2Hasher;
    use crate::auth::store::{MemorySessionStore, MemoryUserStore};
    use crate::auth::users::Role;
    use crate::config::Config;
    use crate::routes::create_router;
    use crate::state::{AppState, Backends};

    const EMAIL: &str = "router@example.com";
    const PASSWORD: &str = "Passw0rd";

    fn test_config(extra: &[(&'static str, &'static str)]) -> Config {
        let mut vars: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://localhost/sessionward_test"),
            ("JWT_ACCESS_SECRET", "router-access-secret-0123"),
            ("JWT_REFRESH_SECRET", "router-refresh-secret-0123"),
            // No progressive delay, so lockout tests run at full speed
            ("AUTH_LOGIN_DELAY_AFTER_FAILURES", "0"),
        ]);
        vars.extend(extra.iter().copied());
        Config::from_lookup(|key: &str| vars.get(key).map(|v| v.to_string())).unwrap()
    }

    /// Setup a router over in-memory stores
    fn setup() -> (Router, AppState) {
        setup_with(&[])
    }

    fn setup_with(extra: &[(&'static str, &'static str)]) -> (Router, AppState) {
        let backends = Backends {
            users: Arc::new(MemoryUserStore::new()),
            sessions: Arc::new(MemorySessionStore::new()),
            clock: Arc::new(SystemClock),
            events: Arc::new(RecordingSink::default()),
            hasher: Argon2Hasher::with_cost(8, 1, 1).unwrap(),
        };
        let state = AppState::with_backends(test_config(extra), backends).unwrap();
        (create_router(state.clone()), state)
    }

    fn json_request(method: Method, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn bearer_request(method: Method, uri: &str, token: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, body)
    }

    async fn register(app: &Router) -> Value {
        let (status, _, body) = send(
            app,
            json_request(
                Method::POST,
                "/api/v1/auth/register",
                json!({
                    "email": EMAIL,
                    "password": PASSWORD,
                    "firstName": "Router",
                    "lastName": "Test",
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["data"].clone()
    }

    /// The Set-Cookie line for cookie `name`, empty if absent
    fn set_cookie(headers: &HeaderMap, name: &str) -> String {
        headers
            .get_all(header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|line| line.starts_with(&format!("{name}=")))
            .unwrap_or_default()
            .to_string()
    }

    fn cookie_set_to(headers: &HeaderMap, name: &str) -> String {
        let line = set_cookie(headers, name);
        line.split(';')
            .next()
            .and_then(|pair| pair.split_once('='))
            .map(|(_, value)| value.to_string())
            .unwrap_or_default()
    }

    fn from_peer(mut request: Request<Body>, peer: [u8; 4]) -> Request<Body> {
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 40_000))));
        request
    }

    fn login_request(password: &str, peer: [u8; 4], forwarded_for: &str) -> Request<Body> {
        let mut request = json_request(
            Method::POST,
            "/api/v1/auth/login",
            json!({ "email": EMAIL, "password": password }),
        );
        request
            .headers_mut()
            .insert("x-forwarded-for", forwarded_for.parse().unwrap());
        from_peer(request, peer)
    }

    /// Register, returning the response data plus the refresh and CSRF cookies
    async fn register_with_cookies(app: &Router) -> (Value, String, String) {
        let request = json_request(
            Method::POST,
            "/api/v1/auth/register",
            json!({
                "email": EMAIL,
                "password": PASSWORD,
                "firstName": "Router",
                "lastName": "Test",
            }),
        );
        let (status, headers, body) = send(app, request).await;
        assert_eq!(status, StatusCode::CREATED);
        let refresh = cookie_set_to(&headers, "refresh_token");
        let csrf = cookie_set_to(&headers, "csrf_token");
        assert!(!refresh.is_empty() && !csrf.is_empty());
        (body["data"].clone(), refresh, csrf)
    }

    fn cookie_post(uri: &str, cookies: &str, csrf_header: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header(header::COOKIE, cookies);
        if let Some(value) = csrf_header {
            builder = builder.header("x-csrf-token", value);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = setup();
        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();

        let (status, _, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_register_then_me_with_bearer() {
        let (app, _) = setup();
        let data = register(&app).await;
        let access = data["tokens"]["access_token"].as_str().unwrap();
        assert_eq!(data["tokens"]["token_type"], "Bearer");
        assert!(data["user"].get("password_hash").is_none());

        let (status, _, body) = send(&app, bearer_request(Method::GET, "/api/v1/auth/me", access)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["email"], EMAIL);
    }

    #[tokio::test]
    async fn test_me_with_access_cookie() {
        let (app, _) = setup();
        let data = register(&app).await;
        let access = data["tokens"]["access_token"].as_str().unwrap();

        let request = Request::builder()
            .uri("/api/v1/auth/me")
            .header(header::COOKIE, format!("theme=dark; access_token={access}"))
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&app, request).await;

        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_missing_token_is_unauthorized() {
        let (app, _) = setup();
        let request = Request::builder()
            .uri("/api/v1/auth/me")
            .body(Body::empty())
            .unwrap();

        let (status, _, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "unauthenticated");
    }

    #[tokio::test]
    async fn test_refresh_token_rejected_as_bearer() {
        let (app, _) = setup();
        let data = register(&app).await;
        let refresh = data["tokens"]["refresh_token"].as_str().unwrap();

        let (status, _, _) = send(&app, bearer_request(Method::GET, "/api/v1/auth/me", refresh)).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_admin_route_requires_admin_role() {
        let (app, state) = setup();
        let data = register(&app).await;
        let user_id = data["user"]["id"].as_str().unwrap().to_string();
        let access = data["tokens"]["access_token"].as_str().unwrap();
        let uri = format!("/api/v1/admin/users/{user_id}/sessions/revoke");

        let (status, _, body) = send(&app, bearer_request(Method::POST, &uri, access)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "forbidden");

        let anonymous = Request::builder()
            .method(Method::POST)
            .uri(&uri)
            .body(Body::empty())
            .unwrap();
        let (status, _, _) = send(&app, anonymous).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let admin = state.auth.jwt.issue_access(Uuid::new_v4(), Role::Admin).unwrap();
        let (status, _, body) = send(&app, bearer_request(Method::POST, &uri, &admin.token)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["sessions_revoked"], 1);
    }

    #[tokio::test]
    async fn test_repeated_failed_logins_lock_with_retry_after() {
        let (app, _) = setup();
        register(&app).await;
        let wrong = json!({ "email": EMAIL, "password": "Wrong0ne" });

        for _ in 0..7 {
            let (status, _, body) =
                send(&app, json_request(Method::POST, "/api/v1/auth/login", wrong.clone())).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["message"], "Invalid credentials");
        }

        // Locked even with the right password
        let right = json!({ "email": EMAIL, "password": PASSWORD });
        let (status, headers, body) =
            send(&app, json_request(Method::POST, "/api/v1/auth/login", right)).await;

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "locked");
        let retry_after: u64 = headers
            .get(header::RETRY_AFTER)
            .unwrap()
            .to_str()
            .unwrap()
            .parse()
            .unwrap();
        assert!(retry_after > 0 && retry_after <= 300);
    }

    #[tokio::test]
    async fn test_malformed_json_is_bad_request() {
        let (app, _) = setup();
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();

        let (status, _, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "invalid_request");
    }

    #[tokio::test]
    async fn test_refresh_from_cookie_rotates() {
        let (app, _) = setup();
        let (data, refresh, csrf) = register_with_cookies(&app).await;
        assert_eq!(data["tokens"]["refresh_token"], refresh.as_str());

        let request = cookie_post(
            "/api/v1/auth/refresh",
            &format!("refresh_token={refresh}; csrf_token={csrf}"),
            Some(&csrf),
        );
        let (status, headers, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::OK);
        let rotated = body["data"]["tokens"]["refresh_token"].as_str().unwrap();
        assert_ne!(rotated, refresh);
        let cookie = set_cookie(&headers, "refresh_token");
        assert!(cookie.starts_with(&format!("refresh_token={rotated}")));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("Secure"));

        // Spent token is refused
        let (status, _, _) = send(
            &app,
            json_request(
                Method::POST,
                "/api/v1/auth/refresh",
                json!({ "refresh_token": refresh }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_logout_always_succeeds_and_clears_cookie() {
        let (app, _) = setup();
        let data = register(&app).await;
        let refresh = data["tokens"]["refresh_token"].as_str().unwrap();

        let anonymous = Request::builder()
            .method(Method::POST)
            .uri("/api/v1/auth/logout")
            .body(Body::empty())
            .unwrap();
        let (status, headers, _) = send(&app, anonymous).await;
        assert_eq!(status, StatusCode::OK);
        assert!(set_cookie(&headers, "refresh_token").contains("Max-Age=0"));
        assert!(set_cookie(&headers, "csrf_token").contains("Max-Age=0"));

        let (status, _, _) = send(
            &app,
            json_request(
                Method::POST,
                "/api/v1/auth/logout",
                json!({ "refresh_token": refresh }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let access = data["tokens"]["access_token"].as_str().unwrap();
        let (status, _, body) =
            send(&app, bearer_request(Method::GET, "/api/v1/auth/sessions", access)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn test_forged_forwarded_for_does_not_escape_lockout() {
        let (app, _) = setup();
        register(&app).await;
        let peer = [198, 51, 100, 7];

        for attempt in 0..7 {
            let forged = format!("203.0.113.{attempt}");
            let (status, _, _) = send(&app, login_request("Wrong0ne", peer, &forged)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }

        let (status, _, body) =
            send(&app, login_request(PASSWORD, peer, "192.0.2.200")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body["error"], "locked");
    }

    #[tokio::test]
    async fn test_trusted_proxy_separates_clients() {
        let (app, _) = setup_with(&[("TRUSTED_PROXIES", "10.0.0.1")]);
        register(&app).await;
        let proxy = [10, 0, 0, 1];

        for _ in 0..7 {
            let (status, _, _) =
                send(&app, login_request("Wrong0ne", proxy, "203.0.113.5")).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
        }
        let (status, _, _) = send(&app, login_request(PASSWORD, proxy, "203.0.113.5")).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

        // A client-supplied left entry cannot impersonate the locked address
        let (status, _, _) = send(
            &app,
            login_request(PASSWORD, proxy, "203.0.113.5, 203.0.113.6"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_csrf_token_route_sets_readable_cookie() {
        let (app, _) = setup();
        let request = Request::builder()
            .uri("/api/v1/auth/csrf-token")
            .body(Body::empty())
            .unwrap();

        let (status, headers, body) = send(&app, request).await;

        assert_eq!(status, StatusCode::OK);
        let token = body["data"]["csrf_token"].as_str().unwrap();
        assert!(!token.is_empty());
        assert_eq!(cookie_set_to(&headers, "csrf_token"), token);
        let cookie = set_cookie(&headers, "csrf_token");
        assert!(!cookie.contains("HttpOnly"));
        assert!(cookie.contains("Path=/;"));
    }

    #[tokio::test]
    async fn test_cookie_refresh_without_csrf_header_is_forbidden() {
        let (app, _) = setup();
        let (_, refresh, csrf) = register_with_cookies(&app).await;
        let cookies = format!("refresh_token={refresh}; csrf_token={csrf}");

        let (status, _, body) =
            send(&app, cookie_post("/api/v1/auth/refresh", &cookies, None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["message"], "Invalid CSRF token");

        let (status, _, _) = send(
            &app,
            cookie_post("/api/v1/auth/refresh", &cookies, Some("not-the-cookie")),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // The refused attempts did not spend the token
        let (status, _, _) = send(
            &app,
            cookie_post("/api/v1/auth/refresh", &cookies, Some(&csrf)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_cookie_logout_without_csrf_header_revokes_nothing() {
        let (app, _) = setup();
        let (data, refresh, csrf) = register_with_cookies(&app).await;
        let access = data["tokens"]["access_token"].as_str().unwrap();
        let cookies = format!("refresh_token={refresh}; csrf_token={csrf}");

        let (status, headers, _) =
            send(&app, cookie_post("/api/v1/auth/logout", &cookies, None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(set_cookie(&headers, "refresh_token").is_empty());

        let (_, _, body) =
            send(&app, bearer_request(Method::GET, "/api/v1/auth/sessions", access)).await;
        assert_eq!(body["data"].as_array().map(Vec::len), Some(1));

        let (status, _, _) =
            send(&app, cookie_post("/api/v1/auth/logout", &cookies, Some(&csrf))).await;
        assert_eq!(status, StatusCode::OK);
        let (_, _, body) =
            send(&app, bearer_request(Method::GET, "/api/v1/auth/sessions", access)).await;
        assert_eq!(body["data"].as_array().map(Vec::len), Some(0));
    }

    #[tokio::test]
    async fn test_cookie_authenticated_logout_all_needs_csrf_header() {
        let (app, _) = setup();
        let (data, _, csrf) = register_with_cookies(&app).await;
        let access = data["tokens"]["access_token"].as_str().unwrap();
        let cookies = format!("access_token={access}; csrf_token={csrf}");

        let (status, _, _) =
            send(&app, cookie_post("/api/v1/auth/logout-all", &cookies, None)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _, body) =
            send(&app, cookie_post("/api/v1/auth/logout-all", &cookies, Some(&csrf))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["sessions_revoked"], 1);
    }

    #[tokio::test]
    async fn test_secure_flag_follows_config() {
        let (app, _) = setup_with(&[("COOKIE_SECURE", "false")]);
        let (_, headers, _) = send(
            &app,
            json_request(
                Method::POST,
                "/api/v1/auth/register",
                json!({
                    "email": EMAIL,
                    "password": PASSWORD,
                    "firstName": "Router",
                    "lastName": "Test",
                }),
            ),
        )
        .await;

        let refresh = set_cookie(&headers, "refresh_token");
        assert!(refresh.contains("HttpOnly"));
        assert!(!refresh.contains("Secure"));
        assert!(!set_cookie(&headers, "csrf_token").contains("Secure"));
    }
}
