//! Request middleware: beta gate, request logging, feed-trash gate, and
//! the admin BasicAuth guard.
//!
//! Order on the router (outermost first): beta gate → request logging →
//! trash gate → handlers. The static mounts skip logging by path but the
//! trash gate still covers them.

use axum::Json;
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use serde_json::json;
use std::time::Instant;
use uuid::Uuid;

use super::server::AppState;
use crate::auth::{admin, beta};

/// Response header carrying the request id.
pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Shared-password beta gate.
///
/// Pages redirect to the login form; API calls get a JSON 401 so
/// `fetch().json()` keeps working. The status WebSocket is let through —
/// the handler closes unauthenticated upgrades with code 4401.
pub async fn beta_gate(
    State(state): State<AppState>,
    jar: CookieJar,
    request: Request,
    next: Next,
) -> Response {
    if !beta::beta_enabled(&state.config) {
        return next.run(request).await;
    }
    let path = request.uri().path();
    if path.starts_with("/beta-login") || path == "/healthz" || path.starts_with("/ws/") {
        return next.run(request).await;
    }
    let cookie = jar
        .get(&state.config.beta_cookie_name)
        .map(Cookie::value);
    if beta::is_request_authed(&state.config, cookie) {
        return next.run(request).await;
    }
    if path.starts_with("/api/") {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "detail": "beta_auth_required" })),
        )
            .into_response();
    }
    Redirect::to("/beta-login").into_response()
}

/// Assign a request id, log request/response, echo the id back.
/// The static mounts are skipped entirely — they are too chatty.
pub async fn request_log(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_owned();
    if path.starts_with("/static") || path.starts_with("/outputs") {
        return next.run(request).await;
    }
    let request_id = Uuid::new_v4().simple().to_string();
    let method = request.method().clone();
    let start = Instant::now();
    tracing::info!(request_id = %request_id, method = %method, path = %path, "http request");

    let mut response = next.run(request).await;

    let duration_ms = start.elapsed().as_millis();
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = duration_ms as u64,
        "http response"
    );
    response
}

/// Feed trash assets are admin-only. Non-admin callers get a 404 — not a
/// 403 — so deletion state does not leak.
pub async fn feed_trash_gate(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if request.uri().path().starts_with("/outputs/feed/trash/") {
        let authorization = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if !admin::is_admin_authorization(&state.config, authorization) {
            return StatusCode::NOT_FOUND.into_response();
        }
    }
    next.run(request).await
}

/// BasicAuth guard for the admin surface. Challenges with
/// `WWW-Authenticate` so browsers show the credential prompt.
pub async fn admin_guard(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if admin::is_admin_authorization(&state.config, authorization) {
        return next.run(request).await;
    }
    let mut response = (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "detail": "admin_auth_required" })),
    )
        .into_response();
    response.headers_mut().insert(
        WWW_AUTHENTICATE,
        HeaderValue::from_static("Basic realm=\"admin\""),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::body::Body;
    use axum::routing::get;
    use tower::ServiceExt;

    async fn handler() -> StatusCode {
        StatusCode::OK
    }

    #[tokio::test]
    async fn test_request_id_echoed_in_response() {
        let app = Router::new()
            .route("/api/v1/ping", get(handler))
            .layer(axum::middleware::from_fn(request_log));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/v1/ping")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let header = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .expect("request id set");
        assert_eq!(header.to_str().expect("ascii").len(), 32);
    }

    #[tokio::test]
    async fn test_static_paths_skip_request_id() {
        let app = Router::new()
            .route("/outputs/{*rest}", get(handler))
            .layer(axum::middleware::from_fn(request_log));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/outputs/users/x.png")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert!(response.headers().get(REQUEST_ID_HEADER).is_none());
    }
}
