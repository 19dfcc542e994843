//! The few HTML-adjacent endpoints: the landing redirect and the beta
//! login flow. The real frontend ships as static assets; no templating
//! happens here.

use axum::Form;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;

use crate::api::server::AppState;
use crate::auth::{anon, beta};

/// `GET /` — make sure the browser carries an anon id, then hand off to
/// the static frontend.
pub async fn landing(State(state): State<AppState>, jar: CookieJar) -> Response {
    let (jar, _id) = anon::ensure_anon_cookie(jar, state.config.cookie_secure);
    (jar, Redirect::to("/static/index.html")).into_response()
}

/// `GET /beta-login` — minimal inline form; no static assets load before
/// the gate.
pub async fn beta_login_page() -> Html<&'static str> {
    Html(
        r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>Beta access</title>
    <style>
      body { font-family: system-ui, sans-serif; background: #0b1220; color: #e5e7eb; margin: 0; }
      .wrap { max-width: 520px; margin: 10vh auto; padding: 24px; }
      .card { background: rgba(255,255,255,0.06); border: 1px solid rgba(255,255,255,0.12); border-radius: 14px; padding: 20px; }
      h1 { font-size: 20px; margin: 0 0 10px; }
      input { width: 100%; box-sizing: border-box; padding: 12px; border-radius: 10px; border: 1px solid rgba(255,255,255,0.18); background: rgba(0,0,0,0.25); color: #fff; }
      button { margin-top: 12px; width: 100%; padding: 12px 14px; border-radius: 10px; border: 0; background: #2563eb; color: #fff; font-weight: 700; cursor: pointer; }
      .hint { margin-top: 10px; font-size: 12px; color: rgba(229,231,235,0.7); }
    </style>
  </head>
  <body>
    <div class="wrap">
      <div class="card">
        <h1>Beta access password</h1>
        <p>This service requires a password during the beta period.</p>
        <form method="post" action="/beta-login">
          <label for="pw">Password</label>
          <input id="pw" name="password" type="password" autocomplete="current-password" required />
          <button type="submit">Enter</button>
        </form>
        <div class="hint">Cookies must be enabled; in-app browsers may not store them.</div>
      </div>
    </div>
  </body>
</html>"#,
    )
}

/// Form body of the login submit.
#[derive(Debug, Deserialize)]
pub struct BetaLoginForm {
    /// The shared beta password.
    #[serde(default)]
    pub password: String,
}

/// `POST /beta-login` — verify the password and set the derived cookie.
/// Wrong passwords bounce back to the form without detail.
pub async fn beta_login_submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Form(form): Form<BetaLoginForm>,
) -> Response {
    if !beta::beta_enabled(&state.config) {
        return Redirect::to("/").into_response();
    }
    let Some(expected) = beta::expected_cookie_value(&state.config) else {
        return Redirect::to("/beta-login").into_response();
    };
    if !beta::password_matches(&state.config, &form.password) {
        return Redirect::to("/beta-login").into_response();
    }

    // A Secure cookie over plain HTTP would never come back and the user
    // would loop on the login form; downgrade with a warning instead.
    let forwarded_proto = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or("").trim().to_ascii_lowercase());
    let is_https = forwarded_proto.as_deref() == Some("https");
    let secure = state.config.cookie_secure && is_https;
    if state.config.cookie_secure && !is_https {
        tracing::warn!(
            "COOKIE_SECURE is set but the request is not HTTPS; issuing a non-secure beta cookie"
        );
    }

    let cookie = Cookie::build((state.config.beta_cookie_name.clone(), expected))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(time::Duration::days(14))
        .build();
    (jar.add(cookie), Redirect::to("/")).into_response()
}
