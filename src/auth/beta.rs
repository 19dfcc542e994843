//! Shared-password beta gate.
//!
//! When `BETA_PASSWORD` is set, browsers must present a cookie holding
//! `SHA-256("beta_gate:v1:" + password)`. This is a soft gate for a
//! closed beta, not account security — but the comparison is still
//! constant-time.

use sha2::{Digest, Sha256};

use super::constant_time_eq;
use crate::config::Config;

/// Derivation prefix; kept stable so issued cookies survive restarts.
const TOKEN_CONTEXT: &str = "beta_gate:v1:";

/// Derive the expected cookie value from the shared password.
#[must_use]
pub fn beta_token(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(TOKEN_CONTEXT.as_bytes());
    hasher.update(password.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Whether the gate is enabled at all.
#[must_use]
pub fn beta_enabled(cfg: &Config) -> bool {
    cfg.beta_password
        .as_deref()
        .is_some_and(|pw| !pw.trim().is_empty())
}

/// The expected cookie value, when the gate is enabled.
#[must_use]
pub fn expected_cookie_value(cfg: &Config) -> Option<String> {
    let password = cfg.beta_password.as_deref()?.trim();
    if password.is_empty() {
        return None;
    }
    Some(beta_token(password))
}

/// Whether a request carrying `cookie_value` passes the gate. Trivially
/// true when the gate is disabled.
#[must_use]
pub fn is_request_authed(cfg: &Config, cookie_value: Option<&str>) -> bool {
    let Some(expected) = expected_cookie_value(cfg) else {
        return true;
    };
    cookie_value.is_some_and(|got| constant_time_eq(got.as_bytes(), expected.as_bytes()))
}

/// Check a submitted password against the configured one.
#[must_use]
pub fn password_matches(cfg: &Config, submitted: &str) -> bool {
    let Some(expected) = expected_cookie_value(cfg) else {
        return false;
    };
    constant_time_eq(beta_token(submitted.trim()).as_bytes(), expected.as_bytes())
}
