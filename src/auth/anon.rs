//! Anonymous browser identity.
//!
//! Every browser gets an `anon_id` cookie prefixed `anon-`; it is the
//! owner key for all storage and scheduling. There is no account system,
//! so a cookie that fails the prefix check is simply replaced.

use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use uuid::Uuid;

/// Cookie carrying the anonymous id.
pub const ANON_COOKIE_NAME: &str = "anon_id";
/// Required prefix of valid ids.
pub const ANON_COOKIE_PREFIX: &str = "anon-";
/// Cookie lifetime.
const ANON_COOKIE_DAYS: i64 = 180;

/// Mint a fresh anonymous id.
#[must_use]
pub fn new_anon_id() -> String {
    format!("{ANON_COOKIE_PREFIX}{}", Uuid::new_v4().simple())
}

/// Whether a cookie value is a well-formed anon id.
#[must_use]
pub fn is_valid_anon_id(value: &str) -> bool {
    value.starts_with(ANON_COOKIE_PREFIX) && value.len() > ANON_COOKIE_PREFIX.len()
}

/// The caller's anon id, or the shared guest namespace when the cookie
/// is absent or malformed.
#[must_use]
pub fn anon_id_from_jar(jar: &CookieJar) -> String {
    jar.get(ANON_COOKIE_NAME)
        .map(Cookie::value)
        .filter(|v| is_valid_anon_id(v))
        .map_or_else(|| format!("{ANON_COOKIE_PREFIX}guest"), str::to_owned)
}

/// Ensure the jar carries a valid anon id cookie; returns the updated
/// jar and the effective id.
#[must_use]
pub fn ensure_anon_cookie(jar: CookieJar, secure: bool) -> (CookieJar, String) {
    if let Some(existing) = jar
        .get(ANON_COOKIE_NAME)
        .map(Cookie::value)
        .filter(|v| is_valid_anon_id(v))
    {
        let id = existing.to_owned();
        return (jar, id);
    }
    let id = new_anon_id();
    let cookie = Cookie::build((ANON_COOKIE_NAME, id.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .max_age(time::Duration::days(ANON_COOKIE_DAYS))
        .build();
    (jar.add(cookie), id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_are_prefixed_and_unique() {
        let a = new_anon_id();
        let b = new_anon_id();
        assert!(a.starts_with(ANON_COOKIE_PREFIX));
        assert_ne!(a, b);
        assert!(is_valid_anon_id(&a));
    }

    #[test]
    fn test_missing_cookie_falls_back_to_guest() {
        let jar = CookieJar::new();
        assert_eq!(anon_id_from_jar(&jar), "anon-guest");
    }

    #[test]
    fn test_malformed_cookie_is_replaced() {
        let jar = CookieJar::new().add(Cookie::new(ANON_COOKIE_NAME, "stolen-value"));
        assert_eq!(anon_id_from_jar(&jar), "anon-guest");
        let (jar, id) = ensure_anon_cookie(jar, false);
        assert!(is_valid_anon_id(&id));
        assert_eq!(jar.get(ANON_COOKIE_NAME).expect("cookie").value(), id);
    }

    #[test]
    fn test_existing_valid_cookie_kept() {
        let jar = CookieJar::new().add(Cookie::new(ANON_COOKIE_NAME, "anon-abc123"));
        let (_jar, id) = ensure_anon_cookie(jar, false);
        assert_eq!(id, "anon-abc123");
    }
}
