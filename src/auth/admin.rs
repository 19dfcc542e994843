//! Admin BasicAuth.
//!
//! The admin surface (and the feed trash tree) is guarded by HTTP Basic
//! credentials from the environment. Both fields compare in constant
//! time; when either is unset the surface is disabled entirely.

use base64::Engine;

use super::constant_time_eq;
use crate::config::Config;

/// Whether an `Authorization` header value carries the admin credentials.
#[must_use]
pub fn is_admin_authorization(cfg: &Config, authorization: Option<&str>) -> bool {
    if !cfg.admin_enabled() {
        return false;
    }
    let (Some(expected_user), Some(expected_password)) =
        (cfg.admin_user.as_deref(), cfg.admin_password.as_deref())
    else {
        return false;
    };
    let Some(header) = authorization else {
        return false;
    };
    let Some(encoded) = header
        .strip_prefix("Basic ")
        .or_else(|| header.strip_prefix("basic "))
    else {
        return false;
    };
    let Ok(decoded) = base64::prelude::BASE64_STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(decoded) = String::from_utf8(decoded) else {
        return false;
    };
    let Some((user, password)) = decoded.split_once(':') else {
        return false;
    };
    constant_time_eq(user.as_bytes(), expected_user.as_bytes())
        & constant_time_eq(password.as_bytes(), expected_password.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn cfg(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("atelier").chain(args.iter().copied()))
            .expect("config parses")
    }

    fn basic(user: &str, password: &str) -> String {
        format!(
            "Basic {}",
            base64::prelude::BASE64_STANDARD.encode(format!("{user}:{password}"))
        )
    }

    #[test]
    fn test_disabled_without_credentials() {
        let cfg = cfg(&[]);
        assert!(!is_admin_authorization(&cfg, Some(&basic("root", "pw"))));
    }

    #[test]
    fn test_accepts_matching_credentials() {
        let cfg = cfg(&["--admin-user", "root", "--admin-password", "pw"]);
        assert!(is_admin_authorization(&cfg, Some(&basic("root", "pw"))));
        assert!(!is_admin_authorization(&cfg, Some(&basic("root", "nope"))));
        assert!(!is_admin_authorization(&cfg, Some(&basic("other", "pw"))));
        assert!(!is_admin_authorization(&cfg, None));
    }

    #[test]
    fn test_rejects_malformed_headers() {
        let cfg = cfg(&["--admin-user", "root", "--admin-password", "pw"]);
        assert!(!is_admin_authorization(&cfg, Some("Bearer abc")));
        assert!(!is_admin_authorization(&cfg, Some("Basic not-base64!!")));
        let no_colon = format!(
            "Basic {}",
            base64::prelude::BASE64_STANDARD.encode("rootpw")
        );
        assert!(!is_admin_authorization(&cfg, Some(&no_colon)));
    }
}
