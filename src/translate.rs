//! Prompt translation through an external LLM provider.
//!
//! A stateless HTTPS call: the user's description goes out, one English
//! image-generation prompt comes back. Upstream failures map to a small
//! set of user-presentable errors; raw provider messages never reach the
//! client for key or quota problems.

use reqwest::Client;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;

use crate::config::Config;

/// User-presentable translation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TranslateError {
    /// No API key configured on the server.
    #[error("Prompt translation is not configured on this server.")]
    NotConfigured,

    /// Nothing to translate.
    #[error("Enter some text to translate.")]
    EmptyInput,

    /// The provider rejected our key.
    #[error("The translation API key is invalid or disabled. Check the server configuration.")]
    InvalidKey,

    /// Rate limit or quota exhausted.
    #[error("Too many requests or quota exceeded. Please try again later.")]
    QuotaExceeded,

    /// The provider could not make sense of the request.
    #[error("The request could not be processed. Try describing it in more detail.")]
    BadInput,

    /// Anything else upstream.
    #[error("The translation service is currently unavailable. Please try again later.")]
    Upstream,
}

/// Client for the translation provider.
#[derive(Debug, Clone)]
pub struct Translator {
    http: Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
}

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

impl Translator {
    /// Build the translator from configuration.
    pub fn new(cfg: &Config) -> anyhow::Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            api_key: cfg.translate_api_key(),
            model: cfg.translate_model.clone(),
            base_url: DEFAULT_BASE_URL.to_owned(),
        })
    }

    /// Whether a key is configured (feeds the health check).
    #[must_use]
    pub fn configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Translate a description into one English image prompt.
    pub async fn translate(&self, text: &str) -> Result<String, TranslateError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(TranslateError::NotConfigured);
        };
        let raw = text.trim();
        if raw.is_empty() {
            return Err(TranslateError::EmptyInput);
        }

        let instruction = format!(
            "Rewrite the following description as an English prompt for an \
             image-generation model.\n\
             Rules:\n\
             - Preserve the user's intent as closely as possible\n\
             - English only\n\
             - Output exactly one best candidate\n\
             - One line, no explanations, options, numbering, quotes, or markdown\n\
             - A natural sentence, not a bare tag list\n\n\
             Description:\n{raw}\n"
        );
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url, self.model
        );
        let body = json!({
            "contents": [ { "role": "user", "parts": [ { "text": instruction } ] } ],
            "generationConfig": { "temperature": 0.2, "topP": 0.95, "maxOutputTokens": 256 },
        });

        let response = self
            .http
            .post(&url)
            .query(&[("key", api_key)])
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                tracing::warn!(error = %err, "translation request failed");
                TranslateError::Upstream
            })?;

        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            return Err(classify_upstream_error(status.as_u16(), &payload));
        }

        let out = payload
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(Value::as_array)
            .and_then(|p| p.first())
            .and_then(|p| p.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let out = tidy_output(out);
        if out.is_empty() {
            tracing::warn!("translation returned no text");
            return Err(TranslateError::Upstream);
        }
        Ok(out)
    }
}

/// Map a provider error response onto our error kinds. Providers have
/// been seen returning 400 for invalid keys, so the body is inspected
/// alongside the status code.
fn classify_upstream_error(status: u16, payload: &Value) -> TranslateError {
    let error = payload.get("error");
    let message = error
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_lowercase();
    let upstream_status = error
        .and_then(|e| e.get("status"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_uppercase();
    let reason = error
        .and_then(|e| e.get("details"))
        .and_then(Value::as_array)
        .and_then(|details| {
            details.iter().find_map(|d| {
                d.get("reason")
                    .or_else(|| d.get("metadata").and_then(|m| m.get("reason")))
                    .and_then(Value::as_str)
            })
        })
        .unwrap_or_default()
        .to_uppercase();

    let key_issue = matches!(status, 401 | 403)
        || message.contains("api key")
        || message.contains("apikey")
        || message.contains("api_key")
        || message.contains("key not valid")
        || message.contains("permission")
        || message.contains("unauth")
        || message.contains("forbidden")
        || message.contains("billing")
        || reason.starts_with("API_KEY_")
        || matches!(upstream_status.as_str(), "PERMISSION_DENIED" | "UNAUTHENTICATED");
    if key_issue {
        return TranslateError::InvalidKey;
    }

    let quota_issue = status == 429
        || message.contains("quota")
        || message.contains("rate limit")
        || message.contains("resource exhausted")
        || upstream_status == "RESOURCE_EXHAUSTED";
    if quota_issue {
        return TranslateError::QuotaExceeded;
    }

    if status == 400 {
        return TranslateError::BadInput;
    }
    tracing::warn!(status, upstream_status = %upstream_status, "translation upstream error");
    TranslateError::Upstream
}

/// Reduce the model's output to one clean line.
fn tidy_output(text: &str) -> String {
    let first_line = text.trim().lines().next().unwrap_or_default().trim();
    first_line
        .trim_matches(|c| c == '"' || c == '\'')
        .trim()
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_key_issues() {
        assert_eq!(
            classify_upstream_error(401, &Value::Null),
            TranslateError::InvalidKey
        );
        assert_eq!(
            classify_upstream_error(403, &Value::Null),
            TranslateError::InvalidKey
        );
        // Providers return 400 with a key reason; detect through the body.
        let body = json!({ "error": {
            "message": "API key not valid. Please pass a valid API key.",
            "details": [ { "reason": "API_KEY_INVALID" } ]
        }});
        assert_eq!(classify_upstream_error(400, &body), TranslateError::InvalidKey);
    }

    #[test]
    fn test_classify_quota_issues() {
        assert_eq!(
            classify_upstream_error(429, &Value::Null),
            TranslateError::QuotaExceeded
        );
        let body = json!({ "error": { "status": "RESOURCE_EXHAUSTED", "message": "quota" } });
        assert_eq!(
            classify_upstream_error(500, &body),
            TranslateError::QuotaExceeded
        );
    }

    #[test]
    fn test_classify_bad_input_and_upstream() {
        let body = json!({ "error": { "message": "invalid argument" } });
        assert_eq!(classify_upstream_error(400, &body), TranslateError::BadInput);
        assert_eq!(classify_upstream_error(503, &Value::Null), TranslateError::Upstream);
    }

    #[test]
    fn test_tidy_output_single_line_no_quotes() {
        assert_eq!(
            tidy_output("\"a fox sipping tea\"\nsecond option"),
            "a fox sipping tea"
        );
        assert_eq!(tidy_output("  plain  "), "plain");
        assert_eq!(tidy_output(""), "");
    }
}
