//! Application configuration, loaded from CLI flags and environment.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
///
/// Every knob can be set either as a CLI flag or through the environment
/// variable named alongside it.
#[derive(Debug, Clone, Parser)]
#[command(name = "atelier")]
#[command(version)]
#[command(about = "Image-generation job broker for a ComfyUI worker")]
pub struct Config {
    /// HTTP server bind address.
    #[arg(long, env = "ATELIER_BIND_ADDR", default_value = "127.0.0.1")]
    pub bind_addr: String,

    /// HTTP server port.
    #[arg(long, env = "ATELIER_PORT", default_value = "8000")]
    pub port: u16,

    /// ComfyUI server address ("host:port" or a full http(s) URL).
    #[arg(long, env = "COMFYUI_SERVER", default_value = "127.0.0.1:8188")]
    pub comfy_server: String,

    /// Root directory for generated artifacts, uploads, and the feed.
    #[arg(long, env = "OUTPUT_DIR", default_value = "./outputs")]
    pub output_dir: PathBuf,

    /// Directory holding workflow graph JSON files and workflows.json.
    #[arg(long, env = "WORKFLOW_DIR", default_value = "./workflows")]
    pub workflow_dir: PathBuf,

    /// Static assets directory served at /static.
    #[arg(long, env = "STATIC_DIR", default_value = "./static")]
    pub static_dir: PathBuf,

    /// ComfyUI input directory shared with the upstream process.
    ///
    /// When set, reference images uploaded for a job are deleted from this
    /// directory after the job ends.
    #[arg(long, env = "COMFY_INPUT_DIR")]
    pub comfy_input_dir: Option<PathBuf>,

    /// SQLite database path (jobs, feed posts, likes, reactions).
    #[arg(long, env = "JOB_DB_PATH", default_value = "db/app_data.db")]
    pub job_db_path: PathBuf,

    // Queue / backpressure
    /// Maximum queued jobs per user before enqueue is rejected.
    #[arg(long, env = "MAX_PER_USER_QUEUE", default_value = "5")]
    pub max_per_user_queue: usize,

    /// Maximum concurrently running jobs per user.
    #[arg(long, env = "MAX_PER_USER_CONCURRENT", default_value = "1")]
    pub max_per_user_concurrent: usize,

    /// Job timeout in seconds (0 disables the watchdog).
    #[arg(long, env = "JOB_TIMEOUT_SECONDS", default_value = "180")]
    pub job_timeout_seconds: f64,

    // Upstream timeouts
    /// ComfyUI HTTP connect timeout in seconds.
    #[arg(long, env = "COMFY_HTTP_CONNECT_TIMEOUT", default_value = "3")]
    pub comfy_http_connect_timeout: f64,

    /// ComfyUI HTTP read timeout in seconds.
    #[arg(long, env = "COMFY_HTTP_READ_TIMEOUT", default_value = "10")]
    pub comfy_http_read_timeout: f64,

    /// ComfyUI WebSocket connect timeout in seconds.
    #[arg(long, env = "COMFY_WS_CONNECT_TIMEOUT", default_value = "5")]
    pub comfy_ws_connect_timeout: f64,

    /// ComfyUI WebSocket idle timeout in seconds.
    #[arg(long, env = "COMFY_WS_IDLE_TIMEOUT", default_value = "120")]
    pub comfy_ws_idle_timeout: f64,

    // Logging
    /// Log level filter (overridden by RUST_LOG when set).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format: "json" or "text".
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Also write logs to a daily-rotated file.
    #[arg(long, env = "LOG_TO_FILE", default_value = "false")]
    pub log_to_file: bool,

    /// Directory for rotated log files when --log-to-file is set.
    #[arg(long, env = "LOG_DIR", default_value = "logs")]
    pub log_dir: PathBuf,

    // Progress log gating
    /// Log job progress only at multiples of this percentage (0 disables).
    #[arg(long, env = "PROGRESS_LOG_STEP", default_value = "10")]
    pub progress_log_step: u32,

    /// Minimum interval between progress log lines per job, in milliseconds.
    #[arg(long, env = "PROGRESS_LOG_MIN_MS", default_value = "500")]
    pub progress_log_min_ms: u64,

    /// Level for progress log lines: "debug" or "info".
    #[arg(long, env = "PROGRESS_LOG_LEVEL", default_value = "info")]
    pub progress_log_level: String,

    // Upload caps
    /// Maximum control image upload size in bytes.
    #[arg(long, env = "CONTROLS_MAX_BYTES", default_value = "10485760")]
    pub controls_max_bytes: u64,

    /// Maximum input image upload size in bytes.
    #[arg(long, env = "INPUTS_MAX_BYTES", default_value = "10485760")]
    pub inputs_max_bytes: u64,

    // Health
    /// Minimum free disk space (MB) for /healthz to report the disk healthy.
    #[arg(long, env = "HEALTHZ_DISK_MIN_FREE_MB", default_value = "512")]
    pub healthz_disk_min_free_mb: u64,

    // Beta gate
    /// Shared beta password; the gate is enabled when this is set.
    #[arg(long, env = "BETA_PASSWORD")]
    pub beta_password: Option<String>,

    /// Cookie name used by the beta gate.
    #[arg(long, env = "BETA_COOKIE_NAME", default_value = "beta_auth")]
    pub beta_cookie_name: String,

    /// Issue cookies with the Secure attribute (HTTPS deployments).
    #[arg(long, env = "COOKIE_SECURE", default_value = "false")]
    pub cookie_secure: bool,

    // Admin
    /// Admin BasicAuth username; admin surface is enabled when both are set.
    #[arg(long, env = "ADMIN_USER")]
    pub admin_user: Option<String>,

    /// Admin BasicAuth password.
    #[arg(long, env = "ADMIN_PASSWORD")]
    pub admin_password: Option<String>,

    // Prompt translation
    /// API key for the translation provider (falls back to GEMINI_API_KEY).
    #[arg(long, env = "GOOGLE_AI_STUDIO_API_KEY")]
    pub translate_api_key: Option<String>,

    /// Translation model name.
    #[arg(long, env = "PROMPT_TRANSLATE_MODEL", default_value = "gemini-2.5-flash-lite")]
    pub translate_model: String,
}

impl Config {
    /// Effective translation API key, honouring the legacy fallback variable.
    #[must_use]
    pub fn translate_api_key(&self) -> Option<String> {
        self.translate_api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .filter(|k| !k.trim().is_empty())
    }

    /// Whether the admin BasicAuth surface is enabled.
    #[must_use]
    pub fn admin_enabled(&self) -> bool {
        matches!((&self.admin_user, &self.admin_password), (Some(u), Some(p)) if !u.is_empty() && !p.is_empty())
    }

    /// Job timeout as a duration, `None` when the watchdog is disabled.
    #[must_use]
    pub fn job_timeout(&self) -> Option<Duration> {
        if self.job_timeout_seconds > 0.0 {
            Some(Duration::from_secs_f64(self.job_timeout_seconds))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(std::iter::once("atelier").chain(args.iter().copied()))
            .expect("config parses")
    }

    #[test]
    fn test_defaults() {
        let cfg = parse(&[]);
        assert_eq!(cfg.max_per_user_queue, 5);
        assert_eq!(cfg.max_per_user_concurrent, 1);
        assert_eq!(cfg.beta_cookie_name, "beta_auth");
        assert!(cfg.job_timeout().is_some());
        assert!(!cfg.admin_enabled());
    }

    #[test]
    fn test_timeout_disabled_at_zero() {
        let cfg = parse(&["--job-timeout-seconds", "0"]);
        assert!(cfg.job_timeout().is_none());
    }

    #[test]
    fn test_admin_enabled_requires_both() {
        let cfg = parse(&["--admin-user", "root"]);
        assert!(!cfg.admin_enabled());
        let cfg = parse(&["--admin-user", "root", "--admin-password", "hunter2"]);
        assert!(cfg.admin_enabled());
    }
}
