use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const REFRESH_ENDPOINT: &str = "/api/auth/refresh/";
pub const LOGIN_ENDPOINT: &str = "/api/auth/login/";
pub const LOGOUT_ENDPOINT: &str = "/api/auth/logout/";
/// Followed by the role and a trailing slash, e.g. `/api/auth/register/candidate/`.
pub const REGISTER_ENDPOINT: &str = "/api/auth/register/";
pub const FORGOT_PASSWORD_ENDPOINT: &str = "/api/auth/forgot-password/";
/// Followed by `{uidb64}/{token}/` from the emailed reset link.
pub const RESET_PASSWORD_ENDPOINT: &str = "/api/auth/reset-password/";
pub const CHANGE_PASSWORD_ENDPOINT: &str = "/api/auth/change-password/";

/// Client configuration. Every field has a default so an empty `{}` file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    /// Route the UI navigates to after a terminal auth failure.
    #[serde(default = "default_login_path")]
    pub login_path: String,
    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,
    /// Bound for business calls, both the first attempt and the retry.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
    /// Serialise concurrent refreshes so a burst of 401s hits the refresh endpoint once.
    #[serde(default = "default_true")]
    pub single_flight_refresh: bool,
}

fn default_backend_url() -> String {
    "http://127.0.0.1:8000".to_string()
}
fn default_login_path() -> String {
    "/login".to_string()
}
fn default_session_file() -> PathBuf {
    PathBuf::from(".ognite-session.json")
}
fn default_request_timeout() -> u64 {
    15
}
fn default_refresh_timeout() -> u64 {
    10
}
fn default_true() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            login_path: default_login_path(),
            session_file: default_session_file(),
            request_timeout_secs: default_request_timeout(),
            refresh_timeout_secs: default_refresh_timeout(),
            single_flight_refresh: true,
        }
    }
}

impl ClientConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref()).context("reading config file")?;
        let mut cfg: ClientConfig = serde_json::from_str(&raw).context("parsing JSON")?;
        cfg.backend_url = cfg.backend_url.trim_end_matches('/').to_string();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Both timeouts must be at least one second; a zero bound fails every call.
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be greater than 0");
        }
        if self.refresh_timeout_secs == 0 {
            bail!("refresh_timeout_secs must be greater than 0");
        }
        Ok(())
    }

    /// Load `path` when it exists, fall back to defaults otherwise, then apply env overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut cfg = if path.exists() {
            Self::from_file(path)?
        } else {
            debug!(path = %path.display(), "config file not found, using defaults");
            Self::default()
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Environment variables:
    /// - `OGNITE_BACKEND_URL`
    /// - `OGNITE_LOGIN_PATH`
    /// - `OGNITE_SESSION_FILE`
    /// - `OGNITE_REQUEST_TIMEOUT_SECS`
    /// - `OGNITE_REFRESH_TIMEOUT_SECS`
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("OGNITE_BACKEND_URL") {
            self.backend_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(path) = std::env::var("OGNITE_LOGIN_PATH") {
            self.login_path = path;
        }
        if let Ok(file) = std::env::var("OGNITE_SESSION_FILE") {
            self.session_file = PathBuf::from(file);
        }
        if let Some(secs) = env_secs("OGNITE_REQUEST_TIMEOUT_SECS") {
            self.request_timeout_secs = secs;
        }
        if let Some(secs) = env_secs("OGNITE_REFRESH_TIMEOUT_SECS") {
            self.refresh_timeout_secs = secs;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_secs)
    }

    /// Join an endpoint path onto the backend URL. Absolute URLs pass through.
    pub fn endpoint(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        if path.starts_with('/') {
            format!("{}{}", self.backend_url, path)
        } else {
            format!("{}/{}", self.backend_url, path)
        }
    }
}

fn env_secs(name: &str) -> Option<u64> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
}
