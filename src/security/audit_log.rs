use tracing::{info, warn};

/// Audit trail of session transitions, emitted on the `audit` target.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn unauthenticated(&self, request_id: &str, url: &str) {
        warn!(target: "audit", event = "unauthenticated", request_id, url);
    }

    pub fn access_rejected(&self, request_id: &str, url: &str) {
        info!(target: "audit", event = "access_rejected", request_id, url);
    }

    pub fn token_refreshed(&self, request_id: &str) {
        info!(target: "audit", event = "token_refreshed", request_id);
    }

    pub fn token_reused(&self, request_id: &str) {
        info!(target: "audit", event = "token_reused", request_id);
    }

    pub fn session_expired(&self, request_id: &str, reason: &str) {
        warn!(target: "audit", event = "session_expired", request_id, reason);
    }

    pub fn retry_rejected(&self, request_id: &str, url: &str) {
        warn!(target: "audit", event = "retry_rejected", request_id, url);
    }

    pub fn login(&self, username: &str, role: &str) {
        info!(target: "audit", event = "login", username, role);
    }

    pub fn logout(&self, username: Option<&str>) {
        info!(target: "audit", event = "logout", username = username.unwrap_or(""));
    }

    pub fn registered(&self, role: &str) {
        info!(target: "audit", event = "registered", role);
    }

    pub fn password_reset_requested(&self) {
        info!(target: "audit", event = "password_reset_requested");
    }

    pub fn password_reset(&self) {
        info!(target: "audit", event = "password_reset");
    }

    pub fn password_changed(&self, username: Option<&str>) {
        info!(target: "audit", event = "password_changed", username = username.unwrap_or(""));
    }
}
