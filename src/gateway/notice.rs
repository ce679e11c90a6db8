use std::fmt;

use tracing::warn;

use crate::gateway::{AuthFailure, GatewayError};
use crate::security::token_refresh::RefreshError;

pub const TIMEOUT_MESSAGE: &str = "Request timed out. Please check your connection.";

/// Where the UI layer decides what an auth failure looks like to the user.
///
/// Called exactly once per terminal auth failure by [`Gateway::request`](super::Gateway::request),
/// after the session has already been cleared where applicable.
pub trait AuthFailureHandler: Send + Sync + fmt::Debug {
    fn on_auth_failure(&self, failure: &AuthFailure, login_path: &str);
}

/// Default handler: logs the notice and the redirect target.
#[derive(Debug, Clone, Default)]
pub struct LogHandler;

impl AuthFailureHandler for LogHandler {
    fn on_auth_failure(&self, failure: &AuthFailure, login_path: &str) {
        warn!(
            context = failure.context(),
            redirect = login_path,
            "{}",
            failure.message()
        );
    }
}

/// User-facing text for an HTTP status.
pub fn user_message(status: u16) -> String {
    match status {
        401 => "Authentication failed. Please log in again.".to_string(),
        403 => "You do not have permission to access this resource.".to_string(),
        404 => "The requested resource was not found.".to_string(),
        500 => "Server error. Please try again later.".to_string(),
        code => format!("Error {code}: Unable to complete request."),
    }
}

pub(crate) fn refresh_failure_message(err: &RefreshError) -> String {
    match err {
        RefreshError::Timeout => TIMEOUT_MESSAGE.to_string(),
        other => match other.status() {
            Some(status) => user_message(status),
            None => other.to_string(),
        },
    }
}

impl AuthFailure {
    /// Short label of the step that failed.
    pub fn context(&self) -> &'static str {
        match self {
            AuthFailure::Unauthenticated => "No authentication token",
            AuthFailure::SessionExpired { .. } => "Token refresh",
        }
    }

    pub fn message(&self) -> String {
        match self {
            AuthFailure::Unauthenticated => user_message(401),
            AuthFailure::SessionExpired { message, .. } => message.clone(),
        }
    }
}

impl GatewayError {
    pub fn user_message(&self) -> String {
        match self {
            GatewayError::Timeout { .. } => TIMEOUT_MESSAGE.to_string(),
            other => other.to_string(),
        }
    }
}
