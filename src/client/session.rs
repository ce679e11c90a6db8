use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::config::{
    CHANGE_PASSWORD_ENDPOINT, FORGOT_PASSWORD_ENDPOINT, LOGIN_ENDPOINT, LOGOUT_ENDPOINT,
    REGISTER_ENDPOINT, RESET_PASSWORD_ENDPOINT,
};
use crate::gateway::{ApiRequest, Gateway, GatewayError, Payload};
use crate::security::audit_log::AuditLogger;
use crate::security::credential_store::StorageKey;

/// Account type chosen at login; the backend checks it against the user record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Candidate,
    Recruiter,
    University,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Candidate => "candidate",
            Role::Recruiter => "recruiter",
            Role::University => "university",
        }
    }

    /// Sign-up endpoint for this account type.
    pub fn register_endpoint(&self) -> String {
        format!("{REGISTER_ENDPOINT}{}/", self.as_str())
    }

    pub fn dashboard_path(&self) -> &'static str {
        match self {
            Role::Candidate => "/dashboard/student",
            Role::Recruiter => "/dashboard/recruiter",
            Role::University => "/dashboard/university",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "candidate" | "student" => Ok(Role::Candidate),
            "recruiter" => Ok(Role::Recruiter),
            "university" => Ok(Role::University),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoginError {
    #[error("Invalid credentials. Please check your username and password.")]
    InvalidCredentials,
    #[error("{0}")]
    Validation(String),
    #[error("Server error ({0}). Please try again later.")]
    Server(StatusCode),
    #[error("Invalid response from server. Please try again.")]
    MalformedResponse,
    #[error("Unable to connect to the server: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("credential store failure: {0:#}")]
    Storage(anyhow::Error),
}

/// Failures of the account flows: sign-up and the password operations.
#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("{0}")]
    Validation(String),
    #[error("This password reset link is invalid or has expired. Please request a new one.")]
    InvalidResetLink,
    #[error("Authentication failed. Please log in again.")]
    NotAuthenticated,
    #[error("Server error ({0}). Please try again later.")]
    Server(StatusCode),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access: Option<String>,
    refresh: Option<String>,
}

/// What is known about the stored session without asking the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub username: Option<String>,
    pub role: Option<Role>,
    pub has_access_token: bool,
    pub has_refresh_token: bool,
}

/// Login and logout around a [`Gateway`]'s credential store.
#[derive(Debug, Clone)]
pub struct SessionManager {
    gateway: Gateway,
    audit: AuditLogger,
}

impl SessionManager {
    pub fn new(gateway: Gateway) -> Self {
        Self {
            gateway,
            audit: AuditLogger::new(),
        }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }

    /// `POST /api/auth/login/` and persist the returned token pair with the user's identity.
    pub async fn login(&self, username: &str, password: &str, role: Role) -> Result<(), LoginError> {
        let config = self.gateway.config();
        let url = config.endpoint(LOGIN_ENDPOINT);
        let username = username.trim();

        debug!(url = %url, username, role = %role, "sending login request");

        let resp = self
            .gateway
            .http()
            .post(&url)
            .timeout(config.request_timeout())
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&serde_json::json!({
                "username": username,
                "password": password,
                "role": role.as_str(),
            }))
            .send()
            .await
            .map_err(LoginError::Transport)?;

        let status = resp.status();
        match status {
            StatusCode::UNAUTHORIZED => return Err(LoginError::InvalidCredentials),
            StatusCode::BAD_REQUEST => {
                let body: Value = resp.json().await.unwrap_or(Value::Null);
                return Err(LoginError::Validation(validation_message(&body)));
            }
            s if !s.is_success() => {
                let body = resp.text().await.unwrap_or_default();
                debug!(status_code = s.as_u16(), body = %body, "login rejected");
                return Err(LoginError::Server(s));
            }
            _ => {}
        }

        let body: LoginResponse = resp
            .json()
            .await
            .map_err(|_| LoginError::MalformedResponse)?;
        let (Some(access), Some(refresh)) = (
            body.access.filter(|t| !t.is_empty()),
            body.refresh.filter(|t| !t.is_empty()),
        ) else {
            return Err(LoginError::MalformedResponse);
        };

        let store = self.gateway.store();
        for (key, value) in [
            (StorageKey::AccessToken, access.as_str()),
            (StorageKey::RefreshToken, refresh.as_str()),
            (StorageKey::Username, username),
            (StorageKey::UserType, role.as_str()),
        ] {
            store.set(key, value).map_err(LoginError::Storage)?;
        }

        self.audit.login(username, role.as_str());
        info!(username, role = %role, "logged in");
        Ok(())
    }

    /// Clear the local session first, then tell the backend in the background.
    ///
    /// The returned handle resolves once the server notice finished; dropping it
    /// detaches the notice. Backend errors are only logged.
    pub fn logout(&self) -> Result<Option<JoinHandle<()>>> {
        let store = self.gateway.store();
        let access = store.access_token();
        let refresh = store.refresh_token();
        let username = store.get(StorageKey::Username);

        store.clear()?;
        self.audit.logout(username.as_deref());

        let Some(access) = access else {
            return Ok(None);
        };

        let config = self.gateway.config();
        let url = config.endpoint(LOGOUT_ENDPOINT);
        let timeout = config.request_timeout();
        let http = self.gateway.http().clone();

        Ok(Some(tokio::spawn(async move {
            let result = http
                .post(&url)
                .timeout(timeout)
                .bearer_auth(&access)
                .json(&serde_json::json!({ "refresh_token": refresh }))
                .send()
                .await;
            match result {
                Ok(resp) if resp.status().is_success() => {
                    debug!(status_code = resp.status().as_u16(), "server acknowledged logout");
                }
                Ok(resp) => {
                    warn!(status_code = resp.status().as_u16(), "background logout rejected");
                }
                Err(err) => warn!(error = %err, "background logout error"),
            }
        })))
    }

    /// `POST /api/auth/register/{role}/`. The candidate form is multipart
    /// (resume, profile picture); the other roles accept JSON or multipart.
    pub async fn register(&self, role: Role, payload: Payload) -> Result<(), AccountError> {
        let req = ApiRequest {
            payload,
            ..ApiRequest::post(role.register_endpoint())
        };
        let resp = self.gateway.send_anonymous(&req).await?;
        account_response(resp).await?;
        self.audit.registered(role.as_str());
        info!(role = %role, "account registered");
        Ok(())
    }

    /// Ask the backend to email a reset link. The reply is the same whether or
    /// not the address belongs to an account.
    pub async fn forgot_password(&self, email: &str) -> Result<String, AccountError> {
        let email = email.trim();
        if !email.contains('@') {
            return Err(AccountError::Validation(
                "Please provide a valid email address.".to_string(),
            ));
        }
        let req = ApiRequest::post(FORGOT_PASSWORD_ENDPOINT)
            .json(serde_json::json!({ "email": email }));
        let resp = self.gateway.send_anonymous(&req).await?;
        let body = account_response(resp).await?;
        self.audit.password_reset_requested();
        Ok(server_message(
            &body,
            "If an account with this email exists, a password reset link has been sent.",
        ))
    }

    /// Complete a reset with the `uidb64`/`token` pair from the emailed link.
    pub async fn reset_password(
        &self,
        uidb64: &str,
        token: &str,
        new_password: &str,
    ) -> Result<String, AccountError> {
        let url = format!("{RESET_PASSWORD_ENDPOINT}{uidb64}/{token}/");
        let req = ApiRequest::post(url).json(serde_json::json!({
            "new_password": new_password,
            "confirm_new_password": new_password,
        }));
        let resp = self.gateway.send_anonymous(&req).await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(AccountError::InvalidResetLink);
        }
        let body = account_response(resp).await?;
        self.audit.password_reset();
        Ok(server_message(&body, "Password has been reset successfully."))
    }

    /// Change the signed-in user's password. Goes through the gateway, so an
    /// expired access token is refreshed first.
    pub async fn change_password(
        &self,
        old_password: &str,
        new_password: &str,
    ) -> Result<String, AccountError> {
        let req = ApiRequest::post(CHANGE_PASSWORD_ENDPOINT).json(serde_json::json!({
            "old_password": old_password,
            "new_password": new_password,
            "confirm_new_password": new_password,
        }));
        let Some(resp) = self.gateway.request(&req).await? else {
            return Err(AccountError::NotAuthenticated);
        };
        let body = account_response(resp).await?;
        let username = self.gateway.store().get(StorageKey::Username);
        self.audit.password_changed(username.as_deref());
        Ok(server_message(&body, "Password changed successfully."))
    }

    pub fn current(&self) -> SessionInfo {
        let store = self.gateway.store();
        SessionInfo {
            username: store.get(StorageKey::Username),
            role: store
                .get(StorageKey::UserType)
                .and_then(|r| r.parse().ok()),
            has_access_token: store.access_token().is_some(),
            has_refresh_token: store.refresh_token().is_some(),
        }
    }
}

/// Success body of an account call, or the error it maps to.
async fn account_response(resp: reqwest::Response) -> Result<Value, AccountError> {
    let status = resp.status();
    // Bodies are informational; a non-JSON reply reads as null.
    let body: Value = resp.json().await.unwrap_or_default();
    if status.is_success() {
        return Ok(body);
    }
    debug!(status_code = status.as_u16(), "account request rejected");
    if status == StatusCode::BAD_REQUEST {
        return Err(AccountError::Validation(validation_message(&body)));
    }
    Err(AccountError::Server(status))
}

fn server_message(body: &Value, fallback: &str) -> String {
    body.get("message")
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

const FIELD_LABELS: [(&str, &str); 7] = [
    ("username", "Username"),
    ("email", "Email"),
    ("password", "Password"),
    ("old_password", "Current password"),
    ("new_password", "New password"),
    ("confirm_new_password", "Password confirmation"),
    ("role", "Role"),
];

/// Flatten a DRF-style 400 body into one sentence list: labelled fields,
/// then `error`/`detail`, then `non_field_errors`, then any other field.
fn validation_message(body: &Value) -> String {
    let mut messages = Vec::new();

    for (field, label) in FIELD_LABELS {
        if let Some(msg) = body.get(field).and_then(first_message) {
            messages.push(format!("{label}: {msg}"));
        }
    }
    for key in ["error", "detail"] {
        if let Some(msg) = body.get(key).and_then(first_message) {
            messages.push(msg);
        }
    }
    if let Some(Value::Array(items)) = body.get("non_field_errors") {
        messages.extend(items.iter().filter_map(|v| v.as_str().map(str::to_string)));
    }
    if let Value::Object(fields) = body {
        for (field, value) in fields {
            let known = FIELD_LABELS.iter().any(|(name, _)| *name == field.as_str())
                || matches!(field.as_str(), "error" | "detail" | "non_field_errors");
            if known {
                continue;
            }
            if let Some(msg) = first_message(value) {
                messages.push(format!("{field}: {msg}"));
            }
        }
    }

    if messages.is_empty() {
        "Invalid input. Please check your information.".to_string()
    } else {
        messages.join(". ")
    }
}

fn first_message(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first().and_then(|v| v.as_str()).map(str::to_string),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_role_parsing_and_routes() {
        assert_eq!("candidate".parse::<Role>().unwrap(), Role::Candidate);
        assert_eq!("Recruiter".parse::<Role>().unwrap(), Role::Recruiter);
        assert_eq!("student".parse::<Role>().unwrap(), Role::Candidate);
        assert!("admin".parse::<Role>().is_err());

        assert_eq!(Role::Candidate.dashboard_path(), "/dashboard/student");
        assert_eq!(Role::Recruiter.dashboard_path(), "/dashboard/recruiter");
        assert_eq!(Role::University.dashboard_path(), "/dashboard/university");
        assert_eq!(
            Role::Recruiter.register_endpoint(),
            "/api/auth/register/recruiter/"
        );
    }

    #[test]
    fn test_validation_message_collects_fields() {
        let body = json!({
            "username": ["This field is required."],
            "role": "Invalid role",
            "non_field_errors": ["Account disabled", "Contact support"]
        });
        assert_eq!(
            validation_message(&body),
            "Username: This field is required.. Role: Invalid role. Account disabled. Contact support"
        );
    }

    #[test]
    fn test_validation_message_fallback() {
        assert_eq!(
            validation_message(&json!({})),
            "Invalid input. Please check your information."
        );
        assert_eq!(validation_message(&json!({"detail": "Nope"})), "Nope");
    }

    #[test]
    fn test_validation_message_reads_error_and_profile_fields() {
        assert_eq!(
            validation_message(&json!({"error": "Old password is incorrect."})),
            "Old password is incorrect."
        );
        assert_eq!(
            validation_message(&json!({
                "email": ["user with this email already exists."],
                "phone": ["This field may not be blank."]
            })),
            "Email: user with this email already exists.. phone: This field may not be blank."
        );
    }
}
