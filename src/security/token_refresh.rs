use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::security::audit_log::AuditLogger;
use crate::security::credential_store::{CredentialStore, StorageKey};

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("no refresh token stored")]
    MissingRefreshToken,
    #[error("refresh endpoint returned {0}")]
    Rejected(StatusCode),
    #[error("refresh request timed out")]
    Timeout,
    #[error("refresh request failed: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("refresh response carried no access token")]
    MalformedResponse,
    #[error("credential store failure: {0:#}")]
    Storage(anyhow::Error),
}

impl RefreshError {
    /// HTTP status to phrase the user notice with; transport failures have none.
    pub fn status(&self) -> Option<u16> {
        match self {
            RefreshError::MissingRefreshToken | RefreshError::MalformedResponse => Some(401),
            RefreshError::Rejected(status) => Some(status.as_u16()),
            _ => None,
        }
    }
}

/// Exchanges the stored refresh token for a new access token.
///
/// The refresh token itself is never rotated. Any failure other than a store
/// error clears the whole session before returning.
#[derive(Debug, Clone)]
pub struct TokenRefresher {
    http: Client,
    endpoint: String,
    timeout: Duration,
    guard: Option<Arc<Mutex<()>>>,
    audit: AuditLogger,
}

impl TokenRefresher {
    pub fn new(http: Client, endpoint: String, timeout: Duration, single_flight: bool) -> Self {
        Self {
            http,
            endpoint,
            timeout,
            guard: single_flight.then(|| Arc::new(Mutex::new(()))),
            audit: AuditLogger::new(),
        }
    }

    /// Produce a usable access token after `rejected_token` drew a 401.
    ///
    /// With single-flight enabled, refreshes are serialised and a caller that
    /// finds the stored token already replaced reuses it instead of refreshing.
    pub async fn refresh(
        &self,
        store: &dyn CredentialStore,
        rejected_token: &str,
        request_id: &str,
    ) -> Result<String, RefreshError> {
        let _permit = match &self.guard {
            Some(guard) => Some(guard.lock().await),
            None => None,
        };

        if self.guard.is_some() {
            if let Some(current) = store.access_token() {
                if current != rejected_token {
                    debug!(request_id, "access token already refreshed by a concurrent call");
                    self.audit.token_reused(request_id);
                    return Ok(current);
                }
            }
        }

        match self.refresh_stored(store).await {
            Ok(access) => {
                self.audit.token_refreshed(request_id);
                Ok(access)
            }
            Err(RefreshError::Storage(err)) => Err(RefreshError::Storage(err)),
            Err(err) => {
                warn!(request_id, error = %err, "token refresh failed, clearing session");
                store.clear().map_err(RefreshError::Storage)?;
                Err(err)
            }
        }
    }

    async fn refresh_stored(&self, store: &dyn CredentialStore) -> Result<String, RefreshError> {
        let refresh_token = store
            .refresh_token()
            .ok_or(RefreshError::MissingRefreshToken)?;
        let access = self.exchange(&refresh_token).await?;
        store
            .set(StorageKey::AccessToken, &access)
            .map_err(RefreshError::Storage)?;
        Ok(access)
    }

    /// `POST {endpoint}` with `{"refresh": ...}`, expecting `{"access": ...}` back.
    async fn exchange(&self, refresh_token: &str) -> Result<String, RefreshError> {
        debug!(url = %self.endpoint, timeout_secs = self.timeout.as_secs(), "requesting token refresh");

        let resp = self
            .http
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&serde_json::json!({ "refresh": refresh_token }))
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    RefreshError::Timeout
                } else {
                    RefreshError::Transport(err)
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RefreshError::Rejected(status));
        }

        let body: RefreshResponse = resp.json().await.map_err(|err| {
            if err.is_timeout() {
                RefreshError::Timeout
            } else {
                RefreshError::MalformedResponse
            }
        })?;

        let access = body
            .access
            .filter(|t| !t.is_empty())
            .ok_or(RefreshError::MalformedResponse)?;
        info!(url = %self.endpoint, "access token refreshed");
        Ok(access)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::token_cache::TokenCache;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn refresher(url: String, single_flight: bool) -> TokenRefresher {
        TokenRefresher::new(
            Client::new(),
            format!("{url}/api/auth/refresh/"),
            Duration::from_secs(5),
            single_flight,
        )
    }

    #[tokio::test]
    async fn refresh_persists_new_access_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/auth/refresh/")
            .match_body(Matcher::Json(json!({ "refresh": "refresh-1" })))
            .with_status(200)
            .with_body(r#"{"access":"access-2"}"#)
            .expect(1)
            .create_async()
            .await;

        let store = TokenCache::with_tokens("access-1", "refresh-1");
        let token = refresher(server.url(), false)
            .refresh(&store, "access-1", "req-1")
            .await
            .expect("refresh should succeed");

        assert_eq!(token, "access-2");
        assert_eq!(store.access_token().as_deref(), Some("access-2"));
        assert_eq!(store.refresh_token().as_deref(), Some("refresh-1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejected_refresh_clears_session() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/auth/refresh/")
            .with_status(401)
            .with_body(r#"{"detail":"Token is invalid or expired"}"#)
            .create_async()
            .await;

        let store = TokenCache::with_tokens("access-1", "refresh-1");
        store.set(StorageKey::UserType, "candidate").unwrap();

        let err = refresher(server.url(), false)
            .refresh(&store, "access-1", "req-1")
            .await
            .unwrap_err();

        assert!(matches!(err, RefreshError::Rejected(StatusCode::UNAUTHORIZED)));
        assert_eq!(err.status(), Some(401));
        for key in StorageKey::ALL {
            assert!(store.get(key).is_none());
        }
    }

    #[tokio::test]
    async fn missing_refresh_token_skips_network() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/auth/refresh/")
            .expect(0)
            .create_async()
            .await;

        let store = TokenCache::new();
        store.set(StorageKey::AccessToken, "access-1").unwrap();

        let err = refresher(server.url(), false)
            .refresh(&store, "access-1", "req-1")
            .await
            .unwrap_err();

        assert!(matches!(err, RefreshError::MissingRefreshToken));
        assert!(store.access_token().is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn response_without_access_is_malformed() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/auth/refresh/")
            .with_status(200)
            .with_body(r#"{"detail":"ok"}"#)
            .create_async()
            .await;

        let store = TokenCache::with_tokens("access-1", "refresh-1");
        let err = refresher(server.url(), false)
            .refresh(&store, "access-1", "req-1")
            .await
            .unwrap_err();

        assert!(matches!(err, RefreshError::MalformedResponse));
        assert!(store.refresh_token().is_none());
    }

    #[tokio::test]
    async fn single_flight_reuses_token_refreshed_by_another_call() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/auth/refresh/")
            .expect(0)
            .create_async()
            .await;

        // Another call already swapped the token the caller was rejected with.
        let store = TokenCache::with_tokens("access-2", "refresh-1");
        let token = refresher(server.url(), true)
            .refresh(&store, "access-1", "req-2")
            .await
            .expect("should reuse current token");

        assert_eq!(token, "access-2");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn without_single_flight_always_refreshes() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/api/auth/refresh/")
            .with_status(200)
            .with_body(r#"{"access":"access-3"}"#)
            .expect(1)
            .create_async()
            .await;

        let store = TokenCache::with_tokens("access-2", "refresh-1");
        let token = refresher(server.url(), false)
            .refresh(&store, "access-1", "req-3")
            .await
            .unwrap();

        assert_eq!(token, "access-3");
        mock.assert_async().await;
    }
}
