use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::client::config::{ClientConfig, REFRESH_ENDPOINT};
use crate::gateway::notice::{refresh_failure_message, AuthFailureHandler, LogHandler};
use crate::gateway::{ApiRequest, AuthFailure, FieldValue, FormField, GatewayError, Outcome, Payload};
use crate::security::audit_log::AuditLogger;
use crate::security::credential_store::CredentialStore;
use crate::security::token_refresh::{RefreshError, TokenRefresher};

/// Authenticated request gateway.
///
/// Sends every business call with the stored bearer token. A 401 triggers at
/// most one refresh and one retry per call; the retry's response is returned
/// as-is, even when it is another 401.
#[derive(Debug, Clone)]
pub struct Gateway {
    http: Client,
    config: Arc<ClientConfig>,
    store: Arc<dyn CredentialStore>,
    refresher: TokenRefresher,
    handler: Arc<dyn AuthFailureHandler>,
    audit: AuditLogger,
}

impl Gateway {
    pub fn new(config: ClientConfig, store: Arc<dyn CredentialStore>) -> Result<Self> {
        let http = Client::builder()
            .build()
            .context("creating HTTP client")?;
        let refresher = TokenRefresher::new(
            http.clone(),
            config.endpoint(REFRESH_ENDPOINT),
            config.refresh_timeout(),
            config.single_flight_refresh,
        );

        debug!(
            backend_url = %config.backend_url,
            single_flight = config.single_flight_refresh,
            "gateway initialized"
        );

        Ok(Self {
            http,
            config: Arc::new(config),
            store,
            refresher,
            handler: Arc::new(LogHandler),
            audit: AuditLogger::new(),
        })
    }

    pub fn with_handler(mut self, handler: Arc<dyn AuthFailureHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub(crate) fn http(&self) -> &Client {
        &self.http
    }

    /// Perform `req`, returning `None` when an auth failure was handled.
    ///
    /// `None` means the handler has already been told to notify the user and
    /// navigate to the login path; the caller must not proceed.
    pub async fn request(&self, req: &ApiRequest) -> Result<Option<Response>, GatewayError> {
        match self.execute(req).await? {
            Outcome::Response(resp) => Ok(Some(resp)),
            Outcome::AuthFailure(failure) => {
                self.handler
                    .on_auth_failure(&failure, &self.config.login_path);
                Ok(None)
            }
        }
    }

    /// Same state machine as [`request`](Self::request) but hands the auth
    /// failure back typed instead of invoking the handler.
    pub async fn execute(&self, req: &ApiRequest) -> Result<Outcome, GatewayError> {
        let request_id = Uuid::new_v4().to_string();
        let url = self.config.endpoint(&req.url);

        let Some(token) = self.store.access_token() else {
            self.audit.unauthenticated(&request_id, &url);
            return Ok(Outcome::AuthFailure(AuthFailure::Unauthenticated));
        };

        let resp = self.send(req, &url, Some(&token), &request_id).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(Outcome::Response(resp));
        }

        debug!(request_id = %request_id, url = %url, "token expired, attempting refresh");
        self.audit.access_rejected(&request_id, &url);

        let token = match self
            .refresher
            .refresh(self.store.as_ref(), &token, &request_id)
            .await
        {
            Ok(token) => token,
            Err(RefreshError::Storage(err)) => return Err(GatewayError::Storage(err)),
            Err(err) => {
                let reason = err.to_string();
                self.audit.session_expired(&request_id, &reason);
                return Ok(Outcome::AuthFailure(AuthFailure::SessionExpired {
                    message: refresh_failure_message(&err),
                    reason,
                }));
            }
        };

        let retry = self.send(req, &url, Some(&token), &request_id).await?;
        if retry.status() == StatusCode::UNAUTHORIZED {
            self.audit.retry_rejected(&request_id, &url);
        }
        Ok(Outcome::Response(retry))
    }

    /// Send `req` without a bearer token and without the refresh path, for
    /// endpoints that serve signed-out users (sign-up, password reset).
    pub async fn send_anonymous(&self, req: &ApiRequest) -> Result<Response, GatewayError> {
        let request_id = Uuid::new_v4().to_string();
        let url = self.config.endpoint(&req.url);
        self.send(req, &url, None, &request_id).await
    }

    async fn send(
        &self,
        req: &ApiRequest,
        url: &str,
        token: Option<&str>,
        request_id: &str,
    ) -> Result<Response, GatewayError> {
        let builder = self.build(req, url, token)?;

        trace!(
            request_id = %request_id,
            method = %req.method,
            url = %url,
            timeout_secs = self.config.request_timeout_secs,
            authenticated = token.is_some(),
            "sending request"
        );

        let resp = builder.send().await.map_err(|source| {
            if source.is_timeout() {
                GatewayError::Timeout {
                    url: url.to_string(),
                }
            } else {
                GatewayError::Transport {
                    url: url.to_string(),
                    source,
                }
            }
        })?;

        debug!(
            request_id = %request_id,
            status_code = resp.status().as_u16(),
            url = %url,
            "received response"
        );
        Ok(resp)
    }

    fn build(
        &self,
        req: &ApiRequest,
        url: &str,
        token: Option<&str>,
    ) -> Result<RequestBuilder, GatewayError> {
        let headers = build_headers(req, token)?;
        let builder = self
            .http
            .request(req.method.clone(), url)
            .timeout(self.config.request_timeout())
            .headers(headers);

        let builder = match &req.payload {
            Payload::Empty => builder,
            Payload::Json(value) => {
                let body = serde_json::to_vec(value)
                    .map_err(|e| GatewayError::InvalidRequest(format!("serialize json body: {e}")))?;
                builder.body(body)
            }
            Payload::Multipart(fields) => builder.multipart(build_form(fields)?),
            Payload::Bytes { data, .. } => builder.body(data.clone()),
        };
        Ok(builder)
    }
}

/// Caller headers, the payload's default content type, then the bearer token.
/// A caller-supplied `Authorization` is always dropped.
pub(crate) fn build_headers(
    req: &ApiRequest,
    token: Option<&str>,
) -> Result<HeaderMap, GatewayError> {
    let mut headers = HeaderMap::new();

    if !req.has_header(CONTENT_TYPE.as_str()) {
        match &req.payload {
            payload if payload.defaults_to_json() => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            }
            Payload::Bytes {
                content_type: Some(ct),
                ..
            } => {
                headers.insert(CONTENT_TYPE, header_value(ct)?);
            }
            _ => {}
        }
    }

    for (name, value) in &req.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| GatewayError::InvalidRequest(format!("header name {name:?}: {e}")))?;
        if name == AUTHORIZATION {
            continue;
        }
        headers.append(name, header_value(value)?);
    }

    if let Some(token) = token {
        headers.insert(AUTHORIZATION, header_value(&format!("Bearer {token}"))?);
    }
    Ok(headers)
}

fn header_value(value: &str) -> Result<HeaderValue, GatewayError> {
    HeaderValue::from_str(value)
        .map_err(|e| GatewayError::InvalidRequest(format!("header value: {e}")))
}

fn build_form(fields: &[FormField]) -> Result<Form, GatewayError> {
    let mut form = Form::new();
    for field in fields {
        form = match &field.value {
            FieldValue::Text(text) => form.text(field.name.clone(), text.clone()),
            FieldValue::File {
                bytes,
                file_name,
                mime,
            } => {
                let mut part = Part::bytes(bytes.clone()).file_name(file_name.clone());
                if let Some(mime) = mime {
                    part = part.mime_str(mime).map_err(|e| {
                        GatewayError::InvalidRequest(format!("mime type {mime:?}: {e}"))
                    })?;
                }
                form.part(field.name.clone(), part)
            }
        };
    }
    Ok(form)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_payload_gets_json_content_type_and_bearer() {
        let req = ApiRequest::post("/api/candidates/profile/").json(json!({"city": "Pune"}));
        let headers = build_headers(&req, Some("tok")).unwrap();
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok");
    }

    #[test]
    fn test_multipart_payload_has_no_forced_content_type() {
        let req = ApiRequest::post("/api/candidates/resume/")
            .multipart(vec![FormField::file("resume", b"%PDF".to_vec(), "cv.pdf")]);
        let headers = build_headers(&req, Some("tok")).unwrap();
        assert!(headers.get(CONTENT_TYPE).is_none());
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok");
    }

    #[test]
    fn test_caller_content_type_overrides_default() {
        let req = ApiRequest::post("/api/x/")
            .header("Content-Type", "application/merge-patch+json")
            .json(json!({}));
        let headers = build_headers(&req, Some("tok")).unwrap();
        let values: Vec<_> = headers.get_all(CONTENT_TYPE).iter().collect();
        assert_eq!(values, vec!["application/merge-patch+json"]);
    }

    #[test]
    fn test_bytes_payload_uses_own_content_type() {
        let req = ApiRequest::put("/api/x/").bytes(vec![0, 1], Some("image/png".to_string()));
        let headers = build_headers(&req, Some("tok")).unwrap();
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "image/png");

        let req = ApiRequest::put("/api/x/").bytes(vec![0, 1], None);
        let headers = build_headers(&req, Some("tok")).unwrap();
        assert!(headers.get(CONTENT_TYPE).is_none());
    }

    #[test]
    fn test_caller_authorization_is_replaced() {
        let req = ApiRequest::get("/api/x/").header("authorization", "Bearer stale");
        let headers = build_headers(&req, Some("fresh")).unwrap();
        let values: Vec<_> = headers.get_all(AUTHORIZATION).iter().collect();
        assert_eq!(values, vec!["Bearer fresh"]);
    }

    #[test]
    fn test_anonymous_request_carries_no_authorization() {
        let req = ApiRequest::post("/api/auth/forgot-password/")
            .header("Authorization", "Bearer leaked")
            .json(json!({"email": "a@b.c"}));
        let headers = build_headers(&req, None).unwrap();
        assert!(headers.get(AUTHORIZATION).is_none());
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn test_invalid_header_is_rejected() {
        let req = ApiRequest::get("/api/x/").header("bad header", "v");
        assert!(matches!(
            build_headers(&req, Some("tok")),
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_invalid_mime_is_rejected() {
        let fields = vec![FormField {
            name: "f".to_string(),
            value: FieldValue::File {
                bytes: vec![],
                file_name: "f".to_string(),
                mime: Some("not a mime".to_string()),
            },
        }];
        assert!(matches!(
            build_form(&fields),
            Err(GatewayError::InvalidRequest(_))
        ));
    }
}
