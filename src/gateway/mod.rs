pub mod http;
pub mod notice;

use std::path::Path;

use anyhow::{Context, Result};
use reqwest::Method;
use serde_json::Value;

pub use http::Gateway;
pub use notice::{AuthFailureHandler, LogHandler};

/// Outbound request descriptor. Owned and cloneable so a rejected request can
/// be replayed verbatim with a fresh bearer token.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Absolute URL, or a path joined onto the configured backend URL.
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub payload: Payload,
}

#[derive(Debug, Clone, Default)]
pub enum Payload {
    #[default]
    Empty,
    Json(Value),
    Multipart(Vec<FormField>),
    Bytes {
        data: Vec<u8>,
        content_type: Option<String>,
    },
}

impl Payload {
    /// Whether the gateway adds `Content-Type: application/json` when the caller did not.
    /// Multipart and raw payloads never get it: the boundary or caller type must win.
    pub fn defaults_to_json(&self) -> bool {
        matches!(self, Payload::Empty | Payload::Json(_))
    }
}

#[derive(Debug, Clone)]
pub struct FormField {
    pub name: String,
    pub value: FieldValue,
}

#[derive(Debug, Clone)]
pub enum FieldValue {
    Text(String),
    File {
        bytes: Vec<u8>,
        file_name: String,
        mime: Option<String>,
    },
}

impl FormField {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: FieldValue::Text(value.into()),
        }
    }

    pub fn file(name: impl Into<String>, bytes: Vec<u8>, file_name: impl Into<String>) -> Self {
        let file_name = file_name.into();
        let mime = guess_mime(&file_name).map(str::to_string);
        Self {
            name: name.into(),
            value: FieldValue::File {
                bytes,
                file_name,
                mime,
            },
        }
    }

    /// Read a file from disk into a file part named `name`.
    pub async fn file_from_path(name: impl Into<String>, path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read file: {}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("file path has no usable file name")?
            .to_string();
        Ok(Self::file(name, bytes, file_name))
    }
}

fn guess_mime(file_name: &str) -> Option<&'static str> {
    let lower = file_name.to_lowercase();
    let ext = lower.rsplit_once('.').map(|(_, ext)| ext)?;
    match ext {
        "pdf" => Some("application/pdf"),
        "doc" => Some("application/msword"),
        "docx" => {
            Some("application/vnd.openxmlformats-officedocument.wordprocessingml.document")
        }
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "txt" => Some("text/plain"),
        _ => None,
    }
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            headers: Vec::new(),
            payload: Payload::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn patch(url: impl Into<String>) -> Self {
        Self::new(Method::PATCH, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.payload = Payload::Json(body);
        self
    }

    pub fn multipart(mut self, fields: Vec<FormField>) -> Self {
        self.payload = Payload::Multipart(fields);
        self
    }

    pub fn bytes(mut self, data: Vec<u8>, content_type: Option<String>) -> Self {
        self.payload = Payload::Bytes { data, content_type };
        self
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

/// Terminal authentication failure, already handled inside the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthFailure {
    /// No access token stored; nothing was sent.
    Unauthenticated,
    /// The refresh sub-protocol failed and the session was cleared.
    SessionExpired { reason: String, message: String },
}

/// Result of [`Gateway::execute`]: either the backend's response, untouched,
/// or the auth failure the caller must route to the login screen.
#[derive(Debug)]
pub enum Outcome {
    Response(reqwest::Response),
    AuthFailure(AuthFailure),
}

/// Failures the gateway hands back to the caller instead of redirecting.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("request to {url} timed out")]
    Timeout { url: String },
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("credential store failure: {0:#}")]
    Storage(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_and_empty_payloads_default_to_json() {
        assert!(Payload::Empty.defaults_to_json());
        assert!(Payload::Json(json!({"a": 1})).defaults_to_json());
        assert!(!Payload::Multipart(vec![]).defaults_to_json());
        assert!(!Payload::Bytes {
            data: vec![1, 2],
            content_type: None
        }
        .defaults_to_json());
    }

    #[test]
    fn test_has_header_is_case_insensitive() {
        let req = ApiRequest::post("/api/x/").header("content-type", "text/plain");
        assert!(req.has_header("Content-Type"));
        assert!(!req.has_header("Accept"));
    }

    #[test]
    fn test_file_field_guesses_mime() {
        let field = FormField::file("resume", b"%PDF".to_vec(), "CV.PDF");
        match field.value {
            FieldValue::File { mime, file_name, .. } => {
                assert_eq!(file_name, "CV.PDF");
                assert_eq!(mime.as_deref(), Some("application/pdf"));
            }
            FieldValue::Text(_) => panic!("expected file part"),
        }

        let unknown = FormField::file("blob", vec![], "data.bin");
        assert!(matches!(unknown.value, FieldValue::File { mime: None, .. }));
    }

    #[tokio::test]
    async fn test_file_from_path_reads_bytes() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, b"jpeg-bytes").unwrap();

        let field = FormField::file_from_path("profile_picture", &path)
            .await
            .unwrap();
        assert_eq!(field.name, "profile_picture");
        match field.value {
            FieldValue::File { bytes, mime, .. } => {
                assert_eq!(bytes, b"jpeg-bytes");
                assert_eq!(mime.as_deref(), Some("image/jpeg"));
            }
            FieldValue::Text(_) => panic!("expected file part"),
        }
    }

    #[test]
    fn test_builder_methods() {
        let req = ApiRequest::patch("/api/candidates/profile/").json(json!({"city": "Pune"}));
        assert_eq!(req.method, Method::PATCH);
        assert!(matches!(req.payload, Payload::Json(_)));

        let req = ApiRequest::delete("/api/auth/delete-account/");
        assert_eq!(req.method, Method::DELETE);
        assert!(matches!(req.payload, Payload::Empty));
    }
}
