use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Buffered body of a handler response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum ResponseBody {
    Json(serde_json::Value),
    Text(String),
    Binary(Vec<u8>),
    Empty,
}

impl ResponseBody {
    /// Builds a body from raw bytes. JSON is kept structured when the producer
    /// declared it; other UTF-8 is stored as text and anything else verbatim.
    pub fn from_bytes(bytes: &[u8], declared_json: bool) -> Self {
        if bytes.is_empty() {
            return ResponseBody::Empty;
        }

        if declared_json {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(bytes) {
                return ResponseBody::Json(value);
            }
        }

        match std::str::from_utf8(bytes) {
            Ok(text) => ResponseBody::Text(text.to_owned()),
            Err(_) => ResponseBody::Binary(bytes.to_vec()),
        }
    }

    /// Content type used when the producer did not declare one.
    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            ResponseBody::Json(_) => Some("application/json"),
            ResponseBody::Text(_) => Some("text/plain; charset=utf-8"),
            ResponseBody::Binary(_) => Some("application/octet-stream"),
            ResponseBody::Empty => None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ResponseBody::Json(value) => serde_json::to_vec(value).unwrap_or_default(),
            ResponseBody::Text(text) => text.clone().into_bytes(),
            ResponseBody::Binary(bytes) => bytes.clone(),
            ResponseBody::Empty => Vec::new(),
        }
    }
}

/// Fully materialized handler output: what gets persisted and what gets replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedResponse {
    pub status: u16,
    /// Downstream headers in order, names lowercase. Repeated names are kept.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    pub body: ResponseBody,
}

impl CapturedResponse {
    pub fn new(status: u16, body: ResponseBody) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into().to_ascii_lowercase(), value.into()));
        self
    }

    /// First recorded value of `name`.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The producer's content type, or the body's default when none was recorded.
    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type").or_else(|| self.body.content_type())
    }

    pub fn json(status: u16, value: serde_json::Value) -> Self {
        Self::new(status, ResponseBody::Json(value))
    }

    pub fn text(status: u16, text: impl Into<String>) -> Self {
        Self::new(status, ResponseBody::Text(text.into()))
    }

    /// Outcome recorded when a handler panics or its task is lost.
    pub fn internal_error() -> Self {
        Self::json(
            500,
            serde_json::json!({
                "success": false,
                "data": null,
                "error": {
                    "code": "INTERNAL_ERROR",
                    "message": "Internal server error",
                    "retry_after_seconds": null
                }
            }),
        )
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// What the coordinator did with a request.
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyOutcome {
    /// No key supplied; handler ran without any guarantees.
    Bypassed(CapturedResponse),
    /// Handler ran for this request and its outcome was recorded.
    Fresh(CapturedResponse),
    /// A previously recorded outcome was served.
    Replayed(CapturedResponse),
    /// Another instance holds the key and did not finish in time.
    Conflict { retry_after: Duration },
}

impl IdempotencyOutcome {
    pub fn response(&self) -> Option<&CapturedResponse> {
        match self {
            IdempotencyOutcome::Bypassed(r)
            | IdempotencyOutcome::Fresh(r)
            | IdempotencyOutcome::Replayed(r) => Some(r),
            IdempotencyOutcome::Conflict { .. } => None,
        }
    }

    pub fn is_replay(&self) -> bool {
        matches!(self, IdempotencyOutcome::Replayed(_))
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, IdempotencyOutcome::Fresh(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, IdempotencyOutcome::Conflict { .. })
    }

    /// The view of this outcome for a caller that joined an execution started
    /// by someone else.
    pub fn into_joined(self) -> Self {
        match self {
            IdempotencyOutcome::Fresh(r) => IdempotencyOutcome::Replayed(r),
            other => other,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            IdempotencyOutcome::Bypassed(_) => "bypass",
            IdempotencyOutcome::Fresh(_) => "fresh",
            IdempotencyOutcome::Replayed(_) => "replay",
            IdempotencyOutcome::Conflict { .. } => "conflict",
        }
    }
}
