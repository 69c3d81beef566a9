//! Request/response shapes shared by both call surfaces, and the events
//! published for every instrumented call.

use crate::identifier::TraceContext;
use std::error::Error as StdError;
use std::fmt::Write as _;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Which call surface produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Promise-style surface ([`crate::FetchSurface`])
    Fetch,
    /// Callback-style surface ([`crate::CallbackSurface`])
    Callback,
}

/// An outbound HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl HttpRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new("GET", url)
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new("POST", url).with_body(body)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Failure to obtain a response body as text
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BodyError {
    /// The body stream failed mid-read
    #[error("failed to read response body: {0}")]
    Read(String),
    /// The body is not valid UTF-8
    #[error("response body is not valid UTF-8: {0}")]
    Decode(String),
}

/// A settled HTTP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Result<Vec<u8>, BodyError>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: Ok(body.into()),
        }
    }

    /// Borrows the body as UTF-8 text.
    pub fn text(&self) -> Result<&str, BodyError> {
        let bytes = self.body.as_ref().map_err(Clone::clone)?;
        std::str::from_utf8(bytes).map_err(|e| BodyError::Decode(e.to_string()))
    }
}

/// Network-level failure: the call never produced an HTTP status.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// Blocked before leaving the process (cross-origin policy, mixed content)
    #[error("request blocked: {0}")]
    Blocked(String),
    /// Host name resolution failed
    #[error("failed to resolve host {0}")]
    Dns(String),
    /// Connection, TLS or protocol failure
    #[error("network request failed")]
    Failed(#[source] Box<dyn StdError + Send + Sync>),
}

/// Published when an instrumented call leaves the process.
#[derive(Debug, Clone)]
pub struct RequestStartEvent {
    pub request_id: u64,
    pub kind: RequestKind,
    pub method: String,
    pub url: String,
    pub start_time: SystemTime,
}

/// Published exactly once when an instrumented call settles.
#[derive(Debug, Clone)]
pub struct RequestCompleteEvent {
    pub request_id: u64,
    pub kind: RequestKind,
    pub method: String,
    /// Normalized target URL
    pub url: String,
    pub start_time: SystemTime,
    pub duration: Duration,
    /// HTTP status, or 0 for a network-level failure
    pub status: u16,
    /// Best-effort body text, or a failure description
    pub response_body: Option<String>,
    /// Absent when identifier generation failed
    pub trace: Option<TraceContext>,
}

/// Renders a network failure as the body text of a complete event.
pub trait FailureFormatter: Send + Sync {
    fn format(&self, error: &(dyn StdError + 'static)) -> String;
}

/// Formats the error and its `source()` chain, one cause per line.
#[derive(Debug, Default, Clone, Copy)]
pub struct ErrorChainFormatter;

impl FailureFormatter for ErrorChainFormatter {
    fn format(&self, error: &(dyn StdError + 'static)) -> String {
        let mut out = error.to_string();
        if out.is_empty() {
            out.push_str("network error");
        }
        let mut source = error.source();
        while let Some(cause) = source {
            let _ = write!(out, "\n  caused by: {}", cause);
            source = cause.source();
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_lookup_is_case_insensitive() {
        let request = HttpRequest::get("/a").with_header("X-Custom", "1");
        assert_eq!(request.header("x-custom"), Some("1"));
        assert_eq!(request.header("x-other"), None);
    }

    #[test]
    fn test_text_reports_invalid_utf8() {
        let response = HttpResponse::new(200, vec![0xff, 0xfe]);
        assert!(matches!(response.text(), Err(BodyError::Decode(_))));

        let response = HttpResponse {
            status: 200,
            body: Err(BodyError::Read("connection reset".into())),
        };
        assert_eq!(
            response.text(),
            Err(BodyError::Read("connection reset".into()))
        );
    }

    #[test]
    fn test_error_chain_formatter_includes_causes() {
        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let error = NetworkError::Failed(Box::new(inner));
        let text = ErrorChainFormatter.format(&error);
        assert!(text.starts_with("network request failed"));
        assert!(text.contains("caused by: refused"));
    }
}
