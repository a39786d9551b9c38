use std::fmt;

use reqwest::Method;
use time::OffsetDateTime;

use crate::registry::CancelReason;

/// Category of a failed request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Request was sent but no response came back.
    Network,
    /// No response arrived before the deadline.
    Timeout,
    /// 401 or 403.
    Auth,
    /// 400, 404, 405 or 422.
    Client,
    /// 500, 502, 503 or 504.
    Server,
    /// Caller-initiated or superseded cancellation.
    Cancel,
    /// Anything not covered above.
    Unknown,
}

impl ErrorKind {
    /// Maps an HTTP (or envelope) status code onto a kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 | 403 => Self::Auth,
            400 | 404 | 405 | 422 => Self::Client,
            500 | 502 | 503 | 504 => Self::Server,
            _ => Self::Unknown,
        }
    }

    /// Classifies a raw transport failure.
    pub fn classify(failure: &Failure) -> Self {
        match failure {
            Failure::Response { status, .. } => Self::from_status(*status),
            Failure::NoResponse { timed_out: true, .. } => Self::Timeout,
            Failure::NoResponse { .. } => Self::Network,
            Failure::Cancelled(_) => Self::Cancel,
            Failure::Other(_) => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "TIMEOUT_ERROR",
            Self::Auth => "AUTH_ERROR",
            Self::Client => "CLIENT_ERROR",
            Self::Server => "SERVER_ERROR",
            Self::Cancel => "CANCEL_ERROR",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw outcome of a failed transport attempt, before normalization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Failure {
    /// The server answered with a non-success status.
    Response { status: u16, body: String },
    /// The request went out but nothing came back.
    NoResponse { timed_out: bool, message: String },
    /// The owning request was cancelled.
    Cancelled(CancelReason),
    /// The request could not be built or sent at all.
    Other(String),
}

impl Failure {
    pub fn network(message: impl Into<String>) -> Self {
        Self::NoResponse {
            timed_out: false,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::NoResponse {
            timed_out: true,
            message: message.into(),
        }
    }

    /// Human readable description of the failure.
    pub fn message(&self) -> String {
        match self {
            Self::Response { status, .. } => format!("request failed with status code {status}"),
            Self::NoResponse { message, .. } | Self::Other(message) => message.clone(),
            Self::Cancelled(reason) => reason.to_string(),
        }
    }

    /// Whether any response at all was received.
    pub fn has_response(&self) -> bool {
        matches!(self, Self::Response { .. })
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// Normalized error record returned for every failed request.
///
/// Built once per failed request. Fields are read through accessors so a
/// record cannot be altered after it is handed to the caller.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
    timestamp: OffsetDateTime,
    status: Option<u16>,
    code: Option<i64>,
    url: Option<String>,
    method: Option<Method>,
    body: Option<String>,
    cancel_reason: Option<CancelReason>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            timestamp: OffsetDateTime::now_utc(),
            status: None,
            code: None,
            url: None,
            method: None,
            body: None,
            cancel_reason: None,
        }
    }

    /// Normalizes a transport failure for the given request.
    pub fn from_failure(failure: Failure, method: &Method, url: &str) -> Self {
        let kind = ErrorKind::classify(&failure);
        let mut error = Self::new(kind, failure.message());
        match failure {
            Failure::Response { status, body } => {
                error.status = Some(status);
                error.body = (!body.is_empty()).then_some(body);
                error.url = Some(url.to_owned());
                error.method = Some(method.clone());
            }
            Failure::NoResponse { .. } => {
                error.url = Some(url.to_owned());
                error.method = Some(method.clone());
            }
            Failure::Cancelled(reason) => {
                error.cancel_reason = Some(reason);
                error.url = Some(url.to_owned());
                error.method = Some(method.clone());
            }
            Failure::Other(_) => {}
        }
        error
    }

    /// Failure reported inside a successful response envelope.
    pub fn application(code: i64, message: impl Into<String>, method: &Method, url: &str) -> Self {
        let kind = u16::try_from(code)
            .map(ErrorKind::from_status)
            .unwrap_or(ErrorKind::Unknown);
        let mut error = Self::new(kind, message);
        error.code = Some(code);
        error.url = Some(url.to_owned());
        error.method = Some(method.clone());
        error
    }

    /// Cancellation of the given request.
    pub(crate) fn cancelled(reason: CancelReason, method: &Method, url: &str) -> Self {
        let mut error = Self::new(ErrorKind::Cancel, reason.to_string());
        error.cancel_reason = Some(reason);
        error.url = Some(url.to_owned());
        error.method = Some(method.clone());
        error
    }

    /// A response arrived but could not be decoded into the requested type.
    pub(crate) fn undecodable(message: impl Into<String>, method: &Method, url: &str) -> Self {
        let mut error = Self::new(ErrorKind::Unknown, message);
        error.url = Some(url.to_owned());
        error.method = Some(method.clone());
        error
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }

    /// HTTP status of the failing response, if one was received.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Application code from a failure envelope.
    pub fn code(&self) -> Option<i64> {
        self.code
    }

    pub fn url(&self) -> Option<&str> {
        self.url.as_deref()
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    /// Raw response body of the failing response.
    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    pub fn cancel_reason(&self) -> Option<CancelReason> {
        self.cancel_reason
    }

    pub fn is_cancel(&self) -> bool {
        self.kind == ErrorKind::Cancel
    }

    /// Cancelled because a newer request with the same key replaced it.
    pub fn is_superseded(&self) -> bool {
        self.cancel_reason == Some(CancelReason::Superseded)
    }

}

/// Error returned while building a client.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid url '{value}': {source}")]
    InvalidUrl {
        value: String,
        source: url::ParseError,
    },
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
    #[error("invalid value for {name}: '{value}'")]
    InvalidValue { name: &'static str, value: String },
    #[error("failed to build http client: {0}")]
    Http(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::{ApiError, ErrorKind, Failure};
    use crate::registry::CancelReason;
    use reqwest::Method;

    #[test]
    fn status_table_matches_kinds() {
        for (status, kind) in [
            (401, ErrorKind::Auth),
            (403, ErrorKind::Auth),
            (400, ErrorKind::Client),
            (404, ErrorKind::Client),
            (405, ErrorKind::Client),
            (422, ErrorKind::Client),
            (500, ErrorKind::Server),
            (502, ErrorKind::Server),
            (503, ErrorKind::Server),
            (504, ErrorKind::Server),
            (408, ErrorKind::Unknown),
            (429, ErrorKind::Unknown),
        ] {
            assert_eq!(ErrorKind::from_status(status), kind, "status {status}");
        }
    }

    #[test]
    fn classify_without_response() {
        assert_eq!(
            ErrorKind::classify(&Failure::timeout("deadline")),
            ErrorKind::Timeout
        );
        assert_eq!(
            ErrorKind::classify(&Failure::network("connection refused")),
            ErrorKind::Network
        );
        assert_eq!(
            ErrorKind::classify(&Failure::Cancelled(CancelReason::Explicit)),
            ErrorKind::Cancel
        );
        assert_eq!(
            ErrorKind::classify(&Failure::Other("bad url".to_owned())),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn response_failure_keeps_transport_metadata() {
        let error = ApiError::from_failure(
            Failure::Response {
                status: 503,
                body: "busy".to_owned(),
            },
            &Method::GET,
            "https://api.test/users",
        );

        assert_eq!(error.kind(), ErrorKind::Server);
        assert_eq!(error.status(), Some(503));
        assert_eq!(error.body(), Some("busy"));
        assert_eq!(error.url(), Some("https://api.test/users"));
        assert_eq!(error.method(), Some(&Method::GET));
        assert_eq!(error.to_string(), "SERVER_ERROR: request failed with status code 503");
    }

    #[test]
    fn application_failure_uses_envelope_code() {
        let error = ApiError::application(400, "bad request", &Method::POST, "/users");
        assert_eq!(error.kind(), ErrorKind::Client);
        assert_eq!(error.message(), "bad request");
        assert_eq!(error.code(), Some(400));
        assert_eq!(error.status(), None);

        let odd = ApiError::application(-1, "weird", &Method::POST, "/users");
        assert_eq!(odd.kind(), ErrorKind::Unknown);
    }

    #[test]
    fn superseded_is_distinguishable() {
        let error = ApiError::cancelled(CancelReason::Superseded, &Method::GET, "/users");
        assert!(error.is_cancel());
        assert!(error.is_superseded());
        let explicit = ApiError::cancelled(CancelReason::Explicit, &Method::GET, "/users");
        assert!(!explicit.is_superseded());
    }

    #[test]
    fn cancellation_records_the_request() {
        let error = ApiError::cancelled(
            CancelReason::Explicit,
            &Method::DELETE,
            "https://api.test/users/7",
        );
        assert_eq!(error.kind(), ErrorKind::Cancel);
        assert_eq!(error.method(), Some(&Method::DELETE));
        assert_eq!(error.url(), Some("https://api.test/users/7"));
        assert_eq!(error.cancel_reason(), Some(CancelReason::Explicit));
        assert_eq!(error.message(), "request cancelled");
        assert_eq!(error.status(), None);
    }
}
