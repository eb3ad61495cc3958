//! Classification of outbound call failures.

use std::fmt;

use reqwest::StatusCode;
use thiserror::Error;

/// Which collaborator a call went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalService {
    ApprovalEngine,
    ErpGateway,
}

impl fmt::Display for ExternalService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ApprovalEngine => write!(f, "approval engine"),
            Self::ErpGateway => write!(f, "ERP gateway"),
        }
    }
}

/// Error category, used to decide whether a call may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalErrorKind {
    /// Credentials rejected (401, 403) or the token endpoint failed.
    Authentication,
    /// Network failure, timeout, 5xx, 408 or 429.
    Transient,
    /// The addressed resource does not exist (404).
    NotFound,
    /// The service understood the request and refused it (other 4xx).
    Rejected,
    /// Missing URL or credentials for the selected auth mode.
    Configuration,
    /// 2xx response whose body could not be interpreted.
    InvalidResponse,
}

impl ExternalErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Category for a non-success HTTP status.
    pub fn from_status(status: StatusCode) -> Self {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Self::Authentication,
            StatusCode::NOT_FOUND => Self::NotFound,
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Self::Transient,
            s if s.is_server_error() => Self::Transient,
            _ => Self::Rejected,
        }
    }
}

impl fmt::Display for ExternalErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authentication => write!(f, "authentication failed"),
            Self::Transient => write!(f, "temporarily unavailable"),
            Self::NotFound => write!(f, "resource not found"),
            Self::Rejected => write!(f, "request rejected"),
            Self::Configuration => write!(f, "not configured"),
            Self::InvalidResponse => write!(f, "invalid response"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{service} {kind}: {message}")]
pub struct ExternalServiceError {
    pub service: ExternalService,
    pub kind: ExternalErrorKind,
    pub message: String,
}

impl ExternalServiceError {
    pub fn new(service: ExternalService, kind: ExternalErrorKind, message: impl Into<String>) -> Self {
        Self {
            service,
            kind,
            message: message.into(),
        }
    }

    pub fn configuration(service: ExternalService, message: impl Into<String>) -> Self {
        Self::new(service, ExternalErrorKind::Configuration, message)
    }

    pub fn invalid_response(service: ExternalService, message: impl Into<String>) -> Self {
        Self::new(service, ExternalErrorKind::InvalidResponse, message)
    }

    /// Classify a transport-level reqwest failure.
    pub fn from_transport(service: ExternalService, err: &reqwest::Error) -> Self {
        let kind = match err.status() {
            Some(status) => ExternalErrorKind::from_status(status),
            None if err.is_timeout() || err.is_connect() || err.is_request() => {
                ExternalErrorKind::Transient
            }
            None if err.is_decode() => ExternalErrorKind::InvalidResponse,
            None => ExternalErrorKind::Transient,
        };
        Self::new(service, kind, err.to_string())
    }

    /// Build an error from a non-success response status and its body text.
    pub fn from_status(service: ExternalService, status: StatusCode, body: &str) -> Self {
        let detail = extract_error_message(body).unwrap_or_else(|| body.trim().to_string());
        let message = if detail.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {detail}")
        };
        Self::new(service, ExternalErrorKind::from_status(status), message)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// `error.message` (OData style), `message`, or a string `error` field.
fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .pointer("/error/message/value")
        .or_else(|| value.pointer("/error/message"))
        .or_else(|| value.get("message"))
        .or_else(|| value.get("error"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}
