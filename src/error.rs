use std::time::Duration;

use http::Method;
use thiserror::Error;

use crate::media_type::MediaType;

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    ConnectionReset,
    Tls,
    Other,
}

impl TransportErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::ConnectionReset => "connection_reset",
            Self::Tls => "tls",
            Self::Other => "other",
        }
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Classified reason an attempt produced no usable response.
///
/// This is what the retry engine branches on; it never looks at concrete error types.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureCause {
    Transport(TransportErrorKind),
    Timeout,
    NonRetryable,
}

impl FailureCause {
    pub const fn is_connection_reset(self) -> bool {
        matches!(self, Self::Transport(TransportErrorKind::ConnectionReset))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCode {
    InvalidUri,
    InvalidRequest,
    InvalidConfig,
    SerializeJson,
    SerializeXml,
    SerializeForm,
    RequestBuild,
    Transport,
    Timeout,
    CallerCancelled,
    CircuitOpen,
    HttpStatus,
    ReadBody,
    ResponseBodyTooLarge,
    Deserialize,
    InvalidHeaderName,
    InvalidHeaderValue,
    TlsConfig,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidUri => "invalid_uri",
            Self::InvalidRequest => "invalid_request",
            Self::InvalidConfig => "invalid_config",
            Self::SerializeJson => "serialize_json",
            Self::SerializeXml => "serialize_xml",
            Self::SerializeForm => "serialize_form",
            Self::RequestBuild => "request_build",
            Self::Transport => "transport",
            Self::Timeout => "timeout",
            Self::CallerCancelled => "caller_cancelled",
            Self::CircuitOpen => "circuit_open",
            Self::HttpStatus => "http_status",
            Self::ReadBody => "read_body",
            Self::ResponseBodyTooLarge => "response_body_too_large",
            Self::Deserialize => "deserialize",
            Self::InvalidHeaderName => "invalid_header_name",
            Self::InvalidHeaderValue => "invalid_header_value",
            Self::TlsConfig => "tls_config",
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid request uri: {uri}")]
    InvalidUri { uri: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("invalid client configuration: {message}")]
    InvalidConfig { message: String },
    #[error("failed to serialize request json: {source}")]
    SerializeJson {
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize request xml: {source}")]
    SerializeXml {
        #[source]
        source: quick_xml::SeError,
    },
    #[error("failed to serialize request form: {source}")]
    SerializeForm {
        #[source]
        source: serde_urlencoded::ser::Error,
    },
    #[error("failed to build http request: {source}")]
    RequestBuild {
        #[source]
        source: http::Error,
    },
    #[error(
        "http transport error ({kind}) for {method} {uri} [{media_type}, timeout {timeout_ms}ms]: {source}"
    )]
    Transport {
        kind: TransportErrorKind,
        method: Method,
        uri: String,
        media_type: MediaType,
        timeout_ms: u128,
        #[source]
        source: BoxError,
    },
    #[error("http request timed out after {timeout_ms}ms for {method} {uri} [{media_type}]")]
    Timeout {
        method: Method,
        uri: String,
        media_type: MediaType,
        timeout_ms: u128,
    },
    #[error("request cancelled by caller: {method} {uri}")]
    CallerCancelled { method: Method, uri: String },
    #[error(
        "circuit breaker is open for {signature} after {failure_streak} consecutive failures; cool-down {cool_down_ms}ms, retry after {retry_after_ms}ms"
    )]
    CircuitOpen {
        signature: String,
        failure_streak: usize,
        cool_down_ms: u128,
        retry_after_ms: u128,
    },
    #[error(
        "http status error {status} ({reason}) for {method} {uri} [{media_type}, timeout {timeout_ms}ms]: {body}"
    )]
    HttpStatus {
        status: u16,
        reason: String,
        method: Method,
        uri: String,
        media_type: MediaType,
        timeout_ms: u128,
        body: String,
    },
    #[error("failed to read response body for {method} {uri}: {source}")]
    ReadBody {
        method: Method,
        uri: String,
        #[source]
        source: BoxError,
    },
    #[error(
        "response body too large (limit {limit_bytes} bytes) for {method} {uri}"
    )]
    ResponseBodyTooLarge {
        limit_bytes: usize,
        method: Method,
        uri: String,
    },
    #[error("failed to decode response body: {source}; body={body}")]
    Deserialize {
        #[source]
        source: BoxError,
        body: String,
    },
    #[error("invalid header name {name}: {source}")]
    InvalidHeaderName {
        name: String,
        #[source]
        source: http::header::InvalidHeaderName,
    },
    #[error("invalid header value for {name}: {source}")]
    InvalidHeaderValue {
        name: String,
        #[source]
        source: http::header::InvalidHeaderValue,
    },
    #[error("invalid tls configuration: {message}")]
    TlsConfig { message: String },
}

impl Error {
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidUri { .. } => ErrorCode::InvalidUri,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Self::SerializeJson { .. } => ErrorCode::SerializeJson,
            Self::SerializeXml { .. } => ErrorCode::SerializeXml,
            Self::SerializeForm { .. } => ErrorCode::SerializeForm,
            Self::RequestBuild { .. } => ErrorCode::RequestBuild,
            Self::Transport { .. } => ErrorCode::Transport,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::CallerCancelled { .. } => ErrorCode::CallerCancelled,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::HttpStatus { .. } => ErrorCode::HttpStatus,
            Self::ReadBody { .. } => ErrorCode::ReadBody,
            Self::ResponseBodyTooLarge { .. } => ErrorCode::ResponseBodyTooLarge,
            Self::Deserialize { .. } => ErrorCode::Deserialize,
            Self::InvalidHeaderName { .. } => ErrorCode::InvalidHeaderName,
            Self::InvalidHeaderValue { .. } => ErrorCode::InvalidHeaderValue,
            Self::TlsConfig { .. } => ErrorCode::TlsConfig,
        }
    }

    /// Failures the retry loop must never repeat: bad arguments or invalid state.
    pub const fn is_non_retryable(&self) -> bool {
        matches!(
            self,
            Self::InvalidUri { .. }
                | Self::InvalidRequest { .. }
                | Self::InvalidConfig { .. }
                | Self::SerializeJson { .. }
                | Self::SerializeXml { .. }
                | Self::SerializeForm { .. }
                | Self::RequestBuild { .. }
                | Self::InvalidHeaderName { .. }
                | Self::InvalidHeaderValue { .. }
                | Self::TlsConfig { .. }
        )
    }

    /// Conditions surfaced as errors even when the client suppresses failures.
    pub const fn is_always_surfaced(&self) -> bool {
        matches!(self, Self::CallerCancelled { .. } | Self::CircuitOpen { .. })
            || self.is_non_retryable()
    }

    pub const fn failure_cause(&self) -> Option<FailureCause> {
        match self {
            Self::Transport { kind, .. } => Some(FailureCause::Transport(*kind)),
            Self::Timeout { .. } => Some(FailureCause::Timeout),
            _ if self.is_non_retryable() => Some(FailureCause::NonRetryable),
            _ => None,
        }
    }

    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub const fn is_dns_failure(&self) -> bool {
        matches!(
            self,
            Self::Transport {
                kind: TransportErrorKind::Dns,
                ..
            }
        )
    }
}

pub(crate) fn circuit_open_error(
    signature: &str,
    failure_streak: usize,
    cool_down: Duration,
    retry_after: Duration,
) -> Error {
    Error::CircuitOpen {
        signature: signature.to_owned(),
        failure_streak,
        cool_down_ms: cool_down.as_millis(),
        retry_after_ms: retry_after.as_millis(),
    }
}
