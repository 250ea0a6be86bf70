use std::fmt;
use std::sync::Arc;

use http::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::auth::{AuthError, ExprError};
use crate::settings::ConfigError;
use crate::validate::{RuleError, ValidationErrors};

/// Longest prefix of a downstream body kept on a [`DownstreamError`].
pub(crate) const SNIPPET_LIMIT: usize = 128;

/// The error taxonomy every pipeline stage reports through.
///
/// Request-side validation and authorization failures are produced by the
/// pipeline itself and never reach handler code. Handlers return any member,
/// most often [`Downstream`](Self::Downstream) (through `?` on a downstream
/// call) or [`Custom`](Self::Custom).
///
/// The [`ErrorMapper`](crate::ErrorMapper) turns an envelope into a transport
/// status and body.
///
/// # Examples
///
/// ```
/// use service_core::{ErrorEnvelope, ErrorKind, TimeoutSource};
///
/// let err = ErrorEnvelope::timeout(TimeoutSource::Downstream);
/// assert_eq!(err.kind(), ErrorKind::Timeout);
/// assert_eq!(err.to_string(), "downstream deadline exceeded");
/// ```
#[derive(Debug, Error)]
pub enum ErrorEnvelope {
    /// One or more fields violated their constraints.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    /// A downstream call required a header that was absent or empty.
    #[error("missing required header '{name}'")]
    MissingHeader {
        /// Canonical (lowercase) header name.
        name: String,
    },

    /// The bearer credential was missing, malformed or rejected.
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),

    /// The credential was valid but the operation's rule evaluated to false.
    #[error("authorization denied: {reason}")]
    Authorization {
        /// Which rule denied the request.
        reason: String,
    },

    /// A downstream call failed at the transport or returned a non-success status.
    #[error(transparent)]
    Downstream(#[from] DownstreamError),

    /// A deadline elapsed.
    #[error("{origin} deadline exceeded")]
    Timeout {
        /// Whose deadline elapsed.
        origin: TimeoutSource,
    },

    /// A defect on the service side, including fatal response violations.
    #[error("internal error: {message}")]
    Internal {
        /// Diagnostic message. Not rendered to callers by the default mapper.
        message: String,
    },

    /// The operation was declared but no handler was installed.
    #[error("operation '{operation}' is not implemented")]
    Unimplemented {
        /// Operation name.
        operation: String,
    },

    /// A handler-defined error rendered with its own status, code and message.
    #[error("{0}")]
    Custom(#[from] CustomError),
}

impl ErrorEnvelope {
    /// Builds an [`Internal`](Self::Internal) error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Builds an [`Authorization`](Self::Authorization) error.
    pub fn authorization(reason: impl Into<String>) -> Self {
        Self::Authorization {
            reason: reason.into(),
        }
    }

    /// Builds a [`Timeout`](Self::Timeout) error.
    pub fn timeout(origin: TimeoutSource) -> Self {
        Self::Timeout { origin }
    }

    /// Builds a [`MissingHeader`](Self::MissingHeader) error; the name is lowercased.
    pub fn missing_header(name: impl AsRef<str>) -> Self {
        Self::MissingHeader {
            name: name.as_ref().to_ascii_lowercase(),
        }
    }

    /// Builds an [`Unimplemented`](Self::Unimplemented) error.
    pub fn unimplemented(operation: impl Into<String>) -> Self {
        Self::Unimplemented {
            operation: operation.into(),
        }
    }

    /// Returns the payload-free discriminant.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::MissingHeader { .. } => ErrorKind::MissingHeader,
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Authorization { .. } => ErrorKind::Authorization,
            Self::Downstream(_) => ErrorKind::Downstream,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Internal { .. } => ErrorKind::Internal,
            Self::Unimplemented { .. } => ErrorKind::Unimplemented,
            Self::Custom(_) => ErrorKind::Custom,
        }
    }

    /// Returns `true` when this error reports the header `name` as missing.
    ///
    /// Header names compare case-insensitively.
    ///
    /// ```
    /// use service_core::ErrorEnvelope;
    ///
    /// let err = ErrorEnvelope::missing_header("Y");
    /// assert!(err.caused_by_header("y"));
    /// assert!(!err.caused_by_header("x"));
    /// ```
    pub fn caused_by_header(&self, name: &str) -> bool {
        matches!(self, Self::MissingHeader { name: missing } if missing.eq_ignore_ascii_case(name))
    }

    /// Returns the downstream failure, if this is one.
    pub fn as_downstream(&self) -> Option<&DownstreamError> {
        match self {
            Self::Downstream(err) => Some(err),
            _ => None,
        }
    }

    /// Returns the validation report, if this is one.
    pub fn as_validation(&self) -> Option<&ValidationErrors> {
        match self {
            Self::Validation(errors) => Some(errors),
            _ => None,
        }
    }
}

/// Discriminant of [`ErrorEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`ErrorEnvelope::Validation`].
    Validation,
    /// See [`ErrorEnvelope::MissingHeader`].
    MissingHeader,
    /// See [`ErrorEnvelope::Authentication`].
    Authentication,
    /// See [`ErrorEnvelope::Authorization`].
    Authorization,
    /// See [`ErrorEnvelope::Downstream`].
    Downstream,
    /// See [`ErrorEnvelope::Timeout`].
    Timeout,
    /// See [`ErrorEnvelope::Internal`].
    Internal,
    /// See [`ErrorEnvelope::Unimplemented`].
    Unimplemented,
    /// See [`ErrorEnvelope::Custom`].
    Custom,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validation => "validation",
            Self::MissingHeader => "missing_header",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::Downstream => "downstream",
            Self::Timeout => "timeout",
            Self::Internal => "internal",
            Self::Unimplemented => "unimplemented",
            Self::Custom => "custom",
        };
        f.write_str(name)
    }
}

/// Whose deadline produced a [`ErrorEnvelope::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutSource {
    /// The inbound request's own budget elapsed while the handler ran.
    Request,
    /// A downstream call exceeded its effective timeout.
    Downstream,
}

impl fmt::Display for TimeoutSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => f.write_str("request"),
            Self::Downstream => f.write_str("downstream"),
        }
    }
}

/// How a downstream call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownstreamErrorKind {
    /// The transport could not reach the downstream.
    Unavailable,
    /// The downstream answered 401.
    Unauthorized,
    /// The downstream answered with a body that could not be decoded.
    UnexpectedResponse,
    /// The downstream answered with a non-success status.
    ErrorResponse,
}

impl fmt::Display for DownstreamErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "unavailable"),
            Self::Unauthorized => write!(f, "unauthorized"),
            Self::UnexpectedResponse => write!(f, "unexpected response"),
            Self::ErrorResponse => write!(f, "error response"),
        }
    }
}

/// A failed downstream call.
///
/// Keeps the original transport cause, the response status (if one arrived),
/// a short snippet of the body and, when the downstream operation declares a
/// typed error shape, the decoded error body so handlers can branch on it:
///
/// ```ignore
/// match clients.call::<_, Pong>(&ctx, "backend.Ping", &req).await {
///     Err(ErrorEnvelope::Downstream(err)) => match err.typed_body::<BackendError>() {
///         Some(body) if body.code == "NOT_FOUND" => Ok(Pong::default()),
///         _ => Err(err.into()),
///     },
///     other => other,
/// }
/// ```
#[derive(Debug, Clone)]
pub struct DownstreamError {
    operation: String,
    kind: DownstreamErrorKind,
    status: Option<StatusCode>,
    snippet: String,
    body: Option<Value>,
    cause: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl DownstreamError {
    /// Creates an error for a call that never produced a response.
    pub fn unavailable(
        operation: impl Into<String>,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            operation: operation.into(),
            kind: DownstreamErrorKind::Unavailable,
            status: None,
            snippet: String::new(),
            body: None,
            cause: Some(Arc::new(cause)),
        }
    }

    /// Creates an error for a call that produced a response the caller
    /// cannot use. `declared` decodes the body as the typed error shape.
    pub fn from_response(
        operation: impl Into<String>,
        kind: DownstreamErrorKind,
        status: StatusCode,
        body: &[u8],
        declared: bool,
    ) -> Self {
        let decoded = if declared {
            serde_json::from_slice::<Value>(body).ok()
        } else {
            None
        };
        Self {
            operation: operation.into(),
            kind,
            status: Some(status),
            snippet: snippet(body),
            body: decoded,
            cause: None,
        }
    }

    /// Attaches the underlying cause.
    pub fn with_cause(mut self, cause: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.cause = Some(Arc::new(cause));
        self
    }

    /// Qualified downstream operation name (`downstream.Operation`).
    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Failure category.
    pub fn kind(&self) -> DownstreamErrorKind {
        self.kind
    }

    /// Response status, when the downstream answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }

    /// At most 128 bytes of the response body, lossily decoded.
    pub fn snippet(&self) -> &str {
        &self.snippet
    }

    /// The decoded error body, if the operation declares a typed error shape
    /// and the body was valid JSON.
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Decodes the error body into the caller's type.
    pub fn typed_body<T: DeserializeOwned>(&self) -> Option<T> {
        self.body
            .as_ref()
            .and_then(|body| serde_json::from_value(body.clone()).ok())
    }

    /// Returns `true` when [`body`](Self::body) is present.
    pub fn is_decoded(&self) -> bool {
        self.body.is_some()
    }
}

impl fmt::Display for DownstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "downstream '{}' {}", self.operation, self.kind)?;
        if let Some(status) = self.status {
            write!(f, " (status {})", status.as_u16())?;
        }
        if let Some(cause) = &self.cause {
            write!(f, ": {}", cause)?;
        }
        if !self.snippet.is_empty() {
            write!(f, ": {}", self.snippet)?;
        }
        Ok(())
    }
}

impl std::error::Error for DownstreamError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

pub(crate) fn snippet(body: &[u8]) -> String {
    let cut = body.len().min(SNIPPET_LIMIT);
    String::from_utf8_lossy(&body[..cut]).into_owned()
}

/// An error whose transport rendering is chosen by the handler.
///
/// The default mapper renders it verbatim: `http_status` becomes the status,
/// `http_code` and `http_message` fill the body, and any extra fields are
/// added next to `status` in the body.
///
/// ```
/// use http::StatusCode;
/// use service_core::CustomError;
///
/// let err = CustomError::new("QuotaExceeded", StatusCode::TOO_MANY_REQUESTS, "2001", "slow down");
/// assert_eq!(err.http_status, 429);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{name}: {http_code} {http_message}")]
pub struct CustomError {
    /// Identifier used in logs.
    pub name: String,
    /// Transport status code.
    pub http_status: u16,
    /// Application error code placed in the body.
    pub http_code: String,
    /// Human-readable description placed in the body.
    pub http_message: String,
    /// Extra top-level body fields.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub fields: Map<String, Value>,
}

impl CustomError {
    /// Creates a custom error.
    pub fn new(
        name: impl Into<String>,
        status: StatusCode,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            http_status: status.as_u16(),
            http_code: code.into(),
            http_message: message.into(),
            fields: Map::new(),
        }
    }

    /// Adds an extra body field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

/// Reasons a [`ServiceContract`](crate::ServiceContract) cannot be built.
///
/// Every rule, expression and downstream reference is checked while
/// building, so a contract that builds never fails for these reasons at
/// request time.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Two operations share a name.
    #[error("operation '{0}' declared twice")]
    DuplicateOperation(String),

    /// Two downstream operations share a qualified name.
    #[error("downstream operation '{0}' declared twice")]
    DuplicateDownstream(String),

    /// A rule set names an unknown constraint kind or carries a bad parameter.
    #[error("operation '{operation}': {source}")]
    InvalidRule {
        /// Operation owning the rule set.
        operation: String,
        /// Underlying rule error.
        source: RuleError,
    },

    /// The operation's authorization expression does not compile.
    #[error("operation '{operation}': malformed authorization rule: {source}")]
    InvalidExpression {
        /// Operation owning the rule.
        operation: String,
        /// Underlying compile error.
        source: ExprError,
    },

    /// The operation has a rule but no authenticator is installed.
    #[error("operation '{0}' has an authorization rule but no authenticator is installed")]
    MissingAuthenticator(String),

    /// The operation may call a downstream operation that was never declared.
    #[error("operation '{operation}' refers to undeclared downstream operation '{downstream}'")]
    UnknownDownstream {
        /// Calling operation.
        operation: String,
        /// Qualified downstream operation name.
        downstream: String,
    },

    /// Configuration could not be read.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The default downstream transport could not be constructed.
    #[error("downstream transport: {0}")]
    Transport(String),

    /// A metric could not be registered.
    #[error("metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snippet_is_capped() {
        let body = vec![b'a'; 400];
        let err = DownstreamError::from_response(
            "backend.Ping",
            DownstreamErrorKind::ErrorResponse,
            StatusCode::BAD_GATEWAY,
            &body,
            false,
        );
        assert_eq!(err.snippet().len(), SNIPPET_LIMIT);
        assert!(err.body().is_none());
    }

    #[test]
    fn declared_body_is_decoded() {
        #[derive(Deserialize)]
        struct Problem {
            code: String,
        }

        let err = DownstreamError::from_response(
            "backend.Ping",
            DownstreamErrorKind::ErrorResponse,
            StatusCode::NOT_FOUND,
            br#"{"code":"NOT_FOUND"}"#,
            true,
        );
        let problem: Problem = err.typed_body().expect("typed body");
        assert_eq!(problem.code, "NOT_FOUND");
        assert!(err.to_string().contains("status 404"));
    }

    #[test]
    fn undecodable_declared_body_is_absent() {
        let err = DownstreamError::from_response(
            "backend.Ping",
            DownstreamErrorKind::ErrorResponse,
            StatusCode::INTERNAL_SERVER_ERROR,
            b"<html>oops</html>",
            true,
        );
        assert!(!err.is_decoded());
        assert_eq!(err.snippet(), "<html>oops</html>");
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(
            ErrorEnvelope::internal("x").kind(),
            ErrorKind::Internal
        );
        assert_eq!(
            ErrorEnvelope::unimplemented("Ping").to_string(),
            "operation 'Ping' is not implemented"
        );
        assert_eq!(ErrorKind::MissingHeader.to_string(), "missing_header");
    }

    #[test]
    fn missing_header_is_case_insensitive() {
        let err = ErrorEnvelope::missing_header("X-Trace");
        assert!(err.caused_by_header("x-trace"));
        assert!(err.caused_by_header("X-TRACE"));
        assert!(!ErrorEnvelope::internal("x-trace").caused_by_header("x-trace"));
    }
}
