//! Translation of [`ErrorEnvelope`] into a transport status and body.
//!
//! The default table:
//!
//! | Error | Status | Code |
//! |---|---|---|
//! | validation, missing header | 400 | `1001` |
//! | authentication | 401 (403 untrusted source, 500 authenticator failure) | `1003` |
//! | authorization | 403 | `1004` |
//! | downstream unreachable | 503 | `1013` |
//! | downstream error with a decoded typed body | the downstream's status | `1014` |
//! | other downstream failures (untyped or undecodable replies) | 500 | `9999` |
//! | downstream timeout | 504 | `1005` |
//! | request timeout | 500 | `1006` |
//! | internal | 500 | `9998` |
//! | unimplemented | 501 | `9997` |
//! | custom | its own | its own |
//!
//! An installed override runs first; returning `None` falls through to the
//! table.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use serde_json::{json, Map, Value};

use crate::auth::AuthErrorCode;
use crate::error::{DownstreamErrorKind, ErrorEnvelope, TimeoutSource};

/// Content type of every error body.
pub const JSON_CONTENT_TYPE: &str = "application/json;charset=UTF-8";

/// A rendered error: status plus `{"status":{"code":..,"description":..}}`.
///
/// # Examples
///
/// ```
/// use http::StatusCode;
/// use service_core::HttpError;
///
/// let err = HttpError::new(StatusCode::BAD_REQUEST, "1001", "bad").with_field("header", "y");
/// assert_eq!(
///     err.body(),
///     serde_json::json!({"status": {"code": "1001", "description": "bad"}, "header": "y"})
/// );
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct HttpError {
    /// Transport status.
    pub status: StatusCode,
    /// Application error code.
    pub code: String,
    /// Human-readable description.
    pub description: String,
    /// Extra top-level body fields.
    pub fields: Map<String, Value>,
}

impl HttpError {
    /// Creates an error body without extra fields.
    pub fn new(status: StatusCode, code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            description: description.into(),
            fields: Map::new(),
        }
    }

    /// Adds an extra top-level body field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// The JSON body.
    pub fn body(&self) -> Value {
        let mut body = self.fields.clone();
        body.insert(
            "status".to_string(),
            json!({"code": self.code, "description": self.description}),
        );
        Value::Object(body)
    }

    /// The encoded JSON body.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.body().to_string())
    }
}

/// What the override knows about the failing request.
#[derive(Debug, Clone, Copy)]
pub struct ErrorScope<'a> {
    /// Operation being served.
    pub operation: &'a str,
    /// Request identifier.
    pub request_id: &'a str,
}

/// An error-mapping override. Returning `None` falls through to the default table.
pub type ErrorOverride =
    Arc<dyn Fn(&ErrorEnvelope, &ErrorScope<'_>) -> Option<HttpError> + Send + Sync>;

/// Maps every [`ErrorEnvelope`] to an [`HttpError`]. Total: never fails.
#[derive(Clone, Default)]
pub struct ErrorMapper {
    override_hook: Option<ErrorOverride>,
}

impl fmt::Debug for ErrorMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorMapper")
            .field("override", &self.override_hook.is_some())
            .finish()
    }
}

impl ErrorMapper {
    /// A mapper using only the default table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs an override that runs before the default table.
    pub fn with_override<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ErrorEnvelope, &ErrorScope<'_>) -> Option<HttpError> + Send + Sync + 'static,
    {
        self.override_hook = Some(Arc::new(hook));
        self
    }

    /// Maps `err`, consulting the override first.
    pub fn map(&self, err: &ErrorEnvelope, scope: &ErrorScope<'_>) -> HttpError {
        if let Some(mapped) = self.override_hook.as_ref().and_then(|hook| hook(err, scope)) {
            tracing::debug!(
                request_id = %scope.request_id,
                operation = %scope.operation,
                status = mapped.status.as_u16(),
                "error mapped by override"
            );
            return mapped;
        }
        Self::default_policy(err)
    }

    /// The default table.
    pub fn default_policy(err: &ErrorEnvelope) -> HttpError {
        match err {
            ErrorEnvelope::Validation(report) => {
                let violations: Vec<Value> = report
                    .violations()
                    .iter()
                    .map(|v| json!({"field": v.field, "constraint": v.constraint}))
                    .collect();
                bad_request().with_field("violations", violations)
            }
            ErrorEnvelope::MissingHeader { name } => bad_request().with_field("header", name.as_str()),
            ErrorEnvelope::Authentication(auth) => match auth.code() {
                AuthErrorCode::UntrustedSource => forbidden(),
                AuthErrorCode::Unknown => internal(),
                _ => HttpError::new(StatusCode::UNAUTHORIZED, "1003", "Unauthorized error"),
            },
            ErrorEnvelope::Authorization { .. } => forbidden(),
            ErrorEnvelope::Downstream(downstream) => match (downstream.kind(), downstream.status()) {
                (DownstreamErrorKind::Unavailable, _) => HttpError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "1013",
                    "Downstream system is unavailable",
                ),
                (DownstreamErrorKind::ErrorResponse, Some(status))
                    if downstream.is_decoded() && !status.is_success() =>
                {
                    let mut mapped =
                        HttpError::new(status, "1014", "Downstream service returned an error");
                    if let Some(body) = downstream.body() {
                        mapped = mapped.with_field("downstream", body.clone());
                    }
                    mapped
                }
                _ => unknown(),
            },
            ErrorEnvelope::Timeout {
                origin: TimeoutSource::Downstream,
            } => HttpError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "1005",
                "Time out from down stream services",
            ),
            ErrorEnvelope::Timeout {
                origin: TimeoutSource::Request,
            } => HttpError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "1006",
                "Request deadline exceeded",
            ),
            ErrorEnvelope::Internal { .. } => internal(),
            ErrorEnvelope::Unimplemented { .. } => {
                HttpError::new(StatusCode::NOT_IMPLEMENTED, "9997", "Not Implemented")
            }
            ErrorEnvelope::Custom(custom) => match StatusCode::from_u16(custom.http_status) {
                Ok(status) => HttpError {
                    status,
                    code: custom.http_code.clone(),
                    description: custom.http_message.clone(),
                    fields: custom.fields.clone(),
                },
                Err(_) => {
                    tracing::warn!(
                        name = %custom.name,
                        http_status = custom.http_status,
                        "custom error carries an invalid status"
                    );
                    unknown()
                }
            },
        }
    }
}

fn bad_request() -> HttpError {
    HttpError::new(
        StatusCode::BAD_REQUEST,
        "1001",
        "Missing one or more of the required parameters",
    )
}

fn forbidden() -> HttpError {
    HttpError::new(StatusCode::FORBIDDEN, "1004", "Forbidden")
}

fn unknown() -> HttpError {
    HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, "9999", "Unknown Error")
}

fn internal() -> HttpError {
    HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, "9998", "Internal Server Error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthError;
    use crate::error::{CustomError, DownstreamError};
    use crate::validate::ValidationErrors;

    const SCOPE: ErrorScope<'static> = ErrorScope {
        operation: "Ping",
        request_id: "req-1",
    };

    fn status(err: ErrorEnvelope) -> u16 {
        ErrorMapper::new().map(&err, &SCOPE).status.as_u16()
    }

    #[derive(Debug, thiserror::Error)]
    #[error("connection refused")]
    struct Refused;

    #[test]
    fn default_table() {
        assert_eq!(status(ValidationErrors::decode("bad json").into()), 400);
        assert_eq!(status(ErrorEnvelope::missing_header("y")), 400);
        assert_eq!(
            status(AuthError::new(AuthErrorCode::InvalidCredential, "x").into()),
            401
        );
        assert_eq!(
            status(AuthError::new(AuthErrorCode::UntrustedSource, "x").into()),
            403
        );
        assert_eq!(status(AuthError::new(AuthErrorCode::Unknown, "x").into()), 500);
        assert_eq!(status(ErrorEnvelope::authorization("no")), 403);
        assert_eq!(
            status(DownstreamError::unavailable("b.Op", Refused).into()),
            503
        );
        assert_eq!(status(ErrorEnvelope::timeout(TimeoutSource::Downstream)), 504);
        assert_eq!(status(ErrorEnvelope::timeout(TimeoutSource::Request)), 500);
        assert_eq!(status(ErrorEnvelope::internal("boom")), 500);
        assert_eq!(status(ErrorEnvelope::unimplemented("Ping")), 501);
    }

    #[test]
    fn downstream_status_is_used_when_body_decodes() {
        let decoded = DownstreamError::from_response(
            "b.Op",
            DownstreamErrorKind::ErrorResponse,
            StatusCode::NOT_FOUND,
            br#"{"reason":"gone"}"#,
            true,
        );
        let mapped = ErrorMapper::new().map(&decoded.into(), &SCOPE);
        assert_eq!(mapped.status, StatusCode::NOT_FOUND);
        assert_eq!(mapped.body()["downstream"]["reason"], "gone");

        let opaque = DownstreamError::from_response(
            "b.Op",
            DownstreamErrorKind::ErrorResponse,
            StatusCode::NOT_FOUND,
            b"gone",
            true,
        );
        let mapped = ErrorMapper::new().map(&opaque.into(), &SCOPE);
        assert_eq!(mapped.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(mapped.code, "9999");

        let untyped = DownstreamError::from_response(
            "b.Op",
            DownstreamErrorKind::ErrorResponse,
            StatusCode::NOT_FOUND,
            br#"{"reason":"gone"}"#,
            false,
        );
        assert_eq!(status(untyped.into()), 500);
    }

    #[test]
    fn custom_errors_render_verbatim() {
        let custom = CustomError::new("Quota", StatusCode::TOO_MANY_REQUESTS, "2001", "slow down")
            .with_field("retry_after", 3);
        let mapped = ErrorMapper::new().map(&custom.into(), &SCOPE);
        assert_eq!(mapped.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            mapped.body(),
            json!({"status": {"code": "2001", "description": "slow down"}, "retry_after": 3})
        );

        let mut broken = CustomError::new("Broken", StatusCode::OK, "x", "y");
        broken.http_status = 1000;
        assert_eq!(status(broken.into()), 500);
    }

    #[test]
    fn override_runs_first_and_may_fall_through() {
        let mapper = ErrorMapper::new().with_override(|err, scope| {
            assert_eq!(scope.operation, "Ping");
            err.caused_by_header("y")
                .then(|| HttpError::new(StatusCode::IM_A_TEAPOT, "4242", "missing y"))
        });
        let hit = mapper.map(&ErrorEnvelope::missing_header("Y"), &SCOPE);
        assert_eq!(hit.status, StatusCode::IM_A_TEAPOT);

        let fall_through = mapper.map(&ErrorEnvelope::missing_header("x"), &SCOPE);
        assert_eq!(fall_through.status, StatusCode::BAD_REQUEST);
        assert_eq!(fall_through.body()["header"], "x");
    }
}
