//! Calls from handlers to downstream services.
//!
//! A [`DownstreamOperation`] declares one callable endpoint of a downstream
//! (method, path template, required headers). The [`Dispatcher`] holds one
//! [`DownstreamClient`] per declared operation, all sharing one
//! [`Transport`]. Each service operation receives a [`DownstreamClients`]
//! bundle limited to the downstream operations it declared.

mod client;
mod transport;

use std::fmt;
use std::time::Duration;

use http::{HeaderMap, Method, StatusCode};
use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::ErrorEnvelope;

pub use self::client::{Dispatcher, DownstreamClient, DownstreamClients};
pub use self::transport::HttpTransport;

/// One callable endpoint of a downstream service.
///
/// The path may contain `{field}` placeholders. They are filled from the
/// request object's fields, percent-encoded, and removed from the body. Fields
/// listed with [`query`](Self::query) travel as query parameters. For `GET`,
/// `HEAD` and `DELETE` every remaining scalar field becomes a query
/// parameter and no body is sent.
///
/// ```
/// use http::Method;
/// use service_core::DownstreamOperation;
///
/// let op = DownstreamOperation::new("encoder", "Encode", Method::POST, "/v1/encoders/{encoderId}")
///     .require_header("x-tenant")
///     .typed_errors();
/// assert_eq!(op.qualified_name(), "encoder.Encode");
/// ```
#[derive(Debug, Clone)]
pub struct DownstreamOperation {
    downstream: String,
    name: String,
    method: Method,
    path: String,
    required_headers: Vec<String>,
    typed_errors: bool,
    query: Vec<String>,
}

impl DownstreamOperation {
    /// Declares operation `name` of downstream `downstream`.
    pub fn new(
        downstream: impl Into<String>,
        name: impl Into<String>,
        method: Method,
        path: impl Into<String>,
    ) -> Self {
        Self {
            downstream: downstream.into(),
            name: name.into(),
            method,
            path: path.into(),
            required_headers: Vec::new(),
            typed_errors: false,
            query: Vec::new(),
        }
    }

    /// Requires header `name` to be present and non-empty on every call.
    pub fn require_header(mut self, name: impl AsRef<str>) -> Self {
        let name = name.as_ref().to_ascii_lowercase();
        if !self.required_headers.contains(&name) {
            self.required_headers.push(name);
        }
        self
    }

    /// Declares that non-success responses carry a JSON error body worth
    /// decoding into [`DownstreamError::body`](crate::DownstreamError::body).
    pub fn typed_errors(mut self) -> Self {
        self.typed_errors = true;
        self
    }

    /// Sends request field `field` as a query parameter.
    pub fn query(mut self, field: impl Into<String>) -> Self {
        self.query.push(field.into());
        self
    }

    /// Name of the downstream service.
    pub fn downstream(&self) -> &str {
        &self.downstream
    }

    /// Operation name within the downstream.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `downstream.Operation`.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.downstream, self.name)
    }

    /// HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Path template.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Lowercase names of required headers.
    pub fn required_headers(&self) -> &[String] {
        &self.required_headers
    }

    /// Whether error bodies are decoded.
    pub fn has_typed_errors(&self) -> bool {
        self.typed_errors
    }

    /// Splits a request object into path, query and body.
    pub(crate) fn encode(&self, request: Value) -> Result<Encoded, ErrorEnvelope> {
        let mut fields = match request {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                if self.path.contains('{') {
                    return Err(ErrorEnvelope::internal(format!(
                        "downstream '{}' needs an object request to fill its path",
                        self.qualified_name()
                    )));
                }
                return Ok(Encoded {
                    path: self.path.clone(),
                    query: Vec::new(),
                    body: Some(other),
                });
            }
        };

        let path = self.fill_path(&mut fields)?;

        let mut query = Vec::new();
        for name in &self.query {
            if let Some(value) = fields.remove(name) {
                if !value.is_null() {
                    query.push((name.clone(), scalar_text(&value)));
                }
            }
        }

        let body = if matches!(self.method, Method::GET | Method::HEAD | Method::DELETE) {
            query.extend(
                fields
                    .into_iter()
                    .filter(|(_, value)| !value.is_null())
                    .map(|(name, value)| {
                        let text = scalar_text(&value);
                        (name, text)
                    }),
            );
            None
        } else {
            Some(Value::Object(fields))
        };

        Ok(Encoded { path, query, body })
    }

    fn fill_path(&self, fields: &mut Map<String, Value>) -> Result<String, ErrorEnvelope> {
        let mut path = String::with_capacity(self.path.len());
        let mut rest = self.path.as_str();

        while let Some(open) = rest.find('{') {
            let Some(close) = rest[open..].find('}') else {
                break;
            };
            let field = &rest[open + 1..open + close];
            let value = fields
                .remove(field)
                .filter(|value| !value.is_null())
                .ok_or_else(|| {
                    ErrorEnvelope::internal(format!(
                        "downstream '{}' path parameter '{}' is missing from the request",
                        self.qualified_name(),
                        field
                    ))
                })?;
            path.push_str(&rest[..open]);
            path.push_str(&urlencoding::encode(&scalar_text(&value)));
            rest = &rest[open + close + 1..];
        }
        path.push_str(rest);
        Ok(path)
    }
}

#[derive(Debug)]
pub(crate) struct Encoded {
    pub(crate) path: String,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) body: Option<Value>,
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// A fully resolved downstream call, as handed to a [`Transport`].
#[derive(Debug, Clone)]
pub struct DownstreamCall {
    /// Qualified operation name (`downstream.Operation`).
    pub operation: String,
    /// HTTP method.
    pub method: Method,
    /// Configured service URL.
    pub base_url: String,
    /// Filled path.
    pub path: String,
    /// Query parameters in order.
    pub query: Vec<(String, String)>,
    /// Merged headers.
    pub headers: HeaderMap,
    /// JSON body, if the method carries one.
    pub body: Option<Value>,
    /// Effective timeout: the smaller of the caller's remaining budget and
    /// the downstream's client timeout.
    pub timeout: Duration,
}

impl DownstreamCall {
    /// `base_url` joined with `path`.
    pub fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.path)
    }

    /// First value of query parameter `name`.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// What a downstream answered.
#[derive(Debug, Clone)]
pub struct DownstreamReply {
    /// Response status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Raw response body.
    pub body: Bytes,
}

impl DownstreamReply {
    /// A reply without headers.
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }
}

/// Why a transport produced no reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The downstream could not be reached.
    #[error("unreachable: {0}")]
    Unreachable(String),
    /// The transport gave up at the call's timeout.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// Any other transport failure.
    #[error("transport failure: {0}")]
    Failed(String),
    /// A test double received a call it was not prepared for.
    #[error("unexpected call: {0}")]
    UnexpectedCall(String),
}

/// Delivers resolved downstream calls.
///
/// [`HttpTransport`] is the production implementation; the test harness
/// substitutes [`MockTransport`](crate::mock::MockTransport).
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Sends `call` and waits for the reply. Implementations should give up
    /// at `call.timeout`; the client enforces it as well.
    async fn send(&self, call: DownstreamCall) -> Result<DownstreamReply, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn path_placeholders_consume_fields() {
        let op = DownstreamOperation::new("encoder", "Encode", Method::POST, "/v1/{encoderId}/run");
        let encoded = op
            .encode(json!({"encoderId": "rot13", "content": "hello"}))
            .unwrap();
        assert_eq!(encoded.path, "/v1/rot13/run");
        assert_eq!(encoded.body, Some(json!({"content": "hello"})));
    }

    #[test]
    fn path_values_are_percent_encoded() {
        let op = DownstreamOperation::new("stock", "Level", Method::GET, "/levels/{sku}");
        let encoded = op.encode(json!({"sku": "ABC/1?admin=1#x"})).unwrap();
        assert_eq!(encoded.path, "/levels/ABC%2F1%3Fadmin%3D1%23x");
        assert!(encoded.query.is_empty());

        let call = DownstreamCall {
            operation: op.qualified_name(),
            method: Method::GET,
            base_url: "http://stock.internal".to_string(),
            path: encoded.path,
            query: encoded.query,
            headers: HeaderMap::new(),
            body: None,
            timeout: Duration::from_secs(1),
        };
        let url = reqwest::Url::parse(&call.url()).unwrap();
        assert_eq!(url.path(), "/levels/ABC%2F1%3Fadmin%3D1%23x");
        assert_eq!(url.query(), None);
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn missing_path_field_is_internal() {
        let op = DownstreamOperation::new("encoder", "Encode", Method::POST, "/v1/{encoderId}");
        let err = op.encode(json!({"content": "x"})).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Internal);
    }

    #[test]
    fn get_sends_scalars_as_query() {
        let op = DownstreamOperation::new("fizz", "Check", Method::GET, "/check/{n}");
        let encoded = op.encode(json!({"n": 15, "verbose": true})).unwrap();
        assert_eq!(encoded.path, "/check/15");
        assert_eq!(encoded.query, vec![("verbose".to_string(), "true".to_string())]);
        assert!(encoded.body.is_none());
    }

    #[test]
    fn declared_query_fields_leave_the_body() {
        let op = DownstreamOperation::new("search", "Find", Method::POST, "/find").query("page");
        let encoded = op.encode(json!({"page": 2, "term": "x"})).unwrap();
        assert_eq!(encoded.query, vec![("page".to_string(), "2".to_string())]);
        assert_eq!(encoded.body, Some(json!({"term": "x"})));
    }

    #[test]
    fn url_joins_without_double_slash() {
        let call = DownstreamCall {
            operation: "a.B".to_string(),
            method: Method::GET,
            base_url: "http://localhost:9000/".to_string(),
            path: "/ping".to_string(),
            query: vec![("q".to_string(), "1".to_string())],
            headers: HeaderMap::new(),
            body: None,
            timeout: Duration::from_secs(1),
        };
        assert_eq!(call.url(), "http://localhost:9000/ping");
        assert_eq!(call.query_param("q"), Some("1"));
    }

    #[test]
    fn required_headers_are_lowercased_once() {
        let op = DownstreamOperation::new("a", "B", Method::GET, "/")
            .require_header("Y")
            .require_header("y");
        assert_eq!(op.required_headers(), ["y"]);
    }
}
