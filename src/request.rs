use std::collections::HashMap;

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// One inbound call, independent of the listener that received it.
///
/// Path and query parameters are merged into the JSON request object before
/// validation. A parameter value that parses as a JSON scalar (`20`,
/// `true`, `-1.5`) is decoded as that scalar; anything else stays a string.
/// Body fields win over parameters of the same name.
#[derive(Debug, Clone, Default)]
pub struct InboundRequest {
    /// Request headers.
    pub headers: HeaderMap,
    /// Parameters captured from the route.
    pub path_params: HashMap<String, String>,
    /// Query parameters in arrival order.
    pub query: Vec<(String, String)>,
    /// Raw body.
    pub body: Bytes,
}

impl InboundRequest {
    /// A request with a raw body.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// A request whose body is `value` encoded as JSON.
    pub fn json(value: &Value) -> Self {
        Self::new(value.to_string())
    }

    /// Adds a header. Invalid names or values are skipped with a warning.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.append(name, value);
            }
            _ => tracing::warn!(header = %name, "skipping invalid header"),
        }
        self
    }

    /// Adds a path parameter.
    pub fn with_path_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.path_params.insert(name.into(), value.into());
        self
    }

    /// Adds a query parameter.
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Decodes the body and merges parameters into one JSON value.
    ///
    /// An empty body decodes as an empty object. A non-object body is
    /// returned as is when there are no parameters to merge.
    pub(crate) fn payload(&self) -> Result<Value, String> {
        let body = if self.body.iter().all(u8::is_ascii_whitespace) {
            Value::Object(Map::new())
        } else {
            serde_json::from_slice(&self.body).map_err(|err| err.to_string())?
        };

        if self.path_params.is_empty() && self.query.is_empty() {
            return Ok(body);
        }
        let Value::Object(mut fields) = body else {
            return Err("parameters require a JSON object body".to_string());
        };
        let params = self
            .query
            .iter()
            .map(|(k, v)| (k, v))
            .chain(self.path_params.iter());
        for (name, raw) in params {
            fields
                .entry(name.clone())
                .or_insert_with(|| param_value(raw));
        }
        Ok(Value::Object(fields))
    }
}

fn param_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(value @ (Value::Number(_) | Value::Bool(_))) => value,
        _ => Value::String(raw.to_string()),
    }
}

/// What the pipeline answered.
#[derive(Debug, Clone)]
pub struct OutboundResponse {
    /// Response status.
    pub status: StatusCode,
    /// Response headers; always carries `content-type` when there is a body.
    pub headers: HeaderMap,
    /// Encoded body.
    pub body: Bytes,
}

impl OutboundResponse {
    pub(crate) fn new(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(CONTENT_TYPE, value);
        }
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    /// The `content-type` header.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// The decode error when the body is not a `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// The body as lossy UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_merge_as_scalars() {
        let request = InboundRequest::json(&json!({"name": "x"}))
            .with_path_param("identifier", "20")
            .with_query("verbose", "true")
            .with_query("tag", "blue");
        assert_eq!(
            request.payload().unwrap(),
            json!({"name": "x", "identifier": 20, "verbose": true, "tag": "blue"})
        );
    }

    #[test]
    fn body_fields_win_over_params() {
        let request = InboundRequest::json(&json!({"identifier": 3})).with_query("identifier", "5");
        assert_eq!(request.payload().unwrap()["identifier"], 3);
    }

    #[test]
    fn empty_body_is_empty_object() {
        assert_eq!(InboundRequest::new("  ").payload().unwrap(), json!({}));
    }

    #[test]
    fn malformed_body_is_an_error() {
        assert!(InboundRequest::new("{").payload().is_err());
        assert!(InboundRequest::new("[1]")
            .with_query("a", "b")
            .payload()
            .is_err());
    }

    #[test]
    fn invalid_headers_are_skipped() {
        let request = InboundRequest::default()
            .with_header("x-ok", "1")
            .with_header("bad header", "1");
        assert_eq!(request.headers.len(), 1);
    }
}
