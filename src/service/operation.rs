use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::context::RequestContext;
use crate::downstream::DownstreamClients;
use crate::error::ErrorEnvelope;
use crate::validate::{RuleSet, ValidationErrors};

/// A response that bypasses JSON encoding and response validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// Declared content type.
    pub content_type: String,
    /// Body bytes, sent as is.
    pub body: Bytes,
}

impl RawResponse {
    /// A body with an explicit content type.
    pub fn new(content_type: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            body: body.into(),
        }
    }

    /// A `text/plain; charset=utf-8` body.
    pub fn text(body: impl Into<String>) -> Self {
        Self::new("text/plain; charset=utf-8", body.into())
    }
}

pub(crate) enum Output {
    Json(Value),
    Raw(RawResponse),
}

pub(crate) type HandlerFuture = BoxFuture<'static, Result<Output, ErrorEnvelope>>;

pub(crate) type Handler =
    Arc<dyn Fn(RequestContext, Value, DownstreamClients) -> HandlerFuture + Send + Sync>;

/// One named endpoint of a service: route, rules, permitted downstream
/// calls and handler.
///
/// An operation without a handler is still routable and answers
/// [`ErrorEnvelope::Unimplemented`].
///
/// ```
/// use http::Method;
/// use serde::{Deserialize, Serialize};
/// use service_core::{ErrorEnvelope, Operation, RequestContext, RuleSet};
///
/// #[derive(Deserialize)]
/// struct Echo { identifier: i64 }
/// #[derive(Serialize)]
/// struct Reply { identifier: i64 }
///
/// let op = Operation::new("Echo", Method::POST, "/echo")
///     .request_rules(RuleSet::new().field("identifier", "required,min=0,max=20").unwrap())
///     .handler(|_ctx: RequestContext, req: Echo| async move {
///         Ok::<_, ErrorEnvelope>(Reply { identifier: req.identifier })
///     });
/// assert!(op.is_implemented());
/// ```
#[derive(Clone)]
pub struct Operation {
    name: String,
    method: Method,
    path: String,
    request_rules: RuleSet,
    response_rules: RuleSet,
    downstream: Vec<String>,
    authorize: Option<String>,
    success_status: StatusCode,
    pub(crate) handler: Option<Handler>,
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("downstream", &self.downstream)
            .field("authorize", &self.authorize)
            .field("implemented", &self.handler.is_some())
            .finish()
    }
}

impl Operation {
    /// Declares operation `name`, routed at `method path`. Path parameters
    /// are written `{name}`.
    pub fn new(name: impl Into<String>, method: Method, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            method,
            path: path.into(),
            request_rules: RuleSet::new(),
            response_rules: RuleSet::new(),
            downstream: Vec::new(),
            authorize: None,
            success_status: StatusCode::OK,
            handler: None,
        }
    }

    /// Rules the decoded request must satisfy before the handler runs.
    pub fn request_rules(mut self, rules: RuleSet) -> Self {
        self.request_rules = rules;
        self
    }

    /// Rules the handler's response must satisfy. Violations of ignorable
    /// rules are logged; any other violation turns the response into an
    /// internal error.
    pub fn response_rules(mut self, rules: RuleSet) -> Self {
        self.response_rules = rules;
        self
    }

    /// Permits calls to downstream operation `qualified` (`downstream.Operation`).
    pub fn downstream(mut self, qualified: impl Into<String>) -> Self {
        let qualified = qualified.into();
        if !self.downstream.contains(&qualified) {
            self.downstream.push(qualified);
        }
        self
    }

    /// Requires the bearer credential's claims to satisfy `expression`.
    pub fn authorize(mut self, expression: impl Into<String>) -> Self {
        self.authorize = Some(expression.into());
        self
    }

    /// Status of successful responses; `200 OK` by default.
    pub fn success_status(mut self, status: StatusCode) -> Self {
        self.success_status = status;
        self
    }

    /// Installs a `(context, request) -> response` handler.
    pub fn handler<Req, Resp, F, Fut>(mut self, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(RequestContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, ErrorEnvelope>> + Send + 'static,
    {
        let wrapped: Handler = Arc::new(
            move |ctx: RequestContext, payload: Value, _clients: DownstreamClients| -> HandlerFuture {
                let pending = decode::<Req>(payload).map(|request| handler(ctx, request));
                Box::pin(async move { encode(&pending?.await?) })
            },
        );
        self.handler = Some(wrapped);
        self
    }

    /// Installs a `(context, request, clients) -> response` handler that may
    /// call the downstream operations declared with [`downstream`](Self::downstream).
    pub fn handler_with_clients<Req, Resp, F, Fut>(mut self, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(RequestContext, Req, DownstreamClients) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, ErrorEnvelope>> + Send + 'static,
    {
        let wrapped: Handler = Arc::new(
            move |ctx: RequestContext, payload: Value, clients: DownstreamClients| -> HandlerFuture {
                let pending = decode::<Req>(payload).map(|request| handler(ctx, request, clients));
                Box::pin(async move { encode(&pending?.await?) })
            },
        );
        self.handler = Some(wrapped);
        self
    }

    /// Installs a handler whose response skips JSON encoding.
    pub fn raw_handler<Req, F, Fut>(mut self, handler: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(RequestContext, Req, DownstreamClients) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RawResponse, ErrorEnvelope>> + Send + 'static,
    {
        let wrapped: Handler = Arc::new(
            move |ctx: RequestContext, payload: Value, clients: DownstreamClients| -> HandlerFuture {
                let pending = decode::<Req>(payload).map(|request| handler(ctx, request, clients));
                Box::pin(async move { Ok::<_, ErrorEnvelope>(Output::Raw(pending?.await?)) })
            },
        );
        self.handler = Some(wrapped);
        self
    }

    /// Operation name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Routed method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Routed path template, relative to the base path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Request-side rules.
    pub fn request_rule_set(&self) -> &RuleSet {
        &self.request_rules
    }

    /// Response-side rules.
    pub fn response_rule_set(&self) -> &RuleSet {
        &self.response_rules
    }

    /// Permitted downstream operations.
    pub fn downstream_operations(&self) -> &[String] {
        &self.downstream
    }

    /// Authorization expression, if any.
    pub fn authorization(&self) -> Option<&str> {
        self.authorize.as_deref()
    }

    /// Status of successful responses.
    pub fn status_on_success(&self) -> StatusCode {
        self.success_status
    }

    /// Whether a handler is installed.
    pub fn is_implemented(&self) -> bool {
        self.handler.is_some()
    }
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, ErrorEnvelope> {
    serde_json::from_value(payload).map_err(|err| ValidationErrors::decode(err.to_string()).into())
}

fn encode<T: Serialize>(response: &T) -> Result<Output, ErrorEnvelope> {
    serde_json::to_value(response)
        .map(Output::Json)
        .map_err(|err| ErrorEnvelope::internal(format!("encoding response: {}", err)))
}
