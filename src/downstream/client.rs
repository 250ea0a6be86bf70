use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, StatusCode};
use prometheus::IntCounterVec;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{DownstreamCall, DownstreamOperation, DownstreamReply, Transport, TransportError};
use crate::context::RequestContext;
use crate::error::{DownstreamError, DownstreamErrorKind, ErrorEnvelope, TimeoutSource};
use crate::settings::{DownstreamConfig, ServiceConfig};

/// The typed client of one downstream operation.
///
/// Every call derives its timeout from the caller's context: the smaller of
/// the context's remaining budget and the downstream's `client_timeout`. A
/// downstream call therefore never outlives the request that issued it.
#[derive(Clone)]
pub struct DownstreamClient {
    operation: Arc<DownstreamOperation>,
    qualified: Arc<str>,
    settings: DownstreamConfig,
    transport: Arc<dyn Transport>,
    calls: Option<IntCounterVec>,
}

impl fmt::Debug for DownstreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownstreamClient")
            .field("operation", &self.qualified)
            .field("service_url", &self.settings.service_url)
            .field("client_timeout", &self.settings.client_timeout)
            .finish()
    }
}

impl DownstreamClient {
    /// Creates a client for `operation`.
    pub fn new(
        operation: DownstreamOperation,
        settings: DownstreamConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let qualified = operation.qualified_name().into();
        Self {
            operation: Arc::new(operation),
            qualified,
            settings,
            transport,
            calls: None,
        }
    }

    fn with_metrics(mut self, calls: Option<IntCounterVec>) -> Self {
        self.calls = calls;
        self
    }

    /// The declared operation.
    pub fn operation(&self) -> &DownstreamOperation {
        &self.operation
    }

    /// `downstream.Operation`.
    pub fn qualified_name(&self) -> &str {
        &self.qualified
    }

    /// Timeout a call issued now from `ctx` would get.
    pub fn effective_timeout<S>(&self, ctx: &RequestContext<S>) -> Duration
    where
        S: crate::state::ContextState,
    {
        ctx.remaining().min(self.settings.client_timeout)
    }

    /// Calls the downstream with the context's propagated headers.
    ///
    /// # Errors
    ///
    /// - [`ErrorEnvelope::MissingHeader`] when a required header is absent or empty
    /// - [`ErrorEnvelope::Timeout`] with [`TimeoutSource::Downstream`] when the
    ///   effective timeout elapses
    /// - [`ErrorEnvelope::Downstream`] for transport failures, non-success
    ///   statuses and undecodable success bodies
    pub async fn call<Req, Resp>(&self, ctx: &RequestContext, request: &Req) -> Result<Resp, ErrorEnvelope>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.call_with_headers(ctx, request, HeaderMap::new()).await
    }

    /// Like [`call`](Self::call); `headers` replace propagated headers of
    /// the same name.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn call_with_headers<Req, Resp>(
        &self,
        ctx: &RequestContext,
        request: &Req,
        headers: HeaderMap,
    ) -> Result<Resp, ErrorEnvelope>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let reply = self.send(ctx, request, headers).await?;
        let status = reply.status;

        if status.is_success() {
            let decoded = if reply.body.is_empty() {
                serde_json::from_value(Value::Null)
            } else {
                serde_json::from_slice(&reply.body)
            };
            return decoded.map_err(|err| {
                ctx.log().warn(format_args!(
                    "downstream {} answered {} with an undecodable body: {}",
                    self.qualified, status, err
                ));
                self.count("undecodable");
                DownstreamError::from_response(
                    &*self.qualified,
                    DownstreamErrorKind::UnexpectedResponse,
                    status,
                    &reply.body,
                    false,
                )
                .with_cause(err)
                .into()
            });
        }

        let kind = if status == StatusCode::UNAUTHORIZED {
            DownstreamErrorKind::Unauthorized
        } else {
            DownstreamErrorKind::ErrorResponse
        };
        self.count("error_response");
        ctx.log().warn(format_args!(
            "downstream {} answered {}",
            self.qualified, status
        ));
        Err(DownstreamError::from_response(
            &*self.qualified,
            kind,
            status,
            &reply.body,
            self.operation.has_typed_errors(),
        )
        .into())
    }

    /// Sends the call and returns the raw reply whatever its status.
    ///
    /// # Errors
    ///
    /// Header, timeout and transport failures as for [`call`](Self::call);
    /// statuses are not inspected.
    pub async fn send<Req>(
        &self,
        ctx: &RequestContext,
        request: &Req,
        headers: HeaderMap,
    ) -> Result<DownstreamReply, ErrorEnvelope>
    where
        Req: Serialize + ?Sized,
    {
        let headers = self.merge_headers(ctx.headers(), headers)?;
        let value = serde_json::to_value(request).map_err(|err| {
            ErrorEnvelope::internal(format!(
                "encoding request for downstream {}: {}",
                self.qualified, err
            ))
        })?;
        let encoded = self.operation.encode(value)?;

        let timeout = self.effective_timeout(ctx);
        if timeout.is_zero() {
            self.count("timeout");
            return Err(ErrorEnvelope::timeout(TimeoutSource::Downstream));
        }

        let call = DownstreamCall {
            operation: self.qualified.to_string(),
            method: self.operation.method().clone(),
            base_url: self.settings.service_url.clone(),
            path: encoded.path,
            query: encoded.query,
            headers,
            body: encoded.body,
            timeout,
        };
        tracing::debug!(
            request_id = %ctx.request_id(),
            operation = %ctx.operation(),
            downstream = %self.qualified,
            timeout_ms = timeout.as_millis() as u64,
            "calling downstream"
        );

        match tokio::time::timeout(timeout, self.transport.send(call)).await {
            Err(_) | Ok(Err(TransportError::DeadlineExceeded)) => {
                self.count("timeout");
                ctx.log().warn(format_args!(
                    "downstream {} timed out after {:?}",
                    self.qualified, timeout
                ));
                Err(ErrorEnvelope::timeout(TimeoutSource::Downstream))
            }
            Ok(Err(err)) => {
                self.count("unavailable");
                ctx.log().warn(format_args!(
                    "downstream {} unavailable: {}",
                    self.qualified, err
                ));
                Err(DownstreamError::unavailable(&*self.qualified, err).into())
            }
            Ok(Ok(reply)) => {
                if reply.status.is_success() {
                    self.count("ok");
                }
                Ok(reply)
            }
        }
    }

    fn merge_headers(&self, ambient: &HeaderMap, explicit: HeaderMap) -> Result<HeaderMap, ErrorEnvelope> {
        let mut merged = ambient.clone();
        for hop in [HOST, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING, CONNECTION] {
            merged.remove(hop);
        }
        for name in explicit.keys() {
            merged.remove(name);
        }
        for (name, value) in explicit.iter() {
            merged.append(name.clone(), value.clone());
        }

        for required in self.operation.required_headers() {
            let present = merged
                .get(required.as_str())
                .and_then(|value| value.to_str().ok())
                .is_some_and(|value| !value.trim().is_empty());
            if !present {
                return Err(ErrorEnvelope::missing_header(required));
            }
        }
        Ok(merged)
    }

    fn count(&self, outcome: &str) {
        if let Some(calls) = &self.calls {
            calls.with_label_values(&[&*self.qualified, outcome]).inc();
        }
    }
}

/// The downstream clients one service operation may use.
///
/// Asking for a downstream operation the service operation did not declare
/// is an [`ErrorEnvelope::Internal`]: it is a defect in the handler, not in
/// the request.
#[derive(Clone)]
pub struct DownstreamClients {
    clients: Arc<HashMap<String, DownstreamClient>>,
    owner: Arc<str>,
}

impl fmt::Debug for DownstreamClients {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownstreamClients")
            .field("owner", &self.owner)
            .field("clients", &self.names())
            .finish()
    }
}

impl DownstreamClients {
    /// The client of `qualified` (`downstream.Operation`).
    ///
    /// # Errors
    ///
    /// [`ErrorEnvelope::Internal`] when the owner did not declare it.
    pub fn get(&self, qualified: &str) -> Result<&DownstreamClient, ErrorEnvelope> {
        self.clients.get(qualified).ok_or_else(|| {
            ErrorEnvelope::internal(format!(
                "operation '{}' did not declare downstream '{}'",
                self.owner, qualified
            ))
        })
    }

    /// Shorthand for `get(qualified)?.call(ctx, request)`.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get) and [`DownstreamClient::call`].
    pub async fn call<Req, Resp>(
        &self,
        ctx: &RequestContext,
        qualified: &str,
        request: &Req,
    ) -> Result<Resp, ErrorEnvelope>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.get(qualified)?.call(ctx, request).await
    }

    /// Shorthand for `get(qualified)?.call_with_headers(ctx, request, headers)`.
    ///
    /// # Errors
    ///
    /// See [`get`](Self::get) and [`DownstreamClient::call`].
    pub async fn call_with_headers<Req, Resp>(
        &self,
        ctx: &RequestContext,
        qualified: &str,
        request: &Req,
        headers: HeaderMap,
    ) -> Result<Resp, ErrorEnvelope>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.get(qualified)?
            .call_with_headers(ctx, request, headers)
            .await
    }

    /// Declared qualified names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.clients.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// One client per declared downstream operation, built once per contract.
#[derive(Debug, Clone, Default)]
pub struct Dispatcher {
    clients: HashMap<String, DownstreamClient>,
}

impl Dispatcher {
    /// Builds a client for every operation, reading each downstream's
    /// settings from `config`.
    pub fn new(
        operations: impl IntoIterator<Item = DownstreamOperation>,
        config: &ServiceConfig,
        transport: Arc<dyn Transport>,
        calls: Option<IntCounterVec>,
    ) -> Self {
        let clients = operations
            .into_iter()
            .map(|operation| {
                let settings = config.downstream(operation.downstream());
                let client = DownstreamClient::new(operation, settings, Arc::clone(&transport))
                    .with_metrics(calls.clone());
                (client.qualified_name().to_string(), client)
            })
            .collect();
        Self { clients }
    }

    /// The client of `qualified`.
    pub fn client(&self, qualified: &str) -> Option<&DownstreamClient> {
        self.clients.get(qualified)
    }

    /// Number of declared downstream operations.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no downstream operation was declared.
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Whether `qualified` was declared.
    pub fn contains(&self, qualified: &str) -> bool {
        self.clients.contains_key(qualified)
    }

    /// The bundle of `owner`, limited to `permitted`. Unknown names are skipped.
    pub fn bundle(&self, owner: &str, permitted: &[String]) -> DownstreamClients {
        let clients = permitted
            .iter()
            .filter_map(|name| {
                self.clients
                    .get(name)
                    .map(|client| (name.clone(), client.clone()))
            })
            .collect();
        DownstreamClients {
            clients: Arc::new(clients),
            owner: owner.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use async_trait::async_trait;
    use http::Method;
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Debug, Default)]
    struct Recorder {
        calls: Mutex<Vec<DownstreamCall>>,
        reply: Mutex<Option<Result<DownstreamReply, TransportError>>>,
    }

    impl Recorder {
        fn answering(reply: Result<DownstreamReply, TransportError>) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                reply: Mutex::new(Some(reply)),
            })
        }
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn send(&self, call: DownstreamCall) -> Result<DownstreamReply, TransportError> {
            self.calls.lock().push(call);
            self.reply
                .lock()
                .clone()
                .unwrap_or_else(|| Err(TransportError::UnexpectedCall("none".into())))
        }
    }

    #[derive(Debug)]
    struct Stalled;

    #[async_trait]
    impl Transport for Stalled {
        async fn send(&self, _call: DownstreamCall) -> Result<DownstreamReply, TransportError> {
            futures::future::pending().await
        }
    }

    fn client(transport: Arc<dyn Transport>, client_timeout: Duration) -> DownstreamClient {
        DownstreamClient::new(
            DownstreamOperation::new("backend", "Echo", Method::POST, "/echo").require_header("y"),
            DownstreamConfig {
                service_url: "http://backend".to_string(),
                client_timeout,
            },
            transport,
        )
    }

    fn with_y() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("y", "1".parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn timeout_is_capped_by_remaining_budget() {
        let recorder = Recorder::answering(Ok(DownstreamReply::new(StatusCode::OK, "{}")));
        let client = client(recorder.clone(), Duration::from_secs(60));
        let ctx = test_context(Duration::from_millis(500));

        let _: Value = client.call_with_headers(&ctx, &json!({}), with_y()).await.unwrap();
        let call = recorder.calls.lock().remove(0);
        assert!(call.timeout <= Duration::from_millis(500));
        assert_eq!(call.url(), "http://backend/echo");
    }

    #[tokio::test]
    async fn missing_required_header_names_it() {
        let recorder = Recorder::answering(Ok(DownstreamReply::new(StatusCode::OK, "{}")));
        let client = client(recorder.clone(), Duration::from_secs(1));
        let ctx = test_context(Duration::from_secs(1));

        let err = client
            .call::<_, Value>(&ctx, &json!({}))
            .await
            .unwrap_err();
        assert!(err.caused_by_header("y"));
        assert!(recorder.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn explicit_headers_replace_ambient_ones() {
        let recorder = Recorder::answering(Ok(DownstreamReply::new(StatusCode::OK, "")));
        let client = client(recorder.clone(), Duration::from_secs(1));
        let ctx = test_context(Duration::from_secs(1));

        let mut explicit = with_y();
        explicit.insert("y", "2".parse().unwrap());
        let _: Value = client.call_with_headers(&ctx, &json!({}), explicit).await.unwrap();
        let call = recorder.calls.lock().remove(0);
        assert_eq!(call.headers.get_all("y").iter().count(), 1);
        assert_eq!(call.headers["y"], "2");
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_transport_times_out_as_downstream() {
        let client = client(Arc::new(Stalled), Duration::from_millis(100));
        let ctx = test_context(Duration::from_secs(5));

        let err = client
            .call_with_headers::<_, Value>(&ctx, &json!({}), with_y())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ErrorEnvelope::Timeout {
                origin: TimeoutSource::Downstream
            }
        ));
    }

    #[tokio::test]
    async fn transport_failures_are_unavailable() {
        let recorder = Recorder::answering(Err(TransportError::Unreachable("refused".into())));
        let client = client(recorder, Duration::from_secs(1));
        let ctx = test_context(Duration::from_secs(1));

        let err = client
            .call_with_headers::<_, Value>(&ctx, &json!({}), with_y())
            .await
            .unwrap_err();
        let downstream = err.as_downstream().unwrap();
        assert_eq!(downstream.kind(), DownstreamErrorKind::Unavailable);
        assert!(std::error::Error::source(downstream).is_some());
    }

    #[tokio::test]
    async fn error_statuses_are_classified() {
        let recorder = Recorder::answering(Ok(DownstreamReply::new(
            StatusCode::UNAUTHORIZED,
            "denied",
        )));
        let client = client(recorder, Duration::from_secs(1));
        let ctx = test_context(Duration::from_secs(1));
        let err = client
            .call_with_headers::<_, Value>(&ctx, &json!({}), with_y())
            .await
            .unwrap_err();
        assert_eq!(err.as_downstream().unwrap().kind(), DownstreamErrorKind::Unauthorized);

        let recorder = Recorder::answering(Ok(DownstreamReply::new(StatusCode::OK, "not json")));
        let client = super::DownstreamClient::new(
            DownstreamOperation::new("backend", "Echo", Method::POST, "/echo"),
            DownstreamConfig::default(),
            recorder,
        );
        let err = client.call::<_, Value>(&ctx, &json!({})).await.unwrap_err();
        assert_eq!(
            err.as_downstream().unwrap().kind(),
            DownstreamErrorKind::UnexpectedResponse
        );
    }

    #[tokio::test]
    async fn bundle_rejects_undeclared_operations() {
        let dispatcher = Dispatcher::new(
            [DownstreamOperation::new("backend", "Echo", Method::POST, "/echo")],
            &ServiceConfig::default(),
            Arc::new(Stalled),
            None,
        );
        assert!(dispatcher.contains("backend.Echo"));

        let bundle = dispatcher.bundle("Ping", &[]);
        let err = bundle.get("backend.Echo").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Internal);

        let bundle = dispatcher.bundle("Ping", &["backend.Echo".to_string()]);
        assert_eq!(bundle.names(), ["backend.Echo"]);
    }
}
