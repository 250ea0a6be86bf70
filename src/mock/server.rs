use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;

use axum::body::Body;
use axum::Router;
use bytes::Bytes;
use http::{Request, StatusCode};
use serde_json::Value;
use tower::ServiceExt;

use super::expect::SelectionPolicy;
use super::transport::{MockEndpoint, MockTransport};
use crate::error::BuildError;
use crate::request::{InboundRequest, OutboundResponse};
use crate::service::{ServiceContract, ServiceContractBuilder};
use crate::settings::ServiceConfig;
use crate::web;

enum Mode {
    Unit,
    Integration(Router),
}

/// A service under test with its downstream calls answered by a
/// [`MockTransport`].
///
/// In unit mode, calls go straight into the request pipeline. In
/// integration mode, they are framed as HTTP requests and served by
/// [`web::router`] in memory, so routing and parameter merging are
/// exercised too.
///
/// On drop, the server fails the test when a downstream call found no
/// acceptable expectation or, when strict (the default), when single-use
/// expectations were left unconsumed. Call [`close`](Self::close) to check
/// at a chosen point.
///
/// ```no_run
/// # async fn demo(build: fn() -> service_core::ServiceContractBuilder) {
/// use http::StatusCode;
/// use serde_json::json;
/// use service_core::mock::TestServer;
///
/// let server = TestServer::unit(build, None).unwrap();
/// server.mock("encoder.Encode").respond(json!({"content": "uryyb"}));
/// server
///     .call("Encode")
///     .with_body(json!({"content": "hello", "encoderId": "rot13"}))
///     .expect_status(StatusCode::OK)
///     .send()
///     .await;
/// server.close();
/// # }
/// ```
pub struct TestServer {
    contract: ServiceContract,
    mock: MockTransport,
    mode: Mode,
    strict: bool,
    closed: bool,
}

impl std::fmt::Debug for TestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestServer")
            .field("contract", &self.contract)
            .field("integration", &matches!(self.mode, Mode::Integration(_)))
            .field("strict", &self.strict)
            .finish()
    }
}

impl TestServer {
    /// Builds the service returned by `construct`, replacing its transport
    /// with a mock and, when `overlay` is given, its configuration with the
    /// YAML document `overlay`.
    ///
    /// # Errors
    ///
    /// Any [`BuildError`] of the contract, or an unreadable overlay.
    pub fn unit<F>(construct: F, overlay: Option<&str>) -> Result<Self, BuildError>
    where
        F: FnOnce() -> ServiceContractBuilder,
    {
        Self::start(construct, overlay, false)
    }

    /// Like [`unit`](Self::unit), with requests going through the HTTP router.
    ///
    /// # Errors
    ///
    /// Any [`BuildError`] of the contract, or an unreadable overlay.
    pub fn integration<F>(construct: F, overlay: Option<&str>) -> Result<Self, BuildError>
    where
        F: FnOnce() -> ServiceContractBuilder,
    {
        Self::start(construct, overlay, true)
    }

    fn start<F>(construct: F, overlay: Option<&str>, integration: bool) -> Result<Self, BuildError>
    where
        F: FnOnce() -> ServiceContractBuilder,
    {
        let mock = MockTransport::new();
        let mut builder = construct().transport(Arc::new(mock.clone()));
        if let Some(text) = overlay {
            builder = builder.config(ServiceConfig::from_yaml(text)?);
        }
        let contract = builder.build()?;
        let mode = if integration {
            Mode::Integration(web::router(&contract))
        } else {
            Mode::Unit
        };
        tracing::debug!(service = %contract.name(), integration, "test server started");
        Ok(Self {
            contract,
            mock,
            mode,
            strict: true,
            closed: false,
        })
    }

    /// Whether unconsumed expectations fail the test; `true` by default.
    pub fn strictness(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// How expectation queues pick the answering expectation.
    pub fn selection(self, policy: SelectionPolicy) -> Self {
        self.mock.set_policy(policy);
        self
    }

    /// The contract under test.
    pub fn contract(&self) -> &ServiceContract {
        &self.contract
    }

    /// The mock transport, for inspecting received calls.
    pub fn transport(&self) -> &MockTransport {
        &self.mock
    }

    /// Starts an expectation on downstream operation `qualified`.
    pub fn mock(&self, qualified: &str) -> MockEndpoint {
        self.mock.endpoint(qualified)
    }

    /// Single-use expectations of `qualified` not yet consumed.
    pub fn pending(&self, qualified: &str) -> usize {
        self.mock.pending(qualified)
    }

    /// Starts a call to `operation`.
    pub fn call(&self, operation: &str) -> CallBuilder<'_> {
        CallBuilder {
            server: self,
            operation: operation.to_string(),
            request: InboundRequest::default(),
            expected_status: None,
            expected_body: None,
        }
    }

    /// What would fail the test at teardown, if anything.
    pub fn verify(&self) -> Result<(), String> {
        let mut report = String::new();
        for failure in self.mock.failures() {
            let _ = writeln!(report, "- {}", failure);
        }
        if self.strict {
            for (operation, count) in self.mock.unconsumed() {
                let _ = writeln!(report, "- {} expectation(s) of {} not consumed", count, operation);
            }
        }
        if report.is_empty() {
            Ok(())
        } else {
            Err(report)
        }
    }

    /// Checks expectations now instead of at drop.
    ///
    /// # Panics
    ///
    /// When [`verify`](Self::verify) reports a failure.
    pub fn close(mut self) {
        self.closed = true;
        if let Err(report) = self.verify() {
            panic!("mock expectations failed for {}:\n{}", self.contract.name(), report);
        }
    }

    async fn dispatch(&self, operation: &str, request: InboundRequest) -> OutboundResponse {
        match &self.mode {
            Mode::Unit => self.contract.invoke(operation, request).await,
            Mode::Integration(router) => {
                let http_request = self.frame(operation, request);
                let response = match router.clone().oneshot(http_request).await {
                    Ok(response) => response,
                    Err(never) => match never {},
                };
                let (parts, body) = response.into_parts();
                let body = match axum::body::to_bytes(body, usize::MAX).await {
                    Ok(bytes) => bytes,
                    Err(err) => panic!("reading response of {}: {}", operation, err),
                };
                OutboundResponse {
                    status: parts.status,
                    headers: parts.headers,
                    body,
                }
            }
        }
    }

    fn frame(&self, operation: &str, request: InboundRequest) -> Request<Body> {
        let Some(declared) = self.contract.operation(operation) else {
            panic!("{} is not an operation of {}", operation, self.contract.name());
        };
        let path = fill_path(declared.path(), &request.path_params);
        let route = web::route_path(&self.contract.config().upstream.http.base_path, &path);

        let mut url = match reqwest::Url::parse("http://test.invalid") {
            Ok(url) => url,
            Err(err) => panic!("base url: {}", err),
        };
        url.set_path(&route);
        if !request.query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (name, value) in &request.query {
                pairs.append_pair(name, value);
            }
        }
        let uri = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        let mut http_request = Request::new(Body::from(request.body));
        *http_request.method_mut() = declared.method().clone();
        *http_request.headers_mut() = request.headers;
        match uri.parse() {
            Ok(uri) => *http_request.uri_mut() = uri,
            Err(err) => panic!("request uri {}: {}", uri, err),
        }
        http_request
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if self.closed || std::thread::panicking() {
            return;
        }
        if let Err(report) = self.verify() {
            panic!("mock expectations failed for {}:\n{}", self.contract.name(), report);
        }
    }
}

fn fill_path(template: &str, params: &HashMap<String, String>) -> String {
    template
        .split('/')
        .map(|segment| {
            segment
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
                .and_then(|name| params.get(name))
                .map_or(segment, String::as_str)
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// One call to the service under test, with optional assertions on the
/// answer.
#[must_use = "a call does nothing until sent"]
#[derive(Debug)]
pub struct CallBuilder<'a> {
    server: &'a TestServer,
    operation: String,
    request: InboundRequest,
    expected_status: Option<StatusCode>,
    expected_body: Option<Value>,
}

impl CallBuilder<'_> {
    /// Sends `body` as JSON.
    pub fn with_body(mut self, body: Value) -> Self {
        self.request.body = Bytes::from(body.to_string());
        self
    }

    /// Sends `body` as is.
    pub fn with_raw_body(mut self, body: impl Into<Bytes>) -> Self {
        self.request.body = body.into();
        self
    }

    /// Adds a header.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.request = self.request.with_header(name, value);
        self
    }

    /// Fills path parameter `{name}`.
    pub fn with_path_param(mut self, name: &str, value: &str) -> Self {
        self.request = self.request.with_path_param(name, value);
        self
    }

    /// Adds a query parameter.
    pub fn with_query(mut self, name: &str, value: &str) -> Self {
        self.request = self.request.with_query(name, value);
        self
    }

    /// Asserts the response status.
    pub fn expect_status(mut self, status: StatusCode) -> Self {
        self.expected_status = Some(status);
        self
    }

    /// Asserts the response body, compared as JSON.
    pub fn expect_body(mut self, body: Value) -> Self {
        self.expected_body = Some(body);
        self
    }

    /// Sends the call and checks the assertions.
    ///
    /// # Panics
    ///
    /// When an assertion does not hold.
    pub async fn send(self) -> OutboundResponse {
        let response = self.server.dispatch(&self.operation, self.request).await;
        if let Some(status) = self.expected_status {
            pretty_assertions::assert_eq!(
                response.status,
                status,
                "status of {}: body {}",
                self.operation,
                response.text()
            );
        }
        if let Some(expected) = self.expected_body {
            let actual: Value = match response.json() {
                Ok(value) => value,
                Err(err) => panic!(
                    "body of {} is not JSON ({}): {}",
                    self.operation,
                    err,
                    response.text()
                ),
            };
            pretty_assertions::assert_eq!(actual, expected, "body of {}", self.operation);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::downstream::{DownstreamClients, DownstreamOperation};
    use crate::error::ErrorEnvelope;
    use crate::service::Operation;
    use http::Method;
    use serde_json::json;

    fn lookup() -> ServiceContractBuilder {
        ServiceContract::builder("lookup")
            .downstream(DownstreamOperation::new("store", "Get", Method::GET, "/items/{id}"))
            .operation(
                Operation::new("Find", Method::GET, "/find/{id}")
                    .downstream("store.Get")
                    .handler_with_clients(
                        |ctx: RequestContext, req: Value, clients: DownstreamClients| async move {
                            let found: Value = clients.call(&ctx, "store.Get", &req).await?;
                            Ok::<_, ErrorEnvelope>(found)
                        },
                    ),
            )
    }

    #[test]
    fn path_templates_are_filled() {
        let params = HashMap::from([("id".to_string(), "7".to_string())]);
        assert_eq!(fill_path("/items/{id}/tags", &params), "/items/7/tags");
        assert_eq!(fill_path("/items/{other}", &params), "/items/{other}");
    }

    #[tokio::test]
    async fn integration_mode_routes_through_http() {
        let server = TestServer::integration(lookup, Some("upstream:\n  http:\n    base_path: /v1\n"))
            .unwrap();
        server
            .mock("store.Get")
            .expect_query("verbose", "true")
            .respond(json!({"name": "chair"}));
        server
            .call("Find")
            .with_path_param("id", "42")
            .with_query("verbose", "true")
            .expect_status(StatusCode::OK)
            .expect_body(json!({"name": "chair"}))
            .send()
            .await;
        let received = server.transport().received("store.Get");
        assert_eq!(received[0].path, "/items/42");
        server.close();
    }

    #[tokio::test]
    async fn lenient_servers_tolerate_leftovers() {
        let server = TestServer::unit(lookup, None).unwrap().strictness(false);
        server.mock("store.Get").respond(json!({}));
        assert!(server.verify().is_ok());
        assert_eq!(server.pending("store.Get"), 1);
    }

    #[tokio::test]
    async fn strict_servers_report_leftovers() {
        let server = TestServer::unit(lookup, None).unwrap();
        server.mock("store.Get").respond(json!({}));
        let report = server.verify().unwrap_err();
        assert!(report.contains("store.Get"));
        drop(server.strictness(false));
    }

    #[tokio::test]
    #[should_panic(expected = "no expectation registered for store.Get")]
    async fn unexpected_calls_fail_at_close() {
        let server = TestServer::unit(lookup, None).unwrap();
        server
            .call("Find")
            .with_path_param("id", "1")
            .expect_status(StatusCode::SERVICE_UNAVAILABLE)
            .send()
            .await;
        server.close();
    }
}
