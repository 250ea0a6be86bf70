//! The per-request state machine.
//!
//! ```text
//! arrive -> middleware -> authorize -> decode -> validate request
//!        -> handler (under the request deadline) -> validate response -> encode
//! ```
//!
//! Any stage may fail; the failure goes through the contract's
//! [`ErrorMapper`](crate::ErrorMapper) and no later stage runs.

use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use http::header::HeaderValue;
use http::HeaderMap;
use tokio::time::Instant;

use super::contract::{CompiledOperation, ServiceContract};
use super::operation::Output;
use crate::context::RequestContext;
use crate::errmap::{ErrorScope, JSON_CONTENT_TYPE};
use crate::error::{ErrorEnvelope, TimeoutSource};
use crate::request::{InboundRequest, OutboundResponse};
use crate::validate::ValidationErrors;

/// Header carrying the request identifier in both directions.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

impl ServiceContract {
    /// Runs `operation` for one inbound request. Never fails: every error is
    /// rendered through the error mapper.
    pub async fn invoke(&self, operation: &str, request: InboundRequest) -> OutboundResponse {
        let started = Instant::now();
        let request_id = request_id(&request.headers);
        let _in_flight = self.inner.metrics.enter();

        let outcome = match self.inner.operations.get(operation) {
            Some(compiled) => self.run(compiled, &request_id, request).await,
            None => Err(ErrorEnvelope::unimplemented(operation)),
        };

        let mut response = match outcome {
            Ok(response) => response,
            Err(err) => self.render_error(operation, &request_id, &err),
        };
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers.insert(REQUEST_ID_HEADER, value);
        }

        self.inner
            .metrics
            .record(operation, response.status.as_u16());
        tracing::info!(
            request_id = %request_id,
            operation = %operation,
            status = response.status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );
        response
    }

    async fn run(
        &self,
        compiled: &CompiledOperation,
        request_id: &str,
        request: InboundRequest,
    ) -> Result<OutboundResponse, ErrorEnvelope> {
        let operation = &compiled.operation;
        let deadline = Instant::now() + self.inner.config.upstream.context_timeout;
        let mut ctx = RequestContext::new(
            request_id,
            operation.name(),
            deadline,
            request.headers.clone(),
        );
        for middleware in &self.inner.middleware {
            ctx = middleware(ctx);
        }

        let ctx = match &compiled.gate {
            Some(gate) => gate.admit(ctx).await?,
            None => ctx.admit_anonymous(),
        };

        let payload = request.payload().map_err(ValidationErrors::decode)?;
        self.inner
            .validator
            .validate(&payload, operation.request_rule_set())
            .map_err(|report| {
                ctx.log()
                    .debug(format_args!("request rejected: {}", report));
                report
            })?;

        let Some(handler) = &operation.handler else {
            return Err(ErrorEnvelope::unimplemented(operation.name()));
        };
        ctx.log().debug(format_args!(
            "invoking handler with {} ms left",
            ctx.remaining().as_millis()
        ));
        let clients = compiled.clients.clone();
        let handler_ctx = ctx.clone();
        let pending = AssertUnwindSafe(async move { handler(handler_ctx, payload, clients).await })
            .catch_unwind();
        let output = match tokio::time::timeout_at(ctx.deadline(), pending).await {
            Err(_) => return Err(ErrorEnvelope::timeout(TimeoutSource::Request)),
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                ctx.log()
                    .error(format_args!("handler panicked: {}", message));
                return Err(ErrorEnvelope::internal(format!(
                    "handler panicked: {}",
                    message
                )));
            }
            Ok(Ok(result)) => result?,
        };

        match output {
            Output::Json(value) => {
                let report = self
                    .inner
                    .validator
                    .validate_response(&value, operation.response_rule_set());
                if !report.fatal.is_empty() {
                    let violations = ValidationErrors::new(report.fatal);
                    ctx.log()
                        .error(format_args!("response violates its rules: {}", violations));
                    return Err(ErrorEnvelope::internal(format!(
                        "response violates its rules: {}",
                        violations
                    )));
                }
                if !report.ignored.is_empty() {
                    ctx.log().warn(format_args!(
                        "response passes with {} ignored violations: {}",
                        report.ignored.len(),
                        ValidationErrors::new(report.ignored)
                    ));
                }
                Ok(OutboundResponse::new(
                    operation.status_on_success(),
                    JSON_CONTENT_TYPE,
                    value.to_string(),
                ))
            }
            Output::Raw(raw) => Ok(OutboundResponse::new(
                operation.status_on_success(),
                &raw.content_type,
                raw.body,
            )),
        }
    }

    fn render_error(&self, operation: &str, request_id: &str, err: &ErrorEnvelope) -> OutboundResponse {
        let mapped = self.inner.mapper.map(
            err,
            &ErrorScope {
                operation,
                request_id,
            },
        );
        if mapped.status.is_server_error() {
            tracing::error!(
                request_id = %request_id,
                operation = %operation,
                kind = %err.kind(),
                status = mapped.status.as_u16(),
                error = %err,
                "request failed"
            );
        } else {
            tracing::warn!(
                request_id = %request_id,
                operation = %operation,
                kind = %err.kind(),
                status = mapped.status.as_u16(),
                error = %err,
                "request rejected"
            );
        }
        OutboundResponse::new(mapped.status, JSON_CONTENT_TYPE, mapped.to_bytes())
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::service::Operation;
    use crate::settings::ServiceConfig;
    use crate::validate::RuleSet;
    use http::{Method, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    fn contract(op: Operation, timeout: Duration) -> ServiceContract {
        let mut config = ServiceConfig::default();
        config.upstream.context_timeout = timeout;
        ServiceContract::builder("svc")
            .config(config)
            .transport(Arc::new(MockTransport::new()))
            .operation(op)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn request_id_is_echoed_or_generated() {
        let contract = contract(
            Operation::new("Ping", Method::GET, "/ping")
                .handler(|_ctx: RequestContext, _req: Value| async { Ok(json!({})) }),
            Duration::from_secs(1),
        );
        let response = contract
            .invoke("Ping", InboundRequest::default().with_header("x-request-id", "abc"))
            .await;
        assert_eq!(response.headers[REQUEST_ID_HEADER], "abc");

        let response = contract.invoke("Ping", InboundRequest::default()).await;
        assert_eq!(
            response.headers[REQUEST_ID_HEADER].to_str().unwrap().len(),
            36
        );
        assert_eq!(contract.metrics().requests("Ping", 200), 2);
    }

    #[tokio::test]
    async fn malformed_body_is_a_validation_failure() {
        let contract = contract(
            Operation::new("Ping", Method::POST, "/ping")
                .handler(|_ctx: RequestContext, _req: Value| async { Ok(json!({})) }),
            Duration::from_secs(1),
        );
        let response = contract.invoke("Ping", InboundRequest::new("{nope")).await;
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.content_type(), Some(JSON_CONTENT_TYPE));
    }

    #[tokio::test]
    async fn unknown_and_unimplemented_operations_are_501() {
        let contract = contract(
            Operation::new("Ping", Method::GET, "/ping"),
            Duration::from_secs(1),
        );
        assert_eq!(
            contract.invoke("Ping", InboundRequest::default()).await.status,
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            contract.invoke("Pong", InboundRequest::default()).await.status,
            StatusCode::NOT_IMPLEMENTED
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_hits_request_deadline() {
        let contract = contract(
            Operation::new("Slow", Method::POST, "/slow").handler(
                |_ctx: RequestContext, _req: Value| async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(json!({}))
                },
            ),
            Duration::from_millis(200),
        );
        let response = contract.invoke("Slow", InboundRequest::default()).await;
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = response.json().unwrap();
        assert_eq!(body["status"]["code"], "1006");
    }

    #[tokio::test]
    async fn ignorable_response_violations_pass_through() {
        let strict = RuleSet::new().field("identifier", "max=10").unwrap();
        let lenient = strict.clone().ignorable();
        let echo = |rules: RuleSet| {
            Operation::new("Echo", Method::POST, "/echo")
                .response_rules(rules)
                .handler(|_ctx: RequestContext, req: Value| async move { Ok(req) })
        };

        let response = contract(echo(strict), Duration::from_secs(1))
            .invoke("Echo", InboundRequest::json(&json!({"identifier": 20})))
            .await;
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);

        let response = contract(echo(lenient), Duration::from_secs(1))
            .invoke("Echo", InboundRequest::json(&json!({"identifier": 20})))
            .await;
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.json::<Value>().unwrap()["identifier"], 20);
    }

    #[tokio::test]
    async fn panicking_handler_is_an_internal_error() {
        let contract = contract(
            Operation::new("Boom", Method::POST, "/boom").handler(
                |_ctx: RequestContext, req: Value| async move {
                    if req.get("boom").is_some() {
                        panic!("handler bug");
                    }
                    Ok(req)
                },
            ),
            Duration::from_secs(1),
        );
        let response = contract
            .invoke("Boom", InboundRequest::json(&json!({"boom": true})))
            .await;
        assert_eq!(response.status, StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = response.json().unwrap();
        assert_eq!(body["status"]["code"], "9998");
        assert_eq!(contract.metrics().requests("Boom", 500), 1);

        let response = contract
            .invoke("Boom", InboundRequest::json(&json!({"calm": true})))
            .await;
        assert_eq!(response.status, StatusCode::OK);
    }

    #[test]
    fn panic_payloads_become_messages() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let fixed: Box<dyn Any + Send> = Box::new("fixed");
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(fixed.as_ref()), "fixed");
        assert_eq!(panic_message(other.as_ref()), "non-string panic payload");
    }

    #[tokio::test]
    async fn raw_handlers_keep_their_content_type() {
        let contract = contract(
            Operation::new("Text", Method::GET, "/text").raw_handler(
                |_ctx: RequestContext, _req: Value, _clients| async {
                    Ok(crate::service::RawResponse::text("hello"))
                },
            ),
            Duration::from_secs(1),
        );
        let response = contract.invoke("Text", InboundRequest::default()).await;
        assert_eq!(response.text(), "hello");
        assert_eq!(response.content_type(), Some("text/plain; charset=utf-8"));
    }
}
