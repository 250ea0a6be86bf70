use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, StatusCode};
use parking_lot::Mutex;
use serde_json::Value;

use super::expect::{Expectation, ExpectationQueue, Matcher, MockOutcome, SelectionPolicy};
use crate::downstream::{DownstreamCall, DownstreamReply, Transport, TransportError};
use crate::errmap::JSON_CONTENT_TYPE;

#[derive(Debug, Default)]
struct MockState {
    queues: HashMap<String, ExpectationQueue>,
    received: Vec<DownstreamCall>,
    failures: Vec<String>,
    policy: SelectionPolicy,
}

/// A [`Transport`] answering from per-operation expectation queues.
///
/// Queues are keyed by qualified operation name (`downstream.Operation`).
/// A call that finds no acceptable expectation fails with
/// [`TransportError::UnexpectedCall`] and is recorded as a failure, so the
/// test fails at teardown even when the service swallowed the error.
///
/// ```
/// use serde_json::json;
/// use service_core::mock::MockTransport;
///
/// let mock = MockTransport::new();
/// mock.endpoint("encoder.Encode")
///     .expect_body(json!({"content": "hello"}))
///     .respond(json!({"content": "uryyb"}));
/// assert_eq!(mock.pending("encoder.Encode"), 1);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// A transport with no expectations and [`SelectionPolicy::Fifo`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Changes how queues pick the answering expectation.
    pub fn set_policy(&self, policy: SelectionPolicy) {
        self.state.lock().policy = policy;
    }

    /// Starts an expectation for `operation`; it is registered by the
    /// terminal call ([`respond`](MockEndpoint::respond) and friends).
    pub fn endpoint(&self, operation: impl Into<String>) -> MockEndpoint {
        MockEndpoint {
            transport: self.clone(),
            operation: operation.into(),
            matchers: Vec::new(),
            single_use: true,
        }
    }

    /// Single-use expectations of `operation` not yet consumed.
    pub fn pending(&self, operation: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(operation)
            .map_or(0, ExpectationQueue::pending)
    }

    /// Unconsumed single-use expectations per operation, sorted by name.
    pub fn unconsumed(&self) -> Vec<(String, usize)> {
        let state = self.state.lock();
        let mut left: Vec<(String, usize)> = state
            .queues
            .iter()
            .map(|(name, queue)| (name.clone(), queue.pending()))
            .filter(|(_, count)| *count > 0)
            .collect();
        left.sort();
        left
    }

    /// Calls received for `operation`, in arrival order.
    pub fn received(&self, operation: &str) -> Vec<DownstreamCall> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|call| call.operation == operation)
            .cloned()
            .collect()
    }

    /// Mismatches and unexpected calls seen so far.
    pub fn failures(&self) -> Vec<String> {
        self.state.lock().failures.clone()
    }

    fn register(&self, operation: String, expectation: Expectation) {
        self.state
            .lock()
            .queues
            .entry(operation)
            .or_default()
            .push(expectation);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, call: DownstreamCall) -> Result<DownstreamReply, TransportError> {
        let picked = {
            let mut state = self.state.lock();
            let policy = state.policy;
            state.received.push(call.clone());
            let picked = match state.queues.get_mut(&call.operation) {
                Some(queue) => queue.take(&call, policy),
                None => Err(format!("no expectation registered for {}", call.operation)),
            };
            if let Err(failure) = &picked {
                state.failures.push(failure.clone());
            }
            picked
        };

        match picked {
            Ok(MockOutcome::Respond(reply)) => Ok(reply),
            Ok(MockOutcome::Fail(err)) => Err(err),
            Ok(MockOutcome::Timeout) => {
                tokio::time::sleep(call.timeout + Duration::from_millis(1)).await;
                Err(TransportError::DeadlineExceeded)
            }
            Err(failure) => {
                tracing::error!(operation = %call.operation, "{}", failure);
                Err(TransportError::UnexpectedCall(failure))
            }
        }
    }
}

/// Fluent registration of one expectation.
///
/// Matchers accumulate; the expectation accepts a call only when all of
/// them do. Nothing is registered until a terminal method runs.
#[must_use = "an expectation is registered only by respond, fail or time_out"]
#[derive(Debug)]
pub struct MockEndpoint {
    transport: MockTransport,
    operation: String,
    matchers: Vec<Matcher>,
    single_use: bool,
}

impl MockEndpoint {
    /// The request body must equal `body`.
    pub fn expect_body(mut self, body: Value) -> Self {
        self.matchers.push(Matcher::Body(body));
        self
    }

    /// The request body must satisfy `predicate`, described by `description`
    /// in failure reports.
    pub fn expect_body_with<F>(mut self, description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.matchers
            .push(Matcher::BodyWith(description.into(), Arc::new(predicate)));
        self
    }

    /// Header `name` must equal `value`.
    pub fn expect_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.matchers
            .push(Matcher::Header(name.into().to_ascii_lowercase(), value.into()));
        self
    }

    /// Query parameter `name` must equal `value`.
    pub fn expect_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.matchers.push(Matcher::Query(name.into(), value.into()));
        self
    }

    /// Keeps the expectation after it answers. It is never reported as
    /// unconsumed.
    pub fn repeatable(mut self) -> Self {
        self.single_use = false;
        self
    }

    /// Answers `200 OK` with `body` as JSON.
    pub fn respond(self, body: Value) -> MockTransport {
        self.respond_with(StatusCode::OK, body)
    }

    /// Answers `status` with `body` as JSON.
    pub fn respond_with(self, status: StatusCode, body: Value) -> MockTransport {
        let mut reply = DownstreamReply::new(status, body.to_string());
        reply
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        self.finish(MockOutcome::Respond(reply))
    }

    /// Answers `status` with a raw body.
    pub fn respond_raw(self, status: StatusCode, body: impl Into<bytes::Bytes>) -> MockTransport {
        self.finish(MockOutcome::Respond(DownstreamReply::new(status, body)))
    }

    /// Fails the call at the transport level.
    pub fn fail(self, err: TransportError) -> MockTransport {
        self.finish(MockOutcome::Fail(err))
    }

    /// Never answers, so the caller observes its own deadline.
    pub fn time_out(self) -> MockTransport {
        self.finish(MockOutcome::Timeout)
    }

    fn finish(self, outcome: MockOutcome) -> MockTransport {
        let Self {
            transport,
            operation,
            matchers,
            single_use,
        } = self;
        transport.register(
            operation,
            Expectation {
                matchers,
                outcome,
                single_use,
            },
        );
        transport
    }
}
