use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use pretty_assertions::StrComparison;
use serde_json::Value;

use crate::downstream::{DownstreamCall, DownstreamReply, TransportError};

/// How a queue picks the expectation that answers a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// Only the head may answer. A head that does not match is consumed and
    /// the call fails with a diff.
    #[default]
    Fifo,
    /// The first expectation whose matchers accept the call answers; order
    /// only breaks ties. For concurrent calls that race on one operation.
    MatcherFirst,
}

/// What an expectation does once it accepts a call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Answer with a reply.
    Respond(DownstreamReply),
    /// Fail at the transport level.
    Fail(TransportError),
    /// Never answer; the caller's deadline expires first.
    Timeout,
}

pub(crate) type BodyPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Matcher {
    Body(Value),
    BodyWith(String, BodyPredicate),
    Header(String, String),
    Query(String, String),
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Body(body) => write!(f, "body == {}", body),
            Self::BodyWith(description, _) => write!(f, "body satisfies {}", description),
            Self::Header(name, value) => write!(f, "header {} == {:?}", name, value),
            Self::Query(name, value) => write!(f, "query {} == {:?}", name, value),
        }
    }
}

impl Matcher {
    /// `Err` carries a human-readable explanation of the mismatch.
    fn check(&self, call: &DownstreamCall) -> Result<(), String> {
        match self {
            Self::Body(expected) => {
                let actual = call.body.clone().unwrap_or(Value::Null);
                if &actual == expected {
                    return Ok(());
                }
                let expected = pretty(expected);
                let actual = pretty(&actual);
                Err(format!(
                    "body differs (< expected / > actual):\n{}",
                    StrComparison::new(&expected, &actual)
                ))
            }
            Self::BodyWith(description, predicate) => {
                let actual = call.body.clone().unwrap_or(Value::Null);
                if predicate(&actual) {
                    Ok(())
                } else {
                    Err(format!("body {} does not satisfy {}", actual, description))
                }
            }
            Self::Header(name, expected) => {
                let actual = call.headers.get(name.as_str()).and_then(|v| v.to_str().ok());
                if actual == Some(expected.as_str()) {
                    Ok(())
                } else {
                    Err(format!(
                        "header {}: expected {:?}, got {:?}",
                        name, expected, actual
                    ))
                }
            }
            Self::Query(name, expected) => {
                let actual = call.query_param(name);
                if actual == Some(expected.as_str()) {
                    Ok(())
                } else {
                    Err(format!(
                        "query {}: expected {:?}, got {:?}",
                        name, expected, actual
                    ))
                }
            }
        }
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// One canned answer for a downstream operation.
#[derive(Debug, Clone)]
pub(crate) struct Expectation {
    pub(crate) matchers: Vec<Matcher>,
    pub(crate) outcome: MockOutcome,
    pub(crate) single_use: bool,
}

impl Expectation {
    fn check(&self, call: &DownstreamCall) -> Result<(), String> {
        let misses: Vec<String> = self
            .matchers
            .iter()
            .filter_map(|matcher| matcher.check(call).err())
            .collect();
        if misses.is_empty() {
            Ok(())
        } else {
            Err(misses.join("\n"))
        }
    }
}

/// Expectations of one downstream operation, in registration order.
#[derive(Debug, Default)]
pub(crate) struct ExpectationQueue {
    entries: VecDeque<Expectation>,
}

impl ExpectationQueue {
    pub(crate) fn push(&mut self, expectation: Expectation) {
        self.entries.push_back(expectation);
    }

    /// Single-use expectations not yet consumed.
    pub(crate) fn pending(&self) -> usize {
        self.entries.iter().filter(|e| e.single_use).count()
    }

    /// Picks the expectation answering `call`.
    ///
    /// An empty queue is always an error; there is no fallback reply.
    pub(crate) fn take(
        &mut self,
        call: &DownstreamCall,
        policy: SelectionPolicy,
    ) -> Result<MockOutcome, String> {
        if self.entries.is_empty() {
            return Err(format!("no expectation left for {}", call.operation));
        }
        let index = match policy {
            SelectionPolicy::Fifo => match self.entries[0].check(call) {
                Ok(()) => 0,
                Err(diff) => {
                    self.entries.pop_front();
                    return Err(format!(
                        "call to {} does not match the next expectation:\n{}",
                        call.operation, diff
                    ));
                }
            },
            SelectionPolicy::MatcherFirst => {
                match self.entries.iter().position(|e| e.check(call).is_ok()) {
                    Some(index) => index,
                    None => {
                        let diff = self.entries[0].check(call).err().unwrap_or_default();
                        return Err(format!(
                            "call to {} matches none of {} expectations; against the first:\n{}",
                            call.operation,
                            self.entries.len(),
                            diff
                        ));
                    }
                }
            }
        };

        let outcome = self.entries[index].outcome.clone();
        if self.entries[index].single_use {
            self.entries.remove(index);
        }
        Ok(outcome)
    }
}
