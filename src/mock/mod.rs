//! Test harness: canned downstream answers and a front door for calls.
//!
//! [`MockTransport`] replaces the downstream transport with one expectation
//! queue per qualified operation. [`TestServer`] builds a service around it
//! and drives the pipeline through [`CallBuilder`], either directly (unit
//! mode) or through the in-memory HTTP router (integration mode).
//!
//! Queues are consumed in registration order by default. A call with no
//! acceptable expectation is a failure, never a fallback reply.

mod expect;
mod server;
mod transport;

pub use expect::{MockOutcome, SelectionPolicy};
pub use server::{CallBuilder, TestServer};
pub use transport::{MockEndpoint, MockTransport};
