//! Contract-driven service runtime.
//!
//! A service is described once, at startup, as a [`ServiceContract`]: its
//! operations with their validation rules and authorization expressions,
//! the downstream operations each may call, and the hooks of the embedding
//! application. Every inbound request then runs the same pipeline:
//!
//! ```text
//! arrive -> middleware -> authorize -> decode -> validate -> handler -> validate response -> encode
//! ```
//!
//! # Core Types
//!
//! - [`ServiceContract`]: the immutable, startup-built service description
//! - [`Operation`]: one endpoint with its rules, gate and handler
//! - [`RequestContext<S>`]: per-request deadline, headers and claims, with
//!   the authorization state tracked in the type
//! - [`DownstreamClients`]: the downstream calls a handler may issue
//! - [`ErrorEnvelope`]: the error taxonomy, rendered by [`ErrorMapper`]
//! - [`mock::TestServer`]: drives a contract with canned downstream answers
//!
//! # Examples
//!
//! ```
//! use http::Method;
//! use serde_json::{json, Value};
//! use service_core::mock::TestServer;
//! use service_core::{
//!     DownstreamClients, DownstreamOperation, ErrorEnvelope, Operation, RequestContext,
//!     RuleSet, ServiceContract,
//! };
//!
//! fn encoder() -> service_core::ServiceContractBuilder {
//!     ServiceContract::builder("gateway")
//!         .downstream(DownstreamOperation::new("encoder", "Encode", Method::POST, "/encode"))
//!         .operation(
//!             Operation::new("Encode", Method::POST, "/encode")
//!                 .request_rules(RuleSet::new().field("content", "required").unwrap())
//!                 .downstream("encoder.Encode")
//!                 .handler_with_clients(
//!                     |ctx: RequestContext, req: Value, clients: DownstreamClients| async move {
//!                         let reply: Value = clients.call(&ctx, "encoder.Encode", &req).await?;
//!                         Ok::<_, ErrorEnvelope>(reply)
//!                     },
//!                 ),
//!         )
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let server = TestServer::unit(encoder, None).unwrap();
//! server.mock("encoder.Encode").respond(json!({"content": "uryyb"}));
//! server
//!     .call("Encode")
//!     .with_body(json!({"content": "hello"}))
//!     .expect_body(json!({"content": "uryyb"}))
//!     .send()
//!     .await;
//! server.close();
//! # });
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
mod context;
pub mod downstream;
mod errmap;
mod error;
mod health;
mod logging;
pub mod mock;
mod request;
mod secret;
mod service;
pub mod settings;
pub mod sink;
mod state;
mod status;
pub mod validate;
pub mod web;

pub use auth::{
    bearer_token, unsigned_token, AuthGate, Authenticator, Claims, InsecureJwtAuthenticator,
    StaticTokenAuthenticator,
};
pub use context::RequestContext;
pub use downstream::{
    Dispatcher, DownstreamClient, DownstreamClients, DownstreamOperation, HttpTransport,
    Transport, TransportError,
};
pub use errmap::{ErrorMapper, ErrorScope, HttpError, JSON_CONTENT_TYPE};
pub use error::{
    BuildError, CustomError, DownstreamError, DownstreamErrorKind, ErrorEnvelope, ErrorKind,
    TimeoutSource,
};
pub use health::{HealthRegistry, ServingStatus};
pub use logging::ContextLog;
pub use request::{InboundRequest, OutboundResponse};
pub use secret::Secret;
pub use service::{
    Operation, RawResponse, ServiceContract, ServiceContractBuilder, ServiceMetrics,
    REQUEST_ID_HEADER,
};
pub use settings::{ConfigError, ConfigLoader, ServiceConfig};
pub use sink::{LogShipper, SinkError, SinkErrorKind};
pub use state::{Authed, Authorized, ContextState, Unauthed};
pub use status::BuildMetadata;
pub use validate::{RuleSet, ValidationErrors, Validator};
