//! HTTP listeners for a [`ServiceContract`](crate::ServiceContract).
//!
//! The pipeline itself is transport agnostic; this module binds it to axum.
//! [`router`] maps every declared operation to its route under the
//! configured base path, and [`admin_router`] serves `/status`, `/metrics`
//! and `/health` on the admin port.
//!
//! Transport-level layers (compression, CORS, request body limits) are
//! added by the caller on the returned router:
//!
//! ```ignore
//! let app = service_core::web::router(&contract)
//!     .layer(tower_http::limit::RequestBodyLimitLayer::new(1 << 20));
//! ```

mod admin;
mod router;

pub use admin::{admin_router, serve_admin};
pub use router::{route_path, router, serve};

use axum::body::Body;
use axum::response::Response;

use crate::request::OutboundResponse;

pub(crate) fn into_response(outbound: OutboundResponse) -> Response {
    let mut response = Response::new(Body::from(outbound.body));
    *response.status_mut() = outbound.status;
    *response.headers_mut() = outbound.headers;
    response
}
