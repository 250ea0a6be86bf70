//! Service contracts and the request pipeline.
//!
//! A [`ServiceContract`] is assembled once at startup from [`Operation`]s,
//! downstream declarations, configuration and hooks. Everything that can
//! be checked before the first request (rule syntax, authorization
//! expressions, downstream references) is checked by
//! [`ServiceContractBuilder::build`].

mod contract;
mod metrics;
mod operation;
mod pipeline;

pub use contract::{ServiceContract, ServiceContractBuilder};
pub use metrics::ServiceMetrics;
pub use operation::{Operation, RawResponse};
pub use pipeline::REQUEST_ID_HEADER;
