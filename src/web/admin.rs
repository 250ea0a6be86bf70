use std::collections::HashMap;
use std::future::Future;

use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use http::header::CONTENT_TYPE;
use http::StatusCode;
use serde_json::json;
use tokio::net::TcpListener;

use crate::health::ServingStatus;
use crate::service::ServiceContract;

/// The admin router: `/status`, `/metrics` and `/health?service=<name>`.
///
/// `/health` without a `service` parameter checks the whole process.
/// `NOT_SERVING` answers `503` and an unknown service name `404`.
pub fn admin_router(contract: &ServiceContract) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(contract.clone())
}

async fn status(State(contract): State<ServiceContract>) -> Json<serde_json::Value> {
    Json(json!({
        "service": contract.name(),
        "build": contract.build_metadata(),
        "operations": contract.operation_names(),
    }))
}

async fn metrics(State(contract): State<ServiceContract>) -> Response {
    match contract.metrics().render() {
        Ok((content_type, body)) => ([(CONTENT_TYPE, content_type)], body).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "metric encode error");
            (StatusCode::INTERNAL_SERVER_ERROR, "metric encode error").into_response()
        }
    }
}

async fn health(
    State(contract): State<ServiceContract>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let service = params.get("service").map(String::as_str).unwrap_or("");
    let status = contract.health().check(service);
    let code = match status {
        ServingStatus::Serving => StatusCode::OK,
        ServingStatus::NotServing => StatusCode::SERVICE_UNAVAILABLE,
        ServingStatus::ServiceUnknown => StatusCode::NOT_FOUND,
    };
    (code, Json(json!({ "status": status }))).into_response()
}

/// Serves [`admin_router`] on the configured admin address until
/// `shutdown` resolves. Returns immediately when no admin section is
/// configured.
///
/// # Errors
///
/// Binding or accept failures of the listener.
pub async fn serve_admin<F>(contract: &ServiceContract, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let Some(admin) = &contract.config().admin else {
        tracing::info!(service = %contract.name(), "no admin listener configured");
        return Ok(());
    };
    let listener = TcpListener::bind((admin.host.as_str(), admin.port)).await?;
    tracing::info!(
        service = %contract.name(),
        address = %listener.local_addr()?,
        "serving admin endpoints"
    );
    axum::serve(listener, admin_router(contract))
        .with_graceful_shutdown(shutdown)
        .await
}
