use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;

use axum::extract::{Path, Query};
use axum::routing::{MethodFilter, MethodRouter};
use axum::Router;
use bytes::Bytes;
use http::{HeaderMap, Method};
use tokio::net::TcpListener;

use super::into_response;
use crate::request::InboundRequest;
use crate::service::ServiceContract;

/// Joins `base_path` and an operation path, rewriting `{name}` segments
/// into the router's `:name` captures.
///
/// ```
/// use service_core::web::route_path;
///
/// assert_eq!(route_path("/api/", "/items/{id}"), "/api/items/:id");
/// assert_eq!(route_path("/", "/ping"), "/ping");
/// ```
pub fn route_path(base_path: &str, path: &str) -> String {
    let base = base_path.trim_end_matches('/');
    let segments: Vec<String> = path
        .trim_start_matches('/')
        .split('/')
        .map(|segment| {
            match segment
                .strip_prefix('{')
                .and_then(|rest| rest.strip_suffix('}'))
            {
                Some(name) => format!(":{}", name),
                None => segment.to_string(),
            }
        })
        .collect();
    format!("{}/{}", base, segments.join("/"))
}

/// An axum router serving every operation of `contract`.
///
/// Path and query parameters are merged into the request object before
/// validation; see [`InboundRequest`]. A second operation declared on an
/// already routed method and path is skipped with a warning.
pub fn router(contract: &ServiceContract) -> Router {
    let base_path = &contract.config().upstream.http.base_path;
    let mut routes: BTreeMap<String, MethodRouter> = BTreeMap::new();
    let mut seen: HashSet<(String, Method)> = HashSet::new();

    for operation in contract.operations() {
        let path = route_path(base_path, operation.path());
        let method = operation.method().clone();
        if !seen.insert((path.clone(), method.clone())) {
            tracing::warn!(
                operation = %operation.name(),
                %method,
                path = %path,
                "route already taken; operation not served"
            );
            continue;
        }
        let Ok(filter) = MethodFilter::try_from(method.clone()) else {
            tracing::warn!(
                operation = %operation.name(),
                %method,
                "method cannot be routed; operation not served"
            );
            continue;
        };

        let contract = contract.clone();
        let name = operation.name().to_string();
        let endpoint = move |params: Option<Path<HashMap<String, String>>>,
                             query: Option<Query<Vec<(String, String)>>>,
                             headers: HeaderMap,
                             body: Bytes| async move {
            let request = InboundRequest {
                headers,
                path_params: params.map(|Path(p)| p).unwrap_or_default(),
                query: query.map(|Query(q)| q).unwrap_or_default(),
                body,
            };
            into_response(contract.invoke(&name, request).await)
        };

        tracing::debug!(operation = %operation.name(), %method, path = %path, "routing");
        let entry = routes.remove(&path).unwrap_or_default();
        routes.insert(path, entry.on(filter, endpoint));
    }

    routes
        .into_iter()
        .fold(Router::new(), |router, (path, methods)| {
            router.route(&path, methods)
        })
}

/// Serves [`router`] on the configured upstream address until `shutdown`
/// resolves. The contract's health entries turn `NOT_SERVING` before
/// in-flight requests are drained.
///
/// # Errors
///
/// Binding or accept failures of the listener.
pub async fn serve<F>(contract: &ServiceContract, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let binding = &contract.config().upstream.http;
    let listener = TcpListener::bind((binding.host.as_str(), binding.port)).await?;
    tracing::info!(
        service = %contract.name(),
        address = %listener.local_addr()?,
        base_path = %binding.base_path,
        "serving requests"
    );

    let health = contract.health().clone();
    axum::serve(listener, router(contract))
        .with_graceful_shutdown(async move {
            shutdown.await;
            health.shutdown();
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use crate::mock::MockTransport;
    use crate::service::Operation;
    use crate::settings::ServiceConfig;
    use axum::body::Body;
    use http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn contract() -> ServiceContract {
        let mut config = ServiceConfig::default();
        config.upstream.http.base_path = "/api".to_string();
        ServiceContract::builder("items")
            .config(config)
            .transport(Arc::new(MockTransport::new()))
            .operation(
                Operation::new("GetItem", Method::GET, "/items/{id}")
                    .handler(|_ctx: RequestContext, req: Value| async move { Ok(req) }),
            )
            .operation(
                Operation::new("PutItem", Method::PUT, "/items/{id}")
                    .success_status(StatusCode::CREATED)
                    .handler(|_ctx: RequestContext, req: Value| async move { Ok(req) }),
            )
            .build()
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn path_and_query_parameters_reach_the_handler() {
        let response = router(&contract())
            .oneshot(
                Request::get("/api/items/7?verbose=true")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"id": 7, "verbose": true}));
    }

    #[tokio::test]
    async fn methods_on_one_path_share_the_route() {
        let response = router(&contract())
            .oneshot(
                Request::put("/api/items/abc")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"name":"chair"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().contains_key("x-request-id"));
        assert_eq!(
            body_json(response).await,
            json!({"id": "abc", "name": "chair"})
        );
    }

    #[tokio::test]
    async fn routes_outside_the_base_path_are_not_served() {
        let response = router(&contract())
            .oneshot(Request::get("/items/7").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
