//! The test harness in unit and integration mode.

use http::{Method, StatusCode};
use serde_json::{json, Value};
use service_core::mock::{SelectionPolicy, TestServer};
use service_core::{
    DownstreamClients, DownstreamOperation, ErrorEnvelope, Operation, RequestContext, RuleSet,
    ServiceContract, ServiceContractBuilder, TransportError,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

fn catalog() -> ServiceContractBuilder {
    ServiceContract::builder("catalog")
        .downstream(DownstreamOperation::new("prices", "Quote", Method::POST, "/quote"))
        .downstream(
            DownstreamOperation::new("stock", "Level", Method::GET, "/levels/{sku}")
                .require_header("x-tenant"),
        )
        .middleware(|ctx| ctx.with_verbose(true))
        .operation(
            Operation::new("Item", Method::GET, "/items/{sku}")
                .request_rules(
                    RuleSet::new()
                        .field("sku", "required,regexp='^[A-Z]{3}-[0-9]+$'")
                        .unwrap(),
                )
                .downstream("stock.Level")
                .downstream("prices.Quote")
                .handler_with_clients(
                    |ctx: RequestContext, req: Value, clients: DownstreamClients| async move {
                        let sku = req["sku"].clone();
                        let level_req = json!({ "sku": sku });
                        let low_req = json!({ "sku": sku, "tier": "low" });
                        let high_req = json!({ "sku": sku, "tier": "high" });
                        let (level, low, high) = futures::try_join!(
                            clients.call::<_, Value>(&ctx, "stock.Level", &level_req),
                            clients.call::<_, Value>(&ctx, "prices.Quote", &low_req),
                            clients.call::<_, Value>(&ctx, "prices.Quote", &high_req),
                        )?;
                        Ok::<_, ErrorEnvelope>(json!({
                            "sku": sku,
                            "level": level["level"],
                            "prices": [low["price"], high["price"]],
                        }))
                    },
                ),
        )
}

fn expect_quotes(server: &TestServer) {
    server
        .mock("prices.Quote")
        .expect_body_with("high tier", |body| body["tier"] == "high")
        .respond(json!({"price": 30}));
    server
        .mock("prices.Quote")
        .expect_body_with("low tier", |body| body["tier"] == "low")
        .respond(json!({"price": 10}));
}

#[tokio::test]
async fn integration_mode_serves_path_parameters_over_http() {
    init_tracing();
    let server = TestServer::integration(catalog, Some("upstream:\n  http:\n    base_path: /api\n"))
        .unwrap()
        .selection(SelectionPolicy::MatcherFirst);
    server
        .mock("stock.Level")
        .expect_header("x-tenant", "acme")
        .respond(json!({"level": 4}));
    expect_quotes(&server);

    let response = server
        .call("Item")
        .with_path_param("sku", "ABC-12")
        .with_header("x-tenant", "acme")
        .with_header("x-request-id", "trace-1")
        .expect_status(StatusCode::OK)
        .expect_body(json!({"sku": "ABC-12", "level": 4, "prices": [10, 30]}))
        .send()
        .await;
    assert_eq!(response.headers["x-request-id"], "trace-1");

    let received = server.transport().received("stock.Level");
    let level = &received[0];
    assert_eq!(level.path, "/levels/ABC-12");
    assert_eq!(level.method, Method::GET);
    assert_eq!(server.contract().metrics().requests("Item", 200), 1);
    assert_eq!(server.contract().metrics().downstream("prices.Quote", "ok"), 2);
    server.close();
}

#[tokio::test]
async fn unit_mode_reports_invalid_path_parameters() {
    let server = TestServer::unit(catalog, None).unwrap();
    let response = server
        .call("Item")
        .with_path_param("sku", "abc")
        .expect_status(StatusCode::BAD_REQUEST)
        .send()
        .await;
    let body: Value = response.json().unwrap();
    assert_eq!(body["status"]["code"], "1001");
    server.close();
}

#[tokio::test]
async fn unreachable_downstream_is_service_unavailable() {
    init_tracing();
    let server = TestServer::unit(catalog, None)
        .unwrap()
        .selection(SelectionPolicy::MatcherFirst);
    server
        .mock("stock.Level")
        .fail(TransportError::Unreachable("connection refused".into()));
    expect_quotes(&server);

    server
        .call("Item")
        .with_path_param("sku", "ABC-12")
        .with_header("x-tenant", "acme")
        .expect_status(StatusCode::SERVICE_UNAVAILABLE)
        .send()
        .await;
    assert_eq!(
        server.contract().metrics().downstream("stock.Level", "unavailable"),
        1
    );
    server.strictness(false).close();
}

#[tokio::test]
async fn untyped_downstream_error_is_an_unknown_error() {
    let server = TestServer::unit(catalog, None)
        .unwrap()
        .selection(SelectionPolicy::MatcherFirst);
    server
        .mock("stock.Level")
        .respond_with(StatusCode::NOT_FOUND, json!({"error": "no such sku"}));
    expect_quotes(&server);

    let response = server
        .call("Item")
        .with_path_param("sku", "ABC-12")
        .with_header("x-tenant", "acme")
        .expect_status(StatusCode::INTERNAL_SERVER_ERROR)
        .send()
        .await;
    let body: Value = response.json().unwrap();
    assert_eq!(body["status"]["code"], "9999");
    server.strictness(false).close();
}

#[tokio::test]
async fn unknown_routes_are_not_found_in_integration_mode() {
    let server = TestServer::integration(catalog, None).unwrap();
    let response = server
        .call("Item")
        .with_path_param("sku", "ABC-1/extra")
        .send()
        .await;
    assert_eq!(response.status, StatusCode::NOT_FOUND);
    server.close();
}
