//! End-to-end scenarios through the request pipeline with mocked downstreams.

use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use service_core::mock::TestServer;
use service_core::validate::FieldRule;
use service_core::{
    unsigned_token, DownstreamClients, DownstreamOperation, ErrorEnvelope, HttpError,
    InsecureJwtAuthenticator, Operation, RawResponse, RequestContext, RuleSet, ServiceContract,
    ServiceContractBuilder,
};

// ============================================================================
// Encoder gateway
// ============================================================================

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct EncodeRequest {
    content: String,
    encoder_id: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct EncodeResponse {
    content: String,
}

fn rot13(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'a'..='z' => (((c as u8 - b'a') + 13) % 26 + b'a') as char,
            'A'..='Z' => (((c as u8 - b'A') + 13) % 26 + b'A') as char,
            other => other,
        })
        .collect()
}

fn gateway() -> ServiceContractBuilder {
    ServiceContract::builder("gateway")
        .downstream(
            DownstreamOperation::new("encoder", "Encode", Method::POST, "/v1/{encoderId}/encode")
                .require_header("y"),
        )
        .operation(
            Operation::new("Encode", Method::POST, "/encode")
                .request_rules(
                    RuleSet::new()
                        .field("content", "required")
                        .unwrap()
                        .field("encoderId", "required,oneof=rot13 identity")
                        .unwrap(),
                )
                .downstream("encoder.Encode")
                .handler_with_clients(
                    |ctx: RequestContext, req: EncodeRequest, clients: DownstreamClients| async move {
                        clients
                            .call::<_, EncodeResponse>(&ctx, "encoder.Encode", &req)
                            .await
                    },
                ),
        )
        .error_override(|err, _scope| {
            err.caused_by_header("y").then(|| {
                HttpError::new(StatusCode::BAD_REQUEST, "4000", "header y is required")
                    .with_field("header", "y")
            })
        })
}

#[tokio::test]
async fn rot13_round_trip_through_the_encoder() {
    let server = TestServer::unit(gateway, None).unwrap();
    server
        .mock("encoder.Encode")
        .expect_header("y", "1")
        .expect_body(json!({"content": "hello world"}))
        .respond(json!({ "content": rot13("hello world") }));

    server
        .call("Encode")
        .with_header("y", "1")
        .with_body(json!({"content": "hello world", "encoderId": "rot13"}))
        .expect_status(StatusCode::OK)
        .expect_body(json!({"content": "uryyb jbeyq"}))
        .send()
        .await;

    let calls = server.transport().received("encoder.Encode");
    assert_eq!(calls[0].path, "/v1/rot13/encode");
    server.close();
}

#[tokio::test]
async fn missing_propagated_header_reaches_the_override() {
    let server = TestServer::unit(gateway, None).unwrap();
    server
        .call("Encode")
        .with_body(json!({"content": "hello world", "encoderId": "rot13"}))
        .expect_status(StatusCode::BAD_REQUEST)
        .expect_body(json!({
            "status": {"code": "4000", "description": "header y is required"},
            "header": "y"
        }))
        .send()
        .await;
    assert!(server.transport().received("encoder.Encode").is_empty());
    server.close();
}

#[tokio::test]
async fn invalid_requests_never_reach_the_handler() {
    let server = TestServer::unit(gateway, None).unwrap().strictness(false);
    server
        .mock("encoder.Encode")
        .respond(json!({"content": "unused"}));

    for body in [
        json!({"encoderId": "rot13"}),
        json!({"content": "x", "encoderId": "base64"}),
    ] {
        server
            .call("Encode")
            .with_header("y", "1")
            .with_body(body)
            .expect_status(StatusCode::BAD_REQUEST)
            .send()
            .await;
    }
    assert_eq!(server.pending("encoder.Encode"), 1);
}

#[tokio::test(start_paused = true)]
async fn slow_downstream_is_a_gateway_timeout() {
    let overlay = "
downstream:
  encoder:
    service_url: http://encoder.internal
    client_timeout: 100ms
";
    let server = TestServer::unit(gateway, Some(overlay)).unwrap();
    server.mock("encoder.Encode").time_out();

    let response = server
        .call("Encode")
        .with_header("y", "1")
        .with_body(json!({"content": "a", "encoderId": "rot13"}))
        .expect_status(StatusCode::GATEWAY_TIMEOUT)
        .send()
        .await;
    assert_eq!(response.json::<Value>().unwrap()["status"]["code"], "1005");
    let calls = server.transport().received("encoder.Encode");
    assert_eq!(calls[0].timeout, std::time::Duration::from_millis(100));
    assert_eq!(calls[0].base_url, "http://encoder.internal");
    server.close();
}

#[tokio::test(start_paused = true)]
async fn downstream_budget_never_exceeds_the_request_budget() {
    let overlay = "
upstream:
  context_timeout: 200ms
downstream:
  encoder:
    client_timeout: 60s
";
    let server = TestServer::unit(gateway, Some(overlay)).unwrap();
    server.mock("encoder.Encode").time_out();

    let response = server
        .call("Encode")
        .with_header("y", "1")
        .with_body(json!({"content": "a", "encoderId": "identity"}))
        .send()
        .await;
    assert!(response.status.is_server_error());
    let calls = server.transport().received("encoder.Encode");
    assert!(calls[0].timeout <= std::time::Duration::from_millis(200));
    server.close();
}

// ============================================================================
// Range checks on both sides
// ============================================================================

#[derive(Debug, Deserialize, Serialize)]
struct Identified {
    identifier: i64,
}

fn ranges(ignore_response: bool) -> impl FnOnce() -> ServiceContractBuilder {
    move || {
        let mut response = RuleSet::new().rule(FieldRule::new("identifier").tags("min=0,max=10").unwrap());
        if ignore_response {
            response = response.ignorable();
        }
        ServiceContract::builder("ranges").operation(
            Operation::new("Echo", Method::POST, "/echo")
                .request_rules(RuleSet::new().field("identifier", "required,min=0,max=20").unwrap())
                .response_rules(response)
                .handler(|_ctx: RequestContext, req: Identified| async move {
                    Ok::<_, ErrorEnvelope>(Identified {
                        identifier: req.identifier,
                    })
                }),
        )
    }
}

#[tokio::test]
async fn request_out_of_range_is_a_client_error() {
    let server = TestServer::unit(ranges(false), None).unwrap();
    let response = server
        .call("Echo")
        .with_body(json!({"identifier": -1}))
        .expect_status(StatusCode::BAD_REQUEST)
        .send()
        .await;
    assert_eq!(response.json::<Value>().unwrap()["status"]["code"], "1001");
}

#[tokio::test]
async fn response_out_of_range_is_a_server_error() {
    let server = TestServer::unit(ranges(false), None).unwrap();
    server
        .call("Echo")
        .with_body(json!({"identifier": 20}))
        .expect_status(StatusCode::INTERNAL_SERVER_ERROR)
        .send()
        .await;
}

#[tokio::test]
async fn ignorable_response_rules_let_the_value_through() {
    let server = TestServer::unit(ranges(true), None).unwrap();
    server
        .call("Echo")
        .with_body(json!({"identifier": 20}))
        .expect_status(StatusCode::OK)
        .expect_body(json!({"identifier": 20}))
        .send()
        .await;
}

// ============================================================================
// Per-iteration dispatch
// ============================================================================

#[derive(Debug, Deserialize)]
struct Count {
    n: u32,
}

#[derive(Debug, Serialize)]
struct Step {
    i: u32,
}

#[derive(Debug, Deserialize)]
struct Said {
    text: String,
}

fn fizzbuzz() -> ServiceContractBuilder {
    ServiceContract::builder("fizzbuzz")
        .downstream(DownstreamOperation::new("fizz", "Say", Method::POST, "/say"))
        .downstream(DownstreamOperation::new("buzz", "Say", Method::POST, "/say"))
        .downstream(DownstreamOperation::new("fizzbuzz", "Say", Method::POST, "/say"))
        .operation(
            Operation::new("Count", Method::POST, "/count")
                .request_rules(RuleSet::new().field("n", "required,min=1,max=100").unwrap())
                .downstream("fizz.Say")
                .downstream("buzz.Say")
                .downstream("fizzbuzz.Say")
                .raw_handler(
                    |ctx: RequestContext, req: Count, clients: DownstreamClients| async move {
                        let mut out = String::new();
                        for i in 1..=req.n {
                            let target = match (i % 3, i % 5) {
                                (0, 0) => "fizzbuzz.Say",
                                (0, _) => "fizz.Say",
                                (_, 0) => "buzz.Say",
                                _ => continue,
                            };
                            let said: Said = clients.call(&ctx, target, &Step { i }).await?;
                            out.push_str(&said.text);
                        }
                        Ok(RawResponse::text(out))
                    },
                ),
        )
}

#[tokio::test]
async fn downstream_replies_concatenate_in_iteration_order() {
    let server = TestServer::unit(fizzbuzz, None).unwrap();
    for i in [3, 6, 9, 12] {
        server
            .mock("fizz.Say")
            .expect_body(json!({ "i": i }))
            .respond(json!({ "text": format!("FIZZ({})\n", i) }));
    }
    for i in [5, 10] {
        server
            .mock("buzz.Say")
            .expect_body(json!({ "i": i }))
            .respond(json!({ "text": format!("BUZZ({})\n", i) }));
    }
    server
        .mock("fizzbuzz.Say")
        .expect_body(json!({"i": 15}))
        .respond(json!({"text": "FIZZBUZZ(15)\n"}));

    let response = server
        .call("Count")
        .with_body(json!({"n": 15}))
        .expect_status(StatusCode::OK)
        .send()
        .await;
    assert_eq!(
        response.text(),
        "FIZZ(3)\nBUZZ(5)\nFIZZ(6)\nFIZZ(9)\nBUZZ(10)\nFIZZ(12)\nFIZZBUZZ(15)\n"
    );
    assert_eq!(response.content_type(), Some("text/plain; charset=utf-8"));
    server.close();
}

// ============================================================================
// Unimplemented and gated operations
// ============================================================================

fn gated() -> ServiceContractBuilder {
    ServiceContract::builder("gated")
        .authenticator(InsecureJwtAuthenticator::new())
        .operation(Operation::new("Later", Method::POST, "/later"))
        .operation(
            Operation::new("Secret", Method::GET, "/secret")
                .authorize(r#"any(jwtHasScope("admin"), jwtHasScope("reader"),)"#)
                .handler(|ctx: RequestContext, _req: Value| async move {
                    let subject = ctx
                        .claims()
                        .and_then(|claims| claims.get("sub"))
                        .cloned()
                        .unwrap_or(Value::Null);
                    Ok::<_, ErrorEnvelope>(json!({ "sub": subject }))
                }),
        )
}

#[tokio::test]
async fn operations_without_handlers_are_unimplemented() {
    let server = TestServer::unit(gated, None).unwrap();
    server
        .call("Later")
        .expect_status(StatusCode::NOT_IMPLEMENTED)
        .send()
        .await;
}

#[tokio::test]
async fn authorization_expressions_gate_the_handler() {
    let server = TestServer::unit(gated, None).unwrap();

    server
        .call("Secret")
        .expect_status(StatusCode::UNAUTHORIZED)
        .send()
        .await;

    let writer = unsigned_token(&json!({"sub": "w", "scope": "writer"}));
    server
        .call("Secret")
        .with_header("authorization", &format!("Bearer {}", writer))
        .expect_status(StatusCode::FORBIDDEN)
        .send()
        .await;

    let reader = unsigned_token(&json!({"sub": "r", "scope": "openid reader"}));
    server
        .call("Secret")
        .with_header("authorization", &format!("Bearer {}", reader))
        .expect_status(StatusCode::OK)
        .expect_body(json!({"sub": "r"}))
        .send()
        .await;
}
