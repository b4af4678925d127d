mod common;

use apim_stream::{app, config, Error, GatewayConfig, TraceInspector};
use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::common::*;

fn trace_document() -> serde_json::Value {
    json!({
        "traceId": "trace-42",
        "spans": [
            {"name": "backend", "timestamp": "2024-10-01T12:00:00.400Z", "tokens": 2, "latencyMs": 400.0},
            {"name": "inbound", "timestamp": "2024-10-01T12:00:00Z"},
            {"name": "backend", "timestamp": "2024-10-01T12:00:01Z", "tokens": 3, "latencyMs": 600.0}
        ]
    })
}

#[tokio::test]
async fn fetches_and_orders_spans() {
    setup();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/diagnostics/traces/trace-42"))
        .and(header("Ocp-Apim-Subscription-Key", KEY))
        .respond_with(ResponseTemplate::new(200).set_body_json(trace_document()))
        .expect(1)
        .mount(&server)
        .await;

    let config = GatewayConfig::load(&env(&server.uri())).unwrap();
    let record = TraceInspector::new(&config)
        .fetch_trace("trace-42")
        .await
        .unwrap();

    assert_eq!(record.trace_id, "trace-42");
    let names: Vec<&str> = record.spans.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["inbound", "backend", "backend"]);
    assert_eq!(record.total_tokens(), 5);
    assert_eq!(
        record.cumulative_tokens(),
        vec![(0.0, 0.0), (0.4, 2.0), (1.0, 5.0)]
    );
}

#[tokio::test]
async fn sends_debug_authorization_when_configured() {
    setup();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/custom/trace-42"))
        .and(header("Apim-Debug-Authorization", "debug-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(trace_document()))
        .expect(1)
        .mount(&server)
        .await;

    let mut values = env(&server.uri());
    values.insert(config::DEBUG_AUTHORIZATION.to_owned(), "debug-token".to_owned());
    values.insert(config::TRACE_PATH.to_owned(), "/custom".to_owned());
    let config = GatewayConfig::load(&values).unwrap();

    TraceInspector::new(&config)
        .fetch_trace("trace-42")
        .await
        .unwrap();
}

#[tokio::test]
async fn renders_table_and_chart() {
    setup();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/diagnostics/traces/trace-42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(trace_document()))
        .mount(&server)
        .await;

    let mut input = &b""[..];
    let mut out = Vec::new();
    app::run_trace(
        &env(&server.uri()),
        Some("trace-42".to_owned()),
        &mut input,
        &mut out,
    )
    .await
    .unwrap();

    let printed = String::from_utf8(out).unwrap();
    assert!(printed.contains("Debugging Information"));
    assert!(printed.contains("Trace trace-42"));
    assert!(printed.contains("Latency (ms)"));
    assert!(printed.contains("Cumulative Tokens"));
}

#[tokio::test]
async fn prompts_for_trace_id() {
    setup();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/diagnostics/traces/trace-42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(trace_document()))
        .expect(1)
        .mount(&server)
        .await;

    let mut input = &b"trace-42\n"[..];
    let mut out = Vec::new();
    let record = app::run_trace(&env(&server.uri()), None, &mut input, &mut out)
        .await
        .unwrap();

    assert_eq!(record.spans.len(), 3);
    assert!(String::from_utf8(out).unwrap().starts_with("Enter a trace id: "));
}

#[tokio::test]
async fn unknown_trace_is_not_found_and_renders_nothing() {
    setup();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/diagnostics/traces/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let mut input = &b""[..];
    let mut out = Vec::new();
    let err = app::run_trace(
        &env(&server.uri()),
        Some("missing".to_owned()),
        &mut input,
        &mut out,
    )
    .await
    .unwrap_err();

    assert!(matches!(&err, Error::NotFound(id) if id == "missing"));
    assert_ne!(err.exit_code(), 0);
    assert!(out.is_empty());
}

#[tokio::test]
async fn rejected_key_is_an_auth_error() {
    setup();
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;

    let config = GatewayConfig::load(&env(&server.uri())).unwrap();
    let err = TraceInspector::new(&config)
        .fetch_trace("trace-42")
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Auth { .. }));
}
