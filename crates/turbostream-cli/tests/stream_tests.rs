//! End-to-end runs of the `stream` command against a mock server.

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use wiremock::matchers::{body_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use turbostream_cli::{CliError, StreamOptions, StreamOutcome, stream_to};
use turbostream_transport::{ReconnectConfig, TransportConfig, TransportProtocol};

fn lines(out: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(out)
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

fn options(protocol: TransportProtocol) -> StreamOptions {
    StreamOptions {
        protocol,
        send: None,
        max_events: None,
    }
}

async fn event_stream_server(body: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.to_string(), "text/event-stream"))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_prints_one_line_per_event_until_done() {
    let server =
        event_stream_server("event: token\ndata: {\"n\":1}\n\ndata: {\"n\":2}\n\ndata: [DONE]\n\n")
            .await;

    let mut out = Vec::new();
    let outcome = stream_to(
        TransportConfig::new(server.uri()),
        &options(TransportProtocol::Sse),
        &mut out,
    )
    .await
    .unwrap();

    assert_eq!(outcome, StreamOutcome::Done);
    assert_eq!(
        lines(&out),
        vec![
            json!({"data": {"n": 1}, "event_type": "token"}),
            json!({"data": {"n": 2}}),
        ]
    );
}

#[tokio::test]
async fn test_stops_after_max_events() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("{\"n\":1}\n{\"n\":2}\n{\"n\":3}\n", "application/x-ndjson"),
        )
        .mount(&server)
        .await;

    let mut out = Vec::new();
    let outcome = stream_to(
        TransportConfig::new(server.uri()),
        &StreamOptions {
            max_events: Some(2),
            ..options(TransportProtocol::HttpStream)
        },
        &mut out,
    )
    .await
    .unwrap();

    assert_eq!(outcome, StreamOutcome::LimitReached);
    assert_eq!(lines(&out).len(), 2);
}

#[tokio::test]
async fn test_sends_payload_once_connected() {
    let server = event_stream_server("data: {\"ok\":true}\n\ndata: [DONE]\n\n").await;
    Mock::given(method("POST"))
        .and(body_json(json!({"prompt": "hi"})))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let mut out = Vec::new();
    stream_to(
        TransportConfig::new(server.uri()),
        &StreamOptions {
            send: Some(json!({"prompt": "hi"})),
            ..options(TransportProtocol::Sse)
        },
        &mut out,
    )
    .await
    .unwrap();
    assert_eq!(lines(&out), vec![json!({"data": {"ok": true}})]);
}

#[tokio::test]
async fn test_exhausted_retries_fail_the_command() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let config = TransportConfig::new(server.uri()).with_reconnect(ReconnectConfig::disabled());
    let mut out = Vec::new();
    let err = stream_to(config, &options(TransportProtocol::Sse), &mut out)
        .await
        .unwrap_err();

    let CliError::StreamFailed(message) = err else {
        panic!("expected stream failure, got {err:?}");
    };
    assert!(message.contains("503"));
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_unusable_configuration_is_reported() {
    let mut out = Vec::new();
    let err = stream_to(
        TransportConfig::new("ftp://example.com/feed"),
        &options(TransportProtocol::WebSocket),
        &mut out,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, CliError::Transport(_)));
}
