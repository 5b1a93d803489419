//! Socket transport over an in-memory connector.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::{MemoryConnector, ServerSocket, WAIT, collect_until, is_done, messages, next_matching};
use turbostream_transport::network::SocketFrame;
use turbostream_transport::{
    ReconnectConfig, Transport, TransportConfig, TransportError, TransportEvent, TransportState,
    WebSocketTransport,
};

fn config() -> TransportConfig {
    TransportConfig::new("https://stream.example.com/socket").with_reconnect(ReconnectConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(10),
        jitter: false,
        ..ReconnectConfig::default()
    })
}

async fn accept(rx: &mut tokio::sync::mpsc::UnboundedReceiver<ServerSocket>) -> ServerSocket {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for handshake")
        .expect("connector dropped")
}

#[tokio::test]
async fn test_handshake_uses_normalized_url_and_options() {
    let (connector, mut accepted) = MemoryConnector::new();
    let mut config = config().with_header("Authorization", "Bearer t");
    config.websocket.protocols = vec!["stream.v1".into()];
    let transport = WebSocketTransport::with_connector(config, connector).unwrap();
    assert_eq!(transport.driver().url(), "wss://stream.example.com/socket");

    transport.connect().await.unwrap();
    let server = accept(&mut accepted).await;
    assert_eq!(server.request.url, "wss://stream.example.com/socket");
    assert_eq!(server.request.protocols, vec!["stream.v1".to_string()]);
    assert_eq!(
        server.request.headers.get("Authorization").map(String::as_str),
        Some("Bearer t")
    );
    assert!(transport.is_connected());
}

#[tokio::test]
async fn test_inbound_frames_are_interpreted() {
    let (connector, mut accepted) = MemoryConnector::new();
    let transport = WebSocketTransport::with_connector(config(), connector).unwrap();
    let mut rx = transport.subscribe();
    transport.connect().await.unwrap();
    let mut server = accept(&mut accepted).await;

    server.send_text(r#"{"type":"ping","timestamp":5}"#);
    assert_eq!(
        server.recv_json().await,
        json!({"type": "pong", "timestamp": 5})
    );

    server.send_text(r#"{"type":"token","text":"hi"}"#);
    server.send_text(r#"{"type":"error","message":"model overloaded"}"#);
    server.send_text(r#"{"type":"pong","timestamp":1}"#);
    server.send_text("not json");
    server.send_text(r#"{"type":"done"}"#);

    let events = collect_until(&mut rx, is_done).await;
    assert_eq!(
        messages(&events),
        vec![
            json!({"type": "ping", "timestamp": 5}),
            json!({"type": "token", "text": "hi"}),
            json!({"type": "pong", "timestamp": 1}),
            json!("not json"),
        ]
    );
    assert!(events.iter().any(|event| matches!(
        event,
        TransportEvent::Error(context)
            if context.error == TransportError::Remote { message: "model overloaded".into() }
    )));

    // A close after completion is not a loss.
    drop(server);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.state(), TransportState::Connected);
    assert!(
        !common::drain(&mut rx)
            .iter()
            .any(|event| matches!(event, TransportEvent::Reconnecting { .. }))
    );
}

#[tokio::test]
async fn test_sends_queue_while_reconnecting_and_flush_in_order() {
    let (connector, mut accepted) = MemoryConnector::new();
    let transport = WebSocketTransport::with_connector(config(), connector).unwrap();
    let mut rx = transport.subscribe();
    transport.connect().await.unwrap();

    let mut first = accept(&mut accepted).await;
    transport.send(json!({"seq": 1})).await.unwrap();
    assert_eq!(first.recv_json().await, json!({"seq": 1}));

    first
        .to_client
        .unbounded_send(Ok(SocketFrame::Close(Some("restart".into()))))
        .unwrap();
    next_matching(&mut rx, |e| matches!(e, TransportEvent::Reconnecting { .. })).await;

    transport.send(json!({"seq": 2})).await.unwrap();
    transport.send(json!({"seq": 3})).await.unwrap();

    let mut second = accept(&mut accepted).await;
    assert_eq!(second.recv_json().await, json!({"seq": 2}));
    assert_eq!(second.recv_json().await, json!({"seq": 3}));
    assert_eq!(transport.driver().queued_len(), 0);

    tokio::time::timeout(WAIT, async {
        while transport.metrics().messages_sent < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("flushed payloads should be counted as sent");
}

#[tokio::test]
async fn test_send_fails_in_terminal_states() {
    let (connector, _accepted) = MemoryConnector::new();
    connector.refuse.store(1, std::sync::atomic::Ordering::SeqCst);
    let mut config = config();
    config.reconnect = ReconnectConfig::disabled();
    let transport = WebSocketTransport::with_connector(config, connector).unwrap();

    transport.connect().await.unwrap();
    assert_eq!(transport.state(), TransportState::Error);
    assert!(matches!(
        transport.send(json!({})).await,
        Err(TransportError::NotConnected(_))
    ));

    transport.close();
    assert_eq!(transport.send(json!({})).await, Err(TransportError::Closed));
}

#[tokio::test]
async fn test_binary_frames_as_base64() {
    let (connector, mut accepted) = MemoryConnector::new();
    let mut config = config();
    config.websocket.binary_type = turbostream_transport::BinaryType::Base64;
    let transport = WebSocketTransport::with_connector(config, connector).unwrap();
    let mut rx = transport.subscribe();
    transport.connect().await.unwrap();
    let server = accept(&mut accepted).await;

    server
        .to_client
        .unbounded_send(Ok(SocketFrame::Binary(bytes::Bytes::from_static(b"hi"))))
        .unwrap();
    let TransportEvent::Message(event) =
        next_matching(&mut rx, |e| matches!(e, TransportEvent::Message(_))).await
    else {
        unreachable!();
    };
    assert_eq!(event.event_type.as_deref(), Some("binary"));
    assert_eq!(event.data, json!({"type": "binary", "data": "aGk="}));
}

#[tokio::test(start_paused = true)]
async fn test_missing_pong_forces_reconnect() {
    let (connector, mut accepted) = MemoryConnector::new();
    let mut config = config();
    config.websocket.heartbeat_interval = Some(Duration::from_millis(50));
    let transport = WebSocketTransport::with_connector(config, connector).unwrap();
    let mut rx = transport.subscribe();
    transport.connect().await.unwrap();
    let mut server = accept(&mut accepted).await;

    let ping = server.recv_json().await;
    assert_eq!(ping["type"], "ping");
    assert!(ping["timestamp"].is_i64());

    let TransportEvent::Error(context) =
        next_matching(&mut rx, |e| matches!(e, TransportEvent::Error(_))).await
    else {
        unreachable!();
    };
    let TransportError::HeartbeatTimeout { elapsed } = context.error else {
        panic!("expected heartbeat timeout, got {:?}", context.error);
    };
    assert!(elapsed >= Duration::from_millis(100));

    next_matching(&mut rx, |e| matches!(e, TransportEvent::Reconnecting { attempt: 1, .. })).await;
    let _second = accept(&mut accepted).await;
    next_matching(&mut rx, |e| matches!(e, TransportEvent::Connected)).await;
}

#[tokio::test(start_paused = true)]
async fn test_pongs_keep_connection_alive() {
    let (connector, mut accepted) = MemoryConnector::new();
    let mut config = config();
    config.websocket.heartbeat_interval = Some(Duration::from_millis(50));
    let transport = WebSocketTransport::with_connector(config, connector).unwrap();
    let mut rx = transport.subscribe();
    transport.connect().await.unwrap();
    let mut server = accept(&mut accepted).await;

    for _ in 0..5 {
        let ping = server.recv_json().await;
        server.send_text(&json!({"type": "pong", "timestamp": ping["timestamp"]}).to_string());
    }

    assert_eq!(transport.state(), TransportState::Connected);
    assert!(transport.driver().last_pong().is_some());
    assert!(transport.metrics().average_latency_ms.is_some());
    assert!(
        !common::drain(&mut rx)
            .iter()
            .any(|event| matches!(event, TransportEvent::Error(_)))
    );
}

#[tokio::test]
async fn test_stuck_write_does_not_block_reconnect() {
    let (connector, mut accepted) = MemoryConnector::new();
    connector.stall.store(1, Ordering::SeqCst);
    let config = config().with_timeout(Duration::from_millis(200));
    let transport = Arc::new(WebSocketTransport::with_connector(config, connector).unwrap());
    let mut rx = transport.subscribe();
    transport.connect().await.unwrap();
    let first = accept(&mut accepted).await;

    let sending = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.send(json!({"seq": 1})).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!sending.is_finished());

    drop(first);
    let mut second = accept(&mut accepted).await;
    next_matching(&mut rx, |e| matches!(e, TransportEvent::Connected)).await;
    assert_eq!(transport.state(), TransportState::Connected);

    let result = tokio::time::timeout(WAIT, sending)
        .await
        .expect("write on the lost connection must give up")
        .unwrap();
    assert!(matches!(result, Err(TransportError::ConnectionLost(_))));

    transport.send(json!({"seq": 2})).await.unwrap();
    assert_eq!(second.recv_json().await, json!({"seq": 2}));
}

#[tokio::test]
async fn test_close_aborts_stuck_write() {
    let (connector, mut accepted) = MemoryConnector::new();
    connector.stall.store(1, Ordering::SeqCst);
    let transport = Arc::new(WebSocketTransport::with_connector(config(), connector).unwrap());
    transport.connect().await.unwrap();
    let _server = accept(&mut accepted).await;

    let sending = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.send(json!({"seq": 1})).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!sending.is_finished());

    transport.close();
    let result = tokio::time::timeout(WAIT, sending)
        .await
        .expect("close must abort the write")
        .unwrap();
    assert!(result.is_err());
    assert_eq!(transport.state(), TransportState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_during_handshake_is_delivered() {
    for round in 0..50 {
        let (connector, mut accepted) = MemoryConnector::new();
        let transport = Arc::new(WebSocketTransport::with_connector(config(), connector).unwrap());
        let connecting = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.connect().await })
        };
        while transport.state() == TransportState::Idle {
            tokio::task::yield_now().await;
        }

        transport.send(json!({"round": round})).await.unwrap();
        connecting.await.unwrap().unwrap();
        let mut server = accept(&mut accepted).await;
        assert_eq!(server.recv_json().await, json!({"round": round}));
        assert_eq!(transport.driver().queued_len(), 0);
    }
}
