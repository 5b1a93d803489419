//! Reconnection budget, backoff and cancellation.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use pretty_assertions::assert_eq;

use common::{
    HangingHttpClient, MemoryConnector, RefusingHttpClient, count, drain, wait_for_state,
};
use turbostream_transport::{
    EventKind, ReconnectConfig, SseTransport, Transport, TransportConfig, TransportError,
    TransportEvent, TransportState, WebSocketTransport,
};

fn retrying(max_attempts: u32, initial_delay: Duration) -> TransportConfig {
    TransportConfig::new("http://stream.invalid/events").with_reconnect(ReconnectConfig {
        max_attempts,
        initial_delay,
        jitter: false,
        ..ReconnectConfig::default()
    })
}

#[tokio::test]
async fn test_exhausted_budget_settles_in_error() {
    let client = Arc::new(RefusingHttpClient::default());
    let transport =
        SseTransport::with_client(retrying(3, Duration::from_millis(10)), client.clone()).unwrap();
    let mut rx = transport.subscribe();

    transport.connect().await.unwrap();
    wait_for_state(&transport, TransportState::Error).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = drain(&mut rx);
    assert_eq!(count(&events, EventKind::Connecting), 4);
    assert_eq!(count(&events, EventKind::Reconnecting), 3);
    assert_eq!(count(&events, EventKind::Error), 4);
    assert_eq!(client.calls.load(Ordering::SeqCst), 4);

    let attempts: Vec<u32> = events
        .iter()
        .filter_map(|event| match event {
            TransportEvent::Connecting { attempt } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, vec![0, 1, 2, 3]);

    let delays: Vec<Duration> = events
        .iter()
        .filter_map(|event| match event {
            TransportEvent::Reconnecting { delay, .. } => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(
        delays,
        vec![
            Duration::from_millis(20),
            Duration::from_millis(40),
            Duration::from_millis(80)
        ]
    );

    let metrics = transport.metrics();
    assert_eq!(metrics.errors, 4);
    assert_eq!(metrics.reconnect_attempts, 3);
    assert!(metrics.last_error.unwrap().contains("connection refused"));
}

#[tokio::test]
async fn test_manual_connect_after_error_resets_budget() {
    let client = Arc::new(RefusingHttpClient::default());
    let transport =
        SseTransport::with_client(retrying(1, Duration::from_millis(5)), client.clone()).unwrap();

    transport.connect().await.unwrap();
    wait_for_state(&transport, TransportState::Error).await;
    assert_eq!(client.calls.load(Ordering::SeqCst), 2);

    let mut rx = transport.subscribe();
    transport.connect().await.unwrap();
    wait_for_state(&transport, TransportState::Error).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(client.calls.load(Ordering::SeqCst), 4);
    assert_eq!(count(&drain(&mut rx), EventKind::Connecting), 2);
}

#[tokio::test]
async fn test_close_cancels_pending_reconnect() {
    let client = Arc::new(RefusingHttpClient::default());
    let transport =
        SseTransport::with_client(retrying(5, Duration::from_millis(50)), client.clone()).unwrap();
    let mut rx = transport.subscribe();

    transport.connect().await.unwrap();
    assert_eq!(transport.state(), TransportState::Reconnecting);
    transport.close();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let events = drain(&mut rx);
    let closed_at = events
        .iter()
        .position(|event| matches!(event, TransportEvent::Closed))
        .expect("close emits closed");
    assert!(events[closed_at + 1..].is_empty());
    assert_eq!(count(&events, EventKind::Closed), 1);
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    assert_eq!(transport.state(), TransportState::Closed);
    assert_eq!(transport.metrics().buffer_size, 0);

    // Idempotent.
    transport.close();
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_close_aborts_in_flight_connect() {
    let transport = Arc::new(
        SseTransport::with_client(
            retrying(3, Duration::from_millis(10)),
            Arc::new(HangingHttpClient),
        )
        .unwrap(),
    );
    let mut rx = transport.subscribe();

    let connecting = {
        let transport = Arc::clone(&transport);
        tokio::spawn(async move { transport.connect().await })
    };
    wait_for_state(transport.as_ref(), TransportState::Connecting).await;
    transport.close();

    tokio::time::timeout(Duration::from_secs(1), connecting)
        .await
        .expect("connect must resolve once closed")
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let events = drain(&mut rx);
    assert_eq!(count(&events, EventKind::Connected), 0);
    assert_eq!(count(&events, EventKind::Reconnecting), 0);
    assert_eq!(count(&events, EventKind::Error), 0);
}

#[tokio::test]
async fn test_connect_timeout_consumes_an_attempt() {
    let config = retrying(1, Duration::from_millis(5)).with_timeout(Duration::from_millis(20));
    let transport = SseTransport::with_client(config, Arc::new(HangingHttpClient)).unwrap();
    let mut rx = transport.subscribe();

    transport.connect().await.unwrap();
    wait_for_state(&transport, TransportState::Error).await;

    let timeouts = drain(&mut rx)
        .into_iter()
        .filter(|event| matches!(
            event,
            TransportEvent::Error(context)
                if matches!(context.error, TransportError::ConnectionTimeout { .. })
        ))
        .count();
    assert_eq!(timeouts, 2);
}

#[tokio::test]
async fn test_retry_predicate_overrides_eligibility() {
    let client = Arc::new(RefusingHttpClient::default());
    let config = retrying(5, Duration::from_millis(5)).with_retry_predicate(|_, attempt| attempt < 2);
    let transport = SseTransport::with_client(config, client.clone()).unwrap();

    transport.connect().await.unwrap();
    wait_for_state(&transport, TransportState::Error).await;
    // Attempts 0 and 1 may retry; the failure at attempt 2 settles.
    assert_eq!(client.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_disabled_reconnect_fails_once() {
    let client = Arc::new(RefusingHttpClient::default());
    let config = TransportConfig::new("http://stream.invalid")
        .with_reconnect(ReconnectConfig::disabled());
    let transport = SseTransport::with_client(config, client.clone()).unwrap();
    let mut rx = transport.subscribe();

    transport.connect().await.unwrap();
    assert_eq!(transport.state(), TransportState::Error);
    let events = drain(&mut rx);
    assert_eq!(count(&events, EventKind::Connecting), 1);
    assert_eq!(count(&events, EventKind::Reconnecting), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_nothing_follows_closed_when_close_races_connect() {
    for round in 0..200 {
        let (connector, _accepted) = MemoryConnector::new();
        // Alternate between a successful handshake and a refused one that schedules a retry.
        connector.refuse.store(round % 2, Ordering::SeqCst);
        let config = TransportConfig::new("ws://stream.invalid/socket").with_reconnect(
            ReconnectConfig {
                initial_delay: Duration::from_millis(1),
                jitter: false,
                ..ReconnectConfig::default()
            },
        );
        let transport = Arc::new(WebSocketTransport::with_connector(config, connector).unwrap());
        let mut rx = transport.subscribe();

        let connecting = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.connect().await })
        };
        if round % 3 == 0 {
            tokio::task::yield_now().await;
        }
        transport.close();
        let _ = connecting.await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let events = drain(&mut rx);
        let closed_at = events
            .iter()
            .position(|event| matches!(event, TransportEvent::Closed))
            .expect("close emits closed");
        assert!(
            events[closed_at + 1..].is_empty(),
            "round {round}: {:?} after closed",
            &events[closed_at + 1..]
        );
        assert_eq!(count(&events, EventKind::Closed), 1);
    }
}
