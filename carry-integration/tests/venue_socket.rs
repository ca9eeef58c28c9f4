use carry_instrument::exchange::ExchangeId;
use carry_integration::{
    channel::mpsc_unbounded,
    supervisor::{BackoffPolicy, SupervisorEvent, VenueSocket, VenueSocketConfig},
};
use futures::StreamExt;
use std::time::Duration;
use tokio::net::TcpListener;

const SUBSCRIBE_PAYLOAD: &str =
    r#"{"method":"SUBSCRIBE","params":["btcusdt@ticker"],"id":1}"#;

/// Local WebSocket server that records the first text frame of every accepted connection and
/// immediately drops the first `drop_connections` connections after that frame.
async fn run_server(
    listener: TcpListener,
    drop_connections: usize,
    received: tokio::sync::mpsc::UnboundedSender<String>,
) {
    let mut accepted = 0usize;
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let Ok(mut websocket) = tokio_tungstenite::accept_async(stream).await else {
            continue;
        };

        // Wait for the client's first text frame (the subscription payload)
        while let Some(Ok(frame)) = websocket.next().await {
            if let tokio_tungstenite::tungstenite::Message::Text(payload) = frame {
                let _ = received.send(payload.to_string());
                break;
            }
        }

        accepted += 1;
        if accepted <= drop_connections {
            // Abruptly drop the connection to force the client to reconnect
            drop(websocket);
            continue;
        }

        // Keep the final connection open until the client closes
        while let Some(Ok(frame)) = websocket.next().await {
            if frame.is_close() {
                break;
            }
        }
        return;
    }
}

#[tokio::test]
async fn test_venue_socket_reconnects_and_replays_subscriptions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (received_tx, mut received_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(run_server(listener, 1, received_tx));

    let (event_tx, mut event_rx) = mpsc_unbounded();
    let config = VenueSocketConfig {
        connect_timeout: Duration::from_secs(5),
        backoff: BackoffPolicy {
            base: Duration::from_millis(50),
            max: Duration::from_millis(200),
            jitter_max: Duration::from_millis(10),
        },
        max_reconnect_attempts: 5,
        resubscribe_settle: Duration::from_millis(10),
    };
    let handle = VenueSocket::spawn(
        ExchangeId::Binance,
        format!("ws://{addr}"),
        config,
        event_tx,
    );

    // Await initial connection, then subscribe
    let event = tokio::time::timeout(Duration::from_secs(5), event_rx.rx.recv())
        .await
        .expect("timed out awaiting Connected")
        .unwrap();
    assert!(matches!(event, SupervisorEvent::Connected { .. }));
    handle.subscribe(SUBSCRIBE_PAYLOAD);

    // Server records the initial subscription, then drops the connection
    let first = tokio::time::timeout(Duration::from_secs(5), received_rx.recv())
        .await
        .expect("timed out awaiting initial subscription")
        .unwrap();
    assert_eq!(first, SUBSCRIBE_PAYLOAD);

    // Expect Disconnected -> Reconnecting -> Connected, in order
    let mut saw_disconnected = false;
    let mut saw_reconnecting = false;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), event_rx.rx.recv())
            .await
            .expect("timed out awaiting reconnection events")
            .unwrap();
        match event {
            SupervisorEvent::Disconnected { .. } => saw_disconnected = true,
            SupervisorEvent::Reconnecting { attempt, .. } => {
                assert!(saw_disconnected, "Reconnecting before Disconnected");
                assert_eq!(attempt, 1);
                saw_reconnecting = true;
            }
            SupervisorEvent::Connected { .. } => {
                assert!(saw_reconnecting, "Connected before Reconnecting");
                break;
            }
            SupervisorEvent::Error { .. } | SupervisorEvent::Message { .. } => {}
        }
    }

    // The stored subscription payload must be replayed verbatim shortly after reconnecting
    let replayed = tokio::time::timeout(Duration::from_millis(500), received_rx.recv())
        .await
        .expect("subscription was not replayed within 500ms of reconnect")
        .unwrap();
    assert_eq!(replayed, SUBSCRIBE_PAYLOAD);

    handle.close();
}

#[tokio::test]
async fn test_venue_socket_gives_up_after_max_attempts() {
    // Bind a listener and drop it immediately so connections are refused
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (event_tx, mut event_rx) = mpsc_unbounded();
    let config = VenueSocketConfig {
        connect_timeout: Duration::from_millis(500),
        backoff: BackoffPolicy {
            base: Duration::from_millis(10),
            max: Duration::from_millis(20),
            jitter_max: Duration::from_millis(5),
        },
        max_reconnect_attempts: 2,
        resubscribe_settle: Duration::from_millis(10),
    };
    VenueSocket::spawn(
        ExchangeId::Okx,
        format!("ws://{addr}"),
        config,
        event_tx,
    );

    let mut reconnect_attempts = 0;
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), event_rx.rx.recv())
            .await
            .expect("timed out awaiting terminal error")
            .unwrap();
        match event {
            SupervisorEvent::Reconnecting { .. } => reconnect_attempts += 1,
            SupervisorEvent::Error { error, .. } => {
                if matches!(
                    error,
                    carry_integration::error::SocketError::ReconnectAttemptsExhausted(2)
                ) {
                    break;
                }
            }
            _ => {}
        }
    }
    assert_eq!(reconnect_attempts, 2);
}
