//! WebSocket transport tests against a real in-process server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::Message;

use deechat_mcp_transport::websocket::{WebSocketConfig, WebSocketTransport};
use deechat_mcp_transport::{RetryPolicy, Transport, TransportEvent, TransportState};

/// A JSON-RPC echo server: answers every request with
/// `{"echo": <method>}`, answers protocol pings, ignores notifications.
/// Connections numbered below `drop_first` are closed right after the
/// handshake to exercise reconnection.
async fn spawn_echo_server(drop_first: usize) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let n = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                if n < drop_first {
                    // Simulate a server-side drop after connect.
                    let _ = ws.close(None).await;
                    return;
                }
                while let Some(Ok(frame)) = ws.next().await {
                    match frame {
                        Message::Text(text) => {
                            let Ok(value) =
                                serde_json::from_str::<serde_json::Value>(text.as_str())
                            else {
                                continue;
                            };
                            if let Some(id) = value.get("id") {
                                let reply = json!({
                                    "jsonrpc": "2.0",
                                    "id": id,
                                    "result": {"echo": value["method"]}
                                });
                                if ws.send(Message::text(reply.to_string())).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Message::Ping(payload) => {
                            let _ = ws.send(Message::Pong(payload)).await;
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
            });
        }
    });

    (format!("ws://{addr}/mcp"), connections)
}

fn transport_for(url: &str, auto_reconnect: bool) -> WebSocketTransport {
    WebSocketTransport::new(WebSocketConfig {
        url: url.to_string(),
        headers: vec![],
        auto_reconnect,
    })
}

#[tokio::test]
async fn request_round_trip_and_stats() {
    let (url, _connections) = spawn_echo_server(0).await;
    let transport = transport_for(&url, false);

    transport.connect().await.unwrap();
    assert_eq!(transport.state(), TransportState::Connected);

    let result = transport.request("tools/list", None).await.unwrap();
    assert_eq!(result["echo"], "tools/list");

    let stats = transport.stats();
    assert_eq!(stats.messages_sent, 1);
    assert_eq!(stats.messages_received, 1);
    assert!(stats.bytes_out > 0);
    assert!(stats.connected_at.is_some());

    transport.disconnect().await.unwrap();
    assert_eq!(transport.state(), TransportState::Disconnected);
}

#[tokio::test]
async fn concurrent_requests_correlate_by_id() {
    let (url, _connections) = spawn_echo_server(0).await;
    let transport = transport_for(&url, false);
    transport.connect().await.unwrap();

    let (a, b, c) = tokio::join!(
        transport.request("alpha", None),
        transport.request("beta", None),
        transport.request("gamma", None),
    );
    assert_eq!(a.unwrap()["echo"], "alpha");
    assert_eq!(b.unwrap()["echo"], "beta");
    assert_eq!(c.unwrap()["echo"], "gamma");
    assert!(transport.tracker().is_empty(), "no leaked pending entries");

    transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn dropped_connection_reconnects_with_backoff() {
    // The first post-connect epoch is dropped by the server; the second
    // serves normally.
    let (url, connections) = spawn_echo_server(1).await;
    let transport = transport_for(&url, true);
    transport.set_retry_policy(RetryPolicy {
        max_retries: 5,
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
        backoff_factor: 2.0,
    });

    let mut events = transport.subscribe();
    transport.connect().await.unwrap();

    // Wait for drop + reconnect.
    let reconnected = tokio::time::timeout(Duration::from_secs(5), async {
        let mut saw_disconnect = false;
        loop {
            match events.recv().await {
                Ok(TransportEvent::Disconnected { .. }) => saw_disconnect = true,
                Ok(TransportEvent::Connected) if saw_disconnect => break true,
                Ok(_) => {}
                Err(_) => break false,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(reconnected, "transport reconnected after the server drop");
    assert!(connections.load(Ordering::SeqCst) >= 2);

    // Same transport identity keeps working after the reconnect.
    let result = transport.request("after-reconnect", None).await.unwrap();
    assert_eq!(result["echo"], "after-reconnect");

    transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn no_reconnect_without_auto_reconnect() {
    let (url, connections) = spawn_echo_server(1).await;
    let transport = transport_for(&url, false);

    transport.connect().await.unwrap();
    // The server closes the first connection; without auto-reconnect the
    // transport settles in Disconnected.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if transport.state() == TransportState::Disconnected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("transport settles disconnected");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connections.load(Ordering::SeqCst), 1, "no second connect");
}

#[tokio::test]
async fn request_timeout_frees_the_pending_entry() {
    // A server that accepts but never answers requests.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                // Swallow everything; answer pings only.
                while let Some(Ok(frame)) = ws.next().await {
                    if let Message::Ping(payload) = frame {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                }
            });
        }
    });

    let transport = transport_for(&format!("ws://{addr}/mcp"), false);
    transport.connect().await.unwrap();
    transport.set_timeout(Duration::from_millis(100));

    let before = transport.tracker().len();
    let err = transport.request("slow-op", Some(json!({"delay": 1000}))).await;
    assert!(matches!(
        err.unwrap_err(),
        deechat_mcp_transport::TransportError::Timeout
    ));
    assert_eq!(transport.tracker().len(), before);

    transport.disconnect().await.unwrap();
}
