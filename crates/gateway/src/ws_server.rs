//! WebSocket endpoint using Axum.
//!
//! Per connection:
//! - a read loop (this task) decoding frames
//! - a writer task draining the connection's outbound queue into the socket
//! - a dispatcher task handing decoded messages to the publisher in order,
//!   NACKing failures back to the sender

use crate::identity::extract_identity;
use crate::protocol::{Message, RecipientId};
use crate::publisher::FanoutPublisher;
use crate::registry::{Connection, ConnectionRegistry, OUTBOUND_BUFFER_SIZE};
use axum::{
    extract::{
        ws::{self, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures::{Sink, SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

/// How long the writer gets to flush the close frame.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-connection endpoint settings.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Inbound messages queued per connection before reads pause.
    pub inbound_queue: usize,
    /// Outbound frames queued per connection before sends fail.
    pub outbound_queue: usize,
    /// Keepalive ping interval.
    pub ping_interval: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            inbound_queue: 64,
            outbound_queue: OUTBOUND_BUFFER_SIZE,
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Shared application state.
pub struct AppState {
    pub instance_id: String,
    pub registry: Arc<ConnectionRegistry>,
    pub publisher: Arc<FanoutPublisher>,
    pub config: EndpointConfig,
}

/// Create the WebSocket router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "instance": state.instance_id,
        "connections": state.registry.connection_count(),
    }))
}

/// WebSocket upgrade handler. Rejects callers without a usable identity.
async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(uid) = extract_identity(&headers, &query) else {
        warn!("Rejecting WebSocket upgrade without a valid uid");
        return (StatusCode::UNAUTHORIZED, "missing or invalid uid").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, uid))
}

/// What the read loop does after a frame.
#[derive(Debug, PartialEq)]
pub enum FrameAction {
    /// Keep reading.
    Continue,
    /// Hand the message to the publisher.
    Dispatch(Message),
    /// Close the connection.
    Close,
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, uid: RecipientId) {
    let (ws_tx, mut ws_rx) = socket.split();

    let (tx, rx) = mpsc::channel::<ws::Message>(state.config.outbound_queue);
    let conn = Arc::new(Connection::new(uid, tx));
    state.registry.put(uid, conn.clone());

    counter!("gateway_connections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.connection_count() as f64);
    info!("Client {} connected (connection {})", uid, conn.id);

    let mut send_task = tokio::spawn(write_loop(conn.clone(), rx, ws_tx));

    let (dispatch_tx, dispatch_rx) = mpsc::channel::<Message>(state.config.inbound_queue);
    tokio::spawn(dispatch_loop(state.clone(), conn.clone(), dispatch_rx));

    let mut ping_interval = interval(state.config.ping_interval);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping_interval.reset();

    loop {
        tokio::select! {
            biased;

            // Superseded, reaped as stale, or a failed write
            _ = conn.closed() => {
                debug!("Connection {} closed by the server", conn.id);
                break;
            }

            frame = ws_rx.next() => {
                match frame {
                    Some(Ok(frame)) => match handle_frame(&conn, frame) {
                        FrameAction::Continue => {}
                        FrameAction::Dispatch(msg) => {
                            // Bounded: a slow publisher pauses reads for this connection.
                            if dispatch_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        FrameAction::Close => break,
                    },
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", uid, e);
                        break;
                    }
                    None => break,
                }
            }

            _ = ping_interval.tick() => {
                if !conn.send_raw(ws::Message::Ping(Bytes::new())) {
                    debug!("Ping to {} not queued", uid);
                }
            }
        }
    }

    // Cleanup. The dispatcher drains what is already queued, then exits.
    drop(dispatch_tx);
    state.registry.delete_if_current(uid, conn.id);
    conn.close();
    if tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }

    counter!("gateway_disconnections_total").increment(1);
    gauge!("gateway_active_connections").set(state.registry.connection_count() as f64);
    info!("Client {} disconnected (connection {})", uid, conn.id);
}

/// Drain a connection's outbound queue into the socket.
///
/// Stops after writing a close frame. A failed socket write closes the
/// connection, which ends its read loop and unregisters it.
pub async fn write_loop<S>(conn: Arc<Connection>, mut rx: mpsc::Receiver<ws::Message>, mut sink: S)
where
    S: Sink<ws::Message> + Unpin,
    S::Error: std::fmt::Debug,
{
    while let Some(frame) = rx.recv().await {
        let closing = matches!(frame, ws::Message::Close(_));
        if let Err(e) = sink.send(frame).await {
            warn!("Write to {} failed: {:?}", conn.recipient, e);
            conn.close();
            break;
        }
        if closing {
            break;
        }
    }
}

/// Decide what to do with one inbound frame.
///
/// Malformed payloads are logged and ignored: no NACK, the connection stays
/// open.
pub fn handle_frame(conn: &Connection, frame: ws::Message) -> FrameAction {
    let decoded = match frame {
        ws::Message::Text(text) => serde_json::from_str::<Message>(text.as_str()),
        ws::Message::Binary(data) => serde_json::from_slice::<Message>(&data),
        // The socket answers pings itself.
        ws::Message::Ping(_) | ws::Message::Pong(_) => {
            conn.update_ping();
            return FrameAction::Continue;
        }
        ws::Message::Close(_) => return FrameAction::Close,
    };

    match decoded {
        Ok(msg) => FrameAction::Dispatch(msg),
        Err(e) => {
            warn!("Ignoring malformed message from {}: {}", conn.recipient, e);
            counter!("gateway_malformed_frames_total").increment(1);
            FrameAction::Continue
        }
    }
}

/// Publish a connection's messages one at a time, in arrival order.
pub async fn dispatch_loop(
    state: Arc<AppState>,
    conn: Arc<Connection>,
    mut inbound: mpsc::Receiver<Message>,
) {
    while let Some(msg) = inbound.recv().await {
        counter!("gateway_messages_received_total").increment(1);

        if let Err(e) = state.publisher.receive(conn.recipient, &msg).await {
            warn!(
                "Receive failed for seq '{}' from {}: {}",
                msg.seq, conn.recipient, e
            );
            counter!("gateway_nacks_total").increment(1);
            if let Err(e) = conn.send(&Message::nack(msg.seq.clone())) {
                warn!("Failed to send NACK for seq '{}' to {}: {}", msg.seq, conn.recipient, e);
            }
        }
    }
    debug!("Dispatcher for connection {} stopped", conn.id);
}

/// Periodically close connections that stopped answering pings.
pub async fn run_stale_reaper(
    registry: Arc<ConnectionRegistry>,
    every: Duration,
    stale_after: Duration,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = ticker.tick() => {
                let removed = registry.cleanup_stale(stale_after.as_millis() as i64);
                if removed > 0 {
                    info!("Reaped {} stale connections", removed);
                    gauge!("gateway_active_connections").set(registry.connection_count() as f64);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatewayError, Result};
    use crate::membership::{MembershipResolver, StaticMembership};
    use crate::publisher::PublisherConfig;
    use async_trait::async_trait;
    use event_log::MemoryLog;

    struct BrokenMembership;

    #[async_trait]
    impl MembershipResolver for BrokenMembership {
        async fn resolve_recipients(&self, _channel_id: i64) -> Result<Vec<RecipientId>> {
            Err(GatewayError::Membership("roster down".to_string()))
        }
    }

    fn state(log: &MemoryLog, members: Arc<dyn MembershipResolver>) -> Arc<AppState> {
        Arc::new(AppState {
            instance_id: "gateway-test".to_string(),
            registry: Arc::new(ConnectionRegistry::new()),
            publisher: Arc::new(FanoutPublisher::new(
                Arc::new(log.clone()),
                members,
                PublisherConfig::default(),
            )),
            config: EndpointConfig::default(),
        })
    }

    fn connection(uid: RecipientId) -> (Arc<Connection>, mpsc::Receiver<ws::Message>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(Connection::new(uid, tx)), rx)
    }

    #[test]
    fn test_malformed_frame_is_ignored() {
        let (conn, mut rx) = connection(1);

        let action = handle_frame(&conn, ws::Message::Text("{\"Seq\": ".into()));
        assert_eq!(action, FrameAction::Continue);
        assert!(rx.try_recv().is_err());
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_text_and_binary_frames_decode() {
        let (conn, _rx) = connection(1);
        let json = r#"{"Seq":"s1","Type":"text","Content":"hi","Cid":42}"#;

        let expected = Message {
            seq: "s1".to_string(),
            kind: "text".to_string(),
            content: "hi".to_string(),
            cid: 42,
            ..Default::default()
        };
        assert_eq!(
            handle_frame(&conn, ws::Message::Text(json.into())),
            FrameAction::Dispatch(expected.clone())
        );
        assert_eq!(
            handle_frame(&conn, ws::Message::Binary(Bytes::from_static(json.as_bytes()))),
            FrameAction::Dispatch(expected)
        );
    }

    #[test]
    fn test_close_frame_closes() {
        let (conn, _rx) = connection(1);
        assert_eq!(handle_frame(&conn, ws::Message::Close(None)), FrameAction::Close);
    }

    #[test]
    fn test_ping_refreshes_timestamp_without_manual_pong() {
        let (conn, mut rx) = connection(1);
        let before = conn.last_ping_time();
        std::thread::sleep(Duration::from_millis(5));

        let action = handle_frame(&conn, ws::Message::Ping(Bytes::from_static(b"p")));
        assert_eq!(action, FrameAction::Continue);
        assert!(conn.last_ping_time() > before);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_write_failure_closes_connection() {
        let (tx, rx) = mpsc::channel(8);
        let conn = Arc::new(Connection::new(1, tx));
        let (sink, sink_rx) = futures::channel::mpsc::channel::<ws::Message>(1);
        drop(sink_rx);

        let writer = tokio::spawn(write_loop(conn.clone(), rx, sink));
        conn.send(&Message::default()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(conn.is_closed());
        assert!(conn.send(&Message::default()).is_err());
    }

    #[tokio::test]
    async fn test_writer_stops_after_close_frame() {
        let (tx, rx) = mpsc::channel(8);
        let conn = Arc::new(Connection::new(1, tx));
        let (sink, mut written) = futures::channel::mpsc::channel::<ws::Message>(8);

        let writer = tokio::spawn(write_loop(conn.clone(), rx, sink));
        conn.send(&Message::nack("s1")).unwrap();
        conn.close();

        tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(written.next().await, Some(ws::Message::Text(_))));
        assert!(matches!(written.next().await, Some(ws::Message::Close(None))));
        assert!(written.next().await.is_none());
    }

    #[tokio::test]
    async fn test_failed_receive_sends_nack() {
        let log = MemoryLog::new(1);
        let state = state(&log, Arc::new(BrokenMembership));
        let (conn, mut rx) = connection(1);
        let (tx, inbound) = mpsc::channel(4);

        let msg = Message {
            seq: "s7".to_string(),
            kind: "text".to_string(),
            cid: 42,
            ..Default::default()
        };
        tx.send(msg).await.unwrap();
        drop(tx);
        dispatch_loop(state, conn, inbound).await;

        match rx.try_recv().unwrap() {
            ws::Message::Text(text) => {
                let nack: Message = serde_json::from_str(text.as_str()).unwrap();
                assert_eq!(nack, Message::nack("s7"));
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(log.records("im_events").is_empty());
    }

    #[tokio::test]
    async fn test_successful_receive_sends_nothing_back() {
        let log = MemoryLog::new(1);
        let state = state(&log, Arc::new(StaticMembership::new(vec![1, 2])));
        let (conn, mut rx) = connection(1);
        let (tx, inbound) = mpsc::channel(4);

        tx.send(Message {
            seq: "s1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        drop(tx);
        dispatch_loop(state, conn, inbound).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(log.records("im_events").len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_preserves_sender_order() {
        let log = MemoryLog::new(4);
        let state = state(&log, Arc::new(StaticMembership::new(vec![1, 2])));
        let (conn, _rx) = connection(1);
        let (tx, inbound) = mpsc::channel(4);

        let worker = tokio::spawn(dispatch_loop(state, conn, inbound));
        for i in 0..10 {
            tx.send(Message {
                seq: format!("s{}", i),
                ..Default::default()
            })
            .await
            .unwrap();
        }
        drop(tx);
        worker.await.unwrap();

        let seqs: Vec<String> = log
            .records("im_events")
            .into_iter()
            .map(|r| serde_json::from_slice::<crate::protocol::Event>(&r.payload).unwrap().msg.seq)
            .collect();
        let expected: Vec<String> = (0..10).map(|i| format!("s{}", i)).collect();
        assert_eq!(seqs, expected);
    }
}
