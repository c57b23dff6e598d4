use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use super::WS_PATH;
use crate::error::{DataMuxError, Result};
use crate::rpc::{create_codec, ConnectionId, Outbound, RpcServer, ServerEvent, CODEC_HEADER, DEFAULT_CODEC};

type Connections = Arc<RwLock<HashMap<ConnectionId, mpsc::UnboundedSender<(String, Value)>>>>;

/// Shared state of the websocket routes
#[derive(Clone)]
struct ServerState {
    events: mpsc::UnboundedSender<ServerEvent>,
    connections: Connections,
    next_id: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

#[derive(Debug, Default)]
pub struct WebSocketServer;

impl WebSocketServer {
    pub fn new() -> Self {
        Self
    }

    fn router(state: ServerState) -> Router {
        Router::new()
            .route("/", get(health_check))
            .route(WS_PATH, get(handle_websocket))
            .fallback(not_found)
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

#[async_trait]
impl RpcServer for WebSocketServer {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn serve(
        &self,
        listener: TcpListener,
        events: mpsc::UnboundedSender<ServerEvent>,
        outbound: mpsc::UnboundedReceiver<Outbound>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let state = ServerState {
            events,
            connections: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            shutdown: shutdown.clone(),
        };
        tokio::spawn(demux(outbound, state.connections.clone()));

        if let Ok(addr) = listener.local_addr() {
            info!("WebSocket endpoint: ws://{}{}", addr, WS_PATH);
        }
        let app = Self::router(state);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .map_err(|e| DataMuxError::Transport(e.to_string()))
    }
}

/// Route each outbound frame to the connection it is addressed to.
async fn demux(mut outbound: mpsc::UnboundedReceiver<Outbound>, connections: Connections) {
    while let Some(msg) = outbound.recv().await {
        let tx = connections.read().get(&msg.conn).cloned();
        match tx {
            Some(tx) => {
                if let Err(mpsc::error::SendError((topic, _))) = tx.send((msg.topic, msg.content)) {
                    debug!("Connection {} is gone, dropping '{}'", msg.conn, topic);
                }
            }
            None => debug!("No connection {}, dropping '{}'", msg.conn, msg.topic),
        }
    }
    debug!("Outbound demux ended");
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Handle WebSocket upgrade, rejecting unknown codecs before upgrading
async fn handle_websocket(ws: WebSocketUpgrade, headers: HeaderMap, State(state): State<ServerState>) -> Response {
    let codec_name = headers
        .get(CODEC_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(DEFAULT_CODEC)
        .to_string();
    if let Err(e) = create_codec(&codec_name) {
        warn!("Rejected connection: {}", e);
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state, codec_name))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, state: ServerState, codec_name: String) {
    let (mut encoder, mut decoder) = match (create_codec(&codec_name), create_codec(&codec_name)) {
        (Ok(e), Ok(d)) => (e, d),
        _ => return,
    };
    let conn = state.next_id.fetch_add(1, Ordering::SeqCst);
    let (tx, mut rx) = mpsc::unbounded_channel::<(String, Value)>();
    state.connections.write().insert(conn, tx);
    info!("Connection {} established (codec={})", conn, codec_name);

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some((topic, content)) = rx.recv().await {
            let frames = match encoder.encode(&topic, &content) {
                Ok(frames) => frames,
                Err(e) => {
                    error!("Failed to encode '{}': {}", topic, e);
                    continue;
                }
            };
            for frame in frames {
                if let Err(e) = sender.send(Message::Binary(frame.into())).await {
                    debug!("Failed to send frame: {}", e);
                    return;
                }
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let events = state.events.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            let payload = match msg {
                Ok(Message::Binary(data)) => data.to_vec(),
                Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!("WebSocket error on connection {}: {}", conn, e);
                    break;
                }
            };
            match decoder.decode(&payload) {
                Ok(Some((topic, content))) => {
                    if events.send(ServerEvent::Request { topic, content, conn }).is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("Dropped undecodable frame on connection {}: {}", conn, e),
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
        _ = state.shutdown.cancelled() => {
            send_task.abort();
            recv_task.abort();
        }
    }

    state.connections.write().remove(&conn);
    let _ = state.events.send(ServerEvent::Closed(conn));
    info!("Connection {} terminated", conn);
}
