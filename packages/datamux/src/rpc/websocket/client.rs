use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::WS_PATH;
use crate::error::{DataMuxError, Result};
use crate::rpc::{create_codec, RpcClient, RpcCodec, CODEC_HEADER};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket client negotiating `codec` with the server
pub struct WebSocketClient {
    codec: String,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocketClient {
    pub fn new(codec: &str) -> Self {
        Self {
            codec: codec.to_string(),
            tasks: Vec::new(),
        }
    }

    pub fn codec(&self) -> &str {
        &self.codec
    }
}

#[async_trait]
impl RpcClient for WebSocketClient {
    fn name(&self) -> &'static str {
        "websocket"
    }

    async fn connect(
        &mut self,
        host: &str,
        port: u16,
        incoming: mpsc::UnboundedSender<(String, Value)>,
    ) -> Result<mpsc::UnboundedSender<(String, Value)>> {
        let encoder = create_codec(&self.codec)?;
        let decoder = create_codec(&self.codec)?;

        let url = format!("ws://{}:{}{}", host, port, WS_PATH);
        info!("Connecting to {} (codec={})", url, self.codec);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| DataMuxError::Transport(format!("Invalid server address: {}", e)))?;
        let codec = HeaderValue::from_str(&self.codec)
            .map_err(|e| DataMuxError::Transport(format!("Invalid codec name: {}", e)))?;
        request.headers_mut().insert(CODEC_HEADER, codec);

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|e| DataMuxError::Transport(format!("Failed to connect to {}: {}", url, e)))?;
        let (write, read) = ws_stream.split();

        let (outgoing, rx) = mpsc::unbounded_channel::<(String, Value)>();
        self.tasks.push(tokio::spawn(write_task(write, rx, encoder)));
        self.tasks.push(tokio::spawn(read_task(read, incoming, decoder)));

        info!("Connected to {}", url);
        Ok(outgoing)
    }

    async fn disconnect(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("Disconnected");
    }
}

impl Drop for WebSocketClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// WebSocket write task
async fn write_task(
    mut write: futures_util::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<(String, Value)>,
    mut encoder: Box<dyn RpcCodec>,
) {
    while let Some((topic, content)) = rx.recv().await {
        let frames = match encoder.encode(&topic, &content) {
            Ok(frames) => frames,
            Err(e) => {
                error!("Failed to encode '{}': {}", topic, e);
                continue;
            }
        };
        for frame in frames {
            if let Err(e) = write.send(Message::binary(frame)).await {
                error!("Failed to send WebSocket message: {}", e);
                return;
            }
        }
    }
    let _ = write.send(Message::Close(None)).await;
    debug!("WebSocket write task ended");
}

/// WebSocket read task
async fn read_task(
    mut read: futures_util::stream::SplitStream<WsStream>,
    incoming: mpsc::UnboundedSender<(String, Value)>,
    mut decoder: Box<dyn RpcCodec>,
) {
    while let Some(msg) = read.next().await {
        let payload = match msg {
            Ok(Message::Binary(data)) => data.to_vec(),
            Ok(Message::Text(text)) => text.as_str().as_bytes().to_vec(),
            Ok(Message::Close(_)) => {
                info!("WebSocket closed by server");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                error!("WebSocket error: {}", e);
                break;
            }
        };
        match decoder.decode(&payload) {
            Ok(Some(pair)) => {
                if incoming.send(pair).is_err() {
                    break;
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Dropped undecodable frame: {}", e),
        }
    }
    debug!("WebSocket read task ended");
}
