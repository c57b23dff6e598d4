use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::StreamRequest;
use crate::api::{Api, DataMuxApi};
use crate::error::{DataMuxError, Result};
use crate::message::Message;
use crate::queue::{Flag, Queue};
use crate::rpc::{self, ConnectionId, Outbound, RpcServer, ServerEvent};
use crate::transform::{Enveloper, Transform, TransformRegistry, TransformSpec};

#[derive(Deserialize)]
struct CollectionQuery {
    collection_id: String,
}

#[derive(Deserialize)]
struct NodeQuery {
    node_id: String,
}

#[derive(Deserialize)]
struct PublishRequest {
    collection_id: String,
    stream_id: String,
    #[serde(default)]
    attrs: dfds::Attrs,
}

#[derive(Deserialize)]
struct StopRequest {
    randseq: String,
}

/// Serves an [`Api`] to remote clients
pub struct DataMuxServer {
    api: Arc<Api>,
    rpc: Box<dyn RpcServer>,
    transforms: TransformRegistry,
}

impl DataMuxServer {
    pub fn new(api: Arc<Api>, rpc_name: &str) -> Result<Self> {
        Ok(Self {
            api,
            rpc: rpc::create_server(rpc_name)?,
            transforms: TransformRegistry::with_builtins(),
        })
    }

    /// Transforms clients may request by name
    pub fn transforms(&self) -> &TransformRegistry {
        &self.transforms
    }

    pub async fn bind(host: &str, port: u16) -> Result<TcpListener> {
        TcpListener::bind((host, port))
            .await
            .map_err(|e| DataMuxError::Transport(format!("Cannot listen on {}:{}: {}", host, port, e)))
    }

    /// Serve requests on `listener` until `shutdown` is cancelled.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Outbound>();
        let data_q = Queue::new();

        let stop = Flag::new();
        let requeue = {
            let data_q = data_q.clone();
            let out_tx = out_tx.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("datamux-requeue".to_string())
                .spawn(move || requeue(data_q, out_tx, stop))
                .map_err(DataMuxError::Io)?
        };

        let handler = Arc::new(Handler {
            api: self.api.clone(),
            transforms: self.transforms.clone(),
            data_q,
            owned: Mutex::new(HashMap::new()),
        });
        let dispatcher = {
            let handler = handler.clone();
            tokio::spawn(async move {
                // one request at a time, in arrival order
                while let Some(event) = events_rx.recv().await {
                    let worker = handler.clone();
                    match tokio::task::spawn_blocking(move || worker.handle(event)).await {
                        Ok(Some(reply)) => {
                            if out_tx.send(reply).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => error!("Request handler failed: {}", e),
                    }
                }
            })
        };

        info!("DataMux server started (rpc={})", self.rpc.name());
        let result = self.rpc.serve(listener, events_tx, out_rx, shutdown).await;

        dispatcher.abort();
        handler.stop_all();
        stop.set();
        if requeue.join().is_err() {
            warn!("Requeue thread panicked");
        }
        info!("DataMux server stopped");
        result
    }
}

/// Move enveloped records from the shared data queue to their connection.
fn requeue(data_q: Queue, out_tx: mpsc::UnboundedSender<Outbound>, stop: Flag) {
    while !stop.is_set() {
        let msg = match data_q.get() {
            Some(msg) => msg,
            None => continue,
        };
        let env = match msg {
            Message::Envelope(env) => env,
            other => {
                warn!("Dropping a message without routing: {:?}", other);
                continue;
            }
        };
        let topic = env.prefix.as_deref().map(String::from_utf8_lossy);
        let conn = env
            .suffix
            .as_deref()
            .and_then(|s| std::str::from_utf8(s).ok())
            .and_then(|s| s.parse::<ConnectionId>().ok());
        let (topic, conn) = match (topic, conn) {
            (Some(topic), Some(conn)) => (topic.into_owned(), conn),
            _ => {
                warn!("Dropping a message with incomplete routing");
                continue;
            }
        };
        let outbound = Outbound {
            topic,
            content: env.message.to_content(),
            conn,
        };
        if out_tx.send(outbound).is_err() {
            break;
        }
    }
    debug!("Requeue thread ended");
}

struct Handler {
    api: Arc<Api>,
    transforms: TransformRegistry,
    data_q: Queue,
    /// Handles started by each connection, stopped when it closes
    owned: Mutex<HashMap<ConnectionId, Vec<String>>>,
}

impl Handler {
    fn handle(&self, event: ServerEvent) -> Option<Outbound> {
        match event {
            ServerEvent::Closed(conn) => {
                let handles = self.owned.lock().remove(&conn).unwrap_or_default();
                for handle in handles {
                    let _ = self.api.stop_task(&handle);
                }
                None
            }
            ServerEvent::Request { topic, content, conn } => {
                debug!("<: {} from {}", topic, conn);
                let content = match self.dispatch(&topic, content, conn) {
                    Ok(value) => value,
                    Err(e) => {
                        warn!("Request '{}' failed: {}", topic, e);
                        json!({ "error": e.to_string() })
                    }
                };
                Some(Outbound { topic, content, conn })
            }
        }
    }

    fn dispatch(&self, topic: &str, content: Value, conn: ConnectionId) -> Result<Value> {
        let value = match topic {
            rpc::TOPIC_LIST_COLLECTIONS => serde_json::to_value(self.api.list_collections()?)?,
            rpc::TOPIC_LIST_COLLECTION_STREAMS => {
                let query: CollectionQuery = serde_json::from_value(content)?;
                serde_json::to_value(self.api.list_collection_streams(&query.collection_id)?)?
            }
            rpc::TOPIC_REPLAY_COLLECTION_STREAM => {
                let req: StreamRequest = serde_json::from_value(content)?;
                let collection_id = req
                    .collection_id
                    .clone()
                    .ok_or_else(|| DataMuxError::Parse("missing collection_id".to_string()))?;
                let transform = self.transform(req.transform.as_ref(), conn)?;
                let ack = self.api.replay_collection_stream(
                    &collection_id,
                    &req.stream_id,
                    &req.attrs,
                    &self.data_q,
                    transform,
                    req.options(),
                )?;
                self.own(conn, ack.randseq.as_deref());
                serde_json::to_value(ack)?
            }
            rpc::TOPIC_PUBLISH_COLLECTION_STREAM => {
                let req: PublishRequest = serde_json::from_value(content)?;
                let ack = self
                    .api
                    .publish_collection_stream(&req.collection_id, &req.stream_id, &req.attrs)?;
                serde_json::to_value(ack)?
            }
            rpc::TOPIC_LIST_LIVE_NODES => serde_json::to_value(self.api.list_live_nodes()?)?,
            rpc::TOPIC_LIST_LIVE_STREAMS => {
                let query: NodeQuery = serde_json::from_value(content)?;
                serde_json::to_value(self.api.list_live_streams(&query.node_id)?)?
            }
            rpc::TOPIC_READ_LIVE_STREAM => {
                let req: StreamRequest = serde_json::from_value(content)?;
                let node_id = req
                    .node_id
                    .clone()
                    .ok_or_else(|| DataMuxError::Parse("missing node_id".to_string()))?;
                let transform = self.transform(req.transform.as_ref(), conn)?;
                let ack = self.api.proxy_live_stream(
                    &node_id,
                    &req.stream_id,
                    &req.attrs,
                    &self.data_q,
                    transform,
                    req.options(),
                )?;
                self.own(conn, ack.randseq.as_deref());
                serde_json::to_value(ack)?
            }
            rpc::TOPIC_STOP_TASK => {
                let req: StopRequest = serde_json::from_value(content)?;
                if let Some(handles) = self.owned.lock().get_mut(&conn) {
                    handles.retain(|h| h != &req.randseq);
                }
                serde_json::to_value(self.api.stop_task(&req.randseq)?)?
            }
            _ => json!({ "error": "Unknown Request" }),
        };
        Ok(value)
    }

    /// Resolve the requested transform and route its output to `conn`.
    fn transform(&self, spec: Option<&TransformSpec>, conn: ConnectionId) -> Result<Transform> {
        let inner = match spec {
            Some(spec) => self.transforms.resolve(spec)?,
            None => Transform::Identity,
        };
        Ok(Transform::Envelope(
            Enveloper::new(inner).with_suffix(conn.to_string().into_bytes()),
        ))
    }

    fn own(&self, conn: ConnectionId, handle: Option<&str>) {
        if let Some(handle) = handle {
            self.owned.lock().entry(conn).or_default().push(handle.to_string());
        }
    }

    fn stop_all(&self) {
        let owned: Vec<String> = self.owned.lock().drain().flat_map(|(_, h)| h).collect();
        for handle in owned {
            let _ = self.api.stop_task(&handle);
        }
    }
}
