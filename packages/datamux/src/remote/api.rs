use crossbeam::channel::{self, RecvTimeoutError, Sender};
use dfds::{Attrs, Collection, Node, Stream};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::StreamRequest;
use crate::api::{DataMuxApi, StreamAck};
use crate::error::{DataMuxError, Result};
use crate::message::Message;
use crate::queue::Queue;
use crate::reader::StreamOptions;
use crate::rpc::{self, CodecError, RpcClient};
use crate::transform::{Transform, TransformSpec};
use crate::util;

/// Time to wait for the reply to a request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(1);

/// Sink of one stream, emptied once its end of stream was delivered
///
/// Held locked while a frame is delivered so that the end of stream is put
/// exactly once, whether the server or `stop_task` ends the stream.
type SinkSlot = Arc<Mutex<Option<Queue>>>;

/// Take the sink out of `slot` and end its stream, unless that already happened.
fn close_slot(handle: &str, slot: &SinkSlot) {
    let sink = match slot.try_lock_for(DELIVERY_TIMEOUT) {
        Some(mut guard) => guard.take(),
        None => {
            warn!("Stream {} is still delivering, not ending it", handle);
            return;
        }
    };
    if let Some(sink) = sink {
        if sink.put_timeout(Message::Eof, DELIVERY_TIMEOUT).is_err() {
            warn!("Could not end stream {}", handle);
        }
    }
}

/// Where incoming frames go
#[derive(Default)]
struct Routes {
    /// Reply slot per request topic
    pending: HashMap<String, Sender<Value>>,
    /// Sink per stream handle
    sinks: HashMap<String, SinkSlot>,
    /// Frames that arrived before their handle was acknowledged
    early: HashMap<String, Vec<Value>>,
    /// Handles that already delivered their end of stream
    closed: HashSet<String>,
    disconnected: bool,
}

impl Routes {
    /// Start delivering `handle` into `sink`, flushing anything that raced the ack.
    fn register(&mut self, handle: &str, sink: &Queue) {
        for content in self.early.remove(handle).unwrap_or_default() {
            let msg = Message::from_content(content);
            let eof = msg.is_eof();
            if sink.put(msg).is_err() {
                warn!("Sink of {} is unassigned", handle);
                return;
            }
            if eof {
                self.closed.insert(handle.to_string());
                return;
            }
        }
        if self.disconnected {
            let _ = sink.put_timeout(Message::Eof, DELIVERY_TIMEOUT);
            return;
        }
        self.sinks
            .insert(handle.to_string(), Arc::new(Mutex::new(Some(sink.clone()))));
    }
}

/// [`DataMuxApi`] backed by a remote DataMux server
///
/// Calls block the caller until the server replies. Streamed records are
/// routed by their handle into the sink given when the stream was requested.
pub struct RemoteApi {
    client: Mutex<Option<Box<dyn RpcClient>>>,
    outgoing: mpsc::UnboundedSender<(String, Value)>,
    routes: Arc<Mutex<Routes>>,
    request_lock: Mutex<()>,
    timeout: Duration,
    runtime: Option<Runtime>,
}

impl RemoteApi {
    /// Connect to the server at `host:port` using the named transport and codec.
    pub fn connect(rpc_name: &str, codec: &str, host: &str, port: u16) -> Result<Self> {
        let mut client = rpc::create_client(rpc_name, codec)?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("datamux-client")
            .enable_all()
            .build()
            .map_err(DataMuxError::Io)?;

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = channel::bounded(1);
        let host = host.to_string();
        runtime.spawn(async move {
            let result = client.connect(&host, port, incoming_tx).await;
            let _ = done_tx.send((result, client));
        });
        let (result, client) = match done_rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(done) => done,
            Err(_) => {
                runtime.shutdown_background();
                return Err(DataMuxError::Transport(format!(
                    "Connection not established within {:?}",
                    CONNECT_TIMEOUT
                )));
            }
        };
        let outgoing = match result {
            Ok(outgoing) => outgoing,
            Err(e) => {
                runtime.shutdown_background();
                return Err(e);
            }
        };

        let routes = Arc::new(Mutex::new(Routes::default()));
        {
            let routes = routes.clone();
            std::thread::Builder::new()
                .name("datamux-dispatch".to_string())
                .spawn(move || dispatch(incoming_rx, routes))
                .map_err(DataMuxError::Io)?;
        }

        Ok(Self {
            client: Mutex::new(Some(client)),
            outgoing,
            routes,
            request_lock: Mutex::new(()),
            timeout: REQUEST_TIMEOUT,
            runtime: Some(runtime),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        !self.routes.lock().disconnected
    }

    /// Send `content` on `topic` and wait for the reply on the same topic.
    pub fn request(&self, topic: &str, content: Value) -> Result<Value> {
        let _serial = self.request_lock.lock();
        let (tx, rx) = channel::bounded(1);
        {
            let mut routes = self.routes.lock();
            if routes.disconnected {
                return Err(DataMuxError::Transport("Connection closed".to_string()));
            }
            routes.pending.insert(topic.to_string(), tx);
        }
        debug!(">: {}", topic);
        if self.outgoing.send((topic.to_string(), content)).is_err() {
            self.routes.lock().pending.remove(topic);
            return Err(DataMuxError::Transport("Connection closed".to_string()));
        }
        let reply = rx.recv_timeout(self.timeout).map_err(|e| {
            self.routes.lock().pending.remove(topic);
            match e {
                RecvTimeoutError::Timeout => {
                    DataMuxError::Transport(format!("No reply to '{}' within {:?}", topic, self.timeout))
                }
                RecvTimeoutError::Disconnected => DataMuxError::Transport("Connection closed".to_string()),
            }
        })?;
        if let Some(error) = reply.get("error").and_then(Value::as_str) {
            return Err(DataMuxError::Remote(error.to_string()));
        }
        Ok(reply)
    }

    fn call<T: DeserializeOwned>(&self, topic: &str, content: Value) -> Result<T> {
        Ok(serde_json::from_value(self.request(topic, content)?)?)
    }

    fn stream(&self, topic: &str, request: StreamRequest, sink: &Queue) -> Result<StreamAck> {
        let ack: StreamAck = self.call(topic, serde_json::to_value(&request)?)?;
        match &ack.randseq {
            Some(handle) => self.routes.lock().register(handle, sink),
            None => warn!("'{}' was acknowledged without a handle", topic),
        }
        Ok(ack)
    }

    fn transform_spec(topic: &str, transform: &Transform) -> Result<Option<TransformSpec>> {
        match transform {
            Transform::Identity => Ok(None),
            other => other.spec().map(Some).ok_or_else(|| {
                DataMuxError::Codec(CodecError::Encode {
                    topic: topic.to_string(),
                    reason: "custom transforms cannot be sent to a server".to_string(),
                })
            }),
        }
    }
}

impl DataMuxApi for RemoteApi {
    fn list_collections(&self) -> Result<Vec<Collection>> {
        self.call(rpc::TOPIC_LIST_COLLECTIONS, json!({}))
    }

    fn list_collection_streams(&self, collection_id: &str) -> Result<Vec<Stream>> {
        self.call(
            rpc::TOPIC_LIST_COLLECTION_STREAMS,
            json!({ "collection_id": collection_id }),
        )
    }

    fn replay_collection_stream(
        &self,
        collection_id: &str,
        stream_id: &str,
        attrs: &Attrs,
        sink: &Queue,
        transform: Transform,
        options: StreamOptions,
    ) -> Result<StreamAck> {
        let topic = rpc::TOPIC_REPLAY_COLLECTION_STREAM;
        let request = StreamRequest {
            collection_id: Some(collection_id.to_string()),
            node_id: None,
            stream_id: stream_id.to_string(),
            attrs: attrs.clone(),
            transform: Self::transform_spec(topic, &transform)?,
            rate_limit: options.rate_limit,
            strict_time: options.strict_time,
            use_relative_ts: options.use_relative_ts,
        };
        self.stream(topic, request, sink)
    }

    fn publish_collection_stream(&self, collection_id: &str, stream_id: &str, attrs: &Attrs) -> Result<StreamAck> {
        self.call(
            rpc::TOPIC_PUBLISH_COLLECTION_STREAM,
            json!({ "collection_id": collection_id, "stream_id": stream_id, "attrs": attrs }),
        )
    }

    fn list_live_nodes(&self) -> Result<Vec<Node>> {
        self.call(rpc::TOPIC_LIST_LIVE_NODES, json!({}))
    }

    fn list_live_streams(&self, node_id: &str) -> Result<Vec<Stream>> {
        self.call(rpc::TOPIC_LIST_LIVE_STREAMS, json!({ "node_id": node_id }))
    }

    fn proxy_live_stream(
        &self,
        node_id: &str,
        stream_id: &str,
        attrs: &Attrs,
        sink: &Queue,
        transform: Transform,
        options: StreamOptions,
    ) -> Result<StreamAck> {
        let topic = rpc::TOPIC_READ_LIVE_STREAM;
        let request = StreamRequest {
            collection_id: None,
            node_id: Some(node_id.to_string()),
            stream_id: stream_id.to_string(),
            attrs: attrs.clone(),
            transform: Self::transform_spec(topic, &transform)?,
            rate_limit: options.rate_limit,
            strict_time: options.strict_time,
            use_relative_ts: options.use_relative_ts,
        };
        self.stream(topic, request, sink)
    }

    fn stop_task(&self, randseq: &str) -> Result<StreamAck> {
        let ack = self.call(rpc::TOPIC_STOP_TASK, json!({ "randseq": randseq }))?;
        let slot = {
            let mut routes = self.routes.lock();
            routes.early.remove(randseq);
            routes.closed.insert(randseq.to_string());
            routes.sinks.remove(randseq)
        };
        // later frames of the handle are dropped; the sink still sees its EOF
        if let Some(slot) = slot {
            close_slot(randseq, &slot);
        }
        Ok(ack)
    }
}

impl Drop for RemoteApi {
    fn drop(&mut self) {
        // dropping the client aborts its transport tasks, which ends the dispatcher
        self.client.lock().take();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        info!("Remote API closed");
    }
}

/// Route incoming frames to reply slots and stream sinks.
fn dispatch(mut incoming: mpsc::UnboundedReceiver<(String, Value)>, routes: Arc<Mutex<Routes>>) {
    while let Some((topic, content)) = incoming.blocking_recv() {
        if !util::is_data_topic(&topic) {
            match routes.lock().pending.remove(&topic) {
                Some(reply) => {
                    let _ = reply.send(content);
                }
                None => warn!("Unexpected reply on '{}'", topic),
            }
            continue;
        }

        let slot = {
            let mut routes = routes.lock();
            if routes.closed.contains(&topic) {
                continue;
            }
            match routes.sinks.get(&topic) {
                Some(slot) => slot.clone(),
                None => {
                    routes.early.entry(topic).or_default().push(content);
                    continue;
                }
            }
        };
        let msg = Message::from_content(content);
        let eof = msg.is_eof();
        {
            let mut guard = slot.lock();
            let Some(sink) = guard.as_ref() else {
                // stopped while the frame was in flight
                continue;
            };
            if sink.put(msg).is_err() {
                warn!("Sink of {} is unassigned", topic);
            }
            if eof {
                guard.take();
            }
        }
        if eof {
            let mut routes = routes.lock();
            routes.sinks.remove(&topic);
            routes.closed.insert(topic);
        }
    }

    // the connection is gone: fail waiting requests and end open streams
    let slots: Vec<(String, SinkSlot)> = {
        let mut routes = routes.lock();
        routes.disconnected = true;
        routes.pending.clear();
        routes.sinks.drain().collect()
    };
    for (handle, slot) in slots {
        close_slot(&handle, &slot);
    }
    debug!("Dispatcher ended");
}
