// Local DataMux API
//
// Facade over the collection manager (recorded data) and the proxy manager
// (live data). Every attach-like call is identified by a handle of the form
// `d_XXXXX`; the handle keys the cancellation flag that `stop_task` sets.
//
//   replay_collection_stream ─┐
//   proxy_live_stream ────────┼─> Reader::attach(flag = context[handle]) ─> sink
//   publish_collection_stream ┘   (publish writes to the live bus instead)

use dfds::{Attrs, Collection, Config, Node, Stream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::collection::CollectionManager;
use crate::error::{DataMuxError, Result};
use crate::live::LiveBus;
use crate::proxy::{Proxy, ProxyManager};
use crate::queue::{Flag, Queue};
use crate::reader::{spawn_worker_with, AttachRequest, Reader, StreamOptions};
use crate::task::{Task, TaskKind};
use crate::transform::Transform;
use crate::util;

/// Acknowledgement of an API call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamAck {
    pub status: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub randseq: Option<String>,
}

impl StreamAck {
    pub fn ok() -> Self {
        Self {
            status: true,
            randseq: None,
        }
    }

    pub fn with_handle(randseq: String) -> Self {
        Self {
            status: true,
            randseq: Some(randseq),
        }
    }
}

/// Operations shared by the local and the remote API
pub trait DataMuxApi: Send + Sync {
    fn list_collections(&self) -> Result<Vec<Collection>>;

    fn list_collection_streams(&self, collection_id: &str) -> Result<Vec<Stream>>;

    fn replay_collection_stream(
        &self,
        collection_id: &str,
        stream_id: &str,
        attrs: &Attrs,
        sink: &Queue,
        transform: Transform,
        options: StreamOptions,
    ) -> Result<StreamAck>;

    fn publish_collection_stream(&self, collection_id: &str, stream_id: &str, attrs: &Attrs) -> Result<StreamAck>;

    fn list_live_nodes(&self) -> Result<Vec<Node>>;

    fn list_live_streams(&self, node_id: &str) -> Result<Vec<Stream>>;

    fn proxy_live_stream(
        &self,
        node_id: &str,
        stream_id: &str,
        attrs: &Attrs,
        sink: &Queue,
        transform: Transform,
        options: StreamOptions,
    ) -> Result<StreamAck>;

    fn stop_task(&self, randseq: &str) -> Result<StreamAck>;

    /// Source task streaming `stream` (as listed by this API) into its target.
    fn attach(self: Arc<Self>, stream: &Stream, transform: Transform, options: StreamOptions) -> Result<ApiStreamer>
    where
        Self: Sized + 'static,
    {
        ApiStreamer::new(self, stream, transform, options)
    }
}

/// In-process implementation of [`DataMuxApi`]
pub struct Api {
    config: Config,
    collections: Arc<CollectionManager>,
    proxies: Arc<ProxyManager>,
    bus: LiveBus,
    /// Flag per running attach, dropped when it is stopped or ends
    context: Arc<Mutex<HashMap<String, Flag>>>,
}

impl Api {
    /// API over `config` with the built-in live plug-ins
    pub fn new(config: Config) -> Self {
        let bus = LiveBus::new();
        let proxies = ProxyManager::with_builtins(bus.clone());
        Self::with_proxies(config, bus, proxies)
    }

    /// API with an explicit plug-in set publishing onto `bus`
    pub fn with_proxies(config: Config, bus: LiveBus, proxies: ProxyManager) -> Self {
        tracing::info!(
            "DataMux API: data_dir={}, meta_dir={}",
            config.data_dir.display(),
            config.meta_dir.display()
        );
        Self {
            collections: Arc::new(CollectionManager::with_bus(config.clone(), bus.clone())),
            proxies: Arc::new(proxies),
            config,
            bus,
            context: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// API over the configuration found in the rc files
    pub fn from_rc() -> Result<Self> {
        Ok(Self::new(Config::load()?))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &LiveBus {
        &self.bus
    }

    /// Register an additional live plug-in.
    pub fn register_proxy(&self, name: &str, proxy: Proxy) {
        self.proxies.register(name, proxy);
    }

    /// Handles of the attaches still streaming
    pub fn active_handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.context.lock().keys().cloned().collect();
        handles.sort();
        handles
    }

    fn begin(&self, transform: &mut Transform) -> (String, Flag) {
        let mut context = self.context.lock();
        let mut handle = util::new_handle();
        while context.contains_key(&handle) {
            handle = util::new_handle();
        }
        transform.set_prefix(handle.as_bytes());
        let flag = Flag::new();
        context.insert(handle.clone(), flag.clone());
        (handle, flag)
    }

    fn forget(&self, handle: &str) {
        self.context.lock().remove(handle);
    }

    #[allow(clippy::too_many_arguments)]
    fn start<R>(
        &self,
        reader: Arc<R>,
        source_id: &str,
        stream_id: &str,
        attrs: &Attrs,
        sink: &Queue,
        mut transform: Transform,
        options: StreamOptions,
    ) -> Result<StreamAck>
    where
        R: Reader + ?Sized,
    {
        let (handle, flag) = self.begin(&mut transform);
        let on_exit = {
            let context = Arc::downgrade(&self.context);
            let handle = handle.clone();
            let flag = flag.clone();
            move || {
                let Some(context) = context.upgrade() else {
                    return;
                };
                let mut context = context.lock();
                // the handle may have been stopped and handed out again
                if context.get(&handle).is_some_and(|f| f.same_flag(&flag)) {
                    context.remove(&handle);
                    tracing::debug!("{} ended", handle);
                }
            }
        };
        let request = AttachRequest::new(source_id, stream_id, attrs.clone(), sink.clone())
            .with_transform(transform)
            .with_flag(flag)
            .with_options(options);
        match spawn_worker_with(reader, request, on_exit) {
            Ok(_) => {
                tracing::info!("Attached {}/{} as {}", source_id, stream_id, handle);
                Ok(StreamAck::with_handle(handle))
            }
            Err(e) => {
                self.forget(&handle);
                Err(e)
            }
        }
    }
}

impl DataMuxApi for Api {
    fn list_collections(&self) -> Result<Vec<Collection>> {
        self.collections.list_sources()
    }

    fn list_collection_streams(&self, collection_id: &str) -> Result<Vec<Stream>> {
        self.collections.list_streams(collection_id)
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
        self.collections.find_stream(collection_id, stream_id)?;
        self.start(
            self.collections.clone(),
            collection_id,
            stream_id,
            attrs,
            sink,
            transform,
            options,
        )
    }

    fn publish_collection_stream(&self, collection_id: &str, stream_id: &str, attrs: &Attrs) -> Result<StreamAck> {
        self.collections.serve(collection_id, stream_id, attrs)?;
        Ok(StreamAck::ok())
    }

    fn list_live_nodes(&self) -> Result<Vec<Node>> {
        self.proxies.setup_all();
        self.proxies.list_sources()
    }

    fn list_live_streams(&self, node_id: &str) -> Result<Vec<Stream>> {
        let owner = self.proxies.owner_of(node_id)?;
        self.proxies.setup_proxy(&owner)?;
        self.proxies.list_streams(node_id)
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
        let owner = self.proxies.owner_of(node_id)?;
        self.proxies.setup_proxy(&owner)?;
        self.start(self.proxies.clone(), node_id, stream_id, attrs, sink, transform, options)
    }

    fn stop_task(&self, randseq: &str) -> Result<StreamAck> {
        if let Some(flag) = self.context.lock().remove(randseq) {
            flag.set();
            tracing::info!("Stopped {}", randseq);
        }
        Ok(StreamAck::ok())
    }
}

/// Where an [`ApiStreamer`] reads from
#[derive(Debug, Clone, PartialEq)]
enum Route {
    Replay { collection_id: String, stream_id: String },
    Proxy { node_id: String, stream_id: String },
}

impl Route {
    fn of(stream: &Stream) -> Result<Self> {
        let mode = stream.attrs.get("mode").map(String::as_str);
        match mode {
            Some("replay") => {
                let collection_id = stream
                    .attrs
                    .get("collection")
                    .cloned()
                    .ok_or_else(|| DataMuxError::NotFound(format!("collection of '{}'", stream.name)))?;
                let stream_id = stream.attrs.get("id").cloned().unwrap_or_else(|| stream.name.clone());
                Ok(Route::Replay {
                    collection_id,
                    stream_id,
                })
            }
            Some("proxy") => {
                let node_id = stream
                    .node
                    .as_ref()
                    .map(|n| n.id.clone())
                    .ok_or_else(|| DataMuxError::NotFound(format!("node of '{}'", stream.name)))?;
                Ok(Route::Proxy {
                    node_id,
                    stream_id: stream.name.clone(),
                })
            }
            other => Err(DataMuxError::Source(format!(
                "stream '{}' has no usable mode ({:?})",
                stream.name, other
            ))),
        }
    }
}

/// Source task backed by an API attach
///
/// `start` replays or proxies the stream into `target` depending on its
/// `mode` attribute, `stop` calls `stop_task` with the returned handle.
pub struct ApiStreamer {
    name: String,
    api: Arc<dyn DataMuxApi>,
    route: Route,
    attrs: Attrs,
    transform: Transform,
    options: StreamOptions,
    target: Queue,
    handle: Option<String>,
}

impl ApiStreamer {
    pub fn new(
        api: Arc<dyn DataMuxApi>,
        stream: &Stream,
        transform: Transform,
        options: StreamOptions,
    ) -> Result<Self> {
        let route = Route::of(stream)?;
        let mut attrs = stream.attrs.clone();
        attrs.remove("mode");
        Ok(Self {
            name: format!("api-{}", stream.name),
            api,
            route,
            attrs,
            transform,
            options,
            target: Queue::new(),
            handle: None,
        })
    }

    /// Handle of the running attach
    pub fn handle(&self) -> Option<&str> {
        self.handle.as_deref()
    }
}

impl Task for ApiStreamer {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TaskKind {
        TaskKind::Source
    }

    fn target(&self) -> Option<&Queue> {
        Some(&self.target)
    }

    fn start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Err(DataMuxError::Pipeline(format!("task '{}' was already started", self.name)));
        }
        let ack = match &self.route {
            Route::Replay {
                collection_id,
                stream_id,
            } => self.api.replay_collection_stream(
                collection_id,
                stream_id,
                &self.attrs,
                &self.target,
                self.transform.clone(),
                self.options,
            )?,
            Route::Proxy { node_id, stream_id } => self.api.proxy_live_stream(
                node_id,
                stream_id,
                &self.attrs,
                &self.target,
                self.transform.clone(),
                self.options,
            )?,
        };
        self.handle = ack.randseq;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            self.api.stop_task(&handle)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::time::Duration;

    fn empty_api() -> (tempfile::TempDir, Api) {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let meta = dir.path().join("meta");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::create_dir_all(&meta).unwrap();
        let config = Config::new(data.to_string_lossy(), meta.to_string_lossy()).unwrap();
        (dir, Api::new(config))
    }

    fn stream(mode: &str) -> Stream {
        serde_json::from_value(serde_json::json!({
            "name": "Gaze",
            "frequency": 100.0,
            "fields": {},
            "index": {},
            "@node": {"id": "loopback"},
            "attrs": {"mode": mode, "collection": "demo", "id": "gaze"}
        }))
        .unwrap()
    }

    #[test]
    fn test_stop_task_is_idempotent() {
        let (_dir, api) = empty_api();
        assert_eq!(api.stop_task("d_XXXXX").unwrap(), StreamAck::ok());
        assert_eq!(api.stop_task("d_XXXXX").unwrap(), StreamAck::ok());
    }

    #[test]
    fn test_unknown_collection_is_rejected() {
        let (_dir, api) = empty_api();
        let sink = Queue::new();
        let err = api
            .replay_collection_stream("missing", "Gaze", &Attrs::new(), &sink, Transform::Identity, StreamOptions::default())
            .unwrap_err();
        assert!(matches!(err, DataMuxError::NotFound(_)));
        assert!(api.active_handles().is_empty());
        assert_eq!(sink.try_get(), None);
    }

    #[test]
    fn test_handle_is_released_at_end_of_stream() {
        let (dir, api) = empty_api();
        let meta = dir.path().join("meta");
        let data = dir.path().join("data").join("demo");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(
            meta.join("demo.collection.json"),
            serde_json::json!({
                "name": "demo",
                "streams": {"gaze": {"name": "Gaze", "frequency": 100, "fields": {"x": {"name": "x", "dtype": "f64"}}, "index": {}}},
                "groups": {},
                "pattern": "csv://rec"
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(data.join("rec.csv"), "x\n1.0\n2.0\n").unwrap();

        let sink = Queue::new();
        let ack = api
            .replay_collection_stream("demo", "gaze", &Attrs::new(), &sink, Transform::Identity, StreamOptions::unpaced())
            .unwrap();
        let handle = ack.randseq.unwrap();
        assert!(util::is_data_topic(&handle));

        let mut records = 0;
        while let Some(msg) = sink.get_timeout(Duration::from_secs(5)) {
            if msg == Message::Eof {
                break;
            }
            records += 1;
        }
        assert_eq!(records, 2);

        // the worker drops its handle right after the end of stream
        let released = (0..50).any(|_| {
            std::thread::sleep(Duration::from_millis(20));
            api.active_handles().is_empty()
        });
        assert!(released);
        assert_eq!(api.stop_task(&handle).unwrap(), StreamAck::ok());
    }

    #[test]
    fn test_unknown_node_is_rejected() {
        let (_dir, api) = empty_api();
        let nodes = api.list_live_nodes().unwrap();
        assert!(nodes.iter().any(|n| n.id == crate::proxy::LOOPBACK_ID));
        let err = api.list_live_streams("nowhere").unwrap_err();
        assert!(matches!(err, DataMuxError::UnknownSource(_)));
    }

    #[test]
    fn test_routes_from_stream_mode() {
        assert_eq!(
            Route::of(&stream("replay")).unwrap(),
            Route::Replay {
                collection_id: "demo".to_string(),
                stream_id: "gaze".to_string()
            }
        );
        assert_eq!(
            Route::of(&stream("proxy")).unwrap(),
            Route::Proxy {
                node_id: "loopback".to_string(),
                stream_id: "Gaze".to_string()
            }
        );
        assert!(Route::of(&stream("restream")).is_err());
    }
}
