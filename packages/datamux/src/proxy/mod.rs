// Live device proxies
//
// `ProxyManager` federates plug-in readers that each expose one or more
// live nodes. Plug-ins are registered by name; the built-ins are listed in
// `ProxyManager::with_builtins`. New plug-ins can be added by:
// 1. Implementing `Reader<Source = Node>`
// 2. Registering an instance with `ProxyManager::register`
//
// Every operation taking a node id is routed to the plug-in that listed the
// node in the most recent `list_sources`.

mod loopback;
#[cfg(feature = "lsl-support")]
mod lsl;

use dfds::{Attrs, Node, Stream};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use crate::error::{DataMuxError, Result};
use crate::live::LiveBus;
use crate::reader::{Emitter, Reader, State, StreamOptions};

pub use loopback::{LoopbackProxy, LOOPBACK_ID};
#[cfg(feature = "lsl-support")]
pub use lsl::LslProxy;

/// A live plug-in as stored by the manager
pub type Proxy = Arc<dyn Reader<Source = Node>>;

#[derive(Default)]
struct Routing {
    nodes: Vec<Node>,
    node_ref: Vec<String>,
    prox_ref: Vec<String>,
}

pub struct ProxyManager {
    proxies: RwLock<IndexMap<String, Proxy>>,
    routing: RwLock<Routing>,
    setup_lock: Mutex<()>,
}

impl Default for ProxyManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-attach state of the plug-in an attach was routed to
struct Routed {
    proxy: Proxy,
    state: State,
}

impl ProxyManager {
    pub fn new() -> Self {
        Self {
            proxies: RwLock::new(IndexMap::new()),
            routing: RwLock::new(Routing::default()),
            setup_lock: Mutex::new(()),
        }
    }

    /// Manager with the loopback proxy over `bus` (and LSL when enabled)
    pub fn with_builtins(bus: LiveBus) -> Self {
        let manager = Self::new();
        manager.register(LOOPBACK_ID, Arc::new(LoopbackProxy::new(bus)));
        #[cfg(feature = "lsl-support")]
        manager.register("lsl", Arc::new(LslProxy::new()));
        manager
    }

    pub fn register(&self, name: &str, proxy: Proxy) {
        tracing::info!("Loaded proxy: {}", name);
        if self.proxies.write().insert(name.to_string(), proxy).is_some() {
            tracing::warn!("Proxy '{}' was registered twice; keeping the latest", name);
        }
    }

    pub fn proxy_names(&self) -> Vec<String> {
        self.proxies.read().keys().cloned().collect()
    }

    fn proxy(&self, name: &str) -> Result<Proxy> {
        self.proxies
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DataMuxError::UnknownSource(format!("proxy '{}'", name)))
    }

    /// Set up one plug-in; repeated calls are no-ops.
    pub fn setup_proxy(&self, proxy_id: &str) -> Result<()> {
        let proxy = self.proxy(proxy_id)?;
        let _guard = self.setup_lock.lock();
        if proxy.is_setup() {
            return Ok(());
        }
        proxy.setup()?;
        tracing::info!("Proxy '{}' is set up", proxy_id);
        Ok(())
    }

    /// Set up every plug-in, logging and skipping the ones that fail.
    pub fn setup_all(&self) -> usize {
        let mut ready = 0;
        for name in self.proxy_names() {
            match self.setup_proxy(&name) {
                Ok(()) => ready += 1,
                Err(e) => tracing::warn!("Proxy '{}' is unavailable: {}", name, e),
            }
        }
        ready
    }

    /// Plug-in name owning `node_id`, refreshing the routing once on a miss.
    pub fn owner_of(&self, node_id: &str) -> Result<String> {
        let find = |routing: &Routing| {
            routing
                .node_ref
                .iter()
                .position(|n| n == node_id)
                .map(|i| routing.prox_ref[i].clone())
        };
        if let Some(owner) = find(&*self.routing.read()) {
            return Ok(owner);
        }
        self.list_sources()?;
        find(&*self.routing.read()).ok_or_else(|| DataMuxError::UnknownSource(node_id.to_string()))
    }

    fn resolve(&self, node_id: &str) -> Result<Proxy> {
        self.proxy(&self.owner_of(node_id)?)
    }
}

impl Reader for ProxyManager {
    type Source = Node;

    fn setup(&self) -> Result<()> {
        self.setup_all();
        Ok(())
    }

    fn is_setup(&self) -> bool {
        self.proxies.read().values().any(|p| p.is_setup())
    }

    fn list_sources(&self) -> Result<Vec<Node>> {
        let proxies: Vec<(String, Proxy)> = self
            .proxies
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut routing = Routing::default();
        for (name, proxy) in proxies {
            if !proxy.is_setup() {
                continue;
            }
            match proxy.list_sources() {
                Ok(nodes) => {
                    for node in nodes {
                        routing.node_ref.push(node.id.clone());
                        routing.prox_ref.push(name.clone());
                        routing.nodes.push(node);
                    }
                }
                Err(e) => tracing::warn!("Listing nodes of '{}' failed: {}", name, e),
            }
        }
        let nodes = routing.nodes.clone();
        *self.routing.write() = routing;
        Ok(nodes)
    }

    fn list_streams(&self, source_id: &str) -> Result<Vec<Stream>> {
        self.resolve(source_id)?.list_streams(source_id)
    }

    fn on_attach(&self, source_id: &str, stream_id: &str, attrs: &Attrs, emitter: &Emitter) -> Result<State> {
        let proxy = self.resolve(source_id)?;
        let state = proxy.on_attach(source_id, stream_id, attrs, emitter)?;
        Ok(Box::new(Routed { proxy, state }))
    }

    fn on_pull(&self, state: &mut State, emitter: &Emitter, options: &StreamOptions) -> Result<Option<i32>> {
        let routed = state
            .downcast_mut::<Routed>()
            .ok_or_else(|| DataMuxError::Source("unexpected proxy state".to_string()))?;
        routed.proxy.on_pull(&mut routed.state, emitter, options)
    }

    fn on_detach(&self, state: State, emitter: &Emitter) -> Result<()> {
        match state.downcast::<Routed>() {
            Ok(routed) => {
                let Routed { proxy, state } = *routed;
                proxy.on_detach(state, emitter)
            }
            Err(_) => {
                emitter.emit_eof();
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Plug-in with two nodes whose setup may fail; counts setup attempts
    struct Flaky {
        attempts: AtomicUsize,
        fail: bool,
        ready: AtomicBool,
    }

    impl Flaky {
        fn new(fail: bool) -> Self {
            Self {
                attempts: AtomicUsize::new(0),
                fail,
                ready: AtomicBool::new(false),
            }
        }
    }

    impl Reader for Flaky {
        type Source = Node;

        fn setup(&self) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(DataMuxError::Setup("driver missing".to_string()));
            }
            self.ready.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_setup(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn list_sources(&self) -> Result<Vec<Node>> {
            Ok(vec![Node::with_id("e4-001"), Node::with_id("e4-002")])
        }

        fn list_streams(&self, source_id: &str) -> Result<Vec<Stream>> {
            let stream: Stream = serde_json::from_value(serde_json::json!({
                "name": format!("bvp@{}", source_id),
                "fields": {}
            }))?;
            Ok(vec![stream])
        }

        fn on_attach(&self, _: &str, _: &str, _: &Attrs, _: &Emitter) -> Result<State> {
            Ok(Box::new(()))
        }

        fn on_pull(&self, _: &mut State, _: &Emitter, _: &StreamOptions) -> Result<Option<i32>> {
            Ok(Some(0))
        }
    }

    #[test]
    fn test_routes_by_node_id() {
        let manager = ProxyManager::with_builtins(LiveBus::new());
        let e4 = Arc::new(Flaky::new(false));
        manager.register("e4", e4.clone());
        manager.register("pupil", Arc::new(Flaky::new(true)));

        assert_eq!(manager.setup_all(), 2);
        manager.setup_proxy("e4").unwrap();
        assert_eq!(e4.attempts.load(Ordering::SeqCst), 1);

        let ids: Vec<String> = manager.list_sources().unwrap().into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![LOOPBACK_ID, "e4-001", "e4-002"]);
        assert_eq!(manager.owner_of("e4-002").unwrap(), "e4");
        assert_eq!(manager.list_streams("e4-002").unwrap()[0].name, "bvp@e4-002");
    }

    #[test]
    fn test_unknown_ids() {
        let manager = ProxyManager::new();
        assert!(matches!(manager.setup_proxy("nope"), Err(DataMuxError::UnknownSource(_))));
        assert!(matches!(manager.list_streams("nope"), Err(DataMuxError::UnknownSource(_))));
    }

    #[test]
    fn test_failed_setup_is_retried_and_skipped() {
        let manager = ProxyManager::new();
        let pupil = Arc::new(Flaky::new(true));
        manager.register("pupil", pupil.clone());
        assert!(matches!(manager.setup_proxy("pupil"), Err(DataMuxError::Setup(_))));
        assert_eq!(manager.setup_all(), 0);
        assert_eq!(pupil.attempts.load(Ordering::SeqCst), 2);
        assert!(manager.list_sources().unwrap().is_empty());
        assert!(!manager.is_setup());
    }
}
