// Loopback live proxy
//
// Exposes the outlets of the in-process live bus as one live node, so that
// published collections can be consumed like any other device stream.

use dfds::{Attrs, Node, Stream};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{DataMuxError, Result};
use crate::live::{LiveBus, Subscription};
use crate::reader::{Emitter, Reader, State, StreamOptions};
use crate::queue::DEFAULT_TIMEOUT;

pub const LOOPBACK_ID: &str = "loopback";

/// Attributes describing how a stream was listed, not what it carries
const LISTING_KEYS: [&str; 1] = ["mode"];

pub struct LoopbackProxy {
    bus: LiveBus,
    ready: AtomicBool,
}

impl LoopbackProxy {
    pub fn new(bus: LiveBus) -> Self {
        Self {
            bus,
            ready: AtomicBool::new(false),
        }
    }

    fn node(&self) -> Node {
        let mut node = Node::with_id(LOOPBACK_ID);
        for outlet in self.bus.outlets() {
            let key = format!("{}:{}", outlet.stream.name, outlet.id);
            node.outputs.insert(key, outlet.stream);
        }
        node
    }
}

struct LiveState {
    subscription: Subscription,
    primary: Option<String>,
    first_ts: Option<f64>,
}

impl Reader for LoopbackProxy {
    type Source = Node;

    fn setup(&self) -> Result<()> {
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_setup(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn list_sources(&self) -> Result<Vec<Node>> {
        Ok(vec![self.node()])
    }

    fn list_streams(&self, source_id: &str) -> Result<Vec<Stream>> {
        if source_id != LOOPBACK_ID {
            return Err(DataMuxError::UnknownSource(source_id.to_string()));
        }
        let node = Node::with_id(LOOPBACK_ID);
        Ok(self
            .bus
            .streams()
            .into_iter()
            .map(|mut s| {
                s.attrs.insert("mode".to_string(), "proxy".to_string());
                s.node = Some(Box::new(node.clone()));
                s
            })
            .collect())
    }

    fn on_attach(&self, source_id: &str, stream_id: &str, attrs: &Attrs, _: &Emitter) -> Result<State> {
        if source_id != LOOPBACK_ID {
            return Err(DataMuxError::UnknownSource(source_id.to_string()));
        }
        let mut query = attrs.clone();
        for key in LISTING_KEYS {
            query.remove(key);
        }
        let subscription = self.bus.subscribe(stream_id, &query)?;
        let primary = subscription.stream().primary_index().map(str::to_string);
        Ok(Box::new(LiveState {
            subscription,
            primary,
            first_ts: None,
        }))
    }

    fn on_pull(&self, state: &mut State, emitter: &Emitter, options: &StreamOptions) -> Result<Option<i32>> {
        let state = state
            .downcast_mut::<LiveState>()
            .ok_or_else(|| DataMuxError::Source("unexpected live state".to_string()))?;
        let mut record = match state.subscription.recv_timeout(DEFAULT_TIMEOUT) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(None),
            Err(_) => return Ok(Some(0)),
        };
        if let Some(primary) = &state.primary {
            if let Some(ts) = record.index_f64(primary) {
                let first = *state.first_ts.get_or_insert(ts);
                if options.use_relative_ts {
                    record.set_index(primary, ts - first);
                }
            }
        }
        emitter.emit(record.into());
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Record};
    use crate::queue::Queue;
    use crate::reader::{spawn_worker, AttachRequest};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn gaze() -> Stream {
        serde_json::from_value(json!({
            "name": "Gaze",
            "fields": {"x": {"name": "x", "dtype": "f64"}},
            "index": {"t": {"name": "t", "dtype": "f64"}},
            "attrs": {"subject": "1"}
        }))
        .unwrap()
    }

    #[test]
    fn test_lists_open_outlets() {
        let bus = LiveBus::new();
        let proxy = LoopbackProxy::new(bus.clone());
        assert!(!proxy.is_setup());
        proxy.setup().unwrap();
        assert!(proxy.list_streams(LOOPBACK_ID).unwrap().is_empty());

        let _outlet = bus.open(gaze());
        let nodes = proxy.list_sources().unwrap();
        assert_eq!(nodes[0].id, LOOPBACK_ID);
        assert_eq!(nodes[0].outputs.len(), 1);
        let streams = proxy.list_streams(LOOPBACK_ID).unwrap();
        assert_eq!(streams[0].attrs["mode"], "proxy");
        assert!(matches!(proxy.list_streams("lsl"), Err(DataMuxError::UnknownSource(_))));
    }

    #[test]
    fn test_relays_until_outlet_closes() {
        let bus = LiveBus::new();
        let proxy = Arc::new(LoopbackProxy::new(bus.clone()));
        let outlet = bus.open(gaze());

        let queue = Queue::new();
        let attrs: Attrs = [("subject".to_string(), "1".to_string()), ("mode".to_string(), "proxy".to_string())]
            .into_iter()
            .collect();
        let worker = spawn_worker(proxy, AttachRequest::new(LOOPBACK_ID, "Gaze", attrs, queue.clone())).unwrap();

        while !outlet.has_consumers() {
            std::thread::sleep(Duration::from_millis(5));
        }
        for t in [10.0, 10.5] {
            let mut record = Record::default();
            record.set_index("t", t);
            outlet.push(&record);
        }
        outlet.close();
        worker.join().unwrap();

        let first = queue.get_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.record().unwrap().index_f64("t"), Some(0.0));
        let second = queue.get_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(second.record().unwrap().index_f64("t"), Some(0.5));
        assert_eq!(queue.get_timeout(Duration::from_secs(1)), Some(Message::Eof));
    }
}
