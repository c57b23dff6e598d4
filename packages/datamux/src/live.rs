// In-process live stream bus
//
// Publishers open an outlet for a stream descriptor and push records into
// it. Consumers subscribe by stream name and attributes. Closing (or
// dropping) an outlet disconnects all of its subscribers.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use dfds::{Attrs, Stream};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::error::{DataMuxError, Result};
use crate::message::Record;
use crate::queue::DEFAULT_CAPACITY;

struct Subscriber {
    tx: Sender<Record>,
    alive: Weak<()>,
}

struct OutletShared {
    id: u64,
    stream: Stream,
    subscribers: Mutex<Vec<Subscriber>>,
    closed: AtomicBool,
}

#[derive(Default)]
struct BusState {
    next_id: AtomicU64,
    outlets: Mutex<Vec<Arc<OutletShared>>>,
}

/// Registry of open outlets, shared by clone
#[derive(Clone, Default)]
pub struct LiveBus {
    state: Arc<BusState>,
}

/// Summary of an open outlet
#[derive(Debug, Clone, PartialEq)]
pub struct OutletInfo {
    pub id: u64,
    pub stream: Stream,
    pub consumers: usize,
}

impl LiveBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an outlet for `stream`; it stays listed until closed.
    pub fn open(&self, stream: Stream) -> Outlet {
        let id = self.state.next_id.fetch_add(1, Ordering::SeqCst);
        let shared = Arc::new(OutletShared {
            id,
            stream,
            subscribers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        self.state.outlets.lock().push(shared.clone());
        tracing::debug!("Opened outlet {} for '{}'", id, shared.stream.name);
        Outlet {
            shared,
            bus: self.clone(),
        }
    }

    pub fn outlets(&self) -> Vec<OutletInfo> {
        self.state
            .outlets
            .lock()
            .iter()
            .map(|o| OutletInfo {
                id: o.id,
                stream: o.stream.clone(),
                consumers: o.subscribers.lock().len(),
            })
            .collect()
    }

    pub fn streams(&self) -> Vec<Stream> {
        self.outlets().into_iter().map(|o| o.stream).collect()
    }

    /// Subscribe to the single open outlet whose stream is called `name`
    /// and carries every attribute in `attrs`.
    pub fn subscribe(&self, name: &str, attrs: &Attrs) -> Result<Subscription> {
        let outlets = self.state.outlets.lock();
        let matches: Vec<&Arc<OutletShared>> = outlets
            .iter()
            .filter(|o| o.stream.name == name && o.stream.matches_attrs(attrs))
            .collect();
        let outlet = match matches.as_slice() {
            [] => return Err(DataMuxError::NotFound(format!("live stream '{}'", name))),
            [one] => *one,
            many => {
                return Err(DataMuxError::Source(format!(
                    "{} live streams match '{}' with {:?}; refine the attributes",
                    many.len(),
                    name,
                    attrs
                )))
            }
        };
        let (tx, rx) = channel::bounded(DEFAULT_CAPACITY);
        let token = Arc::new(());
        outlet.subscribers.lock().push(Subscriber {
            tx,
            alive: Arc::downgrade(&token),
        });
        Ok(Subscription {
            stream: outlet.stream.clone(),
            rx,
            _token: token,
        })
    }

    fn remove(&self, id: u64) {
        self.state.outlets.lock().retain(|o| o.id != id);
    }
}

/// Producer side of a live stream
pub struct Outlet {
    shared: Arc<OutletShared>,
    bus: LiveBus,
}

impl Outlet {
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn stream(&self) -> &Stream {
        &self.shared.stream
    }

    pub fn has_consumers(&self) -> bool {
        let mut subscribers = self.shared.subscribers.lock();
        subscribers.retain(|s| s.alive.strong_count() > 0);
        !subscribers.is_empty()
    }

    /// Send `record` to every subscriber; returns how many received it.
    pub fn push(&self, record: &Record) -> usize {
        let mut subscribers = self.shared.subscribers.lock();
        subscribers.retain(|s| s.alive.strong_count() > 0 && s.tx.send(record.clone()).is_ok());
        subscribers.len()
    }

    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.bus.remove(self.shared.id);
        self.shared.subscribers.lock().clear();
        tracing::debug!("Closed outlet {} for '{}'", self.shared.id, self.shared.stream.name);
    }
}

impl Drop for Outlet {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer side of a live stream
pub struct Subscription {
    stream: Stream,
    rx: Receiver<Record>,
    _token: Arc<()>,
}

/// The outlet was closed and every buffered record has been received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

impl Subscription {
    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    /// Next record, `Ok(None)` on timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<Option<Record>, Closed> {
        match self.rx.recv_timeout(timeout) {
            Ok(record) => Ok(Some(record)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stream(name: &str, subject: &str) -> Stream {
        let mut s: Stream = serde_json::from_value(json!({"name": name, "fields": {}})).unwrap();
        s.attrs.insert("subject".to_string(), subject.to_string());
        s
    }

    fn attrs(subject: &str) -> Attrs {
        [("subject".to_string(), subject.to_string())].into_iter().collect()
    }

    #[test]
    fn test_subscribe_relay_and_close() {
        let bus = LiveBus::new();
        let outlet = bus.open(stream("Gaze", "1"));
        assert!(!outlet.has_consumers());

        let sub = bus.subscribe("Gaze", &attrs("1")).unwrap();
        assert!(outlet.has_consumers());
        let mut record = Record::default();
        record.set_index("t", 0.5);
        assert_eq!(outlet.push(&record), 1);
        assert_eq!(sub.recv_timeout(Duration::from_secs(1)), Ok(Some(record)));
        assert_eq!(sub.recv_timeout(Duration::from_millis(5)), Ok(None));

        outlet.close();
        assert!(bus.streams().is_empty());
        assert_eq!(sub.recv_timeout(Duration::from_secs(1)), Err(Closed));
    }

    #[test]
    fn test_dropped_subscription_is_not_a_consumer() {
        let bus = LiveBus::new();
        let outlet = bus.open(stream("Gaze", "1"));
        let sub = bus.subscribe("Gaze", &Attrs::new()).unwrap();
        drop(sub);
        assert!(!outlet.has_consumers());
        assert_eq!(outlet.push(&Record::default()), 0);
    }

    #[test]
    fn test_ambiguous_and_missing_queries() {
        let bus = LiveBus::new();
        let _a = bus.open(stream("Gaze", "1"));
        let _b = bus.open(stream("Gaze", "2"));
        assert!(matches!(bus.subscribe("Gaze", &Attrs::new()), Err(DataMuxError::Source(_))));
        assert!(bus.subscribe("Gaze", &attrs("2")).is_ok());
        assert!(matches!(bus.subscribe("Pupil", &Attrs::new()), Err(DataMuxError::NotFound(_))));
    }

    #[test]
    fn test_drop_closes_outlet() {
        let bus = LiveBus::new();
        let outlet = bus.open(stream("Gaze", "1"));
        assert_eq!(bus.outlets().len(), 1);
        drop(outlet);
        assert!(bus.outlets().is_empty());
    }
}
