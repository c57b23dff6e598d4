// Reader contract shared by recorded and live sources
//
// A reader lists sources and their streams and produces records for one
// attached stream at a time. `attach` runs the attach/pull/detach lifecycle
// on a dedicated worker thread:
//
//   on_attach -> on_pull* -> on_detach -> EOF
//
// The worker stops pulling once its flag is set (by `stop_task` or a
// signal) or once `on_pull` returns a code. The end-of-stream sentinel is
// pushed exactly once, also when `on_attach` fails.

use dfds::{Attrs, Stream};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{DataMuxError, Result};
use crate::message::Message;
use crate::queue::{Flag, Queue, QueueError, DEFAULT_TIMEOUT};
use crate::signals;
use crate::transform::Transform;

/// Opaque per-attach state owned by the worker
pub type State = Box<dyn Any + Send>;

/// Upper bound on delivering the sentinel into a queue nobody drains
const EOF_DEADLINE: Duration = Duration::from_secs(5);

/// Pacing switches of an attach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    pub rate_limit: bool,
    pub strict_time: bool,
    pub use_relative_ts: bool,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            rate_limit: true,
            strict_time: true,
            use_relative_ts: true,
        }
    }
}

impl StreamOptions {
    /// Emit as fast as the sink accepts
    pub fn unpaced() -> Self {
        Self {
            rate_limit: false,
            ..Self::default()
        }
    }
}

/// Everything `attach` needs to run one subscription
#[derive(Debug, Clone)]
pub struct AttachRequest {
    pub source_id: String,
    pub stream_id: String,
    pub attrs: Attrs,
    pub queue: Queue,
    pub transform: Transform,
    pub flag: Flag,
    pub options: StreamOptions,
}

impl AttachRequest {
    pub fn new(source_id: &str, stream_id: &str, attrs: Attrs, queue: Queue) -> Self {
        Self {
            source_id: source_id.to_string(),
            stream_id: stream_id.to_string(),
            attrs,
            queue,
            transform: Transform::Identity,
            flag: Flag::new(),
            options: StreamOptions::default(),
        }
    }

    pub fn with_transform(mut self, transform: Transform) -> Self {
        self.transform = transform;
        self
    }

    pub fn with_flag(mut self, flag: Flag) -> Self {
        self.flag = flag;
        self
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }
}

/// Output side of an attach: applies the transform and writes into the sink
/// queue without ever blocking past a flag change.
pub struct Emitter {
    queue: Queue,
    transform: Transform,
    flag: Flag,
    eof_sent: AtomicBool,
}

impl Emitter {
    pub fn new(queue: Queue, transform: Transform, flag: Flag) -> Self {
        Self {
            queue,
            transform,
            flag,
            eof_sent: AtomicBool::new(false),
        }
    }

    pub fn flag(&self) -> &Flag {
        &self.flag
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.is_set()
    }

    /// Transform and enqueue one message.
    ///
    /// Returns `false` when the flag was set before the queue accepted it.
    pub fn emit(&self, msg: Message) -> bool {
        let mut item = self.transform.apply(msg);
        loop {
            if self.flag.is_set() {
                return false;
            }
            match self.queue.put_timeout(item, DEFAULT_TIMEOUT) {
                Ok(()) => return true,
                Err((back, QueueError::Timeout)) => item = back,
                Err((_, e)) => {
                    tracing::warn!("Dropping record: {}", e);
                    return false;
                }
            }
        }
    }

    /// Enqueue the transformed end-of-stream sentinel; later calls are no-ops.
    pub fn emit_eof(&self) {
        if self.eof_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let item = self.transform.apply(Message::Eof);
        if let Err((_, e)) = self.queue.put_timeout(item, EOF_DEADLINE) {
            tracing::warn!("End of stream could not be delivered: {}", e);
        }
    }

    pub fn eof_sent(&self) -> bool {
        self.eof_sent.load(Ordering::SeqCst)
    }

    /// Sleep for `duration` unless stopped first; true when stopped.
    pub fn sleep(&self, duration: Duration) -> bool {
        self.flag.wait(Some(duration))
    }

    /// Sleep until `deadline` unless stopped first; true when stopped.
    pub fn sleep_until(&self, deadline: Instant) -> bool {
        let now = Instant::now();
        if deadline <= now {
            return self.flag.is_set();
        }
        self.sleep(deadline - now)
    }
}

/// A source of streams: a collection store, a device proxy, or a federation
/// of proxies.
pub trait Reader: Send + Sync + 'static {
    /// What `list_sources` enumerates (collections or nodes)
    type Source;

    /// Idempotent; fails with `Setup` when prerequisites are missing.
    fn setup(&self) -> Result<()>;

    fn is_setup(&self) -> bool;

    fn list_sources(&self) -> Result<Vec<Self::Source>>;

    fn list_streams(&self, source_id: &str) -> Result<Vec<Stream>>;

    fn on_attach(
        &self,
        source_id: &str,
        stream_id: &str,
        attrs: &Attrs,
        emitter: &Emitter,
    ) -> Result<State>;

    /// Produce zero or more records; `Some(code)` ends the stream.
    fn on_pull(
        &self,
        state: &mut State,
        emitter: &Emitter,
        options: &StreamOptions,
    ) -> Result<Option<i32>>;

    /// Release per-attach state and push the end-of-stream sentinel.
    fn on_detach(&self, state: State, emitter: &Emitter) -> Result<()> {
        drop(state);
        emitter.emit_eof();
        Ok(())
    }

    /// Run the attach lifecycle on a worker thread.
    fn attach(self: Arc<Self>, request: AttachRequest) -> Result<JoinHandle<()>>
    where
        Self: Sized,
    {
        spawn_worker(self, request)
    }
}

/// Worker for any reader, including trait objects.
pub fn spawn_worker<R>(reader: Arc<R>, request: AttachRequest) -> Result<JoinHandle<()>>
where
    R: Reader + ?Sized,
{
    spawn_worker_with(reader, request, || {})
}

/// Like [`spawn_worker`], calling `on_exit` once the end of stream was emitted.
pub fn spawn_worker_with<R, F>(reader: Arc<R>, request: AttachRequest, on_exit: F) -> Result<JoinHandle<()>>
where
    R: Reader + ?Sized,
    F: FnOnce() + Send + 'static,
{
    let name = format!("attach-{}", request.stream_id);
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            run_attached(reader.as_ref(), request);
            on_exit();
        })
        .map_err(DataMuxError::Io)
}

fn run_attached<R: Reader + ?Sized>(reader: &R, request: AttachRequest) {
    let AttachRequest {
        source_id,
        stream_id,
        attrs,
        queue,
        transform,
        flag,
        options,
    } = request;
    signals::register(&flag);
    let emitter = Emitter::new(queue, transform, flag);

    let mut state = match reader.on_attach(&source_id, &stream_id, &attrs, &emitter) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("Attach to {}/{} failed: {}", source_id, stream_id, e);
            emitter.emit_eof();
            return;
        }
    };
    tracing::info!("Attached to {}/{}", source_id, stream_id);

    while !emitter.is_stopped() {
        match reader.on_pull(&mut state, &emitter, &options) {
            Ok(None) => {}
            Ok(Some(code)) => {
                tracing::debug!("{}/{} ended with code {}", source_id, stream_id, code);
                break;
            }
            Err(e) => {
                tracing::warn!("Pull from {}/{} failed: {}", source_id, stream_id, e);
                // retry, without spinning on a persistent error
                emitter.sleep(DEFAULT_TIMEOUT);
            }
        }
    }
    if emitter.is_stopped() {
        tracing::info!("Stop requested for {}/{}", source_id, stream_id);
    }

    if let Err(e) = reader.on_detach(state, &emitter) {
        tracing::warn!("Detach from {}/{} failed: {}", source_id, stream_id, e);
    }
    emitter.emit_eof();
    tracing::info!("Detached from {}/{}", source_id, stream_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Record;
    use serde_json::json;

    /// Emits `count` numbered records, then ends.
    struct Counter {
        count: usize,
        fail_attach: bool,
    }

    impl Reader for Counter {
        type Source = String;

        fn setup(&self) -> Result<()> {
            Ok(())
        }

        fn is_setup(&self) -> bool {
            true
        }

        fn list_sources(&self) -> Result<Vec<String>> {
            Ok(vec!["counter".to_string()])
        }

        fn list_streams(&self, _source_id: &str) -> Result<Vec<Stream>> {
            Ok(Vec::new())
        }

        fn on_attach(&self, _: &str, _: &str, _: &Attrs, _: &Emitter) -> Result<State> {
            if self.fail_attach {
                return Err(DataMuxError::Source("no device".to_string()));
            }
            Ok(Box::new(0usize))
        }

        fn on_pull(&self, state: &mut State, emitter: &Emitter, _: &StreamOptions) -> Result<Option<i32>> {
            let idx = state
                .downcast_mut::<usize>()
                .ok_or_else(|| DataMuxError::Source("bad state".to_string()))?;
            if *idx == self.count {
                return Ok(Some(0));
            }
            let mut record = Record::default();
            record.set_index("t", *idx as f64);
            emitter.emit(record.into());
            *idx += 1;
            Ok(None)
        }
    }

    fn drain(queue: &Queue) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(msg) = queue.get_timeout(Duration::from_secs(5)) {
            let eof = msg.is_eof();
            out.push(msg);
            if eof {
                break;
            }
        }
        out
    }

    #[test]
    fn test_attach_emits_records_then_single_eof() {
        let queue = Queue::new();
        let reader = Arc::new(Counter { count: 3, fail_attach: false });
        let handle = reader
            .attach(AttachRequest::new("counter", "n", Attrs::new(), queue.clone()))
            .unwrap();
        let out = drain(&queue);
        handle.join().unwrap();

        assert_eq!(out.len(), 4);
        assert_eq!(out.iter().filter(|m| m.is_eof()).count(), 1);
        assert_eq!(out[2].record().unwrap().index["t"], json!(2.0));
        assert!(queue.try_get().is_none());
    }

    #[test]
    fn test_transform_applies_to_eof() {
        let queue = Queue::new();
        let reader = Arc::new(Counter { count: 1, fail_attach: false });
        let transform = Transform::custom(|m: Message| match m {
            Message::Eof => Message::Content(json!({"done": true})),
            other => other,
        });
        let handle = reader
            .attach(AttachRequest::new("counter", "n", Attrs::new(), queue.clone()).with_transform(transform))
            .unwrap();
        handle.join().unwrap();

        assert!(queue.get().unwrap().record().is_some());
        assert_eq!(queue.get(), Some(Message::Content(json!({"done": true}))));
    }

    #[test]
    fn test_failed_attach_still_emits_eof() {
        let queue = Queue::new();
        let reader = Arc::new(Counter { count: 1, fail_attach: true });
        let handle = reader
            .attach(AttachRequest::new("counter", "n", Attrs::new(), queue.clone()))
            .unwrap();
        handle.join().unwrap();
        assert_eq!(queue.get(), Some(Message::Eof));
        assert!(queue.try_get().is_none());
    }

    #[test]
    fn test_stopped_emitter_drops_records_but_delivers_eof() {
        let queue = Queue::new();
        let flag = Flag::new();
        let emitter = Emitter::new(queue.clone(), Transform::Identity, flag.clone());
        flag.set();
        assert!(!emitter.emit(Record::default().into()));
        assert!(emitter.sleep(Duration::from_secs(5)));
        emitter.emit_eof();
        emitter.emit_eof();
        assert_eq!(queue.get(), Some(Message::Eof));
        assert!(queue.try_get().is_none());
    }
}
