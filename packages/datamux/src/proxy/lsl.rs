// Lab Streaming Layer (LSL) proxy
//
// Lists the LSL outlets visible on the network as streams of a single node
// and relays pulled chunks sample by sample as `{index: {t}, value: {..}}`
// records. The inlet lives on its own thread, since LSL handles are
// synchronous and bound to the thread that created them.

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use dfds::{Attrs, DType, Field, Node, Stream};
use indexmap::IndexMap;
use lsl::{StreamInfo, StreamInlet};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{DataMuxError, Result};
use crate::message::Record;
use crate::queue::{Flag, DEFAULT_CAPACITY, DEFAULT_TIMEOUT};
use crate::reader::{Emitter, Reader, State, StreamOptions};

const NODE_ID: &str = "lsl";
const RESOLVE_TIMEOUT: f64 = 1.0;
const CHUNK_SIZE: usize = 256;

pub struct LslProxy {
    ready: AtomicBool,
}

impl Default for LslProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl LslProxy {
    pub fn new() -> Self {
        Self {
            ready: AtomicBool::new(false),
        }
    }

    fn resolve(predicate: Option<&str>) -> Vec<StreamInfo> {
        match predicate {
            Some(pred) => lsl::resolve_bypred(pred, 1, RESOLVE_TIMEOUT),
            None => lsl::resolve_streams(RESOLVE_TIMEOUT),
        }
    }

    fn channel_names(info: &StreamInfo) -> Vec<String> {
        let count = info.channel_count().max(0) as usize;
        let labels: Vec<String> = info
            .as_xml()
            .map(|xml| {
                xml.lines()
                    .filter_map(|line| {
                        let start = line.find("<label>")?;
                        let end = line.find("</label>")?;
                        Some(line[start + 7..end].trim().to_string())
                    })
                    .collect()
            })
            .unwrap_or_default();
        if labels.len() == count {
            labels
        } else {
            (0..count).map(|i| format!("ch{}", i + 1)).collect()
        }
    }

    fn to_stream(info: &StreamInfo) -> Stream {
        let field = |name: &str, dtype: DType| Field {
            name: name.to_string(),
            description: String::new(),
            dtype,
        };
        let fields: IndexMap<String, Field> = Self::channel_names(info)
            .into_iter()
            .map(|name| (name.clone(), field(&name, DType::F32)))
            .collect();
        let mut index = IndexMap::new();
        index.insert("t".to_string(), field("t", DType::F64));

        let mut attrs = Attrs::new();
        attrs.insert("type".to_string(), info.stream_type().to_string());
        attrs.insert("mode".to_string(), "proxy".to_string());
        Stream {
            name: info.name().to_string(),
            description: String::new(),
            unit: String::new(),
            frequency: info.sampling_rate().max(0.0),
            fields,
            index,
            node: Some(Box::new(Node::with_id(NODE_ID))),
            attrs,
        }
    }
}

struct InletState {
    rx: Receiver<Record>,
    stop: Flag,
}

impl Drop for InletState {
    fn drop(&mut self) {
        self.stop.set();
    }
}

fn pump(info: StreamInfo, channels: Vec<String>, tx: channel::Sender<Record>, stop: Flag) {
    let mut inlet = match StreamInlet::new(&info, 360, CHUNK_SIZE, true) {
        Ok(inlet) => inlet,
        Err(e) => {
            tracing::error!("Failed to open LSL inlet for '{}': {:?}", info.name(), e);
            return;
        }
    };
    let width = channels.len();
    let mut samples = vec![0.0f32; CHUNK_SIZE * width];
    let mut stamps = vec![0.0f64; CHUNK_SIZE];
    while !stop.is_set() {
        let pulled = match inlet.pull_chunk_f32(&mut samples, Some(&mut stamps)) {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("LSL pull from '{}' failed: {:?}", info.name(), e);
                break;
            }
        };
        if pulled == 0 {
            stop.wait(Some(std::time::Duration::from_millis(1)));
            continue;
        }
        for i in 0..pulled {
            let mut value = Map::new();
            for (c, name) in channels.iter().enumerate() {
                let x = serde_json::Number::from_f64(samples[i * width + c] as f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null);
                value.insert(name.clone(), x);
            }
            let mut record = Record::new(Map::new(), value);
            record.set_index("t", stamps[i]);
            if tx.send(record).is_err() {
                return;
            }
        }
    }
}

impl Reader for LslProxy {
    type Source = Node;

    fn setup(&self) -> Result<()> {
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_setup(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    fn list_sources(&self) -> Result<Vec<Node>> {
        let mut node = Node::with_id(NODE_ID);
        for info in Self::resolve(None) {
            let stream = Self::to_stream(&info);
            node.outputs.insert(stream.name.clone(), stream);
        }
        Ok(vec![node])
    }

    fn list_streams(&self, source_id: &str) -> Result<Vec<Stream>> {
        if source_id != NODE_ID {
            return Err(DataMuxError::UnknownSource(source_id.to_string()));
        }
        Ok(Self::resolve(None).iter().map(Self::to_stream).collect())
    }

    fn on_attach(&self, source_id: &str, stream_id: &str, attrs: &Attrs, _: &Emitter) -> Result<State> {
        if source_id != NODE_ID {
            return Err(DataMuxError::UnknownSource(source_id.to_string()));
        }
        let mut predicate = format!("name='{}'", stream_id);
        if let Some(kind) = attrs.get("type") {
            predicate.push_str(&format!(" and type='{}'", kind));
        }
        let mut found = Self::resolve(Some(&predicate));
        let info = match found.len() {
            0 => return Err(DataMuxError::NotFound(format!("LSL stream {}", predicate))),
            1 => found.remove(0),
            n => {
                return Err(DataMuxError::Source(format!(
                    "{} LSL streams match {}; refine the attributes",
                    n, predicate
                )))
            }
        };
        tracing::info!(
            "Resolved LSL stream '{}' ({} channels, {} Hz)",
            info.name(),
            info.channel_count(),
            info.sampling_rate()
        );

        let channels = Self::channel_names(&info);
        let (tx, rx) = channel::bounded(DEFAULT_CAPACITY);
        let stop = Flag::new();
        let pump_stop = stop.clone();
        std::thread::Builder::new()
            .name(format!("lsl-{}", stream_id))
            .spawn(move || pump(info, channels, tx, pump_stop))
            .map_err(DataMuxError::Io)?;
        Ok(Box::new(InletState { rx, stop }))
    }

    fn on_pull(&self, state: &mut State, emitter: &Emitter, _: &StreamOptions) -> Result<Option<i32>> {
        let state = state
            .downcast_mut::<InletState>()
            .ok_or_else(|| DataMuxError::Source("unexpected LSL state".to_string()))?;
        match state.rx.recv_timeout(DEFAULT_TIMEOUT) {
            Ok(record) => {
                emitter.emit(record.into());
                Ok(None)
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!("LSL inlet closed, ending stream");
                Ok(Some(1))
            }
        }
    }

    fn on_detach(&self, state: State, emitter: &Emitter) -> Result<()> {
        drop(state);
        emitter.emit_eof();
        Ok(())
    }
}
