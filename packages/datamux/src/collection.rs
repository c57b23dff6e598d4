// Recorded collection replay
//
// Collections are described by `*.collection.json` files in the metadata
// directory and stored one record per file under the data directory.
// Replay paces records by their primary index so that a recording plays
// back like the live stream it was captured from. `serve` writes the same
// records into a live outlet instead of a queue.
//
// The primary index unit (s, ms, us or ns) is guessed from the gap between
// the first two rows and the declared frequency. This is reliable for
// regularly sampled data only; with irregular sampling the chosen unit is
// undefined.

use dfds::{Attrs, Collection, Column, Config, DType, Node, Parser, Stream, Table};
use parking_lot::RwLock;
use rand::Rng;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{DataMuxError, Result};
use crate::live::LiveBus;
use crate::message::Record;
use crate::queue::Flag;
use crate::reader::{Emitter, Reader, State, StreamOptions};
use crate::signals;

const COLLECTION_SUFFIX: &str = ".collection.json";

/// Time units considered for the primary index, as divisors to seconds
const SI_SCALES: [f64; 4] = [1.0, 1e3, 1e6, 1e9];

/// Reader over DFDS collections in the configured directories
pub struct CollectionManager {
    config: Config,
    parser: Parser,
    collections: RwLock<Vec<(String, Collection)>>,
    bus: LiveBus,
}

impl CollectionManager {
    pub fn new(config: Config) -> Self {
        Self::with_bus(config, LiveBus::new())
    }

    /// Manager publishing onto `bus`
    pub fn with_bus(config: Config, bus: LiveBus) -> Self {
        Self {
            config,
            parser: Parser::new(),
            collections: RwLock::new(Vec::new()),
            bus,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &LiveBus {
        &self.bus
    }

    fn refresh(&self) -> Result<Vec<Collection>> {
        let pattern = self
            .config
            .meta_dir
            .join(format!("*{}", COLLECTION_SUFFIX))
            .to_string_lossy()
            .into_owned();
        let mut paths: Vec<_> = glob::glob(&pattern)
            .map_err(|e| DataMuxError::Config(e.to_string()))?
            .filter_map(|p| p.ok())
            .collect();
        paths.sort();

        let mut found = Vec::with_capacity(paths.len());
        for path in paths {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let id = file_name.trim_end_matches(COLLECTION_SUFFIX).to_string();
            let collection = self
                .parser
                .get_collection_metadata(&path.to_string_lossy())?;
            found.push((id, collection));
        }
        tracing::debug!("Found {} collections in {}", found.len(), self.config.meta_dir.display());

        let collections = found.iter().map(|(_, c)| c.clone()).collect();
        *self.collections.write() = found;
        Ok(collections)
    }

    /// Look up a collection by file id or by name, refreshing once on a miss.
    fn collection(&self, collection_id: &str) -> Result<Collection> {
        let lookup = |items: &[(String, Collection)]| {
            items
                .iter()
                .find(|(id, c)| id == collection_id || c.name == collection_id)
                .map(|(_, c)| c.clone())
        };
        if let Some(found) = lookup(self.collections.read().as_slice()) {
            return Ok(found);
        }
        self.refresh()?;
        lookup(self.collections.read().as_slice())
            .ok_or_else(|| DataMuxError::NotFound(format!("collection '{}'", collection_id)))
    }

    /// Resolve a stream by key or name, with the collection holding it.
    pub(crate) fn find_stream(&self, collection_id: &str, stream_id: &str) -> Result<(Collection, String, Stream)> {
        let find = |collection: Collection| {
            let found = collection
                .streams
                .iter()
                .find(|(k, s)| *k == stream_id || s.name == stream_id)
                .map(|(k, s)| (k.clone(), s.clone()));
            found.map(|(key, stream)| (collection, key, stream))
        };
        if let Some(found) = find(self.collection(collection_id)?) {
            return Ok(found);
        }
        // the cached collection may predate an edit
        self.refresh()?;
        find(self.collection(collection_id)?)
            .ok_or_else(|| DataMuxError::NotFound(format!("stream '{}' in '{}'", stream_id, collection_id)))
    }

    /// Load, sort and normalize one recorded stream.
    fn open(
        &self,
        collection_id: &str,
        stream_id: &str,
        attrs: &Attrs,
        mode: &str,
    ) -> Result<ReplayState> {
        let (collection, key, stream) = self.find_stream(collection_id, stream_id)?;

        let mut stream = stream;
        stream.attrs.extend(attrs.clone());
        stream.attrs.insert("collection".to_string(), collection.name.clone());
        stream.attrs.insert("id".to_string(), key);
        stream.attrs.insert("dfds_mode".to_string(), mode.to_string());

        let freq = if stream.frequency > 0.0 {
            stream.frequency
        } else {
            let guess = rand::thread_rng().gen_range(1..=50) as f64;
            tracing::debug!("'{}' has no frequency, replaying at {} Hz", stream.name, guess);
            guess
        };
        let dt = 1.0 / freq;

        let (meta, mut table) = collection.dataloader(&self.config)?.read(&stream.attrs)?;
        stream.attrs.extend(meta);

        let mut index_cols: Vec<String> = stream.index.keys().cloned().collect();
        if index_cols.is_empty() {
            index_cols.push("t".to_string());
        }
        table.sort_by(&index_cols);
        let rows = table.num_rows();
        for col in &index_cols {
            if !table.contains(col) {
                let values = (0..rows).map(|i| i as f64 / freq).collect();
                table
                    .push_column(Column::float(col.clone(), DType::F64, values))
                    .map_err(|e| DataMuxError::Source(e.to_string()))?;
            }
        }

        let primary = index_cols[0].clone();
        let scale = detect_scale(&table, &primary, dt);
        if let Some(column) = table.column_mut(&primary) {
            column.rescale(scale);
        }

        let value_cols: Vec<String> = stream
            .fields
            .keys()
            .filter(|k| {
                let present = table.contains(k);
                if !present {
                    tracing::warn!("Field '{}' missing from the record of '{}'", k, stream.name);
                }
                present
            })
            .cloned()
            .collect();

        tracing::info!(
            "Opened {}/{}: {} rows, dt={:.4}s, index scale 1/{}",
            collection.name,
            stream.name,
            rows,
            dt,
            scale
        );
        Ok(ReplayState {
            stream,
            table,
            index_cols,
            value_cols,
            primary,
            dt,
            idx: 0,
            origin: None,
        })
    }

    /// Publish a recorded stream as a live outlet on the bus.
    ///
    /// Records are pushed at the stream's pace while the outlet has
    /// consumers. Publishing ends when the record runs out or when every
    /// consumer has left after the first one attached; the outlet is then
    /// closed.
    pub fn serve(&self, collection_id: &str, stream_id: &str, attrs: &Attrs) -> Result<JoinHandle<()>> {
        let state = self.open(collection_id, stream_id, attrs, "restream")?;
        let outlet = self.bus.open(state.stream.clone());
        let flag = Flag::new();
        signals::register(&flag);

        std::thread::Builder::new()
            .name(format!("publish-{}", state.stream.name))
            .spawn(move || {
                let mut state = state;
                let total = state.len();
                let dt = Duration::from_secs_f64(state.dt);
                let mut started = false;
                tracing::info!("Publishing '{}': dt={:.4}s, n={}", outlet.stream().name, state.dt, total);
                while state.idx < total {
                    if outlet.has_consumers() {
                        started = true;
                        outlet.push(&state.record(state.idx));
                        state.idx += 1;
                    } else if started {
                        tracing::info!("Consumers left '{}', stopping", outlet.stream().name);
                        break;
                    }
                    if flag.wait(Some(dt)) {
                        break;
                    }
                }
                outlet.close();
                tracing::info!("Published {}/{} records of '{}'", state.idx, total, state.stream.name);
            })
            .map_err(DataMuxError::Io)
    }
}

fn detect_scale(table: &Table, primary: &str, dt: f64) -> f64 {
    let column = match table.column(primary) {
        Some(c) if c.len() >= 2 => c,
        _ => return 1.0,
    };
    let (first, second) = match (column.f64_at(0), column.f64_at(1)) {
        (Some(a), Some(b)) => (a, b),
        _ => return 1.0,
    };
    let ratio = (second - first) / dt;
    SI_SCALES
        .iter()
        .copied()
        .min_by(|a, b| (a - ratio).abs().total_cmp(&(b - ratio).abs()))
        .unwrap_or(1.0)
}

struct ReplayState {
    stream: Stream,
    table: Table,
    index_cols: Vec<String>,
    value_cols: Vec<String>,
    primary: String,
    dt: f64,
    idx: usize,
    /// Wall clock and primary index of the first emitted record
    origin: Option<(Instant, f64)>,
}

impl ReplayState {
    fn len(&self) -> usize {
        self.table.num_rows()
    }

    fn record(&self, row: usize) -> Record {
        let pick = |cols: &[String]| {
            cols.iter()
                .filter_map(|c| self.table.column(c).map(|col| (c.clone(), col.json_at(row))))
                .collect()
        };
        Record::new(pick(&self.index_cols), pick(&self.value_cols))
    }

    fn primary_at(&self, row: usize) -> Option<f64> {
        self.table
            .column(&self.primary)
            .and_then(|c| c.f64_at(row))
            .filter(|v| v.is_finite())
    }
}

impl Reader for CollectionManager {
    type Source = Collection;

    fn setup(&self) -> Result<()> {
        Ok(())
    }

    fn is_setup(&self) -> bool {
        true
    }

    fn list_sources(&self) -> Result<Vec<Collection>> {
        self.refresh()
    }

    /// One stream per group tuple and stream id, tagged for replay.
    fn list_streams(&self, source_id: &str) -> Result<Vec<Stream>> {
        let collection = self.collection(source_id)?;
        let node = Node::with_id(source_id);
        let mut streams = Vec::new();
        for group in collection.iterate_groups() {
            for (stream_id, stream) in &collection.streams {
                let mut s = stream.clone();
                s.attrs.insert("collection".to_string(), source_id.to_string());
                s.attrs.extend(group.clone());
                s.attrs.insert("id".to_string(), stream_id.clone());
                s.attrs.insert("mode".to_string(), "replay".to_string());
                s.node = Some(Box::new(node.clone()));
                streams.push(s);
            }
        }
        Ok(streams)
    }

    fn on_attach(&self, source_id: &str, stream_id: &str, attrs: &Attrs, _: &Emitter) -> Result<State> {
        Ok(Box::new(self.open(source_id, stream_id, attrs, "replay")?))
    }

    fn on_pull(&self, state: &mut State, emitter: &Emitter, options: &StreamOptions) -> Result<Option<i32>> {
        let state = state
            .downcast_mut::<ReplayState>()
            .ok_or_else(|| DataMuxError::Source("unexpected replay state".to_string()))?;
        if state.idx >= state.len() {
            return Ok(Some(0));
        }

        let ts = state.primary_at(state.idx);
        if state.origin.is_none() {
            if let Some(ts) = ts {
                state.origin = Some((Instant::now(), ts));
            }
        }

        if options.rate_limit {
            let stopped = match (options.strict_time, state.origin, ts) {
                (true, Some((t0, first)), Some(ts)) => {
                    emitter.sleep_until(t0 + Duration::from_secs_f64((ts - first).max(0.0)))
                }
                _ => emitter.sleep(Duration::from_secs_f64(state.dt)),
            };
            if stopped {
                return Ok(None);
            }
        }

        let mut record = state.record(state.idx);
        if options.use_relative_ts {
            if let (Some((_, first)), Some(ts)) = (state.origin, ts) {
                record.set_index(&state.primary, ts - first);
            }
        }
        emitter.emit(record.into());
        state.idx += 1;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::queue::Queue;
    use crate::reader::AttachRequest;
    use serde_json::json;
    use std::path::Path;

    fn fixture(root: &Path, rows: &str) -> Config {
        let meta = root.join("meta");
        let data = root.join("data").join("demo");
        std::fs::create_dir_all(&meta).unwrap();
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(
            meta.join("demo.collection.json"),
            json!({
                "name": "demo",
                "streams": {
                    "gaze": {
                        "name": "Gaze",
                        "frequency": 100,
                        "fields": {
                            "x": {"name": "x", "dtype": "f64"},
                            "y": {"name": "y", "dtype": "f64"}
                        },
                        "index": {
                            "t": {"name": "t", "dtype": "f64"},
                            "n": {"name": "n", "dtype": "u32"}
                        }
                    }
                },
                "groups": {
                    "subject": {"values": ["1", "2"]}
                },
                "pattern": "csv://sub{subject}"
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(data.join("sub1.csv"), rows).unwrap();
        Config::new(
            root.join("data").to_str().unwrap(),
            meta.to_str().unwrap(),
        )
        .unwrap()
    }

    fn subject(id: &str) -> Attrs {
        [("subject".to_string(), id.to_string())].into_iter().collect()
    }

    fn collect(queue: &Queue) -> Vec<Message> {
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
    fn test_list_sources_and_streams() {
        let dir = tempfile::tempdir().unwrap();
        let manager = CollectionManager::new(fixture(dir.path(), "t,x,y\n0,1,2\n"));

        let collections = manager.list_sources().unwrap();
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].name, "demo");

        let streams = manager.list_streams("demo").unwrap();
        assert_eq!(streams.len(), 2);
        let attrs = &streams[1].attrs;
        assert_eq!(attrs["collection"], "demo");
        assert_eq!(attrs["subject"], "2");
        assert_eq!(attrs["id"], "gaze");
        assert_eq!(attrs["mode"], "replay");
        assert_eq!(streams[0].node.as_ref().unwrap().id, "demo");

        assert!(matches!(manager.list_streams("nope"), Err(DataMuxError::NotFound(_))));
    }

    #[test]
    fn test_edited_collection_is_listed_again() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path(), "t,x,y\n0,1,2\n");
        let manager = CollectionManager::new(config.clone());
        assert_eq!(manager.list_sources().unwrap()[0].name, "demo");
        assert!(manager.find_stream("demo", "pupil").is_err());

        let path = config.meta_dir.join("demo.collection.json");
        let mut doc: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        doc["description"] = json!("edited in place");
        doc["streams"]["pupil"] = doc["streams"]["gaze"].clone();
        doc["streams"]["pupil"]["name"] = json!("Pupil");
        std::fs::write(&path, doc.to_string()).unwrap();

        assert_eq!(manager.list_sources().unwrap()[0].description, "edited in place");
        let (_, key, stream) = manager.find_stream("demo", "Pupil").unwrap();
        assert_eq!((key.as_str(), stream.name.as_str()), ("pupil", "Pupil"));
    }

    #[test]
    fn test_replay_sorts_rescales_and_synthesizes_index() {
        let dir = tempfile::tempdir().unwrap();
        // milliseconds, out of order
        let rows = "t,x,y\n20,3,30\n0,1,10\n10,2,20\n30,4,40\n";
        let manager = Arc::new(CollectionManager::new(fixture(dir.path(), rows)));

        let queue = Queue::new();
        let request = AttachRequest::new("demo", "Gaze", subject("1"), queue.clone())
            .with_options(StreamOptions::unpaced());
        manager.clone().attach(request).unwrap().join().unwrap();

        let out = collect(&queue);
        assert_eq!(out.len(), 5);
        assert_eq!(out.iter().filter(|m| m.is_eof()).count(), 1);
        let ts: Vec<f64> = out[..4].iter().map(|m| m.record().unwrap().index_f64("t").unwrap()).collect();
        assert_eq!(ts[0], 0.0);
        assert!((ts[3] - 0.03).abs() < 1e-9);
        let first = out[0].record().unwrap();
        assert_eq!(first.value["x"], json!(1));
        assert_eq!(first.index["n"], json!(0.0));
        assert!((out[2].record().unwrap().index_f64("n").unwrap() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_strict_time_paces_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let rows = "t,x,y\n0.00,1,1\n0.01,1,1\n0.02,1,1\n0.03,1,1\n0.04,1,1\n0.05,1,1\n";
        let manager = Arc::new(CollectionManager::new(fixture(dir.path(), rows)));

        let queue = Queue::new();
        let started = Instant::now();
        let request = AttachRequest::new("demo", "gaze", subject("1"), queue.clone());
        manager.clone().attach(request).unwrap().join().unwrap();
        assert!(started.elapsed() >= Duration::from_millis(45));
        assert_eq!(collect(&queue).len(), 7);
    }

    #[test]
    fn test_unknown_ids_end_with_eof() {
        let dir = tempfile::tempdir().unwrap();
        let manager = Arc::new(CollectionManager::new(fixture(dir.path(), "t,x,y\n0,1,2\n")));
        let queue = Queue::new();
        let request = AttachRequest::new("demo", "pupil", subject("1"), queue.clone());
        manager.clone().attach(request).unwrap().join().unwrap();
        assert_eq!(collect(&queue), vec![Message::Eof]);

        assert!(matches!(
            manager.serve("other", "gaze", &subject("1")),
            Err(DataMuxError::NotFound(_))
        ));
    }

    #[test]
    fn test_detect_scale_needs_two_rows() {
        let single = Table::from_columns(vec![Column::float("t", DType::F64, vec![5.0])]).unwrap();
        assert_eq!(detect_scale(&single, "t", 0.01), 1.0);
        let micros = Table::from_columns(vec![Column::int("t", DType::I32, vec![0, 10_000])]).unwrap();
        assert_eq!(detect_scale(&micros, "t", 0.01), 1e6);
    }
}
