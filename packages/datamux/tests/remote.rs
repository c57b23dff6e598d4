// A DataMux server on a local port, driven through RemoteApi.

mod common;

use common::{adhd_sin, attrs, drain, values_of};
use datamux::rpc::{self, RpcClient, WebSocketClient};
use datamux::{
    Api, DataMuxApi, DataMuxError, DataMuxServer, Message, Queue, RemoteApi, StreamOptions, Transform, TransformRegistry,
    TransformSpec,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

struct Harness {
    _dir: tempfile::TempDir,
    runtime: Runtime,
    port: u16,
    shutdown: CancellationToken,
    server: JoinHandle<datamux::Result<()>>,
}

impl Harness {
    fn start(rows: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let api = Arc::new(Api::new(adhd_sin(dir.path(), rows)));
        let runtime = Runtime::new().unwrap();
        let listener = runtime.block_on(DataMuxServer::bind("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = DataMuxServer::new(api, "websocket").unwrap();
        let shutdown = CancellationToken::new();
        let server = runtime.spawn(server.serve(listener, shutdown.clone()));
        Self {
            _dir: dir,
            runtime,
            port,
            shutdown,
            server,
        }
    }

    fn connect(&self, codec: &str) -> RemoteApi {
        RemoteApi::connect("websocket", codec, "127.0.0.1", self.port).unwrap()
    }

    fn stop(self) {
        self.shutdown.cancel();
        let result = self.runtime.block_on(self.server).unwrap();
        assert!(result.is_ok());
    }
}

#[test]
fn test_remote_replay_with_each_codec() {
    let rows = 20;
    let harness = Harness::start(rows);

    for codec in rpc::CODECS {
        let remote = harness.connect(codec);

        let collections = remote.list_collections().unwrap();
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].name, "adhd_sin");
        let streams = remote.list_collection_streams("adhd_sin").unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].attrs["mode"], "replay");

        let sink = Queue::new();
        let ack = remote
            .replay_collection_stream("adhd_sin", "Gaze", &attrs(), &sink, Transform::Identity, StreamOptions::unpaced())
            .unwrap();
        let handle = ack.randseq.unwrap();
        assert!(handle.starts_with("d_"));

        let out = drain(&sink, WAIT);
        assert_eq!(out.len(), rows + 1, "codec {}", codec);
        assert_eq!(out.last(), Some(&Message::Eof));
        assert_eq!(out[0].record().unwrap().index_f64("t"), Some(0.0));
        assert_eq!(values_of(&out, "x"), (0..rows).map(|i| i as f64).collect::<Vec<_>>());

        assert!(remote.stop_task(&handle).unwrap().status);
    }

    harness.stop();
}

#[test]
fn test_remote_named_transform_and_errors() {
    let harness = Harness::start(5);
    let remote = harness.connect("json");

    let select = TransformRegistry::with_builtins()
        .resolve(&TransformSpec::new("select").with_param("fields", json!(["y"])))
        .unwrap();
    let sink = Queue::new();
    remote
        .replay_collection_stream("adhd_sin", "Gaze", &attrs(), &sink, select, StreamOptions::unpaced())
        .unwrap();
    let out = drain(&sink, WAIT);
    assert_eq!(out.len(), 6);
    let first = out[0].record().unwrap();
    assert!(first.value.contains_key("y"));
    assert!(!first.value.contains_key("x"));

    let custom = Transform::custom(|m| m);
    let err = remote
        .replay_collection_stream("adhd_sin", "Gaze", &attrs(), &sink, custom, StreamOptions::unpaced())
        .unwrap_err();
    assert!(matches!(err, DataMuxError::Codec(_)));

    let err = remote.list_live_streams("nowhere").unwrap_err();
    assert!(matches!(err, DataMuxError::Remote(_)));

    let err = remote.request("no_such_topic", json!({})).unwrap_err();
    match err {
        DataMuxError::Remote(msg) => assert_eq!(msg, "Unknown Request"),
        other => panic!("unexpected {:?}", other),
    }

    // the connection survives failed requests
    assert_eq!(remote.list_collections().unwrap().len(), 1);
    drop(remote);
    harness.stop();
}

#[test]
fn test_stop_remote_stream() {
    let harness = Harness::start(500);
    let remote = harness.connect("avro");

    let sink = Queue::new();
    let ack = remote
        .replay_collection_stream("adhd_sin", "Gaze", &attrs(), &sink, Transform::Identity, StreamOptions::default())
        .unwrap();
    let handle = ack.randseq.unwrap();
    for _ in 0..10 {
        assert!(!sink.get_timeout(WAIT).unwrap().is_eof());
    }
    remote.stop_task(&handle).unwrap();

    // records delivered before the stop may still be queued, then one EOF
    let mut ended = false;
    while let Some(msg) = sink.get_timeout(WAIT) {
        if msg.is_eof() {
            ended = true;
            break;
        }
    }
    assert!(ended);
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(sink.get_timeout(Duration::from_millis(300)), None);

    harness.stop();
}

#[test]
fn test_connect_to_closed_port_fails() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let err = RemoteApi::connect("websocket", "json", "127.0.0.1", port).err().unwrap();
    assert!(matches!(err, DataMuxError::Transport(_)));

    assert!(matches!(
        RemoteApi::connect("zeromq", "json", "127.0.0.1", port),
        Err(DataMuxError::Config(_))
    ));
    assert!(matches!(
        RemoteApi::connect("websocket", "msgpack", "127.0.0.1", port),
        Err(DataMuxError::Codec(_))
    ));
}

#[tokio::test]
async fn test_websocket_transport_exchanges_frames() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(Api::new(adhd_sin(dir.path(), 3)));
    let listener = DataMuxServer::bind("127.0.0.1", 0).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(DataMuxServer::new(api, "websocket").unwrap().serve(listener, shutdown.clone()));

    let mut client = WebSocketClient::new("avro");
    let (incoming_tx, mut incoming) = mpsc::unbounded_channel();
    let outgoing = client.connect("127.0.0.1", port, incoming_tx).await.unwrap();

    outgoing
        .send((rpc::TOPIC_LIST_COLLECTIONS.to_string(), json!({})))
        .unwrap();
    let (topic, content) = tokio::time::timeout(WAIT, incoming.recv()).await.unwrap().unwrap();
    assert_eq!(topic, rpc::TOPIC_LIST_COLLECTIONS);
    assert_eq!(content[0]["name"], "adhd_sin");

    client.disconnect().await;
    shutdown.cancel();
    server.await.unwrap().unwrap();
}
