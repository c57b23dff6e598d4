//! DataMux: the StreamingHub streaming runtime.
//!
//! Replays recorded collections and proxies live sources into bounded
//! queues, runs source/pipe/sink pipelines over them, and serves the same
//! API to remote clients over WebSocket with JSON or Avro framing.

pub mod api;
pub mod collection;
pub mod error;
pub mod live;
pub mod message;
pub mod proxy;
pub mod queue;
pub mod reader;
pub mod remote;
pub mod rpc;
pub mod signals;
pub mod task;
pub mod transform;
pub mod util;

pub use api::{Api, ApiStreamer, DataMuxApi, StreamAck};
pub use collection::CollectionManager;
pub use error::{DataMuxError, Result};
pub use live::{LiveBus, Outlet, OutletInfo, Subscription};
pub use message::{Envelope, Message, Record, Scalars};
pub use proxy::{Proxy, ProxyManager};
pub use queue::{Flag, Queue, QueueError};
pub use reader::{spawn_worker, spawn_worker_with, AttachRequest, Emitter, Reader, StreamOptions};
pub use remote::{DataMuxServer, RemoteApi};
pub use task::{Pipeline, Task, TaskKind};
pub use transform::{Enveloper, Transform, TransformRegistry, TransformSpec};
