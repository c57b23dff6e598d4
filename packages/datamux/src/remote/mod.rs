// Remote access to a DataMux API
//
// `DataMuxServer` exposes an `Api` over an RPC transport; `RemoteApi`
// implements the same `DataMuxApi` surface on the client side. Streaming
// records travel as frames whose topic is the attach handle:
//
//   client                       server
//   replay_collection_stream --> Api::replay(sink = data queue,
//                                  transform = envelope(prefix = handle,
//                                                       suffix = connection))
//            <-- ack {randseq}
//            <-- d_XXXXX {record}   (requeued from the data queue)
//            <-- d_XXXXX {}         (end of stream)

mod api;
mod server;

use dfds::Attrs;
use serde::{Deserialize, Serialize};

use crate::reader::StreamOptions;
use crate::transform::TransformSpec;

pub use api::{RemoteApi, REQUEST_TIMEOUT};
pub use server::DataMuxServer;

fn enabled() -> bool {
    true
}

/// Content of the attach-like requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct StreamRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub stream_id: String,
    #[serde(default)]
    pub attrs: Attrs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformSpec>,
    #[serde(default = "enabled")]
    pub rate_limit: bool,
    #[serde(default = "enabled")]
    pub strict_time: bool,
    #[serde(default = "enabled")]
    pub use_relative_ts: bool,
}

impl StreamRequest {
    pub fn options(&self) -> StreamOptions {
        StreamOptions {
            rate_limit: self.rate_limit,
            strict_time: self.strict_time,
            use_relative_ts: self.use_relative_ts,
        }
    }
}
