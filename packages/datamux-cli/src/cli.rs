use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "streaminghub-datamux",
    version,
    about = "StreamingHub DataMux: replay, proxy and serve biosensor streams",
    long_about = "Replay recorded DFDS collections, proxy live streams and serve both over WebSocket.\n\
                  Directories are read from ~/.streaminghubrc and ./.streaminghubrc unless given as flags."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Serve the DataMux API to remote clients
    Serve(ServeArgs),
    /// Write the data and metadata directories to the config file
    Init(InitArgs),
    /// Replay the streams of a collection and log every record
    Replay(ReplayArgs),
}

#[derive(Args, Clone, Default)]
pub struct DirArgs {
    /// Directory holding the recorded collections
    #[arg(long = "data_dir")]
    pub data_dir: Option<String>,

    /// Directory holding the *.collection.json descriptors
    #[arg(long = "meta_dir")]
    pub meta_dir: Option<String>,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "STREAMINGHUB_PORT", default_value_t = 3300)]
    pub port: u16,

    /// RPC transport
    #[arg(long, default_value = "websocket")]
    pub rpc: String,

    #[command(flatten)]
    pub dirs: DirArgs,
}

#[derive(Args)]
pub struct InitArgs {
    #[command(flatten)]
    pub dirs: DirArgs,

    /// Config file to write (default: ~/.streaminghubrc)
    #[arg(long, env = "STREAMINGHUB_RC")]
    pub output: Option<String>,
}

#[derive(Args)]
pub struct ReplayArgs {
    /// Collection to replay
    #[arg(long = "collection-name")]
    pub collection_name: String,

    /// Only replay streams carrying these attributes (k=v,k=v)
    #[arg(long)]
    pub attributes: Option<String>,

    #[command(flatten)]
    pub dirs: DirArgs,

    /// Replay through the server at this address instead of locally
    #[arg(long)]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long, env = "STREAMINGHUB_PORT", default_value_t = 3300)]
    pub port: u16,

    /// RPC transport
    #[arg(long, default_value = "websocket")]
    pub rpc: String,

    /// Wire codec (json, avro)
    #[arg(long, default_value = "json")]
    pub codec: String,

    /// Emit records as fast as possible
    #[arg(long, default_value_t = false)]
    pub no_rate_limit: bool,
}
