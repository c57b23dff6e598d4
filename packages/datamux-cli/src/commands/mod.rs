pub mod init;
pub mod replay;
pub mod serve;

use anyhow::Context;
use dfds::{Config, PartialConfig};

use crate::cli::DirArgs;

/// Resolve the configuration, with the directory flags taking precedence.
pub fn load_config(dirs: &DirArgs) -> anyhow::Result<Config> {
    let overrides = PartialConfig {
        data_dir: dirs.data_dir.clone(),
        meta_dir: dirs.meta_dir.clone(),
    };
    Config::load_with(overrides).context("Invalid configuration; run `streaminghub-datamux init` or pass --data_dir and --meta_dir")
}
