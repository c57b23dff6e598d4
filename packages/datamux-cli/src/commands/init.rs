use anyhow::Context;
use dfds::Config;
use std::path::PathBuf;

use crate::cli::InitArgs;
use crate::exit_codes;

pub fn execute(args: InitArgs) -> i32 {
    match run(args) {
        Ok(path) => {
            println!("Wrote {}", path.display());
            exit_codes::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {:#}", e);
            exit_codes::ERROR
        }
    }
}

fn run(args: InitArgs) -> anyhow::Result<PathBuf> {
    let data_dir = args.dirs.data_dir.context("--data_dir is required")?;
    let meta_dir = args.dirs.meta_dir.context("--meta_dir is required")?;
    let config = Config::new(&data_dir, &meta_dir)?;

    let path = match args.output {
        Some(path) => PathBuf::from(path),
        None => Config::default_path().context("Cannot locate the home directory")?,
    };
    config
        .save(&path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
