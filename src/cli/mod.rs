pub mod config;
pub mod run;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::Path;

use vmsandbox::config::Config;

#[derive(Parser)]
#[command(name = "vmsandbox")]
#[command(author, version, about = "Run commands in a VM sandbox")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "VMSANDBOX_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Boot a sandbox, run one command in it and tear it down
    Run(run::RunArgs),

    /// Configuration management
    Config(config::ConfigArgs),
}

/// Load the config from `--config` if given, else from the default location.
pub fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            let path = shellexpand::tilde(path).into_owned();
            let mut config = Config::load_from(Path::new(&path))?;
            config.paths.config_file_override = Some(path.into());
            Ok(config)
        }
        None => Config::load(),
    }
}
