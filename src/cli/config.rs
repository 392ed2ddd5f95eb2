use anyhow::{Context, Result};
use clap::{Args, Subcommand, ValueEnum};

use vmsandbox::config::{Config, DEFAULT_CONFIG_TEMPLATE};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show {
        #[arg(short, long, value_enum, default_value_t = Format::Toml)]
        format: Format,
    },

    /// Print one value (e.g. host.binary, host.env.MATCHLOCK_LOG)
    Get { key: String },

    /// Change one value and write the config file
    Set { key: String, value: String },

    /// Print where the config file is read from
    Path,

    /// Write a commented starter config
    Init {
        /// Replace an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Clone, Copy, ValueEnum)]
pub enum Format {
    Toml,
    Json,
}

pub async fn run(args: ConfigArgs, config_path: Option<&str>) -> Result<()> {
    let mut config = super::load_config(config_path)?;

    match args.command {
        ConfigCommands::Show { format } => {
            let rendered = match format {
                Format::Toml => toml::to_string_pretty(&config)?,
                Format::Json => serde_json::to_string_pretty(&config)?,
            };
            println!("{}", rendered);
        }
        ConfigCommands::Get { key } => println!("{}", config.get_value(&key)?),
        ConfigCommands::Set { key, value } => {
            config.set_value(&key, &value)?;
            config.save()?;
            println!("{} = {}", key, config.get_value(&key)?);
        }
        ConfigCommands::Path => {
            let path = config.paths.config_file();
            let state = if path.exists() { "" } else { " (not created yet)" };
            println!("{}{}", path.display(), state);
        }
        ConfigCommands::Init { force } => init(&config, force)?,
    }
    Ok(())
}

fn init(config: &Config, force: bool) -> Result<()> {
    let path = config.paths.config_file();
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to replace it",
            path.display()
        );
    }

    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE)
        .with_context(|| format!("Failed to write {}", path.display()))?;

    println!("Wrote {}", path.display());
    Ok(())
}
