use anyhow::Result;
use clap::Parser;

mod cli;

use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))?;

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn async_main(cli: Cli) -> Result<i32> {
    // Initialize logging: RUST_LOG, then --verbose, then the configured level.
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        cli::load_config(cli.config.as_deref())
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => cli::run::run(args, cli.config.as_deref()).await,
        Commands::Config(args) => cli::config::run(args, cli.config.as_deref())
            .await
            .map(|()| 0),
    }
}
