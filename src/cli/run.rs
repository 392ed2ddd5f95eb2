use anyhow::{Context, Result};
use clap::Args;
use std::io::Write;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use vmsandbox::{Client, CreateOptions, ExecOptions, OutputStream};

#[derive(Args)]
pub struct RunArgs {
    /// Image to boot (e.g. alpine:latest)
    #[arg(long)]
    pub image: String,

    /// Number of vCPUs
    #[arg(long)]
    pub cpus: Option<u32>,

    /// Memory in MiB
    #[arg(long, value_name = "MB")]
    pub memory: Option<u64>,

    /// Host the sandbox may reach (repeatable)
    #[arg(long = "allow-host", value_name = "HOST")]
    pub allow_hosts: Vec<String>,

    /// Environment variable for the sandbox (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    pub env: Vec<(String, String)>,

    /// Working directory inside the sandbox
    #[arg(short = 'w', long)]
    pub workdir: Option<String>,

    /// Give up on the command after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Command to run
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", s))
}

/// Returns the command's exit code.
pub async fn run(args: RunArgs, config_path: Option<&str>) -> Result<i32> {
    let config = super::load_config(config_path)?;
    let client = Client::spawn(config.client_options())
        .with_context(|| format!("Failed to start sandbox host {}", config.host.binary))?;

    let outcome = run_in_sandbox(&client, args).await;

    if let Err(e) = client.close(None).await {
        warn!(error = %e, "sandbox did not shut down cleanly");
    }
    outcome
}

async fn run_in_sandbox(client: &Client, args: RunArgs) -> Result<i32> {
    let mut options = CreateOptions::new(&args.image);
    options.cpus = args.cpus;
    options.memory_mb = args.memory;
    options.allowed_hosts = args.allow_hosts;
    options.env = args.env.into_iter().collect();

    let vm_id = client
        .create(options)
        .await
        .with_context(|| format!("Failed to create sandbox from {}", args.image))?;
    info!(%vm_id, "sandbox ready");

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            debug!("interrupt received; cancelling command");
            on_interrupt.cancel();
        }
    });

    let exec = ExecOptions {
        working_dir: args.workdir,
        cancel: Some(cancel),
        timeout: args.timeout.map(Duration::from_secs),
    };
    let command = args.command.join(" ");

    let result = client
        .exec_stream(&command, exec, |stream, data| {
            // Nowhere to report a broken pipe to.
            let _ = match stream {
                OutputStream::Stdout => std::io::stdout().lock().write_all(data),
                OutputStream::Stderr => std::io::stderr().lock().write_all(data),
            };
        })
        .await
        .with_context(|| format!("Command failed: {}", command))?;

    debug!(exit_code = result.exit_code, duration_ms = result.duration_ms, "command finished");
    Ok(result.exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_value_pairs_split_on_first_equals() {
        assert_eq!(
            parse_key_value("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
    }
}
