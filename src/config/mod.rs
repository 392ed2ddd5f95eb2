use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::client::ClientOptions;
use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Sandbox host executable (`~` is expanded)
    #[serde(default = "default_binary")]
    pub binary: String,

    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Extra environment for the host. Values of the form `${VAR}` or `$VAR`
    /// are read from the environment at load time.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Forward host stderr into the log (default: true)
    #[serde(default = "default_true")]
    pub forward_stderr: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Grace period for the host to exit on close
    #[serde(default = "default_close_timeout")]
    pub close_timeout_secs: u64,

    /// Per-request timeout in seconds (0 = none)
    #[serde(default)]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_binary() -> String {
    "matchlock".to_string()
}
fn default_args() -> Vec<String> {
    vec!["rpc".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_close_timeout() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            args: default_args(),
            env: BTreeMap::new(),
            forward_stderr: default_true(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            close_timeout_secs: default_close_timeout(),
            request_timeout_secs: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from the resolved config file. A missing file yields defaults.
    pub fn load() -> Result<Self> {
        let paths = Paths::resolve()?;
        let mut config = Self::load_from(&paths.config_file())?;
        config.paths = paths;
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.expand_env_vars();
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&self.paths.config_file())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }

    fn expand_env_vars(&mut self) {
        for value in self.host.env.values_mut() {
            *value = expand_env(value);
        }
    }

    /// Options for [`crate::Client::spawn`].
    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            binary: shellexpand::tilde(&self.host.binary).into_owned(),
            args: self.host.args.clone(),
            env: self.host.env.clone(),
            forward_stderr: self.host.forward_stderr,
            close_timeout: Duration::from_secs(self.client.close_timeout_secs),
            request_timeout: match self.client.request_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["host", "binary"] => Ok(self.host.binary.clone()),
            ["host", "args"] => Ok(self.host.args.join(" ")),
            ["host", "forward_stderr"] => Ok(self.host.forward_stderr.to_string()),
            ["host", "env", name] => self
                .host
                .env
                .get(*name)
                .cloned()
                .with_context(|| format!("host.env.{} is not set", name)),
            ["client", "close_timeout_secs"] => Ok(self.client.close_timeout_secs.to_string()),
            ["client", "request_timeout_secs"] => {
                Ok(self.client.request_timeout_secs.to_string())
            }
            ["logging", "level"] => Ok(self.logging.level.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["host", "binary"] => self.host.binary = value.to_string(),
            ["host", "args"] => {
                self.host.args = value.split_whitespace().map(str::to_string).collect()
            }
            ["host", "forward_stderr"] => self.host.forward_stderr = value.parse()?,
            ["host", "env", name] => {
                self.host.env.insert(name.to_string(), value.to_string());
            }
            ["client", "close_timeout_secs"] => self.client.close_timeout_secs = value.parse()?,
            ["client", "request_timeout_secs"] => {
                self.client.request_timeout_secs = value.parse()?
            }
            ["logging", "level"] => self.logging.level = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

fn expand_env(s: &str) -> String {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else if let Some(var_name) = s.strip_prefix('$') {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else {
        s.to_string()
    }
}

/// Written by `vmsandbox config init`.
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# vmsandbox configuration

[host]
# Sandbox host executable and arguments. The host speaks JSON-RPC on stdio.
binary = "matchlock"
args = ["rpc"]
forward_stderr = true

# Extra environment for the host process.
# [host.env]
# MATCHLOCK_STATE_DIR = "${HOME}/.local/state/matchlock"

[client]
# Seconds to wait for the host to exit on close before killing it
close_timeout_secs = 5
# Per-request timeout in seconds (0 = none)
request_timeout_secs = 0

[logging]
# Overridden by RUST_LOG
level = "info"
"#;
