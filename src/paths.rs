//! XDG-style path resolution.
//!
//! The config directory is resolved through a three-level fallback:
//! 1. `VMSANDBOX_CONFIG_DIR`
//! 2. `XDG_CONFIG_HOME` via `etcetera`
//! 3. Platform default (~/.config)
//!
//! Relative paths from env vars are ignored.

use anyhow::Result;
use std::path::PathBuf;

/// Env var naming an explicit config file. Takes precedence over the
/// config directory.
pub const CONFIG_FILE_ENV: &str = "VMSANDBOX_CONFIG";

#[derive(Debug, Clone)]
pub struct Paths {
    /// config.toml lives here
    pub config_dir: PathBuf,
    /// Set when `VMSANDBOX_CONFIG` points at a specific file.
    pub config_file_override: Option<PathBuf>,
}

impl Paths {
    /// Resolve using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "VMSANDBOX_CONFIG_DIR", || {
            strategy.config_dir().join("vmsandbox")
        });

        let config_file_override = env_fn(CONFIG_FILE_ENV)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .map(|v| PathBuf::from(shellexpand::tilde(&v).into_owned()));

        Ok(Self {
            config_dir,
            config_file_override,
        })
    }

    /// Config file: `$VMSANDBOX_CONFIG`, else config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_file_override
            .clone()
            .unwrap_or_else(|| self.config_dir.join("config.toml"))
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::resolve().unwrap_or_else(|_| {
            let home = etcetera::home_dir().unwrap_or_else(|_| PathBuf::from("."));
            Self {
                config_dir: home.join(".config").join("vmsandbox"),
                config_file_override: None,
            }
        })
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .unwrap_or_else(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Helper: build an env_fn from a HashMap
    fn make_env(
        map: HashMap<&str, &str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn default_config_dir_is_xdg_compliant() {
        let paths = Paths::resolve_with_env(make_env(HashMap::new())).unwrap();
        assert!(
            paths.config_dir.ends_with("vmsandbox"),
            "config_dir: {:?}",
            paths.config_dir
        );
        assert!(paths.config_file().ends_with("vmsandbox/config.toml"));
    }

    #[test]
    fn config_dir_env_var_overrides_xdg() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("VMSANDBOX_CONFIG_DIR", "/custom/config");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.config_dir, PathBuf::from("/custom/config"));
        assert_eq!(paths.config_file(), PathBuf::from("/custom/config/config.toml"));
    }

    #[test]
    fn relative_config_dir_is_ignored() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("VMSANDBOX_CONFIG_DIR", "relative/path");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert!(paths.config_dir.is_absolute());
    }

    #[test]
    fn explicit_config_file_wins() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("VMSANDBOX_CONFIG_DIR", "/custom/config");
        env.insert("VMSANDBOX_CONFIG", "/etc/vmsandbox.toml");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.config_file(), PathBuf::from("/etc/vmsandbox.toml"));
    }
}
