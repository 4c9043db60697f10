//! Runtime pool configuration loaded from JSON.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::thunk::Platform;

/// The set of backends the pool may dispatch to, in priority order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub runtimes: Vec<RuntimeConfig>,
}

/// One pool entry: a platform constraint and a backend with its settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub platform: Option<Platform>,
    pub runtime: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            runtimes: vec![RuntimeConfig {
                platform: None,
                runtime: "local".to_string(),
                config: serde_json::Value::Null,
            }],
        }
    }
}

impl Config {
    pub fn parse(text: &str) -> Result<Config> {
        serde_json::from_str(text).context("invalid kiln config")
    }

    /// Load from `explicit`, `$KILN_CONFIG` or the user config dir, falling
    /// back to the default when none of those files exist.
    pub fn load(explicit: Option<&Path>) -> Result<Config> {
        if let Some(path) = explicit {
            return Config::read(path);
        }
        if let Some(path) = env::var_os("KILN_CONFIG") {
            return Config::read(Path::new(&path));
        }
        match config_dir().map(|dir| dir.join("config.json")) {
            Some(path) if path.exists() => Config::read(&path),
            _ => Ok(Config::default()),
        }
    }

    fn read(path: &Path) -> Result<Config> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Config::parse(&text).with_context(|| format!("in {}", path.display()))
    }
}

fn home_relative(xdg: &str, fallback: &str) -> Option<PathBuf> {
    match env::var_os(xdg) {
        Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir).join("kiln")),
        _ => env::var_os("HOME").map(|home| PathBuf::from(home).join(fallback).join("kiln")),
    }
}

pub fn config_dir() -> Option<PathBuf> {
    home_relative("XDG_CONFIG_HOME", ".config")
}

/// Default data directory for backends that keep state on disk.
pub fn data_dir() -> PathBuf {
    home_relative("XDG_DATA_HOME", ".local/share").unwrap_or_else(|| env::temp_dir().join("kiln"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn default_is_one_unconstrained_local_runtime() {
        let config = Config::default();
        assert_eq!(config.runtimes.len(), 1);
        assert_eq!(config.runtimes[0].runtime, "local");
        assert_eq!(config.runtimes[0].platform, None);
    }

    #[test]
    fn parses_platforms_and_backend_settings() -> Result<()> {
        let config = Config::parse(
            r#"{"runtimes": [
                {"platform": {"os": "linux", "arch": "arm64"}, "runtime": "remote",
                 "config": {"url": "http://builder:6455"}},
                {"platform": {"os": "linux"}, "runtime": "docker"}
            ]}"#,
        )?;
        assert_eq!(config.runtimes[0].platform, Some(Platform::new("linux", Some("arm64"))));
        assert_eq!(config.runtimes[0].config["url"], "http://builder:6455");
        assert_eq!(config.runtimes[1].platform, Some(Platform::new("linux", None)));
        assert_eq!(config.runtimes[1].config, serde_json::Value::Null);
        Ok(())
    }

    #[test]
    fn explicit_path_wins() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("kiln.json");
        fs::write(&path, r#"{"runtimes": [{"runtime": "docker"}]}"#)?;
        let config = Config::load(Some(&path))?;
        assert_eq!(config.runtimes[0].runtime, "docker");
        assert!(Config::load(Some(&dir.path().join("missing.json"))).is_err());
        Ok(())
    }
}
