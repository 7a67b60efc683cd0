// SPDX-License-Identifier: MIT

//! Layered configuration: an optional TOML file, overridden by environment
//! variables, overridden by explicit CLI flags. Centralizes every
//! environment lookup in one place rather than scattering `std::env::var`
//! calls through the codebase.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },

    #[error("failed to parse config file {path}: {source}")]
    Parse { path: PathBuf, #[source] source: toml::de::Error },

    #[error("no listen URLs configured; pass --listen or set DSD_LISTEN")]
    NoListeners,
}

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    listen: Option<Vec<String>>,
    shards: Option<usize>,
    idle_timeout_secs: Option<u64>,
    gentle_hup: Option<bool>,
    backlog: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen: Vec<String>,
    pub shards: usize,
    pub idle_timeout: Option<Duration>,
    pub gentle_hup: bool,
    pub backlog: i32,
    pub systemd_notify: bool,
}

impl Config {
    /// Resolve the final configuration: CLI flags win, then environment
    /// variables, then the file, then these built-in defaults.
    pub fn load(cli: &crate::Cli) -> Result<Self, ConfigError> {
        let file = match config_path(cli) {
            Some(path) => load_file(&path)?,
            None => FileConfig::default(),
        };

        let listen = if !cli.listen.is_empty() {
            cli.listen.clone()
        } else if let Ok(env_listen) = std::env::var("DSD_LISTEN") {
            env_listen.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect()
        } else {
            file.listen.unwrap_or_default()
        };
        if listen.is_empty() {
            return Err(ConfigError::NoListeners);
        }

        let shards = cli
            .shards
            .or_else(|| std::env::var("DSD_SHARDS").ok().and_then(|s| s.parse().ok()))
            .or(file.shards)
            .unwrap_or(1)
            .next_power_of_two();

        let idle_timeout_secs = cli
            .idle_timeout_secs
            .or_else(|| std::env::var("DSD_IDLE_TIMEOUT_SECS").ok().and_then(|s| s.parse().ok()))
            .or(file.idle_timeout_secs);

        let gentle_hup = cli.gentle_hup
            || std::env::var("DSD_GENTLE_HUP").ok().as_deref() == Some("1")
            || file.gentle_hup.unwrap_or(false);

        let backlog = cli.backlog.or(file.backlog).unwrap_or(dsd_core::DEFAULT_LISTEN_BACKLOG);

        Ok(Self {
            listen,
            shards,
            idle_timeout: idle_timeout_secs.filter(|s| *s > 0).map(Duration::from_secs),
            gentle_hup,
            backlog,
            systemd_notify: cli.systemd_notify,
        })
    }
}

fn config_path(cli: &crate::Cli) -> Option<PathBuf> {
    cli.config.clone().or_else(|| std::env::var("DSD_CONFIG_FILE").ok().map(PathBuf::from))
}

fn load_file(path: &PathBuf) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read { path: path.clone(), source: e })?;
    toml::from_str(&text).map_err(|e| ConfigError::Parse { path: path.clone(), source: e })
}
