//! Relay configuration loaded from TOML.
//!
//! Every field has a default, so an empty or missing file yields a working setup. Durations are
//! stored in milliseconds on disk and exposed as [`Duration`].

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::protocol::ActionKinds;

pub const DEFAULT_SOCK: &str = "/tmp/taskrelay.sock";
pub const SOCK_ENV: &str = "TASKRELAY_SOCK";
pub const CONFIG_ENV: &str = "TASKRELAY_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub socket_path: PathBuf,
    pub connection_timeout_ms: u64,
    pub queue_timeout_ms: u64,
    pub processing_timeout_ms: u64,
    pub max_reconnects: u32,
    pub reconnect_delay_ms: u64,
    pub item_delay_ms: u64,
    pub execution_timeout_ms: u64,
    /// Request types the daemon accepts; empty accepts any type.
    pub request_types: Vec<String>,
    pub kinds: ActionKinds,
    pub executor: ExecutorSection,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCK),
            connection_timeout_ms: 30_000,
            queue_timeout_ms: 30_000,
            processing_timeout_ms: 30_000,
            max_reconnects: 3,
            reconnect_delay_ms: 250,
            item_delay_ms: 1_500,
            execution_timeout_ms: 60_000,
            request_types: vec!["run".into()],
            kinds: ActionKinds::default(),
            executor: ExecutorSection::default(),
        }
    }
}

/// External program run for every dequeued request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub program: Option<String>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl RelayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Loads the config file, falling back to defaults when it is absent or unreadable.
    pub fn load(config_path: Option<&Path>) -> Self {
        let Some(path) = config_path else {
            return Self::default().with_env_overrides();
        };

        let contents = match fs::read_to_string(path) {
            Ok(value) => value,
            Err(err) => {
                warn!("Failed to read config file {}: {}", path.display(), err);
                return Self::default().with_env_overrides();
            }
        };

        match Self::from_toml_str(&contents) {
            Ok(cfg) => {
                info!("Loaded relay configuration from {}", path.display());
                cfg.with_env_overrides()
            }
            Err(err) => {
                warn!("Failed to parse {}: {}", path.display(), err);
                Self::default().with_env_overrides()
            }
        }
    }

    /// Resolves the config path from an explicit flag, then `TASKRELAY_CONFIG`, then
    /// `./taskrelay.toml` when it exists.
    pub fn resolve_path(explicit: Option<PathBuf>) -> Option<PathBuf> {
        explicit
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
            .or_else(|| {
                let candidate = std::env::current_dir().ok()?.join("taskrelay.toml");
                if candidate.is_file() {
                    Some(candidate)
                } else {
                    None
                }
            })
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var(SOCK_ENV) {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                self.socket_path = PathBuf::from(trimmed);
            }
        }
        self
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn item_delay(&self) -> Duration {
        Duration::from_millis(self.item_delay_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }
}
