//! File-backed configuration, one section per component.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use action_dispatch::DispatchConfig;
use agent_loop::LoopConfig;
use cdp_session::SessionConfig;
use dom_perceiver::PerceiverConfig;
use session_watchdogs::WatchdogConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Top-level configuration. Every field defaults, so an empty or missing
/// file yields a working setup and a partial file overrides selectively.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HelmsmanConfig {
    pub session: SessionConfig,
    pub perceiver: PerceiverConfig,
    pub watchdogs: WatchdogConfig,
    pub dispatch: DispatchConfig,
    pub orchestration: LoopConfig,
}

impl HelmsmanConfig {
    /// Load configuration. An explicit path must exist and parse; with no
    /// path, the well-known location is tried and silently skipped when
    /// absent.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let Some(path) = default_config_path() else {
                    return Ok(Self::default());
                };
                if !path.exists() {
                    warn!(
                        target: "cli",
                        path = %path.display(),
                        "no config file; using defaults"
                    );
                    return Ok(Self::default());
                }
                path
            }
        };

        let content = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let config = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        info!(target: "cli", path = %path.display(), "configuration loaded");
        Ok(config)
    }
}

fn default_config_path() -> Option<PathBuf> {
    let mut path = dirs::config_dir()?;
    path.push("helmsman");
    path.push("config.yaml");
    Some(path)
}
