//! Configuration for the engine and the daemon around it.
//!
//! Loaded from a TOML file; every field has a default so an empty file (or
//! no file at all) yields a working configuration. Command-line flags
//! override on top of this in the daemon.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::logging::LogConfig;

/// Engine-level tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ceiling on bytes retained across all event stores.
    pub max_memory_bytes: usize,

    /// Whether newly attached instances refuse administrative stores by
    /// default. Per-instance attachment can override this.
    pub restricted_default: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: default_max_memory_bytes(),
            restricted_default: false,
        }
    }
}

fn default_max_memory_bytes() -> usize {
    2 * 1024 * 1024
}

/// Full daemon configuration: the engine plus its surroundings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    /// Engine tunables.
    pub engine: EngineConfig,

    /// Collection behaviour.
    pub collect: CollectConfig,

    /// Logging behaviour.
    pub log: LogConfig,
}

/// Channel discovery and refresh cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectConfig {
    /// Directory scanned for trace channels named `<pid>.<parent_pid>`.
    pub channel_dir: PathBuf,

    /// Milliseconds between refresh passes (discovery + lifecycle).
    pub refresh_interval_ms: u64,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            channel_dir: default_channel_dir(),
            refresh_interval_ms: default_refresh_interval(),
        }
    }
}

fn default_channel_dir() -> PathBuf {
    PathBuf::from("/tmp/shelltrace")
}

fn default_refresh_interval() -> u64 {
    1_000
}

impl DaemonConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&raw)
    }

    /// Parse configuration from TOML text.
    pub fn parse(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(format!("invalid config: {e}")))
    }
}
