use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from watchdog.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct WatchdogFileConfig {
    pub transfer: TransferConfig,
    pub watchdog: WatchdogConfig,
    pub activity: ActivityConfig,
    pub repeat: RepeatConfig,
    pub shutdown: ShutdownConfig,
}

/// The command to supervise. Built elsewhere; not interpreted here.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Extra environment variables for the child.
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub rate_floor_bytes_per_sec: u64,
    pub stale_after_secs: u64,
    pub poll_interval_ms: u64,
    pub read_chunk_bytes: usize,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ActivityConfig {
    pub terminate_after_secs: u64,
    pub kill_after_secs: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct RepeatConfig {
    pub interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub interrupt_grace_ms: u64,
}

/// Values from the command line that take precedence over the file.
#[derive(Debug, Default)]
pub struct Overrides {
    pub command: Vec<String>,
    pub repeat_secs: Option<u64>,
    pub rate_floor: Option<u64>,
    pub stale_after_secs: Option<u64>,
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl WatchdogFileConfig {
    /// Load from `path`. A missing file is only tolerated when
    /// `required` is false, in which case defaults are returned.
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn apply(&mut self, overrides: Overrides) {
        if let Some((command, args)) = overrides.command.split_first() {
            self.transfer.command = command.clone();
            self.transfer.args = args.to_vec();
        }
        if overrides.repeat_secs.is_some() {
            self.repeat.interval_secs = overrides.repeat_secs;
        }
        if let Some(floor) = overrides.rate_floor {
            self.watchdog.rate_floor_bytes_per_sec = floor;
        }
        if let Some(secs) = overrides.stale_after_secs {
            self.watchdog.stale_after_secs = secs;
        }
    }

    /// Executable followed by its arguments.
    pub fn command_vector(&self) -> Vec<String> {
        if self.transfer.command.is_empty() {
            return Vec::new();
        }
        std::iter::once(self.transfer.command.clone())
            .chain(self.transfer.args.iter().cloned())
            .collect()
    }
}

impl WatchdogConfig {
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl ActivityConfig {
    pub fn terminate_after(&self) -> Duration {
        Duration::from_secs(self.terminate_after_secs)
    }

    pub fn kill_after(&self) -> Duration {
        Duration::from_secs(self.kill_after_secs)
    }
}

// --- Default implementations ---

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            command: "rsync".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            rate_floor_bytes_per_sec: 100_000,
            stale_after_secs: 30,
            poll_interval_ms: 40,
            read_chunk_bytes: 512,
        }
    }
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            terminate_after_secs: 60,
            kill_after_secs: 120,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            interrupt_grace_ms: 1250,
        }
    }
}
