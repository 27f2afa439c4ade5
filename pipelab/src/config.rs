//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{EngineError, EngineResult};

/// Configuration for [`Engine::open`](crate::Engine::open).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path of the active store file.
    #[serde(default = "default_active_store")]
    pub active_store: PathBuf,
    /// Path of the archive store file.
    #[serde(default = "default_archive_store")]
    pub archive_store: PathBuf,
    /// Identifier written as `origin_lab_id` into exported bundles.
    #[serde(default)]
    pub lab_id: Option<String>,
    /// How often a running pipeline refreshes its heartbeat.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// How old a heartbeat must be before `recover` reclaims the run.
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: u64,
    /// How long a writer waits for a competing lock.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Whether `Engine::open` runs crash recovery immediately.
    #[serde(default = "default_recover_on_open")]
    pub recover_on_open: bool,
}

fn default_active_store() -> PathBuf {
    PathBuf::from("pipelab.db")
}

fn default_archive_store() -> PathBuf {
    PathBuf::from("pipelab-archive.db")
}

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_stale_threshold_ms() -> u64 {
    60_000
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_recover_on_open() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            active_store: default_active_store(),
            archive_store: default_archive_store(),
            lab_id: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            stale_threshold_ms: default_stale_threshold_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
            recover_on_open: default_recover_on_open(),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Places both store files in `dir` under their default names.
    #[must_use]
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            active_store: dir.join(default_active_store()),
            archive_store: dir.join(default_archive_store()),
            ..Self::default()
        }
    }

    /// Reads a JSON configuration file; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let text = fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Parses a JSON configuration.
    pub fn from_json_str(json: &str) -> EngineResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the active store path.
    #[must_use]
    pub fn with_active_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.active_store = path.into();
        self
    }

    /// Sets the archive store path.
    #[must_use]
    pub fn with_archive_store(mut self, path: impl Into<PathBuf>) -> Self {
        self.archive_store = path.into();
        self
    }

    /// Sets the lab identifier.
    #[must_use]
    pub fn with_lab_id(mut self, lab_id: impl Into<String>) -> Self {
        self.lab_id = Some(lab_id.into());
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = duration_ms(interval);
        self
    }

    /// Sets the stale threshold.
    #[must_use]
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold_ms = duration_ms(threshold);
        self
    }

    /// Sets the busy timeout.
    #[must_use]
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout_ms = duration_ms(timeout);
        self
    }

    /// Enables or disables recovery on open.
    #[must_use]
    pub fn with_recover_on_open(mut self, recover: bool) -> Self {
        self.recover_on_open = recover;
        self
    }

    /// Gets the heartbeat interval as a Duration.
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Gets the stale threshold as a Duration.
    #[must_use]
    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    /// Gets the busy timeout as a Duration.
    #[must_use]
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Checks the configuration for values the engine cannot run with.
    pub fn validate(&self) -> EngineResult<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(EngineError::configuration(
                "heartbeat_interval_ms must be positive",
            ));
        }
        if self.stale_threshold_ms <= self.heartbeat_interval_ms {
            return Err(EngineError::configuration(format!(
                "stale_threshold_ms ({}) must exceed heartbeat_interval_ms ({})",
                self.stale_threshold_ms, self.heartbeat_interval_ms
            )));
        }
        if self.active_store.as_os_str().is_empty() || self.archive_store.as_os_str().is_empty() {
            return Err(EngineError::configuration("store paths must not be empty"));
        }
        if self.active_store == self.archive_store {
            return Err(EngineError::configuration(format!(
                "active and archive stores must differ (both are {})",
                self.active_store.display()
            )));
        }
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
