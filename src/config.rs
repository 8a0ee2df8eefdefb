// src/config.rs
//! Update engine configuration
//!
//! All directories and the converter location are configuration, not
//! constants. A config can be built in code, derived from a single root
//! directory, or loaded from a TOML file with an `[update]` table:
//!
//! ```toml
//! [update]
//! tmp_dir = "/var/lib/sensor/tmp"
//! ai_model_dir = "/var/lib/sensor/network"
//! json_dir = "/var/lib/sensor/json"
//! state_dir = "/var/lib/sensor/state"
//! converter_path = "/usr/bin/fpk2rpk"
//! max_ai_model_count = 4
//!
//! [update.wait]
//! initial_interval_ms = 100
//! max_interval_ms = 5000
//! attempts = 5
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default number of AI-model slots
pub const DEFAULT_MAX_AI_MODEL_COUNT: usize = 4;

/// Default key of the network entry in generated JSON descriptors
pub const DEFAULT_NETWORK_NAME: &str = "imx500_no_process";

/// Backoff policy for waiting on the format converter
///
/// The supervisor waits `initial_interval_ms`, then doubles the interval
/// on each attempt, never sleeping longer than `max_interval_ms` at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionWait {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub attempts: u32,
}

impl Default for ConversionWait {
    fn default() -> Self {
        Self {
            initial_interval_ms: 100,
            max_interval_ms: 5_000,
            attempts: 5,
        }
    }
}

impl ConversionWait {
    /// Sleep interval used for the given zero-based attempt
    pub fn interval(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self
            .initial_interval_ms
            .saturating_mul(factor)
            .min(self.max_interval_ms);
        Duration::from_millis(ms)
    }

    /// Upper bound of the whole wait, excluding the kill grace period
    pub fn total(&self) -> Duration {
        (0..self.attempts).map(|a| self.interval(a)).sum()
    }
}

/// Update engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Working directory for the raw artifact, manifest and converter log
    pub tmp_dir: PathBuf,
    /// Destination of converted AI-model binaries
    pub ai_model_dir: PathBuf,
    /// Destination of generated JSON descriptors
    pub json_dir: PathBuf,
    /// Engine-private state: journal and process lock
    pub state_dir: PathBuf,
    /// Format converter executable
    pub converter_path: PathBuf,
    #[serde(default = "default_max_ai_model_count")]
    pub max_ai_model_count: usize,
    #[serde(default)]
    pub wait: ConversionWait,
    #[serde(default = "default_network_name")]
    pub network_name: String,
}

fn default_max_ai_model_count() -> usize {
    DEFAULT_MAX_AI_MODEL_COUNT
}

fn default_network_name() -> String {
    DEFAULT_NETWORK_NAME.to_string()
}

#[derive(Deserialize)]
struct ConfigFile {
    update: UpdateConfig,
}

impl UpdateConfig {
    /// Derive every directory beneath a single root
    ///
    /// The converter is expected at `<root>/bin/fpk2rpk`.
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            tmp_dir: root.join("tmp"),
            ai_model_dir: root.join("network"),
            json_dir: root.join("json"),
            state_dir: root.join("state"),
            converter_path: root.join("bin").join("fpk2rpk"),
            max_ai_model_count: DEFAULT_MAX_AI_MODEL_COUNT,
            wait: ConversionWait::default(),
            network_name: default_network_name(),
        }
    }

    /// Replace the converter executable
    pub fn with_converter<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.converter_path = path.into();
        self
    }

    /// Replace the converter wait policy
    pub fn with_wait(mut self, wait: ConversionWait) -> Self {
        self.wait = wait;
        self
    }

    /// Parse a config from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(content)
            .map_err(|e| Error::InvalidArgument(format!("Invalid update config: {}", e)))?;
        file.update.validate()?;
        Ok(file.update)
    }

    /// Load a config from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Check the config is usable
    pub fn validate(&self) -> Result<()> {
        for (name, dir) in [
            ("tmp_dir", &self.tmp_dir),
            ("ai_model_dir", &self.ai_model_dir),
            ("json_dir", &self.json_dir),
            ("state_dir", &self.state_dir),
            ("converter_path", &self.converter_path),
        ] {
            if !dir.is_absolute() {
                return Err(Error::InvalidArgument(format!(
                    "{} must be an absolute path: {}",
                    name,
                    dir.display()
                )));
            }
        }
        if self.max_ai_model_count == 0 {
            return Err(Error::InvalidArgument(
                "max_ai_model_count must be at least 1".to_string(),
            ));
        }
        if self.network_name.is_empty() {
            return Err(Error::InvalidArgument("network_name is empty".to_string()));
        }
        Ok(())
    }

    /// Raw artifact written while streaming a package
    pub fn raw_artifact_path(&self) -> PathBuf {
        self.tmp_dir.join("network.fpk")
    }

    /// Text manifest trailing the package
    pub fn manifest_path(&self) -> PathBuf {
        self.tmp_dir.join("network_info.txt")
    }

    /// Converter stdout/stderr
    pub fn converter_log_path(&self) -> PathBuf {
        self.tmp_dir.join("fpk2rpk.log")
    }

    /// Converter output before it is moved into place
    pub fn staged_binary_path(&self) -> PathBuf {
        self.tmp_dir.join("network.rpk")
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.state_dir.join("journal")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("update.lock")
    }
}
