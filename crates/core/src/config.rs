//! Checkpoint configuration via `stasis.toml`
//!
//! A default `stasis.toml` can be written next to the checkpoint images. To
//! change settings, edit the file and restart the process.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{StasisError, StasisResult};

/// Config file name placed in the image directory.
pub const CONFIG_FILE_NAME: &str = "stasis.toml";

/// How periodic tasks treat periods missed while they could not run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissedFiringPolicy {
    /// At most one firing is owed after a gap
    #[default]
    Coalesce,
    /// Every missed period fires, back to back
    Replay,
}

impl MissedFiringPolicy {
    /// Parse the config string form
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `"coalesce"` or `"replay"`.
    pub fn parse(value: &str) -> StasisResult<Self> {
        match value {
            "coalesce" => Ok(MissedFiringPolicy::Coalesce),
            "replay" => Ok(MissedFiringPolicy::Replay),
            other => Err(StasisError::invalid_config(format!(
                "Invalid missed_firings '{}' in stasis.toml. Expected \"coalesce\" or \"replay\".",
                other
            ))),
        }
    }
}

/// Checkpoint configuration loaded from `stasis.toml`.
///
/// # Example
///
/// ```toml
/// min_restore_advance_us = 1000
/// max_tardiness_ms = 4000
/// missed_firings = "coalesce"
/// quiesce_timeout_ms = 5000
/// image_dir = "/var/lib/app/checkpoint"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StasisConfig {
    /// Minimum monotonic advance applied across a restore, in microseconds.
    #[serde(default = "default_min_restore_advance_us")]
    pub min_restore_advance_us: u64,
    /// Scheduler tardiness budget in milliseconds.
    #[serde(default = "default_max_tardiness_ms")]
    pub max_tardiness_ms: u64,
    /// Missed periodic firings: `"coalesce"` or `"replay"`.
    #[serde(default = "default_missed_firings")]
    pub missed_firings: String,
    /// How long to wait for each participant to park, in milliseconds.
    #[serde(default = "default_quiesce_timeout_ms")]
    pub quiesce_timeout_ms: u64,
    /// Default checkpoint image directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_dir: Option<PathBuf>,
}

fn default_min_restore_advance_us() -> u64 {
    1_000
}

fn default_max_tardiness_ms() -> u64 {
    4_000
}

fn default_missed_firings() -> String {
    "coalesce".to_string()
}

fn default_quiesce_timeout_ms() -> u64 {
    5_000
}

impl Default for StasisConfig {
    fn default() -> Self {
        Self {
            min_restore_advance_us: default_min_restore_advance_us(),
            max_tardiness_ms: default_max_tardiness_ms(),
            missed_firings: default_missed_firings(),
            quiesce_timeout_ms: default_quiesce_timeout_ms(),
            image_dir: None,
        }
    }
}

impl StasisConfig {
    /// Minimum monotonic advance across a restore
    pub fn min_restore_advance(&self) -> Duration {
        Duration::from_micros(self.min_restore_advance_us)
    }

    /// Scheduler tardiness budget
    pub fn max_tardiness(&self) -> Duration {
        Duration::from_millis(self.max_tardiness_ms)
    }

    /// Per-participant quiesce timeout
    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_millis(self.quiesce_timeout_ms)
    }

    /// Parse the missed-firings string into a policy.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not `"coalesce"` or `"replay"`.
    pub fn missed_firing_policy(&self) -> StasisResult<MissedFiringPolicy> {
        MissedFiringPolicy::parse(&self.missed_firings)
    }

    /// Check every field.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> StasisResult<()> {
        self.missed_firing_policy()?;
        if self.quiesce_timeout_ms == 0 {
            return Err(StasisError::invalid_config(
                "quiesce_timeout_ms must be greater than zero",
            ));
        }
        let advance_nanos = self
            .min_restore_advance_us
            .checked_mul(1_000)
            .and_then(|n| i64::try_from(n).ok());
        if advance_nanos.is_none() {
            return Err(StasisError::invalid_config(
                "min_restore_advance_us does not fit in a signed nanosecond offset",
            ));
        }
        Ok(())
    }

    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Stasis checkpoint configuration
#
# Minimum amount (microseconds) the monotonic clock advances across a
# restore, even when the wall clock shows no gap (default: 1000)
min_restore_advance_us = 1000

# Scheduler tardiness budget (milliseconds). Timer firings later than
# due + budget are counted and logged as tardy (default: 4000)
max_tardiness_ms = 4000

# Periodic tasks after a gap: "coalesce" (default) fires once,
# "replay" fires every missed period back to back
missed_firings = "coalesce"

# How long to wait for each participant to park before the
# checkpoint hard-fails (milliseconds, default: 5000)
quiesce_timeout_ms = 5000

# Default image directory for checkpoint_default()
# image_dir = "/var/lib/app/checkpoint"
"#
    }

    /// Read and parse config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> StasisResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StasisConfig = toml::from_str(&content).map_err(|e| {
            StasisError::invalid_config(format!(
                "Failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        // Validate eagerly
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    ///
    /// Returns `Ok(())` whether the file was created or already existed.
    pub fn write_default_if_missing(path: &Path) -> StasisResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> StasisResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            StasisError::invalid_config(format!("Failed to serialize config: {}", e))
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
