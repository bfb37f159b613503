//! Configuration types for the notification registry and the demo panel.

use crate::error::{HooksError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    /// Registry timing settings.
    pub registry: RegistryConfig,
    /// Settings for the `shellhooks-demo` binary.
    pub demo: DemoConfig,
}

/// Timing for debounce, initial delivery and compaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Quiet period after the last upstream change before a dispatch sweep runs.
    ///
    /// Long enough to coalesce bursts from rapid upstream churn, short enough
    /// to feel instantaneous.
    pub debounce_ms: u64,
    /// Period of the compaction sweep.
    ///
    /// Also the staleness bound: no live subscriber goes longer than this
    /// without a liveness recheck.
    pub compaction_interval_ms: u64,
    /// Delay before a new subscriber receives its initial snapshot.
    pub initial_delivery_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 50,
            compaction_interval_ms: 5_000,
            initial_delivery_ms: 10,
        }
    }
}

impl RegistryConfig {
    /// Debounce delay as a [`Duration`].
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Compaction period as a [`Duration`].
    pub fn compaction_interval(&self) -> Duration {
        Duration::from_millis(self.compaction_interval_ms)
    }

    /// Initial delivery delay as a [`Duration`].
    pub fn initial_delivery(&self) -> Duration {
        Duration::from_millis(self.initial_delivery_ms)
    }

    /// Reject timings the registry cannot honour.
    ///
    /// # Errors
    ///
    /// Returns [`HooksError::Config`] when the debounce or compaction period is
    /// zero, or when compaction would run more often than dispatch.
    pub fn validate(&self) -> Result<()> {
        if self.debounce_ms == 0 {
            return Err(HooksError::Config("debounce_ms must be > 0".to_owned()));
        }
        if self.compaction_interval_ms == 0 {
            return Err(HooksError::Config(
                "compaction_interval_ms must be > 0".to_owned(),
            ));
        }
        if self.compaction_interval_ms < self.debounce_ms {
            return Err(HooksError::Config(format!(
                "compaction_interval_ms ({}) must not be shorter than debounce_ms ({})",
                self.compaction_interval_ms, self.debounce_ms
            )));
        }
        Ok(())
    }
}

/// Demo binary settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Number of upstream changes fired in the simulated burst.
    pub burst_len: u32,
    /// Gap between changes inside the burst.
    pub burst_gap_ms: u64,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            burst_len: 5,
            burst_gap_ms: 5,
        }
    }
}

impl HooksConfig {
    /// Load configuration from a TOML file, falling back to defaults for missing fields.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self =
            toml::from_str(&content).map_err(|e| HooksError::Config(e.to_string()))?;
        config.registry.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| HooksError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Returns the default config file path: `~/.config/shellhooks/config.toml`.
    pub fn default_config_path() -> PathBuf {
        if let Some(config) = std::env::var_os("XDG_CONFIG_HOME") {
            PathBuf::from(config).join("shellhooks").join("config.toml")
        } else if let Some(config) = dirs::config_dir() {
            config.join("shellhooks").join("config.toml")
        } else {
            PathBuf::from("/tmp/shellhooks-config/config.toml")
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = HooksConfig::default();
        config.registry.validate().unwrap();
        assert_eq!(config.registry.debounce(), Duration::from_millis(50));
        assert_eq!(config.registry.compaction_interval(), Duration::from_secs(5));
        assert_eq!(config.registry.initial_delivery(), Duration::from_millis(10));
        assert!(config.demo.burst_len > 0);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = HooksConfig::default();
        config.registry.debounce_ms = 80;
        config.demo.burst_len = 12;
        config.save_to_file(&path).unwrap();

        let loaded = HooksConfig::from_file(&path).unwrap();
        assert_eq!(loaded.registry.debounce_ms, 80);
        assert_eq!(loaded.demo.burst_len, 12);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: HooksConfig = toml::from_str("[registry]\ndebounce_ms = 25\n").unwrap();
        assert_eq!(config.registry.debounce_ms, 25);
        assert_eq!(config.registry.compaction_interval_ms, 5_000);
        assert_eq!(config.demo, DemoConfig::default());
    }

    #[test]
    fn zero_debounce_is_rejected() {
        let config = RegistryConfig {
            debounce_ms: 0,
            ..RegistryConfig::default()
        };
        assert!(matches!(config.validate(), Err(HooksError::Config(_))));
    }

    #[test]
    fn compaction_faster_than_debounce_is_rejected() {
        let config = RegistryConfig {
            debounce_ms: 100,
            compaction_interval_ms: 50,
            initial_delivery_ms: 10,
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("compaction_interval_ms"));
    }

    #[test]
    fn invalid_file_reports_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[registry]\ndebounce_ms = \"fast\"\n").unwrap();
        assert!(matches!(
            HooksConfig::from_file(&path),
            Err(HooksError::Config(_))
        ));
    }

    #[test]
    fn default_config_path_ends_with_crate_dir() {
        let path = HooksConfig::default_config_path();
        assert!(path.ends_with("shellhooks/config.toml"));
    }
}
