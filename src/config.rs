//! Configuration management for the data engine
//!
//! This module provides configuration file support with TOML format,
//! environment variable overrides, and sensible defaults.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::units::BgUnits;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct EngineConfig {
    /// Ingest pipeline settings
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Query defaults
    #[serde(default)]
    pub query: QueryConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Ingest pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IngestConfig {
    /// Maximum depth of a `suppressed` basal chain; deeper levels are dropped
    #[serde(default = "default_max_suppressed_depth")]
    pub max_suppressed_depth: usize,

    /// Maximum distance between a Loop bolus and its dosing decision
    #[serde(default = "default_dosing_decision_window_ms")]
    pub dosing_decision_window_ms: i64,

    /// Run schema validation (disable only for trusted replays)
    #[serde(default = "default_true")]
    pub validate: bool,
}

/// Query configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueryConfig {
    /// Display unit used until a query supplies bgPrefs
    #[serde(default)]
    pub default_bg_units: BgUnits,

    /// Timezone used when timePrefs are aware but name none
    #[serde(default = "default_timezone")]
    pub default_timezone: String,

    /// Width of a fill bin in hours (must divide 24)
    #[serde(default = "default_fill_bin_hours")]
    pub fill_bin_hours: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Include the event target in formatted output
    #[serde(default = "default_true")]
    pub with_target: bool,
}

// Default value functions
fn default_max_suppressed_depth() -> usize { 8 }
fn default_dosing_decision_window_ms() -> i64 { 60_000 }
fn default_timezone() -> String { "UTC".to_string() }
fn default_fill_bin_hours() -> u32 { 3 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_suppressed_depth: default_max_suppressed_depth(),
            dosing_decision_window_ms: default_dosing_decision_window_ms(),
            validate: true,
        }
    }
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_bg_units: BgUnits::default(),
            default_timezone: default_timezone(),
            fill_bin_hours: default_fill_bin_hours(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            with_target: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| {
            Error::Configuration(format!("Failed to parse config file {}: {}", path, e))
        })
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Ingest
        if let Ok(depth) = std::env::var("DDE_MAX_SUPPRESSED_DEPTH") {
            if let Ok(d) = depth.parse() {
                self.ingest.max_suppressed_depth = d;
            }
        }
        if let Ok(window) = std::env::var("DDE_DOSING_DECISION_WINDOW_MS") {
            if let Ok(w) = window.parse() {
                self.ingest.dosing_decision_window_ms = w;
            }
        }

        // Query
        if let Ok(units) = std::env::var("DDE_BG_UNITS") {
            if let Some(u) = BgUnits::parse(&units) {
                self.query.default_bg_units = u;
            }
        }
        if let Ok(tz) = std::env::var("DDE_TIMEZONE") {
            self.query.default_timezone = tz;
        }

        // Logging
        if let Ok(log_level) = std::env::var("RUST_LOG") {
            self.logging.log_level = log_level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.ingest.max_suppressed_depth == 0 {
            return Err(Error::Configuration(
                "max_suppressed_depth must be > 0".to_string(),
            ));
        }
        if self.ingest.dosing_decision_window_ms < 0 {
            return Err(Error::Configuration(
                "dosing_decision_window_ms cannot be negative".to_string(),
            ));
        }
        if self.query.fill_bin_hours == 0 || 24 % self.query.fill_bin_hours != 0 {
            return Err(Error::Configuration(format!(
                "fill_bin_hours must divide 24, got {}",
                self.query.fill_bin_hours
            )));
        }
        if self.query.default_timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(Error::Configuration(format!(
                "Unknown default timezone: {}",
                self.query.default_timezone
            )));
        }
        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Configuration(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

/// Install a global `tracing` subscriber driven by `RUST_LOG` or the configured level
///
/// Intended for binaries and test harnesses embedding the engine; the library
/// itself only emits events. Returns an error if a subscriber is already set.
pub fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging.with_target)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init()
        .map_err(|e| Error::Configuration(format!("Failed to install subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.ingest.max_suppressed_depth, 8);
        assert_eq!(config.ingest.dosing_decision_window_ms, 60_000);
        assert_eq!(config.query.fill_bin_hours, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_fill_bin() {
        let mut config = EngineConfig::default();
        config.query.fill_bin_hours = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_timezone() {
        let mut config = EngineConfig::default();
        config.query.default_timezone = "Atlantis/Capital".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[ingest]\nmax_suppressed_depth = 3\n\n[query]\ndefault_bg_units = \"mmol/L\"\ndefault_timezone = \"US/Eastern\""
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.ingest.max_suppressed_depth, 3);
        assert_eq!(config.ingest.dosing_decision_window_ms, 60_000);
        assert_eq!(config.query.default_bg_units, BgUnits::MmolL);
        assert_eq!(config.logging.log_level, "info");
    }

    #[test]
    fn test_save_and_reload() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        let mut config = EngineConfig::default();
        config.query.fill_bin_hours = 6;
        config.save_to_file(path).unwrap();

        let reloaded = EngineConfig::from_file(path).unwrap();
        assert_eq!(reloaded.query.fill_bin_hours, 6);
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("DDE_DOSING_DECISION_WINDOW_MS", "120000");
        let config = EngineConfig::from_env();
        assert_eq!(config.ingest.dosing_decision_window_ms, 120_000);
        std::env::remove_var("DDE_DOSING_DECISION_WINDOW_MS");
    }
}
