//! Process configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `DAQ_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use daq_core::config::ProcessConfig;
//!
//! let config = ProcessConfig::load_from("config/blocks.toml")?;
//! config.validate()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), daq_core::error::DaqError>(())
//! ```
//!
//! ```toml
//! [application]
//! name = "beamline"
//! log_level = "info"
//!
//! [server]
//! lifecycle_timeout_ms = 1000
//!
//! [[blocks]]
//! mri = "DET"
//! kind = "detector"
//!
//! [[blocks]]
//! mri = "SCAN"
//! kind = "scan"
//! child = "DET"
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{AppResult, DaqError};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Block server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Scan state machine settings
    #[serde(default)]
    pub scan: ScanConfig,
    /// Blocks to assemble
    #[serde(default)]
    pub blocks: Vec<BlockDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Block server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bound on first-connect/last-disconnect callbacks, in milliseconds
    #[serde(default = "default_lifecycle_timeout")]
    pub lifecycle_timeout_ms: u64,
    /// Bound on each administrative disconnect, in milliseconds
    #[serde(default = "default_disconnect_timeout")]
    pub disconnect_timeout_ms: u64,
    /// Events buffered per channel before slow clients lag
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            lifecycle_timeout_ms: default_lifecycle_timeout(),
            disconnect_timeout_ms: default_disconnect_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl ServerConfig {
    /// Lifecycle callback bound.
    pub fn lifecycle_timeout(&self) -> Duration {
        Duration::from_millis(self.lifecycle_timeout_ms)
    }

    /// Administrative disconnect bound.
    pub fn disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.disconnect_timeout_ms)
    }
}

/// Scan state machine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Bound on non-run hooks in milliseconds (unset = unbounded)
    #[serde(default)]
    pub hook_timeout_ms: Option<u64>,
    /// Smallest exposure simulated detectors accept
    #[serde(default = "default_min_exposure")]
    pub min_exposure: f64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            hook_timeout_ms: None,
            min_exposure: default_min_exposure(),
        }
    }
}

impl ScanConfig {
    /// Hook bound as a duration.
    pub fn hook_timeout(&self) -> Option<Duration> {
        self.hook_timeout_ms.map(Duration::from_millis)
    }
}

/// Kind of block to assemble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    /// Simulated stepping detector
    Detector,
    /// Scan controller driving one child block
    Scan,
    /// Motor backed by a simulated channel
    Motor,
}

/// Block definition in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDefinition {
    /// Unique block identifier
    pub mri: String,
    /// What to build
    pub kind: BlockKind,
    /// Child block driven by a scan
    #[serde(default)]
    pub child: Option<String>,
    /// Time per simulated step in milliseconds
    #[serde(default = "default_step_interval")]
    pub steps_interval_ms: u64,
    /// Inject a fault when this step is reached
    #[serde(default)]
    pub fault_at_step: Option<i64>,
    /// Whether the block server serves this block
    #[serde(default = "default_publish")]
    pub publish: bool,
}

// Default value functions
fn default_name() -> String {
    "daq-blocks".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_lifecycle_timeout() -> u64 {
    1000
}

fn default_disconnect_timeout() -> u64 {
    1000
}

fn default_channel_capacity() -> usize {
    256
}

fn default_min_exposure() -> f64 {
    0.01
}

fn default_step_interval() -> u64 {
    10
}

fn default_publish() -> bool {
    true
}

impl ProcessConfig {
    /// Load configuration from a specific file path
    ///
    /// Environment variables override the file with prefix `DAQ_`.
    /// Example: `DAQ_SERVER__LIFECYCLE_TIMEOUT_MS=250`
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Figment::from(Serialized::defaults(ProcessConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_").split("__"))
            .extract()
            .map_err(DaqError::from)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.server.lifecycle_timeout_ms == 0 || self.server.disconnect_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "Server timeouts must be greater than zero".to_string(),
            ));
        }

        if self.scan.min_exposure <= 0.0 {
            return Err(DaqError::Configuration(format!(
                "Invalid min_exposure {}. Must be positive",
                self.scan.min_exposure
            )));
        }

        let mut mris = HashSet::new();
        for block in &self.blocks {
            if !mris.insert(block.mri.as_str()) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate block MRI: {}",
                    block.mri
                )));
            }
        }

        for block in self.blocks.iter().filter(|b| b.kind == BlockKind::Scan) {
            match &block.child {
                Some(child) if mris.contains(child.as_str()) => {}
                Some(child) => {
                    return Err(DaqError::Configuration(format!(
                        "Scan {} drives unknown child {child}",
                        block.mri
                    )))
                }
                None => {
                    return Err(DaqError::Configuration(format!(
                        "Scan {} has no child",
                        block.mri
                    )))
                }
            }
        }

        Ok(())
    }

    /// MRIs the block server should serve
    pub fn published_mris(&self) -> Vec<String> {
        self.blocks
            .iter()
            .filter(|b| b.publish)
            .map(|b| b.mri.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const SAMPLE: &str = r#"
[application]
name = "test-beamline"
log_level = "debug"

[server]
lifecycle_timeout_ms = 500

[[blocks]]
mri = "DET"
kind = "detector"
fault_at_step = 4

[[blocks]]
mri = "SCAN"
kind = "scan"
child = "DET"
publish = false
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    #[serial]
    fn test_load_config_with_defaults() {
        let file = write_config(SAMPLE);
        let config = ProcessConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.name, "test-beamline");
        assert_eq!(config.application.log_format, "pretty");
        assert_eq!(config.server.lifecycle_timeout(), Duration::from_millis(500));
        assert_eq!(config.server.disconnect_timeout_ms, 1000);
        assert_eq!(config.blocks[0].fault_at_step, Some(4));
        assert_eq!(config.blocks[0].steps_interval_ms, 10);
        assert_eq!(config.published_mris(), vec!["DET".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let file = write_config(SAMPLE);
        std::env::set_var("DAQ_SERVER__LIFECYCLE_TIMEOUT_MS", "250");
        let config = ProcessConfig::load_from(file.path());
        std::env::remove_var("DAQ_SERVER__LIFECYCLE_TIMEOUT_MS");
        assert_eq!(config.unwrap().server.lifecycle_timeout_ms, 250);
    }

    #[test]
    #[serial]
    fn test_missing_file_gives_defaults() {
        let config = ProcessConfig::load_from("/nonexistent/blocks.toml").unwrap();
        assert_eq!(config.application.log_level, "info");
        assert!(config.blocks.is_empty());
    }

    #[test]
    fn test_config_validation() {
        let mut config = ProcessConfig::default();
        assert!(config.validate().is_ok());

        config.application.log_level = "loud".into();
        assert!(matches!(config.validate(), Err(DaqError::Configuration(_))));
        config.application.log_level = "info".into();

        config.blocks.push(BlockDefinition {
            mri: "SCAN".into(),
            kind: BlockKind::Scan,
            child: Some("MISSING".into()),
            steps_interval_ms: 10,
            fault_at_step: None,
            publish: true,
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("unknown child MISSING"));
    }
}
