//! Worker configuration.
//!
//! Settings are layered with `figment`: values from `labcam.toml` are
//! overridden by `LABCAM_`-prefixed environment variables, where `__`
//! separates nesting levels (`LABCAM_WORKER__DEVICE_NAME=andor`).
//!
//! ```toml
//! [application]
//! log_level = "info"
//!
//! [worker]
//! device_name = "andor"
//! kind = "andor_solis"
//! mock = true
//! default_stop_timeout = "5s"
//!
//! [worker.camera_attributes]
//! exposure_time = 0.01
//!
//! [actions]
//! allow_subprocess = true
//! interpreters = { py = "python3" }
//!
//! [mock]
//! width = 512
//! height = 512
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::action::ActionSettings;
use crate::attributes::AttributeSet;
use crate::mock::MockCameraConfig;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "labcam.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Figment could not read or merge the sources.
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    /// A value was read but is not acceptable.
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Application-wide settings.
    pub application: ApplicationConfig,
    /// Camera worker settings.
    pub worker: WorkerSettings,
    /// Per-frame action settings.
    pub actions: ActionSettings,
    /// Simulated camera, used when `worker.mock` is set
    pub mock: MockCameraConfig,
}

/// `[application]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name used in logs.
    pub name: String,
    /// trace, debug, info, warn or error
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "labcam".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Camera family a worker drives. Both share the engine and attribute
/// semantics and differ only in the vendor SDK behind the factory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Andor Solis camera.
    #[default]
    AndorSolis,
    /// IMAQdx camera used for in-situ analysis.
    InSituAnalysis,
}

impl DeviceKind {
    /// Name as written in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::AndorSolis => "andor_solis",
            DeviceKind::InSituAnalysis => "in_situ_analysis",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps a path prefix as seen by the experiment host onto a local one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathMapping {
    /// Prefix as seen by the experiment host.
    pub remote: PathBuf,
    /// Prefix on this machine.
    pub local: PathBuf,
}

/// `[worker]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Name of the device group read from run files.
    pub device_name: String,
    /// Camera family.
    pub kind: DeviceKind,
    /// Drive the simulated camera instead of a vendor SDK
    pub mock: bool,
    /// Run files arrive with host paths that must be translated
    pub is_remote: bool,
    /// Host to local prefix mappings, tried in order.
    pub remote_path_prefixes: Vec<PathMapping>,
    /// Used when a run file gives no `stop_acquisition_timeout`
    #[serde(with = "humantime_serde")]
    pub default_stop_timeout: Duration,
    /// Applied once when the worker starts
    pub camera_attributes: AttributeSet,
    /// Applied on start and after every buffered shot
    pub manual_mode_camera_attributes: AttributeSet,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            device_name: "camera".to_string(),
            kind: DeviceKind::default(),
            mock: false,
            is_remote: false,
            remote_path_prefixes: Vec::new(),
            default_stop_timeout: Duration::from_secs(5),
            camera_attributes: AttributeSet::new(),
            manual_mode_camera_attributes: AttributeSet::new(),
        }
    }
}

impl WorkerSettings {
    /// Translate a host path to a local one. Unmapped paths pass through.
    pub fn path_to_local(&self, path: &Path) -> PathBuf {
        if !self.is_remote {
            return path.to_path_buf();
        }
        self.remote_path_prefixes
            .iter()
            .find_map(|mapping| {
                path.strip_prefix(&mapping.remote)
                    .ok()
                    .map(|rest| mapping.local.join(rest))
            })
            .unwrap_or_else(|| path.to_path_buf())
    }
}

impl WorkerConfig {
    /// Load from [`DEFAULT_CONFIG_FILE`] and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file path. A missing file yields
    /// the defaults (plus environment overrides).
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABCAM_").split("__"))
            .extract()
            .map_err(ConfigError::LoadError)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.worker.device_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "worker.device_name must not be empty".to_string(),
            ));
        }

        if self.worker.default_stop_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "worker.default_stop_timeout must be greater than zero".to_string(),
            ));
        }

        if self.worker.is_remote && self.worker.remote_path_prefixes.is_empty() {
            return Err(ConfigError::ValidationError(
                "worker.is_remote requires at least one entry in worker.remote_path_prefixes"
                    .to_string(),
            ));
        }

        if self.actions.script_operation_limit == 0 {
            return Err(ConfigError::ValidationError(
                "actions.script_operation_limit must be greater than zero".to_string(),
            ));
        }

        if let Some(ext) = self.actions.interpreters.keys().find(|ext| ext.starts_with('.')) {
            return Err(ConfigError::ValidationError(format!(
                "Interpreter extension '{}' must be given without the leading dot",
                ext
            )));
        }

        if self.worker.mock && (self.mock.width == 0 || self.mock.height == 0) {
            return Err(ConfigError::ValidationError(format!(
                "Mock camera resolution {}x{} must be non-zero",
                self.mock.width, self.mock.height
            )));
        }

        Ok(())
    }
}
