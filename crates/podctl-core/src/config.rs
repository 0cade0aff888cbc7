//! Driver configuration.
//!
//! Every field has a default, so an empty file (or no file at all) yields a
//! working driver. Values are loaded from TOML:
//!
//! ```toml
//! [bolus]
//! seconds_per_unit = 42.0
//!
//! [temp_basal]
//! rate_tolerance = 0.001
//!
//! [probe]
//! max_attempts = 20
//! delay_secs = 5
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::busy::DEFAULT_BOLUS_SECONDS_PER_UNIT;

/// Slowest bolus pace accepted, in seconds per unit.
pub const MAX_BOLUS_SECONDS_PER_UNIT: f64 = 600.0;

/// Driver configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Bolus pacing.
    pub bolus: BolusConfig,
    /// Temporary basal handling.
    pub temp_basal: TempBasalConfig,
    /// Basal profile comparison.
    pub profile: ProfileConfig,
    /// Busy-window housekeeping.
    pub busy: BusyConfig,
    /// Post-connect readiness probe.
    pub probe: ProbeConfig,
    /// Event channel.
    pub events: EventsConfig,
}

impl DriverConfig {
    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// This checks:
    /// - Bolus pace is positive and finite
    /// - Rate tolerances are non-negative and finite
    /// - Prune interval, probe attempts, probe delay and event capacity are non-zero
    ///
    /// # Example
    ///
    /// ```
    /// use podctl_core::DriverConfig;
    ///
    /// let config = DriverConfig::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        errors.extend(self.bolus.validate());
        errors.extend(validate_tolerance(
            "temp_basal.rate_tolerance",
            self.temp_basal.rate_tolerance,
        ));
        errors.extend(validate_tolerance(
            "profile.rate_tolerance",
            self.profile.rate_tolerance,
        ));
        if self.busy.prune_interval_secs == 0 {
            errors.push(ValidationError::new(
                "busy.prune_interval_secs",
                "prune interval must be at least 1 second",
            ));
        }
        errors.extend(self.probe.validate());
        if self.events.capacity == 0 {
            errors.push(ValidationError::new(
                "events.capacity",
                "event channel capacity must be at least 1",
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    ///
    /// This is a convenience method that combines `load()` and `validate()`.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

fn validate_tolerance(field: &str, value: f64) -> Option<ValidationError> {
    if !value.is_finite() || value < 0.0 {
        Some(ValidationError::new(
            field,
            format!("tolerance must be a non-negative number, got {}", value),
        ))
    } else {
        None
    }
}

/// Bolus pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BolusConfig {
    /// Seconds the pod needs per unit delivered.
    pub seconds_per_unit: f64,
}

impl Default for BolusConfig {
    fn default() -> Self {
        Self {
            seconds_per_unit: DEFAULT_BOLUS_SECONDS_PER_UNIT,
        }
    }
}

impl BolusConfig {
    /// Validate bolus configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if !self.seconds_per_unit.is_finite() || self.seconds_per_unit <= 0.0 {
            errors.push(ValidationError::new(
                "bolus.seconds_per_unit",
                format!(
                    "seconds per unit must be a positive number, got {}",
                    self.seconds_per_unit
                ),
            ));
        } else if self.seconds_per_unit > MAX_BOLUS_SECONDS_PER_UNIT {
            errors.push(ValidationError::new(
                "bolus.seconds_per_unit",
                format!(
                    "seconds per unit must not exceed {}, got {}",
                    MAX_BOLUS_SECONDS_PER_UNIT, self.seconds_per_unit
                ),
            ));
        }
        errors
    }
}

/// Temporary basal handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempBasalConfig {
    /// Largest rate difference (U/h) still treated as "same rate".
    pub rate_tolerance: f64,
}

impl Default for TempBasalConfig {
    fn default() -> Self {
        Self {
            rate_tolerance: 0.001,
        }
    }
}

/// Basal profile comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileConfig {
    /// Largest per-breakpoint rate difference (U/h) still treated as equal.
    pub rate_tolerance: f64,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            rate_tolerance: 0.001,
        }
    }
}

/// Busy-window housekeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusyConfig {
    /// Seconds between background prunes of expired busy windows.
    pub prune_interval_secs: u64,
}

impl Default for BusyConfig {
    fn default() -> Self {
        Self {
            prune_interval_secs: 60,
        }
    }
}

impl BusyConfig {
    /// Prune interval as a [`Duration`].
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }
}

/// Post-connect readiness probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Seconds between attempts.
    pub delay_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            delay_secs: 5,
        }
    }
}

impl ProbeConfig {
    /// Validate probe configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.max_attempts == 0 {
            errors.push(ValidationError::new(
                "probe.max_attempts",
                "at least one probe attempt is required",
            ));
        }
        if self.delay_secs == 0 {
            errors.push(ValidationError::new(
                "probe.delay_secs",
                "probe delay must be at least 1 second",
            ));
        }
        errors
    }

    /// Delay between attempts as a [`Duration`].
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }
}

/// Event channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Broadcast channel capacity.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `probe.max_attempts`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}
