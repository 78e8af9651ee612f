//! Bench configuration
//!
//! One TOML file describes a whole bench run:
//!
//! ```toml
//! trajectory = "anneal.toml"      # relative to this file
//! acquisition_interval_ms = 500
//! time_scale = 10.0
//! ambient_c = 25.0
//!
//! [executor]
//! enable_output = true
//!
//! [safety]
//! watchdog_sensor = "TC_1"
//! max_temperature = 200.0
//!
//! [supply]
//! load_ohms = 2.0
//!
//! [[sensor]]
//! name = "TC_1"
//! gain_c_per_w = 1.5
//! ```

use std::path::{Path, PathBuf};

use rampctl_core::executor::{ExecutorConfig, LoadError, StartError};
use rampctl_core::safety::{SafetyConfig, SafetyError};
use rampctl_core::trajectory::{PersistError, Trajectory};
use rampctl_drivers::sensor::ThermocoupleConfig;
use rampctl_drivers::supply::SimulatedSupplyConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Fastest supported simulation speed
pub const MAX_TIME_SCALE: f64 = 1.0e6;

/// Bench errors
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid bench config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("time scale must be in (0, 1e6], got {0}")]
    InvalidTimeScale(f64),
    #[error("acquisition interval must be at least 1 ms")]
    InvalidInterval,
    #[error("no trajectory configured")]
    NoTrajectory,
    #[error("trajectory: {0}")]
    Trajectory(#[from] PersistError),
    #[error("safety: {0}")]
    Safety(#[from] SafetyError),
    #[error("load: {0}")]
    Load(#[from] LoadError),
    #[error("start: {0}")]
    Start(#[from] StartError),
}

/// Complete bench configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    /// Trajectory file
    pub trajectory: PathBuf,
    /// Real time between acquisition cycles (ms)
    pub acquisition_interval_ms: u64,
    /// Simulated seconds per real second
    pub time_scale: f64,
    /// Starting and ambient temperature (°C)
    pub ambient_c: f64,
    pub executor: ExecutorConfig,
    pub safety: SafetyConfig,
    pub supply: SimulatedSupplyConfig,
    #[serde(rename = "sensor")]
    pub sensors: Vec<ThermocoupleConfig>,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            trajectory: PathBuf::new(),
            acquisition_interval_ms: 500,
            time_scale: 1.0,
            ambient_c: 25.0,
            executor: ExecutorConfig::default(),
            safety: SafetyConfig::default(),
            supply: SimulatedSupplyConfig::default(),
            sensors: Vec::new(),
        }
    }
}

impl BenchConfig {
    /// Parse a TOML document
    ///
    /// A relative trajectory path is resolved against `base_dir`.
    pub fn from_toml_str(input: &str, base_dir: &Path) -> Result<Self, BenchError> {
        let mut config: Self = toml::from_str(input)?;
        if config.trajectory.is_relative() && !config.trajectory.as_os_str().is_empty() {
            config.trajectory = base_dir.join(&config.trajectory);
        }
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, BenchError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| BenchError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let config = Self::from_toml_str(&text, base_dir)?;

        info!("Loaded bench config from {}", path.display());
        debug!(
            "  trajectory {}, {} sensors, interval {} ms, x{} time",
            config.trajectory.display(),
            config.sensors.len(),
            config.acquisition_interval_ms,
            config.time_scale
        );
        Ok(config)
    }

    /// Check values that serde cannot
    pub fn validate(&self) -> Result<(), BenchError> {
        if !(self.time_scale > 0.0 && self.time_scale <= MAX_TIME_SCALE) {
            return Err(BenchError::InvalidTimeScale(self.time_scale));
        }
        if self.acquisition_interval_ms == 0 {
            return Err(BenchError::InvalidInterval);
        }
        self.safety.validate()?;
        Ok(())
    }

    /// Read the configured trajectory file
    pub fn load_trajectory(&self) -> Result<Trajectory, BenchError> {
        if self.trajectory.as_os_str().is_empty() {
            return Err(BenchError::NoTrajectory);
        }
        Ok(Trajectory::try_load(&self.trajectory)?)
    }
}
