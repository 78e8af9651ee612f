//! Interlock configuration
//!
//! Every key is optional; missing keys take the defaults below.
//!
//! ```toml
//! enabled = true
//! auto_shutoff = true
//! warning_threshold = 0.9
//! debounce_count = 3
//! watchdog_sensor = "TC_1"
//! max_temperature = 200.0
//!
//! [sensor_limits]
//! TC_2 = 150.0
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::monitor::SafetyError;

/// Interlock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// When false, `check_limits` always reports safe
    pub enabled: bool,
    /// Call the power source's emergency shutdown on a trip
    pub auto_shutoff: bool,
    /// Fraction of a limit above which a warning is raised, in (0, 1]
    pub warning_threshold: f64,
    /// Consecutive violations needed to trip a non-watchdog sensor
    pub debounce_count: u32,
    /// Sensor that trips on its first violation
    pub watchdog_sensor: Option<String>,
    /// Limit for the watchdog sensor when `sensor_limits` has none
    pub max_temperature: Option<f64>,
    /// Per-sensor limits
    pub sensor_limits: BTreeMap<String, f64>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_shutoff: true,
            warning_threshold: 1.0,
            debounce_count: 1,
            watchdog_sensor: None,
            max_temperature: None,
            sensor_limits: BTreeMap::new(),
        }
    }
}

impl SafetyConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(input: &str) -> Result<Self, SafetyError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SafetyError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| SafetyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text)?;
        info!(
            "Loaded safety config from {}: {} limits",
            path.display(),
            config.sensor_limits.len()
        );
        Ok(config)
    }

    /// Check every value without applying anything
    pub fn validate(&self) -> Result<(), SafetyError> {
        for (sensor, &limit) in &self.sensor_limits {
            check_limit(sensor, limit)?;
        }
        if let (Some(sensor), Some(limit)) = (&self.watchdog_sensor, self.max_temperature) {
            check_limit(sensor, limit)?;
        }
        check_debounce(self.debounce_count)?;
        check_warning_threshold(self.warning_threshold)?;
        Ok(())
    }

    /// Limits in force, including the watchdog fallback
    pub fn effective_limits(&self) -> BTreeMap<String, f64> {
        let mut limits = self.sensor_limits.clone();
        if let (Some(sensor), Some(limit)) = (&self.watchdog_sensor, self.max_temperature) {
            limits.entry(sensor.clone()).or_insert(limit);
        }
        limits
    }
}

pub(crate) fn check_limit(sensor: &str, limit: f64) -> Result<(), SafetyError> {
    if limit.is_finite() && limit > 0.0 {
        Ok(())
    } else {
        Err(SafetyError::InvalidLimit {
            sensor: sensor.to_owned(),
            limit,
        })
    }
}

pub(crate) fn check_debounce(count: u32) -> Result<(), SafetyError> {
    if count >= 1 {
        Ok(())
    } else {
        Err(SafetyError::InvalidDebounce(count))
    }
}

pub(crate) fn check_warning_threshold(threshold: f64) -> Result<(), SafetyError> {
    if threshold > 0.0 && threshold <= 1.0 {
        Ok(())
    } else {
        Err(SafetyError::InvalidWarningThreshold(threshold))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SafetyConfig::from_toml_str("").unwrap();
        assert_eq!(config, SafetyConfig::default());
        assert!(config.enabled);
        assert!(config.auto_shutoff);
        assert_eq!(config.warning_threshold, 1.0);
        assert_eq!(config.debounce_count, 1);
    }

    #[test]
    fn test_parse_full_config() {
        let config = SafetyConfig::from_toml_str(
            r#"
            auto_shutoff = false
            warning_threshold = 0.9
            debounce_count = 3
            watchdog_sensor = "TC_1"
            max_temperature = 200.0

            [sensor_limits]
            TC_2 = 150.0
            "#,
        )
        .unwrap();

        assert!(config.enabled);
        assert!(!config.auto_shutoff);
        assert_eq!(config.debounce_count, 3);

        let limits = config.effective_limits();
        assert_eq!(limits.get("TC_1"), Some(&200.0));
        assert_eq!(limits.get("TC_2"), Some(&150.0));
    }

    #[test]
    fn test_explicit_limit_beats_max_temperature() {
        let mut config = SafetyConfig {
            watchdog_sensor: Some("TC_1".into()),
            max_temperature: Some(200.0),
            ..SafetyConfig::default()
        };
        config.sensor_limits.insert("TC_1".into(), 180.0);

        assert_eq!(config.effective_limits().get("TC_1"), Some(&180.0));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(matches!(
            SafetyConfig::from_toml_str("[sensor_limits]\nTC_1 = 0.0"),
            Err(SafetyError::InvalidLimit { .. })
        ));
        assert!(matches!(
            SafetyConfig::from_toml_str("debounce_count = 0"),
            Err(SafetyError::InvalidDebounce(0))
        ));
        assert!(matches!(
            SafetyConfig::from_toml_str("warning_threshold = 1.5"),
            Err(SafetyError::InvalidWarningThreshold(_))
        ));
        assert!(matches!(
            SafetyConfig::from_toml_str("enabled = \"yes\""),
            Err(SafetyError::Config(_))
        ));
    }

    #[test]
    fn test_from_json_value() {
        let config: SafetyConfig = serde_json::from_value(serde_json::json!({
            "max_temperature": 250.0,
            "watchdog_sensor": "TC_1",
            "sensor_limits": {"TC_2": 180.0}
        }))
        .unwrap();

        assert!(config.enabled);
        assert!(config.auto_shutoff);
        assert_eq!(config.effective_limits().len(), 2);
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("safety.toml");
        std::fs::write(&path, "[sensor_limits]\nTC_1 = 120.0\n").unwrap();

        let config = SafetyConfig::from_path(&path).unwrap();
        assert_eq!(config.sensor_limits.get("TC_1"), Some(&120.0));

        assert!(matches!(
            SafetyConfig::from_path(dir.path().join("missing.toml")),
            Err(SafetyError::Io { .. })
        ));
    }
}
