//! Limit checking and interlock shutdown
//!
//! The monitor has no thread of its own. An acquisition loop feeds it one set
//! of readings per cycle through [`SafetyMonitor::check_limits`]; concurrent
//! callers are serialized by a single lock.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::{BuildHasher, Hash};
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use heapless::HistoryBuffer;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::config::{check_debounce, check_limit, check_warning_threshold, SafetyConfig};
use super::event::{SafetyEvent, SafetyObserver, SafetyStatus};
use crate::traits::PowerSource;

/// Readings at or below this value mean the sensor is disconnected
pub const DISCONNECTED_SENTINEL: f64 = -9999.0;

/// Number of events kept in the history
pub const HISTORY_CAPACITY: usize = 256;

/// Configuration errors
#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("{sensor}: limit must be positive, got {limit}")]
    InvalidLimit { sensor: String, limit: f64 },
    #[error("debounce count must be at least 1, got {0}")]
    InvalidDebounce(u32),
    #[error("warning threshold must be in (0, 1], got {0}")]
    InvalidWarningThreshold(f64),
    #[error("invalid safety config: {0}")]
    Config(#[from] toml::de::Error),
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Source of sensor readings for one check
///
/// `None` means the sensor has no reading this cycle.
pub trait SensorReadings {
    fn reading(&self, sensor: &str) -> Option<f64>;
}

impl<T: SensorReadings + ?Sized> SensorReadings for &T {
    fn reading(&self, sensor: &str) -> Option<f64> {
        (**self).reading(sensor)
    }
}

impl<K, S> SensorReadings for HashMap<K, f64, S>
where
    K: Borrow<str> + Hash + Eq,
    S: BuildHasher,
{
    fn reading(&self, sensor: &str) -> Option<f64> {
        self.get(sensor).copied()
    }
}

impl<K, S> SensorReadings for HashMap<K, Option<f64>, S>
where
    K: Borrow<str> + Hash + Eq,
    S: BuildHasher,
{
    fn reading(&self, sensor: &str) -> Option<f64> {
        self.get(sensor).copied().flatten()
    }
}

impl<K: Borrow<str> + Ord> SensorReadings for BTreeMap<K, f64> {
    fn reading(&self, sensor: &str) -> Option<f64> {
        self.get(sensor).copied()
    }
}

impl<K: Borrow<str> + Ord> SensorReadings for BTreeMap<K, Option<f64>> {
    fn reading(&self, sensor: &str) -> Option<f64> {
        self.get(sensor).copied().flatten()
    }
}

/// Check if a raw reading comes from a disconnected sensor
pub fn is_disconnected(value: f64) -> bool {
    !value.is_finite() || value <= DISCONNECTED_SENTINEL
}

/// Snapshot of monitor state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyReport {
    pub status: SafetyStatus,
    pub enabled: bool,
    pub auto_shutoff: bool,
    pub limits: BTreeMap<String, f64>,
    pub watchdog_sensor: Option<String>,
    pub debounce_count: u32,
    pub warning_threshold: f64,
    pub event_count: usize,
    pub last_event: Option<SafetyEvent>,
}

struct MonitorState {
    config: SafetyConfig,
    /// Consecutive violations per sensor
    counters: HashMap<String, u32>,
    status: SafetyStatus,
    history: HistoryBuffer<SafetyEvent, HISTORY_CAPACITY>,
}

/// Temperature interlock
pub struct SafetyMonitor {
    source: Option<Arc<dyn PowerSource>>,
    state: Mutex<MonitorState>,
    observers: Mutex<Vec<Arc<dyn SafetyObserver>>>,
}

impl Default for SafetyMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyMonitor {
    /// Create an alert-only monitor with no power source
    pub fn new() -> Self {
        Self {
            source: None,
            state: Mutex::new(MonitorState {
                config: SafetyConfig::default(),
                counters: HashMap::new(),
                status: SafetyStatus::Ok,
                history: HistoryBuffer::new(),
            }),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Create a monitor that can shut `source` down
    pub fn with_power_source(source: Arc<dyn PowerSource>) -> Self {
        Self {
            source: Some(source),
            ..Self::new()
        }
    }

    /// Create a monitor from a validated configuration
    pub fn from_config(
        config: &SafetyConfig,
        source: Option<Arc<dyn PowerSource>>,
    ) -> Result<Self, SafetyError> {
        let monitor = Self {
            source,
            ..Self::new()
        };
        monitor.configure(config)?;
        Ok(monitor)
    }

    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn has_power_source(&self) -> bool {
        self.source.is_some()
    }

    /// Register an observer
    pub fn subscribe(&self, observer: Arc<dyn SafetyObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    // Limits

    /// Set the limit for a sensor
    pub fn set_limit(&self, sensor: impl Into<String>, limit: f64) -> Result<(), SafetyError> {
        let sensor = sensor.into();
        check_limit(&sensor, limit)?;
        debug!("Limit for {} set to {:.1}", sensor, limit);
        self.lock().config.sensor_limits.insert(sensor, limit);
        Ok(())
    }

    /// Limit in force for a sensor
    pub fn limit(&self, sensor: &str) -> Option<f64> {
        self.lock().config.effective_limits().get(sensor).copied()
    }

    /// All limits in force
    pub fn limits(&self) -> BTreeMap<String, f64> {
        self.lock().config.effective_limits()
    }

    /// Remove the limit for a sensor, returning the limit that was in force
    ///
    /// For the watchdog sensor this also drops the `max_temperature`
    /// fallback, so the sensor is no longer monitored at all.
    pub fn remove_limit(&self, sensor: &str) -> Option<f64> {
        let mut state = self.lock();
        state.counters.remove(sensor);
        let explicit = state.config.sensor_limits.remove(sensor);
        let fallback = if state.config.watchdog_sensor.as_deref() == Some(sensor) {
            state.config.max_temperature.take()
        } else {
            None
        };
        explicit.or(fallback)
    }

    /// Remove every limit, including the watchdog fallback
    pub fn clear_limits(&self) {
        let mut state = self.lock();
        state.config.sensor_limits.clear();
        state.config.max_temperature = None;
        state.counters.clear();
    }

    // Watchdog

    pub fn set_watchdog_sensor(&self, sensor: impl Into<String>) {
        self.lock().config.watchdog_sensor = Some(sensor.into());
    }

    pub fn clear_watchdog_sensor(&self) {
        self.lock().config.watchdog_sensor = None;
    }

    pub fn watchdog_sensor(&self) -> Option<String> {
        self.lock().config.watchdog_sensor.clone()
    }

    // Thresholds and switches

    /// Set the number of consecutive violations needed to trip (at least 1)
    pub fn set_debounce_count(&self, count: u32) -> Result<(), SafetyError> {
        check_debounce(count)?;
        self.lock().config.debounce_count = count;
        Ok(())
    }

    pub fn debounce_count(&self) -> u32 {
        self.lock().config.debounce_count
    }

    /// Set the warning level as a fraction of each limit, in (0, 1]
    pub fn set_warning_threshold(&self, threshold: f64) -> Result<(), SafetyError> {
        check_warning_threshold(threshold)?;
        self.lock().config.warning_threshold = threshold;
        Ok(())
    }

    pub fn warning_threshold(&self) -> f64 {
        self.lock().config.warning_threshold
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.lock().config.enabled = enabled;
        info!("Safety monitor {}", if enabled { "enabled" } else { "disabled" });
    }

    pub fn is_enabled(&self) -> bool {
        self.lock().config.enabled
    }

    pub fn set_auto_shutoff(&self, auto_shutoff: bool) {
        self.lock().config.auto_shutoff = auto_shutoff;
    }

    pub fn auto_shutoff(&self) -> bool {
        self.lock().config.auto_shutoff
    }

    /// Replace the whole configuration
    ///
    /// Nothing is applied unless every value is valid. Debounce counters are
    /// cleared; status and history are kept.
    pub fn configure(&self, config: &SafetyConfig) -> Result<(), SafetyError> {
        config.validate()?;
        if config.max_temperature.is_some() && config.watchdog_sensor.is_none() {
            warn!("max_temperature is set without a watchdog_sensor and has no effect");
        }
        let mut state = self.lock();
        state.config = config.clone();
        state.counters.clear();
        drop(state);

        info!(
            "Safety monitor configured: {} limits, watchdog {:?}, debounce {}, auto shutoff {}",
            config.effective_limits().len(),
            config.watchdog_sensor,
            config.debounce_count,
            config.auto_shutoff
        );
        Ok(())
    }

    pub fn config(&self) -> SafetyConfig {
        self.lock().config.clone()
    }

    // Status

    pub fn status(&self) -> SafetyStatus {
        self.lock().status
    }

    /// False while a shutdown is waiting for reset
    pub fn is_safe(&self) -> bool {
        self.lock().status.is_safe()
    }

    /// Clear a triggered shutdown
    ///
    /// Limits and history are kept; debounce counters start over.
    pub fn reset(&self) {
        let mut state = self.lock();
        let previous = state.status;
        state.status = SafetyStatus::Ok;
        state.counters.clear();
        drop(state);

        if previous == SafetyStatus::ShutdownTriggered {
            info!("Safety interlock reset");
        }
    }

    // History

    /// Most recent event
    pub fn last_event(&self) -> Option<SafetyEvent> {
        self.lock().history.recent().cloned()
    }

    /// Recorded events, oldest first
    pub fn event_history(&self) -> Vec<SafetyEvent> {
        self.lock().history.oldest_ordered().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.lock().history = HistoryBuffer::new();
    }

    pub fn report(&self) -> SafetyReport {
        let state = self.lock();
        SafetyReport {
            status: state.status,
            enabled: state.config.enabled,
            auto_shutoff: state.config.auto_shutoff,
            limits: state.config.effective_limits(),
            watchdog_sensor: state.config.watchdog_sensor.clone(),
            debounce_count: state.config.debounce_count,
            warning_threshold: state.config.warning_threshold,
            event_count: state.history.len(),
            last_event: state.history.recent().cloned(),
        }
    }

    /// Check one set of readings against the configured limits
    ///
    /// Returns false exactly when a limit tripped on this call. Missing and
    /// disconnected readings never trip. A reading at or above its limit is a
    /// violation; it trips once the sensor has violated `debounce_count`
    /// times in a row, or immediately for the watchdog sensor.
    pub fn check_limits<R: SensorReadings + ?Sized>(&self, readings: &R) -> bool {
        let mut state = self.lock();
        if !state.config.enabled {
            return true;
        }

        let limits = state.config.effective_limits();
        let watchdog = state.config.watchdog_sensor.clone();
        let debounce = state.config.debounce_count;
        let threshold = state.config.warning_threshold;
        let shut_down = state.status == SafetyStatus::ShutdownTriggered;

        let mut warnings = Vec::new();
        let mut tripped = Vec::new();

        for (sensor, limit) in limits {
            let value = match readings.reading(&sensor) {
                Some(value) if !is_disconnected(value) => value,
                _ => {
                    state.counters.remove(&sensor);
                    continue;
                }
            };

            if value >= limit {
                let count = state.counters.entry(sensor.clone()).or_insert(0);
                *count = count.saturating_add(1);
                let is_watchdog = watchdog.as_deref() == Some(sensor.as_str());

                if is_watchdog || *count >= debounce {
                    tripped.push(SafetyEvent::new(sensor, value, limit));
                } else {
                    debug!(
                        "{} over limit ({}/{} consecutive)",
                        sensor, *count, debounce
                    );
                    if !shut_down {
                        warnings.push((sensor, value, limit));
                    }
                }
            } else {
                state.counters.remove(&sensor);
                if !shut_down && value > threshold * limit {
                    warnings.push((sensor, value, limit));
                }
            }
        }

        for event in &tripped {
            state.history.write(event.clone());
        }
        state.status = state
            .status
            .after_check(!warnings.is_empty(), !tripped.is_empty());
        let auto_shutoff = state.config.auto_shutoff;
        drop(state);

        for (sensor, value, limit) in &warnings {
            warn!(
                "{} at {:.1} is approaching limit {:.1}",
                sensor, value, limit
            );
            self.notify(|o| o.on_warning(sensor, *value, *limit));
        }

        let Some(first) = tripped.first() else {
            return true;
        };

        for event in &tripped {
            error!("Safety limit exceeded: {}", event);
        }
        if auto_shutoff {
            self.emergency_shutdown();
        } else {
            warn!("Auto shutoff disabled; power source left as is");
        }
        for event in &tripped {
            self.notify(|o| o.on_limit_exceeded(event));
        }
        self.notify(|o| o.on_shutdown(first));

        false
    }

    /// Shut the power source down now
    ///
    /// Returns false when no source is attached or the shutdown failed.
    pub fn emergency_shutdown(&self) -> bool {
        let Some(source) = self.source.as_ref() else {
            warn!("Emergency shutdown requested but no power source is attached");
            return false;
        };

        match source.emergency_shutdown() {
            Ok(()) => {
                info!("Emergency shutdown complete");
                true
            }
            Err(e) => {
                error!("Emergency shutdown failed: {}", e);
                false
            }
        }
    }

    fn notify<F>(&self, f: F)
    where
        F: Fn(&dyn SafetyObserver),
    {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in &observers {
            if panic::catch_unwind(AssertUnwindSafe(|| f(observer.as_ref()))).is_err() {
                warn!("Safety observer panicked; notification dropped");
            }
        }
    }
}
