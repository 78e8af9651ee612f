//! Simulated thermocouples
//!
//! Each thermocouple sits on a first-order thermal mass heated by the power
//! delivered to the load. At constant power P the temperature settles at
//! `ambient + gain * P` with time constant `tau`.

use std::collections::BTreeMap;

use rampctl_core::safety::DISCONNECTED_SENTINEL;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// One simulated thermocouple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermocoupleConfig {
    pub name: String,
    /// Steady-state rise per watt (°C/W)
    #[serde(default = "default_gain")]
    pub gain_c_per_w: f64,
    /// Thermal time constant (s)
    #[serde(default = "default_time_constant")]
    pub time_constant_s: f64,
}

fn default_gain() -> f64 {
    2.0
}

fn default_time_constant() -> f64 {
    30.0
}

impl ThermocoupleConfig {
    pub fn new(name: impl Into<String>, gain_c_per_w: f64, time_constant_s: f64) -> Self {
        Self {
            name: name.into(),
            gain_c_per_w,
            time_constant_s,
        }
    }
}

#[derive(Debug, Clone)]
struct Thermocouple {
    config: ThermocoupleConfig,
    temperature_c: f64,
    connected: bool,
}

/// A set of thermocouples sharing one heat source
#[derive(Debug, Clone)]
pub struct ThermalBench {
    ambient_c: f64,
    sensors: Vec<Thermocouple>,
}

impl ThermalBench {
    /// Create an empty bench at `ambient_c`
    pub fn new(ambient_c: f64) -> Self {
        Self {
            ambient_c,
            sensors: Vec::new(),
        }
    }

    /// Add a thermocouple starting at ambient temperature
    pub fn add_sensor(&mut self, config: ThermocoupleConfig) {
        info!(
            "Thermocouple {}: {} °C/W, tau {} s",
            config.name, config.gain_c_per_w, config.time_constant_s
        );
        self.sensors.push(Thermocouple {
            config,
            temperature_c: self.ambient_c,
            connected: true,
        });
    }

    pub fn with_sensor(mut self, config: ThermocoupleConfig) -> Self {
        self.add_sensor(config);
        self
    }

    pub fn ambient_c(&self) -> f64 {
        self.ambient_c
    }

    pub fn sensor_names(&self) -> impl Iterator<Item = &str> {
        self.sensors.iter().map(|s| s.config.name.as_str())
    }

    /// Advance the model by `dt_s` seconds at `power_w` watts
    pub fn step(&mut self, power_w: f64, dt_s: f64) {
        if dt_s <= 0.0 {
            return;
        }
        let power_w = power_w.max(0.0);

        for sensor in &mut self.sensors {
            let target = self.ambient_c + sensor.config.gain_c_per_w * power_w;
            let tau = sensor.config.time_constant_s;
            sensor.temperature_c = if tau > 0.0 {
                target + (sensor.temperature_c - target) * (-dt_s / tau).exp()
            } else {
                target
            };
        }
    }

    /// True temperature of a sensor, connected or not
    pub fn temperature(&self, name: &str) -> Option<f64> {
        self.find(name).map(|s| s.temperature_c)
    }

    /// Simulate a broken or reattached thermocouple
    ///
    /// Returns false if there is no sensor called `name`.
    pub fn set_connected(&mut self, name: &str, connected: bool) -> bool {
        match self.sensors.iter_mut().find(|s| s.config.name == name) {
            Some(sensor) => {
                if !connected {
                    warn!("Thermocouple {} disconnected", name);
                }
                sensor.connected = connected;
                true
            }
            None => false,
        }
    }

    /// Current readings; disconnected sensors report the sentinel value
    pub fn readings(&self) -> BTreeMap<String, f64> {
        self.sensors
            .iter()
            .map(|s| {
                let value = if s.connected {
                    s.temperature_c
                } else {
                    DISCONNECTED_SENTINEL
                };
                (s.config.name.clone(), value)
            })
            .collect()
    }

    fn find(&self, name: &str) -> Option<&Thermocouple> {
        self.sensors.iter().find(|s| s.config.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bench() -> ThermalBench {
        ThermalBench::new(25.0)
            .with_sensor(ThermocoupleConfig::new("TC_1", 2.0, 10.0))
            .with_sensor(ThermocoupleConfig::new("TC_2", 1.0, 20.0))
    }

    #[test]
    fn test_starts_at_ambient() {
        let bench = bench();
        assert_eq!(bench.temperature("TC_1"), Some(25.0));
        assert_eq!(bench.temperature("missing"), None);
        assert_eq!(bench.sensor_names().collect::<Vec<_>>(), vec!["TC_1", "TC_2"]);
    }

    #[test]
    fn test_settles_at_steady_state() {
        let mut bench = bench();
        for _ in 0..1000 {
            bench.step(50.0, 1.0);
        }

        // 25 + 2 °C/W * 50 W
        assert!((bench.temperature("TC_1").unwrap() - 125.0).abs() < 1e-6);
        assert!((bench.temperature("TC_2").unwrap() - 75.0).abs() < 1e-6);
    }

    #[test]
    fn test_one_time_constant() {
        let mut bench = bench();
        bench.step(50.0, 10.0);

        // 63.2% of the 100 °C rise
        let t = bench.temperature("TC_1").unwrap();
        assert!((t - (125.0 - 100.0 * (-1.0f64).exp())).abs() < 1e-9);
    }

    #[test]
    fn test_cools_without_power() {
        let mut bench = bench();
        bench.step(50.0, 100.0);
        let hot = bench.temperature("TC_1").unwrap();

        bench.step(0.0, 5.0);
        let cooler = bench.temperature("TC_1").unwrap();
        assert!(cooler < hot);
        assert!(cooler > 25.0);
    }

    #[test]
    fn test_disconnected_reports_sentinel() {
        let mut bench = bench();
        assert!(bench.set_connected("TC_2", false));
        assert!(!bench.set_connected("TC_9", false));

        let readings = bench.readings();
        assert_eq!(readings["TC_1"], 25.0);
        assert_eq!(readings["TC_2"], DISCONNECTED_SENTINEL);

        // Model keeps running underneath
        assert_eq!(bench.temperature("TC_2"), Some(25.0));
    }

    #[test]
    fn test_config_defaults() {
        let config: ThermocoupleConfig = toml::from_str("name = \"TC_1\"").unwrap();
        assert_eq!(config.gain_c_per_w, 2.0);
        assert_eq!(config.time_constant_s, 30.0);
    }

    proptest! {
        #[test]
        fn prop_temperature_stays_between_ambient_and_target(
            power in 0.0f64..200.0,
            steps in proptest::collection::vec(0.01f64..50.0, 1..50),
        ) {
            let mut bench = bench();
            for dt in steps {
                bench.step(power, dt);
                let t = bench.temperature("TC_1").unwrap();
                prop_assert!(t >= 25.0 - 1e-9);
                prop_assert!(t <= 25.0 + 2.0 * power + 1e-9);
            }
        }
    }
}
