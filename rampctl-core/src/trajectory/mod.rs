//! Setpoint trajectories
//!
//! A trajectory is an ordered list of ramp/hold segments plus the global
//! parameters of a run: which quantity is driven, where it starts, and the
//! protective ceiling programmed on the other quantity. Evaluating it is a
//! pure function of elapsed time.

pub mod persist;
pub mod segment;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use persist::{PersistError, TrajectoryFormat};
pub use segment::{RampTarget, Segment, SegmentError, SegmentKind};

/// Default trajectory name
pub const DEFAULT_NAME: &str = "Untitled Profile";

/// Default current ceiling for voltage-mode runs (A)
pub const DEFAULT_CURRENT_LIMIT: f64 = 50.0;

/// Default voltage ceiling for current-mode runs (V)
pub const DEFAULT_VOLTAGE_LIMIT: f64 = 60.0;

/// Durations at or below this are treated as instantaneous
const DEGENERATE_DURATION_S: f64 = 1e-9;

/// Quantity driven by a trajectory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "lowercase")]
pub enum ControlMode {
    /// Ramp voltage, with a current ceiling
    #[default]
    Voltage,
    /// Ramp current, with a voltage ceiling
    Current,
}

impl fmt::Display for ControlMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlMode::Voltage => f.write_str("voltage"),
            ControlMode::Current => f.write_str("current"),
        }
    }
}

/// Where an elapsed time falls within a trajectory
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SegmentPosition<'a> {
    /// Inside segment `index`, `time_into_s` seconds after it started
    Active {
        index: usize,
        segment: &'a Segment,
        time_into_s: f64,
    },
    /// Elapsed time is at or past the end of the trajectory
    Complete,
}

impl SegmentPosition<'_> {
    /// Index of the active segment, if any
    pub fn index(&self) -> Option<usize> {
        match self {
            SegmentPosition::Active { index, .. } => Some(*index),
            SegmentPosition::Complete => None,
        }
    }
}

/// A single problem found by [`Trajectory::validate`]
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationIssue {
    NoSegments,
    NonPositiveCurrentLimit(f64),
    NonPositiveVoltageLimit(f64),
    NegativeStartVoltage(f64),
    NegativeStartCurrent(f64),
    NonFinite(&'static str),
    NonPositiveDuration { index: usize, duration_s: f64 },
    MissingTarget { index: usize, mode: ControlMode },
    NegativeTarget { index: usize, target: f64 },
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Segment numbers are 1-based for operators
        match self {
            ValidationIssue::NoSegments => write!(f, "trajectory has no segments"),
            ValidationIssue::NonPositiveCurrentLimit(v) => {
                write!(f, "current limit must be positive: {v}")
            }
            ValidationIssue::NonPositiveVoltageLimit(v) => {
                write!(f, "voltage limit must be positive: {v}")
            }
            ValidationIssue::NegativeStartVoltage(v) => {
                write!(f, "start voltage cannot be negative: {v}")
            }
            ValidationIssue::NegativeStartCurrent(v) => {
                write!(f, "start current cannot be negative: {v}")
            }
            ValidationIssue::NonFinite(field) => write!(f, "{field} must be finite"),
            ValidationIssue::NonPositiveDuration { index, duration_s } => {
                write!(f, "segment {}: duration must be positive: {duration_s}", index + 1)
            }
            ValidationIssue::MissingTarget { index, mode } => {
                write!(f, "segment {}: ramp missing target_{mode}", index + 1)
            }
            ValidationIssue::NegativeTarget { index, target } => {
                write!(f, "segment {}: target cannot be negative: {target}", index + 1)
            }
        }
    }
}

/// Result of [`Trajectory::validate`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidationReport {
    issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// True when no issues were found
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }

    /// All issues, in discovery order
    pub fn issues(&self) -> &[ValidationIssue] {
        &self.issues
    }

    /// Human-readable reasons
    pub fn reasons(&self) -> Vec<String> {
        self.issues.iter().map(ToString::to_string).collect()
    }

    fn push(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.issues.is_empty() {
            return f.write_str("valid");
        }
        for (i, issue) in self.issues.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

/// A setpoint trajectory
#[derive(Debug, Clone, PartialEq)]
pub struct Trajectory {
    /// Display name
    pub name: String,
    /// Free-form description
    pub description: String,
    /// Driven quantity
    pub control_mode: ControlMode,
    /// Voltage before the first segment (V)
    pub start_voltage: f64,
    /// Current before the first segment (A)
    pub start_current: f64,
    /// Current ceiling applied in voltage mode (A)
    pub current_limit: f64,
    /// Voltage ceiling applied in current mode (V)
    pub voltage_limit: f64,
    segments: Vec<Segment>,
}

impl Default for Trajectory {
    fn default() -> Self {
        Self::new(DEFAULT_NAME)
    }
}

impl Trajectory {
    /// Create an empty voltage-mode trajectory
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            control_mode: ControlMode::Voltage,
            start_voltage: 0.0,
            start_current: 0.0,
            current_limit: DEFAULT_CURRENT_LIMIT,
            voltage_limit: DEFAULT_VOLTAGE_LIMIT,
            segments: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_control_mode(mut self, mode: ControlMode) -> Self {
        self.control_mode = mode;
        self
    }

    pub fn with_start_voltage(mut self, volts: f64) -> Self {
        self.start_voltage = volts;
        self
    }

    pub fn with_start_current(mut self, amps: f64) -> Self {
        self.start_current = amps;
        self
    }

    /// Set the protective ceilings (voltage in V, current in A)
    pub fn with_limits(mut self, voltage_limit: f64, current_limit: f64) -> Self {
        self.voltage_limit = voltage_limit;
        self.current_limit = current_limit;
        self
    }

    /// Append a segment
    pub fn push(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    /// Append a ramp to `target` in the current control mode
    pub fn add_ramp(&mut self, target: f64, duration_s: f64) -> Result<(), SegmentError> {
        let segment = Segment::ramp(self.control_mode, target, duration_s)?;
        self.segments.push(segment);
        Ok(())
    }

    /// Append a hold
    pub fn add_hold(&mut self, duration_s: f64) -> Result<(), SegmentError> {
        let segment = Segment::hold(duration_s)?;
        self.segments.push(segment);
        Ok(())
    }

    /// Remove all segments
    pub fn clear(&mut self) {
        self.segments.clear();
    }

    /// Segments in execution order
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Number of segments
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Total duration in seconds
    pub fn total_duration(&self) -> f64 {
        self.segments.iter().map(Segment::duration_s).sum()
    }

    /// Start value of the driven quantity
    pub fn start_value(&self) -> f64 {
        match self.control_mode {
            ControlMode::Voltage => self.start_voltage,
            ControlMode::Current => self.start_current,
        }
    }

    /// Ceiling programmed on the quantity that is not driven
    pub fn protective_limit(&self) -> f64 {
        match self.control_mode {
            ControlMode::Voltage => self.current_limit,
            ControlMode::Current => self.voltage_limit,
        }
    }

    /// Locate the segment active at `elapsed_s`
    pub fn segment_at(&self, elapsed_s: f64) -> SegmentPosition<'_> {
        let elapsed_s = elapsed_s.max(0.0);
        let mut segment_start = 0.0;

        for (index, segment) in self.segments.iter().enumerate() {
            let segment_end = segment_start + segment.duration_s();
            if segment_end > elapsed_s {
                return SegmentPosition::Active {
                    index,
                    segment,
                    time_into_s: elapsed_s - segment_start,
                };
            }
            segment_start = segment_end;
        }

        SegmentPosition::Complete
    }

    /// Setpoint at `elapsed_s`
    ///
    /// Each segment starts from the value the previous one ended at, so the
    /// result is continuous in time. Past the last segment the final value
    /// is held.
    pub fn value_at(&self, elapsed_s: f64) -> f64 {
        let elapsed_s = elapsed_s.max(0.0);
        let mode = self.control_mode;
        let mut current_value = self.start_value();
        let mut segment_start = 0.0;

        for segment in &self.segments {
            let duration = segment.duration_s();
            let segment_end = segment_start + duration;

            if elapsed_s <= segment_end {
                let progress = if duration > DEGENERATE_DURATION_S {
                    (elapsed_s - segment_start) / duration
                } else {
                    1.0
                };
                return segment.interpolate(mode, current_value, progress);
            }

            current_value = segment.end_value(mode, current_value);
            segment_start = segment_end;
        }

        current_value
    }

    /// Setpoint at the end of the trajectory
    pub fn final_value(&self) -> f64 {
        let mode = self.control_mode;
        self.segments
            .iter()
            .fold(self.start_value(), |value, segment| segment.end_value(mode, value))
    }

    /// Check the trajectory for errors
    ///
    /// Never fails; every problem found is reported.
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        if self.segments.is_empty() {
            report.push(ValidationIssue::NoSegments);
        }

        let scalars = [
            ("start_voltage", self.start_voltage),
            ("start_current", self.start_current),
            ("current_limit", self.current_limit),
            ("voltage_limit", self.voltage_limit),
        ];
        for (field, value) in scalars {
            if !value.is_finite() {
                report.push(ValidationIssue::NonFinite(field));
            }
        }

        if self.current_limit <= 0.0 {
            report.push(ValidationIssue::NonPositiveCurrentLimit(self.current_limit));
        }
        if self.voltage_limit <= 0.0 {
            report.push(ValidationIssue::NonPositiveVoltageLimit(self.voltage_limit));
        }
        if self.start_voltage < 0.0 {
            report.push(ValidationIssue::NegativeStartVoltage(self.start_voltage));
        }
        if self.start_current < 0.0 {
            report.push(ValidationIssue::NegativeStartCurrent(self.start_current));
        }

        for (index, segment) in self.segments.iter().enumerate() {
            let duration_s = segment.duration_s();
            if !duration_s.is_finite() || duration_s <= 0.0 {
                report.push(ValidationIssue::NonPositiveDuration { index, duration_s });
            }
            if segment.kind() == SegmentKind::Ramp {
                match segment.target(self.control_mode) {
                    None => report.push(ValidationIssue::MissingTarget {
                        index,
                        mode: self.control_mode,
                    }),
                    Some(target) if target < 0.0 => {
                        report.push(ValidationIssue::NegativeTarget { index, target })
                    }
                    Some(_) => {}
                }
            }
        }

        report
    }
}

impl fmt::Display for Trajectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} segments, {:.1} s, {} mode)",
            self.name,
            self.segments.len(),
            self.total_duration(),
            self.control_mode
        )
    }
}
