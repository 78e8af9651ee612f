//! Trajectory segments
//!
//! Segments are the atomic units of a trajectory. A ramp moves the setpoint
//! linearly to a target over its duration; a hold keeps the setpoint where
//! the previous segment left it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ControlMode;

/// Segment kind, as written in trajectory files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(rename_all = "lowercase")]
pub enum SegmentKind {
    Ramp,
    #[default]
    Hold,
}

/// Errors raised when constructing a segment
#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum SegmentError {
    /// Duration must be strictly positive
    #[error("duration must be positive, got {0}")]
    NonPositiveDuration(f64),
    /// Targets cannot be negative
    #[error("target cannot be negative, got {0}")]
    NegativeTarget(f64),
    /// A ramp needs a target for at least one control mode
    #[error("ramp segment has no target")]
    MissingTarget,
    /// NaN or infinite input
    #[error("segment values must be finite")]
    NonFinite,
}

/// Ramp end values, per control mode
///
/// A trajectory only reads the target matching its control mode; the other
/// one is carried along so files round-trip unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RampTarget {
    /// Voltage reached at the end of the ramp (V)
    pub voltage: Option<f64>,
    /// Current reached at the end of the ramp (A)
    pub current: Option<f64>,
}

impl RampTarget {
    /// Target for a single control mode
    pub fn for_mode(mode: ControlMode, value: f64) -> Self {
        match mode {
            ControlMode::Voltage => Self {
                voltage: Some(value),
                current: None,
            },
            ControlMode::Current => Self {
                voltage: None,
                current: Some(value),
            },
        }
    }

    /// Target value for the given control mode
    pub fn get(&self, mode: ControlMode) -> Option<f64> {
        match mode {
            ControlMode::Voltage => self.voltage,
            ControlMode::Current => self.current,
        }
    }

    fn check(&self) -> Result<(), SegmentError> {
        if self.voltage.is_none() && self.current.is_none() {
            return Err(SegmentError::MissingTarget);
        }
        for value in [self.voltage, self.current].into_iter().flatten() {
            if !value.is_finite() {
                return Err(SegmentError::NonFinite);
            }
            if value < 0.0 {
                return Err(SegmentError::NegativeTarget(value));
            }
        }
        Ok(())
    }
}

/// A single trajectory segment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Segment {
    /// Linear change from the previous end value to `target`
    Ramp { duration_s: f64, target: RampTarget },
    /// Keep the previous end value
    Hold { duration_s: f64 },
}

impl Segment {
    /// Create a ramp towards `target` in the given control mode
    pub fn ramp(mode: ControlMode, target: f64, duration_s: f64) -> Result<Self, SegmentError> {
        Self::ramp_to(RampTarget::for_mode(mode, target), duration_s)
    }

    /// Create a ramp with explicit per-mode targets
    pub fn ramp_to(target: RampTarget, duration_s: f64) -> Result<Self, SegmentError> {
        check_duration(duration_s)?;
        target.check()?;
        Ok(Segment::Ramp { duration_s, target })
    }

    /// Create a hold
    pub fn hold(duration_s: f64) -> Result<Self, SegmentError> {
        check_duration(duration_s)?;
        Ok(Segment::Hold { duration_s })
    }

    /// Segment kind
    pub fn kind(&self) -> SegmentKind {
        match self {
            Segment::Ramp { .. } => SegmentKind::Ramp,
            Segment::Hold { .. } => SegmentKind::Hold,
        }
    }

    /// Duration in seconds
    pub fn duration_s(&self) -> f64 {
        match *self {
            Segment::Ramp { duration_s, .. } | Segment::Hold { duration_s } => duration_s,
        }
    }

    /// Ramp target for the given mode (`None` for holds)
    pub fn target(&self, mode: ControlMode) -> Option<f64> {
        match self {
            Segment::Ramp { target, .. } => target.get(mode),
            Segment::Hold { .. } => None,
        }
    }

    /// Value at `progress` (0.0..=1.0) through this segment, starting from `from`
    pub fn interpolate(&self, mode: ControlMode, from: f64, progress: f64) -> f64 {
        match self.target(mode) {
            Some(target) => from + (target - from) * progress,
            None => from,
        }
    }

    /// Value at the end of this segment, starting from `from`
    pub fn end_value(&self, mode: ControlMode, from: f64) -> f64 {
        self.target(mode).unwrap_or(from)
    }
}

fn check_duration(duration_s: f64) -> Result<(), SegmentError> {
    if !duration_s.is_finite() {
        return Err(SegmentError::NonFinite);
    }
    if duration_s <= 0.0 {
        return Err(SegmentError::NonPositiveDuration(duration_s));
    }
    Ok(())
}
