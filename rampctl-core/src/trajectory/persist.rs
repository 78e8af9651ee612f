//! Trajectory persistence
//!
//! Trajectories are stored as TOML, JSON (the historical format) or compact
//! postcard binary. The on-disk shape is the flat key/value record below;
//! segments are rebuilt through the validating constructors, so a file can
//! never produce a segment that could not be built in code.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::segment::{RampTarget, Segment, SegmentError, SegmentKind};
use super::{ControlMode, Trajectory, DEFAULT_CURRENT_LIMIT, DEFAULT_NAME, DEFAULT_VOLTAGE_LIMIT};

/// Persistence errors
#[derive(Debug, Error)]
pub enum PersistError {
    /// File could not be read or written
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// TOML parsing failed
    #[error("invalid TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    /// TOML serialization failed
    #[error("TOML serialization failed: {0}")]
    TomlWrite(#[from] toml::ser::Error),
    /// JSON parsing or serialization failed
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Binary decoding or encoding failed
    #[error("invalid binary trajectory: {0}")]
    Binary(#[from] postcard::Error),
    /// A segment record could not be turned into a segment
    #[error("segment {}: {source}", index + 1)]
    Segment {
        index: usize,
        #[source]
        source: SegmentError,
    },
    /// None of the known formats could decode the file
    #[error("unrecognized trajectory format")]
    UnknownFormat,
}

/// Supported file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrajectoryFormat {
    Toml,
    Json,
    Binary,
}

impl TrajectoryFormat {
    /// Infer the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "toml" => Some(TrajectoryFormat::Toml),
            "json" => Some(TrajectoryFormat::Json),
            "bin" | "postcard" => Some(TrajectoryFormat::Binary),
            _ => None,
        }
    }
}

/// On-disk trajectory record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct TrajectoryRecord {
    name: String,
    description: String,
    control_mode: ControlMode,
    start_voltage: f64,
    start_current: f64,
    current_limit: f64,
    voltage_limit: f64,
    segments: Vec<SegmentRecord>,
}

impl Default for TrajectoryRecord {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME.into(),
            description: String::new(),
            control_mode: ControlMode::Voltage,
            start_voltage: 0.0,
            start_current: 0.0,
            current_limit: DEFAULT_CURRENT_LIMIT,
            voltage_limit: DEFAULT_VOLTAGE_LIMIT,
            segments: Vec::new(),
        }
    }
}

/// On-disk segment record
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
struct SegmentRecord {
    #[serde(rename = "type")]
    kind: SegmentKind,
    duration_sec: f64,
    target_voltage: Option<f64>,
    target_current: Option<f64>,
}

impl From<&Segment> for SegmentRecord {
    fn from(segment: &Segment) -> Self {
        match *segment {
            Segment::Ramp { duration_s, target } => Self {
                kind: SegmentKind::Ramp,
                duration_sec: duration_s,
                target_voltage: target.voltage,
                target_current: target.current,
            },
            Segment::Hold { duration_s } => Self {
                kind: SegmentKind::Hold,
                duration_sec: duration_s,
                target_voltage: None,
                target_current: None,
            },
        }
    }
}

impl SegmentRecord {
    fn to_segment(&self) -> Result<Segment, SegmentError> {
        match self.kind {
            SegmentKind::Ramp => Segment::ramp_to(
                RampTarget {
                    voltage: self.target_voltage,
                    current: self.target_current,
                },
                self.duration_sec,
            ),
            SegmentKind::Hold => Segment::hold(self.duration_sec),
        }
    }
}

impl From<&Trajectory> for TrajectoryRecord {
    fn from(t: &Trajectory) -> Self {
        Self {
            name: t.name.clone(),
            description: t.description.clone(),
            control_mode: t.control_mode,
            start_voltage: t.start_voltage,
            start_current: t.start_current,
            current_limit: t.current_limit,
            voltage_limit: t.voltage_limit,
            segments: t.segments().iter().map(SegmentRecord::from).collect(),
        }
    }
}

impl TryFrom<TrajectoryRecord> for Trajectory {
    type Error = PersistError;

    fn try_from(record: TrajectoryRecord) -> Result<Self, Self::Error> {
        let mut trajectory = Trajectory::new(record.name)
            .with_description(record.description)
            .with_control_mode(record.control_mode)
            .with_start_voltage(record.start_voltage)
            .with_start_current(record.start_current)
            .with_limits(record.voltage_limit, record.current_limit);

        for (index, seg) in record.segments.iter().enumerate() {
            let segment = seg
                .to_segment()
                .map_err(|source| PersistError::Segment { index, source })?;
            trajectory.push(segment);
        }

        Ok(trajectory)
    }
}

impl Trajectory {
    /// Parse a TOML document
    pub fn from_toml_str(input: &str) -> Result<Self, PersistError> {
        let record: TrajectoryRecord = toml::from_str(input)?;
        record.try_into()
    }

    /// Render as a TOML document
    pub fn to_toml_string(&self) -> Result<String, PersistError> {
        Ok(toml::to_string_pretty(&TrajectoryRecord::from(self))?)
    }

    /// Parse a JSON document
    pub fn from_json_str(input: &str) -> Result<Self, PersistError> {
        let record: TrajectoryRecord = serde_json::from_str(input)?;
        record.try_into()
    }

    /// Render as pretty-printed JSON
    pub fn to_json_string(&self) -> Result<String, PersistError> {
        Ok(serde_json::to_string_pretty(&TrajectoryRecord::from(self))?)
    }

    /// Decode from postcard binary
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PersistError> {
        let record: TrajectoryRecord = postcard::from_bytes(bytes)?;
        record.try_into()
    }

    /// Encode as postcard binary
    pub fn to_bytes(&self) -> Result<Vec<u8>, PersistError> {
        Ok(postcard::to_stdvec(&TrajectoryRecord::from(self))?)
    }

    /// Load a trajectory, reporting why it failed
    ///
    /// The format follows the file extension. Files without a known
    /// extension are tried as TOML, then JSON, then binary.
    pub fn try_load(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(|source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let trajectory = match TrajectoryFormat::from_path(path) {
            Some(format) => decode(format, &bytes)?,
            None => decode_any(&bytes)?,
        };

        info!(
            "Loaded trajectory '{}' from {}",
            trajectory.name,
            path.display()
        );
        debug!(
            "  {} segments, {:.1} s, {} mode",
            trajectory.segment_count(),
            trajectory.total_duration(),
            trajectory.control_mode
        );
        Ok(trajectory)
    }

    /// Load a trajectory
    ///
    /// Returns `None` when the file is missing or malformed; the reason is
    /// logged.
    pub fn load(path: impl AsRef<Path>) -> Option<Self> {
        let path = path.as_ref();
        match Self::try_load(path) {
            Ok(trajectory) => Some(trajectory),
            Err(e) => {
                warn!("Failed to load trajectory {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Save in the format implied by the file extension (JSON if unknown)
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let path = path.as_ref();
        let format = TrajectoryFormat::from_path(path).unwrap_or(TrajectoryFormat::Json);

        let bytes = match format {
            TrajectoryFormat::Toml => self.to_toml_string()?.into_bytes(),
            TrajectoryFormat::Json => self.to_json_string()?.into_bytes(),
            TrajectoryFormat::Binary => self.to_bytes()?,
        };

        fs::write(path, bytes).map_err(|source| PersistError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        debug!("Saved trajectory '{}' to {}", self.name, path.display());
        Ok(())
    }
}

fn decode(format: TrajectoryFormat, bytes: &[u8]) -> Result<Trajectory, PersistError> {
    match format {
        TrajectoryFormat::Toml => Trajectory::from_toml_str(utf8(bytes)?),
        TrajectoryFormat::Json => Trajectory::from_json_str(utf8(bytes)?),
        TrajectoryFormat::Binary => Trajectory::from_bytes(bytes),
    }
}

fn decode_any(bytes: &[u8]) -> Result<Trajectory, PersistError> {
    if let Ok(text) = std::str::from_utf8(bytes) {
        match Trajectory::from_toml_str(text) {
            Ok(t) => return Ok(t),
            Err(e @ PersistError::Segment { .. }) => return Err(e),
            Err(e) => debug!("Not a TOML trajectory ({}), trying JSON", e),
        }
        match Trajectory::from_json_str(text) {
            Ok(t) => return Ok(t),
            Err(e @ PersistError::Segment { .. }) => return Err(e),
            Err(e) => debug!("Not a JSON trajectory ({}), trying binary", e),
        }
    }

    Trajectory::from_bytes(bytes).map_err(|e| match e {
        PersistError::Binary(_) => PersistError::UnknownFormat,
        other => other,
    })
}

fn utf8(bytes: &[u8]) -> Result<&str, PersistError> {
    std::str::from_utf8(bytes).map_err(|_| PersistError::UnknownFormat)
}
