use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A single labeled clip in the dataset index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClipRecord {
    /// Clip identifier, resolved against a storage root by the frame provider.
    pub path: String,
    pub duration_frames: u64,
    pub label: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClipRecordError {
    #[error("clip path must be non-empty")]
    EmptyPath,
    #[error("duration_frames must be >= 1")]
    ZeroDuration,
}

impl ClipRecord {
    pub fn validate(&self) -> Result<(), ClipRecordError> {
        if self.path.trim().is_empty() {
            return Err(ClipRecordError::EmptyPath);
        }
        if self.duration_frames == 0 {
            return Err(ClipRecordError::ZeroDuration);
        }
        Ok(())
    }
}

/// Visual signal decoded for each segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Modality {
    Rgb,
    Flow,
    Trajectory,
}

impl Modality {
    /// Channels contributed by one decoded frame of this modality.
    ///
    /// RGB frames decode to 3 channels, flow fields to x/y planes,
    /// trajectory stacks to single-channel maps.
    pub fn channels_per_frame(&self) -> u32 {
        match self {
            Modality::Rgb => 3,
            Modality::Flow => 2,
            Modality::Trajectory => 1,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown modality {0:?}; expected rgb, flow, or trajectory")]
pub struct ModalityParseError(String);

impl FromStr for Modality {
    type Err = ModalityParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "rgb" => Ok(Modality::Rgb),
            "flow" => Ok(Modality::Flow),
            "trajectory" => Ok(Modality::Trajectory),
            _ => Err(ModalityParseError(input.to_string())),
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Rgb => write!(f, "rgb"),
            Modality::Flow => write!(f, "flow"),
            Modality::Trajectory => write!(f, "trajectory"),
        }
    }
}

/// Sampling phase: stochastic for training, deterministic for evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Train,
    Eval,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown phase {0:?}; expected train or eval")]
pub struct PhaseParseError(String);

impl FromStr for Phase {
    type Err = PhaseParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "train" => Ok(Phase::Train),
            "eval" => Ok(Phase::Eval),
            _ => Err(PhaseParseError(input.to_string())),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Train => write!(f, "train"),
            Phase::Eval => write!(f, "eval"),
        }
    }
}
