use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Modality, Phase};

/// Default leading skip for trajectory sampling, in frames.
pub const DEFAULT_TRAJECTORY_LEAD: u32 = 15;

/// Sampling geometry shared by both phase policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub segment_count: u32,
    pub segment_len: u32,
    pub modality: Modality,
    /// Frames reserved before the usable window when sampling trajectories.
    /// Ignored for other modalities.
    pub trajectory_lead: u32,
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<(), SamplerError> {
        if self.segment_count == 0 {
            return Err(SamplerError::InvalidConfig(
                "segment_count must be > 0".to_string(),
            ));
        }
        if self.segment_len == 0 {
            return Err(SamplerError::InvalidConfig(
                "segment_len must be > 0".to_string(),
            ));
        }
        if self.modality == Modality::Trajectory && self.trajectory_lead == 0 {
            return Err(SamplerError::InvalidConfig(
                "trajectory_lead must be > 0 for trajectory sampling".to_string(),
            ));
        }
        Ok(())
    }

    /// Shortest clip this geometry can sample: every per-segment window must
    /// hold at least one full segment.
    pub fn min_duration_frames(&self) -> u64 {
        u64::from(self.segment_count) * u64::from(self.segment_len)
    }
}

/// Ordered start offsets for one clip, one per segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentPlan {
    pub offsets: Vec<u64>,
}

impl SegmentPlan {
    pub fn segment_count(&self) -> usize {
        self.offsets.len()
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SamplerError {
    #[error("invalid sampler config: {0}")]
    InvalidConfig(String),
    #[error(
        "clip of {duration_frames} frames is too short for \
         {segment_count} segments of {segment_len} frames"
    )]
    ClipTooShort {
        duration_frames: u64,
        segment_count: u32,
        segment_len: u32,
    },
    #[error("offset {offset} + segment_len {segment_len} exceeds clip duration {duration_frames}")]
    OffsetOutOfBounds {
        offset: u64,
        segment_len: u32,
        duration_frames: u64,
    },
}

/// Offset policy, selected once at configuration time.
///
/// `plan` maps one clip's duration to `segment_count` start offsets. The RNG
/// is the run-wide offset stream; deterministic policies leave it untouched.
pub trait SegmentSampler: Send + Sync {
    fn plan(&self, duration_frames: u64, rng: &mut StdRng) -> Result<SegmentPlan, SamplerError>;
}

pub fn sampler_for(
    phase: Phase,
    cfg: SamplerConfig,
) -> Result<Box<dyn SegmentSampler>, SamplerError> {
    match phase {
        Phase::Train => Ok(Box::new(TrainSampler::new(cfg)?)),
        Phase::Eval => Ok(Box::new(EvalSampler::new(cfg)?)),
    }
}

/// Stochastic sampling: one uniformly random offset inside each per-segment
/// window, so successive epochs see different frames of the same clip.
#[derive(Debug, Clone)]
pub struct TrainSampler {
    cfg: SamplerConfig,
}

impl TrainSampler {
    pub fn new(cfg: SamplerConfig) -> Result<Self, SamplerError> {
        cfg.validate()?;
        Ok(Self { cfg })
    }
}

impl SegmentSampler for TrainSampler {
    fn plan(&self, duration_frames: u64, rng: &mut StdRng) -> Result<SegmentPlan, SamplerError> {
        let cfg = &self.cfg;
        let avg = window_span(cfg, duration_frames)?;
        let len = u64::from(cfg.segment_len);
        let lead = u64::from(cfg.trajectory_lead);

        let mut offsets = Vec::with_capacity(cfg.segment_count as usize);
        for i in 0..u64::from(cfg.segment_count) {
            let local = match cfg.modality {
                Modality::Rgb | Modality::Flow => rng.gen_range(0..=avg - len),
                Modality::Trajectory => {
                    if avg >= lead + len - 1 {
                        rng.gen_range(0..=avg - len + 1 - lead) + lead - 1
                    } else {
                        avg - len
                    }
                }
            };
            offsets.push(local + i * avg);
        }
        checked_plan(cfg, duration_frames, offsets)
    }
}

/// Deterministic sampling: the centered offset inside each per-segment
/// window, for reproducible evaluation. Consumes no randomness.
#[derive(Debug, Clone)]
pub struct EvalSampler {
    cfg: SamplerConfig,
}

impl EvalSampler {
    pub fn new(cfg: SamplerConfig) -> Result<Self, SamplerError> {
        cfg.validate()?;
        Ok(Self { cfg })
    }
}

impl SegmentSampler for EvalSampler {
    fn plan(&self, duration_frames: u64, _rng: &mut StdRng) -> Result<SegmentPlan, SamplerError> {
        let cfg = &self.cfg;
        let avg = window_span(cfg, duration_frames)?;
        let len = u64::from(cfg.segment_len);
        let lead = u64::from(cfg.trajectory_lead);

        let local = match cfg.modality {
            Modality::Rgb | Modality::Flow => (avg - len + 1) / 2,
            Modality::Trajectory => {
                if avg >= lead + len - 1 {
                    (avg - len + lead - 1) / 2
                } else {
                    avg - len
                }
            }
        };

        let offsets = (0..u64::from(cfg.segment_count))
            .map(|i| local + i * avg)
            .collect();
        checked_plan(cfg, duration_frames, offsets)
    }
}

/// Average per-segment window span, rejecting clips the geometry cannot
/// sample without underflowing the offset arithmetic.
fn window_span(cfg: &SamplerConfig, duration_frames: u64) -> Result<u64, SamplerError> {
    let avg = duration_frames / u64::from(cfg.segment_count);
    if avg < u64::from(cfg.segment_len) {
        return Err(SamplerError::ClipTooShort {
            duration_frames,
            segment_count: cfg.segment_count,
            segment_len: cfg.segment_len,
        });
    }
    Ok(avg)
}

fn checked_plan(
    cfg: &SamplerConfig,
    duration_frames: u64,
    offsets: Vec<u64>,
) -> Result<SegmentPlan, SamplerError> {
    let len = u64::from(cfg.segment_len);
    for &offset in &offsets {
        if offset.saturating_add(len) > duration_frames {
            return Err(SamplerError::OffsetOutOfBounds {
                offset,
                segment_len: cfg.segment_len,
                duration_frames,
            });
        }
    }
    Ok(SegmentPlan { offsets })
}
