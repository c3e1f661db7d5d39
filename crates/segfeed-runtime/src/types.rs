use std::path::PathBuf;

use anyhow::{ensure, Result};

use segfeed_core::sampler::SamplerConfig;
use segfeed_core::types::{Modality, Phase};

/// Everything the loader reads from the outside configuration layer.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Manifest file: one `<path> <duration> <label>` triple per line.
    pub source: PathBuf,
    /// Root the provider resolves clip paths against for frame storage.
    pub frame_root: String,
    /// Root for trajectory/tube storage; empty for other modalities.
    pub tube_root: String,
    pub new_height: u32,
    pub new_width: u32,
    /// Output crop edge; 0 delivers full `new_height x new_width` frames.
    pub crop_size: u32,
    pub segment_len: u32,
    pub segment_count: u32,
    pub batch_size: usize,
    pub modality: Modality,
    pub phase: Phase,
    pub shuffle: bool,
    pub seed: u64,
    /// Frames reserved before the usable window in trajectory sampling.
    pub trajectory_lead: u32,
}

impl LoaderConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.batch_size > 0, "batch_size must be > 0");
        ensure!(self.new_height > 0, "new_height must be > 0");
        ensure!(self.new_width > 0, "new_width must be > 0");
        self.sampler_config().validate()?;
        Ok(())
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            segment_count: self.segment_count,
            segment_len: self.segment_len,
            modality: self.modality,
            trajectory_lead: self.trajectory_lead,
        }
    }

    pub fn batch_shape(&self) -> Result<BatchShape> {
        BatchShape::from_config(self)
    }
}

/// Logical batch geometry, fixed at setup.
///
/// `channels` folds the temporal axis in: segment_count * segment_len *
/// per-frame channels of the modality. Height and width are the output
/// dimensions after any crop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchShape {
    pub batch: usize,
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl BatchShape {
    pub fn from_config(cfg: &LoaderConfig) -> Result<Self> {
        let channels = (cfg.segment_count as usize)
            .checked_mul(cfg.segment_len as usize)
            .and_then(|v| v.checked_mul(cfg.modality.channels_per_frame() as usize))
            .ok_or_else(|| anyhow::anyhow!("channel count overflow"))?;

        let (height, width) = if cfg.crop_size > 0 {
            (cfg.crop_size as usize, cfg.crop_size as usize)
        } else {
            (cfg.new_height as usize, cfg.new_width as usize)
        };

        let shape = Self {
            batch: cfg.batch_size,
            channels,
            height,
            width,
        };
        // Reject geometry whose byte sizes cannot be addressed.
        shape.batch_bytes()?;
        Ok(shape)
    }

    pub fn sample_bytes(&self) -> Result<usize> {
        self.channels
            .checked_mul(self.height)
            .and_then(|v| v.checked_mul(self.width))
            .ok_or_else(|| anyhow::anyhow!("sample byte size overflow"))
    }

    pub fn batch_bytes(&self) -> Result<usize> {
        self.sample_bytes()?
            .checked_mul(self.batch)
            .ok_or_else(|| anyhow::anyhow!("batch byte size overflow"))
    }
}

/// One reusable batch allocation: pixels shaped
/// `(batch, channels, height, width)` row-major as `u8`, plus the parallel
/// label vector. Exactly two of these cycle between filler and consumer for
/// the life of a stream.
#[derive(Debug)]
pub struct BatchBuf {
    pub pixels: Vec<u8>,
    pub labels: Vec<u64>,
}

impl BatchBuf {
    pub fn zeroed(batch_bytes: usize, batch: usize) -> Self {
        Self {
            pixels: vec![0; batch_bytes],
            labels: vec![0; batch],
        }
    }
}
