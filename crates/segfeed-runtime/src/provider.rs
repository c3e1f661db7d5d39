use anyhow::Result;

use segfeed_core::types::Modality;

/// One decode request covering every segment of one clip.
#[derive(Debug, Clone)]
pub struct FrameRequest {
    /// Clip identifier from the manifest, resolved against the roots below.
    pub clip_path: String,
    /// Start offsets, one per segment, each within `[0, duration - segment_len]`.
    pub offsets: Vec<u64>,
    pub segment_len: u32,
    /// Output height the block must have (crop already applied).
    pub height: u32,
    /// Output width the block must have (crop already applied).
    pub width: u32,
    pub modality: Modality,
    pub frame_root: String,
    pub tube_root: String,
}

/// Decoded pixels for one clip, segment-major:
/// `offsets.len() * segment_len * channels_per_frame * height * width` bytes.
#[derive(Debug, Clone)]
pub struct PixelBlock {
    pub bytes: Vec<u8>,
}

/// Decoding interface for `segfeed-runtime`.
///
/// This is intentionally synchronous: implementations do blocking disk and
/// codec work, and the loader calls them from a blocking task so decode
/// latency stays off the async executor.
///
/// `Ok(None)` marks a recoverable per-clip failure (missing file, corrupt
/// frame, offset beyond a decodable region); the loader skips the clip and
/// refills the slot from the next cursor position. `Err` is fatal and tears
/// the pipeline down.
pub trait FrameProvider: Send + Sync + 'static {
    fn fetch(&self, request: &FrameRequest) -> Result<Option<PixelBlock>>;
}
