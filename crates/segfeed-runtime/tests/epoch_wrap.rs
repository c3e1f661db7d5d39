use std::sync::{Arc, Mutex};

use anyhow::Result;

use segfeed_core::manifest::Manifest;
use segfeed_core::types::{ClipRecord, Modality, Phase};
use segfeed_runtime::pipeline::SegmentLoader;
use segfeed_runtime::provider::{FrameProvider, FrameRequest, PixelBlock};
use segfeed_runtime::types::LoaderConfig;

fn config(batch_size: usize, phase: Phase, shuffle: bool) -> LoaderConfig {
    LoaderConfig {
        source: std::path::PathBuf::new(),
        frame_root: String::new(),
        tube_root: String::new(),
        new_height: 2,
        new_width: 3,
        crop_size: 0,
        segment_len: 8,
        segment_count: 3,
        batch_size,
        modality: Modality::Rgb,
        phase,
        shuffle,
        seed: 7,
        trajectory_lead: 15,
    }
}

fn records(count: usize) -> Vec<ClipRecord> {
    (0..count)
        .map(|i| ClipRecord {
            path: format!("clip-{i:02}.mp4"),
            duration_frames: 40 + i as u64,
            label: i as u64,
        })
        .collect()
}

fn block_for(request: &FrameRequest) -> PixelBlock {
    let frames = request.offsets.len() * request.segment_len as usize;
    let bytes = frames
        * request.modality.channels_per_frame() as usize
        * request.height as usize
        * request.width as usize;
    PixelBlock {
        bytes: vec![0; bytes],
    }
}

struct ZeroProvider;

impl FrameProvider for ZeroProvider {
    fn fetch(&self, request: &FrameRequest) -> Result<Option<PixelBlock>> {
        Ok(Some(block_for(request)))
    }
}

#[derive(Default)]
struct OffsetRecordingProvider {
    offsets: Mutex<Vec<Vec<u64>>>,
}

impl FrameProvider for OffsetRecordingProvider {
    fn fetch(&self, request: &FrameRequest) -> Result<Option<PixelBlock>> {
        self.offsets
            .lock()
            .expect("offsets mutex poisoned")
            .push(request.offsets.clone());
        Ok(Some(block_for(request)))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrap_reshuffles_and_preserves_the_label_multiset() -> Result<()> {
    let manifest = Manifest::from_records(records(50))?;
    let loader = SegmentLoader::with_manifest(
        config(5, Phase::Eval, true),
        manifest,
        Arc::new(ZeroProvider),
    )?;
    let metrics = loader.metrics();
    let mut stream = loader.spawn()?;

    let mut epochs: Vec<Vec<u64>> = Vec::new();
    for _ in 0..2 {
        let mut labels = Vec::new();
        while labels.len() < 50 {
            let lease = stream
                .next()
                .await?
                .expect("stream ended before two epochs were drained");
            labels.extend_from_slice(lease.labels());
        }
        epochs.push(labels);
    }
    stream.shutdown().await?;

    let expected: Vec<u64> = (0..50).collect();
    for epoch in &epochs {
        let mut sorted = epoch.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, expected, "an epoch lost or duplicated clips");
    }
    assert_ne!(
        epochs[0], expected,
        "the setup shuffle left the manifest in insertion order"
    );
    assert_ne!(
        epochs[0], epochs[1],
        "the wrap did not reshuffle the manifest"
    );
    assert!(metrics.epochs_completed_total.get() >= 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn an_unshuffled_wrap_repeats_manifest_order() -> Result<()> {
    let manifest = Manifest::from_records(records(3))?;
    let loader = SegmentLoader::with_manifest(
        config(3, Phase::Eval, false),
        manifest,
        Arc::new(ZeroProvider),
    )?;
    let metrics = loader.metrics();
    let mut stream = loader.spawn()?;

    for _ in 0..2 {
        let lease = stream
            .next()
            .await?
            .expect("stream ended before the wrap was observed");
        assert_eq!(lease.labels(), &[0, 1, 2]);
        drop(lease);
    }
    stream.shutdown().await?;

    assert!(metrics.epochs_completed_total.get() >= 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn train_offsets_advance_across_epochs() -> Result<()> {
    let manifest = Manifest::from_records(vec![ClipRecord {
        path: "only.clip".to_string(),
        duration_frames: 10_000,
        label: 0,
    }])?;
    let provider = Arc::new(OffsetRecordingProvider::default());
    let loader = SegmentLoader::with_manifest(
        config(1, Phase::Train, false),
        manifest,
        provider.clone(),
    )?;
    let mut stream = loader.spawn()?;

    for _ in 0..2 {
        let lease = stream
            .next()
            .await?
            .expect("stream ended before the clip repeated");
        drop(lease);
    }
    stream.shutdown().await?;

    // The offset stream keeps advancing across the wrap, so the same clip
    // draws fresh windows in the next epoch.
    let offsets = provider.offsets.lock().expect("offsets mutex poisoned");
    assert!(offsets.len() >= 2);
    assert_eq!(offsets[0].len(), 3);
    assert_eq!(offsets[1].len(), 3);
    assert_ne!(offsets[0], offsets[1]);
    Ok(())
}
