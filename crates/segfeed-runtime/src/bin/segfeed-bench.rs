#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, info_span, warn, Instrument};

use segfeed_core::manifest::Manifest;
use segfeed_core::types::{ClipRecord, Modality, Phase};
use segfeed_observe::metrics::{Counter, Gauge};
use segfeed_runtime::pipeline::{BatchLease, LoaderMetrics, SegmentLoader};
use segfeed_runtime::provider::{FrameProvider, FrameRequest, PixelBlock};
use segfeed_runtime::sink::Sink;
use segfeed_runtime::types::LoaderConfig;

#[derive(Debug, Parser)]
#[command(name = "segfeed-bench")]
struct Args {
    /// Optional manifest file (`<path> <duration_frames> <label>` per line).
    ///
    /// If unset, a synthetic manifest is generated and decodes are faked.
    #[arg(long, env = "SEGFEED_MANIFEST")]
    manifest: Option<PathBuf>,

    /// Synthetic manifest size when no manifest file is given.
    #[arg(long, env = "SEGFEED_CLIPS", default_value_t = 64)]
    clips: usize,

    #[arg(long, env = "SEGFEED_STEPS", default_value_t = 100)]
    steps: u64,

    #[arg(long, env = "SEGFEED_BATCH_SIZE", default_value_t = 8)]
    batch_size: usize,

    #[arg(long, env = "SEGFEED_SEGMENT_COUNT", default_value_t = 3)]
    segment_count: u32,

    #[arg(long, env = "SEGFEED_SEGMENT_LEN", default_value_t = 1)]
    segment_len: u32,

    /// rgb | flow | trajectory
    #[arg(long, env = "SEGFEED_MODALITY", default_value = "rgb")]
    modality: String,

    /// train | eval
    #[arg(long, env = "SEGFEED_PHASE", default_value = "train")]
    phase: String,

    #[arg(long, env = "SEGFEED_NEW_HEIGHT", default_value_t = 256)]
    new_height: u32,

    #[arg(long, env = "SEGFEED_NEW_WIDTH", default_value_t = 340)]
    new_width: u32,

    /// Square output crop; 0 keeps the resize dimensions.
    #[arg(long, env = "SEGFEED_CROP_SIZE", default_value_t = 224)]
    crop_size: u32,

    /// Disable the seeded epoch shuffle (it is on by default).
    #[arg(long, env = "SEGFEED_NO_SHUFFLE")]
    no_shuffle: bool,

    #[arg(long, env = "SEGFEED_SEED", default_value_t = 42)]
    seed: u64,

    #[arg(long, env = "SEGFEED_TRAJECTORY_LEAD", default_value_t = 15)]
    trajectory_lead: u32,

    /// Consume through the pull-mode batch stream instead of push-mode
    /// `run_steps`.
    #[arg(long, env = "SEGFEED_PULL")]
    pull: bool,

    /// Artificial per-fetch decode latency for the synthetic provider.
    #[arg(long, env = "SEGFEED_DECODE_SLEEP_MS", default_value_t = 0)]
    decode_sleep_ms: u64,

    /// Artificially slow down delivery to exercise the buffer handoff.
    #[arg(long, env = "SEGFEED_SINK_SLEEP_MS", default_value_t = 0)]
    sink_sleep_ms: u64,

    /// Periodically emit a metrics snapshot (0 disables).
    #[arg(long, env = "SEGFEED_METRICS_SNAPSHOT_INTERVAL_MS", default_value_t = 1000)]
    metrics_snapshot_interval_ms: u64,
}

/// Stands in for a real decoder: every fetch yields a block of the exact
/// size the request describes, filled with a byte derived from the clip
/// path so misrouted samples are visible downstream.
struct SyntheticProvider {
    sleep: Duration,
    fetches_total: Counter,
}

impl SyntheticProvider {
    fn new(sleep: Duration) -> Self {
        Self {
            sleep,
            fetches_total: Counter::default(),
        }
    }
}

impl FrameProvider for SyntheticProvider {
    fn fetch(&self, request: &FrameRequest) -> Result<Option<PixelBlock>> {
        if !self.sleep.is_zero() {
            std::thread::sleep(self.sleep);
        }
        self.fetches_total.inc();
        let frames = request.offsets.len() * request.segment_len as usize;
        let bytes = frames
            * request.modality.channels_per_frame() as usize
            * request.height as usize
            * request.width as usize;
        let fill = request
            .clip_path
            .bytes()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
        Ok(Some(PixelBlock {
            bytes: vec![(fill & 0xff) as u8; bytes],
        }))
    }
}

struct BenchSink {
    sleep: Duration,
    delivered_batches_total: Counter,
    delivered_samples_total: Counter,
    delivered_bytes_total: Counter,
    last_batch_bytes: Gauge,
}

impl BenchSink {
    fn new(sleep: Duration) -> Self {
        Self {
            sleep,
            delivered_batches_total: Counter::default(),
            delivered_samples_total: Counter::default(),
            delivered_bytes_total: Counter::default(),
            last_batch_bytes: Gauge::default(),
        }
    }
}

impl Sink for BenchSink {
    fn deliver(&self, batch: &BatchLease) -> Result<()> {
        if !self.sleep.is_zero() {
            std::thread::sleep(self.sleep);
        }
        self.delivered_batches_total.inc();
        self.delivered_samples_total
            .inc_by(batch.sample_count() as u64);
        self.delivered_bytes_total
            .inc_by(batch.pixels().len() as u64);
        self.last_batch_bytes.set(batch.pixels().len() as u64);
        Ok(())
    }
}

fn emit_loader_metrics_snapshot(metrics: &LoaderMetrics, sink: &BenchSink) {
    let fill = metrics.fill_time.snapshot();
    let wait = metrics.consumer_wait.snapshot();
    tracing::info!(
        target: "segfeed_metrics",
        batches_filled_total = metrics.batches_filled_total.get(),
        samples_filled_total = metrics.samples_filled_total.get(),
        batches_delivered_total = metrics.batches_delivered_total.get(),
        clips_skipped_total = metrics.clips_skipped_total.get(),
        short_clips_dropped_total = metrics.short_clips_dropped_total.get(),
        epochs_completed_total = metrics.epochs_completed_total.get(),
        leases_outstanding = metrics.leases_outstanding.get(),
        leases_outstanding_high_water = metrics.leases_outstanding_high_water.get(),
        fill_avg_us = fill.avg_ns() / 1_000,
        fill_max_us = fill.max_ns / 1_000,
        wait_avg_us = wait.avg_ns() / 1_000,
        sink_delivered_batches_total = sink.delivered_batches_total.get(),
        sink_delivered_samples_total = sink.delivered_samples_total.get(),
        sink_delivered_bytes_total = sink.delivered_bytes_total.get(),
        sink_last_batch_bytes = sink.last_batch_bytes.get(),
        "metrics"
    );
}

/// Synthetic clips with durations spread above the sampling minimum so
/// every record survives the short-clip filter.
fn synthetic_records(clips: usize, min_frames: u64) -> Vec<ClipRecord> {
    (0..clips)
        .map(|i| ClipRecord {
            path: format!("synthetic/clip-{i:05}.mp4"),
            duration_frames: min_frames + (i as u64 * 37) % 211,
            label: i as u64 % 101,
        })
        .collect()
}

async fn run(loader: SegmentLoader, sink: Arc<BenchSink>, steps: u64, pull: bool) -> Result<()> {
    if !pull {
        return loader.run_steps(sink, steps).await;
    }
    let mut stream = loader.spawn()?;
    for _ in 0..steps {
        let Some(lease) = stream.next().await? else {
            anyhow::bail!("batch stream ended before the requested steps completed");
        };
        let sink = sink.clone();
        let lease = tokio::task::spawn_blocking(move || -> Result<BatchLease> {
            sink.deliver(&lease)?;
            Ok(lease)
        })
        .await
        .map_err(anyhow::Error::from)??;
        drop(lease);
    }
    stream.shutdown().await
}

#[tokio::main]
async fn main() -> Result<()> {
    segfeed_observe::logging::init_tracing();
    let args = Args::parse();

    let modality: Modality = args
        .modality
        .parse()
        .with_context(|| format!("bad --modality {:?}", args.modality))?;
    let phase: Phase = args
        .phase
        .parse()
        .with_context(|| format!("bad --phase {:?}", args.phase))?;

    let span = info_span!(
        "segfeed-bench",
        steps = args.steps,
        batch_size = args.batch_size,
        segment_count = args.segment_count,
        segment_len = args.segment_len,
        modality = %modality,
        phase = %phase,
        seed = args.seed,
        sink_sleep_ms = args.sink_sleep_ms,
        decode_sleep_ms = args.decode_sleep_ms,
    );

    async move {
        let cfg = LoaderConfig {
            source: args.manifest.clone().unwrap_or_default(),
            frame_root: String::new(),
            tube_root: String::new(),
            new_height: args.new_height,
            new_width: args.new_width,
            crop_size: args.crop_size,
            segment_len: args.segment_len,
            segment_count: args.segment_count,
            batch_size: args.batch_size,
            modality,
            phase,
            shuffle: !args.no_shuffle,
            seed: args.seed,
            trajectory_lead: args.trajectory_lead,
        };

        let manifest = match &args.manifest {
            Some(path) => Manifest::load(path)
                .with_context(|| format!("loading manifest {}", path.display()))?,
            None => {
                let min_frames = cfg.sampler_config().min_duration_frames();
                Manifest::from_records(synthetic_records(args.clips, min_frames))?
            }
        };

        let provider = Arc::new(SyntheticProvider::new(Duration::from_millis(
            args.decode_sleep_ms,
        )));
        let sink = Arc::new(BenchSink::new(Duration::from_millis(args.sink_sleep_ms)));

        let loader = SegmentLoader::with_manifest(cfg, manifest, provider.clone())?;
        let metrics = loader.metrics();
        let shape = loader.shape();
        info!(
            clips = loader.clip_count() as u64,
            batch = shape.batch as u64,
            channels = shape.channels as u64,
            height = shape.height as u64,
            width = shape.width as u64,
            mode = if args.pull { "pull" } else { "push" },
            "starting segment loader"
        );

        let metrics_task = if args.metrics_snapshot_interval_ms > 0 {
            let interval_ms = std::cmp::max(1, args.metrics_snapshot_interval_ms);
            let metrics = metrics.clone();
            let sink = sink.clone();
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
                loop {
                    ticker.tick().await;
                    emit_loader_metrics_snapshot(&metrics, &sink);
                }
            }))
        } else {
            None
        };

        let start = Instant::now();
        tokio::select! {
            res = run(loader, sink.clone(), args.steps, args.pull) => {
                res?;
            }
            _ = signal::ctrl_c() => {
                warn!("ctrl-c received; exiting");
            }
        }

        if let Some(task) = metrics_task {
            task.abort();
        }

        let elapsed = start.elapsed();
        emit_loader_metrics_snapshot(&metrics, &sink);

        let delivered_samples = sink.delivered_samples_total.get();
        let throughput = if elapsed.as_secs_f64() > 0.0 {
            delivered_samples as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        info!(
            elapsed_ms = elapsed.as_millis() as u64,
            delivered_samples = delivered_samples,
            decodes_total = provider.fetches_total.get(),
            leases_high_water = metrics.leases_outstanding_high_water.get(),
            samples_per_sec = throughput,
            "bench complete"
        );

        Ok(())
    }
    .instrument(span)
    .await
}
