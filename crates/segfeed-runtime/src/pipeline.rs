use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::mpsc;

use segfeed_core::manifest::Manifest;
use segfeed_core::sampler::{sampler_for, SegmentSampler};
use segfeed_observe::metrics::{Counter, DurationAgg, Gauge, ScopedTimer};

use crate::provider::{FrameProvider, FrameRequest};
use crate::sink::Sink;
use crate::types::{BatchBuf, BatchShape, LoaderConfig};

/// Buffers cycling between filler and consumer. Two is true double
/// buffering: one filling while the other is read.
const BATCH_BUFFERS: usize = 2;

/// Salt separating the offset RNG stream from the shuffle stream, both
/// derived from the one configured seed.
const OFFSET_STREAM_SALT: u64 = 0x9e37_79b9_7f4a_7c15;

#[derive(Debug, Default)]
pub struct LoaderMetrics {
    pub batches_filled_total: Counter,
    pub samples_filled_total: Counter,
    pub batches_delivered_total: Counter,
    pub clips_skipped_total: Counter,
    pub short_clips_dropped_total: Counter,
    pub epochs_completed_total: Counter,
    pub leases_outstanding: Gauge,
    pub leases_outstanding_high_water: Gauge,
    pub fill_time: DurationAgg,
    pub consumer_wait: DurationAgg,
}

/// The consumer's exclusive handle on one filled batch.
///
/// Pixels are shaped `(batch, channels, height, width)` with `labels`
/// parallel along the batch axis. Dropping the lease returns the buffer to
/// the filler, which makes it the next filling target.
#[derive(Debug)]
pub struct BatchLease {
    buf: Option<BatchBuf>,
    shape: BatchShape,
    recycle: mpsc::Sender<BatchBuf>,
    metrics: Arc<LoaderMetrics>,
}

impl BatchLease {
    pub fn pixels(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf.pixels,
            None => &[],
        }
    }

    pub fn labels(&self) -> &[u64] {
        match &self.buf {
            Some(buf) => &buf.labels,
            None => &[],
        }
    }

    pub fn shape(&self) -> BatchShape {
        self.shape
    }

    pub fn sample_count(&self) -> usize {
        self.shape.batch
    }
}

impl Drop for BatchLease {
    fn drop(&mut self) {
        self.metrics.leases_outstanding.sub(1);
        if let Some(buf) = self.buf.take() {
            // The pool has a slot for every minted buffer; the send only
            // fails once the filler is gone, and then the buffer just dies.
            let _ = self.recycle.try_send(buf);
        }
    }
}

/// Manifest-driven segment loader.
///
/// Owns the manifest, the wrap-around cursor, and both RNG streams; after
/// [`SegmentLoader::spawn`] all of that state moves into the background
/// filler task and the consumer talks to it only through the returned
/// [`BatchStream`].
pub struct SegmentLoader {
    cfg: LoaderConfig,
    shape: BatchShape,
    manifest: Manifest,
    sampler: Box<dyn SegmentSampler>,
    provider: Arc<dyn FrameProvider>,
    shuffle_rng: StdRng,
    offset_rng: StdRng,
    cursor: usize,
    epoch: u64,
    metrics: Arc<LoaderMetrics>,
}

impl SegmentLoader {
    /// Loads the manifest named by `cfg.source` and builds the loader.
    /// Any malformed manifest line is fatal here; no partial index is kept.
    pub fn new(cfg: LoaderConfig, provider: Arc<dyn FrameProvider>) -> Result<Self> {
        let manifest = Manifest::load(&cfg.source)
            .with_context(|| format!("loading manifest {}", cfg.source.display()))?;
        Self::with_manifest(cfg, manifest, provider)
    }

    /// Builds a loader from an already-parsed manifest (synthetic runs,
    /// tests). Clips too short for the sampling geometry are dropped here,
    /// counted, and logged; an emptied manifest is fatal.
    pub fn with_manifest(
        cfg: LoaderConfig,
        mut manifest: Manifest,
        provider: Arc<dyn FrameProvider>,
    ) -> Result<Self> {
        cfg.validate()?;
        let shape = cfg.batch_shape()?;
        let sampler = sampler_for(cfg.phase, cfg.sampler_config())?;
        let metrics = Arc::new(LoaderMetrics::default());

        let min_frames = cfg.sampler_config().min_duration_frames();
        let dropped = manifest.retain_min_duration(min_frames);
        if dropped > 0 {
            metrics.short_clips_dropped_total.inc_by(dropped as u64);
            tracing::warn!(
                target: "segfeed_loader",
                event = "short_clips_dropped",
                dropped = dropped as u64,
                min_frames = min_frames,
                "dropped clips shorter than the sampling geometry"
            );
        }
        anyhow::ensure!(
            !manifest.is_empty(),
            "no usable clips: every manifest entry is shorter than {min_frames} frames"
        );

        let mut shuffle_rng = StdRng::seed_from_u64(cfg.seed);
        let offset_rng = StdRng::seed_from_u64(cfg.seed ^ OFFSET_STREAM_SALT);
        if cfg.shuffle {
            manifest.shuffle(&mut shuffle_rng);
        }

        tracing::info!(
            target: "segfeed_loader",
            event = "loader_ready",
            clips = manifest.len() as u64,
            batch = shape.batch as u64,
            channels = shape.channels as u64,
            height = shape.height as u64,
            width = shape.width as u64,
            phase = %cfg.phase,
            modality = %cfg.modality,
            shuffle = cfg.shuffle,
            seed = cfg.seed,
            "segment loader ready"
        );

        Ok(Self {
            cfg,
            shape,
            manifest,
            sampler,
            provider,
            shuffle_rng,
            offset_rng,
            cursor: 0,
            epoch: 0,
            metrics,
        })
    }

    pub fn metrics(&self) -> Arc<LoaderMetrics> {
        self.metrics.clone()
    }

    pub fn shape(&self) -> BatchShape {
        self.shape
    }

    /// Clips surviving the short-clip filter.
    pub fn clip_count(&self) -> usize {
        self.manifest.len()
    }

    /// Spawns the background filler and hands back the consumer's stream.
    ///
    /// Filling is eager: as soon as one buffer is handed off, the filler
    /// starts on the other. The consumer blocks in [`BatchStream::next`]
    /// only when it outruns the filler.
    pub fn spawn(self) -> Result<BatchStream> {
        let metrics = self.metrics.clone();
        let batch_bytes = self.shape.batch_bytes()?;
        let batch = self.shape.batch;

        let (batch_tx, batch_rx) = mpsc::channel::<BatchLease>(1);
        let (recycle_tx, recycle_rx) = mpsc::channel::<BatchBuf>(BATCH_BUFFERS);
        for _ in 0..BATCH_BUFFERS {
            anyhow::ensure!(
                recycle_tx.try_send(BatchBuf::zeroed(batch_bytes, batch)).is_ok(),
                "batch buffer pool failed to seed"
            );
        }

        let task = tokio::spawn(self.produce(batch_tx, recycle_tx, recycle_rx));
        Ok(BatchStream {
            rx: batch_rx,
            task: Some(task),
            metrics,
        })
    }

    /// Fills and delivers exactly `steps` batches to `sink`, then shuts the
    /// filler down.
    ///
    /// Delivery runs on a blocking task while the filler works on the other
    /// buffer, so decode and delivery overlap; the buffer is recycled only
    /// after `deliver` returns.
    pub async fn run_steps<S: Sink>(self, sink: Arc<S>, steps: u64) -> Result<()> {
        let metrics = self.metrics.clone();
        let mut stream = self.spawn()?;
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
            metrics.batches_delivered_total.inc();
            drop(lease);
        }
        stream.shutdown().await
    }

    async fn produce(
        mut self,
        batch_tx: mpsc::Sender<BatchLease>,
        recycle_tx: mpsc::Sender<BatchBuf>,
        mut recycle_rx: mpsc::Receiver<BatchBuf>,
    ) -> Result<()> {
        loop {
            // With both buffers out as leases, only the closed handoff can
            // wake the filler; shutdown must not depend on lease drops.
            let mut buf = tokio::select! {
                returned = recycle_rx.recv() => match returned {
                    Some(buf) => buf,
                    None => break,
                },
                _ = batch_tx.closed() => break,
            };
            if batch_tx.is_closed() {
                break;
            }
            self.fill(&mut buf).await?;

            let outstanding = self.metrics.leases_outstanding.add(1);
            self.metrics.leases_outstanding_high_water.max(outstanding);
            let lease = BatchLease {
                buf: Some(buf),
                shape: self.shape,
                recycle: recycle_tx.clone(),
                metrics: self.metrics.clone(),
            };
            if batch_tx.send(lease).await.is_err() {
                break;
            }
        }

        tracing::info!(
            target: "segfeed_loader",
            event = "producer_exit",
            batches_filled = self.metrics.batches_filled_total.get(),
            epochs_completed = self.metrics.epochs_completed_total.get(),
            "segment filler exiting"
        );
        Ok(())
    }

    /// Fills every slot of `buf`, advancing the cursor per attempt.
    ///
    /// A recoverable decode failure skips the clip and retries the same slot
    /// with the next cursor position, so a completed fill always carries
    /// `batch_size` samples. A full manifest cycle of consecutive failures
    /// aborts the fill instead of spinning.
    async fn fill(&mut self, buf: &mut BatchBuf) -> Result<()> {
        let metrics = self.metrics.clone();
        let _timer = ScopedTimer::new(&metrics.fill_time);
        let sample_bytes = self.shape.sample_bytes()?;

        for slot in 0..self.shape.batch {
            let mut failures = 0usize;
            loop {
                let record = self
                    .manifest
                    .get(self.cursor)
                    .ok_or_else(|| anyhow::anyhow!("cursor {} out of bounds", self.cursor))?
                    .clone();

                let plan = self
                    .sampler
                    .plan(record.duration_frames, &mut self.offset_rng)?;
                let request = FrameRequest {
                    clip_path: record.path.clone(),
                    offsets: plan.offsets,
                    segment_len: self.cfg.segment_len,
                    height: self.shape.height as u32,
                    width: self.shape.width as u32,
                    modality: self.cfg.modality,
                    frame_root: self.cfg.frame_root.clone(),
                    tube_root: self.cfg.tube_root.clone(),
                };

                let provider = self.provider.clone();
                let block = tokio::task::spawn_blocking(move || provider.fetch(&request))
                    .await
                    .map_err(anyhow::Error::from)?
                    .with_context(|| format!("decoding clip {}", record.path))?;

                self.advance_cursor();

                match block {
                    Some(block) => {
                        anyhow::ensure!(
                            block.bytes.len() == sample_bytes,
                            "clip {} decoded to {} bytes, expected {} for shape {:?}",
                            record.path,
                            block.bytes.len(),
                            sample_bytes,
                            self.shape
                        );
                        let start = slot * sample_bytes;
                        buf.pixels[start..start + sample_bytes].copy_from_slice(&block.bytes);
                        buf.labels[slot] = record.label;
                        break;
                    }
                    None => {
                        failures += 1;
                        self.metrics.clips_skipped_total.inc();
                        tracing::warn!(
                            target: "segfeed_loader",
                            event = "clip_skipped",
                            clip = %record.path,
                            "decode failed; retrying slot with next clip"
                        );
                        anyhow::ensure!(
                            failures < self.manifest.len(),
                            "every clip failed to decode within one manifest cycle \
                             ({failures} consecutive failures)"
                        );
                    }
                }
            }
        }

        self.metrics.batches_filled_total.inc();
        self.metrics
            .samples_filled_total
            .inc_by(self.shape.batch as u64);
        tracing::debug!(
            target: "segfeed_loader",
            event = "fill_completed",
            batch = self.metrics.batches_filled_total.get(),
            epoch = self.epoch,
            "batch buffer filled"
        );
        Ok(())
    }

    fn advance_cursor(&mut self) {
        self.cursor += 1;
        if self.cursor >= self.manifest.len() {
            self.cursor = 0;
            self.epoch += 1;
            self.metrics.epochs_completed_total.inc();
            if self.cfg.shuffle {
                self.manifest.shuffle(&mut self.shuffle_rng);
            }
            tracing::info!(
                target: "segfeed_loader",
                event = "epoch_wrapped",
                epoch = self.epoch,
                reshuffled = self.cfg.shuffle,
                "manifest cursor wrapped"
            );
        }
    }
}

/// Consumer side of a spawned loader.
pub struct BatchStream {
    rx: mpsc::Receiver<BatchLease>,
    task: Option<tokio::task::JoinHandle<Result<()>>>,
    metrics: Arc<LoaderMetrics>,
}

impl BatchStream {
    /// Waits for the next filled batch.
    ///
    /// Returns `Ok(None)` only after an orderly shutdown. If the filler
    /// crashed, the request that observes the closed handoff joins the task
    /// and surfaces its error here instead of swallowing it.
    pub async fn next(&mut self) -> Result<Option<BatchLease>> {
        let started = Instant::now();
        let lease = self.rx.recv().await;
        self.metrics.consumer_wait.record(started.elapsed());
        match lease {
            Some(lease) => Ok(Some(lease)),
            None => {
                let Some(task) = self.task.take() else {
                    return Ok(None);
                };
                task.await.map_err(anyhow::Error::from)??;
                Ok(None)
            }
        }
    }

    /// Stops the filler and waits for it: closes the handoff, drains any
    /// batch already in flight, then joins the task. Leases still held by
    /// the caller keep their buffers; the filler sees the closed handoff
    /// and exits without waiting for them.
    pub async fn shutdown(mut self) -> Result<()> {
        self.rx.close();
        while self.rx.recv().await.is_some() {}
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        task.await.map_err(anyhow::Error::from)??;
        Ok(())
    }

    /// Hard-stops the filler without waiting for the in-flight fill.
    pub fn abort(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
