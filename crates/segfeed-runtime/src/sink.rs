use anyhow::Result;

use crate::pipeline::BatchLease;

/// Delivery interface for push-mode runs.
///
/// This is intentionally synchronous. Delivery borrows the lease, and the
/// buffer is only recycled to the filler afterwards, so a slow sink exerts
/// backpressure through the two-buffer pool instead of letting batches pile
/// up.
pub trait Sink: Send + Sync + 'static {
    fn deliver(&self, batch: &BatchLease) -> Result<()>;
}
