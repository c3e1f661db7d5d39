use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `SEGFEED_LOG` first, then `RUST_LOG`, then a default.
///
/// Log field contract for loader events:
/// - Include `clip` (the manifest path) on any per-clip event such as a decode skip.
/// - Include `epoch` on wraparound and reshuffle events.
/// - Include `phase` and `modality` once per run, on the setup event.
pub fn init_tracing() {
    let filter = env_filter();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("SEGFEED_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
