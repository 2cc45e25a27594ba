//! Tracing/logging initialization.

use tracing_subscriber::{prelude::*, EnvFilter};

/// Installs a global `tracing` subscriber: JSON formatting with an
/// env-filter defaulting to `info`, overridable via `RUST_LOG`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().json().with_target(true);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

static TRACE_COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// A monotonically increasing id recorded on each reconcile span, used to
/// correlate the log lines emitted by a single reconcile pass.
pub fn get_trace_id() -> String {
    let n = TRACE_COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    format!("reconcile-{n:x}")
}
