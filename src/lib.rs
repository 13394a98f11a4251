//! Offline-first subsystem for the delivery driver terminal.
//!
//! Drivers work through coverage dead zones, so every mutating action
//! (delivery status changes, proof uploads, petty cash, location pings) is
//! either applied immediately or persisted to a local SQLite queue and
//! replayed in order once the dispatch server is reachable again. GPS
//! captures are validated for quality and mock-location suspicion before
//! they are embedded in any action payload.

use std::path::Path;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod actions;
pub mod api;
pub mod db;
pub mod error;
pub mod gps;
pub mod net;
pub mod queue;
pub mod storage;
pub mod sync;

pub use actions::{ActionOutcome, DriverActions};
pub use api::ApiClient;
pub use db::DbState;
pub use error::TerminalError;
pub use gps::{
    GpsError, GpsMetadata, GpsReading, PositionSource, QualityBand, ValidatedPosition,
};
pub use net::NetworkObserver;
pub use queue::{ActionType, OfflineQueue, QueueStatus, QueuedAction};
pub use storage::{KeyringVault, MemoryVault, SessionVault};
pub use sync::{DrainReport, SyncEngine};

/// Initialize structured logging (console + rolling daily file).
///
/// Call once at process start, before any subsystem is constructed. The
/// filter defaults to `info` globally and `debug` for this crate; override
/// with `RUST_LOG`.
pub fn init_logging(log_dir: &Path) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dispatch_terminal=debug"));

    std::fs::create_dir_all(log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(log_dir, "terminal");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Keep the guard alive for the lifetime of the app — dropping it flushes logs.
    // We leak it intentionally since the terminal runs until process exit.
    std::mem::forget(_guard);

    info!(
        "Starting dispatch terminal v{}",
        env!("CARGO_PKG_VERSION")
    );
}
