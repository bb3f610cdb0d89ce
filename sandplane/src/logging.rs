//! File logging for the control plane.

use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use sandplane_shared::errors::{SandplaneError, SandplaneResult};

/// Keeps the non-blocking writer flushing for the life of the process.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install a daily-rolling file logger under `logs_dir`.
///
/// Level comes from `RUST_LOG` (default `info`). Only the first call installs
/// anything; later calls, and calls made when the host application already
/// set a global subscriber, are no-ops.
pub fn init_logging_for(logs_dir: &Path) -> SandplaneResult<()> {
    if LOG_GUARD.get().is_some() {
        return Ok(());
    }

    std::fs::create_dir_all(logs_dir).map_err(|e| {
        SandplaneError::Storage(format!(
            "Failed to create logs directory {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "sandplane.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
        .try_init();

    match installed {
        Ok(()) => {
            let _ = LOG_GUARD.set(guard);
            tracing::debug!(logs_dir = %logs_dir.display(), "Logging initialized");
        }
        Err(_) => {
            // Someone else owns the global subscriber; leave it alone.
        }
    }

    Ok(())
}
