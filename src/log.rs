//! Structured logging for debugging taskforge.
//!
//! Log levels:
//! - ERROR: Critical failures that prevent operations from completing
//! - WARN: Unexpected conditions that are recoverable (failed reclaims, lost writes)
//! - INFO: High-level lifecycle notifications (group/compare status, sweeps)
//! - DEBUG: Detailed operation traces (provisioning steps, retry decisions)
//! - TRACE: Very detailed traces (executor progress lines)
//!
//! Debug mode can be enabled with `--debug` flag or `TASKFORGE_DEBUG=1` env var.
//! `RUST_LOG` takes precedence over both when set.

use std::path::PathBuf;

use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "TASKFORGE_DEBUG";
const LOG_FILE: &str = "taskforge.log";

/// Initialize logging to ~/.taskforge/taskforge.log.
///
/// The returned guard flushes the background writer on drop, so keep it
/// alive for the lifetime of the process. Returns `None` when there is no
/// home directory to log into; logging is then disabled.
pub fn init_with_debug(debug: bool) -> Option<WorkerGuard> {
    let level = if debug || debug_from_env() {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let dir = log_dir()?;
    std::fs::create_dir_all(&dir).ok()?;
    // Truncate file on startup
    let _ = std::fs::write(dir.join(LOG_FILE), "");

    let appender = tracing_appender::rolling::never(&dir, LOG_FILE);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true);

    // A subscriber may already be installed (tests, embedding applications).
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .try_init();

    Some(guard)
}

/// Check if debug mode is requested through the environment.
pub fn debug_from_env() -> bool {
    std::env::var(DEBUG_ENV)
        .map(|v| parse_flag(&v))
        .unwrap_or(false)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true")
}

fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".taskforge"))
}
