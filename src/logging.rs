//! Tracing setup for `facesync-daemon`.
//!
//! Under systemd the daemon writes to the journal. Elsewhere it writes a
//! daily rolling `facesync.log` under `log_dir` from the config, or under
//! `<data_local_dir>/facesync/logs` when that is unset.
//!
//! Worker and scheduler events carry their own targets (`facesync::workers`,
//! `facesync::schedule`) so either can be turned up on its own.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding an `EnvFilter` directive, for example
/// `FACESYNC_LOG=facesync::workers=debug`.
pub const LOG_ENV: &str = "FACESYNC_LOG";

/// Our crate at `info`, dependencies only when they warn.
const DEFAULT_FILTER: &str = "warn,facesync=info";

const LOG_FILE_PREFIX: &str = "facesync.log";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber. Fails if one is already installed.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    #[cfg(target_os = "linux")]
    {
        if let Ok(journald) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(filter)
                .with(journald.with_syslog_identifier("facesync".to_string()))
                .try_init()?;
            tracing::info!("Logging to journald");
            return Ok(());
        }
    }

    let dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&dir)?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX));
    // The writer thread lives as long as the guard.
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true),
        )
        .try_init()?;

    tracing::info!(dir = %dir.display(), "Logging to rolling file");
    Ok(())
}

/// Log directory used when the config leaves `log_dir` unset.
pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("facesync")
        .join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_log_dir_is_namespaced() {
        let dir = default_log_dir();
        assert!(dir.ends_with("facesync/logs"));
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(DEFAULT_FILTER.parse::<EnvFilter>().is_ok());
    }
}
