//! Logging initialization and configuration.
//!
//! This module provides environment-aware logging setup:
//! - **Production**: JSON logs to rolling files + compact logs to stdout
//! - **Development**: Pretty logs to stdout

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Static guards to keep non-blocking writers alive for the whole process.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static STDOUT_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Environment variable holding the daemon log level.
pub const LOG_LEVEL_ENV: &str = "PRESENCED_LOG_LEVEL";

/// Initialize the logging system.
///
/// The filter comes from `RUST_LOG` when set, otherwise from the first of
/// `PRESENCED_LOG_LEVEL`, `cli_level` and `info`.
///
/// # Production Mode
///
/// - Daily rolling JSON files named `presenced` in `log_dir`, or in the
///   platform data directory when `log_dir` cannot be created
/// - Compact stdout without ANSI colors for the journal
///
/// # Errors
///
/// Returns an error if the filter cannot be parsed or a subscriber is
/// already installed.
pub fn init(is_production: bool, cli_level: Option<&str>, log_dir: &Path) -> anyhow::Result<()> {
    let log_level = resolve_level(std::env::var(LOG_LEVEL_ENV).ok(), cli_level);
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    if is_production {
        init_production(env_filter, log_dir)?;
    } else {
        init_development(env_filter)?;
    }
    Ok(())
}

fn resolve_level(env_level: Option<String>, cli_level: Option<&str>) -> String {
    env_level
        .filter(|level| !level.trim().is_empty())
        .or_else(|| cli_level.map(str::to_string))
        .unwrap_or_else(|| "info".to_string())
}

fn init_production(env_filter: EnvFilter, log_dir: &Path) -> anyhow::Result<()> {
    let log_dir = writable_log_directory(log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "presenced");
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_stdout)
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()?;

    let _ = FILE_GUARD.set(file_guard);
    let _ = STDOUT_GUARD.set(stdout_guard);
    Ok(())
}

fn writable_log_directory(preferred: &Path) -> anyhow::Result<PathBuf> {
    match std::fs::create_dir_all(preferred) {
        Ok(()) => Ok(preferred.to_path_buf()),
        Err(err) => {
            let Some(fallback) = fallback_log_directory() else {
                return Err(err.into());
            };
            std::fs::create_dir_all(&fallback)?;
            Ok(fallback)
        }
    }
}

/// Platform data directory for logs, e.g. `~/.local/share/presenced/log`.
fn fallback_log_directory() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "presenced").map(|dirs| dirs.data_dir().join("log"))
}

fn init_development(env_filter: EnvFilter) -> anyhow::Result<()> {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_precedence() {
        assert_eq!(resolve_level(Some("warn".into()), Some("debug")), "warn");
        assert_eq!(resolve_level(None, Some("debug")), "debug");
        assert_eq!(resolve_level(Some("  ".into()), None), "info");
        assert_eq!(resolve_level(None, None), "info");
    }

    #[test]
    fn test_log_directory_is_created() {
        let root = tempfile::tempdir().unwrap();
        let log_dir = root.path().join("log");

        let resolved = writable_log_directory(&log_dir).unwrap();

        assert_eq!(resolved, log_dir);
        assert!(log_dir.is_dir());
    }
}
