//! Daemon startup and lifecycle.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use presence_core::{PresenceError, Reactor, Settings};
use tracing::info;

use crate::capability;
use crate::cli::Cli;
use crate::handler::LoggingHandler;
use crate::logging;
use crate::signals::SignalListener;

const TARGET: &str = "presenced";

/// Run the daemon until a shutdown signal arrives.
///
/// # Errors
///
/// Fails on an invalid root directory, logging setup, configuration errors,
/// runtime creation or signal installation. Unavailable transports are
/// logged by the reactor and are not errors here.
pub fn run(cli: &Cli) -> anyhow::Result<()> {
    // Resolve before leaving the invocation directory.
    let explicit = cli.config.as_deref().map(absolute).transpose()?;
    let root = cli.root_dir();
    let root = enter_root(&root)?;

    logging::init(cli.production, cli.log_level.as_deref(), &root.join("log"))?;
    info!(
        target: TARGET,
        version = env!("CARGO_PKG_VERSION"),
        root = %root.display(),
        "initializing presence daemon"
    );

    let files = cli.config_files(&root, explicit);
    let settings = Settings::load(&files, &root)
        .map_err(PresenceError::from)
        .context("configuration rejected")?;
    info!(
        target: TARGET,
        files = files.len(),
        known_devices = settings.devices.len(),
        "configuration loaded"
    );

    let capabilities = capability::detect();
    info!(
        target: TARGET,
        privileged = capabilities.privileged,
        motion_sensor = capabilities.motion_sensor,
        "capabilities detected"
    );

    let mut reactor = Reactor::init(&settings, capabilities, Arc::new(LoggingHandler))?;
    let signals = SignalListener::install(reactor.handle())?;

    let outcome = reactor.run();
    signals.close();
    outcome?;

    info!(target: TARGET, "presence daemon stopped");
    Ok(())
}

/// Check that `root` is a directory and make it the working directory.
///
/// # Errors
///
/// Returns [`PresenceError::InvalidRoot`] if `root` is missing, not a
/// directory, or cannot be entered.
pub fn enter_root(root: &Path) -> Result<PathBuf, PresenceError> {
    if !root.is_dir() {
        return Err(PresenceError::InvalidRoot(root.to_path_buf()));
    }
    let root = root
        .canonicalize()
        .map_err(|_| PresenceError::InvalidRoot(root.to_path_buf()))?;
    std::env::set_current_dir(&root).map_err(|_| PresenceError::InvalidRoot(root.clone()))?;
    Ok(root)
}

fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent");

        let err = enter_root(&missing).unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(err.error_code(), "INVALID_ROOT");
    }

    #[test]
    fn test_file_root_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            enter_root(file.path()),
            Err(PresenceError::InvalidRoot(_))
        ));
    }

    #[test]
    fn test_run_fails_before_logging_on_bad_root() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            root: Some(dir.path().join("absent")),
            ..Cli::default()
        };
        let err = run(&cli).unwrap_err();
        assert!(err.downcast_ref::<PresenceError>().is_some());
    }

    #[test]
    fn test_absolute_keeps_absolute_paths() {
        assert_eq!(
            absolute(Path::new("/etc/presenced.toml")).unwrap(),
            PathBuf::from("/etc/presenced.toml")
        );
        assert!(absolute(Path::new("extra.toml")).unwrap().is_absolute());
    }
}
