//! OS signal translation.
//!
//! SIGTERM and SIGINT request a graceful exit; SIGUSR1 and SIGHUP request a
//! reload. A dedicated thread waits on the signal iterator and forwards each
//! request to a [`SignalTarget`], normally the reactor handle.

use std::io;
use std::thread::{self, JoinHandle};

use presence_core::ReactorHandle;
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM, SIGUSR1};
use signal_hook::iterator::{Handle, Signals};
use thiserror::Error;
use tracing::info;

const TARGET: &str = "presenced::signals";

/// Signals the daemon listens for.
pub const HANDLED_SIGNALS: [i32; 4] = [SIGTERM, SIGINT, SIGUSR1, SIGHUP];

/// Receiver of translated signal requests.
pub trait SignalTarget: Send + 'static {
    /// Stop the daemon.
    fn shutdown(&self);
    /// Reload configuration.
    fn reload(&self);
}

impl SignalTarget for ReactorHandle {
    fn shutdown(&self) {
        Self::shutdown(self);
    }

    fn reload(&self) {
        Self::reload(self);
    }
}

/// Abstract request carried by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalRequest {
    /// Graceful exit.
    Shutdown,
    /// Configuration reload.
    Reload,
}

/// Map a signal number to its request.
pub const fn request_for(signal: i32) -> Option<SignalRequest> {
    match signal {
        SIGTERM | SIGINT => Some(SignalRequest::Shutdown),
        SIGUSR1 | SIGHUP => Some(SignalRequest::Reload),
        _ => None,
    }
}

/// Errors reported by the signal listener.
#[derive(Debug, Error)]
pub enum SignalError {
    /// Installing signal handlers failed.
    #[error("failed to install signal handlers: {source}")]
    Install {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The listener thread could not be started.
    #[error("failed to start signal thread: {source}")]
    Spawn {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Running signal listener. Call [`SignalListener::close`] to stop it.
#[derive(Debug)]
pub struct SignalListener {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalListener {
    /// Install handlers for [`HANDLED_SIGNALS`] and start forwarding.
    ///
    /// # Errors
    ///
    /// Returns [`SignalError`] if the handlers or the thread cannot be set up.
    pub fn install(target: impl SignalTarget) -> Result<Self, SignalError> {
        let mut signals =
            Signals::new(HANDLED_SIGNALS).map_err(|source| SignalError::Install { source })?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("signals".into())
            .spawn(move || {
                for signal in signals.forever() {
                    match request_for(signal) {
                        Some(SignalRequest::Shutdown) => {
                            info!(target: TARGET, signal, "exit requested");
                            target.shutdown();
                        }
                        Some(SignalRequest::Reload) => {
                            info!(target: TARGET, signal, "reload requested");
                            target.reload();
                        }
                        None => {}
                    }
                }
            })
            .map_err(|source| SignalError::Spawn { source })?;
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    /// Stop listening and join the listener thread.
    pub fn close(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[derive(Clone, Default)]
    struct Counter {
        shutdowns: Arc<AtomicUsize>,
        reloads: Arc<AtomicUsize>,
    }

    impl SignalTarget for Counter {
        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }

        fn reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_signal_mapping() {
        assert_eq!(request_for(SIGTERM), Some(SignalRequest::Shutdown));
        assert_eq!(request_for(SIGINT), Some(SignalRequest::Shutdown));
        assert_eq!(request_for(SIGUSR1), Some(SignalRequest::Reload));
        assert_eq!(request_for(SIGHUP), Some(SignalRequest::Reload));
        assert_eq!(request_for(signal_hook::consts::signal::SIGQUIT), None);
    }

    #[test]
    fn test_reload_signal_reaches_target() {
        let counter = Counter::default();
        let listener = SignalListener::install(counter.clone()).unwrap();

        signal_hook::low_level::raise(SIGUSR1).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.reloads.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        listener.close();

        assert_eq!(counter.reloads.load(Ordering::SeqCst), 1);
        assert_eq!(counter.shutdowns.load(Ordering::SeqCst), 0);
    }
}
