//! PIR motion probe.
//!
//! [`MotionDetector`] is the debounce and idle-countdown state machine.
//! [`MotionProbe`] runs it on its own thread, ticking once per tick period and
//! taking edge signals from [`MotionTrigger`] handles. A hardware pin (feature
//! `gpio`) is just another trigger source, so detector state is only ever
//! touched by the motion thread.

#[cfg(feature = "gpio")]
pub mod gpio;

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::MotionSettings;
use crate::handler::{Dispatcher, MotionEvent};

const TARGET: &str = "presence::motion";

/// Motion probe errors.
#[derive(Debug, Error)]
pub enum MotionError {
    /// No sensor can be attached on this machine.
    #[error("motion sensor not available on this platform")]
    Unsupported,

    /// The GPIO pin could not be configured.
    #[error("GPIO {pin} unavailable: {message}")]
    Gpio {
        /// BCM pin number.
        pin: u8,
        /// Driver message.
        message: String,
    },

    /// The motion thread could not be started.
    #[error("cannot start motion thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Output of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionSignal {
    /// Motion started.
    Motion,
    /// No motion for the whole timeout.
    Idle,
}

/// Debounce and idle-timeout state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MotionDetector {
    timeout: u32,
    countdown: u32,
    active: Option<bool>,
}

impl MotionDetector {
    /// Detector counting down `timeout` ticks. Starts in the unknown state.
    pub fn new(timeout: u32) -> Self {
        let timeout = timeout.max(1);
        Self {
            timeout,
            countdown: timeout,
            active: None,
        }
    }

    /// `Some(true)` while motion is active, `None` before the first event.
    pub const fn active(&self) -> Option<bool> {
        self.active
    }

    /// Ticks left until idle.
    pub const fn countdown(&self) -> u32 {
        self.countdown
    }

    /// The sensor pin was asserted.
    pub fn assert_edge(&mut self) -> Option<MotionSignal> {
        self.countdown = self.timeout;
        if self.active == Some(true) {
            return None;
        }
        self.active = Some(true);
        Some(MotionSignal::Motion)
    }

    /// One tick elapsed.
    pub fn tick(&mut self) -> Option<MotionSignal> {
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown > 0 {
            return None;
        }
        self.countdown = self.timeout;
        if self.active == Some(false) {
            return None;
        }
        self.active = Some(false);
        Some(MotionSignal::Idle)
    }
}

/// Handle that asserts the motion edge from any thread.
#[derive(Debug, Clone)]
pub struct MotionTrigger {
    sender: Sender<()>,
}

impl MotionTrigger {
    /// Assert the edge. Returns `false` once the probe has stopped.
    pub fn trigger(&self) -> bool {
        self.sender.send(()).is_ok()
    }
}

/// The motion polling task.
pub struct MotionProbe {
    detector: MotionDetector,
    edges: Receiver<()>,
    tick: Duration,
    pin: Option<u8>,
    timeout: Duration,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
}

impl MotionProbe {
    /// Tick period in production.
    pub const TICK: Duration = Duration::from_secs(1);

    /// Create a probe and its trigger handle.
    pub fn new(
        settings: &MotionSettings,
        pin: Option<u8>,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
    ) -> (Self, MotionTrigger) {
        Self::with_tick(settings, pin, Self::TICK, dispatcher, cancel)
    }

    /// Like [`MotionProbe::new`] with a custom tick period.
    pub fn with_tick(
        settings: &MotionSettings,
        pin: Option<u8>,
        tick: Duration,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
    ) -> (Self, MotionTrigger) {
        let (sender, edges) = mpsc::channel();
        let probe = Self {
            detector: MotionDetector::new(settings.timeout),
            edges,
            tick,
            pin,
            timeout: Duration::from_secs(u64::from(settings.timeout)),
            dispatcher,
            cancel,
        };
        (probe, MotionTrigger { sender })
    }

    /// Start the probe on its own thread.
    ///
    /// # Errors
    ///
    /// Returns [`MotionError::Spawn`] if the thread cannot be created.
    pub fn spawn(self) -> Result<JoinHandle<()>, MotionError> {
        thread::Builder::new()
            .name("motion".to_string())
            .spawn(move || self.run())
            .map_err(MotionError::Spawn)
    }

    /// Tick and handle edges until cancelled.
    pub fn run(mut self) {
        tracing::info!(
            target: TARGET,
            timeout_secs = self.timeout.as_secs(),
            "motion detection started"
        );
        let mut next_tick = Instant::now() + self.tick;
        while !self.cancel.is_cancelled() {
            let wait = next_tick.saturating_duration_since(Instant::now());
            match self.edges.recv_timeout(wait) {
                Ok(()) => {
                    if let Some(signal) = self.detector.assert_edge() {
                        self.fire(signal);
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    next_tick += self.tick;
                    if let Some(signal) = self.detector.tick() {
                        self.fire(signal);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    thread::sleep(wait);
                    next_tick += self.tick;
                    if let Some(signal) = self.detector.tick() {
                        self.fire(signal);
                    }
                }
            }
        }
        tracing::info!(target: TARGET, "motion detection stopped");
    }

    fn fire(&self, signal: MotionSignal) {
        let event = MotionEvent {
            pin: self.pin,
            timeout: self.timeout,
            at: Utc::now(),
        };
        match signal {
            MotionSignal::Motion => self.dispatcher.motion(&event),
            MotionSignal::Idle => self.dispatcher.idle(&event),
        }
    }
}
