//! The presence reactor.
//!
//! [`Reactor::init`] builds every enabled probe; a transport that cannot start
//! is logged and left out while the others run. [`Reactor::run`] blocks the
//! calling thread in a single-threaded Tokio runtime that waits on:
//!
//! - the shutdown and reload requests from [`ReactorHandle`],
//! - the control channel's read readiness,
//! - the HTTP listener's accept,
//! - the Bluetooth probe's next inquiry event.
//!
//! Each wakeup handles one unit of work. After an inquiry cycle completes the
//! reactor runs the Bluetooth diff, expires stale devices and starts the next
//! cycle. Ping targets and the motion sensor run on their own threads and are
//! stopped through the shared cancellation token.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use tokio::net::TcpStream;
use tokio::runtime::{Builder, Runtime};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bluetooth::{BluetoothProbe, InquiryDriver, InquiryEvent};
use crate::config::Settings;
use crate::error::{PresenceError, Result};
use crate::handler::{Dispatcher, PresenceHandler};
use crate::http::{HttpError, HttpProbe};
use crate::motion::{MotionError, MotionProbe, MotionTrigger};
use crate::pipe::{ChannelError, ControlChannel};
use crate::ping;
use crate::types::Capabilities;

const TARGET: &str = "presence::reactor";

/// Cloneable handle for requesting shutdown or reload from any thread.
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    cancel: CancellationToken,
    reload: Arc<Notify>,
}

impl ReactorHandle {
    /// Ask the reactor and every probe thread to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Ask the reactor to log a reload request.
    pub fn reload(&self) {
        self.reload.notify_one();
    }

    /// Returns `true` once shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// What woke the event loop.
enum Wakeup {
    Shutdown,
    Reload,
    Pipe(std::io::Result<()>),
    Http(std::result::Result<(TcpStream, SocketAddr), HttpError>),
    Bluetooth(Option<InquiryEvent>),
}

/// Retry delay for a source whose readiness keeps failing. Doubles per
/// consecutive failure from [`Backoff::BASE`] up to [`Backoff::MAX`].
#[derive(Debug, Default)]
struct Backoff {
    failures: u32,
    resume_at: Option<Instant>,
}

impl Backoff {
    const BASE: Duration = Duration::from_millis(100);
    const MAX: Duration = Duration::from_secs(5);

    fn failed(&mut self, now: Instant) -> Duration {
        let delay = Self::BASE
            .saturating_mul(1 << self.failures.min(6))
            .min(Self::MAX);
        self.failures = self.failures.saturating_add(1);
        self.resume_at = Some(now + delay);
        delay
    }

    fn succeeded(&mut self) {
        self.failures = 0;
        self.resume_at = None;
    }

    const fn resume_at(&self) -> Option<Instant> {
        self.resume_at
    }
}

/// Probes driven by the reactor thread.
#[derive(Debug, Default)]
struct Probes {
    bluetooth: Option<BluetoothProbe>,
    http: Option<HttpProbe>,
    pipe: Option<ControlChannel>,
    ping_targets: usize,
    motion: bool,
    pipe_backoff: Backoff,
    http_backoff: Backoff,
}

impl Probes {
    async fn run(&mut self, cancel: &CancellationToken, reload: &Notify) {
        if let Some(bluetooth) = &mut self.bluetooth {
            bluetooth.start_inquiry();
        }
        tracing::info!(target: TARGET, "reactor running");

        loop {
            let wakeup = tokio::select! {
                biased;
                () = cancel.cancelled() => Wakeup::Shutdown,
                () = reload.notified() => Wakeup::Reload,
                ready = pipe_readable(self.pipe.as_ref(), self.pipe_backoff.resume_at()) => {
                    Wakeup::Pipe(ready)
                }
                accepted = http_accept(self.http.as_ref(), self.http_backoff.resume_at()) => {
                    Wakeup::Http(accepted)
                }
                event = inquiry_event(self.bluetooth.as_mut()) => Wakeup::Bluetooth(event),
            };

            match wakeup {
                Wakeup::Shutdown => break,
                Wakeup::Reload => self.log_snapshot().await,
                Wakeup::Pipe(ready) => self.process_pipe(ready),
                Wakeup::Http(accepted) => self.process_http(accepted).await,
                Wakeup::Bluetooth(event) => self.process_bluetooth(event),
            }
        }
        tracing::info!(target: TARGET, "reactor stopped");
    }

    fn process_pipe(&mut self, ready: std::io::Result<()>) {
        let result = ready
            .map_err(ChannelError::Read)
            .and_then(|()| self.pipe.as_mut().map_or(Ok(0), ControlChannel::process_event));
        match result {
            Ok(_) => self.pipe_backoff.succeeded(),
            Err(ChannelError::Read(err)) => {
                let delay = self.pipe_backoff.failed(Instant::now());
                tracing::warn!(
                    target: "presence::pipe",
                    error = %err,
                    retry_ms = delay.as_millis(),
                    "read failed"
                );
            }
            Err(err) => {
                log_unavailable(&PresenceError::from(err));
                if let Some(mut pipe) = self.pipe.take() {
                    pipe.close();
                }
            }
        }
    }

    async fn process_http(&mut self, accepted: std::result::Result<(TcpStream, SocketAddr), HttpError>) {
        let Some(http) = &self.http else {
            return;
        };
        let (stream, peer) = match accepted {
            Ok(accepted) => {
                self.http_backoff.succeeded();
                accepted
            }
            Err(err) => {
                let delay = self.http_backoff.failed(Instant::now());
                tracing::warn!(
                    target: "presence::http",
                    error = %err,
                    retry_ms = delay.as_millis(),
                    "accept failed"
                );
                return;
            }
        };
        if let Err(err) = http.serve(stream, peer).await {
            tracing::warn!(target: "presence::http", error = %err, "request failed");
        }
    }

    fn process_bluetooth(&mut self, event: Option<InquiryEvent>) {
        let Some(event) = event else {
            if self.bluetooth.take().is_some() {
                tracing::error!(target: "presence::bluetooth", "inquiry channel closed, Bluetooth disabled");
            }
            return;
        };
        let Some(bluetooth) = &mut self.bluetooth else {
            return;
        };
        let now = Utc::now();
        if bluetooth.process_event(event, now) {
            let expired = bluetooth.expire(now);
            if expired > 0 {
                tracing::debug!(target: "presence::bluetooth", expired, "expiry sweep");
            }
            bluetooth.start_inquiry();
        }
    }

    async fn log_snapshot(&self) {
        let (bluetooth, bluetooth_online) = self.bluetooth.as_ref().map_or((0, 0), |probe| {
            let registry = probe.registry();
            let online = registry
                .iter()
                .filter(|(_, device)| device.presence().is_online())
                .count();
            (registry.len(), online)
        });
        let http = match &self.http {
            Some(probe) => probe.state().devices().await.len(),
            None => 0,
        };
        tracing::info!(
            target: TARGET,
            bluetooth,
            bluetooth_online,
            http,
            ping = self.ping_targets,
            pipe = self.pipe.is_some(),
            motion = self.motion,
            "reload requested; running probes keep their configuration"
        );
    }
}

async fn pipe_readable(
    pipe: Option<&ControlChannel>,
    resume_at: Option<Instant>,
) -> std::io::Result<()> {
    let Some(pipe) = pipe else {
        return std::future::pending().await;
    };
    if let Some(at) = resume_at {
        tokio::time::sleep_until(at).await;
    }
    pipe.readable().await
}

async fn http_accept(
    http: Option<&HttpProbe>,
    resume_at: Option<Instant>,
) -> std::result::Result<(TcpStream, SocketAddr), HttpError> {
    let Some(http) = http else {
        return std::future::pending().await;
    };
    if let Some(at) = resume_at {
        tokio::time::sleep_until(at).await;
    }
    http.accept().await
}

async fn inquiry_event(bluetooth: Option<&mut BluetoothProbe>) -> Option<InquiryEvent> {
    match bluetooth {
        Some(bluetooth) => bluetooth.next_event().await,
        None => std::future::pending().await,
    }
}

fn log_unavailable(err: &PresenceError) {
    tracing::error!(
        target: TARGET,
        transport = err.transport().map(|t| t.as_str()),
        code = err.error_code(),
        error = %err,
        "transport disabled"
    );
}

/// Owns the runtime, the probes and the probe threads.
pub struct Reactor {
    runtime: Runtime,
    probes: Probes,
    cancel: CancellationToken,
    reload: Arc<Notify>,
    motion_trigger: Option<MotionTrigger>,
    #[cfg(feature = "gpio")]
    motion_pin: Option<crate::motion::gpio::MotionPin>,
    threads: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("probes", &self.probes)
            .field("threads", &self.threads.len())
            .finish_non_exhaustive()
    }
}

impl Reactor {
    /// Build every enabled probe with the default Bluetooth backend.
    ///
    /// # Errors
    ///
    /// Returns an error only if the runtime cannot be created; unavailable
    /// transports are logged and skipped.
    pub fn init(
        settings: &Settings,
        capabilities: Capabilities,
        handler: Arc<dyn PresenceHandler>,
    ) -> Result<Self> {
        Self::init_with(settings, capabilities, handler, None)
    }

    /// Like [`Reactor::init`], with an explicit inquiry driver.
    ///
    /// # Errors
    ///
    /// Returns an error only if the runtime cannot be created.
    pub fn init_with(
        settings: &Settings,
        capabilities: Capabilities,
        handler: Arc<dyn PresenceHandler>,
        driver: Option<Box<dyn InquiryDriver>>,
    ) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let dispatcher = Dispatcher::new(handler);
        let cancel = CancellationToken::new();
        let mut reactor = Self {
            runtime,
            probes: Probes::default(),
            cancel,
            reload: Arc::new(Notify::new()),
            motion_trigger: None,
            #[cfg(feature = "gpio")]
            motion_pin: None,
            threads: Vec::new(),
        };

        tracing::info!(target: TARGET, ?capabilities, "initializing probes");
        if settings.bluetooth.enabled {
            reactor.init_bluetooth(settings, &dispatcher, driver);
        }
        if settings.http.enabled {
            reactor.init_http(settings, &dispatcher);
        }
        if settings.pipe.enabled {
            reactor.init_pipe(settings, &dispatcher);
        }
        if settings.ping.enabled {
            reactor.init_ping(settings, capabilities, &dispatcher);
        }
        if settings.motion.enabled {
            if let Err(err) = reactor.init_motion(settings, capabilities, &dispatcher) {
                log_unavailable(&err.into());
            }
        }
        Ok(reactor)
    }

    fn init_bluetooth(
        &mut self,
        settings: &Settings,
        dispatcher: &Dispatcher,
        driver: Option<Box<dyn InquiryDriver>>,
    ) {
        let driver = match driver {
            Some(driver) => Ok(driver),
            None => self.runtime.block_on(default_driver(settings)),
        };
        match driver {
            Ok(driver) => {
                self.probes.bluetooth = Some(BluetoothProbe::new(
                    driver,
                    &settings.bluetooth,
                    &settings.devices,
                    dispatcher.clone(),
                ));
            }
            Err(err) => log_unavailable(&err.into()),
        }
    }

    fn init_http(&mut self, settings: &Settings, dispatcher: &Dispatcher) {
        let bound = self.runtime.block_on(HttpProbe::bind(
            &settings.http,
            &settings.devices,
            dispatcher.clone(),
        ));
        match bound {
            Ok(probe) => self.probes.http = Some(probe),
            Err(err) => log_unavailable(&err.into()),
        }
    }

    fn init_pipe(&mut self, settings: &Settings, dispatcher: &Dispatcher) {
        let _guard = self.runtime.enter();
        match ControlChannel::open(&settings.pipe.path, dispatcher.clone()) {
            Ok(channel) => self.probes.pipe = Some(channel),
            Err(err) => log_unavailable(&err.into()),
        }
    }

    fn init_ping(&mut self, settings: &Settings, capabilities: Capabilities, dispatcher: &Dispatcher) {
        let targets = ping::resolve_targets(&settings.ping, &settings.devices);
        self.probes.ping_targets = ping::spawn(
            targets,
            &settings.ping,
            capabilities,
            dispatcher,
            &self.cancel,
            &mut self.threads,
        );
        tracing::info!(target: "presence::ping", targets = self.probes.ping_targets, "ping probe started");
    }

    fn init_motion(
        &mut self,
        settings: &Settings,
        capabilities: Capabilities,
        dispatcher: &Dispatcher,
    ) -> std::result::Result<(), MotionError> {
        if !capabilities.motion_sensor {
            return Err(MotionError::Unsupported);
        }
        let pin = cfg!(feature = "gpio").then_some(settings.motion.gpio);
        let (probe, trigger) =
            MotionProbe::new(&settings.motion, pin, dispatcher.clone(), self.cancel.clone());

        #[cfg(feature = "gpio")]
        {
            self.motion_pin = Some(crate::motion::gpio::MotionPin::watch(
                settings.motion.gpio,
                trigger.clone(),
            )?);
        }

        self.threads.push(probe.spawn()?);
        self.motion_trigger = Some(trigger);
        self.probes.motion = true;
        Ok(())
    }

    /// Run the event loop until shutdown is requested, then release every
    /// resource.
    ///
    /// # Errors
    ///
    /// Currently infallible once initialized; the signature leaves room for
    /// fatal loop errors.
    pub fn run(&mut self) -> Result<()> {
        let Self {
            runtime,
            probes,
            cancel,
            reload,
            ..
        } = self;
        runtime.block_on(probes.run(cancel, reload));
        self.shutdown();
        Ok(())
    }

    /// Stop all probes and release their resources. Idempotent.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        let _guard = self.runtime.enter();

        if let Some(mut pipe) = self.probes.pipe.take() {
            pipe.close();
        }
        if self.probes.http.take().is_some() {
            tracing::info!(target: "presence::http", "listener closed");
        }
        self.probes.bluetooth = None;
        #[cfg(feature = "gpio")]
        {
            self.motion_pin = None;
        }
        self.motion_trigger = None;

        if !self.threads.is_empty() {
            tracing::info!(target: TARGET, threads = self.threads.len(), "waiting for probe threads");
        }
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("probe").to_string();
            if handle.join().is_err() {
                tracing::warn!(target: TARGET, thread = %name, "probe thread panicked");
            }
        }
    }

    /// Handle for requesting shutdown or reload.
    pub fn handle(&self) -> ReactorHandle {
        ReactorHandle {
            cancel: self.cancel.clone(),
            reload: Arc::clone(&self.reload),
        }
    }

    /// Trigger for the motion probe, when it runs.
    pub fn motion_trigger(&self) -> Option<MotionTrigger> {
        self.motion_trigger.clone()
    }

    /// Local address of the HTTP listener, when it runs.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.probes.http.as_ref().and_then(|http| http.local_addr().ok())
    }

    /// Path of the control channel, when it runs.
    pub fn pipe_path(&self) -> Option<PathBuf> {
        self.probes.pipe.as_ref().map(|pipe| pipe.path().to_path_buf())
    }

    /// Returns `true` when the Bluetooth probe runs.
    pub const fn bluetooth_enabled(&self) -> bool {
        self.probes.bluetooth.is_some()
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(feature = "bluetooth")]
async fn default_driver(
    settings: &Settings,
) -> std::result::Result<Box<dyn InquiryDriver>, crate::bluetooth::BluetoothError> {
    let driver =
        crate::bluetooth::bluez::BluezInquirer::connect(settings.bluetooth.inquiry_window()).await?;
    Ok(Box::new(driver))
}

#[cfg(not(feature = "bluetooth"))]
async fn default_driver(
    _settings: &Settings,
) -> std::result::Result<Box<dyn InquiryDriver>, crate::bluetooth::BluetoothError> {
    Err(crate::bluetooth::BluetoothError::Unsupported)
}
