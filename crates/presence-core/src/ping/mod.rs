//! Ping probe.
//!
//! Every configured target gets its own thread running a [`PingTask`]. The
//! task owns its [`Device`] and its [`Pinger`]; nothing else touches either.
//! Each cycle re-resolves host-name targets, runs one check with retries,
//! feeds the reading to the device state machine and sleeps for the target's
//! interval. The cancellation token is polled while sleeping.
//!
//! Two pinger implementations exist:
//!
//! - [`IcmpPinger`]: raw ICMP echo, used when the process is privileged and
//!   the target is IPv4.
//! - [`CommandPinger`]: the system `ping` utility, used otherwise.

mod command;
mod icmp;

pub use command::CommandPinger;
pub use icmp::IcmpPinger;

use std::io;
use std::net::{IpAddr, ToSocketAddrs};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{KnownDevices, PingSettings};
use crate::device::{Device, InitialReport};
use crate::handler::{DeviceDetail, Dispatcher, PresenceEvent};
use crate::types::{Capabilities, Presence, Transport};

const TARGET: &str = "presence::ping";

/// Longest uninterrupted sleep between cancellation checks.
const CANCEL_POLL: Duration = Duration::from_millis(250);

/// Ping probe errors.
#[derive(Debug, Error)]
pub enum PingError {
    /// Neither a forward nor a reverse lookup produced an address.
    #[error("cannot resolve '{target}': {source}")]
    Unresolvable {
        /// Host as configured.
        target: String,
        /// Resolver error.
        #[source]
        source: io::Error,
    },

    /// The raw ICMP socket could not be opened.
    #[error("raw ICMP socket unavailable: {0}")]
    RawSocket(#[source] io::Error),

    /// The polling thread could not be started.
    #[error("cannot start ping thread for '{target}': {source}")]
    Spawn {
        /// Target key.
        target: String,
        /// OS error.
        #[source]
        source: io::Error,
    },
}

/// A target as configured, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    /// Registry key.
    pub key: String,
    /// IP address or host name.
    pub host: String,
    /// Seconds between checks.
    pub interval: Duration,
    /// Expected initial presence.
    pub expected: Option<Presence>,
    /// Configured display name.
    pub display: Option<String>,
    /// Came from the known-device table.
    pub known: bool,
}

impl TargetSpec {
    /// Build specs for every entry of `settings.devices`.
    ///
    /// Entries naming a known device use its `ip` or `dns` attribute, its
    /// `online` expectation and its `sleep` override; any other entry is
    /// taken as a raw host.
    pub fn from_settings(settings: &PingSettings, table: &KnownDevices) -> Vec<Self> {
        settings
            .devices
            .iter()
            .filter_map(|entry| match table.get(entry) {
                Some(device) => {
                    let Some(host) = device.host() else {
                        tracing::warn!(target: TARGET, device = %entry, "no ip or dns attribute, skipped");
                        return None;
                    };
                    Some(Self {
                        key: device.key.clone(),
                        host: host.to_string(),
                        interval: device
                            .sleep
                            .map_or_else(|| settings.interval(), Duration::from_secs),
                        expected: Some(
                            device
                                .expected()
                                .unwrap_or_else(|| Presence::from_reading(settings.online)),
                        ),
                        display: device.display.clone(),
                        known: true,
                    })
                }
                None => Some(Self {
                    key: entry.clone(),
                    host: entry.clone(),
                    interval: settings.interval(),
                    expected: Some(Presence::from_reading(settings.online)),
                    display: None,
                    known: false,
                }),
            })
            .collect()
    }
}

/// A resolved ping target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingTarget {
    spec: TargetSpec,
    address: IpAddr,
    hostname: Option<String>,
    by_name: bool,
}

impl PingTarget {
    /// Resolve a target in both directions.
    ///
    /// An address literal is reverse-resolved for its host name (a missing
    /// PTR record is fine). A host name must forward-resolve.
    ///
    /// # Errors
    ///
    /// Returns [`PingError::Unresolvable`] if a host name has no address.
    pub fn resolve(spec: TargetSpec) -> Result<Self, PingError> {
        if let Ok(address) = spec.host.parse::<IpAddr>() {
            let hostname = dns_lookup::lookup_addr(&address).ok();
            return Ok(Self {
                spec,
                address,
                hostname,
                by_name: false,
            });
        }

        let address = lookup_host(&spec.host).map_err(|source| PingError::Unresolvable {
            target: spec.host.clone(),
            source,
        })?;
        let hostname = Some(spec.host.clone());
        Ok(Self {
            spec,
            address,
            hostname,
            by_name: true,
        })
    }

    /// Registry key.
    pub fn key(&self) -> &str {
        &self.spec.key
    }

    /// Current address.
    pub const fn address(&self) -> IpAddr {
        self.address
    }

    /// Host name, if known.
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Time between checks.
    pub const fn interval(&self) -> Duration {
        self.spec.interval
    }

    /// Re-resolve a host-name target. Returns `false` when the lookup fails,
    /// which makes this cycle's reading inconclusive.
    pub fn refresh(&mut self) -> bool {
        if !self.by_name {
            return true;
        }
        match lookup_host(&self.spec.host) {
            Ok(address) => {
                if address != self.address {
                    tracing::info!(
                        target: TARGET,
                        device = %self.spec.key,
                        old = %self.address,
                        new = %address,
                        "address changed"
                    );
                    self.address = address;
                }
                true
            }
            Err(err) => {
                tracing::debug!(target: TARGET, device = %self.spec.key, error = %err, "lookup failed");
                false
            }
        }
    }

    fn detail(&self) -> DeviceDetail {
        DeviceDetail {
            key: self.spec.key.clone(),
            display: self.spec.display.clone(),
            address: Some(self.address.to_string()),
            hostname: self.hostname.clone(),
            zone: None,
            known: self.spec.known,
        }
    }
}

fn lookup_host(host: &str) -> io::Result<IpAddr> {
    let addresses: Vec<IpAddr> = (host, 0).to_socket_addrs()?.map(|a| a.ip()).collect();
    addresses
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addresses.first())
        .copied()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address records"))
}

/// One way of checking reachability.
pub trait Pinger: Send {
    /// Send one echo and wait up to `timeout` for the reply.
    ///
    /// `Ok(false)` means no reply; `Err` means the check itself failed.
    ///
    /// # Errors
    ///
    /// Returns an error when the check could not be performed.
    fn probe(&mut self, address: IpAddr, timeout: Duration) -> io::Result<bool>;
}

/// Run up to `1 + retry` attempts.
///
/// Any reply makes the device online. Otherwise at least one clean miss makes
/// it offline; if every attempt errored the reading is inconclusive.
pub fn check(pinger: &mut dyn Pinger, address: IpAddr, timeout: Duration, retry: u8) -> Option<bool> {
    let mut reading = None;
    for attempt in 0..=retry {
        match pinger.probe(address, timeout) {
            Ok(true) => return Some(true),
            Ok(false) => reading = Some(false),
            Err(err) => {
                tracing::debug!(target: TARGET, %address, attempt, error = %err, "check failed");
            }
        }
    }
    reading
}

/// The body of one target's polling thread.
pub struct PingTask {
    device: Device<PingTarget>,
    pinger: Box<dyn Pinger>,
    timeout: Duration,
    retry: u8,
    policy: InitialReport,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
}

impl PingTask {
    /// Create a task for a resolved target.
    pub fn new(
        target: PingTarget,
        pinger: Box<dyn Pinger>,
        settings: &PingSettings,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
    ) -> Self {
        let key = target.key().to_string();
        let expected = target.spec.expected;
        Self {
            device: Device::new(key, target).with_expected(expected),
            pinger,
            timeout: settings.attempt_timeout(),
            retry: settings.retry,
            policy: InitialReport {
                announce: settings.announce_initial,
            },
            dispatcher,
            cancel,
        }
    }

    /// The task's device.
    pub const fn device(&self) -> &Device<PingTarget> {
        &self.device
    }

    /// Run one check and report the transition, if any.
    pub fn cycle(&mut self, now: DateTime<Utc>) {
        let reading = if self.device.identity_mut().refresh() {
            let address = self.device.identity().address();
            check(self.pinger.as_mut(), address, self.timeout, self.retry)
        } else {
            None
        };

        let first_reading = self.device.presence() == Presence::Unknown;
        if let Some(transition) = self.device.observe(reading, now, self.policy) {
            let event = PresenceEvent {
                transport: Transport::Ping,
                transition,
                device: self.device.identity().detail(),
                first_reading,
                at: now,
            };
            self.dispatcher.transition(&event);
        }
    }

    /// Poll until cancelled, then release the pinger.
    pub fn run(mut self) {
        tracing::debug!(
            target: TARGET,
            device = self.device.key(),
            address = %self.device.identity().address(),
            "polling started"
        );
        loop {
            self.cycle(Utc::now());
            if self.sleep() {
                break;
            }
        }
        let Self { device, pinger, .. } = self;
        drop(pinger);
        tracing::debug!(target: TARGET, device = device.key(), "polling stopped");
    }

    /// Sleep one interval. Returns `true` if cancelled meanwhile.
    fn sleep(&self) -> bool {
        let deadline = Instant::now() + self.device.identity().interval();
        loop {
            if self.cancel.is_cancelled() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            thread::sleep(remaining.min(CANCEL_POLL));
        }
    }
}

/// Resolve every configured target; unresolvable targets are logged and dropped.
pub fn resolve_targets(settings: &PingSettings, table: &KnownDevices) -> Vec<PingTarget> {
    TargetSpec::from_settings(settings, table)
        .into_iter()
        .filter_map(|spec| match PingTarget::resolve(spec) {
            Ok(target) => Some(target),
            Err(err) => {
                tracing::error!(target: TARGET, error = %err, "target skipped");
                None
            }
        })
        .collect()
}

/// Choose the pinger for a target.
pub fn pinger_for(target: &PingTarget, settings: &PingSettings, capabilities: Capabilities) -> Box<dyn Pinger> {
    if capabilities.privileged && target.address().is_ipv4() {
        match IcmpPinger::new(settings.psize) {
            Ok(pinger) => return Box::new(pinger),
            Err(err) => tracing::warn!(
                target: TARGET,
                device = target.key(),
                error = %err,
                "falling back to the ping utility"
            ),
        }
    }
    Box::new(CommandPinger::new(settings.psize))
}

/// Start one thread per target and return how many started.
///
/// A target whose thread cannot be spawned is logged and skipped; the
/// remaining targets still start.
pub fn spawn(
    targets: Vec<PingTarget>,
    settings: &PingSettings,
    capabilities: Capabilities,
    dispatcher: &Dispatcher,
    cancel: &CancellationToken,
    handles: &mut Vec<JoinHandle<()>>,
) -> usize {
    spawn_with(targets, handles, |target| {
        let name = format!("ping-{}", target.key());
        let pinger = pinger_for(&target, settings, capabilities);
        let task = PingTask::new(target, pinger, settings, dispatcher.clone(), cancel.clone());
        thread::Builder::new().name(name).spawn(move || task.run())
    })
}

fn spawn_with(
    targets: Vec<PingTarget>,
    handles: &mut Vec<JoinHandle<()>>,
    mut start: impl FnMut(PingTarget) -> io::Result<JoinHandle<()>>,
) -> usize {
    let mut started = 0;
    for target in targets {
        let key = target.key().to_string();
        match start(target) {
            Ok(handle) => {
                handles.push(handle);
                started += 1;
            }
            Err(source) => {
                let err = PingError::Spawn { target: key, source };
                tracing::error!(target: TARGET, error = %err, "target skipped");
            }
        }
    }
    started
}
