//! Bluetooth inquiry probe.
//!
//! The probe runs inquiry cycles through an [`InquiryDriver`]. A driver pushes
//! [`InquiryEvent`]s into a channel the reactor waits on; the reactor feeds
//! each event back through [`BluetoothProbe::process_event`]. When a cycle
//! completes, every device that was online but not seen during the cycle
//! goes offline, stale devices are expired and the next cycle starts.
//!
//! # Backends
//!
//! - [`bluez::BluezInquirer`] (feature `bluetooth`): BlueZ over D-Bus via `bluer`.
//! - [`scripted::ScriptedInquirer`] (tests, feature `mock-bluetooth`): replays
//!   fixed cycles.

#[cfg(feature = "bluetooth")]
pub mod bluez;
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod scripted;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::config::{BluetoothSettings, KnownDevice, KnownDevices};
use crate::device::{Device, InitialReport};
use crate::handler::{DeviceDetail, Dispatcher, PresenceEvent};
use crate::registry::Registry;
use crate::types::{Transition, Transport};

const TARGET: &str = "presence::bluetooth";

/// Bluetooth backend errors.
#[derive(Debug, Error)]
pub enum BluetoothError {
    /// No adapter is present.
    #[error("No Bluetooth adapter found. Ensure Bluetooth hardware is present and drivers are loaded.")]
    AdapterNotFound,

    /// The adapter is powered off.
    #[error("Bluetooth adapter is powered off. Run 'bluetoothctl power on' to enable.")]
    AdapterPoweredOff,

    /// The D-Bus session to the Bluetooth daemon failed.
    #[error("Failed to open Bluetooth session: {message}")]
    SessionInitFailed {
        /// Backend message.
        message: String,
    },

    /// Starting or running discovery failed.
    #[error("Bluetooth discovery failed: {message}")]
    DiscoveryFailed {
        /// Backend message.
        message: String,
    },

    /// The build has no Bluetooth backend.
    #[error("Bluetooth support was not compiled in")]
    Unsupported,
}

/// One step of an inquiry cycle, reported by a driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InquiryEvent {
    /// The inquiry is running.
    Started,
    /// A device answered the inquiry.
    Discovered {
        /// Hardware address, any case.
        address: String,
        /// Remote name, if resolved.
        name: Option<String>,
    },
    /// The inquiry window closed.
    Complete,
}

/// Source of inquiry events.
///
/// `start` must return immediately; the driver reports progress through the
/// channel and ends every cycle with [`InquiryEvent::Complete`], even when the
/// inquiry failed. It is called from inside the reactor's runtime, so drivers
/// may spawn tasks onto it.
pub trait InquiryDriver: Send {
    /// Begin one inquiry cycle.
    fn start(&mut self, events: UnboundedSender<InquiryEvent>);
}

/// Phase of the current inquiry cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InquiryPhase {
    /// Cycle requested, no event yet.
    PreInquiry,
    /// Discovery events are arriving.
    Discovering,
    /// The cycle ended; diff and restart are due.
    Complete,
}

/// Identity of a Bluetooth device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BluetoothIdentity {
    /// Upper-case hardware address.
    pub address: String,
    /// Remote name reported by the device.
    pub name: Option<String>,
    /// Configured display name.
    pub display: Option<String>,
    /// Configured zone.
    pub zone: Option<String>,
    /// Matched the known-device table.
    pub known: bool,
}

/// The Bluetooth probe. Owned and driven by the reactor thread.
pub struct BluetoothProbe {
    driver: Box<dyn InquiryDriver>,
    sender: UnboundedSender<InquiryEvent>,
    receiver: UnboundedReceiver<InquiryEvent>,
    phase: InquiryPhase,
    seen: HashSet<String>,
    registry: Registry<BluetoothIdentity>,
    known: HashMap<String, KnownDevice>,
    policy: InitialReport,
    expire: chrono::Duration,
    dispatcher: Dispatcher,
}

impl std::fmt::Debug for BluetoothProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BluetoothProbe")
            .field("phase", &self.phase)
            .field("seen", &self.seen.len())
            .field("devices", &self.registry.len())
            .finish_non_exhaustive()
    }
}

impl BluetoothProbe {
    /// Create a probe. Known devices are those named in `settings.devices`, or
    /// every table entry with a `bt` address when that list is empty.
    pub fn new(
        driver: Box<dyn InquiryDriver>,
        settings: &BluetoothSettings,
        table: &KnownDevices,
        dispatcher: Dispatcher,
    ) -> Self {
        let known = table
            .iter()
            .filter(|device| {
                settings.devices.is_empty() || settings.devices.iter().any(|k| *k == device.key)
            })
            .filter_map(|device| {
                device
                    .bt
                    .as_ref()
                    .map(|address| (address.to_uppercase(), device.clone()))
            })
            .collect();
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            driver,
            sender,
            receiver,
            phase: InquiryPhase::Complete,
            seen: HashSet::new(),
            registry: Registry::new(),
            known,
            policy: InitialReport {
                announce: settings.announce_initial,
            },
            expire: settings.expire_window(),
            dispatcher,
        }
    }

    /// Current cycle phase.
    pub const fn phase(&self) -> InquiryPhase {
        self.phase
    }

    /// Devices tracked by this probe.
    pub const fn registry(&self) -> &Registry<BluetoothIdentity> {
        &self.registry
    }

    /// Clear the per-cycle set and ask the driver for a new cycle.
    pub fn start_inquiry(&mut self) {
        self.phase = InquiryPhase::PreInquiry;
        self.seen.clear();
        tracing::debug!(target: TARGET, "starting inquiry");
        self.driver.start(self.sender.clone());
    }

    /// Wait for the next inquiry event.
    ///
    /// The probe keeps a sender, so this only resolves with an event.
    pub async fn next_event(&mut self) -> Option<InquiryEvent> {
        self.receiver.recv().await
    }

    /// Process one event. Returns `true` when the event completed the cycle.
    pub fn process_event(&mut self, event: InquiryEvent, now: DateTime<Utc>) -> bool {
        match event {
            InquiryEvent::Started => {
                self.phase = InquiryPhase::Discovering;
                false
            }
            InquiryEvent::Discovered { address, name } => {
                self.phase = InquiryPhase::Discovering;
                self.discovered(&address, name, now);
                false
            }
            InquiryEvent::Complete => {
                self.phase = InquiryPhase::Complete;
                self.diff(now);
                true
            }
        }
    }

    /// Remove devices whose age exceeds the expiry window.
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let removed = self.registry.expire(now, self.expire);
        for device in &removed {
            tracing::debug!(
                target: TARGET,
                device = device.key(),
                address = %device.identity().address,
                "expired"
            );
        }
        removed.len()
    }

    fn discovered(&mut self, address: &str, name: Option<String>, now: DateTime<Utc>) {
        let address = address.to_uppercase();
        self.seen.insert(address.clone());

        let known = self.known.get(&address);
        let (device, created) = self.registry.get_or_insert_with(&address, || {
            let identity = BluetoothIdentity {
                address: address.clone(),
                name: None,
                display: known.and_then(|k| k.display.clone()),
                zone: known.and_then(|k| k.zone.clone()),
                known: known.is_some(),
            };
            let key = known.map_or_else(|| address.clone(), |k| k.key.clone());
            Device::new(key, identity).with_expected(known.and_then(KnownDevice::expected))
        });
        if created {
            tracing::debug!(target: TARGET, device = device.key(), %address, "first sighting");
        }
        if name.is_some() {
            device.identity_mut().name = name;
        }

        let first_reading = device.presence() == crate::types::Presence::Unknown;
        if let Some(transition) = device.observe(Some(true), now, self.policy) {
            let event = presence_event(device, transition, first_reading, now);
            self.dispatcher.transition(&event);
        }
    }

    fn diff(&mut self, now: DateTime<Utc>) {
        let mut events = Vec::new();
        for (address, device) in self.registry.iter_mut() {
            if self.seen.contains(address) || !device.presence().is_online() {
                continue;
            }
            if let Some(transition) = device.observe(Some(false), now, self.policy) {
                events.push(presence_event(device, transition, false, now));
            }
        }
        tracing::debug!(
            target: TARGET,
            seen = self.seen.len(),
            gone = events.len(),
            "inquiry complete"
        );
        for event in &events {
            self.dispatcher.transition(event);
        }
    }
}

fn presence_event(
    device: &Device<BluetoothIdentity>,
    transition: Transition,
    first_reading: bool,
    at: DateTime<Utc>,
) -> PresenceEvent {
    let identity = device.identity();
    PresenceEvent {
        transport: Transport::Bluetooth,
        transition,
        device: DeviceDetail {
            key: device.key().to_string(),
            display: identity.display.clone().or_else(|| identity.name.clone()),
            address: Some(identity.address.clone()),
            hostname: identity.name.clone(),
            zone: identity.zone.clone(),
            known: identity.known,
        },
        first_reading,
        at,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::scripted::ScriptedInquirer;
    use super::*;
    use crate::handler::testing::{Recorded, RecordingHandler};

    const PHONE: &str = "00:EE:BD:52:83:B5";
    const TABLET: &str = "08:d4:2b:17:d8:e7";

    fn table() -> KnownDevices {
        KnownDevices::from_toml(
            r#"
            [htc]
            display = "HTC One M7"
            bt = "00:EE:BD:52:83:B5"
            zone = "home"
            "#,
        )
        .unwrap()
    }

    fn probe(handler: &Arc<RecordingHandler>) -> BluetoothProbe {
        BluetoothProbe::new(
            Box::new(ScriptedInquirer::new(Vec::new())),
            &BluetoothSettings::default(),
            &table(),
            Dispatcher::new(handler.clone()),
        )
    }

    fn found(address: &str) -> InquiryEvent {
        InquiryEvent::Discovered {
            address: address.to_string(),
            name: None,
        }
    }

    fn cycle(probe: &mut BluetoothProbe, addresses: &[&str], now: DateTime<Utc>) {
        probe.start_inquiry();
        probe.process_event(InquiryEvent::Started, now);
        for address in addresses {
            probe.process_event(found(address), now);
        }
    }

    #[test]
    fn test_discovery_reconciles_known_devices() {
        let handler = Arc::new(RecordingHandler::new());
        let mut probe = probe(&handler);
        let now = Utc::now();

        cycle(&mut probe, &[PHONE, TABLET], now);

        assert_eq!(
            handler.events(),
            vec![
                Recorded::New("htc".into()),
                Recorded::New(TABLET.to_uppercase()),
            ]
        );
        let htc = probe.registry().get(PHONE).unwrap();
        assert!(htc.identity().known);
        assert_eq!(htc.identity().zone.as_deref(), Some("home"));
        assert!(!probe.registry().get(&TABLET.to_uppercase()).unwrap().identity().known);
    }

    #[test]
    fn test_absent_device_goes_off_at_cycle_end_only() {
        let handler = Arc::new(RecordingHandler::new());
        let mut probe = probe(&handler);
        let now = Utc::now();

        cycle(&mut probe, &[PHONE, TABLET], now);
        assert!(probe.process_event(InquiryEvent::Complete, now));

        cycle(&mut probe, &[TABLET], now);
        assert_eq!(handler.count(|e| matches!(e, Recorded::Off(_))), 0);

        assert!(probe.process_event(InquiryEvent::Complete, now));
        assert_eq!(handler.count(|e| *e == Recorded::Off("htc".into())), 1);

        // Still absent: no second `off`.
        cycle(&mut probe, &[TABLET], now);
        probe.process_event(InquiryEvent::Complete, now);
        assert_eq!(handler.count(|e| matches!(e, Recorded::Off(_))), 1);
    }

    #[test]
    fn test_repeat_sightings_fire_once() {
        let handler = Arc::new(RecordingHandler::new());
        let mut probe = probe(&handler);
        let now = Utc::now();

        for _ in 0..3 {
            cycle(&mut probe, &[PHONE, PHONE], now);
            probe.process_event(InquiryEvent::Complete, now);
        }
        assert_eq!(handler.events(), vec![Recorded::New("htc".into())]);
    }

    #[test]
    fn test_returning_device_fires_new_again() {
        let handler = Arc::new(RecordingHandler::new());
        let mut probe = probe(&handler);
        let now = Utc::now();

        cycle(&mut probe, &[PHONE], now);
        probe.process_event(InquiryEvent::Complete, now);
        cycle(&mut probe, &[], now);
        probe.process_event(InquiryEvent::Complete, now);
        cycle(&mut probe, &[PHONE], now);

        assert_eq!(
            handler.events(),
            vec![
                Recorded::New("htc".into()),
                Recorded::Off("htc".into()),
                Recorded::New("htc".into()),
            ]
        );
    }

    #[test]
    fn test_expire_drops_stale_devices() {
        let handler = Arc::new(RecordingHandler::new());
        let mut probe = probe(&handler);
        let then = Utc::now();

        cycle(&mut probe, &[PHONE, TABLET], then);
        probe.process_event(InquiryEvent::Complete, then);

        let later = then + chrono::Duration::seconds(200);
        cycle(&mut probe, &[TABLET], later);
        probe.process_event(InquiryEvent::Complete, later);

        let much_later = then + chrono::Duration::seconds(301);
        assert_eq!(probe.expire(much_later), 1);
        assert!(!probe.registry().contains(PHONE));
        assert!(probe.registry().contains(&TABLET.to_uppercase()));
    }

    #[test]
    fn test_phases_follow_events() {
        let handler = Arc::new(RecordingHandler::new());
        let mut probe = probe(&handler);
        let now = Utc::now();

        assert_eq!(probe.phase(), InquiryPhase::Complete);
        probe.start_inquiry();
        assert_eq!(probe.phase(), InquiryPhase::PreInquiry);
        probe.process_event(InquiryEvent::Started, now);
        assert_eq!(probe.phase(), InquiryPhase::Discovering);
        probe.process_event(InquiryEvent::Complete, now);
        assert_eq!(probe.phase(), InquiryPhase::Complete);
    }

    #[tokio::test]
    async fn test_scripted_driver_feeds_probe() {
        let handler = Arc::new(RecordingHandler::new());
        let driver = ScriptedInquirer::new(vec![vec![PHONE.to_string()], Vec::new()]);
        let mut probe = BluetoothProbe::new(
            Box::new(driver),
            &BluetoothSettings::default(),
            &table(),
            Dispatcher::new(handler.clone()),
        );

        for _ in 0..2 {
            probe.start_inquiry();
            loop {
                let event = probe.next_event().await.unwrap();
                if probe.process_event(event, Utc::now()) {
                    break;
                }
            }
        }

        assert_eq!(
            handler.events(),
            vec![Recorded::New("htc".into()), Recorded::Off("htc".into())]
        );
    }
}
