//! # presence-core
//!
//! Presence reactor for the presenced monitoring daemon.
//!
//! This crate decides whether configured or discovered devices are present,
//! using several independent transports, and fires one callback per presence
//! change.
//!
//! ## Architecture
//!
//! - [`device`] - Device entity and the Unknown/Online/Offline state machine
//! - [`registry`] - Single-writer device registry with expiry
//! - [`config`] - Resolved configuration and the known-device table
//! - [`handler`] - Typed event callbacks and the failure-isolating dispatcher
//! - [`bluetooth`] - Inquiry cycles with end-of-cycle disappearance diff
//! - [`ping`] - One polling thread per target, raw ICMP or the `ping` utility
//! - [`http`] - Zone update listener, one request per wakeup
//! - [`pipe`] - Named pipe control channel
//! - [`motion`] - PIR debounce and idle countdown
//! - [`reactor`] - The event loop tying the probes together
//! - [`error`] - Unified error types for the crate
//! - [`types`] - Shared value types

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![warn(missing_docs)]

pub mod bluetooth;
pub mod config;
pub mod device;
pub mod error;
pub mod handler;
pub mod http;
pub mod motion;
pub mod ping;
pub mod pipe;
pub mod reactor;
pub mod registry;
pub mod types;

// Re-export primary types for convenience
pub use bluetooth::{BluetoothError, BluetoothProbe, InquiryDriver, InquiryEvent};
pub use config::{is_valid_mac_address, ConfigError, KnownDevice, KnownDevices, Settings};
pub use device::{Device, InitialReport};
pub use error::{PresenceError, Result};
pub use handler::{
    DeviceDetail, Dispatcher, HttpRequest, MotionEvent, PresenceEvent, PresenceHandler, Reply,
    ZoneUpdate,
};
pub use reactor::{Reactor, ReactorHandle};
pub use registry::Registry;
pub use types::{Capabilities, EventKind, Presence, Transition, Transport};
