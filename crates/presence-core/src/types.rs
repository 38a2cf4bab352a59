//! Shared presence types.
//!
//! These are the small value types every probe and the dispatcher agree on:
//! the tri-state [`Presence`], the edge [`Transition`] a check can produce,
//! the callback [`EventKind`] names, and the [`Capabilities`] decided once
//! at startup outside the core.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Presence state of a single device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Presence {
    /// No definite check result has been recorded yet.
    #[default]
    Unknown,
    /// The last definite check found the device.
    Online,
    /// The last definite check did not find the device.
    Offline,
}

impl Presence {
    /// Map a definite check result onto a presence state.
    #[must_use]
    pub const fn from_reading(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }

    /// Returns `true` for [`Presence::Online`].
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, Self::Online)
    }
}

impl fmt::Display for Presence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => f.write_str("unknown"),
            Self::Online => f.write_str("online"),
            Self::Offline => f.write_str("offline"),
        }
    }
}

/// An edge produced by a probe check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transition {
    /// The device became present.
    New,
    /// The device disappeared.
    Off,
}

impl Transition {
    /// The callback event fired for this transition.
    #[must_use]
    pub const fn event(self) -> EventKind {
        match self {
            Self::New => EventKind::New,
            Self::Off => EventKind::Off,
        }
    }
}

/// Named callback events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A device came online.
    New,
    /// A device went offline.
    Off,
    /// The motion sensor became active.
    Motion,
    /// The motion sensor has been idle for the configured timeout.
    Idle,
    /// An HTTP zone update was accepted.
    Update,
    /// An opaque request arrived over HTTP or the control channel.
    Request,
}

impl EventKind {
    /// The event name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Off => "off",
            Self::Motion => "motion",
            Self::Idle => "idle",
            Self::Update => "update",
            Self::Request => "request",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Detection transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Bluetooth inquiry.
    Bluetooth,
    /// ICMP echo or the `ping` utility.
    Ping,
    /// HTTP zone updates.
    Http,
    /// Named pipe control channel.
    Pipe,
    /// PIR motion sensor.
    Motion,
}

impl Transport {
    /// Lowercase transport name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bluetooth => "bluetooth",
            Self::Ping => "ping",
            Self::Http => "http",
            Self::Pipe => "pipe",
            Self::Motion => "motion",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional platform capabilities, detected once by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// The process may open raw ICMP sockets.
    pub privileged: bool,
    /// A motion sensor pin can be watched on this machine.
    pub motion_sensor: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_from_reading() {
        assert_eq!(Presence::from_reading(true), Presence::Online);
        assert_eq!(Presence::from_reading(false), Presence::Offline);
        assert_eq!(Presence::default(), Presence::Unknown);
    }

    #[test]
    fn test_transition_event_names() {
        assert_eq!(Transition::New.event().as_str(), "new");
        assert_eq!(Transition::Off.event().as_str(), "off");
        assert_eq!(EventKind::Update.to_string(), "update");
    }

    #[test]
    fn test_presence_serialization() {
        let json = serde_json::to_string(&Presence::Online).unwrap();
        assert_eq!(json, "\"online\"");
    }
}
