//! Event callbacks and the dispatch boundary.
//!
//! The controlling application implements [`PresenceHandler`], one method per
//! event. Probes never call it directly; they go through a [`Dispatcher`],
//! which isolates handler failures: an `Err` or a panic is logged with the
//! handler name and event, then swallowed so the calling probe keeps running.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::types::{EventKind, Transition, Transport};

const TARGET: &str = "presence::dispatch";

/// What a probe knows about the device behind a transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceDetail {
    /// Registry key: the configured name, or the raw identity.
    pub key: String,
    /// Configured display name or discovered device name.
    pub display: Option<String>,
    /// Transport address (Bluetooth MAC, IP address).
    pub address: Option<String>,
    /// Host name, for ping targets.
    pub hostname: Option<String>,
    /// Zone tag from the known-device table.
    pub zone: Option<String>,
    /// `true` when the device matched the known-device table.
    pub known: bool,
}

/// A `new` or `off` transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    /// Transport that observed the change.
    pub transport: Transport,
    /// Direction of the change.
    pub transition: Transition,
    /// The device.
    pub device: DeviceDetail,
    /// `true` when this is the device's first definite reading.
    pub first_reading: bool,
    /// When the reading was taken.
    pub at: DateTime<Utc>,
}

/// A `motion` or `idle` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionEvent {
    /// Sensor pin, when a hardware pin is attached.
    pub pin: Option<u8>,
    /// Configured idle timeout.
    pub timeout: Duration,
    /// When the event was detected.
    pub at: DateTime<Utc>,
}

/// An accepted HTTP zone update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneUpdate {
    /// Known-device key.
    pub key: String,
    /// Display name, falling back to the key.
    pub display: String,
    /// Value of the configured lookup attribute (the serial by default).
    pub serial: String,
    /// New zone tag.
    pub zone: String,
    /// `true` for enter, `false` for leave.
    pub entered: bool,
}

/// A request that is not a zone update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request path.
    pub path: String,
    /// Query parameters; repeated keys keep every value in order.
    pub query: BTreeMap<String, Vec<String>>,
}

/// Status and body returned to an HTTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// HTTP status code.
    pub status: u16,
    /// Plain text body.
    pub body: String,
}

impl Reply {
    /// A reply with an explicit status.
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// A `200 OK` reply.
    pub fn ok(body: impl Into<String>) -> Self {
        Self::new(200, body)
    }

    /// The reply sent when the handler fails.
    pub fn internal_error() -> Self {
        Self::new(500, "Internal Server Error")
    }
}

/// Callbacks the controlling application provides.
///
/// Every event has a required method so a missing callback is a compile
/// error. Errors are logged by the [`Dispatcher`] and never propagate into
/// the probes.
pub trait PresenceHandler: Send + Sync {
    /// Name used in failure logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// A device came online.
    ///
    /// # Errors
    ///
    /// Any error is logged and ignored.
    fn device_new(&self, event: &PresenceEvent) -> anyhow::Result<()>;

    /// A device went offline.
    ///
    /// # Errors
    ///
    /// Any error is logged and ignored.
    fn device_off(&self, event: &PresenceEvent) -> anyhow::Result<()>;

    /// The motion sensor became active.
    ///
    /// # Errors
    ///
    /// Any error is logged and ignored.
    fn motion(&self, event: &MotionEvent) -> anyhow::Result<()>;

    /// The motion sensor stayed quiet for the idle timeout.
    ///
    /// # Errors
    ///
    /// Any error is logged and ignored.
    fn idle(&self, event: &MotionEvent) -> anyhow::Result<()>;

    /// A known device entered or left a zone.
    ///
    /// # Errors
    ///
    /// An error answers the client with `500`.
    fn zone_update(&self, update: &ZoneUpdate) -> anyhow::Result<Reply>;

    /// A generic HTTP request.
    ///
    /// # Errors
    ///
    /// An error answers the client with `500`.
    fn http_request(&self, request: &HttpRequest) -> anyhow::Result<Reply>;

    /// A command line read from the control channel.
    ///
    /// # Errors
    ///
    /// Any error is logged and ignored.
    fn pipe_request(&self, command: &str) -> anyhow::Result<()>;
}

/// Cloneable, failure-isolating front of a [`PresenceHandler`].
#[derive(Clone)]
pub struct Dispatcher {
    handler: Arc<dyn PresenceHandler>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handler", &self.handler.name())
            .finish()
    }
}

impl Dispatcher {
    /// Wrap a handler.
    pub fn new(handler: Arc<dyn PresenceHandler>) -> Self {
        Self { handler }
    }

    /// Fire `new` or `off`.
    pub fn transition(&self, event: &PresenceEvent) {
        let kind = event.transition.event();
        self.guard(kind, || match event.transition {
            Transition::New => self.handler.device_new(event),
            Transition::Off => self.handler.device_off(event),
        });
    }

    /// Fire `motion`.
    pub fn motion(&self, event: &MotionEvent) {
        self.guard(EventKind::Motion, || self.handler.motion(event));
    }

    /// Fire `idle`.
    pub fn idle(&self, event: &MotionEvent) {
        self.guard(EventKind::Idle, || self.handler.idle(event));
    }

    /// Fire `update` and return the reply for the client.
    pub fn zone_update(&self, update: &ZoneUpdate) -> Reply {
        self.guard(EventKind::Update, || self.handler.zone_update(update))
            .unwrap_or_else(Reply::internal_error)
    }

    /// Fire `request` for an HTTP request and return the reply for the client.
    pub fn http_request(&self, request: &HttpRequest) -> Reply {
        self.guard(EventKind::Request, || self.handler.http_request(request))
            .unwrap_or_else(Reply::internal_error)
    }

    /// Fire `request` for a control channel command.
    pub fn pipe_request(&self, command: &str) {
        self.guard(EventKind::Request, || self.handler.pipe_request(command));
    }

    fn guard<T>(&self, event: EventKind, call: impl FnOnce() -> anyhow::Result<T>) -> Option<T> {
        match panic::catch_unwind(AssertUnwindSafe(call)) {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                tracing::error!(
                    target: TARGET,
                    handler = self.handler.name(),
                    %event,
                    error = format!("{err:#}"),
                    "event handler failed"
                );
                None
            }
            Err(payload) => {
                tracing::error!(
                    target: TARGET,
                    handler = self.handler.name(),
                    %event,
                    panic = panic_message(payload.as_ref()),
                    "event handler panicked"
                );
                None
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Test double that records every event.
#[cfg(any(test, feature = "mock-bluetooth"))]
pub mod testing {
    use std::sync::Mutex;

    use super::{HttpRequest, MotionEvent, PresenceEvent, PresenceHandler, Reply, ZoneUpdate};
    use crate::types::Transition;

    /// One recorded callback.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Recorded {
        /// `new` with the device key.
        New(String),
        /// `off` with the device key.
        Off(String),
        /// `motion`.
        Motion,
        /// `idle`.
        Idle,
        /// `update`.
        Zone {
            /// Device key.
            key: String,
            /// Zone tag.
            zone: String,
            /// Enter flag.
            entered: bool,
        },
        /// `request` over HTTP.
        Http(String),
        /// `request` over the control channel.
        Pipe(String),
    }

    /// Records events; optionally fails or panics on every call.
    #[derive(Debug, Default)]
    pub struct RecordingHandler {
        events: Mutex<Vec<Recorded>>,
        fail: bool,
        panic: bool,
    }

    impl RecordingHandler {
        /// A handler that succeeds.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// A handler whose every call returns an error.
        #[must_use]
        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        /// A handler whose every call panics.
        #[must_use]
        pub fn panicking() -> Self {
            Self {
                panic: true,
                ..Self::default()
            }
        }

        /// Snapshot of recorded events.
        pub fn events(&self) -> Vec<Recorded> {
            self.events
                .lock()
                .map(|events| events.clone())
                .unwrap_or_default()
        }

        /// Number of recorded events matching `predicate`.
        pub fn count(&self, predicate: impl Fn(&Recorded) -> bool) -> usize {
            self.events().iter().filter(|event| predicate(event)).count()
        }

        fn record(&self, event: Recorded) -> anyhow::Result<()> {
            if let Ok(mut events) = self.events.lock() {
                events.push(event);
            }
            assert!(!self.panic, "recording handler panic");
            if self.fail {
                anyhow::bail!("recording handler failure");
            }
            Ok(())
        }
    }

    impl PresenceHandler for RecordingHandler {
        fn device_new(&self, event: &PresenceEvent) -> anyhow::Result<()> {
            debug_assert_eq!(event.transition, Transition::New);
            self.record(Recorded::New(event.device.key.clone()))
        }

        fn device_off(&self, event: &PresenceEvent) -> anyhow::Result<()> {
            debug_assert_eq!(event.transition, Transition::Off);
            self.record(Recorded::Off(event.device.key.clone()))
        }

        fn motion(&self, _event: &MotionEvent) -> anyhow::Result<()> {
            self.record(Recorded::Motion)
        }

        fn idle(&self, _event: &MotionEvent) -> anyhow::Result<()> {
            self.record(Recorded::Idle)
        }

        fn zone_update(&self, update: &ZoneUpdate) -> anyhow::Result<Reply> {
            self.record(Recorded::Zone {
                key: update.key.clone(),
                zone: update.zone.clone(),
                entered: update.entered,
            })?;
            Ok(Reply::ok(format!("{} {}", update.key, update.zone)))
        }

        fn http_request(&self, request: &HttpRequest) -> anyhow::Result<Reply> {
            self.record(Recorded::Http(request.path.clone()))?;
            Ok(Reply::new(202, format!("Path: {}", request.path)))
        }

        fn pipe_request(&self, command: &str) -> anyhow::Result<()> {
            self.record(Recorded::Pipe(command.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{Recorded, RecordingHandler};
    use super::*;

    fn event(transition: Transition) -> PresenceEvent {
        PresenceEvent {
            transport: Transport::Ping,
            transition,
            device: DeviceDetail {
                key: "nexus".into(),
                ..DeviceDetail::default()
            },
            first_reading: false,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_transitions_route_to_matching_methods() {
        let handler = Arc::new(RecordingHandler::new());
        let dispatcher = Dispatcher::new(handler.clone());

        dispatcher.transition(&event(Transition::New));
        dispatcher.transition(&event(Transition::Off));
        dispatcher.pipe_request("status");

        assert_eq!(
            handler.events(),
            vec![
                Recorded::New("nexus".into()),
                Recorded::Off("nexus".into()),
                Recorded::Pipe("status".into()),
            ]
        );
    }

    #[test]
    fn test_failing_handler_is_contained() {
        let handler = Arc::new(RecordingHandler::failing());
        let dispatcher = Dispatcher::new(handler.clone());

        dispatcher.transition(&event(Transition::New));
        let reply = dispatcher.http_request(&HttpRequest {
            path: "/status".into(),
            ..HttpRequest::default()
        });

        assert_eq!(reply.status, 500);
        assert_eq!(handler.events().len(), 2);
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let handler = Arc::new(RecordingHandler::panicking());
        let dispatcher = Dispatcher::new(handler.clone());

        dispatcher.transition(&event(Transition::Off));
        let reply = dispatcher.zone_update(&ZoneUpdate {
            key: "htc".into(),
            display: "HTC".into(),
            serial: "SH42".into(),
            zone: "home".into(),
            entered: true,
        });

        assert_eq!(reply, Reply::internal_error());
        assert_eq!(handler.events().len(), 2);
    }

    #[test]
    fn test_handler_reply_is_passed_through() {
        let dispatcher = Dispatcher::new(Arc::new(RecordingHandler::new()));
        let reply = dispatcher.http_request(&HttpRequest {
            path: "/lights".into(),
            ..HttpRequest::default()
        });
        assert_eq!(reply, Reply::new(202, "Path: /lights"));
    }

    #[test]
    fn test_panic_message_extraction() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
