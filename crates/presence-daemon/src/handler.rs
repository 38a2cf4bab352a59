//! Default event handler: logs every event and answers HTTP clients.

use presence_core::{
    HttpRequest, MotionEvent, PresenceEvent, PresenceHandler, Reply, Transition, Transport,
    ZoneUpdate,
};

const TARGET: &str = "presenced::events";

/// Logs presence changes, motion and requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

/// Log line for a `new` or `off` transition.
pub fn transition_message(event: &PresenceEvent) -> String {
    let device = &event.device;
    let address = device.address.as_deref().unwrap_or("-");
    match (event.transport, event.transition) {
        (Transport::Bluetooth, transition) => {
            let name = device.display.as_deref().unwrap_or("");
            let known = if device.known { "known" } else { "unknown" };
            match transition {
                Transition::New => format!("Discovered {known} bluetooth device [{address}] {name}"),
                Transition::Off => {
                    let known = if device.known { "Known" } else { "Unknown" };
                    format!("{known} bluetooth device disappeared [{address}] {name}")
                }
            }
        }
        (Transport::Ping, transition) => {
            let host = device.hostname.as_deref().unwrap_or("");
            match (transition, event.first_reading) {
                (Transition::New, true) => format!("Found ip device [{address}] {host}"),
                (Transition::New, false) => format!("Found new ip device [{address}] {host}"),
                (Transition::Off, true) => format!("IP device offline [{address}] {host}"),
                (Transition::Off, false) => format!("IP device disappeared [{address}] {host}"),
            }
        }
        (transport, transition) => format!(
            "Device {} {} via {transport}",
            device.key,
            transition.event()
        ),
    }
}

/// Reply body for an accepted zone update.
pub fn zone_message(update: &ZoneUpdate) -> String {
    let direction = if update.entered { "entered" } else { "left" };
    format!(
        "Device {} with serial {} {direction} zone {}",
        update.display, update.serial, update.zone
    )
}

impl PresenceHandler for LoggingHandler {
    fn name(&self) -> &str {
        "logging"
    }

    fn device_new(&self, event: &PresenceEvent) -> anyhow::Result<()> {
        tracing::info!(
            target: TARGET,
            device = %event.device.key,
            transport = %event.transport,
            "{}",
            transition_message(event)
        );
        Ok(())
    }

    fn device_off(&self, event: &PresenceEvent) -> anyhow::Result<()> {
        tracing::info!(
            target: TARGET,
            device = %event.device.key,
            transport = %event.transport,
            "{}",
            transition_message(event)
        );
        Ok(())
    }

    fn motion(&self, event: &MotionEvent) -> anyhow::Result<()> {
        tracing::info!(target: TARGET, pin = ?event.pin, "Pir motion detected!");
        Ok(())
    }

    fn idle(&self, event: &MotionEvent) -> anyhow::Result<()> {
        tracing::info!(
            target: TARGET,
            pin = ?event.pin,
            "Pir idle since {} seconds",
            event.timeout.as_secs()
        );
        Ok(())
    }

    fn zone_update(&self, update: &ZoneUpdate) -> anyhow::Result<Reply> {
        let message = zone_message(update);
        tracing::info!(target: TARGET, device = %update.key, zone = %update.zone, "{message}");
        Ok(Reply::ok(message))
    }

    fn http_request(&self, request: &HttpRequest) -> anyhow::Result<Reply> {
        tracing::info!(target: TARGET, path = %request.path, query = ?request.query, "Http request");
        Ok(Reply::ok(format!("Path: {}", request.path)))
    }

    fn pipe_request(&self, command: &str) -> anyhow::Result<()> {
        tracing::info!(target: TARGET, "Pipe request: [{command}]");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use presence_core::DeviceDetail;

    fn event(transport: Transport, transition: Transition, first_reading: bool) -> PresenceEvent {
        PresenceEvent {
            transport,
            transition,
            device: DeviceDetail {
                key: "nexus".into(),
                display: Some("Nexus".into()),
                address: Some("192.168.1.20".into()),
                hostname: Some("nexus.lan".into()),
                zone: None,
                known: true,
            },
            first_reading,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_ping_messages_distinguish_first_reading() {
        assert_eq!(
            transition_message(&event(Transport::Ping, Transition::New, true)),
            "Found ip device [192.168.1.20] nexus.lan"
        );
        assert_eq!(
            transition_message(&event(Transport::Ping, Transition::New, false)),
            "Found new ip device [192.168.1.20] nexus.lan"
        );
        assert_eq!(
            transition_message(&event(Transport::Ping, Transition::Off, true)),
            "IP device offline [192.168.1.20] nexus.lan"
        );
        assert_eq!(
            transition_message(&event(Transport::Ping, Transition::Off, false)),
            "IP device disappeared [192.168.1.20] nexus.lan"
        );
    }

    #[test]
    fn test_bluetooth_messages() {
        let mut found = event(Transport::Bluetooth, Transition::New, false);
        found.device.address = Some("00:11:22:33:44:55".into());
        assert_eq!(
            transition_message(&found),
            "Discovered known bluetooth device [00:11:22:33:44:55] Nexus"
        );

        let mut gone = event(Transport::Bluetooth, Transition::Off, false);
        gone.device.known = false;
        gone.device.address = Some("66:77:88:99:AA:BB".into());
        gone.device.display = None;
        assert_eq!(
            transition_message(&gone),
            "Unknown bluetooth device disappeared [66:77:88:99:AA:BB] "
        );
    }

    #[test]
    fn test_zone_update_reply() {
        let handler = LoggingHandler;
        let mut update = ZoneUpdate {
            key: "htc".into(),
            display: "HTC One".into(),
            serial: "SH42".into(),
            zone: "home".into(),
            entered: true,
        };
        assert_eq!(
            handler.zone_update(&update).unwrap(),
            Reply::ok("Device HTC One with serial SH42 entered zone home")
        );

        update.entered = false;
        assert_eq!(
            handler.zone_update(&update).unwrap().body,
            "Device HTC One with serial SH42 left zone home"
        );
    }

    #[test]
    fn test_http_request_echoes_path() {
        let handler = LoggingHandler;
        let reply = handler
            .http_request(&HttpRequest {
                path: "/lights".into(),
                ..HttpRequest::default()
            })
            .unwrap();
        assert_eq!(reply, Reply::ok("Path: /lights"));
    }
}
