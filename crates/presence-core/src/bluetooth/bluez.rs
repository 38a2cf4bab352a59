//! BlueZ inquiry backend.
//!
//! Runs BR/EDR discovery for one inquiry window per cycle. A device counts as
//! discovered when BlueZ reports it with an RSSI, either live through
//! `DeviceAdded` or in the sweep over all adapter devices taken just before
//! the window closes.

use std::time::Duration;

use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::{pin_mut, StreamExt};
use tokio::sync::mpsc::UnboundedSender;

use super::{BluetoothError, InquiryDriver, InquiryEvent};

const TARGET: &str = "presence::bluetooth";

/// Delay before reporting a failed cycle complete, so a broken adapter does
/// not spin the reactor.
const FAILURE_BACKOFF: Duration = Duration::from_secs(5);

/// Inquiry driver backed by the default BlueZ adapter.
#[derive(Debug)]
pub struct BluezInquirer {
    adapter: Adapter,
    window: Duration,
}

impl BluezInquirer {
    /// Open a session on the default adapter and restrict discovery to BR/EDR.
    ///
    /// # Errors
    ///
    /// Returns an error if no adapter exists, it is powered off, or the
    /// discovery filter is rejected.
    pub async fn connect(window: Duration) -> Result<Self, BluetoothError> {
        let session = Session::new()
            .await
            .map_err(|e| BluetoothError::SessionInitFailed {
                message: e.to_string(),
            })?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| BluetoothError::AdapterNotFound)?;

        let powered = adapter
            .is_powered()
            .await
            .map_err(|e| BluetoothError::SessionInitFailed {
                message: e.to_string(),
            })?;
        if !powered {
            return Err(BluetoothError::AdapterPoweredOff);
        }

        adapter
            .set_discovery_filter(DiscoveryFilter {
                transport: DiscoveryTransport::BrEdr,
                ..DiscoveryFilter::default()
            })
            .await
            .map_err(|e| BluetoothError::DiscoveryFailed {
                message: e.to_string(),
            })?;

        tracing::info!(
            target: TARGET,
            adapter = adapter.name(),
            window_secs = window.as_secs(),
            "Bluetooth adapter ready"
        );
        Ok(Self { adapter, window })
    }
}

impl InquiryDriver for BluezInquirer {
    fn start(&mut self, events: UnboundedSender<InquiryEvent>) {
        let adapter = self.adapter.clone();
        let window = self.window;
        tokio::spawn(async move {
            let _ = events.send(InquiryEvent::Started);
            if let Err(err) = inquire(&adapter, window, &events).await {
                tracing::warn!(target: TARGET, error = %err, "inquiry failed");
                tokio::time::sleep(FAILURE_BACKOFF).await;
            }
            let _ = events.send(InquiryEvent::Complete);
        });
    }
}

async fn inquire(
    adapter: &Adapter,
    window: Duration,
    events: &UnboundedSender<InquiryEvent>,
) -> bluer::Result<()> {
    let discovery = adapter.discover_devices().await?;
    pin_mut!(discovery);
    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            () = &mut deadline => break,
            event = discovery.next() => match event {
                Some(AdapterEvent::DeviceAdded(address)) => report(adapter, address, events).await,
                Some(_) => {}
                None => break,
            },
        }
    }

    for address in adapter.device_addresses().await? {
        report(adapter, address, events).await;
    }
    Ok(())
}

async fn report(adapter: &Adapter, address: Address, events: &UnboundedSender<InquiryEvent>) {
    let device = match adapter.device(address) {
        Ok(device) => device,
        Err(err) => {
            tracing::debug!(target: TARGET, %address, error = %err, "device lookup failed");
            return;
        }
    };
    match device.rssi().await {
        Ok(Some(_)) => {
            let name = device.name().await.ok().flatten();
            let _ = events.send(InquiryEvent::Discovered {
                address: address.to_string(),
                name,
            });
        }
        Ok(None) => {}
        Err(err) => tracing::debug!(target: TARGET, %address, error = %err, "RSSI read failed"),
    }
}
