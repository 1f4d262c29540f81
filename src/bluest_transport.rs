//! [`Transport`] on top of the platform BLE stack via `bluest`.
//!
//! The ring exposes a Nordic UART style service: commands go to one
//! characteristic and every response comes back as a notification on another.
//! `bluest` hands out notifications as a stream borrowed from the
//! characteristic, so a spawned task owns that stream and forwards each
//! payload into a channel the session can pull from.

use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device, Uuid};
use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::address::DeviceAddress;
use crate::transport::{
    Notifications, Transport, TransportError, NOTIFY_CHARACTERISTIC_UUID, RING_SERVICE_UUID,
    WRITE_CHARACTERISTIC_UUID,
};

fn rejected(err: bluest::Error) -> TransportError {
    TransportError::AdapterRejected(err.to_string())
}

/// Whether a platform device id refers to `address`.
///
/// Linux and Windows ids embed the MAC with `_` or `-` separators; macOS ids
/// are opaque UUIDs and never match, so those rings have to be found by name.
fn id_matches(id: &str, address: &DeviceAddress) -> bool {
    let normalised = id.to_ascii_uppercase().replace(['_', '-'], ":");
    normalised.contains(address.as_str())
}

struct Link {
    write: Characteristic,
    notify: Characteristic,
}

pub struct BluestTransport {
    adapter: Option<Adapter>,
    /// Advertised name to accept when the platform hides the MAC address.
    name: Option<String>,
    device: Option<Device>,
    link: Option<Link>,
    forwarder: Option<JoinHandle<()>>,
}

impl Default for BluestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl BluestTransport {
    pub fn new() -> Self {
        Self { adapter: None, name: None, device: None, link: None, forwarder: None }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    async fn adapter(&mut self) -> Result<Adapter, TransportError> {
        if let Some(adapter) = &self.adapter {
            return Ok(adapter.clone());
        }
        let adapter = Adapter::default().await.ok_or(TransportError::AdapterUnavailable)?;
        adapter.wait_available().await.map_err(rejected)?;
        self.adapter = Some(adapter.clone());
        Ok(adapter)
    }

    async fn is_ring(&self, device: &Device, address: &DeviceAddress) -> bool {
        if id_matches(&format!("{:?}", device.id()), address) {
            return true;
        }
        match (&self.name, device.name_async().await) {
            (Some(wanted), Ok(name)) => name == *wanted,
            _ => false,
        }
    }

    async fn discover_device(&self, adapter: &Adapter, address: &DeviceAddress) -> Result<Device, TransportError> {
        // the OS may already hold a link to the ring
        if let Ok(devices) = adapter.connected_devices_with_services(&[RING_SERVICE_UUID]).await {
            for device in devices {
                if self.is_ring(&device, address).await {
                    return Ok(device);
                }
            }
        }

        let mut adapter_events = adapter.scan(&[]).await.map_err(rejected)?;
        while let Some(found) = adapter_events.next().await {
            if self.is_ring(&found.device, address).await {
                debug!(%address, rssi = ?found.rssi, "found ring");
                return Ok(found.device);
            }
        }

        Err(TransportError::DeviceNotFound(address.to_string()))
    }

    async fn discover_link(device: &Device) -> Result<Link, TransportError> {
        let service = device
            .discover_services_with_uuid(RING_SERVICE_UUID)
            .await
            .map_err(rejected)?
            .first()
            .ok_or_else(|| TransportError::AdapterRejected("the device does not have the ring service".into()))?
            .clone();
        let write = service
            .discover_characteristics_with_uuid(WRITE_CHARACTERISTIC_UUID)
            .await
            .map_err(rejected)?
            .first()
            .ok_or_else(|| TransportError::AdapterRejected("the ring service has no write characteristic".into()))?
            .clone();
        let notify = service
            .discover_characteristics_with_uuid(NOTIFY_CHARACTERISTIC_UUID)
            .await
            .map_err(rejected)?
            .first()
            .ok_or_else(|| TransportError::AdapterRejected("the ring service has no notify characteristic".into()))?
            .clone();
        Ok(Link { write, notify })
    }
}

#[async_trait]
impl Transport for BluestTransport {
    async fn connect(&mut self, address: &DeviceAddress, connect_timeout: Duration) -> Result<(), TransportError> {
        if self.device.is_some() {
            return Err(TransportError::AlreadyConnected);
        }
        let adapter = self.adapter().await?;

        let device = timeout(connect_timeout, self.discover_device(&adapter, address))
            .await
            .map_err(|_| TransportError::DeviceNotFound(address.to_string()))??;

        // remembered before connecting so an interrupted connect can still be released
        self.device = Some(device.clone());
        if !device.is_connected().await {
            adapter.connect_device(&device).await.map_err(rejected)?;
        }

        self.link = Some(Self::discover_link(&device).await?);
        info!(%address, "link up");
        Ok(())
    }

    async fn subscribe(&mut self, characteristic: Uuid) -> Result<Notifications, TransportError> {
        let link = self.link.as_ref().ok_or(TransportError::NotConnected)?;
        if characteristic != NOTIFY_CHARACTERISTIC_UUID {
            return Err(TransportError::AdapterRejected(format!("cannot subscribe to {characteristic}")));
        }

        let notify = link.notify.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let forwarder = tokio::spawn(async move {
            let mut reader = match notify.notify().await {
                Ok(reader) => {
                    let _ = ready_tx.send(Ok(()));
                    reader
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(rejected(err)));
                    return;
                }
            };
            while let Some(item) = reader.next().await {
                if tx.send(item.map_err(rejected)).is_err() {
                    break;
                }
            }
            debug!("end of notification stream");
        });

        match ready_rx.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => return Err(err),
            Err(_) => return Err(TransportError::Disconnected),
        }
        if let Some(previous) = self.forwarder.replace(forwarder) {
            previous.abort();
        }

        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed())
    }

    async fn write(&mut self, characteristic: Uuid, bytes: &[u8]) -> Result<(), TransportError> {
        let (Some(device), Some(link)) = (&self.device, &self.link) else {
            return Err(TransportError::NotConnected);
        };
        if characteristic != WRITE_CHARACTERISTIC_UUID {
            return Err(TransportError::AdapterRejected(format!("cannot write to {characteristic}")));
        }
        if !device.is_connected().await {
            return Err(TransportError::Disconnected);
        }
        link.write.write(bytes).await.map_err(rejected)
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.link = None;
        let Some(device) = self.device.take() else {
            return Ok(());
        };
        let Some(adapter) = &self.adapter else {
            return Ok(());
        };
        if let Err(err) = adapter.disconnect_device(&device).await {
            warn!("disconnect failed: {err}");
            return Err(rejected(err));
        }
        Ok(())
    }
}

#[test]
fn test_id_matches_linux_style_ids() {
    let address: DeviceAddress = "AA:BB:CC:DD:EE:0F".parse().unwrap();
    assert!(id_matches("DeviceId(/org/bluez/hci0/dev_AA_BB_CC_DD_EE_0F)", &address));
    assert!(id_matches("aa-bb-cc-dd-ee-0f", &address));
}

#[test]
fn test_id_matches_rejects_other_devices() {
    let address: DeviceAddress = "AA:BB:CC:DD:EE:0F".parse().unwrap();
    assert!(!id_matches("DeviceId(/org/bluez/hci0/dev_AA_BB_CC_DD_EE_10)", &address));
    assert!(!id_matches("DeviceId(6F9A1B2C-0000-4000-8000-00805F9B34FB)", &address));
}
