//! The boundary to the BLE stack.
//!
//! A [`Transport`] owns at most one physical link. The session layer drives it
//! and never touches the underlying adapter directly, so tests and other BLE
//! stacks can be plugged in by implementing this trait.

use std::time::Duration;

use async_trait::async_trait;
use bluest::Uuid;
use futures_util::stream::BoxStream;
use thiserror::Error;

use crate::address::DeviceAddress;

/// The ring's vendor service.
pub const RING_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40fff0_b5a3_f393_e0a9_e50e24dcca9e);
/// Commands are written here.
pub const WRITE_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// Responses are notified here.
pub const NOTIFY_CHARACTERISTIC_UUID: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("operation timed out")]
    TimedOut,
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("no Bluetooth adapter available")]
    AdapterUnavailable,
    #[error("adapter rejected the request: {0}")]
    AdapterRejected(String),
    #[error("device is already connected to another central")]
    AlreadyConnected,
    #[error("not connected")]
    NotConnected,
    #[error("adapter busy")]
    Busy,
    #[error("link dropped")]
    Disconnected,
}

/// Raw notification payloads in the order the device emitted them. The stream
/// ending means the link is gone.
pub type Notifications = BoxStream<'static, Result<Vec<u8>, TransportError>>;

#[async_trait]
pub trait Transport: Send {
    /// Establish the link to `address`, including service discovery.
    async fn connect(&mut self, address: &DeviceAddress, timeout: Duration) -> Result<(), TransportError>;

    /// Enable notifications on `characteristic`. Notifications emitted after
    /// this returns are guaranteed to show up on the stream.
    async fn subscribe(&mut self, characteristic: Uuid) -> Result<Notifications, TransportError>;

    async fn write(&mut self, characteristic: Uuid, bytes: &[u8]) -> Result<(), TransportError>;

    /// Release the link. Must be safe to call on a link that never fully came up.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
