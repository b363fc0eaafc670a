use std::pin::Pin;
use async_trait::async_trait;
use futures::Stream;
use uuid::Uuid;

use crate::device::types::{CharacteristicInfo, DeviceHandle, Endpoint, LinkEvent};
use crate::error::TransportError;

pub type DeviceStream = Pin<Box<dyn Stream<Item = DeviceHandle> + Send>>;
pub type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;
pub type LinkEventStream = Pin<Box<dyn Stream<Item = LinkEvent> + Send>>;

/// The BLE primitives the connection manager drives. Devices are addressed by
/// [`DeviceHandle::id`], so a cached id can be used to reconnect without scanning.
#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Peripherals the host already knows about (paired or cached), without scanning.
    async fn known_devices(&self) -> Result<Vec<DeviceHandle>, TransportError>;

    /// Starts an active scan. The stream yields every named peripheral as it is seen.
    async fn scan(&self) -> Result<DeviceStream, TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, id: &str) -> Result<(), TransportError>;

    async fn is_connected(&self, id: &str) -> Result<bool, TransportError>;

    /// Enumerates the services of a connected device, bypassing any cached result.
    async fn services(&self, id: &str) -> Result<Vec<Uuid>, TransportError>;

    async fn characteristics(&self, id: &str, service: Uuid) -> Result<Vec<CharacteristicInfo>, TransportError>;

    /// Fire-and-forget write; the peripheral does not acknowledge.
    async fn write_without_response(&self, id: &str, endpoint: &Endpoint, data: &[u8]) -> Result<(), TransportError>;

    async fn subscribe(&self, id: &str, endpoint: &Endpoint) -> Result<NotificationStream, TransportError>;

    /// Connection status changes of a single device.
    async fn link_events(&self, id: &str) -> Result<LinkEventStream, TransportError>;

    /// Unsubscribes, disconnects and drops every handle held for the device.
    async fn release(&self, id: &str) -> Result<(), TransportError>;
}
