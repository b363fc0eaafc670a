use btleplug::api::CharPropFlags;
use uuid::Uuid;

/// Identifies a discovered peripheral. `id` is the platform's identifier and is what direct
/// reconnection uses; `name` is the advertised name the device was matched on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub id: String,
    pub name: String,
}

impl DeviceHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        DeviceHandle { id: id.into(), name: name.into() }
    }

    pub fn matches_name(&self, wanted: &str) -> bool {
        self.name.to_lowercase().contains(&wanted.to_lowercase())
    }
}

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointDirection {
    Write,
    Notify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
    pub direction: EndpointDirection,
}

/// A characteristic as reported by service enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub service_uuid: Uuid,
    pub uuid: Uuid,
    pub properties: CharPropFlags,
}

impl CharacteristicInfo {
    pub fn supports_notify(&self) -> bool {
        self.properties.contains(CharPropFlags::NOTIFY)
    }

    pub fn supports_write(&self) -> bool {
        self.properties.intersects(CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Discovering,
    Connecting,
    Stabilizing,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Link status reported by the transport for a connected peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// A recovery run re-established the link. The peripheral has lost its last status.
    Reconnected,
    /// A recovery run used up its attempts.
    ReconnectExhausted { attempts: u32 },
}
