use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use btleplug::api::CharPropFlags;
use futures::channel::mpsc;
use futures::stream::{self, StreamExt};
use uuid::Uuid;

use presence_beacon::device::transport::{DeviceStream, LinkEventStream, LinkTransport, NotificationStream};
use presence_beacon::device::types::{CharacteristicInfo, DeviceHandle, Endpoint, LinkEvent};
use presence_beacon::error::TransportError;

pub const LIGHT_ID: &str = "c7:39:5a:0b:11:42";
pub const LIGHT_NAME: &str = "RFduino";

pub const FALLBACK_SERVICE: Uuid = Uuid::from_u128(0x0000fe84_0000_1000_8000_00805f9b34fb);
pub const HEARTBEAT: Uuid = Uuid::from_u128(0x2d30c082_f39f_4ce6_923f_3484ea480596);
pub const COMMAND: Uuid = Uuid::from_u128(0x2d30c083_f39f_4ce6_923f_3484ea480596);

pub fn light() -> DeviceHandle {
    DeviceHandle::new(LIGHT_ID, LIGHT_NAME)
}

pub fn light_characteristics() -> Vec<CharacteristicInfo> {
    vec![
        CharacteristicInfo { service_uuid: FALLBACK_SERVICE, uuid: HEARTBEAT, properties: CharPropFlags::NOTIFY },
        CharacteristicInfo {
            service_uuid: FALLBACK_SERVICE,
            uuid: COMMAND,
            properties: CharPropFlags::WRITE_WITHOUT_RESPONSE,
        },
    ]
}

#[derive(Default)]
struct SimState {
    known: Vec<DeviceHandle>,
    advertised: Vec<DeviceHandle>,
    characteristics: Vec<CharacteristicInfo>,
    unstable: bool,
    fail_connects: u32,
    hang_connects: bool,
    service_error: Option<u8>,
    hang_services: bool,
    fail_writes: u32,
    drop_next_link: bool,
    connected: Option<String>,
    writes: Vec<u8>,
    connects: u32,
    scans: u32,
    releases: u32,
    link_events: Option<mpsc::UnboundedSender<LinkEvent>>,
    notifications: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

/// An in-memory radio with one scriptable peripheral.
#[derive(Default)]
pub struct SimTransport {
    state: Mutex<SimState>,
}

impl SimTransport {
    /// A light that advertises itself but is not known to the host yet.
    pub fn advertising() -> Arc<Self> {
        let sim = SimTransport::default();
        {
            let mut state = sim.state.lock().unwrap();
            state.advertised = vec![DeviceHandle::new("aa:bb:cc:dd:ee:ff", "Headphones"), light()];
            state.characteristics = light_characteristics();
        }
        Arc::new(sim)
    }

    /// A light the host has already paired with.
    pub fn paired() -> Arc<Self> {
        let sim = Self::advertising();
        sim.state.lock().unwrap().known = vec![light()];
        sim
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(SimTransport::default())
    }

    pub fn set_characteristics(&self, characteristics: Vec<CharacteristicInfo>) {
        self.state.lock().unwrap().characteristics = characteristics;
    }

    pub fn set_unstable(&self, unstable: bool) {
        self.state.lock().unwrap().unstable = unstable;
    }

    /// The next `count` connects fail.
    pub fn fail_connects(&self, count: u32) {
        self.state.lock().unwrap().fail_connects = count;
    }

    /// Connects never complete.
    pub fn set_hang_connects(&self, hang: bool) {
        self.state.lock().unwrap().hang_connects = hang;
    }

    /// Service enumeration fails with the given GATT status.
    pub fn set_service_error(&self, code: Option<u8>) {
        self.state.lock().unwrap().service_error = code;
    }

    /// Service enumeration never completes.
    pub fn set_hang_services(&self, hang: bool) {
        self.state.lock().unwrap().hang_services = hang;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_next_writes(if fail { u32::MAX } else { 0 });
    }

    /// The next `count` writes fail.
    pub fn fail_next_writes(&self, count: u32) {
        self.state.lock().unwrap().fail_writes = count;
    }

    /// The next link that is set up drops again as soon as it is being observed.
    pub fn drop_next_link(&self) {
        self.state.lock().unwrap().drop_next_link = true;
    }

    pub fn is_radio_connected(&self) -> bool {
        self.state.lock().unwrap().connected.is_some()
    }

    /// The peripheral drops the link, e.g. because it went out of range.
    pub fn drop_link(&self) {
        let mut state = self.state.lock().unwrap();
        state.connected = None;
        if let Some(sender) = &state.link_events {
            let _ = sender.unbounded_send(LinkEvent::Disconnected);
        }
    }

    pub fn notify(&self, data: &[u8]) {
        let state = self.state.lock().unwrap();
        if let Some(sender) = &state.notifications {
            let _ = sender.unbounded_send(data.to_vec());
        }
    }

    pub fn writes(&self) -> Vec<u8> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn connects(&self) -> u32 {
        self.state.lock().unwrap().connects
    }

    pub fn scans(&self) -> u32 {
        self.state.lock().unwrap().scans
    }

    pub fn releases(&self) -> u32 {
        self.state.lock().unwrap().releases
    }

    fn require_connected(&self, id: &str) -> Result<(), TransportError> {
        match &self.state.lock().unwrap().connected {
            Some(connected) if connected == id => Ok(()),
            _ => Err(TransportError::Closed),
        }
    }
}

#[async_trait]
impl LinkTransport for SimTransport {
    async fn known_devices(&self) -> Result<Vec<DeviceHandle>, TransportError> {
        Ok(self.state.lock().unwrap().known.clone())
    }

    async fn scan(&self) -> Result<DeviceStream, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.scans += 1;
        // a real scan never ends on its own
        let advertised = stream::iter(state.advertised.clone()).chain(stream::pending());
        Ok(Box::pin(advertised))
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<(), TransportError> {
        let hang = {
            let mut state = self.state.lock().unwrap();
            state.connects += 1;
            state.hang_connects
        };
        if hang {
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock().unwrap();

        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(TransportError::Protocol { code: 0x05 });
        }

        let exists = state.known.iter().chain(state.advertised.iter()).any(|device| device.id == id);
        if !exists {
            return Err(TransportError::UnknownDevice { id: id.to_string() });
        }

        state.connected = Some(id.to_string());
        Ok(())
    }

    async fn is_connected(&self, id: &str) -> Result<bool, TransportError> {
        let state = self.state.lock().unwrap();
        Ok(!state.unstable && state.connected.as_deref() == Some(id))
    }

    async fn services(&self, id: &str) -> Result<Vec<Uuid>, TransportError> {
        self.require_connected(id)?;
        let hang = self.state.lock().unwrap().hang_services;
        if hang {
            std::future::pending::<()>().await;
        }

        let state = self.state.lock().unwrap();
        if let Some(code) = state.service_error {
            return Err(TransportError::Protocol { code });
        }
        let services: BTreeSet<Uuid> = state.characteristics.iter().map(|info| info.service_uuid).collect();
        Ok(services.into_iter().collect())
    }

    async fn characteristics(&self, id: &str, service: Uuid) -> Result<Vec<CharacteristicInfo>, TransportError> {
        self.require_connected(id)?;
        let state = self.state.lock().unwrap();
        Ok(state.characteristics.iter().filter(|info| info.service_uuid == service).copied().collect())
    }

    async fn write_without_response(&self, id: &str, endpoint: &Endpoint, data: &[u8]) -> Result<(), TransportError> {
        self.require_connected(id)?;
        let mut state = self.state.lock().unwrap();
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(TransportError::Closed);
        }
        if !state.characteristics.iter().any(|info| info.uuid == endpoint.uuid) {
            return Err(TransportError::MissingCharacteristic { uuid: endpoint.uuid });
        }
        state.writes.extend_from_slice(data);
        Ok(())
    }

    async fn subscribe(&self, id: &str, _endpoint: &Endpoint) -> Result<NotificationStream, TransportError> {
        self.require_connected(id)?;
        let (sender, receiver) = mpsc::unbounded();
        self.state.lock().unwrap().notifications = Some(sender);
        Ok(Box::pin(receiver))
    }

    async fn link_events(&self, id: &str) -> Result<LinkEventStream, TransportError> {
        self.require_connected(id)?;
        let (sender, receiver) = mpsc::unbounded();
        let mut state = self.state.lock().unwrap();
        if state.drop_next_link {
            state.drop_next_link = false;
            state.connected = None;
            let _ = sender.unbounded_send(LinkEvent::Disconnected);
        }
        state.link_events = Some(sender);
        Ok(Box::pin(receiver))
    }

    async fn release(&self, _id: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        state.releases += 1;
        state.connected = None;
        state.link_events = None;
        state.notifications = None;
        Ok(())
    }
}
