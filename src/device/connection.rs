use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, error, info, warn};
use tokio::spawn;
use tokio::sync::{broadcast, watch, MutexGuard};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use crate::device::constants::{
    CHARACTERISTIC_PAUSE, CONNECT_TIMEOUT, DISCOVERY_TIMEOUT, SERVICE_DISCOVERY_TIMEOUT, STABILIZE_CHECKS,
    STABILIZE_INTERVAL, WRITE_DEADLINE,
};
use crate::device::heartbeat::{HeartbeatMonitor, LastHeartbeat};
use crate::device::reconnect::{ReconnectResult, ReconnectionController, Relink};
use crate::device::selector::{select_endpoints, EndpointSelection};
use crate::device::transport::{LinkEventStream, LinkTransport};
use crate::device::types::{ConnectionState, DeviceEvent, DeviceHandle, Endpoint, LinkEvent};
use crate::error::{ConnectError, SendError};

const EVENT_CAPACITY: usize = 16;

// Everything that only exists while connected. Dropping it stops the heartbeat and link observer
// tasks of this link.
#[derive(Debug)]
struct ActiveLink {
    device: DeviceHandle,
    command: Endpoint,
    heartbeat: Option<Endpoint>,
    cancel: CancellationToken,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug)]
enum LinkSlot {
    Idle(ConnectionState),
    Connected(ActiveLink),
}

impl LinkSlot {
    fn state(&self) -> ConnectionState {
        match self {
            LinkSlot::Idle(state) => *state,
            LinkSlot::Connected(_) => ConnectionState::Connected,
        }
    }
}

struct Inner {
    transport: Arc<dyn LinkTransport>,
    device_name: String,
    // all state transitions happen while holding this lock
    slot: tokio::sync::Mutex<LinkSlot>,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<DeviceEvent>,
    last_known_device: Mutex<Option<DeviceHandle>>,
    last_heartbeat: LastHeartbeat,
    reconnect: ReconnectionController,
    shutdown: CancellationToken,
}

/// Owns the link to one peripheral: discovery, connecting, endpoint selection, sending, and
/// recovery after an unexpected disconnect. Cheap to clone; clones share the same link.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn LinkTransport>, device_name: impl Into<String>, shutdown: CancellationToken) -> Self {
        Self::with_reconnection(transport, device_name, ReconnectionController::default(), shutdown)
    }

    pub fn with_reconnection(
        transport: Arc<dyn LinkTransport>,
        device_name: impl Into<String>,
        reconnect: ReconnectionController,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        ConnectionManager {
            inner: Arc::new(Inner {
                transport,
                device_name: device_name.into(),
                slot: tokio::sync::Mutex::new(LinkSlot::Idle(ConnectionState::Disconnected)),
                state,
                events,
                last_known_device: Mutex::new(None),
                last_heartbeat: LastHeartbeat::default(),
                reconnect,
                shutdown,
            }),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.inner.device_name
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnect.is_running()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect.attempts()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    pub fn last_known_device(&self) -> Option<DeviceHandle> {
        self.inner.last_known_device.lock().expect("Failed to lock last known device").clone()
    }

    pub fn last_heartbeat(&self) -> Option<Instant> {
        self.inner.last_heartbeat.get()
    }

    /// The endpoints in use, if connected.
    pub async fn endpoints(&self) -> Option<EndpointSelection> {
        match &*self.inner.slot.lock().await {
            LinkSlot::Connected(link) => Some(EndpointSelection { command: link.command, heartbeat: link.heartbeat }),
            LinkSlot::Idle(_) => None,
        }
    }

    fn emit(&self, event: DeviceEvent) {
        // no receivers is fine
        let _ = self.inner.events.send(event);
    }

    fn replace_slot(&self, slot: &mut MutexGuard<'_, LinkSlot>, new_slot: LinkSlot) {
        let previous = slot.state();
        **slot = new_slot;
        let current = slot.state();

        if previous != current {
            info!("Connection state {} -> {}", previous, current);
            self.inner.state.send_replace(current);
        }
    }

    async fn set_state(&self, state: ConnectionState) {
        debug_assert_ne!(state, ConnectionState::Connected);
        let mut slot = self.inner.slot.lock().await;
        self.replace_slot(&mut slot, LinkSlot::Idle(state));
    }

    // the state to fall back to after a failed attempt
    fn idle_state(&self) -> ConnectionState {
        if self.inner.reconnect.is_running() {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Disconnected
        }
    }

    async fn connected_device(&self) -> Option<DeviceHandle> {
        match &*self.inner.slot.lock().await {
            LinkSlot::Connected(link) => Some(link.device.clone()),
            LinkSlot::Idle(_) => None,
        }
    }

    /// Finds the peripheral, connects and prepares it for sending. A known (paired or cached)
    /// device is tried first, then an active scan.
    pub async fn connect(&self) -> Result<DeviceHandle, ConnectError> {
        if let Some(device) = self.connected_device().await {
            return Ok(device);
        }

        self.set_state(ConnectionState::Discovering).await;

        let result = self.discover_and_connect().await;
        if let Err(err) = &result {
            warn!("Connecting to {:?} failed: {}", self.inner.device_name, err);
            self.set_state(self.idle_state()).await;
        }
        result
    }

    async fn discover_and_connect(&self) -> Result<DeviceHandle, ConnectError> {
        match self.find_known_device().await {
            Some(device) => {
                info!("Found known peripheral {}", device);
                match self.connect_device(&device).await {
                    Ok(()) => return Ok(device),
                    Err(ConnectError::Cancelled) => return Err(ConnectError::Cancelled),
                    Err(err) => warn!("Failed to connect to known peripheral ({}), trying scan...", err),
                }
                self.set_state(ConnectionState::Discovering).await;
            },
            None => debug!("No known peripheral matches {:?}", self.inner.device_name),
        }

        let device = self.scan_for_device().await?;
        self.connect_device(&device).await?;
        Ok(device)
    }

    async fn find_known_device(&self) -> Option<DeviceHandle> {
        match self.inner.transport.known_devices().await {
            Ok(devices) => devices.into_iter().find(|device| device.matches_name(&self.inner.device_name)),
            Err(err) => {
                warn!("Error checking for known peripherals: {}", err);
                None
            },
        }
    }

    // First match wins; the signal strength of multiple peripherals with the same name is not
    // compared.
    async fn scan_for_device(&self) -> Result<DeviceHandle, ConnectError> {
        let name = self.inner.device_name.clone();
        info!("Scanning for {:?}...", name);

        let mut devices = self.inner.transport.scan().await?;
        let first_match = async {
            while let Some(device) = devices.next().await {
                if device.matches_name(&name) {
                    return Some(device);
                }
                debug!("Ignoring peripheral {}", device);
            }
            None
        };

        let found = tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(ConnectError::Cancelled),
            found = timeout(DISCOVERY_TIMEOUT, first_match) => Ok(found),
        };

        if let Err(err) = self.inner.transport.stop_scan().await {
            warn!("Failed to stop scanning: {}", err);
        }

        match found? {
            Ok(Some(device)) => {
                info!("Found peripheral {}", device);
                Ok(device)
            },
            Ok(None) | Err(_) => Err(ConnectError::DeviceNotFound { name }),
        }
    }

    async fn connect_device(&self, device: &DeviceHandle) -> Result<(), ConnectError> {
        self.set_state(ConnectionState::Connecting).await;
        info!("Connecting to {}...", device);

        let connected = tokio::select! {
            _ = self.inner.shutdown.cancelled() => Err(ConnectError::Cancelled),
            connected = timeout(CONNECT_TIMEOUT, self.inner.transport.connect(&device.id)) => match connected {
                Err(_) => Err(ConnectError::ConnectTimeout),
                Ok(Err(err)) => Err(err.into()),
                Ok(Ok(())) => Ok(()),
            },
        };

        // a failed or abandoned connect may still leave a half-open link behind
        let result = match connected {
            Ok(()) => self.establish(device).await,
            Err(err) => Err(err),
        };
        if result.is_err() {
            self.release_transport(device).await;
        }
        result
    }

    async fn establish(&self, device: &DeviceHandle) -> Result<(), ConnectError> {
        self.stabilize(device).await?;

        let selection = self.discover_endpoints(device).await?;
        info!("Using command characteristic {}", selection.command.uuid);

        let link_cancel = self.inner.shutdown.child_token();

        if let Some(heartbeat) = &selection.heartbeat {
            info!("Using heartbeat characteristic {}", heartbeat.uuid);
            // the heartbeat is only observed, so failing to subscribe is not fatal
            match self.inner.transport.subscribe(&device.id, heartbeat).await {
                Ok(notifications) => {
                    HeartbeatMonitor::new(self.inner.last_heartbeat.clone())
                        .spawn(link_cancel.clone(), notifications);
                },
                Err(err) => warn!("Failed to subscribe to heartbeat: {}", err),
            }
        }

        let link_events = match self.inner.transport.link_events(&device.id).await {
            Ok(link_events) => link_events,
            Err(err) => {
                link_cancel.cancel();
                return Err(err.into());
            },
        };

        self.inner.reconnect.reset_budget();
        *self.inner.last_known_device.lock().expect("Failed to lock last known device") = Some(device.clone());

        {
            let mut slot = self.inner.slot.lock().await;
            let link = ActiveLink {
                device: device.clone(),
                command: selection.command,
                heartbeat: selection.heartbeat,
                cancel: link_cancel.clone(),
            };
            self.replace_slot(&mut slot, LinkSlot::Connected(link));
        }

        self.spawn_link_observer(device.id.clone(), link_events, link_cancel);
        info!("Peripheral {} ready", device);
        Ok(())
    }

    // Some peripherals drop the link again while the radio negotiates connection parameters.
    // Discovering services on such a link fails with misleading errors.
    async fn stabilize(&self, device: &DeviceHandle) -> Result<(), ConnectError> {
        self.set_state(ConnectionState::Stabilizing).await;

        for check in 1..=STABILIZE_CHECKS {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Err(ConnectError::Cancelled),
                _ = sleep(STABILIZE_INTERVAL) => {},
            }

            let connected = match self.inner.transport.is_connected(&device.id).await {
                Ok(connected) => connected,
                Err(err) => {
                    warn!("Error checking for connection state: {}", err);
                    false
                },
            };

            if !connected {
                warn!("Connection unstable at check {}/{}", check, STABILIZE_CHECKS);
                return Err(ConnectError::UnstableLink { check });
            }
        }

        Ok(())
    }

    async fn discover_endpoints(&self, device: &DeviceHandle) -> Result<EndpointSelection, ConnectError> {
        let transport = &self.inner.transport;

        let services = match timeout(SERVICE_DISCOVERY_TIMEOUT, transport.services(&device.id)).await {
            Err(_) => {
                return Err(ConnectError::ServiceDiscoveryFailed {
                    code: None,
                    reason: format!("timed out after {}", humantime::format_duration(SERVICE_DISCOVERY_TIMEOUT)),
                });
            },
            Ok(Err(err)) => {
                return Err(ConnectError::ServiceDiscoveryFailed { code: err.protocol_code(), reason: err.to_string() });
            },
            Ok(Ok(services)) => services,
        };
        info!("Found {} services", services.len());

        let mut characteristics = Vec::new();
        for service in services {
            sleep(CHARACTERISTIC_PAUSE).await;

            match transport.characteristics(&device.id, service).await {
                Ok(found) => {
                    debug!("Service {}: {} characteristics", service, found.len());
                    characteristics.extend(found);
                },
                Err(err) => warn!("Failed to get characteristics of service {}: {}", service, err),
            }
        }

        select_endpoints(&characteristics).ok_or(ConnectError::NoWritableEndpoint)
    }

    fn spawn_link_observer(&self, device_id: String, mut link_events: LinkEventStream, cancel: CancellationToken) {
        let manager = self.clone();

        spawn(async move {
            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    event = link_events.next() => match event {
                        Some(LinkEvent::Disconnected) => {
                            manager.handle_link_down(&device_id).await;
                            break 'mainloop;
                        },
                        Some(LinkEvent::Connected) => debug!("Link to {} reported connected", device_id),
                        None => {
                            debug!("Link event stream of {} ended", device_id);
                            break 'mainloop;
                        },
                    },
                }
            }
        });
    }

    async fn handle_link_down(&self, device_id: &str) {
        {
            let mut slot = self.inner.slot.lock().await;
            match &*slot {
                LinkSlot::Connected(link) if link.device.id == device_id => {},
                _ => return,
            }

            warn!(
                "Peripheral disconnected at {}",
                humantime::format_rfc3339_seconds(SystemTime::now()),
            );
            self.replace_slot(&mut slot, LinkSlot::Idle(ConnectionState::Disconnected));
        }

        self.ensure_reconnecting();
    }

    /// Starts a recovery run unless one is already active or the link is up. Never blocks.
    pub fn ensure_reconnecting(&self) -> bool {
        if self.inner.shutdown.is_cancelled() || self.is_connected() {
            return false;
        }

        self.inner.reconnect.trigger(self.clone(), self.inner.shutdown.clone())
    }

    /// Writes one byte to the command characteristic. Fails fast when not connected. A failed
    /// write marks the link as down but does not start recovery; that is up to the caller.
    pub async fn send(&self, value: u8) -> Result<(), SendError> {
        let mut slot = self.inner.slot.lock().await;

        let (device_id, command) = match &*slot {
            LinkSlot::Connected(link) => (link.device.id.clone(), link.command),
            LinkSlot::Idle(_) => return Err(SendError::NotConnected),
        };

        let payload = [value];
        let write = self.inner.transport.write_without_response(&device_id, &command, &payload);
        let result = match timeout(WRITE_DEADLINE, write).await {
            Err(_) => Err(SendError::WriteTimeout),
            Ok(Err(err)) => Err(SendError::SendFailed { source: err }),
            Ok(Ok(())) => Ok(()),
        };

        if let Err(err) = &result {
            warn!("Failed to send {} to {}: {}", value, device_id, err);
            self.replace_slot(&mut slot, LinkSlot::Idle(ConnectionState::Disconnected));
        }

        result
    }

    async fn release_transport(&self, device: &DeviceHandle) {
        if let Err(err) = self.inner.transport.release(&device.id).await {
            debug!("Failed to release {}: {}", device, err);
        }
    }

    /// Marks the service as unable to start; used when the initial connect failed.
    pub async fn mark_failed(&self) {
        self.set_state(ConnectionState::Failed).await;
    }

    /// Stops recovery and tears the link down. `shutdown` must have been cancelled for a running
    /// recovery to stop.
    pub async fn close(&self) -> Option<ReconnectResult> {
        let outcome = self.inner.reconnect.join().await;
        self.release_link().await;
        self.set_state(ConnectionState::Disconnected).await;
        outcome
    }
}

#[async_trait]
impl Relink for ConnectionManager {
    async fn release_link(&self) {
        let released = {
            let mut slot = self.inner.slot.lock().await;
            let device = match &*slot {
                LinkSlot::Connected(link) => Some(link.device.clone()),
                LinkSlot::Idle(_) => None,
            };
            if device.is_some() {
                let state = self.idle_state();
                self.replace_slot(&mut slot, LinkSlot::Idle(state));
            }
            device
        };

        if let Some(device) = released.or_else(|| self.last_known_device()) {
            debug!("Releasing {}", device);
            self.release_transport(&device).await;
        }
    }

    async fn reconnect_cached(&self) -> Result<DeviceHandle, ConnectError> {
        let device = self
            .last_known_device()
            .ok_or_else(|| ConnectError::DeviceNotFound { name: self.inner.device_name.clone() })?;

        info!("Reconnecting to cached peripheral {}", device);
        let result = self.connect_device(&device).await;
        if result.is_err() {
            self.set_state(self.idle_state()).await;
        }
        result.map(|_| device)
    }

    async fn connect(&self) -> Result<DeviceHandle, ConnectError> {
        ConnectionManager::connect(self).await
    }

    async fn mark_reconnecting(&self) {
        self.set_state(ConnectionState::Reconnecting).await;
    }

    fn is_linked(&self) -> bool {
        self.is_connected()
    }

    fn relink(&self) {
        self.ensure_reconnecting();
    }

    async fn recovered(&self, device: &DeviceHandle) {
        debug!("Link to {} recovered", device);
        self.emit(DeviceEvent::Reconnected);
    }

    async fn gave_up(&self, attempts: u32) {
        error!("Peripheral link is down; giving up after {} attempts until the next send", attempts);
        self.set_state(ConnectionState::Disconnected).await;
        self.emit(DeviceEvent::ReconnectExhausted { attempts });
    }
}
