use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::device::transport::{DeviceStream, LinkEventStream, LinkTransport, NotificationStream};
use crate::device::types::{CharacteristicInfo, DeviceHandle, Endpoint, LinkEvent};
use crate::error::TransportError;

type Registry = Arc<Mutex<HashMap<String, (Adapter, PeripheralId)>>>;

/// [`LinkTransport`] backed by the platform bluetooth stack through btleplug.
///
/// Only the adapter and platform id of a peripheral are remembered. A fresh `Peripheral` is
/// obtained for every operation, so that a handle the platform has closed is never reused.
pub struct BtleTransport {
    adapters: Vec<Adapter>,
    registry: Registry,
}

async fn describe(adapter: &Adapter, registry: &Registry, id: PeripheralId) -> Option<DeviceHandle> {
    let peripheral = match adapter.peripheral(&id).await {
        Ok(peripheral) => peripheral,
        Err(err) => {
            debug!("Peripheral {} disappeared: {:?}", id, err);
            return None;
        },
    };

    match peripheral.properties().await {
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            None
        },
        Ok(None) => None,
        Ok(Some(properties)) => {
            let name = properties.local_name?;
            let handle = DeviceHandle::new(id.to_string(), name);
            registry
                .lock()
                .expect("Failed to lock peripheral registry")
                .insert(handle.id.clone(), (adapter.clone(), id));
            Some(handle)
        },
    }
}

impl BtleTransport {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;

        if adapters.is_empty() {
            return Err(TransportError::NoAdapter);
        }

        for adapter in &adapters {
            info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));
        }

        Ok(BtleTransport {
            adapters,
            registry: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn lookup(&self, id: &str) -> Result<(Adapter, PeripheralId), TransportError> {
        self.registry
            .lock()
            .expect("Failed to lock peripheral registry")
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownDevice { id: id.to_string() })
    }

    async fn peripheral(&self, id: &str) -> Result<Peripheral, TransportError> {
        let (adapter, peripheral_id) = self.lookup(id)?;
        Ok(adapter.peripheral(&peripheral_id).await?)
    }

    fn characteristic(peripheral: &Peripheral, endpoint: &Endpoint) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == endpoint.uuid && c.service_uuid == endpoint.service_uuid)
            .ok_or(TransportError::MissingCharacteristic { uuid: endpoint.uuid })
    }
}

#[async_trait]
impl LinkTransport for BtleTransport {
    async fn known_devices(&self) -> Result<Vec<DeviceHandle>, TransportError> {
        let mut devices = Vec::new();

        for adapter in &self.adapters {
            let peripherals = match adapter.peripherals().await {
                Ok(v) => v,
                Err(err) => {
                    warn!("Failed to query BLE adapter for peripherals: {}", err);
                    continue;
                },
            };

            for peripheral in peripherals {
                if let Some(handle) = describe(adapter, &self.registry, peripheral.id()).await {
                    devices.push(handle);
                }
            }
        }

        Ok(devices)
    }

    async fn scan(&self) -> Result<DeviceStream, TransportError> {
        let mut streams = Vec::new();

        for adapter in &self.adapters {
            // subscribe before scanning so that no discovery event is missed
            let events = adapter.events().await?;
            adapter.start_scan(ScanFilter::default()).await?;

            let adapter = adapter.clone();
            let registry = self.registry.clone();
            let discovered = events.filter_map(move |event| {
                let adapter = adapter.clone();
                let registry = registry.clone();

                async move {
                    match event {
                        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                            describe(&adapter, &registry, id).await
                        },
                        _ => None,
                    }
                }
            });
            streams.push(discovered.boxed());
        }

        Ok(stream::select_all(streams).boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        for adapter in &self.adapters {
            if let Err(err) = adapter.stop_scan().await {
                warn!("Failed to stop scanning: {:?}", err);
            }
        }
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id).await?;
        peripheral.connect().await?;
        Ok(())
    }

    async fn is_connected(&self, id: &str) -> Result<bool, TransportError> {
        let peripheral = self.peripheral(id).await?;
        Ok(peripheral.is_connected().await?)
    }

    async fn services(&self, id: &str) -> Result<Vec<Uuid>, TransportError> {
        let peripheral = self.peripheral(id).await?;
        peripheral.discover_services().await?;
        Ok(peripheral.services().iter().map(|service| service.uuid).collect())
    }

    async fn characteristics(&self, id: &str, service: Uuid) -> Result<Vec<CharacteristicInfo>, TransportError> {
        let peripheral = self.peripheral(id).await?;

        let characteristics = peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics.into_iter())
            .map(|c| CharacteristicInfo {
                service_uuid: c.service_uuid,
                uuid: c.uuid,
                properties: c.properties,
            })
            .collect();

        Ok(characteristics)
    }

    async fn write_without_response(&self, id: &str, endpoint: &Endpoint, data: &[u8]) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id).await?;
        let characteristic = Self::characteristic(&peripheral, endpoint)?;
        peripheral.write(&characteristic, data, WriteType::WithoutResponse).await?;
        Ok(())
    }

    async fn subscribe(&self, id: &str, endpoint: &Endpoint) -> Result<NotificationStream, TransportError> {
        let peripheral = self.peripheral(id).await?;
        let characteristic = Self::characteristic(&peripheral, endpoint)?;

        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(&characteristic).await?;

        let uuid = endpoint.uuid;
        let values = notifications.filter_map(move |data| async move {
            if data.uuid == uuid { Some(data.value) } else { None }
        });

        Ok(values.boxed())
    }

    async fn link_events(&self, id: &str) -> Result<LinkEventStream, TransportError> {
        let (adapter, peripheral_id) = self.lookup(id)?;
        let events = adapter.events().await?;

        let link_events = events.filter_map(move |event| {
            let event = match event {
                CentralEvent::DeviceConnected(id) if id == peripheral_id => Some(LinkEvent::Connected),
                CentralEvent::DeviceDisconnected(id) if id == peripheral_id => Some(LinkEvent::Disconnected),
                _ => None,
            };
            async move { event }
        });

        Ok(link_events.boxed())
    }

    async fn release(&self, id: &str) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id).await?;

        for characteristic in peripheral.characteristics() {
            if characteristic.properties.contains(btleplug::api::CharPropFlags::NOTIFY) {
                if let Err(err) = peripheral.unsubscribe(&characteristic).await {
                    debug!("Failed to unsubscribe from {}: {:?}", characteristic.uuid, err);
                }
            }
        }

        if peripheral.is_connected().await.unwrap_or(false) {
            peripheral.disconnect().await?;
        }

        Ok(())
    }
}
