//! btleplug Attribute Stack
//!
//! Realizes the platform traits on top of `btleplug`: peripheral lookup, connection and
//! service discovery, CCCD handling through subscribe/unsubscribe and presence events
//! derived from the adapter's connection events.
use crate::api::platform::{AttributeStack, GattService, NotificationConfig, PresenceEvent, ValueChange, WriteStatus};
use crate::core::constants::{CLIENT_CONFIG_DESCRIPTOR_UUID, HEARTRATE_SERVICE_UUID};
use crate::core::error::HrpError;
use crate::model::device::DeviceRef;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use futures::future;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{debug, info, trace};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Enumerates the Bluetooth adapters of the host.
#[async_trait]
pub trait AdapterDiscovery<A: Central> {
    async fn discover_adapters() -> Result<Vec<A>>;
}

#[async_trait]
impl AdapterDiscovery<Adapter> for Adapter {
    async fn discover_adapters() -> Result<Vec<Adapter>> {
        let manager = Manager::new().await?;
        Ok(manager.adapters().await?)
    }
}

/// Attribute stack over one btleplug adapter.
///
/// # Type Parameters
/// - `A`: Bluetooth adapter type
#[derive(Clone, Debug)]
pub struct BtleStack<A: Central + 'static> {
    adapter: A,
}

impl<A: Central + AdapterDiscovery<A> + 'static> BtleStack<A> {
    /// Uses the first adapter of the host.
    pub async fn discover() -> Result<Self> {
        let adapter = A::discover_adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(anyhow!("no Bluetooth adapter found"))?;
        info!("Using Bluetooth adapter {}", adapter.adapter_info().await?);
        Ok(Self::new(adapter))
    }
}

impl<A: Central + 'static> BtleStack<A> {
    pub fn new(adapter: A) -> Self {
        Self { adapter }
    }

    /// Scans for heart rate sensors for `duration`.
    pub async fn scan(&self, duration: Duration) -> Result<Vec<DeviceRef>> {
        self.adapter
            .start_scan(ScanFilter {
                services: vec![HEARTRATE_SERVICE_UUID],
            })
            .await?;
        tokio::time::sleep(duration).await;
        self.adapter.stop_scan().await?;

        let mut devices = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            let name = peripheral
                .properties()
                .await?
                .and_then(|p| p.local_name)
                .unwrap_or_default();
            devices.push(DeviceRef::from_address(name, peripheral.address()));
        }
        devices.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        trace!("Scan found {} devices", devices.len());
        Ok(devices)
    }
}

#[async_trait]
impl<A: Central + 'static> AttributeStack for BtleStack<A> {
    type Service = BtleService<A::Peripheral>;

    async fn open_service(&self, device: &DeviceRef, service_uuid: Uuid) -> Result<Self::Service> {
        let peripheral = self
            .adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.address().to_string() == device.id)
            .ok_or(HrpError::DeviceUnreachable)?;

        if !peripheral.is_connected().await? {
            debug!("Connecting to {}", device);
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;

        if !peripheral.services().iter().any(|s| s.uuid == service_uuid) {
            return Err(anyhow!("service {} not offered by {}", service_uuid, device));
        }
        Ok(BtleService {
            peripheral,
            service_uuid,
        })
    }

    async fn presence_events(&self) -> Result<BoxStream<'static, PresenceEvent>> {
        let adapter = self.adapter.clone();
        let events = self.adapter.events().await?;
        Ok(events
            .filter_map(move |event| {
                let adapter = adapter.clone();
                async move {
                    let (id, connected) = match event {
                        CentralEvent::DeviceConnected(id) => (id, true),
                        CentralEvent::DeviceDisconnected(id) => (id, false),
                        _ => return None,
                    };
                    let peripheral = adapter.peripheral(&id).await.ok()?;
                    Some(PresenceEvent {
                        container_id: peripheral.address().to_string(),
                        connected,
                    })
                }
            })
            .boxed())
    }
}

/// One GATT service of a connected peripheral.
#[derive(Debug)]
pub struct BtleService<P: Peripheral> {
    peripheral: P,
    service_uuid: Uuid,
}

#[async_trait]
impl<P: Peripheral + 'static> GattService for BtleService<P> {
    type Characteristic = Characteristic;

    async fn characteristics(&self, uuid: Uuid) -> Result<Vec<Characteristic>> {
        Ok(self
            .peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == self.service_uuid)
            .flat_map(|s| s.characteristics)
            .filter(|c| c.uuid == uuid)
            .collect())
    }

    async fn require_encryption(&self, _characteristic: &Characteristic) -> Result<()> {
        // btleplug leaves link security to the OS pairing agent.
        Err(HrpError::EncryptionNotSupported.into())
    }

    async fn read_notification_config(&self, characteristic: &Characteristic) -> Result<NotificationConfig> {
        let Some(descriptor) = characteristic
            .descriptors
            .iter()
            .find(|d| d.uuid == CLIENT_CONFIG_DESCRIPTOR_UUID)
        else {
            return Ok(NotificationConfig::None);
        };
        let data = self.peripheral.read_descriptor(descriptor).await?;
        Ok(NotificationConfig::from_bytes(&data))
    }

    async fn write_notification_config(
        &self,
        characteristic: &Characteristic,
        config: NotificationConfig,
    ) -> Result<WriteStatus> {
        let result = match config {
            NotificationConfig::None => self.peripheral.unsubscribe(characteristic).await,
            NotificationConfig::Notify | NotificationConfig::Indicate => {
                self.peripheral.subscribe(characteristic).await
            }
        };
        match result {
            Ok(()) => Ok(WriteStatus::Success),
            Err(btleplug::Error::NotConnected) => Ok(WriteStatus::Unreachable),
            Err(e) => Err(e.into()),
        }
    }

    async fn value_changes(&self, characteristic: &Characteristic) -> Result<BoxStream<'static, ValueChange>> {
        let uuid = characteristic.uuid;
        let notifications = self.peripheral.notifications().await?;
        Ok(notifications
            .filter_map(move |n| {
                future::ready((n.uuid == uuid).then(|| ValueChange {
                    value: n.value,
                    timestamp: OffsetDateTime::now_utc(),
                }))
            })
            .boxed())
    }

    async fn release(&self, characteristic: &Characteristic) -> Result<()> {
        match self.peripheral.unsubscribe(characteristic).await {
            Ok(()) | Err(btleplug::Error::NotConnected) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
