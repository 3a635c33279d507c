//! Platform Attribute Protocol API
//!
//! The capabilities the session needs from the underlying GATT stack. The stack itself is
//! not implemented here; `components::btle` realizes these traits on top of btleplug and
//! tests substitute fakes.
use crate::model::device::DeviceRef;
use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt::Debug;
use time::OffsetDateTime;
use uuid::Uuid;

/// Value of the client characteristic configuration descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationConfig {
    None,
    Notify,
    Indicate,
}

impl NotificationConfig {
    /// Descriptor bytes (little-endian bit field).
    pub fn to_bytes(self) -> [u8; 2] {
        match self {
            NotificationConfig::None => [0x00, 0x00],
            NotificationConfig::Notify => [0x01, 0x00],
            NotificationConfig::Indicate => [0x02, 0x00],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Self {
        match data.first() {
            Some(b) if b & 0x01 != 0 => NotificationConfig::Notify,
            Some(b) if b & 0x02 != 0 => NotificationConfig::Indicate,
            _ => NotificationConfig::None,
        }
    }
}

/// Outcome of a notification configuration write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    Success,
    /// The device could not be reached; not an error for the caller.
    Unreachable,
}

/// One value changed notification.
#[derive(Clone, Debug, PartialEq)]
pub struct ValueChange {
    pub value: Vec<u8>,
    pub timestamp: OffsetDateTime,
}

/// Connection state change of a device container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PresenceEvent {
    pub container_id: String,
    pub connected: bool,
}

/// An opened GATT service of one device.
#[async_trait]
pub trait GattService: Send + Sync + 'static {
    /// Platform handle of one characteristic.
    type Characteristic: Clone + Debug + Send + Sync + 'static;

    /// Characteristics matching `uuid`, in enumeration order.
    async fn characteristics(&self, uuid: Uuid) -> Result<Vec<Self::Characteristic>>;

    /// Requests that further operations run over an encrypted link.
    async fn require_encryption(&self, characteristic: &Self::Characteristic) -> Result<()>;

    async fn read_notification_config(
        &self,
        characteristic: &Self::Characteristic,
    ) -> Result<NotificationConfig>;

    async fn write_notification_config(
        &self,
        characteristic: &Self::Characteristic,
        config: NotificationConfig,
    ) -> Result<WriteStatus>;

    /// Stream of value changes of `characteristic`.
    async fn value_changes(
        &self,
        characteristic: &Self::Characteristic,
    ) -> Result<BoxStream<'static, ValueChange>>;

    /// Releases the platform subscription of `characteristic`.
    async fn release(&self, characteristic: &Self::Characteristic) -> Result<()>;
}

/// Entry point into the platform stack.
#[async_trait]
pub trait AttributeStack: Send + Sync + 'static {
    type Service: GattService;

    /// Resolves `device` and opens its service `service_uuid`.
    async fn open_service(&self, device: &DeviceRef, service_uuid: Uuid) -> Result<Self::Service>;

    /// Stream of device presence changes.
    async fn presence_events(&self) -> Result<BoxStream<'static, PresenceEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_config_bytes() {
        assert_eq!(NotificationConfig::from_bytes(&NotificationConfig::Notify.to_bytes()), NotificationConfig::Notify);
        assert_eq!(NotificationConfig::from_bytes(&[0x02, 0x00]), NotificationConfig::Indicate);
        assert_eq!(NotificationConfig::from_bytes(&[]), NotificationConfig::None);
    }
}
