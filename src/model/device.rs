//! Device Model
//!
//! Opaque reference to the physical heart rate sensor a session talks to.

use btleplug::api::BDAddr;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the sensor bound to a session.
///
/// Contains:
/// - The platform identity used to open the device
/// - A human-readable name
/// - The container id presence events are keyed by
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceRef {
    pub id: String,
    pub name: String,
    pub container_id: String,
}

impl DeviceRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, container_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            container_id: container_id.into(),
        }
    }

    /// Builds a reference for a BLE peripheral. The address doubles as container id,
    /// since presence events of the btleplug stack are keyed by peripheral.
    pub fn from_address(name: impl Into<String>, address: BDAddr) -> Self {
        let id = address.to_string();
        Self {
            container_id: id.clone(),
            id,
            name: name.into(),
        }
    }
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_address_uses_address_as_container() {
        let address = BDAddr::from([0xAA, 0xBB, 0xCC, 0x00, 0x11, 0x22]);
        let device = DeviceRef::from_address("Strap", address);
        assert_eq!(device.id, address.to_string());
        assert_eq!(device.container_id, device.id);
        assert_eq!(device.name, "Strap");
    }
}
