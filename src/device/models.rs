use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serialport::{SerialPortInfo, SerialPortType};
use uuid::Uuid;

use crate::transport::TransportKind;

/// One enumerated candidate, as shown to the connection picker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceListing {
    pub identifier: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub kind: TransportKind,
    pub product: Option<String>,
}

impl DeviceListing {
    pub fn as_tuple(&self) -> (String, u16, u16) {
        (self.identifier.clone(), self.vendor_id, self.product_id)
    }

    /// Picker label, e.g. `COM3 (1a86:7523)`.
    pub fn label(&self) -> String {
        format!("{} ({:04x}:{:04x})", self.identifier, self.vendor_id, self.product_id)
    }
}

impl From<&SerialPortInfo> for DeviceListing {
    fn from(info: &SerialPortInfo) -> Self {
        let (vendor_id, product_id, product) = match &info.port_type {
            SerialPortType::UsbPort(usb) => (usb.vid, usb.pid, usb.product.clone()),
            _ => (0, 0, None),
        };
        Self {
            identifier: info.port_name.clone(),
            vendor_id,
            product_id,
            kind: TransportKind::Serial,
            product,
        }
    }
}

/// Device connection state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    AwaitingPermission,
    Connecting,
    Connected,
    Error(String),
}

/// A device the manager has seen at least once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub listing: DeviceListing,
    pub connection_state: ConnectionState,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn new(listing: DeviceListing) -> Self {
        Self {
            id: Uuid::new_v4(),
            listing,
            connection_state: ConnectionState::Disconnected,
            last_seen: Utc::now(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.listing.identifier
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection_state, ConnectionState::Connected)
    }

    pub fn update_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
        self.last_seen = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serialport::UsbPortInfo;

    fn ch340_port() -> SerialPortInfo {
        SerialPortInfo {
            port_name: "/dev/ttyUSB0".into(),
            port_type: SerialPortType::UsbPort(UsbPortInfo {
                vid: 0x1A86,
                pid: 0x7523,
                serial_number: None,
                manufacturer: None,
                product: Some("USB Serial".into()),
            }),
        }
    }

    #[test]
    fn serial_listing_carries_usb_ids() {
        let listing = DeviceListing::from(&ch340_port());
        assert_eq!(listing.as_tuple(), ("/dev/ttyUSB0".to_string(), 0x1A86, 0x7523));
        assert_eq!(listing.kind, TransportKind::Serial);
        assert_eq!(listing.label(), "/dev/ttyUSB0 (1a86:7523)");
    }

    #[test]
    fn non_usb_port_has_zero_ids() {
        let info = SerialPortInfo { port_name: "/dev/ttyS0".into(), port_type: SerialPortType::Unknown };
        let listing = DeviceListing::from(&info);
        assert_eq!((listing.vendor_id, listing.product_id), (0, 0));
    }

    #[test]
    fn state_update_touches_last_seen() {
        let mut device = Device::new(DeviceListing::from(&ch340_port()));
        let before = device.last_seen;
        device.update_connection_state(ConnectionState::Connecting);
        assert!(device.last_seen >= before);
        assert!(!device.is_connected());
        device.update_connection_state(ConnectionState::Connected);
        assert!(device.is_connected());
    }
}
