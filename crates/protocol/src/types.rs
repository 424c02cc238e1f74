//! USB/IP wire-level type definitions
//!
//! These types mirror the structures the USB/IP specification puts on the
//! wire: exported-device descriptions for the devlist/import handshake and
//! the errno-style status codes carried in RET packets.

use serde::{Deserialize, Serialize};

/// USB/IP protocol version announced in handshake-phase headers (v1.1.1)
pub const USBIP_VERSION: u16 = 0x0111;

/// Default TCP port for USB/IP servers
pub const DEFAULT_PORT: u16 = 3240;

/// Fixed width of the busid field in devlist/import messages
pub const BUSID_LEN: usize = 32;

/// Fixed width of the sysfs path field in devlist/import messages
pub const PATH_LEN: usize = 256;

/// Handshake-phase reply status: request honored
pub const ST_OK: u32 = 0;
/// Handshake-phase reply status: device unavailable or request refused
pub const ST_NA: u32 = 1;

/// Transfer direction as encoded in command headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Host to device (wire value 0)
    Out,
    /// Device to host (wire value 1)
    In,
}

impl Direction {
    pub fn from_wire(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Direction::Out),
            1 => Some(Direction::In),
            _ => None,
        }
    }

    pub fn to_wire(self) -> u32 {
        match self {
            Direction::Out => 0,
            Direction::In => 1,
        }
    }

    pub fn is_in(self) -> bool {
        self == Direction::In
    }
}

/// USB device speed, with the wire encoding used in devlist entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceSpeed {
    Unknown,
    /// 1.5 Mbps (USB 1.0)
    Low,
    /// 12 Mbps (USB 1.1)
    Full,
    /// 480 Mbps (USB 2.0)
    High,
    /// 5 Gbps (USB 3.0)
    Super,
    /// 10 Gbps (USB 3.1)
    SuperPlus,
}

impl DeviceSpeed {
    pub fn to_wire(self) -> u32 {
        match self {
            DeviceSpeed::Unknown => 0,
            DeviceSpeed::Low => 1,
            DeviceSpeed::Full => 2,
            DeviceSpeed::High => 3,
            DeviceSpeed::Super => 5,
            DeviceSpeed::SuperPlus => 6,
        }
    }

    pub fn from_wire(raw: u32) -> Self {
        match raw {
            1 => DeviceSpeed::Low,
            2 => DeviceSpeed::Full,
            3 => DeviceSpeed::High,
            5 => DeviceSpeed::Super,
            6 => DeviceSpeed::SuperPlus,
            _ => DeviceSpeed::Unknown,
        }
    }
}

/// Per-interface class triple carried in devlist entries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbInterface {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
}

/// Immutable snapshot of an exported USB device
///
/// Taken at export time and owned by the device registry; `busid` is the
/// unique key. The optional manufacturer/product strings are local metadata
/// for logs and device listings and never appear on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportedDevice {
    /// Bus position identifier, e.g. "1-1"
    pub busid: String,
    /// sysfs-style device path reported in listings
    pub path: String,
    pub busnum: u32,
    pub devnum: u32,
    pub speed: DeviceSpeed,
    pub vendor_id: u16,
    pub product_id: u16,
    pub bcd_device: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub configuration_value: u8,
    pub num_configurations: u8,
    /// One entry per interface of the active configuration
    pub interfaces: Vec<UsbInterface>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl ExportedDevice {
    /// Device identifier used in command headers: busnum in the high half,
    /// devnum in the low half.
    pub fn devid(&self) -> u32 {
        (self.busnum << 16) | (self.devnum & 0xffff)
    }
}

/// errno-style status codes carried in RET_SUBMIT/RET_UNLINK
pub mod status {
    /// Transfer completed
    pub const SUCCESS: i32 = 0;
    /// Endpoint stalled (-EPIPE)
    pub const EPIPE: i32 = -32;
    /// Transfer timed out (-ETIMEDOUT)
    pub const ETIMEDOUT: i32 = -110;
    /// Device no longer present (-ENODEV)
    pub const ENODEV: i32 = -19;
    /// Transfer unlinked before completion (-ECONNRESET)
    pub const ECONNRESET: i32 = -104;
    /// Generic transfer failure (-EIO)
    pub const EIO: i32 = -5;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_wire_mapping() {
        assert_eq!(Direction::from_wire(0), Some(Direction::Out));
        assert_eq!(Direction::from_wire(1), Some(Direction::In));
        assert_eq!(Direction::from_wire(2), None);
        assert_eq!(Direction::In.to_wire(), 1);
        assert!(Direction::In.is_in());
        assert!(!Direction::Out.is_in());
    }

    #[test]
    fn test_speed_wire_codes() {
        for speed in [
            DeviceSpeed::Low,
            DeviceSpeed::Full,
            DeviceSpeed::High,
            DeviceSpeed::Super,
            DeviceSpeed::SuperPlus,
        ] {
            assert_eq!(DeviceSpeed::from_wire(speed.to_wire()), speed);
        }
        // Wireless (4) is not modeled and folds into Unknown
        assert_eq!(DeviceSpeed::from_wire(4), DeviceSpeed::Unknown);
    }

    #[test]
    fn test_devid_packing() {
        let device = ExportedDevice {
            busid: "3-2".to_string(),
            path: "/sys/devices/usb/3-2".to_string(),
            busnum: 3,
            devnum: 2,
            speed: DeviceSpeed::High,
            vendor_id: 0x1234,
            product_id: 0x5678,
            bcd_device: 0x0100,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            configuration_value: 1,
            num_configurations: 1,
            interfaces: vec![],
            manufacturer: None,
            product: None,
        };
        assert_eq!(device.devid(), (3 << 16) | 2);
    }
}
