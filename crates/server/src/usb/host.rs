//! rusb-backed host controller
//!
//! The production implementation of [`UsbHostController`]. Runs on the
//! USB worker thread: enumeration snapshots exportable devices into
//! [`ExportedDevice`] records and transfer execution drives the libusb
//! synchronous API, mapping rusb errors to transfer statuses.

use common::{TransferKind, TransferOutcome, TransferSpec, TransferStatus, UsbHostController};
use protocol::{DeviceSpeed, ExportedDevice, UsbInterface};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

pub struct RusbHostController {
    context: Context,
    /// Open device handles by busid, created on first transfer
    handles: HashMap<String, DeviceHandle<Context>>,
    /// Time budget for string-descriptor fetches during export
    string_wait: Duration,
    /// VID:PID patterns selecting exportable devices (empty = all)
    filters: Vec<String>,
}

impl RusbHostController {
    pub fn new(string_wait: Duration, filters: Vec<String>) -> Result<Self, rusb::Error> {
        let context = Context::new()?;
        Ok(RusbHostController {
            context,
            handles: HashMap::new(),
            string_wait,
            filters,
        })
    }

    fn busid_of(device: &Device<Context>) -> String {
        format!("{}-{}", device.bus_number(), device.address())
    }

    /// Snapshot one device, or None if it is filtered out or a root hub
    fn snapshot(&self, device: &Device<Context>) -> Result<Option<ExportedDevice>, rusb::Error> {
        let desc = device.device_descriptor()?;

        // Root hubs cannot be exported
        if desc.vendor_id() == 0x1d6b && desc.class_code() == 9 {
            return Ok(None);
        }

        if !check_filter(desc.vendor_id(), desc.product_id(), &self.filters) {
            debug!(
                "device {} ignored by filter ({:04x}:{:04x})",
                Self::busid_of(device),
                desc.vendor_id(),
                desc.product_id()
            );
            return Ok(None);
        }

        let busid = Self::busid_of(device);
        let speed = match device.speed() {
            rusb::Speed::Low => DeviceSpeed::Low,
            rusb::Speed::Full => DeviceSpeed::Full,
            rusb::Speed::High => DeviceSpeed::High,
            rusb::Speed::Super => DeviceSpeed::Super,
            rusb::Speed::SuperPlus => DeviceSpeed::SuperPlus,
            _ => DeviceSpeed::Unknown,
        };

        let (configuration_value, interfaces) = match device.active_config_descriptor() {
            Ok(config) => {
                let interfaces = config
                    .interfaces()
                    .filter_map(|iface| iface.descriptors().next())
                    .map(|alt| UsbInterface {
                        class: alt.class_code(),
                        subclass: alt.sub_class_code(),
                        protocol: alt.protocol_code(),
                    })
                    .collect();
                (config.number(), interfaces)
            }
            Err(e) => {
                debug!("no active config for {}: {}", busid, e);
                (0, Vec::new())
            }
        };

        // String descriptors are fetched within the configured budget;
        // they are listing metadata, not wire fields
        let (manufacturer, product) = match device.open() {
            Ok(handle) => {
                let language = handle
                    .read_languages(self.string_wait)
                    .ok()
                    .and_then(|langs| langs.first().copied());
                match language {
                    Some(language) => (
                        handle
                            .read_manufacturer_string(language, &desc, self.string_wait)
                            .ok(),
                        handle
                            .read_product_string(language, &desc, self.string_wait)
                            .ok(),
                    ),
                    None => (None, None),
                }
            }
            Err(e) => {
                debug!("cannot open {} for string fetch: {}", busid, e);
                (None, None)
            }
        };

        let version = desc.device_version();
        let bcd_device = ((version.major() as u16) << 8)
            | ((version.minor() as u16) << 4)
            | version.sub_minor() as u16;

        Ok(Some(ExportedDevice {
            path: format!("/sys/bus/usb/devices/{busid}"),
            busid,
            busnum: device.bus_number() as u32,
            devnum: device.address() as u32,
            speed,
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            bcd_device,
            device_class: desc.class_code(),
            device_subclass: desc.sub_class_code(),
            device_protocol: desc.protocol_code(),
            configuration_value,
            num_configurations: desc.num_configurations(),
            interfaces,
            manufacturer,
            product,
        }))
    }

    /// Open (or reuse) the handle for `busid`, detaching kernel drivers
    /// and claiming every interface of the active configuration
    fn handle_for(&mut self, busid: &str) -> Result<&mut DeviceHandle<Context>, rusb::Error> {
        if !self.handles.contains_key(busid) {
            let device = self
                .context
                .devices()?
                .iter()
                .find(|d| Self::busid_of(d) == busid)
                .ok_or(rusb::Error::NoDevice)?;

            let mut handle = device.open()?;
            if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
                debug!("auto-detach not available for {}: {}", busid, e);
            }
            if let Ok(config) = device.active_config_descriptor() {
                for iface in config.interfaces() {
                    if let Err(e) = handle.claim_interface(iface.number()) {
                        warn!("claim of interface {} on {} failed: {}", iface.number(), busid, e);
                    }
                }
            }
            debug!("opened device {}", busid);
            self.handles.insert(busid.to_string(), handle);
        }

        self.handles
            .get_mut(busid)
            .ok_or(rusb::Error::NoDevice)
    }

    fn execute_control(&mut self, spec: &TransferSpec) -> Result<TransferOutcome, rusb::Error> {
        let request_type = spec.setup[0];
        let request = spec.setup[1];
        let value = u16::from_le_bytes([spec.setup[2], spec.setup[3]]);
        let index = u16::from_le_bytes([spec.setup[4], spec.setup[5]]);
        let length = u16::from_le_bytes([spec.setup[6], spec.setup[7]]) as usize;

        let timeout = spec.timeout;
        let handle = self.handle_for(&spec.busid)?;

        if request_type & 0x80 != 0 {
            let mut buffer = vec![0u8; length.max(spec.length)];
            let n = handle.read_control(request_type, request, value, index, &mut buffer, timeout)?;
            buffer.truncate(n);
            Ok(TransferOutcome::success(buffer))
        } else {
            let n =
                handle.write_control(request_type, request, value, index, &spec.data, timeout)?;
            Ok(TransferOutcome::sent(n))
        }
    }

    fn execute_data(&mut self, spec: &TransferSpec) -> Result<TransferOutcome, rusb::Error> {
        let timeout = spec.timeout;
        let is_in = spec.direction.is_in();
        let handle = self.handle_for(&spec.busid)?;

        match (spec.kind, is_in) {
            (TransferKind::Interrupt, true) => {
                let mut buffer = vec![0u8; spec.length];
                let n = handle.read_interrupt(spec.endpoint, &mut buffer, timeout)?;
                buffer.truncate(n);
                Ok(TransferOutcome::success(buffer))
            }
            (TransferKind::Interrupt, false) => {
                let n = handle.write_interrupt(spec.endpoint, &spec.data, timeout)?;
                Ok(TransferOutcome::sent(n))
            }
            (TransferKind::Bulk, true) => {
                let mut buffer = vec![0u8; spec.length];
                let n = handle.read_bulk(spec.endpoint, &mut buffer, timeout)?;
                buffer.truncate(n);
                Ok(TransferOutcome::success(buffer))
            }
            (TransferKind::Bulk, false) => {
                let n = handle.write_bulk(spec.endpoint, &spec.data, timeout)?;
                Ok(TransferOutcome::sent(n))
            }
            (TransferKind::Control, _) => self.execute_control(spec),
        }
    }
}

impl UsbHostController for RusbHostController {
    fn enumerate(&mut self) -> common::Result<Vec<ExportedDevice>> {
        let devices = self
            .context
            .devices()
            .map_err(|e| common::Error::Host(e.to_string()))?;

        let mut exported = Vec::new();
        for device in devices.iter() {
            match self.snapshot(&device) {
                Ok(Some(snapshot)) => exported.push(snapshot),
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "skipping device {} during enumeration: {}",
                        Self::busid_of(&device),
                        e
                    );
                }
            }
        }
        debug!("enumerated {} exportable devices", exported.len());
        Ok(exported)
    }

    fn execute(&mut self, spec: &TransferSpec) -> TransferOutcome {
        match self.execute_data(spec) {
            Ok(outcome) => outcome,
            Err(e) => {
                let status = map_rusb_error(e);
                if status == TransferStatus::DeviceGone {
                    self.handles.remove(&spec.busid);
                }
                TransferOutcome::failed(status)
            }
        }
    }
}

/// Map a rusb error to the status reported to the remote client
pub fn map_rusb_error(error: rusb::Error) -> TransferStatus {
    match error {
        rusb::Error::Pipe => TransferStatus::Stalled,
        rusb::Error::Timeout => TransferStatus::TimedOut,
        rusb::Error::NoDevice => TransferStatus::DeviceGone,
        _ => TransferStatus::Failed,
    }
}

/// Check whether a VID/PID pair matches the configured filters
fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
    if filters.is_empty() {
        return true;
    }

    for filter in filters {
        // Filter format: "0xVID:0xPID" with "*" wildcards, validated by
        // the config loader
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            continue;
        }

        let vid_match = parts[0] == "*"
            || u16::from_str_radix(parts[0].trim_start_matches("0x"), 16)
                .map(|v| v == vid)
                .unwrap_or(false);
        if !vid_match {
            continue;
        }

        let pid_match = parts[1] == "*"
            || u16::from_str_radix(parts[1].trim_start_matches("0x"), 16)
                .map(|p| p == pid)
                .unwrap_or(false);
        if pid_match {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        let filters = vec!["0x1234:0x5678".to_string(), "0xABCD:*".to_string()];

        assert!(check_filter(0x1234, 0x5678, &filters));
        assert!(check_filter(0xABCD, 0x1111, &filters));
        assert!(!check_filter(0x1234, 0x9999, &filters));
        assert!(!check_filter(0x9999, 0x5678, &filters));

        // Empty filters = allow all
        assert!(check_filter(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_rusb_error_mapping() {
        assert_eq!(map_rusb_error(rusb::Error::Pipe), TransferStatus::Stalled);
        assert_eq!(
            map_rusb_error(rusb::Error::Timeout),
            TransferStatus::TimedOut
        );
        assert_eq!(
            map_rusb_error(rusb::Error::NoDevice),
            TransferStatus::DeviceGone
        );
        assert_eq!(map_rusb_error(rusb::Error::Io), TransferStatus::Failed);
    }

    #[test]
    fn test_controller_creation() {
        // USB context creation may fail without permissions; only verify
        // the attempt is well-formed
        match RusbHostController::new(Duration::from_millis(2000), vec![]) {
            Ok(controller) => assert!(controller.handles.is_empty()),
            Err(e) => eprintln!("USB context unavailable: {}", e),
        }
    }
}
