//! Test utilities for rust-usbip
//!
//! Provides mock device constructors, a scriptable host controller, and
//! helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::mock_device;
//!
//! let device = mock_device("1-1", 0x1234, 0x5678);
//! assert_eq!(device.vendor_id, 0x1234);
//! assert_eq!(device.devid(), (1 << 16) | 2);
//! ```

use crate::usb_types::{
    TransferOutcome, TransferSpec, TransferStatus, UsbHostController,
};
use protocol::{DeviceSpeed, Direction, ExportedDevice, UsbInterface};
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a mock ExportedDevice for testing
///
/// The busnum is parsed from the busid's leading component; the devnum is
/// derived from the trailing one, so "1-1" and "1-2" get distinct devids.
pub fn mock_device(busid: &str, vendor_id: u16, product_id: u16) -> ExportedDevice {
    let (busnum, devnum) = parse_busid(busid);
    ExportedDevice {
        busid: busid.to_string(),
        path: format!("/sys/devices/platform/usb/{busid}"),
        busnum,
        devnum,
        speed: DeviceSpeed::High,
        vendor_id,
        product_id,
        bcd_device: 0x0100,
        device_class: 0x00,
        device_subclass: 0x00,
        device_protocol: 0x00,
        configuration_value: 1,
        num_configurations: 1,
        interfaces: vec![UsbInterface {
            class: 0x03,
            subclass: 0x00,
            protocol: 0x00,
        }],
        manufacturer: Some("Test Manufacturer".to_string()),
        product: Some("Test Product".to_string()),
    }
}

/// Create a list of mock devices with busids "1-1".."1-N"
pub fn mock_device_list(count: u32) -> Vec<ExportedDevice> {
    (1..=count)
        .map(|i| {
            mock_device(
                &format!("1-{i}"),
                0x1000 + (i as u16),
                0x2000 + (i as u16),
            )
        })
        .collect()
}

fn parse_busid(busid: &str) -> (u32, u32) {
    let mut parts = busid.splitn(2, '-');
    let busnum = parts
        .next()
        .and_then(|p| p.parse().ok())
        .unwrap_or(1);
    let devnum = parts
        .next()
        .and_then(|p| p.split('.').next_back())
        .and_then(|p| p.parse().ok())
        .unwrap_or(1)
        + 1;
    (busnum, devnum)
}

/// A scripted outcome queued on the mock controller
struct ScriptedOutcome {
    outcome: TransferOutcome,
    delay: Duration,
}

/// Scriptable in-memory host controller
///
/// Serves a fixed device list and pops queued outcomes in FIFO order for
/// each executed transfer. With an empty script, IN transfers echo a
/// zero-filled buffer and OUT transfers succeed empty.
pub struct MockHostController {
    devices: Vec<ExportedDevice>,
    script: VecDeque<ScriptedOutcome>,
}

impl MockHostController {
    pub fn new(devices: Vec<ExportedDevice>) -> Self {
        MockHostController {
            devices,
            script: VecDeque::new(),
        }
    }

    /// Queue an outcome for the next unscripted transfer
    pub fn push_outcome(&mut self, outcome: TransferOutcome) {
        self.script.push_back(ScriptedOutcome {
            outcome,
            delay: Duration::ZERO,
        });
    }

    /// Queue an outcome that takes `delay` of execution time, for
    /// exercising cancellation races
    pub fn push_delayed_outcome(&mut self, outcome: TransferOutcome, delay: Duration) {
        self.script.push_back(ScriptedOutcome { outcome, delay });
    }
}

impl UsbHostController for MockHostController {
    fn enumerate(&mut self) -> crate::Result<Vec<ExportedDevice>> {
        Ok(self.devices.clone())
    }

    fn execute(&mut self, spec: &TransferSpec) -> TransferOutcome {
        if let Some(scripted) = self.script.pop_front() {
            if !scripted.delay.is_zero() {
                std::thread::sleep(scripted.delay);
            }
            return scripted.outcome;
        }
        if spec.direction == Direction::In {
            TransferOutcome::success(vec![0u8; spec.length.min(64)])
        } else {
            TransferOutcome::sent(spec.data.len())
        }
    }
}

/// A host controller whose devices have all vanished
///
/// Every transfer reports `DeviceGone`; useful for teardown tests.
pub struct GoneHostController;

impl UsbHostController for GoneHostController {
    fn enumerate(&mut self) -> crate::Result<Vec<ExportedDevice>> {
        Ok(Vec::new())
    }

    fn execute(&mut self, _spec: &TransferSpec) -> TransferOutcome {
        TransferOutcome::failed(TransferStatus::DeviceGone)
    }
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb_types::TransferKind;

    fn in_spec(length: usize) -> TransferSpec {
        TransferSpec {
            busid: "1-1".to_string(),
            endpoint: 0x81,
            direction: Direction::In,
            kind: TransferKind::Interrupt,
            setup: [0; 8],
            data: vec![],
            length,
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_mock_device_identity() {
        let device = mock_device("2-1.4", 0x1234, 0x5678);
        assert_eq!(device.busnum, 2);
        assert_eq!(device.devnum, 5);
        assert_eq!(device.vendor_id, 0x1234);
    }

    #[test]
    fn test_mock_device_list_unique_busids() {
        let devices = mock_device_list(10);
        assert_eq!(devices.len(), 10);
        let busids: std::collections::HashSet<_> =
            devices.iter().map(|d| d.busid.clone()).collect();
        assert_eq!(busids.len(), 10);
    }

    #[test]
    fn test_scripted_outcomes_fifo() {
        let mut controller = MockHostController::new(vec![]);
        controller.push_outcome(TransferOutcome::success(vec![1]));
        controller.push_outcome(TransferOutcome::failed(TransferStatus::Stalled));

        assert_eq!(controller.execute(&in_spec(8)).data, vec![1]);
        assert_eq!(
            controller.execute(&in_spec(8)).status,
            TransferStatus::Stalled
        );
        // Script drained: default echo
        assert_eq!(controller.execute(&in_spec(8)).data.len(), 8);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;
        assert!(result.is_err());
    }
}
