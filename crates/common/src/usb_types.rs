//! Host-side transfer abstractions
//!
//! The local USB capability is an external collaborator: the server only
//! sees the [`UsbHostController`] trait (enumerate devices, execute
//! transfers). These types describe one transfer on its way through that
//! seam, independent of both the wire format and any concrete backend.

use protocol::{Direction, ExportedDevice};
use std::time::Duration;

/// Ticket identifying one in-flight transfer handed to the host worker
///
/// Allocated by the bridge at submit time; sessions correlate completions
/// with their protocol sequence numbers through it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferTicket(pub u64);

/// Kind of USB transfer to execute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Endpoint-0 control transfer driven by a setup packet
    Control,
    Interrupt,
    Bulk,
}

/// One USB request handed to the host controller
#[derive(Debug, Clone)]
pub struct TransferSpec {
    /// Bus position of the target device
    pub busid: String,
    /// Endpoint address including the direction bit
    pub endpoint: u8,
    pub direction: Direction,
    pub kind: TransferKind,
    /// Control setup packet; all zero for other kinds
    pub setup: [u8; 8],
    /// OUT payload (empty for IN transfers)
    pub data: Vec<u8>,
    /// Requested read size for IN transfers
    pub length: usize,
    pub timeout: Duration,
}

/// Completion status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    /// Endpoint reported a STALL condition; an ordinary completion status
    /// from the remote client's point of view
    Stalled,
    TimedOut,
    /// Cancelled before or despite execution
    Cancelled,
    /// The device is no longer present; the owning session must tear down
    DeviceGone,
    /// Any other local failure
    Failed,
}

impl TransferStatus {
    /// The errno-style status carried in RET_SUBMIT for this outcome
    pub fn wire_status(self) -> i32 {
        match self {
            TransferStatus::Completed => protocol::status::SUCCESS,
            TransferStatus::Stalled => protocol::status::EPIPE,
            TransferStatus::TimedOut => protocol::status::ETIMEDOUT,
            TransferStatus::Cancelled => protocol::status::ECONNRESET,
            TransferStatus::DeviceGone => protocol::status::ENODEV,
            TransferStatus::Failed => protocol::status::EIO,
        }
    }
}

/// Result of executing a transfer
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub status: TransferStatus,
    /// IN data read from the device (empty otherwise)
    pub data: Vec<u8>,
    /// Bytes accepted by the device on an OUT transfer
    pub written: usize,
}

impl TransferOutcome {
    /// Completed IN transfer carrying the bytes read
    pub fn success(data: Vec<u8>) -> Self {
        TransferOutcome {
            status: TransferStatus::Completed,
            data,
            written: 0,
        }
    }

    /// Completed OUT transfer that wrote `written` bytes
    pub fn sent(written: usize) -> Self {
        TransferOutcome {
            status: TransferStatus::Completed,
            data: Vec::new(),
            written,
        }
    }

    pub fn failed(status: TransferStatus) -> Self {
        TransferOutcome {
            status,
            data: Vec::new(),
            written: 0,
        }
    }

    /// The actual_length reported on the wire: bytes read for IN, bytes
    /// written for OUT
    pub fn actual_length(&self) -> usize {
        if self.data.is_empty() {
            self.written
        } else {
            self.data.len()
        }
    }
}

/// The local USB host capability
///
/// Implemented by the rusb backend in the server and by the mock in
/// [`crate::test_utils`]. Runs on the dedicated USB worker thread, so
/// implementations may block.
pub trait UsbHostController: Send {
    /// Snapshot all exportable devices currently attached
    fn enumerate(&mut self) -> crate::Result<Vec<ExportedDevice>>;

    /// Execute one transfer to completion
    fn execute(&mut self, spec: &TransferSpec) -> TransferOutcome;
}
