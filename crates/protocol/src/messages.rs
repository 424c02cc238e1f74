//! USB/IP message definitions
//!
//! The protocol has two phases with distinct headers. Handshake-phase "op"
//! messages (device listing and import) use an 8-byte header of version,
//! code and status. Once a device is imported the connection switches to
//! the command phase: 48-byte SUBMIT/UNLINK packets and their RET
//! counterparts, optionally followed by a transfer payload.

use crate::types::{Direction, ExportedDevice};

/// Op code: request the exported-device list
pub const OP_REQ_DEVLIST: u16 = 0x8005;
/// Op code: devlist reply
pub const OP_REP_DEVLIST: u16 = 0x0005;
/// Op code: request to import (attach) a device by busid
pub const OP_REQ_IMPORT: u16 = 0x8003;
/// Op code: import reply
pub const OP_REP_IMPORT: u16 = 0x0003;

/// Command code: submit a USB transfer
pub const USBIP_CMD_SUBMIT: u32 = 0x0000_0001;
/// Command code: unlink (cancel) an in-flight transfer
pub const USBIP_CMD_UNLINK: u32 = 0x0000_0002;
/// Command code: SUBMIT completion reply
pub const USBIP_RET_SUBMIT: u32 = 0x0000_0003;
/// Command code: UNLINK reply
pub const USBIP_RET_UNLINK: u32 = 0x0000_0004;

/// Handshake-phase request from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpRequest {
    /// OP_REQ_DEVLIST
    Devlist,
    /// OP_REQ_IMPORT with the requested busid
    Import { busid: String },
}

/// Handshake-phase reply from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpReply {
    /// OP_REP_DEVLIST carrying the current registry snapshot
    Devlist { devices: Vec<ExportedDevice> },
    /// OP_REP_IMPORT; `device` is present exactly when `status` is ST_OK
    Import {
        status: u32,
        device: Option<ExportedDevice>,
    },
}

impl OpReply {
    /// Successful import reply for `device`
    pub fn import_ok(device: ExportedDevice) -> Self {
        OpReply::Import {
            status: crate::types::ST_OK,
            device: Some(device),
        }
    }

    /// Refused import reply (device unknown, attached, or gone)
    pub fn import_refused() -> Self {
        OpReply::Import {
            status: crate::types::ST_NA,
            device: None,
        }
    }
}

/// The shared fields of every command-phase header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdHeader {
    /// Sequence number correlating a command with its reply
    pub seqnum: u32,
    /// Imported device id (busnum << 16 | devnum)
    pub devid: u32,
    pub direction: Direction,
    /// Endpoint number without the direction bit
    pub ep: u32,
}

/// USBIP_CMD_SUBMIT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdSubmit {
    pub header: CmdHeader,
    pub transfer_flags: u32,
    /// Requested buffer length; actual OUT payload length or IN read size
    pub transfer_buffer_length: u32,
    pub start_frame: i32,
    /// Number of ISO packets; 0 or -1 for non-isochronous transfers
    pub number_of_packets: i32,
    pub interval: i32,
    /// Control setup packet; all zero for non-control transfers
    pub setup: [u8; 8],
    /// OUT payload (empty for IN transfers)
    pub data: Vec<u8>,
}

impl CmdSubmit {
    /// Whether the client asked for an isochronous transfer
    pub fn is_isochronous(&self) -> bool {
        self.number_of_packets > 0
    }
}

/// USBIP_CMD_UNLINK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdUnlink {
    pub header: CmdHeader,
    /// Sequence number of the SUBMIT to cancel
    pub unlink_seqnum: u32,
}

/// A decoded command-phase packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Submit(CmdSubmit),
    Unlink(CmdUnlink),
}

impl Command {
    pub fn seqnum(&self) -> u32 {
        match self {
            Command::Submit(cmd) => cmd.header.seqnum,
            Command::Unlink(cmd) => cmd.header.seqnum,
        }
    }
}

/// USBIP_RET_SUBMIT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetSubmit {
    pub header: CmdHeader,
    /// errno-style completion status (see [`crate::types::status`])
    pub status: i32,
    pub actual_length: i32,
    pub start_frame: i32,
    pub number_of_packets: i32,
    pub error_count: i32,
    /// IN payload (empty for OUT or failed transfers)
    pub data: Vec<u8>,
}

impl RetSubmit {
    /// Completion reply echoing `header`, carrying `status` and the IN
    /// payload where applicable.
    pub fn new(header: CmdHeader, status: i32, data: Vec<u8>) -> Self {
        let actual_length = data.len() as i32;
        RetSubmit {
            header,
            status,
            actual_length,
            start_frame: 0,
            number_of_packets: 0,
            error_count: 0,
            data,
        }
    }
}

/// USBIP_RET_UNLINK
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetUnlink {
    pub header: CmdHeader,
    /// -ECONNRESET when the unlink won; 0 when the transfer had already
    /// completed
    pub status: i32,
}

/// A command-phase reply packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Submit(RetSubmit),
    Unlink(RetUnlink),
}
