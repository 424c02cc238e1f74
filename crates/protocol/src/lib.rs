//! USB/IP wire protocol for rust-usbip
//!
//! This crate implements the canonical USB/IP wire layout: the
//! handshake-phase op messages (device listing and import) and the
//! command-phase SUBMIT/UNLINK packets with their RET counterparts.
//! It is pure translation between byte buffers and typed messages —
//! no transport, no session state.
//!
//! # Example
//!
//! ```
//! use protocol::{OpRequest, encode_op_request, decode_op_request};
//!
//! let request = OpRequest::Import { busid: "1-1".to_string() };
//! let bytes = encode_op_request(&request);
//! assert_eq!(decode_op_request(&bytes).unwrap(), request);
//! ```
//!
//! With the `async` feature (default), staged readers pull exactly one
//! message off a stream:
//!
//! ```no_run
//! # async fn demo(stream: &mut tokio::net::TcpStream) -> protocol::Result<()> {
//! let request = protocol::read_op_request(stream).await?;
//! # Ok(()) }
//! ```

pub mod codec;
pub mod error;
pub mod messages;
pub mod types;

pub use codec::{
    CMD_HEADER_LEN, DEVICE_LEN, INTERFACE_LEN, MAX_TRANSFER_SIZE, OP_HEADER_LEN, decode_command,
    decode_op_reply, decode_op_request, decode_reply, encode_command, encode_op_refusal,
    encode_op_reply, encode_op_request, encode_reply,
};

#[cfg(feature = "async")]
pub use codec::{read_command, read_op_reply, read_op_request, read_reply, write_frame};

pub use error::{ProtocolError, Result};
pub use messages::{
    CmdHeader, CmdSubmit, CmdUnlink, Command, OP_REP_DEVLIST, OP_REP_IMPORT, OP_REQ_DEVLIST,
    OP_REQ_IMPORT, OpReply, OpRequest, Reply, RetSubmit, RetUnlink, USBIP_CMD_SUBMIT,
    USBIP_CMD_UNLINK, USBIP_RET_SUBMIT, USBIP_RET_UNLINK,
};
pub use types::{
    BUSID_LEN, DEFAULT_PORT, DeviceSpeed, Direction, ExportedDevice, PATH_LEN, ST_NA, ST_OK,
    USBIP_VERSION, UsbInterface, status,
};
