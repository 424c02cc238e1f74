//! USB/IP wire codec
//!
//! Stateless translation between byte buffers and the typed messages in
//! [`crate::messages`]. All multi-byte integers are big-endian. String
//! fields are fixed-width and NUL-padded on encode; decoding truncates at
//! the first NUL. Encoding never fails; decoding reports the offending
//! byte offset on truncated or malformed input.
//!
//! The sync functions operate on complete byte slices. With the `async`
//! feature, staged read helpers pull exactly one message off an
//! [`tokio::io::AsyncRead`] stream and delegate parsing to the sync core.

use crate::error::{ProtocolError, Result};
use crate::messages::{
    CmdHeader, CmdSubmit, CmdUnlink, Command, OP_REP_DEVLIST, OP_REP_IMPORT, OP_REQ_DEVLIST,
    OP_REQ_IMPORT, OpReply, OpRequest, Reply, RetSubmit, RetUnlink, USBIP_CMD_SUBMIT,
    USBIP_CMD_UNLINK, USBIP_RET_SUBMIT, USBIP_RET_UNLINK,
};
use crate::types::{BUSID_LEN, Direction, ExportedDevice, PATH_LEN, ST_OK, USBIP_VERSION};
use bytes::BufMut;

#[cfg(feature = "async")]
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Handshake-phase header length: version, code, status
pub const OP_HEADER_LEN: usize = 8;

/// Command-phase packet header length (basic header plus command fields)
pub const CMD_HEADER_LEN: usize = 48;

/// Fixed portion of a devlist/import device section
pub const DEVICE_LEN: usize = 312;

/// Per-interface entry length in devlist replies
pub const INTERFACE_LEN: usize = 4;

/// Cap on a single transfer payload. A declared buffer length above this
/// is treated as malformed input rather than honored.
pub const MAX_TRANSFER_SIZE: usize = 4 * 1024 * 1024;

// ---------------------------------------------------------------------------
// Checked reader over a byte slice
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize, reason: &'static str) -> Result<&'a [u8]> {
        if self.buf.len() - self.pos < n {
            return Err(ProtocolError::Malformed {
                offset: self.pos,
                reason,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self, reason: &'static str) -> Result<u16> {
        let b = self.take(2, reason)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self, reason: &'static str) -> Result<u32> {
        let b = self.take(4, reason)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self, reason: &'static str) -> Result<i32> {
        Ok(self.u32(reason)? as i32)
    }

    fn u8(&mut self, reason: &'static str) -> Result<u8> {
        Ok(self.take(1, reason)?[0])
    }
}

// ---------------------------------------------------------------------------
// Fixed-width string fields
// ---------------------------------------------------------------------------

fn put_fixed_str(buf: &mut Vec<u8>, s: &str, width: usize) {
    let bytes = s.as_bytes();
    let len = bytes.len().min(width);
    buf.put_slice(&bytes[..len]);
    buf.put_bytes(0, width - len);
}

fn get_fixed_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

// ---------------------------------------------------------------------------
// Device sections
// ---------------------------------------------------------------------------

fn put_device(buf: &mut Vec<u8>, device: &ExportedDevice, with_interfaces: bool) {
    put_fixed_str(buf, &device.path, PATH_LEN);
    put_fixed_str(buf, &device.busid, BUSID_LEN);
    buf.put_u32(device.busnum);
    buf.put_u32(device.devnum);
    buf.put_u32(device.speed.to_wire());
    buf.put_u16(device.vendor_id);
    buf.put_u16(device.product_id);
    buf.put_u16(device.bcd_device);
    buf.put_u8(device.device_class);
    buf.put_u8(device.device_subclass);
    buf.put_u8(device.device_protocol);
    buf.put_u8(device.configuration_value);
    buf.put_u8(device.num_configurations);
    buf.put_u8(device.interfaces.len() as u8);
    if with_interfaces {
        for iface in &device.interfaces {
            buf.put_u8(iface.class);
            buf.put_u8(iface.subclass);
            buf.put_u8(iface.protocol);
            buf.put_u8(0);
        }
    }
}

fn get_device(r: &mut Reader<'_>, with_interfaces: bool) -> Result<ExportedDevice> {
    let path = get_fixed_str(r.take(PATH_LEN, "short device path field")?);
    let busid = get_fixed_str(r.take(BUSID_LEN, "short busid field")?);
    let busnum = r.u32("missing busnum")?;
    let devnum = r.u32("missing devnum")?;
    let speed = crate::types::DeviceSpeed::from_wire(r.u32("missing speed")?);
    let vendor_id = r.u16("missing idVendor")?;
    let product_id = r.u16("missing idProduct")?;
    let bcd_device = r.u16("missing bcdDevice")?;
    let device_class = r.u8("missing bDeviceClass")?;
    let device_subclass = r.u8("missing bDeviceSubClass")?;
    let device_protocol = r.u8("missing bDeviceProtocol")?;
    let configuration_value = r.u8("missing bConfigurationValue")?;
    let num_configurations = r.u8("missing bNumConfigurations")?;
    let num_interfaces = r.u8("missing bNumInterfaces")?;

    let mut interfaces = Vec::new();
    if with_interfaces {
        for _ in 0..num_interfaces {
            let class = r.u8("short interface entry")?;
            let subclass = r.u8("short interface entry")?;
            let protocol = r.u8("short interface entry")?;
            let _pad = r.u8("short interface entry")?;
            interfaces.push(crate::types::UsbInterface {
                class,
                subclass,
                protocol,
            });
        }
    }

    Ok(ExportedDevice {
        busid,
        path,
        busnum,
        devnum,
        speed,
        vendor_id,
        product_id,
        bcd_device,
        device_class,
        device_subclass,
        device_protocol,
        configuration_value,
        num_configurations,
        interfaces,
        manufacturer: None,
        product: None,
    })
}

// ---------------------------------------------------------------------------
// Handshake-phase op messages
// ---------------------------------------------------------------------------

/// Encode an op request (client side; also used by session tests)
pub fn encode_op_request(request: &OpRequest) -> Vec<u8> {
    match request {
        OpRequest::Devlist => {
            let mut buf = Vec::with_capacity(OP_HEADER_LEN);
            buf.put_u16(USBIP_VERSION);
            buf.put_u16(OP_REQ_DEVLIST);
            buf.put_u32(ST_OK);
            buf
        }
        OpRequest::Import { busid } => {
            let mut buf = Vec::with_capacity(OP_HEADER_LEN + BUSID_LEN);
            buf.put_u16(USBIP_VERSION);
            buf.put_u16(OP_REQ_IMPORT);
            buf.put_u32(ST_OK);
            put_fixed_str(&mut buf, busid, BUSID_LEN);
            buf
        }
    }
}

/// Decode an op request from a complete byte slice
pub fn decode_op_request(buf: &[u8]) -> Result<OpRequest> {
    let mut r = Reader::new(buf);
    let version = r.u16("short op header")?;
    if version != USBIP_VERSION {
        return Err(ProtocolError::IncompatibleVersion {
            version,
            expected: USBIP_VERSION,
        });
    }
    let code = r.u16("short op header")?;
    let _status = r.u32("short op header")?;
    match code {
        OP_REQ_DEVLIST => Ok(OpRequest::Devlist),
        OP_REQ_IMPORT => {
            let busid = get_fixed_str(r.take(BUSID_LEN, "short busid field")?);
            Ok(OpRequest::Import { busid })
        }
        _ => Err(ProtocolError::UnsupportedOp { code }),
    }
}

/// Encode an op reply. Never fails; the state machine only constructs
/// valid in-memory replies.
pub fn encode_op_reply(reply: &OpReply) -> Vec<u8> {
    match reply {
        OpReply::Devlist { devices } => {
            let mut buf = Vec::with_capacity(
                OP_HEADER_LEN + 4 + devices.len() * (DEVICE_LEN + INTERFACE_LEN),
            );
            buf.put_u16(USBIP_VERSION);
            buf.put_u16(OP_REP_DEVLIST);
            buf.put_u32(ST_OK);
            buf.put_u32(devices.len() as u32);
            for device in devices {
                put_device(&mut buf, device, true);
            }
            buf
        }
        OpReply::Import { status, device } => {
            let mut buf = Vec::with_capacity(OP_HEADER_LEN + DEVICE_LEN);
            buf.put_u16(USBIP_VERSION);
            buf.put_u16(OP_REP_IMPORT);
            buf.put_u32(*status);
            if let Some(device) = device {
                put_device(&mut buf, device, false);
            }
            buf
        }
    }
}

/// Refusal reply for an unrecognized op request: the request code with the
/// top bit cleared and a non-zero status, so the client sees a well-formed
/// negative answer instead of a dropped connection.
pub fn encode_op_refusal(request_code: u16) -> Vec<u8> {
    let mut buf = Vec::with_capacity(OP_HEADER_LEN);
    buf.put_u16(USBIP_VERSION);
    buf.put_u16(request_code & 0x7fff);
    buf.put_u32(crate::types::ST_NA);
    buf
}

/// Decode an op reply from a complete byte slice (client side)
pub fn decode_op_reply(buf: &[u8]) -> Result<OpReply> {
    let mut r = Reader::new(buf);
    let version = r.u16("short op header")?;
    if version != USBIP_VERSION {
        return Err(ProtocolError::IncompatibleVersion {
            version,
            expected: USBIP_VERSION,
        });
    }
    let code = r.u16("short op header")?;
    let status = r.u32("short op header")?;
    match code {
        OP_REP_DEVLIST => {
            let count = r.u32("missing device count")?;
            let mut devices = Vec::with_capacity(count.min(256) as usize);
            for _ in 0..count {
                devices.push(get_device(&mut r, true)?);
            }
            Ok(OpReply::Devlist { devices })
        }
        OP_REP_IMPORT => {
            let device = if status == ST_OK {
                Some(get_device(&mut r, false)?)
            } else {
                None
            };
            Ok(OpReply::Import { status, device })
        }
        _ => Err(ProtocolError::UnsupportedOp { code }),
    }
}

// ---------------------------------------------------------------------------
// Command-phase packets
// ---------------------------------------------------------------------------

fn put_basic_header(buf: &mut Vec<u8>, command: u32, header: &CmdHeader) {
    buf.put_u32(command);
    buf.put_u32(header.seqnum);
    buf.put_u32(header.devid);
    buf.put_u32(header.direction.to_wire());
    buf.put_u32(header.ep);
}

fn get_basic_header(r: &mut Reader<'_>) -> Result<(u32, CmdHeader)> {
    let command = r.u32("short command header")?;
    let seqnum = r.u32("short command header")?;
    let devid = r.u32("short command header")?;
    let direction_offset = r.pos;
    let raw_direction = r.u32("short command header")?;
    let ep = r.u32("short command header")?;
    let direction = Direction::from_wire(raw_direction).ok_or(ProtocolError::Malformed {
        offset: direction_offset,
        reason: "invalid direction",
    })?;
    Ok((
        command,
        CmdHeader {
            seqnum,
            devid,
            direction,
            ep,
        },
    ))
}

/// Encode a command packet (client side; also used by session tests)
pub fn encode_command(command: &Command) -> Vec<u8> {
    match command {
        Command::Submit(cmd) => {
            let mut buf = Vec::with_capacity(CMD_HEADER_LEN + cmd.data.len());
            put_basic_header(&mut buf, USBIP_CMD_SUBMIT, &cmd.header);
            buf.put_u32(cmd.transfer_flags);
            buf.put_u32(cmd.transfer_buffer_length);
            buf.put_i32(cmd.start_frame);
            buf.put_i32(cmd.number_of_packets);
            buf.put_i32(cmd.interval);
            buf.put_slice(&cmd.setup);
            if cmd.header.direction == Direction::Out {
                buf.put_slice(&cmd.data);
            }
            buf
        }
        Command::Unlink(cmd) => {
            let mut buf = Vec::with_capacity(CMD_HEADER_LEN);
            put_basic_header(&mut buf, USBIP_CMD_UNLINK, &cmd.header);
            buf.put_u32(cmd.unlink_seqnum);
            buf.put_bytes(0, 24);
            buf
        }
    }
}

/// Decode a command packet from a complete byte slice
pub fn decode_command(buf: &[u8]) -> Result<Command> {
    let mut r = Reader::new(buf);
    let (command, header) = get_basic_header(&mut r)?;
    match command {
        USBIP_CMD_SUBMIT => {
            let transfer_flags = r.u32("short SUBMIT fields")?;
            let transfer_buffer_length = r.u32("short SUBMIT fields")?;
            let start_frame = r.i32("short SUBMIT fields")?;
            let number_of_packets = r.i32("short SUBMIT fields")?;
            let interval = r.i32("short SUBMIT fields")?;
            let mut setup = [0u8; 8];
            setup.copy_from_slice(r.take(8, "short setup field")?);

            if transfer_buffer_length as usize > MAX_TRANSFER_SIZE {
                return Err(ProtocolError::TransferTooLarge {
                    size: transfer_buffer_length as usize,
                    max: MAX_TRANSFER_SIZE,
                });
            }

            let data = if header.direction == Direction::Out {
                r.take(transfer_buffer_length as usize, "short OUT payload")?
                    .to_vec()
            } else {
                Vec::new()
            };

            Ok(Command::Submit(CmdSubmit {
                header,
                transfer_flags,
                transfer_buffer_length,
                start_frame,
                number_of_packets,
                interval,
                setup,
                data,
            }))
        }
        USBIP_CMD_UNLINK => {
            let unlink_seqnum = r.u32("short UNLINK fields")?;
            let _pad = r.take(24, "short UNLINK padding")?;
            Ok(Command::Unlink(CmdUnlink {
                header,
                unlink_seqnum,
            }))
        }
        code => Err(ProtocolError::UnsupportedCommand { code }),
    }
}

/// Encode a reply packet. Never fails.
pub fn encode_reply(reply: &Reply) -> Vec<u8> {
    match reply {
        Reply::Submit(ret) => {
            let mut buf = Vec::with_capacity(CMD_HEADER_LEN + ret.data.len());
            put_basic_header(&mut buf, USBIP_RET_SUBMIT, &ret.header);
            buf.put_i32(ret.status);
            buf.put_i32(ret.actual_length);
            buf.put_i32(ret.start_frame);
            buf.put_i32(ret.number_of_packets);
            buf.put_i32(ret.error_count);
            buf.put_bytes(0, 8);
            if ret.header.direction == Direction::In {
                buf.put_slice(&ret.data);
            }
            buf
        }
        Reply::Unlink(ret) => {
            let mut buf = Vec::with_capacity(CMD_HEADER_LEN);
            put_basic_header(&mut buf, USBIP_RET_UNLINK, &ret.header);
            buf.put_i32(ret.status);
            buf.put_bytes(0, 24);
            buf
        }
    }
}

/// Decode a reply packet from a complete byte slice (client side)
pub fn decode_reply(buf: &[u8]) -> Result<Reply> {
    let mut r = Reader::new(buf);
    let (command, header) = get_basic_header(&mut r)?;
    match command {
        USBIP_RET_SUBMIT => {
            let status = r.i32("short RET_SUBMIT fields")?;
            let length_offset = r.pos;
            let actual_length = r.i32("short RET_SUBMIT fields")?;
            let start_frame = r.i32("short RET_SUBMIT fields")?;
            let number_of_packets = r.i32("short RET_SUBMIT fields")?;
            let error_count = r.i32("short RET_SUBMIT fields")?;
            let _pad = r.take(8, "short RET_SUBMIT padding")?;

            if actual_length < 0 || actual_length as usize > MAX_TRANSFER_SIZE {
                return Err(ProtocolError::Malformed {
                    offset: length_offset,
                    reason: "implausible actual_length",
                });
            }
            let data = if header.direction == Direction::In {
                r.take(actual_length as usize, "short IN payload")?.to_vec()
            } else {
                Vec::new()
            };

            Ok(Reply::Submit(RetSubmit {
                header,
                status,
                actual_length,
                start_frame,
                number_of_packets,
                error_count,
                data,
            }))
        }
        USBIP_RET_UNLINK => {
            let status = r.i32("short RET_UNLINK fields")?;
            let _pad = r.take(24, "short RET_UNLINK padding")?;
            Ok(Reply::Unlink(RetUnlink { header, status }))
        }
        code => Err(ProtocolError::UnsupportedCommand { code }),
    }
}

// ---------------------------------------------------------------------------
// Async stream helpers
// ---------------------------------------------------------------------------

/// Read one op request off an async stream.
///
/// Returns [`ProtocolError::Disconnected`] on a clean EOF at a message
/// boundary; EOF mid-message surfaces as an I/O error.
#[cfg(feature = "async")]
pub async fn read_op_request<R>(reader: &mut R) -> Result<OpRequest>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; OP_HEADER_LEN];
    let n = reader.read(&mut header).await?;
    if n == 0 {
        return Err(ProtocolError::Disconnected);
    }
    reader.read_exact(&mut header[n..]).await?;

    let code = u16::from_be_bytes([header[2], header[3]]);
    if code == OP_REQ_IMPORT {
        let mut busid = [0u8; BUSID_LEN];
        reader.read_exact(&mut busid).await?;
        let mut full = Vec::with_capacity(OP_HEADER_LEN + BUSID_LEN);
        full.extend_from_slice(&header);
        full.extend_from_slice(&busid);
        decode_op_request(&full)
    } else {
        decode_op_request(&header)
    }
}

/// Read one op reply off an async stream (client side)
#[cfg(feature = "async")]
pub async fn read_op_reply<R>(reader: &mut R) -> Result<OpReply>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; OP_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let code = u16::from_be_bytes([header[2], header[3]]);
    let status = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

    let mut full = header.to_vec();
    match code {
        OP_REP_DEVLIST => {
            let mut count_bytes = [0u8; 4];
            reader.read_exact(&mut count_bytes).await?;
            full.extend_from_slice(&count_bytes);
            let count = u32::from_be_bytes(count_bytes);
            for _ in 0..count {
                let mut fixed = vec![0u8; DEVICE_LEN];
                reader.read_exact(&mut fixed).await?;
                let num_interfaces = fixed[DEVICE_LEN - 1] as usize;
                let mut ifaces = vec![0u8; num_interfaces * INTERFACE_LEN];
                reader.read_exact(&mut ifaces).await?;
                full.extend_from_slice(&fixed);
                full.extend_from_slice(&ifaces);
            }
        }
        OP_REP_IMPORT if status == ST_OK => {
            let mut fixed = vec![0u8; DEVICE_LEN];
            reader.read_exact(&mut fixed).await?;
            full.extend_from_slice(&fixed);
        }
        _ => {}
    }
    decode_op_reply(&full)
}

/// Read one command packet off an async stream.
///
/// Returns [`ProtocolError::Disconnected`] on a clean EOF at a packet
/// boundary.
#[cfg(feature = "async")]
pub async fn read_command<R>(reader: &mut R) -> Result<Command>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; CMD_HEADER_LEN];
    let n = reader.read(&mut header).await?;
    if n == 0 {
        return Err(ProtocolError::Disconnected);
    }
    reader.read_exact(&mut header[n..]).await?;

    let command = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let direction = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
    let length = u32::from_be_bytes([header[24], header[25], header[26], header[27]]) as usize;

    if command == USBIP_CMD_SUBMIT && direction == Direction::Out.to_wire() && length > 0 {
        if length > MAX_TRANSFER_SIZE {
            return Err(ProtocolError::TransferTooLarge {
                size: length,
                max: MAX_TRANSFER_SIZE,
            });
        }
        let mut full = Vec::with_capacity(CMD_HEADER_LEN + length);
        full.extend_from_slice(&header);
        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await?;
        full.extend_from_slice(&payload);
        decode_command(&full)
    } else {
        decode_command(&header)
    }
}

/// Read one reply packet off an async stream (client side)
#[cfg(feature = "async")]
pub async fn read_reply<R>(reader: &mut R) -> Result<Reply>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; CMD_HEADER_LEN];
    reader.read_exact(&mut header).await?;

    let command = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let direction = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);
    let actual = u32::from_be_bytes([header[24], header[25], header[26], header[27]]) as usize;

    if command == USBIP_RET_SUBMIT && direction == Direction::In.to_wire() && actual > 0 {
        if actual > MAX_TRANSFER_SIZE {
            return Err(ProtocolError::TransferTooLarge {
                size: actual,
                max: MAX_TRANSFER_SIZE,
            });
        }
        let mut full = Vec::with_capacity(CMD_HEADER_LEN + actual);
        full.extend_from_slice(&header);
        let mut payload = vec![0u8; actual];
        reader.read_exact(&mut payload).await?;
        full.extend_from_slice(&payload);
        decode_reply(&full)
    } else {
        decode_reply(&header)
    }
}

/// Write a pre-encoded frame to an async stream
#[cfg(feature = "async")]
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    Ok(())
}
