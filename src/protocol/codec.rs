//! Packet header layout and framing.
//!
//! Every packet on either transport starts with the same fixed 8-byte
//! little-endian header:
//!
//! | field        | type  | meaning                                        |
//! |--------------|-------|------------------------------------------------|
//! | `size`       | `u16` | total packet length, header included           |
//! | `message_id` | `i32` | lookup-table key for the payload               |
//! | `rpc_id`     | `i16` | 0 plain message, >0 request, <0 reply          |
//!
//! The size field is authoritative; there is no escape or fragmentation
//! scheme. Stream transports reassemble packets from a sliding receive
//! buffer, advancing by `size`; a datagram carries exactly one packet.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::RemoteError;

/// Length of the fixed packet header.
pub const HEADER_LEN: usize = 8;

/// Parsed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Total packet length including the header itself.
    pub size: u16,
    /// Message lookup-table key.
    pub message_id: i32,
    /// Correlation id; see the module docs for the sign convention.
    pub rpc_id: i16,
}

impl PacketHeader {
    /// Payload length implied by the size field.
    pub fn body_len(&self) -> usize {
        self.size as usize - HEADER_LEN
    }
}

/// Frames `payload` into `dest` by prepending the packet header.
///
/// `dest` is appended to, so a caller reusing a pooled buffer clears it
/// first. Fails with [`RemoteError::FramingError`] when the framed packet
/// would exceed `max_packet`.
pub fn frame(
    dest: &mut Vec<u8>,
    message_id: i32,
    rpc_id: i16,
    payload: &[u8],
    max_packet: usize,
) -> Result<(), RemoteError> {
    let total = HEADER_LEN + payload.len();
    if total > max_packet || total > u16::MAX as usize {
        return Err(RemoteError::FramingError(format!(
            "packet of {} bytes exceeds cap {}",
            total, max_packet
        )));
    }
    dest.write_u16::<LittleEndian>(total as u16)
        .and_then(|_| dest.write_i32::<LittleEndian>(message_id))
        .and_then(|_| dest.write_i16::<LittleEndian>(rpc_id))
        .expect("writing to a Vec cannot fail");
    dest.extend_from_slice(payload);
    Ok(())
}

/// Parses the packet header at the start of `bytes`.
///
/// Fails with [`RemoteError::ShortHeader`] when fewer than [`HEADER_LEN`]
/// bytes are available and with [`RemoteError::FramingError`] when the size
/// field is below the header length or above `max_packet`.
pub fn parse_header(bytes: &[u8], max_packet: usize) -> Result<PacketHeader, RemoteError> {
    if bytes.len() < HEADER_LEN {
        return Err(RemoteError::ShortHeader);
    }
    let mut cursor = Cursor::new(bytes);
    let size = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| RemoteError::ShortHeader)?;
    let message_id = cursor
        .read_i32::<LittleEndian>()
        .map_err(|_| RemoteError::ShortHeader)?;
    let rpc_id = cursor
        .read_i16::<LittleEndian>()
        .map_err(|_| RemoteError::ShortHeader)?;
    if (size as usize) < HEADER_LEN || size as usize > max_packet {
        return Err(RemoteError::FramingError(format!(
            "size field {} outside [{}, {}]",
            size, HEADER_LEN, max_packet
        )));
    }
    Ok(PacketHeader { size, message_id, rpc_id })
}

/// Pops one complete packet off the front of a stream receive buffer.
///
/// Returns `Ok(None)` while the buffer holds only a partial packet. On
/// success the consumed bytes are drained from `recv_buf` and the payload is
/// returned alongside its header. A malformed size field is a framing error,
/// which is fatal for the stream that produced it.
pub fn extract_frame(
    recv_buf: &mut Vec<u8>,
    max_packet: usize,
) -> Result<Option<(PacketHeader, Vec<u8>)>, RemoteError> {
    if recv_buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let header = parse_header(recv_buf, max_packet)?;
    let total = header.size as usize;
    if recv_buf.len() < total {
        return Ok(None);
    }
    let body = recv_buf[HEADER_LEN..total].to_vec();
    recv_buf.drain(..total);
    Ok(Some((header, body)))
}

/// Interprets one received datagram as exactly one packet.
///
/// The size field must match the datagram length; a partial or padded
/// datagram is a framing error and the caller drops the packet.
pub fn parse_datagram(
    bytes: &[u8],
    max_packet: usize,
) -> Result<(PacketHeader, &[u8]), RemoteError> {
    let header = parse_header(bytes, max_packet)?;
    if header.size as usize != bytes.len() {
        return Err(RemoteError::FramingError(format!(
            "datagram of {} bytes but size field {}",
            bytes.len(),
            header.size
        )));
    }
    Ok((header, &bytes[HEADER_LEN..]))
}
