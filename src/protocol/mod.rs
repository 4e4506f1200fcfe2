//! Wire protocol: framing, message registry and RPC correlation.
//!
//! This module contains the three components every session builds on:
//!
//! - `codec`: the fixed 8-byte packet header, framing into pooled buffers,
//!   and packet reassembly for stream and datagram transports.
//!
//! - `lut`: the message lookup table mapping 32-bit message ids to the
//!   encode/decode pair registered for each application message type.
//!
//! - `rpc`: the per-session callback pool that correlates request/response
//!   exchanges by short id, enforces deadlines and delivers completions.
//!
//! The protocol is symmetric: both peers frame, register and correlate the
//! same way, and either side may originate requests.

pub mod codec;
pub mod lut;
pub mod rpc;

/// Message id reserved for the datagram-session handshake.
///
/// [`lut::MessageTable::register`] rejects this id; a datagram carrying it
/// is consumed by the listener's accept machinery and never reaches the
/// application.
pub const UDP_CONNECT_MESSAGE_ID: i32 = -1;
