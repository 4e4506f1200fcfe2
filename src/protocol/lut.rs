//! Message lookup table: the bidirectional mapping between 32-bit message
//! ids and the encode/decode pair for a concrete message type.
//!
//! Applications register every message type once at startup; the finished
//! table is wrapped in an `Arc` and shared read-only by all sessions, so no
//! synchronization is needed afterwards. Payloads cross the table's boundary
//! type-erased as `Box<dyn Any + Send>` and are downcast again at the RPC
//! completion site or in the application's receiver.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::RemoteError;
use crate::protocol::UDP_CONNECT_MESSAGE_ID;

/// Wire serialization for a message type, little-endian throughout.
///
/// Implementations write and read a self-delimiting representation; the
/// packet header carries the total length, so a decoder may also rely on the
/// slice it is handed being exactly one payload.
pub trait Wire: Sized {
    /// Serializes `self` to the provided writer.
    fn encode<W: Write>(&self, dest: &mut W) -> std::io::Result<()>;

    /// Deserializes a value from the provided reader.
    fn decode<R: Read>(src: &mut R) -> std::io::Result<Self>;
}

type EncodeFn = Box<dyn Fn(&dyn Any, &mut Vec<u8>) -> Result<(), RemoteError> + Send + Sync>;
type DecodeFn = Box<dyn Fn(&[u8]) -> Result<Box<dyn Any + Send>, RemoteError> + Send + Sync>;

struct OutboundEntry {
    message_id: i32,
    encode: EncodeFn,
}

struct InboundEntry {
    type_name: &'static str,
    decode: DecodeFn,
}

/// Registry of `(message id, encoder, decoder)` triples.
///
/// Registration happens on `&mut self` before any session starts and must
/// not race with traffic; every accessor afterwards takes `&self`.
#[derive(Default)]
pub struct MessageTable {
    by_type: HashMap<TypeId, OutboundEntry>,
    by_id: HashMap<i32, InboundEntry>,
}

impl MessageTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        MessageTable::default()
    }

    /// Registers `M` under `message_id`.
    ///
    /// # Panics
    ///
    /// Panics on the reserved datagram-handshake id or when either the id or
    /// the type is already registered; both are startup configuration bugs.
    pub fn register<M: Wire + Any + Send>(&mut self, message_id: i32) {
        assert!(
            message_id != UDP_CONNECT_MESSAGE_ID,
            "message id {message_id} is reserved for the datagram handshake"
        );
        let type_name = std::any::type_name::<M>();
        let outbound = OutboundEntry {
            message_id,
            encode: Box::new(move |message, dest| {
                let message = message
                    .downcast_ref::<M>()
                    .expect("encoder invoked with a foreign type");
                message.encode(dest).map_err(RemoteError::decode)
            }),
        };
        let inbound = InboundEntry {
            type_name,
            decode: Box::new(|bytes| {
                let mut cursor = Cursor::new(bytes);
                M::decode(&mut cursor)
                    .map(|m| Box::new(m) as Box<dyn Any + Send>)
                    .map_err(RemoteError::decode)
            }),
        };
        let clash = self.by_type.insert(TypeId::of::<M>(), outbound);
        assert!(clash.is_none(), "type {type_name} registered twice");
        let clash = self.by_id.insert(message_id, inbound);
        assert!(clash.is_none(), "message id {message_id} registered twice");
    }

    /// Encodes `message` into `dest`, returning its message id.
    ///
    /// The generic shim over [`encode_erased`](Self::encode_erased) for
    /// callers that still know the concrete type.
    pub fn encode<M: Any>(&self, message: &M, dest: &mut Vec<u8>) -> Result<i32, RemoteError> {
        self.encode_erased(TypeId::of::<M>(), std::any::type_name::<M>(), message, dest)
    }

    /// Encodes an already type-erased message into `dest`.
    ///
    /// Fails with [`RemoteError::UnknownMessageType`] when the runtime type
    /// was never registered.
    pub fn encode_erased(
        &self,
        type_id: TypeId,
        type_name: &'static str,
        message: &dyn Any,
        dest: &mut Vec<u8>,
    ) -> Result<i32, RemoteError> {
        let entry = self
            .by_type
            .get(&type_id)
            .ok_or(RemoteError::UnknownMessageType(type_name))?;
        (entry.encode)(message, dest)?;
        Ok(entry.message_id)
    }

    /// Decodes a payload by message id.
    ///
    /// Fails with [`RemoteError::UnknownMessageId`] for an unregistered id
    /// and [`RemoteError::DecodeError`] when the registered decoder rejects
    /// the bytes.
    pub fn decode(&self, message_id: i32, bytes: &[u8]) -> Result<Box<dyn Any + Send>, RemoteError> {
        let entry = self
            .by_id
            .get(&message_id)
            .ok_or(RemoteError::UnknownMessageId(message_id))?;
        (entry.decode)(bytes)
    }

    /// Message id registered for `M`, if any.
    pub fn message_id_of<M: Any>(&self) -> Option<i32> {
        self.by_type.get(&TypeId::of::<M>()).map(|e| e.message_id)
    }

    /// Registered type name for a message id, used in mismatch diagnostics.
    pub fn type_name_of(&self, message_id: i32) -> Option<&'static str> {
        self.by_id.get(&message_id).map(|e| e.type_name)
    }
}

/// Booleans travel as a single byte, zero meaning false.
impl Wire for bool {
    fn encode<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_u8(*self as u8)
    }

    fn decode<R: Read>(src: &mut R) -> std::io::Result<Self> {
        Ok(src.read_u8()? != 0)
    }
}

macro_rules! wire_int {
    ($t:ty, $write:ident, $read:ident) => {
        impl Wire for $t {
            fn encode<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
                dest.$write::<LittleEndian>(*self)
            }

            fn decode<R: Read>(src: &mut R) -> std::io::Result<Self> {
                src.$read::<LittleEndian>()
            }
        }
    };
}

wire_int!(i16, write_i16, read_i16);
wire_int!(u16, write_u16, read_u16);
wire_int!(i32, write_i32, read_i32);
wire_int!(u32, write_u32, read_u32);
wire_int!(i64, write_i64, read_i64);
wire_int!(u64, write_u64, read_u64);

/// Strings travel as a `u16` byte length followed by UTF-8 bytes.
impl Wire for String {
    fn encode<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        let bytes = self.as_bytes();
        if bytes.len() > u16::MAX as usize {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "string exceeds u16 length prefix",
            ));
        }
        dest.write_u16::<LittleEndian>(bytes.len() as u16)?;
        dest.write_all(bytes)
    }

    fn decode<R: Read>(src: &mut R) -> std::io::Result<Self> {
        let len = src.read_u16::<LittleEndian>()? as usize;
        let mut bytes = vec![0u8; len];
        src.read_exact(&mut bytes)?;
        String::from_utf8(bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Byte blobs travel as a `u32` length followed by the raw bytes.
impl Wire for Vec<u8> {
    fn encode<W: Write>(&self, dest: &mut W) -> std::io::Result<()> {
        dest.write_u32::<LittleEndian>(self.len() as u32)?;
        dest.write_all(self)
    }

    fn decode<R: Read>(src: &mut R) -> std::io::Result<Self> {
        let len = src.read_u32::<LittleEndian>()? as usize;
        let mut bytes = vec![0u8; len];
        src.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}
