//! Error types shared across the transport, codec and RPC layers.
//!
//! One enum covers the whole crate so that a single transport failure can be
//! cloned out to every pending RPC entry on a session. Send-path errors are
//! returned to the caller; receive-path errors are logged at the point of
//! decode and the offending frame is dropped (a framing error on a stream
//! transport additionally closes the session).

use thiserror::Error;

/// Error kinds surfaced by sessions, listeners and RPC futures.
#[non_exhaustive]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RemoteError {
    /// An RPC entry outlived its deadline and was expired by the sweeper.
    #[error("rpc timed out")]
    Timeout,

    /// The session was closed while the operation was pending.
    #[error("session disconnected")]
    Disconnected,

    /// An RPC reply decoded to a runtime type other than the one the caller
    /// registered for.
    #[error("rpc reply type mismatch (expected {expected}, got {actual})")]
    TypeMismatch {
        /// Type name recorded when the RPC was registered.
        expected: &'static str,
        /// Type name of the message that actually arrived.
        actual: &'static str,
    },

    /// An inbound packet carried a message id with no registered decoder.
    #[error("unknown message id {0}")]
    UnknownMessageId(i32),

    /// An outbound message's runtime type has no registered encoder.
    #[error("unregistered message type {0}")]
    UnknownMessageType(&'static str),

    /// Fewer bytes than a packet header were available.
    #[error("short packet header")]
    ShortHeader,

    /// The header's size field disagrees with the transport limits or the
    /// bytes actually available.
    #[error("framing error: {0}")]
    FramingError(String),

    /// A registered codec rejected the bytes or the value it was given.
    #[error("codec failure: {0}")]
    DecodeError(String),

    /// The transport could not reach the peer.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// `connect` was called on a session that already has a live transport.
    #[error("session already connected")]
    AlreadyConnected,

    /// No free correlation id remained in the RPC id space.
    #[error("rpc id space exhausted")]
    PoolExhausted,
}

impl RemoteError {
    /// Wraps an I/O error from a registered decoder.
    pub(crate) fn decode(err: std::io::Error) -> Self {
        RemoteError::DecodeError(err.to_string())
    }
}
