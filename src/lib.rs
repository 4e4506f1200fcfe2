//! remotelink - a session-oriented remote messaging and RPC transport
//!
//! This library ships typed application messages between peers over stream
//! (reliable, ordered) and datagram (best-effort, connection-emulated)
//! substrates, multiplexes request/response exchanges over the asynchronous
//! message flow, and mediates the boundary between network I/O tasks and an
//! application-owned execution context such as a game loop.
//!
//! ## Main Components
//!
//! - `remote`: the per-peer session core. `send` ships a fire-and-forget
//!   message, `rpc_send` returns an awaitable reply handle correlated by a
//!   short id, `disconnect` tears the session down and fails everything
//!   still pending.
//!
//! - `tcp` / `udp`: transport specializations and their listeners. The
//!   stream listener yields one session per accept; the datagram listener
//!   demultiplexes a shared socket into virtual sessions created by a
//!   handshake packet.
//!
//! - `pump`: the thread transducer. I/O tasks enqueue decoded messages;
//!   the application drains them on its own tick, which is where receivers
//!   run.
//!
//! - `protocol`: wire framing (8-byte little-endian header), the message
//!   lookup table, and the RPC callback pool.
//!
//! - `buffer`: pooled scratch buffers used by serialization and framing.
//!
//! - `reconnect`: supervisor that re-establishes broken stream sessions
//!   inside a configured window.
//!
//! ## Usage
//!
//! Register every message type in a [`MessageTable`] at startup, create a
//! [`MessagePump`], then connect [`tcp::TcpRemote`] / [`udp::UdpRemote`]
//! sessions or bind the matching listener. Implement [`Receiver`] for your
//! handler and drain the pump from your main loop.

pub mod buffer;
pub mod config;
pub mod error;
pub mod protocol;
pub mod pump;
mod reconnect;
pub mod remote;
pub mod tcp;
pub mod udp;

pub use config::RemoteOptions;
pub use error::RemoteError;
pub use protocol::lut::{MessageTable, Wire};
pub use pump::{MessagePump, PumpHandle};
pub use remote::{Receiver, Remote};
