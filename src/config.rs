//! Session configuration.
//!
//! Options recognized by the core. A [`RemoteOptions`] value is handed to a
//! session or listener at construction time and is immutable afterwards; the
//! same value can be shared across every session of a process.

use std::time::Duration;

/// Tuning knobs for sessions created by this crate.
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// Deadline for a registered RPC entry before the sweeper expires it.
    pub rpc_timeout_ms: u64,

    /// Enables the reconnect supervisor on unsolicited stream loss.
    pub is_reconnect: bool,

    /// How long the reconnect supervisor keeps retrying before giving up.
    pub reconnect_window_ms: u64,

    /// Capacity of each pooled scratch buffer. Must be at least
    /// [`max_packet_size`](Self::max_packet_size).
    pub buffer_pool_chunk_size: usize,

    /// Header-enforced cap on total packet length.
    pub max_packet_size: usize,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        RemoteOptions {
            rpc_timeout_ms: 30_000,
            is_reconnect: false,
            reconnect_window_ms: 15_000,
            buffer_pool_chunk_size: 64 * 1024,
            max_packet_size: 8192,
        }
    }
}

impl RemoteOptions {
    /// RPC deadline as a [`Duration`].
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Reconnect window as a [`Duration`].
    pub fn reconnect_window(&self) -> Duration {
        Duration::from_millis(self.reconnect_window_ms)
    }

    /// Chunk size actually used by the buffer pool.
    ///
    /// A configured chunk smaller than the packet cap cannot hold a framed
    /// packet, so the cap wins.
    pub fn effective_chunk_size(&self) -> usize {
        self.buffer_pool_chunk_size.max(self.max_packet_size)
    }
}
