//! The session core shared by both transports.
//!
//! A [`Remote`] is one logical bidirectional message channel with one peer.
//! It owns the send path (encode into pooled buffers, frame, queue for the
//! transport driver), the inbound dispatch (decode, correlate or hand off to
//! the pump), the per-session RPC pool and the event hooks. The
//! transport-specific driver tasks live in [`crate::tcp`] and [`crate::udp`]
//! and talk to the core through a small `pub(crate)` surface.

use std::any::{Any, TypeId};
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use smallvec::SmallVec;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::buffer::{BufferPool, PooledBuffer};
use crate::config::RemoteOptions;
use crate::error::RemoteError;
use crate::protocol::codec::{self, PacketHeader};
use crate::protocol::lut::MessageTable;
use crate::protocol::rpc::{RpcPool, RpcReply};
use crate::pump::PumpHandle;

/// Process-wide session identity counter.
static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

/// Application-side message handler, invoked on the application context.
///
/// Returning `Some(reply)` for a message whose `rpc_id` was positive sends
/// the reply back with the id negated; returning `None` for such a message
/// lets the peer's entry time out.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Handles one decoded inbound message.
    async fn deal_message(
        &self,
        session: Arc<Remote>,
        message: Box<dyn Any + Send>,
    ) -> Option<Box<dyn Any + Send>>;
}

type DisconnectSink = Arc<dyn Fn(&RemoteError) + Send + Sync>;
type EventSink = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct EventHooks {
    on_disconnect: Mutex<SmallVec<[DisconnectSink; 2]>>,
    pre_reconnect: Mutex<SmallVec<[EventSink; 2]>>,
    reconnect_success: Mutex<SmallVec<[EventSink; 2]>>,
}

/// One session with one peer.
pub struct Remote {
    id: u32,
    options: RemoteOptions,
    table: Arc<MessageTable>,
    buffers: BufferPool,
    pump: PumpHandle,
    rpc: RpcPool,
    valid: AtomicBool,
    user_closed: AtomicBool,
    last_receive: Mutex<Instant>,
    token: Mutex<Option<Box<dyn Any + Send + Sync>>>,
    receiver: Mutex<Option<Arc<dyn Receiver>>>,
    target_addr: Mutex<Option<SocketAddr>>,
    local_addr: Mutex<Option<SocketAddr>>,
    peer_addr: Mutex<Option<SocketAddr>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<PooledBuffer>>>,
    hooks: EventHooks,
}

impl Remote {
    /// Creates an unstarted session core.
    pub(crate) fn new(
        options: RemoteOptions,
        table: Arc<MessageTable>,
        pump: PumpHandle,
    ) -> Arc<Remote> {
        let chunk = options.effective_chunk_size();
        let rpc = RpcPool::new(options.rpc_timeout());
        Arc::new(Remote {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            options,
            table,
            buffers: BufferPool::new(chunk, 32),
            pump,
            rpc,
            valid: AtomicBool::new(false),
            user_closed: AtomicBool::new(false),
            last_receive: Mutex::new(Instant::now()),
            token: Mutex::new(None),
            receiver: Mutex::new(None),
            target_addr: Mutex::new(None),
            local_addr: Mutex::new(None),
            peer_addr: Mutex::new(None),
            outbound: Mutex::new(None),
            hooks: EventHooks::default(),
        })
    }

    /// Process-unique session identity.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Options this session was created with.
    pub fn options(&self) -> &RemoteOptions {
        &self.options
    }

    /// True between a successful connect/accept and disconnect.
    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Stores an opaque user token on the session.
    pub fn set_token(&self, token: Box<dyn Any + Send + Sync>) {
        *self.token.lock().expect("token mutex poisoned") = Some(token);
    }

    /// Removes and returns the user token, if one was set.
    pub fn take_token(&self) -> Option<Box<dyn Any + Send + Sync>> {
        self.token.lock().expect("token mutex poisoned").take()
    }

    /// Time since the last completed inbound decode.
    pub fn last_receive_elapsed(&self) -> Duration {
        self.last_receive
            .lock()
            .expect("last receive mutex poisoned")
            .elapsed()
    }

    /// Address this session connects (and reconnects) to.
    pub fn target_addr(&self) -> Option<SocketAddr> {
        *self.target_addr.lock().expect("addr mutex poisoned")
    }

    /// Local socket address once the transport is up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().expect("addr mutex poisoned")
    }

    /// Peer address observed when the transport came up. For datagram
    /// sessions this is the address replies are sent to.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer_addr.lock().expect("addr mutex poisoned")
    }

    /// Installs the application receiver. Must happen before `start` on an
    /// accepted session; messages arriving with no receiver are dropped.
    pub fn set_receiver(&self, receiver: Arc<dyn Receiver>) {
        *self.receiver.lock().expect("receiver mutex poisoned") = Some(receiver);
    }

    pub(crate) fn receiver(&self) -> Option<Arc<dyn Receiver>> {
        self.receiver.lock().expect("receiver mutex poisoned").clone()
    }

    /// Number of RPC entries still pending on this session.
    pub fn rpc_pending(&self) -> usize {
        self.rpc.len()
    }

    /// Registers a disconnect sink; fired only on unsolicited loss.
    pub fn on_disconnect(&self, sink: impl Fn(&RemoteError) + Send + Sync + 'static) {
        self.hooks
            .on_disconnect
            .lock()
            .expect("hook mutex poisoned")
            .push(Arc::new(sink));
    }

    /// Registers a sink fired before reconnect attempts begin.
    pub fn on_pre_reconnect(&self, sink: impl Fn() + Send + Sync + 'static) {
        self.hooks
            .pre_reconnect
            .lock()
            .expect("hook mutex poisoned")
            .push(Arc::new(sink));
    }

    /// Registers a sink fired after a reconnect attempt succeeds.
    pub fn on_reconnect_success(&self, sink: impl Fn() + Send + Sync + 'static) {
        self.hooks
            .reconnect_success
            .lock()
            .expect("hook mutex poisoned")
            .push(Arc::new(sink));
    }

    // ---- send path ----

    /// Serializes and queues `message` for transmission.
    ///
    /// Serialization completes before this returns, so the caller may reuse
    /// or mutate the message immediately. The actual socket write happens on
    /// the driver task; writes are FIFO per session.
    pub fn send<M: Any>(&self, message: &M) -> Result<(), RemoteError> {
        self.send_erased(TypeId::of::<M>(), std::any::type_name::<M>(), message, 0)
    }

    /// Sends a request and returns the awaitable reply handle.
    ///
    /// A synchronous send failure releases the freshly allocated id and the
    /// returned handle resolves immediately with the error.
    pub fn rpc_send<R: Any, M: Any>(&self, message: &M) -> RpcReply<R> {
        let (rpc_id, reply) = match self.rpc.register::<R>() {
            Ok(registered) => registered,
            Err(err) => return RpcReply::failed(err),
        };
        if let Err(err) =
            self.send_erased(TypeId::of::<M>(), std::any::type_name::<M>(), message, rpc_id)
        {
            self.rpc.try_fail(rpc_id, err);
        }
        reply
    }

    /// Sends a request in the cancellable-without-exception form.
    ///
    /// On success `on_reply` runs with the typed reply; on any failure the
    /// reply continuation is abandoned and `on_err` runs instead.
    pub fn lazy_rpc_send<R, M, F, E>(&self, message: &M, on_reply: F, on_err: E)
    where
        R: Any,
        M: Any,
        F: FnOnce(R) + Send + 'static,
        E: FnOnce(RemoteError) + Send + 'static,
    {
        let rpc_id = match self.rpc.register_lazy::<R, F, E>(on_reply, on_err) {
            Ok(id) => id,
            Err(err) => {
                debug!(session = self.id, %err, "lazy rpc rejected at registration");
                return;
            }
        };
        if let Err(err) =
            self.send_erased(TypeId::of::<M>(), std::any::type_name::<M>(), message, rpc_id)
        {
            self.rpc.try_fail(rpc_id, err);
        }
    }

    /// Sends an already erased message, used by the pump's reply routing.
    pub(crate) fn send_boxed(
        &self,
        message: Box<dyn Any + Send>,
        rpc_id: i16,
    ) -> Result<(), RemoteError> {
        self.send_erased(message.as_ref().type_id(), "reply", message.as_ref(), rpc_id)
    }

    fn send_erased(
        &self,
        type_id: TypeId,
        type_name: &'static str,
        message: &dyn Any,
        rpc_id: i16,
    ) -> Result<(), RemoteError> {
        if !self.is_valid() {
            return Err(RemoteError::Disconnected);
        }
        let mut scratch = self.buffers.acquire();
        let message_id = self.table.encode_erased(type_id, type_name, message, &mut scratch)?;
        let mut framed = self.buffers.acquire();
        codec::frame(
            &mut framed,
            message_id,
            rpc_id,
            &scratch,
            self.options.max_packet_size,
        )?;
        drop(scratch);
        let outbound = self.outbound.lock().expect("outbound mutex poisoned");
        match outbound.as_ref() {
            Some(tx) => tx.send(framed).map_err(|_| RemoteError::Disconnected),
            None => Err(RemoteError::Disconnected),
        }
    }

    // ---- receive path ----

    /// Routes one parsed inbound packet.
    ///
    /// Called from the transport driver. Decode failures are logged and the
    /// frame is dropped; they never propagate to the application.
    pub(crate) fn ingest(self: &Arc<Self>, header: PacketHeader, body: &[u8]) {
        *self.last_receive.lock().expect("last receive mutex poisoned") = Instant::now();
        let decoded = match self.table.decode(header.message_id, body) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(session = self.id, message_id = header.message_id, %err, "dropping frame");
                return;
            }
        };
        if header.rpc_id < 0 {
            let actual = self
                .table
                .type_name_of(header.message_id)
                .unwrap_or("unknown");
            let rpc_id = header.rpc_id.unsigned_abs() as i16;
            if !self.rpc.try_complete(rpc_id, decoded, actual) {
                trace!(session = self.id, rpc_id, "late rpc reply discarded");
            }
        } else {
            self.pump.enqueue(Arc::clone(self), header.rpc_id, decoded);
        }
    }

    // ---- lifecycle ----

    /// Wires the session to a live transport driver.
    pub(crate) fn attach(
        &self,
        outbound: mpsc::UnboundedSender<PooledBuffer>,
        target: Option<SocketAddr>,
        local: Option<SocketAddr>,
        peer: Option<SocketAddr>,
    ) {
        *self.outbound.lock().expect("outbound mutex poisoned") = Some(outbound);
        if target.is_some() {
            *self.target_addr.lock().expect("addr mutex poisoned") = target;
        }
        *self.local_addr.lock().expect("addr mutex poisoned") = local;
        *self.peer_addr.lock().expect("addr mutex poisoned") = peer;
        self.user_closed.store(false, Ordering::Release);
        self.valid.store(true, Ordering::Release);
    }

    /// User-initiated teardown.
    ///
    /// Closes the transport, invalidates the session and fails every pending
    /// RPC with [`RemoteError::Disconnected`]. Does not fire the disconnect
    /// hooks: the user asked for this.
    pub fn disconnect(&self) {
        self.user_closed.store(true, Ordering::Release);
        self.valid.store(false, Ordering::Release);
        // Dropping the sender closes the driver's queue; the driver exits
        // and the socket goes down with it.
        self.outbound.lock().expect("outbound mutex poisoned").take();
        self.rpc.fail_all(RemoteError::Disconnected);
    }

    pub(crate) fn user_closed(&self) -> bool {
        self.user_closed.load(Ordering::Acquire)
    }

    /// Final teardown after an unsolicited transport loss (no reconnect, or
    /// the reconnect window closed). Fires the disconnect hooks.
    pub(crate) fn close_after_loss(&self, reason: &RemoteError) {
        self.valid.store(false, Ordering::Release);
        self.outbound.lock().expect("outbound mutex poisoned").take();
        self.rpc.fail_all(RemoteError::Disconnected);
        self.fire_disconnect(reason);
    }

    pub(crate) fn fire_disconnect(&self, reason: &RemoteError) {
        let sinks: SmallVec<[DisconnectSink; 2]> = self
            .hooks
            .on_disconnect
            .lock()
            .expect("hook mutex poisoned")
            .clone();
        for sink in sinks {
            if catch_unwind(AssertUnwindSafe(|| sink(reason))).is_err() {
                warn!(session = self.id, "disconnect sink panicked");
            }
        }
    }

    pub(crate) fn fire_pre_reconnect(&self) {
        let sinks: SmallVec<[EventSink; 2]> = self
            .hooks
            .pre_reconnect
            .lock()
            .expect("hook mutex poisoned")
            .clone();
        for sink in sinks {
            if catch_unwind(AssertUnwindSafe(|| sink())).is_err() {
                warn!(session = self.id, "pre-reconnect sink panicked");
            }
        }
    }

    pub(crate) fn fire_reconnect_success(&self) {
        let sinks: SmallVec<[EventSink; 2]> = self
            .hooks
            .reconnect_success
            .lock()
            .expect("hook mutex poisoned")
            .clone();
        for sink in sinks {
            if catch_unwind(AssertUnwindSafe(|| sink())).is_err() {
                warn!(session = self.id, "reconnect-success sink panicked");
            }
        }
    }

    /// Spawns the timeout sweeper for this session's RPC pool.
    ///
    /// The task holds only a weak reference, so it never keeps a session
    /// alive; it ends once the session is gone or closed with no pending
    /// entries left to expire.
    pub(crate) fn spawn_sweeper(self: &Arc<Self>) {
        let weak: Weak<Remote> = Arc::downgrade(self);
        let tick = (self.options.rpc_timeout() / 4)
            .clamp(Duration::from_millis(10), Duration::from_secs(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                let Some(remote) = weak.upgrade() else {
                    break;
                };
                remote.rpc.sweep(Instant::now());
                if !remote.is_valid() && remote.rpc.is_empty() {
                    break;
                }
            }
        });
    }
}
