//! Connection-emulated sessions over a shared datagram socket.
//!
//! One UDP socket serves many peers. The listener runs a single `recv_from`
//! loop and demultiplexes by source address: datagrams carrying the reserved
//! handshake message id feed the accept machinery, everything else routes to
//! the virtual session registered for that address.
//!
//! The handshake is three header-only packets distinguished by the `rpc_id`
//! field: the client sends CONNECT (1), the acceptor answers (−1), and the
//! client confirms (0). Duplicate CONNECTs from an address whose accept is
//! still in flight join the existing attempt instead of creating a second
//! session. An accept that sees no confirmation within the deadline is
//! disposed, and the in-flight table entry is removed on every outcome.
//!
//! An accepted session is handed to the caller inert: the peer's address
//! enters the demux table only when [`UdpRemote::start`] runs, after the
//! caller has installed a receiver, so no datagram can reach the pump
//! before a receiver exists. Datagrams arriving in between are dropped the
//! same way any unknown-peer datagram is.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, trace, warn};

use crate::buffer::PooledBuffer;
use crate::config::RemoteOptions;
use crate::error::RemoteError;
use crate::protocol::codec;
use crate::protocol::lut::MessageTable;
use crate::protocol::UDP_CONNECT_MESSAGE_ID;
use crate::pump::PumpHandle;
use crate::remote::{Receiver, Remote};

/// Handshake roles carried in the `rpc_id` field of a handshake packet.
const HANDSHAKE_SYN: i16 = 1;
const HANDSHAKE_ACK: i16 = -1;
const HANDSHAKE_CONFIRM: i16 = 0;

/// How long either side waits for the handshake to finish.
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(5);
/// Client-side CONNECT retransmissions inside the deadline.
const HANDSHAKE_ATTEMPTS: u32 = 3;

fn handshake_packet(rpc_id: i16, max_packet: usize) -> Vec<u8> {
    let mut packet = Vec::with_capacity(codec::HEADER_LEN);
    codec::frame(&mut packet, UDP_CONNECT_MESSAGE_ID, rpc_id, &[], max_packet)
        .expect("header-only packet always fits");
    packet
}

/// Accepted-session state held between `listen` and `start`.
struct PendingAccept {
    socket: Arc<UdpSocket>,
    state: Arc<DemuxState>,
    addr: SocketAddr,
}

/// A connection-emulated session over a datagram socket.
///
/// Dereferences to the shared [`Remote`] core.
pub struct UdpRemote {
    session: Arc<Remote>,
    /// Present only between accept and `start`.
    pending: Mutex<Option<PendingAccept>>,
}

impl Deref for UdpRemote {
    type Target = Remote;

    fn deref(&self) -> &Remote {
        &self.session
    }
}

impl std::fmt::Debug for UdpRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpRemote").finish_non_exhaustive()
    }
}

impl UdpRemote {
    /// Connects to a datagram listener at `target` and starts the session.
    ///
    /// Performs the three-way handshake, retransmitting the CONNECT a
    /// bounded number of times before giving up with
    /// [`RemoteError::ConnectFailed`].
    pub async fn connect(
        target: SocketAddr,
        receiver: Arc<dyn Receiver>,
        table: Arc<MessageTable>,
        pump: PumpHandle,
        options: RemoteOptions,
    ) -> Result<UdpRemote, RemoteError> {
        let bind_addr: SocketAddr = if target.is_ipv6() {
            "[::]:0".parse().expect("literal address")
        } else {
            "0.0.0.0:0".parse().expect("literal address")
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| RemoteError::ConnectFailed(e.to_string()))?;
        socket
            .connect(target)
            .await
            .map_err(|e| RemoteError::ConnectFailed(e.to_string()))?;

        let max_packet = options.max_packet_size;
        handshake(&socket, max_packet).await?;

        let confirm = handshake_packet(HANDSHAKE_CONFIRM, max_packet);
        socket
            .send(&confirm)
            .await
            .map_err(|e| RemoteError::ConnectFailed(e.to_string()))?;

        let session = Remote::new(options, table, pump);
        session.set_receiver(receiver);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        session.attach(outbound_tx, Some(target), socket.local_addr().ok(), Some(target));
        session.spawn_sweeper();
        let socket = Arc::new(socket);
        tokio::spawn(client_drive(socket, Arc::clone(&session), outbound_rx, confirm));
        Ok(UdpRemote { session, pending: Mutex::new(None) })
    }

    /// Starts an accepted session.
    ///
    /// The caller sets the receiver first; until `start` runs the listener
    /// does not route the peer's datagrams to this session. Calling `start`
    /// twice, or on a client session, is
    /// [`RemoteError::AlreadyConnected`].
    pub fn start(&self) -> Result<(), RemoteError> {
        let pending = self
            .pending
            .lock()
            .expect("pending accept mutex poisoned")
            .take()
            .ok_or(RemoteError::AlreadyConnected)?;
        let PendingAccept { socket, state, addr } = pending;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.session
            .attach(outbound_tx, None, socket.local_addr().ok(), Some(addr));
        self.session.spawn_sweeper();
        state
            .connected
            .lock()
            .expect("connected table mutex poisoned")
            .insert(addr, Arc::clone(&self.session));
        tokio::spawn(write_loop(
            socket,
            Arc::clone(&self.session),
            outbound_rx,
            state,
            addr,
        ));
        Ok(())
    }

    /// Shared session core, for handing to handler closures.
    pub fn session(&self) -> Arc<Remote> {
        Arc::clone(&self.session)
    }
}

impl Drop for UdpRemote {
    fn drop(&mut self) {
        if let Some(pending) = self
            .pending
            .lock()
            .expect("pending accept mutex poisoned")
            .take()
        {
            warn!(session = self.session.id(), addr = %pending.addr, "session dropped before start");
        }
    }
}

/// Sends CONNECT and waits for the acceptor's answer.
async fn handshake(socket: &UdpSocket, max_packet: usize) -> Result<(), RemoteError> {
    let syn = handshake_packet(HANDSHAKE_SYN, max_packet);
    let mut buf = vec![0u8; max_packet];
    let per_attempt = HANDSHAKE_DEADLINE / HANDSHAKE_ATTEMPTS;
    for attempt in 1..=HANDSHAKE_ATTEMPTS {
        socket
            .send(&syn)
            .await
            .map_err(|e| RemoteError::ConnectFailed(e.to_string()))?;
        trace!(attempt, "handshake connect sent");
        let attempt_end = Instant::now() + per_attempt;
        while let Some(remaining) = attempt_end.checked_duration_since(Instant::now()) {
            match timeout(remaining, socket.recv(&mut buf)).await {
                Ok(Ok(n)) => match codec::parse_datagram(&buf[..n], max_packet) {
                    Ok((header, _))
                        if header.message_id == UDP_CONNECT_MESSAGE_ID
                            && header.rpc_id == HANDSHAKE_ACK =>
                    {
                        return Ok(());
                    }
                    // Anything else this early is stray traffic.
                    Ok(_) | Err(_) => {}
                },
                Ok(Err(e)) => return Err(RemoteError::ConnectFailed(e.to_string())),
                Err(_) => break,
            }
        }
    }
    Err(RemoteError::ConnectFailed("handshake timed out".to_string()))
}

/// Client driver: one connected socket, one peer.
async fn client_drive(
    socket: Arc<UdpSocket>,
    session: Arc<Remote>,
    mut outbound_rx: mpsc::UnboundedReceiver<PooledBuffer>,
    confirm: Vec<u8>,
) {
    let max_packet = session.options().max_packet_size;
    let mut buf = vec![0u8; max_packet];
    loop {
        tokio::select! {
            received = socket.recv(&mut buf) => {
                match received {
                    Ok(n) => match codec::parse_datagram(&buf[..n], max_packet) {
                        Ok((header, body)) => {
                            if header.message_id == UDP_CONNECT_MESSAGE_ID {
                                // The acceptor missed our confirmation and
                                // is still answering the handshake.
                                if header.rpc_id == HANDSHAKE_ACK {
                                    let _ = socket.send(&confirm).await;
                                }
                            } else {
                                session.ingest(header, body);
                            }
                        }
                        // Partial datagrams drop; the session lives on.
                        Err(err) => trace!(session = session.id(), %err, "datagram dropped"),
                    },
                    Err(e) => {
                        debug!(session = session.id(), "datagram socket failed: {e:?}");
                        if !session.user_closed() {
                            session.close_after_loss(&RemoteError::Disconnected);
                        }
                        return;
                    }
                }
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = socket.send(&frame).await {
                            debug!(session = session.id(), "datagram send failed: {e:?}");
                        }
                    }
                    None => return,
                }
            }
        }
    }
}

struct DemuxState {
    /// Handshakes still in flight, keyed by peer address. Each entry
    /// forwards further handshake packets into the accept task; entries are
    /// removed when the accept resolves, whatever the outcome.
    connecting: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<i16>>>,
    /// Live virtual sessions, keyed by peer address.
    connected: Mutex<HashMap<SocketAddr, Arc<Remote>>>,
}

/// Demultiplexes one datagram socket into virtual accepted sessions.
pub struct UdpRemoteListener {
    local_addr: SocketAddr,
    accepted: tokio::sync::Mutex<mpsc::UnboundedReceiver<UdpRemote>>,
}

impl UdpRemoteListener {
    /// Binds the shared socket and starts the demux loop.
    pub async fn bind(
        addr: SocketAddr,
        table: Arc<MessageTable>,
        pump: PumpHandle,
        options: RemoteOptions,
    ) -> io::Result<UdpRemoteListener> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local_addr = socket.local_addr()?;
        info!(%local_addr, "datagram listener bound");
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        let state = Arc::new(DemuxState {
            connecting: Mutex::new(HashMap::new()),
            connected: Mutex::new(HashMap::new()),
        });
        tokio::spawn(read_loop(socket, state, accepted_tx, table, pump, options));
        Ok(UdpRemoteListener { local_addr, accepted: tokio::sync::Mutex::new(accepted_rx) })
    }

    /// Address the shared socket bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the next accepted session, from the queue or by waiting.
    ///
    /// The session comes back unstarted: install a receiver and then call
    /// [`UdpRemote::start`], exactly as with the stream listener. At most
    /// one task may wait at a time; a second concurrent call is a usage
    /// error and fails immediately.
    pub async fn listen(&self) -> Result<UdpRemote, RemoteError> {
        let mut accepted = self.accepted.try_lock().map_err(|_| {
            RemoteError::ConnectFailed("another task is already waiting on listen".to_string())
        })?;
        accepted.recv().await.ok_or(RemoteError::Disconnected)
    }
}

async fn read_loop(
    socket: Arc<UdpSocket>,
    state: Arc<DemuxState>,
    accepted_tx: mpsc::UnboundedSender<UdpRemote>,
    table: Arc<MessageTable>,
    pump: PumpHandle,
    options: RemoteOptions,
) {
    let max_packet = options.max_packet_size;
    let mut buf = vec![0u8; max_packet];
    loop {
        let (n, addr) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("datagram listener recv failed: {e:?}");
                continue;
            }
        };
        let (header, body) = match codec::parse_datagram(&buf[..n], max_packet) {
            Ok(parsed) => parsed,
            Err(err) => {
                trace!(%addr, %err, "datagram dropped");
                continue;
            }
        };
        if header.message_id == UDP_CONNECT_MESSAGE_ID {
            handle_handshake(
                header.rpc_id,
                addr,
                &socket,
                &state,
                &accepted_tx,
                &table,
                &pump,
                &options,
            );
        } else {
            let session = state
                .connected
                .lock()
                .expect("connected table mutex poisoned")
                .get(&addr)
                .cloned();
            match session {
                Some(session) => session.ingest(header, body),
                None => trace!(%addr, "datagram from unknown peer dropped"),
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_handshake(
    rpc_id: i16,
    addr: SocketAddr,
    socket: &Arc<UdpSocket>,
    state: &Arc<DemuxState>,
    accepted_tx: &mpsc::UnboundedSender<UdpRemote>,
    table: &Arc<MessageTable>,
    pump: &PumpHandle,
    options: &RemoteOptions,
) {
    let already_connected = state
        .connected
        .lock()
        .expect("connected table mutex poisoned")
        .contains_key(&addr);
    if already_connected {
        // Late duplicate confirm, or a peer that missed the final exchange
        // and is still retransmitting CONNECT; settle it with a fresh answer.
        if rpc_id == HANDSHAKE_SYN {
            let ack = handshake_packet(HANDSHAKE_ACK, options.max_packet_size);
            let socket = Arc::clone(socket);
            tokio::spawn(async move {
                let _ = socket.send_to(&ack, addr).await;
            });
        }
        return;
    }

    let mut connecting = state
        .connecting
        .lock()
        .expect("connecting table mutex poisoned");
    if let Some(joined) = connecting.get(&addr) {
        // A second handshake packet during an in-flight accept joins it.
        let _ = joined.send(rpc_id);
        return;
    }
    if rpc_id != HANDSHAKE_SYN {
        trace!(%addr, rpc_id, "stray handshake packet dropped");
        return;
    }
    let (join_tx, join_rx) = mpsc::unbounded_channel();
    connecting.insert(addr, join_tx);
    drop(connecting);
    debug!(%addr, "datagram handshake started");
    tokio::spawn(try_accept(
        Arc::clone(socket),
        addr,
        join_rx,
        Arc::clone(state),
        accepted_tx.clone(),
        Arc::clone(table),
        pump.clone(),
        options.clone(),
    ));
}

/// Per-peer accept task with a hard deadline.
#[allow(clippy::too_many_arguments)]
async fn try_accept(
    socket: Arc<UdpSocket>,
    addr: SocketAddr,
    mut join_rx: mpsc::UnboundedReceiver<i16>,
    state: Arc<DemuxState>,
    accepted_tx: mpsc::UnboundedSender<UdpRemote>,
    table: Arc<MessageTable>,
    pump: PumpHandle,
    options: RemoteOptions,
) {
    let ack = handshake_packet(HANDSHAKE_ACK, options.max_packet_size);
    let _ = socket.send_to(&ack, addr).await;
    let deadline = Instant::now() + HANDSHAKE_DEADLINE;
    let confirmed = loop {
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            break false;
        };
        match timeout(remaining, join_rx.recv()).await {
            Ok(Some(HANDSHAKE_SYN)) => {
                // Duplicate CONNECT joined this accept; answer it again.
                let _ = socket.send_to(&ack, addr).await;
            }
            Ok(Some(HANDSHAKE_CONFIRM)) => break true,
            Ok(Some(other)) => trace!(%addr, rpc_id = other, "stray handshake packet"),
            Ok(None) => break false,
            Err(_) => break false,
        }
    };
    state
        .connecting
        .lock()
        .expect("connecting table mutex poisoned")
        .remove(&addr);
    if !confirmed {
        debug!(%addr, "datagram handshake expired");
        return;
    }

    let session = Remote::new(options, table, pump);
    info!(%addr, session = session.id(), "datagram session accepted");
    // The session is handed over inert; the peer's address enters the demux
    // table only when the caller runs `start` after installing a receiver.
    let accepted = UdpRemote {
        session,
        pending: Mutex::new(Some(PendingAccept { socket, state, addr })),
    };
    if accepted_tx.send(accepted).is_err() {
        debug!(%addr, "listener gone, dropping accepted session");
    }
}

/// Outbound half of a virtual session: frames go out `send_to` the peer.
///
/// When the queue closes (the session disconnected) the peer's demux entry
/// is unhooked, so later datagrams from that address no longer route here.
async fn write_loop(
    socket: Arc<UdpSocket>,
    session: Arc<Remote>,
    mut outbound_rx: mpsc::UnboundedReceiver<PooledBuffer>,
    state: Arc<DemuxState>,
    addr: SocketAddr,
) {
    while let Some(frame) = outbound_rx.recv().await {
        let dest = session.peer_addr().unwrap_or(addr);
        if let Err(e) = socket.send_to(&frame, dest).await {
            debug!(session = session.id(), "datagram send failed: {e:?}");
        }
    }
    state
        .connected
        .lock()
        .expect("connected table mutex poisoned")
        .remove(&addr);
    trace!(session = session.id(), %addr, "datagram session unhooked");
}
