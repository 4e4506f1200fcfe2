//! Reliable-stream sessions and the stream listener.
//!
//! A TCP session runs one driver task owning the socket. The driver mixes
//! two event sources with `select!`: socket readability (bytes are pulled
//! with `try_read` into a sliding receive buffer and complete packets handed
//! to the session core) and the session's outbound queue (framed packets
//! written FIFO). Closing the queue from [`Remote::disconnect`] shuts the
//! driver down quietly; a transport error instead engages the reconnect
//! supervisor or fires the disconnect hooks.

use std::io;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::buffer::PooledBuffer;
use crate::config::RemoteOptions;
use crate::error::RemoteError;
use crate::protocol::codec;
use crate::protocol::lut::MessageTable;
use crate::pump::PumpHandle;
use crate::reconnect;
use crate::remote::{Receiver, Remote};

/// A session over a reliable ordered stream.
///
/// Dereferences to the shared [`Remote`] core, so `send`, `rpc_send`,
/// `disconnect` and the event hooks are called directly on this type.
pub struct TcpRemote {
    session: Arc<Remote>,
    /// Present only between accept and `start`.
    pending: Mutex<Option<TcpStream>>,
}

impl Deref for TcpRemote {
    type Target = Remote;

    fn deref(&self) -> &Remote {
        &self.session
    }
}

impl TcpRemote {
    /// Connects to `target` and starts the session immediately.
    ///
    /// The receiver is installed before the driver spawns, so the first
    /// inbound message already has a handler.
    pub async fn connect(
        target: SocketAddr,
        receiver: Arc<dyn Receiver>,
        table: Arc<MessageTable>,
        pump: PumpHandle,
        options: RemoteOptions,
    ) -> Result<TcpRemote, RemoteError> {
        let stream = TcpStream::connect(target)
            .await
            .map_err(|e| RemoteError::ConnectFailed(e.to_string()))?;
        let session = Remote::new(options, table, pump);
        session.set_receiver(receiver);
        start_session(&session, stream, Some(target));
        Ok(TcpRemote { session, pending: Mutex::new(None) })
    }

    /// Starts an accepted session.
    ///
    /// The caller sets the receiver first; calling `start` twice or on a
    /// session that never held a pending socket is
    /// [`RemoteError::AlreadyConnected`].
    pub fn start(&self) -> Result<(), RemoteError> {
        let stream = self
            .pending
            .lock()
            .expect("pending stream mutex poisoned")
            .take()
            .ok_or(RemoteError::AlreadyConnected)?;
        start_session(&self.session, stream, None);
        Ok(())
    }

    /// Shared session core, for handing to handler closures.
    pub fn session(&self) -> Arc<Remote> {
        Arc::clone(&self.session)
    }
}

fn start_session(session: &Arc<Remote>, stream: TcpStream, target: Option<SocketAddr>) {
    let _ = stream.set_nodelay(true);
    let local = stream.local_addr().ok();
    let peer = stream.peer_addr().ok();
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    session.attach(outbound_tx, target, local, peer);
    session.spawn_sweeper();
    let session = Arc::clone(session);
    tokio::spawn(async move {
        run_session(stream, session, outbound_rx).await;
    });
}

/// Driver task: one stream at a time, resumed across reconnects.
async fn run_session(
    mut stream: TcpStream,
    session: Arc<Remote>,
    mut outbound_rx: mpsc::UnboundedReceiver<PooledBuffer>,
) {
    loop {
        let reason = match drive(&mut stream, &session, &mut outbound_rx).await {
            Ok(()) => {
                debug!(session = session.id(), "session closed");
                return;
            }
            Err(reason) => reason,
        };
        if session.user_closed() {
            return;
        }
        debug!(session = session.id(), %reason, "transport lost");
        // A framing error means the byte stream itself is corrupt; the
        // session is closed rather than reconnected.
        if matches!(reason, RemoteError::FramingError(_))
            || !session.options().is_reconnect
            || session.target_addr().is_none()
        {
            session.close_after_loss(&reason);
            return;
        }
        session.fire_pre_reconnect();
        match reconnect::reattempt(&session).await {
            Some(new_stream) => {
                let _ = new_stream.set_nodelay(true);
                stream = new_stream;
                session.fire_reconnect_success();
            }
            None => {
                session.close_after_loss(&reason);
                return;
            }
        }
    }
}

/// Runs one stream until the peer closes it, the transport errors, or the
/// session's outbound queue is closed by `disconnect` (the `Ok` case).
async fn drive(
    stream: &mut TcpStream,
    session: &Arc<Remote>,
    outbound_rx: &mut mpsc::UnboundedReceiver<PooledBuffer>,
) -> Result<(), RemoteError> {
    let max_packet = session.options().max_packet_size;
    let mut recv_buf: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            _ = stream.readable() => {
                match stream.try_read(&mut chunk) {
                    Ok(0) => return Err(RemoteError::Disconnected),
                    Ok(n) => {
                        recv_buf.extend_from_slice(&chunk[..n]);
                        // A framing error on a stream poisons every later
                        // byte, so it is fatal for the session.
                        while let Some((header, body)) =
                            codec::extract_frame(&mut recv_buf, max_packet)?
                        {
                            session.ingest(header, &body);
                        }
                    }
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        debug!(session = session.id(), "read failed: {e:?}");
                        return Err(RemoteError::Disconnected);
                    }
                }
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = stream.write_all(&frame).await {
                            debug!(session = session.id(), "write failed: {e:?}");
                            return Err(RemoteError::Disconnected);
                        }
                        trace!(session = session.id(), len = frame.len(), "frame written");
                    }
                    None => return Ok(()),
                }
            }
        }
    }
}

/// Accepts stream sessions, one per [`listen`](Self::listen) call.
pub struct TcpRemoteListener {
    listener: TcpListener,
    table: Arc<MessageTable>,
    pump: PumpHandle,
    options: RemoteOptions,
}

impl TcpRemoteListener {
    /// Binds the listener. Sessions accepted later share `table`, `pump`
    /// and `options`.
    pub async fn bind(
        addr: SocketAddr,
        table: Arc<MessageTable>,
        pump: PumpHandle,
        options: RemoteOptions,
    ) -> io::Result<TcpRemoteListener> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "stream listener bound");
        Ok(TcpRemoteListener { listener, table, pump, options })
    }

    /// Address the listener actually bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts one peer and returns the unstarted session.
    ///
    /// The caller installs a receiver and then calls [`TcpRemote::start`].
    /// `listen` may be called again immediately to accept concurrently.
    pub async fn listen(&self) -> Result<TcpRemote, RemoteError> {
        let (stream, peer) = self
            .listener
            .accept()
            .await
            .map_err(|e| RemoteError::ConnectFailed(e.to_string()))?;
        info!(%peer, "accepted stream session");
        let session = Remote::new(
            self.options.clone(),
            Arc::clone(&self.table),
            self.pump.clone(),
        );
        Ok(TcpRemote { session, pending: Mutex::new(Some(stream)) })
    }
}

impl std::fmt::Debug for TcpRemoteListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpRemoteListener")
            .field("local_addr", &self.listener.local_addr().ok())
            .finish()
    }
}

impl Drop for TcpRemote {
    fn drop(&mut self) {
        if let Some(stream) = self
            .pending
            .lock()
            .expect("pending stream mutex poisoned")
            .take()
        {
            warn!(session = self.session.id(), "session dropped before start");
            drop(stream);
        }
    }
}
