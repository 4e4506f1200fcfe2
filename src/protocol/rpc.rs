//! Per-session RPC callback pool.
//!
//! Multiplexes synchronous request/response exchanges over the asynchronous
//! message flow. Each outgoing request borrows a short correlation id from
//! `[1, 32767]`; the peer echoes the id negated on the reply, and the pool
//! routes the decoded reply back to whoever registered the id. Entries fire
//! at most once: removal from the map and completion happen under a single
//! map operation, with the continuation invoked after the lock is released.
//!
//! The pool tolerates concurrent registration (caller task) and completion
//! (reader task); a timeout sweep expires entries that never saw a reply.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::RemoteError;

/// Correlation ids live in `[1, i16::MAX]`; the id space therefore holds
/// this many concurrent entries.
const ID_SPACE: usize = i16::MAX as usize;

type ErasedMessage = Box<dyn Any + Send>;
type ErasedResult = Result<ErasedMessage, RemoteError>;

enum Completer {
    /// Awaitable form: resolves the caller's [`RpcReply`] future.
    Reply(oneshot::Sender<ErasedResult>),
    /// Cancellable-without-exception form: on failure the reply callback is
    /// never invoked and the error callback runs instead.
    Lazy {
        on_reply: Box<dyn FnOnce(ErasedMessage) + Send>,
        on_err: Box<dyn FnOnce(RemoteError) + Send>,
    },
}

struct RpcEntry {
    started: Instant,
    expected_type: TypeId,
    expected_name: &'static str,
    completer: Completer,
}

struct PoolState {
    next_id: i16,
    entries: HashMap<i16, RpcEntry>,
}

/// Allocates correlation ids, stores pending continuations and delivers
/// results, failures and timeouts.
pub struct RpcPool {
    timeout: Duration,
    state: Mutex<PoolState>,
}

impl RpcPool {
    /// Creates a pool whose entries expire after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        RpcPool {
            timeout,
            state: Mutex::new(PoolState { next_id: 1, entries: HashMap::new() }),
        }
    }

    /// Registers a pending call expecting a reply of type `R`.
    ///
    /// Returns the allocated correlation id and the awaitable reply handle.
    /// Dropping the handle does not release the id; the slot frees when the
    /// reply arrives, the call fails, or the sweeper expires it.
    pub fn register<R: Any>(&self) -> Result<(i16, RpcReply<R>), RemoteError> {
        let (tx, rx) = oneshot::channel();
        let id = self.insert(TypeId::of::<R>(), std::any::type_name::<R>(), Completer::Reply(tx))?;
        Ok((id, RpcReply { rx, _marker: PhantomData }))
    }

    /// Registers a pending call in the cancellable-without-exception form.
    ///
    /// On success `on_reply` runs with the decoded reply; on any failure
    /// (timeout, disconnect, type mismatch, synchronous send error) the
    /// reply callback is abandoned and `on_err` runs instead. Callbacks are
    /// invoked on the completing task.
    pub fn register_lazy<R, F, E>(&self, on_reply: F, on_err: E) -> Result<i16, RemoteError>
    where
        R: Any,
        F: FnOnce(R) + Send + 'static,
        E: FnOnce(RemoteError) + Send + 'static,
    {
        let completer = Completer::Lazy {
            on_reply: Box::new(move |message| {
                if let Ok(message) = message.downcast::<R>() {
                    on_reply(*message);
                }
            }),
            on_err: Box::new(on_err),
        };
        self.insert(TypeId::of::<R>(), std::any::type_name::<R>(), completer)
    }

    fn insert(
        &self,
        expected_type: TypeId,
        expected_name: &'static str,
        completer: Completer,
    ) -> Result<i16, RemoteError> {
        let mut state = self.state.lock().expect("rpc pool mutex poisoned");
        if state.entries.len() >= ID_SPACE {
            return Err(RemoteError::PoolExhausted);
        }
        // Monotonic allocation modulo i16::MAX, skipping ids still in use.
        let id = loop {
            let candidate = state.next_id;
            state.next_id = if candidate == i16::MAX { 1 } else { candidate + 1 };
            if !state.entries.contains_key(&candidate) {
                break candidate;
            }
        };
        let entry = RpcEntry {
            started: Instant::now(),
            expected_type,
            expected_name,
            completer,
        };
        state.entries.insert(id, entry);
        Ok(id)
    }

    /// Removes and fires the entry for `rpc_id` with a decoded reply.
    ///
    /// A reply whose runtime type is not the registered result type
    /// completes the entry with [`RemoteError::TypeMismatch`]; `actual`
    /// names the arriving type for that diagnostic. Returns `false` when no
    /// entry matches (a late or duplicate reply, discarded by the caller).
    pub fn try_complete(&self, rpc_id: i16, message: ErasedMessage, actual: &'static str) -> bool {
        let entry = {
            let mut state = self.state.lock().expect("rpc pool mutex poisoned");
            state.entries.remove(&rpc_id)
        };
        let Some(entry) = entry else {
            trace!(rpc_id, "reply for unknown correlation id discarded");
            return false;
        };
        let result = if message.as_ref().type_id() == entry.expected_type {
            Ok(message)
        } else {
            Err(RemoteError::TypeMismatch { expected: entry.expected_name, actual })
        };
        fire(entry, result);
        true
    }

    /// Removes and fires the entry for `rpc_id` with an error.
    pub fn try_fail(&self, rpc_id: i16, err: RemoteError) -> bool {
        let entry = {
            let mut state = self.state.lock().expect("rpc pool mutex poisoned");
            state.entries.remove(&rpc_id)
        };
        match entry {
            Some(entry) => {
                fire(entry, Err(err));
                true
            }
            None => false,
        }
    }

    /// Fails every pending entry, used when the owning session goes away.
    pub fn fail_all(&self, err: RemoteError) {
        let drained: Vec<RpcEntry> = {
            let mut state = self.state.lock().expect("rpc pool mutex poisoned");
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending rpc entries");
        }
        for entry in drained {
            fire(entry, Err(err.clone()));
        }
    }

    /// Expires entries older than the pool timeout, firing each with
    /// [`RemoteError::Timeout`].
    pub fn sweep(&self, now: Instant) {
        let expired: Vec<RpcEntry> = {
            let mut state = self.state.lock().expect("rpc pool mutex poisoned");
            let deadline = self.timeout;
            let dead: Vec<i16> = state
                .entries
                .iter()
                .filter(|(_, e)| now.saturating_duration_since(e.started) > deadline)
                .map(|(id, _)| *id)
                .collect();
            dead.into_iter()
                .filter_map(|id| state.entries.remove(&id))
                .collect()
        };
        for entry in expired {
            trace!("rpc entry expired");
            fire(entry, Err(RemoteError::Timeout));
        }
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.state.lock().expect("rpc pool mutex poisoned").entries.len()
    }

    /// True when no entries are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn fire(entry: RpcEntry, result: ErasedResult) {
    match entry.completer {
        // The caller may have dropped the reply future; a failed send here
        // only means nobody is listening anymore.
        Completer::Reply(tx) => {
            let _ = tx.send(result);
        }
        Completer::Lazy { on_reply, on_err } => match result {
            Ok(message) => on_reply(message),
            Err(err) => on_err(err),
        },
    }
}

/// Awaitable handle for a registered RPC, resolving to the typed reply or
/// the error that completed the entry.
pub struct RpcReply<R> {
    rx: oneshot::Receiver<ErasedResult>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> RpcReply<R> {
    /// A reply that is already failed, for calls rejected before an entry
    /// could be registered.
    pub(crate) fn failed(err: RemoteError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        RpcReply { rx, _marker: PhantomData }
    }
}

impl<R: Any> Future for RpcReply<R> {
    type Output = Result<R, RemoteError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Ok(message))) => match message.downcast::<R>() {
                Ok(message) => Poll::Ready(Ok(*message)),
                // The pool verified the type before completing; reaching
                // this arm means the entry was registered for a different R.
                Err(_) => Poll::Ready(Err(RemoteError::TypeMismatch {
                    expected: std::any::type_name::<R>(),
                    actual: "erased",
                })),
            },
            Poll::Ready(Ok(Err(err))) => Poll::Ready(Err(err)),
            // The pool itself was dropped without completing the entry.
            Poll::Ready(Err(_)) => Poll::Ready(Err(RemoteError::Disconnected)),
        }
    }
}
