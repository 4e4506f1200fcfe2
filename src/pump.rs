//! The bridge between I/O worker tasks and the application context.
//!
//! Reader tasks decode inbound packets on whatever worker thread the runtime
//! gave them; application handlers must run on the host's single logical
//! thread (a game loop, a tick task). The pump is that bridge: enqueue is
//! non-blocking and callable from any task, and [`MessagePump::drain`] is
//! called from the application context, dispatching each queued message
//! through its session's receiver in enqueue order.
//!
//! One pump serves the whole process; sessions hold a cheap [`PumpHandle`]
//! clone. Because a single consumer dequeues and awaits each handler before
//! taking the next item, handlers observe messages in enqueue order per
//! session.

use std::any::Any;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::remote::Remote;

struct Delivery {
    session: Arc<Remote>,
    rpc_id: i16,
    message: Box<dyn Any + Send>,
}

/// Producer side of the pump, held by every session.
#[derive(Clone)]
pub struct PumpHandle {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl PumpHandle {
    pub(crate) fn enqueue(&self, session: Arc<Remote>, rpc_id: i16, message: Box<dyn Any + Send>) {
        if self.tx.send(Delivery { session, rpc_id, message }).is_err() {
            warn!("message pump dropped, discarding inbound message");
        }
    }
}

/// Consumer side of the pump, owned by the application context.
pub struct MessagePump {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl MessagePump {
    /// Creates a pump and the handle sessions enqueue through.
    pub fn new() -> (MessagePump, PumpHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (MessagePump { rx }, PumpHandle { tx })
    }

    /// Dispatches up to `max` queued messages, returning how many ran.
    ///
    /// Call this from the application's tick. An empty queue returns
    /// immediately; the cost is proportional to what was queued. Each
    /// handler is awaited before the next item is taken, preserving
    /// per-session delivery order.
    pub async fn drain(&mut self, max: usize) -> usize {
        let mut handled = 0;
        while handled < max {
            match self.rx.try_recv() {
                Ok(delivery) => {
                    dispatch(delivery).await;
                    handled += 1;
                }
                Err(_) => break,
            }
        }
        handled
    }

    /// Serves the pump until every handle is dropped.
    ///
    /// Convenience loop for hosts that have no tick of their own; spawn it
    /// on the task that should own handler execution.
    pub async fn serve(mut self) {
        while let Some(delivery) = self.rx.recv().await {
            dispatch(delivery).await;
        }
        trace!("message pump finished");
    }
}

async fn dispatch(delivery: Delivery) {
    let Delivery { session, rpc_id, message } = delivery;
    let Some(receiver) = session.receiver() else {
        warn!(session = session.id(), "no receiver set, dropping message");
        return;
    };
    let reply = receiver.deal_message(Arc::clone(&session), message).await;
    if rpc_id > 0 {
        match reply {
            Some(reply) => {
                if let Err(err) = session.send_boxed(reply, -rpc_id) {
                    warn!(session = session.id(), %err, "failed to send rpc reply");
                }
            }
            // The peer's entry for this id will expire on its own sweeper.
            None => trace!(session = session.id(), rpc_id, "handler returned no reply"),
        }
    } else if reply.is_some() {
        warn!(session = session.id(), "reply returned for a message that expected none");
    }
}
