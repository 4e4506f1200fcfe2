//! Reconnect supervisor for stream sessions.
//!
//! When a session with `is_reconnect` loses its transport without the user
//! asking, the driver calls into this module to re-establish the stream.
//! Attempts run with exponential backoff until one succeeds or the
//! configured window closes. Event ordering is owned by the driver: it fires
//! `pre_reconnect` before calling in and `reconnect_success` after a stream
//! comes back; window exhaustion is reported by returning `None`.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use crate::remote::Remote;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Retries the session's target address until the reconnect window closes.
///
/// Returns the fresh stream on success, `None` on window exhaustion. Pending
/// RPC entries are left untouched either way; they resolve when the peer
/// answers over the new stream or when their own deadlines expire.
pub(crate) async fn reattempt(session: &Arc<Remote>) -> Option<TcpStream> {
    let target = session.target_addr()?;
    let deadline = Instant::now() + session.options().reconnect_window();
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let remaining = deadline.checked_duration_since(Instant::now())?;
        match timeout(remaining, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => {
                info!(session = session.id(), %target, attempt, "reconnected");
                return Some(stream);
            }
            Ok(Err(err)) => {
                debug!(session = session.id(), %target, attempt, "reconnect attempt failed: {err:?}");
            }
            Err(_) => {
                debug!(session = session.id(), %target, "reconnect window exhausted");
                return None;
            }
        }
        let remaining = deadline.checked_duration_since(Instant::now())?;
        sleep(backoff.min(remaining)).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}
