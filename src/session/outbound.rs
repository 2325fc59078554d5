//! Outbound reconnect state machine.
//!
//! An outbound session remembers its remote endpoint and survives the loss
//! of the underlying socket: after a disconnect it immediately attempts to
//! reconnect, and failed attempts are spaced by a fixed 500 ms timer until
//! the owning server stops. Each successful cycle fires matching connected
//! and disconnected notifications.

use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{run_session_io, SessionInner};

/// Delay between failed reconnect attempts.
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Drives one outbound session for the server's lifetime. When `attached`
/// carries the read half of an already-connected socket (the synchronous
/// connect path), the first cycle skips the connect step.
pub(crate) async fn run_outbound(
    session: Rc<SessionInner>,
    addr: SocketAddr,
    attached: Option<OwnedReadHalf>,
) {
    let mut attached = attached;

    loop {
        let rd = match attached.take() {
            Some(rd) => rd,
            None => {
                if !session.server_active() {
                    break;
                }
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        stream.set_nodelay(true).ok();
                        session.attach(stream)
                    }
                    Err(err) => {
                        trace!(%addr, error = %err, "outbound connect failed, retrying");
                        if !session.server_active() {
                            break;
                        }
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        continue;
                    }
                }
            }
        };

        debug!(%addr, "outbound session connected");
        session.notify_connected();
        run_session_io(session.clone(), rd).await;
        debug!(%addr, "outbound session lost");

        if !session.server_active() {
            break;
        }
    }
}
