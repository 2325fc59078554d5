//! Session I/O engine.
//!
//! One [`SessionInner`] backs each TCP connection: a recurring read into a
//! rolling buffer with in-place frame parsing, a double-buffered chunked
//! write pipeline with at most one vectored write in flight, an explicit
//! reference count that pins the pool slot past disconnection, a single
//! type-erased user-data slot, and the last-activity clock that drives the
//! inactivity sweep.

mod outbound;

pub(crate) use outbound::run_outbound;

use std::any::Any;
use std::cell::{Cell, Ref, RefCell, RefMut};
use std::io::IoSlice;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{debug, error, trace};

use crate::buffer::{DoubleWriteBuf, RollingBuffer, WriteBuf};
use crate::codec::MsgPackCodec;
use crate::error::Result;
use crate::pool::PoolKey;
use crate::protocol::{peek_frame, FrameHeader, FramePeek, Packet, Protocol, HEADER_SIZE};
use crate::server::ServerShared;
use crate::FramewireError;

/// Initial rolling-buffer capacity per session.
const READ_BUFFER_INITIAL: usize = 2 * 1024;

/// Which side of the server this connection represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Inbound connection accepted from a client.
    Client,
    /// Outbound connection to an upstream server.
    Server,
}

/// Per-connection handler overrides superseding the module's handlers for
/// one outbound connection. Unset fields fall back to the module.
#[derive(Default)]
pub struct ConnHandlers {
    /// Raw-frame message handler.
    pub on_message: Option<Box<dyn FnMut(&Connection, u16, &[u8])>>,
    /// Connected notification.
    pub on_connected: Option<Box<dyn FnMut(&Connection)>>,
    /// Disconnected notification.
    pub on_disconnected: Option<Box<dyn FnMut(&Connection)>>,
}

/// Observer installed on a session; supersedes module-level dispatch.
pub(crate) trait ConnObserver {
    fn on_message(&self, conn: &Connection, type_id: u16, payload: &[u8]);
    fn on_connected(&self, conn: &Connection);
    fn on_disconnected(&self, conn: &Connection);
}

/// [`ConnObserver`] over a [`ConnHandlers`] triple; unset callbacks fall
/// back to the module via the server's event sink.
pub(crate) struct CallbackObserver {
    handlers: RefCell<ConnHandlers>,
    server: Weak<ServerShared>,
}

impl CallbackObserver {
    pub(crate) fn new(handlers: ConnHandlers, server: Weak<ServerShared>) -> Rc<Self> {
        Rc::new(Self {
            handlers: RefCell::new(handlers),
            server,
        })
    }
}

impl ConnObserver for CallbackObserver {
    fn on_message(&self, conn: &Connection, type_id: u16, payload: &[u8]) {
        {
            let mut handlers = self.handlers.borrow_mut();
            if let Some(f) = handlers.on_message.as_mut() {
                f(conn, type_id, payload);
                return;
            }
        }
        if let Some(shared) = self.server.upgrade() {
            shared.with_sink(|s| s.message(conn, type_id, payload));
        }
    }

    fn on_connected(&self, conn: &Connection) {
        {
            let mut handlers = self.handlers.borrow_mut();
            if let Some(f) = handlers.on_connected.as_mut() {
                f(conn);
                return;
            }
        }
        if let Some(shared) = self.server.upgrade() {
            shared.with_sink(|s| s.connected(conn));
        }
    }

    fn on_disconnected(&self, conn: &Connection) {
        {
            let mut handlers = self.handlers.borrow_mut();
            if let Some(f) = handlers.on_disconnected.as_mut() {
                f(conn);
                return;
            }
        }
        if let Some(shared) = self.server.upgrade() {
            shared.with_sink(|s| s.disconnected(conn));
        }
    }
}

pub(crate) struct SessionInner {
    pub(crate) role: Role,
    pub(crate) server: Weak<ServerShared>,
    pub(crate) key: Cell<Option<PoolKey>>,

    connected: Cell<bool>,
    close_pending: Cell<bool>,
    closing: Notify,
    past_disconnect: Cell<bool>,
    refs: Cell<usize>,
    last_activity: Cell<Instant>,

    write: RefCell<DoubleWriteBuf>,
    write_in_flight: Cell<bool>,
    writer: RefCell<Option<OwnedWriteHalf>>,

    user_data: RefCell<Option<Box<dyn Any>>>,
    pub(crate) observer: RefCell<Option<Rc<dyn ConnObserver>>>,
    peer: Cell<Option<SocketAddr>>,
}

impl SessionInner {
    pub(crate) fn new(role: Role, server: Weak<ServerShared>) -> Rc<Self> {
        Rc::new(Self {
            role,
            server,
            key: Cell::new(None),
            connected: Cell::new(false),
            close_pending: Cell::new(false),
            closing: Notify::new(),
            past_disconnect: Cell::new(false),
            refs: Cell::new(0),
            last_activity: Cell::new(Instant::now()),
            write: RefCell::new(DoubleWriteBuf::new()),
            write_in_flight: Cell::new(false),
            writer: RefCell::new(None),
            user_data: RefCell::new(None),
            observer: RefCell::new(None),
            peer: Cell::new(None),
        })
    }

    /// Takes ownership of a connected stream and marks the session live.
    /// Returns the read half for the session I/O loop.
    pub(crate) fn attach(&self, stream: TcpStream) -> OwnedReadHalf {
        self.peer.set(stream.peer_addr().ok());
        let (rd, wr) = stream.into_split();
        *self.writer.borrow_mut() = Some(wr);
        self.connected.set(true);
        self.close_pending.set(false);
        self.touch();
        rd
    }

    pub(crate) fn connected(&self) -> bool {
        self.connected.get() && !self.close_pending.get()
    }

    pub(crate) fn touch(&self) {
        self.last_activity.set(Instant::now());
    }

    /// Requests an orderly close. The session I/O loop observes the request
    /// and performs the disconnect notifications; nothing fires here, so
    /// this is safe to call from inside any handler.
    pub(crate) fn close(&self) {
        if self.connected.get() && !self.close_pending.replace(true) {
            self.closing.notify_one();
        }
    }

    /// Closes the session if no read activity happened within `limit`.
    pub(crate) fn disconnect_inactive(&self, limit: Duration) {
        if self.connected() && self.last_activity.get().elapsed() > limit {
            debug!(role = ?self.role, "disconnecting inactive session");
            self.close();
        }
    }

    /// Queues an encoded frame and kicks the write pipeline. A silent no-op
    /// on a session that is no longer connected, so timers holding stale
    /// references fire harmlessly.
    pub(crate) fn send_frame(self: &Rc<Self>, type_id: u16, payload: &[u8]) -> Result<()> {
        let header = FrameHeader::for_payload(type_id, payload.len())?;
        if !self.connected() {
            trace!(type_id, "dropping send on disconnected session");
            return Ok(());
        }
        {
            let mut write = self.write.borrow_mut();
            write.append(&header.encode());
            write.append(payload);
        }
        self.start_drain();
        Ok(())
    }

    fn start_drain(self: &Rc<Self>) {
        if self.write_in_flight.replace(true) {
            return;
        }
        let session = self.clone();
        tokio::task::spawn_local(async move {
            session.drain_writes().await;
        });
    }

    /// Writes out flipped halves of the double buffer until it runs dry.
    /// Producers keep appending into the current half in the meantime.
    async fn drain_writes(self: Rc<Self>) {
        let mut writer = match self.writer.borrow_mut().take() {
            Some(w) => w,
            None => {
                self.write_in_flight.set(false);
                return;
            }
        };

        loop {
            if !self.connected() {
                self.write_in_flight.set(false);
                return;
            }
            let pending = {
                let mut write = self.write.borrow_mut();
                if write.is_empty() {
                    break;
                }
                write.flip()
            };

            let outcome = write_chunks(&mut writer, &pending).await;
            self.write.borrow_mut().retire(pending);

            if let Err(err) = outcome {
                debug!(error = %err, "session write failed");
                self.write_in_flight.set(false);
                self.close();
                return;
            }
        }

        *self.writer.borrow_mut() = Some(writer);
        self.write_in_flight.set(false);
    }

    /// Builds the public connection handle; `None` once the server is gone.
    pub(crate) fn as_connection(self: &Rc<Self>) -> Option<Connection> {
        let shared = self.server.upgrade()?;
        Some(Connection {
            session: self.clone(),
            proto: shared.proto.clone(),
        })
    }

    pub(crate) fn notify_connected(self: &Rc<Self>) {
        let conn = match self.as_connection() {
            Some(c) => c,
            None => return,
        };
        let observer = self.observer.borrow().clone();
        match observer {
            Some(obs) => obs.on_connected(&conn),
            None => {
                if let Some(shared) = self.server.upgrade() {
                    shared.with_sink(|s| s.connected(&conn));
                }
            }
        }
    }

    fn notify_disconnected(self: &Rc<Self>) {
        let conn = match self.as_connection() {
            Some(c) => c,
            None => return,
        };
        let observer = self.observer.borrow().clone();
        match observer {
            Some(obs) => obs.on_disconnected(&conn),
            None => {
                if let Some(shared) = self.server.upgrade() {
                    shared.with_sink(|s| s.disconnected(&conn));
                }
            }
        }
    }

    fn notify_message(self: &Rc<Self>, type_id: u16, payload: &[u8]) {
        let conn = match self.as_connection() {
            Some(c) => c,
            None => return,
        };
        let observer = self.observer.borrow().clone();
        match observer {
            Some(obs) => obs.on_message(&conn, type_id, payload),
            None => {
                if let Some(shared) = self.server.upgrade() {
                    shared.with_sink(|s| s.message(&conn, type_id, payload));
                }
            }
        }
    }

    /// Final transition out of the connected state. Fires the disconnected
    /// notification exactly once per connection and, for inbound sessions
    /// with no outstanding references, releases the pool slot.
    pub(crate) fn finish_disconnect(self: &Rc<Self>) {
        let was_connected = self.connected.replace(false);
        self.close_pending.set(false);
        self.writer.borrow_mut().take();
        self.write.borrow_mut().clear();

        if was_connected {
            self.notify_disconnected();
        }

        if self.role == Role::Client {
            self.past_disconnect.set(true);
            if self.refs.get() == 0 {
                self.remove_from_pool();
            }
        }
    }

    /// Teardown path for sessions that were still connected when the
    /// executor stopped: notify disconnected exactly once.
    pub(crate) fn shutdown_disconnect(self: &Rc<Self>) {
        if self.connected.get() {
            self.finish_disconnect();
        }
    }

    fn remove_from_pool(&self) {
        if let (Some(shared), Some(key)) = (self.server.upgrade(), self.key.take()) {
            let pool = match self.role {
                Role::Client => &shared.clients,
                Role::Server => &shared.servers,
            };
            pool.borrow_mut().destroy(key);
        }
    }

    fn add_ref(&self) {
        self.refs.set(self.refs.get() + 1);
    }

    fn release_ref(&self) {
        debug_assert!(self.refs.get() > 0);
        self.refs.set(self.refs.get() - 1);
        if self.refs.get() == 0 && self.past_disconnect.get() {
            self.remove_from_pool();
        }
    }

    pub(crate) fn server_active(&self) -> bool {
        self.server
            .upgrade()
            .map(|s| s.control.is_active())
            .unwrap_or(false)
    }
}

/// Drives the session's recurring read until the connection ends, then
/// performs the orderly disconnect.
pub(crate) async fn run_session_io(session: Rc<SessionInner>, mut rd: OwnedReadHalf) {
    let mut buf = RollingBuffer::with_capacity(READ_BUFFER_INITIAL);

    loop {
        if buf.free_capacity() == 0 {
            buf.grow_capacity();
        }

        let n = tokio::select! {
            biased;
            _ = session.closing.notified() => {
                if session.close_pending.get() {
                    break;
                }
                continue;
            }
            read = rd.read(buf.spare_mut()) => match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(err) => {
                    trace!(error = %err, "session read failed");
                    break;
                }
            },
        };

        buf.grow(n);
        session.touch();
        if !parse_frames(&session, &mut buf) {
            break;
        }
    }

    drop(rd);
    session.finish_disconnect();
}

/// Delivers every complete frame at the front of the buffer. Returns false
/// when a malformed header requires the connection to close.
fn parse_frames(session: &Rc<SessionInner>, buf: &mut RollingBuffer) -> bool {
    loop {
        match peek_frame(buf.as_slice()) {
            FramePeek::NeedMore => return true,
            FramePeek::Malformed { total_size } => {
                error!(total_size, "malformed frame header, closing connection");
                return false;
            }
            FramePeek::Frame {
                type_id,
                total_size,
            } => {
                session.notify_message(type_id, &buf.as_slice()[HEADER_SIZE..total_size]);
                buf.erase(total_size);
            }
        }
    }
}

/// Vectored write of every chunk in `buf`, rebuilding the slice list after
/// partial writes.
async fn write_chunks(writer: &mut OwnedWriteHalf, buf: &WriteBuf) -> std::io::Result<()> {
    let total = buf.total_len();
    let mut written = 0usize;

    while written < total {
        let slices = remaining_slices(buf, written);
        let n = writer.write_vectored(&slices).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        written += n;
    }

    writer.flush().await
}

/// IoSlice list for the bytes of `buf` past `skip`.
fn remaining_slices(buf: &WriteBuf, mut skip: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(buf.chunks().len());
    for chunk in buf.chunks() {
        let filled = chunk.filled();
        if skip >= filled.len() {
            skip -= filled.len();
            continue;
        }
        slices.push(IoSlice::new(&filled[skip..]));
        skip = 0;
    }
    slices
}

/// A live or recently-live connection.
///
/// Cheap to clone; all clones address the same session. Sending on a
/// connection whose session has disconnected is a silent no-op.
#[derive(Clone)]
pub struct Connection {
    pub(crate) session: Rc<SessionInner>,
    pub(crate) proto: Rc<Protocol>,
}

impl Connection {
    /// Which side of the server the connection represents.
    pub fn role(&self) -> Role {
        self.session.role
    }

    /// True for an accepted client connection.
    pub fn is_client(&self) -> bool {
        self.session.role == Role::Client
    }

    /// True for an outbound upstream connection.
    pub fn is_server(&self) -> bool {
        self.session.role == Role::Server
    }

    /// Encodes `msg` and queues it on the write pipeline.
    ///
    /// # Errors
    ///
    /// `UnknownType` when `T` is not part of the protocol, `FrameTooLarge`
    /// when the encoded frame exceeds the wire limit.
    pub fn send<T: Packet>(&self, msg: &T) -> Result<()> {
        let id = self
            .proto
            .id_of::<T>()
            .ok_or(FramewireError::UnknownType { name: T::NAME })?;
        let payload = MsgPackCodec::encode(msg)?;
        self.session.send_frame(id, &payload)
    }

    /// Queues a frame with an explicit wire id and raw payload bytes.
    pub fn send_raw(&self, type_id: u16, payload: &[u8]) -> Result<()> {
        self.session.send_frame(type_id, payload)
    }

    /// Requests an orderly close; notifications fire from the event loop.
    pub fn close(&self) {
        self.session.close();
    }

    /// Soft connectivity check; reflects the session state, not the wire.
    pub fn connected(&self) -> bool {
        self.session.connected()
    }

    /// Pins the session's slot past disconnection and returns the pinning
    /// handle. Dropping the last handle after disconnect releases the slot.
    pub fn take_ownership(&self) -> SessionRef {
        self.session.add_ref();
        SessionRef { conn: self.clone() }
    }

    /// Stores a value in the session's single user-data slot, replacing any
    /// previous value of any type.
    pub fn set_user_data<T: 'static>(&self, value: T) {
        *self.session.user_data.borrow_mut() = Some(Box::new(value));
    }

    /// Borrows the user data if the slot holds a `T`.
    pub fn user_data<T: 'static>(&self) -> Option<Ref<'_, T>> {
        let slot = self.session.user_data.borrow();
        Ref::filter_map(slot, |s| s.as_ref().and_then(|b| b.downcast_ref::<T>())).ok()
    }

    /// Mutably borrows the user data if the slot holds a `T`.
    pub fn user_data_mut<T: 'static>(&self) -> Option<RefMut<'_, T>> {
        let slot = self.session.user_data.borrow_mut();
        RefMut::filter_map(slot, |s| s.as_mut().and_then(|b| b.downcast_mut::<T>())).ok()
    }

    /// Remote address, when the socket is or was connected.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.session.peer.get()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.session, &other.session)
    }
}

impl Eq for Connection {}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.session.role)
            .field("connected", &self.session.connected.get())
            .field("peer", &self.session.peer.get())
            .finish()
    }
}

/// Refcounted handle keeping a session slot alive past disconnection, so a
/// pending timer may still address the (now-disconnected) session.
pub struct SessionRef {
    conn: Connection,
}

impl SessionRef {
    /// The underlying connection handle.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Sends through the referenced session; a no-op once disconnected.
    pub fn send<T: Packet>(&self, msg: &T) -> Result<()> {
        self.conn.send(msg)
    }

    /// Soft connectivity check.
    pub fn connected(&self) -> bool {
        self.conn.connected()
    }
}

impl Clone for SessionRef {
    fn clone(&self) -> Self {
        self.conn.take_ownership()
    }
}

impl Drop for SessionRef {
    fn drop(&mut self) {
        self.conn.session.release_ref();
    }
}
