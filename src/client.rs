//! Synchronous client and the async handler over an existing upstream
//! connection.
//!
//! The client owns a private executor and blocks the calling thread; it is
//! the tool tests and proxies use to talk to a server. Typed sends go
//! through the protocol registry; received frames either satisfy a pending
//! async subscriber or land in an overflow queue for the blocking
//! `wait_message` / `try_receive` accessors.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::trace;

use crate::buffer::RollingBuffer;
use crate::codec::MsgPackCodec;
use crate::dispatch::table::{cancel_all, dispatch_into};
use crate::dispatch::DispatchTable;
use crate::error::{FramewireError, Result};
use crate::protocol::{peek_frame, FrameHeader, FramePeek, Packet, Protocol, HEADER_SIZE};
use crate::session::{ConnObserver, Connection};

/// Delay between `wait_connect` attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Synchronous, executor-owning client for tests and proxies.
///
/// Dropping the client cancels every pending subscriber, so no callback is
/// ever leaked.
pub struct Client {
    rt: tokio::runtime::Runtime,
    proto: Rc<Protocol>,
    stream: Option<TcpStream>,
    readbuf: RollingBuffer,
    table: Rc<RefCell<DispatchTable>>,
    overflow: VecDeque<(u16, Bytes)>,
}

impl Client {
    /// Creates a client speaking `proto` (a full protocol or a subprotocol
    /// preserving the server's ids).
    pub fn new(proto: Protocol) -> Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            rt,
            proto: Rc::new(proto),
            stream: None,
            readbuf: RollingBuffer::with_capacity(64 * 1024),
            table: Rc::new(RefCell::new(DispatchTable::new())),
            overflow: VecDeque::new(),
        })
    }

    /// One-shot synchronous connect to 127.0.0.1.
    pub fn connect(&mut self, port: u16) -> Result<()> {
        self.connect_to("127.0.0.1", port)
    }

    /// One-shot synchronous connect.
    pub fn connect_to(&mut self, ip: &str, port: u16) -> Result<()> {
        let addr: SocketAddr = format!("{ip}:{port}")
            .parse()
            .map_err(|_| FramewireError::Config(format!("invalid address {ip}:{port}")))?;
        let stream = self
            .rt
            .block_on(TcpStream::connect(addr))
            .map_err(FramewireError::ConnectFailed)?;
        stream.set_nodelay(true).ok();
        self.stream = Some(stream);
        self.readbuf.clear();
        self.overflow.clear();
        Ok(())
    }

    /// Retries the connect every millisecond until it succeeds.
    pub fn wait_connect(&mut self, port: u16) -> Result<()> {
        self.wait_connect_attempts("127.0.0.1", port, usize::MAX)
    }

    /// Retries the connect up to `attempts` times, a millisecond apart.
    pub fn wait_connect_attempts(&mut self, ip: &str, port: u16, attempts: usize) -> Result<()> {
        let mut last = None;
        for _ in 0..attempts {
            match self.connect_to(ip, port) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last = Some(err);
                    std::thread::sleep(CONNECT_RETRY_DELAY);
                }
            }
        }
        Err(last.unwrap_or_else(|| {
            FramewireError::Config("wait_connect called with zero attempts".into())
        }))
    }

    /// True while the client believes it is connected.
    pub fn connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Encodes `msg` and writes the frame out.
    pub fn send<T: Packet>(&mut self, msg: &T) -> Result<()> {
        let id = self
            .proto
            .id_of::<T>()
            .ok_or(FramewireError::UnknownType { name: T::NAME })?;
        let payload = MsgPackCodec::encode(msg)?;
        self.send_raw(id, &payload)
    }

    /// Writes a frame with an explicit wire id and raw payload.
    pub fn send_raw(&mut self, type_id: u16, payload: &[u8]) -> Result<()> {
        let header = FrameHeader::for_payload(type_id, payload.len())?;
        let stream = self
            .stream
            .as_mut()
            .ok_or(FramewireError::ConnectionLost)?;

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&header.encode());
        frame.extend_from_slice(payload);
        self.rt.block_on(stream.write_all(&frame))?;
        Ok(())
    }

    /// Blocks, pumping the socket, until a frame of type `T` arrives;
    /// consumes and returns it.
    pub fn wait_message<T: Packet>(&mut self) -> Result<T> {
        let want = self
            .proto
            .id_of::<T>()
            .ok_or(FramewireError::UnknownType { name: T::NAME })?;
        loop {
            if let Some(found) = self.take_from_overflow::<T>(want)? {
                return Ok(found);
            }
            self.pump_blocking()?;
        }
    }

    /// Non-blocking single pump; returns a `T` if one is available.
    pub fn try_receive<T: Packet>(&mut self) -> Result<Option<T>> {
        let want = self
            .proto
            .id_of::<T>()
            .ok_or(FramewireError::UnknownType { name: T::NAME })?;
        if let Some(found) = self.take_from_overflow::<T>(want)? {
            return Ok(Some(found));
        }
        self.pump_once()?;
        self.take_from_overflow::<T>(want)
    }

    /// Registers a one-shot async subscriber for the next `T`.
    pub fn receive<T, F>(&mut self, callback: F)
    where
        T: Packet,
        F: FnOnce(Result<T>) + 'static,
    {
        self.table.borrow_mut().subscribe(&self.proto, callback);
    }

    /// A handle for re-subscribing from inside receive callbacks.
    pub fn subscriber(&self) -> ClientSubscriber {
        ClientSubscriber {
            table: self.table.clone(),
            proto: self.proto.clone(),
        }
    }

    /// Pumps the socket until every pending subscriber was invoked.
    pub fn run(&mut self) -> Result<()> {
        while !self.table.borrow().done() {
            self.pump_blocking()?;
        }
        Ok(())
    }

    /// Cancels every pending subscriber and tears the connection down.
    pub fn disconnect(&mut self) {
        cancel_all(&self.table);
        self.stream = None;
        self.readbuf.clear();
        self.overflow.clear();
    }

    fn take_from_overflow<T: Packet>(&mut self, want: u16) -> Result<Option<T>> {
        let position = self.overflow.iter().position(|(id, _)| *id == want);
        match position {
            Some(index) => {
                let (_, payload) = self
                    .overflow
                    .remove(index)
                    .unwrap_or_else(|| unreachable!("position() returned a valid index"));
                let decoded = MsgPackCodec::decode(&payload)
                    .map_err(|_| FramewireError::malformed(&payload))?;
                Ok(Some(decoded))
            }
            None => Ok(None),
        }
    }

    /// One blocking read plus frame processing.
    fn pump_blocking(&mut self) -> Result<()> {
        if self.readbuf.free_capacity() == 0 {
            self.readbuf.grow_capacity();
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or(FramewireError::ConnectionLost)?;

        let n = {
            use tokio::io::AsyncReadExt;
            let spare = self.readbuf.spare_mut();
            self.rt.block_on(stream.read(spare))?
        };
        if n == 0 {
            trace!("server closed the connection");
            self.disconnect();
            return Err(FramewireError::ConnectionLost);
        }
        self.readbuf.grow(n);
        self.process_frames()
    }

    /// One non-blocking read attempt plus frame processing.
    fn pump_once(&mut self) -> Result<()> {
        if self.readbuf.free_capacity() == 0 {
            self.readbuf.grow_capacity();
        }
        let stream = match self.stream.as_mut() {
            Some(s) => s,
            None => return Ok(()),
        };

        match stream.try_read(self.readbuf.spare_mut()) {
            Ok(0) => {
                self.disconnect();
                Err(FramewireError::ConnectionLost)
            }
            Ok(n) => {
                self.readbuf.grow(n);
                self.process_frames()
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => {
                self.disconnect();
                Err(FramewireError::Io(err))
            }
        }
    }

    fn process_frames(&mut self) -> Result<()> {
        loop {
            match peek_frame(self.readbuf.as_slice()) {
                FramePeek::NeedMore => return Ok(()),
                FramePeek::Malformed { total_size } => {
                    self.disconnect();
                    return Err(FramewireError::FrameMalformed {
                        size: total_size,
                        dump: String::new(),
                    });
                }
                FramePeek::Frame {
                    type_id,
                    total_size,
                } => {
                    let payload =
                        Bytes::copy_from_slice(&self.readbuf.as_slice()[HEADER_SIZE..total_size]);
                    self.readbuf.erase(total_size);
                    if !dispatch_into(&self.table, type_id, &payload) {
                        self.overflow.push_back((type_id, payload));
                    }
                }
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Re-subscription handle usable from inside receive callbacks.
#[derive(Clone)]
pub struct ClientSubscriber {
    table: Rc<RefCell<DispatchTable>>,
    proto: Rc<Protocol>,
}

impl ClientSubscriber {
    /// Registers a one-shot async subscriber for the next `T`.
    pub fn receive<T, F>(&self, callback: F)
    where
        T: Packet,
        F: FnOnce(Result<T>) + 'static,
    {
        self.table.borrow_mut().subscribe(&self.proto, callback);
    }
}

struct HandlerInner {
    conn: Connection,
    table: RefCell<DispatchTable>,
    connected: Cell<bool>,
}

struct HandlerObserver {
    inner: Weak<HandlerInner>,
}

impl ConnObserver for HandlerObserver {
    fn on_message(&self, _conn: &Connection, type_id: u16, payload: &[u8]) {
        if let Some(inner) = self.inner.upgrade() {
            if !dispatch_into(&inner.table, type_id, payload) {
                trace!(type_id, "async handler dropped unsubscribed message");
            }
        }
    }

    fn on_connected(&self, _conn: &Connection) {
        if let Some(inner) = self.inner.upgrade() {
            inner.connected.set(true);
        }
    }

    fn on_disconnected(&self, _conn: &Connection) {
        if let Some(inner) = self.inner.upgrade() {
            inner.connected.set(false);
            cancel_all(&inner.table);
        }
    }
}

/// Async handler over an existing outbound connection.
///
/// Owns its own dispatch table over the connection: `receive` subscribes,
/// `send` writes through the session's pipeline, and losing the underlying
/// connection cancels every pending subscriber.
#[derive(Clone)]
pub struct ServerHandler {
    inner: Rc<HandlerInner>,
}

impl ServerHandler {
    /// Installs a forwarding handler over `conn`, superseding the module's
    /// handlers for that connection.
    pub fn attach(conn: &Connection) -> ServerHandler {
        let inner = Rc::new(HandlerInner {
            conn: conn.clone(),
            table: RefCell::new(DispatchTable::new()),
            connected: Cell::new(conn.connected()),
        });
        let observer = Rc::new(HandlerObserver {
            inner: Rc::downgrade(&inner),
        });
        *conn.session.observer.borrow_mut() = Some(observer);
        ServerHandler { inner }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    /// Sends through the underlying connection.
    pub fn send<T: Packet>(&self, msg: &T) -> Result<()> {
        self.inner.conn.send(msg)
    }

    /// Registers a one-shot async subscriber. When the connection is
    /// already down, the subscriber is cancelled immediately.
    pub fn receive<T, F>(&self, callback: F)
    where
        T: Packet,
        F: FnOnce(Result<T>) + 'static,
    {
        self.inner
            .table
            .borrow_mut()
            .subscribe(&self.inner.conn.proto, callback);
        if !self.inner.connected.get() {
            cancel_all(&self.inner.table);
        }
    }
}
