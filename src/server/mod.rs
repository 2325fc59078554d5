//! Server core.
//!
//! `Server::run` binds the listening socket, drives every session, timer
//! and sweep on one current-thread executor, and hands the module host back
//! once the server is stopped. The only handle that crosses threads is
//! [`ServerControl`], which requests shutdown.

mod timer;

pub use timer::Timer;
pub(crate) use timer::run_timer;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{info, trace, warn};

use crate::console;
use crate::dispatch::{host_sink, EventSink, Module, ModuleHost};
use crate::error::{FramewireError, Result};
use crate::pool::ObjectPool;
use crate::protocol::Protocol;
use crate::session::{
    run_outbound, run_session_io, CallbackObserver, ConnHandlers, Connection, Role, SessionInner,
};

/// String-to-string configuration map handed to `run_server`. Unknown keys
/// are forwarded verbatim to `on_configuration`.
pub type Options = BTreeMap<String, String>;

struct ControlInner {
    active: AtomicBool,
    shutdown: Notify,
}

/// Thread-safe shutdown switch for a running server.
#[derive(Clone)]
pub struct ServerControl {
    inner: Arc<ControlInner>,
}

impl Default for ServerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerControl {
    /// Creates an inactive control; `run` flips it active.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ControlInner {
                active: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Passing false requests shutdown; callable from any thread.
    pub fn set_active(&self, active: bool) {
        self.inner.active.store(active, Ordering::Release);
        if !active {
            self.inner.shutdown.notify_one();
        }
    }

    /// True while the server should keep running.
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub(crate) async fn wait_shutdown(&self) {
        loop {
            let notified = self.inner.shutdown.notified();
            if !self.is_active() {
                return;
            }
            notified.await;
        }
    }
}

/// Engine state shared between the run loop, sessions, and handles.
pub(crate) struct ServerShared {
    pub(crate) clients: RefCell<ObjectPool<Rc<SessionInner>>>,
    pub(crate) servers: RefCell<ObjectPool<Rc<SessionInner>>>,
    pub(crate) proto: Rc<Protocol>,
    pub(crate) control: ServerControl,
    pub(crate) sink: RefCell<Option<Box<dyn EventSink>>>,
}

impl ServerShared {
    pub(crate) fn with_sink(&self, f: impl FnOnce(&dyn EventSink)) {
        let guard = self.sink.borrow();
        if let Some(sink) = guard.as_deref() {
            f(sink);
        }
    }

    fn collect_sessions(&self) -> Vec<Rc<SessionInner>> {
        let mut sessions = Vec::new();
        self.clients.borrow().for_each(|s| sessions.push(s.clone()));
        self.servers.borrow().for_each(|s| sessions.push(s.clone()));
        sessions
    }
}

/// Cloneable in-thread handle to the running server.
#[derive(Clone)]
pub struct ServerHandle {
    pub(crate) inner: Rc<ServerShared>,
}

impl ServerHandle {
    /// The thread-safe shutdown switch.
    pub fn control(&self) -> ServerControl {
        self.inner.control.clone()
    }

    /// Passing false initiates server shutdown.
    pub fn set_active(&self, active: bool) {
        self.inner.control.set_active(active);
    }

    pub(crate) fn spawn<F: Future<Output = ()> + 'static>(&self, fut: F) {
        tokio::task::spawn_local(fut);
    }

    /// Fires `f` once after `delay` on the server executor.
    pub fn async_wait<F: FnOnce() + 'static>(&self, delay: Duration, f: F) {
        self.spawn(async move {
            tokio::time::sleep(delay).await;
            f();
        });
    }

    /// Fires `f` every `period` on the server executor.
    pub fn async_wait_period<F: FnMut() + 'static>(&self, period: Duration, mut f: F) {
        self.spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                f();
            }
        });
    }

    /// Starts a pausable periodic timer running `tick`.
    pub fn start_timer(&self, period: Duration, tick: impl FnMut() + 'static) -> Timer {
        let (timer, state) = Timer::new(period);
        self.spawn(run_timer(state, tick));
        timer
    }

    fn resolve(&self, ip: &str, port: u16) -> Result<SocketAddr> {
        format!("{ip}:{port}")
            .parse()
            .map_err(|_| FramewireError::Config(format!("invalid address {ip}:{port}")))
    }

    fn new_outbound(&self, handlers: Option<ConnHandlers>) -> Rc<SessionInner> {
        let session = SessionInner::new(Role::Server, Rc::downgrade(&self.inner));
        if let Some(handlers) = handlers {
            let observer = CallbackObserver::new(handlers, Rc::downgrade(&self.inner));
            *session.observer.borrow_mut() = Some(observer);
        }
        let key = self.inner.servers.borrow_mut().create(session.clone());
        session.key.set(Some(key));
        session
    }

    /// Synchronous outbound connect; blocks briefly until the TCP handshake
    /// completes, then starts I/O. Reconnects automatically afterwards.
    pub fn connect_to_server(
        &self,
        ip: &str,
        port: u16,
        handlers: Option<ConnHandlers>,
    ) -> Result<Connection> {
        let addr = self.resolve(ip, port)?;
        let std_stream =
            std::net::TcpStream::connect(addr).map_err(FramewireError::ConnectFailed)?;
        std_stream.set_nonblocking(true)?;
        std_stream.set_nodelay(true).ok();
        let stream = TcpStream::from_std(std_stream)?;

        let session = self.new_outbound(handlers);
        let rd = session.attach(stream);
        self.spawn(run_outbound(session.clone(), addr, Some(rd)));

        Ok(Connection {
            session,
            proto: self.inner.proto.clone(),
        })
    }

    /// Non-blocking outbound connect; the connected notification fires once
    /// the handshake completes, and the session reconnects on loss.
    pub fn async_connect(
        &self,
        ip: &str,
        port: u16,
        handlers: Option<ConnHandlers>,
    ) -> Result<Connection> {
        let addr = self.resolve(ip, port)?;
        let session = self.new_outbound(handlers);
        self.spawn(run_outbound(session.clone(), addr, None));

        Ok(Connection {
            session,
            proto: self.inner.proto.clone(),
        })
    }

    fn sweep(&self, role: Role, limit: Duration) {
        let shared = self.inner.clone();
        self.spawn(async move {
            let pool = match role {
                Role::Client => &shared.clients,
                Role::Server => &shared.servers,
            };
            let mut sessions = Vec::new();
            pool.borrow().for_each(|s| sessions.push(s.clone()));
            for session in sessions {
                session.disconnect_inactive(limit);
            }
        });
    }

    /// Sweeps inbound sessions, closing those without read activity for
    /// longer than `limit`.
    pub fn async_disconnect_inactive_clients(&self, limit: Duration) {
        self.sweep(Role::Client, limit);
    }

    /// Sweeps outbound sessions under the same rule.
    pub fn async_disconnect_inactive_servers(&self, limit: Duration) {
        self.sweep(Role::Server, limit);
    }

    /// Visits every inbound connection.
    pub fn for_each_client<F: FnMut(&Connection)>(&self, mut f: F) {
        let mut sessions = Vec::new();
        self.inner
            .clients
            .borrow()
            .for_each(|s| sessions.push(s.clone()));
        for session in sessions {
            if let Some(conn) = session.as_connection() {
                f(&conn);
            }
        }
    }

    /// Visits the user data of every inbound connection whose slot holds a
    /// `T`.
    pub fn for_each_user_data<T: 'static, F: FnMut(&Connection, &mut T)>(&self, mut f: F) {
        self.for_each_client(|conn| {
            if let Some(mut data) = conn.user_data_mut::<T>() {
                f(conn, &mut data);
            }
        });
    }

    /// Number of live inbound sessions.
    pub fn client_count(&self) -> usize {
        self.inner.clients.borrow().len()
    }
}

async fn accept_loop(listener: TcpListener, shared: Weak<ServerShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let shared = match shared.upgrade() {
                    Some(s) => s,
                    None => return,
                };
                stream.set_nodelay(true).ok();
                trace!(%addr, "accepted client connection");

                let session = SessionInner::new(Role::Client, Rc::downgrade(&shared));
                let key = shared.clients.borrow_mut().create(session.clone());
                session.key.set(Some(key));

                let rd = session.attach(stream);
                session.notify_connected();
                tokio::task::spawn_local(run_session_io(session, rd));
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
}

/// A server instance; create, keep the control handle, then `run`.
pub struct Server {
    control: ServerControl,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Creates a server with a fresh control handle.
    pub fn new() -> Self {
        Self {
            control: ServerControl::new(),
        }
    }

    /// The thread-safe shutdown switch; clone it before `run` to stop the
    /// server from another thread.
    pub fn control(&self) -> ServerControl {
        self.control.clone()
    }

    /// Runs the server until [`ServerControl::set_active`] requests
    /// shutdown. Binds `options["Ip"]` (default 127.0.0.1) on
    /// `options["Port"]`, fires `on_initialized` then `on_configuration`,
    /// accepts and dispatches until stopped, notifies every still-connected
    /// session disconnected, fires `on_deinitialized`, and returns the
    /// module host for inspection.
    pub fn run<M: Module>(
        self,
        module: M,
        app_name: &str,
        options: &Options,
    ) -> Result<ModuleHost<M>> {
        let ip = options.get("Ip").map(String::as_str).unwrap_or("127.0.0.1");
        let port: u16 = options
            .get("Port")
            .ok_or_else(|| FramewireError::Config("missing required option Port".into()))?
            .parse()
            .map_err(|_| FramewireError::Config("Port is not a number in 1..65535".into()))?;
        if port == 0 {
            return Err(FramewireError::Config("Port must be non-zero".into()));
        }

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let local = tokio::task::LocalSet::new();

        let proto = Rc::new(M::protocol());
        let shared = Rc::new(ServerShared {
            clients: RefCell::new(ObjectPool::new()),
            servers: RefCell::new(ObjectPool::new()),
            proto: proto.clone(),
            control: self.control.clone(),
            sink: RefCell::new(None),
        });
        let handle = ServerHandle {
            inner: shared.clone(),
        };
        let host = ModuleHost::new_cyclic(module, handle, proto.clone());
        *shared.sink.borrow_mut() = Some(host_sink(&host));
        self.control.set_active(true);

        let control = self.control.clone();
        let run_result: Result<()> = local.block_on(&rt, async {
            let listener = TcpListener::bind((ip, port)).await.map_err(|err| {
                FramewireError::Config(format!("failed to bind {ip}:{port}: {err}"))
            })?;
            info!(app = app_name, ip, port, "server listening");

            host.borrow_mut().notify_initialized();
            host.borrow_mut().notify_configuration(options);

            let accept = tokio::task::spawn_local(accept_loop(listener, Rc::downgrade(&shared)));

            if options.get("Console").map(String::as_str) == Some("stdin") {
                let control = control.clone();
                let sink = Rc::downgrade(&shared);
                tokio::task::spawn_local(async move {
                    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
                    console::pump_commands(stdin, move |cmd| {
                        console::handle_builtin(&cmd, &control);
                        if let Some(shared) = sink.upgrade() {
                            shared.with_sink(|s| s.command(&cmd));
                        }
                        control.is_active()
                    })
                    .await;
                });
            }

            control.wait_shutdown().await;
            accept.abort();
            Ok(())
        });

        // Cancel every session, timer and reconnect task before the
        // teardown notifications run.
        drop(local);

        if run_result.is_ok() {
            for session in shared.collect_sessions() {
                session.shutdown_disconnect();
            }
            host.borrow_mut().notify_deinitialized();
        }

        shared.clients.borrow_mut().clear();
        shared.servers.borrow_mut().clear();
        *shared.sink.borrow_mut() = None;
        rt.shutdown_background();

        run_result?;

        let cell = match Rc::try_unwrap(host) {
            Ok(cell) => cell,
            Err(_) => unreachable!("module host uniquely owned after shutdown"),
        };
        Ok(cell.into_inner())
    }
}

/// Builds a server and runs `module` until shutdown; the common entry point.
pub fn run_server<M: Module>(module: M, app_name: &str, options: &Options) -> Result<ModuleHost<M>> {
    Server::new().run(module, app_name, options)
}
