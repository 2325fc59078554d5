//! Module dispatcher.
//!
//! A module is the user handler object for one server instance. It declares
//! typed message handlers in [`Module::register`] and optional components in
//! [`Module::components`]; the [`ModuleHost`] owns both and routes every
//! parsed frame: the module's handler for the connection's role first, then
//! the connection-less fallback, then each component in declaration order.
//! Unhandled messages are dropped after every component had its chance.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{error, trace};

use super::component::{ComponentRegistry, ComponentSet};
use crate::codec::MsgPackCodec;
use crate::console::Command;
use crate::error::{FramewireError, Result};
use crate::protocol::{Packet, Protocol};
use crate::server::{Options, ServerHandle, Timer};
use crate::session::{ConnHandlers, Connection, Role};

/// Decodes a schema payload, mapping failures to the malformed-frame
/// diagnostic that closes the connection.
pub(crate) fn decode_or_malformed<T: Packet>(payload: &[u8]) -> Result<T> {
    MsgPackCodec::decode(payload).map_err(|_| FramewireError::malformed(payload))
}

/// Sends an auto-reply produced by a handler return value. Reply failures
/// are logged, not escalated: they concern the outgoing message only.
pub(crate) fn send_reply<T: Packet>(conn: &Connection, reply: &T) {
    if let Err(err) = conn.send(reply) {
        error!(message = T::NAME, error = %err, "failed to send handler reply");
    }
}

/// User handler object for a server instance.
///
/// `register` declares the typed message handlers; the lifecycle hooks are
/// optional and default to no-ops. Hooks are invoked on the module first and
/// then on every component, in declaration order.
pub trait Module: Sized + 'static {
    /// The ordered message-type list this module speaks.
    fn protocol() -> Protocol;

    /// Declares typed message handlers.
    fn register(reg: &mut ModuleRegistry<Self>);

    /// Declares the module's components (none by default).
    fn components(&self, _reg: &mut ComponentRegistry<Self>) {}

    /// Runs once the server is listening, before any traffic.
    fn on_initialized(&mut self, _ctx: &mut ModuleCtx<Self>) {}

    /// Runs after every session was torn down, right before `run` returns.
    fn on_deinitialized(&mut self, _ctx: &mut ModuleCtx<Self>) {}

    /// Receives the full options map, unknown keys included.
    fn on_configuration(&mut self, _ctx: &mut ModuleCtx<Self>, _options: &Options) {}

    /// A connection (either role) was established.
    fn on_connected(&mut self, _ctx: &mut ModuleCtx<Self>, _conn: &Connection) {}

    /// A connection (either role) was lost or closed.
    fn on_disconnected(&mut self, _ctx: &mut ModuleCtx<Self>, _conn: &Connection) {}

    /// A console command was parsed.
    fn on_command(&mut self, _ctx: &mut ModuleCtx<Self>, _cmd: &Command) {}
}

type Handler<M> = Box<dyn FnMut(&mut M, &mut ModuleCtx<M>, &Connection, &[u8]) -> Result<()>>;

pub(crate) struct HandlerTable<M: Module> {
    client: HashMap<u16, Handler<M>>,
    server: HashMap<u16, Handler<M>>,
    fallback: HashMap<u16, Handler<M>>,
}

impl<M: Module> HandlerTable<M> {
    fn new() -> Self {
        Self {
            client: HashMap::new(),
            server: HashMap::new(),
            fallback: HashMap::new(),
        }
    }

    /// Most specific handler first: the role-typed map, then the
    /// connection-less fallback.
    fn lookup(&mut self, role: Role, id: u16) -> Option<&mut Handler<M>> {
        let primary = match role {
            Role::Client => &mut self.client,
            Role::Server => &mut self.server,
        };
        if primary.contains_key(&id) {
            return primary.get_mut(&id);
        }
        self.fallback.get_mut(&id)
    }
}

/// Registration surface for a module's typed message handlers.
pub struct ModuleRegistry<M: Module> {
    table: HandlerTable<M>,
    proto: Rc<Protocol>,
}

impl<M: Module> ModuleRegistry<M> {
    pub(crate) fn new(proto: Rc<Protocol>) -> Self {
        Self {
            table: HandlerTable::new(),
            proto,
        }
    }

    fn resolve<T: Packet>(&self) -> u16 {
        match self.proto.id_of::<T>() {
            Some(id) => id,
            None => panic!(
                "handler registered for {}, which is not in the protocol",
                T::NAME
            ),
        }
    }

    /// Handler for `T` arriving on inbound client connections.
    pub fn on_client<T, F>(&mut self, mut f: F)
    where
        T: Packet,
        F: FnMut(&mut M, &mut ModuleCtx<M>, &Connection, T) + 'static,
    {
        let id = self.resolve::<T>();
        self.table.client.insert(
            id,
            Box::new(move |module, ctx, conn, payload| {
                let msg = decode_or_malformed::<T>(payload)?;
                f(module, ctx, conn, msg);
                Ok(())
            }),
        );
    }

    /// Like [`on_client`](Self::on_client), but the handler's return value
    /// is sent back on the same connection.
    pub fn on_client_reply<T, R, F>(&mut self, mut f: F)
    where
        T: Packet,
        R: Packet,
        F: FnMut(&mut M, &mut ModuleCtx<M>, &Connection, T) -> R + 'static,
    {
        let id = self.resolve::<T>();
        self.table.client.insert(
            id,
            Box::new(move |module, ctx, conn, payload| {
                let msg = decode_or_malformed::<T>(payload)?;
                let reply = f(module, ctx, conn, msg);
                send_reply(conn, &reply);
                Ok(())
            }),
        );
    }

    /// Handler for `T` arriving on outbound server connections.
    pub fn on_server<T, F>(&mut self, mut f: F)
    where
        T: Packet,
        F: FnMut(&mut M, &mut ModuleCtx<M>, &Connection, T) + 'static,
    {
        let id = self.resolve::<T>();
        self.table.server.insert(
            id,
            Box::new(move |module, ctx, conn, payload| {
                let msg = decode_or_malformed::<T>(payload)?;
                f(module, ctx, conn, msg);
                Ok(())
            }),
        );
    }

    /// Like [`on_server`](Self::on_server) with an auto-sent reply.
    pub fn on_server_reply<T, R, F>(&mut self, mut f: F)
    where
        T: Packet,
        R: Packet,
        F: FnMut(&mut M, &mut ModuleCtx<M>, &Connection, T) -> R + 'static,
    {
        let id = self.resolve::<T>();
        self.table.server.insert(
            id,
            Box::new(move |module, ctx, conn, payload| {
                let msg = decode_or_malformed::<T>(payload)?;
                let reply = f(module, ctx, conn, msg);
                send_reply(conn, &reply);
                Ok(())
            }),
        );
    }

    /// Connection-less handler for `T`; used when no role-typed handler
    /// matches, regardless of where the frame arrived.
    pub fn on_message<T, F>(&mut self, mut f: F)
    where
        T: Packet,
        F: FnMut(&mut M, &mut ModuleCtx<M>, T) + 'static,
    {
        let id = self.resolve::<T>();
        self.table.fallback.insert(
            id,
            Box::new(move |module, ctx, _conn, payload| {
                let msg = decode_or_malformed::<T>(payload)?;
                f(module, ctx, msg);
                Ok(())
            }),
        );
    }

    /// Connection-less handler whose return value is sent back on the
    /// connection the frame arrived on.
    pub fn on_message_reply<T, R, F>(&mut self, mut f: F)
    where
        T: Packet,
        R: Packet,
        F: FnMut(&mut M, &mut ModuleCtx<M>, T) -> R + 'static,
    {
        let id = self.resolve::<T>();
        self.table.fallback.insert(
            id,
            Box::new(move |module, ctx, conn, payload| {
                let msg = decode_or_malformed::<T>(payload)?;
                let reply = f(module, ctx, msg);
                send_reply(conn, &reply);
                Ok(())
            }),
        );
    }
}

/// Server APIs available to module handlers and lifecycle hooks.
///
/// Holds cheap owned handles, so timer and delayed-call closures receive a
/// fresh context on every firing.
pub struct ModuleCtx<M: Module> {
    pub(crate) server: ServerHandle,
    pub(crate) proto: Rc<Protocol>,
    pub(crate) components: Rc<RefCell<ComponentSet<M>>>,
    pub(crate) host: Weak<RefCell<ModuleHost<M>>>,
}

impl<M: Module> ModuleCtx<M> {
    /// Sends `msg` on `conn`; mirrors `conn.send(msg)`.
    pub fn send_message<T: Packet>(&self, conn: &Connection, msg: &T) -> Result<()> {
        conn.send(msg)
    }

    /// The raw server handle.
    pub fn server(&self) -> &ServerHandle {
        &self.server
    }

    /// Synchronously connects to an upstream server; blocks until the
    /// connection is established, starts I/O, and returns the connection.
    /// The connection reconnects automatically for the server's lifetime.
    pub fn connect_to_server(&self, ip: &str, port: u16) -> Result<Connection> {
        self.server.connect_to_server(ip, port, None)
    }

    /// [`connect_to_server`](Self::connect_to_server) with per-connection
    /// handler overrides superseding the module's handlers.
    pub fn connect_to_server_with(
        &self,
        ip: &str,
        port: u16,
        handlers: ConnHandlers,
    ) -> Result<Connection> {
        self.server.connect_to_server(ip, port, Some(handlers))
    }

    /// Begins connecting to an upstream server without blocking; emits
    /// `on_connected` once established and reconnects on loss.
    pub fn async_connect(&self, ip: &str, port: u16) -> Result<Connection> {
        self.server.async_connect(ip, port, None)
    }

    /// [`async_connect`](Self::async_connect) with per-connection handler
    /// overrides.
    pub fn async_connect_with(
        &self,
        ip: &str,
        port: u16,
        handlers: ConnHandlers,
    ) -> Result<Connection> {
        self.server.async_connect(ip, port, Some(handlers))
    }

    /// Fires `f` once after `delay`, back on the module.
    pub fn async_wait<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce(&mut M, &mut ModuleCtx<M>) + 'static,
    {
        let host = self.host.clone();
        self.server.spawn(async move {
            tokio::time::sleep(delay).await;
            fire_on_host(&host, f);
        });
    }

    /// Fires `f` every `period` until the server stops.
    pub fn async_wait_period<F>(&self, period: Duration, mut f: F)
    where
        F: FnMut(&mut M, &mut ModuleCtx<M>) + 'static,
    {
        let host = self.host.clone();
        self.server.spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                if host.upgrade().is_none() {
                    break;
                }
                fire_on_host(&host, |m, ctx| f(m, ctx));
            }
        });
    }

    /// Creates a pausable periodic timer firing `f` back on the module.
    pub fn create_timer<F>(&self, period: Duration, mut f: F) -> Timer
    where
        F: FnMut(&mut M, &mut ModuleCtx<M>) + 'static,
    {
        let host = self.host.clone();
        self.server
            .start_timer(period, move || fire_on_host(&host, |m, ctx| f(m, ctx)))
    }

    /// Sweeps inbound sessions, closing those idle longer than `limit`.
    pub fn async_disconnect_inactive_clients(&self, limit: Duration) {
        self.server.async_disconnect_inactive_clients(limit);
    }

    /// Sweeps outbound sessions, closing those idle longer than `limit`.
    pub fn async_disconnect_inactive_servers(&self, limit: Duration) {
        self.server.async_disconnect_inactive_servers(limit);
    }

    /// Passing false initiates server shutdown.
    pub fn set_active(&self, active: bool) {
        self.server.set_active(active);
    }

    /// Visits every inbound connection.
    pub fn for_each_client<F: FnMut(&Connection)>(&self, f: F) {
        self.server.for_each_client(f);
    }

    /// Installs an async forwarding handler over an existing upstream
    /// connection; `receive` and `send` on the returned handler behave as
    /// on a synchronous client.
    pub fn handle_server_async(&self, conn: &Connection) -> crate::client::ServerHandler {
        crate::client::ServerHandler::attach(conn)
    }

    /// Borrows a declared component by type.
    ///
    /// Callable from module handlers and hooks; component handlers reach
    /// their siblings through `ComponentCtx` instead.
    pub fn query_component<C: super::Component<M>>(&self) -> Option<RefMut<'_, C>> {
        let set = self.components.borrow_mut();
        RefMut::filter_map(set, |s| s.get_mut::<C>()).ok()
    }

    /// Synchronously invokes the first component post handler accepting a
    /// `T`, returning its result.
    pub fn post_component<T: 'static, R: 'static>(&self, value: T) -> Option<R> {
        self.components.borrow_mut().post_any(Box::new(value))
    }
}

/// Re-enters the module through its host; used by timers and delayed calls.
pub(crate) fn fire_on_host<M: Module>(
    host: &Weak<RefCell<ModuleHost<M>>>,
    f: impl FnOnce(&mut M, &mut ModuleCtx<M>),
) {
    if let Some(cell) = host.upgrade() {
        cell.borrow_mut().with_ctx(f);
    }
}

/// Owns the module, its handler table, and its components; the single entry
/// point for every event the engine delivers to user code.
pub struct ModuleHost<M: Module> {
    module: M,
    table: HandlerTable<M>,
    components: Rc<RefCell<ComponentSet<M>>>,
    server: ServerHandle,
    proto: Rc<Protocol>,
    self_ref: Weak<RefCell<ModuleHost<M>>>,
}

impl<M: Module> std::fmt::Debug for ModuleHost<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleHost").finish_non_exhaustive()
    }
}

impl<M: Module> ModuleHost<M> {
    pub(crate) fn new_cyclic(
        module: M,
        server: ServerHandle,
        proto: Rc<Protocol>,
    ) -> Rc<RefCell<Self>> {
        let mut reg = ModuleRegistry::new(proto.clone());
        M::register(&mut reg);

        let mut creg = ComponentRegistry::new(proto.clone());
        module.components(&mut creg);

        Rc::new_cyclic(|weak| {
            RefCell::new(ModuleHost {
                module,
                table: reg.table,
                components: Rc::new(RefCell::new(creg.into_set())),
                server,
                proto,
                self_ref: weak.clone(),
            })
        })
    }

    /// The module state.
    pub fn module(&self) -> &M {
        &self.module
    }

    /// Mutable module state; post-run inspection and test setup.
    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    /// Borrows a declared component by type.
    pub fn component<C: super::Component<M>>(&self) -> Option<Ref<'_, C>> {
        let set = self.components.borrow();
        Ref::filter_map(set, |s| s.get::<C>()).ok()
    }

    fn make_ctx(&self) -> ModuleCtx<M> {
        ModuleCtx {
            server: self.server.clone(),
            proto: self.proto.clone(),
            components: self.components.clone(),
            host: self.self_ref.clone(),
        }
    }

    pub(crate) fn with_ctx(&mut self, f: impl FnOnce(&mut M, &mut ModuleCtx<M>)) {
        let mut ctx = self.make_ctx();
        f(&mut self.module, &mut ctx);
    }

    pub(crate) fn dispatch_message(&mut self, conn: &Connection, type_id: u16, payload: &[u8]) {
        let mut ctx = self.make_ctx();

        let mut handled = false;
        if let Some(handler) = self.table.lookup(conn.role(), type_id) {
            handled = true;
            if let Err(err) = handler(&mut self.module, &mut ctx, conn, payload) {
                error!("{err}");
                conn.close();
                return;
            }
        }

        let components = self.components.clone();
        let outcome = components.borrow_mut().dispatch(
            &mut self.module,
            &self.server,
            &self.proto,
            &self.self_ref,
            conn,
            type_id,
            payload,
        );
        match outcome {
            Ok(component_handled) => {
                if !handled && !component_handled {
                    trace!(type_id, "no handler registered, message dropped");
                }
            }
            Err(err) => {
                error!("{err}");
                conn.close();
            }
        }
    }

    pub(crate) fn notify_connected(&mut self, conn: &Connection) {
        self.with_ctx(|module, ctx| module.on_connected(ctx, conn));
        let components = self.components.clone();
        components.borrow_mut().connected(
            &mut self.module,
            &self.server,
            &self.proto,
            &self.self_ref,
            conn,
        );
    }

    pub(crate) fn notify_disconnected(&mut self, conn: &Connection) {
        self.with_ctx(|module, ctx| module.on_disconnected(ctx, conn));
        let components = self.components.clone();
        components.borrow_mut().disconnected(
            &mut self.module,
            &self.server,
            &self.proto,
            &self.self_ref,
            conn,
        );
    }

    pub(crate) fn notify_initialized(&mut self) {
        self.with_ctx(|module, ctx| module.on_initialized(ctx));
        let components = self.components.clone();
        components.borrow_mut().initialized(
            &mut self.module,
            &self.server,
            &self.proto,
            &self.self_ref,
        );
    }

    pub(crate) fn notify_deinitialized(&mut self) {
        self.with_ctx(|module, ctx| module.on_deinitialized(ctx));
        let components = self.components.clone();
        components.borrow_mut().deinitialized(
            &mut self.module,
            &self.server,
            &self.proto,
            &self.self_ref,
        );
    }

    pub(crate) fn notify_configuration(&mut self, options: &Options) {
        self.with_ctx(|module, ctx| module.on_configuration(ctx, options));
        let components = self.components.clone();
        components.borrow_mut().configuration(
            &mut self.module,
            &self.server,
            &self.proto,
            &self.self_ref,
            options,
        );
    }

    pub(crate) fn notify_command(&mut self, cmd: &Command) {
        self.with_ctx(|module, ctx| module.on_command(ctx, cmd));
        let components = self.components.clone();
        components.borrow_mut().command(
            &mut self.module,
            &self.server,
            &self.proto,
            &self.self_ref,
            cmd,
        );
    }
}

/// Type-erased event entry point stored on the server; sessions deliver
/// their events through this without knowing the module type.
pub trait EventSink {
    /// A parsed frame arrived on `conn`.
    fn message(&self, conn: &Connection, type_id: u16, payload: &[u8]);
    /// `conn` was established.
    fn connected(&self, conn: &Connection);
    /// `conn` was lost or closed.
    fn disconnected(&self, conn: &Connection);
    /// A console command was parsed.
    fn command(&self, cmd: &Command);
}

struct HostSink<M: Module> {
    host: Weak<RefCell<ModuleHost<M>>>,
}

impl<M: Module> EventSink for HostSink<M> {
    fn message(&self, conn: &Connection, type_id: u16, payload: &[u8]) {
        if let Some(host) = self.host.upgrade() {
            host.borrow_mut().dispatch_message(conn, type_id, payload);
        }
    }

    fn connected(&self, conn: &Connection) {
        if let Some(host) = self.host.upgrade() {
            host.borrow_mut().notify_connected(conn);
        }
    }

    fn disconnected(&self, conn: &Connection) {
        if let Some(host) = self.host.upgrade() {
            host.borrow_mut().notify_disconnected(conn);
        }
    }

    fn command(&self, cmd: &Command) {
        if let Some(host) = self.host.upgrade() {
            host.borrow_mut().notify_command(cmd);
        }
    }
}

/// Builds the type-erased sink over a module host.
pub(crate) fn host_sink<M: Module>(host: &Rc<RefCell<ModuleHost<M>>>) -> Box<dyn EventSink> {
    Box::new(HostSink {
        host: Rc::downgrade(host),
    })
}
