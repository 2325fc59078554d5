//! Component pack.
//!
//! A module may be decomposed into components: independent objects with
//! their own state and typed handlers over the module's protocol. Every
//! lifecycle event and every frame is offered to each component in
//! declaration order. Components reach their siblings through
//! [`ComponentCtx::call_component`] and [`ComponentCtx::post_component`],
//! and the owning module through [`ComponentCtx::module`].

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::time::Duration;

use super::module::{decode_or_malformed, fire_on_host, send_reply, Module, ModuleCtx, ModuleHost};
use crate::console::Command;
use crate::error::Result;
use crate::protocol::{Packet, Protocol};
use crate::server::{Options, ServerHandle, Timer};
use crate::session::{Connection, Role};

/// A sub-handler aggregated by a module.
///
/// Components declare their typed handlers in `register` and receive every
/// lifecycle event the module receives.
pub trait Component<M: Module>: Any {
    /// Declares the component's typed message and post handlers.
    fn register(_reg: &mut ComponentHandlers<M, Self>)
    where
        Self: Sized,
    {
    }

    /// Runs once the server is listening.
    fn on_initialized(&mut self, _ctx: &mut ComponentCtx<'_, M>) {}

    /// Runs during server teardown.
    fn on_deinitialized(&mut self, _ctx: &mut ComponentCtx<'_, M>) {}

    /// Receives the options map.
    fn on_configuration(&mut self, _ctx: &mut ComponentCtx<'_, M>, _options: &Options) {}

    /// A connection was established.
    fn on_connected(&mut self, _ctx: &mut ComponentCtx<'_, M>, _conn: &Connection) {}

    /// A connection was lost or closed.
    fn on_disconnected(&mut self, _ctx: &mut ComponentCtx<'_, M>, _conn: &Connection) {}

    /// A console command was parsed.
    fn on_command(&mut self, _ctx: &mut ComponentCtx<'_, M>, _cmd: &Command) {}
}

/// What a component handler sees: its module, its siblings, and the server.
pub struct ComponentCtx<'a, M: Module> {
    module: &'a mut M,
    server: &'a ServerHandle,
    proto: &'a Rc<Protocol>,
    host: Weak<RefCell<ModuleHost<M>>>,
    left: &'a mut [Entry<M>],
    right: &'a mut [Entry<M>],
}

impl<M: Module> ComponentCtx<'_, M> {
    /// The owning module.
    pub fn module(&mut self) -> &mut M {
        self.module
    }

    /// The raw server handle.
    pub fn server(&self) -> &ServerHandle {
        self.server
    }

    /// Sends `msg` on `conn`.
    pub fn send_message<T: Packet>(&self, conn: &Connection, msg: &T) -> Result<()> {
        conn.send(msg)
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

    /// Creates a pausable periodic timer firing back on the module.
    pub fn create_timer<F>(&self, period: Duration, mut f: F) -> Timer
    where
        F: FnMut(&mut M, &mut ModuleCtx<M>) + 'static,
    {
        let host = self.host.clone();
        self.server
            .start_timer(period, move || fire_on_host(&host, |m, ctx| f(m, ctx)))
    }

    /// Synchronously connects to an upstream server.
    pub fn connect_to_server(&self, ip: &str, port: u16) -> Result<Connection> {
        self.server.connect_to_server(ip, port, None)
    }

    /// Begins connecting to an upstream server without blocking.
    pub fn async_connect(&self, ip: &str, port: u16) -> Result<Connection> {
        self.server.async_connect(ip, port, None)
    }

    /// Passing false initiates server shutdown.
    pub fn set_active(&self, active: bool) {
        self.server.set_active(active);
    }

    /// Borrows a sibling component by type.
    pub fn call_component<C: Component<M>>(&mut self) -> Option<&mut C> {
        for entry in self.left.iter_mut().chain(self.right.iter_mut()) {
            if let Some(found) = entry.component_any_mut().downcast_mut::<C>() {
                return Some(found);
            }
        }
        None
    }

    /// Synchronously invokes the first sibling post handler accepting a
    /// `T`, returning its result.
    pub fn post_component<T: 'static, R: 'static>(&mut self, value: T) -> Option<R> {
        let mut boxed: Box<dyn Any> = Box::new(value);
        for entry in self.left.iter_mut().chain(self.right.iter_mut()) {
            match entry.try_post(boxed) {
                PostOutcome::Handled(result) => return result.downcast::<R>().ok().map(|r| *r),
                PostOutcome::NotMine(back) => boxed = back,
            }
        }
        None
    }
}

type CompHandler<M, C> =
    Box<dyn FnMut(&mut C, &mut ComponentCtx<'_, M>, &Connection, &[u8]) -> Result<()>>;

type PostHandler<C> = Box<dyn FnMut(&mut C, Box<dyn Any>) -> Box<dyn Any>>;

/// Registration surface for one component's handlers.
pub struct ComponentHandlers<M: Module, C: Component<M>> {
    client: HashMap<u16, CompHandler<M, C>>,
    server: HashMap<u16, CompHandler<M, C>>,
    fallback: HashMap<u16, CompHandler<M, C>>,
    posts: HashMap<TypeId, PostHandler<C>>,
    proto: Rc<Protocol>,
}

impl<M: Module, C: Component<M>> ComponentHandlers<M, C> {
    fn new(proto: Rc<Protocol>) -> Self {
        Self {
            client: HashMap::new(),
            server: HashMap::new(),
            fallback: HashMap::new(),
            posts: HashMap::new(),
            proto,
        }
    }

    fn resolve<T: Packet>(&self) -> u16 {
        match self.proto.id_of::<T>() {
            Some(id) => id,
            None => panic!(
                "component handler registered for {}, which is not in the protocol",
                T::NAME
            ),
        }
    }

    /// Handler for `T` arriving on inbound client connections.
    pub fn on_client<T, F>(&mut self, mut f: F)
    where
        T: Packet,
        F: FnMut(&mut C, &mut ComponentCtx<'_, M>, &Connection, T) + 'static,
    {
        let id = self.resolve::<T>();
        self.client.insert(
            id,
            Box::new(move |comp, ctx, conn, payload| {
                let msg = decode_or_malformed::<T>(payload)?;
                f(comp, ctx, conn, msg);
                Ok(())
            }),
        );
    }

    /// Like [`on_client`](Self::on_client) with an auto-sent reply.
    pub fn on_client_reply<T, R, F>(&mut self, mut f: F)
    where
        T: Packet,
        R: Packet,
        F: FnMut(&mut C, &mut ComponentCtx<'_, M>, &Connection, T) -> R + 'static,
    {
        let id = self.resolve::<T>();
        self.client.insert(
            id,
            Box::new(move |comp, ctx, conn, payload| {
                let msg = decode_or_malformed::<T>(payload)?;
                let reply = f(comp, ctx, conn, msg);
                send_reply(conn, &reply);
                Ok(())
            }),
        );
    }

    /// Handler for `T` arriving on outbound server connections.
    pub fn on_server<T, F>(&mut self, mut f: F)
    where
        T: Packet,
        F: FnMut(&mut C, &mut ComponentCtx<'_, M>, &Connection, T) + 'static,
    {
        let id = self.resolve::<T>();
        self.server.insert(
            id,
            Box::new(move |comp, ctx, conn, payload| {
                let msg = decode_or_malformed::<T>(payload)?;
                f(comp, ctx, conn, msg);
                Ok(())
            }),
        );
    }

    /// Connection-less handler for `T` from either role.
    pub fn on_message<T, F>(&mut self, mut f: F)
    where
        T: Packet,
        F: FnMut(&mut C, &mut ComponentCtx<'_, M>, T) + 'static,
    {
        let id = self.resolve::<T>();
        self.fallback.insert(
            id,
            Box::new(move |comp, ctx, _conn, payload| {
                let msg = decode_or_malformed::<T>(payload)?;
                f(comp, ctx, msg);
                Ok(())
            }),
        );
    }

    /// Connection-less handler whose return value is sent back on the
    /// arriving connection.
    pub fn on_message_reply<T, R, F>(&mut self, mut f: F)
    where
        T: Packet,
        R: Packet,
        F: FnMut(&mut C, &mut ComponentCtx<'_, M>, T) -> R + 'static,
    {
        let id = self.resolve::<T>();
        self.fallback.insert(
            id,
            Box::new(move |comp, ctx, conn, payload| {
                let msg = decode_or_malformed::<T>(payload)?;
                let reply = f(comp, ctx, msg);
                send_reply(conn, &reply);
                Ok(())
            }),
        );
    }

    /// Post handler: sibling components invoke it synchronously through
    /// [`ComponentCtx::post_component`] with a `T` and get the `R` back.
    pub fn post<T, R, F>(&mut self, mut f: F)
    where
        T: 'static,
        R: 'static,
        F: FnMut(&mut C, T) -> R + 'static,
    {
        self.posts.insert(
            TypeId::of::<T>(),
            Box::new(move |comp, boxed| {
                let value = boxed
                    .downcast::<T>()
                    .expect("post handler keyed by argument type");
                Box::new(f(comp, *value))
            }),
        );
    }
}

pub(crate) enum PostOutcome {
    Handled(Box<dyn Any>),
    NotMine(Box<dyn Any>),
}

pub(crate) struct CtxSeed<'a, M: Module> {
    pub module: &'a mut M,
    pub server: &'a ServerHandle,
    pub proto: &'a Rc<Protocol>,
    pub host: &'a Weak<RefCell<ModuleHost<M>>>,
}

/// One component behind a uniform object-safe surface.
trait ComponentDyn<M: Module> {
    fn dispatch_message(
        &mut self,
        seed: CtxSeed<'_, M>,
        left: &mut [Entry<M>],
        right: &mut [Entry<M>],
        conn: &Connection,
        type_id: u16,
        payload: &[u8],
    ) -> Result<bool>;

    fn connected(
        &mut self,
        seed: CtxSeed<'_, M>,
        left: &mut [Entry<M>],
        right: &mut [Entry<M>],
        conn: &Connection,
    );
    fn disconnected(
        &mut self,
        seed: CtxSeed<'_, M>,
        left: &mut [Entry<M>],
        right: &mut [Entry<M>],
        conn: &Connection,
    );
    fn initialized(&mut self, seed: CtxSeed<'_, M>, left: &mut [Entry<M>], right: &mut [Entry<M>]);
    fn deinitialized(
        &mut self,
        seed: CtxSeed<'_, M>,
        left: &mut [Entry<M>],
        right: &mut [Entry<M>],
    );
    fn configuration(
        &mut self,
        seed: CtxSeed<'_, M>,
        left: &mut [Entry<M>],
        right: &mut [Entry<M>],
        options: &Options,
    );
    fn command(
        &mut self,
        seed: CtxSeed<'_, M>,
        left: &mut [Entry<M>],
        right: &mut [Entry<M>],
        cmd: &Command,
    );

    fn try_post(&mut self, arg: Box<dyn Any>) -> PostOutcome;
    fn component_any(&self) -> &dyn Any;
    fn component_any_mut(&mut self) -> &mut dyn Any;
}

type Entry<M> = Box<dyn ComponentDyn<M>>;

struct ComponentCell<M: Module, C: Component<M>> {
    component: C,
    handlers: ComponentHandlers<M, C>,
}

impl<M: Module, C: Component<M>> ComponentCell<M, C> {
    fn ctx<'a>(
        seed: CtxSeed<'a, M>,
        left: &'a mut [Entry<M>],
        right: &'a mut [Entry<M>],
    ) -> ComponentCtx<'a, M> {
        ComponentCtx {
            module: seed.module,
            server: seed.server,
            proto: seed.proto,
            host: seed.host.clone(),
            left,
            right,
        }
    }

}

impl<M: Module, C: Component<M>> ComponentDyn<M> for ComponentCell<M, C> {
    fn dispatch_message(
        &mut self,
        seed: CtxSeed<'_, M>,
        left: &mut [Entry<M>],
        right: &mut [Entry<M>],
        conn: &Connection,
        type_id: u16,
        payload: &[u8],
    ) -> Result<bool> {
        let role = conn.role();
        let ComponentCell {
            component,
            handlers,
        } = self;
        let primary = match role {
            Role::Client => &mut handlers.client,
            Role::Server => &mut handlers.server,
        };
        let handler = if primary.contains_key(&type_id) {
            primary.get_mut(&type_id)
        } else {
            handlers.fallback.get_mut(&type_id)
        };
        match handler {
            Some(h) => {
                let mut ctx = Self::ctx(seed, left, right);
                h(component, &mut ctx, conn, payload)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn connected(
        &mut self,
        seed: CtxSeed<'_, M>,
        left: &mut [Entry<M>],
        right: &mut [Entry<M>],
        conn: &Connection,
    ) {
        let mut ctx = Self::ctx(seed, left, right);
        self.component.on_connected(&mut ctx, conn);
    }

    fn disconnected(
        &mut self,
        seed: CtxSeed<'_, M>,
        left: &mut [Entry<M>],
        right: &mut [Entry<M>],
        conn: &Connection,
    ) {
        let mut ctx = Self::ctx(seed, left, right);
        self.component.on_disconnected(&mut ctx, conn);
    }

    fn initialized(&mut self, seed: CtxSeed<'_, M>, left: &mut [Entry<M>], right: &mut [Entry<M>]) {
        let mut ctx = Self::ctx(seed, left, right);
        self.component.on_initialized(&mut ctx);
    }

    fn deinitialized(
        &mut self,
        seed: CtxSeed<'_, M>,
        left: &mut [Entry<M>],
        right: &mut [Entry<M>],
    ) {
        let mut ctx = Self::ctx(seed, left, right);
        self.component.on_deinitialized(&mut ctx);
    }

    fn configuration(
        &mut self,
        seed: CtxSeed<'_, M>,
        left: &mut [Entry<M>],
        right: &mut [Entry<M>],
        options: &Options,
    ) {
        let mut ctx = Self::ctx(seed, left, right);
        self.component.on_configuration(&mut ctx, options);
    }

    fn command(
        &mut self,
        seed: CtxSeed<'_, M>,
        left: &mut [Entry<M>],
        right: &mut [Entry<M>],
        cmd: &Command,
    ) {
        let mut ctx = Self::ctx(seed, left, right);
        self.component.on_command(&mut ctx, cmd);
    }

    fn try_post(&mut self, arg: Box<dyn Any>) -> PostOutcome {
        let key = (*arg).type_id();
        match self.handlers.posts.get_mut(&key) {
            Some(post) => PostOutcome::Handled(post(&mut self.component, arg)),
            None => PostOutcome::NotMine(arg),
        }
    }

    fn component_any(&self) -> &dyn Any {
        &self.component
    }

    fn component_any_mut(&mut self) -> &mut dyn Any {
        &mut self.component
    }
}

/// Declaration surface handed to [`Module::components`].
pub struct ComponentRegistry<M: Module> {
    entries: Vec<Entry<M>>,
    proto: Rc<Protocol>,
}

impl<M: Module> ComponentRegistry<M> {
    pub(crate) fn new(proto: Rc<Protocol>) -> Self {
        Self {
            entries: Vec::new(),
            proto,
        }
    }

    /// Declares a component; events reach components in declaration order.
    pub fn add<C: Component<M>>(&mut self, component: C) {
        let mut handlers = ComponentHandlers::new(self.proto.clone());
        C::register(&mut handlers);
        self.entries.push(Box::new(ComponentCell {
            component,
            handlers,
        }));
    }

    pub(crate) fn into_set(self) -> ComponentSet<M> {
        ComponentSet {
            entries: self.entries,
        }
    }
}

/// The module's components, in declaration order.
pub(crate) struct ComponentSet<M: Module> {
    entries: Vec<Entry<M>>,
}

macro_rules! fan_out {
    ($self:ident, $module:ident, $server:ident, $proto:ident, $host:ident, $call:ident ( $($extra:expr),* )) => {
        for i in 0..$self.entries.len() {
            let (left, rest) = $self.entries.split_at_mut(i);
            if let Some((cur, right)) = rest.split_first_mut() {
                let seed = CtxSeed {
                    module: &mut *$module,
                    server: $server,
                    proto: $proto,
                    host: $host,
                };
                cur.$call(seed, left, right $(, $extra)*);
            }
        }
    };
}

impl<M: Module> ComponentSet<M> {
    /// Offers a frame to every component; true when any handler took it.
    pub(crate) fn dispatch(
        &mut self,
        module: &mut M,
        server: &ServerHandle,
        proto: &Rc<Protocol>,
        host: &Weak<RefCell<ModuleHost<M>>>,
        conn: &Connection,
        type_id: u16,
        payload: &[u8],
    ) -> Result<bool> {
        let mut handled = false;
        for i in 0..self.entries.len() {
            let (left, rest) = self.entries.split_at_mut(i);
            if let Some((cur, right)) = rest.split_first_mut() {
                let seed = CtxSeed {
                    module: &mut *module,
                    server,
                    proto,
                    host,
                };
                handled |= cur.dispatch_message(seed, left, right, conn, type_id, payload)?;
            }
        }
        Ok(handled)
    }

    pub(crate) fn connected(
        &mut self,
        module: &mut M,
        server: &ServerHandle,
        proto: &Rc<Protocol>,
        host: &Weak<RefCell<ModuleHost<M>>>,
        conn: &Connection,
    ) {
        fan_out!(self, module, server, proto, host, connected(conn));
    }

    pub(crate) fn disconnected(
        &mut self,
        module: &mut M,
        server: &ServerHandle,
        proto: &Rc<Protocol>,
        host: &Weak<RefCell<ModuleHost<M>>>,
        conn: &Connection,
    ) {
        fan_out!(self, module, server, proto, host, disconnected(conn));
    }

    pub(crate) fn initialized(
        &mut self,
        module: &mut M,
        server: &ServerHandle,
        proto: &Rc<Protocol>,
        host: &Weak<RefCell<ModuleHost<M>>>,
    ) {
        fan_out!(self, module, server, proto, host, initialized());
    }

    pub(crate) fn deinitialized(
        &mut self,
        module: &mut M,
        server: &ServerHandle,
        proto: &Rc<Protocol>,
        host: &Weak<RefCell<ModuleHost<M>>>,
    ) {
        fan_out!(self, module, server, proto, host, deinitialized());
    }

    pub(crate) fn configuration(
        &mut self,
        module: &mut M,
        server: &ServerHandle,
        proto: &Rc<Protocol>,
        host: &Weak<RefCell<ModuleHost<M>>>,
        options: &Options,
    ) {
        fan_out!(self, module, server, proto, host, configuration(options));
    }

    pub(crate) fn command(
        &mut self,
        module: &mut M,
        server: &ServerHandle,
        proto: &Rc<Protocol>,
        host: &Weak<RefCell<ModuleHost<M>>>,
        cmd: &Command,
    ) {
        fan_out!(self, module, server, proto, host, command(cmd));
    }

    /// First component of concrete type `C`, if declared.
    pub(crate) fn get<C: Component<M>>(&self) -> Option<&C> {
        self.entries
            .iter()
            .find_map(|e| e.component_any().downcast_ref::<C>())
    }

    /// Mutable access to the first component of concrete type `C`.
    pub(crate) fn get_mut<C: Component<M>>(&mut self) -> Option<&mut C> {
        self.entries
            .iter_mut()
            .find_map(|e| e.component_any_mut().downcast_mut::<C>())
    }

    /// Module-level post: first component with a matching post handler.
    pub(crate) fn post_any<R: 'static>(&mut self, mut value: Box<dyn Any>) -> Option<R> {
        for entry in self.entries.iter_mut() {
            match entry.try_post(value) {
                PostOutcome::Handled(result) => return result.downcast::<R>().ok().map(|r| *r),
                PostOutcome::NotMine(back) => value = back,
            }
        }
        None
    }
}
