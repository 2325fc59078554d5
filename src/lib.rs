//! # framewire
//!
//! Single-threaded, event-driven TCP server framework for request/response
//! and proxy services exchanging length-prefixed, typed, schema-defined
//! binary messages.
//!
//! ## Architecture
//!
//! - **Wire**: every frame is `u16 total_size | u16 type_id | payload`,
//!   little-endian, at most 65535 bytes including the 4-byte header.
//! - **Protocol**: an ordered list of message types; a type's wire id is
//!   its position. Subprotocols keep the parent's ids.
//! - **Module**: the user handler object. Typed handlers are registered per
//!   message type; optional components share the module's event loop and
//!   receive the same lifecycle events.
//! - **Engine**: one current-thread executor drives the acceptor, every
//!   session's reads and writes, every timer, and every user callback.
//!
//! ## Example
//!
//! ```no_run
//! use framewire::{protocol, Module, ModuleRegistry, Options, Packet, Protocol};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Echo { text: String }
//! impl Packet for Echo { const NAME: &'static str = "Echo"; }
//!
//! struct EchoServer;
//!
//! impl Module for EchoServer {
//!     fn protocol() -> Protocol {
//!         protocol![Echo]
//!     }
//!
//!     fn register(reg: &mut ModuleRegistry<Self>) {
//!         reg.on_client_reply(|_m, _ctx, _conn, msg: Echo| msg);
//!     }
//! }
//!
//! fn main() -> framewire::Result<()> {
//!     let mut options = Options::new();
//!     options.insert("Port".into(), "4999".into());
//!     framewire::run_server(EchoServer, "echo", &options)?;
//!     Ok(())
//! }
//! ```

pub mod buffer;
pub mod codec;
pub mod console;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod session;

mod client;

pub use client::{Client, ClientSubscriber, ServerHandler};
pub use console::Command;
pub use dispatch::{
    Component, ComponentCtx, ComponentHandlers, ComponentRegistry, DispatchTable, Module,
    ModuleCtx, ModuleHost, ModuleRegistry,
};
pub use error::{FramewireError, Result};
pub use protocol::{Packet, Protocol};
pub use server::{run_server, Options, Server, ServerControl, ServerHandle, Timer};
pub use session::{ConnHandlers, Connection, Role, SessionRef};
