//! Message dispatch: the async subscription table, the module/component
//! handler registries, and the host that routes parsed frames to user code.

mod component;
mod module;
pub(crate) mod table;

pub use component::{Component, ComponentCtx, ComponentHandlers, ComponentRegistry};
pub use module::{EventSink, Module, ModuleCtx, ModuleHost, ModuleRegistry};
pub use table::DispatchTable;

pub(crate) use module::host_sink;
