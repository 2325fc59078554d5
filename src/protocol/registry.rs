//! Protocol registry: the ordered message-type list that defines wire ids.
//!
//! A protocol is an ordered list of message types; the wire id of a type is
//! its zero-based position in that list. A subprotocol is a subset that
//! keeps the parent's ids, so a client speaking only part of a protocol
//! still interoperates on the wire. Registries are built once, before any
//! traffic flows, and are immutable afterwards.

use std::any::TypeId;
use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A schema-defined message type.
///
/// One impl line per type:
///
/// ```
/// use framewire::protocol::Packet;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Ping { seq: u32 }
///
/// impl Packet for Ping {
///     const NAME: &'static str = "Ping";
/// }
/// ```
pub trait Packet: Serialize + DeserializeOwned + 'static {
    /// Diagnostic name carried into logs and errors.
    const NAME: &'static str;
}

/// Ordered message-type registry mapping types to wire ids.
#[derive(Clone)]
pub struct Protocol {
    ids: HashMap<TypeId, u16>,
    names: HashMap<u16, &'static str>,
    len: u16,
}

impl Protocol {
    /// Starts building a protocol; message order defines ids.
    pub fn builder() -> ProtocolBuilder {
        ProtocolBuilder {
            proto: Protocol {
                ids: HashMap::new(),
                names: HashMap::new(),
                len: 0,
            },
        }
    }

    /// Starts building a subprotocol that preserves this protocol's ids.
    pub fn subset(&self) -> SubsetBuilder<'_> {
        SubsetBuilder {
            parent: self,
            proto: Protocol {
                ids: HashMap::new(),
                names: HashMap::new(),
                len: self.len,
            },
        }
    }

    /// Wire id of `T`, if registered.
    pub fn id_of<T: Packet>(&self) -> Option<u16> {
        self.ids.get(&TypeId::of::<T>()).copied()
    }

    /// Diagnostic name of the type behind a wire id.
    pub fn name_of(&self, id: u16) -> Option<&'static str> {
        self.names.get(&id).copied()
    }

    /// True when some registered type carries this wire id.
    pub fn contains_id(&self, id: u16) -> bool {
        self.names.contains_key(&id)
    }

    /// Number of ids in the parent numbering (subprotocols report the
    /// parent's length).
    pub fn len(&self) -> u16 {
        self.len
    }

    /// True when no message types are registered.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn add<T: Packet>(&mut self, id: u16) {
        let prev = self.ids.insert(TypeId::of::<T>(), id);
        assert!(
            prev.is_none(),
            "message type {} registered twice in protocol",
            T::NAME
        );
        self.names.insert(id, T::NAME);
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ordered: Vec<_> = self.names.iter().collect();
        ordered.sort_by_key(|(id, _)| **id);
        f.debug_map().entries(ordered).finish()
    }
}

/// Builder for a full protocol; positions assign ids 0, 1, 2, ….
pub struct ProtocolBuilder {
    proto: Protocol,
}

impl ProtocolBuilder {
    /// Appends a message type; its id is the current list position.
    pub fn message<T: Packet>(mut self) -> Self {
        let id = self.proto.len;
        self.proto.add::<T>(id);
        self.proto.len += 1;
        self
    }

    /// Finishes the registry.
    pub fn build(self) -> Protocol {
        self.proto
    }
}

/// Builder for a subprotocol; members resolve ids through the parent.
pub struct SubsetBuilder<'a> {
    parent: &'a Protocol,
    proto: Protocol,
}

impl SubsetBuilder<'_> {
    /// Adds a parent message type, keeping the parent's id for it.
    pub fn message<T: Packet>(mut self) -> Self {
        let id = match self.parent.id_of::<T>() {
            Some(id) => id,
            None => panic!(
                "message type {} is not part of the parent protocol",
                T::NAME
            ),
        };
        self.proto.add::<T>(id);
        self
    }

    /// Finishes the registry.
    pub fn build(self) -> Protocol {
        self.proto
    }
}

/// Declares a protocol from an ordered list of message types.
///
/// ```
/// use framewire::{protocol, protocol::Packet};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Hello { who: String }
/// impl Packet for Hello { const NAME: &'static str = "Hello"; }
///
/// let proto = protocol![Hello];
/// assert_eq!(proto.id_of::<Hello>(), Some(0));
/// ```
#[macro_export]
macro_rules! protocol {
    ($($ty:ty),+ $(,)?) => {
        $crate::protocol::Protocol::builder()$(.message::<$ty>())+.build()
    };
}
