//! Wire protocol: frame header format and the message-type registry.

mod registry;
mod wire_format;

pub use registry::{Packet, Protocol, ProtocolBuilder, SubsetBuilder};
pub use wire_format::{
    peek_frame, FrameHeader, FramePeek, HEADER_SIZE, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE,
};
