//! Session buffer primitives.
//!
//! Three buffer kinds back the session I/O engine: a rolling read buffer
//! that the socket reads into and the frame parser consumes from the front,
//! a chunked write buffer built from recycled 1 KiB blocks, and a double
//! write buffer that alternates a filling half with an in-flight half.

mod chunked;
mod double;
mod rolling;

pub use chunked::{Chunk, WriteBuf, CHUNK_SIZE};
pub use double::DoubleWriteBuf;
pub use rolling::RollingBuffer;
