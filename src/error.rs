//! Error types for framewire.

use thiserror::Error;

/// Main error type for all framewire operations.
#[derive(Debug, Error)]
pub enum FramewireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// An encoded frame would exceed the 16-bit wire size field.
    #[error("frame too large: {size} bytes exceeds the 65535 byte frame limit")]
    FrameTooLarge { size: usize },

    /// A payload failed to parse for its declared message type.
    #[error("Unknown message format: size={size} buffer={dump}")]
    FrameMalformed { size: usize, dump: String },

    /// The peer closed the connection or an I/O operation failed mid-session.
    #[error("connection lost")]
    ConnectionLost,

    /// A pending async subscriber was cancelled before a message arrived.
    #[error("operation cancelled")]
    OperationCancelled,

    /// A synchronous outbound connect failed.
    #[error("connect failed: {0}")]
    ConnectFailed(#[source] std::io::Error),

    /// The message type is not part of the connection's protocol.
    #[error("message type {name} is not registered in the protocol")]
    UnknownType { name: &'static str },

    /// Bad or missing configuration; fatal to `run_server`.
    #[error("configuration error: {0}")]
    Config(String),
}

impl FramewireError {
    /// Builds the malformed-frame diagnostic, dumping the first bytes of the
    /// offending payload as decimal octets.
    pub(crate) fn malformed(payload: &[u8]) -> Self {
        const DUMP_LIMIT: usize = 32;
        let mut dump = String::new();
        for b in payload.iter().take(DUMP_LIMIT) {
            dump.push_str(&b.to_string());
            dump.push(' ');
        }
        if payload.len() > DUMP_LIMIT {
            dump.push_str("...");
        }
        FramewireError::FrameMalformed {
            size: payload.len(),
            dump,
        }
    }

    /// True for the cancellation signal delivered to async subscribers.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FramewireError::OperationCancelled)
    }
}

/// Result type alias using FramewireError.
pub type Result<T> = std::result::Result<T, FramewireError>;
