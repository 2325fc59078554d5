//! Payload codec for schema-defined messages.
//!
//! Message payloads travel as MessagePack produced by `rmp-serde`. Structs
//! are serialized in the named-field (map) form via `to_vec_named`, so the
//! wire bytes stay stable when fields are reordered and remain readable by
//! non-Rust peers that expect maps rather than positional arrays.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// MessagePack codec for structured message payloads.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (named-field form).
    #[inline]
    pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes cannot be deserialized to type T.
    #[inline]
    pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
