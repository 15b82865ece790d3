//! Binary data encodings. Bincode is used both for durable storage (log
//! entries, metadata cells, snapshot headers) and for the network protocols.

pub mod bincode;

use crate::error::Result;

/// A serde-encodable value, using the bincode encoding. Provides a blanket
/// encode/decode surface so call sites don't deal with the codec directly.
pub trait Value: serde::Serialize + serde::de::DeserializeOwned {
    /// Encodes the value.
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Decodes a value from a byte slice.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }
}
