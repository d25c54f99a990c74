//! Serialize any `&[u8]` as dynamic length bytes: a length word followed by
//! the data padded to full words.
//!
//! Without this, a `Vec<u8>` would be serialized as a sequence with one word
//! per byte.
//!
//! # Example usage
//! ```ignore
//! #[derive(Serialize, Debug)]
//! pub struct Vector {
//!     #[serde(with = "as_bytes")]
//!     pub data: Vec<u8>,
//! }
//! ```

use serde::{ser::SerializeTuple, Serialize, Serializer};

/// Allows calling `serialize_bytes` from within `serialize_element`.
struct Bytes<'a>(&'a [u8]);

impl<'a> Serialize for Bytes<'a> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(self.0)
    }
}

pub fn serialize<S>(v: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let mut s = serializer.serialize_tuple(2)?;
    s.serialize_element(&(v.len() as u64))?;
    s.serialize_element(&Bytes(v))?;
    s.end()
}
