//! Error type and Return values used by the Serialization.

use serde::ser;

/// Represents all possible errors that can happen during Serialization.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// The value contains a type without a canonical representation.
    ///
    /// For example floating point numbers, maps, options and enums. Encode
    /// those through a custom `Serialize` implementation (or
    /// `#[serde(serialize_with = ...)]`) that maps them to integers, bytes or
    /// sequences.
    #[error("type is not representable in the canonical encoding: {0}")]
    TypeNotRepresentable(&'static str),
    /// Sequences are length prefixed, iterators of unknown size can't be
    /// encoded.
    #[error("sequence length must be known up front")]
    UnknownLength,
    #[error("{0}")]
    Custom(String),
}

impl ser::Error for Error {
    fn custom<T>(msg: T) -> Self
    where
        T: core::fmt::Display,
    {
        Error::Custom(msg.to_string())
    }
}

/// Alias for `Result` using the [Error] returned by the Serializer.
pub type Result<T> = core::result::Result<T, Error>;
