//! Off-chain engine for Perun state channels.
//!
//! A [PerunClient] opens channels with its peers over an envelope [Bus],
//! exchanges signed state updates with them and watches an [Adjudicator] to
//! defend its latest state on-chain. Chain access, transport, signing and
//! persistence are pluggable; [sim] provides an in-memory chain for tests.
//!
//! [Bus]: wire::Bus
//! [Adjudicator]: adjudicator::Adjudicator

mod abiencode {
    mod error;
    mod hashing;
    mod ser;

    pub mod as_bytes;
    pub mod types;

    pub use error::{Error, Result};
    pub use hashing::to_hash;
    pub use ser::{to_vec, to_writer, Serializer, Writer};

    #[cfg(test)]
    pub mod tests;
}
pub mod sig;

pub mod adjudicator;
pub mod channel;
mod client;
pub mod config;
pub mod error;
pub mod messages;
pub mod persistence;
pub mod sim;
pub mod wire;

pub use abiencode::{
    to_hash, to_vec,
    types::{Address, Bytes32, Hash, Signature, U256},
    Error as EncodingError,
};
pub use client::{
    Backend, Channel, PerunClient, ProposalHandler, ProposalResponse, UpdateHandler,
    UpdateRequest, UpdateResponse,
};
pub use config::Config;
pub use error::{Error, ErrorKind, Result};
