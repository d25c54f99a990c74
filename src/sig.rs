//! Handles the creation and verification of (Ethereum) Signatures.
//!
//! [Account] and [Verifier] are the wallet seam used by the channel machine.
//! Two backends implement them: `k256` (pure Rust, default) and `secp256k1`
//! (bindings to libsecp256k1). Signatures are interchangeable between both.

use core::fmt::Debug;

use crate::abiencode::types::{Address, Hash, Signature};
use sha3::{Digest, Keccak256};

#[cfg(feature = "k256")]
pub mod k256;
#[cfg(feature = "secp256k1")]
pub mod secp256k1;

#[cfg(not(any(feature = "k256", feature = "secp256k1")))]
compile_error!("enable at least one signature backend: `k256` or `secp256k1`");

// When both backends are compiled in, the libsecp256k1 one is the default.
#[cfg(feature = "secp256k1")]
pub use self::secp256k1::{EthVerifier, Signer};
#[cfg(all(feature = "k256", not(feature = "secp256k1")))]
pub use self::k256::{EthVerifier, Signer};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("invalid secret key: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    Sign(String),
    #[error("malformed signature: {0}")]
    Malformed(String),
    #[error("could not recover signer: {0}")]
    Recover(String),
}

/// A key able to sign channel states.
pub trait Account: Debug + Send + Sync {
    fn address(&self) -> Address;

    /// Sign `hash` in the `\x19Ethereum Signed Message:\n32` format.
    fn sign_hash(&self, hash: Hash) -> Result<Signature, Error>;
}

/// Recovers signers from signatures produced by an [Account].
pub trait Verifier: Debug + Send + Sync {
    /// `hash` is the hash that was given to [Account::sign_hash], without the
    /// Ethereum prefix.
    fn recover_signer(&self, hash: Hash, sig: &Signature) -> Result<Address, Error>;

    fn verify(&self, addr: Address, hash: Hash, sig: &Signature) -> bool {
        matches!(self.recover_signer(hash, sig), Ok(signer) if signer == addr)
    }
}

/// Add the `\x19Ethereum Signed Message\n<length>` prefix to hash.
///
/// This is the format expected by the Solidity contracts.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding => We can't use the serializer
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

/// Splits an Ethereum signature into `r || s` and the recovery id, undoing
/// the offset of 27 on `v`.
fn split_eth_sig(sig: &Signature) -> Result<([u8; 64], u8), Error> {
    let v = sig.0[64]
        .checked_sub(27)
        .filter(|v| *v <= 1)
        .ok_or_else(|| Error::Malformed(format!("invalid recovery byte {}", sig.0[64])))?;
    let mut rs = [0u8; 64];
    rs.copy_from_slice(&sig.0[..64]);
    Ok((rs, v))
}
