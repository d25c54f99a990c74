//! Signer using the k256 Rust crate (implementation of ecdsa in Rust).

use crate::abiencode::types::{Address, Hash, Signature};
use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as k256Signature},
        SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};

use super::{hash_to_eth_signed_msg_hash, split_eth_sig, Account, Error, Verifier};

pub struct Signer {
    key: SigningKey,
    addr: Address,
}

impl core::fmt::Debug for Signer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        // Never print the secret key.
        f.debug_struct("Signer").field("addr", &self.addr).finish()
    }
}

fn address_of(key: &VerifyingKey) -> Result<Address, Error> {
    let point = key.to_encoded_point(false);
    let pk_bytes: [u8; 65] = point
        .as_bytes()
        .try_into()
        .map_err(|_| Error::InvalidKey("unexpected public key length".into()))?;
    Ok(Address::from_uncompressed_pubkey(&pk_bytes))
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let key = SigningKey::random(rng);
        // A freshly generated key always has a valid public point.
        let addr = address_of(&key.verifying_key()).unwrap_or_default();
        Self { key, addr }
    }

    /// Import a 32 byte big-endian secret scalar.
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self, Error> {
        let key = SigningKey::from_bytes(secret).map_err(|e| Error::InvalidKey(e.to_string()))?;
        let addr = address_of(&key.verifying_key())?;
        Ok(Self { key, addr })
    }
}

impl Account for Signer {
    fn address(&self) -> Address {
        self.addr
    }

    fn sign_hash(&self, msg: Hash) -> Result<Signature, Error> {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        let sig: recoverable::Signature = self
            .key
            .sign_prehash(&hash.0)
            .map_err(|e| Error::Sign(e.to_string()))?;

        // This Signature type already has the layout we need (r, s and v in
        // this order), but v has to be offset by 27 for the EVM.
        let mut sig_bytes: [u8; 65] = sig
            .as_bytes()
            .try_into()
            .map_err(|_| Error::Sign("unexpected signature length".into()))?;
        debug_assert!(sig_bytes[32] & 0x80 == 0);
        sig_bytes[64] += 27;

        Ok(Signature(sig_bytes))
    }
}

/// Stateless [Verifier] backed by k256.
#[derive(Debug, Default, Clone, Copy)]
pub struct EthVerifier;

impl Verifier for EthVerifier {
    fn recover_signer(&self, msg: Hash, eth_sig: &Signature) -> Result<Address, Error> {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        let (rs, v) = split_eth_sig(eth_sig)?;
        let mut sig_bytes = [0u8; 65];
        sig_bytes[..64].copy_from_slice(&rs);
        sig_bytes[64] = v;

        let sig = recoverable::Signature::from_bytes(&sig_bytes)
            .map_err(|e| Error::Malformed(e.to_string()))?;

        let verifying_key = sig
            .recover_verifying_key_from_digest_bytes(&hash.0.into())
            .map_err(|e| Error::Recover(e.to_string()))?;
        address_of(&verifying_key)
    }
}
