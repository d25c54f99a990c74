use crate::abiencode::types::{Address, Hash, Signature};
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    All, Message, PublicKey, Secp256k1, SecretKey,
};

use super::{hash_to_eth_signed_msg_hash, split_eth_sig, Account, Error, Verifier};

impl From<PublicKey> for Address {
    fn from(pk: PublicKey) -> Self {
        Address::from_uncompressed_pubkey(&pk.serialize_uncompressed())
    }
}

pub struct Signer {
    secp: Secp256k1<All>,
    sk: SecretKey,
    addr: Address,
}

impl core::fmt::Debug for Signer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Signer").field("addr", &self.addr).finish()
    }
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let secp = Secp256k1::new();
        let sk = SecretKey::new(rng);
        let addr = PublicKey::from_secret_key(&secp, &sk).into();
        Self { secp, sk, addr }
    }

    /// Import a 32 byte big-endian secret scalar.
    pub fn from_secret_bytes(secret: &[u8]) -> Result<Self, Error> {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(secret).map_err(|e| Error::InvalidKey(e.to_string()))?;
        let addr = PublicKey::from_secret_key(&secp, &sk).into();
        Ok(Self { secp, sk, addr })
    }
}

impl Account for Signer {
    fn address(&self) -> Address {
        self.addr
    }

    /// Sign a hash using a Ethereum 65-byte recoverable signature.
    ///
    /// Note that this differs from transaction signatures, as it does not
    /// include the length.
    fn sign_hash(&self, hash: Hash) -> Result<Signature, Error> {
        let hash = hash_to_eth_signed_msg_hash(hash);
        let msg = Message::from_slice(&hash.0).map_err(|e| Error::Sign(e.to_string()))?;

        // Recoverable, so the contract can get the address back from v.
        let sig = self.secp.sign_ecdsa_recoverable(&msg, &self.sk);
        let (v, rs) = sig.serialize_compact();

        // EIP-2 makes signatures with a high s invalid. libsecp256k1 already
        // produces canonical (low s) signatures.
        debug_assert!(rs[32] & 0x80 == 0);

        // v is offset by 27 (EIP-2098), no EIP-155 chain id.
        let v: u8 = 27 + v.to_i32() as u8;

        Ok(Signature::new(&rs, v))
    }
}

/// [Verifier] backed by libsecp256k1.
#[derive(Debug)]
pub struct EthVerifier {
    secp: Secp256k1<All>,
}

impl Default for EthVerifier {
    fn default() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }
}

impl Verifier for EthVerifier {
    fn recover_signer(&self, hash: Hash, eth_sig: &Signature) -> Result<Address, Error> {
        let hash = hash_to_eth_signed_msg_hash(hash);
        let (rs, v) = split_eth_sig(eth_sig)?;

        let recid = RecoveryId::from_i32(v.into()).map_err(|e| Error::Malformed(e.to_string()))?;
        let sig = RecoverableSignature::from_compact(&rs, recid)
            .map_err(|e| Error::Malformed(e.to_string()))?;
        let msg = Message::from_slice(&hash.0).map_err(|e| Error::Recover(e.to_string()))?;

        let pk = self
            .secp
            .recover_ecdsa(&msg, &sig)
            .map_err(|e| Error::Recover(e.to_string()))?;
        Ok(pk.into())
    }
}
