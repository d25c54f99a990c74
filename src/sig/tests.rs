use super::{Account, Verifier};
use crate::{
    abiencode::{self, as_bytes, types::Address},
    Hash,
};
use rand::{rngs::StdRng, SeedableRng};
use serde::Serialize;
use uint::hex::FromHex;

fn data() -> Hash {
    #[derive(Serialize, Debug)]
    struct Bytes {
        #[serde(with = "as_bytes")]
        value: [u8; 4],
    }
    let d = Bytes {
        value: [0xa1, 0xa2, 0xa3, 0xa4],
    };

    abiencode::to_hash(&d).unwrap()
}

fn secret_one() -> [u8; 32] {
    let mut secret = [0u8; 32];
    secret[31] = 1;
    secret
}

fn address_of_secret_one() -> Address {
    // Well known address of the secret key 0x00..01.
    Address(<[u8; 20]>::from_hex("7e5f4552091a69125d5dfcb7b8c2659029395bdf").unwrap())
}

macro_rules! make_known_address {
    ($name:ident, $signer:ty) => {
        #[test]
        fn $name() {
            let signer = <$signer>::from_secret_bytes(&secret_one()).unwrap();
            assert_eq!(signer.address(), address_of_secret_one());
        }
    };
}

macro_rules! make_a_to_b {
    ($name:ident, $signer:ty, $verifier:ty) => {
        #[test]
        fn $name() {
            // Do not use that on any real device, this is just for testing.
            let mut rng = StdRng::seed_from_u64(0);
            let signer = <$signer>::new(&mut rng);
            let msg = data();
            let sig = signer.sign_hash(msg).unwrap();
            assert!(sig.0[64] == 27 || sig.0[64] == 28);

            let verifier = <$verifier>::default();
            let address = verifier.recover_signer(msg, &sig).unwrap();

            assert_eq!(address, signer.address());
            assert!(verifier.verify(signer.address(), msg, &sig));
        }
    };
}

macro_rules! make_rejects_tampering {
    ($name:ident, $signer:ty, $verifier:ty) => {
        #[test]
        fn $name() {
            let mut rng = StdRng::seed_from_u64(1);
            let signer = <$signer>::new(&mut rng);
            let verifier = <$verifier>::default();
            let sig = signer.sign_hash(data()).unwrap();

            // Different message: recovers some other address (or nothing).
            let mut other = data();
            other.0[0] ^= 1;
            assert!(!verifier.verify(signer.address(), other, &sig));

            // Broken recovery byte.
            let mut bad_v = sig;
            bad_v.0[64] = 5;
            assert!(verifier.recover_signer(data(), &bad_v).is_err());
            assert!(!verifier.verify(signer.address(), data(), &bad_v));
        }
    };
}

#[cfg(feature = "k256")]
make_known_address!(k256_known_address, super::k256::Signer);

#[cfg(feature = "secp256k1")]
make_known_address!(secp256k1_known_address, super::secp256k1::Signer);

#[cfg(feature = "k256")]
make_a_to_b!(k256_to_k256, super::k256::Signer, super::k256::EthVerifier);

#[cfg(feature = "secp256k1")]
make_a_to_b!(
    secp256k1_to_secp256k1,
    super::secp256k1::Signer,
    super::secp256k1::EthVerifier
);

#[cfg(all(feature = "secp256k1", feature = "k256"))]
make_a_to_b!(
    secp256k1_to_k256,
    super::secp256k1::Signer,
    super::k256::EthVerifier
);

#[cfg(all(feature = "secp256k1", feature = "k256"))]
make_a_to_b!(
    k256_to_secp256k1,
    super::k256::Signer,
    super::secp256k1::EthVerifier
);

#[cfg(feature = "k256")]
make_rejects_tampering!(
    k256_rejects_tampering,
    super::k256::Signer,
    super::k256::EthVerifier
);

#[cfg(feature = "secp256k1")]
make_rejects_tampering!(
    secp256k1_rejects_tampering,
    super::secp256k1::Signer,
    super::secp256k1::EthVerifier
);
