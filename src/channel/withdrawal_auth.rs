use serde::Serialize;

use super::{ChannelId, PartIdx, Params, State};
use crate::{
    abiencode::{
        self,
        types::{Address, Signature, U256},
    },
    error::{Result, SignatureError},
    sig::{Account, Verifier},
};

/// Authorizes the adjudicator to pay a participant's share of one asset to
/// an on-chain receiver.
#[derive(Serialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct WithdrawalAuth {
    pub channel_id: ChannelId,
    pub participant: Address, // Off-chain channel address
    pub receiver: Address,    // On-chain receiver of funds on withdrawal
    pub amount: U256,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SignedWithdrawalAuth {
    pub auth: WithdrawalAuth,
    pub sig: Signature,
}

impl SignedWithdrawalAuth {
    pub fn verify(&self, verifier: &dyn Verifier) -> bool {
        match abiencode::to_hash(&self.auth) {
            Ok(hash) => verifier.verify(self.auth.participant, hash, &self.sig),
            Err(_) => false,
        }
    }
}

/// One signed authorization per asset for participant `idx`'s outcome in
/// `state`.
pub fn make_signed_withdrawal_auths(
    account: &dyn Account,
    params: &Params,
    state: &State,
    receiver: Address,
    idx: PartIdx,
) -> Result<Vec<SignedWithdrawalAuth>> {
    let participant = params.participants()[idx];
    state
        .allocation
        .balances
        .iter()
        .map(|row| {
            let auth = WithdrawalAuth {
                channel_id: params.id(),
                participant,
                receiver,
                amount: row[idx],
            };
            let sig = account
                .sign_hash(abiencode::to_hash(&auth)?)
                .map_err(SignatureError::from)?;
            Ok(SignedWithdrawalAuth { auth, sig })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::{
            machine::tests::signers,
            state::tests::{asset, bals},
            Allocation,
        },
        sig::EthVerifier,
    };

    #[test]
    fn auths_cover_every_asset_and_verify() {
        let s = signers(2, 7);
        let params = Params::new(
            60,
            U256::one(),
            vec![s[0].address(), s[1].address()],
            None,
            true,
            false,
        )
        .unwrap();
        let state = State::new(
            &params,
            Allocation::new(vec![asset(1), asset(2)], bals(&[&[1, 2], &[3, 4]])),
            vec![],
        );
        let receiver = Address([0xee; 20]);
        let auths = make_signed_withdrawal_auths(s[1].as_ref(), &params, &state, receiver, 1)
            .unwrap();

        assert_eq!(auths.len(), 2);
        assert_eq!(auths[0].auth.amount, U256::from(2u64));
        assert_eq!(auths[1].auth.amount, U256::from(4u64));
        assert!(auths.iter().all(|a| a.verify(&EthVerifier::default())));

        let mut forged = auths[0];
        forged.auth.receiver = Address([0xdd; 20]);
        assert!(!forged.verify(&EthVerifier::default()));
    }
}
