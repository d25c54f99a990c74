//! Channel data model and the per-channel state machine.

mod app;
pub(crate) mod machine;
mod params;
mod phase;
pub(crate) mod state;
mod transaction;
mod withdrawal_auth;

use crate::abiencode::types::{Address, Bytes32, Hash, U256};
use serde::Serialize;

pub use app::{ActionApp, App, AppError, AppRegistry, StateApp};
pub use machine::Machine;
pub use params::{combine_nonce_shares, Params};
pub use phase::Phase;
pub use state::{Allocation, AllocationError, State, SubAlloc};
pub use transaction::Transaction;
pub use withdrawal_auth::{make_signed_withdrawal_auths, SignedWithdrawalAuth, WithdrawalAuth};

/// Index of a participant in the channel.
///
/// `0` is the proposer of the channel.
pub type PartIdx = usize;

/// Channel identifier: the hash of the canonical encoding of its [Params].
pub type ChannelId = Hash;

/// The nonce added by each participant.
///
/// They are combined into a single [U256] using SHA3-256.
pub type NonceShare = Bytes32;

/// Uniquely identifies an Asset by blockchain + AssetHolder.
#[derive(Serialize, Debug, Copy, Clone, Default, PartialEq, Eq, std::hash::Hash)]
pub struct Asset {
    pub chain_id: U256,
    pub holder: Address,
}
