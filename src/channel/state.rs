use serde::Serialize;

use super::{Asset, ChannelId, Params};
use crate::{
    abiencode::{
        self, as_bytes,
        types::{Hash, U256},
    },
    error::TransitionError,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("allocation has no assets")]
    NoAssets,
    #[error("{got} balance rows for {expected} assets")]
    AssetCountMismatch { expected: usize, got: usize },
    #[error("asset {asset} has {got} balances for {expected} participants")]
    ParticipantCountMismatch {
        asset: usize,
        expected: usize,
        got: usize,
    },
    #[error("sub-allocation {index} has {got} balances for {expected} assets")]
    SubAllocAssetMismatch {
        index: usize,
        expected: usize,
        got: usize,
    },
    #[error("sub-allocation {index} has an invalid index map")]
    InvalidIndexMap { index: usize },
    #[error("sub-allocation {0:?} appears twice")]
    DuplicateSubAlloc(ChannelId),
    #[error("total of asset {asset} overflows")]
    Overflow { asset: usize },
}

/// Funds locked in a sub-channel.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SubAlloc {
    pub id: ChannelId,
    /// Locked amount per asset.
    pub bals: Vec<U256>,
    /// Maps the sub-channel's participant indices to the parent's. Empty if
    /// they are the same.
    pub index_map: Vec<u16>,
}

/// Distribution of the channel's funds.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub assets: Vec<Asset>,
    /// `balances[asset][participant]`
    pub balances: Vec<Vec<U256>>,
    pub locked: Vec<SubAlloc>,
}

impl Allocation {
    /// Allocation without sub-channels.
    pub fn new(assets: Vec<Asset>, balances: Vec<Vec<U256>>) -> Self {
        Self {
            assets,
            balances,
            locked: Vec::new(),
        }
    }

    pub fn num_assets(&self) -> usize {
        self.assets.len()
    }

    /// Check the dimensions for `num_parts` participants and that no total
    /// overflows.
    pub fn valid(&self, num_parts: usize) -> Result<(), AllocationError> {
        if self.assets.is_empty() {
            return Err(AllocationError::NoAssets);
        }
        if self.balances.len() != self.assets.len() {
            return Err(AllocationError::AssetCountMismatch {
                expected: self.assets.len(),
                got: self.balances.len(),
            });
        }
        for (asset, row) in self.balances.iter().enumerate() {
            if row.len() != num_parts {
                return Err(AllocationError::ParticipantCountMismatch {
                    asset,
                    expected: num_parts,
                    got: row.len(),
                });
            }
        }
        for (index, sub) in self.locked.iter().enumerate() {
            if sub.bals.len() != self.assets.len() {
                return Err(AllocationError::SubAllocAssetMismatch {
                    index,
                    expected: self.assets.len(),
                    got: sub.bals.len(),
                });
            }
            let map_ok = sub.index_map.is_empty()
                || sub.index_map.iter().all(|&i| (i as usize) < num_parts);
            if !map_ok {
                return Err(AllocationError::InvalidIndexMap { index });
            }
            if self.locked[..index].iter().any(|s| s.id == sub.id) {
                return Err(AllocationError::DuplicateSubAlloc(sub.id));
            }
        }
        self.totals().map(|_| ())
    }

    /// Per asset: sum of all balances plus all locked amounts.
    pub fn totals(&self) -> Result<Vec<U256>, AllocationError> {
        self.balances
            .iter()
            .enumerate()
            .map(|(asset, row)| {
                let locked = self.locked.iter().filter_map(|s| s.bals.get(asset));
                row.iter()
                    .chain(locked)
                    .try_fold(U256::zero(), |acc, b| acc.checked_add(*b))
                    .ok_or(AllocationError::Overflow { asset })
            })
            .collect()
    }

    pub fn sub_alloc(&self, id: &ChannelId) -> Option<&SubAlloc> {
        self.locked.iter().find(|s| &s.id == id)
    }
}

/// Stores the complete state of a channel.
///
/// Field order is the canonical encoding order and must not change.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct State {
    channel_id: ChannelId,
    version: u64,
    pub allocation: Allocation,
    #[serde(with = "as_bytes")]
    pub app_data: Vec<u8>,
    pub is_final: bool,
}

impl State {
    /// Initial (version 0) state of the channel described by `params`.
    pub fn new(params: &Params, allocation: Allocation, app_data: Vec<u8>) -> Self {
        Self {
            channel_id: params.id(),
            version: 0,
            allocation,
            app_data,
            is_final: false,
        }
    }

    /// Reassemble a state received from elsewhere (wire, persistence).
    pub(crate) fn from_parts(
        channel_id: ChannelId,
        version: u64,
        allocation: Allocation,
        app_data: Vec<u8>,
        is_final: bool,
    ) -> Self {
        Self {
            channel_id,
            version,
            allocation,
            app_data,
            is_final,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Copy of this state with the version bumped by one, the starting point
    /// for every update.
    pub fn make_next_state(&self) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next
    }

    /// Hash of the canonical encoding, the value that gets signed.
    pub fn hash(&self) -> Result<Hash, abiencode::Error> {
        abiencode::to_hash(self)
    }

    /// Structural validity of this state for a channel with `params`.
    pub fn valid(&self, params: &Params) -> Result<(), TransitionError> {
        self.allocation.valid(params.num_parts())?;
        Ok(())
    }

    /// Checks shared by every kind of transition: `self` is the current
    /// state, `next` the proposed successor. Id and version are checked by
    /// the caller.
    pub(crate) fn check_successor(
        &self,
        next: &State,
        params: &Params,
    ) -> Result<(), TransitionError> {
        if self.is_final {
            return Err(TransitionError::CurrentStateIsFinal);
        }
        next.valid(params)?;
        if self.allocation.assets != next.allocation.assets {
            return Err(TransitionError::AssetsMismatch);
        }
        let old_totals = self.allocation.totals()?;
        let new_totals = next.allocation.totals()?;
        if let Some(asset) = old_totals
            .iter()
            .zip(&new_totals)
            .position(|(old, new)| old != new)
        {
            return Err(TransitionError::TotalAllocationMismatch { asset });
        }
        Ok(())
    }
}
