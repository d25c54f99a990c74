//! Conversions of the channel data model.

use super::ConversionError;
use crate::{
    abiencode::types::{Address, Hash, Signature, U256},
    channel::{Allocation, Asset, Params, State, SubAlloc, Transaction},
    wire::proto,
};

pub(crate) fn address_from(bytes: &[u8], field: &'static str) -> Result<Address, ConversionError> {
    Address::try_from(bytes).or(Err(ConversionError::ByteLengthMismatch(field)))
}

/// The zero-length encoding stands for "none".
pub(crate) fn opt_address_from(
    bytes: &[u8],
    field: &'static str,
) -> Result<Option<Address>, ConversionError> {
    if bytes.is_empty() {
        Ok(None)
    } else {
        address_from(bytes, field).map(Some)
    }
}

pub(crate) fn hash_from(bytes: &[u8], field: &'static str) -> Result<Hash, ConversionError> {
    Hash::try_from(bytes).or(Err(ConversionError::ByteLengthMismatch(field)))
}

pub(crate) fn signature_from(
    bytes: &[u8],
    field: &'static str,
) -> Result<Signature, ConversionError> {
    Signature::try_from(bytes).or(Err(ConversionError::ByteLengthMismatch(field)))
}

/// Big-endian, at most 32 bytes.
pub(crate) fn u256_from(bytes: &[u8], field: &'static str) -> Result<U256, ConversionError> {
    if bytes.len() > 32 {
        return Err(ConversionError::ByteLengthMismatch(field));
    }
    Ok(U256::from_big_endian(bytes))
}

pub(crate) fn balance_from(value: proto::Balance) -> Result<Vec<U256>, ConversionError> {
    value
        .balance
        .iter()
        .map(|b| u256_from(b, "balance"))
        .collect()
}

pub(crate) fn balance_to(row: &[U256]) -> proto::Balance {
    proto::Balance {
        balance: row.iter().map(|b| b.to_word().to_vec()).collect(),
    }
}

pub(crate) fn balances_from(value: proto::Balances) -> Result<Vec<Vec<U256>>, ConversionError> {
    value.balances.into_iter().map(balance_from).collect()
}

pub(crate) fn balances_to(rows: &[Vec<U256>]) -> proto::Balances {
    proto::Balances {
        balances: rows.iter().map(|r| balance_to(r)).collect(),
    }
}

impl From<&Asset> for proto::Asset {
    fn from(value: &Asset) -> Self {
        Self {
            chain_id: value.chain_id.to_word().to_vec(),
            holder: value.holder.0.to_vec(),
        }
    }
}

impl TryFrom<proto::Asset> for Asset {
    type Error = ConversionError;

    fn try_from(value: proto::Asset) -> Result<Self, Self::Error> {
        Ok(Self {
            chain_id: u256_from(&value.chain_id, "chain_id")?,
            holder: address_from(&value.holder, "holder")?,
        })
    }
}

impl From<&SubAlloc> for proto::SubAlloc {
    fn from(value: &SubAlloc) -> Self {
        Self {
            id: value.id.0.to_vec(),
            bals: Some(balance_to(&value.bals)),
            index_map: Some(proto::IndexMap {
                index_map: value.index_map.iter().map(|i| *i as u32).collect(),
            }),
        }
    }
}

impl TryFrom<proto::SubAlloc> for SubAlloc {
    type Error = ConversionError;

    fn try_from(value: proto::SubAlloc) -> Result<Self, Self::Error> {
        let index_map = value
            .index_map
            .map(|m| m.index_map)
            .unwrap_or_default()
            .into_iter()
            .map(|i| u16::try_from(i).or(Err(ConversionError::ParticipantSizeMismatch)))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            id: hash_from(&value.id, "sub_alloc.id")?,
            bals: balance_from(value.bals.ok_or(ConversionError::ExpectedSome("sub_alloc.bals"))?)?,
            index_map,
        })
    }
}

impl From<&Allocation> for proto::Allocation {
    fn from(value: &Allocation) -> Self {
        Self {
            assets: value.assets.iter().map(Into::into).collect(),
            balances: Some(balances_to(&value.balances)),
            locked: value.locked.iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<proto::Allocation> for Allocation {
    type Error = ConversionError;

    fn try_from(value: proto::Allocation) -> Result<Self, Self::Error> {
        let balances = balances_from(
            value
                .balances
                .ok_or(ConversionError::ExpectedSome("allocation.balances"))?,
        )?;
        if balances.len() != value.assets.len() {
            return Err(ConversionError::AssetSizeMismatch);
        }
        Ok(Self {
            assets: value
                .assets
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
            balances,
            locked: value
                .locked
                .into_iter()
                .map(TryInto::try_into)
                .collect::<Result<_, _>>()?,
        })
    }
}

impl From<&State> for proto::State {
    fn from(value: &State) -> Self {
        Self {
            id: value.channel_id().0.to_vec(),
            version: value.version(),
            allocation: Some((&value.allocation).into()),
            data: value.app_data.clone(),
            is_final: value.is_final,
        }
    }
}

impl TryFrom<proto::State> for State {
    type Error = ConversionError;

    fn try_from(value: proto::State) -> Result<Self, Self::Error> {
        Ok(State::from_parts(
            hash_from(&value.id, "state.id")?,
            value.version,
            value
                .allocation
                .ok_or(ConversionError::ExpectedSome("state.allocation"))?
                .try_into()?,
            value.data,
            value.is_final,
        ))
    }
}

impl From<&Params> for proto::Params {
    fn from(value: &Params) -> Self {
        Self {
            id: value.id().0.to_vec(),
            challenge_duration: value.challenge_duration(),
            parts: value.participants().iter().map(|p| p.0.to_vec()).collect(),
            app: value.app().map(|a| a.0.to_vec()).unwrap_or_default(),
            nonce: value.nonce().to_word().to_vec(),
            ledger_channel: value.ledger_channel(),
            virtual_channel: value.virtual_channel(),
        }
    }
}

impl TryFrom<proto::Params> for Params {
    type Error = ConversionError;

    /// The id is recomputed; a transmitted id that does not match is an
    /// error.
    fn try_from(value: proto::Params) -> Result<Self, Self::Error> {
        let participants = value
            .parts
            .iter()
            .map(|p| address_from(p, "params.parts"))
            .collect::<Result<_, _>>()?;
        let params = Params::new(
            value.challenge_duration,
            u256_from(&value.nonce, "params.nonce")?,
            participants,
            opt_address_from(&value.app, "params.app")?,
            value.ledger_channel,
            value.virtual_channel,
        )
        .map_err(|e| ConversionError::InvalidParams(e.to_string()))?;
        if !value.id.is_empty() && hash_from(&value.id, "params.id")? != params.id() {
            return Err(ConversionError::InvalidParams("channel id mismatch".into()));
        }
        Ok(params)
    }
}

impl From<&Transaction> for proto::Transaction {
    fn from(value: &Transaction) -> Self {
        Self {
            state: Some((&value.state).into()),
            sigs: value
                .sigs
                .iter()
                .map(|s| s.map(|s| s.0.to_vec()).unwrap_or_default())
                .collect(),
        }
    }
}

impl TryFrom<proto::Transaction> for Transaction {
    type Error = ConversionError;

    fn try_from(value: proto::Transaction) -> Result<Self, Self::Error> {
        let sigs = value
            .sigs
            .iter()
            .map(|s| match s.is_empty() {
                true => Ok(None),
                false => signature_from(s, "transaction.sigs").map(Some),
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            state: value
                .state
                .ok_or(ConversionError::ExpectedSome("transaction.state"))?
                .try_into()?,
            sigs,
        })
    }
}
