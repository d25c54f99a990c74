use serde::{Serialize, Serializer};
use sha3::{Digest, Sha3_256};

use super::{ChannelId, NonceShare, PartIdx};
use crate::{
    abiencode::{
        self,
        types::{Address, U256},
    },
    error::{Error, Result},
};

/// Parameters for this channel, exchanged during channel proposal and sent
/// on-chain during a dispute.
///
/// Immutable once constructed: the channel id is the hash of the canonical
/// encoding of these fields and is computed up front.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct Params {
    challenge_duration: u64,
    nonce: U256,
    participants: Vec<Address>,
    #[serde(serialize_with = "app_address")]
    app: Option<Address>,
    ledger_channel: bool,
    virtual_channel: bool,
    #[serde(skip)]
    id: ChannelId,
}

/// No app is encoded as the zero address.
fn app_address<S: Serializer>(app: &Option<Address>, serializer: S) -> Result<S::Ok, S::Error> {
    app.unwrap_or_default().serialize(serializer)
}

impl Params {
    pub fn new(
        challenge_duration: u64,
        nonce: U256,
        participants: Vec<Address>,
        app: Option<Address>,
        ledger_channel: bool,
        virtual_channel: bool,
    ) -> Result<Self> {
        if participants.is_empty() {
            return Err(Error::InvalidParams("no participants".into()));
        }
        if participants.len() > u16::MAX as usize {
            return Err(Error::InvalidParams("too many participants".into()));
        }
        for (i, p) in participants.iter().enumerate() {
            if participants[..i].contains(p) {
                return Err(Error::InvalidParams(format!(
                    "participant {:?} appears twice",
                    p
                )));
            }
        }
        if challenge_duration == 0 {
            return Err(Error::InvalidParams("zero challenge duration".into()));
        }
        // The zero address is the canonical encoding of "no app".
        let app = app.filter(|a| !a.is_zero());

        let mut params = Self {
            challenge_duration,
            nonce,
            participants,
            app,
            ledger_channel,
            virtual_channel,
            id: ChannelId::default(),
        };
        params.id = abiencode::to_hash(&params)?;
        Ok(params)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn challenge_duration(&self) -> u64 {
        self.challenge_duration
    }

    pub fn nonce(&self) -> U256 {
        self.nonce
    }

    pub fn participants(&self) -> &[Address] {
        &self.participants
    }

    pub fn num_parts(&self) -> usize {
        self.participants.len()
    }

    pub fn app(&self) -> Option<Address> {
        self.app
    }

    pub fn ledger_channel(&self) -> bool {
        self.ledger_channel
    }

    pub fn virtual_channel(&self) -> bool {
        self.virtual_channel
    }

    pub fn index_of(&self, addr: &Address) -> Option<PartIdx> {
        self.participants.iter().position(|p| p == addr)
    }
}

/// Combine the nonce shares of all participants (in participant order) into
/// the channel nonce.
pub fn combine_nonce_shares(shares: &[NonceShare]) -> U256 {
    let mut hasher = Sha3_256::new();
    for share in shares {
        hasher.update(share.0);
    }
    U256::from_big_endian(&hasher.finalize())
}
