use super::{PartIdx, State};
use crate::abiencode::types::Signature;

/// A state together with the participants' signatures on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub state: State,
    /// One slot per participant, filled at most once.
    pub sigs: Vec<Option<Signature>>,
}

impl Transaction {
    /// Unsigned transaction for a channel with `num_parts` participants.
    pub fn new(state: State, num_parts: usize) -> Self {
        Self {
            state,
            sigs: vec![None; num_parts],
        }
    }

    pub fn version(&self) -> u64 {
        self.state.version()
    }

    pub fn is_complete(&self) -> bool {
        self.sigs.iter().all(Option::is_some)
    }

    /// Indices of participants that have not signed yet.
    pub fn missing(&self) -> Vec<PartIdx> {
        self.sigs
            .iter()
            .enumerate()
            .filter(|(_, s)| s.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    /// All signatures, if complete.
    pub fn full_sigs(&self) -> Option<Vec<Signature>> {
        self.sigs.iter().copied().collect()
    }
}
