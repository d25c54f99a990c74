//! Simulated on-chain backend.
//!
//! [SimChain] keeps accounts, channel deposits and disputes in memory and
//! measures time with the tokio clock, so tests running with a paused clock
//! can let challenge durations elapse instantly. [SimAdjudicator] and
//! [SimFunder] implement the capability traits on top of it.

mod chain;

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use chain::{SimChain, SimTimeout};

use crate::{
    adjudicator::{
        Adjudicator, AdjudicatorReq, DisputeState, EventSubscription, Funder, FundingReq,
        ProgressReq, Timeout, WithdrawReq,
    },
    channel::{ChannelId, Transaction},
    error::{AdjudicatorError, Error, Result},
};

/// [Adjudicator] backed by a [SimChain].
#[derive(Debug)]
pub struct SimAdjudicator {
    chain: Arc<SimChain>,
    /// Number of upcoming calls that fail as if the node was unreachable.
    outages: AtomicU32,
}

impl SimAdjudicator {
    pub fn new(chain: Arc<SimChain>) -> Self {
        Self {
            chain,
            outages: AtomicU32::new(0),
        }
    }

    /// Let the next `n` calls fail with a retryable error.
    pub fn fail_next(&self, n: u32) {
        self.outages.store(n, Ordering::SeqCst);
    }

    fn check_outage(&self) -> Result<()> {
        let took = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(AdjudicatorError::Unavailable("simulated outage".into()).into()),
            Err(_) => Ok(()),
        }
    }
}

fn cancelled(cancel: &CancellationToken) -> Result<()> {
    match cancel.is_cancelled() {
        true => Err(Error::Cancelled),
        false => Ok(()),
    }
}

#[async_trait]
impl Adjudicator for SimAdjudicator {
    async fn register(
        &self,
        req: &AdjudicatorReq,
        cancel: &CancellationToken,
    ) -> Result<Arc<dyn Timeout>> {
        cancelled(cancel)?;
        self.check_outage()?;
        let timeout = self.chain.register(&req.params, &req.tx)?;
        Ok(Arc::new(timeout))
    }

    async fn progress(&self, req: &ProgressReq, cancel: &CancellationToken) -> Result<()> {
        cancelled(cancel)?;
        self.check_outage()?;
        self.chain.progress(req)
    }

    async fn withdraw(
        &self,
        req: &WithdrawReq,
        sub_states: &[Transaction],
        cancel: &CancellationToken,
    ) -> Result<()> {
        cancelled(cancel)?;
        self.check_outage()?;
        self.chain.withdraw(req, sub_states)
    }

    async fn dispute_state(&self, id: ChannelId) -> Result<Option<DisputeState>> {
        Ok(self.chain.dispute_state(id))
    }

    fn subscribe(&self, id: ChannelId) -> Result<EventSubscription> {
        Ok(self.chain.subscribe(id))
    }
}

/// [Funder] backed by a [SimChain].
#[derive(Debug)]
pub struct SimFunder {
    chain: Arc<SimChain>,
    withhold: bool,
}

impl SimFunder {
    pub fn new(chain: Arc<SimChain>) -> Self {
        Self {
            chain,
            withhold: false,
        }
    }

    /// A funder that never deposits but still waits for the others.
    pub fn withholding(chain: Arc<SimChain>) -> Self {
        Self {
            chain,
            withhold: true,
        }
    }
}

#[async_trait]
impl Funder for SimFunder {
    async fn fund(&self, req: &FundingReq, cancel: &CancellationToken) -> Result<()> {
        cancelled(cancel)?;
        if !self.withhold {
            self.chain.deposit(req)?;
        }
        self.chain.await_funded(req, cancel).await
    }
}
