//! Reacting to the adjudicator: refuting outdated registrations, following
//! progressions and withdrawing once a dispute concluded.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::Channel;
use crate::{
    adjudicator::{AdjudicatorEvent, Timeout},
    channel::{Machine, Phase},
    error::{AdjudicatorError, Error, Result},
};

/// Pause before retrying a withdrawal the adjudicator could not process.
const RETRY_DELAY: Duration = Duration::from_secs(1);

enum Wake {
    Event(AdjudicatorEvent),
    Timer,
}

/// What the watcher does next.
enum Step {
    Continue,
    Wait(Arc<dyn Timeout>),
    Retry,
    Done,
}

async fn wait_for(timer: Option<Arc<dyn Timeout>>, cancel: &CancellationToken) -> Result<()> {
    match timer {
        Some(timer) => timer.wait(cancel).await,
        None => {
            cancel.cancelled().await;
            Err(Error::Cancelled)
        }
    }
}

impl Channel {
    pub(super) fn start_watcher(self: &Arc<Self>) {
        let channel = self.clone();
        let token = self.watcher.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.watch(&token).await {
                error!(channel = ?channel.id, error = %e, "watcher stopped");
                *channel.fatal.lock() = Some(Arc::new(e));
            }
        });
    }

    /// Follow the adjudicator's events for this channel until it is
    /// withdrawn or `cancel` fires.
    ///
    /// Fails only with fatal errors, most notably
    /// [StateRegressed][Error::StateRegressed] when a newer state than ours
    /// got registered.
    pub async fn watch(&self, cancel: &CancellationToken) -> Result<()> {
        let mut events = self.services.adjudicator.subscribe(self.id)?;
        let mut timer = self.dispute_timeout();
        let mut due = false;
        if timer.is_none() && matches!(self.phase().await, Phase::Registered | Phase::Progressed) {
            // Restored mid-dispute: the adjudicator knows when the window ends.
            match self.services.adjudicator.dispute_state(self.id).await {
                Ok(Some(dispute)) => {
                    self.set_dispute_timeout(dispute.timeout.clone());
                    timer = Some(dispute.timeout);
                }
                Ok(None) => due = true,
                Err(e) => {
                    warn!(channel = ?self.id, error = %e, "reading dispute state failed");
                    due = true;
                }
            }
        }
        debug!(channel = ?self.id, "watching adjudicator");

        loop {
            let wake = if due {
                due = false;
                Wake::Timer
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    event = events.recv() => match event {
                        Some(event) => Wake::Event(event),
                        None => {
                            return Err(AdjudicatorError::Unavailable(
                                "event subscription closed".into(),
                            )
                            .into())
                        }
                    },
                    res = wait_for(timer.clone(), cancel) => match res {
                        Ok(()) => Wake::Timer,
                        Err(_) => return Ok(()),
                    },
                }
            };

            let step = match wake {
                Wake::Event(event) => self.on_event(event, cancel).await,
                Wake::Timer => {
                    timer = None;
                    self.on_timer(cancel).await
                }
            };
            match step {
                Ok(Step::Continue) => {}
                Ok(Step::Wait(timeout)) => timer = Some(timeout),
                Ok(Step::Retry) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(RETRY_DELAY) => due = true,
                    }
                }
                Ok(Step::Done) => return Ok(()),
                Err(Error::Cancelled) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!(channel = ?self.id, error = %e, "handling adjudicator event failed"),
            }
        }
    }

    async fn on_event(&self, event: AdjudicatorEvent, cancel: &CancellationToken) -> Result<Step> {
        match event {
            AdjudicatorEvent::Registered {
                version, timeout, ..
            } => {
                let mut m = self.machine.lock().await;
                if matches!(m.phase(), Phase::Withdrawing | Phase::Withdrawn) {
                    return Ok(Step::Continue);
                }
                let ours = m.version();
                if version > ours {
                    let e = Error::StateRegressed {
                        local: ours,
                        on_chain: version,
                    };
                    return Err(self.fail(&m, e));
                }
                if version < ours {
                    info!(channel = ?self.id, registered = version, ours, "refuting outdated registration");
                    return self.refute(&mut m, cancel).await;
                }
                if !matches!(m.phase(), Phase::Registered | Phase::Progressed) {
                    let mut next = m.clone();
                    if next.phase() != Phase::Registering {
                        next.set_registering()?;
                    }
                    next.set_registered(version)?;
                    *m = next;
                    self.persist_phase(&m).await?;
                    info!(channel = ?self.id, version, "peer registered our latest state");
                }
                self.set_dispute_timeout(timeout.clone());
                Ok(Step::Wait(timeout))
            }
            AdjudicatorEvent::Progressed {
                state,
                actor,
                sig,
                timeout,
                ..
            } => {
                let mut m = self.machine.lock().await;
                if matches!(m.phase(), Phase::Withdrawing | Phase::Withdrawn) {
                    return Ok(Step::Continue);
                }
                if state.version() > m.version() {
                    let version = state.version();
                    let mut next = m.clone();
                    next.set_progressed(state, actor, Some(sig))?;
                    *m = next;
                    self.persist_phase(&m).await?;
                    info!(channel = ?self.id, version, actor, "channel progressed on-chain");
                }
                self.set_dispute_timeout(timeout.clone());
                Ok(Step::Wait(timeout))
            }
            AdjudicatorEvent::Concluded { version, .. } => {
                debug!(channel = ?self.id, version, "dispute concluded");
                self.on_timer(cancel).await
            }
        }
    }

    /// Register our newer state over an outdated one.
    async fn refute(&self, m: &mut Machine, cancel: &CancellationToken) -> Result<Step> {
        let mut attempt = 0;
        loop {
            let err = match self.register_locked(m, cancel).await {
                Ok(()) => return Ok(self.dispute_timeout().map_or(Step::Continue, Step::Wait)),
                Err(e) => e,
            };
            if matches!(err.root(), Error::Cancelled) {
                return Err(err);
            }
            warn!(channel = ?self.id, attempt, error = %err, "refutation failed");
            // Somebody else may have refuted meanwhile.
            if let Ok(Some(dispute)) = self.services.adjudicator.dispute_state(self.id).await {
                if dispute.version >= m.version() {
                    return Ok(Step::Continue);
                }
            }
            attempt += 1;
            if attempt > self.services.config.refutation_retries {
                return Err(err);
            }
        }
    }

    async fn on_timer(&self, cancel: &CancellationToken) -> Result<Step> {
        let err = match self.withdraw(cancel).await {
            Ok(()) => return Ok(Step::Done),
            Err(e) => e,
        };
        match err.root() {
            Error::Adjudicator(AdjudicatorError::NotConcludable { timeout }) => {
                self.set_dispute_timeout(timeout.clone());
                Ok(Step::Wait(timeout.clone()))
            }
            Error::Adjudicator(e) if e.is_retryable() => {
                warn!(channel = ?self.id, error = %e, "withdrawal failed, retrying");
                Ok(Step::Retry)
            }
            _ => Err(err),
        }
    }
}
