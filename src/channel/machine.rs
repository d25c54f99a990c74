//! Per-channel state machine.
//!
//! The machine is purely synchronous and never does I/O. Every operation
//! either succeeds and moves the machine to its target phase, or fails and
//! leaves the machine exactly as it was. Callers that need to try something
//! speculatively clone the machine first.

use std::sync::Arc;

use tracing::debug;

use super::{App, PartIdx, Params, Phase, State, Transaction};
use crate::{
    abiencode::types::Signature,
    error::{Error, PhaseError, ProtocolError, Result, SignatureError, TransitionError},
    sig::{Account, Verifier},
};

#[derive(Debug, Clone)]
pub struct Machine {
    idx: PartIdx,
    params: Arc<Params>,
    app: App,
    account: Arc<dyn Account>,
    verifier: Arc<dyn Verifier>,
    phase: Phase,
    /// Last fully signed (or adjudicator-confirmed) transaction, `None`
    /// before the initial state is enabled.
    current: Option<Transaction>,
    staging: Option<Transaction>,
    /// Participant that proposed the staged state.
    staging_actor: Option<PartIdx>,
    /// One pending action per participant in an action round.
    actions: Vec<Option<Vec<u8>>>,
}

impl Machine {
    /// Machine in `InitActing` for participant `idx`.
    pub fn new(
        account: Arc<dyn Account>,
        verifier: Arc<dyn Verifier>,
        params: Arc<Params>,
        app: App,
        idx: PartIdx,
    ) -> Result<Self> {
        check_identity(account.as_ref(), &params, idx)?;
        if app.address() != params.app() {
            return Err(Error::InvalidParams(format!(
                "app {:?} does not match params app {:?}",
                app.address(),
                params.app()
            )));
        }
        let n = params.num_parts();
        Ok(Self {
            idx,
            params,
            app,
            account,
            verifier,
            phase: Phase::InitActing,
            current: None,
            staging: None,
            staging_actor: None,
            actions: vec![None; n],
        })
    }

    /// Rebuild a machine from persisted data.
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        account: Arc<dyn Account>,
        verifier: Arc<dyn Verifier>,
        params: Arc<Params>,
        app: App,
        idx: PartIdx,
        phase: Phase,
        current: Option<Transaction>,
        staging: Option<Transaction>,
        staging_actor: Option<PartIdx>,
    ) -> Result<Self> {
        let mut machine = Self::new(account, verifier, params, app, idx)?;
        let n = machine.params.num_parts();
        let before_init = matches!(phase, Phase::InitActing | Phase::InitSigning);
        if before_init != current.is_none() {
            return Err(Error::Persist(format!(
                "phase {} inconsistent with current transaction",
                phase
            )));
        }
        if phase.is_signing() != staging.is_some() {
            return Err(Error::Persist(format!(
                "phase {} inconsistent with staged transaction",
                phase
            )));
        }
        for tx in current.iter().chain(staging.iter()) {
            if tx.state.channel_id() != machine.params.id() || tx.sigs.len() != n {
                return Err(Error::Persist("transaction of another channel".into()));
            }
        }
        machine.phase = phase;
        machine.current = current;
        machine.staging = staging;
        machine.staging_actor = staging_actor;
        Ok(machine)
    }

    pub fn idx(&self) -> PartIdx {
        self.idx
    }

    pub fn params(&self) -> &Arc<Params> {
        &self.params
    }

    pub fn app(&self) -> &App {
        &self.app
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn current_tx(&self) -> Option<&Transaction> {
        self.current.as_ref()
    }

    pub fn staging_tx(&self) -> Option<&Transaction> {
        self.staging.as_ref()
    }

    pub fn staging_actor(&self) -> Option<PartIdx> {
        self.staging_actor
    }

    /// Current state, once the initial state is enabled.
    pub fn state(&self) -> Option<&State> {
        self.current.as_ref().map(|tx| &tx.state)
    }

    /// Version of the current state (0 before init).
    pub fn version(&self) -> u64 {
        self.current.as_ref().map_or(0, Transaction::version)
    }

    fn expect_phase(&self, op: &'static str, allowed: &[Phase]) -> Result<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(PhaseError {
                op,
                phase: self.phase,
            }
            .into())
        }
    }

    fn set_phase(&mut self, phase: Phase) {
        debug!(
            channel = ?self.params.id(),
            idx = self.idx,
            from = %self.phase,
            to = %phase,
            "phase transition"
        );
        self.phase = phase;
    }

    fn current(&self) -> Result<&Transaction> {
        self.current
            .as_ref()
            .ok_or_else(|| Error::internal(format!("no current transaction in phase {}", self.phase)))
    }

    fn staging(&self) -> Result<&Transaction> {
        self.staging
            .as_ref()
            .ok_or_else(|| Error::internal(format!("no staged transaction in phase {}", self.phase)))
    }

    fn check_id(&self, state: &State) -> Result<()> {
        if state.channel_id() != self.params.id() {
            return Err(ProtocolError::ChannelIdMismatch {
                expected: self.params.id(),
                got: state.channel_id(),
            }
            .into());
        }
        Ok(())
    }

    fn check_next_version(&self, state: &State) -> Result<()> {
        let expected = self.version() + 1;
        if state.version() != expected {
            return Err(ProtocolError::VersionMismatch {
                expected,
                got: state.version(),
            }
            .into());
        }
        Ok(())
    }

    fn stage(&mut self, state: State, actor: PartIdx, phase: Phase) {
        let n = self.params.num_parts();
        self.staging = Some(Transaction::new(state, n));
        self.staging_actor = Some(actor);
        self.set_phase(phase);
    }

    fn clear_staging(&mut self) {
        self.staging = None;
        self.staging_actor = None;
        self.actions.iter_mut().for_each(|a| *a = None);
    }

    /// Stage the initial state `InitActing -> InitSigning`.
    pub fn init(&mut self, allocation: super::Allocation, app_data: Vec<u8>) -> Result<()> {
        self.expect_phase("init", &[Phase::InitActing])?;
        let state = State::new(&self.params, allocation, app_data);
        state.valid(&self.params)?;
        self.app.valid_init(&self.params, &state)?;
        // The proposer (index 0) counts as the actor of the initial state.
        self.stage(state, 0, Phase::InitSigning);
        Ok(())
    }

    /// Stage the initial state of an action app from one action per
    /// participant.
    pub fn init_from_actions(&mut self, actions: &[Vec<u8>]) -> Result<()> {
        self.expect_phase("init_from_actions", &[Phase::InitActing])?;
        let app = self
            .app
            .as_action_app()
            .ok_or(TransitionError::ActionAppUpdate)?
            .clone();
        if actions.len() != self.params.num_parts() {
            return Err(Error::InvalidParams(format!(
                "{} actions for {} participants",
                actions.len(),
                self.params.num_parts()
            )));
        }
        let (allocation, app_data) = app.init_state(&self.params, actions)?;
        self.init(allocation, app_data)
    }

    /// Sign the staged state with our own key.
    pub fn sign(&mut self) -> Result<Signature> {
        self.expect_phase(
            "sign",
            &[Phase::InitSigning, Phase::Signing, Phase::Progressing],
        )?;
        let staging = self.staging()?;
        if staging.sigs[self.idx].is_some() {
            return Err(SignatureError::AlreadySigned(self.idx).into());
        }
        let hash = staging.state.hash()?;
        let sig = self
            .account
            .sign_hash(hash)
            .map_err(SignatureError::from)?;
        if let Some(staging) = self.staging.as_mut() {
            staging.sigs[self.idx] = Some(sig);
        }
        Ok(sig)
    }

    /// Add the signature of participant `idx` on the staged state.
    pub fn add_sig(&mut self, idx: PartIdx, sig: Signature) -> Result<()> {
        self.expect_phase("add_sig", &[Phase::InitSigning, Phase::Signing])?;
        let staging = self.staging()?;
        let signer = *self
            .params
            .participants()
            .get(idx)
            .ok_or(SignatureError::UnknownParticipant(idx))?;
        if staging.sigs[idx].is_some() {
            return Err(SignatureError::AlreadySigned(idx).into());
        }
        let hash = staging.state.hash()?;
        if !self.verifier.verify(signer, hash, &sig) {
            return Err(SignatureError::Invalid(idx).into());
        }
        if let Some(staging) = self.staging.as_mut() {
            staging.sigs[idx] = Some(sig);
        }
        Ok(())
    }

    fn complete_staging(&self) -> Result<&Transaction> {
        let staging = self.staging()?;
        if !staging.is_complete() {
            return Err(SignatureError::Missing(staging.missing()).into());
        }
        Ok(staging)
    }

    /// Commit the fully signed initial state `InitSigning -> Funding`.
    pub fn enable_init(&mut self) -> Result<()> {
        self.expect_phase("enable_init", &[Phase::InitSigning])?;
        self.complete_staging()?;
        self.current = self.staging.take();
        self.clear_staging();
        self.set_phase(Phase::Funding);
        Ok(())
    }

    /// `Funding -> Acting`. Calling it again once funded changes nothing.
    pub fn set_funded(&mut self) -> Result<()> {
        match self.phase {
            Phase::Funding => {
                self.set_phase(Phase::Acting);
                Ok(())
            }
            Phase::Acting | Phase::Signing | Phase::Final => Ok(()),
            phase => Err(PhaseError {
                op: "set_funded",
                phase,
            }
            .into()),
        }
    }

    /// Validate `state` as successor of the current state proposed by
    /// `actor`, and stage it `Acting -> Signing`.
    pub fn update(&mut self, state: State, actor: PartIdx) -> Result<()> {
        if self.phase == Phase::Signing {
            return Err(Error::ConcurrentUpdate {
                version: self.staging()?.version(),
            });
        }
        self.expect_phase("update", &[Phase::Acting])?;
        self.check_id(&state)?;
        self.check_next_version(&state)?;
        if actor >= self.params.num_parts() {
            return Err(TransitionError::InvalidActor(actor).into());
        }
        let current = &self.current()?.state;
        current.check_successor(&state, &self.params)?;
        self.app.valid_update(&self.params, current, &state, actor)?;

        self.stage(state, actor, Phase::Signing);
        Ok(())
    }

    /// Record participant `idx`'s action for the next action round.
    pub fn add_action(&mut self, idx: PartIdx, action: Vec<u8>) -> Result<()> {
        self.expect_phase("add_action", &[Phase::Acting])?;
        let app = self
            .app
            .as_action_app()
            .ok_or(TransitionError::ActionAppUpdate)?;
        if idx >= self.params.num_parts() {
            return Err(TransitionError::InvalidActor(idx).into());
        }
        if self.actions[idx].is_some() {
            return Err(super::AppError::Action {
                actor: idx,
                reason: "action already submitted this round".into(),
            }
            .into());
        }
        app.valid_action(&self.params, &self.current()?.state, idx, &action)?;
        self.actions[idx] = Some(action);
        Ok(())
    }

    /// Whether every participant submitted an action this round.
    pub fn actions_complete(&self) -> bool {
        self.actions.iter().all(Option::is_some)
    }

    /// Forget the actions of an unfinished round.
    pub fn discard_actions(&mut self) -> Result<()> {
        self.expect_phase("discard_actions", &[Phase::Acting])?;
        self.actions.iter_mut().for_each(|a| *a = None);
        Ok(())
    }

    /// Fold the round's actions into the next state and stage it
    /// `Acting -> Signing`.
    pub fn update_from_actions(&mut self) -> Result<()> {
        self.expect_phase("update_from_actions", &[Phase::Acting])?;
        let app = self
            .app
            .as_action_app()
            .ok_or(TransitionError::ActionAppUpdate)?;
        let actions: Vec<Vec<u8>> = self
            .actions
            .iter()
            .cloned()
            .collect::<Option<_>>()
            .ok_or_else(|| super::AppError::Other("actions missing for this round".into()))?;
        let current = &self.current()?.state;
        let next = app.apply_actions(&self.params, current, &actions)?;
        self.check_id(&next)?;
        self.check_next_version(&next)?;
        current.check_successor(&next, &self.params)?;

        // No single actor: the state is the deterministic result of all
        // actions, every machine computes the same one.
        let idx = self.idx;
        self.stage(next, idx, Phase::Signing);
        Ok(())
    }

    /// Drop the staged update `Signing -> Acting`.
    pub fn discard_update(&mut self) -> Result<()> {
        self.expect_phase("discard_update", &[Phase::Signing])?;
        self.clear_staging();
        self.set_phase(Phase::Acting);
        Ok(())
    }

    /// Commit the fully signed, non-final update `Signing -> Acting`.
    pub fn enable_update(&mut self) -> Result<()> {
        self.expect_phase("enable_update", &[Phase::Signing])?;
        if self.complete_staging()?.state.is_final {
            return Err(TransitionError::StagedStateIsFinal.into());
        }
        self.current = self.staging.take();
        self.clear_staging();
        self.set_phase(Phase::Acting);
        Ok(())
    }

    /// Commit the fully signed, final update `Signing -> Final`.
    pub fn enable_final(&mut self) -> Result<()> {
        self.expect_phase("enable_final", &[Phase::Signing])?;
        if !self.complete_staging()?.state.is_final {
            return Err(TransitionError::StagedStateNotFinal.into());
        }
        self.current = self.staging.take();
        self.clear_staging();
        self.set_phase(Phase::Final);
        Ok(())
    }

    /// Adopt a fully signed transaction a peer enabled while our copy of it
    /// was still being signed (reconciliation after a restart).
    ///
    /// In `InitSigning` only the initial state we staged ourselves is
    /// adopted, moving the machine to `Funding`.
    pub fn adopt_synced(&mut self, tx: Transaction) -> Result<()> {
        self.expect_phase(
            "adopt_synced",
            &[Phase::InitSigning, Phase::Acting, Phase::Signing],
        )?;
        self.check_id(&tx.state)?;
        if self.phase == Phase::InitSigning {
            if self.staging()?.state != tx.state {
                return Err(ProtocolError::UnexpectedMessage(
                    "initial state differs from ours".into(),
                )
                .into());
            }
            self.verify_all(&tx)?;
            self.current = Some(tx);
            self.clear_staging();
            self.set_phase(Phase::Funding);
            return Ok(());
        }
        if tx.version() == self.version() {
            return Ok(());
        }
        self.check_next_version(&tx.state)?;
        self.verify_all(&tx)?;
        self.current()?.state.check_successor(&tx.state, &self.params)?;

        let is_final = tx.state.is_final;
        self.current = Some(tx);
        self.clear_staging();
        self.set_phase(if is_final { Phase::Final } else { Phase::Acting });
        Ok(())
    }

    fn verify_all(&self, tx: &Transaction) -> Result<()> {
        let hash = tx.state.hash()?;
        let sigs = tx
            .full_sigs()
            .ok_or_else(|| SignatureError::Missing(tx.missing()))?;
        for (idx, (sig, signer)) in sigs.iter().zip(self.params.participants()).enumerate() {
            if !self.verifier.verify(*signer, hash, sig) {
                return Err(SignatureError::Invalid(idx).into());
            }
        }
        Ok(())
    }

    /// Start a dispute. Any pending staged update is dropped: only the
    /// current transaction goes on-chain.
    pub fn set_registering(&mut self) -> Result<()> {
        self.expect_phase(
            "set_registering",
            &[Phase::Funding, Phase::Acting, Phase::Signing, Phase::Final],
        )?;
        self.clear_staging();
        self.set_phase(Phase::Registering);
        Ok(())
    }

    /// `Registering -> Registered` once the adjudicator confirmed `version`.
    pub fn set_registered(&mut self, version: u64) -> Result<()> {
        self.expect_phase("set_registered", &[Phase::Registering])?;
        if version != self.version() {
            return Err(ProtocolError::VersionMismatch {
                expected: self.version(),
                got: version,
            }
            .into());
        }
        self.set_phase(Phase::Registered);
        Ok(())
    }

    /// Stage an on-chain progression by ourselves
    /// `Registered | Progressed -> Progressing`.
    pub fn set_progressing(&mut self, state: State) -> Result<()> {
        self.expect_phase("set_progressing", &[Phase::Registered, Phase::Progressed])?;
        self.check_id(&state)?;
        self.check_next_version(&state)?;
        let current = &self.current()?.state;
        current.check_successor(&state, &self.params)?;
        self.app
            .valid_progression(&self.params, current, &state, self.idx)?;

        let idx = self.idx;
        self.stage(state, idx, Phase::Progressing);
        Ok(())
    }

    /// Record a progression confirmed by the adjudicator. From
    /// `Progressing` this is our own staged progression; from `Registered` or
    /// `Progressed` it is somebody else's.
    pub fn set_progressed(
        &mut self,
        state: State,
        actor: PartIdx,
        sig: Option<Signature>,
    ) -> Result<()> {
        self.expect_phase(
            "set_progressed",
            &[Phase::Registered, Phase::Progressing, Phase::Progressed],
        )?;
        self.check_id(&state)?;
        self.check_next_version(&state)?;
        if actor >= self.params.num_parts() {
            return Err(TransitionError::InvalidActor(actor).into());
        }
        if self.phase == Phase::Progressing {
            if self.staging()?.state != state {
                return Err(ProtocolError::UnexpectedMessage(
                    "progression differs from the staged one".into(),
                )
                .into());
            }
        } else {
            let current = &self.current()?.state;
            current.check_successor(&state, &self.params)?;
            self.app
                .valid_progression(&self.params, current, &state, actor)?;
        }

        let mut tx = match self.staging.take() {
            Some(staged) if staged.state == state => staged,
            _ => Transaction::new(state, self.params.num_parts()),
        };
        if tx.sigs[actor].is_none() {
            tx.sigs[actor] = sig;
        }
        self.current = Some(tx);
        self.clear_staging();
        self.set_phase(Phase::Progressed);
        Ok(())
    }

    /// `Registered | Progressed | Final -> Withdrawing`.
    pub fn set_withdrawing(&mut self) -> Result<()> {
        self.expect_phase(
            "set_withdrawing",
            &[Phase::Registered, Phase::Progressed, Phase::Final],
        )?;
        self.set_phase(Phase::Withdrawing);
        Ok(())
    }

    /// `Withdrawing -> Withdrawn`. Calling it again once withdrawn changes
    /// nothing.
    pub fn set_withdrawn(&mut self) -> Result<()> {
        match self.phase {
            Phase::Withdrawing => {
                self.set_phase(Phase::Withdrawn);
                Ok(())
            }
            Phase::Withdrawn => Ok(()),
            phase => Err(PhaseError {
                op: "set_withdrawn",
                phase,
            }
            .into()),
        }
    }
}

fn check_identity(account: &dyn Account, params: &Params, idx: PartIdx) -> Result<()> {
    match params.participants().get(idx) {
        Some(addr) if *addr == account.address() => Ok(()),
        _ => Err(SignatureError::AccountMismatch {
            account: account.address(),
            idx,
        }
        .into()),
    }
}
