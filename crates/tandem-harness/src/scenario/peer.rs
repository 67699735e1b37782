//! One tester inside a scenario.

use std::{net::IpAddr, time::Duration};

use tandem_core::{
    Context, Engine, EngineError, Environment, PacketBehavior, PacketFilter, State, StepOptions,
    StepOutcome, Template,
};

use crate::{
    scenario::world::PeerReport,
    seqack::{SeqAck, Segment},
    sim_env::SimEnv,
    sim_net::{SimLink, SimSocket},
};

/// Engine wired to the simulated network.
pub type SimEngine = Engine<SeqAck, SimLink, SimSocket, SimEnv>;

/// A tester driving one end of the connection.
///
/// Wraps an engine and its script context. Every step outcome is recorded
/// for the oracle.
pub struct Peer {
    engine: SimEngine,
    ctx: Context,
    env: SimEnv,
    local: IpAddr,
    remote: IpAddr,
    outcomes: Vec<StepOutcome<Segment>>,
}

impl Peer {
    pub(crate) fn new(
        engine: SimEngine,
        state: State,
        env: SimEnv,
        local: IpAddr,
        remote: IpAddr,
    ) -> Self {
        Self { engine, ctx: Context::with_state(state), env, local, remote, outcomes: Vec::new() }
    }

    /// This tester's address.
    pub fn local(&self) -> IpAddr {
        self.local
    }

    /// The other tester's address.
    pub fn remote(&self) -> IpAddr {
        self.remote
    }

    /// Current script state.
    pub fn state(&self) -> Option<&State> {
        self.ctx.state()
    }

    /// Virtual time.
    pub fn now(&self) -> std::time::Instant {
        self.env.now()
    }

    /// Outcomes of every step so far.
    pub fn outcomes(&self) -> &[StepOutcome<Segment>] {
        &self.outcomes
    }

    /// The underlying engine, for operations the helpers do not cover.
    pub fn engine(&mut self) -> &mut SimEngine {
        &mut self.engine
    }

    /// Runs one template.
    pub async fn send(
        &mut self,
        template: impl PacketBehavior<Segment>,
        options: StepOptions<Segment>,
    ) -> Result<StepOutcome<Segment>, EngineError> {
        self.send_with(template, None, options).await
    }

    /// Runs one template after merging `state_override`.
    pub async fn send_with(
        &mut self,
        template: impl PacketBehavior<Segment>,
        state_override: Option<&State>,
        options: StepOptions<Segment>,
    ) -> Result<StepOutcome<Segment>, EngineError> {
        let outcome =
            self.engine.send_one(&mut self.ctx, &template, state_override, &options).await?;
        self.outcomes.push(outcome.clone());
        Ok(outcome)
    }

    /// Runs `templates` in order.
    pub async fn sequence(
        &mut self,
        templates: &[Template<Segment>],
    ) -> Result<Vec<StepOutcome<Segment>>, EngineError> {
        let outcomes = self
            .engine
            .send_sequence(&mut self.ctx, templates, None, &StepOptions::default())
            .await?;
        self.outcomes.extend(outcomes.iter().cloned());
        Ok(outcomes)
    }

    /// Captures the first segment accepted by `filter`, uninterpreted.
    pub async fn wait_for(
        &mut self,
        filter: PacketFilter<Segment>,
        timeout: Option<Duration>,
    ) -> Result<Segment, EngineError> {
        self.engine.wait_for_packet(&mut self.ctx, None, filter, timeout).await
    }

    /// Captures segments accepted by `filter` until the other tester's
    /// checkpoint, uninterpreted.
    pub async fn wait_for_burst(
        &mut self,
        filter: PacketFilter<Segment>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Segment>, EngineError> {
        self.engine.wait_for_burst(&mut self.ctx, None, filter, timeout).await
    }

    /// Tells the other tester this side reached a checkpoint.
    pub async fn checkpoint(&mut self) -> Result<(), EngineError> {
        self.engine.checkpoint_ready(self.remote).await
    }

    /// Blocks until the other tester reaches a checkpoint.
    pub async fn await_checkpoint(&mut self) -> Result<(), EngineError> {
        self.engine.checkpoint_wait(self.remote).await
    }

    /// Sends the current script state to the other tester.
    pub async fn share_state(&mut self) -> Result<(), EngineError> {
        let state = self.ctx.state().cloned().unwrap_or_default();
        self.engine.send_state(Some(&state), Some(self.remote)).await
    }

    /// Awaits the other tester's state.
    pub async fn receive_state(&mut self) -> Result<Option<State>, EngineError> {
        self.engine.receive_state(Some(self.remote)).await
    }

    pub(crate) fn into_report(mut self, error: Option<EngineError>) -> PeerReport {
        PeerReport {
            addr: self.local,
            outcomes: self.outcomes,
            state: self.ctx.take_state().unwrap_or_default(),
            error,
        }
    }
}
