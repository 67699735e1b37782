//! Sequencing engine.
//!
//! The engine drives a test script one step at a time. A step asks a
//! template for a packet, sends it, waits as the template asks, and folds
//! whatever comes back into the shared state:
//!
//! ```text
//! merge override ─→ generate ─→ transmit ─→ on_sent
//!                                   │
//!            ┌──────────────────────┼──────────────────────┐
//!         no wait            reply / filter              buffered
//!            │                      │                      │
//!      (true, None)     classify ─→ validate ─→ receive   per packet:
//!                                   │                    receive + follow-up
//!                          (valid, reply)                     │
//!                                                     [(valid, packet)]
//! ```
//!
//! # Validation
//!
//! Replies are validated against a copy of the state taken before the reply
//! was folded in, and only when [`TesterConfig::check`] is set. A failed
//! validation stops processing of that reply: the remaining components are
//! neither validated nor received.
//!
//! # Failures
//!
//! Template errors and transport failures are logged with the stage they
//! happened in and returned as [`EngineError::Unexpected`]. The engine
//! never exits the process; the caller decides whether to stop.

use std::{fmt, net::IpAddr, time::Duration};

use tandem_proto::SyncMessage;

use crate::{
    behavior::{
        Generated, PacketBehavior, PacketFilter, Protocol, StepOptions, Template, WaitSpec,
    },
    config::TesterConfig,
    env::Environment,
    error::{EngineError, Stage, SyncError},
    shutdown::Shutdown,
    state::{DESTINATION_KEY, STAGE_KEY, State},
    sync::Synchronizer,
    transport::{DatagramChannel, PacketTransport},
    wait::Waiter,
};

/// Per-script context: the state shared by consecutive steps.
#[derive(Debug, Clone, Default)]
pub struct Context {
    state: Option<State>,
}

impl Context {
    /// Context with no state yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context starting from `state`.
    pub fn with_state(state: State) -> Self {
        Self { state: Some(state) }
    }

    /// Current state, if any step has run or one was supplied.
    pub fn state(&self) -> Option<&State> {
        self.state.as_ref()
    }

    /// Takes the state out, leaving the context empty.
    pub fn take_state(&mut self) -> Option<State> {
        self.state.take()
    }

    /// Merges `state_override` into the state, or adopts it as the state if
    /// there is none yet. `initial` is used only when neither exists.
    fn merge(&mut self, state_override: Option<&State>, initial: impl FnOnce() -> State) {
        match (&mut self.state, state_override) {
            (Some(state), Some(state_override)) => {
                state.update(state_override);
            },
            (Some(_), None) => {},
            (None, Some(state_override)) => self.state = Some(state_override.clone()),
            (None, None) => self.state = Some(initial()),
        }
    }

    fn state_mut(&mut self) -> &mut State {
        self.state.get_or_insert_with(State::new)
    }

    fn snapshot(&mut self) -> State {
        self.state_mut().clone()
    }
}

/// One sent packet and/or one received packet.
#[derive(Debug, Clone)]
pub struct Exchange<P> {
    /// Packet that was sent, if any
    pub sent: Option<P>,
    /// Whether the reply passed validation (true if validation is off or
    /// nothing was awaited)
    pub reply_valid: bool,
    /// Packet that was received, if any
    pub reply: Option<P>,
    /// State after the exchange
    pub state: State,
}

/// Result of one step.
#[derive(Debug, Clone)]
pub enum StepOutcome<P> {
    /// Sent and/or received at most one packet
    Single(Exchange<P>),
    /// Buffered wait: one entry per packet of the burst, in capture order
    Buffered(Vec<Exchange<P>>),
}

impl<P> StepOutcome<P> {
    /// All exchanges of this step.
    pub fn exchanges(&self) -> &[Exchange<P>] {
        match self {
            Self::Single(exchange) => std::slice::from_ref(exchange),
            Self::Buffered(exchanges) => exchanges,
        }
    }

    /// The exchange of a non-buffered step.
    pub fn into_single(self) -> Option<Exchange<P>> {
        match self {
            Self::Single(exchange) => Some(exchange),
            Self::Buffered(_) => None,
        }
    }

    /// Returns true if every received packet passed validation.
    pub fn all_valid(&self) -> bool {
        self.exchanges().iter().all(|exchange| exchange.reply_valid)
    }
}

/// Drives templates over a packet transport and coordinates with a peer.
pub struct Engine<Pr, T, C, E> {
    protocol: Pr,
    transport: T,
    sync: Synchronizer<C, E>,
    config: TesterConfig,
    env: E,
    shutdown: Shutdown,
}

impl<Pr, T, C, E> Engine<Pr, T, C, E>
where
    Pr: Protocol,
    T: PacketTransport<Packet = Pr::Packet>,
    C: DatagramChannel,
    E: Environment,
{
    /// Engine with the sync side channel on `channel`.
    pub fn new(protocol: Pr, transport: T, channel: C, config: TesterConfig, env: E) -> Self {
        let sync = Synchronizer::from_config(channel, &config, env.clone());
        Self { protocol, transport, sync, config, env, shutdown: Shutdown::never() }
    }

    /// Honors `shutdown` at every wait.
    #[must_use]
    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.sync.set_shutdown(shutdown.clone());
        self.shutdown = shutdown;
        self
    }

    /// Configuration in effect.
    pub fn config(&self) -> &TesterConfig {
        &self.config
    }

    /// Protocol in use.
    pub fn protocol(&self) -> &Pr {
        &self.protocol
    }

    /// Packet transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Packet transport, mutably.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Runs one template.
    ///
    /// `state_override` is merged into the context state first. With no
    /// context state the override becomes the state, and with neither the
    /// protocol's initial state is used.
    ///
    /// # Errors
    ///
    /// - [`EngineError::InvalidUsage`] if the template asks to wait for a
    ///   reply but generated no packet
    /// - [`EngineError::Timeout`] if a bounded wait elapsed
    /// - [`EngineError::Unexpected`] if the template or transport failed
    /// - [`EngineError::MalformedSyncPayload`], [`EngineError::Cancelled`]
    pub async fn send_one(
        &mut self,
        ctx: &mut Context,
        template: &dyn PacketBehavior<Pr::Packet>,
        state_override: Option<&State>,
        options: &StepOptions<Pr::Packet>,
    ) -> Result<StepOutcome<Pr::Packet>, EngineError> {
        let protocol = &self.protocol;
        ctx.merge(state_override, || protocol.initial_state());
        self.step(ctx, template, options).await
    }

    /// Runs `templates` in order over the same state.
    ///
    /// `state_override` is merged once, before the first step. The first
    /// failing step aborts the sequence.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidUsage`] if `options` asks for buffer mode,
    /// otherwise the error of the failing step.
    pub async fn send_sequence(
        &mut self,
        ctx: &mut Context,
        templates: &[Template<Pr::Packet>],
        state_override: Option<&State>,
        options: &StepOptions<Pr::Packet>,
    ) -> Result<Vec<StepOutcome<Pr::Packet>>, EngineError> {
        if options.buffer_mode {
            return Err(EngineError::InvalidUsage(
                "buffer mode is not supported for sequences".to_string(),
            ));
        }

        let protocol = &self.protocol;
        ctx.merge(state_override, || protocol.initial_state());

        let mut outcomes = Vec::with_capacity(templates.len());
        for template in templates {
            outcomes.push(self.step(ctx, template.as_ref(), options).await?);
        }
        Ok(outcomes)
    }

    /// Captures the first packet accepted by `filter` without interpreting
    /// it.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidUsage`] if the context has no state and none
    /// is supplied, otherwise as [`Waiter::wait_one`].
    pub async fn wait_for_packet(
        &mut self,
        ctx: &mut Context,
        state_override: Option<&State>,
        filter: PacketFilter<Pr::Packet>,
        timeout: Option<Duration>,
    ) -> Result<Pr::Packet, EngineError> {
        Self::require_state(ctx, state_override)?;
        ctx.merge(state_override, State::new);

        Waiter::new(&mut self.transport, &self.env, &self.shutdown)
            .wait_one(filter.as_ref(), timeout)
            .await
    }

    /// Captures a burst up to the peer's sync signal without interpreting
    /// it.
    ///
    /// # Errors
    ///
    /// As [`Engine::wait_for_packet`] and [`Waiter::wait_burst`].
    pub async fn wait_for_burst(
        &mut self,
        ctx: &mut Context,
        state_override: Option<&State>,
        filter: PacketFilter<Pr::Packet>,
        timeout: Option<Duration>,
    ) -> Result<Vec<Pr::Packet>, EngineError> {
        Self::require_state(ctx, state_override)?;
        ctx.merge(state_override, State::new);

        Waiter::new(&mut self.transport, &self.env, &self.shutdown)
            .wait_burst(filter.as_ref(), timeout, &mut self.sync)
            .await
    }

    /// Announces `state` to the peer, or a bare checkpoint if `None`.
    ///
    /// `dst` defaults to the state's `dst` key.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidUsage`] if no destination can be resolved,
    /// otherwise the announce failure.
    pub async fn send_state(
        &mut self,
        state: Option<&State>,
        dst: Option<IpAddr>,
    ) -> Result<(), EngineError> {
        let dst = match dst {
            Some(dst) => dst,
            None => state
                .and_then(|s| s.get_str(DESTINATION_KEY))
                .and_then(|s| s.parse().ok())
                .ok_or(SyncError::MissingDestination)?,
        };

        let message = match state {
            Some(state) => SyncMessage::State(state.clone().into_entries()),
            None => SyncMessage::Unit,
        };

        self.sync.announce(message, dst).await?;
        Ok(())
    }

    /// Awaits the next sync message, optionally from `src` only.
    ///
    /// # Errors
    ///
    /// [`EngineError::MalformedSyncPayload`] if it does not decode,
    /// [`EngineError::Cancelled`] on shutdown.
    pub async fn receive_message(
        &mut self,
        src: Option<IpAddr>,
    ) -> Result<SyncMessage, EngineError> {
        let (message, _source) = self.sync.await_message(src).await?;
        Ok(message)
    }

    /// Awaits the peer's state. `None` means the peer sent a bare
    /// checkpoint.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidUsage`] if the peer sent a test result instead,
    /// otherwise as [`Engine::receive_message`].
    pub async fn receive_state(
        &mut self,
        src: Option<IpAddr>,
    ) -> Result<Option<State>, EngineError> {
        match self.receive_message(src).await? {
            SyncMessage::State(entries) => Ok(Some(State::from(entries))),
            SyncMessage::Unit => Ok(None),
            other => Err(EngineError::InvalidUsage(format!("expected state, got {other:?}"))),
        }
    }

    /// Tells the peer at `dst` that this side reached a checkpoint.
    ///
    /// # Errors
    ///
    /// As [`Synchronizer::announce`].
    pub async fn checkpoint_ready(&mut self, dst: IpAddr) -> Result<(), EngineError> {
        self.sync.announce(SyncMessage::Unit, dst).await?;
        Ok(())
    }

    /// Blocks until the peer at `src` reports a checkpoint.
    ///
    /// # Errors
    ///
    /// As [`Engine::receive_message`].
    pub async fn checkpoint_wait(&mut self, src: IpAddr) -> Result<(), EngineError> {
        self.receive_message(Some(src)).await?;
        Ok(())
    }

    /// Reports a named test result to the peer at `dst`.
    ///
    /// # Errors
    ///
    /// As [`Synchronizer::announce`].
    pub async fn send_test_result(
        &mut self,
        name: &str,
        passed: bool,
        dst: IpAddr,
    ) -> Result<(), EngineError> {
        let verdict = SyncMessage::Verdict { name: name.to_string(), passed };
        self.sync.announce(verdict, dst).await?;
        Ok(())
    }

    /// Awaits a named test result from the peer at `src`.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidUsage`] if the peer sent something else,
    /// otherwise as [`Engine::receive_message`].
    pub async fn get_test_result(&mut self, src: IpAddr) -> Result<(String, bool), EngineError> {
        match self.receive_message(Some(src)).await? {
            SyncMessage::Verdict { name, passed } => Ok((name, passed)),
            other => Err(EngineError::InvalidUsage(format!("expected test result, got {other:?}"))),
        }
    }

    fn require_state(ctx: &Context, state_override: Option<&State>) -> Result<(), EngineError> {
        if ctx.state().is_none() && state_override.is_none() {
            return Err(EngineError::InvalidUsage(
                "no state to wait with: run a step first or pass a state".to_string(),
            ));
        }
        Ok(())
    }

    async fn step(
        &mut self,
        ctx: &mut Context,
        template: &dyn PacketBehavior<Pr::Packet>,
        options: &StepOptions<Pr::Packet>,
    ) -> Result<StepOutcome<Pr::Packet>, EngineError> {
        let name = template.name();
        let Generated { packet, wait } = {
            let state = ctx.state_mut();
            if let Some(stage) = state.get_str(STAGE_KEY) {
                tracing::debug!(stage, template = name, "generating packet");
            }
            template.generate(state, options).map_err(|e| unexpected(Stage::Generate, name, e))?
        };

        if let Some(packet) = &packet {
            tracing::trace!(template = name, packet = ?packet, "packet to send");
        }

        match (wait, packet) {
            (WaitSpec::None, Some(packet)) => {
                self.transmit(ctx, template, &packet).await?;
                tracing::debug!(template = name, "packet sent, not waiting");
                let state = ctx.snapshot();
                Ok(StepOutcome::Single(Exchange {
                    sent: Some(packet),
                    reply_valid: true,
                    reply: None,
                    state,
                }))
            },
            (WaitSpec::None, None) => {
                tracing::debug!(template = name, "nothing to send or wait for");
                let state = ctx.snapshot();
                Ok(StepOutcome::Single(Exchange {
                    sent: None,
                    reply_valid: true,
                    reply: None,
                    state,
                }))
            },
            (WaitSpec::Reply, Some(packet)) => self.exchange(ctx, template, packet).await,
            (WaitSpec::Filter { .. }, Some(packet)) => {
                // Sending and capturing is one transport exchange; a custom
                // filter only applies to waits without a packet
                tracing::debug!(template = name, "packet generated, ignoring custom filter");
                self.exchange(ctx, template, packet).await
            },
            (WaitSpec::Reply, None) => Err(EngineError::InvalidUsage(format!(
                "{name} generated no packet; waiting without sending needs a filter"
            ))),
            (WaitSpec::Filter { filter, timeout, buffer_mode: false }, None) => {
                let reply = Waiter::new(&mut self.transport, &self.env, &self.shutdown)
                    .wait_one(filter.as_ref(), timeout)
                    .await?;
                let reply_valid = self.packet_received(ctx, &reply, false).await?;
                let state = ctx.snapshot();
                Ok(StepOutcome::Single(Exchange {
                    sent: None,
                    reply_valid,
                    reply: Some(reply),
                    state,
                }))
            },
            (WaitSpec::Filter { filter, timeout, buffer_mode: true }, None) => {
                tracing::debug!(template = name, "entering buffer mode");
                let burst = Waiter::new(&mut self.transport, &self.env, &self.shutdown)
                    .wait_burst(filter.as_ref(), timeout, &mut self.sync)
                    .await?;

                let mut exchanges = Vec::with_capacity(burst.len());
                for packet in burst {
                    let reply_valid = self.packet_received(ctx, &packet, true).await?;
                    let state = ctx.snapshot();
                    exchanges.push(Exchange {
                        sent: None,
                        reply_valid,
                        reply: Some(packet),
                        state,
                    });
                }
                Ok(StepOutcome::Buffered(exchanges))
            },
        }
    }

    async fn transmit(
        &mut self,
        ctx: &mut Context,
        template: &dyn PacketBehavior<Pr::Packet>,
        packet: &Pr::Packet,
    ) -> Result<(), EngineError> {
        let name = template.name();
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return Err(EngineError::Cancelled),
            sent = self.transport.inject(packet) => {
                sent.map_err(|e| unexpected(Stage::Transmit, name, e))?;
            },
        }
        template.on_sent(ctx.state_mut(), packet).map_err(|e| unexpected(Stage::Transmit, name, e))
    }

    async fn exchange(
        &mut self,
        ctx: &mut Context,
        template: &dyn PacketBehavior<Pr::Packet>,
        packet: Pr::Packet,
    ) -> Result<StepOutcome<Pr::Packet>, EngineError> {
        let name = template.name();
        let reply = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => return Err(EngineError::Cancelled),
            reply = self.transport.exchange(&packet) => {
                reply.map_err(|e| unexpected(Stage::Transmit, name, e))?
            },
        };
        template
            .on_sent(ctx.state_mut(), &packet)
            .map_err(|e| unexpected(Stage::Transmit, name, e))?;

        let reply_valid = self.packet_received(ctx, &reply, false).await?;
        let state = ctx.snapshot();
        Ok(StepOutcome::Single(Exchange {
            sent: Some(packet),
            reply_valid,
            reply: Some(reply),
            state,
        }))
    }

    /// Classifies, validates and receives one packet.
    ///
    /// Returns whether every component passed validation. In buffer mode,
    /// follow-up templates are sent as they come up.
    async fn packet_received(
        &mut self,
        ctx: &mut Context,
        packet: &Pr::Packet,
        buffer_mode: bool,
    ) -> Result<bool, EngineError> {
        let prior = ctx.snapshot();

        if self.config.print_received_packets {
            tracing::info!(packet = ?packet, "received packet");
        } else if self.config.traces_packets() {
            tracing::debug!(packet = ?packet, "received packet");
        }

        ctx.state_mut().log_packet(packet);

        let components = self.protocol.classify(packet);
        if components.is_empty() {
            tracing::debug!(packet = ?packet, "received packet not recognised");
            return Ok(false);
        }

        for component in components {
            let name = component.name();
            if self.config.check {
                let valid = component
                    .validate(&prior, packet)
                    .map_err(|e| unexpected(Stage::Validate, name, e))?;
                if !valid {
                    tracing::warn!(
                        template = name,
                        packet = ?packet,
                        "received packet failed validation"
                    );
                    return Ok(false);
                }
            }

            let follow_up = component
                .receive(ctx.state_mut(), packet)
                .map_err(|e| unexpected(Stage::Receive, name, e))?;

            if let Some(next) = follow_up {
                if buffer_mode {
                    tracing::trace!(template = next.name(), "sending follow-up");
                    Box::pin(self.step(ctx, next.as_ref(), &StepOptions::default())).await?;
                } else {
                    tracing::debug!(template = next.name(), "follow-up dropped, not buffering");
                }
            }
        }

        Ok(true)
    }
}

fn unexpected(stage: Stage, template: &str, err: impl fmt::Display) -> EngineError {
    tracing::error!(stage = %stage, template, error = %err, "unexpected failure");
    EngineError::Unexpected { stage, message: err.to_string() }
}
