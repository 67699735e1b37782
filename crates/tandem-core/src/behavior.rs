//! Packet behavior capability.
//!
//! A protocol plugs into the engine through three traits:
//!
//! - [`Packet`]: a wire packet the transport can carry and the state can
//!   store
//! - [`PacketBehavior`]: a template that knows how to build one kind of
//!   packet from the state, how to check a reply against the state it was
//!   sent from, and how to fold a reply back into the state
//! - [`Protocol`]: maps a received packet to the templates that interpret it
//!
//! The engine never looks inside packets. Everything protocol-specific lives
//! behind these traits.
//!
//! # Step lifecycle
//!
//! ```text
//! generate(&state) ─→ transmit ─→ on_sent(&mut state)
//!                                      │
//!                 reply ←──────────────┘
//!                   │
//!   classify ─→ [validate(&prior) ─→ receive(&mut state)]*
//! ```

use std::{fmt, net::IpAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use tandem_proto::ProtocolError;

use crate::{error::BehaviorError, state::State};

/// A packet that can travel through a [`PacketTransport`] and be stored in a
/// [`State`].
///
/// [`PacketTransport`]: crate::transport::PacketTransport
pub trait Packet: Clone + fmt::Debug + Send + Sync + 'static {
    /// Raw wire bytes.
    fn to_bytes(&self) -> Bytes;

    /// Parses raw wire bytes.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::MalformedPacket`] if `bytes` is not a valid packet.
    fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError>;

    /// Returns the sync announcement this packet carries, if it is one.
    ///
    /// A tester sniffing the wire also sees its peer's side-channel
    /// datagrams. In buffer mode one of those ends the burst. Protocols that
    /// never run buffered waits can keep the default.
    fn sync_signal(&self) -> Option<SyncSignal> {
        None
    }
}

/// A side-channel datagram seen on the packet wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSignal {
    /// Address of the announcing peer
    pub source: IpAddr,
    /// Encoded sync datagram
    pub payload: Bytes,
}

/// Borrowed predicate over captured packets.
///
/// Transports and waiters take filters as `&Accept<P>`. The alias keeps the
/// predicate generic over the packet borrow inside `#[async_trait]` methods.
pub type Accept<'a, P> = dyn Fn(&P) -> bool + Send + Sync + 'a;

/// Predicate selecting which captured packets a wait accepts.
pub type PacketFilter<P> = Arc<Accept<'static, P>>;

/// Shared handle to a template.
pub type Template<P> = Arc<dyn PacketBehavior<P>>;

/// Filter accepting every packet that is not a sync signal.
pub fn any_packet<P: Packet>() -> PacketFilter<P> {
    Arc::new(|packet: &P| packet.sync_signal().is_none())
}

/// What to do after a generated packet (if any) has been sent.
pub enum WaitSpec<P> {
    /// Send and return at once
    None,
    /// Send and take the first reply the transport pairs with it
    Reply,
    /// Capture with a custom filter
    Filter {
        /// Packets to accept
        filter: PacketFilter<P>,
        /// Bound on the wait, `None` waits forever
        timeout: Option<Duration>,
        /// Collect a burst until the peer's sync signal instead of one packet
        buffer_mode: bool,
    },
}

impl<P> WaitSpec<P> {
    /// Single-packet capture with `filter`.
    pub fn filter(filter: impl Fn(&P) -> bool + Send + Sync + 'static) -> Self {
        Self::Filter { filter: Arc::new(filter), timeout: None, buffer_mode: false }
    }

    /// Sets the timeout of a `Filter` wait. Other waits are unchanged.
    #[must_use]
    pub fn with_timeout(mut self, bound: Duration) -> Self {
        if let Self::Filter { timeout, .. } = &mut self {
            *timeout = Some(bound);
        }
        self
    }

    /// Turns a `Filter` wait into a buffered one. Other waits are unchanged.
    #[must_use]
    pub fn buffered(mut self) -> Self {
        if let Self::Filter { buffer_mode, .. } = &mut self {
            *buffer_mode = true;
        }
        self
    }

    /// Returns true if this waits for anything at all.
    pub fn waits(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl<P> Clone for WaitSpec<P> {
    fn clone(&self) -> Self {
        match self {
            Self::None => Self::None,
            Self::Reply => Self::Reply,
            Self::Filter { filter, timeout, buffer_mode } => Self::Filter {
                filter: Arc::clone(filter),
                timeout: *timeout,
                buffer_mode: *buffer_mode,
            },
        }
    }
}

impl<P> fmt::Debug for WaitSpec<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Reply => f.write_str("Reply"),
            Self::Filter { timeout, buffer_mode, .. } => f
                .debug_struct("Filter")
                .field("timeout", timeout)
                .field("buffer_mode", buffer_mode)
                .finish_non_exhaustive(),
        }
    }
}

/// Result of [`PacketBehavior::generate`].
#[derive(Debug, Clone)]
pub struct Generated<P> {
    /// Packet to send, `None` to only wait
    pub packet: Option<P>,
    /// What to wait for afterwards
    pub wait: WaitSpec<P>,
}

impl<P> Generated<P> {
    /// Send `packet` without waiting.
    pub fn send(packet: P) -> Self {
        Self { packet: Some(packet), wait: WaitSpec::None }
    }

    /// Send `packet` and wait for its reply.
    pub fn exchange(packet: P) -> Self {
        Self { packet: Some(packet), wait: WaitSpec::Reply }
    }

    /// Send nothing, only wait.
    pub fn wait(wait: WaitSpec<P>) -> Self {
        Self { packet: None, wait }
    }
}

/// Per-step options handed to [`PacketBehavior::generate`].
pub struct StepOptions<P> {
    /// Collect a burst until the peer's sync signal
    pub buffer_mode: bool,
    /// Bound on the wait
    pub timeout: Option<Duration>,
    /// Custom capture filter
    pub filter: Option<PacketFilter<P>>,
    /// Free-form template arguments, e.g. a subflow index
    pub params: State,
}

impl<P> StepOptions<P> {
    /// No buffering, no timeout, no filter, no params.
    pub fn new() -> Self {
        Self { buffer_mode: false, timeout: None, filter: None, params: State::new() }
    }

    /// Enables buffer mode.
    #[must_use]
    pub fn buffered(mut self) -> Self {
        self.buffer_mode = true;
        self
    }

    /// Bounds the wait.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the capture filter.
    #[must_use]
    pub fn with_filter(mut self, filter: impl Fn(&P) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Adds a template argument.
    #[must_use]
    pub fn with_param(
        mut self,
        key: impl Into<String>,
        value: impl Into<tandem_proto::Value>,
    ) -> Self {
        self.params.set(key, value);
        self
    }
}

impl<P> Default for StepOptions<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> Clone for StepOptions<P> {
    fn clone(&self) -> Self {
        Self {
            buffer_mode: self.buffer_mode,
            timeout: self.timeout,
            filter: self.filter.clone(),
            params: self.params.clone(),
        }
    }
}

impl<P> fmt::Debug for StepOptions<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepOptions")
            .field("buffer_mode", &self.buffer_mode)
            .field("timeout", &self.timeout)
            .field("filter", &self.filter.is_some())
            .field("params", &self.params)
            .finish()
    }
}

/// A packet template.
///
/// One implementation per packet kind. The same type both builds outgoing
/// packets of that kind and interprets incoming ones.
pub trait PacketBehavior<P: Packet>: Send + Sync {
    /// Name used in log output.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Builds the packet to send from the current state.
    ///
    /// # Errors
    ///
    /// Any [`BehaviorError`], e.g. when a required key is missing. The
    /// engine reports it as an unexpected failure in the generate stage.
    fn generate(
        &self,
        state: &State,
        options: &StepOptions<P>,
    ) -> Result<Generated<P>, BehaviorError>;

    /// Records what was sent, after transmission succeeded.
    ///
    /// # Errors
    ///
    /// Reported as an unexpected failure in the transmit stage.
    fn on_sent(&self, _state: &mut State, _packet: &P) -> Result<(), BehaviorError> {
        Ok(())
    }

    /// Folds a received packet into the state.
    ///
    /// Returns a follow-up template to send in reaction (e.g. an
    /// acknowledgment). The engine only sends follow-ups in buffer mode.
    ///
    /// # Errors
    ///
    /// Reported as an unexpected failure in the receive stage.
    fn receive(
        &self,
        state: &mut State,
        packet: &P,
    ) -> Result<Option<Template<P>>, BehaviorError>;

    /// Checks a received packet against the state as it was before the
    /// packet arrived.
    ///
    /// # Errors
    ///
    /// Reported as an unexpected failure in the validate stage. A packet
    /// that is merely wrong should yield `Ok(false)`.
    fn validate(&self, _prior: &State, _packet: &P) -> Result<bool, BehaviorError> {
        Ok(true)
    }
}

/// Maps received packets to the templates that interpret them.
pub trait Protocol: Send + Sync {
    /// Packet type of this protocol.
    type Packet: Packet;

    /// Ordered templates for every recognised component of `packet`.
    ///
    /// An empty list means the packet is not recognised.
    fn classify(&self, packet: &Self::Packet) -> Vec<Template<Self::Packet>>;

    /// State used when a step runs without any state yet.
    fn initial_state(&self) -> State {
        State::new()
    }
}

/// Template that sends nothing and only waits.
///
/// The wait takes its filter, timeout and buffer mode from the step
/// options. Without a filter it accepts any packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct Wait;

impl<P: Packet> PacketBehavior<P> for Wait {
    fn name(&self) -> &str {
        "wait"
    }

    fn generate(
        &self,
        _state: &State,
        options: &StepOptions<P>,
    ) -> Result<Generated<P>, BehaviorError> {
        let filter = options.filter.clone().unwrap_or_else(any_packet);
        Ok(Generated::wait(WaitSpec::Filter {
            filter,
            timeout: options.timeout,
            buffer_mode: options.buffer_mode,
        }))
    }

    fn receive(
        &self,
        _state: &mut State,
        _packet: &P,
    ) -> Result<Option<Template<P>>, BehaviorError> {
        Ok(None)
    }
}
