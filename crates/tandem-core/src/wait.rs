//! Packet wait subsystem.
//!
//! A [`Waiter`] captures packets from a [`PacketTransport`] under a custom
//! filter, in one of two modes:
//!
//! - Single: the first accepted packet, or a timeout
//! - Buffered: every accepted packet up to the peer's end-of-burst sync
//!   signal, which is acknowledged and not returned
//!
//! ```text
//! Idle ──wait──→ Waiting ──match / signal──→ Matched
//!                   │
//!                   └──────bound elapsed───→ TimedOut
//! ```
//!
//! Sync signals never satisfy a single-mode filter.

use std::time::Duration;

use crate::{
    behavior::{Accept, Packet},
    env::Environment,
    error::{EngineError, Stage},
    shutdown::Shutdown,
    sync::Synchronizer,
    transport::{DatagramChannel, PacketTransport},
};

/// Phase of a [`Waiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPhase {
    /// No wait started, or the last one was cancelled or failed
    Idle,
    /// Capturing
    Waiting,
    /// A packet or burst was returned
    Matched,
    /// The bound elapsed first
    TimedOut,
}

/// Filtered capture with timeout and cancellation.
pub struct Waiter<'a, T, E> {
    transport: &'a mut T,
    env: &'a E,
    shutdown: &'a Shutdown,
    phase: WaitPhase,
}

impl<'a, T: PacketTransport, E: Environment> Waiter<'a, T, E> {
    /// Waiter capturing from `transport`.
    pub fn new(transport: &'a mut T, env: &'a E, shutdown: &'a Shutdown) -> Self {
        Self { transport, env, shutdown, phase: WaitPhase::Idle }
    }

    /// Current phase.
    pub fn phase(&self) -> WaitPhase {
        self.phase
    }

    /// Returns the first packet accepted by `filter`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Timeout`] carrying `timeout` if it elapses first
    /// - [`EngineError::Cancelled`] on shutdown
    /// - [`EngineError::Unexpected`] if the transport fails
    pub async fn wait_one(
        &mut self,
        filter: &Accept<'_, T::Packet>,
        timeout: Option<Duration>,
    ) -> Result<T::Packet, EngineError> {
        self.phase = WaitPhase::Waiting;
        let started = self.env.now();
        tracing::debug!(timeout = ?timeout, "waiting for packet");

        let accept = |packet: &T::Packet| packet.sync_signal().is_none() && filter(packet);
        match self.capture(&accept, timeout).await {
            Ok(Some(packet)) => {
                self.phase = WaitPhase::Matched;
                tracing::debug!(waited = ?(self.env.now() - started), "matching packet captured");
                Ok(packet)
            },
            Ok(None) => Err(self.timed_out(timeout, 0)),
            Err(e) => {
                self.phase = WaitPhase::Idle;
                Err(e)
            },
        }
    }

    /// Collects packets accepted by `filter` until the peer's sync signal.
    ///
    /// The signal is acknowledged through `sync` and left out of the result.
    /// Acknowledgments and repeats of already delivered announcements seen
    /// on the wire do not end the burst.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Timeout`] if no signal arrives within `timeout`; the
    ///   packets captured so far are discarded
    /// - [`EngineError::MalformedSyncPayload`] if the signal does not decode
    /// - [`EngineError::Cancelled`] on shutdown
    /// - [`EngineError::Unexpected`] if the transport fails
    pub async fn wait_burst<C: DatagramChannel, S: Environment>(
        &mut self,
        filter: &Accept<'_, T::Packet>,
        timeout: Option<Duration>,
        sync: &mut Synchronizer<C, S>,
    ) -> Result<Vec<T::Packet>, EngineError> {
        self.phase = WaitPhase::Waiting;
        let started = self.env.now();
        tracing::debug!(timeout = ?timeout, "buffering packets until sync signal");

        let accept = |packet: &T::Packet| packet.sync_signal().is_some() || filter(packet);
        let mut burst = Vec::new();

        loop {
            let remaining = match timeout {
                Some(bound) => {
                    let waited = self.env.now() - started;
                    if waited >= bound {
                        return Err(self.timed_out(timeout, burst.len()));
                    }
                    Some(bound - waited)
                },
                None => None,
            };

            let packet = match self.capture(&accept, remaining).await {
                Ok(Some(packet)) => packet,
                Ok(None) => return Err(self.timed_out(timeout, burst.len())),
                Err(e) => {
                    self.phase = WaitPhase::Idle;
                    return Err(e);
                },
            };

            let Some(signal) = packet.sync_signal() else {
                burst.push(packet);
                continue;
            };

            match sync.accept_signal(&signal).await {
                Ok(Some(_)) => {
                    self.phase = WaitPhase::Matched;
                    tracing::debug!(
                        packets = burst.len(),
                        source = %signal.source,
                        "burst complete"
                    );
                    return Ok(burst);
                },
                Ok(None) => {
                    tracing::trace!(source = %signal.source, "stale sync datagram on the wire");
                },
                Err(e) => {
                    self.phase = WaitPhase::Idle;
                    return Err(e.into());
                },
            }
        }
    }

    async fn capture(
        &mut self,
        filter: &Accept<'_, T::Packet>,
        timeout: Option<Duration>,
    ) -> Result<Option<T::Packet>, EngineError> {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(EngineError::Cancelled),
            captured = self.transport.capture(filter, timeout) => {
                captured.map_err(|e| EngineError::Unexpected {
                    stage: Stage::Capture,
                    message: e.to_string(),
                })
            },
        }
    }

    fn timed_out(&mut self, timeout: Option<Duration>, discarded: usize) -> EngineError {
        self.phase = WaitPhase::TimedOut;
        let elapsed = timeout.unwrap_or_default();
        if discarded > 0 {
            tracing::warn!(
                discarded,
                timeout = ?elapsed,
                "no end-of-burst signal before timeout, dropping buffered packets"
            );
        } else {
            tracing::debug!(timeout = ?elapsed, "wait timed out");
        }
        EngineError::Timeout { elapsed }
    }
}
