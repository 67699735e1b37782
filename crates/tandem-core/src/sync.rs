//! Cross-host synchronization.
//!
//! Two testers driving the two ends of a connection coordinate over a UDP
//! side channel. Reliability is emulated on top of the unreliable channel:
//!
//! - [`Synchronizer::announce`] sends a datagram and retransmits it every
//!   retry interval until the destination acknowledges that exact datagram
//! - [`Synchronizer::await_message`] blocks for the next datagram (optionally
//!   from one source only) and acknowledges it
//!
//! # Duplicates
//!
//! A retransmission that crosses the acknowledgment arrives twice, possibly
//! after later announcements. Each datagram carries a sequence number, and
//! the receiver remembers the most recent ones it delivered per peer: a
//! repeat is acknowledged again and then dropped, so the sender stops
//! retransmitting and the script does not see the message twice.

use std::{
    collections::{HashMap, VecDeque},
    net::{IpAddr, SocketAddr},
};

use tandem_proto::{Datagram, MAX_DATAGRAM_SIZE, SyncMessage};

use crate::{
    behavior::SyncSignal,
    config::{RetryPolicy, TesterConfig},
    env::Environment,
    error::SyncError,
    shutdown::Shutdown,
    transport::DatagramChannel,
};

/// Delivered sequence numbers remembered per peer.
const DEDUP_WINDOW: usize = 32;

/// Reliable messaging over an unreliable [`DatagramChannel`].
pub struct Synchronizer<C, E> {
    channel: C,
    port: u16,
    policy: RetryPolicy,
    env: E,
    shutdown: Shutdown,
    next_seq: u64,
    delivered: HashMap<IpAddr, VecDeque<u64>>,
}

impl<C: DatagramChannel, E: Environment> Synchronizer<C, E> {
    /// Synchronizer talking to peers on `port`, with the default policy.
    pub fn new(channel: C, port: u16, env: E) -> Self {
        let next_seq = env.random_u64();
        Self {
            channel,
            port,
            policy: RetryPolicy::default(),
            env,
            shutdown: Shutdown::never(),
            next_seq,
            delivered: HashMap::new(),
        }
    }

    /// Synchronizer using the port and retry policy of `config`.
    pub fn from_config(channel: C, config: &TesterConfig, env: E) -> Self {
        Self::new(channel, config.sync_port, env).with_policy(config.retry_policy())
    }

    /// Replaces the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replaces the shutdown handle.
    pub fn set_shutdown(&mut self, shutdown: Shutdown) {
        self.shutdown = shutdown;
    }

    /// Port peers listen on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Announces `message` to `dst` and blocks until it is acknowledged.
    ///
    /// Returns the number of transmissions it took.
    ///
    /// # Errors
    ///
    /// - [`SyncError::RetriesExhausted`] once the policy's attempt limit is
    ///   reached without an acknowledgment
    /// - [`SyncError::Cancelled`] on shutdown
    /// - [`SyncError::Io`] on socket failure
    /// - [`SyncError::Malformed`] if `message` does not fit a datagram
    pub async fn announce(&mut self, message: SyncMessage, dst: IpAddr) -> Result<u32, SyncError> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let bytes = Datagram::new(seq, message).encode()?;
        let target = SocketAddr::new(dst, self.port);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut transmissions = 0u32;

        loop {
            if let Some(max) = self.policy.max_attempts {
                if transmissions >= max {
                    tracing::warn!(dst = %dst, seq, transmissions, "announcement unacknowledged");
                    return Err(SyncError::RetriesExhausted { attempts: transmissions });
                }
            }

            self.channel.send_to(&bytes, target).await?;
            transmissions += 1;
            tracing::trace!(dst = %dst, seq, transmissions, "sync datagram sent");

            let retransmit = self.env.sleep(self.policy.interval);
            tokio::pin!(retransmit);

            loop {
                let (len, from) = tokio::select! {
                    biased;
                    () = self.shutdown.cancelled() => return Err(SyncError::Cancelled),
                    () = &mut retransmit => break,
                    received = self.channel.recv_from(&mut buf) => received?,
                };

                match Datagram::decode(&buf[..len]) {
                    Ok(datagram) if from.ip() == dst && datagram.acknowledges(seq) => {
                        tracing::debug!(dst = %dst, seq, transmissions, "announce acked");
                        return Ok(transmissions);
                    },
                    // Peer retransmits until it hears from us, nothing is lost
                    Ok(datagram) => {
                        tracing::trace!(from = %from, seq = datagram.seq, "ignoring datagram");
                    },
                    Err(e) => {
                        tracing::debug!(from = %from, error = %e, "ignoring malformed datagram");
                    },
                }
            }
        }
    }

    /// Blocks until a message arrives, acknowledges it, and returns it with
    /// its source.
    ///
    /// With `expected` set, datagrams from other sources are dropped.
    /// Stray acknowledgments and repeats of recently delivered messages are
    /// skipped.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Malformed`] if a datagram from an accepted source does
    ///   not decode
    /// - [`SyncError::Cancelled`] on shutdown
    /// - [`SyncError::Io`] on socket failure
    pub async fn await_message(
        &mut self,
        expected: Option<IpAddr>,
    ) -> Result<(SyncMessage, IpAddr), SyncError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let (len, from) = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return Err(SyncError::Cancelled),
                received = self.channel.recv_from(&mut buf) => received?,
            };

            let source = from.ip();
            if expected.is_some_and(|ip| ip != source) {
                tracing::debug!(source = %source, "dropping datagram from unexpected source");
                continue;
            }

            let datagram = match Datagram::decode(&buf[..len]) {
                Ok(datagram) => datagram,
                Err(e) => {
                    tracing::warn!(source = %source, error = %e, "malformed sync datagram");
                    return Err(SyncError::Malformed(e));
                },
            };

            if let Some(message) = self.deliver(source, datagram).await? {
                return Ok((message, source));
            }
        }
    }

    /// Handles an announcement seen on the packet wire instead of the
    /// socket.
    ///
    /// Acknowledges it like [`Synchronizer::await_message`] would and returns
    /// the message, or `None` for acknowledgments and repeats.
    ///
    /// # Errors
    ///
    /// [`SyncError::Malformed`] if the payload does not decode,
    /// [`SyncError::Io`] if the acknowledgment cannot be sent.
    pub async fn accept_signal(
        &mut self,
        signal: &SyncSignal,
    ) -> Result<Option<SyncMessage>, SyncError> {
        let datagram = Datagram::decode(&signal.payload)?;
        self.deliver(signal.source, datagram).await
    }

    /// Sends an acknowledgment for datagram `seq` to `dst`.
    ///
    /// # Errors
    ///
    /// [`SyncError::Io`] on socket failure.
    pub async fn ack(&self, dst: IpAddr, seq: u64) -> Result<(), SyncError> {
        let bytes = Datagram::ack(seq).encode()?;
        self.channel.send_to(&bytes, SocketAddr::new(dst, self.port)).await?;
        tracing::trace!(dst = %dst, seq, "ack sent");
        Ok(())
    }

    async fn deliver(
        &mut self,
        source: IpAddr,
        datagram: Datagram,
    ) -> Result<Option<SyncMessage>, SyncError> {
        if datagram.message.is_ack() {
            tracing::trace!(source = %source, seq = datagram.seq, "ignoring stray ack");
            return Ok(None);
        }

        self.ack(source, datagram.seq).await?;

        let seen = self.delivered.entry(source).or_default();
        if seen.contains(&datagram.seq) {
            tracing::debug!(source = %source, seq = datagram.seq, "repeat re-acknowledged");
            return Ok(None);
        }

        if seen.len() == DEDUP_WINDOW {
            seen.pop_front();
        }
        seen.push_back(datagram.seq);
        tracing::debug!(source = %source, seq = datagram.seq, "sync message received");
        Ok(Some(datagram.message))
    }
}
