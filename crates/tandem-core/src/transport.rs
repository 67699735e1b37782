//! Transport abstractions.
//!
//! Two channels connect a tester to the world:
//!
//! - [`PacketTransport`]: the wire under test. Raw packets are injected and
//!   captured ("sniffed") with filters, the way a raw-socket tool works.
//! - [`DatagramChannel`]: the out-of-band UDP side channel two testers use to
//!   exchange state and checkpoints.
//!
//! # Implementations
//!
//! - `tokio::net::UdpSocket` implements [`DatagramChannel`] for real hosts
//! - `tandem-harness` provides in-memory and turmoil-backed implementations
//!   of both for deterministic tests

use std::{
    io,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use async_trait::async_trait;

use crate::behavior::{Accept, Packet};

/// Raw packet wire with sniffing semantics.
#[async_trait]
pub trait PacketTransport: Send {
    /// Packet type carried on this wire.
    type Packet: Packet;

    /// Sends `packet` without waiting for anything.
    async fn inject(&mut self, packet: &Self::Packet) -> io::Result<()>;

    /// Sends `packet` and returns the first packet that answers it.
    ///
    /// What "answers" means is up to the transport (usually swapped
    /// addresses). Blocks until such a packet arrives.
    async fn exchange(&mut self, packet: &Self::Packet) -> io::Result<Self::Packet>;

    /// Returns the first captured packet accepted by `filter`.
    ///
    /// `Ok(None)` means `timeout` elapsed. With no timeout this only returns
    /// on a match or an error. A closed wire is an error, never `Ok(None)`.
    async fn capture(
        &mut self,
        filter: &Accept<'_, Self::Packet>,
        timeout: Option<Duration>,
    ) -> io::Result<Option<Self::Packet>>;
}

/// Unreliable datagram socket for the sync side channel.
#[async_trait]
pub trait DatagramChannel: Send + Sync {
    /// Sends one datagram to `target`.
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Receives one datagram, returning its length and sender.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
}

#[async_trait]
impl DatagramChannel for tokio::net::UdpSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        tokio::net::UdpSocket::send_to(self, buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::net::UdpSocket::recv_from(self, buf).await
    }
}

/// Binds the sync side-channel socket on `addr`:`port`.
///
/// Pass an unspecified address to listen on every local address.
///
/// # Errors
///
/// Any bind failure, e.g. the port is taken.
pub async fn bind_sync_socket(addr: IpAddr, port: u16) -> io::Result<tokio::net::UdpSocket> {
    let socket = tokio::net::UdpSocket::bind(SocketAddr::new(addr, port)).await?;
    tracing::debug!(local = ?socket.local_addr(), "sync socket bound");
    Ok(socket)
}
