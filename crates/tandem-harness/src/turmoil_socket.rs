//! Turmoil-backed sync side channel.

use std::{
    io,
    net::{Ipv4Addr, SocketAddr},
};

use async_trait::async_trait;
use tandem_core::DatagramChannel;

/// [`DatagramChannel`] over Turmoil's simulated UDP.
///
/// Loss, latency and partitions configured on the simulation apply, which
/// makes this the channel for sync liveness tests.
pub struct TurmoilSocket(turmoil::net::UdpSocket);

impl TurmoilSocket {
    /// Binds `port` on every address of the current host.
    ///
    /// # Errors
    ///
    /// Returns error if the port is already bound on this host.
    pub async fn bind(port: u16) -> io::Result<Self> {
        let socket = turmoil::net::UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
            .await?;
        Ok(Self(socket))
    }
}

#[async_trait]
impl DatagramChannel for TurmoilSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.0.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.0.recv_from(buf).await
    }
}
