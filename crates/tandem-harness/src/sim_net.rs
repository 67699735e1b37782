//! In-memory network for two-tester simulations.
//!
//! [`SimNetwork`] connects testers the way a shared LAN segment does:
//!
//! - Each tester attaches a [`SimLink`] (its sniffing/injecting interface)
//!   and binds a [`SimSocket`] (its sync side channel)
//! - Injected segments are delivered to the link of their destination
//! - Side-channel datagrams are delivered to the destination socket and
//!   also show up on the destination link, where a sniffer would see them
//!
//! Everything crossing the network is recorded for oracles, and datagram
//! loss can be forced to exercise retransmission.

use std::{
    collections::HashMap,
    io,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tandem_core::{Accept, DatagramChannel, PacketTransport};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::seqack::Segment;

/// One side-channel datagram as it crossed the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatagramRecord {
    /// Sender socket
    pub from: SocketAddr,
    /// Destination socket
    pub to: SocketAddr,
    /// Encoded datagram
    pub payload: Bytes,
    /// False if the network dropped it
    pub delivered: bool,
}

#[derive(Default)]
struct Hub {
    wires: HashMap<IpAddr, UnboundedSender<Segment>>,
    sockets: HashMap<SocketAddr, UnboundedSender<(Bytes, SocketAddr)>>,
    datagrams: Vec<DatagramRecord>,
    injected: Vec<Segment>,
    drop_next: HashMap<IpAddr, usize>,
}

/// Shared in-memory network. Clones refer to the same network.
#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Arc<Mutex<Hub>>,
}

impl SimNetwork {
    /// Empty network.
    pub fn new() -> Self {
        Self::default()
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches an interface with address `addr`.
    ///
    /// Segments for `addr` queue on the returned link from now on.
    /// Attaching the same address again replaces the previous link.
    pub fn attach(&self, addr: IpAddr) -> SimLink {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub().wires.insert(addr, tx);
        SimLink { addr, rx, net: self.clone() }
    }

    /// Binds a side-channel socket on `addr`.
    pub fn bind(&self, addr: SocketAddr) -> SimSocket {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub().sockets.insert(addr, tx);
        SimSocket { addr, rx: tokio::sync::Mutex::new(rx), net: self.clone() }
    }

    /// Drops the next `count` side-channel datagrams sent from `from`.
    pub fn drop_next_datagrams(&self, from: IpAddr, count: usize) {
        self.hub().drop_next.insert(from, count);
    }

    /// Every side-channel datagram sent so far, in order.
    pub fn datagrams(&self) -> Vec<DatagramRecord> {
        self.hub().datagrams.clone()
    }

    /// Every segment injected so far, in order. Mirrored datagrams are not
    /// included.
    pub fn injected(&self) -> Vec<Segment> {
        self.hub().injected.clone()
    }

    fn inject(&self, segment: Segment) {
        let mut hub = self.hub();
        hub.injected.push(segment.clone());
        deliver(&hub, segment);
    }

    fn send_datagram(&self, from: SocketAddr, to: SocketAddr, payload: Bytes) {
        let mut hub = self.hub();
        let delivered = match hub.drop_next.get_mut(&from.ip()) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                false
            },
            _ => true,
        };
        hub.datagrams.push(DatagramRecord { from, to, payload: payload.clone(), delivered });

        if !delivered {
            tracing::debug!(from = %from, to = %to, "dropping datagram");
            return;
        }

        if let Some(socket) = hub.sockets.get(&to) {
            let _ = socket.send((payload.clone(), from));
        }
        deliver(&hub, Segment::datagram(from.ip(), to.ip(), payload));
    }
}

fn deliver(hub: &Hub, segment: Segment) {
    match hub.wires.get(&segment.dst) {
        Some(wire) => {
            // A detached receiver is a host that stopped listening
            let _ = wire.send(segment);
        },
        None => tracing::trace!(dst = %segment.dst, "no interface for destination"),
    }
}

/// One tester's interface on a [`SimNetwork`].
pub struct SimLink {
    addr: IpAddr,
    rx: UnboundedReceiver<Segment>,
    net: SimNetwork,
}

impl SimLink {
    /// Interface address.
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    async fn next_segment(&mut self) -> io::Result<Segment> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "network shut down"))
    }
}

#[async_trait]
impl PacketTransport for SimLink {
    type Packet = Segment;

    async fn inject(&mut self, packet: &Segment) -> io::Result<()> {
        tracing::trace!(src = %packet.src, dst = %packet.dst, kind = ?packet.kind, "injecting");
        self.net.inject(packet.clone());
        Ok(())
    }

    async fn exchange(&mut self, packet: &Segment) -> io::Result<Segment> {
        self.inject(packet).await?;
        loop {
            let segment = self.next_segment().await?;
            if segment.answers(packet) {
                return Ok(segment);
            }
            tracing::trace!(segment = ?segment, "not an answer, skipping");
        }
    }

    async fn capture(
        &mut self,
        filter: &Accept<'_, Segment>,
        timeout: Option<Duration>,
    ) -> io::Result<Option<Segment>> {
        let deadline = timeout.map(|bound| tokio::time::Instant::now() + bound);

        loop {
            let segment = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, self.next_segment()).await {
                        Ok(segment) => segment?,
                        Err(_) => return Ok(None),
                    }
                },
                None => self.next_segment().await?,
            };

            if filter(&segment) {
                return Ok(Some(segment));
            }
            tracing::trace!(segment = ?segment, "filtered out");
        }
    }
}

/// One tester's side-channel socket on a [`SimNetwork`].
pub struct SimSocket {
    addr: SocketAddr,
    rx: tokio::sync::Mutex<UnboundedReceiver<(Bytes, SocketAddr)>>,
    net: SimNetwork,
}

impl SimSocket {
    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

#[async_trait]
impl DatagramChannel for SimSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.net.send_datagram(self.addr, target, Bytes::copy_from_slice(buf));
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (payload, from) = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "network shut down"))?;

        // Truncates like a UDP socket with a short buffer
        let len = payload.len().min(buf.len());
        buf[..len].copy_from_slice(&payload[..len]);
        Ok((len, from))
    }
}
