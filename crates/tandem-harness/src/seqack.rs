//! Sequence/acknowledgment reference protocol.
//!
//! A deliberately small byte-stream protocol with just enough structure to
//! drive every engine path: data segments carry a sequence number and a
//! payload, acknowledgments carry the next expected sequence number. Side
//! channel datagrams travel on the same simulated wire as
//! [`SegmentKind::Datagram`] so buffered waits can see them.
//!
//! # State keys
//!
//! | key       | meaning                                           |
//! |-----------|---------------------------------------------------|
//! | `src`     | local address                                     |
//! | `dst`     | peer address                                      |
//! | `seq`     | oldest unacknowledged sequence number             |
//! | `snd_nxt` | sequence number after the last byte sent          |
//! | `rcv_nxt` | next sequence number expected from the peer       |
//!
//! # Wire layout
//!
//! ```text
//! kind:u8 | src:[u8;16] | dst:[u8;16] | seq:u64 | ack:u64 | payload
//! ```
//!
//! Addresses are stored IPv6-mapped.

use std::{
    net::{IpAddr, Ipv6Addr},
    sync::Arc,
};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tandem_core::{
    BehaviorError, Generated, Packet, PacketBehavior, Protocol, State, StepOptions, SyncSignal,
    Template,
};
use tandem_proto::ProtocolError;

/// Local address key.
pub const SRC: &str = "src";
/// Peer address key.
pub const DST: &str = "dst";
/// Oldest unacknowledged sequence number key.
pub const SEQ: &str = "seq";
/// Next sequence number to send key.
pub const SND_NXT: &str = "snd_nxt";
/// Next expected peer sequence number key.
pub const RCV_NXT: &str = "rcv_nxt";

const HEADER_SIZE: usize = 1 + 16 + 16 + 8 + 8;

/// Kind of a [`Segment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentKind {
    /// Payload-carrying segment
    Data = 1,
    /// Cumulative acknowledgment
    Ack = 2,
    /// Sync side-channel datagram seen on the wire
    Datagram = 3,
}

impl SegmentKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Data),
            2 => Some(Self::Ack),
            3 => Some(Self::Datagram),
            _ => None,
        }
    }
}

/// One packet on the simulated wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Kind
    pub kind: SegmentKind,
    /// Sender
    pub src: IpAddr,
    /// Receiver
    pub dst: IpAddr,
    /// Sequence number of the first payload byte
    pub seq: u64,
    /// Next sequence number expected by the sender
    pub ack: u64,
    /// Payload, or the encoded sync datagram
    pub payload: Bytes,
}

impl Segment {
    /// Data segment.
    pub fn data(src: IpAddr, dst: IpAddr, seq: u64, ack: u64, payload: Bytes) -> Self {
        Self { kind: SegmentKind::Data, src, dst, seq, ack, payload }
    }

    /// Acknowledgment.
    pub fn ack(src: IpAddr, dst: IpAddr, seq: u64, ack: u64) -> Self {
        Self { kind: SegmentKind::Ack, src, dst, seq, ack, payload: Bytes::new() }
    }

    /// Side-channel datagram as seen on the wire.
    pub fn datagram(src: IpAddr, dst: IpAddr, payload: Bytes) -> Self {
        Self { kind: SegmentKind::Datagram, src, dst, seq: 0, ack: 0, payload }
    }

    /// Payload length in sequence space.
    pub fn len(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Sequence number following this segment's payload.
    ///
    /// Sequence space wraps at `u64::MAX`.
    pub fn end_seq(&self) -> u64 {
        self.seq.wrapping_add(self.len())
    }

    /// Returns true if the segment carries no payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Returns true if this is a protocol reply to `sent`.
    pub fn answers(&self, sent: &Segment) -> bool {
        self.kind != SegmentKind::Datagram && self.src == sent.dst && self.dst == sent.src
    }
}

impl Packet for Segment {
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u8(self.kind as u8);
        buf.put_slice(&mapped(self.src).octets());
        buf.put_slice(&mapped(self.dst).octets());
        buf.put_u64(self.seq);
        buf.put_u64(self.ack);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ProtocolError::MalformedPacket(format!(
                "segment too short: {} bytes, header is {HEADER_SIZE}",
                bytes.len()
            )));
        }

        let mut buf = bytes;
        let kind_byte = buf.get_u8();
        let kind = SegmentKind::from_u8(kind_byte).ok_or_else(|| {
            ProtocolError::MalformedPacket(format!("unknown segment kind {kind_byte}"))
        })?;
        let src = read_addr(&mut buf);
        let dst = read_addr(&mut buf);
        let seq = buf.get_u64();
        let ack = buf.get_u64();
        let payload = Bytes::copy_from_slice(buf);

        Ok(Self { kind, src, dst, seq, ack, payload })
    }

    fn sync_signal(&self) -> Option<SyncSignal> {
        (self.kind == SegmentKind::Datagram)
            .then(|| SyncSignal { source: self.src, payload: self.payload.clone() })
    }
}

fn mapped(addr: IpAddr) -> Ipv6Addr {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn read_addr(buf: &mut &[u8]) -> IpAddr {
    let mut octets = [0u8; 16];
    buf.copy_to_slice(&mut octets);
    Ipv6Addr::from(octets).to_canonical()
}

fn address(state: &State, key: &str) -> Result<IpAddr, BehaviorError> {
    let text = state.require_str(key)?;
    text.parse().map_err(|_| BehaviorError::InvalidValue {
        key: key.to_string(),
        reason: format!("{text:?} is not an IP address"),
    })
}

fn next_seq(state: &State) -> Result<u64, BehaviorError> {
    match state.get_u64(SND_NXT) {
        Some(snd_nxt) => Ok(snd_nxt),
        None => state.require_u64(SEQ),
    }
}

/// State for the endpoint at `src` talking to `dst`, first byte numbered
/// `isn`.
pub fn connection_state(src: IpAddr, dst: IpAddr, isn: u64) -> State {
    State::new().with(SRC, src.to_string()).with(DST, dst.to_string()).with(SEQ, isn)
}

/// Data segment template.
///
/// Sending: takes the sequence number from `snd_nxt` (or `seq`) and records
/// the new `snd_nxt` once sent. Receiving: accepts in-order data, advances
/// `rcv_nxt` and asks for an [`Ack`] in reply.
#[derive(Debug, Clone, Default)]
pub struct Data {
    payload: Bytes,
    await_ack: bool,
}

impl Data {
    /// Sends `payload` and waits for the acknowledgment.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self { payload: payload.into(), await_ack: true }
    }

    /// Sends `payload` without waiting.
    pub fn streaming(payload: impl Into<Bytes>) -> Self {
        Self { payload: payload.into(), await_ack: false }
    }
}

impl PacketBehavior<Segment> for Data {
    fn name(&self) -> &str {
        "data"
    }

    fn generate(
        &self,
        state: &State,
        _options: &StepOptions<Segment>,
    ) -> Result<Generated<Segment>, BehaviorError> {
        let src = address(state, SRC)?;
        let dst = address(state, DST)?;
        let seq = next_seq(state)?;
        let ack = state.get_u64(RCV_NXT).unwrap_or(0);

        let segment = Segment::data(src, dst, seq, ack, self.payload.clone());
        Ok(if self.await_ack { Generated::exchange(segment) } else { Generated::send(segment) })
    }

    fn on_sent(&self, state: &mut State, packet: &Segment) -> Result<(), BehaviorError> {
        state.set(SND_NXT, packet.end_seq());
        Ok(())
    }

    fn receive(
        &self,
        state: &mut State,
        packet: &Segment,
    ) -> Result<Option<Template<Segment>>, BehaviorError> {
        match state.get_u64(RCV_NXT) {
            Some(expected) if expected != packet.seq => {
                tracing::debug!(expected, seq = packet.seq, "out-of-order data not accepted");
            },
            _ => {
                state.set(RCV_NXT, packet.end_seq());
            },
        }
        Ok(Some(Arc::new(Ack)))
    }

    fn validate(&self, prior: &State, packet: &Segment) -> Result<bool, BehaviorError> {
        Ok(prior.get_u64(RCV_NXT).is_none_or(|expected| expected == packet.seq))
    }
}

/// Acknowledgment template.
///
/// Sending: acknowledges `rcv_nxt`. Receiving: a valid acknowledgment covers
/// exactly everything sent so far and moves `seq` up to it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ack;

impl PacketBehavior<Segment> for Ack {
    fn name(&self) -> &str {
        "ack"
    }

    fn generate(
        &self,
        state: &State,
        _options: &StepOptions<Segment>,
    ) -> Result<Generated<Segment>, BehaviorError> {
        let src = address(state, SRC)?;
        let dst = address(state, DST)?;
        let seq = next_seq(state)?;
        let ack = state.require_u64(RCV_NXT)?;

        Ok(Generated::send(Segment::ack(src, dst, seq, ack)))
    }

    fn receive(
        &self,
        state: &mut State,
        packet: &Segment,
    ) -> Result<Option<Template<Segment>>, BehaviorError> {
        state.set(SEQ, packet.ack);
        Ok(None)
    }

    fn validate(&self, prior: &State, packet: &Segment) -> Result<bool, BehaviorError> {
        Ok(packet.ack == next_seq(prior)?)
    }
}

/// The reference protocol: classifies segments by kind.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeqAck;

impl Protocol for SeqAck {
    type Packet = Segment;

    fn classify(&self, packet: &Segment) -> Vec<Template<Segment>> {
        match packet.kind {
            SegmentKind::Data => vec![Arc::new(Data::default())],
            SegmentKind::Ack => vec![Arc::new(Ack)],
            SegmentKind::Datagram => Vec::new(),
        }
    }
}
