//! What a finished scenario leaves behind for the oracle.

use std::net::IpAddr;

use tandem_core::{EngineError, State, StepOutcome};
use tandem_proto::{Datagram, SyncMessage};

use crate::{
    seqack::{Segment, SegmentKind},
    sim_net::DatagramRecord,
};

/// Final view of one tester.
#[derive(Debug)]
pub struct PeerReport {
    /// Tester address
    pub addr: IpAddr,
    /// Every step outcome, in order
    pub outcomes: Vec<StepOutcome<Segment>>,
    /// Script state when the script ended
    pub state: State,
    /// Error the script ended with, if any
    pub error: Option<EngineError>,
}

impl PeerReport {
    /// Returns true if every received packet passed validation.
    pub fn all_replies_valid(&self) -> bool {
        self.outcomes.iter().all(|outcome| outcome.all_valid())
    }
}

/// Both testers plus everything that crossed the network.
#[derive(Debug)]
pub struct World {
    client: PeerReport,
    server: PeerReport,
    datagrams: Vec<DatagramRecord>,
    injected: Vec<Segment>,
}

impl World {
    pub(crate) fn new(
        client: PeerReport,
        server: PeerReport,
        datagrams: Vec<DatagramRecord>,
        injected: Vec<Segment>,
    ) -> Self {
        Self { client, server, datagrams, injected }
    }

    /// Client tester.
    pub fn client(&self) -> &PeerReport {
        &self.client
    }

    /// Server tester.
    pub fn server(&self) -> &PeerReport {
        &self.server
    }

    /// Every side-channel datagram, including dropped ones.
    pub fn datagrams(&self) -> &[DatagramRecord] {
        &self.datagrams
    }

    /// Every injected segment.
    pub fn injected(&self) -> &[Segment] {
        &self.injected
    }

    /// Segments of `kind` injected by `src`.
    pub fn injected_by(&self, src: IpAddr, kind: SegmentKind) -> Vec<&Segment> {
        self.injected.iter().filter(|s| s.src == src && s.kind == kind).collect()
    }

    /// Decoded side-channel datagrams sent by `src`, undecodable ones
    /// skipped.
    pub fn sync_messages_from(&self, src: IpAddr) -> Vec<Datagram> {
        self.datagrams
            .iter()
            .filter(|record| record.from.ip() == src)
            .filter_map(|record| Datagram::decode(&record.payload).ok())
            .collect()
    }

    /// Number of side-channel acknowledgments `src` sent.
    pub fn sync_acks_from(&self, src: IpAddr) -> usize {
        self.sync_messages_from(src).iter().filter(|d| d.message == SyncMessage::Ack).count()
    }
}
