//! Scenario builder API.
//!
//! Provides a declarative API for two-tester scenarios that enforce the
//! Oracle Pattern: a scenario cannot run without a verification function.

use std::{
    cell::RefCell,
    future::Future,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    pin::Pin,
    rc::Rc,
    time::Duration,
};

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use tandem_core::{EngineError, Environment, TesterConfig};

use crate::{
    scenario::{OracleFn, Peer, World, world::PeerReport},
    seqack::{SeqAck, connection_state},
    sim_env::SimEnv,
    sim_net::SimNetwork,
};

/// Client tester address.
pub const CLIENT_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 1, 1, 2));
/// Server tester address.
pub const SERVER_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 2, 1, 2));

/// Future returned by a script.
pub type ScriptFuture<'a> = Pin<Box<dyn Future<Output = Result<(), EngineError>> + 'a>>;

type Script = Box<dyn for<'a> FnOnce(&'a mut Peer) -> ScriptFuture<'a>>;

/// Scenario builder.
///
/// Give each tester a script, optionally tune configuration, seed and
/// initial sequence numbers, then add an oracle.
pub struct Scenario {
    config: TesterConfig,
    seed: u64,
    duration: Duration,
    isns: Option<(u64, u64)>,
    client: Option<Script>,
    server: Option<Script>,
}

impl Scenario {
    /// Scenario with validation on, seed 0, and scripts that do nothing.
    pub fn new() -> Self {
        Self {
            config: TesterConfig::default().with_check(true),
            seed: 0,
            duration: Duration::from_secs(60),
            isns: None,
            client: None,
            server: None,
        }
    }

    /// Configuration for both testers.
    pub fn with_config(mut self, config: TesterConfig) -> Self {
        self.config = config;
        self
    }

    /// Seed for the simulation and both testers' randomness.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Virtual time limit. A scenario still running at the limit fails.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Fixed initial sequence numbers instead of seeded random ones.
    pub fn with_isns(mut self, client: u64, server: u64) -> Self {
        self.isns = Some((client, server));
        self
    }

    /// Client script.
    pub fn client<F>(mut self, script: F) -> Self
    where
        F: for<'a> FnOnce(&'a mut Peer) -> ScriptFuture<'a> + 'static,
    {
        self.client = Some(Box::new(script));
        self
    }

    /// Server script.
    pub fn server<F>(mut self, script: F) -> Self
    where
        F: for<'a> FnOnce(&'a mut Peer) -> ScriptFuture<'a> + 'static,
    {
        self.server = Some(Box::new(script));
        self
    }

    /// Set the oracle function and return a runnable scenario.
    ///
    /// The oracle is mandatory - you cannot run a scenario without
    /// verification.
    pub fn oracle(self, oracle: OracleFn) -> RunnableScenario {
        RunnableScenario { scenario: self, oracle }
    }
}

impl Default for Scenario {
    fn default() -> Self {
        Self::new()
    }
}

/// A scenario with an oracle function that can be executed.
pub struct RunnableScenario {
    scenario: Scenario,
    oracle: OracleFn,
}

impl RunnableScenario {
    /// Execute the scenario.
    ///
    /// Both testers attach to one simulated network and run their scripts
    /// as Turmoil clients on virtual time. A script error does not abort
    /// the run; it is recorded in the tester's report for the oracle.
    ///
    /// # Errors
    ///
    /// Returns error if the simulation fails (e.g. a script is still
    /// blocked at the time limit) or the oracle rejects the world.
    pub fn run(self) -> Result<(), String> {
        let Scenario { config, seed, duration, isns, client, server } = self.scenario;
        tandem_core::logging::init(&config);

        let env = SimEnv::with_seed(seed);
        let (client_isn, server_isn) =
            isns.unwrap_or_else(|| (env.random_bits(32), env.random_bits(32)));

        let net = SimNetwork::new();
        let mut sim = turmoil::Builder::new()
            .simulation_duration(duration)
            .build_with_rng(Box::new(ChaCha20Rng::seed_from_u64(seed)));

        let sides = [
            ("client", CLIENT_ADDR, SERVER_ADDR, client_isn, client),
            ("server", SERVER_ADDR, CLIENT_ADDR, server_isn, server),
        ];
        let mut slots = Vec::with_capacity(sides.len());

        for (name, local, remote, isn, script) in sides {
            let engine = tandem_core::Engine::new(
                SeqAck,
                net.attach(local),
                net.bind(SocketAddr::new(local, config.sync_port)),
                config.clone(),
                env.clone(),
            );
            let peer = Peer::new(
                engine,
                connection_state(local, remote, isn),
                env.clone(),
                local,
                remote,
            );

            let slot: Rc<RefCell<Option<PeerReport>>> = Rc::new(RefCell::new(None));
            slots.push(Rc::clone(&slot));

            sim.client(name, async move {
                let report = run_script(peer, script).await;
                *slot.borrow_mut() = Some(report);
                Ok(())
            });
        }

        sim.run().map_err(|e| format!("simulation failed: {e}"))?;

        let mut reports = slots.into_iter().map(|slot| slot.borrow_mut().take());
        let (Some(Some(client)), Some(Some(server))) = (reports.next(), reports.next()) else {
            return Err("a tester finished without a report".to_string());
        };

        let world = World::new(client, server, net.datagrams(), net.injected());
        (self.oracle)(&world)
    }
}

async fn run_script(mut peer: Peer, script: Option<Script>) -> PeerReport {
    let result = match script {
        Some(script) => script(&mut peer).await,
        None => Ok(()),
    };

    if let Err(e) = &result {
        tracing::warn!(peer = %peer.local(), error = %e, "script ended with error");
    }
    peer.into_report(result.err())
}
