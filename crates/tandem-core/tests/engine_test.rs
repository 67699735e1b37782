//! Engine tests against a scripted in-memory transport.
//!
//! These tests verify step sequencing without any network:
//! - Steps of a sequence run strictly in order over one shared state
//! - Replies are validated against the state before the reply was applied
//! - A failed validation leaves the state untouched
//! - Unrecognised replies are reported invalid
//! - Template failures surface as errors naming the stage
//! - A supplied state is adopted as is; protocol defaults only seed an empty
//!   context
//! - Misuse (buffered sequences, waits without state) is rejected up front

use std::{
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use tandem_core::{
    Accept, BehaviorError, Context, DatagramChannel, Engine, EngineError, Generated, Packet,
    PacketBehavior, PacketTransport, Protocol, Stage, State, StepOptions, StepOutcome, SystemEnv,
    Template, TesterConfig, Wait,
};
use tandem_proto::ProtocolError;

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Msg {
    tag: String,
    num: u64,
}

impl Msg {
    fn new(tag: &str, num: u64) -> Self {
        Self { tag: tag.to_string(), num }
    }
}

impl Packet for Msg {
    fn to_bytes(&self) -> Bytes {
        Bytes::from(format!("{}:{}", self.tag, self.num))
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| ProtocolError::MalformedPacket(e.to_string()))?;
        let (tag, num) =
            text.split_once(':').ok_or_else(|| ProtocolError::MalformedPacket(text.to_string()))?;
        let num = num.parse().map_err(|_| ProtocolError::MalformedPacket(text.to_string()))?;
        Ok(Self::new(tag, num))
    }
}

struct ScriptedTransport {
    replies: VecDeque<Msg>,
    log: Log,
}

#[async_trait]
impl PacketTransport for ScriptedTransport {
    type Packet = Msg;

    async fn inject(&mut self, packet: &Msg) -> io::Result<()> {
        self.log.lock().unwrap().push(format!("transmit {}", packet.tag));
        Ok(())
    }

    async fn exchange(&mut self, packet: &Msg) -> io::Result<Msg> {
        self.inject(packet).await?;
        self.replies.pop_front().ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))
    }

    async fn capture(
        &mut self,
        filter: &Accept<'_, Msg>,
        timeout: Option<Duration>,
    ) -> io::Result<Option<Msg>> {
        while let Some(packet) = self.replies.pop_front() {
            if filter(&packet) {
                return Ok(Some(packet));
            }
        }
        match timeout {
            Some(timeout) => {
                tokio::time::sleep(timeout).await;
                Ok(None)
            },
            None => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }
}

struct NoSync;

#[async_trait]
impl DatagramChannel for NoSync {
    async fn send_to(&self, buf: &[u8], _target: SocketAddr) -> io::Result<usize> {
        Ok(buf.len())
    }

    async fn recv_from(&self, _buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        std::future::pending().await
    }
}

/// Sends `tag` carrying the current `seq`.
struct Probe {
    tag: &'static str,
    await_reply: bool,
    log: Log,
}

impl PacketBehavior<Msg> for Probe {
    fn name(&self) -> &str {
        self.tag
    }

    fn generate(
        &self,
        state: &State,
        _: &StepOptions<Msg>,
    ) -> Result<Generated<Msg>, BehaviorError> {
        self.log.lock().unwrap().push(format!("generate {}", self.tag));
        let packet = Msg::new(self.tag, state.require_u64("seq")?);
        Ok(if self.await_reply { Generated::exchange(packet) } else { Generated::send(packet) })
    }

    fn on_sent(&self, state: &mut State, _packet: &Msg) -> Result<(), BehaviorError> {
        state.set(format!("sent_{}", self.tag), true);
        Ok(())
    }

    fn receive(&self, _: &mut State, _: &Msg) -> Result<Option<Template<Msg>>, BehaviorError> {
        Ok(None)
    }
}

/// Interprets `ack` replies: valid if they acknowledge `seq + 1`.
struct AckReceiver {
    log: Log,
}

impl PacketBehavior<Msg> for AckReceiver {
    fn name(&self) -> &str {
        "ack"
    }

    fn generate(&self, _: &State, _: &StepOptions<Msg>) -> Result<Generated<Msg>, BehaviorError> {
        Err(BehaviorError::Other("receive-only".into()))
    }

    fn receive(
        &self,
        state: &mut State,
        packet: &Msg,
    ) -> Result<Option<Template<Msg>>, BehaviorError> {
        self.log.lock().unwrap().push(format!("receive {}", packet.tag));
        state.set("seq", packet.num);
        Ok(None)
    }

    fn validate(&self, prior: &State, packet: &Msg) -> Result<bool, BehaviorError> {
        Ok(packet.num == prior.require_u64("seq")? + 1)
    }
}

struct Broken;

impl PacketBehavior<Msg> for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    fn generate(&self, _: &State, _: &StepOptions<Msg>) -> Result<Generated<Msg>, BehaviorError> {
        Err(BehaviorError::MissingKey("subflow".into()))
    }

    fn receive(&self, _: &mut State, _: &Msg) -> Result<Option<Template<Msg>>, BehaviorError> {
        Ok(None)
    }
}

struct Toy {
    log: Log,
}

impl Protocol for Toy {
    type Packet = Msg;

    fn classify(&self, packet: &Msg) -> Vec<Template<Msg>> {
        match packet.tag.as_str() {
            "ack" => vec![Arc::new(AckReceiver { log: self.log.clone() })],
            _ => Vec::new(),
        }
    }

    fn initial_state(&self) -> State {
        State::new().with("seq", 0u64).with("window", 16u64)
    }
}

type ToyEngine = Engine<Toy, ScriptedTransport, NoSync, SystemEnv>;

fn engine(replies: Vec<Msg>, check: bool) -> (ToyEngine, Log) {
    let log = Log::default();
    let transport = ScriptedTransport { replies: replies.into(), log: log.clone() };
    let config = TesterConfig::default().with_check(check);
    let engine = Engine::new(Toy { log: log.clone() }, transport, NoSync, config, SystemEnv);
    (engine, log)
}

fn probe(tag: &'static str, await_reply: bool, log: &Log) -> Template<Msg> {
    Arc::new(Probe { tag, await_reply, log: log.clone() })
}

#[tokio::test(start_paused = true)]
async fn sequence_runs_steps_in_order() {
    let (mut engine, log) = engine(vec![Msg::new("ack", 1), Msg::new("ack", 2)], true);
    let mut ctx = Context::new();
    let templates = [probe("first", true, &log), probe("second", true, &log)];

    let outcomes =
        engine.send_sequence(&mut ctx, &templates, None, &StepOptions::default()).await.unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(StepOutcome::all_valid));
    assert_eq!(
        *log.lock().unwrap(),
        [
            "generate first",
            "transmit first",
            "receive ack",
            "generate second",
            "transmit second",
            "receive ack"
        ]
    );

    let state = ctx.state().unwrap();
    assert_eq!(state.get_u64("seq"), Some(2));
    assert_eq!(state.get_bool("sent_second"), Some(true));
    assert_eq!(state.last_packet::<Msg>().unwrap(), Some(Msg::new("ack", 2)));
}

#[tokio::test(start_paused = true)]
async fn no_wait_is_trivially_valid() {
    let (mut engine, log) = engine(Vec::new(), true);
    let mut ctx = Context::new();

    let outcome = engine
        .send_one(&mut ctx, probe("fin", false, &log).as_ref(), None, &StepOptions::default())
        .await
        .unwrap()
        .into_single()
        .unwrap();

    assert!(outcome.reply_valid);
    assert!(outcome.reply.is_none());
    assert_eq!(outcome.sent, Some(Msg::new("fin", 0)));
}

#[tokio::test(start_paused = true)]
async fn failed_validation_leaves_state_untouched() {
    let (mut engine, log) = engine(vec![Msg::new("ack", 7)], true);
    let mut ctx = Context::with_state(State::new().with("seq", 100u64));

    let exchange = engine
        .send_one(&mut ctx, probe("data", true, &log).as_ref(), None, &StepOptions::default())
        .await
        .unwrap()
        .into_single()
        .unwrap();

    assert!(!exchange.reply_valid);
    assert_eq!(exchange.reply, Some(Msg::new("ack", 7)));
    assert_eq!(exchange.state.get_u64("seq"), Some(100));
    assert!(!log.lock().unwrap().iter().any(|entry| entry == "receive ack"));
}

#[tokio::test(start_paused = true)]
async fn validation_is_skipped_without_check() {
    let (mut engine, log) = engine(vec![Msg::new("ack", 7)], false);
    let mut ctx = Context::with_state(State::new().with("seq", 100u64));

    let exchange = engine
        .send_one(&mut ctx, probe("data", true, &log).as_ref(), None, &StepOptions::default())
        .await
        .unwrap()
        .into_single()
        .unwrap();

    assert!(exchange.reply_valid);
    assert_eq!(exchange.state.get_u64("seq"), Some(7));
}

#[tokio::test(start_paused = true)]
async fn unrecognised_reply_is_invalid() {
    let (mut engine, log) = engine(vec![Msg::new("rst", 0)], false);
    let mut ctx = Context::new();

    let exchange = engine
        .send_one(&mut ctx, probe("data", true, &log).as_ref(), None, &StepOptions::default())
        .await
        .unwrap()
        .into_single()
        .unwrap();

    assert!(!exchange.reply_valid);
    assert_eq!(exchange.state.get_u64("seq"), Some(0));
}

#[tokio::test(start_paused = true)]
async fn override_merges_into_existing_state() {
    let (mut engine, log) = engine(Vec::new(), false);
    let mut ctx = Context::with_state(State::new().with("seq", 5u64).with("dst", "10.2.1.2"));
    let update = State::new().with("seq", 9u64);

    let data = probe("data", false, &log);
    let exchange = engine
        .send_one(&mut ctx, data.as_ref(), Some(&update), &StepOptions::default())
        .await
        .unwrap()
        .into_single()
        .unwrap();

    assert_eq!(exchange.sent, Some(Msg::new("data", 9)));
    assert_eq!(exchange.state.get_str("dst"), Some("10.2.1.2"));
}

#[tokio::test(start_paused = true)]
async fn supplied_state_replaces_protocol_defaults() {
    let (mut engine, log) = engine(Vec::new(), false);
    let mut ctx = Context::new();
    let supplied = State::new().with("seq", 7u64);
    let data_probe = probe("data", false, &log);

    let exchange = engine
        .send_one(&mut ctx, data_probe.as_ref(), Some(&supplied), &StepOptions::default())
        .await
        .unwrap()
        .into_single()
        .unwrap();

    assert_eq!(exchange.sent, Some(Msg::new("data", 7)));
    assert_eq!(exchange.state.get_u64("window"), None);
}

#[tokio::test(start_paused = true)]
async fn protocol_defaults_seed_empty_context() {
    let (mut engine, log) = engine(Vec::new(), false);
    let mut ctx = Context::new();

    let exchange = engine
        .send_one(&mut ctx, probe("data", false, &log).as_ref(), None, &StepOptions::default())
        .await
        .unwrap()
        .into_single()
        .unwrap();

    assert_eq!(exchange.sent, Some(Msg::new("data", 0)));
    assert_eq!(exchange.state.get_u64("window"), Some(16));
}

#[tokio::test(start_paused = true)]
async fn generate_failure_names_stage() {
    let (mut engine, _log) = engine(Vec::new(), false);
    let mut ctx = Context::new();

    let err = engine.send_one(&mut ctx, &Broken, None, &StepOptions::default()).await.unwrap_err();

    assert!(matches!(err, EngineError::Unexpected { stage: Stage::Generate, .. }));
    assert!(err.should_halt());
}

#[tokio::test(start_paused = true)]
async fn buffered_sequence_is_rejected() {
    let (mut engine, log) = engine(Vec::new(), false);
    let mut ctx = Context::new();
    let templates = [probe("data", false, &log)];

    let err = engine
        .send_sequence(&mut ctx, &templates, None, &StepOptions::default().buffered())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::InvalidUsage(_)));
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn wait_step_times_out_with_bound() {
    let (mut engine, _log) = engine(vec![Msg::new("noise", 0)], false);
    let mut ctx = Context::new();
    let options = StepOptions::default()
        .with_timeout(Duration::from_secs(2))
        .with_filter(|p: &Msg| p.tag == "ack");

    let started = tokio::time::Instant::now();
    let err = engine.send_one(&mut ctx, &Wait, None, &options).await.unwrap_err();

    assert!(matches!(err, EngineError::Timeout { elapsed } if elapsed == Duration::from_secs(2)));
    assert!(err.is_recoverable());
    assert_eq!(started.elapsed(), Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn wait_step_receives_matching_packet() {
    let (mut engine, _log) = engine(vec![Msg::new("noise", 0), Msg::new("ack", 1)], true);
    let mut ctx = Context::new();
    let options = StepOptions::default().with_filter(|p: &Msg| p.tag == "ack");

    let exchange =
        engine.send_one(&mut ctx, &Wait, None, &options).await.unwrap().into_single().unwrap();

    assert!(exchange.reply_valid);
    assert!(exchange.sent.is_none());
    assert_eq!(exchange.state.get_u64("seq"), Some(1));
}

#[tokio::test(start_paused = true)]
async fn wait_for_packet_needs_state() {
    let (mut engine, _log) = engine(vec![Msg::new("ack", 1)], false);
    let mut ctx = Context::new();

    let err = engine
        .wait_for_packet(&mut ctx, None, Arc::new(|_: &Msg| true), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidUsage(_)));

    let packet = engine
        .wait_for_packet(&mut ctx, Some(&State::new()), Arc::new(|_: &Msg| true), None)
        .await
        .unwrap();
    assert_eq!(packet, Msg::new("ack", 1));
}

#[tokio::test(start_paused = true)]
async fn wait_for_burst_needs_state() {
    let (mut engine, _log) = engine(vec![Msg::new("data", 1)], false);
    let mut ctx = Context::new();

    let err = engine
        .wait_for_burst(&mut ctx, None, Arc::new(|_: &Msg| true), Some(Duration::from_secs(1)))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::InvalidUsage(_)));
    assert!(ctx.state().is_none());
}

#[tokio::test(start_paused = true)]
async fn send_state_needs_destination() {
    let (mut engine, _log) = engine(Vec::new(), false);

    let err = engine.send_state(Some(&State::new().with("seq", 1u64)), None).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidUsage(_)));

    let err = engine.send_state(None, None).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidUsage(_)));
}
