//! Fixtures that wire the application services to the mocks.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use hive_agent::application::ports::{LinkEvent, WorkloadFactory};
use hive_agent::application::services::agent::{Channels, Link};
use hive_agent::application::services::command_processor::CommandProcessor;
use hive_agent::application::services::supervisor::{SupervisorLinks, WorkloadSupervisor};
use hive_agent::domain::{AgentError, AgentId, AgentState, OutboundMessage};
use hive_common::Configuration;
use tokio::sync::{Mutex, broadcast, mpsc, watch};

use crate::mocks::{Behaviour, ChannelSink, EventLog, MemoryConfigStore, RecordingFactory};

pub const AGENT: &str = "A1";

/// Stop timeouts short enough for tests.
pub const GRACE: Duration = Duration::from_millis(100);
pub const HARD_TIMEOUT: Duration = Duration::from_millis(200);

/// How long a test waits for something that should happen promptly.
pub const PROMPTLY: Duration = Duration::from_secs(2);

pub fn agent_id() -> AgentId {
    AgentId::new(AGENT).unwrap()
}

/// A configuration document. `generation` lands in a mode-specific section
/// so two documents of the same mode can differ.
pub fn config_doc(id: &str, mode: &str, generation: u32) -> String {
    format!(
        r#"{{"id":"{id}","mode":"{mode}","coordinator":{{"command_url":"tcp://coord:5712","event_url":"tcp://coord:5713"}},"sensor":{{"generation":{generation}}}}}"#
    )
}

pub fn config(id: &str, mode: &str, generation: u32) -> Configuration {
    Configuration::from_json(&config_doc(id, mode, generation)).unwrap()
}

pub fn config_line(mode: &str, generation: u32) -> String {
    format!("{AGENT} CONFIG {}", config_doc(AGENT, mode, generation))
}

/// Everything queued on the relay right now.
pub fn drain(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<OutboundMessage> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

// ── Command processor fixture ─────────────────────────────────────────────────

pub struct Fixture {
    pub log: EventLog,
    pub store: Arc<MemoryConfigStore>,
    pub factory: Arc<RecordingFactory>,
    pub supervisor: Arc<Mutex<WorkloadSupervisor>>,
    pub relay_rx: mpsc::Receiver<OutboundMessage>,
    pub dispatch_rx: broadcast::Receiver<String>,
    pub state: watch::Receiver<AgentState>,
    pub faults: mpsc::UnboundedReceiver<AgentError>,
}

/// Relay queue capacity of the processor fixtures.
pub const RELAY_CAPACITY: usize = 64;

pub fn processor(behaviour: Behaviour) -> (CommandProcessor<MemoryConfigStore>, Fixture) {
    processor_with_relay(behaviour, RELAY_CAPACITY)
}

/// A processor whose relay queue holds only `capacity` messages.
pub fn processor_with_relay(
    behaviour: Behaviour,
    capacity: usize,
) -> (CommandProcessor<MemoryConfigStore>, Fixture) {
    let log = EventLog::default();
    build_processor(
        MemoryConfigStore::new(log.clone()),
        RecordingFactory::new(log.clone(), behaviour),
        log,
        capacity,
    )
}

pub fn processor_with(
    store: impl FnOnce(EventLog) -> MemoryConfigStore,
    factory: impl FnOnce(EventLog) -> RecordingFactory,
) -> (CommandProcessor<MemoryConfigStore>, Fixture) {
    let log = EventLog::default();
    build_processor(store(log.clone()), factory(log.clone()), log, RELAY_CAPACITY)
}

fn build_processor(
    store: MemoryConfigStore,
    factory: RecordingFactory,
    log: EventLog,
    relay_capacity: usize,
) -> (CommandProcessor<MemoryConfigStore>, Fixture) {
    let store = Arc::new(store);
    let factory = Arc::new(factory);
    let (relay_tx, relay_rx) = mpsc::channel(relay_capacity);
    let (dispatch, dispatch_rx) = broadcast::channel(16);
    let (fault_tx, faults) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(AgentState::Unconfigured);

    let factory_port: Arc<dyn WorkloadFactory> = factory.clone();
    let supervisor = WorkloadSupervisor::new(
        factory_port,
        SupervisorLinks {
            agent_id: agent_id(),
            public_ip: String::new(),
            commands: dispatch.clone(),
            events: relay_tx.clone(),
            faults: fault_tx,
        },
    )
    .with_timeouts(GRACE, HARD_TIMEOUT);
    let supervisor = Arc::new(Mutex::new(supervisor));

    let processor = CommandProcessor::new(
        agent_id(),
        config(AGENT, "", 0),
        Arc::clone(&store),
        Arc::clone(&supervisor),
        relay_tx,
        dispatch,
        Arc::new(state_tx),
    );
    (
        processor,
        Fixture {
            log,
            store,
            factory,
            supervisor,
            relay_rx,
            dispatch_rx,
            state,
            faults,
        },
    )
}

// ── Agent channels ────────────────────────────────────────────────────────────

/// The test's side of an agent's channels.
pub struct Wire {
    pub remote: mpsc::Sender<String>,
    pub published: mpsc::UnboundedReceiver<String>,
    pub outbound_link: broadcast::Sender<LinkEvent>,
    pub inbound_link: broadcast::Sender<LinkEvent>,
    pub local: mpsc::Sender<String>,
}

impl Wire {
    /// Next line the agent sent to the coordinator.
    pub async fn next_published(&mut self) -> String {
        tokio::time::timeout(PROMPTLY, self.published.recv())
            .await
            .expect("agent published in time")
            .expect("sink open")
    }

    pub async fn command(&self, line: impl Into<String>) {
        self.remote.send(line.into()).await.expect("agent listening");
    }
}

pub fn wire() -> (Channels<ChannelSink, mpsc::Receiver<String>>, Wire) {
    let (sink, published) = ChannelSink::new();
    let (remote, remote_rx) = mpsc::channel(16);
    let (local, local_rx) = mpsc::channel(16);
    let (outbound_link, outbound_events) = broadcast::channel(8);
    let (inbound_link, inbound_events) = broadcast::channel(8);
    (
        Channels {
            outbound: Link {
                channel: sink,
                events: outbound_events,
                endpoint: "tcp://coord:5713".to_string(),
            },
            inbound: Link {
                channel: remote_rx,
                events: inbound_events,
                endpoint: "tcp://coord:5712".to_string(),
            },
            local: Some(local_rx),
        },
        Wire {
            remote,
            published,
            outbound_link,
            inbound_link,
            local,
        },
    )
}
