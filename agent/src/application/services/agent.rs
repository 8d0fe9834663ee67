//! Application service: agent orchestration.
//!
//! Owns identity, configuration and the shared queues, spawns the relay,
//! the command processor and one liveness monitor per link, and is the single
//! failure boundary: the first task to finish or fail decides how the run
//! ends, after which the workload is stopped and every sibling is cancelled.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use hive_common::Configuration;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::ports::{
    AddressResolver, ConfigStore, LinkDirection, LinkEvent, MessageSink, MessageSource,
    WorkloadFactory,
};
use crate::application::services::command_processor::{CommandProcessor, ProcessorExit};
use crate::application::services::liveness::LivenessMonitor;
use crate::application::services::relay::{OutboundRelay, RELAY_QUEUE_CAPACITY};
use crate::application::services::supervisor::{SupervisorLinks, WorkloadSupervisor};
use crate::domain::{AgentError, AgentExit, AgentId, AgentState, OutboundMessage};

/// Capacity of the local dispatch queue for pass-through commands.
pub const DISPATCH_CAPACITY: usize = 64;

/// How long cancelled tasks get to finish before they are aborted. Covers a
/// reconciliation caught mid-way, including a full workload stop.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// One coordinator connection as seen by the orchestrator.
pub struct Link<T> {
    pub channel: T,
    pub events: broadcast::Receiver<LinkEvent>,
    pub endpoint: String,
}

/// The transports the agent runs over, already connecting in the background.
pub struct Channels<O, I> {
    pub outbound: Link<O>,
    pub inbound: Link<I>,
    /// Lines from local producers, if a local socket is configured.
    pub local: Option<mpsc::Receiver<String>>,
}

/// Collaborators the agent is built from.
pub struct AgentDeps {
    pub store: Arc<dyn ConfigStore>,
    pub factory: Arc<dyn WorkloadFactory>,
    pub resolver: Arc<dyn AddressResolver>,
}

pub struct Agent {
    agent_id: AgentId,
    config: Configuration,
    public_ip: String,
    deps: AgentDeps,
    state: Arc<watch::Sender<AgentState>>,
    dispatch: broadcast::Sender<String>,
    relay_tx: mpsc::Sender<OutboundMessage>,
    relay_rx: mpsc::Receiver<OutboundMessage>,
    shutdown: CancellationToken,
    grace: Option<(Duration, Duration)>,
}

impl Agent {
    /// Build an agent from its locally persisted configuration.
    ///
    /// When `fetch_ip` is set the public address is resolved once here; a
    /// failed lookup leaves it empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured identity is not a valid token.
    pub async fn new(config: Configuration, deps: AgentDeps) -> Result<Self> {
        let agent_id = AgentId::new(&config.id).context("reading agent identity")?;

        let public_ip = if config.fetch_ip {
            match deps.resolver.public_address().await {
                Ok(ip) => {
                    info!(%ip, "fetched external address");
                    ip
                }
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "could not fetch public address");
                    String::new()
                }
            }
        } else {
            String::new()
        };

        let (relay_tx, relay_rx) = mpsc::channel(RELAY_QUEUE_CAPACITY);
        let (dispatch, _) = broadcast::channel(DISPATCH_CAPACITY);
        let (state, _) = watch::channel(AgentState::Unconfigured);

        Ok(Self {
            agent_id,
            config,
            public_ip,
            deps,
            state: Arc::new(state),
            dispatch,
            relay_tx,
            relay_rx,
            shutdown: CancellationToken::new(),
            grace: None,
        })
    }

    /// Override the workload stop timeouts.
    #[must_use]
    pub fn with_workload_timeouts(mut self, grace: Duration, hard_timeout: Duration) -> Self {
        self.grace = Some((grace, hard_timeout));
        self
    }

    #[must_use]
    pub fn identity(&self) -> &AgentId {
        &self.agent_id
    }

    #[must_use]
    pub fn public_ip(&self) -> &str {
        &self.public_ip
    }

    /// Observe lifecycle transitions.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<AgentState> {
        self.state.subscribe()
    }

    /// Listen to pass-through coordinator commands.
    #[must_use]
    pub fn subscribe_commands(&self) -> broadcast::Receiver<String> {
        self.dispatch.subscribe()
    }

    /// Producer handle for in-process events bound for the coordinator.
    #[must_use]
    pub fn events(&self) -> mpsc::Sender<OutboundMessage> {
        self.relay_tx.clone()
    }

    /// Token that stops the agent when cancelled. Transports should be
    /// connected with a child of it so they close with the agent.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until deletion, shutdown or the first fault.
    ///
    /// # Errors
    ///
    /// Returns the escalation cause: a workload fault, a persistence failure
    /// or a panicked task. The workload has been stopped by the time this
    /// returns.
    pub async fn run<O, I>(self, channels: Channels<O, I>) -> Result<AgentExit>
    where
        O: MessageSink + 'static,
        I: MessageSource + 'static,
    {
        let Self {
            agent_id,
            config,
            public_ip,
            deps,
            state,
            dispatch,
            relay_tx,
            relay_rx,
            shutdown,
            grace,
        } = self;
        let Channels {
            outbound,
            inbound,
            local,
        } = channels;

        let (fault_tx, mut fault_rx) = mpsc::unbounded_channel();
        let mut supervisor = WorkloadSupervisor::new(
            Arc::clone(&deps.factory),
            SupervisorLinks {
                agent_id: agent_id.clone(),
                public_ip,
                commands: dispatch.clone(),
                events: relay_tx.clone(),
                faults: fault_tx,
            },
        );
        if let Some((grace, hard_timeout)) = grace {
            supervisor = supervisor.with_timeouts(grace, hard_timeout);
        }
        let supervisor = Arc::new(Mutex::new(supervisor));

        let mut monitors = JoinSet::new();
        for (direction, endpoint, events) in [
            (LinkDirection::Outbound, outbound.endpoint, outbound.events),
            (LinkDirection::Inbound, inbound.endpoint, inbound.events),
        ] {
            let monitor = LivenessMonitor::new(
                direction,
                endpoint,
                relay_tx.clone(),
                Arc::clone(&deps.resolver),
            );
            monitors.spawn(monitor.run(events, shutdown.clone()));
        }

        let processor = CommandProcessor::new(
            agent_id.clone(),
            config,
            Arc::clone(&deps.store),
            Arc::clone(&supervisor),
            relay_tx,
            dispatch,
            Arc::clone(&state),
        );
        let relay = OutboundRelay::new(agent_id.clone(), outbound.channel);

        let mut relay_task = tokio::spawn(relay.run(relay_rx, shutdown.clone()));
        let mut processor_task =
            tokio::spawn(processor.run(inbound.channel, local, shutdown.clone()));
        let mut relay_done = false;
        let mut processor_done = false;

        info!(%agent_id, "waiting for detailed configuration from coordinator");
        let outcome = tokio::select! {
            joined = &mut relay_task => {
                relay_done = true;
                match joined {
                    Ok(()) => Ok(AgentExit::Shutdown),
                    Err(_) => Err(AgentError::TaskPanicked("outbound relay").into()),
                }
            }
            joined = &mut processor_task => {
                processor_done = true;
                match joined {
                    Ok(Ok(ProcessorExit::Deleted)) => Ok(AgentExit::Deleted),
                    Ok(Ok(ProcessorExit::Stopped)) => Ok(AgentExit::Shutdown),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(AgentError::TaskPanicked("command processor").into()),
                }
            }
            Some(fault) = fault_rx.recv() => Err(fault.into()),
            () = shutdown.cancelled() => {
                info!("shutdown requested");
                Ok(AgentExit::Shutdown)
            }
        };

        state.send_replace(AgentState::Terminating);
        if let Err(e) = &outcome {
            error!(error = %format!("{e:#}"), "stopping because a task failed");
        }
        debug!("stopping agent, hang on");
        shutdown.cancel();
        // Processor first: a reconcile in flight may still start a workload.
        if !processor_done {
            join_or_abort("command processor", processor_task).await;
        }
        supervisor.lock().await.stop().await;
        if !relay_done {
            join_or_abort("outbound relay", relay_task).await;
        }
        teardown(&mut monitors).await;
        outcome
    }
}

/// Join a cancelled task, aborting it if it does not finish in time.
async fn join_or_abort<T>(name: &str, task: JoinHandle<T>) {
    let abort = task.abort_handle();
    if tokio::time::timeout(TEARDOWN_TIMEOUT, task).await.is_err() {
        warn!(task = name, "task did not stop in time, aborting");
        abort.abort();
    }
}

/// Join cancelled tasks, aborting whatever is still running after the timeout.
async fn teardown<T: 'static>(tasks: &mut JoinSet<T>) {
    let drained = tokio::time::timeout(TEARDOWN_TIMEOUT, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = tasks.len(), "tasks did not stop in time, aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
}
