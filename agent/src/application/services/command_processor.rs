//! Application service: inbound command processor.
//!
//! Multiplexes the coordinator channel and the optional local producer queue.
//! Coordinator commands drive configuration reconciliation and the workload
//! lifecycle; local lines are forwarded to the relay unchanged.
//!
//! Reconciliation order is fixed: persist → stop old workload → start new
//! workload → set the config-received latch.

use std::future;
use std::sync::Arc;

use anyhow::{Context, Result};
use hive_common::Configuration;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::ports::{ConfigStore, MessageSource};
use crate::application::services::relay::offer;
use crate::application::services::supervisor::WorkloadSupervisor;
use crate::domain::message::dispatch_line;
use crate::domain::{AgentId, AgentState, Command, InboundMessage, OutboundMessage, ProtocolError};

/// What the processor loop should do after one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// The coordinator deleted this agent; the workload is already stopped.
    Delete,
}

/// Why the processor loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessorExit {
    Deleted,
    /// Shutdown was requested or the coordinator channel closed.
    Stopped,
}

pub struct CommandProcessor<C: ?Sized> {
    agent_id: AgentId,
    config: Configuration,
    config_received: bool,
    store: Arc<C>,
    supervisor: Arc<Mutex<WorkloadSupervisor>>,
    relay: mpsc::Sender<OutboundMessage>,
    dispatch: broadcast::Sender<String>,
    state: Arc<watch::Sender<AgentState>>,
}

impl<C: ConfigStore + ?Sized> CommandProcessor<C> {
    #[must_use]
    pub fn new(
        agent_id: AgentId,
        config: Configuration,
        store: Arc<C>,
        supervisor: Arc<Mutex<WorkloadSupervisor>>,
        relay: mpsc::Sender<OutboundMessage>,
        dispatch: broadcast::Sender<String>,
        state: Arc<watch::Sender<AgentState>>,
    ) -> Self {
        Self {
            agent_id,
            config,
            config_received: false,
            store,
            supervisor,
            relay,
            dispatch,
            state,
        }
    }

    /// Configuration currently applied in memory.
    #[must_use]
    pub fn config(&self) -> &Configuration {
        &self.config
    }

    #[must_use]
    pub fn config_received(&self) -> bool {
        self.config_received
    }

    /// Process until deletion, shutdown, or the coordinator channel closes.
    ///
    /// # Errors
    ///
    /// Returns an error only for conditions that must take the agent down:
    /// configuration persistence failure or a workload that cannot be built.
    pub async fn run<S: MessageSource>(
        mut self,
        mut remote: S,
        mut local: Option<mpsc::Receiver<String>>,
        shutdown: CancellationToken,
    ) -> Result<ProcessorExit> {
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return Ok(ProcessorExit::Stopped),
                line = remote.recv() => {
                    let Some(line) = line else {
                        debug!("coordinator channel closed");
                        return Ok(ProcessorExit::Stopped);
                    };
                    if self.handle_remote(&line).await? == Flow::Delete {
                        return Ok(ProcessorExit::Deleted);
                    }
                }
                line = next_local(&mut local) => match line {
                    Some(line) => self.handle_local(&line),
                    None => {
                        debug!("local producer queue closed");
                        local = None;
                    }
                },
            }
        }
    }

    /// Apply one coordinator message.
    ///
    /// Protocol violations are logged and discarded without touching any
    /// state.
    ///
    /// # Errors
    ///
    /// See [`CommandProcessor::run`].
    pub async fn handle_remote(&mut self, line: &str) -> Result<Flow> {
        let msg = match InboundMessage::parse(line)
            .and_then(|msg| msg.ensure_addressed_to(&self.agent_id).map(|()| msg))
        {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, "discarding coordinator message");
                return Ok(Flow::Continue);
            }
        };
        debug!(command = msg.command.name(), "received command");

        match msg.command {
            Command::Config(payload) => {
                self.reconcile(&payload).await?;
                Ok(Flow::Continue)
            }
            Command::Delete => {
                self.delete().await;
                Ok(Flow::Delete)
            }
            Command::Other { name, payload } => {
                // No listener is fine; broadcast only fails when nobody subscribed.
                let _ = self.dispatch.send(dispatch_line(&name, &payload));
                Ok(Flow::Continue)
            }
        }
    }

    /// Forward one local producer line to the relay.
    pub fn handle_local(&self, line: &str) {
        let Some(msg) = OutboundMessage::parse_local(line) else {
            return;
        };
        if !offer(&self.relay, msg) {
            warn!("relay queue closed, dropping local message");
        }
    }

    async fn reconcile(&mut self, payload: &str) -> Result<()> {
        self.acknowledge();

        let config = match self.parse_config(payload) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "discarding configuration");
                return Ok(());
            }
        };
        if self.config_received && config == self.config {
            debug!("configuration unchanged");
            return Ok(());
        }

        info!(mode = %config.mode, "applying new configuration");
        self.store
            .save(&config)
            .await
            .context("persisting configuration")?;
        self.config = config;

        self.state.send_replace(AgentState::Restarting);
        let started = {
            let mut supervisor = self.supervisor.lock().await;
            supervisor.stop().await;
            supervisor.start(&self.config).await?
        };
        self.config_received = true;
        self.state.send_replace(AgentState::after_reconcile(started));
        Ok(())
    }

    fn parse_config(&self, payload: &str) -> Result<Configuration, ProtocolError> {
        let config = Configuration::from_json(payload)
            .map_err(|e| ProtocolError::InvalidConfig(e.to_string()))?;
        if self.agent_id != *config.id {
            return Err(ProtocolError::IdentityMismatch {
                expected: self.agent_id.to_string(),
                received: config.id,
            });
        }
        Ok(config)
    }

    fn acknowledge(&self) {
        if !offer(&self.relay, OutboundMessage::ping()) {
            warn!("relay queue closed, configuration not acknowledged");
        }
    }

    async fn delete(&mut self) {
        self.state.send_replace(AgentState::Terminating);
        self.supervisor.lock().await.stop().await;
        warn!(agent_id = %self.agent_id, "agent has been deleted by the coordinator");
    }
}

async fn next_local(local: &mut Option<mpsc::Receiver<String>>) -> Option<String> {
    match local {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}
