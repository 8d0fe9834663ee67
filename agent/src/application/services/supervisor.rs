//! Application service: workload supervisor.
//!
//! Owns at most one running sensor workload. Starting spawns it as its own
//! task; stopping asks nicely, waits out a grace period, then aborts the task
//! and waits a bounded time more. A workload that fails while nobody asked it
//! to stop is reported on the fault channel and brings the agent down.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use hive_common::{Configuration, Mode};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::application::ports::{Workload, WorkloadContext, WorkloadFactory};
use crate::domain::{AgentError, AgentId, OutboundMessage};

/// Time a workload gets to wind down after `stop()` before it is aborted.
pub const GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Time an aborted workload gets to finish before it is considered leaked.
pub const HARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Channels and identity handed to every workload the supervisor builds.
pub struct SupervisorLinks {
    pub agent_id: AgentId,
    pub public_ip: String,
    pub commands: broadcast::Sender<String>,
    pub events: mpsc::Sender<OutboundMessage>,
    pub faults: mpsc::UnboundedSender<AgentError>,
}

struct RunningWorkload {
    mode: Mode,
    workload: Arc<dyn Workload>,
    /// Set before a requested stop so the watcher does not report a fault.
    stopping: Arc<AtomicBool>,
    abort: AbortHandle,
    watcher: JoinHandle<()>,
}

pub struct WorkloadSupervisor {
    factory: Arc<dyn WorkloadFactory>,
    links: SupervisorLinks,
    grace: Duration,
    hard_timeout: Duration,
    current: Option<RunningWorkload>,
}

impl WorkloadSupervisor {
    #[must_use]
    pub fn new(factory: Arc<dyn WorkloadFactory>, links: SupervisorLinks) -> Self {
        Self {
            factory,
            links,
            grace: GRACE_PERIOD,
            hard_timeout: HARD_TIMEOUT,
            current: None,
        }
    }

    /// Override the stop timeouts.
    #[must_use]
    pub fn with_timeouts(mut self, grace: Duration, hard_timeout: Duration) -> Self {
        self.grace = grace;
        self.hard_timeout = hard_timeout;
        self
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|running| !running.watcher.is_finished())
    }

    #[must_use]
    pub fn current_mode(&self) -> Option<Mode> {
        self.current.as_ref().map(|running| running.mode)
    }

    /// Start the workload for `config.mode`, stopping any current one first.
    ///
    /// Returns `false` when the mode runs no workload.
    ///
    /// # Errors
    ///
    /// Returns an error if the factory cannot build a workload for the mode.
    pub async fn start(&mut self, config: &Configuration) -> Result<bool> {
        if self.current.is_some() {
            self.stop().await;
        }
        if config.mode.is_unset() {
            info!("agent has not been configured, awaiting configuration from coordinator");
            return Ok(false);
        }

        let mode = config.mode;
        let ctx = WorkloadContext {
            config: config.clone(),
            agent_id: self.links.agent_id.clone(),
            public_ip: self.links.public_ip.clone(),
            commands: self.links.commands.subscribe(),
            events: self.links.events.clone(),
        };
        let workload = self
            .factory
            .build(mode, ctx)
            .with_context(|| format!("building {mode} workload"))?;

        let stopping = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn({
            let workload = Arc::clone(&workload);
            async move { workload.start().await }
        });
        let abort = task.abort_handle();
        let watcher = tokio::spawn(watch(
            task,
            mode,
            Arc::clone(&stopping),
            self.links.faults.clone(),
        ));

        self.current = Some(RunningWorkload {
            mode,
            workload,
            stopping,
            abort,
            watcher,
        });
        info!(agent_id = %self.links.agent_id, %mode, "agent configured and running");
        Ok(true)
    }

    /// Stop the current workload, if any. Best effort: returns after at most
    /// grace period + hard timeout even if the workload never ends.
    pub async fn stop(&mut self) {
        let Some(mut running) = self.current.take() else {
            return;
        };
        debug!(mode = %running.mode, "stopping workload");
        running.stopping.store(true, Ordering::SeqCst);

        // One grace period covers both the stop request and the exit.
        let deadline = Instant::now() + self.grace;
        if tokio::time::timeout_at(deadline, running.workload.stop())
            .await
            .is_err()
        {
            warn!(mode = %running.mode, "workload stop request did not return promptly");
        }

        if tokio::time::timeout_at(deadline, &mut running.watcher)
            .await
            .is_ok()
        {
            info!(mode = %running.mode, "workload stopped");
            return;
        }

        warn!(
            mode = %running.mode,
            "workload still alive after {}s, terminating",
            self.grace.as_secs_f32()
        );
        running.abort.abort();
        if tokio::time::timeout(self.hard_timeout, &mut running.watcher)
            .await
            .is_err()
        {
            warn!(mode = %running.mode, "workload did not terminate, abandoning it");
        }
    }
}

/// Await the workload task and report anything that was not a requested stop.
async fn watch(
    task: JoinHandle<Result<()>>,
    mode: Mode,
    stopping: Arc<AtomicBool>,
    faults: mpsc::UnboundedSender<AgentError>,
) {
    let outcome = task.await;
    if stopping.load(Ordering::SeqCst) {
        log_stopped_outcome(mode, &outcome);
        return;
    }
    let fault = match outcome {
        Ok(Ok(())) => {
            warn!(%mode, "workload exited on its own");
            return;
        }
        Ok(Err(e)) => AgentError::WorkloadFault {
            mode,
            reason: format!("{e:#}"),
        },
        Err(e) if e.is_panic() => AgentError::WorkloadPanicked { mode },
        Err(_) => return,
    };
    error!(%mode, error = %fault, "workload died");
    let _ = faults.send(fault);
}

fn log_stopped_outcome(mode: Mode, outcome: &Result<Result<()>, JoinError>) {
    match outcome {
        Ok(Ok(())) => debug!(%mode, "workload exited after stop request"),
        Ok(Err(e)) => debug!(%mode, error = %format!("{e:#}"), "workload errored while stopping"),
        Err(e) if e.is_cancelled() => debug!(%mode, "workload task aborted"),
        Err(_) => debug!(%mode, "workload panicked while stopping"),
    }
}
