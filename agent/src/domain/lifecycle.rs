//! Agent lifecycle states and exit outcomes.

use std::fmt;

/// Top-level agent state.
///
/// `Unconfigured → Configured → Running`, with `Restarting` entered on every
/// applied configuration and `Terminating` on deletion or escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgentState {
    /// No configuration received since process start.
    #[default]
    Unconfigured,
    /// A configuration is applied but its mode runs no workload.
    Configured,
    /// A workload is running.
    Running,
    /// Old workload stopping, new one about to start.
    Restarting,
    /// Shutting down for good.
    Terminating,
}

impl AgentState {
    /// Settled state after a reconciliation.
    #[must_use]
    pub fn after_reconcile(workload_started: bool) -> Self {
        if workload_started {
            AgentState::Running
        } else {
            AgentState::Configured
        }
    }
}

impl fmt::Display for AgentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentState::Unconfigured => "unconfigured",
            AgentState::Configured => "configured",
            AgentState::Running => "running",
            AgentState::Restarting => "restarting",
            AgentState::Terminating => "terminating",
        };
        f.write_str(s)
    }
}

/// How a non-failing agent run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExit {
    /// The coordinator deleted this agent.
    Deleted,
    /// Shutdown was requested locally (signal) or the channels closed.
    Shutdown,
}
