//! Port trait definitions for the Application layer.
//!
//! Ports are the interfaces (contracts) that infrastructure must fulfill.
//! This file imports only from `crate::domain` and `hive_common`, never from
//! `crate::infra`.
//!
//! Ports that end up inside spawned tasks use `async_trait` so their futures
//! are `Send`.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use hive_common::{Configuration, Mode};
use tokio::sync::{broadcast, mpsc};

use crate::domain::{AgentId, OutboundMessage};

// ── Value Types ───────────────────────────────────────────────────────────────

/// Connect/disconnect transition reported by a transport connection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
}

/// Which of the two coordinator connections a link event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkDirection {
    /// Agent → coordinator (publish).
    Outbound,
    /// Coordinator → agent (subscribe).
    Inbound,
}

/// Everything a workload gets at spawn time. The configuration is a copy;
/// later reconciliations never reach a running workload.
#[derive(Debug)]
pub struct WorkloadContext {
    pub config: Configuration,
    pub agent_id: AgentId,
    /// Address from the external-IP resolver, empty when unknown.
    pub public_ip: String,
    /// Pass-through coordinator commands as `COMMAND PAYLOAD`.
    pub commands: broadcast::Receiver<String>,
    /// Events for the coordinator; the relay stamps the identity.
    pub events: mpsc::Sender<OutboundMessage>,
}

// ── Channel Ports ─────────────────────────────────────────────────────────────

/// Authenticated agent → coordinator channel.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Queue one wire line for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel has been closed or the line can never
    /// be delivered (e.g. larger than one frame).
    async fn send(&self, line: String) -> Result<()>;
}

/// Authenticated coordinator → agent channel, already topic-filtered.
#[async_trait]
pub trait MessageSource: Send {
    /// Next inbound line. Cancel-safe. `None` once the channel is closed.
    async fn recv(&mut self) -> Option<String>;
}

#[async_trait]
impl MessageSource for mpsc::Receiver<String> {
    async fn recv(&mut self) -> Option<String> {
        mpsc::Receiver::recv(self).await
    }
}

// ── State Port ────────────────────────────────────────────────────────────────

/// Abstracts persistence of the last applied configuration document.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Load the stored document, returning `None` if nothing is stored.
    async fn load(&self) -> Result<Option<Configuration>>;
    /// Durably replace the stored document.
    async fn save(&self, config: &Configuration) -> Result<()>;
}

// ── Workload Ports ────────────────────────────────────────────────────────────

/// A sensor-mode workload.
#[async_trait]
pub trait Workload: Send + Sync {
    /// Run until stopped. Returning an error reports a fault.
    async fn start(&self) -> Result<()>;
    /// Ask the workload to wind down. Must return promptly.
    async fn stop(&self);
}

/// Builds the workload for a mode.
pub trait WorkloadFactory: Send + Sync {
    /// Build (but do not start) the workload for `mode`, which is never
    /// [`Mode::Unset`].
    ///
    /// # Errors
    ///
    /// Returns an error if this agent cannot run `mode`.
    fn build(&self, mode: Mode, ctx: WorkloadContext) -> Result<Arc<dyn Workload>>;
}

// ── Network Port ──────────────────────────────────────────────────────────────

/// Abstracts address discovery so services can be tested without a network.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    /// Best-guess local address, empty when it cannot be determined.
    async fn local_address(&self) -> String;
    /// Public address as seen by an external service.
    ///
    /// # Errors
    ///
    /// Returns an error on timeout or connection failure.
    async fn public_address(&self) -> Result<String>;
}
