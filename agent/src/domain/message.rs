//! Line grammar of the control channel.
//!
//! Coordinator → agent: `AGENT_ID COMMAND PAYLOAD`
//! Agent → coordinator: `TOPIC AGENT_ID [PAYLOAD]`
//! Local producer → agent: `TOPIC PAYLOAD`
//!
//! Only the first one (outbound) or two (inbound) spaces are significant;
//! payloads are carried verbatim.

use hive_common::{commands, topics};

use crate::domain::error::ProtocolError;
use crate::domain::identity::AgentId;

// ── Inbound ───────────────────────────────────────────────────────────────────

/// Command kinds the agent understands, decoded once at the channel boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Full configuration document, still unparsed.
    Config(String),
    /// Remove this agent.
    Delete,
    /// Anything else, handed to in-process listeners untouched.
    Other { name: String, payload: String },
}

impl Command {
    fn decode(name: &str, payload: &str) -> Self {
        match name {
            commands::CONFIG => Command::Config(payload.to_string()),
            commands::DELETE => Command::Delete,
            _ => Command::Other {
                name: name.to_string(),
                payload: payload.to_string(),
            },
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Command::Config(_) => commands::CONFIG,
            Command::Delete => commands::DELETE,
            Command::Other { name, .. } => name,
        }
    }
}

/// A coordinator message addressed to an agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub agent_id: String,
    pub command: Command,
}

impl InboundMessage {
    /// Split `AGENT_ID COMMAND PAYLOAD`. A missing payload is read as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the line has no identity or no command token.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let mut parts = line.splitn(3, ' ');
        let agent_id = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or(ProtocolError::Empty)?;
        let name = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProtocolError::MissingCommand(line.to_string()))?;
        let payload = parts.next().unwrap_or("");
        Ok(Self {
            agent_id: agent_id.to_string(),
            command: Command::decode(name, payload),
        })
    }

    /// Exact identity check. The transport filter is a prefix match, so
    /// `A10 ...` reaches an agent subscribed as `A1`.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::IdentityMismatch`] when the leading token is
    /// not this agent's identity.
    pub fn ensure_addressed_to(&self, id: &AgentId) -> Result<(), ProtocolError> {
        if *id == *self.agent_id {
            Ok(())
        } else {
            Err(ProtocolError::IdentityMismatch {
                expected: id.to_string(),
                received: self.agent_id.clone(),
            })
        }
    }
}

/// Wire form of a pass-through command on the local dispatch queue.
#[must_use]
pub fn dispatch_line(name: &str, payload: &str) -> String {
    format!("{name} {payload}")
}

// ── Outbound ──────────────────────────────────────────────────────────────────

/// A message on its way to the coordinator, before identity stamping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Option<String>,
}

impl OutboundMessage {
    /// An empty payload is treated as no payload.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: Option<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.filter(|p| !p.is_empty()),
        }
    }

    #[must_use]
    pub fn ping() -> Self {
        Self::new(topics::PING, None)
    }

    #[must_use]
    pub fn want_config() -> Self {
        Self::new(topics::WANT_CONFIG, None)
    }

    #[must_use]
    pub fn ip(address: &str) -> Self {
        Self::new(topics::IP, Some(address.to_string()))
    }

    /// Read a `TOPIC [PAYLOAD]` line from a local producer.
    ///
    /// Returns `None` for blank lines.
    #[must_use]
    pub fn parse_local(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            return None;
        }
        Some(match line.split_once(' ') {
            Some((topic, payload)) => Self::new(topic, Some(payload.to_string())),
            None => Self::new(line, None),
        })
    }

    /// Insert the agent identity after the topic: `TOPIC AGENT_ID [PAYLOAD]`.
    #[must_use]
    pub fn stamp(&self, id: &AgentId) -> String {
        match &self.payload {
            Some(payload) => format!("{} {id} {payload}", self.topic),
            None => format!("{} {id}", self.topic),
        }
    }
}

// ── Unit tests ────────────────────────────────────────────────────────────────
