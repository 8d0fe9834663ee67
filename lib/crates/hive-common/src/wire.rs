use thiserror::Error;

/// Topics an agent publishes to the coordinator.
///
/// Every agent → coordinator line has the shape `TOPIC AGENT_ID [PAYLOAD]`.
/// Pass-through topics produced by sensor workloads are not listed here; the
/// coordinator treats any unknown topic as workload traffic.
pub mod topics {
    /// Liveness heartbeat, also sent to acknowledge a received configuration.
    /// Format: `PING <agent_id>`
    pub const PING: &str = "PING";

    /// Best-guess local address of the agent host.
    /// Format: `IP <agent_id> <address-or-empty>`
    pub const IP: &str = "IP";

    /// Request for the full configuration document.
    /// Format: `WANT_CONFIG <agent_id>`
    pub const WANT_CONFIG: &str = "WANT_CONFIG";
}

/// Commands the coordinator sends to an agent.
///
/// Every coordinator → agent line has the shape `AGENT_ID COMMAND PAYLOAD`.
pub mod commands {
    /// Full configuration document (JSON) in the payload.
    pub const CONFIG: &str = "CONFIG";

    /// Remove the agent. Payload is ignored.
    pub const DELETE: &str = "DELETE";
}

/// Parameters of the encrypted control channel.
pub mod channel {
    /// Noise handshake pattern. The agent is the initiator and knows the
    /// coordinator's static key up front.
    pub const NOISE_PATTERN: &str = "Noise_IK_25519_ChaChaPoly_BLAKE2s";

    /// Length in bytes of a Curve25519 static key.
    pub const KEY_LEN: usize = 32;

    /// Largest single frame on the wire (2-byte length prefix).
    pub const MAX_FRAME_LEN: usize = 65_535;

    /// Poly1305 tag appended to every encrypted frame.
    pub const TAG_LEN: usize = 16;

    /// First frame a subscriber sends after the handshake.
    /// Format: `SUBSCRIBE <topic-filter>`
    pub const SUBSCRIBE: &str = "SUBSCRIBE";

    /// Fixed delay between reconnect attempts, in milliseconds.
    pub const RECONNECT_INTERVAL_MS: u64 = 2_000;

    /// Upper bound on a single TCP connect + handshake, in milliseconds.
    pub const CONNECT_TIMEOUT_MS: u64 = 5_000;
}

/// Rejected agent identity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidAgentId {
    #[error("agent id must not be empty")]
    Empty,
    #[error("agent id must not contain whitespace: {0:?}")]
    Whitespace(String),
}

/// Validate an agent identity before it is used as a topic filter.
///
/// Identities are single tokens in a space-delimited grammar, so any
/// whitespace would shift every following field.
pub fn validate_agent_id(id: &str) -> Result<(), InvalidAgentId> {
    if id.is_empty() {
        return Err(InvalidAgentId::Empty);
    }
    if id.chars().any(char::is_whitespace) {
        return Err(InvalidAgentId::Whitespace(id.to_string()));
    }
    Ok(())
}
