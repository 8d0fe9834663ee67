//! Agent identity.

use std::fmt;
use std::sync::Arc;

use hive_common::validate_agent_id;

use crate::domain::error::ProtocolError;

/// Identity assigned to the agent at provisioning time.
///
/// Used as the inbound topic filter and stamped into every outbound message.
/// Cloning is cheap; the identity never changes for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentId(Arc<str>);

impl AgentId {
    /// Validate and wrap an identity token.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is empty or contains whitespace.
    pub fn new(id: &str) -> Result<Self, ProtocolError> {
        validate_agent_id(id)?;
        Ok(Self(Arc::from(id)))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for AgentId {
    fn eq(&self, other: &str) -> bool {
        &*self.0 == other
    }
}
