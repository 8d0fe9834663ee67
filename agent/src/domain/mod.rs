//! Domain layer: identity, message grammar, lifecycle states, typed errors.
//!
//! This module has zero imports from `crate::infra`, `crate::application`,
//! `tokio`, `std::fs`, or `std::net`. Everything here is synchronous and
//! takes data in, returning data out.

pub mod error;
pub mod identity;
pub mod lifecycle;
pub mod message;

pub use error::{AgentError, KeyError, ProtocolError};
pub use identity::AgentId;
pub use lifecycle::{AgentExit, AgentState};
pub use message::{Command, InboundMessage, OutboundMessage};
