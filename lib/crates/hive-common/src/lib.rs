pub mod config;
pub mod wire;

pub use config::{Configuration, CoordinatorEndpoints, Mode};
pub use wire::{InvalidAgentId, channel, commands, topics, validate_agent_id};
