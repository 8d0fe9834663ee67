//! Application services: the agent's concurrent tasks.
//!
//! Each service module implements one task by composing domain logic with
//! port trait calls. Services import only from `crate::domain` and
//! `crate::application::ports`, never from `crate::infra`.

pub mod agent;
pub mod command_processor;
pub mod liveness;
pub mod relay;
pub mod supervisor;
