//! Infrastructure layer: concrete implementations of application port traits.
//!
//! This module contains all I/O-performing code: the encrypted coordinator
//! channels, key loading, configuration persistence, address discovery, the
//! local producer socket and process-backed workloads.
//!
//! Imports from `crate::domain` and `crate::application::ports` are allowed.
//! Imports from `crate::cli` are forbidden.

pub mod config_store;
pub mod keys;
#[cfg(unix)]
pub mod local_socket;
pub mod network;
pub mod noise;
pub mod process_workload;
pub mod transport;
