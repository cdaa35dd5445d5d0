//! stratusd: the Stratus daemon.
//!
//! Assembles the policy engine, the reconciler and the foreman around one
//! in-memory database:
//! - the blueprint watcher writes the blueprint onto the cluster row
//! - the policy engine derives declared machines and ACLs from it
//! - the orchestrator reconciles the cloud and polls the minions

pub mod blueprint;
pub mod config;
pub mod orchestrator;

pub use blueprint::{set_blueprint, watch_blueprint};
pub use config::{DaemonConfig, load_blueprint};
pub use orchestrator::{Orchestrator, Settings};
