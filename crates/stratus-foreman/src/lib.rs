//! stratus-foreman: minion liveness and configuration.
//!
//! The foreman keeps one RPC client per live machine, notices when minions
//! come and go, learns the roles they report, and pushes each one the
//! configuration it should run (role, etcd peers, blueprint, keys).
//!
//! # Components
//!
//! - **`client`**: the `MinionClient`/`ClientFactory` contract and an
//!   HTTP/JSON implementation
//! - **`foreman`**: the per-cycle mark-and-sweep, fetch and push logic

pub mod client;
pub mod error;
pub mod foreman;

pub use client::{
    ClientFactory, DEFAULT_MINION_PORT, DEFAULT_RPC_TIMEOUT, HttpClientFactory, HttpMinionClient,
    MinionClient, MinionConfig, RpcFuture,
};
pub use error::{ForemanError, ForemanResult};
pub use foreman::{Foreman, RoleAnnotated, RoleLookup, annotate_roles};
