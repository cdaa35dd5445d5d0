//! stratus-cluster: cloud-side reconciliation.
//!
//! The [`Reconciler`] makes each cloud provider run exactly the machines
//! declared in the database, learning their addresses as they boot and
//! keeping the ACLs in step. The [`PolicyEngine`] produces those declared
//! machines from the cluster blueprint. Real cloud adapters plug in
//! through [`CloudProvider`] and [`ProviderFactory`]; [`SimulatedCloud`]
//! is an in-memory stand-in.

pub mod acl;
pub mod error;
pub mod machine;
pub mod myip;
pub mod policy;
pub mod provider;
pub mod reconciler;
pub mod sim;

pub use acl::{compute_acls, instances_with_live_machines};
pub use error::{PolicyError, PolicyResult, ProviderError, ProviderResult};
pub use machine::{CloudMachine, Range, choose_size, default_region, valid_regions};
pub use myip::{MyIp, default_my_ip, fixed_my_ip};
pub use policy::{Blueprint, ConnectionSpec, MachineSpec, PolicyEngine, resolve_machines};
pub use provider::{AclRule, CloudProvider, Instance, ProviderFactory, ProviderFuture};
pub use reconciler::{Reconciler, SyncReport};
pub use sim::SimulatedCloud;
