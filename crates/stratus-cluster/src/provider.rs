//! The cloud provider contract.
//!
//! One [`CloudProvider`] instance manages one namespace in one region of
//! one cloud. Adapters for real clouds live outside this crate; the
//! reconciler only sees these traits.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use stratus_db::Provider;

use crate::error::ProviderResult;
use crate::machine::CloudMachine;

/// Boxed future returned by provider calls.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = ProviderResult<T>> + Send + 'a>>;

/// A provider in a region: the unit the reconciler connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Instance {
    pub provider: Provider,
    pub region: String,
}

impl Instance {
    pub fn new(provider: Provider, region: impl Into<String>) -> Self {
        Self {
            provider,
            region: region.into(),
        }
    }

    pub fn of(m: &CloudMachine) -> Self {
        Self::new(m.provider, m.region.clone())
    }
}

impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.provider, self.region)
    }
}

/// Traffic allowed into managed machines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AclRule {
    pub cidr_ip: String,
    pub min_port: u16,
    pub max_port: u16,
}

impl AclRule {
    /// Allow every port from `cidr_ip`.
    pub fn all_ports(cidr_ip: impl Into<String>) -> Self {
        Self {
            cidr_ip: cidr_ip.into(),
            min_port: 1,
            max_port: 65535,
        }
    }
}

/// Operations a cloud adapter supports.
pub trait CloudProvider: Send + Sync {
    /// Every machine in this provider's namespace and region.
    fn list(&self) -> ProviderFuture<'_, Vec<CloudMachine>>;

    /// Boot `machines`, returning once they appear in [`list`](Self::list)
    /// or an internal timeout expires.
    fn boot<'a>(&'a self, machines: &'a [CloudMachine]) -> ProviderFuture<'a, ()>;

    /// Stop `machines`, returning once they are gone from `list`.
    fn stop<'a>(&'a self, machines: &'a [CloudMachine]) -> ProviderFuture<'a, ()>;

    /// Replace the ingress rules.
    fn set_acls<'a>(&'a self, acls: &'a [AclRule]) -> ProviderFuture<'a, ()>;

    /// Attach each machine's `floating_ip`. May be unsupported.
    fn update_floating_ips<'a>(&'a self, machines: &'a [CloudMachine]) -> ProviderFuture<'a, ()>;
}

/// Creates provider instances. Injected so tests can use a fake cloud.
pub trait ProviderFactory: Send + Sync {
    fn new_provider(
        &self,
        provider: Provider,
        namespace: &str,
        region: &str,
    ) -> ProviderResult<Arc<dyn CloudProvider>>;

    /// Regions to connect to for `provider`.
    fn valid_regions(&self, provider: Provider) -> Vec<String>;
}
