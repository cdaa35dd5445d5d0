//! An in-memory cloud.
//!
//! `SimulatedCloud` stands in for every provider at once: booting assigns
//! an id and both IP addresses immediately, and stopping removes the
//! machine. Failures can be injected per provider instance. The daemon
//! uses it for dry runs; the tests use it as their fake cloud.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use stratus_db::Provider;

use crate::error::{ProviderError, ProviderResult};
use crate::machine::{CloudMachine, valid_regions};
use crate::provider::{AclRule, CloudProvider, Instance, ProviderFactory, ProviderFuture};

#[derive(Default)]
struct SimState {
    /// Machines keyed by (namespace, instance).
    machines: BTreeMap<(String, Instance), Vec<CloudMachine>>,
    acls: HashMap<(String, Instance), Vec<AclRule>>,
    failing: BTreeSet<Instance>,
    unavailable: BTreeSet<Provider>,
    counter: u32,
    boots: usize,
    stops: usize,
}

/// Shared handle to the simulated cloud. Clones see the same state.
#[derive(Clone, Default)]
pub struct SimulatedCloud {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Every machine in `namespace`, across all instances.
    pub fn machines(&self, namespace: &str) -> Vec<CloudMachine> {
        self.state()
            .machines
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .flat_map(|(_, ms)| ms.iter().cloned())
            .collect()
    }

    /// The rules last set on `instance`, if any were set.
    pub fn acls(&self, namespace: &str, instance: &Instance) -> Option<Vec<AclRule>> {
        self.state()
            .acls
            .get(&(namespace.to_string(), instance.clone()))
            .cloned()
    }

    /// Place a machine directly, as if booted out of band.
    pub fn insert(&self, namespace: &str, machine: CloudMachine) -> CloudMachine {
        let mut state = self.state();
        let machine = state.assign(machine);
        state
            .machines
            .entry((namespace.to_string(), Instance::of(&machine)))
            .or_default()
            .push(machine.clone());
        machine
    }

    /// Make boot, stop and floating IP calls on `instance` fail.
    pub fn set_failing(&self, instance: Instance, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing.insert(instance);
        } else {
            state.failing.remove(&instance);
        }
    }

    /// Refuse to create providers of this kind.
    pub fn set_unavailable(&self, provider: Provider, unavailable: bool) {
        let mut state = self.state();
        if unavailable {
            state.unavailable.insert(provider);
        } else {
            state.unavailable.remove(&provider);
        }
    }

    /// Total machines booted and stopped so far.
    pub fn counts(&self) -> (usize, usize) {
        let state = self.state();
        (state.boots, state.stops)
    }
}

impl SimState {
    /// Give a machine an identity and addresses if it has none.
    fn assign(&mut self, mut m: CloudMachine) -> CloudMachine {
        self.counter += 1;
        let n = self.counter;
        if m.id.is_empty() {
            m.id = format!("sim-{n}");
        }
        if m.public_ip.is_empty() {
            m.public_ip = format!("198.51.{}.{}", n / 250, n % 250 + 1);
        }
        if m.private_ip.is_empty() {
            m.private_ip = format!("10.0.{}.{}", n / 250, n % 250 + 1);
        }
        m
    }
}

impl ProviderFactory for SimulatedCloud {
    fn new_provider(
        &self,
        provider: Provider,
        namespace: &str,
        region: &str,
    ) -> ProviderResult<Arc<dyn CloudProvider>> {
        if self.state().unavailable.contains(&provider) {
            return Err(ProviderError::Unavailable(format!("{provider} is disabled")));
        }
        Ok(Arc::new(SimulatedProvider {
            cloud: self.clone(),
            namespace: namespace.to_string(),
            instance: Instance::new(provider, region),
        }))
    }

    fn valid_regions(&self, provider: Provider) -> Vec<String> {
        valid_regions(provider)
    }
}

/// One simulated provider instance.
pub struct SimulatedProvider {
    cloud: SimulatedCloud,
    namespace: String,
    instance: Instance,
}

impl SimulatedProvider {
    fn key(&self) -> (String, Instance) {
        (self.namespace.clone(), self.instance.clone())
    }

    fn check_failing(&self, state: &SimState, op: &str) -> ProviderResult<()> {
        if state.failing.contains(&self.instance) {
            return Err(ProviderError::Api(format!("{op} failed on {}", self.instance)));
        }
        Ok(())
    }

    fn boot_now(&self, machines: &[CloudMachine]) -> ProviderResult<()> {
        let mut state = self.cloud.state();
        self.check_failing(&state, "boot")?;
        for m in machines {
            let mut m = m.clone();
            m.provider = self.instance.provider;
            m.region = self.instance.region.clone();
            m.role = Default::default();
            let m = state.assign(m);
            debug!(machine = %m, "simulated boot");
            state.machines.entry(self.key()).or_default().push(m);
            state.boots += 1;
        }
        Ok(())
    }

    fn stop_now(&self, machines: &[CloudMachine]) -> ProviderResult<()> {
        let mut state = self.cloud.state();
        self.check_failing(&state, "stop")?;
        let ids: BTreeSet<&str> = machines.iter().map(|m| m.id.as_str()).collect();

        let mut stopped = 0;
        if let Some(running) = state.machines.get_mut(&self.key()) {
            let before = running.len();
            running.retain(|m| !ids.contains(m.id.as_str()));
            stopped = before - running.len();
        }
        state.stops += stopped;
        Ok(())
    }

    fn update_floating_ips_now(&self, machines: &[CloudMachine]) -> ProviderResult<()> {
        match self.instance.provider {
            Provider::Amazon | Provider::Google => {}
            other => {
                return Err(ProviderError::Unsupported(format!(
                    "floating IPs on {other}"
                )));
            }
        }

        let mut state = self.cloud.state();
        self.check_failing(&state, "update floating IPs")?;
        if let Some(running) = state.machines.get_mut(&self.key()) {
            for m in running.iter_mut() {
                if let Some(want) = machines.iter().find(|w| w.id == m.id) {
                    m.floating_ip = want.floating_ip.clone();
                }
            }
        }
        Ok(())
    }
}

impl CloudProvider for SimulatedProvider {
    fn list(&self) -> ProviderFuture<'_, Vec<CloudMachine>> {
        let machines = self
            .cloud
            .state()
            .machines
            .get(&self.key())
            .cloned()
            .unwrap_or_default();
        Box::pin(async move { Ok(machines) })
    }

    fn boot<'a>(&'a self, machines: &'a [CloudMachine]) -> ProviderFuture<'a, ()> {
        let result = self.boot_now(machines);
        Box::pin(async move { result })
    }

    fn stop<'a>(&'a self, machines: &'a [CloudMachine]) -> ProviderFuture<'a, ()> {
        let result = self.stop_now(machines);
        Box::pin(async move { result })
    }

    fn set_acls<'a>(&'a self, acls: &'a [AclRule]) -> ProviderFuture<'a, ()> {
        self.cloud.state().acls.insert(self.key(), acls.to_vec());
        Box::pin(async { Ok(()) })
    }

    fn update_floating_ips<'a>(&'a self, machines: &'a [CloudMachine]) -> ProviderFuture<'a, ()> {
        let result = self.update_floating_ips_now(machines);
        Box::pin(async move { result })
    }
}
