//! Foreman: tracks every live machine's minion and keeps its config
//! current.
//!
//! Each cycle the foreman re-reads the live machine set, evicts clients of
//! machines that are gone, fetches every minion's config in parallel,
//! records connectivity changes, and pushes a fresh config to each
//! connected minion whose reported config is out of date.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use stratus_db::*;

use crate::client::{ClientFactory, MinionClient, MinionConfig};
use crate::error::ForemanResult;

/// Answers "what role does the minion at this public IP report?".
pub trait RoleLookup: Send + Sync {
    fn role_of(&self, public_ip: &str) -> Role;
}

impl RoleLookup for HashMap<String, Role> {
    fn role_of(&self, public_ip: &str) -> Role {
        self.get(public_ip).copied().unwrap_or_default()
    }
}

/// Anything keyed by public IP that can carry a role.
pub trait RoleAnnotated {
    fn public_ip(&self) -> &str;
    fn set_role(&mut self, role: Role);
}

/// Set each machine's role from `lookup`. Unknown machines get
/// [`Role::None`].
pub fn annotate_roles<M: RoleAnnotated>(lookup: &dyn RoleLookup, mut machines: Vec<M>) -> Vec<M> {
    for m in &mut machines {
        let role = lookup.role_of(m.public_ip());
        m.set_role(role);
    }
    machines
}

/// Per-machine state owned by the foreman.
struct Minion {
    client: Arc<dyn MinionClient>,
    machine: Machine,
    /// Last config the minion reported (or was successfully pushed).
    config: MinionConfig,
    connected: bool,
}

/// Keeps an RPC client per live machine, keyed by public IP.
pub struct Foreman {
    conn: Conn,
    factory: Arc<dyn ClientFactory>,
    minions: HashMap<String, Minion>,
}

impl Foreman {
    pub fn new(conn: Conn, factory: Arc<dyn ClientFactory>) -> Self {
        Self {
            conn,
            factory,
            minions: HashMap::new(),
        }
    }

    /// Rebuild from scratch and adopt the roles minions already report.
    ///
    /// Meant for the first cycle of a namespace: a restarted daemon learns
    /// the roles it assigned before instead of deciding them again.
    pub async fn init(&mut self) {
        for (ip, minion) in self.minions.drain() {
            minion.client.close();
            debug!(%ip, "closed minion client");
        }

        let machines = self.conn.select_from_machine(Machine::is_live);
        self.update_minion_map(machines);
        self.fetch_all().await;

        let minions = &self.minions;
        self.conn.txn(&[TableType::Machine]).run(|view| {
            for mut m in view.select_from_machine(Machine::is_live) {
                let Some(minion) = minions.get(&m.public_ip) else {
                    continue;
                };
                if minion.connected && minion.config.role != Role::None {
                    m.role = minion.config.role;
                    m.connected = true;
                    view.commit(m);
                }
            }
        });

        info!(tracked = self.minions.len(), "foreman initialised");
    }

    /// One poll cycle.
    pub async fn run_once(&mut self) {
        let (blueprint, machines) = self
            .conn
            .txn(&[TableType::Cluster, TableType::Machine])
            .run(|view| {
                let blueprint = view.get_cluster().map(|c| c.blueprint).unwrap_or_default();
                (blueprint, view.select_from_machine(Machine::is_live))
            });

        self.update_minion_map(machines);
        self.fetch_all().await;
        self.persist_connectivity();

        let etcd_members = self.etcd_members();
        self.push_all(&blueprint, &etcd_members).await;
    }

    /// Roles the tracked minions report, for machines keyed by public IP.
    pub fn get_machine_roles<M: RoleAnnotated>(&self, machines: Vec<M>) -> Vec<M> {
        annotate_roles(self, machines)
    }

    /// Public IPs of every tracked machine.
    pub fn tracked(&self) -> BTreeSet<String> {
        self.minions.keys().cloned().collect()
    }

    /// Whether the minion at `public_ip` answered the last fetch.
    pub fn is_connected(&self, public_ip: &str) -> bool {
        self.minions.get(public_ip).is_some_and(|m| m.connected)
    }

    /// Close every client. The foreman is empty afterwards.
    pub fn shutdown(&mut self) {
        for (_, minion) in self.minions.drain() {
            minion.client.close();
        }
    }

    // ── Cycle phases ──────────────────────────────────────────────

    /// Mark and sweep: evict clients of machines no longer live, open
    /// clients for newly live ones, refresh the row of the rest.
    fn update_minion_map(&mut self, machines: Vec<Machine>) {
        let wanted: HashSet<&str> = machines.iter().map(|m| m.public_ip.as_str()).collect();
        let stale: Vec<String> = self
            .minions
            .keys()
            .filter(|ip| !wanted.contains(ip.as_str()))
            .cloned()
            .collect();

        for ip in stale {
            if let Some(minion) = self.minions.remove(&ip) {
                minion.client.close();
                info!(%ip, "machine no longer live, evicted minion");
            }
        }

        for machine in machines {
            if let Some(minion) = self.minions.get_mut(&machine.public_ip) {
                minion.machine = machine;
                continue;
            }

            match self.factory.connect(&machine.public_ip) {
                Ok(client) => {
                    debug!(ip = %machine.public_ip, "tracking new minion");
                    self.minions.insert(
                        machine.public_ip.clone(),
                        Minion {
                            client,
                            machine,
                            config: MinionConfig::default(),
                            connected: false,
                        },
                    );
                }
                Err(e) => {
                    debug!(ip = %machine.public_ip, error = %e, "failed to create minion client");
                }
            }
        }
    }

    /// Fetch every tracked minion's config concurrently.
    async fn fetch_all(&mut self) {
        let mut set = JoinSet::new();
        for (ip, minion) in &self.minions {
            let ip = ip.clone();
            let client = Arc::clone(&minion.client);
            set.spawn(async move {
                let result = client.get_config().await;
                (ip, result)
            });
        }

        let results = join_all(set).await;
        for (ip, result) in results {
            let Some(minion) = self.minions.get_mut(&ip) else {
                continue;
            };

            let connected = result.is_ok();
            match (&result, minion.connected) {
                (Ok(_), false) => debug!(%ip, "new minion connection"),
                (Err(e), true) => error!(%ip, error = %e, "lost connection to minion"),
                (Err(e), false) => debug!(%ip, error = %e, "minion not reachable"),
                (Ok(_), true) => {}
            }

            minion.connected = connected;
            minion.config = result.unwrap_or_default();
        }
    }

    /// Write connectivity flips back, one small transaction per machine.
    fn persist_connectivity(&mut self) {
        for minion in self.minions.values_mut() {
            if minion.machine.connected == minion.connected {
                continue;
            }

            let id = minion.machine.id;
            let connected = minion.connected;
            self.conn.txn(&[TableType::Machine]).run(|view| {
                if let Some(mut row) = view.select_from_machine(|m| m.id == id).pop() {
                    row.connected = connected;
                    view.commit(row);
                }
            });
            minion.machine.connected = connected;
        }
    }

    /// Private IPs of tracked masters, sorted.
    fn etcd_members(&self) -> Vec<String> {
        let mut ips: Vec<String> = self
            .minions
            .values()
            .filter(|m| m.machine.role == Role::Master && !m.machine.private_ip.is_empty())
            .map(|m| m.machine.private_ip.clone())
            .collect();
        ips.sort();
        ips
    }

    /// Push configs to connected minions whose config is out of date.
    async fn push_all(&mut self, blueprint: &str, etcd_members: &[String]) {
        let mut set = JoinSet::new();
        for (ip, minion) in &self.minions {
            if !minion.connected {
                continue;
            }

            let desired = desired_config(&minion.machine, blueprint, etcd_members);
            if desired == minion.config {
                continue;
            }

            let ip = ip.clone();
            let client = Arc::clone(&minion.client);
            set.spawn(async move {
                let result: ForemanResult<()> = client.set_config(&desired).await;
                (ip, result.map(|()| desired))
            });
        }

        for (ip, result) in join_all(set).await {
            match result {
                Ok(config) => {
                    debug!(%ip, "pushed minion config");
                    if let Some(minion) = self.minions.get_mut(&ip) {
                        minion.config = config;
                    }
                }
                Err(e) => warn!(%ip, error = %e, "failed to push minion config"),
            }
        }
    }
}

impl RoleLookup for Foreman {
    fn role_of(&self, public_ip: &str) -> Role {
        self.minions
            .get(public_ip)
            .map(|m| m.config.role)
            .unwrap_or_default()
    }
}

impl Drop for Foreman {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The config a minion should be running with.
fn desired_config(machine: &Machine, blueprint: &str, etcd_members: &[String]) -> MinionConfig {
    MinionConfig {
        role: machine.role,
        private_ip: machine.private_ip.clone(),
        floating_ip: machine.floating_ip.clone(),
        blueprint: blueprint.to_string(),
        provider: machine.provider.to_string(),
        size: machine.size.clone(),
        region: machine.region.clone(),
        etcd_members: etcd_members.to_vec(),
        authorized_keys: machine.ssh_keys.clone(),
    }
}

/// Wait for every task; a panicked task is logged and dropped.
async fn join_all<T: 'static>(mut set: JoinSet<T>) -> Vec<T> {
    let mut out = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(value) => out.push(value),
            Err(e) => error!(error = %e, "minion rpc task failed"),
        }
    }
    out
}
