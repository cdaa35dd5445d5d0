//! Reconciler: drives the cloud toward the declared machines.
//!
//! Each sync lists every provider, joins the cloud's machines against the
//! `Machine` table, writes learned identities and addresses back, and
//! boots, stops or re-addresses whatever does not match. Only once a pass
//! finds nothing to change are the ACLs pushed, so rules are never
//! computed from a stale machine list.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use stratus_db::*;
use stratus_foreman::{RoleLookup, annotate_roles};
use stratus_join::join;

use crate::acl::{compute_acls, instances_with_live_machines};
use crate::error::ProviderResult;
use crate::machine::CloudMachine;
use crate::myip::{MyIp, default_my_ip};
use crate::provider::{AclRule, CloudProvider, Instance, ProviderFactory};

/// Passes per sync. The second absorbs changes caused by the first (a
/// booted machine's addresses, say) without looping unboundedly.
const SYNC_PASSES: usize = 2;

/// Default sleep after a sync in which a cloud call failed.
pub const DEFAULT_FAILURE_BACKOFF: Duration = Duration::from_secs(60);

/// What one sync did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Counts cover only calls the provider accepted.
    pub booted: usize,
    pub stopped: usize,
    pub floating_ip_updates: usize,
    /// True if the machines converged and ACLs were pushed.
    pub acls_pushed: bool,
    /// True if any cloud call failed.
    pub failed: bool,
}

impl SyncReport {
    /// Fold a later sync into this one. ACL state is the later sync's.
    pub fn merge(&mut self, later: SyncReport) {
        self.booted += later.booted;
        self.stopped += later.stopped;
        self.floating_ip_updates += later.floating_ip_updates;
        self.acls_pushed = later.acls_pushed;
        self.failed |= later.failed;
    }

    /// True if the sync found nothing to change.
    pub fn is_quiet(&self) -> bool {
        self.booted + self.stopped + self.floating_ip_updates == 0 && !self.failed
    }
}

/// The declared-versus-cloud difference computed by one pass.
#[derive(Debug, Default)]
struct Plan {
    acl: Acl,
    machines: Vec<Machine>,
    boot: Vec<CloudMachine>,
    stop: Vec<CloudMachine>,
    update_ips: Vec<CloudMachine>,
}

impl Plan {
    fn converged(&self) -> bool {
        self.boot.is_empty() && self.stop.is_empty() && self.update_ips.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Boot,
    Stop,
    UpdateFloatingIps,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Boot => "boot",
            Action::Stop => "stop",
            Action::UpdateFloatingIps => "update floating IPs of",
        };
        f.write_str(s)
    }
}

/// Result of one batch of cloud calls.
#[derive(Debug, Default, Clone, Copy)]
struct Outcome {
    /// Machines in groups whose call succeeded.
    done: usize,
    failed: bool,
}

/// Reconciles one namespace.
pub struct Reconciler {
    conn: Conn,
    namespace: String,
    factory: Arc<dyn ProviderFactory>,
    providers: BTreeMap<Instance, Arc<dyn CloudProvider>>,
    my_ip: MyIp,
    failure_backoff: Duration,
}

impl Reconciler {
    /// Connect to every provider in every valid region. Instances that
    /// fail to connect are retried when an action needs them.
    pub fn new(conn: Conn, namespace: impl Into<String>, factory: Arc<dyn ProviderFactory>) -> Self {
        let mut reconciler = Self {
            conn,
            namespace: namespace.into(),
            factory,
            providers: BTreeMap::new(),
            my_ip: default_my_ip(),
            failure_backoff: DEFAULT_FAILURE_BACKOFF,
        };

        for provider in Provider::ALL {
            for region in reconciler.factory.valid_regions(provider) {
                let inst = Instance::new(provider, region);
                if let Err(e) = reconciler.get_provider(&inst) {
                    debug!(instance = %inst, error = %e, "failed to connect to provider");
                }
            }
        }

        info!(
            namespace = %reconciler.namespace,
            providers = reconciler.providers.len(),
            "reconciler created"
        );
        reconciler
    }

    /// Use `my_ip` to discover this daemon's address.
    pub fn with_my_ip(mut self, my_ip: MyIp) -> Self {
        self.my_ip = my_ip;
        self
    }

    /// Sleep this long after a sync in which a cloud call failed.
    pub fn with_failure_backoff(mut self, backoff: Duration) -> Self {
        self.failure_backoff = backoff;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// One sync. `roles` supplies the roles minions report, keyed by
    /// public IP.
    pub async fn run_once(&mut self, roles: &dyn RoleLookup) -> SyncReport {
        let mut report = SyncReport::default();

        for _ in 0..SYNC_PASSES {
            let Some(plan) = self.plan(roles).await else {
                break;
            };

            if plan.converged() {
                self.sync_acls(&plan.acl, &plan.machines).await;
                report.acls_pushed = true;
                break;
            }

            let booted = self.update_cloud(plan.boot, Action::Boot).await;
            let stopped = self.update_cloud(plan.stop, Action::Stop).await;
            let updated = self.update_cloud(plan.update_ips, Action::UpdateFloatingIps).await;

            report.booted += booted.done;
            report.stopped += stopped.done;
            report.floating_ip_updates += updated.done;
            report.failed |= booted.failed || stopped.failed || updated.failed;
        }

        if report.failed && !self.failure_backoff.is_zero() {
            info!(backoff = ?self.failure_backoff, "cloud calls failed, backing off");
            tokio::time::sleep(self.failure_backoff).await;
        }
        report
    }

    /// List the cloud and diff it against the database, writing back
    /// what the cloud taught us. `None` aborts the sync.
    async fn plan(&self, roles: &dyn RoleLookup) -> Option<Plan> {
        let cloud = match self.list_all().await {
            Ok(machines) => machines,
            Err(e) => {
                error!(error = %e, "failed to list machines");
                return None;
            }
        };
        let cloud = annotate_roles(roles, cloud);

        self.conn
            .txn(&[TableType::Acl, TableType::Cluster, TableType::Machine])
            .run(|view| {
                match view.cluster_namespace() {
                    Ok(ns) if ns == self.namespace => {}
                    Ok(ns) => {
                        debug!(old = %self.namespace, new = %ns, "namespace changed, aborting sync");
                        return None;
                    }
                    Err(e) => {
                        error!(error = %e, "failed to get namespace");
                        return None;
                    }
                }

                let acl = view.get_acl().unwrap_or_else(|e| {
                    debug!(error = %e, "no ACL row");
                    Acl::default()
                });

                let declared = view.select_from_machine(|_| true);
                let diff = diff_machines(declared, cloud);
                for dbm in diff.updated {
                    view.commit(dbm);
                }

                Some(Plan {
                    acl,
                    machines: view.select_from_machine(|_| true),
                    boot: diff.boot,
                    stop: diff.stop,
                    update_ips: diff.update_ips,
                })
            })
    }

    /// List every connected provider concurrently. Any failure fails the
    /// whole listing, since a partial view would stop healthy machines.
    async fn list_all(&self) -> ProviderResult<Vec<CloudMachine>> {
        let mut set = JoinSet::new();
        for (inst, provider) in &self.providers {
            let inst = inst.clone();
            let provider = Arc::clone(provider);
            set.spawn(async move {
                let result = provider.list().await;
                (inst, result)
            });
        }

        let mut listed = BTreeMap::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((inst, Ok(machines))) => {
                    listed.insert(inst, machines);
                }
                Ok((inst, Err(e))) => {
                    warn!(instance = %inst, error = %e, "list failed");
                    return Err(e);
                }
                Err(e) => {
                    return Err(crate::error::ProviderError::Api(format!(
                        "list task failed: {e}"
                    )));
                }
            }
        }

        Ok(listed.into_values().flatten().collect())
    }

    /// Apply `action` to `machines`, grouped by provider instance. Returns
    /// false if any group failed.
    async fn update_cloud(&mut self, machines: Vec<CloudMachine>, action: Action) -> Outcome {
        let mut outcome = Outcome::default();
        if machines.is_empty() {
            return outcome;
        }
        info!(count = machines.len(), "attempting to {action} machines");

        let mut grouped: BTreeMap<Instance, Vec<CloudMachine>> = BTreeMap::new();
        for m in machines {
            grouped.entry(Instance::of(&m)).or_default().push(m);
        }

        for (inst, group) in grouped {
            let provider = match self.get_provider(&inst) {
                Ok(p) => p,
                Err(e) => {
                    warn!(instance = %inst, error = %e, "provider unavailable");
                    outcome.failed = true;
                    continue;
                }
            };

            let result = match action {
                Action::Boot => provider.boot(&group).await,
                Action::Stop => provider.stop(&group).await,
                Action::UpdateFloatingIps => provider.update_floating_ips(&group).await,
            };

            match result {
                Ok(()) => outcome.done += group.len(),
                Err(e) => {
                    warn!(instance = %inst, error = %e, "unable to {action} machines");
                    outcome.failed = true;
                }
            }
        }

        if !outcome.failed {
            info!("successfully completed: {action} machines");
        }
        outcome
    }

    /// Push the rule set to every instance that has a live declared
    /// machine, and clear it everywhere else.
    async fn sync_acls(&self, acl: &Acl, machines: &[Machine]) {
        let my_ip = match (self.my_ip)().await {
            Ok(ip) => Some(ip),
            Err(e) => {
                error!(error = %e, "couldn't retrieve our IP address");
                None
            }
        };

        let rules = compute_acls(&acl.admin, &acl.application_ports, machines, my_ip.as_deref());
        let targets = instances_with_live_machines(machines);

        for (inst, provider) in &self.providers {
            let set: &[AclRule] = if targets.contains(inst) {
                rules.as_slice()
            } else {
                &[]
            };
            if let Err(e) = provider.set_acls(set).await {
                warn!(instance = %inst, error = %e, "could not update ACLs");
            }
        }
    }

    fn get_provider(&mut self, inst: &Instance) -> ProviderResult<Arc<dyn CloudProvider>> {
        if let Some(p) = self.providers.get(inst) {
            return Ok(Arc::clone(p));
        }
        let p = self
            .factory
            .new_provider(inst.provider, &self.namespace, &inst.region)?;
        self.providers.insert(inst.clone(), Arc::clone(&p));
        Ok(p)
    }
}

// ── Diff ──────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MachineDiff {
    /// Declared rows updated from their cloud counterpart.
    updated: Vec<Machine>,
    boot: Vec<CloudMachine>,
    stop: Vec<CloudMachine>,
    update_ips: Vec<CloudMachine>,
}

/// How well a declared row matches a cloud machine. Lower is better,
/// negative forbids the pair.
fn match_score(dbm: &Machine, cm: &CloudMachine) -> i32 {
    if dbm.provider != cm.provider {
        return -1;
    }
    if !dbm.region.is_empty() && dbm.region != cm.region {
        return -1;
    }
    // A machine still booting may not report its size or disk yet.
    if !dbm.size.is_empty() && !cm.size.is_empty() && dbm.size != cm.size {
        return -1;
    }
    if cm.disk_size != 0 && dbm.disk_size != cm.disk_size {
        return -1;
    }
    if cm.role != Role::None && cm.role != dbm.role {
        return -1;
    }
    if dbm.preemptible != cm.preemptible {
        return -1;
    }

    if !dbm.cloud_id.is_empty() && dbm.cloud_id == cm.id {
        0
    } else if !dbm.public_ip.is_empty() && dbm.public_ip == cm.public_ip {
        1
    } else if !dbm.private_ip.is_empty() && dbm.private_ip == cm.private_ip {
        2
    } else {
        3
    }
}

fn diff_machines(declared: Vec<Machine>, cloud: Vec<CloudMachine>) -> MachineDiff {
    let result = join(declared, cloud, match_score);
    let mut diff = MachineDiff::default();

    for dbm in result.lonely_lefts {
        diff.boot.push(CloudMachine {
            size: dbm.size,
            disk_size: dbm.disk_size,
            ssh_keys: dbm.ssh_keys,
            provider: dbm.provider,
            region: dbm.region,
            preemptible: dbm.preemptible,
            role: dbm.role,
            ..Default::default()
        });
    }

    diff.stop = result.lonely_rights;

    for (mut dbm, cm) in result.pairs {
        if dbm.cloud_id == cm.id && dbm.floating_ip != cm.floating_ip {
            let mut want = cm.clone();
            want.floating_ip = dbm.floating_ip.clone();
            diff.update_ips.push(want);
        }

        dbm.cloud_id = cm.id;
        dbm.public_ip = cm.public_ip;
        dbm.private_ip = cm.private_ip;
        // Just booted: cannot be connected yet.
        if dbm.public_ip.is_empty() {
            dbm.connected = false;
        }
        if !cm.size.is_empty() {
            dbm.size = cm.size;
        }
        if cm.disk_size != 0 {
            dbm.disk_size = cm.disk_size;
        }
        dbm.provider = cm.provider;
        dbm.region = cm.region;
        diff.updated.push(dbm);
    }

    diff
}
