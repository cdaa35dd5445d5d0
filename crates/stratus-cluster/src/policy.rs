//! Policy engine: turns the cluster blueprint into declared rows.
//!
//! The blueprint is JSON stored on the `Cluster` row. Each time the
//! cluster, machine or ACL tables change (and at least every 30 seconds)
//! the engine re-derives the declared machines and the ACL from it. Rows
//! that still match the blueprint are kept, so addresses and cloud ids
//! learned by the reconciler survive an unchanged blueprint.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use stratus_db::*;
use stratus_join::join;

use crate::error::PolicyResult;
use crate::machine::{Range, choose_size, with_default_region};
use crate::myip::{MyIp, default_my_ip};

/// Disk size, in GB, for machines that do not ask for one.
pub const DEFAULT_DISK_SIZE: u32 = 32;

/// Connection source meaning "the public internet".
pub const PUBLIC_INTERNET_LABEL: &str = "public";

/// Admin ACL entry resolved to this daemon's address.
const LOCAL_ADMIN: &str = "local";

const POLICY_INTERVAL_SECS: u64 = 30;

// ── Blueprint ─────────────────────────────────────────────────────

/// The deployment a user asked for.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Blueprint {
    pub namespace: String,
    pub machines: Vec<MachineSpec>,
    /// CIDRs allowed full access. `local` means this daemon.
    pub admin_acl: Vec<String>,
    pub connections: Vec<ConnectionSpec>,
    /// Hourly price cap used when choosing sizes. Zero is unbounded.
    pub max_price: f64,
}

impl Blueprint {
    pub fn from_json(json: &str) -> PolicyResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    fn wants_local_admin(&self) -> bool {
        self.admin_acl.iter().any(|a| a == LOCAL_ADMIN)
    }
}

/// One machine in a blueprint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineSpec {
    pub role: String,
    pub provider: String,
    /// Chosen from `ram` and `cpu` when empty.
    pub size: String,
    pub region: String,
    pub ram: Range,
    pub cpu: Range,
    pub disk_size: u32,
    pub ssh_keys: Vec<String>,
    pub floating_ip: String,
    /// Ask for a spot instance.
    pub preemptible: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSpec {
    pub from: String,
    pub to: String,
    pub min_port: u16,
    pub max_port: u16,
}

// ── Resolution ────────────────────────────────────────────────────

/// Turn blueprint machines into rows to compare against the table.
///
/// A machine with a bad role or provider, or with no size that fits its
/// constraints, is skipped alone. A blueprint with masters but no workers,
/// or workers but no masters, resolves to nothing.
pub fn resolve_machines(specs: &[MachineSpec], max_price: f64) -> Vec<Machine> {
    let mut has_master = false;
    let mut has_worker = false;
    let mut machines = Vec::new();

    for spec in specs {
        let role: Role = match spec.role.parse() {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "error parsing role");
                continue;
            }
        };
        has_master |= role == Role::Master;
        has_worker |= role == Role::Worker;

        let provider: Provider = match spec.provider.parse() {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "error parsing provider");
                continue;
            }
        };

        let size = if spec.size.is_empty() {
            match choose_size(provider, spec.ram, spec.cpu, max_price) {
                Some(s) => s,
                None => {
                    error!(%provider, ram = ?spec.ram, cpu = ?spec.cpu, "no valid size, skipping");
                    continue;
                }
            }
        } else {
            spec.size.clone()
        };

        let disk_size = if spec.disk_size == 0 {
            DEFAULT_DISK_SIZE
        } else {
            spec.disk_size
        };

        machines.push(with_default_region(Machine {
            role,
            provider,
            region: spec.region.clone(),
            size,
            disk_size,
            ssh_keys: spec.ssh_keys.clone(),
            floating_ip: spec.floating_ip.clone(),
            preemptible: spec.preemptible,
            ..Default::default()
        }));
    }

    if has_master && !has_worker {
        warn!("a master was specified but no workers");
        return Vec::new();
    }
    if has_worker && !has_master {
        warn!("a worker was specified but no masters");
        return Vec::new();
    }
    machines
}

/// How well an existing row fits a declared machine. Rows the reconciler
/// has filled in are preferred so they are kept.
fn policy_score(declared: &Machine, row: &Machine) -> i32 {
    if row.provider != declared.provider
        || row.region != declared.region
        || (!row.size.is_empty() && row.size != declared.size)
        || (row.role != Role::None && row.role != declared.role)
        || row.disk_size != declared.disk_size
        || row.preemptible != declared.preemptible
    {
        return -1;
    }
    if row.private_ip.is_empty() {
        2
    } else if row.public_ip.is_empty() {
        1
    } else {
        0
    }
}

/// Write `blueprint` into the cluster, machine and ACL tables.
///
/// `my_ip` resolves `local` admin entries; without it they are dropped.
pub fn apply_blueprint(view: &mut Database<'_>, blueprint: &Blueprint, my_ip: Option<&str>) {
    let mut cluster = match view.get_cluster() {
        Ok(c) => c,
        Err(_) => view.insert::<Cluster>(),
    };
    cluster.namespace = blueprint.namespace.clone();
    view.commit(cluster);

    apply_machines(view, blueprint);
    apply_acl(view, blueprint, my_ip);
}

fn apply_machines(view: &mut Database<'_>, blueprint: &Blueprint) {
    let declared = resolve_machines(&blueprint.machines, blueprint.max_price);
    let rows = view.select_from_machine(|_| true);

    let result = join(declared, rows, policy_score);

    for row in &result.lonely_rights {
        debug!(machine = %row, "removing undeclared machine");
        view.remove(row);
    }

    let mut pairs = result.pairs;
    for want in result.lonely_lefts {
        let row = view.insert::<Machine>();
        pairs.push((want, row));
    }

    for (want, mut row) in pairs {
        row.role = want.role;
        row.size = want.size;
        row.disk_size = want.disk_size;
        row.provider = want.provider;
        row.region = want.region;
        row.ssh_keys = want.ssh_keys;
        row.floating_ip = want.floating_ip;
        row.preemptible = want.preemptible;
        view.commit(row);
    }
}

fn apply_acl(view: &mut Database<'_>, blueprint: &Blueprint, my_ip: Option<&str>) {
    let mut acl = match view.get_acl() {
        Ok(a) => a,
        Err(_) => view.insert::<Acl>(),
    };

    acl.admin = blueprint
        .admin_acl
        .iter()
        .filter_map(|entry| {
            if entry != LOCAL_ADMIN {
                return Some(entry.clone());
            }
            match my_ip {
                Some(ip) => Some(format!("{ip}/32")),
                None => {
                    warn!("failed to get IP address, dropping local admin ACL");
                    None
                }
            }
        })
        .collect();

    acl.application_ports = blueprint
        .connections
        .iter()
        .filter(|c| c.from == PUBLIC_INTERNET_LABEL)
        .map(|c| PortRange {
            min_port: c.min_port,
            max_port: c.max_port,
        })
        .collect();

    view.commit(acl);
}

/// Parse the blueprint on the cluster row and apply it.
pub fn update_policy(view: &mut Database<'_>, my_ip: Option<&str>) -> PolicyResult<()> {
    let cluster = view.get_cluster()?;
    let blueprint = Blueprint::from_json(&cluster.blueprint)?;
    apply_blueprint(view, &blueprint, my_ip);
    Ok(())
}

// ── Engine loop ───────────────────────────────────────────────────

/// Keeps the declared rows in step with the blueprint.
pub struct PolicyEngine {
    conn: Conn,
    my_ip: MyIp,
    interval_secs: u64,
}

impl PolicyEngine {
    pub fn new(conn: Conn) -> Self {
        Self {
            conn,
            my_ip: default_my_ip(),
            interval_secs: POLICY_INTERVAL_SECS,
        }
    }

    pub fn with_my_ip(mut self, my_ip: MyIp) -> Self {
        self.my_ip = my_ip;
        self
    }

    /// Apply the current blueprint once.
    pub async fn run_once(&self) -> PolicyResult<()> {
        let blueprint = self
            .conn
            .txn(&[TableType::Cluster])
            .run(|view| -> PolicyResult<Blueprint> {
                Blueprint::from_json(&view.get_cluster()?.blueprint)
            })?;

        // Only look our address up when the blueprint needs it.
        let my_ip = if blueprint.wants_local_admin() {
            match (self.my_ip)().await {
                Ok(ip) => Some(ip),
                Err(e) => {
                    warn!(error = %e, "failed to get IP address");
                    None
                }
            }
        } else {
            None
        };

        self.conn
            .txn(&[TableType::Acl, TableType::Cluster, TableType::Machine])
            .run(|view| update_policy(view, my_ip.as_deref()))
    }

    /// Run until `shutdown` flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut trigger = self.conn.trigger_tick(
            self.interval_secs,
            &[TableType::Cluster, TableType::Machine, TableType::Acl],
        );
        info!(interval_secs = self.interval_secs, "policy engine started");

        loop {
            tokio::select! {
                signal = trigger.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "failed to apply blueprint");
                    }
                }
                _ = shutdown.changed() => {
                    info!("policy engine shutting down");
                    break;
                }
            }
        }
        trigger.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::myip::fixed_my_ip;

    fn spec(role: &str, provider: &str, size: &str) -> MachineSpec {
        MachineSpec {
            role: role.into(),
            provider: provider.into(),
            size: size.into(),
            ..Default::default()
        }
    }

    fn replicate(role: &str, n: usize) -> Vec<MachineSpec> {
        (0..n).map(|_| spec(role, "Amazon", "m4.large")).collect()
    }

    fn blueprint(masters: usize, workers: usize) -> Blueprint {
        let mut machines = replicate("Master", masters);
        machines.extend(replicate("Worker", workers));
        Blueprint {
            namespace: "namespace".into(),
            machines,
            admin_acl: vec!["1.2.3.4/32".into()],
            ..Default::default()
        }
    }

    fn count(conn: &Conn, role: Role) -> usize {
        conn.select_from_machine(|m| m.role == role).len()
    }

    fn apply(conn: &Conn, bp: &Blueprint, my_ip: Option<&str>) {
        conn.txn(&[TableType::Acl, TableType::Cluster, TableType::Machine])
            .run(|view| apply_blueprint(view, bp, my_ip));
    }

    #[test]
    fn resolve_fills_defaults() {
        let machines = resolve_machines(
            &[spec("Master", "Amazon", "m4.large"), spec("Worker", "Google", "")],
            0.0,
        );
        assert_eq!(machines.len(), 2);
        assert_eq!(machines[0].region, "us-west-1");
        assert_eq!(machines[0].disk_size, DEFAULT_DISK_SIZE);
        assert_eq!(machines[1].region, "us-east1-b");
        assert!(!machines[1].size.is_empty());
    }

    #[test]
    fn resolve_skips_bad_machines() {
        let machines = resolve_machines(
            &[
                spec("Master", "Amazon", "m4.large"),
                spec("Worker", "Amazon", "m4.large"),
                spec("Boss", "Amazon", "m4.large"),
                spec("Worker", "Rackspace", "m4.large"),
            ],
            0.0,
        );
        assert_eq!(machines.len(), 2);
    }

    #[test]
    fn resolve_requires_both_roles() {
        assert!(resolve_machines(&replicate("Master", 2), 0.0).is_empty());
        assert!(resolve_machines(&replicate("Worker", 2), 0.0).is_empty());
    }

    #[test]
    fn blueprint_grows_and_shrinks() {
        let conn = Conn::new();

        apply(&conn, &blueprint(2, 3), None);
        assert_eq!(count(&conn, Role::Master), 2);
        assert_eq!(count(&conn, Role::Worker), 3);
        assert_eq!(conn.cluster_namespace().unwrap(), "namespace");

        apply(&conn, &blueprint(4, 5), None);
        assert_eq!(count(&conn, Role::Master), 4);
        assert_eq!(count(&conn, Role::Worker), 5);

        apply(&conn, &blueprint(1, 1), None);
        assert_eq!(count(&conn, Role::Master), 1);
        assert_eq!(count(&conn, Role::Worker), 1);
    }

    #[test]
    fn learned_fields_survive_unchanged_blueprint() {
        let conn = Conn::new();
        let bp = blueprint(1, 2);
        apply(&conn, &bp, None);

        conn.txn(&[TableType::Machine]).run(|view| {
            for mut m in view.select_from_machine(|_| true) {
                m.cloud_id = format!("i-{}", m.id);
                m.public_ip = "2.2.2.2".into();
                m.private_ip = "10.0.0.2".into();
                view.commit(m);
            }
        });
        let before = conn.select_from_machine(|_| true);

        apply(&conn, &bp, None);
        assert_eq!(conn.select_from_machine(|_| true), before);
    }

    #[test]
    fn switching_to_preemptible_replaces_the_row() {
        let conn = Conn::new();
        let mut bp = blueprint(1, 1);
        apply(&conn, &bp, None);
        let before = conn.select_from_machine(|m| m.role == Role::Worker);

        bp.machines[1].preemptible = true;
        apply(&conn, &bp, None);

        let workers = conn.select_from_machine(|m| m.role == Role::Worker);
        assert_eq!(workers.len(), 1);
        assert!(workers[0].preemptible);
        assert_ne!(workers[0].id, before[0].id);
        assert_eq!(count(&conn, Role::Master), 1);
    }

    #[test]
    fn acl_from_blueprint() {
        let conn = Conn::new();
        let mut bp = blueprint(1, 1);
        bp.admin_acl.push("local".into());
        bp.connections = vec![
            ConnectionSpec {
                from: "public".into(),
                to: "web".into(),
                min_port: 80,
                max_port: 80,
            },
            ConnectionSpec {
                from: "web".into(),
                to: "db".into(),
                min_port: 5432,
                max_port: 5432,
            },
        ];

        apply(&conn, &bp, Some("5.6.7.8"));
        let acl = conn.txn(&[TableType::Acl]).run(|view| view.get_acl()).unwrap();
        assert_eq!(acl.admin, vec!["1.2.3.4/32".to_string(), "5.6.7.8/32".to_string()]);
        assert_eq!(
            acl.application_ports,
            vec![PortRange {
                min_port: 80,
                max_port: 80
            }]
        );

        apply(&conn, &bp, None);
        let acl = conn.txn(&[TableType::Acl]).run(|view| view.get_acl()).unwrap();
        assert_eq!(acl.admin, vec!["1.2.3.4/32".to_string()]);
    }

    #[test]
    fn blueprint_json_defaults() {
        let bp = Blueprint::from_json(
            r#"{"namespace": "ns", "machines": [{"role": "Master", "provider": "Amazon"}]}"#,
        )
        .unwrap();
        assert_eq!(bp.namespace, "ns");
        assert_eq!(bp.machines[0].ram, Range::default());
        assert!(bp.admin_acl.is_empty());
        assert!(Blueprint::from_json("not json").is_err());
    }

    #[tokio::test]
    async fn engine_applies_cluster_blueprint() {
        let conn = Conn::new();
        let mut bp = blueprint(1, 1);
        bp.admin_acl = vec!["local".into()];
        let json = serde_json::to_string(&bp).unwrap();
        conn.txn(&[TableType::Cluster]).run(|view| {
            let mut c = view.insert::<Cluster>();
            c.blueprint = json;
            view.commit(c);
        });

        let engine = PolicyEngine::new(conn.clone()).with_my_ip(fixed_my_ip("9.9.9.9"));
        engine.run_once().await.unwrap();

        assert_eq!(conn.select_from_machine(|_| true).len(), 2);
        let acl = conn.txn(&[TableType::Acl]).run(|view| view.get_acl()).unwrap();
        assert_eq!(acl.admin, vec!["9.9.9.9/32".to_string()]);
    }

    #[tokio::test]
    async fn engine_without_cluster_row_errors() {
        let engine = PolicyEngine::new(Conn::new()).with_my_ip(fixed_my_ip("9.9.9.9"));
        assert!(engine.run_once().await.is_err());
    }
}
