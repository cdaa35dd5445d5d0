//! End-to-end: blueprint → policy engine → reconciler → foreman, against
//! the simulated cloud and an in-process fleet of minions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use stratus_cluster::*;
use stratus_db::*;
use stratus_foreman::*;
use stratusd::{Orchestrator, Settings, set_blueprint};

const MY_IP: &str = "5.6.7.8";

// ── Fake fleet ────────────────────────────────────────────────────

/// Every IP answers; configs pushed to a minion are what it reports next.
#[derive(Clone, Default)]
struct Fleet {
    configs: Arc<Mutex<HashMap<String, MinionConfig>>>,
}

impl Fleet {
    fn config(&self, ip: &str) -> MinionConfig {
        self.configs.lock().unwrap().get(ip).cloned().unwrap_or_default()
    }
}

struct FleetClient {
    ip: String,
    fleet: Fleet,
}

impl MinionClient for FleetClient {
    fn get_config(&self) -> RpcFuture<'_, MinionConfig> {
        let config = self.fleet.config(&self.ip);
        Box::pin(async move { Ok(config) })
    }

    fn set_config<'a>(&'a self, config: &'a MinionConfig) -> RpcFuture<'a, ()> {
        self.fleet
            .configs
            .lock()
            .unwrap()
            .insert(self.ip.clone(), config.clone());
        Box::pin(async { Ok(()) })
    }

    fn close(&self) {}
}

impl ClientFactory for Fleet {
    fn connect(&self, public_ip: &str) -> ForemanResult<Arc<dyn MinionClient>> {
        Ok(Arc::new(FleetClient {
            ip: public_ip.to_string(),
            fleet: self.clone(),
        }))
    }
}

// ── Helpers ───────────────────────────────────────────────────────

fn blueprint(namespace: &str, masters: usize, workers: usize) -> String {
    let machine = |role: &str| MachineSpec {
        role: role.into(),
        provider: "Amazon".into(),
        size: "m4.large".into(),
        ..Default::default()
    };
    let mut machines: Vec<MachineSpec> = (0..masters).map(|_| machine("Master")).collect();
    machines.extend((0..workers).map(|_| machine("Worker")));

    serde_json::to_string(&Blueprint {
        namespace: namespace.into(),
        machines,
        admin_acl: vec!["local".into()],
        ..Default::default()
    })
    .unwrap()
}

fn settings() -> Settings {
    Settings {
        poll_interval: Duration::from_secs(30),
        rate_limit: Duration::ZERO,
        failure_backoff: Duration::ZERO,
        my_ip: fixed_my_ip(MY_IP),
    }
}

struct Harness {
    conn: Conn,
    cloud: SimulatedCloud,
    fleet: Fleet,
    engine: PolicyEngine,
    orchestrator: Orchestrator,
}

impl Harness {
    fn new() -> Self {
        Self::on(SimulatedCloud::new())
    }

    /// A fresh daemon in front of an existing cloud.
    fn on(cloud: SimulatedCloud) -> Self {
        let conn = Conn::new();
        let fleet = Fleet::default();
        let engine = PolicyEngine::new(conn.clone()).with_my_ip(fixed_my_ip(MY_IP));
        let orchestrator = Orchestrator::new(
            conn.clone(),
            Arc::new(cloud.clone()),
            Arc::new(fleet.clone()),
            settings(),
        );
        Self {
            conn,
            cloud,
            fleet,
            engine,
            orchestrator,
        }
    }

    async fn deploy(&mut self, json: &str) -> Option<SyncReport> {
        set_blueprint(&self.conn, json);
        self.engine.run_once().await.unwrap();
        self.orchestrator.update_cluster().await
    }
}

// ── Tests ─────────────────────────────────────────────────────────

#[tokio::test]
async fn no_cluster_no_work() {
    let mut h = Harness::new();
    assert!(h.orchestrator.update_cluster().await.is_none());
    assert!(h.orchestrator.namespace().is_none());
}

#[tokio::test]
async fn deploys_blueprint_end_to_end() {
    let mut h = Harness::new();
    let report = h.deploy(&blueprint("prod", 1, 2)).await.unwrap();
    assert!(report.acls_pushed);
    assert_eq!(report.booted, 3);
    assert_eq!(h.orchestrator.namespace(), Some("prod"));

    let running = h.cloud.machines("prod");
    assert_eq!(running.len(), 3);

    let rows = h.conn.select_from_machine(|_| true);
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|m| m.is_live() && m.connected));

    let master = rows.iter().find(|m| m.role == Role::Master).unwrap();
    for row in &rows {
        let config = h.fleet.config(&row.public_ip);
        assert_eq!(config.role, row.role);
        assert_eq!(config.private_ip, row.private_ip);
        assert_eq!(config.etcd_members, vec![master.private_ip.clone()]);
    }

    let rules = h
        .cloud
        .acls("prod", &Instance::new(Provider::Amazon, "us-west-1"))
        .unwrap();
    assert!(rules.contains(&AclRule::all_ports(format!("{MY_IP}/32"))));
    assert_eq!(h.cloud.counts(), (3, 0));
}

#[tokio::test]
async fn shrinking_blueprint_stops_machines() {
    let mut h = Harness::new();
    h.deploy(&blueprint("prod", 1, 2)).await.unwrap();

    let report = h.deploy(&blueprint("prod", 1, 1)).await.unwrap();
    assert_eq!(report.stopped, 1);
    assert_eq!(report.booted, 0);
    assert_eq!(h.cloud.machines("prod").len(), 2);
    assert_eq!(h.conn.select_from_machine(|_| true).len(), 2);
}

#[tokio::test]
async fn empty_blueprint_from_fresh_daemon_stops_namespace() {
    let mut running = Harness::new();
    running.deploy(&blueprint("prod", 1, 2)).await.unwrap();
    running.deploy(&blueprint("staging", 1, 1)).await.unwrap();
    assert_eq!(running.cloud.machines("prod").len(), 3);

    // What `stratusd stop --namespace prod` does.
    let mut h = Harness::on(running.cloud.clone());
    set_blueprint(&h.conn, &blueprint("prod", 0, 0));
    h.engine.run_once().await.unwrap();
    let report = h.orchestrator.settle(5).await;

    assert_eq!(report.stopped, 3);
    assert_eq!(report.booted, 0);
    assert!(report.acls_pushed);
    assert!(!report.failed);
    assert!(h.cloud.machines("prod").is_empty());
    assert_eq!(h.cloud.machines("staging").len(), 2);
    assert!(h.conn.select_from_machine(|_| true).is_empty());
}

#[tokio::test]
async fn settle_stops_at_first_quiet_pass() {
    let mut h = Harness::new();
    set_blueprint(&h.conn, &blueprint("prod", 1, 1));
    h.engine.run_once().await.unwrap();

    let report = h.orchestrator.settle(5).await;
    assert_eq!(report.booted, 2);
    assert!(report.acls_pushed);

    // Nothing to do: one quiet pass and out.
    let before = h.cloud.counts();
    let report = h.orchestrator.settle(5).await;
    assert!(report.is_quiet());
    assert_eq!(h.cloud.counts(), before);
}

#[tokio::test]
async fn settle_without_cluster_is_empty() {
    let mut h = Harness::new();
    assert_eq!(h.orchestrator.settle(5).await, SyncReport::default());
}

#[tokio::test]
async fn steady_state_does_nothing() {
    let mut h = Harness::new();
    h.deploy(&blueprint("prod", 1, 1)).await.unwrap();
    let rows = h.conn.select_from_machine(|_| true);

    let report = h.deploy(&blueprint("prod", 1, 1)).await.unwrap();
    assert_eq!(report.booted + report.stopped + report.floating_ip_updates, 0);
    assert_eq!(h.conn.select_from_machine(|_| true), rows);
    assert_eq!(h.cloud.counts(), (2, 0));
}

#[tokio::test]
async fn namespace_change_starts_over() {
    let mut h = Harness::new();
    h.deploy(&blueprint("prod", 1, 1)).await.unwrap();

    h.deploy(&blueprint("staging", 1, 1)).await.unwrap();
    assert_eq!(h.orchestrator.namespace(), Some("staging"));
    assert_eq!(h.cloud.machines("staging").len(), 2);
}

#[tokio::test]
async fn run_stops_on_shutdown() {
    let h = Harness::new();
    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(h.orchestrator.run(rx));

    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
