//! Foreman behaviour against an in-process fake fleet of minions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use stratus_db::*;
use stratus_foreman::*;

// ── Fake fleet ────────────────────────────────────────────────────

#[derive(Default)]
struct FakeMinion {
    config: MinionConfig,
    reachable: bool,
    pushes: usize,
    closes: usize,
}

#[derive(Clone, Default)]
struct FakeFleet {
    minions: Arc<Mutex<HashMap<String, FakeMinion>>>,
}

impl FakeFleet {
    fn add(&self, ip: &str, role: Role) {
        let minion = FakeMinion {
            config: MinionConfig {
                role,
                ..Default::default()
            },
            reachable: true,
            ..Default::default()
        };
        self.minions.lock().unwrap().insert(ip.to_string(), minion);
    }

    fn set_reachable(&self, ip: &str, reachable: bool) {
        self.minions.lock().unwrap().get_mut(ip).unwrap().reachable = reachable;
    }

    fn pushes(&self, ip: &str) -> usize {
        self.minions.lock().unwrap()[ip].pushes
    }

    fn closes(&self, ip: &str) -> usize {
        self.minions.lock().unwrap()[ip].closes
    }

    fn config(&self, ip: &str) -> MinionConfig {
        self.minions.lock().unwrap()[ip].config.clone()
    }
}

struct FakeClient {
    ip: String,
    fleet: FakeFleet,
}

impl MinionClient for FakeClient {
    fn get_config(&self) -> RpcFuture<'_, MinionConfig> {
        let result = match self.fleet.minions.lock().unwrap().get(&self.ip) {
            Some(m) if m.reachable => Ok(m.config.clone()),
            _ => Err(ForemanError::Rpc("unreachable".into())),
        };
        Box::pin(async move { result })
    }

    fn set_config<'a>(&'a self, config: &'a MinionConfig) -> RpcFuture<'a, ()> {
        let result = match self.fleet.minions.lock().unwrap().get_mut(&self.ip) {
            Some(m) if m.reachable => {
                m.pushes += 1;
                m.config = config.clone();
                Ok(())
            }
            _ => Err(ForemanError::Rpc("unreachable".into())),
        };
        Box::pin(async move { result })
    }

    fn close(&self) {
        if let Some(m) = self.fleet.minions.lock().unwrap().get_mut(&self.ip) {
            m.closes += 1;
        }
    }
}

impl ClientFactory for FakeFleet {
    fn connect(&self, public_ip: &str) -> ForemanResult<Arc<dyn MinionClient>> {
        Ok(Arc::new(FakeClient {
            ip: public_ip.to_string(),
            fleet: self.clone(),
        }))
    }
}

// ── Helpers ───────────────────────────────────────────────────────

fn insert_machine(conn: &Conn, role: Role, public_ip: &str, private_ip: &str) -> Machine {
    conn.txn(&[TableType::Machine]).run(|view| {
        let mut m: Machine = view.insert();
        m.role = role;
        m.provider = Provider::Amazon;
        m.region = "us-west-1".into();
        m.size = "m4.large".into();
        m.cloud_id = format!("i-{}", m.id);
        m.public_ip = public_ip.into();
        m.private_ip = private_ip.into();
        view.commit(m.clone());
        m
    })
}

fn machine_row(conn: &Conn, id: RowId) -> Machine {
    conn.select_from_machine(|m| m.id == id).pop().unwrap()
}

fn set_up() -> (Conn, FakeFleet, Foreman) {
    let conn = Conn::new();
    let fleet = FakeFleet::default();
    let foreman = Foreman::new(conn.clone(), Arc::new(fleet.clone()));
    (conn, fleet, foreman)
}

// ── Tests ─────────────────────────────────────────────────────────

#[tokio::test]
async fn tracks_exactly_the_live_machines() {
    let (conn, fleet, mut foreman) = set_up();
    fleet.add("1.1.1.1", Role::None);
    fleet.add("2.2.2.2", Role::None);
    insert_machine(&conn, Role::Master, "1.1.1.1", "10.0.0.1");
    insert_machine(&conn, Role::Worker, "2.2.2.2", "");
    insert_machine(&conn, Role::Worker, "", "");

    foreman.run_once().await;

    let tracked: Vec<String> = foreman.tracked().into_iter().collect();
    assert_eq!(tracked, vec!["1.1.1.1".to_string()]);
}

#[tokio::test]
async fn evicts_machines_that_leave_the_declared_set() {
    let (conn, fleet, mut foreman) = set_up();
    fleet.add("1.1.1.1", Role::None);
    fleet.add("2.2.2.2", Role::None);
    let a = insert_machine(&conn, Role::Master, "1.1.1.1", "10.0.0.1");
    insert_machine(&conn, Role::Worker, "2.2.2.2", "10.0.0.2");

    foreman.run_once().await;
    assert_eq!(foreman.tracked().len(), 2);

    conn.txn(&[TableType::Machine]).run(|view| view.remove(&a));
    foreman.run_once().await;

    let tracked: Vec<String> = foreman.tracked().into_iter().collect();
    assert_eq!(tracked, vec!["2.2.2.2".to_string()]);
    assert_eq!(fleet.closes("1.1.1.1"), 1);
    assert_eq!(fleet.closes("2.2.2.2"), 0);
    assert!(foreman.is_connected("2.2.2.2"));
}

#[tokio::test]
async fn connectivity_flips_are_persisted() {
    let (conn, fleet, mut foreman) = set_up();
    fleet.add("1.1.1.1", Role::None);
    let m = insert_machine(&conn, Role::Worker, "1.1.1.1", "10.0.0.1");

    foreman.run_once().await;
    assert!(machine_row(&conn, m.id).connected);

    fleet.set_reachable("1.1.1.1", false);
    foreman.run_once().await;
    assert!(!machine_row(&conn, m.id).connected);
    assert!(!foreman.is_connected("1.1.1.1"));
    // Still live, so still tracked.
    assert_eq!(foreman.tracked().len(), 1);
}

#[tokio::test]
async fn pushes_etcd_members_and_blueprint() {
    let (conn, fleet, mut foreman) = set_up();
    conn.txn(&[TableType::Cluster]).run(|view| {
        let mut c: Cluster = view.insert();
        c.namespace = "ns".into();
        c.blueprint = "{\"machines\":[]}".into();
        view.commit(c);
    });

    for ip in ["1.1.1.1", "2.2.2.2", "3.3.3.3"] {
        fleet.add(ip, Role::None);
    }
    insert_machine(&conn, Role::Master, "2.2.2.2", "10.0.0.2");
    insert_machine(&conn, Role::Master, "1.1.1.1", "10.0.0.1");
    insert_machine(&conn, Role::Worker, "3.3.3.3", "10.0.0.3");

    foreman.run_once().await;

    let worker = fleet.config("3.3.3.3");
    assert_eq!(worker.role, Role::Worker);
    assert_eq!(worker.private_ip, "10.0.0.3");
    assert_eq!(worker.provider, "Amazon");
    assert_eq!(worker.blueprint, "{\"machines\":[]}");
    assert_eq!(
        worker.etcd_members,
        vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]
    );
    assert_eq!(fleet.config("1.1.1.1").role, Role::Master);
}

#[tokio::test]
async fn second_cycle_without_changes_pushes_nothing() {
    let (conn, fleet, mut foreman) = set_up();
    fleet.add("1.1.1.1", Role::None);
    fleet.add("2.2.2.2", Role::None);
    insert_machine(&conn, Role::Master, "1.1.1.1", "10.0.0.1");
    insert_machine(&conn, Role::Worker, "2.2.2.2", "10.0.0.2");

    foreman.run_once().await;
    assert_eq!(fleet.pushes("1.1.1.1"), 1);
    assert_eq!(fleet.pushes("2.2.2.2"), 1);

    foreman.run_once().await;
    assert_eq!(fleet.pushes("1.1.1.1"), 1);
    assert_eq!(fleet.pushes("2.2.2.2"), 1);
}

#[tokio::test]
async fn unreachable_minions_are_not_pushed() {
    let (conn, fleet, mut foreman) = set_up();
    fleet.add("1.1.1.1", Role::None);
    fleet.set_reachable("1.1.1.1", false);
    insert_machine(&conn, Role::Worker, "1.1.1.1", "10.0.0.1");

    foreman.run_once().await;
    assert_eq!(fleet.pushes("1.1.1.1"), 0);
    assert!(!foreman.is_connected("1.1.1.1"));
}

#[tokio::test]
async fn init_adopts_reported_roles() {
    let (conn, fleet, mut foreman) = set_up();
    fleet.add("1.1.1.1", Role::Worker);
    fleet.add("2.2.2.2", Role::None);
    let reports = insert_machine(&conn, Role::None, "1.1.1.1", "10.0.0.1");
    let silent = insert_machine(&conn, Role::None, "2.2.2.2", "10.0.0.2");

    foreman.init().await;

    let row = machine_row(&conn, reports.id);
    assert_eq!(row.role, Role::Worker);
    assert!(row.connected);

    let row = machine_row(&conn, silent.id);
    assert_eq!(row.role, Role::None);
    assert!(!row.connected);
}

#[tokio::test]
async fn init_closes_previous_clients() {
    let (conn, fleet, mut foreman) = set_up();
    fleet.add("1.1.1.1", Role::None);
    insert_machine(&conn, Role::Worker, "1.1.1.1", "10.0.0.1");

    foreman.run_once().await;
    foreman.init().await;

    assert_eq!(fleet.closes("1.1.1.1"), 1);
    assert_eq!(foreman.tracked().len(), 1);
}

struct CloudBox {
    ip: String,
    role: Role,
}

impl RoleAnnotated for CloudBox {
    fn public_ip(&self) -> &str {
        &self.ip
    }

    fn set_role(&mut self, role: Role) {
        self.role = role;
    }
}

#[tokio::test]
async fn machine_roles_come_from_minion_reports() {
    let (conn, fleet, mut foreman) = set_up();
    fleet.add("1.1.1.1", Role::Master);
    insert_machine(&conn, Role::None, "1.1.1.1", "10.0.0.1");
    foreman.init().await;

    let boxes = vec![
        CloudBox {
            ip: "1.1.1.1".into(),
            role: Role::Worker,
        },
        CloudBox {
            ip: "9.9.9.9".into(),
            role: Role::Worker,
        },
    ];
    let annotated = foreman.get_machine_roles(boxes);

    assert_eq!(annotated[0].role, Role::Master);
    assert_eq!(annotated[1].role, Role::None);
}
