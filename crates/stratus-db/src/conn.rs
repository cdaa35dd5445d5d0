//! Conn: the in-memory transactional database.
//!
//! Each table sits behind its own mutex. A [`Transaction`] is scoped to a
//! fixed set of tables and locks them in ascending order of
//! [`TableType::name`], so two transactions over overlapping tables always
//! contend in the same order and cannot deadlock.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::trace;

use crate::error::{DbError, DbResult, LookupError};
use crate::lookup::find_by_prefix;
use crate::tables::{Row, Table, TableType};
use crate::trigger::Trigger;
use crate::types::*;

/// Process-wide row id counter. Ids are never reused, even across `Conn`s.
static NEXT_ID: Mutex<RowId> = Mutex::new(0);

fn next_id() -> RowId {
    let mut id = NEXT_ID.lock().unwrap_or_else(PoisonError::into_inner);
    *id += 1;
    *id
}

/// Handle to a database. Cheap to clone; clones share the same tables.
#[derive(Clone)]
pub struct Conn {
    tables: Arc<BTreeMap<TableType, Mutex<Table>>>,
}

impl Default for Conn {
    fn default() -> Self {
        Self::new()
    }
}

impl Conn {
    /// Create a database with every table allocated and empty.
    pub fn new() -> Self {
        let tables = TableType::ALL
            .iter()
            .map(|t| (*t, Mutex::new(Table::default())))
            .collect();
        Self {
            tables: Arc::new(tables),
        }
    }

    fn lock(&self, table: TableType) -> MutexGuard<'_, Table> {
        match self.tables.get(&table) {
            Some(m) => match m.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    m.clear_poison();
                    let mut guard = poisoned.into_inner();
                    // Writes left behind by a panicked transaction wake
                    // watchers once, then the table is clean again.
                    if guard.should_alert {
                        trace!(%table, "recovered poisoned table, alerting triggers");
                    }
                    guard.alert();
                    guard
                }
            },
            None => panic!("table {table} not allocated"),
        }
    }

    /// A transaction scoped to exactly `tables`.
    pub fn txn(&self, tables: &[TableType]) -> Transaction<'_> {
        let mut scope = tables.to_vec();
        scope.sort_by_key(|t| t.name());
        scope.dedup();
        Transaction { conn: self, scope }
    }

    /// Register a trigger woken whenever a transaction changes any of
    /// `tables`.
    pub fn trigger(&self, tables: &[TableType]) -> Trigger {
        let (trigger, tx) = Trigger::new();
        for table in tables {
            self.lock(*table).triggers.push(trigger.handle(tx.clone()));
        }
        trigger
    }

    /// Like [`Conn::trigger`], but also fires immediately and every
    /// `secs` seconds. Must be called from within a tokio runtime.
    pub fn trigger_tick(&self, secs: u64, tables: &[TableType]) -> Trigger {
        let (trigger, tx) = Trigger::new();
        for table in tables {
            self.lock(*table).triggers.push(trigger.handle(tx.clone()));
        }
        trigger.spawn_ticker(tx, Duration::from_secs(secs.max(1)));
        trigger
    }

    // ── Convenience reads ─────────────────────────────────────────

    /// Select machines matching `pred` in a dedicated transaction.
    pub fn select_from_machine(&self, pred: impl Fn(&Machine) -> bool) -> Vec<Machine> {
        self.txn(&[TableType::Machine])
            .run(|view| view.select_from_machine(pred))
    }

    /// The current cluster namespace.
    pub fn cluster_namespace(&self) -> DbResult<String> {
        self.txn(&[TableType::Cluster])
            .run(|view| view.cluster_namespace())
    }
}

// ── Transaction ───────────────────────────────────────────────────

/// A set of tables to be locked together.
pub struct Transaction<'c> {
    conn: &'c Conn,
    /// Sorted by table name, no duplicates.
    scope: Vec<TableType>,
}

impl Transaction<'_> {
    /// Lock every table in scope, run `f`, wake triggers of changed tables
    /// and release the locks. Returns whatever `f` returns.
    ///
    /// Locks are released even if `f` panics. The next lock of a poisoned
    /// table recovers it and wakes triggers for whatever `f` left behind.
    pub fn run<R>(&self, f: impl FnOnce(&mut Database<'_>) -> R) -> R {
        let mut tables = BTreeMap::new();
        for table in &self.scope {
            tables.insert(*table, self.conn.lock(*table));
        }

        let mut view = Database { tables };
        let result = f(&mut view);

        for (table, guard) in view.tables.iter_mut() {
            if guard.should_alert {
                trace!(%table, "table changed, alerting triggers");
            }
            guard.alert();
        }
        result
    }
}

// ── Database view ─────────────────────────────────────────────────

/// The locked view of the tables a transaction is scoped to.
pub struct Database<'a> {
    tables: BTreeMap<TableType, MutexGuard<'a, Table>>,
}

impl Database<'_> {
    fn table(&self, table: TableType) -> &Table {
        match self.tables.get(&table) {
            Some(guard) => &**guard,
            None => panic!("table {table} accessed outside transaction scope"),
        }
    }

    fn table_mut(&mut self, table: TableType) -> &mut Table {
        match self.tables.get_mut(&table) {
            Some(guard) => &mut **guard,
            None => panic!("table {table} accessed outside transaction scope"),
        }
    }

    /// All rows of type `R` matching `pred`, ordered by id.
    pub fn select<R: Row>(&self, pred: impl Fn(&R) -> bool) -> Vec<R> {
        self.table(R::TABLE)
            .rows
            .values()
            .filter_map(R::from_any)
            .filter(|row| pred(row))
            .cloned()
            .collect()
    }

    /// Insert a default row of type `R` with a fresh id.
    pub fn insert<R: Row>(&mut self) -> R {
        let mut row = R::default();
        row.set_id(next_id());

        let table = self.table_mut(R::TABLE);
        table.rows.insert(row.id(), row.clone().into_any());
        table.should_alert = true;
        row
    }

    /// Replace the stored row with the same id.
    ///
    /// # Panics
    ///
    /// If no row with that id was inserted, or the stored row has a
    /// different type.
    pub fn commit<R: Row>(&mut self, row: R) {
        let id = row.id();
        let table = self.table_mut(R::TABLE);
        let changed = match table.rows.get(&id) {
            None => panic!("commit of {} row {id} that was never inserted", R::TABLE),
            Some(old) => match R::from_any(old) {
                Some(old) => *old != row,
                None => panic!("commit of {} row {id} over a row of another type", R::TABLE),
            },
        };

        table.should_alert = table.should_alert || changed;
        table.rows.insert(id, row.into_any());
    }

    /// Delete the row with the same id.
    pub fn remove<R: Row>(&mut self, row: &R) {
        let table = self.table_mut(R::TABLE);
        table.rows.remove(&row.id());
        table.should_alert = true;
    }

    // ── Typed helpers ─────────────────────────────────────────────

    pub fn select_from_machine(&self, pred: impl Fn(&Machine) -> bool) -> Vec<Machine> {
        self.select(pred)
    }

    /// The singleton cluster row.
    pub fn get_cluster(&self) -> DbResult<Cluster> {
        singleton(self.select(|_: &Cluster| true))
    }

    pub fn cluster_namespace(&self) -> DbResult<String> {
        self.get_cluster().map(|c| c.namespace)
    }

    /// The singleton ACL row.
    pub fn get_acl(&self) -> DbResult<Acl> {
        singleton(self.select(|_: &Acl| true))
    }

    /// The singleton etcd row.
    pub fn get_etcd(&self) -> DbResult<Etcd> {
        singleton(self.select(|_: &Etcd| true))
    }

    /// Whether this minion is the etcd leader. False if no etcd row exists.
    pub fn etcd_leader(&self) -> bool {
        self.get_etcd().map(|e| e.leader).unwrap_or(false)
    }

    /// The minion row describing this host.
    pub fn minion_self(&self) -> DbResult<Minion> {
        singleton(self.select(|m: &Minion| m.self_))
    }

    /// The machine whose cloud id starts with `prefix`.
    pub fn machine_by_cloud_id_prefix(&self, prefix: &str) -> Result<Machine, LookupError> {
        let machines = self.select(|m: &Machine| !m.cloud_id.is_empty());
        find_by_prefix(machines, |m| m.cloud_id.as_str(), prefix)
    }

    /// The container whose docker id starts with `prefix`.
    pub fn container_by_docker_id_prefix(&self, prefix: &str) -> Result<Container, LookupError> {
        let containers = self.select(|c: &Container| !c.docker_id.is_empty());
        find_by_prefix(containers, |c| c.docker_id.as_str(), prefix)
    }
}

/// Exactly one row, an error for none, and a panic for more than one.
fn singleton<R: Row>(mut rows: Vec<R>) -> DbResult<R> {
    match rows.len() {
        0 => Err(DbError::NotFound(R::TABLE.name())),
        1 => Ok(rows.remove(0)),
        n => panic!("found {n} {} rows, expected at most one", R::TABLE),
    }
}
