//! Table definitions for the Stratus database.
//!
//! Every table maps a [`RowId`] to one concrete row type. Rows are stored
//! behind the [`AnyRow`] enum so that a single `Table` type can back all of
//! them; the [`Row`] trait recovers the concrete type on the way out.

use std::collections::BTreeMap;
use std::fmt;

use crate::trigger::TriggerHandle;
use crate::types::*;

/// Names every table the database knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TableType {
    Acl,
    Cluster,
    Connection,
    Container,
    Etcd,
    Hostname,
    Image,
    Label,
    Machine,
    Minion,
    Placement,
}

impl TableType {
    /// All tables, pre-allocated by [`Conn::new`](crate::Conn::new).
    pub const ALL: [TableType; 11] = [
        TableType::Acl,
        TableType::Cluster,
        TableType::Connection,
        TableType::Container,
        TableType::Etcd,
        TableType::Hostname,
        TableType::Image,
        TableType::Label,
        TableType::Machine,
        TableType::Minion,
        TableType::Placement,
    ];

    /// Table name. Transactions acquire locks in ascending order of this
    /// string, so it must stay stable.
    pub fn name(&self) -> &'static str {
        match self {
            TableType::Acl => "ACL",
            TableType::Cluster => "Cluster",
            TableType::Connection => "Connection",
            TableType::Container => "Container",
            TableType::Etcd => "Etcd",
            TableType::Hostname => "Hostname",
            TableType::Image => "Image",
            TableType::Label => "Label",
            TableType::Machine => "Machine",
            TableType::Minion => "Minion",
            TableType::Placement => "Placement",
        }
    }
}

impl fmt::Display for TableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ── Rows ──────────────────────────────────────────────────────────

/// Type-erased storage for a row of any table.
#[derive(Debug, Clone, PartialEq)]
pub enum AnyRow {
    Acl(Acl),
    Cluster(Cluster),
    Connection(Connection),
    Container(Container),
    Etcd(Etcd),
    Hostname(Hostname),
    Image(Image),
    Label(Label),
    Machine(Machine),
    Minion(Minion),
    Placement(Placement),
}

impl AnyRow {
    /// The table this row belongs to.
    pub fn table(&self) -> TableType {
        match self {
            AnyRow::Acl(_) => TableType::Acl,
            AnyRow::Cluster(_) => TableType::Cluster,
            AnyRow::Connection(_) => TableType::Connection,
            AnyRow::Container(_) => TableType::Container,
            AnyRow::Etcd(_) => TableType::Etcd,
            AnyRow::Hostname(_) => TableType::Hostname,
            AnyRow::Image(_) => TableType::Image,
            AnyRow::Label(_) => TableType::Label,
            AnyRow::Machine(_) => TableType::Machine,
            AnyRow::Minion(_) => TableType::Minion,
            AnyRow::Placement(_) => TableType::Placement,
        }
    }
}

/// A concrete row type stored in exactly one table.
pub trait Row: Clone + PartialEq + Default + fmt::Debug + Send + 'static {
    /// The table rows of this type live in.
    const TABLE: TableType;

    fn id(&self) -> RowId;

    fn set_id(&mut self, id: RowId);

    fn into_any(self) -> AnyRow;

    /// Borrow the concrete row back out, or `None` on a type mismatch.
    fn from_any(any: &AnyRow) -> Option<&Self>;
}

macro_rules! impl_row {
    ($($ty:ident),* $(,)?) => {
        $(
            impl Row for $ty {
                const TABLE: TableType = TableType::$ty;

                fn id(&self) -> RowId {
                    self.id
                }

                fn set_id(&mut self, id: RowId) {
                    self.id = id;
                }

                fn into_any(self) -> AnyRow {
                    AnyRow::$ty(self)
                }

                fn from_any(any: &AnyRow) -> Option<&Self> {
                    match any {
                        AnyRow::$ty(row) => Some(row),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_row!(
    Acl, Cluster, Connection, Container, Etcd, Hostname, Image, Label, Machine, Minion,
    Placement,
);

// ── Table ─────────────────────────────────────────────────────────

/// Rows of one table plus the triggers watching it.
#[derive(Default)]
pub(crate) struct Table {
    pub(crate) rows: BTreeMap<RowId, AnyRow>,
    pub(crate) triggers: Vec<TriggerHandle>,
    /// Set when the current transaction changed this table.
    pub(crate) should_alert: bool,
}

impl Table {
    /// Wake every trigger if the table changed, dropping stopped ones.
    pub(crate) fn alert(&mut self) {
        if !self.should_alert {
            return;
        }
        self.should_alert = false;

        self.triggers.retain(|t| !t.is_stopped());
        for trigger in &self.triggers {
            trigger.notify();
        }
    }
}
