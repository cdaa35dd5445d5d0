//! stratus-db: transactional in-memory database for Stratus.
//!
//! Holds the declared and observed cluster state that the reconciler and
//! the foreman share. There is no persistence: the cloud itself is the
//! durable record, and the database is rebuilt by reconciliation.
//!
//! # Architecture
//!
//! Every table is guarded by its own mutex. A transaction names the
//! tables it touches up front and locks them in a single global order
//! (sorted by table name), which keeps overlapping transactions free of
//! deadlock. Changed tables wake their [`Trigger`]s once the transaction
//! finishes, and a commit that leaves a row unchanged wakes nobody.
//!
//! ```ignore
//! let conn = Conn::new();
//! conn.txn(&[TableType::Machine]).run(|view| {
//!     let mut m: Machine = view.insert();
//!     m.role = Role::Master;
//!     view.commit(m);
//! });
//! ```

pub mod conn;
pub mod error;
pub mod lookup;
pub mod tables;
pub mod trigger;
pub mod types;

pub use conn::{Conn, Database, Transaction};
pub use error::{DbError, DbResult, LookupError};
pub use lookup::find_by_prefix;
pub use tables::{AnyRow, Row, TableType};
pub use trigger::Trigger;
pub use types::*;
