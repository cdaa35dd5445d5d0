//! Feeding the blueprint into the database.
//!
//! The blueprint file is re-read every few seconds so edits take effect
//! without a restart. A file that fails to parse leaves the previous
//! blueprint in place.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use stratus_db::{Cluster, Conn, TableType};

use crate::config::load_blueprint;

/// How often the blueprint file is re-read.
pub const RELOAD_INTERVAL: Duration = Duration::from_secs(5);

/// Store `json` on the cluster row, creating the row if needed. Returns
/// true if the stored blueprint changed.
pub fn set_blueprint(conn: &Conn, json: &str) -> bool {
    conn.txn(&[TableType::Cluster]).run(|view| {
        let mut cluster = match view.get_cluster() {
            Ok(c) => c,
            Err(_) => view.insert::<Cluster>(),
        };
        if cluster.blueprint == json {
            return false;
        }
        cluster.blueprint = json.to_string();
        view.commit(cluster);
        true
    })
}

/// Keep the cluster row's blueprint in step with the file at `path`
/// until `shutdown` flips.
pub async fn watch_blueprint(
    conn: Conn,
    path: PathBuf,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                match load_blueprint(&path) {
                    Ok((json, _)) => {
                        if set_blueprint(&conn, &json) {
                            info!("blueprint updated");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to update blueprint"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
