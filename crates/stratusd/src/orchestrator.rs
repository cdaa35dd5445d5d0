//! The orchestrator loop.
//!
//! Runs the reconciler and the foreman for the current namespace. A new
//! namespace gets a fresh reconciler and foreman: the reconciler runs once
//! first so the foreman starts out tracking whatever the cloud already
//! has, then the foreman adopts the roles those minions report.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use stratus_cluster::{MyIp, ProviderFactory, Reconciler, SyncReport, default_my_ip};
use stratus_db::{Conn, TableType};
use stratus_foreman::{ClientFactory, Foreman};

use crate::config::DaemonSection;

/// Timing knobs for the loop.
#[derive(Clone)]
pub struct Settings {
    pub poll_interval: Duration,
    pub rate_limit: Duration,
    pub failure_backoff: Duration,
    pub my_ip: MyIp,
}

impl Settings {
    pub fn from_config(daemon: &DaemonSection, my_ip: MyIp) -> Self {
        Self {
            poll_interval: daemon.poll_interval(),
            rate_limit: daemon.rate_limit(),
            failure_backoff: daemon.failure_backoff(),
            my_ip,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_config(&DaemonSection::default(), default_my_ip())
    }
}

/// Reconciler and foreman bound to one namespace.
struct ClusterState {
    namespace: String,
    reconciler: Reconciler,
    foreman: Foreman,
}

pub struct Orchestrator {
    conn: Conn,
    provider_factory: Arc<dyn ProviderFactory>,
    client_factory: Arc<dyn ClientFactory>,
    settings: Settings,
    cluster: Option<ClusterState>,
}

impl Orchestrator {
    pub fn new(
        conn: Conn,
        provider_factory: Arc<dyn ProviderFactory>,
        client_factory: Arc<dyn ClientFactory>,
        settings: Settings,
    ) -> Self {
        Self {
            conn,
            provider_factory,
            client_factory,
            settings,
            cluster: None,
        }
    }

    /// Namespace currently being reconciled, if any.
    pub fn namespace(&self) -> Option<&str> {
        self.cluster.as_ref().map(|c| c.namespace.as_str())
    }

    /// One pass: reconcile the cloud, then poll the minions. Returns the
    /// reconciler's report, including the first sync of a new namespace,
    /// or `None` if there is no cluster to manage.
    pub async fn update_cluster(&mut self) -> Option<SyncReport> {
        let namespace = match self.conn.cluster_namespace() {
            Ok(ns) => ns,
            Err(e) => {
                debug!(error = %e, "no cluster yet");
                return None;
            }
        };

        let mut report = SyncReport::default();
        let stale = self.cluster.as_ref().is_none_or(|c| c.namespace != namespace);
        if stale {
            if let Some(mut old) = self.cluster.take() {
                info!(old = %old.namespace, new = %namespace, "namespace changed");
                old.foreman.shutdown();
            }
            let (cluster, first) = self.new_cluster(namespace).await;
            self.cluster = Some(cluster);
            report = first;
        }

        let cluster = self.cluster.as_mut()?;
        report.merge(cluster.reconciler.run_once(&cluster.foreman).await);
        cluster.foreman.run_once().await;
        Some(report)
    }

    /// Run passes back to back until one changes nothing and pushes the
    /// ACLs, or `max_passes` run out. Returns everything the passes did.
    pub async fn settle(&mut self, max_passes: usize) -> SyncReport {
        let mut total = SyncReport::default();
        for _ in 0..max_passes {
            let Some(report) = self.update_cluster().await else {
                break;
            };
            let done = report.is_quiet() && report.acls_pushed;
            total.merge(report);
            if done {
                break;
            }
        }
        total
    }

    async fn new_cluster(&self, namespace: String) -> (ClusterState, SyncReport) {
        let mut reconciler = Reconciler::new(
            self.conn.clone(),
            namespace.clone(),
            Arc::clone(&self.provider_factory),
        )
        .with_my_ip(Arc::clone(&self.settings.my_ip))
        .with_failure_backoff(self.settings.failure_backoff);

        let mut foreman = Foreman::new(self.conn.clone(), Arc::clone(&self.client_factory));
        let report = reconciler.run_once(&foreman).await;
        foreman.init().await;

        let cluster = ClusterState {
            namespace,
            reconciler,
            foreman,
        };
        (cluster, report)
    }

    /// Shut down the foreman of the current namespace, if any.
    pub fn shutdown(&mut self) {
        if let Some(mut cluster) = self.cluster.take() {
            cluster.foreman.shutdown();
        }
    }

    /// Run until `shutdown` flips. Passes happen whenever the cluster,
    /// machine or ACL tables change and at least every poll interval, but
    /// never closer together than the rate limit.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut trigger = self.conn.trigger_tick(
            self.settings.poll_interval.as_secs(),
            &[TableType::Cluster, TableType::Machine, TableType::Acl],
        );
        info!(
            poll_interval = ?self.settings.poll_interval,
            rate_limit = ?self.settings.rate_limit,
            "orchestrator started"
        );

        loop {
            tokio::select! {
                signal = trigger.recv() => {
                    if signal.is_none() {
                        break;
                    }
                    self.update_cluster().await;
                }
                _ = shutdown.changed() => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.rate_limit) => {}
                _ = shutdown.changed() => break,
            }
        }

        trigger.stop();
        self.shutdown();
        info!("orchestrator stopped");
    }
}
