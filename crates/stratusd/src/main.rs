//! stratusd: the Stratus daemon.
//!
//! # Usage
//!
//! ```text
//! stratusd run --config /etc/stratus/stratusd.toml
//! stratusd check --config /etc/stratus/stratusd.toml
//! stratusd stop --config /etc/stratus/stratusd.toml --namespace prod
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

use stratus_cluster::{
    Blueprint, MyIp, PolicyEngine, ProviderFactory, SimulatedCloud, default_my_ip, fixed_my_ip,
    resolve_machines,
};
use stratus_db::{Conn, sort_machines};
use stratus_foreman::HttpClientFactory;

use stratusd::blueprint::RELOAD_INTERVAL;
use stratusd::{
    DaemonConfig, Orchestrator, Settings, load_blueprint, set_blueprint, watch_blueprint,
};

#[derive(Parser)]
#[command(name = "stratusd", about = "Stratus cluster daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Deploy the configured blueprint and keep the cluster in step with it.
    Run {
        /// Path to stratusd.toml.
        #[arg(long, default_value = "stratusd.toml")]
        config: PathBuf,
    },

    /// Parse the config and blueprint, print the machines it resolves to.
    Check {
        #[arg(long, default_value = "stratusd.toml")]
        config: PathBuf,
    },

    /// Stop every machine in a namespace, then exit.
    Stop {
        #[arg(long, default_value = "stratusd.toml")]
        config: PathBuf,

        /// Namespace to empty.
        #[arg(long)]
        namespace: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,stratusd=debug,stratus=debug")
            }),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => {
            let daemon = DaemonConfig::from_file(&config)?;
            let path = daemon
                .policy
                .blueprint
                .clone()
                .context("no [policy] blueprint configured")?;
            run_daemon(daemon, path).await
        }
        Command::Check { config } => check(&config),
        Command::Stop { config, namespace } => {
            let daemon = DaemonConfig::from_file(&config)?;
            stop(daemon, namespace).await
        }
    }
}

/// Passes `stop` runs before giving up on machines that will not die.
const STOP_PASSES: usize = 5;

fn check(config_path: &Path) -> anyhow::Result<()> {
    let config = DaemonConfig::from_file(config_path)?;
    let path = config
        .policy
        .blueprint
        .context("no [policy] blueprint configured")?;
    let (_, blueprint) = load_blueprint(&path)?;

    let machines = sort_machines(resolve_machines(&blueprint.machines, blueprint.max_price));
    println!("namespace: {}", blueprint.namespace);
    println!("machines: {}", machines.len());
    for m in &machines {
        println!("  {m}");
    }
    println!("admin acl: {}", blueprint.admin_acl.join(", "));
    Ok(())
}

/// Deploy an empty blueprint for `namespace` and reconcile until the
/// cloud has nothing left in it.
async fn stop(config: DaemonConfig, namespace: String) -> anyhow::Result<()> {
    let empty = Blueprint {
        namespace: namespace.clone(),
        ..Default::default()
    };
    let json = serde_json::to_string(&empty)?;

    let conn = Conn::new();
    let my_ip = daemon_ip(&config);
    set_blueprint(&conn, &json);
    PolicyEngine::new(conn.clone())
        .with_my_ip(Arc::clone(&my_ip))
        .run_once()
        .await?;

    let mut orchestrator = Orchestrator::new(
        conn,
        cloud_backend(&config.daemon.cloud)?,
        client_factory(&config),
        Settings::from_config(&config.daemon, my_ip),
    );
    let report = orchestrator.settle(STOP_PASSES).await;
    orchestrator.shutdown();

    // ACLs are pushed only by a pass that found nothing left to stop.
    if !report.acls_pushed {
        bail!("namespace {namespace} did not drain; {} machines stopped", report.stopped);
    }
    info!(%namespace, stopped = report.stopped, "namespace stopped");
    println!("stopped {} machines in {namespace}", report.stopped);
    Ok(())
}

fn daemon_ip(config: &DaemonConfig) -> MyIp {
    match &config.daemon.my_ip {
        Some(ip) => fixed_my_ip(ip.clone()),
        None => default_my_ip(),
    }
}

fn client_factory(config: &DaemonConfig) -> Arc<HttpClientFactory> {
    Arc::new(HttpClientFactory::new(
        config.daemon.minion_port,
        config.daemon.rpc_timeout(),
    ))
}

fn cloud_backend(name: &str) -> anyhow::Result<Arc<dyn ProviderFactory>> {
    match name {
        "simulated" => Ok(Arc::new(SimulatedCloud::new())),
        other => bail!("unknown cloud backend: {other}"),
    }
}

async fn run_daemon(config: DaemonConfig, blueprint: PathBuf) -> anyhow::Result<()> {
    info!(cloud = %config.daemon.cloud, "stratus daemon starting");

    // Fail fast on an unreadable blueprint; later reloads only warn.
    load_blueprint(&blueprint)?;

    let conn = Conn::new();
    let my_ip = daemon_ip(&config);
    let provider_factory = cloud_backend(&config.daemon.cloud)?;
    let client_factory = client_factory(&config);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let watcher_handle = tokio::spawn(watch_blueprint(
        conn.clone(),
        blueprint,
        RELOAD_INTERVAL,
        shutdown_rx.clone(),
    ));

    let engine = PolicyEngine::new(conn.clone()).with_my_ip(Arc::clone(&my_ip));
    let engine_handle = tokio::spawn(engine.run(shutdown_rx.clone()));

    let orchestrator = Orchestrator::new(
        conn,
        provider_factory,
        client_factory,
        Settings::from_config(&config.daemon, my_ip),
    );
    let orchestrator_handle = tokio::spawn(orchestrator.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl-C handler")?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let _ = watcher_handle.await;
    let _ = engine_handle.await;
    let _ = orchestrator_handle.await;

    info!("stratus daemon stopped");
    Ok(())
}
