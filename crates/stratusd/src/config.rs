//! stratusd.toml configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use stratus_cluster::Blueprint;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub daemon: DaemonSection,
    pub policy: PolicySection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSection {
    /// Upper bound between orchestrator passes.
    pub poll_interval_secs: u64,
    /// Minimum pause after each pass, to spare the cloud APIs.
    pub rate_limit_secs: u64,
    /// Pause after a pass in which a cloud call failed.
    pub failure_backoff_secs: u64,
    pub minion_port: u16,
    pub rpc_timeout_secs: u64,
    /// Cloud backend. Only `simulated` ships with the daemon.
    pub cloud: String,
    /// Skip the public IP lookup and use this address.
    pub my_ip: Option<String>,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            rate_limit_secs: 5,
            failure_backoff_secs: 60,
            minion_port: 9999,
            rpc_timeout_secs: 10,
            cloud: "simulated".to_string(),
            my_ip: None,
        }
    }
}

impl DaemonSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn rate_limit(&self) -> Duration {
        Duration::from_secs(self.rate_limit_secs)
    }

    pub fn failure_backoff(&self) -> Duration {
        Duration::from_secs(self.failure_backoff_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    /// JSON blueprint file. Relative paths resolve against the config file.
    pub blueprint: Option<PathBuf>,
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut config: DaemonConfig = toml::from_str(&content)?;

        if let Some(bp) = config.policy.blueprint.as_mut() {
            if bp.is_relative() {
                if let Some(dir) = path.parent() {
                    *bp = dir.join(&*bp);
                }
            }
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Read and parse a blueprint file, returning the raw JSON with it.
pub fn load_blueprint(path: &Path) -> anyhow::Result<(String, Blueprint)> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("read blueprint {}", path.display()))?;
    let blueprint = Blueprint::from_json(&json)
        .with_context(|| format!("parse blueprint {}", path.display()))?;
    Ok((json, blueprint))
}
