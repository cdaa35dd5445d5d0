//! Row types stored in the Stratus database.
//!
//! `Machine`, `Cluster`, `Acl` and `Etcd` drive the reconciler and the
//! foreman. The remaining rows are produced by policy resolution and
//! consumed by minion-side logic; the database stores them verbatim.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DbError;

/// Database row identifier. Allocated once at insertion, never reused.
pub type RowId = u64;

// ── Enums ─────────────────────────────────────────────────────────

/// The role a machine plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Role {
    #[default]
    None,
    Master,
    Worker,
}

impl FromStr for Role {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "None" => Ok(Role::None),
            "Master" => Ok(Role::Master),
            "Worker" => Ok(Role::Worker),
            other => Err(DbError::InvalidRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::None => "",
            Role::Master => "Master",
            Role::Worker => "Worker",
        };
        f.write_str(s)
    }
}

/// Cloud providers a machine can be booted on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum Provider {
    #[default]
    Amazon,
    Google,
    DigitalOcean,
    Azure,
    Vagrant,
}

impl Provider {
    /// Every supported provider.
    pub const ALL: [Provider; 5] = [
        Provider::Amazon,
        Provider::Google,
        Provider::DigitalOcean,
        Provider::Azure,
        Provider::Vagrant,
    ];
}

impl FromStr for Provider {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Amazon" => Ok(Provider::Amazon),
            "Google" => Ok(Provider::Google),
            "DigitalOcean" => Ok(Provider::DigitalOcean),
            "Azure" => Ok(Provider::Azure),
            "Vagrant" => Ok(Provider::Vagrant),
            other => Err(DbError::InvalidProvider(other.to_string())),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Provider::Amazon => "Amazon",
            Provider::Google => "Google",
            Provider::DigitalOcean => "DigitalOcean",
            Provider::Azure => "Azure",
            Provider::Vagrant => "Vagrant",
        };
        f.write_str(s)
    }
}

// ── Machine ───────────────────────────────────────────────────────

/// A cloud VM under management.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Machine {
    pub id: RowId,

    // Populated by policy resolution.
    pub role: Role,
    pub provider: Provider,
    pub region: String,
    pub size: String,
    /// Disk size in GB.
    pub disk_size: u32,
    pub ssh_keys: Vec<String>,
    /// Floating IP the policy wants attached, empty for none.
    pub floating_ip: String,
    /// Spot instance rather than on-demand.
    pub preemptible: bool,

    // Populated by the reconciler from the cloud provider.
    pub cloud_id: String,
    pub public_ip: String,
    pub private_ip: String,

    /// Set by the foreman once the minion answers an RPC.
    pub connected: bool,
}

impl Machine {
    /// A machine is live, and therefore reachable by the foreman, once both
    /// of its IP addresses are known.
    pub fn is_live(&self) -> bool {
        !self.public_ip.is_empty() && !self.private_ip.is_empty()
    }

    /// Default ordering used when presenting machines: masters first, then
    /// fully-addressed machines, then partially-addressed ones, then by id.
    pub fn display_cmp(&self, other: &Machine) -> Ordering {
        let rank_role = |r: Role| match r {
            Role::Master => 0,
            Role::Worker => 1,
            Role::None => 2,
        };
        let down = |m: &Machine| m.public_ip.is_empty() && m.private_ip.is_empty();

        rank_role(self.role)
            .cmp(&rank_role(other.role))
            .then_with(|| other.is_live().cmp(&self.is_live()))
            .then_with(|| down(self).cmp(&down(other)))
            .then_with(|| self.id.cmp(&other.id))
            .then_with(|| self.cloud_id.cmp(&other.cloud_id))
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags = Vec::new();

        if self.role != Role::None {
            tags.push(self.role.to_string());
        }

        tags.push(format!("{} {} {}", self.provider, self.region, self.size));

        if !self.cloud_id.is_empty() {
            tags.push(self.cloud_id.clone());
        }
        if !self.public_ip.is_empty() {
            tags.push(format!("PublicIP={}", self.public_ip));
        }
        if !self.private_ip.is_empty() {
            tags.push(format!("PrivateIP={}", self.private_ip));
        }
        if !self.floating_ip.is_empty() {
            tags.push(format!("FloatingIP={}", self.floating_ip));
        }
        if self.disk_size != 0 {
            tags.push(format!("Disk={}GB", self.disk_size));
        }
        if self.preemptible {
            tags.push("Preemptible".to_string());
        }
        if self.connected {
            tags.push("Connected".to_string());
        }

        write!(f, "Machine-{}{{{}}}", self.id, tags.join(", "))
    }
}

/// Sort machines into the default presentation order.
pub fn sort_machines(mut machines: Vec<Machine>) -> Vec<Machine> {
    machines.sort_by(|a, b| a.display_cmp(b));
    machines
}

// ── Cluster ───────────────────────────────────────────────────────

/// Singleton row naming the deployment and carrying its policy.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cluster {
    pub id: RowId,
    /// Cloud provider namespace.
    pub namespace: String,
    /// Resolved policy blueprint (JSON).
    pub blueprint: String,
}

// ── ACL ───────────────────────────────────────────────────────────

/// Singleton row with the access control policy for managed machines.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Acl {
    pub id: RowId,
    /// CIDRs allowed full access.
    pub admin: Vec<String>,
    /// Port ranges opened to the public internet.
    pub application_ports: Vec<PortRange>,
}

/// An inclusive range of ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PortRange {
    pub min_port: u16,
    pub max_port: u16,
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min_port == self.max_port {
            write!(f, "{}", self.min_port)
        } else {
            write!(f, "{}-{}", self.min_port, self.max_port)
        }
    }
}

// ── Etcd ──────────────────────────────────────────────────────────

/// Etcd membership as seen by a minion.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Etcd {
    pub id: RowId,
    /// The set of members in the cluster.
    pub etcd_ips: Vec<String>,
    /// True if this minion is the leader.
    pub leader: bool,
    /// IP address of the current leader, or empty.
    pub leader_ip: String,
}

// ── Pass-through rows ─────────────────────────────────────────────

/// Minion-side configuration row. Exactly one row has `self_` set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Minion {
    pub id: RowId,
    pub self_: bool,
    pub blueprint: String,
    pub subnet: String,
    pub authorized_keys: String,
    pub supervisor_init: bool,
    pub role: Role,
    pub private_ip: String,
    pub provider: String,
    pub size: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Container {
    pub id: RowId,
    pub blueprint_id: String,
    pub docker_id: String,
    pub image: String,
    pub command: Vec<String>,
    pub labels: Vec<String>,
    pub minion: String,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Label {
    pub id: RowId,
    pub label: String,
    pub ip: String,
    pub container_ips: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Connection {
    pub id: RowId,
    pub from: String,
    pub to: String,
    pub min_port: u16,
    pub max_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Placement {
    pub id: RowId,
    pub target_label: String,
    pub exclusive: bool,
    pub other_label: String,
    pub provider: String,
    pub size: String,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Hostname {
    pub id: RowId,
    pub hostname: String,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Image {
    pub id: RowId,
    pub name: String,
    pub dockerfile: String,
    pub docker_id: String,
    pub status: String,
}
