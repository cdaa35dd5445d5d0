//! ACL computation.
//!
//! Every managed machine accepts traffic from the admin CIDRs, from this
//! daemon, and from every other declared machine. Application ports are
//! opened to the world.

use std::collections::BTreeSet;

use stratus_db::{Machine, PortRange};

use crate::provider::{AclRule, Instance};

/// The full rule set for the declared machines.
///
/// Duplicates are dropped; the result is sorted.
pub fn compute_acls(
    admin: &[String],
    application_ports: &[PortRange],
    machines: &[Machine],
    my_ip: Option<&str>,
) -> Vec<AclRule> {
    let mut rules = BTreeSet::new();

    for cidr in admin {
        rules.insert(AclRule::all_ports(cidr.clone()));
    }

    if let Some(ip) = my_ip {
        rules.insert(AclRule::all_ports(format!("{ip}/32")));
    }

    for m in machines.iter().filter(|m| !m.public_ip.is_empty()) {
        rules.insert(AclRule::all_ports(format!("{}/32", m.public_ip)));
    }

    for ports in application_ports {
        rules.insert(AclRule {
            cidr_ip: "0.0.0.0/0".to_string(),
            min_port: ports.min_port,
            max_port: ports.max_port,
        });
    }

    rules.into_iter().collect()
}

/// Provider instances with at least one live declared machine. Only these
/// receive the rule set; every other instance is cleared.
pub fn instances_with_live_machines(machines: &[Machine]) -> BTreeSet<Instance> {
    machines
        .iter()
        .filter(|m| m.is_live())
        .map(|m| Instance::new(m.provider, m.region.clone()))
        .collect()
}
