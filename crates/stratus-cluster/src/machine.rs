//! Machines as clouds see them, plus sizing and region tables.

use std::fmt;

use serde::{Deserialize, Serialize};

use stratus_db::{Machine, Provider, Role};
use stratus_foreman::RoleAnnotated;

/// A machine reported by, or to be booted on, a cloud provider.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CloudMachine {
    /// Provider-assigned identity. Empty until booted.
    pub id: String,
    pub public_ip: String,
    pub private_ip: String,
    pub floating_ip: String,
    /// Empty while the provider has not reported it yet.
    pub size: String,
    /// Zero when unknown.
    pub disk_size: u32,
    pub ssh_keys: Vec<String>,
    pub provider: Provider,
    pub region: String,
    pub preemptible: bool,
    /// Role reported by the minion, if any.
    pub role: Role,
}

impl RoleAnnotated for CloudMachine {
    fn public_ip(&self) -> &str {
        &self.public_ip
    }

    fn set_role(&mut self, role: Role) {
        self.role = role;
    }
}

impl fmt::Display for CloudMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} {}", self.provider, self.region, self.size)?;
        if !self.id.is_empty() {
            write!(f, " {}", self.id)?;
        }
        if !self.public_ip.is_empty() {
            write!(f, " {}", self.public_ip)?;
        }
        Ok(())
    }
}

// ── Sizing ────────────────────────────────────────────────────────

/// A resource range. `max == 0` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn accepts(&self, x: f64) -> bool {
        self.min <= x && (self.max == 0.0 || x <= self.max)
    }
}

/// A VM type offered by a provider.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Description {
    pub size: &'static str,
    /// Hourly price in USD.
    pub price: f64,
    /// RAM in GiB.
    pub ram: f64,
    pub cpu: u32,
}

const fn desc(size: &'static str, price: f64, ram: f64, cpu: u32) -> Description {
    Description {
        size,
        price,
        ram,
        cpu,
    }
}

const AMAZON_DESCRIPTIONS: &[Description] = &[
    desc("t2.micro", 0.013, 1.0, 1),
    desc("t2.small", 0.026, 2.0, 1),
    desc("t2.medium", 0.052, 4.0, 2),
    desc("t2.large", 0.104, 8.0, 2),
    desc("m3.medium", 0.067, 3.75, 1),
    desc("m3.large", 0.133, 7.5, 2),
    desc("m3.xlarge", 0.266, 15.0, 4),
    desc("m3.2xlarge", 0.532, 30.0, 8),
    desc("m4.large", 0.12, 8.0, 2),
    desc("m4.xlarge", 0.239, 16.0, 4),
    desc("m4.2xlarge", 0.479, 32.0, 8),
    desc("m4.4xlarge", 0.958, 64.0, 16),
    desc("c4.large", 0.105, 3.75, 2),
    desc("c4.xlarge", 0.209, 7.5, 4),
    desc("c4.2xlarge", 0.419, 15.0, 8),
    desc("r3.large", 0.166, 15.25, 2),
    desc("r3.xlarge", 0.333, 30.5, 4),
];

const GOOGLE_DESCRIPTIONS: &[Description] = &[
    desc("f1-micro", 0.008, 0.6, 1),
    desc("g1-small", 0.027, 1.7, 1),
    desc("n1-standard-1", 0.05, 3.75, 1),
    desc("n1-standard-2", 0.1, 7.5, 2),
    desc("n1-standard-4", 0.2, 15.0, 4),
    desc("n1-standard-8", 0.4, 30.0, 8),
    desc("n1-highmem-2", 0.126, 13.0, 2),
    desc("n1-highmem-4", 0.252, 26.0, 4),
    desc("n1-highcpu-2", 0.076, 1.8, 2),
    desc("n1-highcpu-4", 0.152, 3.6, 4),
    desc("n1-highcpu-8", 0.304, 7.2, 8),
];

const DIGITAL_OCEAN_DESCRIPTIONS: &[Description] = &[
    desc("512mb", 0.007, 0.5, 1),
    desc("1gb", 0.015, 1.0, 1),
    desc("2gb", 0.03, 2.0, 2),
    desc("4gb", 0.06, 4.0, 2),
    desc("8gb", 0.119, 8.0, 4),
    desc("16gb", 0.238, 16.0, 8),
    desc("32gb", 0.476, 32.0, 12),
    desc("48gb", 0.714, 48.0, 16),
    desc("64gb", 0.952, 64.0, 20),
];

const AZURE_DESCRIPTIONS: &[Description] = &[
    desc("Standard_A1", 0.06, 1.75, 1),
    desc("Standard_A2", 0.12, 3.5, 2),
    desc("Standard_A3", 0.24, 7.0, 4),
    desc("Standard_D1_v2", 0.073, 3.5, 1),
    desc("Standard_D2_v2", 0.146, 7.0, 2),
    desc("Standard_D3_v2", 0.293, 14.0, 4),
    desc("Standard_D4_v2", 0.585, 28.0, 8),
];

/// The static size table for a provider. Vagrant sizes are synthesised
/// and have no table.
pub fn descriptions(provider: Provider) -> &'static [Description] {
    match provider {
        Provider::Amazon => AMAZON_DESCRIPTIONS,
        Provider::Google => GOOGLE_DESCRIPTIONS,
        Provider::DigitalOcean => DIGITAL_OCEAN_DESCRIPTIONS,
        Provider::Azure => AZURE_DESCRIPTIONS,
        Provider::Vagrant => &[],
    }
}

/// Pick a size for `provider` that satisfies the RAM and CPU ranges and
/// costs at most `max_price` (zero for no limit).
pub fn choose_size(provider: Provider, ram: Range, cpu: Range, max_price: f64) -> Option<String> {
    match provider {
        Provider::Vagrant => Some(vagrant_size(ram, cpu)),
        p => choose_best_size(descriptions(p), ram, cpu, max_price),
    }
}

/// The cheapest description whose RAM and CPU are accepted.
pub fn choose_best_size(
    descriptions: &[Description],
    ram: Range,
    cpu: Range,
    max_price: f64,
) -> Option<String> {
    let best = descriptions
        .iter()
        .filter(|d| ram.accepts(d.ram) && cpu.accepts(f64::from(d.cpu)))
        .min_by(|a, b| a.price.total_cmp(&b.price))?;

    if max_price != 0.0 && best.price > max_price {
        return None;
    }
    Some(best.size.to_string())
}

/// Vagrant boxes are sized directly as `"<ram>,<cpu>"`.
fn vagrant_size(ram: Range, cpu: Range) -> String {
    let ram = ram.min.max(1.0);
    let cpu = cpu.min.max(1.0);
    format!("{ram},{cpu}")
}

// ── Regions ───────────────────────────────────────────────────────

/// Region used when a machine does not name one. Vagrant has none.
pub fn default_region(provider: Provider) -> &'static str {
    match provider {
        Provider::Amazon => "us-west-1",
        Provider::Google => "us-east1-b",
        Provider::DigitalOcean => "sfo1",
        Provider::Azure => "centralus",
        Provider::Vagrant => "",
    }
}

/// Fill in the provider's default region if `m` has none.
pub fn with_default_region(mut m: Machine) -> Machine {
    if m.region.is_empty() {
        m.region = default_region(m.provider).to_string();
    }
    m
}

/// Regions the reconciler connects to for `provider`.
pub fn valid_regions(provider: Provider) -> Vec<String> {
    let regions: &[&str] = match provider {
        Provider::Amazon => &["ap-southeast-2", "us-west-1", "us-west-2"],
        Provider::Google => &["us-central1-a", "us-east1-b", "europe-west1-b"],
        Provider::DigitalOcean => &[
            "ams1", "ams2", "ams3", "blr1", "fra1", "lon1", "nyc1", "nyc2", "nyc3", "sfo1",
            "sfo2", "sgp1", "tor1",
        ],
        Provider::Azure => &["centralus", "eastus", "westus"],
        Provider::Vagrant => &[""],
    };
    regions.iter().map(|r| r.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_accepts() {
        assert!(Range::new(4.0, 0.0).accepts(4.0));
        assert!(Range::new(4.0, 0.0).accepts(400.0));
        assert!(!Range::new(4.0, 0.0).accepts(3.9));
        assert!(Range::new(1.0, 2.0).accepts(2.0));
        assert!(!Range::new(1.0, 2.0).accepts(2.5));
        assert!(Range::default().accepts(0.0));
    }

    #[test]
    fn picks_cheapest_size_that_fits() {
        let table = [
            desc("size1", 2.0, 2.0, 2),
            desc("size3", 1.0, 4.0, 4),
            desc("size4", 0.5, 3.0, 4),
        ];
        let size = choose_best_size(&table, Range::new(4.0, 0.0), Range::new(3.0, 0.0), 0.0);
        assert_eq!(size.as_deref(), Some("size3"));
    }

    #[test]
    fn max_price_rejects_expensive_best() {
        let table = [desc("big", 2.0, 8.0, 4), desc("small", 1.0, 2.0, 1)];
        let ram = Range::new(4.0, 0.0);
        assert_eq!(choose_best_size(&table, ram, Range::default(), 1.5), None);
        assert_eq!(
            choose_best_size(&table, ram, Range::default(), 2.0).as_deref(),
            Some("big")
        );
    }

    #[test]
    fn upper_bounds_are_respected() {
        let table = [desc("huge", 0.1, 64.0, 16), desc("mid", 0.2, 8.0, 2)];
        let size = choose_best_size(&table, Range::new(2.0, 16.0), Range::default(), 0.0);
        assert_eq!(size.as_deref(), Some("mid"));
    }

    #[test]
    fn nothing_fits() {
        let size = choose_size(Provider::Amazon, Range::new(10_000.0, 0.0), Range::default(), 0.0);
        assert_eq!(size, None);
    }

    #[test]
    fn vagrant_size_is_synthesised() {
        let size = choose_size(Provider::Vagrant, Range::new(2.0, 0.0), Range::default(), 0.0);
        assert_eq!(size.as_deref(), Some("2,1"));

        let size = choose_size(Provider::Vagrant, Range::new(0.5, 0.0), Range::new(4.0, 8.0), 0.0);
        assert_eq!(size.as_deref(), Some("1,4"));
    }

    #[test]
    fn amazon_table_picks_real_size() {
        let size = choose_size(Provider::Amazon, Range::new(2.0, 0.0), Range::new(2.0, 0.0), 0.0);
        assert_eq!(size.as_deref(), Some("t2.medium"));
    }

    #[test]
    fn default_regions() {
        let m = with_default_region(Machine {
            provider: Provider::Google,
            ..Default::default()
        });
        assert_eq!(m.region, "us-east1-b");

        let m = with_default_region(Machine {
            provider: Provider::Amazon,
            region: "us-west-2".into(),
            ..Default::default()
        });
        assert_eq!(m.region, "us-west-2");

        assert_eq!(default_region(Provider::Vagrant), "");
        assert_eq!(valid_regions(Provider::Vagrant), vec![String::new()]);
    }
}
