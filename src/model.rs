use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The three managed regions.
///
/// Codes are opaque as far as the control plane is concerned; only HK has
/// explicit enable-region semantics on the provider side (JP and SG are
/// always-on).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Region {
    Hk,
    Jp,
    Sg,
}

pub const REGIONS: [Region; 3] = [Region::Hk, Region::Jp, Region::Sg];

impl Region {
    pub fn code(self) -> &'static str {
        match self {
            Region::Hk => "HK",
            Region::Jp => "JP",
            Region::Sg => "SG",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "HK" => Ok(Region::Hk),
            "JP" => Ok(Region::Jp),
            "SG" => Ok(Region::Sg),
            other => Err(format!("unknown region '{other}'")),
        }
    }
}

/// Capacity units consumed by one instance of the given type.
///
/// Halved-vCPU rule: a `.large` is 2 vCPUs -> 1 unit, `.xlarge` 4 -> 2,
/// `.2xlarge` 8 -> 4. Unknown shapes count as the smallest so a typo in
/// tenant settings cannot brick selection.
pub fn units_for(instance_type: &str) -> u32 {
    if instance_type.ends_with(".2xlarge") {
        4
    } else if instance_type.ends_with(".xlarge") {
        2
    } else {
        1
    }
}

/// Whether the type is a larger variant of its family (relevant for
/// per-type quota skips: quota errors on a big shape should not bench the
/// credential for smaller shapes).
pub fn is_larger_variant(instance_type: &str) -> bool {
    units_for(instance_type) > 1
}

/// Per-tenant monitoring record from the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorConfig {
    pub tenant_id: u64,
    pub enabled: bool,
    /// Target instance counts per region; 0 disables the region.
    #[serde(default)]
    pub threshold_hk: u32,
    #[serde(default)]
    pub threshold_jp: u32,
    #[serde(default)]
    pub threshold_sg: u32,
    /// Gate for the IP range checker.
    #[serde(default)]
    pub ip_range_enabled: bool,
    /// Required IPv4 prefixes per region; an empty/missing prefix exempts
    /// the region from IP range enforcement.
    #[serde(default)]
    pub ip_prefixes: HashMap<Region, String>,
}

impl MonitorConfig {
    pub fn threshold_for(&self, region: Region) -> u32 {
        match region {
            Region::Hk => self.threshold_hk,
            Region::Jp => self.threshold_jp,
            Region::Sg => self.threshold_sg,
        }
    }

    pub fn ip_prefix_for(&self, region: Region) -> &str {
        self.ip_prefixes.get(&region).map(String::as_str).unwrap_or("")
    }
}

/// Per-tenant provisioning settings from the external store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantSettings {
    pub tenant_id: u64,
    pub instance_type: String,
    pub disk_gb: u32,
    pub root_password: String,
    /// Per-region machine image ids.
    #[serde(default)]
    pub amis: HashMap<Region, String>,
    /// Per-region tenant boot scripts, appended after the fixed bootstrap
    /// preamble.
    #[serde(default)]
    pub boot_scripts: HashMap<Region, String>,
}

impl TenantSettings {
    pub fn ami_for(&self, region: Region) -> Option<&str> {
        self.amis.get(&region).map(String::as_str)
    }

    pub fn boot_script_for(&self, region: Region) -> &str {
        self.boot_scripts.get(&region).map(String::as_str).unwrap_or("")
    }
}

/// One heartbeat message as decoded off the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    pub instance_id: String,
    pub instance_type: String,
    pub tenant_id: u64,
    pub credential_id: String,
    pub ipv4: String,
    pub region: Region,
    pub launched_at: u64,
    pub reported_at: u64,
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}
