//! System facts gathering for Converge
//!
//! Facts are collected once per host at the start of a play by running a
//! single probe command over the host's connection. The parsed result is
//! immutable and shared with the host worker as `Arc<Facts>`.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;
use tracing::{debug, instrument};

use crate::backup::TIMESTAMP_FORMAT;
use crate::connection::{Connection, ConnectionError, ConnectionResult};
use crate::modules::package::PackageManager;

/// Probe run on every host. Each line is `key=value`; lowercase keys come
/// from the probe itself, uppercase keys from `/etc/os-release`.
const PROBE_COMMAND: &str = "echo \"system=$(uname -s)\"; \
echo \"architecture=$(uname -m)\"; \
echo \"hostname=$(hostname 2>/dev/null || uname -n)\"; \
echo \"epoch=$(date -u +%s)\"; \
if [ \"$(uname -s)\" = Darwin ]; then echo \"darwin_version=$(sw_vers -productVersion 2>/dev/null)\"; fi; \
cat /etc/os-release 2>/dev/null || true";

/// Operating system family, the classifier used for OS-specific behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OsFamily {
    Debian,
    RedHat,
    Archlinux,
    Suse,
    Alpine,
    Darwin,
    #[default]
    Unknown,
}

impl OsFamily {
    /// Classify from the kernel name and the os-release `ID`/`ID_LIKE`.
    pub fn classify(system: &str, id: Option<&str>, id_like: Option<&str>) -> Self {
        if system.eq_ignore_ascii_case("darwin") {
            return OsFamily::Darwin;
        }

        let candidates = id
            .into_iter()
            .chain(id_like.into_iter().flat_map(str::split_whitespace));
        for candidate in candidates {
            let family = match candidate.to_ascii_lowercase().as_str() {
                "debian" | "ubuntu" | "linuxmint" | "pop" | "raspbian" | "elementary" => {
                    OsFamily::Debian
                }
                "rhel" | "fedora" | "centos" | "rocky" | "almalinux" | "ol" | "amzn" => {
                    OsFamily::RedHat
                }
                "arch" | "archlinux" | "manjaro" | "endeavouros" => OsFamily::Archlinux,
                "suse" | "opensuse" | "opensuse-leap" | "opensuse-tumbleweed" | "sles" => {
                    OsFamily::Suse
                }
                "alpine" => OsFamily::Alpine,
                _ => continue,
            };
            return family;
        }
        OsFamily::Unknown
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OsFamily::Debian => "Debian",
            OsFamily::RedHat => "RedHat",
            OsFamily::Archlinux => "Archlinux",
            OsFamily::Suse => "Suse",
            OsFamily::Alpine => "Alpine",
            OsFamily::Darwin => "Darwin",
            OsFamily::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Facts gathered from a host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Facts {
    os_family: OsFamily,
    package_manager: Option<PackageManager>,
    data: IndexMap<String, JsonValue>,
}

impl Facts {
    /// Create empty facts
    pub fn new() -> Self {
        Self::default()
    }

    /// Facts for a play that skips gathering: the inventory name as
    /// hostname and the control node's clock.
    pub fn minimal(hostname: &str, now: DateTime<Utc>) -> Self {
        let mut facts = Self::new();
        facts.data.insert("hostname".to_string(), json!(hostname));
        facts.data.insert("date_time".to_string(), date_time(now));
        facts
    }

    /// Parse the probe output.
    pub fn from_probe(stdout: &str) -> Result<Self, String> {
        let fields: HashMap<&str, &str> = stdout
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim().trim_matches('"')))
            .collect();

        let system = fields
            .get("system")
            .copied()
            .filter(|s| !s.is_empty())
            .ok_or("probe output has no kernel name")?;
        let epoch: i64 = fields
            .get("epoch")
            .and_then(|e| e.parse().ok())
            .ok_or("probe output has no usable timestamp")?;
        let now = DateTime::<Utc>::from_timestamp(epoch, 0)
            .ok_or_else(|| format!("timestamp {} is out of range", epoch))?;

        let os_family = OsFamily::classify(
            system,
            fields.get("ID").copied(),
            fields.get("ID_LIKE").copied(),
        );

        let distribution = match os_family {
            OsFamily::Darwin => "MacOSX".to_string(),
            _ => fields.get("ID").copied().unwrap_or(system).to_string(),
        };
        let distribution_version = fields
            .get("VERSION_ID")
            .or_else(|| fields.get("darwin_version"))
            .copied()
            .unwrap_or_default();

        let mut data = IndexMap::new();
        data.insert("os_family".to_string(), json!(os_family.as_str()));
        data.insert("distribution".to_string(), json!(distribution));
        data.insert("distribution_version".to_string(), json!(distribution_version));
        data.insert("system".to_string(), json!(system));
        data.insert(
            "architecture".to_string(),
            json!(fields.get("architecture").copied().unwrap_or_default()),
        );
        data.insert(
            "hostname".to_string(),
            json!(fields.get("hostname").copied().unwrap_or_default()),
        );
        data.insert("date_time".to_string(), date_time(now));

        Ok(Self {
            os_family,
            package_manager: PackageManager::for_family(os_family),
            data,
        })
    }

    /// The OS family classifier
    pub fn os_family(&self) -> OsFamily {
        self.os_family
    }

    /// Package manager selected for this host's OS family
    pub fn package_manager(&self) -> Option<PackageManager> {
        self.package_manager
    }

    /// Get a fact
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.data.get(key)
    }

    /// Get all facts
    pub fn all(&self) -> &IndexMap<String, JsonValue> {
        &self.data
    }

    /// Facts as a JSON mapping, the value bound to `facts` in templates
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.data.clone().into_iter().collect())
    }
}

fn date_time(now: DateTime<Utc>) -> JsonValue {
    json!({
        "epoch": now.timestamp(),
        "date": now.format("%Y-%m-%d").to_string(),
        "time": now.format("%H:%M:%S").to_string(),
        "iso8601": now.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        "iso8601_basic_short": now.format(TIMESTAMP_FORMAT).to_string(),
    })
}

/// Runs the fact probe over a connection
#[derive(Debug, Clone, Default)]
pub struct FactGatherer {
    timeout: Option<u64>,
}

impl FactGatherer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the probe by a timeout in seconds
    pub fn with_timeout(mut self, timeout: Option<u64>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Gather facts from the host behind `connection`.
    ///
    /// Any failure, including a probe that exits nonzero or prints
    /// unparseable output, is a transport-level error: the host cannot be
    /// worked on.
    #[instrument(skip(self, connection), fields(host = %connection.identifier()))]
    pub async fn gather(&self, connection: &dyn Connection) -> ConnectionResult<Facts> {
        let options = self
            .timeout
            .map(|t| crate::connection::ExecuteOptions::new().with_timeout(t));
        let result = connection.execute(PROBE_COMMAND, options).await?;
        if !result.success {
            return Err(ConnectionError::ExecutionFailed(format!(
                "fact probe exited with {}: {}",
                result.exit_code,
                result.stderr.trim()
            )));
        }

        let facts = Facts::from_probe(&result.stdout).map_err(ConnectionError::ExecutionFailed)?;
        debug!(os_family = %facts.os_family(), "facts gathered");
        Ok(facts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const UBUNTU: &str = "system=Linux
architecture=x86_64
hostname=web1
epoch=1705312800
NAME=\"Ubuntu\"
ID=ubuntu
ID_LIKE=debian
VERSION_ID=\"22.04\"
";

    #[test]
    fn test_parse_ubuntu_probe() {
        let facts = Facts::from_probe(UBUNTU).unwrap();
        assert_eq!(facts.os_family(), OsFamily::Debian);
        assert_eq!(facts.package_manager(), Some(PackageManager::Apt));
        assert_eq!(facts.get("distribution"), Some(&json!("ubuntu")));
        assert_eq!(facts.get("distribution_version"), Some(&json!("22.04")));
        assert_eq!(facts.get("hostname"), Some(&json!("web1")));

        let dt = facts.get("date_time").unwrap();
        assert_eq!(dt["epoch"], json!(1705312800));
        assert_eq!(dt["date"], json!("2024-01-15"));
        assert_eq!(dt["iso8601_basic_short"], json!("20240115T100000"));
    }

    #[test]
    fn test_classify() {
        assert_eq!(OsFamily::classify("Linux", Some("rocky"), Some("rhel centos fedora")), OsFamily::RedHat);
        assert_eq!(OsFamily::classify("Linux", Some("manjaro"), Some("arch")), OsFamily::Archlinux);
        assert_eq!(OsFamily::classify("Linux", Some("opensuse-leap"), None), OsFamily::Suse);
        assert_eq!(OsFamily::classify("Linux", Some("alpine"), None), OsFamily::Alpine);
        assert_eq!(OsFamily::classify("Darwin", None, None), OsFamily::Darwin);
        assert_eq!(OsFamily::classify("Linux", Some("gentoo"), None), OsFamily::Unknown);
        // ID_LIKE rescues derivatives
        assert_eq!(OsFamily::classify("Linux", Some("zorin"), Some("ubuntu debian")), OsFamily::Debian);
    }

    #[test]
    fn test_probe_without_timestamp_fails() {
        assert!(Facts::from_probe("system=Linux\nhostname=x\n").is_err());
        assert!(Facts::from_probe("").is_err());
    }

    #[test]
    fn test_minimal_facts() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 8, 5, 9).unwrap();
        let facts = Facts::minimal("db1", now);
        assert_eq!(facts.os_family(), OsFamily::Unknown);
        assert_eq!(facts.package_manager(), None);
        assert_eq!(facts.to_json()["hostname"], json!("db1"));
        assert_eq!(facts.to_json()["date_time"]["time"], json!("08:05:09"));
    }
}
