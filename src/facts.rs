//! System facts gathering for Ansirun
//!
//! Facts are collected with a single shell round trip (`uname`, `hostname`
//! and `/etc/os-release`) so the same code works over ssh and locally.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::connection::{Connection, ConnectionError, ConnectionResult, ExecuteOptions};
use crate::vars::{JsonValue, VarMap};

const SEPARATOR: &str = "--- os-release ---";

/// Probe printing `key=value` lines, then the raw os-release file
fn gather_script() -> String {
    format!(
        "echo \"system=$(uname -s)\"; \
         echo \"architecture=$(uname -m)\"; \
         echo \"kernel=$(uname -r)\"; \
         echo \"nodename=$(uname -n)\"; \
         echo \"hostname=$(hostname 2>/dev/null || uname -n)\"; \
         echo \"fqdn=$(hostname -f 2>/dev/null || hostname 2>/dev/null || uname -n)\"; \
         echo '{}'; \
         cat /etc/os-release 2>/dev/null || true",
        SEPARATOR
    )
}

/// Facts gathered from a host
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Facts {
    data: IndexMap<String, JsonValue>,
}

impl Facts {
    /// Create empty facts
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a fact
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<JsonValue>) {
        self.data.insert(key.into(), value.into());
    }

    /// Get a fact
    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.data.get(key)
    }

    /// Get all facts
    pub fn all(&self) -> &IndexMap<String, JsonValue> {
        &self.data
    }

    /// The facts as host variables (`ansible_` prefixed keys)
    pub fn to_vars(&self) -> VarMap {
        self.data
            .iter()
            .map(|(k, v)| (format!("ansible_{}", k), v.clone()))
            .collect()
    }

    /// Build facts from the gather script's output
    pub fn parse(output: &str) -> Self {
        let mut facts = Self::new();
        let (basic, os_release) = output.split_once(SEPARATOR).unwrap_or((output, ""));

        for line in basic.lines() {
            if let Some((key, value)) = line.split_once('=') {
                facts.set(key.trim(), value.trim());
            }
        }

        let release: IndexMap<&str, String> = os_release
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim(), v.trim().trim_matches('"').trim_matches('\'').to_string()))
            .collect();

        let id = release.get("ID").cloned().unwrap_or_default();
        let distribution = match id.as_str() {
            "" => facts
                .get("system")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown")
                .to_string(),
            other => distribution_name(other),
        };
        let version = release.get("VERSION_ID").cloned().unwrap_or_default();
        let major = version.split('.').next().unwrap_or_default().to_string();
        let family = os_family(&id, release.get("ID_LIKE").map(String::as_str), &distribution);

        facts.set("distribution", distribution);
        facts.set("distribution_version", version);
        facts.set("distribution_major_version", major);
        facts.set("os_family", family);
        facts
    }
}

fn distribution_name(id: &str) -> String {
    match id {
        "ubuntu" => "Ubuntu".to_string(),
        "debian" => "Debian".to_string(),
        "centos" => "CentOS".to_string(),
        "rhel" => "RedHat".to_string(),
        "fedora" => "Fedora".to_string(),
        "rocky" => "Rocky".to_string(),
        "almalinux" => "AlmaLinux".to_string(),
        "alpine" => "Alpine".to_string(),
        "arch" => "Archlinux".to_string(),
        "amzn" => "Amazon".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        }
    }
}

fn os_family(id: &str, id_like: Option<&str>, distribution: &str) -> String {
    let known = |id: &str| match id {
        "debian" | "ubuntu" => Some("Debian"),
        "rhel" | "centos" | "fedora" | "rocky" | "almalinux" | "amzn" => Some("RedHat"),
        "alpine" => Some("Alpine"),
        "arch" => Some("Archlinux"),
        "suse" | "opensuse" | "sles" => Some("Suse"),
        _ => None,
    };
    known(id)
        .or_else(|| id_like.and_then(|like| like.split_whitespace().find_map(known)))
        .map(str::to_string)
        .unwrap_or_else(|| distribution.to_string())
}

/// Gather facts from the host behind `connection`
pub async fn gather(
    connection: &dyn Connection,
    options: Option<ExecuteOptions>,
) -> ConnectionResult<Facts> {
    let result = connection.execute(&gather_script(), options).await?;
    if !result.success {
        return Err(ConnectionError::ExecutionFailed(format!(
            "fact gathering failed (rc={}): {}",
            result.exit_code,
            result.stderr.trim()
        )));
    }
    let facts = Facts::parse(&result.stdout);
    debug!(host = %connection.identifier(), count = facts.all().len(), "Gathered facts");
    Ok(facts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LocalConnection;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    const UBUNTU: &str = "system=Linux\narchitecture=x86_64\nkernel=6.1.0\nnodename=web1\n\
        hostname=web1\nfqdn=web1.example.com\n--- os-release ---\n\
        NAME=\"Ubuntu\"\nVERSION_ID=\"22.04\"\nID=ubuntu\nID_LIKE=debian\n";

    #[test]
    fn test_parse_ubuntu() {
        let facts = Facts::parse(UBUNTU);
        assert_eq!(facts.get("distribution"), Some(&json!("Ubuntu")));
        assert_eq!(facts.get("distribution_version"), Some(&json!("22.04")));
        assert_eq!(facts.get("distribution_major_version"), Some(&json!("22")));
        assert_eq!(facts.get("os_family"), Some(&json!("Debian")));
        assert_eq!(facts.get("fqdn"), Some(&json!("web1.example.com")));

        let vars = facts.to_vars();
        assert_eq!(vars["ansible_architecture"], json!("x86_64"));
    }

    #[test]
    fn test_parse_id_like_and_missing_release() {
        let facts = Facts::parse("system=Linux\n--- os-release ---\nID=pop\nID_LIKE=\"ubuntu debian\"\n");
        assert_eq!(facts.get("distribution"), Some(&json!("Pop")));
        assert_eq!(facts.get("os_family"), Some(&json!("Debian")));

        let facts = Facts::parse("system=Darwin\n--- os-release ---\n");
        assert_eq!(facts.get("distribution"), Some(&json!("Darwin")));
        assert_eq!(facts.get("os_family"), Some(&json!("Darwin")));
    }

    #[tokio::test]
    async fn test_gather_local() {
        let conn = LocalConnection::new("localhost");
        let facts = gather(&conn, None).await.unwrap();
        assert!(facts.get("system").is_some());
        assert!(facts.get("hostname").is_some());
    }
}
