use crate::network::ConfigMap;
use crate::{NovaError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "NovaBridge.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NovaConfig {
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Networks reconciled by `nova-bridge apply`.
    #[serde(default)]
    pub network: BTreeMap<String, NetworkDecl>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Root for per-network state (`networks/<name>/...`) and the cluster store.
    #[serde(default = "default_var_dir")]
    pub var_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Name of this member, used as lease and forward location.
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_node_id")]
    pub node_id: i64,
    /// Seed for generated bridge MAC addresses.
    #[serde(default)]
    pub certificate_fingerprint: String,
    #[serde(default)]
    pub dnsmasq_user: Option<String>,
    #[serde(default)]
    pub dnsmasq_group: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_dns_domain")]
    pub dns_domain: String,
    /// How long dnsmasq must survive after spawn to count as started.
    #[serde(default = "default_dnsmasq_start_grace_ms")]
    pub dnsmasq_start_grace_ms: u64,
    /// Helper binary relaying proxy device connections.
    #[serde(default = "default_forkproxy")]
    pub forkproxy: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkDecl {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: ConfigMap,
}

fn default_var_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("nova"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/nova"))
}

fn default_log_dir() -> PathBuf {
    default_var_dir().join("logs")
}

fn default_server_name() -> String {
    "none".to_string()
}

fn default_node_id() -> i64 {
    1
}

fn default_dns_domain() -> String {
    "nova".to_string()
}

fn default_dnsmasq_start_grace_ms() -> u64 {
    500
}

fn default_forkproxy() -> String {
    "nova-forkproxy".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            var_dir: default_var_dir(),
            log_dir: default_log_dir(),
            server_name: default_server_name(),
            node_id: default_node_id(),
            certificate_fingerprint: String::new(),
            dnsmasq_user: None,
            dnsmasq_group: None,
            debug: false,
            dns_domain: default_dns_domain(),
            dnsmasq_start_grace_ms: default_dnsmasq_start_grace_ms(),
            forkproxy: default_forkproxy(),
        }
    }
}

impl DaemonConfig {
    pub fn cluster_path(&self) -> PathBuf {
        self.var_dir.join("cluster.json")
    }

    pub fn dnsmasq_log(&self, network: &str) -> PathBuf {
        self.log_dir.join(format!("dnsmasq.{}.log", network))
    }

    /// Runtime files of an instance's devices (`proxy.<device>` PID files).
    pub fn devices_dir(&self, project: &str, instance: &str) -> PathBuf {
        self.var_dir.join("devices").join(format!("{}_{}", project, instance))
    }

    pub fn instance_log_dir(&self, project: &str, instance: &str) -> PathBuf {
        self.log_dir.join(format!("{}_{}", project, instance))
    }
}

impl NovaConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: NovaConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        let config: NovaConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Load `path` when it exists, built-in defaults otherwise.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn get_network(&self, name: &str) -> Option<&NetworkDecl> {
        self.network.get(name)
    }

    pub fn list_networks(&self) -> Vec<&String> {
        self.network.keys().collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.daemon.server_name.trim().is_empty() {
            return Err(NovaError::ConfigError(
                "daemon.server_name must not be empty".to_string(),
            ));
        }
        if self.daemon.node_id < 1 {
            return Err(NovaError::ConfigError(format!(
                "daemon.node_id must be positive, got {}",
                self.daemon.node_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_parsing() {
        let toml_str = r#"
[daemon]
var_dir = "/srv/nova"
server_name = "node1"
node_id = 3
dnsmasq_start_grace_ms = 0

[network.br-test]
description = "lab bridge"

[network.br-test.config]
"ipv4.address" = "10.10.10.1/24"
"ipv4.nat" = "true"
"ipv6.address" = "none"
"#;

        let config = NovaConfig::from_str(toml_str).unwrap();
        assert_eq!(config.daemon.var_dir, PathBuf::from("/srv/nova"));
        assert_eq!(config.daemon.node_id, 3);
        assert_eq!(config.daemon.dns_domain, "nova");
        assert_eq!(config.daemon.dnsmasq_start_grace_ms, 0);
        assert_eq!(config.daemon.cluster_path(), PathBuf::from("/srv/nova/cluster.json"));

        let net = config.get_network("br-test").unwrap();
        assert_eq!(net.description, "lab bridge");
        assert_eq!(net.config.get("ipv4.nat").map(String::as_str), Some("true"));
        assert_eq!(config.list_networks(), vec!["br-test"]);
    }

    #[test]
    fn defaults_apply_without_file() {
        let dir = tempdir().unwrap();
        let config = NovaConfig::load_or_default(dir.path().join("missing.toml")).unwrap();
        assert!(config.network.is_empty());
        assert_eq!(config.daemon.dnsmasq_start_grace_ms, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);

        let mut config = NovaConfig::default();
        config.daemon.server_name = "edge".to_string();
        config.network.insert(
            "br0".to_string(),
            NetworkDecl {
                description: String::new(),
                config: [("ipv4.address".to_string(), "auto".to_string())].into(),
            },
        );
        config.save_to_file(&path).unwrap();

        let loaded = NovaConfig::from_file(&path).unwrap();
        assert_eq!(loaded.daemon.server_name, "edge");
        assert_eq!(loaded.get_network("br0"), config.get_network("br0"));
    }

    #[test]
    fn rejects_bad_node_id() {
        let config = NovaConfig::from_str("[daemon]\nnode_id = 0\n").unwrap();
        assert!(config.validate().is_err());
    }
}
