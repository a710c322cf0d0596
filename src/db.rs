//! Transactional record store for networks, forwards, instances, ACLs and warnings.
//!
//! A transaction works on a clone of the committed state; the clone replaces
//! the committed state only when the closure returns `Ok` and wrote something.
//! When opened on a path the committed state is mirrored to JSON on every commit.

use crate::forward::ForwardPort;
use crate::network::ConfigMap;
use crate::{NovaError, Result, log_debug};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const DEFAULT_PROJECT: &str = "default";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NetworkStatus {
    Pending,
    Created,
    Errored,
    Unknown,
}

impl std::fmt::Display for NetworkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NetworkStatus::Pending => "Pending",
            NetworkStatus::Created => "Created",
            NetworkStatus::Errored => "Errored",
            NetworkStatus::Unknown => "Unknown",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkRecord {
    pub id: i64,
    pub project: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_network_type")]
    pub network_type: String,
    pub status: NetworkStatus,
    #[serde(default)]
    pub config: ConfigMap,
}

fn default_network_type() -> String {
    "bridge".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardRecord {
    pub id: i64,
    pub network_id: i64,
    /// `None` applies to every member, `Some` pins the forward to one member.
    pub node_id: Option<i64>,
    pub listen_address: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ports: Vec<ForwardPort>,
    #[serde(default)]
    pub config: ConfigMap,
}

#[derive(Debug, Clone, Default)]
pub struct ForwardFilter {
    pub network_id: Option<i64>,
    pub listen_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    #[serde(default)]
    pub id: i64,
    pub project: String,
    pub name: String,
    /// Server name of the member running the instance.
    pub node: String,
    #[serde(default)]
    pub config: ConfigMap,
    /// Expanded devices keyed by device name.
    #[serde(default)]
    pub devices: BTreeMap<String, ConfigMap>,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub project: Option<String>,
    pub node: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AclRule {
    pub action: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub destination_port: String,
    #[serde(default)]
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AclRecord {
    pub project: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub ingress: Vec<AclRule>,
    #[serde(default)]
    pub egress: Vec<AclRule>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WarningType {
    ProxyBridgeNetfilterNotEnabled,
    LargerIPv6PrefixThanSupported,
    AppArmorDisabledDueToRawDnsmasq,
}

impl std::fmt::Display for WarningType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WarningType::ProxyBridgeNetfilterNotEnabled => {
                "Proxy bridge netfilter not enabled"
            }
            WarningType::LargerIPv6PrefixThanSupported => {
                "Larger IPv6 prefix than supported"
            }
            WarningType::AppArmorDisabledDueToRawDnsmasq => {
                "Skipping AppArmor for dnsmasq due to raw.dnsmasq being set"
            }
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WarningStatus {
    New,
    Resolved,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WarningRecord {
    pub uuid: uuid::Uuid,
    pub node_id: i64,
    pub project: String,
    pub entity_type: String,
    pub entity_id: i64,
    pub type_code: WarningType,
    pub message: String,
    pub status: WarningStatus,
    pub count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(default)]
    next_id: i64,
    #[serde(default)]
    networks: BTreeMap<i64, NetworkRecord>,
    #[serde(default)]
    forwards: BTreeMap<i64, ForwardRecord>,
    #[serde(default)]
    instances: BTreeMap<i64, InstanceRecord>,
    #[serde(default)]
    acls: Vec<AclRecord>,
    #[serde(default)]
    warnings: Vec<WarningRecord>,
}

pub struct Cluster {
    state: Mutex<ClusterState>,
    path: Option<PathBuf>,
    node_id: i64,
    commits: AtomicUsize,
}

impl Cluster {
    pub fn in_memory(node_id: i64) -> Self {
        Self {
            state: Mutex::new(ClusterState::default()),
            path: None,
            node_id,
            commits: AtomicUsize::new(0),
        }
    }

    /// Open a store mirrored to `path`, loading it when it already exists.
    pub fn open(path: &Path, node_id: i64) -> Result<Self> {
        let state = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            ClusterState::default()
        };

        Ok(Self {
            state: Mutex::new(state),
            path: Some(path.to_path_buf()),
            node_id,
            commits: AtomicUsize::new(0),
        })
    }

    pub fn node_id(&self) -> i64 {
        self.node_id
    }

    /// Number of committed write transactions since the store was opened.
    pub fn write_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut ClusterTx<'_>) -> Result<T>,
    {
        let mut guard = self
            .state
            .lock()
            .map_err(|_| NovaError::Database("cluster state lock poisoned".to_string()))?;

        let mut working = guard.clone();
        let mut tx = ClusterTx {
            state: &mut working,
            node_id: self.node_id,
            dirty: false,
        };

        let value = f(&mut tx)?;
        let dirty = tx.dirty;
        if dirty {
            if let Some(path) = &self.path {
                persist_state(path, &working)?;
            }
            *guard = working;
            self.commits.fetch_add(1, Ordering::SeqCst);
        }
        Ok(value)
    }
}

fn persist_state(path: &Path, state: &ClusterState) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let payload = serde_json::to_string_pretty(state)?;
    fs::write(path, payload)?;
    log_debug!("Persisted cluster state to {}", path.display());
    Ok(())
}

pub struct ClusterTx<'a> {
    state: &'a mut ClusterState,
    node_id: i64,
    dirty: bool,
}

impl ClusterTx<'_> {
    pub fn node_id(&self) -> i64 {
        self.node_id
    }

    fn next_id(&mut self) -> i64 {
        self.state.next_id += 1;
        self.state.next_id
    }

    pub fn create_network(
        &mut self,
        project: &str,
        name: &str,
        description: &str,
        config: &ConfigMap,
    ) -> Result<i64> {
        if self
            .state
            .networks
            .values()
            .any(|n| n.project == project && n.name == name)
        {
            return Err(NovaError::Conflict(format!(
                "Network {:?} already exists",
                name
            )));
        }

        let id = self.next_id();
        self.state.networks.insert(
            id,
            NetworkRecord {
                id,
                project: project.to_string(),
                name: name.to_string(),
                description: description.to_string(),
                network_type: default_network_type(),
                status: NetworkStatus::Pending,
                config: config.clone(),
            },
        );
        self.dirty = true;
        Ok(id)
    }

    pub fn get_network(&self, project: &str, name: &str) -> Result<NetworkRecord> {
        self.state
            .networks
            .values()
            .find(|n| n.project == project && n.name == name)
            .cloned()
            .ok_or_else(|| NovaError::NotFound("Network not found".to_string()))
    }

    pub fn get_network_by_id(&self, id: i64) -> Result<NetworkRecord> {
        self.state
            .networks
            .get(&id)
            .cloned()
            .ok_or_else(|| NovaError::NotFound("Network not found".to_string()))
    }

    /// Every network in every project.
    pub fn networks(&self) -> Vec<NetworkRecord> {
        self.state.networks.values().cloned().collect()
    }

    pub fn created_networks(&self) -> Vec<NetworkRecord> {
        self.state
            .networks
            .values()
            .filter(|n| n.status == NetworkStatus::Created)
            .cloned()
            .collect()
    }

    pub fn update_network(&mut self, id: i64, description: &str, config: &ConfigMap) -> Result<()> {
        let record = self
            .state
            .networks
            .get_mut(&id)
            .ok_or_else(|| NovaError::NotFound("Network not found".to_string()))?;
        record.description = description.to_string();
        record.config = config.clone();
        self.dirty = true;
        Ok(())
    }

    pub fn set_network_status(&mut self, id: i64, status: NetworkStatus) -> Result<()> {
        let record = self
            .state
            .networks
            .get_mut(&id)
            .ok_or_else(|| NovaError::NotFound("Network not found".to_string()))?;
        record.status = status;
        self.dirty = true;
        Ok(())
    }

    pub fn rename_network(&mut self, id: i64, new_name: &str) -> Result<()> {
        let project = self.get_network_by_id(id)?.project;
        if self
            .state
            .networks
            .values()
            .any(|n| n.project == project && n.name == new_name)
        {
            return Err(NovaError::Conflict(format!(
                "Network {:?} already exists",
                new_name
            )));
        }

        if let Some(record) = self.state.networks.get_mut(&id) {
            record.name = new_name.to_string();
        }
        self.dirty = true;
        Ok(())
    }

    pub fn delete_network(&mut self, id: i64) -> Result<()> {
        if self.state.networks.remove(&id).is_none() {
            return Err(NovaError::NotFound("Network not found".to_string()));
        }
        self.state.forwards.retain(|_, f| f.network_id != id);
        self.dirty = true;
        Ok(())
    }

    pub fn network_forwards(&self, filter: &ForwardFilter) -> Vec<ForwardRecord> {
        self.state
            .forwards
            .values()
            .filter(|f| filter.network_id.is_none_or(|id| f.network_id == id))
            .filter(|f| {
                filter
                    .listen_address
                    .as_deref()
                    .is_none_or(|addr| f.listen_address == addr)
            })
            .cloned()
            .collect()
    }

    pub fn create_network_forward(&mut self, mut record: ForwardRecord) -> Result<i64> {
        self.get_network_by_id(record.network_id)?;
        let id = self.next_id();
        record.id = id;
        self.state.forwards.insert(id, record);
        self.dirty = true;
        Ok(id)
    }

    pub fn update_network_forward(
        &mut self,
        id: i64,
        description: &str,
        ports: &[ForwardPort],
        config: &ConfigMap,
    ) -> Result<()> {
        let record = self
            .state
            .forwards
            .get_mut(&id)
            .ok_or_else(|| NovaError::NotFound("Network forward not found".to_string()))?;
        record.description = description.to_string();
        record.ports = ports.to_vec();
        record.config = config.clone();
        self.dirty = true;
        Ok(())
    }

    pub fn delete_network_forward(&mut self, network_id: i64, id: i64) -> Result<()> {
        let owned = self
            .state
            .forwards
            .get(&id)
            .is_some_and(|record| record.network_id == network_id);
        if !owned {
            return Err(NovaError::NotFound("Network forward not found".to_string()));
        }
        self.state.forwards.remove(&id);
        self.dirty = true;
        Ok(())
    }

    pub fn instances(&self, filter: &InstanceFilter) -> Vec<InstanceRecord> {
        self.state
            .instances
            .values()
            .filter(|i| filter.project.as_deref().is_none_or(|p| i.project == p))
            .filter(|i| filter.node.as_deref().is_none_or(|n| i.node == n))
            .cloned()
            .collect()
    }

    pub fn create_instance(&mut self, mut record: InstanceRecord) -> Result<i64> {
        if self
            .state
            .instances
            .values()
            .any(|i| i.project == record.project && i.name == record.name)
        {
            return Err(NovaError::Conflict(format!(
                "Instance {:?} already exists",
                record.name
            )));
        }
        let id = self.next_id();
        record.id = id;
        self.state.instances.insert(id, record);
        self.dirty = true;
        Ok(id)
    }

    pub fn create_network_acl(&mut self, record: AclRecord) -> Result<()> {
        if self.acl_exists(&record.project, &record.name) {
            return Err(NovaError::Conflict(format!(
                "Network ACL {:?} already exists",
                record.name
            )));
        }
        self.state.acls.push(record);
        self.dirty = true;
        Ok(())
    }

    pub fn acl_exists(&self, project: &str, name: &str) -> bool {
        self.state
            .acls
            .iter()
            .any(|acl| acl.project == project && acl.name == name)
    }

    /// Load the named ACLs, failing on the first one that does not exist.
    pub fn network_acls(&self, project: &str, names: &[String]) -> Result<Vec<AclRecord>> {
        names
            .iter()
            .map(|name| {
                self.state
                    .acls
                    .iter()
                    .find(|acl| acl.project == project && &acl.name == name)
                    .cloned()
                    .ok_or_else(|| {
                        NovaError::NotFound(format!("Network ACL {:?} not found", name))
                    })
            })
            .collect()
    }

    /// Record or refresh an unresolved warning for this member.
    pub fn upsert_warning(
        &mut self,
        project: &str,
        entity_type: &str,
        entity_id: i64,
        type_code: WarningType,
        message: &str,
    ) {
        let now = Utc::now();
        let node_id = self.node_id;
        if let Some(existing) = self.state.warnings.iter_mut().find(|w| {
            w.node_id == node_id
                && w.type_code == type_code
                && w.entity_type == entity_type
                && w.entity_id == entity_id
        }) {
            existing.message = message.to_string();
            existing.status = WarningStatus::New;
            existing.count += 1;
            existing.last_seen = now;
        } else {
            self.state.warnings.push(WarningRecord {
                uuid: uuid::Uuid::new_v4(),
                node_id,
                project: project.to_string(),
                entity_type: entity_type.to_string(),
                entity_id,
                type_code,
                message: message.to_string(),
                status: WarningStatus::New,
                count: 1,
                first_seen: now,
                last_seen: now,
            });
        }
        self.dirty = true;
    }

    pub fn resolve_warnings(&mut self, type_code: WarningType, entity_type: &str, entity_id: i64) {
        let node_id = self.node_id;
        for warning in self.state.warnings.iter_mut().filter(|w| {
            w.node_id == node_id
                && w.type_code == type_code
                && w.entity_type == entity_type
                && w.entity_id == entity_id
                && w.status != WarningStatus::Resolved
        }) {
            warning.status = WarningStatus::Resolved;
            self.dirty = true;
        }
    }

    pub fn warnings(&self) -> Vec<WarningRecord> {
        self.state.warnings.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(pairs: &[(&str, &str)]) -> ConfigMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn failed_transaction_leaves_no_trace() {
        let cluster = Cluster::in_memory(1);
        let res: Result<()> = cluster.transaction(|tx| {
            tx.create_network(DEFAULT_PROJECT, "br0", "", &ConfigMap::new())?;
            Err(NovaError::Os("abort".into()))
        });
        assert!(res.is_err());
        assert_eq!(cluster.write_count(), 0);

        let found = cluster.transaction(|tx| Ok(tx.get_network(DEFAULT_PROJECT, "br0").is_ok()));
        assert!(!found.unwrap());
    }

    #[test]
    fn read_only_transactions_do_not_count() {
        let cluster = Cluster::in_memory(1);
        cluster
            .transaction(|tx| tx.create_network(DEFAULT_PROJECT, "br0", "", &ConfigMap::new()))
            .unwrap();
        assert_eq!(cluster.write_count(), 1);
        cluster.transaction(|tx| Ok(tx.networks())).unwrap();
        assert_eq!(cluster.write_count(), 1);
    }

    #[test]
    fn duplicate_network_names_conflict() {
        let cluster = Cluster::in_memory(1);
        let err = cluster
            .transaction(|tx| {
                tx.create_network(DEFAULT_PROJECT, "br0", "", &ConfigMap::new())?;
                tx.create_network(DEFAULT_PROJECT, "br0", "", &ConfigMap::new())
            })
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[test]
    fn forward_filters() {
        let cluster = Cluster::in_memory(1);
        cluster
            .transaction(|tx| {
                let id = tx.create_network(DEFAULT_PROJECT, "br0", "", &ConfigMap::new())?;
                for (addr, node) in [("10.0.0.1", Some(1)), ("10.0.0.1", Some(2)), ("10.0.0.2", None)] {
                    tx.create_network_forward(ForwardRecord {
                        id: 0,
                        network_id: id,
                        node_id: node,
                        listen_address: addr.to_string(),
                        description: String::new(),
                        ports: Vec::new(),
                        config: ConfigMap::new(),
                    })?;
                }
                Ok(())
            })
            .unwrap();

        let matched = cluster
            .transaction(|tx| {
                Ok(tx.network_forwards(&ForwardFilter {
                    network_id: None,
                    listen_address: Some("10.0.0.1".to_string()),
                }))
            })
            .unwrap();
        assert_eq!(matched.len(), 2);
    }

    #[test]
    fn warnings_upsert_and_resolve() {
        let cluster = Cluster::in_memory(3);
        cluster
            .transaction(|tx| {
                tx.upsert_warning("default", "network", 7, WarningType::LargerIPv6PrefixThanSupported, "a");
                tx.upsert_warning("default", "network", 7, WarningType::LargerIPv6PrefixThanSupported, "b");
                Ok(())
            })
            .unwrap();

        let warnings = cluster.transaction(|tx| Ok(tx.warnings())).unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].count, 2);
        assert_eq!(warnings[0].message, "b");

        cluster
            .transaction(|tx| {
                tx.resolve_warnings(WarningType::LargerIPv6PrefixThanSupported, "network", 7);
                Ok(())
            })
            .unwrap();
        let warnings = cluster.transaction(|tx| Ok(tx.warnings())).unwrap();
        assert_eq!(warnings[0].status, WarningStatus::Resolved);
    }

    #[test]
    fn state_survives_reopen() {
        let tmp = tempdir().expect("temp dir");
        let path = tmp.path().join("cluster.json");

        let cluster = Cluster::open(&path, 1).unwrap();
        cluster
            .transaction(|tx| {
                tx.create_network(
                    DEFAULT_PROJECT,
                    "br0",
                    "lab",
                    &config(&[("ipv4.address", "10.0.0.1/24")]),
                )
            })
            .unwrap();

        let reopened = Cluster::open(&path, 1).unwrap();
        let record = reopened
            .transaction(|tx| tx.get_network(DEFAULT_PROJECT, "br0"))
            .unwrap();
        assert_eq!(record.description, "lab");
        assert_eq!(record.config["ipv4.address"], "10.0.0.1/24");
        assert_eq!(record.status, NetworkStatus::Pending);
    }
}
