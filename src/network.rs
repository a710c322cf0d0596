use crate::apparmor::AppArmor;
use crate::bgp::BgpSpeaker;
use crate::bridge::BridgeNetwork;
use crate::config::DaemonConfig;
use crate::db::{Cluster, InstanceFilter, NetworkRecord, NetworkStatus};
use crate::dnsmasq::NetworkDir;
use crate::firewall::Firewall;
use crate::forward::{NetworkForward, NetworkForwardPut, NetworkForwardsPost};
use crate::ip::HostNetwork;
use crate::revert::Reverter;
use crate::subprocess::Supervisor;
use crate::{NovaError, Result, log_debug, log_error, log_info};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Flat network configuration, e.g. `ipv4.address` or `tunnel.uplink.protocol`.
pub type ConfigMap = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkPut {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: ConfigMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworksPost {
    pub name: String,
    #[serde(rename = "type", default = "default_network_type")]
    pub network_type: String,
    #[serde(flatten)]
    pub put: NetworkPut,
}

fn default_network_type() -> String {
    "bridge".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkLease {
    pub hostname: String,
    #[serde(default)]
    pub hwaddr: String,
    pub address: String,
    #[serde(rename = "type")]
    pub lease_type: String,
    pub location: String,
}

/// Who is asking. Notifications come from another member that already
/// wrote the shared records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientType {
    Normal,
    Notifier,
}

/// Everything a network driver needs from the daemon.
pub struct DaemonState {
    pub settings: DaemonConfig,
    pub cluster: Arc<Cluster>,
    pub host: Arc<dyn HostNetwork>,
    pub firewall: Arc<dyn Firewall>,
    pub supervisor: Arc<dyn Supervisor>,
    pub bgp: Arc<dyn BgpSpeaker>,
    pub apparmor: Arc<AppArmor>,
}

impl DaemonState {
    pub fn network_dir(&self, network: &str) -> NetworkDir {
        NetworkDir::new(&self.settings.var_dir, network)
    }
}

#[async_trait]
pub trait Network: Send + Sync {
    fn id(&self) -> i64;
    fn name(&self) -> &str;
    fn project(&self) -> &str;
    fn description(&self) -> &str;
    fn status(&self) -> NetworkStatus;
    fn config(&self) -> &ConfigMap;
    fn network_type(&self) -> &'static str;
    fn is_running(&self) -> bool;

    fn validate_name(&self, name: &str) -> Result<()>;
    fn validate(&self, config: &ConfigMap) -> Result<()>;
    /// Apply defaults and resolve `auto` addresses in place.
    fn fill_config(&self, config: &mut ConfigMap) -> Result<()>;

    fn create(&self, client: ClientType) -> Result<()>;
    async fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;
    async fn update(&mut self, put: NetworkPut, client: ClientType) -> Result<()>;
    async fn rename(&mut self, new_name: &str) -> Result<()>;
    fn delete(&self, client: ClientType) -> Result<()>;

    fn uses_dnsmasq(&self) -> bool;
    fn leases(&self, project: &str, client: ClientType) -> Result<Vec<NetworkLease>>;

    fn forwards(&self) -> Result<Vec<NetworkForward>>;
    fn forward_create(&self, forward: NetworkForwardsPost, client: ClientType) -> Result<()>;
    fn forward_update(
        &self,
        listen_address: &str,
        req: NetworkForwardPut,
        client: ClientType,
    ) -> Result<()>;
    fn forward_delete(&self, listen_address: &str, client: ClientType) -> Result<()>;
}

/// Result of comparing stored and requested settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    pub db_update_needed: bool,
    /// Changed keys that affect live state; empty when only `user.*` keys moved.
    pub changed_keys: Vec<String>,
}

pub fn config_changed(
    old_description: &str,
    old: &ConfigMap,
    new: &NetworkPut,
) -> ConfigChange {
    let mut changed: Vec<String> = Vec::new();
    for (key, value) in old {
        if new.config.get(key) != Some(value) {
            changed.push(key.clone());
        }
    }
    for (key, value) in &new.config {
        if old.get(key) != Some(value) && !changed.contains(key) {
            changed.push(key.clone());
        }
    }

    let db_update_needed = !changed.is_empty() || old_description != new.description;
    if changed.iter().all(|key| key.starts_with("user.")) {
        changed.clear();
    }

    ConfigChange {
        db_update_needed,
        changed_keys: changed,
    }
}

fn get<'a>(config: &'a ConfigMap, key: &str) -> &'a str {
    config.get(key).map(String::as_str).unwrap_or_default()
}

/// NIC type of an instance device; managed network attachments are bridged.
pub fn nic_type(device: &ConfigMap) -> &str {
    if !get(device, "network").is_empty() {
        return "bridged";
    }
    get(device, "nictype")
}

/// Whether a `nic` device is attached to the bridge `network`.
pub fn nic_uses_network(device: &ConfigMap, network: &str) -> bool {
    if get(device, "type") != "nic" {
        return false;
    }
    if get(device, "network") == network {
        return true;
    }
    get(device, "nictype") == "bridged" && get(device, "parent") == network
}

/// Driver for a stored record.
pub fn load(state: &Arc<DaemonState>, record: NetworkRecord) -> Result<Box<dyn Network>> {
    match record.network_type.as_str() {
        "bridge" => Ok(Box::new(BridgeNetwork::new(state.clone(), record))),
        other => Err(NovaError::Validation(format!(
            "Unsupported network type {:?}",
            other
        ))),
    }
}

pub fn load_by_name(state: &Arc<DaemonState>, project: &str, name: &str) -> Result<Box<dyn Network>> {
    let record = state
        .cluster
        .transaction(|tx| tx.get_network(project, name))?;
    load(state, record)
}

/// Validate, record and bring up a new network. The record is removed again
/// when the network cannot be started.
pub async fn create_network(
    state: &Arc<DaemonState>,
    project: &str,
    req: NetworksPost,
    client: ClientType,
) -> Result<Box<dyn Network>> {
    log_info!("Creating network: {} ({})", req.name, req.network_type);

    let draft = load(
        state,
        NetworkRecord {
            id: 0,
            project: project.to_string(),
            name: req.name.clone(),
            description: req.put.description.clone(),
            network_type: req.network_type.clone(),
            status: NetworkStatus::Pending,
            config: ConfigMap::new(),
        },
    )?;
    draft.validate_name(&req.name)?;

    let mut config = req.put.config.clone();
    draft.fill_config(&mut config)?;
    draft.validate(&config)?;

    let id = state.cluster.transaction(|tx| {
        tx.create_network(project, &req.name, &req.put.description, &config)
    })?;

    let mut reverter = Reverter::new();
    let cluster = state.cluster.clone();
    reverter.add(move || {
        if let Err(e) = cluster.transaction(|tx| tx.delete_network(id)) {
            log_error!("Failed to remove network record {}: {}", id, e);
        }
    });

    let result = async {
        let network = load_by_name(state, project, &req.name)?;
        network.create(client)?;
        network.start().await?;
        state
            .cluster
            .transaction(|tx| tx.set_network_status(id, NetworkStatus::Created))?;
        load_by_name(state, project, &req.name)
    }
    .await;

    let network = crate::revert::finish(&mut reverter, result)?;
    log_info!("Network {} created", req.name);
    Ok(network)
}

/// Delete a network that nothing references anymore.
pub fn delete_network(
    state: &Arc<DaemonState>,
    project: &str,
    name: &str,
    client: ClientType,
) -> Result<()> {
    let in_use = state.cluster.transaction(|tx| {
        let nic_users = tx
            .instances(&InstanceFilter {
                project: Some(project.to_string()),
                node: None,
            })
            .iter()
            .any(|inst| inst.devices.values().any(|dev| nic_uses_network(dev, name)));
        let uplink_users = tx
            .networks()
            .iter()
            .any(|n| n.project == project && get(&n.config, "network") == name);
        Ok(nic_users || uplink_users)
    })?;

    if in_use {
        return Err(NovaError::Conflict(
            "The network is currently in use".to_string(),
        ));
    }

    let network = load_by_name(state, project, name)?;
    log_debug!("Deleting network {} (id {})", name, network.id());
    network.delete(client)
}
