//! External subnet usage across bridge networks, NICs, forwards and proxies.
//!
//! The list is rebuilt from the cluster store on every check and never cached.

use crate::db::{ClusterTx, DEFAULT_PROJECT, ForwardFilter, InstanceFilter, NetworkRecord};
use crate::network::{ConfigMap, nic_uses_network};
use crate::proxy::parse_proxy_address;
use crate::subnet::{parse_cidr, parse_ip_to_net, subnets_overlap};
use crate::validate::{is_false_or_empty, split_trim};
use crate::{NovaError, Result};
use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetUsageType {
    /// Subnet of a network with NAT disabled.
    Network,
    NetworkSnat,
    NetworkRoute,
    NetworkForward,
    /// Route on a NIC attached to a bridge network.
    Instance,
    Proxy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSubnetUsage {
    pub subnet: IpNet,
    pub network_project: String,
    pub network_name: String,
    pub instance_project: String,
    pub instance_name: String,
    pub instance_device: String,
    pub usage_type: SubnetUsageType,
}

impl ExternalSubnetUsage {
    fn network(subnet: IpNet, record: &NetworkRecord, usage_type: SubnetUsageType) -> Self {
        Self {
            subnet,
            network_project: record.project.clone(),
            network_name: record.name.clone(),
            instance_project: String::new(),
            instance_name: String::new(),
            instance_device: String::new(),
            usage_type,
        }
    }

    /// True for usages of `project`/`name` that the network may overlap with itself.
    fn is_own(&self, project: &str, name: &str) -> bool {
        self.network_project == project
            && self.network_name == name
            && matches!(
                self.usage_type,
                SubnetUsageType::Network | SubnetUsageType::NetworkSnat | SubnetUsageType::NetworkRoute
            )
    }
}

fn get<'a>(config: &'a ConfigMap, key: &str) -> &'a str {
    config.get(key).map(String::as_str).unwrap_or_default()
}

fn bridge_networks(tx: &ClusterTx<'_>) -> Vec<NetworkRecord> {
    tx.created_networks()
        .into_iter()
        .filter(|n| n.network_type == "bridge")
        .collect()
}

/// Subnets, SNAT addresses and routes claimed by one bridge network.
pub fn network_external_subnets(record: &NetworkRecord) -> Result<Vec<ExternalSubnetUsage>> {
    let mut usages = Vec::new();

    for (prefix, host_len) in [("ipv4", 32u8), ("ipv6", 128u8)] {
        let address = get(&record.config, &format!("{}.address", prefix));
        if is_false_or_empty(get(&record.config, &format!("{}.nat", prefix))) {
            if let Ok(net) = parse_cidr(address) {
                usages.push(ExternalSubnetUsage::network(net.trunc(), record, SubnetUsageType::Network));
            }
        }

        let key = format!("{}.nat.address", prefix);
        let snat = get(&record.config, &key);
        if !snat.is_empty() {
            let addr = IpAddr::from_str(snat).map_err(|_| {
                NovaError::Validation(format!(
                    "Failed parsing {:?} of {:?} in project {:?}",
                    key, record.name, record.project
                ))
            })?;
            let net = IpNet::new(addr, host_len)
                .map_err(|e| NovaError::Validation(format!("Failed parsing {:?}: {}", key, e)))?;
            usages.push(ExternalSubnetUsage::network(net, record, SubnetUsageType::NetworkSnat));
        }

        for cidr in split_trim(get(&record.config, &format!("{}.routes", prefix)), ',') {
            if let Ok(net) = parse_cidr(&cidr) {
                usages.push(ExternalSubnetUsage::network(net.trunc(), record, SubnetUsageType::NetworkRoute));
            }
        }
    }

    Ok(usages)
}

/// Every external subnet usage visible to this member.
pub fn external_subnets_in_use(tx: &ClusterTx<'_>) -> Result<Vec<ExternalSubnetUsage>> {
    let mut usages = Vec::new();

    let networks = bridge_networks(tx);
    for record in &networks {
        usages.extend(network_external_subnets(record)?);
    }

    let instances = tx.instances(&InstanceFilter::default());
    for instance in &instances {
        for (device, config) in &instance.devices {
            match get(config, "type") {
                "nic" if instance.project == DEFAULT_PROJECT => {
                    let uses_bridge = networks.iter().any(|n| nic_uses_network(config, &n.name));
                    if !uses_bridge {
                        continue;
                    }
                    for key in ["ipv4.routes", "ipv6.routes", "ipv4.routes.external", "ipv6.routes.external"] {
                        for cidr in split_trim(get(config, key), ',') {
                            let Ok(net) = parse_cidr(&cidr) else {
                                continue;
                            };
                            usages.push(ExternalSubnetUsage {
                                subnet: net.trunc(),
                                network_project: DEFAULT_PROJECT.to_string(),
                                network_name: get(config, "network").to_string(),
                                instance_project: instance.project.clone(),
                                instance_name: instance.name.clone(),
                                instance_device: device.clone(),
                                usage_type: SubnetUsageType::Instance,
                            });
                        }
                    }
                }
                "proxy" => {
                    let listen = parse_proxy_address(get(config, "listen"))?;
                    let Ok(net) = parse_ip_to_net(&listen.address) else {
                        continue;
                    };
                    usages.push(ExternalSubnetUsage {
                        subnet: net,
                        network_project: String::new(),
                        network_name: String::new(),
                        instance_project: instance.project.clone(),
                        instance_name: instance.name.clone(),
                        instance_device: device.clone(),
                        usage_type: SubnetUsageType::Proxy,
                    });
                }
                _ => {}
            }
        }
    }

    let node_id = tx.node_id();
    for record in tx.networks() {
        for forward in tx.network_forwards(&ForwardFilter {
            network_id: Some(record.id),
            listen_address: None,
        }) {
            if forward.node_id != Some(node_id) {
                continue;
            }
            let net = parse_ip_to_net(&forward.listen_address).map_err(|_| {
                NovaError::Validation(format!(
                    "Invalid existing forward listen address {:?}",
                    forward.listen_address
                ))
            })?;
            usages.push(ExternalSubnetUsage {
                subnet: net,
                network_project: record.project.clone(),
                network_name: record.name.clone(),
                instance_project: String::new(),
                instance_name: String::new(),
                instance_device: String::new(),
                usage_type: SubnetUsageType::NetworkForward,
            });
        }
    }

    Ok(usages)
}

/// First usage overlapping `candidate`, ignoring the network's own subnet,
/// SNAT address and routes.
pub fn find_overlap<'a>(
    usages: &'a [ExternalSubnetUsage],
    project: &str,
    name: &str,
    candidate: &IpNet,
) -> Option<&'a ExternalSubnetUsage> {
    usages
        .iter()
        .filter(|usage| !usage.is_own(project, name))
        .find(|usage| subnets_overlap(&usage.subnet, candidate))
}

/// Reject a SNAT address that sits inside another bridge network's address
/// subnet (NAT or not) or any other external usage.
pub fn check_snat_address(
    tx: &ClusterTx<'_>,
    project: &str,
    name: &str,
    snat_address: &str,
) -> Result<()> {
    let candidate = parse_ip_to_net(snat_address)?;
    let conflict = || {
        NovaError::Conflict(format!(
            "SNAT address {:?} overlaps with another network or NIC",
            snat_address
        ))
    };

    for record in bridge_networks(tx) {
        if record.project == project && record.name == name {
            continue;
        }
        for key in ["ipv4.address", "ipv6.address"] {
            if let Ok(net) = parse_cidr(get(&record.config, key)) {
                if subnets_overlap(&net.trunc(), &candidate) {
                    return Err(conflict());
                }
            }
        }
    }

    let usages = external_subnets_in_use(tx)?;
    if find_overlap(&usages, project, name, &candidate).is_some() {
        return Err(conflict());
    }

    Ok(())
}

/// Subnets to keep clear when picking an automatic address.
pub fn subnets_in_use(tx: &ClusterTx<'_>) -> Result<Vec<IpNet>> {
    let mut nets: Vec<IpNet> = external_subnets_in_use(tx)?
        .into_iter()
        .map(|u| u.subnet)
        .collect();
    for record in tx.networks() {
        for key in ["ipv4.address", "ipv6.address"] {
            if let Ok(net) = parse_cidr(get(&record.config, key)) {
                nets.push(net.trunc());
            }
        }
    }
    Ok(nets)
}
