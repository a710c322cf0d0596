//! Address forwards on a bridge network.
//!
//! Forwards are member specific: each member only programs the forwards
//! pinned to it plus the ones without a member.

use crate::bgp::forward_owner;
use crate::db::{ForwardFilter, ForwardRecord, InstanceFilter, WarningType};
use crate::firewall::AddressForward;
use crate::forward::{
    NetworkForwardPut, NetworkForwardsPost, default_target, etag_hash, to_firewall_forwards,
    validate_forward,
};
use crate::ip::Family;
use crate::network::{ConfigMap, DaemonState, nic_type};
use crate::revert::{self, Reverter};
use crate::subnet::parse_ip_to_net;
use crate::usage::external_subnets_in_use;
use crate::{NovaError, Result, log_debug, log_info, log_warn};
use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

fn get<'a>(config: &'a ConfigMap, key: &str) -> &'a str {
    config.get(key).map(String::as_str).unwrap_or_default()
}

/// `192.0.2.010` and `2001:DB8::1` style inputs compare equal to what is stored.
fn normalise_listen_address(value: &str) -> String {
    IpAddr::from_str(value.trim())
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| value.trim().to_string())
}

/// Forward operations bound to one network as seen by the local member.
#[derive(Clone)]
pub(crate) struct ForwardScope {
    pub(crate) state: Arc<DaemonState>,
    pub(crate) network_id: i64,
    pub(crate) project: String,
    pub(crate) network: String,
    pub(crate) config: ConfigMap,
}

impl ForwardScope {
    /// Forwards this member programs, optionally narrowed to one listen address.
    pub(crate) fn local_records(&self, listen_address: Option<&str>) -> Result<Vec<ForwardRecord>> {
        let filter = ForwardFilter {
            network_id: Some(self.network_id),
            listen_address: listen_address.map(normalise_listen_address),
        };
        self.state.cluster.transaction(|tx| {
            let node_id = tx.node_id();
            Ok(tx
                .network_forwards(&filter)
                .into_iter()
                .filter(|f| f.node_id.is_none_or(|id| id == node_id))
                .collect())
        })
    }

    fn find(&self, listen_address: &str) -> Result<ForwardRecord> {
        let mut records = self.local_records(Some(listen_address))?;
        match records.len() {
            0 => Err(NovaError::NotFound("Network forward not found".to_string())),
            1 => Ok(records.remove(0)),
            _ => Err(NovaError::Ambiguous(
                "Network forward found on more than one cluster member. Please target a specific member"
                    .to_string(),
            )),
        }
    }

    fn set_warning(&self, message: Option<&str>) {
        let result = self.state.cluster.transaction(|tx| {
            match message {
                Some(msg) => tx.upsert_warning(
                    &self.project,
                    "network",
                    self.network_id,
                    WarningType::ProxyBridgeNetfilterNotEnabled,
                    msg,
                ),
                None => tx.resolve_warnings(
                    WarningType::ProxyBridgeNetfilterNotEnabled,
                    "network",
                    self.network_id,
                ),
            }
            Ok(())
        });
        if let Err(e) = result {
            log_warn!("Failed to update bridge netfilter warning: {}", e);
        }
    }

    /// Program every local forward of the network in one go.
    pub(crate) fn setup_firewall(&self) -> Result<()> {
        let mut forwards: Vec<AddressForward> = Vec::new();
        let mut families: Vec<Family> = Vec::new();

        for record in self.local_records(None)? {
            let listen = IpAddr::from_str(&record.listen_address).map_err(|_| {
                NovaError::Validation(format!(
                    "Invalid listen address {:?}",
                    record.listen_address
                ))
            })?;
            let put = NetworkForwardPut {
                description: record.description,
                config: record.config,
                ports: record.ports,
            };
            let port_maps = validate_forward(listen, &put)
                .map_err(|e| e.context(format!("Failed validating forward {:?}", record.listen_address)))?;

            let family = if listen.is_ipv4() { Family::V4 } else { Family::V6 };
            if !families.contains(&family) {
                families.push(family);
            }
            forwards.extend(to_firewall_forwards(listen, default_target(&put.config), &port_maps));
        }

        let missing: Vec<Family> = families
            .into_iter()
            .filter(|family| !self.state.host.bridge_netfilter_enabled(*family))
            .collect();
        match missing.first() {
            Some(family) => {
                let msg = format!(
                    "IPv{} bridge netfilter not enabled. Instances using the bridge will not be able to connect to the forward listen IPs",
                    family.version()
                );
                log_warn!("{} (network {})", msg, self.network);
                self.set_warning(Some(&msg));
            }
            None => self.set_warning(None),
        }

        self.state
            .firewall
            .network_apply_forwards(&self.network, &forwards)
            .map_err(|e| e.context("Failed applying firewall address forwards"))
    }

    /// Advertise each local listen address as a host route.
    pub(crate) fn bgp_setup_prefixes(&self) -> Result<()> {
        let owner = forward_owner(self.network_id);
        self.state.bgp.remove_prefix_by_owner(&owner)?;

        for record in self.local_records(None)? {
            let prefix: IpNet = parse_ip_to_net(&record.listen_address)?;
            let key = match Family::of(&prefix) {
                Family::V4 => "bgp.ipv4.nexthop",
                Family::V6 => "bgp.ipv6.nexthop",
            };
            let next_hop = IpAddr::from_str(get(&self.config, key)).ok();
            self.state.bgp.add_prefix(prefix, next_hop, &owner)?;
        }
        Ok(())
    }

    /// Let instances reach forwards that target their own bridge ports.
    fn enable_hairpin(&self) -> Result<()> {
        let host = &self.state.host;
        if !host.bridge_netfilter_enabled(Family::V4) && !host.bridge_netfilter_enabled(Family::V6) {
            return Ok(());
        }

        let server = self.state.settings.server_name.clone();
        let instances = self.state.cluster.transaction(|tx| {
            Ok(tx.instances(&InstanceFilter {
                project: Some(self.project.clone()),
                node: Some(server),
            }))
        })?;

        for inst in instances {
            for (device, nic) in &inst.devices {
                if get(nic, "type") != "nic" || nic_type(nic) != "bridged" {
                    continue;
                }
                let parent = match get(nic, "network") {
                    "" => get(nic, "parent"),
                    network => network,
                };
                if parent != self.network {
                    continue;
                }

                let host_name = match get(nic, "host_name") {
                    "" => get(&inst.config, &format!("volatile.{}.host_name", device)),
                    name => name,
                };
                if host_name.is_empty() || !host.interface_exists(host_name) {
                    continue;
                }

                host.set_hairpin(host_name, true).map_err(|e| {
                    e.context(format!("Error enabling hairpin mode on bridge port {:?}", host_name))
                })?;
                log_debug!("Enabled hairpin mode on {} for {}", host_name, inst.name);
            }
        }
        Ok(())
    }

    fn refresh(&self) -> Result<()> {
        self.setup_firewall()?;
        self.bgp_setup_prefixes()
            .map_err(|e| e.context("Failed applying BGP prefixes for address forwards"))
    }

    pub(crate) fn create(&self, forward: NetworkForwardsPost, hairpin: bool) -> Result<()> {
        let listen_net = parse_ip_to_net(&forward.listen_address)?;
        let listen = listen_net.addr();
        let listen_address = listen.to_string();

        match self.find(&listen_address) {
            Ok(_) | Err(NovaError::Ambiguous(_)) => {
                return Err(NovaError::Conflict(
                    "A forward for that listen address already exists".to_string(),
                ));
            }
            Err(e) if !e.is_not_found() => return Err(e),
            Err(_) => {}
        }

        validate_forward(listen, &forward.put)?;

        let record = ForwardRecord {
            id: 0,
            network_id: self.network_id,
            node_id: None,
            listen_address: listen_address.clone(),
            description: forward.put.description.clone(),
            ports: forward.put.ports.clone(),
            config: forward.put.config.clone(),
        };

        let id = self.state.cluster.transaction(|tx| {
            for usage in external_subnets_in_use(tx)? {
                let own = usage.network_project == self.project
                    && usage.network_name == self.network
                    && usage.instance_device.is_empty();
                if !own && crate::subnet::subnets_overlap(&usage.subnet, &listen_net) {
                    return Err(NovaError::Conflict(format!(
                        "Forward listen address {:?} overlaps with another network or NIC",
                        listen_address
                    )));
                }
            }

            let node_id = tx.node_id();
            tx.create_network_forward(ForwardRecord {
                node_id: Some(node_id),
                ..record
            })
        })?;

        let mut reverter = Reverter::new();
        {
            let scope = self.clone();
            reverter.add(move || {
                let _ = scope
                    .state
                    .cluster
                    .transaction(|tx| tx.delete_network_forward(scope.network_id, id));
                let _ = scope.setup_firewall();
                let _ = scope.bgp_setup_prefixes();
            });
        }

        let result = (|| {
            self.setup_firewall()?;
            if hairpin && self.local_records(None)?.len() <= 1 {
                self.enable_hairpin()?;
            }
            self.bgp_setup_prefixes()
                .map_err(|e| e.context("Failed applying BGP prefixes for address forwards"))
        })();
        revert::finish(&mut reverter, result)?;

        log_info!("Created forward {} on network {}", listen_address, self.network);
        Ok(())
    }

    pub(crate) fn update(&self, listen_address: &str, req: NetworkForwardPut) -> Result<()> {
        let current = self.find(listen_address)?;
        let listen = IpAddr::from_str(&current.listen_address)
            .map_err(|_| NovaError::Validation(format!("Invalid listen address {:?}", current.listen_address)))?;
        validate_forward(listen, &req)?;

        let current_put = NetworkForwardPut {
            description: current.description.clone(),
            config: current.config.clone(),
            ports: current.ports.clone(),
        };
        if etag_hash(&current_put)? == etag_hash(&req)? {
            log_debug!("Forward {} on {} unchanged", current.listen_address, self.network);
            return Ok(());
        }

        let id = current.id;
        self.state
            .cluster
            .transaction(|tx| tx.update_network_forward(id, &req.description, &req.ports, &req.config))?;

        let mut reverter = Reverter::new();
        {
            let scope = self.clone();
            reverter.add(move || {
                let _ = scope.state.cluster.transaction(|tx| {
                    tx.update_network_forward(
                        id,
                        &current_put.description,
                        &current_put.ports,
                        &current_put.config,
                    )
                });
                let _ = scope.setup_firewall();
            });
        }

        let result = self.setup_firewall();
        revert::finish(&mut reverter, result)?;

        log_info!("Updated forward {} on network {}", current.listen_address, self.network);
        Ok(())
    }

    pub(crate) fn delete(&self, listen_address: &str) -> Result<()> {
        let current = self.find(listen_address)?;

        let (network_id, id) = (self.network_id, current.id);
        self.state
            .cluster
            .transaction(|tx| tx.delete_network_forward(network_id, id))?;

        let mut reverter = Reverter::new();
        {
            let scope = self.clone();
            let record = current.clone();
            reverter.add(move || {
                let _ = scope
                    .state
                    .cluster
                    .transaction(|tx| tx.create_network_forward(record));
                let _ = scope.setup_firewall();
                let _ = scope.bgp_setup_prefixes();
            });
        }

        let result = self.refresh();
        revert::finish(&mut reverter, result)?;

        log_info!("Deleted forward {} on network {}", current.listen_address, self.network);
        Ok(())
    }
}
