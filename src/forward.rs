//! Address forward records and port map validation.

use crate::firewall::AddressForward;
use crate::network::ConfigMap;
use crate::validate::{self, split_trim};
use crate::{NovaError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;

/// One port mapping of a forward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardPort {
    #[serde(default)]
    pub description: String,
    pub protocol: String,
    pub listen_port: String,
    pub target_address: String,
    #[serde(default)]
    pub target_port: String,
    #[serde(default)]
    pub snat: bool,
}

/// User modifiable part of a forward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkForwardPut {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub ports: Vec<ForwardPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkForwardsPost {
    pub listen_address: String,
    #[serde(flatten)]
    pub put: NetworkForwardPut,
}

/// Forward as shown to users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkForward {
    pub listen_address: String,
    pub description: String,
    pub config: ConfigMap,
    pub ports: Vec<ForwardPort>,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTarget {
    pub address: IpAddr,
    pub ports: Vec<u16>,
}

/// Validated and expanded form of a [`ForwardPort`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardPortMap {
    pub protocol: String,
    pub listen_ports: Vec<u16>,
    pub target: ForwardTarget,
    pub snat: bool,
}

/// Expand `80,443,8000-8002` into individual ports.
pub fn parse_port_ranges(value: &str) -> Result<Vec<u16>> {
    let mut ports = Vec::new();
    for range in split_trim(value, ',') {
        validate::is_network_port_range(&range)?;
        let (start, end) = match range.split_once('-') {
            Some((start, end)) => (start, end),
            None => (range.as_str(), range.as_str()),
        };
        let start = parse_port(start)?;
        let end = parse_port(end)?;
        ports.extend(start..=end);
    }
    Ok(ports)
}

fn parse_port(value: &str) -> Result<u16> {
    u16::from_str(value.trim())
        .map_err(|_| NovaError::Validation(format!("Invalid port number {:?}", value)))
}

fn same_family(a: &IpAddr, b: &IpAddr) -> bool {
    a.is_ipv4() == b.is_ipv4()
}

/// Check a forward definition for `listen_address` and return its port maps.
pub fn validate_forward(listen_address: IpAddr, put: &NetworkForwardPut) -> Result<Vec<ForwardPortMap>> {
    if listen_address.is_unspecified() || listen_address.is_multicast() {
        return Err(NovaError::Validation(format!(
            "Invalid listen address {:?}",
            listen_address.to_string()
        )));
    }

    for (key, value) in &put.config {
        match key.as_str() {
            "target_address" => {
                let target = IpAddr::from_str(value).map_err(|_| {
                    NovaError::Validation(format!(
                        "Invalid value for network forward config key {:?}: Not an IP address {:?}",
                        key, value
                    ))
                })?;
                if !same_family(&target, &listen_address) {
                    return Err(NovaError::Validation(
                        "Default target address and listen address must be same IP family".to_string(),
                    ));
                }
            }
            k if k.starts_with("user.") => {}
            _ => {
                return Err(NovaError::Validation(format!(
                    "Invalid network forward configuration key {:?}",
                    key
                )));
            }
        }
    }

    let mut seen: HashSet<(String, u16)> = HashSet::new();
    let mut maps = Vec::with_capacity(put.ports.len());

    for (index, port) in put.ports.iter().enumerate() {
        if !matches!(port.protocol.as_str(), "tcp" | "udp") {
            return Err(NovaError::Validation(format!(
                "Invalid port protocol in port specification {}, protocol must be one of: tcp, udp",
                index
            )));
        }

        let target_address = IpAddr::from_str(port.target_address.trim()).map_err(|_| {
            NovaError::Validation(format!(
                "Invalid target address in port specification {}",
                index
            ))
        })?;
        if !same_family(&target_address, &listen_address) {
            return Err(NovaError::Validation(format!(
                "Cannot mix IP versions in listen address and port specification {} target address",
                index
            )));
        }

        let listen_ports = parse_port_ranges(&port.listen_port)
            .map_err(|e| e.context(format!("Invalid listen port in port specification {}", index)))?;
        if listen_ports.is_empty() {
            return Err(NovaError::Validation(format!(
                "Missing listen port in port specification {}",
                index
            )));
        }

        for listen_port in &listen_ports {
            if !seen.insert((port.protocol.clone(), *listen_port)) {
                return Err(NovaError::Validation(format!(
                    "Duplicate listen port {} for protocol {:?} in port specification {}",
                    listen_port, port.protocol, index
                )));
            }
        }

        let target_ports = if port.target_port.trim().is_empty() {
            Vec::new()
        } else {
            parse_port_ranges(&port.target_port)
                .map_err(|e| e.context(format!("Invalid target port in port specification {}", index)))?
        };

        if !target_ports.is_empty() && target_ports.len() != 1 && target_ports.len() != listen_ports.len() {
            return Err(NovaError::Validation(format!(
                "Mismatch of listen port(s) and target port(s) count in port specification {}",
                index
            )));
        }

        maps.push(ForwardPortMap {
            protocol: port.protocol.clone(),
            listen_ports,
            target: ForwardTarget {
                address: target_address,
                ports: target_ports,
            },
            snat: port.snat,
        });
    }

    Ok(maps)
}

/// Content hash used to skip no-op updates.
pub fn etag_hash(put: &NetworkForwardPut) -> Result<String> {
    let payload = serde_json::to_vec(put)?;
    let digest = Sha256::digest(&payload);
    Ok(digest.iter().map(|b| format!("{:02x}", b)).collect())
}

/// Default target address from the forward config, if any.
pub fn default_target(config: &ConfigMap) -> Option<IpAddr> {
    config
        .get("target_address")
        .and_then(|value| IpAddr::from_str(value).ok())
}

/// Firewall representation: a whole-address forward for the default target
/// followed by one entry per port map.
pub fn to_firewall_forwards(
    listen_address: IpAddr,
    default_target: Option<IpAddr>,
    port_maps: &[ForwardPortMap],
) -> Vec<AddressForward> {
    let mut forwards = Vec::with_capacity(port_maps.len() + 1);

    if let Some(target) = default_target {
        forwards.push(AddressForward {
            listen_address,
            target_address: target,
            protocol: String::new(),
            listen_ports: Vec::new(),
            target_ports: Vec::new(),
            snat: false,
        });
    }

    for map in port_maps {
        forwards.push(AddressForward {
            listen_address,
            target_address: map.target.address,
            protocol: map.protocol.clone(),
            listen_ports: map.listen_ports.clone(),
            target_ports: map.target.ports.clone(),
            snat: map.snat,
        });
    }

    forwards
}
