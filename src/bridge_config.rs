//! Bridge configuration keys, their validators and the cross-key checks.

use crate::network::ConfigMap;
use crate::subnet::{ip_ranges_overlap, parse_cidr, parse_ip_ranges};
use crate::validate::{
    self, ValidResult, ValidationError, Validator, is_false, is_true, is_true_or_empty, optional,
    rule,
};
use crate::{NovaError, Result};
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::str::FromStr;

pub const ACL_ACTIONS: &[&str] = &["allow", "allow-stateless", "drop", "reject"];

fn opt(validator: Validator) -> Validator {
    optional(move |value: &str| validator(value))
}

fn address_or_keyword(cidr: fn(&str) -> ValidResult, alternative: Option<fn(&str) -> ValidResult>) -> Validator {
    optional(move |value: &str| {
        if matches!(value, "none" | "auto") {
            return Ok(());
        }
        match alternative {
            Some(alt) => validate::or(vec![rule(cidr), rule(alt)])(value),
            None => cidr(value),
        }
    })
}

/// `iface` or `iface/parent/vlan` entries, comma separated.
pub fn validate_external_interfaces(value: &str) -> ValidResult {
    for entry in value.split(',').map(str::trim) {
        let parts: Vec<&str> = entry.split('/').collect();
        let name = if parts.len() == 3 { parts[0].trim() } else { entry };
        validate::is_interface_name(name)
            .map_err(|e| ValidationError::new(format!("Invalid interface name {:?}: {}", name, e)))?;

        if parts.len() == 3 {
            let parent = parts[1].trim();
            validate::is_interface_name(parent).map_err(|e| {
                ValidationError::new(format!("Invalid interface name {:?}: {}", parent, e))
            })?;
            let vlan = parts[2]
                .parse::<i64>()
                .map_err(|e| ValidationError::new(format!("Invalid VLAN ID {:?}: {}", parts[2], e)))?;
            if !(1..=4094).contains(&vlan) {
                return Err(ValidationError::new(format!("Invalid VLAN ID {:?}", parts[2])));
            }
        }
    }
    Ok(())
}

fn tunnel_port(value: &str) -> ValidResult {
    validate::is_network_port(value)?;
    if value.parse::<u32>() == Ok(0) {
        return Err(ValidationError::new(format!("Invalid port number: {}", value)));
    }
    Ok(())
}

/// Static per-key rules of a bridge network.
pub fn rules() -> BTreeMap<String, Validator> {
    let table: Vec<(&str, Validator)> = vec![
        ("bgp.ipv4.nexthop", optional(validate::is_network_address_v4)),
        ("bgp.ipv6.nexthop", optional(validate::is_network_address_v6)),
        ("bridge.driver", opt(validate::is_one_of(&["native", "openvswitch"]))),
        ("bridge.external_interfaces", optional(validate_external_interfaces)),
        ("bridge.hwaddr", optional(validate::is_network_mac)),
        ("bridge.mtu", optional(validate::is_network_mtu)),
        ("ipv4.address", address_or_keyword(validate::is_network_address_cidr_v4, None)),
        ("ipv4.firewall", optional(validate::is_bool)),
        ("ipv4.nat", optional(validate::is_bool)),
        ("ipv4.nat.order", opt(validate::is_one_of(&["before", "after"]))),
        ("ipv4.nat.address", optional(validate::is_network_address_v4)),
        ("ipv4.dhcp", optional(validate::is_bool)),
        ("ipv4.dhcp.gateway", optional(validate::is_network_address_v4)),
        ("ipv4.dhcp.expiry", rule(validate::is_any)),
        ("ipv4.dhcp.ranges", opt(validate::is_list_of(validate::is_network_range_v4))),
        ("ipv4.dhcp.routes", optional(validate::is_dhcp_route_list)),
        ("ipv4.routes", opt(validate::is_list_of(validate::is_network_v4))),
        ("ipv4.routing", optional(validate::is_bool)),
        ("ipv4.ovn.ranges", opt(validate::is_list_of(validate::is_network_range_v4))),
        (
            "ipv6.address",
            address_or_keyword(validate::is_network_address_cidr_v6, Some(validate::is_network_v6)),
        ),
        ("ipv6.firewall", optional(validate::is_bool)),
        ("ipv6.nat", optional(validate::is_bool)),
        ("ipv6.nat.order", opt(validate::is_one_of(&["before", "after"]))),
        ("ipv6.nat.address", optional(validate::is_network_address_v6)),
        ("ipv6.dhcp", optional(validate::is_bool)),
        ("ipv6.dhcp.expiry", rule(validate::is_any)),
        ("ipv6.dhcp.stateful", optional(validate::is_bool)),
        ("ipv6.dhcp.ranges", opt(validate::is_list_of(validate::is_network_range_v6))),
        ("ipv6.routes", opt(validate::is_list_of(validate::is_network_v6))),
        ("ipv6.routing", optional(validate::is_bool)),
        ("ipv6.ovn.ranges", opt(validate::is_list_of(validate::is_network_range_v6))),
        ("dns.nameservers", opt(validate::is_list_of(validate::is_network_address))),
        ("dns.domain", rule(validate::is_any)),
        ("dns.mode", opt(validate::is_one_of(&["dynamic", "managed", "none"]))),
        ("dns.search", rule(validate::is_any)),
        ("dns.zone.forward", rule(validate::is_any)),
        ("dns.zone.reverse.ipv4", rule(validate::is_any)),
        ("dns.zone.reverse.ipv6", rule(validate::is_any)),
        ("raw.dnsmasq", rule(validate::is_any)),
        ("security.acls", rule(validate::is_any)),
        ("security.acls.default.ingress.action", opt(validate::is_one_of(ACL_ACTIONS))),
        ("security.acls.default.egress.action", opt(validate::is_one_of(ACL_ACTIONS))),
        ("security.acls.default.ingress.logged", optional(validate::is_bool)),
        ("security.acls.default.egress.logged", optional(validate::is_bool)),
    ];

    table.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

fn tunnel_field_rule(field: &str) -> Option<Validator> {
    let validator = match field {
        "protocol" => opt(validate::is_one_of(&["gre", "vxlan"])),
        "local" | "remote" | "group" => optional(validate::is_network_address),
        "port" => optional(tunnel_port),
        "id" => optional(validate::is_uint32),
        "interface" => rule(validate::is_interface_name),
        "ttl" => optional(validate::is_uint8),
        _ => return None,
    };
    Some(validator)
}

fn bgp_peer_field_rule(field: &str) -> Option<Validator> {
    let validator = match field {
        "address" => optional(validate::is_network_address),
        "asn" => opt(validate::is_in_range(1, 4_294_967_294)),
        "password" => rule(validate::is_any),
        "holdtime" => opt(validate::is_in_range(9, 65535)),
        _ => return None,
    };
    Some(validator)
}

/// Rules for `tunnel.<name>.<field>` and `bgp.peers.<name>.<field>` keys
/// present in `config`.
fn dynamic_rules(network: &str, config: &ConfigMap) -> Result<BTreeMap<String, Validator>> {
    let mut rules = BTreeMap::new();

    for key in config.keys() {
        if key.starts_with("tunnel.") {
            let fields: Vec<&str> = key.split('.').collect();
            if fields.len() != 3 {
                return Err(NovaError::Validation(format!(
                    "Invalid network configuration key: {}",
                    key
                )));
            }
            if network.len() + fields[1].len() > 14 {
                return Err(NovaError::Validation(format!(
                    "Network name too long for tunnel interface: {}-{}",
                    network, fields[1]
                )));
            }
            if let Some(validator) = tunnel_field_rule(fields[2]) {
                rules.insert(key.clone(), validator);
            }
        } else if key.starts_with("bgp.peers.") {
            let fields: Vec<&str> = key.split('.').collect();
            if fields.len() != 4 {
                return Err(NovaError::Validation(format!(
                    "Invalid network configuration key: {:?}",
                    key
                )));
            }
            if let Some(validator) = bgp_peer_field_rule(fields[3]) {
                rules.insert(key.clone(), validator);
            }
        }
    }

    Ok(rules)
}

fn get<'a>(config: &'a ConfigMap, key: &str) -> &'a str {
    config.get(key).map(String::as_str).unwrap_or_default()
}

/// Per-key validation followed by the MTU, MAC and OVN range checks.
/// ACL existence needs the store and is checked by the driver.
pub fn validate_config(network: &str, config: &ConfigMap) -> Result<()> {
    let mut rules = rules();
    rules.extend(dynamic_rules(network, config)?);

    for (key, validator) in &rules {
        validator(get(config, key)).map_err(|e| {
            NovaError::Validation(format!(
                "Invalid value for network {:?} option {:?}: {}",
                network, key, e
            ))
        })?;
    }

    for key in config.keys() {
        if rules.contains_key(key) || key.starts_with("user.") {
            continue;
        }
        return Err(NovaError::Validation(format!(
            "Invalid option for network {:?} option {:?}",
            network, key
        )));
    }

    check_mtu(config)?;

    if !get(config, "bridge.hwaddr").is_empty() {
        check_cluster_wide_mac_safe(config)?;
    }

    check_ovn_ranges(config)?;
    Ok(())
}

fn check_mtu(config: &ConfigMap) -> Result<()> {
    let value = get(config, "bridge.mtu");
    if value.is_empty() {
        return Ok(());
    }

    let mtu = value
        .parse::<i64>()
        .map_err(|_| NovaError::Validation(format!("Invalid value for an integer: {}", value)))?;

    if !validate::is_none_or_empty(get(config, "ipv6.address")) && mtu < 1280 {
        return Err(NovaError::Validation(
            "The minimum MTU for an IPv6 network is 1280".to_string(),
        ));
    }
    if !validate::is_none_or_empty(get(config, "ipv4.address")) && mtu < 68 {
        return Err(NovaError::Validation(
            "The minimum MTU for an IPv4 network is 68".to_string(),
        ));
    }
    Ok(())
}

/// A static `bridge.hwaddr` would be shared by every member. Refuse it
/// whenever the members might sit on the same segment.
pub fn check_cluster_wide_mac_safe(config: &ConfigMap) -> Result<()> {
    if !get(config, "bridge.external_interfaces").is_empty()
        && get(config, "ipv4.address") == "none"
        && get(config, "ipv6.address") == "none"
    {
        return Err(NovaError::Validation(
            "Cannot use static \"bridge.hwaddr\" MAC address when bridge has no IP addresses and has external interfaces set".to_string(),
        ));
    }

    if config.keys().any(|k| k.starts_with("tunnel.")) {
        return Err(NovaError::Validation(
            "Cannot use static \"bridge.hwaddr\" MAC address when bridge has tunnels connected"
                .to_string(),
        ));
    }

    let ipv6 = get(config, "ipv6.address");
    if ipv6 != "none" && validate::is_network_v6(ipv6).is_ok() {
        return Err(NovaError::Validation(
            "Cannot use static \"bridge.hwaddr\" MAC address when bridge uses a host-specific IPv6 address".to_string(),
        ));
    }

    Ok(())
}

fn check_ovn_ranges(config: &ConfigMap) -> Result<()> {
    let ovn_v4 = get(config, "ipv4.ovn.ranges");
    if !ovn_v4.is_empty() && has_dhcp_v4(config) {
        let mut allowed = Vec::new();
        if let Some(subnet) = dhcp_v4_subnet(config) {
            if get(config, "ipv4.dhcp.ranges").is_empty() {
                return Err(NovaError::Validation(
                    "\"ipv4.ovn.ranges\" must be used in conjunction with non-overlapping \"ipv4.dhcp.ranges\" when DHCPv4 is enabled".to_string(),
                ));
            }
            allowed.push(subnet);
        }

        let ovn = parse_ip_ranges(ovn_v4, &allowed)
            .map_err(|e| e.context("Failed parsing ipv4.ovn.ranges"))?;
        let dhcp = parse_ip_ranges(get(config, "ipv4.dhcp.ranges"), &allowed)
            .map_err(|e| e.context("Failed parsing ipv4.dhcp.ranges"))?;
        for ovn_range in &ovn {
            if dhcp.iter().any(|d| ip_ranges_overlap(ovn_range, d)) {
                return Err(NovaError::Validation(format!(
                    "The range specified in \"ipv4.ovn.ranges\" ({:?}) cannot overlap with \"ipv4.dhcp.ranges\"",
                    ovn_range.to_string()
                )));
            }
        }
    }

    let ovn_v6 = get(config, "ipv6.ovn.ranges");
    if !ovn_v6.is_empty() && has_dhcp_v6(config) {
        let stateful = is_true(get(config, "ipv6.dhcp.stateful"));
        let subnet = dhcp_v6_subnet(config);
        let mut allowed = Vec::new();
        if let Some(subnet) = subnet {
            if get(config, "ipv6.dhcp.ranges").is_empty() && stateful {
                return Err(NovaError::Validation(
                    "\"ipv6.ovn.ranges\" must be used in conjunction with non-overlapping \"ipv6.dhcp.ranges\" when stateful DHCPv6 is enabled".to_string(),
                ));
            }
            allowed.push(subnet);
        }

        let ovn = parse_ip_ranges(ovn_v6, &allowed)
            .map_err(|e| e.context("Failed parsing ipv6.ovn.ranges"))?;
        if subnet.is_some() && stateful {
            let dhcp = parse_ip_ranges(get(config, "ipv6.dhcp.ranges"), &allowed)
                .map_err(|e| e.context("Failed parsing ipv6.dhcp.ranges"))?;
            for ovn_range in &ovn {
                if dhcp.iter().any(|d| ip_ranges_overlap(ovn_range, d)) {
                    return Err(NovaError::Validation(format!(
                        "The range specified in \"ipv6.ovn.ranges\" ({:?}) cannot overlap with \"ipv6.dhcp.ranges\"",
                        ovn_range.to_string()
                    )));
                }
            }
        }
    }

    Ok(())
}

pub fn has_dhcp_v4(config: &ConfigMap) -> bool {
    is_true_or_empty(get(config, "ipv4.dhcp"))
}

pub fn has_dhcp_v6(config: &ConfigMap) -> bool {
    is_true_or_empty(get(config, "ipv6.dhcp"))
}

pub fn has_ipv4_firewall(config: &ConfigMap) -> bool {
    !validate::is_none_or_empty(get(config, "ipv4.address"))
        && is_true_or_empty(get(config, "ipv4.firewall"))
}

pub fn has_ipv6_firewall(config: &ConfigMap) -> bool {
    !validate::is_none_or_empty(get(config, "ipv6.address"))
        && is_true_or_empty(get(config, "ipv6.firewall"))
}

pub fn dhcp_v4_subnet(config: &ConfigMap) -> Option<IpNet> {
    if !has_dhcp_v4(config) {
        return None;
    }
    parse_cidr(get(config, "ipv4.address")).ok().map(|n| n.trunc())
}

pub fn dhcp_v6_subnet(config: &ConfigMap) -> Option<IpNet> {
    if !has_dhcp_v6(config) {
        return None;
    }
    parse_cidr(get(config, "ipv6.address")).ok().map(|n| n.trunc())
}

/// Names of ACLs referenced by `security.acls`.
pub fn acl_names(config: &ConfigMap) -> Vec<String> {
    validate::split_trim(get(config, "security.acls"), ',')
}

/// Whether the network needs dnsmasq at all.
pub fn uses_dnsmasq(config: &ConfigMap) -> bool {
    let ipv4 = get(config, "ipv4.address");
    let ipv6 = get(config, "ipv6.address");
    if validate::is_none_or_empty(ipv4) && validate::is_none_or_empty(ipv6) {
        return false;
    }

    get(config, "dns.mode") != "none"
        || !validate::is_none_or_empty(ipv6)
        || (!validate::is_none_or_empty(ipv4) && has_dhcp_v4(config))
}

/// One `bridge.external_interfaces` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalInterface {
    pub name: String,
    /// Parent and VLAN ID when the entry asks for a VLAN sub-interface.
    pub vlan: Option<(String, u16)>,
}

pub fn external_interfaces(config: &ConfigMap) -> Vec<ExternalInterface> {
    validate::split_trim(get(config, "bridge.external_interfaces"), ',')
        .into_iter()
        .map(|entry| {
            let parts: Vec<&str> = entry.split('/').map(str::trim).collect();
            match parts.as_slice() {
                [name, parent, vlan] => ExternalInterface {
                    name: name.to_string(),
                    vlan: vlan.parse::<u16>().ok().map(|id| (parent.to_string(), id)),
                },
                _ => ExternalInterface {
                    name: entry.clone(),
                    vlan: None,
                },
            }
        })
        .collect()
}

/// Tunnel derived from `tunnel.<name>.*` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TunnelConfig {
    pub name: String,
    pub protocol: String,
    pub local: Option<IpAddr>,
    pub remote: Option<IpAddr>,
    pub group: Option<IpAddr>,
    pub port: Option<u16>,
    pub id: Option<u32>,
    pub interface: Option<String>,
    pub ttl: Option<u8>,
}

pub fn tunnel_names(config: &ConfigMap) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for key in config.keys() {
        let Some(rest) = key.strip_prefix("tunnel.") else {
            continue;
        };
        let name = rest.split('.').next().unwrap_or_default().to_string();
        if !names.contains(&name) {
            names.push(name);
        }
    }
    names
}

pub fn tunnels(config: &ConfigMap) -> Vec<TunnelConfig> {
    tunnel_names(config)
        .into_iter()
        .map(|name| {
            let field = |f: &str| get(config, &format!("tunnel.{}.{}", name, f)).to_string();
            let addr = |f: &str| IpAddr::from_str(&field(f)).ok();
            let interface = field("interface");
            TunnelConfig {
                protocol: field("protocol"),
                local: addr("local"),
                remote: addr("remote"),
                group: addr("group"),
                port: field("port").parse().ok(),
                id: field("id").parse().ok(),
                interface: (!interface.is_empty()).then_some(interface),
                ttl: field("ttl").parse().ok(),
                name,
            }
        })
        .collect()
}

/// NAT is on for a family with an address and `<family>.nat` true.
pub fn nat_enabled(config: &ConfigMap, prefix: &str) -> bool {
    !validate::is_none_or_empty(get(config, &format!("{}.address", prefix)))
        && is_true(get(config, &format!("{}.nat", prefix)))
}

/// `ipv4.routing` / `ipv6.routing` default to enabled.
pub fn routing_enabled(config: &ConfigMap, prefix: &str) -> bool {
    !is_false(get(config, &format!("{}.routing", prefix)))
}
