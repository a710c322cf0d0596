//! Composable string validators used by the network config rule tables.
//!
//! Every validator takes the raw config value and returns a
//! [`ValidationError`] describing what is wrong with it. Combinators build
//! rules out of the primitives: `and` stops at the first failure, `or` accepts
//! the first success and `optional` lets the empty string through.

use ipnet::IpNet;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        ValidationError(msg.into())
    }
}

pub type ValidResult = std::result::Result<(), ValidationError>;

pub type Validator = Arc<dyn Fn(&str) -> ValidResult + Send + Sync>;

fn fail<T>(msg: impl Into<String>) -> std::result::Result<T, ValidationError> {
    Err(ValidationError::new(msg))
}

pub fn rule<F>(f: F) -> Validator
where
    F: Fn(&str) -> ValidResult + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn and(validators: Vec<Validator>) -> Validator {
    rule(move |value| {
        for validator in &validators {
            validator(value)?;
        }
        Ok(())
    })
}

pub fn or(validators: Vec<Validator>) -> Validator {
    rule(move |value| {
        if validators.iter().any(|validator| validator(value).is_ok()) {
            return Ok(());
        }
        fail(format!("{:?} isn't a valid value", value))
    })
}

pub fn optional<F>(validator: F) -> Validator
where
    F: Fn(&str) -> ValidResult + Send + Sync + 'static,
{
    rule(move |value| {
        if value.is_empty() {
            return Ok(());
        }
        validator(value)
    })
}

pub fn is_one_of(valid: &'static [&'static str]) -> Validator {
    rule(move |value| {
        if valid.contains(&value) {
            return Ok(());
        }
        fail(format!("Invalid value {:?} (not one of {:?})", value, valid))
    })
}

pub fn is_list_of<F>(validator: F) -> Validator
where
    F: Fn(&str) -> ValidResult + Send + Sync + 'static,
{
    rule(move |value| {
        for item in value.split(',') {
            let item = item.trim();
            validator(item).map_err(|e| ValidationError(format!("Item {:?}: {}", item, e)))?;
        }
        Ok(())
    })
}

pub fn is_in_range(min: i64, max: i64) -> Validator {
    rule(move |value| {
        let parsed = value
            .parse::<i64>()
            .map_err(|_| ValidationError(format!("Invalid value for an integer {:?}", value)))?;
        if parsed < min || parsed > max {
            return fail(format!(
                "Value isn't within valid range. Must be between {} and {}",
                min, max
            ));
        }
        Ok(())
    })
}

pub fn is_any(_value: &str) -> ValidResult {
    Ok(())
}

pub fn is_not_empty(value: &str) -> ValidResult {
    if value.is_empty() {
        return fail("Required value");
    }
    Ok(())
}

pub fn is_bool(value: &str) -> ValidResult {
    const VALID: [&str; 8] = ["true", "false", "yes", "no", "1", "0", "on", "off"];
    if !VALID.contains(&value.to_lowercase().as_str()) {
        return fail(format!("Invalid value for a boolean {:?}", value));
    }
    Ok(())
}

pub fn is_uint8(value: &str) -> ValidResult {
    value.parse::<u8>().map(|_| ()).map_err(|_| {
        ValidationError(format!(
            "Invalid value for an integer {:?}. Must be between 0 and 255",
            value
        ))
    })
}

pub fn is_uint32(value: &str) -> ValidResult {
    value
        .parse::<u32>()
        .map(|_| ())
        .map_err(|e| ValidationError(format!("Invalid value for uint32 {:?}: {}", value, e)))
}

pub fn is_interface_name(value: &str) -> ValidResult {
    if value.len() < 2 {
        return fail("Network interface is too short (minimum 2 characters)");
    }
    if value.len() > 15 {
        return fail("Network interface is too long (maximum 15 characters)");
    }
    let valid = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return fail("Network interface contains invalid characters");
    }
    Ok(())
}

pub fn is_network_mac(value: &str) -> ValidResult {
    if value.len() != 17 || parse_mac(value).is_none() {
        return fail("Invalid MAC address, must be 6 bytes of hex separated by colons");
    }
    Ok(())
}

pub fn is_network_address(value: &str) -> ValidResult {
    if IpAddr::from_str(value).is_err() {
        return fail(format!("Not an IP address {:?}", value));
    }
    Ok(())
}

pub fn is_network_address_v4(value: &str) -> ValidResult {
    match IpAddr::from_str(value) {
        Ok(IpAddr::V4(_)) => Ok(()),
        _ => fail(format!("Not an IPv4 address {:?}", value)),
    }
}

pub fn is_network_address_v6(value: &str) -> ValidResult {
    match IpAddr::from_str(value) {
        Ok(IpAddr::V6(_)) => Ok(()),
        _ => fail(format!("Not an IPv6 address {:?}", value)),
    }
}

fn parse_cidr(value: &str) -> std::result::Result<IpNet, ValidationError> {
    IpNet::from_str(value).map_err(|_| ValidationError(format!("Invalid CIDR address: {}", value)))
}

pub fn is_network_v4(value: &str) -> ValidResult {
    let net = parse_cidr(value)?;
    if !matches!(net, IpNet::V4(_)) {
        return fail(format!("Not an IPv4 network {:?}", value));
    }
    if net.addr() != net.network() {
        return fail(format!("Not an IPv4 network address {:?}", value));
    }
    Ok(())
}

pub fn is_network_v6(value: &str) -> ValidResult {
    let net = parse_cidr(value)?;
    if !matches!(net, IpNet::V6(_)) {
        return fail(format!("Not an IPv6 network {:?}", value));
    }
    if net.addr() != net.network() {
        return fail(format!("Not an IPv6 network address {:?}", value));
    }
    Ok(())
}

pub fn is_network_address_cidr_v4(value: &str) -> ValidResult {
    let net = parse_cidr(value)?;
    if !matches!(net, IpNet::V4(_)) {
        return fail(format!("Not an IPv4 address {:?}", value));
    }
    if net.addr() == net.network() {
        return fail(format!("Not a usable IPv4 address {:?}", value));
    }
    Ok(())
}

pub fn is_network_address_cidr_v6(value: &str) -> ValidResult {
    let net = parse_cidr(value)?;
    if !matches!(net, IpNet::V6(_)) {
        return fail(format!("Not an IPv6 address {:?}", value));
    }
    if net.addr() == net.network() {
        return fail(format!("Not a usable IPv6 address {:?}", value));
    }
    Ok(())
}

fn range_parts(value: &str) -> std::result::Result<(&str, &str), ValidationError> {
    value
        .split_once('-')
        .ok_or_else(|| ValidationError::new("IP range must contain start and end IP addresses"))
}

pub fn is_network_range_v4(value: &str) -> ValidResult {
    let (start, end) = range_parts(value)?;
    is_network_address_v4(start)?;
    is_network_address_v4(end)
}

pub fn is_network_range_v6(value: &str) -> ValidResult {
    let (start, end) = range_parts(value)?;
    is_network_address_v6(start)?;
    is_network_address_v6(end)
}

/// Accepts 1-16384. The per-family minimums (68 for IPv4, 1280 for IPv6)
/// depend on the rest of the config and are checked by the network driver.
pub fn is_network_mtu(value: &str) -> ValidResult {
    let mtu = value
        .parse::<u32>()
        .map_err(|_| ValidationError(format!("Invalid MTU {:?}", value)))?;
    if !(1..=16384).contains(&mtu) {
        return fail(format!("Out of MTU range (1-16384) {:?}", value));
    }
    Ok(())
}

pub fn is_network_port(value: &str) -> ValidResult {
    let port = value
        .parse::<u32>()
        .map_err(|_| ValidationError(format!("Invalid port number {:?}", value)))?;
    if port > 65535 {
        return fail(format!("Out of port number range (0-65535) {:?}", value));
    }
    Ok(())
}

pub fn is_network_port_range(value: &str) -> ValidResult {
    let (start, end) = match value.split_once('-') {
        Some((start, end)) => (start, Some(end)),
        None => (value, None),
    };
    let start_port = start
        .parse::<u32>()
        .map_err(|_| ValidationError(format!("Invalid port number {:?}", value)))?;
    if start_port > 65535 {
        return fail(format!("Out of port number range (0-65535) {:?}", value));
    }
    if let Some(end) = end {
        let end_port = end
            .parse::<u32>()
            .map_err(|_| ValidationError(format!("Invalid end port number {:?}", value)))?;
        if end_port > 65535 {
            return fail(format!("Out of port number range (0-65535) {:?}", value));
        }
        if start_port >= end_port {
            return fail(format!(
                "Start port {} must be lower than end port {}",
                start_port, end_port
            ));
        }
    }
    Ok(())
}

/// Alternating `subnet,gateway` pairs as handed to DHCP option 121.
pub fn is_dhcp_route_list(value: &str) -> ValidResult {
    let parts: Vec<&str> = value.split(',').collect();
    for (i, part) in parts.iter().enumerate() {
        if i % 2 == 0 {
            is_network_v4(part)?;
        } else {
            is_network_address_v4(part)?;
        }
    }
    if parts.len() % 2 != 0 {
        return fail(format!(
            "missing gateway for route {}",
            parts.last().copied().unwrap_or_default()
        ));
    }
    Ok(())
}

pub fn parse_mac(value: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = value.split(':');
    for byte in mac.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn is_true(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

pub fn is_false(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "false" | "0" | "no" | "off")
}

pub fn is_true_or_empty(value: &str) -> bool {
    value.is_empty() || is_true(value)
}

pub fn is_false_or_empty(value: &str) -> bool {
    value.is_empty() || is_false(value)
}

pub fn is_none_or_empty(value: &str) -> bool {
    value.is_empty() || value == "none"
}

/// Split on `sep`, trim every item and drop empty ones.
pub fn split_trim(value: &str, sep: char) -> Vec<String> {
    value
        .split(sep)
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}
