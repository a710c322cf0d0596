//! dnsmasq command line, static hosts and lease file handling.

use crate::network::ConfigMap;
use crate::subnet::get_ip;
use crate::subprocess::{Process, Supervisor, stop_from_pid_file};
use crate::validate::{is_true, split_trim};
use crate::{NovaError, Result, log_debug};
use ipnet::IpNet;
use std::cmp::Ordering;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const LEASES_FILE: &str = "dnsmasq.leases";
pub const HOSTS_DIR: &str = "dnsmasq.hosts";
pub const PID_FILE: &str = "dnsmasq.pid";
pub const RAW_FILE: &str = "dnsmasq.raw";

/// Files kept for one network under `<var_dir>/networks/<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDir {
    root: PathBuf,
}

impl NetworkDir {
    pub fn new(var_dir: &Path, network: &str) -> Self {
        Self {
            root: var_dir.join("networks").join(network),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn leases(&self) -> PathBuf {
        self.root.join(LEASES_FILE)
    }

    pub fn hosts(&self) -> PathBuf {
        self.root.join(HOSTS_DIR)
    }

    pub fn pid(&self) -> PathBuf {
        self.root.join(PID_FILE)
    }

    pub fn raw(&self) -> PathBuf {
        self.root.join(RAW_FILE)
    }
}

/// Dotted version number such as `2.90`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DottedVersion(Vec<u32>);

impl DottedVersion {
    pub fn parse(value: &str) -> Result<Self> {
        let parts = value
            .trim()
            .split('.')
            .map(|p| p.parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| NovaError::Validation(format!("Invalid version {:?}", value)))?;
        if parts.is_empty() {
            return Err(NovaError::Validation(format!("Invalid version {:?}", value)));
        }
        Ok(Self(parts))
    }
}

impl PartialOrd for DottedVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DottedVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.0.len().max(other.0.len());
        for i in 0..len {
            let a = self.0.get(i).copied().unwrap_or(0);
            let b = other.0.get(i).copied().unwrap_or(0);
            match a.cmp(&b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

impl std::fmt::Display for DottedVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Parse the first line of `dnsmasq --version`.
pub fn parse_version_output(output: &str) -> Result<DottedVersion> {
    let line = output.lines().next().unwrap_or_default();
    let version = line
        .split_whitespace()
        .nth(2)
        .ok_or_else(|| NovaError::Os(format!("Unexpected dnsmasq version output {:?}", line)))?;
    DottedVersion::parse(version)
}

pub fn get_version(supervisor: &dyn Supervisor, program: &Path) -> Result<DottedVersion> {
    let output = supervisor.output(program, &["--version"])?;
    parse_version_output(&output)
}

fn newer_than(version: &DottedVersion, min: &str) -> bool {
    DottedVersion::parse(min).is_ok_and(|min| version > &min)
}

/// Flags every bridge dnsmasq instance starts with.
pub fn base_args(interface: &str, version: &DottedVersion, debug: bool) -> Vec<String> {
    let mut args: Vec<String> = [
        "--keep-in-foreground",
        "--strict-order",
        "--bind-interfaces",
        "--except-interface=lo",
        "--pid-file=",
        "--no-ping",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("--interface={}", interface));

    if newer_than(version, "2.79") {
        args.push("--dhcp-rapid-commit".to_string());
    }
    if newer_than(version, "2.47") {
        args.push("--no-negcache".to_string());
    }
    if !debug && newer_than(version, "2.67") {
        args.extend(["--quiet-dhcp", "--quiet-dhcp6", "--quiet-ra"].map(String::from));
    }

    args
}

/// Lease and hosts file flags, added once whichever family enables DHCP first.
pub fn ensure_dhcp_args(args: &mut Vec<String>, dir: &NetworkDir) {
    if args.iter().any(|a| a == "--dhcp-no-override") {
        return;
    }
    args.push("--dhcp-no-override".to_string());
    args.push("--dhcp-authoritative".to_string());
    args.push(format!("--dhcp-leasefile={}", dir.leases().display()));
    args.push(format!("--dhcp-hostsfile={}", dir.hosts().display()));
}

/// Split `dns.nameservers` into IPv4 and IPv6 servers.
pub fn split_nameservers(value: &str) -> (Vec<String>, Vec<String>) {
    let mut v4 = Vec::new();
    let mut v6 = Vec::new();
    for server in split_trim(value, ',') {
        match IpAddr::from_str(&server) {
            Ok(IpAddr::V4(_)) => v4.push(server),
            _ => v6.push(server),
        }
    }
    (v4, v6)
}

fn get(config: &ConfigMap, key: &str) -> String {
    config.get(key).cloned().unwrap_or_default()
}

/// DHCPv4 options and ranges. `mtu` is only passed when it differs from the
/// kernel default.
pub fn dhcp_v4_args(config: &ConfigMap, subnet: &IpNet, mtu: Option<u32>) -> Vec<String> {
    let mut args = Vec::new();

    let gateway = get(config, "ipv4.dhcp.gateway");
    if !gateway.is_empty() {
        args.push(format!("--dhcp-option-force=3,{}", gateway));
    }

    let nameservers = get(config, "dns.nameservers");
    if !nameservers.is_empty() {
        let (v4, _) = split_nameservers(&nameservers);
        if v4.is_empty() {
            args.push("--dhcp-option-force=6".to_string());
        } else {
            args.push(format!("--dhcp-option-force=6,{}", v4.join(",")));
        }
    }

    if let Some(mtu) = mtu {
        args.push(format!("--dhcp-option-force=26,{}", mtu));
    }

    let search = get(config, "dns.search");
    if !search.is_empty() {
        args.push(format!("--dhcp-option-force=119,{}", search.trim()));
    }

    let routes = get(config, "ipv4.dhcp.routes");
    if !routes.is_empty() {
        args.push(format!("--dhcp-option-force=121,{}", routes.replace(' ', "")));
    }

    let mut expiry = get(config, "ipv4.dhcp.expiry");
    if expiry.is_empty() {
        expiry = "1h".to_string();
    }

    let ranges = get(config, "ipv4.dhcp.ranges");
    if ranges.is_empty() {
        args.push("--dhcp-range".to_string());
        args.push(format!(
            "{},{},{}",
            get_ip(subnet, 2),
            get_ip(subnet, -2),
            expiry
        ));
    } else {
        for range in split_trim(&ranges, ',') {
            args.push("--dhcp-range".to_string());
            args.push(format!("{},{}", range.replace('-', ","), expiry));
        }
    }

    args
}

/// Router advertisement and DHCPv6 flags. `dhcp` reflects `ipv6.dhcp`.
pub fn dhcp_v6_args(config: &ConfigMap, interface: &str, subnet: &IpNet, dhcp: bool) -> Vec<String> {
    let mut args = Vec::new();
    let prefix = subnet.prefix_len();

    if dhcp {
        let mut expiry = get(config, "ipv6.dhcp.expiry");
        if expiry.is_empty() {
            expiry = "1h".to_string();
        }

        if is_true(&get(config, "ipv6.dhcp.stateful")) {
            let ranges = get(config, "ipv6.dhcp.ranges");
            if ranges.is_empty() {
                args.push("--dhcp-range".to_string());
                args.push(format!(
                    "{},{},{},{}",
                    get_ip(subnet, 2),
                    get_ip(subnet, -1),
                    prefix,
                    expiry
                ));
            } else {
                for range in split_trim(&ranges, ',') {
                    args.push("--dhcp-range".to_string());
                    args.push(format!("{},{},{}", range.replace('-', ","), prefix, expiry));
                }
            }
        } else {
            args.push("--dhcp-range".to_string());
            args.push(format!("::,constructor:{},ra-stateless,ra-names", interface));
        }
    } else {
        args.push("--dhcp-range".to_string());
        args.push(format!("::,constructor:{},ra-only", interface));
    }

    let nameservers = get(config, "dns.nameservers");
    if !nameservers.is_empty() {
        let (_, v6) = split_nameservers(&nameservers);
        if v6.is_empty() {
            args.push("--dhcp-option-force=option6:dns-server".to_string());
        } else {
            args.push(format!(
                "--dhcp-option-force=option6:dns-server,[{}]",
                v6.join(",")
            ));
        }
    }

    args
}

/// Local domain serving flags; nothing when `dns.mode` is `none`.
pub fn dns_args(config: &ConfigMap, interface: &str, default_domain: &str) -> Vec<String> {
    if get(config, "dns.mode") == "none" {
        return Vec::new();
    }

    let mut domain = get(config, "dns.domain");
    if domain.is_empty() {
        domain = default_domain.to_string();
    }

    vec![
        "-s".to_string(),
        domain.clone(),
        "--interface-name".to_string(),
        format!("_gateway.{},{}", domain, interface),
        "-S".to_string(),
        format!("/{}/", domain),
    ]
}

/// One static DHCP reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticHost {
    pub file_name: String,
    pub hwaddr: String,
    pub ipv4: Option<IpAddr>,
    pub ipv6: Option<IpAddr>,
    pub hostname: String,
}

impl StaticHost {
    pub fn line(&self) -> String {
        let mut line = self.hwaddr.clone();
        if let Some(v4) = self.ipv4 {
            line.push_str(&format!(",{}", v4));
        }
        if let Some(v6) = self.ipv6 {
            line.push_str(&format!(",[{}]", v6));
        }
        line.push_str(&format!(",{}", self.hostname));
        line
    }
}

/// Replace the content of the hosts directory with `hosts`.
pub fn write_static_hosts(dir: &NetworkDir, hosts: &[StaticHost]) -> Result<()> {
    let path = dir.hosts();
    if path.exists() {
        fs::remove_dir_all(&path)?;
    }
    fs::create_dir_all(&path)?;

    for host in hosts {
        fs::write(path.join(&host.file_name), format!("{}\n", host.line()))?;
    }

    log_debug!("Wrote {} static DHCP host(s) to {}", hosts.len(), path.display());
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    pub hostname: String,
    pub address: String,
    pub hwaddr: String,
}

/// Parse a dnsmasq lease file. IPv6 leases carry no MAC.
pub fn parse_leases(content: &str) -> Vec<DhcpLease> {
    let mut leases = Vec::new();

    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }

        let address = fields[2];
        let hwaddr = if address.contains(':') {
            String::new()
        } else if fields[1].len() >= 17 {
            fields[1].to_lowercase()
        } else if fields[4].len() >= 17 {
            fields[4][fields[4].len() - 17..].to_lowercase()
        } else {
            String::new()
        };

        leases.push(DhcpLease {
            hostname: fields[3].to_string(),
            address: address.to_string(),
            hwaddr,
        });
    }

    leases
}

pub fn read_leases(dir: &NetworkDir) -> Result<Vec<DhcpLease>> {
    let path = dir.leases();
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(parse_leases(&fs::read_to_string(path)?))
}

/// Stop (or reload with `reload`) the dnsmasq recorded for this network.
pub fn kill(supervisor: &dyn Supervisor, dir: &NetworkDir, reload: bool) -> Result<()> {
    let pid = dir.pid();
    if reload {
        if !pid.exists() {
            return Ok(());
        }
        return Process::load(&pid)?.reload(supervisor);
    }
    stop_from_pid_file(supervisor, &pid)
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
    fn version_gating() {
        let old = parse_version_output("Dnsmasq version 2.45  Copyright (c) 2000-2008").unwrap();
        let args = base_args("br0", &old, false);
        assert!(!args.contains(&"--no-negcache".to_string()));
        assert!(!args.contains(&"--dhcp-rapid-commit".to_string()));

        let new = DottedVersion::parse("2.90").unwrap();
        let args = base_args("br0", &new, false);
        assert!(args.contains(&"--dhcp-rapid-commit".to_string()));
        assert!(args.contains(&"--quiet-ra".to_string()));
        assert!(args.contains(&"--interface=br0".to_string()));

        let debug = base_args("br0", &new, true);
        assert!(!debug.contains(&"--quiet-dhcp".to_string()));

        assert!(DottedVersion::parse("2.79").unwrap() < DottedVersion::parse("2.79.1").unwrap());
    }

    #[test]
    fn default_v4_range_skips_network_and_broadcast() {
        let subnet: IpNet = "10.10.10.1/24".parse().unwrap();
        let args = dhcp_v4_args(&ConfigMap::new(), &subnet, None);
        assert_eq!(args, vec!["--dhcp-range", "10.10.10.2,10.10.10.254,1h"]);
    }

    #[test]
    fn explicit_v4_options() {
        let subnet: IpNet = "10.10.10.1/24".parse().unwrap();
        let cfg = config(&[
            ("ipv4.dhcp.ranges", "10.10.10.50-10.10.10.60"),
            ("ipv4.dhcp.expiry", "2h"),
            ("dns.nameservers", "1.1.1.1,2606:4700::1111"),
        ]);
        let args = dhcp_v4_args(&cfg, &subnet, Some(9000));
        assert!(args.contains(&"--dhcp-option-force=6,1.1.1.1".to_string()));
        assert!(args.contains(&"--dhcp-option-force=26,9000".to_string()));
        assert!(args.contains(&"10.10.10.50,10.10.10.60,2h".to_string()));
    }

    #[test]
    fn v6_modes() {
        let subnet: IpNet = "fd42::1/64".parse().unwrap();
        let stateless = dhcp_v6_args(&ConfigMap::new(), "br0", &subnet, true);
        assert!(stateless.contains(&"::,constructor:br0,ra-stateless,ra-names".to_string()));

        let ra_only = dhcp_v6_args(&ConfigMap::new(), "br0", &subnet, false);
        assert!(ra_only.contains(&"::,constructor:br0,ra-only".to_string()));

        let stateful = dhcp_v6_args(&config(&[("ipv6.dhcp.stateful", "true")]), "br0", &subnet, true);
        assert!(stateful.contains(&"fd42::2,fd42::ffff:ffff:ffff:ffff,64,1h".to_string()));
    }

    #[test]
    fn dns_mode_none_disables_domain() {
        assert!(dns_args(&config(&[("dns.mode", "none")]), "br0", "nova").is_empty());
        let args = dns_args(&ConfigMap::new(), "br0", "nova");
        assert_eq!(args[1], "nova");
        assert_eq!(args[3], "_gateway.nova,br0");
    }

    #[test]
    fn leases_parse() {
        let content = "\
1700000000 00:16:3e:aa:bb:cc 10.10.10.23 c1 01:00:16:3e:aa:bb:cc
duid 00:01:00:01:2c:aa:bb:cc:00:16:3e:00:00:01
1700000000 1234 fd42::23 c1 00:03:00:01:00:16:3e:aa:bb:cc
";
        let leases = parse_leases(content);
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].hwaddr, "00:16:3e:aa:bb:cc");
        assert_eq!(leases[1].address, "fd42::23");
        assert!(leases[1].hwaddr.is_empty());
    }

    #[test]
    fn static_hosts_are_rewritten() {
        let tmp = tempdir().unwrap();
        let dir = NetworkDir::new(tmp.path(), "br0");
        let host = StaticHost {
            file_name: "c1.eth0".into(),
            hwaddr: "00:16:3e:aa:bb:cc".into(),
            ipv4: Some("10.10.10.5".parse().unwrap()),
            ipv6: Some("fd42::5".parse().unwrap()),
            hostname: "c1".into(),
        };
        write_static_hosts(&dir, &[host]).unwrap();
        let content = fs::read_to_string(dir.hosts().join("c1.eth0")).unwrap();
        assert_eq!(content, "00:16:3e:aa:bb:cc,10.10.10.5,[fd42::5],c1\n");

        write_static_hosts(&dir, &[]).unwrap();
        assert_eq!(fs::read_dir(dir.hosts()).unwrap().count(), 0);
    }
}
