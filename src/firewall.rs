//! Firewall backend used by bridge networks.
//!
//! The bridge driver never edits individual rules. It hands the backend a
//! complete description (network options, forwards, ACLs) and the backend
//! replaces whatever it had before for that network.

use crate::db::{AclRecord, AclRule};
use crate::ip::Family;
use crate::validate::split_trim;
use crate::{NovaError, Result, log_debug, log_error};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::net::IpAddr;
use std::process::{Command, Stdio};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FirewallBackend {
    Nftables,
    Xtables,
}

impl std::fmt::Display for FirewallBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FirewallBackend::Nftables => write!(f, "nftables"),
            FirewallBackend::Xtables => write!(f, "xtables"),
        }
    }
}

/// Per family toggles for the network's own traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeatureOpts {
    pub icmp_dhcp_dns_access: bool,
    pub forwarding_allow: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnatOpts {
    pub subnet: IpNet,
    /// Fixed source address, masquerade when unset.
    pub snat_address: Option<IpAddr>,
    /// Evaluate after other postrouting NAT rules instead of before.
    pub append: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FirewallOptions {
    pub features_v4: Option<FeatureOpts>,
    pub features_v6: Option<FeatureOpts>,
    pub snat_v4: Option<SnatOpts>,
    pub snat_v6: Option<SnatOpts>,
    pub acl: bool,
}

/// One DNAT entry. An empty protocol forwards the whole address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressForward {
    pub listen_address: IpAddr,
    pub target_address: IpAddr,
    pub protocol: String,
    pub listen_ports: Vec<u16>,
    pub target_ports: Vec<u16>,
    pub snat: bool,
}

/// ACLs attached to a network plus its default actions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AclRuleset {
    pub acls: Vec<AclRecord>,
    pub default_ingress: String,
    pub default_egress: String,
    pub address_sets: bool,
}

pub trait Firewall: Send + Sync {
    fn backend(&self) -> FirewallBackend;
    fn network_setup(&self, network: &str, opts: &FirewallOptions) -> Result<()>;
    /// Remove the network's rules for `ip_versions`. With `delete` the
    /// forward and ACL tables go as well.
    fn network_clear(&self, network: &str, delete: bool, ip_versions: &[u8]) -> Result<()>;
    fn network_apply_forwards(&self, network: &str, forwards: &[AddressForward]) -> Result<()>;
    fn network_apply_acls(&self, network: &str, ruleset: &AclRuleset) -> Result<()>;
    fn instance_setup_proxy_nat(
        &self,
        project: &str,
        instance: &str,
        device: &str,
        forward: &AddressForward,
    ) -> Result<()>;
    fn instance_clear_proxy_nat(&self, project: &str, instance: &str, device: &str) -> Result<()>;
}

fn table_family(family: Family) -> &'static str {
    match family {
        Family::V4 => "ip",
        Family::V6 => "ip6",
    }
}

fn addr_keyword(family: Family) -> &'static str {
    match family {
        Family::V4 => "ip",
        Family::V6 => "ip6",
    }
}

fn family_of(addr: &IpAddr) -> Family {
    if addr.is_ipv4() { Family::V4 } else { Family::V6 }
}

fn sanitize(name: &str) -> String {
    name.replace(['-', '.'], "_")
}

pub fn network_table(network: &str) -> String {
    format!("nova_{}", sanitize(network))
}

pub fn forward_table(network: &str) -> String {
    format!("nova_fwd_{}", sanitize(network))
}

pub fn acl_table(network: &str) -> String {
    format!("nova_acl_{}", sanitize(network))
}

pub fn proxy_table(project: &str, instance: &str, device: &str) -> String {
    format!(
        "nova_prx_{}_{}_{}",
        sanitize(project),
        sanitize(instance),
        sanitize(device)
    )
}

/// Script fragment that drops `table` whether or not it exists.
fn reset_table(family: &str, table: &str) -> String {
    format!("table {family} {table} {{}}\ndelete table {family} {table}\n")
}

fn port_set(ports: &[u16]) -> String {
    if ports.len() == 1 {
        return ports[0].to_string();
    }
    format!(
        "{{ {} }}",
        ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
    )
}

fn dnat_target(addr: &IpAddr, port: Option<u16>) -> String {
    match (addr, port) {
        (IpAddr::V4(v4), Some(port)) => format!("{}:{}", v4, port),
        (IpAddr::V6(v6), Some(port)) => format!("[{}]:{}", v6, port),
        (addr, None) => addr.to_string(),
    }
}

/// Render the per family table holding the network's own rules.
pub fn render_network_setup(
    network: &str,
    family: Family,
    features: Option<&FeatureOpts>,
    snat: Option<&SnatOpts>,
) -> String {
    let fam = table_family(family);
    let table = network_table(network);
    let mut script = reset_table(fam, &table);

    script.push_str(&format!("table {fam} {table} {{\n"));
    if let Some(features) = features {
        render_filter_chains(&mut script, network, family, features);
    }

    if let Some(snat) = snat {
        let kw = addr_keyword(family);
        let subnet = snat.subnet.trunc();
        let action = match &snat.snat_address {
            Some(addr) => format!("snat to {}", addr),
            None => "masquerade".to_string(),
        };
        let priority = if snat.append { 110 } else { 100 };
        script.push_str(&format!(
            "    chain pstrt {{\n        type nat hook postrouting priority {priority}; policy accept;\n"
        ));
        script.push_str(&format!(
            "        {kw} saddr {subnet} {kw} daddr != {subnet} {action}\n"
        ));
        script.push_str("    }\n");
    }

    script.push_str("}\n");
    script
}

fn render_filter_chains(script: &mut String, network: &str, family: Family, features: &FeatureOpts) {
    script.push_str("    chain in {\n        type filter hook input priority 0; policy accept;\n");
    if features.icmp_dhcp_dns_access {
        let (dhcp, icmp) = match family {
            Family::V4 => ("udp dport 67", "icmp type { echo-request, destination-unreachable, time-exceeded, parameter-problem }"),
            Family::V6 => ("udp dport 547", "icmpv6 type { echo-request, destination-unreachable, packet-too-big, time-exceeded, parameter-problem, nd-router-solicit, nd-neighbor-solicit, nd-neighbor-advert, mld-listener-report }"),
        };
        script.push_str(&format!("        iifname \"{network}\" {dhcp} accept\n"));
        script.push_str(&format!("        iifname \"{network}\" udp dport 53 accept\n"));
        script.push_str(&format!("        iifname \"{network}\" tcp dport 53 accept\n"));
        script.push_str(&format!("        iifname \"{network}\" {icmp} accept\n"));
    }
    script.push_str("    }\n");

    script.push_str("    chain out {\n        type filter hook output priority 0; policy accept;\n");
    if features.icmp_dhcp_dns_access {
        let dhcp = match family {
            Family::V4 => "udp sport 67",
            Family::V6 => "udp sport 547",
        };
        script.push_str(&format!("        oifname \"{network}\" {dhcp} accept\n"));
        script.push_str(&format!("        oifname \"{network}\" udp sport 53 accept\n"));
        script.push_str(&format!("        oifname \"{network}\" tcp sport 53 accept\n"));
    }
    script.push_str("    }\n");

    let verdict = if features.forwarding_allow { "accept" } else { "drop" };
    script.push_str("    chain fwd {\n        type filter hook forward priority 0; policy accept;\n");
    script.push_str(&format!("        iifname \"{network}\" {verdict}\n"));
    script.push_str(&format!("        oifname \"{network}\" {verdict}\n"));
    script.push_str("    }\n");
}

fn render_dnat_rules(kw: &str, forward: &AddressForward) -> Vec<String> {
    let listen = forward.listen_address;
    if forward.protocol.is_empty() {
        return vec![format!(
            "{kw} daddr {listen} dnat to {}",
            dnat_target(&forward.target_address, None)
        )];
    }

    let proto = &forward.protocol;
    match forward.target_ports.len() {
        0 => vec![format!(
            "{kw} daddr {listen} {proto} dport {} dnat to {}",
            port_set(&forward.listen_ports),
            dnat_target(&forward.target_address, None)
        )],
        1 => vec![format!(
            "{kw} daddr {listen} {proto} dport {} dnat to {}",
            port_set(&forward.listen_ports),
            dnat_target(&forward.target_address, Some(forward.target_ports[0]))
        )],
        _ => forward
            .listen_ports
            .iter()
            .zip(forward.target_ports.iter())
            .map(|(listen_port, target_port)| {
                format!(
                    "{kw} daddr {listen} {proto} dport {listen_port} dnat to {}",
                    dnat_target(&forward.target_address, Some(*target_port))
                )
            })
            .collect(),
    }
}

fn render_hairpin_rule(kw: &str, forward: &AddressForward) -> String {
    let target = forward.target_address;
    if forward.protocol.is_empty() {
        return format!("{kw} saddr {target} {kw} daddr {target} masquerade");
    }
    let ports = if forward.target_ports.is_empty() {
        &forward.listen_ports
    } else {
        &forward.target_ports
    };
    format!(
        "{kw} saddr {target} {kw} daddr {target} {} dport {} masquerade",
        forward.protocol,
        port_set(ports)
    )
}

/// Render the forward table for one family. When no forward of that family
/// exists the script only removes the table.
pub fn render_forwards(network: &str, family: Family, forwards: &[AddressForward]) -> String {
    let fam = table_family(family);
    let table = forward_table(network);
    let mut script = reset_table(fam, &table);

    let mut ours: Vec<&AddressForward> = forwards
        .iter()
        .filter(|f| family_of(&f.listen_address) == family)
        .collect();
    if ours.is_empty() {
        return script;
    }
    // A whole-address dnat ends the chain, so port rules must come first.
    ours.sort_by_key(|f| f.protocol.is_empty());

    let kw = addr_keyword(family);
    let dnat: Vec<String> = ours.iter().flat_map(|f| render_dnat_rules(kw, f)).collect();

    script.push_str(&format!("table {fam} {table} {{\n"));
    for (chain, hook) in [("prert", "prerouting"), ("out", "output")] {
        script.push_str(&format!(
            "    chain {chain} {{\n        type nat hook {hook} priority -100; policy accept;\n"
        ));
        for rule in &dnat {
            script.push_str(&format!("        {rule}\n"));
        }
        script.push_str("    }\n");
    }

    script.push_str("    chain pstrt {\n        type nat hook postrouting priority 100; policy accept;\n");
    for forward in ours.iter().filter(|f| f.snat || f.protocol.is_empty()) {
        script.push_str(&format!("        {}\n", render_hairpin_rule(kw, forward)));
    }
    script.push_str("    }\n}\n");
    script
}

fn acl_verdict(action: &str) -> &'static str {
    match action {
        "allow" | "allow-stateless" => "accept",
        "drop" => "drop",
        _ => "reject",
    }
}

/// Addresses of `family` in a comma separated subject list. `None` means the
/// list is empty and matches anything.
fn subjects_for_family(list: &str, family: Family) -> Option<Vec<String>> {
    let items = split_trim(list, ',');
    if items.is_empty() {
        return None;
    }
    Some(
        items
            .into_iter()
            .filter(|item| {
                let host = item.split_once('-').map(|(s, _)| s).unwrap_or(item.as_str());
                let host = host.split_once('/').map(|(s, _)| s).unwrap_or(host);
                IpAddr::from_str(host).is_ok_and(|ip| family_of(&ip) == family)
            })
            .collect(),
    )
}

struct AclRender {
    sets: Vec<String>,
    rules: Vec<String>,
}

impl AclRender {
    fn subject(&mut self, items: &[String], family: Family, use_sets: bool) -> String {
        if items.len() == 1 {
            return items[0].clone();
        }
        let elements = items.join(", ");
        if !use_sets {
            return format!("{{ {} }}", elements);
        }
        let name = format!("set_{}", self.sets.len());
        let kind = match family {
            Family::V4 => "ipv4_addr",
            Family::V6 => "ipv6_addr",
        };
        self.sets.push(format!(
            "    set {name} {{\n        type {kind}; flags interval;\n        elements = {{ {elements} }}\n    }}\n"
        ));
        format!("@{}", name)
    }

    fn rule(&mut self, network: &str, direction: &str, rule: &AclRule, use_sets: bool) {
        for family in [Family::V4, Family::V6] {
            match (rule.protocol.as_str(), family) {
                ("icmp4", Family::V6) | ("icmp6", Family::V4) => continue,
                _ => {}
            }

            let source = subjects_for_family(&rule.source, family);
            let destination = subjects_for_family(&rule.destination, family);
            if source.as_ref().is_some_and(|s| s.is_empty())
                || destination.as_ref().is_some_and(|d| d.is_empty())
            {
                continue;
            }

            let kw = addr_keyword(family);
            let iface = if direction == "egress" { "iifname" } else { "oifname" };
            let mut parts = vec![format!("{} \"{}\"", iface, network)];
            if let Some(source) = source {
                parts.push(format!("{kw} saddr {}", self.subject(&source, family, use_sets)));
            }
            if let Some(destination) = destination {
                parts.push(format!("{kw} daddr {}", self.subject(&destination, family, use_sets)));
            }
            match rule.protocol.as_str() {
                "" => {}
                "icmp4" => parts.push("meta l4proto icmp".to_string()),
                "icmp6" => parts.push("meta l4proto icmpv6".to_string()),
                proto => {
                    if rule.destination_port.is_empty() {
                        parts.push(format!("meta l4proto {}", proto));
                    } else {
                        let ports = split_trim(&rule.destination_port, ',').join(", ");
                        parts.push(format!("{} dport {{ {} }}", proto, ports));
                    }
                }
            }
            parts.push(acl_verdict(&rule.action).to_string());
            self.rules.push(parts.join(" "));
        }
    }
}

/// Render the ACL table for a network.
pub fn render_acls(network: &str, ruleset: &AclRuleset) -> String {
    let table = acl_table(network);
    let mut script = reset_table("inet", &table);
    if ruleset.acls.is_empty() {
        return script;
    }

    let mut render = AclRender {
        sets: Vec::new(),
        rules: Vec::new(),
    };
    render.rules.push("ct state established,related accept".to_string());
    for acl in &ruleset.acls {
        for rule in acl.egress.iter().filter(|r| r.state != "disabled") {
            render.rule(network, "egress", rule, ruleset.address_sets);
        }
        for rule in acl.ingress.iter().filter(|r| r.state != "disabled") {
            render.rule(network, "ingress", rule, ruleset.address_sets);
        }
    }
    render.rules.push(format!(
        "iifname \"{}\" {}",
        network,
        acl_verdict(&ruleset.default_egress)
    ));
    render.rules.push(format!(
        "oifname \"{}\" {}",
        network,
        acl_verdict(&ruleset.default_ingress)
    ));

    script.push_str(&format!("table inet {table} {{\n"));
    for set in &render.sets {
        script.push_str(set);
    }
    script.push_str("    chain acl {\n        type filter hook forward priority -10; policy accept;\n");
    for rule in &render.rules {
        script.push_str(&format!("        {rule}\n"));
    }
    script.push_str("    }\n}\n");
    script
}

pub struct Nftables;

impl Nftables {
    pub fn new() -> Self {
        Nftables
    }

    pub fn available() -> bool {
        Command::new("nft")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    fn apply(&self, script: &str) -> Result<()> {
        log_debug!("Applying nftables script:\n{}", script);

        let mut child = Command::new("nft")
            .arg("-f")
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| NovaError::SystemCommandFailed(format!("nft: {}", e)))?;

        if let Some(stdin) = child.stdin.as_mut() {
            stdin.write_all(script.as_bytes())?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| NovaError::SystemCommandFailed(format!("nft: {}", e)))?;
        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr).trim().to_string();
            log_error!("Failed to apply nftables rules: {}", error);
            return Err(NovaError::SystemCommandFailed(format!("nft: {}", error)));
        }

        Ok(())
    }
}

impl Default for Nftables {
    fn default() -> Self {
        Self::new()
    }
}

impl Firewall for Nftables {
    fn backend(&self) -> FirewallBackend {
        FirewallBackend::Nftables
    }

    fn network_setup(&self, network: &str, opts: &FirewallOptions) -> Result<()> {
        let mut script = String::new();
        if opts.features_v4.is_some() || opts.snat_v4.is_some() {
            script.push_str(&render_network_setup(
                network,
                Family::V4,
                opts.features_v4.as_ref(),
                opts.snat_v4.as_ref(),
            ));
        }
        if opts.features_v6.is_some() || opts.snat_v6.is_some() {
            script.push_str(&render_network_setup(
                network,
                Family::V6,
                opts.features_v6.as_ref(),
                opts.snat_v6.as_ref(),
            ));
        }
        if script.is_empty() {
            return Ok(());
        }
        self.apply(&script)
    }

    fn network_clear(&self, network: &str, delete: bool, ip_versions: &[u8]) -> Result<()> {
        let mut script = String::new();
        for version in ip_versions {
            let family = if *version == 4 { Family::V4 } else { Family::V6 };
            script.push_str(&reset_table(table_family(family), &network_table(network)));
            if delete {
                script.push_str(&reset_table(table_family(family), &forward_table(network)));
            }
        }
        if delete {
            script.push_str(&reset_table("inet", &acl_table(network)));
        }
        if script.is_empty() {
            return Ok(());
        }
        self.apply(&script)
    }

    fn network_apply_forwards(&self, network: &str, forwards: &[AddressForward]) -> Result<()> {
        let mut script = render_forwards(network, Family::V4, forwards);
        script.push_str(&render_forwards(network, Family::V6, forwards));
        self.apply(&script)
    }

    fn network_apply_acls(&self, network: &str, ruleset: &AclRuleset) -> Result<()> {
        self.apply(&render_acls(network, ruleset))
    }

    fn instance_setup_proxy_nat(
        &self,
        project: &str,
        instance: &str,
        device: &str,
        forward: &AddressForward,
    ) -> Result<()> {
        let family = family_of(&forward.listen_address);
        let fam = table_family(family);
        let table = proxy_table(project, instance, device);
        let kw = addr_keyword(family);

        let mut script = reset_table(fam, &table);
        script.push_str(&format!("table {fam} {table} {{\n"));
        for (chain, hook) in [("prert", "prerouting"), ("out", "output")] {
            script.push_str(&format!(
                "    chain {chain} {{\n        type nat hook {hook} priority -100; policy accept;\n"
            ));
            for rule in render_dnat_rules(kw, forward) {
                script.push_str(&format!("        {rule}\n"));
            }
            script.push_str("    }\n");
        }
        script.push_str("    chain pstrt {\n        type nat hook postrouting priority 100; policy accept;\n");
        script.push_str(&format!("        {}\n", render_hairpin_rule(kw, forward)));
        script.push_str("    }\n}\n");

        self.apply(&script)
    }

    fn instance_clear_proxy_nat(&self, project: &str, instance: &str, device: &str) -> Result<()> {
        let table = proxy_table(project, instance, device);
        let mut script = reset_table("ip", &table);
        script.push_str(&reset_table("ip6", &table));
        self.apply(&script)
    }
}
