//! Managed bridge network driver.
//!
//! `setup` is the single reconciliation pass: it takes the stored config and
//! makes the host match it, whether the bridge already exists or not. Every
//! change it makes to a host that did not have the bridge before is undone
//! when a later step fails.

use crate::bgp::{forward_owner, network_owner};
use crate::bridge_config::{
    self, acl_names, check_cluster_wide_mac_safe, external_interfaces, has_dhcp_v4, has_dhcp_v6,
    has_ipv4_firewall, has_ipv6_firewall, nat_enabled, routing_enabled, tunnels,
};
use crate::bridge_forward::ForwardScope;
use crate::db::{InstanceFilter, NetworkRecord, NetworkStatus, WarningType, DEFAULT_PROJECT};
use crate::dnsmasq::{self, StaticHost};
use crate::firewall::{AclRuleset, FeatureOpts, FirewallBackend, FirewallOptions, SnatOpts};
use crate::forward::{NetworkForward, NetworkForwardPut, NetworkForwardsPost};
use crate::ip::{Family, LinkKind, NewLink, Route, VxlanOpts, links_with_master};
use crate::network::{
    ClientType, ConfigMap, DaemonState, Network, NetworkLease, NetworkPut, config_changed,
    nic_uses_network,
};
use crate::revert::{self, Reverter};
use crate::subnet::{derive_eui64, parse_cidr, random_subnet_v4, random_subnet_v6};
use crate::subprocess::{Process, ProcessSpec};
use crate::validate::{format_mac, is_false_or_empty, is_none_or_empty, parse_mac, split_trim};
use crate::{NovaError, Result, log_debug, log_error, log_info, log_warn};
use async_trait::async_trait;
use ipnet::{IpNet, Ipv6Net};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Kernel default, nothing to force when the bridge uses it.
const DEFAULT_MTU: u32 = 1500;
/// Leaves room for tunnel encapsulation.
const TUNNEL_MTU: u32 = 1400;
const MAC_OUI: [u8; 3] = [0x10, 0x66, 0x6a];
const CHILD_KINDS: &[&str] = &["vxlan", "gretap", "dummy"];

fn get<'a>(config: &'a ConfigMap, key: &str) -> &'a str {
    config.get(key).map(String::as_str).unwrap_or_default()
}

/// Whether rules of `family` may exist for `config`. Used to decide what to clear.
fn uses_firewall(config: &ConfigMap, family: Family) -> bool {
    let prefix = match family {
        Family::V4 => "ipv4",
        Family::V6 => "ipv6",
    };
    crate::validate::is_true_or_empty(get(config, &format!("{}.firewall", prefix)))
        || crate::validate::is_true(get(config, &format!("{}.nat", prefix)))
}

fn firewall_versions(config: &ConfigMap, old: Option<&ConfigMap>) -> Vec<u8> {
    [Family::V4, Family::V6]
        .into_iter()
        .filter(|family| uses_firewall(config, *family) || old.is_some_and(|o| uses_firewall(o, *family)))
        .map(|family| family.version())
        .collect()
}

fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified()
                || v4.is_loopback()
                || v4.is_multicast()
                || v4.is_link_local()
                || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_unspecified() || v6.is_loopback() || v6.is_multicast())
                && (v6.segments()[0] & 0xffc0) != 0xfe80
        }
    }
}

pub struct BridgeNetwork {
    pub(crate) state: Arc<DaemonState>,
    pub(crate) record: NetworkRecord,
    available: Arc<AtomicBool>,
}

impl BridgeNetwork {
    pub fn new(state: Arc<DaemonState>, record: NetworkRecord) -> Self {
        Self {
            state,
            record,
            available: Arc::new(AtomicBool::new(false)),
        }
    }

    /// False after a failed start until the next successful one.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn get(&self, key: &str) -> &str {
        get(&self.record.config, key)
    }

    fn is_ovs(config: &ConfigMap) -> bool {
        get(config, "bridge.driver") == "openvswitch"
    }

    pub(crate) fn forward_scope(&self) -> ForwardScope {
        ForwardScope {
            state: self.state.clone(),
            network_id: self.record.id,
            project: self.record.project.clone(),
            network: self.record.name.clone(),
            config: self.record.config.clone(),
        }
    }

    fn bridge_mtu(&self) -> u32 {
        if let Ok(mtu) = self.get("bridge.mtu").parse::<u32>() {
            return mtu;
        }
        if !bridge_config::tunnel_names(&self.record.config).is_empty() {
            return TUNNEL_MTU;
        }
        DEFAULT_MTU
    }

    /// MAC shared by every member when that is safe, distinct per member otherwise.
    /// Stable across restarts either way.
    pub fn generated_hwaddr(&self) -> String {
        let node = if check_cluster_wide_mac_safe(&self.record.config).is_ok() {
            0
        } else {
            self.state.settings.node_id
        };
        let seed = format!(
            "{}.{}.{}",
            self.state.settings.certificate_fingerprint, node, self.record.id
        );

        let digest = Sha256::digest(seed.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let mut rng = StdRng::seed_from_u64(u64::from_be_bytes(head));

        let mut mac = [0u8; 6];
        mac[..3].copy_from_slice(&MAC_OUI);
        rng.fill(&mut mac[3..]);
        format_mac(&mac)
    }

    fn bridge_hwaddr(&self) -> String {
        match self.get("bridge.hwaddr") {
            "" => self.generated_hwaddr(),
            mac => mac.to_string(),
        }
    }

    /// Replace `auto` addresses with unused random subnets.
    fn populate_auto_config(&self, config: &mut ConfigMap) -> Result<()> {
        let wants_v4 = get(config, "ipv4.address") == "auto";
        let wants_v6 = get(config, "ipv6.address") == "auto";
        if !wants_v4 && !wants_v6 {
            return Ok(());
        }

        let mut in_use = self
            .state
            .cluster
            .transaction(|tx| crate::usage::subnets_in_use(tx))?;
        let host = &self.state.host;
        for link in host.links()?.into_iter().filter(|l| l.kind == "bridge") {
            for family in [Family::V4, Family::V6] {
                in_use.extend(host.addresses(&link.name, family).unwrap_or_default());
            }
        }

        let mut rng = rand::thread_rng();
        if wants_v4 {
            let subnet = random_subnet_v4(&mut rng, &in_use)?;
            log_debug!("Allocated IPv4 subnet {} for network {}", subnet, self.record.name);
            config.insert("ipv4.address".to_string(), subnet.to_string());
        }
        if wants_v6 {
            let subnet = random_subnet_v6(&mut rng, &in_use)?;
            log_debug!("Allocated IPv6 subnet {} for network {}", subnet, self.record.name);
            config.insert("ipv6.address".to_string(), subnet.to_string());
        }

        self.validate(config)
    }

    /// Delete tunnel and dummy ports left on the bridge, never external interfaces.
    fn delete_children(&self) -> Result<()> {
        let external: Vec<String> = external_interfaces(&self.record.config)
            .into_iter()
            .map(|iface| iface.name)
            .collect();

        for link in links_with_master(self.state.host.as_ref(), &self.record.name)? {
            if external.contains(&link.name) || !CHILD_KINDS.contains(&link.kind.as_str()) {
                continue;
            }
            log_debug!("Deleting bridge child {} ({})", link.name, link.kind);
            self.state.host.delete_link(&link.name)?;
        }
        Ok(())
    }

    fn upsert_warning(&self, type_code: WarningType, message: &str) {
        let result = self.state.cluster.transaction(|tx| {
            tx.upsert_warning(&self.record.project, "network", self.record.id, type_code, message);
            Ok(())
        });
        if let Err(e) = result {
            log_warn!("Failed to create warning: {}", e);
        }
    }

    fn resolve_warning(&self, type_code: WarningType) {
        let result = self.state.cluster.transaction(|tx| {
            tx.resolve_warnings(type_code, "network", self.record.id);
            Ok(())
        });
        if let Err(e) = result {
            log_warn!("Failed to resolve warning: {}", e);
        }
    }

    /// DHCP reservations for every NIC on this network with a static address.
    fn static_hosts(&self) -> Result<Vec<StaticHost>> {
        let instances = self
            .state
            .cluster
            .transaction(|tx| Ok(tx.instances(&InstanceFilter::default())))?;

        let mut hosts = Vec::new();
        for inst in instances {
            for (device, nic) in &inst.devices {
                if !nic_uses_network(nic, &self.record.name) {
                    continue;
                }

                let hwaddr = match get(nic, "hwaddr") {
                    "" => inst
                        .config
                        .get(&format!("volatile.{}.hwaddr", device))
                        .cloned()
                        .unwrap_or_default(),
                    mac => mac.to_string(),
                };
                let Some(mac) = parse_mac(&hwaddr) else {
                    continue;
                };

                let ipv4 = IpAddr::from_str(get(nic, "ipv4.address")).ok();
                let ipv6 = IpAddr::from_str(get(nic, "ipv6.address")).ok();
                if ipv4.is_none() && ipv6.is_none() {
                    continue;
                }

                let hostname = if inst.project == DEFAULT_PROJECT {
                    inst.name.clone()
                } else {
                    format!("{}_{}", inst.project, inst.name)
                };
                hosts.push(StaticHost {
                    file_name: format!("{}_{}.{}", inst.project, inst.name, device),
                    hwaddr: format_mac(&mac),
                    ipv4,
                    ipv6,
                    hostname,
                });
            }
        }
        Ok(hosts)
    }

    fn apply_acls(&self) -> Result<()> {
        let names = acl_names(&self.record.config);
        let acls = self
            .state
            .cluster
            .transaction(|tx| tx.network_acls(&self.record.project, &names))?;

        let action = |key: &str| match self.get(key) {
            "" => "reject".to_string(),
            value => value.to_string(),
        };
        let ruleset = AclRuleset {
            acls,
            default_ingress: action("security.acls.default.ingress.action"),
            default_egress: action("security.acls.default.egress.action"),
            address_sets: self.state.firewall.backend() == FirewallBackend::Nftables,
        };

        self.state
            .firewall
            .network_apply_acls(&self.record.name, &ruleset)
            .map_err(|e| e.context("Failed applying ACL rules"))
    }

    /// Advertise the network's subnets (NAT disabled) and routes.
    fn bgp_setup(&self) -> Result<()> {
        let owner = network_owner(self.record.id);
        let bgp = &self.state.bgp;
        bgp.remove_prefix_by_owner(&owner)?;

        for prefix in ["ipv4", "ipv6"] {
            let next_hop = IpAddr::from_str(self.get(&format!("bgp.{}.nexthop", prefix))).ok();

            if !nat_enabled(&self.record.config, prefix) {
                if let Ok(address) = parse_cidr(self.get(&format!("{}.address", prefix))) {
                    bgp.add_prefix(address.trunc(), next_hop, &owner)?;
                }
            }

            for route in split_trim(self.get(&format!("{}.routes", prefix)), ',') {
                bgp.add_prefix(parse_cidr(&route)?.trunc(), next_hop, &owner)?;
            }
        }
        Ok(())
    }

    fn bgp_clear(&self) -> Result<()> {
        self.state
            .bgp
            .remove_prefix_by_owner(&network_owner(self.record.id))?;
        self.state
            .bgp
            .remove_prefix_by_owner(&forward_owner(self.record.id))
    }

    fn apply_boot_routes(&self, routes: &[Route]) {
        for route in routes {
            if let Err(e) = self.state.host.add_route(route) {
                log_error!("Failed restoring route {} on {}: {}", route.dst, self.record.name, e);
            }
        }
    }

    async fn setup(&self, old_config: Option<&ConfigMap>) -> Result<()> {
        log_debug!("Setting up network {}", self.record.name);

        let mut reverter = Reverter::new();
        let result = self.setup_steps(&mut reverter, old_config).await;
        if result.is_err() {
            log_error!("Failed setting up network {}, reverting", self.record.name);
        }
        revert::finish(&mut reverter, result)
    }

    async fn setup_steps(&self, reverter: &mut Reverter, old_config: Option<&ConfigMap>) -> Result<()> {
        let host = self.state.host.clone();
        let config = &self.record.config;
        let name = self.record.name.clone();
        let dir = self.state.network_dir(&name);
        let ovs = Self::is_ovs(config);

        fs::create_dir_all(dir.root())?;

        let mtu = self.bridge_mtu();
        let hwaddr = self.bridge_hwaddr();

        let created = !self.is_running();
        if created {
            if ovs {
                host.ovs_add_bridge(&name)?;
                {
                    let (host, name) = (host.clone(), name.clone());
                    reverter.add(move || {
                        let _ = host.ovs_delete_bridge(&name);
                    });
                }
                host.set_mtu(&name, mtu)?;
                host.set_address(&name, &hwaddr)?;
            } else {
                host.add_link(&NewLink {
                    name: name.clone(),
                    kind: LinkKind::Bridge,
                    mtu: Some(mtu),
                    address: Some(hwaddr.clone()),
                })?;
                let (host, name) = (host.clone(), name.clone());
                reverter.add(move || {
                    let _ = host.delete_link(&name);
                });
            }
            log_debug!("Created bridge {} ({}, mtu {})", name, hwaddr, mtu);
        } else {
            host.set_mtu(&name, mtu)?;
            host.set_address(&name, &hwaddr)?;
        }

        let sysctl = |key: &str, value: &str| host.sysctl_set(&format!("net/ipv6/conf/{}/{}", name, key), value);
        if !is_none_or_empty(self.get("ipv6.address")) {
            sysctl("disable_ipv6", "0")?;
            sysctl("autoconf", "0")?;
            sysctl("accept_dad", "0")?;
        } else {
            sysctl("disable_ipv6", "1")?;
        }

        self.delete_children()
            .map_err(|e| e.context("Failed to delete bridge children interfaces"))?;

        if mtu != DEFAULT_MTU && !ovs {
            let dummy = format!("{}-mtu", name);
            host.add_link(&NewLink {
                name: dummy.clone(),
                kind: LinkKind::Dummy,
                mtu: Some(mtu),
                address: None,
            })?;
            {
                let (host, dummy) = (host.clone(), dummy.clone());
                reverter.add(move || {
                    let _ = host.delete_link(&dummy);
                });
            }
            host.set_up(&dummy)?;
            if let Err(e) = host.set_master(&dummy, &name) {
                log_warn!("Failed attaching MTU dummy {} to {}: {}", dummy, name, e);
            }
        }

        if !ovs {
            if let Err(e) = host.set_vlan_filtering(&name, true) {
                log_warn!("Failed enabling VLAN filtering on bridge {}: {}", name, e);
            }
        }

        host.set_up(&name)?;

        self.attach_external_interfaces(reverter, ovs)?;

        let versions = firewall_versions(config, old_config);
        if !versions.is_empty() {
            self.state
                .firewall
                .network_clear(&name, false, &versions)
                .map_err(|e| e.context("Failed clearing firewall"))?;
        }

        let mut opts = FirewallOptions {
            features_v4: has_ipv4_firewall(config).then(FeatureOpts::default),
            features_v6: has_ipv6_firewall(config).then(FeatureOpts::default),
            acl: !self.get("security.acls").is_empty(),
            ..Default::default()
        };

        let uses_dnsmasq = self.uses_dnsmasq();
        let mut dnsmasq_program = None;
        let mut args: Vec<String> = Vec::new();
        if uses_dnsmasq {
            let program = self.state.supervisor.lookup("dnsmasq").ok_or_else(|| {
                NovaError::SystemCommandFailed("dnsmasq is required for managed bridges".to_string())
            })?;
            let version = dnsmasq::get_version(self.state.supervisor.as_ref(), &program)?;
            args = dnsmasq::base_args(&name, &version, self.state.settings.debug);
            dnsmasq_program = Some(program);
        }

        self.setup_ipv4(&mut opts, &mut args, &dir, mtu)?;
        self.setup_ipv6(&mut opts, &mut args, &dir, &hwaddr)?;
        self.setup_tunnels(reverter, mtu)?;

        let log_file = self.state.settings.dnsmasq_log(&name);
        self.state.apparmor.network_load(&name, &dir, &log_file)?;

        dnsmasq::kill(self.state.supervisor.as_ref(), &dir, false)?;

        if let Some(program) = dnsmasq_program {
            args.extend(dnsmasq::dns_args(config, &name, &self.state.settings.dns_domain));

            let raw = self.get("raw.dnsmasq");
            fs::write(dir.raw(), format!("{}\n", raw))?;
            args.push(format!("--conf-file={}", dir.raw().display()));

            if let Some(user) = &self.state.settings.dnsmasq_user {
                args.extend(["-u".to_string(), user.clone()]);
            }
            if let Some(group) = &self.state.settings.dnsmasq_group {
                args.extend(["-g".to_string(), group.clone()]);
            }

            fs::create_dir_all(dir.hosts())?;
            dnsmasq::write_static_hosts(&dir, &self.static_hosts()?)?;

            let apparmor_profile = if raw.is_empty() {
                self.resolve_warning(WarningType::AppArmorDisabledDueToRawDnsmasq);
                self.state
                    .apparmor
                    .is_enabled()
                    .then(|| crate::apparmor::AppArmor::profile_name(&name))
            } else {
                log_warn!("Skipping AppArmor for dnsmasq due to raw.dnsmasq being set on {}", name);
                self.upsert_warning(
                    WarningType::AppArmorDisabledDueToRawDnsmasq,
                    "Skipping AppArmor for dnsmasq due to raw.dnsmasq being set",
                );
                None
            };

            let spec = ProcessSpec {
                name: format!("dnsmasq.{}", name),
                program,
                args,
                log_file: Some(log_file.clone()),
                apparmor_profile,
            };
            let process = Process::start(self.state.supervisor.as_ref(), &spec)?;

            let grace = self.state.settings.dnsmasq_start_grace_ms;
            if grace > 0 {
                tokio::time::sleep(Duration::from_millis(grace)).await;
            }
            if !self.state.supervisor.is_alive(process.pid) {
                return Err(NovaError::SystemCommandFailed(format!(
                    "The DNS and DHCP service exited prematurely: ({:?} log)",
                    log_file.display().to_string()
                )));
            }

            if let Err(e) = process.save(&dir.pid()) {
                let _ = process.stop(self.state.supervisor.as_ref());
                return Err(e.context("Failed saving dnsmasq PID"));
            }
            if created {
                let (supervisor, dir) = (self.state.supervisor.clone(), dir.clone());
                reverter.add(move || {
                    let _ = dnsmasq::kill(supervisor.as_ref(), &dir, false);
                });
            }
            log_debug!("dnsmasq for {} running as PID {}", name, process.pid);
        } else {
            for stale in [dir.leases(), dir.pid()] {
                if stale.exists() {
                    fs::remove_file(&stale)?;
                }
            }
        }

        self.state
            .firewall
            .network_setup(&name, &opts)
            .map_err(|e| e.context("Failed to setup firewall"))?;
        if created {
            let (firewall, name) = (self.state.firewall.clone(), name.clone());
            reverter.add(move || {
                let _ = firewall.network_clear(&name, true, &[4, 6]);
            });
        }

        if opts.acl {
            self.apply_acls()?;
        }

        let forwards = self.forward_scope();
        forwards.setup_firewall()?;
        self.bgp_setup()?;
        forwards.bgp_setup_prefixes()?;

        log_debug!("Network {} is set up", name);
        Ok(())
    }

    fn attach_external_interfaces(&self, reverter: &mut Reverter, ovs: bool) -> Result<()> {
        let host = self.state.host.clone();
        let bridge = &self.record.name;

        for iface in external_interfaces(&self.record.config) {
            let exists = host.interface_exists(&iface.name);
            match (&iface.vlan, exists) {
                (None, false) => {
                    log_warn!("Skipping attaching missing external interface {}", iface.name);
                    continue;
                }
                (Some((parent, id)), false) => {
                    host.add_link(&NewLink {
                        name: iface.name.clone(),
                        kind: LinkKind::Vlan {
                            parent: parent.clone(),
                            id: *id,
                        },
                        mtu: None,
                        address: None,
                    })
                    .map_err(|e| {
                        e.context(format!("Failed to create external interface {:?}", iface.name))
                    })?;
                    let (host, name) = (host.clone(), iface.name.clone());
                    reverter.add(move || {
                        let _ = host.delete_link(&name);
                    });
                }
                (Some((parent, id)), true) => {
                    let link = host.link(&iface.name)?;
                    let matches = link.kind == "vlan"
                        && link.parent.as_deref() == Some(parent.as_str())
                        && link.vlan_id == Some(*id)
                        && link.master.as_deref().is_none_or(|m| m == bridge);
                    if !matches {
                        return Err(NovaError::Conflict(format!(
                            "External interface {:?} already in use",
                            iface.name
                        )));
                    }
                }
                (None, true) => {}
            }

            for family in [Family::V4, Family::V6] {
                if host
                    .addresses(&iface.name, family)?
                    .iter()
                    .any(|addr| is_global_unicast(&addr.addr()))
                {
                    return Err(NovaError::Validation(
                        "Only unconfigured network interfaces can be bridged".to_string(),
                    ));
                }
            }

            if ovs {
                host.ovs_add_port(bridge, &iface.name)?;
            } else {
                host.set_master(&iface.name, bridge)?;
            }
            host.set_up(&iface.name).map_err(|e| {
                NovaError::Os(format!("Failed to bring up the host interface {}: {}", iface.name, e))
            })?;
            log_debug!("Attached external interface {} to {}", iface.name, bridge);
        }
        Ok(())
    }

    fn setup_ipv4(
        &self,
        opts: &mut FirewallOptions,
        args: &mut Vec<String>,
        dir: &dnsmasq::NetworkDir,
        mtu: u32,
    ) -> Result<()> {
        let host = &self.state.host;
        let config = &self.record.config;
        let name = &self.record.name;

        let boot_routes = host.routes(name, Family::V4, Some("boot"))?;
        host.flush_addresses(name, Family::V4)?;
        host.flush_routes(name, Family::V4, "static")?;

        let value = self.get("ipv4.address");
        if is_none_or_empty(value) {
            return Ok(());
        }
        let address = parse_cidr(value)?;
        let subnet = address.trunc();

        if has_dhcp_v4(config) {
            if let Some(features) = opts.features_v4.as_mut() {
                features.icmp_dhcp_dns_access = true;
            }
        }

        if routing_enabled(config, "ipv4") {
            host.sysctl_set("net/ipv4/ip_forward", "1")?;
            if let Some(features) = opts.features_v4.as_mut() {
                features.forwarding_allow = true;
            }
        }

        if !args.is_empty() {
            args.push(format!("--listen-address={}", address.addr()));
            if has_dhcp_v4(config) {
                dnsmasq::ensure_dhcp_args(args, dir);
                args.extend(dnsmasq::dhcp_v4_args(
                    config,
                    &subnet,
                    (mtu != DEFAULT_MTU).then_some(mtu),
                ));
            }
        }

        host.add_address(name, &address)?;

        if nat_enabled(config, "ipv4") {
            opts.snat_v4 = Some(SnatOpts {
                subnet,
                snat_address: IpAddr::from_str(self.get("ipv4.nat.address")).ok(),
                append: self.get("ipv4.nat.order") == "after",
            });
        }

        for route in split_trim(self.get("ipv4.routes"), ',') {
            host.add_route(&Route {
                dev: name.clone(),
                dst: parse_cidr(&route)?.trunc(),
                via: None,
                proto: Some("static".to_string()),
            })?;
        }

        self.apply_boot_routes(&boot_routes);
        Ok(())
    }

    fn setup_ipv6(
        &self,
        opts: &mut FirewallOptions,
        args: &mut Vec<String>,
        dir: &dnsmasq::NetworkDir,
        hwaddr: &str,
    ) -> Result<()> {
        let host = &self.state.host;
        let config = &self.record.config;
        let name = &self.record.name;

        let boot_routes = host.routes(name, Family::V6, Some("boot"))?;
        host.flush_addresses(name, Family::V6)?;
        host.flush_routes(name, Family::V6, "static")?;

        let value = self.get("ipv6.address");
        if is_none_or_empty(value) {
            return Ok(());
        }
        host.sysctl_set(&format!("net/ipv6/conf/{}/disable_ipv6", name), "0")?;

        let mut address = parse_cidr(value)?;
        if address.addr() == address.network() {
            let IpNet::V6(prefix) = address else {
                return Err(NovaError::Validation(format!("Invalid IPv6 address {:?}", value)));
            };
            let mac = parse_mac(hwaddr)
                .ok_or_else(|| NovaError::Validation(format!("Invalid MAC address {:?}", hwaddr)))?;
            let eui = derive_eui64(&prefix, &mac)?;
            address = IpNet::V6(
                Ipv6Net::new(eui, prefix.prefix_len()).map_err(|e| NovaError::Validation(e.to_string()))?,
            );
        }
        let subnet = address.trunc();

        if address.prefix_len() > 64 {
            let msg = format!(
                "IPv6 networks with a prefix larger than 64 aren't properly supported by dnsmasq ({})",
                address
            );
            log_warn!("{}", msg);
            self.upsert_warning(WarningType::LargerIPv6PrefixThanSupported, &msg);
        } else {
            self.resolve_warning(WarningType::LargerIPv6PrefixThanSupported);
        }

        if !args.is_empty() {
            args.push(format!("--listen-address={}", address.addr()));
            args.push("--enable-ra".to_string());
        }

        if has_dhcp_v6(config) {
            if let Some(features) = opts.features_v6.as_mut() {
                features.icmp_dhcp_dns_access = true;
            }
            if !args.is_empty() {
                dnsmasq::ensure_dhcp_args(args, dir);
                args.extend(dnsmasq::dhcp_v6_args(config, name, &subnet, true));
            }
        } else if !args.is_empty() {
            args.extend(dnsmasq::dhcp_v6_args(config, name, &subnet, false));
        }

        if routing_enabled(config, "ipv6") {
            // Keep accepting router advertisements upstream once forwarding is on.
            for link in host.links()? {
                let key = format!("net/ipv6/conf/{}/accept_ra", link.name);
                if host.sysctl_get(&key).is_ok_and(|v| v.trim() == "1") {
                    let _ = host.sysctl_set(&key, "2");
                }
            }
            host.sysctl_set("net/ipv6/conf/all/forwarding", "1")?;
            if let Some(features) = opts.features_v6.as_mut() {
                features.forwarding_allow = true;
            }
        }

        host.add_address(name, &address)?;

        if nat_enabled(config, "ipv6") {
            opts.snat_v6 = Some(SnatOpts {
                subnet,
                snat_address: IpAddr::from_str(self.get("ipv6.nat.address")).ok(),
                append: self.get("ipv6.nat.order") == "after",
            });
        }

        for route in split_trim(self.get("ipv6.routes"), ',') {
            host.add_route(&Route {
                dev: name.clone(),
                dst: parse_cidr(&route)?.trunc(),
                via: None,
                proto: Some("static".to_string()),
            })?;
        }

        self.apply_boot_routes(&boot_routes);
        Ok(())
    }

    fn setup_tunnels(&self, reverter: &mut Reverter, mtu: u32) -> Result<()> {
        let host = self.state.host.clone();
        let bridge = &self.record.name;

        for tunnel in tunnels(&self.record.config) {
            let iface = format!("{}-{}", bridge, tunnel.name);
            let kind = match tunnel.protocol.as_str() {
                "gre" => {
                    let (Some(local), Some(remote)) = (tunnel.local, tunnel.remote) else {
                        continue;
                    };
                    LinkKind::Gretap { local, remote }
                }
                "vxlan" => {
                    let mut opts = VxlanOpts {
                        id: tunnel.id.unwrap_or(1),
                        port: tunnel.port,
                        ttl: Some(tunnel.ttl.unwrap_or(1)),
                        ..Default::default()
                    };
                    if let Some(remote) = tunnel.remote {
                        let Some(local) = tunnel.local else {
                            continue;
                        };
                        opts.local = Some(local);
                        opts.remote = Some(remote);
                    } else {
                        opts.group = Some(
                            tunnel
                                .group
                                .unwrap_or(IpAddr::V4(Ipv4Addr::new(239, 0, 0, 1))),
                        );
                        opts.dev = Some(match tunnel.interface {
                            Some(dev) => dev,
                            None => host.default_gateway_device_v4()?,
                        });
                    }
                    LinkKind::Vxlan(opts)
                }
                _ => continue,
            };

            host.add_link(&NewLink {
                name: iface.clone(),
                kind,
                mtu: None,
                address: None,
            })?;
            {
                let (host, iface) = (host.clone(), iface.clone());
                reverter.add(move || {
                    let _ = host.delete_link(&iface);
                });
            }
            host.set_master(&iface, bridge)?;
            host.set_mtu(&iface, mtu)?;
            host.set_up(&iface)?;
            host.set_up(bridge)?;
            log_debug!("Created {} tunnel {}", tunnel.protocol, iface);
        }
        Ok(())
    }

    /// Stop live state when the driver changes and detach interfaces that
    /// left `bridge.external_interfaces`.
    fn prepare_update(&self, new_config: &ConfigMap, changed: &[String]) -> Result<()> {
        if changed.iter().any(|k| k == "bridge.driver") && self.is_running() {
            self.stop()?;
        }

        if changed.iter().any(|k| k == "bridge.external_interfaces") && self.is_running() {
            let host = &self.state.host;
            let ovs = Self::is_ovs(&self.record.config);
            let kept = external_interfaces(new_config);

            for old in external_interfaces(&self.record.config) {
                if kept.iter().any(|iface| iface.name == old.name) || !host.interface_exists(&old.name) {
                    continue;
                }
                if ovs {
                    host.ovs_delete_port(&self.record.name, &old.name)?;
                } else {
                    host.set_nomaster(&old.name)?;
                }
                if old.vlan.is_some() {
                    host.delete_link(&old.name)?;
                }
                log_debug!("Detached external interface {} from {}", old.name, self.record.name);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Network for BridgeNetwork {
    fn id(&self) -> i64 {
        self.record.id
    }

    fn name(&self) -> &str {
        &self.record.name
    }

    fn project(&self) -> &str {
        &self.record.project
    }

    fn description(&self) -> &str {
        &self.record.description
    }

    fn status(&self) -> NetworkStatus {
        self.record.status
    }

    fn config(&self) -> &ConfigMap {
        &self.record.config
    }

    fn network_type(&self) -> &'static str {
        "bridge"
    }

    fn is_running(&self) -> bool {
        self.state.host.interface_exists(&self.record.name)
    }

    fn validate_name(&self, name: &str) -> Result<()> {
        crate::validate::is_interface_name(name)?;
        Ok(())
    }

    fn validate(&self, config: &ConfigMap) -> Result<()> {
        bridge_config::validate_config(&self.record.name, config)?;

        let acls = acl_names(config);
        let project = &self.record.project;
        self.state.cluster.transaction(|tx| {
            for key in ["ipv4.nat.address", "ipv6.nat.address"] {
                let address = get(config, key);
                if !address.is_empty() {
                    crate::usage::check_snat_address(tx, project, &self.record.name, address)?;
                }
            }

            for acl in &acls {
                if !tx.acl_exists(project, acl) {
                    return Err(NovaError::NotFound(format!("Network ACL {:?} not found", acl)));
                }
            }
            Ok(())
        })
    }

    fn fill_config(&self, config: &mut ConfigMap) -> Result<()> {
        if get(config, "ipv4.address").is_empty() {
            config.insert("ipv4.address".to_string(), "auto".to_string());
        }
        if get(config, "ipv4.address") == "auto" && get(config, "ipv4.nat").is_empty() {
            config.insert("ipv4.nat".to_string(), "true".to_string());
        }

        if get(config, "ipv6.address").is_empty()
            && self
                .state
                .host
                .sysctl_get("net/ipv6/conf/default/disable_ipv6")
                .is_ok_and(|v| v.trim() == "0")
        {
            config.insert("ipv6.address".to_string(), "auto".to_string());
        }
        if get(config, "ipv6.address") == "auto" && get(config, "ipv6.nat").is_empty() {
            config.insert("ipv6.nat".to_string(), "true".to_string());
        }

        self.populate_auto_config(config)
            .map_err(|e| e.context("Failed generating auto config"))
    }

    fn create(&self, _client: ClientType) -> Result<()> {
        log_debug!("Create network {}", self.record.name);
        if self.is_running() {
            return Err(NovaError::Conflict(format!(
                "Network interface {:?} already exists",
                self.record.name
            )));
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        log_debug!("Start network {}", self.record.name);

        let mut reverter = Reverter::new();
        let available = self.available.clone();
        reverter.add(move || available.store(false, Ordering::SeqCst));

        let result = self.setup(None).await;
        revert::finish(&mut reverter, result)?;

        self.available.store(true, Ordering::SeqCst);
        log_info!("Network {} started", self.record.name);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        let name = &self.record.name;
        if !self.is_running() {
            log_debug!("Network {} is not running", name);
            return Ok(());
        }
        log_debug!("Stop network {}", name);

        self.bgp_clear()?;
        self.delete_children()?;

        if Self::is_ovs(&self.record.config) {
            self.state.host.ovs_delete_bridge(name)?;
        } else {
            self.state.host.delete_link(name)?;
        }

        let versions = firewall_versions(&self.record.config, None);
        self.state
            .firewall
            .network_clear(name, true, &versions)
            .map_err(|e| e.context("Failed deleting firewall"))?;

        dnsmasq::kill(self.state.supervisor.as_ref(), &self.state.network_dir(name), false)?;
        self.state.apparmor.network_unload(name)?;

        log_info!("Network {} stopped", name);
        Ok(())
    }

    async fn update(&mut self, mut put: NetworkPut, client: ClientType) -> Result<()> {
        log_debug!("Update network {}", self.record.name);

        self.populate_auto_config(&mut put.config)?;
        self.validate(&put.config)?;

        let change = config_changed(&self.record.description, &self.record.config, &put);
        if !change.db_update_needed {
            return Ok(());
        }

        let id = self.record.id;
        if self.record.status == NetworkStatus::Pending {
            self.state
                .cluster
                .transaction(|tx| tx.update_network(id, &put.description, &put.config))?;
            self.record.description = put.description;
            self.record.config = put.config;
            return Ok(());
        }

        let old = NetworkPut {
            description: self.record.description.clone(),
            config: self.record.config.clone(),
        };
        let live_change = !change.changed_keys.is_empty();

        let mut reverter = Reverter::new();
        let result = async {
            if live_change {
                self.prepare_update(&put.config, &change.changed_keys)?;
            }

            if client != ClientType::Notifier {
                self.state
                    .cluster
                    .transaction(|tx| tx.update_network(id, &put.description, &put.config))?;
                let (cluster, old) = (self.state.cluster.clone(), old.clone());
                reverter.add(move || {
                    if let Err(e) =
                        cluster.transaction(|tx| tx.update_network(id, &old.description, &old.config))
                    {
                        log_error!("Failed restoring network record {}: {}", id, e);
                    }
                });
            }

            self.record.description = put.description.clone();
            self.record.config = put.config.clone();

            if live_change {
                self.setup(Some(&old.config)).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            reverter.fail();
            self.record.description = old.description;
            self.record.config = old.config;
            if live_change {
                if let Err(err) = self.setup(Some(&put.config)).await {
                    log_error!("Failed restoring network {}: {}", self.record.name, err);
                }
            }
            return Err(e);
        }

        reverter.success();
        log_info!("Network {} updated", self.record.name);
        Ok(())
    }

    async fn rename(&mut self, new_name: &str) -> Result<()> {
        log_debug!("Rename network {} to {}", self.record.name, new_name);

        if self.state.host.interface_exists(new_name) {
            return Err(NovaError::Conflict(format!(
                "Network interface {:?} already exists",
                new_name
            )));
        }

        if self.is_running() {
            self.stop()?;
        }

        let id = self.record.id;
        self.state
            .cluster
            .transaction(|tx| tx.rename_network(id, new_name))?;

        let old_dir = self.state.network_dir(&self.record.name);
        let new_dir = self.state.network_dir(new_name);
        if old_dir.root().exists() {
            fs::rename(old_dir.root(), new_dir.root())?;
        }

        self.record.name = new_name.to_string();
        self.start().await
    }

    fn delete(&self, client: ClientType) -> Result<()> {
        log_debug!("Delete network {}", self.record.name);

        if self.is_running() {
            self.stop()?;
        }

        for iface in external_interfaces(&self.record.config) {
            if iface.vlan.is_some() && self.state.host.interface_exists(&iface.name) {
                self.state.host.delete_link(&iface.name)?;
            }
        }

        self.state.apparmor.network_delete(&self.record.name)?;

        let dir = self.state.network_dir(&self.record.name);
        if dir.root().exists() {
            fs::remove_dir_all(dir.root())?;
        }

        if client != ClientType::Notifier {
            let id = self.record.id;
            self.state.cluster.transaction(|tx| tx.delete_network(id))?;
        }

        log_info!("Network {} deleted", self.record.name);
        Ok(())
    }

    fn uses_dnsmasq(&self) -> bool {
        bridge_config::uses_dnsmasq(&self.record.config)
    }

    fn leases(&self, project: &str, client: ClientType) -> Result<Vec<NetworkLease>> {
        let mut leases = Vec::new();
        let mut project_macs: Vec<String> = Vec::new();
        let name = &self.record.name;

        if client == ClientType::Normal {
            if project == self.record.project {
                for key in ["ipv4.address", "ipv6.address"] {
                    if let Ok(address) = parse_cidr(self.get(key)) {
                        leases.push(NetworkLease {
                            hostname: format!("{}.gw", name),
                            hwaddr: String::new(),
                            address: address.addr().to_string(),
                            lease_type: "gateway".to_string(),
                            location: String::new(),
                        });
                    }
                }

                let networks = self.state.cluster.transaction(|tx| Ok(tx.created_networks()))?;
                for network in networks.iter().filter(|n| get(&n.config, "network") == name) {
                    for key in ["volatile.network.ipv4.address", "volatile.network.ipv6.address"] {
                        let address = get(&network.config, key);
                        if !address.is_empty() {
                            leases.push(NetworkLease {
                                hostname: format!("{}-{}.uplink", network.project, network.name),
                                hwaddr: String::new(),
                                address: address.to_string(),
                                lease_type: "uplink".to_string(),
                                location: String::new(),
                            });
                        }
                    }
                }
            }

            let instances = self.state.cluster.transaction(|tx| {
                Ok(tx.instances(&InstanceFilter {
                    project: Some(project.to_string()),
                    node: None,
                }))
            })?;
            let subnet_v6 = match parse_cidr(self.get("ipv6.address")) {
                Ok(IpNet::V6(net)) => Some(net.trunc()),
                _ => None,
            };
            let stateless = is_false_or_empty(self.get("ipv6.dhcp.stateful"));

            for inst in instances {
                for (device, nic) in &inst.devices {
                    if !nic_uses_network(nic, name) {
                        continue;
                    }

                    let hwaddr = match get(nic, "hwaddr") {
                        "" => get(&inst.config, &format!("volatile.{}.hwaddr", device)),
                        mac => mac,
                    };
                    let mac = parse_mac(hwaddr);
                    let hwaddr = mac.as_ref().map(format_mac).unwrap_or_default();
                    if !hwaddr.is_empty() {
                        project_macs.push(hwaddr.clone());
                    }

                    let lease = |address: String, lease_type: &str| NetworkLease {
                        hostname: inst.name.clone(),
                        hwaddr: hwaddr.clone(),
                        address,
                        lease_type: lease_type.to_string(),
                        location: inst.node.clone(),
                    };

                    for key in ["ipv4.address", "ipv6.address"] {
                        if let Ok(ip) = IpAddr::from_str(get(nic, key)) {
                            leases.push(lease(ip.to_string(), "static"));
                        }
                    }

                    if let (Some(prefix), Some(mac), true) = (subnet_v6, mac, stateless) {
                        if let Ok(ip) = derive_eui64(&prefix, &mac) {
                            leases.push(lease(ip.to_string(), "dynamic"));
                        }
                    }
                }
            }
        }

        for lease in dnsmasq::read_leases(&self.state.network_dir(name))? {
            let known = leases
                .iter()
                .any(|l| l.hwaddr == lease.hwaddr && l.address == lease.address);
            if known {
                continue;
            }
            if client == ClientType::Normal
                && !lease.hwaddr.is_empty()
                && !project_macs.contains(&lease.hwaddr)
            {
                continue;
            }

            leases.push(NetworkLease {
                hostname: lease.hostname,
                hwaddr: lease.hwaddr,
                address: lease.address,
                lease_type: "dynamic".to_string(),
                location: self.state.settings.server_name.clone(),
            });
        }

        Ok(leases)
    }

    fn forwards(&self) -> Result<Vec<NetworkForward>> {
        let scope = self.forward_scope();
        Ok(scope
            .local_records(None)?
            .into_iter()
            .map(|record| NetworkForward {
                listen_address: record.listen_address,
                description: record.description,
                config: record.config,
                ports: record.ports,
                location: self.state.settings.server_name.clone(),
            })
            .collect())
    }

    fn forward_create(&self, forward: NetworkForwardsPost, _client: ClientType) -> Result<()> {
        let hairpin = !Self::is_ovs(&self.record.config);
        self.forward_scope().create(forward, hairpin)
    }

    fn forward_update(
        &self,
        listen_address: &str,
        req: NetworkForwardPut,
        _client: ClientType,
    ) -> Result<()> {
        self.forward_scope().update(listen_address, req)
    }

    fn forward_delete(&self, listen_address: &str, _client: ClientType) -> Result<()> {
        self.forward_scope().delete(listen_address)
    }
}
