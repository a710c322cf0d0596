// In-memory host, firewall and process doubles shared by the integration tests
#![allow(dead_code)]

use ipnet::IpNet;
use nix::sys::signal::Signal;
use nova_bridge::apparmor::AppArmor;
use nova_bridge::bgp::PrefixTable;
use nova_bridge::config::DaemonConfig;
use nova_bridge::db::Cluster;
use nova_bridge::firewall::{AclRuleset, AddressForward, Firewall, FirewallBackend, FirewallOptions};
use nova_bridge::ip::{Family, HostNetwork, Link, NewLink, Route};
use nova_bridge::network::{self, ClientType, ConfigMap, DaemonState, Network, NetworkPut, NetworksPost};
use nova_bridge::subprocess::{ProcessSpec, Supervisor};
use nova_bridge::{NovaError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub fn config(pairs: &[(&str, &str)]) -> ConfigMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostState {
    pub links: BTreeMap<String, Link>,
    pub ifindex: BTreeMap<String, u32>,
    pub addresses: BTreeMap<String, Vec<IpNet>>,
    pub routes: Vec<Route>,
    pub sysctls: BTreeMap<String, String>,
    pub hairpin: BTreeSet<String>,
    next_index: u32,
}

/// Link, address and route tables kept in memory.
#[derive(Default)]
pub struct FakeHost {
    state: Mutex<HostState>,
    failing: Mutex<BTreeSet<String>>,
    /// Fail the N-th state changing call (1-based), counting from `fail_at`.
    fail_nth: Mutex<Option<usize>>,
    ops: Mutex<usize>,
    pub netfilter: Mutex<bool>,
}

impl FakeHost {
    pub fn new() -> Self {
        let host = Self::default();
        *host.netfilter.lock().unwrap() = true;
        host
    }

    /// Make every later call of `op` fail.
    pub fn fail_on(&self, op: &str) {
        self.failing.lock().unwrap().insert(op.to_string());
    }

    pub fn fail_at(&self, n: usize) {
        *self.ops.lock().unwrap() = 0;
        *self.fail_nth.lock().unwrap() = Some(n);
    }

    pub fn snapshot(&self) -> HostState {
        self.state.lock().unwrap().clone()
    }

    /// Create a plain host link such as a veth end or a physical NIC.
    pub fn add_host_link(&self, name: &str, kind: &str) {
        let mut state = self.state.lock().unwrap();
        state.next_index += 1;
        let index = state.next_index;
        state.ifindex.insert(name.to_string(), index);
        state.links.insert(
            name.to_string(),
            Link {
                name: name.to_string(),
                kind: kind.to_string(),
                mtu: 1500,
                ..Default::default()
            },
        );
    }

    pub fn link_names(&self) -> Vec<String> {
        self.state.lock().unwrap().links.keys().cloned().collect()
    }

    fn check(&self, op: &str) -> Result<()> {
        if self.failing.lock().unwrap().contains(op) {
            return Err(NovaError::Os(format!("injected failure in {}", op)));
        }
        if op == "delete_link" {
            return Ok(());
        }

        let mut ops = self.ops.lock().unwrap();
        *ops += 1;
        if *self.fail_nth.lock().unwrap() == Some(*ops) {
            return Err(NovaError::Os(format!("injected failure in {} (call {})", op, *ops)));
        }
        Ok(())
    }

    fn with_link<T>(&self, name: &str, f: impl FnOnce(&mut Link) -> T) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        let link = state
            .links
            .get_mut(name)
            .ok_or_else(|| NovaError::NotFound(format!("Link {:?} not found", name)))?;
        Ok(f(link))
    }
}

impl HostNetwork for FakeHost {
    fn interface_exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().links.contains_key(name)
    }

    fn link(&self, name: &str) -> Result<Link> {
        self.with_link(name, |link| link.clone())
    }

    fn links(&self) -> Result<Vec<Link>> {
        Ok(self.state.lock().unwrap().links.values().cloned().collect())
    }

    fn add_link(&self, link: &NewLink) -> Result<()> {
        self.check("add_link")?;
        let mut state = self.state.lock().unwrap();
        if state.links.contains_key(&link.name) {
            return Err(NovaError::Conflict(format!("Link {:?} exists", link.name)));
        }
        let (parent, vlan_id) = match &link.kind {
            nova_bridge::ip::LinkKind::Vlan { parent, id } => (Some(parent.clone()), Some(*id)),
            _ => (None, None),
        };
        state.next_index += 1;
        let index = state.next_index;
        state.ifindex.insert(link.name.clone(), index);
        state.links.insert(
            link.name.clone(),
            Link {
                name: link.name.clone(),
                kind: link.kind.name().to_string(),
                master: None,
                parent,
                vlan_id,
                mtu: link.mtu.unwrap_or(1500),
                address: link.address.clone().unwrap_or_default(),
                up: false,
            },
        );
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        self.check("delete_link")?;
        let mut state = self.state.lock().unwrap();
        if state.links.remove(name).is_none() {
            return Err(NovaError::NotFound(format!("Link {:?} not found", name)));
        }
        state.ifindex.remove(name);
        state.addresses.remove(name);
        state.routes.retain(|r| r.dev != name);
        for link in state.links.values_mut() {
            if link.master.as_deref() == Some(name) {
                link.master = None;
            }
        }
        Ok(())
    }

    fn set_up(&self, name: &str) -> Result<()> {
        self.check("set_up")?;
        self.with_link(name, |link| link.up = true)
    }

    fn set_down(&self, name: &str) -> Result<()> {
        self.with_link(name, |link| link.up = false)
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        self.check("set_mtu")?;
        self.with_link(name, |link| link.mtu = mtu)
    }

    fn set_address(&self, name: &str, mac: &str) -> Result<()> {
        self.with_link(name, |link| link.address = mac.to_string())
    }

    fn set_master(&self, name: &str, master: &str) -> Result<()> {
        self.check("set_master")?;
        self.with_link(name, |link| link.master = Some(master.to_string()))
    }

    fn set_nomaster(&self, name: &str) -> Result<()> {
        self.with_link(name, |link| link.master = None)
    }

    fn set_hairpin(&self, name: &str, enabled: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if enabled {
            state.hairpin.insert(name.to_string());
        } else {
            state.hairpin.remove(name);
        }
        Ok(())
    }

    fn set_vlan_filtering(&self, _name: &str, _enabled: bool) -> Result<()> {
        Ok(())
    }

    fn addresses(&self, name: &str, family: Family) -> Result<Vec<IpNet>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .addresses
            .get(name)
            .map(|addrs| addrs.iter().filter(|a| Family::of(a) == family).cloned().collect())
            .unwrap_or_default())
    }

    fn add_address(&self, name: &str, address: &IpNet) -> Result<()> {
        self.check("add_address")?;
        let mut state = self.state.lock().unwrap();
        let addrs = state.addresses.entry(name.to_string()).or_default();
        if !addrs.contains(address) {
            addrs.push(*address);
        }
        Ok(())
    }

    fn flush_addresses(&self, name: &str, family: Family) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(addrs) = state.addresses.get_mut(name) {
            addrs.retain(|a| Family::of(a) != family);
        }
        Ok(())
    }

    fn routes(&self, name: &str, family: Family, proto: Option<&str>) -> Result<Vec<Route>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .routes
            .iter()
            .filter(|r| r.dev == name && r.family() == family)
            .filter(|r| proto.is_none_or(|p| r.proto.as_deref() == Some(p)))
            .cloned()
            .collect())
    }

    fn add_route(&self, route: &Route) -> Result<()> {
        self.check("add_route")?;
        let mut state = self.state.lock().unwrap();
        if !state.routes.contains(route) {
            state.routes.push(route.clone());
        }
        Ok(())
    }

    fn flush_routes(&self, name: &str, family: Family, proto: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state
            .routes
            .retain(|r| !(r.dev == name && r.family() == family && r.proto.as_deref() == Some(proto)));
        Ok(())
    }

    fn sysctl_get(&self, key: &str) -> Result<String> {
        self.state
            .lock()
            .unwrap()
            .sysctls
            .get(key)
            .cloned()
            .ok_or_else(|| NovaError::NotFound(format!("sysctl {} not found", key)))
    }

    fn sysctl_set(&self, key: &str, value: &str) -> Result<()> {
        self.check("sysctl_set")?;
        self.state
            .lock()
            .unwrap()
            .sysctls
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn default_gateway_device_v4(&self) -> Result<String> {
        Ok("eth0".to_string())
    }

    fn bridge_netfilter_enabled(&self, _family: Family) -> bool {
        *self.netfilter.lock().unwrap()
    }

    fn ovs_add_bridge(&self, name: &str) -> Result<()> {
        self.add_link(&NewLink {
            name: name.to_string(),
            kind: nova_bridge::ip::LinkKind::Bridge,
            mtu: None,
            address: None,
        })
    }

    fn ovs_delete_bridge(&self, name: &str) -> Result<()> {
        self.delete_link(name)
    }

    fn ovs_add_port(&self, bridge: &str, port: &str) -> Result<()> {
        self.set_master(port, bridge)
    }

    fn ovs_delete_port(&self, _bridge: &str, port: &str) -> Result<()> {
        self.set_nomaster(port)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FirewallState {
    pub networks: BTreeMap<String, FirewallOptions>,
    pub forwards: BTreeMap<String, Vec<AddressForward>>,
    pub acls: BTreeMap<String, AclRuleset>,
}

/// Records what would be programmed into the kernel.
#[derive(Default)]
pub struct FakeFirewall {
    state: Mutex<FirewallState>,
    pub apply_forward_calls: Mutex<usize>,
    pub fail_setup: Mutex<bool>,
    /// Number of upcoming `network_setup` calls that fail.
    pub fail_next_setups: Mutex<usize>,
    /// Number of upcoming `network_apply_forwards` calls that fail.
    pub fail_next_forwards: Mutex<usize>,
}

impl FakeFirewall {
    pub fn snapshot(&self) -> FirewallState {
        self.state.lock().unwrap().clone()
    }

    pub fn forward_calls(&self) -> usize {
        *self.apply_forward_calls.lock().unwrap()
    }

    fn take_failure(counter: &Mutex<usize>) -> bool {
        let mut left = counter.lock().unwrap();
        if *left == 0 {
            return false;
        }
        *left -= 1;
        true
    }
}

impl Firewall for FakeFirewall {
    fn backend(&self) -> FirewallBackend {
        FirewallBackend::Nftables
    }

    fn network_setup(&self, network: &str, opts: &FirewallOptions) -> Result<()> {
        if *self.fail_setup.lock().unwrap() || Self::take_failure(&self.fail_next_setups) {
            return Err(NovaError::Os("injected firewall failure".to_string()));
        }
        self.state
            .lock()
            .unwrap()
            .networks
            .insert(network.to_string(), opts.clone());
        Ok(())
    }

    fn network_clear(&self, network: &str, delete: bool, _ip_versions: &[u8]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.networks.remove(network);
        if delete {
            state.forwards.remove(network);
            state.acls.remove(network);
        }
        Ok(())
    }

    fn network_apply_forwards(&self, network: &str, forwards: &[AddressForward]) -> Result<()> {
        *self.apply_forward_calls.lock().unwrap() += 1;
        if Self::take_failure(&self.fail_next_forwards) {
            return Err(NovaError::Os("injected forward failure".to_string()));
        }
        let mut state = self.state.lock().unwrap();
        if forwards.is_empty() {
            state.forwards.remove(network);
        } else {
            state.forwards.insert(network.to_string(), forwards.to_vec());
        }
        Ok(())
    }

    fn network_apply_acls(&self, network: &str, ruleset: &AclRuleset) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .acls
            .insert(network.to_string(), ruleset.clone());
        Ok(())
    }

    fn instance_setup_proxy_nat(
        &self,
        _project: &str,
        _instance: &str,
        _device: &str,
        _forward: &AddressForward,
    ) -> Result<()> {
        Ok(())
    }

    fn instance_clear_proxy_nat(&self, _project: &str, _instance: &str, _device: &str) -> Result<()> {
        Ok(())
    }
}

/// Pretends to run helpers; spawned processes stay alive until signalled.
#[derive(Default)]
pub struct FakeSupervisor {
    pub spawned: Mutex<Vec<ProcessSpec>>,
    alive: Mutex<BTreeSet<u32>>,
    next_pid: Mutex<u32>,
    pub missing_dnsmasq: Mutex<bool>,
    pub crash_on_start: Mutex<bool>,
}

impl FakeSupervisor {
    pub fn running(&self) -> usize {
        self.alive.lock().unwrap().len()
    }

    pub fn last_spawn(&self) -> Option<ProcessSpec> {
        self.spawned.lock().unwrap().last().cloned()
    }
}

impl Supervisor for FakeSupervisor {
    fn lookup(&self, program: &str) -> Option<PathBuf> {
        if program == "dnsmasq" && *self.missing_dnsmasq.lock().unwrap() {
            return None;
        }
        Some(Path::new("/usr/sbin").join(program))
    }

    fn output(&self, _program: &Path, _args: &[&str]) -> Result<String> {
        Ok("Dnsmasq version 2.90  Copyright (c) 2000-2024 Simon Kelley".to_string())
    }

    fn spawn(&self, spec: &ProcessSpec) -> Result<u32> {
        let mut next = self.next_pid.lock().unwrap();
        *next += 1;
        let pid = 1000 + *next;

        if let Some(log) = &spec.log_file {
            if let Some(dir) = log.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(log, "Status: Started\n")?;
        }
        if !*self.crash_on_start.lock().unwrap() {
            self.alive.lock().unwrap().insert(pid);
        }
        self.spawned.lock().unwrap().push(spec.clone());
        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        if signal != Signal::SIGHUP {
            self.alive.lock().unwrap().remove(&pid);
        }
        Ok(())
    }
}

pub struct Harness {
    pub state: Arc<DaemonState>,
    pub host: Arc<FakeHost>,
    pub firewall: Arc<FakeFirewall>,
    pub supervisor: Arc<FakeSupervisor>,
    pub bgp: Arc<PrefixTable>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::for_member(Arc::new(Cluster::in_memory(1)), 1, "node1")
    }

    /// A second daemon sharing `cluster` with another member.
    pub fn for_member(cluster: Arc<Cluster>, node_id: i64, server_name: &str) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let settings = DaemonConfig {
            var_dir: dir.path().to_path_buf(),
            log_dir: dir.path().join("logs"),
            server_name: server_name.to_string(),
            node_id,
            certificate_fingerprint: "4b1d".to_string(),
            dnsmasq_start_grace_ms: 0,
            ..Default::default()
        };

        let host = Arc::new(FakeHost::new());
        let firewall = Arc::new(FakeFirewall::default());
        let supervisor = Arc::new(FakeSupervisor::default());
        let bgp = Arc::new(PrefixTable::new());

        let state = Arc::new(DaemonState {
            settings,
            cluster,
            host: host.clone(),
            firewall: firewall.clone(),
            supervisor: supervisor.clone(),
            bgp: bgp.clone(),
            apparmor: Arc::new(AppArmor::disabled()),
        });

        Self {
            state,
            host,
            firewall,
            supervisor,
            bgp,
            dir,
        }
    }

    pub async fn create(&self, name: &str, pairs: &[(&str, &str)]) -> Result<Box<dyn Network>> {
        let req = NetworksPost {
            name: name.to_string(),
            network_type: "bridge".to_string(),
            put: NetworkPut {
                description: String::new(),
                config: config(pairs),
            },
        };
        network::create_network(&self.state, "default", req, ClientType::Normal).await
    }

    pub fn load(&self, name: &str) -> Box<dyn Network> {
        network::load_by_name(&self.state, "default", name).expect("network should load")
    }
}
