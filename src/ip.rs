//! Link, address, route and sysctl primitives.
//!
//! [`HostNetwork`] is the seam the bridge driver talks to; [`IpCommand`] is
//! the production implementation on top of iproute2, ovs-vsctl and /proc/sys.

use crate::{NovaError, Result, log_debug, log_error};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn version(&self) -> u8 {
        match self {
            Family::V4 => 4,
            Family::V6 => 6,
        }
    }

    fn flag(&self) -> &'static str {
        match self {
            Family::V4 => "-4",
            Family::V6 => "-6",
        }
    }

    pub fn of(net: &IpNet) -> Family {
        match net {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VxlanOpts {
    pub id: u32,
    pub local: Option<IpAddr>,
    pub remote: Option<IpAddr>,
    pub group: Option<IpAddr>,
    pub dev: Option<String>,
    pub port: Option<u16>,
    pub ttl: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkKind {
    Bridge,
    Dummy,
    Vlan { parent: String, id: u16 },
    Gretap { local: IpAddr, remote: IpAddr },
    Vxlan(VxlanOpts),
}

impl LinkKind {
    pub fn name(&self) -> &'static str {
        match self {
            LinkKind::Bridge => "bridge",
            LinkKind::Dummy => "dummy",
            LinkKind::Vlan { .. } => "vlan",
            LinkKind::Gretap { .. } => "gretap",
            LinkKind::Vxlan(_) => "vxlan",
        }
    }
}

/// Link to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLink {
    pub name: String,
    pub kind: LinkKind,
    pub mtu: Option<u32>,
    pub address: Option<String>,
}

/// Link as reported by the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
    pub kind: String,
    pub master: Option<String>,
    pub parent: Option<String>,
    pub vlan_id: Option<u16>,
    pub mtu: u32,
    pub address: String,
    pub up: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub dev: String,
    pub dst: IpNet,
    pub via: Option<IpAddr>,
    pub proto: Option<String>,
}

impl Route {
    pub fn family(&self) -> Family {
        Family::of(&self.dst)
    }
}

pub trait HostNetwork: Send + Sync {
    fn interface_exists(&self, name: &str) -> bool;
    fn link(&self, name: &str) -> Result<Link>;
    fn links(&self) -> Result<Vec<Link>>;
    fn add_link(&self, link: &NewLink) -> Result<()>;
    fn delete_link(&self, name: &str) -> Result<()>;
    fn set_up(&self, name: &str) -> Result<()>;
    fn set_down(&self, name: &str) -> Result<()>;
    fn set_mtu(&self, name: &str, mtu: u32) -> Result<()>;
    fn set_address(&self, name: &str, mac: &str) -> Result<()>;
    fn set_master(&self, name: &str, master: &str) -> Result<()>;
    fn set_nomaster(&self, name: &str) -> Result<()>;
    fn set_hairpin(&self, name: &str, enabled: bool) -> Result<()>;
    fn set_vlan_filtering(&self, name: &str, enabled: bool) -> Result<()>;

    /// Global scope addresses of `name`.
    fn addresses(&self, name: &str, family: Family) -> Result<Vec<IpNet>>;
    fn add_address(&self, name: &str, address: &IpNet) -> Result<()>;
    fn flush_addresses(&self, name: &str, family: Family) -> Result<()>;

    fn routes(&self, name: &str, family: Family, proto: Option<&str>) -> Result<Vec<Route>>;
    fn add_route(&self, route: &Route) -> Result<()>;
    fn flush_routes(&self, name: &str, family: Family, proto: &str) -> Result<()>;

    /// Keys are relative to /proc/sys, e.g. `net/ipv4/ip_forward`.
    fn sysctl_get(&self, key: &str) -> Result<String>;
    fn sysctl_set(&self, key: &str, value: &str) -> Result<()>;

    fn default_gateway_device_v4(&self) -> Result<String>;
    fn bridge_netfilter_enabled(&self, family: Family) -> bool;

    fn ovs_add_bridge(&self, name: &str) -> Result<()>;
    fn ovs_delete_bridge(&self, name: &str) -> Result<()>;
    fn ovs_add_port(&self, bridge: &str, port: &str) -> Result<()>;
    fn ovs_delete_port(&self, bridge: &str, port: &str) -> Result<()>;
}

/// Names of every link enslaved to `master`.
pub fn links_with_master(host: &dyn HostNetwork, master: &str) -> Result<Vec<Link>> {
    Ok(host
        .links()?
        .into_iter()
        .filter(|l| l.master.as_deref() == Some(master))
        .collect())
}

pub struct IpCommand {
    sysctl_root: PathBuf,
}

impl IpCommand {
    pub fn new() -> Self {
        Self {
            sysctl_root: PathBuf::from("/proc/sys"),
        }
    }

    fn run(&self, program: &str, args: &[String]) -> Result<String> {
        log_debug!("Running {} {}", program, args.join(" "));
        let output = Command::new(program).args(args).output().map_err(|e| {
            log_error!("Failed to run {}: {}", program, e);
            NovaError::SystemCommandFailed(format!("{}: {}", program, e))
        })?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr).trim().to_string();
            log_error!("{} {} failed: {}", program, args.join(" "), error);
            return Err(NovaError::SystemCommandFailed(format!(
                "{} {}: {}",
                program,
                args.join(" "),
                error
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn ip(&self, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.run("ip", &args)
    }

    fn ovs(&self, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.run("ovs-vsctl", &args)
    }
}

impl Default for IpCommand {
    fn default() -> Self {
        Self::new()
    }
}

impl HostNetwork for IpCommand {
    fn interface_exists(&self, name: &str) -> bool {
        Path::new(&format!("/sys/class/net/{}", name)).exists()
    }

    fn link(&self, name: &str) -> Result<Link> {
        let output = self.ip(&["-j", "-d", "link", "show", "dev", name])?;
        parse_links_json(&output)?
            .into_iter()
            .next()
            .ok_or_else(|| NovaError::NotFound(format!("Interface {:?} not found", name)))
    }

    fn links(&self) -> Result<Vec<Link>> {
        let output = self.ip(&["-j", "-d", "link", "show"])?;
        parse_links_json(&output)
    }

    fn add_link(&self, link: &NewLink) -> Result<()> {
        let mut cmd = vec!["link".to_string(), "add".to_string()];
        if let LinkKind::Vlan { parent, .. } = &link.kind {
            cmd.extend(["link".to_string(), parent.clone()]);
        }
        cmd.extend(["name".to_string(), link.name.clone()]);
        if let Some(mtu) = link.mtu {
            cmd.extend(["mtu".to_string(), mtu.to_string()]);
        }
        if let Some(address) = &link.address {
            cmd.extend(["address".to_string(), address.clone()]);
        }
        cmd.extend(["type".to_string(), link.kind.name().to_string()]);

        match &link.kind {
            LinkKind::Bridge | LinkKind::Dummy => {}
            LinkKind::Vlan { id, .. } => cmd.extend(["id".to_string(), id.to_string()]),
            LinkKind::Gretap { local, remote } => cmd.extend([
                "local".to_string(),
                local.to_string(),
                "remote".to_string(),
                remote.to_string(),
            ]),
            LinkKind::Vxlan(opts) => {
                cmd.extend(["id".to_string(), opts.id.to_string()]);
                if let Some(local) = opts.local {
                    cmd.extend(["local".to_string(), local.to_string()]);
                }
                if let Some(remote) = opts.remote {
                    cmd.extend(["remote".to_string(), remote.to_string()]);
                }
                if let Some(group) = opts.group {
                    cmd.extend(["group".to_string(), group.to_string()]);
                }
                if let Some(dev) = &opts.dev {
                    cmd.extend(["dev".to_string(), dev.clone()]);
                }
                if let Some(port) = opts.port {
                    cmd.extend(["dstport".to_string(), port.to_string()]);
                }
                if let Some(ttl) = opts.ttl {
                    cmd.extend(["ttl".to_string(), ttl.to_string()]);
                }
            }
        }

        self.run("ip", &cmd)?;
        Ok(())
    }

    fn delete_link(&self, name: &str) -> Result<()> {
        self.ip(&["link", "delete", "dev", name])?;
        Ok(())
    }

    fn set_up(&self, name: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", name, "up"])?;
        Ok(())
    }

    fn set_down(&self, name: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", name, "down"])?;
        Ok(())
    }

    fn set_mtu(&self, name: &str, mtu: u32) -> Result<()> {
        self.ip(&["link", "set", "dev", name, "mtu", &mtu.to_string()])?;
        Ok(())
    }

    fn set_address(&self, name: &str, mac: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", name, "address", mac])?;
        Ok(())
    }

    fn set_master(&self, name: &str, master: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", name, "master", master])?;
        Ok(())
    }

    fn set_nomaster(&self, name: &str) -> Result<()> {
        self.ip(&["link", "set", "dev", name, "nomaster"])?;
        Ok(())
    }

    fn set_hairpin(&self, name: &str, enabled: bool) -> Result<()> {
        let mode = if enabled { "on" } else { "off" };
        let args: Vec<String> = ["link", "set", "dev", name, "hairpin", mode]
            .iter()
            .map(|a| a.to_string())
            .collect();
        self.run("bridge", &args)?;
        Ok(())
    }

    fn set_vlan_filtering(&self, name: &str, enabled: bool) -> Result<()> {
        let value = if enabled { "1" } else { "0" };
        self.ip(&["link", "set", "dev", name, "type", "bridge", "vlan_filtering", value])?;
        Ok(())
    }

    fn addresses(&self, name: &str, family: Family) -> Result<Vec<IpNet>> {
        let output = self.ip(&["-j", family.flag(), "addr", "show", "dev", name, "scope", "global"])?;
        parse_addresses_json(&output)
    }

    fn add_address(&self, name: &str, address: &IpNet) -> Result<()> {
        let flag = Family::of(address).flag();
        self.ip(&[flag, "addr", "add", &address.to_string(), "dev", name])?;
        Ok(())
    }

    fn flush_addresses(&self, name: &str, family: Family) -> Result<()> {
        self.ip(&[family.flag(), "addr", "flush", "dev", name, "scope", "global"])?;
        Ok(())
    }

    fn routes(&self, name: &str, family: Family, proto: Option<&str>) -> Result<Vec<Route>> {
        let mut args = vec!["-j", family.flag(), "route", "show", "dev", name];
        if let Some(proto) = proto {
            args.extend(["proto", proto]);
        }
        let output = self.ip(&args)?;
        parse_routes_json(&output, name, family, proto)
    }

    fn add_route(&self, route: &Route) -> Result<()> {
        let dst = route.dst.to_string();
        let mut args = vec![route.family().flag(), "route", "add", dst.as_str(), "dev", route.dev.as_str()];
        let via = route.via.map(|v| v.to_string());
        if let Some(via) = via.as_deref() {
            args.extend(["via", via]);
        }
        if let Some(proto) = route.proto.as_deref() {
            args.extend(["proto", proto]);
        }
        self.ip(&args)?;
        Ok(())
    }

    fn flush_routes(&self, name: &str, family: Family, proto: &str) -> Result<()> {
        self.ip(&[family.flag(), "route", "flush", "dev", name, "proto", proto])?;
        Ok(())
    }

    fn sysctl_get(&self, key: &str) -> Result<String> {
        let value = fs::read_to_string(self.sysctl_root.join(key))?;
        Ok(value.trim().to_string())
    }

    fn sysctl_set(&self, key: &str, value: &str) -> Result<()> {
        fs::write(self.sysctl_root.join(key), value).map_err(|e| {
            log_error!("Failed to set sysctl {}={}: {}", key, value, e);
            NovaError::from(e)
        })
    }

    fn default_gateway_device_v4(&self) -> Result<String> {
        let output = self.ip(&["-j", "-4", "route", "show", "default"])?;
        let routes: Vec<Value> = serde_json::from_str(&output)?;
        routes
            .iter()
            .find_map(|r| r.get("dev").and_then(Value::as_str).map(String::from))
            .ok_or_else(|| NovaError::NotFound("No default IPv4 gateway found".to_string()))
    }

    fn bridge_netfilter_enabled(&self, family: Family) -> bool {
        let key = match family {
            Family::V4 => "net/bridge/bridge-nf-call-iptables",
            Family::V6 => "net/bridge/bridge-nf-call-ip6tables",
        };
        matches!(self.sysctl_get(key).as_deref(), Ok("1"))
    }

    fn ovs_add_bridge(&self, name: &str) -> Result<()> {
        self.ovs(&["--may-exist", "add-br", name])?;
        Ok(())
    }

    fn ovs_delete_bridge(&self, name: &str) -> Result<()> {
        self.ovs(&["--if-exists", "del-br", name])?;
        Ok(())
    }

    fn ovs_add_port(&self, bridge: &str, port: &str) -> Result<()> {
        self.ovs(&["--may-exist", "add-port", bridge, port])?;
        Ok(())
    }

    fn ovs_delete_port(&self, bridge: &str, port: &str) -> Result<()> {
        self.ovs(&["--if-exists", "del-port", bridge, port])?;
        Ok(())
    }
}

/// Parse `ip -j -d link show` output.
pub fn parse_links_json(json: &str) -> Result<Vec<Link>> {
    let entries: Vec<Value> = serde_json::from_str(json)?;
    let mut links = Vec::with_capacity(entries.len());

    for entry in entries {
        let Some(name) = entry.get("ifname").and_then(Value::as_str) else {
            continue;
        };

        let info = entry.get("linkinfo");
        let kind = info
            .and_then(|i| i.get("info_kind"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let vlan_id = if kind == "vlan" {
            info.and_then(|i| i.get("info_data"))
                .and_then(|d| d.get("id"))
                .and_then(Value::as_u64)
                .and_then(|id| u16::try_from(id).ok())
        } else {
            None
        };

        let up = entry
            .get("flags")
            .and_then(Value::as_array)
            .is_some_and(|flags| flags.iter().any(|f| f.as_str() == Some("UP")));

        links.push(Link {
            name: name.to_string(),
            kind,
            master: entry.get("master").and_then(Value::as_str).map(String::from),
            parent: entry.get("link").and_then(Value::as_str).map(String::from),
            vlan_id,
            mtu: entry.get("mtu").and_then(Value::as_u64).unwrap_or(0) as u32,
            address: entry
                .get("address")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            up,
        });
    }

    Ok(links)
}

/// Parse `ip -j addr show` output into CIDR addresses.
pub fn parse_addresses_json(json: &str) -> Result<Vec<IpNet>> {
    let entries: Vec<Value> = serde_json::from_str(json)?;
    let mut addresses = Vec::new();

    for entry in entries {
        let Some(infos) = entry.get("addr_info").and_then(Value::as_array) else {
            continue;
        };
        for info in infos {
            let local = info.get("local").and_then(Value::as_str);
            let prefix = info.get("prefixlen").and_then(Value::as_u64);
            if let (Some(local), Some(prefix)) = (local, prefix) {
                if let Ok(net) = IpNet::from_str(&format!("{}/{}", local, prefix)) {
                    addresses.push(net);
                }
            }
        }
    }

    Ok(addresses)
}

/// Parse `ip -j route show` output. `default` destinations are mapped to the
/// all-zero network of `family`.
pub fn parse_routes_json(
    json: &str,
    dev: &str,
    family: Family,
    proto: Option<&str>,
) -> Result<Vec<Route>> {
    let entries: Vec<Value> = serde_json::from_str(json)?;
    let mut routes = Vec::new();

    for entry in entries {
        let Some(dst) = entry.get("dst").and_then(Value::as_str) else {
            continue;
        };
        let dst = if dst == "default" {
            match family {
                Family::V4 => "0.0.0.0/0".to_string(),
                Family::V6 => "::/0".to_string(),
            }
        } else if dst.contains('/') {
            dst.to_string()
        } else if family == Family::V4 {
            format!("{}/32", dst)
        } else {
            format!("{}/128", dst)
        };

        let Ok(dst) = IpNet::from_str(&dst) else {
            continue;
        };

        let via = entry
            .get("gateway")
            .and_then(Value::as_str)
            .and_then(|g| IpAddr::from_str(g).ok());
        let route_proto = entry
            .get("protocol")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| proto.map(String::from));

        routes.push(Route {
            dev: entry
                .get("dev")
                .and_then(Value::as_str)
                .unwrap_or(dev)
                .to_string(),
            dst,
            via,
            proto: route_proto,
        });
    }

    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_links() {
        let json = r#"[
            {"ifindex":3,"ifname":"br0","flags":["BROADCAST","MULTICAST","UP"],"mtu":1500,
             "address":"10:66:6a:00:00:01","linkinfo":{"info_kind":"bridge"}},
            {"ifindex":4,"ifname":"eth0.10","link":"eth0","master":"br0","flags":["BROADCAST"],
             "mtu":1500,"address":"52:54:00:00:00:01",
             "linkinfo":{"info_kind":"vlan","info_data":{"protocol":"802.1Q","id":10}}}
        ]"#;

        let links = parse_links_json(json).unwrap();
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].kind, "bridge");
        assert!(links[0].up);
        assert_eq!(links[1].vlan_id, Some(10));
        assert_eq!(links[1].parent.as_deref(), Some("eth0"));
        assert_eq!(links[1].master.as_deref(), Some("br0"));
        assert!(!links[1].up);
    }

    #[test]
    fn parses_addresses() {
        let json = r#"[{"ifname":"br0","addr_info":[
            {"family":"inet","local":"10.10.10.1","prefixlen":24,"scope":"global"}]}]"#;
        let addrs = parse_addresses_json(json).unwrap();
        assert_eq!(addrs, vec!["10.10.10.1/24".parse::<IpNet>().unwrap()]);
    }

    #[test]
    fn parses_routes() {
        let json = r#"[
            {"dst":"10.20.0.0/16","gateway":"10.10.10.5","protocol":"boot","flags":[]},
            {"dst":"192.0.2.7","flags":[]}
        ]"#;
        let routes = parse_routes_json(json, "br0", Family::V4, Some("boot")).unwrap();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].via, Some("10.10.10.5".parse().unwrap()));
        assert_eq!(routes[1].dst.to_string(), "192.0.2.7/32");
        assert_eq!(routes[1].proto.as_deref(), Some("boot"));
        assert_eq!(routes[1].dev, "br0");
    }
}
