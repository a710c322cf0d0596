//! Proxy devices: forkproxy relays and NAT mode listeners on the host.

use crate::db::{ForwardFilter, InstanceRecord, WarningType};
use crate::firewall::AddressForward;
use crate::ip::Family;
use crate::network::{ConfigMap, DaemonState, nic_type};
use crate::subprocess::{Process, ProcessSpec, stop_from_pid_file};
use crate::validate::{self, ValidResult, ValidationError, Validator, is_true, optional, rule};
use crate::{NovaError, Result, log_debug, log_error, log_info, log_warn};
use std::collections::BTreeMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const START_POLLS: usize = 10;
const START_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Parsed `<type>:<addr>:<port>[-<port>][,<port>]` or `unix:<path>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAddress {
    pub conn_type: String,
    pub address: String,
    pub ports: Vec<u16>,
    pub abstract_socket: bool,
}

fn split_host_port(value: &str) -> Result<(String, String)> {
    let invalid = || NovaError::Validation(format!("Invalid address {:?}", value));

    if let Some(rest) = value.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        return Ok((host.to_string(), port.to_string()));
    }

    let (host, port) = value.rsplit_once(':').ok_or_else(invalid)?;
    if host.contains(':') {
        return Err(invalid());
    }
    Ok((host.to_string(), port.to_string()))
}

pub fn parse_proxy_address(value: &str) -> Result<ProxyAddress> {
    let (conn_type, rest) = value.split_once(':').unwrap_or((value, ""));
    if !matches!(conn_type, "tcp" | "udp" | "unix") {
        return Err(NovaError::Validation(format!(
            "Unknown connection type {:?}",
            conn_type
        )));
    }

    let abstract_socket = rest.starts_with('@');
    if conn_type == "unix" {
        return Ok(ProxyAddress {
            conn_type: conn_type.to_string(),
            address: rest.to_string(),
            ports: Vec::new(),
            abstract_socket,
        });
    }

    let (address, ports) = split_host_port(rest)?;
    optional(validate::is_network_address)(&address)?;

    let mut parsed = Vec::new();
    for range in validate::split_trim(&ports, ',') {
        let (first, last) = match range.split_once('-') {
            Some((first, last)) => (first, last),
            None => (range.as_str(), range.as_str()),
        };
        let first = parse_port(first)?;
        let last = parse_port(last)?;
        if last < first {
            return Err(NovaError::Validation(format!("Invalid port range {:?}", range)));
        }
        parsed.extend(first..=last);
    }

    if parsed.is_empty() {
        return Err(NovaError::Validation(
            "At least one port is required".to_string(),
        ));
    }

    Ok(ProxyAddress {
        conn_type: conn_type.to_string(),
        address,
        ports: parsed,
        abstract_socket,
    })
}

fn parse_port(value: &str) -> Result<u16> {
    u16::from_str(value.trim())
        .map_err(|_| NovaError::Validation(format!("Invalid port {:?}", value)))
}

fn is_octal_mode(value: &str) -> ValidResult {
    u32::from_str_radix(value, 8)
        .map(|_| ())
        .map_err(|_| ValidationError::new(format!("Invalid file mode {:?}", value)))
}

fn is_user_id(value: &str) -> ValidResult {
    value
        .parse::<u32>()
        .map(|_| ())
        .map_err(|_| ValidationError::new(format!("Invalid ID {:?}", value)))
}

fn proxy_rules() -> BTreeMap<&'static str, Validator> {
    let address = || {
        rule(|value: &str| {
            validate::is_not_empty(value)?;
            parse_proxy_address(value)
                .map(|_| ())
                .map_err(|e| ValidationError::new(e.to_string()))
        })
    };

    BTreeMap::from([
        ("listen", address()),
        ("connect", address()),
        (
            "bind",
            optional(|value: &str| {
                if matches!(value, "host" | "instance" | "guest" | "container") {
                    Ok(())
                } else {
                    Err(ValidationError::new(
                        "Invalid binding side given. Must be \"host\" or \"instance\"",
                    ))
                }
            }),
        ),
        ("mode", optional(is_octal_mode)),
        ("nat", optional(validate::is_bool)),
        ("gid", optional(is_user_id)),
        ("uid", optional(is_user_id)),
        ("security.uid", optional(is_user_id)),
        ("security.gid", optional(is_user_id)),
        ("proxy_protocol", optional(validate::is_bool)),
    ])
}

/// Arguments handed to the forkproxy helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyProcInfo {
    pub listen_pid: String,
    pub listen_pid_fd: String,
    pub listen_addr: String,
    pub connect_pid: String,
    pub connect_pid_fd: String,
    pub connect_addr: String,
    pub listen_addr_gid: String,
    pub listen_addr_uid: String,
    pub listen_addr_mode: String,
    pub security_gid: String,
    pub security_uid: String,
    pub proxy_protocol: String,
}

impl ProxyProcInfo {
    pub fn args(&self) -> Vec<String> {
        vec![
            "forkproxy".to_string(),
            "--".to_string(),
            self.listen_pid.clone(),
            self.listen_pid_fd.clone(),
            self.listen_addr.clone(),
            self.connect_pid.clone(),
            self.connect_pid_fd.clone(),
            self.connect_addr.clone(),
            self.listen_addr_gid.clone(),
            self.listen_addr_uid.clone(),
            self.listen_addr_mode.clone(),
            self.security_gid.clone(),
            self.security_uid.clone(),
            self.proxy_protocol.clone(),
        ]
    }
}

pub struct ProxyDevice {
    state: Arc<DaemonState>,
    instance: InstanceRecord,
    name: String,
    config: ConfigMap,
    /// Init PID of the running instance.
    init_pid: u32,
}

impl ProxyDevice {
    pub fn new(state: Arc<DaemonState>, instance: InstanceRecord, name: &str, init_pid: u32) -> Result<Self> {
        let config = instance
            .devices
            .get(name)
            .cloned()
            .ok_or_else(|| NovaError::NotFound(format!("Device {:?} not found", name)))?;

        Ok(Self {
            state,
            instance,
            name: name.to_string(),
            config,
            init_pid,
        })
    }

    fn get(&self, key: &str) -> &str {
        self.config.get(key).map(String::as_str).unwrap_or_default()
    }

    fn pid_path(&self) -> PathBuf {
        self.state
            .settings
            .devices_dir(&self.instance.project, &self.instance.name)
            .join(format!("proxy.{}", self.name))
    }

    fn log_path(&self) -> PathBuf {
        self.state
            .settings
            .instance_log_dir(&self.instance.project, &self.instance.name)
            .join(format!("proxy.{}.log", self.name))
    }

    pub fn validate(&self) -> Result<()> {
        let rules = proxy_rules();
        for (key, validator) in &rules {
            let value = self.get(key);
            validator(value).map_err(|e| {
                NovaError::Validation(format!(
                    "Invalid value for device option {:?}: {}",
                    key, e
                ))
            })?;
        }
        for key in self.config.keys() {
            if key != "type" && !rules.contains_key(key.as_str()) {
                return Err(NovaError::Validation(format!(
                    "Invalid device option {:?}",
                    key
                )));
            }
        }

        let listen = parse_proxy_address(self.get("listen"))?;
        let connect = parse_proxy_address(self.get("connect"))?;

        if let Ok(addr) = IpAddr::from_str(&listen.address) {
            validate_listen_address_conflicts(&self.state, &addr)?;
        }

        if (listen.conn_type != "unix" && connect.ports.len() > listen.ports.len())
            || (listen.conn_type == "unix" && connect.ports.len() > 1)
        {
            return Err(NovaError::Validation(
                "Mismatch between listen port(s) and connect port(s) count".to_string(),
            ));
        }

        let nat = is_true(self.get("nat"));
        if is_true(self.get("proxy_protocol")) && (!self.get("connect").starts_with("tcp") || nat) {
            return Err(NovaError::Validation(
                "The PROXY header can only be sent to tcp servers in non-nat mode".to_string(),
            ));
        }

        let listen_raw = self.get("listen");
        if (!listen_raw.starts_with("unix:") || listen_raw.starts_with("unix:@"))
            && (!self.get("uid").is_empty() || !self.get("gid").is_empty() || !self.get("mode").is_empty())
        {
            return Err(NovaError::Validation(
                "Only proxy devices for non-abstract unix sockets can carry uid, gid, or mode properties"
                    .to_string(),
            ));
        }

        if nat {
            let bind = self.get("bind");
            if !bind.is_empty() && bind != "host" {
                return Err(NovaError::Validation(
                    "Only host-bound proxies can use NAT".to_string(),
                ));
            }

            if listen.conn_type == "unix" || connect.conn_type == "unix" || listen.conn_type != connect.conn_type {
                return Err(NovaError::Validation(format!(
                    "Proxying {} <-> {} is not supported when using NAT",
                    listen.conn_type, connect.conn_type
                )));
            }

            let listen_ip = IpAddr::from_str(&listen.address).map_err(|_| {
                NovaError::Validation(format!("Invalid listen address {:?}", listen.address))
            })?;
            if listen_ip.is_unspecified() {
                return Err(NovaError::Validation(format!(
                    "Cannot listen on wildcard address {:?} when in nat mode",
                    listen_ip.to_string()
                )));
            }

            let connect_v4 = IpAddr::from_str(&connect.address).map(|ip| ip.is_ipv4()).unwrap_or(false);
            if listen_ip.is_ipv4() != connect_v4 {
                return Err(NovaError::Validation(
                    "Cannot mix IP versions between listen and connect in nat mode".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn proc_info(&self) -> Result<ProxyProcInfo> {
        let instance_pid = self.init_pid.to_string();
        let daemon_pid = std::process::id().to_string();
        let no_fd = "-1".to_string();

        let (listen_pid, connect_pid) = match self.get("bind") {
            "host" | "" => (daemon_pid, instance_pid),
            "instance" | "guest" | "container" => (instance_pid, daemon_pid),
            _ => {
                return Err(NovaError::Validation(
                    "Invalid binding side given. Must be \"host\" or \"instance\"".to_string(),
                ));
            }
        };

        let mode = match self.get("mode") {
            "" => "0644",
            mode => mode,
        };

        Ok(ProxyProcInfo {
            listen_pid,
            listen_pid_fd: no_fd.clone(),
            listen_addr: self.get("listen").to_string(),
            connect_pid,
            connect_pid_fd: no_fd,
            connect_addr: self.get("connect").to_string(),
            listen_addr_gid: self.get("gid").to_string(),
            listen_addr_uid: self.get("uid").to_string(),
            listen_addr_mode: mode.to_string(),
            security_gid: self.get("security.gid").to_string(),
            security_uid: self.get("security.uid").to_string(),
            proxy_protocol: self.get("proxy_protocol").to_string(),
        })
    }

    pub async fn start(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(NovaError::Validation("Device name cannot be empty".to_string()));
        }

        if is_true(self.get("nat")) {
            return self
                .setup_nat()
                .map_err(|e| e.context(format!("Failed to start device {:?}", self.name)));
        }

        let info = self.proc_info()?;
        let log_path = self.log_path();
        if let Some(dir) = log_path.parent() {
            fs::create_dir_all(dir)?;
        }

        let helper = &self.state.settings.forkproxy;
        let program = self.state.supervisor.lookup(helper).ok_or_else(|| {
            NovaError::Os(format!(
                "Failed to start device {:?}: {} not found",
                self.name, helper
            ))
        })?;

        let spec = ProcessSpec {
            name: format!("proxy.{}", self.name),
            program,
            args: info.args(),
            log_file: Some(log_path.clone()),
            apparmor_profile: None,
        };

        let process = Process::start(self.state.supervisor.as_ref(), &spec).map_err(|e| {
            NovaError::Os(format!(
                "Failed to start device {:?}: Failed running: {} {}: {}",
                self.name,
                spec.program.display(),
                spec.args.join(" "),
                e
            ))
        })?;

        for _ in 0..START_POLLS {
            match check_proc_started(&log_path) {
                Err(e) => {
                    let _ = process.stop(self.state.supervisor.as_ref());
                    return Err(NovaError::Os(format!(
                        "Error occurred when starting proxy device: {}",
                        e
                    )));
                }
                Ok(true) => {
                    if let Err(e) = process.save(&self.pid_path()) {
                        let _ = process.stop(self.state.supervisor.as_ref());
                        return Err(NovaError::Os(format!(
                            "Failed to start device {:?}: Failed saving subprocess details: {}",
                            self.name, e
                        )));
                    }
                    log_info!("Started proxy device {} of {}", self.name, self.instance.name);
                    return Ok(());
                }
                Ok(false) => tokio::time::sleep(START_POLL_INTERVAL).await,
            }
        }

        let _ = process.stop(self.state.supervisor.as_ref());
        Err(NovaError::Os(format!(
            "Failed to start device {:?}: Please look in {}",
            self.name,
            log_path.display()
        )))
    }

    pub fn stop(&self) -> Result<()> {
        if let Err(e) = self.state.firewall.instance_clear_proxy_nat(
            &self.instance.project,
            &self.instance.name,
            &self.name,
        ) {
            log_error!("Failed to remove proxy NAT filters: {}", e);
        }

        stop_from_pid_file(self.state.supervisor.as_ref(), &self.pid_path())
            .map_err(|e| NovaError::Os(format!("Unable to kill forkproxy: {}", e)))
    }

    pub fn remove(&self) -> Result<()> {
        self.state.cluster.transaction(|tx| {
            tx.resolve_warnings(
                WarningType::ProxyBridgeNetfilterNotEnabled,
                "instance",
                self.instance.id,
            );
            Ok(())
        })
    }

    fn setup_nat(&self) -> Result<()> {
        let listen = parse_proxy_address(self.get("listen"))?;
        let connect = parse_proxy_address(self.get("connect"))?;

        let family = if listen.address.contains(':') { Family::V6 } else { Family::V4 };
        let (key, wildcard) = match family {
            Family::V4 => ("ipv4.address", "0.0.0.0"),
            Family::V6 => ("ipv6.address", "::"),
        };

        let mut connect_ip = None;
        let mut host_name = String::new();
        for (device, config) in &self.instance.devices {
            if config.get("type").map(String::as_str) != Some("nic") {
                continue;
            }
            if !matches!(nic_type(config), "bridged" | "routed") {
                continue;
            }

            let static_ip = config.get(key).map(String::as_str).unwrap_or_default();
            if static_ip.is_empty() {
                continue;
            }
            if connect.address == static_ip || connect.address == wildcard {
                connect_ip = IpAddr::from_str(static_ip).ok();
            }
            if connect_ip.is_some() {
                host_name = self
                    .instance
                    .config
                    .get(&format!("volatile.{}.host_name", device))
                    .cloned()
                    .unwrap_or_default();
                break;
            }
        }

        let Some(connect_ip) = connect_ip else {
            if connect.address == wildcard {
                return Err(NovaError::Validation(format!(
                    "Instance has no static IPv{} address assigned to be used as the connect IP",
                    family.version()
                )));
            }
            return Err(NovaError::Validation(format!(
                "Connect IP {:?} must be one of the instance's static IPv{} addresses",
                connect.address,
                family.version()
            )));
        };

        if self.state.host.bridge_netfilter_enabled(family) {
            self.state.cluster.transaction(|tx| {
                tx.resolve_warnings(
                    WarningType::ProxyBridgeNetfilterNotEnabled,
                    "instance",
                    self.instance.id,
                );
                Ok(())
            })?;

            if host_name.is_empty() {
                return Err(NovaError::Os(
                    "Proxy cannot find bridge port host_name to enable hairpin mode".to_string(),
                ));
            }
            self.state.host.set_hairpin(&host_name, true).map_err(|e| {
                NovaError::Os(format!(
                    "Error enabling hairpin mode on bridge port {:?}: {}",
                    host_name, e
                ))
            })?;
        } else {
            let msg = format!(
                "IPv{} bridge netfilter not enabled. Instances using the bridge will not be able to connect to the proxy listen IP",
                family.version()
            );
            log_warn!("{}", msg);
            let recorded = self.state.cluster.transaction(|tx| {
                tx.upsert_warning(
                    &self.instance.project,
                    "instance",
                    self.instance.id,
                    WarningType::ProxyBridgeNetfilterNotEnabled,
                    &msg,
                );
                Ok(())
            });
            if let Err(e) = recorded {
                log_warn!("Failed to create warning: {}", e);
            }
        }

        let listen_ip = IpAddr::from_str(&listen.address)
            .map_err(|_| NovaError::Validation(format!("Invalid listen address {:?}", listen.address)))?;
        let forward = AddressForward {
            listen_address: listen_ip,
            target_address: connect_ip,
            protocol: listen.conn_type.clone(),
            listen_ports: listen.ports.clone(),
            target_ports: connect.ports.clone(),
            snat: false,
        };

        log_debug!(
            "Setting up proxy NAT {} -> {} for {}/{}",
            listen_ip,
            connect_ip,
            self.instance.name,
            self.name
        );
        self.state.firewall.instance_setup_proxy_nat(
            &self.instance.project,
            &self.instance.name,
            &self.name,
            &forward,
        )
    }
}

/// Whether forkproxy reported `Status: Started`; an `Error:` line fails.
fn check_proc_started(log_path: &Path) -> Result<bool> {
    let content = fs::read_to_string(log_path)?;
    for line in content.lines().map(str::trim) {
        if line == "Status: Started" {
            return Ok(true);
        }
        if line.starts_with("Error:") {
            return Err(NovaError::Os(line.to_string()));
        }
    }
    Ok(false)
}

/// A proxy may not listen on an address this member already forwards.
pub fn validate_listen_address_conflicts(state: &DaemonState, listen: &IpAddr) -> Result<()> {
    state.cluster.transaction(|tx| {
        let node_id = tx.node_id();
        for network in tx.networks() {
            let forwards = tx.network_forwards(&ForwardFilter {
                network_id: Some(network.id),
                listen_address: None,
            });
            for forward in forwards.iter().filter(|f| f.node_id == Some(node_id)) {
                if IpAddr::from_str(&forward.listen_address).ok() == Some(*listen) {
                    return Err(NovaError::Conflict(format!(
                        "Listen address {:?} conflicts with existing network forward",
                        forward.listen_address
                    )));
                }
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_port_lists_and_ranges() {
        let addr = parse_proxy_address("tcp:1.2.3.4:80-82,90").unwrap();
        assert_eq!(addr.conn_type, "tcp");
        assert_eq!(addr.address, "1.2.3.4");
        assert_eq!(addr.ports, vec![80, 81, 82, 90]);
        assert!(!addr.abstract_socket);
    }

    #[test]
    fn parses_bracketed_ipv6() {
        let addr = parse_proxy_address("udp:[::1]:53").unwrap();
        assert_eq!(addr.address, "::1");
        assert_eq!(addr.ports, vec![53]);
    }

    #[test]
    fn unix_sockets_have_no_ports() {
        let path = parse_proxy_address("unix:/run/app.sock").unwrap();
        assert_eq!(path.address, "/run/app.sock");
        assert!(path.ports.is_empty());

        let abstract_socket = parse_proxy_address("unix:@app").unwrap();
        assert!(abstract_socket.abstract_socket);
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(parse_proxy_address("sctp:1.2.3.4:80").is_err());
        assert!(parse_proxy_address("tcp:1.2.3.4").is_err());
        assert!(parse_proxy_address("tcp:1.2.3.4:90-80").is_err());
        assert!(parse_proxy_address("tcp:not-an-ip:80").is_err());
    }

    #[test]
    fn forkproxy_argument_order() {
        let info = ProxyProcInfo {
            listen_pid: "1".into(),
            listen_pid_fd: "-1".into(),
            listen_addr: "tcp:0.0.0.0:80".into(),
            connect_pid: "2".into(),
            connect_pid_fd: "-1".into(),
            connect_addr: "tcp:127.0.0.1:8080".into(),
            listen_addr_gid: String::new(),
            listen_addr_uid: String::new(),
            listen_addr_mode: "0644".into(),
            security_gid: String::new(),
            security_uid: String::new(),
            proxy_protocol: String::new(),
        };
        let args = info.args();
        assert_eq!(args.len(), 14);
        assert_eq!(&args[..3], &["forkproxy", "--", "1"]);
        assert_eq!(args[7], "tcp:127.0.0.1:8080");
        assert_eq!(args[10], "0644");
    }

    #[test]
    fn start_marker_detection() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("proxy.web.log");

        fs::write(&log, "Status: Starting\n").unwrap();
        assert!(!check_proc_started(&log).unwrap());

        fs::write(&log, "Status: Starting\nStatus: Started\n").unwrap();
        assert!(check_proc_started(&log).unwrap());

        fs::write(&log, "Error: bind failed\n").unwrap();
        assert!(check_proc_started(&log).is_err());
    }
}
