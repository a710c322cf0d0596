//! AppArmor confinement for per-network dnsmasq processes.

use crate::dnsmasq::NetworkDir;
use crate::{NovaError, Result, log_debug, log_error, log_warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

pub struct AppArmor {
    enabled: bool,
    profiles_dir: PathBuf,
}

impl AppArmor {
    /// Enabled when the kernel exposes AppArmor and `apparmor_parser` runs.
    pub fn detect(var_dir: &Path) -> Self {
        let kernel = Path::new("/sys/kernel/security/apparmor").exists();
        let parser = Command::new("apparmor_parser")
            .arg("--version")
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);

        if kernel && !parser {
            log_warn!("AppArmor is enabled in the kernel but apparmor_parser is missing");
        }

        Self {
            enabled: kernel && parser,
            profiles_dir: var_dir.join("security").join("apparmor").join("profiles"),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            profiles_dir: PathBuf::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn profile_name(network: &str) -> String {
        format!("nova_dnsmasq-{}", network)
    }

    fn profile_path(&self, network: &str) -> PathBuf {
        self.profiles_dir.join(Self::profile_name(network))
    }

    fn parser(&self, args: &[&str]) -> Result<()> {
        let output = Command::new("apparmor_parser").args(args).output().map_err(|e| {
            NovaError::SystemCommandFailed(format!("apparmor_parser: {}", e))
        })?;
        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr).trim().to_string();
            log_error!("apparmor_parser {} failed: {}", args.join(" "), error);
            return Err(NovaError::SystemCommandFailed(format!("apparmor_parser: {}", error)));
        }
        Ok(())
    }

    /// Write and load the dnsmasq profile for `network`.
    pub fn network_load(&self, network: &str, dir: &NetworkDir, log_file: &Path) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let path = self.profile_path(network);
        fs::create_dir_all(&self.profiles_dir)?;
        fs::write(&path, render_dnsmasq_profile(network, dir, log_file))?;

        let path = path.to_string_lossy().to_string();
        self.parser(&["--replace", "--write-cache", &path])?;
        log_debug!("Loaded AppArmor profile {}", Self::profile_name(network));
        Ok(())
    }

    pub fn network_unload(&self, network: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let path = self.profile_path(network);
        if !path.exists() {
            return Ok(());
        }
        let path = path.to_string_lossy().to_string();
        self.parser(&["--remove", &path])
    }

    pub fn network_delete(&self, network: &str) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let path = self.profile_path(network);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

pub fn render_dnsmasq_profile(network: &str, dir: &NetworkDir, log_file: &Path) -> String {
    let name = AppArmor::profile_name(network);
    let root = dir.root().display();
    format!(
        r#"#include <tunables/global>

profile "{name}" flags=(attach_disconnected,mediate_deleted) {{
  #include <abstractions/base>
  #include <abstractions/dbus>
  #include <abstractions/nameservice>

  capability chown,
  capability net_bind_service,
  capability setgid,
  capability setuid,
  capability dac_override,
  capability dac_read_search,
  capability net_admin,
  capability net_raw,

  network inet raw,
  network inet6 raw,

  /etc/dnsmasq.d/ r,
  /etc/dnsmasq.d/* r,
  /etc/localtime r,
  /usr/share/zoneinfo/** r,

  {root}/dnsmasq.hosts/ r,
  {root}/dnsmasq.hosts/* r,
  {root}/dnsmasq.leases rw,
  {root}/dnsmasq.raw r,
  {log} w,

  /{{,usr/}}{{,s}}bin/dnsmasq mr,
}}
"#,
        name = name,
        root = root,
        log = log_file.display()
    )
}
