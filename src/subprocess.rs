//! Helper process supervision.
//!
//! Spawned helpers (dnsmasq, forkproxy) are tracked through JSON PID files so
//! a restarted daemon can still find and stop them.

use crate::{NovaError, Result, log_debug, log_error, log_warn};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub log_file: Option<PathBuf>,
    /// Confine through `aa-exec` when set.
    pub apparmor_profile: Option<String>,
}

pub trait Supervisor: Send + Sync {
    /// Resolve `program` on PATH.
    fn lookup(&self, program: &str) -> Option<PathBuf>;
    /// Run to completion and return stdout (stderr appended).
    fn output(&self, program: &Path, args: &[&str]) -> Result<String>;
    fn spawn(&self, spec: &ProcessSpec) -> Result<u32>;
    fn is_alive(&self, pid: u32) -> bool;
    fn signal(&self, pid: u32, signal: Signal) -> Result<()>;
}

/// A running helper as recorded on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Process {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub pid: u32,
}

impl Process {
    pub fn start(supervisor: &dyn Supervisor, spec: &ProcessSpec) -> Result<Self> {
        let pid = supervisor.spawn(spec)?;
        log_debug!("Started {} with PID {}", spec.name, pid);
        Ok(Self {
            name: spec.name.clone(),
            program: spec.program.clone(),
            args: spec.args.clone(),
            pid,
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn stop(&self, supervisor: &dyn Supervisor) -> Result<()> {
        if !supervisor.is_alive(self.pid) {
            return Ok(());
        }
        supervisor.signal(self.pid, Signal::SIGKILL)
    }

    pub fn reload(&self, supervisor: &dyn Supervisor) -> Result<()> {
        supervisor.signal(self.pid, Signal::SIGHUP)
    }
}

/// Stop whatever `path` records and remove the file. A missing file is fine.
pub fn stop_from_pid_file(supervisor: &dyn Supervisor, path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }

    match Process::load(path) {
        Ok(process) => {
            log_debug!("Stopping {} (PID {})", process.name, process.pid);
            process.stop(supervisor)?;
        }
        Err(e) => log_warn!("Ignoring unreadable PID file {}: {}", path.display(), e),
    }

    fs::remove_file(path)?;
    Ok(())
}

pub struct SystemSupervisor;

impl SystemSupervisor {
    pub fn new() -> Self {
        SystemSupervisor
    }
}

impl Default for SystemSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor for SystemSupervisor {
    fn lookup(&self, program: &str) -> Option<PathBuf> {
        let output = Command::new("which").arg(program).output().ok()?;
        if !output.status.success() {
            return None;
        }
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if path.is_empty() {
            None
        } else {
            Some(PathBuf::from(path))
        }
    }

    fn output(&self, program: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new(program).args(args).output().map_err(|e| {
            NovaError::SystemCommandFailed(format!("{}: {}", program.display(), e))
        })?;

        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            return Err(NovaError::SystemCommandFailed(format!(
                "{}: {}",
                program.display(),
                text.trim()
            )));
        }
        Ok(text)
    }

    fn spawn(&self, spec: &ProcessSpec) -> Result<u32> {
        let mut cmd = match &spec.apparmor_profile {
            Some(profile) => {
                let mut cmd = Command::new("aa-exec");
                cmd.args(["-p", profile.as_str(), "--"]).arg(&spec.program);
                cmd
            }
            None => Command::new(&spec.program),
        };
        cmd.args(&spec.args).stdin(Stdio::null());

        match &spec.log_file {
            Some(path) => {
                let log = File::create(path)?;
                cmd.stdout(log.try_clone()?).stderr(log);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            log_error!("Failed to start {}: {}", spec.name, e);
            NovaError::SystemCommandFailed(format!("{}: {}", spec.program.display(), e))
        })?;

        let pid = child.id();

        // Exited helpers must be reaped or kill(pid, 0) keeps succeeding.
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        Ok(pid)
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        signal::kill(Pid::from_raw(raw), None).is_ok()
    }

    fn signal(&self, pid: u32, sig: Signal) -> Result<()> {
        let raw = i32::try_from(pid)
            .map_err(|_| NovaError::Os(format!("Invalid PID {}", pid)))?;
        match signal::kill(Pid::from_raw(raw), sig) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(NovaError::Os(format!("Failed to signal PID {}: {}", pid, e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pid_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dnsmasq.pid");
        let process = Process {
            name: "dnsmasq".into(),
            program: PathBuf::from("/usr/sbin/dnsmasq"),
            args: vec!["--keep-in-foreground".into()],
            pid: 4242,
        };
        process.save(&path).unwrap();
        assert_eq!(Process::load(&path).unwrap(), process);
    }

    #[test]
    fn missing_pid_file_is_not_an_error() {
        let dir = tempdir().unwrap();
        let supervisor = SystemSupervisor::new();
        assert!(stop_from_pid_file(&supervisor, &dir.path().join("absent.pid")).is_ok());
    }

    #[test]
    fn garbage_pid_file_is_removed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dnsmasq.pid");
        fs::write(&path, "not json").unwrap();
        stop_from_pid_file(&SystemSupervisor::new(), &path).unwrap();
        assert!(!path.exists());
    }
}
