//! # porto-cgroup
//!
//! Binding from container hierarchy to cgroupfs.
//!
//! Each v1 subsystem is discovered once from `/proc/self/mountinfo` at
//! daemon start; container cgroups live under a daemon-owned root
//! directory inside every subsystem mount, mirroring the container tree.
//! The freezer module implements the write-then-poll state protocol.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod freezer;
mod registry;

pub use freezer::{freeze, thaw, FREEZER_WAIT_TIMEOUT};
pub use registry::{CgroupRegistry, SubsystemKind};

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use porto_error::{EError, PortoError, Result};

/// How long cgroup removal keeps retrying a busy directory.
const REMOVE_TIMEOUT: Duration = Duration::from_secs(5);
/// Backoff between removal retries.
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// One cgroup directory inside a single subsystem mount.
///
/// The handle stores the absolute path; ownership of the kernel object
/// belongs to the container that created it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cgroup {
    kind: SubsystemKind,
    path: PathBuf,
}

impl Cgroup {
    pub(crate) const fn new(kind: SubsystemKind, path: PathBuf) -> Self {
        Self { kind, path }
    }

    /// Subsystem this cgroup belongs to.
    #[must_use]
    pub const fn kind(&self) -> SubsystemKind {
        self.kind
    }

    /// Absolute cgroupfs path.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Returns whether the directory exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Creates the directory, parents first. Creating an existing cgroup
    /// is a success.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses the mkdir.
    pub fn create(&self) -> Result<()> {
        if self.exists() {
            return Ok(());
        }
        tracing::debug!(path = %self.path.display(), "create cgroup");
        fs::create_dir_all(&self.path)
            .map_err(|e| PortoError::unknown(format!("can't create cgroup {}: {e}", self.path.display())))
    }

    /// Removes the directory.
    ///
    /// The kernel refuses to remove a cgroup with live tasks; anything
    /// still alive here is killed with SIGKILL and the rmdir is retried
    /// with a bounded backoff.
    ///
    /// # Errors
    ///
    /// Returns `Busy` if tasks survive past the retry budget.
    pub async fn remove(&self) -> Result<()> {
        if !self.exists() {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + REMOVE_TIMEOUT;
        loop {
            if let Err(e) = self.kill_all(nix::sys::signal::Signal::SIGKILL) {
                tracing::warn!(path = %self.path.display(), "can't kill cgroup tasks: {e}");
            }

            if self.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(PortoError::busy(format!(
                    "can't empty cgroup {}",
                    self.path.display()
                )));
            }
            tokio::time::sleep(REMOVE_RETRY_DELAY).await;
        }

        tracing::debug!(path = %self.path.display(), "remove cgroup");
        let deadline = tokio::time::Instant::now() + REMOVE_TIMEOUT;
        loop {
            match fs::remove_dir(&self.path) {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
                Err(e) if e.raw_os_error() == Some(nix::libc::EBUSY) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(PortoError::busy(format!(
                            "cgroup {} stays busy: {e}",
                            self.path.display()
                        )));
                    }
                    tokio::time::sleep(REMOVE_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(PortoError::unknown(format!(
                        "can't remove cgroup {}: {e}",
                        self.path.display()
                    )))
                }
            }
        }
    }

    /// Moves a process into this cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel rejects the attach.
    pub fn attach(&self, pid: u32) -> Result<()> {
        self.append_knob("cgroup.procs", &pid.to_string())
    }

    /// Reads a knob file as a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the knob cannot be read.
    pub fn knob(&self, name: &str) -> Result<String> {
        fs::read_to_string(self.path.join(name)).map_err(|e| {
            PortoError::unknown(format!(
                "can't read {}/{name}: {e}",
                self.path.display()
            ))
        })
    }

    /// Writes a knob file, replacing its contents.
    ///
    /// Reading the knob back may legitimately differ from what was
    /// written (the freezer reports transitional states), so no readback
    /// verification happens here.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses the value.
    pub fn set_knob(&self, name: &str, value: &str) -> Result<()> {
        fs::write(self.path.join(name), value).map_err(|e| {
            PortoError::new(
                EError::InvalidValue,
                format!("can't set {}/{name} to {value}: {e}", self.path.display()),
            )
        })
    }

    /// Returns whether a knob file exists in this cgroup.
    #[must_use]
    pub fn has_knob(&self, name: &str) -> bool {
        self.path.join(name).exists()
    }

    fn append_knob(&self, name: &str, value: &str) -> Result<()> {
        let path = self.path.join(name);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| PortoError::unknown(format!("can't open {}: {e}", path.display())))?;
        file.write_all(value.as_bytes())
            .map_err(|e| PortoError::unknown(format!("can't append to {}: {e}", path.display())))
    }

    /// Lists tasks currently in the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the tasks knob cannot be read.
    pub fn tasks(&self) -> Result<Vec<u32>> {
        let raw = self.knob("tasks")?;
        Ok(raw.lines().filter_map(|l| l.trim().parse().ok()).collect())
    }

    /// Returns whether the cgroup has no tasks left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks().map(|t| t.is_empty()).unwrap_or(true)
    }

    /// Delivers a signal to every task in the cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error if the task list cannot be read; individual kill
    /// failures (raced exits) are logged and skipped.
    pub fn kill_all(&self, signal: nix::sys::signal::Signal) -> Result<()> {
        for pid in self.tasks()? {
            let pid = nix::unistd::Pid::from_raw(pid as i32);
            if let Err(e) = nix::sys::signal::kill(pid, signal) {
                if e != nix::errno::Errno::ESRCH {
                    tracing::warn!(%pid, "can't signal cgroup task: {e}");
                }
            }
        }
        Ok(())
    }
}

/// Memory usage in bytes, from `memory.usage_in_bytes`.
///
/// # Errors
///
/// Returns an error if the knob is missing or malformed.
pub fn memory_usage(cg: &Cgroup) -> Result<u64> {
    parse_knob_u64(cg, "memory.usage_in_bytes")
}

/// Enables hierarchical accounting on a freshly created memory cgroup.
///
/// # Errors
///
/// Returns an error if the kernel refuses the knob.
pub fn memory_use_hierarchy(cg: &Cgroup) -> Result<()> {
    cg.set_knob("memory.use_hierarchy", "1")
}

/// Cumulative cpu usage in nanoseconds, from `cpuacct.usage`.
///
/// # Errors
///
/// Returns an error if the knob is missing or malformed.
pub fn cpuacct_usage(cg: &Cgroup) -> Result<u64> {
    parse_knob_u64(cg, "cpuacct.usage")
}

fn parse_knob_u64(cg: &Cgroup, knob: &str) -> Result<u64> {
    let raw = cg.knob(knob)?;
    raw.trim()
        .parse()
        .map_err(|e| PortoError::unknown(format!("bad {knob} value {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cgroup(dir: &TempDir, rel: &str) -> Cgroup {
        Cgroup::new(SubsystemKind::Memory, dir.path().join(rel))
    }

    #[test]
    fn create_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let cg = cgroup(&dir, "porto/a");
        cg.create().unwrap();
        assert!(cg.exists());
        cg.create().unwrap();
    }

    #[test]
    fn knob_round_trip() {
        let dir = TempDir::new().unwrap();
        let cg = cgroup(&dir, "porto/a");
        cg.create().unwrap();

        cg.set_knob("memory.limit_in_bytes", "1048576").unwrap();
        assert_eq!(cg.knob("memory.limit_in_bytes").unwrap(), "1048576");
        assert!(cg.has_knob("memory.limit_in_bytes"));
        assert!(!cg.has_knob("memory.nonexistent"));
    }

    #[test]
    fn usage_parses_trailing_newline() {
        let dir = TempDir::new().unwrap();
        let cg = cgroup(&dir, "porto/a");
        cg.create().unwrap();
        cg.set_knob("memory.usage_in_bytes", "4096\n").unwrap();
        assert_eq!(memory_usage(&cg).unwrap(), 4096);
    }

    #[tokio::test]
    async fn remove_empty_cgroup() {
        let dir = TempDir::new().unwrap();
        let cg = cgroup(&dir, "porto/a");
        cg.create().unwrap();
        cg.set_knob("tasks", "").unwrap();
        // The tasks knob is a plain file here; drop it so rmdir succeeds
        // the way it does for an empty kernel cgroup.
        std::fs::remove_file(cg.path().join("tasks")).unwrap();

        cg.remove().await.unwrap();
        assert!(!cg.exists());
        // Removing an absent cgroup is a success.
        cg.remove().await.unwrap();
    }

    #[test]
    fn empty_without_tasks_knob() {
        let dir = TempDir::new().unwrap();
        let cg = cgroup(&dir, "porto/a");
        cg.create().unwrap();
        assert!(cg.is_empty());
    }
}
