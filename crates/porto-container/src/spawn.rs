//! Init process spawning.
//!
//! Namespace plumbing (pivot_root, bind mounts, hostname, clone flags)
//! belongs to the spawning backend behind [`Spawner`]; the daemon only
//! needs a pid back plus liveness and reaping. [`ProcessSpawner`] is the
//! in-tree backend: it launches the init command as a plain child
//! process and honors the parts of the spec a process can carry without
//! entering new namespaces. [`MockSpawner`] backs tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use nix::sys::signal::Signal;
use nix::unistd::Pid;
use porto_error::{PortoError, Result};
use porto_value::{BindSpec, Rlimit};

/// Everything the backend needs to start a container's init process.
#[derive(Debug, Clone, Default)]
pub struct SpawnSpec {
    pub command: String,
    pub cwd: PathBuf,
    pub env: Vec<String>,
    pub uid: u32,
    pub gid: u32,
    pub root: PathBuf,
    pub hostname: Option<String>,
    pub isolate: bool,
    pub binds: Vec<BindSpec>,
    pub rlimits: std::collections::BTreeMap<String, Rlimit>,
    pub stdin_path: Option<PathBuf>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
}

/// Backend that turns a [`SpawnSpec`] into a live init process.
pub trait Spawner: Send + Sync {
    /// Starts the init process and returns its pid.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be started.
    fn spawn(&self, spec: &SpawnSpec) -> Result<u32>;

    /// Returns whether the process is still alive.
    fn alive(&self, pid: u32) -> bool;

    /// Delivers a signal to the process.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    fn kill(&self, pid: u32, signal: Signal) -> Result<()>;

    /// Collects the exit status if the process has exited.
    ///
    /// Returns `None` while the process is still running.
    fn try_reap(&self, pid: u32) -> Option<i32>;
}

/// Plain-process spawning backend.
///
/// Children are retained for reaping; the daemon polls
/// [`Spawner::try_reap`] from its reaper loop.
#[derive(Default)]
pub struct ProcessSpawner {
    children: Mutex<HashMap<u32, std::process::Child>>,
}

impl ProcessSpawner {
    /// Creates the backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn stdio_from(path: Option<&PathBuf>, write: bool) -> Result<Stdio> {
        match path {
            None => Ok(Stdio::null()),
            Some(path) => {
                let file = if write {
                    std::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(path)
                } else {
                    std::fs::File::open(path)
                }
                .map_err(|e| {
                    PortoError::invalid_value(format!("can't open {}: {e}", path.display()))
                })?;
                Ok(Stdio::from(file))
            }
        }
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> Result<u32> {
        if spec.command.is_empty() {
            return Err(PortoError::invalid_value("container command is not set"));
        }

        let mut cmd = std::process::Command::new("/bin/sh");
        cmd.arg("-c").arg(&spec.command);
        cmd.current_dir(&spec.cwd);
        cmd.env_clear();
        for entry in &spec.env {
            if let Some((key, value)) = entry.split_once('=') {
                cmd.env(key, value);
            }
        }
        cmd.stdin(Self::stdio_from(spec.stdin_path.as_ref(), false)?);
        cmd.stdout(Self::stdio_from(spec.stdout_path.as_ref(), true)?);
        cmd.stderr(Self::stdio_from(spec.stderr_path.as_ref(), true)?);

        {
            use std::os::unix::process::CommandExt;
            if spec.uid != 0 || spec.gid != 0 {
                cmd.uid(spec.uid);
                cmd.gid(spec.gid);
            }
            cmd.process_group(0);
        }

        let child = cmd
            .spawn()
            .map_err(|e| PortoError::unknown(format!("can't spawn init process: {e}")))?;
        let pid = child.id();

        if let Ok(mut children) = self.children.lock() {
            children.insert(pid, child);
        }
        Ok(pid)
    }

    fn alive(&self, pid: u32) -> bool {
        if let Ok(mut children) = self.children.lock() {
            if let Some(child) = children.get_mut(&pid) {
                return matches!(child.try_wait(), Ok(None));
            }
        }
        // Fall back to a liveness probe for reattached processes.
        nix::sys::signal::kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    fn kill(&self, pid: u32, signal: Signal) -> Result<()> {
        nix::sys::signal::kill(Pid::from_raw(pid as i32), signal)
            .map_err(|e| PortoError::unknown(format!("can't signal pid {pid}: {e}")))
    }

    fn try_reap(&self, pid: u32) -> Option<i32> {
        let mut children = self.children.lock().ok()?;
        let child = children.get_mut(&pid)?;
        match child.try_wait() {
            Ok(Some(status)) => {
                children.remove(&pid);
                use std::os::unix::process::ExitStatusExt;
                Some(status.into_raw())
            }
            _ => None,
        }
    }
}

/// Scripted backend for tests: processes "run" until told to exit.
#[derive(Default)]
pub struct MockSpawner {
    inner: Mutex<MockInner>,
}

#[derive(Default)]
struct MockInner {
    next_pid: u32,
    /// pid -> exit status once "exited".
    procs: HashMap<u32, Option<i32>>,
    spawned: Vec<SpawnSpec>,
}

impl MockSpawner {
    /// Creates the mock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MockInner {
                next_pid: 1000,
                ..Default::default()
            }),
        }
    }

    /// Marks a pid as exited with the given raw wait status.
    pub fn exit(&self, pid: u32, status: i32) {
        if let Ok(mut inner) = self.inner.lock() {
            if let Some(slot) = inner.procs.get_mut(&pid) {
                *slot = Some(status);
            }
        }
    }

    /// Returns the specs passed to [`Spawner::spawn`] so far.
    #[must_use]
    pub fn spawned(&self) -> Vec<SpawnSpec> {
        self.inner.lock().map(|i| i.spawned.clone()).unwrap_or_default()
    }
}

impl Spawner for MockSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> Result<u32> {
        if spec.command.is_empty() {
            return Err(PortoError::invalid_value("container command is not set"));
        }
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| PortoError::unknown("mock spawner poisoned"))?;
        inner.next_pid += 1;
        let pid = inner.next_pid;
        inner.procs.insert(pid, None);
        inner.spawned.push(spec.clone());
        Ok(pid)
    }

    fn alive(&self, pid: u32) -> bool {
        self.inner
            .lock()
            .map(|i| matches!(i.procs.get(&pid), Some(None)))
            .unwrap_or(false)
    }

    fn kill(&self, pid: u32, signal: Signal) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| PortoError::unknown("mock spawner poisoned"))?;
        match inner.procs.get_mut(&pid) {
            Some(slot @ None) => {
                // Mock processes die to any signal.
                *slot = Some(128 + signal as i32);
                Ok(())
            }
            Some(Some(_)) | None => Err(PortoError::unknown(format!("no such process: {pid}"))),
        }
    }

    fn try_reap(&self, pid: u32) -> Option<i32> {
        self.inner.lock().ok()?.procs.get(&pid).copied().flatten()
    }
}
