//! The container entity.
//!
//! A container is a named bundle of kernel-resource handles plus its
//! property store and lifecycle state. Orchestration (cascades, parent
//! checks, persistence) lives in the holder; this type carries the
//! mechanical steps that touch the kernel.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use porto_cgroup::{Cgroup, CgroupRegistry, SubsystemKind};
use porto_error::{PortoError, Result};
use porto_net::{container_handle, root_handle, Network, TcClass};
use porto_value::VariantSet;

use crate::cred::Cred;
use crate::name;
use crate::spawn::{SpawnSpec, Spawner};
use crate::state::ContainerState;
use crate::ROOT_NAME;

/// Resolved property values needed to start a container.
///
/// Built by the holder from effective (parent-resolved) property values
/// before any kernel resource is touched.
#[derive(Debug, Clone, Default)]
pub struct StartConfig {
    pub spec: SpawnSpec,
    pub memory_limit: u64,
    pub memory_guarantee: u64,
    pub cpu_shares: u64,
    pub devices: Vec<String>,
    pub net_priority: u32,
    pub net_guarantee: u64,
    pub net_limit: u64,
}

/// A named container.
pub struct Container {
    pub(crate) name: String,
    pub(crate) creds: Cred,
    pub(crate) state: ContainerState,
    /// Stable id; the minor of the container's tc class handle.
    pub(crate) id: u16,
    /// Owning connection of a weak container.
    pub(crate) client_id: Option<u64>,
    pub(crate) variants: VariantSet,
    pub(crate) root_pid: Option<u32>,
    pub(crate) exit_status: Option<i32>,
    pub(crate) oom_killed: bool,
    pub(crate) respawn_count: u64,
    /// Diagnostic from the last failed start or restore.
    pub(crate) last_error: Option<String>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) died_at: Option<DateTime<Utc>>,
    pub(crate) cgroups: HashMap<SubsystemKind, Cgroup>,
    pub(crate) tclass: Option<TcClass>,
}

impl Container {
    pub(crate) fn new(name: String, creds: Cred, id: u16) -> Self {
        Self {
            name,
            creds,
            state: ContainerState::Stopped,
            id,
            client_id: None,
            variants: VariantSet::new(),
            root_pid: None,
            exit_status: None,
            oom_killed: false,
            respawn_count: 0,
            last_error: None,
            started_at: None,
            died_at: None,
            cgroups: HashMap::new(),
            tclass: None,
        }
    }

    /// The implicit root container: always running, owned by root.
    pub(crate) fn new_root() -> Self {
        let mut root = Self::new(ROOT_NAME.to_string(), Cred::root(), 1);
        root.state = ContainerState::Running;
        root
    }

    /// Container name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent name; `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            Some(name::parent_name(&self.name))
        }
    }

    /// Whether this is the implicit root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.name == ROOT_NAME
    }

    /// Current lifecycle state.
    #[must_use]
    pub const fn state(&self) -> ContainerState {
        self.state
    }

    /// Creator credentials.
    #[must_use]
    pub const fn creds(&self) -> Cred {
        self.creds
    }

    /// Stable container id.
    #[must_use]
    pub const fn id(&self) -> u16 {
        self.id
    }

    /// Pid of the init process while one is alive.
    #[must_use]
    pub const fn root_pid(&self) -> Option<u32> {
        self.root_pid
    }

    /// Raw wait status of the exited init process.
    #[must_use]
    pub const fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// Explicitly set property values.
    #[must_use]
    pub const fn variants(&self) -> &VariantSet {
        &self.variants
    }

    /// Verifies the caller may mutate this container.
    ///
    /// The creator and root may; everyone else gets `Permission`.
    ///
    /// # Errors
    ///
    /// Returns `Permission` for any other caller.
    pub fn check_permission(&self, cred: Cred) -> Result<()> {
        if cred.is_root() || cred.uid == self.creds.uid {
            Ok(())
        } else {
            Err(PortoError::permission(format!(
                "container {} belongs to {}",
                self.name, self.creds
            )))
        }
    }

    /// Handle of a materialized cgroup.
    #[must_use]
    pub fn cgroup(&self, kind: SubsystemKind) -> Option<&Cgroup> {
        self.cgroups.get(&kind)
    }

    /// Creates cgroup nodes in every available subsystem, parents first.
    ///
    /// The memory cgroup gets hierarchical accounting, the net_cls
    /// cgroup gets this container's class id. On failure the nodes
    /// created so far are removed in reverse order.
    ///
    /// # Errors
    ///
    /// Returns the first kernel refusal.
    pub(crate) fn materialize_cgroups(&mut self, registry: &CgroupRegistry) -> Result<()> {
        let rel = name::cgroup_path(&self.name);
        let mut created: Vec<Cgroup> = Vec::new();

        let result = (|| -> Result<()> {
            for kind in registry.available() {
                let cg = registry.cgroup(kind, &rel)?;
                cg.create()?;
                created.push(cg.clone());

                match kind {
                    SubsystemKind::Memory => porto_cgroup::memory_use_hierarchy(&cg)?,
                    SubsystemKind::NetCls => {
                        cg.set_knob("net_cls.classid", &self.class_handle().to_string())?;
                    }
                    _ => {}
                }
                self.cgroups.insert(kind, cg);
            }
            Ok(())
        })();

        if result.is_err() {
            for cg in created.iter().rev() {
                if let Err(e) = std::fs::remove_dir(cg.path()) {
                    tracing::warn!(path = %cg.path().display(), "start unwind: {e}");
                }
            }
            self.cgroups.clear();
        }
        result
    }

    /// Writes resolved resource limits into the fresh cgroups.
    ///
    /// # Errors
    ///
    /// Returns the first knob refusal.
    pub(crate) fn apply_limits(&self, cfg: &StartConfig) -> Result<()> {
        if let Some(cg) = self.cgroup(SubsystemKind::Memory) {
            if cfg.memory_limit > 0 {
                cg.set_knob("memory.limit_in_bytes", &cfg.memory_limit.to_string())?;
            }
            if cfg.memory_guarantee > 0 {
                cg.set_knob(
                    "memory.soft_limit_in_bytes",
                    &cfg.memory_guarantee.to_string(),
                )?;
            }
        }
        if let Some(cg) = self.cgroup(SubsystemKind::Cpu) {
            cg.set_knob("cpu.shares", &cfg.cpu_shares.to_string())?;
        }
        if let Some(cg) = self.cgroup(SubsystemKind::Devices) {
            for rule in &cfg.devices {
                cg.set_knob("devices.allow", rule)?;
            }
        }
        Ok(())
    }

    /// Handle of this container's tc class.
    #[must_use]
    pub fn class_handle(&self) -> u32 {
        container_handle(self.id)
    }

    /// Creates or updates the container's htb class.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses the class.
    pub(crate) fn create_tclass(
        &mut self,
        net: &Network,
        prio: u32,
        rate: u64,
        ceil: u64,
    ) -> Result<()> {
        let class = TcClass::new(root_handle(), self.class_handle());
        class.create(net, prio, rate, ceil)?;
        self.tclass = Some(class);
        Ok(())
    }

    /// Spawns the init process and attaches it to every cgroup.
    ///
    /// # Errors
    ///
    /// Returns an error from the spawner or the first failed attach.
    pub(crate) fn spawn_init(&mut self, spawner: &dyn Spawner, spec: &SpawnSpec) -> Result<()> {
        let pid = spawner.spawn(spec)?;

        for cg in self.cgroups.values() {
            if let Err(e) = cg.attach(pid) {
                let _ = spawner.kill(pid, nix::sys::signal::Signal::SIGKILL);
                return Err(e);
            }
        }

        self.root_pid = Some(pid);
        self.started_at = Some(Utc::now());
        self.exit_status = None;
        self.oom_killed = false;
        self.died_at = None;
        Ok(())
    }

    /// Tears down cgroup nodes and the tc class, best effort for the
    /// unwind path and strict when `strict` is set.
    ///
    /// # Errors
    ///
    /// In strict mode, returns the first removal failure.
    pub(crate) async fn remove_resources(&mut self, net: &Network, strict: bool) -> Result<()> {
        if let Some(class) = self.tclass.take() {
            match class.remove(net) {
                Ok(()) => {}
                Err(e) if strict => return Err(e),
                Err(e) => tracing::warn!(container = %self.name, "can't remove tc class: {e}"),
            }
        }

        // Reverse of creation order so children of shared hierarchies
        // (freezer) unwind cleanly.
        let kinds: Vec<SubsystemKind> = self.cgroups.keys().copied().collect();
        for kind in SubsystemKind::ALL.iter().rev() {
            if !kinds.contains(kind) {
                continue;
            }
            if let Some(cg) = self.cgroups.remove(kind) {
                match cg.remove().await {
                    Ok(()) => {}
                    Err(e) if strict => {
                        self.cgroups.insert(*kind, cg);
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::warn!(container = %self.name, %kind, "can't remove cgroup: {e}");
                    }
                }
            }
        }
        self.cgroups.clear();
        Ok(())
    }

    /// Reattaches handles to live kernel objects after a daemon restart.
    pub(crate) fn reattach_resources(&mut self, registry: &CgroupRegistry, net: &Network) {
        let rel = name::cgroup_path(&self.name);
        for kind in registry.available() {
            if let Ok(cg) = registry.cgroup(kind, &rel) {
                if cg.exists() {
                    self.cgroups.insert(kind, cg);
                }
            }
        }
        if net.enabled() {
            self.tclass = Some(TcClass::new(root_handle(), self.class_handle()));
        }
    }
}
