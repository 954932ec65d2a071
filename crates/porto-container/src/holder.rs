//! The container holder: authoritative registry and lifecycle driver.
//!
//! The holder owns every container by name. Parent/child relations are
//! dotted names resolved against the map, cascades walk name prefixes,
//! and every state change is persisted to the key-value storage and
//! broadcast to waiters.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::Signal;
use porto_cgroup::{freezer, CgroupRegistry, SubsystemKind};
use porto_error::{EError, PortoError, Result};
use porto_kv::KvStorage;
use porto_net::Network;
use porto_value::{DYNAMIC_VALUE, PARENT_DEF_VALUE, PARENT_RO_VALUE, SUPERUSER_VALUE};
use tokio::sync::broadcast;

use crate::container::{Container, StartConfig};
use crate::cred::Cred;
use crate::data::data_set;
use crate::name::{self, escape_name};
use crate::property::{property_set, ApplyCtx};
use crate::spawn::{SpawnSpec, Spawner};
use crate::state::ContainerState;
use crate::{DEFAULT_STOP_TIMEOUT, ROOT_NAME};

/// Keys the holder persists besides client-visible properties.
const RAW_STATE: &str = "_state";
const RAW_ROOT_PID: &str = "_root_pid";
const RAW_UID: &str = "_uid";
const RAW_GID: &str = "_gid";
const RAW_ID: &str = "_id";
const RAW_EXIT_STATUS: &str = "_exit_status";
const RAW_RESPAWN_COUNT: &str = "_respawn_count";
const RAW_WEAK: &str = "_weak";

/// Poll cadence while waiting for an init process to die.
const STOP_POLL_DELAY: Duration = Duration::from_millis(100);
/// Budget for the freezer-assisted kill after the graceful timeout.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Ids 1 and 2 are the root container and the default tc class.
const FIRST_CONTAINER_ID: u16 = 3;

/// Broadcast on every container state change.
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub name: String,
    pub state: ContainerState,
}

/// The authoritative in-memory registry of containers.
pub struct ContainerHolder {
    containers: HashMap<String, Container>,
    registry: Arc<CgroupRegistry>,
    net: Arc<Network>,
    spawner: Arc<dyn Spawner>,
    kv: KvStorage,
    events: broadcast::Sender<StateEvent>,
    next_id: u16,
    stop_timeout: Duration,
}

impl ContainerHolder {
    /// Creates the holder with the implicit root container registered.
    #[must_use]
    pub fn new(
        registry: Arc<CgroupRegistry>,
        net: Arc<Network>,
        spawner: Arc<dyn Spawner>,
        kv: KvStorage,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let mut containers = HashMap::new();
        containers.insert(ROOT_NAME.to_string(), Container::new_root());

        Self {
            containers,
            registry,
            net,
            spawner,
            kv,
            events,
            next_id: FIRST_CONTAINER_ID,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Overrides the default graceful stop timeout.
    pub fn set_stop_timeout(&mut self, timeout: Duration) {
        self.stop_timeout = timeout;
    }

    /// Subscribes to state-change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Returns a container by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Container> {
        self.containers.get(name)
    }

    fn require(&self, name: &str) -> Result<&Container> {
        self.containers
            .get(name)
            .ok_or_else(|| PortoError::no_container(name))
    }

    fn require_mut(&mut self, name: &str) -> Result<&mut Container> {
        self.containers
            .get_mut(name)
            .ok_or_else(|| PortoError::no_container(name))
    }

    /// Lists container names, optionally filtered by a shell-style
    /// mask. The root is not listed.
    #[must_use]
    pub fn list(&self, mask: Option<&str>) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .keys()
            .filter(|n| n.as_str() != ROOT_NAME)
            .filter(|n| mask.map_or(true, |m| name::matches_mask(n, m)))
            .cloned()
            .collect();
        names.sort();
        names
    }

    fn descendants(&self, root: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .keys()
            .filter(|n| name::is_descendant(root, n))
            .cloned()
            .collect();
        // Deepest first, so cascades run post-order.
        names.sort_by_key(|n| std::cmp::Reverse(n.matches('.').count()));
        names
    }

    fn alloc_id(&mut self) -> Result<u16> {
        let used: HashSet<u16> = self.containers.values().map(Container::id).collect();
        let mut candidate = self.next_id.max(FIRST_CONTAINER_ID);
        for _ in 0..u16::MAX {
            if !used.contains(&candidate) {
                self.next_id = candidate.wrapping_add(1);
                return Ok(candidate);
            }
            candidate = candidate.wrapping_add(1);
            if candidate < FIRST_CONTAINER_ID {
                candidate = FIRST_CONTAINER_ID;
            }
        }
        Err(PortoError::new(
            EError::ResourceNotAvailable,
            "out of container ids",
        ))
    }

    fn append_kv(&mut self, name: &str, key: &str, value: &str) {
        if name == ROOT_NAME {
            return;
        }
        if let Err(e) = self.kv.append(&escape_name(name), key, value) {
            tracing::error!(container = name, key, "can't persist: {e}");
        }
    }

    fn set_state(&mut self, name: &str, state: ContainerState) {
        if let Some(container) = self.containers.get_mut(name) {
            if container.state == state {
                return;
            }
            tracing::info!(container = name, from = %container.state, to = %state, "state change");
            container.state = state;
        }
        self.append_kv(name, RAW_STATE, &state.to_string());
        let _ = self.events.send(StateEvent {
            name: name.to_string(),
            state,
        });
    }

    /// Creates a container in the Stopped state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for malformed names, `ContainerAlreadyExists`
    /// for duplicates and `ContainerDoesNotExist` for a missing parent.
    pub fn create(&mut self, name: &str, cred: Cred) -> Result<()> {
        name::validate_name(name)?;
        if self.containers.contains_key(name) {
            return Err(PortoError::container_exists(name));
        }
        let parent = name::parent_name(name);
        if !self.containers.contains_key(parent) {
            return Err(PortoError::no_container(parent));
        }

        let id = self.alloc_id()?;
        let node = escape_name(name);
        self.kv.create_node(&node)?;
        self.kv.append(&node, RAW_UID, &cred.uid.to_string())?;
        self.kv.append(&node, RAW_GID, &cred.gid.to_string())?;
        self.kv.append(&node, RAW_ID, &id.to_string())?;
        self.kv
            .append(&node, RAW_STATE, &ContainerState::Stopped.to_string())?;

        tracing::info!(container = name, %cred, id, "container created");
        self.containers
            .insert(name.to_string(), Container::new(name.to_string(), cred, id));
        Ok(())
    }

    /// Creates a weak container bound to an RPC connection.
    ///
    /// # Errors
    ///
    /// Same failures as [`Self::create`].
    pub fn create_weak(&mut self, name: &str, cred: Cred, client_id: u64) -> Result<()> {
        self.create(name, cred)?;
        if let Some(container) = self.containers.get_mut(name) {
            container.client_id = Some(client_id);
        }
        self.append_kv(name, RAW_WEAK, "true");
        Ok(())
    }

    /// Destroys all weak containers of a closed connection, best effort.
    pub async fn destroy_weak(&mut self, client_id: u64) {
        let doomed: Vec<String> = self
            .containers
            .values()
            .filter(|c| c.client_id == Some(client_id))
            .map(|c| c.name.clone())
            .collect();

        for name in doomed {
            tracing::info!(container = %name, client_id, "reaping weak container");
            if let Err(e) = self.destroy(&name).await {
                tracing::warn!(container = %name, "can't destroy weak container: {e}");
            }
        }
    }

    fn resolve_uid(raw: &str) -> Result<u32> {
        if let Ok(uid) = raw.parse() {
            return Ok(uid);
        }
        match nix::unistd::User::from_name(raw) {
            Ok(Some(user)) => Ok(user.uid.as_raw()),
            _ => Err(PortoError::invalid_value(format!("invalid user: {raw}"))),
        }
    }

    fn resolve_gid(raw: &str) -> Result<u32> {
        if let Ok(gid) = raw.parse() {
            return Ok(gid);
        }
        match nix::unistd::Group::from_name(raw) {
            Ok(Some(group)) => Ok(group.gid.as_raw()),
            _ => Err(PortoError::invalid_value(format!("invalid group: {raw}"))),
        }
    }

    fn resolve_start_config(&self, name: &str) -> Result<StartConfig> {
        let get = |prop: &str| self.get_property(name, prop);
        let parse_uint = |prop: &str| -> Result<u64> {
            let raw = get(prop)?;
            raw.trim()
                .parse()
                .map_err(|_| PortoError::invalid_value(format!("invalid {prop}: {raw}")))
        };

        let cpu_policy = get("cpu_policy")?;
        let cpu_priority = parse_uint("cpu_priority")?;
        // cpu.shares scales linearly with priority; idle containers get
        // the kernel minimum.
        let cpu_shares = if cpu_policy == "idle" {
            2
        } else {
            1024 + cpu_priority * 102
        };

        let spec = SpawnSpec {
            command: get("command")?,
            cwd: get("cwd")?.into(),
            env: porto_value::parse_list(&get("env")?),
            uid: Self::resolve_uid(&get("user")?)?,
            gid: Self::resolve_gid(&get("group")?)?,
            root: get("root")?.into(),
            hostname: Some(get("hostname")?).filter(|h| !h.is_empty()),
            isolate: porto_value::parse_bool(&get("isolate")?)?,
            binds: porto_value::spec::parse_binds(&get("bind")?)?,
            rlimits: porto_value::spec::parse_rlimits(&get("rlimit")?)?,
            stdin_path: Some(get("stdin_path")?).filter(|p| !p.is_empty()).map(Into::into),
            stdout_path: Some(get("stdout_path")?).filter(|p| !p.is_empty()).map(Into::into),
            stderr_path: Some(get("stderr_path")?).filter(|p| !p.is_empty()).map(Into::into),
        };

        Ok(StartConfig {
            spec,
            memory_limit: parse_uint("memory_limit")?,
            memory_guarantee: parse_uint("memory_guarantee")?,
            cpu_shares,
            devices: porto_value::parse_list(&get("devices")?),
            net_priority: u32::try_from(parse_uint("net_priority")?).unwrap_or(3),
            net_guarantee: parse_uint("net_guarantee")?,
            net_limit: parse_uint("net_limit")?,
        })
    }

    /// Starts a container.
    ///
    /// Kernel-side effects are applied in a fixed order (cgroups, memory,
    /// cpu, network class, devices, then the init spawn); any failure
    /// unwinds the resources created so far.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the container is Stopped and its
    /// parent is Running, or the typed error of the failed step.
    pub async fn start(&mut self, name: &str) -> Result<()> {
        let container = self.require(name)?;
        if container.is_root() {
            return Err(PortoError::invalid_state("can't start the root container"));
        }
        if container.state() != ContainerState::Stopped {
            return Err(PortoError::invalid_state(format!(
                "can't start container in state {}",
                container.state()
            )));
        }
        let parent = name::parent_name(name);
        if self.require(parent)?.state() != ContainerState::Running {
            return Err(PortoError::invalid_state(format!(
                "parent container {parent} is not running"
            )));
        }

        let cfg = self.resolve_start_config(name)?;
        self.set_state(name, ContainerState::Starting);

        let registry = Arc::clone(&self.registry);
        let net = Arc::clone(&self.net);
        let spawner = Arc::clone(&self.spawner);

        let result = (|| -> Result<()> {
            let container = self.require_mut(name)?;
            container.materialize_cgroups(&registry)?;
            container.apply_limits(&cfg)?;
            container.create_tclass(&net, cfg.net_priority, cfg.net_guarantee, cfg.net_limit)?;
            container.spawn_init(spawner.as_ref(), &cfg.spec)
        })();

        match result {
            Ok(()) => {
                let pid = self.require(name)?.root_pid().unwrap_or_default();
                self.append_kv(name, RAW_ROOT_PID, &pid.to_string());
                self.set_state(name, ContainerState::Running);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(container = name, "start failed: {e}");
                if let Ok(container) = self.require_mut(name) {
                    container.last_error = Some(e.to_string());
                    let _ = container.remove_resources(&net, false).await;
                }
                self.set_state(name, ContainerState::Stopped);
                Err(e)
            }
        }
    }

    /// Stops a container and, first, all of its descendants.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for an already-stopped container and
    /// `Unknown` when the init process survives even the freezer kill.
    pub async fn stop(&mut self, name: &str, timeout: Option<Duration>) -> Result<()> {
        let container = self.require(name)?;
        if container.is_root() {
            return Err(PortoError::invalid_state("can't stop the root container"));
        }
        if container.state() == ContainerState::Stopped {
            return Err(PortoError::invalid_state("container is already stopped"));
        }

        let timeout = timeout.unwrap_or(self.stop_timeout);
        for child in self.descendants(name) {
            if self.require(&child)?.state() != ContainerState::Stopped {
                self.stop_one(&child, timeout).await?;
            }
        }
        self.stop_one(name, timeout).await
    }

    async fn stop_one(&mut self, name: &str, timeout: Duration) -> Result<()> {
        let state = self.require(name)?.state();
        if state == ContainerState::Paused {
            let cg = self.require(name)?.cgroup(SubsystemKind::Freezer).cloned();
            if let Some(cg) = cg {
                freezer::thaw(&cg).await?;
            }
        }

        self.set_state(name, ContainerState::Stopping);

        let spawner = Arc::clone(&self.spawner);
        if let Some(pid) = self.require(name)?.root_pid() {
            if spawner.alive(pid) {
                let _ = spawner.kill(pid, Signal::SIGTERM);
            }

            let deadline = tokio::time::Instant::now() + timeout;
            while spawner.alive(pid) && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(STOP_POLL_DELAY).await;
            }

            if spawner.alive(pid) {
                self.kill_frozen(name).await?;
            }
            let _ = spawner.try_reap(pid);
        }

        let net = Arc::clone(&self.net);
        let container = self.require_mut(name)?;
        container.root_pid = None;
        container.exit_status = None;
        if let Err(e) = container.remove_resources(&net, false).await {
            tracing::warn!(container = name, "stop cleanup: {e}");
        }
        self.append_kv(name, RAW_ROOT_PID, "");
        self.set_state(name, ContainerState::Stopped);
        Ok(())
    }

    /// Freezes the cgroup to stop fork bombs, SIGKILLs every task,
    /// thaws and waits for the cgroup to drain.
    async fn kill_frozen(&mut self, name: &str) -> Result<()> {
        let Some(cg) = self
            .require(name)?
            .cgroup(SubsystemKind::Freezer)
            .cloned()
        else {
            return Err(PortoError::unknown(format!(
                "container {name} survived SIGTERM and has no freezer"
            )));
        };

        tracing::warn!(container = name, "graceful stop timed out, killing");
        freezer::freeze(&cg).await?;
        cg.kill_all(Signal::SIGKILL)?;
        freezer::thaw(&cg).await?;

        let deadline = tokio::time::Instant::now() + KILL_TIMEOUT;
        while !cg.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                return Err(PortoError::unknown(format!(
                    "can't kill all tasks of container {name}"
                )));
            }
            tokio::time::sleep(STOP_POLL_DELAY).await;
        }
        Ok(())
    }

    /// Pauses a running container through the freezer.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless Running, `NotSupported` without a
    /// freezer cgroup.
    pub async fn pause(&mut self, name: &str) -> Result<()> {
        let container = self.require(name)?;
        if container.state() != ContainerState::Running {
            return Err(PortoError::invalid_state(format!(
                "can't pause container in state {}",
                container.state()
            )));
        }
        let cg = container
            .cgroup(SubsystemKind::Freezer)
            .cloned()
            .ok_or_else(|| PortoError::not_supported("freezer is not available"))?;

        freezer::freeze(&cg).await?;
        self.set_state(name, ContainerState::Paused);
        Ok(())
    }

    /// Resumes a paused container.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless Paused.
    pub async fn resume(&mut self, name: &str) -> Result<()> {
        let container = self.require(name)?;
        if container.state() != ContainerState::Paused {
            return Err(PortoError::invalid_state(format!(
                "can't resume container in state {}",
                container.state()
            )));
        }
        let cg = container
            .cgroup(SubsystemKind::Freezer)
            .cloned()
            .ok_or_else(|| PortoError::not_supported("freezer is not available"))?;

        freezer::thaw(&cg).await?;
        self.set_state(name, ContainerState::Running);
        Ok(())
    }

    /// Delivers a signal to the init process only.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless Running, `InvalidValue` for an
    /// unknown signal number.
    pub fn kill(&mut self, name: &str, signum: i32) -> Result<()> {
        let container = self.require(name)?;
        if container.state() != ContainerState::Running {
            return Err(PortoError::invalid_state(format!(
                "can't kill container in state {}",
                container.state()
            )));
        }
        let signal = Signal::try_from(signum)
            .map_err(|_| PortoError::invalid_value(format!("invalid signal: {signum}")))?;
        let pid = container
            .root_pid()
            .ok_or_else(|| PortoError::invalid_state("init process is gone"))?;

        tracing::info!(container = name, %signal, "kill");
        self.spawner.kill(pid, signal)
    }

    /// Restarts a container: stop when needed, then start, counting the
    /// respawn.
    ///
    /// # Errors
    ///
    /// Returns the error of the failing stop or start.
    pub async fn respawn(&mut self, name: &str) -> Result<()> {
        let state = self.require(name)?.state();
        if state != ContainerState::Stopped {
            self.stop(name, None).await?;
        }
        self.start(name).await?;

        let count = {
            let container = self.require_mut(name)?;
            container.respawn_count += 1;
            container.respawn_count
        };
        self.append_kv(name, RAW_RESPAWN_COUNT, &count.to_string());
        Ok(())
    }

    /// Destroys a container and all descendants, deepest first. Running
    /// subtrees are stopped before removal.
    ///
    /// Returns the destroyed names (deepest first) so volume links can
    /// be released by the caller.
    ///
    /// # Errors
    ///
    /// Returns `Permission` for the root, or the failure of a cascading
    /// stop.
    pub async fn destroy(&mut self, name: &str) -> Result<Vec<String>> {
        let container = self.require(name)?;
        if container.is_root() {
            return Err(PortoError::permission("can't destroy the root container"));
        }

        let mut victims = self.descendants(name);
        victims.push(name.to_string());

        for victim in &victims {
            if self.require(victim)?.state() != ContainerState::Stopped {
                self.stop_one(victim, self.stop_timeout).await?;
            }
        }

        let net = Arc::clone(&self.net);
        for victim in &victims {
            self.set_state(victim, ContainerState::Destroying);
            if let Some(mut container) = self.containers.remove(victim) {
                let _ = container.remove_resources(&net, false).await;
            }
            if let Err(e) = self.kv.remove_node(&escape_name(victim)) {
                tracing::warn!(container = %victim, "can't remove kv node: {e}");
            }
            tracing::info!(container = %victim, "container destroyed");
        }
        Ok(victims)
    }

    /// Returns the effective value of a property.
    ///
    /// An unset value with `PARENT_DEFAULT` resolves through the
    /// ancestor chain; otherwise the schema default applies.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for an unknown property.
    pub fn get_property(&self, name: &str, prop: &str) -> Result<String> {
        let container = self.require(name)?;
        let def = property_set()
            .get(prop)
            .ok_or_else(|| PortoError::invalid_value(format!("invalid property: {prop}")))?;

        if let Some(raw) = container.variants.get_raw(prop) {
            return Ok(raw.to_string());
        }

        if def.has_flags(PARENT_DEF_VALUE) {
            let mut ancestor = container.parent();
            while let Some(parent_name) = ancestor {
                let parent = self.require(parent_name)?;
                if let Some(raw) = parent.variants.get_raw(prop) {
                    return Ok(raw.to_string());
                }
                ancestor = parent.parent();
            }
        }

        Ok((def.default)(container))
    }

    /// Sets a property.
    ///
    /// The change is validated against the schema (flags, permitted
    /// states), appended to persistent storage before it becomes
    /// visible, and applied to the kernel immediately when the property
    /// is dynamic and the container holds resources.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue`, `InvalidState`, `Permission` or
    /// `NotSupported` per the schema gates.
    pub fn set_property(&mut self, name: &str, prop: &str, raw: &str, cred: Cred) -> Result<()> {
        let container = self.require(name)?;
        if container.is_root() {
            return Err(PortoError::invalid_state(
                "can't set properties of the root container",
            ));
        }
        let def = property_set()
            .get(prop)
            .ok_or_else(|| PortoError::invalid_value(format!("invalid property: {prop}")))?;

        if def.has_flags(SUPERUSER_VALUE) && !cred.is_root() {
            return Err(PortoError::permission(format!(
                "property {prop} requires root"
            )));
        }
        if def.has_flags(PARENT_RO_VALUE) && prop != "isolate" {
            let isolate = porto_value::parse_bool(&self.get_property(name, "isolate")?)?;
            if !isolate {
                return Err(PortoError::not_supported(format!(
                    "can't change {prop} while sharing resources with the parent"
                )));
            }
        }

        let container = self.require(name)?;
        if !def.has_state(container.state()) {
            return Err(PortoError::invalid_state(format!(
                "can't set {prop} in state {}",
                container.state()
            )));
        }

        let value = def.parse(raw)?;

        // Durability before visibility: the record must be on disk
        // before the client is acknowledged.
        self.kv.append(&escape_name(name), prop, raw)?;

        let container = self.require_mut(name)?;
        container.variants.set(prop, raw, value);
        tracing::debug!(container = name, property = prop, value = raw, "property set");

        let container = self.require(name)?;
        if def.has_flags(DYNAMIC_VALUE) && container.state().holds_resources() {
            if let Some(apply) = def.apply {
                let resolve = |p: &str| self.get_property(name, p);
                let ctx = ApplyCtx {
                    net: &self.net,
                    resolve: &resolve,
                };
                apply(container, &ctx)?;
            }
        }
        Ok(())
    }

    /// Returns a data item.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` for an unknown item, `InvalidState` when
    /// the item is undefined in the current state.
    pub fn get_data(&self, name: &str, key: &str) -> Result<String> {
        let container = self.require(name)?;
        let def = data_set()
            .get(key)
            .ok_or_else(|| PortoError::invalid_value(format!("invalid data: {key}")))?;

        if !def.has_state(container.state()) {
            return Err(PortoError::invalid_state(format!(
                "data {key} is not defined in state {}",
                container.state()
            )));
        }
        (def.get)(container)
    }

    /// Finds the first of `names` already in a terminal state.
    ///
    /// # Errors
    ///
    /// Returns `ContainerDoesNotExist` for an unknown name.
    pub fn find_terminal(&self, names: &[String]) -> Result<Option<String>> {
        for name in names {
            if self.require(name)?.state().is_terminal() {
                return Ok(Some(name.clone()));
            }
        }
        Ok(None)
    }

    /// Reaps containers whose init process died: respawns them when the
    /// respawn budget allows, otherwise marks them Dead.
    pub async fn reap(&mut self) {
        let running: Vec<(String, u32)> = self
            .containers
            .values()
            .filter(|c| c.state() == ContainerState::Running)
            .filter_map(|c| c.root_pid().map(|pid| (c.name.clone(), pid)))
            .collect();

        for (name, pid) in running {
            if self.spawner.alive(pid) {
                continue;
            }
            let status = self.spawner.try_reap(pid).unwrap_or(0);
            tracing::info!(container = %name, pid, status, "init process exited");

            if self.should_respawn(&name) {
                self.respawn_dead(&name).await;
            } else {
                self.mark_dead(&name, status);
            }
        }
    }

    fn should_respawn(&self, name: &str) -> bool {
        let respawn = self
            .get_property(name, "respawn")
            .ok()
            .and_then(|raw| porto_value::parse_bool(&raw).ok())
            .unwrap_or(false);
        if !respawn {
            return false;
        }
        let max: i64 = self
            .get_property(name, "max_respawns")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(-1);
        let count = self.get(name).map_or(0, |c| c.respawn_count);
        max < 0 || count < max as u64
    }

    async fn respawn_dead(&mut self, name: &str) {
        let net = Arc::clone(&self.net);
        if let Ok(container) = self.require_mut(name) {
            container.root_pid = None;
            let _ = container.remove_resources(&net, false).await;
        }
        self.set_state(name, ContainerState::Stopped);

        match self.start(name).await {
            Ok(()) => {
                let count = {
                    let Ok(container) = self.require_mut(name) else {
                        return;
                    };
                    container.respawn_count += 1;
                    container.respawn_count
                };
                self.append_kv(name, RAW_RESPAWN_COUNT, &count.to_string());
                tracing::info!(container = name, count, "respawned");
            }
            Err(e) => {
                tracing::warn!(container = name, "respawn failed: {e}");
                self.mark_dead(name, 0);
            }
        }
    }

    fn mark_dead(&mut self, name: &str, status: i32) {
        if let Some(container) = self.containers.get_mut(name) {
            container.exit_status = Some(status);
            container.died_at = Some(chrono::Utc::now());
        }
        self.append_kv(name, RAW_EXIT_STATUS, &status.to_string());
        self.set_state(name, ContainerState::Dead);
    }

    /// Rebuilds containers from persisted nodes after a daemon restart,
    /// parents before children, and reconciles each with the kernel.
    ///
    /// Live init processes keep their containers Running (or Paused
    /// when the freezer reports FROZEN); containers whose init is gone
    /// become Stopped; nodes that cannot be reconciled become Dead with
    /// the diagnostic preserved.
    ///
    /// # Errors
    ///
    /// Returns an error only when the storage root itself is unreadable.
    pub async fn restore(&mut self) -> Result<()> {
        let mut nodes = self.kv.list_nodes()?;
        // Parents first.
        nodes.sort_by_key(|n| (n.matches('.').count(), n.clone()));

        for node in nodes {
            let name = name::unescape_name(&node);
            match self.restore_node(&node, &name).await {
                Ok(()) => {}
                Err(e) => {
                    tracing::error!(container = %name, "can't restore: {e}");
                    if let Some(container) = self.containers.get_mut(&name) {
                        container.last_error = Some(e.to_string());
                        container.state = ContainerState::Dead;
                    }
                }
            }
        }
        Ok(())
    }

    async fn restore_node(&mut self, node: &str, name: &str) -> Result<()> {
        let records = self.kv.restore_node(node)?;

        if records.contains_key(RAW_WEAK) {
            tracing::info!(container = name, "dropping weak container at restore");
            self.kv.remove_node(node)?;
            return Ok(());
        }

        let parent = name::parent_name(name);
        if !self.containers.contains_key(parent) {
            return Err(PortoError::no_container(parent));
        }

        let uid = records.get(RAW_UID).and_then(|v| v.parse().ok()).unwrap_or(0);
        let gid = records.get(RAW_GID).and_then(|v| v.parse().ok()).unwrap_or(0);
        let id = records
            .get(RAW_ID)
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| self.alloc_id().unwrap_or(u16::MAX));
        self.next_id = self.next_id.max(id.wrapping_add(1)).max(FIRST_CONTAINER_ID);

        let mut container = Container::new(name.to_string(), Cred::new(uid, gid), id);
        let mut parse_error = None;

        for (key, value) in &records {
            if key.starts_with('_') {
                continue;
            }
            match property_set().get(key) {
                Some(def) => match def.parse(value) {
                    Ok(parsed) => container.variants.set(key.clone(), value.clone(), parsed),
                    Err(e) => {
                        parse_error = Some(format!("property {key}: {e}"));
                    }
                },
                None => tracing::warn!(container = name, key, "unknown persisted property"),
            }
        }

        container.respawn_count = records
            .get(RAW_RESPAWN_COUNT)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let saved_state: ContainerState = records
            .get(RAW_STATE)
            .and_then(|v| v.parse().ok())
            .unwrap_or(ContainerState::Stopped);
        let saved_pid: Option<u32> = records.get(RAW_ROOT_PID).and_then(|v| v.parse().ok());

        if let Some(diag) = parse_error {
            container.last_error = Some(diag.clone());
            container.state = ContainerState::Dead;
            container.reattach_resources(&self.registry, &self.net);
            self.containers.insert(name.to_string(), container);
            self.append_kv(name, RAW_STATE, &ContainerState::Dead.to_string());
            return Err(PortoError::invalid_value(diag));
        }

        match saved_state {
            ContainerState::Running
            | ContainerState::Paused
            | ContainerState::Starting
            | ContainerState::Stopping => {
                let alive = saved_pid.map_or(false, |pid| self.spawner.alive(pid));
                if alive {
                    container.root_pid = saved_pid;
                    container.reattach_resources(&self.registry, &self.net);
                    let frozen = container
                        .cgroup(SubsystemKind::Freezer)
                        .and_then(|cg| cg.knob("freezer.state").ok())
                        .map_or(false, |raw| raw.split_whitespace().next() == Some("FROZEN"));
                    container.state = if frozen {
                        ContainerState::Paused
                    } else {
                        ContainerState::Running
                    };
                    tracing::info!(container = name, state = %container.state, "reattached");
                } else {
                    container.reattach_resources(&self.registry, &self.net);
                    let net = Arc::clone(&self.net);
                    let _ = container.remove_resources(&net, false).await;
                    container.state = ContainerState::Stopped;
                    tracing::info!(container = name, "init gone, restored as stopped");
                }
            }
            ContainerState::Dead => {
                container.exit_status = records
                    .get(RAW_EXIT_STATUS)
                    .and_then(|v| v.parse().ok());
                container.reattach_resources(&self.registry, &self.net);
                container.state = ContainerState::Dead;
            }
            _ => container.state = ContainerState::Stopped,
        }

        let state = container.state;
        self.containers.insert(name.to_string(), container);
        self.append_kv(name, RAW_STATE, &state.to_string());
        Ok(())
    }
}
