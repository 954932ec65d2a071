//! The data schema table: read-only runtime projections.

use std::collections::HashMap;
use std::sync::OnceLock;

use porto_error::{PortoError, Result};
use porto_value::READ_ONLY_VALUE;

use crate::container::Container;
use crate::state::{state_mask, ContainerState};
use crate::ROOT_NAME;

/// Descriptor of one data item.
pub struct DataDef {
    pub name: &'static str,
    pub desc: &'static str,
    pub flags: u32,
    /// States in which the data item is defined.
    pub states: u32,
    pub get: fn(&Container) -> Result<String>,
}

impl DataDef {
    /// Returns whether the item is defined in `state`.
    #[must_use]
    pub const fn has_state(&self, state: ContainerState) -> bool {
        self.states & state.bit() != 0
    }
}

/// The data table.
pub struct DataSet {
    defs: Vec<DataDef>,
    index: HashMap<&'static str, usize>,
}

impl DataSet {
    fn new(defs: Vec<DataDef>) -> Self {
        let index = defs
            .iter()
            .enumerate()
            .map(|(i, def)| (def.name, i))
            .collect();
        Self { defs, index }
    }

    /// Looks a data item up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&DataDef> {
        self.index.get(name).map(|&i| &self.defs[i])
    }

    /// All descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &DataDef> {
        self.defs.iter()
    }
}

fn get_memory_usage(container: &Container) -> Result<String> {
    let cg = container
        .cgroup(porto_cgroup::SubsystemKind::Memory)
        .ok_or_else(|| PortoError::no_value("memory cgroup is not materialized"))?;
    Ok(porto_cgroup::memory_usage(cg)?.to_string())
}

fn get_cpu_usage(container: &Container) -> Result<String> {
    let cg = container
        .cgroup(porto_cgroup::SubsystemKind::Cpuacct)
        .ok_or_else(|| PortoError::no_value("cpuacct cgroup is not materialized"))?;
    Ok(porto_cgroup::cpuacct_usage(cg)?.to_string())
}

fn build() -> DataSet {
    let any = state_mask(&[
        ContainerState::Stopped,
        ContainerState::Starting,
        ContainerState::Running,
        ContainerState::Paused,
        ContainerState::Stopping,
        ContainerState::Dead,
        ContainerState::Destroying,
    ]);
    let live = state_mask(&[
        ContainerState::Running,
        ContainerState::Paused,
        ContainerState::Stopping,
    ]);
    let with_usage = state_mask(&[
        ContainerState::Running,
        ContainerState::Paused,
        ContainerState::Stopping,
        ContainerState::Dead,
    ]);
    let dead = state_mask(&[ContainerState::Dead]);

    DataSet::new(vec![
        DataDef {
            name: "state",
            desc: "current lifecycle state",
            flags: READ_ONLY_VALUE,
            states: any,
            get: |c| Ok(c.state().to_string()),
        },
        DataDef {
            name: "parent",
            desc: "name of the parent container",
            flags: READ_ONLY_VALUE,
            states: any,
            get: |c| Ok(c.parent().unwrap_or(ROOT_NAME).to_string()),
        },
        DataDef {
            name: "root_pid",
            desc: "pid of the init process",
            flags: READ_ONLY_VALUE,
            states: live,
            get: |c| {
                c.root_pid()
                    .map(|pid| pid.to_string())
                    .ok_or_else(|| PortoError::no_value("init process is gone"))
            },
        },
        DataDef {
            name: "exit_status",
            desc: "raw wait status of the exited init process",
            flags: READ_ONLY_VALUE,
            states: dead,
            get: |c| {
                c.exit_status()
                    .map(|s| s.to_string())
                    .ok_or_else(|| PortoError::no_value("container has not exited"))
            },
        },
        DataDef {
            name: "oom_killed",
            desc: "whether the container was killed by the oom killer",
            flags: READ_ONLY_VALUE,
            states: dead,
            get: |c| Ok(c.oom_killed.to_string()),
        },
        DataDef {
            name: "respawn_count",
            desc: "how many times the container was respawned",
            flags: READ_ONLY_VALUE,
            states: any,
            get: |c| Ok(c.respawn_count.to_string()),
        },
        DataDef {
            name: "last_error",
            desc: "diagnostic from the last failed start or restore",
            flags: READ_ONLY_VALUE,
            states: any,
            get: |c| Ok(c.last_error.clone().unwrap_or_default()),
        },
        DataDef {
            name: "memory_usage",
            desc: "memory usage in bytes",
            flags: READ_ONLY_VALUE,
            states: with_usage,
            get: get_memory_usage,
        },
        DataDef {
            name: "cpu_usage",
            desc: "cpu usage in nanoseconds",
            flags: READ_ONLY_VALUE,
            states: with_usage,
            get: get_cpu_usage,
        },
    ])
}

/// The process-wide data table.
pub fn data_set() -> &'static DataSet {
    static SET: OnceLock<DataSet> = OnceLock::new();
    SET.get_or_init(build)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cred::Cred;

    #[test]
    fn state_and_parent_projections() {
        let container = Container::new("a.b".to_string(), Cred::new(1000, 1000), 3);
        let set = data_set();

        let state = set.get("state").unwrap();
        assert_eq!((state.get)(&container).unwrap(), "stopped");

        let parent = set.get("parent").unwrap();
        assert_eq!((parent.get)(&container).unwrap(), "a");
    }

    #[test]
    fn gated_items_reject_wrong_state() {
        let set = data_set();
        let exit = set.get("exit_status").unwrap();
        assert!(!exit.has_state(ContainerState::Running));
        assert!(exit.has_state(ContainerState::Dead));

        let pid = set.get("root_pid").unwrap();
        assert!(pid.has_state(ContainerState::Running));
        assert!(!pid.has_state(ContainerState::Stopped));
    }

    #[test]
    fn unknown_data_is_absent() {
        assert!(data_set().get("nonsense").is_none());
    }
}
