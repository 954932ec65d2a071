//! Subsystem mount discovery and cgroup path resolution.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use porto_error::{PortoError, Result};

use crate::Cgroup;

/// Directory under every subsystem mount that holds daemon-owned cgroups.
pub const PORTO_ROOT_CGROUP: &str = "porto";

/// Cgroup v1 controllers the daemon binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubsystemKind {
    Memory,
    Cpu,
    Cpuacct,
    Freezer,
    NetCls,
    Devices,
    Blkio,
}

impl SubsystemKind {
    /// All controllers, in the order limits are applied at start.
    pub const ALL: [Self; 7] = [
        Self::Memory,
        Self::Cpu,
        Self::Cpuacct,
        Self::Freezer,
        Self::NetCls,
        Self::Devices,
        Self::Blkio,
    ];

    /// Kernel name as it appears in mount options.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Cpu => "cpu",
            Self::Cpuacct => "cpuacct",
            Self::Freezer => "freezer",
            Self::NetCls => "net_cls",
            Self::Devices => "devices",
            Self::Blkio => "blkio",
        }
    }

    fn from_option(opt: &str) -> Option<Self> {
        match opt {
            "memory" => Some(Self::Memory),
            "cpu" => Some(Self::Cpu),
            "cpuacct" => Some(Self::Cpuacct),
            "freezer" => Some(Self::Freezer),
            "net_cls" => Some(Self::NetCls),
            "devices" => Some(Self::Devices),
            "blkio" => Some(Self::Blkio),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubsystemKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discovered subsystem mounts.
///
/// Built once at daemon start; failure to read mountinfo is fatal to the
/// daemon per the startup contract.
#[derive(Debug)]
pub struct CgroupRegistry {
    mounts: HashMap<SubsystemKind, PathBuf>,
}

impl CgroupRegistry {
    /// Discovers subsystem mounts from `/proc/self/mountinfo`.
    ///
    /// # Errors
    ///
    /// Returns an error if mountinfo cannot be read. Missing individual
    /// subsystems are not an error; operations on them report
    /// `NotSupported` later.
    pub fn discover() -> Result<Self> {
        let raw = std::fs::read_to_string("/proc/self/mountinfo")
            .map_err(|e| PortoError::unknown(format!("can't read mountinfo: {e}")))?;
        Ok(Self::from_mountinfo(&raw))
    }

    /// Parses mountinfo content. Split out so tests can feed fixtures.
    #[must_use]
    pub fn from_mountinfo(raw: &str) -> Self {
        let mut mounts = HashMap::new();

        for line in raw.lines() {
            // mountinfo: "<ids...> <mountpoint> ... - <fstype> <source> <opts>"
            let Some((left, right)) = line.split_once(" - ") else {
                continue;
            };
            let mountpoint = match left.split_whitespace().nth(4) {
                Some(p) => p,
                None => continue,
            };
            let mut right_fields = right.split_whitespace();
            let fstype = right_fields.next().unwrap_or("");
            if fstype != "cgroup" {
                continue;
            }
            let opts = right_fields.nth(1).unwrap_or("");

            for opt in opts.split(',') {
                if let Some(kind) = SubsystemKind::from_option(opt) {
                    mounts
                        .entry(kind)
                        .or_insert_with(|| PathBuf::from(mountpoint));
                }
            }
        }

        Self { mounts }
    }

    /// Builds a registry over explicit mount points (tests, chroots).
    #[must_use]
    pub fn with_mounts(mounts: HashMap<SubsystemKind, PathBuf>) -> Self {
        Self { mounts }
    }

    /// Returns the mount point of a subsystem, if present on this host.
    #[must_use]
    pub fn mount(&self, kind: SubsystemKind) -> Option<&Path> {
        self.mounts.get(&kind).map(PathBuf::as_path)
    }

    /// Subsystems available on this host, in apply order.
    #[must_use]
    pub fn available(&self) -> Vec<SubsystemKind> {
        SubsystemKind::ALL
            .into_iter()
            .filter(|kind| self.mounts.contains_key(kind))
            .collect()
    }

    /// Resolves the cgroup handle for an escaped container name inside a
    /// subsystem. An empty name resolves to the daemon root cgroup.
    ///
    /// # Errors
    ///
    /// Returns `NotSupported` if the subsystem is not mounted.
    pub fn cgroup(&self, kind: SubsystemKind, escaped_name: &str) -> Result<Cgroup> {
        let mount = self
            .mounts
            .get(&kind)
            .ok_or_else(|| PortoError::not_supported(format!("subsystem {kind} is not mounted")))?;

        let mut path = mount.join(PORTO_ROOT_CGROUP);
        if !escaped_name.is_empty() {
            path = path.join(escaped_name);
        }
        Ok(Cgroup::new(kind, path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MOUNTINFO: &str = "\
24 30 0:22 / /sys rw,nosuid,nodev,noexec,relatime shared:7 - sysfs sysfs rw
31 24 0:26 / /sys/fs/cgroup ro,nosuid,nodev,noexec shared:9 - tmpfs tmpfs ro,mode=755
32 31 0:27 / /sys/fs/cgroup/memory rw,nosuid,nodev,noexec,relatime shared:10 - cgroup cgroup rw,memory
33 31 0:28 / /sys/fs/cgroup/cpu,cpuacct rw,nosuid,nodev,noexec,relatime shared:11 - cgroup cgroup rw,cpu,cpuacct
34 31 0:29 / /sys/fs/cgroup/freezer rw,nosuid,nodev,noexec,relatime shared:12 - cgroup cgroup rw,freezer
35 31 0:30 / /sys/fs/cgroup/net_cls rw,nosuid,nodev,noexec,relatime shared:13 - cgroup cgroup rw,net_cls
";

    #[test]
    fn parses_subsystem_mounts() {
        let reg = CgroupRegistry::from_mountinfo(MOUNTINFO);
        assert_eq!(
            reg.mount(SubsystemKind::Memory).unwrap(),
            Path::new("/sys/fs/cgroup/memory")
        );
        assert_eq!(
            reg.mount(SubsystemKind::Cpu).unwrap(),
            Path::new("/sys/fs/cgroup/cpu,cpuacct")
        );
        assert_eq!(
            reg.mount(SubsystemKind::Cpuacct).unwrap(),
            Path::new("/sys/fs/cgroup/cpu,cpuacct")
        );
        assert!(reg.mount(SubsystemKind::Blkio).is_none());
    }

    #[test]
    fn cgroup_paths_mirror_names() {
        let reg = CgroupRegistry::from_mountinfo(MOUNTINFO);
        let cg = reg.cgroup(SubsystemKind::Freezer, "a.b").unwrap();
        assert_eq!(cg.path(), Path::new("/sys/fs/cgroup/freezer/porto/a.b"));

        let root = reg.cgroup(SubsystemKind::Freezer, "").unwrap();
        assert_eq!(root.path(), Path::new("/sys/fs/cgroup/freezer/porto"));
    }

    #[test]
    fn missing_subsystem_is_not_supported() {
        let reg = CgroupRegistry::from_mountinfo(MOUNTINFO);
        let err = reg.cgroup(SubsystemKind::Blkio, "a").unwrap_err();
        assert_eq!(err.code, porto_error::EError::NotSupported);
    }

    #[test]
    fn available_preserves_apply_order() {
        let reg = CgroupRegistry::from_mountinfo(MOUNTINFO);
        assert_eq!(
            reg.available(),
            vec![
                SubsystemKind::Memory,
                SubsystemKind::Cpu,
                SubsystemKind::Cpuacct,
                SubsystemKind::Freezer,
                SubsystemKind::NetCls,
            ]
        );
    }
}
