//! The property schema table.
//!
//! One process-wide table maps every property name to its descriptor:
//! kind, flags, permitted states, default producer, extra validation
//! and the kernel-side applier used for dynamic changes. The holder
//! consults the table for every get/set.

use std::collections::HashMap;
use std::sync::OnceLock;

use porto_error::{PortoError, Result};
use porto_net::Network;
use porto_value::{
    has_flags, Value, ValueKind, DYNAMIC_VALUE, PARENT_DEF_VALUE, PARENT_RO_VALUE,
    SUPERUSER_VALUE,
};

use crate::container::Container;
use crate::state::{state_mask, ContainerState};

/// Context handed to dynamic appliers.
pub struct ApplyCtx<'a> {
    /// Traffic-control binding.
    pub net: &'a Network,
    /// Effective (parent-resolved) value lookup for any property of the
    /// container being changed.
    pub resolve: &'a dyn Fn(&str) -> Result<String>,
}

/// Kernel-side effect of a dynamic property change.
pub type ApplyFn = fn(&Container, &ApplyCtx<'_>) -> Result<()>;

/// Descriptor of one property.
pub struct PropertyDef {
    pub name: &'static str,
    pub desc: &'static str,
    pub flags: u32,
    /// States in which the property may be set.
    pub states: u32,
    pub kind: ValueKind,
    pub default: fn(&Container) -> String,
    pub validate: Option<fn(&Value) -> Result<()>>,
    pub apply: Option<ApplyFn>,
}

impl PropertyDef {
    /// Returns whether `flags` are all present on this property.
    #[must_use]
    pub const fn has_flags(&self, flags: u32) -> bool {
        has_flags(self.flags, flags)
    }

    /// Returns whether the property may be set in `state`.
    #[must_use]
    pub const fn has_state(&self, state: ContainerState) -> bool {
        self.states & state.bit() != 0
    }

    /// Parses and validates a raw value for this property.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` when the string is outside the accepted
    /// set.
    pub fn parse(&self, raw: &str) -> Result<Value> {
        let value = porto_value::parse(self.kind, raw)?;
        if let Some(validate) = self.validate {
            validate(&value)?;
        }
        Ok(value)
    }
}

/// The property table.
pub struct PropertySet {
    defs: Vec<PropertyDef>,
    index: HashMap<&'static str, usize>,
}

impl PropertySet {
    fn new(defs: Vec<PropertyDef>) -> Self {
        let index = defs
            .iter()
            .enumerate()
            .map(|(i, def)| (def.name, i))
            .collect();
        Self { defs, index }
    }

    /// Looks a property up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PropertyDef> {
        self.index.get(name).map(|&i| &self.defs[i])
    }

    /// All descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &PropertyDef> {
        self.defs.iter()
    }
}

fn default_empty(_: &Container) -> String {
    String::new()
}

fn validate_cpu_policy(value: &Value) -> Result<()> {
    match value.as_str() {
        Some("normal" | "rt" | "idle") => Ok(()),
        Some(other) => Err(PortoError::invalid_value(format!(
            "invalid cpu policy: {other}"
        ))),
        None => Err(PortoError::invalid_value("cpu policy must be a string")),
    }
}

fn validate_cpu_priority(value: &Value) -> Result<()> {
    match value.as_uint() {
        Some(0..=99) => Ok(()),
        _ => Err(PortoError::invalid_value("cpu priority must be 0..99")),
    }
}

fn validate_net_priority(value: &Value) -> Result<()> {
    match value.as_uint() {
        Some(0..=7) => Ok(()),
        _ => Err(PortoError::invalid_value("network priority must be 0..7")),
    }
}

fn apply_memory_limit(container: &Container, ctx: &ApplyCtx<'_>) -> Result<()> {
    apply_memory_knob(container, ctx, "memory_limit", "memory.limit_in_bytes")
}

fn apply_memory_guarantee(container: &Container, ctx: &ApplyCtx<'_>) -> Result<()> {
    apply_memory_knob(
        container,
        ctx,
        "memory_guarantee",
        "memory.soft_limit_in_bytes",
    )
}

fn apply_memory_knob(
    container: &Container,
    ctx: &ApplyCtx<'_>,
    prop: &str,
    knob: &str,
) -> Result<()> {
    let Some(cg) = container.cgroup(porto_cgroup::SubsystemKind::Memory) else {
        return Ok(());
    };
    let raw = (ctx.resolve)(prop)?;
    let bytes: u64 = raw
        .trim()
        .parse()
        .map_err(|_| PortoError::invalid_value(format!("invalid {prop}: {raw}")))?;
    if bytes > 0 {
        cg.set_knob(knob, &bytes.to_string())?;
    }
    Ok(())
}

/// Rebuilds the container's htb class from the effective net trio.
fn apply_net_class(container: &Container, ctx: &ApplyCtx<'_>) -> Result<()> {
    if !ctx.net.enabled() {
        return Ok(());
    }
    let Some(class) = container.tclass else {
        return Ok(());
    };

    let prio: u32 = parse_resolved(ctx, "net_priority")?;
    let rate: u64 = parse_resolved(ctx, "net_guarantee")?;
    let ceil: u64 = parse_resolved(ctx, "net_limit")?;
    class.create(ctx.net, prio, rate, ceil)
}

fn parse_resolved<T: std::str::FromStr>(ctx: &ApplyCtx<'_>, prop: &str) -> Result<T> {
    let raw = (ctx.resolve)(prop)?;
    raw.trim()
        .parse()
        .map_err(|_| PortoError::invalid_value(format!("invalid {prop}: {raw}")))
}

fn apply_nothing(_: &Container, _: &ApplyCtx<'_>) -> Result<()> {
    Ok(())
}

fn build() -> PropertySet {
    let stopped = state_mask(&[ContainerState::Stopped]);
    let dynamic = state_mask(&[
        ContainerState::Stopped,
        ContainerState::Running,
        ContainerState::Paused,
    ]);
    let any = state_mask(&[
        ContainerState::Stopped,
        ContainerState::Starting,
        ContainerState::Running,
        ContainerState::Paused,
        ContainerState::Stopping,
        ContainerState::Dead,
    ]);

    PropertySet::new(vec![
        PropertyDef {
            name: "command",
            desc: "command executed as the container's init process",
            flags: 0,
            states: stopped,
            kind: ValueKind::String,
            default: default_empty,
            validate: None,
            apply: None,
        },
        PropertyDef {
            name: "cwd",
            desc: "working directory of the init process",
            flags: 0,
            states: stopped,
            kind: ValueKind::String,
            default: |_| "/".to_string(),
            validate: None,
            apply: None,
        },
        PropertyDef {
            name: "root",
            desc: "root filesystem of the container",
            flags: 0,
            states: stopped,
            kind: ValueKind::String,
            default: |_| "/".to_string(),
            validate: None,
            apply: None,
        },
        PropertyDef {
            name: "user",
            desc: "uid or user name the init process runs as",
            flags: 0,
            states: stopped,
            kind: ValueKind::String,
            default: |c| c.creds().uid.to_string(),
            validate: None,
            apply: None,
        },
        PropertyDef {
            name: "group",
            desc: "gid or group name the init process runs as",
            flags: 0,
            states: stopped,
            kind: ValueKind::String,
            default: |c| c.creds().gid.to_string(),
            validate: None,
            apply: None,
        },
        PropertyDef {
            name: "env",
            desc: "environment of the init process, semicolon separated",
            flags: 0,
            states: stopped,
            kind: ValueKind::List,
            default: default_empty,
            validate: None,
            apply: None,
        },
        PropertyDef {
            name: "memory_limit",
            desc: "hard memory limit in bytes, 0 means unlimited",
            flags: DYNAMIC_VALUE | PARENT_DEF_VALUE,
            states: dynamic,
            kind: ValueKind::Uint,
            default: |_| "0".to_string(),
            validate: None,
            apply: Some(apply_memory_limit),
        },
        PropertyDef {
            name: "memory_guarantee",
            desc: "soft memory guarantee in bytes",
            flags: DYNAMIC_VALUE | PARENT_DEF_VALUE,
            states: dynamic,
            kind: ValueKind::Uint,
            default: |_| "0".to_string(),
            validate: None,
            apply: Some(apply_memory_guarantee),
        },
        PropertyDef {
            name: "cpu_policy",
            desc: "cpu scheduling policy: normal, rt or idle",
            flags: PARENT_DEF_VALUE,
            states: stopped,
            kind: ValueKind::String,
            default: |_| "normal".to_string(),
            validate: Some(validate_cpu_policy),
            apply: None,
        },
        PropertyDef {
            name: "cpu_priority",
            desc: "relative cpu weight, 0..99",
            flags: 0,
            states: stopped,
            kind: ValueKind::Uint,
            default: |_| "0".to_string(),
            validate: Some(validate_cpu_priority),
            apply: None,
        },
        PropertyDef {
            name: "net_guarantee",
            desc: "guaranteed network rate in bytes per second",
            flags: DYNAMIC_VALUE | PARENT_DEF_VALUE,
            states: dynamic,
            kind: ValueKind::Uint,
            default: |_| "0".to_string(),
            validate: None,
            apply: Some(apply_net_class),
        },
        PropertyDef {
            name: "net_limit",
            desc: "network rate ceiling in bytes per second, 0 unlimited",
            flags: DYNAMIC_VALUE | PARENT_DEF_VALUE,
            states: dynamic,
            kind: ValueKind::Uint,
            default: |_| "0".to_string(),
            validate: None,
            apply: Some(apply_net_class),
        },
        PropertyDef {
            name: "net_priority",
            desc: "htb class priority, 0..7",
            flags: DYNAMIC_VALUE | PARENT_DEF_VALUE,
            states: dynamic,
            kind: ValueKind::Uint,
            default: |_| "3".to_string(),
            validate: Some(validate_net_priority),
            apply: Some(apply_net_class),
        },
        PropertyDef {
            name: "respawn",
            desc: "restart the container when its init process dies",
            flags: DYNAMIC_VALUE,
            states: any,
            kind: ValueKind::Bool,
            default: |_| "false".to_string(),
            validate: None,
            apply: Some(apply_nothing),
        },
        PropertyDef {
            name: "max_respawns",
            desc: "respawn budget, -1 for unbounded",
            flags: DYNAMIC_VALUE,
            states: any,
            kind: ValueKind::Int,
            default: |_| "-1".to_string(),
            validate: None,
            apply: Some(apply_nothing),
        },
        PropertyDef {
            name: "isolate",
            desc: "run in fresh namespaces instead of sharing the parent",
            flags: PARENT_RO_VALUE,
            states: stopped,
            kind: ValueKind::Bool,
            default: |_| "true".to_string(),
            validate: None,
            apply: None,
        },
        PropertyDef {
            name: "hostname",
            desc: "hostname inside the container",
            flags: 0,
            states: stopped,
            kind: ValueKind::String,
            default: default_empty,
            validate: None,
            apply: None,
        },
        PropertyDef {
            name: "bind",
            desc: "bind mounts: source target [ro|rw], semicolon separated",
            flags: 0,
            states: stopped,
            kind: ValueKind::Binds,
            default: default_empty,
            validate: None,
            apply: None,
        },
        PropertyDef {
            name: "rlimit",
            desc: "resource limits: name: soft hard, semicolon separated",
            flags: 0,
            states: stopped,
            kind: ValueKind::Rlimits,
            default: default_empty,
            validate: None,
            apply: None,
        },
        PropertyDef {
            name: "net",
            desc: "network attachment: inherited, none, host or macvlan",
            flags: PARENT_RO_VALUE,
            states: stopped,
            kind: ValueKind::Net,
            default: |_| "inherited".to_string(),
            validate: None,
            apply: None,
        },
        PropertyDef {
            name: "devices",
            desc: "device access rules written to the devices cgroup",
            flags: SUPERUSER_VALUE,
            states: stopped,
            kind: ValueKind::List,
            default: default_empty,
            validate: None,
            apply: None,
        },
        PropertyDef {
            name: "stdin_path",
            desc: "file opened as the init process stdin",
            flags: 0,
            states: stopped,
            kind: ValueKind::String,
            default: default_empty,
            validate: None,
            apply: None,
        },
        PropertyDef {
            name: "stdout_path",
            desc: "file the init process stdout is appended to",
            flags: 0,
            states: stopped,
            kind: ValueKind::String,
            default: default_empty,
            validate: None,
            apply: None,
        },
        PropertyDef {
            name: "stderr_path",
            desc: "file the init process stderr is appended to",
            flags: 0,
            states: stopped,
            kind: ValueKind::String,
            default: default_empty,
            validate: None,
            apply: None,
        },
        PropertyDef {
            name: "private",
            desc: "free-form label shown in listings",
            flags: DYNAMIC_VALUE,
            states: any,
            kind: ValueKind::String,
            default: default_empty,
            validate: None,
            apply: Some(apply_nothing),
        },
    ])
}

/// The process-wide property table.
pub fn property_set() -> &'static PropertySet {
    static SET: OnceLock<PropertySet> = OnceLock::new();
    SET.get_or_init(build)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cred::Cred;

    #[test]
    fn table_is_indexed() {
        let set = property_set();
        assert!(set.get("memory_limit").is_some());
        assert!(set.get("no_such_property").is_none());
        assert!(set.iter().count() >= 20);
    }

    #[test]
    fn flags_and_states() {
        let set = property_set();

        let limit = set.get("memory_limit").unwrap();
        assert!(limit.has_flags(DYNAMIC_VALUE));
        assert!(limit.has_flags(PARENT_DEF_VALUE));
        assert!(limit.has_state(ContainerState::Running));
        assert!(!limit.has_state(ContainerState::Dead));

        let command = set.get("command").unwrap();
        assert!(command.has_state(ContainerState::Stopped));
        assert!(!command.has_state(ContainerState::Running));

        let devices = set.get("devices").unwrap();
        assert!(devices.has_flags(SUPERUSER_VALUE));

        let isolate = set.get("isolate").unwrap();
        assert!(isolate.has_flags(PARENT_RO_VALUE));
    }

    #[test]
    fn defaults_derive_from_creator() {
        let container = Container::new("a".to_string(), Cred::new(1000, 1000), 3);
        let set = property_set();
        assert_eq!((set.get("user").unwrap().default)(&container), "1000");
        assert_eq!((set.get("cwd").unwrap().default)(&container), "/");
        assert_eq!((set.get("net_priority").unwrap().default)(&container), "3");
    }

    #[test]
    fn validation_rejects_out_of_range() {
        let set = property_set();
        assert!(set.get("cpu_policy").unwrap().parse("normal").is_ok());
        assert!(set.get("cpu_policy").unwrap().parse("fancy").is_err());
        assert!(set.get("cpu_priority").unwrap().parse("99").is_ok());
        assert!(set.get("cpu_priority").unwrap().parse("100").is_err());
        assert!(set.get("net_priority").unwrap().parse("8").is_err());
        assert!(set.get("memory_limit").unwrap().parse("12x").is_err());
    }
}
