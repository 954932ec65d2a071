//! Structured sub-parsers: rlimits, bind mounts and network specs.

use std::collections::BTreeMap;
use std::path::PathBuf;

use porto_error::{PortoError, Result};

/// One resource limit pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rlimit {
    /// Soft limit; `None` means unlimited.
    pub soft: Option<u64>,
    /// Hard limit; `None` means unlimited.
    pub hard: Option<u64>,
}

/// One bind mount request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

/// Network attachment of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetCfg {
    /// Share the parent's network namespace.
    Inherited,
    /// Use the host network, optionally restricted to named links.
    Host(Vec<String>),
    /// A fresh namespace with only loopback.
    None,
    /// A macvlan device enslaved to a host master link.
    Macvlan { master: String, name: String },
}

fn parse_limit(raw: &str) -> Result<Option<u64>> {
    if raw == "unlim" || raw == "unlimited" {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| PortoError::invalid_value(format!("invalid limit: {raw}")))
}

/// Parses `name: soft hard; ...` rlimit entries.
///
/// # Errors
///
/// Returns `InvalidValue` for unknown shapes or non-numeric limits.
pub fn parse_rlimits(raw: &str) -> Result<BTreeMap<String, Rlimit>> {
    let mut map = BTreeMap::new();
    for entry in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (name, limits) = entry
            .split_once(':')
            .ok_or_else(|| PortoError::invalid_value(format!("invalid rlimit entry: {entry}")))?;

        let mut parts = limits.split_whitespace();
        let (Some(soft), Some(hard), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(PortoError::invalid_value(format!(
                "rlimit needs soft and hard limits: {entry}"
            )));
        };

        map.insert(
            name.trim().to_string(),
            Rlimit {
                soft: parse_limit(soft)?,
                hard: parse_limit(hard)?,
            },
        );
    }
    Ok(map)
}

/// Parses `source target [ro|rw]; ...` bind entries.
///
/// # Errors
///
/// Returns `InvalidValue` for relative paths or unknown access modes.
pub fn parse_binds(raw: &str) -> Result<Vec<BindSpec>> {
    let mut binds = Vec::new();
    for entry in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let mut parts = entry.split_whitespace();
        let (Some(source), Some(target)) = (parts.next(), parts.next()) else {
            return Err(PortoError::invalid_value(format!(
                "bind needs source and target: {entry}"
            )));
        };
        let read_only = match parts.next() {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(mode) => {
                return Err(PortoError::invalid_value(format!(
                    "invalid bind mode: {mode}"
                )))
            }
        };
        if parts.next().is_some() {
            return Err(PortoError::invalid_value(format!(
                "trailing garbage in bind: {entry}"
            )));
        }
        if !source.starts_with('/') || !target.starts_with('/') {
            return Err(PortoError::invalid_value(format!(
                "bind paths must be absolute: {entry}"
            )));
        }

        binds.push(BindSpec {
            source: PathBuf::from(source),
            target: PathBuf::from(target),
            read_only,
        });
    }
    Ok(binds)
}

/// Parses a network spec:
/// `inherited`, `none`, `host [link...]` or `macvlan <master> <name>`.
///
/// # Errors
///
/// Returns `InvalidValue` for unknown forms.
pub fn parse_net(raw: &str) -> Result<NetCfg> {
    let mut parts = raw.split_whitespace();
    match parts.next() {
        Some("inherited") | None => Ok(NetCfg::Inherited),
        Some("none") => Ok(NetCfg::None),
        Some("host") => Ok(NetCfg::Host(parts.map(ToString::to_string).collect())),
        Some("macvlan") => {
            let (Some(master), Some(name), None) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(PortoError::invalid_value(
                    "macvlan needs master and device name",
                ));
            };
            Ok(NetCfg::Macvlan {
                master: master.to_string(),
                name: name.to_string(),
            })
        }
        Some(kind) => Err(PortoError::invalid_value(format!(
            "invalid network spec: {kind}"
        ))),
    }
}
