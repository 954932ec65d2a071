//! # porto-value
//!
//! The typed value model behind container properties and data.
//!
//! Values travel the wire as strings; the schema table gives each name a
//! kind, and parsing turns the raw string into a [`Value`] variant. The
//! per-container [`VariantSet`] stores either nothing (the value is
//! *default*, computed lazily) or the raw string together with its
//! parsed form.

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod flags;
pub mod spec;

pub use flags::*;
pub use spec::{BindSpec, NetCfg, Rlimit};

use std::collections::{BTreeMap, HashMap};

use porto_error::{PortoError, Result};

/// Kind discriminant of a schema entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Bool,
    Int,
    Uint,
    List,
    Map,
    Rlimits,
    Binds,
    Net,
}

/// A parsed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    String(String),
    Bool(bool),
    Int(i64),
    Uint(u64),
    List(Vec<String>),
    Map(BTreeMap<String, String>),
    Rlimits(BTreeMap<String, Rlimit>),
    Binds(Vec<BindSpec>),
    Net(NetCfg),
}

impl Value {
    /// Returns the boolean payload, if this is a Bool.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the unsigned payload, if this is a Uint.
    #[must_use]
    pub const fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Uint(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the signed payload, if this is an Int.
    #[must_use]
    pub const fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the string payload, if this is a String.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the list payload, if this is a List.
    #[must_use]
    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }
}

/// Parses a raw wire string according to a kind.
///
/// # Errors
///
/// Returns `InvalidValue` when the string does not belong to the kind's
/// accepted set.
pub fn parse(kind: ValueKind, raw: &str) -> Result<Value> {
    match kind {
        ValueKind::String => Ok(Value::String(raw.to_string())),
        ValueKind::Bool => parse_bool(raw).map(Value::Bool),
        ValueKind::Int => raw
            .trim()
            .parse()
            .map(Value::Int)
            .map_err(|_| PortoError::invalid_value(format!("invalid integer: {raw}"))),
        ValueKind::Uint => raw
            .trim()
            .parse()
            .map(Value::Uint)
            .map_err(|_| PortoError::invalid_value(format!("invalid unsigned integer: {raw}"))),
        ValueKind::List => Ok(Value::List(parse_list(raw))),
        ValueKind::Map => parse_map(raw).map(Value::Map),
        ValueKind::Rlimits => spec::parse_rlimits(raw).map(Value::Rlimits),
        ValueKind::Binds => spec::parse_binds(raw).map(Value::Binds),
        ValueKind::Net => spec::parse_net(raw).map(Value::Net),
    }
}

/// Parses `true`/`false`.
///
/// # Errors
///
/// Returns `InvalidValue` for anything else.
pub fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(PortoError::invalid_value(format!("invalid bool: {raw}"))),
    }
}

/// Splits a semicolon-separated list, trimming and dropping empties.
#[must_use]
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Parses `key: value; key: value` pairs.
///
/// # Errors
///
/// Returns `InvalidValue` when an entry has no colon.
pub fn parse_map(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut map = BTreeMap::new();
    for entry in raw.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        let (key, value) = entry
            .split_once(':')
            .ok_or_else(|| PortoError::invalid_value(format!("invalid map entry: {entry}")))?;
        map.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(map)
}

/// A value in the variant store.
#[derive(Debug, Clone)]
pub struct Variant {
    /// The wire string as the client sent it.
    pub raw: String,
    /// Its parsed form.
    pub value: Value,
}

/// Per-container store of explicitly set values.
///
/// A name that is absent here is *default*: its value is computed from
/// the schema default producer, possibly recursing to the parent when
/// the descriptor carries `PARENT_DEFAULT`.
#[derive(Debug, Clone, Default)]
pub struct VariantSet {
    values: HashMap<String, Variant>,
}

impl VariantSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether the value for `name` is still default.
    #[must_use]
    pub fn is_default(&self, name: &str) -> bool {
        !self.values.contains_key(name)
    }

    /// Stores an explicit value.
    pub fn set(&mut self, name: impl Into<String>, raw: impl Into<String>, value: Value) {
        self.values.insert(
            name.into(),
            Variant {
                raw: raw.into(),
                value,
            },
        );
    }

    /// Returns the stored variant, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Variant> {
        self.values.get(name)
    }

    /// Returns the raw string of an explicitly set value.
    #[must_use]
    pub fn get_raw(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|v| v.raw.as_str())
    }

    /// Drops an explicit value, reverting the name to default.
    pub fn reset(&mut self, name: &str) {
        self.values.remove(name);
    }

    /// Iterates over explicitly set `(name, variant)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Variant)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}
