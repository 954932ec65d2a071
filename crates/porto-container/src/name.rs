//! Container name validation and path mapping.

use porto_error::{PortoError, Result};

use crate::ROOT_NAME;

/// Longest accepted container name.
const MAX_NAME_LEN: usize = 128;

/// Validates a client-supplied container name.
///
/// Names are dot-separated components of `[a-zA-Z0-9_-]`; the root name
/// is never accepted from clients.
///
/// # Errors
///
/// Returns `InvalidValue` with the offending detail.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == ROOT_NAME {
        return Err(PortoError::invalid_value(format!(
            "invalid container name: {name:?}"
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(PortoError::invalid_value(format!(
            "container name longer than {MAX_NAME_LEN} characters"
        )));
    }

    for component in name.split('.') {
        if component.is_empty() {
            return Err(PortoError::invalid_value(format!(
                "empty component in container name: {name}"
            )));
        }
        if !component
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(PortoError::invalid_value(format!(
                "forbidden character in container name: {name}"
            )));
        }
    }
    Ok(())
}

/// Returns the parent name, or the root for a single-component name.
#[must_use]
pub fn parent_name(name: &str) -> &str {
    name.rsplit_once('.').map_or(ROOT_NAME, |(parent, _)| parent)
}

/// Returns whether `descendant` sits strictly below `ancestor`.
#[must_use]
pub fn is_descendant(ancestor: &str, descendant: &str) -> bool {
    if ancestor == ROOT_NAME {
        return descendant != ROOT_NAME;
    }
    descendant.len() > ancestor.len()
        && descendant.starts_with(ancestor)
        && descendant.as_bytes()[ancestor.len()] == b'.'
}

/// Maps a container name to its relative cgroup path; the tree nesting
/// mirrors the container tree.
#[must_use]
pub fn cgroup_path(name: &str) -> String {
    if name == ROOT_NAME {
        String::new()
    } else {
        name.replace('.', "/")
    }
}

/// Escapes a name for use as an on-disk node file name.
#[must_use]
pub fn escape_name(name: &str) -> String {
    name.replace('/', "%2F")
}

/// Reverses [`escape_name`].
#[must_use]
pub fn unescape_name(node: &str) -> String {
    node.replace("%2F", "/")
}

/// Matches a shell-style mask with `*` and `?` wildcards.
#[must_use]
pub fn matches_mask(name: &str, mask: &str) -> bool {
    fn matches(name: &[u8], mask: &[u8]) -> bool {
        match (mask.first(), name.first()) {
            (None, None) => true,
            (None, Some(_)) => false,
            (Some(b'*'), _) => {
                matches(name, &mask[1..]) || (!name.is_empty() && matches(&name[1..], mask))
            }
            (Some(b'?'), Some(_)) => matches(&name[1..], &mask[1..]),
            (Some(&m), Some(&c)) if m == c => matches(&name[1..], &mask[1..]),
            _ => false,
        }
    }
    matches(name.as_bytes(), mask.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_names() {
        validate_name("a").unwrap();
        validate_name("parent.child.leaf").unwrap();
        validate_name("web-app_01").unwrap();
    }

    #[test]
    fn rejects_malformed_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("/").is_err());
        assert!(validate_name("a..b").is_err());
        assert!(validate_name(".a").is_err());
        assert!(validate_name("a.").is_err());
        assert!(validate_name("a b").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name(&"x".repeat(129)).is_err());
    }

    #[test]
    fn parent_resolution() {
        assert_eq!(parent_name("a"), ROOT_NAME);
        assert_eq!(parent_name("a.b"), "a");
        assert_eq!(parent_name("a.b.c"), "a.b");
    }

    #[test]
    fn descendant_checks() {
        assert!(is_descendant("a", "a.b"));
        assert!(is_descendant("a", "a.b.c"));
        assert!(is_descendant(ROOT_NAME, "a"));
        assert!(!is_descendant("a", "a"));
        assert!(!is_descendant("a", "ab"));
        assert!(!is_descendant("a.b", "a"));
    }

    #[test]
    fn cgroup_paths_nest() {
        assert_eq!(cgroup_path(ROOT_NAME), "");
        assert_eq!(cgroup_path("a"), "a");
        assert_eq!(cgroup_path("a.b.c"), "a/b/c");
    }

    #[test]
    fn mask_matching() {
        assert!(matches_mask("a.b", "a.*"));
        assert!(matches_mask("abc", "a?c"));
        assert!(matches_mask("anything", "*"));
        assert!(!matches_mask("b.c", "a.*"));
        assert!(matches_mask("a", "a"));
        assert!(!matches_mask("a", "a.*"));
    }

    #[test]
    fn escape_round_trip() {
        assert_eq!(escape_name("a.b"), "a.b");
        assert_eq!(unescape_name(&escape_name("a/b")), "a/b");
    }
}
