//! Plugin names and their mapping onto the discovery directory.
//!
//! A plugin name is `lookup` or `lookup/subtype`. The lookup part is exactly
//! the socket's file name inside the discovery directory; the subtype only
//! routes calls inside one listening endpoint and never changes which file a
//! name resolves to.
//!
//! Everything here is pure: no filesystem access, no logging.

use std::fmt;
use std::path::{Path, PathBuf};

use super::error::{DiscoveryError, Result};
use crate::constants::MAX_NAME_LEN;

/// Separator between the lookup name and the optional subtype.
pub const SUBTYPE_SEPARATOR: char = '/';

/// A validated plugin name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PluginName {
    raw: String,
    lookup_len: usize,
}

impl PluginName {
    /// Parse and validate a plugin name.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::InvalidName`] when the lookup part is empty,
    /// is `.` or `..`, is longer than a file name may be, the name contains a
    /// NUL byte, or a separator is followed by an empty subtype.
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = |reason: &'static str| DiscoveryError::InvalidName {
            name: name.to_string(),
            reason,
        };

        if name.contains('\0') {
            return Err(invalid("contains a NUL byte"));
        }

        let (lookup, subtype) = split_subtype(name);
        match lookup {
            "" => return Err(invalid("empty plugin name")),
            "." | ".." => return Err(invalid("reserved path component")),
            _ => {}
        }
        if lookup.len() > MAX_NAME_LEN {
            return Err(invalid("plugin name longer than a file name allows"));
        }
        if subtype == Some("") {
            return Err(invalid("empty subtype after separator"));
        }

        Ok(Self {
            raw: name.to_string(),
            lookup_len: lookup.len(),
        })
    }

    /// The lookup part, i.e. the socket file name.
    pub fn lookup(&self) -> &str {
        &self.raw[..self.lookup_len]
    }

    /// The subtype, if the name carries one.
    pub fn subtype(&self) -> Option<&str> {
        split_subtype(&self.raw).1
    }

    /// The full name as given.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Path of this plugin's socket inside `dir`.
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.lookup())
    }
}

impl fmt::Display for PluginName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl AsRef<str> for PluginName {
    fn as_ref(&self) -> &str {
        &self.raw
    }
}

impl std::str::FromStr for PluginName {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split `name` into its lookup part and optional subtype.
///
/// Only the first separator splits; anything after it belongs to the subtype.
pub fn split_subtype(name: &str) -> (&str, Option<&str>) {
    match name.split_once(SUBTYPE_SEPARATOR) {
        Some((lookup, subtype)) => (lookup, Some(subtype)),
        None => (name, None),
    }
}

/// Socket path for `name` under the discovery directory `dir`.
///
/// # Errors
///
/// Returns [`DiscoveryError::InvalidName`] if `name` does not parse.
pub fn path_for(dir: &Path, name: &str) -> Result<PathBuf> {
    Ok(PluginName::parse(name)?.path_in(dir))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_without_subtype() {
        assert_eq!(split_subtype("worker"), ("worker", None));
    }

    #[test]
    fn test_split_with_subtype() {
        assert_eq!(split_subtype("group/workers"), ("group", Some("workers")));
        assert_eq!(split_subtype("a/b/c"), ("a", Some("b/c")));
    }

    #[test]
    fn test_parse_keeps_full_name() {
        let name = PluginName::parse("instance-aws/ec2").unwrap();
        assert_eq!(name.lookup(), "instance-aws");
        assert_eq!(name.subtype(), Some("ec2"));
        assert_eq!(name.to_string(), "instance-aws/ec2");
    }

    #[test]
    fn test_parse_rejects_bad_names() {
        for bad in ["", "/x", ".", "..", "../x", "a/", "nul\0byte"] {
            let err = PluginName::parse(bad).unwrap_err();
            assert!(err.is_invalid_name(), "expected InvalidName for {bad:?}, got {err}");
        }
    }

    #[test]
    fn test_parse_rejects_overlong_lookup() {
        let err = PluginName::parse(&"x".repeat(MAX_NAME_LEN + 1)).unwrap_err();
        assert!(err.is_invalid_name(), "got: {err}");

        // The limit applies to the lookup part only.
        let name = PluginName::parse(&format!("{}/{}", "x".repeat(MAX_NAME_LEN), "y".repeat(300))).unwrap();
        assert_eq!(name.lookup().len(), MAX_NAME_LEN);
    }

    #[test]
    fn test_path_for_uses_lookup_only() {
        let dir = Path::new("/run/plugins");
        assert_eq!(path_for(dir, "group").unwrap(), dir.join("group"));
        assert_eq!(path_for(dir, "group/workers").unwrap(), dir.join("group"));
    }

    #[test]
    fn test_path_for_is_injective_over_lookups() {
        let dir = Path::new("/run/plugins");
        let a = path_for(dir, "flavor-swarm").unwrap();
        let b = path_for(dir, "flavor-vanilla").unwrap();
        assert_ne!(a, b);
    }
}
