//! Strict `MAJOR.MINOR.PATCH` semantic versions.
//!
//! The registry's installed-model identity is `"{base_id}-{version}"`; this
//! module owns parsing, comparison and the versioned-id split. Parsing is
//! deliberately stricter than the full semver grammar: no `v` prefix, no
//! pre-release or build suffix, no leading zeros.

use std::cmp::Ordering;
use std::fmt;

/// A parsed `MAJOR.MINOR.PATCH` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemanticVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemanticVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse a strict `MAJOR.MINOR.PATCH` string.
    ///
    /// Each component is a non-empty ASCII digit sequence with no leading
    /// zeros (the literal `"0"` is allowed). Prefixes, suffixes and extra
    /// components are rejected.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let major = parse_component(parts.next()?)?;
        let minor = parse_component(parts.next()?)?;
        let patch = parse_component(parts.next()?)?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    pub fn is_newer_than(&self, other: &Self) -> bool {
        self > other
    }

    pub fn is_older_than(&self, other: &Self) -> bool {
        self < other
    }
}

impl fmt::Display for SemanticVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

fn parse_component(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

/// Whether `s` is a valid strict semantic version.
pub fn is_valid_semantic_version(s: &str) -> bool {
    SemanticVersion::parse(s).is_some()
}

/// Compare two version strings.
///
/// Returns `None` when either side fails to parse, so callers can tell
/// "unknown" from "equal".
pub fn compare(a: &str, b: &str) -> Option<Ordering> {
    let a = SemanticVersion::parse(a)?;
    let b = SemanticVersion::parse(b)?;
    Some(a.cmp(&b))
}

/// Split a versioned id `"{base_id}-{MAJOR.MINOR.PATCH}"` into its parts.
///
/// The base id may itself contain dashes; only a trailing strict semver is
/// stripped. Returns `None` when the id has no such suffix.
pub fn split_versioned_id(id: &str) -> Option<(&str, SemanticVersion)> {
    let dash = id.rfind('-')?;
    let base = &id[..dash];
    if base.is_empty() {
        return None;
    }
    let version = SemanticVersion::parse(&id[dash + 1..])?;
    Some((base, version))
}

/// Build a versioned id from a base id and version.
pub fn versioned_id(base_id: &str, version: &SemanticVersion) -> String {
    format!("{base_id}-{version}")
}
