//! Package identity: a normalized (id, version) pair.
//!
//! Ids compare case-insensitively; versions compare in normalized form, so
//! `Foo 1.0` and `foo 1.0.0+build.7` are the same identity.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use semver::Prerelease;
use serde::{Deserialize, Serialize};

use crate::error::{PushError, Result};

pub const MAX_ID_LEN: usize = 100;

/// Immutable package identity. The `id` keeps the casing it was first seen
/// with; equality and hashing use the lowercase form.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PackageIdentity {
    id: String,
    version: String,
}

impl PackageIdentity {
    /// Validate and normalize a raw id/version pair.
    pub fn parse(id: &str, version: &str) -> Result<Self> {
        Ok(Self {
            id: normalize_id(id)?,
            version: normalize_version(version)?,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Lowercase id, used for storage paths and lookups.
    pub fn id_lower(&self) -> String {
        self.id.to_ascii_lowercase()
    }

    /// Ledger key: `"{id_lower}/{version}"`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.id_lower(), self.version)
    }

    /// File stem for the stored artifact: `"{id_lower}.{version}"`.
    pub fn file_stem(&self) -> String {
        format!("{}.{}", self.id_lower(), self.version)
    }
}

impl PartialEq for PackageIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id.eq_ignore_ascii_case(&other.id) && self.version == other.version
    }
}

impl Eq for PackageIdentity {}

impl Hash for PackageIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

impl fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.id, self.version)
    }
}

/// Trim and validate a package id. Casing is preserved.
pub fn normalize_id(raw: &str) -> Result<String> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(PushError::InvalidPayload("package id is empty".to_string()));
    }
    if id.len() > MAX_ID_LEN {
        return Err(PushError::InvalidPayload(format!(
            "package id is longer than {} characters",
            MAX_ID_LEN
        )));
    }
    let first = id.chars().next().unwrap_or('.');
    if !first.is_ascii_alphanumeric() {
        return Err(PushError::InvalidPayload(format!(
            "package id '{}' must start with a letter or digit",
            id
        )));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')))
    {
        return Err(PushError::InvalidPayload(format!(
            "package id '{}' contains invalid character '{}'",
            id, bad
        )));
    }
    Ok(id.to_string())
}

/// Normalize a version string.
///
/// 1 to 4 numeric parts, padded to 3; a zero 4th part is dropped; build
/// metadata is stripped; prerelease labels are lowercased.
pub fn normalize_version(raw: &str) -> Result<String> {
    let raw = raw.trim();
    let invalid = |why: &str| PushError::InvalidPayload(format!("invalid version '{}': {}", raw, why));

    if raw.is_empty() {
        return Err(invalid("empty"));
    }
    let without_build = raw.split_once('+').map(|(v, _)| v).unwrap_or(raw);
    let (core, pre) = match without_build.split_once('-') {
        Some((core, pre)) => (core, Some(pre)),
        None => (without_build, None),
    };

    let mut parts: Vec<u64> = Vec::with_capacity(4);
    for part in core.split('.') {
        if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
            return Err(invalid("version parts must be numeric"));
        }
        if part.len() > 1 && part.starts_with('0') {
            return Err(invalid("leading zeros are not allowed"));
        }
        let n = part.parse::<u64>().map_err(|_| invalid("version part out of range"))?;
        parts.push(n);
    }
    if parts.is_empty() || parts.len() > 4 {
        return Err(invalid("expected 1 to 4 numeric parts"));
    }
    while parts.len() < 3 {
        parts.push(0);
    }
    if parts.len() == 4 && parts[3] == 0 {
        parts.pop();
    }

    let mut out = parts
        .iter()
        .map(|p| p.to_string())
        .collect::<Vec<_>>()
        .join(".");

    if let Some(pre) = pre {
        let pre = pre.to_ascii_lowercase();
        if pre.is_empty() {
            return Err(invalid("empty prerelease label"));
        }
        Prerelease::new(&pre).map_err(|e| invalid(&e.to_string()))?;
        out.push('-');
        out.push_str(&pre);
    }
    Ok(out)
}

/// Order two normalized versions: numeric parts first, then a release
/// sorts after any of its prereleases.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    fn split(v: &str) -> ([u64; 4], Option<Prerelease>) {
        let (core, pre) = match v.split_once('-') {
            Some((core, pre)) => (core, Prerelease::new(pre).ok()),
            None => (v, None),
        };
        let mut nums = [0u64; 4];
        for (slot, part) in nums.iter_mut().zip(core.split('.')) {
            *slot = part.parse().unwrap_or(0);
        }
        (nums, pre)
    }

    let (an, ap) = split(a);
    let (bn, bp) = split(b);
    an.cmp(&bn).then_with(|| match (ap, bp) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(x), Some(y)) => x.cmp(&y),
    })
}
