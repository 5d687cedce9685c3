// Suite version ordering and configuration/profile version matching.

use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid version string '{0}'")]
pub struct VersionFormatError(pub String);

/// Split `major[.minor[.micro]]` into its numeric components.
fn components(version: &str) -> Result<Vec<&str>, VersionFormatError> {
    let parts: Vec<&str> = version.split('.').collect();
    let well_formed = parts.len() <= 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()));
    if !well_formed {
        return Err(VersionFormatError(version.to_string()));
    }
    Ok(parts)
}

/// Accepts `\d+(\.\d+(\.\d+)?)?` only.
pub fn check_version_format(version: &str) -> Result<(), VersionFormatError> {
    components(version).map(|_| ())
}

// Numeric compare of digit strings of any length (no overflow on long components).
fn compare_component(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Compare two suite versions component by component; missing trailing components count as 0.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering, VersionFormatError> {
    let left = components(a)?;
    let right = components(b)?;
    for i in 0..3 {
        let l = left.get(i).copied().unwrap_or("0");
        let r = right.get(i).copied().unwrap_or("0");
        match compare_component(l, r) {
            Ordering::Equal => continue,
            other => return Ok(other),
        }
    }
    Ok(Ordering::Equal)
}

/// Does the device capability `available` (e.g. `MIDP-2.1`) satisfy `requested` (e.g. `MIDP-2.0`)?
///
/// Both sides are `NAME` or `NAME-x.y`: base names must be equal and the available version must
/// be at least the requested one. A requested name without a version matches any version.
pub fn matches_named_version(requested: &str, available: &str) -> bool {
    let (req_name, req_version) = split_named_version(requested.trim());
    let (avail_name, avail_version) = split_named_version(available.trim());
    if req_name != avail_name {
        return false;
    }
    match (req_version, avail_version) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(req), Some(avail)) => {
            matches!(compare_versions(avail, req), Ok(Ordering::Greater | Ordering::Equal))
        }
    }
}

fn split_named_version(value: &str) -> (&str, Option<&str>) {
    match value.rsplit_once('-') {
        Some((name, version)) if check_version_format(version).is_ok() => (name, Some(version)),
        _ => (value, None),
    }
}
