//! Version extraction from remote probe output and version ordering.
//!
//! Probe output is free-form: lines are either `key:value` pairs or a bare
//! version token. Anything that does not match is skipped.

use std::cmp::Ordering;

use crate::model::{DistInfo, InstalledVersions};

/// Package a parsed line describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionKey {
    Drbd,
    DrbdUtils,
    Heartbeat,
    Pacemaker,
    Corosync,
    Openais,
}

impl VersionKey {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "drbd" | "drbd-km" | "version" => Some(Self::Drbd),
            "drbd-utils" => Some(Self::DrbdUtils),
            "hb" | "heartbeat" => Some(Self::Heartbeat),
            "pm" | "pacemaker" => Some(Self::Pacemaker),
            "cs" | "corosync" => Some(Self::Corosync),
            "ais" | "openais" => Some(Self::Openais),
            _ => None,
        }
    }
}

/// Parse one output line into a (package, version) pair.
pub fn parse_line(line: &str) -> Option<(VersionKey, String)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    if let Some((tag, value)) = line.split_once(':') {
        let key = VersionKey::from_tag(tag)?;
        let token = strip_epoch(value.split_whitespace().next()?);
        return looks_like_version(token).then(|| (key, token.to_string()));
    }
    let mut tokens = line.split_whitespace();
    let token = tokens.next()?;
    if tokens.next().is_none() && looks_like_version(token) {
        return Some((VersionKey::Drbd, token.to_string()));
    }
    None
}

/// Collect every recognized version from a block of probe output.
pub fn parse_installation_info(output: &str) -> InstalledVersions {
    let mut versions = InstalledVersions::default();
    for (key, version) in output.lines().filter_map(parse_line) {
        let slot = match key {
            VersionKey::Drbd => &mut versions.drbd,
            VersionKey::DrbdUtils => &mut versions.drbd_utils,
            VersionKey::Heartbeat => &mut versions.heartbeat,
            VersionKey::Pacemaker => &mut versions.pacemaker,
            VersionKey::Corosync => &mut versions.corosync,
            VersionKey::Openais => &mut versions.openais,
        };
        // First occurrence wins; helpers sometimes repeat lines.
        if slot.is_none() {
            *slot = Some(version);
        }
    }
    versions
}

/// Parse the `key:value` lines printed by the distribution detection command.
pub fn parse_dist_info(output: &str) -> DistInfo {
    let mut info = DistInfo::default();
    for line in output.lines() {
        let Some((tag, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if value.is_empty() {
            continue;
        }
        let slot = match tag.trim() {
            "dist" => &mut info.dist,
            "version" => &mut info.version,
            "arch" => &mut info.arch,
            "kernel" => &mut info.kernel,
            _ => continue,
        };
        *slot = Some(value.trim_matches('"').to_string());
    }
    normalize_dist(&mut info);
    info
}

/// Drop a Debian package epoch (`1:3.0.5` becomes `3.0.5`).
fn strip_epoch(token: &str) -> &str {
    match token.split_once(':') {
        Some((epoch, version))
            if !epoch.is_empty() && epoch.chars().all(|ch| ch.is_ascii_digit()) =>
        {
            version
        }
        _ => token,
    }
}

/// Map os-release naming onto the resource table's naming: SUSE releases
/// live under `suse` with versions such as `sles10` or `OPENSUSE11_1`.
fn normalize_dist(info: &mut DistInfo) {
    let Some(id) = info.dist.as_deref().map(str::to_ascii_lowercase) else {
        return;
    };
    let version = info.version.as_deref().map(str::trim);
    let mapped = if id == "sles" || id == "sled" {
        version.map(|version| {
            let major = version.split('.').next().unwrap_or(version);
            format!("sles{major}")
        })
    } else if id.starts_with("opensuse") {
        version.map(|version| format!("OPENSUSE{}", version.replace('.', "_")))
    } else {
        return;
    };
    info.dist = Some("suse".to_string());
    if mapped.is_some() {
        info.version = mapped;
    }
}

fn looks_like_version(token: &str) -> bool {
    token.starts_with(|ch: char| ch.is_ascii_digit())
        && token.contains('.')
        && token
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_' | '+' | '~'))
}

/// A version used for comparison together with the text shown to users.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedVersion {
    pub compare: String,
    pub display: String,
}

/// Normalize a heartbeat version for the host's distribution release.
///
/// Heartbeat 2.1.3 as shipped with sles10 carries the 2.1.4 fixes.
pub fn normalize_heartbeat(version: &str, dist_version: Option<&str>) -> NormalizedVersion {
    if version == "2.1.3" && dist_version == Some("sles10") {
        return NormalizedVersion {
            compare: "2.1.4".to_string(),
            display: "2.1.3 (2.1.4)".to_string(),
        };
    }
    NormalizedVersion {
        compare: version.to_string(),
        display: version.to_string(),
    }
}

/// Order dotted versions numerically segment by segment.
///
/// Missing trailing segments count as zero and a segment with a suffix
/// (`1rc2`) sorts before the plain release (`1`).
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let left: Vec<&str> = split_segments(left);
    let right: Vec<&str> = split_segments(right);
    let len = left.len().max(right.len());
    for index in 0..len {
        let a = left.get(index).copied().unwrap_or("0");
        let b = right.get(index).copied().unwrap_or("0");
        let ordering = compare_segment(a, b);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn split_segments(version: &str) -> Vec<&str> {
    version
        .trim()
        .split(['.', '-'])
        .filter(|segment| !segment.is_empty())
        .collect()
}

fn compare_segment(a: &str, b: &str) -> Ordering {
    let (a_num, a_suffix) = split_numeric(a);
    let (b_num, b_suffix) = split_numeric(b);
    a_num.cmp(&b_num).then_with(|| match (a_suffix.is_empty(), b_suffix.is_empty()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a_suffix.cmp(b_suffix),
    })
}

fn split_numeric(segment: &str) -> (u64, &str) {
    let digits = segment
        .find(|ch: char| !ch.is_ascii_digit())
        .unwrap_or(segment.len());
    let number = segment[..digits].parse::<u64>().unwrap_or(0);
    (number, &segment[digits..])
}

/// True when `installed` is older than `latest`.
pub fn is_upgrade_available(installed: &str, latest: &str) -> bool {
    compare_versions(installed, latest) == Ordering::Less
}
