//! Sidecar registry: locating and version-probing external binaries.
//!
//! Resolution failures are not fatal here. They only become blockers when an
//! operation that needs the binary is dispatched.

use crate::process;
use crate::{HalError, HalResult};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

/// Catalog entry for one external binary the engine may drive.
#[derive(Debug, Clone, Copy)]
pub struct SidecarSpec {
    pub name: &'static str,
    pub display: &'static str,
    pub version_args: &'static [&'static str],
    /// Versions below this floor work but produce a preflight warning.
    pub recommended_version: Option<&'static str>,
}

/// Everything the engine can ever ask for, in UI display order.
pub const CATALOG: &[SidecarSpec] = &[
    spec("sgdisk", "GPT partition editor", &["--version"], Some("1.0.9")),
    spec("mkfs.ext4", "ext4 formatter", &["-V"], None),
    spec("mkfs.ntfs", "NTFS formatter", &["--version"], None),
    spec("mkfs.btrfs", "btrfs formatter", &["--version"], None),
    spec("mkfs.xfs", "XFS formatter", &["-V"], None),
    spec("mkfs.f2fs", "F2FS formatter", &["-V"], None),
    spec("mkswap", "swap formatter", &["--version"], None),
    spec("resize2fs", "ext4 resizer", &["-V"], None),
    spec("ntfsresize", "NTFS resizer", &["--version"], None),
    spec("e2fsck", "ext4 checker", &["-V"], None),
    spec("ntfsfix", "NTFS checker", &["--version"], None),
    spec("e2label", "ext4 labeler", &["-V"], None),
    spec("tune2fs", "ext4 tuner", &["-V"], None),
    spec("ntfslabel", "NTFS labeler", &["--version"], None),
    spec("swapoff", "swap deactivator", &["--version"], None),
    spec("wipefs", "signature wiper", &["--version"], None),
];

const fn spec(
    name: &'static str,
    display: &'static str,
    version_args: &'static [&'static str],
    recommended_version: Option<&'static str>,
) -> SidecarSpec {
    SidecarSpec {
        name,
        display,
        version_args,
        recommended_version,
    }
}

/// One row of the UI status screen.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarStatus {
    pub name: String,
    pub found: bool,
    pub path: Option<String>,
    pub version: Option<String>,
}

static RESOLVE_CACHE: Lazy<Mutex<HashMap<String, Option<PathBuf>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Directories searched for sidecar binaries, in priority order.
pub fn default_search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            dirs.push(dir.to_path_buf());
            if let Some(parent) = dir.parent() {
                dirs.push(parent.join("Resources").join("sidecars"));
            }
        }
    }
    dirs.push(PathBuf::from("/usr/local/bin"));
    dirs.push(PathBuf::from("/opt/homebrew/bin"));
    for dir in std::env::var("PATH").unwrap_or_default().split(':') {
        if !dir.is_empty() {
            dirs.push(PathBuf::from(dir));
        }
    }
    dirs
}

/// Resolve a binary against explicit directories. No caching.
pub fn resolve_in(dirs: &[PathBuf], name: &str) -> Option<PathBuf> {
    for dir in dirs {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Resolve a binary against the default directories, cached per process.
pub fn resolve(name: &str) -> Option<PathBuf> {
    let mut cache = RESOLVE_CACHE.lock().unwrap_or_else(|e| e.into_inner());
    cache
        .entry(name.to_string())
        .or_insert_with(|| resolve_in(&default_search_dirs(), name))
        .clone()
}

/// Resolve or fail with the error the engine maps to `MissingSidecar`.
pub fn require(name: &str) -> HalResult<PathBuf> {
    resolve(name).ok_or_else(|| HalError::CommandNotFound(name.to_string()))
}

/// Status of every catalog entry, with a best-effort version probe.
pub fn status_all() -> Vec<SidecarStatus> {
    let dirs = default_search_dirs();
    CATALOG
        .iter()
        .map(|spec| status_in(&dirs, spec))
        .collect()
}

pub fn status_in(dirs: &[PathBuf], spec: &SidecarSpec) -> SidecarStatus {
    let path = resolve_in(dirs, spec.name);
    let version = path.as_deref().and_then(|p| probe_version(spec, p));
    SidecarStatus {
        name: spec.name.to_string(),
        found: path.is_some(),
        path: path.map(|p| p.display().to_string()),
        version,
    }
}

pub fn catalog_entry(name: &str) -> Option<&'static SidecarSpec> {
    CATALOG.iter().find(|spec| spec.name == name)
}

fn probe_version(spec: &SidecarSpec, path: &Path) -> Option<String> {
    let args: Vec<String> = spec.version_args.iter().map(|s| s.to_string()).collect();
    let out = process::run_capture(spec.name, path, &args, Duration::from_secs(3)).ok()?;
    out.combined().lines().next().map(|line| line.to_string())
}

fn is_executable(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn create_exec(path: &Path) {
        fs::write(path, "#!/bin/sh\nexit 0\n").unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    #[test]
    fn resolves_executables_in_priority_order() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        create_exec(&first.path().join("sgdisk"));
        create_exec(&second.path().join("sgdisk"));

        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        let found = resolve_in(&dirs, "sgdisk").unwrap();
        assert_eq!(found.parent().unwrap(), first.path());
    }

    #[test]
    fn non_executable_files_are_skipped() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("sgdisk"), "not a binary").unwrap();
        assert!(resolve_in(&[dir.path().to_path_buf()], "sgdisk").is_none());
    }

    #[test]
    fn status_reports_missing_binaries() {
        let dir = tempdir().unwrap();
        let spec = catalog_entry("resize2fs").unwrap();
        let status = status_in(&[dir.path().to_path_buf()], spec);
        assert!(!status.found);
        assert!(status.path.is_none());
    }

    #[test]
    fn catalog_covers_every_operation_family() {
        for name in ["sgdisk", "mkfs.ext4", "resize2fs", "e2fsck", "swapoff"] {
            assert!(catalog_entry(name).is_some(), "missing {name}");
        }
    }
}
