//! Preflight checker: keyed pass/warn/block verdicts.
//!
//! Composes protection, sidecar, busy-process, battery, filesystem-sanity
//! and size-plausibility checks. Never mutates state and may be re-run
//! freely; only a fresh verdict with a matching key unlocks execution.

use crate::config::{EngineConfig, MIB};
use crate::fs_driver::{self, driver_for};
use crate::inspector::Inspector;
use crate::labels::FsKind;
use crate::size;
use oxidisk_error::{EngineError, EngineResult};
use oxidisk_hal::sidecar::{self, SidecarStatus};
use oxidisk_hal::{BatterySnapshot, BusyProcess, DiskHal, HalError, SidecarInvocation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const FS_SANITY_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OpKind {
    Wipe,
    CreateTable,
    Create,
    Delete,
    Format,
    LabelUuid,
    Check,
    Resize,
    Move,
    Copy,
    Flash,
    Backup,
    WindowsInstall,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Wipe => "wipe",
            OpKind::CreateTable => "create-table",
            OpKind::Create => "create",
            OpKind::Delete => "delete",
            OpKind::Format => "format",
            OpKind::LabelUuid => "label-uuid",
            OpKind::Check => "check",
            OpKind::Resize => "resize",
            OpKind::Move => "move",
            OpKind::Copy => "copy",
            OpKind::Flash => "flash",
            OpKind::Backup => "backup",
            OpKind::WindowsInstall => "windows-install",
        }
    }

    pub fn is_destructive(&self) -> bool {
        !matches!(self, OpKind::Check)
    }

    fn needs_fs_sanity(&self) -> bool {
        matches!(self, OpKind::Resize | OpKind::Move)
    }
}

/// The tuple a verdict is keyed by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PreflightRequest {
    pub operation: OpKind,
    pub target: String,
    pub fs: Option<FsKind>,
    pub new_size: Option<u64>,
}

impl PreflightRequest {
    pub fn new(operation: OpKind, target: &str) -> Self {
        Self {
            operation,
            target: target.trim_start_matches("/dev/").to_string(),
            fs: None,
            new_size: None,
        }
    }

    pub fn with_fs(mut self, fs: FsKind) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn with_new_size(mut self, new_size: u64) -> Self {
        self.new_size = Some(new_size);
        self
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FsCheck {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub ok: bool,
    pub operation: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs: Option<String>,
    pub blockers: Vec<String>,
    pub warnings: Vec<String>,
    pub busy_processes: Vec<BusyProcess>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<BatterySnapshot>,
    pub sidecars: Vec<SidecarStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fs_check: Option<FsCheck>,
}

/// Sidecar binaries an operation family needs for a given filesystem.
pub fn required_sidecars(operation: OpKind, fs: Option<FsKind>) -> Vec<&'static str> {
    let mut names = Vec::new();
    match operation {
        OpKind::Wipe | OpKind::Create | OpKind::Format => {
            if let Some(binary) = fs.and_then(fs_driver::mkfs_binary) {
                names.push(binary);
            }
        }
        OpKind::Resize => match fs {
            Some(FsKind::Ext4) => names.extend(["sgdisk", "resize2fs"]),
            Some(FsKind::Ntfs) => names.extend(["sgdisk", "ntfsresize"]),
            _ => {}
        },
        OpKind::Move | OpKind::Copy => names.push("sgdisk"),
        _ => {}
    }
    names
}

pub fn run_preflight(
    hal: &dyn DiskHal,
    cfg: &EngineConfig,
    req: &PreflightRequest,
) -> EngineResult<Verdict> {
    let info = hal
        .device_info(&req.target)
        .map_err(|_| EngineError::DeviceGone {
            identifier: req.target.clone(),
        })?;
    let fs = req
        .fs
        .or_else(|| info.fs_type.as_deref().and_then(|f| FsKind::parse(f).ok()));

    let mut blockers = Vec::new();
    let mut warnings = Vec::new();

    // 1. Protection.
    if req.operation.is_destructive() && info.internal {
        let inspector = Inspector::new(hal, cfg);
        if let Ok(Some(reason)) = inspector.protection_of(&req.target) {
            blockers.push(reason.tag().to_string());
        }
    }

    // 2. Sidecars.
    let dirs = cfg
        .sidecar_dirs
        .clone()
        .unwrap_or_else(sidecar::default_search_dirs);
    let mut sidecars = Vec::new();
    for name in required_sidecars(req.operation, fs) {
        let Some(spec) = sidecar::catalog_entry(name) else {
            continue;
        };
        let status = sidecar::status_in(&dirs, spec);
        if !status.found {
            blockers.push(format!("sidecar missing: {name}"));
        } else if let (Some(version), Some(floor)) =
            (status.version.as_deref(), spec.recommended_version)
        {
            if version_below(version, floor) {
                warnings.push(format!("{name} is older than the recommended {floor}"));
            }
        }
        sidecars.push(status);
    }

    // 3. Busy processes.
    let mut busy_processes = Vec::new();
    if let Some(mount_point) = info.mount_point.as_deref() {
        match hal.open_processes(mount_point) {
            Ok(processes) if !processes.is_empty() => {
                warnings.push(format!(
                    "volume is in use by {} process(es)",
                    processes.len()
                ));
                busy_processes = processes;
            }
            Ok(_) => {}
            Err(err) => warnings.push(format!("busy-process check failed: {err}")),
        }
    }

    // 4. Battery.
    let battery = match hal.battery() {
        Ok(snapshot) => {
            if snapshot.is_laptop && !snapshot.on_ac {
                match snapshot.percent {
                    Some(percent) if percent < cfg.battery_floor_percent => blockers.push(
                        format!("battery below {}% - connect power", cfg.battery_floor_percent),
                    ),
                    _ => warnings.push("running on battery power".to_string()),
                }
            }
            Some(snapshot)
        }
        Err(err) => {
            warnings.push(format!("battery check failed: {err}"));
            None
        }
    };

    // 5. Filesystem sanity for resize/move.
    let fs_check = if req.operation.needs_fs_sanity() {
        Some(run_fs_sanity(hal, &req.target, fs, &mut blockers, &mut warnings))
    } else {
        None
    };

    // 6. Size and alignment plausibility.
    if let Some(new_size) = req.new_size {
        check_size_plausibility(hal, cfg, req, &info, new_size, &mut blockers, &mut warnings);
    }

    let ok = blockers.is_empty();
    Ok(Verdict {
        ok,
        operation: req.operation.as_str().to_string(),
        target: req.target.clone(),
        fs: fs.map(|f| f.as_str().to_string()),
        blockers,
        warnings,
        busy_processes,
        battery,
        sidecars,
        fs_check,
    })
}

fn run_fs_sanity(
    hal: &dyn DiskHal,
    target: &str,
    fs: Option<FsKind>,
    blockers: &mut Vec<String>,
    warnings: &mut Vec<String>,
) -> FsCheck {
    let result = match fs {
        Some(FsKind::Apfs) | Some(FsKind::Exfat) | Some(FsKind::Fat32) => {
            hal.verify_volume(target)
        }
        Some(kind) => match driver_for(kind).and_then(|d| d.check_command(&format!("/dev/{target}"))) {
            Some((binary, args)) => hal.run_sidecar(
                &SidecarInvocation::new(binary, args).with_timeout(FS_SANITY_TIMEOUT),
                &mut |_| true,
            ),
            None => {
                warnings.push(format!(
                    "no consistency check available for {}",
                    kind.as_str()
                ));
                return FsCheck {
                    ok: true,
                    output: None,
                };
            }
        },
        None => {
            warnings.push("filesystem is unknown; consistency not checked".to_string());
            return FsCheck {
                ok: true,
                output: None,
            };
        }
    };

    match result {
        Ok(output) => FsCheck {
            ok: true,
            output: Some(output),
        },
        Err(HalError::CommandTimeout { .. }) => {
            // Soft deadline exceeded: downgrade, do not block.
            warnings.push("filesystem check timed out".to_string());
            FsCheck {
                ok: true,
                output: None,
            }
        }
        Err(err) => {
            blockers.push("filesystem check reported errors - repair first".to_string());
            FsCheck {
                ok: false,
                output: Some(err.to_string()),
            }
        }
    }
}

fn check_size_plausibility(
    hal: &dyn DiskHal,
    cfg: &EngineConfig,
    req: &PreflightRequest,
    info: &oxidisk_hal::DeviceInfo,
    new_size: u64,
    blockers: &mut Vec<String>,
    warnings: &mut Vec<String>,
) {
    if !size::is_mib_aligned(new_size) {
        warnings.push("size is not aligned to 1 MiB".to_string());
    }

    match req.operation {
        OpKind::Create => {
            let inspector = Inspector::new(hal, cfg);
            let free = inspector
                .device(&req.target)
                .ok()
                .and_then(|d| d.largest_gap().map(|g| g.size))
                .unwrap_or(0);
            if new_size > free {
                blockers.push(format!(
                    "size exceeds free space ({} available)",
                    size::format_bytes(free)
                ));
            }
        }
        OpKind::Resize => {
            if let Some(used) = info.volume_used {
                let min_bytes = ((used as f64) * 1.05).ceil() as u64;
                if new_size < min_bytes {
                    blockers.push("target size is below used space (plus safety margin)".to_string());
                }
            }
            let inspector = Inspector::new(hal, cfg);
            if let Ok(bounds) = inspector.partition_bounds(&req.target) {
                let max_end = bounds.max_start + bounds.size;
                if bounds.offset + new_size > max_end {
                    blockers.push("target size exceeds available space".to_string());
                }
            }
        }
        _ => {
            if new_size < MIB {
                blockers.push("size is below 1 MiB".to_string());
            }
        }
    }
}

fn version_below(version: &str, floor: &str) -> bool {
    let nums = |s: &str| -> Vec<u64> {
        s.split(|c: char| !c.is_ascii_digit())
            .filter(|p| !p.is_empty())
            .filter_map(|p| p.parse().ok())
            .collect()
    };
    let have = nums(version);
    let want = nums(floor);
    if have.is_empty() {
        return false;
    }
    for i in 0..want.len().max(have.len()) {
        let a = have.get(i).copied().unwrap_or(0);
        let b = want.get(i).copied().unwrap_or(0);
        if a != b {
            return a < b;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxidisk_hal::{FakeDisk, FakeHal, FakePartition};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn scratch_cfg(dir: &std::path::Path) -> EngineConfig {
        EngineConfig::scratch(dir)
    }

    fn install_sidecar(dir: &std::path::Path, name: &str) {
        let bin_dir = dir.join("sidecars");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let path = bin_dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
    }

    #[test]
    fn protected_target_blocks_destructive_operations() {
        let tmp = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.add_disk(
            FakeDisk::internal("disk1", 128 * MIB).with_partition(
                FakePartition::new("disk1s1", MIB, 64 * MIB).with_roles(&["System"]),
            ),
        );
        let cfg = scratch_cfg(tmp.path());

        let verdict = run_preflight(
            &hal,
            &cfg,
            &PreflightRequest::new(OpKind::Wipe, "disk1s1"),
        )
        .unwrap();
        assert!(!verdict.ok);
        assert!(verdict.blockers.contains(&"protected:system".to_string()));
    }

    #[test]
    fn ok_iff_no_blockers() {
        let tmp = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.add_disk(FakeDisk::external("disk4", 64 * MIB));
        let cfg = scratch_cfg(tmp.path());

        let verdict = run_preflight(
            &hal,
            &cfg,
            &PreflightRequest::new(OpKind::Wipe, "disk4").with_fs(FsKind::Exfat),
        )
        .unwrap();
        assert_eq!(verdict.ok, verdict.blockers.is_empty());
        assert!(verdict.ok);
    }

    #[test]
    fn missing_mkfs_sidecar_blocks_format() {
        let tmp = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.add_disk(
            FakeDisk::external("disk4", 64 * MIB)
                .with_partition(FakePartition::new("disk4s1", MIB, 32 * MIB)),
        );
        let cfg = scratch_cfg(tmp.path());

        let verdict = run_preflight(
            &hal,
            &cfg,
            &PreflightRequest::new(OpKind::Format, "disk4s1").with_fs(FsKind::Ext4),
        )
        .unwrap();
        assert!(!verdict.ok);
        assert!(verdict
            .blockers
            .iter()
            .any(|b| b.contains("sidecar missing: mkfs.ext4")));
        assert_eq!(verdict.sidecars.len(), 1);
        assert!(!verdict.sidecars[0].found);
    }

    #[test]
    fn installed_sidecar_satisfies_the_gate() {
        let tmp = tempdir().unwrap();
        install_sidecar(tmp.path(), "mkfs.ext4");
        let hal = FakeHal::new();
        hal.add_disk(
            FakeDisk::external("disk4", 64 * MIB)
                .with_partition(FakePartition::new("disk4s1", MIB, 32 * MIB)),
        );
        let cfg = scratch_cfg(tmp.path());

        let verdict = run_preflight(
            &hal,
            &cfg,
            &PreflightRequest::new(OpKind::Format, "disk4s1").with_fs(FsKind::Ext4),
        )
        .unwrap();
        assert!(verdict.ok);
        assert!(verdict.sidecars[0].found);
    }

    #[test]
    fn busy_volume_is_a_warning_with_pid_listing() {
        let tmp = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.add_disk(
            FakeDisk::external("disk4", 64 * MIB).with_partition(
                FakePartition::new("disk4s1", MIB, 32 * MIB).mounted_at("/Volumes/USB"),
            ),
        );
        hal.set_busy(
            "/Volumes/USB",
            vec![oxidisk_hal::BusyProcess {
                pid: 77,
                command: "Finder".to_string(),
            }],
        );
        let cfg = scratch_cfg(tmp.path());

        let verdict = run_preflight(
            &hal,
            &cfg,
            &PreflightRequest::new(OpKind::Format, "disk4s1").with_fs(FsKind::Exfat),
        )
        .unwrap();
        assert!(verdict.ok);
        assert_eq!(verdict.busy_processes.len(), 1);
        assert_eq!(verdict.busy_processes[0].pid, 77);
        assert!(verdict.warnings.iter().any(|w| w.contains("in use")));
    }

    #[test]
    fn low_battery_blocks_but_ac_power_does_not() {
        let tmp = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.add_disk(FakeDisk::external("disk4", 64 * MIB));
        let cfg = scratch_cfg(tmp.path());

        hal.set_battery(oxidisk_hal::BatterySnapshot {
            is_laptop: true,
            on_ac: false,
            percent: Some(12),
        });
        let verdict = run_preflight(
            &hal,
            &cfg,
            &PreflightRequest::new(OpKind::Wipe, "disk4").with_fs(FsKind::Exfat),
        )
        .unwrap();
        assert!(!verdict.ok);
        assert!(verdict.blockers.iter().any(|b| b.contains("battery")));

        hal.set_battery(oxidisk_hal::BatterySnapshot {
            is_laptop: true,
            on_ac: true,
            percent: Some(12),
        });
        let verdict = run_preflight(
            &hal,
            &cfg,
            &PreflightRequest::new(OpKind::Wipe, "disk4").with_fs(FsKind::Exfat),
        )
        .unwrap();
        assert!(verdict.ok);
    }

    #[test]
    fn battery_discharge_above_floor_is_a_warning() {
        let tmp = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.add_disk(FakeDisk::external("disk4", 64 * MIB));
        hal.set_battery(oxidisk_hal::BatterySnapshot {
            is_laptop: true,
            on_ac: false,
            percent: Some(80),
        });
        let cfg = scratch_cfg(tmp.path());

        let verdict = run_preflight(
            &hal,
            &cfg,
            &PreflightRequest::new(OpKind::Wipe, "disk4").with_fs(FsKind::Exfat),
        )
        .unwrap();
        assert!(verdict.ok);
        assert!(verdict.warnings.iter().any(|w| w.contains("battery")));
    }

    #[test]
    fn create_size_is_checked_against_the_largest_gap() {
        let tmp = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.add_disk(
            FakeDisk::external("disk4", 64 * MIB)
                .with_partition(FakePartition::new("disk4s1", MIB, 32 * MIB)),
        );
        let cfg = scratch_cfg(tmp.path());

        // Free gap is 31 MiB (33..64).
        let fits = run_preflight(
            &hal,
            &cfg,
            &PreflightRequest::new(OpKind::Create, "disk4")
                .with_fs(FsKind::Exfat)
                .with_new_size(31 * MIB),
        )
        .unwrap();
        assert!(fits.ok);

        let too_big = run_preflight(
            &hal,
            &cfg,
            &PreflightRequest::new(OpKind::Create, "disk4")
                .with_fs(FsKind::Exfat)
                .with_new_size(31 * MIB + 1),
        )
        .unwrap();
        assert!(!too_big.ok);
        assert!(too_big.blockers.iter().any(|b| b.contains("free space")));
        assert!(too_big.warnings.iter().any(|w| w.contains("aligned")));
    }

    #[test]
    fn resize_sanity_failure_blocks() {
        let tmp = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.add_disk(
            FakeDisk::external("disk4", 64 * MIB)
                .with_partition(FakePartition::new("disk4s1", MIB, 32 * MIB).fs("exfat")),
        );
        hal.script_check("disk4s1", false, "Invalid B-tree node");
        let cfg = scratch_cfg(tmp.path());

        let verdict = run_preflight(
            &hal,
            &cfg,
            &PreflightRequest::new(OpKind::Resize, "disk4s1")
                .with_fs(FsKind::Exfat)
                .with_new_size(16 * MIB),
        )
        .unwrap();
        assert!(!verdict.ok);
        assert_eq!(verdict.fs_check.as_ref().map(|c| c.ok), Some(false));
    }

    #[test]
    fn version_floor_comparison() {
        assert!(version_below("sgdisk version 1.0.5", "1.0.9"));
        assert!(!version_below("sgdisk version 1.0.9", "1.0.9"));
        assert!(!version_below("sgdisk version 1.1", "1.0.9"));
        assert!(!version_below("garbage", "1.0.9"));
    }
}
