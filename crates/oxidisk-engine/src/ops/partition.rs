//! Partition lifecycle operations: wipe, table, create, delete, format,
//! label/UUID, check, force-unmount, and the APFS volume manager.

use super::{temp_label, OpCtx, OpReport};
use crate::fs_driver::driver_for;
use crate::inspector::Inspector;
use crate::labels::{self, FsKind};
use crate::size;
use oxidisk_error::{EngineError, EngineResult};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TableKind {
    Gpt,
    Mbr,
}

impl TableKind {
    pub fn scheme_arg(&self) -> &'static str {
        match self {
            TableKind::Gpt => "GPT",
            TableKind::Mbr => "MBR",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WipeDeviceRequest {
    pub device_identifier: String,
    pub table_type: TableKind,
    pub format_type: FsKind,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTableRequest {
    pub device_identifier: String,
    pub table_type: TableKind,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePartitionRequest {
    pub device_identifier: String,
    pub format_type: FsKind,
    pub label: String,
    pub size: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletePartitionRequest {
    pub partition_identifier: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatPartitionRequest {
    pub partition_identifier: String,
    pub format_type: FsKind,
    pub label: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetLabelUuidRequest {
    pub partition_identifier: String,
    pub label: Option<String>,
    pub uuid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckPartitionRequest {
    pub partition_identifier: String,
    #[serde(default)]
    pub repair: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForceUnmountRequest {
    #[serde(alias = "deviceIdentifier", alias = "partitionIdentifier")]
    pub identifier: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApfsAddVolumeRequest {
    pub container_identifier: String,
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApfsDeleteVolumeRequest {
    pub volume_identifier: String,
}

pub fn wipe_device(ctx: &OpCtx, req: &WipeDeviceRequest) -> EngineResult<OpReport> {
    let fs = req.format_type;
    labels::validate_label(fs, &req.label)?;
    let device = ctx.norm(&req.device_identifier);
    let scheme = req.table_type.scheme_arg();

    ctx.progress("wipe", 5, Some("Unmounting device"));
    ctx.force_unmount_disk(&device)?;
    ctx.check_cancel()?;

    let report = match fs.diskutil_name() {
        Some(native) => {
            ctx.progress("wipe", 20, Some("Writing partition table"));
            ctx.hal.erase_disk(&device, native, &req.label, scheme)?;
            OpReport::with_details(json!({
                "device": device,
                "format": fs.as_str(),
                "scheme": scheme,
            }))
        }
        None => wipe_with_sidecar_fs(ctx, &device, scheme, fs, &req.label)?,
    };

    ctx.progress("wipe", 95, Some("Refreshing kernel table"));
    ctx.resync(&device);
    ctx.progress("wipe", 100, Some("Wipe complete"));
    Ok(report)
}

/// Allocate as MS-DOS under a scratch label, then reformat with the proper
/// mkfs sidecar. diskutil cannot make these filesystems itself.
fn wipe_with_sidecar_fs(
    ctx: &OpCtx,
    device: &str,
    scheme: &str,
    fs: FsKind,
    label: &str,
) -> EngineResult<OpReport> {
    let scratch = temp_label("OXI_TMP");
    ctx.progress("wipe", 20, Some("Writing partition table"));
    ctx.hal.erase_disk(device, "MS-DOS", &scratch, scheme)?;

    let partition = ctx
        .find_partition_by_label(&scratch)?
        .ok_or_else(|| EngineError::DeviceGone {
            identifier: scratch.clone(),
        })?;
    ctx.hal.unmount(&partition, false)?;
    ctx.check_cancel()?;

    ctx.progress("wipe", 50, Some("Making filesystem"));
    run_mkfs(ctx, fs, &partition, label)?;

    let mut report = OpReport::with_details(json!({
        "device": device,
        "partition": partition,
        "format": fs.as_str(),
        "scheme": scheme,
    }));
    if let Some(warning) = ctx.set_partition_typecode(&partition, fs)? {
        report = report.warn(warning);
    }
    Ok(report)
}

pub fn create_partition_table(ctx: &OpCtx, req: &CreateTableRequest) -> EngineResult<OpReport> {
    let device = ctx.norm(&req.device_identifier);
    let scheme = req.table_type.scheme_arg();

    ctx.force_unmount_disk(&device)?;
    ctx.check_cancel()?;
    ctx.hal.partition_disk_free(&device, scheme)?;
    ctx.resync(&device);

    Ok(OpReport::with_details(json!({
        "device": device,
        "scheme": scheme,
    })))
}

pub fn create_partition(ctx: &OpCtx, req: &CreatePartitionRequest) -> EngineResult<OpReport> {
    let fs = req.format_type;
    labels::validate_label(fs, &req.label)?;
    let device = ctx.norm(&req.device_identifier);
    let bytes = size::canonical_bytes(&req.size)?;

    let snapshot = Inspector::new(ctx.hal, ctx.cfg).device(&device)?;
    let free = snapshot.largest_gap().map(|g| g.size).unwrap_or(0);
    if bytes > free {
        return Err(EngineError::invalid(
            "size",
            format!(
                "requested {} but only {} is free",
                size::format_bytes(bytes),
                size::format_bytes(free)
            ),
        ));
    }

    ctx.force_unmount_disk(&device)?;
    ctx.check_cancel()?;

    let size_arg = size::mib_arg(bytes);
    let report = match fs.diskutil_name() {
        Some(native) => {
            ctx.hal.add_partition(&device, native, &req.label, &size_arg)?;
            OpReport::with_details(json!({
                "device": device,
                "format": fs.as_str(),
                "size": bytes,
            }))
        }
        None => {
            let scratch = temp_label("OXI_TMP");
            ctx.hal
                .add_partition(&device, "MS-DOS", &scratch, &size_arg)?;
            let partition = ctx
                .find_partition_by_label(&scratch)?
                .ok_or_else(|| EngineError::DeviceGone {
                    identifier: scratch.clone(),
                })?;
            ctx.hal.unmount(&partition, false)?;
            run_mkfs(ctx, fs, &partition, &req.label)?;
            let mut report = OpReport::with_details(json!({
                "device": device,
                "partition": partition,
                "format": fs.as_str(),
                "size": bytes,
            }));
            if let Some(warning) = ctx.set_partition_typecode(&partition, fs)? {
                report = report.warn(warning);
            }
            report
        }
    };

    ctx.resync(&device);
    Ok(report)
}

pub fn delete_partition(ctx: &OpCtx, req: &DeletePartitionRequest) -> EngineResult<OpReport> {
    let partition = ctx.norm(&req.partition_identifier);
    let disk = ctx.parent_disk(&partition)?;

    let mut report = OpReport::with_details(json!({ "partition": partition }));
    let snapshot = Inspector::new(ctx.hal, ctx.cfg).device(&disk)?;
    let mounted_peers: Vec<&str> = snapshot
        .partitions
        .iter()
        .filter(|p| p.identifier != partition && p.mount_point.is_some())
        .map(|p| p.identifier.as_str())
        .collect();
    if !mounted_peers.is_empty() {
        report = report.warn(format!(
            "other volumes on this disk are mounted: {}",
            mounted_peers.join(", ")
        ));
    }

    ctx.maybe_swapoff(&partition)?;
    ctx.hal.unmount(&partition, true)?;
    ctx.check_cancel()?;
    ctx.hal.erase_volume(&partition, "free", "none")?;
    ctx.resync(&disk);
    Ok(report)
}

pub fn format_partition(ctx: &OpCtx, req: &FormatPartitionRequest) -> EngineResult<OpReport> {
    let fs = req.format_type;
    labels::validate_label(fs, &req.label)?;
    let partition = ctx.norm(&req.partition_identifier);

    ctx.maybe_swapoff(&partition)?;
    ctx.hal.unmount(&partition, true)?;
    ctx.check_cancel()?;

    ctx.progress("format", 30, Some("Making filesystem"));
    let mut report = match fs.diskutil_name() {
        Some(native) => {
            ctx.hal.erase_volume(&partition, native, &req.label)?;
            OpReport::with_details(json!({
                "device": partition,
                "format": fs.as_str(),
            }))
        }
        None => {
            run_mkfs(ctx, fs, &partition, &req.label)?;
            let mut report = OpReport::with_details(json!({
                "device": partition,
                "format": fs.as_str(),
            }));
            if let Some(warning) = ctx.set_partition_typecode(&partition, fs)? {
                report = report.warn(warning);
            }
            report
        }
    };

    if fs.natively_mountable() {
        if ctx.hal.mount_volume(&partition).is_err() {
            report = report.warn("formatted volume could not be remounted");
        }
    }

    ctx.resync(&partition);
    ctx.progress("format", 100, Some("Format complete"));
    Ok(report)
}

pub fn set_label_uuid(ctx: &OpCtx, req: &SetLabelUuidRequest) -> EngineResult<OpReport> {
    if req.label.is_none() && req.uuid.is_none() {
        return Err(EngineError::invalid("label", "no label or UUID provided"));
    }
    let partition = ctx.norm(&req.partition_identifier);
    let fs = detect_fs(ctx, &partition)?;

    if let Some(label) = req.label.as_deref() {
        labels::validate_label(fs, label)?;
        match fs {
            FsKind::Apfs | FsKind::Fat32 | FsKind::Exfat => {
                ctx.hal.rename_volume(&partition, label)?;
            }
            _ => {
                let driver = driver_for(fs).ok_or_else(|| {
                    EngineError::invalid("fs", format!("no driver for {}", fs.as_str()))
                })?;
                let (binary, args) =
                    driver
                        .label_command(&device_arg(&partition), label)
                        .ok_or_else(|| {
                            EngineError::invalid(
                                "label",
                                format!("{} does not support relabeling", fs.as_str()),
                            )
                        })?;
                ctx.sidecar_stream(binary, args)?;
            }
        }
    }

    if let Some(uuid) = req.uuid.as_deref() {
        labels::validate_uuid(fs, uuid)?;
        match fs {
            FsKind::Apfs => ctx.hal.apfs_change_volume_uuid(&partition, uuid)?,
            _ => {
                let driver = driver_for(fs).ok_or_else(|| {
                    EngineError::invalid("fs", format!("no driver for {}", fs.as_str()))
                })?;
                let (binary, args) = driver
                    .uuid_command(&device_arg(&partition), uuid)
                    .ok_or_else(|| {
                        EngineError::invalid(
                            "uuid",
                            format!("{} does not support UUID changes", fs.as_str()),
                        )
                    })?;
                ctx.sidecar_stream(binary, args)?;
            }
        }
    }

    ctx.resync(&partition);
    Ok(OpReport::with_details(json!({
        "device": partition,
        "fs": fs.as_str(),
        "label": req.label,
        "uuid": req.uuid,
    })))
}

pub fn check_partition(ctx: &OpCtx, req: &CheckPartitionRequest) -> EngineResult<OpReport> {
    let partition = ctx.norm(&req.partition_identifier);
    let fs = detect_fs(ctx, &partition)?;

    let output = match fs {
        FsKind::Apfs | FsKind::Exfat | FsKind::Fat32 => {
            if req.repair {
                ctx.hal.repair_volume(&partition)?
            } else {
                ctx.hal.verify_volume(&partition)?
            }
        }
        _ => {
            let driver = driver_for(fs).ok_or_else(|| EngineError::Unsupported {
                reason: format!("no consistency check for {}", fs.as_str()),
            })?;
            let command = if req.repair {
                driver.repair_command(&device_arg(&partition))
            } else {
                driver.check_command(&device_arg(&partition))
            };
            let (binary, args) = command.ok_or_else(|| EngineError::Unsupported {
                reason: format!("no consistency check for {}", fs.as_str()),
            })?;
            ctx.sidecar_stream(binary, args)?
        }
    };

    Ok(OpReport::with_details(json!({
        "device": partition,
        "fs": fs.as_str(),
        "repaired": req.repair,
        "output": output,
    })))
}

/// Terminate holders, then force the unmount. Survivors fail the operation.
pub fn force_unmount(ctx: &OpCtx, req: &ForceUnmountRequest) -> EngineResult<OpReport> {
    let device = ctx.norm(&req.identifier);
    let info = ctx.hal.device_info(&device)?;

    let mut killed = Vec::new();
    if let Some(mount_point) = info.mount_point.as_deref() {
        let holders = ctx.hal.open_processes(mount_point)?;
        let pids: Vec<i32> = holders.iter().map(|p| p.pid).collect();
        ctx.terminate_processes(&pids);
        killed = holders;

        let survivors = ctx.hal.open_processes(mount_point)?;
        if !survivors.is_empty() {
            let listing: Vec<String> = survivors
                .iter()
                .map(|p| format!("{} ({})", p.pid, p.command))
                .collect();
            return Err(EngineError::Busy {
                operation: format!("force-unmount blocked by {}", listing.join(", ")),
            });
        }
    }

    ctx.force_unmount_disk(&device)?;
    Ok(OpReport::with_details(json!({
        "device": device,
        "killed": killed,
    })))
}

pub fn apfs_add_volume(ctx: &OpCtx, req: &ApfsAddVolumeRequest) -> EngineResult<OpReport> {
    let container = ctx.norm(&req.container_identifier);
    ctx.hal
        .apfs_add_volume(&container, &req.name, req.role.as_deref())?;
    Ok(OpReport::with_details(json!({
        "container": container,
        "name": req.name,
        "role": req.role,
    })))
}

pub fn apfs_delete_volume(ctx: &OpCtx, req: &ApfsDeleteVolumeRequest) -> EngineResult<OpReport> {
    let volume = ctx.norm(&req.volume_identifier);

    // Never delete a volume whose role is in the protection set.
    let containers = ctx.hal.apfs_containers()?;
    for container in &containers {
        if let Some(entry) = container.volumes.iter().find(|v| v.identifier == volume) {
            for role in &entry.roles {
                if ctx.cfg.protected_roles.iter().any(|p| p == role) {
                    let reason = crate::model::ProtectionReason::from_role(role)
                        .map(|r| r.tag().to_string())
                        .unwrap_or_else(|| format!("protected:{}", role.to_lowercase()));
                    return Err(EngineError::Protected { reason });
                }
            }
        }
    }

    ctx.hal.apfs_delete_volume(&volume)?;
    Ok(OpReport::with_details(json!({ "volume": volume })))
}

fn run_mkfs(ctx: &OpCtx, fs: FsKind, partition: &str, label: &str) -> EngineResult<()> {
    let driver = driver_for(fs)
        .ok_or_else(|| EngineError::invalid("fs", format!("no driver for {}", fs.as_str())))?;
    let (binary, args) = driver
        .mkfs_command(&device_arg(partition), label)
        .ok_or_else(|| EngineError::invalid("fs", format!("cannot make {}", fs.as_str())))?;
    ctx.sidecar_stream(binary, args)?;
    Ok(())
}

fn detect_fs(ctx: &OpCtx, partition: &str) -> EngineResult<FsKind> {
    let info = ctx.hal.device_info(partition)?;
    info.fs_type
        .as_deref()
        .and_then(|f| FsKind::parse(f).ok())
        .ok_or_else(|| EngineError::invalid("fs", "filesystem could not be identified"))
}

fn device_arg(identifier: &str) -> String {
    if identifier.starts_with("/dev/") {
        identifier.to_string()
    } else {
        format!("/dev/{identifier}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::OpBus;
    use crate::config::{EngineConfig, MIB};
    use crate::journal::JournalStore;
    use oxidisk_hal::{BusyProcess, FakeDisk, FakeHal, FakePartition, Operation};
    use std::time::Duration;
    use tempfile::tempdir;

    struct Fixture {
        hal: FakeHal,
        cfg: EngineConfig,
        bus: OpBus,
        journal: JournalStore,
        _tmp: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let tmp = tempdir().unwrap();
            let cfg = EngineConfig::scratch(tmp.path());
            let journal = JournalStore::new(
                cfg.journal_path.clone(),
                cfg.checkpoint_bytes,
                Duration::ZERO,
            );
            Self {
                hal: FakeHal::new(),
                cfg,
                bus: OpBus::new(),
                journal,
                _tmp: tmp,
            }
        }

        fn ctx(&self) -> OpCtx<'_> {
            OpCtx {
                hal: &self.hal,
                cfg: &self.cfg,
                bus: &self.bus,
                journal: &self.journal,
            }
        }
    }

    #[test]
    fn wipe_with_native_fs_erases_in_one_step() {
        let fx = Fixture::new();
        fx.hal.add_disk(FakeDisk::external("disk4", 64 * MIB));

        let req = WipeDeviceRequest {
            device_identifier: "disk4".to_string(),
            table_type: TableKind::Gpt,
            format_type: FsKind::Exfat,
            label: "USB".to_string(),
        };
        wipe_device(&fx.ctx(), &req).unwrap();

        assert!(fx.hal.has_operation(|op| matches!(
            op,
            Operation::EraseDisk { fs, scheme, .. } if fs == "ExFAT" && scheme == "GPT"
        )));
        assert!(fx
            .hal
            .has_operation(|op| matches!(op, Operation::RepairDiskQuiet { .. })));
    }

    #[test]
    fn wipe_with_ext4_reformats_the_scratch_partition() {
        let fx = Fixture::new();
        fx.hal.add_disk(FakeDisk::external("disk4", 64 * MIB));

        let req = WipeDeviceRequest {
            device_identifier: "disk4".to_string(),
            table_type: TableKind::Gpt,
            format_type: FsKind::Ext4,
            label: "data".to_string(),
        };
        let report = wipe_device(&fx.ctx(), &req).unwrap();

        assert!(fx.hal.has_operation(|op| matches!(
            op,
            Operation::Sidecar { binary, .. } if binary == "mkfs.ext4"
        )));
        assert!(fx.hal.has_operation(|op| matches!(
            op,
            Operation::Sidecar { binary, .. } if binary == "sgdisk"
        )));
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn wipe_rejects_bad_labels_before_touching_the_disk() {
        let fx = Fixture::new();
        fx.hal.add_disk(FakeDisk::external("disk4", 64 * MIB));

        let req = WipeDeviceRequest {
            device_identifier: "disk4".to_string(),
            table_type: TableKind::Gpt,
            format_type: FsKind::Fat32,
            label: "too-long-label-here".to_string(),
        };
        let err = wipe_device(&fx.ctx(), &req).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput { ref field, .. } if field == "label"));
        assert!(fx.hal.operations().is_empty());
    }

    #[test]
    fn create_partition_fails_when_size_exceeds_free_space() {
        let fx = Fixture::new();
        fx.hal.add_disk(
            FakeDisk::external("disk4", 64 * MIB)
                .with_partition(FakePartition::new("disk4s1", MIB, 32 * MIB)),
        );

        // Largest gap is 31 MiB (33..64).
        let ok = CreatePartitionRequest {
            device_identifier: "disk4".to_string(),
            format_type: FsKind::Exfat,
            label: "NEW".to_string(),
            size: "31m".to_string(),
        };
        create_partition(&fx.ctx(), &ok).unwrap();

        let too_big = CreatePartitionRequest {
            size: "32m".to_string(),
            label: "NEW2".to_string(),
            ..ok
        };
        let err = create_partition(&fx.ctx(), &too_big).unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput { ref field, .. } if field == "size"));
    }

    #[test]
    fn delete_warns_about_mounted_peers() {
        let fx = Fixture::new();
        fx.hal.add_disk(
            FakeDisk::external("disk4", 64 * MIB)
                .with_partition(FakePartition::new("disk4s1", MIB, 16 * MIB))
                .with_partition(
                    FakePartition::new("disk4s2", 20 * MIB, 16 * MIB).mounted_at("/Volumes/KEEP"),
                ),
        );

        let report = delete_partition(
            &fx.ctx(),
            &DeletePartitionRequest {
                partition_identifier: "disk4s1".to_string(),
            },
        )
        .unwrap();
        assert!(report.warnings.iter().any(|w| w.contains("disk4s2")));
        assert!(fx.hal.partition("disk4s1").is_none());
    }

    #[test]
    fn format_remounts_native_filesystems() {
        let fx = Fixture::new();
        fx.hal.add_disk(
            FakeDisk::external("disk4", 64 * MIB)
                .with_partition(FakePartition::new("disk4s1", MIB, 32 * MIB)),
        );

        format_partition(
            &fx.ctx(),
            &FormatPartitionRequest {
                partition_identifier: "disk4s1".to_string(),
                format_type: FsKind::Exfat,
                label: "FRESH".to_string(),
            },
        )
        .unwrap();

        assert!(fx
            .hal
            .has_operation(|op| matches!(op, Operation::MountVolume { device } if device == "disk4s1")));
        assert_eq!(fx.hal.partition("disk4s1").unwrap().name, "FRESH");
    }

    #[test]
    fn set_label_uuid_requires_at_least_one_field() {
        let fx = Fixture::new();
        let err = set_label_uuid(
            &fx.ctx(),
            &SetLabelUuidRequest {
                partition_identifier: "disk4s1".to_string(),
                label: None,
                uuid: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput { .. }));
    }

    #[test]
    fn set_label_on_ext4_goes_through_the_driver() {
        let fx = Fixture::new();
        fx.hal.add_disk(
            FakeDisk::external("disk4", 64 * MIB)
                .with_partition(FakePartition::new("disk4s1", MIB, 32 * MIB).fs("ext4")),
        );

        set_label_uuid(
            &fx.ctx(),
            &SetLabelUuidRequest {
                partition_identifier: "disk4s1".to_string(),
                label: Some("data".to_string()),
                uuid: Some("random".to_string()),
            },
        )
        .unwrap();

        assert!(fx.hal.has_operation(|op| matches!(
            op,
            Operation::Sidecar { binary, .. } if binary == "e2label"
        )));
        assert!(fx.hal.has_operation(|op| matches!(
            op,
            Operation::Sidecar { binary, args } if binary == "tune2fs" && args.contains(&"random".to_string())
        )));
    }

    #[test]
    fn fat_uuid_changes_are_rejected() {
        let fx = Fixture::new();
        fx.hal.add_disk(
            FakeDisk::external("disk4", 64 * MIB)
                .with_partition(FakePartition::new("disk4s1", MIB, 32 * MIB).fs("fat32")),
        );

        let err = set_label_uuid(
            &fx.ctx(),
            &SetLabelUuidRequest {
                partition_identifier: "disk4s1".to_string(),
                label: None,
                uuid: Some("0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9".to_string()),
            },
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput { ref field, .. } if field == "uuid"));
    }

    #[test]
    fn check_partition_uses_the_platform_tool_for_native_fs() {
        let fx = Fixture::new();
        fx.hal.add_disk(
            FakeDisk::external("disk4", 64 * MIB)
                .with_partition(FakePartition::new("disk4s1", MIB, 32 * MIB).fs("apfs")),
        );

        check_partition(
            &fx.ctx(),
            &CheckPartitionRequest {
                partition_identifier: "disk4s1".to_string(),
                repair: false,
            },
        )
        .unwrap();
        assert!(fx
            .hal
            .has_operation(|op| matches!(op, Operation::VerifyVolume { .. })));

        check_partition(
            &fx.ctx(),
            &CheckPartitionRequest {
                partition_identifier: "disk4s1".to_string(),
                repair: true,
            },
        )
        .unwrap();
        assert!(fx
            .hal
            .has_operation(|op| matches!(op, Operation::RepairVolume { .. })));
    }

    #[test]
    fn force_unmount_escalates_and_reports_killed_processes() {
        let fx = Fixture::new();
        fx.hal.add_disk(
            FakeDisk::external("disk4", 64 * MIB).with_partition(
                FakePartition::new("disk4s1", MIB, 32 * MIB).mounted_at("/Volumes/USB"),
            ),
        );
        fx.hal.set_busy(
            "/Volumes/USB",
            vec![BusyProcess {
                pid: 4242,
                command: "mdworker".to_string(),
            }],
        );

        let report = force_unmount(
            &fx.ctx(),
            &ForceUnmountRequest {
                identifier: "disk4s1".to_string(),
            },
        )
        .unwrap();

        let details = report.details.unwrap();
        assert_eq!(details["killed"][0]["pid"], 4242);
        assert!(fx
            .hal
            .has_operation(|op| matches!(op, Operation::Signal { pid: 4242, .. })));
        assert!(fx
            .hal
            .has_operation(|op| matches!(op, Operation::UnmountDisk { force: true, .. })));
    }

    #[test]
    fn force_unmount_fails_when_processes_survive() {
        let fx = Fixture::new();
        fx.hal.keep_busy_after_kill();
        fx.hal.add_disk(
            FakeDisk::external("disk4", 64 * MIB).with_partition(
                FakePartition::new("disk4s1", MIB, 32 * MIB).mounted_at("/Volumes/USB"),
            ),
        );
        fx.hal.set_busy(
            "/Volumes/USB",
            vec![BusyProcess {
                pid: 4242,
                command: "mdworker".to_string(),
            }],
        );

        let err = force_unmount(
            &fx.ctx(),
            &ForceUnmountRequest {
                identifier: "disk4s1".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Busy { .. }));
    }

    #[test]
    fn apfs_delete_refuses_protected_roles() {
        let fx = Fixture::new();
        fx.hal.set_containers(vec![oxidisk_hal::RawApfsContainer {
            reference: "disk3".to_string(),
            volumes: vec![
                oxidisk_hal::RawApfsVolume {
                    identifier: "disk3s1".to_string(),
                    name: "Macintosh HD".to_string(),
                    roles: vec!["System".to_string()],
                    ..Default::default()
                },
                oxidisk_hal::RawApfsVolume {
                    identifier: "disk3s2".to_string(),
                    name: "Scratch".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }]);

        let err = apfs_delete_volume(
            &fx.ctx(),
            &ApfsDeleteVolumeRequest {
                volume_identifier: "disk3s1".to_string(),
            },
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Protected { ref reason } if reason == "protected:system"));

        apfs_delete_volume(
            &fx.ctx(),
            &ApfsDeleteVolumeRequest {
                volume_identifier: "disk3s2".to_string(),
            },
        )
        .unwrap();
    }
}
