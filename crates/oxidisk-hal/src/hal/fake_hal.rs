//! Fake HAL implementation for testing.
//!
//! Records every operation and mutates an in-memory disk table so the engine
//! can be exercised end to end without root privileges or real hardware.
//! Block devices are backed by temp files, which makes the byte-copy paths
//! (move, flash, backup) testable for real.

use super::{
    ApfsOps, BatterySnapshot, BlockIoOps, BusyProcess, CheckOps, DeviceInfo, EraseOps, FsUsageOps,
    ImageAttachOps, InspectOps, MountCtlOps, PowerOps, ProcessSignal, RawApfsContainer, RawDisk,
    RawPartition, SidecarInvocation, SidecarOps,
};
use crate::{HalError, HalResult};
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const MIB: u64 = 1024 * 1024;

/// Operation records for assertions.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    EraseDisk {
        device: String,
        fs: String,
        label: String,
        scheme: String,
    },
    EraseVolume {
        device: String,
        fs: String,
        label: String,
    },
    PartitionDiskFree {
        device: String,
        scheme: String,
    },
    AddPartition {
        disk: String,
        fs: String,
        label: String,
        size_arg: String,
    },
    RenameVolume {
        device: String,
        label: String,
    },
    ResizeVolume {
        device: String,
        size_arg: String,
    },
    RepairDiskQuiet {
        disk: String,
    },
    UpdatePartitionOrder {
        disk: String,
    },
    MountDisk {
        disk: String,
    },
    MountVolume {
        device: String,
    },
    Unmount {
        device: String,
        force: bool,
    },
    UnmountDisk {
        disk: String,
        force: bool,
    },
    Eject {
        device: String,
    },
    ApfsAddVolume {
        container: String,
        name: String,
        role: Option<String>,
    },
    ApfsDeleteVolume {
        volume: String,
    },
    ApfsChangeVolumeUuid {
        volume: String,
        uuid: String,
    },
    VerifyVolume {
        device: String,
    },
    RepairVolume {
        device: String,
    },
    Signal {
        pid: i32,
        signal: ProcessSignal,
    },
    Sidecar {
        binary: String,
        args: Vec<String>,
    },
    AttachImage {
        image: PathBuf,
    },
    DetachImage {
        mount_point: PathBuf,
    },
}

#[derive(Debug, Clone, Default)]
pub struct FakePartition {
    pub identifier: String,
    pub name: String,
    pub size: u64,
    pub offset: u64,
    pub content: String,
    pub mount_point: Option<String>,
    pub fs_type: Option<String>,
    pub roles: Vec<String>,
    pub used: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct FakeDisk {
    pub identifier: String,
    pub size: u64,
    pub content: String,
    pub internal: bool,
    pub virtual_device: bool,
    pub solid_state: bool,
    pub bus_protocol: Option<String>,
    pub physical_store: Option<String>,
    pub block_size: u64,
    pub partitions: Vec<FakePartition>,
}

impl FakeDisk {
    pub fn external(identifier: &str, size: u64) -> Self {
        Self {
            identifier: identifier.to_string(),
            size,
            content: "GUID_partition_scheme".to_string(),
            internal: false,
            virtual_device: false,
            solid_state: false,
            bus_protocol: Some("USB".to_string()),
            physical_store: None,
            block_size: 512,
            partitions: Vec::new(),
        }
    }

    pub fn internal(identifier: &str, size: u64) -> Self {
        Self {
            internal: true,
            bus_protocol: Some("PCI-Express".to_string()),
            ..Self::external(identifier, size)
        }
    }

    pub fn with_partition(mut self, partition: FakePartition) -> Self {
        self.partitions.push(partition);
        self
    }
}

impl FakePartition {
    pub fn new(identifier: &str, offset: u64, size: u64) -> Self {
        Self {
            identifier: identifier.to_string(),
            name: String::new(),
            size,
            offset,
            content: "Microsoft Basic Data".to_string(),
            mount_point: None,
            fs_type: Some("exfat".to_string()),
            roles: Vec::new(),
            used: None,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn fs(mut self, fs: &str) -> Self {
        self.fs_type = Some(fs.to_string());
        self
    }

    pub fn mounted_at(mut self, mount: &str) -> Self {
        self.mount_point = Some(mount.to_string());
        self
    }

    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn used_bytes(mut self, used: u64) -> Self {
        self.used = Some(used);
        self
    }
}

/// Scripted result for one sidecar binary.
#[derive(Debug, Clone, Default)]
pub struct FakeSidecarResult {
    pub lines: Vec<String>,
    pub output: String,
    pub fail: Option<(i32, String)>,
}

#[derive(Default)]
struct FakeState {
    operations: Vec<Operation>,
    disks: Vec<FakeDisk>,
    containers: Vec<RawApfsContainer>,
    battery: Option<BatterySnapshot>,
    busy: HashMap<String, Vec<BusyProcess>>,
    busy_clears_on_kill: bool,
    sidecars: HashMap<String, FakeSidecarResult>,
    check_results: HashMap<String, (bool, String)>,
    block_devices: HashMap<String, PathBuf>,
    attachments: HashMap<PathBuf, PathBuf>,
    mount_overrides: HashMap<String, PathBuf>,
    backing_dir: Option<tempfile::TempDir>,
}

/// Fake HAL that records operations and keeps the disk table consistent.
#[derive(Clone, Default)]
pub struct FakeHal {
    state: Arc<Mutex<FakeState>>,
}

impl FakeHal {
    pub fn new() -> Self {
        let hal = Self::default();
        hal.lock().busy_clears_on_kill = true;
        hal
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record(&self, op: Operation) {
        self.lock().operations.push(op);
    }

    pub fn operations(&self) -> Vec<Operation> {
        self.lock().operations.clone()
    }

    pub fn has_operation(&self, check: impl Fn(&Operation) -> bool) -> bool {
        self.lock().operations.iter().any(check)
    }

    pub fn add_disk(&self, disk: FakeDisk) {
        self.lock().disks.push(disk);
    }

    pub fn set_containers(&self, containers: Vec<RawApfsContainer>) {
        self.lock().containers = containers;
    }

    pub fn set_battery(&self, battery: BatterySnapshot) {
        self.lock().battery = Some(battery);
    }

    pub fn set_busy(&self, mount_point: &str, processes: Vec<BusyProcess>) {
        self.lock().busy.insert(mount_point.to_string(), processes);
    }

    pub fn keep_busy_after_kill(&self) {
        self.lock().busy_clears_on_kill = false;
    }

    pub fn script_sidecar(&self, binary: &str, result: FakeSidecarResult) {
        self.lock().sidecars.insert(binary.to_string(), result);
    }

    pub fn script_check(&self, device: &str, ok: bool, output: &str) {
        self.lock()
            .check_results
            .insert(device.to_string(), (ok, output.to_string()));
    }

    pub fn map_block_device(&self, device: &str, path: PathBuf) {
        self.lock().block_devices.insert(device.to_string(), path);
    }

    pub fn map_attachment(&self, image: &Path, mount_dir: PathBuf) {
        self.lock()
            .attachments
            .insert(image.to_path_buf(), mount_dir);
    }

    /// Mounting this partition lands on a real directory instead of a
    /// synthetic `/Volumes` path. Used by staging tests.
    pub fn set_mount_override(&self, identifier: &str, path: PathBuf) {
        self.lock()
            .mount_overrides
            .insert(identifier.to_string(), path);
    }

    pub fn disk(&self, identifier: &str) -> Option<FakeDisk> {
        self.lock()
            .disks
            .iter()
            .find(|d| d.identifier == identifier)
            .cloned()
    }

    pub fn partition(&self, identifier: &str) -> Option<FakePartition> {
        let state = self.lock();
        for disk in &state.disks {
            if let Some(part) = disk.partitions.iter().find(|p| p.identifier == identifier) {
                return Some(part.clone());
            }
        }
        None
    }

    /// Path of the temp file backing a device, creating it on first use.
    pub fn block_device_path(&self, device: &str) -> HalResult<PathBuf> {
        let device = strip_dev(device);
        let size = {
            let state = self.lock();
            if let Some(path) = state.block_devices.get(&device) {
                return Ok(path.clone());
            }
            device_size(&state, &device).unwrap_or(16 * MIB)
        };
        let mut state = self.lock();
        if state.backing_dir.is_none() {
            state.backing_dir = Some(tempfile::tempdir().map_err(HalError::Io)?);
        }
        let dir = state.backing_dir.as_ref().unwrap().path().to_path_buf();
        let path = dir.join(device.replace('/', "_"));
        let file = File::create(&path).map_err(HalError::Io)?;
        file.set_len(size).map_err(HalError::Io)?;
        state.block_devices.insert(device, path.clone());
        Ok(path)
    }

    fn next_partition_id(disk: &FakeDisk) -> String {
        let next = disk
            .partitions
            .iter()
            .filter_map(|p| {
                p.identifier
                    .rsplit('s')
                    .next()
                    .and_then(|n| n.parse::<u32>().ok())
            })
            .max()
            .unwrap_or(0)
            + 1;
        format!("{}s{}", disk.identifier, next)
    }
}

fn strip_dev(device: &str) -> String {
    device.trim_start_matches("/dev/").to_string()
}

fn device_size(state: &FakeState, identifier: &str) -> Option<u64> {
    for disk in &state.disks {
        if disk.identifier == identifier {
            return Some(disk.size);
        }
        for part in &disk.partitions {
            if part.identifier == identifier {
                return Some(part.size);
            }
        }
    }
    None
}

fn fs_family_for_diskutil_name(fs: &str) -> (String, Option<String>) {
    match fs {
        "ExFAT" => ("Microsoft Basic Data".to_string(), Some("exfat".to_string())),
        "MS-DOS" => ("Microsoft Basic Data".to_string(), Some("fat32".to_string())),
        "APFS" => ("Apple_APFS".to_string(), Some("apfs".to_string())),
        other => (other.to_string(), None),
    }
}

fn scheme_content(scheme: &str) -> String {
    match scheme {
        "MBR" => "FDisk_partition_scheme".to_string(),
        _ => "GUID_partition_scheme".to_string(),
    }
}

fn parse_size_arg(size_arg: &str) -> Option<u64> {
    let lower = size_arg.trim().to_lowercase();
    let (digits, mult) = if let Some(v) = lower.strip_suffix('g') {
        (v, 1024 * MIB)
    } else if let Some(v) = lower.strip_suffix('m') {
        (v, MIB)
    } else {
        (lower.as_str(), 1)
    };
    digits.parse::<f64>().ok().map(|n| (n * mult as f64) as u64)
}

impl InspectOps for FakeHal {
    fn list_disks(&self) -> HalResult<Vec<RawDisk>> {
        let state = self.lock();
        Ok(state
            .disks
            .iter()
            .map(|disk| RawDisk {
                identifier: disk.identifier.clone(),
                size: disk.size,
                content: disk.content.clone(),
                internal: disk.internal,
                solid_state: disk.solid_state,
                virtual_device: disk.virtual_device,
                bus_protocol: disk.bus_protocol.clone(),
                physical_store: disk.physical_store.clone(),
                partitions: disk
                    .partitions
                    .iter()
                    .map(|part| RawPartition {
                        identifier: part.identifier.clone(),
                        volume_name: part.name.clone(),
                        size: part.size,
                        offset: part.offset,
                        content: part.content.clone(),
                        mount_point: part.mount_point.clone(),
                    })
                    .collect(),
            })
            .collect())
    }

    fn device_info(&self, device: &str) -> HalResult<DeviceInfo> {
        let device = strip_dev(device);
        let state = self.lock();
        for disk in &state.disks {
            if disk.identifier == device {
                return Ok(DeviceInfo {
                    identifier: device.clone(),
                    parent_whole_disk: None,
                    partition_offset: None,
                    partition_size: None,
                    total_size: disk.size,
                    block_size: disk.block_size,
                    mount_point: None,
                    fs_type: None,
                    volume_used: None,
                    apfs_roles: Vec::new(),
                    internal: disk.internal,
                    ejectable: !disk.internal,
                    virtual_device: disk.virtual_device,
                });
            }
            for part in &disk.partitions {
                if part.identifier == device {
                    return Ok(DeviceInfo {
                        identifier: device.clone(),
                        parent_whole_disk: Some(disk.identifier.clone()),
                        partition_offset: Some(part.offset),
                        partition_size: Some(part.size),
                        total_size: part.size,
                        block_size: disk.block_size,
                        mount_point: part.mount_point.clone(),
                        fs_type: part.fs_type.clone(),
                        volume_used: part.used,
                        apfs_roles: part.roles.clone(),
                        internal: disk.internal,
                        ejectable: !disk.internal,
                        virtual_device: disk.virtual_device,
                    });
                }
            }
        }
        Err(HalError::CommandFailed {
            program: "diskutil".to_string(),
            code: Some(1),
            stderr: format!("Could not find disk: {device}"),
        })
    }

    fn apfs_containers(&self) -> HalResult<Vec<RawApfsContainer>> {
        Ok(self.lock().containers.clone())
    }
}

impl EraseOps for FakeHal {
    fn erase_disk(&self, device: &str, fs: &str, label: &str, scheme: &str) -> HalResult<()> {
        let device = strip_dev(device);
        self.record(Operation::EraseDisk {
            device: device.clone(),
            fs: fs.to_string(),
            label: label.to_string(),
            scheme: scheme.to_string(),
        });
        let mut state = self.lock();
        let disk = state
            .disks
            .iter_mut()
            .find(|d| d.identifier == device)
            .ok_or_else(|| HalError::Other(format!("no such disk {device}")))?;
        let (content, fs_type) = fs_family_for_diskutil_name(fs);
        disk.content = scheme_content(scheme);
        let identifier = format!("{}s1", disk.identifier);
        let size = disk.size.saturating_sub(2 * MIB);
        disk.partitions = vec![FakePartition {
            identifier,
            name: label.to_string(),
            size,
            offset: MIB,
            content,
            mount_point: None,
            fs_type,
            roles: Vec::new(),
            used: None,
        }];
        Ok(())
    }

    fn erase_volume(&self, device: &str, fs: &str, label: &str) -> HalResult<()> {
        let device = strip_dev(device);
        self.record(Operation::EraseVolume {
            device: device.clone(),
            fs: fs.to_string(),
            label: label.to_string(),
        });
        let mut state = self.lock();
        for disk in &mut state.disks {
            if let Some(idx) = disk.partitions.iter().position(|p| p.identifier == device) {
                if fs == "free" {
                    disk.partitions.remove(idx);
                } else {
                    let (content, fs_type) = fs_family_for_diskutil_name(fs);
                    let part = &mut disk.partitions[idx];
                    part.content = content;
                    if fs_type.is_some() {
                        part.fs_type = fs_type;
                    }
                    part.name = label.to_string();
                    part.mount_point = None;
                }
                return Ok(());
            }
        }
        Err(HalError::Other(format!("no such partition {device}")))
    }

    fn partition_disk_free(&self, device: &str, scheme: &str) -> HalResult<()> {
        let device = strip_dev(device);
        self.record(Operation::PartitionDiskFree {
            device: device.clone(),
            scheme: scheme.to_string(),
        });
        let mut state = self.lock();
        let disk = state
            .disks
            .iter_mut()
            .find(|d| d.identifier == device)
            .ok_or_else(|| HalError::Other(format!("no such disk {device}")))?;
        disk.content = scheme_content(scheme);
        disk.partitions.clear();
        Ok(())
    }

    fn add_partition(&self, disk_id: &str, fs: &str, label: &str, size_arg: &str) -> HalResult<()> {
        let disk_id = strip_dev(disk_id);
        self.record(Operation::AddPartition {
            disk: disk_id.clone(),
            fs: fs.to_string(),
            label: label.to_string(),
            size_arg: size_arg.to_string(),
        });
        let size = parse_size_arg(size_arg)
            .ok_or_else(|| HalError::Other(format!("bad size {size_arg}")))?;
        let mut state = self.lock();
        let disk = state
            .disks
            .iter_mut()
            .find(|d| d.identifier == disk_id)
            .ok_or_else(|| HalError::Other(format!("no such disk {disk_id}")))?;

        // First gap that fits, 1 MiB aligned, same shape as the real tool.
        let mut parts: Vec<(u64, u64)> = disk
            .partitions
            .iter()
            .map(|p| (p.offset, p.size))
            .collect();
        parts.sort_by_key(|(offset, _)| *offset);
        let mut cursor = MIB;
        let mut chosen = None;
        for (offset, psize) in &parts {
            if offset.saturating_sub(cursor) >= size {
                chosen = Some(cursor);
                break;
            }
            cursor = (offset + psize).max(cursor).div_ceil(MIB) * MIB;
        }
        if chosen.is_none() && disk.size.saturating_sub(cursor) >= size {
            chosen = Some(cursor);
        }
        let offset = chosen.ok_or_else(|| HalError::CommandFailed {
            program: "diskutil".to_string(),
            code: Some(1),
            stderr: "Not enough free space".to_string(),
        })?;

        let identifier = Self::next_partition_id(disk);
        let (content, fs_type) = fs_family_for_diskutil_name(fs);
        disk.partitions.push(FakePartition {
            identifier,
            name: label.to_string(),
            size,
            offset,
            content,
            mount_point: None,
            fs_type,
            roles: Vec::new(),
            used: None,
        });
        Ok(())
    }

    fn rename_volume(&self, device: &str, label: &str) -> HalResult<()> {
        let device = strip_dev(device);
        self.record(Operation::RenameVolume {
            device: device.clone(),
            label: label.to_string(),
        });
        let mut state = self.lock();
        for disk in &mut state.disks {
            if let Some(part) = disk
                .partitions
                .iter_mut()
                .find(|p| p.identifier == device)
            {
                part.name = label.to_string();
                return Ok(());
            }
        }
        Err(HalError::Other(format!("no such partition {device}")))
    }

    fn resize_volume(&self, device: &str, size_arg: &str) -> HalResult<()> {
        let device = strip_dev(device);
        self.record(Operation::ResizeVolume {
            device: device.clone(),
            size_arg: size_arg.to_string(),
        });
        let size = parse_size_arg(size_arg)
            .ok_or_else(|| HalError::Other(format!("bad size {size_arg}")))?;
        let mut state = self.lock();
        for disk in &mut state.disks {
            if let Some(part) = disk
                .partitions
                .iter_mut()
                .find(|p| p.identifier == device)
            {
                part.size = size;
                return Ok(());
            }
        }
        Err(HalError::Other(format!("no such partition {device}")))
    }

    fn repair_disk_quiet(&self, disk: &str) -> HalResult<()> {
        self.record(Operation::RepairDiskQuiet {
            disk: strip_dev(disk),
        });
        Ok(())
    }

    fn update_partition_order(&self, disk: &str) -> HalResult<()> {
        self.record(Operation::UpdatePartitionOrder {
            disk: strip_dev(disk),
        });
        Ok(())
    }
}

impl MountCtlOps for FakeHal {
    fn mount_disk(&self, disk: &str) -> HalResult<()> {
        let disk = strip_dev(disk);
        self.record(Operation::MountDisk { disk: disk.clone() });
        let mut state = self.lock();
        if let Some(disk) = state.disks.iter_mut().find(|d| d.identifier == disk) {
            for part in &mut disk.partitions {
                if part.mount_point.is_none() && part.fs_type.is_some() {
                    part.mount_point = Some(format!("/Volumes/{}", part.name));
                }
            }
        }
        Ok(())
    }

    fn mount_volume(&self, device: &str) -> HalResult<()> {
        let device = strip_dev(device);
        self.record(Operation::MountVolume {
            device: device.clone(),
        });
        let mut state = self.lock();
        let override_path = state
            .mount_overrides
            .get(&device)
            .map(|p| p.display().to_string());
        for disk in &mut state.disks {
            if let Some(part) = disk
                .partitions
                .iter_mut()
                .find(|p| p.identifier == device)
            {
                part.mount_point = Some(
                    override_path
                        .clone()
                        .unwrap_or_else(|| format!("/Volumes/{}", part.name)),
                );
            }
        }
        Ok(())
    }

    fn unmount(&self, device: &str, force: bool) -> HalResult<()> {
        let device = strip_dev(device);
        self.record(Operation::Unmount {
            device: device.clone(),
            force,
        });
        let mut state = self.lock();
        for disk in &mut state.disks {
            if let Some(part) = disk
                .partitions
                .iter_mut()
                .find(|p| p.identifier == device)
            {
                part.mount_point = None;
            }
        }
        Ok(())
    }

    fn unmount_disk(&self, disk: &str, force: bool) -> HalResult<()> {
        let disk = strip_dev(disk);
        self.record(Operation::UnmountDisk {
            disk: disk.clone(),
            force,
        });
        let mut state = self.lock();
        if let Some(disk) = state.disks.iter_mut().find(|d| d.identifier == disk) {
            for part in &mut disk.partitions {
                part.mount_point = None;
            }
        }
        Ok(())
    }

    fn eject(&self, device: &str) -> HalResult<()> {
        let device = strip_dev(device);
        self.record(Operation::Eject {
            device: device.clone(),
        });
        let mut state = self.lock();
        state.disks.retain(|d| d.identifier != device);
        Ok(())
    }
}

impl ApfsOps for FakeHal {
    fn apfs_add_volume(&self, container: &str, name: &str, role: Option<&str>) -> HalResult<()> {
        let container = strip_dev(container);
        self.record(Operation::ApfsAddVolume {
            container: container.clone(),
            name: name.to_string(),
            role: role.map(|r| r.to_string()),
        });
        let mut state = self.lock();
        if let Some(entry) = state
            .containers
            .iter_mut()
            .find(|c| c.reference == container)
        {
            let index = entry.volumes.len() + 1;
            entry.volumes.push(super::RawApfsVolume {
                identifier: format!("{container}s{index}"),
                name: name.to_string(),
                roles: role
                    .filter(|r| !r.is_empty() && *r != "None")
                    .map(|r| vec![r.to_string()])
                    .unwrap_or_default(),
                size: 0,
                used: 0,
                mount_point: None,
            });
            return Ok(());
        }
        Err(HalError::Other(format!("no such container {container}")))
    }

    fn apfs_delete_volume(&self, volume: &str) -> HalResult<()> {
        let volume = strip_dev(volume);
        self.record(Operation::ApfsDeleteVolume {
            volume: volume.clone(),
        });
        let mut state = self.lock();
        for container in &mut state.containers {
            let before = container.volumes.len();
            container.volumes.retain(|v| v.identifier != volume);
            if container.volumes.len() != before {
                return Ok(());
            }
        }
        Err(HalError::Other(format!("no such volume {volume}")))
    }

    fn apfs_change_volume_uuid(&self, volume: &str, uuid: &str) -> HalResult<()> {
        self.record(Operation::ApfsChangeVolumeUuid {
            volume: strip_dev(volume),
            uuid: uuid.to_string(),
        });
        Ok(())
    }
}

impl CheckOps for FakeHal {
    fn verify_volume(&self, device: &str) -> HalResult<String> {
        let device = strip_dev(device);
        self.record(Operation::VerifyVolume {
            device: device.clone(),
        });
        let state = self.lock();
        match state.check_results.get(&device) {
            Some((true, output)) => Ok(output.clone()),
            Some((false, output)) => Err(HalError::CommandFailed {
                program: "diskutil".to_string(),
                code: Some(1),
                stderr: output.clone(),
            }),
            None => Ok("The volume appears to be OK".to_string()),
        }
    }

    fn repair_volume(&self, device: &str) -> HalResult<String> {
        let device = strip_dev(device);
        self.record(Operation::RepairVolume {
            device: device.clone(),
        });
        let mut state = self.lock();
        state
            .check_results
            .insert(device.clone(), (true, "repaired".to_string()));
        Ok("repaired".to_string())
    }
}

impl PowerOps for FakeHal {
    fn battery(&self) -> HalResult<BatterySnapshot> {
        Ok(self.lock().battery.clone().unwrap_or(BatterySnapshot {
            is_laptop: false,
            on_ac: true,
            percent: None,
        }))
    }
}

impl FsUsageOps for FakeHal {
    fn open_processes(&self, mount_point: &str) -> HalResult<Vec<BusyProcess>> {
        Ok(self
            .lock()
            .busy
            .get(mount_point)
            .cloned()
            .unwrap_or_default())
    }

    fn signal_process(&self, pid: i32, signal: ProcessSignal) -> HalResult<()> {
        self.record(Operation::Signal { pid, signal });
        let mut state = self.lock();
        if signal == ProcessSignal::Kill && state.busy_clears_on_kill {
            for processes in state.busy.values_mut() {
                processes.retain(|p| p.pid != pid);
            }
        }
        Ok(())
    }
}

impl BlockIoOps for FakeHal {
    fn open_block_read(&self, device: &str) -> HalResult<File> {
        let path = self.block_device_path(device)?;
        File::options().read(true).open(path).map_err(HalError::Io)
    }

    fn open_block_write(&self, device: &str) -> HalResult<File> {
        let path = self.block_device_path(device)?;
        File::options().write(true).open(path).map_err(HalError::Io)
    }

    fn raw_device_path(&self, device: &str) -> String {
        device.to_string()
    }
}

impl ImageAttachOps for FakeHal {
    fn attach_image_readonly(&self, image: &Path) -> HalResult<PathBuf> {
        self.record(Operation::AttachImage {
            image: image.to_path_buf(),
        });
        self.lock()
            .attachments
            .get(image)
            .cloned()
            .ok_or_else(|| HalError::Other(format!("no attachment for {}", image.display())))
    }

    fn detach_image(&self, mount_point: &Path) -> HalResult<()> {
        self.record(Operation::DetachImage {
            mount_point: mount_point.to_path_buf(),
        });
        Ok(())
    }
}

impl SidecarOps for FakeHal {
    fn run_sidecar(
        &self,
        invocation: &SidecarInvocation,
        on_line: &mut dyn FnMut(&str) -> bool,
    ) -> HalResult<String> {
        self.record(Operation::Sidecar {
            binary: invocation.binary.clone(),
            args: invocation.args.clone(),
        });
        let script = self
            .lock()
            .sidecars
            .get(&invocation.binary)
            .cloned()
            .unwrap_or_default();
        for line in &script.lines {
            if !on_line(line) {
                return Err(HalError::Other(format!(
                    "{} aborted by caller",
                    invocation.binary
                )));
            }
        }
        if let Some((code, stderr)) = script.fail {
            return Err(HalError::CommandFailed {
                program: invocation.binary.clone(),
                code: Some(code),
                stderr,
            });
        }
        Ok(script.output)
    }
}
