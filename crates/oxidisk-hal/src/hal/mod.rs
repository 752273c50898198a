//! HAL trait definitions and implementations.
//!
//! Each trait covers one world-touching concern. `MacosHal` drives the real
//! platform tools; `FakeHal` records operations against an in-memory disk
//! table for tests.

pub mod fake_hal;
pub mod macos_hal;

pub use fake_hal::{FakeDisk, FakeHal, FakePartition, FakeSidecarResult, Operation};
pub use macos_hal::{HalTimeouts, MacosHal};

use crate::HalResult;
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One disk as reported by the platform's list command, partitions embedded.
#[derive(Debug, Clone, Default)]
pub struct RawDisk {
    pub identifier: String,
    pub size: u64,
    pub content: String,
    pub internal: bool,
    pub solid_state: bool,
    pub virtual_device: bool,
    pub bus_protocol: Option<String>,
    /// Backing physical store when this disk is a synthesized container.
    pub physical_store: Option<String>,
    pub partitions: Vec<RawPartition>,
}

#[derive(Debug, Clone, Default)]
pub struct RawPartition {
    pub identifier: String,
    pub volume_name: String,
    pub size: u64,
    pub offset: u64,
    pub content: String,
    pub mount_point: Option<String>,
}

/// Detailed facts about one device node.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfo {
    pub identifier: String,
    pub parent_whole_disk: Option<String>,
    pub partition_offset: Option<u64>,
    pub partition_size: Option<u64>,
    pub total_size: u64,
    pub block_size: u64,
    pub mount_point: Option<String>,
    /// Normalized filesystem family (`apfs`, `exfat`, `fat32`, `ntfs`, ...).
    pub fs_type: Option<String>,
    pub volume_used: Option<u64>,
    pub apfs_roles: Vec<String>,
    pub internal: bool,
    pub ejectable: bool,
    pub virtual_device: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RawApfsVolume {
    pub identifier: String,
    pub name: String,
    pub roles: Vec<String>,
    pub size: u64,
    pub used: u64,
    pub mount_point: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RawApfsContainer {
    pub reference: String,
    pub uuid: Option<String>,
    pub capacity: Option<u64>,
    pub capacity_free: Option<u64>,
    pub capacity_used: Option<u64>,
    pub physical_stores: Vec<String>,
    pub volumes: Vec<RawApfsVolume>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatterySnapshot {
    pub is_laptop: bool,
    pub on_ac: bool,
    pub percent: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BusyProcess {
    pub pid: i32,
    pub command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Term,
    Kill,
}

/// One sidecar invocation: binary name (resolved via the registry), argv,
/// and an upper bound on the whole run.
#[derive(Debug, Clone)]
pub struct SidecarInvocation {
    pub binary: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl SidecarInvocation {
    pub fn new(binary: &str, args: Vec<String>) -> Self {
        Self {
            binary: binary.to_string(),
            args,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Read-only topology probes.
pub trait InspectOps {
    fn list_disks(&self) -> HalResult<Vec<RawDisk>>;
    fn device_info(&self, device: &str) -> HalResult<DeviceInfo>;
    fn apfs_containers(&self) -> HalResult<Vec<RawApfsContainer>>;
}

/// Destructive partition-table and volume operations via the platform tool.
pub trait EraseOps {
    fn erase_disk(&self, device: &str, fs: &str, label: &str, scheme: &str) -> HalResult<()>;
    fn erase_volume(&self, device: &str, fs: &str, label: &str) -> HalResult<()>;
    /// Rewrite the scheme leaving the whole disk unallocated.
    fn partition_disk_free(&self, device: &str, scheme: &str) -> HalResult<()>;
    fn add_partition(&self, disk: &str, fs: &str, label: &str, size_arg: &str) -> HalResult<()>;
    fn rename_volume(&self, device: &str, label: &str) -> HalResult<()>;
    fn resize_volume(&self, device: &str, size_arg: &str) -> HalResult<()>;
    /// Quiet whole-disk repair, used to resync the kernel table after edits.
    fn repair_disk_quiet(&self, disk: &str) -> HalResult<()>;
    fn update_partition_order(&self, disk: &str) -> HalResult<()>;
}

/// Mount control, always through the platform tool (never mount(2)).
pub trait MountCtlOps {
    fn mount_disk(&self, disk: &str) -> HalResult<()>;
    fn mount_volume(&self, device: &str) -> HalResult<()>;
    fn unmount(&self, device: &str, force: bool) -> HalResult<()>;
    fn unmount_disk(&self, disk: &str, force: bool) -> HalResult<()>;
    fn eject(&self, device: &str) -> HalResult<()>;
}

pub trait ApfsOps {
    fn apfs_add_volume(
        &self,
        container: &str,
        name: &str,
        role: Option<&str>,
    ) -> HalResult<()>;
    fn apfs_delete_volume(&self, volume: &str) -> HalResult<()>;
    fn apfs_change_volume_uuid(&self, volume: &str, uuid: &str) -> HalResult<()>;
}

/// Filesystem verify/repair through the platform tool.
pub trait CheckOps {
    fn verify_volume(&self, device: &str) -> HalResult<String>;
    fn repair_volume(&self, device: &str) -> HalResult<String>;
}

pub trait PowerOps {
    fn battery(&self) -> HalResult<BatterySnapshot>;
}

/// Processes holding files open on a mount point.
pub trait FsUsageOps {
    fn open_processes(&self, mount_point: &str) -> HalResult<Vec<BusyProcess>>;
    fn signal_process(&self, pid: i32, signal: ProcessSignal) -> HalResult<()>;
}

/// Raw block-device access for byte copies.
pub trait BlockIoOps {
    fn open_block_read(&self, device: &str) -> HalResult<File>;
    fn open_block_write(&self, device: &str) -> HalResult<File>;
    /// Character-device alias used for unbuffered sequential writes.
    fn raw_device_path(&self, device: &str) -> String;
}

/// Disk-image attach/detach (read-only), used for ISO inspection/staging.
pub trait ImageAttachOps {
    fn attach_image_readonly(&self, image: &Path) -> HalResult<PathBuf>;
    fn detach_image(&self, mount_point: &Path) -> HalResult<()>;
}

/// External sidecar execution with line streaming.
///
/// The callback receives every stdout line; returning `false` aborts the run
/// and terminates the child's process group.
pub trait SidecarOps {
    fn run_sidecar(
        &self,
        invocation: &SidecarInvocation,
        on_line: &mut dyn FnMut(&str) -> bool,
    ) -> HalResult<String>;
}

/// Complete HAL combining all system operation traits.
pub trait DiskHal:
    InspectOps
    + EraseOps
    + MountCtlOps
    + ApfsOps
    + CheckOps
    + PowerOps
    + FsUsageOps
    + BlockIoOps
    + ImageAttachOps
    + SidecarOps
    + Send
    + Sync
{
}

/// Automatically implement DiskHal for any type implementing all traits.
impl<T> DiskHal for T where
    T: InspectOps
        + EraseOps
        + MountCtlOps
        + ApfsOps
        + CheckOps
        + PowerOps
        + FsUsageOps
        + BlockIoOps
        + ImageAttachOps
        + SidecarOps
        + Send
        + Sync
{
}
