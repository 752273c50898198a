//! macOS HAL implementation driving `diskutil`, `pmset`, `lsof` and
//! `hdiutil`, with plist parsing for everything diskutil reports.

use super::{
    ApfsOps, BatterySnapshot, BlockIoOps, BusyProcess, CheckOps, DeviceInfo, EraseOps, FsUsageOps,
    ImageAttachOps, InspectOps, MountCtlOps, PowerOps, ProcessSignal, RawApfsContainer,
    RawApfsVolume, RawDisk, RawPartition, SidecarInvocation, SidecarOps,
};
use crate::plist_dict;
use crate::process;
use crate::sidecar;
use crate::{HalError, HalResult};
use plist::{Dictionary, Value};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Per-step soft deadlines. Inspection calls stay short; destructive calls
/// and filesystem checks get room to breathe.
#[derive(Debug, Clone)]
pub struct HalTimeouts {
    pub listing: Duration,
    pub info: Duration,
    pub check: Duration,
    pub command: Duration,
}

impl Default for HalTimeouts {
    fn default() -> Self {
        Self {
            listing: Duration::from_secs(5),
            info: Duration::from_secs(5),
            check: Duration::from_secs(15),
            command: Duration::from_secs(300),
        }
    }
}

/// Real HAL implementation for macOS hosts.
#[derive(Debug, Clone, Default)]
pub struct MacosHal {
    timeouts: HalTimeouts,
}

impl MacosHal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeouts(timeouts: HalTimeouts) -> Self {
        Self { timeouts }
    }

    fn diskutil(&self, args: &[&str], timeout: Duration) -> HalResult<process::RunOutput> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        process::run_capture("diskutil", Path::new("diskutil"), &args, timeout)
    }

    fn diskutil_plist(&self, args: &[&str], timeout: Duration) -> HalResult<Dictionary> {
        let out = self.diskutil(args, timeout)?;
        let value = Value::from_reader_xml(out.stdout.as_bytes())
            .map_err(|err| HalError::Parse(format!("diskutil plist: {err}")))?;
        value
            .into_dictionary()
            .ok_or_else(|| HalError::Parse("diskutil plist root is not a dictionary".to_string()))
    }

    fn partition_geometry(&self, disk: &str) -> HalResult<Vec<(String, u64, u64)>> {
        let dict = self.diskutil_plist(
            &["list", "-plist", &device_path(disk)],
            self.timeouts.listing,
        )?;
        let mut out = Vec::new();
        for part in plist_dict::array(&dict, &["Partitions"]) {
            let Some(part_dict) = part.as_dictionary() else {
                continue;
            };
            let identifier = plist_dict::string(part_dict, &["DeviceIdentifier"]).unwrap_or_default();
            let offset = plist_dict::unsigned(part_dict, &["PartitionOffset"]).unwrap_or(0);
            let size =
                plist_dict::unsigned(part_dict, &["PartitionSize", "Size"]).unwrap_or(0);
            if !identifier.is_empty() && size > 0 {
                out.push((identifier, offset, size));
            }
        }
        Ok(out)
    }
}

/// Ensure a `/dev/` prefix on a bare identifier.
pub fn device_path(identifier: &str) -> String {
    if identifier.starts_with("/dev/") {
        identifier.to_string()
    } else {
        format!("/dev/{identifier}")
    }
}

/// Normalize the diskutil type/content fields into a filesystem family.
pub fn normalize_fs_type(candidates: &[String]) -> Option<String> {
    for candidate in candidates {
        let candidate = candidate.to_lowercase();
        for (needle, family) in [
            ("apfs", "apfs"),
            ("exfat", "exfat"),
            ("msdos", "fat32"),
            ("fat", "fat32"),
            ("ntfs", "ntfs"),
            ("ext4", "ext4"),
            ("linux", "ext4"),
            ("btrfs", "btrfs"),
            ("xfs", "xfs"),
            ("f2fs", "f2fs"),
            ("swap", "swap"),
        ] {
            if candidate.contains(needle) {
                return Some(family.to_string());
            }
        }
    }
    None
}

impl InspectOps for MacosHal {
    fn list_disks(&self) -> HalResult<Vec<RawDisk>> {
        let dict = self.diskutil_plist(&["list", "-plist"], self.timeouts.listing)?;
        let mut disks = Vec::new();
        for entry in plist_dict::array(&dict, &["AllDisksAndPartitions"]) {
            let Some(disk_dict) = entry.as_dictionary() else {
                continue;
            };
            let identifier = match plist_dict::string(disk_dict, &["DeviceIdentifier"]) {
                Some(id) => id,
                None => continue,
            };

            // Per-disk info fills in the flags the list output omits.
            let info = self.device_info(&identifier).unwrap_or_default();
            let geometry = self.partition_geometry(&identifier).unwrap_or_default();

            let mut partitions = Vec::new();
            for part in plist_dict::array(disk_dict, &["Partitions"]) {
                let Some(part_dict) = part.as_dictionary() else {
                    continue;
                };
                let part_id =
                    plist_dict::string(part_dict, &["DeviceIdentifier"]).unwrap_or_default();
                let offset = geometry
                    .iter()
                    .find(|(id, ..)| *id == part_id)
                    .map(|(_, offset, _)| *offset)
                    .unwrap_or(0);
                partitions.push(RawPartition {
                    identifier: part_id,
                    volume_name: plist_dict::string(part_dict, &["VolumeName"])
                        .unwrap_or_default(),
                    size: plist_dict::unsigned(part_dict, &["Size"]).unwrap_or(0),
                    offset,
                    content: plist_dict::string(part_dict, &["Content"])
                        .unwrap_or_else(|| "unknown".to_string()),
                    mount_point: plist_dict::string(part_dict, &["MountPoint"]),
                });
            }

            disks.push(RawDisk {
                identifier,
                size: plist_dict::unsigned(disk_dict, &["Size"]).unwrap_or(0),
                content: plist_dict::string(disk_dict, &["Content"])
                    .unwrap_or_else(|| "unknown".to_string()),
                internal: info.internal,
                solid_state: plist_dict::boolean(disk_dict, &["SolidState"]).unwrap_or(false),
                virtual_device: info.virtual_device,
                bus_protocol: plist_dict::string(disk_dict, &["BusProtocol"]),
                physical_store: plist_dict::array(disk_dict, &["APFSPhysicalStores"])
                    .first()
                    .and_then(|v| v.as_dictionary())
                    .and_then(|d| plist_dict::string(d, &["DeviceIdentifier"])),
                partitions,
            });
        }
        Ok(disks)
    }

    fn device_info(&self, device: &str) -> HalResult<DeviceInfo> {
        let dict = self.diskutil_plist(
            &["info", "-plist", &device_path(device)],
            self.timeouts.info,
        )?;

        let mut fs_candidates = Vec::new();
        for key in ["FilesystemType", "Type", "Content"] {
            if let Some(value) = plist_dict::string(&dict, &[key]) {
                fs_candidates.push(value);
            }
        }

        let bus_protocol = plist_dict::string(&dict, &["BusProtocol"])
            .unwrap_or_default()
            .to_lowercase();
        let virtual_device = plist_dict::string(&dict, &["VirtualOrPhysical"])
            .map(|v| v.eq_ignore_ascii_case("virtual"))
            .unwrap_or(false);
        let ejectable = plist_dict::boolean(&dict, &["Ejectable"]).unwrap_or(false);
        let removable = plist_dict::boolean(&dict, &["RemovableMedia"]).unwrap_or(false)
            || plist_dict::boolean(&dict, &["RemovableMediaOrExternalDevice"]).unwrap_or(false);
        let internal_flag = plist_dict::boolean(&dict, &["Internal"]).unwrap_or(true);
        let external_bus = ["usb", "thunderbolt", "firewire", "sd", "sdc"]
            .iter()
            .any(|hint| bus_protocol.contains(hint));
        let external =
            !virtual_device && (external_bus || ejectable || removable || !internal_flag);

        Ok(DeviceInfo {
            identifier: plist_dict::string(&dict, &["DeviceIdentifier"])
                .unwrap_or_else(|| device.trim_start_matches("/dev/").to_string()),
            parent_whole_disk: plist_dict::string(&dict, &["ParentWholeDisk"]),
            partition_offset: plist_dict::unsigned(&dict, &["PartitionOffset"]),
            partition_size: plist_dict::unsigned(&dict, &["PartitionSize"]),
            total_size: plist_dict::unsigned(&dict, &["TotalSize", "Size", "DiskSize"])
                .unwrap_or(0),
            block_size: plist_dict::unsigned(&dict, &["DeviceBlockSize"]).unwrap_or(512),
            mount_point: plist_dict::string(&dict, &["MountPoint"]).filter(|m| !m.is_empty()),
            fs_type: normalize_fs_type(&fs_candidates),
            volume_used: plist_dict::unsigned(
                &dict,
                &["VolumeUsedSpace", "UsedSpace", "VolumeAllocatedSpace"],
            ),
            apfs_roles: plist_dict::string_array(&dict, &["APFSVolumeRoles"]),
            internal: !external,
            ejectable,
            virtual_device,
        })
    }

    fn apfs_containers(&self) -> HalResult<Vec<RawApfsContainer>> {
        let dict = self.diskutil_plist(&["apfs", "list", "-plist"], self.timeouts.listing)?;
        let mut containers = Vec::new();
        for entry in plist_dict::array(&dict, &["Containers"]) {
            let Some(container) = entry.as_dictionary() else {
                continue;
            };
            let mut volumes = Vec::new();
            for volume in plist_dict::array(container, &["Volumes", "APFSVolumes"]) {
                let Some(volume) = volume.as_dictionary() else {
                    continue;
                };
                volumes.push(RawApfsVolume {
                    identifier: plist_dict::string(volume, &["DeviceIdentifier", "DeviceReference"])
                        .unwrap_or_default(),
                    name: plist_dict::string(volume, &["Name", "VolumeName"]).unwrap_or_default(),
                    roles: plist_dict::string_array(volume, &["Roles", "APFSVolumeRoles"]),
                    size: plist_dict::unsigned(volume, &["CapacityInUse", "CapacityUsed"])
                        .unwrap_or(0),
                    used: plist_dict::unsigned(volume, &["CapacityInUse", "CapacityUsed"])
                        .unwrap_or(0),
                    mount_point: plist_dict::string(volume, &["MountPoint"]),
                });
            }
            let physical_stores = plist_dict::array(
                container,
                &["PhysicalStores", "APFSPhysicalStores"],
            )
            .into_iter()
            .filter_map(|v| v.as_dictionary())
            .filter_map(|d| plist_dict::string(d, &["DeviceIdentifier"]))
            .collect();

            containers.push(RawApfsContainer {
                reference: plist_dict::string(
                    container,
                    &["ContainerReference", "DeviceIdentifier", "ContainerIdentifier"],
                )
                .unwrap_or_default(),
                uuid: plist_dict::string(container, &["APFSContainerUUID", "ContainerUUID"]),
                capacity: plist_dict::unsigned(container, &["CapacityCeiling", "Capacity"]),
                capacity_free: plist_dict::unsigned(container, &["CapacityFree"]),
                capacity_used: plist_dict::unsigned(
                    container,
                    &["CapacityInUse", "CapacityUsed"],
                ),
                physical_stores,
                volumes,
            });
        }
        Ok(containers)
    }
}

impl EraseOps for MacosHal {
    fn erase_disk(&self, device: &str, fs: &str, label: &str, scheme: &str) -> HalResult<()> {
        self.diskutil(
            &["eraseDisk", fs, label, scheme, &device_path(device)],
            self.timeouts.command,
        )
        .map(|_| ())
    }

    fn erase_volume(&self, device: &str, fs: &str, label: &str) -> HalResult<()> {
        self.diskutil(
            &["eraseVolume", fs, label, &device_path(device)],
            self.timeouts.command,
        )
        .map(|_| ())
    }

    fn partition_disk_free(&self, device: &str, scheme: &str) -> HalResult<()> {
        self.diskutil(
            &[
                "partitionDisk",
                &device_path(device),
                "1",
                scheme,
                "free",
                "%noformat%",
                "100%",
            ],
            self.timeouts.command,
        )
        .map(|_| ())
    }

    fn add_partition(&self, disk: &str, fs: &str, label: &str, size_arg: &str) -> HalResult<()> {
        self.diskutil(
            &["addPartition", &device_path(disk), fs, label, size_arg],
            self.timeouts.command,
        )
        .map(|_| ())
    }

    fn rename_volume(&self, device: &str, label: &str) -> HalResult<()> {
        self.diskutil(
            &["renameVolume", &device_path(device), label],
            self.timeouts.command,
        )
        .map(|_| ())
    }

    fn resize_volume(&self, device: &str, size_arg: &str) -> HalResult<()> {
        self.diskutil(
            &["resizeVolume", &device_path(device), size_arg],
            self.timeouts.command,
        )
        .map(|_| ())
    }

    fn repair_disk_quiet(&self, disk: &str) -> HalResult<()> {
        self.diskutil(
            &["quiet", "repairDisk", &device_path(disk)],
            self.timeouts.command,
        )
        .map(|_| ())
    }

    fn update_partition_order(&self, disk: &str) -> HalResult<()> {
        self.diskutil(
            &["updateDefaultPartitionOrder", &device_path(disk)],
            self.timeouts.command,
        )
        .map(|_| ())
    }
}

impl MountCtlOps for MacosHal {
    fn mount_disk(&self, disk: &str) -> HalResult<()> {
        self.diskutil(&["mountDisk", &device_path(disk)], self.timeouts.command)
            .map(|_| ())
    }

    fn mount_volume(&self, device: &str) -> HalResult<()> {
        self.diskutil(&["mount", &device_path(device)], self.timeouts.command)
            .map(|_| ())
    }

    fn unmount(&self, device: &str, force: bool) -> HalResult<()> {
        let path = device_path(device);
        let args: Vec<&str> = if force {
            vec!["unmount", "force", &path]
        } else {
            vec!["unmount", &path]
        };
        self.diskutil(&args, self.timeouts.command).map(|_| ())
    }

    fn unmount_disk(&self, disk: &str, force: bool) -> HalResult<()> {
        let path = device_path(disk);
        let args: Vec<&str> = if force {
            vec!["unmountDisk", "force", &path]
        } else {
            vec!["unmountDisk", &path]
        };
        self.diskutil(&args, self.timeouts.command).map(|_| ())
    }

    fn eject(&self, device: &str) -> HalResult<()> {
        self.diskutil(&["eject", &device_path(device)], self.timeouts.command)
            .map(|_| ())
    }
}

impl ApfsOps for MacosHal {
    fn apfs_add_volume(&self, container: &str, name: &str, role: Option<&str>) -> HalResult<()> {
        let container = device_path(container);
        match role {
            Some(role) if !role.is_empty() && role != "None" => self
                .diskutil(
                    &["apfs", "addVolume", &container, "APFS", name, "-role", role],
                    self.timeouts.command,
                )
                .map(|_| ()),
            _ => self
                .diskutil(
                    &["apfs", "addVolume", &container, "APFS", name],
                    self.timeouts.command,
                )
                .map(|_| ()),
        }
    }

    fn apfs_delete_volume(&self, volume: &str) -> HalResult<()> {
        self.diskutil(
            &["apfs", "deleteVolume", &device_path(volume)],
            self.timeouts.command,
        )
        .map(|_| ())
    }

    fn apfs_change_volume_uuid(&self, volume: &str, uuid: &str) -> HalResult<()> {
        self.diskutil(
            &["apfs", "changeVolumeUUID", &device_path(volume), uuid],
            self.timeouts.command,
        )
        .map(|_| ())
    }
}

impl CheckOps for MacosHal {
    fn verify_volume(&self, device: &str) -> HalResult<String> {
        self.diskutil(&["verifyVolume", &device_path(device)], self.timeouts.check)
            .map(|out| out.combined())
    }

    fn repair_volume(&self, device: &str) -> HalResult<String> {
        self.diskutil(
            &["repairVolume", &device_path(device)],
            self.timeouts.command,
        )
        .map(|out| out.combined())
    }
}

impl PowerOps for MacosHal {
    fn battery(&self) -> HalResult<BatterySnapshot> {
        let out = process::run_capture(
            "pmset",
            Path::new("pmset"),
            &["-g".to_string(), "batt".to_string()],
            self.timeouts.info,
        )?;
        Ok(parse_pmset_batt(&out.stdout))
    }
}

fn parse_pmset_batt(text: &str) -> BatterySnapshot {
    if text.to_lowercase().contains("no batteries") {
        return BatterySnapshot {
            is_laptop: false,
            on_ac: true,
            percent: None,
        };
    }
    let on_ac = text.contains("AC Power");
    let percent = text
        .split('%')
        .next()
        .and_then(|part| part.split_whitespace().last())
        .and_then(|digits| digits.parse::<u32>().ok());
    BatterySnapshot {
        is_laptop: true,
        on_ac,
        percent,
    }
}

impl FsUsageOps for MacosHal {
    fn open_processes(&self, mount_point: &str) -> HalResult<Vec<BusyProcess>> {
        let args: Vec<String> = ["-Fpcn", "-f", "--", mount_point]
            .iter()
            .map(|s| s.to_string())
            .collect();
        // lsof exits 1 when nothing is open; treat that as an empty set.
        let out = match process::run_capture("lsof", Path::new("lsof"), &args, self.timeouts.info)
        {
            Ok(out) => out.stdout,
            Err(HalError::CommandFailed { code: Some(1), .. }) => String::new(),
            Err(err) => return Err(err),
        };
        Ok(parse_lsof_fields(&out))
    }

    fn signal_process(&self, pid: i32, signal: ProcessSignal) -> HalResult<()> {
        let sig = match signal {
            ProcessSignal::Term => libc::SIGTERM,
            ProcessSignal::Kill => libc::SIGKILL,
        };
        let rc = unsafe { libc::kill(pid, sig) };
        if rc != 0 {
            return Err(HalError::Other(format!("kill({pid}) failed")));
        }
        Ok(())
    }
}

fn parse_lsof_fields(text: &str) -> Vec<BusyProcess> {
    let mut processes = Vec::new();
    let mut seen = std::collections::HashSet::new();
    let mut current_pid: Option<i32> = None;
    for line in text.lines() {
        if let Some(rest) = line.strip_prefix('p') {
            current_pid = rest.parse::<i32>().ok();
        } else if let Some(rest) = line.strip_prefix('c') {
            if let Some(pid) = current_pid.take() {
                if seen.insert(pid) {
                    processes.push(BusyProcess {
                        pid,
                        command: rest.to_string(),
                    });
                }
            }
        }
    }
    processes
}

impl BlockIoOps for MacosHal {
    fn open_block_read(&self, device: &str) -> HalResult<File> {
        File::options()
            .read(true)
            .open(device_path(device))
            .map_err(HalError::Io)
    }

    fn open_block_write(&self, device: &str) -> HalResult<File> {
        File::options()
            .write(true)
            .open(device_path(device))
            .map_err(HalError::Io)
    }

    fn raw_device_path(&self, device: &str) -> String {
        let device = device_path(device);
        if device.contains("/dev/rdisk") {
            device
        } else if let Some(stripped) = device.strip_prefix("/dev/disk") {
            format!("/dev/rdisk{stripped}")
        } else {
            device.replace("/dev/", "/dev/r")
        }
    }
}

impl ImageAttachOps for MacosHal {
    fn attach_image_readonly(&self, image: &Path) -> HalResult<PathBuf> {
        let args: Vec<String> = [
            "attach",
            "-nobrowse",
            "-readonly",
            "-plist",
            &image.display().to_string(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let out = process::run_capture(
            "hdiutil",
            Path::new("hdiutil"),
            &args,
            self.timeouts.command,
        )?;
        let value = Value::from_reader_xml(out.stdout.as_bytes())
            .map_err(|err| HalError::Parse(format!("hdiutil plist: {err}")))?;
        let dict = value
            .into_dictionary()
            .ok_or_else(|| HalError::Parse("hdiutil plist root is not a dictionary".to_string()))?;
        for entity in plist_dict::array(&dict, &["system-entities"]) {
            if let Some(entity) = entity.as_dictionary() {
                if let Some(mount) = plist_dict::string(entity, &["mount-point"]) {
                    return Ok(PathBuf::from(mount));
                }
            }
        }
        Err(HalError::Parse(
            "hdiutil attach produced no mount point".to_string(),
        ))
    }

    fn detach_image(&self, mount_point: &Path) -> HalResult<()> {
        let args: Vec<String> = ["detach", &mount_point.display().to_string()]
            .iter()
            .map(|s| s.to_string())
            .collect();
        process::run_capture(
            "hdiutil",
            Path::new("hdiutil"),
            &args,
            self.timeouts.command,
        )
        .map(|_| ())
    }
}

impl SidecarOps for MacosHal {
    fn run_sidecar(
        &self,
        invocation: &SidecarInvocation,
        on_line: &mut dyn FnMut(&str) -> bool,
    ) -> HalResult<String> {
        let path = sidecar::require(&invocation.binary)?;
        let out = process::run_streaming(
            &invocation.binary,
            &path,
            &invocation.args,
            invocation.timeout,
            on_line,
        )?;
        Ok(out.combined())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_device_path_maps_disk_nodes() {
        let hal = MacosHal::new();
        assert_eq!(hal.raw_device_path("disk4"), "/dev/rdisk4");
        assert_eq!(hal.raw_device_path("/dev/disk4s2"), "/dev/rdisk4s2");
        assert_eq!(hal.raw_device_path("/dev/rdisk4"), "/dev/rdisk4");
    }

    #[test]
    fn fs_type_normalization_covers_the_families() {
        let family = |s: &str| normalize_fs_type(&[s.to_string()]);
        assert_eq!(family("APFS").as_deref(), Some("apfs"));
        assert_eq!(family("Microsoft Basic Data NTFS").as_deref(), Some("ntfs"));
        assert_eq!(family("msdos").as_deref(), Some("fat32"));
        assert_eq!(family("Linux Filesystem").as_deref(), Some("ext4"));
        assert_eq!(family("mystery"), None);
    }

    #[test]
    fn pmset_desktop_reports_no_battery() {
        let snap = parse_pmset_batt("Now drawing from 'AC Power'\nNo batteries available\n");
        assert!(!snap.is_laptop);
        assert!(snap.on_ac);
    }

    #[test]
    fn pmset_laptop_parses_percent_and_source() {
        let text = "Now drawing from 'Battery Power'\n -InternalBattery-0 (id=123)\t47%; discharging; 3:05 remaining\n";
        let snap = parse_pmset_batt(text);
        assert!(snap.is_laptop);
        assert!(!snap.on_ac);
        assert_eq!(snap.percent, Some(47));
    }

    #[test]
    fn lsof_field_output_parses_pid_command_pairs() {
        let text = "p312\ncFinder\nn/Volumes/USB/file\np9001\ncmds\nn/Volumes/USB/other\n";
        let procs = parse_lsof_fields(text);
        assert_eq!(procs.len(), 2);
        assert_eq!(procs[0].pid, 312);
        assert_eq!(procs[0].command, "Finder");
    }

    #[test]
    fn device_path_adds_prefix_once() {
        assert_eq!(device_path("disk2"), "/dev/disk2");
        assert_eq!(device_path("/dev/disk2"), "/dev/disk2");
    }
}
