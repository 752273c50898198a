//! Device inspector: topology snapshots, protection classification, bounds.
//!
//! The inspector never blocks an operation; it only reports. Every call
//! yields a fresh snapshot.

use crate::config::{EngineConfig, MIB};
use crate::model::{
    ApfsContainer, ApfsVolume, Device, Partition, PartitionBounds, ProtectionReason,
    UnallocatedSegment,
};
use oxidisk_error::{EngineError, EngineResult};
use oxidisk_hal::{DiskHal, RawApfsContainer, RawDisk};

pub struct Inspector<'a> {
    hal: &'a dyn DiskHal,
    cfg: &'a EngineConfig,
}

impl<'a> Inspector<'a> {
    pub fn new(hal: &'a dyn DiskHal, cfg: &'a EngineConfig) -> Self {
        Self { hal, cfg }
    }

    pub fn list_devices(&self, include_system: bool) -> EngineResult<Vec<Device>> {
        let mut devices = Vec::new();
        for raw in self.hal.list_disks()? {
            if !include_system && (raw.internal || raw.virtual_device) {
                continue;
            }
            devices.push(self.build_device(&raw));
        }
        Ok(devices)
    }

    /// Snapshot a single whole disk by identifier.
    pub fn device(&self, disk_id: &str) -> EngineResult<Device> {
        let disk_id = normalize(disk_id);
        let raw = self
            .hal
            .list_disks()?
            .into_iter()
            .find(|d| d.identifier == disk_id)
            .ok_or(EngineError::DeviceGone {
                identifier: disk_id.clone(),
            })?;
        Ok(self.build_device(&raw))
    }

    pub fn partition_bounds(&self, identifier: &str) -> EngineResult<PartitionBounds> {
        let identifier = normalize(identifier);
        let info = self
            .hal
            .device_info(&identifier)
            .map_err(|_| EngineError::DeviceGone {
                identifier: identifier.clone(),
            })?;
        let offset = info
            .partition_offset
            .ok_or_else(|| EngineError::invalid("partition", "target is not a partition"))?;
        let size = info
            .partition_size
            .ok_or_else(|| EngineError::invalid("partition", "target is not a partition"))?;
        let disk_id = info
            .parent_whole_disk
            .ok_or_else(|| EngineError::invalid("partition", "target has no parent disk"))?;

        let disk = self.device(&disk_id)?;
        let mut siblings: Vec<(u64, u64)> = disk
            .partitions
            .iter()
            .filter(|p| p.identifier != identifier)
            .filter_map(|p| p.offset.map(|o| (o, p.size)))
            .collect();
        siblings.sort_by_key(|(o, _)| *o);

        let prev_end = siblings
            .iter()
            .filter(|(o, _)| *o < offset)
            .map(|(o, s)| o + s)
            .max()
            .unwrap_or(MIB);
        let next_start = siblings
            .iter()
            .filter(|(o, _)| *o > offset)
            .map(|(o, _)| *o)
            .min()
            .unwrap_or(disk.size);

        let min_start = prev_end.max(MIB);
        let max_start = next_start.saturating_sub(size).max(min_start);

        Ok(PartitionBounds {
            offset,
            size,
            min_start,
            max_start,
            block_size: info.block_size,
        })
    }

    pub fn apfs_container(&self, container: &str) -> EngineResult<ApfsContainer> {
        let needle = normalize(container);
        let containers = self.hal.apfs_containers()?;
        let raw = containers
            .into_iter()
            .find(|c| container_matches(c, &needle))
            .ok_or(EngineError::DeviceGone {
                identifier: needle.clone(),
            })?;

        let volumes = raw
            .volumes
            .into_iter()
            .map(|v| {
                let is_protected = v
                    .roles
                    .iter()
                    .any(|role| self.cfg.protected_roles.iter().any(|p| p == role));
                ApfsVolume {
                    identifier: v.identifier,
                    name: v.name,
                    roles: v.roles,
                    size: v.size,
                    used: v.used,
                    mount_point: v.mount_point,
                    is_protected,
                }
            })
            .collect();

        Ok(ApfsContainer {
            container_identifier: raw.reference,
            container_uuid: raw.uuid,
            capacity: raw.capacity,
            capacity_free: raw.capacity_free,
            capacity_used: raw.capacity_used,
            volumes,
        })
    }

    /// Protection classification for a single device node.
    pub fn protection_of(&self, identifier: &str) -> EngineResult<Option<ProtectionReason>> {
        let info = self.hal.device_info(&normalize(identifier))?;
        if !info.internal {
            return Ok(None);
        }
        Ok(self.reason_from_roles(&info.apfs_roles))
    }

    fn reason_from_roles(&self, roles: &[String]) -> Option<ProtectionReason> {
        roles
            .iter()
            .filter(|role| self.cfg.protected_roles.iter().any(|p| &p == role))
            .filter_map(|role| ProtectionReason::from_role(role))
            .next()
    }

    fn build_device(&self, raw: &RawDisk) -> Device {
        let mut partitions: Vec<Partition> = raw
            .partitions
            .iter()
            .map(|part| {
                let info = self.hal.device_info(&part.identifier).unwrap_or_default();
                let protection = if raw.internal {
                    self.reason_from_roles(&info.apfs_roles)
                } else {
                    None
                };
                Partition {
                    identifier: part.identifier.clone(),
                    name: part.volume_name.clone(),
                    size: part.size,
                    offset: if part.offset > 0 {
                        Some(part.offset)
                    } else {
                        info.partition_offset
                    },
                    content: part.content.clone(),
                    fs_type: info.fs_type,
                    mount_point: part.mount_point.clone().or(info.mount_point),
                    is_protected: protection.is_some(),
                    protection_reason: protection,
                }
            })
            .collect();
        partitions.sort_by_key(|p| p.offset.unwrap_or(u64::MAX));

        let unallocated = gaps(raw.size, &partitions);
        let device_reason = partitions.iter().find_map(|p| p.protection_reason);

        Device {
            identifier: raw.identifier.clone(),
            size: raw.size,
            internal: raw.internal,
            is_solid_state: raw.solid_state,
            bus_protocol: raw.bus_protocol.clone(),
            content: raw.content.clone(),
            parent_device: raw.physical_store.clone(),
            partitions,
            unallocated,
            is_protected: device_reason.is_some(),
            protection_reason: device_reason,
        }
    }
}

fn gaps(disk_size: u64, partitions: &[Partition]) -> Vec<UnallocatedSegment> {
    let mut segments = Vec::new();
    let mut cursor = MIB;
    for part in partitions {
        let Some(offset) = part.offset else { continue };
        if offset > cursor && offset - cursor >= MIB {
            segments.push(UnallocatedSegment {
                key: format!("free-{cursor}"),
                offset: cursor,
                size: offset - cursor,
            });
        }
        cursor = cursor.max(offset + part.size);
    }
    if disk_size > cursor && disk_size - cursor >= MIB {
        segments.push(UnallocatedSegment {
            key: format!("free-{cursor}"),
            offset: cursor,
            size: disk_size - cursor,
        });
    }
    segments
}

fn container_matches(container: &RawApfsContainer, needle: &str) -> bool {
    if container.reference == needle {
        return true;
    }
    if container.physical_stores.iter().any(|s| s == needle) {
        return true;
    }
    container.volumes.iter().any(|v| v.identifier == needle)
}

fn normalize(identifier: &str) -> String {
    identifier.trim_start_matches("/dev/").to_string()
}
