//! Normalized topology model.
//!
//! Snapshots are immutable value types. A scan yields fresh instances; the
//! engine never mutates a snapshot in place.

use serde::Serialize;

/// Why a target is immutable from this engine. Enumerated, never free text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtectionReason {
    SystemRole,
    DataRole,
    PrebootRole,
    RecoveryRole,
    VmRole,
    SystemDisk,
}

impl ProtectionReason {
    pub fn from_role(role: &str) -> Option<Self> {
        match role {
            "System" => Some(ProtectionReason::SystemRole),
            "Data" => Some(ProtectionReason::DataRole),
            "Preboot" => Some(ProtectionReason::PrebootRole),
            "Recovery" => Some(ProtectionReason::RecoveryRole),
            "VM" => Some(ProtectionReason::VmRole),
            _ => None,
        }
    }

    /// Stable tag used in preflight blockers and error payloads.
    pub fn tag(&self) -> &'static str {
        match self {
            ProtectionReason::SystemRole => "protected:system",
            ProtectionReason::DataRole => "protected:data",
            ProtectionReason::PrebootRole => "protected:preboot",
            ProtectionReason::RecoveryRole => "protected:recovery",
            ProtectionReason::VmRole => "protected:vm",
            ProtectionReason::SystemDisk => "protected:system-disk",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Partition {
    pub identifier: String,
    pub name: String,
    pub size: u64,
    pub offset: Option<u64>,
    pub content: String,
    pub fs_type: Option<String>,
    pub mount_point: Option<String>,
    pub is_protected: bool,
    pub protection_reason: Option<ProtectionReason>,
}

/// Gap between partitions, synthesized during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnallocatedSegment {
    pub key: String,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub identifier: String,
    pub size: u64,
    pub internal: bool,
    pub is_solid_state: bool,
    pub bus_protocol: Option<String>,
    pub content: String,
    pub parent_device: Option<String>,
    pub partitions: Vec<Partition>,
    pub unallocated: Vec<UnallocatedSegment>,
    pub is_protected: bool,
    pub protection_reason: Option<ProtectionReason>,
}

impl Device {
    /// Largest free gap, if any.
    pub fn largest_gap(&self) -> Option<&UnallocatedSegment> {
        self.unallocated.iter().max_by_key(|seg| seg.size)
    }
}

/// Legal move range for a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionBounds {
    pub offset: u64,
    pub size: u64,
    pub min_start: u64,
    pub max_start: u64,
    pub block_size: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApfsVolume {
    pub identifier: String,
    pub name: String,
    pub roles: Vec<String>,
    pub size: u64,
    pub used: u64,
    pub mount_point: Option<String>,
    pub is_protected: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApfsContainer {
    pub container_identifier: String,
    pub container_uuid: Option<String>,
    pub capacity: Option<u64>,
    pub capacity_free: Option<u64>,
    pub capacity_used: Option<u64>,
    pub volumes: Vec<ApfsVolume>,
}
