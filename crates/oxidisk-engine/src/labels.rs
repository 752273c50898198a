//! Filesystem families and their label/UUID policies.

use oxidisk_error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsKind {
    Fat32,
    Exfat,
    Ntfs,
    Ext4,
    Btrfs,
    Xfs,
    F2fs,
    Apfs,
    Swap,
}

impl FsKind {
    pub fn parse(value: &str) -> EngineResult<Self> {
        match value.to_lowercase().as_str() {
            "fat32" | "msdos" => Ok(FsKind::Fat32),
            "exfat" => Ok(FsKind::Exfat),
            "ntfs" => Ok(FsKind::Ntfs),
            "ext4" => Ok(FsKind::Ext4),
            "btrfs" => Ok(FsKind::Btrfs),
            "xfs" => Ok(FsKind::Xfs),
            "f2fs" => Ok(FsKind::F2fs),
            "apfs" => Ok(FsKind::Apfs),
            "swap" => Ok(FsKind::Swap),
            other => Err(EngineError::invalid(
                "fs",
                format!("unknown filesystem: {other}"),
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FsKind::Fat32 => "fat32",
            FsKind::Exfat => "exfat",
            FsKind::Ntfs => "ntfs",
            FsKind::Ext4 => "ext4",
            FsKind::Btrfs => "btrfs",
            FsKind::Xfs => "xfs",
            FsKind::F2fs => "f2fs",
            FsKind::Apfs => "apfs",
            FsKind::Swap => "swap",
        }
    }

    /// The name diskutil uses when it can make this filesystem itself.
    pub fn diskutil_name(&self) -> Option<&'static str> {
        match self {
            FsKind::Fat32 => Some("MS-DOS"),
            FsKind::Exfat => Some("ExFAT"),
            FsKind::Apfs => Some("APFS"),
            _ => None,
        }
    }

    /// Filesystems macOS mounts natively after a format.
    pub fn natively_mountable(&self) -> bool {
        matches!(self, FsKind::Fat32 | FsKind::Exfat | FsKind::Apfs | FsKind::Ntfs)
    }

    /// Families made by an external mkfs sidecar rather than diskutil.
    pub fn needs_mkfs_sidecar(&self) -> bool {
        self.diskutil_name().is_none()
    }

    /// GPT typecode stamped after creating this filesystem, if any.
    pub fn gpt_typecode(&self) -> Option<&'static str> {
        match self {
            FsKind::Ext4 | FsKind::Btrfs | FsKind::Xfs | FsKind::F2fs => Some("8300"),
            FsKind::Ntfs => Some("0700"),
            FsKind::Swap => Some("8200"),
            _ => None,
        }
    }
}

/// Validate a volume label against the per-filesystem policy.
pub fn validate_label(fs: FsKind, label: &str) -> EngineResult<()> {
    match fs {
        FsKind::Fat32 => {
            if label.len() > 11
                || !label
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || " _-".contains(c))
            {
                return Err(EngineError::invalid(
                    "label",
                    "fat32 labels are at most 11 chars, uppercase A-Z, 0-9, space, _ or -",
                ));
            }
        }
        FsKind::Exfat => {
            if label.len() > 15 {
                return Err(EngineError::invalid(
                    "label",
                    "exfat labels are at most 15 chars",
                ));
            }
        }
        FsKind::Ntfs | FsKind::Ext4 | FsKind::Apfs | FsKind::Btrfs | FsKind::Xfs | FsKind::F2fs => {
            if label.len() > 32 {
                return Err(EngineError::invalid(
                    "label",
                    format!("{} labels are at most 32 chars", fs.as_str()),
                ));
            }
        }
        FsKind::Swap => {
            if !label.is_empty() {
                return Err(EngineError::invalid("label", "swap takes no label"));
            }
        }
    }
    Ok(())
}

/// Validate a UUID against the per-filesystem policy.
pub fn validate_uuid(fs: FsKind, value: &str) -> EngineResult<()> {
    match fs {
        FsKind::Ext4 => {
            if value == "random" {
                return Ok(());
            }
            parse_rfc4122(value)
        }
        FsKind::Apfs => parse_rfc4122(value),
        _ => Err(EngineError::invalid(
            "uuid",
            format!("{} does not support UUID changes", fs.as_str()),
        )),
    }
}

fn parse_rfc4122(value: &str) -> EngineResult<()> {
    uuid::Uuid::try_parse(value)
        .map(|_| ())
        .map_err(|_| EngineError::invalid("uuid", "expected RFC-4122 form"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fat32_label_policy() {
        validate_label(FsKind::Fat32, "OXI_BACKUP").unwrap();
        validate_label(FsKind::Fat32, "A B-C_1").unwrap();
        assert!(validate_label(FsKind::Fat32, "too-long-label-here").is_err());
        assert!(validate_label(FsKind::Fat32, "lower").is_err());
    }

    #[test]
    fn exfat_and_ntfs_length_limits() {
        validate_label(FsKind::Exfat, "Fifteen-chars!!").unwrap();
        assert!(validate_label(FsKind::Exfat, "sixteen-chars!!!").is_err());
        validate_label(FsKind::Ntfs, &"x".repeat(32)).unwrap();
        assert!(validate_label(FsKind::Ntfs, &"x".repeat(33)).is_err());
    }

    #[test]
    fn swap_takes_no_label() {
        validate_label(FsKind::Swap, "").unwrap();
        assert!(validate_label(FsKind::Swap, "SWAP").is_err());
    }

    #[test]
    fn ext4_uuid_accepts_random_and_rfc4122() {
        validate_uuid(FsKind::Ext4, "random").unwrap();
        validate_uuid(FsKind::Ext4, "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9").unwrap();
        assert!(validate_uuid(FsKind::Ext4, "not-a-uuid").is_err());
    }

    #[test]
    fn fat_families_refuse_uuid_changes() {
        assert!(validate_uuid(FsKind::Fat32, "random").is_err());
        assert!(validate_uuid(FsKind::Exfat, "0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9").is_err());
    }

    #[test]
    fn parse_round_trips_families() {
        for name in ["fat32", "exfat", "ntfs", "ext4", "btrfs", "xfs", "f2fs", "apfs", "swap"] {
            assert_eq!(FsKind::parse(name).unwrap().as_str(), name);
        }
        assert!(FsKind::parse("zfs").is_err());
    }
}
