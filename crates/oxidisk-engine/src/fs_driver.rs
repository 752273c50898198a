//! Per-filesystem sidecar command tables.
//!
//! Each driver knows how to build argv for the external tools that make,
//! label, re-identify, check and resize its filesystem. The engine never
//! spells a sidecar command line anywhere else.

use crate::labels::FsKind;

/// A sidecar command: binary name plus argv.
pub type DriverCommand = (&'static str, Vec<String>);

pub trait FileSystemDriver {
    fn kind(&self) -> FsKind;

    fn mkfs_command(&self, device: &str, label: &str) -> Option<DriverCommand>;

    fn label_command(&self, device: &str, label: &str) -> Option<DriverCommand> {
        let _ = (device, label);
        None
    }

    fn uuid_command(&self, device: &str, uuid: &str) -> Option<DriverCommand> {
        let _ = (device, uuid);
        None
    }

    /// Read-only consistency check.
    fn check_command(&self, device: &str) -> Option<DriverCommand> {
        let _ = device;
        None
    }

    /// Repairing consistency check.
    fn repair_command(&self, device: &str) -> Option<DriverCommand> {
        let _ = device;
        None
    }

    /// Resize the filesystem. `size_arg` is a `<mib>M` string; `None` grows
    /// to fill the partition.
    fn resize_command(&self, device: &str, size_arg: Option<&str>) -> Option<DriverCommand> {
        let _ = (device, size_arg);
        None
    }
}

pub struct Ext4Driver;

impl FileSystemDriver for Ext4Driver {
    fn kind(&self) -> FsKind {
        FsKind::Ext4
    }

    fn mkfs_command(&self, device: &str, label: &str) -> Option<DriverCommand> {
        Some((
            "mkfs.ext4",
            vec![
                "-F".to_string(),
                "-L".to_string(),
                label.to_string(),
                device.to_string(),
            ],
        ))
    }

    fn label_command(&self, device: &str, label: &str) -> Option<DriverCommand> {
        Some(("e2label", vec![device.to_string(), label.to_string()]))
    }

    fn uuid_command(&self, device: &str, uuid: &str) -> Option<DriverCommand> {
        Some((
            "tune2fs",
            vec!["-U".to_string(), uuid.to_string(), device.to_string()],
        ))
    }

    fn check_command(&self, device: &str) -> Option<DriverCommand> {
        Some((
            "e2fsck",
            vec!["-n".to_string(), "-f".to_string(), device.to_string()],
        ))
    }

    fn repair_command(&self, device: &str) -> Option<DriverCommand> {
        Some((
            "e2fsck",
            vec!["-p".to_string(), "-f".to_string(), device.to_string()],
        ))
    }

    fn resize_command(&self, device: &str, size_arg: Option<&str>) -> Option<DriverCommand> {
        let mut args = vec![device.to_string()];
        if let Some(size) = size_arg {
            args.push(size.to_string());
        }
        Some(("resize2fs", args))
    }
}

pub struct NtfsDriver;

impl FileSystemDriver for NtfsDriver {
    fn kind(&self) -> FsKind {
        FsKind::Ntfs
    }

    fn mkfs_command(&self, device: &str, label: &str) -> Option<DriverCommand> {
        Some((
            "mkfs.ntfs",
            vec![
                "-F".to_string(),
                "-L".to_string(),
                label.to_string(),
                device.to_string(),
            ],
        ))
    }

    fn label_command(&self, device: &str, label: &str) -> Option<DriverCommand> {
        Some(("ntfslabel", vec![device.to_string(), label.to_string()]))
    }

    fn check_command(&self, device: &str) -> Option<DriverCommand> {
        Some(("ntfsfix", vec!["-n".to_string(), device.to_string()]))
    }

    fn repair_command(&self, device: &str) -> Option<DriverCommand> {
        Some(("ntfsfix", vec![device.to_string()]))
    }

    fn resize_command(&self, device: &str, size_arg: Option<&str>) -> Option<DriverCommand> {
        match size_arg {
            Some(size) => Some((
                "ntfsresize",
                vec!["-s".to_string(), size.to_string(), device.to_string()],
            )),
            None => Some(("ntfsresize", vec![device.to_string()])),
        }
    }
}

pub struct BtrfsDriver;

impl FileSystemDriver for BtrfsDriver {
    fn kind(&self) -> FsKind {
        FsKind::Btrfs
    }

    fn mkfs_command(&self, device: &str, label: &str) -> Option<DriverCommand> {
        Some((
            "mkfs.btrfs",
            vec![
                "-f".to_string(),
                "-L".to_string(),
                label.to_string(),
                device.to_string(),
            ],
        ))
    }

    fn label_command(&self, device: &str, label: &str) -> Option<DriverCommand> {
        Some((
            "btrfs",
            vec![
                "filesystem".to_string(),
                "label".to_string(),
                device.to_string(),
                label.to_string(),
            ],
        ))
    }
}

pub struct XfsDriver;

impl FileSystemDriver for XfsDriver {
    fn kind(&self) -> FsKind {
        FsKind::Xfs
    }

    fn mkfs_command(&self, device: &str, label: &str) -> Option<DriverCommand> {
        Some((
            "mkfs.xfs",
            vec![
                "-f".to_string(),
                "-L".to_string(),
                label.to_string(),
                device.to_string(),
            ],
        ))
    }

    fn label_command(&self, device: &str, label: &str) -> Option<DriverCommand> {
        Some((
            "xfs_admin",
            vec!["-L".to_string(), label.to_string(), device.to_string()],
        ))
    }
}

pub struct F2fsDriver;

impl FileSystemDriver for F2fsDriver {
    fn kind(&self) -> FsKind {
        FsKind::F2fs
    }

    fn mkfs_command(&self, device: &str, _label: &str) -> Option<DriverCommand> {
        Some(("mkfs.f2fs", vec![device.to_string()]))
    }
}

pub struct SwapDriver;

impl FileSystemDriver for SwapDriver {
    fn kind(&self) -> FsKind {
        FsKind::Swap
    }

    fn mkfs_command(&self, device: &str, _label: &str) -> Option<DriverCommand> {
        Some(("mkswap", vec![device.to_string()]))
    }
}

pub fn driver_for(fs: FsKind) -> Option<Box<dyn FileSystemDriver>> {
    match fs {
        FsKind::Ext4 => Some(Box::new(Ext4Driver)),
        FsKind::Ntfs => Some(Box::new(NtfsDriver)),
        FsKind::Btrfs => Some(Box::new(BtrfsDriver)),
        FsKind::Xfs => Some(Box::new(XfsDriver)),
        FsKind::F2fs => Some(Box::new(F2fsDriver)),
        FsKind::Swap => Some(Box::new(SwapDriver)),
        FsKind::Fat32 | FsKind::Exfat | FsKind::Apfs => None,
    }
}

/// Binary that makes this filesystem, for preflight's sidecar gate.
pub fn mkfs_binary(fs: FsKind) -> Option<&'static str> {
    driver_for(fs)
        .and_then(|driver| driver.mkfs_command("/dev/null", "X"))
        .map(|(binary, _)| binary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn native_families_have_no_driver() {
        assert!(driver_for(FsKind::Apfs).is_none());
        assert!(driver_for(FsKind::Fat32).is_none());
        assert!(driver_for(FsKind::Exfat).is_none());
    }

    #[test]
    fn ext4_commands_cover_the_lifecycle() {
        let driver = Ext4Driver;
        let (bin, args) = driver.mkfs_command("/dev/disk4s2", "DATA").unwrap();
        assert_eq!(bin, "mkfs.ext4");
        assert!(args.contains(&"DATA".to_string()));

        let (bin, _) = driver.check_command("/dev/disk4s2").unwrap();
        assert_eq!(bin, "e2fsck");

        let (bin, args) = driver.resize_command("/dev/disk4s2", Some("512M")).unwrap();
        assert_eq!(bin, "resize2fs");
        assert_eq!(args, vec!["/dev/disk4s2", "512M"]);

        let (_, args) = driver.resize_command("/dev/disk4s2", None).unwrap();
        assert_eq!(args, vec!["/dev/disk4s2"]);
    }

    #[test]
    fn ntfs_shrink_passes_size_flag() {
        let (bin, args) = NtfsDriver
            .resize_command("/dev/disk4s3", Some("900M"))
            .unwrap();
        assert_eq!(bin, "ntfsresize");
        assert_eq!(args, vec!["-s", "900M", "/dev/disk4s3"]);
    }

    #[test]
    fn mkfs_binary_matches_driver_table() {
        assert_eq!(mkfs_binary(FsKind::Ext4), Some("mkfs.ext4"));
        assert_eq!(mkfs_binary(FsKind::Swap), Some("mkswap"));
        assert_eq!(mkfs_binary(FsKind::Apfs), None);
    }
}
