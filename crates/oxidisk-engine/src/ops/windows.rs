//! Windows-installer staging: GPT + exFAT target, file-level copy from the
//! mounted ISO, and an `autounattend.xml` with the requested overrides.
//!
//! exFAT carries installer files above the FAT32 4 GiB limit, which is why
//! this is a file copy and not a raw image write.

use super::image::{inspect_image, InspectImageRequest};
use super::{OpCtx, OpReport};
use crate::inspector::Inspector;
use crate::labels::{self, FsKind};
use oxidisk_error::{EngineError, EngineResult};
use oxidisk_hal::guards::ImageMountGuard;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use walkdir::WalkDir;

const DEFAULT_LABEL: &str = "WININSTALL";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowsInstallRequest {
    pub source_path: String,
    pub target_device: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub filesystem: Option<FsKind>,
    #[serde(default)]
    pub tpm_bypass: bool,
    #[serde(default)]
    pub local_account: bool,
    #[serde(default)]
    pub privacy_defaults: bool,
}

pub fn windows_install(ctx: &OpCtx, req: &WindowsInstallRequest) -> EngineResult<OpReport> {
    let fs = req.filesystem.unwrap_or(FsKind::Exfat);
    match fs {
        FsKind::Exfat => {}
        FsKind::Fat32 => {
            return Err(EngineError::Unsupported {
                reason: "FAT32 two-partition staging is not implemented".to_string(),
            })
        }
        other => {
            return Err(EngineError::invalid(
                "fs",
                format!("windows staging requires exfat, got {}", other.as_str()),
            ))
        }
    }

    let label = req.label.clone().unwrap_or_else(|| DEFAULT_LABEL.to_string());
    labels::validate_label(FsKind::Exfat, &label)?;

    let inspection = inspect_image(
        ctx,
        &InspectImageRequest {
            source_path: req.source_path.clone(),
        },
    )?;
    if !inspection.is_windows {
        return Err(EngineError::invalid(
            "sourcePath",
            format!("not a windows installer image ({})", inspection.reason),
        ));
    }

    let target = ctx.norm(&req.target_device);
    ctx.progress("prepare", 5, Some("Preparing target volume"));
    ctx.force_unmount_disk(&target)?;
    ctx.check_cancel()?;
    ctx.hal.erase_disk(&target, "ExFAT", &label, "GPT")?;

    let snapshot = Inspector::new(ctx.hal, ctx.cfg).device(&target)?;
    let volume = snapshot
        .partitions
        .first()
        .map(|p| p.identifier.clone())
        .ok_or(EngineError::DeviceGone {
            identifier: target.clone(),
        })?;
    ctx.hal.mount_volume(&volume)?;
    let dest_root = ctx
        .hal
        .device_info(&volume)?
        .mount_point
        .ok_or_else(|| EngineError::Io {
            op: "mount".to_string(),
            detail: "staging volume did not mount".to_string(),
        })?;

    let mount = ctx.hal.attach_image_readonly(Path::new(&req.source_path))?;
    let guard = ImageMountGuard::new(ctx.hal, mount);

    ctx.progress("copy", 10, Some("Copying installer files"));
    let (files, bytes) = copy_tree(ctx, guard.mount_point(), Path::new(&dest_root))?;

    let autounattend = req.tpm_bypass || req.local_account || req.privacy_defaults;
    if autounattend {
        ctx.progress("configure", 95, Some("Writing answer file"));
        let content = build_autounattend(req.tpm_bypass, req.local_account, req.privacy_defaults);
        std::fs::write(Path::new(&dest_root).join("autounattend.xml"), content)
            .map_err(|e| EngineError::io("answer file write", e))?;
    }

    drop(guard);
    ctx.resync(&target);
    ctx.progress("copy", 100, Some("Installer staged"));
    Ok(OpReport::with_details(json!({
        "target": target,
        "volume": volume,
        "label": label,
        "files": files,
        "bytes": bytes,
        "autounattend": autounattend,
    })))
}

/// File-level copy with byte-counted progress. Cancel is honored between
/// files.
fn copy_tree(ctx: &OpCtx, src_root: &Path, dest_root: &Path) -> EngineResult<(u64, u64)> {
    let mut total_bytes: u64 = 0;
    for entry in WalkDir::new(src_root).follow_links(false) {
        let entry = entry.map_err(|e| EngineError::Io {
            op: "iso walk".to_string(),
            detail: e.to_string(),
        })?;
        if entry.file_type().is_file() {
            total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }

    let mut files: u64 = 0;
    let mut copied: u64 = 0;
    for entry in WalkDir::new(src_root).follow_links(false) {
        ctx.check_cancel()?;
        let entry = entry.map_err(|e| EngineError::Io {
            op: "iso walk".to_string(),
            detail: e.to_string(),
        })?;
        let rel = entry
            .path()
            .strip_prefix(src_root)
            .map_err(|e| EngineError::Io {
                op: "iso walk".to_string(),
                detail: e.to_string(),
            })?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = dest_root.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&dest).map_err(|e| EngineError::io("staging mkdir", e))?;
            continue;
        }
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::io("staging mkdir", e))?;
        }
        let len = std::fs::copy(entry.path(), &dest)
            .map_err(|e| EngineError::io("staging copy", e))?;
        files += 1;
        copied += len;
        ctx.progress_bytes("copy", copied, Some(total_bytes));
    }
    Ok((files, copied))
}

fn build_autounattend(tpm_bypass: bool, local_account: bool, privacy_defaults: bool) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="utf-8"?>
<unattend xmlns="urn:schemas-microsoft-com:unattend">
"#,
    );

    if tpm_bypass {
        xml.push_str(
            r#"  <settings pass="windowsPE">
    <component name="Microsoft-Windows-Setup" processorArchitecture="amd64" publicKeyToken="31bf3856ad364e35" language="neutral" versionScope="nonSxS">
      <RunSynchronous>
        <RunSynchronousCommand wcm:action="add" xmlns:wcm="http://schemas.microsoft.com/WMIConfig/2002/State">
          <Order>1</Order>
          <Path>reg add HKLM\SYSTEM\Setup\LabConfig /v BypassTPMCheck /t REG_DWORD /d 1 /f</Path>
        </RunSynchronousCommand>
        <RunSynchronousCommand wcm:action="add" xmlns:wcm="http://schemas.microsoft.com/WMIConfig/2002/State">
          <Order>2</Order>
          <Path>reg add HKLM\SYSTEM\Setup\LabConfig /v BypassSecureBootCheck /t REG_DWORD /d 1 /f</Path>
        </RunSynchronousCommand>
        <RunSynchronousCommand wcm:action="add" xmlns:wcm="http://schemas.microsoft.com/WMIConfig/2002/State">
          <Order>3</Order>
          <Path>reg add HKLM\SYSTEM\Setup\LabConfig /v BypassRAMCheck /t REG_DWORD /d 1 /f</Path>
        </RunSynchronousCommand>
      </RunSynchronous>
    </component>
  </settings>
"#,
        );
    }

    if local_account || privacy_defaults {
        xml.push_str(
            r#"  <settings pass="oobeSystem">
    <component name="Microsoft-Windows-Shell-Setup" processorArchitecture="amd64" publicKeyToken="31bf3856ad364e35" language="neutral" versionScope="nonSxS">
      <OOBE>
"#,
        );
        if local_account {
            xml.push_str(
                "        <HideOnlineAccountScreens>true</HideOnlineAccountScreens>\n        <HideWirelessSetupInOOBE>true</HideWirelessSetupInOOBE>\n",
            );
        }
        if privacy_defaults {
            xml.push_str(
                "        <ProtectYourPC>3</ProtectYourPC>\n        <HideEULAPage>true</HideEULAPage>\n",
            );
        }
        xml.push_str(
            r#"      </OOBE>
    </component>
  </settings>
"#,
        );
    }

    xml.push_str("</unattend>\n");
    xml
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::OpBus;
    use crate::config::{EngineConfig, MIB};
    use crate::journal::JournalStore;
    use oxidisk_hal::{FakeDisk, FakeHal};
    use std::time::Duration;
    use tempfile::tempdir;

    struct Fixture {
        hal: FakeHal,
        cfg: EngineConfig,
        bus: OpBus,
        journal: JournalStore,
        tmp: tempfile::TempDir,
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
                tmp,
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

        /// Minimal windows installer tree behind a fake ISO attachment.
        fn windows_iso(&self) -> String {
            let root = self.tmp.path().join("iso-root");
            std::fs::create_dir_all(root.join("sources")).unwrap();
            std::fs::create_dir_all(root.join("boot")).unwrap();
            std::fs::write(root.join("bootmgr"), b"MZ-bootmgr").unwrap();
            std::fs::write(root.join("sources/install.wim"), vec![7u8; 4096]).unwrap();
            std::fs::write(root.join("boot/bcd"), b"bcd-store").unwrap();
            let iso = self.tmp.path().join("win11.iso");
            std::fs::write(&iso, b"iso-bytes").unwrap();
            self.hal.map_attachment(&iso, root);
            iso.display().to_string()
        }
    }

    #[test]
    fn stages_files_and_answer_file_onto_exfat_volume() {
        let fx = Fixture::new();
        fx.hal.add_disk(FakeDisk::external("disk4", 64 * MIB));
        let dest = fx.tmp.path().join("staged");
        std::fs::create_dir_all(&dest).unwrap();
        fx.hal.set_mount_override("disk4s1", dest.clone());
        let iso = fx.windows_iso();

        let report = windows_install(
            &fx.ctx(),
            &WindowsInstallRequest {
                source_path: iso,
                target_device: "disk4".to_string(),
                label: None,
                filesystem: None,
                tpm_bypass: true,
                local_account: true,
                privacy_defaults: false,
            },
        )
        .unwrap();

        let details = report.details.unwrap();
        assert_eq!(details["label"], DEFAULT_LABEL);
        assert_eq!(details["files"], 3);
        assert!(dest.join("bootmgr").exists());
        assert!(dest.join("sources/install.wim").exists());
        let answer = std::fs::read_to_string(dest.join("autounattend.xml")).unwrap();
        assert!(answer.contains("BypassTPMCheck"));
        assert!(answer.contains("HideOnlineAccountScreens"));
        assert!(!answer.contains("ProtectYourPC"));
    }

    #[test]
    fn refuses_non_windows_images() {
        let fx = Fixture::new();
        fx.hal.add_disk(FakeDisk::external("disk4", 64 * MIB));
        let root = fx.tmp.path().join("linux-root");
        std::fs::create_dir_all(root.join("isolinux")).unwrap();
        let iso = fx.tmp.path().join("ubuntu.iso");
        std::fs::write(&iso, b"iso").unwrap();
        fx.hal.map_attachment(&iso, root);

        let err = windows_install(
            &fx.ctx(),
            &WindowsInstallRequest {
                source_path: iso.display().to_string(),
                target_device: "disk4".to_string(),
                label: None,
                filesystem: None,
                tpm_bypass: false,
                local_account: false,
                privacy_defaults: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput { ref field, .. } if field == "sourcePath"));
    }

    #[test]
    fn fat32_fallback_is_a_clean_unsupported_error() {
        let fx = Fixture::new();
        let err = windows_install(
            &fx.ctx(),
            &WindowsInstallRequest {
                source_path: "/img/win11.iso".to_string(),
                target_device: "disk4".to_string(),
                label: None,
                filesystem: Some(FsKind::Fat32),
                tpm_bypass: false,
                local_account: false,
                privacy_defaults: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Unsupported { .. }));
    }

    #[test]
    fn label_is_validated_against_the_exfat_policy() {
        let fx = Fixture::new();
        let err = windows_install(
            &fx.ctx(),
            &WindowsInstallRequest {
                source_path: "/img/win11.iso".to_string(),
                target_device: "disk4".to_string(),
                label: Some("way-too-long-for-exfat".to_string()),
                filesystem: None,
                tpm_bypass: false,
                local_account: false,
                privacy_defaults: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput { ref field, .. } if field == "label"));
    }

    #[test]
    fn answer_file_subsets_match_the_flags() {
        let all = build_autounattend(true, true, true);
        assert!(all.contains("BypassTPMCheck"));
        assert!(all.contains("HideOnlineAccountScreens"));
        assert!(all.contains("ProtectYourPC"));

        let none = build_autounattend(false, false, false);
        assert!(!none.contains("settings"));
        assert!(none.starts_with("<?xml"));
        assert!(none.trim_end().ends_with("</unattend>"));
    }
}
