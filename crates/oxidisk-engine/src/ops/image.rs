//! Image engine: flash, backup, hashing, and ISO classification.

use super::{OpCtx, OpReport};
use crate::journal::{JournalOp, JournalRecord};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use oxidisk_error::{EngineError, EngineResult};
use oxidisk_hal::guards::ImageMountGuard;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlashImageRequest {
    pub source_path: String,
    pub target_device: String,
    #[serde(default = "default_true")]
    pub verify: bool,
    /// Windows ISOs need installer staging, not a raw write. This forces the
    /// raw write anyway.
    #[serde(default)]
    pub allow_windows_iso: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupImageRequest {
    pub source_device: String,
    pub target_path: String,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HashImageRequest {
    pub source_path: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectImageRequest {
    pub source_path: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageInspection {
    pub is_windows: bool,
    pub reason: String,
    pub brand: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Classify an image by its boot records and root directory.
pub fn inspect_image(ctx: &OpCtx, req: &InspectImageRequest) -> EngineResult<ImageInspection> {
    let path = Path::new(&req.source_path);
    if !path.exists() {
        return Err(EngineError::invalid("sourcePath", "image does not exist"));
    }
    let mount = ctx.hal.attach_image_readonly(path)?;
    let guard = ImageMountGuard::new(ctx.hal, mount);
    Ok(classify_tree(guard.mount_point()))
}

fn classify_tree(root: &Path) -> ImageInspection {
    let label = root
        .file_name()
        .map(|name| name.to_string_lossy().to_string());

    let has_bootmgr = root.join("bootmgr").exists() || root.join("BOOTMGR").exists();
    let wim = ["sources/install.wim", "sources/install.esd"]
        .iter()
        .find(|rel| root.join(rel).exists());

    if has_bootmgr {
        if let Some(wim) = wim {
            return ImageInspection {
                is_windows: true,
                reason: format!("bootmgr+{wim} present"),
                brand: "windows".to_string(),
                label,
            };
        }
        return ImageInspection {
            is_windows: true,
            reason: "bootmgr present".to_string(),
            brand: "windows".to_string(),
            label,
        };
    }

    let linuxish = ["isolinux", "boot/grub", "casper", ".disk"]
        .iter()
        .any(|rel| root.join(rel).exists());
    ImageInspection {
        is_windows: false,
        reason: if linuxish {
            "linux boot tree present".to_string()
        } else {
            "no windows markers".to_string()
        },
        brand: if linuxish { "linux" } else { "unknown" }.to_string(),
        label,
    }
}

pub fn flash_image(ctx: &OpCtx, req: &FlashImageRequest) -> EngineResult<OpReport> {
    let target = ctx.norm(&req.target_device);
    let source = Path::new(&req.source_path);
    let metadata = std::fs::metadata(source).map_err(|e| EngineError::io("image open", e))?;

    let is_xz = source.extension().is_some_and(|ext| ext == "xz");
    let is_iso = source.extension().is_some_and(|ext| ext == "iso");

    if is_iso && !req.allow_windows_iso {
        if let Ok(mount) = ctx.hal.attach_image_readonly(source) {
            let guard = ImageMountGuard::new(ctx.hal, mount);
            let inspection = classify_tree(guard.mount_point());
            if inspection.is_windows {
                return Err(EngineError::invalid("mode", "windows-iso detected"));
            }
        }
    }

    let disk_size = ctx.hal.device_info(&target)?.total_size;
    if !is_xz && disk_size > 0 && metadata.len() > disk_size {
        return Err(EngineError::invalid(
            "size",
            "image is larger than the target device",
        ));
    }

    ctx.log("flash", "Unmounting target disk");
    ctx.force_unmount_disk(&target)?;
    ctx.check_cancel()?;

    let disk = ctx.parent_disk(&target)?;
    ctx.journal.begin(
        JournalRecord::new(JournalOp::Flash, &target, &disk)
            .span(None, Some(0), metadata.len())
            .block_size(ctx.cfg.copy_block_size),
    )?;

    ctx.log("flash", "Writing image");
    let file = File::open(source).map_err(|e| EngineError::io("image open", e))?;
    let mut reader: Box<dyn Read> = if is_xz {
        Box::new(xz2::read::XzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let total = if is_xz { None } else { Some(metadata.len()) };

    let raw = ctx.hal.raw_device_path(&target);
    let mut writer = ctx.hal.open_block_write(&raw)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; ctx.cfg.copy_block_size as usize];
    let mut written: u64 = 0;

    loop {
        if ctx.bus.cancel_requested() {
            if written == 0 {
                let _ = ctx.journal.abort();
            }
            return Err(EngineError::Cancelled);
        }
        let n = fill_block(&mut reader, &mut buffer)
            .map_err(|e| EngineError::io("image read", e))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buffer[..n])
            .map_err(|e| EngineError::io("device write", e))?;
        hasher.update(&buffer[..n]);
        written += n as u64;
        ctx.progress_bytes("flash", written, total);
        ctx.journal.checkpoint(written)?;
    }
    writer
        .sync_all()
        .map_err(|e| EngineError::io("device sync", e))?;
    drop(writer);

    let source_hash = format!("{:x}", hasher.finalize());
    let mut verified_hash = None;
    if req.verify {
        ctx.log("flash", "Verifying image");
        let actual = hash_device_prefix(ctx, &raw, written, "verify")?;
        if actual != source_hash {
            ctx.journal.clear()?;
            return Err(EngineError::VerificationFailed {
                expected: source_hash,
                actual,
            });
        }
        verified_hash = Some(actual);
    }

    ctx.journal.commit()?;
    ctx.resync(&target);
    Ok(OpReport::with_details(json!({
        "target": target,
        "bytes": written,
        "sourceHash": source_hash,
        "verifiedHash": verified_hash,
        "verified": req.verify,
    })))
}

pub fn backup_image(ctx: &OpCtx, req: &BackupImageRequest) -> EngineResult<OpReport> {
    let device = ctx.norm(&req.source_device);
    let target_path = Path::new(&req.target_path);
    if target_path.exists() && !req.overwrite {
        return Err(EngineError::invalid(
            "targetPath",
            "target exists; pass overwrite to replace it",
        ));
    }

    let info = ctx.hal.device_info(&device)?;
    let total = info.partition_size.unwrap_or(info.total_size);
    if total == 0 {
        return Err(EngineError::invalid("sourceDevice", "device reports zero size"));
    }

    ctx.hal.unmount(&device, true).ok();
    ctx.check_cancel()?;

    let disk = ctx.parent_disk(&device)?;
    ctx.journal.begin(
        JournalRecord::new(JournalOp::Backup, &device, &disk)
            .span(None, None, total)
            .block_size(ctx.cfg.copy_block_size),
    )?;

    let file = File::create(target_path).map_err(|e| EngineError::io("backup create", e))?;
    let mut writer = if req.compress {
        BackupWriter::Gzip(GzEncoder::new(file, Compression::default()))
    } else {
        BackupWriter::Plain(file)
    };

    let mut reader = ctx.hal.open_block_read(&device)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; ctx.cfg.copy_block_size as usize];
    let mut copied: u64 = 0;

    while copied < total {
        if ctx.bus.cancel_requested() {
            drop(writer);
            let _ = std::fs::remove_file(target_path);
            let _ = ctx.journal.abort();
            return Err(EngineError::Cancelled);
        }
        let chunk = std::cmp::min(buffer.len() as u64, total - copied) as usize;
        reader
            .read_exact(&mut buffer[..chunk])
            .map_err(|e| EngineError::io("device read", e))?;
        writer
            .write_all(&buffer[..chunk])
            .map_err(|e| EngineError::io("backup write", e))?;
        hasher.update(&buffer[..chunk]);
        copied += chunk as u64;
        ctx.progress_bytes("backup", copied, Some(total));
        ctx.journal.checkpoint(copied)?;
    }
    let file = writer
        .finish()
        .map_err(|e| EngineError::io("backup flush", e))?;
    file.sync_all()
        .map_err(|e| EngineError::io("backup sync", e))?;
    drop(file);

    let source_hash = format!("{:x}", hasher.finalize());

    // Verify what actually landed in the file by re-reading its logical
    // stream; a compressed backup is decoded back to device bytes.
    ctx.log("backup", "Verifying backup");
    let file = File::open(target_path).map_err(|e| EngineError::io("backup open", e))?;
    let mut verify_reader: Box<dyn Read> = if req.compress {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut verify_hasher = Sha256::new();
    let mut verified: u64 = 0;
    loop {
        let n = fill_block(&mut verify_reader, &mut buffer)
            .map_err(|e| EngineError::io("backup read", e))?;
        if n == 0 {
            break;
        }
        verify_hasher.update(&buffer[..n]);
        verified += n as u64;
        ctx.progress_bytes("verify", verified, Some(total));
    }
    let file_hash = format!("{:x}", verify_hasher.finalize());
    if file_hash != source_hash {
        return Err(EngineError::VerificationFailed {
            expected: source_hash,
            actual: file_hash,
        });
    }

    ctx.journal.commit()?;
    Ok(OpReport::with_details(json!({
        "device": device,
        "path": req.target_path,
        "bytes": total,
        "sha256": source_hash,
        "compressed": req.compress,
    })))
}

pub fn hash_image(ctx: &OpCtx, req: &HashImageRequest) -> EngineResult<OpReport> {
    let source = Path::new(&req.source_path);
    let total = std::fs::metadata(source)
        .map_err(|e| EngineError::io("image open", e))?
        .len();

    let mut reader = File::open(source).map_err(|e| EngineError::io("image open", e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; ctx.cfg.copy_block_size as usize];
    let mut read: u64 = 0;

    loop {
        ctx.check_cancel()?;
        let n = fill_block(&mut reader, &mut buffer)
            .map_err(|e| EngineError::io("image read", e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        read += n as u64;
        ctx.progress_bytes("hash", read, Some(total));
    }

    Ok(OpReport::with_details(json!({
        "sha256": format!("{:x}", hasher.finalize()),
        "bytes": read,
    })))
}

fn hash_device_prefix(
    ctx: &OpCtx,
    device: &str,
    length: u64,
    phase: &str,
) -> EngineResult<String> {
    let mut reader = ctx.hal.open_block_read(device)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; ctx.cfg.copy_block_size as usize];
    let mut read: u64 = 0;
    while read < length {
        ctx.check_cancel()?;
        let chunk = std::cmp::min(buffer.len() as u64, length - read) as usize;
        reader
            .read_exact(&mut buffer[..chunk])
            .map_err(|e| EngineError::io("device read", e))?;
        hasher.update(&buffer[..chunk]);
        read += chunk as u64;
        ctx.progress_bytes(phase, read, Some(length));
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Backup sink: plain file or gzip stream over one. The gzip trailer only
/// lands on an explicit finish.
enum BackupWriter {
    Plain(File),
    Gzip(GzEncoder<File>),
}

impl Write for BackupWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            BackupWriter::Plain(file) => file.write(buf),
            BackupWriter::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            BackupWriter::Plain(file) => file.flush(),
            BackupWriter::Gzip(encoder) => encoder.flush(),
        }
    }
}

impl BackupWriter {
    fn finish(self) -> std::io::Result<File> {
        match self {
            BackupWriter::Plain(file) => Ok(file),
            BackupWriter::Gzip(encoder) => encoder.finish(),
        }
    }
}

/// Read until the buffer is full or the stream ends. Decoders return short
/// reads; a partial final block is normal.
fn fill_block(reader: &mut dyn Read, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
