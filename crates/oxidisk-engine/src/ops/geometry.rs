//! Resize/move engine: alignment math, bounds validation, and the
//! crash-safe byte move.

use super::{temp_label, OpCtx, OpReport};
use crate::fs_driver::driver_for;
use crate::inspector::Inspector;
use crate::journal::{JournalOp, JournalRecord};
use crate::labels::FsKind;
use crate::size;
use oxidisk_error::{EngineError, EngineResult};
use serde::Deserialize;
use serde_json::json;
use std::io::{Read, Seek, SeekFrom, Write};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizePartitionRequest {
    pub partition_identifier: String,
    pub new_size: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovePartitionRequest {
    pub partition_identifier: String,
    pub new_start: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyPartitionRequest {
    pub source_partition: String,
    pub target_device: String,
}

pub fn resize_partition(ctx: &OpCtx, req: &ResizePartitionRequest) -> EngineResult<OpReport> {
    let partition = ctx.norm(&req.partition_identifier);
    let new_size = size::canonical_bytes(&req.new_size)?;

    let info = ctx.hal.device_info(&partition)?;
    let fs = info
        .fs_type
        .as_deref()
        .and_then(|f| FsKind::parse(f).ok())
        .ok_or_else(|| EngineError::invalid("fs", "filesystem could not be identified"))?;

    ctx.maybe_swapoff(&partition)?;
    ctx.force_unmount_disk(&partition)?;
    ctx.check_cancel()?;

    ctx.progress("resize", 5, Some("Starting resize"));
    let report = match fs {
        FsKind::Apfs => {
            ctx.hal.resize_volume(&partition, &size::mib_arg(new_size))?;
            OpReport::with_details(json!({
                "device": partition,
                "fs": fs.as_str(),
                "size": new_size,
            }))
        }
        FsKind::Fat32 | FsKind::Exfat => {
            return Err(EngineError::Unsupported {
                reason: format!("{} cannot be resized", fs.as_str()),
            })
        }
        FsKind::Ext4 | FsKind::Ntfs => {
            if !ctx.cfg.allow_experimental_resize {
                return Err(EngineError::invalid(
                    "fs",
                    format!("{} resize is experimental and disabled", fs.as_str()),
                ));
            }
            resize_with_table_rewrite(ctx, &partition, fs, new_size, &info)?
        }
        _ => {
            return Err(EngineError::Unsupported {
                reason: format!("{} cannot be resized", fs.as_str()),
            })
        }
    };

    ctx.resync(&partition);
    ctx.progress("resize", 100, Some("Resize complete"));
    Ok(report)
}

/// Shrink: filesystem first, then the table entry. Grow: table entry first,
/// then the filesystem. A failure after the first sub-step tries to restore
/// the previous entry; unrecoverable failures surface as `Corrupted`.
fn resize_with_table_rewrite(
    ctx: &OpCtx,
    partition: &str,
    fs: FsKind,
    new_size: u64,
    info: &oxidisk_hal::DeviceInfo,
) -> EngineResult<OpReport> {
    let bounds = Inspector::new(ctx.hal, ctx.cfg).partition_bounds(partition)?;
    let offset = bounds.offset;
    let current_end = offset + bounds.size;
    let new_end = offset + new_size;
    let max_end = bounds.max_start + bounds.size;

    if new_end > max_end {
        return Err(EngineError::invalid("size", "new size exceeds available space"));
    }
    if let Some(used) = info.volume_used {
        let floor = ((used as f64) * 1.05).ceil() as u64;
        if new_size < floor {
            return Err(EngineError::invalid(
                "size",
                "new size is below used space (plus safety margin)",
            ));
        }
    }

    let driver = driver_for(fs)
        .ok_or_else(|| EngineError::invalid("fs", format!("no driver for {}", fs.as_str())))?;
    let device = format!("/dev/{partition}");

    if new_end < current_end {
        ctx.progress("resize", 15, Some("Shrinking filesystem"));
        let (binary, args) = driver
            .resize_command(&device, Some(&size::mib_arg(new_size)))
            .ok_or_else(|| EngineError::Unsupported {
                reason: format!("{} cannot be resized", fs.as_str()),
            })?;
        ctx.sidecar_stream(binary, args)?;

        ctx.progress("resize", 60, Some("Updating partition table"));
        if let Err(err) = rewrite_table_entry(ctx, partition, offset, new_end, bounds.block_size) {
            // Filesystem already shrank; put the old entry back so the
            // partition stays readable at its original span.
            return match rewrite_table_entry(ctx, partition, offset, current_end, bounds.block_size)
            {
                Ok(_) => Err(err),
                Err(_) => Err(EngineError::Corrupted {
                    detail: format!("table rewrite failed and restore failed: {err}"),
                }),
            };
        }
    } else if new_end > current_end {
        ctx.progress("resize", 30, Some("Updating partition table"));
        rewrite_table_entry(ctx, partition, offset, new_end, bounds.block_size)?;

        ctx.progress("resize", 70, Some("Growing filesystem"));
        let (binary, args) =
            driver
                .resize_command(&device, None)
                .ok_or_else(|| EngineError::Unsupported {
                    reason: format!("{} cannot be resized", fs.as_str()),
                })?;
        if let Err(err) = ctx.sidecar_stream(binary, args) {
            return match rewrite_table_entry(ctx, partition, offset, current_end, bounds.block_size)
            {
                Ok(_) => Err(err),
                Err(_) => Err(EngineError::Corrupted {
                    detail: format!("filesystem grow failed and table restore failed: {err}"),
                }),
            };
        }
    }

    Ok(OpReport::with_details(json!({
        "device": partition,
        "fs": fs.as_str(),
        "size": new_size,
    })))
}

pub fn move_partition(ctx: &OpCtx, req: &MovePartitionRequest) -> EngineResult<OpReport> {
    let partition = ctx.norm(&req.partition_identifier);
    let new_start = size::align_down_mib(size::parse_size(&req.new_start)?);

    ctx.maybe_swapoff(&partition)?;
    ctx.force_unmount_disk(&partition)?;
    ctx.check_cancel()?;

    let bounds = Inspector::new(ctx.hal, ctx.cfg).partition_bounds(&partition)?;
    if new_start < bounds.min_start || new_start > bounds.max_start {
        return Err(EngineError::invalid(
            "newStart",
            format!(
                "target start must be within [{}, {}]",
                bounds.min_start, bounds.max_start
            ),
        ));
    }
    if new_start == bounds.offset {
        return Ok(OpReport::with_details(json!({
            "device": partition,
            "newStart": new_start,
            "moved": false,
        })));
    }

    let disk = ctx.parent_disk(&partition)?;
    ctx.journal.begin(
        JournalRecord::new(JournalOp::Move, &partition, &disk)
            .span(Some(bounds.offset), Some(new_start), bounds.size)
            .block_size(bounds.block_size),
    )?;

    ctx.progress("move", 0, Some("Copying blocks"));
    match copy_within_disk(ctx, &disk, bounds.offset, new_start, bounds.size, "move", true) {
        Ok(()) => {}
        Err(err) => {
            // Nothing was committed; the source span is untouched.
            let _ = ctx.journal.abort();
            return Err(err);
        }
    }

    // Point of no return: a cancel from here on is a no-op.
    let number = ctx.partition_number(&partition)?;
    if let Err(err) = rewrite_table_numbered(
        ctx,
        &disk,
        number,
        new_start,
        new_start + bounds.size,
        bounds.block_size,
    ) {
        return Err(EngineError::Corrupted {
            detail: format!("partition table rewrite failed after copy: {err}"),
        });
    }
    ctx.journal.commit()?;

    ctx.resync(&partition);
    ctx.progress("move", 100, Some("Move complete"));
    Ok(OpReport::with_details(json!({
        "device": partition,
        "newStart": new_start,
        "moved": true,
    })))
}

/// Continue an interrupted move from its last checkpoint. The copy direction
/// derives from the recorded offsets, so already-copied blocks are skipped
/// and the table rewrite happens exactly once.
pub fn resume_move(ctx: &OpCtx, record: &JournalRecord) -> EngineResult<OpReport> {
    let (Some(src_offset), Some(dst_offset)) = (record.src_offset, record.dst_offset) else {
        return Err(EngineError::Corrupted {
            detail: "move journal is missing its offsets".to_string(),
        });
    };
    let partition = record.device.clone();
    let disk = record.disk.clone();

    ctx.progress("move", 0, Some("Resuming interrupted move"));
    ctx.hal.unmount_disk(&disk, true)?;
    // Re-own the slot so checkpoints keep landing during the resumed copy.
    ctx.journal.begin(record.clone())?;
    copy_within_disk_from(
        ctx,
        &disk,
        src_offset,
        dst_offset,
        record.size,
        record.last_copied,
        "move",
        true,
    )?;

    let number = ctx.partition_number(&partition)?;
    if let Err(err) = rewrite_table_numbered(
        ctx,
        &disk,
        number,
        dst_offset,
        dst_offset + record.size,
        record.block_size,
    ) {
        return Err(EngineError::Corrupted {
            detail: format!("partition table rewrite failed after resume: {err}"),
        });
    }
    ctx.journal.commit()?;
    ctx.resync(&partition);
    ctx.progress("move", 100, Some("Move complete"));
    Ok(OpReport::with_details(json!({
        "device": partition,
        "newStart": dst_offset,
        "moved": true,
        "resumed": true,
    })))
}

pub fn copy_partition(ctx: &OpCtx, req: &CopyPartitionRequest) -> EngineResult<OpReport> {
    let source = ctx.norm(&req.source_partition);
    let target_disk = ctx.norm(&req.target_device);

    let source_info = ctx.hal.device_info(&source)?;
    let fs = source_info
        .fs_type
        .as_deref()
        .and_then(|f| FsKind::parse(f).ok())
        .ok_or_else(|| EngineError::invalid("fs", "filesystem could not be identified"))?;
    if !matches!(fs, FsKind::Ext4 | FsKind::Ntfs | FsKind::Exfat | FsKind::Fat32) {
        return Err(EngineError::Unsupported {
            reason: format!("copy is not supported for {}", fs.as_str()),
        });
    }
    let src_offset = source_info
        .partition_offset
        .ok_or_else(|| EngineError::invalid("partition", "source is not a partition"))?;
    let src_size = source_info
        .partition_size
        .ok_or_else(|| EngineError::invalid("partition", "source is not a partition"))?;
    let src_disk = ctx.parent_disk(&source)?;

    ctx.maybe_swapoff(&source)?;
    ctx.force_unmount_disk(&source)?;
    ctx.hal.unmount_disk(&target_disk, true)?;
    ctx.check_cancel()?;

    ctx.progress("copy", 0, Some("Preparing target"));
    let scratch = temp_label("OXI_COPY");
    let size_arg = size::mib_arg(size::align_up_mib(src_size).max(crate::config::MIB));
    ctx.hal
        .add_partition(&target_disk, "MS-DOS", &scratch, &size_arg)?;
    let target = ctx
        .find_partition_by_label(&scratch)?
        .ok_or_else(|| EngineError::DeviceGone {
            identifier: scratch.clone(),
        })?;
    ctx.hal.unmount(&target, true)?;

    let target_info = ctx.hal.device_info(&target)?;
    let dst_offset = target_info.partition_offset.unwrap_or(0);

    ctx.journal.begin(
        JournalRecord::new(JournalOp::Copy, &source, &target_disk)
            .span(Some(src_offset), Some(dst_offset), src_size)
            .block_size(source_info.block_size),
    )?;

    ctx.progress("copy", 5, Some("Copying blocks"));
    let copy_result = if src_disk == target_disk {
        copy_within_disk(ctx, &src_disk, src_offset, dst_offset, src_size, "copy", true)
    } else {
        copy_across_devices(ctx, &source, &target, src_size)
    };
    if let Err(err) = copy_result {
        let _ = ctx.journal.abort();
        return Err(err);
    }

    ctx.progress("copy", 85, Some("Updating partition type"));
    let mut report = OpReport::with_details(json!({
        "source": source,
        "target": target,
        "fs": fs.as_str(),
    }));
    if let Some(warning) = ctx.set_partition_typecode(&target, fs)? {
        report = report.warn(warning);
    }

    // A cloned filesystem must not keep its identity.
    ctx.progress("copy", 90, Some("Refreshing volume identity"));
    match fs {
        FsKind::Ext4 => {
            if let Err(err) = ctx.sidecar_stream(
                "tune2fs",
                vec!["-U".to_string(), "random".to_string(), format!("/dev/{target}")],
            ) {
                report = report.warn(format!("UUID refresh failed: {err}"));
            }
        }
        FsKind::Ntfs => {
            if let Err(err) = ctx.sidecar_stream(
                "ntfslabel",
                vec!["--new-serial".to_string(), format!("/dev/{target}")],
            ) {
                report = report.warn(format!("serial refresh failed: {err}"));
            }
        }
        _ => {
            report = report.warn("identity refresh is not supported for FAT family");
        }
    }

    ctx.journal.commit()?;
    ctx.resync(&target);
    ctx.progress("copy", 100, Some("Copy complete"));
    Ok(report)
}

/// Block copy within one disk, direction-aware so overlapping spans are
/// safe: forward when moving left, reverse when moving right.
fn copy_within_disk(
    ctx: &OpCtx,
    disk: &str,
    src_offset: u64,
    dst_offset: u64,
    total: u64,
    phase: &str,
    journal: bool,
) -> EngineResult<()> {
    copy_within_disk_from(ctx, disk, src_offset, dst_offset, total, 0, phase, journal)
}

#[allow(clippy::too_many_arguments)]
fn copy_within_disk_from(
    ctx: &OpCtx,
    disk: &str,
    src_offset: u64,
    dst_offset: u64,
    total: u64,
    already_copied: u64,
    phase: &str,
    journal: bool,
) -> EngineResult<()> {
    let mut reader = ctx.hal.open_block_read(disk)?;
    let mut writer = ctx.hal.open_block_write(disk)?;
    let block = ctx.cfg.copy_block_size as usize;
    let mut buffer = vec![0u8; block];
    let mut copied: u64 = already_copied.min(total);

    if dst_offset > src_offset {
        // Reverse copy counts from the tail of the span.
        let mut position = total - copied;
        while position > 0 {
            ctx.check_cancel()?;
            let chunk = std::cmp::min(block as u64, position) as usize;
            position -= chunk as u64;
            transfer_chunk(
                &mut reader,
                &mut writer,
                src_offset + position,
                dst_offset + position,
                &mut buffer[..chunk],
            )?;
            copied += chunk as u64;
            ctx.progress_bytes(phase, copied, Some(total));
            if journal {
                ctx.journal.checkpoint(copied)?;
            }
        }
    } else {
        let mut position = copied;
        while position < total {
            ctx.check_cancel()?;
            let chunk = std::cmp::min(block as u64, total - position) as usize;
            transfer_chunk(
                &mut reader,
                &mut writer,
                src_offset + position,
                dst_offset + position,
                &mut buffer[..chunk],
            )?;
            position += chunk as u64;
            copied += chunk as u64;
            ctx.progress_bytes(phase, copied, Some(total));
            if journal {
                ctx.journal.checkpoint(copied)?;
            }
        }
    }

    writer
        .flush()
        .map_err(|e| EngineError::io("block flush", e))?;
    writer
        .sync_all()
        .map_err(|e| EngineError::io("block sync", e))?;
    Ok(())
}

fn copy_across_devices(
    ctx: &OpCtx,
    source: &str,
    target: &str,
    total: u64,
) -> EngineResult<()> {
    let mut reader = ctx.hal.open_block_read(source)?;
    let mut writer = ctx.hal.open_block_write(target)?;
    let block = ctx.cfg.copy_block_size as usize;
    let mut buffer = vec![0u8; block];
    let mut copied: u64 = 0;

    while copied < total {
        ctx.check_cancel()?;
        let chunk = std::cmp::min(block as u64, total - copied) as usize;
        reader
            .read_exact(&mut buffer[..chunk])
            .map_err(|e| EngineError::io("block read", e))?;
        writer
            .write_all(&buffer[..chunk])
            .map_err(|e| EngineError::io("block write", e))?;
        copied += chunk as u64;
        ctx.progress_bytes("copy", copied, Some(total));
        ctx.journal.checkpoint(copied)?;
    }

    writer
        .sync_all()
        .map_err(|e| EngineError::io("block sync", e))?;
    Ok(())
}

fn transfer_chunk(
    reader: &mut std::fs::File,
    writer: &mut std::fs::File,
    read_pos: u64,
    write_pos: u64,
    buffer: &mut [u8],
) -> EngineResult<()> {
    reader
        .seek(SeekFrom::Start(read_pos))
        .map_err(|e| EngineError::io("block seek", e))?;
    reader
        .read_exact(buffer)
        .map_err(|e| EngineError::io("block read", e))?;
    writer
        .seek(SeekFrom::Start(write_pos))
        .map_err(|e| EngineError::io("block seek", e))?;
    writer
        .write_all(buffer)
        .map_err(|e| EngineError::io("block write", e))?;
    Ok(())
}

fn rewrite_table_entry(
    ctx: &OpCtx,
    partition: &str,
    start: u64,
    end: u64,
    block_size: u64,
) -> EngineResult<String> {
    let number = ctx.partition_number(partition)?;
    let disk = ctx.parent_disk(partition)?;
    rewrite_table_numbered(ctx, &disk, number, start, end, block_size)
}

fn rewrite_table_numbered(
    ctx: &OpCtx,
    disk: &str,
    number: u32,
    start: u64,
    end: u64,
    block_size: u64,
) -> EngineResult<String> {
    let start_sector = start / block_size;
    let end_sector = (end / block_size).saturating_sub(1);
    ctx.sidecar_stream(
        "sgdisk",
        vec![
            "--delete".to_string(),
            number.to_string(),
            "--new".to_string(),
            format!("{number}:{start_sector}:{end_sector}"),
            format!("/dev/{disk}"),
        ],
    )
}
