//! Operation implementations.
//!
//! Every operation runs inside an [`OpCtx`] handed out by the dispatcher:
//! HAL access, config, the progress/log bus, and the journal handle. Cancel
//! is checked at block boundaries and after every sidecar line.

pub mod geometry;
pub mod image;
pub mod partition;
pub mod windows;

use crate::bus::OpBus;
use crate::config::EngineConfig;
use crate::journal::JournalStore;
use crate::labels::FsKind;
use oxidisk_error::{EngineError, EngineResult};
use oxidisk_hal::{DiskHal, ProcessSignal, SidecarInvocation};
use serde_json::Value;

/// What a finished operation hands back to the dispatcher.
#[derive(Debug, Default)]
pub struct OpReport {
    pub details: Option<Value>,
    pub warnings: Vec<String>,
}

impl OpReport {
    pub fn with_details(details: Value) -> Self {
        Self {
            details: Some(details),
            warnings: Vec::new(),
        }
    }

    pub fn warn(mut self, warning: impl Into<String>) -> Self {
        self.warnings.push(warning.into());
        self
    }
}

pub struct OpCtx<'a> {
    pub hal: &'a dyn DiskHal,
    pub cfg: &'a EngineConfig,
    pub bus: &'a OpBus,
    pub journal: &'a JournalStore,
}

impl<'a> OpCtx<'a> {
    pub fn check_cancel(&self) -> EngineResult<()> {
        if self.bus.cancel_requested() {
            return Err(EngineError::Cancelled);
        }
        Ok(())
    }

    pub fn progress(&self, phase: &str, percent: u8, message: Option<&str>) {
        self.bus.emit(phase, percent, message);
    }

    pub fn progress_bytes(&self, phase: &str, bytes: u64, total: Option<u64>) {
        self.bus.emit_bytes(phase, bytes, total);
    }

    pub fn log(&self, source: &str, line: &str) {
        log::info!("[{source}] {line}");
        self.bus.emit_log(source, line);
    }

    /// Run a sidecar, streaming each stdout line to the bus and honoring the
    /// cancel flag at every line boundary.
    pub fn sidecar_stream(&self, binary: &str, args: Vec<String>) -> EngineResult<String> {
        let mut cancelled = false;
        let result = self.hal.run_sidecar(
            &SidecarInvocation::new(binary, args),
            &mut |line| {
                self.bus.emit_log(binary, line);
                if self.bus.cancel_requested() {
                    cancelled = true;
                    return false;
                }
                true
            },
        );
        if cancelled {
            return Err(EngineError::Cancelled);
        }
        Ok(result?)
    }

    /// Identifier without the `/dev/` prefix.
    pub fn norm(&self, identifier: &str) -> String {
        identifier.trim_start_matches("/dev/").to_string()
    }

    pub fn parent_disk(&self, device: &str) -> EngineResult<String> {
        let info = self.hal.device_info(device)?;
        Ok(info
            .parent_whole_disk
            .unwrap_or_else(|| self.norm(device)))
    }

    /// Partition index within its disk (`disk4s2` -> 2).
    pub fn partition_number(&self, device: &str) -> EngineResult<u32> {
        let cleaned = self.norm(device);
        cleaned
            .rfind('s')
            .and_then(|idx| cleaned[idx + 1..].parse::<u32>().ok())
            .ok_or_else(|| EngineError::invalid("partition", "not a partition identifier"))
    }

    /// Force-unmount the partition and its whole disk.
    pub fn force_unmount_disk(&self, device: &str) -> EngineResult<()> {
        let disk = self.parent_disk(device)?;
        let _ = self.hal.unmount(device, true);
        self.hal.unmount_disk(&disk, true)?;
        Ok(())
    }

    /// Deactivate swap before touching a swap partition.
    pub fn maybe_swapoff(&self, device: &str) -> EngineResult<()> {
        let fs = self.hal.device_info(device)?.fs_type;
        if fs.as_deref() != Some("swap") {
            return Ok(());
        }
        self.sidecar_stream("swapoff", vec!["-a".to_string()])?;
        Ok(())
    }

    /// Kernel-table resync after a successful mutation. Best effort.
    pub fn resync(&self, device: &str) {
        if let Ok(disk) = self.parent_disk(device) {
            let _ = self.hal.repair_disk_quiet(&disk);
            let _ = self.hal.update_partition_order(&disk);
        }
    }

    /// Stamp the GPT typecode after creating a Linux-family filesystem.
    /// Missing sgdisk degrades to a warning instead of failing the op.
    pub fn set_partition_typecode(&self, partition: &str, fs: FsKind) -> EngineResult<Option<String>> {
        let Some(typecode) = fs.gpt_typecode() else {
            return Ok(None);
        };
        let number = self.partition_number(partition)?;
        let disk = self.parent_disk(partition)?;
        match self.sidecar_stream(
            "sgdisk",
            vec![
                "--typecode".to_string(),
                format!("{number}:{typecode}"),
                format!("/dev/{disk}"),
            ],
        ) {
            Ok(_) => Ok(None),
            Err(EngineError::MissingSidecar { .. }) => {
                Ok(Some("sgdisk not found; GPT typecode not updated".to_string()))
            }
            Err(err) => Err(err),
        }
    }

    /// Locate a partition by its volume label in a fresh snapshot.
    pub fn find_partition_by_label(&self, label: &str) -> EngineResult<Option<String>> {
        for disk in self.hal.list_disks()? {
            for part in disk.partitions {
                if part.volume_name == label {
                    return Ok(Some(part.identifier));
                }
            }
        }
        Ok(None)
    }

    /// TERM then KILL the listed pids, with the configured grace in between.
    pub fn terminate_processes(&self, pids: &[i32]) {
        for pid in pids {
            let _ = self.hal.signal_process(*pid, ProcessSignal::Term);
        }
        if !pids.is_empty() && !self.cfg.force_unmount_grace.is_zero() {
            std::thread::sleep(self.cfg.force_unmount_grace);
        }
        for pid in pids {
            let _ = self.hal.signal_process(*pid, ProcessSignal::Kill);
        }
    }
}

/// Unique scratch label for temp allocations, derived from the clock.
pub fn temp_label(prefix: &str) -> String {
    let stamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("{prefix}_{stamp}")
}
