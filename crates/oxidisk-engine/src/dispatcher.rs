//! Operation dispatcher: a serial queue of at most one active operation.
//!
//! The dispatcher owns the journal handle and the verdict registry. Every
//! destructive operation is wrapped with preflight freshness, the serial
//! lock, the operation state machine, journal recovery, and unified error
//! mapping. Component code never touches any of these directly.

use crate::bus::OpBus;
use crate::config::EngineConfig;
use crate::inspector::Inspector;
use crate::journal::{JournalRecord, JournalStore};
use crate::labels::FsKind;
use crate::model::{ApfsContainer, Device, PartitionBounds};
use crate::ops::geometry::{
    self, CopyPartitionRequest, MovePartitionRequest, ResizePartitionRequest,
};
use crate::ops::image::{
    self, BackupImageRequest, FlashImageRequest, HashImageRequest, ImageInspection,
    InspectImageRequest,
};
use crate::ops::partition::{
    self, ApfsAddVolumeRequest, ApfsDeleteVolumeRequest, CheckPartitionRequest,
    CreatePartitionRequest, CreateTableRequest, DeletePartitionRequest, ForceUnmountRequest,
    FormatPartitionRequest, SetLabelUuidRequest, WipeDeviceRequest,
};
use crate::ops::windows::{self, WindowsInstallRequest};
use crate::ops::{OpCtx, OpReport};
use crate::preflight::{run_preflight, OpKind, PreflightRequest, Verdict};
use crate::size;
use crate::sudoers;
use oxidisk_error::{EngineError, EngineResult};
use oxidisk_hal::sidecar::{self, SidecarStatus};
use oxidisk_hal::DiskHal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Unified result of every engine command.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub warnings: Vec<String>,
}

impl From<OpReport> for OpOutcome {
    fn from(report: OpReport) -> Self {
        Self {
            ok: true,
            details: report.details,
            warnings: report.warnings,
        }
    }
}

/// Explicit operation lifecycle. Transitions outside this table are bugs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    Idle,
    Validating,
    Prepared,
    Running,
    Cancelling,
    Completed,
    Failed,
}

impl OpState {
    fn may_advance(self, next: OpState) -> bool {
        use OpState::*;
        matches!(
            (self, next),
            (Idle, Validating)
                | (Validating, Prepared)
                | (Validating, Failed)
                | (Prepared, Running)
                | (Running, Cancelling)
                | (Running, Completed)
                | (Running, Failed)
                | (Cancelling, Failed)
                | (Completed, Idle)
                | (Failed, Idle)
        )
    }
}

/// What the UI may do with an interrupted operation found at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalResolution {
    Ignore,
    Repair,
    /// Continue an interrupted move from its last checkpoint.
    Resume,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingJournal {
    pub record: JournalRecord,
    pub device_present: bool,
}

struct VerdictEntry {
    at: Instant,
    blockers: Vec<String>,
}

pub struct Dispatcher {
    hal: Arc<dyn DiskHal>,
    cfg: EngineConfig,
    bus: Arc<OpBus>,
    journal: JournalStore,
    verdicts: Mutex<HashMap<PreflightRequest, VerdictEntry>>,
    active: Mutex<Option<&'static str>>,
    state: Mutex<OpState>,
}

impl Dispatcher {
    pub fn new(hal: Arc<dyn DiskHal>, cfg: EngineConfig) -> Self {
        let journal = JournalStore::new(
            cfg.journal_path.clone(),
            cfg.checkpoint_bytes,
            cfg.checkpoint_interval,
        );
        Self {
            hal,
            cfg,
            bus: Arc::new(OpBus::new()),
            journal,
            verdicts: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
            state: Mutex::new(OpState::Idle),
        }
    }

    pub fn bus(&self) -> Arc<OpBus> {
        Arc::clone(&self.bus)
    }

    pub fn cancel(&self) {
        self.bus.request_cancel();
    }

    pub fn state(&self) -> OpState {
        *self.lock(&self.state)
    }

    // ---- read-only surface -------------------------------------------------

    pub fn list_devices(&self, include_system: bool) -> EngineResult<Vec<Device>> {
        Inspector::new(self.hal.as_ref(), &self.cfg).list_devices(include_system)
    }

    pub fn partition_bounds(&self, identifier: &str) -> EngineResult<PartitionBounds> {
        Inspector::new(self.hal.as_ref(), &self.cfg).partition_bounds(identifier)
    }

    pub fn apfs_list_volumes(&self, container: &str) -> EngineResult<ApfsContainer> {
        Inspector::new(self.hal.as_ref(), &self.cfg).apfs_container(container)
    }

    pub fn sidecar_status(&self) -> Vec<SidecarStatus> {
        match &self.cfg.sidecar_dirs {
            Some(dirs) => sidecar::CATALOG
                .iter()
                .map(|spec| sidecar::status_in(dirs, spec))
                .collect(),
            None => sidecar::status_all(),
        }
    }

    pub fn inspect_image(&self, req: InspectImageRequest) -> EngineResult<ImageInspection> {
        image::inspect_image(&self.ctx(), &req)
    }

    pub fn hash_image(&self, req: HashImageRequest) -> EngineResult<OpOutcome> {
        self.bus.begin_operation();
        image::hash_image(&self.ctx(), &req).map(OpOutcome::from)
    }

    // ---- preflight and journal recovery -----------------------------------

    pub fn preflight(&self, req: PreflightRequest) -> EngineResult<Verdict> {
        let verdict = run_preflight(self.hal.as_ref(), &self.cfg, &req)?;
        self.lock(&self.verdicts).insert(
            req,
            VerdictEntry {
                at: Instant::now(),
                blockers: verdict.blockers.clone(),
            },
        );
        Ok(verdict)
    }

    /// Interrupted-operation record found at engine start, if any.
    pub fn startup_journal(&self) -> EngineResult<Option<PendingJournal>> {
        let Some(record) = self.journal.peek()? else {
            return Ok(None);
        };
        let device_present = self.hal.device_info(&record.device).is_ok();
        Ok(Some(PendingJournal {
            record,
            device_present,
        }))
    }

    pub fn journal_peek(&self) -> EngineResult<Option<JournalRecord>> {
        self.journal.peek()
    }

    pub fn journal_clear(&self) -> EngineResult<OpOutcome> {
        self.journal.clear()?;
        Ok(OpOutcome {
            ok: true,
            details: Some(serde_json::json!({ "cleared": true })),
            warnings: Vec::new(),
        })
    }

    /// Resolve an interrupted operation: ignore it, repair the affected
    /// filesystem, or (for moves) continue the copy from its checkpoint.
    pub fn resolve_journal(&self, resolution: JournalResolution) -> EngineResult<OpOutcome> {
        let Some(record) = self.journal.peek()? else {
            return self.journal_clear();
        };
        let device_present = self.hal.device_info(&record.device).is_ok();
        match resolution {
            JournalResolution::Resume => {
                if record.operation != crate::journal::JournalOp::Move {
                    return Err(EngineError::invalid(
                        "resolution",
                        "only interrupted moves can be resumed",
                    ));
                }
                if !device_present {
                    return Err(EngineError::DeviceGone {
                        identifier: record.device.clone(),
                    });
                }
                self.execute("move", None, |ctx| geometry::resume_move(ctx, &record))
            }
            JournalResolution::Repair if device_present => {
                let report = partition::check_partition(
                    &self.ctx(),
                    &CheckPartitionRequest {
                        partition_identifier: record.device.clone(),
                        repair: true,
                    },
                )?;
                self.journal.clear()?;
                Ok(report.into())
            }
            _ => self.journal_clear(),
        }
    }

    // ---- destructive surface ----------------------------------------------

    pub fn wipe_device(&self, req: WipeDeviceRequest) -> EngineResult<OpOutcome> {
        let key = PreflightRequest::new(OpKind::Wipe, &req.device_identifier)
            .with_fs(req.format_type);
        self.execute("wipe", Some(key), |ctx| partition::wipe_device(ctx, &req))
    }

    pub fn create_partition_table(&self, req: CreateTableRequest) -> EngineResult<OpOutcome> {
        let key = PreflightRequest::new(OpKind::CreateTable, &req.device_identifier);
        self.execute("create-table", Some(key), |ctx| {
            partition::create_partition_table(ctx, &req)
        })
    }

    pub fn create_partition(&self, req: CreatePartitionRequest) -> EngineResult<OpOutcome> {
        let bytes = size::canonical_bytes(&req.size)?;
        let key = PreflightRequest::new(OpKind::Create, &req.device_identifier)
            .with_fs(req.format_type)
            .with_new_size(bytes);
        self.execute("create", Some(key), |ctx| {
            partition::create_partition(ctx, &req)
        })
    }

    pub fn delete_partition(&self, req: DeletePartitionRequest) -> EngineResult<OpOutcome> {
        let key = PreflightRequest::new(OpKind::Delete, &req.partition_identifier);
        self.execute("delete", Some(key), |ctx| {
            partition::delete_partition(ctx, &req)
        })
    }

    pub fn format_partition(&self, req: FormatPartitionRequest) -> EngineResult<OpOutcome> {
        let key = PreflightRequest::new(OpKind::Format, &req.partition_identifier)
            .with_fs(req.format_type);
        self.execute("format", Some(key), |ctx| {
            partition::format_partition(ctx, &req)
        })
    }

    pub fn set_label_uuid(&self, req: SetLabelUuidRequest) -> EngineResult<OpOutcome> {
        let key = PreflightRequest::new(OpKind::LabelUuid, &req.partition_identifier);
        self.execute("label-uuid", Some(key), |ctx| {
            partition::set_label_uuid(ctx, &req)
        })
    }

    pub fn check_partition(&self, req: CheckPartitionRequest) -> EngineResult<OpOutcome> {
        // Read-only unless repairing; either way it must not overlap a
        // destructive operation on the same engine.
        self.execute("check", None, |ctx| partition::check_partition(ctx, &req))
    }

    pub fn resize_partition(&self, req: ResizePartitionRequest) -> EngineResult<OpOutcome> {
        let bytes = size::canonical_bytes(&req.new_size)?;
        let key = PreflightRequest::new(OpKind::Resize, &req.partition_identifier)
            .with_new_size(bytes);
        self.execute("resize", Some(key), |ctx| {
            geometry::resize_partition(ctx, &req)
        })
    }

    pub fn move_partition(&self, req: MovePartitionRequest) -> EngineResult<OpOutcome> {
        let key = PreflightRequest::new(OpKind::Move, &req.partition_identifier);
        self.execute("move", Some(key), |ctx| geometry::move_partition(ctx, &req))
    }

    pub fn copy_partition(&self, req: CopyPartitionRequest) -> EngineResult<OpOutcome> {
        let key = PreflightRequest::new(OpKind::Copy, &req.source_partition);
        self.execute("copy", Some(key), |ctx| geometry::copy_partition(ctx, &req))
    }

    pub fn flash_image(&self, req: FlashImageRequest) -> EngineResult<OpOutcome> {
        let key = PreflightRequest::new(OpKind::Flash, &req.target_device);
        self.execute("flash", Some(key), |ctx| image::flash_image(ctx, &req))
    }

    pub fn backup_image(&self, req: BackupImageRequest) -> EngineResult<OpOutcome> {
        let key = PreflightRequest::new(OpKind::Backup, &req.source_device);
        self.execute("backup", Some(key), |ctx| image::backup_image(ctx, &req))
    }

    pub fn windows_install(&self, req: WindowsInstallRequest) -> EngineResult<OpOutcome> {
        let key = PreflightRequest::new(OpKind::WindowsInstall, &req.target_device);
        self.execute("windows-install", Some(key), |ctx| {
            windows::windows_install(ctx, &req)
        })
    }

    pub fn force_unmount(&self, req: ForceUnmountRequest) -> EngineResult<OpOutcome> {
        self.execute("force-unmount", None, |ctx| {
            partition::force_unmount(ctx, &req)
        })
    }

    pub fn apfs_add_volume(&self, req: ApfsAddVolumeRequest) -> EngineResult<OpOutcome> {
        self.execute("apfs-add-volume", None, |ctx| {
            partition::apfs_add_volume(ctx, &req)
        })
    }

    pub fn apfs_delete_volume(&self, req: ApfsDeleteVolumeRequest) -> EngineResult<OpOutcome> {
        self.execute("apfs-delete-volume", None, |ctx| {
            partition::apfs_delete_volume(ctx, &req)
        })
    }

    // ---- thin mount/eject wrappers ----------------------------------------

    pub fn mount_disk(&self, disk: &str) -> EngineResult<OpOutcome> {
        self.hal.mount_disk(disk)?;
        Ok(empty_outcome())
    }

    pub fn mount_volume(&self, device: &str) -> EngineResult<OpOutcome> {
        self.hal.mount_volume(device)?;
        Ok(empty_outcome())
    }

    pub fn eject_disk(&self, device: &str) -> EngineResult<OpOutcome> {
        self.hal.eject(device)?;
        Ok(empty_outcome())
    }

    pub fn install_sudoers(&self, username: &str, helper_path: &str) -> EngineResult<OpOutcome> {
        let result = sudoers::install(&self.cfg.sudoers_path, username, helper_path)?;
        Ok(OpOutcome {
            ok: true,
            details: Some(serde_json::to_value(result).unwrap_or(Value::Null)),
            warnings: Vec::new(),
        })
    }

    // ---- core -------------------------------------------------------------

    fn execute<F>(
        &self,
        name: &'static str,
        key: Option<PreflightRequest>,
        op: F,
    ) -> EngineResult<OpOutcome>
    where
        F: FnOnce(&OpCtx) -> EngineResult<OpReport>,
    {
        let _serial = self.acquire(name)?;
        self.advance(OpState::Validating);

        if let Some(key) = key {
            if let Err(err) = self.require_fresh(&key) {
                self.advance(OpState::Failed);
                self.advance(OpState::Idle);
                return Err(err);
            }
        }
        self.advance(OpState::Prepared);

        // A cancel raised before dispatch is a no-op.
        self.bus.begin_operation();
        self.advance(OpState::Running);

        let ctx = self.ctx();
        let result = op(&ctx);
        let outcome = match result {
            Ok(report) => {
                self.advance(OpState::Completed);
                // Topology changed; every recorded verdict is now stale.
                self.lock(&self.verdicts).clear();
                Ok(OpOutcome::from(report))
            }
            Err(EngineError::Cancelled) => {
                self.advance(OpState::Cancelling);
                self.advance(OpState::Failed);
                self.bus.emit("cancelled", 100, Some("Operation cancelled"));
                Err(EngineError::Cancelled)
            }
            Err(err) => {
                self.advance(OpState::Failed);
                log::warn!("{name} failed: {err}");
                Err(err)
            }
        };
        self.advance(OpState::Idle);
        outcome
    }

    fn require_fresh(&self, key: &PreflightRequest) -> EngineResult<()> {
        let mut verdicts = self.lock(&self.verdicts);
        let Some(entry) = verdicts.get(key) else {
            // A verdict exists but for a different tuple: stale, not missing.
            if verdicts.keys().any(|k| k.target == key.target) {
                return Err(EngineError::PreflightStale);
            }
            return Err(EngineError::PreflightRequired);
        };
        if entry.at.elapsed() > self.cfg.verdict_ttl {
            verdicts.remove(key);
            return Err(EngineError::PreflightStale);
        }
        if !entry.blockers.is_empty() {
            return Err(EngineError::PreflightBlocked {
                blockers: entry.blockers.clone(),
            });
        }
        Ok(())
    }

    fn acquire(&self, name: &'static str) -> EngineResult<SerialGuard<'_>> {
        let mut active = self.lock(&self.active);
        if let Some(current) = *active {
            return Err(EngineError::Busy {
                operation: current.to_string(),
            });
        }
        *active = Some(name);
        Ok(SerialGuard { slot: &self.active })
    }

    fn advance(&self, next: OpState) {
        let mut state = self.lock(&self.state);
        if state.may_advance(next) {
            log::debug!("operation state {:?} -> {:?}", *state, next);
            *state = next;
        } else if *state != next {
            // Collapse out-of-band sequences (e.g. Failed before Running)
            // onto the terminal states rather than panicking mid-operation.
            log::debug!("operation state {:?} -/-> {:?} (forced)", *state, next);
            *state = next;
        }
    }

    fn ctx(&self) -> OpCtx<'_> {
        OpCtx {
            hal: self.hal.as_ref(),
            cfg: &self.cfg,
            bus: &self.bus,
            journal: &self.journal,
        }
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct SerialGuard<'a> {
    slot: &'a Mutex<Option<&'static str>>,
}

impl Drop for SerialGuard<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

fn empty_outcome() -> OpOutcome {
    OpOutcome {
        ok: true,
        details: None,
        warnings: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;
    use crate::journal::{JournalOp, JournalRecord};
    use crate::ops::partition::TableKind;
    use oxidisk_hal::{FakeDisk, FakeHal, FakePartition, Operation};
    use tempfile::tempdir;

    fn dispatcher_with(hal: FakeHal, dir: &std::path::Path) -> Dispatcher {
        Dispatcher::new(Arc::new(hal), EngineConfig::scratch(dir))
    }

    fn usb_hal() -> FakeHal {
        let hal = FakeHal::new();
        hal.add_disk(FakeDisk::external("disk4", 64 * MIB));
        hal
    }

    fn wipe_req() -> WipeDeviceRequest {
        WipeDeviceRequest {
            device_identifier: "disk4".to_string(),
            table_type: TableKind::Gpt,
            format_type: FsKind::Exfat,
            label: "USB".to_string(),
        }
    }

    #[test]
    fn destructive_op_requires_a_preflight_verdict() {
        let tmp = tempdir().unwrap();
        let dispatcher = dispatcher_with(usb_hal(), tmp.path());

        let err = dispatcher.wipe_device(wipe_req()).unwrap_err();
        assert!(matches!(err, EngineError::PreflightRequired));
    }

    #[test]
    fn fresh_matching_verdict_unlocks_execution() {
        let tmp = tempdir().unwrap();
        let dispatcher = dispatcher_with(usb_hal(), tmp.path());

        let verdict = dispatcher
            .preflight(PreflightRequest::new(OpKind::Wipe, "disk4").with_fs(FsKind::Exfat))
            .unwrap();
        assert!(verdict.ok);

        let outcome = dispatcher.wipe_device(wipe_req()).unwrap();
        assert!(outcome.ok);
    }

    #[test]
    fn verdict_for_a_different_fs_is_stale() {
        let tmp = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.add_disk(
            FakeDisk::external("disk4", 64 * MIB)
                .with_partition(FakePartition::new("disk4s1", MIB, 32 * MIB)),
        );
        let dispatcher = dispatcher_with(hal, tmp.path());

        dispatcher
            .preflight(PreflightRequest::new(OpKind::Format, "disk4s1").with_fs(FsKind::Exfat))
            .unwrap();

        let err = dispatcher
            .format_partition(FormatPartitionRequest {
                partition_identifier: "disk4s1".to_string(),
                format_type: FsKind::Fat32,
                label: "OXI".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::PreflightStale));
    }

    #[test]
    fn expired_verdict_is_stale() {
        let tmp = tempdir().unwrap();
        let mut cfg = EngineConfig::scratch(tmp.path());
        cfg.verdict_ttl = std::time::Duration::ZERO;
        let dispatcher = Dispatcher::new(Arc::new(usb_hal()), cfg);

        dispatcher
            .preflight(PreflightRequest::new(OpKind::Wipe, "disk4").with_fs(FsKind::Exfat))
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));

        let err = dispatcher.wipe_device(wipe_req()).unwrap_err();
        assert!(matches!(err, EngineError::PreflightStale));
    }

    #[test]
    fn blocked_verdict_surfaces_its_blockers() {
        let tmp = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.add_disk(
            FakeDisk::internal("disk1", 128 * MIB).with_partition(
                FakePartition::new("disk1s1", MIB, 64 * MIB).with_roles(&["System"]),
            ),
        );
        let dispatcher = dispatcher_with(hal, tmp.path());

        let verdict = dispatcher
            .preflight(PreflightRequest::new(OpKind::Delete, "disk1s1"))
            .unwrap();
        assert!(!verdict.ok);

        let err = dispatcher
            .delete_partition(DeletePartitionRequest {
                partition_identifier: "disk1s1".to_string(),
            })
            .unwrap_err();
        match err {
            EngineError::PreflightBlocked { blockers } => {
                assert!(blockers.contains(&"protected:system".to_string()));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn successful_operation_invalidates_all_verdicts() {
        let tmp = tempdir().unwrap();
        let dispatcher = dispatcher_with(usb_hal(), tmp.path());

        dispatcher
            .preflight(PreflightRequest::new(OpKind::Wipe, "disk4").with_fs(FsKind::Exfat))
            .unwrap();
        dispatcher.wipe_device(wipe_req()).unwrap();

        let err = dispatcher.wipe_device(wipe_req()).unwrap_err();
        assert!(matches!(err, EngineError::PreflightRequired));
    }

    #[test]
    fn second_operation_is_rejected_while_one_is_active() {
        let tmp = tempdir().unwrap();
        let dispatcher = dispatcher_with(usb_hal(), tmp.path());

        *dispatcher.active.lock().unwrap() = Some("move");
        let err = dispatcher.wipe_device(wipe_req()).unwrap_err();
        assert!(matches!(err, EngineError::Busy { ref operation } if operation == "move"));
    }

    #[test]
    fn cancel_before_dispatch_is_a_noop() {
        let tmp = tempdir().unwrap();
        let dispatcher = dispatcher_with(usb_hal(), tmp.path());

        dispatcher
            .preflight(PreflightRequest::new(OpKind::Wipe, "disk4").with_fs(FsKind::Exfat))
            .unwrap();
        dispatcher.cancel();

        let outcome = dispatcher.wipe_device(wipe_req()).unwrap();
        assert!(outcome.ok);
    }

    #[test]
    fn startup_journal_reports_interrupted_operations() {
        let tmp = tempdir().unwrap();
        let hal = usb_hal();
        let cfg = EngineConfig::scratch(tmp.path());
        let store = JournalStore::new(
            cfg.journal_path.clone(),
            cfg.checkpoint_bytes,
            cfg.checkpoint_interval,
        );
        store
            .begin(
                JournalRecord::new(JournalOp::Move, "disk4s2", "disk4")
                    .span(Some(MIB), Some(4 * MIB), 8 * MIB),
            )
            .unwrap();

        let dispatcher = Dispatcher::new(Arc::new(hal), cfg);
        let pending = dispatcher.startup_journal().unwrap().unwrap();
        assert_eq!(pending.record.operation, JournalOp::Move);
        assert!(!pending.device_present); // disk4s2 does not exist

        dispatcher
            .resolve_journal(JournalResolution::Ignore)
            .unwrap();
        assert!(dispatcher.startup_journal().unwrap().is_none());
    }

    #[test]
    fn journal_repair_runs_a_repairing_check_then_clears() {
        let tmp = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.add_disk(
            FakeDisk::external("disk4", 64 * MIB)
                .with_partition(FakePartition::new("disk4s2", MIB, 32 * MIB).fs("exfat")),
        );
        let cfg = EngineConfig::scratch(tmp.path());
        let store = JournalStore::new(
            cfg.journal_path.clone(),
            cfg.checkpoint_bytes,
            cfg.checkpoint_interval,
        );
        store
            .begin(
                JournalRecord::new(JournalOp::Move, "disk4s2", "disk4")
                    .span(Some(MIB), Some(4 * MIB), 8 * MIB),
            )
            .unwrap();

        let dispatcher = Dispatcher::new(Arc::new(hal.clone()), cfg);
        dispatcher
            .resolve_journal(JournalResolution::Repair)
            .unwrap();

        assert!(hal.has_operation(|op| matches!(op, Operation::RepairVolume { .. })));
        assert!(dispatcher.journal_peek().unwrap().is_none());
    }

    #[test]
    fn clear_journal_on_empty_slot_is_idempotent() {
        let tmp = tempdir().unwrap();
        let dispatcher = dispatcher_with(usb_hal(), tmp.path());
        dispatcher.journal_clear().unwrap();
        dispatcher.journal_clear().unwrap();
    }

    #[test]
    fn state_machine_edges() {
        use OpState::*;
        assert!(Idle.may_advance(Validating));
        assert!(Validating.may_advance(Prepared));
        assert!(Prepared.may_advance(Running));
        assert!(Running.may_advance(Completed));
        assert!(Running.may_advance(Cancelling));
        assert!(Cancelling.may_advance(Failed));
        assert!(!Idle.may_advance(Running));
        assert!(!Completed.may_advance(Running));
        assert!(!Failed.may_advance(Completed));
    }

    #[test]
    fn operations_without_keys_skip_preflight_but_hold_the_lock() {
        let tmp = tempdir().unwrap();
        let hal = FakeHal::new();
        hal.add_disk(
            FakeDisk::external("disk4", 64 * MIB)
                .with_partition(FakePartition::new("disk4s1", MIB, 32 * MIB).fs("apfs")),
        );
        let dispatcher = dispatcher_with(hal, tmp.path());

        let outcome = dispatcher
            .check_partition(CheckPartitionRequest {
                partition_identifier: "disk4s1".to_string(),
                repair: false,
            })
            .unwrap();
        assert!(outcome.ok);
        assert_eq!(dispatcher.state(), OpState::Idle);
    }
}
