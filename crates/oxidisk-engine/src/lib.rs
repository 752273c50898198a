//! Oxidisk Disk Operations Engine.
//!
//! Everything destructive or long-running against block devices goes through
//! this crate: topology inspection, preflight safety gating, the serial
//! operation dispatcher, partition lifecycle operations, crash-safe byte
//! moves, and image flash/backup/staging. The privileged helper binary is a
//! thin JSON shell around the `Dispatcher`.

pub mod bus;
pub mod config;
pub mod dispatcher;
pub mod fs_driver;
pub mod inspector;
pub mod journal;
pub mod labels;
pub mod logging;
pub mod model;
pub mod ops;
pub mod preflight;
pub mod size;
pub mod sudoers;

pub use bus::{LogEvent, OpBus, ProgressEvent};
pub use config::EngineConfig;
pub use dispatcher::{Dispatcher, JournalResolution, OpOutcome};
pub use journal::{JournalOp, JournalRecord, JournalStore};
pub use labels::FsKind;
pub use model::{
    ApfsContainer, ApfsVolume, Device, Partition, PartitionBounds, ProtectionReason,
    UnallocatedSegment,
};
pub use preflight::{OpKind, PreflightRequest, Verdict};

pub use oxidisk_error::{EngineError, EngineResult};
