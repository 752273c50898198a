//! Single-slot operation journal.
//!
//! Exactly one record may exist. Its presence at startup means a byte-copy
//! operation was interrupted. Writes are atomic (temp file + rename, fsync,
//! directory fsync) and the file is readable by root only.

use oxidisk_error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalOp {
    Move,
    Copy,
    Flash,
    Backup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JournalRecord {
    pub operation: JournalOp,
    pub device: String,
    pub disk: String,
    pub src_offset: Option<u64>,
    pub dst_offset: Option<u64>,
    pub size: u64,
    pub block_size: u64,
    pub last_copied: u64,
    pub updated_at: u64,
}

impl JournalRecord {
    pub fn new(operation: JournalOp, device: &str, disk: &str) -> Self {
        Self {
            operation,
            device: device.to_string(),
            disk: disk.to_string(),
            src_offset: None,
            dst_offset: None,
            size: 0,
            block_size: 512,
            last_copied: 0,
            updated_at: unix_now(),
        }
    }

    pub fn span(mut self, src_offset: Option<u64>, dst_offset: Option<u64>, size: u64) -> Self {
        self.src_offset = src_offset;
        self.dst_offset = dst_offset;
        self.size = size;
        self
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }
}

struct Checkpointing {
    record: Option<JournalRecord>,
    last_write: Option<Instant>,
    last_bytes: u64,
}

/// Owns the journal slot. Only the dispatcher holds one of these while an
/// operation executes.
pub struct JournalStore {
    path: PathBuf,
    checkpoint_bytes: u64,
    checkpoint_interval: Duration,
    state: Mutex<Checkpointing>,
}

impl JournalStore {
    pub fn new(path: PathBuf, checkpoint_bytes: u64, checkpoint_interval: Duration) -> Self {
        Self {
            path,
            checkpoint_bytes,
            checkpoint_interval,
            state: Mutex::new(Checkpointing {
                record: None,
                last_write: None,
                last_bytes: 0,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the slot without taking ownership of it.
    pub fn peek(&self) -> EngineResult<Option<JournalRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data =
            fs::read_to_string(&self.path).map_err(|e| EngineError::io("journal read", e))?;
        let record = serde_json::from_str(&data).map_err(|e| EngineError::Corrupted {
            detail: format!("journal does not parse: {e}"),
        })?;
        Ok(Some(record))
    }

    /// Persist the record before any destructive block write.
    pub fn begin(&self, record: JournalRecord) -> EngineResult<()> {
        self.write_atomic(&record)?;
        let mut state = self.lock();
        state.record = Some(record);
        state.last_write = Some(Instant::now());
        state.last_bytes = 0;
        Ok(())
    }

    /// Record copy progress. Rate-limited; only every `checkpoint_bytes` or
    /// `checkpoint_interval` actually hits the disk.
    pub fn checkpoint(&self, last_copied: u64) -> EngineResult<()> {
        let record = {
            let mut state = self.lock();
            let Some(record) = state.record.as_mut() else {
                return Ok(());
            };
            record.last_copied = last_copied.max(record.last_copied);
            record.updated_at = unix_now();

            let due_bytes = last_copied.saturating_sub(state.last_bytes) >= self.checkpoint_bytes;
            let due_time = state
                .last_write
                .map(|at| at.elapsed() >= self.checkpoint_interval)
                .unwrap_or(true);
            if !due_bytes && !due_time {
                return Ok(());
            }
            state.last_bytes = last_copied;
            state.last_write = Some(Instant::now());
            state.record.clone().unwrap()
        };
        self.write_atomic(&record)
    }

    /// Operation finished; clear the slot.
    pub fn commit(&self) -> EngineResult<()> {
        self.clear()
    }

    /// Operation rolled back without lasting effects; clear the slot.
    pub fn abort(&self) -> EngineResult<()> {
        self.clear()
    }

    /// Idempotent slot clear.
    pub fn clear(&self) -> EngineResult<()> {
        let mut state = self.lock();
        state.record = None;
        state.last_write = None;
        state.last_bytes = 0;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(EngineError::io("journal clear", err)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Checkpointing> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_atomic(&self, record: &JournalRecord) -> EngineResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::io("journal mkdir", e))?;
        }
        let payload = serde_json::to_string_pretty(record).map_err(|e| {
            EngineError::io(
                "journal encode",
                std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            )
        })?;

        let tmp_path = self.path.with_extension("json.tmp");
        let mut file =
            File::create(&tmp_path).map_err(|e| EngineError::io("journal write", e))?;
        file.write_all(payload.as_bytes())
            .map_err(|e| EngineError::io("journal write", e))?;
        file.sync_all()
            .map_err(|e| EngineError::io("journal flush", e))?;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))
            .map_err(|e| EngineError::io("journal chmod", e))?;
        fs::rename(&tmp_path, &self.path).map_err(|e| EngineError::io("journal rename", e))?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store(dir: &Path) -> JournalStore {
        JournalStore::new(dir.join("journal.json"), 1024, Duration::ZERO)
    }

    fn move_record() -> JournalRecord {
        JournalRecord::new(JournalOp::Move, "disk4s2", "disk4")
            .span(Some(1024), Some(4096), 1 << 20)
            .block_size(512)
    }

    #[test]
    fn begin_then_peek_round_trips() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.begin(move_record()).unwrap();
        let seen = store.peek().unwrap().unwrap();
        assert_eq!(seen.operation, JournalOp::Move);
        assert_eq!(seen.dst_offset, Some(4096));
        assert_eq!(seen.last_copied, 0);
    }

    #[test]
    fn checkpoints_are_monotone() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.begin(move_record()).unwrap();

        store.checkpoint(8192).unwrap();
        store.checkpoint(4096).unwrap();
        let seen = store.peek().unwrap().unwrap();
        assert_eq!(seen.last_copied, 8192);
    }

    #[test]
    fn checkpoint_rate_limit_skips_small_increments() {
        let dir = tempdir().unwrap();
        let store = JournalStore::new(
            dir.path().join("journal.json"),
            1 << 20,
            Duration::from_secs(3600),
        );
        store.begin(move_record()).unwrap();

        // Below both thresholds: file keeps the begin-time value.
        store.checkpoint(10).unwrap();
        assert_eq!(store.peek().unwrap().unwrap().last_copied, 0);

        // Crossing the byte threshold forces a write.
        store.checkpoint(2 << 20).unwrap();
        assert_eq!(store.peek().unwrap().unwrap().last_copied, 2 << 20);
    }

    #[test]
    fn commit_and_abort_clear_the_slot() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        store.begin(move_record()).unwrap();
        store.commit().unwrap();
        assert!(store.peek().unwrap().is_none());

        store.begin(move_record()).unwrap();
        store.abort().unwrap();
        assert!(store.peek().unwrap().is_none());
    }

    #[test]
    fn clear_on_empty_slot_is_a_noop() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.clear().unwrap();
        store.clear().unwrap();
    }

    #[test]
    fn journal_file_is_owner_readable_only() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.begin(move_record()).unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn checkpoint_without_begin_is_ignored() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store.checkpoint(4096).unwrap();
        assert!(store.peek().unwrap().is_none());
    }
}
