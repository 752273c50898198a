//! Engine configuration.

use std::path::PathBuf;
use std::time::Duration;

pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Single-slot journal file, atomic writes, 0600.
    pub journal_path: PathBuf,
    /// Sudoers fragment installed for the helper binary.
    pub sudoers_path: PathBuf,
    /// Laptops below this charge refuse destructive operations outright.
    pub battery_floor_percent: u32,
    /// How long a preflight verdict stays fresh.
    pub verdict_ttl: Duration,
    /// Block size for byte copies (move, flash, backup). Multiple of 1 MiB.
    pub copy_block_size: u64,
    /// Checkpoint at most this often.
    pub checkpoint_bytes: u64,
    pub checkpoint_interval: Duration,
    /// Grace between SIGTERM and SIGKILL during force unmount.
    pub force_unmount_grace: Duration,
    /// APFS roles that mark a target as system-critical.
    pub protected_roles: Vec<String>,
    /// Resize of filesystems macOS cannot resize natively (ext4, ntfs).
    pub allow_experimental_resize: bool,
    /// Override the sidecar search path. `None` means the default lookup.
    pub sidecar_dirs: Option<Vec<PathBuf>>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            journal_path: PathBuf::from(
                "/Library/Application Support/com.oliverquick.oxidisk/operation_journal.json",
            ),
            sudoers_path: PathBuf::from("/etc/sudoers.d/oxidisk"),
            battery_floor_percent: 30,
            verdict_ttl: Duration::from_secs(120),
            copy_block_size: 4 * MIB,
            checkpoint_bytes: MIB,
            checkpoint_interval: Duration::from_millis(250),
            force_unmount_grace: Duration::from_millis(400),
            protected_roles: ["System", "Data", "Preboot", "Recovery", "VM"]
                .iter()
                .map(|r| r.to_string())
                .collect(),
            allow_experimental_resize: false,
            sidecar_dirs: None,
        }
    }
}

impl EngineConfig {
    /// Test-friendly config rooted in a scratch directory with no pauses.
    pub fn scratch(dir: &std::path::Path) -> Self {
        Self {
            journal_path: dir.join("operation_journal.json"),
            sudoers_path: dir.join("sudoers.d").join("oxidisk"),
            force_unmount_grace: Duration::ZERO,
            checkpoint_interval: Duration::ZERO,
            sidecar_dirs: Some(vec![dir.join("sidecars")]),
            ..Self::default()
        }
    }
}
