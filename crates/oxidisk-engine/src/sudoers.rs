//! Sudoers fragment granting passwordless execution of the helper binary.
//!
//! Installation is idempotent (re-runs leave a byte-equal fragment) and
//! reversible.

use oxidisk_error::{EngineError, EngineResult};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SudoersInstall {
    pub helper_path: String,
    pub sudoers_path: String,
    pub changed: bool,
}

/// Install the fragment for `username`, letting it run `helper_path` as root
/// without a password.
pub fn install(
    sudoers_path: &Path,
    username: &str,
    helper_path: &str,
) -> EngineResult<SudoersInstall> {
    validate_token(username, "username", false)?;
    validate_token(helper_path, "helperPath", true)?;

    let fragment = format!("{username} ALL=(root) NOPASSWD: {helper_path}\n");

    if let Ok(existing) = fs::read_to_string(sudoers_path) {
        if existing == fragment {
            return Ok(SudoersInstall {
                helper_path: helper_path.to_string(),
                sudoers_path: sudoers_path.display().to_string(),
                changed: false,
            });
        }
    }

    if let Some(parent) = sudoers_path.parent() {
        fs::create_dir_all(parent).map_err(|e| EngineError::io("sudoers mkdir", e))?;
    }
    let tmp_path = sudoers_path.with_extension("tmp");
    let mut file = File::create(&tmp_path).map_err(|e| EngineError::io("sudoers write", e))?;
    file.write_all(fragment.as_bytes())
        .map_err(|e| EngineError::io("sudoers write", e))?;
    file.sync_all()
        .map_err(|e| EngineError::io("sudoers flush", e))?;
    fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o440))
        .map_err(|e| EngineError::io("sudoers chmod", e))?;
    fs::rename(&tmp_path, sudoers_path).map_err(|e| EngineError::io("sudoers rename", e))?;

    Ok(SudoersInstall {
        helper_path: helper_path.to_string(),
        sudoers_path: sudoers_path.display().to_string(),
        changed: true,
    })
}

/// Remove the fragment. Missing files are fine.
pub fn remove(sudoers_path: &Path) -> EngineResult<()> {
    match fs::remove_file(sudoers_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(EngineError::io("sudoers remove", err)),
    }
}

fn validate_token(value: &str, field: &str, allow_slash: bool) -> EngineResult<()> {
    let ok = !value.is_empty()
        && value.chars().all(|ch| {
            ch.is_ascii_alphanumeric()
                || ch == '_'
                || ch == '-'
                || ch == '.'
                || (allow_slash && ch == '/')
        });
    if ok {
        Ok(())
    } else {
        Err(EngineError::invalid(field, "contains invalid characters"))
    }
}
