use std::io;
use thiserror::Error;

pub type HalResult<T> = Result<T, HalError>;
pub type EngineResult<T> = Result<T, EngineError>;

/// How many trailing bytes of sidecar stderr are kept on an error.
const STDERR_TAIL: usize = 512;

#[derive(Error, Debug)]
pub enum HalError {
    #[error("Command not found: {0}")]
    CommandNotFound(String),

    #[error("Command failed: {program} (exit={code:?}): {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("Command timed out: {program} after {timeout_secs}s")]
    CommandTimeout { program: String, timeout_secs: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("UTF-8 decode error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("{0}")]
    Other(String),
}

/// Operation-level error taxonomy. Every engine command resolves to exactly
/// one of these tags; only `Io`, `SubprocessFailed` and `Corrupted` may carry
/// raw output tails.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Operation blocked by preflight: {}", blockers.join("; "))]
    PreflightBlocked { blockers: Vec<String> },

    #[error("A fresh preflight verdict is required for this operation")]
    PreflightRequired,

    #[error("Preflight verdict does not match the requested operation")]
    PreflightStale,

    #[error("Another operation is already running: {operation}")]
    Busy { operation: String },

    #[error("Target is protected: {reason}")]
    Protected { reason: String },

    #[error("Required sidecar is missing: {name}")]
    MissingSidecar { name: String },

    #[error("Invalid {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Device disappeared: {identifier}")]
    DeviceGone { identifier: String },

    #[error("I/O failure during {op}: {detail}")]
    Io { op: String, detail: String },

    #[error("{binary} failed (exit={exit:?}): {stderr_tail}")]
    SubprocessFailed {
        binary: String,
        exit: Option<i32>,
        stderr_tail: String,
    },

    #[error("Verification failed: expected {expected}, got {actual}")]
    VerificationFailed { expected: String, actual: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unrecoverable state, repair required: {detail}")]
    Corrupted { detail: String },

    #[error("Unsupported: {reason}")]
    Unsupported { reason: String },
}

impl EngineError {
    pub fn io(op: &str, err: io::Error) -> Self {
        EngineError::Io {
            op: op.to_string(),
            detail: err.to_string(),
        }
    }

    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        EngineError::InvalidInput {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable machine tag for the wire protocol.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::PreflightBlocked { .. } => "preflight-blocked",
            EngineError::PreflightRequired => "preflight-required",
            EngineError::PreflightStale => "preflight-stale",
            EngineError::Busy { .. } => "busy",
            EngineError::Protected { .. } => "protected",
            EngineError::MissingSidecar { .. } => "missing-sidecar",
            EngineError::InvalidInput { .. } => "invalid-input",
            EngineError::DeviceGone { .. } => "device-gone",
            EngineError::Io { .. } => "io",
            EngineError::SubprocessFailed { .. } => "subprocess-failed",
            EngineError::VerificationFailed { .. } => "verification-failed",
            EngineError::Cancelled => "cancelled",
            EngineError::Corrupted { .. } => "corrupted",
            EngineError::Unsupported { .. } => "unsupported",
        }
    }

    /// Wire form `{kind, message, details?}` reported by the helper.
    pub fn to_wire(&self) -> serde_json::Value {
        let details = match self {
            EngineError::PreflightBlocked { blockers } => {
                Some(serde_json::json!({ "blockers": blockers }))
            }
            EngineError::InvalidInput { field, reason } => {
                Some(serde_json::json!({ "field": field, "reason": reason }))
            }
            EngineError::VerificationFailed { expected, actual } => {
                Some(serde_json::json!({ "expected": expected, "actual": actual }))
            }
            EngineError::SubprocessFailed { binary, exit, .. } => {
                Some(serde_json::json!({ "binary": binary, "exit": exit }))
            }
            _ => None,
        };
        let mut wire = serde_json::json!({
            "kind": self.kind(),
            "message": self.to_string(),
        });
        if let Some(details) = details {
            wire["details"] = details;
        }
        wire
    }
}

impl From<HalError> for EngineError {
    fn from(err: HalError) -> Self {
        match err {
            HalError::CommandNotFound(name) => EngineError::MissingSidecar { name },
            HalError::CommandFailed {
                program,
                code,
                stderr,
            } => EngineError::SubprocessFailed {
                binary: program,
                exit: code,
                stderr_tail: tail(&stderr),
            },
            HalError::CommandTimeout {
                program,
                timeout_secs,
            } => EngineError::SubprocessFailed {
                binary: program,
                exit: None,
                stderr_tail: format!("timed out after {timeout_secs}s"),
            },
            HalError::Io(err) => EngineError::Io {
                op: "io".to_string(),
                detail: err.to_string(),
            },
            HalError::Utf8(err) => EngineError::Io {
                op: "decode".to_string(),
                detail: err.to_string(),
            },
            HalError::Parse(detail) => EngineError::Io {
                op: "parse".to_string(),
                detail,
            },
            HalError::Other(detail) => EngineError::Io {
                op: "hal".to_string(),
                detail,
            },
        }
    }
}

fn tail(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= STDERR_TAIL {
        return trimmed.to_string();
    }
    let cut = trimmed.len() - STDERR_TAIL;
    // Keep the tail on a char boundary.
    let mut start = cut;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_not_found_maps_to_missing_sidecar() {
        let err: EngineError = HalError::CommandNotFound("sgdisk".to_string()).into();
        assert!(matches!(err, EngineError::MissingSidecar { ref name } if name == "sgdisk"));
        assert_eq!(err.kind(), "missing-sidecar");
    }

    #[test]
    fn command_failed_keeps_only_stderr_tail() {
        let long = "x".repeat(4 * STDERR_TAIL);
        let err: EngineError = HalError::CommandFailed {
            program: "mkfs.ext4".to_string(),
            code: Some(1),
            stderr: long,
        }
        .into();
        match err {
            EngineError::SubprocessFailed { stderr_tail, .. } => {
                assert_eq!(stderr_tail.len(), STDERR_TAIL);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn wire_form_carries_kind_and_details() {
        let err = EngineError::invalid("label", "fat32 labels are at most 11 chars");
        let wire = err.to_wire();
        assert_eq!(wire["kind"], "invalid-input");
        assert_eq!(wire["details"]["field"], "label");
    }
}
