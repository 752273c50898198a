//! Size-string grammar and alignment helpers.
//!
//! User-facing sizes are `<integer>[.<digits>](m|g)`. Internally everything
//! is a byte count aligned downward to 1 MiB.

use crate::config::MIB;
use oxidisk_error::{EngineError, EngineResult};

/// Parse a user-facing size string into raw bytes.
pub fn parse_size(input: &str) -> EngineResult<u64> {
    let trimmed = input.trim().to_lowercase();
    let (number_part, unit) = match trimmed.chars().last() {
        Some('m') => (&trimmed[..trimmed.len() - 1], MIB),
        Some('g') => (&trimmed[..trimmed.len() - 1], 1024 * MIB),
        _ => {
            return Err(EngineError::invalid(
                "size",
                format!("expected <number>m or <number>g, got {input:?}"),
            ))
        }
    };
    if number_part.is_empty()
        || !number_part
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.')
        || number_part.matches('.').count() > 1
        || number_part.starts_with('.')
        || number_part.ends_with('.')
    {
        return Err(EngineError::invalid(
            "size",
            format!("malformed number in {input:?}"),
        ));
    }
    let number: f64 = number_part
        .parse()
        .map_err(|_| EngineError::invalid("size", format!("malformed number in {input:?}")))?;
    Ok((number * unit as f64).floor() as u64)
}

/// Canonical byte count: parsed, then aligned downward to 1 MiB.
pub fn canonical_bytes(input: &str) -> EngineResult<u64> {
    let aligned = align_down_mib(parse_size(input)?);
    if aligned == 0 {
        return Err(EngineError::invalid("size", "size is below 1 MiB"));
    }
    Ok(aligned)
}

pub fn align_down_mib(bytes: u64) -> u64 {
    bytes / MIB * MIB
}

pub fn align_up_mib(bytes: u64) -> u64 {
    bytes.div_ceil(MIB) * MIB
}

pub fn is_mib_aligned(bytes: u64) -> bool {
    bytes % MIB == 0
}

/// diskutil-style size argument for whole MiB counts.
pub fn mib_arg(bytes: u64) -> String {
    format!("{}M", bytes / MIB)
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}
