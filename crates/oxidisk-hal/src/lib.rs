//! Oxidisk hardware abstraction layer.
//!
//! This crate is the boundary for "world-touching" code: `diskutil`, `pmset`,
//! `lsof`, `hdiutil`, raw block-device I/O, and every external sidecar binary
//! the engine drives. Nothing above this crate spawns a process or opens a
//! device node directly.
//!
//! # HAL traits
//!
//! Each concern is a small trait implemented by:
//! - `MacosHal`: real implementation driving the platform tools
//! - `FakeHal`: recording implementation for CI-safe tests

pub mod guards;
pub mod plist_dict;
pub mod process;
pub mod sidecar;

pub mod hal;
pub use hal::*;

pub use oxidisk_error::{HalError, HalResult};
