//! Progress/log fan-out and the cooperative cancel flag.
//!
//! Producers are the operations; readers are the UI and tests. Readers may
//! be absent, in which case events are dropped. Speed and ETA are a consumer
//! concern; the producer only guarantees monotone byte counts.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;

/// Events kept in flight per channel. Anything beyond this window is
/// dropped rather than stalling the producer.
const EVENT_WINDOW: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub percent: u8,
    pub phase: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub source: String,
    pub line: String,
}

#[derive(Default)]
pub struct OpBus {
    progress_tx: Mutex<Option<SyncSender<ProgressEvent>>>,
    log_tx: Mutex<Option<SyncSender<LogEvent>>>,
    cancel: AtomicBool,
    byte_floor: AtomicU64,
}

impl OpBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a progress reader, replacing any previous one.
    pub fn subscribe_progress(&self) -> Receiver<ProgressEvent> {
        let (tx, rx) = sync_channel(EVENT_WINDOW);
        *self.progress_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    /// Attach a log reader, replacing any previous one.
    pub fn subscribe_logs(&self) -> Receiver<LogEvent> {
        let (tx, rx) = sync_channel(EVENT_WINDOW);
        *self.log_tx.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    /// Reset per-operation state. Called by the dispatcher at op start.
    pub fn begin_operation(&self) {
        self.cancel.store(false, Ordering::SeqCst);
        self.byte_floor.store(0, Ordering::SeqCst);
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    pub fn emit(&self, phase: &str, percent: u8, message: Option<&str>) {
        self.send_progress(ProgressEvent {
            percent: percent.min(100),
            phase: phase.to_string(),
            message: message.map(|m| m.to_string()),
            bytes: None,
            total_bytes: None,
        });
    }

    /// Byte-counted progress. Counts are clamped so the stream stays
    /// monotonically non-decreasing per operation.
    pub fn emit_bytes(&self, phase: &str, bytes: u64, total_bytes: Option<u64>) {
        let floor = self
            .byte_floor
            .fetch_max(bytes, Ordering::SeqCst)
            .max(bytes);
        let percent = match total_bytes {
            Some(total) if total > 0 => ((floor as f64 / total as f64) * 100.0).round() as u8,
            _ => 0,
        };
        self.send_progress(ProgressEvent {
            percent: percent.min(100),
            phase: phase.to_string(),
            message: None,
            bytes: Some(floor),
            total_bytes,
        });
    }

    pub fn emit_log(&self, source: &str, line: &str) {
        let event = LogEvent {
            source: source.to_string(),
            line: line.to_string(),
        };
        let mut guard = self.log_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            match tx.try_send(event) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => *guard = None,
            }
        }
    }

    fn send_progress(&self, event: ProgressEvent) {
        let mut guard = self.progress_tx.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            match tx.try_send(event) {
                Ok(()) | Err(TrySendError::Full(_)) => {}
                Err(TrySendError::Disconnected(_)) => *guard = None,
            }
        }
    }
}
