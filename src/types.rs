//! Shared data types for the transfer engine: file/batch metadata, chunks,
//! batch progress, and connection state.

use serde::{Deserialize, Serialize};

/// Metadata for one file within a batch. Immutable once announced; `file_index`
/// is unique within the batch that contains it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileMeta {
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub total_chunks: u32,
    pub file_index: u32,
}

/// Metadata for one `send_files` call.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BatchMeta {
    pub total_files: u32,
    pub total_size: u64,
}

/// One chunk of a file. `payload` is self-addressing on the wire: the header
/// carries `file_index`; `chunk_index` is implicit from receive order under
/// Layout A.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub file_index: u32,
    pub chunk_index: u32,
    pub payload: bytes::Bytes,
}

/// Per-direction, per-session batch progress. Mutated only by the owning
/// pipeline; read by the [`crate::monitor::TransferMonitor`].
#[derive(Debug, Clone, Default)]
pub struct BatchState {
    pub total_files: u32,
    pub total_size: u64,
    pub transferred_bytes: u64,
    pub completed_files: u32,
    pub current_file_name: Option<String>,
    pub started_at: Option<i64>,
}

impl BatchState {
    pub fn reset(&mut self, meta: BatchMeta, started_at: i64) {
        self.total_files = meta.total_files;
        self.total_size = meta.total_size;
        self.transferred_bytes = 0;
        self.completed_files = 0;
        self.current_file_name = None;
        self.started_at = Some(started_at);
    }

    pub fn is_complete(&self) -> bool {
        self.total_files > 0 && self.completed_files == self.total_files
    }
}

/// Internal rendezvous/log-correlation key for one `send_files` batch: a
/// monotonic counter paired with the millisecond it was minted. `file_index`
/// remains the only identifier that crosses the wire; this just disambiguates
/// bookkeeping across successive batches run on the same pipeline. Never
/// serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId {
    pub sequence: u64,
    pub started_at_millis: i64,
}

impl TransferId {
    pub fn next(counter: &std::sync::atomic::AtomicU64) -> Self {
        let sequence = counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Self { sequence, started_at_millis: crate::time::now_timestamp_millis() }
    }
}

impl std::fmt::Display for TransferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "transfer-{}", self.sequence)
    }
}

/// The session's connection lifecycle. Exactly one variant is current at any
/// time; `disconnected` returns to `idle` only via explicit `cleanup()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Signaling,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}
