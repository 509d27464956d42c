//! Outbound event stream. The engine's observer contract
//! (`onStateChange`/`onProgress`/`onFileReceived`/`onLog`) maps to one
//! tagged enum delivered over a `tokio::sync::broadcast` channel, following
//! the teacher's `TransferEvent` shape in its transfer manager.

use crate::types::{ConnectionState, FileMeta};
use bytes::Bytes;

#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The session's connection state changed.
    StateChanged(ConnectionState),

    /// Progress snapshot for the current batch, emitted by whichever side
    /// currently owns progress authority (see [`crate::monitor`]).
    Progress {
        transferred_bytes: u64,
        total_size: u64,
        completed_files: u32,
        total_files: u32,
        speed_bps: f64,
        eta_label: String,
        is_complete: bool,
    },

    /// A file finished reassembly on the receiving side.
    FileReceived { meta: FileMeta, blob: Bytes },

    /// Free-form diagnostic line, mirrored to `tracing` as well.
    Log(String),
}
