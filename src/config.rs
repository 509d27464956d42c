//! Tunable constants, collected the way the teacher collects platform
//! config (`CoreConfig`) — a single struct with a `Default` impl matching
//! the documented recommendations, overridable by the host application or
//! by tests that want to exercise an edge case (e.g. a tiny `ram_threshold`
//! to force the spill tier without allocating a 150 MiB fixture).

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Payload bytes per binary frame.
    pub chunk_size: usize,
    /// Sender backpressure ceiling on `DataChannel::buffered_amount()`.
    pub max_buffered_amount: usize,
    /// Threshold at which the sender resumes pumping after backpressure.
    pub low_water_mark: usize,
    /// Pipelined read depth for the sender's chunk reader.
    pub max_inflight_reads: usize,
    /// Files above this size spill to the persistent chunk store.
    pub ram_threshold: u64,
    /// Spill-tier write queue flush size.
    pub spill_batch: usize,
    /// Minimum interval between receiver-emitted `progress-sync` frames.
    pub sync_interval: Duration,
    /// Rendezvous escape hatch for `ack-file`.
    pub ack_timeout: Duration,
    /// Files pipelined concurrently by the sender.
    pub max_concurrent_uploads: usize,
    /// Directory spill-tier backing files are created under.
    pub spill_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            max_buffered_amount: 16 * 1024 * 1024,
            low_water_mark: 1024 * 1024,
            max_inflight_reads: 32,
            ram_threshold: 150 * 1024 * 1024,
            spill_batch: 64,
            sync_interval: Duration::from_millis(200),
            ack_timeout: Duration::from_millis(60_000),
            max_concurrent_uploads: 1,
            spill_dir: std::env::temp_dir(),
        }
    }
}

/// Byte length of the binary frame header (`u32` big-endian file index).
pub const HEADER_SIZE: usize = 4;
