//! # Chunk Store
//!
//! Tiered, out-of-order chunk buffer keyed by `chunk_index`, producing a
//! single contiguous blob on [`ChunkStore::finish`].
//!
//! ## Tiering
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        CHUNK STORE                             │
//! ├───────────────────────────────────────────────────────────────┤
//! │  size ≤ RAM_THRESHOLD          size > RAM_THRESHOLD            │
//! │  ┌─────────────────────┐       ┌─────────────────────────┐    │
//! │  │ BTreeMap<u32,Bytes>  │       │ write queue (in memory) │    │
//! │  │ guarded by a Mutex   │       │   │ flush at SPILL_BATCH │    │
//! │  └─────────────────────┘       │   ▼                      │    │
//! │                                 │ rusqlite table,         │    │
//! │                                 │ chunk_index PRIMARY KEY │    │
//! │                                 └─────────────────────────┘    │
//! │  finish(): sort & concat        finish(): ordered scan & concat│
//! │                                  then delete the backing file  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Tier choice is fixed at construction from `file_size` vs
//! [`crate::config::EngineConfig::ram_threshold`] and never changes for the
//! lifetime of the store.

use crate::error::{Error, Result};
use bytes::Bytes;
use rusqlite::{params, Connection};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// An ordered, out-of-order-tolerant chunk buffer for one file.
pub struct ChunkStore {
    tier: Tier,
    cleaned_up: bool,
}

enum Tier {
    Ram(BTreeMap<u32, Bytes>),
    Spill(SpillTier),
}

struct SpillTier {
    conn: Connection,
    path: PathBuf,
    pending: Vec<(u32, Bytes)>,
    spill_batch: usize,
}

impl ChunkStore {
    /// Select RAM or spill tier based on `file_size` against
    /// `config.ram_threshold`. `store_id` seeds the spill tier's on-disk
    /// filename and must be unique per concurrently-open store.
    pub fn new(file_size: u64, store_id: &str, config: &crate::config::EngineConfig) -> Result<Self> {
        let tier = if file_size <= config.ram_threshold {
            Tier::Ram(BTreeMap::new())
        } else {
            Tier::Spill(SpillTier::open(&config.spill_dir, store_id, config.spill_batch)?)
        };
        Ok(Self { tier, cleaned_up: false })
    }

    /// Construct a RAM-tier store directly, useful in tests that don't want
    /// to exercise the spill path.
    #[cfg(test)]
    pub fn new_ram() -> Self {
        Self { tier: Tier::Ram(BTreeMap::new()), cleaned_up: false }
    }

    /// Insert a chunk. No chunk is considered lost once this returns `Ok`.
    pub fn add(&mut self, chunk_index: u32, payload: Bytes) -> Result<()> {
        match &mut self.tier {
            Tier::Ram(map) => {
                map.insert(chunk_index, payload);
                Ok(())
            }
            Tier::Spill(spill) => spill.add(chunk_index, payload),
        }
    }

    /// Drain any pending writes and materialize the ordered concatenation
    /// of every chunk. Must be called at most once; a second call returns
    /// `Err` rather than silently re-reading stale state.
    pub fn finish(&mut self) -> Result<Bytes> {
        if self.cleaned_up {
            return Err(Error::Storage("finish() called after cleanup()".into()));
        }
        let result = match &mut self.tier {
            Tier::Ram(map) => {
                let mut out = Vec::new();
                for (_, payload) in map.iter() {
                    out.extend_from_slice(payload);
                }
                Ok(Bytes::from(out))
            }
            Tier::Spill(spill) => spill.finish(),
        };
        self.cleanup();
        result
    }

    /// Release all resources. Safe to call at any time, any number of
    /// times.
    pub fn cleanup(&mut self) {
        if self.cleaned_up {
            return;
        }
        if let Tier::Spill(spill) = &self.tier {
            if let Err(err) = std::fs::remove_file(&spill.path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %spill.path.display(), %err, "failed to remove spill file");
                }
            }
        }
        self.cleaned_up = true;
    }
}

impl Drop for ChunkStore {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl SpillTier {
    fn open(spill_dir: &std::path::Path, store_id: &str, spill_batch: usize) -> Result<Self> {
        let path = spill_dir.join(format!("transit-spill-{store_id}.sqlite3"));
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chunks (
                chunk_index INTEGER PRIMARY KEY,
                payload BLOB NOT NULL
            )",
        )?;
        Ok(Self { conn, path, pending: Vec::new(), spill_batch })
    }

    fn add(&mut self, chunk_index: u32, payload: Bytes) -> Result<()> {
        self.pending.push((chunk_index, payload));
        if self.pending.len() >= self.spill_batch {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let tx = self.conn.transaction()?;
        for (chunk_index, payload) in self.pending.drain(..) {
            tx.execute(
                "INSERT OR REPLACE INTO chunks (chunk_index, payload) VALUES (?, ?)",
                params![chunk_index, payload.as_ref()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<Bytes> {
        self.flush()?;
        let mut stmt = self.conn.prepare("SELECT payload FROM chunks ORDER BY chunk_index ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.extend_from_slice(&row?);
        }
        Ok(Bytes::from(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    #[test]
    fn ram_tier_selected_for_small_files() {
        let config = EngineConfig::default();
        let store = ChunkStore::new(1024, "t1", &config).unwrap();
        assert!(matches!(store.tier, Tier::Ram(_)));
    }

    #[test]
    fn spill_tier_selected_above_threshold() {
        let config = EngineConfig { ram_threshold: 100, ..EngineConfig::default() };
        let store = ChunkStore::new(200, "t2", &config).unwrap();
        assert!(matches!(store.tier, Tier::Spill(_)));
    }

    #[test]
    fn ram_tier_reassembles_in_order_regardless_of_insertion_order() {
        let mut store = ChunkStore::new_ram();
        store.add(1, Bytes::from_static(b"BB")).unwrap();
        store.add(0, Bytes::from_static(b"AA")).unwrap();
        store.add(2, Bytes::from_static(b"CC")).unwrap();
        let blob = store.finish().unwrap();
        assert_eq!(&blob[..], b"AABBCC");
    }

    #[test]
    fn spill_tier_flushes_in_batches_and_reassembles() {
        let config = EngineConfig { ram_threshold: 0, spill_batch: 2, ..EngineConfig::default() };
        let mut store = ChunkStore::new(10, "t3-spill-batches", &config).unwrap();
        store.add(2, Bytes::from_static(b"CC")).unwrap();
        store.add(0, Bytes::from_static(b"AA")).unwrap();
        store.add(1, Bytes::from_static(b"BB")).unwrap();
        let blob = store.finish().unwrap();
        assert_eq!(&blob[..], b"AABBCC");
    }

    #[test]
    fn finish_deletes_spill_backing_file() {
        let config = EngineConfig { ram_threshold: 0, ..EngineConfig::default() };
        let mut store = ChunkStore::new(10, "t4-cleanup", &config).unwrap();
        let path = match &store.tier {
            Tier::Spill(s) => s.path.clone(),
            _ => panic!("expected spill tier"),
        };
        store.add(0, Bytes::from_static(b"x")).unwrap();
        store.finish().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let mut store = ChunkStore::new_ram();
        store.cleanup();
        store.cleanup();
    }

    #[test]
    fn empty_ram_store_finishes_to_empty_blob() {
        let mut store = ChunkStore::new_ram();
        let blob = store.finish().unwrap();
        assert!(blob.is_empty());
    }
}
