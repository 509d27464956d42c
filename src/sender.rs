//! # Sender Pipeline
//!
//! Drives `offer-batch` → per-file `file-start`/pump/`file-end` against the
//! control rendezvous table, following the teacher's
//! `EventLoopState::pending_queries` pattern: a one-shot channel per
//! in-flight request, resolved by whichever task is demuxing inbound
//! control messages and handed to this pipeline as sender-bound.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::framing::{encode_binary_frame, encode_control, ControlMessage};
use crate::network::transport::{ChannelMessage, DataChannel};
use crate::types::{BatchMeta, FileMeta, TransferId};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::time::timeout;

const BACKPRESSURE_POLL: Duration = Duration::from_millis(5);

/// A file queued for one `send_files` call. The sender reads it off a
/// blocking task, never on the async runtime's worker threads.
pub struct OutgoingFile {
    pub path: PathBuf,
    pub name: String,
    pub mime: String,
}

struct Rendezvous {
    accept_batch: Mutex<Option<oneshot::Sender<()>>>,
    ready_for_file: Mutex<HashMap<u32, oneshot::Sender<()>>>,
    ack_file: Mutex<HashMap<u32, oneshot::Sender<()>>>,
}

pub struct SenderPipeline {
    control: Arc<dyn DataChannel>,
    data: Arc<dyn DataChannel>,
    config: EngineConfig,
    events: broadcast::Sender<EngineEvent>,
    rendezvous: Arc<Rendezvous>,
    transfer_seq: AtomicU64,
}

impl SenderPipeline {
    /// `control_in` delivers sender-bound control messages (`accept-batch`,
    /// `ready-for-file`, `ack-file`) already decoded and demultiplexed by
    /// the caller's control-message router.
    pub fn new(
        control: Arc<dyn DataChannel>,
        data: Arc<dyn DataChannel>,
        config: EngineConfig,
        events: broadcast::Sender<EngineEvent>,
        mut control_in: mpsc::UnboundedReceiver<ControlMessage>,
    ) -> Self {
        let rendezvous = Arc::new(Rendezvous {
            accept_batch: Mutex::new(None),
            ready_for_file: Mutex::new(HashMap::new()),
            ack_file: Mutex::new(HashMap::new()),
        });

        let router = rendezvous.clone();
        tokio::spawn(async move {
            while let Some(msg) = control_in.recv().await {
                match msg {
                    ControlMessage::AcceptBatch => {
                        if let Some(tx) = router.accept_batch.lock().await.take() {
                            let _ = tx.send(());
                        }
                    }
                    ControlMessage::ReadyForFile { file_index } => {
                        if let Some(tx) = router.ready_for_file.lock().await.remove(&file_index) {
                            let _ = tx.send(());
                        }
                    }
                    ControlMessage::AckFile { file_index } => {
                        if let Some(tx) = router.ack_file.lock().await.remove(&file_index) {
                            let _ = tx.send(());
                        }
                    }
                    _ => {}
                }
            }
            // The control stream closed: drop every pending rendezvous so
            // awaiters see a transport-closed error instead of hanging.
            router.accept_batch.lock().await.take();
            router.ready_for_file.lock().await.clear();
            router.ack_file.lock().await.clear();
        });

        Self { control, data, config, events, rendezvous, transfer_seq: AtomicU64::new(0) }
    }

    /// Completes once every file has been acknowledged, or fails if the
    /// transport closes. A read error on one file skips that file via a
    /// synthetic `file-end` and the batch continues.
    pub async fn send_files(&self, files: Vec<OutgoingFile>) -> Result<()> {
        let transfer_id = TransferId::next(&self.transfer_seq);
        let mut sizes = Vec::with_capacity(files.len());
        for file in &files {
            sizes.push(tokio::fs::metadata(&file.path).await?.len());
        }
        let total_size: u64 = sizes.iter().sum();
        let total_files = files.len() as u32;
        tracing::info!(%transfer_id, total_files, total_size, "offering batch");

        let (tx, rx) = oneshot::channel();
        *self.rendezvous.accept_batch.lock().await = Some(tx);
        self.send_control(ControlMessage::OfferBatch { meta: BatchMeta { total_files, total_size } }).await?;
        rx.await.map_err(|_| Error::TransportClosed("control channel closed awaiting accept-batch".into()))?;

        for (index, (file, size)) in files.iter().zip(sizes.iter()).enumerate() {
            let file_index = index as u32;
            match self.send_one_file(file_index, file, *size).await {
                Ok(()) => {}
                Err(Error::TransportClosed(reason)) => return Err(Error::TransportClosed(reason)),
                Err(err) => {
                    tracing::warn!(%transfer_id, file = %file.name, %err, "skipping file after read error");
                    let _ = self.send_control(ControlMessage::FileEnd { file_index }).await;
                }
            }
        }

        tracing::info!(%transfer_id, "batch complete");
        let _ = self.events.send(EngineEvent::Progress {
            transferred_bytes: total_size,
            total_size,
            completed_files: total_files,
            total_files,
            speed_bps: 0.0,
            eta_label: "done".into(),
            is_complete: true,
        });
        Ok(())
    }

    async fn send_one_file(&self, file_index: u32, file: &OutgoingFile, size: u64) -> Result<()> {
        let total_chunks = chunk_count(size, self.config.chunk_size);
        let meta = FileMeta { name: file.name.clone(), size, mime: file.mime.clone(), total_chunks, file_index };

        let (ready_tx, ready_rx) = oneshot::channel();
        self.rendezvous.ready_for_file.lock().await.insert(file_index, ready_tx);
        self.send_control(ControlMessage::FileStart { meta }).await?;
        ready_rx.await.map_err(|_| Error::TransportClosed("control channel closed awaiting ready-for-file".into()))?;

        let path = file.path.clone();
        let chunk_size = self.config.chunk_size;
        let (chunk_tx, mut chunk_rx) = mpsc::channel(self.config.max_inflight_reads);
        tokio::task::spawn_blocking(move || read_chunks(path, chunk_size, chunk_tx));

        while let Some(item) = chunk_rx.recv().await {
            let chunk = item?;
            self.wait_for_buffer_room().await;
            self.data.send(ChannelMessage::Binary(encode_binary_frame(file_index, &chunk))).await?;
        }

        while self.data.buffered_amount() > 0 {
            tokio::time::sleep(BACKPRESSURE_POLL).await;
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.rendezvous.ack_file.lock().await.insert(file_index, ack_tx);
        self.send_control(ControlMessage::FileEnd { file_index }).await?;
        match timeout(self.config.ack_timeout, ack_rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::TransportClosed("control channel closed awaiting ack-file".into())),
            Err(_) => {
                tracing::warn!(file_index, "ack-file timed out, proceeding to cleanup");
                Ok(())
            }
        }
    }

    /// Pauses the pump once `buffered_amount()` reaches the ceiling, then
    /// waits for it to drain all the way down to `low_water_mark` before
    /// resuming — this hysteresis is what keeps the sender from trading one
    /// wait per chunk right at the ceiling.
    async fn wait_for_buffer_room(&self) {
        if self.data.buffered_amount() < self.config.max_buffered_amount {
            return;
        }
        while self.data.buffered_amount() > self.config.low_water_mark {
            tokio::time::sleep(BACKPRESSURE_POLL).await;
        }
    }

    async fn send_control(&self, msg: ControlMessage) -> Result<()> {
        let text = encode_control(&msg)?;
        self.control.send(ChannelMessage::Text(text)).await
    }
}

fn chunk_count(size: u64, chunk_size: usize) -> u32 {
    if size == 0 {
        0
    } else {
        ((size + chunk_size as u64 - 1) / chunk_size as u64) as u32
    }
}

fn read_chunks(path: PathBuf, chunk_size: usize, tx: mpsc::Sender<Result<Bytes>>) {
    use std::io::Read;
    let mut file = match std::fs::File::open(&path) {
        Ok(f) => f,
        Err(err) => {
            let _ = tx.blocking_send(Err(Error::Io(err)));
            return;
        }
    };
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = tx.blocking_send(Err(Error::Io(err)));
                break;
            }
        }
    }
}
