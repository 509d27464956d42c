//! # Receiver Pipeline
//!
//! Owns reassembly for one peer's `send_files` batch: a control-message loop
//! that builds and tears down [`ChunkStore`]s, and a data-channel loop that
//! routes binary frames to the right store by `file_index`. The receiver is
//! progress authoritative, so its `ProgressSync` frames are what the other
//! side's UI ultimately renders.
//!
//! Inbound control messages arrive pre-decoded and demultiplexed (see
//! `spawn_control_demux` in the crate root) rather than read directly off
//! the control channel, since the sender pipeline needs a turn at the same
//! stream when this peer is also sending.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::EngineEvent;
use crate::framing::{decode_binary_frame, encode_control, ControlMessage};
use crate::monitor::TransferMonitor;
use crate::network::transport::{ChannelMessage, DataChannel};
use crate::storage::ChunkStore;
use crate::time::now_timestamp_millis;
use crate::types::{BatchState, FileMeta};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

struct ReceivingFile {
    meta: FileMeta,
    /// `None` once a recoverable storage error has marked this file failed;
    /// frames for it are silently discarded but the batch protocol still
    /// acks it so the sender doesn't stall waiting on a file that will
    /// never arrive.
    store: Option<ChunkStore>,
    next_chunk_index: u32,
}

pub struct ReceiverPipeline {
    control: Arc<dyn DataChannel>,
    data: Arc<dyn DataChannel>,
    config: EngineConfig,
    events: broadcast::Sender<EngineEvent>,
    instance_id: u64,
}

impl ReceiverPipeline {
    pub fn new(
        control: Arc<dyn DataChannel>,
        data: Arc<dyn DataChannel>,
        config: EngineConfig,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        // Spill-tier backing files are named from this id plus the file
        // index; a random instance id keeps two receiver sessions (two
        // concurrent transfers, or two tests) from colliding on the same
        // temp path when both happen to receive a "file 0".
        let instance_id = rand::random();
        Self { control, data, config, events, instance_id }
    }

    /// Runs until the batch completes or a transport closes. One call
    /// handles exactly one `offer-batch` through its terminal `file-end`.
    pub async fn run(&self, mut control_in: mpsc::UnboundedReceiver<ControlMessage>) -> Result<()> {
        let mut files: HashMap<u32, ReceivingFile> = HashMap::new();
        let mut batch = BatchState::default();
        let mut monitor = TransferMonitor::default();
        let mut last_sync_millis = 0i64;

        loop {
            tokio::select! {
                msg = control_in.recv() => {
                    match msg {
                        None => return Err(Error::TransportClosed("control channel closed during receive".into())),
                        Some(msg) => {
                            if self.handle_control(msg, &mut files, &mut batch, &mut monitor).await? {
                                return Ok(());
                            }
                        }
                    }
                }
                msg = self.data.recv() => {
                    match msg {
                        None => return Err(Error::TransportClosed("data channel closed during receive".into())),
                        Some(ChannelMessage::Text(_)) => {
                            tracing::warn!("dropping text frame received on the data channel");
                        }
                        Some(ChannelMessage::Binary(frame)) => {
                            self.handle_frame(&frame, &mut files, &mut batch, &mut monitor, &mut last_sync_millis).await?;
                        }
                    }
                }
            }
        }
    }

    /// Returns `true` once the batch has reached its terminal `file-end`.
    async fn handle_control(
        &self,
        msg: ControlMessage,
        files: &mut HashMap<u32, ReceivingFile>,
        batch: &mut BatchState,
        monitor: &mut TransferMonitor,
    ) -> Result<bool> {
        match msg {
            ControlMessage::OfferBatch { meta } => {
                files.clear();
                batch.reset(meta, crate::time::now_timestamp());
                monitor.reset(meta.total_size, now_timestamp_millis());
                self.send_control(ControlMessage::AcceptBatch).await?;
            }
            ControlMessage::FileStart { meta } => {
                let store_id = format!("{}-{}", self.instance_id, meta.file_index);
                let store = match ChunkStore::new(meta.size, &store_id, &self.config) {
                    Ok(store) => Some(store),
                    Err(err) if err.is_recoverable() => {
                        tracing::warn!(file_index = meta.file_index, %err, "failed to open chunk store for file, skipping it");
                        None
                    }
                    Err(err) => return Err(err),
                };
                batch.current_file_name = Some(meta.name.clone());
                let file_index = meta.file_index;
                files.insert(file_index, ReceivingFile { meta, store, next_chunk_index: 0 });
                self.emit_progress(batch, monitor, false);
                self.send_control(ControlMessage::ReadyForFile { file_index }).await?;
            }
            ControlMessage::FileEnd { file_index } => {
                let Some(mut receiving) = files.remove(&file_index) else {
                    tracing::warn!(file_index, "file-end for a file that was never started, dropping");
                    return Ok(false);
                };
                match receiving.store.as_mut() {
                    Some(store) => match store.finish() {
                        Ok(blob) => {
                            let _ = self.events.send(EngineEvent::FileReceived { meta: receiving.meta, blob });
                        }
                        Err(err) if err.is_recoverable() => {
                            tracing::warn!(file_index, %err, "failed to finish chunk store, skipping file");
                        }
                        Err(err) => return Err(err),
                    },
                    None => {
                        tracing::warn!(file_index, "file previously marked failed, skipping reassembly");
                    }
                }
                batch.completed_files += 1;
                self.send_control(ControlMessage::AckFile { file_index }).await?;
                if batch.is_complete() {
                    self.emit_progress(batch, monitor, true);
                    return Ok(true);
                }
            }
            ControlMessage::AcceptBatch
            | ControlMessage::ReadyForFile { .. }
            | ControlMessage::AckFile { .. }
            | ControlMessage::ProgressSync { .. } => {
                // Sender-bound messages; the demux should never route these here.
            }
        }
        Ok(false)
    }

    async fn handle_frame(
        &self,
        frame: &[u8],
        files: &mut HashMap<u32, ReceivingFile>,
        batch: &mut BatchState,
        monitor: &mut TransferMonitor,
        last_sync_millis: &mut i64,
    ) -> Result<()> {
        let (file_index, payload) = match decode_binary_frame(frame) {
            Ok(parsed) => parsed,
            Err(err) => {
                tracing::warn!(%err, "dropping malformed binary frame");
                return Ok(());
            }
        };
        let Some(receiving) = files.get_mut(&file_index) else {
            tracing::warn!(file_index, "dropping frame for a file with no open file-start");
            return Ok(());
        };
        let chunk_index = receiving.next_chunk_index;
        receiving.next_chunk_index += 1;
        if let Some(store) = receiving.store.as_mut() {
            match store.add(chunk_index, bytes::Bytes::copy_from_slice(payload)) {
                Ok(()) => {}
                Err(err) if err.is_recoverable() => {
                    tracing::warn!(file_index, %err, "failed to write chunk, marking file failed");
                    receiving.store = None;
                }
                Err(err) => return Err(err),
            }
        }

        batch.transferred_bytes += payload.len() as u64;
        let now_ms = now_timestamp_millis();
        monitor.update(payload.len() as u64, now_ms);

        if now_ms - *last_sync_millis >= self.config.sync_interval.as_millis() as i64 {
            *last_sync_millis = now_ms;
            self.emit_progress(batch, monitor, false);
            let metrics = monitor.metrics();
            let _ = self
                .send_control(ControlMessage::ProgressSync {
                    transferred_bytes: metrics.transferred_bytes,
                    speed: metrics.speed_bps,
                    eta: metrics.eta_label,
                    completed_files: batch.completed_files,
                    total_files: batch.total_files,
                })
                .await;
        }
        Ok(())
    }

    fn emit_progress(&self, batch: &BatchState, monitor: &TransferMonitor, is_complete: bool) {
        let metrics = monitor.metrics();
        let _ = self.events.send(EngineEvent::Progress {
            transferred_bytes: batch.transferred_bytes,
            total_size: batch.total_size,
            completed_files: batch.completed_files,
            total_files: batch.total_files,
            speed_bps: metrics.speed_bps,
            eta_label: metrics.eta_label,
            is_complete,
        });
    }

    async fn send_control(&self, msg: ControlMessage) -> Result<()> {
        let text = encode_control(&msg)?;
        self.control.send(ChannelMessage::Text(text)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{decode_control, encode_binary_frame};
    use crate::network::transport::fakes::fake_channel_pair;
    use crate::types::{BatchMeta, FileMeta};

    #[tokio::test]
    async fn receives_a_single_small_file_end_to_end() {
        let (control_a, control_b) = fake_channel_pair();
        let (data_a, data_b) = fake_channel_pair();
        let (events_tx, mut events_rx) = broadcast::channel(32);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let receiver = ReceiverPipeline::new(Arc::new(control_a), Arc::new(data_a), EngineConfig::default(), events_tx);
        let run = tokio::spawn(async move { receiver.run(control_rx).await });

        control_tx.send(ControlMessage::OfferBatch { meta: BatchMeta { total_files: 1, total_size: 5 } }).unwrap();
        assert_accept_batch(&control_b).await;

        let meta = FileMeta { name: "hi.txt".into(), size: 5, mime: "text/plain".into(), total_chunks: 1, file_index: 0 };
        control_tx.send(ControlMessage::FileStart { meta: meta.clone() }).unwrap();
        assert_ready_for_file(&control_b, 0).await;

        data_b.send(ChannelMessage::Binary(encode_binary_frame(0, b"hello"))).await.unwrap();

        control_tx.send(ControlMessage::FileEnd { file_index: 0 }).unwrap();
        assert_ack_file(&control_b, 0).await;

        run.await.unwrap().unwrap();

        let mut saw_file_received = false;
        let mut saw_terminal_progress = false;
        while let Ok(event) = events_rx.try_recv() {
            match event {
                EngineEvent::FileReceived { meta, blob } => {
                    assert_eq!(meta.name, "hi.txt");
                    assert_eq!(&blob[..], b"hello");
                    saw_file_received = true;
                }
                EngineEvent::Progress { is_complete: true, completed_files: 1, total_files: 1, .. } => {
                    saw_terminal_progress = true;
                }
                _ => {}
            }
        }
        assert!(saw_file_received);
        assert!(saw_terminal_progress);
    }

    #[tokio::test]
    async fn frames_before_file_start_are_dropped_not_fatal() {
        let (control_a, control_b) = fake_channel_pair();
        let (data_a, data_b) = fake_channel_pair();
        let (events_tx, _events_rx) = broadcast::channel(32);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let receiver = ReceiverPipeline::new(Arc::new(control_a), Arc::new(data_a), EngineConfig::default(), events_tx);
        let run = tokio::spawn(async move { receiver.run(control_rx).await });

        // A stray frame with no matching file-start should be dropped, not
        // abort the session; the batch proceeds normally afterwards.
        data_b.send(ChannelMessage::Binary(encode_binary_frame(9, b"stray"))).await.unwrap();

        control_tx.send(ControlMessage::OfferBatch { meta: BatchMeta { total_files: 1, total_size: 0 } }).unwrap();
        assert_accept_batch(&control_b).await;

        let meta = FileMeta { name: "empty.bin".into(), size: 0, mime: "application/octet-stream".into(), total_chunks: 0, file_index: 0 };
        control_tx.send(ControlMessage::FileStart { meta }).unwrap();
        assert_ready_for_file(&control_b, 0).await;

        control_tx.send(ControlMessage::FileEnd { file_index: 0 }).unwrap();
        assert_ack_file(&control_b, 0).await;

        run.await.unwrap().unwrap();
    }

    async fn assert_accept_batch(control_b: &crate::network::transport::fakes::FakeDataChannel) {
        let ChannelMessage::Text(text) = control_b.recv().await.unwrap() else { panic!("expected text") };
        assert_eq!(decode_control(&text).unwrap(), Some(ControlMessage::AcceptBatch));
    }

    async fn assert_ready_for_file(control_b: &crate::network::transport::fakes::FakeDataChannel, file_index: u32) {
        let ChannelMessage::Text(text) = control_b.recv().await.unwrap() else { panic!("expected text") };
        assert_eq!(decode_control(&text).unwrap(), Some(ControlMessage::ReadyForFile { file_index }));
    }

    async fn assert_ack_file(control_b: &crate::network::transport::fakes::FakeDataChannel, file_index: u32) {
        let ChannelMessage::Text(text) = control_b.recv().await.unwrap() else { panic!("expected text") };
        assert_eq!(decode_control(&text).unwrap(), Some(ControlMessage::AckFile { file_index }));
    }

    /// A file forced onto a spill tier whose backing directory doesn't exist
    /// fails to open its chunk store, but the batch still completes and the
    /// other (RAM-tier) file in the same batch is reassembled normally.
    #[tokio::test]
    async fn a_spill_tier_failure_skips_its_file_but_the_batch_continues() {
        let (control_a, control_b) = fake_channel_pair();
        let (data_a, data_b) = fake_channel_pair();
        let (events_tx, mut events_rx) = broadcast::channel(32);
        let (control_tx, control_rx) = mpsc::unbounded_channel();

        let config = EngineConfig {
            ram_threshold: 10,
            spill_dir: std::path::PathBuf::from("/nonexistent/transit-spill-test-dir"),
            ..EngineConfig::default()
        };
        let receiver = ReceiverPipeline::new(Arc::new(control_a), Arc::new(data_a), config, events_tx);
        let run = tokio::spawn(async move { receiver.run(control_rx).await });

        control_tx.send(ControlMessage::OfferBatch { meta: BatchMeta { total_files: 2, total_size: 10 } }).unwrap();
        assert_accept_batch(&control_b).await;

        // File 0 is small enough for the RAM tier and should survive.
        let ok_meta = FileMeta { name: "ok.txt".into(), size: 5, mime: "text/plain".into(), total_chunks: 1, file_index: 0 };
        control_tx.send(ControlMessage::FileStart { meta: ok_meta.clone() }).unwrap();
        assert_ready_for_file(&control_b, 0).await;
        data_b.send(ChannelMessage::Binary(encode_binary_frame(0, b"hello"))).await.unwrap();
        control_tx.send(ControlMessage::FileEnd { file_index: 0 }).unwrap();
        assert_ack_file(&control_b, 0).await;

        // File 1 exceeds ram_threshold, forcing the spill tier, whose
        // backing directory doesn't exist — a recoverable storage failure.
        let failing_meta = FileMeta { name: "big.bin".into(), size: 20, mime: "application/octet-stream".into(), total_chunks: 1, file_index: 1 };
        control_tx.send(ControlMessage::FileStart { meta: failing_meta }).unwrap();
        assert_ready_for_file(&control_b, 1).await;
        data_b.send(ChannelMessage::Binary(encode_binary_frame(1, b"irrelevant-payload"))).await.unwrap();
        control_tx.send(ControlMessage::FileEnd { file_index: 1 }).unwrap();
        assert_ack_file(&control_b, 1).await;

        run.await.unwrap().unwrap();

        let mut received_names = Vec::new();
        while let Ok(event) = events_rx.try_recv() {
            if let EngineEvent::FileReceived { meta, .. } = event {
                received_names.push(meta.name);
            }
        }
        assert_eq!(received_names, vec!["ok.txt".to_string()]);
    }
}
