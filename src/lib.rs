//! # Transit Core
//!
//! A peer-to-peer file transfer engine: binary framing, a tiered chunk
//! store, an EMA-smoothed transfer monitor, sender/receiver pipelines, and
//! a session coordinator that negotiates a direct peer connection over a
//! signaling transport.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         TRANSIT CORE MODULES                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐   ┌─────────────┐ │
//! │  │  Signaling  │──►│ Coordinator │◄─►│   Framing   │◄─►│ Chunk Store │ │
//! │  │ (room code, │   │ (state      │   │ (binary +   │   │ (RAM/spill  │ │
//! │  │  offer/ans) │   │  machine)   │   │  control)   │   │  tiering)   │ │
//! │  └─────────────┘   └──────┬──────┘   └──────┬──────┘   └──────┬──────┘ │
//! │                           │                 │                 │        │
//! │                           ▼                 ▼                 ▼        │
//! │                    ┌─────────────┐   ┌─────────────┐   ┌─────────────┐ │
//! │                    │   Sender    │   │  Receiver   │   │   Monitor   │ │
//! │                    │  Pipeline   │   │  Pipeline   │   │ (EMA speed, │ │
//! │                    │             │   │             │   │  ETA)       │ │
//! │                    └─────────────┘   └─────────────┘   └─────────────┘ │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Hierarchy
//!
//! - [`error`] - Error types for the entire crate
//! - [`config`] - Tunable constants (`EngineConfig`)
//! - [`types`] - Shared data model (`FileMeta`, `BatchMeta`, `ConnectionState`, ...)
//! - [`framing`] - Binary frame + control envelope codec
//! - [`storage`] - Tiered chunk store (RAM / spill)
//! - [`monitor`] - EMA-smoothed throughput and ETA
//! - [`network`] - Signaling, role election, and the session coordinator
//! - [`sender`] - Outbound batch pipeline
//! - [`receiver`] - Inbound batch pipeline
//! - [`events`] - The outbound `EngineEvent` stream
//!
//! ## Non-goals
//!
//! Resumable transfers across session loss, encryption beyond what the
//! transport provides, authenticated identity beyond the room code, NAT
//! traversal, and multi-peer sessions are all out of scope; see `DESIGN.md`.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod error;
pub mod events;
pub mod framing;
pub mod monitor;
pub mod network;
pub mod receiver;
pub mod sender;
pub mod storage;
/// Small time helpers shared by the monitor and coordinator.
pub mod time;
pub mod types;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use events::EngineEvent;
pub use network::{CoordinatorHandle, PeerConnectionFactory};
pub use receiver::ReceiverPipeline;
pub use sender::{OutgoingFile, SenderPipeline};
pub use types::ConnectionState;

use framing::{decode_control, ControlMessage};
use network::transport::{ChannelMessage, DataChannel, SignalingTransport};
use std::sync::Arc;
use tokio::sync::mpsc;

/// The engine facade: wires a [`CoordinatorHandle`] to the sender and
/// receiver pipelines, demultiplexing the control channel between them once
/// a peer connection opens.
///
/// Construct one per session. There is no global instance — tests and
/// multi-session hosts each get their own, with their own injected
/// [`SignalingTransport`] and [`network::PeerConnectionFactory`].
pub struct Engine {
    coordinator: CoordinatorHandle,
    config: EngineConfig,
}

impl Engine {
    /// `my_id` is this peer's locally-generated id used for role election
    /// (see [`network::elect_role`]); it has no relation to any persistent
    /// identity and is regenerated per session by the host application.
    pub fn new(
        my_id: impl Into<String>,
        signaling: Arc<dyn SignalingTransport>,
        connection_factory: PeerConnectionFactory,
        config: EngineConfig,
    ) -> Self {
        let coordinator = network::spawn(my_id, signaling, connection_factory);
        Self { coordinator, config }
    }

    /// Begin the signaling handshake for `room_code`.
    pub async fn init(&self, room_code: impl Into<String>) {
        self.coordinator.init(room_code).await;
    }

    /// Tear the session down and return to `Idle`.
    pub async fn cleanup(&self) {
        self.coordinator.cleanup().await;
    }

    /// Subscribe to state changes, progress, received files, and log lines.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.coordinator.subscribe()
    }

    /// The session's current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.coordinator.state().await
    }

    /// Waits for the peer connection to open, then sends `files` as one
    /// batch. Only one `send_files`/`receive_batch` call should be in
    /// flight at a time per session; the protocol has no concept of
    /// concurrent batches.
    pub async fn send_files(&self, files: Vec<OutgoingFile>) -> Result<()> {
        let (control, data) = self.wait_for_channels().await?;
        let (sender_tx, sender_rx) = mpsc::unbounded_channel();
        spawn_control_demux(control.clone(), Some(sender_tx), None);
        let pipeline =
            SenderPipeline::new(control, data, self.config.clone(), self.coordinator.events(), sender_rx);
        pipeline.send_files(files).await
    }

    /// Waits for the peer connection to open, then runs the receiver
    /// pipeline for exactly one batch.
    pub async fn receive_batch(&self) -> Result<()> {
        let (control, data) = self.wait_for_channels().await?;
        let (receiver_tx, receiver_rx) = mpsc::unbounded_channel();
        spawn_control_demux(control.clone(), None, Some(receiver_tx));
        let pipeline = ReceiverPipeline::new(control, data, self.config.clone(), self.coordinator.events());
        pipeline.run(receiver_rx).await
    }

    async fn wait_for_channels(&self) -> Result<(Arc<dyn DataChannel>, Arc<dyn DataChannel>)> {
        if self.coordinator.state().await == ConnectionState::Connected {
            if let Some(channels) = self.coordinator.channels().await {
                return Ok(channels);
            }
        }
        let mut events = self.coordinator.subscribe();
        loop {
            match events.recv().await {
                Ok(EngineEvent::StateChanged(ConnectionState::Connected)) => {
                    if let Some(channels) = self.coordinator.channels().await {
                        return Ok(channels);
                    }
                }
                Ok(EngineEvent::StateChanged(ConnectionState::Failed)) => {
                    return Err(Error::SignalingFailure("peer connection failed before opening".into()));
                }
                Ok(_) => continue,
                Err(_) => return Err(Error::TransportClosed("event stream closed while awaiting connection".into())),
            }
        }
    }
}

/// Reads the control channel, decodes each frame, and routes it to whichever
/// of the sender/receiver pipelines owns that message direction. This is the
/// single reader of the control channel for a session: the pipelines never
/// call `DataChannel::recv()` on it themselves, since two concurrent readers
/// would race over which message each one sees.
fn spawn_control_demux(
    control: Arc<dyn DataChannel>,
    sender_tx: Option<mpsc::UnboundedSender<ControlMessage>>,
    receiver_tx: Option<mpsc::UnboundedSender<ControlMessage>>,
) {
    tokio::spawn(async move {
        loop {
            match control.recv().await {
                None => break,
                Some(ChannelMessage::Binary(_)) => {
                    tracing::warn!("dropping binary frame received on the control channel");
                }
                Some(ChannelMessage::Text(text)) => {
                    let msg = match decode_control(&text) {
                        Ok(Some(msg)) => msg,
                        Ok(None) => continue,
                        Err(err) => {
                            tracing::warn!(%err, "dropping unparseable control frame");
                            continue;
                        }
                    };
                    match &msg {
                        ControlMessage::AcceptBatch
                        | ControlMessage::ReadyForFile { .. }
                        | ControlMessage::AckFile { .. }
                        | ControlMessage::ProgressSync { .. } => {
                            if let Some(tx) = &sender_tx {
                                let _ = tx.send(msg);
                            }
                        }
                        ControlMessage::OfferBatch { .. } | ControlMessage::FileStart { .. } | ControlMessage::FileEnd { .. } => {
                            if let Some(tx) = &receiver_tx {
                                let _ = tx.send(msg);
                            }
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use network::transport::fakes::{fake_channel_pair, fake_signaling_pair, FakePeerConnection};
    use network::PeerConnection;

    fn factory() -> PeerConnectionFactory {
        Arc::new(|| {
            let (control, control_peer) = fake_channel_pair();
            let (data, data_peer) = fake_channel_pair();
            // Keep the peer halves alive for the test's duration; dropping them
            // would immediately satisfy `closed()` and surface as a disconnect.
            Box::leak(Box::new((control_peer, data_peer)));
            Arc::new(FakePeerConnection::new(control, data)) as Arc<dyn PeerConnection>
        })
    }

    #[tokio::test]
    async fn engine_reaches_connected_after_init() {
        let (sig_a, sig_b) = fake_signaling_pair();
        let a = Engine::new("zeta", Arc::new(sig_a), factory(), EngineConfig::default());
        let b = Engine::new("alpha", Arc::new(sig_b), factory(), EngineConfig::default());
        a.init("123456").await;
        b.init("123456").await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(a.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn cleanup_returns_an_unjoined_session_to_idle() {
        let (sig_a, _sig_b) = fake_signaling_pair();
        let engine = Engine::new("solo", Arc::new(sig_a), factory(), EngineConfig::default());
        engine.init("123456").await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(engine.state().await, ConnectionState::Signaling);
        engine.cleanup().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(engine.state().await, ConnectionState::Idle);
    }

    /// Two real `Engine`s, joined through the full coordinator negotiation,
    /// complete one `send_files`/`receive_batch` exchange over a shared pair
    /// of fake channels wired up behind their respective factories.
    #[tokio::test]
    async fn two_engines_complete_a_real_file_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greeting.txt");
        std::fs::write(&path, b"hello, peer").unwrap();

        let (sig_a, sig_b) = fake_signaling_pair();
        let (control_a, control_b) = fake_channel_pair();
        let (data_a, data_b) = fake_channel_pair();

        let factory_a = single_use_factory(control_a, data_a);
        let factory_b = single_use_factory(control_b, data_b);

        let sender_engine = Engine::new("zeta", Arc::new(sig_a), factory_a, EngineConfig::default());
        let receiver_engine = Engine::new("alpha", Arc::new(sig_b), factory_b, EngineConfig::default());

        sender_engine.init("123456").await;
        receiver_engine.init("123456").await;

        let mut events_rx = receiver_engine.subscribe();
        let recv_task = tokio::spawn(async move { receiver_engine.receive_batch().await });

        sender_engine
            .send_files(vec![OutgoingFile { path, name: "greeting.txt".into(), mime: "text/plain".into() }])
            .await
            .unwrap();
        recv_task.await.unwrap().unwrap();

        let mut saw_file = false;
        while let Ok(event) = events_rx.try_recv() {
            if let EngineEvent::FileReceived { blob, .. } = event {
                assert_eq!(&blob[..], b"hello, peer");
                saw_file = true;
            }
        }
        assert!(saw_file);
    }

    /// A `PeerConnectionFactory` that hands out one pre-wired fake channel
    /// pair and panics if the coordinator ever calls it a second time —
    /// `ensure_peer_connection` caches its result, so a second call would
    /// mean a negotiation bug.
    fn single_use_factory(
        control: crate::network::transport::fakes::FakeDataChannel,
        data: crate::network::transport::fakes::FakeDataChannel,
    ) -> PeerConnectionFactory {
        let channels = std::sync::Mutex::new(Some((control, data)));
        Arc::new(move || {
            let (control, data) = channels.lock().unwrap().take().expect("connection factory called twice");
            Arc::new(FakePeerConnection::new(control, data)) as Arc<dyn PeerConnection>
        })
    }
}
