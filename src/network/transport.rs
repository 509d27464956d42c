//! # Transport Abstractions
//!
//! The Session Coordinator and the Sender/Receiver pipelines are generic
//! over two small traits rather than over a concrete WebRTC stack, so the
//! engine can be driven by any collaborator that can move signaling
//! envelopes and raw frames between two peers. A host embedding this crate
//! supplies the concrete implementations (a real data channel, a relay
//! socket); tests use the in-memory fakes below.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// A message sent or received on the data channel. WebRTC data channels
/// distinguish text frames (used for [`crate::framing::ControlMessage`])
/// from binary frames (used for chunk payloads); this enum preserves that
/// distinction across the trait boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

/// The peer-to-peer data channel: chunk payloads and control messages
/// multiplexed over one ordered, reliable stream (per Layout A).
#[async_trait]
pub trait DataChannel: Send + Sync {
    async fn send(&self, message: ChannelMessage) -> Result<()>;

    /// Bytes queued for send but not yet flushed to the wire. The sender
    /// pipeline polls this to implement backpressure.
    fn buffered_amount(&self) -> usize;

    /// Receive the next inbound message, or `None` once the channel has
    /// closed.
    async fn recv(&self) -> Option<ChannelMessage>;

    /// Resolves once the channel has closed. Implementations that never
    /// close on their own (or can't detect it) may leave this pending
    /// forever; the default never resolves.
    async fn closed(&self) {
        std::future::pending::<()>().await;
    }
}

/// The out-of-band signaling transport used to exchange SDP offers,
/// answers, and ICE candidates before the data channel exists.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn send(&self, envelope: super::signaling::SignalingEnvelope) -> Result<()>;

    async fn recv(&self) -> Option<super::signaling::SignalingEnvelope>;
}

/// The host-supplied peer connection: everything WebRTC/NAT-traversal
/// specific that this crate treats as a transport concern (non-goal) and
/// never implements itself. The Session Coordinator drives this trait with
/// the opaque SDP/ICE strings carried in [`super::signaling::SignalingEnvelope`]
/// and receives the two logical channels once negotiation completes.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Offerer side: produce a local SDP offer.
    async fn create_offer(&self) -> Result<String>;

    /// Answerer side: accept the remote offer and produce a local answer.
    async fn create_answer(&self, remote_offer: &str) -> Result<String>;

    /// Offerer side: accept the remote answer.
    async fn set_remote_answer(&self, answer: &str) -> Result<()>;

    /// Add a remote ICE candidate. Callers queue candidates that arrive
    /// before the remote description is set; see [`super::coordinator`].
    async fn add_ice_candidate(&self, candidate: &str) -> Result<()>;

    /// Resolves once both the `control` and `data` channels report open.
    async fn wait_until_open(&self) -> Result<()>;

    fn control_channel(&self) -> std::sync::Arc<dyn DataChannel>;

    fn data_channel(&self) -> std::sync::Arc<dyn DataChannel>;

    /// Resolves once either logical channel closes. The Session Coordinator
    /// watches this after reaching `connected` to detect a disconnect.
    async fn closed(&self) {
        let control = self.control_channel();
        let data = self.data_channel();
        tokio::select! {
            _ = control.closed() => {}
            _ = data.closed() => {}
        }
    }
}

/// In-memory fakes for driving the coordinator and pipelines without a real
/// WebRTC stack. Available to this crate's own `#[cfg(test)]` modules, and
/// to out-of-crate integration tests under `tests/` via the `test-util`
/// feature.
#[cfg(any(test, feature = "test-util"))]
pub mod fakes {
    use super::*;
    use crate::network::signaling::SignalingEnvelope;
    use tokio::sync::Mutex;
    use std::collections::VecDeque;

    /// An in-memory `DataChannel` backed by a paired queue. Construct with
    /// [`fake_channel_pair`] to get two ends that talk to each other.
    pub struct FakeDataChannel {
        outbox: tokio::sync::mpsc::UnboundedSender<ChannelMessage>,
        inbox: Mutex<tokio::sync::mpsc::UnboundedReceiver<ChannelMessage>>,
        buffered: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl DataChannel for FakeDataChannel {
        async fn send(&self, message: ChannelMessage) -> Result<()> {
            let len = match &message {
                ChannelMessage::Text(s) => s.len(),
                ChannelMessage::Binary(b) => b.len(),
            };
            self.buffered.fetch_add(len, std::sync::atomic::Ordering::SeqCst);
            let _ = self.outbox.send(message);
            self.buffered.fetch_sub(len, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn buffered_amount(&self) -> usize {
            self.buffered.load(std::sync::atomic::Ordering::SeqCst)
        }

        async fn recv(&self) -> Option<ChannelMessage> {
            self.inbox.lock().await.recv().await
        }

        async fn closed(&self) {
            self.outbox.closed().await;
        }
    }

    pub fn fake_channel_pair() -> (FakeDataChannel, FakeDataChannel) {
        let (tx_a, rx_a) = tokio::sync::mpsc::unbounded_channel();
        let (tx_b, rx_b) = tokio::sync::mpsc::unbounded_channel();
        (
            FakeDataChannel { outbox: tx_b, inbox: Mutex::new(rx_a), buffered: Default::default() },
            FakeDataChannel { outbox: tx_a, inbox: Mutex::new(rx_b), buffered: Default::default() },
        )
    }

    /// An in-memory `SignalingTransport` sharing a queue with a counterpart.
    pub struct FakeSignalingTransport {
        outbox: tokio::sync::mpsc::UnboundedSender<SignalingEnvelope>,
        inbox: Mutex<VecDeque<SignalingEnvelope>>,
        inbox_rx: Mutex<tokio::sync::mpsc::UnboundedReceiver<SignalingEnvelope>>,
    }

    #[async_trait]
    impl SignalingTransport for FakeSignalingTransport {
        async fn send(&self, envelope: SignalingEnvelope) -> Result<()> {
            let _ = self.outbox.send(envelope);
            Ok(())
        }

        async fn recv(&self) -> Option<SignalingEnvelope> {
            if let Some(env) = self.inbox.lock().await.pop_front() {
                return Some(env);
            }
            self.inbox_rx.lock().await.recv().await
        }
    }

    pub fn fake_signaling_pair() -> (FakeSignalingTransport, FakeSignalingTransport) {
        let (tx_a, rx_a) = tokio::sync::mpsc::unbounded_channel();
        let (tx_b, rx_b) = tokio::sync::mpsc::unbounded_channel();
        (
            FakeSignalingTransport { outbox: tx_b, inbox: Mutex::new(VecDeque::new()), inbox_rx: Mutex::new(rx_a) },
            FakeSignalingTransport { outbox: tx_a, inbox: Mutex::new(VecDeque::new()), inbox_rx: Mutex::new(rx_b) },
        )
    }

    #[tokio::test]
    async fn fake_data_channel_delivers_in_order() {
        let (a, b) = fake_channel_pair();
        a.send(ChannelMessage::Text("hello".into())).await.unwrap();
        a.send(ChannelMessage::Binary(Bytes::from_static(b"x"))).await.unwrap();
        assert_eq!(b.recv().await, Some(ChannelMessage::Text("hello".into())));
        assert_eq!(b.recv().await, Some(ChannelMessage::Binary(Bytes::from_static(b"x"))));
    }

    /// A `PeerConnection` that never actually negotiates anything: offers
    /// and answers are opaque placeholder strings, and the channels are a
    /// [`fake_channel_pair`] wired up front. Good enough to drive the
    /// Session Coordinator's state machine in tests without a real WebRTC
    /// stack.
    pub struct FakePeerConnection {
        control: std::sync::Arc<FakeDataChannel>,
        data: std::sync::Arc<FakeDataChannel>,
    }

    impl FakePeerConnection {
        pub fn new(control: FakeDataChannel, data: FakeDataChannel) -> Self {
            Self { control: std::sync::Arc::new(control), data: std::sync::Arc::new(data) }
        }
    }

    #[async_trait]
    impl PeerConnection for FakePeerConnection {
        async fn create_offer(&self) -> Result<String> {
            Ok("fake-offer".to_string())
        }

        async fn create_answer(&self, _remote_offer: &str) -> Result<String> {
            Ok("fake-answer".to_string())
        }

        async fn set_remote_answer(&self, _answer: &str) -> Result<()> {
            Ok(())
        }

        async fn add_ice_candidate(&self, _candidate: &str) -> Result<()> {
            Ok(())
        }

        async fn wait_until_open(&self) -> Result<()> {
            Ok(())
        }

        fn control_channel(&self) -> std::sync::Arc<dyn DataChannel> {
            self.control.clone()
        }

        fn data_channel(&self) -> std::sync::Arc<dyn DataChannel> {
            self.data.clone()
        }
    }

    #[tokio::test]
    async fn fake_signaling_transport_delivers_envelopes() {
        let (a, b) = fake_signaling_pair();
        a.send(SignalingEnvelope::Join { sender_id: "peer-a".into(), room_code: "123456".into() }).await.unwrap();
        let received = b.recv().await.unwrap();
        assert_eq!(received, SignalingEnvelope::Join { sender_id: "peer-a".into(), room_code: "123456".into() });
    }
}
