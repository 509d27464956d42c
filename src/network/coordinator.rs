//! # Session Coordinator
//!
//! Owns the peer connection lifecycle end to end: signaling, offer/answer
//! negotiation, ICE candidate queueing, and the `idle → signaling →
//! connecting → connected → {disconnected, failed}` state machine. Driven
//! by a `tokio::select!` loop over commands and inbound signaling
//! envelopes, following the shape of the teacher's `network::run_event_loop`.

use super::peer::{elect_role, Role};
use super::signaling::SignalingEnvelope;
use super::transport::{DataChannel, PeerConnection, SignalingTransport};
use crate::error::Error;
use crate::events::EngineEvent;
use crate::types::ConnectionState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval, Duration};

const JOIN_INTERVAL: Duration = Duration::from_millis(1500);

/// Produces a fresh [`PeerConnection`] once a role has been elected. A host
/// application supplies this, wrapping whatever WebRTC stack it embeds.
pub type PeerConnectionFactory = Arc<dyn Fn() -> Arc<dyn PeerConnection> + Send + Sync>;

enum Command {
    Init { room_code: String },
    Cleanup,
}

/// Handle used by the application to drive a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    command_tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<EngineEvent>,
    state: Arc<Mutex<ConnectionState>>,
    peer_connection: Arc<Mutex<Option<Arc<dyn PeerConnection>>>>,
}

impl CoordinatorHandle {
    pub async fn init(&self, room_code: impl Into<String>) {
        let _ = self.command_tx.send(Command::Init { room_code: room_code.into() });
    }

    pub async fn cleanup(&self) {
        let _ = self.command_tx.send(Command::Cleanup);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// The coordinator's event bus, shared with the sender/receiver
    /// pipelines so `StateChanged` and `Progress`/`FileReceived` events
    /// flow to the same subscribers.
    pub fn events(&self) -> broadcast::Sender<EngineEvent> {
        self.events.clone()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.state.lock().await
    }

    /// The `(control, data)` channel pair, available once the coordinator
    /// has created a peer connection (it may not be open yet; pair this
    /// with a `StateChanged(Connected)` event for a ready-to-use channel).
    pub async fn channels(&self) -> Option<(Arc<dyn DataChannel>, Arc<dyn DataChannel>)> {
        let pc = self.peer_connection.lock().await.clone()?;
        Some((pc.control_channel(), pc.data_channel()))
    }
}

struct Inner {
    my_id: String,
    signaling: Arc<dyn SignalingTransport>,
    connection_factory: PeerConnectionFactory,
    state: Arc<Mutex<ConnectionState>>,
    events: broadcast::Sender<EngineEvent>,
    peer_connection: Arc<Mutex<Option<Arc<dyn PeerConnection>>>>,
    ice_queue: Mutex<Vec<String>>,
    remote_description_set: AtomicBool,
    announcing: AtomicBool,
    room_code: Mutex<String>,
}

impl Inner {
    async fn set_state(&self, state: ConnectionState) {
        *self.state.lock().await = state;
        let _ = self.events.send(EngineEvent::StateChanged(state));
    }

    async fn handle_envelope(self: &Arc<Self>, envelope: SignalingEnvelope) {
        if envelope.sender_id() == self.my_id {
            return;
        }
        match envelope {
            SignalingEnvelope::Join { sender_id, .. } => {
                if self.announcing.load(Ordering::SeqCst) {
                    self.handle_join(&sender_id).await;
                }
            }
            SignalingEnvelope::Offer { sender_id, offer } => {
                let pc = self.ensure_peer_connection(&sender_id).await;
                match pc.create_answer(&offer).await {
                    Ok(answer) => {
                        self.remote_description_set.store(true, Ordering::SeqCst);
                        self.drain_ice_queue(&pc).await;
                        let _ = self
                            .signaling
                            .send(SignalingEnvelope::Answer { sender_id: self.my_id.clone(), answer })
                            .await;
                        self.spawn_open_watcher(pc);
                    }
                    Err(err) => self.fail(err).await,
                }
            }
            SignalingEnvelope::Answer { answer, .. } => {
                if let Some(pc) = self.peer_connection.lock().await.clone() {
                    if let Err(err) = pc.set_remote_answer(&answer).await {
                        self.fail(err).await;
                        return;
                    }
                    self.remote_description_set.store(true, Ordering::SeqCst);
                    self.drain_ice_queue(&pc).await;
                }
            }
            SignalingEnvelope::Candidate { candidate, .. } => {
                if self.remote_description_set.load(Ordering::SeqCst) {
                    if let Some(pc) = self.peer_connection.lock().await.clone() {
                        let _ = pc.add_ice_candidate(&candidate).await;
                    }
                } else {
                    self.ice_queue.lock().await.push(candidate);
                }
            }
        }
    }

    async fn handle_join(self: &Arc<Self>, peer_id: &str) {
        if self.peer_connection.lock().await.is_some() {
            return;
        }
        self.set_state(ConnectionState::Connecting).await;
        match elect_role(&self.my_id, peer_id) {
            Role::Offerer => {
                let pc = self.ensure_peer_connection(peer_id).await;
                match pc.create_offer().await {
                    Ok(offer) => {
                        let _ = self
                            .signaling
                            .send(SignalingEnvelope::Offer { sender_id: self.my_id.clone(), offer })
                            .await;
                        self.spawn_open_watcher(pc);
                    }
                    Err(err) => self.fail(err).await,
                }
            }
            Role::Answerer => {
                self.ensure_peer_connection(peer_id).await;
            }
        }
    }

    async fn ensure_peer_connection(&self, _peer_id: &str) -> Arc<dyn PeerConnection> {
        let mut guard = self.peer_connection.lock().await;
        if let Some(pc) = guard.as_ref() {
            return pc.clone();
        }
        let pc = (self.connection_factory)();
        *guard = Some(pc.clone());
        pc
    }

    async fn drain_ice_queue(&self, pc: &Arc<dyn PeerConnection>) {
        let queued: Vec<String> = self.ice_queue.lock().await.drain(..).collect();
        for candidate in queued {
            let _ = pc.add_ice_candidate(&candidate).await;
        }
    }

    fn spawn_open_watcher(self: &Arc<Self>, pc: Arc<dyn PeerConnection>) {
        let inner = self.clone();
        tokio::spawn(async move {
            match pc.wait_until_open().await {
                Ok(()) => {
                    inner.announcing.store(false, Ordering::SeqCst);
                    inner.set_state(ConnectionState::Connected).await;
                    inner.spawn_disconnect_watcher(pc);
                }
                Err(err) => inner.fail(err).await,
            }
        });
    }

    /// Watches a connected peer connection for closure and transitions to
    /// `Disconnected`, unless the session has since moved on (cleaned up or
    /// already failed) by the time the watcher resolves.
    fn spawn_disconnect_watcher(self: &Arc<Self>, pc: Arc<dyn PeerConnection>) {
        let inner = self.clone();
        tokio::spawn(async move {
            pc.closed().await;
            if *inner.state.lock().await == ConnectionState::Connected {
                inner.set_state(ConnectionState::Disconnected).await;
            }
        });
    }

    async fn fail(&self, err: Error) {
        let _ = self.events.send(EngineEvent::Log(format!("signaling failure: {err}")));
        self.announcing.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Failed).await;
    }

    async fn cleanup(&self) {
        self.announcing.store(false, Ordering::SeqCst);
        *self.peer_connection.lock().await = None;
        self.ice_queue.lock().await.clear();
        self.remote_description_set.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Idle).await;
    }
}

/// Spawn a running coordinator and return a handle to drive it.
pub fn spawn(my_id: impl Into<String>, signaling: Arc<dyn SignalingTransport>, connection_factory: PeerConnectionFactory) -> CoordinatorHandle {
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(64);
    let state = Arc::new(Mutex::new(ConnectionState::Idle));
    let peer_connection = Arc::new(Mutex::new(None));
    let inner = Arc::new(Inner {
        my_id: my_id.into(),
        signaling,
        connection_factory,
        state: state.clone(),
        events: events.clone(),
        peer_connection: peer_connection.clone(),
        ice_queue: Mutex::new(Vec::new()),
        remote_description_set: AtomicBool::new(false),
        announcing: AtomicBool::new(false),
        room_code: Mutex::new(String::new()),
    });

    let handle = CoordinatorHandle { command_tx, events, state, peer_connection };

    tokio::spawn(async move {
        let mut join_ticker = interval(JOIN_INTERVAL);
        loop {
            tokio::select! {
                command = command_rx.recv() => {
                    match command {
                        Some(Command::Init { room_code }) => {
                            *inner.room_code.lock().await = room_code;
                            inner.set_state(ConnectionState::Signaling).await;
                            inner.announcing.store(true, Ordering::SeqCst);
                        }
                        Some(Command::Cleanup) => inner.cleanup().await,
                        None => break,
                    }
                }
                envelope = inner.signaling.recv() => {
                    match envelope {
                        Some(env) => inner.handle_envelope(env).await,
                        None => {
                            inner.fail(Error::TransportClosed("signaling transport closed".into())).await;
                        }
                    }
                }
                _ = join_ticker.tick(), if inner.announcing.load(Ordering::SeqCst) => {
                    let room_code = inner.room_code.lock().await.clone();
                    let _ = inner.signaling.send(SignalingEnvelope::Join { sender_id: inner.my_id.clone(), room_code }).await;
                }
            }
        }
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::transport::fakes::{fake_channel_pair, fake_signaling_pair, FakePeerConnection};

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
    async fn init_transitions_to_signaling() {
        let (sig_a, _sig_b) = fake_signaling_pair();
        let handle = spawn("peer-a", Arc::new(sig_a), factory());
        handle.init("123456").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.state().await, ConnectionState::Signaling);
    }

    #[tokio::test]
    async fn offerer_role_elected_for_larger_id_drives_to_connected() {
        let (sig_a, sig_b) = fake_signaling_pair();
        let a = spawn("zeta", Arc::new(sig_a), factory());
        let b = spawn("alpha", Arc::new(sig_b), factory());
        a.init("123456").await;
        b.init("123456").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        // "zeta" > "alpha" so a is offerer and sends an offer which b answers.
        assert_eq!(a.state().await, ConnectionState::Connected);
    }

    /// Dropping the peer's channel halves after the session reaches
    /// `Connected` surfaces as a transition to `Disconnected`, per
    /// `PeerConnection::closed()`.
    #[tokio::test]
    async fn transport_closing_after_connect_moves_to_disconnected() {
        use crate::network::transport::fakes::FakeDataChannel;
        use std::sync::Mutex as StdMutex;

        let peer_halves: Arc<StdMutex<Option<(FakeDataChannel, FakeDataChannel)>>> = Arc::new(StdMutex::new(None));
        let factory_halves = peer_halves.clone();
        let tracked_factory: PeerConnectionFactory = Arc::new(move || {
            let (control, control_peer) = fake_channel_pair();
            let (data, data_peer) = fake_channel_pair();
            *factory_halves.lock().unwrap() = Some((control_peer, data_peer));
            Arc::new(FakePeerConnection::new(control, data)) as Arc<dyn PeerConnection>
        });

        let (sig_a, sig_b) = fake_signaling_pair();
        let a = spawn("zeta", Arc::new(sig_a), tracked_factory);
        let b = spawn("alpha", Arc::new(sig_b), factory());
        a.init("123456").await;
        b.init("123456").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.state().await, ConnectionState::Connected);

        // Drop the peer's retained channel halves to simulate the transport
        // closing out from under "zeta".
        peer_halves.lock().unwrap().take();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn cleanup_returns_to_idle() {
        let (sig_a, _sig_b) = fake_signaling_pair();
        let handle = spawn("peer-a", Arc::new(sig_a), factory());
        handle.init("123456").await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cleanup().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.state().await, ConnectionState::Idle);
    }
}
