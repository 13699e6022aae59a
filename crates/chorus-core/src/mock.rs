//! In-memory stand-ins for the relay and the media stack.
//!
//! [`MemoryRelayHub`] routes messages between any number of coordinators in
//! one process the way the real relay does. [`MockBackend`] hands out
//! connections that follow the offer/answer rules strictly enough to catch
//! ordering mistakes: a candidate applied before the remote description is an
//! error, just like with a real peer connection.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chorus_proto::{
    ClientMessage, IceCandidate, Participant, ParticipantId, SdpKind, ServerMessage,
    SessionDescription,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::{MediaError, NegotiationError, TransportError};
use crate::media::{
    ConnectionEvent, ConnectionEvents, ConnectionState, MediaBackend, PeerConnection,
};
use crate::relay::RelaySink;

struct HubClient {
    id: ParticipantId,
    display_name: Option<String>,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

#[derive(Default)]
struct HubState {
    clients: Vec<HubClient>,
}

impl HubState {
    fn deliver(&self, to: &ParticipantId, message: ServerMessage) {
        match self.clients.iter().find(|client| &client.id == to) {
            Some(client) => {
                let _ = client.tx.send(message);
            }
            None => {
                tracing::debug!(target = "relay", participant = %to, "no such participant; dropping");
            }
        }
    }

    fn broadcast_except(&self, except: &ParticipantId, message: &ServerMessage) {
        for client in &self.clients {
            if &client.id != except && client.display_name.is_some() {
                let _ = client.tx.send(message.clone());
            }
        }
    }
}

/// Single-process relay. Cloning yields another handle to the same hub.
#[derive(Clone, Default)]
pub struct MemoryRelayHub {
    state: Arc<Mutex<HubState>>,
}

impl MemoryRelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect a client under a fresh random id.
    pub fn connect(&self) -> (Arc<MemoryRelay>, mpsc::UnboundedReceiver<ServerMessage>) {
        self.connect_as(ParticipantId::generate())
    }

    pub fn connect_as(
        &self,
        id: impl Into<ParticipantId>,
    ) -> (Arc<MemoryRelay>, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().clients.push(HubClient {
            id: id.clone(),
            display_name: None,
            tx,
        });
        let relay = MemoryRelay {
            id,
            hub: self.clone(),
        };
        (Arc::new(relay), rx)
    }

    /// Drop a client's connection and tell everyone else it left.
    pub fn disconnect(&self, id: &ParticipantId) {
        let mut state = self.state.lock();
        let Some(index) = state.clients.iter().position(|client| &client.id == id) else {
            return;
        };
        let client = state.clients.remove(index);
        if client.display_name.is_some() {
            state.broadcast_except(
                id,
                &ServerMessage::ParticipantLeft {
                    participant_id: id.clone(),
                },
            );
        }
    }

    /// Participants that have joined, in join order.
    pub fn participants(&self) -> Vec<Participant> {
        self.state
            .lock()
            .clients
            .iter()
            .filter_map(|client| {
                client
                    .display_name
                    .as_ref()
                    .map(|name| Participant::new(client.id.clone(), name.clone()))
            })
            .collect()
    }

    fn route(&self, from: &ParticipantId, message: ClientMessage) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        let Some(sender) = state.clients.iter_mut().find(|client| &client.id == from) else {
            return Err(TransportError::ChannelClosed);
        };

        match message {
            ClientMessage::Join { display_name } => {
                sender.display_name = Some(display_name.clone());
                let participant = Participant::new(from.clone(), display_name);
                let _ = sender.tx.send(ServerMessage::Welcome {
                    participant: participant.clone(),
                });
                state.broadcast_except(from, &ServerMessage::ParticipantJoined { participant });
            }
            ClientMessage::Call {
                target,
                sender_name,
                offer,
            } => state.deliver(
                &target,
                ServerMessage::Call {
                    from: from.clone(),
                    sender_name,
                    offer,
                },
            ),
            ClientMessage::Answer { target, answer } => state.deliver(
                &target,
                ServerMessage::Answer {
                    from: from.clone(),
                    answer,
                },
            ),
            ClientMessage::Candidate { target, candidate } => state.deliver(
                &target,
                ServerMessage::Candidate {
                    from: from.clone(),
                    candidate,
                },
            ),
            ClientMessage::Chat { sender_name, text } => {
                state.broadcast_except(from, &ServerMessage::Chat { sender_name, text });
            }
        }
        Ok(())
    }
}

/// One client's connection to a [`MemoryRelayHub`].
pub struct MemoryRelay {
    id: ParticipantId,
    hub: MemoryRelayHub,
}

impl MemoryRelay {
    pub fn id(&self) -> &ParticipantId {
        &self.id
    }
}

impl RelaySink for MemoryRelay {
    fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.hub.route(&self.id, message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockTrack {
    pub label: String,
}

/// Stand-in for received remote audio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockStream {
    pub participant: ParticipantId,
}

#[derive(Default)]
struct BackendState {
    connections: Vec<Arc<MockConnection>>,
    reject_remote: HashSet<ParticipantId>,
}

pub struct MockBackend {
    microphone: bool,
    state: Mutex<BackendState>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            microphone: true,
            state: Mutex::default(),
        }
    }

    /// A backend whose track acquisition always fails.
    pub fn without_microphone() -> Self {
        Self {
            microphone: false,
            state: Mutex::default(),
        }
    }

    /// Make every connection to `id` refuse remote descriptions.
    pub fn reject_remote_descriptions_from(&self, id: impl Into<ParticipantId>) {
        self.state.lock().reject_remote.insert(id.into());
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.state.lock().connections.clone()
    }

    /// Most recently opened connection to `id`.
    pub fn connection_for(&self, id: &str) -> Option<Arc<MockConnection>> {
        self.state
            .lock()
            .connections
            .iter()
            .rev()
            .find(|connection| connection.participant.as_str() == id)
            .cloned()
    }
}

#[async_trait]
impl MediaBackend for MockBackend {
    type Track = MockTrack;
    type Connection = MockConnection;
    type RemoteStream = MockStream;

    async fn acquire_local_track(&self) -> Result<MockTrack, MediaError> {
        if !self.microphone {
            return Err(MediaError::Unavailable("no capture device".into()));
        }
        Ok(MockTrack {
            label: "mock-microphone".into(),
        })
    }

    async fn open_connection(
        &self,
        events: ConnectionEvents<MockStream>,
    ) -> Result<Arc<MockConnection>, NegotiationError> {
        let mut state = self.state.lock();
        let reject_remote = state.reject_remote.contains(events.participant_id());
        let connection = Arc::new(MockConnection {
            participant: events.participant_id().clone(),
            reject_remote,
            events,
            inner: Mutex::default(),
        });
        state.connections.push(Arc::clone(&connection));
        Ok(connection)
    }

    async fn attach(
        &self,
        track: &MockTrack,
        connection: &MockConnection,
    ) -> Result<(), NegotiationError> {
        let mut inner = connection.inner.lock();
        if inner.closed {
            return Err(NegotiationError::Backend("connection is closed".into()));
        }
        inner.attached = Some(track.clone());
        inner.operations.push(ConnectionOp::Attach);
        Ok(())
    }

    async fn detach(
        &self,
        _track: &MockTrack,
        connection: &MockConnection,
    ) -> Result<(), NegotiationError> {
        let mut inner = connection.inner.lock();
        inner.attached = None;
        inner.operations.push(ConnectionOp::Detach);
        Ok(())
    }
}

/// Track and lifecycle calls made on a [`MockConnection`], in call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOp {
    Attach,
    Detach,
    Close,
}

#[derive(Default)]
struct ConnectionInner {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    applied: Vec<Option<IceCandidate>>,
    attached: Option<MockTrack>,
    connected: bool,
    closed: bool,
    operations: Vec<ConnectionOp>,
}

pub struct MockConnection {
    participant: ParticipantId,
    reject_remote: bool,
    events: ConnectionEvents<MockStream>,
    inner: Mutex<ConnectionInner>,
}

impl MockConnection {
    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// Remote candidates in the order they were applied.
    pub fn applied_candidates(&self) -> Vec<Option<IceCandidate>> {
        self.inner.lock().applied.clone()
    }

    pub fn local_description(&self) -> Option<SessionDescription> {
        self.inner.lock().local.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.inner.lock().remote.clone()
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().attached.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn operations(&self) -> Vec<ConnectionOp> {
        self.inner.lock().operations.clone()
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.inner.lock().closed {
            return Err(NegotiationError::Backend("connection is closed".into()));
        }
        Ok(())
    }

    /// Once both sides are described the "network" comes up and audio flows.
    fn maybe_connect(&self) {
        let connect = {
            let mut inner = self.inner.lock();
            let ready = inner.local.is_some() && inner.remote.is_some() && !inner.connected;
            if ready {
                inner.connected = true;
            }
            ready
        };
        if connect {
            self.events
                .emit(ConnectionEvent::StateChanged(ConnectionState::Connected));
            self.events.emit(ConnectionEvent::RemoteTrack(MockStream {
                participant: self.participant.clone(),
            }));
        }
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        Ok(SessionDescription::offer(format!(
            "v=0\r\ns=mock offer to {}\r\n",
            self.participant
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        match self.inner.lock().remote.as_ref().map(|remote| remote.kind) {
            Some(SdpKind::Offer) => Ok(SessionDescription::answer(format!(
                "v=0\r\ns=mock answer to {}\r\n",
                self.participant
            ))),
            _ => Err(NegotiationError::InvalidDescription(
                "cannot answer without a remote offer".into(),
            )),
        }
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.inner.lock().local = Some(description);

        self.events
            .emit(ConnectionEvent::GatheringStateChanged("gathering".into()));
        self.events
            .emit(ConnectionEvent::LocalCandidate(Some(IceCandidate::new(format!(
                "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host",
                40000 + self.events.generation()
            )))));
        self.events.emit(ConnectionEvent::LocalCandidate(None));
        self.events
            .emit(ConnectionEvent::GatheringStateChanged("complete".into()));

        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if self.reject_remote {
            return Err(NegotiationError::InvalidDescription(format!(
                "unparseable {:?} from {}",
                description.kind, self.participant
            )));
        }
        self.inner.lock().remote = Some(description);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        candidate: Option<IceCandidate>,
    ) -> Result<(), NegotiationError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(NegotiationError::Backend("connection is closed".into()));
        }
        if inner.remote.is_none() {
            return Err(NegotiationError::InvalidDescription(
                "candidate applied before the remote description".into(),
            ));
        }
        inner.applied.push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Ok(());
            }
            inner.closed = true;
            inner.operations.push(ConnectionOp::Close);
        }
        self.events
            .emit(ConnectionEvent::StateChanged(ConnectionState::Closed));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hub_welcomes_joiner_and_tells_the_others() {
        let hub = MemoryRelayHub::new();
        let (alice, mut alice_rx) = hub.connect_as("alice");
        let (bob, mut bob_rx) = hub.connect_as("bob");

        alice
            .send(ClientMessage::Join {
                display_name: "Alice".into(),
            })
            .unwrap();
        assert!(matches!(
            alice_rx.try_recv(),
            Ok(ServerMessage::Welcome { participant }) if participant.id.as_str() == "alice"
        ));
        // Bob has not joined yet, so nothing arrives there.
        assert!(bob_rx.try_recv().is_err());

        bob.send(ClientMessage::Join {
            display_name: "Bob".into(),
        })
        .unwrap();
        assert!(matches!(
            alice_rx.try_recv(),
            Ok(ServerMessage::ParticipantJoined { participant }) if participant.display_name == "Bob"
        ));
        assert_eq!(hub.participants().len(), 2);
    }

    #[test]
    fn hub_addresses_signaling_to_the_target_only() {
        let hub = MemoryRelayHub::new();
        let (alice, _alice_rx) = hub.connect_as("alice");
        let (_bob, mut bob_rx) = hub.connect_as("bob");
        let (_carol, mut carol_rx) = hub.connect_as("carol");

        alice
            .send(ClientMessage::Candidate {
                target: ParticipantId::from("bob"),
                candidate: None,
            })
            .unwrap();

        assert_eq!(
            bob_rx.try_recv().unwrap(),
            ServerMessage::Candidate {
                from: ParticipantId::from("alice"),
                candidate: None,
            }
        );
        assert!(carol_rx.try_recv().is_err());
    }

    #[test]
    fn disconnect_announces_departure_and_closes_the_stream() {
        let hub = MemoryRelayHub::new();
        let (alice, mut alice_rx) = hub.connect_as("alice");
        let (bob, mut bob_rx) = hub.connect_as("bob");
        for (relay, name) in [(&alice, "Alice"), (&bob, "Bob")] {
            relay
                .send(ClientMessage::Join {
                    display_name: name.into(),
                })
                .unwrap();
        }
        while alice_rx.try_recv().is_ok() {}

        hub.disconnect(&ParticipantId::from("bob"));

        assert_eq!(
            alice_rx.try_recv().unwrap(),
            ServerMessage::ParticipantLeft {
                participant_id: ParticipantId::from("bob"),
            }
        );
        while bob_rx.try_recv().is_ok() {}
        assert!(matches!(
            bob_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(matches!(
            bob.send(ClientMessage::Chat {
                sender_name: "Bob".into(),
                text: "still here?".into(),
            }),
            Err(TransportError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn connection_rejects_early_candidates() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let backend = MockBackend::new();
        let connection = backend
            .open_connection(ConnectionEvents::new(ParticipantId::from("bob"), 1, tx))
            .await
            .unwrap();

        let err = connection
            .add_ice_candidate(Some(IceCandidate::new("candidate:1")))
            .await
            .unwrap_err();
        assert!(matches!(err, NegotiationError::InvalidDescription(_)));

        connection
            .set_remote_description(SessionDescription::offer("v=0"))
            .await
            .unwrap();
        connection.add_ice_candidate(None).await.unwrap();
        assert_eq!(connection.applied_candidates(), vec![None]);
    }
}
