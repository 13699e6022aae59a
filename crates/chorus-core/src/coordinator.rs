//! The per-client actor: turns relay traffic and connection callbacks into
//! session lifecycle changes.
//!
//! Everything that touches the registry runs on the coordinator's own task,
//! one input at a time. Negotiation for each remote participant runs on a
//! separate task (see [`crate::negotiator`]) that reports back through the
//! coordinator's inbox, tagged with the session generation so results from a
//! torn-down session are recognised and ignored.

use std::sync::Arc;

use chorus_proto::{
    ClientMessage, IceCandidate, Participant, ParticipantId, ServerMessage, SessionDescription,
};
use tokio::sync::{mpsc, oneshot};

use crate::error::{MediaError, MeshError, NegotiationError, RegistryError, TransportError};
use crate::media::{ConnectionEvent, ConnectionEvents, ConnectionState, MediaBackend, PeerConnection};
use crate::negotiator::{Negotiator, SessionCommand};
use crate::registry::{PeerRegistry, SessionEntry};
use crate::relay::RelaySink;
use crate::session::{NegotiationState, PeerSession, Role, SessionHandle, SessionSnapshot};

/// Work items feeding the coordinator from connections and negotiators.
#[derive(Debug)]
pub enum MeshInput<S> {
    Connection {
        participant_id: ParticipantId,
        generation: u64,
        event: ConnectionEvent<S>,
    },
    SessionState {
        participant_id: ParticipantId,
        generation: u64,
        state: NegotiationState,
    },
    SessionFailed {
        participant_id: ParticipantId,
        generation: u64,
        error: NegotiationError,
    },
}

/// What the coordinator tells the outside world (UI, tests).
#[derive(Debug)]
pub enum MeshEvent<S> {
    /// The relay acknowledged our join and assigned us an id.
    Joined(Participant),
    PeerConnected(Participant),
    PeerDisconnected(ParticipantId),
    RemoteTrackReady { participant: Participant, stream: S },
    Chat { sender_name: String, text: String },
    /// No local audio; the client stays out of the mesh.
    MediaUnavailable(String),
    RelayDisconnected(String),
}

#[derive(Debug)]
pub enum MeshCommand {
    Chat(String),
    Snapshot(oneshot::Sender<Vec<SessionSnapshot>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable control handle for a running coordinator.
#[derive(Clone, Debug)]
pub struct MeshHandle {
    commands: mpsc::UnboundedSender<MeshCommand>,
}

impl MeshHandle {
    pub fn chat(&self, text: impl Into<String>) -> Result<(), MeshError> {
        self.commands
            .send(MeshCommand::Chat(text.into()))
            .map_err(|_| MeshError::Stopped)
    }

    pub async fn snapshot(&self) -> Result<Vec<SessionSnapshot>, MeshError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(MeshCommand::Snapshot(tx))
            .map_err(|_| MeshError::Stopped)?;
        rx.await.map_err(|_| MeshError::Stopped)
    }

    /// Tear down every session and stop the coordinator.
    pub async fn shutdown(&self) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(MeshCommand::Shutdown(tx))
            .map_err(|_| MeshError::Stopped)?;
        rx.await.map_err(|_| MeshError::Stopped)
    }
}

/// Receiving ends of the coordinator's own queues, consumed by [`MeshCoordinator::run`].
pub struct Mailbox<S> {
    inputs: mpsc::UnboundedReceiver<MeshInput<S>>,
    commands: mpsc::UnboundedReceiver<MeshCommand>,
}

pub struct MeshCoordinator<B: MediaBackend> {
    display_name: String,
    local: Option<Participant>,
    backend: Arc<B>,
    relay: Arc<dyn RelaySink>,
    registry: PeerRegistry<SessionHandle<B::Connection>>,
    local_track: Option<B::Track>,
    inputs: mpsc::UnboundedSender<MeshInput<B::RemoteStream>>,
    commands: mpsc::UnboundedSender<MeshCommand>,
    events: mpsc::UnboundedSender<MeshEvent<B::RemoteStream>>,
    next_generation: u64,
}

impl<B: MediaBackend> MeshCoordinator<B> {
    pub fn new(
        display_name: impl Into<String>,
        backend: Arc<B>,
        relay: Arc<dyn RelaySink>,
    ) -> (
        Self,
        Mailbox<B::RemoteStream>,
        mpsc::UnboundedReceiver<MeshEvent<B::RemoteStream>>,
    ) {
        let (inputs, inputs_rx) = mpsc::unbounded_channel();
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();
        let coordinator = Self {
            display_name: display_name.into(),
            local: None,
            backend,
            relay,
            registry: PeerRegistry::new(),
            local_track: None,
            inputs,
            commands,
            events,
            next_generation: 0,
        };
        let mailbox = Mailbox {
            inputs: inputs_rx,
            commands: commands_rx,
        };
        (coordinator, mailbox, events_rx)
    }

    pub fn handle(&self) -> MeshHandle {
        MeshHandle {
            commands: self.commands.clone(),
        }
    }

    pub fn local_participant(&self) -> Option<&Participant> {
        self.local.as_ref()
    }

    /// Drive the coordinator until the relay goes away or a shutdown is
    /// requested. Sessions are torn down either way.
    pub async fn run(
        mut self,
        mut mailbox: Mailbox<B::RemoteStream>,
        mut inbound: mpsc::UnboundedReceiver<ServerMessage>,
    ) {
        self.announce().await;

        loop {
            tokio::select! {
                message = inbound.recv() => match message {
                    Some(message) => self.on_message(message).await,
                    None => {
                        let err = MeshError::from(TransportError::ChannelClosed);
                        tracing::warn!(target = "mesh", error = %err, "signaling relay went away");
                        self.emit(MeshEvent::RelayDisconnected(err.to_string()));
                        break;
                    }
                },
                Some(input) = mailbox.inputs.recv() => self.handle_input(input).await,
                Some(command) = mailbox.commands.recv() => match command {
                    MeshCommand::Chat(text) => self.send_chat(text),
                    MeshCommand::Snapshot(reply) => {
                        let _ = reply.send(self.snapshot());
                    }
                    MeshCommand::Shutdown(done) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                },
            }
        }

        self.shutdown().await;
    }

    /// Acquire the local track and, only if that worked, join the mesh.
    pub async fn announce(&mut self) {
        match self.backend.acquire_local_track().await {
            Ok(track) => self.local_track = Some(track),
            Err(err) => {
                let err = MeshError::from(err);
                tracing::error!(target = "mesh", error = %err, "cannot join without local audio");
                self.emit(MeshEvent::MediaUnavailable(err.to_string()));
                return;
            }
        }

        let join = ClientMessage::Join {
            display_name: self.display_name.clone(),
        };
        if let Err(err) = self.relay.send(join) {
            tracing::error!(target = "mesh", error = %err, "failed to announce presence");
            self.emit(MeshEvent::RelayDisconnected(err.to_string()));
        }
    }

    pub async fn on_message(&mut self, message: ServerMessage) {
        let kind = message.kind();
        tracing::trace!(target = "mesh", kind, "relay message");
        if let Err(err) = self.dispatch(message).await {
            match &err {
                MeshError::StaleMessage { .. } => {
                    tracing::warn!(target = "mesh", kind, error = %err, "dropping stale message");
                }
                _ => {
                    tracing::error!(target = "mesh", kind, error = %err, "failed to handle relay message");
                }
            }
        }
    }

    async fn dispatch(&mut self, message: ServerMessage) -> Result<(), MeshError> {
        match message {
            ServerMessage::Welcome { participant } => {
                tracing::info!(
                    target = "mesh",
                    participant = %participant.id,
                    "joined the mesh"
                );
                self.local = Some(participant.clone());
                self.emit(MeshEvent::Joined(participant));
                Ok(())
            }
            ServerMessage::ParticipantJoined { participant } => self.on_join(participant).await,
            ServerMessage::Call {
                from,
                sender_name,
                offer,
            } => self.on_call(Participant::new(from, sender_name), offer).await,
            ServerMessage::Answer { from, answer } => self.on_answer(from, answer),
            ServerMessage::Candidate { from, candidate } => {
                self.on_candidate(from, candidate);
                Ok(())
            }
            ServerMessage::ParticipantLeft { participant_id } => {
                self.on_leave(&participant_id).await;
                Ok(())
            }
            ServerMessage::Chat { sender_name, text } => {
                self.emit(MeshEvent::Chat { sender_name, text });
                Ok(())
            }
        }
    }

    /// A participant entered the mesh. Everyone already present offers to it;
    /// our own announcement needs nothing.
    pub async fn on_join(&mut self, participant: Participant) -> Result<(), MeshError> {
        if self
            .local
            .as_ref()
            .is_some_and(|local| local.id == participant.id)
        {
            return Ok(());
        }
        let id = participant.id.clone();
        tracing::debug!(
            target = "mesh",
            participant = %id,
            name = %participant.display_name,
            "participant joined; offering"
        );
        self.open_session(participant, Role::Initiator).await?;
        self.send_to(&id, SessionCommand::Initiate);
        Ok(())
    }

    async fn on_call(
        &mut self,
        participant: Participant,
        offer: SessionDescription,
    ) -> Result<(), MeshError> {
        let id = participant.id.clone();
        tracing::debug!(target = "mesh", participant = %id, "offer received");
        self.open_session(participant, Role::Responder).await?;
        self.send_to(&id, SessionCommand::Respond(offer));
        Ok(())
    }

    fn on_answer(&mut self, from: ParticipantId, answer: SessionDescription) -> Result<(), MeshError> {
        let stale = || MeshError::StaleMessage {
            kind: "answer",
            from: from.clone(),
        };
        let handle = self.registry.lookup(&from).map_err(|_| stale())?;
        if handle.state().is_closed() {
            return Err(stale());
        }
        handle.send(SessionCommand::ApplyAnswer(answer));
        Ok(())
    }

    fn on_candidate(&mut self, from: ParticipantId, candidate: Option<IceCandidate>) {
        if !self.registry.is_active(&from) {
            tracing::debug!(target = "mesh", participant = %from, "candidate for unknown session; dropping");
            return;
        }
        self.send_to(&from, SessionCommand::RemoteCandidate(candidate));
    }

    /// Tear down whatever we hold for `id`. Safe to call any number of times.
    pub async fn on_leave(&mut self, id: &ParticipantId) {
        let Some(handle) = self.registry.remove(id) else {
            tracing::debug!(target = "mesh", participant = %id, "leave for unknown participant");
            return;
        };
        tracing::info!(target = "mesh", participant = %id, "participant left");
        self.teardown(handle).await;
        self.emit(MeshEvent::PeerDisconnected(id.clone()));
    }

    pub async fn handle_input(&mut self, input: MeshInput<B::RemoteStream>) {
        match input {
            MeshInput::Connection {
                participant_id,
                generation,
                event,
            } => self.on_connection_event(participant_id, generation, event),
            MeshInput::SessionState {
                participant_id,
                generation,
                state,
            } => self.on_session_state(participant_id, generation, state),
            MeshInput::SessionFailed {
                participant_id,
                generation,
                error,
            } => self.on_session_failed(participant_id, generation, error).await,
        }
    }

    fn on_connection_event(
        &mut self,
        participant_id: ParticipantId,
        generation: u64,
        event: ConnectionEvent<B::RemoteStream>,
    ) {
        let Some(handle) = self.current(&participant_id, generation) else {
            tracing::trace!(
                target = "mesh",
                participant = %participant_id,
                generation,
                "event from a retired connection"
            );
            return;
        };

        match event {
            ConnectionEvent::LocalCandidate(candidate) => {
                handle.send(SessionCommand::LocalCandidate(candidate));
            }
            ConnectionEvent::GatheringStateChanged(state) => {
                tracing::debug!(
                    target = "mesh",
                    participant = %participant_id,
                    state = %state,
                    "ice gathering state changed"
                );
            }
            ConnectionEvent::StateChanged(state) => match state {
                ConnectionState::Connected => handle.send(SessionCommand::TransportUp),
                ConnectionState::Failed | ConnectionState::Closed => {
                    handle.send(SessionCommand::TransportFailed(format!("connection {state}")));
                }
                ConnectionState::Disconnected => {
                    tracing::warn!(
                        target = "mesh",
                        participant = %participant_id,
                        "connection interrupted; waiting for it to recover"
                    );
                }
                ConnectionState::New | ConnectionState::Connecting => {
                    tracing::trace!(
                        target = "mesh",
                        participant = %participant_id,
                        state = %state,
                        "connection state"
                    );
                }
            },
            ConnectionEvent::RemoteTrack(stream) => {
                let participant = handle.participant.clone();
                handle.send(SessionCommand::MediaFlowing);
                tracing::debug!(target = "mesh", participant = %participant_id, "remote audio arrived");
                self.emit(MeshEvent::RemoteTrackReady {
                    participant,
                    stream,
                });
            }
        }
    }

    fn on_session_state(
        &mut self,
        participant_id: ParticipantId,
        generation: u64,
        state: NegotiationState,
    ) {
        let announce = match self.registry.get_mut(&participant_id) {
            Some(handle) if handle.generation == generation => {
                if state == NegotiationState::Connected && !handle.announced {
                    handle.announced = true;
                    Some(handle.participant.clone())
                } else {
                    None
                }
            }
            _ => return,
        };
        if let Some(participant) = announce {
            tracing::info!(
                target = "mesh",
                participant = %participant.id,
                name = %participant.display_name,
                "peer connected"
            );
            self.emit(MeshEvent::PeerConnected(participant));
        }
    }

    async fn on_session_failed(
        &mut self,
        participant_id: ParticipantId,
        generation: u64,
        error: NegotiationError,
    ) {
        if self.current(&participant_id, generation).is_none() {
            return;
        }
        if let Some(handle) = self.registry.remove(&participant_id) {
            // The negotiator already closed the connection on its way out.
            handle.task.abort();
        }
        let err = MeshError::Negotiation {
            participant: participant_id.clone(),
            source: error,
        };
        tracing::error!(target = "mesh", generation, error = %err, "peer session failed");
        self.emit(MeshEvent::PeerDisconnected(participant_id));
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> = self
            .registry
            .iter()
            .map(|(id, handle)| SessionSnapshot {
                participant: id.clone(),
                display_name: handle.participant.display_name.clone(),
                role: handle.role,
                state: *handle.state.borrow(),
            })
            .collect();
        sessions.sort_by(|a, b| a.participant.cmp(&b.participant));
        sessions
    }

    /// Detach the local track from every connection, then close it.
    pub async fn shutdown(&mut self) {
        let connected = self.registry.count_in(NegotiationState::Connected);
        let sessions: Vec<_> = self.registry.drain().collect();
        if sessions.is_empty() {
            return;
        }
        tracing::info!(
            target = "mesh",
            sessions = sessions.len(),
            connected,
            "tearing down sessions"
        );
        for (_, handle) in sessions {
            self.teardown(handle).await;
        }
    }

    fn send_chat(&self, text: String) {
        let message = ClientMessage::Chat {
            sender_name: self.display_name.clone(),
            text: text.clone(),
        };
        if let Err(err) = self.relay.send(message) {
            tracing::warn!(target = "mesh", error = %err, "chat message not sent");
            return;
        }
        self.emit(MeshEvent::Chat {
            sender_name: self.display_name.clone(),
            text,
        });
    }

    async fn open_session(&mut self, participant: Participant, role: Role) -> Result<(), MeshError> {
        if self.registry.is_active(&participant.id) {
            return Err(RegistryError::DuplicateSession(participant.id).into());
        }
        let track = self.local_track.clone().ok_or(MediaError::NotAcquired)?;

        self.next_generation += 1;
        let generation = self.next_generation;
        let events = ConnectionEvents::new(participant.id.clone(), generation, self.inputs.clone());
        let connection = self
            .backend
            .open_connection(events)
            .await
            .map_err(|source| MeshError::Negotiation {
                participant: participant.id.clone(),
                source,
            })?;

        let (session, state) =
            PeerSession::new(participant.clone(), role, generation, Arc::clone(&connection));
        let (commands, command_rx) = mpsc::unbounded_channel();
        let negotiator = Negotiator::new(
            session,
            Arc::clone(&self.backend),
            track,
            self.display_name.clone(),
            Arc::clone(&self.relay),
            self.inputs.clone(),
        );
        let task = tokio::spawn(negotiator.run(command_rx));

        let id = participant.id.clone();
        let handle = SessionHandle {
            participant,
            role,
            generation,
            state,
            commands,
            task,
            connection,
            announced: false,
        };
        if let Some(previous) = self.registry.insert(id.clone(), handle)? {
            previous.task.abort();
        }
        tracing::debug!(
            target = "mesh",
            participant = %id,
            generation,
            role = ?role,
            "session opened"
        );
        Ok(())
    }

    async fn teardown(&self, handle: SessionHandle<B::Connection>) {
        handle.task.abort();
        if let Some(track) = &self.local_track {
            if let Err(err) = self.backend.detach(track, &handle.connection).await {
                tracing::debug!(
                    target = "mesh",
                    participant = %handle.participant.id,
                    error = %err,
                    "detaching local track failed"
                );
            }
        }
        if let Err(err) = handle.connection.close().await {
            tracing::debug!(
                target = "mesh",
                participant = %handle.participant.id,
                error = %err,
                "closing connection failed"
            );
        }
    }

    fn current(&self, id: &ParticipantId, generation: u64) -> Option<&SessionHandle<B::Connection>> {
        self.registry
            .get(id)
            .filter(|handle| handle.generation == generation)
    }

    fn send_to(&self, id: &ParticipantId, command: SessionCommand) {
        if let Some(handle) = self.registry.get(id) {
            handle.send(command);
        }
    }

    fn emit(&self, event: MeshEvent<B::RemoteStream>) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ConnectionOp, MockBackend, MockStream};
    use std::time::Duration;

    struct Fixture {
        coordinator: MeshCoordinator<MockBackend>,
        mailbox: Mailbox<MockStream>,
        events: mpsc::UnboundedReceiver<MeshEvent<MockStream>>,
        relay: mpsc::UnboundedReceiver<ClientMessage>,
        backend: Arc<MockBackend>,
    }

    async fn joined(backend: MockBackend) -> Fixture {
        let backend = Arc::new(backend);
        let (relay_tx, relay) = mpsc::unbounded_channel::<ClientMessage>();
        let (mut coordinator, mailbox, events) =
            MeshCoordinator::new("Alice", Arc::clone(&backend), Arc::new(relay_tx));
        coordinator.announce().await;
        coordinator
            .on_message(ServerMessage::Welcome {
                participant: Participant::new("alice", "Alice"),
            })
            .await;
        Fixture {
            coordinator,
            mailbox,
            events,
            relay,
            backend,
        }
    }

    impl Fixture {
        /// Feed negotiator and connection reports back in until things go quiet.
        async fn settle(&mut self) {
            while let Ok(Some(input)) =
                tokio::time::timeout(Duration::from_millis(50), self.mailbox.inputs.recv()).await
            {
                self.coordinator.handle_input(input).await;
            }
        }

        fn sent(&mut self) -> Vec<ClientMessage> {
            let mut sent = Vec::new();
            while let Ok(message) = self.relay.try_recv() {
                sent.push(message);
            }
            sent
        }

        fn events(&mut self) -> Vec<MeshEvent<MockStream>> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        fn state_of(&self, id: &str) -> Option<NegotiationState> {
            self.coordinator
                .snapshot()
                .into_iter()
                .find(|session| session.participant.as_str() == id)
                .map(|session| session.state)
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000{n} typ host"))
    }

    #[tokio::test]
    async fn announce_sends_join_after_acquiring_audio() {
        let mut fx = joined(MockBackend::new()).await;
        assert_eq!(
            fx.sent(),
            vec![ClientMessage::Join {
                display_name: "Alice".into()
            }]
        );
        assert!(matches!(fx.events().as_slice(), [MeshEvent::Joined(p)] if p.id.as_str() == "alice"));
    }

    #[tokio::test]
    async fn own_join_is_ignored() {
        let mut fx = joined(MockBackend::new()).await;
        fx.coordinator
            .on_message(ServerMessage::ParticipantJoined {
                participant: Participant::new("alice", "Alice"),
            })
            .await;
        fx.settle().await;
        assert!(fx.coordinator.snapshot().is_empty());
    }

    #[tokio::test]
    async fn stale_answer_leaves_registry_untouched() {
        let mut fx = joined(MockBackend::new()).await;
        fx.sent();

        fx.coordinator
            .on_message(ServerMessage::Answer {
                from: ParticipantId::from("ghost"),
                answer: SessionDescription::answer("v=0"),
            })
            .await;
        fx.settle().await;

        assert!(fx.coordinator.snapshot().is_empty());
        assert!(fx.sent().is_empty());
        assert!(fx.backend.connections().is_empty());
    }

    #[tokio::test]
    async fn initiator_buffers_candidates_that_beat_the_answer() {
        let mut fx = joined(MockBackend::new()).await;
        fx.coordinator
            .on_message(ServerMessage::ParticipantJoined {
                participant: Participant::new("bob", "Bob"),
            })
            .await;
        fx.settle().await;
        assert_eq!(fx.state_of("bob"), Some(NegotiationState::OfferSent));

        let sent = fx.sent();
        assert!(matches!(
            &sent[1],
            ClientMessage::Call { target, sender_name, .. }
                if target.as_str() == "bob" && sender_name == "Alice"
        ));
        assert!(sent[2..]
            .iter()
            .all(|message| matches!(message, ClientMessage::Candidate { .. })));

        for n in 1..=2 {
            fx.coordinator
                .on_message(ServerMessage::Candidate {
                    from: ParticipantId::from("bob"),
                    candidate: Some(candidate(n)),
                })
                .await;
        }
        fx.settle().await;
        let connection = fx.backend.connection_for("bob").unwrap();
        assert!(connection.applied_candidates().is_empty());

        fx.coordinator
            .on_message(ServerMessage::Answer {
                from: ParticipantId::from("bob"),
                answer: SessionDescription::answer("v=0 bob"),
            })
            .await;
        fx.settle().await;

        assert_eq!(fx.state_of("bob"), Some(NegotiationState::Connected));
        assert_eq!(
            connection.applied_candidates(),
            vec![Some(candidate(1)), Some(candidate(2))]
        );

        fx.coordinator
            .on_message(ServerMessage::Candidate {
                from: ParticipantId::from("bob"),
                candidate: None,
            })
            .await;
        fx.settle().await;
        assert_eq!(connection.applied_candidates().len(), 3);

        let events = fx.events();
        assert!(events
            .iter()
            .any(|event| matches!(event, MeshEvent::PeerConnected(p) if p.id.as_str() == "bob")));
        assert!(events.iter().any(|event| matches!(
            event,
            MeshEvent::RemoteTrackReady { participant, .. } if participant.id.as_str() == "bob"
        )));
    }

    #[tokio::test]
    async fn responder_answers_and_connects_once_transport_is_up() {
        let mut fx = joined(MockBackend::new()).await;
        fx.sent();

        fx.coordinator
            .on_message(ServerMessage::Call {
                from: ParticipantId::from("carol"),
                sender_name: "Carol".into(),
                offer: SessionDescription::offer("v=0 carol"),
            })
            .await;
        fx.settle().await;

        let sent = fx.sent();
        assert!(matches!(
            &sent[0],
            ClientMessage::Answer { target, .. } if target.as_str() == "carol"
        ));
        assert_eq!(fx.state_of("carol"), Some(NegotiationState::Connected));
        let snapshot = fx.coordinator.snapshot();
        assert_eq!(snapshot[0].role, Role::Responder);
        assert!(fx.backend.connection_for("carol").unwrap().is_attached());
    }

    #[tokio::test]
    async fn second_call_for_an_open_session_is_rejected() {
        let mut fx = joined(MockBackend::new()).await;
        let call = ServerMessage::Call {
            from: ParticipantId::from("carol"),
            sender_name: "Carol".into(),
            offer: SessionDescription::offer("v=0 carol"),
        };
        fx.coordinator.on_message(call.clone()).await;
        fx.settle().await;
        fx.coordinator.on_message(call).await;
        fx.settle().await;

        assert_eq!(fx.coordinator.snapshot().len(), 1);
        assert_eq!(fx.backend.connections().len(), 1);
    }

    #[tokio::test]
    async fn leave_twice_is_the_same_as_leave_once() {
        let mut fx = joined(MockBackend::new()).await;
        fx.coordinator
            .on_message(ServerMessage::ParticipantJoined {
                participant: Participant::new("bob", "Bob"),
            })
            .await;
        fx.settle().await;
        fx.events();

        let bob = ParticipantId::from("bob");
        fx.coordinator.on_leave(&bob).await;
        fx.coordinator.on_leave(&bob).await;
        fx.settle().await;

        assert!(fx.coordinator.snapshot().is_empty());
        let connection = fx.backend.connection_for("bob").unwrap();
        assert!(connection.is_closed());
        assert!(!connection.is_attached());
        assert_eq!(
            connection.operations(),
            vec![ConnectionOp::Attach, ConnectionOp::Detach, ConnectionOp::Close]
        );
        let disconnects = fx
            .events()
            .into_iter()
            .filter(|event| matches!(event, MeshEvent::PeerDisconnected(_)))
            .count();
        assert_eq!(disconnects, 1);
    }

    #[tokio::test]
    async fn reports_from_a_retired_session_are_ignored() {
        let mut fx = joined(MockBackend::new()).await;
        let bob = ParticipantId::from("bob");
        let join_bob = || ServerMessage::ParticipantJoined {
            participant: Participant::new("bob", "Bob"),
        };

        fx.coordinator.on_message(join_bob()).await;
        fx.settle().await;
        fx.coordinator.on_leave(&bob).await;
        fx.coordinator.on_message(join_bob()).await;
        fx.settle().await;
        fx.events();
        assert_eq!(fx.state_of("bob"), Some(NegotiationState::OfferSent));

        fx.coordinator
            .handle_input(MeshInput::Connection {
                participant_id: bob.clone(),
                generation: 1,
                event: ConnectionEvent::StateChanged(ConnectionState::Failed),
            })
            .await;
        fx.coordinator
            .handle_input(MeshInput::SessionFailed {
                participant_id: bob.clone(),
                generation: 1,
                error: NegotiationError::ConnectionFailed("connection failed".into()),
            })
            .await;
        fx.settle().await;

        assert_eq!(fx.state_of("bob"), Some(NegotiationState::OfferSent));
        let current = fx.backend.connection_for("bob").unwrap();
        assert!(!current.is_closed());
        assert!(current.is_attached());
        assert!(!fx
            .events()
            .iter()
            .any(|event| matches!(event, MeshEvent::PeerDisconnected(_))));
    }

    #[tokio::test]
    async fn answer_arriving_after_leave_is_dropped() {
        let mut fx = joined(MockBackend::new()).await;
        let bob = ParticipantId::from("bob");
        fx.coordinator
            .on_message(ServerMessage::ParticipantJoined {
                participant: Participant::new("bob", "Bob"),
            })
            .await;
        fx.settle().await;

        fx.coordinator.on_leave(&bob).await;
        fx.coordinator
            .on_message(ServerMessage::Answer {
                from: bob.clone(),
                answer: SessionDescription::answer("v=0 bob"),
            })
            .await;
        fx.settle().await;

        assert!(fx.coordinator.snapshot().is_empty());
        let connection = fx.backend.connection_for("bob").unwrap();
        assert!(connection.remote_description().is_none());
        assert_eq!(fx.backend.connections().len(), 1);
    }

    #[tokio::test]
    async fn failed_negotiation_closes_only_that_session() {
        let backend = MockBackend::new();
        backend.reject_remote_descriptions_from("bob");
        let mut fx = joined(backend).await;

        for (id, name) in [("bob", "Bob"), ("carol", "Carol")] {
            fx.coordinator
                .on_message(ServerMessage::ParticipantJoined {
                    participant: Participant::new(id, name),
                })
                .await;
        }
        fx.settle().await;
        for id in ["bob", "carol"] {
            fx.coordinator
                .on_message(ServerMessage::Answer {
                    from: ParticipantId::from(id),
                    answer: SessionDescription::answer(format!("v=0 {id}")),
                })
                .await;
        }
        fx.settle().await;

        assert_eq!(fx.state_of("bob"), None);
        assert_eq!(fx.state_of("carol"), Some(NegotiationState::Connected));
        assert!(fx.backend.connection_for("bob").unwrap().is_closed());
        assert!(fx
            .events()
            .iter()
            .any(|event| matches!(event, MeshEvent::PeerDisconnected(id) if id.as_str() == "bob")));
    }

    #[tokio::test]
    async fn missing_microphone_keeps_client_out_of_the_mesh() {
        let backend = Arc::new(MockBackend::without_microphone());
        let (relay_tx, mut relay) = mpsc::unbounded_channel::<ClientMessage>();
        let (mut coordinator, _mailbox, mut events) =
            MeshCoordinator::new("Dave", backend, Arc::new(relay_tx));
        coordinator.announce().await;

        assert!(relay.try_recv().is_err());
        assert!(matches!(events.try_recv(), Ok(MeshEvent::MediaUnavailable(_))));

        coordinator
            .on_message(ServerMessage::ParticipantJoined {
                participant: Participant::new("bob", "Bob"),
            })
            .await;
        assert!(coordinator.snapshot().is_empty());
    }
}
