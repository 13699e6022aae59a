use std::fmt;
use std::sync::Arc;

use chorus_proto::{IceCandidate, Participant, ParticipantId};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::candidate_buffer::CandidateBuffer;
use crate::error::NegotiationError;
use crate::negotiator::SessionCommand;
use crate::registry::SessionEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// We sent the offer: the remote participant joined after us.
    Initiator,
    /// We answered an offer from a participant that was already present.
    Responder,
}

/// Negotiation progress of one peer session.
///
/// ```text
/// Idle ──▶ OfferSent ─────────────────────┐            (initiator)
/// Idle ──▶ OfferReceived ──▶ AnswerSent ──┴─▶ Connected (responder)
/// any ──▶ Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    Connected,
    Closed,
}

impl NegotiationState {
    pub fn is_closed(self) -> bool {
        self == NegotiationState::Closed
    }

    /// Whether a session in `role` may move from `self` to `next`.
    pub fn permits(self, role: Role, next: NegotiationState) -> bool {
        use NegotiationState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, OfferSent) => role == Role::Initiator,
            (Idle, OfferReceived) => role == Role::Responder,
            (OfferReceived, AnswerSent) => role == Role::Responder,
            (OfferSent, Connected) => role == Role::Initiator,
            (AnswerSent, Connected) => role == Role::Responder,
            _ => false,
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::OfferSent => "offer-sent",
            NegotiationState::OfferReceived => "offer-received",
            NegotiationState::AnswerSent => "answer-sent",
            NegotiationState::Connected => "connected",
            NegotiationState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// One negotiated connection to one remote participant. Owned by the
/// session's negotiation task; the registry only holds a [`SessionHandle`].
pub struct PeerSession<C> {
    participant: Participant,
    role: Role,
    generation: u64,
    state: watch::Sender<NegotiationState>,
    connection: Arc<C>,
    pub(crate) candidates: CandidateBuffer<Option<IceCandidate>>,
}

impl<C> PeerSession<C> {
    pub fn new(
        participant: Participant,
        role: Role,
        generation: u64,
        connection: Arc<C>,
    ) -> (Self, watch::Receiver<NegotiationState>) {
        let (state, state_rx) = watch::channel(NegotiationState::Idle);
        let session = Self {
            participant,
            role,
            generation,
            state,
            connection,
            candidates: CandidateBuffer::new(),
        };
        (session, state_rx)
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn advance(&mut self, next: NegotiationState) -> Result<(), NegotiationError> {
        let current = self.state();
        if !current.permits(self.role, next) {
            return Err(NegotiationError::IllegalTransition {
                from: current,
                to: next,
            });
        }
        self.state.send_replace(next);
        tracing::debug!(
            target = "mesh",
            participant = %self.participant.id,
            generation = self.generation,
            from = %current,
            to = %next,
            "session transition"
        );
        Ok(())
    }

    /// Force the terminal state. Returns `false` if the session was already closed.
    pub fn close(&mut self) -> bool {
        if self.state().is_closed() {
            return false;
        }
        let dropped = self.candidates.discard();
        self.state.send_replace(NegotiationState::Closed);
        tracing::debug!(
            target = "mesh",
            participant = %self.participant.id,
            generation = self.generation,
            dropped_candidates = dropped,
            "session closed"
        );
        true
    }
}

/// Registry-side view of a running session: enough to observe it, feed it
/// events, and tear it down.
pub(crate) struct SessionHandle<C> {
    pub(crate) participant: Participant,
    pub(crate) role: Role,
    pub(crate) generation: u64,
    pub(crate) state: watch::Receiver<NegotiationState>,
    pub(crate) commands: mpsc::UnboundedSender<SessionCommand>,
    pub(crate) task: JoinHandle<()>,
    pub(crate) connection: Arc<C>,
    pub(crate) announced: bool,
}

impl<C> SessionHandle<C> {
    pub(crate) fn send(&self, command: SessionCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!(
                target = "mesh",
                participant = %self.participant.id,
                generation = self.generation,
                "session task already finished; dropping command"
            );
        }
    }
}

impl<C> SessionEntry for SessionHandle<C> {
    fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }
}

/// Point-in-time description of a session, for callers outside the actor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub participant: ParticipantId,
    pub display_name: String,
    pub role: Role,
    pub state: NegotiationState,
}
