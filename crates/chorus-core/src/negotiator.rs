//! Per-session offer/answer/candidate driver.
//!
//! Each session runs one `Negotiator` on its own task. Commands for the
//! session are processed strictly in order, so a local candidate produced
//! while the offer is being set up is only forwarded after the offer itself
//! has gone out, and a remote candidate can never overtake the remote
//! description it depends on.

use std::sync::Arc;

use chorus_proto::{ClientMessage, IceCandidate, SessionDescription};
use tokio::sync::mpsc;

use crate::coordinator::MeshInput;
use crate::error::NegotiationError;
use crate::media::{MediaBackend, PeerConnection};
use crate::relay::RelaySink;
use crate::session::{NegotiationState, PeerSession, Role};

#[derive(Debug)]
pub enum SessionCommand {
    /// Initiator path: attach, offer, send the call.
    Initiate,
    /// Responder path for a received offer.
    Respond(SessionDescription),
    ApplyAnswer(SessionDescription),
    RemoteCandidate(Option<IceCandidate>),
    LocalCandidate(Option<IceCandidate>),
    TransportUp,
    TransportFailed(String),
    MediaFlowing,
}

pub(crate) struct Negotiator<B: MediaBackend> {
    session: PeerSession<B::Connection>,
    backend: Arc<B>,
    track: B::Track,
    local_name: String,
    relay: Arc<dyn RelaySink>,
    reports: mpsc::UnboundedSender<MeshInput<B::RemoteStream>>,
}

impl<B: MediaBackend> Negotiator<B> {
    pub(crate) fn new(
        session: PeerSession<B::Connection>,
        backend: Arc<B>,
        track: B::Track,
        local_name: String,
        relay: Arc<dyn RelaySink>,
        reports: mpsc::UnboundedSender<MeshInput<B::RemoteStream>>,
    ) -> Self {
        Self {
            session,
            backend,
            track,
            local_name,
            relay,
            reports,
        }
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        while let Some(command) = commands.recv().await {
            if let Err(err) = self.handle(command).await {
                self.fail(err).await;
            }
            if self.session.state().is_closed() {
                break;
            }
        }
        tracing::trace!(
            target = "mesh",
            participant = %self.session.participant_id(),
            generation = self.session.generation(),
            "negotiator finished"
        );
    }

    async fn handle(&mut self, command: SessionCommand) -> Result<(), NegotiationError> {
        match command {
            SessionCommand::Initiate => self.initiate().await,
            SessionCommand::Respond(offer) => self.respond(offer).await,
            SessionCommand::ApplyAnswer(answer) => self.apply_answer(answer).await,
            SessionCommand::RemoteCandidate(candidate) => {
                self.apply_remote_candidate(candidate).await
            }
            SessionCommand::LocalCandidate(candidate) => self.forward_local_candidate(candidate),
            SessionCommand::TransportUp | SessionCommand::MediaFlowing => self.mark_connected(),
            SessionCommand::TransportFailed(reason) => {
                Err(NegotiationError::ConnectionFailed(reason))
            }
        }
    }

    async fn initiate(&mut self) -> Result<(), NegotiationError> {
        if self.session.role() != Role::Initiator || self.session.state() != NegotiationState::Idle
        {
            tracing::warn!(
                target = "mesh",
                participant = %self.session.participant_id(),
                state = %self.session.state(),
                "ignoring initiate for a session that is not an idle initiator"
            );
            return Ok(());
        }

        let connection = Arc::clone(self.session.connection());
        self.backend.attach(&self.track, &connection).await?;
        let offer = connection.create_offer().await?;
        connection.set_local_description(offer.clone()).await?;
        self.transition(NegotiationState::OfferSent)?;

        self.relay.send(ClientMessage::Call {
            target: self.session.participant_id().clone(),
            sender_name: self.local_name.clone(),
            offer,
        })?;
        tracing::debug!(
            target = "mesh",
            participant = %self.session.participant_id(),
            generation = self.session.generation(),
            "offer sent"
        );
        Ok(())
    }

    async fn respond(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        self.transition(NegotiationState::OfferReceived)?;

        let connection = Arc::clone(self.session.connection());
        self.backend.attach(&self.track, &connection).await?;
        connection.set_remote_description(offer).await?;
        self.drain_candidates(&connection).await?;

        let answer = connection.create_answer().await?;
        connection.set_local_description(answer.clone()).await?;
        self.transition(NegotiationState::AnswerSent)?;

        self.relay.send(ClientMessage::Answer {
            target: self.session.participant_id().clone(),
            answer,
        })?;
        tracing::debug!(
            target = "mesh",
            participant = %self.session.participant_id(),
            generation = self.session.generation(),
            "answer sent"
        );
        Ok(())
    }

    async fn apply_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.session.state() != NegotiationState::OfferSent {
            tracing::warn!(
                target = "mesh",
                participant = %self.session.participant_id(),
                state = %self.session.state(),
                "answer arrived while no offer is outstanding; dropping"
            );
            return Ok(());
        }

        let connection = Arc::clone(self.session.connection());
        connection.set_remote_description(answer).await?;
        self.drain_candidates(&connection).await?;
        self.transition(NegotiationState::Connected)
    }

    async fn apply_remote_candidate(
        &mut self,
        candidate: Option<IceCandidate>,
    ) -> Result<(), NegotiationError> {
        let connection = Arc::clone(self.session.connection());
        let conn = &*connection;
        let applied = self
            .session
            .candidates
            .enqueue(candidate, move |candidate| conn.add_ice_candidate(candidate))
            .await?;
        if !applied {
            tracing::trace!(
                target = "mesh",
                participant = %self.session.participant_id(),
                buffered = self.session.candidates.len(),
                "buffered remote candidate until the remote description is set"
            );
        }
        Ok(())
    }

    async fn drain_candidates(
        &mut self,
        connection: &B::Connection,
    ) -> Result<(), NegotiationError> {
        let applied = self
            .session
            .candidates
            .drain_into(move |candidate| connection.add_ice_candidate(candidate))
            .await?;
        if applied > 0 {
            tracing::debug!(
                target = "mesh",
                participant = %self.session.participant_id(),
                applied,
                "applied buffered remote candidates"
            );
        }
        Ok(())
    }

    fn forward_local_candidate(
        &mut self,
        candidate: Option<IceCandidate>,
    ) -> Result<(), NegotiationError> {
        if self.session.state() == NegotiationState::Idle {
            // Nothing has been sent yet; the peer would have no session for it.
            tracing::debug!(
                target = "mesh",
                participant = %self.session.participant_id(),
                "local candidate before any descriptor; dropping"
            );
            return Ok(());
        }
        self.relay.send(ClientMessage::Candidate {
            target: self.session.participant_id().clone(),
            candidate,
        })?;
        Ok(())
    }

    fn mark_connected(&mut self) -> Result<(), NegotiationError> {
        if self.session.state() == NegotiationState::AnswerSent {
            self.transition(NegotiationState::Connected)?;
        }
        Ok(())
    }

    fn transition(&mut self, next: NegotiationState) -> Result<(), NegotiationError> {
        self.session.advance(next)?;
        let _ = self.reports.send(MeshInput::SessionState {
            participant_id: self.session.participant_id().clone(),
            generation: self.session.generation(),
            state: next,
        });
        Ok(())
    }

    /// Release everything this session holds. Other sessions are untouched.
    async fn fail(&mut self, error: NegotiationError) {
        let connection = Arc::clone(self.session.connection());
        if let Err(err) = self.backend.detach(&self.track, &connection).await {
            tracing::debug!(
                target = "mesh",
                participant = %self.session.participant_id(),
                error = %err,
                "detach after failure"
            );
        }
        if let Err(err) = connection.close().await {
            tracing::debug!(
                target = "mesh",
                participant = %self.session.participant_id(),
                error = %err,
                "close after failure"
            );
        }
        if self.session.close() {
            let _ = self.reports.send(MeshInput::SessionFailed {
                participant_id: self.session.participant_id().clone(),
                generation: self.session.generation(),
                error,
            });
        }
    }
}
