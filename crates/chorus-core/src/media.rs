//! Seam between the lifecycle manager and whatever owns the actual media
//! stack. The coordinator only ever talks to a [`MediaBackend`]; the webrtc-rs
//! implementation lives in [`crate::rtc`] and a scripted one in
//! [`crate::mock`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chorus_proto::{IceCandidate, ParticipantId, SessionDescription};
use tokio::sync::mpsc;

use crate::coordinator::MeshInput;
use crate::error::{MediaError, NegotiationError};

/// One peer-to-peer media connection, as seen by the negotiator.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    /// `None` marks the end of the remote candidate stream.
    async fn add_ice_candidate(
        &self,
        candidate: Option<IceCandidate>,
    ) -> Result<(), NegotiationError>;

    async fn close(&self) -> Result<(), NegotiationError>;
}

#[async_trait]
pub trait MediaBackend: Send + Sync + 'static {
    /// Local audio track, shared read-only by every connection.
    type Track: Clone + Send + Sync + 'static;
    type Connection: PeerConnection + 'static;
    /// Whatever the backend hands out when remote audio starts arriving.
    type RemoteStream: Send + 'static;

    async fn acquire_local_track(&self) -> Result<Self::Track, MediaError>;

    /// Open a connection whose callbacks report through `events`.
    async fn open_connection(
        &self,
        events: ConnectionEvents<Self::RemoteStream>,
    ) -> Result<Arc<Self::Connection>, NegotiationError>;

    async fn attach(
        &self,
        track: &Self::Track,
        connection: &Self::Connection,
    ) -> Result<(), NegotiationError>;

    async fn detach(
        &self,
        track: &Self::Track,
        connection: &Self::Connection,
    ) -> Result<(), NegotiationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::New => "new",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Failed => "failed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(label)
    }
}

/// Connection callbacks, turned into values the coordinator can route.
#[derive(Debug)]
pub enum ConnectionEvent<S> {
    /// A locally gathered candidate; `None` once gathering is complete.
    LocalCandidate(Option<IceCandidate>),
    GatheringStateChanged(String),
    StateChanged(ConnectionState),
    RemoteTrack(S),
}

/// Sink handed to [`MediaBackend::open_connection`]. Every event is tagged
/// with the participant and session generation it belongs to, so reports from
/// a connection that has since been replaced can be told apart.
pub struct ConnectionEvents<S> {
    participant_id: ParticipantId,
    generation: u64,
    tx: mpsc::UnboundedSender<MeshInput<S>>,
}

impl<S> Clone for ConnectionEvents<S> {
    fn clone(&self) -> Self {
        Self {
            participant_id: self.participant_id.clone(),
            generation: self.generation,
            tx: self.tx.clone(),
        }
    }
}

impl<S> ConnectionEvents<S> {
    pub(crate) fn new(
        participant_id: ParticipantId,
        generation: u64,
        tx: mpsc::UnboundedSender<MeshInput<S>>,
    ) -> Self {
        Self {
            participant_id,
            generation,
            tx,
        }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns `false` once the coordinator is gone.
    pub fn emit(&self, event: ConnectionEvent<S>) -> bool {
        self.tx
            .send(MeshInput::Connection {
                participant_id: self.participant_id.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}
