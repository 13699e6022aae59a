use chorus_proto::ParticipantId;
use thiserror::Error;

use crate::session::NegotiationState;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("participant {0} already has an active session")]
    DuplicateSession(ParticipantId),
    #[error("no session for participant {0}")]
    NotFound(ParticipantId),
}

/// Failure confined to a single peer session.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("illegal transition from {from:?} to {to:?}")]
    IllegalTransition {
        from: NegotiationState,
        to: NegotiationState,
    },
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("relay unavailable: {0}")]
    Relay(#[from] TransportError),
    #[error("media backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("local audio track unavailable: {0}")]
    Unavailable(String),
    #[error("local audio track has not been acquired")]
    NotAcquired,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("relay channel closed")]
    ChannelClosed,
    #[error("relay setup failed: {0}")]
    Setup(String),
    #[error("relay encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("stale {kind} from {from}: no session")]
    StaleMessage {
        kind: &'static str,
        from: ParticipantId,
    },
    #[error("negotiation with {participant} failed: {source}")]
    Negotiation {
        participant: ParticipantId,
        #[source]
        source: NegotiationError,
    },
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("mesh coordinator has stopped")]
    Stopped,
}
