use chorus_core::{MeshError, NegotiationError, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("display name must not be empty")]
    EmptyName,
    #[error("TURN server {url} needs both --turn-username and --turn-credential")]
    MissingTurnCredentials { url: String },
    #[error("TURN credentials given without --turn-url")]
    OrphanTurnCredentials,
    #[error("invalid signaling url '{url}': {reason}")]
    InvalidSignalingUrl { url: String, reason: String },
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("signaling relay error: {0}")]
    Relay(#[from] TransportError),
    #[error("media stack setup failed: {0}")]
    Media(#[from] NegotiationError),
    #[error("{0}")]
    Mesh(#[from] MeshError),
}
