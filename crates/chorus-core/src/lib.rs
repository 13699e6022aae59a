//! Signaling-driven connection lifecycle manager for full-mesh audio
//! conferencing.
//!
//! A [`MeshCoordinator`] runs per client. It listens to the signaling relay,
//! opens one [`PeerSession`] per remote participant, and drives each through
//! offer/answer negotiation on its own task while buffering remote candidates
//! that arrive before the remote description.

pub mod candidate_buffer;
pub mod coordinator;
pub mod error;
pub mod media;
pub mod mock;
pub mod negotiator;
pub mod registry;
pub mod relay;
pub mod rtc;
pub mod session;

pub use candidate_buffer::CandidateBuffer;
pub use coordinator::{Mailbox, MeshCommand, MeshCoordinator, MeshEvent, MeshHandle, MeshInput};
pub use error::{MediaError, MeshError, NegotiationError, RegistryError, TransportError};
pub use media::{ConnectionEvent, ConnectionEvents, ConnectionState, MediaBackend, PeerConnection};
pub use negotiator::SessionCommand;
pub use registry::{PeerRegistry, SessionEntry};
pub use relay::RelaySink;
pub use rtc::{IceServerConfig, RtcSettings, WebRtcBackend};
pub use session::{NegotiationState, PeerSession, Role, SessionSnapshot};
