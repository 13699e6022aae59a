//! webrtc-rs implementation of [`MediaBackend`].

mod config;

pub use config::{with_scheme, IceServerConfig, IceServerKind, RtcSettings, DEFAULT_STUN_URL};

use std::sync::Arc;

use async_trait::async_trait;
use chorus_proto::{IceCandidate, SdpKind, SessionDescription};
use parking_lot::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::error::{MediaError, NegotiationError};
use crate::media::{
    ConnectionEvent, ConnectionEvents, ConnectionState, MediaBackend, PeerConnection,
};

/// Remote audio as delivered by [`MeshEvent::RemoteTrackReady`](crate::MeshEvent).
pub type RemoteAudio = Arc<TrackRemote>;

const TRACK_ID: &str = "audio";
const STREAM_ID: &str = "chorus";

pub struct WebRtcBackend {
    api: API,
    settings: RtcSettings,
}

impl WebRtcBackend {
    pub fn new(settings: RtcSettings) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api, settings })
    }

    pub fn settings(&self) -> &RtcSettings {
        &self.settings
    }
}

#[async_trait]
impl MediaBackend for WebRtcBackend {
    type Track = Arc<TrackLocalStaticSample>;
    type Connection = WebRtcConnection;
    type RemoteStream = RemoteAudio;

    /// A 48 kHz stereo Opus track. Capture code writes samples into it; every
    /// connection sends the same track.
    async fn acquire_local_track(&self) -> Result<Self::Track, MediaError> {
        Ok(Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            TRACK_ID.to_owned(),
            STREAM_ID.to_owned(),
        )))
    }

    async fn open_connection(
        &self,
        events: ConnectionEvents<Self::RemoteStream>,
    ) -> Result<Arc<WebRtcConnection>, NegotiationError> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(self.settings.to_rtc_configuration())
                .await?,
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let candidate = match candidate {
                    None => None,
                    Some(candidate) => match candidate.to_json() {
                        Ok(init) => Some(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }),
                        Err(err) => {
                            tracing::warn!(
                                target = "webrtc",
                                participant = %events.participant_id(),
                                error = %err,
                                "failed to serialize local candidate"
                            );
                            return;
                        }
                    },
                };
                events.emit(ConnectionEvent::LocalCandidate(candidate));
            })
        }));

        let gathering_events = events.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            gathering_events.emit(ConnectionEvent::GatheringStateChanged(state.to_string()));
            Box::pin(async {})
        }));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let state = match state {
                RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                RTCPeerConnectionState::Connected => ConnectionState::Connected,
                RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                RTCPeerConnectionState::Failed => ConnectionState::Failed,
                RTCPeerConnectionState::Closed => ConnectionState::Closed,
                _ => ConnectionState::New,
            };
            state_events.emit(ConnectionEvent::StateChanged(state));
            Box::pin(async {})
        }));

        let track_events = events;
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                if track.kind() == RTPCodecType::Audio {
                    track_events.emit(ConnectionEvent::RemoteTrack(track));
                } else {
                    tracing::debug!(
                        target = "webrtc",
                        participant = %track_events.participant_id(),
                        kind = ?track.kind(),
                        "ignoring non-audio track"
                    );
                }
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(WebRtcConnection {
            pc,
            sender: Mutex::new(None),
        }))
    }

    async fn attach(
        &self,
        track: &Self::Track,
        connection: &WebRtcConnection,
    ) -> Result<(), NegotiationError> {
        let sender = connection
            .pc
            .add_track(Arc::clone(track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;
        *connection.sender.lock() = Some(sender);
        Ok(())
    }

    async fn detach(
        &self,
        _track: &Self::Track,
        connection: &WebRtcConnection,
    ) -> Result<(), NegotiationError> {
        let sender = connection.sender.lock().take();
        if let Some(sender) = sender {
            connection.pc.remove_track(&sender).await?;
        }
        Ok(())
    }
}

pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

impl WebRtcConnection {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        from_rtc(self.pc.create_offer(None).await?)
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        from_rtc(self.pc.create_answer(None).await?)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        candidate: Option<IceCandidate>,
    ) -> Result<(), NegotiationError> {
        // An empty candidate string tells the agent no more are coming.
        let init = match candidate {
            Some(candidate) => RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            },
            None => RTCIceCandidateInit::default(),
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc.close().await?;
        Ok(())
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription, NegotiationError> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.map_err(|err| NegotiationError::InvalidDescription(err.to_string()))
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription, NegotiationError> {
    match description.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(description.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(description.sdp)),
        other => Err(NegotiationError::InvalidDescription(format!(
            "unsupported description type {other}"
        ))),
    }
}
