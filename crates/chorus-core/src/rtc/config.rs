use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceServerKind {
    Stun,
    Turn,
}

impl IceServerKind {
    fn scheme(self) -> &'static str {
        match self {
            IceServerKind::Stun => "stun:",
            IceServerKind::Turn => "turn:",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub kind: IceServerKind,
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServerConfig {
    pub fn stun(url: &str) -> Self {
        Self {
            kind: IceServerKind::Stun,
            urls: vec![with_scheme(url, IceServerKind::Stun)],
            username: None,
            credential: None,
        }
    }

    pub fn turn(url: &str, username: &str, credential: &str) -> Self {
        Self {
            kind: IceServerKind::Turn,
            urls: vec![with_scheme(url, IceServerKind::Turn)],
            username: Some(username.to_string()),
            credential: Some(credential.to_string()),
        }
    }

    fn to_rtc_ice_server(&self) -> RTCIceServer {
        RTCIceServer {
            urls: self.urls.clone(),
            username: self.username.clone().unwrap_or_default(),
            credential: self.credential.clone().unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Prefix `url` with a scheme matching `kind` unless it already has one.
pub fn with_scheme(url: &str, kind: IceServerKind) -> String {
    let url = url.trim();
    if ["stun:", "stuns:", "turn:", "turns:"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
    {
        url.to_string()
    } else {
        format!("{}{}", kind.scheme(), url)
    }
}

/// Everything the webrtc backend needs to open peer connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcSettings {
    pub ice_servers: Vec<IceServerConfig>,
}

impl Default for RtcSettings {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServerConfig::stun(DEFAULT_STUN_URL)],
        }
    }
}

impl RtcSettings {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Self {
        Self { ice_servers }
    }

    pub fn to_rtc_configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(IceServerConfig::to_rtc_ice_server)
                .collect(),
            ..Default::default()
        }
    }
}
