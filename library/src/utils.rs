use serde::{Deserialize, Serialize};

pub(crate) const STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// A single entry of the ICE server list handed to a peer connection backend.
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    fn open(url: &str) -> Self {
        Self {
            urls: vec![url.to_owned()],
            username: None,
            credential: None,
        }
    }
}

/// Specifies what kind of peer connection to create
#[derive(Serialize, Deserialize, Debug, Clone, Eq, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ConnectionType {
    /// Within local network
    Local,
    /// Setup with STUN server, WAN capabilities but can fail
    Stun { url: String },
    /// Setup with STUN and TURN servers, will fallback to TURN if needed, most stable connection
    StunAndTurn {
        stun_url: String,
        turn_url: String,
        username: String,
        credential: String,
    },
}

impl ConnectionType {
    /// ICE servers a peer connection should be configured with.
    #[must_use]
    pub fn ice_servers(&self) -> Vec<IceServer> {
        match self {
            Self::Local => Vec::new(),
            Self::Stun { url } => vec![IceServer::open(url)],
            Self::StunAndTurn {
                stun_url,
                turn_url,
                username,
                credential,
            } => vec![
                IceServer::open(stun_url),
                IceServer {
                    urls: vec![turn_url.clone()],
                    username: Some(username.clone()),
                    credential: Some(credential.clone()),
                },
            ],
        }
    }
}

impl Default for ConnectionType {
    fn default() -> Self {
        Self::Stun {
            url: STUN_SERVER.to_owned(),
        }
    }
}
