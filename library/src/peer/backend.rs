use std::fmt::{Display, Formatter};

use async_trait::async_trait;
use peercall_protocol::{IceCandidate, UserId};
use tokio::sync::mpsc;

use crate::peer::media::MediaTrack;
use crate::utils::IceServer;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    #[must_use]
    pub const fn offer(sdp: String) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp,
        }
    }

    #[must_use]
    pub const fn answer(sdp: String) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp,
        }
    }
}

/// Transport state of a single peer connection.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the link carries no more media.
    #[must_use]
    pub const fn is_down(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Asynchronous notifications raised by a backend.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum BackendEvent {
    StateChanged(ConnectionState),
    /// Locally gathered candidate that has to reach the remote peer.
    LocalCandidate(IceCandidate),
}

/// The media engine behind a single peer connection.
#[async_trait]
pub trait RtcBackend: Send + Sync {
    async fn create_offer(&mut self) -> anyhow::Result<String>;

    async fn create_answer(&mut self) -> anyhow::Result<String>;

    async fn set_local_description(&mut self, description: SessionDescription) -> anyhow::Result<()>;

    async fn set_remote_description(&mut self, description: SessionDescription)
        -> anyhow::Result<()>;

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> anyhow::Result<()>;

    async fn add_track(&mut self, track: &MediaTrack) -> anyhow::Result<()>;

    /// Starts closing the connection, without waiting for the engine to finish.
    fn close(&mut self);
}

/// Creates one backend per remote peer.
#[async_trait]
pub trait BackendFactory: Send + Sync {
    /// # Errors
    /// Fails when the media engine refuses to create a connection.
    async fn create(
        &self,
        local: &UserId,
        remote: &UserId,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> anyhow::Result<Box<dyn RtcBackend>>;
}
