/*!
[`RtcBackend`] on top of the `webrtc` crate.

A [`WebRtcFactory`] owns one configured API (default codecs and interceptors)
and opens an `RTCPeerConnection` per remote peer. Connection state changes and
gathered candidates are forwarded as [`BackendEvent`]s on the link's channel.
Every captured device becomes a static sample track on the connection; feeding
encoded samples into it is up to the capture pipeline.
*/

use std::sync::Arc;

use anyhow::{bail, Context};
use async_trait::async_trait;
use log::{debug, warn};
use peercall_protocol::{IceCandidate, UserId};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::peer::backend::{
    BackendEvent, BackendFactory, ConnectionState, RtcBackend, SdpType, SessionDescription,
};
use crate::peer::media::{MediaTrack, TrackKind};
use crate::utils::IceServer;

/// Opens real peer connections.
#[derive(Clone)]
pub struct WebRtcFactory {
    api: Arc<API>,
}

impl WebRtcFactory {
    /// # Errors
    /// Fails when the default codecs or interceptors cannot be registered.
    pub fn new() -> anyhow::Result<Self> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .context("registering default codecs")?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .context("registering default interceptors")?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api: Arc::new(api) })
    }
}

#[async_trait]
impl BackendFactory for WebRtcFactory {
    async fn create(
        &self,
        local: &UserId,
        remote: &UserId,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> anyhow::Result<Box<dyn RtcBackend>> {
        let configuration = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice_servers),
            ..RTCConfiguration::default()
        };
        let connection = self
            .api
            .new_peer_connection(configuration)
            .await
            .with_context(|| format!("opening a peer connection to {remote}"))?;
        watch(&connection, remote, events);
        debug!("peer connection {local} -> {remote} created");
        Ok(Box::new(WebRtcBackend {
            connection: Arc::new(connection),
            stream_id: format!("peercall-{local}"),
            closed: false,
        }))
    }
}

fn rtc_ice_servers(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..RTCIceServer::default()
        })
        .collect()
}

const fn connection_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => ConnectionState::New,
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
    }
}

fn forward(events: &mpsc::UnboundedSender<BackendEvent>, event: BackendEvent) {
    if events.send(event).is_err() {
        debug!("peer connection event dropped, link is gone");
    }
}

fn watch(
    connection: &RTCPeerConnection,
    remote: &UserId,
    events: mpsc::UnboundedSender<BackendEvent>,
) {
    let state_events = events.clone();
    let peer = remote.clone();
    connection.on_peer_connection_state_change(Box::new(
        move |state: RTCPeerConnectionState| {
            debug!("peer connection to {peer} is {state:?}");
            forward(&state_events, BackendEvent::StateChanged(connection_state(state)));
            Box::pin(async {})
        },
    ));

    let peer = remote.clone();
    connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        // `None` marks the end of gathering
        if let Some(candidate) = candidate {
            match candidate.to_json() {
                Ok(init) => forward(
                    &events,
                    BackendEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_m_line_index: init.sdp_mline_index,
                    }),
                ),
                Err(err) => warn!("could not serialize a candidate for {peer}: {err}"),
            }
        }
        Box::pin(async {})
    }));
}

pub struct WebRtcBackend {
    connection: Arc<RTCPeerConnection>,
    stream_id: String,
    closed: bool,
}

fn rtc_description(description: SessionDescription) -> anyhow::Result<RTCSessionDescription> {
    let parsed = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
    };
    parsed.context("malformed session description")
}

#[async_trait]
impl RtcBackend for WebRtcBackend {
    async fn create_offer(&mut self) -> anyhow::Result<String> {
        let offer = self
            .connection
            .create_offer(None)
            .await
            .context("creating offer")?;
        Ok(offer.sdp)
    }

    async fn create_answer(&mut self) -> anyhow::Result<String> {
        let answer = self
            .connection
            .create_answer(None)
            .await
            .context("creating answer")?;
        Ok(answer.sdp)
    }

    async fn set_local_description(&mut self, description: SessionDescription) -> anyhow::Result<()> {
        self.connection
            .set_local_description(rtc_description(description)?)
            .await
            .context("applying local description")
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> anyhow::Result<()> {
        self.connection
            .set_remote_description(rtc_description(description)?)
            .await
            .context("applying remote description")
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> anyhow::Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };
        self.connection
            .add_ice_candidate(init)
            .await
            .context("applying remote candidate")
    }

    async fn add_track(&mut self, track: &MediaTrack) -> anyhow::Result<()> {
        if track.is_stopped() {
            bail!("track {} is stopped", track.id());
        }
        let mime_type = match track.kind() {
            TrackKind::Audio => MIME_TYPE_OPUS,
            TrackKind::Video => MIME_TYPE_VP8,
        };
        let local: Arc<dyn TrackLocal + Send + Sync> = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: mime_type.to_owned(),
                ..RTCRtpCodecCapability::default()
            },
            track.id().to_owned(),
            self.stream_id.clone(),
        ));
        self.connection
            .add_track(local)
            .await
            .with_context(|| format!("adding track {}", track.id()))?;
        Ok(())
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let connection = Arc::clone(&self.connection);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = connection.close().await {
                        warn!("closing peer connection: {err}");
                    }
                });
            }
            Err(_) => warn!("no runtime left to close the peer connection on"),
        }
    }
}
