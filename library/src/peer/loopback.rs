/*!
In-process [`RtcBackend`] that negotiates without a media engine.

It produces syntactically valid SDP, gathers a single host candidate once a
local description is set and reports the link as connected as soon as both
descriptions are in place. Backends created by the same [`LoopbackFactory`]
know each other through the session id in their SDP: closing a connected
backend reports `disconnected` on its counterpart, the way a remote hangup
surfaces on a real connection. Tests drive other transport failures through
[`LoopbackFactory::inject`].
*/

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use log::debug;
use peercall_protocol::{IceCandidate, UserId};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::peer::backend::{
    BackendEvent, BackendFactory, ConnectionState, RtcBackend, SdpType, SessionDescription,
};
use crate::peer::media::MediaTrack;
use crate::utils::IceServer;

#[derive(Debug, Clone)]
struct LinkHandle {
    local: UserId,
    remote: UserId,
    session: String,
    events: mpsc::UnboundedSender<BackendEvent>,
}

type Links = Arc<Mutex<Vec<LinkHandle>>>;

/// Creates [`LoopbackBackend`]s and keeps a handle on each of them.
#[derive(Debug, Clone, Default)]
pub struct LoopbackFactory {
    links: Links,
}

impl LoopbackFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of backends created so far.
    #[must_use]
    pub fn created(&self) -> usize {
        self.links.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Reports `state` on the most recent link from `local` to `remote`.
    /// Returns whether such a link exists.
    pub fn inject(&self, local: &UserId, remote: &UserId, state: ConnectionState) -> bool {
        let links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        links
            .iter()
            .rev()
            .find(|link| &link.local == local && &link.remote == remote)
            .is_some_and(|link| link.events.send(BackendEvent::StateChanged(state)).is_ok())
    }
}

#[async_trait]
impl BackendFactory for LoopbackFactory {
    async fn create(
        &self,
        local: &UserId,
        remote: &UserId,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> anyhow::Result<Box<dyn RtcBackend>> {
        debug!(
            "loopback link {local} -> {remote} with {} ice servers",
            ice_servers.len()
        );
        let mut backend = LoopbackBackend::new(events.clone());
        backend.links = Some(Arc::clone(&self.links));
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(LinkHandle {
                local: local.clone(),
                remote: remote.clone(),
                session: backend.session.clone(),
                events,
            });
        Ok(Box::new(backend))
    }
}

pub struct LoopbackBackend {
    session: String,
    local: Option<SdpType>,
    remote: Option<SdpType>,
    remote_session: Option<String>,
    candidates: HashSet<IceCandidate>,
    tracks: usize,
    state: ConnectionState,
    gathered: bool,
    events: mpsc::UnboundedSender<BackendEvent>,
    links: Option<Links>,
}

impl LoopbackBackend {
    #[must_use]
    pub fn new(events: mpsc::UnboundedSender<BackendEvent>) -> Self {
        Self {
            session: Uuid::new_v4().simple().to_string(),
            local: None,
            remote: None,
            remote_session: None,
            candidates: HashSet::new(),
            tracks: 0,
            state: ConnectionState::New,
            gathered: false,
            events,
            links: None,
        }
    }

    fn description(&self, sdp_type: SdpType) -> String {
        let kind = match sdp_type {
            SdpType::Offer => "offer",
            SdpType::Answer => "answer",
        };
        format!(
            "v=0\r\no=- {} 1 IN IP4 127.0.0.1\r\ns=peercall\r\nt=0 0\r\na=tracks:{}\r\na=loopback:{kind}\r\n",
            self.session, self.tracks
        )
    }

    fn ensure_open(&self) -> anyhow::Result<()> {
        if self.state == ConnectionState::Closed {
            bail!("peer connection is closed");
        }
        Ok(())
    }

    fn emit(&self, event: BackendEvent) {
        if self.events.send(event).is_err() {
            debug!("loopback event dropped, link is gone");
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.emit(BackendEvent::StateChanged(state));
    }

    fn maybe_connect(&mut self) {
        if self.local.is_some() && self.remote.is_some() && self.state == ConnectionState::New {
            self.set_state(ConnectionState::Connecting);
            self.set_state(ConnectionState::Connected);
        }
    }

    /// Tells the backend on the other end of a connected link that it lost us.
    fn notify_counterpart(&self) {
        let (Some(links), Some(remote)) = (self.links.as_ref(), self.remote_session.as_deref())
        else {
            return;
        };
        let links = links.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(counterpart) = links.iter().find(|link| link.session == remote) else {
            return;
        };
        let event = BackendEvent::StateChanged(ConnectionState::Disconnected);
        if counterpart.events.send(event).is_err() {
            debug!(
                "loopback link {} -> {} is already gone",
                counterpart.local, counterpart.remote
            );
        }
    }
}

fn check_sdp(description: &SessionDescription) -> anyhow::Result<()> {
    if !description.sdp.starts_with("v=0") {
        bail!("malformed {:?} description", description.sdp_type);
    }
    Ok(())
}

/// Session id from the `o=` line of a description.
fn origin_session(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o=- "))
        .and_then(|origin| origin.split_whitespace().next())
}

#[async_trait]
impl RtcBackend for LoopbackBackend {
    async fn create_offer(&mut self) -> anyhow::Result<String> {
        self.ensure_open()?;
        Ok(self.description(SdpType::Offer))
    }

    async fn create_answer(&mut self) -> anyhow::Result<String> {
        self.ensure_open()?;
        if self.remote != Some(SdpType::Offer) {
            bail!("cannot answer without a remote offer");
        }
        Ok(self.description(SdpType::Answer))
    }

    async fn set_local_description(&mut self, description: SessionDescription) -> anyhow::Result<()> {
        self.ensure_open()?;
        check_sdp(&description)?;
        self.local = Some(description.sdp_type);
        if !self.gathered {
            self.gathered = true;
            let candidate = format!(
                "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host",
                49152_u32.saturating_add(u32::try_from(self.tracks).unwrap_or(0))
            );
            self.emit(BackendEvent::LocalCandidate(IceCandidate::new(candidate)));
        }
        self.maybe_connect();
        Ok(())
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> anyhow::Result<()> {
        self.ensure_open()?;
        check_sdp(&description)?;
        self.remote = Some(description.sdp_type);
        self.remote_session = origin_session(&description.sdp).map(str::to_owned);
        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> anyhow::Result<()> {
        self.ensure_open()?;
        if self.remote.is_none() {
            bail!("remote description not set");
        }
        if !candidate.candidate.starts_with("candidate:") {
            bail!("malformed candidate {:?}", candidate.candidate);
        }
        if !self.candidates.insert(candidate.clone()) {
            return Err(anyhow!("duplicate candidate {:?}", candidate.candidate));
        }
        Ok(())
    }

    async fn add_track(&mut self, track: &MediaTrack) -> anyhow::Result<()> {
        self.ensure_open()?;
        if track.is_stopped() {
            bail!("track {} is stopped", track.id());
        }
        self.tracks = self.tracks.saturating_add(1);
        Ok(())
    }

    fn close(&mut self) {
        let was_connected = self.state == ConnectionState::Connected;
        self.state = ConnectionState::Closed;
        if was_connected {
            self.notify_counterpart();
        }
    }
}
