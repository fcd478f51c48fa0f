/*!
One negotiated media link to one remote peer.

[`PeerConnectionManager`] drives the offer/answer exchange over a [`SignalSink`],
buffers remote ICE candidates until a remote description is in place and
republishes the backend's transport state to typed observers.
*/

mod backend;
pub mod engine;
pub mod loopback;
pub mod media;

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info, warn};
use peercall_protocol::{IceCandidate, RoomId, SignalMessage, UserId};
use tokio::sync::mpsc;

pub use backend::{
    BackendEvent, BackendFactory, ConnectionState, RtcBackend, SdpType, SessionDescription,
};

use crate::events::Observers;
use crate::peer::media::{LocalStream, MediaTrack};
use crate::signaling::SignalSink;
use crate::{Error, Result};

/// Where the offer/answer exchange currently stands.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Negotiation {
    /// Nothing exchanged yet.
    New,
    /// Local offer sent, waiting for the remote answer.
    AwaitingAnswer,
    /// Both descriptions are set.
    Stable,
}

pub struct PeerConnectionManager {
    room_id: RoomId,
    local: UserId,
    remote: UserId,
    backend: Box<dyn RtcBackend>,
    signaling: Arc<dyn SignalSink>,
    negotiation: Negotiation,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    state: ConnectionState,
    observers: Observers<ConnectionState>,
    tracks: Vec<MediaTrack>,
    closed: bool,
}

impl PeerConnectionManager {
    #[must_use]
    pub fn new(
        room_id: RoomId,
        local: UserId,
        remote: UserId,
        backend: Box<dyn RtcBackend>,
        signaling: Arc<dyn SignalSink>,
    ) -> Self {
        Self {
            room_id,
            local,
            remote,
            backend,
            signaling,
            negotiation: Negotiation::New,
            remote_description_set: false,
            pending_candidates: VecDeque::new(),
            state: ConnectionState::New,
            observers: Observers::default(),
            tracks: Vec::new(),
            closed: false,
        }
    }

    #[must_use]
    pub fn remote(&self) -> &UserId {
        &self.remote
    }

    #[must_use]
    pub const fn negotiation(&self) -> Negotiation {
        self.negotiation
    }

    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Candidates received before the remote description, in arrival order.
    #[must_use]
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ConnectionState> {
        self.observers.subscribe()
    }

    /// Attaches a handle on every track of `stream` to this link.
    ///
    /// # Errors
    /// Fails when the link is closed or the backend rejects a track.
    pub async fn add_local_stream(&mut self, stream: &LocalStream) -> Result<()> {
        self.ensure_open()?;
        for track in stream.tracks() {
            let handle = track.clone_handle();
            self.backend.add_track(&handle).await?;
            self.tracks.push(handle);
        }
        Ok(())
    }

    /// Creates the local offer, applies it and sends it to the remote peer.
    ///
    /// # Errors
    /// Fails when an offer was already made or received, or the backend fails.
    pub async fn create_offer(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.ensure_negotiation(Negotiation::New, "create an offer")?;

        let sdp = self.backend.create_offer().await?;
        self.backend
            .set_local_description(SessionDescription::offer(sdp.clone()))
            .await?;
        self.negotiation = Negotiation::AwaitingAnswer;
        debug!("sending offer {} -> {}", self.local, self.remote);
        self.signaling.send_signal(SignalMessage::offer(
            self.room_id.clone(),
            self.local.clone(),
            self.remote.clone(),
            sdp,
        ))
    }

    /// Applies a remote offer and replies with an answer.
    ///
    /// # Errors
    /// Fails when this side already negotiated, or the backend rejects the offer.
    pub async fn handle_offer(&mut self, sdp: String) -> Result<()> {
        self.ensure_open()?;
        self.ensure_negotiation(Negotiation::New, "accept an offer")?;

        self.backend
            .set_remote_description(SessionDescription::offer(sdp))
            .await?;
        self.remote_description_set = true;
        self.flush_candidates().await;

        let answer = self.backend.create_answer().await?;
        self.backend
            .set_local_description(SessionDescription::answer(answer.clone()))
            .await?;
        self.negotiation = Negotiation::Stable;
        debug!("sending answer {} -> {}", self.local, self.remote);
        self.signaling.send_signal(SignalMessage::answer(
            self.room_id.clone(),
            self.local.clone(),
            self.remote.clone(),
            answer,
        ))
    }

    /// Applies the remote answer to our outstanding offer.
    ///
    /// # Errors
    /// Fails when no offer is outstanding, the link state is left untouched.
    pub async fn handle_answer(&mut self, sdp: String) -> Result<()> {
        self.ensure_open()?;
        self.ensure_negotiation(Negotiation::AwaitingAnswer, "accept an answer")?;

        self.backend
            .set_remote_description(SessionDescription::answer(sdp))
            .await?;
        self.remote_description_set = true;
        self.negotiation = Negotiation::Stable;
        self.flush_candidates().await;
        Ok(())
    }

    /// Applies a remote candidate, or queues it until the remote description is set.
    /// Rejected candidates are logged and dropped.
    pub async fn handle_ice_candidate(&mut self, candidate: IceCandidate) {
        if self.closed {
            debug!("ignoring candidate from {} on a closed link", self.remote);
            return;
        }
        if self.remote_description_set {
            self.apply_candidate(&candidate).await;
        } else {
            self.pending_candidates.push_back(candidate);
        }
    }

    /// Forwards a locally gathered candidate to the remote peer.
    ///
    /// # Errors
    /// Fails when the signaling transport is not open.
    pub fn send_local_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.closed {
            return Err(Error::LinkClosed(self.remote.clone()));
        }
        self.signaling.send_signal(SignalMessage::ice_candidate(
            self.room_id.clone(),
            self.local.clone(),
            self.remote.clone(),
            candidate,
        ))
    }

    /// Records a transport state reported by the backend.
    /// Returns whether it differs from the previous one.
    pub fn observe_state(&mut self, state: ConnectionState) -> bool {
        if self.closed || state == self.state {
            return false;
        }
        info!("link {} -> {} is {state}", self.local, self.remote);
        self.state = state;
        self.observers.notify(&state);
        true
    }

    /// Routes one backend event, returning the new transport state if it changed.
    pub fn handle_backend_event(&mut self, event: BackendEvent) -> Option<ConnectionState> {
        match event {
            BackendEvent::LocalCandidate(candidate) => {
                if let Err(error) = self.send_local_candidate(candidate) {
                    warn!("could not send candidate to {}: {error}", self.remote);
                }
                None
            }
            BackendEvent::StateChanged(state) => self.observe_state(state).then_some(state),
        }
    }

    /// Stops every owned track and closes the backend. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        for track in &mut self.tracks {
            track.stop();
        }
        self.tracks.clear();
        self.pending_candidates.clear();
        self.backend.close();
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closed;
            self.observers.notify(&ConnectionState::Closed);
        }
        self.closed = true;
        debug!("closed link {} -> {}", self.local, self.remote);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::LinkClosed(self.remote.clone()));
        }
        Ok(())
    }

    fn ensure_negotiation(&self, expected: Negotiation, action: &'static str) -> Result<()> {
        if self.negotiation == expected {
            return Ok(());
        }
        Err(Error::InvalidNegotiationState {
            peer: self.remote.clone(),
            state: self.negotiation,
            action,
        })
    }

    async fn apply_candidate(&mut self, candidate: &IceCandidate) {
        if let Err(error) = self.backend.add_ice_candidate(candidate).await {
            warn!("ignoring candidate from {}: {error}", self.remote);
        }
    }

    async fn flush_candidates(&mut self) {
        while let Some(candidate) = self.pending_candidates.pop_front() {
            self.apply_candidate(&candidate).await;
        }
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        self.close();
    }
}
