/*!
Signaling messages exchanged between clients and the relay.

Membership messages (`peer-joined`, `peer-left`, `existing-peers`) only ever flow
from the relay to clients. Negotiation messages (`offer`, `answer`, `ice-candidate`)
are addressed to exactly one peer of the same room and are forwarded untouched,
apart from the sender fields which the relay fills in from the authenticated connection.
*/

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::common::IceCandidate;
use crate::{RoomId, UserId};

/// Value of the `type` field of a [`SignalMessage`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    /// Client announces itself in a room.
    Join,
    /// Client leaves a room on purpose.
    Leave,
    /// Relay tells members that somebody joined.
    PeerJoined,
    /// Relay tells members that somebody left.
    PeerLeft,
    /// Relay tells a joiner who is already in the room.
    ExistingPeers,
    /// `SDP` offer addressed to one peer.
    Offer,
    /// `SDP` answer addressed to one peer.
    Answer,
    /// ICE candidate addressed to one peer.
    IceCandidate,
}

impl SignalKind {
    /// Kinds that must carry a `toPeerId` and are forwarded point-to-point.
    #[must_use]
    pub const fn is_directed(self) -> bool {
        matches!(self, Self::Offer | Self::Answer | Self::IceCandidate)
    }

    /// Kinds only the relay is allowed to emit.
    #[must_use]
    pub const fn is_relay_originated(self) -> bool {
        matches!(self, Self::PeerJoined | Self::PeerLeft | Self::ExistingPeers)
    }

    /// Name used on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Join => "join",
            Self::Leave => "leave",
            Self::PeerJoined => "peer-joined",
            Self::PeerLeft => "peer-left",
            Self::ExistingPeers => "existing-peers",
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }
}

impl Display for SignalKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type specific payload of a [`SignalMessage`].
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalData {
    /// Subject of `peer-joined` and `peer-left`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<UserId>,
    /// Members listed by `existing-peers`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peers: Option<Vec<UserId>>,
    /// Session description of `offer` and `answer`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    /// Candidate of `ice-candidate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

impl SignalData {
    /// True when no field is set, such payloads are left out of the frame.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.peer_id.is_none()
            && self.peers.is_none()
            && self.sdp.is_none()
            && self.candidate.is_none()
    }
}

/// Single frame of the signaling protocol.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    /// What the frame means.
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Room the frame belongs to.
    pub room_id: RoomId,
    /// Sender, always overwritten by the relay for forwarded frames.
    pub from_user_id: UserId,
    /// Recipient of directed kinds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_peer_id: Option<UserId>,
    /// Type specific payload.
    #[serde(default, skip_serializing_if = "SignalData::is_empty")]
    pub data: SignalData,
}

impl SignalMessage {
    fn bare(kind: SignalKind, room_id: RoomId, from_user_id: UserId) -> Self {
        Self {
            kind,
            room_id,
            from_user_id,
            to_peer_id: None,
            data: SignalData::default(),
        }
    }

    /// `join` request sent by a client.
    #[must_use]
    pub fn join(room_id: RoomId, from_user_id: UserId) -> Self {
        Self::bare(SignalKind::Join, room_id, from_user_id)
    }

    /// `leave` request sent by a client.
    #[must_use]
    pub fn leave(room_id: RoomId, from_user_id: UserId) -> Self {
        Self::bare(SignalKind::Leave, room_id, from_user_id)
    }

    /// Relay notification that `peer_id` joined the room.
    #[must_use]
    pub fn peer_joined(room_id: RoomId, peer_id: UserId) -> Self {
        let mut message = Self::bare(SignalKind::PeerJoined, room_id, peer_id.clone());
        message.data.peer_id = Some(peer_id);
        message
    }

    /// Relay notification that `peer_id` left the room.
    #[must_use]
    pub fn peer_left(room_id: RoomId, peer_id: UserId) -> Self {
        let mut message = Self::bare(SignalKind::PeerLeft, room_id, peer_id.clone());
        message.data.peer_id = Some(peer_id);
        message
    }

    /// Relay reply to a joiner listing everybody else in the room.
    #[must_use]
    pub fn existing_peers(room_id: RoomId, joiner: UserId, peers: Vec<UserId>) -> Self {
        let mut message = Self::bare(SignalKind::ExistingPeers, room_id, joiner);
        message.data.peers = Some(peers);
        message
    }

    /// `SDP` offer for `to`.
    #[must_use]
    pub fn offer(room_id: RoomId, from: UserId, to: UserId, sdp: String) -> Self {
        let mut message = Self::bare(SignalKind::Offer, room_id, from);
        message.to_peer_id = Some(to);
        message.data.sdp = Some(sdp);
        message
    }

    /// `SDP` answer for `to`.
    #[must_use]
    pub fn answer(room_id: RoomId, from: UserId, to: UserId, sdp: String) -> Self {
        let mut message = Self::bare(SignalKind::Answer, room_id, from);
        message.to_peer_id = Some(to);
        message.data.sdp = Some(sdp);
        message
    }

    /// ICE candidate for `to`.
    #[must_use]
    pub fn ice_candidate(
        room_id: RoomId,
        from: UserId,
        to: UserId,
        candidate: IceCandidate,
    ) -> Self {
        let mut message = Self::bare(SignalKind::IceCandidate, room_id, from);
        message.to_peer_id = Some(to);
        message.data.candidate = Some(candidate);
        message
    }

    /// Checks that the frame carries the fields its kind requires.
    ///
    /// # Errors
    /// Returns the first missing field as a [`ProtocolViolation`].
    pub fn validate(&self) -> Result<(), ProtocolViolation> {
        if self.kind.is_directed() && self.to_peer_id.is_none() {
            return Err(ProtocolViolation::MissingTarget(self.kind));
        }
        match self.kind {
            SignalKind::Offer | SignalKind::Answer if self.data.sdp.is_none() => {
                Err(ProtocolViolation::MissingSdp(self.kind))
            }
            SignalKind::IceCandidate if self.data.candidate.is_none() => {
                Err(ProtocolViolation::MissingCandidate)
            }
            SignalKind::PeerJoined | SignalKind::PeerLeft if self.data.peer_id.is_none() => {
                Err(ProtocolViolation::MissingPeerId(self.kind))
            }
            _ => Ok(()),
        }
    }
}

/// Reason a frame is not acceptable.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ProtocolViolation {
    /// Directed kind without `toPeerId`.
    MissingTarget(SignalKind),
    /// Offer or answer without `sdp`.
    MissingSdp(SignalKind),
    /// `ice-candidate` without `candidate`.
    MissingCandidate,
    /// Membership notification without `peerId`.
    MissingPeerId(SignalKind),
}

impl Display for ProtocolViolation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::MissingTarget(kind) => write!(f, "{kind} message without toPeerId"),
            Self::MissingSdp(kind) => write!(f, "{kind} message without sdp"),
            Self::MissingCandidate => f.write_str("ice-candidate message without candidate"),
            Self::MissingPeerId(kind) => write!(f, "{kind} message without peerId"),
        }
    }
}

impl std::error::Error for ProtocolViolation {}
