use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use peercall_protocol::{RoomId, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    #[must_use]
    pub const fn new(inner: String) -> Self {
        Self(inner)
    }

    #[must_use]
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for CallId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallType {
    Audio,
    Video,
    Group,
}

impl CallType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Group => "group",
        }
    }

    #[must_use]
    pub const fn is_group(self) -> bool {
        matches!(self, Self::Group)
    }
}

/// Lifecycle of a call. `Idle` and `Connecting` are only ever held locally.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Idle,
    Ringing,
    Connecting,
    Active,
    Ended,
    Missed,
    Declined,
    Failed,
    Busy,
}

impl CallStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Ended | Self::Missed | Self::Declined | Self::Failed | Self::Busy
        )
    }

    /// A call in one of these states makes the user busy for new invites.
    #[must_use]
    pub const fn is_engaged(self) -> bool {
        matches!(self, Self::Connecting | Self::Active)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ringing => "ringing",
            Self::Connecting => "connecting",
            Self::Active => "active",
            Self::Ended => "ended",
            Self::Missed => "missed",
            Self::Declined => "declined",
            Self::Failed => "failed",
            Self::Busy => "busy",
        }
    }
}

impl Display for CallStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can move a call between states.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CallTrigger {
    /// Invite sent by the caller or received by a callee.
    Initiate,
    /// Callee accepted, or the first remote participant joined the caller's room.
    Accept,
    Decline,
    RingTimeout,
    ConnectTimeout,
    PeerConnected,
    PeerDisconnected,
    PeerFailed,
    NegotiationFailed,
    SignalingFailed,
    MediaUnavailable,
    /// Local hangup. While ringing this is the caller cancelling the invite.
    HangUp,
    LastParticipantLeft,
    CalleeBusy,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Error)]
#[error("cannot apply {trigger:?} to a {from} call")]
pub struct InvalidTransition {
    pub from: CallStatus,
    pub trigger: CallTrigger,
}

/// Transition table, `None` when `trigger` is not valid in `status`.
#[must_use]
pub const fn next_status(status: CallStatus, trigger: CallTrigger) -> Option<CallStatus> {
    if status.is_terminal() {
        return None;
    }
    let next = match (status, trigger) {
        (CallStatus::Idle, CallTrigger::Initiate) => CallStatus::Ringing,
        (CallStatus::Idle | CallStatus::Ringing, CallTrigger::CalleeBusy) => CallStatus::Busy,
        (CallStatus::Ringing, CallTrigger::Accept) => CallStatus::Connecting,
        (CallStatus::Ringing, CallTrigger::Decline) => CallStatus::Declined,
        (CallStatus::Ringing, CallTrigger::RingTimeout | CallTrigger::HangUp) => CallStatus::Missed,
        (
            CallStatus::Ringing,
            CallTrigger::SignalingFailed | CallTrigger::MediaUnavailable,
        ) => CallStatus::Failed,
        (CallStatus::Connecting, CallTrigger::PeerConnected) => CallStatus::Active,
        (
            CallStatus::Connecting,
            CallTrigger::PeerDisconnected
            | CallTrigger::PeerFailed
            | CallTrigger::NegotiationFailed
            | CallTrigger::SignalingFailed
            | CallTrigger::MediaUnavailable
            | CallTrigger::ConnectTimeout,
        ) => CallStatus::Failed,
        (
            CallStatus::Connecting | CallStatus::Active,
            CallTrigger::HangUp | CallTrigger::LastParticipantLeft,
        )
        | (CallStatus::Active, CallTrigger::PeerDisconnected) => CallStatus::Ended,
        (CallStatus::Active, CallTrigger::PeerFailed | CallTrigger::SignalingFailed) => {
            CallStatus::Failed
        }
        _ => return None,
    };
    Some(next)
}

/// One call attempt, from the invite to its terminal state.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub id: CallId,
    pub room_id: RoomId,
    /// Conversation or circle the call belongs to.
    pub scope: String,
    pub caller_id: UserId,
    pub participant_ids: BTreeSet<UserId>,
    pub call_type: CallType,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
    pub active_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// New idle session, the caller is always a participant.
    pub fn new(
        scope: impl Into<String>,
        caller_id: UserId,
        participants: impl IntoIterator<Item = UserId>,
        call_type: CallType,
        now: DateTime<Utc>,
    ) -> Self {
        let scope = scope.into();
        let mut participant_ids: BTreeSet<UserId> = participants.into_iter().collect();
        participant_ids.insert(caller_id.clone());
        Self {
            id: CallId::random(),
            room_id: Self::room_id_for(call_type, &scope, now),
            scope,
            caller_id,
            participant_ids,
            call_type,
            status: CallStatus::Idle,
            started_at: now,
            active_at: None,
            ended_at: None,
        }
    }

    /// `{audio|video|group}-call-{scope}-{unix_millis}-{nonce}`, with eight random
    /// hex digits as nonce so attempts started in the same millisecond never share a room.
    #[must_use]
    pub fn room_id_for(call_type: CallType, scope: &str, at: DateTime<Utc>) -> RoomId {
        let (nonce, ..) = Uuid::new_v4().as_fields();
        RoomId::new(format!(
            "{}-call-{scope}-{}-{nonce:08x}",
            call_type.as_str(),
            at.timestamp_millis()
        ))
    }

    /// Applies `trigger`, stamping `active_at` on entering `Active` and
    /// `ended_at` on entering a terminal state.
    ///
    /// # Errors
    /// [`InvalidTransition`] when the trigger is not valid in the current status,
    /// the session is left unchanged.
    pub fn apply(
        &mut self,
        trigger: CallTrigger,
        now: DateTime<Utc>,
    ) -> Result<CallStatus, InvalidTransition> {
        let next = next_status(self.status, trigger).ok_or(InvalidTransition {
            from: self.status,
            trigger,
        })?;
        self.status = next;
        if next == CallStatus::Active && self.active_at.is_none() {
            self.active_at = Some(now);
        }
        if next.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(now);
        }
        Ok(next)
    }

    /// Copy of an invite as this device first sees it, before any local transition.
    #[must_use]
    pub fn as_received(&self) -> Self {
        Self {
            status: CallStatus::Idle,
            active_at: None,
            ended_at: None,
            ..self.clone()
        }
    }

    /// Seconds between entering `Active` and the end, zero if never active.
    #[must_use]
    pub fn duration_seconds(&self) -> i64 {
        match (self.active_at, self.ended_at) {
            (Some(active), Some(ended)) => (ended - active).num_seconds().max(0),
            _ => 0,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn callees(&self) -> impl Iterator<Item = &UserId> {
        self.participant_ids
            .iter()
            .filter(move |user| **user != self.caller_id)
    }

    /// Adds a participant to a call that has not ended yet.
    pub fn add_participant(&mut self, user: UserId) -> bool {
        !self.is_terminal() && self.participant_ids.insert(user)
    }
}
