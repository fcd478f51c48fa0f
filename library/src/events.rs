/*!
Typed notifications emitted towards the UI layer.
*/

use peercall_protocol::UserId;
use tokio::sync::mpsc;

use crate::call::{CallId, CallSession, CallStatus};

/// Why a call reached its terminal state.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EndReason {
    LocalHangup,
    RemoteHangup,
    Declined,
    Missed,
    Busy,
    ConnectionLost,
    NegotiationFailed,
    MediaUnavailable,
    Timeout,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum CallEvent {
    /// An invite is ringing on this device.
    IncomingCall(CallSession),
    StatusChanged {
        call_id: CallId,
        status: CallStatus,
    },
    PeerConnected {
        call_id: CallId,
        peer: UserId,
    },
    PeerLeft {
        call_id: CallId,
        peer: UserId,
    },
    /// A single negotiation step failed, the call itself may carry on.
    NegotiationError {
        call_id: CallId,
        peer: UserId,
        message: String,
    },
    /// The signaling connection dropped and was opened again, media links were kept.
    SignalingRestored {
        call_id: CallId,
    },
    /// The signaling connection could not be kept open.
    ConnectionFailed {
        call_id: CallId,
    },
    CallEnded {
        call_id: CallId,
        status: CallStatus,
        reason: EndReason,
        /// Set when an established call dropped, the UI may offer to call back.
        can_retry: bool,
    },
}

/// List of subscribers that all receive every event.
///
/// Subscribers that dropped their receiver are pruned on the next notification.
#[derive(Debug)]
pub struct Observers<E> {
    subscribers: Vec<mpsc::UnboundedSender<E>>,
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }
}

impl<E: Clone> Observers<E> {
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn notify(&mut self, event: &E) {
        self.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}
