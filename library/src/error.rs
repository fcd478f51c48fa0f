use peercall_protocol::UserId;
use thiserror::Error;

use crate::call::{CallId, InvalidTransition};
use crate::peer::Negotiation;

#[derive(Debug, Error)]
pub enum Error {
    #[error("signaling transport is not open")]
    NotConnected,

    #[error("{0}")]
    InvalidTransition(#[from] InvalidTransition),

    #[error("negotiation with {peer} is {state:?}, cannot {action}")]
    InvalidNegotiationState {
        peer: UserId,
        state: Negotiation,
        action: &'static str,
    },

    #[error("peer link to {0} is closed")]
    LinkClosed(UserId),

    #[error("call not found: {0}")]
    CallNotFound(CallId),

    #[error("already in call {0}")]
    AlreadyInCall(CallId),

    #[error("invalid call request: {0}")]
    InvalidRequest(String),

    #[error("call agent has stopped")]
    AgentStopped,

    #[error("malformed signaling frame: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] envy::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
