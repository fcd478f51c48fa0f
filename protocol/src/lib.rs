/*!
Helper crate that declares the wire types shared between the [peercall](../peercall/index.html)
client library and the [peercall-signaling-server](../peercall_signaling_server/index.html) relay.

Every frame exchanged with the relay is a JSON encoded [`SignalMessage`].
*/

#![warn(missing_docs)]

use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod common;
pub mod signal;

pub use common::IceCandidate;
pub use signal::{ProtocolViolation, SignalData, SignalKind, SignalMessage};

/// Identifier of a signaling room, shared by all participants of one call attempt.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize, Hash)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Wrap String into a `RoomId` `struct`
    #[must_use]
    pub const fn new(inner: String) -> Self {
        Self(inner)
    }

    /// Return reference to the underling string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Acquire the underlying type
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl FromStr for RoomId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl From<&str> for RoomId {
    fn from(val: &str) -> Self {
        Self(val.to_owned())
    }
}

impl Display for RoomId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a user as authenticated by the session layer.
///
/// The relay keys connections by this value, a user with two tabs open
/// in the same room is one peer.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize, Hash)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Wrap String into a `UserId` `struct`
    #[must_use]
    pub const fn new(inner: String) -> Self {
        Self(inner)
    }

    /// Return reference to the underling string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Acquire the underlying type
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl FromStr for UserId {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl From<&str> for UserId {
    fn from(val: &str) -> Self {
        Self(val.to_owned())
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
