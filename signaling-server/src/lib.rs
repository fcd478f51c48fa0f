/*!
Signaling relay for `peercall`.

Peers connect over a WebSocket to `/ws?roomId=..&userId=..` and from then on the relay
keeps them informed about who else is in the room (`peer-joined`, `peer-left`,
`existing-peers`) and forwards `offer`, `answer` and `ice-candidate` frames to the
addressed peer of the same room.

Room state lives in memory only. A room appears with its first member and is
discarded when its last member leaves.
*/

#![allow(clippy::module_name_repetitions)]
#![warn(
    clippy::pedantic,
    clippy::dbg_macro,
    clippy::unwrap_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented
)]
#![deny(
    clippy::wildcard_imports,
    clippy::self_named_module_files,
    clippy::str_to_string,
    clippy::string_to_string
)]

mod connection;
pub mod relay;
pub mod router;

pub use relay::{ConnectionId, Delivery, Registration, RelayServer};

pub type Result<T> = anyhow::Result<T>;
