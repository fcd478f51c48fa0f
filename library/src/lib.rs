/*!
Client side of peer-to-peer audio, video and group calls.

# Overview

A call is a shared [`CallSession`](call::CallSession) record plus one signaling
room every participant joins. The [`CallAgent`](call::CallAgent) owns all calls
of one user on one device: it rings, acquires local media, connects to the
room through a [`SignalingClient`](signaling::SignalingClient) and negotiates a
[`PeerConnectionManager`](peer::PeerConnectionManager) per remote participant.
Group calls form a full mesh, so every pair of participants negotiates its own link.

Lifecycle changes are delivered as [`CallEvent`]s to every subscriber and
written to a [`CallRecordStore`](call::CallRecordStore), whose
compare-and-set semantics make missed, busy and declined notifications fire
once per call no matter how many devices observe the outcome.

The relay half lives in the accompanying `peercall-signaling-server` crate;
both sides speak the messages defined in [`protocol`].
*/

#![allow(clippy::module_name_repetitions)]
// clippy WARN level lints
#![warn(
    // missing_docs,
    clippy::cargo,
    clippy::pedantic,
    // clippy::nursery,
    clippy::dbg_macro,
    clippy::unwrap_used,
    clippy::integer_division,
    clippy::large_include_file,
    clippy::map_err_ignore,
    // clippy::missing_docs_in_private_items,
    clippy::panic,
    clippy::todo,
    clippy::undocumented_unsafe_blocks,
    clippy::unimplemented,
    clippy::unreachable
)]
// clippy WARN level lints, that can be upgraded to DENY if preferred
#![warn(
    clippy::float_arithmetic,
    clippy::arithmetic_side_effects,
    clippy::modulo_arithmetic,
    clippy::as_conversions,
    clippy::assertions_on_result_states,
    clippy::clone_on_ref_ptr,
    clippy::create_dir,
    clippy::default_union_representation,
    clippy::deref_by_slicing,
    clippy::empty_drop,
    clippy::empty_structs_with_brackets,
    clippy::exit,
    clippy::filetype_is_file,
    clippy::float_cmp_const,
    clippy::if_then_some_else_none,
    clippy::indexing_slicing,
    clippy::let_underscore_must_use,
    clippy::lossy_float_literal,
    clippy::pattern_type_mismatch,
    clippy::string_slice,
    clippy::try_err
)]
// clippy DENY level lints, they always have a quick fix that should be preferred
#![deny(
    clippy::wildcard_imports,
    clippy::multiple_inherent_impl,
    clippy::rc_buffer,
    clippy::rc_mutex,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_name_method,
    clippy::self_named_module_files,
    clippy::separated_literal_suffix,
    clippy::shadow_unrelated,
    clippy::str_to_string,
    clippy::string_add,
    clippy::string_to_string,
    clippy::unnecessary_self_imports,
    clippy::unneeded_field_pattern,
    clippy::unseparated_literal_suffix,
    clippy::verbose_file_reads
)]

mod clock;
mod config;
mod error;
mod utils;

pub mod call;
pub mod events;
pub mod feedback;
pub mod peer;
pub mod signaling;

pub use clock::Clock;
pub use config::{
    CallConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PEER_REJOIN_GRACE, DEFAULT_RING_TIMEOUT,
    DEFAULT_SIGNALING_URL,
};
pub use error::{Error, Result};
pub use events::{CallEvent, EndReason};
pub use peercall_protocol as protocol;
pub use peercall_protocol::{RoomId, UserId};
pub use utils::{ConnectionType, IceServer};
