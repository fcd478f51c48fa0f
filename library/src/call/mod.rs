/*!
Call sessions and their lifecycle.

A [`CallSession`] is the record both sides of a call share. Its status only
moves through [`next_status`], and the [`CallAgent`] is the one place a
device drives those transitions: it rings, opens the signaling room,
negotiates a link to every other participant and persists the outcome
through a [`CallRecordStore`].
*/

mod agent;
mod notify;
mod session;
mod store;
mod sweep;

pub use agent::{CallAgent, CallRequest, Collaborators, InviteOutcome};
pub use notify::{
    Channel, LogNotifier, MemoryNotifier, MemoryProfiles, Notification, Notifier, ProfileDirectory,
};
pub use session::{
    next_status, CallId, CallSession, CallStatus, CallTrigger, CallType, InvalidTransition,
};
pub use store::{CallRecordStore, HistoryKey, MemoryCallStore, MissedCallEntry, StatusUpdate};
pub use sweep::expire_stale_ringing;
