use std::time::Duration;

use log::{error, info};

use crate::call::notify::Notifier;
use crate::call::session::{CallId, CallSession, CallStatus, CallTrigger};
use crate::call::store::{CallRecordStore, StatusUpdate};
use crate::clock::Clock;

/// Missed-call entry plus one notification per callee.
pub(crate) async fn record_missed(
    store: &dyn CallRecordStore,
    notifier: &dyn Notifier,
    session: &CallSession,
) {
    if let Err(err) = store.record_missed_call(session).await {
        error!("failed to record missed call {}: {err:#}", session.id);
    }
    for callee in session.callees() {
        notifier.notify_missed_call(callee, &session.caller_id, session.call_type);
    }
}

/// Marks every persisted call that has been ringing for longer than `window`
/// as missed, whether or not any client is still around to time it out.
///
/// Returns the calls this sweep expired. Records another device or sweep
/// already finished are skipped, so side effects run once per call.
///
/// # Errors
/// Fails when the store cannot be queried or updated.
pub async fn expire_stale_ringing(
    store: &dyn CallRecordStore,
    notifier: &dyn Notifier,
    clock: &Clock,
    window: Duration,
) -> anyhow::Result<Vec<CallId>> {
    let now = clock.now();
    let cutoff = now - chrono::Duration::from_std(window)?;
    let mut expired = Vec::new();
    for mut session in store.stale_ringing(cutoff).await? {
        if session.apply(CallTrigger::RingTimeout, now).is_err() {
            continue;
        }
        if store
            .update_call_status(&session.id, &StatusUpdate::from(&session))
            .await?
        {
            info!("call {} expired while ringing", session.id);
            debug_assert_eq!(session.status, CallStatus::Missed);
            record_missed(store, notifier, &session).await;
            expired.push(session.id);
        }
    }
    Ok(expired)
}
