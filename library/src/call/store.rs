/*!
Persistence seam for call records and the in-memory store used by tests and demos.
*/

use std::collections::HashMap;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use peercall_protocol::UserId;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::call::session::{CallId, CallSession, CallStatus, CallType};

/// Status fields written by [`CallRecordStore::update_call_status`].
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub status: CallStatus,
    pub active_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: i64,
}

impl From<&CallSession> for StatusUpdate {
    fn from(session: &CallSession) -> Self {
        Self {
            status: session.status,
            active_at: session.active_at,
            ended_at: session.ended_at,
            duration_seconds: session.duration_seconds(),
        }
    }
}

/// Key of a call history listing.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HistoryKey {
    /// Conversation or circle.
    Scope(String),
    User(UserId),
}

/// Entry shown in a conversation for a call nobody picked up.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissedCallEntry {
    pub call_id: CallId,
    pub scope: String,
    pub caller_id: UserId,
    pub call_type: CallType,
    pub at: DateTime<Utc>,
}

#[async_trait]
pub trait CallRecordStore: Send + Sync {
    async fn create_call_record(&self, session: &CallSession) -> anyhow::Result<()>;

    /// The shared record of a call, `None` if it was never created.
    async fn find_call_record(&self, id: &CallId) -> anyhow::Result<Option<CallSession>>;

    /// Applies `update` unless the record is already terminal or already holds
    /// that status. Returns whether anything was written, callers run side
    /// effects of a terminal status only when it returns `true`.
    async fn update_call_status(&self, id: &CallId, update: &StatusUpdate) -> anyhow::Result<bool>;

    async fn add_participant(&self, id: &CallId, user: &UserId) -> anyhow::Result<()>;

    async fn record_missed_call(&self, session: &CallSession) -> anyhow::Result<()>;

    /// Calls of a scope or involving a user, most recent first.
    async fn list_call_history(&self, key: &HistoryKey) -> anyhow::Result<Vec<CallSession>>;

    /// Records still ringing that started before `started_before`.
    async fn stale_ringing(&self, started_before: DateTime<Utc>)
        -> anyhow::Result<Vec<CallSession>>;
}

#[derive(Debug, Default)]
pub struct MemoryCallStore {
    records: RwLock<HashMap<CallId, CallSession>>,
    missed: RwLock<Vec<MissedCallEntry>>,
}

impl MemoryCallStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, id: &CallId) -> Option<CallSession> {
        self.records.read().await.get(id).cloned()
    }

    pub async fn missed_calls(&self, scope: &str) -> Vec<MissedCallEntry> {
        self.missed
            .read()
            .await
            .iter()
            .filter(|entry| entry.scope == scope)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CallRecordStore for MemoryCallStore {
    async fn create_call_record(&self, session: &CallSession) -> anyhow::Result<()> {
        self.records
            .write()
            .await
            .entry(session.id.clone())
            .or_insert_with(|| session.clone());
        Ok(())
    }

    async fn find_call_record(&self, id: &CallId) -> anyhow::Result<Option<CallSession>> {
        Ok(self.record(id).await)
    }

    async fn update_call_status(&self, id: &CallId, update: &StatusUpdate) -> anyhow::Result<bool> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| anyhow!("no call record {id}"))?;
        if record.status.is_terminal() || record.status == update.status {
            return Ok(false);
        }
        record.status = update.status;
        if record.active_at.is_none() {
            record.active_at = update.active_at;
        }
        if update.status.is_terminal() {
            record.ended_at = update.ended_at;
        }
        Ok(true)
    }

    async fn add_participant(&self, id: &CallId, user: &UserId) -> anyhow::Result<()> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(id)
            .ok_or_else(|| anyhow!("no call record {id}"))?;
        record.add_participant(user.clone());
        Ok(())
    }

    async fn record_missed_call(&self, session: &CallSession) -> anyhow::Result<()> {
        self.missed.write().await.push(MissedCallEntry {
            call_id: session.id.clone(),
            scope: session.scope.clone(),
            caller_id: session.caller_id.clone(),
            call_type: session.call_type,
            at: session.ended_at.unwrap_or(session.started_at),
        });
        Ok(())
    }

    async fn list_call_history(&self, key: &HistoryKey) -> anyhow::Result<Vec<CallSession>> {
        let records = self.records.read().await;
        let mut history: Vec<CallSession> = records
            .values()
            .filter(|session| match *key {
                HistoryKey::Scope(ref scope) => &session.scope == scope,
                HistoryKey::User(ref user) => session.participant_ids.contains(user),
            })
            .cloned()
            .collect();
        history.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(history)
    }

    async fn stale_ringing(
        &self,
        started_before: DateTime<Utc>,
    ) -> anyhow::Result<Vec<CallSession>> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|session| {
                session.status == CallStatus::Ringing && session.started_at < started_before
            })
            .cloned()
            .collect())
    }
}
