#![allow(dead_code)]

pub mod hub;

use std::sync::Arc;
use std::time::Duration;

use peercall::call::{
    CallAgent, CallId, CallStatus, Collaborators, MemoryCallStore, MemoryNotifier, MemoryProfiles,
};
use peercall::feedback::RecordingTonePlayer;
use peercall::peer::loopback::LoopbackFactory;
use peercall::peer::media::SyntheticDevices;
use peercall::{CallConfig, CallEvent, ConnectionType, UserId};
use tokio::sync::mpsc::UnboundedReceiver;

use self::hub::Hub;

/// Shared collaborators for a set of agents talking through one [`Hub`].
pub struct Harness {
    pub hub: Hub,
    pub store: Arc<MemoryCallStore>,
    pub notifier: Arc<MemoryNotifier>,
    pub profiles: Arc<MemoryProfiles>,
    pub backends: LoopbackFactory,
    pub media: Arc<SyntheticDevices>,
    pub tones: Arc<RecordingTonePlayer>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_media(SyntheticDevices::new())
    }

    pub fn with_media(media: SyntheticDevices) -> Self {
        Self {
            hub: Hub::default(),
            store: Arc::new(MemoryCallStore::new()),
            notifier: Arc::new(MemoryNotifier::new()),
            profiles: Arc::new(MemoryProfiles::new()),
            backends: LoopbackFactory::new(),
            media: Arc::new(media),
            tones: Arc::new(RecordingTonePlayer::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: self.store.clone(),
            notifier: self.notifier.clone(),
            profiles: self.profiles.clone(),
            connector: Arc::new(self.hub.clone()),
            backends: Arc::new(self.backends.clone()),
            media: self.media.clone(),
            tones: self.tones.clone(),
        }
    }

    pub fn agent(&self, user: &str) -> (CallAgent, UnboundedReceiver<CallEvent>) {
        self.agent_with(user, config())
    }

    pub fn agent_with(
        &self,
        user: &str,
        config: CallConfig,
    ) -> (CallAgent, UnboundedReceiver<CallEvent>) {
        let agent = CallAgent::spawn(UserId::from(user), config, self.collaborators());
        let events = agent.subscribe();
        (agent, events)
    }
}

pub fn config() -> CallConfig {
    CallConfig {
        signaling_url: "ws://hub.test/ws".to_owned(),
        connection_type: ConnectionType::Local,
        ..CallConfig::default()
    }
}

/// Lets every task that is ready run before the clock moves on.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

pub async fn wait_for(
    events: &mut UnboundedReceiver<CallEvent>,
    mut predicate: impl FnMut(&CallEvent) -> bool,
) -> CallEvent {
    let wait = async {
        loop {
            let event = events.recv().await.expect("agent stopped");
            if predicate(&event) {
                return event;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(300), wait)
        .await
        .expect("timed out waiting for a call event")
}

pub async fn wait_for_status(
    events: &mut UnboundedReceiver<CallEvent>,
    call_id: &CallId,
    status: CallStatus,
) {
    wait_for(events, |event| {
        matches!(
            event,
            CallEvent::StatusChanged { call_id: id, status: current }
                if id == call_id && *current == status
        )
    })
    .await;
}

/// Waits for the end of `call_id` and returns its status and retry hint.
pub async fn wait_for_end(
    events: &mut UnboundedReceiver<CallEvent>,
    call_id: &CallId,
) -> (CallStatus, bool) {
    match wait_for(events, |event| {
        matches!(event, CallEvent::CallEnded { call_id: id, .. } if id == call_id)
    })
    .await
    {
        CallEvent::CallEnded {
            status, can_retry, ..
        } => (status, can_retry),
        other => panic!("unexpected event {other:?}"),
    }
}
