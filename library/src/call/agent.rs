/*!
Per-user call actor.

A [`CallAgent`] handle sends commands to a single task that owns every call of
one signed-in user. UI actions, relay messages, backend events and timers are
all queued on the same channel, so each call's state is only ever touched by
one command at a time and transitions happen in the order their causes arrived.

Media capture and the relay connection are opened by a setup task per call.
When the call ends first the task is aborted, and results that still slip in
afterwards are released on arrival.

Losing the relay does not end a call by itself. A peer that drops out of the
room while its media link is still connected gets
[`CallConfig::peer_rejoin_grace`] to come back, and a rejoining peer keeps its
link instead of negotiating a new one.
*/

use std::collections::{HashMap, VecDeque};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use peercall_protocol::{RoomId, SignalKind, SignalMessage, UserId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::call::notify::{Notifier, ProfileDirectory};
use crate::call::session::{CallId, CallSession, CallStatus, CallTrigger, CallType, InvalidTransition};
use crate::call::store::{CallRecordStore, StatusUpdate};
use crate::call::sweep::record_missed;
use crate::clock::Clock;
use crate::config::CallConfig;
use crate::events::{CallEvent, EndReason, Observers};
use crate::feedback::{Ringer, Tone, TonePlayer};
use crate::peer::media::{LocalStream, MediaDevices};
use crate::peer::{
    BackendEvent, BackendFactory, ConnectionState, Negotiation, PeerConnectionManager,
};
use crate::signaling::{Connector, RetryPolicy, SignalSink, SignalingClient, SignalingEvent};
use crate::{Error, Result};

/// Services a [`CallAgent`] depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn CallRecordStore>,
    pub notifier: Arc<dyn Notifier>,
    pub profiles: Arc<dyn ProfileDirectory>,
    pub connector: Arc<dyn Connector>,
    pub backends: Arc<dyn BackendFactory>,
    pub media: Arc<dyn MediaDevices>,
    pub tones: Arc<dyn TonePlayer>,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CallRequest {
    /// Conversation or circle the call is placed in.
    pub scope: String,
    pub participants: Vec<UserId>,
    pub call_type: CallType,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum InviteOutcome {
    Ringing(CallSession),
    /// Rejected without ringing, the user is engaged in `active_call`.
    Busy { active_call: CallId },
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Role {
    Caller,
    Callee,
    /// Joined a running group call without an invite.
    Participant,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Action {
    Accept,
    Decline,
    HangUp,
    RemoteDeclined,
    RemoteBusy,
}

enum LinkDown {
    Left,
    Disconnected,
    Failed,
    Negotiation,
}

enum Command {
    Place {
        request: CallRequest,
        reply: oneshot::Sender<Result<CallSession>>,
    },
    Invite {
        invite: CallSession,
        reply: oneshot::Sender<Result<InviteOutcome>>,
    },
    JoinGroup {
        session: CallSession,
        reply: oneshot::Sender<Result<CallSession>>,
    },
    Act {
        call_id: CallId,
        action: Action,
        reply: oneshot::Sender<Result<CallSession>>,
    },
    Snapshot {
        call_id: CallId,
        reply: oneshot::Sender<Option<CallSession>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Joined {
        call_id: CallId,
        stream: LocalStream,
        client: SignalingClient,
        events: mpsc::UnboundedReceiver<SignalingEvent>,
    },
    SetupFailed {
        call_id: CallId,
        trigger: CallTrigger,
        reason: String,
    },
    Signaling {
        call_id: CallId,
        event: SignalingEvent,
    },
    Backend {
        call_id: CallId,
        peer: UserId,
        generation: u64,
        event: BackendEvent,
    },
    Timer {
        call_id: CallId,
        trigger: CallTrigger,
    },
    RejoinExpired {
        call_id: CallId,
        peer: UserId,
        generation: u64,
    },
}

/// Handle to the call actor of one user.
#[derive(Debug, Clone)]
pub struct CallAgent {
    user_id: UserId,
    commands: mpsc::UnboundedSender<Command>,
    events: Arc<Mutex<Observers<CallEvent>>>,
}

impl CallAgent {
    /// Starts the actor on the current tokio runtime.
    #[must_use]
    pub fn spawn(user_id: UserId, config: CallConfig, collaborators: Collaborators) -> Self {
        let (commands, queue) = mpsc::unbounded_channel();
        let events = Arc::new(Mutex::new(Observers::default()));
        let agent = Agent {
            user_id: user_id.clone(),
            ringer: Ringer::new(Arc::clone(&collaborators.tones)),
            config,
            collaborators,
            clock: Clock::new(),
            calls: HashMap::new(),
            finished: FinishedCalls::new(FINISHED_CALLS_KEPT),
            events: Arc::clone(&events),
            commands: commands.clone(),
            next_generation: 0,
        };
        tokio::spawn(agent.run(queue));
        Self {
            user_id,
            commands,
            events,
        }
    }

    #[must_use]
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<CallEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribe()
    }

    /// Creates the call record, starts ringing and opens the room.
    ///
    /// # Errors
    /// [`Error::AlreadyInCall`] while another call is connecting or active,
    /// [`Error::InvalidRequest`] for an empty or oversized callee list.
    pub async fn place_call(&self, request: CallRequest) -> Result<CallSession> {
        self.request(|reply| Command::Place { request, reply }).await?
    }

    /// Rings for an incoming invite, or answers busy without ringing.
    ///
    /// # Errors
    /// Fails for invites not addressed to this user or already finished here.
    pub async fn receive_invite(&self, invite: CallSession) -> Result<InviteOutcome> {
        self.request(|reply| Command::Invite { invite, reply }).await?
    }

    /// Joins a running group call of one of the user's circles.
    ///
    /// # Errors
    /// Fails for non-group calls or while engaged in another call.
    pub async fn join_group_call(&self, session: CallSession) -> Result<CallSession> {
        self.request(|reply| Command::JoinGroup { session, reply }).await?
    }

    /// # Errors
    /// [`Error::InvalidTransition`] when the call is no longer ringing.
    pub async fn accept(&self, call_id: &CallId) -> Result<CallSession> {
        self.act(call_id, Action::Accept).await
    }

    /// # Errors
    /// [`Error::InvalidTransition`] when the call is no longer ringing.
    pub async fn decline(&self, call_id: &CallId) -> Result<CallSession> {
        self.act(call_id, Action::Decline).await
    }

    /// Leaves the call. A callee hanging up a ringing call declines it, a caller
    /// hanging up a ringing call cancels it.
    ///
    /// # Errors
    /// Fails when the call already ended.
    pub async fn hang_up(&self, call_id: &CallId) -> Result<CallSession> {
        self.act(call_id, Action::HangUp).await
    }

    /// The callee declined this user's invite.
    ///
    /// # Errors
    /// Fails when the call is no longer ringing.
    pub async fn remote_declined(&self, call_id: &CallId) -> Result<CallSession> {
        self.act(call_id, Action::RemoteDeclined).await
    }

    /// The callee answered this user's invite with busy.
    ///
    /// # Errors
    /// Fails when the call is no longer ringing.
    pub async fn remote_busy(&self, call_id: &CallId) -> Result<CallSession> {
        self.act(call_id, Action::RemoteBusy).await
    }

    /// Current or final state of a call seen by this agent.
    ///
    /// # Errors
    /// [`Error::AgentStopped`] after shutdown.
    pub async fn session(&self, call_id: &CallId) -> Result<Option<CallSession>> {
        let call_id = call_id.clone();
        self.request(|reply| Command::Snapshot { call_id, reply })
            .await
    }

    /// Hangs up every call, releases devices and stops the actor.
    ///
    /// # Errors
    /// [`Error::AgentStopped`] when already stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    async fn act(&self, call_id: &CallId, action: Action) -> Result<CallSession> {
        let call_id = call_id.clone();
        self.request(|reply| Command::Act {
            call_id,
            action,
            reply,
        })
        .await?
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .or(Err(Error::AgentStopped))?;
        response.await.or(Err(Error::AgentStopped))
    }
}

fn respond<T>(reply: oneshot::Sender<T>, value: T) {
    if reply.send(value).is_err() {
        debug!("caller stopped waiting for the reply");
    }
}

struct Link {
    generation: u64,
    manager: PeerConnectionManager,
    forwarder: JoinHandle<()>,
    /// Runs while the peer is out of the room but the link is still up.
    rejoin: Option<JoinHandle<()>>,
}

impl Link {
    fn is_up(&self) -> bool {
        self.manager.state() == ConnectionState::Connected
    }

    fn rejoined(&mut self) {
        if let Some(timer) = self.rejoin.take() {
            timer.abort();
        }
    }

    fn close(mut self) {
        self.rejoined();
        self.forwarder.abort();
        self.manager.close();
    }
}

const FINISHED_CALLS_KEPT: usize = 64;

/// Final state of the most recent calls, the oldest is forgotten first.
struct FinishedCalls {
    capacity: usize,
    order: VecDeque<CallId>,
    sessions: HashMap<CallId, CallSession>,
}

impl FinishedCalls {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            sessions: HashMap::with_capacity(capacity),
        }
    }

    fn get(&self, call_id: &CallId) -> Option<&CallSession> {
        self.sessions.get(call_id)
    }

    fn insert(&mut self, session: CallSession) {
        let call_id = session.id.clone();
        if self.sessions.insert(call_id.clone(), session).is_none() {
            self.order.push_back(call_id);
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.sessions.remove(&oldest);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.sessions.len()
    }
}

struct ActiveCall {
    session: CallSession,
    role: Role,
    signaling: Option<SignalingClient>,
    stream: Option<LocalStream>,
    links: HashMap<UserId, Link>,
    timer: Option<JoinHandle<()>>,
    setup: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveCall {
    fn new(session: CallSession, role: Role) -> Self {
        Self {
            session,
            role,
            signaling: None,
            stream: None,
            links: HashMap::new(),
            timer: None,
            setup: None,
            tasks: Vec::new(),
        }
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn teardown(&mut self) {
        self.cancel_timer();
        if let Some(setup) = self.setup.take() {
            setup.abort();
        }
        for (_, link) in self.links.drain() {
            link.close();
        }
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }
        if let Some(client) = self.signaling.take() {
            client.disconnect();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

struct Agent {
    user_id: UserId,
    config: CallConfig,
    collaborators: Collaborators,
    ringer: Ringer,
    clock: Clock,
    calls: HashMap<CallId, ActiveCall>,
    finished: FinishedCalls,
    events: Arc<Mutex<Observers<CallEvent>>>,
    commands: mpsc::UnboundedSender<Command>,
    next_generation: u64,
}

type Setup = (
    LocalStream,
    SignalingClient,
    mpsc::UnboundedReceiver<SignalingEvent>,
);

async fn open_media_and_room(
    media: Arc<dyn MediaDevices>,
    connector: Arc<dyn Connector>,
    url: String,
    room_id: RoomId,
    user_id: UserId,
    call_type: CallType,
    policy: RetryPolicy,
) -> std::result::Result<Setup, (CallTrigger, String)> {
    let stream = media
        .acquire(call_type)
        .await
        .map_err(|err| (CallTrigger::MediaUnavailable, format!("{err:#}")))?;
    let (client, events) = SignalingClient::connect(connector, &url, room_id, user_id, policy)
        .await
        .map_err(|err| (CallTrigger::SignalingFailed, err.to_string()))?;
    Ok((stream, client, events))
}

const fn end_reason(trigger: CallTrigger, status: CallStatus) -> EndReason {
    match trigger {
        CallTrigger::HangUp if matches!(status, CallStatus::Missed) => EndReason::Missed,
        CallTrigger::RingTimeout => EndReason::Missed,
        CallTrigger::Decline => EndReason::Declined,
        CallTrigger::CalleeBusy => EndReason::Busy,
        CallTrigger::ConnectTimeout => EndReason::Timeout,
        CallTrigger::NegotiationFailed => EndReason::NegotiationFailed,
        CallTrigger::MediaUnavailable => EndReason::MediaUnavailable,
        CallTrigger::LastParticipantLeft | CallTrigger::PeerDisconnected
            if matches!(status, CallStatus::Ended) =>
        {
            EndReason::RemoteHangup
        }
        CallTrigger::HangUp => EndReason::LocalHangup,
        _ => EndReason::ConnectionLost,
    }
}

impl Agent {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Command>) {
        info!("call agent for {} started", self.user_id);
        while let Some(command) = queue.recv().await {
            if self.handle(command).await.is_break() {
                break;
            }
        }
        info!("call agent for {} stopped", self.user_id);
    }

    async fn handle(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Place { request, reply } => respond(reply, self.place_call(request).await),
            Command::Invite { invite, reply } => respond(reply, self.receive_invite(invite).await),
            Command::JoinGroup { session, reply } => {
                respond(reply, self.join_group_call(session).await);
            }
            Command::Act {
                call_id,
                action,
                reply,
            } => respond(reply, self.act(&call_id, action).await),
            Command::Snapshot { call_id, reply } => {
                let session = self
                    .calls
                    .get(&call_id)
                    .map(|call| &call.session)
                    .or_else(|| self.finished.get(&call_id))
                    .cloned();
                respond(reply, session);
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                respond(reply, ());
                return ControlFlow::Break(());
            }
            Command::Joined {
                call_id,
                stream,
                client,
                events,
            } => self.on_joined(&call_id, stream, client, events),
            Command::SetupFailed {
                call_id,
                trigger,
                reason,
            } => self.on_setup_failed(&call_id, trigger, &reason).await,
            Command::Signaling { call_id, event } => self.on_signaling(&call_id, event).await,
            Command::Backend {
                call_id,
                peer,
                generation,
                event,
            } => self.on_backend(&call_id, &peer, generation, event).await,
            Command::Timer { call_id, trigger } => self.on_timer(&call_id, trigger).await,
            Command::RejoinExpired {
                call_id,
                peer,
                generation,
            } => self.on_rejoin_expired(&call_id, &peer, generation).await,
        }
        ControlFlow::Continue(())
    }

    async fn place_call(&mut self, request: CallRequest) -> Result<CallSession> {
        if let Some(active) = self.engaged_call() {
            return Err(Error::AlreadyInCall(active));
        }
        let callees: Vec<UserId> = request
            .participants
            .into_iter()
            .filter(|user| *user != self.user_id)
            .collect();
        if callees.is_empty() {
            return Err(Error::InvalidRequest(
                "a call needs at least one other participant".to_owned(),
            ));
        }
        if !request.call_type.is_group() && callees.len() != 1 {
            return Err(Error::InvalidRequest(format!(
                "{} calls have exactly one callee",
                request.call_type.as_str()
            )));
        }

        let now = self.clock.now();
        let mut session = CallSession::new(
            request.scope,
            self.user_id.clone(),
            callees,
            request.call_type,
            now,
        );
        session.apply(CallTrigger::Initiate, now)?;
        self.collaborators.store.create_call_record(&session).await?;
        info!(
            "{} placed {} call {} in room {}",
            self.user_id,
            session.call_type.as_str(),
            session.id,
            session.room_id
        );

        let call_id = session.id.clone();
        self.calls
            .insert(call_id.clone(), ActiveCall::new(session.clone(), Role::Caller));
        self.arm_timer(&call_id, CallTrigger::RingTimeout, self.config.ring_timeout);
        self.begin_setup(&call_id);
        self.refresh_ringer();
        self.emit(CallEvent::StatusChanged {
            call_id,
            status: session.status,
        });
        Ok(session)
    }

    async fn receive_invite(&mut self, invite: CallSession) -> Result<InviteOutcome> {
        if invite.caller_id == self.user_id || !invite.participant_ids.contains(&self.user_id) {
            return Err(Error::InvalidRequest(format!(
                "invite {} is not addressed to {}",
                invite.id, self.user_id
            )));
        }
        if let Some(call) = self.calls.get(&invite.id) {
            return Ok(InviteOutcome::Ringing(call.session.clone()));
        }
        if let Some(done) = self.finished.get(&invite.id) {
            return Err(InvalidTransition {
                from: done.status,
                trigger: CallTrigger::Initiate,
            }
            .into());
        }

        let now = self.clock.now();
        let mut session = invite.as_received();
        let call_id = session.id.clone();

        if let Some(active_call) = self.engaged_call() {
            session.apply(CallTrigger::CalleeBusy, now)?;
            info!("{} is busy in {active_call}, rejecting {call_id}", self.user_id);
            self.calls
                .insert(call_id.clone(), ActiveCall::new(session, Role::Callee));
            self.emit(CallEvent::StatusChanged {
                call_id: call_id.clone(),
                status: CallStatus::Busy,
            });
            self.finish(&call_id, CallTrigger::CalleeBusy, CallStatus::Idle)
                .await;
            return Ok(InviteOutcome::Busy { active_call });
        }

        session.apply(CallTrigger::Initiate, now)?;
        info!("{} is ringing for call {call_id} from {}", self.user_id, session.caller_id);
        self.calls
            .insert(call_id.clone(), ActiveCall::new(session.clone(), Role::Callee));
        self.arm_timer(&call_id, CallTrigger::RingTimeout, self.config.ring_timeout);
        self.refresh_ringer();
        self.emit(CallEvent::IncomingCall(session.clone()));
        self.emit(CallEvent::StatusChanged {
            call_id,
            status: session.status,
        });
        Ok(InviteOutcome::Ringing(session))
    }

    async fn join_group_call(&mut self, session: CallSession) -> Result<CallSession> {
        if !session.call_type.is_group() {
            return Err(Error::InvalidRequest(format!(
                "call {} is not a group call",
                session.id
            )));
        }
        if let Some(call) = self.calls.get(&session.id) {
            return Ok(call.session.clone());
        }
        if let Some(active) = self.engaged_call() {
            return Err(Error::AlreadyInCall(active));
        }

        let now = self.clock.now();
        let mut joined = session.as_received();
        joined.add_participant(self.user_id.clone());
        joined.apply(CallTrigger::Initiate, now)?;
        joined.apply(CallTrigger::Accept, now)?;
        self.collaborators
            .store
            .add_participant(&joined.id, &self.user_id)
            .await?;
        info!("{} joins group call {}", self.user_id, joined.id);

        let call_id = joined.id.clone();
        self.calls
            .insert(call_id.clone(), ActiveCall::new(joined.clone(), Role::Participant));
        self.arm_timer(&call_id, CallTrigger::ConnectTimeout, self.config.connect_timeout);
        self.begin_setup(&call_id);
        self.emit(CallEvent::StatusChanged {
            call_id,
            status: joined.status,
        });
        Ok(joined)
    }

    async fn act(&mut self, call_id: &CallId, action: Action) -> Result<CallSession> {
        let Some(call) = self.calls.get(call_id) else {
            let trigger = match action {
                Action::Accept => CallTrigger::Accept,
                Action::Decline | Action::RemoteDeclined => CallTrigger::Decline,
                Action::HangUp => CallTrigger::HangUp,
                Action::RemoteBusy => CallTrigger::CalleeBusy,
            };
            return Err(self.gone(call_id, trigger));
        };
        let role = call.role;
        let status = call.session.status;

        let trigger = match (action, role) {
            (Action::Accept, Role::Callee) => {
                if let Some(active) = self.engaged_call() {
                    return Err(Error::AlreadyInCall(active));
                }
                if status == CallStatus::Ringing {
                    if let Some(closed) = self.closed_elsewhere(call_id).await {
                        return Err(self.retire_invite(call_id, closed).await);
                    }
                }
                CallTrigger::Accept
            }
            (Action::Decline, Role::Callee) | (Action::RemoteDeclined, Role::Caller) => {
                CallTrigger::Decline
            }
            (Action::HangUp, Role::Callee) if status == CallStatus::Ringing => CallTrigger::Decline,
            (Action::HangUp, _) => CallTrigger::HangUp,
            (Action::RemoteBusy, Role::Caller) => CallTrigger::CalleeBusy,
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "{action:?} is not available to the {role:?} of call {call_id}"
                )));
            }
        };

        let session = self.transition(call_id, trigger).await?;
        if session.status == CallStatus::Connecting {
            self.begin_setup(call_id);
        }
        Ok(session)
    }

    /// Terminal status of the shared record when the call was already closed
    /// by someone else, for instance a caller who cancelled.
    async fn closed_elsewhere(&self, call_id: &CallId) -> Option<CallStatus> {
        match self.collaborators.store.find_call_record(call_id).await {
            Ok(record) => record
                .map(|record| record.status)
                .filter(|status| status.is_terminal()),
            Err(err) => {
                warn!("could not look up call {call_id}: {err:#}");
                None
            }
        }
    }

    /// Stops ringing for an invite whose record is already `closed`.
    async fn retire_invite(&mut self, call_id: &CallId, closed: CallStatus) -> Error {
        info!("call {call_id} is already {closed}, retiring the invite");
        let trigger = match closed {
            CallStatus::Declined => CallTrigger::Decline,
            CallStatus::Busy => CallTrigger::CalleeBusy,
            _ => CallTrigger::RingTimeout,
        };
        self.apply_trigger(call_id, trigger).await;
        InvalidTransition {
            from: closed,
            trigger: CallTrigger::Accept,
        }
        .into()
    }

    fn gone(&self, call_id: &CallId, trigger: CallTrigger) -> Error {
        match self.finished.get(call_id) {
            Some(done) => InvalidTransition {
                from: done.status,
                trigger,
            }
            .into(),
            None => Error::CallNotFound(call_id.clone()),
        }
    }

    /// Applies `trigger` and everything entering the new status entails.
    async fn transition(&mut self, call_id: &CallId, trigger: CallTrigger) -> Result<CallSession> {
        let now = self.clock.now();
        let Some(call) = self.calls.get_mut(call_id) else {
            return Err(self.gone(call_id, trigger));
        };
        let previous = call.session.status;
        let status = call.session.apply(trigger, now)?;
        if previous == CallStatus::Ringing || status == CallStatus::Active {
            call.cancel_timer();
        }
        let session = call.session.clone();
        info!("call {call_id}: {previous} -> {status} on {trigger:?}");

        self.refresh_ringer();
        self.emit(CallEvent::StatusChanged {
            call_id: call_id.clone(),
            status,
        });
        if status == CallStatus::Connecting {
            self.arm_timer(call_id, CallTrigger::ConnectTimeout, self.config.connect_timeout);
        } else if status == CallStatus::Active {
            self.persist(&session).await;
        } else if status.is_terminal() {
            self.finish(call_id, trigger, previous).await;
        }
        Ok(session)
    }

    async fn apply_trigger(&mut self, call_id: &CallId, trigger: CallTrigger) {
        if let Err(err) = self.transition(call_id, trigger).await {
            debug!("ignoring {trigger:?} for call {call_id}: {err}");
        }
    }

    async fn persist(&self, session: &CallSession) -> bool {
        match self
            .collaborators
            .store
            .update_call_status(&session.id, &StatusUpdate::from(session))
            .await
        {
            Ok(applied) => applied,
            Err(err) => {
                error!("failed to persist call {}: {err:#}", session.id);
                false
            }
        }
    }

    /// Tears the call down, persists the terminal status and runs its side
    /// effects if this device was the one to record it.
    async fn finish(&mut self, call_id: &CallId, trigger: CallTrigger, previous: CallStatus) {
        let Some(mut call) = self.calls.remove(call_id) else {
            return;
        };
        let others_present = !call.links.is_empty();

        // non-initiators of a group call only close the shared record as the last one out
        let owns_record = !call.session.call_type.is_group()
            || call.role == Role::Caller
            || (previous.is_engaged() && !others_present);
        if owns_record && self.persist(&call.session).await {
            self.run_side_effects(&call.session, call.role).await;
        }
        call.teardown();
        let session = call.session;

        let can_retry = previous == CallStatus::Active && session.status == CallStatus::Failed;
        info!(
            "call {call_id} finished as {} after {}s",
            session.status,
            session.duration_seconds()
        );
        self.emit(CallEvent::CallEnded {
            call_id: call_id.clone(),
            status: session.status,
            reason: end_reason(trigger, session.status),
            can_retry,
        });
        self.finished.insert(session);
    }

    async fn run_side_effects(&self, session: &CallSession, role: Role) {
        let notifier = &*self.collaborators.notifier;
        match (session.status, role) {
            (CallStatus::Missed, _) => {
                record_missed(&*self.collaborators.store, notifier, session).await;
            }
            (CallStatus::Declined, Role::Callee) => {
                let name = self.display_name().await;
                notifier.notify_declined(&session.caller_id, &name);
            }
            (CallStatus::Busy, Role::Callee) => {
                let name = self.display_name().await;
                notifier.notify_busy(&session.caller_id, &name);
            }
            _ => {}
        }
    }

    async fn display_name(&self) -> String {
        self.collaborators
            .profiles
            .display_name(&self.user_id)
            .await
            .unwrap_or_else(|| self.user_id.to_string())
    }

    fn engaged_call(&self) -> Option<CallId> {
        self.calls
            .values()
            .find(|call| call.session.status.is_engaged())
            .map(|call| call.session.id.clone())
    }

    fn refresh_ringer(&mut self) {
        let ringing = |role: Role| {
            self.calls
                .values()
                .any(|call| call.role == role && call.session.status == CallStatus::Ringing)
        };
        let tone = if ringing(Role::Callee) {
            Some(Tone::Incoming)
        } else if ringing(Role::Caller) {
            Some(Tone::Ringback)
        } else {
            None
        };
        match tone {
            Some(tone) => {
                self.ringer.start(tone);
            }
            None => self.ringer.stop(),
        }
    }

    fn emit(&self, event: CallEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .notify(&event);
    }

    fn arm_timer(&mut self, call_id: &CallId, trigger: CallTrigger, after: Duration) {
        let Some(call) = self.calls.get_mut(call_id) else {
            return;
        };
        let commands = self.commands.clone();
        let id = call_id.clone();
        call.cancel_timer();
        call.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if commands.send(Command::Timer { call_id: id, trigger }).is_err() {
                debug!("agent gone before {trigger:?} fired");
            }
        }));
    }

    fn begin_setup(&mut self, call_id: &CallId) {
        let Some(call) = self.calls.get_mut(call_id) else {
            return;
        };
        if call.setup.is_some() || call.signaling.is_some() {
            return;
        }
        let media = Arc::clone(&self.collaborators.media);
        let connector = Arc::clone(&self.collaborators.connector);
        let url = self.config.signaling_url.clone();
        let policy = self.config.retry;
        let room_id = call.session.room_id.clone();
        let call_type = call.session.call_type;
        let user_id = self.user_id.clone();
        let commands = self.commands.clone();
        let id = call_id.clone();
        call.setup = Some(tokio::spawn(async move {
            let command = match open_media_and_room(
                media, connector, url, room_id, user_id, call_type, policy,
            )
            .await
            {
                Ok((stream, client, events)) => Command::Joined {
                    call_id: id,
                    stream,
                    client,
                    events,
                },
                Err((trigger, reason)) => Command::SetupFailed {
                    call_id: id,
                    trigger,
                    reason,
                },
            };
            if commands.send(command).is_err() {
                debug!("agent gone before call setup finished");
            }
        }));
    }

    fn on_joined(
        &mut self,
        call_id: &CallId,
        mut stream: LocalStream,
        client: SignalingClient,
        mut events: mpsc::UnboundedReceiver<SignalingEvent>,
    ) {
        let Some(call) = self.calls.get_mut(call_id) else {
            debug!("call {call_id} ended during setup, releasing media and room");
            stream.stop();
            client.disconnect();
            return;
        };
        call.setup = None;
        let commands = self.commands.clone();
        let id = call_id.clone();
        call.tasks.push(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let command = Command::Signaling {
                    call_id: id.clone(),
                    event,
                };
                if commands.send(command).is_err() {
                    break;
                }
            }
        }));
        info!("{} joined room {}", self.user_id, call.session.room_id);
        call.stream = Some(stream);
        call.signaling = Some(client);
    }

    async fn on_setup_failed(&mut self, call_id: &CallId, trigger: CallTrigger, reason: &str) {
        if !self.calls.contains_key(call_id) {
            return;
        }
        warn!("setting up call {call_id} failed: {reason}");
        if trigger == CallTrigger::SignalingFailed {
            self.emit(CallEvent::ConnectionFailed {
                call_id: call_id.clone(),
            });
        }
        self.apply_trigger(call_id, trigger).await;
    }

    async fn on_signaling(&mut self, call_id: &CallId, event: SignalingEvent) {
        match event {
            SignalingEvent::Message(message) => self.on_signal(call_id, message).await,
            SignalingEvent::Reconnecting { attempt, delay } => {
                info!("call {call_id}: relay lost, attempt {attempt} in {delay:?}");
            }
            SignalingEvent::Reconnected => {
                if self.calls.contains_key(call_id) {
                    info!("call {call_id}: relay connection restored");
                    self.emit(CallEvent::SignalingRestored {
                        call_id: call_id.clone(),
                    });
                }
            }
            SignalingEvent::ConnectionFailed => {
                if self.calls.contains_key(call_id) {
                    self.emit(CallEvent::ConnectionFailed {
                        call_id: call_id.clone(),
                    });
                    self.apply_trigger(call_id, CallTrigger::SignalingFailed)
                        .await;
                }
            }
        }
    }

    async fn on_signal(&mut self, call_id: &CallId, message: SignalMessage) {
        let Some(call) = self.calls.get(call_id) else {
            return;
        };
        if message.room_id != call.session.room_id {
            warn!(
                "dropping {} for room {} on call {call_id}",
                message.kind, message.room_id
            );
            return;
        }
        let from = message.from_user_id;
        let data = message.data;

        match message.kind {
            SignalKind::ExistingPeers => {
                let peers: Vec<UserId> = data
                    .peers
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|peer| *peer != self.user_id && self.admits(call_id, peer))
                    .collect();
                if peers.is_empty() {
                    debug!("call {call_id}: no one to connect to in the room");
                    return;
                }
                self.remote_arrived(call_id).await;
                // the newcomer offers to everyone already in the room
                for peer in peers {
                    if self.keep_link(call_id, &peer) {
                        continue;
                    }
                    if self.open_link(call_id, &peer).await {
                        self.offer_to(call_id, &peer).await;
                    }
                }
            }
            SignalKind::PeerJoined => {
                let Some(peer) = data.peer_id.filter(|peer| *peer != self.user_id) else {
                    return;
                };
                if !self.admits(call_id, &peer) {
                    return;
                }
                info!("call {call_id}: {peer} joined");
                self.remote_arrived(call_id).await;
                if !self.keep_link(call_id, &peer) {
                    self.open_link(call_id, &peer).await;
                }
            }
            SignalKind::PeerLeft => {
                if let Some(peer) = data.peer_id {
                    self.peer_left(call_id, &peer).await;
                }
            }
            SignalKind::Offer => {
                let Some(sdp) = data.sdp else {
                    return;
                };
                if !self.admits(call_id, &from) {
                    return;
                }
                let needs_link = self
                    .link_mut(call_id, &from)
                    .map_or(true, |link| link.negotiation() != Negotiation::New);
                if needs_link && !self.open_link(call_id, &from).await {
                    return;
                }
                let result = match self.link_mut(call_id, &from) {
                    Some(link) => link.handle_offer(sdp).await,
                    None => return,
                };
                if let Err(err) = result {
                    self.negotiation_failed(call_id, &from, &err).await;
                }
            }
            SignalKind::Answer => {
                let Some(sdp) = data.sdp else {
                    return;
                };
                let result = match self.link_mut(call_id, &from) {
                    Some(link) => link.handle_answer(sdp).await,
                    None => {
                        warn!("call {call_id}: answer from {from} without a link");
                        return;
                    }
                };
                if let Err(err) = result {
                    warn!("call {call_id}: ignoring answer from {from}: {err}");
                    self.emit(CallEvent::NegotiationError {
                        call_id: call_id.clone(),
                        peer: from,
                        message: err.to_string(),
                    });
                }
            }
            SignalKind::IceCandidate => {
                let Some(candidate) = data.candidate else {
                    return;
                };
                match self.link_mut(call_id, &from) {
                    Some(link) => link.handle_ice_candidate(candidate).await,
                    None => debug!("call {call_id}: candidate from {from} without a link"),
                }
            }
            SignalKind::Join | SignalKind::Leave => {
                debug!("call {call_id}: ignoring {} from the relay", message.kind);
            }
        }
    }

    /// A remote participant is in the room, the caller stops ringing.
    async fn remote_arrived(&mut self, call_id: &CallId) {
        let ringing_caller = self.calls.get(call_id).is_some_and(|call| {
            call.role == Role::Caller && call.session.status == CallStatus::Ringing
        });
        if ringing_caller {
            self.apply_trigger(call_id, CallTrigger::Accept).await;
        }
    }

    /// Group calls link with anyone in the room. A 1:1 call only links with its
    /// other participant, and with nobody else once that link exists.
    fn admits(&self, call_id: &CallId, peer: &UserId) -> bool {
        let Some(call) = self.calls.get(call_id) else {
            return false;
        };
        let admitted = call.session.call_type.is_group()
            || (call.session.participant_ids.contains(peer)
                && (call.links.is_empty() || call.links.contains_key(peer)));
        if !admitted {
            warn!("call {call_id}: ignoring {peer}, not a participant of this call");
        }
        admitted
    }

    /// Keeps a link that is still up when its peer shows up in the room again.
    fn keep_link(&mut self, call_id: &CallId, peer: &UserId) -> bool {
        let Some(link) = self
            .calls
            .get_mut(call_id)
            .and_then(|call| call.links.get_mut(peer))
        else {
            return false;
        };
        if !link.is_up() {
            return false;
        }
        link.rejoined();
        info!("call {call_id}: {peer} is back, keeping the link");
        true
    }

    /// The relay lost `peer`. A link that is still up waits for the peer to
    /// rejoin, anything else goes down right away.
    async fn peer_left(&mut self, call_id: &CallId, peer: &UserId) {
        let grace = self.config.peer_rejoin_grace;
        let commands = self.commands.clone();
        let Some(link) = self
            .calls
            .get_mut(call_id)
            .and_then(|call| call.links.get_mut(peer))
        else {
            return;
        };
        if !link.is_up() {
            info!("call {call_id}: {peer} left");
            self.link_down(call_id, peer, LinkDown::Left).await;
            return;
        }

        info!("call {call_id}: {peer} left the room, link stays up for {grace:?}");
        let id = call_id.clone();
        let remote = peer.clone();
        let generation = link.generation;
        link.rejoined();
        link.rejoin = Some(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let command = Command::RejoinExpired {
                call_id: id,
                peer: remote,
                generation,
            };
            if commands.send(command).is_err() {
                debug!("agent gone before the rejoin window closed");
            }
        }));
    }

    async fn on_rejoin_expired(&mut self, call_id: &CallId, peer: &UserId, generation: u64) {
        let expired = self
            .calls
            .get(call_id)
            .and_then(|call| call.links.get(peer))
            .is_some_and(|link| link.generation == generation && link.rejoin.is_some());
        if expired {
            info!("call {call_id}: {peer} did not come back");
            self.link_down(call_id, peer, LinkDown::Left).await;
        }
    }

    fn link_mut(&mut self, call_id: &CallId, peer: &UserId) -> Option<&mut PeerConnectionManager> {
        self.calls
            .get_mut(call_id)?
            .links
            .get_mut(peer)
            .map(|link| &mut link.manager)
    }

    /// Creates a fresh link to `peer`, replacing any previous one.
    async fn open_link(&mut self, call_id: &CallId, peer: &UserId) -> bool {
        let Some(call) = self.calls.get(call_id) else {
            return false;
        };
        let Some(signaling) = call.signaling.clone() else {
            warn!("call {call_id}: no relay connection for a link to {peer}");
            return false;
        };
        let room_id = call.session.room_id.clone();
        let (backend_tx, mut backend_rx) = mpsc::unbounded_channel();
        let ice_servers = self.config.connection_type.ice_servers();
        let backend = match self
            .collaborators
            .backends
            .create(&self.user_id, peer, &ice_servers, backend_tx)
            .await
        {
            Ok(backend) => backend,
            Err(err) => {
                error!("call {call_id}: could not create a link to {peer}: {err:#}");
                self.emit(CallEvent::NegotiationError {
                    call_id: call_id.clone(),
                    peer: peer.clone(),
                    message: err.to_string(),
                });
                return false;
            }
        };
        let mut manager = PeerConnectionManager::new(
            room_id,
            self.user_id.clone(),
            peer.clone(),
            backend,
            Arc::new(signaling) as Arc<dyn SignalSink>,
        );
        if let Some(stream) = self.calls.get(call_id).and_then(|call| call.stream.as_ref()) {
            if let Err(err) = manager.add_local_stream(stream).await {
                warn!("call {call_id}: could not attach media for {peer}: {err}");
            }
        }

        self.next_generation = self.next_generation.wrapping_add(1);
        let generation = self.next_generation;
        let commands = self.commands.clone();
        let id = call_id.clone();
        let remote = peer.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = backend_rx.recv().await {
                let command = Command::Backend {
                    call_id: id.clone(),
                    peer: remote.clone(),
                    generation,
                    event,
                };
                if commands.send(command).is_err() {
                    break;
                }
            }
        });
        let link = Link {
            generation,
            manager,
            forwarder,
            rejoin: None,
        };
        let Some(call) = self.calls.get_mut(call_id) else {
            link.close();
            return false;
        };
        if let Some(previous) = call.links.insert(peer.clone(), link) {
            debug!("call {call_id}: replacing link to {peer}");
            previous.close();
        }
        true
    }

    async fn offer_to(&mut self, call_id: &CallId, peer: &UserId) {
        let result = match self.link_mut(call_id, peer) {
            Some(link) => link.create_offer().await,
            None => return,
        };
        if let Err(err) = result {
            self.negotiation_failed(call_id, peer, &err).await;
        }
    }

    async fn negotiation_failed(&mut self, call_id: &CallId, peer: &UserId, err: &Error) {
        warn!("call {call_id}: negotiation with {peer} failed: {err}");
        self.emit(CallEvent::NegotiationError {
            call_id: call_id.clone(),
            peer: peer.clone(),
            message: err.to_string(),
        });
        self.link_down(call_id, peer, LinkDown::Negotiation).await;
    }

    /// Drops the link to `peer` and ends the call if nobody is left to talk to.
    async fn link_down(&mut self, call_id: &CallId, peer: &UserId, cause: LinkDown) {
        let Some(call) = self.calls.get_mut(call_id) else {
            return;
        };
        let Some(link) = call.links.remove(peer) else {
            return;
        };
        link.close();
        let is_group = call.session.call_type.is_group();
        let remaining = call.links.len();
        self.emit(CallEvent::PeerLeft {
            call_id: call_id.clone(),
            peer: peer.clone(),
        });
        if is_group && remaining > 0 {
            return;
        }
        let trigger = match cause {
            LinkDown::Left => CallTrigger::LastParticipantLeft,
            LinkDown::Disconnected if is_group => CallTrigger::LastParticipantLeft,
            LinkDown::Disconnected => CallTrigger::PeerDisconnected,
            LinkDown::Failed => CallTrigger::PeerFailed,
            LinkDown::Negotiation => CallTrigger::NegotiationFailed,
        };
        self.apply_trigger(call_id, trigger).await;
    }

    async fn on_backend(
        &mut self,
        call_id: &CallId,
        peer: &UserId,
        generation: u64,
        event: BackendEvent,
    ) {
        let Some(link) = self
            .calls
            .get_mut(call_id)
            .and_then(|call| call.links.get_mut(peer))
        else {
            return;
        };
        if link.generation != generation {
            debug!("call {call_id}: dropping event from a replaced link to {peer}");
            return;
        }
        let Some(state) = link.manager.handle_backend_event(event) else {
            return;
        };
        match state {
            ConnectionState::Connected => {
                self.emit(CallEvent::PeerConnected {
                    call_id: call_id.clone(),
                    peer: peer.clone(),
                });
                let connecting = self
                    .calls
                    .get(call_id)
                    .is_some_and(|call| call.session.status == CallStatus::Connecting);
                if connecting {
                    self.apply_trigger(call_id, CallTrigger::PeerConnected).await;
                }
            }
            ConnectionState::Failed => self.link_down(call_id, peer, LinkDown::Failed).await,
            ConnectionState::Disconnected | ConnectionState::Closed => {
                self.link_down(call_id, peer, LinkDown::Disconnected).await;
            }
            ConnectionState::New | ConnectionState::Connecting => {}
        }
    }

    async fn on_timer(&mut self, call_id: &CallId, trigger: CallTrigger) {
        let expected = match trigger {
            CallTrigger::RingTimeout => CallStatus::Ringing,
            _ => CallStatus::Connecting,
        };
        let due = self
            .calls
            .get(call_id)
            .is_some_and(|call| call.session.status == expected);
        if due {
            info!("call {call_id}: {trigger:?}");
            self.apply_trigger(call_id, trigger).await;
        }
    }

    async fn shutdown(&mut self) {
        let open: Vec<CallId> = self.calls.keys().cloned().collect();
        for call_id in open {
            self.apply_trigger(&call_id, CallTrigger::HangUp).await;
            if let Some(mut call) = self.calls.remove(&call_id) {
                call.teardown();
            }
        }
        self.ringer.dispose();
    }
}
