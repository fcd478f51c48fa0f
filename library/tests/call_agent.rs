//! Call lifecycles driven through agents connected by an in-memory relay.

mod common;

use std::time::Duration;

use peercall::call::{CallRequest, CallSession, CallStatus, CallType, InviteOutcome, Notification};
use peercall::feedback::{Tone, ToneAction};
use peercall::peer::ConnectionState;
use peercall::peer::media::SyntheticDevices;
use peercall::protocol::SignalMessage;
use peercall::signaling::{signaling_url, Connector, Transport};
use peercall::{CallEvent, Error, UserId};

use common::{settle, wait_for, wait_for_end, wait_for_status, Harness};

fn request(callee: &[&str], call_type: CallType) -> CallRequest {
    CallRequest {
        scope: "conv123".to_owned(),
        participants: callee.iter().map(|&user| UserId::from(user)).collect(),
        call_type,
    }
}

/// Connects `caller` and `callee` through an accepted call and waits until both are active.
async fn connected_call(
    harness: &Harness,
    caller: (&peercall::call::CallAgent, &mut tokio::sync::mpsc::UnboundedReceiver<CallEvent>),
    callee: (&peercall::call::CallAgent, &mut tokio::sync::mpsc::UnboundedReceiver<CallEvent>),
    call_type: CallType,
) -> CallSession {
    let session = caller
        .0
        .place_call(request(&[callee.0.user_id().as_str()], call_type))
        .await
        .unwrap();
    callee.0.receive_invite(session.clone()).await.unwrap();
    callee.0.accept(&session.id).await.unwrap();
    wait_for_status(caller.1, &session.id, CallStatus::Active).await;
    wait_for_status(callee.1, &session.id, CallStatus::Active).await;
    assert_eq!(
        harness.store.record(&session.id).await.unwrap().status,
        CallStatus::Active
    );
    session
}

#[tokio::test(start_paused = true)]
async fn test_video_call_from_invite_to_hangup() {
    let harness = Harness::new();
    let (carl, mut carl_events) = harness.agent("carl");
    let (dana, mut dana_events) = harness.agent("dana");

    let session = carl
        .place_call(request(&["dana"], CallType::Video))
        .await
        .unwrap();
    assert_eq!(session.status, CallStatus::Ringing);
    assert!(session.room_id.as_str().starts_with("video-call-conv123-"));

    let outcome = dana.receive_invite(session.clone()).await.unwrap();
    assert!(matches!(
        outcome,
        InviteOutcome::Ringing(ref ringing) if ringing.status == CallStatus::Ringing
    ));
    wait_for(&mut dana_events, |event| {
        matches!(event, CallEvent::IncomingCall(incoming) if incoming.id == session.id)
    })
    .await;

    dana.accept(&session.id).await.unwrap();
    wait_for(&mut carl_events, |event| {
        matches!(event, CallEvent::PeerConnected { peer, .. } if peer.as_str() == "dana")
    })
    .await;
    wait_for_status(&mut carl_events, &session.id, CallStatus::Active).await;
    wait_for_status(&mut dana_events, &session.id, CallStatus::Active).await;

    tokio::time::advance(Duration::from_secs(42)).await;
    let ended = carl.hang_up(&session.id).await.unwrap();
    assert_eq!(ended.status, CallStatus::Ended);
    assert_eq!(ended.duration_seconds(), 42);

    assert_eq!(
        wait_for_end(&mut dana_events, &session.id).await,
        (CallStatus::Ended, false)
    );
    settle().await;
    let record = harness.store.record(&session.id).await.unwrap();
    assert_eq!(record.status, CallStatus::Ended);
    assert_eq!(record.duration_seconds(), 42);
    assert_eq!(harness.media.live_tracks(), 0);
    assert!(harness.hub.members(&session.room_id).is_empty());

    let tones = harness.tones.actions();
    assert!(tones.contains(&ToneAction::Play(Tone::Ringback)));
    assert!(tones.contains(&ToneAction::Play(Tone::Incoming)));
    assert_eq!(tones.last(), Some(&ToneAction::Silence));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_is_missed_exactly_once() {
    let harness = Harness::new();
    let (carl, mut carl_events) = harness.agent("carl");
    let (dana, mut dana_events) = harness.agent("dana");

    let session = carl
        .place_call(request(&["dana"], CallType::Video))
        .await
        .unwrap();
    dana.receive_invite(session.clone()).await.unwrap();

    assert_eq!(
        wait_for_end(&mut carl_events, &session.id).await,
        (CallStatus::Missed, false)
    );
    assert_eq!(
        wait_for_end(&mut dana_events, &session.id).await,
        (CallStatus::Missed, false)
    );

    assert_eq!(
        harness.store.record(&session.id).await.unwrap().status,
        CallStatus::Missed
    );
    assert_eq!(harness.store.missed_calls("conv123").await.len(), 1);
    assert_eq!(
        harness.notifier.sent_to(&UserId::from("dana")),
        vec![Notification::MissedCall {
            callee: UserId::from("dana"),
            caller: UserId::from("carl"),
            call_type: CallType::Video,
        }]
    );

    let late = dana.accept(&session.id).await.unwrap_err();
    assert!(matches!(late, Error::InvalidTransition(_)));
    assert_eq!(
        dana.session(&session.id).await.unwrap().unwrap().status,
        CallStatus::Missed
    );
}

#[tokio::test(start_paused = true)]
async fn test_callee_in_a_call_answers_busy_without_ringing() {
    let harness = Harness::new();
    harness.profiles.insert(UserId::from("dana"), "Dana").await;
    let (erin, mut erin_events) = harness.agent("erin");
    let (dana, mut dana_events) = harness.agent("dana");
    let (carl, _carl_events) = harness.agent("carl");

    let first = connected_call(
        &harness,
        (&erin, &mut erin_events),
        (&dana, &mut dana_events),
        CallType::Audio,
    )
    .await;

    let second = carl
        .place_call(request(&["dana"], CallType::Audio))
        .await
        .unwrap();
    let outcome = dana.receive_invite(second.clone()).await.unwrap();
    assert_eq!(
        outcome,
        InviteOutcome::Busy {
            active_call: first.id.clone()
        }
    );
    let busy = carl.remote_busy(&second.id).await.unwrap();
    assert_eq!(busy.status, CallStatus::Busy);

    assert_eq!(
        harness.store.record(&second.id).await.unwrap().status,
        CallStatus::Busy
    );
    assert_eq!(
        harness.notifier.sent_to(&UserId::from("carl")),
        vec![Notification::Busy {
            caller: UserId::from("carl"),
            callee_name: "Dana".to_owned(),
        }]
    );

    while let Ok(event) = dana_events.try_recv() {
        match event {
            CallEvent::IncomingCall(incoming) => assert_ne!(incoming.id, second.id),
            CallEvent::StatusChanged { call_id, status } if call_id == second.id => {
                assert_eq!(status, CallStatus::Busy);
            }
            _ => {}
        }
    }
    assert_eq!(
        dana.session(&first.id).await.unwrap().unwrap().status,
        CallStatus::Active
    );
}

#[tokio::test(start_paused = true)]
async fn test_declined_call_notifies_caller_once() {
    let harness = Harness::new();
    harness.profiles.insert(UserId::from("dana"), "Dana").await;
    let (carl, _carl_events) = harness.agent("carl");
    let (dana, _dana_events) = harness.agent("dana");

    let session = carl
        .place_call(request(&["dana"], CallType::Audio))
        .await
        .unwrap();
    dana.receive_invite(session.clone()).await.unwrap();

    let declined = dana.decline(&session.id).await.unwrap();
    assert_eq!(declined.status, CallStatus::Declined);
    let declined = carl.remote_declined(&session.id).await.unwrap();
    assert_eq!(declined.status, CallStatus::Declined);

    assert_eq!(
        harness.store.record(&session.id).await.unwrap().status,
        CallStatus::Declined
    );
    assert_eq!(
        harness.notifier.sent(),
        vec![Notification::Declined {
            caller: UserId::from("carl"),
            callee_name: "Dana".to_owned(),
        }]
    );
    assert!(harness.store.missed_calls("conv123").await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_setup_releases_devices() {
    let harness = Harness::with_media(SyntheticDevices::with_latency(Duration::from_secs(5)));
    let (carl, mut carl_events) = harness.agent("carl");

    let session = carl
        .place_call(request(&["dana"], CallType::Video))
        .await
        .unwrap();
    let cancelled = carl.hang_up(&session.id).await.unwrap();
    assert_eq!(cancelled.status, CallStatus::Missed);
    assert_eq!(
        wait_for_end(&mut carl_events, &session.id).await,
        (CallStatus::Missed, false)
    );

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(harness.media.live_tracks(), 0);
    assert!(harness.hub.members(&session.room_id).is_empty());
    assert_eq!(harness.store.missed_calls("conv123").await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_second_call_while_engaged_is_refused() {
    let harness = Harness::new();
    let (carl, mut carl_events) = harness.agent("carl");
    let (dana, mut dana_events) = harness.agent("dana");

    connected_call(
        &harness,
        (&carl, &mut carl_events),
        (&dana, &mut dana_events),
        CallType::Audio,
    )
    .await;

    let error = carl
        .place_call(request(&["erin"], CallType::Audio))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::AlreadyInCall(_)));

    let error = carl
        .place_call(request(&["dana", "erin"], CallType::Video))
        .await
        .unwrap_err();
    assert!(matches!(error, Error::AlreadyInCall(_)));
}

#[tokio::test(start_paused = true)]
async fn test_invalid_requests_are_rejected() {
    let harness = Harness::new();
    let (carl, _events) = harness.agent("carl");

    let nobody = carl.place_call(request(&["carl"], CallType::Audio)).await;
    assert!(matches!(nobody, Err(Error::InvalidRequest(_))));

    let two = carl
        .place_call(request(&["dana", "erin"], CallType::Video))
        .await;
    assert!(matches!(two, Err(Error::InvalidRequest(_))));
}

#[tokio::test(start_paused = true)]
async fn test_failed_link_ends_call_with_retry_hint() {
    let harness = Harness::new();
    let (carl, mut carl_events) = harness.agent("carl");
    let (dana, mut dana_events) = harness.agent("dana");

    let session = connected_call(
        &harness,
        (&carl, &mut carl_events),
        (&dana, &mut dana_events),
        CallType::Video,
    )
    .await;

    assert!(harness.backends.inject(
        &UserId::from("carl"),
        &UserId::from("dana"),
        ConnectionState::Failed
    ));

    assert_eq!(
        wait_for_end(&mut carl_events, &session.id).await,
        (CallStatus::Failed, true)
    );
    assert_eq!(
        wait_for_end(&mut dana_events, &session.id).await,
        (CallStatus::Ended, false)
    );
    assert_eq!(
        harness.store.record(&session.id).await.unwrap().status,
        CallStatus::Failed
    );
    assert_eq!(harness.media.live_tracks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_relay_loss_fails_call_after_retries() {
    let harness = Harness::new();
    let (carl, mut carl_events) = harness.agent("carl");
    let (dana, mut dana_events) = harness.agent("dana");

    let session = connected_call(
        &harness,
        (&carl, &mut carl_events),
        (&dana, &mut dana_events),
        CallType::Audio,
    )
    .await;

    harness.hub.refuse_connections(true);
    harness.hub.drop_socket(&session.room_id, &UserId::from("carl"));

    wait_for(&mut carl_events, |event| {
        matches!(event, CallEvent::ConnectionFailed { call_id } if *call_id == session.id)
    })
    .await;
    assert_eq!(
        wait_for_end(&mut carl_events, &session.id).await,
        (CallStatus::Failed, true)
    );
    assert_eq!(
        wait_for_end(&mut dana_events, &session.id).await,
        (CallStatus::Ended, false)
    );
    assert_eq!(
        harness.store.record(&session.id).await.unwrap().status,
        CallStatus::Failed
    );
}

#[tokio::test(start_paused = true)]
async fn test_brief_relay_drop_keeps_the_call() {
    let harness = Harness::new();
    let (carl, mut carl_events) = harness.agent("carl");
    let (dana, mut dana_events) = harness.agent("dana");

    let session = connected_call(
        &harness,
        (&carl, &mut carl_events),
        (&dana, &mut dana_events),
        CallType::Video,
    )
    .await;

    harness.hub.drop_socket(&session.room_id, &UserId::from("carl"));
    wait_for(&mut carl_events, |event| {
        matches!(event, CallEvent::SignalingRestored { call_id } if *call_id == session.id)
    })
    .await;
    settle().await;

    assert_eq!(
        harness.hub.members(&session.room_id),
        vec![UserId::from("carl"), UserId::from("dana")]
    );
    for agent in [&carl, &dana] {
        assert_eq!(
            agent.session(&session.id).await.unwrap().unwrap().status,
            CallStatus::Active
        );
    }
    assert_eq!(
        harness.store.record(&session.id).await.unwrap().status,
        CallStatus::Active
    );
    // the rejoin reused the existing links
    assert_eq!(harness.backends.created(), 2);

    tokio::time::sleep(harness_grace() * 2).await;
    assert_eq!(
        dana.session(&session.id).await.unwrap().unwrap().status,
        CallStatus::Active
    );

    carl.hang_up(&session.id).await.unwrap();
    assert_eq!(
        wait_for_end(&mut dana_events, &session.id).await,
        (CallStatus::Ended, false)
    );
    while let Ok(event) = carl_events.try_recv() {
        assert!(!matches!(event, CallEvent::PeerLeft { .. }), "{event:?}");
    }
}

fn harness_grace() -> Duration {
    common::config().peer_rejoin_grace
}

#[tokio::test(start_paused = true)]
async fn test_peer_that_never_rejoins_ends_the_call() {
    let harness = Harness::new();
    let mut patient = common::config();
    patient.retry.max_attempts = 10;
    let (carl, mut carl_events) = harness.agent_with("carl", patient);
    let (dana, mut dana_events) = harness.agent("dana");

    let session = connected_call(
        &harness,
        (&carl, &mut carl_events),
        (&dana, &mut dana_events),
        CallType::Audio,
    )
    .await;

    // carl keeps retrying the relay for longer than dana waits
    harness.hub.refuse_connections(true);
    harness.hub.drop_socket(&session.room_id, &UserId::from("carl"));
    let started = tokio::time::Instant::now();
    tokio::time::sleep(harness_grace() / 2).await;
    assert_eq!(
        dana.session(&session.id).await.unwrap().unwrap().status,
        CallStatus::Active
    );

    assert_eq!(
        wait_for_end(&mut dana_events, &session.id).await,
        (CallStatus::Ended, false)
    );
    assert!(started.elapsed() >= harness_grace());
    assert_eq!(
        wait_for_end(&mut carl_events, &session.id).await,
        (CallStatus::Ended, false)
    );
}

#[tokio::test(start_paused = true)]
async fn test_stranger_in_a_direct_call_room_is_ignored() {
    let harness = Harness::new();
    let (carl, mut carl_events) = harness.agent("carl");
    let (dana, mut dana_events) = harness.agent("dana");

    let session = connected_call(
        &harness,
        (&carl, &mut carl_events),
        (&dana, &mut dana_events),
        CallType::Video,
    )
    .await;
    assert_eq!(harness.backends.created(), 2);

    let url = signaling_url(
        &common::config().signaling_url,
        &session.room_id,
        &UserId::from("erin"),
    );
    let mut stranger = harness.hub.connect(&url).await.unwrap();
    let offer = SignalMessage::offer(
        session.room_id.clone(),
        UserId::from("erin"),
        UserId::from("carl"),
        "v=0\r\no=- 99 2 IN IP4 127.0.0.1\r\n".to_owned(),
    );
    stranger
        .send(serde_json::to_string(&offer).unwrap())
        .await
        .unwrap();
    settle().await;

    assert_eq!(harness.backends.created(), 2);
    for agent in [&carl, &dana] {
        assert_eq!(
            agent.session(&session.id).await.unwrap().unwrap().status,
            CallStatus::Active
        );
    }
    while let Ok(event) = carl_events.try_recv() {
        assert!(
            !matches!(
                event,
                CallEvent::PeerConnected { ref peer, .. } | CallEvent::NegotiationError { ref peer, .. }
                    if peer.as_str() == "erin"
            ),
            "{event:?}"
        );
    }

    stranger.close().await.unwrap();
    settle().await;
    assert_eq!(
        carl.session(&session.id).await.unwrap().unwrap().status,
        CallStatus::Active
    );
}

#[tokio::test(start_paused = true)]
async fn test_accepting_a_cancelled_invite_is_refused() {
    let harness = Harness::new();
    let (carl, mut carl_events) = harness.agent("carl");
    let (dana, mut dana_events) = harness.agent("dana");

    let session = carl
        .place_call(request(&["dana"], CallType::Audio))
        .await
        .unwrap();
    dana.receive_invite(session.clone()).await.unwrap();
    carl.hang_up(&session.id).await.unwrap();
    assert_eq!(
        wait_for_end(&mut carl_events, &session.id).await,
        (CallStatus::Missed, false)
    );

    let refused = dana.accept(&session.id).await.unwrap_err();
    assert!(matches!(
        refused,
        Error::InvalidTransition(ref invalid) if invalid.from == CallStatus::Missed
    ));
    assert_eq!(
        wait_for_end(&mut dana_events, &session.id).await,
        (CallStatus::Missed, false)
    );
    assert_eq!(
        dana.session(&session.id).await.unwrap().unwrap().status,
        CallStatus::Missed
    );
    settle().await;
    assert!(harness.hub.members(&session.room_id).is_empty());
    assert_eq!(harness.backends.created(), 0);
    assert_eq!(harness.store.missed_calls("conv123").await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_group_call_forms_full_mesh() {
    let harness = Harness::new();
    let (carl, mut carl_events) = harness.agent("carl");
    let (dana, mut dana_events) = harness.agent("dana");
    let (erin, mut erin_events) = harness.agent("erin");

    let session = carl
        .place_call(request(&["dana", "erin"], CallType::Group))
        .await
        .unwrap();
    assert!(session.room_id.as_str().starts_with("group-call-conv123-"));

    dana.receive_invite(session.clone()).await.unwrap();
    dana.accept(&session.id).await.unwrap();
    wait_for_status(&mut carl_events, &session.id, CallStatus::Active).await;
    wait_for_status(&mut dana_events, &session.id, CallStatus::Active).await;

    let joined = erin.join_group_call(session.clone()).await.unwrap();
    assert_eq!(joined.status, CallStatus::Connecting);
    wait_for_status(&mut erin_events, &session.id, CallStatus::Active).await;
    for events in [&mut carl_events, &mut dana_events] {
        wait_for(events, |event| {
            matches!(event, CallEvent::PeerConnected { peer, .. } if peer.as_str() == "erin")
        })
        .await;
    }
    // one backend per side of each of the three pairs
    assert_eq!(harness.backends.created(), 6);

    erin.hang_up(&session.id).await.unwrap();
    for events in [&mut carl_events, &mut dana_events] {
        wait_for(events, |event| {
            matches!(event, CallEvent::PeerLeft { peer, .. } if peer.as_str() == "erin")
        })
        .await;
    }
    assert_eq!(
        carl.session(&session.id).await.unwrap().unwrap().status,
        CallStatus::Active
    );
    assert_eq!(
        harness.store.record(&session.id).await.unwrap().status,
        CallStatus::Active
    );

    dana.hang_up(&session.id).await.unwrap();
    assert_eq!(
        wait_for_end(&mut carl_events, &session.id).await,
        (CallStatus::Ended, false)
    );
    assert_eq!(
        harness.store.record(&session.id).await.unwrap().status,
        CallStatus::Ended
    );
    settle().await;
    assert!(harness.hub.members(&session.room_id).is_empty());
}
