/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

mod common;

use std::sync::Arc;
use std::time::Duration;

use careline_core::media::TrackKind;
use careline_core::peer::PeerConnectionState;
use careline_core::transport::SignalingTransport;
use careline_core::{CallAgent, CallError, CallEvent, CallRole, CallSession, CallSnapshot, CallState, EndReason};
use careline_protocol::{room_id_for, CallKind, IceCandidate, SignalPayload, SignalingMessage};
use common::{wait_state, FakeMedia, LoopbackHub, Party, PeerBehavior, PeerStats};
use tokio::time::Instant;

fn is(state: CallState) -> impl Fn(&CallSnapshot) -> bool {
    move |s: &CallSnapshot| s.state == state
}

fn terminal(s: &CallSnapshot) -> bool {
    s.state.is_terminal()
}

fn assert_released(snap: &CallSnapshot) {
    assert_eq!(snap.active_timers, 0);
    assert_eq!(snap.connection_state, PeerConnectionState::Closed);
}

async fn connected_pair(hub: &std::sync::Arc<LoopbackHub>, a: &Party, b: &Party) -> (CallSession, CallSession) {
    let agent_b = CallAgent::new(b.deps());
    let sa = CallSession::idle(a.deps());
    sa.start_call(b.uid, CallKind::Audio).await.unwrap();
    let sb = agent_b.next_incoming().await.unwrap();
    sb.accept_call().await.unwrap();
    wait_state(&sa, is(CallState::Connected)).await;
    wait_state(&sb, is(CallState::Connected)).await;
    assert_eq!(hub.count(a.uid.min(b.uid), "offer"), 1);
    assert_eq!(sa.snapshot().active_timers, 0);
    assert_eq!(sb.snapshot().active_timers, 0);
    (sa, sb)
}

#[tokio::test(start_paused = true)]
async fn simultaneous_calls_converge_on_one_offer_from_lower_uid() {
    let hub = LoopbackHub::new();
    let a = Party::new(&hub, 5);
    let b = Party::new(&hub, 9);
    let sa = CallSession::idle(a.deps());
    let sb = CallSession::idle(b.deps());

    let (ra, rb) = tokio::join!(sa.start_call(9, CallKind::Audio), sb.start_call(5, CallKind::Audio));
    ra.unwrap();
    rb.unwrap();

    let snap_a = wait_state(&sa, is(CallState::Connected)).await;
    let snap_b = wait_state(&sb, is(CallState::Connected)).await;
    assert_eq!(snap_a.room_id, snap_b.room_id);
    assert!(snap_a.established_at_ms.is_some());

    assert_eq!(hub.count(5, "offer"), 1);
    assert_eq!(hub.count(9, "offer"), 0);
    assert_eq!(hub.count(9, "answer"), 1);
    assert_eq!(hub.count(5, "answer"), 0);
    assert_eq!(PeerStats::get(&a.peers.stats.offers), 1);
    assert_eq!(PeerStats::get(&b.peers.stats.offers), 0);
    assert_eq!(PeerStats::get(&b.peers.stats.answers), 1);
}

#[tokio::test(start_paused = true)]
async fn calling_back_a_ringing_peer_accepts_the_ringing_call() {
    let hub = LoopbackHub::new();
    let a = Party::new(&hub, 5);
    let b = Party::new(&hub, 9);
    let agent_b = Arc::new(CallAgent::new(b.deps()));
    let incoming = tokio::spawn({
        let agent_b = agent_b.clone();
        async move { agent_b.next_incoming().await }
    });

    let sa = CallSession::idle(a.deps());
    sa.start_call(9, CallKind::Audio).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let sb = agent_b.call(5, CallKind::Audio).await.unwrap();
    let ringing = incoming.await.unwrap().unwrap();

    assert_eq!(sb.snapshot().role, Some(CallRole::Callee));
    wait_state(&sa, is(CallState::Connected)).await;
    wait_state(&sb, is(CallState::Connected)).await;
    assert_eq!(ringing.state(), CallState::Connected);
    assert_eq!(agent_b.active_rooms(), vec![room_id_for(5, 9)]);
    assert_eq!(hub.count(9, "call-invite"), 0);
    assert_eq!(hub.count(5, "offer"), 1);
    assert_eq!(hub.count(9, "answer"), 1);
    assert_eq!(PeerStats::get(&b.peers.stats.created), 1);
}

#[tokio::test(start_paused = true)]
async fn invite_crossing_an_outgoing_call_does_not_open_a_second_session() {
    let hub = LoopbackHub::new();
    let a = Party::new(&hub, 5);
    let b = Party::new(&hub, 9);
    let agent_b = Arc::new(CallAgent::new(b.deps()));
    let incoming = tokio::spawn({
        let agent_b = agent_b.clone();
        async move { agent_b.next_incoming().await }
    });

    let sa = CallSession::idle(a.deps());
    let (sb, ra) = tokio::join!(agent_b.call(5, CallKind::Audio), sa.start_call(9, CallKind::Audio));
    let sb = sb.unwrap();
    ra.unwrap();

    wait_state(&sa, is(CallState::Connected)).await;
    wait_state(&sb, is(CallState::Connected)).await;
    assert_eq!(sb.snapshot().role, Some(CallRole::Caller));
    assert!(!incoming.is_finished());
    assert_eq!(agent_b.active_rooms(), vec![room_id_for(5, 9)]);
    assert_eq!(hub.count(5, "offer"), 1);
    assert_eq!(hub.count(9, "offer"), 0);
    incoming.abort();
}

#[tokio::test(start_paused = true)]
async fn calling_a_peer_twice_is_rejected() {
    let hub = LoopbackHub::new();
    let a = Party::new(&hub, 5);
    let _b = Party::new(&hub, 9);
    let agent_a = CallAgent::new(a.deps());

    let first = agent_a.call(9, CallKind::Audio).await.unwrap();
    match agent_a.call(9, CallKind::Audio).await {
        Err(CallError::InvalidState { op, state }) => {
            assert_eq!(op, "call");
            assert_eq!(state, CallState::Ringing);
        }
        other => panic!("unexpected {:?}", other.map(|s| s.state())),
    }
    assert_eq!(first.state(), CallState::Ringing);
    assert!(a.transport.router.is_joined(&room_id_for(5, 9)));
    assert_eq!(hub.count(5, "call-invite"), 1);
}

#[tokio::test(start_paused = true)]
async fn unanswered_invite_fails_with_no_answer_and_leaves_room() {
    let hub = LoopbackHub::new();
    let a = Party::new(&hub, 5);
    let _b = Party::new(&hub, 9);
    let sa = CallSession::idle(a.deps());

    let started = Instant::now();
    sa.start_call(9, CallKind::Video).await.unwrap();
    let ringing = sa.snapshot();
    assert_eq!(ringing.state, CallState::Ringing);
    assert_eq!(ringing.active_timers, 1);

    let end = wait_state(&sa, terminal).await;
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(end.state, CallState::Failed);
    assert_eq!(end.end_reason, Some(EndReason::NoAnswer));
    assert_released(&end);
    assert!(!a.transport.router.is_joined(&room_id_for(5, 9)));
    assert_eq!(hub.count(5, "call-end"), 1);
}

#[tokio::test(start_paused = true)]
async fn end_call_from_idle_and_ringing_releases_everything() {
    let hub = LoopbackHub::new();
    let a = Party::new(&hub, 5);
    let b = Party::new(&hub, 9);
    let agent_b = CallAgent::new(b.deps());

    let idle = CallSession::idle(a.deps());
    idle.end_call().await.unwrap();
    let snap = idle.snapshot();
    assert_eq!(snap.state, CallState::Ended);
    assert_released(&snap);
    // A second hangup is a no-op.
    idle.end_call().await.unwrap();

    let caller = CallSession::idle(a.deps());
    caller.start_call(9, CallKind::Audio).await.unwrap();
    let callee = agent_b.next_incoming().await.unwrap();
    wait_state(&callee, is(CallState::Ringing)).await;

    callee.end_call().await.unwrap();
    let snap = callee.snapshot();
    assert_eq!(snap.end_reason, Some(EndReason::LocalHangup));
    assert_released(&snap);

    let snap = wait_state(&caller, terminal).await;
    assert_eq!(snap.state, CallState::Ended);
    assert_eq!(snap.end_reason, Some(EndReason::RemoteHangup));
    assert_released(&snap);
    assert!(!a.transport.router.is_joined(&room_id_for(5, 9)));
    assert!(!b.transport.router.is_joined(&room_id_for(5, 9)));
}

#[tokio::test(start_paused = true)]
async fn end_call_while_negotiating_closes_the_peer() {
    let hub = LoopbackHub::new();
    let a = Party::with(&hub, 5, PeerBehavior::Stall, FakeMedia::new());
    let b = Party::with(&hub, 9, PeerBehavior::Stall, FakeMedia::new());
    let agent_b = CallAgent::new(b.deps());

    let sa = CallSession::idle(a.deps());
    sa.start_call(9, CallKind::Audio).await.unwrap();
    let sb = agent_b.next_incoming().await.unwrap();
    sb.accept_call().await.unwrap();
    wait_state(&sa, is(CallState::Negotiating)).await;
    assert_eq!(sa.snapshot().active_timers, 1);

    sa.end_call().await.unwrap();
    let snap = sa.snapshot();
    assert_eq!(snap.state, CallState::Ended);
    assert_released(&snap);
    assert_eq!(PeerStats::get(&a.peers.stats.closed), 1);
    assert_eq!(a.media.released.load(std::sync::atomic::Ordering::SeqCst), 1);

    let snap = wait_state(&sb, terminal).await;
    assert_eq!(snap.end_reason, Some(EndReason::RemoteHangup));
    assert_eq!(PeerStats::get(&b.peers.stats.closed), 1);
}

#[tokio::test(start_paused = true)]
async fn end_call_while_connected() {
    let hub = LoopbackHub::new();
    let a = Party::new(&hub, 5);
    let b = Party::new(&hub, 9);
    let (sa, sb) = connected_pair(&hub, &a, &b).await;

    sb.end_call().await.unwrap();
    let snap = sb.snapshot();
    assert_eq!(snap.state, CallState::Ended);
    assert_released(&snap);
    assert_eq!(PeerStats::get(&b.peers.stats.closed), 1);

    let snap = wait_state(&sa, terminal).await;
    assert_eq!(snap.end_reason, Some(EndReason::RemoteHangup));
    assert_released(&snap);
}

#[tokio::test(start_paused = true)]
async fn callee_reject_fails_the_caller() {
    let hub = LoopbackHub::new();
    let a = Party::new(&hub, 5);
    let b = Party::new(&hub, 9);
    let agent_b = CallAgent::new(b.deps());

    let sa = CallSession::idle(a.deps());
    sa.start_call(9, CallKind::Audio).await.unwrap();
    let sb = agent_b.next_incoming().await.unwrap();
    assert_eq!(sb.snapshot().remote_name.as_deref(), Some("user 5"));
    sb.reject_call().await.unwrap();

    let snap_b = wait_state(&sb, terminal).await;
    assert_eq!(snap_b.state, CallState::Ended);
    assert_eq!(snap_b.end_reason, Some(EndReason::LocalRejected));

    let snap_a = wait_state(&sa, terminal).await;
    assert_eq!(snap_a.state, CallState::Failed);
    assert_eq!(snap_a.end_reason, Some(EndReason::Rejected));
    assert_eq!(hub.count(9, "call-reject"), 1);
    // Neither side created a peer connection.
    assert_eq!(PeerStats::get(&a.peers.stats.created), 0);
}

#[tokio::test(start_paused = true)]
async fn invite_to_offline_user_fails_fast() {
    let hub = LoopbackHub::new();
    let a = Party::new(&hub, 5);
    let sa = CallSession::idle(a.deps());
    let started = Instant::now();
    sa.start_call(77, CallKind::Audio).await.unwrap();
    let snap = wait_state(&sa, terminal).await;
    assert_eq!(snap.end_reason, Some(EndReason::PeerOffline));
    assert_eq!(snap.state, CallState::Failed);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(start_paused = true)]
async fn full_peer_queue_does_not_end_the_call() {
    let hub = LoopbackHub::new();
    let a = Party::new(&hub, 5);
    let _b = Party::new(&hub, 9);
    let mut sa = CallSession::idle(a.deps());
    let mut events = sa.take_events().unwrap();
    sa.start_call(9, CallKind::Audio).await.unwrap();

    let room = room_id_for(5, 9);
    assert!(a.transport.router.notify(
        &room,
        careline_core::transport::TransportEvent::PeerUnavailable {
            target_uid: 9,
            reason: careline_protocol::DELIVERY_QUEUE_FULL.into(),
        },
    ));
    loop {
        match events.recv().await {
            Some(CallEvent::Error(CallError::Transport(msg))) => {
                assert!(msg.contains("queue full"));
                break;
            }
            Some(CallEvent::Ended { reason, .. }) => panic!("call ended: {reason}"),
            Some(_) => {}
            None => panic!("event stream closed"),
        }
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sa.state(), CallState::Ringing);
    sa.end_call().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn media_permission_denied_fails_without_retry() {
    let hub = LoopbackHub::new();
    let a = Party::new(&hub, 5);
    let b = Party::with(&hub, 9, PeerBehavior::Connect, FakeMedia::denying());
    let agent_b = CallAgent::new(b.deps());

    let sa = CallSession::idle(a.deps());
    sa.start_call(9, CallKind::Video).await.unwrap();
    let mut sb = agent_b.next_incoming().await.unwrap();
    let mut events = sb.take_events().unwrap();

    let err = sb.accept_call().await.unwrap_err();
    assert!(matches!(err, CallError::MediaPermissionDenied(_)));
    let snap = wait_state(&sb, terminal).await;
    assert_eq!(snap.state, CallState::Failed);
    assert_eq!(snap.end_reason, Some(EndReason::MediaPermissionDenied));
    assert_eq!(PeerStats::get(&b.peers.stats.created), 0);

    let mut saw_error = false;
    let mut saw_ended = false;
    while let Some(ev) = events.recv().await {
        match ev {
            CallEvent::Error(CallError::MediaPermissionDenied(_)) => saw_error = true,
            CallEvent::Ended { reason, .. } => {
                assert_eq!(reason, EndReason::MediaPermissionDenied);
                saw_ended = true;
            }
            _ => {}
        }
    }
    assert!(saw_error && saw_ended);

    let snap = wait_state(&sa, terminal).await;
    assert_eq!(snap.end_reason, Some(EndReason::RemoteHangup));
}

#[tokio::test(start_paused = true)]
async fn candidates_before_remote_description_are_applied() {
    let hub = LoopbackHub::new();
    let caller = hub.connect(5);
    let b = Party::new(&hub, 9);
    let agent_b = CallAgent::new(b.deps());
    let room = room_id_for(5, 9);
    let mut caller_sub = caller.join(&room).await.unwrap();

    let cand = |n: u32| SignalPayload::IceCandidate {
        candidate: IceCandidate {
            candidate: format!("candidate:{n} 1 udp 1 10.0.0.5 4000{n} typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        },
    };
    let send = |payload: SignalPayload| caller.send(9, SignalingMessage::new(5, room.clone(), payload));

    send(SignalPayload::CallInvite {
        call_kind: CallKind::Audio,
        caller_name: None,
    })
    .await
    .unwrap();
    let sb = agent_b.next_incoming().await.unwrap();
    wait_state(&sb, is(CallState::Ringing)).await;

    send(cand(1)).await.unwrap();
    sb.accept_call().await.unwrap();
    send(cand(2)).await.unwrap();
    send(SignalPayload::Offer { sdp: "v=0 caller".into() }).await.unwrap();

    wait_state(&sb, is(CallState::Connected)).await;
    assert_eq!(PeerStats::get(&b.peers.stats.candidates), 2);

    let mut kinds = Vec::new();
    while kinds.len() < 2 {
        match caller_sub.recv().await {
            Some(careline_core::transport::TransportEvent::Message(m)) => kinds.push(m.kind()),
            other => panic!("unexpected {other:?}"),
        }
    }
    assert_eq!(kinds, vec!["call-accept", "answer"]);
}

#[tokio::test(start_paused = true)]
async fn toggles_flip_tracks_without_renegotiating() {
    let hub = LoopbackHub::new();
    let a = Party::new(&hub, 5);
    let b = Party::new(&hub, 9);
    let agent_b = CallAgent::new(b.deps());

    let sa = CallSession::idle(a.deps());
    sa.start_call(9, CallKind::Video).await.unwrap();
    let sb = agent_b.next_incoming().await.unwrap();
    // Remembered until the tracks exist.
    sb.toggle_audio(true).await.unwrap();
    assert!(sb.snapshot().audio_muted);
    sb.accept_call().await.unwrap();
    wait_state(&sa, is(CallState::Connected)).await;
    wait_state(&sb, is(CallState::Connected)).await;

    let b_stream = b.media.last_stream().unwrap();
    assert!(b_stream.tracks_of(TrackKind::Audio).all(|t| !t.is_enabled()));
    assert!(b_stream.tracks_of(TrackKind::Video).all(|t| t.is_enabled()));

    sa.toggle_video(true).await.unwrap();
    sa.toggle_video(false).await.unwrap();
    sa.toggle_audio(true).await.unwrap();
    let a_stream = a.media.last_stream().unwrap();
    assert!(a_stream.tracks_of(TrackKind::Audio).all(|t| !t.is_enabled()));
    assert!(a_stream.tracks_of(TrackKind::Video).all(|t| t.is_enabled()));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(hub.count(5, "offer"), 1);
    assert_eq!(PeerStats::get(&a.peers.stats.offers), 1);
    assert_eq!(PeerStats::get(&b.peers.stats.answers), 1);
    assert_eq!(sa.state(), CallState::Connected);
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_hangs_up() {
    let hub = LoopbackHub::new();
    let a = Party::new(&hub, 5);
    let b = Party::new(&hub, 9);
    let (sa, sb) = connected_pair(&hub, &a, &b).await;

    let mut rx = sa.watch();
    drop(sa);
    let snap = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if rx.borrow_and_update().state.is_terminal() {
                break rx.borrow().clone();
            }
            if rx.changed().await.is_err() {
                break rx.borrow().clone();
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(snap.end_reason, Some(EndReason::LocalHangup));
    assert_released(&snap);

    let snap = wait_state(&sb, terminal).await;
    assert_eq!(snap.end_reason, Some(EndReason::RemoteHangup));
}

#[tokio::test(start_paused = true)]
async fn stalled_negotiation_times_out() {
    let hub = LoopbackHub::new();
    let a = Party::with(&hub, 5, PeerBehavior::Stall, FakeMedia::new());
    let b = Party::with(&hub, 9, PeerBehavior::Stall, FakeMedia::new());
    let mut deps_a = a.deps();
    deps_a.config.negotiation_timeout_secs = Some(60);
    let agent_b = CallAgent::new(b.deps());

    let sa = CallSession::idle(deps_a);
    sa.start_call(9, CallKind::Audio).await.unwrap();
    let mut sb = agent_b.next_incoming().await.unwrap();
    let mut events = sb.take_events().unwrap();
    let started = Instant::now();
    sb.accept_call().await.unwrap();

    let snap = wait_state(&sb, terminal).await;
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(snap.state, CallState::Failed);
    assert_eq!(snap.end_reason, Some(EndReason::NegotiationTimeout));
    let mut saw_timeout = false;
    while let Some(ev) = events.recv().await {
        if matches!(ev, CallEvent::Error(CallError::NegotiationTimeout)) {
            saw_timeout = true;
        }
    }
    assert!(saw_timeout);

    let snap = wait_state(&sa, terminal).await;
    assert_eq!(snap.end_reason, Some(EndReason::RemoteHangup));
}

#[tokio::test(start_paused = true)]
async fn failed_connection_fails_the_call() {
    let hub = LoopbackHub::new();
    let a = Party::with(&hub, 5, PeerBehavior::Fail, FakeMedia::new());
    let b = Party::new(&hub, 9);
    let agent_b = CallAgent::new(b.deps());

    let sa = CallSession::idle(a.deps());
    sa.start_call(9, CallKind::Audio).await.unwrap();
    let sb = agent_b.next_incoming().await.unwrap();
    sb.accept_call().await.unwrap();

    let snap = wait_state(&sa, terminal).await;
    assert_eq!(snap.state, CallState::Failed);
    assert_eq!(snap.end_reason, Some(EndReason::ConnectionFailed));
    assert!(wait_state(&sb, terminal).await.state.is_terminal());
}

#[tokio::test(start_paused = true)]
async fn messages_from_a_third_uid_are_ignored() {
    let hub = LoopbackHub::new();
    let a = Party::new(&hub, 5);
    let _b = Party::new(&hub, 9);
    let intruder = hub.connect(7);

    let sa = CallSession::idle(a.deps());
    sa.start_call(9, CallKind::Audio).await.unwrap();
    intruder
        .send(5, SignalingMessage::new(7, room_id_for(5, 9), SignalPayload::CallEnd))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(sa.state(), CallState::Ringing);
    sa.end_call().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn start_call_twice_is_rejected() {
    let hub = LoopbackHub::new();
    let a = Party::new(&hub, 5);
    let _b = Party::new(&hub, 9);
    let sa = CallSession::idle(a.deps());
    sa.start_call(9, CallKind::Audio).await.unwrap();
    let err = sa.start_call(9, CallKind::Audio).await.unwrap_err();
    assert!(matches!(
        err,
        CallError::InvalidState {
            op: "start_call",
            state: CallState::Ringing
        }
    ));
    assert!(matches!(sa.accept_call().await, Err(CallError::InvalidState { .. })));
    assert_eq!(hub.count(5, "call-invite"), 1);
}
