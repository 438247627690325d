//! One engine against a hand-driven remote peer
//!
//! The remote side is a bare loopback transport, so every message it sends
//! and every acknowledgement the engine produces is visible to the test.

mod common;

use common::{eventually, invite, recv_action, send, TestPeer, AUDIO_OFFER, VIDEO_OFFER};
use peercall_core::{
    CallDirection, CallEvent, EndReason, IceCandidate, LoopbackNetwork, PeerId, PeerProfile, ReplyTiming,
    SignalingMessage, SignalingState, SimulatedMediaOptions, StateCode,
};
use pretty_assertions::assert_eq;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test(start_paused = true)]
async fn make_call_is_refused_when_channel_not_ready() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start(&network, "alice");

    alice.engine.set_channel_ready(false).await;
    assert!(!alice.engine.make_call(PeerId::new("bob"), false).await);
    assert!(alice.engine.sessions().is_empty());
    assert!(alice.delegate.events().is_empty());

    alice.engine.set_channel_ready(true).await;
    assert!(!alice.engine.make_call(PeerId::new("alice"), false).await);
    assert!(alice.engine.sessions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn inbound_invite_creates_incoming_session() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start(&network, "alice");
    let bob = network.join("bob");

    let mut message = invite("bob", "alice", VIDEO_OFFER);
    if let SignalingMessage::Invite { caller_data, .. } = &mut message {
        *caller_data = PeerProfile {
            display_name: Some("Bob".into()),
        };
    }
    send(&bob, "alice", message).await;

    let (from, ack) = recv_action(&bob, "invite_ack").await;
    assert_eq!(from.as_str(), "alice");
    match ack {
        SignalingMessage::InviteAck { state, callee, .. } => {
            assert_eq!(state, StateCode::OK);
            assert_eq!(callee.as_str(), "alice");
        }
        other => panic!("unexpected message: {other:?}"),
    }

    assert!(eventually(WAIT, || alice.delegate.count("call") == 1).await);
    match &alice.delegate.events()[0] {
        CallEvent::Call { session, video } => {
            assert!(*video);
            assert_eq!(session.direction(), CallDirection::Incoming);
            assert_eq!(session.state, SignalingState::Invite);
            assert_eq!(session.remote().display_name.as_deref(), Some("Bob"));
            assert_eq!(session.remote().session_description(), Some(VIDEO_OFFER));
            assert!(session.invite_timestamp().is_some());
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(alice.media.transports().is_empty());
}

#[tokio::test(start_paused = true)]
async fn invite_ack_not_found_fails_without_ringing() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start(&network, "alice");
    let bob = network.join("bob");

    assert!(alice.engine.make_call(PeerId::new("bob"), false).await);
    recv_action(&bob, "invite").await;
    send(
        &bob,
        "alice",
        SignalingMessage::InviteAck {
            state: StateCode::NOT_FOUND,
            callee: PeerId::new("bob"),
            callee_data: PeerProfile::default(),
        },
    )
    .await;

    assert!(eventually(WAIT, || !alice.failed_codes().is_empty()).await);
    assert_eq!(alice.failed_codes(), vec![StateCode::NOT_FOUND]);
    assert_eq!(alice.delegate.count("ringing"), 0);
    assert_eq!(alice.delegate.count("ended"), 0);
    assert!(alice.engine.session(&PeerId::new("bob")).is_none());
}

#[tokio::test(start_paused = true)]
async fn busy_invite_ack_marks_session_busy() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start(&network, "alice");
    let bob = network.join("bob");

    assert!(alice.engine.make_call(PeerId::new("bob"), false).await);
    recv_action(&bob, "invite").await;
    send(
        &bob,
        "alice",
        SignalingMessage::InviteAck {
            state: StateCode::BUSY,
            callee: PeerId::new("bob"),
            callee_data: PeerProfile::default(),
        },
    )
    .await;

    assert!(eventually(WAIT, || alice.delegate.count("failed") == 1).await);
    match alice.delegate.events().last() {
        Some(CallEvent::Failed { session, code }) => {
            assert_eq!(*code, StateCode::BUSY);
            assert!(session.busy);
            assert_eq!(session.state, SignalingState::End);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn crossing_invites_answer_busy() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start(&network, "alice");
    let bob = network.join("bob");

    assert!(alice.engine.make_call(PeerId::new("bob"), false).await);
    recv_action(&bob, "invite").await;
    send(&bob, "alice", invite("bob", "alice", AUDIO_OFFER)).await;

    let (_, ack) = recv_action(&bob, "invite_ack").await;
    assert!(matches!(ack, SignalingMessage::InviteAck { state, .. } if state == StateCode::BUSY));
    let session = alice.engine.session(&PeerId::new("bob")).unwrap();
    assert_eq!(session.direction(), CallDirection::Outgoing);
    assert_eq!(session.state, SignalingState::Invite);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_cancel_ends_exactly_once() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start(&network, "alice");
    let bob = network.join("bob");

    assert!(alice.engine.make_call(PeerId::new("bob"), false).await);
    recv_action(&bob, "invite").await;

    let started = tokio::time::Instant::now();
    alice.engine.terminate_call(&PeerId::new("bob")).await;
    let (_, cancel) = recv_action(&bob, "cancel").await;
    assert_eq!(
        cancel,
        SignalingMessage::Cancel {
            peer: PeerId::new("alice"),
            reason: None
        }
    );

    // Terminating twice sends nothing new
    alice.engine.terminate_call(&PeerId::new("bob")).await;

    assert!(eventually(Duration::from_secs(10), || alice.delegate.count("ended") == 1).await);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(alice.ended_reasons(), vec![EndReason::ByeAck]);

    common::settle(Duration::from_secs(10)).await;
    assert_eq!(alice.delegate.count("ended"), 1);
    assert_eq!(alice.delegate.count("failed"), 0);
    assert_eq!(network.delivered("cancel"), 1);
}

#[tokio::test(start_paused = true)]
async fn duplicate_bye_is_acknowledged_every_time() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start(&network, "alice");
    let bob = network.join("bob");

    send(&bob, "alice", invite("bob", "alice", AUDIO_OFFER)).await;
    recv_action(&bob, "invite_ack").await;

    let bye = SignalingMessage::Bye { peer: PeerId::new("bob") };
    send(&bob, "alice", bye.clone()).await;
    send(&bob, "alice", bye).await;

    recv_action(&bob, "bye_ack").await;
    recv_action(&bob, "bye_ack").await;
    assert!(eventually(WAIT, || alice.delegate.count("ended") == 1).await);
    assert_eq!(alice.ended_reasons(), vec![EndReason::Bye]);
    assert_eq!(alice.delegate.names(), vec!["call", "ended"]);
}

#[tokio::test(start_paused = true)]
async fn hangup_for_unknown_peer_is_still_acknowledged() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start(&network, "alice");
    let bob = network.join("bob");

    send(&bob, "alice", SignalingMessage::Cancel { peer: PeerId::new("bob"), reason: None }).await;
    recv_action(&bob, "cancel_ack").await;

    // Stale non-hangup traffic is dropped silently
    send(
        &bob,
        "alice",
        SignalingMessage::Answer {
            caller: PeerId::new("alice"),
            callee: PeerId::new("bob"),
            sdp: AUDIO_OFFER.into(),
        },
    )
    .await;
    send(&bob, "alice", SignalingMessage::Bye { peer: PeerId::new("bob") }).await;
    recv_action(&bob, "bye_ack").await;

    assert!(alice.delegate.events().is_empty());
    assert!(alice.engine.sessions().is_empty());
    assert_eq!(network.delivered("answer_ack"), 0);
}

#[tokio::test(start_paused = true)]
async fn malformed_invite_is_dropped() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start(&network, "alice");
    let bob = network.join("bob");

    send(&bob, "alice", invite("bob", "alice", "")).await;
    common::settle(Duration::from_millis(200)).await;

    assert!(alice.engine.sessions().is_empty());
    assert!(alice.delegate.events().is_empty());
    assert_eq!(network.delivered("invite_ack"), 0);
}

#[tokio::test(start_paused = true)]
async fn early_candidates_are_applied_in_arrival_order_after_answer() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start(&network, "alice");
    let bob = network.join("bob");

    send(&bob, "alice", invite("bob", "alice", AUDIO_OFFER)).await;
    recv_action(&bob, "invite_ack").await;
    for mid in ["first", "second"] {
        send(
            &bob,
            "alice",
            SignalingMessage::Candidate {
                peer: PeerId::new("bob"),
                candidate: IceCandidate::new(mid, 0, format!("candidate:{mid} 1 udp 1 10.0.0.9 9 typ host")),
            },
        )
        .await;
        recv_action(&bob, "candidate_ack").await;
    }
    assert_eq!(alice.engine.session(&PeerId::new("bob")).unwrap().remote().candidates().len(), 2);

    assert!(alice.engine.answer_call(&PeerId::new("bob")).await);
    let (_, answer) = recv_action(&bob, "answer").await;
    assert!(matches!(answer, SignalingMessage::Answer { ref sdp, .. } if !sdp.is_empty()));

    let transport = alice.media.last().unwrap();
    assert!(eventually(WAIT, || transport.remote_candidates() == 2).await);
    let calls = transport.calls();
    let answer_committed = calls.iter().position(|c| c == "set_local_description:Answer").unwrap();
    let applied: Vec<(usize, &String)> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| c.starts_with("add_candidate"))
        .collect();
    assert_eq!(
        applied.iter().map(|(_, c)| c.as_str()).collect::<Vec<_>>(),
        vec!["add_candidate:first", "add_candidate:second"]
    );
    assert!(applied.iter().all(|(i, _)| *i > answer_committed));

    // Second answer attempt is refused
    assert!(!alice.engine.answer_call(&PeerId::new("bob")).await);

    send(
        &bob,
        "alice",
        SignalingMessage::AnswerAck {
            state: StateCode::OK,
            caller: PeerId::new("bob"),
        },
    )
    .await;
    assert!(eventually(WAIT, || alice.delegate.count("connected") == 1).await);
    assert_eq!(
        alice.engine.session(&PeerId::new("bob")).unwrap().state,
        SignalingState::Incall
    );
}

#[tokio::test(start_paused = true)]
async fn reverse_call_answers_itself() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start(&network, "alice");
    let bob = network.join("bob");

    send(
        &bob,
        "alice",
        SignalingMessage::ReverseCall {
            caller: PeerId::new("bob"),
            sdp: AUDIO_OFFER.into(),
            ice_servers: Vec::new(),
        },
    )
    .await;

    let (_, answer) = recv_action(&bob, "answer").await;
    assert!(matches!(answer, SignalingMessage::Answer { ref callee, .. } if callee.as_str() == "alice"));
    assert!(eventually(WAIT, || alice.delegate.count("reverse_call") == 1).await);
    assert_eq!(alice.delegate.count("in_progress"), 1);

    assert!(
        eventually(WAIT, || alice
            .engine
            .session(&PeerId::new("bob"))
            .is_some_and(|s| s.state == SignalingState::Incall))
        .await
    );
    let session = alice.engine.session(&PeerId::new("bob")).unwrap();
    assert_eq!(session.direction(), CallDirection::Incoming);
}

#[tokio::test(start_paused = true)]
async fn rejected_answer_fails_the_caller() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start_with(
        &network,
        "alice",
        |_| {},
        peercall_core::SimulatedMediaOptions {
            reject_remote: true,
            ..Default::default()
        },
    );
    let bob = network.join("bob");

    assert!(alice.engine.make_call(PeerId::new("bob"), false).await);
    recv_action(&bob, "invite").await;
    send(
        &bob,
        "alice",
        SignalingMessage::InviteAck {
            state: StateCode::OK,
            callee: PeerId::new("bob"),
            callee_data: PeerProfile::default(),
        },
    )
    .await;
    assert!(eventually(WAIT, || alice.delegate.count("ringing") == 1).await);

    send(
        &bob,
        "alice",
        SignalingMessage::Answer {
            caller: PeerId::new("alice"),
            callee: PeerId::new("bob"),
            sdp: AUDIO_OFFER.into(),
        },
    )
    .await;
    let (_, ack) = recv_action(&bob, "answer_ack").await;
    assert!(matches!(ack, SignalingMessage::AnswerAck { state, .. } if state == StateCode::WORKER_STATE_EXCEPTION));
    assert!(eventually(WAIT, || alice.failed_codes() == vec![StateCode::WORKER_STATE_EXCEPTION]).await);
    assert_eq!(alice.delegate.count("connected"), 0);
}

#[tokio::test(start_paused = true)]
async fn bandwidth_hints_follow_runtime_setting() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start(&network, "alice");
    let bob = network.join("bob");

    alice.engine.set_bandwidth(32, 256);
    assert!(alice.engine.make_call(PeerId::new("bob"), true).await);
    let (_, message) = recv_action(&bob, "invite").await;
    match message {
        SignalingMessage::Invite { sdp, .. } => {
            assert!(sdp.contains("a=mid:audio\r\nb=AS:32\r\n"));
            assert!(sdp.contains("a=mid:video\r\nb=AS:256\r\n"));
            assert!(!sdp.contains("b=AS:70"));
        }
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn extreme_reply_timestamps_do_not_stop_the_engine() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start(&network, "alice");
    let bob = network.join("bob");

    let (tx, rx) = tokio::sync::oneshot::channel();
    assert!(
        alice
            .engine
            .reply(
                PeerId::new("bob"),
                Duration::from_secs(1),
                Box::new(move |ok, _, timing| {
                    let _ = tx.send((ok, timing));
                }),
            )
            .await
    );
    recv_action(&bob, "reply").await;
    send(
        &bob,
        "alice",
        SignalingMessage::ReplyAck {
            from: PeerId::new("bob"),
            to: PeerId::new("alice"),
            timing: ReplyTiming {
                originate: 0,
                receive: Some(0),
                transmit: Some(i64::MAX),
                reference: Some(-1),
                ..Default::default()
            },
        },
    )
    .await;

    let (ok, timing) = rx.await.unwrap();
    assert!(ok);
    assert_eq!(timing.unwrap().remote_latency, None);

    send(&bob, "alice", invite("bob", "alice", AUDIO_OFFER)).await;
    let (_, ack) = recv_action(&bob, "invite_ack").await;
    assert!(matches!(ack, SignalingMessage::InviteAck { state, .. } if state == StateCode::OK));
    assert!(eventually(WAIT, || alice.delegate.count("call") == 1).await);
}

#[tokio::test(start_paused = true)]
async fn cancel_naming_another_peer_is_ignored() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start(&network, "alice");
    let bob = network.join("bob");

    send(&bob, "alice", invite("bob", "alice", AUDIO_OFFER)).await;
    recv_action(&bob, "invite_ack").await;

    send(
        &bob,
        "alice",
        SignalingMessage::Cancel {
            peer: PeerId::new("carol"),
            reason: None,
        },
    )
    .await;
    recv_action(&bob, "cancel_ack").await;
    common::settle(Duration::from_millis(200)).await;

    assert_eq!(alice.delegate.names(), vec!["call"]);
    assert_eq!(
        alice.engine.session(&PeerId::new("bob")).unwrap().state,
        SignalingState::Invite
    );
}

#[tokio::test(start_paused = true)]
async fn duplicate_invite_keeps_the_existing_session() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start(&network, "alice");
    let bob = network.join("bob");

    send(&bob, "alice", invite("bob", "alice", AUDIO_OFFER)).await;
    recv_action(&bob, "invite_ack").await;
    assert!(eventually(WAIT, || alice.delegate.count("call") == 1).await);
    let first = alice.engine.session(&PeerId::new("bob")).unwrap().call_id;

    send(&bob, "alice", invite("bob", "alice", AUDIO_OFFER)).await;
    common::settle(Duration::from_millis(200)).await;

    assert_eq!(alice.delegate.count("call"), 1);
    assert_eq!(network.delivered("invite_ack"), 1);
    let session = alice.engine.session(&PeerId::new("bob")).unwrap();
    assert_eq!(session.call_id, first);
    assert_eq!(session.state, SignalingState::Invite);
    assert_eq!(alice.engine.sessions().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_during_media_acquisition_discards_the_answer() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start_with(
        &network,
        "alice",
        |_| {},
        SimulatedMediaOptions {
            acquire_delay: Some(Duration::from_secs(3)),
            ..Default::default()
        },
    );
    let bob = network.join("bob");

    send(&bob, "alice", invite("bob", "alice", AUDIO_OFFER)).await;
    recv_action(&bob, "invite_ack").await;
    assert!(alice.engine.answer_call(&PeerId::new("bob")).await);
    assert!(eventually(WAIT, || alice.delegate.count("in_progress") == 1).await);

    send(
        &bob,
        "alice",
        SignalingMessage::Cancel {
            peer: PeerId::new("bob"),
            reason: None,
        },
    )
    .await;
    recv_action(&bob, "cancel_ack").await;
    common::settle(Duration::from_secs(5)).await;

    assert_eq!(alice.delegate.names(), vec!["call", "in_progress", "ended"]);
    assert_eq!(alice.ended_reasons(), vec![EndReason::Cancel]);
    assert_eq!(network.delivered("answer"), 0);
    assert!(alice.engine.session(&PeerId::new("bob")).is_none());
}

#[tokio::test(start_paused = true)]
async fn answer_reports_failure_when_media_cannot_start() {
    let network = LoopbackNetwork::new();
    let alice = TestPeer::start_with(
        &network,
        "alice",
        |_| {},
        SimulatedMediaOptions {
            fail_create: true,
            ..Default::default()
        },
    );
    let bob = network.join("bob");

    send(&bob, "alice", invite("bob", "alice", AUDIO_OFFER)).await;
    recv_action(&bob, "invite_ack").await;

    assert!(!alice.engine.answer_call(&PeerId::new("bob")).await);
    assert!(eventually(WAIT, || alice.failed_codes() == vec![StateCode::RTC_INITIALIZE_FAILED]).await);
    assert_eq!(alice.delegate.count("in_progress"), 0);
    assert_eq!(network.delivered("answer"), 0);
}
