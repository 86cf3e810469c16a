mod support;

use std::time::Duration;

use call_negotiation::mock::{MediaCall, MediaOp};
use call_negotiation::{
    CallConfig, CallError, CallEvent, CallId, ConnectivityState, Disposition, MediaError,
    MAX_ALIASES, MediaEvent, NegotiationState, PeerId, Role, SdpKind, SignalMessage, StaleReason, TrackKind,
};
use support::{candidate, exchange, immediate, pair, pair_with};

fn connected_count(events: &[CallEvent]) -> usize {
    events
        .iter()
        .filter(|event| {
            matches!(
                event,
                CallEvent::StateChanged {
                    state: NegotiationState::Connected,
                    ..
                }
            )
        })
        .count()
}

fn terminal_count(events: &[CallEvent]) -> usize {
    events.iter().filter(|event| event.is_terminal()).count()
}

#[tokio::test]
async fn offer_answer_connects_both_sides() {
    let (mut alice, mut bob) = pair(immediate());

    let call_id = alice.controller.start_call(bob.id.clone()).await.unwrap();
    assert_eq!(alice.controller.state(), NegotiationState::AwaitingAnswer);
    assert_eq!(alice.controller.role(), Role::Initiator);

    let results = bob.deliver_all().await;
    assert_eq!(results, vec![Ok(Disposition::Applied)]);
    assert_eq!(bob.controller.state(), NegotiationState::Connected);
    assert_eq!(bob.controller.role(), Role::Responder);
    assert_eq!(bob.call_id(), call_id);

    exchange(&mut alice, &mut bob).await;
    assert_eq!(alice.controller.state(), NegotiationState::Connected);

    assert_eq!(
        alice.engine.journal(&call_id),
        vec![
            MediaCall::AddTrack("mic-1".into()),
            MediaCall::CreateOffer,
            MediaCall::SetLocal(SdpKind::Offer),
            MediaCall::SetRemote(SdpKind::Answer),
        ]
    );
    assert_eq!(
        bob.engine.journal(&call_id),
        vec![
            MediaCall::AddTrack("mic-1".into()),
            MediaCall::SetRemote(SdpKind::Offer),
            MediaCall::CreateAnswer,
            MediaCall::SetLocal(SdpKind::Answer),
        ]
    );

    let alice_events = alice.drain_events();
    let bob_events = bob.drain_events();
    assert_eq!(connected_count(&alice_events), 1);
    assert_eq!(connected_count(&bob_events), 1);
    assert!(alice_events.contains(&CallEvent::RoleDecided {
        call_id: call_id.clone(),
        role: Role::Initiator,
    }));
    assert!(bob_events.contains(&CallEvent::RoleDecided {
        call_id,
        role: Role::Responder,
    }));
}

#[tokio::test]
async fn responder_walks_through_every_answering_state() {
    let (mut alice, mut bob) = pair(immediate());
    let call_id = alice.controller.start_call(bob.id.clone()).await.unwrap();
    bob.deliver_all().await;

    let states: Vec<_> = bob
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            CallEvent::StateChanged { state, .. } => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            NegotiationState::ReceivedOffer,
            NegotiationState::Answering,
            NegotiationState::Connected,
        ]
    );
    assert!(bob.sent().contains(&SignalMessage::Answer {
        call_id: call_id.clone(),
        sdp: format!("answer:{call_id}"),
    }));
}

#[tokio::test]
async fn early_candidates_are_applied_in_order_after_the_offer() {
    let (mut alice, mut bob) = pair(immediate());
    alice.channel.hold();
    let call_id = alice.controller.start_call(bob.id.clone()).await.unwrap();
    let offer = alice.channel.take_held();
    assert_eq!(offer.len(), 1);

    for data in ["c1", "c2", "c3"] {
        let result = bob.receive(candidate(&call_id, data)).await;
        assert_eq!(result, Ok(Disposition::Buffered));
    }
    assert_eq!(bob.controller.buffered_candidates(&call_id), 3);
    assert!(bob.engine.sessions().is_empty());

    let result = bob.receive(offer[0].clone()).await;
    assert_eq!(result, Ok(Disposition::Applied));
    assert_eq!(bob.controller.state(), NegotiationState::Connected);
    assert_eq!(bob.engine.applied_candidates(&call_id), ["c1", "c2", "c3"]);
    assert_eq!(bob.controller.buffered_candidates(&call_id), 0);

    let journal = bob.engine.journal(&call_id);
    let remote_at = journal
        .iter()
        .position(|call| call == &MediaCall::SetRemote(SdpKind::Offer))
        .unwrap();
    let first_candidate_at = journal
        .iter()
        .position(|call| matches!(call, MediaCall::AddCandidate(_)))
        .unwrap();
    assert!(remote_at < first_candidate_at);
}

#[tokio::test]
async fn initiator_buffers_candidates_that_overtake_the_answer() {
    let (mut alice, mut bob) = pair(immediate());
    let call_id = alice.controller.start_call(bob.id.clone()).await.unwrap();

    bob.channel.hold();
    bob.deliver_all().await;
    bob.engine
        .sink(&call_id)
        .unwrap()
        .emit(MediaEvent::LocalCandidate("b1".into()));
    bob.pump_media().await;

    let held = bob.channel.take_held();
    assert_eq!(held.len(), 2);
    assert!(matches!(held[0], SignalMessage::Answer { .. }));
    assert_eq!(held[1], candidate(&call_id, "b1"));

    assert_eq!(alice.receive(held[1].clone()).await, Ok(Disposition::Buffered));
    assert!(alice.engine.applied_candidates(&call_id).is_empty());
    assert_eq!(alice.receive(held[0].clone()).await, Ok(Disposition::Applied));
    assert_eq!(alice.controller.state(), NegotiationState::Connected);
    assert_eq!(alice.engine.applied_candidates(&call_id), ["b1"]);

    assert_eq!(
        alice.receive(candidate(&call_id, "b2")).await,
        Ok(Disposition::Applied)
    );
    assert_eq!(alice.engine.applied_candidates(&call_id), ["b1", "b2"]);
}

#[tokio::test]
async fn messages_after_hangup_are_stale() {
    let (mut alice, mut bob) = pair(immediate());
    let call_id = alice.controller.start_call(bob.id.clone()).await.unwrap();
    exchange(&mut alice, &mut bob).await;

    bob.controller.end_call().await.unwrap();
    assert_eq!(bob.controller.state(), NegotiationState::Idle);
    assert!(bob.controller.is_tombstoned(&call_id));
    assert!(bob.engine.is_closed(&call_id));
    assert_eq!(bob.media.outstanding(), 0);

    assert_eq!(alice.deliver_all().await, vec![Ok(Disposition::Applied)]);
    assert_eq!(alice.controller.state(), NegotiationState::Idle);
    assert!(alice.engine.is_closed(&call_id));

    let late = [
        candidate(&call_id, "late"),
        SignalMessage::Answer {
            call_id: call_id.clone(),
            sdp: "answer".into(),
        },
        SignalMessage::Offer {
            call_id: call_id.clone(),
            sdp: "offer".into(),
        },
        SignalMessage::Hangup {
            call_id: call_id.clone(),
        },
    ];
    for message in late {
        assert_eq!(
            alice.receive(message).await,
            Ok(Disposition::Stale(StaleReason::Terminated))
        );
    }
    assert_eq!(alice.engine.sessions().len(), 1);
    assert_eq!(alice.media.acquired(), 1);
    assert_eq!(alice.media.released(), 1);

    let events = alice.drain_events();
    assert_eq!(terminal_count(&events), 1);
    assert!(events.contains(&CallEvent::Closed { call_id }));
}

#[tokio::test]
async fn end_call_sends_hangup_but_inbound_hangup_does_not_reply() {
    let (mut alice, mut bob) = pair(immediate());
    let call_id = alice.controller.start_call(bob.id.clone()).await.unwrap();
    exchange(&mut alice, &mut bob).await;

    alice.controller.end_call().await.unwrap();
    assert_eq!(
        alice.sent().last(),
        Some(&SignalMessage::Hangup {
            call_id: call_id.clone()
        })
    );

    let sent_before = bob.sent().len();
    bob.deliver_all().await;
    assert_eq!(bob.controller.state(), NegotiationState::Idle);
    assert_eq!(bob.sent().len(), sent_before);
}

#[tokio::test]
async fn end_call_without_attempt_is_a_no_op() {
    let (mut alice, _bob) = pair(immediate());
    alice.controller.end_call().await.unwrap();
    assert_eq!(alice.controller.state(), NegotiationState::Idle);
    assert!(alice.sent().is_empty());
    assert!(alice.drain_events().is_empty());
}

#[tokio::test]
async fn second_start_is_already_active() {
    let (mut alice, bob) = pair(immediate());
    let call_id = alice.controller.start_call(bob.id.clone()).await.unwrap();
    let err = alice.controller.start_call(bob.id.clone()).await.unwrap_err();
    assert_eq!(err, CallError::AlreadyActive { call_id });
    assert_eq!(alice.engine.sessions().len(), 1);
    assert_eq!(alice.controller.state(), NegotiationState::AwaitingAnswer);
}

#[tokio::test]
async fn dual_offer_lower_id_keeps_its_offer() {
    let (mut alice, mut bob) = pair(immediate());
    let alice_call = alice.controller.start_call(bob.id.clone()).await.unwrap();
    let bob_call = bob.controller.start_call(alice.id.clone()).await.unwrap();
    assert_ne!(alice_call, bob_call);

    assert_eq!(alice.deliver_all().await, vec![Ok(Disposition::GlareIgnored)]);
    assert_eq!(alice.controller.role(), Role::Initiator);

    assert_eq!(bob.deliver_all().await, vec![Ok(Disposition::Applied)]);
    assert_eq!(bob.controller.role(), Role::Responder);
    assert_eq!(bob.call_id(), alice_call);
    assert!(bob.engine.journal(&bob_call).contains(&MediaCall::Rollback));

    exchange(&mut alice, &mut bob).await;
    assert_eq!(alice.controller.state(), NegotiationState::Connected);
    assert_eq!(bob.controller.state(), NegotiationState::Connected);
    assert_eq!(alice.call_id(), alice_call);
    assert_eq!(alice.media.acquired(), 1);
    assert_eq!(bob.media.acquired(), 1);
}

#[tokio::test]
async fn dual_offer_resolves_the_same_in_either_processing_order() {
    let (mut alice, mut bob) = pair(immediate());
    let alice_call = alice.controller.start_call(bob.id.clone()).await.unwrap();
    let bob_call = bob.controller.start_call(alice.id.clone()).await.unwrap();

    // bob handles alice's offer before alice sees bob's
    assert_eq!(bob.deliver_all().await, vec![Ok(Disposition::Applied)]);
    let results = alice.deliver_all().await;
    assert_eq!(
        results,
        vec![Ok(Disposition::GlareIgnored), Ok(Disposition::Applied)]
    );

    assert_eq!(alice.controller.state(), NegotiationState::Connected);
    assert_eq!(alice.controller.role(), Role::Initiator);
    assert_eq!(bob.controller.role(), Role::Responder);
    assert_eq!(bob.call_id(), alice_call);
    assert_eq!(
        bob.controller.attempt().unwrap().aliases(),
        std::slice::from_ref(&bob_call)
    );
}

#[tokio::test]
async fn candidates_for_a_folded_offer_are_still_applied() {
    let (mut alice, mut bob) = pair(immediate());
    let alice_call = alice.controller.start_call(bob.id.clone()).await.unwrap();
    let bob_call = bob.controller.start_call(alice.id.clone()).await.unwrap();

    // a candidate from bob's abandoned offer reaches alice before bob's offer
    assert_eq!(
        alice.receive(candidate(&bob_call, "old")).await,
        Ok(Disposition::Buffered)
    );
    exchange(&mut alice, &mut bob).await;

    assert_eq!(alice.controller.state(), NegotiationState::Connected);
    assert_eq!(alice.engine.applied_candidates(&alice_call), ["old"]);
    assert_eq!(alice.controller.buffered_candidates(&bob_call), 0);
}

#[tokio::test]
async fn abandoned_offer_arriving_after_the_answer_is_ignored() {
    let (mut alice, mut bob) = pair(immediate());
    let alice_call = alice.controller.start_call(bob.id.clone()).await.unwrap();
    let bob_call = bob.controller.start_call(alice.id.clone()).await.unwrap();

    // bob's offer is overtaken by the answer bob sends after rolling back
    let late = alice.channel.try_recv().unwrap();
    assert!(matches!(late.message, SignalMessage::Offer { .. }));
    assert_eq!(bob.deliver_all().await, vec![Ok(Disposition::Applied)]);
    assert!(bob.engine.journal(&bob_call).contains(&MediaCall::Rollback));
    assert_eq!(alice.deliver_all().await, vec![Ok(Disposition::Applied)]);
    assert_eq!(alice.controller.state(), NegotiationState::Connected);

    let sent_before = alice.sent().len();
    assert_eq!(
        alice
            .controller
            .on_inbound_message(late.from, late.message)
            .await,
        Ok(Disposition::GlareIgnored)
    );
    assert_eq!(alice.sent().len(), sent_before);
    assert!(alice.controller.attempt().unwrap().owns(&bob_call));

    exchange(&mut alice, &mut bob).await;
    assert_eq!(alice.controller.state(), NegotiationState::Connected);
    assert_eq!(bob.controller.state(), NegotiationState::Connected);
    assert_eq!(alice.call_id(), alice_call);
    assert_eq!(bob.call_id(), alice_call);
}

#[tokio::test]
async fn repeated_competing_offers_do_not_grow_aliases() {
    let (mut alice, mut bob) = pair(immediate());
    alice.controller.start_call(bob.id.clone()).await.unwrap();
    exchange(&mut alice, &mut bob).await;

    let replay = SignalMessage::Offer {
        call_id: CallId::from("replayed"),
        sdp: "offer".into(),
    };
    assert_eq!(alice.receive(replay.clone()).await, Ok(Disposition::GlareIgnored));
    assert_eq!(
        alice.receive(replay).await,
        Ok(Disposition::Stale(StaleReason::Duplicate))
    );

    for n in 0..(MAX_ALIASES * 2) {
        let offer = SignalMessage::Offer {
            call_id: CallId::from(format!("fresh-{n}")),
            sdp: "offer".into(),
        };
        assert_eq!(alice.receive(offer).await, Ok(Disposition::GlareIgnored));
    }
    let aliases = alice.controller.attempt().unwrap().aliases();
    assert_eq!(aliases.len(), MAX_ALIASES);
    assert_eq!(aliases.last(), Some(&CallId::from(format!("fresh-{}", MAX_ALIASES * 2 - 1))));
    assert_eq!(alice.controller.state(), NegotiationState::Connected);
    assert!(bob.channel.try_recv().is_none());
}

#[tokio::test]
async fn identical_peer_ids_fail_both_sides() {
    let (mut one, mut two) = pair_with("carol", "carol", immediate(), immediate());
    let first = one.controller.start_call(two.id.clone()).await.unwrap();
    two.controller.start_call(one.id.clone()).await.unwrap();

    let result = one.deliver_next().await.unwrap();
    assert_eq!(
        result,
        Err(CallError::IdentityCollision(PeerId::from("carol")))
    );
    assert_eq!(one.controller.state(), NegotiationState::Idle);
    assert!(one.engine.is_closed(&first));
    assert_eq!(one.media.outstanding(), 0);

    let result = two.deliver_next().await.unwrap();
    assert!(matches!(result, Err(CallError::IdentityCollision(_))));
    assert!(one.drain_events().iter().any(|event| matches!(
        event,
        CallEvent::Failed {
            error: CallError::IdentityCollision(_),
            ..
        }
    )));
}

#[tokio::test]
async fn offer_inside_glare_window_is_answered_instead() {
    let windowed = CallConfig::default().with_glare_delay(Duration::from_millis(500));
    let (mut alice, mut bob) = pair_with("alice", "bob", windowed, immediate());

    let alice_call = alice.controller.start_call(bob.id.clone()).await.unwrap();
    assert_eq!(alice.controller.state(), NegotiationState::Offering);
    assert!(alice.controller.glare_deadline().is_some());
    assert_eq!(alice.offers_sent(), 0);

    let bob_call = bob.controller.start_call(alice.id.clone()).await.unwrap();
    assert_eq!(alice.deliver_all().await, vec![Ok(Disposition::Applied)]);
    assert_eq!(alice.controller.role(), Role::Responder);
    assert_eq!(alice.controller.state(), NegotiationState::Connected);
    assert_eq!(alice.call_id(), bob_call);
    assert!(alice.controller.glare_deadline().is_none());

    alice.controller.on_glare_timeout().await.unwrap();
    assert_eq!(alice.offers_sent(), 0);
    assert!(alice.engine.journal(&alice_call).contains(&MediaCall::AddTrack("mic-1".into())));
    assert_eq!(alice.media.acquired(), 1);

    exchange(&mut alice, &mut bob).await;
    assert_eq!(bob.controller.state(), NegotiationState::Connected);
    assert_eq!(bob.controller.role(), Role::Initiator);
}

#[tokio::test]
async fn glare_timer_commits_the_offer() {
    let windowed = CallConfig::default().with_glare_delay(Duration::from_millis(500));
    let (mut alice, mut bob) = pair_with("alice", "bob", windowed, immediate());

    let call_id = alice.controller.start_call(bob.id.clone()).await.unwrap();
    alice.controller.on_glare_timeout().await.unwrap();
    assert_eq!(alice.controller.state(), NegotiationState::AwaitingAnswer);
    assert_eq!(alice.offers_sent(), 1);
    assert!(alice.controller.glare_deadline().is_none());

    exchange(&mut alice, &mut bob).await;
    assert_eq!(alice.controller.state(), NegotiationState::Connected);
    assert_eq!(bob.call_id(), call_id);
}

#[tokio::test]
async fn offer_from_another_call_is_rejected_as_busy() {
    let (mut alice, mut bob) = pair(immediate());
    let call_id = alice.controller.start_call(bob.id.clone()).await.unwrap();
    exchange(&mut alice, &mut bob).await;

    let intruder = SignalMessage::Offer {
        call_id: CallId::from("other"),
        sdp: "offer".into(),
    };
    assert_eq!(
        alice
            .controller
            .on_inbound_message(PeerId::from("carol"), intruder.clone())
            .await,
        Ok(Disposition::Rejected)
    );
    assert_eq!(
        alice.sent().last(),
        Some(&SignalMessage::Hangup {
            call_id: CallId::from("other")
        })
    );
    assert_eq!(alice.controller.state(), NegotiationState::Connected);
    assert_eq!(alice.call_id(), call_id);
    assert_eq!(alice.engine.sessions().len(), 1);
}

#[tokio::test]
async fn duplicate_answer_is_ignored() {
    let (mut alice, mut bob) = pair(immediate());
    let call_id = alice.controller.start_call(bob.id.clone()).await.unwrap();
    bob.deliver_all().await;
    let answer = bob
        .sent()
        .into_iter()
        .find(|message| matches!(message, SignalMessage::Answer { .. }))
        .unwrap();

    alice.deliver_all().await;
    assert_eq!(
        alice.receive(answer).await,
        Ok(Disposition::Stale(StaleReason::Duplicate))
    );
    let remote_sets = alice
        .engine
        .journal(&call_id)
        .into_iter()
        .filter(|call| matches!(call, MediaCall::SetRemote(_)))
        .count();
    assert_eq!(remote_sets, 1);
}

#[tokio::test]
async fn answer_for_unknown_call_is_stale() {
    let (mut alice, bob) = pair(immediate());
    alice.controller.start_call(bob.id.clone()).await.unwrap();
    let stray = SignalMessage::Answer {
        call_id: CallId::from("nope"),
        sdp: "answer".into(),
    };
    assert_eq!(
        alice.receive(stray).await,
        Ok(Disposition::Stale(StaleReason::UnknownCall))
    );
    assert_eq!(alice.controller.state(), NegotiationState::AwaitingAnswer);
}

#[tokio::test]
async fn rejected_description_fails_and_releases_everything() {
    let (mut alice, mut bob) = pair(immediate());
    let call_id = alice.controller.start_call(bob.id.clone()).await.unwrap();
    bob.engine.fail_next(
        MediaOp::SetRemote,
        MediaError::DescriptionRejected("garbled".into()),
    );

    let result = bob.deliver_next().await.unwrap();
    assert_eq!(
        result,
        Err(CallError::Media(MediaError::DescriptionRejected(
            "garbled".into()
        )))
    );
    assert_eq!(bob.controller.state(), NegotiationState::Idle);
    assert!(bob.engine.is_closed(&call_id));
    assert_eq!(bob.media.outstanding(), 0);
    assert!(bob.drain_events().iter().any(|event| matches!(
        event,
        CallEvent::Failed { call_id: failed, .. } if failed == &call_id
    )));

    assert_eq!(alice.deliver_all().await, vec![Ok(Disposition::Applied)]);
    assert_eq!(alice.controller.state(), NegotiationState::Idle);
    assert!(alice.engine.is_closed(&call_id));
}

#[tokio::test]
async fn exhausted_media_never_starts_an_attempt() {
    let (mut alice, bob) = pair(immediate());
    alice.engine.fail_next(
        MediaOp::Create,
        MediaError::ResourceExhausted("no ports".into()),
    );

    let err = alice.controller.start_call(bob.id.clone()).await.unwrap_err();
    assert_eq!(
        err,
        CallError::Media(MediaError::ResourceExhausted("no ports".into()))
    );
    assert_eq!(alice.controller.state(), NegotiationState::Idle);
    assert_eq!(alice.media.acquired(), 0);
    assert!(alice.sent().is_empty());

    alice.controller.start_call(bob.id.clone()).await.unwrap();
    assert_eq!(alice.controller.state(), NegotiationState::AwaitingAnswer);
}

#[tokio::test]
async fn exhausted_media_rejects_incoming_offer() {
    let (mut alice, mut bob) = pair(immediate());
    let call_id = alice.controller.start_call(bob.id.clone()).await.unwrap();
    bob.engine.fail_next(
        MediaOp::Create,
        MediaError::ResourceExhausted("no ports".into()),
    );

    let result = bob.deliver_next().await.unwrap();
    assert!(matches!(
        result,
        Err(CallError::Media(MediaError::ResourceExhausted(_)))
    ));
    assert_eq!(bob.sent(), vec![SignalMessage::Hangup { call_id }]);

    alice.deliver_all().await;
    assert_eq!(alice.controller.state(), NegotiationState::Idle);
}

#[tokio::test]
async fn microphone_failure_fails_the_attempt() {
    let (mut alice, bob) = pair(immediate());
    alice
        .media
        .fail_next(MediaError::InvalidState("device busy".into()));

    let err = alice.controller.start_call(bob.id.clone()).await.unwrap_err();
    assert!(matches!(err, CallError::Media(MediaError::InvalidState(_))));
    assert_eq!(alice.controller.state(), NegotiationState::Idle);
    let sessions = alice.engine.sessions();
    assert_eq!(sessions.len(), 1);
    assert!(alice.engine.is_closed(&sessions[0]));
}

#[tokio::test]
async fn rejected_candidate_fails_the_attempt() {
    let (mut alice, mut bob) = pair(immediate());
    let call_id = alice.controller.start_call(bob.id.clone()).await.unwrap();
    exchange(&mut alice, &mut bob).await;

    alice.engine.fail_next(
        MediaOp::AddCandidate,
        MediaError::CandidateRejected("bad".into()),
    );
    let result = alice.receive(candidate(&call_id, "bad")).await;
    assert!(matches!(
        result,
        Err(CallError::Media(MediaError::CandidateRejected(_)))
    ));
    assert_eq!(alice.controller.state(), NegotiationState::Idle);
    assert_eq!(alice.media.outstanding(), 0);
}

#[tokio::test]
async fn candidate_after_session_close_is_ignored() {
    let (mut alice, mut bob) = pair(immediate());
    let call_id = alice.controller.start_call(bob.id.clone()).await.unwrap();
    exchange(&mut alice, &mut bob).await;

    alice.engine.fail_next(
        MediaOp::AddCandidate,
        MediaError::InvalidState("closed".into()),
    );
    assert_eq!(
        alice.receive(candidate(&call_id, "late")).await,
        Ok(Disposition::Stale(StaleReason::SessionClosed))
    );
    assert_eq!(alice.controller.state(), NegotiationState::Connected);
}

#[tokio::test]
async fn local_candidates_are_forwarded_with_the_current_call_id() {
    let (mut alice, mut bob) = pair(immediate());
    alice.controller.start_call(bob.id.clone()).await.unwrap();
    let bob_call = bob.controller.start_call(alice.id.clone()).await.unwrap();
    exchange(&mut alice, &mut bob).await;
    let adopted = bob.call_id();
    assert_ne!(adopted, bob_call);

    // bob's session was created under its abandoned call id
    bob.engine
        .sink(&bob_call)
        .unwrap()
        .emit(MediaEvent::LocalCandidate("b-host".into()));
    bob.pump_media().await;
    assert_eq!(bob.sent().last(), Some(&candidate(&adopted, "b-host")));

    assert_eq!(alice.deliver_all().await, vec![Ok(Disposition::Applied)]);
    assert_eq!(alice.engine.applied_candidates(&adopted), ["b-host"]);
}

#[tokio::test]
async fn connectivity_loss_closes_the_call() {
    let (mut alice, mut bob) = pair(immediate());
    let call_id = alice.controller.start_call(bob.id.clone()).await.unwrap();
    exchange(&mut alice, &mut bob).await;
    alice.drain_events();

    let sink = alice.engine.sink(&call_id).unwrap();
    sink.emit(MediaEvent::Connectivity(ConnectivityState::Connected));
    sink.emit(MediaEvent::Connectivity(ConnectivityState::Failed));
    alice.pump_media().await;

    assert_eq!(alice.controller.state(), NegotiationState::Idle);
    assert_eq!(
        alice.drain_events(),
        vec![
            CallEvent::Connectivity {
                call_id: call_id.clone(),
                state: ConnectivityState::Connected,
            },
            CallEvent::Connectivity {
                call_id: call_id.clone(),
                state: ConnectivityState::Failed,
            },
            CallEvent::Closed {
                call_id: call_id.clone()
            },
        ]
    );

    sink.emit(MediaEvent::Connectivity(ConnectivityState::Connected));
    let event = alice.controller.try_next_media_event().unwrap();
    assert_eq!(
        alice.controller.on_media_event(event).await,
        Ok(Disposition::Stale(StaleReason::Terminated))
    );
}

#[tokio::test]
async fn remote_track_is_reported_once_per_kind() {
    let (mut alice, mut bob) = pair(immediate());
    let call_id = alice.controller.start_call(bob.id.clone()).await.unwrap();
    exchange(&mut alice, &mut bob).await;
    alice.drain_events();

    let sink = alice.engine.sink(&call_id).unwrap();
    sink.emit(MediaEvent::RemoteTrack(TrackKind::Audio));
    sink.emit(MediaEvent::RemoteTrack(TrackKind::Audio));
    alice.pump_media().await;

    assert_eq!(
        alice.drain_events(),
        vec![CallEvent::RemoteTrack {
            call_id,
            kind: TrackKind::Audio,
        }]
    );
}

#[tokio::test]
async fn candidate_buffer_bound_drops_the_overflow() {
    let small = CallConfig {
        max_buffered_candidates: 2,
        ..immediate()
    };
    let (_alice, mut bob) = pair(small);
    let call_id = CallId::from("early");
    assert_eq!(bob.receive(candidate(&call_id, "1")).await, Ok(Disposition::Buffered));
    assert_eq!(bob.receive(candidate(&call_id, "2")).await, Ok(Disposition::Buffered));
    assert_eq!(
        bob.receive(candidate(&call_id, "3")).await,
        Ok(Disposition::Stale(StaleReason::BufferFull))
    );
    assert_eq!(bob.controller.buffered_candidates(&call_id), 2);
}

#[tokio::test]
async fn unknown_call_candidates_are_bounded_while_idle() {
    let (_alice, mut bob) = pair(immediate());
    let limit = bob.controller.config().max_orphan_calls;
    for n in 0..1000 {
        let call_id = CallId::from(format!("junk-{n}"));
        assert_eq!(
            bob.receive(candidate(&call_id, "c")).await,
            Ok(Disposition::Buffered)
        );
    }
    assert_eq!(bob.controller.orphan_calls(), limit);
    assert_eq!(bob.controller.buffered_candidates(&CallId::from("junk-0")), 0);
    assert_eq!(bob.controller.buffered_candidates(&CallId::from("junk-999")), 1);
}
