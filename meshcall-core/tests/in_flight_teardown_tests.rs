//! Hanging up or leaving while local devices are still opening

#![allow(clippy::unwrap_used, clippy::panic)]

mod common;

use common::{assert_torn_down, settle, user};
use meshcall_core::loopback::LoopbackRelay;
use meshcall_core::{CallError, CallState, ChannelId, GroupCallStatus, MediaKind, SignalingMessage};
use pretty_assertions::assert_eq;
use std::time::Duration;

const PROMPT: Duration = Duration::from_secs(2);

#[tokio::test(start_paused = true)]
async fn test_hang_up_while_placing_call() {
    let relay = LoopbackRelay::new();
    let alice = user(&relay, "alice");
    let bob = user(&relay, "bob");
    alice.devices.delay_user_media(PROMPT);

    let calls = alice.agent.calls().clone();
    let callee = bob.id().clone();
    let placing = tokio::spawn(async move { calls.initiate(callee, MediaKind::Video).await });
    settle("the devices to be asked", || {
        alice.agent.calls().state() == CallState::Initiating
    })
    .await;

    alice.agent.calls().end().await.unwrap();
    let res = placing.await.unwrap();
    assert!(matches!(res, Err(CallError::SignalingRace(_))), "{res:?}");

    assert_torn_down(&alice);
    assert_eq!(alice.devices.user_media_requests(), 1);
    assert_eq!(alice.peers.connections_created(), 0);
    let sent = relay.sent_by(alice.id());
    assert_eq!(sent.len(), 1, "{sent:?}");
    assert!(matches!(sent[0], SignalingMessage::CallCancel { .. }));
    assert!(bob.agent.calls().pending_incoming().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_hang_up_while_accepting_call() {
    let relay = LoopbackRelay::new();
    let alice = user(&relay, "alice");
    let bob = user(&relay, "bob");
    bob.devices.delay_user_media(PROMPT);

    let call_id = alice.agent.calls().initiate(bob.id().clone(), MediaKind::Voice).await.unwrap();
    settle("the invitation", || bob.agent.calls().pending_incoming().is_some()).await;

    let calls = bob.agent.calls().clone();
    let accepting = tokio::spawn(async move { calls.accept_incoming().await });
    settle("the devices to be asked", || {
        bob.agent.calls().state() == CallState::RingingIncoming
    })
    .await;

    bob.agent.calls().end().await.unwrap();
    let res = accepting.await.unwrap();
    assert!(matches!(res, Err(CallError::SignalingRace(_))), "{res:?}");

    assert_torn_down(&bob);
    assert_eq!(bob.peers.connections_created(), 0);
    let sent = relay.sent_by(bob.id());
    assert!(sent.contains(&SignalingMessage::CallDecline { call_id }));
    assert!(!sent.contains(&SignalingMessage::CallAccept { call_id }));

    settle("the caller to hear the decline", || {
        alice.agent.calls().state() == CallState::Idle
    })
    .await;
    assert_torn_down(&alice);
}

#[tokio::test(start_paused = true)]
async fn test_leave_while_joining_group() {
    let relay = LoopbackRelay::new();
    let channel = ChannelId::new("general");
    let alice = user(&relay, "alice");
    let bob = user(&relay, "bob");

    alice.agent.groups().start(channel.clone(), MediaKind::Voice).await.unwrap();
    settle("the call to start", || {
        alice.agent.groups().status() == Some(GroupCallStatus::Active)
    })
    .await;
    let call_id = alice.agent.groups().call_id().unwrap();

    bob.devices.delay_user_media(PROMPT);
    let groups = bob.agent.groups().clone();
    let joining_channel = channel.clone();
    let joining = tokio::spawn(async move {
        groups.join(joining_channel, call_id, MediaKind::Voice).await
    });
    settle("the join to begin", || {
        bob.agent.groups().status() == Some(GroupCallStatus::Joining)
    })
    .await;

    bob.agent.groups().leave().await.unwrap();
    joining.await.unwrap().unwrap();

    assert_eq!(bob.agent.groups().status(), None);
    assert_eq!(bob.devices.live_tracks(), 0);
    assert_eq!(bob.peers.connections_created(), 0);
    assert!(!bob.agent.activity().is_busy());
    assert!(!relay
        .sent_by(bob.id())
        .iter()
        .any(|m| matches!(m, SignalingMessage::GroupJoin { .. })));
    assert_eq!(relay.room_members(&channel).len(), 1);
    assert_eq!(alice.agent.groups().participant_count(), 1);
}
