//! Shared scenario helpers

#![allow(dead_code, clippy::unwrap_used, clippy::panic)]

use meshcall_core::loopback::{LoopbackRelay, LoopbackUser};
use meshcall_core::{AgentConfig, CallEvent, CallId, CallState, CallSummary, MediaKind};
use std::time::Duration;
use tokio::sync::broadcast;

/// Poll until `done` holds, failing the test after a few seconds
pub async fn settle(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Next `Ended` summary on a 1:1 event stream
pub async fn ended(events: &mut broadcast::Receiver<CallEvent>) -> CallSummary {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match events.recv().await {
                Ok(CallEvent::Ended { summary }) => return summary,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .unwrap()
}

/// Wait for the first event `pick` accepts
pub async fn wait_for<E: Clone, R>(
    events: &mut broadcast::Receiver<E>,
    mut pick: impl FnMut(E) -> Option<R>,
) -> R {
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .unwrap()
}

pub fn user(relay: &LoopbackRelay, name: &str) -> LoopbackUser {
    LoopbackUser::connect(relay, name, AgentConfig::default()).unwrap()
}

/// Ring `callee` from `caller` and have the callee answer
pub async fn connect(caller: &LoopbackUser, callee: &LoopbackUser, kind: MediaKind) -> CallId {
    let call_id = caller.agent.calls().initiate(callee.id().clone(), kind).await.unwrap();
    settle("the invitation", || callee.agent.calls().pending_incoming().is_some()).await;
    assert_eq!(callee.agent.calls().accept_incoming().await.unwrap(), call_id);
    settle("both sides active", || {
        caller.agent.calls().state() == CallState::Active
            && callee.agent.calls().state() == CallState::Active
    })
    .await;
    call_id
}

/// Nothing left running for a user after their calls ended
pub fn assert_torn_down(user: &LoopbackUser) {
    assert_eq!(user.agent.calls().state(), CallState::Idle, "{} still in a call", user.id());
    assert_eq!(user.devices.live_tracks(), 0, "{} holds live tracks", user.id());
    assert_eq!(user.peers.open_connections(), 0, "{} holds open connections", user.id());
    assert!(!user.agent.activity().is_busy(), "{} still busy", user.id());
}
