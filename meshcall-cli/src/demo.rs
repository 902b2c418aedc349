//! Loopback scenarios

use anyhow::{bail, Result};
use meshcall_core::loopback::{LoopbackRelay, LoopbackUser};
use meshcall_core::{AgentConfig, CallState, ChannelId, GroupCallStatus, MediaKind, TrackKind};
use std::time::Duration;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Poll until `done` holds
async fn settle(what: &str, mut done: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
    while !done() {
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {}", what);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    Ok(())
}

async fn connect_call(
    relay: &LoopbackRelay,
    config: &AgentConfig,
    kind: MediaKind,
) -> Result<(LoopbackUser, LoopbackUser)> {
    let alice = LoopbackUser::connect(relay, "alice", config.clone())?;
    let bob = LoopbackUser::connect(relay, "bob", config.clone())?;

    println!("📞 alice calls bob ({:?})", kind);
    let call_id = alice.agent.calls().initiate(bob.id().clone(), kind).await?;
    println!("   call id: {}", call_id);

    settle("bob to ring", || bob.agent.calls().pending_incoming().is_some()).await?;
    println!("🔔 bob is ringing, alice is {:?}", alice.agent.calls().state());

    bob.agent.calls().accept_incoming().await?;
    settle("both sides to be active", || {
        alice.agent.calls().state() == CallState::Active
            && bob.agent.calls().state() == CallState::Active
    })
    .await?;
    println!("✅ call active on both sides");
    Ok((alice, bob))
}

/// 1:1 call from ring to hang-up
pub async fn direct(config: AgentConfig, video: bool) -> Result<()> {
    let relay = LoopbackRelay::new();
    let kind = if video { MediaKind::Video } else { MediaKind::Voice };
    let (alice, bob) = connect_call(&relay, &config, kind).await?;

    if let Some(link) = bob.agent.calls().peer_link() {
        if let Some(stream) = link.remote_stream() {
            println!("   bob receives {} track(s) from alice", stream.tracks.len());
        }
    }

    let muted = alice.agent.calls().toggle_mute()?;
    println!("🔇 alice muted: {}", muted);

    alice.agent.calls().end().await?;
    settle("bob to hang up", || bob.agent.calls().state() == CallState::Idle).await?;
    println!(
        "📞 call ended, live tracks: alice {} bob {}",
        alice.devices.live_tracks(),
        bob.devices.live_tracks()
    );
    Ok(())
}

/// Mesh call in one channel
pub async fn mesh(config: AgentConfig, participants: usize) -> Result<()> {
    if participants < 2 {
        bail!("a mesh needs at least 2 participants");
    }
    let limit = config.group.max_participants;
    if participants > limit {
        println!(
            "⚠️  {} participants exceed the mesh bound of {}, extra joiners will be refused",
            participants, limit
        );
    }

    let relay = LoopbackRelay::new();
    let channel = ChannelId::new("general");
    let users = (0..participants)
        .map(|i| LoopbackUser::connect(&relay, &format!("user{}", i + 1), config.clone()))
        .collect::<Result<Vec<_>, _>>()?;

    let Some((host, guests)) = users.split_first() else {
        bail!("no participants");
    };
    host.agent.groups().start(channel.clone(), MediaKind::Voice).await?;
    settle("the call to start", || {
        host.agent.groups().status() == Some(GroupCallStatus::Active)
    })
    .await?;
    let Some(call_id) = host.agent.groups().call_id() else {
        bail!("started call has no id");
    };
    println!("📞 {} started {} in #{}", host.id(), call_id, channel);

    let expected = participants.min(limit);
    for (joined, guest) in guests.iter().enumerate() {
        if let Err(e) = guest.agent.groups().join(channel.clone(), call_id, MediaKind::Voice).await {
            println!("❌ {} could not join: {}", guest.id(), e);
            continue;
        }
        let size = (joined + 2).min(limit);
        settle("the joiner to link up", || {
            guest.agent.groups().status().is_none()
                || guest.agent.groups().link_count() + 1 >= size
        })
        .await?;
        match guest.agent.groups().status() {
            Some(_) => println!("👋 {} joined", guest.id()),
            None => println!("❌ {} left: the mesh is full", guest.id()),
        }
    }

    settle("every link to connect", || {
        users.iter().take(expected).all(|u| {
            u.agent.groups().participants().iter().all(|p| {
                &p.user_id == u.id() || p.remote_stream.is_some()
            })
        })
    })
    .await?;
    for user in users.iter().take(expected) {
        let names: Vec<String> = user
            .agent
            .groups()
            .participants()
            .iter()
            .map(|p| p.display_name.clone())
            .collect();
        println!(
            "   {} sees [{}] over {} link(s)",
            user.id(),
            names.join(", "),
            user.agent.groups().link_count()
        );
    }

    if let Some(last) = users.iter().take(expected).last() {
        last.agent.groups().leave().await?;
        println!("🚪 {} left", last.id());
        settle("the others to drop the link", || {
            host.agent.groups().participant_count() == expected - 1
        })
        .await?;
        println!(
            "   {} now sees {} participant(s)",
            host.id(),
            host.agent.groups().participant_count()
        );
    }

    for user in &users {
        if user.agent.groups().status().is_some() {
            user.agent.groups().leave().await?;
        }
    }
    println!("📞 everyone left, relay room size: {}", relay.room_members(&channel).len());
    Ok(())
}

/// Screen share during a video call
pub async fn screen_share(config: AgentConfig) -> Result<()> {
    let relay = LoopbackRelay::new();
    let (alice, bob) = connect_call(&relay, &config, MediaKind::Video).await?;

    let outgoing_video = || {
        alice
            .agent
            .calls()
            .peer_link()
            .and_then(|link| link.sender_track(TrackKind::Video))
            .map(|track| track.source())
    };
    println!("🎥 alice sends {:?}", outgoing_video());

    alice.agent.calls().start_screen_share().await?;
    println!("🖥️  alice shares her screen, now sending {:?}", outgoing_video());

    alice.agent.calls().stop_screen_share().await?;
    println!("🎥 alice stopped sharing, back to {:?}", outgoing_video());

    bob.agent.calls().end().await?;
    settle("alice to hang up", || alice.agent.calls().state() == CallState::Idle).await?;
    println!("📞 call ended");
    Ok(())
}
