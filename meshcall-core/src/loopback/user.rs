//! A fully wired simulated user

use super::{FakeMediaDevices, LoopbackPeerFactory, LoopbackRelay, LoopbackTransport};
use crate::agent::{AgentError, CallAgent};
use crate::config::AgentConfig;
use crate::identity::{ParticipantInfo, UserId};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// A user connected to a [`LoopbackRelay`] with fake devices and simulated
/// peer connections, with its agent running in the background
pub struct LoopbackUser {
    /// The user's agent
    pub agent: CallAgent<LoopbackTransport>,
    /// The user's capture devices
    pub devices: Arc<FakeMediaDevices>,
    /// The user's peer connection factory
    pub peers: LoopbackPeerFactory,
    task: JoinHandle<()>,
}

impl LoopbackUser {
    /// Connect `name` to the relay and start its agent
    ///
    /// # Errors
    ///
    /// Returns error if the agent cannot be built
    pub fn connect(relay: &LoopbackRelay, name: &str, config: AgentConfig) -> Result<Self, AgentError> {
        let info = ParticipantInfo {
            user_id: UserId::new(name),
            display_name: capitalize(name),
            avatar: None,
        };
        let devices = Arc::new(FakeMediaDevices::new());
        let peers = LoopbackPeerFactory::new(info.user_id.clone());
        let transport = Arc::new(relay.connect(info.clone()));

        let agent = CallAgent::builder(info, transport)
            .with_devices(devices.clone())
            .with_screen_capture(devices.clone())
            .with_peer_factory(Arc::new(peers.clone()))
            .with_config(config)
            .build()?;
        let task = agent.spawn();
        Ok(Self {
            agent,
            devices,
            peers,
            task,
        })
    }

    /// The user's id
    pub fn id(&self) -> &UserId {
        &self.agent.local().user_id
    }

    /// Check if the background agent has stopped
    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for LoopbackUser {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
