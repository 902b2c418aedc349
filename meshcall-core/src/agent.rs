//! Call agent
//!
//! One user's calling stack over one signaling connection: local media, the
//! one-call-at-a-time registry, the 1:1 manager and the group manager, plus
//! the loop that feeds inbound relay messages to them.

use crate::activity::LocalActivity;
use crate::call::{CallContext, CallError, CallManager};
use crate::config::AgentConfig;
use crate::group::GroupCallManager;
use crate::identity::ParticipantInfo;
use crate::media::{MediaCapture, MediaDevices, ScreenCapture};
use crate::peer::PeerConnectionFactory;
use crate::signaling::{SignalingError, SignalingHandler, SignalingMessage, SignalingTransport};
use crate::types::IncomingCallRequest;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Agent construction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AgentError {
    /// A required collaborator was not provided
    #[error("Missing dependency: {0}")]
    MissingDependency(&'static str),
}

/// One user's calls
pub struct CallAgent<T: SignalingTransport> {
    local: ParticipantInfo,
    signaling: Arc<SignalingHandler<T>>,
    media: Arc<MediaCapture>,
    activity: LocalActivity,
    calls: CallManager<T>,
    groups: GroupCallManager<T>,
}

impl<T: SignalingTransport> Clone for CallAgent<T> {
    fn clone(&self) -> Self {
        Self {
            local: self.local.clone(),
            signaling: self.signaling.clone(),
            media: self.media.clone(),
            activity: self.activity.clone(),
            calls: self.calls.clone(),
            groups: self.groups.clone(),
        }
    }
}

impl<T: SignalingTransport> CallAgent<T> {
    /// Create a builder for `local` over `transport`
    pub fn builder(local: ParticipantInfo, transport: Arc<T>) -> CallAgentBuilder<T> {
        CallAgentBuilder::new(local, transport)
    }

    /// The local user
    pub fn local(&self) -> &ParticipantInfo {
        &self.local
    }

    /// 1:1 calls
    pub fn calls(&self) -> &CallManager<T> {
        &self.calls
    }

    /// Group calls
    pub fn groups(&self) -> &GroupCallManager<T> {
        &self.groups
    }

    /// Local media
    pub fn media(&self) -> &Arc<MediaCapture> {
        &self.media
    }

    /// What the user is doing
    pub fn activity(&self) -> &LocalActivity {
        &self.activity
    }

    /// Relay connection
    pub fn signaling(&self) -> &Arc<SignalingHandler<T>> {
        &self.signaling
    }

    /// Route one inbound message to its manager
    ///
    /// # Errors
    ///
    /// Returns the manager's error. `SignalingRace` means the message refers
    /// to a call or peer that is already gone and can be dropped.
    #[tracing::instrument(skip(self, message), fields(user = %self.local.user_id, message_type = message.message_type()))]
    pub async fn handle_message(&self, message: SignalingMessage) -> Result<(), CallError> {
        match message {
            SignalingMessage::CallIncoming {
                call_id,
                caller,
                media_kind,
            } => {
                self.calls
                    .handle_incoming(IncomingCallRequest {
                        call_id,
                        caller,
                        media_kind,
                    })
                    .await
            }
            SignalingMessage::CallAccepted { call_id, callee } => {
                self.calls.on_remote_accept(call_id, callee).await
            }
            SignalingMessage::CallDeclined { call_id, .. } => self.calls.on_remote_declined(call_id).await,
            SignalingMessage::CallCancelled { call_id, .. } => {
                self.calls.on_remote_cancelled(call_id).await
            }
            SignalingMessage::CallEnded { call_id, .. } => self.calls.on_remote_ended(call_id).await,
            SignalingMessage::CallPeerBusy { call_id, .. } => self.calls.on_remote_busy(call_id).await,
            SignalingMessage::Offer {
                peer_id,
                call_id,
                sdp,
            } => self.calls.on_offer_received(peer_id, call_id, sdp).await,
            SignalingMessage::Answer {
                peer_id,
                call_id,
                sdp,
            } => self.calls.on_answer_received(peer_id, call_id, sdp).await,
            SignalingMessage::IceCandidate {
                peer_id,
                call_id,
                candidate,
            } => self.calls.on_ice_candidate(peer_id, call_id, candidate).await,
            SignalingMessage::GroupStarted {
                channel_id,
                call_id,
                participants,
                ..
            } => self.groups.on_started(channel_id, call_id, participants),
            SignalingMessage::GroupJoined {
                channel_id,
                call_id,
                participants,
                ..
            } => self.groups.on_joined(channel_id, call_id, participants).await,
            SignalingMessage::GroupPeerJoined {
                channel_id,
                call_id,
                peer,
            } => self.groups.on_peer_joined(channel_id, call_id, peer).await,
            SignalingMessage::GroupPeerLeft {
                channel_id,
                call_id,
                user_id,
            } => self.groups.on_peer_left(channel_id, call_id, user_id).await,
            SignalingMessage::GroupOffer {
                peer_id,
                call_id,
                channel_id,
                sdp,
            } => {
                self.groups
                    .on_offer_received(peer_id, channel_id, call_id, sdp)
                    .await
            }
            SignalingMessage::GroupAnswer {
                peer_id,
                call_id,
                channel_id,
                sdp,
            } => {
                self.groups
                    .on_answer_received(peer_id, channel_id, call_id, sdp)
                    .await
            }
            SignalingMessage::GroupIce {
                peer_id,
                call_id,
                channel_id,
                candidate,
            } => self.groups.on_ice(peer_id, channel_id, call_id, candidate).await,
            SignalingMessage::GroupEnded {
                call_id,
                channel_id,
            } => self.groups.on_call_ended(channel_id, call_id).await,
            SignalingMessage::GroupAlreadyActive {
                call_id,
                channel_id,
            } => self.groups.on_already_active(channel_id, call_id).await,
            outbound => Err(CallError::SignalingRace(format!(
                "{} is not a relay-to-client message",
                outbound.message_type()
            ))),
        }
    }

    /// Process inbound messages until the relay connection closes, then end
    /// whatever call is still live.
    #[tracing::instrument(skip(self), fields(user = %self.local.user_id))]
    pub async fn run(&self) {
        tracing::info!("Call agent running");
        loop {
            let message = match self.signaling.receive_message().await {
                Ok(message) => message,
                Err(SignalingError::Closed) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Receive failed");
                    continue;
                }
            };
            let message_type = message.message_type();
            match self.handle_message(message).await {
                Ok(()) => {}
                Err(CallError::SignalingRace(reason)) => {
                    tracing::warn!(message_type, %reason, "Dropping stale signal");
                }
                Err(e) => {
                    tracing::warn!(message_type, error = %e, "Signal handling failed");
                }
            }
        }
        tracing::info!("Signaling closed, shutting down");
        self.shutdown().await;
    }

    /// Run the agent on the tokio runtime
    pub fn spawn(&self) -> JoinHandle<()> {
        let agent = self.clone();
        tokio::spawn(async move { agent.run().await })
    }

    /// End the live 1:1 call, decline a waiting invitation and leave the
    /// group call, if any
    pub async fn shutdown(&self) {
        if self.calls.pending_incoming().is_some() {
            if let Err(e) = self.calls.decline_incoming().await {
                tracing::debug!(error = %e, "Pending call not declined");
            }
        }
        if let Err(e) = self.calls.end().await {
            tracing::debug!(error = %e, "No 1:1 call to end");
        }
        if let Err(e) = self.groups.leave().await {
            tracing::debug!(error = %e, "No group call to leave");
        }
    }
}

/// Builder for [`CallAgent`]
pub struct CallAgentBuilder<T: SignalingTransport> {
    local: ParticipantInfo,
    transport: Arc<T>,
    devices: Option<Arc<dyn MediaDevices>>,
    screen_capture: Option<Arc<dyn ScreenCapture>>,
    peers: Option<Arc<dyn PeerConnectionFactory>>,
    config: AgentConfig,
}

impl<T: SignalingTransport> CallAgentBuilder<T> {
    /// Create new builder
    pub fn new(local: ParticipantInfo, transport: Arc<T>) -> Self {
        Self {
            local,
            transport,
            devices: None,
            screen_capture: None,
            peers: None,
            config: AgentConfig::default(),
        }
    }

    /// Set the microphone/camera API
    #[must_use]
    pub fn with_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Set the screen-capture API
    #[must_use]
    pub fn with_screen_capture(mut self, screen_capture: Arc<dyn ScreenCapture>) -> Self {
        self.screen_capture = Some(screen_capture);
        self
    }

    /// Set the peer connection factory
    #[must_use]
    pub fn with_peer_factory(mut self, peers: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the agent
    ///
    /// # Errors
    ///
    /// Returns error if devices, screen capture or the peer factory are missing
    pub fn build(self) -> Result<CallAgent<T>, AgentError> {
        let devices = self
            .devices
            .ok_or(AgentError::MissingDependency("media devices"))?;
        let screen_capture = self
            .screen_capture
            .ok_or(AgentError::MissingDependency("screen capture"))?;
        let peers = self
            .peers
            .ok_or(AgentError::MissingDependency("peer connection factory"))?;

        let context = CallContext {
            local_user: self.local.user_id.clone(),
            signaling: Arc::new(SignalingHandler::new(self.transport)),
            media: Arc::new(MediaCapture::new(devices)),
            screen_capture,
            peers,
            activity: LocalActivity::new(),
        };
        tracing::debug!(user = %self.local.user_id, "Call agent built");
        Ok(CallAgent {
            calls: CallManager::new(&context, self.config.call),
            groups: GroupCallManager::new(&context, self.config.group),
            local: self.local,
            signaling: context.signaling,
            media: context.media,
            activity: context.activity,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::identity::UserId;
    use crate::loopback::{FakeMediaDevices, LoopbackPeerFactory, LoopbackRelay};
    use crate::types::{CallId, CallState, ChannelId, MediaKind};

    #[test]
    fn test_builder_requires_dependencies() {
        let relay = LoopbackRelay::new();
        let info = ParticipantInfo::anonymous(UserId::new("alice"));
        let transport = Arc::new(relay.connect(info.clone()));
        let res = CallAgent::builder(info, transport).build();
        assert!(matches!(res, Err(AgentError::MissingDependency("media devices"))));
    }

    #[tokio::test]
    async fn test_outbound_types_are_rejected() {
        let relay = LoopbackRelay::new();
        let info = ParticipantInfo::anonymous(UserId::new("alice"));
        let devices = Arc::new(FakeMediaDevices::new());
        let agent = CallAgent::builder(info.clone(), Arc::new(relay.connect(info)))
            .with_devices(devices.clone())
            .with_screen_capture(devices)
            .with_peer_factory(Arc::new(LoopbackPeerFactory::new(UserId::new("alice"))))
            .build()
            .unwrap();

        let res = agent
            .handle_message(SignalingMessage::CallAccept {
                call_id: CallId::new(),
            })
            .await;
        assert!(matches!(res, Err(CallError::SignalingRace(_))));
    }

    #[tokio::test]
    async fn test_managers_share_call_slot() {
        let relay = LoopbackRelay::new();
        let info = ParticipantInfo::anonymous(UserId::new("alice"));
        let devices = Arc::new(FakeMediaDevices::new());
        let agent = CallAgent::builder(info.clone(), Arc::new(relay.connect(info)))
            .with_devices(devices.clone())
            .with_screen_capture(devices)
            .with_peer_factory(Arc::new(LoopbackPeerFactory::new(UserId::new("alice"))))
            .build()
            .unwrap();

        agent
            .groups()
            .start(ChannelId::new("eng"), MediaKind::Voice)
            .await
            .unwrap();
        let res = agent.calls().initiate(UserId::new("bob"), MediaKind::Voice).await;
        assert_eq!(res, Err(CallError::AlreadyInCall));
        assert_eq!(agent.calls().state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_run_stops_when_relay_drops_user() {
        let relay = LoopbackRelay::new();
        let info = ParticipantInfo::anonymous(UserId::new("alice"));
        let devices = Arc::new(FakeMediaDevices::new());
        let agent = CallAgent::builder(info.clone(), Arc::new(relay.connect(info)))
            .with_devices(devices.clone())
            .with_screen_capture(devices.clone())
            .with_peer_factory(Arc::new(LoopbackPeerFactory::new(UserId::new("alice"))))
            .build()
            .unwrap();
        agent
            .groups()
            .start(ChannelId::new("eng"), MediaKind::Video)
            .await
            .unwrap();
        let handle = agent.spawn();

        relay.disconnect(&UserId::new("alice"));
        handle.await.unwrap();
        assert!(!agent.activity().is_busy());
        assert_eq!(devices.live_tracks(), 0);
    }
}
