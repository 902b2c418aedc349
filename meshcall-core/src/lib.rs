//! Meshcall - call signaling and peer-connection orchestration
//!
//! This library drives 1:1 audio/video calls and small full-mesh group calls
//! over a signaling relay. It features:
//!
//! - **Call lifecycle**: invitation, ringing, accept/decline/busy, ring timeouts and hang-up
//! - **Negotiation**: offer/answer exchange with trickled ICE and early-candidate buffering
//! - **Mesh groups**: one peer link per remote participant with a bounded roster
//! - **Screen sharing**: camera/screen swap on every live link without renegotiation
//! - **Pluggable platform**: signaling transport, capture devices and peer connections are traits
//!
//! The `loopback` module provides in-memory implementations of all of them.
//!
//! # Examples
//!
//! ```rust,no_run
//! use meshcall_core::loopback::{FakeMediaDevices, LoopbackPeerFactory, LoopbackRelay};
//! use meshcall_core::{CallAgent, MediaKind, ParticipantInfo, UserId};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let relay = LoopbackRelay::new();
//! let alice = ParticipantInfo::new(UserId::new("alice"), "Alice");
//! let devices = Arc::new(FakeMediaDevices::new());
//!
//! let agent = CallAgent::builder(alice.clone(), Arc::new(relay.connect(alice.clone())))
//!     .with_devices(devices.clone())
//!     .with_screen_capture(devices)
//!     .with_peer_factory(Arc::new(LoopbackPeerFactory::new(alice.user_id)))
//!     .build()?;
//! let _task = agent.spawn();
//!
//! // Ring bob with a video call
//! let call_id = agent.calls().initiate(UserId::new("bob"), MediaKind::Video).await?;
//! # let _ = call_id;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// User identity and participant descriptors
pub mod identity;

/// Core call types and events
pub mod types;

/// Manager and agent configuration
pub mod config;

/// Signaling protocol and handlers
pub mod signaling;

/// Local media capture
pub mod media;

/// Remote ICE candidate buffering
pub mod ice;

/// Peer connection abstraction and per-peer links
pub mod peer;

/// Camera/screen switching across links
pub mod screen;

/// One-call-at-a-time registry
pub mod activity;

/// 1:1 call management and state
pub mod call;

/// Full-mesh group calls
pub mod group;

/// Per-user wiring of managers and the signaling loop
pub mod agent;

/// In-memory relay, devices and peer connections
pub mod loopback;

/// Peer connections backed by the `webrtc` crate (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod webrtc_backend;

// Re-export main types at crate root
pub use activity::{Activity, LocalActivity};
pub use agent::{AgentError, CallAgent, CallAgentBuilder};
pub use call::{CallContext, CallError, CallManager, CallSnapshot};
pub use config::{AgentConfig, CallManagerConfig, GroupCallConfig};
pub use group::{GroupCallManager, GroupCallStatus};
pub use ice::{Admission, IceCandidateBuffer};
pub use identity::{ParticipantInfo, UserId};
pub use media::{
    LocalTrack, MediaCapture, MediaDevices, MediaError, MediaStream, RemoteStream, RemoteTrack,
    ScreenCapture, TrackKind, TrackSource,
};
pub use peer::{
    PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventSender, PeerLink,
    SenderId,
};
pub use screen::{ScreenShareCoordinator, ScreenShareError};
pub use signaling::{SignalingError, SignalingHandler, SignalingMessage, SignalingTransport};
pub use types::*;
#[cfg(feature = "webrtc-backend")]
pub use webrtc_backend::{WebRtcPeerConnection, WebRtcPeerFactory};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::agent::{CallAgent, CallAgentBuilder};
    pub use crate::call::{CallError, CallManager};
    pub use crate::config::AgentConfig;
    pub use crate::group::{GroupCallManager, GroupCallStatus};
    pub use crate::identity::{ParticipantInfo, UserId};
    pub use crate::signaling::{SignalingHandler, SignalingMessage, SignalingTransport};
    pub use crate::types::{
        CallEvent, CallId, CallState, ChannelId, EndReason, GroupCallEvent, MediaKind,
    };
}
