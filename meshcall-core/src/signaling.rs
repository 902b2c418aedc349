//! Call signaling protocol
//!
//! Named messages exchanged with the signaling relay. The relay knows which
//! user each connection belongs to, so outbound messages name only the
//! target and inbound messages name only the sender: `peer_id` in the
//! negotiation messages is the target on the way out and the sender on the
//! way in.
//!
//! The envelope on the wire is `{"type": "<name>", "payload": {...}}`.

use crate::identity::{ParticipantInfo, UserId};
use crate::types::{CallId, ChannelId, IceCandidate, MediaKind};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Message could not be encoded or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Connection to the relay is gone
    #[error("Signaling channel closed")]
    Closed,
}

/// Signaling transport trait
///
/// Implement this for the relay connection (websocket, in-process, ...).
/// Messages from one sender must be delivered in the order they were sent;
/// nothing is assumed about ordering across senders.
#[async_trait]
pub trait SignalingTransport: Send + Sync + 'static {
    /// Transport error type
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a message to the relay
    async fn send_message(&self, message: SignalingMessage) -> Result<(), Self::Error>;

    /// Receive the next message from the relay
    async fn receive_message(&self) -> Result<SignalingMessage, Self::Error>;

    /// Check if the relay connection is still up. A failed receive on a
    /// disconnected transport ends the receive loop instead of backing off.
    fn is_connected(&self) -> bool {
        true
    }
}

/// Signaling message types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum SignalingMessage {
    // === 1:1 call control, outbound ===
    /// Invite a user
    #[serde(rename = "call.initiate")]
    CallInitiate {
        /// Call identifier chosen by the caller
        call_id: CallId,
        /// Callee
        receiver_id: UserId,
        /// Requested media
        media_kind: MediaKind,
    },

    /// Accept an invitation
    #[serde(rename = "call.accept")]
    CallAccept {
        /// Call identifier
        call_id: CallId,
    },

    /// Decline an invitation
    #[serde(rename = "call.decline")]
    CallDecline {
        /// Call identifier
        call_id: CallId,
    },

    /// Withdraw an invitation before it was answered
    #[serde(rename = "call.cancel")]
    CallCancel {
        /// Call identifier
        call_id: CallId,
    },

    /// Hang up
    #[serde(rename = "call.end")]
    CallEnd {
        /// Call identifier
        call_id: CallId,
        /// Seconds spent in the active state
        duration_secs: u64,
    },

    /// Refuse an invitation because we are in another call
    #[serde(rename = "call.busy")]
    CallBusy {
        /// Call identifier
        call_id: CallId,
    },

    // === 1:1 call control, inbound ===
    /// Someone is calling
    #[serde(rename = "call.incoming")]
    CallIncoming {
        /// Call identifier
        call_id: CallId,
        /// Caller profile
        caller: ParticipantInfo,
        /// Requested media
        media_kind: MediaKind,
    },

    /// Callee accepted
    #[serde(rename = "call.accepted")]
    CallAccepted {
        /// Call identifier
        call_id: CallId,
        /// Callee profile
        callee: ParticipantInfo,
    },

    /// Callee declined
    #[serde(rename = "call.declined")]
    CallDeclined {
        /// Call identifier
        call_id: CallId,
        /// Callee
        callee: UserId,
    },

    /// Caller withdrew the invitation
    #[serde(rename = "call.cancelled")]
    CallCancelled {
        /// Call identifier
        call_id: CallId,
        /// Caller
        caller: UserId,
    },

    /// Other party hung up
    #[serde(rename = "call.ended")]
    CallEnded {
        /// Call identifier
        call_id: CallId,
        /// Who hung up
        peer: UserId,
        /// Duration reported by the other party
        duration_secs: u64,
    },

    /// Callee is in another call
    #[serde(rename = "call.peer-busy")]
    CallPeerBusy {
        /// Call identifier
        call_id: CallId,
        /// Callee
        callee: UserId,
    },

    // === 1:1 negotiation, both directions ===
    /// SDP offer
    #[serde(rename = "negotiation.offer")]
    Offer {
        /// Target (outbound) or sender (inbound)
        peer_id: UserId,
        /// Call identifier
        call_id: CallId,
        /// SDP content
        sdp: String,
    },

    /// SDP answer
    #[serde(rename = "negotiation.answer")]
    Answer {
        /// Target (outbound) or sender (inbound)
        peer_id: UserId,
        /// Call identifier
        call_id: CallId,
        /// SDP content
        sdp: String,
    },

    /// ICE candidate
    #[serde(rename = "negotiation.ice-candidate")]
    IceCandidate {
        /// Target (outbound) or sender (inbound)
        peer_id: UserId,
        /// Call identifier
        call_id: CallId,
        /// Candidate
        candidate: IceCandidate,
    },

    // === Group call control, outbound ===
    /// Start a call in a channel
    #[serde(rename = "group.start")]
    GroupStart {
        /// Channel
        channel_id: ChannelId,
        /// Requested media
        media_kind: MediaKind,
    },

    /// Join the call running in a channel
    #[serde(rename = "group.join")]
    GroupJoin {
        /// Channel
        channel_id: ChannelId,
        /// Call identifier
        call_id: CallId,
        /// Requested media
        media_kind: MediaKind,
    },

    /// Leave a group call
    #[serde(rename = "group.leave")]
    GroupLeave {
        /// Channel
        channel_id: ChannelId,
        /// Call identifier, if known
        call_id: Option<CallId>,
    },

    // === Group call control, inbound ===
    /// Relay created the call we asked for
    #[serde(rename = "group.started")]
    GroupStarted {
        /// Channel
        channel_id: ChannelId,
        /// Call identifier
        call_id: CallId,
        /// Media kind
        media_kind: MediaKind,
        /// Members, including us
        participants: Vec<ParticipantInfo>,
    },

    /// Relay added us to the call
    #[serde(rename = "group.joined")]
    GroupJoined {
        /// Channel
        channel_id: ChannelId,
        /// Call identifier
        call_id: CallId,
        /// Media kind
        media_kind: MediaKind,
        /// Members, including us
        participants: Vec<ParticipantInfo>,
    },

    /// Another member joined
    #[serde(rename = "group.peer-joined")]
    GroupPeerJoined {
        /// Channel
        channel_id: ChannelId,
        /// Call identifier
        call_id: CallId,
        /// New member
        peer: ParticipantInfo,
    },

    /// A member left
    #[serde(rename = "group.peer-left")]
    GroupPeerLeft {
        /// Channel
        channel_id: ChannelId,
        /// Call identifier
        call_id: CallId,
        /// Member that left
        user_id: UserId,
    },

    /// Mesh SDP offer
    #[serde(rename = "group.offer")]
    GroupOffer {
        /// Target (outbound) or sender (inbound)
        peer_id: UserId,
        /// Call identifier
        call_id: CallId,
        /// Channel
        channel_id: ChannelId,
        /// SDP content
        sdp: String,
    },

    /// Mesh SDP answer
    #[serde(rename = "group.answer")]
    GroupAnswer {
        /// Target (outbound) or sender (inbound)
        peer_id: UserId,
        /// Call identifier
        call_id: CallId,
        /// Channel
        channel_id: ChannelId,
        /// SDP content
        sdp: String,
    },

    /// Mesh ICE candidate
    #[serde(rename = "group.ice")]
    GroupIce {
        /// Target (outbound) or sender (inbound)
        peer_id: UserId,
        /// Call identifier
        call_id: CallId,
        /// Channel
        channel_id: ChannelId,
        /// Candidate
        candidate: IceCandidate,
    },

    /// The call is over for everyone
    #[serde(rename = "group.ended")]
    GroupEnded {
        /// Call identifier
        call_id: CallId,
        /// Channel
        channel_id: ChannelId,
    },

    /// A call is already running in the channel we tried to start one in
    #[serde(rename = "group.already-active")]
    GroupAlreadyActive {
        /// Running call
        call_id: CallId,
        /// Channel
        channel_id: ChannelId,
    },
}

impl SignalingMessage {
    /// Wire name of the message
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::CallInitiate { .. } => "call.initiate",
            Self::CallAccept { .. } => "call.accept",
            Self::CallDecline { .. } => "call.decline",
            Self::CallCancel { .. } => "call.cancel",
            Self::CallEnd { .. } => "call.end",
            Self::CallBusy { .. } => "call.busy",
            Self::CallIncoming { .. } => "call.incoming",
            Self::CallAccepted { .. } => "call.accepted",
            Self::CallDeclined { .. } => "call.declined",
            Self::CallCancelled { .. } => "call.cancelled",
            Self::CallEnded { .. } => "call.ended",
            Self::CallPeerBusy { .. } => "call.peer-busy",
            Self::Offer { .. } => "negotiation.offer",
            Self::Answer { .. } => "negotiation.answer",
            Self::IceCandidate { .. } => "negotiation.ice-candidate",
            Self::GroupStart { .. } => "group.start",
            Self::GroupJoin { .. } => "group.join",
            Self::GroupLeave { .. } => "group.leave",
            Self::GroupStarted { .. } => "group.started",
            Self::GroupJoined { .. } => "group.joined",
            Self::GroupPeerJoined { .. } => "group.peer-joined",
            Self::GroupPeerLeft { .. } => "group.peer-left",
            Self::GroupOffer { .. } => "group.offer",
            Self::GroupAnswer { .. } => "group.answer",
            Self::GroupIce { .. } => "group.ice",
            Self::GroupEnded { .. } => "group.ended",
            Self::GroupAlreadyActive { .. } => "group.already-active",
        }
    }

    /// Call the message refers to, when it names one
    #[must_use]
    pub fn call_id(&self) -> Option<CallId> {
        match self {
            Self::CallInitiate { call_id, .. }
            | Self::CallAccept { call_id }
            | Self::CallDecline { call_id }
            | Self::CallCancel { call_id }
            | Self::CallEnd { call_id, .. }
            | Self::CallBusy { call_id }
            | Self::CallIncoming { call_id, .. }
            | Self::CallAccepted { call_id, .. }
            | Self::CallDeclined { call_id, .. }
            | Self::CallCancelled { call_id, .. }
            | Self::CallEnded { call_id, .. }
            | Self::CallPeerBusy { call_id, .. }
            | Self::Offer { call_id, .. }
            | Self::Answer { call_id, .. }
            | Self::IceCandidate { call_id, .. }
            | Self::GroupJoin { call_id, .. }
            | Self::GroupStarted { call_id, .. }
            | Self::GroupJoined { call_id, .. }
            | Self::GroupPeerJoined { call_id, .. }
            | Self::GroupPeerLeft { call_id, .. }
            | Self::GroupOffer { call_id, .. }
            | Self::GroupAnswer { call_id, .. }
            | Self::GroupIce { call_id, .. }
            | Self::GroupEnded { call_id, .. }
            | Self::GroupAlreadyActive { call_id, .. } => Some(*call_id),
            Self::GroupLeave { call_id, .. } => *call_id,
            Self::GroupStart { .. } => None,
        }
    }

    /// Check if this belongs to the group call protocol
    #[must_use]
    pub fn is_group(&self) -> bool {
        self.message_type().starts_with("group.")
    }

    /// Check if this is an offer, answer or candidate
    #[must_use]
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            Self::Offer { .. }
                | Self::Answer { .. }
                | Self::IceCandidate { .. }
                | Self::GroupOffer { .. }
                | Self::GroupAnswer { .. }
                | Self::GroupIce { .. }
        )
    }

    /// Encode to the JSON envelope
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Codec(e.to_string()))
    }

    /// Decode from the JSON envelope
    ///
    /// # Errors
    ///
    /// Returns error on malformed input or unknown message types
    pub fn from_json(s: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(s).map_err(|e| SignalingError::Codec(e.to_string()))
    }
}

/// Upper bound on the receive backoff after consecutive errors
const MAX_BACKOFF_STEPS: u32 = 10;

/// Signaling handler shared by every session of one user
pub struct SignalingHandler<T: SignalingTransport> {
    transport: std::sync::Arc<T>,
    error_count: Mutex<u32>,
}

impl<T: SignalingTransport> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: std::sync::Arc<T>) -> Self {
        Self {
            transport,
            error_count: Mutex::new(0),
        }
    }

    /// Send a signaling message
    ///
    /// # Errors
    ///
    /// Returns error if sending fails
    #[tracing::instrument(skip(self, message), fields(message_type = message.message_type()))]
    pub async fn send_message(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        tracing::debug!("Sending signaling message");
        self.transport.send_message(message).await.map_err(|e| {
            tracing::warn!(error = %e, "Failed to send signaling message");
            SignalingError::Transport(e.to_string())
        })
    }

    /// Receive a signaling message, backing off after consecutive errors
    ///
    /// # Errors
    ///
    /// Returns error if receiving fails
    #[tracing::instrument(skip(self))]
    pub async fn receive_message(&self) -> Result<SignalingMessage, SignalingError> {
        match self.transport.receive_message().await {
            Ok(message) => {
                *self.error_count.lock().await = 0;
                tracing::debug!(message_type = message.message_type(), "Received signaling message");
                Ok(message)
            }
            Err(e) if !self.transport.is_connected() => {
                tracing::info!(error = %e, "Signaling transport disconnected");
                Err(SignalingError::Closed)
            }
            Err(e) => {
                let count = {
                    let mut error_count = self.error_count.lock().await;
                    *error_count += 1;
                    *error_count
                };

                let backoff_duration =
                    Duration::from_millis(100 * u64::from(count.min(MAX_BACKOFF_STEPS)));
                tracing::warn!(
                    error_count = count,
                    backoff_ms = backoff_duration.as_millis(),
                    "Error receiving message, applying backoff"
                );
                sleep(backoff_duration).await;

                Err(SignalingError::Transport(e.to_string()))
            }
        }
    }

    /// Get access to the underlying transport
    #[must_use]
    pub fn transport(&self) -> &std::sync::Arc<T> {
        &self.transport
    }
}
