//! Call types and data structures

use crate::identity::{ParticipantInfo, UserId};
use crate::media::RemoteStream;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Workspace channel hosting a group call
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub String);

impl ChannelId {
    /// Create a channel id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What kind of media a call carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Microphone only
    Voice,
    /// Microphone and camera
    Video,
}

impl MediaKind {
    /// Check if the camera is captured
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Which side placed a 1:1 call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallDirection {
    /// Local user called
    Outgoing,
    /// Remote user called
    Incoming,
}

/// 1:1 call state
///
/// ```text
///   Idle ──► Initiating ──► RingingOutgoing ──┐
///     │                                       ▼
///     └────► RingingIncoming ─────────────► Connecting ──► Active ──► Ended
///
///   (any non-terminal state) ──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// No call
    Idle,
    /// Acquiring media before the invitation is sent
    Initiating,
    /// Invitation sent, waiting for the callee
    RingingOutgoing,
    /// Accepting an invitation, acquiring media
    RingingIncoming,
    /// Offer/answer/ICE exchange in progress
    Connecting,
    /// Remote media is flowing
    Active,
    /// Call finished normally
    Ended,
    /// Call aborted on an unrecoverable error
    Failed,
}

impl CallState {
    /// Check if no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Failed)
    }

    /// Check if `self -> to` is a legal transition
    pub fn can_transition_to(self, to: CallState) -> bool {
        use CallState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (_, Failed) | (_, Ended) => true,
            (Idle, Initiating) | (Idle, RingingIncoming) => true,
            (Initiating, RingingOutgoing) => true,
            (RingingOutgoing, Connecting) | (RingingIncoming, Connecting) => true,
            (Connecting, Active) => true,
            _ => false,
        }
    }
}

/// Why a call reached a terminal state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up
    LocalHangup,
    /// Local user cancelled before the callee answered
    LocalCancelled,
    /// Local user declined an invitation
    LocalDeclined,
    /// Remote user hung up
    RemoteEnded,
    /// Callee declined
    RemoteDeclined,
    /// Caller gave up before we answered
    RemoteCancelled,
    /// Callee was already in a call
    RemoteBusy,
    /// Nobody answered within the ring timeout
    NoAnswer,
    /// Lost a simultaneous-call tie-break and switched to the peer's call
    Superseded,
    /// Offer/answer exchange failed
    NegotiationFailed,
    /// ICE transport failed after the restart budget was spent
    ConnectivityFailed,
    /// Local devices could not be opened
    MediaUnavailable,
    /// The relay could not be reached
    SignalingFailed,
}

impl EndReason {
    /// Whether the call ended because of an error rather than a user action
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            Self::NegotiationFailed
                | Self::ConnectivityFailed
                | Self::MediaUnavailable
                | Self::SignalingFailed
        )
    }
}

/// Invitation received from another user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCallRequest {
    /// Call identifier chosen by the caller
    pub call_id: CallId,
    /// Who is calling
    pub caller: ParticipantInfo,
    /// Requested media
    pub media_kind: MediaKind,
}

/// Member of a group call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantRecord {
    /// User id
    pub user_id: UserId,
    /// Name shown in call UI
    pub display_name: String,
    /// Avatar URL
    pub avatar: Option<String>,
    /// Media received from this participant
    pub remote_stream: Option<RemoteStream>,
}

impl From<ParticipantInfo> for ParticipantRecord {
    fn from(info: ParticipantInfo) -> Self {
        Self {
            user_id: info.user_id,
            display_name: info.display_name,
            avatar: info.avatar,
            remote_stream: None,
        }
    }
}

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Session offer
    Offer,
    /// Session answer
    Answer,
}

/// Session description exchanged during negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    pub kind: SdpKind,
    /// SDP text
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate for a peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// SDP media ID
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP media line index
    #[serde(default)]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    /// Candidate with no media line association
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Which side of a peer link made the first offer. Fixed at link creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NegotiationRole {
    /// Sent the first offer
    Offerer,
    /// Answered the first offer
    Answerer,
}

/// Negotiation progress of one peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerLinkState {
    /// Created, nothing exchanged yet
    New,
    /// Local offer sent, waiting for the answer
    Offering,
    /// Remote offer applied, answer sent
    Answering,
    /// Transport connected
    Connected,
    /// Closed
    Closed,
}

/// Transport state reported by a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Not started
    New,
    /// Checking candidate pairs
    Connecting,
    /// Media path established
    Connected,
    /// Path lost, may recover by itself
    Disconnected,
    /// Path could not be established
    Failed,
    /// Connection closed
    Closed,
}

/// Record of a finished 1:1 call, handed to external record keeping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSummary {
    /// Call identifier
    pub call_id: CallId,
    /// The other party
    pub peer: UserId,
    /// Media kind
    pub media_kind: MediaKind,
    /// Who placed the call
    pub direction: CallDirection,
    /// When media started flowing, if it ever did
    pub started_at: Option<DateTime<Utc>>,
    /// Time spent in the active state
    pub duration: Duration,
    /// Terminal state
    pub final_state: CallState,
    /// Why the call ended
    pub reason: EndReason,
}

/// 1:1 call notifications for the presentation layer
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Invitation waiting for accept/decline
    IncomingCall {
        /// The invitation
        request: IncomingCallRequest,
    },
    /// Invitation dropped without a session: timed out or cancelled by the caller
    IncomingCallDismissed {
        /// Call identifier
        call_id: CallId,
        /// Why it went away
        reason: EndReason,
    },
    /// Session changed state
    StateChanged {
        /// Call identifier
        call_id: CallId,
        /// Previous state
        old_state: CallState,
        /// Current state
        new_state: CallState,
    },
    /// Remote media arrived
    RemoteStream {
        /// Call identifier
        call_id: CallId,
        /// The remote stream
        stream: RemoteStream,
    },
    /// Transport state of the peer link changed
    ConnectionStateChanged {
        /// Call identifier
        call_id: CallId,
        /// Reported state
        state: ConnectionState,
    },
    /// Microphone muted or unmuted
    MuteChanged {
        /// Whether the microphone is muted
        muted: bool,
    },
    /// Camera turned on or off
    VideoChanged {
        /// Whether the camera track is enabled
        enabled: bool,
    },
    /// Screen sharing started or stopped
    ScreenShareChanged {
        /// Whether the screen is being shared
        active: bool,
    },
    /// Session reached a terminal state
    Ended {
        /// What happened
        summary: CallSummary,
    },
}

/// Group call notifications for the presentation layer
#[derive(Debug, Clone)]
pub enum GroupCallEvent {
    /// Relay confirmed a call we started
    Started {
        /// Channel
        channel_id: ChannelId,
        /// Call identifier
        call_id: CallId,
    },
    /// Relay confirmed our join
    Joined {
        /// Channel
        channel_id: ChannelId,
        /// Call identifier
        call_id: CallId,
        /// Everyone in the call, including us
        participants: Vec<UserId>,
    },
    /// Someone joined
    ParticipantJoined {
        /// Who
        participant: ParticipantInfo,
    },
    /// Someone left
    ParticipantLeft {
        /// Who
        user_id: UserId,
    },
    /// Media arrived from a participant
    RemoteStream {
        /// From whom
        user_id: UserId,
        /// The remote stream
        stream: RemoteStream,
    },
    /// Transport state of one link changed
    LinkStateChanged {
        /// Remote participant
        user_id: UserId,
        /// Reported state
        state: ConnectionState,
    },
    /// A peer could not be linked because the mesh is full
    MeshFull {
        /// Refused peer
        user_id: UserId,
        /// Configured bound
        limit: usize,
    },
    /// Microphone muted or unmuted
    MuteChanged {
        /// Whether the microphone is muted
        muted: bool,
    },
    /// Camera turned on or off
    VideoChanged {
        /// Whether the camera track is enabled
        enabled: bool,
    },
    /// Screen sharing started or stopped
    ScreenShareChanged {
        /// Whether the screen is being shared
        active: bool,
    },
    /// Local session torn down
    Ended {
        /// Channel
        channel_id: ChannelId,
        /// Call identifier, if the relay ever assigned one
        call_id: Option<CallId>,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_media_kind_wire_names() {
        assert_eq!(serde_json::to_string(&MediaKind::Voice).unwrap(), "\"voice\"");
        assert_eq!(serde_json::to_string(&MediaKind::Video).unwrap(), "\"video\"");
        assert!(MediaKind::Video.has_video());
        assert!(!MediaKind::Voice.has_video());
    }

    #[test]
    fn test_outgoing_path_transitions() {
        use CallState::*;
        assert!(Idle.can_transition_to(Initiating));
        assert!(Initiating.can_transition_to(RingingOutgoing));
        assert!(RingingOutgoing.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Active));
        assert!(Active.can_transition_to(Ended));
    }

    #[test]
    fn test_incoming_path_transitions() {
        use CallState::*;
        assert!(Idle.can_transition_to(RingingIncoming));
        assert!(RingingIncoming.can_transition_to(Connecting));
        assert!(!RingingIncoming.can_transition_to(RingingOutgoing));
    }

    #[test]
    fn test_terminal_states_are_final() {
        use CallState::*;
        for to in [Idle, Initiating, Connecting, Active, Ended, Failed] {
            assert!(!Ended.can_transition_to(to));
            assert!(!Failed.can_transition_to(to));
        }
    }

    #[test]
    fn test_any_live_state_can_fail() {
        use CallState::*;
        for from in [Idle, Initiating, RingingOutgoing, RingingIncoming, Connecting, Active] {
            assert!(from.can_transition_to(Failed));
        }
    }

    #[test]
    fn test_no_skipping_ahead() {
        use CallState::*;
        assert!(!Idle.can_transition_to(Active));
        assert!(!Initiating.can_transition_to(Connecting));
        assert!(!Active.can_transition_to(Connecting));
    }

    #[test]
    fn test_failure_reasons() {
        assert!(EndReason::NegotiationFailed.is_failure());
        assert!(EndReason::ConnectivityFailed.is_failure());
        assert!(!EndReason::RemoteBusy.is_failure());
    }
}
