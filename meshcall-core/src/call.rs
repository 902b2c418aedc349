//! 1:1 calls
//!
//! `CallManager` drives the single-peer call state machine:
//!
//! ```text
//!   Idle ──► Initiating ──► RingingOutgoing ──┐
//!     │                                       ▼
//!     └────► RingingIncoming ─────────────► Connecting ──► Active ──► Ended
//!
//!   (any non-terminal state) ──► Failed
//! ```
//!
//! Sessions live in an id-keyed table. Everything that finishes after an
//! await point (media acquisition, link creation, timers, peer callbacks)
//! looks its session up again by id and does nothing if it is gone, so a
//! hangup racing with any of them is harmless. Terminal transitions remove
//! the session, close its peer link, release local media and free the
//! user's call slot on every path.
//!
//! # Simultaneous calls
//!
//! When two users call each other at the same instant, both see an incoming
//! invitation while ringing out. The user with the lower id keeps its
//! outgoing call and ignores the invitation; the other cancels its own call
//! and answers. Both ends apply the same rule, so exactly one call survives.

use crate::activity::{Activity, LocalActivity};
use crate::config::CallManagerConfig;
use crate::identity::{ParticipantInfo, UserId};
use crate::media::{MediaCapture, MediaError, MediaStream, ScreenCapture};
use crate::peer::{ConnectivityVerdict, PeerConnectionFactory, PeerError, PeerEvent, PeerEvents, PeerLink};
use crate::screen::{ScreenShareCoordinator, ScreenShareError};
use crate::signaling::{SignalingError, SignalingHandler, SignalingMessage, SignalingTransport};
use crate::types::{
    CallDirection, CallEvent, CallId, CallState, CallSummary, EndReason, IncomingCallRequest,
    MediaKind, NegotiationRole, SessionDescription,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Call errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// The local user is already in a call
    #[error("Already in a call")]
    AlreadyInCall,

    /// Local devices could not be opened
    #[error("Media unavailable: {0}")]
    MediaUnavailable(#[from] MediaError),

    /// Offer/answer exchange failed
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Peer transport could not be established
    #[error("Connectivity failed: {0}")]
    ConnectivityFailed(String),

    /// Message for a call or peer that no longer exists
    #[error("Stale signal: {0}")]
    SignalingRace(String),

    /// No invitation is waiting
    #[error("No pending incoming call")]
    NoPendingCall,

    /// No call is in progress
    #[error("No active call")]
    NoActiveCall,

    /// Operation not allowed in the current state
    #[error("Invalid call state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        /// State the operation needs
        expected: CallState,
        /// State the call is in
        actual: CallState,
    },

    /// The relay could not be reached
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// The group call already has as many participants as a mesh allows
    #[error("Mesh is full ({limit} participants)")]
    MeshFull {
        /// Configured bound
        limit: usize,
    },
}

impl From<SignalingError> for CallError {
    fn from(err: SignalingError) -> Self {
        CallError::Signaling(err.to_string())
    }
}

impl From<PeerError> for CallError {
    fn from(err: PeerError) -> Self {
        match err {
            PeerError::Closed => CallError::SignalingRace("peer link closed".to_string()),
            other => CallError::NegotiationFailed(other.to_string()),
        }
    }
}

impl From<ScreenShareError> for CallError {
    fn from(err: ScreenShareError) -> Self {
        match err {
            ScreenShareError::Media(e) => CallError::MediaUnavailable(e),
            ScreenShareError::Peer(e) => e.into(),
            ScreenShareError::Inactive => CallError::NoActiveCall,
        }
    }
}

/// Collaborators shared by the 1:1 and group managers of one user
pub struct CallContext<T: SignalingTransport> {
    /// Local user
    pub local_user: UserId,
    /// Relay connection
    pub signaling: Arc<SignalingHandler<T>>,
    /// Local media
    pub media: Arc<MediaCapture>,
    /// Screen-capture API
    pub screen_capture: Arc<dyn ScreenCapture>,
    /// Creates peer connections
    pub peers: Arc<dyn PeerConnectionFactory>,
    /// One-call-at-a-time registry
    pub activity: LocalActivity,
}

impl<T: SignalingTransport> Clone for CallContext<T> {
    fn clone(&self) -> Self {
        Self {
            local_user: self.local_user.clone(),
            signaling: self.signaling.clone(),
            media: self.media.clone(),
            screen_capture: self.screen_capture.clone(),
            peers: self.peers.clone(),
            activity: self.activity.clone(),
        }
    }
}

/// Read-only view of the live call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    /// Call identifier
    pub call_id: CallId,
    /// The other party
    pub peer: ParticipantInfo,
    /// Media kind
    pub media_kind: MediaKind,
    /// Who placed the call
    pub direction: CallDirection,
    /// Current state
    pub state: CallState,
    /// When media started flowing
    pub started_at: Option<DateTime<Utc>>,
}

struct CallSession {
    id: CallId,
    peer: ParticipantInfo,
    media_kind: MediaKind,
    direction: CallDirection,
    state: CallState,
    started_at: Option<DateTime<Utc>>,
    active_since: Option<Instant>,
    link: Option<Arc<PeerLink>>,
    ring_timer: Option<JoinHandle<()>>,
}

impl CallSession {
    fn new(id: CallId, peer: ParticipantInfo, media_kind: MediaKind, direction: CallDirection) -> Self {
        Self {
            id,
            peer,
            media_kind,
            direction,
            state: CallState::Idle,
            started_at: None,
            active_since: None,
            link: None,
            ring_timer: None,
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            call_id: self.id,
            peer: self.peer.clone(),
            media_kind: self.media_kind,
            direction: self.direction,
            state: self.state,
            started_at: self.started_at,
        }
    }

    fn elapsed(&self) -> std::time::Duration {
        self.active_since.map(|t| t.elapsed()).unwrap_or_default()
    }
}

struct PendingIncoming {
    request: IncomingCallRequest,
    timer: JoinHandle<()>,
}

struct Inner<T: SignalingTransport> {
    local_user: UserId,
    config: CallManagerConfig,
    signaling: Arc<SignalingHandler<T>>,
    media: Arc<MediaCapture>,
    screen: ScreenShareCoordinator,
    peers: Arc<dyn PeerConnectionFactory>,
    activity: LocalActivity,
    sessions: RwLock<HashMap<CallId, CallSession>>,
    pending: Mutex<Option<PendingIncoming>>,
    event_sender: broadcast::Sender<CallEvent>,
}

/// 1:1 call manager
///
/// Cheap to clone; clones share the same sessions.
pub struct CallManager<T: SignalingTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: SignalingTransport> Clone for CallManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: SignalingTransport> CallManager<T> {
    /// Create a call manager
    pub fn new(context: &CallContext<T>, config: CallManagerConfig) -> Self {
        let (event_sender, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                local_user: context.local_user.clone(),
                screen: ScreenShareCoordinator::new(
                    context.screen_capture.clone(),
                    context.media.clone(),
                ),
                config,
                signaling: context.signaling.clone(),
                media: context.media.clone(),
                peers: context.peers.clone(),
                activity: context.activity.clone(),
                sessions: RwLock::new(HashMap::new()),
                pending: Mutex::new(None),
                event_sender,
            }),
        }
    }

    /// Subscribe to call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.event_sender.subscribe()
    }

    /// State of the live call, `Idle` when there is none
    pub fn state(&self) -> CallState {
        self.inner
            .sessions
            .read()
            .values()
            .next()
            .map_or(CallState::Idle, |s| s.state)
    }

    /// The live call
    pub fn current_call(&self) -> Option<CallSnapshot> {
        self.inner.sessions.read().values().next().map(CallSession::snapshot)
    }

    /// Invitation waiting for accept/decline
    pub fn pending_incoming(&self) -> Option<IncomingCallRequest> {
        self.inner.pending.lock().as_ref().map(|p| p.request.clone())
    }

    /// Peer link of the live call, once negotiation has started
    pub fn peer_link(&self) -> Option<Arc<PeerLink>> {
        self.inner
            .sessions
            .read()
            .values()
            .next()
            .and_then(|s| s.link.clone())
    }

    /// Check if the screen is being shared
    pub fn is_screen_sharing(&self) -> bool {
        self.inner.screen.is_sharing()
    }

    /// Call a user
    ///
    /// Opens local media, sends the invitation and rings until the callee
    /// answers or the ring timeout passes.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyInCall` if a call is in progress, `MediaUnavailable`
    /// if the devices cannot be opened (nothing is sent in that case),
    /// `SignalingRace` if the call was ended while the devices were opening
    #[tracing::instrument(skip(self), fields(local = %self.inner.local_user))]
    pub async fn initiate(&self, peer: UserId, media_kind: MediaKind) -> Result<CallId, CallError> {
        let inner = &self.inner;
        let call_id = CallId::new();
        if !inner.activity.try_claim(Activity::Direct(call_id)) {
            tracing::warn!("Refusing to place call: already in a call");
            return Err(CallError::AlreadyInCall);
        }

        tracing::info!(call_id = %call_id, peer = %peer, ?media_kind, "Initiating call");
        inner.sessions.write().insert(
            call_id,
            CallSession::new(
                call_id,
                ParticipantInfo::anonymous(peer.clone()),
                media_kind,
                CallDirection::Outgoing,
            ),
        );
        inner.transition(call_id, CallState::Initiating)?;

        let stream = match inner.media.acquire(media_kind).await {
            Ok(stream) => stream,
            Err(e) => {
                inner
                    .teardown(call_id, CallState::Failed, EndReason::MediaUnavailable, true)
                    .await;
                return Err(e.into());
            }
        };
        if !inner.adopt_for(call_id, stream) || inner.transition(call_id, CallState::RingingOutgoing).is_err() {
            return Err(ended_meanwhile(call_id));
        }

        let sent = inner
            .signaling
            .send_message(SignalingMessage::CallInitiate {
                call_id,
                receiver_id: peer,
                media_kind,
            })
            .await;
        if let Err(e) = sent {
            inner
                .teardown(call_id, CallState::Failed, EndReason::SignalingFailed, true)
                .await;
            return Err(e.into());
        }
        inner.arm_ring_timer(call_id);
        Ok(call_id)
    }

    /// Process an invitation from another user
    ///
    /// The invitation is held for the ring timeout and then declined unless
    /// accepted or declined first. While in another call the caller gets a
    /// busy signal instead.
    ///
    /// # Errors
    ///
    /// Returns error if a busy signal or the simultaneous-call cancel cannot
    /// be sent
    #[tracing::instrument(skip(self, request), fields(call_id = %request.call_id, caller = %request.caller.user_id))]
    pub async fn handle_incoming(&self, request: IncomingCallRequest) -> Result<(), CallError> {
        let inner = &self.inner;
        let caller = request.caller.user_id.clone();

        let glare = inner
            .sessions
            .read()
            .values()
            .find(|s| {
                s.direction == CallDirection::Outgoing
                    && s.peer.user_id == caller
                    && matches!(s.state, CallState::Initiating | CallState::RingingOutgoing)
            })
            .map(|s| (s.id, s.media_kind));
        if let Some((own_id, own_kind)) = glare {
            if inner.local_user.wins_glare_against(&caller) {
                tracing::info!(own_call = %own_id, "Simultaneous call, keeping ours");
                return Ok(());
            }
            tracing::info!(own_call = %own_id, "Simultaneous call, yielding to the peer");
            return inner.yield_to(own_id, own_kind, request).await.map(|_| ());
        }

        let busy = {
            let mut pending = inner.pending.lock();
            if inner.activity.is_busy() || pending.is_some() {
                true
            } else {
                let timer = inner.arm_incoming_timer(request.call_id);
                *pending = Some(PendingIncoming {
                    request: request.clone(),
                    timer,
                });
                false
            }
        };

        if busy {
            tracing::info!("Busy, refusing incoming call");
            inner
                .signaling
                .send_message(SignalingMessage::CallBusy {
                    call_id: request.call_id,
                })
                .await?;
            return Ok(());
        }

        tracing::info!(media_kind = ?request.media_kind, "Incoming call");
        let _ = inner.event_sender.send(CallEvent::IncomingCall { request });
        Ok(())
    }

    /// Accept the pending invitation
    ///
    /// # Errors
    ///
    /// Returns `NoPendingCall` without an invitation, `AlreadyInCall` while
    /// in another call, `MediaUnavailable` if the devices cannot be opened
    /// (the invitation is declined in that case), `SignalingRace` if the
    /// call was ended while accepting
    #[tracing::instrument(skip(self))]
    pub async fn accept_incoming(&self) -> Result<CallId, CallError> {
        let inner = &self.inner;
        if inner.activity.is_busy() {
            return Err(CallError::AlreadyInCall);
        }
        let pending = inner.pending.lock().take().ok_or(CallError::NoPendingCall)?;
        pending.timer.abort();
        let request = pending.request;

        if !inner.activity.try_claim(Activity::Direct(request.call_id)) {
            inner.send_quietly(SignalingMessage::CallDecline {
                call_id: request.call_id,
            })
            .await;
            return Err(CallError::AlreadyInCall);
        }
        inner.accept_request(request, None).await
    }

    /// Decline the pending invitation
    ///
    /// # Errors
    ///
    /// Returns `NoPendingCall` without an invitation, or a signaling error
    #[tracing::instrument(skip(self))]
    pub async fn decline_incoming(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let pending = inner.pending.lock().take().ok_or(CallError::NoPendingCall)?;
        pending.timer.abort();
        let call_id = pending.request.call_id;

        tracing::info!(call_id = %call_id, "Declining incoming call");
        let _ = inner.event_sender.send(CallEvent::IncomingCallDismissed {
            call_id,
            reason: EndReason::LocalDeclined,
        });
        inner
            .signaling
            .send_message(SignalingMessage::CallDecline { call_id })
            .await?;
        Ok(())
    }

    /// Withdraw the outgoing invitation before the callee answers
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` without an outgoing call, `InvalidState` once
    /// the callee has answered
    #[tracing::instrument(skip(self))]
    pub async fn cancel_outgoing(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let (call_id, state) = inner
            .sessions
            .read()
            .values()
            .find(|s| s.direction == CallDirection::Outgoing)
            .map(|s| (s.id, s.state))
            .ok_or(CallError::NoActiveCall)?;
        if !matches!(state, CallState::Initiating | CallState::RingingOutgoing) {
            return Err(CallError::InvalidState {
                expected: CallState::RingingOutgoing,
                actual: state,
            });
        }

        inner.send_quietly(SignalingMessage::CallCancel { call_id }).await;
        inner
            .teardown(call_id, CallState::Ended, EndReason::LocalCancelled, true)
            .await;
        Ok(())
    }

    /// Hang up
    ///
    /// Valid in every live state. Before the callee answered this cancels
    /// the invitation; while accepting it declines. Local teardown happens
    /// even if the relay cannot be reached.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` without a call
    #[tracing::instrument(skip(self))]
    pub async fn end(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let (call_id, state, elapsed) = inner
            .sessions
            .read()
            .values()
            .next()
            .map(|s| (s.id, s.state, s.elapsed()))
            .ok_or(CallError::NoActiveCall)?;

        let (message, reason) = match state {
            CallState::Initiating | CallState::RingingOutgoing => {
                (SignalingMessage::CallCancel { call_id }, EndReason::LocalCancelled)
            }
            CallState::RingingIncoming => {
                (SignalingMessage::CallDecline { call_id }, EndReason::LocalDeclined)
            }
            _ => (
                SignalingMessage::CallEnd {
                    call_id,
                    duration_secs: elapsed.as_secs(),
                },
                EndReason::LocalHangup,
            ),
        };

        inner.send_quietly(message).await;
        inner.teardown(call_id, CallState::Ended, reason, true).await;
        Ok(())
    }

    /// The callee accepted our invitation: create the offering link and
    /// send the offer
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` for an unknown call, `NegotiationFailed` if
    /// the offer cannot be produced (the call fails)
    #[tracing::instrument(skip(self, callee), fields(callee = %callee.user_id))]
    pub async fn on_remote_accept(&self, call_id: CallId, callee: ParticipantInfo) -> Result<(), CallError> {
        let inner = &self.inner;
        let peer = {
            let mut sessions = inner.sessions.write();
            let session = sessions
                .get_mut(&call_id)
                .filter(|s| {
                    s.direction == CallDirection::Outgoing && s.state == CallState::RingingOutgoing
                })
                .ok_or_else(|| race("accept", call_id))?;
            if let Some(timer) = session.ring_timer.take() {
                timer.abort();
            }
            session.peer = callee;
            session.peer.user_id.clone()
        };
        inner.transition(call_id, CallState::Connecting)?;

        let link = match inner.open_link(call_id, &peer, NegotiationRole::Offerer).await {
            Ok(Some(link)) => link,
            Ok(None) => return Ok(()),
            Err(e) => return Err(inner.fail_negotiation(call_id, e).await),
        };
        let offer = inner.negotiated(call_id, link.create_offer(false).await).await?;
        inner
            .signaling
            .send_message(SignalingMessage::Offer {
                peer_id: peer,
                call_id,
                sdp: offer.sdp,
            })
            .await?;
        Ok(())
    }

    /// Apply an offer from the peer and answer it
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` for an unknown call or peer,
    /// `NegotiationFailed` if the offer is rejected (the call fails)
    #[tracing::instrument(skip(self, sdp), fields(from = %from))]
    pub async fn on_offer_received(&self, from: UserId, call_id: CallId, sdp: String) -> Result<(), CallError> {
        let inner = &self.inner;
        let link = inner.link_for(call_id, &from)?;
        let answer = inner
            .negotiated(call_id, link.accept_offer(SessionDescription::offer(sdp)).await)
            .await?;
        inner
            .signaling
            .send_message(SignalingMessage::Answer {
                peer_id: from,
                call_id,
                sdp: answer.sdp,
            })
            .await?;
        Ok(())
    }

    /// Apply the peer's answer
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` for an unknown call or peer,
    /// `NegotiationFailed` if the answer is rejected (the call fails)
    #[tracing::instrument(skip(self, sdp), fields(from = %from))]
    pub async fn on_answer_received(&self, from: UserId, call_id: CallId, sdp: String) -> Result<(), CallError> {
        let inner = &self.inner;
        let link = inner.link_for(call_id, &from)?;
        inner
            .negotiated(call_id, link.accept_answer(SessionDescription::answer(sdp)).await)
            .await
    }

    /// Hand a candidate from the peer to the link. Candidates that arrive
    /// before the remote description are held until it is applied.
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` for an unknown call or peer
    pub async fn on_ice_candidate(
        &self,
        from: UserId,
        call_id: CallId,
        candidate: crate::types::IceCandidate,
    ) -> Result<(), CallError> {
        let link = self.inner.link_for(call_id, &from)?;
        match link.add_remote_candidate(candidate).await {
            Ok(_) => Ok(()),
            Err(PeerError::Closed) => Err(race("ice-candidate", call_id)),
            Err(e) => {
                tracing::warn!(call_id = %call_id, peer = %from, error = %e, "ICE candidate rejected");
                Ok(())
            }
        }
    }

    /// The callee declined
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` for an unknown call
    pub async fn on_remote_declined(&self, call_id: CallId) -> Result<(), CallError> {
        self.inner
            .end_outgoing_by_peer(call_id, EndReason::RemoteDeclined)
            .await
    }

    /// The callee is in another call
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` for an unknown call
    pub async fn on_remote_busy(&self, call_id: CallId) -> Result<(), CallError> {
        self.inner.end_outgoing_by_peer(call_id, EndReason::RemoteBusy).await
    }

    /// The caller withdrew the invitation
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` for an unknown call
    pub async fn on_remote_cancelled(&self, call_id: CallId) -> Result<(), CallError> {
        self.inner
            .end_by_peer(call_id, EndReason::RemoteCancelled)
            .await
    }

    /// The peer hung up
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` for an unknown call
    pub async fn on_remote_ended(&self, call_id: CallId) -> Result<(), CallError> {
        self.inner.end_by_peer(call_id, EndReason::RemoteEnded).await
    }

    /// Mute or unmute the microphone. Returns the new muted state.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` when no local media is live
    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        self.inner.require_session()?;
        let muted = self.inner.media.toggle_mute().ok_or(CallError::NoActiveCall)?;
        tracing::debug!(muted, "Microphone toggled");
        let _ = self.inner.event_sender.send(CallEvent::MuteChanged { muted });
        Ok(muted)
    }

    /// Turn the outgoing video on or off. Returns the new enabled state.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` without a call, `MediaUnavailable` when the
    /// call sends no video
    pub fn toggle_video(&self) -> Result<bool, CallError> {
        self.inner.require_session()?;
        let enabled = self
            .inner
            .media
            .toggle_video()
            .ok_or_else(|| CallError::MediaUnavailable(MediaError::DeviceNotFound("camera".to_string())))?;
        tracing::debug!(enabled, "Video toggled");
        let _ = self.inner.event_sender.send(CallEvent::VideoChanged { enabled });
        Ok(enabled)
    }

    /// Share the screen in place of the camera
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` before negotiation started, `MediaUnavailable`
    /// if the screen cannot be captured
    #[tracing::instrument(skip(self))]
    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let (call_id, state, link) = inner
            .sessions
            .read()
            .values()
            .next()
            .map(|s| (s.id, s.state, s.link.clone()))
            .ok_or(CallError::NoActiveCall)?;
        let Some(link) = link else {
            return Err(CallError::InvalidState {
                expected: CallState::Active,
                actual: state,
            });
        };

        let change = inner.screen.start(&[link]).await?;
        if change.changed {
            let _ = inner.event_sender.send(CallEvent::ScreenShareChanged { active: true });
        }
        inner.renegotiate(call_id, change.renegotiate).await
    }

    /// Stop sharing and put the camera back. Does nothing when not sharing.
    ///
    /// # Errors
    ///
    /// Returns error if a renegotiation offer cannot be produced
    #[tracing::instrument(skip(self))]
    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let (call_id, link) = match inner.sessions.read().values().next() {
            Some(s) => (Some(s.id), s.link.clone()),
            None => (None, None),
        };
        let links: Vec<_> = link.into_iter().collect();

        let change = inner.screen.stop(&links).await;
        if change.changed {
            let _ = inner.event_sender.send(CallEvent::ScreenShareChanged { active: false });
        }
        match call_id {
            Some(call_id) => inner.renegotiate(call_id, change.renegotiate).await,
            None => Ok(()),
        }
    }
}

fn ended_meanwhile(call_id: CallId) -> CallError {
    CallError::SignalingRace(format!("call {call_id} ended while it was being set up"))
}

fn race(what: &str, call_id: CallId) -> CallError {
    CallError::SignalingRace(format!("{what} for unknown call {call_id}"))
}

impl<T: SignalingTransport> Inner<T> {
    fn emit(&self, event: CallEvent) {
        let _ = self.event_sender.send(event);
    }

    fn require_session(&self) -> Result<CallId, CallError> {
        self.sessions
            .read()
            .keys()
            .next()
            .copied()
            .ok_or(CallError::NoActiveCall)
    }

    fn transition(&self, call_id: CallId, to: CallState) -> Result<(), CallError> {
        let old = {
            let mut sessions = self.sessions.write();
            let session = sessions
                .get_mut(&call_id)
                .ok_or_else(|| race("transition", call_id))?;
            let old = session.state;
            if !old.can_transition_to(to) {
                tracing::warn!(call_id = %call_id, old_state = ?old, new_state = ?to, "Ignoring illegal transition");
                return Err(CallError::SignalingRace(format!(
                    "call {call_id} cannot go from {old:?} to {to:?}"
                )));
            }
            session.state = to;
            if to == CallState::Active {
                session.started_at = Some(Utc::now());
                session.active_since = Some(Instant::now());
            }
            old
        };
        tracing::info!(call_id = %call_id, old_state = ?old, new_state = ?to, "Call state changed");
        self.emit(CallEvent::StateChanged {
            call_id,
            old_state: old,
            new_state: to,
        });
        Ok(())
    }

    /// Install a freshly acquired stream if the session is still alive;
    /// otherwise stop its tracks. Holds the table lock so a concurrent
    /// teardown either sees the stream and releases it, or happened first.
    fn adopt_for(&self, call_id: CallId, stream: MediaStream) -> bool {
        let sessions = self.sessions.read();
        if !sessions.contains_key(&call_id) {
            tracing::debug!(call_id = %call_id, "Call ended during media acquisition, dropping stream");
            for track in stream.tracks() {
                track.stop();
            }
            return false;
        }
        self.media.adopt(stream);
        true
    }

    fn link_for(&self, call_id: CallId, from: &UserId) -> Result<Arc<PeerLink>, CallError> {
        self.sessions
            .read()
            .get(&call_id)
            .filter(|s| &s.peer.user_id == from)
            .and_then(|s| s.link.clone())
            .ok_or_else(|| race("negotiation", call_id))
    }

    fn resolve_link(&self, call_id: CallId, serial: u64) -> Option<(Arc<PeerLink>, UserId, CallState)> {
        let sessions = self.sessions.read();
        let session = sessions.get(&call_id)?;
        let link = session.link.as_ref().filter(|l| l.serial() == serial)?;
        Some((link.clone(), session.peer.user_id.clone(), session.state))
    }

    async fn send_quietly(&self, message: SignalingMessage) {
        if let Err(e) = self.signaling.send_message(message).await {
            tracing::warn!(error = %e, "Signal not delivered, continuing local teardown");
        }
    }

    async fn yield_to(
        self: &Arc<Self>,
        own_id: CallId,
        own_kind: MediaKind,
        request: IncomingCallRequest,
    ) -> Result<CallId, CallError> {
        self.send_quietly(SignalingMessage::CallCancel { call_id: own_id })
            .await;

        let reuse = own_kind == request.media_kind;
        self.activity
            .transfer(&Activity::Direct(own_id), Activity::Direct(request.call_id));
        let stream = if reuse { self.media.stream() } else { None };
        self.teardown(own_id, CallState::Ended, EndReason::Superseded, !reuse)
            .await;

        if !self.activity.try_claim(Activity::Direct(request.call_id))
            && self.activity.current() != Activity::Direct(request.call_id)
        {
            return Err(CallError::AlreadyInCall);
        }
        self.accept_request(request, stream).await
    }

    async fn accept_request(
        self: &Arc<Self>,
        request: IncomingCallRequest,
        reuse: Option<MediaStream>,
    ) -> Result<CallId, CallError> {
        let call_id = request.call_id;
        let peer = request.caller.user_id.clone();
        tracing::info!(call_id = %call_id, caller = %peer, "Accepting call");

        self.sessions.write().insert(
            call_id,
            CallSession::new(call_id, request.caller, request.media_kind, CallDirection::Incoming),
        );
        self.transition(call_id, CallState::RingingIncoming)?;

        let stream = match reuse {
            Some(stream) => stream,
            None => match self.media.acquire(request.media_kind).await {
                Ok(stream) => stream,
                Err(e) => {
                    self.send_quietly(SignalingMessage::CallDecline { call_id }).await;
                    self.teardown(call_id, CallState::Failed, EndReason::MediaUnavailable, true)
                        .await;
                    return Err(e.into());
                }
            },
        };
        if !self.adopt_for(call_id, stream) {
            return Err(ended_meanwhile(call_id));
        }

        match self.open_link(call_id, &peer, NegotiationRole::Answerer).await {
            Ok(Some(_)) => {}
            Ok(None) => return Err(ended_meanwhile(call_id)),
            Err(e) => {
                self.send_quietly(SignalingMessage::CallDecline { call_id }).await;
                self.teardown(call_id, CallState::Failed, EndReason::NegotiationFailed, true)
                    .await;
                return Err(e);
            }
        }
        if self.transition(call_id, CallState::Connecting).is_err() {
            return Err(ended_meanwhile(call_id));
        }

        if let Err(e) = self
            .signaling
            .send_message(SignalingMessage::CallAccept { call_id })
            .await
        {
            self.teardown(call_id, CallState::Failed, EndReason::SignalingFailed, true)
                .await;
            return Err(e.into());
        }
        Ok(call_id)
    }

    /// Create the session's peer link, attach local media and start its
    /// event pump. `None` when the session went away meanwhile; the new
    /// link is closed in that case.
    async fn open_link(
        self: &Arc<Self>,
        call_id: CallId,
        peer: &UserId,
        role: NegotiationRole,
    ) -> Result<Option<Arc<PeerLink>>, CallError> {
        let (link, events) = PeerLink::open(&*self.peers, peer.clone(), role, Vec::new())
            .await
            .map_err(|e| CallError::NegotiationFailed(e.to_string()))?;
        if let Err(e) = link.attach_tracks(&self.media.local_tracks()).await {
            link.close().await;
            return Err(CallError::NegotiationFailed(e.to_string()));
        }

        let installed = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(&call_id) {
                Some(session) if session.link.is_none() => {
                    session.link = Some(link.clone());
                    true
                }
                _ => false,
            }
        };
        if !installed {
            tracing::debug!(call_id = %call_id, "Call ended while its link was created");
            link.close().await;
            return Ok(None);
        }

        self.spawn_pump(call_id, link.serial(), events);
        Ok(Some(link))
    }

    fn spawn_pump(self: &Arc<Self>, call_id: CallId, serial: u64, mut events: PeerEvents) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.handle_peer_event(call_id, serial, event).await {
                    break;
                }
            }
        });
    }

    async fn handle_peer_event(self: &Arc<Self>, call_id: CallId, serial: u64, event: PeerEvent) -> bool {
        let Some((link, peer, state)) = self.resolve_link(call_id, serial) else {
            return false;
        };
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                tracing::trace!(call_id = %call_id, "Sending local ICE candidate");
                self.send_quietly(SignalingMessage::IceCandidate {
                    peer_id: peer,
                    call_id,
                    candidate,
                })
                .await;
            }
            PeerEvent::RemoteTrack { stream_id, track } => {
                if let Some(stream) = link.record_remote_track(&stream_id, track) {
                    self.emit(CallEvent::RemoteStream { call_id, stream });
                }
                if state == CallState::Connecting {
                    let _ = self.transition(call_id, CallState::Active);
                }
            }
            PeerEvent::ConnectionState(connection) => {
                self.emit(CallEvent::ConnectionStateChanged {
                    call_id,
                    state: connection,
                });
                match link.record_connection_state(connection, self.config.ice_restart_attempts) {
                    ConnectivityVerdict::RestartIce => {
                        tracing::info!(call_id = %call_id, "Connectivity lost, restarting ICE");
                        match link.create_offer(true).await {
                            Ok(offer) => {
                                self.send_quietly(SignalingMessage::Offer {
                                    peer_id: peer,
                                    call_id,
                                    sdp: offer.sdp,
                                })
                                .await;
                            }
                            Err(PeerError::Closed) => {}
                            Err(e) => {
                                tracing::error!(call_id = %call_id, error = %e, "ICE restart offer failed");
                                self.fail(call_id, EndReason::ConnectivityFailed).await;
                            }
                        }
                    }
                    ConnectivityVerdict::AwaitRestart => {
                        tracing::info!(call_id = %call_id, "Connectivity lost, waiting for the peer to restart ICE");
                    }
                    ConnectivityVerdict::GiveUp => {
                        tracing::error!(call_id = %call_id, "Connectivity failed after ICE restart");
                        self.fail(call_id, EndReason::ConnectivityFailed).await;
                    }
                    ConnectivityVerdict::Established | ConnectivityVerdict::Healthy => {}
                }
            }
        }
        true
    }

    async fn renegotiate(&self, call_id: CallId, links: Vec<Arc<PeerLink>>) -> Result<(), CallError> {
        for link in links {
            let offer = self.negotiated(call_id, link.create_offer(false).await).await?;
            self.signaling
                .send_message(SignalingMessage::Offer {
                    peer_id: link.peer_id().clone(),
                    call_id,
                    sdp: offer.sdp,
                })
                .await?;
        }
        Ok(())
    }

    /// Map a link result: a closed link means the call is already gone,
    /// any other failure fails the call.
    async fn negotiated<V>(&self, call_id: CallId, result: Result<V, PeerError>) -> Result<V, CallError> {
        match result {
            Ok(v) => Ok(v),
            Err(PeerError::Closed) => Err(race("negotiation", call_id)),
            Err(e) => Err(self.fail_negotiation(call_id, e.into()).await),
        }
    }

    async fn fail_negotiation(&self, call_id: CallId, error: CallError) -> CallError {
        tracing::error!(call_id = %call_id, error = %error, "Negotiation failed");
        self.fail(call_id, EndReason::NegotiationFailed).await;
        match error {
            CallError::NegotiationFailed(_) => error,
            other => CallError::NegotiationFailed(other.to_string()),
        }
    }

    /// Tell the peer the call is over and fail it locally
    async fn fail(&self, call_id: CallId, reason: EndReason) {
        let Some(elapsed) = self.sessions.read().get(&call_id).map(CallSession::elapsed) else {
            return;
        };
        self.send_quietly(SignalingMessage::CallEnd {
            call_id,
            duration_secs: elapsed.as_secs(),
        })
        .await;
        self.teardown(call_id, CallState::Failed, reason, true).await;
    }

    async fn end_outgoing_by_peer(&self, call_id: CallId, reason: EndReason) -> Result<(), CallError> {
        let known = self
            .sessions
            .read()
            .get(&call_id)
            .is_some_and(|s| s.direction == CallDirection::Outgoing);
        if !known {
            return Err(race("remote termination", call_id));
        }
        tracing::info!(call_id = %call_id, ?reason, "Peer ended the call");
        self.teardown(call_id, CallState::Ended, reason, true).await;
        Ok(())
    }

    async fn end_by_peer(&self, call_id: CallId, reason: EndReason) -> Result<(), CallError> {
        let dismissed = {
            let mut pending = self.pending.lock();
            if pending.as_ref().is_some_and(|p| p.request.call_id == call_id) {
                pending.take()
            } else {
                None
            }
        };
        if let Some(p) = dismissed {
            p.timer.abort();
            tracing::info!(call_id = %call_id, "Caller withdrew the invitation");
            self.emit(CallEvent::IncomingCallDismissed {
                call_id,
                reason: EndReason::RemoteCancelled,
            });
            return Ok(());
        }

        if self.teardown(call_id, CallState::Ended, reason, true).await {
            tracing::info!(call_id = %call_id, ?reason, "Peer ended the call");
            Ok(())
        } else {
            Err(race("remote termination", call_id))
        }
    }

    fn arm_ring_timer(self: &Arc<Self>, call_id: CallId) {
        let weak = Arc::downgrade(self);
        let timeout = self.config.ring_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_ring_timeout(call_id).await;
            }
        });
        match self.sessions.write().get_mut(&call_id) {
            Some(session) => session.ring_timer = Some(timer),
            None => timer.abort(),
        }
    }

    async fn on_ring_timeout(&self, call_id: CallId) {
        let ringing = {
            let mut sessions = self.sessions.write();
            match sessions.get_mut(&call_id) {
                Some(s) if s.state == CallState::RingingOutgoing => {
                    // Drop our own handle; aborting it here would cancel this task
                    s.ring_timer.take();
                    true
                }
                _ => false,
            }
        };
        if !ringing {
            return;
        }
        tracing::info!(call_id = %call_id, "No answer, cancelling call");
        self.send_quietly(SignalingMessage::CallCancel { call_id }).await;
        self.teardown(call_id, CallState::Ended, EndReason::NoAnswer, true)
            .await;
    }

    fn arm_incoming_timer(self: &Arc<Self>, call_id: CallId) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        let timeout = self.config.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.on_incoming_timeout(call_id).await;
            }
        })
    }

    async fn on_incoming_timeout(&self, call_id: CallId) {
        let expired = {
            let mut pending = self.pending.lock();
            if pending.as_ref().is_some_and(|p| p.request.call_id == call_id) {
                pending.take()
            } else {
                None
            }
        };
        if expired.is_none() {
            return;
        }
        tracing::info!(call_id = %call_id, "Incoming call unanswered, declining");
        self.emit(CallEvent::IncomingCallDismissed {
            call_id,
            reason: EndReason::NoAnswer,
        });
        self.send_quietly(SignalingMessage::CallDecline { call_id }).await;
    }

    /// Remove a session and release everything it held. Returns `false` if
    /// the session was already gone.
    async fn teardown(&self, call_id: CallId, final_state: CallState, reason: EndReason, release_media: bool) -> bool {
        let Some(mut session) = self.sessions.write().remove(&call_id) else {
            return false;
        };
        if let Some(timer) = session.ring_timer.take() {
            timer.abort();
        }
        let duration = session.elapsed();
        if let Some(link) = session.link.take() {
            link.close().await;
        }
        self.screen.reset();
        if release_media {
            self.media.release();
        }
        self.activity.release(&Activity::Direct(call_id));

        tracing::info!(
            call_id = %call_id,
            old_state = ?session.state,
            new_state = ?final_state,
            ?reason,
            duration_secs = duration.as_secs(),
            "Call finished"
        );
        self.emit(CallEvent::StateChanged {
            call_id,
            old_state: session.state,
            new_state: final_state,
        });
        self.emit(CallEvent::Ended {
            summary: CallSummary {
                call_id,
                peer: session.peer.user_id,
                media_kind: session.media_kind,
                direction: session.direction,
                started_at: session.started_at,
                duration,
                final_state,
                reason,
            },
        });
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::loopback::{FakeMediaDevices, LoopbackPeerFactory, LoopbackRelay, LoopbackTransport};
    use crate::types::CallEvent;
    use std::time::Duration;

    struct Harness {
        manager: CallManager<LoopbackTransport>,
        devices: Arc<FakeMediaDevices>,
        media: Arc<MediaCapture>,
        activity: LocalActivity,
        relay: LoopbackRelay,
        bob: LoopbackTransport,
        peers: LoopbackPeerFactory,
    }

    fn harness() -> Harness {
        let relay = LoopbackRelay::new();
        let alice = relay.connect(ParticipantInfo::anonymous(UserId::new("alice")));
        let bob = relay.connect(ParticipantInfo::anonymous(UserId::new("bob")));
        let devices = Arc::new(FakeMediaDevices::new());
        let media = Arc::new(MediaCapture::new(devices.clone()));
        let peers = LoopbackPeerFactory::new(UserId::new("alice"));
        let activity = LocalActivity::new();
        let context = CallContext {
            local_user: UserId::new("alice"),
            signaling: Arc::new(SignalingHandler::new(Arc::new(alice))),
            media: media.clone(),
            screen_capture: devices.clone(),
            peers: Arc::new(peers.clone()),
            activity: activity.clone(),
        };
        Harness {
            manager: CallManager::new(&context, CallManagerConfig::default()),
            devices,
            media,
            activity,
            relay,
            bob,
            peers,
        }
    }

    fn request(call_id: CallId, from: &str) -> IncomingCallRequest {
        IncomingCallRequest {
            call_id,
            caller: ParticipantInfo::anonymous(UserId::new(from)),
            media_kind: MediaKind::Voice,
        }
    }

    async fn ended(events: &mut broadcast::Receiver<CallEvent>) -> CallSummary {
        loop {
            if let CallEvent::Ended { summary } = events.recv().await.unwrap() {
                return summary;
            }
        }
    }

    #[tokio::test]
    async fn test_initiate_rings() {
        let h = harness();
        let call_id = h.manager.initiate(UserId::new("bob"), MediaKind::Video).await.unwrap();
        assert_eq!(h.manager.state(), CallState::RingingOutgoing);

        match h.bob.receive_message().await.unwrap() {
            SignalingMessage::CallIncoming { call_id: id, caller, .. } => {
                assert_eq!(id, call_id);
                assert_eq!(caller.user_id, UserId::new("alice"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_second_initiate_is_already_in_call() {
        let h = harness();
        h.manager.initiate(UserId::new("bob"), MediaKind::Voice).await.unwrap();
        let res = h.manager.initiate(UserId::new("carol"), MediaKind::Voice).await;
        assert_eq!(res, Err(CallError::AlreadyInCall));
    }

    #[tokio::test]
    async fn test_media_failure_sends_nothing() {
        let h = harness();
        let mut events = h.manager.subscribe_events();
        h.devices.fail_next_user_media(MediaError::PermissionDenied("microphone".into()));

        let res = h.manager.initiate(UserId::new("bob"), MediaKind::Voice).await;
        assert!(matches!(res, Err(CallError::MediaUnavailable(_))));
        assert!(h.relay.sent_by(&UserId::new("alice")).is_empty());
        assert!(!h.activity.is_busy());

        let summary = ended(&mut events).await;
        assert_eq!(summary.final_state, CallState::Failed);
        assert_eq!(summary.reason, EndReason::MediaUnavailable);
    }

    #[tokio::test]
    async fn test_busy_when_in_call() {
        let h = harness();
        h.manager.initiate(UserId::new("bob"), MediaKind::Voice).await.unwrap();
        let other = CallId::new();
        h.manager.handle_incoming(request(other, "carol")).await.unwrap();

        assert!(h.manager.pending_incoming().is_none());
        assert!(h
            .relay
            .sent_by(&UserId::new("alice"))
            .contains(&SignalingMessage::CallBusy { call_id: other }));
    }

    #[tokio::test]
    async fn test_remote_decline_tears_down() {
        let h = harness();
        let mut events = h.manager.subscribe_events();
        let call_id = h.manager.initiate(UserId::new("bob"), MediaKind::Video).await.unwrap();

        h.manager.on_remote_declined(call_id).await.unwrap();
        let summary = ended(&mut events).await;
        assert_eq!(summary.reason, EndReason::RemoteDeclined);
        assert_eq!(h.manager.state(), CallState::Idle);
        assert_eq!(h.devices.live_tracks(), 0);
        assert!(!h.activity.is_busy());
        assert_eq!(h.peers.connections_created(), 0);

        assert!(matches!(
            h.manager.on_remote_declined(call_id).await,
            Err(CallError::SignalingRace(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outgoing_ring_timeout() {
        let h = harness();
        let mut events = h.manager.subscribe_events();
        let call_id = h.manager.initiate(UserId::new("bob"), MediaKind::Voice).await.unwrap();

        let summary = ended(&mut events).await;
        assert_eq!(summary.reason, EndReason::NoAnswer);
        assert!(h
            .relay
            .sent_by(&UserId::new("alice"))
            .contains(&SignalingMessage::CallCancel { call_id }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_incoming_timeout_declines() {
        let h = harness();
        let mut events = h.manager.subscribe_events();
        let call_id = CallId::new();
        h.manager.handle_incoming(request(call_id, "bob")).await.unwrap();
        assert!(h.manager.pending_incoming().is_some());

        tokio::time::sleep(Duration::from_secs(31)).await;
        loop {
            match events.recv().await.unwrap() {
                CallEvent::IncomingCallDismissed { call_id: id, reason } => {
                    assert_eq!(id, call_id);
                    assert_eq!(reason, EndReason::NoAnswer);
                    break;
                }
                _ => continue,
            }
        }
        assert!(h.manager.pending_incoming().is_none());
        assert!(h
            .relay
            .sent_by(&UserId::new("alice"))
            .contains(&SignalingMessage::CallDecline { call_id }));
        assert_eq!(h.peers.connections_created(), 0);
    }

    #[tokio::test]
    async fn test_decline_without_pending() {
        let h = harness();
        assert_eq!(h.manager.decline_incoming().await, Err(CallError::NoPendingCall));
        assert_eq!(h.manager.accept_incoming().await, Err(CallError::NoPendingCall));
    }

    #[tokio::test]
    async fn test_accept_media_failure_declines() {
        let h = harness();
        let call_id = CallId::new();
        h.manager.handle_incoming(request(call_id, "bob")).await.unwrap();
        h.devices.fail_next_user_media(MediaError::DeviceBusy("microphone".into()));

        let res = h.manager.accept_incoming().await;
        assert!(matches!(res, Err(CallError::MediaUnavailable(_))));
        assert!(h
            .relay
            .sent_by(&UserId::new("alice"))
            .contains(&SignalingMessage::CallDecline { call_id }));
        assert!(!h.activity.is_busy());
        assert_eq!(h.peers.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_accept_is_invalid() {
        let h = harness();
        let call_id = h.manager.initiate(UserId::new("bob"), MediaKind::Voice).await.unwrap();
        h.manager
            .on_remote_accept(call_id, ParticipantInfo::anonymous(UserId::new("bob")))
            .await
            .unwrap();
        assert_eq!(h.manager.state(), CallState::Connecting);
        assert_eq!(
            h.manager.cancel_outgoing().await,
            Err(CallError::InvalidState {
                expected: CallState::RingingOutgoing,
                actual: CallState::Connecting,
            })
        );
    }

    #[tokio::test]
    async fn test_end_while_connecting_is_total() {
        let h = harness();
        let call_id = h.manager.initiate(UserId::new("bob"), MediaKind::Video).await.unwrap();
        h.manager
            .on_remote_accept(call_id, ParticipantInfo::anonymous(UserId::new("bob")))
            .await
            .unwrap();
        let link = h.manager.peer_link().unwrap();

        h.manager.end().await.unwrap();
        assert!(link.is_closed());
        assert_eq!(h.peers.open_connections(), 0);
        assert!(!h.media.has_live_tracks());
        assert_eq!(h.devices.live_tracks(), 0);
        assert!(h.manager.peer_link().is_none());
        assert!(h
            .relay
            .sent_by(&UserId::new("alice"))
            .iter()
            .any(|m| matches!(m, SignalingMessage::CallEnd { .. })));
        assert_eq!(h.manager.end().await, Err(CallError::NoActiveCall));
    }

    #[tokio::test]
    async fn test_bad_offer_fails_call() {
        let h = harness();
        let mut events = h.manager.subscribe_events();
        let call_id = CallId::new();
        h.manager.handle_incoming(request(call_id, "bob")).await.unwrap();
        h.manager.accept_incoming().await.unwrap();

        let res = h
            .manager
            .on_offer_received(UserId::new("bob"), call_id, "garbage".into())
            .await;
        assert!(matches!(res, Err(CallError::NegotiationFailed(_))));
        let summary = ended(&mut events).await;
        assert_eq!(summary.final_state, CallState::Failed);
        assert_eq!(summary.reason, EndReason::NegotiationFailed);
        assert_eq!(h.peers.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_stray_signals_are_races() {
        let h = harness();
        let call_id = CallId::new();
        assert!(matches!(
            h.manager.on_answer_received(UserId::new("bob"), call_id, "v=0".into()).await,
            Err(CallError::SignalingRace(_))
        ));
        assert!(matches!(
            h.manager
                .on_ice_candidate(UserId::new("bob"), call_id, crate::types::IceCandidate::new("candidate:1"))
                .await,
            Err(CallError::SignalingRace(_))
        ));
        assert!(matches!(
            h.manager.on_remote_ended(call_id).await,
            Err(CallError::SignalingRace(_))
        ));
    }
}
