//! Peer links
//!
//! A [`PeerLink`] wraps one peer connection to one remote party. It owns the
//! candidate buffer for that party, remembers which local track each sender
//! carries, and tracks negotiation and transport state.
//!
//! Negotiation steps on a link (applying descriptions, applying candidates,
//! swapping tracks) are serialized by a per-link async lock, so a candidate
//! that arrives while a remote description is being applied waits for it and
//! then goes through the buffer in arrival order.
//!
//! The underlying connection is abstracted by [`PeerConnection`] and created
//! through a [`PeerConnectionFactory`]; connection callbacks are delivered as
//! [`PeerEvent`]s on a channel that the owning session drains.

use crate::ice::{Admission, IceCandidateBuffer};
use crate::identity::UserId;
use crate::media::{LocalTrack, RemoteStream, RemoteTrack, TrackKind};
use crate::types::{
    ConnectionState, IceCandidate, NegotiationRole, PeerLinkState, SessionDescription,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Peer connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Link or connection already closed
    #[error("Peer connection closed")]
    Closed,

    /// Operation needs a remote description first
    #[error("No remote description")]
    NoRemoteDescription,

    /// Malformed or rejected session description
    #[error("SDP error: {0}")]
    Sdp(String),

    /// Backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Handle to an outgoing sender on a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SenderId(pub u64);

/// Callback from a peer connection
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate was gathered and must be signaled to the peer
    LocalCandidate(IceCandidate),
    /// A remote track started arriving
    RemoteTrack {
        /// Remote stream the track belongs to
        stream_id: String,
        /// The track
        track: RemoteTrack,
    },
    /// Transport state changed
    ConnectionState(ConnectionState),
}

/// Sink for peer connection callbacks
pub type PeerEventSender = mpsc::UnboundedSender<PeerEvent>;

/// One peer-to-peer connection, as provided by the platform
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Start sending a local track
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, PeerError>;

    /// Swap the track on an existing sender without renegotiating
    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<&LocalTrack>,
    ) -> Result<(), PeerError>;

    /// Remove a sender. Requires renegotiation.
    async fn remove_track(&self, sender: SenderId) -> Result<(), PeerError>;

    /// Create an offer, optionally restarting ICE
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Apply a local description
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote candidate. Fails before a remote description exists.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Close the connection and stop emitting events
    async fn close(&self);
}

/// Creates peer connections for the local user
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection to `remote`, reporting callbacks on `events`
    async fn create(
        &self,
        remote: &UserId,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

/// What a link wants done after a transport state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityVerdict {
    /// Nothing to do
    Healthy,
    /// Media path came up for the first time
    Established,
    /// Send an ICE-restart offer
    RestartIce,
    /// The peer is expected to restart ICE; wait for its offer
    AwaitRestart,
    /// Restart budget spent
    GiveUp,
}

/// Events of one link, ending when the link closes
pub struct PeerEvents {
    events: mpsc::UnboundedReceiver<PeerEvent>,
    shutdown: watch::Receiver<bool>,
}

impl PeerEvents {
    /// Next callback, or `None` once the link is closed
    pub async fn next(&mut self) -> Option<PeerEvent> {
        if *self.shutdown.borrow() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.shutdown.changed() => None,
            event = self.events.recv() => event,
        }
    }
}

#[derive(Debug)]
struct Sender {
    id: SenderId,
    track: Option<LocalTrack>,
}

#[derive(Debug)]
struct LinkInner {
    phase: PeerLinkState,
    candidates: IceCandidateBuffer,
    senders: HashMap<TrackKind, Sender>,
    remote_stream: Option<RemoteStream>,
    connection_state: ConnectionState,
    restarts_used: u32,
    established: bool,
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Connection to one remote party
pub struct PeerLink {
    serial: u64,
    peer_id: UserId,
    role: NegotiationRole,
    connection: Arc<dyn PeerConnection>,
    inner: Mutex<LinkInner>,
    negotiation: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl PeerLink {
    /// Create a link and its underlying connection.
    ///
    /// `early_candidates` are candidates from this peer that arrived before
    /// the link existed; they are held like any other pre-description
    /// candidate.
    ///
    /// # Errors
    ///
    /// Returns error if the connection cannot be created
    #[tracing::instrument(skip(factory, early_candidates), fields(peer = %peer_id))]
    pub async fn open(
        factory: &dyn PeerConnectionFactory,
        peer_id: UserId,
        role: NegotiationRole,
        early_candidates: Vec<IceCandidate>,
    ) -> Result<(Arc<Self>, PeerEvents), PeerError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let connection = factory.create(&peer_id, event_tx).await?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let link = Arc::new(Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            peer_id,
            role,
            connection,
            inner: Mutex::new(LinkInner {
                phase: PeerLinkState::New,
                candidates: IceCandidateBuffer::with_pending(early_candidates),
                senders: HashMap::new(),
                remote_stream: None,
                connection_state: ConnectionState::New,
                restarts_used: 0,
                established: false,
            }),
            negotiation: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            shutdown,
        });
        tracing::debug!(serial = link.serial, role = ?role, "Peer link created");

        Ok((
            link,
            PeerEvents {
                events: event_rx,
                shutdown: shutdown_rx,
            },
        ))
    }

    /// Process-unique link number, used to tell a link apart from a later
    /// link to the same peer
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Remote party
    pub fn peer_id(&self) -> &UserId {
        &self.peer_id
    }

    /// Who made the first offer
    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    /// Negotiation progress
    pub fn phase(&self) -> PeerLinkState {
        self.inner.lock().phase
    }

    /// Last reported transport state
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.lock().connection_state
    }

    /// Media received so far
    pub fn remote_stream(&self) -> Option<RemoteStream> {
        self.inner.lock().remote_stream.clone()
    }

    /// Local track carried by the sender of the given kind
    pub fn sender_track(&self, kind: TrackKind) -> Option<LocalTrack> {
        self.inner
            .lock()
            .senders
            .get(&kind)
            .and_then(|s| s.track.clone())
    }

    /// Check if there is a sender of the given kind
    pub fn has_sender(&self, kind: TrackKind) -> bool {
        self.inner.lock().senders.contains_key(&kind)
    }

    /// Candidates held until the remote description arrives
    pub fn pending_candidates(&self) -> usize {
        self.inner.lock().candidates.len()
    }

    /// Check if the link has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.is_closed() {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Start sending local tracks. One sender per kind.
    ///
    /// # Errors
    ///
    /// Returns error if the link is closed or the connection refuses a track
    pub async fn attach_tracks(&self, tracks: &[LocalTrack]) -> Result<(), PeerError> {
        let _guard = self.negotiation.lock().await;
        for track in tracks {
            self.ensure_open()?;
            if self.has_sender(track.kind()) {
                continue;
            }
            let id = self.connection.add_track(track).await?;
            self.inner.lock().senders.insert(
                track.kind(),
                Sender {
                    id,
                    track: Some(track.clone()),
                },
            );
        }
        Ok(())
    }

    /// Create and apply a local offer
    ///
    /// # Errors
    ///
    /// Returns error if the link is closed or the connection fails
    #[tracing::instrument(skip(self), fields(peer = %self.peer_id))]
    pub async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let _guard = self.negotiation.lock().await;
        self.ensure_open()?;
        let offer = self.connection.create_offer(ice_restart).await?;
        self.connection.set_local_description(offer.clone()).await?;
        self.advance_phase(PeerLinkState::Offering);
        tracing::debug!(sdp_len = offer.sdp.len(), "Local offer applied");
        Ok(offer)
    }

    /// Apply a remote offer, release held candidates and answer it
    ///
    /// # Errors
    ///
    /// Returns error if the link is closed or the offer is rejected
    #[tracing::instrument(skip(self, offer), fields(peer = %self.peer_id))]
    pub async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        let _guard = self.negotiation.lock().await;
        self.ensure_open()?;
        self.connection.set_remote_description(offer).await?;
        self.flush_candidates().await;
        let answer = self.connection.create_answer().await?;
        self.connection.set_local_description(answer.clone()).await?;
        self.advance_phase(PeerLinkState::Answering);
        tracing::debug!(sdp_len = answer.sdp.len(), "Remote offer answered");
        Ok(answer)
    }

    /// Apply a remote answer and release held candidates
    ///
    /// # Errors
    ///
    /// Returns error if the link is closed or the answer is rejected
    #[tracing::instrument(skip(self, answer), fields(peer = %self.peer_id))]
    pub async fn accept_answer(&self, answer: SessionDescription) -> Result<(), PeerError> {
        let _guard = self.negotiation.lock().await;
        self.ensure_open()?;
        self.connection.set_remote_description(answer).await?;
        self.flush_candidates().await;
        tracing::debug!("Remote answer applied");
        Ok(())
    }

    /// Hand a remote candidate to the link. Returns `true` if it was applied
    /// now and `false` if it is held for the remote description.
    ///
    /// # Errors
    ///
    /// Returns error if the link is closed or the connection rejects it
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<bool, PeerError> {
        let _guard = self.negotiation.lock().await;
        self.ensure_open()?;
        let admission = self.inner.lock().candidates.enqueue(candidate);
        match admission {
            Admission::Queued => {
                tracing::trace!(peer = %self.peer_id, "ICE candidate held until remote description");
                Ok(false)
            }
            Admission::ApplyNow(candidate) => {
                self.connection.add_ice_candidate(candidate).await?;
                tracing::trace!(peer = %self.peer_id, "ICE candidate applied");
                Ok(true)
            }
        }
    }

    async fn flush_candidates(&self) {
        let held = self.inner.lock().candidates.drain();
        if held.is_empty() {
            return;
        }
        tracing::debug!(peer = %self.peer_id, count = held.len(), "Applying held ICE candidates");
        for candidate in held {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                tracing::warn!(peer = %self.peer_id, error = %e, "Held ICE candidate rejected");
            }
        }
    }

    /// Put `track` on the outgoing video sender. Returns `true` when the
    /// sender set changed (added or removed) and the link must renegotiate;
    /// an in-place replacement returns `false`.
    ///
    /// # Errors
    ///
    /// Returns error if the link is closed or the connection fails
    pub async fn set_video_track(&self, track: Option<LocalTrack>) -> Result<bool, PeerError> {
        let _guard = self.negotiation.lock().await;
        self.ensure_open()?;
        let existing = self
            .inner
            .lock()
            .senders
            .get(&TrackKind::Video)
            .map(|s| s.id);

        match (existing, track) {
            (Some(id), Some(track)) => {
                self.connection.replace_track(id, Some(&track)).await?;
                if let Some(sender) = self.inner.lock().senders.get_mut(&TrackKind::Video) {
                    sender.track = Some(track);
                }
                Ok(false)
            }
            (None, Some(track)) => {
                let id = self.connection.add_track(&track).await?;
                self.inner.lock().senders.insert(
                    TrackKind::Video,
                    Sender {
                        id,
                        track: Some(track),
                    },
                );
                Ok(true)
            }
            (Some(id), None) => {
                self.connection.remove_track(id).await?;
                self.inner.lock().senders.remove(&TrackKind::Video);
                Ok(true)
            }
            (None, None) => Ok(false),
        }
    }

    /// Record a remote track. Returns the updated stream if the track is new.
    pub fn record_remote_track(&self, stream_id: &str, track: RemoteTrack) -> Option<RemoteStream> {
        let mut inner = self.inner.lock();
        let stream = inner
            .remote_stream
            .get_or_insert_with(|| RemoteStream::new(stream_id));
        if stream.add_track(track) {
            Some(stream.clone())
        } else {
            None
        }
    }

    /// Record a transport state change and decide what to do about it.
    /// `restart_budget` is the number of ICE restarts allowed per link.
    pub fn record_connection_state(
        &self,
        state: ConnectionState,
        restart_budget: u32,
    ) -> ConnectivityVerdict {
        let mut inner = self.inner.lock();
        inner.connection_state = state;
        match state {
            ConnectionState::Connected => {
                if inner.phase != PeerLinkState::Closed {
                    inner.phase = PeerLinkState::Connected;
                }
                if inner.established {
                    ConnectivityVerdict::Healthy
                } else {
                    inner.established = true;
                    ConnectivityVerdict::Established
                }
            }
            ConnectionState::Failed => {
                if inner.restarts_used >= restart_budget {
                    return ConnectivityVerdict::GiveUp;
                }
                inner.restarts_used += 1;
                match self.role {
                    NegotiationRole::Offerer => ConnectivityVerdict::RestartIce,
                    NegotiationRole::Answerer => ConnectivityVerdict::AwaitRestart,
                }
            }
            _ => ConnectivityVerdict::Healthy,
        }
    }

    fn advance_phase(&self, phase: PeerLinkState) {
        let mut inner = self.inner.lock();
        if matches!(inner.phase, PeerLinkState::New | PeerLinkState::Offering | PeerLinkState::Answering) {
            inner.phase = phase;
        }
    }

    /// Close the link. Only the first call does anything; it stops event
    /// delivery and closes the connection. Returns `true` for that call.
    pub async fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.shutdown.send(true);
        {
            let mut inner = self.inner.lock();
            inner.phase = PeerLinkState::Closed;
            inner.connection_state = ConnectionState::Closed;
        }
        self.connection.close().await;
        tracing::debug!(peer = %self.peer_id, serial = self.serial, "Peer link closed");
        true
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("serial", &self.serial)
            .field("peer_id", &self.peer_id)
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}
