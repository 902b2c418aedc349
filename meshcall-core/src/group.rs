//! Mesh group calls
//!
//! Every participant holds one [`PeerLink`] to every other participant. When
//! someone joins, each member already in the call opens an offering link to
//! the newcomer; the newcomer only answers. A leave closes exactly the links
//! to the leaver.
//!
//! The mesh costs N-1 links per participant, so the number of participants
//! is capped by [`GroupCallConfig::max_participants`]. Peers beyond the cap
//! are refused with [`CallError::MeshFull`].
//!
//! Like the 1:1 manager, everything that resumes after an await re-resolves
//! the session (by serial) and the link (by peer and link serial) before
//! touching them.

use crate::activity::{Activity, LocalActivity};
use crate::call::{CallContext, CallError};
use crate::config::GroupCallConfig;
use crate::identity::{ParticipantInfo, UserId};
use crate::media::{MediaCapture, MediaError, MediaStream};
use crate::peer::{ConnectivityVerdict, PeerConnectionFactory, PeerError, PeerEvent, PeerEvents, PeerLink};
use crate::screen::ScreenShareCoordinator;
use crate::signaling::{SignalingHandler, SignalingMessage, SignalingTransport};
use crate::types::{
    CallId, ChannelId, GroupCallEvent, IceCandidate, MediaKind, NegotiationRole,
    ParticipantRecord, SessionDescription,
};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Progress of the local group session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCallStatus {
    /// Start requested, waiting for the relay
    Starting,
    /// Join requested, waiting for the relay
    Joining,
    /// In the call
    Active,
}

struct GroupSession {
    serial: u64,
    channel_id: ChannelId,
    call_id: Option<CallId>,
    media_kind: MediaKind,
    status: GroupCallStatus,
    participants: HashMap<UserId, ParticipantRecord>,
    links: HashMap<UserId, Arc<PeerLink>>,
    early_candidates: HashMap<UserId, Vec<IceCandidate>>,
    /// Peers dropped from this call; their late offers and candidates are
    /// stale until the relay announces them again
    departed: HashSet<UserId>,
}

impl GroupSession {
    fn matches(&self, channel_id: &ChannelId, call_id: CallId) -> bool {
        &self.channel_id == channel_id && self.call_id.map_or(true, |c| c == call_id)
    }
}

#[derive(Debug, Clone)]
struct Route {
    serial: u64,
    channel_id: ChannelId,
    call_id: CallId,
}

struct Inner<T: SignalingTransport> {
    local_user: UserId,
    config: GroupCallConfig,
    signaling: Arc<SignalingHandler<T>>,
    media: Arc<MediaCapture>,
    screen: ScreenShareCoordinator,
    peers: Arc<dyn PeerConnectionFactory>,
    activity: LocalActivity,
    session: RwLock<Option<GroupSession>>,
    next_serial: AtomicU64,
    event_sender: broadcast::Sender<GroupCallEvent>,
}

/// Mesh group call manager
///
/// Holds at most one group session. Cheap to clone; clones share it.
pub struct GroupCallManager<T: SignalingTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: SignalingTransport> Clone for GroupCallManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: SignalingTransport> GroupCallManager<T> {
    /// Create a group call manager
    pub fn new(context: &CallContext<T>, config: GroupCallConfig) -> Self {
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
                session: RwLock::new(None),
                next_serial: AtomicU64::new(1),
                event_sender,
            }),
        }
    }

    /// Subscribe to group call events
    pub fn subscribe_events(&self) -> broadcast::Receiver<GroupCallEvent> {
        self.inner.event_sender.subscribe()
    }

    /// Session status, `None` when not in a group call
    pub fn status(&self) -> Option<GroupCallStatus> {
        self.inner.session.read().as_ref().map(|s| s.status)
    }

    /// Call identifier, once known
    pub fn call_id(&self) -> Option<CallId> {
        self.inner.session.read().as_ref().and_then(|s| s.call_id)
    }

    /// Channel of the session
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.inner.session.read().as_ref().map(|s| s.channel_id.clone())
    }

    /// Everyone in the call, including the local user
    pub fn participants(&self) -> Vec<ParticipantRecord> {
        let mut records: Vec<_> = self
            .inner
            .session
            .read()
            .as_ref()
            .map(|s| s.participants.values().cloned().collect())
            .unwrap_or_default();
        records.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        records
    }

    /// Number of participants, including the local user
    pub fn participant_count(&self) -> usize {
        self.inner
            .session
            .read()
            .as_ref()
            .map_or(0, |s| s.participants.len())
    }

    /// Link to one participant
    pub fn link(&self, user_id: &UserId) -> Option<Arc<PeerLink>> {
        self.inner
            .session
            .read()
            .as_ref()
            .and_then(|s| s.links.get(user_id).cloned())
    }

    /// Number of open links
    pub fn link_count(&self) -> usize {
        self.inner.session.read().as_ref().map_or(0, |s| s.links.len())
    }

    /// Check if the screen is being shared
    pub fn is_screen_sharing(&self) -> bool {
        self.inner.screen.is_sharing()
    }

    /// Start a group call in a channel
    ///
    /// The session becomes active when the relay confirms it.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyInCall` while in any call, `MediaUnavailable` if the
    /// devices cannot be opened (nothing is sent in that case)
    #[tracing::instrument(skip(self), fields(local = %self.inner.local_user, channel = %channel_id))]
    pub async fn start(&self, channel_id: ChannelId, media_kind: MediaKind) -> Result<(), CallError> {
        let serial = self
            .inner
            .open_session(channel_id.clone(), None, media_kind, GroupCallStatus::Starting)?;
        tracing::info!(?media_kind, "Starting group call");
        self.inner
            .acquire_and_send(serial, media_kind, SignalingMessage::GroupStart {
                channel_id,
                media_kind,
            })
            .await
    }

    /// Join the group call running in a channel
    ///
    /// Existing members offer to us once the relay has announced the join.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyInCall` while in any call, `MediaUnavailable` if the
    /// devices cannot be opened (nothing is sent in that case)
    #[tracing::instrument(skip(self), fields(local = %self.inner.local_user, channel = %channel_id))]
    pub async fn join(&self, channel_id: ChannelId, call_id: CallId, media_kind: MediaKind) -> Result<(), CallError> {
        let serial = self.inner.open_session(
            channel_id.clone(),
            Some(call_id),
            media_kind,
            GroupCallStatus::Joining,
        )?;
        tracing::info!(call_id = %call_id, ?media_kind, "Joining group call");
        self.inner
            .acquire_and_send(serial, media_kind, SignalingMessage::GroupJoin {
                channel_id,
                call_id,
                media_kind,
            })
            .await
    }

    /// Leave the group call. Local teardown happens even if the relay cannot
    /// be reached.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` when not in a group call
    #[tracing::instrument(skip(self))]
    pub async fn leave(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let (serial, channel_id, call_id, peers) = inner
            .session
            .read()
            .as_ref()
            .map(|s| {
                (
                    s.serial,
                    s.channel_id.clone(),
                    s.call_id,
                    s.participants
                        .keys()
                        .filter(|u| **u != inner.local_user)
                        .cloned()
                        .collect::<Vec<_>>(),
                )
            })
            .ok_or(CallError::NoActiveCall)?;

        tracing::info!(channel = %channel_id, "Leaving group call");
        if let Err(e) = inner
            .signaling
            .send_message(SignalingMessage::GroupLeave {
                channel_id,
                call_id,
            })
            .await
        {
            tracing::warn!(error = %e, "Leave not delivered, continuing local teardown");
        }
        for peer in peers {
            inner.drop_peer(serial, &peer, None).await;
        }
        inner.teardown(serial).await;
        Ok(())
    }

    /// The relay created our call
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` if no start is waiting for this channel
    pub fn on_started(
        &self,
        channel_id: ChannelId,
        call_id: CallId,
        participants: Vec<ParticipantInfo>,
    ) -> Result<(), CallError> {
        let mut guard = self.inner.session.write();
        let session = guard
            .as_mut()
            .filter(|s| s.channel_id == channel_id)
            .ok_or_else(|| stale("group.started", &channel_id))?;
        match session.status {
            GroupCallStatus::Active if session.call_id == Some(call_id) => {
                tracing::debug!(call_id = %call_id, "Duplicate start confirmation");
                return Ok(());
            }
            GroupCallStatus::Starting => {}
            _ => return Err(stale("group.started", &channel_id)),
        }
        session.call_id = Some(call_id);
        session.status = GroupCallStatus::Active;
        for info in participants {
            session
                .participants
                .entry(info.user_id.clone())
                .or_insert_with(|| info.into());
        }
        drop(guard);

        tracing::info!(channel = %channel_id, call_id = %call_id, old_state = ?GroupCallStatus::Starting, new_state = ?GroupCallStatus::Active, "Group call started");
        let _ = self.inner.event_sender.send(GroupCallEvent::Started {
            channel_id,
            call_id,
        });
        Ok(())
    }

    /// The relay admitted us. The roster is recorded; links come from the
    /// members' offers.
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` if no join is waiting for this channel,
    /// `MeshFull` if the call is already at the participant bound (we leave
    /// again in that case)
    #[tracing::instrument(skip(self, participants), fields(participants = participants.len()))]
    pub async fn on_joined(
        &self,
        channel_id: ChannelId,
        call_id: CallId,
        participants: Vec<ParticipantInfo>,
    ) -> Result<(), CallError> {
        let inner = &self.inner;
        let limit = inner.config.max_participants;
        let (serial, old) = {
            let guard = inner.session.read();
            let session = guard
                .as_ref()
                .filter(|s| s.matches(&channel_id, call_id))
                .ok_or_else(|| stale("group.joined", &channel_id))?;
            if session.status == GroupCallStatus::Active {
                tracing::debug!(call_id = %call_id, "Duplicate join confirmation");
                return Ok(());
            }
            (session.serial, session.status)
        };

        if participants.len() > limit {
            tracing::warn!(limit, participants = participants.len(), "Group call is full, leaving");
            let _ = inner.event_sender.send(GroupCallEvent::MeshFull {
                user_id: inner.local_user.clone(),
                limit,
            });
            if let Err(e) = inner
                .signaling
                .send_message(SignalingMessage::GroupLeave {
                    channel_id,
                    call_id: Some(call_id),
                })
                .await
            {
                tracing::warn!(error = %e, "Leave not delivered");
            }
            inner.teardown(serial).await;
            return Err(CallError::MeshFull { limit });
        }

        let roster: Vec<UserId> = participants.iter().map(|p| p.user_id.clone()).collect();
        {
            let mut guard = inner.session.write();
            let Some(session) = guard.as_mut().filter(|s| s.serial == serial) else {
                return Ok(());
            };
            session.call_id = Some(call_id);
            session.status = GroupCallStatus::Active;
            for info in participants {
                // members that offered before the roster arrived were
                // recorded anonymously
                match session.participants.get_mut(&info.user_id) {
                    Some(record) => {
                        record.display_name = info.display_name;
                        record.avatar = info.avatar;
                    }
                    None => {
                        session.participants.insert(info.user_id.clone(), info.into());
                    }
                }
            }
        }

        tracing::info!(channel = %channel_id, call_id = %call_id, old_state = ?old, new_state = ?GroupCallStatus::Active, "Joined group call");
        let _ = inner.event_sender.send(GroupCallEvent::Joined {
            channel_id,
            call_id,
            participants: roster,
        });
        Ok(())
    }

    /// Someone joined: open an offering link to them
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` for another call, `MeshFull` at the
    /// participant bound, `NegotiationFailed` if the offer cannot be made
    #[tracing::instrument(skip(self, peer), fields(peer = %peer.user_id))]
    pub async fn on_peer_joined(
        &self,
        channel_id: ChannelId,
        call_id: CallId,
        peer: ParticipantInfo,
    ) -> Result<(), CallError> {
        let inner = &self.inner;
        let route = inner.route(&channel_id, call_id, "group.peer-joined")?;
        let user_id = peer.user_id.clone();
        if user_id == inner.local_user {
            return Ok(());
        }

        let early = {
            let mut guard = inner.session.write();
            let Some(session) = guard.as_mut().filter(|s| s.serial == route.serial) else {
                return Err(stale("group.peer-joined", &channel_id));
            };
            if session.participants.contains_key(&user_id) {
                tracing::debug!("Participant already known");
                return Ok(());
            }
            if session.participants.len() >= inner.config.max_participants {
                drop(guard);
                return Err(inner.refuse(user_id));
            }
            session.departed.remove(&user_id);
            session.participants.insert(user_id.clone(), peer.clone().into());
            session.early_candidates.remove(&user_id).unwrap_or_default()
        };
        tracing::info!(channel = %channel_id, "Participant joined");
        let _ = inner
            .event_sender
            .send(GroupCallEvent::ParticipantJoined { participant: peer });

        let Some(link) = inner
            .open_link(&route, &user_id, NegotiationRole::Offerer, early)
            .await?
        else {
            return Ok(());
        };
        let offer = inner
            .negotiated(&route, &user_id, link.create_offer(false).await)
            .await?;
        inner
            .signaling
            .send_message(SignalingMessage::GroupOffer {
                peer_id: user_id,
                call_id: route.call_id,
                channel_id: route.channel_id,
                sdp: offer.sdp,
            })
            .await?;
        Ok(())
    }

    /// Apply a member's offer, creating an answering link if needed, and
    /// answer it
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` for another call, `MeshFull` for an unknown
    /// sender at the participant bound, `NegotiationFailed` if the offer is
    /// rejected (that link is dropped)
    #[tracing::instrument(skip(self, sdp), fields(from = %from))]
    pub async fn on_offer_received(
        &self,
        from: UserId,
        channel_id: ChannelId,
        call_id: CallId,
        sdp: String,
    ) -> Result<(), CallError> {
        let inner = &self.inner;
        let route = inner.route(&channel_id, call_id, "group.offer")?;

        enum Slot {
            Existing(Arc<PeerLink>),
            Open { announce: bool, early: Vec<IceCandidate> },
            Full,
        }
        let slot = {
            let mut guard = inner.session.write();
            let Some(session) = guard.as_mut().filter(|s| s.serial == route.serial) else {
                return Err(stale("group.offer", &channel_id));
            };
            if let Some(link) = session.links.get(&from) {
                Slot::Existing(link.clone())
            } else if session.departed.contains(&from) {
                return Err(departed("group.offer", &from));
            } else {
                let newcomer = !session.participants.contains_key(&from);
                if newcomer && session.participants.len() >= inner.config.max_participants {
                    Slot::Full
                } else {
                    if newcomer {
                        session.participants.insert(
                            from.clone(),
                            ParticipantInfo::anonymous(from.clone()).into(),
                        );
                    }
                    // while joining, an unknown sender is a member our roster
                    // has not listed yet
                    Slot::Open {
                        announce: newcomer && session.status == GroupCallStatus::Active,
                        early: session.early_candidates.remove(&from).unwrap_or_default(),
                    }
                }
            }
        };

        let link = match slot {
            Slot::Existing(link) => link,
            Slot::Full => return Err(inner.refuse(from)),
            Slot::Open { announce, early } => {
                if announce {
                    inner.emit(GroupCallEvent::ParticipantJoined {
                        participant: ParticipantInfo::anonymous(from.clone()),
                    });
                }
                match inner
                    .open_link(&route, &from, NegotiationRole::Answerer, early)
                    .await?
                {
                    Some(link) => link,
                    None => return Ok(()),
                }
            }
        };

        let answer = inner
            .negotiated(&route, &from, link.accept_offer(SessionDescription::offer(sdp)).await)
            .await?;
        inner
            .signaling
            .send_message(SignalingMessage::GroupAnswer {
                peer_id: from,
                call_id: route.call_id,
                channel_id: route.channel_id,
                sdp: answer.sdp,
            })
            .await?;
        Ok(())
    }

    /// Apply a member's answer. An answer for a peer without a link (it
    /// already left) is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` for another call, `NegotiationFailed` if the
    /// answer is rejected (that link is dropped)
    #[tracing::instrument(skip(self, sdp), fields(from = %from))]
    pub async fn on_answer_received(
        &self,
        from: UserId,
        channel_id: ChannelId,
        call_id: CallId,
        sdp: String,
    ) -> Result<(), CallError> {
        let inner = &self.inner;
        let route = inner.route(&channel_id, call_id, "group.answer")?;
        let Some(link) = inner.link_of(route.serial, &from) else {
            tracing::debug!("Answer for a peer without a link, ignoring");
            return Ok(());
        };
        inner
            .negotiated(&route, &from, link.accept_answer(SessionDescription::answer(sdp)).await)
            .await
    }

    /// Hand a member's candidate to its link, or hold it until the link
    /// exists
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` for another call
    pub async fn on_ice(
        &self,
        from: UserId,
        channel_id: ChannelId,
        call_id: CallId,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        let inner = &self.inner;
        let route = inner.route(&channel_id, call_id, "group.ice")?;
        let link = {
            let mut guard = inner.session.write();
            let Some(session) = guard.as_mut().filter(|s| s.serial == route.serial) else {
                return Err(stale("group.ice", &channel_id));
            };
            match session.links.get(&from) {
                Some(link) => link.clone(),
                None if session.departed.contains(&from) => {
                    return Err(departed("group.ice", &from));
                }
                None => {
                    tracing::trace!(from = %from, "Holding ICE candidate until the link exists");
                    session
                        .early_candidates
                        .entry(from)
                        .or_default()
                        .push(candidate);
                    return Ok(());
                }
            }
        };
        match link.add_remote_candidate(candidate).await {
            Ok(_) | Err(PeerError::Closed) => Ok(()),
            Err(e) => {
                tracing::warn!(from = %from, error = %e, "ICE candidate rejected");
                Ok(())
            }
        }
    }

    /// A member left: close our link to them. Repeated notices are harmless.
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` for another call
    pub async fn on_peer_left(&self, channel_id: ChannelId, call_id: CallId, user_id: UserId) -> Result<(), CallError> {
        let route = self.inner.route(&channel_id, call_id, "group.peer-left")?;
        self.inner.drop_peer(route.serial, &user_id, None).await;
        Ok(())
    }

    /// The call is over for everyone
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` for another call
    pub async fn on_call_ended(&self, channel_id: ChannelId, call_id: CallId) -> Result<(), CallError> {
        let serial = self
            .inner
            .session
            .read()
            .as_ref()
            .filter(|s| s.matches(&channel_id, call_id))
            .map(|s| s.serial)
            .ok_or_else(|| stale("group.ended", &channel_id))?;
        tracing::info!(channel = %channel_id, call_id = %call_id, "Group call ended");
        self.inner.teardown(serial).await;
        Ok(())
    }

    /// Our start lost a race with another member's: join their call instead
    ///
    /// # Errors
    ///
    /// Returns `SignalingRace` if no start is waiting for this channel
    pub async fn on_already_active(&self, channel_id: ChannelId, call_id: CallId) -> Result<(), CallError> {
        let inner = &self.inner;
        let media_kind = {
            let mut guard = inner.session.write();
            let session = guard
                .as_mut()
                .filter(|s| s.channel_id == channel_id && s.status == GroupCallStatus::Starting)
                .ok_or_else(|| stale("group.already-active", &channel_id))?;
            session.status = GroupCallStatus::Joining;
            session.call_id = Some(call_id);
            session.media_kind
        };
        tracing::info!(channel = %channel_id, call_id = %call_id, old_state = ?GroupCallStatus::Starting, new_state = ?GroupCallStatus::Joining, "Call already running, joining it");
        inner
            .signaling
            .send_message(SignalingMessage::GroupJoin {
                channel_id,
                call_id,
                media_kind,
            })
            .await?;
        Ok(())
    }

    /// Mute or unmute the microphone on every link. Returns the new muted
    /// state.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` when no local media is live
    pub fn toggle_mute(&self) -> Result<bool, CallError> {
        self.inner.require_session()?;
        let muted = self.inner.media.toggle_mute().ok_or(CallError::NoActiveCall)?;
        let _ = self.inner.event_sender.send(GroupCallEvent::MuteChanged { muted });
        Ok(muted)
    }

    /// Turn the outgoing video on or off. Returns the new enabled state.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` without a session, `MediaUnavailable` when the
    /// call sends no video
    pub fn toggle_video(&self) -> Result<bool, CallError> {
        self.inner.require_session()?;
        let enabled = self.inner.media.toggle_video().ok_or_else(|| {
            CallError::MediaUnavailable(MediaError::DeviceNotFound("camera".to_string()))
        })?;
        let _ = self.inner.event_sender.send(GroupCallEvent::VideoChanged { enabled });
        Ok(enabled)
    }

    /// Share the screen with every participant
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` when not in an active group call,
    /// `MediaUnavailable` if the screen cannot be captured
    #[tracing::instrument(skip(self))]
    pub async fn start_screen_share(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let (route, links) = inner.active_links()?;
        let change = inner.screen.start(&links).await?;
        if change.changed {
            let _ = inner
                .event_sender
                .send(GroupCallEvent::ScreenShareChanged { active: true });
        }
        inner.renegotiate(&route, change.renegotiate).await
    }

    /// Stop sharing and put the camera back. Does nothing when not sharing.
    ///
    /// # Errors
    ///
    /// Returns error if a renegotiation offer cannot be sent
    #[tracing::instrument(skip(self))]
    pub async fn stop_screen_share(&self) -> Result<(), CallError> {
        let inner = &self.inner;
        let (route, links) = match inner.active_links() {
            Ok((route, links)) => (Some(route), links),
            Err(_) => (None, Vec::new()),
        };
        let change = inner.screen.stop(&links).await;
        if change.changed {
            let _ = inner
                .event_sender
                .send(GroupCallEvent::ScreenShareChanged { active: false });
        }
        match route {
            Some(route) => inner.renegotiate(&route, change.renegotiate).await,
            None => Ok(()),
        }
    }
}

fn departed(what: &str, peer: &UserId) -> CallError {
    CallError::SignalingRace(format!("{what} from {peer}, who already left"))
}

fn stale(what: &str, channel_id: &ChannelId) -> CallError {
    CallError::SignalingRace(format!("{what} for channel {channel_id} without a matching session"))
}

impl<T: SignalingTransport> Inner<T> {
    fn emit(&self, event: GroupCallEvent) {
        let _ = self.event_sender.send(event);
    }

    fn require_session(&self) -> Result<u64, CallError> {
        self.session
            .read()
            .as_ref()
            .map(|s| s.serial)
            .ok_or(CallError::NoActiveCall)
    }

    fn open_session(
        &self,
        channel_id: ChannelId,
        call_id: Option<CallId>,
        media_kind: MediaKind,
        status: GroupCallStatus,
    ) -> Result<u64, CallError> {
        if !self.activity.try_claim(Activity::Group(channel_id.clone())) {
            tracing::warn!("Refusing group call: already in a call");
            return Err(CallError::AlreadyInCall);
        }
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let mut participants = HashMap::new();
        participants.insert(
            self.local_user.clone(),
            ParticipantInfo::anonymous(self.local_user.clone()).into(),
        );
        *self.session.write() = Some(GroupSession {
            serial,
            channel_id,
            call_id,
            media_kind,
            status,
            participants,
            links: HashMap::new(),
            early_candidates: HashMap::new(),
            departed: HashSet::new(),
        });
        Ok(serial)
    }

    async fn acquire_and_send(&self, serial: u64, media_kind: MediaKind, message: SignalingMessage) -> Result<(), CallError> {
        let stream = match self.media.acquire(media_kind).await {
            Ok(stream) => stream,
            Err(e) => {
                self.teardown(serial).await;
                return Err(e.into());
            }
        };
        if !self.adopt_for(serial, stream) {
            return Ok(());
        }
        if let Err(e) = self.signaling.send_message(message).await {
            self.teardown(serial).await;
            return Err(e.into());
        }
        Ok(())
    }

    fn adopt_for(&self, serial: u64, stream: MediaStream) -> bool {
        let guard = self.session.read();
        if guard.as_ref().map(|s| s.serial) != Some(serial) {
            tracing::debug!("Group session ended during media acquisition, dropping stream");
            for track in stream.tracks() {
                track.stop();
            }
            return false;
        }
        self.media.adopt(stream);
        true
    }

    fn route(&self, channel_id: &ChannelId, call_id: CallId, what: &str) -> Result<Route, CallError> {
        self.session
            .read()
            .as_ref()
            .filter(|s| {
                s.status != GroupCallStatus::Starting
                    && &s.channel_id == channel_id
                    && s.call_id == Some(call_id)
            })
            .map(|s| Route {
                serial: s.serial,
                channel_id: s.channel_id.clone(),
                call_id,
            })
            .ok_or_else(|| stale(what, channel_id))
    }

    fn link_of(&self, serial: u64, peer: &UserId) -> Option<Arc<PeerLink>> {
        self.session
            .read()
            .as_ref()
            .filter(|s| s.serial == serial)
            .and_then(|s| s.links.get(peer).cloned())
    }

    fn active_links(&self) -> Result<(Route, Vec<Arc<PeerLink>>), CallError> {
        let guard = self.session.read();
        let session = guard
            .as_ref()
            .filter(|s| s.status == GroupCallStatus::Active)
            .ok_or(CallError::NoActiveCall)?;
        let call_id = session.call_id.ok_or(CallError::NoActiveCall)?;
        Ok((
            Route {
                serial: session.serial,
                channel_id: session.channel_id.clone(),
                call_id,
            },
            session.links.values().cloned().collect(),
        ))
    }

    fn refuse(&self, user_id: UserId) -> CallError {
        let limit = self.config.max_participants;
        tracing::warn!(peer = %user_id, limit, "Mesh is full, not linking peer");
        self.emit(GroupCallEvent::MeshFull { user_id, limit });
        CallError::MeshFull { limit }
    }

    /// Create a link to `peer`, attach local media and start its event pump.
    /// `None` when the session or participant went away meanwhile. If a link
    /// to the peer appeared concurrently, that one is returned and ours is
    /// closed.
    async fn open_link(
        self: &Arc<Self>,
        route: &Route,
        peer: &UserId,
        role: NegotiationRole,
        early: Vec<IceCandidate>,
    ) -> Result<Option<Arc<PeerLink>>, CallError> {
        let (link, events) = PeerLink::open(&*self.peers, peer.clone(), role, early)
            .await
            .map_err(|e| CallError::NegotiationFailed(e.to_string()))?;
        if let Err(e) = link.attach_tracks(&self.media.local_tracks()).await {
            link.close().await;
            return Err(CallError::NegotiationFailed(e.to_string()));
        }

        enum Install {
            Installed,
            Existing(Arc<PeerLink>),
            Gone,
        }
        let outcome = {
            let mut guard = self.session.write();
            match guard.as_mut().filter(|s| s.serial == route.serial) {
                Some(session) if session.participants.contains_key(peer) => {
                    match session.links.get(peer) {
                        Some(existing) => Install::Existing(existing.clone()),
                        None => {
                            session.links.insert(peer.clone(), link.clone());
                            Install::Installed
                        }
                    }
                }
                _ => Install::Gone,
            }
        };

        match outcome {
            Install::Installed => {
                tracing::debug!(peer = %peer, ?role, "Mesh link opened");
                self.spawn_pump(route.clone(), peer.clone(), link.serial(), events);
                Ok(Some(link))
            }
            Install::Existing(existing) => {
                link.close().await;
                Ok(Some(existing))
            }
            Install::Gone => {
                tracing::debug!(peer = %peer, "Peer or session gone while its link was created");
                link.close().await;
                Ok(None)
            }
        }
    }

    fn spawn_pump(self: &Arc<Self>, route: Route, peer: UserId, link_serial: u64, mut events: PeerEvents) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if !inner.handle_peer_event(&route, &peer, link_serial, event).await {
                    break;
                }
            }
        });
    }

    async fn handle_peer_event(&self, route: &Route, peer: &UserId, link_serial: u64, event: PeerEvent) -> bool {
        let Some(link) = self
            .link_of(route.serial, peer)
            .filter(|l| l.serial() == link_serial)
        else {
            return false;
        };
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                tracing::trace!(peer = %peer, "Sending local ICE candidate");
                if let Err(e) = self
                    .signaling
                    .send_message(SignalingMessage::GroupIce {
                        peer_id: peer.clone(),
                        call_id: route.call_id,
                        channel_id: route.channel_id.clone(),
                        candidate,
                    })
                    .await
                {
                    tracing::warn!(peer = %peer, error = %e, "ICE candidate not delivered");
                }
            }
            PeerEvent::RemoteTrack { stream_id, track } => {
                if let Some(stream) = link.record_remote_track(&stream_id, track) {
                    if let Some(session) = self
                        .session
                        .write()
                        .as_mut()
                        .filter(|s| s.serial == route.serial)
                    {
                        if let Some(record) = session.participants.get_mut(peer) {
                            record.remote_stream = Some(stream.clone());
                        }
                    }
                    self.emit(GroupCallEvent::RemoteStream {
                        user_id: peer.clone(),
                        stream,
                    });
                }
            }
            PeerEvent::ConnectionState(state) => {
                self.emit(GroupCallEvent::LinkStateChanged {
                    user_id: peer.clone(),
                    state,
                });
                match link.record_connection_state(state, self.config.ice_restart_attempts) {
                    ConnectivityVerdict::RestartIce => {
                        tracing::info!(peer = %peer, "Mesh link lost, restarting ICE");
                        match link.create_offer(true).await {
                            Ok(offer) => {
                                if let Err(e) = self
                                    .signaling
                                    .send_message(SignalingMessage::GroupOffer {
                                        peer_id: peer.clone(),
                                        call_id: route.call_id,
                                        channel_id: route.channel_id.clone(),
                                        sdp: offer.sdp,
                                    })
                                    .await
                                {
                                    tracing::warn!(peer = %peer, error = %e, "ICE restart offer not delivered");
                                }
                            }
                            Err(PeerError::Closed) => {}
                            Err(e) => {
                                tracing::error!(peer = %peer, error = %e, "ICE restart offer failed");
                                self.drop_peer(route.serial, peer, Some(link_serial)).await;
                            }
                        }
                    }
                    ConnectivityVerdict::AwaitRestart => {
                        tracing::info!(peer = %peer, "Mesh link lost, waiting for the peer to restart ICE");
                    }
                    ConnectivityVerdict::GiveUp => {
                        tracing::error!(peer = %peer, "Mesh link failed after ICE restart, dropping peer");
                        self.drop_peer(route.serial, peer, Some(link_serial)).await;
                    }
                    ConnectivityVerdict::Established | ConnectivityVerdict::Healthy => {}
                }
            }
        }
        true
    }

    async fn renegotiate(&self, route: &Route, links: Vec<Arc<PeerLink>>) -> Result<(), CallError> {
        for link in links {
            let peer = link.peer_id().clone();
            let offer = self
                .negotiated(route, &peer, link.create_offer(false).await)
                .await?;
            self.signaling
                .send_message(SignalingMessage::GroupOffer {
                    peer_id: peer,
                    call_id: route.call_id,
                    channel_id: route.channel_id.clone(),
                    sdp: offer.sdp,
                })
                .await?;
        }
        Ok(())
    }

    /// Map a link result: a closed link means the peer is already gone, any
    /// other failure drops that peer's link. Other links are unaffected.
    async fn negotiated<V>(&self, route: &Route, peer: &UserId, result: Result<V, PeerError>) -> Result<V, CallError> {
        match result {
            Ok(v) => Ok(v),
            Err(PeerError::Closed) => Err(CallError::SignalingRace(format!("link to {peer} closed"))),
            Err(e) => {
                tracing::error!(peer = %peer, error = %e, "Mesh negotiation failed, dropping peer");
                self.drop_peer(route.serial, peer, None).await;
                Err(CallError::NegotiationFailed(e.to_string()))
            }
        }
    }

    /// Remove a participant and close its link. With `link_serial`, only if
    /// that exact link is still the current one.
    async fn drop_peer(&self, serial: u64, peer: &UserId, link_serial: Option<u64>) {
        let (record, link) = {
            let mut guard = self.session.write();
            let Some(session) = guard.as_mut().filter(|s| s.serial == serial) else {
                return;
            };
            if let Some(wanted) = link_serial {
                if session.links.get(peer).map(|l| l.serial()) != Some(wanted) {
                    return;
                }
            }
            session.early_candidates.remove(peer);
            session.departed.insert(peer.clone());
            (session.participants.remove(peer), session.links.remove(peer))
        };
        if let Some(link) = link {
            link.close().await;
        }
        if record.is_some() {
            tracing::info!(peer = %peer, "Participant left");
            self.emit(GroupCallEvent::ParticipantLeft {
                user_id: peer.clone(),
            });
        }
    }

    /// Close every link, release local media and free the call slot
    async fn teardown(&self, serial: u64) {
        let taken = {
            let mut guard = self.session.write();
            if guard.as_ref().map(|s| s.serial) == Some(serial) {
                guard.take()
            } else {
                None
            }
        };
        let Some(session) = taken else {
            return;
        };

        futures::future::join_all(session.links.values().map(|link| link.close())).await;
        self.screen.reset();
        self.media.release();
        self.activity
            .release(&Activity::Group(session.channel_id.clone()));

        tracing::info!(
            channel = %session.channel_id,
            old_state = ?session.status,
            links = session.links.len(),
            "Group session torn down"
        );
        self.emit(GroupCallEvent::Ended {
            channel_id: session.channel_id,
            call_id: session.call_id,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::loopback::{FakeMediaDevices, LoopbackPeerFactory, LoopbackRelay, LoopbackTransport};

    struct Member {
        manager: GroupCallManager<LoopbackTransport>,
        devices: Arc<FakeMediaDevices>,
        activity: LocalActivity,
        peers: LoopbackPeerFactory,
    }

    fn member(relay: &LoopbackRelay, name: &str, config: GroupCallConfig) -> Member {
        let transport = relay.connect(ParticipantInfo::anonymous(UserId::new(name)));
        let devices = Arc::new(FakeMediaDevices::new());
        let peers = LoopbackPeerFactory::new(UserId::new(name));
        let activity = LocalActivity::new();
        let context = CallContext {
            local_user: UserId::new(name),
            signaling: Arc::new(SignalingHandler::new(Arc::new(transport))),
            media: Arc::new(MediaCapture::new(devices.clone())),
            screen_capture: devices.clone(),
            peers: Arc::new(peers.clone()),
            activity: activity.clone(),
        };
        Member {
            manager: GroupCallManager::new(&context, config),
            devices,
            activity,
            peers,
        }
    }

    fn info(name: &str) -> ParticipantInfo {
        ParticipantInfo::anonymous(UserId::new(name))
    }

    #[tokio::test]
    async fn test_start_waits_for_confirmation() {
        let relay = LoopbackRelay::new();
        let a = member(&relay, "alice", GroupCallConfig::default());
        let channel = ChannelId::new("eng");

        a.manager.start(channel.clone(), MediaKind::Voice).await.unwrap();
        assert_eq!(a.manager.status(), Some(GroupCallStatus::Starting));
        assert!(a.activity.is_busy());

        let call_id = CallId::new();
        a.manager.on_started(channel.clone(), call_id, vec![info("alice")]).unwrap();
        assert_eq!(a.manager.status(), Some(GroupCallStatus::Active));
        a.manager.on_started(channel, call_id, vec![info("alice")]).unwrap();
        assert_eq!(a.manager.participant_count(), 1);
    }

    #[tokio::test]
    async fn test_start_media_failure_sends_nothing() {
        let relay = LoopbackRelay::new();
        let a = member(&relay, "alice", GroupCallConfig::default());
        a.devices.fail_next_user_media(MediaError::PermissionDenied("microphone".into()));

        let res = a.manager.start(ChannelId::new("eng"), MediaKind::Voice).await;
        assert!(matches!(res, Err(CallError::MediaUnavailable(_))));
        assert!(relay.sent_by(&UserId::new("alice")).is_empty());
        assert!(a.manager.status().is_none());
        assert!(!a.activity.is_busy());
    }

    #[tokio::test]
    async fn test_second_session_already_in_call() {
        let relay = LoopbackRelay::new();
        let a = member(&relay, "alice", GroupCallConfig::default());
        a.manager.start(ChannelId::new("eng"), MediaKind::Voice).await.unwrap();
        let res = a.manager.join(ChannelId::new("ops"), CallId::new(), MediaKind::Voice).await;
        assert_eq!(res, Err(CallError::AlreadyInCall));
    }

    #[tokio::test]
    async fn test_join_seeds_roster_without_links() {
        let relay = LoopbackRelay::new();
        let c = member(&relay, "carol", GroupCallConfig::default());
        let channel = ChannelId::new("eng");
        let call_id = CallId::new();

        c.manager.join(channel.clone(), call_id, MediaKind::Voice).await.unwrap();
        c.manager
            .on_joined(channel, call_id, vec![info("alice"), info("bob"), info("carol")])
            .await
            .unwrap();
        assert_eq!(c.manager.participant_count(), 3);
        assert_eq!(c.manager.link_count(), 0);
        assert_eq!(c.peers.connections_created(), 0);
    }

    #[tokio::test]
    async fn test_join_full_mesh_leaves() {
        let relay = LoopbackRelay::new();
        let config = GroupCallConfig {
            max_participants: 2,
            ..GroupCallConfig::default()
        };
        let c = member(&relay, "carol", config);
        let channel = ChannelId::new("eng");
        let call_id = CallId::new();

        c.manager.join(channel.clone(), call_id, MediaKind::Voice).await.unwrap();
        let res = c
            .manager
            .on_joined(channel, call_id, vec![info("alice"), info("bob"), info("carol")])
            .await;
        assert_eq!(res, Err(CallError::MeshFull { limit: 2 }));
        assert!(c.manager.status().is_none());
        assert!(!c.activity.is_busy());
        assert_eq!(c.devices.live_tracks(), 0);
        assert!(relay
            .sent_by(&UserId::new("carol"))
            .iter()
            .any(|m| matches!(m, SignalingMessage::GroupLeave { .. })));
    }

    #[tokio::test]
    async fn test_peer_joined_offers_once() {
        let relay = LoopbackRelay::new();
        let a = member(&relay, "alice", GroupCallConfig::default());
        let channel = ChannelId::new("eng");
        let call_id = CallId::new();
        a.manager.start(channel.clone(), MediaKind::Voice).await.unwrap();
        a.manager.on_started(channel.clone(), call_id, vec![info("alice")]).unwrap();

        a.manager.on_peer_joined(channel.clone(), call_id, info("bob")).await.unwrap();
        a.manager.on_peer_joined(channel, call_id, info("bob")).await.unwrap();

        assert_eq!(a.manager.link_count(), 1);
        assert_eq!(a.peers.connections_created(), 1);
        let offers = relay
            .sent_by(&UserId::new("alice"))
            .into_iter()
            .filter(|m| matches!(m, SignalingMessage::GroupOffer { .. }))
            .count();
        assert_eq!(offers, 1);
        assert_eq!(
            a.manager.link(&UserId::new("bob")).unwrap().role(),
            NegotiationRole::Offerer
        );
    }

    #[tokio::test]
    async fn test_mesh_bound_refuses_peer() {
        let relay = LoopbackRelay::new();
        let config = GroupCallConfig {
            max_participants: 2,
            ..GroupCallConfig::default()
        };
        let a = member(&relay, "alice", config);
        let mut events = a.manager.subscribe_events();
        let channel = ChannelId::new("eng");
        let call_id = CallId::new();
        a.manager.start(channel.clone(), MediaKind::Voice).await.unwrap();
        a.manager.on_started(channel.clone(), call_id, vec![info("alice")]).unwrap();
        a.manager.on_peer_joined(channel.clone(), call_id, info("bob")).await.unwrap();

        let res = a.manager.on_peer_joined(channel, call_id, info("carol")).await;
        assert_eq!(res, Err(CallError::MeshFull { limit: 2 }));
        assert_eq!(a.manager.link_count(), 1);
        assert!(a.manager.link(&UserId::new("carol")).is_none());

        let mut saw_full = false;
        while let Ok(event) = events.try_recv() {
            if let GroupCallEvent::MeshFull { user_id, limit } = event {
                assert_eq!(user_id, UserId::new("carol"));
                assert_eq!(limit, 2);
                saw_full = true;
            }
        }
        assert!(saw_full);
    }

    #[tokio::test]
    async fn test_late_answer_ignored() {
        let relay = LoopbackRelay::new();
        let a = member(&relay, "alice", GroupCallConfig::default());
        let channel = ChannelId::new("eng");
        let call_id = CallId::new();
        a.manager.start(channel.clone(), MediaKind::Voice).await.unwrap();
        a.manager.on_started(channel.clone(), call_id, vec![info("alice")]).unwrap();

        a.manager
            .on_answer_received(UserId::new("ghost"), channel, call_id, "v=0".into())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_early_candidates_reach_link() {
        let relay = LoopbackRelay::new();
        let c = member(&relay, "carol", GroupCallConfig::default());
        let channel = ChannelId::new("eng");
        let call_id = CallId::new();
        c.manager.join(channel.clone(), call_id, MediaKind::Voice).await.unwrap();
        c.manager
            .on_joined(channel.clone(), call_id, vec![info("alice"), info("carol")])
            .await
            .unwrap();

        c.manager
            .on_ice(UserId::new("alice"), channel.clone(), call_id, IceCandidate::new("candidate:1"))
            .await
            .unwrap();
        assert_eq!(c.manager.link_count(), 0);

        let offer = crate::loopback::describe(&[], "alice", 0);
        c.manager
            .on_offer_received(UserId::new("alice"), channel, call_id, offer)
            .await
            .unwrap();
        let link = c.manager.link(&UserId::new("alice")).unwrap();
        assert_eq!(link.role(), NegotiationRole::Answerer);
        assert_eq!(link.pending_candidates(), 0);
    }

    #[tokio::test]
    async fn test_offer_before_join_confirmation_links() {
        let relay = LoopbackRelay::new();
        let c = member(&relay, "carol", GroupCallConfig::default());
        let channel = ChannelId::new("eng");
        let call_id = CallId::new();
        c.manager.join(channel.clone(), call_id, MediaKind::Voice).await.unwrap();
        assert_eq!(c.manager.status(), Some(GroupCallStatus::Joining));

        // alice's offer overtakes the relay's confirmation
        c.manager
            .on_ice(UserId::new("alice"), channel.clone(), call_id, IceCandidate::new("candidate:1"))
            .await
            .unwrap();
        let offer = crate::loopback::describe(&[], "alice", 0);
        c.manager
            .on_offer_received(UserId::new("alice"), channel.clone(), call_id, offer)
            .await
            .unwrap();
        let link = c.manager.link(&UserId::new("alice")).unwrap();
        assert_eq!(link.role(), NegotiationRole::Answerer);
        assert_eq!(link.pending_candidates(), 0);
        assert!(relay
            .sent_by(&UserId::new("carol"))
            .iter()
            .any(|m| matches!(m, SignalingMessage::GroupAnswer { .. })));

        c.manager
            .on_joined(
                channel,
                call_id,
                vec![
                    ParticipantInfo::new(UserId::new("alice"), "Alice"),
                    info("bob"),
                    info("carol"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(c.manager.status(), Some(GroupCallStatus::Active));
        assert_eq!(c.manager.participant_count(), 3);
        assert!(Arc::ptr_eq(&c.manager.link(&UserId::new("alice")).unwrap(), &link));
        let alice = c
            .manager
            .participants()
            .into_iter()
            .find(|p| p.user_id == UserId::new("alice"))
            .unwrap();
        assert_eq!(alice.display_name, "Alice");
    }

    #[tokio::test]
    async fn test_signals_from_departed_peer_are_stale() {
        let relay = LoopbackRelay::new();
        let a = member(&relay, "alice", GroupCallConfig::default());
        let channel = ChannelId::new("eng");
        let call_id = CallId::new();
        let bob = UserId::new("bob");
        a.manager.start(channel.clone(), MediaKind::Voice).await.unwrap();
        a.manager.on_started(channel.clone(), call_id, vec![info("alice")]).unwrap();
        a.manager.on_peer_joined(channel.clone(), call_id, info("bob")).await.unwrap();
        a.manager.on_peer_left(channel.clone(), call_id, bob.clone()).await.unwrap();

        let offer = crate::loopback::describe(&[], "bob", 0);
        let res = a
            .manager
            .on_offer_received(bob.clone(), channel.clone(), call_id, offer)
            .await;
        assert!(matches!(res, Err(CallError::SignalingRace(_))));
        let res = a
            .manager
            .on_ice(bob.clone(), channel.clone(), call_id, IceCandidate::new("candidate:1"))
            .await;
        assert!(matches!(res, Err(CallError::SignalingRace(_))));
        assert_eq!(a.manager.participant_count(), 1);
        assert_eq!(a.manager.link_count(), 0);
        assert_eq!(a.peers.open_connections(), 0);

        // announced again, bob is linked as usual
        a.manager.on_peer_joined(channel, call_id, info("bob")).await.unwrap();
        assert_eq!(a.manager.participant_count(), 2);
        assert!(a.manager.link(&bob).is_some());
    }

    #[tokio::test]
    async fn test_peer_left_is_idempotent() {
        let relay = LoopbackRelay::new();
        let a = member(&relay, "alice", GroupCallConfig::default());
        let channel = ChannelId::new("eng");
        let call_id = CallId::new();
        a.manager.start(channel.clone(), MediaKind::Voice).await.unwrap();
        a.manager.on_started(channel.clone(), call_id, vec![info("alice")]).unwrap();
        a.manager.on_peer_joined(channel.clone(), call_id, info("bob")).await.unwrap();
        let link = a.manager.link(&UserId::new("bob")).unwrap();

        a.manager.on_peer_left(channel.clone(), call_id, UserId::new("bob")).await.unwrap();
        a.manager.on_peer_left(channel, call_id, UserId::new("bob")).await.unwrap();
        assert!(link.is_closed());
        assert_eq!(a.manager.participant_count(), 1);
        assert_eq!(a.peers.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_leave_is_total() {
        let relay = LoopbackRelay::new();
        let a = member(&relay, "alice", GroupCallConfig::default());
        let channel = ChannelId::new("eng");
        let call_id = CallId::new();
        a.manager.start(channel.clone(), MediaKind::Video).await.unwrap();
        a.manager.on_started(channel.clone(), call_id, vec![info("alice")]).unwrap();
        a.manager.on_peer_joined(channel.clone(), call_id, info("bob")).await.unwrap();
        a.manager.on_peer_joined(channel, call_id, info("carol")).await.unwrap();

        relay.disconnect(&UserId::new("alice"));
        a.manager.leave().await.unwrap();
        assert!(a.manager.status().is_none());
        assert_eq!(a.peers.open_connections(), 0);
        assert_eq!(a.devices.live_tracks(), 0);
        assert!(!a.activity.is_busy());
        assert_eq!(a.manager.leave().await, Err(CallError::NoActiveCall));
    }

    #[tokio::test]
    async fn test_already_active_switches_to_join() {
        let relay = LoopbackRelay::new();
        let a = member(&relay, "alice", GroupCallConfig::default());
        let channel = ChannelId::new("eng");
        let call_id = CallId::new();
        a.manager.start(channel.clone(), MediaKind::Voice).await.unwrap();

        a.manager.on_already_active(channel.clone(), call_id).await.unwrap();
        assert_eq!(a.manager.status(), Some(GroupCallStatus::Joining));
        assert_eq!(a.manager.call_id(), Some(call_id));
        assert!(relay.sent_by(&UserId::new("alice")).contains(&SignalingMessage::GroupJoin {
            channel_id: channel,
            call_id,
            media_kind: MediaKind::Voice,
        }));
    }

    #[tokio::test]
    async fn test_signals_for_other_channel_are_stale() {
        let relay = LoopbackRelay::new();
        let a = member(&relay, "alice", GroupCallConfig::default());
        let res = a
            .manager
            .on_peer_left(ChannelId::new("eng"), CallId::new(), UserId::new("bob"))
            .await;
        assert!(matches!(res, Err(CallError::SignalingRace(_))));
    }
}
