//! Simulated peer connections
//!
//! A loopback connection does not move media. It follows the offer/answer
//! and candidate rules of a real connection closely enough to exercise the
//! orchestration code: session descriptions are plain text listing the
//! sender's tracks, a local candidate is gathered every time a local
//! description is applied, remote candidates are refused until a remote
//! description exists, and the link reports remote tracks and `Connected`
//! once both descriptions are applied and a remote candidate has arrived.

use crate::identity::UserId;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventSender, SenderId};
use crate::types::{ConnectionState, IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Session description text for a party owning the given senders
pub fn describe(senders: &[(u64, TrackKind)], owner: &str, generation: u32) -> String {
    let mut sdp = format!(
        "v=0\r\no=meshcall {owner} {generation} IN IP4 127.0.0.1\r\ns=-\r\na=ice-generation:{generation}\r\na=msid-stream:{owner}\r\n"
    );
    for (id, kind) in senders {
        let kind = match kind {
            TrackKind::Audio => "audio",
            TrackKind::Video => "video",
        };
        sdp.push_str(&format!("a=track:{kind} {owner}-{id}\r\n"));
    }
    sdp
}

#[derive(Debug, Clone)]
struct ParsedSdp {
    stream_id: String,
    generation: u32,
    tracks: Vec<RemoteTrack>,
}

fn parse(sdp: &str) -> Result<ParsedSdp, PeerError> {
    if !sdp.starts_with("v=0") {
        return Err(PeerError::Sdp("missing version line".to_string()));
    }
    let mut parsed = ParsedSdp {
        stream_id: String::new(),
        generation: 0,
        tracks: Vec::new(),
    };
    for line in sdp.lines() {
        if let Some(rest) = line.strip_prefix("a=ice-generation:") {
            parsed.generation = rest
                .trim()
                .parse()
                .map_err(|_| PeerError::Sdp(format!("bad ice generation: {rest}")))?;
        } else if let Some(rest) = line.strip_prefix("a=msid-stream:") {
            parsed.stream_id = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("a=track:") {
            let (kind, id) = rest
                .trim()
                .split_once(' ')
                .ok_or_else(|| PeerError::Sdp(format!("bad track line: {rest}")))?;
            let kind = match kind {
                "audio" => TrackKind::Audio,
                "video" => TrackKind::Video,
                other => return Err(PeerError::Sdp(format!("unknown track kind: {other}"))),
            };
            parsed.tracks.push(RemoteTrack {
                id: id.to_string(),
                kind,
            });
        }
    }
    if parsed.stream_id.is_empty() {
        return Err(PeerError::Sdp("missing stream".to_string()));
    }
    Ok(parsed)
}

#[derive(Debug, Default)]
struct Switchboard {
    failures: Mutex<HashMap<UserId, u32>>,
    created: AtomicUsize,
    closed: AtomicUsize,
}

impl Switchboard {
    fn take_failure(&self, remote: &UserId) -> bool {
        let mut failures = self.failures.lock();
        match failures.get_mut(remote) {
            Some(n) if *n > 0 => {
                *n -= 1;
                true
            }
            _ => false,
        }
    }
}

/// Creates loopback connections for one local user
#[derive(Debug, Clone)]
pub struct LoopbackPeerFactory {
    local: UserId,
    board: Arc<Switchboard>,
}

impl LoopbackPeerFactory {
    /// Factory for `local`
    pub fn new(local: UserId) -> Self {
        Self {
            local,
            board: Arc::new(Switchboard::default()),
        }
    }

    /// Make the next `times` connectivity checks towards `remote` fail
    pub fn fail_connectivity(&self, remote: &UserId, times: u32) {
        self.board.failures.lock().insert(remote.clone(), times);
    }

    /// Connections created so far
    pub fn connections_created(&self) -> usize {
        self.board.created.load(Ordering::SeqCst)
    }

    /// Connections created and not yet closed
    pub fn open_connections(&self) -> usize {
        self.connections_created() - self.board.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnectionFactory for LoopbackPeerFactory {
    async fn create(
        &self,
        remote: &UserId,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        self.board.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackPeerConnection {
            local: self.local.clone(),
            remote: remote.clone(),
            board: self.board.clone(),
            state: Mutex::new(ConnState {
                events: Some(events),
                senders: BTreeMap::new(),
                next_sender: 1,
                generation: 0,
                local_generation: None,
                remote: None,
                remote_kind: None,
                candidates_applied: 0,
                candidates_gathered: 0,
                connection: ConnectionState::New,
                announced: HashSet::new(),
                closed: false,
            }),
        }))
    }
}

#[derive(Debug)]
struct ConnState {
    events: Option<PeerEventSender>,
    senders: BTreeMap<u64, (TrackKind, Option<LocalTrack>)>,
    next_sender: u64,
    generation: u32,
    local_generation: Option<u32>,
    remote: Option<ParsedSdp>,
    remote_kind: Option<SdpKind>,
    candidates_applied: usize,
    candidates_gathered: u32,
    connection: ConnectionState,
    announced: HashSet<String>,
    closed: bool,
}

impl ConnState {
    fn emit(&self, event: PeerEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    fn set_connection(&mut self, state: ConnectionState) {
        if self.connection != state {
            self.connection = state;
            self.emit(PeerEvent::ConnectionState(state));
        }
    }

    fn restart_ice(&mut self) {
        self.candidates_applied = 0;
        self.set_connection(ConnectionState::Connecting);
    }

    fn sender_list(&self) -> Vec<(u64, TrackKind)> {
        self.senders.iter().map(|(id, (kind, _))| (*id, *kind)).collect()
    }

    fn announce_tracks(&mut self) {
        let Some(remote) = self.remote.clone() else {
            return;
        };
        for track in remote.tracks {
            if self.announced.insert(track.id.clone()) {
                self.emit(PeerEvent::RemoteTrack {
                    stream_id: remote.stream_id.clone(),
                    track,
                });
            }
        }
    }
}

/// One simulated connection
pub struct LoopbackPeerConnection {
    local: UserId,
    remote: UserId,
    board: Arc<Switchboard>,
    state: Mutex<ConnState>,
}

impl LoopbackPeerConnection {
    fn evaluate(&self, state: &mut ConnState) {
        if state.closed
            || state.local_generation.is_none()
            || state.remote.is_none()
            || state.candidates_applied == 0
        {
            return;
        }
        match state.connection {
            ConnectionState::Failed => {}
            ConnectionState::Connected => state.announce_tracks(),
            _ => {
                if self.board.take_failure(&self.remote) {
                    state.set_connection(ConnectionState::Failed);
                } else {
                    state.announce_tracks();
                    state.set_connection(ConnectionState::Connected);
                }
            }
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackPeerConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, PeerError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        let id = state.next_sender;
        state.next_sender += 1;
        state.senders.insert(id, (track.kind(), Some(track.clone())));
        Ok(SenderId(id))
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<&LocalTrack>,
    ) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        let slot = state
            .senders
            .get_mut(&sender.0)
            .ok_or_else(|| PeerError::Backend(format!("unknown sender {}", sender.0)))?;
        slot.1 = track.cloned();
        Ok(())
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        state
            .senders
            .remove(&sender.0)
            .map(|_| ())
            .ok_or_else(|| PeerError::Backend(format!("unknown sender {}", sender.0)))
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        if ice_restart {
            state.generation += 1;
        }
        Ok(SessionDescription::offer(describe(
            &state.sender_list(),
            self.local.as_str(),
            state.generation,
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let state = self.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        if state.remote_kind != Some(SdpKind::Offer) {
            return Err(PeerError::NoRemoteDescription);
        }
        Ok(SessionDescription::answer(describe(
            &state.sender_list(),
            self.local.as_str(),
            state.generation,
        )))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let parsed = parse(&desc.sdp)?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        if state
            .local_generation
            .is_some_and(|previous| previous != parsed.generation)
        {
            state.restart_ice();
        }
        state.local_generation = Some(parsed.generation);

        state.candidates_gathered += 1;
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host generation {}",
                state.candidates_gathered,
                50000 + state.candidates_gathered,
                parsed.generation
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        state.emit(PeerEvent::LocalCandidate(candidate));
        if state.connection == ConnectionState::New {
            state.set_connection(ConnectionState::Connecting);
        }
        self.evaluate(&mut state);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let parsed = parse(&desc.sdp)?;
        let mut state = self.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        if desc.kind == SdpKind::Answer && state.local_generation.is_none() {
            return Err(PeerError::Sdp("answer without a local offer".to_string()));
        }
        let restarted = state
            .remote
            .as_ref()
            .is_some_and(|previous| previous.generation != parsed.generation);
        if restarted {
            state.restart_ice();
            if desc.kind == SdpKind::Offer {
                state.generation += 1;
            }
        }
        state.remote = Some(parsed);
        state.remote_kind = Some(desc.kind);
        self.evaluate(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(PeerError::Closed);
        }
        if state.remote.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        state.candidates_applied += 1;
        self.evaluate(&mut state);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.events = None;
        state.connection = ConnectionState::Closed;
        self.board.closed.fetch_add(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for LoopbackPeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackPeerConnection")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::TrackSource;
    use tokio::sync::mpsc;

    async fn pair() -> (
        Arc<dyn PeerConnection>,
        mpsc::UnboundedReceiver<PeerEvent>,
        Arc<dyn PeerConnection>,
        mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = LoopbackPeerFactory::new(UserId::new("alice"))
            .create(&UserId::new("bob"), a_tx)
            .await
            .unwrap();
        let b = LoopbackPeerFactory::new(UserId::new("bob"))
            .create(&UserId::new("alice"), b_tx)
            .await
            .unwrap();
        (a, a_rx, b, b_rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<PeerEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[test]
    fn test_describe_parse() {
        let sdp = describe(&[(1, TrackKind::Audio), (2, TrackKind::Video)], "alice", 3);
        let parsed = parse(&sdp).unwrap();
        assert_eq!(parsed.stream_id, "alice");
        assert_eq!(parsed.generation, 3);
        assert_eq!(parsed.tracks.len(), 2);
        assert_eq!(parsed.tracks[1].id, "alice-2");
    }

    #[test]
    fn test_garbage_sdp_rejected() {
        assert!(matches!(parse("hello"), Err(PeerError::Sdp(_))));
    }

    #[tokio::test]
    async fn test_candidate_before_remote_description_rejected() {
        let (a, _a_rx, _b, _b_rx) = pair().await;
        let res = a.add_ice_candidate(IceCandidate::new("candidate:x")).await;
        assert_eq!(res, Err(PeerError::NoRemoteDescription));
    }

    #[tokio::test]
    async fn test_full_exchange_connects() {
        let (a, mut a_rx, b, mut b_rx) = pair().await;
        a.add_track(&LocalTrack::new(TrackSource::Microphone, "mic"))
            .await
            .unwrap();

        let offer = a.create_offer(false).await.unwrap();
        a.set_local_description(offer.clone()).await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.create_answer().await.unwrap();
        b.set_local_description(answer.clone()).await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        a.add_ice_candidate(IceCandidate::new("candidate:b")).await.unwrap();
        b.add_ice_candidate(IceCandidate::new("candidate:a")).await.unwrap();

        let b_events = drain(&mut b_rx);
        assert!(b_events
            .iter()
            .any(|e| matches!(e, PeerEvent::RemoteTrack { track, .. } if track.kind == TrackKind::Audio)));
        assert!(b_events
            .iter()
            .any(|e| matches!(e, PeerEvent::ConnectionState(ConnectionState::Connected))));
        assert!(drain(&mut a_rx)
            .iter()
            .any(|e| matches!(e, PeerEvent::ConnectionState(ConnectionState::Connected))));
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let factory = LoopbackPeerFactory::new(UserId::new("alice"));
        factory.fail_connectivity(&UserId::new("bob"), 1);
        let a = factory.create(&UserId::new("bob"), a_tx).await.unwrap();

        let offer = a.create_offer(false).await.unwrap();
        a.set_local_description(offer).await.unwrap();
        a.set_remote_description(SessionDescription::answer(describe(&[], "bob", 0)))
            .await
            .unwrap();
        a.add_ice_candidate(IceCandidate::new("candidate:b")).await.unwrap();

        assert!(drain(&mut a_rx)
            .iter()
            .any(|e| matches!(e, PeerEvent::ConnectionState(ConnectionState::Failed))));
    }

    #[tokio::test]
    async fn test_close_counts_once() {
        let factory = LoopbackPeerFactory::new(UserId::new("alice"));
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = factory.create(&UserId::new("bob"), tx).await.unwrap();
        assert_eq!(factory.open_connections(), 1);
        conn.close().await;
        conn.close().await;
        assert_eq!(factory.open_connections(), 0);
        assert_eq!(factory.connections_created(), 1);
    }
}
