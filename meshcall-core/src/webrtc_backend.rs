//! Peer connections on the `webrtc` crate
//!
//! [`WebRtcPeerFactory`] creates `RTCPeerConnection`s. Local tracks are
//! mapped to `TrackLocalStaticSample`s (Opus for audio, VP8 for video) that
//! the capture pipeline writes samples into; the returned
//! [`WebRtcPeerFactory::sample_track`] gives access to them. A track's sink
//! is shared by every connection sending it and is forgotten once the track
//! has been stopped.

use crate::identity::UserId;
use crate::media::{LocalTrack, RemoteTrack, TrackKind};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerError, PeerEvent, PeerEventSender, SenderId};
use crate::types::{ConnectionState, IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn backend(err: impl std::fmt::Display) -> PeerError {
    PeerError::Backend(err.to_string())
}

fn sdp_error(err: impl std::fmt::Display) -> PeerError {
    PeerError::Sdp(err.to_string())
}

/// Sample sinks by local track id
#[derive(Default)]
struct SampleSinks {
    sinks: HashMap<String, (LocalTrack, Arc<TrackLocalStaticSample>)>,
}

impl SampleSinks {
    fn get(&self, track: &LocalTrack) -> Option<Arc<TrackLocalStaticSample>> {
        self.sinks
            .get(track.id())
            .filter(|(track, _)| !track.is_ended())
            .map(|(_, sink)| sink.clone())
    }

    fn sink_for(&mut self, track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
        self.prune();
        self.sinks
            .entry(track.id().to_string())
            .or_insert_with(|| (track.clone(), new_sink(track)))
            .1
            .clone()
    }

    /// Forget the sinks of stopped tracks
    fn prune(&mut self) {
        self.sinks.retain(|id, (track, _)| {
            let live = !track.is_ended();
            if !live {
                tracing::trace!(track = %id, "Dropping sample sink of stopped track");
            }
            live
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.sinks.len()
    }
}

fn new_sink(track: &LocalTrack) -> Arc<TrackLocalStaticSample> {
    let codec = match track.kind() {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            ..Default::default()
        },
    };
    Arc::new(TrackLocalStaticSample::new(
        codec,
        track.id().to_string(),
        "meshcall".to_string(),
    ))
}

/// Creates `RTCPeerConnection`s
pub struct WebRtcPeerFactory {
    ice_servers: Vec<String>,
    samples: Arc<Mutex<SampleSinks>>,
}

impl WebRtcPeerFactory {
    /// Factory using the given STUN/TURN urls
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers,
            samples: Arc::new(Mutex::new(SampleSinks::default())),
        }
    }

    /// Sample sink carrying a local track, once the track is attached to a
    /// connection and until it is stopped
    pub fn sample_track(&self, track: &LocalTrack) -> Option<Arc<TrackLocalStaticSample>> {
        self.samples.lock().get(track)
    }
}

impl Default for WebRtcPeerFactory {
    fn default() -> Self {
        Self::new(vec!["stun:stun.l.google.com:19302".to_string()])
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    #[tracing::instrument(skip(self, events), fields(peer = %remote))]
    async fn create(
        &self,
        remote: &UserId,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine).map_err(backend)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(backend)?);
        wire_callbacks(&pc, events);
        tracing::debug!("RTCPeerConnection created");

        Ok(Arc::new(WebRtcPeerConnection {
            pc,
            samples: self.samples.clone(),
            senders: Mutex::new(HashMap::new()),
            next_sender: AtomicU64::new(1),
        }))
    }
}

fn wire_callbacks(pc: &RTCPeerConnection, events: PeerEventSender) {
    let candidates = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let candidates = candidates.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = candidates.send(PeerEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }));
                }
                Err(e) => tracing::warn!(error = %e, "Local candidate not serializable"),
            }
        })
    }));

    let states = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let states = states.clone();
        Box::pin(async move {
            let mapped = match state {
                RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => ConnectionState::New,
                RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
                RTCPeerConnectionState::Connected => ConnectionState::Connected,
                RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
                RTCPeerConnectionState::Failed => ConnectionState::Failed,
                RTCPeerConnectionState::Closed => ConnectionState::Closed,
            };
            let _ = states.send(PeerEvent::ConnectionState(mapped));
        })
    }));

    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let events = events.clone();
        Box::pin(async move {
            let kind = match track.kind() {
                RTPCodecType::Audio => TrackKind::Audio,
                RTPCodecType::Video => TrackKind::Video,
                RTPCodecType::Unspecified => return,
            };
            let _ = events.send(PeerEvent::RemoteTrack {
                stream_id: track.stream_id(),
                track: RemoteTrack {
                    id: track.id(),
                    kind,
                },
            });
        })
    }));
}

/// One `RTCPeerConnection`
pub struct WebRtcPeerConnection {
    pc: Arc<RTCPeerConnection>,
    samples: Arc<Mutex<SampleSinks>>,
    senders: Mutex<HashMap<u64, Arc<RTCRtpSender>>>,
    next_sender: AtomicU64,
}

impl WebRtcPeerConnection {
    fn sample_track(&self, track: &LocalTrack) -> Arc<dyn TrackLocal + Send + Sync> {
        self.samples.lock().sink_for(track)
    }

    fn sender(&self, id: SenderId) -> Result<Arc<RTCRtpSender>, PeerError> {
        self.senders
            .lock()
            .get(&id.0)
            .cloned()
            .ok_or_else(|| PeerError::Backend(format!("unknown sender {}", id.0)))
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp).map_err(sdp_error),
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp).map_err(sdp_error),
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeerConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<SenderId, PeerError> {
        let sender = self
            .pc
            .add_track(self.sample_track(track))
            .await
            .map_err(backend)?;
        let id = self.next_sender.fetch_add(1, Ordering::Relaxed);
        self.senders.lock().insert(id, sender);
        Ok(SenderId(id))
    }

    async fn replace_track(&self, sender: SenderId, track: Option<&LocalTrack>) -> Result<(), PeerError> {
        let sender = self.sender(sender)?;
        let track = track.map(|t| self.sample_track(t));
        sender.replace_track(track).await.map_err(backend)?;
        self.samples.lock().prune();
        Ok(())
    }

    async fn remove_track(&self, sender: SenderId) -> Result<(), PeerError> {
        let rtp_sender = self.sender(sender)?;
        self.pc.remove_track(&rtp_sender).await.map_err(backend)?;
        self.senders.lock().remove(&sender.0);
        self.samples.lock().prune();
        Ok(())
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, PeerError> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await.map_err(backend)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.pc.remote_description().await.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        let answer = self.pc.create_answer(None).await.map_err(backend)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc(desc)?)
            .await
            .map_err(sdp_error)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(sdp_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.pc.remote_description().await.is_none() {
            return Err(PeerError::NoRemoteDescription);
        }
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(backend)
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!(error = %e, "RTCPeerConnection close failed");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::media::TrackSource;

    #[test]
    fn test_sink_is_shared_per_track() {
        let mut sinks = SampleSinks::default();
        let mic = LocalTrack::new(TrackSource::Microphone, "mic");
        let first = sinks.sink_for(&mic);
        let second = sinks.sink_for(&mic);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(sinks.len(), 1);
    }

    #[test]
    fn test_stopped_tracks_lose_their_sink() {
        let mut sinks = SampleSinks::default();
        let camera = LocalTrack::new(TrackSource::Camera, "camera");
        sinks.sink_for(&camera);
        for _ in 0..3 {
            let screen = LocalTrack::new(TrackSource::Screen, "screen");
            sinks.sink_for(&screen);
            screen.stop();
            assert!(sinks.get(&screen).is_none());
        }
        sinks.prune();
        assert_eq!(sinks.len(), 1);
        assert!(sinks.get(&camera).is_some());
    }
}
