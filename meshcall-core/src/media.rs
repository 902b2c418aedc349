//! Local media capture
//!
//! `MediaCapture` owns the local stream for whichever call is live. Sessions
//! attach its tracks to their peer links but never stop them: the stream is
//! released once, at session teardown, no matter how many links carried it.
//!
//! Device access is abstracted behind [`MediaDevices`] and [`ScreenCapture`]
//! so the platform capture APIs stay outside the core.

use crate::types::MediaKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// User or OS refused access
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No matching device
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device held by another application
    #[error("Device busy: {0}")]
    DeviceBusy(String),

    /// Any other capture failure
    #[error("Capture error: {0}")]
    Capture(String),
}

/// Audio or video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

/// Where a local track comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrackSource {
    /// Microphone
    Microphone,
    /// Camera
    Camera,
    /// Captured screen or window
    Screen,
}

impl TrackSource {
    /// Track kind produced by this source
    pub fn kind(self) -> TrackKind {
        match self {
            Self::Microphone => TrackKind::Audio,
            Self::Camera | Self::Screen => TrackKind::Video,
        }
    }
}

struct TrackInner {
    id: String,
    source: TrackSource,
    label: String,
    enabled: AtomicBool,
    ended: AtomicBool,
}

/// Handle to a captured local track
///
/// Clones share the same underlying track: toggling `enabled` on one clone is
/// seen by every peer link carrying it.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    /// Wrap a freshly captured track
    pub fn new(source: TrackSource, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                source,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended: AtomicBool::new(false),
            }),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Audio or video
    pub fn kind(&self) -> TrackKind {
        self.inner.source.kind()
    }

    /// Device class
    pub fn source(&self) -> TrackSource {
        self.inner.source
    }

    /// Device label
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Check if the track carries media (not muted / camera on)
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Mute or unmute without renegotiation
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Check if the device has been released
    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::SeqCst)
    }

    /// Release the device. Returns `true` only for the call that ended it.
    pub fn stop(&self) -> bool {
        !self.inner.ended.swap(true, Ordering::SeqCst)
    }

    /// Check if both handles point at the same track
    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("source", &self.inner.source)
            .field("enabled", &self.is_enabled())
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// The local stream shown in the preview and attached to peer links
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl MediaStream {
    /// Group captured tracks into a stream
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// Stream identifier. Stable across track substitution.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Microphone track
    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    /// Outgoing video track: camera, or the screen while sharing
    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    fn stop_all(&self) -> usize {
        self.tracks.iter().filter(|t| t.stop()).count()
    }
}

/// Track received from a remote party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track identifier assigned by the sender
    pub id: String,
    /// Audio or video
    pub kind: TrackKind,
}

/// Media received from one remote party
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteStream {
    /// Stream identifier
    pub id: String,
    /// Tracks received so far
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Empty stream
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    /// Record a track, ignoring duplicates. Returns `true` if it was new.
    pub fn add_track(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Check if any video track was received
    pub fn has_video(&self) -> bool {
        self.tracks.iter().any(|t| t.kind == TrackKind::Video)
    }
}

/// Device-access API (microphone and camera)
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the microphone, plus the camera for video calls
    async fn open_user_media(&self, kind: MediaKind) -> Result<Vec<LocalTrack>, MediaError>;

    /// Open the camera alone
    async fn open_camera(&self) -> Result<LocalTrack, MediaError>;
}

/// Screen-capture API
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    /// Let the user pick a screen or window and capture it
    async fn open_display(&self) -> Result<LocalTrack, MediaError>;
}

/// Owner of the local media stream
pub struct MediaCapture {
    devices: Arc<dyn MediaDevices>,
    stream: Mutex<Option<MediaStream>>,
}

impl MediaCapture {
    /// Create a capture over the given devices
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            stream: Mutex::new(None),
        }
    }

    /// Open devices for a call of the given kind.
    ///
    /// The stream is returned, not installed: the caller adopts it only if
    /// its session is still alive once the devices answer.
    ///
    /// # Errors
    ///
    /// Returns the device error when access fails
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self, kind: MediaKind) -> Result<MediaStream, MediaError> {
        tracing::debug!("Acquiring local media");
        let tracks = self.devices.open_user_media(kind).await.map_err(|e| {
            tracing::warn!(error = %e, "Local media unavailable");
            e
        })?;

        if kind.has_video() && !tracks.iter().any(|t| t.kind() == TrackKind::Video) {
            for t in &tracks {
                t.stop();
            }
            return Err(MediaError::DeviceNotFound("camera".to_string()));
        }

        let stream = MediaStream::new(tracks);
        tracing::debug!(stream_id = %stream.id(), tracks = stream.tracks().len(), "Local media acquired");
        Ok(stream)
    }

    /// Install a stream as the live local stream. A previously installed
    /// stream has its tracks that are not part of the new one stopped.
    pub fn adopt(&self, stream: MediaStream) -> MediaStream {
        let mut slot = self.stream.lock();
        if let Some(old) = slot.take() {
            for t in old.tracks() {
                if !stream.tracks().iter().any(|n| n.same_track(t)) {
                    t.stop();
                }
            }
        }
        *slot = Some(stream.clone());
        stream
    }

    /// The live local stream
    pub fn stream(&self) -> Option<MediaStream> {
        self.stream.lock().clone()
    }

    /// Tracks to attach to a new peer link
    pub fn local_tracks(&self) -> Vec<LocalTrack> {
        self.stream
            .lock()
            .as_ref()
            .map(|s| s.tracks().to_vec())
            .unwrap_or_default()
    }

    /// Flip the microphone. Returns the new muted state, or `None` when
    /// there is no microphone track.
    pub fn toggle_mute(&self) -> Option<bool> {
        let slot = self.stream.lock();
        let audio = slot.as_ref()?.audio_track()?;
        audio.set_enabled(!audio.is_enabled());
        Some(!audio.is_enabled())
    }

    /// Flip the outgoing video track. Returns the new enabled state, or
    /// `None` when there is no video track.
    pub fn toggle_video(&self) -> Option<bool> {
        let slot = self.stream.lock();
        let video = slot.as_ref()?.video_track()?;
        video.set_enabled(!video.is_enabled());
        Some(video.is_enabled())
    }

    /// Check if the microphone is muted
    pub fn is_muted(&self) -> bool {
        self.stream
            .lock()
            .as_ref()
            .and_then(|s| s.audio_track().map(|t| !t.is_enabled()))
            .unwrap_or(false)
    }

    /// Put `track` in place of the current video track in the local stream,
    /// keeping the stream id. `None` removes the video track. The previous
    /// video track is returned and left running.
    pub fn swap_video_track(&self, track: Option<LocalTrack>) -> Option<LocalTrack> {
        let mut slot = self.stream.lock();
        let stream = slot.as_mut()?;
        let previous = stream
            .tracks
            .iter()
            .position(|t| t.kind() == TrackKind::Video)
            .map(|i| stream.tracks.remove(i));
        if let Some(track) = track {
            stream.tracks.push(track);
        }
        previous
    }

    /// Open a fresh camera track, used when the original one has ended
    ///
    /// # Errors
    ///
    /// Returns the device error when the camera cannot be opened
    pub async fn reacquire_camera(&self) -> Result<LocalTrack, MediaError> {
        tracing::debug!("Reacquiring camera");
        self.devices.open_camera().await
    }

    /// Stop every local track and drop the stream. Returns `true` if a
    /// stream was released; later calls are no-ops.
    pub fn release(&self) -> bool {
        let Some(stream) = self.stream.lock().take() else {
            return false;
        };
        let stopped = stream.stop_all();
        tracing::debug!(stream_id = %stream.id(), stopped, "Local media released");
        true
    }

    /// Check if any installed track is still running
    pub fn has_live_tracks(&self) -> bool {
        self.stream
            .lock()
            .as_ref()
            .is_some_and(|s| s.tracks().iter().any(|t| !t.is_ended()))
    }
}

impl fmt::Debug for MediaCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaCapture")
            .field("stream", &*self.stream.lock())
            .finish()
    }
}
