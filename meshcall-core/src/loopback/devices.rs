//! Fake capture devices

use crate::media::{LocalTrack, MediaDevices, MediaError, ScreenCapture, TrackSource};
use crate::types::MediaKind;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
struct Faults {
    user_media: Option<MediaError>,
    display: Option<MediaError>,
    camera: Option<MediaError>,
    user_media_delay: Option<Duration>,
    display_delay: Option<Duration>,
}

/// Microphone, camera and screen that hand out synthetic tracks
///
/// Every issued track is remembered so tests can check that nothing is left
/// running after a session ends.
#[derive(Debug, Default)]
pub struct FakeMediaDevices {
    issued: Mutex<Vec<LocalTrack>>,
    faults: Mutex<Faults>,
    display_requests: AtomicUsize,
    user_media_requests: AtomicUsize,
}

impl FakeMediaDevices {
    /// Devices that always succeed
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next microphone/camera request fail
    pub fn fail_next_user_media(&self, error: MediaError) {
        self.faults.lock().user_media = Some(error);
    }

    /// Make the next screen capture request fail
    pub fn fail_next_display(&self, error: MediaError) {
        self.faults.lock().display = Some(error);
    }

    /// Make the next camera-only request fail
    pub fn fail_next_camera(&self, error: MediaError) {
        self.faults.lock().camera = Some(error);
    }

    /// Hold microphone/camera requests for `delay`, like a permission prompt
    pub fn delay_user_media(&self, delay: Duration) {
        self.faults.lock().user_media_delay = Some(delay);
    }

    /// Hold screen capture requests for `delay`, like a picker dialog
    pub fn delay_display(&self, delay: Duration) {
        self.faults.lock().display_delay = Some(delay);
    }

    /// Issued tracks that have not been stopped
    pub fn live_tracks(&self) -> usize {
        self.issued.lock().iter().filter(|t| !t.is_ended()).count()
    }

    /// Number of screen capture requests seen
    pub fn display_requests(&self) -> usize {
        self.display_requests.load(Ordering::SeqCst)
    }

    /// Number of microphone/camera requests seen
    pub fn user_media_requests(&self) -> usize {
        self.user_media_requests.load(Ordering::SeqCst)
    }

    fn issue(&self, source: TrackSource, label: &str) -> LocalTrack {
        let track = LocalTrack::new(source, label);
        self.issued.lock().push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn open_user_media(&self, kind: MediaKind) -> Result<Vec<LocalTrack>, MediaError> {
        self.user_media_requests.fetch_add(1, Ordering::SeqCst);
        let delay = self.faults.lock().user_media_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.faults.lock().user_media.take() {
            return Err(error);
        }

        let mut tracks = vec![self.issue(TrackSource::Microphone, "Fake microphone")];
        if kind.has_video() {
            tracks.push(self.issue(TrackSource::Camera, "Fake camera"));
        }
        Ok(tracks)
    }

    async fn open_camera(&self) -> Result<LocalTrack, MediaError> {
        if let Some(error) = self.faults.lock().camera.take() {
            return Err(error);
        }
        Ok(self.issue(TrackSource::Camera, "Fake camera"))
    }
}

#[async_trait]
impl ScreenCapture for FakeMediaDevices {
    async fn open_display(&self) -> Result<LocalTrack, MediaError> {
        self.display_requests.fetch_add(1, Ordering::SeqCst);
        let delay = self.faults.lock().display_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.faults.lock().display.take() {
            return Err(error);
        }
        Ok(self.issue(TrackSource::Screen, "Fake screen"))
    }
}
