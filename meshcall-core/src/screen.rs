//! Screen sharing
//!
//! Screen sharing swaps the outgoing video track of every peer link between
//! the camera and a captured screen. A link that already sends video gets
//! the track replaced in place; a link without a video sender (voice call)
//! gains one, which requires a fresh offer. The links that need one are
//! returned to the caller, which owns signaling.
//!
//! Start and stop are serialized: a stop issued while a start is waiting on
//! the capture dialog runs after the start has settled and then reverses it.

use crate::media::{LocalTrack, MediaCapture, MediaError, ScreenCapture};
use crate::peer::{PeerError, PeerLink};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Screen sharing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScreenShareError {
    /// Screen or camera capture failed
    #[error("Capture failed: {0}")]
    Media(#[from] MediaError),

    /// A peer link refused the track change
    #[error("Track change failed: {0}")]
    Peer(#[from] PeerError),

    /// The session was torn down while the share was being set up
    #[error("No live session")]
    Inactive,
}

/// Result of a start or stop request
#[derive(Debug, Default)]
pub struct ShareChange {
    /// Whether sharing state actually flipped
    pub changed: bool,
    /// Links whose sender set changed and that must send a new offer
    pub renegotiate: Vec<Arc<PeerLink>>,
}

#[derive(Debug)]
enum ShareState {
    Idle,
    Sharing {
        screen: LocalTrack,
        camera: Option<LocalTrack>,
    },
}

/// Swaps the outgoing video between camera and screen
pub struct ScreenShareCoordinator {
    capture: Arc<dyn ScreenCapture>,
    media: Arc<MediaCapture>,
    state: tokio::sync::Mutex<ShareState>,
    sharing: AtomicBool,
    // Bumped by `reset`; an operation that sees it change backs out
    epoch: AtomicU64,
}

impl ScreenShareCoordinator {
    /// Create a coordinator for the given capture API and local media
    pub fn new(capture: Arc<dyn ScreenCapture>, media: Arc<MediaCapture>) -> Self {
        Self {
            capture,
            media,
            state: tokio::sync::Mutex::new(ShareState::Idle),
            sharing: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
        }
    }

    /// Check if the screen is being shared
    pub fn is_sharing(&self) -> bool {
        self.sharing.load(Ordering::SeqCst)
    }

    /// Capture the screen and send it on every link in place of the camera.
    /// Starting while already sharing changes nothing.
    ///
    /// # Errors
    ///
    /// Returns error if the screen cannot be captured or the session went
    /// away while the capture dialog was open
    #[tracing::instrument(skip(self, links), fields(links = links.len()))]
    pub async fn start(&self, links: &[Arc<PeerLink>]) -> Result<ShareChange, ScreenShareError> {
        let mut state = self.state.lock().await;
        if matches!(*state, ShareState::Sharing { .. }) {
            return Ok(ShareChange::default());
        }
        let epoch = self.epoch.load(Ordering::SeqCst);

        let screen = self.capture.open_display().await?;
        if self.epoch.load(Ordering::SeqCst) != epoch || self.media.stream().is_none() {
            screen.stop();
            return Err(ScreenShareError::Inactive);
        }

        let camera = self.media.swap_video_track(Some(screen.clone()));
        let renegotiate = retarget(links, Some(&screen)).await;
        if self.epoch.load(Ordering::SeqCst) != epoch {
            screen.stop();
            if let Some(cam) = camera {
                cam.stop();
            }
            return Err(ScreenShareError::Inactive);
        }

        tracing::info!(
            had_camera = camera.is_some(),
            renegotiate = renegotiate.len(),
            "Screen share started"
        );
        *state = ShareState::Sharing { screen, camera };
        self.sharing.store(true, Ordering::SeqCst);
        Ok(ShareChange {
            changed: true,
            renegotiate,
        })
    }

    /// Put the camera back on every link and stop the screen capture.
    /// Stopping while not sharing changes nothing.
    ///
    /// If the camera track ended while the screen was shown, a new one is
    /// opened. A call that had no camera loses its video sender.
    #[tracing::instrument(skip(self, links), fields(links = links.len()))]
    pub async fn stop(&self, links: &[Arc<PeerLink>]) -> ShareChange {
        let mut state = self.state.lock().await;
        let ShareState::Sharing { screen, camera } = std::mem::replace(&mut *state, ShareState::Idle)
        else {
            return ShareChange::default();
        };
        self.sharing.store(false, Ordering::SeqCst);
        let epoch = self.epoch.load(Ordering::SeqCst);

        let restored = match camera {
            Some(cam) if !cam.is_ended() => Some(cam),
            Some(_) => match self.media.reacquire_camera().await {
                Ok(cam) => Some(cam),
                Err(e) => {
                    tracing::warn!(error = %e, "Camera could not be reopened, dropping video");
                    None
                }
            },
            None => None,
        };

        if self.epoch.load(Ordering::SeqCst) != epoch {
            screen.stop();
            if let Some(cam) = restored {
                cam.stop();
            }
            return ShareChange {
                changed: true,
                renegotiate: Vec::new(),
            };
        }

        self.media.swap_video_track(restored.clone());
        let renegotiate = retarget(links, restored.as_ref()).await;
        screen.stop();

        tracing::info!(
            camera_restored = restored.is_some(),
            renegotiate = renegotiate.len(),
            "Screen share stopped"
        );
        ShareChange {
            changed: true,
            renegotiate,
        }
    }

    /// Drop any share state at session teardown, stopping the screen and the
    /// camera held aside for it. Operations in flight notice and back out.
    pub fn reset(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.sharing.store(false, Ordering::SeqCst);
        match self.state.try_lock() {
            Ok(mut state) => {
                if let ShareState::Sharing { screen, camera } =
                    std::mem::replace(&mut *state, ShareState::Idle)
                {
                    screen.stop();
                    if let Some(cam) = camera {
                        cam.stop();
                    }
                }
            }
            Err(_) => tracing::debug!("Screen share operation in flight, it will back out"),
        }
    }
}

async fn retarget(links: &[Arc<PeerLink>], track: Option<&LocalTrack>) -> Vec<Arc<PeerLink>> {
    let mut renegotiate = Vec::new();
    for link in links {
        match link.set_video_track(track.cloned()).await {
            Ok(true) => renegotiate.push(link.clone()),
            Ok(false) | Err(PeerError::Closed) => {}
            Err(e) => {
                tracing::warn!(peer = %link.peer_id(), error = %e, "Video track change failed");
            }
        }
    }
    renegotiate
}

impl std::fmt::Debug for ScreenShareCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScreenShareCoordinator")
            .field("sharing", &self.is_sharing())
            .finish()
    }
}
