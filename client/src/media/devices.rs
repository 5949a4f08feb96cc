//! Capture Devices
//!
//! [`MediaDevices`] is the seam to the platform's capture stack. Backends
//! report failures with the platform error name so the classifier can map
//! them onto [`crate::error::AcquisitionError`].

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

use super::track::{MediaTrack, TrackSource};

/// Which kinds of capture a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl MediaConstraints {
    pub const AUDIO_VIDEO: Self = Self {
        audio: true,
        video: true,
    };
    pub const AUDIO_ONLY: Self = Self {
        audio: true,
        video: false,
    };
}

/// Raw failure reported by a capture backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct DeviceFailure {
    /// Platform error name, e.g. `NotAllowedError`.
    pub name: String,
    pub message: String,
}

impl DeviceFailure {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Platform capture stack.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Capture camera and/or microphone. Either every requested kind is
    /// returned or the request fails as a whole.
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<Arc<MediaTrack>>, DeviceFailure>;

    /// Capture a display surface chosen by the user.
    async fn get_display_media(&self) -> Result<Arc<MediaTrack>, DeviceFailure>;
}

/// Configured outcome for one synthetic device.
#[derive(Debug, Clone)]
enum Availability {
    Available,
    Fails(DeviceFailure),
}

impl Availability {
    fn check(&self) -> Result<(), DeviceFailure> {
        match self {
            Self::Available => Ok(()),
            Self::Fails(failure) => Err(failure.clone()),
        }
    }
}

/// Software devices producing synthetic tracks.
///
/// Used for headless clients and tests. Every issued track is remembered so
/// callers can check that nothing is left live.
#[derive(Debug)]
pub struct SyntheticDevices {
    microphone: Availability,
    camera: Availability,
    display: Availability,
    issued: Mutex<Vec<Arc<MediaTrack>>>,
    requests: Mutex<Vec<MediaConstraints>>,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDevices {
    /// Microphone, camera and display all available.
    pub fn new() -> Self {
        Self {
            microphone: Availability::Available,
            camera: Availability::Available,
            display: Availability::Available,
            issued: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn without_camera(self) -> Self {
        self.with_camera_failure("NotFoundError")
    }

    #[must_use]
    pub fn with_camera_failure(mut self, name: &str) -> Self {
        self.camera = Availability::Fails(DeviceFailure::new(name, "camera unavailable"));
        self
    }

    #[must_use]
    pub fn with_microphone_failure(mut self, name: &str) -> Self {
        self.microphone = Availability::Fails(DeviceFailure::new(name, "microphone unavailable"));
        self
    }

    #[must_use]
    pub fn with_display_failure(mut self, name: &str) -> Self {
        self.display = Availability::Fails(DeviceFailure::new(name, "display capture unavailable"));
        self
    }

    /// User blocked access to every capture device.
    #[must_use]
    pub fn deny_permission(self) -> Self {
        self.with_microphone_failure("NotAllowedError")
            .with_camera_failure("NotAllowedError")
    }

    /// Every track handed out so far.
    pub async fn issued_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.issued.lock().await.clone()
    }

    /// Tracks handed out and not yet stopped.
    pub async fn live_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.issued
            .lock()
            .await
            .iter()
            .filter(|track| track.is_live())
            .cloned()
            .collect()
    }

    /// Constraints of every `get_user_media` request, in order.
    pub async fn requests(&self) -> Vec<MediaConstraints> {
        self.requests.lock().await.clone()
    }

    async fn issue(&self, source: TrackSource, label: &str) -> Arc<MediaTrack> {
        let track = Arc::new(MediaTrack::new(source, label));
        debug!(track_id = %track.id(), ?source, "Synthetic track issued");
        self.issued.lock().await.push(track.clone());
        track
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<Arc<MediaTrack>>, DeviceFailure> {
        self.requests.lock().await.push(constraints);

        if !constraints.audio && !constraints.video {
            return Err(DeviceFailure::new("TypeError", "no media kind requested"));
        }
        if constraints.audio {
            self.microphone.check()?;
        }
        if constraints.video {
            self.camera.check()?;
        }

        let mut tracks = Vec::with_capacity(2);
        if constraints.audio {
            tracks.push(self.issue(TrackSource::Microphone, "Synthetic Microphone").await);
        }
        if constraints.video {
            tracks.push(self.issue(TrackSource::Camera, "Synthetic Camera").await);
        }
        Ok(tracks)
    }

    async fn get_display_media(&self) -> Result<Arc<MediaTrack>, DeviceFailure> {
        self.display.check()?;
        Ok(self.issue(TrackSource::Screen, "Synthetic Display").await)
    }
}
