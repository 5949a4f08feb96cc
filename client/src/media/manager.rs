//! Media Resource Manager
//!
//! Owns every local and remote track of the current call. Acquisition falls
//! back from audio+video to audio-only; release stops each live track once
//! and can run any number of times.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::devices::{MediaConstraints, MediaDevices};
use super::track::{MediaTrack, TrackSource};
use crate::error::{AcquisitionError, CallError};
use crate::events::{CallEvent, TrackInfo};
use crate::peer::PeerConnection;

/// Live local tracks of the current call.
#[derive(Debug, Clone, Default)]
pub struct LocalMediaState {
    pub audio: Option<Arc<MediaTrack>>,
    pub camera: Option<Arc<MediaTrack>>,
    /// Display capture substituted for the camera on the outbound sender.
    pub screen: Option<Arc<MediaTrack>>,
}

impl LocalMediaState {
    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        [&self.audio, &self.camera, &self.screen]
            .into_iter()
            .flatten()
            .cloned()
            .collect()
    }

    /// Track currently feeding the outbound video sender.
    pub fn outbound_video(&self) -> Option<Arc<MediaTrack>> {
        self.screen.clone().or_else(|| self.camera.clone())
    }

    pub fn infos(&self) -> Vec<TrackInfo> {
        self.tracks().iter().map(|t| t.info()).collect()
    }
}

/// Tracks received from the peer.
#[derive(Debug, Clone, Default)]
pub struct RemoteMediaState {
    pub tracks: Vec<Arc<MediaTrack>>,
}

impl RemoteMediaState {
    pub fn infos(&self) -> Vec<TrackInfo> {
        self.tracks.iter().map(|t| t.info()).collect()
    }
}

/// Result of a successful acquisition, not yet installed.
#[derive(Debug)]
pub struct AcquiredMedia {
    pub audio: Arc<MediaTrack>,
    pub camera: Option<Arc<MediaTrack>>,
}

impl AcquiredMedia {
    pub const fn has_camera(&self) -> bool {
        self.camera.is_some()
    }

    /// Stop every acquired track. Used when the call was torn down while
    /// acquisition was in flight.
    pub fn stop_all(&self) {
        self.audio.stop();
        if let Some(camera) = &self.camera {
            camera.stop();
        }
    }
}

/// Outcome of a mute/camera toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    Enabled,
    Disabled,
    /// Video was requested but the call has no camera.
    NoCamera,
    /// No track of that kind is installed.
    NoTrack,
}

impl ToggleOutcome {
    const fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }
}

/// Media manager for one call controller.
pub struct MediaManager {
    devices: Arc<dyn MediaDevices>,
    local: RwLock<LocalMediaState>,
    remote: RwLock<RemoteMediaState>,
    has_camera: AtomicBool,
    screen_watcher: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<CallEvent>,
}

impl MediaManager {
    pub fn new(devices: Arc<dyn MediaDevices>, events: broadcast::Sender<CallEvent>) -> Self {
        Self {
            devices,
            local: RwLock::new(LocalMediaState::default()),
            remote: RwLock::new(RemoteMediaState::default()),
            has_camera: AtomicBool::new(false),
            screen_watcher: Mutex::new(None),
            events,
        }
    }

    /// Acquire microphone and, when preferred, camera.
    ///
    /// Tries audio+video first, then audio-only. If audio-only also fails the
    /// failure is classified and nothing is left acquired.
    pub async fn acquire(&self, prefer_video: bool) -> Result<AcquiredMedia, AcquisitionError> {
        if prefer_video {
            match self
                .devices
                .get_user_media(MediaConstraints::AUDIO_VIDEO)
                .await
            {
                Ok(tracks) => return Self::split(tracks),
                Err(failure) => {
                    warn!(error = %failure, "Audio+video capture failed, falling back to audio only");
                }
            }
        }

        match self.devices.get_user_media(MediaConstraints::AUDIO_ONLY).await {
            Ok(tracks) => Self::split(tracks),
            Err(failure) => {
                let kind = AcquisitionError::classify(&failure);
                warn!(error = %failure, kind = kind.code(), "Audio capture failed");
                Err(kind)
            }
        }
    }

    fn split(tracks: Vec<Arc<MediaTrack>>) -> Result<AcquiredMedia, AcquisitionError> {
        let mut audio = None;
        let mut camera = None;

        for track in tracks {
            match track.source() {
                TrackSource::Microphone if audio.is_none() => audio = Some(track),
                TrackSource::Camera if camera.is_none() => camera = Some(track),
                _ => {
                    debug!(track_id = %track.id(), "Stopping surplus captured track");
                    track.stop();
                }
            }
        }

        match audio {
            Some(audio) => Ok(AcquiredMedia { audio, camera }),
            None => {
                if let Some(camera) = camera {
                    camera.stop();
                }
                Err(AcquisitionError::UnsupportedEnvironment)
            }
        }
    }

    /// Install acquired tracks as the call's local media.
    ///
    /// If `cancel` has fired the tracks are stopped instead. The check runs
    /// under the same lock `release` takes, so a track is either installed
    /// and later released, or stopped here.
    pub async fn install(
        &self,
        acquired: AcquiredMedia,
        cancel: &CancellationToken,
    ) -> Result<LocalMediaState, CallError> {
        let mut local = self.local.write().await;
        if cancel.is_cancelled() {
            acquired.stop_all();
            debug!("Call torn down during acquisition, stopped acquired tracks");
            return Err(CallError::Cancelled);
        }

        self.has_camera
            .store(acquired.has_camera(), Ordering::Release);
        local.audio = Some(acquired.audio);
        local.camera = acquired.camera;
        local.screen = None;

        info!(has_camera = local.camera.is_some(), "Local media installed");
        Ok(local.clone())
    }

    /// Record a track received from the peer. Returns every remote track so
    /// far, or `None` when the call is being torn down.
    pub async fn add_remote_track(
        &self,
        track: Arc<MediaTrack>,
        cancel: &CancellationToken,
    ) -> Option<Vec<TrackInfo>> {
        let mut remote = self.remote.write().await;
        if cancel.is_cancelled() {
            track.stop();
            return None;
        }
        if remote.tracks.iter().any(|t| t.id() == track.id()) {
            return Some(remote.infos());
        }

        debug!(track_id = %track.id(), kind = ?track.kind(), "Remote track added");
        remote.tracks.push(track);
        Some(remote.infos())
    }

    pub fn has_camera(&self) -> bool {
        self.has_camera.load(Ordering::Acquire)
    }

    pub async fn local_state(&self) -> LocalMediaState {
        self.local.read().await.clone()
    }

    pub async fn remote_state(&self) -> RemoteMediaState {
        self.remote.read().await.clone()
    }

    pub async fn is_screen_sharing(&self) -> bool {
        self.local.read().await.screen.is_some()
    }

    pub async fn toggle_audio(&self) -> ToggleOutcome {
        let local = self.local.read().await;
        let Some(audio) = &local.audio else {
            return ToggleOutcome::NoTrack;
        };

        let enabled = !audio.is_enabled();
        audio.set_enabled(enabled);
        debug!(enabled, "Audio toggled");
        ToggleOutcome::from_enabled(enabled)
    }

    /// Flip the camera track. Never re-acquires; without a camera this only
    /// reports [`ToggleOutcome::NoCamera`].
    pub async fn toggle_video(&self) -> ToggleOutcome {
        if !self.has_camera() {
            info!("Video toggle ignored, no camera available");
            return ToggleOutcome::NoCamera;
        }

        let local = self.local.read().await;
        let Some(camera) = &local.camera else {
            return ToggleOutcome::NoTrack;
        };

        let enabled = !camera.is_enabled();
        camera.set_enabled(enabled);
        debug!(enabled, "Video toggled");
        ToggleOutcome::from_enabled(enabled)
    }

    /// Substitute a display capture for the outbound video track.
    ///
    /// Audio is untouched and the camera keeps running so it can be restored.
    /// When the display capture ends on its own (the system "stop sharing"
    /// control) the camera is put back automatically.
    pub async fn start_screen_share(
        self: &Arc<Self>,
        peer: Arc<dyn PeerConnection>,
        cancel: &CancellationToken,
    ) -> Result<(), CallError> {
        if self.is_screen_sharing().await {
            return Ok(());
        }

        let screen = self.devices.get_display_media().await.map_err(|failure| {
            warn!(error = %failure, "Display capture failed");
            CallError::from(AcquisitionError::classify(&failure))
        })?;

        {
            let mut local = self.local.write().await;
            if cancel.is_cancelled() || local.screen.is_some() {
                screen.stop();
                return if cancel.is_cancelled() {
                    Err(CallError::Cancelled)
                } else {
                    Ok(())
                };
            }
            local.screen = Some(screen.clone());
        }

        if let Err(e) = peer.replace_video_track(Some(screen.clone())).await {
            warn!(error = %e, "Failed to substitute display track");
            self.clear_screen(screen.id()).await;
            screen.stop();
            return Err(e.into());
        }

        self.watch_screen_end(&screen, peer).await;
        info!(track_id = %screen.id(), "Screen share started");
        let _ = self.events.send(CallEvent::ScreenShareChanged { active: true });
        Ok(())
    }

    /// Put the camera (or nothing) back on the outbound video sender and stop
    /// the display capture. Returns `false` when no share was active.
    pub async fn stop_screen_share(&self, peer: &dyn PeerConnection) -> Result<bool, CallError> {
        let (screen, camera) = {
            let mut local = self.local.write().await;
            let Some(screen) = local.screen.take() else {
                return Ok(false);
            };
            (screen, local.camera.clone())
        };

        let restored = peer.replace_video_track(camera).await;
        screen.stop();
        let _ = self.events.send(CallEvent::ScreenShareChanged { active: false });
        info!(track_id = %screen.id(), "Screen share stopped");

        restored.map(|()| true).map_err(CallError::from)
    }

    async fn clear_screen(&self, track_id: &str) -> Option<Arc<MediaTrack>> {
        let mut local = self.local.write().await;
        if local.screen.as_ref().is_some_and(|s| s.id() == track_id) {
            local.screen.take()
        } else {
            None
        }
    }

    async fn watch_screen_end(self: &Arc<Self>, screen: &Arc<MediaTrack>, peer: Arc<dyn PeerConnection>) {
        let manager: Weak<Self> = Arc::downgrade(self);
        let screen = screen.clone();

        let handle = tokio::spawn(async move {
            screen.ended().await;

            let Some(manager) = manager.upgrade() else {
                return;
            };
            // Only the share that ended is reverted; a manual stop already
            // cleared it.
            if manager.clear_screen(screen.id()).await.is_none() {
                return;
            }

            let camera = manager.local.read().await.camera.clone();
            if let Err(e) = peer.replace_video_track(camera).await {
                warn!(error = %e, "Failed to restore camera after display capture ended");
            }
            info!(track_id = %screen.id(), "Display capture ended, reverted to camera");
            let _ = manager
                .events
                .send(CallEvent::ScreenShareChanged { active: false });
        });

        if let Some(previous) = self.screen_watcher.lock().await.replace(handle) {
            previous.abort();
        }
    }

    /// Stop every live local and remote track and forget them.
    ///
    /// Safe to call repeatedly; returns how many tracks this call stopped.
    pub async fn release(&self) -> usize {
        if let Some(watcher) = self.screen_watcher.lock().await.take() {
            watcher.abort();
        }

        let local = std::mem::take(&mut *self.local.write().await);
        let remote = std::mem::take(&mut *self.remote.write().await);
        self.has_camera.store(false, Ordering::Release);

        let mut stopped = 0;
        for track in local.tracks().into_iter().chain(remote.tracks) {
            if track.is_live() && track.stop() {
                stopped += 1;
            } else {
                debug!(track_id = %track.id(), "Track already ended");
            }
        }

        if stopped > 0 {
            info!(stopped, "Media released");
        }
        stopped
    }
}

impl std::fmt::Debug for MediaManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaManager")
            .field("has_camera", &self.has_camera())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticDevices;

    fn manager(devices: SyntheticDevices) -> (Arc<SyntheticDevices>, MediaManager) {
        let devices = Arc::new(devices);
        let (events, _) = broadcast::channel(16);
        (devices.clone(), MediaManager::new(devices, events))
    }

    #[tokio::test]
    async fn acquire_prefers_audio_and_video() {
        let (devices, manager) = manager(SyntheticDevices::new());

        let acquired = manager.acquire(true).await.unwrap();
        assert!(acquired.has_camera());
        assert_eq!(devices.requests().await, vec![MediaConstraints::AUDIO_VIDEO]);
    }

    #[tokio::test]
    async fn acquire_falls_back_to_audio_only() {
        let (devices, manager) = manager(SyntheticDevices::new().without_camera());

        let acquired = manager.acquire(true).await.unwrap();
        assert!(!acquired.has_camera());
        assert_eq!(
            devices.requests().await,
            vec![MediaConstraints::AUDIO_VIDEO, MediaConstraints::AUDIO_ONLY]
        );
    }

    #[tokio::test]
    async fn acquire_without_video_preference_skips_camera() {
        let (devices, manager) = manager(SyntheticDevices::new());

        let acquired = manager.acquire(false).await.unwrap();
        assert!(!acquired.has_camera());
        assert_eq!(devices.requests().await, vec![MediaConstraints::AUDIO_ONLY]);
    }

    #[tokio::test]
    async fn acquire_failure_is_classified_and_acquires_nothing() {
        let (devices, manager) = manager(SyntheticDevices::new().deny_permission());

        let err = manager.acquire(true).await.unwrap_err();
        assert_eq!(err, AcquisitionError::PermissionDenied);
        assert!(devices.issued_tracks().await.is_empty());

        let (_, busy) = self::manager(SyntheticDevices::new().with_microphone_failure("NotReadableError"));
        assert_eq!(busy.acquire(true).await.unwrap_err(), AcquisitionError::DeviceBusy);
    }

    #[tokio::test]
    async fn install_after_cancel_stops_tracks() {
        let (devices, manager) = manager(SyntheticDevices::new());
        let cancel = CancellationToken::new();

        let acquired = manager.acquire(true).await.unwrap();
        cancel.cancel();

        let err = manager.install(acquired, &cancel).await.unwrap_err();
        assert!(matches!(err, CallError::Cancelled));
        assert!(devices.live_tracks().await.is_empty());
        assert!(manager.local_state().await.tracks().is_empty());
    }

    #[tokio::test]
    async fn toggle_video_without_camera_reports_no_camera() {
        let (devices, manager) = manager(SyntheticDevices::new().without_camera());
        let cancel = CancellationToken::new();
        let acquired = manager.acquire(true).await.unwrap();
        manager.install(acquired, &cancel).await.unwrap();
        let requests = devices.requests().await.len();

        assert_eq!(manager.toggle_video().await, ToggleOutcome::NoCamera);
        assert_eq!(manager.toggle_video().await, ToggleOutcome::NoCamera);
        assert_eq!(devices.requests().await.len(), requests);

        assert_eq!(manager.toggle_audio().await, ToggleOutcome::Disabled);
        assert_eq!(manager.toggle_audio().await, ToggleOutcome::Enabled);
    }

    #[tokio::test]
    async fn release_stops_each_track_once() {
        let (devices, manager) = manager(SyntheticDevices::new());
        let cancel = CancellationToken::new();
        let acquired = manager.acquire(true).await.unwrap();
        manager.install(acquired, &cancel).await.unwrap();

        let remote = Arc::new(MediaTrack::new(TrackSource::RemoteAudio, "remote"));
        manager.add_remote_track(remote.clone(), &cancel).await.unwrap();

        assert_eq!(manager.release().await, 3);
        assert_eq!(manager.release().await, 0);
        assert_eq!(manager.release().await, 0);

        assert!(devices.live_tracks().await.is_empty());
        assert!(!remote.is_live());
        assert!(!manager.has_camera());
    }

    #[tokio::test]
    async fn release_skips_tracks_already_ended() {
        let (_, manager) = manager(SyntheticDevices::new());
        let cancel = CancellationToken::new();
        let acquired = manager.acquire(true).await.unwrap();
        let local = manager.install(acquired, &cancel).await.unwrap();

        local.audio.as_ref().unwrap().stop();
        assert_eq!(manager.release().await, 1);
    }

    #[tokio::test]
    async fn remote_track_after_cancel_is_stopped() {
        let (_, manager) = manager(SyntheticDevices::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let remote = Arc::new(MediaTrack::new(TrackSource::RemoteVideo, "remote"));
        assert!(manager.add_remote_track(remote.clone(), &cancel).await.is_none());
        assert!(!remote.is_live());
    }
}
