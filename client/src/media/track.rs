//! Media Tracks
//!
//! A [`MediaTrack`] is a handle on one hardware or remote media source.
//! Its ready state only ever moves `Live -> Ended`, and the transition is
//! what releases the underlying device, so a track is released exactly once
//! no matter how many callers stop it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use uuid::Uuid;

use crate::events::TrackInfo;

/// The kind of media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Where a track's media comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackSource {
    Microphone,
    Camera,
    /// Display surface captured for screen sharing.
    Screen,
    RemoteAudio,
    RemoteVideo,
}

impl TrackSource {
    #[must_use]
    pub const fn kind(&self) -> TrackKind {
        match self {
            Self::Microphone | Self::RemoteAudio => TrackKind::Audio,
            Self::Camera | Self::Screen | Self::RemoteVideo => TrackKind::Video,
        }
    }

    #[must_use]
    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteAudio | Self::RemoteVideo)
    }
}

/// Track lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Live,
    Ended,
}

type StopHook = Box<dyn Fn() + Send + Sync>;

/// One local or remote media track.
pub struct MediaTrack {
    id: String,
    label: String,
    source: TrackSource,
    enabled: AtomicBool,
    state: watch::Sender<ReadyState>,
    on_stop: Option<StopHook>,
}

impl MediaTrack {
    /// Create a live, enabled track with a fresh id.
    pub fn new(source: TrackSource, label: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), source, label)
    }

    pub fn with_id(id: impl Into<String>, source: TrackSource, label: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ReadyState::Live);
        Self {
            id: id.into(),
            label: label.into(),
            source,
            enabled: AtomicBool::new(true),
            state,
            on_stop: None,
        }
    }

    /// Register the device release hook. It runs once, on the
    /// `Live -> Ended` transition.
    #[must_use]
    pub fn with_stop_hook(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Box::new(hook));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub const fn source(&self) -> TrackSource {
        self.source
    }

    pub const fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn ready_state(&self) -> ReadyState {
        *self.state.borrow()
    }

    pub fn is_live(&self) -> bool {
        self.ready_state() == ReadyState::Live
    }

    /// Stop the track.
    ///
    /// Returns `true` only for the call that ended it; stopping an ended
    /// track is a no-op.
    pub fn stop(&self) -> bool {
        let stopped = self.state.send_if_modified(|state| {
            if *state == ReadyState::Live {
                *state = ReadyState::Ended;
                true
            } else {
                false
            }
        });

        if stopped {
            if let Some(hook) = &self.on_stop {
                hook();
            }
        }
        stopped
    }

    /// Resolves once the track has ended, whoever ended it.
    pub async fn ended(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ReadyState::Ended).await;
    }

    pub fn info(&self) -> TrackInfo {
        TrackInfo {
            id: self.id.clone(),
            kind: self.kind(),
            source: self.source,
            label: self.label.clone(),
            enabled: self.is_enabled(),
            live: self.is_live(),
        }
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("enabled", &self.is_enabled())
            .field("state", &self.ready_state())
            .finish_non_exhaustive()
    }
}
