//! Call Events
//!
//! Events broadcast by the controller for a UI layer to render.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CallError;
use crate::media::{TrackKind, TrackSource};
use crate::negotiation::CallState;

/// Snapshot of one track for rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: String,
    pub kind: TrackKind,
    pub source: TrackSource,
    pub label: String,
    pub enabled: bool,
    pub live: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CallEvent {
    StateChanged {
        state: CallState,
    },
    LocalStreamReady {
        tracks: Vec<TrackInfo>,
    },
    /// Sent for every newly received remote track, with all remote tracks.
    RemoteStreamReady {
        tracks: Vec<TrackInfo>,
    },
    /// First remote media arrived. Sent once per call.
    Connected {
        started_at: DateTime<Utc>,
    },
    DurationTick {
        seconds: u64,
    },
    ScreenShareChanged {
        active: bool,
    },
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

impl From<&CallError> for CallEvent {
    fn from(err: &CallError) -> Self {
        let message = match err {
            CallError::Acquisition(kind) => kind.user_message().to_string(),
            other => other.to_string(),
        };
        Self::Error {
            code: err.code().to_string(),
            message,
            retryable: err.is_retryable(),
        }
    }
}
