//! Local and Remote Media
//!
//! Capture devices, track handles and the per-call media manager.

mod devices;
mod manager;
mod track;

pub use devices::{DeviceFailure, MediaConstraints, MediaDevices, SyntheticDevices};
pub use manager::{AcquiredMedia, LocalMediaState, MediaManager, RemoteMediaState, ToggleOutcome};
pub use track::{MediaTrack, ReadyState, TrackKind, TrackSource};
