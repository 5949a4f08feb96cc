//! Call Errors
//!
//! Acquisition failures are recoverable in place: the call moves to
//! `PermissionDenied` and the user may retry. Every other error is terminal
//! for the call and ends it through teardown.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::media::DeviceFailure;
use crate::negotiation::TransitionError;

/// Classified failure to acquire a camera, microphone or display surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionError {
    #[error("Permission to use the device was denied")]
    PermissionDenied,
    #[error("No matching capture device was found")]
    DeviceNotFound,
    #[error("The capture device is in use or could not be started")]
    DeviceBusy,
    #[error("No device satisfies the requested constraints")]
    ConstraintsUnsatisfiable,
    #[error("Media capture is not supported in this environment")]
    UnsupportedEnvironment,
}

impl AcquisitionError {
    /// Classify a raw device failure by its platform error name.
    ///
    /// Names follow the browser `DOMException` vocabulary, which native
    /// device backends mirror when reporting failures. Anything unknown is
    /// treated as an unsupported environment.
    pub fn classify(failure: &DeviceFailure) -> Self {
        match failure.name.as_str() {
            "NotAllowedError" | "PermissionDeniedError" | "SecurityError" => Self::PermissionDenied,
            "NotFoundError" | "DevicesNotFoundError" => Self::DeviceNotFound,
            "NotReadableError" | "TrackStartError" | "AbortError" => Self::DeviceBusy,
            "OverconstrainedError" | "ConstraintNotSatisfiedError" => {
                Self::ConstraintsUnsatisfiable
            }
            _ => Self::UnsupportedEnvironment,
        }
    }

    /// Whether re-invoking acquisition can succeed without the user changing
    /// hardware or environment.
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::PermissionDenied | Self::DeviceBusy)
    }

    /// Guidance text for the notification sink.
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Camera and microphone access was blocked. Allow access in your settings and try again."
            }
            Self::DeviceNotFound => {
                "No microphone was found. Connect a microphone to start a call."
            }
            Self::DeviceBusy => {
                "Your camera or microphone is being used by another application. Close it and try again."
            }
            Self::ConstraintsUnsatisfiable => {
                "Your devices do not support the requested call settings. Try a different device."
            }
            Self::UnsupportedEnvironment => {
                "Calls are not supported here. Switch to a supported browser or device."
            }
        }
    }

    pub const fn code(self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::DeviceNotFound => "device_not_found",
            Self::DeviceBusy => "device_busy",
            Self::ConstraintsUnsatisfiable => "constraints_unsatisfiable",
            Self::UnsupportedEnvironment => "unsupported_environment",
        }
    }
}

impl From<&DeviceFailure> for AcquisitionError {
    fn from(failure: &DeviceFailure) -> Self {
        Self::classify(failure)
    }
}

/// Failure while exchanging descriptions or candidates.
#[derive(Debug, Clone, Error)]
pub enum NegotiationError {
    #[error("Session description error: {0}")]
    Description(String),
    #[error("ICE candidate error: {0}")]
    Candidate(String),
    #[error("Peer connection error: {0}")]
    PeerConnection(String),
    #[error("Track error: {0}")]
    Track(String),
    #[error("Peer connection failed")]
    ConnectionFailed,
    #[error("No peer connection")]
    NoPeerConnection,
    #[error("Negotiation did not complete within {0:?}")]
    Timeout(Duration),
}

impl From<webrtc::Error> for NegotiationError {
    fn from(err: webrtc::Error) -> Self {
        Self::PeerConnection(err.to_string())
    }
}

/// Failure of the signaling transport.
#[derive(Debug, Clone, Error)]
pub enum SignalingError {
    #[error("Signaling transport error: {0}")]
    Transport(String),
    #[error("Signaling transport closed")]
    Closed,
    #[error("Signaling encode error: {0}")]
    Encode(String),
}

impl From<pc_common::Error> for SignalingError {
    fn from(err: pc_common::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

/// Errors surfaced by the call controller.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("A call is already in progress")]
    AlreadyActive,
    #[error("No call in progress")]
    NoActiveCall,
    #[error("Cannot call yourself")]
    SameParticipant,
    #[error("Call was torn down before the operation completed")]
    Cancelled,
}

impl CallError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Acquisition(e) => e.code(),
            Self::Negotiation(_) => "negotiation_error",
            Self::Signaling(_) => "signaling_error",
            Self::Transition(_) => "invalid_transition",
            Self::AlreadyActive => "already_active",
            Self::NoActiveCall => "no_active_call",
            Self::SameParticipant => "same_participant",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether the user can retry without starting a new call.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Acquisition(e) => e.is_retryable(),
            _ => false,
        }
    }
}
