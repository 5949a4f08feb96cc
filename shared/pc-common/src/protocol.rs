//! Wire Protocol
//!
//! Two layers travel over the signaling transport:
//! - [`SignalingMessage`]: the call-level messages exchanged by the two
//!   parties of a call (`offer`, `answer`, `ice-candidate`, `hangup`).
//! - [`RelayClientFrame`] / [`RelayServerFrame`]: the envelope spoken with
//!   the relay, which scopes signaling messages to a room.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{RoomId, UserId};

/// Session description type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An SDP session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A single ICE candidate, in the browser's `RTCIceCandidateInit` shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Call signaling message exchanged between the two parties of a call.
///
/// The transport is room-scoped, not recipient-scoped: every member of the
/// room sees every message, so receivers must check [`Self::to`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Offer {
        from: UserId,
        to: UserId,
        payload: SessionDescription,
    },
    Answer {
        from: UserId,
        to: UserId,
        payload: SessionDescription,
    },
    IceCandidate {
        from: UserId,
        to: UserId,
        payload: IceCandidate,
    },
    Hangup {
        from: UserId,
        to: UserId,
    },
}

impl SignalingMessage {
    /// Sender of the message.
    pub const fn from(&self) -> &UserId {
        match self {
            Self::Offer { from, .. }
            | Self::Answer { from, .. }
            | Self::IceCandidate { from, .. }
            | Self::Hangup { from, .. } => from,
        }
    }

    /// Intended recipient of the message.
    pub const fn to(&self) -> &UserId {
        match self {
            Self::Offer { to, .. }
            | Self::Answer { to, .. }
            | Self::IceCandidate { to, .. }
            | Self::Hangup { to, .. } => to,
        }
    }

    /// Wire name of the message kind.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Hangup { .. } => "hangup",
        }
    }

    /// Whether this message is addressed to `user`.
    pub fn is_addressed_to(&self, user: &UserId) -> bool {
        self.to() == user
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Frames sent from a client to the relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayClientFrame {
    Ping,
    Join {
        room_id: RoomId,
    },
    Leave {
        room_id: RoomId,
    },
    Publish {
        room_id: RoomId,
        message: SignalingMessage,
    },
}

/// Frames sent from the relay to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayServerFrame {
    Ready {
        user_id: UserId,
    },
    Pong,
    Joined {
        room_id: RoomId,
    },
    Left {
        room_id: RoomId,
    },
    Message {
        room_id: RoomId,
        message: SignalingMessage,
    },
    Error {
        code: String,
        message: String,
    },
}
