//! Relay Errors

use pc_common::{RelayServerFrame, RoomId, UserId};
use thiserror::Error;

/// Errors reported back to a client as an `error` frame.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A published message claims a sender other than the connection's identity.
    #[error("Message sender {claimed} does not match connection identity {actual}")]
    IdentityMismatch {
        /// Sender named in the message.
        claimed: UserId,
        /// Identity the connection was opened with.
        actual: UserId,
    },

    /// The room already holds the maximum number of connections.
    #[error("Room {room_id} is full (max: {max_members})")]
    RoomFull {
        room_id: RoomId,
        max_members: usize,
    },

    /// Publishing to a room the connection has not joined.
    #[error("Not joined to room {0}")]
    NotJoined(RoomId),

    /// The client frame could not be decoded.
    #[error("Invalid frame: {0}")]
    InvalidFrame(#[from] serde_json::Error),
}

impl RelayError {
    /// Stable machine-readable code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::IdentityMismatch { .. } => "identity_mismatch",
            Self::RoomFull { .. } => "room_full",
            Self::NotJoined(_) => "not_joined",
            Self::InvalidFrame(_) => "invalid_frame",
        }
    }

    pub fn to_frame(&self) -> RelayServerFrame {
        RelayServerFrame::Error {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_carries_code_and_message() {
        let err = RelayError::RoomFull {
            room_id: "room1".into(),
            max_members: 2,
        };

        match err.to_frame() {
            RelayServerFrame::Error { code, message } => {
                assert_eq!(code, "room_full");
                assert!(message.contains("room1"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn invalid_json_maps_to_invalid_frame() {
        let err: RelayError = serde_json::from_str::<pc_common::RelayClientFrame>("{")
            .unwrap_err()
            .into();
        assert_eq!(err.code(), "invalid_frame");
    }
}
