//! Room Hub
//!
//! Room-scoped fan-out. Each WebSocket connection joins rooms by id; a message
//! published to a room is delivered to every other connection in it. Nothing
//! is buffered for members that join later.

use std::collections::HashMap;

use dashmap::DashMap;
use pc_common::{RelayServerFrame, RoomId, SignalingMessage, UserId};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::RelayError;

/// A connection's presence in one room.
#[derive(Debug, Clone)]
struct Member {
    user_id: UserId,
    tx: mpsc::Sender<RelayServerFrame>,
}

/// All rooms with at least one member.
#[derive(Debug)]
pub struct RoomHub {
    rooms: DashMap<RoomId, HashMap<Uuid, Member>>,
    max_members: usize,
}

impl RoomHub {
    #[must_use]
    pub fn new(max_members: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            max_members,
        }
    }

    /// Add a connection to a room. Joining twice is a no-op.
    pub fn join(
        &self,
        room_id: &RoomId,
        connection_id: Uuid,
        user_id: &UserId,
        tx: mpsc::Sender<RelayServerFrame>,
    ) -> Result<(), RelayError> {
        let mut members = self.rooms.entry(room_id.clone()).or_default();

        if members.contains_key(&connection_id) {
            return Ok(());
        }
        if members.len() >= self.max_members {
            return Err(RelayError::RoomFull {
                room_id: room_id.clone(),
                max_members: self.max_members,
            });
        }

        members.insert(
            connection_id,
            Member {
                user_id: user_id.clone(),
                tx,
            },
        );
        debug!(room_id = %room_id, user_id = %user_id, members = members.len(), "Joined room");
        Ok(())
    }

    /// Remove a connection from a room. Returns whether it was a member.
    pub fn leave(&self, room_id: &RoomId, connection_id: Uuid) -> bool {
        let removed = self
            .rooms
            .get_mut(room_id)
            .is_some_and(|mut members| members.remove(&connection_id).is_some());

        self.rooms.remove_if(room_id, |_, members| members.is_empty());
        removed
    }

    /// Deliver `message` to every other member of the room.
    ///
    /// The message's sender must be the connection's identity and the
    /// connection must have joined the room. Returns how many members the
    /// message was handed to.
    pub fn publish(
        &self,
        room_id: &RoomId,
        connection_id: Uuid,
        user_id: &UserId,
        message: SignalingMessage,
    ) -> Result<usize, RelayError> {
        if message.from() != user_id {
            return Err(RelayError::IdentityMismatch {
                claimed: message.from().clone(),
                actual: user_id.clone(),
            });
        }

        let recipients: Vec<Member> = {
            let members = self
                .rooms
                .get(room_id)
                .filter(|members| members.contains_key(&connection_id))
                .ok_or_else(|| RelayError::NotJoined(room_id.clone()))?;
            members
                .iter()
                .filter(|(id, _)| **id != connection_id)
                .map(|(_, member)| member.clone())
                .collect()
        };

        let frame = RelayServerFrame::Message {
            room_id: room_id.clone(),
            message,
        };
        let mut delivered = 0;
        for member in recipients {
            match member.tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(room_id = %room_id, user_id = %member.user_id, error = %e, "Dropped frame for member");
                }
            }
        }

        debug!(room_id = %room_id, kind = frame_kind(&frame), delivered, "Message relayed");
        Ok(delivered)
    }

    /// Drop a closed connection from every room. Returns the rooms it left.
    pub fn remove_connection(&self, connection_id: Uuid) -> Vec<RoomId> {
        let mut left = Vec::new();
        for mut entry in self.rooms.iter_mut() {
            if entry.value_mut().remove(&connection_id).is_some() {
                left.push(entry.key().clone());
            }
        }
        for room_id in &left {
            self.rooms.remove_if(room_id, |_, members| members.is_empty());
        }
        left
    }

    pub fn member_count(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map_or(0, |members| members.len())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

fn frame_kind(frame: &RelayServerFrame) -> &'static str {
    match frame {
        RelayServerFrame::Message { message, .. } => message.kind(),
        _ => "other",
    }
}
