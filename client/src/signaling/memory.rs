//! In-process signaling transport.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use pc_common::{RoomId, SignalingMessage};
use tokio::sync::mpsc;

use super::{SignalingTransport, SubscriptionHandle};
use crate::error::SignalingError;

type Subscribers = HashMap<uuid::Uuid, mpsc::UnboundedSender<SignalingMessage>>;

/// Room bus shared by every clone. Both parties of a call can hold clones of
/// the same bus when they live in one process.
#[derive(Debug, Clone, Default)]
pub struct MemorySignaling {
    rooms: Arc<DashMap<RoomId, Subscribers>>,
}

impl MemorySignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map_or(0, |room| room.len())
    }
}

#[async_trait]
impl SignalingTransport for MemorySignaling {
    async fn subscribe(
        &self,
        room_id: &RoomId,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<SignalingMessage>), SignalingError>
    {
        let handle = SubscriptionHandle::new(room_id.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        self.rooms
            .entry(room_id.clone())
            .or_default()
            .insert(handle.id, tx);
        Ok((handle, rx))
    }

    async fn publish(
        &self,
        room_id: &RoomId,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        if let Some(room) = self.rooms.get(room_id) {
            for tx in room.values() {
                let _ = tx.send(message.clone());
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        if let Some(mut room) = self.rooms.get_mut(&handle.room_id) {
            room.remove(&handle.id);
        }
        self.rooms
            .remove_if(&handle.room_id, |_, subscribers| subscribers.is_empty());
    }
}
