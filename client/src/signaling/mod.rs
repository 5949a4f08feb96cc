//! Signaling Bridge
//!
//! A room-scoped publish/subscribe channel carrying [`SignalingMessage`]s.
//! Transports deliver every message published to a room to every subscriber
//! of that room; the bridge narrows that down to messages addressed to the
//! local user. Nothing is buffered or replayed.

mod memory;
mod websocket;

use std::sync::Arc;

use async_trait::async_trait;
use pc_common::{RoomId, SignalingMessage, UserId};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

pub use memory::MemorySignaling;
pub use websocket::{ConnectionStatus, WebSocketSignaling};

use crate::error::SignalingError;

/// Identifies one subscription to a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub room_id: RoomId,
    pub id: Uuid,
}

impl SubscriptionHandle {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            id: Uuid::new_v4(),
        }
    }
}

/// Room-scoped pub/sub transport.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Join `room_id`. Messages published to the room from now on arrive on
    /// the returned receiver until the subscription is released.
    async fn subscribe(
        &self,
        room_id: &RoomId,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<SignalingMessage>), SignalingError>;

    /// Fire-and-forget send to every subscriber of the room.
    async fn publish(&self, room_id: &RoomId, message: SignalingMessage)
        -> Result<(), SignalingError>;

    /// Release a subscription. Unknown or already released handles are
    /// ignored.
    async fn unsubscribe(&self, handle: &SubscriptionHandle);
}

/// Signaling as seen by one local user.
#[derive(Clone)]
pub struct SignalingBridge {
    transport: Arc<dyn SignalingTransport>,
    local_user: UserId,
}

impl SignalingBridge {
    pub fn new(transport: Arc<dyn SignalingTransport>, local_user: UserId) -> Self {
        Self {
            transport,
            local_user,
        }
    }

    pub const fn local_user(&self) -> &UserId {
        &self.local_user
    }

    pub async fn subscribe(&self, room_id: &RoomId) -> Result<Subscription, SignalingError> {
        let (handle, rx) = self.transport.subscribe(room_id).await?;
        debug!(room_id = %room_id, subscription = %handle.id, "Subscribed to room");
        Ok(Subscription {
            handle,
            local_user: self.local_user.clone(),
            rx,
        })
    }

    pub async fn publish(
        &self,
        room_id: &RoomId,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        debug!(room_id = %room_id, kind = message.kind(), to = %message.to(), "Publishing");
        self.transport.publish(room_id, message).await
    }

    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.transport.unsubscribe(handle).await;
        debug!(room_id = %handle.room_id, subscription = %handle.id, "Unsubscribed from room");
    }
}

impl std::fmt::Debug for SignalingBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingBridge")
            .field("local_user", &self.local_user)
            .finish_non_exhaustive()
    }
}

/// Inbound side of a room subscription, filtered to the local user.
#[derive(Debug)]
pub struct Subscription {
    handle: SubscriptionHandle,
    local_user: UserId,
    rx: mpsc::UnboundedReceiver<SignalingMessage>,
}

impl Subscription {
    pub const fn handle(&self) -> &SubscriptionHandle {
        &self.handle
    }

    /// Next message addressed to the local user. `None` once the transport
    /// dropped the subscription.
    pub async fn recv(&mut self) -> Option<SignalingMessage> {
        loop {
            let message = self.rx.recv().await?;
            if message.is_addressed_to(&self.local_user) {
                return Some(message);
            }
            debug!(
                kind = message.kind(),
                to = %message.to(),
                "Discarding message addressed to another user"
            );
        }
    }
}
