//! Peer Connection Seam
//!
//! The negotiation state machine drives a [`PeerConnection`] without knowing
//! which media stack backs it. Asynchronous happenings on the connection
//! (candidates, remote tracks, state changes) arrive as [`PeerEvent`]s on the
//! channel handed to the factory.

use std::sync::Arc;

use async_trait::async_trait;
use pc_common::{IceCandidate, SessionDescription};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::media::MediaTrack;

/// Transport-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local candidate was discovered.
    IceCandidate(IceCandidate),
    /// Remote media arrived.
    RemoteTrack(Arc<MediaTrack>),
    StateChanged(PeerState),
}

/// One peer connection.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Attach the local microphone and the outbound video source. A `None`
    /// video still negotiates a video sender so it can be filled later.
    async fn attach_local_tracks(
        &self,
        audio: Arc<MediaTrack>,
        video: Option<Arc<MediaTrack>>,
    ) -> Result<(), NegotiationError>;

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Swap the track feeding the video sender without renegotiating.
    async fn replace_video_track(
        &self,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), NegotiationError>;

    /// Detach every sender's track. Failures are logged per sender.
    async fn detach_senders(&self);

    async fn close(&self) -> Result<(), NegotiationError>;
}

/// Builds peer connections wired to an event channel.
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}
