//! Negotiation State Machine
//!
//! Call lifecycle states, deterministic role resolution and the
//! offer/answer/ICE exchange over the signaling bridge.
//!
//! ```text
//! Idle -> AcquiringMedia -> Negotiating -> Connected -> Ended
//!              |                                          ^
//!              +--> PermissionDenied --(retry)--+         |
//!                                                 any ----+
//! ```

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pc_common::{IceCandidate, RoomId, SessionDescription, SignalingMessage, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::error::NegotiationError;
use crate::peer::PeerConnection;
use crate::signaling::SignalingBridge;

/// Lifecycle state of a call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    #[default]
    Idle,
    AcquiringMedia,
    PermissionDenied,
    Negotiating,
    Connected,
    Ended,
}

/// Inputs that move a call between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateEvent {
    Start,
    MediaAcquired,
    MediaDenied,
    Retry,
    RemoteTrack,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Invalid transition: {event:?} in state {state:?}")]
    Invalid { state: CallState, event: StateEvent },
}

impl CallState {
    /// Apply an event to derive the next state
    pub const fn apply(self, event: StateEvent) -> Result<Self, TransitionError> {
        match (self, event) {
            (_, StateEvent::End) => Ok(Self::Ended),
            (Self::Idle | Self::Ended, StateEvent::Start)
            | (Self::PermissionDenied, StateEvent::Retry) => Ok(Self::AcquiringMedia),
            (Self::AcquiringMedia, StateEvent::MediaAcquired) => Ok(Self::Negotiating),
            (Self::AcquiringMedia, StateEvent::MediaDenied) => Ok(Self::PermissionDenied),
            (Self::Negotiating | Self::Connected, StateEvent::RemoteTrack) => Ok(Self::Connected),
            (state, event) => Err(TransitionError::Invalid { state, event }),
        }
    }

    /// Whether a call attempt currently holds this controller.
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Idle | Self::Ended)
    }
}

/// Which side creates the offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn resolve(local: &UserId, remote: &UserId) -> Self {
        if is_initiator(local, remote) {
            Self::Initiator
        } else {
            Self::Responder
        }
    }
}

/// The side whose identity sorts lower offers. Both sides compute the same
/// answer independently.
pub fn is_initiator(local: &UserId, remote: &UserId) -> bool {
    local < remote
}

/// Flag that lets exactly one caller through.
#[derive(Debug, Default)]
pub struct OneShot(AtomicBool);

impl OneShot {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Returns `true` for the first caller only.
    pub fn fire(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn has_fired(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// What the session should do after a signaling message was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Continue,
    RemoteHangup,
}

/// Drives the description and candidate exchange for one call attempt.
///
/// Owned by a single task, so its bookkeeping needs no locking.
pub struct Negotiator {
    room_id: RoomId,
    local: UserId,
    remote: UserId,
    role: Role,
    peer: Arc<dyn PeerConnection>,
    bridge: SignalingBridge,
    pending_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    /// The initiator's applied offer, kept for republishing.
    local_offer: Option<SessionDescription>,
    /// Local candidates published while the offer is unanswered.
    unanswered_candidates: Vec<IceCandidate>,
    /// Remote candidates already accepted, so resends are applied once.
    seen_candidates: HashSet<String>,
}

impl Negotiator {
    pub fn new(
        room_id: RoomId,
        remote: UserId,
        peer: Arc<dyn PeerConnection>,
        bridge: SignalingBridge,
    ) -> Self {
        let local = bridge.local_user().clone();
        let role = Role::resolve(&local, &remote);
        Self {
            room_id,
            local,
            remote,
            role,
            peer,
            bridge,
            pending_candidates: Vec::new(),
            remote_description_set: false,
            local_offer: None,
            unanswered_candidates: Vec::new(),
            seen_candidates: HashSet::new(),
        }
    }

    pub const fn role(&self) -> Role {
        self.role
    }

    pub const fn remote_description_set(&self) -> bool {
        self.remote_description_set
    }

    /// Whether the initiator has offered and not yet seen an answer.
    pub const fn awaiting_answer(&self) -> bool {
        self.local_offer.is_some() && !self.remote_description_set
    }

    /// Candidates waiting for the remote description.
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Start negotiating. The initiator creates, applies and publishes the
    /// offer; the responder waits for it.
    pub async fn begin(&mut self) -> Result<(), NegotiationError> {
        match self.role {
            Role::Initiator => {
                let offer = self.peer.create_offer().await?;
                self.peer.set_local_description(offer.clone()).await?;
                self.local_offer = Some(offer);
                info!(room_id = %self.room_id, remote = %self.remote, "Publishing offer");
                self.publish_offer().await;
            }
            Role::Responder => {
                debug!(room_id = %self.room_id, remote = %self.remote, "Waiting for offer");
            }
        }
        Ok(())
    }

    /// Handle one inbound message already addressed to the local user.
    pub async fn handle_signal(
        &mut self,
        message: SignalingMessage,
    ) -> Result<SignalOutcome, NegotiationError> {
        if message.from() != &self.remote {
            debug!(from = %message.from(), kind = message.kind(), "Ignoring message from unexpected sender");
            return Ok(SignalOutcome::Continue);
        }

        match message {
            SignalingMessage::Offer { payload, .. } => self.handle_offer(payload).await?,
            SignalingMessage::Answer { payload, .. } => self.handle_answer(payload).await?,
            SignalingMessage::IceCandidate { payload, .. } => {
                self.handle_candidate(payload).await?;
            }
            SignalingMessage::Hangup { .. } => {
                info!(room_id = %self.room_id, remote = %self.remote, "Remote hangup received");
                return Ok(SignalOutcome::RemoteHangup);
            }
        }
        Ok(SignalOutcome::Continue)
    }

    async fn handle_offer(&mut self, offer: SessionDescription) -> Result<(), NegotiationError> {
        if self.role == Role::Initiator {
            warn!(remote = %self.remote, "Ignoring offer received as initiator");
            return Ok(());
        }
        if self.remote_description_set {
            debug!("Ignoring duplicate offer");
            return Ok(());
        }

        self.apply_remote_description(offer).await?;

        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        info!(room_id = %self.room_id, remote = %self.remote, "Publishing answer");
        self.publish(SignalingMessage::Answer {
            from: self.local.clone(),
            to: self.remote.clone(),
            payload: answer,
        })
        .await;
        Ok(())
    }

    async fn handle_answer(&mut self, answer: SessionDescription) -> Result<(), NegotiationError> {
        if self.role == Role::Responder {
            warn!(remote = %self.remote, "Ignoring answer received as responder");
            return Ok(());
        }
        if self.remote_description_set {
            debug!("Ignoring duplicate answer");
            return Ok(());
        }

        self.apply_remote_description(answer).await
    }

    async fn handle_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if !self.seen_candidates.insert(candidate.candidate.clone()) {
            debug!("Ignoring duplicate ICE candidate");
            return Ok(());
        }
        if self.remote_description_set {
            self.peer.add_ice_candidate(candidate).await
        } else {
            self.pending_candidates.push(candidate);
            debug!(
                queued = self.pending_candidates.len(),
                "Queued ICE candidate until remote description is set"
            );
            Ok(())
        }
    }

    async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.peer.set_remote_description(description).await?;
        self.remote_description_set = true;
        self.unanswered_candidates.clear();

        let pending = std::mem::take(&mut self.pending_candidates);
        if !pending.is_empty() {
            debug!(count = pending.len(), "Applying queued ICE candidates");
        }
        for candidate in pending {
            self.peer.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    /// Publish the offer, and the candidates sent with it, again while no
    /// answer has arrived. The relay keeps no history, so a responder that
    /// subscribed late only sees a resend.
    pub async fn resend_offer(&self) {
        if !self.awaiting_answer() {
            return;
        }
        debug!(
            room_id = %self.room_id,
            remote = %self.remote,
            candidates = self.unanswered_candidates.len(),
            "Republishing unanswered offer"
        );
        self.publish_offer().await;
        for candidate in &self.unanswered_candidates {
            self.send_candidate(candidate.clone()).await;
        }
    }

    async fn publish_offer(&self) {
        let Some(offer) = self.local_offer.clone() else {
            return;
        };
        self.publish(SignalingMessage::Offer {
            from: self.local.clone(),
            to: self.remote.clone(),
            payload: offer,
        })
        .await;
    }

    /// Publish a locally discovered candidate to the remote side.
    pub async fn publish_candidate(&mut self, candidate: IceCandidate) {
        if self.awaiting_answer() {
            self.unanswered_candidates.push(candidate.clone());
        }
        self.send_candidate(candidate).await;
    }

    async fn send_candidate(&self, candidate: IceCandidate) {
        self.publish(SignalingMessage::IceCandidate {
            from: self.local.clone(),
            to: self.remote.clone(),
            payload: candidate,
        })
        .await;
    }

    async fn publish(&self, message: SignalingMessage) {
        let kind = message.kind();
        if let Err(e) = self.bridge.publish(&self.room_id, message).await {
            warn!(error = %e, kind, room_id = %self.room_id, "Failed to publish signaling message");
        }
    }
}
