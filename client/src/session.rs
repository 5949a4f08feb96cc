//! Call Session Controller
//!
//! The façade the application drives. One controller runs at most one call
//! attempt at a time and owns everything that attempt acquires: local media,
//! the peer connection, the room subscription, the negotiation driver and
//! the duration timer. Every exit path (local hangup, remote hangup, fatal
//! negotiation error) funnels into one teardown routine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pc_common::{RoomId, SignalingMessage, UserId};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::CallConfig;
use crate::error::{CallError, NegotiationError};
use crate::events::CallEvent;
use crate::media::{MediaDevices, MediaManager, MediaTrack, ToggleOutcome};
use crate::negotiation::{
    CallState, Negotiator, OneShot, SignalOutcome, StateEvent, TransitionError,
};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerState};
use crate::rtc::WebRtcPeerFactory;
use crate::signaling::{
    SignalingBridge, SignalingTransport, Subscription, SubscriptionHandle, WebSocketSignaling,
};

/// One call attempt, as exposed to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSession {
    pub room_id: RoomId,
    pub local_user_id: UserId,
    pub remote_user_id: UserId,
    pub state: CallState,
    /// Set on the first transition to `Connected`.
    pub started_at: Option<DateTime<Utc>>,
    pub has_camera: bool,
}

/// Everything the current attempt holds that teardown must release.
#[derive(Default)]
struct CallResources {
    attempt: Option<Uuid>,
    cancel: CancellationToken,
    peer: Option<Arc<dyn PeerConnection>>,
    subscription: Option<SubscriptionHandle>,
    driver: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

struct ControllerInner {
    config: CallConfig,
    bridge: SignalingBridge,
    peers: Arc<dyn PeerConnectionFactory>,
    media: Arc<MediaManager>,
    events: broadcast::Sender<CallEvent>,
    state: watch::Sender<CallState>,
    session: RwLock<Option<CallSession>>,
    resources: Mutex<CallResources>,
    tearing_down: AtomicBool,
}

/// How the negotiation driver stopped.
enum DriverExit {
    Cancelled,
    RemoteHangup,
    Failed(CallError),
}

/// Handle to the call controller. Clones share one controller.
#[derive(Clone)]
pub struct CallController {
    inner: Arc<ControllerInner>,
}

impl CallController {
    pub fn new(
        config: CallConfig,
        local_user: UserId,
        transport: Arc<dyn SignalingTransport>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
    ) -> Self {
        let config = config.sanitized();
        let (events, _) = broadcast::channel(config.event_buffer);
        let (state, _) = watch::channel(CallState::Idle);
        let media = Arc::new(MediaManager::new(devices, events.clone()));

        Self {
            inner: Arc::new(ControllerInner {
                config,
                bridge: SignalingBridge::new(transport, local_user),
                peers,
                media,
                events,
                state,
                session: RwLock::new(None),
                resources: Mutex::new(CallResources::default()),
                tearing_down: AtomicBool::new(false),
            }),
        }
    }

    /// Controller whose peer connections use the `webrtc` stack with the
    /// configured ICE servers.
    pub fn with_webrtc(
        config: CallConfig,
        local_user: UserId,
        transport: Arc<dyn SignalingTransport>,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<Self, CallError> {
        let peers = Arc::new(WebRtcPeerFactory::new(config.ice_servers())?);
        Ok(Self::new(config, local_user, transport, devices, peers))
    }

    /// Controller signaling through the relay at `config.signaling_url`,
    /// with `webrtc` peer connections.
    pub fn with_relay(
        config: CallConfig,
        local_user: UserId,
        devices: Arc<dyn MediaDevices>,
    ) -> Result<Self, CallError> {
        let transport = WebSocketSignaling::from_config(&config, local_user.clone())?;
        Self::with_webrtc(config, local_user, Arc::new(transport), devices)
    }

    pub fn local_user(&self) -> &UserId {
        self.inner.bridge.local_user()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.inner.events.subscribe()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> CallState {
        *self.inner.state.borrow()
    }

    pub async fn session(&self) -> Option<CallSession> {
        self.inner.session.read().await.clone()
    }

    pub fn media(&self) -> &Arc<MediaManager> {
        &self.inner.media
    }

    /// Whether the current attempt holds a peer connection.
    pub async fn has_peer_connection(&self) -> bool {
        self.inner.resources.lock().await.peer.is_some()
    }

    /// Start a call with `remote_user_id` in `room_id`.
    ///
    /// Returns once local media is installed and negotiation is running, or
    /// with the error that stopped it. An acquisition error leaves the call
    /// in `PermissionDenied`, from where [`Self::retry_media`] can resume it.
    #[instrument(skip(self), fields(local = %self.local_user()))]
    pub async fn start_call(&self, room_id: RoomId, remote_user_id: UserId) -> Result<(), CallError> {
        if &remote_user_id == self.local_user() {
            return Err(CallError::SameParticipant);
        }

        let (cancel, attempt) = {
            let mut resources = self.inner.resources.lock().await;
            self.transition(StateEvent::Start)
                .await
                .map_err(|_| CallError::AlreadyActive)?;

            let attempt = Uuid::new_v4();
            *resources = CallResources {
                attempt: Some(attempt),
                ..CallResources::default()
            };
            *self.inner.session.write().await = Some(CallSession {
                room_id,
                local_user_id: self.local_user().clone(),
                remote_user_id,
                state: CallState::AcquiringMedia,
                started_at: None,
                has_camera: false,
            });
            (resources.cancel.clone(), attempt)
        };

        info!(%attempt, "Call started");
        self.acquire_and_connect(cancel, attempt).await
    }

    /// Re-run acquisition after it failed, without recreating the session.
    #[instrument(skip(self))]
    pub async fn retry_media(&self) -> Result<(), CallError> {
        let (cancel, attempt) = {
            let resources = self.inner.resources.lock().await;
            self.transition(StateEvent::Retry).await?;
            let attempt = resources.attempt.ok_or(CallError::NoActiveCall)?;
            (resources.cancel.clone(), attempt)
        };

        info!(%attempt, "Retrying media acquisition");
        self.acquire_and_connect(cancel, attempt).await
    }

    async fn acquire_and_connect(
        &self,
        cancel: CancellationToken,
        attempt: Uuid,
    ) -> Result<(), CallError> {
        let acquired = match self.inner.media.acquire(self.inner.config.prefer_video).await {
            Ok(acquired) => acquired,
            Err(kind) => {
                let resources = self.inner.resources.lock().await;
                if cancel.is_cancelled() || resources.attempt != Some(attempt) {
                    return Err(CallError::Cancelled);
                }
                self.transition(StateEvent::MediaDenied)
                    .await
                    .map_err(|_| CallError::Cancelled)?;
                drop(resources);
                let err = CallError::from(kind);
                self.emit(CallEvent::from(&err));
                return Err(err);
            }
        };

        let local = self.inner.media.install(acquired, &cancel).await?;
        {
            let resources = self.inner.resources.lock().await;
            if cancel.is_cancelled() || resources.attempt != Some(attempt) {
                debug!(%attempt, "Attempt superseded after media install");
                return Err(CallError::Cancelled);
            }
            let has_camera = self.inner.media.has_camera();
            if let Some(session) = self.inner.session.write().await.as_mut() {
                session.has_camera = has_camera;
            }
            self.emit(CallEvent::LocalStreamReady {
                tracks: local.infos(),
            });
            self.transition(StateEvent::MediaAcquired)
                .await
                .map_err(|_| CallError::Cancelled)?;
        }

        match self.connect(&cancel, attempt).await {
            Ok(()) => Ok(()),
            Err(CallError::Cancelled) => Err(CallError::Cancelled),
            Err(err) => {
                error!(error = %err, "Failed to set up negotiation");
                self.emit(CallEvent::from(&err));
                self.teardown_attempt(Some(attempt)).await;
                Err(err)
            }
        }
    }

    /// Build the peer connection, subscribe to the room and spawn the
    /// negotiation driver. Each resource is adopted under the resources lock
    /// so a concurrent teardown either releases it or it is released here.
    async fn connect(&self, cancel: &CancellationToken, attempt: Uuid) -> Result<(), CallError> {
        let (room_id, remote) = {
            let session = self.inner.session.read().await;
            let session = session.as_ref().ok_or(CallError::Cancelled)?;
            (session.room_id.clone(), session.remote_user_id.clone())
        };

        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let peer = self.inner.peers.create(peer_tx).await?;
        {
            let mut resources = self.inner.resources.lock().await;
            if cancel.is_cancelled() || resources.attempt != Some(attempt) {
                drop(resources);
                let _ = peer.close().await;
                return Err(CallError::Cancelled);
            }
            resources.peer = Some(peer.clone());
        }

        let local = self.inner.media.local_state().await;
        let audio = local.audio.clone().ok_or(CallError::Cancelled)?;
        peer.attach_local_tracks(audio, local.outbound_video())
            .await?;

        let subscription = self.inner.bridge.subscribe(&room_id).await?;
        {
            let mut resources = self.inner.resources.lock().await;
            if cancel.is_cancelled() || resources.attempt != Some(attempt) {
                drop(resources);
                self.inner.bridge.unsubscribe(subscription.handle()).await;
                return Err(CallError::Cancelled);
            }
            resources.subscription = Some(subscription.handle().clone());
        }

        let negotiator = Negotiator::new(room_id, remote, peer, self.inner.bridge.clone());
        info!(role = ?negotiator.role(), "Negotiation starting");

        let controller = self.clone();
        let driver_cancel = cancel.clone();
        let driver = tokio::spawn(async move {
            controller
                .drive(negotiator, subscription, peer_rx, driver_cancel, attempt)
                .await;
        });
        self.inner.resources.lock().await.driver = Some(driver);
        Ok(())
    }

    /// Negotiation driver: one task per attempt, the sole owner of the
    /// negotiator. Exits when the attempt is cancelled.
    async fn drive(
        &self,
        negotiator: Negotiator,
        subscription: Subscription,
        peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        cancel: CancellationToken,
        attempt: Uuid,
    ) {
        let exit = self
            .run_negotiation(negotiator, subscription, peer_events, &cancel)
            .await;

        match exit {
            DriverExit::Cancelled => debug!(%attempt, "Negotiation driver stopped"),
            DriverExit::RemoteHangup => self.teardown_attempt(Some(attempt)).await,
            DriverExit::Failed(_) if cancel.is_cancelled() => {}
            DriverExit::Failed(err) => {
                error!(error = %err, "Call failed");
                self.emit(CallEvent::from(&err));
                self.teardown_attempt(Some(attempt)).await;
            }
        }
    }

    async fn run_negotiation(
        &self,
        mut negotiator: Negotiator,
        mut subscription: Subscription,
        mut peer_events: mpsc::UnboundedReceiver<PeerEvent>,
        cancel: &CancellationToken,
    ) -> DriverExit {
        let begun = tokio::select! {
            biased;
            () = cancel.cancelled() => return DriverExit::Cancelled,
            result = negotiator.begin() => result,
        };
        if let Err(e) = begun {
            return DriverExit::Failed(e.into());
        }

        let connected = OneShot::new();
        let timeout = self.inner.config.negotiation_timeout;
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut signaling_open = true;

        let every = self.inner.config.offer_resend_interval;
        let mut resend = tokio::time::interval_at(Instant::now() + every, every);
        resend.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let expired = async {
                match deadline {
                    Some(deadline) if !connected.has_fired() => {
                        tokio::time::sleep_until(deadline).await;
                    }
                    _ => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                biased;
                () = cancel.cancelled() => return DriverExit::Cancelled,
                () = expired => {
                    let limit = timeout.unwrap_or_default();
                    warn!(?limit, "Call did not connect in time");
                    return DriverExit::Failed(NegotiationError::Timeout(limit).into());
                }
                message = subscription.recv(), if signaling_open => match message {
                    Some(message) => match negotiator.handle_signal(message).await {
                        Ok(SignalOutcome::Continue) => {}
                        Ok(SignalOutcome::RemoteHangup) => return DriverExit::RemoteHangup,
                        Err(e) => return DriverExit::Failed(e.into()),
                    },
                    None => {
                        warn!("Signaling subscription closed");
                        signaling_open = false;
                    }
                },
                event = peer_events.recv() => match event {
                    Some(PeerEvent::IceCandidate(candidate)) => {
                        negotiator.publish_candidate(candidate).await;
                    }
                    Some(PeerEvent::RemoteTrack(track)) => {
                        self.on_remote_track(track, cancel, &connected).await;
                    }
                    Some(PeerEvent::StateChanged(PeerState::Failed)) => {
                        return DriverExit::Failed(NegotiationError::ConnectionFailed.into());
                    }
                    Some(PeerEvent::StateChanged(state)) => {
                        debug!(?state, "Peer state changed");
                    }
                    None => return DriverExit::Cancelled,
                },
                _ = resend.tick(), if negotiator.awaiting_answer() => {
                    negotiator.resend_offer().await;
                }
            }
        }
    }

    async fn on_remote_track(
        &self,
        track: Arc<MediaTrack>,
        cancel: &CancellationToken,
        connected: &OneShot,
    ) {
        let Some(tracks) = self.inner.media.add_remote_track(track, cancel).await else {
            return;
        };
        self.emit(CallEvent::RemoteStreamReady { tracks });

        if !connected.fire() {
            return;
        }
        if self.transition(StateEvent::RemoteTrack).await.is_err() {
            return;
        }

        let started_at = Utc::now();
        if let Some(session) = self.inner.session.write().await.as_mut() {
            session.started_at = Some(started_at);
        }
        info!(%started_at, "Call connected");
        self.emit(CallEvent::Connected { started_at });

        let timer = self.spawn_duration_timer(cancel.clone());
        let mut resources = self.inner.resources.lock().await;
        if cancel.is_cancelled() {
            timer.abort();
        } else {
            resources.timer = Some(timer);
        }
    }

    /// Emits the elapsed whole seconds, starting at 0, each value once.
    fn spawn_duration_timer(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let events = self.inner.events.clone();
        let tick = self.inner.config.duration_tick;

        tokio::spawn(async move {
            let started = Instant::now();
            let mut interval = tokio::time::interval(tick);
            let mut last = None;
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let seconds = started.elapsed().as_secs();
                        if last != Some(seconds) {
                            last = Some(seconds);
                            let _ = events.send(CallEvent::DurationTick { seconds });
                        }
                    }
                }
            }
        })
    }

    #[instrument(skip(self))]
    pub async fn toggle_audio(&self) -> ToggleOutcome {
        self.inner.media.toggle_audio().await
    }

    #[instrument(skip(self))]
    pub async fn toggle_video(&self) -> ToggleOutcome {
        self.inner.media.toggle_video().await
    }

    /// Start or stop screen sharing. Returns whether a share is active
    /// afterwards. Failures are reported but never end the call.
    #[instrument(skip(self))]
    pub async fn toggle_screen_share(&self) -> Result<bool, CallError> {
        let (peer, cancel) = {
            let resources = self.inner.resources.lock().await;
            let peer = resources.peer.clone().ok_or(CallError::NoActiveCall)?;
            (peer, resources.cancel.clone())
        };

        let result = if self.inner.media.is_screen_sharing().await {
            self.inner
                .media
                .stop_screen_share(peer.as_ref())
                .await
                .map(|_| false)
        } else {
            self.inner
                .media
                .start_screen_share(peer, &cancel)
                .await
                .map(|()| true)
        };

        if let Err(err) = &result {
            if !matches!(err, CallError::Cancelled) {
                warn!(error = %err, "Screen share toggle failed");
                self.emit(CallEvent::from(err));
            }
        }
        result
    }

    /// Tell the peer the call is over, then tear down locally.
    #[instrument(skip(self))]
    pub async fn hangup(&self) {
        if !self.begin_teardown() {
            debug!("Hangup ignored, teardown already in progress");
            return;
        }

        let session = self.inner.session.read().await.clone();
        if let Some(session) = session {
            let message = SignalingMessage::Hangup {
                from: session.local_user_id,
                to: session.remote_user_id,
            };
            if let Err(e) = self.inner.bridge.publish(&session.room_id, message).await {
                warn!(error = %e, "Failed to publish hangup");
            }
        }

        self.finish_teardown(None).await;
    }

    /// The peer hung up: tear down without publishing another hangup.
    #[instrument(skip(self))]
    pub async fn handle_remote_hangup(&self) {
        self.teardown().await;
    }

    /// Release everything the current attempt holds. Safe from any state and
    /// safe to call concurrently; overlapping calls return immediately.
    pub async fn teardown(&self) {
        self.teardown_attempt(None).await;
    }

    /// Tear down, but only if `attempt` (when given) is still the current
    /// one. Keeps a stale driver from ending a newer call.
    async fn teardown_attempt(&self, attempt: Option<Uuid>) {
        if !self.begin_teardown() {
            debug!("Teardown already in progress");
            return;
        }
        self.finish_teardown(attempt).await;
    }

    fn begin_teardown(&self) -> bool {
        self.inner
            .tearing_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn finish_teardown(&self, attempt: Option<Uuid>) {
        let resources = {
            let mut resources = self.inner.resources.lock().await;
            if attempt.is_some() && resources.attempt != attempt {
                self.inner.tearing_down.store(false, Ordering::Release);
                return;
            }
            resources.cancel.cancel();
            std::mem::take(&mut *resources)
        };

        if let Some(timer) = resources.timer {
            timer.abort();
        }

        let released = self.inner.media.release().await;

        if let Some(peer) = resources.peer {
            peer.detach_senders().await;
            if let Err(e) = peer.close().await {
                warn!(error = %e, "Failed to close peer connection");
            }
        }

        if let Some(handle) = resources.subscription {
            self.inner.bridge.unsubscribe(&handle).await;
        }

        // The driver exits on its own once cancelled; it may be the caller.
        drop(resources.driver);

        // Held until Ended is published so a new call cannot start in between.
        let _guard = self.inner.resources.lock().await;
        *self.inner.session.write().await = None;
        if let Err(e) = self.transition(StateEvent::End).await {
            warn!(error = %e, "Unexpected transition failure during teardown");
        }

        info!(released, "Call torn down");
        self.inner.tearing_down.store(false, Ordering::Release);
    }

    async fn transition(&self, event: StateEvent) -> Result<CallState, TransitionError> {
        let mut outcome = Ok(CallState::Idle);
        let changed = self.inner.state.send_if_modified(|state| match state.apply(event) {
            Ok(next) => {
                outcome = Ok(next);
                let changed = next != *state;
                *state = next;
                changed
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });

        let next = outcome?;
        if changed {
            if let Some(session) = self.inner.session.write().await.as_mut() {
                session.state = next;
            }
            debug!(state = ?next, ?event, "Call state changed");
            self.emit(CallEvent::StateChanged { state: next });
        }
        Ok(next)
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.inner.events.send(event);
    }
}

impl std::fmt::Debug for CallController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallController")
            .field("local_user", self.local_user())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::media::SyntheticDevices;
    use crate::signaling::MemorySignaling;

    struct NoPeers;

    #[async_trait]
    impl PeerConnectionFactory for NoPeers {
        async fn create(
            &self,
            _events: mpsc::UnboundedSender<PeerEvent>,
        ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
            Err(NegotiationError::NoPeerConnection)
        }
    }

    fn controller(config: CallConfig) -> CallController {
        CallController::new(
            config,
            "a".into(),
            Arc::new(MemorySignaling::new()),
            Arc::new(SyntheticDevices::new()),
            Arc::new(NoPeers),
        )
    }

    #[tokio::test]
    async fn superseded_attempt_does_not_advance_the_current_one() {
        let ctrl = controller(CallConfig::default_for_test());

        // A newer attempt is still acquiring media.
        let current = Uuid::new_v4();
        {
            let mut resources = ctrl.inner.resources.lock().await;
            ctrl.transition(StateEvent::Start).await.unwrap();
            *resources = CallResources {
                attempt: Some(current),
                ..CallResources::default()
            };
            *ctrl.inner.session.write().await = Some(CallSession {
                room_id: "room1".into(),
                local_user_id: "a".into(),
                remote_user_id: "b".into(),
                state: CallState::AcquiringMedia,
                started_at: None,
                has_camera: false,
            });
        }

        let stale = Uuid::new_v4();
        let result = ctrl
            .acquire_and_connect(CancellationToken::new(), stale)
            .await;

        assert!(matches!(result, Err(CallError::Cancelled)));
        assert_eq!(ctrl.state(), CallState::AcquiringMedia);
        let session = ctrl.session().await.unwrap();
        assert_eq!(session.state, CallState::AcquiringMedia);
        assert!(!session.has_camera);
    }

    #[tokio::test]
    async fn zero_config_values_fall_back_to_defaults() {
        let ctrl = controller(CallConfig {
            event_buffer: 0,
            duration_tick: Duration::ZERO,
            offer_resend_interval: Duration::ZERO,
            ..CallConfig::default_for_test()
        });
        assert_eq!(ctrl.inner.config.event_buffer, 64);
        assert_eq!(ctrl.inner.config.duration_tick, Duration::from_secs(1));

        let mut events = ctrl.subscribe_events();
        let cancel = CancellationToken::new();
        let timer = ctrl.spawn_duration_timer(cancel.clone());

        let first = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, CallEvent::DurationTick { seconds: 0 });

        cancel.cancel();
        timer.await.unwrap();
    }
}
