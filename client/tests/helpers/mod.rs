//! Reusable helpers for call controller integration tests.
//!
//! Provides a scripted [`FakePeer`] and its factory, a signaling transport
//! that records every publish, device wrappers for failure and timing
//! scenarios, and an [`EventLog`] collecting controller events.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pc_client::error::NegotiationError;
use pc_client::media::{
    DeviceFailure, MediaConstraints, MediaDevices, MediaTrack, SyntheticDevices, TrackSource,
};
use pc_client::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerState};
use pc_client::signaling::{MemorySignaling, SignalingTransport, SubscriptionHandle};
use pc_client::{CallConfig, CallController, CallEvent, CallState};
use pc_common::{IceCandidate, RoomId, SdpType, SessionDescription, SignalingMessage, UserId};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

// ============================================================================
// Peer connection
// ============================================================================

/// One call made on a [`FakePeer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerCall {
    AttachLocalTracks {
        audio: String,
        video: Option<String>,
    },
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddIceCandidate(String),
    ReplaceVideo(Option<String>),
    DetachSenders,
    Close,
}

/// Scripted peer connection.
///
/// Setting the local description discovers one candidate. Once both
/// descriptions are set the peer reports `Connected` and delivers the
/// configured number of remote tracks. Candidates added before the remote
/// description are rejected, like a real peer connection does.
pub struct FakePeer {
    pub id: usize,
    events: mpsc::UnboundedSender<PeerEvent>,
    calls: Mutex<Vec<PeerCall>>,
    remote_tracks: usize,
    fail_remote_description: bool,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    media_started: AtomicBool,
    closed: AtomicBool,
}

impl FakePeer {
    pub fn calls(&self) -> Vec<PeerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Push an event as if the connection produced it.
    pub fn inject(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub fn position(&self, call: &PeerCall) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    /// Last outbound video substitution, if any.
    pub fn last_video_replacement(&self) -> Option<Option<String>> {
        self.calls().into_iter().rev().find_map(|c| match c {
            PeerCall::ReplaceVideo(id) => Some(id),
            _ => None,
        })
    }

    fn record(&self, call: PeerCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn maybe_start_media(&self) {
        if !self.local_set.load(Ordering::SeqCst) || !self.remote_set.load(Ordering::SeqCst) {
            return;
        }
        if self.media_started.swap(true, Ordering::SeqCst) {
            return;
        }

        self.inject(PeerEvent::StateChanged(PeerState::Connected));
        for n in 0..self.remote_tracks {
            let source = if n % 2 == 0 {
                TrackSource::RemoteAudio
            } else {
                TrackSource::RemoteVideo
            };
            self.inject(PeerEvent::RemoteTrack(Arc::new(MediaTrack::new(
                source,
                format!("remote-{n}"),
            ))));
        }
    }
}

#[async_trait]
impl PeerConnection for FakePeer {
    async fn attach_local_tracks(
        &self,
        audio: Arc<MediaTrack>,
        video: Option<Arc<MediaTrack>>,
    ) -> Result<(), NegotiationError> {
        self.record(PeerCall::AttachLocalTracks {
            audio: audio.id().to_string(),
            video: video.map(|v| v.id().to_string()),
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.record(PeerCall::CreateOffer);
        Ok(SessionDescription::offer(format!("v=0 offer {}", self.id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(NegotiationError::Description("no remote offer".into()));
        }
        self.record(PeerCall::CreateAnswer);
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.id)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.record(PeerCall::SetLocal(description.sdp_type));
        self.local_set.store(true, Ordering::SeqCst);
        self.inject(PeerEvent::IceCandidate(IceCandidate::new(format!(
            "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
            self.id,
            5000 + self.id
        ))));
        self.maybe_start_media();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        if self.fail_remote_description {
            return Err(NegotiationError::Description("malformed sdp".into()));
        }
        self.record(PeerCall::SetRemote(description.sdp_type));
        self.remote_set.store(true, Ordering::SeqCst);
        self.maybe_start_media();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(NegotiationError::Candidate(
                "remote description not set".into(),
            ));
        }
        self.record(PeerCall::AddIceCandidate(candidate.candidate));
        Ok(())
    }

    async fn replace_video_track(
        &self,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), NegotiationError> {
        self.record(PeerCall::ReplaceVideo(track.map(|t| t.id().to_string())));
        Ok(())
    }

    async fn detach_senders(&self) {
        self.record(PeerCall::DetachSenders);
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.record(PeerCall::Close);
        self.closed.store(true, Ordering::SeqCst);
        self.inject(PeerEvent::StateChanged(PeerState::Closed));
        Ok(())
    }
}

/// Factory handing out [`FakePeer`]s and keeping them for inspection.
pub struct FakePeerFactory {
    remote_tracks: usize,
    fail_remote_description: bool,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn new(remote_tracks: usize) -> Self {
        Self {
            remote_tracks,
            fail_remote_description: false,
            peers: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_remote_description() -> Self {
        Self {
            fail_remote_description: true,
            ..Self::new(2)
        }
    }

    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn peer(&self, index: usize) -> Arc<FakePeer> {
        self.peers.lock().unwrap()[index].clone()
    }

    pub fn last(&self) -> Arc<FakePeer> {
        self.peers
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no peer created")
    }
}

static NEXT_PEER_ID: AtomicUsize = AtomicUsize::new(1);

#[async_trait]
impl PeerConnectionFactory for FakePeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let peer = Arc::new(FakePeer {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::SeqCst),
            events,
            calls: Mutex::new(Vec::new()),
            remote_tracks: self.remote_tracks,
            fail_remote_description: self.fail_remote_description,
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            media_started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.peers.lock().unwrap().push(peer.clone());
        Ok(peer)
    }
}

// ============================================================================
// Signaling
// ============================================================================

/// In-memory bus that records every published message.
#[derive(Default)]
pub struct RecordingTransport {
    inner: MemorySignaling,
    published: Mutex<Vec<(RoomId, SignalingMessage)>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<SignalingMessage> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn published_kind(&self, kind: &str) -> Vec<SignalingMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.kind() == kind)
            .collect()
    }

    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.inner.subscriber_count(room_id)
    }
}

#[async_trait]
impl SignalingTransport for RecordingTransport {
    async fn subscribe(
        &self,
        room_id: &RoomId,
    ) -> Result<
        (SubscriptionHandle, mpsc::UnboundedReceiver<SignalingMessage>),
        pc_client::SignalingError,
    > {
        self.inner.subscribe(room_id).await
    }

    async fn publish(
        &self,
        room_id: &RoomId,
        message: SignalingMessage,
    ) -> Result<(), pc_client::SignalingError> {
        self.published
            .lock()
            .unwrap()
            .push((room_id.clone(), message.clone()));
        self.inner.publish(room_id, message).await
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        self.inner.unsubscribe(handle).await;
    }
}

// ============================================================================
// Devices
// ============================================================================

/// Fails the first `failures` capture requests, then behaves like the
/// wrapped devices.
pub struct FlakyDevices {
    pub inner: SyntheticDevices,
    failures: AtomicUsize,
    failure_name: &'static str,
}

impl FlakyDevices {
    pub fn new(failures: usize, failure_name: &'static str) -> Self {
        Self {
            inner: SyntheticDevices::new(),
            failures: AtomicUsize::new(failures),
            failure_name,
        }
    }
}

#[async_trait]
impl MediaDevices for FlakyDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<Arc<MediaTrack>>, DeviceFailure> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DeviceFailure::new(self.failure_name, "flaky device"));
        }
        self.inner.get_user_media(constraints).await
    }

    async fn get_display_media(&self) -> Result<Arc<MediaTrack>, DeviceFailure> {
        self.inner.get_display_media().await
    }
}

/// Holds every capture request until [`GatedDevices::open`] is called.
pub struct GatedDevices {
    pub inner: SyntheticDevices,
    gate: Notify,
    opened: AtomicBool,
    pub waiting: AtomicUsize,
}

impl GatedDevices {
    pub fn new() -> Self {
        Self {
            inner: SyntheticDevices::new(),
            gate: Notify::new(),
            opened: AtomicBool::new(false),
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn open(&self) {
        self.opened.store(true, Ordering::SeqCst);
        self.gate.notify_waiters();
    }
}

#[async_trait]
impl MediaDevices for GatedDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Vec<Arc<MediaTrack>>, DeviceFailure> {
        let notified = self.gate.notified();
        self.waiting.fetch_add(1, Ordering::SeqCst);
        if !self.opened.load(Ordering::SeqCst) {
            notified.await;
        }
        self.inner.get_user_media(constraints).await
    }

    async fn get_display_media(&self) -> Result<Arc<MediaTrack>, DeviceFailure> {
        self.inner.get_display_media().await
    }
}

// ============================================================================
// Controllers & events
// ============================================================================

pub fn controller(
    user: &str,
    transport: Arc<RecordingTransport>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<FakePeerFactory>,
) -> CallController {
    controller_with_config(CallConfig::default_for_test(), user, transport, devices, peers)
}

pub fn controller_with_config(
    config: CallConfig,
    user: &str,
    transport: Arc<RecordingTransport>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<FakePeerFactory>,
) -> CallController {
    CallController::new(config, UserId::from(user), transport, devices, peers)
}

/// Two parties "a" and "b" sharing one bus.
pub struct CallPair {
    pub bus: Arc<RecordingTransport>,
    pub a: CallController,
    pub b: CallController,
    pub a_devices: Arc<SyntheticDevices>,
    pub b_devices: Arc<SyntheticDevices>,
    pub a_peers: Arc<FakePeerFactory>,
    pub b_peers: Arc<FakePeerFactory>,
    pub a_events: EventLog,
    pub b_events: EventLog,
}

impl CallPair {
    pub fn new(remote_tracks: usize) -> Self {
        let bus = Arc::new(RecordingTransport::new());
        let a_devices = Arc::new(SyntheticDevices::new());
        let b_devices = Arc::new(SyntheticDevices::new());
        let a_peers = Arc::new(FakePeerFactory::new(remote_tracks));
        let b_peers = Arc::new(FakePeerFactory::new(remote_tracks));
        let a = controller("a", bus.clone(), a_devices.clone(), a_peers.clone());
        let b = controller("b", bus.clone(), b_devices.clone(), b_peers.clone());
        let a_events = EventLog::start(&a);
        let b_events = EventLog::start(&b);

        Self {
            bus,
            a,
            b,
            a_devices,
            b_devices,
            a_peers,
            b_peers,
            a_events,
            b_events,
        }
    }

    /// Start both sides in "room1", responder "b" first, and wait until
    /// both are connected.
    pub async fn connect(&self) {
        let room = RoomId::from("room1");
        self.b
            .start_call(room.clone(), "a".into())
            .await
            .expect("b start");
        self.a.start_call(room, "b".into()).await.expect("a start");

        self.wait_connected().await;
    }

    /// Start the initiator "a", wait `delay`, then start "b", and wait until
    /// both are connected.
    pub async fn connect_initiator_first(&self, delay: Duration) {
        let room = RoomId::from("room1");
        self.a
            .start_call(room.clone(), "b".into())
            .await
            .expect("a start");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.b.start_call(room, "a".into()).await.expect("b start");

        self.wait_connected().await;
    }

    async fn wait_connected(&self) {
        wait_for_state(&self.a, CallState::Connected).await;
        wait_for_state(&self.b, CallState::Connected).await;
    }
}

/// Collects every event a controller broadcasts.
pub struct EventLog {
    events: Arc<Mutex<Vec<CallEvent>>>,
    _task: JoinHandle<()>,
}

impl EventLog {
    pub fn start(controller: &CallController) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut rx = controller.subscribe_events();
        let sink = events.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => sink.lock().unwrap().push(event),
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Self {
            events,
            _task: task,
        }
    }

    pub fn events(&self) -> Vec<CallEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&CallEvent) -> bool) -> usize {
        self.events().iter().filter(|e| pred(e)).count()
    }

    pub async fn wait_for(&self, pred: impl Fn(&CallEvent) -> bool) -> CallEvent {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            if let Some(event) = self.events().into_iter().find(|e| pred(e)) {
                return event;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "event not observed in time"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

pub async fn wait_for_state(controller: &CallController, state: CallState) {
    let mut rx = controller.watch_state();
    tokio::time::timeout(WAIT_LIMIT, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state:?}, at {:?}", controller.state()))
        .expect("state channel closed");
}

/// Poll `check` until it returns true.
pub async fn wait_until(check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        if check() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
