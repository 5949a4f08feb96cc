//! WebRTC Peer Connection
//!
//! [`PeerConnection`] backed by the `webrtc` crate. Each peer negotiates one
//! Opus audio sender and one VP8 video sender up front; the video sender may
//! start empty and is filled by track substitution.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use pc_common::{IceCandidate, SdpType, SessionDescription};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::{
    api::{
        interceptor_registry::register_default_interceptors, media_engine::MediaEngine, APIBuilder,
        API,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        sdp::session_description::RTCSessionDescription, RTCPeerConnection,
    },
    rtp_transceiver::{
        rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType},
        rtp_sender::RTCRtpSender,
        rtp_transceiver_direction::RTCRtpTransceiverDirection,
        RTCRtpTransceiverInit,
    },
    track::{
        track_local::{track_local_static_sample::TrackLocalStaticSample, TrackLocal},
        track_remote::TrackRemote,
    },
};

use crate::error::NegotiationError;
use crate::media::{MediaTrack, TrackKind, TrackSource};
use crate::peer::{PeerConnection, PeerConnectionFactory, PeerEvent, PeerState};

const STREAM_ID: &str = "peercall";

/// ICE server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServerConfig {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl Default for IceServerConfig {
    fn default() -> Self {
        Self {
            urls: vec!["stun:stun.l.google.com:19302".to_string()],
            username: None,
            credential: None,
        }
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

fn vp8_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/VP8".to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: String::new(),
        rtcp_feedback: vec![],
    }
}

/// Builds [`WebRtcPeer`]s sharing one configured API.
pub struct WebRtcPeerFactory {
    api: Arc<API>,
    ice_servers: Vec<IceServerConfig>,
}

impl WebRtcPeerFactory {
    pub fn new(ice_servers: Vec<IceServerConfig>) -> Result<Self, NegotiationError> {
        let mut media_engine = MediaEngine::default();

        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: opus_capability(),
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;
        media_engine.register_codec(
            RTCRtpCodecParameters {
                capability: vp8_capability(),
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        info!(ice_servers = ice_servers.len(), "WebRTC peer factory initialized");

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
        })
    }

    /// Create `RTCConfiguration` from ICE server config
    fn create_rtc_config(&self) -> RTCConfiguration {
        let ice_servers: Vec<RTCIceServer> = self
            .ice_servers
            .iter()
            .map(|s| RTCIceServer {
                urls: s.urls.clone(),
                username: s.username.clone().unwrap_or_default(),
                credential: s.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        let pc = Arc::new(self.api.new_peer_connection(self.create_rtc_config()).await?);
        setup_event_handlers(&pc, events);
        debug!("Peer connection created");

        Ok(Arc::new(WebRtcPeer {
            pc,
            audio_sender: tokio::sync::RwLock::new(None),
            video_sender: tokio::sync::RwLock::new(None),
            sample_tracks: DashMap::new(),
        }))
    }
}

fn map_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
        RTCPeerConnectionState::New | RTCPeerConnectionState::Unspecified => PeerState::New,
    }
}

/// Set up peer connection event handlers
fn setup_event_handlers(pc: &RTCPeerConnection, events: mpsc::UnboundedSender<PeerEvent>) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent::IceCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => warn!(error = %e, "Failed to serialize local ICE candidate"),
            }
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            info!("Peer connection state changed: {}", s);
            let _ = tx.send(PeerEvent::StateChanged(map_state(s)));
        })
    }));

    let tx = events;
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let tx = tx.clone();
            Box::pin(async move {
                info!(
                    "Remote track received: {} ({})",
                    track.kind(),
                    track.codec().capability.mime_type
                );

                let source = match track.kind() {
                    RTPCodecType::Video => TrackSource::RemoteVideo,
                    _ => TrackSource::RemoteAudio,
                };
                let media = Arc::new(MediaTrack::with_id(
                    track.id(),
                    source,
                    format!("{} {}", track.stream_id(), track.kind()),
                ));

                // Drain RTP so interceptors keep flowing; the remote track ends
                // when the stream does.
                let ended = media.clone();
                tokio::spawn(async move {
                    while track.read_rtp().await.is_ok() {}
                    ended.stop();
                });

                let _ = tx.send(PeerEvent::RemoteTrack(media));
            })
        },
    ));
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, NegotiationError> {
    let result = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpType::Rollback => {
            return Err(NegotiationError::Description(
                "rollback is not supported".to_string(),
            ))
        }
    };
    result.map_err(|e| NegotiationError::Description(e.to_string()))
}

/// Peer connection over `webrtc`.
pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    audio_sender: tokio::sync::RwLock<Option<Arc<RTCRtpSender>>>,
    video_sender: tokio::sync::RwLock<Option<Arc<RTCRtpSender>>>,
    sample_tracks: DashMap<String, Arc<TrackLocalStaticSample>>,
}

impl WebRtcPeer {
    /// Sample sink a capture pipeline writes encoded frames of `track_id` to.
    pub fn sample_track(&self, track_id: &str) -> Option<Arc<TrackLocalStaticSample>> {
        self.sample_tracks.get(track_id).map(|t| t.value().clone())
    }

    fn sample_track_for(&self, track: &MediaTrack) -> Arc<TrackLocalStaticSample> {
        self.sample_tracks
            .entry(track.id().to_string())
            .or_insert_with(|| {
                let capability = match track.kind() {
                    TrackKind::Audio => opus_capability(),
                    TrackKind::Video => vp8_capability(),
                };
                Arc::new(TrackLocalStaticSample::new(
                    capability,
                    track.id().to_string(),
                    STREAM_ID.to_string(),
                ))
            })
            .clone()
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn attach_local_tracks(
        &self,
        audio: Arc<MediaTrack>,
        video: Option<Arc<MediaTrack>>,
    ) -> Result<(), NegotiationError> {
        let audio_track = self.sample_track_for(&audio);
        let audio_sender = self
            .pc
            .add_track(audio_track as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| NegotiationError::Track(e.to_string()))?;

        let video_sender = match video {
            Some(video) => {
                let video_track = self.sample_track_for(&video);
                self.pc
                    .add_track(video_track as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|e| NegotiationError::Track(e.to_string()))?
            }
            None => {
                let transceiver = self
                    .pc
                    .add_transceiver_from_kind(
                        RTPCodecType::Video,
                        Some(RTCRtpTransceiverInit {
                            direction: RTCRtpTransceiverDirection::Sendrecv,
                            send_encodings: vec![],
                        }),
                    )
                    .await
                    .map_err(|e| NegotiationError::Track(e.to_string()))?;
                transceiver.sender().await
            }
        };

        *self.audio_sender.write().await = Some(audio_sender);
        *self.video_sender.write().await = Some(video_sender);
        debug!("Local tracks attached");
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))?;
        debug!("Local description set");
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.pc
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|e| NegotiationError::Description(e.to_string()))?;
        debug!("Remote description set");
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| NegotiationError::Candidate(e.to_string()))?;
        debug!("ICE candidate added");
        Ok(())
    }

    async fn replace_video_track(
        &self,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), NegotiationError> {
        let sender = self
            .video_sender
            .read()
            .await
            .clone()
            .ok_or(NegotiationError::NoPeerConnection)?;

        let local = track.map(|t| self.sample_track_for(&t) as Arc<dyn TrackLocal + Send + Sync>);
        sender
            .replace_track(local)
            .await
            .map_err(|e| NegotiationError::Track(e.to_string()))?;
        debug!("Outbound video track replaced");
        Ok(())
    }

    async fn detach_senders(&self) {
        for sender in self.pc.get_senders().await {
            if let Err(e) = sender.replace_track(None).await {
                warn!(error = %e, "Failed to detach sender track");
            }
        }
        *self.audio_sender.write().await = None;
        *self.video_sender.write().await = None;
        self.sample_tracks.clear();
    }

    async fn close(&self) -> Result<(), NegotiationError> {
        self.pc
            .close()
            .await
            .map_err(|e| NegotiationError::PeerConnection(e.to_string()))?;
        info!("Peer connection closed");
        Ok(())
    }
}
