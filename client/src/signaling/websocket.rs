//! WebSocket Signaling Transport
//!
//! Connects to the relay with automatic reconnection. Room memberships are
//! tracked locally and re-joined after every reconnect.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use pc_common::{RelayClientFrame, RelayServerFrame, RoomId, SignalingMessage, UserId};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

use super::{SignalingTransport, SubscriptionHandle};
use crate::config::CallConfig;
use crate::error::SignalingError;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

type Rooms = Arc<DashMap<RoomId, HashMap<Uuid, mpsc::UnboundedSender<SignalingMessage>>>>;

/// Connection status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

/// Signaling over a `pc-relay` WebSocket.
pub struct WebSocketSignaling {
    user_id: UserId,
    /// Channel to send frames to the WebSocket.
    tx: mpsc::Sender<RelayClientFrame>,
    rooms: Rooms,
    /// Rooms the relay has confirmed on the current connection.
    joined: watch::Receiver<HashSet<RoomId>>,
    status: Arc<RwLock<ConnectionStatus>>,
    shutdown_tx: Mutex<Option<mpsc::Sender<()>>>,
}

impl WebSocketSignaling {
    /// Start connecting to the relay at `server_url` as `user_id`.
    ///
    /// Returns immediately; frames sent before the connection is up are
    /// queued.
    pub fn connect(server_url: &str, user_id: UserId) -> Result<Self, SignalingError> {
        let ws_url = build_ws_url(server_url, &user_id)?;
        let (frame_tx, frame_rx) = mpsc::channel::<RelayClientFrame>(100);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let (joined_tx, joined_rx) = watch::channel(HashSet::new());
        let status = Arc::new(RwLock::new(ConnectionStatus::Connecting));
        let rooms: Rooms = Arc::new(DashMap::new());

        let link = Link {
            ws_url,
            rooms: rooms.clone(),
            joined: joined_tx,
            status: status.clone(),
        };
        tokio::spawn(async move {
            connection_loop(link, frame_rx, shutdown_rx).await;
        });

        Ok(Self {
            user_id,
            tx: frame_tx,
            rooms,
            joined: joined_rx,
            status,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        })
    }

    /// Connect to the relay named by `config.signaling_url`.
    pub fn from_config(config: &CallConfig, user_id: UserId) -> Result<Self, SignalingError> {
        Self::connect(&config.signaling_url, user_id)
    }

    pub const fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Get the current connection status.
    pub async fn status(&self) -> ConnectionStatus {
        self.status.read().await.clone()
    }

    /// Resolves once the relay confirmed membership of `room_id`.
    pub async fn wait_until_joined(&self, room_id: &RoomId) -> Result<(), SignalingError> {
        let mut joined = self.joined.clone();
        joined
            .wait_for(|rooms| rooms.contains(room_id))
            .await
            .map(|_| ())
            .map_err(|_| SignalingError::Closed)
    }

    /// Disconnect from the relay.
    pub async fn disconnect(&self) {
        if let Some(tx) = self.shutdown_tx.lock().await.take() {
            let _ = tx.send(()).await;
        }
    }

    async fn send(&self, frame: RelayClientFrame) -> Result<(), SignalingError> {
        self.tx.send(frame).await.map_err(|_| SignalingError::Closed)
    }
}

#[async_trait]
impl SignalingTransport for WebSocketSignaling {
    async fn subscribe(
        &self,
        room_id: &RoomId,
    ) -> Result<(SubscriptionHandle, mpsc::UnboundedReceiver<SignalingMessage>), SignalingError>
    {
        let handle = SubscriptionHandle::new(room_id.clone());
        let (tx, rx) = mpsc::unbounded_channel();

        let first = {
            let mut room = self.rooms.entry(room_id.clone()).or_default();
            room.insert(handle.id, tx);
            room.len() == 1
        };

        if first {
            self.send(RelayClientFrame::Join {
                room_id: room_id.clone(),
            })
            .await?;
        }
        Ok((handle, rx))
    }

    async fn publish(
        &self,
        room_id: &RoomId,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        self.send(RelayClientFrame::Publish {
            room_id: room_id.clone(),
            message,
        })
        .await
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let removed = self
            .rooms
            .get_mut(&handle.room_id)
            .is_some_and(|mut room| room.remove(&handle.id).is_some());
        let emptied = self
            .rooms
            .remove_if(&handle.room_id, |_, subscribers| subscribers.is_empty())
            .is_some();

        if removed && emptied {
            if let Err(e) = self
                .send(RelayClientFrame::Leave {
                    room_id: handle.room_id.clone(),
                })
                .await
            {
                debug!(error = %e, "Leave not sent, connection closed");
            }
        }
    }
}

/// State shared between the transport and its connection task.
struct Link {
    ws_url: Url,
    rooms: Rooms,
    joined: watch::Sender<HashSet<RoomId>>,
    status: Arc<RwLock<ConnectionStatus>>,
}

/// Main connection loop with reconnection logic.
async fn connection_loop(
    link: Link,
    mut frame_rx: mpsc::Receiver<RelayClientFrame>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut attempt = 0u32;

    loop {
        // Check for shutdown
        if shutdown_rx.try_recv().is_ok() {
            info!("WebSocket shutdown requested");
            *link.status.write().await = ConnectionStatus::Disconnected;
            return;
        }

        info!("Connecting to relay: {}", link.ws_url.path());
        *link.status.write().await = if attempt > 0 {
            ConnectionStatus::Reconnecting { attempt }
        } else {
            ConnectionStatus::Connecting
        };

        match connect_async(link.ws_url.as_str()).await {
            Ok((ws_stream, _)) => {
                info!("Relay connected");
                attempt = 0;
                *link.status.write().await = ConnectionStatus::Connected;

                let (mut write, mut read) = ws_stream.split();

                // Rejoin rooms held across a reconnect
                let rooms: Vec<RoomId> = link.rooms.iter().map(|r| r.key().clone()).collect();
                for room_id in rooms {
                    if let Err(e) = send_frame(&mut write, &RelayClientFrame::Join { room_id }).await {
                        error!("Failed to rejoin room: {}", e);
                    }
                }

                let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
                keepalive.tick().await;

                loop {
                    tokio::select! {
                        msg = read.next() => {
                            match msg {
                                Some(Ok(Message::Text(text))) => handle_server_frame(&link, &text),
                                Some(Ok(Message::Ping(data))) => {
                                    if let Err(e) = write.send(Message::Pong(data)).await {
                                        warn!("Failed to send pong: {}", e);
                                    }
                                }
                                Some(Ok(Message::Close(_))) => {
                                    info!("Relay closed connection");
                                    break;
                                }
                                Some(Err(e)) => {
                                    error!("WebSocket error: {}", e);
                                    break;
                                }
                                None => {
                                    info!("WebSocket stream ended");
                                    break;
                                }
                                _ => {}
                            }
                        }

                        frame = frame_rx.recv() => {
                            let Some(frame) = frame else {
                                info!("Frame channel closed");
                                let _ = write.send(Message::Close(None)).await;
                                *link.status.write().await = ConnectionStatus::Disconnected;
                                return;
                            };
                            if let Err(e) = send_frame(&mut write, &frame).await {
                                error!("Failed to send frame: {}", e);
                                break;
                            }
                        }

                        _ = keepalive.tick() => {
                            if let Err(e) = send_frame(&mut write, &RelayClientFrame::Ping).await {
                                warn!("Failed to send keepalive: {}", e);
                                break;
                            }
                        }

                        _ = shutdown_rx.recv() => {
                            info!("Shutdown received during connection");
                            let _ = write.send(Message::Close(None)).await;
                            link.joined.send_replace(HashSet::new());
                            *link.status.write().await = ConnectionStatus::Disconnected;
                            return;
                        }
                    }
                }
            }
            Err(e) => {
                error!("Failed to connect to relay: {}", e);
            }
        }

        // Connection lost or failed - attempt reconnection
        link.joined.send_replace(HashSet::new());
        *link.status.write().await = ConnectionStatus::Disconnected;

        attempt += 1;
        let backoff = std::cmp::min(Duration::from_secs(2u64.pow(attempt.min(5))), MAX_BACKOFF);
        info!("Reconnecting in {:?} (attempt {})", backoff, attempt);

        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.recv() => {
                info!("Shutdown during reconnect backoff");
                return;
            }
        }
    }
}

async fn send_frame<S>(write: &mut S, frame: &RelayClientFrame) -> Result<(), SignalingError>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(frame).map_err(|e| SignalingError::Encode(e.to_string()))?;
    debug!("Sending: {}", json);
    write
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| SignalingError::Transport(e.to_string()))
}

/// Handle a frame from the relay.
fn handle_server_frame(link: &Link, text: &str) {
    let frame = match serde_json::from_str::<RelayServerFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Failed to parse relay frame: {} - {}", e, text);
            return;
        }
    };

    match frame {
        RelayServerFrame::Ready { user_id } => info!(user_id = %user_id, "Relay session ready"),
        RelayServerFrame::Pong => debug!("Pong"),
        RelayServerFrame::Joined { room_id } => {
            debug!(room_id = %room_id, "Joined room");
            link.joined.send_modify(|rooms| {
                rooms.insert(room_id);
            });
        }
        RelayServerFrame::Left { room_id } => {
            debug!(room_id = %room_id, "Left room");
            link.joined.send_modify(|rooms| {
                rooms.remove(&room_id);
            });
        }
        RelayServerFrame::Message { room_id, message } => {
            if let Some(mut room) = link.rooms.get_mut(&room_id) {
                room.retain(|_, tx| tx.send(message.clone()).is_ok());
            }
        }
        RelayServerFrame::Error { code, message } => {
            warn!(code = %code, "Relay error: {}", message);
        }
    }
}

/// Build the relay WebSocket URL for `user_id`.
fn build_ws_url(server_url: &str, user_id: &UserId) -> Result<Url, SignalingError> {
    let mut url =
        Url::parse(server_url).map_err(|e| SignalingError::Transport(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::Transport(format!(
                "unsupported scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| SignalingError::Transport("invalid relay url".to_string()))?;
    url.set_path("/ws");
    url.query_pairs_mut()
        .clear()
        .append_pair("user_id", user_id.as_str());
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_ws_url_maps_http_schemes() {
        let url = build_ws_url("http://localhost:8090", &"alice".into()).unwrap();
        assert_eq!(url.as_str(), "ws://localhost:8090/ws?user_id=alice");

        let url = build_ws_url("https://relay.example.com/", &"a b".into()).unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/ws?user_id=a+b");

        let url = build_ws_url("ws://127.0.0.1:9000", &"bob".into()).unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:9000/ws?user_id=bob");
    }

    #[test]
    fn build_ws_url_rejects_other_schemes() {
        assert!(build_ws_url("ftp://relay", &"a".into()).is_err());
        assert!(build_ws_url("not a url", &"a".into()).is_err());
    }

    #[test]
    fn from_config_uses_signaling_url() {
        let config = CallConfig {
            signaling_url: "ftp://relay".into(),
            ..CallConfig::default_for_test()
        };
        assert!(WebSocketSignaling::from_config(&config, "a".into()).is_err());
    }
}
