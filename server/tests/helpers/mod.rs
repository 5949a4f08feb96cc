//! Reusable test helpers for relay integration tests.
//!
//! ## Test Servers
//!
//! Use [`spawn_test_server()`] to run the full router on a random port, then
//! [`TestClient::connect`] to speak raw relay frames to it.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use pc_common::{RelayClientFrame, RelayServerFrame};
use pc_relay::api::{create_router, AppState};
use pc_relay::config::Config;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Test Server
// ============================================================================

/// A running relay bound to a random port.
pub struct TestServer {
    /// Server address (127.0.0.1:PORT).
    pub addr: SocketAddr,
    /// Base URL for HTTP requests (e.g., `http://127.0.0.1:12345`).
    pub url: String,
    /// State shared with the router, for inspecting the hub.
    pub state: AppState,
    /// Handle to the server task for cleanup.
    _handle: JoinHandle<()>,
}

impl TestServer {
    pub fn ws_url(&self, user_id: &str) -> String {
        format!("ws://{}/ws?user_id={user_id}", self.addr)
    }
}

/// Spawn a real relay on a random port.
pub async fn spawn_test_server(config: Config) -> TestServer {
    let state = AppState::new(config);
    let router = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("Failed to get local addr");
    let url = format!("http://{addr}");

    let handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .await
            .expect("Test server failed");
    });

    TestServer {
        addr,
        url,
        state,
        _handle: handle,
    }
}

// ============================================================================
// Raw WebSocket client
// ============================================================================

/// A WebSocket client speaking relay frames.
pub struct TestClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect as `user_id` and consume the `ready` frame.
    pub async fn connect(server: &TestServer, user_id: &str) -> Self {
        let (stream, _) = connect_async(server.ws_url(user_id))
            .await
            .expect("WebSocket connect failed");
        let mut client = Self { stream };

        match client.recv().await {
            RelayServerFrame::Ready { user_id: ready } => assert_eq!(ready.as_str(), user_id),
            other => panic!("expected ready frame, got {other:?}"),
        }
        client
    }

    pub async fn send(&mut self, frame: &RelayClientFrame) {
        let json = serde_json::to_string(frame).expect("serialize frame");
        self.send_raw(&json).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .expect("WebSocket send failed");
    }

    /// Next relay frame, skipping control frames.
    pub async fn recv(&mut self) -> RelayServerFrame {
        tokio::time::timeout(FRAME_TIMEOUT, self.next_frame())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
    }

    /// Assert nothing arrives within `wait`.
    pub async fn expect_silence(&mut self, wait: Duration) {
        if let Ok(frame) = tokio::time::timeout(wait, self.next_frame()).await {
            panic!("unexpected frame: {frame:?}");
        }
    }

    /// Join `room_id` and wait for the confirmation.
    pub async fn join(&mut self, room_id: &str) {
        self.send(&RelayClientFrame::Join {
            room_id: room_id.into(),
        })
        .await;
        match self.recv().await {
            RelayServerFrame::Joined { room_id: joined } => assert_eq!(joined.as_str(), room_id),
            other => panic!("expected joined frame, got {other:?}"),
        }
    }

    pub async fn close(mut self) {
        let _ = self.stream.close(None).await;
    }

    async fn next_frame(&mut self) -> Option<RelayServerFrame> {
        while let Some(msg) = self.stream.next().await {
            match msg.ok()? {
                Message::Text(text) => {
                    return Some(serde_json::from_str(text.as_str()).expect("decode frame"))
                }
                Message::Close(_) => return None,
                _ => {}
            }
        }
        None
    }
}

/// Poll `check` until it returns true.
pub async fn wait_until(check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + FRAME_TIMEOUT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
