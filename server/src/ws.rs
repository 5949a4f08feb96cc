//! WebSocket Handler
//!
//! One connection per client identity. Clients join rooms and publish
//! signaling messages; the hub fans them out to the other members.

use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use pc_common::{RelayClientFrame, RelayServerFrame, UserId};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::error::RelayError;

/// WebSocket connection query params.
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Identity the connection publishes as
    pub user_id: String,
}

/// WebSocket upgrade handler.
pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    let Ok(user_id) = UserId::parse(&query.user_id) else {
        return (StatusCode::BAD_REQUEST, "Invalid user_id").into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id))
}

/// Handle WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState, user_id: UserId) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let connection_id = Uuid::new_v4();

    // Channel for sending frames to the WebSocket
    let (tx, mut rx) = mpsc::channel::<RelayServerFrame>(state.config.outbound_buffer);

    info!(user_id = %user_id, %connection_id, "WebSocket connected");

    let _ = tx
        .send(RelayServerFrame::Ready {
            user_id: user_id.clone(),
        })
        .await;

    // Spawn task to forward frames to WebSocket
    let sender_handle = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize frame: {}", e);
                    continue;
                }
            };

            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    // Handle incoming messages
    while let Some(msg) = ws_receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if let Err(e) =
                    handle_client_frame(text.as_str(), connection_id, &user_id, &state, &tx).await
                {
                    warn!(user_id = %user_id, code = e.code(), "Rejected frame: {}", e);
                    let _ = tx.send(e.to_frame()).await;
                }
            }
            Ok(Message::Close(_)) => {
                info!(user_id = %user_id, "WebSocket closed");
                break;
            }
            Err(e) => {
                warn!(user_id = %user_id, "WebSocket error: {}", e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    let rooms = state.hub.remove_connection(connection_id);
    sender_handle.abort();

    info!(user_id = %user_id, rooms = rooms.len(), "WebSocket disconnected");
}

/// Handle a client frame.
async fn handle_client_frame(
    text: &str,
    connection_id: Uuid,
    user_id: &UserId,
    state: &AppState,
    tx: &mpsc::Sender<RelayServerFrame>,
) -> Result<(), RelayError> {
    let frame: RelayClientFrame = serde_json::from_str(text)?;

    match frame {
        RelayClientFrame::Ping => {
            let _ = tx.send(RelayServerFrame::Pong).await;
        }

        RelayClientFrame::Join { room_id } => {
            state
                .hub
                .join(&room_id, connection_id, user_id, tx.clone())?;
            let _ = tx.send(RelayServerFrame::Joined { room_id }).await;
        }

        RelayClientFrame::Leave { room_id } => {
            if !state.hub.leave(&room_id, connection_id) {
                debug!(user_id = %user_id, room_id = %room_id, "Leave for a room not joined");
            }
            let _ = tx.send(RelayServerFrame::Left { room_id }).await;
        }

        RelayClientFrame::Publish { room_id, message } => {
            state
                .hub
                .publish(&room_id, connection_id, user_id, message)?;
        }
    }

    Ok(())
}
