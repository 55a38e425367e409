use axum::{
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::AppState;
use crate::stream::{ClientMessage, ServerMessage};

/// Upgrade to the per-session stream. Attach (with its retry loop) runs
/// after the upgrade so a client connecting right after POST /sessions
/// rides out the relay startup window instead of getting a 404.
pub async fn stream_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_stream(socket, state, id))
}

async fn handle_stream(socket: WebSocket, state: AppState, session_id: String) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(100);

    let guard = match state.streams.attach(&session_id, tx.clone()).await {
        Ok(guard) => guard,
        Err(e) => {
            warn!("stream attach failed for session {}: {}", session_id, e);
            let msg = ServerMessage::Error {
                message: e.to_string(),
            };
            if let Ok(json) = serde_json::to_string(&msg) {
                let _ = ws_tx.send(Message::Text(json.into())).await;
            }
            let _ = ws_tx.close().await;
            return;
        }
    };

    // Sender task: everything for the client funnels through one channel.
    let sender_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!("failed to serialize server message: {}", e);
                    continue;
                }
            };
            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        tokio::select! {
            _ = guard.cancel.cancelled() => {
                debug!("connection {} to session {} cancelled", guard.conn_id, session_id);
                break;
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&state, &guard.session_id, guard.conn_id, &text, &tx)
                            .await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // binary and transport ping/pong ignored
                    Some(Err(e)) => {
                        debug!("websocket error on session {}: {}", session_id, e);
                        break;
                    }
                }
            }
        }
    }

    state.streams.detach(&session_id, guard.conn_id).await;
    sender_task.abort();
}

async fn handle_client_message(
    state: &AppState,
    session_id: &str,
    conn_id: u64,
    text: &str,
    tx: &mpsc::Sender<ServerMessage>,
) {
    let msg = match serde_json::from_str::<ClientMessage>(text) {
        Ok(msg) => msg,
        Err(e) => {
            let _ = tx
                .send(ServerMessage::Error {
                    message: format!("invalid message: {}", e),
                })
                .await;
            return;
        }
    };

    match msg {
        ClientMessage::Input { data } => {
            state.streams.note_activity(session_id, conn_id).await;
            if let Err(e) = state.registry.write_input(session_id, data.as_bytes()).await {
                let _ = tx
                    .send(ServerMessage::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
        ClientMessage::Resize { rows, cols } => {
            if let Err(e) = state.registry.resize(session_id, rows, cols).await {
                let _ = tx
                    .send(ServerMessage::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
        ClientMessage::Ping => {
            state.streams.note_activity(session_id, conn_id).await;
            let _ = tx.send(ServerMessage::Pong).await;
        }
        ClientMessage::Replay => {
            state.streams.replay(session_id).await;
        }
    }
}
