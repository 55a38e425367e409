//! WebSocket wire protocol for session streams.
//!
//! All messages are JSON with a `type` tag. Output carries a sequence
//! number assigned when the chunk was produced; gaps in `seq` tell the
//! client that buffered chunks were dropped under pressure.

use serde::{Deserialize, Serialize};

/// Messages from the client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Raw terminal input for the session's process.
    Input { data: String },
    /// Terminal geometry change.
    Resize { rows: u16, cols: u16 },
    /// Liveness heartbeat; also resets the idle clock.
    Ping,
    /// Ask for the buffered backlog to be re-sent.
    Replay,
}

/// Messages to the client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Output {
        session_id: String,
        data: String,
        seq: u64,
    },
    Status {
        session_id: String,
        status: String,
    },
    Error {
        message: String,
    },
    Pong,
}
