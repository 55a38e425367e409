//! Focus-based output streaming: per-session relay tasks, bounded
//! buffering for unfocused sessions, and the WebSocket wire protocol.

pub mod buffer;
pub mod decode;
pub mod manager;
pub mod protocol;

pub use buffer::OutputBuffer;
pub use decode::Utf8StreamDecoder;
pub use manager::{AttachGuard, StreamManager};
pub use protocol::{ClientMessage, ServerMessage};
