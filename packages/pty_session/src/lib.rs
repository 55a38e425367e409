//! PTY Session - process adapter for interactive shell sessions
//!
//! This crate wraps exactly one OS process attached to a pseudo-terminal
//! per session. It has no HTTP dependencies and no knowledge of projects,
//! focus, or streaming policy; callers reference sessions by their own ids
//! and hold a [`PtyHandle`] for the process lifetime.
//!
//! # Example
//!
//! ```no_run
//! use pty_session::{PtyActor, PtyConfig};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = PtyActor::spawn(PtyConfig {
//!         command: "/bin/bash".to_string(),
//!         working_dir: Some("/tmp".to_string()),
//!         ..Default::default()
//!     })
//!     .unwrap();
//!
//!     handle.write(b"echo hello\n").await.unwrap();
//!
//!     let mut rx = handle.subscribe();
//!     while let Ok(chunk) = rx.recv().await {
//!         println!("{}", String::from_utf8_lossy(&chunk.data));
//!     }
//!
//!     // SIGTERM, then SIGKILL if still alive after the grace period.
//!     handle.terminate(Duration::from_secs(5)).await.unwrap();
//! }
//! ```

mod error;
pub mod envfile;
pub mod pty;

pub use error::PtyError;
pub use pty::{PtyActor, PtyConfig, PtyHandle, PtyOutput, PtyState};
