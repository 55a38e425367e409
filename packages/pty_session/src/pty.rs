use anyhow::{Context, Result};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::error::PtyError;

/// How often the actor polls the child for exit while idle.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Configuration for spawning a PTY-backed process
#[derive(Clone, Debug)]
pub struct PtyConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: Option<String>,
    /// Extra environment entries, applied after the inherited essentials.
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for PtyConfig {
    fn default() -> Self {
        Self {
            command: "/bin/bash".to_string(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
        }
    }
}

/// Point-in-time state of the process behind a session
#[derive(Clone, Debug)]
pub struct PtyState {
    pub running: bool,
    pub pid: Option<u32>,
    pub command: String,
    pub rows: u16,
    pub cols: u16,
}

/// One chunk of output read from the PTY
#[derive(Clone, Debug)]
pub struct PtyOutput {
    pub data: Vec<u8>,
    pub timestamp: i64,
}

pub(crate) enum PtyMessage {
    WriteInput {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<usize, PtyError>>,
    },
    Resize {
        rows: u16,
        cols: u16,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
    GetState {
        respond_to: oneshot::Sender<PtyState>,
    },
    Signal {
        signal: PtySignal,
        respond_to: oneshot::Sender<Result<(), PtyError>>,
    },
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum PtySignal {
    Term,
    Kill,
    Interrupt,
}

/// Handle to a spawned PTY process. Cloneable; the underlying process is
/// owned by the actor task and destroyed exactly once.
#[derive(Clone)]
pub struct PtyHandle {
    sender: mpsc::Sender<PtyMessage>,
    output_tx: broadcast::Sender<PtyOutput>,
    exit_rx: watch::Receiver<Option<i32>>,
    pid: Option<u32>,
}

impl PtyHandle {
    /// Write raw bytes to the process stdin.
    pub async fn write(&self, data: &[u8]) -> Result<usize, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::WriteInput {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelClosed("write".into()))?;
        rx.await.map_err(|_| PtyError::ChannelClosed("write".into()))?
    }

    /// Resize the terminal.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Resize {
                rows,
                cols,
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelClosed("resize".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelClosed("resize".into()))?
    }

    /// Current process state.
    pub async fn state(&self) -> Result<PtyState, PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::GetState { respond_to: tx })
            .await
            .map_err(|_| PtyError::ChannelClosed("state".into()))?;
        rx.await.map_err(|_| PtyError::ChannelClosed("state".into()))
    }

    /// Subscribe to the output stream. Bytes arrive in the order the
    /// process produced them.
    pub fn subscribe(&self) -> broadcast::Receiver<PtyOutput> {
        self.output_tx.subscribe()
    }

    /// Watch for process exit. Yields `Some(exit_code)` once, after the
    /// process has terminated for any reason.
    pub fn exited(&self) -> watch::Receiver<Option<i32>> {
        self.exit_rx.clone()
    }

    /// Whether the process is known to have exited already.
    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    /// OS pid recorded at spawn time. Not cleared on exit.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Send Ctrl+C to the foreground process group.
    pub async fn interrupt(&self) -> Result<(), PtyError> {
        self.signal(PtySignal::Interrupt).await
    }

    /// Terminate the process: SIGTERM first, SIGKILL if it is still
    /// running after `grace`. Safe to call on an already-exited process.
    pub async fn terminate(&self, grace: Duration) -> Result<(), PtyError> {
        if self.has_exited() {
            return Ok(());
        }

        // The actor may have shut down between the check above and this
        // send; a closed channel here means the process is already gone.
        if let Err(PtyError::ChannelClosed(_)) = self.signal(PtySignal::Term).await {
            return Ok(());
        }

        let mut exit_rx = self.exited();
        let wait = async {
            loop {
                if exit_rx.borrow().is_some() {
                    return;
                }
                if exit_rx.changed().await.is_err() {
                    return;
                }
            }
        };

        if tokio::time::timeout(grace, wait).await.is_err() {
            warn!("process ignored SIGTERM for {:?}, sending SIGKILL", grace);
            match self.signal(PtySignal::Kill).await {
                Ok(()) | Err(PtyError::ChannelClosed(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn signal(&self, signal: PtySignal) -> Result<(), PtyError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(PtyMessage::Signal {
                signal,
                respond_to: tx,
            })
            .await
            .map_err(|_| PtyError::ChannelClosed("signal".into()))?;
        rx.await
            .map_err(|_| PtyError::ChannelClosed("signal".into()))?
    }
}

/// The actor owning a single PTY and its child process
pub struct PtyActor {
    master: Box<dyn MasterPty + Send>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    state: PtyState,
    receiver: mpsc::Receiver<PtyMessage>,
    exit_tx: watch::Sender<Option<i32>>,
}

impl PtyActor {
    /// Spawn the process on a fresh PTY and return a handle to it.
    pub fn spawn(config: PtyConfig) -> Result<PtyHandle, PtyError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("failed to open PTY pair")
            .map_err(PtyError::from)?;

        let mut cmd = CommandBuilder::new(&config.command);
        for arg in &config.args {
            cmd.arg(arg);
        }
        if let Some(dir) = &config.working_dir {
            cmd.cwd(dir);
        }

        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        for key in ["PATH", "HOME", "USER", "LANG"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        debug!(
            "spawning PTY process: {} {:?} (cwd: {:?})",
            config.command, config.args, config.working_dir
        );

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("failed to spawn '{}': {}", config.command, e);
            PtyError::SpawnFailed(e.to_string())
        })?;

        let pid = child.process_id();
        info!("PTY process started (pid: {:?})", pid);

        let state = PtyState {
            running: true,
            pid,
            command: config.command.clone(),
            rows: config.rows,
            cols: config.cols,
        };

        let (output_tx, _) = broadcast::channel(1024);
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (exit_tx, exit_rx) = watch::channel(None);

        let mut actor = Self {
            master: pair.master,
            writer: None,
            child,
            state,
            receiver: msg_rx,
            exit_tx,
        };

        let output_tx_reader = output_tx.clone();
        let mut reader = actor
            .master
            .try_clone_reader()
            .context("failed to clone PTY reader")
            .map_err(PtyError::from)?;

        // Blocking reader thread: PTY reads have no async interface.
        std::thread::spawn(move || {
            let mut buffer = vec![0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        debug!("PTY EOF, reader thread exiting");
                        break;
                    }
                    Ok(n) => {
                        let chunk = PtyOutput {
                            data: buffer[..n].to_vec(),
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        };
                        let _ = output_tx_reader.send(chunk);
                    }
                    Err(e) => {
                        warn!("PTY read error: {}", e);
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            actor.run().await;
        });

        Ok(PtyHandle {
            sender: msg_tx,
            output_tx,
            exit_rx,
            pid,
        })
    }

    async fn run(&mut self) {
        // Take the writer up front so the PTY stdin stays open even if the
        // first write arrives late.
        match self.master.take_writer() {
            Ok(writer) => self.writer = Some(writer),
            Err(e) => error!("failed to obtain PTY writer: {}", e),
        }

        let mut poll = tokio::time::interval(EXIT_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = self.receiver.recv() => {
                    let Some(msg) = msg else { break };
                    match msg {
                        PtyMessage::WriteInput { data, respond_to } => {
                            let _ = respond_to.send(self.handle_write(&data));
                        }
                        PtyMessage::Resize { rows, cols, respond_to } => {
                            let _ = respond_to.send(self.handle_resize(rows, cols));
                        }
                        PtyMessage::GetState { respond_to } => {
                            let _ = respond_to.send(self.state.clone());
                        }
                        PtyMessage::Signal { signal, respond_to } => {
                            let _ = respond_to.send(self.handle_signal(signal));
                        }
                    }
                    if self.check_exit() {
                        break;
                    }
                }
                _ = poll.tick() => {
                    if self.check_exit() {
                        break;
                    }
                }
            }
        }

        debug!("PTY actor shutting down (pid: {:?})", self.state.pid);
    }

    /// Returns true once the child has exited, publishing the exit code.
    fn check_exit(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let code = status.exit_code() as i32;
                info!("PTY process exited with code {}", code);
                self.state.running = false;
                self.state.pid = None;
                let _ = self.exit_tx.send(Some(code));
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!("try_wait failed: {}", e);
                false
            }
        }
    }

    fn handle_write(&mut self, data: &[u8]) -> Result<usize, PtyError> {
        if !self.state.running {
            return Err(PtyError::ProcessExited);
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| PtyError::WriteFailed("no PTY writer available".into()))?;
        writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        Ok(data.len())
    }

    fn handle_resize(&mut self, rows: u16, cols: u16) -> Result<(), PtyError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))?;
        self.state.rows = rows;
        self.state.cols = cols;
        Ok(())
    }

    fn handle_signal(&mut self, signal: PtySignal) -> Result<(), PtyError> {
        match signal {
            PtySignal::Term => {
                #[cfg(unix)]
                {
                    use nix::sys::signal::{Signal, kill};
                    use nix::unistd::Pid;

                    if let Some(pid) = self.state.pid {
                        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
                            .map_err(|e| PtyError::SignalFailed(e.to_string()))?;
                    }
                }
                #[cfg(not(unix))]
                {
                    self.child
                        .kill()
                        .map_err(|e| PtyError::SignalFailed(e.to_string()))?;
                }
                Ok(())
            }
            PtySignal::Kill => self
                .child
                .kill()
                .map_err(|e| PtyError::SignalFailed(e.to_string())),
            PtySignal::Interrupt => self.handle_write(b"\x03").map(|_| ()),
        }
    }
}
