use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::breaker::BreakerConfig;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   config.toml:     [limits]
//                    focus_capacity = 8
//
//   env var:         TERMHUB_LIMITS__FOCUS_CAPACITY=8   (double underscore = nesting)
//
// (single underscore stays within field names: TERMHUB_SESSION__IDLE_TIMEOUT_SECS)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub limits: LimitsFileConfig,
    #[serde(default)]
    pub stream: StreamFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub persistence: PersistenceFileConfig,
}

/// Bind address knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

impl Default for ServerFileConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
        }
    }
}

/// Hard caps (lives under `[limits]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsFileConfig {
    #[serde(default = "default_max_sessions_per_project")]
    pub max_sessions_per_project: usize,
    /// Focus-set capacity K: sessions per project eligible for live relay.
    #[serde(default = "default_focus_capacity")]
    pub focus_capacity: usize,
}

impl Default for LimitsFileConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_project: default_max_sessions_per_project(),
            focus_capacity: default_focus_capacity(),
        }
    }
}

/// Streaming knobs (lives under `[stream]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamFileConfig {
    #[serde(default = "default_buffer_max_lines")]
    pub buffer_max_lines: usize,
    #[serde(default = "default_buffer_max_bytes")]
    pub buffer_max_bytes: usize,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_max_missed")]
    pub heartbeat_max_missed: u32,
    #[serde(default = "default_attach_retry_attempts")]
    pub attach_retry_attempts: u32,
    #[serde(default = "default_attach_retry_base_ms")]
    pub attach_retry_base_ms: u64,
}

impl Default for StreamFileConfig {
    fn default() -> Self {
        Self {
            buffer_max_lines: default_buffer_max_lines(),
            buffer_max_bytes: default_buffer_max_bytes(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_max_missed: default_heartbeat_max_missed(),
            attach_retry_attempts: default_attach_retry_attempts(),
            attach_retry_base_ms: default_attach_retry_base_ms(),
        }
    }
}

/// Session lifecycle knobs (lives under `[session]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_spawn_timeout_secs")]
    pub spawn_timeout_secs: u64,
    #[serde(default = "default_terminate_grace_secs")]
    pub terminate_grace_secs: u64,
    /// Command for interactive-shell sessions. Defaults to $SHELL.
    #[serde(default)]
    pub shell_command: Option<String>,
    /// Command for assistant-shell sessions.
    #[serde(default = "default_assistant_command")]
    pub assistant_command: String,
    /// Selects which `.env.<mode>` file is layered into session env.
    #[serde(default)]
    pub deployment_mode: Option<String>,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            spawn_timeout_secs: default_spawn_timeout_secs(),
            terminate_grace_secs: default_terminate_grace_secs(),
            shell_command: None,
            assistant_command: default_assistant_command(),
            deployment_mode: None,
        }
    }
}

/// Persistence backend knobs (lives under `[persistence]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceFileConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_probe_successes")]
    pub probe_successes: u32,
}

impl Default for PersistenceFileConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            probe_successes: default_probe_successes(),
        }
    }
}

fn default_max_sessions_per_project() -> usize {
    20
}
fn default_focus_capacity() -> usize {
    4
}
fn default_buffer_max_lines() -> usize {
    500
}
fn default_buffer_max_bytes() -> usize {
    10 * 1024
}
fn default_heartbeat_interval_secs() -> u64 {
    30
}
fn default_heartbeat_max_missed() -> u32 {
    3
}
fn default_attach_retry_attempts() -> u32 {
    5
}
fn default_attach_retry_base_ms() -> u64 {
    50
}
fn default_idle_timeout_secs() -> u64 {
    1800
}
fn default_reaper_interval_secs() -> u64 {
    60
}
fn default_spawn_timeout_secs() -> u64 {
    5
}
fn default_terminate_grace_secs() -> u64 {
    5
}
fn default_assistant_command() -> String {
    "claude".to_string()
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_cooldown_secs() -> u64 {
    30
}
fn default_probe_successes() -> u32 {
    3
}

/// Build a figment that layers: struct defaults → config.toml → TERMHUB_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `TERMHUB_LIMITS__FOCUS_CAPACITY=8`       →  `limits.focus_capacity = 8`
///   `TERMHUB_SESSION__IDLE_TIMEOUT_SECS=600` →  `session.idle_timeout_secs = 600`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("TERMHUB_").split("__"))
}

/// Resolved engine configuration (runtime view with real Durations).
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub max_sessions_per_project: usize,
    pub focus_capacity: usize,
    pub buffer_max_lines: usize,
    pub buffer_max_bytes: usize,
    pub heartbeat_interval: Duration,
    pub heartbeat_max_missed: u32,
    pub attach_retry_attempts: u32,
    pub attach_retry_base: Duration,
    pub idle_timeout: Duration,
    pub reaper_interval: Duration,
    pub spawn_timeout: Duration,
    pub terminate_grace: Duration,
    pub shell_command: String,
    pub assistant_command: String,
    pub deployment_mode: Option<String>,
}

impl EngineConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        let shell_command = fc
            .session
            .shell_command
            .clone()
            .or_else(|| std::env::var("SHELL").ok())
            .unwrap_or_else(|| "/bin/bash".to_string());

        Self {
            max_sessions_per_project: fc.limits.max_sessions_per_project,
            focus_capacity: fc.limits.focus_capacity,
            buffer_max_lines: fc.stream.buffer_max_lines,
            buffer_max_bytes: fc.stream.buffer_max_bytes,
            heartbeat_interval: Duration::from_secs(fc.stream.heartbeat_interval_secs),
            heartbeat_max_missed: fc.stream.heartbeat_max_missed,
            attach_retry_attempts: fc.stream.attach_retry_attempts,
            attach_retry_base: Duration::from_millis(fc.stream.attach_retry_base_ms),
            idle_timeout: Duration::from_secs(fc.session.idle_timeout_secs),
            reaper_interval: Duration::from_secs(fc.session.reaper_interval_secs),
            spawn_timeout: Duration::from_secs(fc.session.spawn_timeout_secs),
            terminate_grace: Duration::from_secs(fc.session.terminate_grace_secs),
            shell_command,
            assistant_command: fc.session.assistant_command.clone(),
            deployment_mode: fc.session.deployment_mode.clone(),
        }
    }

    pub fn breaker(&self, fc: &PersistenceFileConfig) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: fc.failure_threshold,
            cooldown: Duration::from_secs(fc.cooldown_secs),
            probe_successes: fc.probe_successes,
        }
    }
}

/// Data directory and derived paths.
#[derive(Clone, Debug)]
pub struct DataDir {
    pub root: PathBuf,
}

impl DataDir {
    pub fn new(custom: Option<PathBuf>) -> Result<Self> {
        let root = match custom {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("could not determine home directory")?
                .join(".termhub"),
        };
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create data dir {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn db_path(&self) -> PathBuf {
        self.root.join("termhub.db")
    }

    pub fn db_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.db_path().display())
    }
}
