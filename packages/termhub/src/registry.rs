//! Session registry: the single source of truth for live sessions and
//! per-project focus sets.
//!
//! All mutations happen in memory first; events are published after the
//! change is applied, and persistence is strictly best-effort through
//! [`PersistHandle`]. Nothing on the live path waits for the database.

use chrono::{DateTime, Utc};
use pty_session::{PtyActor, PtyConfig, PtyHandle, PtyOutput, envfile};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::{EventBus, SessionEvent};
use crate::store::{PersistHandle, SessionRow};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Shell,
    Assistant,
}

impl SessionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Shell => "shell",
            SessionMode::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Suspended,
    Closed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Suspended => "suspended",
            SessionStatus::Closed => "closed",
        }
    }
}

/// Public view of a session, as returned by the HTTP surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub project_id: String,
    pub mode: SessionMode,
    pub status: SessionStatus,
    pub focused: bool,
    pub working_dir: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

struct SessionEntry {
    project_id: String,
    mode: SessionMode,
    status: SessionStatus,
    working_dir: String,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    /// Live WebSocket attachments; idle reaping skips connected sessions.
    connections: usize,
    handle: PtyHandle,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<String, SessionEntry>,
    /// project_id -> focused session ids (at most `focus_capacity` each).
    focus: HashMap<String, HashSet<String>>,
}

pub struct SessionRegistry {
    inner: RwLock<RegistryInner>,
    config: EngineConfig,
    events: EventBus,
    persist: PersistHandle,
}

impl SessionRegistry {
    pub fn new(config: EngineConfig, events: EventBus, persist: PersistHandle) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            config,
            events,
            persist,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Spawn a new session for `project_id`. Fails with
    /// `ResourceExhausted` at the per-project cap and `SpawnTimeout` when
    /// the process does not come up in time.
    pub async fn create(
        self: &Arc<Self>,
        project_id: &str,
        mode: SessionMode,
        working_dir: Option<String>,
    ) -> Result<SessionInfo, EngineError> {
        {
            let inner = self.inner.read().await;
            let count = inner
                .sessions
                .values()
                .filter(|s| s.project_id == project_id)
                .count();
            if count >= self.config.max_sessions_per_project {
                return Err(EngineError::ResourceExhausted(project_id.to_string()));
            }
        }

        let working_dir = working_dir.unwrap_or_else(|| {
            std::env::current_dir()
                .unwrap_or_else(|_| std::path::PathBuf::from("/tmp"))
                .to_string_lossy()
                .to_string()
        });

        let command_line = match mode {
            SessionMode::Shell => self.config.shell_command.clone(),
            SessionMode::Assistant => self.config.assistant_command.clone(),
        };

        // Commands with arguments run through the shell so things like
        // "npm exec claude" work.
        let (command, args) = if command_line.contains(' ') {
            let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
            (shell, vec!["-c".to_string(), command_line.clone()])
        } else {
            (command_line.clone(), Vec::new())
        };

        let env = envfile::layered_env(
            Path::new(&working_dir),
            self.config.deployment_mode.as_deref(),
        );

        let pty_config = PtyConfig {
            command,
            args,
            working_dir: Some(working_dir.clone()),
            env,
            rows: 24,
            cols: 80,
        };

        info!(
            "creating {} session for project '{}' (command: '{}', cwd: {})",
            mode.as_str(),
            project_id,
            command_line,
            working_dir
        );

        // openpty + fork is blocking; bound it so a wedged spawn cannot
        // stall the request path.
        let spawn_timeout = self.config.spawn_timeout;
        let spawned = tokio::time::timeout(
            spawn_timeout,
            tokio::task::spawn_blocking(move || PtyActor::spawn(pty_config)),
        )
        .await;

        let handle = match spawned {
            Ok(Ok(Ok(handle))) => handle,
            Ok(Ok(Err(e))) => return Err(EngineError::Pty(e)),
            Ok(Err(e)) => return Err(EngineError::internal(format!("spawn task failed: {}", e))),
            Err(_) => {
                warn!(
                    "session spawn for project '{}' timed out after {:?}",
                    project_id, spawn_timeout
                );
                return Err(EngineError::SpawnTimeout(spawn_timeout));
            }
        };

        let id = uuid::Uuid::now_v7().to_string();
        let now = Utc::now();
        let entry = SessionEntry {
            project_id: project_id.to_string(),
            mode,
            status: SessionStatus::Active,
            working_dir: working_dir.clone(),
            created_at: now,
            last_activity_at: now,
            connections: 0,
            handle: handle.clone(),
        };

        let info = SessionInfo {
            id: id.clone(),
            project_id: project_id.to_string(),
            mode,
            status: SessionStatus::Active,
            focused: false,
            working_dir,
            created_at: now,
            last_activity_at: now,
        };

        // Re-check the cap at insert time: concurrent creates can all pass
        // the fast-path check while their spawns are still in flight.
        let over_cap = {
            let mut inner = self.inner.write().await;
            let count = inner
                .sessions
                .values()
                .filter(|s| s.project_id == project_id)
                .count();
            if count >= self.config.max_sessions_per_project {
                true
            } else {
                inner.sessions.insert(id.clone(), entry);
                false
            }
        };
        if over_cap {
            warn!(
                "project '{}' filled up during spawn, terminating surplus process",
                project_id
            );
            if let Err(e) = handle.terminate(self.config.terminate_grace).await {
                warn!("error terminating surplus session process: {}", e);
            }
            return Err(EngineError::ResourceExhausted(project_id.to_string()));
        }

        let _ = self.events.send(SessionEvent::Created {
            session_id: id.clone(),
            project_id: project_id.to_string(),
        });
        self.persist
            .record_session(SessionRow {
                id: id.clone(),
                project_id: info.project_id.clone(),
                mode: mode.as_str().to_string(),
                status: SessionStatus::Active.as_str().to_string(),
                working_dir: info.working_dir.clone(),
                created_at: now,
            })
            .await;

        self.spawn_exit_monitor(id.clone(), handle);

        Ok(info)
    }

    /// Watch the process and close the session when it exits on its own.
    fn spawn_exit_monitor(self: &Arc<Self>, session_id: String, handle: PtyHandle) {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut exit_rx = handle.exited();
            let code = loop {
                if let Some(code) = *exit_rx.borrow() {
                    break Some(code);
                }
                if exit_rx.changed().await.is_err() {
                    break *exit_rx.borrow();
                }
            };

            let Some(registry) = registry.upgrade() else {
                return;
            };
            registry.handle_process_exit(&session_id, code).await;
        });
    }

    async fn handle_process_exit(self: &Arc<Self>, session_id: &str, exit_code: Option<i32>) {
        let project_id = {
            let mut inner = self.inner.write().await;
            let Some(entry) = inner.sessions.remove(session_id) else {
                // Already closed through the API; nothing to do.
                return;
            };
            if let Some(set) = inner.focus.get_mut(&entry.project_id) {
                set.remove(session_id);
            }
            entry.project_id
        };

        info!(
            "session {} process exited (code: {:?}), closing",
            session_id, exit_code
        );
        let _ = self.events.send(SessionEvent::ProcessExited {
            session_id: session_id.to_string(),
            exit_code,
        });
        let _ = self.events.send(SessionEvent::Closed {
            session_id: session_id.to_string(),
            project_id,
        });
        self.persist.delete_session(session_id).await;
    }

    /// Close a session. Idempotent: closing an unknown id is a no-op.
    pub async fn close(&self, session_id: &str) {
        let removed = {
            let mut inner = self.inner.write().await;
            let Some(entry) = inner.sessions.remove(session_id) else {
                return;
            };
            if let Some(set) = inner.focus.get_mut(&entry.project_id) {
                set.remove(session_id);
            }
            entry
        };

        debug!("closing session {}", session_id);
        if let Err(e) = removed.handle.terminate(self.config.terminate_grace).await {
            warn!("error terminating session {}: {}", session_id, e);
        }

        let _ = self.events.send(SessionEvent::Closed {
            session_id: session_id.to_string(),
            project_id: removed.project_id,
        });
        self.persist.delete_session(session_id).await;
    }

    /// Suspend every active session of a project. Focus membership is
    /// preserved; suspended sessions simply stop counting as focused.
    pub async fn suspend_project(&self, project_id: &str) -> Vec<String> {
        let ids = {
            let mut inner = self.inner.write().await;
            let mut ids = Vec::new();
            for (id, entry) in inner.sessions.iter_mut() {
                if entry.project_id == project_id && entry.status == SessionStatus::Active {
                    entry.status = SessionStatus::Suspended;
                    ids.push(id.clone());
                }
            }
            ids
        };

        if !ids.is_empty() {
            info!("suspended {} sessions in project '{}'", ids.len(), project_id);
            let _ = self.events.send(SessionEvent::Suspended {
                project_id: project_id.to_string(),
                session_ids: ids.clone(),
            });
            for id in &ids {
                self.persist
                    .update_status(id, SessionStatus::Suspended.as_str())
                    .await;
            }
        }
        ids
    }

    pub async fn resume_project(&self, project_id: &str) -> Vec<String> {
        let ids = {
            let mut inner = self.inner.write().await;
            let now = Utc::now();
            let mut ids = Vec::new();
            for (id, entry) in inner.sessions.iter_mut() {
                if entry.project_id == project_id && entry.status == SessionStatus::Suspended {
                    entry.status = SessionStatus::Active;
                    entry.last_activity_at = now;
                    ids.push(id.clone());
                }
            }
            ids
        };

        if !ids.is_empty() {
            info!("resumed {} sessions in project '{}'", ids.len(), project_id);
            let _ = self.events.send(SessionEvent::Resumed {
                project_id: project_id.to_string(),
                session_ids: ids.clone(),
            });
            for id in &ids {
                self.persist
                    .update_status(id, SessionStatus::Active.as_str())
                    .await;
            }
        }
        ids
    }

    /// Add or remove a session from its project's focus set.
    ///
    /// Focusing past capacity is rejected outright; the caller must
    /// unfocus something first. There is no implicit eviction.
    pub async fn set_focus(
        &self,
        project_id: &str,
        session_id: &str,
        focused: bool,
    ) -> Result<(), EngineError> {
        let changed = {
            let mut inner = self.inner.write().await;
            let belongs = inner
                .sessions
                .get(session_id)
                .is_some_and(|s| s.project_id == project_id);
            if !belongs {
                return Err(EngineError::SessionNotFound(session_id.to_string()));
            }

            let set = inner.focus.entry(project_id.to_string()).or_default();
            if focused {
                if set.contains(session_id) {
                    false
                } else if set.len() >= self.config.focus_capacity {
                    return Err(EngineError::FocusLimitExceeded(project_id.to_string()));
                } else {
                    set.insert(session_id.to_string());
                    true
                }
            } else {
                set.remove(session_id)
            }
        };

        if changed {
            debug!(
                "focus {} for session {} in project '{}'",
                if focused { "on" } else { "off" },
                session_id,
                project_id
            );
            let _ = self.events.send(SessionEvent::FocusChanged {
                project_id: project_id.to_string(),
                session_id: session_id.to_string(),
                focused,
            });
        }
        Ok(())
    }

    /// Whether a session is currently eligible for live relay: in its
    /// project's focus set and not suspended.
    pub async fn is_focused(&self, session_id: &str) -> bool {
        let inner = self.inner.read().await;
        let Some(entry) = inner.sessions.get(session_id) else {
            return false;
        };
        entry.status == SessionStatus::Active
            && inner
                .focus
                .get(&entry.project_id)
                .is_some_and(|set| set.contains(session_id))
    }

    pub async fn get(&self, session_id: &str) -> Option<SessionInfo> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(session_id)
            .map(|entry| Self::info_of(&inner, session_id, entry))
    }

    /// List sessions, optionally filtered by project, newest first.
    pub async fn list(&self, project_id: Option<&str>) -> Vec<SessionInfo> {
        let inner = self.inner.read().await;
        let mut list: Vec<SessionInfo> = inner
            .sessions
            .iter()
            .filter(|(_, entry)| project_id.is_none_or(|p| entry.project_id == p))
            .map(|(id, entry)| Self::info_of(&inner, id, entry))
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    fn info_of(inner: &RegistryInner, id: &str, entry: &SessionEntry) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            project_id: entry.project_id.clone(),
            mode: entry.mode,
            status: entry.status,
            focused: inner
                .focus
                .get(&entry.project_id)
                .is_some_and(|set| set.contains(id)),
            working_dir: entry.working_dir.clone(),
            created_at: entry.created_at,
            last_activity_at: entry.last_activity_at,
        }
    }

    pub async fn write_input(&self, session_id: &str, data: &[u8]) -> Result<usize, EngineError> {
        let handle = self.handle_of(session_id).await?;
        self.touch(session_id).await;
        Ok(handle.write(data).await?)
    }

    pub async fn resize(&self, session_id: &str, rows: u16, cols: u16) -> Result<(), EngineError> {
        let handle = self.handle_of(session_id).await?;
        Ok(handle.resize(rows, cols).await?)
    }

    pub async fn subscribe_output(
        &self,
        session_id: &str,
    ) -> Result<broadcast::Receiver<PtyOutput>, EngineError> {
        let handle = self.handle_of(session_id).await?;
        Ok(handle.subscribe())
    }

    async fn handle_of(&self, session_id: &str) -> Result<PtyHandle, EngineError> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .get(session_id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))
    }

    /// Pids of the live session processes, for resource sampling.
    pub async fn session_pids(&self) -> Vec<u32> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .filter_map(|entry| entry.handle.pid())
            .collect()
    }

    /// Record client activity; resets the idle clock.
    pub async fn touch(&self, session_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.sessions.get_mut(session_id) {
            entry.last_activity_at = Utc::now();
        }
    }

    pub async fn mark_attached(&self, session_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.sessions.get_mut(session_id) {
            entry.connections += 1;
            entry.last_activity_at = Utc::now();
        }
    }

    pub async fn mark_detached(&self, session_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.sessions.get_mut(session_id) {
            entry.connections = entry.connections.saturating_sub(1);
            entry.last_activity_at = Utc::now();
        }
    }

    /// Close sessions idle past the timeout. Sessions with a live
    /// connection are never reaped.
    pub async fn reap_idle(&self) -> Vec<String> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.idle_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(1800));

        let idle: Vec<String> = {
            let inner = self.inner.read().await;
            inner
                .sessions
                .iter()
                .filter(|(_, entry)| entry.connections == 0 && entry.last_activity_at < cutoff)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for id in &idle {
            info!("reaping idle session {}", id);
            self.close(id).await;
        }
        idle
    }

    /// Periodic idle sweep. Stops when the registry is dropped.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let registry = Arc::downgrade(self);
        let interval = self.config.reaper_interval;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.reap_idle().await;
            }
        });
    }

    /// Close everything; used during graceful shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<String> = {
            let inner = self.inner.read().await;
            inner.sessions.keys().cloned().collect()
        };
        for id in ids {
            self.close(&id).await;
        }
    }
}
