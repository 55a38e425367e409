//! Optional SQLite persistence for session metadata.
//!
//! Strictly best-effort: every write goes through the circuit breaker and
//! failures are absorbed with a warning. The in-memory registry is the
//! single source of truth; rows here only let an operator see what was
//! running across a restart.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::sync::Arc;
use tracing::{info, warn};

use crate::breaker::CircuitBreaker;

#[derive(Clone)]
pub struct SqliteStore {
    pub pool: SqlitePool,
}

/// A session row as persisted. Deliberately flat; the live `Session` holds
/// the process handle and is never reconstructed from this.
#[derive(Clone, Debug)]
pub struct SessionRow {
    pub id: String,
    pub project_id: String,
    pub mode: String,
    pub status: String,
    pub working_dir: String,
    pub created_at: DateTime<Utc>,
}

impl SqliteStore {
    pub async fn connect(db_url: &str) -> Result<Self> {
        info!("connecting to session store: {}", db_url);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .connect(db_url)
            .await
            .with_context(|| format!("failed to connect to session store: {}", db_url))?;

        run_migrations(&pool).await?;

        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    pub async fn upsert_session(&self, row: &SessionRow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sessions (id, project_id, mode, status, working_dir, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, unixepoch())
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                updated_at = unixepoch()
            "#,
        )
        .bind(&row.id)
        .bind(&row.project_id)
        .bind(&row.mode)
        .bind(&row.status)
        .bind(&row.working_dir)
        .bind(row.created_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_status(&self, session_id: &str, status: &str) -> Result<()> {
        sqlx::query("UPDATE sessions SET status = ?, updated_at = unixepoch() WHERE id = ?")
            .bind(status)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM sessions WHERE id = ?")
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        let rows = sqlx::query(
            "SELECT id, project_id, mode, status, working_dir, created_at FROM sessions ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| SessionRow {
                id: row.get("id"),
                project_id: row.get("project_id"),
                mode: row.get("mode"),
                status: row.get("status"),
                working_dir: row.get("working_dir"),
                created_at: DateTime::from_timestamp(row.get::<i64, _>("created_at"), 0)
                    .unwrap_or_else(Utc::now),
            })
            .collect())
    }
}

const SCHEMA_VERSION: i64 = 1;

// Run migrations manually; keeps the binary self-contained without a
// packaged migrations directory.
pub(crate) async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL DEFAULT (unixepoch()),
            description TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    let current_version: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(version), 0) FROM schema_version")
            .fetch_one(pool)
            .await
            .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        anyhow::bail!(
            "session store schema version {} is newer than supported version {}",
            current_version,
            SCHEMA_VERSION
        );
    }

    if current_version == SCHEMA_VERSION {
        return Ok(());
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            mode TEXT NOT NULL,
            status TEXT NOT NULL,
            working_dir TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL DEFAULT (unixepoch())
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status)")
        .execute(pool)
        .await?;

    sqlx::query("INSERT OR REPLACE INTO schema_version (version, description) VALUES (?, ?)")
        .bind(SCHEMA_VERSION)
        .bind("session metadata")
        .execute(pool)
        .await?;

    info!("session store migrated to schema version {}", SCHEMA_VERSION);
    Ok(())
}

/// Registry-facing persistence handle. When the store is disabled every
/// call is a no-op; when enabled, calls run under the breaker and errors
/// never propagate to the caller.
#[derive(Clone)]
pub struct PersistHandle {
    store: Option<Arc<SqliteStore>>,
    breaker: Arc<CircuitBreaker>,
}

impl PersistHandle {
    pub fn new(store: Option<Arc<SqliteStore>>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { store, breaker }
    }

    pub fn enabled(&self) -> bool {
        self.store.is_some()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn record_session(&self, row: SessionRow) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let id = row.id.clone();
        let result = self
            .breaker
            .call(move || async move { store.upsert_session(&row).await })
            .await;
        if let Err(e) = result {
            warn!("failed to persist session {}: {}", id, e);
        }
    }

    pub async fn update_status(&self, session_id: &str, status: &str) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let id = session_id.to_string();
        let st = status.to_string();
        let result = self
            .breaker
            .call(move || async move { store.update_status(&id, &st).await })
            .await;
        if let Err(e) = result {
            warn!("failed to persist status for session {}: {}", session_id, e);
        }
    }

    pub async fn delete_session(&self, session_id: &str) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let id = session_id.to_string();
        let result = self
            .breaker
            .call(move || async move { store.delete_session(&id).await })
            .await;
        if let Err(e) = result {
            warn!("failed to delete persisted session {}: {}", session_id, e);
        }
    }
}
