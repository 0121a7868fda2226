use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{DatabaseId, NormalizationSession, SessionId, SessionStatus};

const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Result of an atomic claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimOutcome {
    pub session_id: SessionId,
    pub created: bool,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn try_create_session_if_none_running(
        &self,
        database_id: DatabaseId,
        priority: i32,
        timeout_seconds: i64,
    ) -> Result<ClaimOutcome, StoreError>;

    async fn update_session_status(
        &self,
        id: SessionId,
        status: SessionStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn touch_session(&self, id: SessionId) -> Result<(), StoreError>;

    async fn resume_session(&self, id: SessionId) -> Result<(), StoreError>;

    async fn update_progress(
        &self,
        id: SessionId,
        processed: i64,
        successful: i64,
        failed: i64,
        total: i64,
    ) -> Result<(), StoreError>;

    async fn get_session(&self, id: SessionId) -> Result<NormalizationSession, StoreError>;

    async fn reap_stale(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn list_by_database(
        &self,
        database_id: DatabaseId,
    ) -> Result<Vec<NormalizationSession>, StoreError>;

    async fn list_running(&self) -> Result<Vec<NormalizationSession>, StoreError>;

    async fn list_stopped(&self) -> Result<Vec<NormalizationSession>, StoreError>;
}

pub struct SqliteMetadataStore {
    pool: Pool<Sqlite>,
}

fn status_to_str(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Running => "running",
        SessionStatus::Completed => "completed",
        SessionStatus::Failed => "failed",
        SessionStatus::Stopped => "stopped",
    }
}

fn status_from_str(s: &str) -> SessionStatus {
    match s {
        "running" => SessionStatus::Running,
        "completed" => SessionStatus::Completed,
        "failed" => SessionStatus::Failed,
        _ => SessionStatus::Stopped,
    }
}

fn row_to_session(row: &sqlx::sqlite::SqliteRow) -> Result<NormalizationSession, StoreError> {
    let id: String = row.try_get("id")?;
    let project_database_id: String = row.try_get("project_database_id")?;
    Ok(NormalizationSession {
        id: Uuid::parse_str(&id).map_err(|e| StoreError::NotFound(e.to_string()))?,
        project_database_id: Uuid::parse_str(&project_database_id)
            .map_err(|e| StoreError::NotFound(e.to_string()))?,
        status: status_from_str(row.try_get::<String, _>("status")?.as_str()),
        priority: row.try_get("priority")?,
        timeout_seconds: row.try_get("timeout_seconds")?,
        created_at: row.try_get("created_at")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        last_activity_at: row.try_get("last_activity_at")?,
        processed: row.try_get("processed")?,
        successful: row.try_get("successful")?,
        failed: row.try_get("failed")?,
        total: row.try_get("total")?,
    })
}

impl SqliteMetadataStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = sqlx::SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let current: Option<i32> =
            sqlx::query_scalar("SELECT MAX(version) FROM schema_version")
                .fetch_one(&self.pool)
                .await
                .unwrap_or(None);

        if current.unwrap_or(0) < CURRENT_SCHEMA_VERSION {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS sessions (
                    id TEXT PRIMARY KEY,
                    project_database_id TEXT NOT NULL,
                    status TEXT NOT NULL,
                    priority INTEGER NOT NULL,
                    timeout_seconds INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    started_at TEXT NOT NULL,
                    finished_at TEXT,
                    last_activity_at TEXT NOT NULL,
                    processed INTEGER NOT NULL DEFAULT 0,
                    successful INTEGER NOT NULL DEFAULT 0,
                    failed INTEGER NOT NULL DEFAULT 0,
                    total INTEGER NOT NULL DEFAULT 0
                )
                "#,
            )
            .execute(&self.pool)
            .await?;

            // The uniqueness invariant (at most one running session per
            // database) is enforced by the store itself via a partial
            // unique index, not by application-level read-then-write logic.
            sqlx::query(
                r#"
                CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_one_running
                ON sessions(project_database_id)
                WHERE status = 'running'
                "#,
            )
            .execute(&self.pool)
            .await?;

            sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
                .bind(CURRENT_SCHEMA_VERSION)
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn try_create_session_if_none_running(
        &self,
        database_id: DatabaseId,
        priority: i32,
        timeout_seconds: i64,
    ) -> Result<ClaimOutcome, StoreError> {
        let session_id = Uuid::new_v4();
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO sessions (
                id, project_database_id, status, priority, timeout_seconds,
                created_at, started_at, last_activity_at
            ) VALUES (?, ?, 'running', ?, ?, ?, ?, ?)
            "#,
        )
        .bind(session_id.to_string())
        .bind(database_id.to_string())
        .bind(priority)
        .bind(timeout_seconds)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(ClaimOutcome {
                session_id,
                created: true,
            }),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                let existing: String = sqlx::query_scalar(
                    "SELECT id FROM sessions WHERE project_database_id = ? AND status = 'running'",
                )
                .bind(database_id.to_string())
                .fetch_one(&self.pool)
                .await?;
                Ok(ClaimOutcome {
                    session_id: Uuid::parse_str(&existing)
                        .map_err(|e| StoreError::NotFound(e.to_string()))?,
                    created: false,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update_session_status(
        &self,
        id: SessionId,
        status: SessionStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sessions SET status = ?, finished_at = ?, last_activity_at = ? WHERE id = ?",
        )
        .bind(status_to_str(status))
        .bind(finished_at)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_session(&self, id: SessionId) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sessions SET last_activity_at = ? WHERE id = ? AND status = 'running'",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn resume_session(&self, id: SessionId) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE sessions SET status = 'running', last_activity_at = ?, finished_at = NULL WHERE id = ? AND status = 'stopped'",
        )
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "session {} is not stopped",
                id
            )));
        }
        Ok(())
    }

    async fn update_progress(
        &self,
        id: SessionId,
        processed: i64,
        successful: i64,
        failed: i64,
        total: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sessions SET processed = ?, successful = ?, failed = ?, total = ?, last_activity_at = ? WHERE id = ?",
        )
        .bind(processed)
        .bind(successful)
        .bind(failed)
        .bind(total)
        .bind(Utc::now())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_session(&self, id: SessionId) -> Result<NormalizationSession, StoreError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("session {} not found", id)))?;
        row_to_session(&row)
    }

    async fn reap_stale(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await?;

        let mut reaped = 0u64;
        for row in rows {
            let session = row_to_session(&row)?;
            if session.is_stale(now) {
                self.update_session_status(session.id, SessionStatus::Failed, Some(now))
                    .await?;
                reaped += 1;
            }
        }
        Ok(reaped)
    }

    async fn list_by_database(
        &self,
        database_id: DatabaseId,
    ) -> Result<Vec<NormalizationSession>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE project_database_id = ? ORDER BY created_at DESC")
            .bind(database_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_session).collect()
    }

    async fn list_running(&self) -> Result<Vec<NormalizationSession>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_session).collect()
    }

    async fn list_stopped(&self) -> Result<Vec<NormalizationSession>, StoreError> {
        let rows = sqlx::query("SELECT * FROM sessions WHERE status = 'stopped'")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_session).collect()
    }
}
