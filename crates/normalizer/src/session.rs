use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::OrchestratorError;
use crate::model::{DatabaseId, NormalizationSession, SessionId, SessionStatus};
use crate::store::MetadataStore;

/// Atomic claim/lease manager for per-database sessions. The uniqueness
/// invariant (at most one running session per database) is enforced by the
/// store itself; this layer adds the business rules around it (never retry
/// a failed claim automatically, validate resume/transition preconditions).
pub struct SessionManager {
    store: Arc<dyn MetadataStore>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    /// Atomically create a running session for `database_id`, or report that
    /// one already exists. Never creates a second running session for the
    /// same database, and never retries on failure — callers (the scheduler)
    /// treat a store error as skip-with-event.
    pub async fn try_claim(
        &self,
        database_id: DatabaseId,
        priority: i32,
        timeout_seconds: i64,
    ) -> Result<(SessionId, bool), OrchestratorError> {
        let outcome = self
            .store
            .try_create_session_if_none_running(database_id, priority, timeout_seconds)
            .await?;
        if outcome.created {
            info!(%database_id, session_id = %outcome.session_id, "claimed session");
        } else {
            warn!(%database_id, "database already has a running session, skipping claim");
        }
        Ok((outcome.session_id, outcome.created))
    }

    pub async fn mark(
        &self,
        session_id: SessionId,
        status: SessionStatus,
        finished_at: Option<DateTime<Utc>>,
    ) -> Result<(), OrchestratorError> {
        let current = self.store.get_session(session_id).await?;
        if !current.status.can_transition_to(status) {
            return Err(OrchestratorError::conflict(format!(
                "invalid transition {:?} -> {:?} for session {}",
                current.status, status, session_id
            )));
        }
        self.store
            .update_session_status(session_id, status, finished_at)
            .await?;
        Ok(())
    }

    /// Allowed only if the session is currently `stopped`.
    pub async fn resume(&self, session_id: SessionId) -> Result<(), OrchestratorError> {
        self.store.resume_session(session_id).await?;
        info!(%session_id, "resumed session");
        Ok(())
    }

    /// No-op if the session is no longer running (heartbeat ticks that race
    /// a cancellation should not resurrect a stopped/completed session).
    pub async fn touch(&self, session_id: SessionId) -> Result<(), OrchestratorError> {
        self.store.touch_session(session_id).await?;
        Ok(())
    }

    pub async fn update_progress(
        &self,
        session_id: SessionId,
        processed: i64,
        successful: i64,
        failed: i64,
        total: i64,
    ) -> Result<(), OrchestratorError> {
        self.store
            .update_progress(session_id, processed, successful, failed, total)
            .await?;
        Ok(())
    }

    pub async fn get(&self, session_id: SessionId) -> Result<NormalizationSession, OrchestratorError> {
        Ok(self.store.get_session(session_id).await?)
    }

    /// For sessions with `now - last_activity_at > timeout_seconds`, marks
    /// them failed and returns the count reclaimed.
    pub async fn reap_stale(&self, now: DateTime<Utc>) -> Result<u64, OrchestratorError> {
        let count = self.store.reap_stale(now).await?;
        if count > 0 {
            warn!(count, "reaped stale sessions");
        }
        Ok(count)
    }

    pub async fn list_by_database(
        &self,
        database_id: DatabaseId,
    ) -> Result<Vec<NormalizationSession>, OrchestratorError> {
        Ok(self.store.list_by_database(database_id).await?)
    }

    pub async fn list_running(&self) -> Result<Vec<NormalizationSession>, OrchestratorError> {
        Ok(self.store.list_running().await?)
    }

    pub async fn list_stopped(&self) -> Result<Vec<NormalizationSession>, OrchestratorError> {
        Ok(self.store.list_stopped().await?)
    }

    pub async fn has_running(&self, database_id: DatabaseId) -> Result<bool, OrchestratorError> {
        Ok(self
            .list_by_database(database_id)
            .await?
            .iter()
            .any(|s| s.status == SessionStatus::Running))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteMetadataStore;

    async fn manager() -> SessionManager {
        let store = SqliteMetadataStore::in_memory().await.unwrap();
        SessionManager::new(Arc::new(store))
    }

    #[tokio::test]
    async fn claim_is_exclusive_per_database() {
        let mgr = manager().await;
        let db_id = DatabaseId::new_v4();

        let (first_id, first_created) = mgr.try_claim(db_id, 0, 600).await.unwrap();
        assert!(first_created);

        let (second_id, second_created) = mgr.try_claim(db_id, 0, 600).await.unwrap();
        assert!(!second_created);
        assert_eq!(first_id, second_id);
    }

    #[tokio::test]
    async fn concurrent_claims_yield_exactly_one_created() {
        let mgr = Arc::new(manager().await);
        let db_id = DatabaseId::new_v4();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let mgr = mgr.clone();
            tasks.push(tokio::spawn(
                async move { mgr.try_claim(db_id, 0, 600).await.unwrap() },
            ));
        }
        let results = futures::future::join_all(tasks).await;
        let created_count = results
            .into_iter()
            .filter(|r| r.as_ref().unwrap().1)
            .count();
        assert_eq!(created_count, 1);
    }

    #[tokio::test]
    async fn resume_requires_stopped_status() {
        let mgr = manager().await;
        let db_id = DatabaseId::new_v4();
        let (session_id, _) = mgr.try_claim(db_id, 0, 600).await.unwrap();

        // Still running: resume must fail.
        assert!(mgr.resume(session_id).await.is_err());

        mgr.mark(session_id, SessionStatus::Stopped, Some(Utc::now()))
            .await
            .unwrap();
        mgr.resume(session_id).await.unwrap();

        let session = mgr.get(session_id).await.unwrap();
        assert_eq!(session.status, SessionStatus::Running);
    }

    #[tokio::test]
    async fn reap_stale_fails_timed_out_sessions() {
        let mgr = manager().await;
        let db_id = DatabaseId::new_v4();
        mgr.try_claim(db_id, 0, 1).await.unwrap();

        let future = Utc::now() + chrono::Duration::seconds(10);
        let reaped = mgr.reap_stale(future).await.unwrap();
        assert_eq!(reaped, 1);

        let running = mgr.list_running().await.unwrap();
        assert!(running.is_empty());
    }
}
