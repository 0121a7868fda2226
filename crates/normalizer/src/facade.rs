use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::broker::AiBroker;
use crate::config::Config;
use crate::error::OrchestratorError;
use crate::events::EventReceiver;
use crate::metrics::{self, Stats};
use crate::model::{DatabaseId, NormalizationSession, ProjectId, SessionId, StageFlags};
use crate::scheduler::Scheduler;
use crate::session::SessionManager;

/// External collaborator (owned by the out-of-scope CRUD surface) that
/// resolves which databases under a project are eligible to run.
#[async_trait]
pub trait DatabaseLister: Send + Sync {
    async fn list_active(&self, project_id: ProjectId) -> Result<Vec<DatabaseId>, OrchestratorError>;
}

#[derive(Debug, Clone, Serialize)]
pub struct StartResult {
    pub status: String,
    pub databases_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatusView {
    pub session_id: SessionId,
    pub status: String,
    pub processed: i64,
    pub successful: i64,
    pub failed: i64,
    pub total: i64,
    pub progress_percent: f64,
}

impl From<NormalizationSession> for SessionStatusView {
    fn from(session: NormalizationSession) -> Self {
        Self {
            session_id: session.id,
            status: format!("{:?}", session.status).to_lowercase(),
            processed: session.processed,
            successful: session.successful,
            failed: session.failed,
            total: session.total,
            progress_percent: session.progress_percent(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub drained: bool,
    pub grace_exceeded: bool,
}

/// The single entry point external callers (the omitted HTTP/CLI surface)
/// construct and hold. Wires the Session Manager, Scheduler, AI Broker,
/// Event Bus, Metrics, and Config together and implements the graceful
/// shutdown sequence of spec.md §5.
pub struct OrchestratorHandle {
    session_manager: Arc<SessionManager>,
    scheduler: Arc<Scheduler>,
    ai_broker: Option<Arc<AiBroker>>,
    events: Arc<crate::events::EventBus>,
    config: Config,
    databases: Arc<dyn DatabaseLister>,
    accepting: std::sync::atomic::AtomicBool,
    cancellation: CancellationToken,
}

impl OrchestratorHandle {
    pub fn new(
        session_manager: Arc<SessionManager>,
        scheduler: Arc<Scheduler>,
        ai_broker: Option<Arc<AiBroker>>,
        events: Arc<crate::events::EventBus>,
        config: Config,
        databases: Arc<dyn DatabaseLister>,
    ) -> Self {
        Self {
            session_manager,
            scheduler,
            ai_broker,
            events,
            config,
            databases,
            accepting: std::sync::atomic::AtomicBool::new(true),
            cancellation: CancellationToken::new(),
        }
    }

    /// Claims and dispatches runners for every eligible database under
    /// `project_id`, or just `database_id` if given. `overrides` replaces
    /// the configured `stage_flags` for this run only.
    pub async fn start(
        &self,
        project_id: ProjectId,
        database_id: Option<DatabaseId>,
        overrides: StageFlags,
    ) -> Result<StartResult, OrchestratorError> {
        if !self.accepting.load(std::sync::atomic::Ordering::Acquire) {
            return Err(OrchestratorError::conflict(
                "orchestrator is shutting down, not accepting new jobs",
            ));
        }

        let database_ids = match database_id {
            Some(id) => vec![id],
            None => self.databases.list_active(project_id).await?,
        };

        let config = self.config.snapshot().await;
        let databases: Vec<_> = database_ids
            .into_iter()
            .map(|id| (id, project_id, config.session_defaults.priority))
            .collect();
        let databases_count = databases.len();

        let scheduler = self.scheduler.clone();
        let timeout_seconds = config.session_defaults.timeout_seconds;
        let cancellation = self.cancellation.clone();
        tokio::spawn(async move {
            scheduler
                .run_batch(databases, timeout_seconds, overrides, cancellation)
                .await
        });

        Ok(StartResult {
            status: "started".to_string(),
            databases_count,
        })
    }

    /// Cancels the session's in-flight runner, which persists the `Stopped`
    /// status itself once it observes cancellation. If no live runner is
    /// found (it already finished, or belongs to a prior process) marks the
    /// session stopped directly instead.
    pub async fn stop(&self, session_id: SessionId) -> Result<(), OrchestratorError> {
        if self.scheduler.cancel_session(session_id) {
            return Ok(());
        }
        self.session_manager
            .mark(session_id, crate::model::SessionStatus::Stopped, Some(chrono::Utc::now()))
            .await
    }

    pub async fn resume(&self, session_id: SessionId) -> Result<(), OrchestratorError> {
        self.session_manager.resume(session_id).await
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    pub async fn status(&self, session_id: SessionId) -> Result<SessionStatusView, OrchestratorError> {
        Ok(self.session_manager.get(session_id).await?.into())
    }

    pub fn stats(&self) -> Option<Stats> {
        self.ai_broker
            .as_ref()
            .map(|broker| metrics::snapshot(broker, self.events.dropped_count()))
    }

    /// (1) stop accepting new jobs, (2) cancel the scheduler's token, (3)
    /// wait for runners to drain within `grace`, (4) emit a terminal event,
    /// (5) close the bus. Runners still running past the deadline are
    /// abandoned; `reap_stale` reclaims their sessions on next startup.
    pub async fn shutdown(&self, grace: Duration) -> ShutdownReport {
        self.accepting.store(false, std::sync::atomic::Ordering::Release);
        self.cancellation.cancel();

        let deadline = tokio::time::Instant::now() + grace;
        let mut grace_exceeded = false;
        loop {
            let running = self.session_manager.list_running().await.unwrap_or_default();
            if running.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                grace_exceeded = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        info!(grace_exceeded, "orchestrator shutdown complete");
        self.events.shutdown();

        ShutdownReport {
            drained: !grace_exceeded,
            grace_exceeded,
        }
    }
}
