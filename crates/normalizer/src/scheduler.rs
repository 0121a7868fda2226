use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::events::{Event, EventBus, EventType};
use crate::model::{DatabaseId, ProjectId, SessionId, SessionStatus, StageFlags};
use crate::pipeline::PipelineRunner;
use crate::session::SessionManager;

/// Per-status counts emitted in the scheduler's aggregate completion event.
#[derive(Debug, Default, Clone, Copy)]
pub struct RunSummary {
    pub completed: u32,
    pub failed: u32,
    pub stopped: u32,
    pub skipped: u32,
}

/// Launches one Pipeline Runner per eligible database under a bounded
/// worker pool, pre-filtering databases that already have a running
/// session and handing each dispatched runner its own child of the
/// batch's cancellation token, tracked by session id so a single session
/// can be cancelled without affecting its siblings.
pub struct Scheduler {
    session_manager: Arc<SessionManager>,
    runner: Arc<PipelineRunner>,
    events: Arc<EventBus>,
    max_workers: usize,
    session_tokens: Arc<DashMap<SessionId, CancellationToken>>,
}

impl Scheduler {
    pub fn new(
        session_manager: Arc<SessionManager>,
        runner: Arc<PipelineRunner>,
        events: Arc<EventBus>,
        max_workers: usize,
    ) -> Self {
        Self {
            session_manager,
            runner,
            events,
            max_workers,
            session_tokens: Arc::new(DashMap::new()),
        }
    }

    /// Cancels the in-flight runner for `session_id`, if one is tracked here.
    /// Returns `false` when no live token is found (the runner already
    /// finished, or the session belongs to a prior process) so the caller can
    /// fall back to marking the session stopped directly.
    pub fn cancel_session(&self, session_id: SessionId) -> bool {
        match self.session_tokens.get(&session_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Runs one pass over `databases`, dispatching by priority descending
    /// then database id ascending. `priority` and `timeout_seconds` apply to
    /// every newly claimed session in this batch.
    pub async fn run_batch(
        &self,
        mut databases: Vec<(DatabaseId, ProjectId, i32)>,
        timeout_seconds: i64,
        stage_flags: StageFlags,
        cancellation: CancellationToken,
    ) -> RunSummary {
        databases.sort_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));

        let capacity = self.max_workers.max(1).min(databases.len().max(1));
        let semaphore = Arc::new(Semaphore::new(capacity));

        let completed = Arc::new(AtomicU32::new(0));
        let failed = Arc::new(AtomicU32::new(0));
        let stopped = Arc::new(AtomicU32::new(0));
        let skipped = Arc::new(AtomicU32::new(0));

        let started_at = Instant::now();
        let mut handles = Vec::new();

        for (database_id, project_id, priority) in databases {
            if cancellation.is_cancelled() {
                skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            if self
                .session_manager
                .has_running(database_id)
                .await
                .unwrap_or(false)
            {
                skipped.fetch_add(1, Ordering::Relaxed);
                self.events.publish(Event::new(
                    EventType::DatabaseSkipped,
                    format!("database {} already has a running session", database_id),
                ));
                continue;
            }

            let (session_id, created) = match self
                .session_manager
                .try_claim(database_id, priority, timeout_seconds)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    skipped.fetch_add(1, Ordering::Relaxed);
                    self.events.publish(Event::new(
                        EventType::DatabaseSkipped,
                        format!("database {} claim failed: {}", database_id, err),
                    ));
                    continue;
                }
            };
            if !created {
                skipped.fetch_add(1, Ordering::Relaxed);
                self.events.publish(Event::new(
                    EventType::DatabaseSkipped,
                    format!("database {} already has a running session", database_id),
                ));
                continue;
            }

            self.events.publish(Event::new(
                EventType::DatabaseStarted,
                format!("database {} started", database_id),
            ));

            let session_token = cancellation.child_token();
            self.session_tokens.insert(session_id, session_token.clone());

            let semaphore = semaphore.clone();
            let runner = self.runner.clone();
            let session_manager = self.session_manager.clone();
            let session_tokens = self.session_tokens.clone();
            let completed = completed.clone();
            let failed = failed.clone();
            let stopped = stopped.clone();

            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                runner
                    .run(database_id, project_id, session_id, stage_flags, session_token)
                    .await;
                session_tokens.remove(&session_id);

                match session_manager.get(session_id).await {
                    Ok(session) => match session.status {
                        SessionStatus::Completed => {
                            completed.fetch_add(1, Ordering::Relaxed);
                        }
                        SessionStatus::Failed => {
                            failed.fetch_add(1, Ordering::Relaxed);
                        }
                        SessionStatus::Stopped => {
                            stopped.fetch_add(1, Ordering::Relaxed);
                        }
                        SessionStatus::Running => {}
                    },
                    Err(_) => {
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }

        let duration = started_at.elapsed();
        let summary = RunSummary {
            completed: completed.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
            stopped: stopped.load(Ordering::Relaxed),
            skipped: skipped.load(Ordering::Relaxed),
        };

        let total_dispatched =
            summary.completed + summary.failed + summary.stopped;
        let avg_ms = if total_dispatched > 0 {
            duration.as_millis() as u64 / total_dispatched as u64
        } else {
            0
        };

        info!(?summary, duration_ms = duration.as_millis() as u64, "batch finished");
        self.events.publish(Event::new(
            EventType::AggregateComplete,
            format!(
                "completed={} failed={} stopped={} skipped={} duration_ms={} avg_ms={}",
                summary.completed, summary.failed, summary.stopped, summary.skipped,
                duration.as_millis(), avg_ms
            ),
        ));

        summary
    }
}
