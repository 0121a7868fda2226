mod stages;

pub use stages::{basic_normalize, group_items, is_blank_name};

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::AiBroker;
use crate::classify::{KpvedClassifier, Okpd2Classifier};
use crate::error::OrchestratorError;
use crate::events::{Event, EventBus, EventType};
use crate::model::{
    DatabaseId, NormalizedItem, ProcessingLevel, ProjectId, SessionId, StageFlags, Taxonomy,
};
use crate::session::SessionManager;
use crate::source::SourceReader;
use crate::store::{BenchmarkStore, DestinationStore};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLASSIFY_PROGRESS_BATCH: usize = 10;

/// In-memory progress counters, mirrored to the metadata store after each
/// stage. `Atomic*` so the heartbeat task can read them without locking.
#[derive(Default)]
struct Progress {
    processed: AtomicI64,
    successful: AtomicI64,
    failed: AtomicI64,
    total: AtomicI64,
}

impl Progress {
    fn snapshot(&self) -> (i64, i64, i64, i64) {
        (
            self.processed.load(Ordering::Relaxed),
            self.successful.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
            self.total.load(Ordering::Relaxed),
        )
    }
}

/// Executes the fixed stage sequence (open/extract, basic normalize, AI
/// enhance, benchmark match/group, KPVED classify, OKPD2 classify) against
/// one claimed session. One runner per database, dispatched by the
/// scheduler.
pub struct PipelineRunner {
    session_manager: Arc<SessionManager>,
    source: Arc<dyn SourceReader>,
    destination: Arc<dyn DestinationStore>,
    benchmarks: Arc<dyn BenchmarkStore>,
    ai_broker: Option<Arc<AiBroker>>,
    events: Arc<EventBus>,
    taxonomies: Arc<Taxonomies>,
}

pub struct Taxonomies {
    pub kpved: Taxonomy,
    pub okpd2: Taxonomy,
}

impl PipelineRunner {
    pub fn new(
        session_manager: Arc<SessionManager>,
        source: Arc<dyn SourceReader>,
        destination: Arc<dyn DestinationStore>,
        benchmarks: Arc<dyn BenchmarkStore>,
        ai_broker: Option<Arc<AiBroker>>,
        events: Arc<EventBus>,
        taxonomies: Arc<Taxonomies>,
    ) -> Self {
        Self {
            session_manager,
            source,
            destination,
            benchmarks,
            ai_broker,
            events,
            taxonomies,
        }
    }

    /// Runs every stage for `database_id` under `session_id`. Catches panics
    /// at this boundary so one runner's crash never takes down the scheduler
    /// or its sibling runners.
    pub async fn run(
        &self,
        database_id: DatabaseId,
        project_id: ProjectId,
        session_id: SessionId,
        stage_flags: StageFlags,
        cancellation: CancellationToken,
    ) {
        let outcome = std::panic::AssertUnwindSafe(self.run_inner(
            database_id,
            project_id,
            session_id,
            stage_flags,
            cancellation,
        ))
        .catch_unwind()
        .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(%session_id, error = %err, "pipeline runner failed");
                let _ = self
                    .session_manager
                    .mark(session_id, crate::model::SessionStatus::Failed, Some(Utc::now()))
                    .await;
                self.events.publish(Event::new(
                    EventType::DatabaseCompleted,
                    format!("database {} failed: {}", database_id, err),
                ));
            }
            Err(_) => {
                error!(%session_id, "pipeline runner panicked");
                let _ = self
                    .session_manager
                    .mark(session_id, crate::model::SessionStatus::Failed, Some(Utc::now()))
                    .await;
                self.events.publish(Event::new(
                    EventType::DatabaseCompleted,
                    format!("database {} failed: runner panicked", database_id),
                ));
            }
        }
    }

    async fn run_inner(
        &self,
        database_id: DatabaseId,
        project_id: ProjectId,
        session_id: SessionId,
        stage_flags: StageFlags,
        cancellation: CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let progress = Arc::new(Progress::default());
        let heartbeat = self.spawn_heartbeat(session_id, cancellation.clone());

        let result = self
            .run_stages(database_id, project_id, session_id, stage_flags, &cancellation, &progress)
            .await;

        heartbeat.abort();

        match result {
            Ok(Stopped::Completed) => {
                self.session_manager
                    .mark(session_id, crate::model::SessionStatus::Completed, Some(Utc::now()))
                    .await?;
                self.events.publish(Event::new(
                    EventType::DatabaseCompleted,
                    format!("database {} completed", database_id),
                ));
                Ok(())
            }
            Ok(Stopped::Cancelled) => {
                self.session_manager
                    .mark(session_id, crate::model::SessionStatus::Stopped, Some(Utc::now()))
                    .await?;
                self.events.publish(Event::new(
                    EventType::DatabaseCompleted,
                    format!("database {} stopped", database_id),
                ));
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn spawn_heartbeat(
        &self,
        session_id: SessionId,
        cancellation: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let session_manager = self.session_manager.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = session_manager.touch(session_id).await {
                            warn!(%session_id, error = %err, "heartbeat touch failed");
                        }
                    }
                    _ = cancellation.cancelled() => break,
                }
            }
        })
    }

    async fn run_stages(
        &self,
        database_id: DatabaseId,
        project_id: ProjectId,
        session_id: SessionId,
        stage_flags: StageFlags,
        cancellation: &CancellationToken,
        progress: &Progress,
    ) -> Result<Stopped, OrchestratorError> {
        self.source.open(database_id).await?;

        let mut stream = self.source.read_stream(database_id).await?;
        let mut filtered_empty = 0usize;
        let mut items: Vec<crate::model::SourceItem> = Vec::new();
        while let Some(item) = stream.next().await {
            let item = item?;
            if is_blank_name(&item.name) {
                filtered_empty += 1;
                continue;
            }
            items.push(item);
        }

        if filtered_empty > 0 {
            self.events.publish(Event::new(
                EventType::FilteredEmpty,
                format!("filtered {} blank-named rows", filtered_empty),
            ));
        }

        progress.total.store(items.len() as i64, Ordering::Relaxed);
        self.session_manager
            .update_progress(session_id, 0, 0, 0, items.len() as i64)
            .await?;

        if items.is_empty() {
            return Ok(Stopped::Completed);
        }

        let mut normalized: Vec<NormalizedItem> = items
            .iter()
            .map(|item| NormalizedItem {
                session_id,
                source_id: item.id.clone(),
                normalized_name: basic_normalize(&item.name),
                normalized_reference: item.reference.clone(),
                category: item.category.clone(),
                quality_score: None,
                ai_confidence: None,
                processing_level: ProcessingLevel::Basic,
                kpved_code: None,
                kpved_name: None,
                kpved_confidence: None,
                kpved_completed_at: None,
                okpd2_code: None,
                okpd2_name: None,
                okpd2_confidence: None,
                okpd2_completed_at: None,
                created_at: Utc::now(),
            })
            .collect();

        self.destination.upsert_items(normalized.clone()).await?;

        if cancellation.is_cancelled() {
            self.persist_progress(session_id, progress, normalized.len() as i64).await?;
            return Ok(Stopped::Cancelled);
        }

        if stage_flags.use_ai {
            if let Some(broker) = &self.ai_broker {
                if broker.can_proceed() {
                    self.ai_enhance(broker, &mut normalized, cancellation, progress)
                        .await;
                    self.destination.upsert_items(normalized.clone()).await?;
                } else {
                    warn!(%session_id, "all AI circuits open, skipping AI enhance stage");
                }
            }
        }

        if cancellation.is_cancelled() {
            self.persist_progress(session_id, progress, normalized.len() as i64).await?;
            return Ok(Stopped::Cancelled);
        }

        self.benchmark_match(project_id, &mut normalized).await?;
        self.destination.upsert_items(normalized.clone()).await?;

        if cancellation.is_cancelled() {
            self.persist_progress(session_id, progress, normalized.len() as i64).await?;
            return Ok(Stopped::Cancelled);
        }

        if stage_flags.use_kpved {
            if let Some(broker) = &self.ai_broker {
                self.kpved_classify(broker, &mut normalized, cancellation)
                    .await?;
                self.destination.upsert_items(normalized.clone()).await?;
            }
        }

        if cancellation.is_cancelled() {
            self.persist_progress(session_id, progress, normalized.len() as i64).await?;
            return Ok(Stopped::Cancelled);
        }

        if stage_flags.use_okpd2 {
            self.okpd2_classify(&mut normalized);
            self.destination.upsert_items(normalized.clone()).await?;
        }

        let processed_count = normalized.len() as i64;
        let failed_count = progress.failed.load(Ordering::Relaxed);
        let successful = (processed_count - failed_count).max(0);
        progress.processed.store(processed_count, Ordering::Relaxed);
        progress.successful.store(successful, Ordering::Relaxed);
        let (processed, successful, failed, total) = progress.snapshot();
        self.session_manager
            .update_progress(session_id, processed, successful, failed, total)
            .await?;

        Ok(Stopped::Completed)
    }

    async fn persist_progress(
        &self,
        session_id: SessionId,
        progress: &Progress,
        processed: i64,
    ) -> Result<(), OrchestratorError> {
        let (_, _, failed, total) = progress.snapshot();
        progress.processed.store(processed, Ordering::Relaxed);
        let successful = (processed - failed).max(0);
        progress.successful.store(successful, Ordering::Relaxed);
        self.session_manager
            .update_progress(session_id, processed, successful, failed, total)
            .await?;
        Ok(())
    }

    async fn ai_enhance(
        &self,
        broker: &AiBroker,
        items: &mut [NormalizedItem],
        cancellation: &CancellationToken,
        progress: &Progress,
    ) {
        for item in items.iter_mut() {
            if cancellation.is_cancelled() {
                return;
            }
            match broker
                .normalize_with_confidence(&item.normalized_name, cancellation)
                .await
            {
                Ok((enhanced, confidence)) => {
                    item.normalized_name = enhanced;
                    item.ai_confidence = Some(confidence);
                    item.processing_level = ProcessingLevel::AiEnhanced;
                }
                Err(err) => {
                    debug_failed_item(&item.source_id, &err.to_string());
                    progress.failed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    async fn benchmark_match(
        &self,
        project_id: ProjectId,
        items: &mut [NormalizedItem],
    ) -> Result<(), OrchestratorError> {
        for item in items.iter_mut() {
            let existing = self
                .benchmarks
                .find(project_id, &item.normalized_name, item.category.as_deref())
                .await?;
            match existing {
                Some(_) => {
                    item.processing_level = ProcessingLevel::Benchmark;
                }
                None => {
                    self.benchmarks
                        .register(crate::model::Benchmark {
                            project_id,
                            normalized_name: item.normalized_name.clone(),
                            category: item.category.clone(),
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }

    async fn kpved_classify(
        &self,
        broker: &AiBroker,
        items: &mut [NormalizedItem],
        cancellation: &CancellationToken,
    ) -> Result<(), OrchestratorError> {
        let classifier = KpvedClassifier::new(&self.taxonomies.kpved.roots);
        let mut done = 0usize;
        let total = items.len();
        for item in items.iter_mut() {
            if cancellation.is_cancelled() {
                break;
            }
            if item.kpved_code.is_some() {
                continue;
            }
            let result = classifier
                .classify(broker, &item.normalized_name, item.category.as_deref(), cancellation)
                .await;
            item.kpved_code = result.code;
            item.kpved_name = result.name;
            item.kpved_confidence = result.confidence;
            item.kpved_completed_at = Some(Utc::now());

            done += 1;
            if done % CLASSIFY_PROGRESS_BATCH == 0 || done == total {
                self.events.publish(Event::new(
                    EventType::SessionProgress,
                    format!("kpved classified {}/{}", done, total),
                ));
            }
        }
        Ok(())
    }

    fn okpd2_classify(&self, items: &mut [NormalizedItem]) {
        let classifier = Okpd2Classifier::new(&self.taxonomies.okpd2.roots);
        let total = items.len();
        for (index, item) in items.iter_mut().enumerate() {
            let result = classifier.classify(&item.normalized_name);
            item.okpd2_code = result.code;
            item.okpd2_name = result.name;
            item.okpd2_confidence = result.confidence;
            item.okpd2_completed_at = Some(Utc::now());

            let done = index + 1;
            if done % CLASSIFY_PROGRESS_BATCH == 0 || done == total {
                self.events.publish(Event::new(
                    EventType::SessionProgress,
                    format!("okpd2 classified {}/{}", done, total),
                ));
            }
        }
    }
}

fn debug_failed_item(source_id: &str, error: &str) {
    tracing::debug!(source_id, error, "ai enhance failed for item, keeping basic result");
}

enum Stopped {
    Completed,
    Cancelled,
}

use futures::FutureExt;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SourceItem;
    use async_trait::async_trait;

    struct FixedSource {
        items: Vec<SourceItem>,
    }

    #[async_trait]
    impl SourceReader for FixedSource {
        async fn open(&self, _database_id: DatabaseId) -> Result<(), OrchestratorError> {
            Ok(())
        }

        async fn read_stream(
            &self,
            _database_id: DatabaseId,
        ) -> Result<crate::source::SourceItemStream, OrchestratorError> {
            let items = self.items.clone();
            Ok(Box::pin(futures::stream::iter(
                items.into_iter().map(Ok::<SourceItem, OrchestratorError>),
            )))
        }
    }

    struct FailingSource;

    #[async_trait]
    impl SourceReader for FailingSource {
        async fn open(&self, _database_id: DatabaseId) -> Result<(), OrchestratorError> {
            Err(OrchestratorError::not_found("source file missing"))
        }

        async fn read_stream(
            &self,
            _database_id: DatabaseId,
        ) -> Result<crate::source::SourceItemStream, OrchestratorError> {
            Ok(Box::pin(futures::stream::iter(std::iter::empty::<
                Result<SourceItem, OrchestratorError>,
            >())))
        }
    }

    fn source_item(id: &str, name: &str) -> SourceItem {
        SourceItem {
            id: id.to_string(),
            reference: None,
            code: None,
            name: name.to_string(),
            category: None,
            attributes: None,
        }
    }

    async fn runner(source: Arc<dyn SourceReader>) -> (Arc<SessionManager>, PipelineRunner, SessionId) {
        let store = crate::store::SqliteMetadataStore::in_memory().await.unwrap();
        let session_manager = Arc::new(SessionManager::new(Arc::new(store)));
        let database_id = DatabaseId::new_v4();
        let (session_id, created) = session_manager.try_claim(database_id, 0, 600).await.unwrap();
        assert!(created);

        let destination = Arc::new(crate::store::InMemoryDestinationStore::new());
        let benchmarks = Arc::new(crate::store::InMemoryBenchmarkStore::new());
        let events = crate::events::EventBus::new();
        let taxonomies = Arc::new(Taxonomies {
            kpved: Taxonomy { roots: vec![] },
            okpd2: Taxonomy { roots: vec![] },
        });

        let pipeline = PipelineRunner::new(
            session_manager.clone(),
            source,
            destination,
            benchmarks,
            None,
            events,
            taxonomies,
        );
        (session_manager, pipeline, session_id)
    }

    #[tokio::test]
    async fn empty_source_completes_immediately() {
        let source = Arc::new(FixedSource { items: vec![] });
        let (session_manager, pipeline, session_id) = runner(source).await;
        let database_id = session_manager.get(session_id).await.unwrap().project_database_id;
        let project_id = ProjectId::new_v4();

        pipeline
            .run(database_id, project_id, session_id, StageFlags::default(), CancellationToken::new())
            .await;

        let session = session_manager.get(session_id).await.unwrap();
        assert_eq!(session.status, crate::model::SessionStatus::Completed);
        assert_eq!(session.total, 0);
    }

    #[tokio::test]
    async fn all_blank_names_are_filtered_and_session_completes() {
        let source = Arc::new(FixedSource {
            items: vec![source_item("1", "   "), source_item("2", "")],
        });
        let (session_manager, pipeline, session_id) = runner(source).await;
        let database_id = session_manager.get(session_id).await.unwrap().project_database_id;
        let project_id = ProjectId::new_v4();

        pipeline
            .run(database_id, project_id, session_id, StageFlags::default(), CancellationToken::new())
            .await;

        let session = session_manager.get(session_id).await.unwrap();
        assert_eq!(session.status, crate::model::SessionStatus::Completed);
        assert_eq!(session.total, 0);
    }

    #[tokio::test]
    async fn missing_source_fails_the_session() {
        let source = Arc::new(FailingSource);
        let (session_manager, pipeline, session_id) = runner(source).await;
        let database_id = session_manager.get(session_id).await.unwrap().project_database_id;
        let project_id = ProjectId::new_v4();

        pipeline
            .run(database_id, project_id, session_id, StageFlags::default(), CancellationToken::new())
            .await;

        let session = session_manager.get(session_id).await.unwrap();
        assert_eq!(session.status, crate::model::SessionStatus::Failed);
    }

    #[tokio::test]
    async fn grouping_example_merges_identity_keys() {
        let source = Arc::new(FixedSource {
            items: vec![
                source_item("1", "ОOO  Ромашка "),
                source_item("2", "  Ромашка "),
                source_item("3", "ИП Иванов"),
            ],
        });
        let flags = StageFlags {
            use_ai: false,
            use_kpved: false,
            use_okpd2: false,
        };
        let (session_manager, pipeline, session_id) = runner(source).await;
        let database_id = session_manager.get(session_id).await.unwrap().project_database_id;
        let project_id = ProjectId::new_v4();

        pipeline
            .run(database_id, project_id, session_id, flags, CancellationToken::new())
            .await;

        let session = session_manager.get(session_id).await.unwrap();
        assert_eq!(session.status, crate::model::SessionStatus::Completed);
        assert_eq!(session.total, 3);
        assert_eq!(session.processed, session.successful + session.failed);
        assert_eq!(session.successful, 3);
        assert_eq!(session.failed, 0);
    }
}
