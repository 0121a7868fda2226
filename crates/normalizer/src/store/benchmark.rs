use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::StoreError;
use crate::model::{Benchmark, ProjectId};

/// Project-scoped reference catalog used to bind normalized items during
/// the benchmark-match stage. Populated and curated externally; the
/// orchestrator only reads and, on first sight of a new identity key,
/// registers a benchmark row for future matches.
#[async_trait]
pub trait BenchmarkStore: Send + Sync {
    async fn find(
        &self,
        project_id: ProjectId,
        normalized_name: &str,
        category: Option<&str>,
    ) -> Result<Option<Benchmark>, StoreError>;

    async fn register(&self, benchmark: Benchmark) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryBenchmarkStore {
    entries: DashMap<(ProjectId, String, Option<String>), Benchmark>,
}

impl InMemoryBenchmarkStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BenchmarkStore for InMemoryBenchmarkStore {
    async fn find(
        &self,
        project_id: ProjectId,
        normalized_name: &str,
        category: Option<&str>,
    ) -> Result<Option<Benchmark>, StoreError> {
        let key = (
            project_id,
            normalized_name.to_string(),
            category.map(|c| c.to_string()),
        );
        Ok(self.entries.get(&key).map(|entry| entry.value().clone()))
    }

    async fn register(&self, benchmark: Benchmark) -> Result<(), StoreError> {
        let key = (
            benchmark.project_id,
            benchmark.normalized_name.clone(),
            benchmark.category.clone(),
        );
        self.entries.insert(key, benchmark);
        Ok(())
    }
}
