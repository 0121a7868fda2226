use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type ClientId = Uuid;
pub type ProjectId = Uuid;
pub type DatabaseId = Uuid;
pub type SessionId = Uuid;

/// Read-only identifier the orchestrator treats as owned by the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Database {
    pub id: DatabaseId,
    pub project_id: ProjectId,
    pub file_path: PathBuf,
    pub is_active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Failed,
    Stopped,
}

impl SessionStatus {
    /// Whether `self -> next` is an allowed transition per the session lifecycle.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Running, Completed) | (Running, Failed) | (Running, Stopped) | (Stopped, Running)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizationSession {
    pub id: SessionId,
    pub project_database_id: DatabaseId,
    pub status: SessionStatus,
    pub priority: i32,
    pub timeout_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub processed: i64,
    pub successful: i64,
    pub failed: i64,
    pub total: i64,
}

impl NormalizationSession {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Running
            && (now - self.last_activity_at).num_seconds() > self.timeout_seconds
    }

    pub fn progress_percent(&self) -> f64 {
        if self.total <= 0 {
            return 0.0;
        }
        (self.processed as f64 / self.total as f64 * 100.0).clamp(0.0, 100.0)
    }
}

/// A row read from the source catalog. Immutable within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceItem {
    pub id: String,
    pub reference: Option<String>,
    pub code: Option<String>,
    pub name: String,
    pub category: Option<String>,
    pub attributes: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingLevel {
    Basic,
    AiEnhanced,
    Benchmark,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedItem {
    pub session_id: SessionId,
    pub source_id: String,
    pub normalized_name: String,
    pub normalized_reference: Option<String>,
    pub category: Option<String>,
    pub quality_score: Option<f64>,
    pub ai_confidence: Option<f64>,
    pub processing_level: ProcessingLevel,
    pub kpved_code: Option<String>,
    pub kpved_name: Option<String>,
    pub kpved_confidence: Option<f64>,
    pub kpved_completed_at: Option<DateTime<Utc>>,
    pub okpd2_code: Option<String>,
    pub okpd2_name: Option<String>,
    pub okpd2_confidence: Option<f64>,
    pub okpd2_completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemAttribute {
    pub session_id: SessionId,
    pub source_id: String,
    pub attr_type: String,
    pub name: String,
    pub value: String,
    pub unit: Option<String>,
    pub confidence: Option<f64>,
}

/// Derived view over NormalizedItems sharing an identity key. Not separately stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub normalized_name: String,
    pub normalized_reference: Option<String>,
    pub category: Option<String>,
    pub merged_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Benchmark {
    pub project_id: ProjectId,
    pub normalized_name: String,
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub speed_tier: Option<String>,
    pub quality_tier: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    pub enabled: bool,
    pub priority: u32,
    pub channels: usize,
    pub max_workers: usize,
    pub rate_limit: f64,
    pub timeout_seconds: u64,
    pub models: Vec<ModelConfig>,
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.is_empty() {
            return Err(format!("provider '{}' has an empty base_url", self.name));
        }
        if self.max_workers == 0 {
            return Err(format!(
                "provider '{}' has max_workers <= 0",
                self.name
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub provider: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// One node of a classifier code tree (KPVED or OKPD2). Loaded and owned
/// externally (taxonomy file loading is out of scope); the orchestrator only
/// walks the tree it is handed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyNode {
    pub code: String,
    pub name: String,
    pub children: Vec<TaxonomyNode>,
}

impl TaxonomyNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Taxonomy {
    pub roots: Vec<TaxonomyNode>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StageFlags {
    pub use_ai: bool,
    pub use_kpved: bool,
    pub use_okpd2: bool,
}

impl Default for StageFlags {
    fn default() -> Self {
        Self {
            use_ai: true,
            use_kpved: true,
            use_okpd2: true,
        }
    }
}
