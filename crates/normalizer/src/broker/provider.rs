use async_trait::async_trait;

use crate::error::ProviderError;

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub quality_tier: Option<String>,
    pub speed_tier: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderHealth {
    Healthy,
    Degraded,
    Unreachable,
}

/// Opaque text-in/text-out AI service. The broker treats every provider this
/// way regardless of vendor; prompt content and model-specific semantics are
/// explicitly out of scope (spec non-goal c).
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Free-form text normalization/enrichment call.
    async fn normalize(&self, input: &str) -> Result<String, ProviderError>;

    /// Asked to pick the best-fitting child among `candidates` for the
    /// hierarchical classifier; returns the index into `candidates` and a
    /// confidence in [0, 1].
    async fn classify(
        &self,
        name: &str,
        category: Option<&str>,
        candidates: &[String],
    ) -> Result<(usize, f64), ProviderError>;

    async fn get_models(&self) -> Result<Vec<ModelInfo>, ProviderError>;

    async fn check(&self) -> ProviderHealth;
}
