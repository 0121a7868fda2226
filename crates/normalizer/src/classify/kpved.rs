use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::broker::AiBroker;
use crate::model::TaxonomyNode;

/// Outcome of classifying one item against the KPVED tree. `None` fields mean
/// the walk stopped before reaching a leaf (confidence collapse or AI
/// failure); the item is left uncoded and counted as a per-item failure, not
/// a session failure.
#[derive(Debug, Clone, Default)]
pub struct KpvedResult {
    pub code: Option<String>,
    pub name: Option<String>,
    pub confidence: Option<f64>,
}

/// Default maximum drop in confidence between consecutive levels before the
/// walk aborts rather than descending further.
pub const DEFAULT_CONFIDENCE_DELTA: f64 = 0.3;

pub struct KpvedClassifier<'a> {
    roots: &'a [TaxonomyNode],
    confidence_delta: f64,
}

impl<'a> KpvedClassifier<'a> {
    pub fn new(roots: &'a [TaxonomyNode]) -> Self {
        Self {
            roots,
            confidence_delta: DEFAULT_CONFIDENCE_DELTA,
        }
    }

    pub fn with_confidence_delta(roots: &'a [TaxonomyNode], confidence_delta: f64) -> Self {
        Self {
            roots,
            confidence_delta,
        }
    }

    /// Walks the tree from the root, at each level asking the broker which
    /// child best fits `(normalized_name, category)`, descending until a
    /// leaf or a confidence drop greater than `confidence_delta`.
    pub async fn classify(
        &self,
        broker: &AiBroker,
        normalized_name: &str,
        category: Option<&str>,
        cancellation: &CancellationToken,
    ) -> KpvedResult {
        let mut level = self.roots;
        let mut best: Option<(&TaxonomyNode, f64)> = None;
        let mut last_confidence = 1.0;

        loop {
            if level.is_empty() {
                break;
            }
            let candidates: Vec<String> = level.iter().map(|n| n.name.clone()).collect();
            let outcome = broker
                .classify(normalized_name, category, &candidates, cancellation)
                .await;

            let (index, confidence) = match outcome {
                Ok(pick) => pick,
                Err(err) => {
                    debug!(error = %err, "kpved classification failed, leaving item uncoded");
                    return KpvedResult::default();
                }
            };

            if best.is_some() && last_confidence - confidence > self.confidence_delta {
                break;
            }

            let Some(node) = level.get(index) else {
                break;
            };
            best = Some((node, confidence));
            last_confidence = confidence;

            if node.is_leaf() {
                break;
            }
            level = &node.children;
        }

        match best {
            Some((node, confidence)) => KpvedResult {
                code: Some(node.code.clone()),
                name: Some(node.name.clone()),
                confidence: Some(confidence),
            },
            None => KpvedResult::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ModelInfo, Provider, ProviderHealth};
    use crate::error::ProviderError;
    use crate::model::ProviderConfig;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct PickFirst;

    #[async_trait]
    impl Provider for PickFirst {
        fn name(&self) -> &str {
            "pickfirst"
        }

        async fn normalize(&self, input: &str) -> Result<String, ProviderError> {
            Ok(input.to_string())
        }

        async fn classify(
            &self,
            _name: &str,
            _category: Option<&str>,
            _candidates: &[String],
        ) -> Result<(usize, f64), ProviderError> {
            Ok((0, 0.95))
        }

        async fn get_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
            Ok(vec![])
        }

        async fn check(&self) -> ProviderHealth {
            ProviderHealth::Healthy
        }
    }

    fn tree() -> Vec<TaxonomyNode> {
        vec![TaxonomyNode {
            code: "A".to_string(),
            name: "root".to_string(),
            children: vec![TaxonomyNode {
                code: "A.1".to_string(),
                name: "leaf".to_string(),
                children: vec![],
            }],
        }]
    }

    fn config() -> ProviderConfig {
        ProviderConfig {
            name: "pickfirst".to_string(),
            base_url: "http://localhost".to_string(),
            api_key: "k".to_string(),
            enabled: true,
            priority: 1,
            channels: 1,
            max_workers: 1,
            rate_limit: 0.0,
            timeout_seconds: 5,
            models: vec![],
        }
    }

    #[tokio::test]
    async fn descends_to_the_leaf_on_confident_picks() {
        let roots = tree();
        let broker = AiBroker::new(vec![(Arc::new(PickFirst), config())], Duration::from_secs(5));
        let classifier = KpvedClassifier::new(&roots);
        let result = classifier
            .classify(&broker, "item", None, &CancellationToken::new())
            .await;
        assert_eq!(result.code.as_deref(), Some("A.1"));
    }

    struct AlwaysFails;

    #[async_trait]
    impl Provider for AlwaysFails {
        fn name(&self) -> &str {
            "alwaysfails"
        }

        async fn normalize(&self, input: &str) -> Result<String, ProviderError> {
            Ok(input.to_string())
        }

        async fn classify(
            &self,
            _name: &str,
            _category: Option<&str>,
            _candidates: &[String],
        ) -> Result<(usize, f64), ProviderError> {
            Err(ProviderError::RequestFailed("down".to_string()))
        }

        async fn get_models(&self) -> Result<Vec<ModelInfo>, ProviderError> {
            Ok(vec![])
        }

        async fn check(&self) -> ProviderHealth {
            ProviderHealth::Unreachable
        }
    }

    #[tokio::test]
    async fn ai_failure_leaves_item_uncoded_even_with_no_prior_best() {
        let roots = tree();
        let mut cfg = config();
        cfg.name = "alwaysfails".to_string();
        let broker = AiBroker::new(vec![(Arc::new(AlwaysFails), cfg)], Duration::from_secs(5));
        let classifier = KpvedClassifier::new(&roots);
        let result = classifier
            .classify(&broker, "item", None, &CancellationToken::new())
            .await;
        assert_eq!(result.code, None);
        assert_eq!(result.name, None);
        assert_eq!(result.confidence, None);
    }
}
