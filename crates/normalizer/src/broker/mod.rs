mod batch;
mod cache;
mod circuit_breaker;
mod http_provider;
mod provider;
mod retry;
mod voting;

pub use batch::{Admission, BatchCoalescer, BatchStats, DEFAULT_WINDOW};
pub use cache::{AiCache, CacheStats};
pub use circuit_breaker::CircuitBreaker;
pub use http_provider::HttpProvider;
pub use provider::{ModelInfo, Provider, ProviderHealth};
pub use retry::retry_with_backoff;
pub use voting::{majority_vote, Vote};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::model::{CircuitBreakerState, ProviderConfig};

struct ProviderSlot {
    provider: Arc<dyn Provider>,
    config: ProviderConfig,
    breaker: CircuitBreaker,
    semaphore: Semaphore,
    last_call: Mutex<Option<Instant>>,
}

impl ProviderSlot {
    /// Sleeps as needed so calls to this provider stay under `rate_limit`
    /// requests per second. A `rate_limit` of zero or less disables throttling.
    async fn throttle(&self) {
        if self.config.rate_limit <= 0.0 {
            return;
        }
        let min_interval = Duration::from_secs_f64(1.0 / self.config.rate_limit);
        let mut last_call = self.last_call.lock().await;
        let now = Instant::now();
        if let Some(last) = *last_call {
            let elapsed = now.duration_since(last);
            if elapsed < min_interval {
                tokio::time::sleep(min_interval - elapsed).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

/// Coordinates calls across every configured AI provider: fans a request out
/// to each enabled provider's channels in parallel, applies per-provider
/// circuit breaking, retry-with-backoff, caching, and majority voting over
/// the responses that come back.
///
/// Grounded on the teacher's provider routing and lead/worker orchestration:
/// one logical call becomes many concurrent provider calls, reconciled into
/// a single answer.
pub struct AiBroker {
    slots: HashMap<String, ProviderSlot>,
    order: Vec<String>,
    cache: AiCache,
    batches: BatchCoalescer,
    call_timeout: Duration,
}

impl AiBroker {
    pub fn new(providers: Vec<(Arc<dyn Provider>, ProviderConfig)>, call_timeout: Duration) -> Self {
        let mut slots = HashMap::new();
        let mut order = Vec::new();
        for (provider, config) in providers {
            let name = config.name.clone();
            let breaker = CircuitBreaker::new(name.clone());
            let semaphore = Semaphore::new(config.max_workers.max(1));
            slots.insert(
                name.clone(),
                ProviderSlot {
                    provider,
                    config,
                    breaker,
                    semaphore,
                    last_call: Mutex::new(None),
                },
            );
            order.push(name);
        }
        Self {
            slots,
            order,
            cache: AiCache::new(),
            batches: BatchCoalescer::default(),
            call_timeout,
        }
    }

    /// Whether at least one enabled provider currently admits calls. The
    /// pipeline uses this to decide whether AI enhancement is attemptable at
    /// all before falling back to basic-only processing.
    pub fn can_proceed(&self) -> bool {
        self.order.iter().any(|name| {
            let slot = &self.slots[name];
            slot.config.enabled && !slot.breaker.is_open()
        })
    }

    pub fn circuit_breaker_states(&self) -> Vec<CircuitBreakerState> {
        self.order
            .iter()
            .map(|name| self.slots[name].breaker.snapshot())
            .collect()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn batch_stats(&self) -> BatchStats {
        self.batches.stats()
    }

    /// Free-form normalization, fanned out across every enabled provider's
    /// configured channel count, reconciled by majority vote. Returns an
    /// error only when every channel of every enabled provider failed or
    /// was circuit-blocked; a minority of failures is absorbed silently.
    pub async fn normalize(
        &self,
        input: &str,
        cancellation: &CancellationToken,
    ) -> Result<String, ProviderError> {
        self.normalize_with_confidence(input, cancellation)
            .await
            .map(|(value, _)| value)
    }

    /// Same as `normalize`, but also reports a confidence derived from the
    /// winning vote's share of all successful channels — not a provider's
    /// own self-reported score, since providers are opaque text-in/text-out
    /// services with no confidence contract.
    pub async fn normalize_with_confidence(
        &self,
        input: &str,
        cancellation: &CancellationToken,
    ) -> Result<(String, f64), ProviderError> {
        let cache_key = AiCache::key_for("normalize", input);
        if let Some(cached) = self.cache.get(&cache_key) {
            return Ok((cached, 1.0));
        }

        match self.batches.admit(&cache_key).await {
            Admission::Follow(mut rx) => match rx.recv().await {
                Ok(outcome) => return outcome,
                Err(_) => {
                    // Leader vanished without reporting (e.g. its task was
                    // aborted); fall through and make the call ourselves.
                }
            },
            Admission::Lead => {}
        }

        tokio::select! {
            _ = tokio::time::sleep(self.batches.window()) => {}
            _ = cancellation.cancelled() => {}
        }

        let votes = self.fan_out(input, cancellation).await;
        let outcome = if votes.is_empty() {
            Err(ProviderError::RequestFailed(
                "no provider channel succeeded".to_string(),
            ))
        } else {
            let result = majority_vote(&votes).to_string();
            let agreeing = votes.iter().filter(|v| v.value == result).count();
            let confidence = agreeing as f64 / votes.len() as f64;
            self.cache.put(cache_key.clone(), result.clone());
            Ok((result, confidence))
        };

        self.batches.complete(&cache_key, outcome.clone()).await;
        outcome
    }

    async fn fan_out(&self, input: &str, cancellation: &CancellationToken) -> Vec<Vote> {
        let mut handles = Vec::new();
        for name in &self.order {
            let slot = &self.slots[name];
            if !slot.config.enabled || !slot.breaker.try_acquire() {
                continue;
            }
            for _ in 0..slot.config.channels.max(1) {
                let provider = slot.provider.clone();
                let provider_name = name.clone();
                let priority = slot.config.priority as i32;
                let timeout = self.call_timeout;
                let input = input.to_string();
                let cancellation = cancellation.clone();
                handles.push(async move {
                    let _permit = slot.semaphore.acquire().await;
                    slot.throttle().await;
                    let started = Instant::now();
                    let outcome = tokio::time::timeout(
                        timeout,
                        retry_with_backoff(|| provider.normalize(&input), &cancellation),
                    )
                    .await;
                    (provider_name, priority, started.elapsed(), outcome)
                });
            }
        }

        let results = futures::future::join_all(handles).await;
        let mut votes = Vec::new();
        for (provider_name, priority, latency, outcome) in results {
            match outcome {
                Ok(Ok(value)) => {
                    self.record_success(&provider_name);
                    votes.push(Vote {
                        provider: provider_name,
                        priority,
                        latency,
                        value,
                    });
                }
                Ok(Err(err)) => {
                    debug!(provider = %provider_name, error = %err, "provider channel failed");
                    self.record_failure(&provider_name);
                }
                Err(_) => {
                    warn!(provider = %provider_name, "provider channel timed out");
                    self.record_failure(&provider_name);
                }
            }
        }
        votes
    }

    fn record_success(&self, provider: &str) {
        if let Some(slot) = self.slots.get(provider) {
            slot.breaker.record_success();
        }
    }

    fn record_failure(&self, provider: &str) {
        if let Some(slot) = self.slots.get(provider) {
            slot.breaker.record_failure();
        }
    }

    /// Asks the first enabled, non-circuit-blocked provider to pick the best
    /// matching candidate, used by the hierarchical classifier's tree walk.
    /// Unlike `normalize`, this does not fan out to every provider: the
    /// walk is sequential by nature and the first confident answer wins.
    pub async fn classify(
        &self,
        name: &str,
        category: Option<&str>,
        candidates: &[String],
        cancellation: &CancellationToken,
    ) -> Result<(usize, f64), ProviderError> {
        for provider_name in &self.order {
            let slot = &self.slots[provider_name];
            if !slot.config.enabled || !slot.breaker.try_acquire() {
                continue;
            }
            let _permit = slot.semaphore.acquire().await.map_err(|_| {
                ProviderError::RequestFailed("provider semaphore closed".to_string())
            })?;
            slot.throttle().await;
            let result = tokio::time::timeout(
                self.call_timeout,
                retry_with_backoff(
                    || slot.provider.classify(name, category, candidates),
                    cancellation,
                ),
            )
            .await;
            match result {
                Ok(Ok(value)) => {
                    slot.breaker.record_success();
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    slot.breaker.record_failure();
                    debug!(provider = %provider_name, error = %err, "classify channel failed");
                }
                Err(_) => {
                    slot.breaker.record_failure();
                }
            }
        }
        Err(ProviderError::RequestFailed(
            "no provider available for classification".to_string(),
        ))
    }

    pub async fn get_models(&self) -> HashMap<String, Vec<ModelInfo>> {
        let mut out = HashMap::new();
        for name in &self.order {
            if let Ok(models) = self.slots[name].provider.get_models().await {
                out.insert(name.clone(), models);
            }
        }
        out
    }

    pub async fn check(&self) -> HashMap<String, ProviderHealth> {
        let mut out = HashMap::new();
        for name in &self.order {
            out.insert(name.clone(), self.slots[name].provider.check().await);
        }
        out
    }
}
