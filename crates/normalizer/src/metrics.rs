use serde::Serialize;

use crate::broker::{AiBroker, BatchStats, CacheStats};
use crate::model::CircuitBreakerState;

/// Aggregated, read-only snapshot of broker and event-bus health, exposed to
/// the (out-of-scope) status surface via `OrchestratorHandle::status`.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub can_proceed: bool,
    pub circuit_breakers: Vec<CircuitBreakerState>,
    pub cache: CacheSnapshot,
    pub batching: BatchSnapshot,
    pub dropped_events: u64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
    pub hit_rate: f64,
}

impl From<CacheStats> for CacheSnapshot {
    fn from(stats: CacheStats) -> Self {
        Self {
            hits: stats.hits,
            misses: stats.misses,
            entries: stats.entries,
            hit_rate: stats.hit_rate(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct BatchSnapshot {
    pub total_batches: u64,
    pub total_items: u64,
    pub avg_items_per_batch: f64,
    pub calls_saved: u64,
}

impl From<BatchStats> for BatchSnapshot {
    fn from(stats: BatchStats) -> Self {
        Self {
            total_batches: stats.total_batches,
            total_items: stats.total_items,
            avg_items_per_batch: stats.avg_items_per_batch(),
            calls_saved: stats.calls_saved(),
        }
    }
}

pub fn snapshot(broker: &AiBroker, dropped_events: u64) -> Stats {
    Stats {
        can_proceed: broker.can_proceed(),
        circuit_breakers: broker.circuit_breaker_states(),
        cache: broker.cache_stats().into(),
        batching: broker.batch_stats().into(),
        dropped_events,
    }
}
