use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};

use crate::error::ProviderError;

/// Default coalescing window: once a key is leading, followers arriving
/// within this span of the first request share its single provider call
/// instead of opening their own.
pub const DEFAULT_WINDOW: Duration = Duration::from_millis(50);

type Outcome = Result<(String, f64), ProviderError>;

/// What `BatchCoalescer::admit` tells a caller to do for a given key.
pub enum Admission {
    /// First caller for this key: wait out the coalescing window, make the
    /// one provider call, then report the outcome via `complete`.
    Lead,
    /// A caller for a key some other in-flight request is already leading:
    /// await this receiver instead of calling the provider again.
    Follow(broadcast::Receiver<Outcome>),
}

#[derive(Debug, Clone, Copy)]
pub struct BatchStats {
    pub total_batches: u64,
    pub total_items: u64,
}

impl BatchStats {
    pub fn avg_items_per_batch(&self) -> f64 {
        if self.total_batches == 0 {
            0.0
        } else {
            self.total_items as f64 / self.total_batches as f64
        }
    }

    /// How many individual provider calls were avoided by coalescing.
    pub fn calls_saved(&self) -> u64 {
        self.total_items.saturating_sub(self.total_batches)
    }
}

/// Coalesces concurrent requests for the same cache key into a single
/// provider call. The first caller for a key leads; later callers for the
/// same key while it's in flight subscribe to the leader's single-shot
/// broadcast instead of issuing a redundant call. Coalescing is opportunistic:
/// a key that never sees a second caller while in flight still goes out as a
/// request of one.
pub struct BatchCoalescer {
    window: Duration,
    inflight: Mutex<HashMap<String, broadcast::Sender<Outcome>>>,
    total_batches: AtomicU64,
    total_items: AtomicU64,
}

impl BatchCoalescer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inflight: Mutex::new(HashMap::new()),
            total_batches: AtomicU64::new(0),
            total_items: AtomicU64::new(0),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Registers one caller's arrival for `key`, returning whether it leads
    /// the in-flight call for that key or follows an existing one.
    pub async fn admit(&self, key: &str) -> Admission {
        self.total_items.fetch_add(1, Ordering::Relaxed);
        let mut inflight = self.inflight.lock().await;
        if let Some(sender) = inflight.get(key) {
            return Admission::Follow(sender.subscribe());
        }
        let (sender, _) = broadcast::channel(1);
        inflight.insert(key.to_string(), sender);
        self.total_batches.fetch_add(1, Ordering::Relaxed);
        Admission::Lead
    }

    /// Reports the leader's outcome for `key` to every follower waiting on
    /// it and clears the in-flight entry.
    pub async fn complete(&self, key: &str, outcome: Outcome) {
        let mut inflight = self.inflight.lock().await;
        if let Some(sender) = inflight.remove(key) {
            let _ = sender.send(outcome);
        }
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            total_batches: self.total_batches.load(Ordering::Relaxed),
            total_items: self.total_items.load(Ordering::Relaxed),
        }
    }
}

impl Default for BatchCoalescer {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn a_second_caller_for_the_same_key_follows_the_first() {
        let coalescer = BatchCoalescer::new(Duration::from_millis(200));
        assert!(matches!(coalescer.admit("a").await, Admission::Lead));
        assert!(matches!(coalescer.admit("a").await, Admission::Follow(_)));

        let stats = coalescer.stats();
        assert_eq!(stats.total_batches, 1);
        assert_eq!(stats.total_items, 2);
        assert_eq!(stats.calls_saved(), 1);
    }

    #[tokio::test]
    async fn different_keys_each_lead_independently() {
        let coalescer = BatchCoalescer::new(Duration::from_millis(200));
        assert!(matches!(coalescer.admit("a").await, Admission::Lead));
        assert!(matches!(coalescer.admit("b").await, Admission::Lead));

        assert_eq!(coalescer.stats().total_batches, 2);
    }

    #[tokio::test]
    async fn completing_a_key_delivers_the_outcome_to_followers_and_clears_it() {
        let coalescer = BatchCoalescer::new(Duration::from_millis(200));
        assert!(matches!(coalescer.admit("a").await, Admission::Lead));
        let mut follower = match coalescer.admit("a").await {
            Admission::Follow(rx) => rx,
            Admission::Lead => panic!("expected to follow"),
        };

        coalescer
            .complete("a", Ok(("ok".to_string(), 1.0)))
            .await;

        let outcome = follower.recv().await.unwrap();
        assert_eq!(outcome.unwrap().0, "ok");

        // The key was cleared, so the next caller leads again.
        assert!(matches!(coalescer.admit("a").await, Admission::Lead));
    }
}
