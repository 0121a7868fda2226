use std::collections::HashMap;
use std::time::Duration;

/// One provider's successful response to a fanned-out call.
#[derive(Debug, Clone)]
pub struct Vote {
    pub provider: String,
    pub priority: i32,
    pub latency: Duration,
    pub value: String,
}

/// Picks the majority value among `votes`. Ties are broken by higher average
/// provider priority, then lower average latency, then — when both are also
/// equal — the alphabetically lowest contributing provider id, as a stable
/// deterministic fallback. `votes` must be non-empty; callers are
/// responsible for failing the call only when zero providers succeeded.
pub fn majority_vote(votes: &[Vote]) -> &str {
    assert!(!votes.is_empty(), "majority_vote requires at least one vote");

    let mut groups: HashMap<&str, Vec<&Vote>> = HashMap::new();
    for vote in votes {
        groups.entry(vote.value.as_str()).or_default().push(vote);
    }

    let mut best: Option<(&str, usize, f64, Duration, &str)> = None;
    for (value, members) in &groups {
        let count = members.len();
        let avg_priority =
            members.iter().map(|v| v.priority as f64).sum::<f64>() / count as f64;
        let avg_latency = members.iter().map(|v| v.latency).sum::<Duration>() / count as u32;
        let lowest_provider = members
            .iter()
            .map(|v| v.provider.as_str())
            .min()
            .unwrap_or("");

        let replace = match &best {
            None => true,
            Some((_, best_count, best_priority, best_latency, best_provider)) => {
                count > *best_count
                    || (count == *best_count && avg_priority > *best_priority)
                    || (count == *best_count
                        && avg_priority == *best_priority
                        && avg_latency < *best_latency)
                    || (count == *best_count
                        && avg_priority == *best_priority
                        && avg_latency == *best_latency
                        && lowest_provider < *best_provider)
            }
        };
        if replace {
            best = Some((value, count, avg_priority, avg_latency, lowest_provider));
        }
    }

    best.expect("groups is non-empty").0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vote(provider: &str, priority: i32, latency_ms: u64, value: &str) -> Vote {
        Vote {
            provider: provider.to_string(),
            priority,
            latency: Duration::from_millis(latency_ms),
            value: value.to_string(),
        }
    }

    #[test]
    fn picks_the_majority_value() {
        let votes = vec![
            vote("a", 0, 10, "Болт М10"),
            vote("b", 0, 10, "Болт М10"),
            vote("c", 0, 10, "Винт М10"),
        ];
        assert_eq!(majority_vote(&votes), "Болт М10");
    }

    #[test]
    fn ties_break_on_higher_average_priority() {
        let votes = vec![
            vote("a", 5, 10, "x"),
            vote("b", 1, 10, "y"),
        ];
        assert_eq!(majority_vote(&votes), "x");
    }

    #[test]
    fn ties_break_on_lower_average_latency_when_priority_equal() {
        let votes = vec![
            vote("a", 1, 50, "x"),
            vote("b", 1, 10, "y"),
        ];
        assert_eq!(majority_vote(&votes), "y");
    }
}
