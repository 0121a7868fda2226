use crate::model::TaxonomyNode;

/// Confidence below this is treated as no match: the item is marked
/// completed with no code rather than bound to a weak guess.
pub const BIND_CUTOFF: f64 = 0.3;

const MIN_KEYWORD_LEN: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct Okpd2Result {
    pub code: Option<String>,
    pub name: Option<String>,
    pub confidence: Option<f64>,
}

/// Keyword-scored lookup over a flattened OKPD2 tree. No AI involved: pure
/// string matching biased toward deeper (more specific) leaves.
pub struct Okpd2Classifier<'a> {
    roots: &'a [TaxonomyNode],
}

impl<'a> Okpd2Classifier<'a> {
    pub fn new(roots: &'a [TaxonomyNode]) -> Self {
        Self { roots }
    }

    pub fn classify(&self, normalized_name: &str) -> Okpd2Result {
        let keywords = extract_keywords(normalized_name);
        if keywords.is_empty() {
            return Okpd2Result::default();
        }

        let mut best: Option<(&TaxonomyNode, f64)> = None;
        for root in self.roots {
            walk(root, 1, &keywords, &mut best);
        }

        match best {
            Some((node, score)) if score >= BIND_CUTOFF => Okpd2Result {
                code: Some(node.code.clone()),
                name: Some(node.name.clone()),
                confidence: Some(score.min(1.0)),
            },
            _ => Okpd2Result::default(),
        }
    }
}

fn extract_keywords(normalized_name: &str) -> Vec<String> {
    normalized_name
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| w.chars().count() >= MIN_KEYWORD_LEN)
        .collect()
}

fn walk<'a>(
    node: &'a TaxonomyNode,
    depth: u32,
    keywords: &[String],
    best: &mut Option<(&'a TaxonomyNode, f64)>,
) {
    let score = score_node(node, keywords, depth);
    let is_better = match best {
        Some((_, best_score)) => score > *best_score,
        None => true,
    };
    if is_better && score > 0.0 {
        *best = Some((node, score));
    }
    for child in &node.children {
        walk(child, depth + 1, keywords, best);
    }
}

/// Score = sum over keywords of (exact=3, prefix=2, substring=1) scaled by
/// tree depth, normalized so deeper leaves with the same textual match
/// outrank shallower ones.
fn score_node(node: &TaxonomyNode, keywords: &[String], depth: u32) -> f64 {
    let haystack = node.name.to_lowercase();
    let haystack_words: Vec<&str> = haystack.split_whitespace().collect();

    let mut raw = 0.0;
    for keyword in keywords {
        if haystack_words.iter().any(|w| *w == keyword) {
            raw += 3.0;
        } else if haystack_words.iter().any(|w| w.starts_with(keyword.as_str())) {
            raw += 2.0;
        } else if haystack.contains(keyword.as_str()) {
            raw += 1.0;
        }
    }
    if raw == 0.0 {
        return 0.0;
    }

    let max_possible = keywords.len() as f64 * 3.0;
    let depth_bias = 1.0 + (depth as f64 - 1.0) * 0.1;
    (raw / max_possible) * depth_bias
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Vec<TaxonomyNode> {
        vec![TaxonomyNode {
            code: "01".to_string(),
            name: "крепёж".to_string(),
            children: vec![TaxonomyNode {
                code: "01.01".to_string(),
                name: "болт оцинкованный".to_string(),
                children: vec![],
            }],
        }]
    }

    #[test]
    fn exact_match_at_a_deeper_leaf_wins() {
        let roots = tree();
        let classifier = Okpd2Classifier::new(&roots);
        let result = classifier.classify("болт оцинкованный м10");
        assert_eq!(result.code.as_deref(), Some("01.01"));
    }

    #[test]
    fn unrelated_name_stays_uncoded() {
        let roots = tree();
        let classifier = Okpd2Classifier::new(&roots);
        let result = classifier.classify("офисный стул");
        assert!(result.code.is_none());
    }

    #[test]
    fn short_tokens_are_not_used_as_keywords() {
        assert!(extract_keywords("на шт").is_empty());
    }
}
