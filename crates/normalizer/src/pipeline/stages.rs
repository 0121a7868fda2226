use std::collections::HashMap;

use crate::model::{Group, NormalizedItem};

/// Legal-form tokens stripped from the front of a name before normalizing,
/// so "ООО Ромашка" and "Ромашка" fold to the same identity.
const LEGAL_FORM_PREFIXES: &[&str] = &[
    "ооо", "оао", "зао", "пао", "нко", "ип", "ао", "тов", "фоп",
];

/// Whether a source row's name is blank after trimming and therefore
/// excluded from the pipeline (spec stage 2: "filter items whose name is
/// blank").
pub fn is_blank_name(name: &str) -> bool {
    name.trim().is_empty()
}

/// Pure text normalization: casefold, collapse whitespace, strip a leading
/// legal-form token. No I/O, no AI involvement — this is the `basic` level.
pub fn basic_normalize(name: &str) -> String {
    let mut tokens: Vec<String> = name
        .split_whitespace()
        .map(|t| t.trim_matches(|c: char| c == '.' || c == ',').to_lowercase())
        .filter(|t| !t.is_empty())
        .collect();

    if tokens.len() > 1 && LEGAL_FORM_PREFIXES.contains(&tokens[0].as_str()) {
        tokens.remove(0);
    }

    tokens.join(" ")
}

/// Groups normalized items sharing `(normalized_name, normalized_reference,
/// category)`. Purely a read-side aggregation; groups are never persisted.
pub fn group_items(items: &[NormalizedItem]) -> Vec<Group> {
    let mut counts: HashMap<(String, Option<String>, Option<String>), usize> = HashMap::new();
    let mut order: Vec<(String, Option<String>, Option<String>)> = Vec::new();

    for item in items {
        let key = (
            item.normalized_name.clone(),
            item.normalized_reference.clone(),
            item.category.clone(),
        );
        if !counts.contains_key(&key) {
            order.push(key.clone());
        }
        *counts.entry(key).or_insert(0) += 1;
    }

    order
        .into_iter()
        .map(|key| Group {
            normalized_name: key.0.clone(),
            normalized_reference: key.1.clone(),
            category: key.2.clone(),
            merged_count: counts[&key],
        })
        .collect()
}
