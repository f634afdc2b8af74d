//! Cross-source trend deduplication.
//!
//! Keyword sets are normalized with a small suffix-stripping stemmer,
//! compared with Jaccard similarity, and merged when strictly above the
//! threshold. Canonical entries are then reconciled against the trends
//! table by normalized topic, so re-discoveries extend the existing row
//! instead of inserting a duplicate.

use std::collections::{BTreeSet, HashSet};

use tracing::{debug, info};

use crate::db::Store;
use crate::error::PipelineError;
use crate::trends::sources::TrendCandidate;

/// Jaccard similarity threshold for merging; strictly greater-than, so
/// exactly 0.6 does not merge.
pub const SIMILARITY_THRESHOLD: f64 = 0.6;

// Closed suffix table, tried in order; first match wins.
const SUFFIX_RULES: &[(&str, &str)] = &[
    ("ying", "y"),
    ("zing", "z"),
    ("ting", "t"),
    ("ning", "n"),
    ("ring", "r"),
    ("ling", "l"),
    ("ding", "d"),
    ("bing", "b"),
    ("ging", "g"),
    ("ping", "p"),
    ("ming", "m"),
    ("king", "k"),
    ("sing", "s"),
    ("ing", ""),
    ("ies", "y"),
    ("ness", ""),
    ("ment", ""),
    ("tion", ""),
    ("sion", ""),
    ("able", ""),
    ("ible", ""),
    ("ful", ""),
    ("less", ""),
    ("ous", ""),
    ("ive", ""),
    ("ed", ""),
    ("er", ""),
    ("est", ""),
    ("ly", ""),
    ("s", ""),
];

/// Strip one common English suffix, keeping at least 3 characters.
pub fn simple_stem(word: &str) -> String {
    if word.chars().count() <= 3 {
        return word.to_string();
    }
    for (suffix, replacement) in SUFFIX_RULES {
        if let Some(stripped) = word.strip_suffix(suffix) {
            if stripped.chars().count() + replacement.chars().count() >= 3 {
                return format!("{stripped}{replacement}");
            }
        }
    }
    word.to_string()
}

/// Normalize a topic string into the dedup key: lowercase, strip
/// non-alphanumerics (keeping spaces and hyphens), stem, drop tokens of
/// length <= 1, sort, rejoin. Order-independent by construction.
pub fn normalize_topic(topic: &str) -> String {
    let cleaned: String = topic
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '-' || *c == '_')
        .collect();
    let mut words: Vec<String> = cleaned
        .split_whitespace()
        .filter(|w| w.chars().count() > 1)
        .map(simple_stem)
        .collect();
    words.sort();
    words.join(" ")
}

/// Jaccard similarity `|A ∩ B| / |A ∪ B|`; 0.0 when both sets are empty.
pub fn jaccard_similarity(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

fn keyword_set(keywords: &[String]) -> HashSet<String> {
    keywords
        .iter()
        .filter(|k| !k.is_empty())
        .map(|k| simple_stem(&k.to_lowercase()))
        .collect()
}

/// A merged candidate carrying the union of sources and keywords.
#[derive(Debug, Clone)]
pub struct CanonicalCandidate {
    pub topic: String,
    pub normalized_topic: String,
    pub keywords: Vec<String>,
    pub sources: Vec<String>,
    pub score_hint: f64,
    pub source_data: serde_json::Value,
}

/// Merge near-duplicate candidates. Walking in input order, any later
/// candidate whose stemmed keyword set overlaps the current canonical
/// strictly above the threshold is folded in: sources and keywords
/// union, the higher score hint keeps its topic string and source data.
pub fn deduplicate(candidates: Vec<TrendCandidate>) -> Vec<CanonicalCandidate> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let total = candidates.len();
    let mut merged_flags = vec![false; total];
    let mut canonical: Vec<CanonicalCandidate> = Vec::new();

    for i in 0..total {
        if merged_flags[i] {
            continue;
        }
        let seed = &candidates[i];
        let mut topic = seed.topic.clone();
        let mut score_hint = seed.score_hint;
        let mut source_data = seed.source_data.clone();
        // BTreeSets keep the merged unions deterministic.
        let mut sources: BTreeSet<String> = BTreeSet::from([seed.source.clone()]);
        let mut keywords: BTreeSet<String> = seed.keywords.iter().cloned().collect();
        let mut merged_keyword_set = keyword_set(&seed.keywords);

        for (j, other) in candidates.iter().enumerate().skip(i + 1) {
            if merged_flags[j] {
                continue;
            }
            let other_set = keyword_set(&other.keywords);
            let similarity = jaccard_similarity(&merged_keyword_set, &other_set);
            if similarity > SIMILARITY_THRESHOLD {
                merged_flags[j] = true;
                sources.insert(other.source.clone());
                keywords.extend(other.keywords.iter().cloned());
                merged_keyword_set.extend(other_set);
                if other.score_hint > score_hint {
                    topic = other.topic.clone();
                    score_hint = other.score_hint;
                    source_data = other.source_data.clone();
                }
                debug!(
                    merged = %other.topic,
                    into = %topic,
                    similarity,
                    "merged duplicate trend candidate"
                );
            }
        }

        canonical.push(CanonicalCandidate {
            normalized_topic: normalize_topic(&topic),
            topic,
            keywords: keywords.into_iter().collect(),
            sources: sources.into_iter().collect(),
            score_hint,
            source_data,
        });
    }

    info!(
        candidates = total,
        canonical = canonical.len(),
        "deduplicated trend candidates"
    );
    canonical
}

/// Check canonical entries against the trends table. Entries whose
/// normalized topic already exists get their sources unioned onto the
/// existing row and are dropped from the returned list.
pub fn reconcile_with_store(
    store: &Store,
    canonical: Vec<CanonicalCandidate>,
) -> Result<Vec<CanonicalCandidate>, PipelineError> {
    let mut truly_new = Vec::new();

    for candidate in canonical {
        match store.trend_by_normalized_topic(&candidate.normalized_topic)? {
            Some(existing) => {
                let mut merged: BTreeSet<String> = existing.sources.iter().cloned().collect();
                let before = merged.len();
                merged.extend(candidate.sources.iter().cloned());
                if merged.len() != before {
                    let merged: Vec<String> = merged.into_iter().collect();
                    store.update_trend_sources(&existing.id, &merged)?;
                    info!(
                        topic = %existing.topic,
                        sources = ?merged,
                        "extended sources on existing trend"
                    );
                } else {
                    debug!(topic = %existing.topic, "trend already known, same sources");
                }
            }
            None => truly_new.push(candidate),
        }
    }

    Ok(truly_new)
}
