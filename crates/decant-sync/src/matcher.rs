//! Fuzzy reconciliation of extracted names against canonical catalog names.

use std::collections::BTreeSet;

use strsim::normalized_levenshtein;

/// Winning candidate and its 0-100 similarity score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoredMatch<'a> {
    pub candidate: &'a str,
    pub score: u32,
}

/// Picks the highest-scoring candidate. Never rejects on low scores; only an
/// empty candidate list yields `None`. Ties keep the earliest candidate.
pub fn best_match<'a, S: AsRef<str>>(name: &str, candidates: &'a [S]) -> Option<ScoredMatch<'a>> {
    let query = normalize(name);
    let mut best: Option<ScoredMatch<'a>> = None;
    for candidate in candidates {
        let candidate = candidate.as_ref();
        let score = weighted_ratio(&query, &normalize(candidate));
        if best.map_or(true, |b| score > b.score) {
            best = Some(ScoredMatch { candidate, score });
        }
    }
    best
}

/// Similarity of two raw strings on a 0-100 integer scale.
pub fn similarity(a: &str, b: &str) -> u32 {
    weighted_ratio(&normalize(a), &normalize(b))
}

/// Lowercases, maps non-alphanumerics to spaces, and collapses whitespace.
pub fn normalize(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn weighted_ratio(a: &str, b: &str) -> u32 {
    if a.is_empty() || b.is_empty() {
        return 0;
    }

    let base = ratio(a, b);
    let len_a = a.chars().count() as f64;
    let len_b = b.chars().count() as f64;
    let len_ratio = len_a.max(len_b) / len_a.min(len_b);

    let best = if len_ratio < 1.5 {
        base.max(token_sort_ratio(a, b) * 0.95)
            .max(token_set_ratio(a, b) * 0.95)
    } else {
        let partial_scale = if len_ratio < 8.0 { 0.9 } else { 0.6 };
        base.max(partial_ratio(a, b) * partial_scale)
            .max(token_set_ratio(a, b) * 0.95 * partial_scale)
    };
    best.round() as u32
}

fn ratio(a: &str, b: &str) -> f64 {
    normalized_levenshtein(a, b) * 100.0
}

fn sorted_tokens(s: &str) -> String {
    let mut tokens: Vec<&str> = s.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

fn token_sort_ratio(a: &str, b: &str) -> f64 {
    ratio(&sorted_tokens(a), &sorted_tokens(b))
}

fn token_set_ratio(a: &str, b: &str) -> f64 {
    let set_a: BTreeSet<&str> = a.split_whitespace().collect();
    let set_b: BTreeSet<&str> = b.split_whitespace().collect();

    let common = set_a.intersection(&set_b).copied().collect::<Vec<_>>().join(" ");
    let only_a = set_a.difference(&set_b).copied().collect::<Vec<_>>().join(" ");
    let only_b = set_b.difference(&set_a).copied().collect::<Vec<_>>().join(" ");

    let with_a = [common.as_str(), only_a.as_str()].join(" ").trim().to_string();
    let with_b = [common.as_str(), only_b.as_str()].join(" ").trim().to_string();

    let mut best = ratio(&with_a, &with_b);
    if !common.is_empty() {
        best = best.max(ratio(&common, &with_a)).max(ratio(&common, &with_b));
    }
    best
}

/// Best ratio of the shorter string against every same-length window of the longer.
fn partial_ratio(a: &str, b: &str) -> f64 {
    let (short, long) = if a.chars().count() <= b.chars().count() {
        (a, b)
    } else {
        (b, a)
    };
    let long_chars: Vec<char> = long.chars().collect();
    let width = short.chars().count();
    if width == 0 || long_chars.len() < width {
        return ratio(a, b);
    }

    long_chars
        .windows(width)
        .map(|window| ratio(short, &window.iter().collect::<String>()))
        .fold(0.0, f64::max)
}
