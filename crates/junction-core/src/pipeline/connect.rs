//! Connect-stage helpers: lexical overlap against prior signals, curator
//! score parsing and content-potential classification.

use std::collections::BTreeSet;

use crate::domain::Signal;
use crate::quality_gate::keywords;

use super::run::{Connection, Potential};

/// Jaccard index of two keyword sets; 0.0 when both are empty.
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Rank `history` by overlap with `signal` and keep the `top_k` above
/// `min_overlap`. Ties order by signal id.
pub fn find_connections(
    signal: &Signal,
    history: &[Signal],
    top_k: usize,
    min_overlap: f64,
) -> Vec<Connection> {
    let own = keywords(&signal.text());
    let mut ranked: Vec<Connection> = history
        .iter()
        .filter(|prior| prior.id != signal.id)
        .map(|prior| Connection {
            signal_id: prior.id.clone(),
            overlap: jaccard(&own, &keywords(&prior.text())),
        })
        .filter(|c| c.overlap > 0.0 && c.overlap >= min_overlap)
        .collect();
    ranked.sort_by(|a, b| {
        b.overlap
            .total_cmp(&a.overlap)
            .then_with(|| a.signal_id.cmp(&b.signal_id))
    });
    ranked.truncate(top_k);
    ranked
}

pub fn classify_potential(score: Option<u32>, connections: usize) -> Potential {
    let score = score.unwrap_or(0);
    if score >= 70 || connections >= 3 {
        Potential::High
    } else if score >= 40 || connections >= 1 {
        Potential::Medium
    } else {
        Potential::Low
    }
}

/// The first integer in `text` that lies within 0..=100.
pub fn parse_score(text: &str) -> Option<u32> {
    text.split(|c: char| !c.is_ascii_digit())
        .filter(|t| !t.is_empty() && t.len() <= 3)
        .filter_map(|t| t.parse::<u32>().ok())
        .find(|n| *n <= 100)
}
