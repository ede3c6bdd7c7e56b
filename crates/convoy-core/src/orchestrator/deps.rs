//! Dependency ordering for feature queues.
//!
//! Features can declare ordering with "requires X" / "after Y" phrases, or
//! implicitly by referencing the same backtick-quoted file. The extracted
//! edges are ordered with Kahn's algorithm; a cycle degrades to the original
//! input order rather than failing the batch.

use crate::feature::Feature;
use regex::Regex;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Computes an execution order (a permutation of indices) for the features.
///
/// The order is stable: independent features keep their input order. On a
/// dependency cycle the input order is returned unchanged.
pub fn order_features(features: &[Feature]) -> Vec<usize> {
    let n = features.len();
    if n <= 1 {
        return (0..n).collect();
    }

    let edges = extract_edges(features);
    if edges.is_empty() {
        return (0..n).collect();
    }

    match kahn_order(n, &edges) {
        Some(order) => {
            debug!(edges = edges.len(), "Features reordered by dependencies");
            order
        }
        None => {
            warn!("Dependency cycle detected, keeping input order");
            (0..n).collect()
        }
    }
}

/// Extracts `(before, after)` edges from feature descriptions.
fn extract_edges(features: &[Feature]) -> Vec<(usize, usize)> {
    let keyword = Regex::new(r"(?i)\b(?:requires|after)\s+([^,.;]+)").expect("static pattern");
    let file_ref = Regex::new(r"`([^`]+)`").expect("static pattern");

    let mut edges = HashSet::new();

    // Keyword references: "requires X" means the feature mentioning X runs first.
    for (i, feature) in features.iter().enumerate() {
        for capture in keyword.captures_iter(&feature.description) {
            let phrase = capture[1].trim().to_lowercase();
            if phrase.is_empty() {
                continue;
            }
            for (j, other) in features.iter().enumerate() {
                if j != i && other.description.to_lowercase().contains(&phrase) {
                    edges.insert((j, i));
                }
            }
        }
    }

    // File-reference overlap: shared files run in input order.
    let file_refs: Vec<HashSet<String>> = features
        .iter()
        .map(|f| {
            file_ref
                .captures_iter(&f.description)
                .map(|c| c[1].trim().to_string())
                .collect()
        })
        .collect();
    for i in 0..features.len() {
        for j in (i + 1)..features.len() {
            if !file_refs[i].is_disjoint(&file_refs[j]) {
                edges.insert((i, j));
            }
        }
    }

    edges.retain(|(a, b)| a != b);
    let mut edges: Vec<_> = edges.into_iter().collect();
    edges.sort_unstable();
    edges
}

/// Kahn's algorithm with smallest-index tie-breaking for stability.
///
/// Returns `None` if the edge set contains a cycle.
fn kahn_order(n: usize, edges: &[(usize, usize)]) -> Option<Vec<usize>> {
    let mut in_degree = vec![0usize; n];
    let mut adjacency = vec![Vec::new(); n];
    for &(before, after) in edges {
        adjacency[before].push(after);
        in_degree[after] += 1;
    }

    let mut ready: Vec<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(pos) = ready.iter().enumerate().min_by_key(|&(_, &i)| i).map(|(p, _)| p) {
        let node = ready.swap_remove(pos);
        order.push(node);
        for &next in &adjacency[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                ready.push(next);
            }
        }
    }

    (order.len() == n).then_some(order)
}
