//! Hub/authority scoring over the entity reference graph.
//!
//! Standard HITS: power iteration on the link structure until the scores
//! converge or an iteration cap trips. Scores are L1-normalized, so they sum
//! to one across the graph; nodes with no incident edges score zero.

use std::collections::HashMap;

use tracing::debug;

const MAX_ITERATIONS: usize = 100;
const CONVERGENCE_EPSILON: f64 = 1e-8;

/// Computes authority scores for the directed graph described by `nodes` and
/// `edges`. Edge endpoints that are not in `nodes` still participate in the
/// computation and show up in the result.
pub(crate) fn authority_scores(
    nodes: Vec<String>,
    edges: &[(String, String)],
) -> HashMap<String, f64> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut names: Vec<&str> = Vec::new();
    for name in nodes.iter().map(String::as_str).chain(
        edges
            .iter()
            .flat_map(|(src, dst)| [src.as_str(), dst.as_str()]),
    ) {
        if !index.contains_key(name) {
            index.insert(name, names.len());
            names.push(name);
        }
    }

    let n = names.len();
    if n == 0 {
        return HashMap::new();
    }
    let links: Vec<(usize, usize)> = edges
        .iter()
        .map(|(src, dst)| (index[src.as_str()], index[dst.as_str()]))
        .collect();
    if links.is_empty() {
        return names.iter().map(|name| (name.to_string(), 0.0)).collect();
    }

    let mut hubs = vec![1.0; n];
    let mut authorities = vec![1.0; n];
    for iteration in 0..MAX_ITERATIONS {
        let mut next_authorities = vec![0.0; n];
        for (src, dst) in &links {
            next_authorities[*dst] += hubs[*src];
        }
        normalize(&mut next_authorities);

        let mut next_hubs = vec![0.0; n];
        for (src, dst) in &links {
            next_hubs[*src] += next_authorities[*dst];
        }
        normalize(&mut next_hubs);

        let delta: f64 = authorities
            .iter()
            .zip(&next_authorities)
            .chain(hubs.iter().zip(&next_hubs))
            .map(|(old, new)| (old - new).abs())
            .sum();
        authorities = next_authorities;
        hubs = next_hubs;
        if delta < CONVERGENCE_EPSILON {
            debug!(iterations = iteration + 1, "hits converged");
            break;
        }
    }

    names
        .iter()
        .zip(authorities)
        .map(|(name, score)| (name.to_string(), score))
        .collect()
}

fn normalize(scores: &mut [f64]) {
    let sum: f64 = scores.iter().sum();
    if sum > 0.0 {
        for score in scores.iter_mut() {
            *score /= sum;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(src: &str, dst: &str) -> (String, String) {
        (src.to_string(), dst.to_string())
    }

    #[test]
    fn three_cycle_scores_equally_and_nonzero() {
        let nodes = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let edges = vec![edge("a", "b"), edge("b", "c"), edge("c", "a")];
        let scores = authority_scores(nodes, &edges);
        let a = scores["a"];
        assert!(a > 0.0);
        assert!((scores["b"] - a).abs() < 1e-9);
        assert!((scores["c"] - a).abs() < 1e-9);
    }

    #[test]
    fn isolated_node_scores_zero() {
        let nodes = vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
            "loner".to_string(),
        ];
        let edges = vec![edge("a", "b"), edge("b", "c"), edge("c", "a")];
        let scores = authority_scores(nodes, &edges);
        assert_eq!(scores["loner"], 0.0);
    }

    #[test]
    fn edge_free_graph_scores_all_zero() {
        let nodes = vec!["a".to_string(), "b".to_string()];
        let scores = authority_scores(nodes, &[]);
        assert_eq!(scores["a"], 0.0);
        assert_eq!(scores["b"], 0.0);
    }

    #[test]
    fn referenced_but_unknown_nodes_participate() {
        let nodes = vec!["a".to_string()];
        let edges = vec![edge("a", "ghost")];
        let scores = authority_scores(nodes, &edges);
        assert!(scores["ghost"] > 0.0);
        assert_eq!(scores["a"], 0.0);
    }

    #[test]
    fn heavily_referenced_node_outranks_the_rest() {
        let nodes: Vec<String> = ["hub", "x", "y", "z"].iter().map(|s| s.to_string()).collect();
        let edges = vec![
            edge("x", "hub"),
            edge("y", "hub"),
            edge("z", "hub"),
            edge("x", "y"),
        ];
        let scores = authority_scores(nodes, &edges);
        assert!(scores["hub"] > scores["y"]);
        assert!(scores["hub"] > scores["x"]);
    }

    #[test]
    fn empty_graph_yields_empty_scores() {
        assert!(authority_scores(Vec::new(), &[]).is_empty());
    }

    #[test]
    fn scores_sum_to_one_when_edges_exist() {
        let nodes: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let edges = vec![edge("a", "b"), edge("c", "d"), edge("d", "a")];
        let scores = authority_scores(nodes, &edges);
        let total: f64 = scores.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
    }
}
