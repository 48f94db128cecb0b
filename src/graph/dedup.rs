//! Multi-phase node deduplication over a union-find.
//!
//! Phases run in order — exact title match, acronym expansion, fuzzy string
//! similarity — each skipping pairs an earlier phase already unified. The
//! Jaccard word-overlap gate on the fuzzy phase keeps lexically-close but
//! semantically distinct titles ("Neural Networks" vs "Social Networks")
//! apart.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::validate::normalize_text;

use super::types::{GraphEdge, GraphNode};

/// Disjoint-set forest with path compression and union by rank.
#[derive(Debug, Default)]
pub struct UnionFind {
    parent: HashMap<String, String>,
    rank: HashMap<String, u32>,
}

impl UnionFind {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an element as its own class if unseen.
    pub fn insert(&mut self, id: &str) {
        if !self.parent.contains_key(id) {
            self.parent.insert(id.to_string(), id.to_string());
            self.rank.insert(id.to_string(), 0);
        }
    }

    /// Find the class root, compressing the path.
    pub fn find(&mut self, id: &str) -> String {
        let parent = self.parent.get(id).cloned().unwrap_or_else(|| {
            self.insert(id);
            id.to_string()
        });
        if parent == id {
            return parent;
        }
        let root = self.find(&parent);
        self.parent.insert(id.to_string(), root.clone());
        root
    }

    /// Merge two classes. Returns false if already unified.
    pub fn union(&mut self, a: &str, b: &str) -> bool {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return false;
        }

        let rank_a = self.rank.get(&root_a).copied().unwrap_or(0);
        let rank_b = self.rank.get(&root_b).copied().unwrap_or(0);

        if rank_a < rank_b {
            self.parent.insert(root_a, root_b);
        } else if rank_a > rank_b {
            self.parent.insert(root_b, root_a);
        } else {
            self.parent.insert(root_b, root_a.clone());
            self.rank.insert(root_a, rank_a + 1);
        }
        true
    }

    pub fn same(&mut self, a: &str, b: &str) -> bool {
        self.find(a) == self.find(b)
    }
}

/// Thresholds for the fuzzy phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Maximum Levenshtein distance fraction; similarity must reach
    /// `1 - fuzzy_threshold`.
    pub fuzzy_threshold: f64,
    /// Minimum Jaccard word overlap.
    pub word_overlap_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: 0.20,
            word_overlap_threshold: 0.50,
        }
    }
}

/// Merge counts per phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergesByPhase {
    pub exact: usize,
    pub acronym: usize,
    pub fuzzy: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupStatistics {
    pub original_count: usize,
    pub final_count: usize,
    pub merged_count: usize,
    pub merges_by_phase: MergesByPhase,
}

/// Deduplication output: surviving nodes, the id mapping, and statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupResult {
    pub deduplicated_nodes: Vec<GraphNode>,
    /// Every input id mapped to its canonical (root) id.
    pub mapping: HashMap<String, String>,
    pub statistics: DedupStatistics,
}

impl DedupResult {
    /// Rewrite edge endpoints through the mapping. Endpoints the mapping does
    /// not know pass through unchanged; downstream graph validation culls
    /// anything unresolvable.
    pub fn rewrite_edges(&self, edges: &[GraphEdge]) -> Vec<GraphEdge> {
        edges
            .iter()
            .map(|e| {
                let mut edge = e.clone();
                if let Some(from) = self.mapping.get(&edge.from) {
                    edge.from = from.clone();
                }
                if let Some(to) = self.mapping.get(&edge.to) {
                    edge.to = to.clone();
                }
                edge
            })
            .collect()
    }
}

/// Multi-phase deduplicator.
#[derive(Debug, Clone, Default)]
pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Deduplicate nodes. Fails on empty input or a node missing its id or
    /// title.
    pub fn deduplicate(&self, nodes: &[GraphNode]) -> Result<DedupResult> {
        if nodes.is_empty() {
            return Err(Error::DeduplicationFailed("no nodes to deduplicate".into()));
        }
        for node in nodes {
            if node.id.is_empty() || node.title.is_empty() {
                return Err(Error::DeduplicationFailed(format!(
                    "node with id `{}` is missing an id or title",
                    node.id
                )));
            }
        }

        let mut uf = UnionFind::new();
        for node in nodes {
            uf.insert(&node.id);
        }

        let normalized: Vec<String> = nodes.iter().map(|n| normalize_text(&n.title)).collect();
        let mut phases = MergesByPhase::default();

        // Phase 1: exact normalized-title match.
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for (i, title) in normalized.iter().enumerate() {
            match seen.get(title.as_str()) {
                Some(&first) => {
                    if uf.union(&nodes[first].id, &nodes[i].id) {
                        phases.exact += 1;
                    }
                }
                None => {
                    seen.insert(title.as_str(), i);
                }
            }
        }

        // Phase 2: acronym expansion.
        let acronyms: Vec<usize> = nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| is_acronym(&n.title))
            .map(|(i, _)| i)
            .collect();
        for &ai in &acronyms {
            let acronym = nodes[ai].title.trim().to_uppercase();
            for (bi, node) in nodes.iter().enumerate() {
                if ai == bi || uf.same(&nodes[ai].id, &node.id) {
                    continue;
                }
                if initials(&node.title) == Some(acronym.clone())
                    && uf.union(&nodes[ai].id, &node.id)
                {
                    phases.acronym += 1;
                }
            }
        }

        // Phase 3: fuzzy similarity with word-overlap gate.
        let min_similarity = 1.0 - self.config.fuzzy_threshold;
        for i in 0..nodes.len() {
            for j in (i + 1)..nodes.len() {
                if uf.same(&nodes[i].id, &nodes[j].id) {
                    continue;
                }
                let similarity = levenshtein_similarity(&normalized[i], &normalized[j]);
                if similarity < min_similarity {
                    continue;
                }
                let overlap = jaccard_word_overlap(&normalized[i], &normalized[j]);
                if overlap >= self.config.word_overlap_threshold
                    && uf.union(&nodes[i].id, &nodes[j].id)
                {
                    phases.fuzzy += 1;
                }
            }
        }

        // Assemble: group members by root, pick the best representative.
        let mut classes: HashMap<String, Vec<usize>> = HashMap::new();
        let mut mapping = HashMap::new();
        for (i, node) in nodes.iter().enumerate() {
            let root = uf.find(&node.id);
            mapping.insert(node.id.clone(), root.clone());
            classes.entry(root).or_default().push(i);
        }

        // Deterministic output order: by first member's input position.
        let mut ordered: Vec<(String, Vec<usize>)> = classes.into_iter().collect();
        ordered.sort_by_key(|(_, members)| members[0]);

        let mut deduplicated_nodes = Vec::with_capacity(ordered.len());
        for (root, members) in ordered {
            let best = members
                .iter()
                .copied()
                .max_by(|&a, &b| {
                    quality(&nodes[a])
                        .partial_cmp(&quality(&nodes[b]))
                        .unwrap_or(std::cmp::Ordering::Equal)
                        // Stable tie-break: earlier input wins.
                        .then(b.cmp(&a))
                })
                .unwrap_or(members[0]);

            let mut node = nodes[best].clone();
            node.id = root;
            // Merge source references across the class.
            let mut refs: Vec<String> = Vec::new();
            for &m in &members {
                for r in &nodes[m].source_references {
                    if !refs.contains(r) {
                        refs.push(r.clone());
                    }
                }
            }
            node.source_references = refs;
            deduplicated_nodes.push(node);
        }

        let statistics = DedupStatistics {
            original_count: nodes.len(),
            final_count: deduplicated_nodes.len(),
            merged_count: nodes.len() - deduplicated_nodes.len(),
            merges_by_phase: phases,
        };

        Ok(DedupResult {
            deduplicated_nodes,
            mapping,
            statistics,
        })
    }
}

/// Representative quality: richer nodes carry more context into the merge.
fn quality(node: &GraphNode) -> f64 {
    node.title.len() as f64
        + 2.0 * node.description.as_deref().map_or(0, str::len) as f64
        + 2.5 * node.summary.as_deref().map_or(0, str::len) as f64
}

/// An all-uppercase 2–5 letter token.
fn is_acronym(title: &str) -> bool {
    let t = title.trim();
    (2..=5).contains(&t.len()) && t.chars().all(|c| c.is_ascii_uppercase())
}

/// Uppercase initials of a multi-word title; None for single words.
fn initials(title: &str) -> Option<String> {
    let words: Vec<&str> = title.split_whitespace().collect();
    if words.len() < 2 {
        return None;
    }
    Some(
        words
            .iter()
            .filter_map(|w| w.chars().next())
            .map(|c| c.to_ascii_uppercase())
            .collect(),
    )
}

/// `1 - dist/max(|a|,|b|)` over chars.
fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, &ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let substitution = prev[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(prev[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut prev, &mut current);
    }
    prev[b.len()]
}

/// `|A∩B| / |A∪B|` over whitespace-separated words.
fn jaccard_word_overlap(a: &str, b: &str) -> f64 {
    let set_a: std::collections::HashSet<&str> = a.split_whitespace().collect();
    let set_b: std::collections::HashSet<&str> = b.split_whitespace().collect();
    if set_a.is_empty() && set_b.is_empty() {
        return 1.0;
    }
    let intersection = set_a.intersection(&set_b).count();
    let union = set_a.union(&set_b).count();
    intersection as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn node(id: &str, title: &str) -> GraphNode {
        GraphNode::new(id, title)
    }

    #[test]
    fn test_union_find_basics() {
        let mut uf = UnionFind::new();
        uf.insert("a");
        uf.insert("b");
        uf.insert("c");

        assert!(uf.union("a", "b"));
        assert!(!uf.union("a", "b"));
        assert!(uf.same("a", "b"));
        assert!(!uf.same("a", "c"));

        uf.union("b", "c");
        assert!(uf.same("a", "c"));
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }

    #[test]
    fn test_empty_input_fails() {
        let err = Deduplicator::default().deduplicate(&[]).unwrap_err();
        assert_eq!(err.code(), "DEDUPLICATION_FAILED");
    }

    #[test]
    fn test_missing_title_fails() {
        let err = Deduplicator::default()
            .deduplicate(&[node("n1", "")])
            .unwrap_err();
        assert_eq!(err.code(), "DEDUPLICATION_FAILED");
    }

    #[test]
    fn test_single_node_passes_through() {
        let result = Deduplicator::default()
            .deduplicate(&[node("n1", "Machine Learning")])
            .unwrap();
        assert_eq!(result.deduplicated_nodes.len(), 1);
        assert_eq!(result.statistics.merged_count, 0);
        assert_eq!(result.mapping["n1"], "n1");
    }

    #[test]
    fn test_phases_merge_ml_variants() {
        let nodes = vec![
            node("n1", "ML"),
            node("n2", "Machine Learning"),
            node("n3", "machine learning"),
            node("n4", "Machine  Learning"),
            node("n5", "Deep Learning"),
        ];
        let result = Deduplicator::default().deduplicate(&nodes).unwrap();

        assert_eq!(result.statistics.original_count, 5);
        assert_eq!(result.statistics.final_count, 2);
        assert_eq!(result.statistics.merged_count, 3);
        assert!(result.statistics.merges_by_phase.exact >= 1);
        assert!(result.statistics.merges_by_phase.acronym >= 1);

        let ml_root = &result.mapping["n1"];
        for id in ["n2", "n3", "n4"] {
            assert_eq!(&result.mapping[id], ml_root);
        }
        assert_ne!(&result.mapping["n5"], ml_root);
    }

    #[test]
    fn test_jaccard_gate_blocks_false_positives() {
        let nodes = vec![
            node("n1", "Neural Networks"),
            node("n2", "Social Networks"),
        ];
        let result = Deduplicator::default().deduplicate(&nodes).unwrap();
        assert_eq!(result.statistics.final_count, 2);
        assert_eq!(result.statistics.merged_count, 0);
    }

    #[test]
    fn test_fuzzy_merges_near_duplicates() {
        let nodes = vec![
            node("n1", "gradient descent"),
            node("n2", "gradient descents"),
        ];
        let result = Deduplicator::default().deduplicate(&nodes).unwrap();
        assert_eq!(result.statistics.final_count, 1);
        assert_eq!(result.statistics.merges_by_phase.fuzzy, 1);
    }

    #[test]
    fn test_representative_keeps_richest_node() {
        let rich = node("n2", "Machine Learning")
            .with_description("A field of study concerned with learning from data")
            .with_summary("ML systems improve with experience. They power modern AI.")
            .with_node_type("CONCEPT");
        let nodes = vec![node("n1", "machine learning"), rich];

        let result = Deduplicator::default().deduplicate(&nodes).unwrap();
        assert_eq!(result.deduplicated_nodes.len(), 1);
        let survivor = &result.deduplicated_nodes[0];
        assert_eq!(survivor.node_type.as_deref(), Some("CONCEPT"));
        assert!(survivor.summary.is_some());
        // Canonical id is the union-find root, which covers both inputs.
        assert_eq!(result.mapping["n1"], survivor.id);
        assert_eq!(result.mapping["n2"], survivor.id);
    }

    #[test]
    fn test_edge_rewrite_through_mapping() {
        let nodes = vec![
            node("n1", "ML"),
            node("n2", "Machine Learning"),
            node("n3", "Statistics"),
        ];
        let result = Deduplicator::default().deduplicate(&nodes).unwrap();
        let edges = vec![GraphEdge::new("n1", "n3", "uses")];
        let rewritten = result.rewrite_edges(&edges);
        assert_eq!(rewritten[0].from, result.mapping["n2"]);
        assert_eq!(rewritten[0].to, "n3");
    }

    #[test]
    fn test_counts_balance() {
        let nodes = vec![
            node("a", "Alpha"),
            node("b", "alpha"),
            node("c", "Beta"),
            node("d", "Gamma"),
            node("e", "gamma "),
        ];
        let result = Deduplicator::default().deduplicate(&nodes).unwrap();
        assert_eq!(
            result.statistics.final_count + result.statistics.merged_count,
            result.statistics.original_count
        );
        assert_eq!(result.mapping.len(), nodes.len());
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn dedup_invariants_hold(titles in proptest::collection::vec("[a-z]{1,8}( [a-z]{1,8})?", 1..20)) {
            let nodes: Vec<GraphNode> = titles
                .iter()
                .enumerate()
                .map(|(i, t)| GraphNode::new(format!("n{i}"), t.clone()))
                .collect();

            let result = Deduplicator::default().deduplicate(&nodes).unwrap();

            // Counts balance.
            prop_assert_eq!(
                result.statistics.final_count + result.statistics.merged_count,
                result.statistics.original_count
            );
            // Mapping covers every input id.
            prop_assert_eq!(result.mapping.len(), nodes.len());
            // Every mapping target is a surviving node id.
            let survivors: std::collections::HashSet<&str> = result
                .deduplicated_nodes
                .iter()
                .map(|n| n.id.as_str())
                .collect();
            for target in result.mapping.values() {
                prop_assert!(survivors.contains(target.as_str()));
            }
        }

        #[test]
        fn mapping_is_transitively_closed(titles in proptest::collection::vec("[a-z]{1,6}", 2..15)) {
            let nodes: Vec<GraphNode> = titles
                .iter()
                .enumerate()
                .map(|(i, t)| GraphNode::new(format!("n{i}"), t.clone()))
                .collect();

            let result = Deduplicator::default().deduplicate(&nodes).unwrap();

            // Nodes with identical normalized titles must share a canonical id.
            for i in 0..nodes.len() {
                for j in 0..nodes.len() {
                    if normalize_text(&nodes[i].title) == normalize_text(&nodes[j].title) {
                        prop_assert_eq!(
                            &result.mapping[&nodes[i].id],
                            &result.mapping[&nodes[j].id]
                        );
                    }
                }
            }
        }
    }
}
