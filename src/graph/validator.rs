//! Graph validation with iterated auto-fix.
//!
//! Structural problems (empty/duplicate ids, incomplete edges) are not
//! fixable and surface as errors. Everything else — orphaned, duplicate and
//! self-referencing edges, node-count overflow, broken mermaid — is repaired
//! in a fixed order until a pass produces no new fixes.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};
use crate::validate::mermaid_ok;

use super::types::{GraphData, GraphEdge};

/// Validation and auto-fix configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GraphValidatorConfig {
    pub min_nodes: usize,
    pub max_nodes: usize,
    pub auto_fix: bool,
    pub remove_isolated_nodes: bool,
}

impl Default for GraphValidatorConfig {
    fn default() -> Self {
        Self {
            min_nodes: 7,
            max_nodes: 15,
            auto_fix: true,
            remove_isolated_nodes: false,
        }
    }
}

/// Counts of problems found and repairs applied.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GraphStatistics {
    pub node_count: usize,
    pub edge_count: usize,
    pub orphaned_edges_removed: usize,
    pub duplicate_edges_removed: usize,
    pub self_references_removed: usize,
    pub nodes_trimmed: usize,
    pub isolated_nodes: usize,
}

/// Validation outcome. `fixed_graph` is present when auto-fix changed
/// anything; `is_valid` describes the fixed graph when it exists, the input
/// otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub fixed_graph: Option<GraphData>,
    pub fixes: Vec<String>,
    pub statistics: GraphStatistics,
}

/// Validates graphs and repairs what it can.
#[derive(Debug, Clone, Default)]
pub struct GraphValidator {
    config: GraphValidatorConfig,
}

impl GraphValidator {
    pub fn new(config: GraphValidatorConfig) -> Self {
        Self { config }
    }

    /// Validate a graph, auto-fixing when configured.
    ///
    /// Structural failures (empty or duplicate node ids, edges missing an
    /// endpoint or relationship) are unfixable and return an error.
    pub fn validate(&self, graph: &GraphData) -> Result<GraphValidationReport> {
        self.structural_check(graph)?;

        let original_errors = self.collect_errors(graph);
        let original_valid = original_errors.is_empty();

        if !self.config.auto_fix || original_valid {
            let (warnings, stats) = self.describe(graph);
            return Ok(GraphValidationReport {
                is_valid: original_valid,
                errors: original_errors,
                warnings,
                fixed_graph: None,
                fixes: Vec::new(),
                statistics: stats,
            });
        }

        let mut working = graph.clone();
        let mut fixes = Vec::new();
        let mut statistics = GraphStatistics::default();

        // Iterate: a fix can expose new problems (trimming nodes orphans
        // edges). Halt when a pass produces nothing.
        for _ in 0..10 {
            let applied = self.fix_pass(&mut working, &mut fixes, &mut statistics);
            if !applied {
                break;
            }
        }

        let remaining = self.collect_errors(&working);
        let fixable_remaining = remaining
            .iter()
            .any(|e| !e.starts_with("TOO_FEW_NODES"));
        if fixable_remaining {
            return Err(Error::AutoFixFailed(format!(
                "auto-fix did not converge: {}",
                remaining.join("; ")
            )));
        }

        let (warnings, mut stats) = self.describe(&working);
        stats.orphaned_edges_removed = statistics.orphaned_edges_removed;
        stats.duplicate_edges_removed = statistics.duplicate_edges_removed;
        stats.self_references_removed = statistics.self_references_removed;
        stats.nodes_trimmed = statistics.nodes_trimmed;

        let fixed_graph = (!fixes.is_empty()).then_some(working);
        Ok(GraphValidationReport {
            is_valid: remaining.is_empty(),
            errors: remaining,
            warnings,
            fixed_graph,
            fixes,
            statistics: stats,
        })
    }

    fn structural_check(&self, graph: &GraphData) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &graph.nodes {
            if node.id.is_empty() {
                return Err(Error::InvalidGraphStructure(
                    "node with empty id".to_string(),
                ));
            }
            if !seen.insert(node.id.as_str()) {
                return Err(Error::InvalidGraphStructure(format!(
                    "duplicate node id `{}`",
                    node.id
                )));
            }
        }
        for edge in &graph.edges {
            if edge.from.is_empty() || edge.to.is_empty() || edge.relationship.is_empty() {
                return Err(Error::InvalidGraphStructure(
                    "edge missing from, to, or relationship".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Fixable problems, rendered as error strings.
    fn collect_errors(&self, graph: &GraphData) -> Vec<String> {
        let mut errors = Vec::new();
        let node_ids: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();

        let orphaned = graph
            .edges
            .iter()
            .filter(|e| !node_ids.contains(e.from.as_str()) || !node_ids.contains(e.to.as_str()))
            .count();
        if orphaned > 0 {
            errors.push(format!("ORPHANED_EDGES: {orphaned} edge(s) reference missing nodes"));
        }

        let mut keys = HashSet::new();
        let duplicates = graph
            .edges
            .iter()
            .filter(|e| !keys.insert(e.dedup_key()))
            .count();
        if duplicates > 0 {
            errors.push(format!("DUPLICATE_EDGES: {duplicates} duplicate edge(s)"));
        }

        let self_refs = graph.edges.iter().filter(|e| e.from == e.to).count();
        if self_refs > 0 {
            errors.push(format!("SELF_REFERENCES: {self_refs} self-referencing edge(s)"));
        }

        if graph.nodes.len() < self.config.min_nodes {
            errors.push(format!(
                "TOO_FEW_NODES: {} < {}",
                graph.nodes.len(),
                self.config.min_nodes
            ));
        } else if graph.nodes.len() > self.config.max_nodes {
            errors.push(format!(
                "TOO_MANY_NODES: {} > {}",
                graph.nodes.len(),
                self.config.max_nodes
            ));
        }

        if let Some(mermaid) = graph.mermaid_code.as_deref() {
            if !mermaid_ok(mermaid) {
                errors.push("INVALID_MERMAID: mermaid code fails the graph-directive or bracket check".to_string());
            }
        }

        errors
    }

    /// One repair pass. Returns whether anything changed.
    fn fix_pass(
        &self,
        graph: &mut GraphData,
        fixes: &mut Vec<String>,
        stats: &mut GraphStatistics,
    ) -> bool {
        let mut changed = false;
        let node_ids: HashSet<String> = graph.nodes.iter().map(|n| n.id.clone()).collect();

        // Orphaned edges first: later fixes assume endpoints resolve.
        let before = graph.edges.len();
        graph
            .edges
            .retain(|e| node_ids.contains(&e.from) && node_ids.contains(&e.to));
        let removed = before - graph.edges.len();
        if removed > 0 {
            stats.orphaned_edges_removed += removed;
            fixes.push(format!("removed {removed} orphaned edge(s)"));
            changed = true;
        }

        let before = graph.edges.len();
        let mut keys = HashSet::new();
        graph.edges.retain(|e| keys.insert(e.dedup_key()));
        let removed = before - graph.edges.len();
        if removed > 0 {
            stats.duplicate_edges_removed += removed;
            fixes.push(format!("removed {removed} duplicate edge(s)"));
            changed = true;
        }

        let before = graph.edges.len();
        graph.edges.retain(|e| e.from != e.to);
        let removed = before - graph.edges.len();
        if removed > 0 {
            stats.self_references_removed += removed;
            fixes.push(format!("removed {removed} self-referencing edge(s)"));
            changed = true;
        }

        if graph.nodes.len() > self.config.max_nodes {
            let trimmed = self.trim_to_most_connected(graph);
            stats.nodes_trimmed += trimmed;
            fixes.push(format!("trimmed {trimmed} least-connected node(s)"));
            changed = true;
        }

        if self.config.remove_isolated_nodes && graph.nodes.len() > self.config.min_nodes {
            let connected = connected_ids(&graph.edges);
            let before = graph.nodes.len();
            let min_nodes = self.config.min_nodes;
            let mut kept = 0usize;
            graph.nodes.retain(|n| {
                // Never drop below the minimum.
                if connected.contains(n.id.as_str()) || before - kept <= min_nodes {
                    true
                } else {
                    kept += 1;
                    false
                }
            });
            let removed = before - graph.nodes.len();
            if removed > 0 {
                fixes.push(format!("removed {removed} isolated node(s)"));
                changed = true;
            }
        }

        if let Some(mermaid) = graph.mermaid_code.as_deref() {
            if !mermaid_ok(mermaid) {
                graph.mermaid_code = Some(generate_mermaid(graph));
                fixes.push("regenerated mermaid code".to_string());
                changed = true;
            }
        }

        changed
    }

    /// Keep the `max_nodes` highest-degree nodes (stable tie-break on input
    /// order), then drop edges referencing removed nodes.
    fn trim_to_most_connected(&self, graph: &mut GraphData) -> usize {
        let mut degree: HashMap<&str, usize> = HashMap::new();
        for edge in &graph.edges {
            *degree.entry(edge.from.as_str()).or_default() += 1;
            *degree.entry(edge.to.as_str()).or_default() += 1;
        }

        let mut ranked: Vec<(usize, usize)> = graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (i, degree.get(n.id.as_str()).copied().unwrap_or(0)))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        let keep: HashSet<usize> = ranked
            .iter()
            .take(self.config.max_nodes)
            .map(|(i, _)| *i)
            .collect();

        let before = graph.nodes.len();
        let mut index = 0usize;
        graph.nodes.retain(|_| {
            let retained = keep.contains(&index);
            index += 1;
            retained
        });

        let surviving: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
        graph
            .edges
            .retain(|e| surviving.contains(e.from.as_str()) && surviving.contains(e.to.as_str()));

        before - graph.nodes.len()
    }

    /// Warnings and base statistics for a graph.
    fn describe(&self, graph: &GraphData) -> (Vec<String>, GraphStatistics) {
        let connected = connected_ids(&graph.edges);
        let isolated = graph
            .nodes
            .iter()
            .filter(|n| !connected.contains(n.id.as_str()))
            .count();

        let mut warnings = Vec::new();
        if isolated > 0 && !graph.edges.is_empty() {
            warnings.push(format!("{isolated} node(s) have no incident edges"));
        }

        let stats = GraphStatistics {
            node_count: graph.nodes.len(),
            edge_count: graph.edges.len(),
            isolated_nodes: isolated,
            ..Default::default()
        };
        (warnings, stats)
    }
}

fn connected_ids(edges: &[GraphEdge]) -> HashSet<&str> {
    let mut ids = HashSet::new();
    for edge in edges {
        ids.insert(edge.from.as_str());
        ids.insert(edge.to.as_str());
    }
    ids
}

/// Deterministic mermaid rendering: one line per edge.
pub fn generate_mermaid(graph: &GraphData) -> String {
    let titles: HashMap<&str, &str> = graph
        .nodes
        .iter()
        .map(|n| (n.id.as_str(), n.title.as_str()))
        .collect();

    let mut out = String::from("graph TD");
    for edge in &graph.edges {
        let from_title = sanitize(titles.get(edge.from.as_str()).unwrap_or(&edge.from.as_str()));
        let to_title = sanitize(titles.get(edge.to.as_str()).unwrap_or(&edge.to.as_str()));
        out.push_str(&format!(
            "\n  {}[{}] -->|{}| {}[{}]",
            edge.from,
            from_title,
            sanitize(&edge.relationship),
            edge.to,
            to_title,
        ));
    }
    out
}

/// Strip characters that break mermaid node/label syntax.
fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| !matches!(c, '[' | ']' | '|' | '"'))
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::types::GraphNode;
    use pretty_assertions::assert_eq;

    fn graph(node_ids: &[&str], edges: &[(&str, &str)]) -> GraphData {
        GraphData::new(
            node_ids
                .iter()
                .map(|id| GraphNode::new(*id, format!("Title {id}")))
                .collect(),
            edges
                .iter()
                .map(|(f, t)| GraphEdge::new(*f, *t, "relates-to"))
                .collect(),
        )
    }

    fn seven_nodes() -> Vec<&'static str> {
        vec!["A", "B", "C", "D", "E", "F", "G"]
    }

    #[test]
    fn test_valid_graph_no_fixes() {
        let g = graph(
            &seven_nodes(),
            &[
                ("A", "B"),
                ("B", "C"),
                ("C", "D"),
                ("D", "E"),
                ("E", "F"),
                ("F", "G"),
            ],
        );
        let report = GraphValidator::default().validate(&g).unwrap();
        assert!(report.is_valid);
        assert!(report.fixes.is_empty());
        assert!(report.fixed_graph.is_none());
    }

    #[test]
    fn test_structural_failure_not_fixable() {
        let mut g = graph(&["A", "B", "C", "D", "E", "F", "G"], &[("A", "B")]);
        g.nodes[1].id = "A".to_string();
        let err = GraphValidator::default().validate(&g).unwrap_err();
        assert_eq!(err.code(), "INVALID_GRAPH_STRUCTURE");
    }

    #[test]
    fn test_orphan_edge_auto_fix() {
        let g = graph(&seven_nodes(), &[("A", "B"), ("B", "999"), ("C", "D")]);

        // Without auto-fix the graph is invalid.
        let report = GraphValidator::new(GraphValidatorConfig {
            auto_fix: false,
            ..Default::default()
        })
        .validate(&g)
        .unwrap();
        assert!(!report.is_valid);

        // With auto-fix the orphaned edge is dropped.
        let report = GraphValidator::default().validate(&g).unwrap();
        assert!(report.is_valid);
        assert_eq!(report.statistics.orphaned_edges_removed, 1);
        let fixed = report.fixed_graph.unwrap();
        assert_eq!(fixed.edges.len(), 2);
        assert!(fixed.edges.iter().all(|e| e.to != "999"));
    }

    #[test]
    fn test_duplicate_and_self_edges_removed() {
        let g = graph(
            &seven_nodes(),
            &[("A", "B"), ("A", "B"), ("C", "C"), ("C", "D")],
        );
        let report = GraphValidator::default().validate(&g).unwrap();
        assert!(report.is_valid);
        assert_eq!(report.statistics.duplicate_edges_removed, 1);
        assert_eq!(report.statistics.self_references_removed, 1);
        assert_eq!(report.fixed_graph.unwrap().edges.len(), 2);
    }

    #[test]
    fn test_node_count_at_bounds_is_valid() {
        let validator = GraphValidator::default();

        let ids: Vec<String> = (0..7).map(|i| format!("n{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let g = graph(&id_refs, &[("n0", "n1")]);
        assert!(validator.validate(&g).unwrap().is_valid);

        let ids: Vec<String> = (0..15).map(|i| format!("n{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let g = graph(&id_refs, &[("n0", "n1")]);
        let report = validator.validate(&g).unwrap();
        assert!(report.is_valid);
        assert!(report.fixes.is_empty());
    }

    #[test]
    fn test_too_many_nodes_trimmed_by_degree() {
        let ids: Vec<String> = (0..18).map(|i| format!("n{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        // n0..n14 connected in a chain; n15..n17 isolated.
        let edges: Vec<(&str, &str)> = (0..14).map(|i| (id_refs[i], id_refs[i + 1])).collect();
        let g = graph(&id_refs, &edges);

        let report = GraphValidator::default().validate(&g).unwrap();
        assert!(report.is_valid);
        assert_eq!(report.statistics.nodes_trimmed, 3);
        let fixed = report.fixed_graph.unwrap();
        assert_eq!(fixed.nodes.len(), 15);
        assert!(fixed.nodes.iter().all(|n| n.id != "n15"));
        // Every edge still resolves.
        let surviving: HashSet<&str> = fixed.nodes.iter().map(|n| n.id.as_str()).collect();
        assert!(fixed
            .edges
            .iter()
            .all(|e| surviving.contains(e.from.as_str()) && surviving.contains(e.to.as_str())));
    }

    #[test]
    fn test_too_few_nodes_not_fixable() {
        let g = graph(&["A", "B"], &[("A", "B")]);
        let report = GraphValidator::default().validate(&g).unwrap();
        assert!(!report.is_valid);
        assert!(report.errors.iter().any(|e| e.starts_with("TOO_FEW_NODES")));
    }

    #[test]
    fn test_mermaid_regeneration() {
        let mut g = graph(&seven_nodes(), &[("A", "B"), ("C", "D")]);
        g.mermaid_code = Some("flowchart TD\n broken [".to_string());

        let report = GraphValidator::default().validate(&g).unwrap();
        assert!(report.is_valid);
        let fixed = report.fixed_graph.unwrap();
        let mermaid = fixed.mermaid_code.unwrap();
        assert!(mermaid_ok(&mermaid));
        assert!(mermaid.contains("A[Title A] -->|relates-to| B[Title B]"));
    }

    #[test]
    fn test_mermaid_sanitization() {
        let g = GraphData::new(
            vec![
                GraphNode::new("a", "Queue [FIFO]"),
                GraphNode::new("b", "Pipe | Filter"),
            ],
            vec![GraphEdge::new("a", "b", "feeds \"into\"")],
        );
        let mermaid = generate_mermaid(&g);
        assert!(mermaid_ok(&mermaid));
        assert!(mermaid.contains("a[Queue FIFO]"));
        assert!(mermaid.contains("|feeds into|"));
    }

    #[test]
    fn test_auto_fix_is_fixed_point() {
        let g = graph(
            &seven_nodes(),
            &[("A", "B"), ("A", "B"), ("B", "999"), ("C", "C"), ("C", "D")],
        );
        let first = GraphValidator::default().validate(&g).unwrap();
        let fixed = first.fixed_graph.unwrap();

        let second = GraphValidator::default().validate(&fixed).unwrap();
        assert!(second.is_valid);
        assert!(second.fixes.is_empty(), "fixes: {:?}", second.fixes);
        assert!(second.fixed_graph.is_none());
    }
}
