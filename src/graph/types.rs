//! Knowledge graph data model.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Semantic categories nodes commonly fall into. The `node_type` field
/// accepts any string for forward compatibility; this set is advisory.
pub const NODE_TYPES: &[&str] = &[
    "CONCEPT",
    "METHOD",
    "ALGORITHM",
    "EVIDENCE",
    "CLAIM",
    "DEFINITION",
    "EXAMPLE",
    "PERSON",
    "ORGANIZATION",
    "SYSTEM",
    "COMPONENT",
    "PROCESS",
    "METRIC",
    "DATASET",
    "TOOL",
    "THEORY",
    "PRINCIPLE",
    "PROBLEM",
    "SOLUTION",
    "APPLICATION",
    "LIMITATION",
    "ASSUMPTION",
    "RESULT",
    "QUESTION",
    "EVENT",
];

/// A concept extracted from a document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphNode {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "nodeType", skip_serializing_if = "Option::is_none")]
    pub node_type: Option<String>,
    /// Two-sentence contextual description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(rename = "sourceReferences", default)]
    pub source_references: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl GraphNode {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: None,
            node_type: None,
            summary: None,
            source_references: Vec::new(),
            metadata: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_node_type(mut self, node_type: impl Into<String>) -> Self {
        self.node_type = Some(node_type.into());
        self
    }
}

/// A directed, labeled relationship between two nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    pub relationship: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    /// Connection strength in [0, 1].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl GraphEdge {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        relationship: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            relationship: relationship.into(),
            explanation: None,
            strength: None,
            metadata: None,
        }
    }

    /// Key identifying duplicates: same endpoints and relationship.
    pub fn dedup_key(&self) -> (String, String, String) {
        (
            self.from.clone(),
            self.to.clone(),
            self.relationship.clone(),
        )
    }
}

/// A complete knowledge graph.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GraphData {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    #[serde(rename = "mermaidCode", skip_serializing_if = "Option::is_none")]
    pub mermaid_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

impl GraphData {
    pub fn new(nodes: Vec<GraphNode>, edges: Vec<GraphEdge>) -> Self {
        Self {
            nodes,
            edges,
            mermaid_code: None,
            metadata: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_node_builder() {
        let node = GraphNode::new("n1", "Machine Learning")
            .with_description("A field of AI")
            .with_summary("ML studies learning from data. It underpins modern AI.")
            .with_node_type("CONCEPT");
        assert_eq!(node.id, "n1");
        assert!(node.summary.is_some());
    }

    #[test]
    fn test_edge_dedup_key() {
        let a = GraphEdge::new("x", "y", "uses");
        let b = GraphEdge::new("x", "y", "uses");
        let c = GraphEdge::new("x", "y", "extends");
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_ne!(a.dedup_key(), c.dedup_key());
    }

    #[test]
    fn test_graph_serde_field_names() {
        let mut graph = GraphData::new(
            vec![GraphNode::new("n1", "A").with_node_type("CONCEPT")],
            vec![],
        );
        graph.mermaid_code = Some("graph TD".into());
        let json = serde_json::to_value(&graph).unwrap();
        assert!(json.get("mermaidCode").is_some());
        assert!(json["nodes"][0].get("nodeType").is_some());
    }
}
