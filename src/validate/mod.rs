//! Output validation: structural and semantic checks on LLM output.
//!
//! Produces a 0–100 quality score plus actionable issues whose `fix` strings
//! are written as imperative instructions; the orchestrator appends them to
//! the retry prompt verbatim.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::prompt::PromptType;

/// Issue severity with its score deduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn deduction(&self) -> f64 {
        match self {
            Self::Critical => 50.0,
            Self::High => 15.0,
            Self::Medium => 5.0,
            Self::Low => 1.0,
        }
    }
}

/// Closed set of issue kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssueKind {
    MalformedJson,
    MissingField,
    TooFewNodes,
    TooManyNodes,
    OrphanedEdge,
    DisconnectedNodes,
    InvalidMermaid,
    PossibleHallucination,
    EmptyExplanation,
    ExplanationTooShort,
    ExplanationTooLong,
    MissingSourceQuotes,
    WrongOptionCount,
    InvalidAnswerIndex,
    MissingAnswerExplanation,
    InvalidDifficulty,
}

/// A single finding against the output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub kind: IssueKind,
    pub message: String,
    /// Imperative instruction appended to retry prompts.
    pub fix: Option<String>,
}

impl ValidationIssue {
    fn new(
        severity: Severity,
        kind: IssueKind,
        message: impl Into<String>,
        fix: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            kind,
            message: message.into(),
            fix: Some(fix.into()),
        }
    }
}

/// Validation depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationMode {
    Quick,
    #[default]
    Full,
}

/// Options for a validation pass.
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    /// Minimum passing score.
    pub threshold: f64,
    pub mode: ValidationMode,
    /// Source text for grounding checks in full mode.
    pub source_document: Option<String>,
    pub min_nodes: usize,
    pub max_nodes: usize,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            threshold: 60.0,
            mode: ValidationMode::Full,
            source_document: None,
            min_nodes: 7,
            max_nodes: 15,
        }
    }
}

/// Extra facts gathered during validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportMetadata {
    pub node_count: Option<usize>,
    pub edge_count: Option<usize>,
    pub grounding_percentage: Option<f64>,
    pub checked_at: Option<DateTime<Utc>>,
}

/// Result of a validation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub score: f64,
    pub issues: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
    pub metadata: ReportMetadata,
}

impl ValidationReport {
    /// The top issues' fix strings, for retry feedback.
    pub fn fixes(&self, limit: usize) -> Vec<String> {
        self.issues
            .iter()
            .filter_map(|i| i.fix.clone())
            .take(limit)
            .collect()
    }

    pub fn has_critical(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.severity == Severity::Critical)
    }
}

/// Scores LLM output and produces retry feedback.
#[derive(Debug, Clone, Default)]
pub struct OutputValidator;

impl OutputValidator {
    pub fn new() -> Self {
        Self
    }

    /// Validate raw LLM output for a prompt type.
    pub fn validate(
        &self,
        output: &str,
        prompt_type: PromptType,
        options: &ValidationOptions,
    ) -> ValidationReport {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();
        let mut metadata = ReportMetadata {
            checked_at: Some(Utc::now()),
            ..Default::default()
        };

        match extract_json(output) {
            Some(value) => match prompt_type {
                PromptType::GraphGeneration => {
                    check_graph(&value, options, &mut issues, &mut warnings, &mut metadata)
                }
                PromptType::ConnectionExplanation => {
                    check_connection(&value, options, &mut issues)
                }
                PromptType::QuizGeneration => check_quiz(&value, &mut issues),
                // Image description and dedup verdicts are free-form JSON;
                // parseability is the only structural requirement.
                PromptType::ImageDescription | PromptType::NodeDeduplication => {}
            },
            None => {
                issues.push(ValidationIssue::new(
                    Severity::Critical,
                    IssueKind::MalformedJson,
                    "output does not contain parseable JSON",
                    "Return strict JSON only, with no surrounding prose or markdown fences.",
                ));
            }
        }

        let deductions: f64 = issues.iter().map(|i| i.severity.deduction()).sum();
        let score = (100.0 - deductions).clamp(0.0, 100.0);
        let passed = score >= options.threshold && !issues.iter().any(|i| i.severity == Severity::Critical);

        ValidationReport {
            passed,
            score,
            issues,
            warnings,
            metadata,
        }
    }
}

/// Pull the first JSON object out of the output, tolerating fences and prose.
fn extract_json(output: &str) -> Option<Value> {
    let trimmed = output.trim();
    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        return Some(v);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

fn check_graph(
    value: &Value,
    options: &ValidationOptions,
    issues: &mut Vec<ValidationIssue>,
    warnings: &mut Vec<String>,
    metadata: &mut ReportMetadata,
) {
    let Some(nodes) = value.get("nodes").and_then(Value::as_array) else {
        issues.push(ValidationIssue::new(
            Severity::Critical,
            IssueKind::MissingField,
            "missing `nodes` array",
            "Include a top-level \"nodes\" array of node objects.",
        ));
        return;
    };
    let Some(edges) = value.get("edges").and_then(Value::as_array) else {
        issues.push(ValidationIssue::new(
            Severity::Critical,
            IssueKind::MissingField,
            "missing `edges` array",
            "Include a top-level \"edges\" array of edge objects.",
        ));
        return;
    };

    metadata.node_count = Some(nodes.len());
    metadata.edge_count = Some(edges.len());

    if nodes.len() < options.min_nodes {
        issues.push(ValidationIssue::new(
            Severity::Critical,
            IssueKind::TooFewNodes,
            format!(
                "graph has {} nodes, below the minimum of {}",
                nodes.len(),
                options.min_nodes
            ),
            format!(
                "Extract at least {} distinct concepts from the document.",
                options.min_nodes
            ),
        ));
    } else if nodes.len() > options.max_nodes {
        issues.push(ValidationIssue::new(
            Severity::Critical,
            IssueKind::TooManyNodes,
            format!(
                "graph has {} nodes, above the maximum of {}",
                nodes.len(),
                options.max_nodes
            ),
            format!(
                "Merge related concepts and keep at most {} nodes.",
                options.max_nodes
            ),
        ));
    }

    let node_ids: HashSet<&str> = nodes
        .iter()
        .filter_map(|n| n.get("id").and_then(Value::as_str))
        .collect();

    let mut connected: HashSet<&str> = HashSet::new();
    for edge in edges {
        let from = edge.get("from").and_then(Value::as_str).unwrap_or("");
        let to = edge.get("to").and_then(Value::as_str).unwrap_or("");
        connected.insert(from);
        connected.insert(to);
        for endpoint in [from, to] {
            if !node_ids.contains(endpoint) {
                issues.push(ValidationIssue::new(
                    Severity::High,
                    IssueKind::OrphanedEdge,
                    format!("edge references missing node `{endpoint}`"),
                    "Only reference node ids that exist in the nodes array.",
                ));
            }
        }
    }

    let disconnected: Vec<&str> = node_ids
        .iter()
        .filter(|id| !connected.contains(**id))
        .copied()
        .collect();
    if !disconnected.is_empty() && !edges.is_empty() {
        issues.push(ValidationIssue::new(
            Severity::Medium,
            IssueKind::DisconnectedNodes,
            format!("{} node(s) have no incident edges", disconnected.len()),
            "Connect every concept to at least one other concept with a meaningful edge.",
        ));
    }

    if let Some(mermaid) = value.get("mermaidCode").and_then(Value::as_str) {
        if !mermaid_ok(mermaid) {
            issues.push(ValidationIssue::new(
                Severity::Medium,
                IssueKind::InvalidMermaid,
                "mermaidCode must start with a `graph` directive and balance brackets",
                "Start mermaidCode with \"graph TD\" and balance every [ with a ].",
            ));
        }
    }

    if options.mode == ValidationMode::Full {
        if let Some(source) = options.source_document.as_deref() {
            let grounding = grounding_percentage(nodes, source);
            metadata.grounding_percentage = Some(grounding);
            if grounding < 60.0 {
                issues.push(ValidationIssue::new(
                    Severity::High,
                    IssueKind::PossibleHallucination,
                    format!("only {grounding:.0}% of node titles appear in the source"),
                    "Only extract concepts whose titles appear in the document text.",
                ));
            } else if grounding < 80.0 {
                warnings.push(format!(
                    "grounding is {grounding:.0}%; some titles may be paraphrased"
                ));
            }
        }
    }
}

/// `graph` directive prefix plus balanced square brackets.
pub fn mermaid_ok(code: &str) -> bool {
    if !code.trim_start().starts_with("graph") {
        return false;
    }
    let mut depth: i64 = 0;
    for c in code.chars() {
        match c {
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth < 0 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

fn normalize_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").unwrap())
}

/// Lowercase and collapse runs of whitespace.
pub fn normalize_text(text: &str) -> String {
    normalize_regex()
        .replace_all(text.to_lowercase().trim(), " ")
        .into_owned()
}

/// Fraction of node titles whose normalized form appears in the normalized
/// source, as a percentage.
fn grounding_percentage(nodes: &[Value], source: &str) -> f64 {
    let normalized_source = normalize_text(source);
    let titles: Vec<String> = nodes
        .iter()
        .filter_map(|n| n.get("title").and_then(Value::as_str))
        .map(normalize_text)
        .collect();
    if titles.is_empty() {
        return 0.0;
    }
    let grounded = titles
        .iter()
        .filter(|t| normalized_source.contains(t.as_str()))
        .count();
    grounded as f64 / titles.len() as f64 * 100.0
}

fn check_connection(value: &Value, options: &ValidationOptions, issues: &mut Vec<ValidationIssue>) {
    let explanation = value
        .get("explanation")
        .and_then(Value::as_str)
        .unwrap_or("");

    if explanation.is_empty() {
        issues.push(ValidationIssue::new(
            Severity::Critical,
            IssueKind::EmptyExplanation,
            "explanation is empty",
            "Provide a non-empty \"explanation\" field.",
        ));
        return;
    }

    if explanation.len() < 50 {
        issues.push(ValidationIssue::new(
            Severity::High,
            IssueKind::ExplanationTooShort,
            format!("explanation is {} chars, minimum is 50", explanation.len()),
            "Write at least two full sentences explaining the connection.",
        ));
    } else if explanation.len() > 2000 {
        issues.push(ValidationIssue::new(
            Severity::Medium,
            IssueKind::ExplanationTooLong,
            format!("explanation is {} chars, maximum is 2000", explanation.len()),
            "Shorten the explanation to under 2000 characters.",
        ));
    }

    if options.mode == ValidationMode::Full && !explanation.contains('"') {
        issues.push(ValidationIssue::new(
            Severity::Medium,
            IssueKind::MissingSourceQuotes,
            "explanation quotes no source snippets",
            "Quote at least one short snippet from the source in double quotes.",
        ));
    }
}

fn check_quiz(value: &Value, issues: &mut Vec<ValidationIssue>) {
    let Some(questions) = value.get("questions").and_then(Value::as_array) else {
        issues.push(ValidationIssue::new(
            Severity::Critical,
            IssueKind::MissingField,
            "missing `questions` array",
            "Include a top-level \"questions\" array.",
        ));
        return;
    };

    for (i, q) in questions.iter().enumerate() {
        let options_len = q
            .get("options")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        if options_len != 4 {
            issues.push(ValidationIssue::new(
                Severity::High,
                IssueKind::WrongOptionCount,
                format!("question {i} has {options_len} options"),
                "Give every question exactly 4 answer options.",
            ));
        }

        match q.get("correctAnswerIndex").and_then(Value::as_i64) {
            Some(idx) if (0..4).contains(&idx) => {}
            _ => issues.push(ValidationIssue::new(
                Severity::High,
                IssueKind::InvalidAnswerIndex,
                format!("question {i} has an out-of-range correctAnswerIndex"),
                "Set correctAnswerIndex to an integer between 0 and 3.",
            )),
        }

        let explanation_empty = q
            .get("explanation")
            .and_then(Value::as_str)
            .map(str::is_empty)
            .unwrap_or(true);
        if explanation_empty {
            issues.push(ValidationIssue::new(
                Severity::Medium,
                IssueKind::MissingAnswerExplanation,
                format!("question {i} has no answer explanation"),
                "Explain why the correct answer is correct for every question.",
            ));
        }

        let difficulty = q.get("difficulty").and_then(Value::as_str).unwrap_or("");
        if !matches!(difficulty, "easy" | "medium" | "hard") {
            issues.push(ValidationIssue::new(
                Severity::Low,
                IssueKind::InvalidDifficulty,
                format!("question {i} has difficulty `{difficulty}`"),
                "Set difficulty to one of: easy, medium, hard.",
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn graph_output(node_count: usize) -> String {
        let nodes: Vec<Value> = (0..node_count)
            .map(|i| json!({"id": format!("n{i}"), "title": format!("Concept {i}")}))
            .collect();
        let edges: Vec<Value> = (1..node_count)
            .map(|i| json!({"from": "n0", "to": format!("n{i}"), "relationship": "relates-to"}))
            .collect();
        json!({"nodes": nodes, "edges": edges}).to_string()
    }

    #[test]
    fn test_valid_graph_passes() {
        let report = OutputValidator::new().validate(
            &graph_output(7),
            PromptType::GraphGeneration,
            &ValidationOptions::default(),
        );
        assert!(report.passed, "issues: {:?}", report.issues);
        assert_eq!(report.score, 100.0);
        assert_eq!(report.metadata.node_count, Some(7));
    }

    #[test]
    fn test_node_count_bounds_are_inclusive() {
        let v = OutputValidator::new();
        let opts = ValidationOptions::default();
        assert!(v
            .validate(&graph_output(7), PromptType::GraphGeneration, &opts)
            .passed);
        assert!(v
            .validate(&graph_output(15), PromptType::GraphGeneration, &opts)
            .passed);
        assert!(!v
            .validate(&graph_output(6), PromptType::GraphGeneration, &opts)
            .passed);
        assert!(!v
            .validate(&graph_output(16), PromptType::GraphGeneration, &opts)
            .passed);
    }

    #[test]
    fn test_single_node_graph_fails_critically() {
        let report = OutputValidator::new().validate(
            &graph_output(1),
            PromptType::GraphGeneration,
            &ValidationOptions::default(),
        );
        assert!(!report.passed);
        assert!(report.has_critical());
        assert!(report.score <= 50.0);
        let fixes = report.fixes(3);
        assert!(fixes.iter().any(|f| f.contains("at least 7")));
    }

    #[test]
    fn test_unparseable_output_is_critical() {
        let report = OutputValidator::new().validate(
            "I could not generate a graph, sorry!",
            PromptType::GraphGeneration,
            &ValidationOptions::default(),
        );
        assert!(!report.passed);
        assert_eq!(report.issues[0].kind, IssueKind::MalformedJson);
    }

    #[test]
    fn test_json_extracted_from_fenced_output() {
        let fenced = format!("Here you go:\n```json\n{}\n```", graph_output(8));
        let report = OutputValidator::new().validate(
            &fenced,
            PromptType::GraphGeneration,
            &ValidationOptions::default(),
        );
        assert!(report.passed);
    }

    #[test]
    fn test_orphaned_edge_detected() {
        let output = json!({
            "nodes": (0..7).map(|i| json!({"id": format!("n{i}"), "title": format!("C{i}")})).collect::<Vec<_>>(),
            "edges": [{"from": "n0", "to": "n999", "relationship": "uses"}],
        })
        .to_string();
        let report = OutputValidator::new().validate(
            &output,
            PromptType::GraphGeneration,
            &ValidationOptions::default(),
        );
        assert!(report
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::OrphanedEdge));
    }

    #[test]
    fn test_mermaid_check() {
        assert!(mermaid_ok("graph TD\n  a[A] --> b[B]"));
        assert!(!mermaid_ok("flowchart TD\n  a --> b"));
        assert!(!mermaid_ok("graph TD\n  a[A --> b[B]"));
        assert!(!mermaid_ok("graph TD\n  a]A[ --> b"));
    }

    #[test]
    fn test_grounding_flags_hallucination() {
        let source = "Machine learning is a subset of AI. Neural networks are used in ML.";
        let output = json!({
            "nodes": [
                {"id": "a", "title": "Machine Learning"},
                {"id": "b", "title": "Neural Networks"},
                {"id": "c", "title": "Quantum Chromodynamics"},
                {"id": "d", "title": "Plate Tectonics"},
                {"id": "e", "title": "Baroque Architecture"},
                {"id": "f", "title": "Mitochondria"},
                {"id": "g", "title": "Game Theory"},
            ],
            "edges": [
                {"from": "a", "to": "b", "relationship": "uses"},
                {"from": "a", "to": "c", "relationship": "r"},
                {"from": "a", "to": "d", "relationship": "r"},
                {"from": "a", "to": "e", "relationship": "r"},
                {"from": "a", "to": "f", "relationship": "r"},
                {"from": "a", "to": "g", "relationship": "r"},
            ],
        })
        .to_string();

        let options = ValidationOptions {
            source_document: Some(source.to_string()),
            ..Default::default()
        };
        let report =
            OutputValidator::new().validate(&output, PromptType::GraphGeneration, &options);
        assert!(report
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::PossibleHallucination));
        let grounding = report.metadata.grounding_percentage.unwrap();
        assert!(grounding < 60.0, "grounding was {grounding}");
    }

    #[test]
    fn test_connection_explanation_bounds() {
        let v = OutputValidator::new();
        let opts = ValidationOptions {
            mode: ValidationMode::Quick,
            ..Default::default()
        };

        let short = json!({"explanation": "Too short."}).to_string();
        let report = v.validate(&short, PromptType::ConnectionExplanation, &opts);
        assert!(report
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::ExplanationTooShort));

        let good = json!({"explanation": "x".repeat(120)}).to_string();
        assert!(v
            .validate(&good, PromptType::ConnectionExplanation, &opts)
            .passed);
    }

    #[test]
    fn test_connection_full_mode_wants_quotes() {
        let output =
            json!({"explanation": format!("{} as the text says.", "y".repeat(80))}).to_string();
        let report = OutputValidator::new().validate(
            &output,
            PromptType::ConnectionExplanation,
            &ValidationOptions::default(),
        );
        assert!(report
            .issues
            .iter()
            .any(|i| i.kind == IssueKind::MissingSourceQuotes));
    }

    #[test]
    fn test_quiz_checks() {
        let output = json!({
            "questions": [
                {
                    "question": "What is ML?",
                    "options": ["a", "b", "c"],
                    "correctAnswerIndex": 5,
                    "explanation": "",
                    "difficulty": "impossible",
                },
                {
                    "question": "What is AI?",
                    "options": ["a", "b", "c", "d"],
                    "correctAnswerIndex": 1,
                    "explanation": "Because.",
                    "difficulty": "easy",
                },
            ]
        })
        .to_string();

        let report = OutputValidator::new().validate(
            &output,
            PromptType::QuizGeneration,
            &ValidationOptions::default(),
        );
        let kinds: Vec<IssueKind> = report.issues.iter().map(|i| i.kind).collect();
        assert!(kinds.contains(&IssueKind::WrongOptionCount));
        assert!(kinds.contains(&IssueKind::InvalidAnswerIndex));
        assert!(kinds.contains(&IssueKind::MissingAnswerExplanation));
        assert!(kinds.contains(&IssueKind::InvalidDifficulty));
    }

    #[test]
    fn test_severity_deductions() {
        assert_eq!(Severity::Critical.deduction(), 50.0);
        assert_eq!(Severity::High.deduction(), 15.0);
        assert_eq!(Severity::Medium.deduction(), 5.0);
        assert_eq!(Severity::Low.deduction(), 1.0);
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Machine\n\nLearning  "), "machine learning");
    }
}
