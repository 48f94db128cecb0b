//! Prompt templates, versioning, and the substitution scanner.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

use super::context::PromptContext;

/// The operation a prompt template serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromptType {
    GraphGeneration,
    ConnectionExplanation,
    QuizGeneration,
    ImageDescription,
    NodeDeduplication,
}

impl PromptType {
    pub const ALL: [PromptType; 5] = [
        PromptType::GraphGeneration,
        PromptType::ConnectionExplanation,
        PromptType::QuizGeneration,
        PromptType::ImageDescription,
        PromptType::NodeDeduplication,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GraphGeneration => "graph-generation",
            Self::ConnectionExplanation => "connection-explanation",
            Self::QuizGeneration => "quiz-generation",
            Self::ImageDescription => "image-description",
            Self::NodeDeduplication => "node-deduplication",
        }
    }
}

impl std::fmt::Display for PromptType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Template rollout stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PromptVersion {
    #[default]
    Production,
    Staging,
    Experimental,
}

impl PromptVersion {
    pub const ALL: [PromptVersion; 3] = [
        PromptVersion::Production,
        PromptVersion::Staging,
        PromptVersion::Experimental,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Staging => "staging",
            Self::Experimental => "experimental",
        }
    }
}

impl std::fmt::Display for PromptVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structural constraints a template imposes on its output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateConstraints {
    pub min_nodes: Option<usize>,
    pub max_nodes: Option<usize>,
}

/// An immutable prompt template keyed by (type, version).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub prompt_type: PromptType,
    pub version: PromptVersion,
    pub system_prompt: String,
    /// Body with `{{var}}` and `{{#if var}}…{{/if}}` placeholders.
    pub body: String,
    pub required_keys: Vec<String>,
    pub optional_keys: Vec<String>,
    pub constraints: TemplateConstraints,
}

impl PromptTemplate {
    /// Stable identifier, e.g. `graph-generation:production`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.prompt_type, self.version)
    }

    /// Validate that every required context key is present.
    pub fn check_required(&self, context: &PromptContext) -> Result<()> {
        let missing: Vec<&str> = self
            .required_keys
            .iter()
            .filter(|k| context.lookup(k).is_none())
            .map(|k| k.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::PromptTemplate(format!(
                "template {} missing required context keys: {}",
                self.id(),
                missing.join(", ")
            )))
        }
    }

    /// Render the body against a context.
    ///
    /// Conditional blocks resolve first, then variable placeholders. An
    /// unresolvable `{{path}}` renders as empty (required keys are checked
    /// before rendering).
    pub fn render(&self, context: &PromptContext) -> String {
        substitute_vars(&strip_conditionals(&self.body, context), context)
    }
}

/// Resolve every non-nested `{{#if path}}BODY{{/if}}` block.
fn strip_conditionals(body: &str, context: &PromptContext) -> String {
    const OPEN: &str = "{{#if ";
    const CLOSE: &str = "{{/if}}";

    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];

        let Some(path_end) = after_open.find("}}") else {
            // Unterminated opener, emit literally.
            out.push_str(&rest[start..]);
            return out;
        };
        let path = after_open[..path_end].trim();
        let block = &after_open[path_end + 2..];

        let Some(close) = block.find(CLOSE) else {
            out.push_str(&rest[start..]);
            return out;
        };

        if context.is_truthy(path) {
            out.push_str(&block[..close]);
        }
        rest = &block[close + CLOSE.len()..];
    }
    out.push_str(rest);
    out
}

/// Replace every `{{path}}` placeholder with its rendered context value.
fn substitute_vars(body: &str, context: &PromptContext) -> String {
    let mut out = String::with_capacity(body.len());
    let mut rest = body;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let path = after[..end].trim();
        if let Some(value) = context.lookup(path) {
            out.push_str(&PromptContext::render(value));
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    out
}

/// Immutable store of templates created at process init.
#[derive(Debug, Clone)]
pub struct TemplateRegistry {
    templates: HashMap<(PromptType, PromptVersion), PromptTemplate>,
}

impl TemplateRegistry {
    /// Registry with no templates; useful for tests that register their own.
    pub fn empty() -> Self {
        Self {
            templates: HashMap::new(),
        }
    }

    /// Register a template. Later registrations for the same key win; only
    /// expected during init.
    pub fn register(&mut self, template: PromptTemplate) {
        self.templates
            .insert((template.prompt_type, template.version), template);
    }

    /// Resolve (type, version) to a template. No version fallback chain: a
    /// missing pair is a caller bug.
    pub fn get(&self, prompt_type: PromptType, version: PromptVersion) -> Result<&PromptTemplate> {
        self.templates
            .get(&(prompt_type, version))
            .ok_or_else(|| {
                Error::PromptTemplate(format!(
                    "no template registered for {prompt_type}:{version}"
                ))
            })
    }

    /// Versions that have a template registered for a type.
    pub fn versions_of(&self, prompt_type: PromptType) -> Vec<PromptVersion> {
        PromptVersion::ALL
            .into_iter()
            .filter(|v| self.templates.contains_key(&(prompt_type, *v)))
            .collect()
    }

    /// The built-in seed set: production templates for all five types plus a
    /// staging variant for graph generation.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();

        registry.register(PromptTemplate {
            prompt_type: PromptType::GraphGeneration,
            version: PromptVersion::Production,
            system_prompt: "You are a knowledge graph extraction engine. Read the supplied \
                document and extract the key concepts and the relationships between them. \
                Respond with strict JSON only, shaped as {\"nodes\": [{\"id\", \"title\", \
                \"description\", \"nodeType\", \"summary\"}], \"edges\": [{\"from\", \"to\", \
                \"relationship\", \"explanation\", \"strength\"}], \"mermaidCode\"}. Produce \
                between {{minNodes}} and {{maxNodes}} nodes. Every edge endpoint must be a \
                node id you emitted. Node summaries are two sentences grounding the concept \
                in the document."
                .to_string(),
            body: "{{#if documentTitle}}Document: {{documentTitle}}\n\n{{/if}}Extract a \
                knowledge graph from the following text.{{#if focusArea}} Focus on \
                {{focusArea}}.{{/if}}\n\n---\n{{documentText}}\n---"
                .to_string(),
            required_keys: vec!["documentText".into()],
            optional_keys: vec![
                "documentTitle".into(),
                "focusArea".into(),
                "minNodes".into(),
                "maxNodes".into(),
            ],
            constraints: TemplateConstraints {
                min_nodes: Some(7),
                max_nodes: Some(15),
            },
        });

        registry.register(PromptTemplate {
            prompt_type: PromptType::GraphGeneration,
            version: PromptVersion::Staging,
            system_prompt: "You extract knowledge graphs from documents. Output strict JSON: \
                {\"nodes\": [...], \"edges\": [...], \"mermaidCode\"}. Emit {{minNodes}} to \
                {{maxNodes}} nodes. Prefer fewer, better-grounded concepts over exhaustive \
                coverage; every node title must appear in the source text."
                .to_string(),
            body: "{{#if documentTitle}}Title: {{documentTitle}}\n{{/if}}Source text:\n\
                {{documentText}}"
                .to_string(),
            required_keys: vec!["documentText".into()],
            optional_keys: vec![
                "documentTitle".into(),
                "minNodes".into(),
                "maxNodes".into(),
            ],
            constraints: TemplateConstraints {
                min_nodes: Some(7),
                max_nodes: Some(15),
            },
        });

        registry.register(PromptTemplate {
            prompt_type: PromptType::ConnectionExplanation,
            version: PromptVersion::Production,
            system_prompt: "You explain why two concepts from a document are connected. \
                Respond with strict JSON: {\"explanation\"}. Quote short snippets from the \
                source that support the connection."
                .to_string(),
            body: "Explain the connection between \"{{nodeA.title}}\" and \
                \"{{nodeB.title}}\".{{#if relationship}} The stated relationship is \
                \"{{relationship}}\".{{/if}}\n\nSource:\n{{sourceText}}"
                .to_string(),
            required_keys: vec!["nodeA".into(), "nodeB".into(), "sourceText".into()],
            optional_keys: vec!["relationship".into()],
            constraints: TemplateConstraints::default(),
        });

        registry.register(PromptTemplate {
            prompt_type: PromptType::QuizGeneration,
            version: PromptVersion::Production,
            system_prompt: "You write multiple-choice quizzes over a document. Respond with \
                strict JSON: {\"questions\": [{\"question\", \"options\" (exactly 4), \
                \"correctAnswerIndex\" (0-3), \"explanation\", \"difficulty\" \
                (easy|medium|hard)}]}."
                .to_string(),
            body: "{{#if questionCount}}Write {{questionCount}} questions.{{/if}}{{#if \
                difficulty}} Target difficulty: {{difficulty}}.{{/if}}\n\nDocument:\n\
                {{documentText}}"
                .to_string(),
            required_keys: vec!["documentText".into()],
            optional_keys: vec!["questionCount".into(), "difficulty".into()],
            constraints: TemplateConstraints::default(),
        });

        registry.register(PromptTemplate {
            prompt_type: PromptType::ImageDescription,
            version: PromptVersion::Production,
            system_prompt: "You describe figures and diagrams extracted from documents so \
                they can join a knowledge graph. Respond with strict JSON: {\"description\", \
                \"concepts\": [...]}."
                .to_string(),
            body: "Describe the image in the context of this document.{{#if caption}} \
                Caption: {{caption}}.{{/if}}\n\nSurrounding text:\n{{surroundingText}}"
                .to_string(),
            required_keys: vec!["surroundingText".into()],
            optional_keys: vec!["caption".into()],
            constraints: TemplateConstraints::default(),
        });

        registry.register(PromptTemplate {
            prompt_type: PromptType::NodeDeduplication,
            version: PromptVersion::Production,
            system_prompt: "You decide whether two extracted concepts are the same entity. \
                Respond with strict JSON: {\"same\": true|false, \"reason\"}."
                .to_string(),
            body: "Concept A: {{nodeA.title}}{{#if nodeA.summary}} — {{nodeA.summary}}\
                {{/if}}\nConcept B: {{nodeB.title}}{{#if nodeB.summary}} — {{nodeB.summary}}\
                {{/if}}"
                .to_string(),
            required_keys: vec!["nodeA".into(), "nodeB".into()],
            optional_keys: vec![],
            constraints: TemplateConstraints::default(),
        });

        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ctx() -> PromptContext {
        PromptContext::new()
            .with("documentText", "ML is a subset of AI.")
            .with("documentTitle", "Intro")
            .with("nodeA", json!({"title": "ML"}))
            .with("nodeB", json!({"title": "AI"}))
    }

    #[test]
    fn test_variable_substitution() {
        let rendered = substitute_vars("A={{nodeA.title}}, B={{nodeB.title}}", &ctx());
        assert_eq!(rendered, "A=ML, B=AI");
    }

    #[test]
    fn test_missing_variable_renders_empty() {
        let rendered = substitute_vars("x{{absent}}y", &ctx());
        assert_eq!(rendered, "xy");
    }

    #[test]
    fn test_conditional_kept_when_truthy() {
        let rendered = strip_conditionals(
            "{{#if documentTitle}}T: {{documentTitle}}{{/if}} rest",
            &ctx(),
        );
        assert_eq!(rendered, "T: {{documentTitle}} rest");
    }

    #[test]
    fn test_conditional_dropped_when_falsy() {
        let rendered = strip_conditionals("{{#if absent}}gone{{/if}}kept", &ctx());
        assert_eq!(rendered, "kept");
    }

    #[test]
    fn test_full_render() {
        let template = PromptTemplate {
            prompt_type: PromptType::GraphGeneration,
            version: PromptVersion::Production,
            system_prompt: "sys".into(),
            body: "{{#if documentTitle}}[{{documentTitle}}] {{/if}}{{documentText}}".into(),
            required_keys: vec!["documentText".into()],
            optional_keys: vec![],
            constraints: TemplateConstraints::default(),
        };
        assert_eq!(template.render(&ctx()), "[Intro] ML is a subset of AI.");
    }

    #[test]
    fn test_required_key_check() {
        let registry = TemplateRegistry::builtin();
        let template = registry
            .get(PromptType::GraphGeneration, PromptVersion::Production)
            .unwrap();

        assert!(template.check_required(&ctx()).is_ok());

        let err = template
            .check_required(&PromptContext::new())
            .unwrap_err();
        assert_eq!(err.code(), "PROMPT_TEMPLATE_ERROR");
    }

    #[test]
    fn test_registry_no_version_fallback() {
        let registry = TemplateRegistry::builtin();
        // Only graph-generation carries a staging template.
        assert!(registry
            .get(PromptType::QuizGeneration, PromptVersion::Staging)
            .is_err());
        assert!(registry
            .get(PromptType::GraphGeneration, PromptVersion::Experimental)
            .is_err());
    }

    #[test]
    fn test_builtin_covers_all_types_in_production() {
        let registry = TemplateRegistry::builtin();
        for prompt_type in PromptType::ALL {
            assert!(registry.get(prompt_type, PromptVersion::Production).is_ok());
        }
    }
}
