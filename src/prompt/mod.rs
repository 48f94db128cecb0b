//! Prompt templates, context injection, and model recommendation.
//!
//! Templates are immutable records keyed by (type, version), created at
//! process init. The manager renders them against a free-form context,
//! recommends a model with fallbacks, and keeps running per-version
//! performance stats in the counter cache.

mod context;
mod manager;
mod template;

pub use context::PromptContext;
pub use manager::{
    BuiltPrompt, ModelRecommendation, PromptManager, PromptMetadata, PromptOutcome, PromptStats,
    VersionComparison, VersionScore, VersionVerdict,
};
pub use template::{
    PromptTemplate, PromptType, PromptVersion, TemplateConstraints, TemplateRegistry,
};
