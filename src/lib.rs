//! # graphex-core
//!
//! Budget-bounded LLM orchestration for turning documents into knowledge
//! graphs, quizzes, and connection explanations.
//!
//! ## Core Components
//!
//! - **Prompt**: versioned templates, context injection, model recommendation
//! - **Cost**: pre-flight budget checks over a counter cache backed by an
//!   append-only usage ledger
//! - **Validate**: structural and semantic scoring of LLM output with
//!   actionable retry feedback
//! - **Orchestrator**: the retry/fallback/cache/validate loop around a single
//!   LLM invocation
//! - **Graph**: chunking, union-find deduplication, graph validation with
//!   auto-fix, and the assembly pipeline
//! - **Job**: bounded background queue the HTTP layer submits work to
//!
//! ## Example
//!
//! ```rust,ignore
//! use graphex_core::{
//!     AnthropicClient, ClientConfig, CostTracker, ExecuteRequest, LLMClient,
//!     MemoryStore, MultiProviderClient, Orchestrator, PromptContext,
//!     PromptManager, PromptType, UsageLedger,
//! };
//! use std::sync::Arc;
//!
//! let store = Arc::new(MemoryStore::new());
//! let llm = Arc::new(
//!     MultiProviderClient::new()
//!         .with_client(Arc::new(AnthropicClient::new(ClientConfig::new(api_key)))),
//! );
//! let orchestrator = Orchestrator::new(
//!     llm,
//!     Arc::new(PromptManager::new(store.clone())),
//!     Arc::new(CostTracker::new(Arc::new(UsageLedger::open("usage.db")?), store.clone())),
//!     store,
//! );
//!
//! let request = ExecuteRequest::new(
//!     PromptType::GraphGeneration,
//!     PromptContext::new().with("documentText", document),
//! )
//! .with_user("user-42");
//! let response = orchestrator.execute(&request).await?;
//! ```

pub mod cost;
pub mod error;
pub mod graph;
pub mod job;
pub mod llm;
pub mod orchestrator;
pub mod prompt;
pub mod store;
pub mod validate;

// Re-exports for convenience
pub use cost::{
    BudgetCheckRequest, BudgetDecision, BudgetLimits, CostTracker, CurrentUsage, DenialReason,
    OperationCost, UsageLedger, UsageRecord, UsageSummary, UsageWindow,
};
pub use error::{Error, Result};
pub use graph::{
    progress_channel, Chunk, Chunker, DedupConfig, DedupResult, Deduplicator, GenerateParams,
    GenerationProgress, GenerationStage, GeneratorConfig, GraphData, GraphEdge, GraphGenerator,
    GraphNode, GraphValidationReport, GraphValidator, GraphValidatorConfig, UnionFind,
};
pub use job::{JobHandler, JobQueue, JobQueueConfig, JobSpec, JobState, JobStatus};
pub use llm::{
    AnthropicClient, ChatMessage, ChatRole, ClientConfig, CompletionRequest, CompletionResponse,
    LLMClient, ModelSpec, MultiProviderClient, OpenAIClient, Provider, TokenUsage,
};
pub use orchestrator::{
    CachedResult, ExecuteRequest, ExecuteResponse, Orchestrator, OrchestratorConfig, ResponseMeta,
};
pub use prompt::{
    BuiltPrompt, ModelRecommendation, PromptContext, PromptManager, PromptStats, PromptTemplate,
    PromptType, PromptVersion, TemplateRegistry, VersionComparison, VersionVerdict,
};
pub use store::{KeyValueStore, MemoryStore};
pub use validate::{
    IssueKind, OutputValidator, Severity, ValidationIssue, ValidationMode, ValidationOptions,
    ValidationReport,
};
