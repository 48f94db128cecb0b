//! LLM client abstraction over multiple providers.
//!
//! A unified interface for Anthropic and OpenAI chat completions. Model ids
//! are routed to the owning provider by [`MultiProviderClient`]; HTTP-level
//! failures are mapped into the crate error taxonomy (rate limits carry the
//! provider's Retry-After, 5xx maps to a retryable unavailable state).

mod client;
mod types;

pub use client::{AnthropicClient, ClientConfig, LLMClient, MultiProviderClient, OpenAIClient};
pub use types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, ModelSpec, Provider, StopReason,
    TokenUsage,
};
