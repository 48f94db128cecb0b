//! LLM types for requests, responses, and model definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// LLM provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Provider {
    Anthropic,
    OpenAI,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anthropic => write!(f, "anthropic"),
            Self::OpenAI => write!(f, "openai"),
        }
    }
}

/// Model definition with pricing and capabilities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model identifier (e.g., "claude-haiku")
    pub id: String,
    /// Human-readable name
    pub name: String,
    /// Provider
    pub provider: Provider,
    /// Maximum context window (tokens)
    pub context_window: u32,
    /// Maximum output tokens
    pub max_output: u32,
    /// Input cost per million tokens (USD)
    pub input_cost_per_m: f64,
    /// Output cost per million tokens (USD)
    pub output_cost_per_m: f64,
    /// Supports vision/images
    pub supports_vision: bool,
}

impl ModelSpec {
    /// Calculate cost for given token usage. Linear in each token count.
    pub fn calculate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        let input_cost = (input_tokens as f64 / 1_000_000.0) * self.input_cost_per_m;
        let output_cost = (output_tokens as f64 / 1_000_000.0) * self.output_cost_per_m;
        input_cost + output_cost
    }
}

/// Well-known models.
impl ModelSpec {
    pub fn claude_haiku() -> Self {
        Self {
            id: "claude-haiku".to_string(),
            name: "Claude Haiku".to_string(),
            provider: Provider::Anthropic,
            context_window: 200_000,
            max_output: 8192,
            input_cost_per_m: 0.25,
            output_cost_per_m: 1.25,
            supports_vision: false,
        }
    }

    pub fn claude_sonnet_4() -> Self {
        Self {
            id: "claude-sonnet-4".to_string(),
            name: "Claude Sonnet 4".to_string(),
            provider: Provider::Anthropic,
            context_window: 200_000,
            max_output: 8192,
            input_cost_per_m: 3.0,
            output_cost_per_m: 15.0,
            supports_vision: true,
        }
    }

    pub fn gpt4_turbo() -> Self {
        Self {
            id: "gpt-4-turbo".to_string(),
            name: "GPT-4 Turbo".to_string(),
            provider: Provider::OpenAI,
            context_window: 128_000,
            max_output: 4096,
            input_cost_per_m: 10.0,
            output_cost_per_m: 30.0,
            supports_vision: false,
        }
    }

    pub fn gpt4_vision() -> Self {
        Self {
            id: "gpt-4-vision".to_string(),
            name: "GPT-4 Vision".to_string(),
            provider: Provider::OpenAI,
            context_window: 128_000,
            max_output: 4096,
            input_cost_per_m: 10.0,
            output_cost_per_m: 30.0,
            supports_vision: true,
        }
    }

    /// Look up a known model by id.
    pub fn by_id(id: &str) -> Option<Self> {
        match id {
            "claude-haiku" => Some(Self::claude_haiku()),
            "claude-sonnet-4" => Some(Self::claude_sonnet_4()),
            "gpt-4-turbo" => Some(Self::gpt4_turbo()),
            "gpt-4-vision" => Some(Self::gpt4_vision()),
            _ => None,
        }
    }

    /// The provider that serves a known model id.
    pub fn provider_for(id: &str) -> Option<Provider> {
        Self::by_id(id).map(|m| m.provider)
    }
}

/// Role in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Completion request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model to use
    pub model: Option<String>,
    /// System prompt
    pub system: Option<String>,
    /// Conversation messages
    pub messages: Vec<ChatMessage>,
    /// Maximum tokens to generate
    pub max_tokens: Option<u32>,
    /// Temperature (0.0 - 1.0)
    pub temperature: Option<f64>,
    /// Metadata for tracking
    pub metadata: Option<HashMap<String, String>>,
}

impl CompletionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_message(mut self, message: ChatMessage) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 1.0));
        self
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
}

/// Completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Response ID
    pub id: String,
    /// Model used
    pub model: String,
    /// Generated content
    pub content: String,
    /// Stop reason
    pub stop_reason: Option<StopReason>,
    /// Token usage
    pub usage: TokenUsage,
    /// Response timestamp
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_cost_calculation() {
        let sonnet = ModelSpec::claude_sonnet_4();
        // 1M input + 500k output
        let cost = sonnet.calculate_cost(1_000_000, 500_000);
        // 1M * $3/M + 0.5M * $15/M = $3 + $7.5 = $10.5
        assert!((cost - 10.5).abs() < 0.01);
    }

    #[test]
    fn test_cost_is_linear_in_each_token_count() {
        let haiku = ModelSpec::claude_haiku();
        let a = haiku.calculate_cost(1_000, 0);
        let b = haiku.calculate_cost(2_000, 0);
        assert!((b - 2.0 * a).abs() < 1e-12);

        let c = haiku.calculate_cost(0, 3_000);
        let combined = haiku.calculate_cost(2_000, 3_000);
        assert!((combined - (b + c)).abs() < 1e-12);
    }

    #[test]
    fn test_model_lookup() {
        assert_eq!(
            ModelSpec::by_id("claude-haiku").unwrap().provider,
            Provider::Anthropic
        );
        assert_eq!(
            ModelSpec::by_id("gpt-4-turbo").unwrap().provider,
            Provider::OpenAI
        );
        assert!(ModelSpec::by_id("claude-opus").is_none());
    }

    #[test]
    fn test_completion_request_builder() {
        let req = CompletionRequest::new()
            .with_model("claude-haiku")
            .with_system("You are a graph extraction engine")
            .with_message(ChatMessage::user("Extract concepts"))
            .with_max_tokens(4096)
            .with_temperature(0.3);

        assert_eq!(req.model, Some("claude-haiku".to_string()));
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.temperature, Some(0.3));
    }
}
