//! Error types for graphex-core.

use thiserror::Error;

/// Result type alias using graphex-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during orchestration.
#[derive(Error, Debug)]
pub enum Error {
    /// Operation would exceed a budget limit
    #[error("Budget exceeded ({reason}): limit ${limit:.2} reached")]
    BudgetExceeded {
        reason: String,
        limit: f64,
        reset_at: Option<chrono::DateTime<chrono::Utc>>,
    },

    /// Validation still failing after exhausting retries
    #[error("Unable to produce a valid result after {attempts} attempts")]
    ValidationExhausted {
        attempts: u32,
        feedback: Vec<String>,
        scores: Vec<f64>,
    },

    /// Malformed JSON in LLM output
    #[error("Failed to parse LLM output: {0}")]
    Parse(String),

    /// Provider rate limit hit
    #[error("Rate limit exceeded for {provider}, retry in {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    /// LLM call exceeded the configured timeout
    #[error("LLM call timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Model unavailable at the provider
    #[error("Model {model} unavailable: {message}")]
    ModelUnavailable {
        model: String,
        message: String,
        retryable: bool,
    },

    /// Missing template or required context key
    #[error("Prompt template error: {0}")]
    PromptTemplate(String),

    /// Counter store or ledger unreachable; callers must fail closed
    #[error("Cost tracking error: {0}")]
    CostTracking(String),

    /// Unknown model passed to cost calculation
    #[error("Cannot calculate cost for unknown model: {0}")]
    CostCalculation(String),

    /// Cache store failure (logged and swallowed at call sites)
    #[error("Cache error: {0}")]
    Cache(String),

    /// Graph is structurally broken beyond auto-fix
    #[error("Invalid graph structure: {0}")]
    InvalidGraphStructure(String),

    /// Deduplication preconditions violated
    #[error("Deduplication failed: {0}")]
    DeduplicationFailed(String),

    /// Auto-fix could not converge on a valid graph
    #[error("Auto-fix failed: {0}")]
    AutoFixFailed(String),

    /// Job submission rejected because the worker queue is full
    #[error("Job queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// Generic LLM API error
    #[error("LLM API error: {provider} - {message}")]
    LlmApi { provider: String, message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an LLM API error.
    pub fn llm_api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmApi {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a budget exceeded error.
    pub fn budget_exceeded(
        reason: impl Into<String>,
        limit: f64,
        reset_at: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Self {
        Self::BudgetExceeded {
            reason: reason.into(),
            limit,
            reset_at,
        }
    }

    /// Whether the orchestrator retry loop may catch this error and try again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Parse(_) | Self::RateLimited { .. } | Self::Timeout { .. } => true,
            Self::ModelUnavailable { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Short machine-readable code for the ledger and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::BudgetExceeded { .. } => "BUDGET_EXCEEDED",
            Self::ValidationExhausted { .. } => "AI_VALIDATION_FAILED",
            Self::Parse(_) => "PARSE_ERROR",
            Self::RateLimited { .. } => "RATE_LIMIT_EXCEEDED",
            Self::Timeout { .. } => "AI_TIMEOUT",
            Self::ModelUnavailable { .. } => "MODEL_UNAVAILABLE",
            Self::PromptTemplate(_) => "PROMPT_TEMPLATE_ERROR",
            Self::CostTracking(_) => "COST_TRACKING_ERROR",
            Self::CostCalculation(_) => "COST_CALCULATION_ERROR",
            Self::Cache(_) => "CACHE_ERROR",
            Self::InvalidGraphStructure(_) => "INVALID_GRAPH_STRUCTURE",
            Self::DeduplicationFailed(_) => "DEDUPLICATION_FAILED",
            Self::AutoFixFailed(_) => "AUTO_FIX_FAILED",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::LlmApi { .. } => "LLM_API_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(Error::Parse("bad json".into()).is_retryable());
        assert!(Error::RateLimited {
            provider: "anthropic".into(),
            retry_after_ms: 100,
        }
        .is_retryable());
        assert!(Error::timeout(30_000).is_retryable());
        assert!(Error::ModelUnavailable {
            model: "claude-haiku".into(),
            message: "overloaded".into(),
            retryable: true,
        }
        .is_retryable());

        assert!(!Error::ModelUnavailable {
            model: "claude-haiku".into(),
            message: "decommissioned".into(),
            retryable: false,
        }
        .is_retryable());
        assert!(!Error::budget_exceeded("daily-limit-exceeded", 10.0, None).is_retryable());
        assert!(!Error::PromptTemplate("missing key".into()).is_retryable());
        assert!(!Error::CostTracking("redis down".into()).is_retryable());
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            Error::budget_exceeded("daily-limit-exceeded", 10.0, None).code(),
            "BUDGET_EXCEEDED"
        );
        assert_eq!(Error::Parse("x".into()).code(), "PARSE_ERROR");
        assert_eq!(
            Error::DeduplicationFailed("empty".into()).code(),
            "DEDUPLICATION_FAILED"
        );
    }
}
