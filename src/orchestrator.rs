//! The orchestration loop for a single LLM invocation.
//!
//! Pipeline per call: budget check, cache lookup, prompt build, model
//! selection, LLM call, parse + validate, then cache write and usage
//! recording. Failures drive an explicit retry state machine: validation
//! failures feed fix strings back into the prompt and may escalate the model;
//! rate limits and timeouts back off exponentially; unavailable models
//! cascade through the recommendation's fallback list.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cost::{BudgetCheckRequest, CostTracker, UsageRecord};
use crate::error::{Error, Result};
use crate::llm::{ChatMessage, CompletionRequest, MultiProviderClient, TokenUsage};
use crate::prompt::{
    BuiltPrompt, PromptContext, PromptManager, PromptOutcome, PromptType, PromptVersion,
};
use crate::store::{result_key, KeyValueStore};
use crate::validate::{normalize_text, OutputValidator, ValidationOptions};

/// Ceiling for exponential backoff between retries.
const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Per-call configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum attempts per call.
    pub max_retries: u32,
    /// Minimum accepted validation score.
    pub quality_threshold: f64,
    /// Per-LLM-call timeout.
    pub timeout_ms: u64,
    pub prompt_version: PromptVersion,
    /// Overrides model selection when set.
    pub preferred_model: Option<String>,
    pub cache_ttl_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            quality_threshold: 60.0,
            timeout_ms: 30_000,
            prompt_version: PromptVersion::Production,
            preferred_model: None,
            cache_ttl_secs: 3600,
        }
    }
}

/// A typed request for one orchestrated call.
#[derive(Debug, Clone)]
pub struct ExecuteRequest {
    pub prompt_type: PromptType,
    pub context: PromptContext,
    pub user_id: Option<String>,
    pub document_id: Option<String>,
    pub config: OrchestratorConfig,
    /// Cancellation from the enclosing job; a cancelled call stops issuing
    /// LLM requests and skips cache writes.
    pub cancel: Option<CancellationToken>,
}

impl ExecuteRequest {
    pub fn new(prompt_type: PromptType, context: PromptContext) -> Self {
        Self {
            prompt_type,
            context,
            user_id: None,
            document_id: None,
            config: OrchestratorConfig::default(),
            cancel: None,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Response metadata for observability and billing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMeta {
    pub attempts: u32,
    pub tokens_used: TokenUsage,
    pub cost: f64,
    pub cached: bool,
    pub processing_time_ms: u64,
    pub validation_passed: bool,
    pub prompt_version: PromptVersion,
    pub model: String,
    pub timestamp: DateTime<Utc>,
}

/// A validated, parsed orchestrator response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub data: Value,
    pub model: String,
    pub quality: f64,
    pub metadata: ResponseMeta,
}

/// Cached successful result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResult {
    pub data: Value,
    pub cached_at: DateTime<Utc>,
    pub quality_score: f64,
    pub model: String,
}

/// Composes the LLM client, prompt manager, validator, cost tracker, and
/// result cache into the retry/fallback loop.
pub struct Orchestrator {
    llm: Arc<MultiProviderClient>,
    prompts: Arc<PromptManager>,
    validator: OutputValidator,
    cost: Arc<CostTracker>,
    store: Arc<dyn KeyValueStore>,
}

impl Orchestrator {
    pub fn new(
        llm: Arc<MultiProviderClient>,
        prompts: Arc<PromptManager>,
        cost: Arc<CostTracker>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self {
            llm,
            prompts,
            validator: OutputValidator::new(),
            cost,
            store,
        }
    }

    pub fn prompt_manager(&self) -> &Arc<PromptManager> {
        &self.prompts
    }

    pub fn cost_tracker(&self) -> &Arc<CostTracker> {
        &self.cost
    }

    /// Run one orchestrated call.
    pub async fn execute(&self, request: &ExecuteRequest) -> Result<ExecuteResponse> {
        let started = Instant::now();
        let config = &request.config;

        let recommendation = self
            .prompts
            .recommend_model(request.prompt_type, &request.context);
        let primary_model = config
            .preferred_model
            .clone()
            .unwrap_or_else(|| recommendation.model.clone());

        // 1. Budget gate. Denial is terminal: no LLM call, no usage record.
        let decision = self
            .cost
            .check_budget(&BudgetCheckRequest {
                user_id: request.user_id.clone(),
                operation: Some(request.prompt_type),
                document_id: request.document_id.clone(),
                estimated_cost: Some(recommendation.estimated_cost),
            })
            .await?;
        if !decision.allowed {
            let limits = self.cost.limits();
            let (reason, limit) = match decision.reason {
                Some(r) => (
                    r.as_str().to_string(),
                    match r {
                        crate::cost::DenialReason::DocumentLimitExceeded => limits.per_document,
                        crate::cost::DenialReason::DailyLimitExceeded => limits.per_user_per_day,
                        crate::cost::DenialReason::MonthlyLimitExceeded => {
                            limits.per_user_per_month
                        }
                    },
                ),
                None => ("budget".to_string(), 0.0),
            };
            info!(
                prompt_type = %request.prompt_type,
                reason, "budget check denied operation"
            );
            return Err(Error::budget_exceeded(reason, limit, decision.reset_at));
        }

        // 2. Cache lookup, first attempt only. Read failures degrade to miss.
        let cache_key = result_key(&cache_hash(
            request.prompt_type,
            &request.context,
            &primary_model,
            config.prompt_version,
        ));
        match self.store.get(&cache_key).await {
            Ok(Some(raw)) => {
                if let Ok(cached) = serde_json::from_str::<CachedResult>(&raw) {
                    debug!(key = %cache_key, "cache hit");
                    return Ok(ExecuteResponse {
                        data: cached.data,
                        model: cached.model.clone(),
                        quality: cached.quality_score,
                        metadata: ResponseMeta {
                            attempts: 1,
                            tokens_used: TokenUsage::default(),
                            cost: 0.0,
                            cached: true,
                            processing_time_ms: started.elapsed().as_millis() as u64,
                            validation_passed: true,
                            prompt_version: config.prompt_version,
                            model: cached.model,
                            timestamp: Utc::now(),
                        },
                    });
                }
            }
            Ok(None) => {}
            Err(e) => warn!(key = %cache_key, error = %e, "cache read failed, treating as miss"),
        }

        // 3. Prompt build. Missing template or context keys are caller bugs.
        let built = self
            .prompts
            .build(request.prompt_type, &request.context, config.prompt_version)?;

        self.run_attempts(
            request,
            built,
            primary_model,
            recommendation.fallbacks,
            cache_key,
            started,
        )
        .await
    }

    /// The retry state machine (steps 4–8).
    async fn run_attempts(
        &self,
        request: &ExecuteRequest,
        built: BuiltPrompt,
        primary_model: String,
        fallbacks: Vec<String>,
        cache_key: String,
        started: Instant,
    ) -> Result<ExecuteResponse> {
        let config = &request.config;
        let mut attempt: u32 = 1;
        let mut current_model = primary_model;
        let mut feedback: Vec<String> = Vec::new();
        let mut scores: Vec<f64> = Vec::new();
        let mut fallback_cursor = 0usize;
        let mut responses_seen = 0u32;
        let mut last_usage = TokenUsage::default();
        let mut total_cost = 0.0f64;

        let defaults = ValidationOptions::default();
        let validation_options = ValidationOptions {
            threshold: config.quality_threshold,
            source_document: request
                .context
                .get_str("documentText")
                .map(str::to_string),
            min_nodes: context_usize(&request.context, "minNodes").unwrap_or(defaults.min_nodes),
            max_nodes: context_usize(&request.context, "maxNodes").unwrap_or(defaults.max_nodes),
            mode: defaults.mode,
        };

        loop {
            if request
                .cancel
                .as_ref()
                .is_some_and(|token| token.is_cancelled())
            {
                self.record_terminal_failure(request, &current_model, attempt, responses_seen)
                    .await;
                return Err(Error::Internal("call cancelled".into()));
            }

            let user_prompt = if feedback.is_empty() {
                built.user_prompt.clone()
            } else {
                format!(
                    "{}\n\nPrevious attempt had issues:\n{}",
                    built.user_prompt,
                    feedback.join("\n")
                )
            };

            let completion_request = CompletionRequest::new()
                .with_model(current_model.clone())
                .with_system(built.system_prompt.clone())
                .with_message(ChatMessage::user(user_prompt))
                .with_max_tokens(4096);

            let outcome = self
                .call_llm(completion_request, config.timeout_ms, request.cancel.as_ref())
                .await;

            match outcome {
                Ok(response) => {
                    responses_seen += 1;
                    last_usage = response.usage;
                    let call_cost = self
                        .cost
                        .calculate_cost(
                            response.usage.input_tokens,
                            response.usage.output_tokens,
                            &current_model,
                        )
                        .unwrap_or(0.0);
                    total_cost += call_cost;

                    let report = self.validator.validate(
                        &response.content,
                        request.prompt_type,
                        &validation_options,
                    );
                    scores.push(report.score);

                    let passed = report.passed && report.score >= config.quality_threshold;

                    // One usage record per LLM invocation, success or not.
                    let record = self.usage_record(
                        request,
                        &current_model,
                        response.usage,
                        call_cost,
                        Some(report.score),
                        attempt,
                        passed,
                    );
                    if let Err(e) = self.cost.record_usage(&record).await {
                        // The ledger is authoritative; a failed append after a
                        // paid call still must surface.
                        return Err(e);
                    }

                    if passed {
                        let data = parse_output(&response.content)?;

                        if request
                            .cancel
                            .as_ref()
                            .is_some_and(|token| token.is_cancelled())
                        {
                            return Err(Error::Internal("call cancelled".into()));
                        }

                        self.write_cache(&cache_key, &data, report.score, &current_model, config)
                            .await;
                        self.prompts
                            .record_outcome(
                                request.prompt_type,
                                config.prompt_version,
                                PromptOutcome {
                                    success: true,
                                    quality_score: report.score,
                                    cost: total_cost,
                                    retries: attempt - 1,
                                },
                            )
                            .await;

                        info!(
                            prompt_type = %request.prompt_type,
                            model = %current_model,
                            attempts = attempt,
                            score = report.score,
                            "orchestrated call succeeded"
                        );

                        return Ok(ExecuteResponse {
                            data,
                            model: current_model.clone(),
                            quality: report.score,
                            metadata: ResponseMeta {
                                attempts: attempt,
                                tokens_used: last_usage,
                                cost: total_cost,
                                cached: false,
                                processing_time_ms: started.elapsed().as_millis() as u64,
                                validation_passed: true,
                                prompt_version: config.prompt_version,
                                model: current_model,
                                timestamp: Utc::now(),
                            },
                        });
                    }

                    // Validation failed: feed fixes back, maybe escalate.
                    let fixes = report.fixes(3);
                    debug!(
                        attempt,
                        score = report.score,
                        model = %current_model,
                        "validation failed: {}",
                        fixes.join("; ")
                    );
                    feedback.extend(fixes);

                    if attempt >= config.max_retries {
                        break;
                    }
                    if attempt == 2 && current_model == "claude-haiku" {
                        // Quality-recovery escalation after two weak outputs.
                        current_model = "claude-sonnet-4".to_string();
                    }
                    attempt += 1;
                }
                Err(err) => {
                    if attempt >= config.max_retries {
                        self.record_terminal_failure(
                            request,
                            &current_model,
                            attempt,
                            responses_seen,
                        )
                        .await;
                        return Err(err);
                    }

                    match &err {
                        Error::RateLimited { retry_after_ms, .. } => {
                            let delay = if *retry_after_ms > 0 {
                                Duration::from_millis(*retry_after_ms)
                            } else {
                                backoff(attempt)
                            };
                            tokio::time::sleep(delay).await;
                        }
                        Error::Timeout { .. } => {
                            tokio::time::sleep(backoff(attempt)).await;
                        }
                        // An unavailable model always cascades to the next
                        // fallback; the retryable flag only controls backoff.
                        Error::ModelUnavailable { retryable, .. } => {
                            match fallbacks.get(fallback_cursor) {
                                Some(next) => {
                                    warn!(
                                        from = %current_model,
                                        to = %next,
                                        "model unavailable, cascading to fallback"
                                    );
                                    current_model = next.clone();
                                    fallback_cursor += 1;
                                }
                                None => {
                                    self.record_terminal_failure(
                                        request,
                                        &current_model,
                                        attempt,
                                        responses_seen,
                                    )
                                    .await;
                                    return Err(err);
                                }
                            }
                            if *retryable {
                                tokio::time::sleep(backoff(attempt)).await;
                            }
                        }
                        Error::Parse(_) => {
                            feedback.push(
                                "Return strict JSON matching the requested schema, with no \
                                 surrounding prose."
                                    .to_string(),
                            );
                        }
                        // Everything else is non-retryable: abort.
                        _ => {
                            self.record_terminal_failure(
                                request,
                                &current_model,
                                attempt,
                                responses_seen,
                            )
                            .await;
                            return Err(err);
                        }
                    }

                    attempt += 1;
                }
            }
        }

        // Validation exhausted.
        self.prompts
            .record_outcome(
                request.prompt_type,
                config.prompt_version,
                PromptOutcome {
                    success: false,
                    quality_score: scores.last().copied().unwrap_or(0.0),
                    cost: total_cost,
                    retries: attempt - 1,
                },
            )
            .await;

        warn!(
            prompt_type = %request.prompt_type,
            attempts = attempt,
            "validation exhausted after {} attempts",
            attempt
        );
        Err(Error::ValidationExhausted {
            attempts: attempt,
            feedback,
            scores,
        })
    }

    /// Issue the LLM call under the per-call timeout and cancellation.
    async fn call_llm(
        &self,
        request: CompletionRequest,
        timeout_ms: u64,
        cancel: Option<&CancellationToken>,
    ) -> Result<crate::llm::CompletionResponse> {
        let call = self.llm.complete(request);
        let timed = tokio::time::timeout(Duration::from_millis(timeout_ms), call);

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => Err(Error::Internal("call cancelled".into())),
                    result = timed => match result {
                        Ok(inner) => inner,
                        Err(_) => Err(Error::timeout(timeout_ms)),
                    },
                }
            }
            None => match timed.await {
                Ok(inner) => inner,
                Err(_) => Err(Error::timeout(timeout_ms)),
            },
        }
    }

    fn usage_record(
        &self,
        request: &ExecuteRequest,
        model: &str,
        usage: TokenUsage,
        cost: f64,
        quality_score: Option<f64>,
        attempts: u32,
        success: bool,
    ) -> UsageRecord {
        UsageRecord {
            user_id: request.user_id.clone(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cost,
            quality_score,
            attempts,
            success,
            document_id: request.document_id.clone(),
            ..UsageRecord::new(request.prompt_type.as_str(), model)
        }
    }

    /// Terminal failure where no LLM response was ever received: append one
    /// zero-token failure record so the ledger shows the attempt.
    async fn record_terminal_failure(
        &self,
        request: &ExecuteRequest,
        model: &str,
        attempts: u32,
        responses_seen: u32,
    ) {
        if responses_seen > 0 {
            return;
        }
        let record = self.usage_record(
            request,
            model,
            TokenUsage::default(),
            0.0,
            None,
            attempts,
            false,
        );
        if let Err(e) = self.cost.record_usage(&record).await {
            warn!(error = %e, "failed to record terminal failure usage");
        }
    }

    /// Cache successful results with set-if-absent semantics. Failures are
    /// logged and swallowed: a cache miss is acceptable.
    async fn write_cache(
        &self,
        key: &str,
        data: &Value,
        quality_score: f64,
        model: &str,
        config: &OrchestratorConfig,
    ) {
        let cached = CachedResult {
            data: data.clone(),
            cached_at: Utc::now(),
            quality_score,
            model: model.to_string(),
        };
        let payload = match serde_json::to_string(&cached) {
            Ok(p) => p,
            Err(e) => {
                warn!(key, error = %e, "failed to serialize cached result");
                return;
            }
        };
        if let Err(e) = self
            .store
            .set_nx_ex(key, &payload, Duration::from_secs(config.cache_ttl_secs))
            .await
        {
            warn!(key, error = %e, "cache write failed");
        }
    }
}

/// Parse the JSON object out of raw LLM output.
pub fn parse_output(output: &str) -> Result<Value> {
    let trimmed = output.trim();
    if let Ok(v) = serde_json::from_str(trimmed) {
        return Ok(v);
    }
    let start = trimmed
        .find('{')
        .ok_or_else(|| Error::Parse("no JSON object in output".into()))?;
    let end = trimmed
        .rfind('}')
        .filter(|&e| e > start)
        .ok_or_else(|| Error::Parse("unterminated JSON object in output".into()))?;
    serde_json::from_str(&trimmed[start..=end]).map_err(|e| Error::Parse(e.to_string()))
}

fn context_usize(context: &PromptContext, key: &str) -> Option<usize> {
    context.lookup(key).and_then(|v| v.as_u64()).map(|v| v as usize)
}

/// Exponential backoff: `min(1s · 2^(n-1), 8s)`.
fn backoff(attempt: u32) -> Duration {
    let secs = 1u64
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(MAX_BACKOFF)
}

/// Stable cache key: SHA-256 over canonical JSON of (type, normalized
/// context, model, version).
pub fn cache_hash(
    prompt_type: PromptType,
    context: &PromptContext,
    model: &str,
    version: PromptVersion,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt_type.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(canonical_context(context).as_bytes());
    hasher.update(b"\x1f");
    hasher.update(model.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(version.as_str().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Canonical JSON of the context: sorted keys, compact separators, trimmed
/// and whitespace-collapsed strings. Values under keys ending in `title`
/// (case-insensitive) are lowercased; body text stays byte-exact so distinct
/// documents never collide.
fn canonical_context(context: &PromptContext) -> String {
    let mut out = String::from("{");
    for (i, (key, value)) in context.as_map().iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&serde_json::to_string(key).unwrap_or_default());
        out.push(':');
        write_canonical(&mut out, value, key);
    }
    out.push('}');
    out
}

fn write_canonical(out: &mut String, value: &Value, key_hint: &str) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(out, &map[*key], key);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(out, item, key_hint);
            }
            out.push(']');
        }
        Value::String(s) => {
            let collapsed = collapse_ws(s);
            let normalized = if key_hint.to_lowercase().ends_with("title") {
                normalize_text(&collapsed)
            } else {
                collapsed
            };
            out.push_str(&serde_json::to_string(&normalized).unwrap_or_default());
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Trim and collapse runs of whitespace without changing case.
fn collapse_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
