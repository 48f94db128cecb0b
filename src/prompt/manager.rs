//! Prompt manager: template resolution, context injection, model
//! recommendation, and per-version performance stats.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;
use crate::llm::ModelSpec;
use crate::store::{stats_key, KeyValueStore};

use super::context::PromptContext;
use super::template::{PromptTemplate, PromptType, PromptVersion, TemplateRegistry};

/// Stats entries expire after 30 days without updates.
const STATS_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// A rendered prompt ready for an LLM call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltPrompt {
    pub system_prompt: String,
    pub user_prompt: String,
    pub metadata: PromptMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptMetadata {
    pub template_id: String,
    pub version: PromptVersion,
    pub context_keys: Vec<String>,
    pub estimated_tokens: u64,
    pub timestamp: DateTime<Utc>,
}

/// Model choice for a prompt type plus ordered fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecommendation {
    pub model: String,
    pub reason: String,
    pub estimated_cost: f64,
    pub fallbacks: Vec<String>,
}

/// Running aggregates for a (type, version) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptStats {
    pub total_uses: u64,
    /// Percentage in [0, 100].
    pub success_rate: f64,
    pub avg_quality_score: f64,
    pub avg_cost: f64,
    pub avg_retries: f64,
    pub last_updated: DateTime<Utc>,
}

impl Default for PromptStats {
    fn default() -> Self {
        Self {
            total_uses: 0,
            success_rate: 0.0,
            avg_quality_score: 0.0,
            avg_cost: 0.0,
            avg_retries: 0.0,
            last_updated: Utc::now(),
        }
    }
}

/// Outcome of a single orchestrated call against a template.
#[derive(Debug, Clone, Copy)]
pub struct PromptOutcome {
    pub success: bool,
    pub quality_score: f64,
    pub cost: f64,
    pub retries: u32,
}

/// Verdict for a template version based on its stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionVerdict {
    /// Healthy, keep in rotation
    Use,
    /// Not enough signal yet, keep experimenting
    Test,
    /// Performing badly, roll back
    Retire,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionScore {
    pub version: PromptVersion,
    pub stats: PromptStats,
    pub composite_score: f64,
    pub verdict: VersionVerdict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionComparison {
    pub versions: Vec<VersionScore>,
    pub best_version: Option<PromptVersion>,
}

/// Resolves templates, injects context, recommends models, and tracks
/// per-version outcomes.
pub struct PromptManager {
    registry: TemplateRegistry,
    store: Arc<dyn KeyValueStore>,
}

impl PromptManager {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            registry: TemplateRegistry::builtin(),
            store,
        }
    }

    pub fn with_registry(registry: TemplateRegistry, store: Arc<dyn KeyValueStore>) -> Self {
        Self { registry, store }
    }

    pub fn template(
        &self,
        prompt_type: PromptType,
        version: PromptVersion,
    ) -> Result<&PromptTemplate> {
        self.registry.get(prompt_type, version)
    }

    /// Build a prompt from a template and context.
    ///
    /// Fails when no template matches (type, version) or a required context
    /// key is absent. Template node-count constraints are injected into the
    /// context under `minNodes`/`maxNodes` unless the caller overrode them.
    pub fn build(
        &self,
        prompt_type: PromptType,
        context: &PromptContext,
        version: PromptVersion,
    ) -> Result<BuiltPrompt> {
        let template = self.registry.get(prompt_type, version)?;
        template.check_required(context)?;

        let mut effective = context.clone();
        if let Some(min) = template.constraints.min_nodes {
            if effective.lookup("minNodes").is_none() {
                effective.insert("minNodes", min as u64);
            }
        }
        if let Some(max) = template.constraints.max_nodes {
            if effective.lookup("maxNodes").is_none() {
                effective.insert("maxNodes", max as u64);
            }
        }

        let system_template = PromptTemplate {
            body: template.system_prompt.clone(),
            ..template.clone()
        };
        let system_prompt = system_template.render(&effective);
        let user_prompt = template.render(&effective);

        let estimated_tokens =
            ((system_prompt.len() + user_prompt.len()) as f64 / 4.0).ceil() as u64;

        Ok(BuiltPrompt {
            system_prompt,
            user_prompt,
            metadata: PromptMetadata {
                template_id: template.id(),
                version,
                context_keys: context.keys(),
                estimated_tokens,
                timestamp: Utc::now(),
            },
        })
    }

    /// Recommend a model for a prompt type given the context.
    ///
    /// Graph generation escalates to Sonnet for long documents; image work
    /// needs vision; everything else starts on Haiku.
    pub fn recommend_model(
        &self,
        prompt_type: PromptType,
        context: &PromptContext,
    ) -> ModelRecommendation {
        let document_len = context.get_str("documentText").map(str::len);

        let (model, reason, fallbacks): (ModelSpec, String, Vec<String>) = match prompt_type {
            PromptType::GraphGeneration if document_len.is_some_and(|l| l > 40_000) => (
                ModelSpec::claude_sonnet_4(),
                format!(
                    "document is {} chars; long-context extraction needs a stronger model",
                    document_len.unwrap_or(0)
                ),
                vec!["claude-haiku".into(), "gpt-4-turbo".into()],
            ),
            PromptType::GraphGeneration => (
                ModelSpec::claude_haiku(),
                "short document; fast model handles extraction".into(),
                vec!["claude-sonnet-4".into(), "gpt-4-turbo".into()],
            ),
            PromptType::ImageDescription => (
                ModelSpec::claude_sonnet_4(),
                "image description requires a vision-capable model".into(),
                vec!["gpt-4-turbo".into()],
            ),
            _ => (
                ModelSpec::claude_haiku(),
                "default fast model for text operations".into(),
                vec!["claude-sonnet-4".into(), "gpt-4-turbo".into()],
            ),
        };

        let estimated_cost = estimate_cost(&model, document_len);

        ModelRecommendation {
            model: model.id,
            reason,
            estimated_cost,
            fallbacks,
        }
    }

    /// Record the outcome of a call against a (type, version).
    ///
    /// Never fails: stats are advisory, store failures are logged and
    /// swallowed. Concurrent writers are last-writer-wins.
    pub async fn record_outcome(
        &self,
        prompt_type: PromptType,
        version: PromptVersion,
        outcome: PromptOutcome,
    ) {
        let key = stats_key(prompt_type.as_str(), version.as_str());

        let mut stats = match self.read_stats(&key).await {
            Ok(s) => s,
            Err(e) => {
                warn!(key, error = %e, "failed to read prompt stats, starting fresh");
                PromptStats::default()
            }
        };

        let n = stats.total_uses as f64;
        let new_n = n + 1.0;
        let success_pct = if outcome.success { 100.0 } else { 0.0 };
        stats.success_rate = (stats.success_rate * n + success_pct) / new_n;
        stats.avg_quality_score = (stats.avg_quality_score * n + outcome.quality_score) / new_n;
        stats.avg_cost = (stats.avg_cost * n + outcome.cost) / new_n;
        stats.avg_retries = (stats.avg_retries * n + outcome.retries as f64) / new_n;
        stats.total_uses += 1;
        stats.last_updated = Utc::now();

        let payload = match serde_json::to_string(&stats) {
            Ok(p) => p,
            Err(e) => {
                warn!(key, error = %e, "failed to serialize prompt stats");
                return;
            }
        };
        if let Err(e) = self.store.set_ex(&key, &payload, STATS_TTL).await {
            warn!(key, error = %e, "failed to persist prompt stats");
        }
    }

    /// Stats for a (type, version), zeroed for unseen keys.
    pub async fn stats(&self, prompt_type: PromptType, version: PromptVersion) -> PromptStats {
        let key = stats_key(prompt_type.as_str(), version.as_str());
        self.read_stats(&key).await.unwrap_or_default()
    }

    async fn read_stats(&self, key: &str) -> Result<PromptStats> {
        match self.store.get(key).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(PromptStats::default()),
        }
    }

    /// Compare every registered version of a prompt type.
    pub async fn compare_versions(&self, prompt_type: PromptType) -> VersionComparison {
        let mut versions = Vec::new();

        for version in self.registry.versions_of(prompt_type) {
            let stats = self.stats(prompt_type, version).await;
            let composite_score = composite_score(&stats);
            let verdict = verdict(&stats);
            versions.push(VersionScore {
                version,
                stats,
                composite_score,
                verdict,
            });
        }

        let best_version = versions
            .iter()
            .max_by(|a, b| {
                a.composite_score
                    .partial_cmp(&b.composite_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|v| v.version);

        VersionComparison {
            versions,
            best_version,
        }
    }
}

/// Composite quality score:
/// `0.4·successRate + 0.3·avgQuality + 0.2·costEfficiency + 0.1·reliability`.
fn composite_score(stats: &PromptStats) -> f64 {
    let cost_efficiency = ((1.0 - stats.avg_cost / 0.10) * 100.0).max(0.0);
    let reliability = ((2.0 - stats.avg_retries) * 100.0).max(0.0);
    0.4 * stats.success_rate
        + 0.3 * stats.avg_quality_score
        + 0.2 * cost_efficiency
        + 0.1 * reliability
}

fn verdict(stats: &PromptStats) -> VersionVerdict {
    if stats.total_uses < 10 {
        VersionVerdict::Test
    } else if stats.success_rate < 70.0 || stats.avg_quality_score < 60.0 {
        VersionVerdict::Retire
    } else if stats.success_rate >= 85.0 && stats.avg_quality_score >= 75.0 {
        VersionVerdict::Use
    } else {
        VersionVerdict::Test
    }
}

/// Pre-flight cost estimate: a 2:1 input:output split of the estimated token
/// count, floored at a per-model constant when the document text is absent
/// or trivially small.
fn estimate_cost(model: &ModelSpec, document_len: Option<usize>) -> f64 {
    let floor = match model.id.as_str() {
        "claude-sonnet-4" => 0.10,
        _ => 0.02,
    };

    match document_len {
        Some(len) => {
            let tokens = (len as f64 / 4.0).ceil();
            let input = tokens * 2.0 / 3.0;
            let output = tokens / 3.0;
            model
                .calculate_cost(input as u64, output as u64)
                .max(floor)
        }
        None => floor,
    }
}
