//! The graph assembly pipeline: chunk, generate per chunk, deduplicate,
//! validate, return.
//!
//! Chunk generation fans out over a semaphore-bounded set of orchestrator
//! calls. Progress flows through a watch channel: the producer overwrites the
//! latest value and never blocks on a slow consumer. If any chunk exhausts
//! its retries the pipeline degrades to a structural graph built from the
//! document's headings rather than failing the whole job.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::orchestrator::{ExecuteRequest, Orchestrator, OrchestratorConfig};
use crate::prompt::{PromptContext, PromptType};

use super::chunker::Chunker;
use super::dedup::{DedupConfig, Deduplicator};
use super::types::{GraphData, GraphEdge, GraphNode};
use super::validator::{generate_mermaid, GraphValidator, GraphValidatorConfig};

/// Pipeline stage, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStage {
    Estimating,
    Chunking,
    Generating,
    Merging,
    Validating,
    Saving,
}

/// A progress snapshot; latest value wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationProgress {
    pub stage: GenerationStage,
    pub percentage: f64,
    pub message: String,
    pub chunks_processed: Option<usize>,
    pub total_chunks: Option<usize>,
}

impl GenerationProgress {
    fn new(stage: GenerationStage, percentage: f64, message: impl Into<String>) -> Self {
        Self {
            stage,
            percentage,
            message: message.into(),
            chunks_processed: None,
            total_chunks: None,
        }
    }
}

/// Create a progress channel seeded at the start of the pipeline.
pub fn progress_channel() -> (
    watch::Sender<GenerationProgress>,
    watch::Receiver<GenerationProgress>,
) {
    watch::channel(GenerationProgress::new(
        GenerationStage::Estimating,
        0.0,
        "starting",
    ))
}

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub max_parallel_chunks: usize,
    pub min_nodes: usize,
    pub max_nodes: usize,
    pub dedup: DedupConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            chunk_size: 12_000,
            chunk_overlap: 1_000,
            max_parallel_chunks: 4,
            min_nodes: 7,
            max_nodes: 15,
            dedup: DedupConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

/// Inputs for one pipeline run.
pub struct GenerateParams {
    pub document_text: String,
    pub document_title: String,
    pub user_id: Option<String>,
    pub document_id: Option<String>,
    pub progress: Option<watch::Sender<GenerationProgress>>,
    pub cancel: Option<CancellationToken>,
}

impl GenerateParams {
    pub fn new(document_text: impl Into<String>, document_title: impl Into<String>) -> Self {
        Self {
            document_text: document_text.into(),
            document_title: document_title.into(),
            user_id: None,
            document_id: None,
            progress: None,
            cancel: None,
        }
    }
}

/// Composes the chunker, orchestrator, deduplicator, and graph validator.
pub struct GraphGenerator {
    orchestrator: Arc<Orchestrator>,
    config: GeneratorConfig,
}

impl GraphGenerator {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            config: GeneratorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: GeneratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Run the whole pipeline for one document.
    pub async fn generate(&self, params: GenerateParams) -> Result<GraphData> {
        if params.document_text.trim().is_empty() {
            return Err(Error::Config("document text is empty".into()));
        }

        report(
            &params.progress,
            GenerationProgress::new(GenerationStage::Estimating, 2.0, "estimating document size"),
        );

        let chunker = Chunker::new(self.config.chunk_size, self.config.chunk_overlap);
        let chunks = chunker.chunk(&params.document_text);
        let total_chunks = chunks.len();
        report(
            &params.progress,
            GenerationProgress {
                chunks_processed: Some(0),
                total_chunks: Some(total_chunks),
                ..GenerationProgress::new(
                    GenerationStage::Chunking,
                    7.0,
                    format!("split into {total_chunks} chunk(s)"),
                )
            },
        );

        // Fan out per-chunk generation, bounded by the semaphore; results
        // come back in chunk order.
        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel_chunks.max(1)));
        let processed = Arc::new(AtomicUsize::new(0));

        let futures = chunks.iter().map(|chunk| {
            let orchestrator = self.orchestrator.clone();
            let semaphore = semaphore.clone();
            let processed = processed.clone();
            let progress = params.progress.clone();
            let context = PromptContext::new()
                .with("documentText", chunk.text.clone())
                .with("documentTitle", params.document_title.clone())
                .with("minNodes", self.config.min_nodes as u64)
                .with("maxNodes", self.config.max_nodes as u64);
            let mut request = ExecuteRequest::new(PromptType::GraphGeneration, context)
                .with_config(self.config.orchestrator.clone());
            request.user_id = params.user_id.clone();
            request.document_id = params.document_id.clone();
            request.cancel = params.cancel.clone();
            let index = chunk.index;

            async move {
                let _permit = semaphore.acquire().await;
                let result = orchestrator.execute(&request).await;

                let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
                report(
                    &progress,
                    GenerationProgress {
                        chunks_processed: Some(done),
                        total_chunks: Some(total_chunks),
                        ..GenerationProgress::new(
                            GenerationStage::Generating,
                            10.0 + 60.0 * done as f64 / total_chunks.max(1) as f64,
                            format!("generated chunk {index}"),
                        )
                    },
                );
                (index, result)
            }
        });

        let mut all_nodes: Vec<GraphNode> = Vec::new();
        let mut all_edges: Vec<GraphEdge> = Vec::new();

        for (index, result) in join_all(futures).await {
            match result {
                Ok(response) => {
                    match serde_json::from_value::<GraphData>(response.data.clone()) {
                        Ok(chunk_graph) => {
                            let (nodes, edges) = prefix_chunk_ids(chunk_graph, index);
                            all_nodes.extend(nodes);
                            all_edges.extend(edges);
                        }
                        Err(e) => {
                            // Shaped like a graph for the validator but not
                            // for the data model: same as an exhausted chunk.
                            warn!(chunk = index, error = %e, "chunk output did not deserialize");
                            info!("falling back to structural graph from headings");
                            return Ok(self.fallback_graph(&params));
                        }
                    }
                }
                Err(Error::ValidationExhausted { attempts, .. }) => {
                    warn!(chunk = index, attempts, "chunk exhausted retries");
                    info!("falling back to structural graph from headings");
                    return Ok(self.fallback_graph(&params));
                }
                Err(other) => return Err(other),
            }
        }

        report(
            &params.progress,
            GenerationProgress::new(GenerationStage::Merging, 75.0, "deduplicating nodes"),
        );

        let dedup_result = Deduplicator::new(self.config.dedup).deduplicate(&all_nodes)?;
        let merged_edges = dedup_result.rewrite_edges(&all_edges);
        info!(
            original = dedup_result.statistics.original_count,
            merged = dedup_result.statistics.merged_count,
            "deduplication complete"
        );

        report(
            &params.progress,
            GenerationProgress::new(GenerationStage::Validating, 90.0, "validating graph"),
        );

        let mut graph = GraphData::new(dedup_result.deduplicated_nodes, merged_edges);
        let validator = GraphValidator::new(GraphValidatorConfig {
            min_nodes: self.config.min_nodes,
            max_nodes: self.config.max_nodes,
            auto_fix: true,
            remove_isolated_nodes: false,
        });
        let validation = validator.validate(&graph)?;
        if let Some(fixed) = validation.fixed_graph {
            graph = fixed;
        }

        if graph.mermaid_code.is_none() {
            graph.mermaid_code = Some(generate_mermaid(&graph));
        }

        report(
            &params.progress,
            GenerationProgress::new(GenerationStage::Saving, 97.0, "assembling result"),
        );

        let mut metadata = graph.metadata.take().unwrap_or_default();
        metadata.insert("documentTitle".into(), json!(params.document_title));
        metadata.insert("chunkCount".into(), json!(total_chunks));
        metadata.insert("degraded".into(), json!(false));
        metadata.insert(
            "mergedNodes".into(),
            json!(dedup_result.statistics.merged_count),
        );
        graph.metadata = Some(metadata);

        report(
            &params.progress,
            GenerationProgress::new(GenerationStage::Saving, 100.0, "done"),
        );

        Ok(graph)
    }

    /// Structural-only fallback: one node per heading, linked from a root
    /// node for the document itself.
    fn fallback_graph(&self, params: &GenerateParams) -> GraphData {
        let mut nodes = vec![GraphNode::new("doc", params.document_title.clone())
            .with_node_type("CONCEPT")];
        let mut edges = Vec::new();

        for (i, heading) in headings(&params.document_text).into_iter().enumerate() {
            let id = format!("h{i}");
            nodes.push(GraphNode::new(&id, heading).with_node_type("CONCEPT"));
            edges.push(GraphEdge::new("doc", id, "contains"));
        }

        let mut graph = GraphData::new(nodes, edges);
        graph.mermaid_code = Some(generate_mermaid(&graph));
        let mut metadata = std::collections::HashMap::new();
        metadata.insert("documentTitle".into(), json!(params.document_title));
        metadata.insert("degraded".into(), json!(true));
        graph.metadata = Some(metadata);
        graph
    }
}

fn report(
    progress: &Option<watch::Sender<GenerationProgress>>,
    update: GenerationProgress,
) {
    if let Some(sender) = progress {
        // watch() overwrites: a slow consumer only sees the latest value.
        let _ = sender.send(update);
    }
}

/// Prefix node ids with the chunk index so ids from different chunks cannot
/// collide before deduplication.
fn prefix_chunk_ids(graph: GraphData, chunk_index: usize) -> (Vec<GraphNode>, Vec<GraphEdge>) {
    let nodes = graph
        .nodes
        .into_iter()
        .map(|mut n| {
            n.id = format!("{chunk_index}_{}", n.id);
            if n.source_references.is_empty() {
                n.source_references = vec![format!("chunk:{chunk_index}")];
            }
            n
        })
        .collect();
    let edges = graph
        .edges
        .into_iter()
        .map(|mut e| {
            e.from = format!("{chunk_index}_{}", e.from);
            e.to = format!("{chunk_index}_{}", e.to);
            e
        })
        .collect();
    (nodes, edges)
}

/// Markdown-style headings and short label lines, used for the degraded
/// fallback graph.
fn headings(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if let Some(stripped) = trimmed.strip_prefix('#') {
                let title = stripped.trim_start_matches('#').trim();
                (!title.is_empty()).then(|| title.to_string())
            } else if trimmed.len() > 2 && trimmed.len() <= 60 && trimmed.ends_with(':') {
                Some(trimmed.trim_end_matches(':').to_string())
            } else {
                None
            }
        })
        .collect()
}
