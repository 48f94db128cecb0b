//! Knowledge graph assembly: chunking, deduplication, validation, and the
//! generation pipeline.

mod chunker;
mod dedup;
mod generator;
mod types;
mod validator;

pub use chunker::{Chunk, Chunker};
pub use dedup::{
    DedupConfig, DedupResult, DedupStatistics, Deduplicator, MergesByPhase, UnionFind,
};
pub use generator::{
    progress_channel, GenerateParams, GenerationProgress, GenerationStage, GeneratorConfig,
    GraphGenerator,
};
pub use types::{GraphData, GraphEdge, GraphNode, NODE_TYPES};
pub use validator::{
    generate_mermaid, GraphStatistics, GraphValidationReport, GraphValidator,
    GraphValidatorConfig,
};
