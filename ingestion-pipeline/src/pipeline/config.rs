use crate::resolver::{DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_TOP_K_CANDIDATES};

/// Knobs governing retries, resolver candidate lookup, and cross-source
/// parallelism. Item-internal stages always run sequentially because each
/// depends on the previous one's output.
#[derive(Debug, Clone)]
pub struct IngestionTuning {
    pub graph_store_attempts: usize,
    pub graph_initial_backoff_ms: u64,
    pub graph_max_backoff_ms: u64,
    /// How many sources may ingest concurrently. Items within one source
    /// are strictly ordered.
    pub source_concurrency: usize,
    pub similarity_threshold: f32,
    pub top_k_candidates: usize,
    pub chunk_min_tokens: usize,
    pub chunk_max_tokens: usize,
}

impl Default for IngestionTuning {
    fn default() -> Self {
        Self {
            graph_store_attempts: 3,
            graph_initial_backoff_ms: 50,
            graph_max_backoff_ms: 800,
            source_concurrency: 2,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            top_k_candidates: DEFAULT_TOP_K_CANDIDATES,
            chunk_min_tokens: 500,
            chunk_max_tokens: 2_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestionConfig {
    pub tuning: IngestionTuning,
}
