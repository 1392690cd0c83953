#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

//! Library surface over the knowledge-graph engine: one handle that owns
//! the store connection, the ingestion orchestrator, and the search
//! manager, with process-wide usage accounting across both.

use std::sync::Arc;

use common::{
    config::AppConfig,
    error::GraphRagError,
    graph::DeletionCounters,
    storage::db::SurrealDbClient,
    usage::{UsageAccumulator, UsageTotals},
    utils::{
        embedding::{Embedder, OpenAiEmbedder},
        llm::LlmAgent,
    },
};
use ingestion_pipeline::{
    DefaultPipelineServices, IngestResult, IngestionConfig, IngestionOrchestrator, IngestionTuning,
    PipelineServices, SourceInput,
};
use retrieval_pipeline::{CombinedSearchResults, SearchConfig, SearchManager};

/// Handle over the whole system. Cheap to share behind an `Arc`; all inner
/// state is already shared.
pub struct GraphRag {
    db: Arc<SurrealDbClient>,
    ingestion: IngestionOrchestrator,
    search: SearchManager,
    usage: UsageAccumulator,
    embedding_dimension: usize,
}

impl GraphRag {
    /// Connects to the graph store and wires the default OpenAI-compatible
    /// providers from configuration.
    pub async fn new(config: &AppConfig) -> Result<Self, GraphRagError> {
        let db = Arc::new(SurrealDbClient::connect(config).await?);
        let agent = Arc::new(LlmAgent::from_config(config));
        let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::from_config(config));
        let services: Arc<dyn PipelineServices> =
            Arc::new(DefaultPipelineServices::new(Arc::clone(&agent), Arc::clone(&embedder)));

        let ingestion_config = IngestionConfig {
            tuning: IngestionTuning {
                similarity_threshold: config.similarity_threshold,
                top_k_candidates: config.top_k_candidates,
                ..IngestionTuning::default()
            },
        };

        Ok(Self::from_components(db, services, embedder, agent, ingestion_config))
    }

    /// Assembles a handle from explicit components. The embedder must be
    /// the same one the services carry, so vector dimensions line up.
    pub fn from_components(
        db: Arc<SurrealDbClient>,
        services: Arc<dyn PipelineServices>,
        embedder: Arc<dyn Embedder>,
        agent: Arc<LlmAgent>,
        ingestion_config: IngestionConfig,
    ) -> Self {
        let usage = UsageAccumulator::new();
        let embedding_dimension = embedder.dimension();
        let ingestion = IngestionOrchestrator::new(Arc::clone(&db), services, ingestion_config, usage.clone());
        let search = SearchManager::new(Arc::clone(&db), embedder, agent, usage.clone());
        Self { db, ingestion, search, usage, embedding_dimension }
    }

    /// Declares every index and constraint, sized to the configured
    /// embedding dimension. Safe to call on every startup.
    pub async fn ensure_schema(&self) -> Result<(), GraphRagError> {
        self.db.ensure_schema(self.embedding_dimension).await
    }

    /// Deletes all data, leaving the schema in place.
    pub async fn clear_data(&self) -> Result<(), GraphRagError> {
        self.db.clear_data().await?;
        self.search.invalidate_schema().await;
        Ok(())
    }

    /// Drops every managed index and analyzer.
    pub async fn clear_schema(&self) -> Result<(), GraphRagError> {
        self.db.clear_schema().await
    }

    /// Ingests one source's documents. See the ingestion pipeline for the
    /// per-item semantics; item failures are skipped, not fatal.
    pub async fn add_documents_from_source(&self, input: SourceInput) -> Result<IngestResult, GraphRagError> {
        let result = self.ingestion.add_documents_from_source(input).await?;
        // Newly observed dynamic properties may change the schema the
        // query generator sees.
        self.search.invalidate_schema().await;
        Ok(result)
    }

    /// Ingests several sources with bounded parallelism.
    pub async fn ingest_sources(&self, inputs: Vec<SourceInput>) -> Vec<Result<IngestResult, GraphRagError>> {
        let results = self.ingestion.ingest_sources(inputs).await;
        self.search.invalidate_schema().await;
        results
    }

    /// Removes a source and everything derived from it, demoting products
    /// other sources still reference. Atomic: either the whole cascade
    /// lands or nothing does.
    pub async fn delete_source(&self, source_uuid: &str) -> Result<DeletionCounters, GraphRagError> {
        let counters = self.ingestion.node_manager().delete_source_and_derived(source_uuid).await?;
        self.search.invalidate_schema().await;
        Ok(counters)
    }

    /// Hybrid search across the configured kinds with fused ranking and an
    /// assembled context window.
    pub async fn search(&self, query: &str, config: &SearchConfig) -> Result<CombinedSearchResults, GraphRagError> {
        self.search.search(query, config).await
    }

    pub async fn total_generative_llm_usage(&self) -> UsageTotals {
        self.usage.total_generative().await
    }

    pub async fn total_embedding_usage(&self) -> UsageTotals {
        self.usage.total_embedding().await
    }
}
