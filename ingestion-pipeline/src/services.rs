use std::sync::Arc;

use async_trait::async_trait;

use common::{
    config::AppConfig,
    error::GraphRagError,
    usage::UsageTotals,
    utils::{
        embedding::{Embedder, OpenAiEmbedder},
        llm::LlmAgent,
    },
};

use crate::{
    documents::ProductAttributes,
    extraction::{extract_entities, ExtractedEntity},
    relationships::{extract_relationships, ExtractedRelationship, ResolvedEntityInfo},
    resolver::{
        dedup_decision_schema, dedup_user_prompt, product_match_decision_schema,
        product_match_user_prompt, DuplicateCandidate, DuplicateDecision, ProductMatchDecision,
        ENTITY_DEDUPLICATION_SYSTEM_PROMPT, PRODUCT_ENTITY_MATCH_SYSTEM_PROMPT,
    },
};

/// The model-backed operations the ingestion pipeline depends on. Tests
/// swap in a stub implementation, production uses `DefaultPipelineServices`.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    fn embedder(&self) -> &dyn Embedder;

    async fn extract_entities(
        &self,
        text: &str,
        context: Option<&str>,
    ) -> Result<(Vec<ExtractedEntity>, UsageTotals), GraphRagError>;

    async fn extract_relationships(
        &self,
        text: &str,
        entities: &[ResolvedEntityInfo],
    ) -> Result<(Vec<ExtractedRelationship>, UsageTotals), GraphRagError>;

    async fn judge_duplicate(
        &self,
        candidate: &ExtractedEntity,
        existing: &[DuplicateCandidate],
    ) -> Result<(DuplicateDecision, UsageTotals), GraphRagError>;

    async fn judge_product_match(
        &self,
        product_name: &str,
        product_description: Option<&str>,
        attributes: &ProductAttributes,
        candidate: &DuplicateCandidate,
    ) -> Result<(ProductMatchDecision, UsageTotals), GraphRagError>;
}

/// Production services: one shared chat agent with its fallback chain, one
/// embedding provider.
pub struct DefaultPipelineServices {
    agent: Arc<LlmAgent>,
    embedder: Arc<dyn Embedder>,
}

impl DefaultPipelineServices {
    pub fn new(agent: Arc<LlmAgent>, embedder: Arc<dyn Embedder>) -> Self {
        Self { agent, embedder }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            Arc::new(LlmAgent::from_config(config)),
            Arc::new(OpenAiEmbedder::from_config(config)),
        )
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    fn embedder(&self) -> &dyn Embedder {
        self.embedder.as_ref()
    }

    async fn extract_entities(
        &self,
        text: &str,
        context: Option<&str>,
    ) -> Result<(Vec<ExtractedEntity>, UsageTotals), GraphRagError> {
        extract_entities(&self.agent, text, context).await
    }

    async fn extract_relationships(
        &self,
        text: &str,
        entities: &[ResolvedEntityInfo],
    ) -> Result<(Vec<ExtractedRelationship>, UsageTotals), GraphRagError> {
        extract_relationships(&self.agent, text, entities).await
    }

    async fn judge_duplicate(
        &self,
        candidate: &ExtractedEntity,
        existing: &[DuplicateCandidate],
    ) -> Result<(DuplicateDecision, UsageTotals), GraphRagError> {
        let (schema_name, schema) = dedup_decision_schema();
        self.agent
            .generate_typed(
                ENTITY_DEDUPLICATION_SYSTEM_PROMPT,
                &dedup_user_prompt(candidate, existing),
                schema_name,
                schema,
            )
            .await
    }

    async fn judge_product_match(
        &self,
        product_name: &str,
        product_description: Option<&str>,
        attributes: &ProductAttributes,
        candidate: &DuplicateCandidate,
    ) -> Result<(ProductMatchDecision, UsageTotals), GraphRagError> {
        let (schema_name, schema) = product_match_decision_schema();
        self.agent
            .generate_typed(
                PRODUCT_ENTITY_MATCH_SYSTEM_PROMPT,
                &product_match_user_prompt(product_name, product_description, attributes, candidate),
                schema_name,
                schema,
            )
            .await
    }
}
