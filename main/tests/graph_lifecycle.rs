//! Full-loop exercise of the public handle: ingest a source through the
//! model seams, search it, and delete it again.

use std::sync::Arc;
use std::time::Duration;

use async_openai::{config::OpenAIConfig, Client};
use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use common::{
    error::GraphRagError,
    storage::db::SurrealDbClient,
    usage::UsageTotals,
    utils::{embedding::Embedder, llm::LlmAgent},
};
use graphrag::GraphRag;
use ingestion_pipeline::{
    extraction::ExtractedEntity,
    relationships::{ExtractedRelationship, ResolvedEntityInfo},
    resolver::{DuplicateCandidate, DuplicateDecision, ProductMatchDecision},
    ContentTypeHint, DocumentInput, IngestionConfig, NodeTypeHint, PipelineServices,
    ProductAttributes, SourceInput,
};
use retrieval_pipeline::{SearchConfig, SearchKind};

const DIM: usize = 4;

struct AxisEmbedder;

#[async_trait]
impl Embedder for AxisEmbedder {
    async fn embed_batch(&self, inputs: &[String]) -> Result<(Vec<Vec<f32>>, UsageTotals), GraphRagError> {
        let vectors = inputs
            .iter()
            .map(|input| {
                let hash = input
                    .to_lowercase()
                    .bytes()
                    .fold(7usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
                let mut vector = vec![0.0; DIM];
                vector[hash % DIM] = 1.0;
                vector
            })
            .collect();
        Ok((vectors, UsageTotals::embedding(inputs.len() as u64)))
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

/// Extracts one fixed entity from the test chunk and nothing else.
struct CannedServices {
    embedder: AxisEmbedder,
}

#[async_trait]
impl PipelineServices for CannedServices {
    fn embedder(&self) -> &dyn Embedder {
        &self.embedder
    }

    async fn extract_entities(
        &self,
        text: &str,
        _context: Option<&str>,
    ) -> Result<(Vec<ExtractedEntity>, UsageTotals), GraphRagError> {
        let entities = if text.contains("Winnie-the-Pooh") {
            vec![ExtractedEntity {
                name: "Winnie-the-Pooh".into(),
                label: "Character".into(),
                description: Some("A bear fond of honey.".into()),
                fact_sentence_about_mention: Some(text.to_string()),
            }]
        } else {
            Vec::new()
        };
        Ok((entities, UsageTotals::generative(12, 6)))
    }

    async fn extract_relationships(
        &self,
        _text: &str,
        _entities: &[ResolvedEntityInfo],
    ) -> Result<(Vec<ExtractedRelationship>, UsageTotals), GraphRagError> {
        Ok((Vec::new(), UsageTotals::default()))
    }

    async fn judge_duplicate(
        &self,
        _candidate: &ExtractedEntity,
        _existing: &[DuplicateCandidate],
    ) -> Result<(DuplicateDecision, UsageTotals), GraphRagError> {
        Ok((
            DuplicateDecision { is_duplicate: false, duplicate_of_uuid: None, canonical_name: None },
            UsageTotals::generative(4, 2),
        ))
    }

    async fn judge_product_match(
        &self,
        _product_name: &str,
        _product_description: Option<&str>,
        _attributes: &ProductAttributes,
        _candidate: &DuplicateCandidate,
    ) -> Result<(ProductMatchDecision, UsageTotals), GraphRagError> {
        Ok((
            ProductMatchDecision { is_strong_match: false, matched_entity_uuid: None },
            UsageTotals::generative(4, 2),
        ))
    }
}

async fn graph() -> GraphRag {
    let db = Arc::new(
        SurrealDbClient::memory("lifecycle", &Uuid::new_v4().to_string())
            .await
            .expect("memory db"),
    );
    let embedder: Arc<dyn Embedder> = Arc::new(AxisEmbedder);
    let services: Arc<dyn PipelineServices> = Arc::new(CannedServices { embedder: AxisEmbedder });
    let agent = Arc::new(LlmAgent::new(
        Client::with_config(OpenAIConfig::new()),
        Vec::new(),
        Duration::from_secs(5),
    ));

    let graph = GraphRag::from_components(db, services, embedder, agent, IngestionConfig::default());
    graph.ensure_schema().await.expect("schema");
    graph
}

fn pooh_source() -> SourceInput {
    SourceInput {
        source_identifier: "pooh-chapter-1".into(),
        source_content: None,
        source_metadata: json!({"author": "A. A. Milne"}).as_object().cloned().unwrap_or_default(),
        documents: vec![DocumentInput {
            page_content: "Winnie-the-Pooh went to visit the honey tree.".into(),
            node_type: NodeTypeHint::Chunk,
            content_type: ContentTypeHint::Text,
            metadata: json!({"chunk_number": 1, "name": "The Honey Tree"})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        }],
    }
}

#[tokio::test]
async fn ingest_search_and_delete_round_trip() {
    let graph = graph().await;

    let result = graph.add_documents_from_source(pooh_source()).await.expect("ingest");
    assert_eq!(result.added_item_uuids.len(), 1);

    // extract -> resolve -> search: a keyword search for part of the name
    // finds the chunk that mentions it
    let results = graph.search("Pooh honey", &SearchConfig::default()).await.expect("search");
    let chunk_hit = results
        .items
        .iter()
        .find(|item| item.result_type == SearchKind::Chunk)
        .expect("a chunk hit");
    assert!(chunk_hit.score > 0.0);
    assert!(chunk_hit.content.as_deref().unwrap_or("").contains("Winnie-the-Pooh"));

    let entity_hit = results.items.iter().find(|item| item.result_type == SearchKind::Entity);
    assert!(entity_hit.is_some(), "the resolved entity should be searchable");

    // usage flowed into the process-wide accumulators
    let generative = graph.total_generative_llm_usage().await;
    let embedding = graph.total_embedding_usage().await;
    assert!(generative.requests > 0);
    assert!(embedding.requests > 0);

    // delete the source: nothing referencing it survives
    let counters = graph.delete_source(&result.source_uuid).await.expect("delete");
    assert_eq!(counters.sources, 1);
    assert_eq!(counters.chunks, 1);
    assert_eq!(counters.entities, 1);

    let after = graph.search("Pooh honey", &SearchConfig::default()).await.expect("search after delete");
    assert!(after.items.is_empty());
}

#[tokio::test]
async fn reingesting_is_idempotent_through_the_public_surface() {
    let graph = graph().await;

    let first = graph.add_documents_from_source(pooh_source()).await.expect("first");
    let second = graph.add_documents_from_source(pooh_source()).await.expect("second");
    assert_eq!(first.source_uuid, second.source_uuid);

    // the derived ids converge, so the graph holds exactly one chunk and
    // one entity regardless of how many times the source is re-ingested
    let results = graph.search("Pooh honey", &SearchConfig::default()).await.expect("search");
    let chunk_hits: Vec<_> = results.items.iter().filter(|i| i.result_type == SearchKind::Chunk).collect();
    let entity_hits: Vec<_> = results.items.iter().filter(|i| i.result_type == SearchKind::Entity).collect();
    assert_eq!(chunk_hits.len(), 1);
    assert_eq!(entity_hits.len(), 1);
}
