use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use common::{
    error::GraphRagError,
    storage::{
        db::SurrealDbClient,
        types::{
            chunk::Chunk, entity::Entity, product::Product, relationship::Mentions,
            relationship::RelatesTo, source::Source,
        },
    },
    usage::{UsageAccumulator, UsageTotals},
    utils::embedding::Embedder,
};

use crate::{
    documents::{ContentTypeHint, DocumentInput, NodeTypeHint, ProductAttributes},
    extraction::ExtractedEntity,
    pipeline::{IngestionConfig, IngestionOrchestrator, SourceInput},
    relationships::{ExtractedRelationship, ResolvedEntityInfo},
    resolver::{CandidateNodeType, DuplicateCandidate, DuplicateDecision, ProductMatchDecision},
    services::PipelineServices,
};

const DIM: usize = 4;

/// Deterministic embedder: related product names share an axis, everything
/// else lands on a byte-hash axis so unrelated names don't collide with
/// the 0.85 similarity threshold.
#[derive(Default)]
struct StubEmbedder;

fn vector_for(text: &str) -> Vec<f32> {
    let lowered = text.to_lowercase();
    if lowered.contains("dell xps") {
        return vec![1.0, 0.0, 0.0, 0.0];
    }
    let hash = lowered.bytes().fold(7usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    let mut vector = vec![0.0; DIM];
    // axis 0 is reserved for the product-family vectors above
    vector[1 + hash % (DIM - 1)] = 1.0;
    vector
}

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed_batch(&self, inputs: &[String]) -> Result<(Vec<Vec<f32>>, UsageTotals), GraphRagError> {
        let vectors = inputs.iter().map(|i| vector_for(i)).collect();
        Ok((vectors, UsageTotals::embedding(inputs.len() as u64)))
    }

    fn dimension(&self) -> usize {
        DIM
    }
}

/// Canned model behavior keyed on chunk text.
#[derive(Default)]
struct StubServices {
    extractions: HashMap<String, Vec<ExtractedEntity>>,
    relationships: HashMap<String, Vec<ExtractedRelationship>>,
    /// Mark mentions as duplicates of a product candidate when one is in
    /// the shortlist.
    dedup_to_product: bool,
    /// Strong-match the top entity candidate during promotion checks.
    promotion_match: bool,
    fail_extraction_for: Option<String>,
    embedder: StubEmbedder,
}

fn entity(name: &str, label: &str, fact: &str) -> ExtractedEntity {
    ExtractedEntity {
        name: name.to_string(),
        label: label.to_string(),
        description: None,
        fact_sentence_about_mention: Some(fact.to_string()),
    }
}

#[async_trait]
impl PipelineServices for StubServices {
    fn embedder(&self) -> &dyn Embedder {
        &self.embedder
    }

    async fn extract_entities(
        &self,
        text: &str,
        _context: Option<&str>,
    ) -> Result<(Vec<ExtractedEntity>, UsageTotals), GraphRagError> {
        if self.fail_extraction_for.as_deref() == Some(text) {
            return Err(GraphRagError::LlmParsing("stubbed extraction failure".into()));
        }
        Ok((
            self.extractions.get(text).cloned().unwrap_or_default(),
            UsageTotals::generative(10, 5),
        ))
    }

    async fn extract_relationships(
        &self,
        text: &str,
        _entities: &[ResolvedEntityInfo],
    ) -> Result<(Vec<ExtractedRelationship>, UsageTotals), GraphRagError> {
        Ok((
            self.relationships.get(text).cloned().unwrap_or_default(),
            UsageTotals::generative(8, 4),
        ))
    }

    async fn judge_duplicate(
        &self,
        _candidate: &ExtractedEntity,
        existing: &[DuplicateCandidate],
    ) -> Result<(DuplicateDecision, UsageTotals), GraphRagError> {
        if self.dedup_to_product {
            if let Some(product) = existing.iter().find(|c| c.node_type == CandidateNodeType::Product) {
                return Ok((
                    DuplicateDecision {
                        is_duplicate: true,
                        duplicate_of_uuid: Some(product.uuid.clone()),
                        canonical_name: Some(product.name.clone()),
                    },
                    UsageTotals::generative(6, 2),
                ));
            }
        }
        Ok((
            DuplicateDecision { is_duplicate: false, duplicate_of_uuid: None, canonical_name: None },
            UsageTotals::generative(6, 2),
        ))
    }

    async fn judge_product_match(
        &self,
        _product_name: &str,
        _product_description: Option<&str>,
        _attributes: &ProductAttributes,
        candidate: &DuplicateCandidate,
    ) -> Result<(ProductMatchDecision, UsageTotals), GraphRagError> {
        if self.promotion_match {
            Ok((
                ProductMatchDecision {
                    is_strong_match: true,
                    matched_entity_uuid: Some(candidate.uuid.clone()),
                },
                UsageTotals::generative(6, 2),
            ))
        } else {
            Ok((
                ProductMatchDecision { is_strong_match: false, matched_entity_uuid: None },
                UsageTotals::generative(6, 2),
            ))
        }
    }
}

async fn orchestrator(services: StubServices) -> IngestionOrchestrator {
    let db = SurrealDbClient::memory("ingest_tests", &Uuid::new_v4().to_string())
        .await
        .expect("memory db");
    db.ensure_schema(DIM).await.expect("schema");
    IngestionOrchestrator::new(
        Arc::new(db),
        Arc::new(services),
        IngestionConfig::default(),
        UsageAccumulator::new(),
    )
}

fn chunk_doc(content: &str, number: u32) -> DocumentInput {
    DocumentInput {
        page_content: content.to_string(),
        node_type: NodeTypeHint::Chunk,
        content_type: ContentTypeHint::Text,
        metadata: json!({"chunk_number": number, "name": format!("chunk {number}")})
            .as_object()
            .cloned()
            .unwrap_or_default(),
    }
}

fn product_doc(payload: serde_json::Value) -> DocumentInput {
    DocumentInput {
        page_content: payload.to_string(),
        node_type: NodeTypeHint::Product,
        content_type: ContentTypeHint::Json,
        metadata: serde_json::Map::new(),
    }
}

fn source(identifier: &str, documents: Vec<DocumentInput>) -> SourceInput {
    SourceInput {
        source_identifier: identifier.to_string(),
        source_content: None,
        source_metadata: serde_json::Map::new(),
        documents,
    }
}

async fn all<T: common::storage::types::StoredObject + Send + Sync + 'static>(
    orchestrator: &IngestionOrchestrator,
) -> Vec<T> {
    orchestrator.node_manager().db().get_all_stored_items().await.expect("select all")
}

async fn edges<T: for<'de> serde::Deserialize<'de>>(orchestrator: &IngestionOrchestrator, table: &str) -> Vec<T> {
    orchestrator
        .node_manager()
        .db()
        .client
        .query(format!("SELECT * FROM {table}"))
        .await
        .expect("query")
        .take(0)
        .expect("take")
}

#[tokio::test]
async fn new_entities_from_text_get_nodes_mentions_and_embeddings() {
    let text = "Pooh Bear ate honey at Rabbit's house.";
    let mut services = StubServices::default();
    services.extractions.insert(
        text.to_string(),
        vec![
            entity("Pooh Bear", "Character", text),
            entity("Rabbit", "Character", text),
        ],
    );
    services.relationships.insert(
        text.to_string(),
        vec![ExtractedRelationship {
            source_entity_name: "Pooh Bear".into(),
            target_entity_name: "Rabbit".into(),
            relation_label: "VISITED".into(),
            fact_sentence: text.to_string(),
        }],
    );

    let orchestrator = orchestrator(services).await;
    let result = orchestrator
        .add_documents_from_source(source("pooh-story", vec![chunk_doc(text, 1)]))
        .await
        .expect("ingest");

    assert_eq!(result.added_item_uuids.len(), 1);
    assert!(result.generative_usage.requests > 0);
    assert!(result.embedding_usage.requests > 0);

    let sources: Vec<Source> = all(&orchestrator).await;
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].id, Source::derive_id("pooh-story"));

    let chunks: Vec<Chunk> = all(&orchestrator).await;
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].content_embedding.is_some());

    let mut entities: Vec<Entity> = all(&orchestrator).await;
    entities.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(entities.len(), 2);
    assert_eq!(entities[0].name, "Pooh Bear");
    assert!(entities.iter().all(|e| e.name_embedding.as_ref().map(Vec::len) == Some(DIM)));

    let mentions: Vec<Mentions> = edges(&orchestrator, "mentions").await;
    assert_eq!(mentions.len(), 2);
    assert!(mentions.iter().all(|m| m.fact_embedding.is_some()));

    let rels: Vec<RelatesTo> = edges(&orchestrator, "relates_to").await;
    assert_eq!(rels.len(), 1);
    assert_eq!(rels[0].relation_label, "VISITED");
    assert_eq!(rels[0].source_chunk_id, chunks[0].id);
    assert!(rels[0].fact_embedding.is_some());
}

#[tokio::test]
async fn reingesting_the_same_source_does_not_duplicate_anything() {
    let text = "Pooh Bear ate honey at Rabbit's house.";
    let mut services = StubServices::default();
    services.extractions.insert(
        text.to_string(),
        vec![entity("Pooh Bear", "Character", text), entity("Rabbit", "Character", text)],
    );
    services.relationships.insert(
        text.to_string(),
        vec![ExtractedRelationship {
            source_entity_name: "Pooh Bear".into(),
            target_entity_name: "Rabbit".into(),
            relation_label: "VISITED".into(),
            fact_sentence: text.to_string(),
        }],
    );

    let orchestrator = orchestrator(services).await;
    let make_input = || {
        let mut doc = chunk_doc(text, 1);
        doc.metadata.insert("chunk_uuid".into(), json!("chunk-fixed-id"));
        source("pooh-story", vec![doc])
    };

    orchestrator.add_documents_from_source(make_input()).await.expect("first ingest");
    orchestrator.add_documents_from_source(make_input()).await.expect("second ingest");

    let sources: Vec<Source> = all(&orchestrator).await;
    let chunks: Vec<Chunk> = all(&orchestrator).await;
    let entities: Vec<Entity> = all(&orchestrator).await;
    let mentions: Vec<Mentions> = edges(&orchestrator, "mentions").await;
    let rels: Vec<RelatesTo> = edges(&orchestrator, "relates_to").await;

    assert_eq!(sources.len(), 1);
    assert_eq!(chunks.len(), 1);
    assert_eq!(entities.len(), 2);
    assert_eq!(mentions.len(), 2);
    assert_eq!(rels.len(), 1);
}

#[tokio::test]
async fn chunk_ordering_links_follow_chunk_numbers() {
    let orchestrator = orchestrator(StubServices::default()).await;
    orchestrator
        .add_documents_from_source(source(
            "ordered",
            vec![chunk_doc("first part", 1), chunk_doc("second part", 2), chunk_doc("third part", 3)],
        ))
        .await
        .expect("ingest");

    let chunks = Chunk::find_by_source_id(&Source::derive_id("ordered"), orchestrator.node_manager().db())
        .await
        .unwrap();
    assert_eq!(chunks.len(), 3);
    assert!(chunks[0].previous_chunk_id.is_none());
    assert_eq!(chunks[1].previous_chunk_id.as_deref(), Some(chunks[0].id.as_str()));
    assert_eq!(chunks[2].previous_chunk_id.as_deref(), Some(chunks[1].id.as_str()));
}

#[tokio::test]
async fn product_definition_promotes_matching_entity() {
    let chunk_text = "The Dell XPS 13 is a popular ultrabook.";
    let mut services = StubServices::default();
    services.promotion_match = true;
    services
        .extractions
        .insert(chunk_text.to_string(), vec![entity("Dell XPS 13", "Product", chunk_text)]);

    let orchestrator = orchestrator(services).await;
    orchestrator
        .add_documents_from_source(source("review", vec![chunk_doc(chunk_text, 1)]))
        .await
        .expect("chunk ingest");

    let entities: Vec<Entity> = all(&orchestrator).await;
    assert_eq!(entities.len(), 1);

    orchestrator
        .add_documents_from_source(source(
            "catalog",
            vec![product_doc(json!({
                "productName": "Dell XPS 13 (2024 Model 9340)",
                "brand": "Dell",
                "sku": "DEL-XPS13-9340",
                "category": "laptops",
                "price": 1499.0
            }))],
        ))
        .await
        .expect("product ingest");

    let entities: Vec<Entity> = all(&orchestrator).await;
    assert!(entities.is_empty(), "the mentioned entity should have been promoted away");

    let products: Vec<Product> = all(&orchestrator).await;
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].name, "Dell XPS 13 (2024 Model 9340)");
    assert_eq!(products[0].sku.as_deref(), Some("DEL-XPS13-9340"));
    assert_eq!(products[0].name_embedding.as_ref().map(Vec::len), Some(DIM));

    // the chunk's mention now targets the product
    let mentions: Vec<Mentions> = edges(&orchestrator, "mentions").await;
    assert_eq!(mentions.len(), 1);
    assert_eq!(mentions[0].out.id.to_raw(), products[0].id);
}

#[tokio::test]
async fn promotion_still_matches_when_similar_products_outscore_the_entity() {
    let chunk_text = "The Dell XPS 13 is a popular ultrabook.";
    let mut services = StubServices::default();
    services.promotion_match = true;
    services
        .extractions
        .insert(chunk_text.to_string(), vec![entity("Dell XPS 13", "Product", chunk_text)]);

    let orchestrator = orchestrator(services).await;

    // A catalog full of sibling models, all embedding onto the same axis as
    // the entity the next product definition should promote.
    let sibling_docs: Vec<DocumentInput> = [15, 17, 14, 16, 12]
        .iter()
        .map(|model| product_doc(json!({"productName": format!("Dell XPS {model}"), "category": "laptops"})))
        .collect();
    orchestrator
        .add_documents_from_source(source("catalog", sibling_docs))
        .await
        .expect("sibling product ingest");

    orchestrator
        .add_documents_from_source(source("review", vec![chunk_doc(chunk_text, 1)]))
        .await
        .expect("chunk ingest");
    let entities: Vec<Entity> = all(&orchestrator).await;
    assert_eq!(entities.len(), 1);

    orchestrator
        .add_documents_from_source(source(
            "catalog-2",
            vec![product_doc(json!({
                "productName": "Dell XPS 13 (2024 Model 9340)",
                "category": "laptops"
            }))],
        ))
        .await
        .expect("matching product ingest");

    // the entity was promoted even though five products score just as high
    let entities: Vec<Entity> = all(&orchestrator).await;
    assert!(entities.is_empty());

    let products: Vec<Product> = all(&orchestrator).await;
    assert_eq!(products.len(), 6);

    let mentions: Vec<Mentions> = edges(&orchestrator, "mentions").await;
    assert_eq!(mentions.len(), 1);
    let promoted = products
        .iter()
        .find(|p| p.name == "Dell XPS 13 (2024 Model 9340)")
        .expect("promoted product");
    assert_eq!(mentions[0].out.id.to_raw(), promoted.id);
}

#[tokio::test]
async fn chunks_from_other_sources_link_to_the_existing_product() {
    let chunk_text = "The Dell XPS 13 is great.";
    let mut services = StubServices::default();
    services.dedup_to_product = true;
    services
        .extractions
        .insert(chunk_text.to_string(), vec![entity("Dell XPS 13", "Product", chunk_text)]);

    let orchestrator = orchestrator(services).await;
    orchestrator
        .add_documents_from_source(source(
            "catalog",
            vec![product_doc(json!({"productName": "Dell XPS 13", "category": "laptops"}))],
        ))
        .await
        .expect("product ingest");

    orchestrator
        .add_documents_from_source(source("review-a", vec![chunk_doc(chunk_text, 1)]))
        .await
        .expect("first review");
    orchestrator
        .add_documents_from_source(source("review-b", vec![chunk_doc(chunk_text, 1)]))
        .await
        .expect("second review");

    let products: Vec<Product> = all(&orchestrator).await;
    assert_eq!(products.len(), 1, "no duplicate product may appear");
    let entities: Vec<Entity> = all(&orchestrator).await;
    assert!(entities.is_empty());

    let mentions: Vec<Mentions> = edges(&orchestrator, "mentions").await;
    assert_eq!(mentions.len(), 2);
    assert!(mentions.iter().all(|m| m.out.id.to_raw() == products[0].id));
}

#[tokio::test]
async fn extraction_failure_degrades_to_a_plain_chunk() {
    let good = "A fine paragraph about Rabbit.";
    let bad = "This chunk's extraction will fail.";
    let mut services = StubServices::default();
    services.fail_extraction_for = Some(bad.to_string());
    services.extractions.insert(good.to_string(), vec![entity("Rabbit", "Character", good)]);

    let orchestrator = orchestrator(services).await;
    let result = orchestrator
        .add_documents_from_source(source("mixed", vec![chunk_doc(bad, 1), chunk_doc(good, 2)]))
        .await
        .expect("source must survive the failing item");

    // Both chunks land; the one with the failed extraction just carries no
    // entities.
    assert_eq!(result.added_item_uuids.len(), 2);
    let chunks: Vec<Chunk> = all(&orchestrator).await;
    assert_eq!(chunks.len(), 2);
    let entities: Vec<Entity> = all(&orchestrator).await;
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].name, "Rabbit");
}

#[tokio::test]
async fn unparseable_product_json_degrades_to_text_description() {
    let orchestrator = orchestrator(StubServices::default()).await;
    let result = orchestrator
        .add_documents_from_source(source(
            "broken-catalog",
            vec![DocumentInput {
                page_content: "not { json".into(),
                node_type: NodeTypeHint::Product,
                content_type: ContentTypeHint::Json,
                metadata: json!({"name": "Mystery Gadget"}).as_object().cloned().unwrap_or_default(),
            }],
        ))
        .await
        .expect("ingest");

    assert_eq!(result.added_item_uuids.len(), 1);
    let products: Vec<Product> = all(&orchestrator).await;
    assert_eq!(products.len(), 1);
    assert_eq!(products[0].name, "Mystery Gadget");
    assert_eq!(products[0].content.as_deref(), Some("not { json"));
}
