mod config;
#[cfg(test)]
mod tests;

pub use config::{IngestionConfig, IngestionTuning};

use std::sync::Arc;

use futures::{stream, StreamExt};
use serde_json::{Map, Value};
use tokio_retry::{strategy::ExponentialBackoff, RetryIf};
use tracing::{info, instrument, warn};

use common::{
    error::GraphRagError,
    graph::NodeManager,
    storage::{
        db::SurrealDbClient,
        types::{chunk::Chunk, entity::Entity, product::Product, source::Source, StoredObject},
    },
    usage::{UsageAccumulator, UsageTotals},
    utils::properties::normalize_property_bag,
};

use crate::{
    documents::{ChunkPayload, DocumentInput, NodeTypeHint, ProductPayload},
    relationships::ResolvedEntityInfo,
    resolver::{EntityResolver, ResolutionOutcome},
    services::PipelineServices,
};

/// One source plus its ordered items, as handed to `AddDocumentsFromSource`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SourceInput {
    pub source_identifier: String,
    #[serde(default)]
    pub source_content: Option<String>,
    #[serde(default)]
    pub source_metadata: Map<String, Value>,
    pub documents: Vec<DocumentInput>,
}

#[derive(Debug, Clone)]
pub struct IngestResult {
    pub source_uuid: String,
    pub added_item_uuids: Vec<String>,
    pub generative_usage: UsageTotals,
    pub embedding_usage: UsageTotals,
}

/// A resolved mention target within one chunk, remembered so the
/// relationship extractor can map names back to nodes.
struct ResolvedTarget {
    info: ResolvedEntityInfo,
    table: &'static str,
}

/// Drives sources through the chunk and product ingestion paths: upserts,
/// entity extraction and resolution, relationship extraction, and embedding
/// writes. Item-level failures are logged and skipped; a source never
/// aborts because one of its items did.
pub struct IngestionOrchestrator {
    node_manager: NodeManager,
    resolver: EntityResolver,
    services: Arc<dyn PipelineServices>,
    tuning: IngestionTuning,
    usage: UsageAccumulator,
}

impl IngestionOrchestrator {
    pub fn new(
        db: Arc<SurrealDbClient>,
        services: Arc<dyn PipelineServices>,
        config: IngestionConfig,
        usage: UsageAccumulator,
    ) -> Self {
        let tuning = config.tuning;
        let embedding_dimension = services.embedder().dimension();
        Self {
            node_manager: NodeManager::new(Arc::clone(&db), embedding_dimension),
            resolver: EntityResolver::new(db, tuning.similarity_threshold, tuning.top_k_candidates),
            services,
            tuning,
            usage,
        }
    }

    pub fn node_manager(&self) -> &NodeManager {
        &self.node_manager
    }

    /// Ingests several sources with bounded parallelism. Items inside each
    /// source stay strictly ordered.
    pub async fn ingest_sources(&self, inputs: Vec<SourceInput>) -> Vec<Result<IngestResult, GraphRagError>> {
        stream::iter(inputs)
            .map(|input| self.add_documents_from_source(input))
            .buffer_unordered(self.tuning.source_concurrency.max(1))
            .collect()
            .await
    }

    /// The per-source pipeline: source upsert (and optional content
    /// embedding), then each document in declaration order through the text
    /// or product path, threading the previous chunk's text into extraction.
    #[instrument(skip_all, fields(source = %input.source_identifier, items = input.documents.len()))]
    pub async fn add_documents_from_source(&self, input: SourceInput) -> Result<IngestResult, GraphRagError> {
        let mut generative = UsageTotals::default();
        let mut embedding = UsageTotals::default();

        let properties = normalize_property_bag(input.source_metadata);
        let (source, _created) = self
            .with_retry(|| {
                self.node_manager
                    .upsert_source(&input.source_identifier, input.source_content.as_deref(), properties.clone())
            })
            .await?;

        if let Some(content) = input.source_content.as_deref() {
            match self.embed_and_store(Source::table_name(), &source.id, "content_embedding", content).await {
                Ok(usage) => embedding += usage,
                Err(err) => warn!(error = %err, "source content embedding failed, source stays keyword-searchable"),
            }
        }

        let mut added_item_uuids = Vec::new();
        let mut previous_chunk_content: Option<String> = None;

        for (index, document) in input.documents.into_iter().enumerate() {
            let node_type = document.node_type;
            let item_result = match node_type {
                NodeTypeHint::Chunk => {
                    self.process_chunk_item(&source, document, previous_chunk_content.as_deref(), &mut generative, &mut embedding)
                        .await
                }
                NodeTypeHint::Product => {
                    self.process_product_item(&source, document, &mut generative, &mut embedding)
                        .await
                }
            };

            match item_result {
                Ok(ItemOutcome { uuid, chunk_content }) => {
                    added_item_uuids.push(uuid);
                    // Product payloads make poor extraction context; only a
                    // text chunk feeds the next item.
                    previous_chunk_content = chunk_content;
                }
                Err(err) => {
                    warn!(item = index, error = %err, "item failed, continuing with the rest of the source");
                    previous_chunk_content = None;
                }
            }
        }

        info!(source_id = %source.id, added = added_item_uuids.len(), "source ingestion finished");

        Ok(IngestResult {
            source_uuid: source.id,
            added_item_uuids,
            generative_usage: generative,
            embedding_usage: embedding,
        })
    }

    async fn process_chunk_item(
        &self,
        source: &Source,
        document: DocumentInput,
        previous_chunk_content: Option<&str>,
        generative: &mut UsageTotals,
        embedding: &mut UsageTotals,
    ) -> Result<ItemOutcome, GraphRagError> {
        let payload = ChunkPayload::from_document(document);
        let chunk_id = payload
            .uuid
            .clone()
            .unwrap_or_else(|| Chunk::derive_id(&source.id, payload.chunk_number, &payload.content));
        let chunk = Chunk::new(
            Some(chunk_id),
            source.id.clone(),
            source.name.clone(),
            payload.name,
            payload.content.clone(),
            payload.chunk_number,
            payload.properties,
        );
        let chunk = self.with_retry(|| self.node_manager.upsert_chunk(chunk.clone())).await?;

        // A failed extraction degrades to "no entities found": the chunk
        // itself stays ingested and keyword-searchable.
        let extracted = match self.services.extract_entities(&payload.content, previous_chunk_content).await {
            Ok((extracted, extraction_usage)) => {
                *generative += extraction_usage;
                self.usage.record_generative(extraction_usage).await;
                extracted
            }
            Err(err) => {
                warn!(chunk_id = %chunk.id, error = %err, "entity extraction failed, continuing without entities");
                Vec::new()
            }
        };

        let mut resolved: Vec<ResolvedTarget> = Vec::new();
        let mut mention_facts: Vec<(String, String)> = Vec::new();

        for candidate in &extracted {
            let (outcome, name_embedding, resolution_usage) = self.resolver.resolve(candidate, self.services.as_ref()).await?;
            *generative += resolution_usage.generative;
            *embedding += resolution_usage.embedding;
            self.usage.record_generative(resolution_usage.generative).await;
            self.usage.record_embedding(resolution_usage.embedding).await;

            let fact = candidate.fact_sentence_about_mention.as_deref();
            match outcome {
                ResolutionOutcome::DuplicateOfProduct { uuid } => {
                    let (edge_uuid, _) = self
                        .with_retry(|| self.node_manager.link_chunk_to_product(&chunk.id, &uuid, fact))
                        .await?;
                    if let Some(fact) = fact {
                        mention_facts.push((edge_uuid, fact.to_string()));
                    }
                    let product: Option<Product> = self.node_manager.db().get_item(&uuid).await?;
                    let (name, label) = product
                        .map(|p| {
                            let label = p.category.clone().unwrap_or_else(|| "Product".to_string());
                            (p.name, label)
                        })
                        .unwrap_or_else(|| (candidate.name.clone(), "Product".to_string()));
                    resolved.push(ResolvedTarget {
                        info: ResolvedEntityInfo { uuid, name, label },
                        table: Product::table_name(),
                    });
                }
                ResolutionOutcome::DuplicateOfEntity { uuid, canonical_name } => {
                    let stored: Option<Entity> = self.node_manager.db().get_item(&uuid).await?;
                    let mut final_name = stored.as_ref().map_or_else(|| candidate.name.clone(), |e| e.name.clone());
                    let label = stored.as_ref().map_or_else(|| candidate.label.clone(), |e| e.label.clone());

                    // Prefer the longer surface form as the stored display
                    // name, and refresh the name embedding to match.
                    if canonical_name.len() > final_name.len() && canonical_name != final_name {
                        self.with_retry(|| Entity::update_name(&uuid, &canonical_name, self.node_manager.db()))
                            .await?;
                        *embedding += self
                            .embed_and_store(Entity::table_name(), &uuid, "name_embedding", &canonical_name)
                            .await?;
                        final_name = canonical_name;
                    }

                    let (edge_uuid, _) = self
                        .with_retry(|| self.node_manager.link_chunk_to_entity(&chunk.id, &uuid, fact))
                        .await?;
                    if let Some(fact) = fact {
                        mention_facts.push((edge_uuid, fact.to_string()));
                    }
                    resolved.push(ResolvedTarget {
                        info: ResolvedEntityInfo { uuid, name: final_name, label },
                        table: Entity::table_name(),
                    });
                }
                ResolutionOutcome::New { canonical_name } => {
                    let (entity, was_created) = self
                        .with_retry(|| {
                            self.node_manager.merge_or_create_entity(
                                &canonical_name,
                                &candidate.label,
                                candidate.description.clone(),
                            )
                        })
                        .await?;
                    if was_created {
                        self.node_manager
                            .set_embedding(Entity::table_name(), &entity.id, "name_embedding", name_embedding.clone())
                            .await?;
                    }

                    let (edge_uuid, _) = self
                        .with_retry(|| self.node_manager.link_chunk_to_entity(&chunk.id, &entity.id, fact))
                        .await?;
                    if let Some(fact) = fact {
                        mention_facts.push((edge_uuid, fact.to_string()));
                    }
                    resolved.push(ResolvedTarget {
                        info: ResolvedEntityInfo { uuid: entity.id, name: entity.name, label: entity.label },
                        table: Entity::table_name(),
                    });
                }
            }
        }

        *embedding += self.embed_facts("mentions", &mention_facts).await?;

        let infos: Vec<ResolvedEntityInfo> = resolved.iter().map(|t| t.info.clone()).collect();
        let relationships = match self.services.extract_relationships(&payload.content, &infos).await {
            Ok((relationships, rel_usage)) => {
                *generative += rel_usage;
                self.usage.record_generative(rel_usage).await;
                relationships
            }
            Err(err) => {
                warn!(chunk_id = %chunk.id, error = %err, "relationship extraction failed, continuing without facts");
                Vec::new()
            }
        };

        let mut relationship_facts: Vec<(String, String)> = Vec::new();
        for relationship in relationships {
            let src = resolved.iter().find(|t| t.info.name == relationship.source_entity_name);
            let dst = resolved.iter().find(|t| t.info.name == relationship.target_entity_name);
            let (Some(src), Some(dst)) = (src, dst) else {
                warn!(
                    source = %relationship.source_entity_name,
                    target = %relationship.target_entity_name,
                    "relationship endpoint not among resolved entities, skipping"
                );
                continue;
            };
            if src.info.uuid == dst.info.uuid {
                continue;
            }

            let (edge_uuid, _) = self
                .with_retry(|| {
                    self.node_manager.upsert_relationship(
                        src.table,
                        &src.info.uuid,
                        dst.table,
                        &dst.info.uuid,
                        &relationship.relation_label,
                        &relationship.fact_sentence,
                        &chunk.id,
                    )
                })
                .await?;
            relationship_facts.push((edge_uuid, relationship.fact_sentence.clone()));
        }

        *embedding += self.embed_facts("relates_to", &relationship_facts).await?;
        *embedding += self
            .embed_and_store(Chunk::table_name(), &chunk.id, "content_embedding", &payload.content)
            .await?;

        Ok(ItemOutcome { uuid: chunk.id, chunk_content: Some(payload.content) })
    }

    async fn process_product_item(
        &self,
        source: &Source,
        document: DocumentInput,
        generative: &mut UsageTotals,
        embedding: &mut UsageTotals,
    ) -> Result<ItemOutcome, GraphRagError> {
        let payload = ProductPayload::from_document(document);

        let (matched_entity, promotion_usage) = self
            .resolver
            .find_entity_for_product_promotion(
                &payload.name,
                payload.description.as_deref(),
                &payload.attributes,
                self.services.as_ref(),
            )
            .await?;
        *generative += promotion_usage.generative;
        *embedding += promotion_usage.embedding;
        self.usage.record_generative(promotion_usage.generative).await;
        self.usage.record_embedding(promotion_usage.embedding).await;

        let product_id = payload.uuid.clone().unwrap_or_else(|| {
            Product::derive_id(
                &source.id,
                &common::storage::types::entity::normalize_name(&payload.name),
            )
        });
        let record = Product::new(
            Some(product_id),
            source.id.clone(),
            payload.name.clone(),
            Some(payload.content.clone()),
            payload.price,
            payload.attributes.sku.clone(),
            payload.attributes.category.clone(),
            payload.properties.clone(),
        );

        let product = if let Some(entity_uuid) = matched_entity {
            info!(entity = %entity_uuid, product = %payload.name, "promoting entity to product");
            let (product, _stats) = self
                .with_retry(|| self.node_manager.promote_entity_to_product(&entity_uuid, record.clone()))
                .await?;
            product
        } else {
            self.with_retry(|| self.node_manager.upsert_product(record.clone())).await?
        };

        *embedding += self
            .embed_and_store(Product::table_name(), &product.id, "name_embedding", &product.name)
            .await?;
        *embedding += self
            .embed_and_store(Product::table_name(), &product.id, "content_embedding", &payload.content)
            .await?;

        Ok(ItemOutcome { uuid: product.id, chunk_content: None })
    }

    async fn embed_and_store(
        &self,
        table: &str,
        id: &str,
        property: &str,
        text: &str,
    ) -> Result<UsageTotals, GraphRagError> {
        let (vector, usage) = self.services.embedder().embed(text).await?;
        self.usage.record_embedding(usage).await;
        self.node_manager.set_embedding(table, id, property, vector).await?;
        Ok(usage)
    }

    /// Embeds a batch of edge fact sentences in one provider call and
    /// stores each vector on its edge.
    async fn embed_facts(&self, table: &str, facts: &[(String, String)]) -> Result<UsageTotals, GraphRagError> {
        if facts.is_empty() {
            return Ok(UsageTotals::default());
        }

        let inputs: Vec<String> = facts.iter().map(|(_, fact)| fact.clone()).collect();
        let (vectors, usage) = self.services.embedder().embed_batch(&inputs).await?;
        self.usage.record_embedding(usage).await;

        for ((edge_uuid, _), vector) in facts.iter().zip(vectors) {
            self.node_manager.set_embedding(table, edge_uuid, "fact_embedding", vector).await?;
        }
        Ok(usage)
    }

    /// Retries a store operation on transient conflicts (transaction
    /// read/write conflicts, connection hiccups) with exponential backoff.
    /// Permanent errors return immediately.
    async fn with_retry<F, Fut, T>(&self, op: F) -> Result<T, GraphRagError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, GraphRagError>>,
    {
        let strategy = ExponentialBackoff::from_millis(self.tuning.graph_initial_backoff_ms.max(1))
            .max_delay(std::time::Duration::from_millis(self.tuning.graph_max_backoff_ms))
            .take(self.tuning.graph_store_attempts);

        RetryIf::spawn(strategy, op, GraphRagError::is_retryable).await
    }
}

struct ItemOutcome {
    uuid: String,
    chunk_content: Option<String>,
}
