use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use common::{
    error::GraphRagError,
    storage::{
        db::SurrealDbClient,
        types::{entity::Entity, product::Product, relationship::Mentions, StoredObject},
    },
    usage::UsageTotals,
};

use crate::{
    documents::ProductAttributes,
    extraction::ExtractedEntity,
    services::PipelineServices,
};

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.85;
pub const DEFAULT_TOP_K_CANDIDATES: usize = 5;

/// How many previously recorded mention sentences each candidate carries
/// into the dedup prompt.
const CANDIDATE_FACTS_LIMIT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CandidateNodeType {
    Entity,
    Product,
}

/// An existing node close enough to the extracted mention to be worth a
/// model judgement.
#[derive(Debug, Clone, Serialize)]
pub struct DuplicateCandidate {
    pub uuid: String,
    pub name: String,
    pub label: String,
    pub node_type: CandidateNodeType,
    pub score: f32,
    pub existing_mention_facts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DuplicateDecision {
    pub is_duplicate: bool,
    pub duplicate_of_uuid: Option<String>,
    pub canonical_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProductMatchDecision {
    pub is_strong_match: bool,
    pub matched_entity_uuid: Option<String>,
}

/// Outcome of resolving one extracted mention against the graph.
#[derive(Debug, Clone)]
pub enum ResolutionOutcome {
    New { canonical_name: String },
    DuplicateOfEntity { uuid: String, canonical_name: String },
    DuplicateOfProduct { uuid: String },
}

/// What resolving a mention cost, split the way the public API reports it.
#[derive(Debug, Default, Clone, Copy)]
pub struct ResolutionUsage {
    pub generative: UsageTotals,
    pub embedding: UsageTotals,
}

pub const ENTITY_DEDUPLICATION_SYSTEM_PROMPT: &str = "\
You decide whether a newly mentioned entity refers to the same real-world thing as one of a list of \
existing candidate nodes from a knowledge graph. Judge by identity, not surface similarity: two \
entities with similar names can be distinct, and two with different names can be the same. Use each \
candidate's label, node type, and recorded mention sentences to disambiguate. When you decide it is a \
duplicate, set duplicate_of_uuid to that candidate's uuid and canonical_name to the most complete \
surface form of the name seen anywhere. If uncertain, say it is not a duplicate.";

pub const PRODUCT_ENTITY_MATCH_SYSTEM_PROMPT: &str = "\
You decide whether an existing knowledge-graph entity refers to the same real-world product as a new \
structured product record. Only answer with a strong match when the entity clearly denotes this exact \
product; a brand, a product family, or a similar but distinct model is not a match. If uncertain, say \
it is not a strong match.";

fn dedup_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "is_duplicate": {"type": "boolean"},
            "duplicate_of_uuid": {"type": ["string", "null"]},
            "canonical_name": {"type": ["string", "null"]}
        },
        "required": ["is_duplicate", "duplicate_of_uuid", "canonical_name"],
        "additionalProperties": false
    })
}

fn product_match_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "is_strong_match": {"type": "boolean"},
            "matched_entity_uuid": {"type": ["string", "null"]}
        },
        "required": ["is_strong_match", "matched_entity_uuid"],
        "additionalProperties": false
    })
}

pub fn dedup_decision_schema() -> (&'static str, serde_json::Value) {
    ("entity_deduplication_decision", dedup_schema())
}

pub fn product_match_decision_schema() -> (&'static str, serde_json::Value) {
    ("product_entity_match_decision", product_match_schema())
}

pub fn dedup_user_prompt(candidate: &ExtractedEntity, existing: &[DuplicateCandidate]) -> String {
    format!(
        "NEW MENTION:\n{mention}\n\nEXISTING CANDIDATES (ordered by similarity):\n{candidates}",
        mention = json!({
            "name": candidate.name,
            "label": candidate.label,
            "fact_sentence_about_mention": candidate.fact_sentence_about_mention,
        }),
        candidates = serde_json::to_string_pretty(existing).unwrap_or_else(|_| "[]".to_string()),
    )
}

pub fn product_match_user_prompt(
    product_name: &str,
    product_description: Option<&str>,
    attributes: &ProductAttributes,
    candidate: &DuplicateCandidate,
) -> String {
    format!(
        "NEW PRODUCT:\n{product}\n\nEXISTING ENTITY CANDIDATE:\n{candidate}\n\n\
         Contextual statements for this entity are recorded on its mention relationships and listed above.",
        product = json!({
            "name": product_name,
            "description": product_description,
            "key_attributes": attributes,
        }),
        candidate = serde_json::to_string_pretty(candidate).unwrap_or_else(|_| "{}".to_string()),
    )
}

/// Resolves extracted mentions against the existing graph: nearest-name
/// lookup across entities and products, then a model judgement over the
/// shortlist. Any model failure falls back to "new", since a missed merge
/// is recoverable and a wrongful merge is not.
pub struct EntityResolver {
    db: Arc<SurrealDbClient>,
    similarity_threshold: f32,
    top_k_candidates: usize,
}

impl EntityResolver {
    pub fn new(db: Arc<SurrealDbClient>, similarity_threshold: f32, top_k_candidates: usize) -> Self {
        Self { db, similarity_threshold, top_k_candidates }
    }

    /// Entity nodes whose names embed close to the candidate's, each
    /// carrying its recorded mention sentences.
    async fn entity_candidates(&self, name_embedding: Vec<f32>) -> Result<Vec<DuplicateCandidate>, GraphRagError> {
        let results = Entity::vector_search_by_name(
            self.top_k_candidates,
            name_embedding,
            self.similarity_threshold,
            &self.db,
        )
        .await?;

        let mut candidates = Vec::with_capacity(results.len());
        for result in results {
            candidates.push(DuplicateCandidate {
                existing_mention_facts: Mentions::facts_for_target(
                    Entity::table_name(),
                    &result.entity.id,
                    CANDIDATE_FACTS_LIMIT,
                    &self.db,
                )
                .await?,
                uuid: result.entity.id,
                name: result.entity.name,
                label: result.entity.label,
                node_type: CandidateNodeType::Entity,
                score: result.score,
            });
        }
        Ok(candidates)
    }

    async fn product_candidates(&self, name_embedding: Vec<f32>) -> Result<Vec<DuplicateCandidate>, GraphRagError> {
        let results = Product::vector_search_by_name(
            self.top_k_candidates,
            name_embedding,
            self.similarity_threshold,
            &self.db,
        )
        .await?;

        let mut candidates = Vec::with_capacity(results.len());
        for result in results {
            candidates.push(DuplicateCandidate {
                existing_mention_facts: Mentions::facts_for_target(
                    Product::table_name(),
                    &result.product.id,
                    CANDIDATE_FACTS_LIMIT,
                    &self.db,
                )
                .await?,
                uuid: result.product.id,
                name: result.product.name,
                label: result.product.category.unwrap_or_else(|| "Product".to_string()),
                node_type: CandidateNodeType::Product,
                score: result.score,
            });
        }
        Ok(candidates)
    }

    /// Shortlists existing entities and products whose names embed close to
    /// `name`, merged, deduplicated by uuid, and capped at `top_k`.
    async fn find_similar_candidates(
        &self,
        name_embedding: Vec<f32>,
    ) -> Result<Vec<DuplicateCandidate>, GraphRagError> {
        let mut combined = self.entity_candidates(name_embedding.clone()).await?;
        combined.extend(self.product_candidates(name_embedding).await?);

        combined.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        let mut seen: Vec<String> = Vec::new();
        let mut unique: Vec<DuplicateCandidate> = Vec::new();
        for candidate in combined {
            if seen.contains(&candidate.uuid) {
                continue;
            }
            seen.push(candidate.uuid.clone());
            unique.push(candidate);
            if unique.len() >= self.top_k_candidates {
                break;
            }
        }
        Ok(unique)
    }

    /// Resolves one extracted entity. Returns the outcome, the embedding of
    /// the candidate's name (reusable when the caller creates a new node),
    /// and the usage spent.
    #[instrument(skip_all, fields(entity_name = %candidate.name, label = %candidate.label))]
    pub async fn resolve(
        &self,
        candidate: &ExtractedEntity,
        services: &dyn PipelineServices,
    ) -> Result<(ResolutionOutcome, Vec<f32>, ResolutionUsage), GraphRagError> {
        let mut usage = ResolutionUsage::default();
        let (name_embedding, embed_usage) = services.embedder().embed(&candidate.name).await?;
        usage.embedding += embed_usage;

        let candidates = self.find_similar_candidates(name_embedding.clone()).await?;
        if candidates.is_empty() {
            debug!("no similar candidates, treating as new");
            return Ok((
                ResolutionOutcome::New { canonical_name: candidate.name.clone() },
                name_embedding,
                usage,
            ));
        }

        match services.judge_duplicate(candidate, &candidates).await {
            Ok((decision, gen_usage)) => {
                usage.generative += gen_usage;
                let outcome = match decision {
                    DuplicateDecision { is_duplicate: true, duplicate_of_uuid: Some(uuid), canonical_name } => {
                        match candidates.iter().find(|c| c.uuid == uuid) {
                            Some(matched) if matched.node_type == CandidateNodeType::Product => {
                                ResolutionOutcome::DuplicateOfProduct { uuid }
                            }
                            Some(_) => ResolutionOutcome::DuplicateOfEntity {
                                uuid,
                                canonical_name: canonical_name.unwrap_or_else(|| candidate.name.clone()),
                            },
                            None => {
                                warn!(uuid = %uuid, "decision pointed outside the candidate list, treating as new");
                                ResolutionOutcome::New { canonical_name: candidate.name.clone() }
                            }
                        }
                    }
                    _ => ResolutionOutcome::New {
                        canonical_name: candidate.name.clone(),
                    },
                };
                Ok((outcome, name_embedding, usage))
            }
            Err(err) => {
                warn!(error = %err, "deduplication call failed, treating mention as new");
                Ok((
                    ResolutionOutcome::New { canonical_name: candidate.name.clone() },
                    name_embedding,
                    usage,
                ))
            }
        }
    }

    /// Checks whether an existing entity is the same real-world thing as a
    /// new product record. A strong match returns the entity's uuid for
    /// promotion; anything else returns `None`.
    #[instrument(skip_all, fields(product_name = product_name))]
    pub async fn find_entity_for_product_promotion(
        &self,
        product_name: &str,
        product_description: Option<&str>,
        attributes: &ProductAttributes,
        services: &dyn PipelineServices,
    ) -> Result<(Option<String>, ResolutionUsage), GraphRagError> {
        let mut usage = ResolutionUsage::default();
        let (name_embedding, embed_usage) = services.embedder().embed(product_name).await?;
        usage.embedding += embed_usage;

        // Promotion only ever replaces an Entity; the lookup is restricted
        // to entity nodes.
        let candidates = self.entity_candidates(name_embedding).await?;
        let Some(top_entity) = candidates.into_iter().next() else {
            debug!("no entity candidates for promotion");
            return Ok((None, usage));
        };

        match services
            .judge_product_match(product_name, product_description, attributes, &top_entity)
            .await
        {
            Ok((decision, gen_usage)) => {
                usage.generative += gen_usage;
                if decision.is_strong_match && decision.matched_entity_uuid.as_deref() == Some(top_entity.uuid.as_str()) {
                    Ok((Some(top_entity.uuid), usage))
                } else {
                    Ok((None, usage))
                }
            }
            Err(err) => {
                warn!(error = %err, "product match call failed, treating as no match");
                Ok((None, usage))
            }
        }
    }
}
