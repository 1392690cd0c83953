use serde::{Deserialize, Serialize};
use serde_json::json;

use common::{error::GraphRagError, usage::UsageTotals, utils::llm::LlmAgent};

/// An already-resolved node mentioned in the chunk, handed to the
/// relationship extractor as the closed set of valid endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedEntityInfo {
    pub uuid: String,
    pub name: String,
    pub label: String,
}

/// A typed fact between two resolved entities, evidenced by one sentence of
/// the chunk.
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractedRelationship {
    pub source_entity_name: String,
    pub target_entity_name: String,
    pub relation_label: String,
    pub fact_sentence: String,
}

#[derive(Debug, Deserialize)]
struct RelationshipExtractionResult {
    relationships: Vec<ExtractedRelationship>,
}

pub const RELATIONSHIP_EXTRACTION_SYSTEM_PROMPT: &str = "\
You extract relationships between entities mentioned in a chunk of text.
Only relate entities from the provided list, referring to them by their exact given name; never invent new entities.
relation_label should be a short, general verb phrase in UPPER_SNAKE_CASE (e.g. WORKS_AT, LOCATED_IN, ATE).
fact_sentence must be the sentence from the chunk that supports the relationship.
Do not output relationships between an entity and itself, and skip relationships the text does not clearly state.";

fn relationship_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "relationships": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "source_entity_name": {"type": "string"},
                        "target_entity_name": {"type": "string"},
                        "relation_label": {"type": "string"},
                        "fact_sentence": {"type": "string"}
                    },
                    "required": ["source_entity_name", "target_entity_name", "relation_label", "fact_sentence"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["relationships"],
        "additionalProperties": false
    })
}

/// Extracts typed facts between the chunk's resolved entities. Endpoints
/// are referenced by name; the orchestrator maps them back to uuids and
/// drops anything naming an unknown entity.
pub async fn extract_relationships(
    agent: &LlmAgent,
    text: &str,
    entities: &[ResolvedEntityInfo],
) -> Result<(Vec<ExtractedRelationship>, UsageTotals), GraphRagError> {
    if entities.len() < 2 {
        return Ok((Vec::new(), UsageTotals::default()));
    }

    let user_prompt = format!(
        "Entities present in this chunk (use these exact names):\n{entities}\n\nCHUNK TEXT:\n{text}",
        entities = serde_json::to_string_pretty(entities)
            .map_err(|err| GraphRagError::Internal(err.to_string()))?,
    );

    let (result, usage): (RelationshipExtractionResult, UsageTotals) = agent
        .generate_typed(
            RELATIONSHIP_EXTRACTION_SYSTEM_PROMPT,
            &user_prompt,
            "relationship_extraction",
            relationship_schema(),
        )
        .await?;

    Ok((result.relationships, usage))
}
